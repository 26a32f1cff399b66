//! Authenticated message envelope.
//!
//! Every overlay message travels as an XDR `AuthenticatedMessage` (v0):
//!
//! ```text
//! version: u32 (0) || sequence: u64 || messageType: i32 || payload || mac: 32 bytes
//! ```
//!
//! [`RawMessage`] reads the fixed header fields straight out of the frame so
//! the sequence and MAC can be checked before the payload is decoded.

use crate::crypto;
use bytes::Bytes;
use stellar_xdr::curr::{HmacSha256Key, Limits, MessageType, ReadXdr, StellarMessage, WriteXdr};

const VERSION_SIZE: usize = 4;
const SEQUENCE_SIZE: usize = 8;
const MESSAGE_TYPE_SIZE: usize = 4;
const MAC_SIZE: usize = 32;

/// Smallest well-formed envelope: header, message type and MAC.
pub const MIN_MESSAGE_SIZE: usize = VERSION_SIZE + SEQUENCE_SIZE + MESSAGE_TYPE_SIZE + MAC_SIZE;

const SEQUENCE_OFFSET: usize = VERSION_SIZE;
const MESSAGE_OFFSET: usize = VERSION_SIZE + SEQUENCE_SIZE;

/// Errors that can occur while parsing or building envelopes.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Envelope is shorter than the fixed header.
    #[error("message too short: {size} bytes (min: {MIN_MESSAGE_SIZE})")]
    TooShort { size: usize },

    /// Envelope version other than v0.
    #[error("unsupported authenticated message version {0}")]
    UnsupportedVersion(u32),

    /// Message type discriminant is not a known `MessageType`.
    #[error("unknown message type {0}")]
    UnknownMessageType(i32),

    /// Failed to deserialize the XDR payload.
    #[error("failed to deserialize XDR message")]
    XdrDeserialize(#[source] stellar_xdr::curr::Error),

    /// Failed to serialize the XDR payload.
    #[error("failed to serialize XDR message")]
    XdrSerialize(#[source] stellar_xdr::curr::Error),
}

/// A received envelope whose header has been validated but whose payload
/// has not been decoded.
#[derive(Debug, Clone)]
pub struct RawMessage {
    bytes: Bytes,
    sequence: u64,
    message_type: MessageType,
}

impl RawMessage {
    /// Validate the envelope header of a frame body.
    pub fn parse(bytes: Bytes) -> Result<Self, Error> {
        if bytes.len() < MIN_MESSAGE_SIZE {
            return Err(Error::TooShort { size: bytes.len() });
        }

        let version = u32::from_be_bytes(read_array(&bytes, 0));
        if version != 0 {
            return Err(Error::UnsupportedVersion(version));
        }

        let sequence = u64::from_be_bytes(read_array(&bytes, SEQUENCE_OFFSET));
        let discriminant = i32::from_be_bytes(read_array(&bytes, MESSAGE_OFFSET));
        let message_type = MessageType::try_from(discriminant)
            .map_err(|_| Error::UnknownMessageType(discriminant))?;

        Ok(Self {
            bytes,
            sequence,
            message_type,
        })
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn message_type(&self) -> MessageType {
        self.message_type
    }

    pub fn mac(&self) -> &[u8] {
        &self.bytes[self.bytes.len() - MAC_SIZE..]
    }

    /// The bytes covered by the MAC: sequence and `StellarMessage`.
    pub fn authenticated_bytes(&self) -> &[u8] {
        &self.bytes[SEQUENCE_OFFSET..self.bytes.len() - MAC_SIZE]
    }

    /// The XDR encoding of the `StellarMessage`.
    pub fn message_bytes(&self) -> &[u8] {
        &self.bytes[MESSAGE_OFFSET..self.bytes.len() - MAC_SIZE]
    }

    /// Size of the `StellarMessage`, as counted by flow control.
    pub fn payload_size(&self) -> usize {
        self.message_bytes().len()
    }

    /// Check the MAC in constant time.
    pub fn verify_mac(&self, key: &HmacSha256Key) -> bool {
        let expected = crypto::hmac_sha256(&key.key, self.authenticated_bytes());
        crypto::mac_eq(&expected, self.mac())
    }

    /// Decode the full `StellarMessage`.
    pub fn decode(&self) -> Result<StellarMessage, Error> {
        StellarMessage::from_xdr(self.message_bytes(), Limits::none())
            .map_err(Error::XdrDeserialize)
    }
}

fn read_array<const N: usize>(bytes: &[u8], offset: usize) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(&bytes[offset..offset + N]);
    out
}

/// Build an envelope body for `message`.
///
/// The MAC is `HMAC-SHA256(key, sequence || message)`, or all zeros when no
/// key is given (HELLO and ERROR_MSG).
pub fn encode(
    sequence: u64,
    message: &StellarMessage,
    mac_key: Option<&HmacSha256Key>,
) -> Result<Vec<u8>, Error> {
    let payload = message
        .to_xdr(Limits::none())
        .map_err(Error::XdrSerialize)?;

    let mut body = Vec::with_capacity(MIN_MESSAGE_SIZE - MESSAGE_TYPE_SIZE + payload.len());
    body.extend_from_slice(&0u32.to_be_bytes());
    body.extend_from_slice(&sequence.to_be_bytes());
    body.extend_from_slice(&payload);

    let mac = match mac_key {
        Some(key) => crypto::hmac_sha256(&key.key, &body[SEQUENCE_OFFSET..]),
        None => [0u8; MAC_SIZE],
    };
    body.extend_from_slice(&mac);
    Ok(body)
}
