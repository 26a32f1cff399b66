//! XDR message framing for the Stellar overlay protocol.
//!
//! Messages are framed with a 4-byte big-endian length prefix (the XDR record
//! mark). The MSB is the continuation bit: it is masked off on read and always
//! written as 0. Records split across several fragments are not supported.

use bytes::{BufMut, Bytes, BytesMut};

/// Size of the length prefix.
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Maximum message size once authenticated (16 MB as per stellar-core).
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Maximum message size before the handshake completes.
pub const MAX_UNAUTH_MESSAGE_SIZE: usize = 256 * 1024;

const CONTINUATION_BIT_MASK: u32 = 0x7FFF_FFFF;

/// Errors that can occur during message framing.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Message size is invalid (zero or exceeds maximum).
    #[error("invalid message size: {size} bytes (max: {max})")]
    InvalidMessageSize { size: usize, max: usize },

    /// Message is too large to send.
    #[error("message too large: {size} bytes")]
    MessageTooLarge { size: usize },
}

/// Parse a length prefix, clearing the continuation bit.
pub fn parse_length(header: [u8; LENGTH_PREFIX_SIZE]) -> usize {
    (u32::from_be_bytes(header) & CONTINUATION_BIT_MASK) as usize
}

/// Reject zero-length and oversize frames.
pub fn check_length(length: usize, max: usize) -> Result<(), Error> {
    if length == 0 || length > max {
        return Err(Error::InvalidMessageSize { size: length, max });
    }
    Ok(())
}

/// Whether `buffer` holds at least one body of `length` bytes.
pub fn has_complete_frame(buffer: &[u8], length: usize) -> bool {
    buffer.len() >= length
}

/// Take the 4-byte length prefix off the front of `buffer`, if present.
pub fn split_length(buffer: &mut BytesMut) -> Option<usize> {
    if buffer.len() < LENGTH_PREFIX_SIZE {
        return None;
    }
    let header = buffer.split_to(LENGTH_PREFIX_SIZE);
    let mut prefix = [0u8; LENGTH_PREFIX_SIZE];
    prefix.copy_from_slice(&header);
    Some(parse_length(prefix))
}

/// Take a body of `length` bytes off the front of `buffer`.
///
/// Returns `None` when the body has not fully arrived yet; the buffer is left
/// untouched in that case.
pub fn split_frame(buffer: &mut BytesMut, length: usize) -> Option<Bytes> {
    if !has_complete_frame(buffer, length) {
        return None;
    }
    Some(buffer.split_to(length).freeze())
}

/// Prefix `body` with its length.
pub fn encode_frame(body: &[u8]) -> Result<Bytes, Error> {
    if body.len() > MAX_MESSAGE_SIZE {
        return Err(Error::MessageTooLarge { size: body.len() });
    }
    let mut frame = BytesMut::with_capacity(LENGTH_PREFIX_SIZE + body.len());
    frame.put_u32(body.len() as u32);
    frame.put_slice(body);
    Ok(frame.freeze())
}
