//! Connection error types.

use crate::{auth, config, crypto, framing, message};
use stellar_xdr::curr::ErrorCode;

/// Errors that can occur on a peer connection.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] config::Error),

    #[error(transparent)]
    Crypto(#[from] crypto::Error),

    #[error(transparent)]
    Auth(#[from] auth::Error),

    #[error(transparent)]
    Framing(#[from] framing::Error),

    #[error(transparent)]
    Message(#[from] message::Error),

    /// Peer sent something the current stage does not allow.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// Received message has unexpected sequence number.
    #[error("unexpected sequence number: expected {expected}, got {got}")]
    UnexpectedSequence { expected: u64, got: u64 },

    /// MAC verification failed on received message.
    #[error("MAC verification failed")]
    MacVerificationFailed,

    /// Peer's auth cert is expired or badly signed.
    #[error("invalid auth cert")]
    InvalidAuthCert,

    /// Network ID does not match expected value.
    #[error("network ID mismatch")]
    NetworkIdMismatch,

    /// Peer's overlay version range does not overlap ours.
    #[error("peer overlay versions {min}..={version} are not supported")]
    UnsupportedOverlayVersion { version: u32, min: u32 },

    /// Peer advertised our own node ID.
    #[error("connected to self")]
    ConnectedToSelf,

    /// Peer sent an error message.
    #[error("peer sent error: {code:?} - {message}")]
    PeerError { code: ErrorCode, message: String },

    #[error("I/O error")]
    Io(#[from] std::io::Error),

    #[error("timed out")]
    Timeout,

    #[error("connection closed")]
    Closed,
}

/// Broad classification of [`Error`]s.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Configuration,
    ProtocolViolation,
    AuthenticationFailure,
    TransientIo,
    PayloadDecoding,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Config(_) | Error::Crypto(_) | Error::Auth(_) => ErrorKind::Configuration,
            Error::Message(
                message::Error::UnknownMessageType(_)
                | message::Error::XdrDeserialize(_)
                | message::Error::XdrSerialize(_),
            ) => ErrorKind::PayloadDecoding,
            Error::Framing(_)
            | Error::Message(_)
            | Error::ProtocolViolation(_)
            | Error::NetworkIdMismatch
            | Error::UnsupportedOverlayVersion { .. }
            | Error::ConnectedToSelf
            | Error::PeerError { .. } => ErrorKind::ProtocolViolation,
            Error::UnexpectedSequence { .. }
            | Error::MacVerificationFailed
            | Error::InvalidAuthCert => ErrorKind::AuthenticationFailure,
            Error::Io(_) | Error::Timeout | Error::Closed => ErrorKind::TransientIo,
        }
    }

    /// The code to report to the peer before dropping it, if any.
    pub(crate) fn error_code(&self) -> Option<ErrorCode> {
        match self {
            Error::PeerError { .. } | Error::Io(_) | Error::Timeout | Error::Closed => None,
            _ => match self.kind() {
                ErrorKind::AuthenticationFailure => Some(ErrorCode::Auth),
                ErrorKind::PayloadDecoding => Some(ErrorCode::Data),
                ErrorKind::Configuration => Some(ErrorCode::Conf),
                ErrorKind::ProtocolViolation | ErrorKind::TransientIo => Some(ErrorCode::Misc),
            },
        }
    }
}
