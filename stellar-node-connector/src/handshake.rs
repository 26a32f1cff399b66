//! Peer handshake for the Stellar overlay protocol.
//!
//! The handshake consists of:
//! 1. Exchange HELLO messages (sequence 0, zero MAC)
//! 2. Derive MAC keys from ECDH
//! 3. Exchange AUTH messages (the first authenticated messages)
//!
//! The caller sends HELLO as soon as the socket is up. The called side
//! answers HELLO with HELLO and AUTH with AUTH. Each side completes when it
//! has received the peer's AUTH.

use crate::auth::{self, ConnectionAuthentication};
use crate::config::{self, Config};
use crate::error::Error;
use crate::session::PeerInfo;
use std::fmt;
use std::net::SocketAddr;
use stellar_xdr::curr::{Hello, SError, StellarMessage, StringM, Uint256};

/// Stage of the handshake, as observed from outside the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    /// Socket not yet usable.
    Connecting,
    /// Socket up, HELLO not yet received.
    Connected,
    /// Peer's HELLO accepted, waiting for AUTH.
    GotHello,
    /// AUTH exchanged, application messages flow.
    Completed,
    /// Terminal.
    Closed,
}

impl HandshakeState {
    pub fn is_completed(&self) -> bool {
        matches!(self, HandshakeState::Completed)
    }
}

impl fmt::Display for HandshakeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandshakeState::Connecting => write!(f, "connecting"),
            HandshakeState::Connected => write!(f, "connected"),
            HandshakeState::GotHello => write!(f, "got_hello"),
            HandshakeState::Completed => write!(f, "completed"),
            HandshakeState::Closed => write!(f, "closed"),
        }
    }
}

/// Build our HELLO.
pub(crate) fn build_hello(
    config: &Config,
    authentication: &ConnectionAuthentication,
    local_nonce: &[u8; 32],
) -> Result<StellarMessage, Error> {
    let now = auth::unix_time()?;
    let version_str: StringM<100> = config
        .version_str
        .as_str()
        .try_into()
        .map_err(|_| config::Error::VersionStrTooLong(config.version_str.len()))?;
    Ok(StellarMessage::Hello(Hello {
        ledger_version: config.ledger_version,
        overlay_version: config.overlay_version,
        overlay_min_version: config.overlay_min_version,
        network_id: authentication.network_id().clone(),
        version_str,
        listening_port: config.listening_port,
        peer_id: authentication.identity().node_id(),
        cert: authentication.auth_cert(now)?,
        nonce: Uint256(*local_nonce),
    }))
}

/// Accept or reject a peer's HELLO.
pub(crate) fn validate_hello(
    config: &Config,
    authentication: &ConnectionAuthentication,
    hello: &Hello,
    address: SocketAddr,
) -> Result<PeerInfo, Error> {
    if hello.network_id != *authentication.network_id() {
        return Err(Error::NetworkIdMismatch);
    }

    if hello.overlay_version < config.overlay_min_version
        || hello.overlay_min_version > config.overlay_version
    {
        return Err(Error::UnsupportedOverlayVersion {
            version: hello.overlay_version,
            min: hello.overlay_min_version,
        });
    }

    let peer = PeerInfo {
        node_id: hello.peer_id.clone(),
        address,
        ledger_version: hello.ledger_version,
        overlay_version: hello.overlay_version,
        overlay_min_version: hello.overlay_min_version,
        version_str: String::from_utf8_lossy(&hello.version_str.to_vec()).to_string(),
        listening_port: u16::try_from(hello.listening_port)
            .ok()
            .filter(|port| *port != 0)
            .ok_or_else(|| {
                Error::ProtocolViolation(format!(
                    "invalid listening port {}",
                    hello.listening_port
                ))
            })?,
    };

    let remote_key = peer.public_key_bytes();
    if remote_key == authentication.identity().public_key_bytes() {
        return Err(Error::ConnectedToSelf);
    }

    let now = auth::unix_time()?;
    if !authentication.verify_remote_auth_cert(now, &remote_key, &hello.cert) {
        return Err(Error::InvalidAuthCert);
    }

    Ok(peer)
}

/// Build the ERROR_MSG sent before dropping a peer.
pub(crate) fn error_message(error: &Error) -> Option<StellarMessage> {
    let code = error.error_code()?;
    let mut text = error.to_string();
    if text.len() > 100 {
        let mut end = 100;
        while !text.is_char_boundary(end) {
            end -= 1;
        }
        text.truncate(end);
    }
    Some(StellarMessage::ErrorMsg(SError {
        code,
        msg: text.try_into().unwrap_or_default(),
    }))
}

/// Convert a received ERROR_MSG into an error.
pub(crate) fn peer_error(error: &SError) -> Error {
    Error::PeerError {
        code: error.code,
        message: String::from_utf8_lossy(&error.msg.to_vec()).to_string(),
    }
}

/// Log a protocol message with the fields the CLI formatter understands.
pub(crate) fn log_message(peer: SocketAddr, direction: &'static str, message: &StellarMessage) {
    match message {
        StellarMessage::Hello(h) => tracing::debug!(
            %peer,
            direction,
            ledger_version = h.ledger_version,
            overlay_version = h.overlay_version,
            version_str = &*String::from_utf8_lossy(&h.version_str.to_vec()),
            "Hello"
        ),
        StellarMessage::Auth(a) => tracing::debug!(%peer, direction, flags = a.flags, "Auth"),
        StellarMessage::SendMore(s) => tracing::debug!(
            %peer,
            direction,
            num_messages = s.num_messages,
            "SendMore"
        ),
        StellarMessage::SendMoreExtended(s) => tracing::debug!(
            %peer,
            direction,
            num_messages = s.num_messages,
            num_bytes = s.num_bytes,
            "SendMoreExtended"
        ),
        StellarMessage::ErrorMsg(e) => tracing::debug!(
            %peer,
            direction,
            code = ?e.code,
            error_message = &*String::from_utf8_lossy(&e.msg.to_vec()),
            "ErrorMsg"
        ),
        other => tracing::trace!(%peer, direction, "{}", other.name()),
    }
}
