//! Per-connection authenticated session state.
//!
//! A [`Session`] exists once the peer's HELLO has been accepted. It tracks:
//! - MAC keys for message authentication
//! - Sequence numbers for replay protection
//! - What the peer told us about itself

use crate::error::Error;
use crate::message::{self, RawMessage};
use std::net::SocketAddr;
use stellar_xdr::curr::{HmacSha256Key, NodeId, PublicKey, StellarMessage};
use zeroize::Zeroize;

/// Identity and versions of an authenticated peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerInfo {
    pub node_id: NodeId,
    pub address: SocketAddr,
    pub ledger_version: u32,
    pub overlay_version: u32,
    pub overlay_min_version: u32,
    pub version_str: String,
    pub listening_port: u16,
}

impl PeerInfo {
    /// Raw Ed25519 public key of the peer.
    pub fn public_key_bytes(&self) -> [u8; 32] {
        match &self.node_id.0 {
            PublicKey::PublicKeyTypeEd25519(key) => key.0,
        }
    }

    /// The peer's `G...` strkey.
    pub fn strkey(&self) -> String {
        stellar_strkey::ed25519::PublicKey(self.public_key_bytes()).to_string()
    }
}

/// MAC keys for one connection, wiped when the session ends.
pub(crate) struct MacKeys {
    pub sending: HmacSha256Key,
    pub receiving: HmacSha256Key,
}

impl Drop for MacKeys {
    fn drop(&mut self) {
        self.sending.key.zeroize();
        self.receiving.key.zeroize();
    }
}

pub(crate) struct Session {
    pub peer: PeerInfo,
    keys: MacKeys,
    /// Sequence number for outgoing messages.
    local_sequence: u64,
    /// Expected sequence number for incoming messages.
    remote_sequence: u64,
}

impl Session {
    pub fn new(peer: PeerInfo, keys: MacKeys) -> Self {
        Self {
            peer,
            keys,
            local_sequence: 0,
            remote_sequence: 0,
        }
    }

    /// Build an authenticated envelope for `message`, consuming a sequence number.
    pub fn authenticate(&mut self, message: &StellarMessage) -> Result<Vec<u8>, message::Error> {
        let body = message::encode(self.local_sequence, message, Some(&self.keys.sending))?;
        self.local_sequence += 1;
        Ok(body)
    }

    /// Check the sequence and MAC of a received envelope.
    pub fn verify(&mut self, raw: &RawMessage) -> Result<(), Error> {
        if raw.sequence() != self.remote_sequence {
            return Err(Error::UnexpectedSequence {
                expected: self.remote_sequence,
                got: raw.sequence(),
            });
        }
        if !raw.verify_mac(&self.keys.receiving) {
            return Err(Error::MacVerificationFailed);
        }
        self.remote_sequence += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use stellar_xdr::curr::{SendMore, Uint256};

    fn peer() -> PeerInfo {
        PeerInfo {
            node_id: NodeId(PublicKey::PublicKeyTypeEd25519(Uint256([1u8; 32]))),
            address: "127.0.0.1:11625".parse().unwrap(),
            ledger_version: 25,
            overlay_version: 38,
            overlay_min_version: 35,
            version_str: "test".to_string(),
            listening_port: 11625,
        }
    }

    fn pair() -> (Session, Session) {
        let a_to_b = [1u8; 32];
        let b_to_a = [2u8; 32];
        let a = Session::new(
            peer(),
            MacKeys {
                sending: HmacSha256Key { key: a_to_b },
                receiving: HmacSha256Key { key: b_to_a },
            },
        );
        let b = Session::new(
            peer(),
            MacKeys {
                sending: HmacSha256Key { key: b_to_a },
                receiving: HmacSha256Key { key: a_to_b },
            },
        );
        (a, b)
    }

    fn message() -> StellarMessage {
        StellarMessage::SendMore(SendMore { num_messages: 1 })
    }

    #[test]
    fn test_sequence_advances() {
        let (mut a, mut b) = pair();
        for expected in 0..5u64 {
            let body = a.authenticate(&message()).unwrap();
            let raw = RawMessage::parse(Bytes::from(body)).unwrap();
            assert_eq!(raw.sequence(), expected);
            b.verify(&raw).unwrap();
        }
    }

    #[test]
    fn test_replay_is_rejected() {
        let (mut a, mut b) = pair();
        let raw = RawMessage::parse(Bytes::from(a.authenticate(&message()).unwrap())).unwrap();
        b.verify(&raw).unwrap();
        assert!(matches!(
            b.verify(&raw),
            Err(Error::UnexpectedSequence {
                expected: 1,
                got: 0
            })
        ));
    }

    #[test]
    fn test_reflected_message_is_rejected() {
        let (mut a, mut b) = pair();
        let raw = RawMessage::parse(Bytes::from(a.authenticate(&message()).unwrap())).unwrap();
        assert!(matches!(a.verify(&raw), Err(Error::MacVerificationFailed)));
        assert!(b.verify(&raw).is_ok());
    }

    #[test]
    fn test_peer_strkey() {
        assert!(peer().strkey().starts_with('G'));
        assert_eq!(peer().public_key_bytes(), [1u8; 32]);
    }
}
