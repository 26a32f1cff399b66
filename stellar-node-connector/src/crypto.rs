//! Cryptographic primitives for the Stellar overlay protocol.
//!
//! This module provides:
//! - Ed25519 node identity (signing and verification)
//! - Curve25519 keypairs for ECDH key exchange
//! - HKDF extract/expand built on HMAC-SHA256
//! - SHA-256 hashing and constant-time MAC comparison

use ed25519_dalek::{Signer, SigningKey, Verifier, VerifyingKey};
use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use stellar_xdr::curr::{Curve25519Public, Hash, NodeId, PublicKey, Uint256};
use subtle::ConstantTimeEq;
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret as X25519SecretKey};

type HmacSha256 = Hmac<Sha256>;

/// Errors produced while loading key material.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The secret seed is not a valid `S...` strkey.
    #[error("invalid secret seed")]
    InvalidSecretSeed,
}

/// Long-term node identity using an Ed25519 keypair.
pub struct NodeIdentity {
    signing_key: SigningKey,
}

impl NodeIdentity {
    /// Generate a new random Ed25519 keypair.
    pub fn generate() -> Self {
        Self {
            signing_key: SigningKey::generate(&mut OsRng),
        }
    }

    /// Load an identity from a Stellar secret seed (`S...`).
    pub fn from_secret_seed(seed: &str) -> Result<Self, Error> {
        let key = stellar_strkey::ed25519::PrivateKey::from_string(seed.trim())
            .map_err(|_| Error::InvalidSecretSeed)?;
        Ok(Self {
            signing_key: SigningKey::from_bytes(&key.0),
        })
    }

    /// Raw Ed25519 public key bytes.
    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.signing_key.verifying_key().to_bytes()
    }

    /// The node's public key in Stellar XDR format.
    pub fn node_id(&self) -> NodeId {
        NodeId(PublicKey::PublicKeyTypeEd25519(Uint256(
            self.public_key_bytes(),
        )))
    }

    /// The node's public key as a `G...` strkey.
    pub fn address(&self) -> String {
        stellar_strkey::ed25519::PublicKey(self.public_key_bytes()).to_string()
    }

    /// Sign a message with the node's Ed25519 key.
    pub fn sign(&self, message: &[u8]) -> [u8; 64] {
        self.signing_key.sign(message).to_bytes()
    }
}

impl std::fmt::Debug for NodeIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeIdentity")
            .field("address", &self.address())
            .finish_non_exhaustive()
    }
}

/// Verify an Ed25519 signature. Malformed keys or signatures verify as false.
pub fn verify_signature(public_key: &[u8; 32], message: &[u8], signature: &[u8]) -> bool {
    let Ok(key) = VerifyingKey::from_bytes(public_key) else {
        return false;
    };
    let Ok(signature) = ed25519_dalek::Signature::from_slice(signature) else {
        return false;
    };
    key.verify(message, &signature).is_ok()
}

/// Curve25519 keypair for ECDH key exchange.
pub struct EcdhKeypair {
    secret: X25519SecretKey,
    public: X25519PublicKey,
}

impl EcdhKeypair {
    /// Generate a new random Curve25519 keypair.
    pub fn generate() -> Self {
        let secret = X25519SecretKey::random_from_rng(OsRng);
        let public = X25519PublicKey::from(&secret);
        Self { secret, public }
    }

    /// Raw public key bytes.
    pub fn public_bytes(&self) -> [u8; 32] {
        self.public.to_bytes()
    }

    /// The public key in Stellar XDR format.
    pub fn to_curve25519_public(&self) -> Curve25519Public {
        Curve25519Public {
            key: self.public.to_bytes(),
        }
    }

    /// X25519 scalar multiplication of our secret with the remote public key.
    pub fn diffie_hellman(&self, remote_public: &[u8; 32]) -> [u8; 32] {
        let remote = X25519PublicKey::from(*remote_public);
        self.secret.diffie_hellman(&remote).to_bytes()
    }
}

/// Generate a random 256-bit nonce.
pub fn generate_nonce() -> [u8; 32] {
    let mut nonce = [0u8; 32];
    OsRng.fill_bytes(&mut nonce);
    nonce
}

/// Stellar-core's hkdfExtract: HMAC(zero_key, data)
pub fn hkdf_extract(data: &[u8]) -> [u8; 32] {
    hmac_sha256(&[0u8; 32], data)
}

/// Stellar-core's hkdfExpand: HMAC(key, info || 0x01)
pub fn hkdf_expand(key: &[u8; 32], info: &[u8]) -> [u8; 32] {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC key should be valid");
    mac.update(info);
    mac.update(&[1]);
    mac.finalize().into_bytes().into()
}

/// Compute HMAC-SHA256.
pub fn hmac_sha256(key: &[u8; 32], data: &[u8]) -> [u8; 32] {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC key should be valid");
    mac.update(data);
    mac.finalize().into_bytes().into()
}

/// Compare two MACs without leaking where they differ.
pub fn mac_eq(a: &[u8], b: &[u8]) -> bool {
    a.ct_eq(b).into()
}

/// SHA-256 hash function.
pub fn sha256(data: &[u8]) -> [u8; 32] {
    Sha256::digest(data).into()
}

/// Compute the Stellar network ID from a passphrase.
pub fn network_id(passphrase: &str) -> Hash {
    Hash(sha256(passphrase.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_network_id() {
        let id = network_id("Test SDF Network ; September 2015");
        assert_eq!(
            hex::encode(id.0),
            "cee0302d59844d32bdca915c8203dd44b33fbb7edc19051ea37abedf28ecd472"
        );
    }

    #[test]
    fn test_node_identity() {
        let identity = NodeIdentity::generate();
        match identity.node_id().0 {
            PublicKey::PublicKeyTypeEd25519(key) => {
                assert_eq!(key.0, identity.public_key_bytes());
            }
        }
        assert!(identity.address().starts_with('G'));
    }

    #[test]
    fn test_identity_from_secret_seed() {
        let seed = stellar_strkey::ed25519::PrivateKey([7u8; 32]).to_string();
        let a = NodeIdentity::from_secret_seed(&seed).unwrap();
        let b = NodeIdentity::from_secret_seed(&seed).unwrap();
        assert_eq!(a.public_key_bytes(), b.public_key_bytes());

        assert!(matches!(
            NodeIdentity::from_secret_seed("not-a-seed"),
            Err(Error::InvalidSecretSeed)
        ));
    }

    #[test]
    fn test_sign_and_verify() {
        let identity = NodeIdentity::generate();
        let sig = identity.sign(b"payload");
        assert!(verify_signature(&identity.public_key_bytes(), b"payload", &sig));
        assert!(!verify_signature(&identity.public_key_bytes(), b"other", &sig));
        assert!(!verify_signature(&identity.public_key_bytes(), b"payload", &sig[..63]));
    }

    #[test]
    fn test_ecdh_shared_secret() {
        let alice = EcdhKeypair::generate();
        let bob = EcdhKeypair::generate();
        assert_eq!(
            alice.diffie_hellman(&bob.public_bytes()),
            bob.diffie_hellman(&alice.public_bytes())
        );
    }

    #[test]
    fn test_hkdf_expand_appends_counter() {
        let key = [9u8; 32];
        assert_eq!(hkdf_expand(&key, b"info"), hmac_sha256(&key, b"info\x01"));
    }

    #[test]
    fn test_mac_eq() {
        assert!(mac_eq(&[1, 2, 3], &[1, 2, 3]));
        assert!(!mac_eq(&[1, 2, 3], &[1, 2, 4]));
        assert!(!mac_eq(&[1, 2, 3], &[1, 2]));
    }
}
