//! Connection authentication for the Stellar overlay protocol.
//!
//! A single [`ConnectionAuthentication`] is shared by every connection of a
//! local node. It owns:
//! - the ephemeral Curve25519 keypair advertised in every HELLO
//! - the auth certificate binding that keypair to the node identity
//! - a cache of ECDH shared keys, keyed by remote key and direction
//!
//! Shared keys are derived as stellar-core does:
//!
//! ```text
//! K   = hkdfExtract(ecdh(local, remote) || publicA || publicB)
//! Kab = hkdfExpand(K, 0 || nonceA || nonceB)
//! Kba = hkdfExpand(K, 1 || nonceB || nonceA)
//! ```
//!
//! where A is the side that called the remote.

use crate::crypto::{self, EcdhKeypair, NodeIdentity};
use dashmap::DashMap;
use parking_lot::RwLock;
use std::time::{SystemTime, UNIX_EPOCH};
use stellar_xdr::curr::{AuthCert, Curve25519Public, EnvelopeType, Hash, HmacSha256Key, Signature};

/// Auth certificate lifetime (1 hour).
pub const AUTH_CERT_EXPIRATION_SECONDS: u64 = 3600;

/// Maximum number of cached shared keys before entries are evicted.
const MAX_SHARED_KEY_CACHE_SIZE: usize = 0xffff;

/// Errors that can occur while producing auth certificates.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// System time is before UNIX epoch.
    #[error("system time before UNIX epoch")]
    SystemTime,

    /// Failed to build the XDR signature.
    #[error("failed to encode auth cert signature")]
    Signature(#[source] stellar_xdr::curr::Error),
}

/// Current UNIX time in seconds.
pub fn unix_time() -> Result<u64, Error> {
    Ok(SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|_| Error::SystemTime)?
        .as_secs())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct SharedKeyId {
    remote_public_key: [u8; 32],
    we_called_remote: bool,
}

/// Key agreement authority for one local node.
pub struct ConnectionAuthentication {
    identity: NodeIdentity,
    network_id: Hash,
    ecdh: EcdhKeypair,
    auth_cert: RwLock<AuthCert>,
    shared_keys: DashMap<SharedKeyId, HmacSha256Key>,
    max_shared_keys: usize,
}

impl ConnectionAuthentication {
    /// Create the authentication state and sign an initial auth cert.
    pub fn new(identity: NodeIdentity, network_id: Hash) -> Result<Self, Error> {
        let ecdh = EcdhKeypair::generate();
        let now = unix_time()?;
        let auth_cert = sign_auth_cert(&identity, &network_id, &ecdh, now)?;
        Ok(Self {
            identity,
            network_id,
            ecdh,
            auth_cert: RwLock::new(auth_cert),
            shared_keys: DashMap::new(),
            max_shared_keys: MAX_SHARED_KEY_CACHE_SIZE,
        })
    }

    #[cfg(test)]
    fn with_max_shared_keys(mut self, max: usize) -> Self {
        self.max_shared_keys = max;
        self
    }

    /// The local node identity.
    pub fn identity(&self) -> &NodeIdentity {
        &self.identity
    }

    /// The network this node authenticates for.
    pub fn network_id(&self) -> &Hash {
        &self.network_id
    }

    /// The ephemeral ECDH public key advertised in auth certs.
    pub fn ecdh_public_key(&self) -> Curve25519Public {
        self.ecdh.to_curve25519_public()
    }

    /// Create a fresh auth certificate expiring one hour after `now`.
    pub fn create_auth_cert(&self, now: u64) -> Result<AuthCert, Error> {
        sign_auth_cert(&self.identity, &self.network_id, &self.ecdh, now)
    }

    /// The cached auth certificate, re-signed once less than half of its
    /// lifetime remains.
    pub fn auth_cert(&self, now: u64) -> Result<AuthCert, Error> {
        {
            let cert = self.auth_cert.read();
            if cert.expiration >= now + AUTH_CERT_EXPIRATION_SECONDS / 2 {
                return Ok(cert.clone());
            }
        }
        let cert = self.create_auth_cert(now)?;
        tracing::debug!(expiration = cert.expiration, "Refreshed auth cert");
        *self.auth_cert.write() = cert.clone();
        Ok(cert)
    }

    /// Verify a remote peer's auth certificate at time `now`.
    ///
    /// Fails if the certificate has expired or the signature does not verify
    /// against `remote_public_key` for this network.
    pub fn verify_remote_auth_cert(
        &self,
        now: u64,
        remote_public_key: &[u8; 32],
        cert: &AuthCert,
    ) -> bool {
        if cert.expiration <= now {
            return false;
        }
        let hash = auth_cert_hash(&self.network_id, cert.expiration, &cert.pubkey.key);
        crypto::verify_signature(remote_public_key, &hash, cert.sig.0.as_slice())
    }

    /// The shared key with a remote ECDH key for the given direction.
    ///
    /// Both peers derive the same key: the caller orders the public keys
    /// `local || remote`, the called side `remote || local`.
    pub fn shared_key(
        &self,
        remote_public_key: &Curve25519Public,
        we_called_remote: bool,
    ) -> HmacSha256Key {
        let id = SharedKeyId {
            remote_public_key: remote_public_key.key,
            we_called_remote,
        };
        if let Some(key) = self.shared_keys.get(&id) {
            return key.clone();
        }

        let local_public = self.ecdh.public_bytes();
        let (public_a, public_b) = if we_called_remote {
            (&local_public, &remote_public_key.key)
        } else {
            (&remote_public_key.key, &local_public)
        };

        // q || publicA || publicB
        let mut buf = Vec::with_capacity(32 + 32 + 32);
        buf.extend_from_slice(&self.ecdh.diffie_hellman(&remote_public_key.key));
        buf.extend_from_slice(public_a);
        buf.extend_from_slice(public_b);

        let key = HmacSha256Key {
            key: crypto::hkdf_extract(&buf),
        };

        if self.shared_keys.len() >= self.max_shared_keys {
            let victim = self.shared_keys.iter().next().map(|entry| *entry.key());
            if let Some(victim) = victim {
                self.shared_keys.remove(&victim);
            }
        }
        self.shared_keys.insert(id, key.clone());
        key
    }

    /// Derive the MAC key for messages we send.
    ///
    /// For the caller:     hkdfExpand(K, 0 || local_nonce || remote_nonce)
    /// For the called side: hkdfExpand(K, 1 || local_nonce || remote_nonce)
    pub fn sending_mac_key(
        &self,
        local_nonce: &[u8; 32],
        remote_nonce: &[u8; 32],
        remote_public_key: &Curve25519Public,
        we_called_remote: bool,
    ) -> HmacSha256Key {
        let role = if we_called_remote { 0 } else { 1 };
        self.mac_key(role, local_nonce, remote_nonce, remote_public_key, we_called_remote)
    }

    /// Derive the MAC key for messages we receive.
    ///
    /// For the caller:     hkdfExpand(K, 1 || remote_nonce || local_nonce)
    /// For the called side: hkdfExpand(K, 0 || remote_nonce || local_nonce)
    pub fn receiving_mac_key(
        &self,
        local_nonce: &[u8; 32],
        remote_nonce: &[u8; 32],
        remote_public_key: &Curve25519Public,
        we_called_remote: bool,
    ) -> HmacSha256Key {
        let role = if we_called_remote { 1 } else { 0 };
        self.mac_key(role, remote_nonce, local_nonce, remote_public_key, we_called_remote)
    }

    fn mac_key(
        &self,
        role: u8,
        first_nonce: &[u8; 32],
        second_nonce: &[u8; 32],
        remote_public_key: &Curve25519Public,
        we_called_remote: bool,
    ) -> HmacSha256Key {
        let shared = self.shared_key(remote_public_key, we_called_remote);
        let mut info = Vec::with_capacity(1 + 32 + 32);
        info.push(role);
        info.extend_from_slice(first_nonce);
        info.extend_from_slice(second_nonce);
        HmacSha256Key {
            key: crypto::hkdf_expand(&shared.key, &info),
        }
    }
}

impl std::fmt::Debug for ConnectionAuthentication {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionAuthentication")
            .field("identity", &self.identity)
            .field("cached_shared_keys", &self.shared_keys.len())
            .finish_non_exhaustive()
    }
}

/// SHA-256 of (networkID || ENVELOPE_TYPE_AUTH || expiration || pubkey)
fn auth_cert_hash(network_id: &Hash, expiration: u64, pubkey: &[u8; 32]) -> [u8; 32] {
    let mut data = Vec::with_capacity(32 + 4 + 8 + 32);
    data.extend_from_slice(&network_id.0);
    data.extend_from_slice(&(EnvelopeType::Auth as i32).to_be_bytes());
    data.extend_from_slice(&expiration.to_be_bytes());
    data.extend_from_slice(pubkey);
    crypto::sha256(&data)
}

fn sign_auth_cert(
    identity: &NodeIdentity,
    network_id: &Hash,
    ecdh: &EcdhKeypair,
    now: u64,
) -> Result<AuthCert, Error> {
    let expiration = now + AUTH_CERT_EXPIRATION_SECONDS;
    let pubkey = ecdh.to_curve25519_public();
    let hash = auth_cert_hash(network_id, expiration, &pubkey.key);
    let sig = Signature(
        identity
            .sign(&hash)
            .to_vec()
            .try_into()
            .map_err(Error::Signature)?,
    );
    Ok(AuthCert {
        pubkey,
        expiration,
        sig,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::network_id;

    const NOW: u64 = 1_700_000_000;

    fn authentication() -> ConnectionAuthentication {
        ConnectionAuthentication::new(
            NodeIdentity::generate(),
            network_id("Test SDF Network ; September 2015"),
        )
        .unwrap()
    }

    #[test]
    fn test_shared_key_symmetry() {
        let a = authentication();
        let b = authentication();

        let a_shared = a.shared_key(&b.ecdh_public_key(), true);
        let b_shared = b.shared_key(&a.ecdh_public_key(), false);
        assert_eq!(a_shared.key, b_shared.key);

        // The direction is part of the derivation.
        let a_reversed = a.shared_key(&b.ecdh_public_key(), false);
        assert_ne!(a_shared.key, a_reversed.key);
    }

    #[test]
    fn test_shared_key_is_cached() {
        let a = authentication();
        let b = authentication();

        let first = a.shared_key(&b.ecdh_public_key(), true);
        let second = a.shared_key(&b.ecdh_public_key(), true);
        assert_eq!(first.key, second.key);
        assert_eq!(a.shared_keys.len(), 1);

        a.shared_key(&b.ecdh_public_key(), false);
        assert_eq!(a.shared_keys.len(), 2);
    }

    #[test]
    fn test_shared_key_cache_is_bounded() {
        let local = authentication().with_max_shared_keys(4);
        let remotes: Vec<_> = (0..5).map(|_| authentication()).collect();

        for remote in &remotes {
            local.shared_key(&remote.ecdh_public_key(), true);
        }
        assert_eq!(local.shared_keys.len(), 4);

        // Evicted or not, every lookup still agrees with the remote side.
        for remote in &remotes {
            let ours = local.shared_key(&remote.ecdh_public_key(), true);
            let theirs = remote.shared_key(&local.ecdh_public_key(), false);
            assert_eq!(ours.key, theirs.key);
            assert!(local.shared_keys.len() <= 4);
        }
    }

    #[test]
    fn test_mac_keys_are_complementary() {
        let initiator = authentication();
        let responder = authentication();
        let n1 = crypto::generate_nonce();
        let n2 = crypto::generate_nonce();

        let i_send = initiator.sending_mac_key(&n1, &n2, &responder.ecdh_public_key(), true);
        let i_recv = initiator.receiving_mac_key(&n1, &n2, &responder.ecdh_public_key(), true);
        let r_send = responder.sending_mac_key(&n2, &n1, &initiator.ecdh_public_key(), false);
        let r_recv = responder.receiving_mac_key(&n2, &n1, &initiator.ecdh_public_key(), false);

        assert_eq!(i_send.key, r_recv.key);
        assert_eq!(i_recv.key, r_send.key);
        assert_ne!(i_send.key, i_recv.key);
    }

    #[test]
    fn test_auth_cert_round_trip() {
        let local = authentication();
        let remote = authentication();
        let cert = local.create_auth_cert(NOW).unwrap();
        let key = local.identity().public_key_bytes();

        assert_eq!(cert.expiration, NOW + AUTH_CERT_EXPIRATION_SECONDS);
        assert_eq!(cert.pubkey, local.ecdh_public_key());
        assert!(remote.verify_remote_auth_cert(NOW, &key, &cert));
        assert!(remote.verify_remote_auth_cert(NOW + 3599, &key, &cert));
        assert!(!remote.verify_remote_auth_cert(NOW + 3600, &key, &cert));
        assert!(!remote.verify_remote_auth_cert(NOW + 7200, &key, &cert));
    }

    #[test]
    fn test_auth_cert_rejects_wrong_signer_and_tampering() {
        let local = authentication();
        let remote = authentication();
        let cert = local.create_auth_cert(NOW).unwrap();

        let other_key = remote.identity().public_key_bytes();
        assert!(!remote.verify_remote_auth_cert(NOW, &other_key, &cert));

        let key = local.identity().public_key_bytes();
        let mut extended = cert.clone();
        extended.expiration += 1;
        assert!(!remote.verify_remote_auth_cert(NOW, &key, &extended));
    }

    #[test]
    fn test_auth_cert_rejects_other_network() {
        let local = authentication();
        let mainnet = ConnectionAuthentication::new(
            NodeIdentity::generate(),
            network_id("Public Global Stellar Network ; September 2015"),
        )
        .unwrap();
        let cert = local.create_auth_cert(NOW).unwrap();
        let key = local.identity().public_key_bytes();
        assert!(!mainnet.verify_remote_auth_cert(NOW, &key, &cert));
    }

    #[test]
    fn test_auth_cert_refresh() {
        let local = authentication();
        let now = unix_time().unwrap();

        let cert = local.auth_cert(now).unwrap();
        assert!(cert.expiration > now);
        assert_eq!(local.auth_cert(now).unwrap().expiration, cert.expiration);

        let later = cert.expiration - AUTH_CERT_EXPIRATION_SECONDS / 2 + 1;
        let refreshed = local.auth_cert(later).unwrap();
        assert_eq!(refreshed.expiration, later + AUTH_CERT_EXPIRATION_SECONDS);
    }
}
