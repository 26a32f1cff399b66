//! Stellar network presets.

use crate::crypto;
use std::convert::Infallible;
use std::str::FromStr;
use stellar_xdr::curr::Hash;

/// A Stellar network, identified by its passphrase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Network {
    Testnet,
    Mainnet,
    Local,
    Custom(String),
}

impl FromStr for Network {
    type Err = Infallible;

    /// Parse a network name, treating anything unrecognized as a passphrase.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.to_lowercase().as_str() {
            "testnet" | "test" => Network::Testnet,
            "mainnet" | "main" | "pubnet" | "public" => Network::Mainnet,
            "local" | "standalone" => Network::Local,
            _ => Network::Custom(s.to_string()),
        })
    }
}

impl Network {
    /// Get the network passphrase.
    pub fn passphrase(&self) -> &str {
        match self {
            Network::Testnet => "Test SDF Network ; September 2015",
            Network::Mainnet => "Public Global Stellar Network ; September 2015",
            Network::Local => "Standalone Network ; February 2017",
            Network::Custom(p) => p,
        }
    }

    /// Get the default peer for this network.
    pub fn default_peer(&self) -> &str {
        match self {
            Network::Testnet => "core-testnet1.stellar.org:11625",
            Network::Mainnet => "core-live-a.stellar.org:11625",
            Network::Local | Network::Custom(_) => "localhost:11625",
        }
    }

    /// The network ID (SHA-256 of the passphrase).
    pub fn id(&self) -> Hash {
        crypto::network_id(self.passphrase())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_names() {
        assert_eq!("testnet".parse::<Network>().unwrap(), Network::Testnet);
        assert_eq!("PUBNET".parse::<Network>().unwrap(), Network::Mainnet);
        assert_eq!("standalone".parse::<Network>().unwrap(), Network::Local);
    }

    #[test]
    fn test_custom_passphrase() {
        let network: Network = "My Private Network ; 2024".parse().unwrap();
        assert_eq!(network.passphrase(), "My Private Network ; 2024");
        assert_eq!(network.id(), crypto::network_id("My Private Network ; 2024"));
        assert_eq!(network.default_peer(), "localhost:11625");
    }

    #[test]
    fn test_testnet_id() {
        assert_eq!(
            hex::encode(Network::Testnet.id().0),
            "cee0302d59844d32bdca915c8203dd44b33fbb7edc19051ea37abedf28ecd472"
        );
    }
}
