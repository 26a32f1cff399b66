//! Authenticated peer connections to the Stellar overlay network.
//!
//! This crate speaks the stellar-core peer-to-peer protocol: it dials or
//! accepts TCP peers, runs the HELLO/AUTH handshake, authenticates every
//! message with an ECDH-derived HMAC key and a per-direction sequence number,
//! and applies credit-based flow control to flooded traffic.
//!
//! # Example
//!
//! ```no_run
//! use stellar_node_connector::{Config, Event, Network, Node, NodeIdentity};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let node = Node::new(NodeIdentity::generate(), Config::new(Network::Testnet))?;
//!     let mut connection = node.connect("core-testnet1.stellar.org", 11625).await?;
//!
//!     while let Some(event) = connection.next_event().await {
//!         match event {
//!             Event::Connected(peer) => println!("connected to {}", peer.strkey()),
//!             Event::Message { message, done } => {
//!                 println!("received {}", message.name());
//!                 done.done();
//!             }
//!             Event::Error(e) => eprintln!("error: {e}"),
//!             Event::Timeout => eprintln!("timed out"),
//!             Event::Close => break,
//!         }
//!     }
//!     Ok(())
//! }
//! ```
//!
//! # Network Passphrases
//!
//! - **Testnet**: `"Test SDF Network ; September 2015"`
//! - **Mainnet**: `"Public Global Stellar Network ; September 2015"`
//! - **Local/Standalone**: `"Standalone Network ; February 2017"`
//!
//! # Limitations
//!
//! Frames are always a single XDR record fragment. Payloads are
//! authenticated, not encrypted.
//!
//! Inbound credit is managed for you: the connection grants the peer more
//! capacity as delivered messages are acknowledged. Outbound credit is not.
//! The peer's `SEND_MORE` / `SEND_MORE_EXTENDED` grants arrive as ordinary
//! [`Event::Message`]s, and [`Connection::send`] writes flood messages
//! without checking them, so callers that flood must keep within the
//! capacity the peer has granted.

pub mod auth;
pub mod config;
pub mod connection;
pub mod crypto;
pub mod error;
pub mod flow_control;
pub mod framing;
pub mod handshake;
pub mod message;
pub mod network;
pub mod node;
mod session;

pub use auth::ConnectionAuthentication;
pub use config::Config;
pub use connection::{Connection, ConnectionState, Done, Event, ReadState};
pub use crypto::{network_id, NodeIdentity};
pub use error::{Error, ErrorKind};
pub use flow_control::{FlowControlConfig, FlowController};
pub use handshake::HandshakeState;
pub use network::Network;
pub use node::{Listener, Node};
pub use session::PeerInfo;
