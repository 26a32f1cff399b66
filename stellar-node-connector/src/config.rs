//! Connection configuration.

use crate::flow_control::{self, FlowControlConfig};
use crate::network::Network;
use std::time::Duration;
use tokio::sync::Semaphore;

/// Current overlay protocol version.
pub const OVERLAY_PROTOCOL_VERSION: u32 = 38;

/// Minimum overlay protocol version we support.
pub const OVERLAY_PROTOCOL_MIN_VERSION: u32 = 35;

/// Current ledger protocol version.
pub const LEDGER_PROTOCOL_VERSION: u32 = 25;

/// Default port stellar-core peers listen on.
pub const DEFAULT_PEER_PORT: u16 = 11625;

/// Default time allowed to complete the handshake.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Default time a completed connection may stay silent.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(30);

/// Default number of delivered but unacknowledged messages.
pub const DEFAULT_MAX_UNACKNOWLEDGED_MESSAGES: usize = 200;

/// Default depth of the outbound message queue.
pub const DEFAULT_OUTBOUND_QUEUE_CAPACITY: usize = 256;

/// Maximum length of the HELLO version string.
pub const MAX_VERSION_STR_LEN: usize = 100;

/// Version string for HELLO messages.
pub const DEFAULT_VERSION_STR: &str = concat!("stellar-node-connector ", env!("CARGO_PKG_VERSION"));

/// Errors from an invalid configuration.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    FlowControl(#[from] flow_control::Error),

    #[error("listening port {0} is out of range")]
    InvalidListeningPort(i32),

    #[error("overlay min version {min} is above overlay version {version}")]
    InvalidVersionRange { min: u32, version: u32 },

    #[error("version string is {0} bytes (max: {MAX_VERSION_STR_LEN})")]
    VersionStrTooLong(usize),

    #[error("{0} must be greater than zero")]
    Zero(&'static str),

    #[error("{name} is {value} (max: {max})")]
    TooLarge {
        name: &'static str,
        value: usize,
        max: usize,
    },
}

/// Settings shared by every connection of a node.
#[derive(Debug, Clone)]
pub struct Config {
    /// Network to authenticate for.
    pub network: Network,

    /// Port advertised in HELLO.
    pub listening_port: i32,

    pub ledger_version: u32,
    pub overlay_version: u32,
    pub overlay_min_version: u32,
    pub version_str: String,

    /// Time allowed from socket connect to handshake completion.
    pub handshake_timeout: Duration,

    /// Time a completed connection may go without reads, writes or
    /// acknowledgments.
    pub idle_timeout: Duration,

    /// Delivered messages the consumer may hold before reading pauses.
    pub max_unacknowledged_messages: usize,

    /// Messages that may wait to be written before `send` blocks.
    pub outbound_queue_capacity: usize,

    /// Deliver TRANSACTION messages.
    pub receive_transaction_messages: bool,

    /// Deliver SCP_MESSAGE messages.
    pub receive_scp_messages: bool,

    pub flow_control: FlowControlConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            network: Network::Testnet,
            listening_port: i32::from(DEFAULT_PEER_PORT),
            ledger_version: LEDGER_PROTOCOL_VERSION,
            overlay_version: OVERLAY_PROTOCOL_VERSION,
            overlay_min_version: OVERLAY_PROTOCOL_MIN_VERSION,
            version_str: DEFAULT_VERSION_STR.to_string(),
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            max_unacknowledged_messages: DEFAULT_MAX_UNACKNOWLEDGED_MESSAGES,
            outbound_queue_capacity: DEFAULT_OUTBOUND_QUEUE_CAPACITY,
            receive_transaction_messages: true,
            receive_scp_messages: true,
            flow_control: FlowControlConfig::default(),
        }
    }
}

impl Config {
    /// Create a configuration for `network` with default settings.
    pub fn new(network: Network) -> Self {
        Self {
            network,
            ..Default::default()
        }
    }

    /// Set the port advertised in HELLO.
    pub fn with_listening_port(mut self, port: i32) -> Self {
        self.listening_port = port;
        self
    }

    /// Set the version string advertised in HELLO.
    pub fn with_version_str(mut self, version_str: impl Into<String>) -> Self {
        self.version_str = version_str.into();
        self
    }

    /// Set the handshake timeout.
    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Set the idle timeout.
    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    /// Set the in-flight acknowledgment budget.
    pub fn with_max_unacknowledged_messages(mut self, count: usize) -> Self {
        self.max_unacknowledged_messages = count;
        self
    }

    /// Set the outbound queue depth.
    pub fn with_outbound_queue_capacity(mut self, capacity: usize) -> Self {
        self.outbound_queue_capacity = capacity;
        self
    }

    pub fn with_receive_transaction_messages(mut self, receive: bool) -> Self {
        self.receive_transaction_messages = receive;
        self
    }

    pub fn with_receive_scp_messages(mut self, receive: bool) -> Self {
        self.receive_scp_messages = receive;
        self
    }

    /// Set the flow-control sizes granted to peers.
    pub fn with_flow_control(mut self, flow_control: FlowControlConfig) -> Self {
        self.flow_control = flow_control;
        self
    }

    pub fn validate(&self) -> Result<(), Error> {
        if !(1..=65535).contains(&self.listening_port) {
            return Err(Error::InvalidListeningPort(self.listening_port));
        }
        if self.overlay_min_version > self.overlay_version {
            return Err(Error::InvalidVersionRange {
                min: self.overlay_min_version,
                version: self.overlay_version,
            });
        }
        if self.version_str.len() > MAX_VERSION_STR_LEN {
            return Err(Error::VersionStrTooLong(self.version_str.len()));
        }
        if self.max_unacknowledged_messages == 0 {
            return Err(Error::Zero("max_unacknowledged_messages"));
        }
        if self.outbound_queue_capacity == 0 {
            return Err(Error::Zero("outbound_queue_capacity"));
        }
        for (name, value) in [
            ("max_unacknowledged_messages", self.max_unacknowledged_messages),
            ("outbound_queue_capacity", self.outbound_queue_capacity),
        ] {
            if value > Semaphore::MAX_PERMITS {
                return Err(Error::TooLarge {
                    name,
                    value,
                    max: Semaphore::MAX_PERMITS,
                });
            }
        }
        if self.handshake_timeout.is_zero() {
            return Err(Error::Zero("handshake_timeout"));
        }
        if self.idle_timeout.is_zero() {
            return Err(Error::Zero("idle_timeout"));
        }
        self.flow_control.validate()?;
        Ok(())
    }
}
