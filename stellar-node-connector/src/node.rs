//! Dialing and accepting peers.

use crate::auth::ConnectionAuthentication;
use crate::config::Config;
use crate::connection::Connection;
use crate::crypto::NodeIdentity;
use crate::error::Error;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;

/// A local node: one identity and configuration shared by all its
/// connections.
#[derive(Debug, Clone)]
pub struct Node {
    config: Arc<Config>,
    authentication: Arc<ConnectionAuthentication>,
}

impl Node {
    pub fn new(identity: NodeIdentity, config: Config) -> Result<Self, Error> {
        config.validate()?;
        let authentication = ConnectionAuthentication::new(identity, config.network.id())?;
        tracing::debug!(
            node = %authentication.identity().address(),
            network = config.network.passphrase(),
            "Node created"
        );
        Ok(Self {
            config: Arc::new(config),
            authentication: Arc::new(authentication),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn identity(&self) -> &NodeIdentity {
        self.authentication.identity()
    }

    /// Dial a peer and start the handshake.
    ///
    /// The TCP connect counts against the handshake timeout.
    pub async fn connect(&self, host: &str, port: u16) -> Result<Connection, Error> {
        let stream = timeout(
            self.config.handshake_timeout,
            TcpStream::connect((host, port)),
        )
        .await
        .map_err(|_| Error::Timeout)??;
        let remote_address = stream.peer_addr()?;
        if let Err(e) = stream.set_nodelay(true) {
            tracing::warn!(peer = %remote_address, error_message = %e, "Failed to set TCP_NODELAY");
        }
        tracing::debug!(peer = %remote_address, "Connected to peer");
        Connection::from_stream(
            stream,
            remote_address,
            true,
            self.config.clone(),
            self.authentication.clone(),
        )
    }

    /// Listen for peers on `host:port`. Port 0 picks a free port.
    pub async fn accept_incoming(&self, host: &str, port: u16) -> Result<Listener, Error> {
        let listener = TcpListener::bind((host, port)).await?;
        tracing::info!(addr = %listener.local_addr()?, "Listening for inbound connections");
        Ok(Listener {
            listener,
            config: self.config.clone(),
            authentication: self.authentication.clone(),
        })
    }
}

/// Accepts inbound peers.
#[derive(Debug)]
pub struct Listener {
    listener: TcpListener,
    config: Arc<Config>,
    authentication: Arc<ConnectionAuthentication>,
}

impl Listener {
    pub fn local_addr(&self) -> Result<SocketAddr, Error> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept the next inbound connection.
    pub async fn accept(&self) -> Result<Connection, Error> {
        let (stream, remote_address) = self.listener.accept().await?;
        if let Err(e) = stream.set_nodelay(true) {
            tracing::warn!(peer = %remote_address, error_message = %e, "Failed to set TCP_NODELAY");
        }
        tracing::debug!(peer = %remote_address, "Accepted inbound connection");
        Connection::from_stream(
            stream,
            remote_address,
            false,
            self.config.clone(),
            self.authentication.clone(),
        )
    }
}
