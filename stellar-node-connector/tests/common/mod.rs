//! Shared helpers: connection pairs over in-memory streams and a scripted
//! peer that speaks the wire protocol directly.

#![allow(dead_code)]

use bytes::{Buf, BytesMut};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use stellar_node_connector::auth::unix_time;
use stellar_node_connector::crypto::generate_nonce;
use stellar_node_connector::flow_control::AUTH_MSG_FLAG_FLOW_CONTROL_BYTES_REQUESTED;
use stellar_node_connector::message::{self, RawMessage};
use stellar_node_connector::{
    framing, Config, Connection, ConnectionAuthentication, Done, Event, Network, NodeIdentity,
    PeerInfo,
};
use stellar_xdr::curr::{
    Auth, FloodAdvert, Hello, HmacSha256Key, StellarMessage, TxAdvertVector, Uint256, VecM,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::time::timeout;

/// Upper bound on any single wait in these tests.
pub const WAIT: Duration = Duration::from_secs(5);

pub fn config() -> Config {
    Config::new(Network::Local)
}

pub fn authentication(config: &Config) -> Arc<ConnectionAuthentication> {
    Arc::new(ConnectionAuthentication::new(NodeIdentity::generate(), config.network.id()).unwrap())
}

pub fn address(port: u16) -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], port))
}

/// Start an outbound and an inbound connection over one in-memory stream.
pub fn connection_pair(
    outbound_config: Config,
    inbound_config: Config,
) -> (
    Connection,
    Arc<ConnectionAuthentication>,
    Connection,
    Arc<ConnectionAuthentication>,
) {
    let (a, b) = tokio::io::duplex(1024 * 1024);
    let outbound_auth = authentication(&outbound_config);
    let inbound_auth = authentication(&inbound_config);
    let outbound = Connection::from_stream(
        a,
        address(2),
        true,
        Arc::new(outbound_config),
        outbound_auth.clone(),
    )
    .unwrap();
    let inbound = Connection::from_stream(
        b,
        address(1),
        false,
        Arc::new(inbound_config),
        inbound_auth.clone(),
    )
    .unwrap();
    (outbound, outbound_auth, inbound, inbound_auth)
}

/// A small flood message.
pub fn flood_advert() -> StellarMessage {
    StellarMessage::FloodAdvert(FloodAdvert {
        tx_hashes: TxAdvertVector(VecM::default()),
    })
}

pub async fn next_event(connection: &mut Connection) -> Event {
    timeout(WAIT, connection.next_event())
        .await
        .expect("timed out waiting for event")
        .expect("event stream ended")
}

pub async fn expect_connected(connection: &mut Connection) -> PeerInfo {
    match next_event(connection).await {
        Event::Connected(peer) => peer,
        other => panic!("expected Connected, got {other:?}"),
    }
}

pub async fn expect_message(connection: &mut Connection) -> (StellarMessage, Done) {
    match next_event(connection).await {
        Event::Message { message, done } => (message, done),
        other => panic!("expected Message, got {other:?}"),
    }
}

/// A peer driven step by step from the test, playing the caller role.
pub struct RawPeer {
    stream: DuplexStream,
    buffer: BytesMut,
    pub authentication: ConnectionAuthentication,
    nonce: [u8; 32],
    sending: Option<HmacSha256Key>,
    receiving: Option<HmacSha256Key>,
    pub next_sequence: u64,
}

impl RawPeer {
    pub fn new(stream: DuplexStream, config: &Config) -> Self {
        Self {
            stream,
            buffer: BytesMut::new(),
            authentication: ConnectionAuthentication::new(
                NodeIdentity::generate(),
                config.network.id(),
            )
            .unwrap(),
            nonce: generate_nonce(),
            sending: None,
            receiving: None,
            next_sequence: 0,
        }
    }

    /// Start an inbound connection on one end of a fresh stream and return
    /// it together with a raw peer on the other end.
    pub fn with_inbound(config: Config) -> (Self, Connection, Arc<ConnectionAuthentication>) {
        Self::with_inbound_buffer(config, 1024 * 1024)
    }

    /// Like [`RawPeer::with_inbound`], with `buffer` bytes of stream capacity
    /// in each direction.
    pub fn with_inbound_buffer(
        config: Config,
        buffer: usize,
    ) -> (Self, Connection, Arc<ConnectionAuthentication>) {
        let (a, b) = tokio::io::duplex(buffer);
        let peer = RawPeer::new(a, &config);
        let auth = authentication(&config);
        let connection =
            Connection::from_stream(b, address(1), false, Arc::new(config), auth.clone()).unwrap();
        (peer, connection, auth)
    }

    pub async fn write_raw(&mut self, bytes: &[u8]) {
        self.stream.write_all(bytes).await.unwrap();
    }

    pub async fn write_body(&mut self, body: &[u8]) {
        let frame = framing::encode_frame(body).unwrap();
        self.stream.write_all(&frame).await.unwrap();
    }

    pub async fn read_raw(&mut self) -> RawMessage {
        timeout(WAIT, async {
            loop {
                if self.buffer.len() >= 4 {
                    let mut prefix = [0u8; 4];
                    prefix.copy_from_slice(&self.buffer[..4]);
                    let length = framing::parse_length(prefix);
                    if self.buffer.len() >= 4 + length {
                        self.buffer.advance(4);
                        let body = self.buffer.split_to(length).freeze();
                        return RawMessage::parse(body).unwrap();
                    }
                }
                let n = self.stream.read_buf(&mut self.buffer).await.unwrap();
                assert!(n > 0, "connection closed by the other side");
            }
        })
        .await
        .expect("timed out waiting for a frame")
    }

    /// Whether the other side has closed the stream.
    pub async fn is_closed(&mut self) -> bool {
        let mut scratch = [0u8; 1024];
        loop {
            match timeout(WAIT, self.stream.read(&mut scratch)).await {
                Ok(Ok(0)) | Ok(Err(_)) => return true,
                Ok(Ok(_)) => continue,
                Err(_) => return false,
            }
        }
    }

    pub fn hello(&self) -> StellarMessage {
        let now = unix_time().unwrap();
        StellarMessage::Hello(Hello {
            ledger_version: 25,
            overlay_version: 38,
            overlay_min_version: 35,
            network_id: self.authentication.network_id().clone(),
            version_str: "raw-peer".try_into().unwrap(),
            listening_port: 11625,
            peer_id: self.authentication.identity().node_id(),
            cert: self.authentication.auth_cert(now).unwrap(),
            nonce: Uint256(self.nonce),
        })
    }

    pub async fn send_unauthenticated(&mut self, message: &StellarMessage) {
        let body = message::encode(0, message, None).unwrap();
        self.write_body(&body).await;
    }

    /// Read the other side's HELLO and derive the MAC keys from it.
    pub async fn expect_hello(&mut self) -> Hello {
        let raw = self.read_raw().await;
        assert_eq!(raw.sequence(), 0);
        assert_eq!(raw.mac(), &[0u8; 32]);
        let hello = match raw.decode().unwrap() {
            StellarMessage::Hello(hello) => hello,
            other => panic!("expected Hello, got {}", other.name()),
        };
        self.sending = Some(self.authentication.sending_mac_key(
            &self.nonce,
            &hello.nonce.0,
            &hello.cert.pubkey,
            true,
        ));
        self.receiving = Some(self.authentication.receiving_mac_key(
            &self.nonce,
            &hello.nonce.0,
            &hello.cert.pubkey,
            true,
        ));
        hello
    }

    pub async fn send_with_sequence(&mut self, sequence: u64, message: &StellarMessage) {
        let body = message::encode(sequence, message, self.sending.as_ref()).unwrap();
        self.write_body(&body).await;
    }

    pub async fn send(&mut self, message: &StellarMessage) {
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        self.send_with_sequence(sequence, message).await;
    }

    /// Receive an authenticated message, checking its MAC.
    pub async fn recv(&mut self) -> (u64, StellarMessage) {
        let raw = self.read_raw().await;
        let key = self.receiving.as_ref().expect("no receiving key yet");
        assert!(raw.verify_mac(key), "bad MAC on {:?}", raw.message_type());
        (raw.sequence(), raw.decode().unwrap())
    }

    /// Run the caller side of the handshake up to and including the peer's
    /// AUTH.
    pub async fn handshake(&mut self) {
        let hello = self.hello();
        self.send_unauthenticated(&hello).await;
        self.expect_hello().await;
        self.send(&StellarMessage::Auth(Auth {
            flags: AUTH_MSG_FLAG_FLOW_CONTROL_BYTES_REQUESTED,
        }))
        .await;
        let (sequence, auth) = self.recv().await;
        assert_eq!(sequence, 0);
        assert!(matches!(auth, StellarMessage::Auth(_)));
    }
}
