//! stellar-peerinfo - Get peer information from the Stellar overlay network.
//!
//! Connects to Stellar Core nodes as an overlay peer, records what each one
//! says about itself in its HELLO, and follows the PEERS lists it sends to
//! discover more nodes.

mod log;

use anyhow::{Context, Result};
use clap::Parser;
use log::EventFormatter;
use serde::Serialize;
use std::collections::{HashSet, VecDeque};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use stellar_node_connector::config::DEFAULT_PEER_PORT;
use stellar_node_connector::{Config, Event, Network, Node, NodeIdentity, PeerInfo};
use stellar_xdr::curr::{PeerAddress, PeerAddressIp, StellarMessage};
use tokio::sync::{mpsc, Mutex, Semaphore};
use tokio::time::{timeout_at, Instant};
use tracing::level_filters::LevelFilter;
use tracing_subscriber::prelude::*;

/// Get peer information from the Stellar overlay network.
///
/// Connects to a Stellar Core node, discovers known peers,
/// and collects information about each peer.
#[derive(Parser, Debug)]
#[command(name = "stellar-peerinfo", version, about)]
struct Args {
    /// Peer address to connect to (host:port)
    #[arg(short, long)]
    peer: Option<String>,

    /// Network passphrase (or "testnet" / "mainnet" / "local")
    #[arg(short, long, default_value = "testnet")]
    network: String,

    /// Timeout in seconds for each peer
    #[arg(short, long, default_value = "10")]
    timeout: u64,

    /// Maximum number of concurrent peer connections
    #[arg(short = 'j', long, default_value = "10")]
    concurrency: usize,

    /// Recursion depth for peer discovery (0 = no recursion)
    #[arg(short, long, default_value = "0")]
    depth: usize,

    /// Secret seed (S...) to connect with instead of a fresh identity
    #[arg(long, env = "STELLAR_PEERINFO_SEED")]
    seed: Option<String>,

    /// Log protocol traffic to stderr
    #[arg(short, long)]
    verbose: bool,
}

/// One NDJSON line of output.
#[derive(Serialize, Clone, Debug)]
struct PeerOutput {
    #[serde(rename = "type")]
    output_type: &'static str,
    peer_address: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    peer_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    overlay_version: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    overlay_min_version: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    ledger_version: Option<u32>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    known_peers: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl PeerOutput {
    fn info(address: &str, peer: &PeerInfo, known_peers: Vec<String>) -> Self {
        Self {
            output_type: "info",
            peer_address: address.to_string(),
            peer_id: Some(peer.strkey()),
            version: Some(peer.version_str.clone()),
            overlay_version: Some(peer.overlay_version),
            overlay_min_version: Some(peer.overlay_min_version),
            ledger_version: Some(peer.ledger_version),
            known_peers,
            error: None,
        }
    }

    fn error(address: &str, error: impl ToString) -> Self {
        Self {
            output_type: "error",
            peer_address: address.to_string(),
            peer_id: None,
            version: None,
            overlay_version: None,
            overlay_min_version: None,
            ledger_version: None,
            known_peers: Vec::new(),
            error: Some(error.to_string()),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let level = if args.verbose {
        LevelFilter::DEBUG
    } else {
        LevelFilter::WARN
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .event_format(EventFormatter)
                .with_filter(level),
        )
        .init();

    let network: Network = match args.network.parse() {
        Ok(network) => network,
        Err(never) => match never {},
    };
    let initial_peer = args
        .peer
        .clone()
        .unwrap_or_else(|| network.default_peer().to_string());

    let identity = match &args.seed {
        Some(seed) => NodeIdentity::from_secret_seed(seed).context("invalid --seed")?,
        None => NodeIdentity::generate(),
    };
    let timeout_duration = Duration::from_secs(args.timeout);
    let config = Config::new(network).with_handshake_timeout(timeout_duration);
    let node = Arc::new(Node::new(identity, config).context("invalid node configuration")?);

    let semaphore = Arc::new(Semaphore::new(args.concurrency.max(1)));
    let visited = Arc::new(Mutex::new(HashSet::from([initial_peer.clone()])));
    let queue = Arc::new(Mutex::new(VecDeque::from([(initial_peer, 0usize)])));

    let (tx, mut rx) = mpsc::unbounded_channel::<PeerOutput>();
    let output_handle = tokio::spawn(async move {
        while let Some(output) = rx.recv().await {
            match serde_json::to_string(&output) {
                Ok(line) => println!("{line}"),
                Err(e) => tracing::error!(error_message = %e, "Failed to serialize output"),
            }
        }
    });

    let max_depth = args.depth;

    loop {
        let batch: Vec<(String, usize)> = queue.lock().await.drain(..).collect();
        if batch.is_empty() {
            break;
        }

        let mut handles = Vec::new();
        for (address, depth) in batch {
            let semaphore = semaphore.clone();
            let node = node.clone();
            let tx = tx.clone();
            let queue = queue.clone();
            let visited = visited.clone();

            handles.push(tokio::spawn(async move {
                let Ok(_permit) = semaphore.acquire_owned().await else {
                    return;
                };
                tracing::info!(peer = %address, depth, "Connecting");

                let (output, known_peers) = match survey(&node, &address, timeout_duration).await
                {
                    Ok((peer, known_peers)) => (
                        PeerOutput::info(&address, &peer, known_peers.clone()),
                        known_peers,
                    ),
                    Err(e) => (PeerOutput::error(&address, format!("{e:#}")), Vec::new()),
                };
                let _ = tx.send(output);

                if depth < max_depth {
                    let mut visited = visited.lock().await;
                    let mut queue = queue.lock().await;
                    for peer_address in known_peers {
                        if visited.insert(peer_address.clone()) {
                            queue.push_back((peer_address, depth + 1));
                        }
                    }
                }
            }));
        }

        for handle in handles {
            if let Err(e) = handle.await {
                tracing::error!(error_message = %e, "Peer task failed");
            }
        }
    }

    drop(tx);
    output_handle.await?;

    Ok(())
}

/// Connect to one peer, wait for its HELLO and the PEERS list it sends to
/// callers, then hang up.
async fn survey(
    node: &Node,
    address: &str,
    timeout_duration: Duration,
) -> Result<(PeerInfo, Vec<String>)> {
    let (host, port) = split_host_port(address)?;
    let deadline = Instant::now() + timeout_duration;
    let mut connection = node
        .connect(host, port)
        .await
        .with_context(|| format!("connecting to {address}"))?;

    let mut peer = None;
    let mut known_peers = Vec::new();
    let mut failure = None;

    loop {
        let event = match timeout_at(deadline, connection.next_event()).await {
            Ok(Some(event)) => event,
            Ok(None) | Err(_) => break,
        };
        match event {
            Event::Connected(info) => peer = Some(info),
            Event::Message { message, done } => {
                done.done();
                if let StellarMessage::Peers(peers) = message {
                    known_peers = peers.iter().map(format_peer_address).collect();
                    break;
                }
            }
            Event::Error(e) => {
                failure = Some(e);
                break;
            }
            Event::Timeout | Event::Close => break,
        }
    }
    connection.close();

    match (peer, failure) {
        (Some(peer), _) => Ok((peer, known_peers)),
        (None, Some(e)) => Err(e).context("handshake failed"),
        (None, None) => anyhow::bail!("no handshake within {}s", timeout_duration.as_secs()),
    }
}

/// Split `host:port`, accepting bracketed IPv6 hosts and defaulting the port.
fn split_host_port(address: &str) -> Result<(&str, u16)> {
    if let Some(rest) = address.strip_prefix('[') {
        let (host, tail) = rest
            .split_once(']')
            .with_context(|| format!("unterminated IPv6 address: {address}"))?;
        let port = match tail.strip_prefix(':') {
            Some(port) => port.parse().with_context(|| format!("invalid port: {address}"))?,
            None if tail.is_empty() => DEFAULT_PEER_PORT,
            None => anyhow::bail!("invalid address: {address}"),
        };
        return Ok((host, port));
    }
    match address.rsplit_once(':') {
        Some((host, port)) => Ok((
            host,
            port.parse().with_context(|| format!("invalid port: {address}"))?,
        )),
        None => Ok((address, DEFAULT_PEER_PORT)),
    }
}

/// Format a PeerAddress for display.
fn format_peer_address(peer: &PeerAddress) -> String {
    let ip: IpAddr = match &peer.ip {
        PeerAddressIp::IPv4(ip) => IpAddr::V4(Ipv4Addr::from(*ip)),
        PeerAddressIp::IPv6(ip) => IpAddr::V6(Ipv6Addr::from(*ip)),
    };
    SocketAddr::new(ip, peer.port as u16).to_string()
}
