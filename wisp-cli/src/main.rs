//! Wisp command line.
//!
//! A thin consumer of the overlay's public API: `run` starts a node and
//! broadcasts stdin lines to the mesh, `stun` prints the reflexive
//! address a server sees for a throwaway socket.

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::debug;
use tracing_subscriber::EnvFilter;

use wisp_core::{config::DEFAULT_STUN_SERVER, MeshConfig};
use wisp_overlay::{stun, MeshEvent, MeshNode};

#[derive(Parser)]
#[command(name = "wisp", about = "Peer-to-peer virtual LAN node", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a node and broadcast stdin lines to the mesh
    Run {
        /// Network name shared by every member
        #[arg(short, long)]
        network: String,
        /// Shared network secret
        #[arg(short, long)]
        secret: String,
        /// Local UDP port, 0 for OS-assigned
        #[arg(short, long, default_value_t = 0)]
        port: u16,
        /// Peer to hole-punch at startup, as ip:port
        #[arg(short, long)]
        connect: Option<String>,
        /// STUN server for reflexive address discovery
        #[arg(long, default_value = DEFAULT_STUN_SERVER)]
        stun_server: String,
    },
    /// Query a STUN server and print the reflexive address
    Stun {
        /// STUN server as host:port
        #[arg(long, default_value = DEFAULT_STUN_SERVER)]
        server: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    match Cli::parse().command {
        Command::Run {
            network,
            secret,
            port,
            connect,
            stun_server,
        } => run(network, secret, port, connect, stun_server).await,
        Command::Stun { server } => stun_probe(server).await,
    }
}

async fn run(
    network: String,
    secret: String,
    port: u16,
    connect: Option<String>,
    stun_server: String,
) -> Result<()> {
    let mut cfg = MeshConfig::new(network.clone(), secret);
    cfg.local_port = port;
    cfg.stun_server = stun_server;

    let node = MeshNode::start(cfg).await.context("starting mesh node")?;

    println!("node id:     {}", node.node_id());
    println!("virtual ip:  {}", node.virtual_ip());
    println!("local:       {}", node.local_addr()?);
    match node.external_addr().await {
        Some(external) => {
            println!("external:    {external}");
            println!();
            println!("share with friends:");
            println!("  wisp run -n {network} -s <secret> --connect {external}");
        }
        None => println!("external:    unknown (STUN unreachable)"),
    }

    if let Some(target) = connect {
        let (ip, punch_port) = parse_peer(&target)?;
        println!("punching toward {ip}:{punch_port} ...");
        node.connect_to_peer(ip, punch_port).await;
    }

    // Event printer runs beside the prompt; slow terminals lag events
    // rather than the receive loop.
    let mut events = node.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(MeshEvent::PeerConnected(peer)) => {
                    println!("+ peer {} at {}", peer.virtual_ip, peer.addr);
                }
                Ok(MeshEvent::PeerDisconnected(peer)) => {
                    println!("- peer {} timed out", peer.virtual_ip);
                }
                Ok(MeshEvent::Message { from, payload }) => {
                    println!("[{from}] {}", String::from_utf8_lossy(&payload));
                }
                Err(e) => {
                    debug!("event stream lagged: {e}");
                }
            }
        }
    });

    println!();
    println!("chat mode: type to broadcast, /peers to list, /quit to exit");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        match line.trim() {
            "" => {}
            "/quit" => break,
            "/peers" => {
                let peers = node.get_peers().await;
                if peers.is_empty() {
                    println!("no peers");
                }
                for peer in peers {
                    println!("  {} - {}", peer.virtual_ip, peer.addr);
                }
            }
            text => node.broadcast(text.as_bytes()).await,
        }
    }

    node.shutdown();
    Ok(())
}

async fn stun_probe(server: String) -> Result<()> {
    let resolved = tokio::net::lookup_host(&server)
        .await
        .context("resolving STUN server")?
        .find(SocketAddr::is_ipv4)
        .context("STUN server has no IPv4 address")?;

    let socket = tokio::net::UdpSocket::bind("0.0.0.0:0").await?;
    let mapped = stun::binding_request(&socket, resolved, Duration::from_secs(5))
        .await
        .context("binding request failed")?;
    println!("reflexive address: {mapped}");
    Ok(())
}

fn parse_peer(target: &str) -> Result<(IpAddr, u16)> {
    let Some((ip, port)) = target.rsplit_once(':') else {
        bail!("peer must be ip:port, got {target:?}");
    };
    Ok((
        ip.parse().context("peer ip")?,
        port.parse().context("peer port")?,
    ))
}
