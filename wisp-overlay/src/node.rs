#![cfg_attr(test, allow(clippy::unwrap_used))]

//! The overlay engine.
//!
//! Owns the UDP socket and all mutable state. Three logical activities
//! run concurrently: the receive loop (decrypt, decode, dispatch), the
//! hole-punch initiator, and the keepalive/reaper loop. The receive path
//! never terminates on error; anything that fails to authenticate or
//! decode is dropped without side effects.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use socket2::{Domain, Type};
use tokio::net::{lookup_host, UdpSocket};
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, info, trace, warn};

use wisp_core::{MeshConfig, NodeId, Result, VirtualIp};
use wisp_crypto::Envelope;

use crate::peers::{PeerRecord, PeerTable};
use crate::stun::{self, StunResolver};
use crate::wire::{self, Message, PeerEntry};

/// Largest datagram the receive loop accepts; sized so application
/// chunkers have headroom under typical UDP limits.
const MAX_DATAGRAM: usize = 65_535;

/// Event fan-out buffer. Slow consumers lag and lose events rather than
/// stalling the receive loop.
const EVENT_BUFFER: usize = 1024;

/// Engine timing knobs. The defaults are the protocol constants; tests
/// construct shortened variants. There is no runtime configuration
/// surface beyond this.
#[derive(Debug, Clone)]
pub struct Timing {
    /// Interval between keepalive/reaper passes.
    pub keepalive_period: Duration,
    /// Idle span after which a peer is evicted.
    pub peer_timeout: Duration,
    /// Number of hello probes per hole punch.
    pub hole_punch_count: u32,
    /// Spacing between hole-punch probes.
    pub hole_punch_spacing: Duration,
    /// How long to wait for a STUN binding response.
    pub stun_timeout: Duration,
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            keepalive_period: Duration::from_secs(10),
            peer_timeout: Duration::from_secs(60),
            hole_punch_count: 5,
            hole_punch_spacing: Duration::from_millis(500),
            stun_timeout: Duration::from_secs(5),
        }
    }
}

/// Overlay notifications drained by the application.
///
/// Published from the engine's tasks onto a broadcast channel; handlers
/// run in the consumer's context, so the receive loop is never starved
/// by a slow application.
#[derive(Debug, Clone)]
pub enum MeshEvent {
    /// A previously-unknown peer completed a handshake.
    PeerConnected(PeerRecord),
    /// A peer went silent past the timeout and was evicted.
    PeerDisconnected(PeerRecord),
    /// An application payload arrived.
    Message {
        /// Overlay address of the originator.
        from: VirtualIp,
        /// Opaque application bytes.
        payload: Vec<u8>,
    },
}

struct Inner {
    node_id: NodeId,
    virtual_ip: VirtualIp,
    network_id: String,
    envelope: Envelope,
    socket: UdpSocket,
    peers: RwLock<PeerTable>,
    external: RwLock<Option<SocketAddr>>,
    stun: StunResolver,
    stun_server: String,
    events: broadcast::Sender<MeshEvent>,
    timing: Timing,
}

/// One mesh node: identity, socket, peer table, and background tasks.
///
/// Dropping the node aborts the receive and keepalive loops and closes
/// the socket; in-flight events are not drained.
pub struct MeshNode {
    inner: Arc<Inner>,
    tasks: Vec<JoinHandle<()>>,
}

impl MeshNode {
    /// Start a node with the protocol-default timing.
    pub async fn start(config: MeshConfig) -> Result<Self> {
        Self::start_with_timing(config, Timing::default()).await
    }

    /// Start a node: bind the socket, derive identity, perform initial
    /// reflexive discovery, and spawn the receive and keepalive loops.
    ///
    /// Bind failure is the only fatal error; a dead STUN server just
    /// leaves the reflexive address unset until the next refresh.
    pub async fn start_with_timing(config: MeshConfig, timing: Timing) -> Result<Self> {
        config.validate()?;

        let node_id = NodeId::generate(&config.network_secret);
        let virtual_ip = VirtualIp::derive(&config.network_id, &node_id);
        let envelope = Envelope::from_secret(&config.network_secret);
        let socket = bind_udp(config.local_port)?;

        let (events, _) = broadcast::channel(EVENT_BUFFER);
        let inner = Arc::new(Inner {
            node_id,
            virtual_ip,
            network_id: config.network_id,
            envelope,
            socket,
            peers: RwLock::new(PeerTable::new()),
            external: RwLock::new(None),
            stun: StunResolver::new(),
            stun_server: config.stun_server,
            events,
            timing,
        });

        // The receive loop must be up before the first STUN query: it is
        // what routes the binding response back to the resolver.
        let rx_task = tokio::spawn(recv_loop(inner.clone()));
        refresh_external(&inner).await;
        let ka_task = tokio::spawn(keepalive_loop(inner.clone()));

        info!(
            node_id = %inner.node_id,
            virtual_ip = %inner.virtual_ip,
            local = %inner.socket.local_addr()?,
            "mesh node started"
        );

        Ok(Self {
            inner,
            tasks: vec![rx_task, ka_task],
        })
    }

    /// This node's identifier.
    pub fn node_id(&self) -> &NodeId {
        &self.inner.node_id
    }

    /// This node's overlay address.
    pub fn virtual_ip(&self) -> VirtualIp {
        self.inner.virtual_ip
    }

    /// Address the socket is bound to.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.inner.socket.local_addr()?)
    }

    /// Last reflexive address reported by STUN, if any. Advisory; it may
    /// drift as the NAT rebinds.
    pub async fn external_addr(&self) -> Option<SocketAddr> {
        *self.inner.external.read().await
    }

    /// Subscribe to overlay events.
    pub fn subscribe(&self) -> broadcast::Receiver<MeshEvent> {
        self.inner.events.subscribe()
    }

    /// Snapshot of the current peer table.
    pub async fn get_peers(&self) -> Vec<PeerRecord> {
        self.inner.peers.read().await.snapshot()
    }

    /// Best-effort UDP hole punch: a burst of hellos at fixed spacing.
    /// Unconditional, and no state is created here; the peer appears in
    /// the table only when it answers.
    pub async fn connect_to_peer(&self, ip: IpAddr, port: u16) {
        hole_punch(&self.inner, SocketAddr::new(ip, port)).await;
    }

    /// Send an application payload to the peer owning `virtual_ip`.
    /// Returns false when no such peer is known; there is no queueing
    /// for offline peers.
    pub async fn send(&self, virtual_ip: VirtualIp, payload: &[u8]) -> bool {
        let target = self
            .inner
            .peers
            .read()
            .await
            .find_by_virtual_ip(virtual_ip)
            .map(|p| p.addr);
        match target {
            Some(addr) => {
                let msg = Message::Data {
                    from_ip: self.inner.virtual_ip,
                    data: payload.to_vec(),
                };
                send_message(&self.inner, &msg, addr).await;
                true
            }
            None => false,
        }
    }

    /// Send an application payload to every known peer: exactly one
    /// datagram per entry in the current snapshot.
    pub async fn broadcast(&self, payload: &[u8]) {
        let targets: Vec<SocketAddr> = self
            .inner
            .peers
            .read()
            .await
            .snapshot()
            .into_iter()
            .map(|p| p.addr)
            .collect();
        let msg = Message::Data {
            from_ip: self.inner.virtual_ip,
            data: payload.to_vec(),
        };
        for addr in targets {
            send_message(&self.inner, &msg, addr).await;
        }
    }

    /// Stop the node. Equivalent to dropping it.
    pub fn shutdown(self) {}
}

impl Drop for MeshNode {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

/// Bind on 0.0.0.0:port with address reuse, port 0 meaning OS-assigned.
fn bind_udp(port: u16) -> std::io::Result<UdpSocket> {
    let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port);
    let socket = socket2::Socket::new(Domain::for_address(addr), Type::DGRAM, None)?;
    socket.set_reuse_address(true)?;
    socket.bind(&addr.into())?;
    let std_sock: std::net::UdpSocket = socket.into();
    std_sock.set_nonblocking(true)?;
    UdpSocket::from_std(std_sock)
}

/// Receive loop: demultiplex STUN by cookie, authenticate everything
/// else, decode, dispatch. Must never terminate.
async fn recv_loop(inner: Arc<Inner>) {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        let (len, src) = match inner.socket.recv_from(&mut buf).await {
            Ok(received) => received,
            Err(e) => {
                debug!("udp recv error: {e}");
                // Back off so a persistent socket error cannot spin the
                // task at full CPU.
                sleep(Duration::from_millis(100)).await;
                continue;
            }
        };
        let data = &buf[..len];

        if stun::is_stun_datagram(data) {
            inner.stun.dispatch(data);
            continue;
        }

        let plaintext = match inner.envelope.open(data) {
            Ok(p) => p,
            Err(_) => {
                trace!(%src, "dropping unauthenticated datagram");
                continue;
            }
        };
        let msg = match wire::decode(&plaintext) {
            Ok(m) => m,
            Err(_) => {
                trace!(%src, "dropping undecodable datagram");
                continue;
            }
        };
        handle_message(&inner, msg, src).await;
    }
}

/// Dispatch one authenticated message. The observed UDP source is
/// authoritative for the sender's address; anything claimed inside the
/// payload is gossip-only.
async fn handle_message(inner: &Arc<Inner>, msg: Message, src: SocketAddr) {
    match msg {
        Message::Hello {
            node_id,
            virtual_ip,
            // Advisory only; the shared secret is the admission control.
            network_id: _,
        } => {
            if node_id == inner.node_id {
                return;
            }
            let record = PeerRecord {
                node_id,
                virtual_ip,
                addr: src,
                last_seen: Instant::now(),
                connected: true,
            };
            let (newly_added, entries) = {
                let mut peers = inner.peers.write().await;
                let newly_added = peers.upsert(record.clone());
                (newly_added, peers.entries())
            };

            let ack = Message::HelloAck {
                node_id: inner.node_id.clone(),
                virtual_ip: inner.virtual_ip,
                peers: entries,
            };
            send_message(inner, &ack, src).await;

            if newly_added {
                info!(peer = %record.virtual_ip, %src, "peer connected");
                publish(inner, MeshEvent::PeerConnected(record));
            }
        }
        Message::HelloAck {
            node_id,
            virtual_ip,
            peers,
        } => {
            if node_id == inner.node_id {
                return;
            }
            let record = PeerRecord {
                node_id,
                virtual_ip,
                addr: src,
                last_seen: Instant::now(),
                connected: true,
            };
            let newly_added = inner.peers.write().await.upsert(record.clone());
            if newly_added {
                info!(peer = %record.virtual_ip, %src, "peer connected");
                publish(inner, MeshEvent::PeerConnected(record));
            }
            gossip_walk(inner, peers).await;
        }
        Message::Keepalive { node_id, .. } => {
            // Strangers must handshake first; a keepalive alone never
            // creates a record.
            inner
                .peers
                .write()
                .await
                .touch(&node_id, src, Instant::now());
        }
        Message::Data { from_ip, data } => {
            publish(
                inner,
                MeshEvent::Message {
                    from: from_ip,
                    payload: data,
                },
            );
        }
        Message::Discover { .. } => {
            let entries = inner.peers.read().await.entries();
            let response = Message::DiscoverResponse {
                node_id: inner.node_id.clone(),
                virtual_ip: inner.virtual_ip,
                peers: entries,
            };
            send_message(inner, &response, src).await;
        }
        Message::DiscoverResponse { peers, .. } => {
            gossip_walk(inner, peers).await;
        }
    }
}

/// Walk a gossiped peer list and punch toward every advertised node we
/// do not already know. Entries never create records directly: a peer
/// exists only once it answers with an authenticated datagram.
async fn gossip_walk(inner: &Arc<Inner>, entries: Vec<PeerEntry>) {
    for entry in entries {
        if entry.node_id == inner.node_id {
            continue;
        }
        if inner.peers.read().await.contains(&entry.node_id) {
            continue;
        }
        let target = SocketAddr::new(IpAddr::V4(entry.external_ip), entry.external_port);
        debug!(peer = %entry.node_id, %target, "gossip: punching toward advertised peer");
        let punch = inner.clone();
        tokio::spawn(async move {
            hole_punch(&punch, target).await;
        });
    }
}

/// Send the hello burst toward `target` at fixed spacing.
async fn hole_punch(inner: &Arc<Inner>, target: SocketAddr) {
    let hello = Message::Hello {
        node_id: inner.node_id.clone(),
        virtual_ip: inner.virtual_ip,
        network_id: inner.network_id.clone(),
    };
    for _ in 0..inner.timing.hole_punch_count {
        send_message(inner, &hello, target).await;
        sleep(inner.timing.hole_punch_spacing).await;
    }
}

/// Keepalive and reaper loop: refresh the reflexive address, evict
/// silent peers, keep NAT mappings warm for the rest.
async fn keepalive_loop(inner: Arc<Inner>) {
    loop {
        sleep(inner.timing.keepalive_period).await;

        refresh_external(&inner).await;

        let now = Instant::now();
        let (expired, alive) = {
            let mut peers = inner.peers.write().await;
            let expired = peers.expire(now, inner.timing.peer_timeout);
            let alive: Vec<SocketAddr> =
                peers.snapshot().into_iter().map(|p| p.addr).collect();
            (expired, alive)
        };

        for record in expired {
            warn!(peer = %record.virtual_ip, "peer timed out");
            publish(&inner, MeshEvent::PeerDisconnected(record));
        }

        let keepalive = Message::Keepalive {
            node_id: inner.node_id.clone(),
            virtual_ip: inner.virtual_ip,
        };
        for addr in alive {
            send_message(&inner, &keepalive, addr).await;
        }
    }
}

/// Refresh the reflexive address via the shared socket. Failure leaves
/// the previous address intact.
async fn refresh_external(inner: &Arc<Inner>) {
    let server = match resolve_stun_server(&inner.stun_server).await {
        Some(server) => server,
        None => {
            debug!(server = %inner.stun_server, "stun server unresolvable");
            return;
        }
    };
    match inner
        .stun
        .query(&inner.socket, server, inner.timing.stun_timeout)
        .await
    {
        Ok(mapped) => {
            *inner.external.write().await = Some(mapped);
            debug!(%mapped, "reflexive address refreshed");
        }
        Err(e) => debug!("stun query failed: {e}"),
    }
}

async fn resolve_stun_server(server: &str) -> Option<SocketAddr> {
    lookup_host(server)
        .await
        .ok()?
        .find(|addr| addr.is_ipv4())
}

/// Seal and emit one message. Send errors are swallowed: a failed send
/// is indistinguishable from a lost datagram.
async fn send_message(inner: &Inner, msg: &Message, addr: SocketAddr) {
    let Ok(plaintext) = wire::encode(msg) else {
        return;
    };
    let Ok(sealed) = inner.envelope.seal(&plaintext) else {
        return;
    };
    if let Err(e) = inner.socket.send_to(&sealed, addr).await {
        debug!(%addr, "udp send error: {e}");
    }
}

fn publish(inner: &Inner, event: MeshEvent) {
    // Err here only means nobody is subscribed.
    let _ = inner.events.send(event);
}
