#![cfg_attr(test, allow(clippy::unwrap_used))]

//! In-memory peer registry with liveness metadata.
//!
//! Single writer: only the overlay engine mutates the table. Readers get
//! cloned snapshots, never references into it. Lookup by virtual IP is a
//! linear scan; peer counts stay in the tens.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use wisp_core::{NodeId, VirtualIp};

use crate::wire::PeerEntry;

/// Liveness record for one remote node, keyed by node id.
#[derive(Debug, Clone)]
pub struct PeerRecord {
    /// Remote node identifier.
    pub node_id: NodeId,
    /// Remote overlay address.
    pub virtual_ip: VirtualIp,
    /// Last observed reflexive address; refreshed from the UDP source of
    /// every authenticated datagram, so NAT rebinds follow the traffic.
    pub addr: SocketAddr,
    /// Monotonic stamp of the last authenticated datagram.
    pub last_seen: Instant,
    /// Reachability flag carried into gossip.
    pub connected: bool,
}

impl PeerRecord {
    /// Wire form carried inside `hello_ack` / `discover_response` gossip.
    pub fn to_entry(&self) -> PeerEntry {
        let external_ip = match self.addr.ip() {
            IpAddr::V4(v4) => v4,
            IpAddr::V6(_) => Ipv4Addr::UNSPECIFIED,
        };
        PeerEntry {
            node_id: self.node_id.clone(),
            virtual_ip: self.virtual_ip,
            external_ip,
            external_port: self.addr.port(),
            last_seen: unix_seconds(self.last_seen),
            connected: self.connected,
        }
    }
}

/// Approximate wall-clock rendering of a monotonic stamp, for gossip only.
fn unix_seconds(last_seen: Instant) -> u64 {
    SystemTime::now()
        .checked_sub(last_seen.elapsed())
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Registry of known peers. At most one record per node id.
#[derive(Debug, Default)]
pub struct PeerTable {
    peers: HashMap<NodeId, PeerRecord>,
}

impl PeerTable {
    /// Empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or refresh a record. Returns true when the node was
    /// previously unknown.
    pub fn upsert(&mut self, record: PeerRecord) -> bool {
        self.peers.insert(record.node_id.clone(), record).is_none()
    }

    /// Refresh liveness and observed address for a known peer; unknown
    /// senders are ignored. Returns whether the peer was known.
    pub fn touch(&mut self, node_id: &NodeId, addr: SocketAddr, now: Instant) -> bool {
        match self.peers.get_mut(node_id) {
            Some(record) => {
                record.addr = addr;
                record.last_seen = now;
                true
            }
            None => false,
        }
    }

    /// Whether a record exists for `node_id`.
    pub fn contains(&self, node_id: &NodeId) -> bool {
        self.peers.contains_key(node_id)
    }

    /// Find a peer by its overlay address.
    pub fn find_by_virtual_ip(&self, virtual_ip: VirtualIp) -> Option<&PeerRecord> {
        self.peers.values().find(|p| p.virtual_ip == virtual_ip)
    }

    /// Remove every record idle longer than `timeout`, returning the
    /// evicted records for disconnect notification.
    pub fn expire(&mut self, now: Instant, timeout: Duration) -> Vec<PeerRecord> {
        let expired: Vec<NodeId> = self
            .peers
            .iter()
            .filter(|(_, record)| now.duration_since(record.last_seen) > timeout)
            .map(|(node_id, _)| node_id.clone())
            .collect();
        expired
            .iter()
            .filter_map(|node_id| self.peers.remove(node_id))
            .collect()
    }

    /// Cloned view of the current records.
    pub fn snapshot(&self) -> Vec<PeerRecord> {
        self.peers.values().cloned().collect()
    }

    /// Gossip view of the current records.
    pub fn entries(&self) -> Vec<PeerEntry> {
        self.peers.values().map(PeerRecord::to_entry).collect()
    }

    /// Number of known peers.
    pub fn len(&self) -> usize {
        self.peers.len()
    }

    /// Whether the table is empty.
    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(node_id: &NodeId, port: u16) -> PeerRecord {
        PeerRecord {
            node_id: node_id.clone(),
            virtual_ip: VirtualIp::derive("net", node_id),
            addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port),
            last_seen: Instant::now(),
            connected: true,
        }
    }

    #[test]
    fn upsert_keeps_one_record_per_node() {
        let mut table = PeerTable::new();
        let id = NodeId::generate("s");
        assert!(table.upsert(record(&id, 1000)));
        assert!(!table.upsert(record(&id, 2000)));
        assert_eq!(table.len(), 1);
        assert_eq!(table.snapshot()[0].addr.port(), 2000);
    }

    #[test]
    fn touch_ignores_unknown_senders() {
        let mut table = PeerTable::new();
        let id = NodeId::generate("s");
        assert!(!table.touch(
            &id,
            "127.0.0.1:9".parse().unwrap(),
            Instant::now()
        ));
        assert!(table.is_empty());
    }

    #[test]
    fn touch_refreshes_address_and_liveness() {
        let mut table = PeerTable::new();
        let id = NodeId::generate("s");
        table.upsert(record(&id, 1000));
        let rebound: SocketAddr = "127.0.0.1:4242".parse().unwrap();
        assert!(table.touch(&id, rebound, Instant::now()));
        assert_eq!(table.snapshot()[0].addr, rebound);
    }

    #[test]
    fn expire_evicts_only_idle_records() {
        let mut table = PeerTable::new();
        let stale = NodeId::generate("s");
        let fresh = NodeId::generate("s");
        let mut old = record(&stale, 1000);
        old.last_seen = Instant::now() - Duration::from_secs(120);
        table.upsert(old);
        table.upsert(record(&fresh, 2000));

        let evicted = table.expire(Instant::now(), Duration::from_secs(60));
        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].node_id, stale);
        assert_eq!(table.len(), 1);
        assert!(table.contains(&fresh));
    }

    #[test]
    fn find_by_virtual_ip_scans_records() {
        let mut table = PeerTable::new();
        let id = NodeId::generate("s");
        let rec = record(&id, 1000);
        let vip = rec.virtual_ip;
        table.upsert(rec);
        assert!(table.find_by_virtual_ip(vip).is_some());

        let mut absent = vip.addr().octets();
        absent[3] = absent[3].wrapping_add(1);
        assert!(table
            .find_by_virtual_ip(VirtualIp(Ipv4Addr::from(absent)))
            .is_none());
    }
}
