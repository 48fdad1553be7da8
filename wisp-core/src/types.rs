#![cfg_attr(test, allow(clippy::unwrap_used))]

//! Typed node identifiers.
//!
//! A node is identified by an ephemeral [`NodeId`] and addressed inside
//! the overlay by a [`VirtualIp`] derived deterministically from the
//! network name and the node id. Neither survives a restart.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::{fmt, net::Ipv4Addr};

/// Opaque 128-bit node identifier rendered as 16 lowercase hex characters.
///
/// Generated once at startup from the network secret and a random nonce;
/// uniqueness is probabilistic and identity does not persist across
/// restarts.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    /// Generate a fresh identifier for this process.
    pub fn generate(secret: &str) -> Self {
        let nonce: [u8; 8] = rand::random();
        let mut hasher = Sha256::new();
        hasher.update(secret.as_bytes());
        hasher.update(hex::encode(nonce).as_bytes());
        let digest = hasher.finalize();
        Self(hex::encode(&digest[..8]))
    }

    /// View the identifier as its hex rendering.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Overlay address in the `10.N.X.Y` space.
///
/// `N` is pinned by the network name, `X.Y` by the node id, so every
/// member of a network lands in the same /16 and a node's address is a
/// pure function of `(network_id, node_id)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VirtualIp(pub Ipv4Addr);

impl VirtualIp {
    /// Derive the overlay address for `node_id` inside `network_id`.
    pub fn derive(network_id: &str, node_id: &NodeId) -> Self {
        let net = Sha256::digest(network_id.as_bytes());
        let node = Sha256::digest(node_id.as_str().as_bytes());
        Self(Ipv4Addr::new(10, net[0], node[0], node[1]))
    }

    /// The underlying IPv4 address.
    pub fn addr(&self) -> Ipv4Addr {
        self.0
    }
}

impl fmt::Display for VirtualIp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Ipv4Addr> for VirtualIp {
    fn from(addr: Ipv4Addr) -> Self {
        Self(addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_id_is_16_hex_chars() {
        let id = NodeId::generate("secret");
        assert_eq!(id.as_str().len(), 16);
        assert!(id.as_str().chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(id.as_str(), id.as_str().to_lowercase());
    }

    #[test]
    fn node_ids_differ_across_generations() {
        let a = NodeId::generate("secret");
        let b = NodeId::generate("secret");
        assert_ne!(a, b);
    }

    #[test]
    fn virtual_ip_is_pure_function_of_inputs() {
        let id = NodeId::generate("s");
        let a = VirtualIp::derive("net", &id);
        let b = VirtualIp::derive("net", &id);
        assert_eq!(a, b);
        assert_eq!(a.addr().octets()[0], 10);
    }

    #[test]
    fn same_network_shares_second_octet() {
        let a = VirtualIp::derive("net", &NodeId::generate("s"));
        let b = VirtualIp::derive("net", &NodeId::generate("s"));
        assert_eq!(a.addr().octets()[1], b.addr().octets()[1]);
    }

    #[test]
    fn node_id_serializes_as_bare_string() {
        let id = NodeId::generate("s");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{}\"", id.as_str()));
    }

    #[test]
    fn virtual_ip_serializes_as_dotted_quad() {
        let vip = VirtualIp(Ipv4Addr::new(10, 1, 2, 3));
        assert_eq!(serde_json::to_string(&vip).unwrap(), "\"10.1.2.3\"");
        let back: VirtualIp = serde_json::from_str("\"10.1.2.3\"").unwrap();
        assert_eq!(back, vip);
    }
}
