#![cfg_attr(test, allow(clippy::unwrap_used))]

//! Typed overlay messages and the codec boundary.
//!
//! Every datagram plaintext is one tagged JSON object. The tag is
//! validated here, so the dispatcher only ever sees a typed [`Message`];
//! unknown tags fail to decode and the datagram is dropped upstream.
//! Application payloads stay opaque bytes, base64-encoded so binary
//! chunks survive the textual codec.

use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;

use wisp_core::{NodeId, Result, VirtualIp};

/// One gossip entry: a peer record as the sender last saw it. The
/// advertised address is advisory and only ever used as a hole-punch
/// target, never to create a record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerEntry {
    /// Identifier of the advertised node.
    pub node_id: NodeId,
    /// Its overlay address.
    pub virtual_ip: VirtualIp,
    /// Reflexive IP as last observed by the sender.
    pub external_ip: Ipv4Addr,
    /// Reflexive port as last observed by the sender.
    pub external_port: u16,
    /// Sender-local liveness stamp, seconds since the Unix epoch.
    pub last_seen: u64,
    /// Whether the sender considered the peer reachable.
    pub connected: bool,
}

/// Overlay control and data messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    /// Connection initiation; also the hole-punch probe.
    Hello {
        /// Sender identifier.
        node_id: NodeId,
        /// Sender overlay address.
        virtual_ip: VirtualIp,
        /// Network the sender believes it is joining.
        network_id: String,
    },
    /// Handshake reply carrying the responder's peer table for gossip.
    HelloAck {
        /// Responder identifier.
        node_id: NodeId,
        /// Responder overlay address.
        virtual_ip: VirtualIp,
        /// Responder's current peer table snapshot.
        peers: Vec<PeerEntry>,
    },
    /// Periodic liveness refresh; also keeps NAT mappings warm.
    Keepalive {
        /// Sender identifier.
        node_id: NodeId,
        /// Sender overlay address.
        virtual_ip: VirtualIp,
    },
    /// Opaque application payload.
    Data {
        /// Overlay address of the originator.
        from_ip: VirtualIp,
        /// Application bytes, carried base64-encoded.
        #[serde(with = "payload_b64")]
        data: Vec<u8>,
    },
    /// Explicit request for the responder's peer table.
    Discover {
        /// Sender identifier.
        node_id: NodeId,
        /// Sender overlay address.
        virtual_ip: VirtualIp,
    },
    /// Reply to [`Message::Discover`]; gossip only.
    DiscoverResponse {
        /// Responder identifier.
        node_id: NodeId,
        /// Responder overlay address.
        virtual_ip: VirtualIp,
        /// Responder's current peer table snapshot.
        peers: Vec<PeerEntry>,
    },
}

/// Encode a message into datagram plaintext.
pub fn encode(msg: &Message) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(msg)?)
}

/// Decode datagram plaintext into a typed message.
pub fn decode(data: &[u8]) -> Result<Message> {
    Ok(serde_json::from_slice(data)?)
}

mod payload_b64 {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], ser: S) -> Result<S::Ok, S::Error> {
        STANDARD.encode(bytes).serialize(ser)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(de)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}
