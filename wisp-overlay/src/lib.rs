#![forbid(unsafe_code)]

//! Wisp mesh overlay.
//!
//! * Single `UdpSocket` shared by the engine and the STUN client, so the
//!   reflexive port peers punch toward is the port we actually listen on.
//! * Async receive loop demultiplexes STUN by magic cookie, then
//!   authenticates everything else with the network envelope.
//! * Keepalive loop refreshes the reflexive address, evicts silent peers,
//!   and keeps NAT mappings warm.

pub mod node;
pub mod peers;
pub mod stun;
pub mod stun_server;
pub mod wire;

pub use node::{MeshEvent, MeshNode, Timing};
pub use peers::{PeerRecord, PeerTable};
pub use stun_server::StunServer;
