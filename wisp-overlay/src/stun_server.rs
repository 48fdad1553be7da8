#![cfg_attr(test, allow(clippy::unwrap_used))]

//! Minimal STUN Binding responder (RFC 5389 subset).
//!
//! Answers every valid Binding Request with a Binding Response carrying
//! XOR-MAPPED-ADDRESS of the observed source. IPv4 only; anything else on
//! the socket is ignored. The overlay never starts one of these itself;
//! integration tests use it to exercise reflexive discovery on loopback.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::stun;

/// Background binding responder bound to one UDP socket.
pub struct StunServer {
    socket: Arc<UdpSocket>,
    task: JoinHandle<()>,
}

impl StunServer {
    /// Bind and start answering. The responder runs until dropped.
    pub async fn bind(addr: SocketAddr) -> std::io::Result<Self> {
        let socket = Arc::new(UdpSocket::bind(addr).await?);
        info!(addr = %socket.local_addr()?, "stun responder listening");

        let rx = socket.clone();
        let task = tokio::spawn(async move {
            let mut buf = vec![0u8; 1500];
            loop {
                let (len, src) = match rx.recv_from(&mut buf).await {
                    Ok(received) => received,
                    Err(e) => {
                        debug!("stun responder recv error: {e}");
                        continue;
                    }
                };
                let Some(transaction_id) = stun::parse_binding_request(&buf[..len]) else {
                    continue;
                };
                if let Ok(response) = stun::encode_binding_response(&transaction_id, src) {
                    let _ = rx.send_to(&response, src).await;
                }
            }
        });

        Ok(Self { socket, task })
    }

    /// Address the responder is listening on.
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }
}

impl Drop for StunServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}
