#![cfg_attr(test, allow(clippy::unwrap_used))]

//! STUN Binding client (RFC 5389 subset).
//!
//! Only the Binding Request/Response exchange and the XOR-MAPPED-ADDRESS
//! attribute are implemented; that is all reflexive-address discovery
//! needs. The client does not own a socket: it shares the overlay's, and
//! incoming datagrams are routed here by [`is_stun_datagram`] before any
//! decrypt attempt, pairing responses with in-flight transaction ids.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::sync::oneshot;
use tokio::time::timeout;
use tracing::trace;

/// STUN protocol errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StunError {
    /// Malformed or unexpected message.
    #[error("message parse error: {0}")]
    Parse(String),
    /// Socket-level failure.
    #[error("network error: {0}")]
    Network(String),
    /// No binding response arrived in time.
    #[error("timeout waiting for binding response")]
    Timeout,
    /// Only IPv4 mappings are supported.
    #[error("unsupported address family")]
    UnsupportedAddressFamily,
}

/// STUN result alias.
pub type StunResult<T> = Result<T, StunError>;

/// STUN message magic cookie.
const MAGIC_COOKIE: u32 = 0x2112_A442;

const BINDING_REQUEST: u16 = 0x0001;
const BINDING_RESPONSE: u16 = 0x0101;
const ATTR_XOR_MAPPED_ADDRESS: u16 = 0x0020;
const FAMILY_IPV4: u8 = 0x01;
const HEADER_LEN: usize = 20;

pub(crate) type TransactionId = [u8; 12];

/// True when the datagram carries a STUN header: bytes 4..8 hold the
/// magic cookie. Checked before any decrypt attempt so the STUN wait and
/// the overlay receive path never race for each other's traffic.
pub fn is_stun_datagram(data: &[u8]) -> bool {
    data.len() >= HEADER_LEN && data[4..8] == MAGIC_COOKIE.to_be_bytes()
}

pub(crate) fn new_transaction_id() -> TransactionId {
    let mut id = [0u8; 12];
    for byte in &mut id {
        *byte = rand::random();
    }
    id
}

/// Binding Request: header only, no attributes.
pub(crate) fn encode_binding_request(transaction_id: &TransactionId) -> Bytes {
    let mut buf = BytesMut::with_capacity(HEADER_LEN);
    buf.put_u16(BINDING_REQUEST);
    buf.put_u16(0);
    buf.put_u32(MAGIC_COOKIE);
    buf.put_slice(transaction_id);
    buf.freeze()
}

/// Accept a Binding Request and return its transaction id.
pub(crate) fn parse_binding_request(data: &[u8]) -> Option<TransactionId> {
    if !is_stun_datagram(data) {
        return None;
    }
    let mut cursor = data;
    if cursor.get_u16() != BINDING_REQUEST {
        return None;
    }
    let _length = cursor.get_u16();
    let _magic = cursor.get_u32();
    let mut transaction_id = [0u8; 12];
    cursor.copy_to_slice(&mut transaction_id);
    Some(transaction_id)
}

/// Binding Response carrying a single XOR-MAPPED-ADDRESS attribute.
pub(crate) fn encode_binding_response(
    transaction_id: &TransactionId,
    addr: SocketAddr,
) -> StunResult<Bytes> {
    let SocketAddr::V4(v4) = addr else {
        return Err(StunError::UnsupportedAddressFamily);
    };
    let cookie = MAGIC_COOKIE.to_be_bytes();

    let mut buf = BytesMut::with_capacity(HEADER_LEN + 12);
    buf.put_u16(BINDING_RESPONSE);
    buf.put_u16(12); // one attribute: 4-byte TLV header + 8-byte value
    buf.put_u32(MAGIC_COOKIE);
    buf.put_slice(transaction_id);

    buf.put_u16(ATTR_XOR_MAPPED_ADDRESS);
    buf.put_u16(8);
    buf.put_u8(0);
    buf.put_u8(FAMILY_IPV4);
    buf.put_u16(v4.port() ^ ((MAGIC_COOKIE >> 16) as u16));
    for (octet, key) in v4.ip().octets().iter().zip(cookie) {
        buf.put_u8(octet ^ key);
    }
    Ok(buf.freeze())
}

/// Parse a Binding Response, yielding the transaction id and the first
/// XOR-MAPPED-ADDRESS found. Unknown attributes are skipped over their
/// 4-byte-aligned values.
pub(crate) fn parse_binding_response(data: &[u8]) -> StunResult<(TransactionId, SocketAddr)> {
    if data.len() < HEADER_LEN {
        return Err(StunError::Parse("message too short".into()));
    }
    let mut cursor = data;
    let msg_type = cursor.get_u16();
    if msg_type != BINDING_RESPONSE {
        return Err(StunError::Parse(format!(
            "unexpected message type 0x{msg_type:04x}"
        )));
    }
    let length = cursor.get_u16() as usize;
    if cursor.get_u32() != MAGIC_COOKIE {
        return Err(StunError::Parse("invalid magic cookie".into()));
    }
    let mut transaction_id = [0u8; 12];
    cursor.copy_to_slice(&mut transaction_id);

    let mut remaining = length.min(cursor.len());
    while remaining >= 4 {
        let attr_type = cursor.get_u16();
        let attr_len = cursor.get_u16() as usize;
        remaining -= 4;
        if cursor.len() < attr_len {
            return Err(StunError::Parse("truncated attribute".into()));
        }
        if attr_type == ATTR_XOR_MAPPED_ADDRESS {
            let mapped = decode_xor_mapped(&cursor[..attr_len])?;
            return Ok((transaction_id, mapped));
        }
        let padded = (attr_len + 3) & !3;
        let skip = padded.min(cursor.len());
        cursor.advance(skip);
        remaining = remaining.saturating_sub(padded);
    }
    Err(StunError::Parse("no XOR-MAPPED-ADDRESS attribute".into()))
}

/// Decode an XOR-obfuscated IPv4 socket address (RFC 5389 §15.2).
fn decode_xor_mapped(value: &[u8]) -> StunResult<SocketAddr> {
    if value.len() < 8 {
        return Err(StunError::Parse("address attribute too short".into()));
    }
    if value[1] != FAMILY_IPV4 {
        return Err(StunError::UnsupportedAddressFamily);
    }
    let port = u16::from_be_bytes([value[2], value[3]]) ^ ((MAGIC_COOKIE >> 16) as u16);
    let cookie = MAGIC_COOKIE.to_be_bytes();
    let mut octets = [0u8; 4];
    for (i, octet) in octets.iter_mut().enumerate() {
        *octet = value[4 + i] ^ cookie[i];
    }
    Ok(SocketAddr::new(IpAddr::V4(Ipv4Addr::from(octets)), port))
}

/// One-shot binding request over a caller-owned socket.
///
/// Reads the socket exclusively until a response with the matching
/// transaction id arrives or `wait` elapses; non-STUN datagrams received
/// in the window are discarded. Suitable for standalone probes, not for
/// the overlay engine (which must keep receiving peer traffic).
pub async fn binding_request(
    socket: &UdpSocket,
    server: SocketAddr,
    wait: Duration,
) -> StunResult<SocketAddr> {
    let transaction_id = new_transaction_id();
    let request = encode_binding_request(&transaction_id);
    socket
        .send_to(&request, server)
        .await
        .map_err(|e| StunError::Network(e.to_string()))?;

    let deadline = tokio::time::Instant::now() + wait;
    let mut buf = vec![0u8; 1500];
    loop {
        let now = tokio::time::Instant::now();
        if now >= deadline {
            return Err(StunError::Timeout);
        }
        let (len, _) = match timeout(deadline - now, socket.recv_from(&mut buf)).await {
            Ok(Ok(received)) => received,
            Ok(Err(e)) => return Err(StunError::Network(e.to_string())),
            Err(_) => return Err(StunError::Timeout),
        };
        match parse_binding_response(&buf[..len]) {
            Ok((id, mapped)) if id == transaction_id => return Ok(mapped),
            _ => continue,
        }
    }
}

/// Pairs in-flight binding requests with responses handed over by the
/// overlay receive loop.
#[derive(Default)]
pub struct StunResolver {
    pending: Mutex<HashMap<TransactionId, oneshot::Sender<SocketAddr>>>,
}

impl StunResolver {
    /// Fresh resolver with no in-flight requests.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_pending(&self) -> MutexGuard<'_, HashMap<TransactionId, oneshot::Sender<SocketAddr>>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Route one cookie-matched datagram to its waiter. Unmatched or
    /// malformed responses are dropped.
    pub fn dispatch(&self, data: &[u8]) {
        match parse_binding_response(data) {
            Ok((transaction_id, mapped)) => {
                if let Some(waiter) = self.lock_pending().remove(&transaction_id) {
                    let _ = waiter.send(mapped);
                } else {
                    trace!("stun: binding response with no matching transaction");
                }
            }
            Err(e) => trace!("stun: ignoring datagram: {e}"),
        }
    }

    /// Send a Binding Request on the shared socket and await the
    /// response delivered through [`dispatch`](Self::dispatch).
    pub async fn query(
        &self,
        socket: &UdpSocket,
        server: SocketAddr,
        wait: Duration,
    ) -> StunResult<SocketAddr> {
        let transaction_id = new_transaction_id();
        let (tx, rx) = oneshot::channel();
        self.lock_pending().insert(transaction_id, tx);

        let request = encode_binding_request(&transaction_id);
        if let Err(e) = socket.send_to(&request, server).await {
            self.lock_pending().remove(&transaction_id);
            return Err(StunError::Network(e.to_string()));
        }

        match timeout(wait, rx).await {
            Ok(Ok(mapped)) => Ok(mapped),
            Ok(Err(_)) => {
                self.lock_pending().remove(&transaction_id);
                Err(StunError::Network("resolver dropped".into()))
            }
            Err(_) => {
                self.lock_pending().remove(&transaction_id);
                Err(StunError::Timeout)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn binding_request_has_cookie_at_bytes_4_to_8() {
        let request = encode_binding_request(&new_transaction_id());
        assert_eq!(request.len(), HEADER_LEN);
        assert!(is_stun_datagram(&request));
    }

    #[test]
    fn request_roundtrips_transaction_id() {
        let transaction_id = new_transaction_id();
        let request = encode_binding_request(&transaction_id);
        assert_eq!(parse_binding_request(&request), Some(transaction_id));
    }

    #[test]
    fn response_roundtrips_mapped_address() {
        let transaction_id = new_transaction_id();
        let mapped: SocketAddr = "203.0.113.7:41641".parse().unwrap();
        let response = encode_binding_response(&transaction_id, mapped).unwrap();
        assert!(is_stun_datagram(&response));
        let (id, decoded) = parse_binding_response(&response).unwrap();
        assert_eq!(id, transaction_id);
        assert_eq!(decoded, mapped);
    }

    #[test]
    fn short_or_corrupt_responses_are_rejected() {
        assert!(parse_binding_response(&[0u8; 8]).is_err());

        let transaction_id = new_transaction_id();
        let mapped: SocketAddr = "198.51.100.2:9".parse().unwrap();
        let mut response = encode_binding_response(&transaction_id, mapped)
            .unwrap()
            .to_vec();
        response[4] ^= 0xff; // break the cookie
        assert!(parse_binding_response(&response).is_err());
        assert!(!is_stun_datagram(&response));
    }

    #[test]
    fn ipv6_responses_are_unsupported() {
        let transaction_id = new_transaction_id();
        let mapped: SocketAddr = "[::1]:9".parse().unwrap();
        assert_eq!(
            encode_binding_response(&transaction_id, mapped),
            Err(StunError::UnsupportedAddressFamily)
        );
    }

    #[test]
    fn random_bytes_are_not_stun() {
        assert!(!is_stun_datagram(b"not nearly long enough"));
        assert!(!is_stun_datagram(&[0u8; 64]));
    }
}
