//! STUN Client for public endpoint discovery
//!
//! Implements the RFC 5389 Binding transaction:
//! - Discovering the public IP and port (server reflexive address)
//! - Comparing mappings from two servers to spot endpoint-dependent NATs
//!
//! Only IPv4 MAPPED-ADDRESS / XOR-MAPPED-ADDRESS are understood.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use tokio::net::UdpSocket;
use tokio::time::timeout_at;
use tracing::{debug, info, warn};

use crate::endpoint::Endpoint;
use crate::error::{NetworkError, NetworkResult};

/// STUN message types (RFC 5389)
const STUN_BINDING_REQUEST: u16 = 0x0001;
const STUN_BINDING_RESPONSE: u16 = 0x0101;

/// STUN attributes
const ATTR_MAPPED_ADDRESS: u16 = 0x0001;
const ATTR_XOR_MAPPED_ADDRESS: u16 = 0x0020;

const FAMILY_IPV4: u8 = 0x01;

/// STUN magic cookie (RFC 5389)
const MAGIC_COOKIE: u32 = 0x2112A442;

const STUN_HEADER_LEN: usize = 20;

/// Default STUN servers
pub const DEFAULT_STUN_SERVERS: &[&str] = &[
    "stun.l.google.com:19302",
    "stun1.l.google.com:19302",
    "stun.cloudflare.com:3478",
];

/// STUN settings
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct StunConfig {
    /// Servers tried in order
    pub servers: Vec<String>,

    /// How long to wait for each server's answer
    pub timeout: Duration,
}

impl Default for StunConfig {
    fn default() -> Self {
        Self {
            servers: DEFAULT_STUN_SERVERS.iter().map(|s| s.to_string()).collect(),
            timeout: Duration::from_secs(3),
        }
    }
}

/// One outstanding binding request
#[derive(Debug, Clone)]
pub struct StunTransaction {
    /// Random 96-bit transaction id
    pub id: [u8; 12],
    /// Server the request went to
    pub server: SocketAddr,
    /// When the request was sent
    pub sent_at: Instant,
}

impl StunTransaction {
    /// Start a transaction with a fresh random id
    pub fn new(server: SocketAddr) -> NetworkResult<Self> {
        let mut id = [0u8; 12];
        getrandom::getrandom(&mut id)
            .map_err(|e| NetworkError::Io(std::io::Error::new(std::io::ErrorKind::Other, e.to_string())))?;
        Ok(Self {
            id,
            server,
            sent_at: Instant::now(),
        })
    }

    /// Binding request bytes for this transaction
    pub fn request(&self) -> BytesMut {
        build_binding_request(&self.id)
    }
}

/// Whether the NAT keeps one public mapping for every destination
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MappingBehavior {
    /// Public endpoint equals the local one
    NoNat,
    /// Same public endpoint towards different servers; hole punching works
    EndpointIndependent,
    /// Different public endpoint per destination (symmetric NAT)
    EndpointDependent,
}

/// STUN client for NAT traversal
pub struct StunClient {
    socket: UdpSocket,
    timeout: Duration,
}

impl StunClient {
    /// Create new STUN client bound to specified address
    pub async fn new(bind_addr: &str) -> NetworkResult<Self> {
        let socket = UdpSocket::bind(bind_addr).await?;
        Ok(Self::from_socket(socket))
    }

    /// Create from existing tokio socket
    pub fn from_socket(socket: UdpSocket) -> Self {
        Self {
            socket,
            timeout: StunConfig::default().timeout,
        }
    }

    /// Create from a std socket (e.g. a clone of the transport's socket, so the
    /// learned mapping is the one the peer must punch towards)
    ///
    /// Must be called from within a tokio runtime.
    pub fn from_std(socket: std::net::UdpSocket) -> NetworkResult<Self> {
        socket.set_nonblocking(true)?;
        Ok(Self::from_socket(UdpSocket::from_std(socket)?))
    }

    /// Override the per-request timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Get local address
    pub fn local_addr(&self) -> NetworkResult<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Perform a binding request and return our public endpoint as seen by `server`
    pub async fn query(&self, server: &str) -> NetworkResult<Endpoint> {
        let server_addr = resolve_server(server).await?;
        let transaction = StunTransaction::new(server_addr)?;

        self.socket.send_to(&transaction.request(), server_addr).await?;
        debug!("Sent STUN request to {} ({})", server, server_addr);

        let deadline = tokio::time::Instant::from_std(transaction.sent_at + self.timeout);
        let mut buf = [0u8; 576]; // STUN messages should fit in 576 bytes

        loop {
            let (len, from) = timeout_at(deadline, self.socket.recv_from(&mut buf))
                .await
                .map_err(|_| NetworkError::TimeoutWithMessage(format!("STUN request to {} timed out", server)))??;

            if from != server_addr {
                debug!("Ignoring {} bytes from {} while waiting for {}", len, from, server_addr);
                continue;
            }

            debug!(
                "Received STUN response from {} ({} bytes, {:?})",
                from,
                len,
                transaction.sent_at.elapsed()
            );
            return parse_binding_response(&buf[..len], &transaction.id);
        }
    }

    /// Try each server in order; the first success wins
    pub async fn query_first<S: AsRef<str>>(&self, servers: &[S]) -> NetworkResult<Endpoint> {
        for server in servers {
            let server = server.as_ref();
            match self.query(server).await {
                Ok(endpoint) => {
                    info!("Public endpoint {} (via {})", endpoint, server);
                    return Ok(endpoint);
                }
                Err(e) => warn!("STUN server {} failed: {}", server, e),
            }
        }

        Err(NetworkError::AllDiscoveryServersFailed)
    }

    /// Compare the mappings two different servers report for this socket
    pub async fn mapping_behavior<S: AsRef<str>>(&self, servers: &[S]) -> NetworkResult<MappingBehavior> {
        let mut answers = Vec::with_capacity(2);
        for server in servers {
            match self.query(server.as_ref()).await {
                Ok(endpoint) => answers.push(endpoint),
                Err(e) => debug!("Mapping test against {} failed: {}", server.as_ref(), e),
            }
            if answers.len() == 2 {
                break;
            }
        }

        let first = *answers.first().ok_or(NetworkError::AllDiscoveryServersFailed)?;
        let local = self.local_addr()?;
        if Endpoint::try_from(local).is_ok_and(|local| local == first) {
            return Ok(MappingBehavior::NoNat);
        }

        match answers.get(1) {
            Some(second) if *second != first => {
                info!("Endpoint-dependent mapping: {} vs {}", first, second);
                Ok(MappingBehavior::EndpointDependent)
            }
            Some(_) => Ok(MappingBehavior::EndpointIndependent),
            None => Err(NetworkError::AllDiscoveryServersFailed),
        }
    }
}

/// Resolve `host:port` (literal or DNS) to an IPv4 socket address
async fn resolve_server(server: &str) -> NetworkResult<SocketAddr> {
    if let Ok(addr) = server.parse::<SocketAddr>() {
        return Ok(addr);
    }

    tokio::net::lookup_host(server)
        .await
        .map_err(|e| NetworkError::ConfigError(format!("Failed to resolve STUN server '{}': {}", server, e)))?
        .find(SocketAddr::is_ipv4)
        .ok_or_else(|| NetworkError::ConfigError(format!("No IPv4 address for STUN server: {}", server)))
}

/// Build STUN binding request packet
fn build_binding_request(transaction_id: &[u8; 12]) -> BytesMut {
    let mut packet = BytesMut::with_capacity(STUN_HEADER_LEN);
    packet.put_u16(STUN_BINDING_REQUEST);
    packet.put_u16(0); // no attributes
    packet.put_u32(MAGIC_COOKIE);
    packet.put_slice(transaction_id);
    packet
}

/// Parse STUN binding response and extract the reflexive endpoint
fn parse_binding_response(data: &[u8], expected_txn_id: &[u8; 12]) -> NetworkResult<Endpoint> {
    if data.len() < STUN_HEADER_LEN {
        return Err(NetworkError::Protocol("STUN response too short".into()));
    }

    let mut header = &data[..STUN_HEADER_LEN];
    let msg_type = header.get_u16();
    let msg_len = header.get_u16() as usize;
    let magic = header.get_u32();
    let txn_id = header;

    if magic != MAGIC_COOKIE {
        return Err(NetworkError::Protocol("Invalid STUN magic cookie".into()));
    }
    if txn_id != expected_txn_id {
        return Err(NetworkError::TransactionMismatch);
    }
    if msg_type != STUN_BINDING_RESPONSE {
        return Err(NetworkError::NotBindingResponse(msg_type));
    }
    if data.len() < STUN_HEADER_LEN + msg_len {
        return Err(NetworkError::Protocol("STUN message truncated".into()));
    }

    let mut mapped: Option<Endpoint> = None;
    let mut xor_mapped: Option<Endpoint> = None;

    let mut attrs = &data[STUN_HEADER_LEN..STUN_HEADER_LEN + msg_len];
    while attrs.remaining() >= 4 {
        let attr_type = attrs.get_u16();
        let attr_len = attrs.get_u16() as usize;
        if attr_len > attrs.remaining() {
            break;
        }

        let value = &attrs[..attr_len];
        match attr_type {
            ATTR_MAPPED_ADDRESS => mapped = mapped.or(parse_address(value, false)),
            ATTR_XOR_MAPPED_ADDRESS => xor_mapped = xor_mapped.or(parse_address(value, true)),
            _ => {}
        }

        // Values are padded to a 4-byte boundary
        let padded = (attr_len + 3) & !3;
        attrs.advance(padded.min(attrs.remaining()));
    }

    xor_mapped.or(mapped).ok_or(NetworkError::MissingMappedAddress)
}

/// Parse MAPPED-ADDRESS or XOR-MAPPED-ADDRESS value (IPv4 only)
fn parse_address(mut value: &[u8], xor: bool) -> Option<Endpoint> {
    if value.len() < 8 {
        return None;
    }

    value.advance(1); // reserved
    if value.get_u8() != FAMILY_IPV4 {
        return None;
    }
    let mut port = value.get_u16();
    let mut address = value.get_u32();

    if xor {
        port ^= (MAGIC_COOKIE >> 16) as u16;
        address ^= MAGIC_COOKIE;
    }

    Some(Endpoint::new(address.to_be_bytes(), port))
}

/// Binding success response carrying `mapped` as XOR-MAPPED-ADDRESS
#[cfg(test)]
pub(crate) fn build_binding_response(transaction_id: &[u8], mapped: Endpoint) -> BytesMut {
    let mut packet = BytesMut::with_capacity(STUN_HEADER_LEN + 12);
    packet.put_u16(STUN_BINDING_RESPONSE);
    packet.put_u16(12);
    packet.put_u32(MAGIC_COOKIE);
    packet.put_slice(&transaction_id[..12]);
    packet.put_u16(ATTR_XOR_MAPPED_ADDRESS);
    packet.put_u16(8);
    packet.put_u8(0);
    packet.put_u8(FAMILY_IPV4);
    packet.put_u16(mapped.port ^ (MAGIC_COOKIE >> 16) as u16);
    packet.put_u32(u32::from_be_bytes(mapped.address) ^ MAGIC_COOKIE);
    packet
}
