//! Same-subnet peer discovery over link-local multicast
//!
//! Peers sharing a rendezvous hash find each other without any server:
//! each side periodically multicasts an 18-byte announcement
//! (`hash(16) | port(2, BE)`) to the group and listens for the other's.
//! The payload is private to p2pipe; it is not a DNS-SD record even though it
//! travels over the mDNS group and port.

use std::fmt;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket};
use std::str::FromStr;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use socket2::{Domain, Protocol, Socket, Type};
use tracing::{debug, info, trace, warn};

use super::peers::{DiscoveredPeer, PeerTable};
use crate::error::{NetworkError, NetworkResult};

/// Standard mDNS IPv4 group
pub const MDNS_GROUP: Ipv4Addr = Ipv4Addr::new(224, 0, 0, 251);

/// Standard mDNS port
pub const MDNS_PORT: u16 = 5353;

/// Announcement wire size
pub const ANNOUNCEMENT_LEN: usize = 18;

/// Shared identifier both peers derive ahead of time
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct RendezvousHash([u8; 16]);

impl RendezvousHash {
    /// Wrap raw hash bytes
    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    /// First 16 bytes of BLAKE3(code)
    pub fn from_code(code: &str) -> Self {
        let digest = blake3::hash(code.as_bytes());
        let mut bytes = [0u8; 16];
        bytes.copy_from_slice(&digest.as_bytes()[..16]);
        Self(bytes)
    }

    /// Raw hash bytes
    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl fmt::Display for RendezvousHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for RendezvousHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RendezvousHash({})", hex::encode(&self.0[..4]))
    }
}

impl FromStr for RendezvousHash {
    type Err = NetworkError;

    fn from_str(s: &str) -> NetworkResult<Self> {
        let mut bytes = [0u8; 16];
        hex::decode_to_slice(s, &mut bytes)
            .map_err(|e| NetworkError::ConfigError(format!("Invalid rendezvous hash '{}': {}", s, e)))?;
        Ok(Self(bytes))
    }
}

/// Local discovery settings
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct MdnsConfig {
    /// Multicast group
    pub group: Ipv4Addr,

    /// Group port (0 picks an ephemeral port, useful for tests)
    pub port: u16,

    /// Interface address used to join and send (unspecified = kernel default)
    pub interface: Ipv4Addr,

    /// How long an announcement keeps being re-broadcast
    pub announcement_ttl: Duration,

    /// Age after which a silent peer is forgotten
    pub peer_ttl: Duration,

    /// IP TTL of outgoing announcements
    pub multicast_ttl: u32,
}

impl Default for MdnsConfig {
    fn default() -> Self {
        Self {
            group: MDNS_GROUP,
            port: MDNS_PORT,
            interface: Ipv4Addr::UNSPECIFIED,
            announcement_ttl: Duration::from_secs(300),
            peer_ttl: Duration::from_secs(60),
            multicast_ttl: 1,
        }
    }
}

/// What we are telling the local network
#[derive(Debug, Clone)]
pub struct MdnsAnnouncement {
    /// Hash peers match against
    pub rendezvous_hash: RendezvousHash,
    /// Port our transport listens on
    pub port: u16,
    /// How long to keep re-broadcasting
    pub ttl: Duration,
    /// When the announcement was made
    pub made_at: Instant,
}

impl MdnsAnnouncement {
    /// Announce `rendezvous_hash` reachable on `port`, starting now
    pub fn new(rendezvous_hash: RendezvousHash, port: u16, ttl: Duration) -> Self {
        Self {
            rendezvous_hash,
            port,
            ttl,
            made_at: Instant::now(),
        }
    }

    /// Still worth re-broadcasting at `now`
    pub fn is_active(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.made_at) < self.ttl
    }

    /// Wire form: hash(16) | port(2, big-endian)
    pub fn encode(&self) -> [u8; ANNOUNCEMENT_LEN] {
        let mut out = [0u8; ANNOUNCEMENT_LEN];
        out[..16].copy_from_slice(self.rendezvous_hash.as_bytes());
        out[16..].copy_from_slice(&self.port.to_be_bytes());
        out
    }
}

/// Parse `hash(16) | port(2)`; trailing bytes are ignored
pub fn parse_announcement(data: &[u8]) -> Option<(RendezvousHash, u16)> {
    if data.len() < ANNOUNCEMENT_LEN {
        return None;
    }
    let mut hash = [0u8; 16];
    hash.copy_from_slice(&data[..16]);
    let port = u16::from_be_bytes([data[16], data[17]]);
    Some((RendezvousHash(hash), port))
}

/// Multicast announce/listen endpoint
pub struct MdnsDiscovery {
    recv_socket: UdpSocket,
    send_socket: UdpSocket,
    send_port: u16,
    group_addr: SocketAddr,
    config: MdnsConfig,
    announcement: Option<MdnsAnnouncement>,
    peers: PeerTable,
}

impl MdnsDiscovery {
    /// Bind the group port, join the group, and open the send socket
    pub fn new(config: MdnsConfig) -> NetworkResult<Self> {
        let recv = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        recv.set_reuse_address(true)?;
        #[cfg(unix)]
        recv.set_reuse_port(true)?;
        recv.bind(&SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, config.port).into())?;
        recv.set_nonblocking(true)?;

        if let Err(e) = recv.join_multicast_v4(&config.group, &config.interface) {
            // Still usable for unicast announcements; multicast peers won't be heard
            warn!("Failed to join multicast group {}: {}", config.group, e);
        }

        let recv_socket: UdpSocket = recv.into();
        let port = recv_socket.local_addr()?.port();

        let send = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        send.set_multicast_loop_v4(true)?;
        send.set_multicast_ttl_v4(config.multicast_ttl)?;
        if !config.interface.is_unspecified() {
            send.set_multicast_if_v4(&config.interface)?;
        }
        send.bind(&SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0).into())?;
        send.set_nonblocking(true)?;

        let send_socket: UdpSocket = send.into();
        let send_port = send_socket.local_addr()?.port();

        debug!(
            "Local discovery listening on {}:{} (send port {})",
            config.group, port, send_port
        );

        Ok(Self {
            recv_socket,
            send_socket,
            send_port,
            group_addr: SocketAddr::V4(SocketAddrV4::new(config.group, port)),
            peers: PeerTable::new(config.peer_ttl),
            config,
            announcement: None,
        })
    }

    /// Port the receive socket is bound to
    pub fn port(&self) -> u16 {
        self.group_addr.port()
    }

    /// Start announcing `hash` with our transport `port`, broadcasting once now.
    ///
    /// A failed broadcast (e.g. no multicast route yet) is logged and retried
    /// by the next [`MdnsDiscovery::poll`].
    pub fn announce(&mut self, hash: RendezvousHash, port: u16) {
        let announcement = MdnsAnnouncement::new(hash, port, self.config.announcement_ttl);
        info!("Announcing {} on port {} to the local network", hash, port);
        if let Err(e) = self.send_socket.send_to(&announcement.encode(), self.group_addr) {
            warn!("Announcement to {} failed: {}", self.group_addr, e);
        }
        self.announcement = Some(announcement);
    }

    /// Stop re-broadcasting
    pub fn stop_announcing(&mut self) {
        self.announcement = None;
    }

    /// Current announcement, if any
    pub fn announcement(&self) -> Option<&MdnsAnnouncement> {
        self.announcement.as_ref()
    }

    /// Drain waiting announcements and return the first peer announcing `target`.
    ///
    /// When nothing matched, the active announcement (if any) is re-sent.
    pub fn poll(&mut self, target: &RendezvousHash) -> NetworkResult<Option<DiscoveredPeer>> {
        let now = Instant::now();
        self.peers.sweep(now);

        let mut buf = [0u8; 512];
        loop {
            let (len, from) = match self.recv_socket.recv_from(&mut buf) {
                Ok(received) => received,
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e.into()),
            };

            let SocketAddr::V4(from) = from else {
                continue;
            };
            let Some((hash, port)) = parse_announcement(&buf[..len]) else {
                trace!("Ignoring {} byte datagram from {}", len, from);
                continue;
            };
            if hash != *target {
                continue;
            }
            if self.is_own(&from, port) {
                continue;
            }

            let peer = self.peers.record(*from.ip(), port, hash, now);
            info!("Found local peer {} for {}", peer.endpoint(), hash);
            return Ok(Some(peer));
        }

        self.reannounce(now);
        Ok(None)
    }

    /// Peers seen so far
    pub fn peers(&self) -> &PeerTable {
        &self.peers
    }

    fn is_own(&self, from: &SocketAddrV4, port: u16) -> bool {
        from.port() == self.send_port
            && self
                .announcement
                .as_ref()
                .is_some_and(|a| a.port == port)
    }

    fn reannounce(&mut self, now: Instant) {
        let Some(announcement) = &self.announcement else {
            return;
        };
        if !announcement.is_active(now) {
            debug!("Announcement for {} expired", announcement.rendezvous_hash);
            self.announcement = None;
            return;
        }
        // Best effort; the next poll tries again
        if let Err(e) = self.send_socket.send_to(&announcement.encode(), self.group_addr) {
            trace!("Re-announce failed: {}", e);
        }
    }
}
