//! Table of peers seen through local discovery

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::time::{Duration, Instant};

use tracing::debug;

use super::mdns::RendezvousHash;
use crate::endpoint::Endpoint;

/// A peer that announced a rendezvous hash we were looking for
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredPeer {
    /// Sender address of the announcement
    pub address: Ipv4Addr,
    /// Port the peer announced (not the sender port)
    pub port: u16,
    pub rendezvous_hash: RendezvousHash,
    pub last_seen: Instant,
}

impl DiscoveredPeer {
    /// Where to reach the peer's transport
    pub fn endpoint(&self) -> Endpoint {
        Endpoint::new(self.address.octets(), self.port)
    }
}

/// Discovered peers, deduplicated by (endpoint, hash) and expired by age
#[derive(Debug)]
pub struct PeerTable {
    peers: HashMap<(Endpoint, RendezvousHash), DiscoveredPeer>,
    ttl: Duration,
}

impl PeerTable {
    /// Empty table forgetting peers after `ttl`
    pub fn new(ttl: Duration) -> Self {
        Self {
            peers: HashMap::new(),
            ttl,
        }
    }

    /// Record a sighting at `now`, refreshing an existing entry
    pub fn record(
        &mut self,
        address: Ipv4Addr,
        port: u16,
        rendezvous_hash: RendezvousHash,
        now: Instant,
    ) -> DiscoveredPeer {
        let key = (Endpoint::new(address.octets(), port), rendezvous_hash);
        let peer = self
            .peers
            .entry(key)
            .and_modify(|peer| peer.last_seen = now)
            .or_insert_with(|| {
                debug!("New local peer {}:{} for {}", address, port, rendezvous_hash);
                DiscoveredPeer {
                    address,
                    port,
                    rendezvous_hash,
                    last_seen: now,
                }
            });
        peer.clone()
    }

    /// Drop peers not seen within the ttl; returns how many were removed
    pub fn sweep(&mut self, now: Instant) -> usize {
        let ttl = self.ttl;
        let before = self.peers.len();
        self.peers
            .retain(|_, peer| now.saturating_duration_since(peer.last_seen) < ttl);
        let removed = before - self.peers.len();
        if removed > 0 {
            debug!("Expired {} local peers", removed);
        }
        removed
    }

    /// Most recently seen peer announcing `hash`
    pub fn find(&self, hash: &RendezvousHash) -> Option<&DiscoveredPeer> {
        self.peers
            .values()
            .filter(|peer| peer.rendezvous_hash == *hash)
            .max_by_key(|peer| peer.last_seen)
    }

    /// All known peers
    pub fn iter(&self) -> impl Iterator<Item = &DiscoveredPeer> {
        self.peers.values()
    }

    /// Number of known peers
    pub fn len(&self) -> usize {
        self.peers.len()
    }

    /// No peers known
    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}
