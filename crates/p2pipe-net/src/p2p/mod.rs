//! Peer-to-peer connectivity
//!
//! Provides everything needed to find a peer and open a path to it:
//! - STUN client for public endpoint discovery
//! - Local multicast announcements for same-subnet peers
//! - Resolver combining both into candidate endpoints
//! - UDP hole punching driving the transport handshake

pub mod hole_punch;
pub mod mdns;
pub mod peers;
pub mod resolver;
pub mod stun;

pub use hole_punch::{HolePunchConfig, HolePunchResult, HolePuncher};
pub use mdns::{MdnsAnnouncement, MdnsConfig, MdnsDiscovery, RendezvousHash};
pub use peers::{DiscoveredPeer, PeerTable};
pub use resolver::Resolver;
pub use stun::{MappingBehavior, StunClient, StunConfig, StunTransaction, DEFAULT_STUN_SERVERS};
