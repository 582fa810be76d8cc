//! p2pipe network layer
//!
//! Direct, ordered, reliable byte streams between two hosts over plain UDP:
//! - Reliable transport (handshake, sliding window, retransmission)
//! - Public endpoint discovery via STUN
//! - Same-subnet discovery via multicast announcements
//! - NAT hole punching

pub mod endpoint;
pub mod error;
pub mod p2p;
pub mod packet;
pub mod transport;

pub use endpoint::Endpoint;
pub use error::{NetworkError, NetworkResult};
pub use p2p::{
    DiscoveredPeer, HolePunchConfig, HolePunchResult, HolePuncher, MdnsConfig, MdnsDiscovery,
    RendezvousHash, Resolver, StunClient, StunConfig,
};
pub use packet::{Packet, PacketFlags, PacketHeader};
pub use transport::{ConnectionState, ReliableTransport, TransportConfig, TransportStats};

use serde::{Deserialize, Serialize};

/// Network configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Local UDP port for the transport (0 = ephemeral)
    pub listen_port: u16,

    /// Reliable transport tuning
    pub transport: TransportConfig,

    /// STUN servers and timeout
    pub stun: StunConfig,

    /// Local multicast discovery
    pub mdns: MdnsConfig,

    /// Hole punch pacing
    pub hole_punch: HolePunchConfig,
}

impl NetworkConfig {
    /// Validate configuration
    pub fn validate(&self) -> NetworkResult<()> {
        self.transport.validate()?;

        if self.stun.servers.is_empty() {
            return Err(NetworkError::ConfigError("At least one STUN server required".into()));
        }
        if self.stun.timeout.is_zero() {
            return Err(NetworkError::ConfigError("STUN timeout must be non-zero".into()));
        }
        if self.hole_punch.max_attempts == 0 {
            return Err(NetworkError::ConfigError("Hole punch needs at least one attempt".into()));
        }
        if !self.mdns.group.is_multicast() {
            return Err(NetworkError::ConfigError(format!(
                "{} is not a multicast address",
                self.mdns.group
            )));
        }

        Ok(())
    }
}
