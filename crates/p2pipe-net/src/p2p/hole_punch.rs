//! UDP Hole Punching Implementation
//!
//! Both peers call [`HolePuncher::punch`] towards each other's public endpoint
//! at roughly the same time. Every attempt sends a fresh SYN, which opens (or
//! refreshes) the outbound mapping in our NAT; once the peer's SYN gets through
//! the transport completes its handshake and punching stops.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::endpoint::Endpoint;
use crate::error::{NetworkError, NetworkResult};
use crate::transport::ReliableTransport;

/// Result of a successful hole punch
#[derive(Debug, Clone)]
pub struct HolePunchResult {
    /// Peer the transport is now connected to
    pub peer: Endpoint,
    /// Number of attempts needed
    pub attempts: u32,
    /// Time from the first SYN to Connected
    pub elapsed: Duration,
}

/// Configuration for hole punching
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HolePunchConfig {
    /// Maximum number of punch attempts
    pub max_attempts: u32,
    /// Delay between punch attempts
    pub punch_interval: Duration,
}

impl Default for HolePunchConfig {
    fn default() -> Self {
        Self {
            max_attempts: 50,
            punch_interval: Duration::from_millis(100),
        }
    }
}

impl HolePunchConfig {
    /// Upper bound on how long a punch can take
    pub fn total_duration(&self) -> Duration {
        self.punch_interval * self.max_attempts
    }
}

/// UDP Hole Puncher
#[derive(Debug, Clone, Default)]
pub struct HolePuncher {
    config: HolePunchConfig,
}

impl HolePuncher {
    pub fn new(config: HolePunchConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &HolePunchConfig {
        &self.config
    }

    /// Drive `transport` towards Connected with `remote`.
    ///
    /// Returns `HolePunchFailed` once all attempts are used, or `Cancelled` as
    /// soon as `cancel` fires.
    pub async fn punch(
        &self,
        transport: &mut ReliableTransport,
        remote: Endpoint,
        cancel: &CancellationToken,
    ) -> NetworkResult<HolePunchResult> {
        info!(
            "Starting hole punch to {} ({} attempts, {:?} apart)",
            remote, self.config.max_attempts, self.config.punch_interval
        );

        let started = Instant::now();

        for attempt in 1..=self.config.max_attempts {
            if cancel.is_cancelled() {
                return Err(NetworkError::Cancelled);
            }

            transport.connect(remote)?;
            debug!("Punch attempt {} to {}", attempt, remote);

            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Hole punch to {} cancelled after {} attempts", remote, attempt);
                    return Err(NetworkError::Cancelled);
                }
                _ = sleep(self.config.punch_interval) => {}
            }

            transport.service()?;

            if transport.is_connected() {
                let result = HolePunchResult {
                    peer: transport.remote().unwrap_or(remote),
                    attempts: attempt,
                    elapsed: started.elapsed(),
                };
                info!(
                    "Hole punch to {} succeeded after {} attempts ({:?})",
                    result.peer, result.attempts, result.elapsed
                );
                return Ok(result);
            }
        }

        warn!(
            "Hole punch to {} failed after {} attempts",
            remote, self.config.max_attempts
        );
        Err(NetworkError::HolePunchFailed {
            attempts: self.config.max_attempts,
        })
    }
}
