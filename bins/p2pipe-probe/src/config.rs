//! Probe configuration

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use p2pipe_net::NetworkConfig;
use serde::{Deserialize, Serialize};

/// Main probe configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeConfig {
    /// Network layer configuration
    pub network: NetworkConfig,
    /// Punch session behaviour
    pub session: SessionConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Punch session configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// How long to wait for a local peer announcement
    pub discovery_timeout: Duration,
    /// How long to wait for the peer's greeting after connecting
    pub greeting_timeout: Duration,
    /// Message sent once connected
    pub greeting: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            discovery_timeout: Duration::from_secs(30),
            greeting_timeout: Duration::from_secs(10),
            greeting: "hello from p2pipe-probe".to_string(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level used when --log-level is not given
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl ProbeConfig {
    /// Load configuration from file
    pub async fn load(path: &Path) -> Result<Self> {
        let contents = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read config file {:?}", path))?;

        toml::from_str(&contents).context("Failed to parse config file")
    }

    /// Load or create default configuration
    pub async fn load_or_create(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path).await
        } else {
            let config = Self::default();
            config.save(path).await?;
            Ok(config)
        }
    }

    /// Save configuration to file
    pub async fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let contents = toml::to_string_pretty(self)?;
        tokio::fs::write(path, contents).await?;
        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        self.network.validate().context("Invalid network configuration")?;

        if self.session.greeting.is_empty() {
            anyhow::bail!("greeting must not be empty");
        }

        if self.session.discovery_timeout.is_zero() || self.session.greeting_timeout.is_zero() {
            anyhow::bail!("session timeouts must be non-zero");
        }

        Ok(())
    }
}
