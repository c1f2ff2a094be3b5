//! Gateway configuration.
//!
//! The host hands the gateway its id, its own node address as a string and
//! the CAN interface name. The daemon can read the same values, plus the
//! timing knobs, from a TOML file:
//!
//! ```toml
//! [gateway]
//! hardware_id = 3
//! address = "1"
//! interface = "can0"
//!
//! [timing]
//! reopen_delay_ms = 5000
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::bus::LISTEN_POLL_TIMEOUT;
use crate::command::ACK_TIMEOUT;
use crate::identifier::NodeAddress;
use crate::registry::GatewayId;

/// Immutable per-instance settings, owned by the running gateway.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayConfig {
    pub hardware_id: GatewayId,
    pub address: NodeAddress,
    pub interface: String,
}

impl GatewayConfig {
    pub fn new(
        hardware_id: GatewayId,
        address: NodeAddress,
        interface: impl Into<String>,
    ) -> Result<Self, ConfigError> {
        let interface = interface.into();

        if address.is_broadcast() {
            return Err(ConfigError::InvalidAddress(address.to_string()));
        }

        if interface.is_empty() {
            return Err(ConfigError::MissingInterface);
        }

        Ok(Self {
            hardware_id,
            address,
            interface,
        })
    }

    /// Builds the configuration from the strings the host stores. `address`
    /// must be a plain decimal number in 0..=126.
    pub fn from_host(
        hardware_id: GatewayId,
        address: &str,
        interface: &str,
    ) -> Result<Self, ConfigError> {
        Self::new(hardware_id, parse_address(address)?, interface)
    }
}

fn parse_address(text: &str) -> Result<NodeAddress, ConfigError> {
    let invalid = || ConfigError::InvalidAddress(text.to_string());

    if text.is_empty() || !text.bytes().all(|b| b.is_ascii_digit()) {
        return Err(invalid());
    }

    text.parse::<u8>()
        .ok()
        .and_then(NodeAddress::new)
        .ok_or_else(invalid)
}

/// Timing of the dispatcher loop and the command exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timing {
    /// Receive timeout of the listening channel, bounds stop latency
    pub poll_timeout: Duration,
    /// Wait between failed attempts to open the listening channel
    pub reopen_delay: Duration,
    pub heartbeat_interval: Duration,
    pub ack_timeout: Duration,
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            poll_timeout: LISTEN_POLL_TIMEOUT,
            reopen_delay: Duration::from_secs(5),
            heartbeat_interval: Duration::from_secs(12),
            ack_timeout: ACK_TIMEOUT,
        }
    }
}

/// The daemon's configuration file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FileConfig {
    pub gateway: GatewaySection,
    pub timing: TimingSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewaySection {
    pub hardware_id: GatewayId,
    /// Own node address, decimal.
    pub address: String,
    pub interface: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingSection {
    pub poll_timeout_ms: u64,
    pub reopen_delay_ms: u64,
    pub heartbeat_interval_ms: u64,
    pub ack_timeout_ms: u64,
}

impl Default for GatewaySection {
    fn default() -> Self {
        Self {
            hardware_id: 1,
            address: "1".to_string(),
            interface: "can0".to_string(),
        }
    }
}

impl Default for TimingSection {
    fn default() -> Self {
        let timing = Timing::default();

        Self {
            poll_timeout_ms: timing.poll_timeout.as_millis() as u64,
            reopen_delay_ms: timing.reopen_delay.as_millis() as u64,
            heartbeat_interval_ms: timing.heartbeat_interval.as_millis() as u64,
            ack_timeout_ms: timing.ack_timeout.as_millis() as u64,
        }
    }
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Read(path.to_path_buf(), e))?;

        toml::from_str(&text).map_err(|e| ConfigError::Parse(path.to_path_buf(), e))
    }

    pub fn gateway(&self) -> Result<GatewayConfig, ConfigError> {
        GatewayConfig::from_host(
            self.gateway.hardware_id,
            &self.gateway.address,
            &self.gateway.interface,
        )
    }

    pub fn timing(&self) -> Timing {
        Timing {
            poll_timeout: Duration::from_millis(self.timing.poll_timeout_ms),
            reopen_delay: Duration::from_millis(self.timing.reopen_delay_ms),
            heartbeat_interval: Duration::from_millis(self.timing.heartbeat_interval_ms),
            ack_timeout: Duration::from_millis(self.timing.ack_timeout_ms),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid gateway node address {0:?}, expected a decimal number in 0..=126")]
    InvalidAddress(String),
    #[error("no CAN interface configured")]
    MissingInterface,
    #[error("failed to read {0}: {1}")]
    Read(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    Parse(PathBuf, toml::de::Error),
}
