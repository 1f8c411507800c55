//! Transport configuration
//!
//! Loaded from JSON; every field is optional and falls back to the values
//! that suit a standard SMP server.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::ble::gatt::{DEFAULT_WRITE_PAYLOAD, SMP_CHARACTERISTIC_UUID, SMP_SERVICE_UUID};

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid config: {0}")]
    Parse(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// GATT service the SMP characteristic lives in.
    pub service_uuid: Uuid,
    /// Characteristic carrying requests (writes) and responses (notifications).
    pub characteristic_uuid: Uuid,
    /// How long to scan when resolving a device or listing SMP servers.
    pub scan_timeout_ms: u64,
    /// Wait this long for the platform to settle the MTU when it first
    /// reports a value at or below `suspect_mtu`. Zero disables the wait.
    pub mtu_settle_delay_ms: u64,
    pub suspect_mtu: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            service_uuid: SMP_SERVICE_UUID,
            characteristic_uuid: SMP_CHARACTERISTIC_UUID,
            scan_timeout_ms: 5_000,
            mtu_settle_delay_ms: 2_000,
            suspect_mtu: DEFAULT_WRITE_PAYLOAD,
        }
    }
}

impl TransportConfig {
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_json_str(&contents)
    }

    pub fn scan_timeout(&self) -> Duration {
        Duration::from_millis(self.scan_timeout_ms)
    }

    pub fn mtu_settle_delay(&self) -> Duration {
        Duration::from_millis(self.mtu_settle_delay_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = TransportConfig::default();
        assert_eq!(config.service_uuid, SMP_SERVICE_UUID);
        assert_eq!(config.characteristic_uuid, SMP_CHARACTERISTIC_UUID);
        assert_eq!(config.scan_timeout(), Duration::from_secs(5));
        assert_eq!(config.mtu_settle_delay(), Duration::from_secs(2));
        assert_eq!(config.suspect_mtu, 20);
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config = TransportConfig::from_json_str(r#"{ "mtu_settle_delay_ms": 0 }"#).unwrap();
        assert_eq!(config.mtu_settle_delay(), Duration::ZERO);
        assert_eq!(config.scan_timeout_ms, 5_000);
        assert_eq!(config.characteristic_uuid, SMP_CHARACTERISTIC_UUID);
    }

    #[test]
    fn test_serialization_round_trip() {
        let config = TransportConfig {
            scan_timeout_ms: 1_500,
            suspect_mtu: 23,
            ..TransportConfig::default()
        };
        let json = serde_json::to_string(&config).unwrap();
        assert_eq!(TransportConfig::from_json_str(&json).unwrap(), config);
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{ "characteristic_uuid": "da2e7828-fbce-4e01-ae9e-261174997c48", "scan_timeout_ms": 250 }}"#
        )
        .unwrap();

        let config = TransportConfig::from_file(file.path()).unwrap();
        assert_eq!(config.scan_timeout(), Duration::from_millis(250));
        assert_eq!(config.characteristic_uuid, SMP_CHARACTERISTIC_UUID);
    }

    #[test]
    fn test_errors() {
        assert!(matches!(
            TransportConfig::from_json_str("{ not json"),
            Err(ConfigError::Parse(_))
        ));
        assert!(matches!(
            TransportConfig::from_file("/nonexistent/smp-ble.json"),
            Err(ConfigError::Io(_))
        ));
    }
}
