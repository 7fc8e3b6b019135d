//! Session configuration

use crate::error::{HostError, Result};
use crate::filter::DeviceFilter;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Tunables for a [`crate::Session`]
///
/// Every field has a default, so an empty TOML table is a valid config.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub transfers: TransferSettings,
    pub reenumeration: ReenumerationSettings,
    /// Devices hidden from enumeration unless they match (empty = all)
    pub filters: Vec<DeviceFilter>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferSettings {
    /// Timeout for descriptor and string requests issued internally
    pub control_timeout_ms: u64,
    /// How long to wait for the platform to confirm a cancellation
    pub cancel_grace_ms: u64,
}

impl Default for TransferSettings {
    fn default() -> Self {
        Self {
            control_timeout_ms: 1000,
            cancel_grace_ms: 250,
        }
    }
}

impl TransferSettings {
    pub fn control_timeout(&self) -> Duration {
        Duration::from_millis(self.control_timeout_ms)
    }

    pub fn cancel_grace(&self) -> Duration {
        Duration::from_millis(self.cancel_grace_ms)
    }
}

/// Polling used while waiting for a device to (re)appear
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReenumerationSettings {
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    /// Default deadline for reappearance after a reset
    pub timeout_ms: u64,
}

impl Default for ReenumerationSettings {
    fn default() -> Self {
        Self {
            initial_backoff_ms: 50,
            max_backoff_ms: 1000,
            timeout_ms: 5000,
        }
    }
}

impl ReenumerationSettings {
    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl SessionConfig {
    pub fn validate(&self) -> Result<()> {
        if self.transfers.cancel_grace_ms == 0 {
            return Err(HostError::InvalidArgument(
                "cancel_grace_ms must be greater than zero".to_string(),
            ));
        }

        let backoff = &self.reenumeration;
        if backoff.initial_backoff_ms == 0 {
            return Err(HostError::InvalidArgument(
                "initial_backoff_ms must be greater than zero".to_string(),
            ));
        }
        if backoff.initial_backoff_ms > backoff.max_backoff_ms {
            return Err(HostError::InvalidArgument(format!(
                "initial_backoff_ms ({}) exceeds max_backoff_ms ({})",
                backoff.initial_backoff_ms, backoff.max_backoff_ms
            )));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = SessionConfig::default();
        assert_eq!(config.transfers.control_timeout(), Duration::from_secs(1));
        assert!(config.filters.is_empty());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: SessionConfig = toml::from_str(
            r#"
            filters = ["0x0555:0x000c"]

            [transfers]
            cancel_grace_ms = 500
            "#,
        )
        .unwrap();

        assert_eq!(config.filters, vec![DeviceFilter::new(0x0555, 0x000c)]);
        assert_eq!(config.transfers.cancel_grace_ms, 500);
        assert_eq!(config.transfers.control_timeout_ms, 1000);
        assert_eq!(config.reenumeration, ReenumerationSettings::default());
    }

    #[test]
    fn test_invalid_filter_rejected() {
        let result: std::result::Result<SessionConfig, _> =
            toml::from_str(r#"filters = ["1234:5678"]"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_validate_backoff_order() {
        let mut config = SessionConfig::default();
        config.reenumeration.initial_backoff_ms = 2000;
        assert!(config.validate().is_err());

        let mut config = SessionConfig::default();
        config.transfers.cancel_grace_ms = 0;
        assert!(config.validate().is_err());
    }
}
