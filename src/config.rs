//! Engine configuration.
//!
//! `PollerConfig` carries only process-wide tuning knobs and the fan-out
//! listener's bind address — device/tag/alarm records come from the
//! persistence collaborator at runtime, not from this file. Follows
//! `GatewayConfig`/`GatewayConfigBuilder`'s shape: serde-driven defaults
//! plus a fluent builder, loaded from YAML.

use std::net::SocketAddr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{PollerError, Result};

fn default_poll_interval_ms() -> u64 {
    250
}
fn default_block_max_gap() -> u16 {
    8
}
fn default_block_max_size() -> u16 {
    128
}
fn default_connect_backoff_base_ms() -> u64 {
    2_000
}
fn default_connect_backoff_max_ms() -> u64 {
    60_000
}
fn default_op_timeout_ms() -> u64 {
    1_000
}
fn default_history_prune_every_n_ticks() -> u32 {
    120
}
fn default_bind_addr() -> SocketAddr {
    "0.0.0.0:8088".parse().unwrap()
}
fn default_max_concurrent_devices() -> usize {
    64
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollerConfig {
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_block_max_gap")]
    pub block_max_gap: u16,
    #[serde(default = "default_block_max_size")]
    pub block_max_size: u16,
    #[serde(default = "default_connect_backoff_base_ms")]
    pub connect_backoff_base_ms: u64,
    #[serde(default = "default_connect_backoff_max_ms")]
    pub connect_backoff_max_ms: u64,
    #[serde(default = "default_op_timeout_ms")]
    pub op_timeout_ms: u64,
    #[serde(default = "default_history_prune_every_n_ticks")]
    pub history_prune_every_n_ticks: u32,
    #[serde(default = "default_bind_addr")]
    pub bind_addr: SocketAddr,
    #[serde(default = "default_max_concurrent_devices")]
    pub max_concurrent_devices: usize,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            block_max_gap: default_block_max_gap(),
            block_max_size: default_block_max_size(),
            connect_backoff_base_ms: default_connect_backoff_base_ms(),
            connect_backoff_max_ms: default_connect_backoff_max_ms(),
            op_timeout_ms: default_op_timeout_ms(),
            history_prune_every_n_ticks: default_history_prune_every_n_ticks(),
            bind_addr: default_bind_addr(),
            max_concurrent_devices: default_max_concurrent_devices(),
        }
    }
}

impl PollerConfig {
    pub fn from_yaml_str(contents: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(contents).map_err(|e| PollerError::InvalidConfig {
            reason: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml_file(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(PollerError::Io)?;
        Self::from_yaml_str(&contents)
    }

    pub fn validate(&self) -> Result<()> {
        if self.block_max_gap == 0 {
            return Err(PollerError::InvalidConfig {
                reason: "block_max_gap must be positive".into(),
            });
        }
        if self.block_max_size == 0 {
            return Err(PollerError::InvalidConfig {
                reason: "block_max_size must be positive".into(),
            });
        }
        if self.connect_backoff_base_ms > self.connect_backoff_max_ms {
            return Err(PollerError::InvalidConfig {
                reason: "connect_backoff_base_ms cannot exceed connect_backoff_max_ms".into(),
            });
        }
        if self.max_concurrent_devices == 0 {
            return Err(PollerError::InvalidConfig {
                reason: "max_concurrent_devices must be positive".into(),
            });
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn op_timeout(&self) -> Duration {
        Duration::from_millis(self.op_timeout_ms)
    }

    pub fn connect_backoff_base(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(self.connect_backoff_base_ms as i64)
    }

    pub fn connect_backoff_max(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(self.connect_backoff_max_ms as i64)
    }

    pub fn builder() -> PollerConfigBuilder {
        PollerConfigBuilder::default()
    }
}

#[derive(Default)]
pub struct PollerConfigBuilder {
    config: PollerConfig,
}

impl PollerConfigBuilder {
    pub fn poll_interval_ms(mut self, value: u64) -> Self {
        self.config.poll_interval_ms = value;
        self
    }

    pub fn block_limits(mut self, max_gap: u16, max_size: u16) -> Self {
        self.config.block_max_gap = max_gap;
        self.config.block_max_size = max_size;
        self
    }

    pub fn connect_backoff(mut self, base_ms: u64, max_ms: u64) -> Self {
        self.config.connect_backoff_base_ms = base_ms;
        self.config.connect_backoff_max_ms = max_ms;
        self
    }

    pub fn op_timeout_ms(mut self, value: u64) -> Self {
        self.config.op_timeout_ms = value;
        self
    }

    pub fn bind_addr(mut self, addr: SocketAddr) -> Self {
        self.config.bind_addr = addr;
        self
    }

    pub fn build(self) -> Result<PollerConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        PollerConfig::default().validate().unwrap();
    }

    #[test]
    fn builder_rejects_inverted_backoff_bounds() {
        let result = PollerConfig::builder().connect_backoff(60_000, 2_000).build();
        assert!(result.is_err());
    }

    #[test]
    fn loads_partial_yaml_with_defaults() {
        let yaml = "poll_interval_ms: 500\n";
        let config = PollerConfig::from_yaml_str(yaml).unwrap();
        assert_eq!(config.poll_interval_ms, 500);
        assert_eq!(config.block_max_gap, default_block_max_gap());
    }
}
