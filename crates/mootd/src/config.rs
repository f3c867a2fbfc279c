//! Configuration for mootd

use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// mootd - moot community membership and dissemination daemon
#[derive(Parser, Debug, Clone)]
#[command(name = "mootd")]
#[command(about = "moot community overlay daemon")]
pub struct Config {
    /// Listen address for overlay packets
    #[arg(short, long, default_value = "0.0.0.0:9200")]
    pub listen: SocketAddr,

    /// Data directory for persistent storage
    #[arg(short, long, default_value = "./data/mootd")]
    pub data_dir: PathBuf,

    /// Sync advertisement interval in seconds
    #[arg(long, default_value = "30")]
    pub sync_interval_secs: u64,

    /// Maximum packets returned to one peer per sync cycle
    #[arg(long, default_value = "50")]
    pub sync_response_budget: usize,

    /// Global-time units covered by one Bloom window
    #[arg(long, default_value = "100")]
    pub bloom_stepping: u64,

    /// Item capacity of one Bloom window
    #[arg(long, default_value = "100")]
    pub bloom_capacity: u32,

    /// Target false-positive rate of one Bloom window
    #[arg(long, default_value = "0.01")]
    pub bloom_error_rate: f64,

    /// Seconds a delayed packet or message waits before being dropped
    #[arg(long, default_value = "10")]
    pub trigger_timeout_secs: u64,

    /// Trigger expiry sweep interval in seconds
    #[arg(long, default_value = "1")]
    pub tick_interval_secs: u64,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Log format (json or pretty)
    #[arg(long, default_value = "pretty")]
    pub log_format: String,
}

impl Config {
    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.bloom_stepping == 0 {
            anyhow::bail!("Bloom stepping must be positive");
        }
        if !(0.0..1.0).contains(&self.bloom_error_rate) || self.bloom_error_rate == 0.0 {
            anyhow::bail!("Bloom error rate must be in (0, 1)");
        }
        if self.sync_response_budget == 0 {
            anyhow::bail!("Sync response budget must be positive");
        }
        Ok(())
    }

    pub fn trigger_timeout(&self) -> Duration {
        Duration::from_secs(self.trigger_timeout_secs)
    }
}

/// Tunables threaded into the dispatcher; extracted from [`Config`] so tests
/// can build them directly.
#[derive(Debug, Clone)]
pub struct OverlayParams {
    pub sync_response_budget: usize,
    pub bloom_stepping: u64,
    pub bloom_capacity: u32,
    pub bloom_error_rate: f64,
    pub trigger_timeout: Duration,
}

impl Default for OverlayParams {
    fn default() -> Self {
        Self {
            sync_response_budget: 50,
            bloom_stepping: 100,
            bloom_capacity: 100,
            bloom_error_rate: 0.01,
            trigger_timeout: Duration::from_secs(10),
        }
    }
}

impl From<&Config> for OverlayParams {
    fn from(config: &Config) -> Self {
        Self {
            sync_response_budget: config.sync_response_budget,
            bloom_stepping: config.bloom_stepping,
            bloom_capacity: config.bloom_capacity,
            bloom_error_rate: config.bloom_error_rate,
            trigger_timeout: config.trigger_timeout(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> Config {
        Config::parse_from(["mootd"])
    }

    #[test]
    fn test_defaults_validate() {
        assert!(base_config().validate().is_ok());
    }

    #[test]
    fn test_rejects_zero_stepping() {
        let mut config = base_config();
        config.bloom_stepping = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_bad_error_rate() {
        let mut config = base_config();
        config.bloom_error_rate = 1.5;
        assert!(config.validate().is_err());
    }
}
