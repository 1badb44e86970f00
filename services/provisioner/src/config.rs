//! Configuration for the provisioner binary.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::hypervisor::VBoxManage;
use crate::lifecycle::{ProvisionerConfig, ReadyTimings};

/// Provisioner configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Root of the gold image cache and machine directories.
    pub base_dir: PathBuf,

    /// Hypervisor CLI program.
    pub vboxmanage: String,

    /// Where remote images are downloaded.
    pub download_dir: PathBuf,

    /// Seconds before the first readiness check.
    pub ready_delay_secs: u64,

    /// Minimum seconds between readiness checks.
    pub ready_interval_secs: u64,

    /// Seconds to wait for a machine to become ready.
    pub ready_timeout_secs: u64,

    /// Consecutive not-found refreshes tolerated while waiting.
    pub not_found_checks: u32,

    /// Log filter, from `VMPROV_LOG_LEVEL` or else `RUST_LOG`.
    pub log_level: String,
}

fn env_or<T: std::str::FromStr>(name: &str, default: T) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|e| anyhow::anyhow!("{name}={raw}: {e}")),
        Err(_) => Ok(default),
    }
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let base_dir = match std::env::var("VMPROV_BASE_DIR") {
            Ok(dir) => PathBuf::from(dir),
            Err(_) => directories::BaseDirs::new()
                .map(|dirs| dirs.home_dir().join(".vmprov"))
                .context("cannot determine home directory; set VMPROV_BASE_DIR")?,
        };

        let vboxmanage = std::env::var("VMPROV_VBOXMANAGE")
            .unwrap_or_else(|_| VBoxManage::DEFAULT_PROGRAM.to_string());

        let download_dir = match std::env::var("VMPROV_DOWNLOAD_DIR") {
            Ok(dir) => PathBuf::from(dir),
            Err(_) => std::env::current_dir().context("cannot determine current directory")?,
        };

        let log_level = std::env::var("VMPROV_LOG_LEVEL")
            .or_else(|_| std::env::var("RUST_LOG"))
            .unwrap_or_else(|_| "info".to_string());

        Ok(Self {
            base_dir,
            vboxmanage,
            download_dir,
            ready_delay_secs: env_or("VMPROV_READY_DELAY_SECS", 5)?,
            ready_interval_secs: env_or("VMPROV_READY_INTERVAL_SECS", 5)?,
            ready_timeout_secs: env_or("VMPROV_READY_TIMEOUT_SECS", 300)?,
            not_found_checks: env_or("VMPROV_NOT_FOUND_CHECKS", 60)?,
            log_level,
        })
    }

    pub fn provisioner_config(&self) -> ProvisionerConfig {
        ProvisionerConfig {
            base_dir: self.base_dir.clone(),
            download_dir: self.download_dir.clone(),
            ready: ReadyTimings {
                delay: Duration::from_secs(self.ready_delay_secs),
                min_interval: Duration::from_secs(self.ready_interval_secs),
                timeout: Duration::from_secs(self.ready_timeout_secs),
                not_found_checks: self.not_found_checks,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provisioner_config_carries_timings() {
        let config = Config {
            base_dir: PathBuf::from("/srv/vmprov"),
            vboxmanage: "VBoxManage".to_string(),
            download_dir: PathBuf::from("/tmp"),
            ready_delay_secs: 1,
            ready_interval_secs: 2,
            ready_timeout_secs: 30,
            not_found_checks: 3,
            log_level: "debug".to_string(),
        };

        let provisioner = config.provisioner_config();
        assert_eq!(provisioner.gold_dir(), PathBuf::from("/srv/vmprov/gold"));
        assert_eq!(provisioner.ready.delay, Duration::from_secs(1));
        assert_eq!(provisioner.ready.min_interval, Duration::from_secs(2));
        assert_eq!(provisioner.ready.timeout, Duration::from_secs(30));
        assert_eq!(provisioner.ready.not_found_checks, 3);
    }

    #[test]
    fn test_env_or_falls_back_when_unset() {
        let value: u64 = env_or("VMPROV_TEST_SURELY_UNSET_VARIABLE", 42).unwrap();
        assert_eq!(value, 42);
    }
}
