//! Engine-wide tunables.
//!
//! Defaults match the timing other drivers on the shared bus expect. Hosts normally take
//! `EngineConfig::from_env()` and adjust individual fields with the `with_*`
//! helpers.

use std::path::PathBuf;
use std::time::Duration;

use log::warn;
use serde::{Deserialize, Serialize};

/// Lock file shared by every process that talks to the HAT SPI bus.
pub const DEFAULT_LOCK_FILE: &str = "/tmp/.mcc_spi_lockfile";

/// The Raspberry Pi SPI device the HATs sit on.
pub const DEFAULT_SPI_DEVICE: &str = "/dev/spidev0.0";

const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_POLL_MIN: Duration = Duration::from_micros(100);
const DEFAULT_POLL_MAX: Duration = Duration::from_millis(100);
const DEFAULT_TRIGGER_POLL: Duration = Duration::from_millis(1);
const DEFAULT_READ_POLL: Duration = Duration::from_micros(100);
const DEFAULT_SYNC_RETRIES: u32 = 5000;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Upper bound on acquiring the bus lock before `LockTimeout`.
    pub lock_timeout: Duration,
    pub lock_file: PathBuf,
    pub spi_device: PathBuf,
    /// Floor of the scan thread's adaptive poll interval.
    pub poll_min: Duration,
    /// Ceiling of the scan thread's adaptive poll interval.
    pub poll_max: Duration,
    /// Poll interval while waiting for an external trigger.
    pub trigger_poll: Duration,
    /// Granularity of the blocking read loop.
    pub read_poll: Duration,
    /// Clock-sync polls (1 ms apart) before a synchronized start gives up.
    pub sync_retries: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
            lock_file: PathBuf::from(DEFAULT_LOCK_FILE),
            spi_device: PathBuf::from(DEFAULT_SPI_DEVICE),
            poll_min: DEFAULT_POLL_MIN,
            poll_max: DEFAULT_POLL_MAX,
            trigger_poll: DEFAULT_TRIGGER_POLL,
            read_poll: DEFAULT_READ_POLL,
            sync_retries: DEFAULT_SYNC_RETRIES,
        }
    }
}

impl EngineConfig {
    /// Defaults, overridden by `HATSCAN_LOCK_TIMEOUT_MS` and `HATSCAN_SPI_DEVICE`.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(raw) = std::env::var("HATSCAN_LOCK_TIMEOUT_MS") {
            match raw.trim().parse::<u64>() {
                Ok(ms) => config.lock_timeout = Duration::from_millis(ms),
                Err(_) => warn!("ignoring invalid HATSCAN_LOCK_TIMEOUT_MS={raw:?}"),
            }
        }
        if let Ok(path) = std::env::var("HATSCAN_SPI_DEVICE") {
            config.spi_device = PathBuf::from(path);
        }
        config
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    pub fn with_lock_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.lock_file = path.into();
        self
    }

    pub fn with_spi_device(mut self, path: impl Into<PathBuf>) -> Self {
        self.spi_device = path.into();
        self
    }

    /// Set the adaptive poll window. `max` is raised to `min` if smaller.
    pub fn with_poll_window(mut self, min: Duration, max: Duration) -> Self {
        self.poll_min = min;
        self.poll_max = max.max(min);
        self
    }

    pub fn with_trigger_poll(mut self, interval: Duration) -> Self {
        self.trigger_poll = interval;
        self
    }

    pub fn with_read_poll(mut self, interval: Duration) -> Self {
        self.read_poll = interval;
        self
    }

    pub fn with_sync_retries(mut self, retries: u32) -> Self {
        self.sync_retries = retries;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn defaults_are_the_shared_bus_conventions() {
        let config = EngineConfig::default();
        assert_eq!(config.lock_timeout, Duration::from_secs(5));
        assert_eq!(config.lock_file, PathBuf::from("/tmp/.mcc_spi_lockfile"));
        assert!(config.poll_min < config.poll_max);
    }

    #[test]
    fn poll_window_never_inverts() {
        let config = EngineConfig::default()
            .with_poll_window(Duration::from_millis(5), Duration::from_millis(1));
        assert_eq!(config.poll_max, Duration::from_millis(5));
    }

    #[test]
    #[serial]
    fn env_overrides_lock_timeout_and_device() {
        std::env::set_var("HATSCAN_LOCK_TIMEOUT_MS", "250");
        std::env::set_var("HATSCAN_SPI_DEVICE", "/dev/spidev0.1");
        let config = EngineConfig::from_env();
        std::env::remove_var("HATSCAN_LOCK_TIMEOUT_MS");
        std::env::remove_var("HATSCAN_SPI_DEVICE");

        assert_eq!(config.lock_timeout, Duration::from_millis(250));
        assert_eq!(config.spi_device, PathBuf::from("/dev/spidev0.1"));
    }

    #[test]
    #[serial]
    fn env_ignores_garbage_timeout() {
        std::env::set_var("HATSCAN_LOCK_TIMEOUT_MS", "soon");
        let config = EngineConfig::from_env();
        std::env::remove_var("HATSCAN_LOCK_TIMEOUT_MS");
        assert_eq!(config.lock_timeout, Duration::from_secs(5));
    }
}
