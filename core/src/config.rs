//! Configuration options.
//!
//! The monitor reads a TOML configuration file defining memory limits,
//! connection tracking behaviour, detector toggles, and packet archival
//! options. The path to the file is typically a command line argument of
//! the embedding application. Configuration is immutable once a monitor
//! has been constructed from it.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

/// Loads a configuration file from `path`.
pub fn load_config<P: AsRef<Path>>(path: P) -> MonitorConfig {
    let config_str = fs::read_to_string(path).expect("ERROR: File read failed");
    let config: MonitorConfig = toml::from_str(&config_str).expect("Invalid config file");
    if let Err(err) = config.validate() {
        log::error!("Invalid configuration: {:#?}", config);
        panic!("{}", err);
    }
    config
}

/// Returns a default configuration.
///
/// Suitable for tests and demonstrations; production deployments should
/// size the page pool and connection caps for their link.
pub fn default_config() -> MonitorConfig {
    MonitorConfig::default()
}

/* --------------------------------------------------------------------------------- */

/// Monitor runtime options.
#[derive(Deserialize, Serialize, Debug, Clone, Default)]
pub struct MonitorConfig {
    /// Page pool settings.
    #[serde(default)]
    pub pager: PagerConfig,

    /// Connection tracking settings.
    #[serde(default)]
    pub conntrack: ConnTrackConfig,

    /// Detector toggles.
    #[serde(default)]
    pub detect: DetectorConfig,

    /// Packet archival settings.
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl MonitorConfig {
    /// Rejects configurations that cannot bound memory or cannot drive
    /// the idle reaper.
    pub fn validate(&self) -> Result<()> {
        if self.conntrack.max_connections == 0 && self.conntrack.buffered_total == 0 {
            bail!(
                "either conntrack.max_connections or conntrack.buffered_total \
                 must be non-zero to bound memory"
            );
        }
        if self.conntrack.max_ring_pages == 0 {
            bail!("conntrack.max_ring_pages must be non-zero");
        }
        if self.pager.capacity == 0 || self.pager.page_size == 0 {
            bail!("pager.capacity and pager.page_size must be non-zero");
        }
        if self.conntrack.tcp_idle_timeout == 0 {
            bail!("conntrack.tcp_idle_timeout must be non-zero");
        }
        if self.conntrack.timeout_resolution > self.conntrack.tcp_idle_timeout {
            bail!("idle check period must not exceed the idle timeout");
        }
        Ok(())
    }
}

/// Page pool settings.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct PagerConfig {
    /// Number of pages preallocated in the shared pool.
    #[serde(default = "default_pager_capacity")]
    pub capacity: usize,

    /// Page payload capacity in bytes. Segments larger than one page are
    /// chunked across consecutive pages.
    #[serde(default = "default_page_size")]
    pub page_size: usize,
}

impl Default for PagerConfig {
    fn default() -> Self {
        PagerConfig {
            capacity: default_pager_capacity(),
            page_size: default_page_size(),
        }
    }
}

/// Connection tracking settings.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct ConnTrackConfig {
    /// Maximum number of tracked connections. Zero = unbounded. When the
    /// table is full, new flows are dropped.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Per-direction segment ring size, in pages.
    #[serde(default = "default_max_ring_pages")]
    pub max_ring_pages: usize,

    /// Out-of-order pages buffered per connection. Zero = unbounded.
    #[serde(default = "default_buffered_per_connection")]
    pub buffered_per_connection: usize,

    /// Out-of-order pages buffered across all connections. Zero =
    /// unbounded.
    #[serde(default = "default_buffered_total")]
    pub buffered_total: usize,

    /// Time to expire inactive connections (in milliseconds).
    #[serde(default = "default_tcp_idle_timeout")]
    pub tcp_idle_timeout: u64,

    /// Frequency to check for inactive connections (in milliseconds).
    #[serde(default = "default_timeout_resolution")]
    pub timeout_resolution: u64,
}

impl ConnTrackConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.tcp_idle_timeout)
    }

    pub fn resolution(&self) -> Duration {
        Duration::from_millis(self.timeout_resolution)
    }
}

impl Default for ConnTrackConfig {
    fn default() -> Self {
        ConnTrackConfig {
            max_connections: default_max_connections(),
            max_ring_pages: default_max_ring_pages(),
            buffered_per_connection: default_buffered_per_connection(),
            buffered_total: default_buffered_total(),
            tcp_idle_timeout: default_tcp_idle_timeout(),
            timeout_resolution: default_timeout_resolution(),
        }
    }
}

/// Detector toggles.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct DetectorConfig {
    /// Detect forged SYN-ACKs racing the legitimate handshake.
    #[serde(default = "default_true")]
    pub hijack: bool,

    /// Detect retransmitted ranges with divergent payload.
    #[serde(default = "default_true")]
    pub injection: bool,

    /// Detect divergent overwrites of buffered future segments.
    #[serde(default = "default_true")]
    pub coalesce_injection: bool,

    /// Omit payload bytes from attack reports.
    #[serde(default)]
    pub metadata_only: bool,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        DetectorConfig {
            hijack: true,
            injection: true,
            coalesce_injection: true,
            metadata_only: false,
        }
    }
}

/// Packet archival settings, consumed by the packet sink factory.
#[derive(Deserialize, Serialize, Debug, Clone, Default)]
pub struct LoggingConfig {
    /// Directory for packet archives.
    #[serde(default)]
    pub log_dir: Option<PathBuf>,

    /// Attach a packet sink to each tracked connection.
    #[serde(default)]
    pub log_packets: bool,
}

fn default_pager_capacity() -> usize {
    8192
}

fn default_page_size() -> usize {
    2048
}

fn default_max_connections() -> usize {
    4096
}

fn default_max_ring_pages() -> usize {
    40
}

fn default_buffered_per_connection() -> usize {
    100
}

fn default_buffered_total() -> usize {
    1000
}

fn default_tcp_idle_timeout() -> u64 {
    300_000
}

fn default_timeout_resolution() -> u64 {
    10_000
}

fn default_true() -> bool {
    true
}
