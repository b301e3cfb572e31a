//! Runtime configuration for worker-cache.
//!
//! Configuration can be loaded from a JSON file or constructed programmatically.
//! The cache core consumes three knobs (capacity, heartbeat interval, lease
//! timeout); the rest belongs to the process around it.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use serde::{Deserialize, Serialize};

/// Command-line arguments.
#[derive(Parser, Debug, Clone)]
#[command(name = "worker-cache", about = "Block cache for a distributed file system worker")]
pub struct Cli {
    /// Path to configuration file (JSON).
    #[arg(short, long, default_value = "config.json")]
    pub config: PathBuf,

    /// HTTP listen address for the status API (overrides the config file).
    #[arg(long)]
    pub listen: Option<String>,

    /// Enable verbose logging.
    #[arg(short, long)]
    pub verbose: bool,
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Worker identity and cache capacity.
    pub worker: WorkerConfig,

    /// Worker-to-master heartbeat.
    pub heartbeat: HeartbeatConfig,

    /// Lease expiry.
    pub lease: LeaseConfig,

    /// Under-storage location.
    pub under_storage: UnderStorageConfig,

    /// Status server settings.
    pub server: ServerConfig,
}

/// Worker identity and capacity.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// ID this worker reports to the master.
    pub worker_id: u64,

    /// Total bytes the cache may hold.
    pub capacity_bytes: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: 1,
            capacity_bytes: 1024 * 1024 * 1024, // 1 GB
        }
    }
}

/// Heartbeat settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HeartbeatConfig {
    /// Interval between heartbeats in milliseconds.
    pub interval_ms: u64,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self { interval_ms: 1000 }
    }
}

/// Lease expiry settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LeaseConfig {
    /// A lease idle for longer than this is reclaimed.
    pub timeout_ms: u64,

    /// How often the background sweep looks for expired leases.
    pub sweep_interval_ms: u64,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 30_000,
            sweep_interval_ms: 5_000,
        }
    }
}

/// Under-storage location.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UnderStorageConfig {
    /// Root directory for persisted blocks.
    pub path: PathBuf,
}

impl Default for UnderStorageConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("/tmp/worker-cache/under-storage"),
        }
    }
}

/// HTTP status server settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Listen address (e.g. "0.0.0.0:8080").
    pub listen: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:8080".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from a JSON file, falling back to defaults for missing fields.
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        if path.exists() {
            let data = std::fs::read_to_string(path)?;
            let config: Config = serde_json::from_str(&data)?;
            config.validate()?;
            Ok(config)
        } else {
            tracing::warn!("Config file not found at {:?}, using defaults", path);
            Ok(Config::default())
        }
    }

    /// Reject values the cache and its background tasks cannot run with.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.worker.capacity_bytes == 0 {
            anyhow::bail!("worker.capacity_bytes must be greater than zero");
        }
        if self.heartbeat.interval_ms == 0 {
            anyhow::bail!("heartbeat.interval_ms must be greater than zero");
        }
        if self.lease.timeout_ms == 0 {
            anyhow::bail!("lease.timeout_ms must be greater than zero");
        }
        if self.lease.sweep_interval_ms == 0 {
            anyhow::bail!("lease.sweep_interval_ms must be greater than zero");
        }
        Ok(())
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat.interval_ms)
    }

    pub fn lease_timeout(&self) -> Duration {
        Duration::from_millis(self.lease.timeout_ms)
    }

    pub fn lease_sweep_interval(&self) -> Duration {
        Duration::from_millis(self.lease.sweep_interval_ms)
    }

    /// Longest a cache change may take to reach the master: two heartbeat intervals.
    pub fn staleness_bound(&self) -> Duration {
        self.heartbeat_interval() * 2
    }
}
