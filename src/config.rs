//! Configuration for needlestore
//!
//! Centralized configuration with sensible defaults.

use std::path::PathBuf;

use crate::error::{Result, StorageError};

/// Default number of workers used to open volumes at startup
pub const DEFAULT_LOAD_CONCURRENCY: usize = 10;

/// Main configuration for a storage node
#[derive(Debug, Clone)]
pub struct StoreConfig {
    // -------------------------------------------------------------------------
    // Node Identity
    // -------------------------------------------------------------------------
    /// IP address reported in heartbeats
    pub ip: String,

    /// Port reported in heartbeats
    pub port: u16,

    /// Public URL reported in heartbeats (defaults to `ip:port` when empty)
    pub public_url: String,

    /// Optional data center label, overrides the cluster's own setting
    pub data_center: String,

    /// Optional rack label, overrides the cluster's own setting
    pub rack: String,

    // -------------------------------------------------------------------------
    // Storage Configuration
    // -------------------------------------------------------------------------
    /// Volume directories and the maximum number of volumes each may hold.
    /// Layout of every directory:
    ///   {dir}/
    ///     ├── {collection}_{id}.dat   (superblock + needle records)
    ///     └── {collection}_{id}.idx   (companion index)
    pub locations: Vec<LocationConfig>,

    /// Soft per-volume size limit assigned by the cluster (0 = unknown)
    pub volume_size_limit: u64,

    /// Worker threads used to open existing volumes at startup
    pub load_concurrency: usize,
}

/// One volume directory
#[derive(Debug, Clone)]
pub struct LocationConfig {
    pub directory: PathBuf,
    pub max_volume_count: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            ip: "127.0.0.1".to_string(),
            port: 8080,
            public_url: String::new(),
            data_center: String::new(),
            rack: String::new(),
            locations: Vec::new(),
            volume_size_limit: 0,
            load_concurrency: DEFAULT_LOAD_CONCURRENCY,
        }
    }
}

impl StoreConfig {
    /// Create a new config builder
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }

    /// Public URL, falling back to `ip:port`
    pub fn effective_public_url(&self) -> String {
        if self.public_url.is_empty() {
            format!("{}:{}", self.ip, self.port)
        } else {
            self.public_url.clone()
        }
    }

    /// Check the configuration before a store is opened
    pub fn validate(&self) -> Result<()> {
        if self.locations.is_empty() {
            return Err(StorageError::Config(
                "at least one volume directory is required".to_string(),
            ));
        }
        if self.load_concurrency == 0 {
            return Err(StorageError::Config(
                "load concurrency must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Builder for StoreConfig
#[derive(Default)]
pub struct ConfigBuilder {
    config: StoreConfig,
}

impl ConfigBuilder {
    /// Set the advertised IP address
    pub fn ip(mut self, ip: impl Into<String>) -> Self {
        self.config.ip = ip.into();
        self
    }

    /// Set the advertised port
    pub fn port(mut self, port: u16) -> Self {
        self.config.port = port;
        self
    }

    /// Set the public URL
    pub fn public_url(mut self, url: impl Into<String>) -> Self {
        self.config.public_url = url.into();
        self
    }

    /// Add a volume directory holding at most `max_volume_count` volumes
    pub fn location(mut self, directory: impl Into<PathBuf>, max_volume_count: usize) -> Self {
        self.config.locations.push(LocationConfig {
            directory: directory.into(),
            max_volume_count,
        });
        self
    }

    /// Set the soft per-volume size limit (in bytes)
    pub fn volume_size_limit(mut self, limit: u64) -> Self {
        self.config.volume_size_limit = limit;
        self
    }

    /// Set the data center label
    pub fn data_center(mut self, dc: impl Into<String>) -> Self {
        self.config.data_center = dc.into();
        self
    }

    /// Set the rack label
    pub fn rack(mut self, rack: impl Into<String>) -> Self {
        self.config.rack = rack.into();
        self
    }

    /// Set the number of startup loader workers
    pub fn load_concurrency(mut self, workers: usize) -> Self {
        self.config.load_concurrency = workers;
        self
    }

    pub fn build(self) -> StoreConfig {
        self.config
    }
}
