//! Configuration for the name server, the data servers and clients.
//!
//! All structs deserialize with `#[serde(default)]`, so a partial document only overrides the
//! fields it names.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::common::{ServerAddress, DEFAULT_BLOCK_SIZE, PACKET_SIZE};
use crate::error::{DfsError, Result};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DfsConfiguration {
    pub name_server: NameServerConfig,
    pub data_server: DataServerConfig,
    pub client: ClientConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NameServerConfig {
    pub listen_address: String,
    /// Block size for files that do not specify one.
    pub block_size: u64,
    /// Replication factor for files that do not specify one.
    pub replication_factor: u32,
    /// A data server silent for longer than this is declared dead.
    pub data_server_timeout_ms: u64,
    /// Interval between reconciliation passes.
    pub replication_check_interval_ms: u64,
    /// A data server is asked for a full block report this often.
    pub block_report_interval_ms: u64,
    /// How long to wait for a replication command to show results before issuing it again.
    pub replication_retry_ms: u64,
    /// A block still pending after this long is abandoned, along with any partial copies.
    pub pending_block_timeout_ms: u64,
    /// Data servers with less free space than this get no new blocks.
    pub min_free_space: u64,
    /// Fraction of committed blocks that must have a live replica before safe mode ends.
    pub safe_mode_threshold: f64,
    /// Number of data servers that must have reported before safe mode ends.
    pub safe_mode_min_data_servers: usize,
    /// Where checkpoints of the namespace are written. No checkpoints when unset.
    pub image_directory: Option<PathBuf>,
}

impl Default for NameServerConfig {
    fn default() -> Self {
        Self {
            listen_address: "0.0.0.0:9000".to_string(),
            block_size: DEFAULT_BLOCK_SIZE,
            replication_factor: 1,
            data_server_timeout_ms: 60_000,
            replication_check_interval_ms: 30_000,
            block_report_interval_ms: 60 * 60 * 1000,
            replication_retry_ms: 5 * 60 * 1000,
            pending_block_timeout_ms: 10 * 60 * 1000,
            min_free_space: 0,
            safe_mode_threshold: 1.0,
            safe_mode_min_data_servers: 1,
            image_directory: None,
        }
    }
}

impl NameServerConfig {
    pub fn data_server_timeout(&self) -> Duration {
        Duration::from_millis(self.data_server_timeout_ms)
    }

    pub fn replication_check_interval(&self) -> Duration {
        Duration::from_millis(self.replication_check_interval_ms)
    }

    pub fn block_report_interval(&self) -> Duration {
        Duration::from_millis(self.block_report_interval_ms)
    }

    pub fn replication_retry(&self) -> Duration {
        Duration::from_millis(self.replication_retry_ms)
    }

    pub fn pending_block_timeout(&self) -> Duration {
        Duration::from_millis(self.pending_block_timeout_ms)
    }

    pub fn validate(&self) -> Result<()> {
        validate_block_size(self.block_size)?;
        if self.replication_factor == 0 {
            return Err(DfsError::Configuration("replication factor must be at least 1".into()));
        }
        if !(0.0..=1.0).contains(&self.safe_mode_threshold) {
            return Err(DfsError::Configuration(format!(
                "safe mode threshold must be between 0 and 1, got {}",
                self.safe_mode_threshold
            )));
        }
        Ok(())
    }
}

/// Block sizes must be a positive multiple of the packet size so that only the final packet of a
/// block can be short.
pub fn validate_block_size(block_size: u64) -> Result<()> {
    if block_size == 0 || block_size % PACKET_SIZE as u64 != 0 {
        return Err(DfsError::InvalidOperation(format!(
            "block size {block_size} is not a positive multiple of the packet size {PACKET_SIZE}"
        )));
    }
    Ok(())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DataServerConfig {
    /// Host name advertised to the name server and clients.
    pub host: String,
    /// Port to listen on; 0 picks a free port.
    pub port: u16,
    pub name_server_address: String,
    pub storage_directory: PathBuf,
    /// Bytes this server may use for block storage.
    pub disk_capacity: u64,
    pub heartbeat_interval_ms: u64,
    pub verify_checksums: bool,
    /// File system this server belongs to; unset accepts any name server.
    pub file_system_id: Option<Uuid>,
}

impl Default for DataServerConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 9001,
            name_server_address: "localhost:9000".to_string(),
            storage_directory: PathBuf::from("./data/dataserver"),
            disk_capacity: 100 * 1024 * 1024 * 1024,
            heartbeat_interval_ms: 3_000,
            verify_checksums: true,
            file_system_id: None,
        }
    }
}

impl DataServerConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn name_server(&self) -> Result<ServerAddress> {
        self.name_server_address.parse()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub verify_checksums: bool,
    /// Ask the name server to place the first replica on `local_host` when possible.
    pub prefer_local: bool,
    pub local_host: Option<String>,
    /// Number of block location lookups to remember.
    pub location_cache_size: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            verify_checksums: true,
            prefer_local: false,
            local_host: None,
            location_cache_size: 1024,
        }
    }
}

impl ClientConfig {
    pub(crate) fn local_host(&self) -> Option<String> {
        if self.prefer_local {
            self.local_host.clone()
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_documents_keep_defaults() {
        let config: DfsConfiguration =
            serde_json::from_str(r#"{ "name_server": { "replication_factor": 3 } }"#).unwrap();
        assert_eq!(config.name_server.replication_factor, 3);
        assert_eq!(config.name_server.block_size, DEFAULT_BLOCK_SIZE);
        assert!(config.client.verify_checksums);
        config.name_server.validate().unwrap();
    }

    #[test]
    fn block_size_must_be_packet_multiple() {
        assert!(validate_block_size(PACKET_SIZE as u64 * 3).is_ok());
        assert!(validate_block_size(0).is_err());
        assert!(validate_block_size(PACKET_SIZE as u64 + 1).is_err());
    }
}
