//! The two RPC surfaces of the name server.
//!
//! [`crate::nameserver::NameServer`] implements both directly for in-process use;
//! [`crate::rpc::RemoteNameServer`] implements them over TCP.

use async_trait::async_trait;

use crate::common::{BlockAssignment, BlockId, RecordStreamOptions, ServerAddress};
use crate::error::Result;
use crate::heartbeat::{DataServerCommand, HeartbeatData};
use crate::nameserver::{BlockKind, ClusterMetrics, DfsDirectory, DfsFile, FileSystemEntry};

/// Operations used by clients.
///
/// Every path must be absolute with no empty components. Namespace mutations fail with
/// `DfsError::SafeMode` while the name server is in safe mode.
#[async_trait]
pub trait NameServerClientProtocol: Send + Sync {
    /// Create a directory and any missing parents.
    async fn create_directory(&self, path: &str) -> Result<()>;

    async fn get_directory_info(&self, path: &str) -> Result<Option<DfsDirectory>>;

    /// Create a file open for writing together with its first block.
    ///
    /// `local_host` asks for a data server on that host to be first in the chain.
    async fn create_file(
        &self,
        path: &str,
        block_size: Option<u64>,
        replication_factor: Option<u32>,
        local_host: Option<String>,
        record_options: RecordStreamOptions,
    ) -> Result<BlockAssignment>;

    /// Allocate the next block of a file that is open for writing. Fails while the previous
    /// block is still pending.
    async fn append_block(&self, path: &str, local_host: Option<String>) -> Result<BlockAssignment>;

    /// Close a file. If its last block is still pending, the close completes when that block is
    /// committed.
    async fn close_file(&self, path: &str) -> Result<()>;

    /// Returns false if nothing exists at `path`.
    async fn delete(&self, path: &str, recursive: bool) -> Result<bool>;

    /// Move a file or directory. Moving onto an existing directory moves into it.
    async fn move_entry(&self, from: &str, to: &str) -> Result<()>;

    async fn get_file_info(&self, path: &str) -> Result<Option<DfsFile>>;

    async fn get_file_system_entry_info(&self, path: &str) -> Result<Option<FileSystemEntry>>;

    async fn get_data_servers_for_block(&self, block_id: BlockId) -> Result<Vec<ServerAddress>>;

    async fn get_blocks(&self, kind: BlockKind) -> Result<Vec<BlockId>>;

    async fn get_metrics(&self) -> Result<ClusterMetrics>;

    /// Forget a data server as if it had died.
    async fn remove_data_server(&self, address: &ServerAddress) -> Result<()>;

    async fn create_checkpoint(&self) -> Result<()>;

    async fn safe_mode(&self) -> Result<bool>;

    async fn set_safe_mode(&self, enabled: bool) -> Result<()>;

    /// Default block size for new files.
    async fn block_size(&self) -> Result<u64>;
}

/// Operations used by data servers.
#[async_trait]
pub trait NameServerHeartbeatProtocol: Send + Sync {
    async fn heartbeat(&self, address: &ServerAddress, data: Vec<HeartbeatData>) -> Result<Vec<DataServerCommand>>;
}
