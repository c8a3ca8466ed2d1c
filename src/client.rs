//! The client facade: namespace calls plus the block streams.

use std::sync::Arc;

use tracing::info;

use crate::common::{BlockId, RecordStreamOptions, ServerAddress};
use crate::config::ClientConfig;
use crate::error::{DfsError, Result};
use crate::input_stream::{self, BlockInputStream, LocationCache};
use crate::nameserver::{DfsDirectory, DfsFile, FileSystemEntry};
use crate::output_stream::BlockOutputStream;
use crate::protocols::NameServerClientProtocol;
use crate::rpc::RemoteNameServer;

pub struct DfsClient {
    name_server: Arc<dyn NameServerClientProtocol>,
    config: ClientConfig,
    locations: Arc<LocationCache>,
}

impl DfsClient {
    pub fn new(name_server: Arc<dyn NameServerClientProtocol>, config: ClientConfig) -> DfsClient {
        let locations = Arc::new(LocationCache::new(config.location_cache_size));
        DfsClient {
            name_server,
            config,
            locations,
        }
    }

    /// A client talking to a name server over TCP.
    pub fn connect(address: ServerAddress, config: ClientConfig) -> DfsClient {
        DfsClient::new(Arc::new(RemoteNameServer::new(address)), config)
    }

    pub fn name_server(&self) -> &Arc<dyn NameServerClientProtocol> {
        &self.name_server
    }

    pub async fn create_directory(&self, path: &str) -> Result<()> {
        self.name_server.create_directory(path).await
    }

    pub async fn get_directory_info(&self, path: &str) -> Result<Option<DfsDirectory>> {
        self.name_server.get_directory_info(path).await
    }

    pub async fn get_file_info(&self, path: &str) -> Result<Option<DfsFile>> {
        self.name_server.get_file_info(path).await
    }

    pub async fn get_entry_info(&self, path: &str) -> Result<Option<FileSystemEntry>> {
        self.name_server.get_file_system_entry_info(path).await
    }

    pub async fn delete(&self, path: &str, recursive: bool) -> Result<bool> {
        self.name_server.delete(path, recursive).await
    }

    pub async fn move_entry(&self, from: &str, to: &str) -> Result<()> {
        self.name_server.move_entry(from, to).await
    }

    /// Create a file and return a stream for writing it. `None` picks the name server's
    /// defaults for the block size and replication factor.
    pub async fn create_file(
        &self,
        path: &str,
        block_size: Option<u64>,
        replication_factor: Option<u32>,
        record_options: RecordStreamOptions,
    ) -> Result<BlockOutputStream> {
        let local_host = self.config.local_host();
        let assignment = self
            .name_server
            .create_file(path, block_size, replication_factor, local_host.clone(), record_options)
            .await?;
        let block_size = match block_size {
            Some(size) => size,
            None => self.name_server.block_size().await?,
        };
        Ok(BlockOutputStream::new(
            self.name_server.clone(),
            path.to_string(),
            assignment,
            block_size,
            record_options,
            local_host,
        ))
    }

    /// Open a closed file for reading.
    pub async fn open_file(&self, path: &str) -> Result<BlockInputStream> {
        let file = self
            .name_server
            .get_file_info(path)
            .await?
            .ok_or_else(|| DfsError::NotFound(path.to_string()))?;
        if file.is_open_for_writing {
            return Err(DfsError::InvalidOperation(format!("{path} is still open for writing")));
        }
        Ok(BlockInputStream::new(
            self.name_server.clone(),
            self.locations.clone(),
            file,
            self.config.verify_checksums,
        ))
    }

    /// Read `size` bytes of a single block starting at `offset`.
    pub async fn read_block_range(&self, block_id: BlockId, offset: u64, size: u64) -> Result<Vec<u8>> {
        input_stream::read_block_range(
            self.name_server.as_ref(),
            &self.locations,
            block_id,
            offset,
            size,
            self.config.verify_checksums,
        )
        .await
    }

    /// Write `data` as a new file with default settings.
    pub async fn upload(&self, path: &str, data: &[u8]) -> Result<()> {
        let mut stream = self.create_file(path, None, None, RecordStreamOptions::default()).await?;
        let written = stream.write(data).await;
        let closed = stream.close().await;
        written?;
        closed?;
        info!(path, bytes = data.len(), "uploaded file");
        Ok(())
    }

    /// Read a whole file.
    pub async fn download(&self, path: &str) -> Result<Vec<u8>> {
        self.open_file(path).await?.read_to_end().await
    }
}
