//! TCP transport for the name server protocols.
//!
//! Each request is one frame holding a [`NameServerRequest`]; the reply is one frame holding a
//! [`NameServerResponse`]. A connection carries any number of request/response pairs in turn.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{BufReader, BufWriter};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::common::{BlockAssignment, BlockId, RecordStreamOptions, ServerAddress};
use crate::error::{DfsError, RemoteError, Result};
use crate::heartbeat::{DataServerCommand, HeartbeatData};
use crate::nameserver::{BlockKind, ClusterMetrics, DfsDirectory, DfsFile, FileSystemEntry, NameServer};
use crate::protocol;
use crate::protocols::{NameServerClientProtocol, NameServerHeartbeatProtocol};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum NameServerRequest {
    CreateDirectory {
        path: String,
    },
    GetDirectoryInfo {
        path: String,
    },
    CreateFile {
        path: String,
        block_size: Option<u64>,
        replication_factor: Option<u32>,
        local_host: Option<String>,
        record_options: RecordStreamOptions,
    },
    AppendBlock {
        path: String,
        local_host: Option<String>,
    },
    CloseFile {
        path: String,
    },
    Delete {
        path: String,
        recursive: bool,
    },
    Move {
        from: String,
        to: String,
    },
    GetFileInfo {
        path: String,
    },
    GetFileSystemEntryInfo {
        path: String,
    },
    GetDataServersForBlock {
        block_id: BlockId,
    },
    GetBlocks {
        kind: BlockKind,
    },
    GetMetrics,
    RemoveDataServer {
        address: ServerAddress,
    },
    CreateCheckpoint,
    GetSafeMode,
    SetSafeMode {
        enabled: bool,
    },
    GetBlockSize,
    Heartbeat {
        address: ServerAddress,
        data: Vec<HeartbeatData>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum NameServerResponse {
    Done,
    DirectoryInfo(Option<DfsDirectory>),
    BlockAssignment(BlockAssignment),
    Deleted(bool),
    FileInfo(Option<DfsFile>),
    EntryInfo(Option<FileSystemEntry>),
    DataServers(Vec<ServerAddress>),
    Blocks(Vec<BlockId>),
    Metrics(ClusterMetrics),
    SafeMode(bool),
    BlockSize(u64),
    Commands(Vec<DataServerCommand>),
    Error(RemoteError),
}

fn respond<T>(result: Result<T>, wrap: impl FnOnce(T) -> NameServerResponse) -> NameServerResponse {
    match result {
        Ok(value) => wrap(value),
        Err(e) => NameServerResponse::Error(e.to_remote()),
    }
}

/// Run one request against the name server.
pub fn dispatch(name_server: &NameServer, request: NameServerRequest) -> NameServerResponse {
    use NameServerRequest as Request;
    use NameServerResponse as Response;

    match request {
        Request::CreateDirectory { path } => respond(name_server.create_directory(&path), |_| Response::Done),
        Request::GetDirectoryInfo { path } => respond(name_server.get_directory_info(&path), Response::DirectoryInfo),
        Request::CreateFile {
            path,
            block_size,
            replication_factor,
            local_host,
            record_options,
        } => respond(
            name_server.create_file(&path, block_size, replication_factor, local_host.as_deref(), record_options),
            Response::BlockAssignment,
        ),
        Request::AppendBlock { path, local_host } => respond(
            name_server.append_block(&path, local_host.as_deref()),
            Response::BlockAssignment,
        ),
        Request::CloseFile { path } => respond(name_server.close_file(&path), |_| Response::Done),
        Request::Delete { path, recursive } => respond(name_server.delete(&path, recursive), Response::Deleted),
        Request::Move { from, to } => respond(name_server.move_entry(&from, &to), |_| Response::Done),
        Request::GetFileInfo { path } => respond(name_server.get_file_info(&path), Response::FileInfo),
        Request::GetFileSystemEntryInfo { path } => {
            respond(name_server.get_file_system_entry_info(&path), Response::EntryInfo)
        }
        Request::GetDataServersForBlock { block_id } => {
            respond(name_server.get_data_servers_for_block(block_id), Response::DataServers)
        }
        Request::GetBlocks { kind } => Response::Blocks(name_server.get_blocks(kind)),
        Request::GetMetrics => Response::Metrics(name_server.get_metrics()),
        Request::RemoveDataServer { address } => {
            respond(name_server.remove_data_server(&address), |_| Response::Done)
        }
        Request::CreateCheckpoint => respond(name_server.create_checkpoint(), |_| Response::Done),
        Request::GetSafeMode => Response::SafeMode(name_server.safe_mode()),
        Request::SetSafeMode { enabled } => {
            name_server.set_safe_mode(enabled);
            Response::Done
        }
        Request::GetBlockSize => Response::BlockSize(name_server.block_size()),
        Request::Heartbeat { address, data } => respond(name_server.heartbeat(&address, data), Response::Commands),
    }
}

/// Serves a [`NameServer`] to remote clients and data servers.
pub struct RpcServer {
    name_server: Arc<NameServer>,
    listener: TcpListener,
}

impl RpcServer {
    pub async fn bind(address: &str, name_server: Arc<NameServer>) -> Result<RpcServer> {
        let listener = TcpListener::bind(address).await?;
        info!(address = %listener.local_addr()?, "name server listening");
        Ok(RpcServer { name_server, listener })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections until `shutdown` fires. Each connection is served by its own task.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let name_server = self.name_server.clone();
                        let shutdown = shutdown.clone();
                        tokio::spawn(async move {
                            if let Err(e) = serve_connection(name_server, stream, shutdown).await {
                                warn!(%peer, error = %e, "name server connection failed");
                            }
                        });
                    }
                    Err(e) => warn!(error = %e, "accept failed"),
                },
            }
        }
        Ok(())
    }
}

async fn serve_connection(name_server: Arc<NameServer>, stream: TcpStream, shutdown: CancellationToken) -> Result<()> {
    stream.set_nodelay(true)?;
    let (read_half, write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    let mut writer = BufWriter::new(write_half);
    loop {
        let request = tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            request = protocol::read_frame::<_, NameServerRequest>(&mut reader) => request?,
        };
        let Some(request) = request else {
            return Ok(());
        };
        let response = dispatch(&name_server, request);
        protocol::write_frame(&mut writer, &response).await?;
    }
}

struct Connection {
    reader: BufReader<OwnedReadHalf>,
    writer: BufWriter<OwnedWriteHalf>,
}

impl Connection {
    async fn open(address: &ServerAddress) -> Result<Connection> {
        let stream = protocol::connect(address).await?;
        let (read_half, write_half) = stream.into_split();
        debug!(%address, "connected to name server");
        Ok(Connection {
            reader: BufReader::new(read_half),
            writer: BufWriter::new(write_half),
        })
    }

    async fn exchange(&mut self, request: &NameServerRequest) -> Result<NameServerResponse> {
        protocol::write_frame(&mut self.writer, request).await?;
        protocol::read_frame(&mut self.reader)
            .await?
            .ok_or_else(|| DfsError::Connection("name server closed the connection".into()))
    }
}

/// Client side of the name server protocols over TCP.
///
/// Requests on one instance are serialized over a single connection. A connection that fails
/// is dropped and the next request opens a new one; the failed request is not retried.
pub struct RemoteNameServer {
    address: ServerAddress,
    connection: tokio::sync::Mutex<Option<Connection>>,
}

impl RemoteNameServer {
    pub fn new(address: ServerAddress) -> RemoteNameServer {
        RemoteNameServer {
            address,
            connection: tokio::sync::Mutex::new(None),
        }
    }

    pub fn address(&self) -> &ServerAddress {
        &self.address
    }

    async fn call(&self, request: NameServerRequest) -> Result<NameServerResponse> {
        let mut slot = self.connection.lock().await;
        let mut connection = match slot.take() {
            Some(connection) => connection,
            None => Connection::open(&self.address).await?,
        };
        let response = connection.exchange(&request).await?;
        *slot = Some(connection);
        match response {
            NameServerResponse::Error(e) => Err(e.into()),
            response => Ok(response),
        }
    }
}

fn unexpected(response: NameServerResponse) -> DfsError {
    DfsError::Protocol(format!("unexpected name server response {response:?}"))
}

#[async_trait]
impl NameServerClientProtocol for RemoteNameServer {
    async fn create_directory(&self, path: &str) -> Result<()> {
        match self.call(NameServerRequest::CreateDirectory { path: path.to_string() }).await? {
            NameServerResponse::Done => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    async fn get_directory_info(&self, path: &str) -> Result<Option<DfsDirectory>> {
        match self.call(NameServerRequest::GetDirectoryInfo { path: path.to_string() }).await? {
            NameServerResponse::DirectoryInfo(info) => Ok(info),
            other => Err(unexpected(other)),
        }
    }

    async fn create_file(
        &self,
        path: &str,
        block_size: Option<u64>,
        replication_factor: Option<u32>,
        local_host: Option<String>,
        record_options: RecordStreamOptions,
    ) -> Result<BlockAssignment> {
        let request = NameServerRequest::CreateFile {
            path: path.to_string(),
            block_size,
            replication_factor,
            local_host,
            record_options,
        };
        match self.call(request).await? {
            NameServerResponse::BlockAssignment(assignment) => Ok(assignment),
            other => Err(unexpected(other)),
        }
    }

    async fn append_block(&self, path: &str, local_host: Option<String>) -> Result<BlockAssignment> {
        let request = NameServerRequest::AppendBlock {
            path: path.to_string(),
            local_host,
        };
        match self.call(request).await? {
            NameServerResponse::BlockAssignment(assignment) => Ok(assignment),
            other => Err(unexpected(other)),
        }
    }

    async fn close_file(&self, path: &str) -> Result<()> {
        match self.call(NameServerRequest::CloseFile { path: path.to_string() }).await? {
            NameServerResponse::Done => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    async fn delete(&self, path: &str, recursive: bool) -> Result<bool> {
        let request = NameServerRequest::Delete {
            path: path.to_string(),
            recursive,
        };
        match self.call(request).await? {
            NameServerResponse::Deleted(deleted) => Ok(deleted),
            other => Err(unexpected(other)),
        }
    }

    async fn move_entry(&self, from: &str, to: &str) -> Result<()> {
        let request = NameServerRequest::Move {
            from: from.to_string(),
            to: to.to_string(),
        };
        match self.call(request).await? {
            NameServerResponse::Done => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    async fn get_file_info(&self, path: &str) -> Result<Option<DfsFile>> {
        match self.call(NameServerRequest::GetFileInfo { path: path.to_string() }).await? {
            NameServerResponse::FileInfo(info) => Ok(info),
            other => Err(unexpected(other)),
        }
    }

    async fn get_file_system_entry_info(&self, path: &str) -> Result<Option<FileSystemEntry>> {
        let request = NameServerRequest::GetFileSystemEntryInfo { path: path.to_string() };
        match self.call(request).await? {
            NameServerResponse::EntryInfo(info) => Ok(info),
            other => Err(unexpected(other)),
        }
    }

    async fn get_data_servers_for_block(&self, block_id: BlockId) -> Result<Vec<ServerAddress>> {
        match self.call(NameServerRequest::GetDataServersForBlock { block_id }).await? {
            NameServerResponse::DataServers(servers) => Ok(servers),
            other => Err(unexpected(other)),
        }
    }

    async fn get_blocks(&self, kind: BlockKind) -> Result<Vec<BlockId>> {
        match self.call(NameServerRequest::GetBlocks { kind }).await? {
            NameServerResponse::Blocks(blocks) => Ok(blocks),
            other => Err(unexpected(other)),
        }
    }

    async fn get_metrics(&self) -> Result<ClusterMetrics> {
        match self.call(NameServerRequest::GetMetrics).await? {
            NameServerResponse::Metrics(metrics) => Ok(metrics),
            other => Err(unexpected(other)),
        }
    }

    async fn remove_data_server(&self, address: &ServerAddress) -> Result<()> {
        let request = NameServerRequest::RemoveDataServer {
            address: address.clone(),
        };
        match self.call(request).await? {
            NameServerResponse::Done => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    async fn create_checkpoint(&self) -> Result<()> {
        match self.call(NameServerRequest::CreateCheckpoint).await? {
            NameServerResponse::Done => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    async fn safe_mode(&self) -> Result<bool> {
        match self.call(NameServerRequest::GetSafeMode).await? {
            NameServerResponse::SafeMode(enabled) => Ok(enabled),
            other => Err(unexpected(other)),
        }
    }

    async fn set_safe_mode(&self, enabled: bool) -> Result<()> {
        match self.call(NameServerRequest::SetSafeMode { enabled }).await? {
            NameServerResponse::Done => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    async fn block_size(&self) -> Result<u64> {
        match self.call(NameServerRequest::GetBlockSize).await? {
            NameServerResponse::BlockSize(size) => Ok(size),
            other => Err(unexpected(other)),
        }
    }
}

#[async_trait]
impl NameServerHeartbeatProtocol for RemoteNameServer {
    async fn heartbeat(&self, address: &ServerAddress, data: Vec<HeartbeatData>) -> Result<Vec<DataServerCommand>> {
        let request = NameServerRequest::Heartbeat {
            address: address.clone(),
            data,
        };
        match self.call(request).await? {
            NameServerResponse::Commands(commands) => Ok(commands),
            other => Err(unexpected(other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NameServerConfig;

    async fn start() -> (Arc<NameServer>, RemoteNameServer, CancellationToken) {
        let name_server = Arc::new(NameServer::new(NameServerConfig::default()).unwrap());
        let server = RpcServer::bind("127.0.0.1:0", name_server.clone()).await.unwrap();
        let address = ServerAddress::from(server.local_addr().unwrap());
        let shutdown = CancellationToken::new();
        tokio::spawn(server.run(shutdown.clone()));
        (name_server, RemoteNameServer::new(address), shutdown)
    }

    #[tokio::test]
    async fn errors_keep_their_kind_across_the_wire() {
        let (_name_server, remote, shutdown) = start().await;

        assert!(remote.safe_mode().await.unwrap());
        assert!(matches!(remote.create_directory("/data").await, Err(DfsError::SafeMode)));
        assert!(matches!(
            remote.get_file_info("relative").await,
            Err(DfsError::InvalidPath(_))
        ));

        remote.set_safe_mode(false).await.unwrap();
        remote.create_directory("/data").await.unwrap();
        let entry = remote.get_file_system_entry_info("/data").await.unwrap().unwrap();
        assert!(matches!(entry, FileSystemEntry::Directory(ref dir) if dir.path == "/data"));
        assert!(matches!(
            remote.create_file("/data/f", None, None, None, RecordStreamOptions::default()).await,
            Err(DfsError::NotEnoughDataServers(_))
        ));
        shutdown.cancel();
    }

    #[tokio::test]
    async fn heartbeats_reach_the_name_server() {
        let (name_server, remote, shutdown) = start().await;
        let address = ServerAddress::new("127.0.0.1", 7000);

        let commands = remote
            .heartbeat(&address, vec![HeartbeatData::Initial { file_system_id: None }])
            .await
            .unwrap();
        assert_eq!(commands, vec![DataServerCommand::ReportBlocks]);
        remote
            .heartbeat(&address, vec![HeartbeatData::BlockReport { blocks: vec![] }])
            .await
            .unwrap();

        assert!(!name_server.safe_mode());
        let metrics = remote.get_metrics().await.unwrap();
        assert_eq!(metrics.data_server_count, 1);
        assert_eq!(remote.block_size().await.unwrap(), name_server.block_size());
        shutdown.cancel();
    }

    #[tokio::test]
    async fn unreachable_name_server_is_a_connection_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = ServerAddress::from(listener.local_addr().unwrap());
        drop(listener);

        let remote = RemoteNameServer::new(address);
        assert!(matches!(remote.safe_mode().await, Err(DfsError::Connection(_))));
    }
}
