use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use dfs::common::{BlockId, ServerAddress, PACKET_SIZE};
use dfs::config::{ClientConfig, DataServerConfig, NameServerConfig};
use dfs::{DataServer, DfsClient, NameServer, RemoteNameServer, RpcServer};
use tempfile::TempDir;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Small blocks so that tests span several of them with little data.
pub const BLOCK_SIZE: u64 = PACKET_SIZE as u64 * 2;

struct RunningDataServer {
    storage_directory: PathBuf,
    shutdown: CancellationToken,
    task: JoinHandle<dfs::Result<()>>,
}

/// A name server and a set of data servers talking over loopback.
pub struct Cluster {
    pub name_server: Arc<NameServer>,
    pub address: ServerAddress,
    data_servers: HashMap<ServerAddress, RunningDataServer>,
    shutdown: CancellationToken,
    _storage: TempDir,
}

impl Cluster {
    pub async fn start(data_servers: usize, replication_factor: u32) -> anyhow::Result<Cluster> {
        Cluster::start_with(data_servers, name_server_config(data_servers, replication_factor)).await
    }

    pub async fn start_with(data_servers: usize, config: NameServerConfig) -> anyhow::Result<Cluster> {
        let storage = tempfile::tempdir()?;
        let shutdown = CancellationToken::new();

        let name_server = Arc::new(NameServer::new(config)?);
        let rpc = RpcServer::bind("127.0.0.1:0", name_server.clone()).await?;
        let address = ServerAddress::from(rpc.local_addr()?);
        tokio::spawn(rpc.run(shutdown.clone()));
        tokio::spawn(name_server.clone().run(shutdown.clone()));

        let mut cluster = Cluster {
            name_server,
            address: address.clone(),
            data_servers: HashMap::new(),
            shutdown,
            _storage: storage,
        };
        for index in 0..data_servers {
            let storage_directory = cluster._storage.path().join(format!("dataserver-{index}"));
            let config = DataServerConfig {
                host: "127.0.0.1".to_string(),
                port: 0,
                name_server_address: address.to_string(),
                storage_directory: storage_directory.clone(),
                disk_capacity: 1024 * 1024 * 1024,
                heartbeat_interval_ms: 100,
                ..Default::default()
            };
            let server = DataServer::bind(config, Arc::new(RemoteNameServer::new(address.clone()))).await?;
            let server_address = server.address().clone();
            let server_shutdown = cluster.shutdown.child_token();
            let task = tokio::spawn(server.run(server_shutdown.clone()));
            cluster.data_servers.insert(
                server_address,
                RunningDataServer {
                    storage_directory,
                    shutdown: server_shutdown,
                    task,
                },
            );
        }

        cluster.wait_until_ready(data_servers).await?;
        Ok(cluster)
    }

    /// Wait for every data server to register and for safe mode to end.
    async fn wait_until_ready(&self, data_servers: usize) -> anyhow::Result<()> {
        for _ in 0..200 {
            let metrics = self.name_server.get_metrics();
            if !metrics.safe_mode && metrics.data_server_count == data_servers {
                return Ok(());
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        anyhow::bail!("cluster did not become ready: {}", self.name_server.get_metrics())
    }

    pub fn client(&self) -> DfsClient {
        DfsClient::connect(self.address.clone(), ClientConfig::default())
    }

    pub fn data_server_addresses(&self) -> Vec<ServerAddress> {
        self.data_servers.keys().cloned().collect()
    }

    /// Blocks stored on disk by a running data server.
    pub fn stored_blocks(&self, address: &ServerAddress) -> anyhow::Result<Vec<BlockId>> {
        let server = self
            .data_servers
            .get(address)
            .ok_or_else(|| anyhow::anyhow!("no data server at {address}"))?;
        let mut blocks = Vec::new();
        for entry in std::fs::read_dir(server.storage_directory.join("blocks"))? {
            let name = entry?.file_name();
            if let Some(id) = name.to_str().and_then(|n| n.strip_prefix("blk_")) {
                blocks.push(id.parse()?);
            }
        }
        Ok(blocks)
    }

    /// Stop one data server. The name server is not told.
    pub async fn stop_data_server(&mut self, address: &ServerAddress) -> anyhow::Result<()> {
        let server = self
            .data_servers
            .remove(address)
            .ok_or_else(|| anyhow::anyhow!("no data server at {address}"))?;
        server.shutdown.cancel();
        server.task.await??;
        Ok(())
    }
}

impl Drop for Cluster {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

pub fn name_server_config(data_servers: usize, replication_factor: u32) -> NameServerConfig {
    NameServerConfig {
        listen_address: "127.0.0.1:0".to_string(),
        block_size: BLOCK_SIZE,
        replication_factor,
        safe_mode_min_data_servers: data_servers,
        ..Default::default()
    }
}

/// Poll `condition` until it holds or a few seconds have passed.
pub async fn wait_for(what: &str, mut condition: impl FnMut() -> anyhow::Result<bool>) -> anyhow::Result<()> {
    for _ in 0..200 {
        if condition()? {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    anyhow::bail!("timed out waiting for {what}")
}

/// Deterministic test data.
pub fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect()
}
