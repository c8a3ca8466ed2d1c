use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use byte_unit::Byte;
use dfs::common::{RecordStreamOptions, ServerAddress};
use dfs::config::{ClientConfig, DataServerConfig, NameServerConfig};
use dfs::nameserver::FileSystemEntry;
use dfs::{DataServer, DfsClient, NameServer, RemoteNameServer, RpcServer};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

const DATA_SERVERS: usize = 3;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let shutdown = CancellationToken::new();
    let data_root = PathBuf::from("./data");

    // Setup the name server.
    let name_server = Arc::new(NameServer::new(NameServerConfig {
        block_size: 1024 * 1024,
        replication_factor: 2,
        safe_mode_min_data_servers: DATA_SERVERS,
        image_directory: Some(data_root.join("nameserver")),
        ..Default::default()
    })?);
    let rpc = RpcServer::bind("127.0.0.1:0", name_server.clone()).await?;
    let address = ServerAddress::from(rpc.local_addr()?);
    tokio::spawn(rpc.run(shutdown.clone()));
    tokio::spawn(name_server.clone().run(shutdown.clone()));
    info!(%address, "name server started");

    // Setup data servers 1-N.
    for i in 0..DATA_SERVERS {
        let config = DataServerConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
            name_server_address: address.to_string(),
            storage_directory: data_root.join(format!("dataserver-{i}")),
            disk_capacity: 1024 * 1024 * 1024,
            heartbeat_interval_ms: 500,
            ..Default::default()
        };
        let server = DataServer::bind(config, Arc::new(RemoteNameServer::new(address.clone()))).await?;
        tokio::spawn(server.run(shutdown.clone()));
    }

    // Poll until the name server has left safe mode.
    while name_server.safe_mode() {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    let client = DfsClient::connect(address, ClientConfig::default());
    // The namespace survives restarts through the checkpoint.
    client.delete("/files", true).await?;
    client.create_directory("/files").await?;

    let data: Vec<u8> = (0..3 * 1024 * 1024 + 17).map(|i| (i % 251) as u8).collect();
    client.upload("/files/blob", &data).await?;

    let mut log = client
        .create_file("/files/log", None, None, RecordStreamOptions::aligned())
        .await?;
    for i in 0..10_000 {
        log.write(format!("record {i}: hello world\n").as_bytes()).await?;
        log.mark_record().await?;
    }
    log.close().await?;
    println!("wrote {:#} with {:#} of padding", Byte::from_u64(log.length()), Byte::from_u64(log.padding()));

    let read_back = client.download("/files/blob").await?;
    anyhow::ensure!(read_back == data, "read back different data");

    println!("ls /files");
    if let Some(dir) = client.get_directory_info("/files").await? {
        for entry in &dir.children {
            match entry {
                FileSystemEntry::File(file) => println!(
                    "  {:<10} {:>12} {} blocks",
                    file.name,
                    format!("{:#}", Byte::from_u64(file.size)),
                    file.blocks.len()
                ),
                FileSystemEntry::Directory(dir) => println!("  {}/", dir.name),
            }
        }
    }
    println!("{}", name_server.get_metrics());

    name_server.create_checkpoint()?;
    shutdown.cancel();
    Ok(())
}
