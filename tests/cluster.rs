mod common;

use common::{name_server_config, pattern, wait_for, Cluster, BLOCK_SIZE};
use dfs::common::RecordStreamOptions;
use dfs::config::NameServerConfig;
use dfs::nameserver::FileSystemEntry;
use dfs::protocols::NameServerClientProtocol;
use dfs::DfsError;

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn writes_and_reads_a_multi_block_file() -> anyhow::Result<()> {
    let cluster = Cluster::start(1, 1).await?;
    let client = cluster.client();
    let data = pattern(BLOCK_SIZE as usize * 2 + 1000, 7);

    client.create_directory("/data").await?;
    client.upload("/data/file", &data).await?;

    let file = client.get_file_info("/data/file").await?.expect("file exists");
    assert!(!file.is_open_for_writing);
    assert_eq!(file.size, data.len() as u64);
    let sizes: Vec<u64> = file.blocks.iter().map(|b| b.size).collect();
    assert_eq!(sizes, vec![BLOCK_SIZE, BLOCK_SIZE, 1000]);

    assert_eq!(client.download("/data/file").await?, data);

    let mut stream = client.open_file("/data/file").await?;
    stream.seek(BLOCK_SIZE - 10);
    let mut buf = vec![0; 20];
    let mut read = 0;
    while read < buf.len() {
        read += stream.read(&mut buf[read..]).await?;
    }
    assert_eq!(buf, &data[BLOCK_SIZE as usize - 10..BLOCK_SIZE as usize + 10]);

    let range = client.read_block_range(file.blocks[1].id, 100, 50).await?;
    assert_eq!(range, &data[BLOCK_SIZE as usize + 100..BLOCK_SIZE as usize + 150]);

    let metrics = cluster.name_server.get_metrics();
    assert_eq!(metrics.total_block_count, 3);
    assert_eq!(metrics.total_size, data.len() as u64);
    assert_eq!(metrics.pending_block_count, 0);
    Ok(())
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn open_ended_block_ranges_stop_at_the_block_end() -> anyhow::Result<()> {
    let cluster = Cluster::start(1, 1).await?;
    let client = cluster.client();
    let data = pattern(BLOCK_SIZE as usize + 1000, 5);
    client.upload("/file", &data).await?;

    let file = client.get_file_info("/file").await?.expect("file exists");
    let tail = client.read_block_range(file.blocks[1].id, 0, u64::MAX).await?;
    assert_eq!(tail, &data[BLOCK_SIZE as usize..]);
    let head = client.read_block_range(file.blocks[0].id, 100, u64::MAX).await?;
    assert_eq!(head, &data[100..BLOCK_SIZE as usize]);
    Ok(())
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn empty_files_have_one_empty_block() -> anyhow::Result<()> {
    let cluster = Cluster::start(1, 1).await?;
    let client = cluster.client();

    client.upload("/empty", &[]).await?;

    let file = client.get_file_info("/empty").await?.expect("file exists");
    assert_eq!(file.size, 0);
    assert_eq!(file.blocks.len(), 1);
    assert_eq!(file.blocks[0].size, 0);
    assert!(client.download("/empty").await?.is_empty());
    Ok(())
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn records_never_straddle_blocks() -> anyhow::Result<()> {
    let cluster = Cluster::start(1, 1).await?;
    let client = cluster.client();
    let records: Vec<Vec<u8>> = (0..5).map(|i| pattern(50_000, i)).collect();

    let mut stream = client
        .create_file("/records", None, None, RecordStreamOptions::aligned())
        .await?;
    for record in &records {
        // Written in two halves; nothing leaves the stream until the record is marked.
        stream.write(&record[..20_000]).await?;
        stream.write(&record[20_000..]).await?;
        stream.mark_record().await?;
    }
    let padding = BLOCK_SIZE - 100_000;
    assert_eq!(stream.padding(), padding * 2);
    assert_eq!(stream.length(), 250_000 + padding * 2);
    stream.close().await?;

    let file = client.get_file_info("/records").await?.expect("file exists");
    assert!(file.record_options.record_aligned);
    let sizes: Vec<u64> = file.blocks.iter().map(|b| b.size).collect();
    assert_eq!(sizes, vec![100_000, 100_000, 50_000]);
    assert_eq!(client.download("/records").await?, records.concat());
    Ok(())
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn oversized_records_are_rejected() -> anyhow::Result<()> {
    let cluster = Cluster::start(1, 1).await?;
    let client = cluster.client();

    let mut stream = client
        .create_file("/records", None, None, RecordStreamOptions::aligned())
        .await?;
    stream.write(&pattern(BLOCK_SIZE as usize + 1, 1)).await?;
    assert!(matches!(stream.mark_record().await, Err(DfsError::InvalidOperation(_))));

    // The stream stays usable after a rejected record.
    stream.write(&pattern(10, 2)).await?;
    stream.mark_record().await?;
    stream.close().await?;
    assert_eq!(client.download("/records").await?, pattern(10, 2));
    Ok(())
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn blocks_are_replicated_through_the_pipeline() -> anyhow::Result<()> {
    let cluster = Cluster::start(3, 3).await?;
    let client = cluster.client();
    let data = pattern(BLOCK_SIZE as usize + 5, 3);

    client.upload("/replicated", &data).await?;

    let file = client.get_file_info("/replicated").await?.expect("file exists");
    assert_eq!(file.replication_factor, 3);
    assert_eq!(file.blocks.len(), 2);
    for block in &file.blocks {
        let mut replicas = client.name_server().get_data_servers_for_block(block.id).await?;
        replicas.sort();
        let mut all = cluster.data_server_addresses();
        all.sort();
        assert_eq!(replicas, all);
    }
    let metrics = cluster.name_server.get_metrics();
    assert_eq!(metrics.under_replicated_block_count, 0);
    assert!(metrics.data_servers.iter().all(|server| server.block_count == 2));
    Ok(())
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn reads_fall_back_to_another_replica() -> anyhow::Result<()> {
    let mut cluster = Cluster::start(2, 2).await?;
    let client = cluster.client();
    let data = pattern(BLOCK_SIZE as usize + 300, 9);
    client.upload("/file", &data).await?;

    let file = client.get_file_info("/file").await?.expect("file exists");
    let replicas = client.name_server().get_data_servers_for_block(file.blocks[0].id).await?;
    assert_eq!(replicas.len(), 2);
    cluster.stop_data_server(&replicas[0]).await?;

    assert_eq!(client.download("/file").await?, data);
    Ok(())
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn namespace_operations_over_rpc() -> anyhow::Result<()> {
    let cluster = Cluster::start(1, 1).await?;
    let client = cluster.client();

    client.create_directory("/a/b").await?;
    client.upload("/a/b/file", b"hello").await?;
    client.move_entry("/a/b/file", "/a/renamed").await?;
    assert!(client.get_file_info("/a/b/file").await?.is_none());
    assert_eq!(client.download("/a/renamed").await?, b"hello");

    let dir = client.get_directory_info("/a").await?.expect("directory exists");
    let mut names: Vec<&str> = dir.children.iter().map(FileSystemEntry::name).collect();
    names.sort();
    assert_eq!(names, vec!["b", "renamed"]);

    assert!(matches!(client.open_file("/missing").await, Err(DfsError::NotFound(_))));
    assert!(client.delete("/a", true).await?);
    assert!(!client.delete("/a", true).await?);

    client.name_server().set_safe_mode(true).await?;
    assert!(matches!(client.create_directory("/c").await, Err(DfsError::SafeMode)));
    client.name_server().set_safe_mode(false).await?;
    client.create_directory("/c").await?;
    Ok(())
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn data_servers_restore_lost_replicas_and_delete_released_blocks() -> anyhow::Result<()> {
    let mut cluster = Cluster::start_with(
        3,
        NameServerConfig {
            data_server_timeout_ms: 1_000,
            replication_check_interval_ms: 100,
            ..name_server_config(3, 2)
        },
    )
    .await?;
    let client = cluster.client();
    let data = pattern(1000, 4);
    client.upload("/file", &data).await?;
    let block_id = client.get_file_info("/file").await?.expect("file exists").blocks[0].id;

    let replicas = cluster.name_server.get_data_servers_for_block(block_id)?;
    assert_eq!(replicas.len(), 2);
    let lost = replicas[0].clone();
    cluster.stop_data_server(&lost).await?;

    let name_server = cluster.name_server.clone();
    wait_for("the block to be replicated again", || {
        let holders = name_server.get_data_servers_for_block(block_id)?;
        Ok(holders.len() == 2 && !holders.contains(&lost))
    })
    .await?;
    let holders = cluster.name_server.get_data_servers_for_block(block_id)?;
    for holder in &holders {
        assert!(cluster.stored_blocks(holder)?.contains(&block_id));
    }
    assert_eq!(client.download("/file").await?, data);

    assert!(client.delete("/file", false).await?);
    wait_for("the holders to delete the block", || {
        for holder in &holders {
            if cluster.stored_blocks(holder)?.contains(&block_id) {
                return Ok(false);
            }
        }
        Ok(true)
    })
    .await?;
    Ok(())
}
