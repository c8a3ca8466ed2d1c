//! The data server: stores blocks, takes part in replica pipelines and serves reads.
//!
//! Every connection starts with a [`DataServerHeader`]. A write is stored locally and forwarded
//! to the rest of the chain through a [`BlockSender`]; once the whole chain has stored the block
//! this server tells the name server with a `NewBlock` heartbeat and only then reports success
//! upstream, so a writer never asks for its next block before the previous one is committed.

pub mod storage;

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::io::{AsyncWriteExt, BufReader, BufWriter};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::common::{BlockAssignment, BlockId, ServerAddress};
use crate::config::DataServerConfig;
use crate::error::{DfsError, Result};
use crate::heartbeat::{DataServerCommand, HeartbeatData};
use crate::packet::{Packet, PacketFormat};
use crate::pipeline::{self, BlockSender, Upstream};
use crate::protocol::{self, DataServerHeader, DataServerStatus};
use crate::protocols::NameServerHeartbeatProtocol;
use storage::{BlockFileWriter, BlockStorage};

/// Extra payloads the name server asked for.
#[derive(Default)]
struct HeartbeatRequests {
    initial: bool,
    block_report: bool,
}

struct DataServerInner {
    config: DataServerConfig,
    address: ServerAddress,
    storage: BlockStorage,
    name_server: Arc<dyn NameServerHeartbeatProtocol>,
    requests: Mutex<HeartbeatRequests>,
    /// Wakes the heartbeat loop before its next tick.
    wake: Notify,
}

pub struct DataServer {
    inner: Arc<DataServerInner>,
    listener: TcpListener,
}

impl DataServer {
    /// Open the storage directory and bind the listening socket. With port 0 the advertised
    /// address uses the port the OS picked.
    pub async fn bind(config: DataServerConfig, name_server: Arc<dyn NameServerHeartbeatProtocol>) -> Result<DataServer> {
        let storage = BlockStorage::open(&config.storage_directory, config.disk_capacity)?;
        let listener = TcpListener::bind((config.host.as_str(), config.port)).await?;
        let address = ServerAddress::new(config.host.clone(), listener.local_addr()?.port());
        info!(%address, "data server listening");

        Ok(DataServer {
            inner: Arc::new(DataServerInner {
                config,
                address,
                storage,
                name_server,
                requests: Mutex::new(HeartbeatRequests {
                    initial: true,
                    block_report: false,
                }),
                wake: Notify::new(),
            }),
            listener,
        })
    }

    pub fn address(&self) -> &ServerAddress {
        &self.inner.address
    }

    /// Serve connections and send heartbeats until `shutdown` fires.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let DataServer { inner, listener } = self;
        let heartbeats = tokio::spawn(inner.clone().heartbeat_loop(shutdown.clone()));

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let inner = inner.clone();
                        tokio::spawn(async move {
                            if let Err(e) = inner.handle_connection(stream).await {
                                warn!(%peer, error = %e, "data server connection failed");
                            }
                        });
                    }
                    Err(e) => warn!(error = %e, "accept failed"),
                },
            }
        }

        if let Err(e) = heartbeats.await {
            error!(error = %e, "heartbeat task panicked");
        }
        info!(address = %inner.address, "data server stopped");
        Ok(())
    }
}

impl DataServerInner {
    async fn heartbeat_loop(self: Arc<Self>, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(self.config.heartbeat_interval());
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {}
                _ = self.wake.notified() => {}
            }
            if let Err(e) = self.send_heartbeat().await {
                warn!(error = %e, "heartbeat failed");
            }
        }
    }

    fn status(&self) -> HeartbeatData {
        let (disk_space_used, disk_space_free, disk_space_total) = self.storage.disk_status();
        HeartbeatData::Status {
            disk_space_used,
            disk_space_free,
            disk_space_total,
        }
    }

    async fn send_heartbeat(self: &Arc<Self>) -> Result<()> {
        let requests = std::mem::take(&mut *self.requests.lock());
        let mut data = vec![self.status()];
        if requests.initial {
            data.push(HeartbeatData::Initial {
                file_system_id: self.config.file_system_id,
            });
        }
        if requests.block_report {
            data.push(HeartbeatData::BlockReport {
                blocks: self.storage.block_ids(),
            });
        }

        if let Err(e) = self.heartbeat(data).await {
            // Ask again with the next heartbeat.
            let mut pending = self.requests.lock();
            pending.initial |= requests.initial;
            pending.block_report |= requests.block_report;
            return Err(e);
        }
        Ok(())
    }

    /// Send one heartbeat and carry out the commands that come back.
    async fn heartbeat(self: &Arc<Self>, data: Vec<HeartbeatData>) -> Result<()> {
        let commands = self.name_server.heartbeat(&self.address, data).await?;
        for command in commands {
            self.execute(command).await;
        }
        Ok(())
    }

    async fn execute(self: &Arc<Self>, command: DataServerCommand) {
        match command {
            DataServerCommand::None => {}
            DataServerCommand::SendInitialData => {
                self.requests.lock().initial = true;
                self.wake.notify_one();
            }
            DataServerCommand::ReportBlocks => {
                self.requests.lock().block_report = true;
                self.wake.notify_one();
            }
            DataServerCommand::DeleteBlocks { blocks } => {
                for block_id in blocks {
                    match self.storage.delete(&block_id).await {
                        Ok(true) => info!(%block_id, "deleted block"),
                        Ok(false) => debug!(%block_id, "block to delete is not stored here"),
                        Err(e) => warn!(%block_id, error = %e, "could not delete block"),
                    }
                }
            }
            DataServerCommand::ReplicateBlock { assignment } => {
                let inner = self.clone();
                tokio::spawn(async move {
                    let block_id = assignment.block_id;
                    if let Err(e) = inner.replicate_block(assignment).await {
                        warn!(%block_id, error = %e, "replication failed");
                    }
                });
            }
        }
    }

    /// Push a stored block through a new pipeline to the assignment's data servers.
    #[instrument(skip(self, assignment), fields(block_id = %assignment.block_id))]
    async fn replicate_block(&self, assignment: BlockAssignment) -> Result<()> {
        let (mut reader, _) = self.storage.reader(assignment.block_id, 0).await?;
        let mut sender = BlockSender::connect(assignment.block_id, &assignment.data_servers, None).await?;
        let mut packet = Packet::new();
        let mut sequence_number = 0;
        loop {
            reader.next_packet(&mut packet, self.config.verify_checksums).await?;
            packet.set_sequence_number(sequence_number);
            sender.send_packet(&packet).await?;
            sequence_number += 1;
            if packet.is_last_packet() {
                break;
            }
        }
        sender.wait_for_acknowledgements().await?;
        info!(targets = ?assignment.data_servers, "replicated block");
        Ok(())
    }

    async fn handle_connection(self: Arc<Self>, stream: TcpStream) -> Result<()> {
        stream.set_nodelay(true)?;
        let (read_half, write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);
        let Some(header) = protocol::read_frame::<_, DataServerHeader>(&mut reader).await? else {
            return Ok(());
        };
        match header {
            DataServerHeader::WriteBlock { block_id, data_servers } => {
                self.write_block(block_id, data_servers, reader, write_half).await
            }
            DataServerHeader::ReadBlock { block_id, offset, size } => {
                let mut writer = BufWriter::new(write_half);
                self.read_block(block_id, offset, size, &mut writer).await
            }
        }
    }

    #[instrument(skip(self, data_servers, reader, writer), fields(downstream = data_servers.len()))]
    async fn write_block(
        self: &Arc<Self>,
        block_id: BlockId,
        data_servers: Vec<ServerAddress>,
        mut reader: BufReader<OwnedReadHalf>,
        writer: OwnedWriteHalf,
    ) -> Result<()> {
        let upstream = pipeline::upstream(writer);

        let mut file = match self.storage.create(block_id).await {
            Ok(file) => file,
            Err(e) => {
                send_status(&upstream, DataServerStatus::Error).await;
                return Err(e);
            }
        };
        let mut sender = match BlockSender::connect(block_id, &data_servers, Some(upstream.clone())).await {
            Ok(sender) => sender,
            Err(e) => {
                self.storage.abort(file).await;
                send_status(&upstream, DataServerStatus::Error).await;
                return Err(e);
            }
        };
        send_status(&upstream, DataServerStatus::Ok).await;

        if let Err(e) = self.receive_packets(&mut reader, &mut file, &mut sender).await {
            sender.cancel();
            self.storage.abort(file).await;
            send_status(&upstream, DataServerStatus::Error).await;
            return Err(e);
        }
        let size = match self.storage.commit(file).await {
            Ok(size) => size,
            Err(e) => {
                sender.cancel();
                send_status(&upstream, DataServerStatus::Error).await;
                return Err(e);
            }
        };

        let committed = async {
            sender.wait_for_acknowledgements().await?;
            self.notify_new_block(block_id, size).await
        }
        .await;
        if let Err(e) = committed {
            if let Err(delete_error) = self.storage.delete(&block_id).await {
                warn!(error = %delete_error, "could not remove block after failed write");
            }
            send_status(&upstream, DataServerStatus::Error).await;
            return Err(e);
        }

        let mut writer = upstream.lock().await;
        protocol::write_status(&mut *writer, DataServerStatus::Ok).await?;
        writer.shutdown().await?;
        info!(size, "block written");
        Ok(())
    }

    async fn receive_packets(
        &self,
        reader: &mut BufReader<OwnedReadHalf>,
        file: &mut BlockFileWriter,
        sender: &mut BlockSender,
    ) -> Result<()> {
        let mut packet = Packet::new();
        loop {
            packet
                .read(reader, PacketFormat::Full, self.config.verify_checksums)
                .await?;
            file.write_packet(&packet).await?;
            sender.send_packet(&packet).await?;
            if packet.is_last_packet() {
                return Ok(());
            }
        }
    }

    /// Report a stored block to the name server and wait for the answer.
    async fn notify_new_block(self: &Arc<Self>, block_id: BlockId, size: u64) -> Result<()> {
        self.heartbeat(vec![HeartbeatData::NewBlock { block_id, size }]).await
    }

    #[instrument(skip(self, writer))]
    async fn read_block(
        &self,
        block_id: BlockId,
        offset: u64,
        size: Option<u64>,
        writer: &mut BufWriter<OwnedWriteHalf>,
    ) -> Result<()> {
        let Some(block_size) = self.storage.block_size(&block_id) else {
            protocol::write_status(writer, DataServerStatus::Error).await?;
            return Err(DfsError::UnknownBlock(block_id));
        };
        if offset > block_size {
            protocol::write_status(writer, DataServerStatus::OutOfRange).await?;
            return Ok(());
        }
        let end = size.map_or(block_size, |size| offset.saturating_add(size).min(block_size));

        let (mut reader, aligned_offset) = match self.storage.reader(block_id, offset).await {
            Ok(opened) => opened,
            Err(e) => {
                protocol::write_status(writer, DataServerStatus::Error).await?;
                return Err(e);
            }
        };
        protocol::write_status(writer, DataServerStatus::Ok).await?;
        writer.write_u64_le(aligned_offset).await?;

        let mut packet = Packet::new();
        let mut position = aligned_offset;
        loop {
            reader.next_packet(&mut packet, self.config.verify_checksums).await?;
            position += packet.size() as u64;
            let done = packet.is_last_packet() || position >= end;
            if done {
                packet.mark_last_packet();
            }
            packet.write(writer, PacketFormat::NoSequenceNumber).await?;
            if done {
                break;
            }
        }
        writer.flush().await?;
        debug!(bytes = position - aligned_offset, "served block read");
        Ok(())
    }
}

/// Best-effort status to the upstream side of a write. Failing to deliver it means the upstream
/// is gone, which it will notice on its own.
async fn send_status(upstream: &Upstream, status: DataServerStatus) {
    let mut writer = upstream.lock().await;
    if let Err(e) = protocol::write_status(&mut *writer, status).await {
        debug!(error = %e, "could not send status upstream");
    }
}
