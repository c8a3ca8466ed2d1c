//! The name server: the namespace, the block map and the data server table.
//!
//! All state lives in one [`NameServerState`] behind a reader-writer lock. Queries take the read
//! lock; every mutation, including heartbeat processing, takes the write lock and checks the
//! safe-mode flag under it, so the check and the mutation it guards are atomic. No lock is ever
//! held across an `.await`.

mod blocks;
mod checkpoint;
mod dataservers;
mod namespace;

pub use blocks::BlockKind;
pub use dataservers::DataServerMetrics;
pub use namespace::{DfsDirectory, DfsFile, FileBlock, FileSystemEntry};

use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use byte_unit::Byte;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::common::{BlockAssignment, BlockId, RecordStreamOptions, ServerAddress};
use crate::config::{validate_block_size, NameServerConfig};
use crate::error::{DfsError, Result};
use crate::heartbeat::{DataServerCommand, HeartbeatData};
use crate::protocols::{NameServerClientProtocol, NameServerHeartbeatProtocol};
use blocks::{BlockInfo, BlockTable, PendingBlock};
use checkpoint::FileSystemImage;
use dataservers::{choose_data_servers, DataServerInfo};
use namespace::{FileId, FileRecord, Namespace};

/// Aggregate view of the cluster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterMetrics {
    pub total_block_count: usize,
    /// Sum of the sizes of all committed blocks, excluding replicas.
    pub total_size: u64,
    pub pending_block_count: usize,
    pub under_replicated_block_count: usize,
    pub data_server_count: usize,
    pub data_servers: Vec<DataServerMetrics>,
    pub safe_mode: bool,
}

impl fmt::Display for ClusterMetrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Blocks:            {}", self.total_block_count)?;
        writeln!(f, "Total size:        {:#}", Byte::from_u64(self.total_size))?;
        writeln!(f, "Pending blocks:    {}", self.pending_block_count)?;
        writeln!(f, "Under-replicated:  {}", self.under_replicated_block_count)?;
        writeln!(f, "Safe mode:         {}", if self.safe_mode { "ON" } else { "OFF" })?;
        writeln!(f, "Data servers:      {}", self.data_server_count)?;
        for server in &self.data_servers {
            writeln!(
                f,
                "  {}: {} blocks, {:#} used, {:#} free, last contact {}ms ago",
                server.address,
                server.block_count,
                Byte::from_u64(server.disk_space_used),
                Byte::from_u64(server.disk_space_free),
                server.last_contact_ms
            )?;
        }
        Ok(())
    }
}

struct NameServerState {
    file_system_id: Uuid,
    namespace: Namespace,
    blocks: BlockTable,
    data_servers: HashMap<ServerAddress, DataServerInfo>,
    safe_mode: bool,
    /// Safe mode was switched on by request and only ends by request.
    manual_safe_mode: bool,
}

impl NameServerState {
    fn check_safe_mode(&self) -> Result<()> {
        if self.safe_mode {
            return Err(DfsError::SafeMode);
        }
        Ok(())
    }

    fn allocate_block(
        &mut self,
        file_id: FileId,
        path: &str,
        local_host: Option<&str>,
        config: &NameServerConfig,
    ) -> Result<BlockAssignment> {
        let replication = self
            .namespace
            .file(file_id)
            .map(|record| record.replication_factor as usize)
            .ok_or_else(|| DfsError::NotFound(path.to_string()))?;

        let data_servers = choose_data_servers(
            &self.data_servers,
            replication,
            &HashSet::new(),
            local_host,
            config.min_free_space,
        );
        if data_servers.is_empty() {
            return Err(DfsError::NotEnoughDataServers(format!(
                "no data server can store a new block for {path}"
            )));
        }
        if data_servers.len() < replication {
            warn!(path, replication, available = data_servers.len(), "allocating an under-replicated block");
        }

        let block_id = Uuid::new_v4();
        for address in &data_servers {
            if let Some(server) = self.data_servers.get_mut(address) {
                server.pending_blocks.insert(block_id);
            }
        }
        self.blocks.pending.insert(
            block_id,
            PendingBlock {
                file: file_id,
                data_servers: data_servers.clone(),
                allocated: Instant::now(),
            },
        );
        if let Some(record) = self.namespace.file_mut(file_id) {
            record.pending_block = Some(block_id);
        }
        debug!(path, %block_id, ?data_servers, "allocated block");
        Ok(BlockAssignment { block_id, data_servers })
    }

    /// Drop the blocks of deleted files and tell their holders to delete them.
    fn release_blocks(&mut self, records: Vec<FileRecord>) {
        for record in records {
            for block in &record.blocks {
                for address in self.blocks.remove(&block.id) {
                    if let Some(server) = self.data_servers.get_mut(&address) {
                        server.queue_delete(block.id);
                    }
                }
            }
            if let Some(block_id) = record.pending_block {
                if let Some(pending) = self.blocks.pending.remove(&block_id) {
                    for address in pending.data_servers {
                        if let Some(server) = self.data_servers.get_mut(&address) {
                            server.queue_delete(block_id);
                        }
                    }
                }
            }
        }
    }

    /// Forget a data server and every replica it held.
    fn remove_data_server(&mut self, address: &ServerAddress) -> bool {
        let Some(server) = self.data_servers.remove(address) else {
            return false;
        };
        for block_id in &server.blocks {
            if let Some(info) = self.blocks.committed.get_mut(block_id) {
                info.data_servers.remove(address);
            }
            self.blocks.refresh(*block_id, &self.namespace);
        }
        true
    }

    /// Give up on pending blocks whose data servers are all gone or that have been pending too
    /// long. Their files stop waiting for them and any partial copies are deleted.
    fn abandon_stale_blocks(&mut self, now: Instant, config: &NameServerConfig) {
        let timeout = config.pending_block_timeout();
        let stale: Vec<BlockId> = self
            .blocks
            .pending
            .iter()
            .filter(|(_, pending)| {
                now.saturating_duration_since(pending.allocated) > timeout
                    || pending.data_servers.iter().all(|a| !self.data_servers.contains_key(a))
            })
            .map(|(block_id, _)| *block_id)
            .collect();

        for block_id in stale {
            let Some(pending) = self.blocks.pending.remove(&block_id) else {
                continue;
            };
            for address in &pending.data_servers {
                if let Some(server) = self.data_servers.get_mut(address) {
                    server.queue_delete(block_id);
                }
            }
            let path = self.namespace.path_of(pending.file);
            if let Some(record) = self.namespace.file_mut(pending.file) {
                if record.pending_block == Some(block_id) {
                    record.pending_block = None;
                    if record.close_requested {
                        record.close_requested = false;
                        record.open_for_writing = false;
                    }
                }
            }
            warn!(%block_id, ?path, "abandoned pending block");
        }
    }

    fn commit_block(&mut self, address: &ServerAddress, block_id: BlockId, size: u64) {
        if let Some(pending) = self.blocks.pending.remove(&block_id) {
            for holder in &pending.data_servers {
                if let Some(server) = self.data_servers.get_mut(holder) {
                    server.pending_blocks.remove(&block_id);
                }
            }
            if let Some(record) = self.namespace.file_mut(pending.file) {
                record.blocks.push(FileBlock { id: block_id, size });
                record.size += size;
                record.pending_block = None;
                if record.close_requested {
                    record.close_requested = false;
                    record.open_for_writing = false;
                    debug!(%block_id, "deferred close completed");
                }
            }
            self.blocks.committed.insert(
                block_id,
                BlockInfo {
                    file: pending.file,
                    size,
                    data_servers: BTreeSet::from([address.clone()]),
                },
            );
            if let Some(server) = self.data_servers.get_mut(address) {
                server.blocks.insert(block_id);
                server.recent_blocks.insert(block_id);
            }
            self.blocks.refresh(block_id, &self.namespace);
            info!(%block_id, size, data_server = %address, "block committed");
            return;
        }

        let expected_size = match self.blocks.committed.get_mut(&block_id) {
            Some(info) if info.size == size => {
                info.data_servers.insert(address.clone());
                None
            }
            Some(info) => Some(info.size),
            None => {
                if self.safe_mode {
                    debug!(%block_id, data_server = %address, "ignoring unknown block in safe mode");
                } else if let Some(server) = self.data_servers.get_mut(address) {
                    info!(%block_id, data_server = %address, "deleting unknown block");
                    server.queue_delete(block_id);
                }
                return;
            }
        };

        let Some(server) = self.data_servers.get_mut(address) else {
            return;
        };
        match expected_size {
            None => {
                server.pending_blocks.remove(&block_id);
                server.blocks.insert(block_id);
                server.recent_blocks.insert(block_id);
                debug!(%block_id, data_server = %address, "new replica");
                self.blocks.refresh(block_id, &self.namespace);
            }
            Some(expected) => {
                warn!(%block_id, data_server = %address, expected, actual = size, "replica has the wrong size, deleting it");
                server.queue_delete(block_id);
            }
        }
    }

    fn process_block_report(&mut self, address: &ServerAddress, reported: Vec<BlockId>, now: Instant) {
        let reported: HashSet<BlockId> = reported.into_iter().collect();
        let safe_mode = self.safe_mode;
        let Some(server) = self.data_servers.get_mut(address) else {
            return;
        };

        // A block committed after the report was requested may have been stored after the
        // report was taken; it is checked again by the next report.
        let missing: Vec<BlockId> = server
            .blocks
            .iter()
            .filter(|id| !reported.contains(*id) && !server.recent_blocks.contains(*id))
            .copied()
            .collect();
        for block_id in &missing {
            server.blocks.remove(block_id);
        }
        server.recent_blocks.clear();

        let mut orphans = 0;
        for block_id in &reported {
            if let Some(info) = self.blocks.committed.get_mut(block_id) {
                info.data_servers.insert(address.clone());
                server.blocks.insert(*block_id);
            } else if self.blocks.pending.contains_key(block_id) {
                // Still being written; it is committed by its new-block notification.
            } else if !safe_mode {
                server.queue_delete(*block_id);
                orphans += 1;
            }
        }
        server.has_reported_blocks = true;
        server.block_report_requested = false;
        server.last_block_report = Some(now);

        for block_id in &missing {
            if let Some(info) = self.blocks.committed.get_mut(block_id) {
                info.data_servers.remove(address);
            }
        }
        for block_id in missing.iter().chain(reported.iter()) {
            self.blocks.refresh(*block_id, &self.namespace);
        }
        info!(
            data_server = %address,
            blocks = reported.len(),
            missing = missing.len(),
            orphans,
            "processed block report"
        );
    }

    fn maybe_leave_safe_mode(&mut self, config: &NameServerConfig) -> bool {
        if !self.safe_mode || self.manual_safe_mode {
            return false;
        }
        let reported = self
            .data_servers
            .values()
            .filter(|server| server.has_reported_blocks)
            .count();
        if reported < config.safe_mode_min_data_servers {
            return false;
        }
        let visible = self.blocks.visible_fraction();
        if visible < config.safe_mode_threshold {
            return false;
        }
        self.safe_mode = false;
        info!(data_servers = reported, visible, "leaving safe mode");
        true
    }

    /// One reconciliation pass: evict silent data servers and abandon stale pending blocks, then move every committed block's
    /// replica count toward its file's replication factor.
    fn check_replication(&mut self, now: Instant, config: &NameServerConfig) {
        let timeout = config.data_server_timeout();
        let dead: Vec<ServerAddress> = self
            .data_servers
            .values()
            .filter(|server| now.saturating_duration_since(server.last_contact) > timeout)
            .map(|server| server.address.clone())
            .collect();
        for address in dead {
            warn!(data_server = %address, "data server timed out");
            self.remove_data_server(&address);
        }
        self.abandon_stale_blocks(now, config);

        if self.safe_mode {
            return;
        }

        let block_ids: Vec<BlockId> = self.blocks.committed.keys().copied().collect();
        for block_id in block_ids {
            let desired = self.blocks.desired_replicas(&block_id, &self.namespace);
            let Some(info) = self.blocks.committed.get(&block_id) else {
                continue;
            };
            let holders = info.data_servers.clone();
            let file = info.file;

            if holders.is_empty() {
                self.blocks.under_replicated.insert(block_id);
                error!(%block_id, path = ?self.namespace.path_of(file), "block has no live replicas");
            } else if holders.len() < desired {
                self.blocks.under_replicated.insert(block_id);
                if let Some(issued) = self.blocks.replications.get(&block_id) {
                    if now.saturating_duration_since(*issued) < config.replication_retry() {
                        continue;
                    }
                }
                let exclude: HashSet<ServerAddress> = holders.iter().cloned().collect();
                let targets = choose_data_servers(
                    &self.data_servers,
                    desired - holders.len(),
                    &exclude,
                    None,
                    config.min_free_space,
                );
                if targets.is_empty() {
                    warn!(%block_id, replicas = holders.len(), desired, "no data server available for re-replication");
                    continue;
                }
                let Some(source) = holders.iter().next().and_then(|a| self.data_servers.get_mut(a)) else {
                    continue;
                };
                info!(%block_id, source = %source.address, ?targets, "scheduling re-replication");
                source.replications.push(BlockAssignment {
                    block_id,
                    data_servers: targets,
                });
                self.blocks.replications.insert(block_id, now);
            } else if holders.len() > desired {
                // Drop the replicas on the fullest servers.
                let mut excess: Vec<(u64, ServerAddress)> = holders
                    .iter()
                    .map(|a| (self.data_servers.get(a).map_or(0, |s| s.disk_space_free), a.clone()))
                    .collect();
                excess.sort();
                for (_, address) in excess.into_iter().take(holders.len() - desired) {
                    if let Some(server) = self.data_servers.get_mut(&address) {
                        server.queue_delete(block_id);
                    }
                    if let Some(info) = self.blocks.committed.get_mut(&block_id) {
                        info.data_servers.remove(&address);
                    }
                    info!(%block_id, data_server = %address, "removing excess replica");
                }
                self.blocks.refresh(block_id, &self.namespace);
            } else {
                self.blocks.refresh(block_id, &self.namespace);
            }
        }
    }

    fn metrics(&self, now: Instant) -> ClusterMetrics {
        let mut data_servers: Vec<DataServerMetrics> =
            self.data_servers.values().map(|server| server.metrics(now)).collect();
        data_servers.sort_by(|a, b| a.address.cmp(&b.address));
        ClusterMetrics {
            total_block_count: self.blocks.committed.len(),
            total_size: self.blocks.total_size(),
            pending_block_count: self.blocks.pending.len(),
            under_replicated_block_count: self.blocks.under_replicated.len(),
            data_server_count: data_servers.len(),
            data_servers,
            safe_mode: self.safe_mode,
        }
    }
}

pub struct NameServer {
    config: NameServerConfig,
    state: RwLock<NameServerState>,
}

impl NameServer {
    /// Start a name server, loading the last checkpoint from the image directory if there is
    /// one. The name server always starts in safe mode.
    pub fn new(config: NameServerConfig) -> Result<NameServer> {
        config.validate()?;

        let image = match &config.image_directory {
            Some(directory) => checkpoint::load_image(directory)?,
            None => None,
        };
        let (file_system_id, namespace) = match image {
            Some(image) => {
                let mut namespace = image.namespace;
                for record in namespace.files_mut() {
                    // Writes in progress when the checkpoint was taken are lost.
                    record.open_for_writing = false;
                    record.close_requested = false;
                    record.pending_block = None;
                }
                (image.file_system_id, namespace)
            }
            None => (Uuid::new_v4(), Namespace::new()),
        };
        let blocks = BlockTable::from_namespace(&namespace);
        info!(%file_system_id, blocks = blocks.committed.len(), "name server starting in safe mode");

        Ok(NameServer {
            config,
            state: RwLock::new(NameServerState {
                file_system_id,
                namespace,
                blocks,
                data_servers: HashMap::new(),
                safe_mode: true,
                manual_safe_mode: false,
            }),
        })
    }

    pub fn config(&self) -> &NameServerConfig {
        &self.config
    }

    pub fn file_system_id(&self) -> Uuid {
        self.state.read().file_system_id
    }

    /// Run periodic reconciliation passes until `shutdown` fires.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(self.config.replication_check_interval());
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => self.check_replication(),
            }
        }
        info!("name server stopped");
    }

    pub fn check_replication(&self) {
        self.state.write().check_replication(Instant::now(), &self.config);
    }

    #[instrument(skip(self))]
    pub fn create_directory(&self, path: &str) -> Result<()> {
        let mut state = self.state.write();
        state.check_safe_mode()?;
        state.namespace.create_directory(path)?;
        info!("created directory");
        Ok(())
    }

    pub fn get_directory_info(&self, path: &str) -> Result<Option<DfsDirectory>> {
        self.state.read().namespace.directory_info(path)
    }

    #[instrument(skip(self))]
    pub fn create_file(
        &self,
        path: &str,
        block_size: Option<u64>,
        replication_factor: Option<u32>,
        local_host: Option<&str>,
        record_options: RecordStreamOptions,
    ) -> Result<BlockAssignment> {
        let block_size = block_size.unwrap_or(self.config.block_size);
        validate_block_size(block_size)?;
        let replication_factor = replication_factor.unwrap_or(self.config.replication_factor);
        if replication_factor == 0 {
            return Err(DfsError::InvalidOperation("replication factor must be at least 1".into()));
        }

        let mut guard = self.state.write();
        let state = &mut *guard;
        state.check_safe_mode()?;
        let file_id = state
            .namespace
            .create_file(path, FileRecord::new(block_size, replication_factor, record_options))?;
        match state.allocate_block(file_id, path, local_host, &self.config) {
            Ok(assignment) => {
                info!(block_id = %assignment.block_id, "created file");
                Ok(assignment)
            }
            Err(e) => {
                // Without a first block the file would stay open forever.
                state.namespace.delete(path, false)?;
                Err(e)
            }
        }
    }

    #[instrument(skip(self))]
    pub fn append_block(&self, path: &str, local_host: Option<&str>) -> Result<BlockAssignment> {
        let mut guard = self.state.write();
        let state = &mut *guard;
        state.check_safe_mode()?;
        let file_id = state.namespace.file_id(path)?;
        let record = state
            .namespace
            .file(file_id)
            .ok_or_else(|| DfsError::NotFound(path.to_string()))?;
        if !record.accepts_new_block() {
            return Err(DfsError::InvalidOperation(format!("{path} is not open for writing")));
        }
        if let Some(pending) = record.pending_block {
            return Err(DfsError::InvalidOperation(format!(
                "{path} already has a pending block {pending}"
            )));
        }
        state.allocate_block(file_id, path, local_host, &self.config)
    }

    #[instrument(skip(self))]
    pub fn close_file(&self, path: &str) -> Result<()> {
        let mut state = self.state.write();
        state.check_safe_mode()?;
        let file_id = state.namespace.file_id(path)?;
        let record = state
            .namespace
            .file_mut(file_id)
            .ok_or_else(|| DfsError::NotFound(path.to_string()))?;
        if !record.open_for_writing {
            return Err(DfsError::InvalidOperation(format!("{path} is not open for writing")));
        }
        if record.pending_block.is_some() {
            record.close_requested = true;
            info!("close deferred until the last block is committed");
        } else {
            record.open_for_writing = false;
            info!("closed file");
        }
        Ok(())
    }

    #[instrument(skip(self))]
    pub fn delete(&self, path: &str, recursive: bool) -> Result<bool> {
        let mut state = self.state.write();
        state.check_safe_mode()?;
        match state.namespace.delete(path, recursive)? {
            Some(records) => {
                info!(files = records.len(), "deleted");
                state.release_blocks(records);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    #[instrument(skip(self))]
    pub fn move_entry(&self, from: &str, to: &str) -> Result<()> {
        let mut state = self.state.write();
        state.check_safe_mode()?;
        state.namespace.move_entry(from, to)?;
        info!("moved");
        Ok(())
    }

    pub fn get_file_info(&self, path: &str) -> Result<Option<DfsFile>> {
        self.state.read().namespace.file_info(path)
    }

    pub fn get_file_system_entry_info(&self, path: &str) -> Result<Option<FileSystemEntry>> {
        self.state.read().namespace.entry_info(path)
    }

    pub fn get_data_servers_for_block(&self, block_id: BlockId) -> Result<Vec<ServerAddress>> {
        let state = self.state.read();
        if let Some(info) = state.blocks.committed.get(&block_id) {
            return Ok(info.data_servers.iter().cloned().collect());
        }
        if let Some(pending) = state.blocks.pending.get(&block_id) {
            return Ok(pending.data_servers.clone());
        }
        Err(DfsError::UnknownBlock(block_id))
    }

    pub fn get_blocks(&self, kind: BlockKind) -> Vec<BlockId> {
        self.state.read().blocks.list(kind)
    }

    pub fn get_metrics(&self) -> ClusterMetrics {
        self.state.read().metrics(Instant::now())
    }

    pub fn remove_data_server(&self, address: &ServerAddress) -> Result<()> {
        if !self.state.write().remove_data_server(address) {
            return Err(DfsError::NotFound(format!("data server {address}")));
        }
        info!(data_server = %address, "removed data server");
        Ok(())
    }

    pub fn create_checkpoint(&self) -> Result<()> {
        let directory = self
            .config
            .image_directory
            .as_ref()
            .ok_or_else(|| DfsError::Configuration("no image directory configured".into()))?;
        let image = {
            let state = self.state.read();
            FileSystemImage::new(state.file_system_id, state.namespace.clone())
        };
        checkpoint::save_image(directory, &image)
    }

    pub fn safe_mode(&self) -> bool {
        self.state.read().safe_mode
    }

    /// Switch safe mode on or off. Switching it off runs a reconciliation pass right away.
    pub fn set_safe_mode(&self, enabled: bool) {
        let mut state = self.state.write();
        if enabled {
            state.safe_mode = true;
            state.manual_safe_mode = true;
            info!("entered safe mode by request");
        } else {
            state.safe_mode = false;
            state.manual_safe_mode = false;
            info!("left safe mode by request");
            state.check_replication(Instant::now(), &self.config);
        }
    }

    pub fn block_size(&self) -> u64 {
        self.config.block_size
    }

    /// Apply the payloads of one heartbeat and return the commands for the data server.
    pub fn heartbeat(&self, address: &ServerAddress, data: Vec<HeartbeatData>) -> Result<Vec<DataServerCommand>> {
        let now = Instant::now();
        let mut guard = self.state.write();
        let state = &mut *guard;

        let server = state.data_servers.entry(address.clone()).or_insert_with(|| {
            info!(data_server = %address, "new data server");
            DataServerInfo::new(address.clone(), now)
        });
        server.last_contact = now;

        for payload in data {
            match payload {
                HeartbeatData::Initial { file_system_id } => {
                    if let Some(id) = file_system_id {
                        if id != state.file_system_id {
                            state.data_servers.remove(address);
                            warn!(data_server = %address, %id, "data server belongs to another file system");
                            return Err(DfsError::InvalidOperation(format!(
                                "data server {address} belongs to file system {id}, not {}",
                                state.file_system_id
                            )));
                        }
                    }
                    if let Some(server) = state.data_servers.get_mut(address) {
                        server.initialized = true;
                        server.block_report_requested = false;
                        server.last_block_report = None;
                    }
                }
                HeartbeatData::Status {
                    disk_space_used,
                    disk_space_free,
                    disk_space_total,
                } => {
                    if let Some(server) = state.data_servers.get_mut(address) {
                        server.disk_space_used = disk_space_used;
                        server.disk_space_free = disk_space_free;
                        server.disk_space_total = disk_space_total;
                    }
                }
                HeartbeatData::BlockReport { blocks } => {
                    let initialized = state.data_servers.get(address).is_some_and(|s| s.initialized);
                    if initialized {
                        state.process_block_report(address, blocks, now);
                    } else {
                        debug!(data_server = %address, "ignoring block report from uninitialized data server");
                    }
                }
                HeartbeatData::NewBlock { block_id, size } => state.commit_block(address, block_id, size),
            }
        }

        if state.maybe_leave_safe_mode(&self.config) {
            state.check_replication(now, &self.config);
        }

        let Some(server) = state.data_servers.get_mut(address) else {
            return Ok(Vec::new());
        };
        if !server.initialized {
            return Ok(vec![DataServerCommand::SendInitialData]);
        }
        let mut commands = Vec::new();
        let report_due = server
            .last_block_report
            .map_or(true, |last| now.saturating_duration_since(last) >= self.config.block_report_interval());
        if report_due && !server.block_report_requested {
            server.block_report_requested = true;
            server.recent_blocks.clear();
            commands.push(DataServerCommand::ReportBlocks);
        }
        commands.extend(server.take_commands());
        Ok(commands)
    }
}

#[async_trait]
impl NameServerClientProtocol for NameServer {
    async fn create_directory(&self, path: &str) -> Result<()> {
        NameServer::create_directory(self, path)
    }

    async fn get_directory_info(&self, path: &str) -> Result<Option<DfsDirectory>> {
        NameServer::get_directory_info(self, path)
    }

    async fn create_file(
        &self,
        path: &str,
        block_size: Option<u64>,
        replication_factor: Option<u32>,
        local_host: Option<String>,
        record_options: RecordStreamOptions,
    ) -> Result<BlockAssignment> {
        NameServer::create_file(self, path, block_size, replication_factor, local_host.as_deref(), record_options)
    }

    async fn append_block(&self, path: &str, local_host: Option<String>) -> Result<BlockAssignment> {
        NameServer::append_block(self, path, local_host.as_deref())
    }

    async fn close_file(&self, path: &str) -> Result<()> {
        NameServer::close_file(self, path)
    }

    async fn delete(&self, path: &str, recursive: bool) -> Result<bool> {
        NameServer::delete(self, path, recursive)
    }

    async fn move_entry(&self, from: &str, to: &str) -> Result<()> {
        NameServer::move_entry(self, from, to)
    }

    async fn get_file_info(&self, path: &str) -> Result<Option<DfsFile>> {
        NameServer::get_file_info(self, path)
    }

    async fn get_file_system_entry_info(&self, path: &str) -> Result<Option<FileSystemEntry>> {
        NameServer::get_file_system_entry_info(self, path)
    }

    async fn get_data_servers_for_block(&self, block_id: BlockId) -> Result<Vec<ServerAddress>> {
        NameServer::get_data_servers_for_block(self, block_id)
    }

    async fn get_blocks(&self, kind: BlockKind) -> Result<Vec<BlockId>> {
        Ok(NameServer::get_blocks(self, kind))
    }

    async fn get_metrics(&self) -> Result<ClusterMetrics> {
        Ok(NameServer::get_metrics(self))
    }

    async fn remove_data_server(&self, address: &ServerAddress) -> Result<()> {
        NameServer::remove_data_server(self, address)
    }

    async fn create_checkpoint(&self) -> Result<()> {
        NameServer::create_checkpoint(self)
    }

    async fn safe_mode(&self) -> Result<bool> {
        Ok(NameServer::safe_mode(self))
    }

    async fn set_safe_mode(&self, enabled: bool) -> Result<()> {
        NameServer::set_safe_mode(self, enabled);
        Ok(())
    }

    async fn block_size(&self) -> Result<u64> {
        Ok(NameServer::block_size(self))
    }
}

#[async_trait]
impl NameServerHeartbeatProtocol for NameServer {
    async fn heartbeat(&self, address: &ServerAddress, data: Vec<HeartbeatData>) -> Result<Vec<DataServerCommand>> {
        NameServer::heartbeat(self, address, data)
    }
}
