//! What the name server knows about each data server.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::common::{BlockAssignment, BlockId, ServerAddress};
use crate::heartbeat::DataServerCommand;

pub(crate) struct DataServerInfo {
    pub address: ServerAddress,
    pub last_contact: Instant,
    /// Sent its `Initial` heartbeat payload.
    pub initialized: bool,
    pub has_reported_blocks: bool,
    pub block_report_requested: bool,
    pub last_block_report: Option<Instant>,
    pub disk_space_used: u64,
    pub disk_space_free: u64,
    pub disk_space_total: u64,
    /// Committed blocks this server holds, according to its reports.
    pub blocks: HashSet<BlockId>,
    /// Blocks assigned to this server that it has not reported yet.
    pub pending_blocks: HashSet<BlockId>,
    /// Blocks committed on this server since its last block report was requested.
    pub recent_blocks: HashSet<BlockId>,
    pub blocks_to_delete: Vec<BlockId>,
    pub replications: Vec<BlockAssignment>,
}

impl DataServerInfo {
    pub fn new(address: ServerAddress, now: Instant) -> Self {
        DataServerInfo {
            address,
            last_contact: now,
            initialized: false,
            has_reported_blocks: false,
            block_report_requested: false,
            last_block_report: None,
            disk_space_used: 0,
            disk_space_free: 0,
            disk_space_total: 0,
            blocks: HashSet::new(),
            pending_blocks: HashSet::new(),
            recent_blocks: HashSet::new(),
            blocks_to_delete: Vec::new(),
            replications: Vec::new(),
        }
    }

    pub fn is_eligible(&self, min_free_space: u64) -> bool {
        self.initialized && self.has_reported_blocks && self.disk_space_free >= min_free_space
    }

    pub fn queue_delete(&mut self, block_id: BlockId) {
        self.blocks.remove(&block_id);
        self.pending_blocks.remove(&block_id);
        if !self.blocks_to_delete.contains(&block_id) {
            self.blocks_to_delete.push(block_id);
        }
    }

    /// Commands waiting for this server's next heartbeat.
    pub fn take_commands(&mut self) -> Vec<DataServerCommand> {
        let mut commands = Vec::new();
        if !self.blocks_to_delete.is_empty() {
            commands.push(DataServerCommand::DeleteBlocks {
                blocks: std::mem::take(&mut self.blocks_to_delete),
            });
        }
        commands.extend(
            self.replications
                .drain(..)
                .map(|assignment| DataServerCommand::ReplicateBlock { assignment }),
        );
        commands
    }

    pub fn metrics(&self, now: Instant) -> DataServerMetrics {
        DataServerMetrics {
            address: self.address.clone(),
            last_contact_ms: now.saturating_duration_since(self.last_contact).as_millis() as u64,
            disk_space_used: self.disk_space_used,
            disk_space_free: self.disk_space_free,
            disk_space_total: self.disk_space_total,
            block_count: self.blocks.len(),
            pending_block_count: self.pending_blocks.len(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataServerMetrics {
    pub address: ServerAddress,
    /// Milliseconds since the last heartbeat.
    pub last_contact_ms: u64,
    pub disk_space_used: u64,
    pub disk_space_free: u64,
    pub disk_space_total: u64,
    pub block_count: usize,
    pub pending_block_count: usize,
}

/// Pick up to `count` data servers for a new replica.
///
/// Servers with fewer pending blocks come first, then those with more free space. A server on
/// `local_host` is moved to the front so the writer talks to it directly.
pub(crate) fn choose_data_servers(
    data_servers: &HashMap<ServerAddress, DataServerInfo>,
    count: usize,
    exclude: &HashSet<ServerAddress>,
    local_host: Option<&str>,
    min_free_space: u64,
) -> Vec<ServerAddress> {
    let mut candidates: Vec<&DataServerInfo> = data_servers
        .values()
        .filter(|server| server.is_eligible(min_free_space) && !exclude.contains(&server.address))
        .collect();
    candidates.sort_by(|a, b| {
        a.pending_blocks
            .len()
            .cmp(&b.pending_blocks.len())
            .then(b.disk_space_free.cmp(&a.disk_space_free))
            .then(a.address.cmp(&b.address))
    });

    if let Some(host) = local_host {
        if let Some(pos) = candidates.iter().position(|server| server.address.host == host) {
            let local = candidates.remove(pos);
            candidates.insert(0, local);
        }
    }

    candidates
        .into_iter()
        .take(count)
        .map(|server| server.address.clone())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server(host: &str, port: u16, free: u64, pending: usize) -> DataServerInfo {
        let mut info = DataServerInfo::new(ServerAddress::new(host, port), Instant::now());
        info.initialized = true;
        info.has_reported_blocks = true;
        info.disk_space_free = free;
        for _ in 0..pending {
            info.pending_blocks.insert(uuid::Uuid::new_v4());
        }
        info
    }

    fn table(servers: Vec<DataServerInfo>) -> HashMap<ServerAddress, DataServerInfo> {
        servers.into_iter().map(|s| (s.address.clone(), s)).collect()
    }

    #[tokio::test]
    async fn prefers_idle_servers_then_free_space() {
        let servers = table(vec![
            server("a", 1, 100, 2),
            server("b", 1, 50, 0),
            server("c", 1, 500, 0),
            server("d", 1, 1000, 5),
        ]);
        let chosen = choose_data_servers(&servers, 3, &HashSet::new(), None, 0);
        let hosts: Vec<&str> = chosen.iter().map(|a| a.host.as_str()).collect();
        assert_eq!(hosts, vec!["c", "b", "a"]);
    }

    #[tokio::test]
    async fn local_server_goes_first() {
        let servers = table(vec![server("a", 1, 100, 0), server("b", 1, 100, 3)]);
        let chosen = choose_data_servers(&servers, 2, &HashSet::new(), Some("b"), 0);
        assert_eq!(chosen[0].host, "b");
        assert_eq!(chosen.len(), 2);
    }

    #[tokio::test]
    async fn skips_ineligible_and_excluded_servers() {
        let mut unreported = server("x", 1, 100, 0);
        unreported.has_reported_blocks = false;
        let servers = table(vec![server("a", 1, 10, 0), server("b", 1, 100, 0), unreported]);

        let exclude: HashSet<ServerAddress> = [ServerAddress::new("b", 1)].into_iter().collect();
        let chosen = choose_data_servers(&servers, 3, &exclude, None, 0);
        assert_eq!(chosen, vec![ServerAddress::new("a", 1)]);

        let chosen = choose_data_servers(&servers, 3, &HashSet::new(), None, 50);
        assert_eq!(chosen, vec![ServerAddress::new("b", 1)]);
    }
}
