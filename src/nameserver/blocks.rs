//! Block bookkeeping: committed blocks and their replicas, pending blocks, and the
//! under-replicated set.

use std::collections::{BTreeSet, HashMap, HashSet};

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::common::{BlockId, ServerAddress};
use crate::nameserver::namespace::{FileId, Namespace};

/// Which blocks `get_blocks` lists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BlockKind {
    /// Every committed block.
    Normal,
    UnderReplicated,
    /// Allocated but not yet committed.
    Pending,
}

pub(crate) struct BlockInfo {
    pub file: FileId,
    pub size: u64,
    pub data_servers: BTreeSet<ServerAddress>,
}

pub(crate) struct PendingBlock {
    pub file: FileId,
    pub data_servers: Vec<ServerAddress>,
    pub allocated: Instant,
}

#[derive(Default)]
pub(crate) struct BlockTable {
    pub committed: HashMap<BlockId, BlockInfo>,
    pub pending: HashMap<BlockId, PendingBlock>,
    pub under_replicated: HashSet<BlockId>,
    /// Replication commands in flight, by the time they were issued.
    pub replications: HashMap<BlockId, Instant>,
}

impl BlockTable {
    /// Rebuild the table from a loaded namespace. Replica locations come from block reports.
    pub fn from_namespace(namespace: &Namespace) -> Self {
        let mut table = BlockTable::default();
        for (file_id, record) in namespace.files() {
            for block in &record.blocks {
                table.committed.insert(
                    block.id,
                    BlockInfo {
                        file: file_id,
                        size: block.size,
                        data_servers: BTreeSet::new(),
                    },
                );
            }
        }
        table
    }

    pub fn desired_replicas(&self, block_id: &BlockId, namespace: &Namespace) -> usize {
        self.committed
            .get(block_id)
            .and_then(|info| namespace.file(info.file))
            .map(|record| record.replication_factor as usize)
            .unwrap_or(1)
    }

    /// Re-evaluate whether a block is under-replicated after its replica set changed.
    pub fn refresh(&mut self, block_id: BlockId, namespace: &Namespace) {
        let desired = self.desired_replicas(&block_id, namespace);
        match self.committed.get(&block_id) {
            Some(info) if info.data_servers.len() < desired => {
                self.under_replicated.insert(block_id);
            }
            _ => {
                self.under_replicated.remove(&block_id);
                self.replications.remove(&block_id);
            }
        }
    }

    /// Forget a committed block entirely and return where its replicas were.
    pub fn remove(&mut self, block_id: &BlockId) -> Vec<ServerAddress> {
        self.under_replicated.remove(block_id);
        self.replications.remove(block_id);
        self.committed
            .remove(block_id)
            .map(|info| info.data_servers.into_iter().collect())
            .unwrap_or_default()
    }

    pub fn list(&self, kind: BlockKind) -> Vec<BlockId> {
        let mut blocks: Vec<BlockId> = match kind {
            BlockKind::Normal => self.committed.keys().copied().collect(),
            BlockKind::UnderReplicated => self.under_replicated.iter().copied().collect(),
            BlockKind::Pending => self.pending.keys().copied().collect(),
        };
        blocks.sort();
        blocks
    }

    pub fn total_size(&self) -> u64 {
        self.committed.values().map(|info| info.size).sum()
    }

    /// Fraction of committed blocks with at least one live replica.
    pub fn visible_fraction(&self) -> f64 {
        if self.committed.is_empty() {
            return 1.0;
        }
        let visible = self
            .committed
            .values()
            .filter(|info| !info.data_servers.is_empty())
            .count();
        visible as f64 / self.committed.len() as f64
    }
}
