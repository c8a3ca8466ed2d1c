//! Messages exchanged between data servers and the name server.
//!
//! Every heartbeat carries one or more [`HeartbeatData`] payloads; the reply is a list of
//! [`DataServerCommand`]s for the data server to carry out.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::common::{BlockAssignment, BlockId};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum HeartbeatData {
    /// Identifies the data server, sent when the name server asks for it.
    Initial { file_system_id: Option<Uuid> },
    /// Disk usage.
    Status {
        disk_space_used: u64,
        disk_space_free: u64,
        disk_space_total: u64,
    },
    /// Every block stored on the data server.
    BlockReport { blocks: Vec<BlockId> },
    /// A block was completely written. This is how pending blocks become committed.
    NewBlock { block_id: BlockId, size: u64 },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataServerCommand {
    None,
    /// Send a full block report with the next heartbeat.
    ReportBlocks,
    /// Remove these blocks from disk.
    DeleteBlocks { blocks: Vec<BlockId> },
    /// Push a copy of a locally stored block through the given chain.
    ReplicateBlock { assignment: BlockAssignment },
    /// Send the `Initial` payload with the next heartbeat.
    SendInitialData,
}
