use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{DfsError, Result};

/// Identifier of a block. Unique across the whole file system.
pub type BlockId = Uuid;

/// Maximum payload of a single packet (64 KiB).
pub const PACKET_SIZE: usize = 64 * 1024;

/// Block size used when a file does not ask for one (64 MiB).
pub const DEFAULT_BLOCK_SIZE: u64 = 64 * 1024 * 1024;

/// Network address of a name server or data server.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ServerAddress {
    pub host: String,
    pub port: u16,
}

impl ServerAddress {
    pub fn new(host: impl Into<String>, port: u16) -> ServerAddress {
        ServerAddress { host: host.into(), port }
    }
}

impl fmt::Display for ServerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for ServerAddress {
    type Err = DfsError;

    fn from_str(s: &str) -> Result<ServerAddress> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| DfsError::Configuration(format!("invalid server address: {s}")))?;
        let port = port
            .parse::<u16>()
            .map_err(|_| DfsError::Configuration(format!("invalid port in server address: {s}")))?;
        if host.is_empty() {
            return Err(DfsError::Configuration(format!("missing host in server address: {s}")));
        }
        Ok(ServerAddress::new(host, port))
    }
}

impl From<std::net::SocketAddr> for ServerAddress {
    fn from(addr: std::net::SocketAddr) -> Self {
        ServerAddress::new(addr.ip().to_string(), addr.port())
    }
}

/// A newly allocated block and the chain of data servers that will hold it.
///
/// The client connects to the first server, which forwards to the rest in order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockAssignment {
    pub block_id: BlockId,
    pub data_servers: Vec<ServerAddress>,
}

/// Options controlling how a record-oriented writer lays records out over blocks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordStreamOptions {
    /// Pad blocks so that no record marked with a record boundary straddles two blocks.
    pub record_aligned: bool,
}

impl RecordStreamOptions {
    pub fn aligned() -> Self {
        RecordStreamOptions { record_aligned: true }
    }
}
