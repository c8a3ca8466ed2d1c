//! Error types for the file system.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::common::BlockId;

/// Result type alias using `DfsError`
pub type Result<T> = std::result::Result<T, DfsError>;

/// Errors raised by the name server, the data servers and the client streams.
#[derive(Error, Debug)]
pub enum DfsError {
    /// A packet failed checksum verification or declared an impossible length.
    #[error("invalid packet: {0}")]
    InvalidPacket(String),

    /// The peer sent something that does not follow the wire protocol.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A replica pipeline hit a fault; the pipeline stays failed.
    #[error("replica pipeline failed: {0}")]
    PipelineFailed(String),

    /// A transfer was cancelled by its owner.
    #[error("transfer cancelled")]
    Cancelled,

    /// Could not reach a server.
    #[error("connection error: {0}")]
    Connection(String),

    /// Path does not exist
    #[error("path not found: {0}")]
    NotFound(String),

    /// Path already exists
    #[error("path already exists: {0}")]
    AlreadyExists(String),

    /// A path component that must be a directory is a file.
    #[error("not a directory: {0}")]
    NotADirectory(String),

    /// Path is not absolute or has an empty component.
    #[error("invalid path: {0}")]
    InvalidPath(String),

    /// The name server refuses namespace mutations until replica state is trusted.
    #[error("the name server is in safe mode")]
    SafeMode,

    /// The operation is not valid in the current state.
    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    /// No data server can take a new block.
    #[error("not enough data servers: {0}")]
    NotEnoughDataServers(String),

    /// The block is not known to the name server.
    #[error("unknown block: {0}")]
    UnknownBlock(BlockId),

    /// Configuration error
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The namespace image could not be written or loaded.
    #[error("checkpoint error: {0}")]
    Checkpoint(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<serde_json::Error> for DfsError {
    fn from(err: serde_json::Error) -> Self {
        DfsError::Serialization(err.to_string())
    }
}

/// Classification of an error that crossed the RPC boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    InvalidPacket,
    Protocol,
    PipelineFailed,
    Cancelled,
    Connection,
    NotFound,
    AlreadyExists,
    NotADirectory,
    InvalidPath,
    SafeMode,
    InvalidOperation,
    NotEnoughDataServers,
    UnknownBlock,
    Configuration,
    Checkpoint,
    Serialization,
    Io,
}

/// Serializable form of a `DfsError`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteError {
    pub kind: ErrorKind,
    pub detail: String,
}

impl DfsError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            DfsError::InvalidPacket(_) => ErrorKind::InvalidPacket,
            DfsError::Protocol(_) => ErrorKind::Protocol,
            DfsError::PipelineFailed(_) => ErrorKind::PipelineFailed,
            DfsError::Cancelled => ErrorKind::Cancelled,
            DfsError::Connection(_) => ErrorKind::Connection,
            DfsError::NotFound(_) => ErrorKind::NotFound,
            DfsError::AlreadyExists(_) => ErrorKind::AlreadyExists,
            DfsError::NotADirectory(_) => ErrorKind::NotADirectory,
            DfsError::InvalidPath(_) => ErrorKind::InvalidPath,
            DfsError::SafeMode => ErrorKind::SafeMode,
            DfsError::InvalidOperation(_) => ErrorKind::InvalidOperation,
            DfsError::NotEnoughDataServers(_) => ErrorKind::NotEnoughDataServers,
            DfsError::UnknownBlock(_) => ErrorKind::UnknownBlock,
            DfsError::Configuration(_) => ErrorKind::Configuration,
            DfsError::Checkpoint(_) => ErrorKind::Checkpoint,
            DfsError::Serialization(_) => ErrorKind::Serialization,
            DfsError::Io(_) => ErrorKind::Io,
        }
    }

    /// Namespace errors are answers from the name server, not faults of the transport.
    pub fn is_namespace_error(&self) -> bool {
        matches!(
            self,
            DfsError::NotFound(_)
                | DfsError::AlreadyExists(_)
                | DfsError::NotADirectory(_)
                | DfsError::InvalidPath(_)
                | DfsError::SafeMode
                | DfsError::InvalidOperation(_)
        )
    }

    pub fn to_remote(&self) -> RemoteError {
        let detail = match self {
            DfsError::InvalidPacket(s)
            | DfsError::Protocol(s)
            | DfsError::PipelineFailed(s)
            | DfsError::Connection(s)
            | DfsError::NotFound(s)
            | DfsError::AlreadyExists(s)
            | DfsError::NotADirectory(s)
            | DfsError::InvalidPath(s)
            | DfsError::InvalidOperation(s)
            | DfsError::NotEnoughDataServers(s)
            | DfsError::Configuration(s)
            | DfsError::Checkpoint(s)
            | DfsError::Serialization(s) => s.clone(),
            DfsError::UnknownBlock(id) => id.to_string(),
            DfsError::Cancelled | DfsError::SafeMode => String::new(),
            DfsError::Io(e) => e.to_string(),
        };
        RemoteError { kind: self.kind(), detail }
    }
}

impl From<RemoteError> for DfsError {
    fn from(err: RemoteError) -> Self {
        let RemoteError { kind, detail } = err;
        match kind {
            ErrorKind::InvalidPacket => DfsError::InvalidPacket(detail),
            ErrorKind::Protocol => DfsError::Protocol(detail),
            ErrorKind::PipelineFailed => DfsError::PipelineFailed(detail),
            ErrorKind::Cancelled => DfsError::Cancelled,
            ErrorKind::Connection => DfsError::Connection(detail),
            ErrorKind::NotFound => DfsError::NotFound(detail),
            ErrorKind::AlreadyExists => DfsError::AlreadyExists(detail),
            ErrorKind::NotADirectory => DfsError::NotADirectory(detail),
            ErrorKind::InvalidPath => DfsError::InvalidPath(detail),
            ErrorKind::SafeMode => DfsError::SafeMode,
            ErrorKind::InvalidOperation => DfsError::InvalidOperation(detail),
            ErrorKind::NotEnoughDataServers => DfsError::NotEnoughDataServers(detail),
            ErrorKind::UnknownBlock => match detail.parse() {
                Ok(id) => DfsError::UnknownBlock(id),
                Err(_) => DfsError::Protocol(format!("malformed block id in error: {detail}")),
            },
            ErrorKind::Configuration => DfsError::Configuration(detail),
            ErrorKind::Checkpoint => DfsError::Checkpoint(detail),
            ErrorKind::Serialization => DfsError::Serialization(detail),
            ErrorKind::Io => DfsError::Io(std::io::Error::other(detail)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remote_errors_keep_their_kind() {
        let err: DfsError = DfsError::SafeMode.to_remote().into();
        assert!(matches!(err, DfsError::SafeMode));

        let err: DfsError = DfsError::NotFound("/a/b".into()).to_remote().into();
        match err {
            DfsError::NotFound(path) => assert_eq!(path, "/a/b"),
            other => panic!("unexpected error {other:?}"),
        }

        let id = uuid::Uuid::new_v4();
        let err: DfsError = DfsError::UnknownBlock(id).to_remote().into();
        assert!(matches!(err, DfsError::UnknownBlock(got) if got == id));
    }
}
