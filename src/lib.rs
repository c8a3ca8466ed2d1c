//! A distributed block file system.
//!
//! A single [`NameServer`] owns the namespace and knows which [`DataServer`]s hold which blocks.
//! Files are split into fixed-size blocks; each block is written once through a pipeline of
//! replicas and never modified afterwards. Clients ([`DfsClient`]) ask the name server where
//! blocks live and move the data directly to and from the data servers.

pub mod client;
pub mod common;
pub mod config;
pub mod dataserver;
pub mod error;
pub mod heartbeat;
pub mod input_stream;
pub mod nameserver;
pub mod output_stream;
pub mod packet;
pub mod pipeline;
pub mod protocol;
pub mod protocols;
pub mod rpc;

pub use client::DfsClient;
pub use common::{BlockAssignment, BlockId, RecordStreamOptions, ServerAddress};
pub use config::{ClientConfig, DataServerConfig, DfsConfiguration, NameServerConfig};
pub use dataserver::DataServer;
pub use error::{DfsError, Result};
pub use input_stream::BlockInputStream;
pub use nameserver::{ClusterMetrics, NameServer};
pub use output_stream::BlockOutputStream;
pub use rpc::{RemoteNameServer, RpcServer};
