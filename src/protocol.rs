//! Wire framing shared by every TCP surface, and the data server block protocol.
//!
//! Structured messages travel as a little-endian `u32` length followed by that many bytes of
//! JSON. Block data never goes through this framing; it follows the header as raw packets.

use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::common::{BlockId, ServerAddress};
use crate::error::{DfsError, Result};

/// Upper bound on a framed message. Block reports of large servers are the biggest frames.
pub const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

pub const CONNECTION_TIMEOUT: Duration = Duration::from_secs(10);

/// First message on every data server connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataServerHeader {
    /// Store a block, forwarding it to `data_servers` in order.
    WriteBlock {
        block_id: BlockId,
        data_servers: Vec<ServerAddress>,
    },
    /// Send `size` bytes of a block starting at `offset`; `None` reads to the end.
    ReadBlock {
        block_id: BlockId,
        offset: u64,
        size: Option<u64>,
    },
}

/// Status byte sent by a data server after a header, and after the final packet of a write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DataServerStatus {
    Ok = 0,
    Error = 1,
    OutOfRange = 2,
}

impl DataServerStatus {
    fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Ok),
            1 => Some(Self::Error),
            2 => Some(Self::OutOfRange),
            _ => None,
        }
    }
}

pub async fn write_status<W: AsyncWrite + Unpin>(writer: &mut W, status: DataServerStatus) -> Result<()> {
    writer.write_u8(status as u8).await?;
    writer.flush().await?;
    Ok(())
}

pub async fn read_status<R: AsyncRead + Unpin>(reader: &mut R) -> Result<DataServerStatus> {
    let value = reader.read_u8().await?;
    DataServerStatus::from_u8(value).ok_or_else(|| DfsError::Protocol(format!("unknown status code {value}")))
}

/// Serialize `message` as one frame and flush it.
pub async fn write_frame<W, T>(writer: &mut W, message: &T) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let body = serde_json::to_vec(message)?;
    if body.len() > MAX_FRAME_SIZE {
        return Err(DfsError::Protocol(format!(
            "frame of {} bytes exceeds the maximum of {MAX_FRAME_SIZE}",
            body.len()
        )));
    }
    writer.write_u32_le(body.len() as u32).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame. Returns `None` when the peer closed the connection before a new frame.
pub async fn read_frame<R, T>(reader: &mut R) -> Result<Option<T>>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let len = match reader.read_u32_le().await {
        Ok(len) => len as usize,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    if len > MAX_FRAME_SIZE {
        return Err(DfsError::Protocol(format!(
            "frame of {len} bytes exceeds the maximum of {MAX_FRAME_SIZE}"
        )));
    }
    let mut body = vec![0; len];
    reader.read_exact(&mut body).await?;
    Ok(Some(serde_json::from_slice(&body)?))
}

/// Open a TCP connection, giving up after [`CONNECTION_TIMEOUT`].
pub async fn connect(address: &ServerAddress) -> Result<TcpStream> {
    let target = (address.host.as_str(), address.port);
    match tokio::time::timeout(CONNECTION_TIMEOUT, TcpStream::connect(target)).await {
        Ok(Ok(stream)) => {
            stream.set_nodelay(true)?;
            Ok(stream)
        }
        Ok(Err(e)) => Err(DfsError::Connection(format!("could not connect to {address}: {e}"))),
        Err(_) => Err(DfsError::Connection(format!("timed out connecting to {address}"))),
    }
}
