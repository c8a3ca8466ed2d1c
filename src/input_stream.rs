//! Reading files.
//!
//! Reads go straight to the data servers. Each block is read from the first replica the name
//! server lists; a replica that cannot be reached, refuses the read or sends a corrupt packet is
//! skipped and the read resumes from the next one at the same offset.

use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, BufReader};
use tokio::net::tcp::OwnedReadHalf;
use tracing::{debug, warn};

use crate::common::{BlockId, ServerAddress, PACKET_SIZE};
use crate::error::{DfsError, Result};
use crate::nameserver::DfsFile;
use crate::packet::{Packet, PacketFormat};
use crate::protocol::{self, DataServerHeader, DataServerStatus};
use crate::protocols::NameServerClientProtocol;

/// Replica lists of recently read blocks.
pub(crate) struct LocationCache {
    entries: Mutex<LruCache<BlockId, Vec<ServerAddress>>>,
}

impl LocationCache {
    pub fn new(capacity: usize) -> LocationCache {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        LocationCache {
            entries: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Replicas of `block_id`, asking the name server unless a cached list is good enough.
    pub async fn replicas(
        &self,
        name_server: &dyn NameServerClientProtocol,
        block_id: BlockId,
        refresh: bool,
    ) -> Result<Vec<ServerAddress>> {
        if !refresh {
            if let Some(replicas) = self.entries.lock().get(&block_id) {
                return Ok(replicas.clone());
            }
        }
        let replicas = name_server.get_data_servers_for_block(block_id).await?;
        self.entries.lock().put(block_id, replicas.clone());
        Ok(replicas)
    }

    pub fn invalidate(&self, block_id: &BlockId) {
        self.entries.lock().pop(block_id);
    }
}

/// An open block read on one data server.
struct BlockConnection {
    reader: BufReader<OwnedReadHalf>,
    data_server: ServerAddress,
    block_index: usize,
    /// Bytes at the start of the next packet that precede the requested offset.
    skip: u64,
    finished: bool,
}

impl BlockConnection {
    async fn open(data_server: &ServerAddress, block_id: BlockId, offset: u64, size: Option<u64>) -> Result<BlockConnection> {
        let stream = protocol::connect(data_server).await?;
        let (read_half, mut write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);
        protocol::write_frame(&mut write_half, &DataServerHeader::ReadBlock { block_id, offset, size }).await?;
        match protocol::read_status(&mut reader).await? {
            DataServerStatus::Ok => {}
            status => {
                return Err(DfsError::Protocol(format!(
                    "{data_server} refused to read block {block_id} at offset {offset}: {status:?}"
                )))
            }
        }
        let aligned_offset = reader.read_u64_le().await?;
        if aligned_offset > offset {
            return Err(DfsError::Protocol(format!(
                "{data_server} started block {block_id} at {aligned_offset}, after the requested offset {offset}"
            )));
        }
        Ok(BlockConnection {
            reader,
            data_server: data_server.clone(),
            block_index: 0,
            skip: offset - aligned_offset,
            finished: false,
        })
    }

    async fn next_packet(&mut self, packet: &mut Packet, verify_checksums: bool) -> Result<()> {
        packet
            .read(&mut self.reader, PacketFormat::NoSequenceNumber, verify_checksums)
            .await?;
        self.finished = packet.is_last_packet();
        Ok(())
    }
}

/// Read `size` bytes of a block starting at `offset`, trying each replica in turn.
pub(crate) async fn read_block_range(
    name_server: &dyn NameServerClientProtocol,
    locations: &LocationCache,
    block_id: BlockId,
    offset: u64,
    size: u64,
    verify_checksums: bool,
) -> Result<Vec<u8>> {
    let mut last_error = None;
    for refresh in [false, true] {
        let replicas = locations.replicas(name_server, block_id, refresh).await?;
        for data_server in &replicas {
            match read_from_replica(data_server, block_id, offset, size, verify_checksums).await {
                Ok(data) => return Ok(data),
                Err(e) => {
                    warn!(%block_id, %data_server, error = %e, "block read failed, trying the next replica");
                    last_error = Some(e);
                }
            }
        }
        locations.invalidate(&block_id);
    }
    Err(no_replica(block_id, last_error))
}

async fn read_from_replica(
    data_server: &ServerAddress,
    block_id: BlockId,
    offset: u64,
    size: u64,
    verify_checksums: bool,
) -> Result<Vec<u8>> {
    let mut connection = BlockConnection::open(data_server, block_id, offset, Some(size)).await?;
    let mut packet = Packet::new();
    // The data server stops at the end of the block, so `size` may be far larger than what
    // comes back.
    let mut data = Vec::with_capacity(size.min(PACKET_SIZE as u64 * 16) as usize);
    while !connection.finished && (data.len() as u64) < size {
        connection.next_packet(&mut packet, verify_checksums).await?;
        let skip = connection.skip.min(packet.size() as u64) as usize;
        connection.skip -= skip as u64;
        let available = &packet.data()[skip..];
        let count = (size - data.len() as u64).min(available.len() as u64) as usize;
        data.extend_from_slice(&available[..count]);
    }
    Ok(data)
}

fn no_replica(block_id: BlockId, last_error: Option<DfsError>) -> DfsError {
    match last_error {
        Some(e) => DfsError::Connection(format!("no replica of block {block_id} could be read: {e}")),
        None => DfsError::Connection(format!("block {block_id} has no replicas")),
    }
}

/// Sequential reader over the committed blocks of a file.
pub struct BlockInputStream {
    name_server: Arc<dyn NameServerClientProtocol>,
    locations: Arc<LocationCache>,
    file: DfsFile,
    /// File offset at which each block starts.
    block_starts: Vec<u64>,
    verify_checksums: bool,
    position: u64,
    connection: Option<BlockConnection>,
    packet: Packet,
    /// Unread part of `packet`.
    packet_pos: usize,
}

impl BlockInputStream {
    pub(crate) fn new(
        name_server: Arc<dyn NameServerClientProtocol>,
        locations: Arc<LocationCache>,
        file: DfsFile,
        verify_checksums: bool,
    ) -> BlockInputStream {
        let mut block_starts = Vec::with_capacity(file.blocks.len());
        let mut start = 0;
        for block in &file.blocks {
            block_starts.push(start);
            start += block.size;
        }
        BlockInputStream {
            name_server,
            locations,
            file,
            block_starts,
            verify_checksums,
            position: 0,
            connection: None,
            packet: Packet::new(),
            packet_pos: 0,
        }
    }

    pub fn file(&self) -> &DfsFile {
        &self.file
    }

    pub fn len(&self) -> u64 {
        self.file.size
    }

    pub fn is_empty(&self) -> bool {
        self.file.size == 0
    }

    pub fn position(&self) -> u64 {
        self.position
    }

    /// Move to `position`. Positions past the end are clamped to the end.
    pub fn seek(&mut self, position: u64) {
        self.position = position.min(self.file.size);
        self.connection = None;
        self.packet.clear();
        self.packet_pos = 0;
    }

    /// Read up to `buf.len()` bytes. Returns 0 at the end of the file.
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        loop {
            if buf.is_empty() || self.position >= self.file.size {
                return Ok(0);
            }
            let available = &self.packet.data()[self.packet_pos..];
            if !available.is_empty() {
                let count = available.len().min(buf.len());
                buf[..count].copy_from_slice(&available[..count]);
                self.packet_pos += count;
                self.position += count as u64;
                return Ok(count);
            }
            self.fill().await?;
        }
    }

    /// Read from the current position to the end of the file.
    pub async fn read_to_end(&mut self) -> Result<Vec<u8>> {
        let mut data = Vec::with_capacity((self.file.size - self.position) as usize);
        let mut buf = vec![0; PACKET_SIZE];
        loop {
            let count = self.read(&mut buf).await?;
            if count == 0 {
                return Ok(data);
            }
            data.extend_from_slice(&buf[..count]);
        }
    }

    /// Block holding file offset `position` and the offset within it. Empty blocks are skipped.
    fn locate(&self, position: u64) -> Option<(usize, u64)> {
        self.file
            .blocks
            .iter()
            .zip(&self.block_starts)
            .enumerate()
            .find(|(_, (block, start))| position >= **start && position < **start + block.size)
            .map(|(index, (_, start))| (index, position - start))
    }

    /// Load the packet holding the current position.
    async fn fill(&mut self) -> Result<()> {
        let Some((block_index, block_offset)) = self.locate(self.position) else {
            return Err(DfsError::InvalidOperation(format!(
                "offset {} is outside {}",
                self.position, self.file.path
            )));
        };
        let block_id = self.file.blocks[block_index].id;

        let mut failed: Vec<ServerAddress> = Vec::new();
        let mut last_error = None;
        loop {
            let reusable = self
                .connection
                .as_ref()
                .is_some_and(|c| c.block_index == block_index && !c.finished);
            if !reusable {
                self.connection = None;
                match self.connect(block_id, block_index, block_offset, &failed).await? {
                    Some(connection) => self.connection = Some(connection),
                    None => return Err(no_replica(block_id, last_error)),
                }
            }
            let Some(connection) = self.connection.as_mut() else {
                continue;
            };

            match connection.next_packet(&mut self.packet, self.verify_checksums).await {
                Ok(()) => {
                    let skip = connection.skip.min(self.packet.size() as u64);
                    connection.skip -= skip;
                    self.packet_pos = skip as usize;
                    if self.packet_pos < self.packet.size() {
                        return Ok(());
                    }
                    if connection.finished {
                        let e = DfsError::Protocol(format!(
                            "{} ended block {block_id} before offset {block_offset}",
                            connection.data_server
                        ));
                        warn!(%block_id, error = %e, "short block read, trying the next replica");
                        failed.push(connection.data_server.clone());
                        last_error = Some(e);
                        self.connection = None;
                    }
                }
                Err(e) => {
                    warn!(%block_id, data_server = %connection.data_server, error = %e, "block read failed, trying the next replica");
                    failed.push(connection.data_server.clone());
                    last_error = Some(e);
                    self.connection = None;
                    self.packet.clear();
                    self.packet_pos = 0;
                }
            }
        }
    }

    /// Open the block on the first replica not in `failed`, or `None` if every replica failed.
    async fn connect(
        &self,
        block_id: BlockId,
        block_index: usize,
        offset: u64,
        failed: &[ServerAddress],
    ) -> Result<Option<BlockConnection>> {
        for refresh in [false, true] {
            let replicas = self
                .locations
                .replicas(self.name_server.as_ref(), block_id, refresh)
                .await?;
            for data_server in replicas.iter().filter(|r| !failed.contains(r)) {
                match BlockConnection::open(data_server, block_id, offset, None).await {
                    Ok(mut connection) => {
                        debug!(%block_id, %data_server, offset, "reading block");
                        connection.block_index = block_index;
                        return Ok(Some(connection));
                    }
                    Err(e) => warn!(%block_id, %data_server, error = %e, "could not open block on replica"),
                }
            }
            self.locations.invalidate(&block_id);
        }
        Ok(None)
    }
}
