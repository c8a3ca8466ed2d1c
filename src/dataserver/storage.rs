//! On-disk block files.
//!
//! A block is stored as a sequence of checksum-only packets in `blocks/blk_<id>`. Blocks being
//! received live in `tmp/` and are renamed into `blocks/` once complete, so everything under
//! `blocks/` is a finished block.

use std::collections::HashMap;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use tokio::fs::File;
use tokio::io::{AsyncSeekExt, AsyncWriteExt, BufReader, BufWriter};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::common::{BlockId, PACKET_SIZE};
use crate::error::{DfsError, Result};
use crate::packet::{Packet, PacketFormat, CHECKSUM_SIZE};

const BLOCK_FILE_PREFIX: &str = "blk_";

/// Bytes one full packet takes on disk.
const STORED_PACKET_SIZE: u64 = (PACKET_SIZE + CHECKSUM_SIZE) as u64;

#[derive(Debug, Clone, Copy)]
struct StoredBlock {
    size: u64,
    file_length: u64,
}

/// Block size encoded by a block file of `file_length` bytes, or `None` if no sequence of
/// checksum-only packets has that length.
fn block_size_from_file_length(file_length: u64) -> Option<u64> {
    let full_packets = file_length / STORED_PACKET_SIZE;
    let rest = file_length % STORED_PACKET_SIZE;
    match rest {
        0 if full_packets == 0 => None,
        0 => Some(full_packets * PACKET_SIZE as u64),
        rest if rest < CHECKSUM_SIZE as u64 => None,
        rest => Some(full_packets * PACKET_SIZE as u64 + rest - CHECKSUM_SIZE as u64),
    }
}

fn block_file_name(block_id: &BlockId) -> String {
    format!("{BLOCK_FILE_PREFIX}{block_id}")
}

pub struct BlockStorage {
    blocks_dir: PathBuf,
    tmp_dir: PathBuf,
    capacity: u64,
    blocks: Mutex<HashMap<BlockId, StoredBlock>>,
}

impl BlockStorage {
    /// Open the storage directory, creating it if needed, and scan it for stored blocks.
    /// Leftovers of interrupted writes are removed.
    pub fn open(storage_dir: &Path, capacity: u64) -> Result<BlockStorage> {
        let blocks_dir = storage_dir.join("blocks");
        let tmp_dir = storage_dir.join("tmp");
        std::fs::create_dir_all(&blocks_dir)?;
        if tmp_dir.exists() {
            std::fs::remove_dir_all(&tmp_dir)?;
        }
        std::fs::create_dir_all(&tmp_dir)?;

        let mut blocks = HashMap::new();
        for entry in std::fs::read_dir(&blocks_dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(id) = name.to_str().and_then(|n| n.strip_prefix(BLOCK_FILE_PREFIX)) else {
                continue;
            };
            let Ok(block_id) = Uuid::parse_str(id) else {
                warn!(file = ?name, "ignoring file with an invalid block id");
                continue;
            };
            let file_length = entry.metadata()?.len();
            match block_size_from_file_length(file_length) {
                Some(size) => {
                    blocks.insert(block_id, StoredBlock { size, file_length });
                }
                None => {
                    warn!(%block_id, file_length, "removing truncated block file");
                    std::fs::remove_file(entry.path())?;
                }
            }
        }
        info!(directory = %storage_dir.display(), blocks = blocks.len(), "opened block storage");

        Ok(BlockStorage {
            blocks_dir,
            tmp_dir,
            capacity,
            blocks: Mutex::new(blocks),
        })
    }

    pub fn contains(&self, block_id: &BlockId) -> bool {
        self.blocks.lock().contains_key(block_id)
    }

    pub fn block_size(&self, block_id: &BlockId) -> Option<u64> {
        self.blocks.lock().get(block_id).map(|block| block.size)
    }

    pub fn block_ids(&self) -> Vec<BlockId> {
        let mut ids: Vec<BlockId> = self.blocks.lock().keys().copied().collect();
        ids.sort();
        ids
    }

    /// `(used, free, total)` bytes, where total is the configured capacity.
    pub fn disk_status(&self) -> (u64, u64, u64) {
        let used: u64 = self.blocks.lock().values().map(|block| block.file_length).sum();
        (used, self.capacity.saturating_sub(used), self.capacity)
    }

    /// Start receiving a new block.
    pub async fn create(&self, block_id: BlockId) -> Result<BlockFileWriter> {
        if self.contains(&block_id) {
            return Err(DfsError::AlreadyExists(format!("block {block_id}")));
        }
        let tmp_path = self.tmp_dir.join(block_file_name(&block_id));
        let file = tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&tmp_path)
            .await?;
        Ok(BlockFileWriter {
            block_id,
            tmp_path,
            final_path: self.blocks_dir.join(block_file_name(&block_id)),
            writer: BufWriter::new(file),
            size: 0,
            file_length: 0,
        })
    }

    /// Make a completely written block visible. Returns the block size.
    pub async fn commit(&self, mut file: BlockFileWriter) -> Result<u64> {
        file.writer.flush().await?;
        file.writer.get_ref().sync_all().await?;
        tokio::fs::rename(&file.tmp_path, &file.final_path).await?;
        self.blocks.lock().insert(
            file.block_id,
            StoredBlock {
                size: file.size,
                file_length: file.file_length,
            },
        );
        debug!(block_id = %file.block_id, size = file.size, "stored block");
        Ok(file.size)
    }

    /// Throw away a partially written block.
    pub async fn abort(&self, file: BlockFileWriter) {
        let BlockFileWriter { block_id, tmp_path, writer, .. } = file;
        drop(writer);
        if let Err(e) = tokio::fs::remove_file(&tmp_path).await {
            warn!(%block_id, error = %e, "could not remove partial block file");
        }
    }

    /// Open a block for reading at the packet containing `offset`. Returns the reader and the
    /// block offset of that packet.
    pub async fn reader(&self, block_id: BlockId, offset: u64) -> Result<(BlockFileReader, u64)> {
        let block = self
            .blocks
            .lock()
            .get(&block_id)
            .copied()
            .ok_or(DfsError::UnknownBlock(block_id))?;
        if offset > block.size {
            return Err(DfsError::InvalidOperation(format!(
                "offset {offset} is past the end of block {block_id} ({} bytes)",
                block.size
            )));
        }

        let packet_index = offset / PACKET_SIZE as u64;
        let position = (packet_index * STORED_PACKET_SIZE).min(block.file_length);
        let mut file = File::open(self.blocks_dir.join(block_file_name(&block_id))).await?;
        file.seek(SeekFrom::Start(position)).await?;
        let reader = BlockFileReader {
            reader: BufReader::new(file),
            remaining: block.file_length - position,
        };
        Ok((reader, packet_index * PACKET_SIZE as u64))
    }

    /// Remove a stored block. Returns false if it was not stored here.
    pub async fn delete(&self, block_id: &BlockId) -> Result<bool> {
        if self.blocks.lock().remove(block_id).is_none() {
            return Ok(false);
        }
        tokio::fs::remove_file(self.blocks_dir.join(block_file_name(block_id))).await?;
        Ok(true)
    }
}

pub struct BlockFileWriter {
    block_id: BlockId,
    tmp_path: PathBuf,
    final_path: PathBuf,
    writer: BufWriter<File>,
    size: u64,
    file_length: u64,
}

impl BlockFileWriter {
    pub async fn write_packet(&mut self, packet: &Packet) -> Result<()> {
        packet.write(&mut self.writer, PacketFormat::ChecksumOnly).await?;
        self.size += packet.size() as u64;
        self.file_length += (CHECKSUM_SIZE + packet.size()) as u64;
        Ok(())
    }
}

pub struct BlockFileReader {
    reader: BufReader<File>,
    remaining: u64,
}

impl BlockFileReader {
    /// Read the next packet. At the very end of a block that ends on a packet boundary this
    /// yields an empty last packet.
    pub async fn next_packet(&mut self, packet: &mut Packet, verify_checksum: bool) -> Result<()> {
        if self.remaining == 0 {
            packet.copy_from(&[], true, 0)?;
            return Ok(());
        }
        packet
            .read_checksum_only(&mut self.reader, self.remaining, verify_checksum)
            .await?;
        self.remaining -= (CHECKSUM_SIZE + packet.size()) as u64;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store(storage: &BlockStorage, block_id: BlockId, len: usize) -> u64 {
        let data: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
        let mut file = storage.create(block_id).await.unwrap();
        let chunks: Vec<&[u8]> = if data.is_empty() {
            vec![&data[..]]
        } else {
            data.chunks(PACKET_SIZE).collect()
        };
        for (i, chunk) in chunks.iter().enumerate() {
            let packet = Packet::from_data(chunk, i + 1 == chunks.len(), i as i64).unwrap();
            file.write_packet(&packet).await.unwrap();
        }
        storage.commit(file).await.unwrap()
    }

    async fn read_all(storage: &BlockStorage, block_id: BlockId, offset: u64) -> (u64, Vec<u8>) {
        let (mut reader, aligned) = storage.reader(block_id, offset).await.unwrap();
        let mut packet = Packet::new();
        let mut data = Vec::new();
        loop {
            reader.next_packet(&mut packet, true).await.unwrap();
            data.extend_from_slice(packet.data());
            if packet.is_last_packet() {
                return (aligned, data);
            }
        }
    }

    #[test]
    fn block_size_follows_file_length() {
        let full = STORED_PACKET_SIZE;
        assert_eq!(block_size_from_file_length(0), None);
        assert_eq!(block_size_from_file_length(4), Some(0));
        assert_eq!(block_size_from_file_length(104), Some(100));
        assert_eq!(block_size_from_file_length(full), Some(PACKET_SIZE as u64));
        assert_eq!(block_size_from_file_length(full + 4), Some(PACKET_SIZE as u64));
        assert_eq!(block_size_from_file_length(full + 2), None);
    }

    #[tokio::test]
    async fn stores_and_rescans_blocks() {
        let dir = tempfile::tempdir().unwrap();
        let storage = BlockStorage::open(dir.path(), 1 << 30).unwrap();
        let big = Uuid::new_v4();
        let empty = Uuid::new_v4();
        let len = PACKET_SIZE * 2 + 10;
        assert_eq!(store(&storage, big, len).await, len as u64);
        assert_eq!(store(&storage, empty, 0).await, 0);
        assert!(matches!(storage.create(big).await, Err(DfsError::AlreadyExists(_))));

        // An interrupted write leaves nothing visible behind.
        let partial = storage.create(Uuid::new_v4()).await.unwrap();
        drop(partial);

        let storage = BlockStorage::open(dir.path(), 1 << 30).unwrap();
        let mut expected = vec![big, empty];
        expected.sort();
        assert_eq!(storage.block_ids(), expected);
        assert_eq!(storage.block_size(&big), Some(len as u64));
        assert_eq!(storage.block_size(&empty), Some(0));
        let (used, free, total) = storage.disk_status();
        assert_eq!(used, (len + 3 * CHECKSUM_SIZE + CHECKSUM_SIZE) as u64);
        assert_eq!(free + used, total);

        let (aligned, data) = read_all(&storage, big, 0).await;
        assert_eq!(aligned, 0);
        assert_eq!(data.len(), len);
        assert_eq!(data[PACKET_SIZE + 7], ((PACKET_SIZE + 7) % 251) as u8);

        assert!(storage.delete(&big).await.unwrap());
        assert!(!storage.delete(&big).await.unwrap());
        assert!(storage.reader(big, 0).await.is_err());
    }

    #[tokio::test]
    async fn reads_from_the_packet_holding_the_offset() {
        let dir = tempfile::tempdir().unwrap();
        let storage = BlockStorage::open(dir.path(), 1 << 30).unwrap();
        let block_id = Uuid::new_v4();
        store(&storage, block_id, PACKET_SIZE * 2).await;

        let (aligned, data) = read_all(&storage, block_id, PACKET_SIZE as u64 + 5).await;
        assert_eq!(aligned, PACKET_SIZE as u64);
        assert_eq!(data.len(), PACKET_SIZE);

        let (aligned, data) = read_all(&storage, block_id, PACKET_SIZE as u64 * 2).await;
        assert_eq!(aligned, PACKET_SIZE as u64 * 2);
        assert!(data.is_empty());

        assert!(storage.reader(block_id, PACKET_SIZE as u64 * 2 + 1).await.is_err());
    }
}
