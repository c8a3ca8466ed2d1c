//! Writing files.
//!
//! A [`BlockOutputStream`] stages bytes into packets and pushes them through a replica pipeline
//! for the current block. When a block is full the stream waits for every acknowledgement, drops
//! the pipeline and allocates the next block from the name server on the next write.
//!
//! In record-aligned mode bytes are held back until [`BlockOutputStream::mark_record`]. A record
//! that does not fit in what is left of the current block ends the block early; the unused
//! remainder counts as padding, so no record ever straddles two blocks.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::common::{BlockAssignment, RecordStreamOptions, PACKET_SIZE};
use crate::error::{DfsError, Result};
use crate::packet::Packet;
use crate::pipeline::BlockSender;
use crate::protocols::NameServerClientProtocol;

/// Padding needed before a record of `record_len` bytes so that it does not cross a block
/// boundary, given `used` bytes already in the current block.
fn padding_for_record(block_size: u64, used: u64, record_len: u64) -> Result<u64> {
    if record_len > block_size {
        return Err(DfsError::InvalidOperation(format!(
            "record of {record_len} bytes does not fit in a block of {block_size} bytes"
        )));
    }
    let remaining = block_size - used;
    if used == 0 || record_len <= remaining {
        Ok(0)
    } else {
        Ok(remaining)
    }
}

pub struct BlockOutputStream {
    name_server: Arc<dyn NameServerClientProtocol>,
    path: String,
    block_size: u64,
    record_options: RecordStreamOptions,
    local_host: Option<String>,
    /// Assignment handed out with the file, used for the first block.
    first_assignment: Option<BlockAssignment>,
    sender: Option<BlockSender>,
    packet: Packet,
    /// Bytes of the next packet.
    buffer: Vec<u8>,
    /// Bytes of the current record in record-aligned mode.
    record: Vec<u8>,
    /// Bytes of the current block already handed to the pipeline.
    block_bytes: u64,
    sequence_number: i64,
    blocks_written: usize,
    bytes_written: u64,
    padding: u64,
    error: Option<String>,
    closed: bool,
}

impl BlockOutputStream {
    pub(crate) fn new(
        name_server: Arc<dyn NameServerClientProtocol>,
        path: String,
        assignment: BlockAssignment,
        block_size: u64,
        record_options: RecordStreamOptions,
        local_host: Option<String>,
    ) -> BlockOutputStream {
        BlockOutputStream {
            name_server,
            path,
            block_size,
            record_options,
            local_host,
            first_assignment: Some(assignment),
            sender: None,
            packet: Packet::new(),
            buffer: Vec::with_capacity(PACKET_SIZE),
            record: Vec::new(),
            block_bytes: 0,
            sequence_number: 0,
            blocks_written: 0,
            bytes_written: 0,
            padding: 0,
            error: None,
            closed: false,
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Logical length of the stream: every byte written so far plus padding.
    pub fn length(&self) -> u64 {
        self.bytes_written + self.padding
    }

    /// Bytes of padding inserted to keep records inside a single block.
    pub fn padding(&self) -> u64 {
        self.padding
    }

    pub async fn write(&mut self, data: &[u8]) -> Result<()> {
        self.check_usable()?;
        if self.record_options.record_aligned {
            self.record.extend_from_slice(data);
            return Ok(());
        }
        let result = self.write_to_block(data).await;
        self.track(result)
    }

    /// End the current record. Outside record-aligned mode this does nothing.
    pub async fn mark_record(&mut self) -> Result<()> {
        self.check_usable()?;
        if !self.record_options.record_aligned || self.record.is_empty() {
            return Ok(());
        }
        let record = std::mem::take(&mut self.record);
        let result = self.write_record(&record).await;
        self.record = record;
        self.record.clear();
        self.track(result)
    }

    /// Flush everything, wait for the last block to be stored and close the file on the name
    /// server. The file is closed on the name server even if flushing fails.
    pub async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        let flushed = match &self.error {
            Some(message) => Err(DfsError::PipelineFailed(message.clone())),
            None => self.flush_final().await,
        };
        if let Err(e) = &flushed {
            warn!(path = %self.path, error = %e, "closing file after a failed write");
            if let Some(sender) = &self.sender {
                sender.cancel();
            }
        }
        let closed = self.name_server.close_file(&self.path).await;
        flushed?;
        closed?;
        debug!(path = %self.path, length = self.length(), blocks = self.blocks_written, "closed output stream");
        Ok(())
    }

    fn check_usable(&self) -> Result<()> {
        if self.closed {
            return Err(DfsError::InvalidOperation(format!("{} is already closed", self.path)));
        }
        if let Some(message) = &self.error {
            return Err(DfsError::PipelineFailed(message.clone()));
        }
        Ok(())
    }

    fn track(&mut self, result: Result<()>) -> Result<()> {
        if let Err(e) = &result {
            // Invalid records leave the stream usable; anything else poisons it.
            if !matches!(e, DfsError::InvalidOperation(_)) {
                self.error.get_or_insert_with(|| e.to_string());
            }
        }
        result
    }

    async fn write_record(&mut self, record: &[u8]) -> Result<()> {
        let used = self.block_bytes + self.buffer.len() as u64;
        let padding = padding_for_record(self.block_size, used, record.len() as u64)?;
        if padding > 0 {
            debug!(path = %self.path, padding, "ending block early to keep a record whole");
            self.flush_packet(true).await?;
            self.finish_block().await?;
            self.padding += padding;
        }
        self.write_to_block(record).await
    }

    async fn write_to_block(&mut self, mut data: &[u8]) -> Result<()> {
        while !data.is_empty() {
            let block_remaining = self.block_size - self.block_bytes - self.buffer.len() as u64;
            let packet_space = PACKET_SIZE - self.buffer.len();
            let count = data.len().min(packet_space).min(block_remaining as usize);
            self.buffer.extend_from_slice(&data[..count]);
            self.bytes_written += count as u64;
            data = &data[count..];

            if self.block_bytes + self.buffer.len() as u64 == self.block_size {
                self.flush_packet(true).await?;
                self.finish_block().await?;
            } else if self.buffer.len() == PACKET_SIZE {
                self.flush_packet(false).await?;
            }
        }
        Ok(())
    }

    async fn flush_final(&mut self) -> Result<()> {
        if !self.record.is_empty() {
            let record = std::mem::take(&mut self.record);
            self.write_record(&record).await?;
        }
        // A file always ends up with at least one block, even an empty one.
        if self.sender.is_some() || !self.buffer.is_empty() || self.blocks_written == 0 {
            self.flush_packet(true).await?;
            self.finish_block().await?;
        }
        Ok(())
    }

    /// Hand the staged bytes to the pipeline, opening one for a new block if needed.
    async fn flush_packet(&mut self, is_last: bool) -> Result<()> {
        if self.sender.is_none() {
            let assignment = match self.first_assignment.take() {
                Some(assignment) => assignment,
                None => self.name_server.append_block(&self.path, self.local_host.clone()).await?,
            };
            debug!(path = %self.path, block_id = %assignment.block_id, data_servers = ?assignment.data_servers, "writing block");
            self.sender = Some(BlockSender::connect(assignment.block_id, &assignment.data_servers, None).await?);
        }
        let Some(sender) = self.sender.as_mut() else {
            return Err(DfsError::InvalidOperation("no pipeline for the current block".into()));
        };

        self.packet.copy_from(&self.buffer, is_last, self.sequence_number)?;
        sender.send_packet(&self.packet).await?;
        self.sequence_number += 1;
        self.block_bytes += self.buffer.len() as u64;
        self.buffer.clear();
        Ok(())
    }

    async fn finish_block(&mut self) -> Result<()> {
        if let Some(mut sender) = self.sender.take() {
            sender.wait_for_acknowledgements().await?;
            debug!(path = %self.path, block_id = %sender.block_id(), size = self.block_bytes, "block complete");
        }
        self.block_bytes = 0;
        self.sequence_number = 0;
        self.blocks_written += 1;
        Ok(())
    }
}

impl Drop for BlockOutputStream {
    fn drop(&mut self) {
        if !self.closed {
            warn!(path = %self.path, "output stream dropped without close; the file stays open for writing");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BLOCK: u64 = PACKET_SIZE as u64 * 2;

    #[test]
    fn records_that_fit_need_no_padding() {
        assert_eq!(padding_for_record(BLOCK, 0, BLOCK).unwrap(), 0);
        assert_eq!(padding_for_record(BLOCK, 100, BLOCK - 100).unwrap(), 0);
        assert_eq!(padding_for_record(BLOCK, 0, 10).unwrap(), 0);
    }

    #[test]
    fn records_that_overflow_end_the_block() {
        assert_eq!(padding_for_record(BLOCK, 100, BLOCK - 99).unwrap(), BLOCK - 100);
        assert_eq!(padding_for_record(BLOCK, BLOCK - 1, 2).unwrap(), 1);
    }

    #[test]
    fn records_larger_than_a_block_are_rejected() {
        assert!(matches!(
            padding_for_record(BLOCK, 0, BLOCK + 1),
            Err(DfsError::InvalidOperation(_))
        ));
    }
}
