//! The checksummed unit of block data exchanged between clients and data servers.
//!
//! A packet holds at most [`PACKET_SIZE`] bytes. Every packet of a block except the last one
//! is exactly full; the last one may be shorter, down to zero bytes when it only signals the
//! end of the block.
//!
//! Wire layouts (little endian):
//!
//! ```text
//! Full:              [checksum u32][size u32][last u8][sequence i64][payload]
//! NoSequenceNumber:  [checksum u32][size u32][last u8][payload]
//! ChecksumOnly:      [checksum u32][payload]
//! ```
//!
//! Checksum-only packets carry no length; it follows from the number of bytes left in the
//! stream, which is how block files are stored on disk.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::common::PACKET_SIZE;
use crate::error::{DfsError, Result};

/// Size of the checksum that prefixes every packet.
pub const CHECKSUM_SIZE: usize = 4;

/// Header size of a packet in the given format, excluding the payload.
pub const fn header_size(format: PacketFormat) -> usize {
    match format {
        PacketFormat::Full => CHECKSUM_SIZE + 4 + 1 + 8,
        PacketFormat::NoSequenceNumber => CHECKSUM_SIZE + 4 + 1,
        PacketFormat::ChecksumOnly => CHECKSUM_SIZE,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketFormat {
    Full,
    /// Sequence is implied by the order on the connection.
    NoSequenceNumber,
    /// Length and end-of-block are implied by the remaining stream length.
    ChecksumOnly,
}

/// A reusable packet buffer. The backing buffer is allocated once and reused for every packet
/// read into or copied into it.
pub struct Packet {
    data: Vec<u8>,
    size: usize,
    checksum: u32,
    is_last_packet: bool,
    sequence_number: i64,
}

impl Default for Packet {
    fn default() -> Self {
        Packet::new()
    }
}

impl std::fmt::Debug for Packet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Packet")
            .field("size", &self.size)
            .field("checksum", &self.checksum)
            .field("is_last_packet", &self.is_last_packet)
            .field("sequence_number", &self.sequence_number)
            .finish()
    }
}

impl Packet {
    pub fn new() -> Packet {
        Packet {
            data: vec![0; PACKET_SIZE],
            size: 0,
            checksum: 0,
            is_last_packet: false,
            sequence_number: 0,
        }
    }

    /// Build a packet from a payload, computing its checksum.
    pub fn from_data(data: &[u8], is_last_packet: bool, sequence_number: i64) -> Result<Packet> {
        let mut packet = Packet::new();
        packet.copy_from(data, is_last_packet, sequence_number)?;
        Ok(packet)
    }

    pub fn data(&self) -> &[u8] {
        &self.data[..self.size]
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn checksum(&self) -> u32 {
        self.checksum
    }

    pub fn is_last_packet(&self) -> bool {
        self.is_last_packet
    }

    pub fn sequence_number(&self) -> i64 {
        self.sequence_number
    }

    pub fn set_sequence_number(&mut self, sequence_number: i64) {
        self.sequence_number = sequence_number;
    }

    /// Mark this packet as the end of a transfer. Used when sending a prefix of a block.
    pub fn mark_last_packet(&mut self) {
        self.is_last_packet = true;
    }

    /// Forget the current contents without giving up the buffer.
    pub fn clear(&mut self) {
        self.size = 0;
        self.checksum = 0;
        self.is_last_packet = false;
        self.sequence_number = 0;
    }

    /// Replace the payload and recompute the checksum.
    pub fn copy_from(&mut self, data: &[u8], is_last_packet: bool, sequence_number: i64) -> Result<()> {
        validate_size(data.len(), is_last_packet)?;
        self.data[..data.len()].copy_from_slice(data);
        self.size = data.len();
        self.checksum = crc32fast::hash(data);
        self.is_last_packet = is_last_packet;
        self.sequence_number = sequence_number;
        Ok(())
    }

    /// Write the packet in the given format.
    pub async fn write<W: AsyncWrite + Unpin>(&self, writer: &mut W, format: PacketFormat) -> Result<()> {
        writer.write_u32_le(self.checksum).await?;
        if format != PacketFormat::ChecksumOnly {
            writer.write_u32_le(self.size as u32).await?;
            writer.write_u8(self.is_last_packet as u8).await?;
            if format == PacketFormat::Full {
                writer.write_i64_le(self.sequence_number).await?;
            }
        }
        writer.write_all(self.data()).await?;
        Ok(())
    }

    /// Read a packet written in `Full` or `NoSequenceNumber` format.
    ///
    /// With `verify_checksum`, a payload whose checksum differs from the transmitted one is
    /// rejected. A declared size larger than a packet, or a short packet that is not the last
    /// one, is always rejected.
    pub async fn read<R: AsyncRead + Unpin>(
        &mut self,
        reader: &mut R,
        format: PacketFormat,
        verify_checksum: bool,
    ) -> Result<()> {
        if format == PacketFormat::ChecksumOnly {
            return Err(DfsError::InvalidOperation(
                "checksum-only packets are read with read_checksum_only".into(),
            ));
        }

        let checksum = reader.read_u32_le().await?;
        let size = reader.read_u32_le().await? as usize;
        let is_last_packet = match reader.read_u8().await? {
            0 => false,
            1 => true,
            other => return Err(DfsError::InvalidPacket(format!("invalid end-of-block flag {other}"))),
        };
        let sequence_number = if format == PacketFormat::Full {
            reader.read_i64_le().await?
        } else {
            0
        };
        validate_size(size, is_last_packet)?;

        self.read_payload(reader, size, checksum, verify_checksum).await?;
        self.is_last_packet = is_last_packet;
        self.sequence_number = sequence_number;
        Ok(())
    }

    /// Read a packet written in `ChecksumOnly` format. `remaining` is the number of bytes left
    /// in the stream, starting at this packet's checksum.
    pub async fn read_checksum_only<R: AsyncRead + Unpin>(
        &mut self,
        reader: &mut R,
        remaining: u64,
        verify_checksum: bool,
    ) -> Result<()> {
        if remaining < CHECKSUM_SIZE as u64 {
            return Err(DfsError::InvalidPacket(format!(
                "{remaining} bytes left in stream, not enough for a packet"
            )));
        }
        let payload_remaining = remaining - CHECKSUM_SIZE as u64;
        let size = payload_remaining.min(PACKET_SIZE as u64) as usize;

        let checksum = reader.read_u32_le().await?;
        self.read_payload(reader, size, checksum, verify_checksum).await?;
        self.is_last_packet = payload_remaining <= PACKET_SIZE as u64;
        self.sequence_number = 0;
        Ok(())
    }

    async fn read_payload<R: AsyncRead + Unpin>(
        &mut self,
        reader: &mut R,
        size: usize,
        checksum: u32,
        verify_checksum: bool,
    ) -> Result<()> {
        reader.read_exact(&mut self.data[..size]).await?;
        if verify_checksum {
            let computed = crc32fast::hash(&self.data[..size]);
            if computed != checksum {
                self.clear();
                return Err(DfsError::InvalidPacket(format!(
                    "checksum mismatch: expected {checksum:#010x}, computed {computed:#010x}"
                )));
            }
        }
        self.size = size;
        self.checksum = checksum;
        Ok(())
    }
}

fn validate_size(size: usize, is_last_packet: bool) -> Result<()> {
    if size > PACKET_SIZE {
        return Err(DfsError::InvalidPacket(format!(
            "packet size {size} exceeds the maximum of {PACKET_SIZE}"
        )));
    }
    if size < PACKET_SIZE && !is_last_packet {
        return Err(DfsError::InvalidPacket(format!(
            "packet of {size} bytes is not full but is not the last packet"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    async fn round_trip(source: &Packet, format: PacketFormat) -> Packet {
        let mut wire = Vec::new();
        source.write(&mut wire, format).await.unwrap();
        assert_eq!(wire.len(), header_size(format) + source.size());

        let mut decoded = Packet::new();
        let mut reader = wire.as_slice();
        match format {
            PacketFormat::ChecksumOnly => decoded
                .read_checksum_only(&mut reader, wire.len() as u64, true)
                .await
                .unwrap(),
            _ => decoded.read(&mut reader, format, true).await.unwrap(),
        }
        assert!(reader.is_empty());
        decoded
    }

    #[tokio::test]
    async fn full_format_round_trip() {
        let source = Packet::from_data(&payload(PACKET_SIZE), false, 42).unwrap();
        let decoded = round_trip(&source, PacketFormat::Full).await;
        assert_eq!(decoded.data(), source.data());
        assert_eq!(decoded.checksum(), crc32fast::hash(source.data()));
        assert_eq!(decoded.sequence_number(), 42);
        assert!(!decoded.is_last_packet());
    }

    #[tokio::test]
    async fn no_sequence_number_format_round_trip() {
        let source = Packet::from_data(&payload(1000), true, 7).unwrap();
        let decoded = round_trip(&source, PacketFormat::NoSequenceNumber).await;
        assert_eq!(decoded.data(), source.data());
        assert_eq!(decoded.sequence_number(), 0);
        assert!(decoded.is_last_packet());
    }

    #[tokio::test]
    async fn checksum_only_infers_end_of_block() {
        let short = Packet::from_data(&payload(10), true, 0).unwrap();
        let decoded = round_trip(&short, PacketFormat::ChecksumOnly).await;
        assert_eq!(decoded.data(), short.data());
        assert!(decoded.is_last_packet());

        let empty = Packet::from_data(&[], true, 0).unwrap();
        let decoded = round_trip(&empty, PacketFormat::ChecksumOnly).await;
        assert_eq!(decoded.size(), 0);
        assert!(decoded.is_last_packet());

        // Two full packets back to back: only the second one ends the stream.
        let full = Packet::from_data(&payload(PACKET_SIZE), false, 0).unwrap();
        let mut wire = Vec::new();
        full.write(&mut wire, PacketFormat::ChecksumOnly).await.unwrap();
        full.write(&mut wire, PacketFormat::ChecksumOnly).await.unwrap();
        let total = wire.len() as u64;
        let mut reader = wire.as_slice();
        let mut decoded = Packet::new();
        decoded.read_checksum_only(&mut reader, total, true).await.unwrap();
        assert!(!decoded.is_last_packet());
        assert_eq!(decoded.size(), PACKET_SIZE);
        let remaining = reader.len() as u64;
        decoded.read_checksum_only(&mut reader, remaining, true).await.unwrap();
        assert!(decoded.is_last_packet());
        assert_eq!(decoded.size(), PACKET_SIZE);
    }

    #[tokio::test]
    async fn corrupted_payload_is_rejected_when_verifying() {
        let source = Packet::from_data(&payload(100), true, 0).unwrap();
        let mut wire = Vec::new();
        source.write(&mut wire, PacketFormat::Full).await.unwrap();
        let last = wire.len() - 1;
        wire[last] ^= 0xff;

        let mut decoded = Packet::new();
        let err = decoded
            .read(&mut wire.as_slice(), PacketFormat::Full, true)
            .await
            .unwrap_err();
        assert!(matches!(err, DfsError::InvalidPacket(_)));

        // With verification disabled the corrupted payload passes through.
        decoded
            .read(&mut wire.as_slice(), PacketFormat::Full, false)
            .await
            .unwrap();
        assert_eq!(decoded.size(), 100);
    }

    #[tokio::test]
    async fn inconsistent_lengths_are_rejected() {
        // Short packet that claims not to be the last one.
        let mut wire = Vec::new();
        wire.extend_from_slice(&crc32fast::hash(&[1, 2, 3]).to_le_bytes());
        wire.extend_from_slice(&3u32.to_le_bytes());
        wire.push(0);
        wire.extend_from_slice(&[1, 2, 3]);
        let err = Packet::new()
            .read(&mut wire.as_slice(), PacketFormat::NoSequenceNumber, true)
            .await
            .unwrap_err();
        assert!(matches!(err, DfsError::InvalidPacket(_)));

        // Declared size above the maximum.
        let mut wire = Vec::new();
        wire.extend_from_slice(&0u32.to_le_bytes());
        wire.extend_from_slice(&(PACKET_SIZE as u32 + 1).to_le_bytes());
        wire.push(1);
        let err = Packet::new()
            .read(&mut wire.as_slice(), PacketFormat::NoSequenceNumber, false)
            .await
            .unwrap_err();
        assert!(matches!(err, DfsError::InvalidPacket(_)));

        assert!(Packet::from_data(&payload(10), false, 0).is_err());
        assert!(Packet::from_data(&payload(PACKET_SIZE + 1), true, 0).is_err());
    }

    #[test]
    fn clear_keeps_the_buffer() {
        let mut packet = Packet::from_data(&payload(500), true, 3).unwrap();
        let buffer = packet.data.as_ptr();
        packet.clear();
        assert_eq!(packet.size(), 0);
        assert_eq!(packet.checksum(), 0);
        assert!(!packet.is_last_packet());
        assert_eq!(packet.data.as_ptr(), buffer);
        assert_eq!(packet.data.len(), PACKET_SIZE);
    }
}
