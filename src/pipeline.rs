//! Replica pipeline transport.
//!
//! A [`BlockSender`] is one hop of a replica chain. It pushes packets to its downstream data
//! server (if any) and runs a background task that drains the downstream acknowledgements in
//! order, relaying each one upstream or recording it locally. A sender without a downstream is
//! the end of the chain and acknowledges packets as soon as they are submitted.
//!
//! Acknowledgement wire format: one little-endian `i64` sequence number per packet, followed by
//! a single status byte once the last packet has been stored by every hop.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::common::{BlockId, ServerAddress};
use crate::error::{DfsError, Result};
use crate::packet::{Packet, PacketFormat};
use crate::protocol::{self, DataServerHeader, DataServerStatus};

/// Connection back to whoever sent us the packets, shared between the hop that owns it and the
/// acknowledgement task.
pub type Upstream = Arc<tokio::sync::Mutex<Box<dyn AsyncWrite + Send + Unpin>>>;

pub fn upstream<W: AsyncWrite + Send + Unpin + 'static>(writer: W) -> Upstream {
    Arc::new(tokio::sync::Mutex::new(Box::new(writer)))
}

enum Downstream {
    /// End of the chain.
    Terminal,
    Forwarding {
        address: ServerAddress,
        writer: BufWriter<OwnedWriteHalf>,
    },
}

struct PendingAck {
    sequence_number: i64,
    is_last: bool,
}

struct SenderState {
    error: Mutex<Option<String>>,
    cancel: CancellationToken,
    last_acknowledged: AtomicI64,
}

impl SenderState {
    /// Record a fault. The first fault wins and every later operation reports it.
    fn fail(&self, message: String) -> DfsError {
        let mut error = self.error.lock();
        let message = error.get_or_insert(message).clone();
        DfsError::PipelineFailed(message)
    }

    fn check(&self) -> Result<()> {
        if let Some(message) = self.error.lock().as_ref() {
            return Err(DfsError::PipelineFailed(message.clone()));
        }
        if self.cancel.is_cancelled() {
            return Err(DfsError::Cancelled);
        }
        Ok(())
    }
}

pub struct BlockSender {
    block_id: BlockId,
    downstream: Downstream,
    pending: Option<mpsc::UnboundedSender<PendingAck>>,
    drain: Option<JoinHandle<Result<()>>>,
    state: Arc<SenderState>,
    next_sequence_number: i64,
    last_packet_sent: bool,
}

impl BlockSender {
    /// Open a pipeline for `block_id` through `data_servers`.
    ///
    /// With a non-empty list this connects to the first server, hands it the rest of the list
    /// and waits until the whole chain has accepted the header. `upstream` receives the
    /// acknowledgements when this sender is itself a hop in somebody else's chain.
    pub async fn connect(
        block_id: BlockId,
        data_servers: &[ServerAddress],
        upstream: Option<Upstream>,
    ) -> Result<BlockSender> {
        let (downstream, ack_reader) = match data_servers.split_first() {
            None => (Downstream::Terminal, None),
            Some((first, rest)) => {
                let stream = protocol::connect(first).await?;
                let (read_half, write_half) = stream.into_split();
                let mut reader = BufReader::new(read_half);
                let mut writer = BufWriter::new(write_half);

                let header = DataServerHeader::WriteBlock {
                    block_id,
                    data_servers: rest.to_vec(),
                };
                protocol::write_frame(&mut writer, &header).await?;
                let status = protocol::read_status(&mut reader).await?;
                if status != DataServerStatus::Ok {
                    return Err(DfsError::PipelineFailed(format!(
                        "{first} rejected block {block_id} with status {status:?}"
                    )));
                }
                debug!(%block_id, downstream = %first, hops = data_servers.len(), "replica pipeline connected");
                (
                    Downstream::Forwarding {
                        address: first.clone(),
                        writer,
                    },
                    Some(reader),
                )
            }
        };

        let state = Arc::new(SenderState {
            error: Mutex::new(None),
            cancel: CancellationToken::new(),
            last_acknowledged: AtomicI64::new(-1),
        });
        let (pending, pending_rx) = mpsc::unbounded_channel();
        let drain = tokio::spawn(drain_acknowledgements(
            block_id,
            pending_rx,
            ack_reader,
            upstream,
            state.clone(),
        ));

        Ok(BlockSender {
            block_id,
            downstream,
            pending: Some(pending),
            drain: Some(drain),
            state,
            next_sequence_number: 0,
            last_packet_sent: false,
        })
    }

    pub fn block_id(&self) -> BlockId {
        self.block_id
    }

    /// Sequence number of the most recent acknowledged packet, -1 before the first one.
    pub fn last_acknowledged(&self) -> i64 {
        self.state.last_acknowledged.load(Ordering::SeqCst)
    }

    pub fn is_failed(&self) -> bool {
        self.state.error.lock().is_some()
    }

    /// Submit the next packet. Returns once the packet is handed to the downstream connection;
    /// its acknowledgement arrives asynchronously.
    pub async fn send_packet(&mut self, packet: &Packet) -> Result<()> {
        self.state.check()?;
        if self.last_packet_sent {
            return Err(DfsError::InvalidOperation(format!(
                "block {} already received its last packet",
                self.block_id
            )));
        }
        if packet.sequence_number() != self.next_sequence_number {
            return Err(self.state.fail(format!(
                "packet sequence number {} out of order, expected {}",
                packet.sequence_number(),
                self.next_sequence_number
            )));
        }

        if let Downstream::Forwarding { address, writer } = &mut self.downstream {
            let result = tokio::select! {
                _ = self.state.cancel.cancelled() => Err(DfsError::Cancelled),
                result = async {
                    packet.write(writer, PacketFormat::Full).await?;
                    writer.flush().await?;
                    Ok::<(), DfsError>(())
                } => result,
            };
            match result {
                Ok(()) => {}
                Err(DfsError::Cancelled) => return Err(DfsError::Cancelled),
                Err(e) => return Err(self.state.fail(format!("sending packet to {address} failed: {e}"))),
            }
        }

        let pending = self
            .pending
            .as_ref()
            .ok_or_else(|| DfsError::InvalidOperation("pipeline is already finishing".into()))?;
        let ack = PendingAck {
            sequence_number: packet.sequence_number(),
            is_last: packet.is_last_packet(),
        };
        if pending.send(ack).is_err() {
            self.state.check()?;
            return Err(self.state.fail("acknowledgement task exited early".into()));
        }

        self.next_sequence_number += 1;
        self.last_packet_sent = packet.is_last_packet();
        Ok(())
    }

    /// Block until every submitted packet is acknowledged. After the last packet of a block this
    /// also means every hop of the chain reported the block as stored.
    pub async fn wait_for_acknowledgements(&mut self) -> Result<()> {
        // Closing the queue lets the drain task finish once it has caught up.
        self.pending.take();
        if let Some(drain) = self.drain.take() {
            match drain.await {
                Ok(result) => result?,
                Err(e) => return Err(self.state.fail(format!("acknowledgement task failed: {e}"))),
            }
        }
        self.state.check()
    }

    /// Ask the acknowledgement task to stop. Pending and later calls report `Cancelled`.
    pub fn cancel(&self) {
        self.state.cancel.cancel();
    }
}

impl Drop for BlockSender {
    fn drop(&mut self) {
        if self.drain.is_some() {
            self.state.cancel.cancel();
        }
    }
}

async fn drain_acknowledgements(
    block_id: BlockId,
    pending: mpsc::UnboundedReceiver<PendingAck>,
    downstream: Option<BufReader<OwnedReadHalf>>,
    upstream: Option<Upstream>,
    state: Arc<SenderState>,
) -> Result<()> {
    match drain_loop(pending, downstream, upstream, &state).await {
        Ok(()) => Ok(()),
        Err(DfsError::Cancelled) => {
            info!(%block_id, "acknowledgement drain cancelled");
            Err(DfsError::Cancelled)
        }
        Err(e) => {
            warn!(%block_id, error = %e, "acknowledgement drain failed");
            let message = match e {
                DfsError::PipelineFailed(message) => message,
                other => other.to_string(),
            };
            Err(state.fail(message))
        }
    }
}

async fn drain_loop(
    mut pending: mpsc::UnboundedReceiver<PendingAck>,
    mut downstream: Option<BufReader<OwnedReadHalf>>,
    upstream: Option<Upstream>,
    state: &SenderState,
) -> Result<()> {
    let cancel = state.cancel.clone();
    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => return Err(DfsError::Cancelled),
            next = pending.recv() => next,
        };
        let Some(ack) = next else {
            return Ok(());
        };

        if let Some(reader) = downstream.as_mut() {
            let received = tokio::select! {
                _ = cancel.cancelled() => return Err(DfsError::Cancelled),
                received = reader.read_i64_le() => received?,
            };
            if received != ack.sequence_number {
                return Err(DfsError::PipelineFailed(format!(
                    "expected acknowledgement for packet {}, received {received}",
                    ack.sequence_number
                )));
            }
        }

        if let Some(upstream) = &upstream {
            let mut writer = upstream.lock().await;
            writer.write_i64_le(ack.sequence_number).await?;
            writer.flush().await?;
        }
        state.last_acknowledged.store(ack.sequence_number, Ordering::SeqCst);

        if ack.is_last {
            if let Some(reader) = downstream.as_mut() {
                let status = tokio::select! {
                    _ = cancel.cancelled() => return Err(DfsError::Cancelled),
                    status = protocol::read_status(reader) => status?,
                };
                if status != DataServerStatus::Ok {
                    return Err(DfsError::PipelineFailed(format!(
                        "downstream failed to store the block: {status:?}"
                    )));
                }
            }
            return Ok(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::PACKET_SIZE;
    use tokio::net::TcpListener;

    /// A stand-in for a data server that accepts one write and acknowledges every packet,
    /// replacing the acknowledgement at `corrupt_at` with a wrong sequence number.
    async fn fake_data_server(corrupt_at: Option<i64>) -> (ServerAddress, JoinHandle<Vec<i64>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = ServerAddress::from(listener.local_addr().unwrap());
        let handle = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (read_half, mut write_half) = stream.into_split();
            let mut reader = BufReader::new(read_half);
            let header: DataServerHeader = protocol::read_frame(&mut reader).await.unwrap().unwrap();
            assert!(matches!(header, DataServerHeader::WriteBlock { ref data_servers, .. } if data_servers.is_empty()));
            protocol::write_status(&mut write_half, DataServerStatus::Ok).await.unwrap();

            let mut received = Vec::new();
            let mut packet = Packet::new();
            loop {
                if packet.read(&mut reader, PacketFormat::Full, true).await.is_err() {
                    break;
                }
                let sequence_number = packet.sequence_number();
                received.push(sequence_number);
                let ack = if corrupt_at == Some(sequence_number) {
                    sequence_number + 1
                } else {
                    sequence_number
                };
                if write_half.write_i64_le(ack).await.is_err() {
                    break;
                }
                if packet.is_last_packet() {
                    protocol::write_status(&mut write_half, DataServerStatus::Ok).await.unwrap();
                    break;
                }
            }
            received
        });
        (address, handle)
    }

    fn packets(count: usize) -> Vec<Packet> {
        (0..count)
            .map(|i| {
                let is_last = i + 1 == count;
                let data = vec![i as u8; if is_last { 100 } else { PACKET_SIZE }];
                Packet::from_data(&data, is_last, i as i64).unwrap()
            })
            .collect()
    }

    #[tokio::test]
    async fn acknowledgements_arrive_in_order() {
        let (address, server) = fake_data_server(None).await;
        let block_id = uuid::Uuid::new_v4();
        let mut sender = BlockSender::connect(block_id, &[address], None).await.unwrap();

        for packet in packets(5) {
            sender.send_packet(&packet).await.unwrap();
        }
        sender.wait_for_acknowledgements().await.unwrap();

        assert_eq!(sender.last_acknowledged(), 4);
        assert_eq!(server.await.unwrap(), vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn wrong_acknowledgement_fails_the_pipeline() {
        let (address, _server) = fake_data_server(Some(1)).await;
        let mut sender = BlockSender::connect(uuid::Uuid::new_v4(), &[address], None)
            .await
            .unwrap();

        let packets = packets(4);
        for packet in &packets[..3] {
            // The failure may already be visible to the later submissions.
            if sender.send_packet(packet).await.is_err() {
                break;
            }
        }
        let err = sender.wait_for_acknowledgements().await.unwrap_err();
        assert!(matches!(err, DfsError::PipelineFailed(_)), "{err:?}");
        assert!(sender.is_failed());

        // The fault is sticky.
        let err = sender.send_packet(&packets[3]).await.unwrap_err();
        assert!(matches!(err, DfsError::PipelineFailed(_)));
        let err = sender.wait_for_acknowledgements().await.unwrap_err();
        assert!(matches!(err, DfsError::PipelineFailed(_)));
    }

    #[tokio::test]
    async fn out_of_order_submission_is_rejected() {
        let mut sender = BlockSender::connect(uuid::Uuid::new_v4(), &[], None).await.unwrap();
        let packet = Packet::from_data(&[1, 2, 3], true, 3).unwrap();
        let err = sender.send_packet(&packet).await.unwrap_err();
        assert!(matches!(err, DfsError::PipelineFailed(_)));
        assert!(sender.wait_for_acknowledgements().await.is_err());
    }

    #[tokio::test]
    async fn terminal_hop_echoes_acknowledgements_upstream() {
        let (ours, mut theirs) = tokio::io::duplex(1024);
        let mut sender = BlockSender::connect(uuid::Uuid::new_v4(), &[], Some(upstream(ours)))
            .await
            .unwrap();

        for packet in packets(3) {
            sender.send_packet(&packet).await.unwrap();
        }
        sender.wait_for_acknowledgements().await.unwrap();

        for expected in 0..3 {
            assert_eq!(theirs.read_i64_le().await.unwrap(), expected);
        }
        // No more packets once the last one went through.
        let extra = Packet::from_data(&[], true, 3).unwrap();
        assert!(sender.send_packet(&extra).await.is_err());
    }

    #[tokio::test]
    async fn cancellation_is_not_a_fault() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = ServerAddress::from(listener.local_addr().unwrap());
        // Accepts the header but never acknowledges anything.
        let _server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let _: Option<DataServerHeader> = protocol::read_frame(&mut stream).await.unwrap();
            protocol::write_status(&mut stream, DataServerStatus::Ok).await.unwrap();
            tokio::time::sleep(std::time::Duration::from_secs(30)).await;
        });

        let mut sender = BlockSender::connect(uuid::Uuid::new_v4(), &[address], None)
            .await
            .unwrap();
        let packet = Packet::from_data(&[0; 10], true, 0).unwrap();
        sender.send_packet(&packet).await.unwrap();
        sender.cancel();

        let err = sender.wait_for_acknowledgements().await.unwrap_err();
        assert!(matches!(err, DfsError::Cancelled), "{err:?}");
        assert!(!sender.is_failed());
    }
}
