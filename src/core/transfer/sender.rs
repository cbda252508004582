//! Outbound transfers: handshake, batched chunk streaming under
//! backpressure, and acknowledgment-driven completion.

use super::chunk::{chunk_range, in_flight_progress};
use super::error::TransferError;
use super::types::{ControlFrame, Direction, OutgoingFile, Transfer, TransferEvent, TransferStatus};
use crate::core::connection::link::{Frame, NegotiationState, PeerTransport};
use crate::core::engine::TransferContext;
use bytes::Bytes;
use std::io::SeekFrom;
use std::path::Path;
use std::sync::Arc;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::{oneshot, watch};
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

/// Sender-side bookkeeping for one in-flight transfer.
pub(crate) struct OutboundTracker {
    info_ack: Option<oneshot::Sender<()>>,
    acked: watch::Sender<u32>,
}

/// Send `file` to `peer` under transfer id `id`.
///
/// Resolves once every chunk has been acknowledged, or with the error that
/// was reported for this transfer.
pub(crate) async fn send_file(
    ctx: &TransferContext,
    file: OutgoingFile,
    peer: &str,
    id: String,
) -> Result<Transfer, TransferError> {
    let transfer = Transfer::outbound(id.clone(), peer.to_string(), file.name.clone(), file.size);
    if !ctx.registry.write().await.insert(transfer.clone()) {
        return Err(TransferError::ProtocolViolation(format!(
            "transfer id {id} is already in use"
        )));
    }

    let (info_tx, info_rx) = oneshot::channel();
    let (acked_tx, acked_rx) = watch::channel(0u32);
    ctx.outbound.write().await.insert(
        id.clone(),
        OutboundTracker {
            info_ack: Some(info_tx),
            acked: acked_tx,
        },
    );

    info!(
        event = "transfer_send_start",
        transfer_id = %id,
        peer,
        file = %transfer.file_name,
        size = transfer.file_size,
        chunks = transfer.total_chunks,
        "Starting outbound transfer"
    );

    let sos = ctx.sos.clone();
    let outcome = tokio::select! {
        res = drive(ctx, &file, &transfer, info_rx, acked_rx) => res,
        _ = sos.wait() => {
            // The handler is shutting down; cleanup owns the tables now.
            debug!(event = "transfer_send_stopped", transfer_id = %id, peer);
            return Err(closed(peer, NegotiationState::Closed));
        }
    };

    match outcome {
        Ok(done) => Ok(done),
        Err(e) => {
            ctx.fail(&id, e.clone()).await;
            Err(e)
        }
    }
}

async fn drive(
    ctx: &TransferContext,
    file: &OutgoingFile,
    transfer: &Transfer,
    info_rx: oneshot::Receiver<()>,
    acked_rx: watch::Receiver<u32>,
) -> Result<Transfer, TransferError> {
    let id = transfer.id.as_str();
    let peer = transfer.peer.as_str();
    let transport = ctx.links.ensure_link(peer).await?;

    if let Some(snapshot) = ctx.snapshot(id).await {
        ctx.emit(TransferEvent::Progress(snapshot));
    }

    let pump = async {
        handshake(ctx, &transport, transfer, info_rx).await?;
        stream_chunks(ctx, &transport, file, transfer).await
    };
    let watchdog = watch_progress(ctx, acked_rx, transfer);
    tokio::try_join!(pump, watchdog)?;

    send_control(
        &transport,
        &ControlFrame::TransferComplete {
            transfer_id: id.to_string(),
        },
    )
    .await?;

    // Whoever removes the record reports it.
    let removed = ctx.registry.write().await.remove(id);
    ctx.outbound.write().await.remove(id);
    let mut record = removed.ok_or_else(|| closed(peer, NegotiationState::Closed))?;
    record.transfer.status = TransferStatus::Completed;
    record.transfer.progress = 100;
    record.transfer.acked_chunks = record.transfer.total_chunks;

    info!(event = "transfer_send_complete", transfer_id = %id, peer, "Outbound transfer complete");
    ctx.emit(TransferEvent::Complete(record.transfer.clone()));
    Ok(record.transfer)
}

/// Announce the file and give the receiver a bounded window to confirm.
/// A missing confirmation is not fatal.
async fn handshake(
    ctx: &TransferContext,
    transport: &Arc<dyn PeerTransport>,
    transfer: &Transfer,
    info_rx: oneshot::Receiver<()>,
) -> Result<(), TransferError> {
    send_control(
        transport,
        &ControlFrame::FileInfo {
            transfer_id: transfer.id.clone(),
            file_name: transfer.file_name.clone(),
            file_size: transfer.file_size,
            total_chunks: transfer.total_chunks,
        },
    )
    .await?;

    match timeout(ctx.config.file_info_ack_timeout, info_rx).await {
        Ok(Ok(())) => debug!(event = "file_info_acked", transfer_id = %transfer.id),
        Ok(Err(_)) => return Err(closed(&transfer.peer, NegotiationState::Closed)),
        Err(_) => warn!(
            event = "file_info_ack_timeout",
            transfer_id = %transfer.id,
            "No file-info-ack, sending anyway"
        ),
    }
    Ok(())
}

/// Stream every chunk as a `file-chunk` frame followed by its payload,
/// in batches with a cooperative yield between them.
async fn stream_chunks(
    ctx: &TransferContext,
    transport: &Arc<dyn PeerTransport>,
    file: &OutgoingFile,
    transfer: &Transfer,
) -> Result<(), TransferError> {
    let total = transfer.total_chunks;
    let batch = ctx.config.batch_size.max(1) as u32;
    let mut reader = ChunkReader::open(&file.path, transfer.file_size).await?;

    let mut batch_start = 0u32;
    while batch_start < total {
        let batch_end = batch_start.saturating_add(batch).min(total);
        for index in batch_start..batch_end {
            wait_for_buffer_space(ctx, transport, transfer).await?;
            let payload = reader.read(index).await?;
            send_control(
                transport,
                &ControlFrame::FileChunk {
                    transfer_id: transfer.id.clone(),
                    chunk_index: index,
                },
            )
            .await?;
            transport.send(Frame::Binary(payload)).await?;
        }
        if !ctx.registry.read().await.contains(&transfer.id) {
            return Err(closed(&transfer.peer, NegotiationState::Closed));
        }
        batch_start = batch_end;
        tokio::task::yield_now().await;
    }
    debug!(event = "transfer_chunks_sent", transfer_id = %transfer.id, chunks = total);
    Ok(())
}

// ── Disk reader ───────────────────────────────────────────────────────────────

/// Reads chunk payloads from the source file on demand, so memory holds
/// one chunk at a time regardless of file size.
struct ChunkReader {
    file: File,
    size: u64,
}

impl ChunkReader {
    async fn open(path: &Path, size: u64) -> Result<Self, TransferError> {
        let file = File::open(path)
            .await
            .map_err(|e| TransferError::SourceRead(format!("{}: {e}", path.display())))?;
        Ok(Self { file, size })
    }

    async fn read(&mut self, index: u32) -> Result<Bytes, TransferError> {
        let range = chunk_range(self.size, index);
        let mut buf = vec![0u8; range.len()];
        self.file
            .seek(SeekFrom::Start(range.start as u64))
            .await
            .map_err(|e| TransferError::SourceRead(format!("seek to chunk {index}: {e}")))?;
        self.file
            .read_exact(&mut buf)
            .await
            .map_err(|e| TransferError::SourceRead(format!("chunk {index}: {e}")))?;
        Ok(Bytes::from(buf))
    }
}

// ── Backpressure ──────────────────────────────────────────────────────────────

/// Suspend while the channel buffer is above the high water mark, resuming
/// once it drains below the low one. Bounded by link loss, transfer failure
/// and the no-progress watchdog running alongside.
async fn wait_for_buffer_space(
    ctx: &TransferContext,
    transport: &Arc<dyn PeerTransport>,
    transfer: &Transfer,
) -> Result<(), TransferError> {
    let buffered = transport.buffered_amount().await;
    if buffered <= ctx.config.buffered_high {
        return Ok(());
    }

    info!(
        event = "backpressure",
        transfer_id = %transfer.id,
        buffered,
        high_watermark = ctx.config.buffered_high,
        "Applying backpressure - waiting for buffer to drain"
    );

    loop {
        if !transport.is_open() {
            return Err(closed(&transfer.peer, NegotiationState::Closed));
        }
        if !ctx.registry.read().await.contains(&transfer.id) {
            return Err(closed(&transfer.peer, NegotiationState::Closed));
        }
        if transport.buffered_amount().await < ctx.config.buffered_low {
            return Ok(());
        }
        sleep(ctx.config.buffer_poll_interval).await;
    }
}

// ── Watchdog ──────────────────────────────────────────────────────────────────

/// Resolve once every chunk is acknowledged. Fails with `TransferTimeout`
/// when the acknowledged count does not advance within the window.
async fn watch_progress(
    ctx: &TransferContext,
    mut acked_rx: watch::Receiver<u32>,
    transfer: &Transfer,
) -> Result<(), TransferError> {
    let window = ctx.config.no_progress_timeout;
    loop {
        if *acked_rx.borrow_and_update() >= transfer.total_chunks {
            return Ok(());
        }
        match timeout(window, acked_rx.changed()).await {
            Ok(Ok(())) => continue,
            // Tracker dropped: the transfer already failed elsewhere.
            Ok(Err(_)) => return Err(closed(&transfer.peer, NegotiationState::Closed)),
            Err(_) => {
                warn!(
                    event = "transfer_watchdog_fired",
                    transfer_id = %transfer.id,
                    acked = *acked_rx.borrow(),
                    total = transfer.total_chunks,
                    "No acknowledgment progress"
                );
                return Err(TransferError::TransferTimeout {
                    secs: window.as_secs(),
                });
            }
        }
    }
}

// ── Inbound control for outbound transfers ────────────────────────────────────

pub(crate) async fn handle_file_info_ack(ctx: &TransferContext, id: &str) {
    let tx = ctx
        .outbound
        .write()
        .await
        .get_mut(id)
        .and_then(|t| t.info_ack.take());
    match tx {
        Some(tx) => {
            let _ = tx.send(());
        }
        None => debug!(event = "file_info_ack_ignored", transfer_id = %id),
    }
}

/// Apply a `chunk-ack`. The acknowledged count only ever grows and never
/// exceeds the chunk total; 100% is left to the completion event.
pub(crate) async fn handle_chunk_ack(ctx: &TransferContext, peer: &str, id: &str, received: u32) {
    let snapshot = {
        let mut registry = ctx.registry.write().await;
        let Some(record) = registry.get_mut(id) else {
            debug!(event = "chunk_ack_unknown", transfer_id = %id, peer);
            return;
        };
        let t = &mut record.transfer;
        if t.direction != Direction::Outbound || t.peer != peer {
            warn!(event = "chunk_ack_mismatch", transfer_id = %id, peer, "Ack for a transfer not sent to this peer");
            return;
        }
        let clamped = received.min(t.total_chunks);
        if clamped <= t.acked_chunks {
            return;
        }
        t.acked_chunks = clamped;
        t.status = TransferStatus::Transferring;
        t.progress = t.progress.max(in_flight_progress(clamped, t.total_chunks));
        t.clone()
    };

    if let Some(tracker) = ctx.outbound.read().await.get(id) {
        tracker.acked.send_replace(snapshot.acked_chunks);
    }
    if snapshot.acked_chunks < snapshot.total_chunks {
        ctx.emit(TransferEvent::Progress(snapshot));
    }
}

// ── Helpers ───────────────────────────────────────────────────────────────────

async fn send_control(
    transport: &Arc<dyn PeerTransport>,
    frame: &ControlFrame,
) -> Result<(), TransferError> {
    let json = serde_json::to_string(frame)
        .map_err(|e| TransferError::Transport(format!("encode control frame: {e}")))?;
    transport.send(Frame::Text(json)).await?;
    Ok(())
}

fn closed(peer: &str, state: NegotiationState) -> TransferError {
    TransferError::LinkClosedDuringTransfer {
        peer: peer.to_string(),
        state: state.to_string(),
        missing: None,
    }
}
