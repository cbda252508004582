//! Inbound transfers: chunk announcement/payload pairing, ack cadence and
//! ordered reassembly.

use super::chunk::{
    assemble, chunk_range, content_type_for, in_flight_progress, should_ack, total_chunks,
};
use super::error::TransferError;
use super::types::{ControlFrame, Direction, Transfer, TransferEvent, TransferStatus};
use crate::core::connection::link::Frame;
use crate::core::engine::TransferContext;
use bytes::Bytes;
use tracing::{debug, error, info, warn};

/// The chunk announced by the last `file-chunk` frame from a peer whose
/// binary payload has not arrived yet. At most one per peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct PendingChunkMarker {
    pub transfer_id: String,
    pub chunk_index: u32,
}

async fn reply(ctx: &TransferContext, peer: &str, frame: ControlFrame) {
    let Some(transport) = ctx.links.transport(peer).await else {
        warn!(event = "reply_without_link", peer, "No link to reply on");
        return;
    };
    let sent = match serde_json::to_string(&frame) {
        Ok(json) => transport.send(Frame::Text(json)).await,
        Err(e) => Err(e.into()),
    };
    if let Err(e) = sent {
        warn!(event = "reply_send_failure", peer, transfer_id = %frame.transfer_id(), error = %e);
    }
}

// ── file-info ─────────────────────────────────────────────────────────────────

pub(crate) async fn handle_file_info(
    ctx: &TransferContext,
    peer: &str,
    transfer_id: String,
    file_name: String,
    file_size: u64,
    announced_chunks: u32,
) {
    if announced_chunks != total_chunks(file_size) {
        warn!(
            event = "file_info_chunk_count_odd",
            transfer_id = %transfer_id,
            announced = announced_chunks,
            size = file_size,
            "Announced chunk count does not match file size"
        );
    }

    let transfer = Transfer::inbound(
        transfer_id.clone(),
        peer.to_string(),
        file_name,
        file_size,
        announced_chunks,
    );
    if !ctx.registry.write().await.insert(transfer.clone()) {
        warn!(event = "file_info_duplicate", transfer_id = %transfer_id, peer, "Transfer already registered");
        return;
    }

    info!(
        event = "transfer_receive_start",
        transfer_id = %transfer_id,
        peer,
        file = %transfer.file_name,
        size = file_size,
        chunks = announced_chunks,
        "Incoming transfer"
    );
    ctx.emit(TransferEvent::Progress(transfer));
    reply(ctx, peer, ControlFrame::FileInfoAck { transfer_id }).await;
}

// ── file-chunk + binary ───────────────────────────────────────────────────────

pub(crate) async fn handle_file_chunk(
    ctx: &TransferContext,
    peer: &str,
    transfer_id: String,
    chunk_index: u32,
) {
    let marker = PendingChunkMarker {
        transfer_id,
        chunk_index,
    };
    let stale = ctx.markers.write().await.insert(peer.to_string(), marker);

    // Two announcements in a row: the first payload never arrived.
    if let Some(stale) = stale {
        ctx.fail(
            &stale.transfer_id,
            TransferError::ProtocolViolation(format!(
                "chunk {} was announced but its payload never arrived",
                stale.chunk_index
            )),
        )
        .await;
    }
}

enum ChunkOutcome {
    Stored { snapshot: Transfer, ack: bool },
    Duplicate,
    Unknown,
    Invalid(TransferError),
}

pub(crate) async fn handle_binary(ctx: &TransferContext, peer: &str, data: Bytes) {
    let marker = ctx.markers.write().await.remove(peer);
    let Some(marker) = marker else {
        let oldest = ctx.registry.read().await.oldest_incomplete_inbound(peer);
        match oldest {
            Some(id) => {
                ctx.fail(
                    &id,
                    TransferError::ProtocolViolation(
                        "binary frame without a preceding file-chunk announcement".into(),
                    ),
                )
                .await;
            }
            None => error!(
                event = "binary_without_marker",
                peer,
                bytes = data.len(),
                "Binary frame with no announced chunk and no active transfer"
            ),
        }
        return;
    };

    let id = marker.transfer_id.as_str();
    let index = marker.chunk_index;
    let outcome = {
        let mut registry = ctx.registry.write().await;
        match registry.get_mut(id) {
            None => ChunkOutcome::Unknown,
            Some(record) => {
                let t = &mut record.transfer;
                if t.direction != Direction::Inbound || t.peer != peer {
                    ChunkOutcome::Unknown
                } else if index >= t.total_chunks {
                    ChunkOutcome::Invalid(TransferError::ProtocolViolation(format!(
                        "chunk index {index} out of range ({} chunks)",
                        t.total_chunks
                    )))
                } else if record.chunks.contains_key(&index) {
                    ChunkOutcome::Duplicate
                } else if data.len() != chunk_range(t.file_size, index).len() {
                    // Every chunk is full-sized except the last, which holds the remainder.
                    ChunkOutcome::Invalid(TransferError::ProtocolViolation(format!(
                        "chunk {index} carries {} bytes, expected {}",
                        data.len(),
                        chunk_range(t.file_size, index).len()
                    )))
                } else {
                    record.chunks.insert(index, data);
                    t.received_chunks += 1;
                    let ack = should_ack(t.received_chunks, t.total_chunks);
                    if ack {
                        t.progress = t.progress.max(in_flight_progress(t.received_chunks, t.total_chunks));
                    }
                    ChunkOutcome::Stored {
                        snapshot: t.clone(),
                        ack,
                    }
                }
            }
        }
    };

    match outcome {
        ChunkOutcome::Stored { snapshot, ack } => {
            if ack {
                reply(
                    ctx,
                    peer,
                    ControlFrame::ChunkAck {
                        transfer_id: snapshot.id.clone(),
                        received_count: snapshot.received_chunks,
                    },
                )
                .await;
                ctx.emit(TransferEvent::Progress(snapshot));
            }
        }
        ChunkOutcome::Duplicate => {
            debug!(event = "chunk_duplicate", transfer_id = %id, chunk = index, "Ignoring duplicate chunk")
        }
        ChunkOutcome::Unknown => {
            debug!(event = "chunk_unknown_transfer", transfer_id = %id, chunk = index, peer, "Dropping chunk")
        }
        ChunkOutcome::Invalid(e) => {
            ctx.fail(id, e).await;
        }
    }
}

// ── transfer-complete ─────────────────────────────────────────────────────────

pub(crate) async fn handle_transfer_complete(ctx: &TransferContext, peer: &str, id: &str) {
    let owned = ctx
        .registry
        .read()
        .await
        .get(id)
        .map(|r| r.transfer.direction == Direction::Inbound && r.transfer.peer == peer)
        .unwrap_or(false);
    if !owned {
        debug!(event = "transfer_complete_unknown", transfer_id = %id, peer);
        return;
    }
    finalize(ctx, id).await;
}

/// Verify the chunk count, assemble in index order, check the result against
/// the announced size and hand the file over.
pub(crate) async fn finalize(ctx: &TransferContext, id: &str) {
    let checked = {
        let mut registry = ctx.registry.write().await;
        let Some(record) = registry.get_mut(id) else {
            return;
        };
        let t = &mut record.transfer;
        t.status = TransferStatus::Finalizing;
        if t.received_chunks < t.total_chunks {
            Err(TransferError::ChunkCountMismatch {
                missing: t.missing_chunks(),
                received: t.received_chunks,
                total: t.total_chunks,
            })
        } else {
            Ok(registry.remove(id))
        }
    };

    let record = match checked {
        Ok(Some(record)) => record,
        Ok(None) => return,
        Err(e) => {
            ctx.fail(id, e).await;
            return;
        }
    };
    ctx.clear_marker_for(&record.transfer.peer, id).await;

    let mut transfer = record.transfer;
    ctx.emit(TransferEvent::Progress(transfer.clone()));

    let assembled = assemble(&record.chunks, transfer.total_chunks).and_then(|bytes| {
        if bytes.len() as u64 == transfer.file_size {
            Ok(bytes)
        } else {
            Err(TransferError::ProtocolViolation(format!(
                "assembled {} bytes but {} were announced",
                bytes.len(),
                transfer.file_size
            )))
        }
    });
    let bytes = match assembled {
        Ok(bytes) => bytes,
        Err(e) => {
            ctx.report_failure(&transfer, &e);
            return;
        }
    };

    transfer.status = TransferStatus::Completed;
    transfer.progress = 100;
    let content_type = content_type_for(&transfer.file_name);
    info!(
        event = "transfer_receive_complete",
        transfer_id = %transfer.id,
        peer = %transfer.peer,
        bytes = bytes.len(),
        content_type = %content_type,
        "Inbound transfer complete"
    );

    ctx.emit(TransferEvent::Complete(transfer.clone()));
    ctx.emit(TransferEvent::FileReceived {
        peer: transfer.peer,
        file_name: transfer.file_name,
        content_type,
        bytes,
    });
}
