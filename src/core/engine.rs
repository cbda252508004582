//! TransferHandler: one instance per signaling session.
//!
//! Owns the link manager, the transfer registry, the per-peer pending chunk
//! markers and the sender-side trackers. Nothing here is process-global:
//! two handlers never share state.
//!
//! A single dispatch task consumes inbound signaling and every link event
//! in arrival order, so frames from one peer are handled strictly in the
//! order the channel delivered them. Outbound transfers run in the
//! caller's task and meet the dispatch task only through the shared maps.

use crate::core::config::TransferConfig;
use crate::core::connection::link::{
    ConnectionState, Frame, LinkEvent, LinkEventReceiver, NegotiationState, TransportFactory,
};
use crate::core::connection::manager::PeerLinkManager;
use crate::core::connection::signaling::{SignalReceiver, SignalingBridge};
use crate::core::transfer::error::TransferError;
use crate::core::transfer::receiver::{self, PendingChunkMarker};
use crate::core::transfer::registry::TransferRegistry;
use crate::core::transfer::sender::{self, OutboundTracker};
use crate::core::transfer::types::{
    ControlFrame, Direction, OutgoingFile, Transfer, TransferEvent, TransferStatus,
};
use crate::core::transfer::notify_app;
use crate::utils::sos::SignalOfStop;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

// ── Shared context ────────────────────────────────────────────────────────────

/// State shared by the dispatch task and outbound transfer tasks.
#[derive(Clone)]
pub(crate) struct TransferContext {
    pub config: Arc<TransferConfig>,
    pub registry: Arc<RwLock<TransferRegistry>>,
    pub markers: Arc<RwLock<HashMap<String, PendingChunkMarker>>>,
    pub outbound: Arc<RwLock<HashMap<String, OutboundTracker>>>,
    pub links: Arc<PeerLinkManager>,
    pub app_tx: Option<mpsc::UnboundedSender<TransferEvent>>,
    pub sos: SignalOfStop,
}

impl TransferContext {
    pub fn emit(&self, event: TransferEvent) {
        notify_app(&self.app_tx, event);
    }

    pub async fn snapshot(&self, id: &str) -> Option<Transfer> {
        self.registry
            .read()
            .await
            .get(id)
            .map(|r| r.transfer.clone())
    }

    /// Remove `id` from every table and report `err`.
    ///
    /// Returns `false` without reporting when the transfer is already gone
    /// or the handler is shutting down. Each transfer gets one terminal
    /// report at most.
    pub async fn fail(&self, id: &str, err: TransferError) -> bool {
        let removed = self.registry.write().await.remove(id);
        let Some(record) = removed else {
            debug!(event = "transfer_fail_skipped", transfer_id = %id, error = %err);
            return false;
        };
        self.outbound.write().await.remove(id);
        self.clear_marker_for(&record.transfer.peer, id).await;
        if self.sos.cancelled() {
            debug!(event = "transfer_dropped_on_shutdown", transfer_id = %id, error = %err);
            return false;
        }
        self.report_failure(&record.transfer, &err);
        true
    }

    /// Report a failure for a transfer the caller has already removed.
    pub fn report_failure(&self, transfer: &Transfer, err: &TransferError) {
        warn!(
            event = "transfer_failed",
            transfer_id = %transfer.id,
            peer = %transfer.peer,
            file = %transfer.file_name,
            error = %err,
            "Transfer failed"
        );
        let mut snapshot = transfer.clone();
        snapshot.status = TransferStatus::Error;
        self.emit(TransferEvent::Error {
            transfer: snapshot,
            message: err.to_string(),
        });
    }

    pub async fn clear_marker_for(&self, peer: &str, id: &str) {
        let mut markers = self.markers.write().await;
        if markers.get(peer).is_some_and(|m| m.transfer_id == id) {
            markers.remove(peer);
        }
    }

    /// Fail every transfer tied to `peer` after its link degraded.
    ///
    /// Inbound transfers that already hold every chunk are finalized
    /// instead of failed.
    pub async fn cascade_link_loss(&self, peer: &str, state: NegotiationState) {
        self.markers.write().await.remove(peer);

        let (inbound, outbound) = {
            let registry = self.registry.read().await;
            (
                registry.ids_for_peer(peer, Direction::Inbound),
                registry.ids_for_peer(peer, Direction::Outbound),
            )
        };
        if !inbound.is_empty() || !outbound.is_empty() {
            warn!(
                event = "link_loss_cascade",
                peer,
                state = %state,
                inbound = inbound.len(),
                outbound = outbound.len(),
                "Cancelling transfers after link loss"
            );
        }

        for id in inbound {
            let missing = self
                .registry
                .read()
                .await
                .get(&id)
                .map(|r| r.transfer.missing_chunks());
            match missing {
                Some(0) => receiver::finalize(self, &id).await,
                Some(n) => {
                    self.fail(
                        &id,
                        TransferError::LinkClosedDuringTransfer {
                            peer: peer.to_string(),
                            state: state.to_string(),
                            missing: Some(n),
                        },
                    )
                    .await;
                }
                None => {}
            }
        }

        for id in outbound {
            self.fail(
                &id,
                TransferError::LinkClosedDuringTransfer {
                    peer: peer.to_string(),
                    state: state.to_string(),
                    missing: None,
                },
            )
            .await;
        }
    }
}

// ── Handler ───────────────────────────────────────────────────────────────────

pub struct TransferHandler {
    ctx: TransferContext,
    dispatch: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl TransferHandler {
    /// Build a handler bound to one signaling session and start dispatching.
    pub fn new(
        signaling: Arc<dyn SignalingBridge>,
        signals: SignalReceiver,
        factory: Arc<dyn TransportFactory>,
        config: TransferConfig,
        app_tx: Option<mpsc::UnboundedSender<TransferEvent>>,
    ) -> Self {
        let (link_tx, link_rx) = mpsc::unbounded_channel();
        let links = Arc::new(PeerLinkManager::new(
            factory,
            signaling,
            link_tx,
            config.link_open_timeout,
        ));
        let ctx = TransferContext {
            config: Arc::new(config),
            registry: Arc::new(RwLock::new(TransferRegistry::new())),
            markers: Arc::new(RwLock::new(HashMap::new())),
            outbound: Arc::new(RwLock::new(HashMap::new())),
            links,
            app_tx,
            sos: SignalOfStop::new(),
        };
        let dispatch = tokio::spawn(dispatch_loop(ctx.clone(), signals, link_rx));
        Self {
            ctx,
            dispatch: std::sync::Mutex::new(Some(dispatch)),
        }
    }

    /// Send `file` to `target`. A caller-supplied `transfer_id` lets a
    /// failed transfer be resubmitted under the same identity.
    pub async fn send_file(
        &self,
        file: OutgoingFile,
        target: &str,
        transfer_id: Option<String>,
    ) -> Result<Transfer, TransferError> {
        let id = transfer_id.unwrap_or_else(|| Uuid::new_v4().to_string());
        sender::send_file(&self.ctx, file, target, id).await
    }

    /// Snapshot of every transfer still in flight.
    #[cfg(test)]
    pub async fn transfers(&self) -> Vec<Transfer> {
        let registry = self.ctx.registry.read().await;
        registry.transfers().cloned().collect()
    }

    #[cfg(test)]
    pub async fn link_state(&self, peer: &str) -> Option<NegotiationState> {
        self.ctx.links.state(peer).await
    }

    /// Close every link, clear every table and stop listening to signaling.
    /// In-flight transfers end without further reports.
    pub async fn cleanup(&self) {
        info!(event = "handler_cleanup", "Cleaning up transfer handler");
        self.ctx.sos.cancel();
        if let Ok(mut guard) = self.dispatch.lock() {
            if let Some(handle) = guard.take() {
                handle.abort();
            }
        }
        self.ctx.links.close_all().await;
        self.ctx.registry.write().await.clear();
        self.ctx.markers.write().await.clear();
        self.ctx.outbound.write().await.clear();
    }
}

// ── Dispatch ──────────────────────────────────────────────────────────────────

async fn dispatch_loop(
    ctx: TransferContext,
    mut signals: SignalReceiver,
    mut link_rx: LinkEventReceiver,
) {
    loop {
        tokio::select! {
            _ = ctx.sos.wait() => break,
            Some(signal) = signals.recv() => {
                let from = signal.from.clone();
                if let Err(e) = ctx.links.handle_signal(signal).await {
                    warn!(event = "signal_failure", peer = %from, error = %e, "Failed to apply signaling message");
                }
            }
            Some((peer, event)) = link_rx.recv() => handle_link_event(&ctx, &peer, event).await,
            else => break,
        }
    }
    debug!(event = "dispatch_stopped", "Dispatch loop stopped");
}

async fn handle_link_event(ctx: &TransferContext, peer: &str, event: LinkEvent) {
    match event {
        LinkEvent::Message(Frame::Text(text)) => handle_control(ctx, peer, &text).await,
        LinkEvent::Message(Frame::Binary(data)) => receiver::handle_binary(ctx, peer, data).await,
        LinkEvent::ChannelOpen => {
            if let Some(state) = ctx.links.on_channel_open(peer).await {
                ctx.emit(TransferEvent::LinkState {
                    peer: peer.to_string(),
                    state,
                });
            }
        }
        LinkEvent::ChannelClosed => on_connection_state(ctx, peer, ConnectionState::Closed).await,
        LinkEvent::StateChanged(state) => on_connection_state(ctx, peer, state).await,
        LinkEvent::LocalCandidate(candidate) => {
            if let Err(e) = ctx.links.send_candidate(peer, candidate).await {
                debug!(event = "candidate_send_failure", peer, error = %e);
            }
        }
        LinkEvent::IceFailed => {
            if let Err(e) = ctx.links.on_ice_failed(peer).await {
                warn!(event = "ice_restart_failure", peer, error = %e, "ICE restart failed");
            }
        }
    }
}

async fn on_connection_state(ctx: &TransferContext, peer: &str, state: ConnectionState) {
    let Some(next) = ctx.links.on_connection_state(peer, state).await else {
        return;
    };
    ctx.emit(TransferEvent::LinkState {
        peer: peer.to_string(),
        state: next,
    });
    if next.cascades() {
        ctx.cascade_link_loss(peer, next).await;
    }
}

async fn handle_control(ctx: &TransferContext, peer: &str, text: &str) {
    let frame: ControlFrame = match serde_json::from_str(text) {
        Ok(frame) => frame,
        Err(e) => {
            debug!(event = "control_frame_ignored", peer, error = %e, "Ignoring unknown control frame");
            return;
        }
    };
    match frame {
        ControlFrame::FileInfo {
            transfer_id,
            file_name,
            file_size,
            total_chunks,
        } => {
            receiver::handle_file_info(ctx, peer, transfer_id, file_name, file_size, total_chunks)
                .await
        }
        ControlFrame::FileInfoAck { transfer_id } => {
            sender::handle_file_info_ack(ctx, &transfer_id).await
        }
        ControlFrame::FileChunk {
            transfer_id,
            chunk_index,
        } => receiver::handle_file_chunk(ctx, peer, transfer_id, chunk_index).await,
        ControlFrame::ChunkAck {
            transfer_id,
            received_count,
        } => sender::handle_chunk_ack(ctx, peer, &transfer_id, received_count).await,
        ControlFrame::TransferComplete { transfer_id } => {
            receiver::handle_transfer_complete(ctx, peer, &transfer_id).await
        }
    }
}
