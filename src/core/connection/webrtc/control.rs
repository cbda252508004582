//! Callback wiring: translates webrtc-rs callbacks into [`LinkEvent`]s.

use crate::core::connection::link::{ConnectionState, Frame, LinkEvent, LinkEventSender};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{error, info, warn};
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::RTCIceCandidate;
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::RTCPeerConnection;

// ── Handler context ───────────────────────────────────────────────────────────

/// Shared state captured by every callback of one peer connection.
#[derive(Clone)]
pub(crate) struct HandlerContext {
    pub peer: String,
    pub events: LinkEventSender,
    pub open: Arc<AtomicBool>,
    pub channel: Arc<RwLock<Option<Arc<RTCDataChannel>>>>,
}

impl HandlerContext {
    fn emit(&self, event: LinkEvent) {
        let _ = self.events.send((self.peer.clone(), event));
    }
}

fn map_pc_state(state: RTCPeerConnectionState) -> Option<ConnectionState> {
    match state {
        RTCPeerConnectionState::Connecting => Some(ConnectionState::Connecting),
        RTCPeerConnectionState::Connected => Some(ConnectionState::Connected),
        RTCPeerConnectionState::Disconnected => Some(ConnectionState::Disconnected),
        RTCPeerConnectionState::Failed => Some(ConnectionState::Failed),
        RTCPeerConnectionState::Closed => Some(ConnectionState::Closed),
        _ => None,
    }
}

// ── Peer connection ───────────────────────────────────────────────────────────

/// Attach connection-state, ICE and incoming-channel callbacks to `pc`.
pub(crate) fn attach_pc_handlers(pc: &Arc<RTCPeerConnection>, ctx: HandlerContext) {
    let c = ctx.clone();
    pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
        let c = c.clone();
        Box::pin(async move {
            let Some(candidate) = candidate else { return };
            match candidate.to_json().map(serde_json::to_value) {
                Ok(Ok(json)) => c.emit(LinkEvent::LocalCandidate(json)),
                Ok(Err(e)) => warn!(event = "candidate_encode_failure", peer = %c.peer, error = %e),
                Err(e) => warn!(event = "candidate_encode_failure", peer = %c.peer, error = %e),
            }
        })
    }));

    let c = ctx.clone();
    pc.on_peer_connection_state_change(Box::new(move |s| {
        let c = c.clone();
        Box::pin(async move {
            match s {
                RTCPeerConnectionState::Connected => {
                    info!(event = "webrtc_connected", peer = %c.peer, "WebRTC connection established");
                }
                RTCPeerConnectionState::Failed => {
                    error!(event = "webrtc_failed", peer = %c.peer, "WebRTC connection failed");
                }
                RTCPeerConnectionState::Disconnected => {
                    warn!(
                        event = "webrtc_disconnected",
                        peer = %c.peer,
                        "WebRTC transient disconnect (ICE may recover)"
                    );
                }
                _ => {}
            }
            if let Some(state) = map_pc_state(s) {
                c.emit(LinkEvent::StateChanged(state));
            }
        })
    }));

    let c = ctx.clone();
    pc.on_ice_connection_state_change(Box::new(move |s: RTCIceConnectionState| {
        let c = c.clone();
        Box::pin(async move {
            if s == RTCIceConnectionState::Failed {
                warn!(event = "ice_failed", peer = %c.peer, "ICE connection failed");
                c.emit(LinkEvent::IceFailed);
            }
        })
    }));

    // Answerer side: the offerer's channel arrives here.
    pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
        let ctx = ctx.clone();
        Box::pin(async move {
            info!(event = "dc_incoming", peer = %ctx.peer, channel = %dc.label(), "Remote data channel");
            // Stored first: a reply sent on `ChannelOpen` must find the channel.
            *ctx.channel.write().await = Some(dc.clone());
            attach_dc_handlers(&dc, ctx);
        })
    }));
}

// ── Data channel ──────────────────────────────────────────────────────────────

/// Attach `on_open`, `on_close`, `on_error`, and `on_message` callbacks to `dc`.
pub(crate) fn attach_dc_handlers(dc: &Arc<RTCDataChannel>, ctx: HandlerContext) {
    let c = ctx.clone();
    dc.on_open(Box::new(move || {
        let c = c.clone();
        Box::pin(async move {
            info!(event = "dc_open", peer = %c.peer, "DataChannel open");
            c.open.store(true, Ordering::Release);
            c.emit(LinkEvent::ChannelOpen);
        })
    }));

    let c = ctx.clone();
    dc.on_close(Box::new(move || {
        let c = c.clone();
        Box::pin(async move {
            warn!(event = "dc_closed", peer = %c.peer, "DataChannel closed by transport");
            c.open.store(false, Ordering::Release);
            c.emit(LinkEvent::ChannelClosed);
        })
    }));

    let c = ctx.clone();
    dc.on_error(Box::new(move |err| {
        let c = c.clone();
        Box::pin(async move {
            error!(event = "dc_error", peer = %c.peer, %err, "DataChannel transport error");
        })
    }));

    dc.on_message(Box::new(move |msg: DataChannelMessage| {
        let c = ctx.clone();
        Box::pin(async move {
            let frame = if msg.is_string {
                match String::from_utf8(msg.data.to_vec()) {
                    Ok(text) => Frame::Text(text),
                    Err(e) => {
                        warn!(event = "dc_invalid_text", peer = %c.peer, error = %e, "Dropping non-UTF-8 text frame");
                        return;
                    }
                }
            } else {
                Frame::Binary(msg.data)
            };
            c.emit(LinkEvent::Message(frame));
        })
    }));
}
