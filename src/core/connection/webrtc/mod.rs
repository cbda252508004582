//! webrtc-rs backed [`PeerTransport`].
//!
//! One `RTCPeerConnection` and one ordered, reliable data channel per
//! peer. Local ICE candidates are trickled upward as they are gathered;
//! remote candidates that arrive before the remote description are queued
//! and applied once it is set.

mod control;
mod initializer;

use crate::core::config::{IceServerConfig, DATA_CHANNEL_LABEL};
use crate::core::connection::link::{Frame, LinkEventSender, PeerTransport, TransportFactory};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use control::{attach_dc_handlers, attach_pc_handlers, HandlerContext};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::debug;
use webrtc::api::API;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::peer_connection::offer_answer_options::RTCOfferOptions;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

// ── Factory ───────────────────────────────────────────────────────────────────

pub struct WebRtcFactory {
    api: API,
    ice_servers: Vec<IceServerConfig>,
}

impl WebRtcFactory {
    pub fn new(ice_servers: Vec<IceServerConfig>) -> Result<Self> {
        Ok(Self {
            api: initializer::create_webrtc_api()?,
            ice_servers,
        })
    }
}

#[async_trait]
impl TransportFactory for WebRtcFactory {
    async fn create(&self, peer: &str, events: LinkEventSender) -> Result<Arc<dyn PeerTransport>> {
        let pc = Arc::new(
            self.api
                .new_peer_connection(initializer::rtc_configuration(&self.ice_servers))
                .await
                .context("create peer connection")?,
        );
        let ctx = HandlerContext {
            peer: peer.to_string(),
            events,
            open: Arc::new(AtomicBool::new(false)),
            channel: Arc::new(RwLock::new(None)),
        };
        attach_pc_handlers(&pc, ctx.clone());
        Ok(Arc::new(WebRtcTransport {
            pc,
            ctx,
            remote_candidates: Mutex::new(RemoteCandidates::default()),
        }))
    }
}

// ── Transport ─────────────────────────────────────────────────────────────────

#[derive(Default)]
struct RemoteCandidates {
    remote_desc_set: bool,
    pending: Vec<RTCIceCandidateInit>,
}

pub struct WebRtcTransport {
    pc: Arc<RTCPeerConnection>,
    ctx: HandlerContext,
    remote_candidates: Mutex<RemoteCandidates>,
}

impl WebRtcTransport {
    async fn channel(&self) -> Result<Arc<RTCDataChannel>> {
        self.ctx
            .channel
            .read()
            .await
            .clone()
            .ok_or_else(|| anyhow!("no data channel to {}", self.ctx.peer))
    }

    async fn set_remote(&self, desc: RTCSessionDescription) -> Result<()> {
        self.pc
            .set_remote_description(desc)
            .await
            .context("set remote description")?;
        let pending = {
            let mut guard = self.remote_candidates.lock().await;
            guard.remote_desc_set = true;
            std::mem::take(&mut guard.pending)
        };
        for candidate in pending {
            self.pc.add_ice_candidate(candidate).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl PeerTransport for WebRtcTransport {
    async fn create_offer(&self, ice_restart: bool) -> Result<String> {
        {
            let mut channel = self.ctx.channel.write().await;
            if channel.is_none() {
                // Ordered + fully reliable: chunk frames depend on it.
                let dc = self
                    .pc
                    .create_data_channel(
                        DATA_CHANNEL_LABEL,
                        Some(RTCDataChannelInit {
                            ordered: Some(true),
                            ..Default::default()
                        }),
                    )
                    .await?;
                attach_dc_handlers(&dc, self.ctx.clone());
                *channel = Some(dc);
            }
        }

        let offer = self
            .pc
            .create_offer(Some(RTCOfferOptions {
                ice_restart,
                ..Default::default()
            }))
            .await?;
        let sdp = offer.sdp.clone();
        self.pc.set_local_description(offer).await?;
        Ok(sdp)
    }

    async fn accept_offer(&self, sdp: &str) -> Result<String> {
        self.set_remote(RTCSessionDescription::offer(sdp.to_string())?)
            .await?;
        let answer = self.pc.create_answer(None).await?;
        let sdp = answer.sdp.clone();
        self.pc.set_local_description(answer).await?;
        Ok(sdp)
    }

    async fn apply_answer(&self, sdp: &str) -> Result<()> {
        self.set_remote(RTCSessionDescription::answer(sdp.to_string())?)
            .await
    }

    async fn add_candidate(&self, candidate: serde_json::Value) -> Result<()> {
        let candidate: RTCIceCandidateInit =
            serde_json::from_value(candidate).context("decode remote candidate")?;
        let mut guard = self.remote_candidates.lock().await;
        if guard.remote_desc_set {
            drop(guard);
            self.pc.add_ice_candidate(candidate).await?;
        } else {
            debug!(event = "candidate_queued", peer = %self.ctx.peer, "Queueing early remote candidate");
            guard.pending.push(candidate);
        }
        Ok(())
    }

    async fn send(&self, frame: Frame) -> Result<()> {
        let dc = self.channel().await?;
        let state = dc.ready_state();
        if state != RTCDataChannelState::Open {
            return Err(anyhow!("Data channel not open: {:?}", state));
        }
        match frame {
            Frame::Text(text) => dc.send_text(text).await?,
            Frame::Binary(bytes) => dc.send(&bytes).await?,
        };
        Ok(())
    }

    async fn buffered_amount(&self) -> usize {
        match self.ctx.channel.read().await.as_ref() {
            Some(dc) => dc.buffered_amount().await as usize,
            None => 0,
        }
    }

    fn is_open(&self) -> bool {
        self.ctx.open.load(Ordering::Acquire)
    }

    async fn close(&self) -> Result<()> {
        self.ctx.open.store(false, Ordering::Release);
        if let Some(dc) = self.ctx.channel.write().await.take() {
            let _ = dc.close().await;
        }
        self.pc.close().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::connection::link::LinkEvent;
    use std::time::Duration;
    use tokio::sync::mpsc;
    use tokio::time::timeout;

    #[tokio::test]
    async fn test_offer_opens_channel_and_returns_sdp() {
        let factory = WebRtcFactory::new(Vec::new()).unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();
        let transport = factory.create("peer", tx).await.unwrap();

        let sdp = transport.create_offer(false).await.unwrap();
        assert!(sdp.contains("m=application"));
        assert!(!transport.is_open());
        assert_eq!(transport.buffered_amount().await, 0);
        assert!(transport.send(Frame::Text("x".into())).await.is_err());
        transport.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_early_candidate_is_queued() {
        let factory = WebRtcFactory::new(Vec::new()).unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();
        let transport = factory.create("peer", tx).await.unwrap();
        let candidate = serde_json::json!({
            "candidate": "candidate:1 1 udp 2130706431 127.0.0.1 50000 typ host",
            "sdpMid": "0",
            "sdpMLineIndex": 0
        });
        // No remote description yet: accepted without touching the ICE agent.
        transport.add_candidate(candidate).await.unwrap();
        transport.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_answerer_replies_the_moment_its_channel_opens() {
        let factory = WebRtcFactory::new(Vec::new()).unwrap();
        let (a_tx, mut a_rx) = mpsc::unbounded_channel();
        let (b_tx, mut b_rx) = mpsc::unbounded_channel();
        let a = factory.create("b", a_tx).await.unwrap();
        let b = factory.create("a", b_tx).await.unwrap();

        let offer = a.create_offer(false).await.unwrap();
        let answer = b.accept_offer(&offer).await.unwrap();
        a.apply_answer(&answer).await.unwrap();

        // Trickle candidates both ways; the answerer sends from inside its
        // `ChannelOpen` handling, before anything else runs.
        let reply = timeout(Duration::from_secs(10), async {
            loop {
                tokio::select! {
                    Some((_, ev)) = a_rx.recv() => match ev {
                        LinkEvent::LocalCandidate(c) => b.add_candidate(c).await.unwrap(),
                        LinkEvent::Message(frame) => return frame,
                        _ => {}
                    },
                    Some((_, ev)) = b_rx.recv() => match ev {
                        LinkEvent::LocalCandidate(c) => a.add_candidate(c).await.unwrap(),
                        LinkEvent::ChannelOpen => {
                            assert!(b.is_open());
                            b.send(Frame::Text("ready".into())).await.unwrap();
                        }
                        _ => {}
                    },
                }
            }
        })
        .await
        .expect("loopback link never carried the answerer's first frame");

        assert_eq!(reply, Frame::Text("ready".into()));
        a.close().await.unwrap();
        b.close().await.unwrap();
    }
}
