//! Peer link capability: the narrow seam between transfer logic and the
//! concrete transport, plus the per-peer negotiation state machine.

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;

// ── Frames and events ─────────────────────────────────────────────────────────

/// One message on the ordered data channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Bytes),
}

/// Transport-level connection state as reported by the peer connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// Everything a transport reports upward. Delivered tagged with the peer id
/// through a [`LinkEventSender`].
#[derive(Debug, Clone)]
pub enum LinkEvent {
    ChannelOpen,
    ChannelClosed,
    Message(Frame),
    StateChanged(ConnectionState),
    /// A local ICE candidate (browser `RTCIceCandidateInit` JSON) to trickle.
    LocalCandidate(serde_json::Value),
    /// ICE-level failure; the link may still be rescued by an ICE restart.
    IceFailed,
}

pub type LinkEventSender = mpsc::UnboundedSender<(String, LinkEvent)>;
pub type LinkEventReceiver = mpsc::UnboundedReceiver<(String, LinkEvent)>;

// ── Transport seam ────────────────────────────────────────────────────────────

/// Direct, ordered, reliable channel to one remote peer.
///
/// Frames passed to `send` must be delivered in call order; the chunk
/// protocol pairs every `file-chunk` text frame with the binary frame
/// that follows it.
#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// Produce a local offer SDP. The first call also opens the data
    /// channel; `ice_restart` requests fresh ICE credentials.
    async fn create_offer(&self, ice_restart: bool) -> Result<String>;

    /// Apply a remote offer and return the local answer SDP.
    async fn accept_offer(&self, sdp: &str) -> Result<String>;

    async fn apply_answer(&self, sdp: &str) -> Result<()>;

    async fn add_candidate(&self, candidate: serde_json::Value) -> Result<()>;

    async fn send(&self, frame: Frame) -> Result<()>;

    /// Bytes queued on the channel but not yet handed to the network.
    async fn buffered_amount(&self) -> usize;

    fn is_open(&self) -> bool;

    async fn close(&self) -> Result<()>;
}

/// Builds one transport per remote peer.
#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn create(&self, peer: &str, events: LinkEventSender) -> Result<Arc<dyn PeerTransport>>;
}

// ── Negotiation state machine ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum NegotiationState {
    New,
    OfferSent,
    OfferReceived,
    AnswerExchanged,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationInput {
    LocalOffer,
    RemoteOffer,
    AnswerSent,
    RemoteAnswer,
    Transport(ConnectionState),
}

impl NegotiationState {
    /// `Failed` and `Closed` end the link; nothing leaves them.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Failed | Self::Closed)
    }

    /// An offer/answer exchange is in progress and the channel may still open.
    pub fn is_negotiating(self) -> bool {
        matches!(
            self,
            Self::New | Self::OfferSent | Self::OfferReceived | Self::AnswerExchanged
        )
    }

    /// States that cancel every transfer tied to the peer.
    pub fn cascades(self) -> bool {
        matches!(self, Self::Disconnected | Self::Failed | Self::Closed)
    }

    /// Next state for `input`, or `None` when the input is not valid here.
    pub fn apply(self, input: NegotiationInput) -> Option<Self> {
        use NegotiationInput as I;

        if self.is_terminal() {
            return None;
        }
        match (self, input) {
            // Initial offer, or a renegotiation for ICE restart.
            (_, I::LocalOffer) => Some(Self::OfferSent),
            (_, I::RemoteOffer) => Some(Self::OfferReceived),
            (Self::OfferReceived, I::AnswerSent) => Some(Self::AnswerExchanged),
            (Self::OfferSent, I::RemoteAnswer) => Some(Self::AnswerExchanged),
            (_, I::Transport(ConnectionState::Connected)) => Some(Self::Connected),
            (_, I::Transport(ConnectionState::Disconnected)) => Some(Self::Disconnected),
            (_, I::Transport(ConnectionState::Failed)) => Some(Self::Failed),
            (_, I::Transport(ConnectionState::Closed)) => Some(Self::Closed),
            _ => None,
        }
    }
}

impl fmt::Display for NegotiationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::New => "new",
            Self::OfferSent => "offer-sent",
            Self::OfferReceived => "offer-received",
            Self::AnswerExchanged => "answer-exchanged",
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
            Self::Failed => "failed",
            Self::Closed => "closed",
        };
        f.write_str(s)
    }
}

// ── In-memory transport for tests ─────────────────────────────────────────────

#[cfg(test)]
pub(crate) mod mock {
    use super::*;
    use anyhow::anyhow;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::{Mutex, Weak};

    /// Switchboard connecting mock endpoints keyed by `(local, remote)`.
    #[derive(Default)]
    pub struct MockNetwork {
        endpoints: Mutex<HashMap<(String, String), Arc<MockTransport>>>,
    }

    impl MockNetwork {
        pub fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        pub fn factory(self: &Arc<Self>, local: &str) -> Arc<MockFactory> {
            Arc::new(MockFactory {
                local: local.to_string(),
                network: self.clone(),
            })
        }

        pub fn endpoint(&self, local: &str, remote: &str) -> Option<Arc<MockTransport>> {
            self.endpoints
                .lock()
                .unwrap()
                .get(&(local.to_string(), remote.to_string()))
                .cloned()
        }

        /// Register an endpoint. Tests use this directly to play a raw peer.
        pub fn attach(
            self: &Arc<Self>,
            local: &str,
            remote: &str,
            events: LinkEventSender,
        ) -> Arc<MockTransport> {
            let t = Arc::new(MockTransport {
                local: local.to_string(),
                remote: remote.to_string(),
                events,
                open: AtomicBool::new(false),
                buffered: AtomicUsize::new(0),
                offers: AtomicUsize::new(0),
                sent: Mutex::new(Vec::new()),
                network: Arc::downgrade(self),
            });
            self.endpoints
                .lock()
                .unwrap()
                .insert((local.to_string(), remote.to_string()), t.clone());
            t
        }
    }

    pub struct MockFactory {
        local: String,
        network: Arc<MockNetwork>,
    }

    #[async_trait]
    impl TransportFactory for MockFactory {
        async fn create(
            &self,
            peer: &str,
            events: LinkEventSender,
        ) -> Result<Arc<dyn PeerTransport>> {
            Ok(self.network.attach(&self.local, peer, events))
        }
    }

    pub struct MockTransport {
        local: String,
        remote: String,
        events: LinkEventSender,
        open: AtomicBool,
        buffered: AtomicUsize,
        offers: AtomicUsize,
        sent: Mutex<Vec<Frame>>,
        network: Weak<MockNetwork>,
    }

    impl MockTransport {
        /// Mark the channel open and report it upward.
        pub fn open(&self) {
            self.open.store(true, Ordering::SeqCst);
            let _ = self.events.send((self.remote.clone(), LinkEvent::ChannelOpen));
            let _ = self.events.send((
                self.remote.clone(),
                LinkEvent::StateChanged(ConnectionState::Connected),
            ));
        }

        /// Simulate the transport dropping into `state`.
        pub fn drop_link(&self, state: ConnectionState) {
            self.open.store(false, Ordering::SeqCst);
            let _ = self
                .events
                .send((self.remote.clone(), LinkEvent::StateChanged(state)));
        }

        pub fn set_buffered(&self, amount: usize) {
            self.buffered.store(amount, Ordering::SeqCst);
        }

        pub fn offers_made(&self) -> usize {
            self.offers.load(Ordering::SeqCst)
        }

        pub fn sent_frames(&self) -> Vec<Frame> {
            self.sent.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl PeerTransport for MockTransport {
        async fn create_offer(&self, _ice_restart: bool) -> Result<String> {
            self.offers.fetch_add(1, Ordering::SeqCst);
            Ok(format!("mock-offer:{}", self.local))
        }

        async fn accept_offer(&self, _sdp: &str) -> Result<String> {
            self.open();
            Ok(format!("mock-answer:{}", self.local))
        }

        async fn apply_answer(&self, _sdp: &str) -> Result<()> {
            self.open();
            Ok(())
        }

        async fn add_candidate(&self, _candidate: serde_json::Value) -> Result<()> {
            Ok(())
        }

        async fn send(&self, frame: Frame) -> Result<()> {
            if !self.is_open() {
                return Err(anyhow!("mock channel {}->{} not open", self.local, self.remote));
            }
            self.sent.lock().unwrap().push(frame.clone());
            let peer = self
                .network
                .upgrade()
                .and_then(|n| n.endpoint(&self.remote, &self.local));
            if let Some(peer) = peer {
                let _ = peer
                    .events
                    .send((self.local.clone(), LinkEvent::Message(frame)));
            }
            Ok(())
        }

        async fn buffered_amount(&self) -> usize {
            self.buffered.load(Ordering::SeqCst)
        }

        fn is_open(&self) -> bool {
            self.open.load(Ordering::SeqCst)
        }

        async fn close(&self) -> Result<()> {
            self.open.store(false, Ordering::SeqCst);
            Ok(())
        }
    }
}
