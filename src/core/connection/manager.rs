//! Peer link table and negotiation driver.
//!
//! One `PeerLink` per remote peer id. The manager owns every link: it
//! creates them on the first outbound or inbound negotiation message,
//! routes signaling to them and drops them on terminal failure.

use super::link::{
    ConnectionState, LinkEventSender, NegotiationInput, NegotiationState, PeerTransport,
    TransportFactory,
};
use super::signaling::{InboundSignal, OutboundSignal, SignalPayload, SignalingBridge};
use crate::core::transfer::error::TransferError;
use anyhow::Result;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::time::{timeout, Instant};
use tracing::{debug, info, warn};

struct PeerLink {
    transport: Arc<dyn PeerTransport>,
    state: NegotiationState,
    /// Whether this side sent the latest offer. Only the initiator restarts ICE.
    initiator: bool,
    open: watch::Sender<bool>,
    /// When the latest offer left or arrived.
    negotiated_at: Instant,
}

pub struct PeerLinkManager {
    links: RwLock<HashMap<String, PeerLink>>,
    /// Serializes link creation so concurrent sends to one peer share a link.
    create_lock: Mutex<()>,
    factory: Arc<dyn TransportFactory>,
    signaling: Arc<dyn SignalingBridge>,
    events: LinkEventSender,
    open_timeout: Duration,
}

impl PeerLinkManager {
    pub fn new(
        factory: Arc<dyn TransportFactory>,
        signaling: Arc<dyn SignalingBridge>,
        events: LinkEventSender,
        open_timeout: Duration,
    ) -> Self {
        Self {
            links: RwLock::new(HashMap::new()),
            create_lock: Mutex::new(()),
            factory,
            signaling,
            events,
            open_timeout,
        }
    }

    // ── Outbound ─────────────────────────────────────────────────────────

    /// Return an open transport to `peer`, negotiating one if needed.
    ///
    /// A link that is not open gets a fresh offer unless a negotiation is
    /// already under way and younger than the open timeout. Waiting for the
    /// channel is bounded by the open timeout.
    pub async fn ensure_link(&self, peer: &str) -> Result<Arc<dyn PeerTransport>, TransferError> {
        let mut open_rx = {
            let _guard = self.create_lock.lock().await;
            let existing = self.links.read().await.get(peer).map(|l| {
                (
                    l.transport.clone(),
                    l.open.subscribe(),
                    l.state,
                    l.negotiated_at.elapsed(),
                )
            });
            match existing {
                Some((transport, ..)) if transport.is_open() => return Ok(transport),
                Some((_, rx, state, age)) if state.is_negotiating() && age < self.open_timeout => rx,
                Some((transport, rx, state, _)) => {
                    info!(event = "link_reoffer", peer, state = %state, "Link not open, offering again");
                    self.reoffer(peer, &transport).await?;
                    rx
                }
                None => self.initiate(peer).await?,
            }
        };

        let waited = timeout(self.open_timeout, open_rx.wait_for(|open| *open))
            .await
            .map(|res| res.is_ok());
        match waited {
            Ok(true) => self.transport(peer).await.ok_or_else(|| {
                TransferError::LinkClosedDuringTransfer {
                    peer: peer.to_string(),
                    state: NegotiationState::Closed.to_string(),
                    missing: None,
                }
            }),
            // Sender dropped: the link was torn down while we waited.
            Ok(false) => Err(TransferError::LinkClosedDuringTransfer {
                peer: peer.to_string(),
                state: NegotiationState::Failed.to_string(),
                missing: None,
            }),
            Err(_) => {
                warn!(event = "link_open_timeout", peer, "Peer link did not open in time");
                Err(TransferError::LinkTimeout {
                    peer: peer.to_string(),
                    secs: self.open_timeout.as_secs(),
                })
            }
        }
    }

    /// Create a link, open its channel and send the offer.
    async fn initiate(&self, peer: &str) -> Result<watch::Receiver<bool>, TransferError> {
        let transport = self.factory.create(peer, self.events.clone()).await?;
        let (open_tx, open_rx) = watch::channel(false);
        self.links.write().await.insert(
            peer.to_string(),
            PeerLink {
                transport: transport.clone(),
                state: NegotiationState::New,
                initiator: true,
                open: open_tx,
                negotiated_at: Instant::now(),
            },
        );

        // The state moves before the offer leaves so a fast answer finds `OfferSent`.
        let offered = async {
            let sdp = transport.create_offer(false).await?;
            self.transition(peer, NegotiationInput::LocalOffer).await;
            self.signaling
                .send(OutboundSignal {
                    to: peer.to_string(),
                    payload: SignalPayload::RtcOffer { sdp },
                })
                .await
        }
        .await;

        if let Err(e) = offered {
            warn!(event = "offer_failure", peer, error = %e, "Failed to create or send offer");
            self.remove(peer).await;
            return Err(e.into());
        }
        info!(event = "offer_sent", peer, "Offer sent");
        Ok(open_rx)
    }

    /// Offer again on an existing link with fresh ICE credentials. This side
    /// becomes the initiator.
    async fn reoffer(&self, peer: &str, transport: &Arc<dyn PeerTransport>) -> Result<(), TransferError> {
        let sdp = transport.create_offer(true).await?;
        if let Some(link) = self.links.write().await.get_mut(peer) {
            link.initiator = true;
            link.negotiated_at = Instant::now();
        }
        self.transition(peer, NegotiationInput::LocalOffer).await;
        self.signaling
            .send(OutboundSignal {
                to: peer.to_string(),
                payload: SignalPayload::RtcOffer { sdp },
            })
            .await?;
        Ok(())
    }

    // ── Inbound signaling ────────────────────────────────────────────────

    pub async fn handle_signal(&self, signal: InboundSignal) -> Result<()> {
        let peer = signal.from.as_str();
        match signal.payload {
            SignalPayload::RtcOffer { sdp } => self.handle_offer(peer, &sdp).await,
            SignalPayload::RtcAnswer { sdp } => self.handle_answer(peer, &sdp).await,
            SignalPayload::RtcCandidate { candidate } => {
                match self.transport(peer).await {
                    Some(t) => t.add_candidate(candidate).await?,
                    None => debug!(event = "candidate_without_link", peer, "Dropping candidate"),
                }
                Ok(())
            }
        }
    }

    async fn handle_offer(&self, peer: &str, sdp: &str) -> Result<()> {
        let transport = {
            let _guard = self.create_lock.lock().await;
            let existing = self.links.write().await.get_mut(peer).map(|l| {
                l.negotiated_at = Instant::now();
                l.transport.clone()
            });
            match existing {
                Some(t) => t,
                None => {
                    let transport = self.factory.create(peer, self.events.clone()).await?;
                    let (open_tx, _) = watch::channel(false);
                    self.links.write().await.insert(
                        peer.to_string(),
                        PeerLink {
                            transport: transport.clone(),
                            state: NegotiationState::New,
                            initiator: false,
                            open: open_tx,
                            negotiated_at: Instant::now(),
                        },
                    );
                    transport
                }
            }
        };
        self.transition(peer, NegotiationInput::RemoteOffer).await;

        let answer = transport.accept_offer(sdp).await?;
        self.signaling
            .send(OutboundSignal {
                to: peer.to_string(),
                payload: SignalPayload::RtcAnswer { sdp: answer },
            })
            .await?;
        self.transition(peer, NegotiationInput::AnswerSent).await;
        info!(event = "answer_sent", peer, "Answer sent");
        Ok(())
    }

    async fn handle_answer(&self, peer: &str, sdp: &str) -> Result<()> {
        let transport = {
            let links = self.links.read().await;
            match links.get(peer) {
                Some(l) if l.state == NegotiationState::OfferSent => l.transport.clone(),
                Some(l) => {
                    warn!(event = "unexpected_answer", peer, state = %l.state, "Ignoring answer");
                    return Ok(());
                }
                None => {
                    warn!(event = "answer_without_link", peer, "Ignoring answer for unknown peer");
                    return Ok(());
                }
            }
        };
        transport.apply_answer(sdp).await?;
        self.transition(peer, NegotiationInput::RemoteAnswer).await;
        Ok(())
    }

    // ── Transport events ─────────────────────────────────────────────────

    pub async fn send_candidate(&self, peer: &str, candidate: serde_json::Value) -> Result<()> {
        self.signaling
            .send(OutboundSignal {
                to: peer.to_string(),
                payload: SignalPayload::RtcCandidate { candidate },
            })
            .await
    }

    /// Data channel became usable. Returns the new state if it changed.
    pub async fn on_channel_open(&self, peer: &str) -> Option<NegotiationState> {
        if let Some(link) = self.links.read().await.get(peer) {
            link.open.send_replace(true);
        }
        self.transition(peer, NegotiationInput::Transport(ConnectionState::Connected))
            .await
    }

    /// Apply a transport state change. Terminal states remove the link.
    pub async fn on_connection_state(
        &self,
        peer: &str,
        state: ConnectionState,
    ) -> Option<NegotiationState> {
        if let Some(link) = self.links.read().await.get(peer) {
            // A recovered connection counts as open only if its channel survived.
            link.open
                .send_replace(state == ConnectionState::Connected && link.transport.is_open());
        }
        let next = self
            .transition(peer, NegotiationInput::Transport(state))
            .await?;
        if next.is_terminal() {
            self.remove(peer).await;
        }
        Some(next)
    }

    /// ICE gave up. The initiator renegotiates with fresh credentials.
    pub async fn on_ice_failed(&self, peer: &str) -> Result<()> {
        let transport = match self.links.read().await.get(peer) {
            Some(l) if l.initiator => l.transport.clone(),
            _ => return Ok(()),
        };
        info!(event = "ice_restart", peer, "ICE failed, restarting");
        self.reoffer(peer, &transport).await?;
        Ok(())
    }

    // ── Lookup / teardown ────────────────────────────────────────────────

    pub async fn transport(&self, peer: &str) -> Option<Arc<dyn PeerTransport>> {
        self.links
            .read()
            .await
            .get(peer)
            .map(|l| l.transport.clone())
    }

    #[cfg(test)]
    pub async fn state(&self, peer: &str) -> Option<NegotiationState> {
        self.links.read().await.get(peer).map(|l| l.state)
    }

    async fn transition(
        &self,
        peer: &str,
        input: NegotiationInput,
    ) -> Option<NegotiationState> {
        let mut links = self.links.write().await;
        let link = links.get_mut(peer)?;
        match link.state.apply(input) {
            Some(next) if next != link.state => {
                debug!(event = "link_state", peer, from = %link.state, to = %next, "Link state change");
                link.state = next;
                Some(next)
            }
            Some(_) => None,
            None => {
                debug!(event = "link_input_ignored", peer, state = %link.state, ?input, "Ignored link input");
                None
            }
        }
    }

    async fn remove(&self, peer: &str) {
        let removed = self.links.write().await.remove(peer);
        if let Some(link) = removed {
            if let Err(e) = link.transport.close().await {
                debug!(event = "link_close_failure", peer, error = %e, "Closing transport failed");
            }
        }
    }

    /// Close every transport and forget every link.
    pub async fn close_all(&self) {
        let links: Vec<(String, PeerLink)> = self.links.write().await.drain().collect();
        for (peer, link) in links {
            if let Err(e) = link.transport.close().await {
                debug!(event = "link_close_failure", peer = %peer, error = %e, "Closing transport failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::connection::link::mock::MockNetwork;
    use crate::core::connection::link::{LinkEvent, LinkEventReceiver};
    use crate::core::connection::signaling::{SignalHub, SignalReceiver};
    use tokio::sync::mpsc;

    const OPEN_TIMEOUT: Duration = Duration::from_secs(15);

    fn manager(
        hub: &SignalHub,
        net: &Arc<MockNetwork>,
        id: &str,
    ) -> (Arc<PeerLinkManager>, SignalReceiver, LinkEventReceiver) {
        let (bridge, signals) = hub.join(id);
        let (tx, rx) = mpsc::unbounded_channel();
        let mgr = Arc::new(PeerLinkManager::new(
            net.factory(id),
            bridge,
            tx,
            OPEN_TIMEOUT,
        ));
        (mgr, signals, rx)
    }

    /// Drive a manager the way the handler's dispatch loop does.
    fn pump(mgr: Arc<PeerLinkManager>, mut signals: SignalReceiver, mut events: LinkEventReceiver) {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    Some(sig) = signals.recv() => { let _ = mgr.handle_signal(sig).await; }
                    Some((peer, ev)) = events.recv() => match ev {
                        LinkEvent::ChannelOpen => { mgr.on_channel_open(&peer).await; }
                        LinkEvent::StateChanged(s) => { mgr.on_connection_state(&peer, s).await; }
                        _ => {}
                    },
                    else => break,
                }
            }
        });
    }

    #[tokio::test]
    async fn test_negotiation_opens_both_sides() {
        let hub = SignalHub::new();
        let net = MockNetwork::new();
        let (a, a_sig, a_ev) = manager(&hub, &net, "a");
        let (b, b_sig, b_ev) = manager(&hub, &net, "b");
        pump(a.clone(), a_sig, a_ev);
        pump(b.clone(), b_sig, b_ev);

        let t = a.ensure_link("b").await.unwrap();
        assert!(t.is_open());

        // Second call reuses the open link.
        a.ensure_link("b").await.unwrap();
        assert_eq!(net.endpoint("a", "b").unwrap().offers_made(), 1);

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(a.state("b").await, Some(NegotiationState::Connected));
        assert_eq!(b.state("a").await, Some(NegotiationState::Connected));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unanswered_offer_times_out() {
        let hub = SignalHub::new();
        let net = MockNetwork::new();
        let (a, a_sig, a_ev) = manager(&hub, &net, "a");
        // "silent" joins the hub but never answers.
        let (_silent, _silent_rx) = hub.join("silent");
        pump(a.clone(), a_sig, a_ev);

        let err = a.ensure_link("silent").await.err().unwrap();
        assert_eq!(
            err,
            TransferError::LinkTimeout {
                peer: "silent".into(),
                secs: 15
            }
        );
    }

    #[tokio::test]
    async fn test_offer_to_unknown_target_fails_fast() {
        let hub = SignalHub::new();
        let net = MockNetwork::new();
        let (a, _a_sig, _a_ev) = manager(&hub, &net, "a");
        let err = a.ensure_link("nobody").await.err().unwrap();
        assert!(matches!(err, TransferError::Transport(_)));
        assert!(a.transport("nobody").await.is_none());
    }

    #[tokio::test]
    async fn test_stray_answer_is_ignored() {
        let hub = SignalHub::new();
        let net = MockNetwork::new();
        let (b, _b_sig, _b_ev) = manager(&hub, &net, "b");
        b.handle_signal(InboundSignal {
            from: "a".into(),
            payload: SignalPayload::RtcAnswer { sdp: "x".into() },
        })
        .await
        .unwrap();
        assert!(b.state("a").await.is_none());
    }

    #[tokio::test]
    async fn test_terminal_state_removes_link() {
        let hub = SignalHub::new();
        let net = MockNetwork::new();
        let (a, a_sig, a_ev) = manager(&hub, &net, "a");
        let (b, b_sig, b_ev) = manager(&hub, &net, "b");
        pump(a.clone(), a_sig, a_ev);
        pump(b.clone(), b_sig, b_ev);
        a.ensure_link("b").await.unwrap();

        assert_eq!(
            a.on_connection_state("b", ConnectionState::Disconnected).await,
            Some(NegotiationState::Disconnected)
        );
        assert!(a.transport("b").await.is_some());

        assert_eq!(
            a.on_connection_state("b", ConnectionState::Closed).await,
            Some(NegotiationState::Closed)
        );
        assert!(a.transport("b").await.is_none());
    }

    #[tokio::test]
    async fn test_ice_failure_restarts_from_initiator_only() {
        let hub = SignalHub::new();
        let net = MockNetwork::new();
        let (a, a_sig, a_ev) = manager(&hub, &net, "a");
        let (b, b_sig, b_ev) = manager(&hub, &net, "b");
        pump(a.clone(), a_sig, a_ev);
        pump(b.clone(), b_sig, b_ev);
        a.ensure_link("b").await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        b.on_ice_failed("a").await.unwrap();
        assert_eq!(net.endpoint("b", "a").unwrap().offers_made(), 0);

        a.on_ice_failed("b").await.unwrap();
        assert_eq!(net.endpoint("a", "b").unwrap().offers_made(), 2);
    }

    #[tokio::test]
    async fn test_disconnected_link_is_offered_again() {
        let hub = SignalHub::new();
        let net = MockNetwork::new();
        let (a, a_sig, a_ev) = manager(&hub, &net, "a");
        let (b, b_sig, b_ev) = manager(&hub, &net, "b");
        pump(a.clone(), a_sig, a_ev);
        pump(b.clone(), b_sig, b_ev);
        a.ensure_link("b").await.unwrap();

        let link = net.endpoint("a", "b").unwrap();
        link.drop_link(ConnectionState::Disconnected);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(a.state("b").await, Some(NegotiationState::Disconnected));

        let t = a.ensure_link("b").await.unwrap();
        assert!(t.is_open());
        assert_eq!(link.offers_made(), 2);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(a.state("b").await, Some(NegotiationState::Connected));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_negotiation_is_offered_again() {
        let hub = SignalHub::new();
        let net = MockNetwork::new();
        let (a, a_sig, a_ev) = manager(&hub, &net, "a");
        let (_silent, _silent_rx) = hub.join("silent");
        pump(a.clone(), a_sig, a_ev);

        assert!(a.ensure_link("silent").await.is_err());
        assert_eq!(a.state("silent").await, Some(NegotiationState::OfferSent));

        // The first offer is older than the open timeout now.
        assert!(a.ensure_link("silent").await.is_err());
        assert_eq!(net.endpoint("a", "silent").unwrap().offers_made(), 2);
    }
}
