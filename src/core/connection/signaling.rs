//! Signaling messages and the bridge they travel over.
//!
//! The bridge only ever carries negotiation traffic (offers, answers,
//! candidates) addressed by peer id. File data never touches it.

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

#[cfg(test)]
pub(crate) use hub::SignalHub;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum SignalPayload {
    RtcOffer { sdp: String },
    RtcAnswer { sdp: String },
    RtcCandidate { candidate: serde_json::Value },
}

/// `{type, to, ...}` as written to the relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundSignal {
    pub to: String,
    #[serde(flatten)]
    pub payload: SignalPayload,
}

/// `{type, from, ...}` as delivered by the relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundSignal {
    pub from: String,
    #[serde(flatten)]
    pub payload: SignalPayload,
}

/// Outbound half of a signaling channel. Inbound signals are delivered to
/// the handler through an `mpsc` receiver handed over at construction.
#[async_trait]
pub trait SignalingBridge: Send + Sync {
    async fn send(&self, signal: OutboundSignal) -> Result<()>;
}

pub type SignalReceiver = mpsc::UnboundedReceiver<InboundSignal>;

// ── In-process bridge ─────────────────────────────────────────────────────────

#[cfg(test)]
pub(crate) mod hub {
    use super::*;
    use anyhow::anyhow;
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};

    /// In-process stand-in for the relay: routes signals between members that
    /// joined the same hub.
    #[derive(Clone, Default)]
    pub struct SignalHub {
        routes: Arc<Mutex<HashMap<String, mpsc::UnboundedSender<InboundSignal>>>>,
    }

    impl SignalHub {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn join(&self, id: &str) -> (Arc<ChannelBridge>, SignalReceiver) {
            let (tx, rx) = mpsc::unbounded_channel();
            if let Ok(mut routes) = self.routes.lock() {
                routes.insert(id.to_string(), tx);
            }
            let bridge = Arc::new(ChannelBridge {
                local: id.to_string(),
                hub: self.clone(),
            });
            (bridge, rx)
        }
    }

    pub struct ChannelBridge {
        local: String,
        hub: SignalHub,
    }

    #[async_trait]
    impl SignalingBridge for ChannelBridge {
        async fn send(&self, signal: OutboundSignal) -> Result<()> {
            let route = self
                .hub
                .routes
                .lock()
                .map_err(|_| anyhow!("signal hub poisoned"))?
                .get(&signal.to)
                .cloned()
                .ok_or_else(|| anyhow!("unknown signaling target {}", signal.to))?;
            route
                .send(InboundSignal {
                    from: self.local.clone(),
                    payload: signal.payload,
                })
                .map_err(|_| anyhow!("signaling target {} went away", signal.to))
        }
    }
}
