//! WebSocket relay client.
//!
//! The relay registers this device, announces room membership and forwards
//! `rtc-*` negotiation messages between devices. Everything else it sends is
//! ignored here.

use super::signaling::{InboundSignal, OutboundSignal, SignalReceiver, SignalingBridge};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

/// A device as listed by the relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
}

impl DeviceInfo {
    /// Describe the local host with a fresh id.
    pub fn local(name: Option<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.unwrap_or_else(|| std::env::consts::OS.to_string()),
            kind: detect_device_type(),
        }
    }
}

/// Device category shown to other room members.
pub fn detect_device_type() -> String {
    device_type_for_os(std::env::consts::OS).to_string()
}

fn device_type_for_os(os: &str) -> &'static str {
    match os {
        "android" => "Android Mobile",
        "ios" => "iPhone",
        "macos" => "Mac",
        "windows" => "Windows Desktop",
        "linux" | "freebsd" | "openbsd" | "netbsd" => "Linux Desktop",
        _ => "Unknown Device",
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayEvent {
    /// Name the relay assigned to this device.
    SelfIdentity { name: String },
    /// Current room membership, this device excluded.
    Devices(Vec<DeviceInfo>),
    Disconnected,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
enum ClientMessage<'a> {
    Register { device: &'a DeviceInfo },
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
enum ServerMessage {
    SelfIdentity { name: String },
    Devices { devices: Vec<DeviceInfo> },
}

#[derive(Debug, PartialEq)]
pub(crate) enum RelayInbound {
    Signal(InboundSignal),
    Event(RelayEvent),
}

/// Classify one text frame from the relay. Unknown or malformed messages
/// yield `None`.
pub(crate) fn parse_relay_message(text: &str) -> Option<RelayInbound> {
    let value: serde_json::Value = serde_json::from_str(text).ok()?;
    let kind = value.get("type")?.as_str()?;
    if kind.starts_with("rtc-") {
        return serde_json::from_value::<InboundSignal>(value)
            .ok()
            .map(RelayInbound::Signal);
    }
    match serde_json::from_value::<ServerMessage>(value).ok()? {
        ServerMessage::SelfIdentity { name } => {
            Some(RelayInbound::Event(RelayEvent::SelfIdentity { name }))
        }
        ServerMessage::Devices { devices } => Some(RelayInbound::Event(RelayEvent::Devices(devices))),
    }
}

/// Handles returned by [`RelayClient::connect`].
pub struct RelaySession {
    pub client: Arc<RelayClient>,
    pub signals: SignalReceiver,
    pub events: mpsc::UnboundedReceiver<RelayEvent>,
}

pub struct RelayClient {
    device: DeviceInfo,
    outbound: mpsc::UnboundedSender<String>,
}

impl RelayClient {
    pub async fn connect(url: &str, device: DeviceInfo) -> Result<RelaySession> {
        let (ws_stream, _) = connect_async(url)
            .await
            .with_context(|| format!("connect relay websocket {url}"))?;
        let (mut ws_write, mut ws_read) = ws_stream.split();
        info!(event = "relay_connected", url, device = %device.id, "Connected to relay");

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        out_tx
            .send(serde_json::to_string(&ClientMessage::Register { device: &device })?)
            .map_err(|_| anyhow!("relay writer closed before register"))?;

        tokio::spawn(async move {
            while let Some(text) = out_rx.recv().await {
                if let Err(e) = ws_write.send(Message::Text(text)).await {
                    warn!(event = "relay_write_failure", error = %e, "Relay write failed");
                    break;
                }
            }
            let _ = ws_write.close().await;
        });

        tokio::spawn(async move {
            while let Some(msg) = ws_read.next().await {
                let text = match msg {
                    Ok(Message::Text(text)) => text,
                    Ok(Message::Close(_)) => break,
                    Ok(_) => continue,
                    Err(e) => {
                        warn!(event = "relay_read_failure", error = %e, "Relay read failed");
                        break;
                    }
                };
                match parse_relay_message(&text) {
                    Some(RelayInbound::Signal(sig)) => {
                        let _ = signal_tx.send(sig);
                    }
                    Some(RelayInbound::Event(ev)) => {
                        let _ = event_tx.send(ev);
                    }
                    None => debug!(event = "relay_message_ignored", "Ignoring relay message"),
                }
            }
            info!(event = "relay_disconnected", "Relay connection ended");
            let _ = event_tx.send(RelayEvent::Disconnected);
        });

        Ok(RelaySession {
            client: Arc::new(Self {
                device,
                outbound: out_tx,
            }),
            signals: signal_rx,
            events: event_rx,
        })
    }

    pub fn device(&self) -> &DeviceInfo {
        &self.device
    }
}

#[async_trait]
impl SignalingBridge for RelayClient {
    async fn send(&self, signal: OutboundSignal) -> Result<()> {
        let text = serde_json::to_string(&signal)?;
        self.outbound
            .send(text)
            .map_err(|_| anyhow!("relay connection closed"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::connection::signaling::SignalPayload;

    #[test]
    fn test_register_shape() {
        let device = DeviceInfo {
            id: "d1".into(),
            name: "Linux".into(),
            kind: "Linux Desktop".into(),
        };
        let v = serde_json::to_value(ClientMessage::Register { device: &device }).unwrap();
        assert_eq!(v["type"], "register");
        assert_eq!(v["device"]["type"], "Linux Desktop");
        assert_eq!(v["device"]["id"], "d1");
    }

    #[test]
    fn test_parse_devices() {
        let parsed = parse_relay_message(
            r#"{"type":"devices","devices":[{"id":"x","name":"Brave Fox","type":"Mac"}]}"#,
        );
        assert_eq!(
            parsed,
            Some(RelayInbound::Event(RelayEvent::Devices(vec![DeviceInfo {
                id: "x".into(),
                name: "Brave Fox".into(),
                kind: "Mac".into(),
            }])))
        );
    }

    #[test]
    fn test_parse_self_identity() {
        assert_eq!(
            parse_relay_message(r#"{"type":"self-identity","name":"Calm Otter"}"#),
            Some(RelayInbound::Event(RelayEvent::SelfIdentity {
                name: "Calm Otter".into()
            }))
        );
    }

    #[test]
    fn test_parse_offer_signal() {
        match parse_relay_message(r#"{"type":"rtc-offer","from":"p9","sdp":"v=0"}"#) {
            Some(RelayInbound::Signal(sig)) => {
                assert_eq!(sig.from, "p9");
                assert_eq!(sig.payload, SignalPayload::RtcOffer { sdp: "v=0".into() });
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_unknown_and_garbage_ignored() {
        assert_eq!(parse_relay_message(r#"{"type":"transfer-progress"}"#), None);
        assert_eq!(parse_relay_message("not json"), None);
        assert_eq!(parse_relay_message(r#"{"type":"rtc-offer"}"#), None);
    }

    #[test]
    fn test_device_types() {
        assert_eq!(device_type_for_os("macos"), "Mac");
        assert_eq!(device_type_for_os("linux"), "Linux Desktop");
        assert_eq!(device_type_for_os("haiku"), "Unknown Device");
    }
}
