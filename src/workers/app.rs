//! CLI command runner: wires the relay, the WebRTC factory and one
//! `TransferHandler` together for a single `send`, `receive` or `devices`
//! invocation.

use crate::core::config::{TransferConfig, DEVICE_LIST_TIMEOUT};
use crate::core::connection::relay::{DeviceInfo, RelayClient, RelayEvent, RelaySession};
use crate::core::connection::signaling::SignalReceiver;
use crate::core::connection::webrtc::WebRtcFactory;
use crate::core::engine::TransferHandler;
use crate::core::transfer::types::{OutgoingFile, Transfer, TransferEvent, TransferStatus};
use crate::utils::formatters::{format_file_size, short_id};
use crate::utils::sos::SignalOfStop;
use crate::workers::args::{Command, Settings};
use crate::workers::download::save_received;
use anyhow::{anyhow, bail, Result};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{info, warn};

pub async fn run(settings: Settings, sos: SignalOfStop) -> Result<()> {
    let device = DeviceInfo::local(settings.name.clone());
    let session = RelayClient::connect(&settings.relay, device).await?;
    info!(
        event = "device_registered",
        id = %session.client.device().id,
        name = %session.client.device().name,
        "Registered with relay"
    );

    match settings.command.clone() {
        Command::Devices => list_devices(session).await,
        Command::Send { file, to } => send(&settings, session, &file, &to, sos).await,
        Command::Receive { out, once } => receive(&settings, session, &out, once, sos).await,
    }
}

/// Match `to` against a device id first, then a case-insensitive name.
pub fn resolve_target<'a>(devices: &'a [DeviceInfo], to: &str) -> Option<&'a DeviceInfo> {
    devices
        .iter()
        .find(|d| d.id == to)
        .or_else(|| devices.iter().find(|d| d.name.eq_ignore_ascii_case(to)))
}

async fn first_device_list(
    events: &mut mpsc::UnboundedReceiver<RelayEvent>,
) -> Result<Vec<DeviceInfo>> {
    let wait = async {
        while let Some(event) = events.recv().await {
            match event {
                RelayEvent::Devices(devices) => return Ok(devices),
                RelayEvent::SelfIdentity { name } => {
                    info!(event = "relay_identity", name = %name, "Relay assigned name");
                }
                RelayEvent::Disconnected => break,
            }
        }
        Err(anyhow!("relay closed before listing devices"))
    };
    timeout(DEVICE_LIST_TIMEOUT, wait)
        .await
        .map_err(|_| anyhow!("relay sent no device list within {:?}", DEVICE_LIST_TIMEOUT))?
}

fn handler_for(
    settings: &Settings,
    client: Arc<RelayClient>,
    signals: SignalReceiver,
) -> Result<(TransferHandler, mpsc::UnboundedReceiver<TransferEvent>)> {
    let factory = Arc::new(WebRtcFactory::new(settings.ice_servers.clone())?);
    let (app_tx, app_rx) = mpsc::unbounded_channel();
    let handler = TransferHandler::new(
        client,
        signals,
        factory,
        TransferConfig::default(),
        Some(app_tx),
    );
    Ok((handler, app_rx))
}

fn print_progress(t: &Transfer) {
    match t.status {
        TransferStatus::Pending => println!("  waiting for {} ...", short_id(&t.peer)),
        TransferStatus::Finalizing => println!("  {} assembling ...", t.file_name),
        _ => println!(
            "  {} {:>3}% of {}",
            t.file_name,
            t.progress,
            format_file_size(t.file_size)
        ),
    }
}

// ── devices ───────────────────────────────────────────────────────────────────

async fn list_devices(mut session: RelaySession) -> Result<()> {
    let devices = first_device_list(&mut session.events).await?;
    if devices.is_empty() {
        println!("No other devices in the room.");
    }
    for d in devices {
        println!("{}  {:<24} {}", short_id(&d.id), d.name, d.kind);
    }
    Ok(())
}

// ── send ──────────────────────────────────────────────────────────────────────

async fn send(
    settings: &Settings,
    mut session: RelaySession,
    path: &Path,
    to: &str,
    sos: SignalOfStop,
) -> Result<()> {
    let file = OutgoingFile::open(path).await?;

    let devices = first_device_list(&mut session.events).await?;
    let target = resolve_target(&devices, to)
        .ok_or_else(|| anyhow!("no device named or with id {to:?} in the room"))?
        .clone();

    println!(
        "Sending {} ({}) to {}",
        file.name,
        format_file_size(file.size),
        target.name
    );

    let (handler, mut app_rx) = handler_for(settings, session.client.clone(), session.signals)?;
    let printer = tokio::spawn(async move {
        while let Some(event) = app_rx.recv().await {
            if let TransferEvent::Progress(t) = event {
                print_progress(&t);
            }
        }
    });

    let outcome = tokio::select! {
        res = handler.send_file(file, &target.id, None) => Some(res),
        _ = sos.wait() => None,
    };
    handler.cleanup().await;
    printer.abort();

    match outcome {
        Some(Ok(t)) => {
            println!("Sent {} to {}", t.file_name, target.name);
            Ok(())
        }
        Some(Err(e)) => bail!("transfer failed: {e}"),
        None => bail!("interrupted"),
    }
}

// ── receive ───────────────────────────────────────────────────────────────────

async fn receive(
    settings: &Settings,
    session: RelaySession,
    out: &Path,
    once: bool,
    sos: SignalOfStop,
) -> Result<()> {
    let RelaySession {
        client,
        signals,
        mut events,
    } = session;
    println!(
        "Waiting for files as {} ({}), saving to {}",
        client.device().name,
        short_id(&client.device().id),
        out.display()
    );

    let (handler, mut app_rx) = handler_for(settings, client, signals)?;
    let result = loop {
        tokio::select! {
            _ = sos.wait() => break Ok(()),
            Some(event) = events.recv() => match event {
                RelayEvent::Devices(devices) => {
                    info!(event = "room_update", devices = devices.len(), "Room membership changed");
                }
                RelayEvent::SelfIdentity { name } => println!("Relay calls this device {name}"),
                RelayEvent::Disconnected => break Err(anyhow!("relay connection lost")),
            },
            Some(event) = app_rx.recv() => match event {
                TransferEvent::Progress(t) => print_progress(&t),
                TransferEvent::Complete(_) => {}
                TransferEvent::Error { transfer, message } => {
                    println!("  {} failed: {message}", transfer.file_name);
                }
                TransferEvent::LinkState { peer, state } => {
                    info!(event = "link_state", peer = %peer, state = %state);
                }
                TransferEvent::FileReceived { peer, file_name, content_type, bytes } => {
                    match save_received(out, &file_name, &bytes).await {
                        Ok(path) => println!(
                            "Received {} ({}, {}) from {} -> {}",
                            file_name,
                            format_file_size(bytes.len() as u64),
                            content_type,
                            short_id(&peer),
                            path.display()
                        ),
                        Err(e) => warn!(event = "save_failure", file = %file_name, error = %e, "Could not save file"),
                    }
                    if once {
                        break Ok(());
                    }
                }
            },
        }
    };
    handler.cleanup().await;
    result
}
