mod core;
mod utils;
mod workers;

use crate::utils::data_dir;
use crate::utils::log_buffer::FileLogLayer;
use crate::utils::sos::SignalOfStop;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;
use workers::args::Args;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let settings = Args::load()?;

    // webrtc_ice reports late STUN responses as "unknown TransactionID"
    // warnings; they are harmless.
    let filter = match settings.verbose {
        0 => "warn,linkdrop=info,webrtc_ice::agent=error",
        1 => "info,webrtc_ice::agent=error",
        2 => "debug,webrtc_ice::agent=error",
        _ => "trace",
    };

    // Full history goes to the file; stderr keeps stdout clean for results.
    let file_layer = FileLogLayer::new(&data_dir::log_path(&settings.data_dir))?;
    tracing_subscriber::registry()
        .with(EnvFilter::new(filter))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(file_layer)
        .init();

    let sos = SignalOfStop::new();
    let sos_clone = sos.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        sos_clone.cancel();
    });

    workers::app::run(settings, sos).await
}
