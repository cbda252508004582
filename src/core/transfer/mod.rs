//! Chunked file transfer over an open peer link.

pub mod chunk;
pub mod error;
pub(crate) mod receiver;
pub mod registry;
pub(crate) mod sender;
pub mod types;

use tokio::sync::mpsc;
use types::TransferEvent;

/// Forward `event` to the application layer; no-op when nobody listens.
#[inline]
pub fn notify_app(app_tx: &Option<mpsc::UnboundedSender<TransferEvent>>, event: TransferEvent) {
    if let Some(tx) = app_tx {
        let _ = tx.send(event);
    }
}
