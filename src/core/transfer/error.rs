//! Transfer failure taxonomy.
//!
//! Every variant reaches the caller exactly once per transfer as
//! `TransferEvent::Error`; the only failure that is swallowed is the
//! best-effort `file-info-ack` wait.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransferError {
    #[error("link to {peer} did not open within {secs}s")]
    LinkTimeout { peer: String, secs: u64 },

    #[error("connection to {peer} lost ({state}){}", missing_note(.missing))]
    LinkClosedDuringTransfer {
        peer: String,
        state: String,
        missing: Option<u32>,
    },

    #[error("transfer timed out: no acknowledgment progress for {secs}s")]
    TransferTimeout { secs: u64 },

    #[error("chunk count mismatch: missing {missing} chunks ({received}/{total} received)")]
    ChunkCountMismatch {
        missing: u32,
        received: u32,
        total: u32,
    },

    #[error("missing chunk {index}")]
    MissingChunk { index: u32 },

    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("cannot read source file: {0}")]
    SourceRead(String),

    #[error("transport error: {0}")]
    Transport(String),
}

fn missing_note(missing: &Option<u32>) -> String {
    match missing {
        Some(n) => format!(", missing {n} chunks"),
        None => String::new(),
    }
}

impl From<anyhow::Error> for TransferError {
    fn from(e: anyhow::Error) -> Self {
        Self::Transport(format!("{e:#}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_link_loss_names_missing_chunks() {
        let e = TransferError::LinkClosedDuringTransfer {
            peer: "bob".into(),
            state: "closed".into(),
            missing: Some(10),
        };
        assert_eq!(e.to_string(), "connection to bob lost (closed), missing 10 chunks");
    }

    #[test]
    fn test_link_loss_without_count() {
        let e = TransferError::LinkClosedDuringTransfer {
            peer: "bob".into(),
            state: "failed".into(),
            missing: None,
        };
        assert_eq!(e.to_string(), "connection to bob lost (failed)");
    }

    #[test]
    fn test_timeout_message() {
        let e = TransferError::TransferTimeout { secs: 30 };
        assert!(e.to_string().contains("timed out"));
    }
}
