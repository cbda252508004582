//! Transfer records, data-channel control frames and caller-facing events.

use crate::core::connection::link::NegotiationState;
use anyhow::{anyhow, bail, Context, Result};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

// ── Transfer record ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Outbound,
    Inbound,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferStatus {
    Pending,
    Transferring,
    Receiving,
    /// Receiver-side: `transfer-complete` arrived, chunks are being assembled.
    Finalizing,
    Completed,
    Error,
}

impl fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Transferring => "transferring",
            Self::Receiving => "receiving",
            Self::Finalizing => "finalizing",
            Self::Completed => "completed",
            Self::Error => "error",
        };
        f.write_str(s)
    }
}

/// Snapshot of one transfer as reported to the caller.
///
/// `acked_chunks` is meaningful for outbound transfers, `received_chunks`
/// for inbound ones. Chunk payloads never travel with the snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Transfer {
    pub id: String,
    pub peer: String,
    pub direction: Direction,
    pub file_name: String,
    pub file_size: u64,
    pub chunk_size: usize,
    pub total_chunks: u32,
    pub status: TransferStatus,
    pub progress: u8,
    pub acked_chunks: u32,
    pub received_chunks: u32,
}

impl Transfer {
    pub fn outbound(id: String, peer: String, file_name: String, file_size: u64) -> Self {
        Self::new(id, peer, Direction::Outbound, file_name, file_size, TransferStatus::Pending)
    }

    pub fn inbound(
        id: String,
        peer: String,
        file_name: String,
        file_size: u64,
        total_chunks: u32,
    ) -> Self {
        let mut t = Self::new(
            id,
            peer,
            Direction::Inbound,
            file_name,
            file_size,
            TransferStatus::Receiving,
        );
        // The announced count is authoritative for the receiver.
        t.total_chunks = total_chunks;
        t
    }

    fn new(
        id: String,
        peer: String,
        direction: Direction,
        file_name: String,
        file_size: u64,
        status: TransferStatus,
    ) -> Self {
        Self {
            id,
            peer,
            direction,
            file_name,
            file_size,
            chunk_size: crate::core::config::CHUNK_SIZE,
            total_chunks: super::chunk::total_chunks(file_size),
            status,
            progress: 0,
            acked_chunks: 0,
            received_chunks: 0,
        }
    }

    /// Chunks still outstanding on the receiving side.
    pub fn missing_chunks(&self) -> u32 {
        self.total_chunks.saturating_sub(self.received_chunks)
    }
}

// ── Outgoing file ─────────────────────────────────────────────────────────────

/// A file handed to the sender. Only its metadata is held here; chunks are
/// read from disk one at a time while streaming.
#[derive(Debug, Clone)]
pub struct OutgoingFile {
    pub name: String,
    pub path: PathBuf,
    pub size: u64,
}

impl OutgoingFile {
    /// Stat `path`, taking the announced name from its last component.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let meta = tokio::fs::metadata(&path)
            .await
            .with_context(|| format!("stat {}", path.display()))?;
        if !meta.is_file() {
            bail!("{} is not a regular file", path.display());
        }
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| anyhow!("{} has no file name", path.display()))?
            .to_string();
        Ok(Self {
            name,
            path,
            size: meta.len(),
        })
    }
}

// ── Data-channel control frames ───────────────────────────────────────────────

/// JSON text frames exchanged on the data channel.
///
/// A `file-chunk` frame is always immediately followed by exactly one
/// binary frame carrying that chunk's payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ControlFrame {
    #[serde(rename_all = "camelCase")]
    FileInfo {
        transfer_id: String,
        file_name: String,
        file_size: u64,
        total_chunks: u32,
    },
    #[serde(rename_all = "camelCase")]
    FileInfoAck { transfer_id: String },
    #[serde(rename_all = "camelCase")]
    FileChunk { transfer_id: String, chunk_index: u32 },
    #[serde(rename_all = "camelCase")]
    ChunkAck {
        transfer_id: String,
        received_count: u32,
    },
    #[serde(rename_all = "camelCase")]
    TransferComplete { transfer_id: String },
}

impl ControlFrame {
    pub fn transfer_id(&self) -> &str {
        match self {
            Self::FileInfo { transfer_id, .. }
            | Self::FileInfoAck { transfer_id }
            | Self::FileChunk { transfer_id, .. }
            | Self::ChunkAck { transfer_id, .. }
            | Self::TransferComplete { transfer_id } => transfer_id,
        }
    }
}

// ── Caller events ─────────────────────────────────────────────────────────────

/// Everything the handler reports to its owner (UI or CLI).
#[derive(Debug, Clone)]
pub enum TransferEvent {
    Progress(Transfer),
    Complete(Transfer),
    /// Terminal failure. The snapshot carries `TransferStatus::Error`.
    Error {
        transfer: Transfer,
        message: String,
    },
    /// A fully assembled inbound file, ready to be persisted.
    FileReceived {
        peer: String,
        file_name: String,
        content_type: String,
        bytes: Bytes,
    },
    LinkState {
        peer: String,
        state: NegotiationState,
    },
}
