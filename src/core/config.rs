//! Centralized configuration constants for LinkDrop.
//!
//! All protocol and tuning parameters live here so they can be reviewed and
//! adjusted in a single place. Wire-format types stay in their respective
//! modules; runtime-overridable tunables are grouped in [`TransferConfig`].

use serde::{Deserialize, Serialize};
use std::time::Duration;

// ── Transfer / Chunking ──────────────────────────────────────────────────────

/// Fixed chunk size in bytes (16 KB).
///
/// Part of the wire contract: `totalChunks` announced in `file-info` is
/// always `ceil(fileSize / CHUNK_SIZE)`. Browsers interoperate reliably with
/// 16 KB SCTP messages, so this is not raised.
pub const CHUNK_SIZE: usize = 16 * 1024;

/// Number of chunks sent back-to-back before yielding to the runtime.
pub const SEND_BATCH_SIZE: usize = 10;

/// High water mark for the data channel send buffer (bytes).
/// When `buffered_amount` exceeds this value the sender suspends.
pub const DC_BUFFERED_AMOUNT_HIGH: usize = 8 * 1024 * 1024;

/// Once suspended, sending resumes only after the buffer drops below this.
pub const DC_BUFFERED_AMOUNT_LOW: usize = 1024 * 1024;

/// Interval between `buffered_amount` polls while suspended.
pub const BUFFER_POLL_INTERVAL: Duration = Duration::from_millis(100);

// ── Acknowledgments ──────────────────────────────────────────────────────────

/// Transfers with fewer chunks than this are acknowledged chunk by chunk.
pub const ACK_EVERY_CHUNK_BELOW: u32 = 50;

/// Larger transfers are acknowledged every `ACK_INTERVAL` received chunks
/// (and always on the final chunk).
pub const ACK_INTERVAL: u32 = 5;

// ── Timeouts ─────────────────────────────────────────────────────────────────

/// Upper bound on waiting for a peer link's data channel to open.
pub const LINK_OPEN_TIMEOUT: Duration = Duration::from_secs(15);

/// Best-effort wait for `file-info-ack` before streaming chunks anyway.
pub const FILE_INFO_ACK_TIMEOUT: Duration = Duration::from_secs(5);

/// An outbound transfer fails when no acknowledgment advances for this long.
pub const NO_PROGRESS_TIMEOUT: Duration = Duration::from_secs(30);

// ── Connection / Network ─────────────────────────────────────────────────────

/// Label of the single ordered data channel opened per peer link.
pub const DATA_CHANNEL_LABEL: &str = "file-transfer";

/// Number of ICE candidates pre-gathered before an offer is created.
pub const ICE_CANDIDATE_POOL_SIZE: u8 = 10;

/// STUN server used when the configuration file supplies none.
pub const DEFAULT_STUN_URL: &str = "stun:stun.l.google.com:19302";

// ── Relay ────────────────────────────────────────────────────────────────────

/// Signaling relay used when neither `--relay` nor `config.toml` names one.
pub const DEFAULT_RELAY_URL: &str = "wss://blinksend-backend.onrender.com";

/// How long the CLI waits for the relay's first membership list.
pub const DEVICE_LIST_TIMEOUT: Duration = Duration::from_secs(10);

// ── Logging ──────────────────────────────────────────────────────────────────

/// File name of the persistent log under `<data_dir>/logs/`.
pub const LOG_FILE_NAME: &str = "linkdrop.log";

// ── Runtime tunables ─────────────────────────────────────────────────────────

/// Tunables for one handler instance.
///
/// Defaults mirror the constants above. Batch size and water marks are
/// tuning parameters, not part of the wire contract.
#[derive(Debug, Clone)]
pub struct TransferConfig {
    pub batch_size: usize,
    pub buffered_high: usize,
    pub buffered_low: usize,
    pub buffer_poll_interval: Duration,
    pub link_open_timeout: Duration,
    pub file_info_ack_timeout: Duration,
    pub no_progress_timeout: Duration,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            batch_size: SEND_BATCH_SIZE,
            buffered_high: DC_BUFFERED_AMOUNT_HIGH,
            buffered_low: DC_BUFFERED_AMOUNT_LOW,
            buffer_poll_interval: BUFFER_POLL_INTERVAL,
            link_open_timeout: LINK_OPEN_TIMEOUT,
            file_info_ack_timeout: FILE_INFO_ACK_TIMEOUT,
            no_progress_timeout: NO_PROGRESS_TIMEOUT,
        }
    }
}

/// One NAT-traversal helper endpoint (STUN or TURN).
///
/// Supplied through `config.toml`; credentials are never compiled in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServerConfig {
    pub urls: Vec<String>,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub credential: String,
}

impl IceServerConfig {
    pub fn stun(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            username: String::new(),
            credential: String::new(),
        }
    }
}

/// Fallback helper list: a single public STUN server, no TURN.
pub fn default_ice_servers() -> Vec<IceServerConfig> {
    vec![IceServerConfig::stun(DEFAULT_STUN_URL)]
}
