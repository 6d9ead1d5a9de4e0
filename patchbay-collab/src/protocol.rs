//! Wire protocol for room synchronization.
//!
//! Two frame kinds travel over one WebSocket:
//! ```text
//! ┌─────────────────┬──────────────────────────────────────────────┐
//! │ Binary frames   │ opaque automerge sync messages (cursor-paced)│
//! │ Text frames     │ JSON control messages (ControlMessage)       │
//! └─────────────────┴──────────────────────────────────────────────┘
//! ```
//!
//! Control messages are deliberately outside the replicated document:
//! connection counts and playback triggers are ephemeral, and destructive
//! intents must reach the room even when the document change that carries
//! the matching token is still in flight.

use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime};

/// Length of a room code (lowercase alphanumeric).
pub const ROOM_CODE_LEN: usize = 8;

/// Alphabet for room codes.
const ROOM_CODE_CHARS: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

/// Maximum accepted audio payload (PUT returns 413 above this).
pub const MAX_AUDIO_BYTES: usize = 10 * 1024 * 1024;

/// Hard ceiling on a destructive intent's lifetime.
pub const INTENT_TTL: Duration = Duration::from_secs(10);

/// Operation name carried by a delete intent.
pub const INTENT_OP_DELETE_ITEM: &str = "delete-item";

/// Reconnect backoff: base delay, doubled per attempt up to the cap.
pub const RECONNECT_BASE: Duration = Duration::from_secs(2);
pub const RECONNECT_CAP: Duration = Duration::from_secs(30);

/// Audio transfer retry policy: attempts and base backoff.
pub const AUDIO_RETRY_LIMIT: u32 = 3;
pub const AUDIO_RETRY_BASE: Duration = Duration::from_millis(500);

/// Bounded concurrency for bulk audio re-upload.
pub const AUDIO_UPLOAD_CONCURRENCY: usize = 4;

/// JSON control messages exchanged as text frames alongside the binary
/// sync stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ControlMessage {
    /// Server → clients: number of live connections in the room.
    #[serde(rename_all = "camelCase")]
    ConnectionCount { count: usize },
    /// Either direction: trigger playback of an item's clip on every peer.
    #[serde(rename_all = "camelCase")]
    AudioPlay { item_id: String },
    /// Client → server: announce a single-use deletion token before (or
    /// concurrently with) the document change that consumes it.
    #[serde(rename_all = "camelCase")]
    DestructiveIntent {
        token: String,
        op: String,
        item_id: String,
        /// Unix milliseconds; the server clamps to [`INTENT_TTL`] from receipt.
        expires_at: u64,
    },
}

impl ControlMessage {
    /// Serialize to a JSON text frame.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Parse a JSON text frame.
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::Deserialization(e.to_string()))
    }
}

/// Generate a fresh 8-character lowercase-alphanumeric room code.
pub fn generate_room_code() -> String {
    use rand::Rng;
    let mut rng = rand::thread_rng();
    (0..ROOM_CODE_LEN)
        .map(|_| ROOM_CODE_CHARS[rng.gen_range(0..ROOM_CODE_CHARS.len())] as char)
        .collect()
}

/// Check that a room code has the expected shape.
pub fn is_valid_room_code(code: &str) -> bool {
    code.len() == ROOM_CODE_LEN
        && code
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit())
}

/// Current wall clock as unix milliseconds.
pub fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Protocol errors.
#[derive(Debug, Clone)]
pub enum ProtocolError {
    Serialization(String),
    Deserialization(String),
    InvalidRoomCode(String),
    ConnectionClosed,
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Serialization(e) => write!(f, "Serialization error: {e}"),
            Self::Deserialization(e) => write!(f, "Deserialization error: {e}"),
            Self::InvalidRoomCode(code) => write!(f, "Invalid room code: {code}"),
            Self::ConnectionClosed => write!(f, "Connection closed"),
        }
    }
}

impl std::error::Error for ProtocolError {}
