//! # patchbay-collab — Real-time board replication for Patchbay
//!
//! Multiplayer sync for shared boards: CRDT documents over WebSocket, with
//! an intent-gated deletion guard and an HTTP side channel for audio clips.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐     WebSocket       ┌──────────────┐
//! │ SyncSession  │ ◄─────────────────► │ Room actor   │
//! │ (per client) │  binary sync frames │ (per room)   │
//! └──────┬───────┘  + JSON control     └──────┬───────┘
//!        │                                    │
//!        ▼                                    ▼
//! ┌──────────────┐                     ┌──────────────┐
//! │ BoardDoc     │                     │ BoardDoc     │
//! │ (replica)    │                     │ (canonical)  │
//! └──────┬───────┘                     └──────┬───────┘
//!        │ object keys                        │ snapshots
//!        ▼                                    ▼
//! ┌──────────────┐      HTTP PUT/GET   ┌──────────────┐
//! │ AudioSync    │ ◄─────────────────► │ RoomStore    │
//! │ (cache)      │                     │ (RocksDB)    │
//! └──────────────┘                     └──────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — Control-message schema, room codes, shared constants
//! - [`doc`] — The replicated board document and its sync cursors
//! - [`intent`] — Single-use destructive-intent tokens
//! - [`room`] — Server-side room actor with the deletion guard
//! - [`session`] — Client sync session with reconnect and the joining gate
//! - [`audio`] — Audio clip codec and blob side-channel transfers
//! - [`server`] — Axum HTTP/WebSocket front end
//! - [`storage`] — RocksDB persistence for snapshots and blobs

pub mod audio;
pub mod doc;
pub mod intent;
pub mod protocol;
pub mod room;
pub mod server;
pub mod session;
pub mod storage;

// Re-exports for convenience
pub use audio::{AudioClip, AudioEvent, AudioStore, AudioSync};
pub use doc::{BoardDoc, DocError, DocMetadata, Item, ItemKind, SyncCursor, Theme};
pub use intent::{mint_token, DeleteIntent, IntentSet};
pub use protocol::{generate_room_code, is_valid_room_code, ControlMessage, ProtocolError};
pub use room::{ConnId, Outbound, Room, RoomHandle, RoomStats};
pub use server::{run, AppState, ServerConfig, ServerError};
pub use session::{ConnectionState, SessionEvent, SyncSession};
pub use storage::{RoomRecord, RoomStore, StoreConfig, StoreError};
