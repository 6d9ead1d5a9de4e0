//! Server-side room actor: the single authoritative replica per room.
//!
//! Architecture:
//! ```text
//! WS conn A ──┐                       ┌── cursor A + intents A
//! WS conn B ──┼── mpsc ──► Room ──────┼── cursor B + intents B
//! WS conn C ──┘  (strictly │          └── cursor C + intents C
//!                sequential)│
//!                           ├── canonical BoardDoc
//!                           └── RoomStore (RocksDB)
//! ```
//!
//! All commands for one room drain through one mpsc queue processed by one
//! task, so two concurrent deletes can never race inside [`Room::on_message`].
//! Different rooms run on independent tasks.
//!
//! The deletion guard: an inbound change is applied to a fork of the
//! canonical document first. If items went missing, the change is rejected
//! unless it removed exactly one item and the sender pre-announced a
//! matching, unexpired, single-use intent for that item. A rejected deletion
//! is absorbed and immediately countered with a change that re-inserts
//! everything it removed: the offender's replica permanently holds the
//! delete op and would re-offer it on every round if the room refused to
//! merge it, so the room merges and undoes it instead. The sync converges
//! and the offender watches the deletion reverse itself.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::doc::{edge_touches, BoardDoc, DocError, Item, SyncCursor};
use crate::intent::IntentSet;
use crate::protocol::{ControlMessage, INTENT_OP_DELETE_ITEM};
use crate::storage::RoomStore;

/// Identifier for one live connection within a room.
pub type ConnId = u64;

/// Frames queued toward one connection's WebSocket writer.
#[derive(Debug, Clone)]
pub enum Outbound {
    /// Binary sync-protocol message.
    Sync(Vec<u8>),
    /// JSON control message.
    Control(ControlMessage),
}

/// Commands drained sequentially by the room task.
pub enum RoomCmd {
    Accept {
        conn_id: ConnId,
        sender: mpsc::UnboundedSender<Outbound>,
    },
    Message {
        conn_id: ConnId,
        bytes: Vec<u8>,
    },
    Control {
        conn_id: ConnId,
        message: ControlMessage,
    },
    Closed {
        conn_id: ConnId,
    },
}

/// Per-room counters.
#[derive(Debug, Clone, Copy, Default)]
pub struct RoomStats {
    pub messages: u64,
    pub accepted_changes: u64,
    pub rejected_deletes: u64,
    pub forced_resyncs: u64,
}

/// One live connection: its sync cursor and outstanding intents, destroyed
/// atomically with the connection.
struct PeerConn {
    cursor: SyncCursor,
    intents: IntentSet,
    sender: mpsc::UnboundedSender<Outbound>,
}

enum Verdict {
    Malformed,
    Rejected(Vec<String>),
    Accepted,
}

/// Everything a rejected deletion removed, captured from canonical state
/// before the offending change is absorbed.
#[derive(Default)]
struct RestorePlan {
    items: Vec<Item>,
    audio: Vec<(String, String)>,
    colors: Vec<(String, String)>,
    links: BTreeSet<String>,
}

/// The room state machine. Pure and synchronous; the actor task in
/// [`RoomHandle::spawn`] wraps it with the command queue.
pub struct Room {
    room_code: String,
    doc: BoardDoc,
    conns: HashMap<ConnId, PeerConn>,
    store: Option<Arc<RoomStore>>,
    stats: RoomStats,
}

impl Room {
    /// Create a cold room with an empty canonical document.
    pub fn new(room_code: impl Into<String>, store: Option<Arc<RoomStore>>) -> Self {
        Self {
            room_code: room_code.into(),
            doc: BoardDoc::new(),
            conns: HashMap::new(),
            store,
            stats: RoomStats::default(),
        }
    }

    /// Resume a room from its persisted canonical document.
    pub fn resume(
        room_code: impl Into<String>,
        doc_bytes: &[u8],
        store: Option<Arc<RoomStore>>,
    ) -> Result<Self, DocError> {
        let mut room = Self::new(room_code, store);
        room.doc = BoardDoc::load(doc_bytes)?;
        Ok(room)
    }

    /// Seed a freshly created room from a client's serialized state.
    /// Called exactly once, before any connection is accepted.
    pub fn init(&mut self, doc_bytes: &[u8]) -> Result<(), DocError> {
        if !doc_bytes.is_empty() {
            self.doc = BoardDoc::load(doc_bytes)?;
        }
        self.persist();
        Ok(())
    }

    /// Register a new connection: empty cursor, empty intent set, immediate
    /// full sync message, then a connection-count broadcast to everyone.
    pub fn accept(&mut self, conn_id: ConnId, sender: mpsc::UnboundedSender<Outbound>) {
        self.conns.insert(
            conn_id,
            PeerConn {
                cursor: SyncCursor::new(),
                intents: IntentSet::new(),
                sender,
            },
        );
        log::info!(
            "Room {}: connection {conn_id} joined ({} live)",
            self.room_code,
            self.conns.len()
        );
        self.send_sync(conn_id);
        self.broadcast_count();
    }

    /// Arbitrate one inbound sync message from `conn_id`.
    pub fn on_message(&mut self, conn_id: ConnId, bytes: &[u8]) {
        self.stats.messages += 1;

        let before = self.doc.item_ids();
        let mut trial = self.doc.fork();

        let verdict = {
            let Some(conn) = self.conns.get_mut(&conn_id) else {
                return;
            };
            match trial.receive_sync_message(&mut conn.cursor, bytes) {
                Err(e) => {
                    log::warn!(
                        "Room {}: inapplicable sync message from {conn_id}: {e}",
                        self.room_code
                    );
                    Verdict::Malformed
                }
                Ok(()) => {
                    let after = trial.item_ids();
                    let missing: Vec<String> = before.difference(&after).cloned().collect();
                    if missing.is_empty() {
                        Verdict::Accepted
                    } else if missing.len() > 1 {
                        // Intents are single-item scoped; bulk removals
                        // (including whole-board wipes, the signature of a
                        // blank replica polluting the room) never pass.
                        Verdict::Rejected(missing)
                    } else {
                        // The token travels in a shared metadata register;
                        // a concurrent delete may have overwritten it in
                        // flight, so fall back to the connection's intent
                        // scoped to the item that actually disappeared.
                        let authorized = match trial.metadata().intent_token {
                            Some(token) => {
                                conn.intents.consume(&token, &missing[0])
                                    || conn.intents.consume_for_item(&missing[0])
                            }
                            None => false,
                        };
                        if authorized {
                            Verdict::Accepted
                        } else {
                            Verdict::Rejected(missing)
                        }
                    }
                }
            }
        };

        match verdict {
            Verdict::Malformed => {
                self.force_resync(conn_id);
            }
            Verdict::Rejected(missing) => {
                self.stats.rejected_deletes += 1;
                log::warn!(
                    "Room {}: rejected unauthorized deletion of {missing:?} from {conn_id}",
                    self.room_code
                );
                // Capture what vanished while canonical still has it, merge
                // the offending change, then re-insert the captured state as
                // a countering change visible to every replica.
                let plan = self.capture_for_restore(&missing);
                self.doc = trial;
                if let Err(e) = self.apply_restore(&plan) {
                    log::error!(
                        "Room {}: failed to restore rejected deletion: {e}",
                        self.room_code
                    );
                }
                self.persist();
                let ids: Vec<ConnId> = self.conns.keys().copied().collect();
                for id in ids {
                    self.send_sync(id);
                }
            }
            Verdict::Accepted => {
                self.stats.accepted_changes += 1;
                self.doc = trial;
                self.persist();
                self.send_sync(conn_id);
                let others: Vec<ConnId> = self
                    .conns
                    .keys()
                    .filter(|id| **id != conn_id)
                    .copied()
                    .collect();
                for id in others {
                    self.send_sync(id);
                }
            }
        }
    }

    /// Handle an out-of-band control message from a connection.
    pub fn on_control(&mut self, conn_id: ConnId, message: ControlMessage) {
        match message {
            ControlMessage::DestructiveIntent {
                token,
                op,
                item_id,
                expires_at,
            } => {
                if op != INTENT_OP_DELETE_ITEM {
                    log::warn!("Room {}: unknown intent op {op:?}", self.room_code);
                    return;
                }
                let Some(conn) = self.conns.get_mut(&conn_id) else {
                    return;
                };
                if !conn.intents.register(&token, &item_id, expires_at) {
                    log::debug!(
                        "Room {}: dropped already-expired intent for {item_id}",
                        self.room_code
                    );
                }
            }
            ControlMessage::AudioPlay { item_id } => {
                let relay = ControlMessage::AudioPlay { item_id };
                for (id, conn) in &self.conns {
                    if *id != conn_id {
                        let _ = conn.sender.send(Outbound::Control(relay.clone()));
                    }
                }
            }
            // Server-to-client only; a client sending it is ignored.
            ControlMessage::ConnectionCount { .. } => {}
        }
    }

    /// Drop a connection's cursor and intents, then recount.
    pub fn on_close(&mut self, conn_id: ConnId) {
        if self.conns.remove(&conn_id).is_some() {
            log::info!(
                "Room {}: connection {conn_id} left ({} live)",
                self.room_code,
                self.conns.len()
            );
            self.broadcast_count();
        }
    }

    /// Number of live connections.
    pub fn connection_count(&self) -> usize {
        self.conns.len()
    }

    /// Per-room counters.
    pub fn stats(&self) -> RoomStats {
        self.stats
    }

    /// The canonical document's current item ids (read-only view).
    pub fn item_ids(&self) -> std::collections::BTreeSet<String> {
        self.doc.item_ids()
    }

    fn handle(&mut self, cmd: RoomCmd) {
        match cmd {
            RoomCmd::Accept { conn_id, sender } => self.accept(conn_id, sender),
            RoomCmd::Message { conn_id, bytes } => self.on_message(conn_id, &bytes),
            RoomCmd::Control { conn_id, message } => self.on_control(conn_id, message),
            RoomCmd::Closed { conn_id } => self.on_close(conn_id),
        }
    }

    /// Snapshot the records, side-channel references, links and color
    /// overrides of the items a rejected change removed.
    fn capture_for_restore(&self, missing: &[String]) -> RestorePlan {
        let items = self.doc.items();
        let audio = self.doc.audio_keys();
        let theme = self.doc.theme();
        let link_keys = self.doc.link_keys();
        let mut plan = RestorePlan::default();
        for id in missing {
            if let Some(item) = items.get(id) {
                plan.items.push(item.clone());
            }
            if let Some(key) = audio.get(id) {
                plan.audio.push((id.clone(), key.clone()));
            }
            if let Some(color) = theme.item_colors.get(id) {
                plan.colors.push((id.clone(), color.clone()));
            }
            for key in &link_keys {
                if edge_touches(key, id) {
                    plan.links.insert(key.clone());
                }
            }
        }
        plan
    }

    /// Re-apply a captured snapshot on top of the merged offending change.
    fn apply_restore(&mut self, plan: &RestorePlan) -> Result<(), DocError> {
        for item in &plan.items {
            self.doc.upsert_item(item)?;
        }
        for (id, key) in &plan.audio {
            self.doc.set_audio_key(id, key)?;
        }
        for (id, color) in &plan.colors {
            self.doc.set_item_color(id, color)?;
        }
        for key in &plan.links {
            self.doc.put_link_key(key)?;
        }
        Ok(())
    }

    /// Reset one connection's cursor and resend from the canonical state.
    fn force_resync(&mut self, conn_id: ConnId) {
        self.stats.forced_resyncs += 1;
        if let Some(conn) = self.conns.get_mut(&conn_id) {
            conn.cursor.reset();
        }
        self.send_sync(conn_id);
    }

    /// Generate and queue the next sync message for one connection's cursor.
    fn send_sync(&mut self, conn_id: ConnId) {
        let Some(conn) = self.conns.get_mut(&conn_id) else {
            return;
        };
        if let Some(bytes) = self.doc.generate_sync_message(&mut conn.cursor) {
            let _ = conn.sender.send(Outbound::Sync(bytes));
        }
    }

    fn broadcast_count(&self) {
        let count = self.conns.len();
        for conn in self.conns.values() {
            let _ = conn
                .sender
                .send(Outbound::Control(ControlMessage::ConnectionCount { count }));
        }
    }

    fn persist(&mut self) {
        if let Some(store) = self.store.clone() {
            let bytes = self.doc.save();
            if let Err(e) = store.save_doc(&self.room_code, &bytes) {
                log::error!("Room {}: failed to persist canonical doc: {e}", self.room_code);
            }
        }
    }
}

/// Handle to a spawned room task. Cloneable; all clones feed one queue.
#[derive(Clone)]
pub struct RoomHandle {
    tx: mpsc::Sender<RoomCmd>,
    next_conn_id: Arc<AtomicU64>,
}

impl RoomHandle {
    /// Spawn the actor task for `room`. Commands are processed strictly in
    /// arrival order; the task ends when every handle is dropped.
    pub fn spawn(mut room: Room) -> Self {
        let (tx, mut rx) = mpsc::channel::<RoomCmd>(256);
        tokio::spawn(async move {
            while let Some(cmd) = rx.recv().await {
                room.handle(cmd);
            }
            log::debug!("Room {}: actor stopped", room.room_code);
        });
        Self {
            tx,
            next_conn_id: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Register a connection; returns its id within the room.
    pub async fn accept(&self, sender: mpsc::UnboundedSender<Outbound>) -> ConnId {
        let conn_id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
        let _ = self.tx.send(RoomCmd::Accept { conn_id, sender }).await;
        conn_id
    }

    pub async fn message(&self, conn_id: ConnId, bytes: Vec<u8>) {
        let _ = self.tx.send(RoomCmd::Message { conn_id, bytes }).await;
    }

    pub async fn control(&self, conn_id: ConnId, message: ControlMessage) {
        let _ = self.tx.send(RoomCmd::Control { conn_id, message }).await;
    }

    pub async fn closed(&self, conn_id: ConnId) {
        let _ = self.tx.send(RoomCmd::Closed { conn_id }).await;
    }
}
