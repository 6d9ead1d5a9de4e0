//! Replicated board document, backed by automerge.
//!
//! The document is a mergeable map-of-maps:
//! ```text
//! ROOT
//! ├── items       — item-id → { kind, x, y, label, kind fields }
//! ├── audioFiles  — item-id → side-channel object key
//! ├── links       — sorted "a|b" edge key → true
//! ├── theme       — { background, itemColors: id → color }
//! └── metadata    — { version, createdAt, lastModified,
//!                     destructiveIntentToken?, destructiveIntentAt? }
//! ```
//!
//! Merge semantics are automerge's: deterministic, commutative, causally
//! consistent. This module only shapes the document and wraps the sync
//! protocol (`generate_sync_message` / `receive_sync_message` paced by a
//! per-peer [`SyncCursor`]); it never re-implements merging.
//!
//! Container maps are created lazily on first mutation. A replica that joins
//! a room and has never edited therefore carries no competing container
//! objects, so the host's containers always survive the merge.

use automerge::sync::{Message as RawSyncMessage, State as RawSyncState, SyncDoc};
use automerge::transaction::Transactable;
use automerge::{AutoCommit, ObjType, ReadDoc, ScalarValue, Value, ROOT};
use std::collections::{BTreeMap, BTreeSet};
use uuid::Uuid;

use crate::protocol::unix_millis;

const KEY_ITEMS: &str = "items";
const KEY_AUDIO_FILES: &str = "audioFiles";
const KEY_LINKS: &str = "links";
const KEY_THEME: &str = "theme";
const KEY_METADATA: &str = "metadata";
const KEY_ITEM_COLORS: &str = "itemColors";
const KEY_INTENT_TOKEN: &str = "destructiveIntentToken";
const KEY_INTENT_AT: &str = "destructiveIntentAt";

/// Per-peer sync cursor: opaque state recording what the remote side has
/// already acknowledged. Never shared across connections.
pub struct SyncCursor(RawSyncState);

impl Default for SyncCursor {
    fn default() -> Self {
        Self::new()
    }
}

impl SyncCursor {
    pub fn new() -> Self {
        Self(RawSyncState::new())
    }

    /// Discard everything the cursor knows; the next generated message
    /// starts the exchange from scratch.
    pub fn reset(&mut self) {
        self.0 = RawSyncState::new();
    }
}

/// Kind-tagged item payload.
#[derive(Debug, Clone, PartialEq)]
pub enum ItemKind {
    Note { text: String },
    Clip { duration_secs: f64 },
}

impl ItemKind {
    fn tag(&self) -> &'static str {
        match self {
            ItemKind::Note { .. } => "note",
            ItemKind::Clip { .. } => "clip",
        }
    }
}

/// One canvas item.
#[derive(Debug, Clone, PartialEq)]
pub struct Item {
    pub id: String,
    pub kind: ItemKind,
    pub x: f64,
    pub y: f64,
    pub label: String,
}

/// Theme state: canvas background plus per-item color overrides.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Theme {
    pub background: Option<String>,
    pub item_colors: BTreeMap<String, String>,
}

/// Document bookkeeping fields.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DocMetadata {
    pub version: u64,
    pub created_at: u64,
    pub last_modified: u64,
    pub intent_token: Option<String>,
    pub intent_at: Option<u64>,
}

/// Document errors.
#[derive(Debug, Clone)]
pub enum DocError {
    /// The underlying CRDT rejected an operation.
    Backend(String),
    /// An inbound sync message could not be decoded or applied.
    BadSyncMessage(String),
    /// Stored bytes did not load as a document.
    Corrupt(String),
}

impl std::fmt::Display for DocError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Backend(e) => write!(f, "Document backend error: {e}"),
            Self::BadSyncMessage(e) => write!(f, "Bad sync message: {e}"),
            Self::Corrupt(e) => write!(f, "Corrupt document: {e}"),
        }
    }
}

impl std::error::Error for DocError {}

impl From<automerge::AutomergeError> for DocError {
    fn from(e: automerge::AutomergeError) -> Self {
        DocError::Backend(e.to_string())
    }
}

/// The replicated board document.
///
/// Item ids are minted as `{replica-prefix}-{counter}` so two replicas never
/// collide without coordination: the prefix is freshly random per instance.
pub struct BoardDoc {
    doc: AutoCommit,
    replica_prefix: String,
    counter: u64,
}

impl BoardDoc {
    /// Create an empty document with a fresh replica prefix.
    pub fn new() -> Self {
        Self {
            doc: AutoCommit::new(),
            replica_prefix: fresh_prefix(),
            counter: 0,
        }
    }

    /// Load a document from serialized bytes.
    pub fn load(bytes: &[u8]) -> Result<Self, DocError> {
        let doc = AutoCommit::load(bytes).map_err(|e| DocError::Corrupt(e.to_string()))?;
        Ok(Self {
            doc,
            replica_prefix: fresh_prefix(),
            counter: 0,
        })
    }

    /// Serialize the full document.
    pub fn save(&mut self) -> Vec<u8> {
        self.doc.save()
    }

    /// Fork a copy sharing this document's full history. Used by the room
    /// actor for trial application of inbound changes.
    pub fn fork(&mut self) -> Self {
        Self {
            doc: self.doc.fork(),
            replica_prefix: fresh_prefix(),
            counter: 0,
        }
    }

    /// Mint a new globally unique item id.
    pub fn mint_item_id(&mut self) -> String {
        self.counter += 1;
        format!("{}-{}", self.replica_prefix, self.counter)
    }

    // ─── Mutations ────────────────────────────────────────────────────

    /// Insert or replace an item.
    pub fn upsert_item(&mut self, item: &Item) -> Result<(), DocError> {
        let items = self.ensure_map(KEY_ITEMS)?;
        let obj = self.doc.put_object(&items, item.id.as_str(), ObjType::Map)?;
        self.doc.put(&obj, "kind", item.kind.tag())?;
        self.doc.put(&obj, "x", item.x)?;
        self.doc.put(&obj, "y", item.y)?;
        self.doc.put(&obj, "label", item.label.as_str())?;
        match &item.kind {
            ItemKind::Note { text } => self.doc.put(&obj, "text", text.as_str())?,
            ItemKind::Clip { duration_secs } => {
                self.doc.put(&obj, "durationSecs", *duration_secs)?
            }
        }
        self.touch()
    }

    /// Remove an item and everything that references it.
    ///
    /// `intent_token` is stamped into the metadata so the room can match it
    /// against the out-of-band intent announcement; any previous token is
    /// cleared first (tokens are single-use).
    pub fn remove_item(&mut self, id: &str, intent_token: Option<&str>) -> Result<(), DocError> {
        if let Some(items) = self.map_at(KEY_ITEMS) {
            if self.doc.get(&items, id)?.is_some() {
                self.doc.delete(&items, id)?;
            }
        }
        if let Some(audio) = self.map_at(KEY_AUDIO_FILES) {
            if self.doc.get(&audio, id)?.is_some() {
                self.doc.delete(&audio, id)?;
            }
        }
        if let Some(links) = self.map_at(KEY_LINKS) {
            let stale: Vec<String> = self
                .doc
                .keys(&links)
                .filter(|k| edge_touches(k, id))
                .collect();
            for key in stale {
                self.doc.delete(&links, key.as_str())?;
            }
        }
        if let Some(theme) = self.map_at(KEY_THEME) {
            if let Some(colors) = self.map_in(&theme, KEY_ITEM_COLORS) {
                if self.doc.get(&colors, id)?.is_some() {
                    self.doc.delete(&colors, id)?;
                }
            }
        }

        let meta = self.ensure_map(KEY_METADATA)?;
        if self.doc.get(&meta, KEY_INTENT_TOKEN)?.is_some() {
            self.doc.delete(&meta, KEY_INTENT_TOKEN)?;
        }
        if self.doc.get(&meta, KEY_INTENT_AT)?.is_some() {
            self.doc.delete(&meta, KEY_INTENT_AT)?;
        }
        if let Some(token) = intent_token {
            self.doc.put(&meta, KEY_INTENT_TOKEN, token)?;
            self.doc.put(&meta, KEY_INTENT_AT, unix_millis())?;
        }
        self.touch()
    }

    /// Point an item at a side-channel object key.
    pub fn set_audio_key(&mut self, item_id: &str, object_key: &str) -> Result<(), DocError> {
        let audio = self.ensure_map(KEY_AUDIO_FILES)?;
        self.doc.put(&audio, item_id, object_key)?;
        self.touch()
    }

    /// Drop an item's side-channel reference.
    pub fn clear_audio_key(&mut self, item_id: &str) -> Result<(), DocError> {
        if let Some(audio) = self.map_at(KEY_AUDIO_FILES) {
            if self.doc.get(&audio, item_id)?.is_some() {
                self.doc.delete(&audio, item_id)?;
            }
        }
        self.touch()
    }

    /// Toggle the undirected link between two items.
    pub fn toggle_link(&mut self, a: &str, b: &str) -> Result<(), DocError> {
        let links = self.ensure_map(KEY_LINKS)?;
        let key = edge_key(a, b);
        if self.doc.get(&links, key.as_str())?.is_some() {
            self.doc.delete(&links, key.as_str())?;
        } else {
            self.doc.put(&links, key.as_str(), true)?;
        }
        self.touch()
    }

    /// Insert a link by its canonical edge key. Unlike [`Self::toggle_link`]
    /// this is idempotent, which matters when re-applying a link that may or
    /// may not already be present.
    pub fn put_link_key(&mut self, key: &str) -> Result<(), DocError> {
        let links = self.ensure_map(KEY_LINKS)?;
        self.doc.put(&links, key, true)?;
        self.touch()
    }

    /// Set the canvas background color.
    pub fn set_background(&mut self, color: &str) -> Result<(), DocError> {
        let theme = self.ensure_map(KEY_THEME)?;
        self.doc.put(&theme, "background", color)?;
        self.touch()
    }

    /// Override one item's color.
    pub fn set_item_color(&mut self, item_id: &str, color: &str) -> Result<(), DocError> {
        let theme = self.ensure_map(KEY_THEME)?;
        let colors = match self.map_in(&theme, KEY_ITEM_COLORS) {
            Some(obj) => obj,
            None => self.doc.put_object(&theme, KEY_ITEM_COLORS, ObjType::Map)?,
        };
        self.doc.put(&colors, item_id, color)?;
        self.touch()
    }

    // ─── Readers ──────────────────────────────────────────────────────

    /// All items, keyed by id. Unreadable records are skipped.
    pub fn items(&self) -> BTreeMap<String, Item> {
        let mut out = BTreeMap::new();
        let Some(items) = self.map_at(KEY_ITEMS) else {
            return out;
        };
        let ids: Vec<String> = self.doc.keys(&items).collect();
        for id in ids {
            if let Some(item) = self.read_item(&items, &id) {
                out.insert(id, item);
            }
        }
        out
    }

    /// The set of item ids currently present.
    pub fn item_ids(&self) -> BTreeSet<String> {
        match self.map_at(KEY_ITEMS) {
            Some(items) => self.doc.keys(&items).collect(),
            None => BTreeSet::new(),
        }
    }

    /// Side-channel references: item-id → object key.
    pub fn audio_keys(&self) -> BTreeMap<String, String> {
        let mut out = BTreeMap::new();
        let Some(audio) = self.map_at(KEY_AUDIO_FILES) else {
            return out;
        };
        let ids: Vec<String> = self.doc.keys(&audio).collect();
        for id in ids {
            if let Some(key) = self.get_str(&audio, &id) {
                out.insert(id, key);
            }
        }
        out
    }

    /// Present undirected edge keys.
    pub fn link_keys(&self) -> BTreeSet<String> {
        match self.map_at(KEY_LINKS) {
            Some(links) => self.doc.keys(&links).collect(),
            None => BTreeSet::new(),
        }
    }

    /// Theme state.
    pub fn theme(&self) -> Theme {
        let mut out = Theme::default();
        let Some(theme) = self.map_at(KEY_THEME) else {
            return out;
        };
        out.background = self.get_str(&theme, "background");
        if let Some(colors) = self.map_in(&theme, KEY_ITEM_COLORS) {
            let ids: Vec<String> = self.doc.keys(&colors).collect();
            for id in ids {
                if let Some(color) = self.get_str(&colors, &id) {
                    out.item_colors.insert(id, color);
                }
            }
        }
        out
    }

    /// Document metadata.
    pub fn metadata(&self) -> DocMetadata {
        let mut out = DocMetadata::default();
        let Some(meta) = self.map_at(KEY_METADATA) else {
            return out;
        };
        out.version = self.get_u64(&meta, "version").unwrap_or(0);
        out.created_at = self.get_u64(&meta, "createdAt").unwrap_or(0);
        out.last_modified = self.get_u64(&meta, "lastModified").unwrap_or(0);
        out.intent_token = self.get_str(&meta, KEY_INTENT_TOKEN);
        out.intent_at = self.get_u64(&meta, KEY_INTENT_AT);
        out
    }

    // ─── Sync protocol ────────────────────────────────────────────────

    /// Generate the next sync message for the peer tracked by `cursor`.
    /// `None` means both sides have converged.
    pub fn generate_sync_message(&mut self, cursor: &mut SyncCursor) -> Option<Vec<u8>> {
        self.doc
            .sync()
            .generate_sync_message(&mut cursor.0)
            .map(|m| m.encode())
    }

    /// Apply an inbound sync message against `cursor`, merging any changes
    /// it carries into this document.
    pub fn receive_sync_message(
        &mut self,
        cursor: &mut SyncCursor,
        bytes: &[u8],
    ) -> Result<(), DocError> {
        let message = RawSyncMessage::decode(bytes)
            .map_err(|e| DocError::BadSyncMessage(e.to_string()))?;
        self.doc
            .sync()
            .receive_sync_message(&mut cursor.0, message)
            .map_err(|e| DocError::BadSyncMessage(e.to_string()))
    }

    // ─── Internals ────────────────────────────────────────────────────

    fn touch(&mut self) -> Result<(), DocError> {
        let meta = self.ensure_map(KEY_METADATA)?;
        let version = self.get_u64(&meta, "version").unwrap_or(0);
        self.doc.put(&meta, "version", version + 1)?;
        let now = unix_millis();
        if self.get_u64(&meta, "createdAt").is_none() {
            self.doc.put(&meta, "createdAt", now)?;
        }
        self.doc.put(&meta, "lastModified", now)?;
        Ok(())
    }

    fn ensure_map(&mut self, key: &str) -> Result<automerge::ObjId, DocError> {
        if let Some(id) = self.map_at(key) {
            return Ok(id);
        }
        Ok(self.doc.put_object(ROOT, key, ObjType::Map)?)
    }

    fn map_at(&self, key: &str) -> Option<automerge::ObjId> {
        match self.doc.get(ROOT, key).ok().flatten() {
            Some((Value::Object(ObjType::Map), id)) => Some(id),
            _ => None,
        }
    }

    fn map_in(&self, obj: &automerge::ObjId, key: &str) -> Option<automerge::ObjId> {
        match self.doc.get(obj, key).ok().flatten() {
            Some((Value::Object(ObjType::Map), id)) => Some(id),
            _ => None,
        }
    }

    fn read_item(&self, items: &automerge::ObjId, id: &str) -> Option<Item> {
        let obj = self.map_in(items, id)?;
        let kind = match self.get_str(&obj, "kind")?.as_str() {
            "note" => ItemKind::Note {
                text: self.get_str(&obj, "text").unwrap_or_default(),
            },
            "clip" => ItemKind::Clip {
                duration_secs: self.get_f64(&obj, "durationSecs").unwrap_or(0.0),
            },
            _ => return None,
        };
        Some(Item {
            id: id.to_string(),
            kind,
            x: self.get_f64(&obj, "x").unwrap_or(0.0),
            y: self.get_f64(&obj, "y").unwrap_or(0.0),
            label: self.get_str(&obj, "label").unwrap_or_default(),
        })
    }

    fn get_str(&self, obj: &automerge::ObjId, key: &str) -> Option<String> {
        match self.doc.get(obj, key).ok().flatten() {
            Some((Value::Scalar(s), _)) => match s.as_ref() {
                ScalarValue::Str(v) => Some(v.to_string()),
                _ => None,
            },
            _ => None,
        }
    }

    fn get_f64(&self, obj: &automerge::ObjId, key: &str) -> Option<f64> {
        match self.doc.get(obj, key).ok().flatten() {
            Some((Value::Scalar(s), _)) => match s.as_ref() {
                ScalarValue::F64(v) => Some(*v),
                ScalarValue::Int(v) => Some(*v as f64),
                ScalarValue::Uint(v) => Some(*v as f64),
                _ => None,
            },
            _ => None,
        }
    }

    fn get_u64(&self, obj: &automerge::ObjId, key: &str) -> Option<u64> {
        match self.doc.get(obj, key).ok().flatten() {
            Some((Value::Scalar(s), _)) => match s.as_ref() {
                ScalarValue::Uint(v) => Some(*v),
                ScalarValue::Int(v) => u64::try_from(*v).ok(),
                _ => None,
            },
            _ => None,
        }
    }
}

impl Default for BoardDoc {
    fn default() -> Self {
        Self::new()
    }
}

fn fresh_prefix() -> String {
    let simple = Uuid::new_v4().simple().to_string();
    simple[..8].to_string()
}

/// Canonical undirected edge key: the two ids joined by `|`, lexicographically
/// ordered so both replicas agree on the key.
pub fn edge_key(a: &str, b: &str) -> String {
    if a <= b {
        format!("{a}|{b}")
    } else {
        format!("{b}|{a}")
    }
}

pub(crate) fn edge_touches(key: &str, id: &str) -> bool {
    match key.split_once('|') {
        Some((a, b)) => a == id || b == id,
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn note(doc: &mut BoardDoc, text: &str) -> Item {
        let item = Item {
            id: doc.mint_item_id(),
            kind: ItemKind::Note {
                text: text.to_string(),
            },
            x: 10.0,
            y: 20.0,
            label: text.to_string(),
        };
        doc.upsert_item(&item).unwrap();
        item
    }

    /// Ping-pong sync messages until both sides report convergence.
    fn converge(a: &mut BoardDoc, ca: &mut SyncCursor, b: &mut BoardDoc, cb: &mut SyncCursor) {
        for _ in 0..64 {
            let ma = a.generate_sync_message(ca);
            if let Some(m) = &ma {
                b.receive_sync_message(cb, m).unwrap();
            }
            let mb = b.generate_sync_message(cb);
            if let Some(m) = &mb {
                a.receive_sync_message(ca, m).unwrap();
            }
            if ma.is_none() && mb.is_none() {
                return;
            }
        }
        panic!("sync did not converge");
    }

    #[test]
    fn test_item_crud() {
        let mut doc = BoardDoc::new();
        let item = note(&mut doc, "hello");

        let items = doc.items();
        assert_eq!(items.len(), 1);
        assert_eq!(items[&item.id], item);

        doc.remove_item(&item.id, None).unwrap();
        assert!(doc.items().is_empty());
        assert!(doc.item_ids().is_empty());
    }

    #[test]
    fn test_clip_item_fields() {
        let mut doc = BoardDoc::new();
        let item = Item {
            id: doc.mint_item_id(),
            kind: ItemKind::Clip { duration_secs: 2.5 },
            x: 1.0,
            y: 2.0,
            label: "kick".to_string(),
        };
        doc.upsert_item(&item).unwrap();
        assert_eq!(doc.items()[&item.id], item);
    }

    #[test]
    fn test_audio_keys() {
        let mut doc = BoardDoc::new();
        let item = note(&mut doc, "clip holder");
        doc.set_audio_key(&item.id, "obj-123").unwrap();
        assert_eq!(doc.audio_keys()[&item.id], "obj-123");

        doc.clear_audio_key(&item.id).unwrap();
        assert!(doc.audio_keys().is_empty());
    }

    #[test]
    fn test_links_toggle_and_cleanup() {
        let mut doc = BoardDoc::new();
        let a = note(&mut doc, "a");
        let b = note(&mut doc, "b");

        doc.toggle_link(&a.id, &b.id).unwrap();
        assert!(doc.link_keys().contains(&edge_key(&a.id, &b.id)));

        // Toggling again removes; edge key is order independent.
        doc.toggle_link(&b.id, &a.id).unwrap();
        assert!(doc.link_keys().is_empty());

        doc.toggle_link(&a.id, &b.id).unwrap();
        doc.remove_item(&a.id, None).unwrap();
        assert!(doc.link_keys().is_empty(), "links to removed items pruned");

        // put_link_key inserts and stays put on repeat.
        let key = edge_key(&a.id, &b.id);
        doc.put_link_key(&key).unwrap();
        doc.put_link_key(&key).unwrap();
        assert!(doc.link_keys().contains(&key));
    }

    #[test]
    fn test_theme() {
        let mut doc = BoardDoc::new();
        let item = note(&mut doc, "tinted");
        doc.set_background("#101014").unwrap();
        doc.set_item_color(&item.id, "#ff8800").unwrap();

        let theme = doc.theme();
        assert_eq!(theme.background.as_deref(), Some("#101014"));
        assert_eq!(theme.item_colors[&item.id], "#ff8800");
    }

    #[test]
    fn test_metadata_tracks_changes() {
        let mut doc = BoardDoc::new();
        assert_eq!(doc.metadata().version, 0);

        note(&mut doc, "one");
        let meta = doc.metadata();
        assert_eq!(meta.version, 1);
        assert!(meta.last_modified > 0);
        assert!(meta.created_at > 0);

        note(&mut doc, "two");
        assert_eq!(doc.metadata().version, 2);
    }

    #[test]
    fn test_intent_token_stamped_and_cleared() {
        let mut doc = BoardDoc::new();
        let a = note(&mut doc, "a");
        let b = note(&mut doc, "b");

        doc.remove_item(&a.id, Some("tok-1")).unwrap();
        let meta = doc.metadata();
        assert_eq!(meta.intent_token.as_deref(), Some("tok-1"));
        assert!(meta.intent_at.is_some());

        // A later delete without a token clears the stale one.
        doc.remove_item(&b.id, None).unwrap();
        assert!(doc.metadata().intent_token.is_none());
    }

    #[test]
    fn test_save_load_roundtrip() {
        let mut doc = BoardDoc::new();
        let item = note(&mut doc, "persisted");
        let bytes = doc.save();

        let loaded = BoardDoc::load(&bytes).unwrap();
        assert_eq!(loaded.items()[&item.id], item);
    }

    #[test]
    fn test_load_rejects_garbage() {
        assert!(BoardDoc::load(&[0xde, 0xad, 0xbe, 0xef]).is_err());
    }

    #[test]
    fn test_mint_ids_unique_across_replicas() {
        // Simulated concurrent minting on distinct replicas: no collisions.
        let mut seen = BTreeSet::new();
        for _ in 0..16 {
            let mut doc = BoardDoc::new();
            for _ in 0..64 {
                assert!(seen.insert(doc.mint_item_id()));
            }
        }
    }

    #[test]
    fn test_mint_ids_carry_replica_prefix() {
        let mut doc = BoardDoc::new();
        let first = doc.mint_item_id();
        let second = doc.mint_item_id();
        let prefix = first.rsplit_once('-').unwrap().0;
        assert_eq!(second.rsplit_once('-').unwrap().0, prefix);
        assert!(first.ends_with("-1"));
        assert!(second.ends_with("-2"));
    }

    #[test]
    fn test_sync_convergence() {
        let mut host = BoardDoc::new();
        let item = note(&mut host, "shared");

        let mut joiner = BoardDoc::new();
        let mut ch = SyncCursor::new();
        let mut cj = SyncCursor::new();
        converge(&mut host, &mut ch, &mut joiner, &mut cj);

        assert_eq!(joiner.items()[&item.id], item);
        assert_eq!(host.item_ids(), joiner.item_ids());

        // Converged cursors produce no further traffic.
        assert!(host.generate_sync_message(&mut ch).is_none());
        assert!(joiner.generate_sync_message(&mut cj).is_none());
    }

    #[test]
    fn test_concurrent_edits_converge() {
        let mut a = BoardDoc::new();
        let base = note(&mut a, "base");
        let mut ca = SyncCursor::new();
        let mut cb = SyncCursor::new();
        let mut b = BoardDoc::new();
        converge(&mut a, &mut ca, &mut b, &mut cb);

        // Divergent concurrent edits on both replicas.
        let from_a = note(&mut a, "from a");
        let from_b = note(&mut b, "from b");
        converge(&mut a, &mut ca, &mut b, &mut cb);

        for doc in [&a, &b] {
            let ids = doc.item_ids();
            assert!(ids.contains(&base.id));
            assert!(ids.contains(&from_a.id));
            assert!(ids.contains(&from_b.id));
        }
        assert_eq!(a.item_ids(), b.item_ids());
    }

    #[test]
    fn test_fork_shares_history() {
        let mut doc = BoardDoc::new();
        let item = note(&mut doc, "forked");
        let mut copy = doc.fork();
        assert_eq!(copy.item_ids(), doc.item_ids());

        // Changes to the fork do not touch the original.
        copy.remove_item(&item.id, None).unwrap();
        assert!(doc.item_ids().contains(&item.id));
    }

    #[test]
    fn test_cursor_reset_resends_from_scratch() {
        let mut a = BoardDoc::new();
        note(&mut a, "state");
        let mut b = BoardDoc::new();
        let mut ca = SyncCursor::new();
        let mut cb = SyncCursor::new();
        converge(&mut a, &mut ca, &mut b, &mut cb);
        assert!(a.generate_sync_message(&mut ca).is_none());

        ca.reset();
        assert!(a.generate_sync_message(&mut ca).is_some());
    }

    #[test]
    fn test_receive_rejects_garbage() {
        let mut doc = BoardDoc::new();
        let mut cursor = SyncCursor::new();
        let err = doc.receive_sync_message(&mut cursor, &[1, 2, 3]);
        assert!(matches!(err, Err(DocError::BadSyncMessage(_))));
    }
}
