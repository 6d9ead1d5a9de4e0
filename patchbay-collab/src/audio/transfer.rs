//! Audio blob transfers against the room's HTTP object store.
//!
//! The document only ever carries object keys; the bytes themselves move
//! through `PUT/GET/DELETE /api/rooms/{room}/audio/{item}`. Transfers are
//! best-effort by design: a failed upload or delete is logged and dropped,
//! a failed download gives up after a bounded number of retries and leaves
//! the document reference in place for a later attempt.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, Semaphore};

use crate::audio::clip::AudioClip;
use crate::doc::BoardDoc;
use crate::protocol::{AUDIO_RETRY_BASE, AUDIO_RETRY_LIMIT, AUDIO_UPLOAD_CONCURRENCY};

#[derive(Debug)]
pub enum TransferError {
    Http(reqwest::Error),
    Status(reqwest::StatusCode),
}

impl std::fmt::Display for TransferError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Http(e) => write!(f, "HTTP error: {e}"),
            Self::Status(code) => write!(f, "Unexpected status: {code}"),
        }
    }
}

impl std::error::Error for TransferError {}

impl From<reqwest::Error> for TransferError {
    fn from(e: reqwest::Error) -> Self {
        Self::Http(e)
    }
}

/// HTTP client for one room's audio objects.
pub struct AudioStore {
    client: reqwest::Client,
    base_url: String,
    room_code: String,
}

impl AudioStore {
    pub fn new(base_url: impl Into<String>, room_code: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            room_code: room_code.into(),
        }
    }

    fn object_url(&self, item_id: &str) -> String {
        format!(
            "{}/api/rooms/{}/audio/{}",
            self.base_url, self.room_code, item_id
        )
    }

    pub async fn put(&self, item_id: &str, bytes: Vec<u8>) -> Result<(), TransferError> {
        let resp = self
            .client
            .put(self.object_url(item_id))
            .body(bytes)
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(TransferError::Status(resp.status()));
        }
        Ok(())
    }

    pub async fn get(&self, item_id: &str) -> Result<Vec<u8>, TransferError> {
        let resp = self.client.get(self.object_url(item_id)).send().await?;
        if !resp.status().is_success() {
            return Err(TransferError::Status(resp.status()));
        }
        Ok(resp.bytes().await?.to_vec())
    }

    pub async fn delete(&self, item_id: &str) -> Result<(), TransferError> {
        let resp = self.client.delete(self.object_url(item_id)).send().await?;
        if !resp.status().is_success() {
            return Err(TransferError::Status(resp.status()));
        }
        Ok(())
    }
}

/// Notifications for the consuming application.
#[derive(Debug, Clone, PartialEq)]
pub enum AudioEvent {
    /// A clip is now available locally for `item_id` under `object_key`.
    Downloaded { item_id: String, object_key: String },
    /// All retries exhausted; the document reference is untouched.
    DownloadFailed { item_id: String, object_key: String },
}

/// When a download finishes, the coalescing slot tells it what to do next.
enum InFlight {
    /// Download running, nothing queued behind it.
    Running,
    /// Download running; replay with this (latest) key once it finishes.
    Superseded(String),
}

/// Keeps locally cached clips consistent with the keys the document holds.
pub struct AudioSync {
    store: Arc<AudioStore>,
    room_code: String,
    /// Cached clips keyed by `{room}/{objectKey}` so blobs never leak
    /// across rooms.
    cache: Arc<Mutex<HashMap<String, Arc<AudioClip>>>>,
    /// Object keys already seen in the document, for change discovery.
    known_keys: Arc<Mutex<HashSet<String>>>,
    /// Per-item coalescing of concurrent download requests.
    in_flight: Arc<Mutex<HashMap<String, InFlight>>>,
    upload_permits: Arc<Semaphore>,
    event_tx: mpsc::UnboundedSender<AudioEvent>,
}

impl AudioSync {
    pub fn new(
        base_url: impl Into<String>,
        room_code: impl Into<String>,
    ) -> (Self, mpsc::UnboundedReceiver<AudioEvent>) {
        let room_code = room_code.into();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let sync = Self {
            store: Arc::new(AudioStore::new(base_url, room_code.clone())),
            room_code,
            cache: Arc::new(Mutex::new(HashMap::new())),
            known_keys: Arc::new(Mutex::new(HashSet::new())),
            in_flight: Arc::new(Mutex::new(HashMap::new())),
            upload_permits: Arc::new(Semaphore::new(AUDIO_UPLOAD_CONCURRENCY)),
            event_tx,
        };
        (sync, event_rx)
    }

    fn cache_key(&self, object_key: &str) -> String {
        format!("{}/{}", self.room_code, object_key)
    }

    /// A clip already downloaded (or uploaded) under this key, if any.
    pub async fn cached(&self, object_key: &str) -> Option<Arc<AudioClip>> {
        self.cache.lock().await.get(&self.cache_key(object_key)).cloned()
    }

    /// Upload a clip for `item_id` in the background. Failures are logged
    /// and swallowed; the document reference stays authoritative either way.
    pub fn upload(&self, item_id: &str, object_key: &str, clip: AudioClip) {
        let store = self.store.clone();
        let cache = self.cache.clone();
        let cache_key = self.cache_key(object_key);
        let item_id = item_id.to_string();
        let bytes = clip.encode();
        let clip = Arc::new(clip);
        tokio::spawn(async move {
            cache.lock().await.insert(cache_key, clip);
            if let Err(e) = store.put(&item_id, bytes).await {
                log::error!("Audio upload for {item_id} failed: {e}");
            }
        });
    }

    /// Bulk re-upload, bounded to a few concurrent transfers. Individual
    /// failures do not abort the batch.
    pub fn upload_all(&self, entries: Vec<(String, String, AudioClip)>) {
        for (item_id, object_key, clip) in entries {
            let store = self.store.clone();
            let cache = self.cache.clone();
            let cache_key = self.cache_key(&object_key);
            let permits = self.upload_permits.clone();
            let bytes = clip.encode();
            let clip = Arc::new(clip);
            tokio::spawn(async move {
                let Ok(_permit) = permits.acquire_owned().await else {
                    return;
                };
                cache.lock().await.insert(cache_key, clip);
                if let Err(e) = store.put(&item_id, bytes).await {
                    log::error!("Audio upload for {item_id} failed: {e}");
                }
            });
        }
    }

    /// Best-effort delete of the stored blob.
    pub fn delete(&self, item_id: &str) {
        let store = self.store.clone();
        let item_id = item_id.to_string();
        tokio::spawn(async move {
            if let Err(e) = store.delete(&item_id).await {
                log::warn!("Audio delete for {item_id} failed: {e}");
            }
        });
    }

    /// Fetch the clip for `item_id` under `object_key`, unless cached.
    ///
    /// Requests for an item with a download already in flight are coalesced:
    /// the in-flight transfer completes, then a single follow-up runs with
    /// the latest requested key.
    pub async fn download(&self, item_id: &str, object_key: &str) {
        if self.cached(object_key).await.is_some() {
            let _ = self.event_tx.send(AudioEvent::Downloaded {
                item_id: item_id.to_string(),
                object_key: object_key.to_string(),
            });
            return;
        }

        {
            let mut in_flight = self.in_flight.lock().await;
            if in_flight.contains_key(item_id) {
                in_flight.insert(
                    item_id.to_string(),
                    InFlight::Superseded(object_key.to_string()),
                );
                return;
            }
            in_flight.insert(item_id.to_string(), InFlight::Running);
        }

        let store = self.store.clone();
        let cache = self.cache.clone();
        let in_flight = self.in_flight.clone();
        let event_tx = self.event_tx.clone();
        let room_code = self.room_code.clone();
        let item_id = item_id.to_string();
        let mut object_key = object_key.to_string();
        tokio::spawn(async move {
            loop {
                let outcome = fetch_with_retries(&store, &item_id).await;
                match outcome {
                    Some(clip) => {
                        let cache_key = format!("{room_code}/{object_key}");
                        cache.lock().await.insert(cache_key, Arc::new(clip));
                        let _ = event_tx.send(AudioEvent::Downloaded {
                            item_id: item_id.clone(),
                            object_key: object_key.clone(),
                        });
                    }
                    None => {
                        let _ = event_tx.send(AudioEvent::DownloadFailed {
                            item_id: item_id.clone(),
                            object_key: object_key.clone(),
                        });
                    }
                }

                let mut guard = in_flight.lock().await;
                match guard.remove(&item_id) {
                    Some(InFlight::Superseded(next_key)) if next_key != object_key => {
                        guard.insert(item_id.clone(), InFlight::Running);
                        object_key = next_key;
                    }
                    _ => break,
                }
            }
        });
    }

    /// Diff the document's object-key map against the locally known set and
    /// fire downloads for anything new. Keys that vanished are forgotten so
    /// a re-added reference triggers a fresh fetch.
    pub async fn observe_doc(&self, doc: &BoardDoc) {
        let current = doc.audio_keys();
        let fresh: Vec<(String, String)> = {
            let mut known = self.known_keys.lock().await;
            let wanted: HashSet<String> = current.values().cloned().collect();
            known.retain(|k| wanted.contains(k));
            current
                .iter()
                .filter(|(_, key)| known.insert((*key).clone()))
                .map(|(item, key)| (item.clone(), key.clone()))
                .collect()
        };
        for (item_id, object_key) in fresh {
            self.download(&item_id, &object_key).await;
        }
    }
}

/// Fetch and decode with bounded retries and exponential backoff.
async fn fetch_with_retries(store: &AudioStore, item_id: &str) -> Option<AudioClip> {
    let mut delay = AUDIO_RETRY_BASE;
    for attempt in 1..=AUDIO_RETRY_LIMIT {
        match store.get(item_id).await {
            Ok(bytes) => match AudioClip::decode(&bytes) {
                Ok(clip) => return Some(clip),
                Err(e) => {
                    log::warn!("Audio blob for {item_id} is malformed: {e}");
                }
            },
            Err(e) => {
                log::debug!(
                    "Audio download for {item_id} failed (attempt {attempt}/{AUDIO_RETRY_LIMIT}): {e}"
                );
            }
        }
        if attempt < AUDIO_RETRY_LIMIT {
            tokio::time::sleep(delay).await;
            delay *= 2;
        }
    }
    log::error!("Audio download for {item_id} gave up after {AUDIO_RETRY_LIMIT} attempts");
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn clip() -> AudioClip {
        AudioClip::new(48_000.0, vec![vec![0.25; 8]]).unwrap()
    }

    #[test]
    fn test_object_url_shape() {
        let store = AudioStore::new("http://127.0.0.1:9090", "abcd1234");
        assert_eq!(
            store.object_url("n1"),
            "http://127.0.0.1:9090/api/rooms/abcd1234/audio/n1"
        );
    }

    #[tokio::test]
    async fn test_cache_is_room_scoped() {
        let (a, _rx_a) = AudioSync::new("http://127.0.0.1:1", "roomaaaa");
        let (b, _rx_b) = AudioSync::new("http://127.0.0.1:1", "roombbbb");
        a.cache
            .lock()
            .await
            .insert(a.cache_key("key1"), Arc::new(clip()));
        assert!(a.cached("key1").await.is_some());
        assert!(b.cached("key1").await.is_none());
    }

    #[tokio::test]
    async fn test_cached_key_skips_fetch() {
        let (sync, mut rx) = AudioSync::new("http://127.0.0.1:1", "roomaaaa");
        sync.cache
            .lock()
            .await
            .insert(sync.cache_key("key1"), Arc::new(clip()));
        sync.download("n1", "key1").await;
        assert_eq!(
            rx.recv().await,
            Some(AudioEvent::Downloaded {
                item_id: "n1".to_string(),
                object_key: "key1".to_string(),
            })
        );
    }

    #[tokio::test]
    async fn test_concurrent_requests_coalesce() {
        let (sync, _rx) = AudioSync::new("http://127.0.0.1:1", "roomaaaa");
        sync.in_flight
            .lock()
            .await
            .insert("n1".to_string(), InFlight::Running);
        // Arrives while one is in flight: queued, not spawned.
        sync.download("n1", "key2").await;
        sync.download("n1", "key3").await;
        let guard = sync.in_flight.lock().await;
        match guard.get("n1") {
            // Only the latest key survives.
            Some(InFlight::Superseded(key)) => assert_eq!(key, "key3"),
            _ => panic!("expected a superseded slot"),
        }
    }

    #[tokio::test]
    async fn test_observe_doc_discovers_new_keys() {
        let (sync, _rx) = AudioSync::new("http://127.0.0.1:1", "roomaaaa");
        let mut doc = BoardDoc::new();
        doc.set_audio_key("n1", "key1").unwrap();
        sync.observe_doc(&doc).await;
        assert!(sync.known_keys.lock().await.contains("key1"));

        // Removed references are forgotten so re-adding refetches.
        doc.clear_audio_key("n1").unwrap();
        sync.observe_doc(&doc).await;
        assert!(sync.known_keys.lock().await.is_empty());
    }
}
