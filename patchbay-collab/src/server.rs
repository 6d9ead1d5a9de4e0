//! HTTP/WebSocket front end.
//!
//! Routes:
//! ```text
//! POST   /api/rooms                          create a room from seed bytes
//! GET    /ws/{roomCode}                      upgrade to the room's socket
//! PUT    /api/rooms/{roomCode}/audio/{item}  store an audio blob
//! GET    /api/rooms/{roomCode}/audio/{item}  fetch an audio blob
//! DELETE /api/rooms/{roomCode}/audio/{item}  drop an audio blob
//! ```
//!
//! Each connected socket is wired to its room actor through an unbounded
//! outbound queue: a writer task drains the queue onto the socket so frame
//! order matches the order the actor emitted them, and the reader loop
//! forwards binary frames as sync messages and text frames as control
//! messages. Rooms are revived lazily from the store when a socket arrives
//! for a code that is persisted but not live.

use axum::{
    extract::{
        ws::{Message, WebSocket},
        DefaultBodyLimit, Path, State, WebSocketUpgrade,
    },
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post, put},
    Json, Router,
};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};

use crate::protocol::{generate_room_code, is_valid_room_code, ControlMessage, MAX_AUDIO_BYTES};
use crate::room::{Outbound, Room, RoomHandle};
use crate::storage::{RoomStore, StoreConfig, StoreError};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub addr: SocketAddr,
    pub data_dir: PathBuf,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            addr: SocketAddr::from(([127, 0, 0, 1], 9090)),
            data_dir: PathBuf::from("patchbay_data"),
        }
    }
}

#[derive(Debug)]
pub enum ServerError {
    Store(StoreError),
    Io(std::io::Error),
}

impl std::fmt::Display for ServerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Store(e) => write!(f, "Store error: {e}"),
            Self::Io(e) => write!(f, "I/O error: {e}"),
        }
    }
}

impl std::error::Error for ServerError {}

impl From<StoreError> for ServerError {
    fn from(e: StoreError) -> Self {
        Self::Store(e)
    }
}

impl From<std::io::Error> for ServerError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

/// Shared server state: live rooms plus the durable store.
pub struct AppState {
    rooms: RwLock<HashMap<String, RoomHandle>>,
    store: Arc<RoomStore>,
}

impl AppState {
    pub fn new(store: Arc<RoomStore>) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            store,
        }
    }

    pub async fn live_room_count(&self) -> usize {
        self.rooms.read().await.len()
    }
}

/// Build the router over shared state.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/rooms", post(create_room))
        .route("/ws/:room_code", get(ws_upgrade))
        .route(
            "/api/rooms/:room_code/audio/:item_id",
            put(put_audio).get(get_audio).delete(delete_audio),
        )
        // The 10MB blob cap is enforced in the handler so oversize uploads
        // get a clean 413 instead of a generic body-limit error.
        .layer(DefaultBodyLimit::max(MAX_AUDIO_BYTES + 64 * 1024))
        .with_state(state)
}

/// Open the store, bind, and serve until the process is killed.
pub async fn run(config: ServerConfig) -> Result<(), ServerError> {
    let store = Arc::new(RoomStore::open(StoreConfig {
        path: config.data_dir.clone(),
        ..StoreConfig::default()
    })?);
    let state = Arc::new(AppState::new(store));
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(config.addr).await?;
    log::info!("Listening on {}", config.addr);
    axum::serve(listener, app).await?;
    Ok(())
}

// ─── Room lifecycle ───────────────────────────────────────────────────

async fn create_room(
    State(state): State<Arc<AppState>>,
    body: axum::body::Bytes,
) -> Result<impl IntoResponse, StatusCode> {
    let mut rooms = state.rooms.write().await;

    let room_code = loop {
        let candidate = generate_room_code();
        let persisted = state.store.room_exists(&candidate).map_err(|e| {
            log::error!("Room-code existence check failed: {e}");
            StatusCode::INTERNAL_SERVER_ERROR
        })?;
        if !persisted && !rooms.contains_key(&candidate) {
            break candidate;
        }
    };

    let mut room = Room::new(&room_code, Some(state.store.clone()));
    room.init(&body).map_err(|e| {
        log::warn!("Rejected room seed: {e}");
        StatusCode::BAD_REQUEST
    })?;
    rooms.insert(room_code.clone(), RoomHandle::spawn(room));

    log::info!("Created room {room_code}");
    Ok(Json(serde_json::json!({ "roomCode": room_code })))
}

/// Live handle for a room code, reviving from the store if needed.
async fn get_or_load(state: &AppState, room_code: &str) -> Option<RoomHandle> {
    if let Some(handle) = state.rooms.read().await.get(room_code) {
        return Some(handle.clone());
    }

    let mut rooms = state.rooms.write().await;
    if let Some(handle) = rooms.get(room_code) {
        return Some(handle.clone());
    }
    let doc_bytes = match state.store.load_doc(room_code) {
        Ok(bytes) => bytes,
        Err(StoreError::NotFound(_)) => return None,
        Err(e) => {
            log::error!("Failed to load room {room_code}: {e}");
            return None;
        }
    };
    let room = match Room::resume(room_code, &doc_bytes, Some(state.store.clone())) {
        Ok(room) => room,
        Err(e) => {
            log::error!("Persisted doc for room {room_code} is unreadable: {e}");
            return None;
        }
    };
    let handle = RoomHandle::spawn(room);
    rooms.insert(room_code.to_string(), handle.clone());
    log::info!("Revived room {room_code} from store");
    Some(handle)
}

// ─── WebSocket wiring ─────────────────────────────────────────────────

async fn ws_upgrade(
    State(state): State<Arc<AppState>>,
    Path(room_code): Path<String>,
    ws: WebSocketUpgrade,
) -> Result<impl IntoResponse, StatusCode> {
    if !is_valid_room_code(&room_code) {
        return Err(StatusCode::BAD_REQUEST);
    }
    let handle = get_or_load(&state, &room_code)
        .await
        .ok_or(StatusCode::NOT_FOUND)?;
    Ok(ws.on_upgrade(move |socket| serve_socket(socket, room_code, handle)))
}

async fn serve_socket(socket: WebSocket, room_code: String, room: RoomHandle) {
    use futures_util::{SinkExt, StreamExt};

    let (mut sink, mut stream) = socket.split();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Outbound>();
    let conn_id = room.accept(out_tx).await;
    log::debug!("Room {room_code}: connection {conn_id} open");

    // Writer: drains the actor's outbound queue in order. Ends when the
    // room drops the sender (connection closed) or the socket dies.
    let writer = tokio::spawn(async move {
        while let Some(out) = out_rx.recv().await {
            let frame = match out {
                Outbound::Sync(bytes) => Message::Binary(bytes),
                Outbound::Control(msg) => match msg.encode() {
                    Ok(text) => Message::Text(text),
                    Err(e) => {
                        log::error!("Failed to encode control message: {e}");
                        continue;
                    }
                },
            };
            if sink.send(frame).await.is_err() {
                break;
            }
        }
    });

    while let Some(frame) = stream.next().await {
        match frame {
            Ok(Message::Binary(bytes)) => room.message(conn_id, bytes).await,
            Ok(Message::Text(text)) => match ControlMessage::decode(&text) {
                Ok(msg) => room.control(conn_id, msg).await,
                Err(e) => log::warn!("Room {room_code}: bad control frame: {e}"),
            },
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => {}
        }
    }

    room.closed(conn_id).await;
    writer.abort();
    log::debug!("Room {room_code}: connection {conn_id} closed");
}

// ─── Audio blobs ──────────────────────────────────────────────────────

async fn put_audio(
    State(state): State<Arc<AppState>>,
    Path((room_code, item_id)): Path<(String, String)>,
    body: axum::body::Bytes,
) -> Result<StatusCode, StatusCode> {
    if !is_valid_room_code(&room_code) {
        return Err(StatusCode::BAD_REQUEST);
    }
    if body.len() > MAX_AUDIO_BYTES {
        return Err(StatusCode::PAYLOAD_TOO_LARGE);
    }
    state
        .store
        .put_audio(&room_code, &item_id, &body)
        .map_err(|e| {
            log::error!("Failed to store audio {room_code}/{item_id}: {e}");
            StatusCode::INTERNAL_SERVER_ERROR
        })?;
    Ok(StatusCode::OK)
}

async fn get_audio(
    State(state): State<Arc<AppState>>,
    Path((room_code, item_id)): Path<(String, String)>,
) -> Result<Vec<u8>, StatusCode> {
    match state.store.get_audio(&room_code, &item_id) {
        Ok(bytes) => Ok(bytes),
        Err(StoreError::NotFound(_)) => Err(StatusCode::NOT_FOUND),
        Err(e) => {
            log::error!("Failed to read audio {room_code}/{item_id}: {e}");
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

async fn delete_audio(
    State(state): State<Arc<AppState>>,
    Path((room_code, item_id)): Path<(String, String)>,
) -> Result<StatusCode, StatusCode> {
    state
        .store
        .delete_audio(&room_code, &item_id)
        .map_err(|e| {
            log::error!("Failed to delete audio {room_code}/{item_id}: {e}");
            StatusCode::INTERNAL_SERVER_ERROR
        })?;
    Ok(StatusCode::NO_CONTENT)
}
