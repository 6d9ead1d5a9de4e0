//! Client sync session: one logical, auto-reconnecting connection to a room.
//!
//! Lifecycle:
//! ```text
//! start ──► connect ──► Connected ──► ping-pong sync ──► close/error
//!   ▲          │ fail                                        │
//!   │          ▼                                             ▼
//!   └──── backoff 2s → 4s → … → 30s cap ◄────────────────────┘
//!                (reset to 2s on every successful open)
//! ```
//!
//! One task owns the socket, the sync cursor, and all outbound writes, so
//! frames hit the wire in issuance order. Local mutations from any number
//! of callers funnel through [`SyncSession::change`], which queues a sync
//! command onto the same task.
//!
//! The joining gate: a session started with `joining = true` sends no sync
//! message until the first inbound one has been applied, so a blank local
//! replica can never pollute an existing room's state.

use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tokio_tungstenite::tungstenite::Message as WsMessage;

use crate::doc::{BoardDoc, DocError, SyncCursor};
use crate::intent::mint_token;
use crate::protocol::{
    unix_millis, ControlMessage, INTENT_OP_DELETE_ITEM, INTENT_TTL, RECONNECT_BASE, RECONNECT_CAP,
};

/// Session connection state, for the status indicator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

/// Events emitted to the owning application.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// Transport established.
    Connected,
    /// Transport lost; reconnection is under way.
    Disconnected,
    /// Remote changes were merged into the shared document.
    DocChanged,
    /// Live connection count in the room.
    ConnectionCount(usize),
    /// A peer triggered playback of an item's clip.
    AudioPlay(String),
}

enum SessionCmd {
    SyncNow,
    ForceResync,
    Control(ControlMessage),
}

/// Next reconnect delay: doubled, capped.
pub(crate) fn next_backoff(current: Duration) -> Duration {
    (current * 2).min(RECONNECT_CAP)
}

/// Whether the session may emit a sync message yet (the joining gate).
pub(crate) fn may_send(joining: bool, received_first: bool) -> bool {
    !joining || received_first
}

/// A client session for one room.
pub struct SyncSession {
    room_code: String,
    ws_url: String,
    joining: bool,
    doc: Arc<Mutex<BoardDoc>>,
    state: Arc<RwLock<ConnectionState>>,
    event_tx: mpsc::Sender<SessionEvent>,
    event_rx: Option<mpsc::Receiver<SessionEvent>>,
    cmd_tx: mpsc::UnboundedSender<SessionCmd>,
    cmd_rx: Option<mpsc::UnboundedReceiver<SessionCmd>>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    task: Option<tokio::task::JoinHandle<()>>,
}

impl SyncSession {
    /// Create a session for `room_code` against a `ws://host:port` base URL.
    ///
    /// `joining` is true when this session joins an existing room via a
    /// share link; false when it is the one deploying the room.
    pub fn new(server_url: impl Into<String>, room_code: impl Into<String>, joining: bool) -> Self {
        let room_code = room_code.into();
        let ws_url = format!("{}/ws/{}", server_url.into(), room_code);
        let (event_tx, event_rx) = mpsc::channel(256);
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            room_code,
            ws_url,
            joining,
            doc: Arc::new(Mutex::new(BoardDoc::new())),
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            event_tx,
            event_rx: Some(event_rx),
            cmd_tx,
            cmd_rx: Some(cmd_rx),
            shutdown_tx,
            shutdown_rx,
            task: None,
        }
    }

    /// Start the session: connects and keeps reconnecting until [`stop`].
    ///
    /// [`stop`]: SyncSession::stop
    pub fn start(&mut self) {
        let Some(cmd_rx) = self.cmd_rx.take() else {
            return; // already started
        };
        let task = tokio::spawn(run_session(
            self.ws_url.clone(),
            self.joining,
            self.doc.clone(),
            self.state.clone(),
            self.event_tx.clone(),
            cmd_rx,
            self.shutdown_rx.clone(),
        ));
        self.task = Some(task);
        log::info!("Session for room {} started", self.room_code);
    }

    /// Stop the session: cancels pending reconnects and closes the socket.
    pub fn stop(&mut self) {
        let _ = self.shutdown_tx.send(true);
        // The task notices the signal at its next await point and exits;
        // dropping the handle detaches rather than aborts.
        drop(self.task.take());
        log::info!("Session for room {} stopped", self.room_code);
    }

    /// Shared handle to the local replica.
    pub fn doc(&self) -> Arc<Mutex<BoardDoc>> {
        self.doc.clone()
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<SessionEvent>> {
        self.event_rx.take()
    }

    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    pub fn room_code(&self) -> &str {
        &self.room_code
    }

    /// Apply a local mutation and schedule a sync message for it.
    pub async fn change<F>(&self, mutate: F) -> Result<(), DocError>
    where
        F: FnOnce(&mut BoardDoc) -> Result<(), DocError>,
    {
        {
            let mut doc = self.doc.lock().await;
            mutate(&mut doc)?;
        }
        let _ = self.cmd_tx.send(SessionCmd::SyncNow);
        Ok(())
    }

    /// Delete an item under a freshly minted destructive intent.
    ///
    /// The intent is announced over the control channel before the document
    /// change that carries the matching token; both travel through the same
    /// ordered command queue.
    pub async fn delete_item(&self, item_id: &str) -> Result<(), DocError> {
        let token = mint_token();
        let _ = self.cmd_tx.send(SessionCmd::Control(
            ControlMessage::DestructiveIntent {
                token: token.clone(),
                op: INTENT_OP_DELETE_ITEM.to_string(),
                item_id: item_id.to_string(),
                expires_at: unix_millis() + INTENT_TTL.as_millis() as u64,
            },
        ));
        let item_id = item_id.to_string();
        self.change(move |doc| doc.remove_item(&item_id, Some(&token)))
            .await
    }

    /// Trigger clip playback on every peer in the room.
    pub fn play_audio(&self, item_id: &str) {
        let _ = self.cmd_tx.send(SessionCmd::Control(ControlMessage::AudioPlay {
            item_id: item_id.to_string(),
        }));
    }

    /// Discard the cursor and resend from scratch. Used when an out-of-band
    /// signal indicates the peer's view may be stale.
    pub fn force_resync(&self) {
        let _ = self.cmd_tx.send(SessionCmd::ForceResync);
    }
}

impl Drop for SyncSession {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
    }
}

/// The session task: reconnect loop around one connected exchange.
async fn run_session(
    ws_url: String,
    joining: bool,
    doc: Arc<Mutex<BoardDoc>>,
    state: Arc<RwLock<ConnectionState>>,
    event_tx: mpsc::Sender<SessionEvent>,
    mut cmd_rx: mpsc::UnboundedReceiver<SessionCmd>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut backoff = RECONNECT_BASE;
    let mut received_first = false;

    loop {
        if *shutdown.borrow() {
            break;
        }

        *state.write().await = ConnectionState::Connecting;
        match tokio_tungstenite::connect_async(ws_url.as_str()).await {
            Ok((ws, _)) => {
                backoff = RECONNECT_BASE;
                *state.write().await = ConnectionState::Connected;
                let _ = event_tx.send(SessionEvent::Connected).await;

                let done = connected_exchange(
                    ws,
                    joining,
                    &doc,
                    &event_tx,
                    &mut cmd_rx,
                    &mut shutdown,
                    &mut received_first,
                )
                .await;

                *state.write().await = ConnectionState::Disconnected;
                if done {
                    break;
                }
                let _ = event_tx.send(SessionEvent::Disconnected).await;
            }
            Err(e) => {
                log::debug!("Connect to {ws_url} failed: {e}");
            }
        }

        // Backoff wait, cancellable by stop().
        *state.write().await = ConnectionState::Reconnecting;
        tokio::select! {
            _ = tokio::time::sleep(backoff) => {}
            res = shutdown.changed() => {
                if res.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
        backoff = next_backoff(backoff);
    }

    *state.write().await = ConnectionState::Disconnected;
}

/// One connected exchange. Returns true when the session was stopped (as
/// opposed to the transport dropping).
async fn connected_exchange(
    ws: tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >,
    joining: bool,
    doc: &Arc<Mutex<BoardDoc>>,
    event_tx: &mpsc::Sender<SessionEvent>,
    cmd_rx: &mut mpsc::UnboundedReceiver<SessionCmd>,
    shutdown: &mut watch::Receiver<bool>,
    received_first: &mut bool,
) -> bool {
    let (mut sink, mut stream) = ws.split();
    // Fresh connection, fresh cursor: the room knows nothing about us yet.
    let mut cursor = SyncCursor::new();

    if may_send(joining, *received_first) {
        let initial = doc.lock().await.generate_sync_message(&mut cursor);
        if let Some(bytes) = initial {
            if sink.send(WsMessage::Binary(bytes.into())).await.is_err() {
                return false;
            }
        }
    }

    loop {
        tokio::select! {
            res = shutdown.changed() => {
                if res.is_err() || *shutdown.borrow() {
                    let _ = sink.close().await;
                    return true;
                }
            }

            cmd = cmd_rx.recv() => match cmd {
                None => {
                    let _ = sink.close().await;
                    return true;
                }
                Some(SessionCmd::SyncNow) => {
                    if may_send(joining, *received_first) {
                        let msg = doc.lock().await.generate_sync_message(&mut cursor);
                        if let Some(bytes) = msg {
                            if sink.send(WsMessage::Binary(bytes.into())).await.is_err() {
                                return false;
                            }
                        }
                    }
                }
                Some(SessionCmd::ForceResync) => {
                    cursor.reset();
                    if may_send(joining, *received_first) {
                        let msg = doc.lock().await.generate_sync_message(&mut cursor);
                        if let Some(bytes) = msg {
                            if sink.send(WsMessage::Binary(bytes.into())).await.is_err() {
                                return false;
                            }
                        }
                    }
                }
                Some(SessionCmd::Control(msg)) => {
                    match msg.encode() {
                        Ok(text) => {
                            if sink.send(WsMessage::Text(text.into())).await.is_err() {
                                return false;
                            }
                        }
                        Err(e) => log::error!("Failed to encode control message: {e}"),
                    }
                }
            },

            frame = stream.next() => match frame {
                Some(Ok(WsMessage::Binary(data))) => {
                    let bytes: Vec<u8> = data.into();
                    let (changed, reply) = {
                        let mut d = doc.lock().await;
                        match d.receive_sync_message(&mut cursor, &bytes) {
                            Ok(()) => {
                                *received_first = true;
                                (true, d.generate_sync_message(&mut cursor))
                            }
                            Err(e) => {
                                // Protocol error: recover by resending from
                                // scratch, never by tearing the session down.
                                log::warn!("Inapplicable sync message: {e}");
                                cursor.reset();
                                (false, d.generate_sync_message(&mut cursor))
                            }
                        }
                    };
                    if changed {
                        let _ = event_tx.send(SessionEvent::DocChanged).await;
                    }
                    if let Some(bytes) = reply {
                        if sink.send(WsMessage::Binary(bytes.into())).await.is_err() {
                            return false;
                        }
                    }
                }
                Some(Ok(WsMessage::Text(text))) => {
                    match ControlMessage::decode(text.as_str()) {
                        Ok(ControlMessage::ConnectionCount { count }) => {
                            let _ = event_tx.send(SessionEvent::ConnectionCount(count)).await;
                        }
                        Ok(ControlMessage::AudioPlay { item_id }) => {
                            let _ = event_tx.send(SessionEvent::AudioPlay(item_id)).await;
                        }
                        Ok(ControlMessage::DestructiveIntent { .. }) => {
                            // Client-to-server only.
                        }
                        Err(e) => log::warn!("Bad control frame: {e}"),
                    }
                }
                Some(Ok(WsMessage::Close(_))) | None => return false,
                Some(Err(e)) => {
                    log::warn!("WebSocket error: {e}");
                    return false;
                }
                Some(Ok(_)) => {}
            },
        }
    }
}
