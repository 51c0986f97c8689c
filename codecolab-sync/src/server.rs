//! WebSocket relay server with room-based document routing.
//!
//! Architecture:
//! ```text
//! Client A ──┐                       ┌── SessionDirectory (one RwLock)
//!             ├── connection task ───┤      sessions / rooms / storage
//! Client B ──┘   (select! loop)      └── DocumentRoom ── BroadcastGroup
//!                     ▲                                      │
//!                     └──────────── RoomFrame (origin) ◄─────┘
//! ```
//!
//! Each connection runs one task that multiplexes its socket with its
//! room's broadcast receiver. Replies (join/leave acks, errors, content)
//! go straight back on the socket; relayed traffic goes through the room.
//! Disconnect without an explicit leave performs the same teardown.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use codecolab_core::{CollabError, DocumentSnapshot, DocumentStorage, FileStorage, StorageError};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::WebSocketStream;

use crate::broadcast::{ConnectionId, RoomFrame};
use crate::protocol::{WireError, WireMessage};
use crate::session::{load_room_document, RoomDocument, SessionDirectory};

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;
type WsSource = SplitStream<WebSocketStream<TcpStream>>;
type RoomReceiver = broadcast::Receiver<Arc<RoomFrame>>;
type SnapshotSender = mpsc::Sender<DocumentSnapshot>;

/// Closed-room snapshots queued for the writer task.
const SAVE_QUEUE_CAPACITY: usize = 64;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Maximum peers per room
    pub max_peers_per_room: usize,
    /// Frames buffered per member before a lagging member is dropped
    pub broadcast_capacity: usize,
    /// Snapshot directory (None = open rooms only, nothing persisted)
    pub storage_path: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8080".to_string(),
            max_peers_per_room: 100,
            broadcast_capacity: 256,
            storage_path: None,
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub malformed_frames: u64,
    pub lagged_disconnects: u64,
    pub active_rooms: usize,
}

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Wire(#[from] WireError),
}

/// The relay server.
pub struct SyncServer {
    config: ServerConfig,
    directory: Arc<RwLock<SessionDirectory>>,
    stats: Arc<RwLock<ServerStats>>,
}

impl SyncServer {
    /// Create a server, opening file storage when `storage_path` is set.
    pub fn new(config: ServerConfig) -> Result<Self, ServerError> {
        let storage = match &config.storage_path {
            Some(path) => {
                let store: Arc<dyn DocumentStorage> = Arc::new(FileStorage::open(path)?);
                Some(store)
            }
            None => None,
        };
        Ok(Self::with_storage(config, storage))
    }

    /// Create a server over an already opened storage backend.
    pub fn with_storage(config: ServerConfig, storage: Option<Arc<dyn DocumentStorage>>) -> Self {
        let directory = SessionDirectory::new(
            config.broadcast_capacity,
            config.max_peers_per_room,
            storage,
        );
        Self {
            config,
            directory: Arc::new(RwLock::new(directory)),
            stats: Arc::new(RwLock::new(ServerStats::default())),
        }
    }

    /// In-memory server with default configuration.
    pub fn with_defaults() -> Self {
        Self::with_storage(ServerConfig::default(), None)
    }

    /// Bind `bind_addr` and serve until the listener fails.
    pub async fn run(&self) -> Result<(), ServerError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Relay listening on {}", self.config.bind_addr);
        self.serve(listener).await
    }

    /// Accept connections from an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), ServerError> {
        let (saves, pending) = mpsc::channel(SAVE_QUEUE_CAPACITY);
        tokio::spawn(Self::write_snapshots(pending, self.directory.clone()));

        loop {
            let (stream, addr) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    log::warn!("Accept failed: {e}");
                    continue;
                }
            };
            log::debug!("New TCP connection from {addr}");

            let directory = self.directory.clone();
            let stats = self.stats.clone();
            let saves = saves.clone();
            tokio::spawn(async move {
                let handled =
                    Self::handle_connection(stream, addr, directory, stats, saves).await;
                if let Err(e) = handled {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    /// Handle a single WebSocket connection.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        directory: Arc<RwLock<SessionDirectory>>,
        stats: Arc<RwLock<ServerStats>>,
        saves: SnapshotSender,
    ) -> Result<(), ServerError> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        let connection = ConnectionId::new();

        log::info!("Connection {connection} established from {addr}");
        {
            let mut s = stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        let result = Self::pump(
            connection,
            &mut ws_sender,
            &mut ws_receiver,
            &directory,
            &stats,
            &saves,
        )
        .await;

        // Teardown runs whether the peer left cleanly or vanished.
        Self::teardown(connection, &directory, &stats, &saves).await;
        log::info!("Connection {connection} closed");

        result
    }

    /// Leave the connection's room, if any, and release its stats slot.
    async fn teardown(
        connection: ConnectionId,
        directory: &RwLock<SessionDirectory>,
        stats: &RwLock<ServerStats>,
        saves: &SnapshotSender,
    ) {
        let (left, rooms) = {
            let mut dir = directory.write().await;
            (dir.leave(connection), dir.room_count())
        };
        if let Some(outcome) = left {
            log::info!(
                "{} ({}) disconnected from {}",
                outcome.session.username,
                outcome.session.user_id,
                outcome.session.document_id
            );
            Self::queue_save(saves, outcome.snapshot).await;
        }

        let mut s = stats.write().await;
        s.active_connections = s.active_connections.saturating_sub(1);
        s.active_rooms = rooms;
    }

    async fn pump(
        connection: ConnectionId,
        ws_sender: &mut WsSink,
        ws_receiver: &mut WsSource,
        directory: &RwLock<SessionDirectory>,
        stats: &RwLock<ServerStats>,
        saves: &SnapshotSender,
    ) -> Result<(), ServerError> {
        let mut room_rx: Option<RoomReceiver> = None;

        loop {
            tokio::select! {
                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            {
                                let mut s = stats.write().await;
                                s.total_messages += 1;
                                s.total_bytes += text.len() as u64;
                            }
                            let frame = match WireMessage::decode(text.as_str()) {
                                Ok(frame) => frame,
                                Err(e) => {
                                    log::warn!("Dropping frame from {connection}: {e}");
                                    stats.write().await.malformed_frames += 1;
                                    continue;
                                }
                            };
                            let reply = Self::dispatch(
                                connection,
                                frame,
                                directory,
                                stats,
                                saves,
                                &mut room_rx,
                            )
                            .await;
                            if let Some(reply) = reply {
                                Self::send(ws_sender, &reply).await?;
                            }
                        }

                        Some(Ok(Message::Binary(data))) => {
                            let e = WireError::Binary(data.len());
                            log::warn!("Dropping frame from {connection}: {e}");
                            stats.write().await.malformed_frames += 1;
                        }

                        Some(Ok(Message::Ping(data))) => {
                            ws_sender.send(Message::Pong(data)).await?;
                        }

                        Some(Ok(Message::Close(_))) | None => {
                            log::debug!("Connection {connection} closed by peer");
                            break;
                        }

                        Some(Err(e)) => {
                            log::warn!("WebSocket error on {connection}: {e}");
                            break;
                        }

                        Some(Ok(_)) => {}
                    }
                }

                received = recv_room(&mut room_rx) => {
                    match Self::room_step(connection, received, directory, stats).await {
                        RoomStep::Forward(text) => {
                            ws_sender.send(Message::text(text)).await?;
                        }
                        RoomStep::Skip => {}
                        RoomStep::Disconnect => break,
                        RoomStep::Closed => room_rx = None,
                    }
                }
            }
        }

        Ok(())
    }

    /// Decide what to do with one receive from the connection's room.
    ///
    /// A member that lagged past the room's buffer is disconnected rather
    /// than resynchronised.
    async fn room_step(
        connection: ConnectionId,
        received: Result<Arc<RoomFrame>, RecvError>,
        directory: &RwLock<SessionDirectory>,
        stats: &RwLock<ServerStats>,
    ) -> RoomStep {
        match received {
            Ok(frame) if frame.is_for(connection) => RoomStep::Forward(frame.text.clone()),
            Ok(_) => RoomStep::Skip,
            Err(RecvError::Lagged(n)) => {
                log::warn!("Connection {connection} lagged by {n} frames, dropping it");
                {
                    let dir = directory.read().await;
                    if let Some(session) = dir.session(connection) {
                        dir.record_dropped(&session.document_id, n);
                    }
                }
                stats.write().await.lagged_disconnects += 1;
                RoomStep::Disconnect
            }
            Err(RecvError::Closed) => RoomStep::Closed,
        }
    }

    /// Act on one decoded frame. Returns the reply for the sender, if any.
    async fn dispatch(
        connection: ConnectionId,
        frame: WireMessage,
        directory: &RwLock<SessionDirectory>,
        stats: &RwLock<ServerStats>,
        saves: &SnapshotSender,
        room_rx: &mut Option<RoomReceiver>,
    ) -> Option<WireMessage> {
        match frame {
            WireMessage::Join { document_id, user_id, username } => {
                // Storage is read before taking the write lock.
                let ticket = directory.read().await.load_ticket(connection, &document_id);
                let preloaded = match ticket {
                    Some(ticket) => {
                        let loaded =
                            load_off_lock(ticket.storage.clone(), document_id.clone()).await;
                        Some((ticket, loaded))
                    }
                    None => None,
                };

                let (joined, rooms) = {
                    let mut dir = directory.write().await;
                    let joined = match preloaded {
                        Some((ticket, loaded)) => dir.join_preloaded(
                            connection,
                            &document_id,
                            &user_id,
                            &username,
                            ticket,
                            loaded,
                        ),
                        None => dir.join(connection, &document_id, &user_id, &username),
                    };
                    (joined, dir.room_count())
                };
                stats.write().await.active_rooms = rooms;
                match joined {
                    Ok(outcome) => {
                        log::info!("{username} ({user_id}) joined {document_id}");
                        *room_rx = Some(outcome.receiver);
                        Some(WireMessage::join_accepted(
                            outcome.document_id,
                            outcome.content,
                            outcome.users,
                        ))
                    }
                    Err(e) => {
                        log::info!("Join of {user_id} to {document_id} rejected: {e}");
                        Some(WireMessage::join_rejected(document_id, &e))
                    }
                }
            }

            WireMessage::Leave { .. } => {
                let (left, rooms) = {
                    let mut dir = directory.write().await;
                    (dir.leave(connection), dir.room_count())
                };
                stats.write().await.active_rooms = rooms;
                match left {
                    Some(outcome) => {
                        let session = &outcome.session;
                        log::info!("{} left {}", session.user_id, session.document_id);
                        *room_rx = None;
                        Self::queue_save(saves, outcome.snapshot).await;
                        Some(WireMessage::Left { document_id: outcome.session.document_id })
                    }
                    None => Some(WireMessage::error(&CollabError::NotJoined)),
                }
            }

            WireMessage::Edit(op) => {
                let relayed = directory.write().await.relay_edit(connection, op);
                Self::relay_outcome(connection, "edit", relayed)
            }

            WireMessage::Cursor { position, .. } => {
                let relayed = directory.read().await.relay_cursor(connection, position);
                Self::relay_outcome(connection, "cursor", relayed)
            }

            WireMessage::Chat { message, .. } => {
                let relayed = directory.read().await.relay_chat(connection, message);
                Self::relay_outcome(connection, "chat", relayed)
            }

            WireMessage::RequestContent { .. } => {
                let content = directory.read().await.content(connection);
                Some(content.unwrap_or_else(|e| WireMessage::error(&e)))
            }

            other => {
                log::warn!("Ignoring server-only {} frame from {connection}", other.kind());
                None
            }
        }
    }

    fn relay_outcome(
        connection: ConnectionId,
        kind: &str,
        relayed: Result<usize, CollabError>,
    ) -> Option<WireMessage> {
        match relayed {
            Ok(receivers) => {
                log::trace!("Relayed {kind} from {connection} to {receivers} receivers");
                None
            }
            Err(e) => {
                log::debug!("Rejected {kind} from {connection}: {e}");
                Some(WireMessage::error(&e))
            }
        }
    }

    async fn queue_save(saves: &SnapshotSender, snapshot: Option<DocumentSnapshot>) {
        let Some(snapshot) = snapshot else {
            return;
        };
        if let Err(e) = saves.send(snapshot).await {
            log::error!("Snapshot writer stopped, {} not saved", e.0.id);
        }
    }

    /// Write closed rooms back to storage one at a time, off the
    /// directory lock.
    async fn write_snapshots(
        mut pending: mpsc::Receiver<DocumentSnapshot>,
        directory: Arc<RwLock<SessionDirectory>>,
    ) {
        while let Some(snapshot) = pending.recv().await {
            let Some(storage) = directory.read().await.storage() else {
                continue;
            };
            let document_id = snapshot.id.clone();
            let written = snapshot.clone();
            match tokio::task::spawn_blocking(move || storage.save(&written)).await {
                Ok(Ok(())) => log::info!("Persisted document {document_id} (room closed)"),
                Ok(Err(e)) => log::error!("Failed to persist document {document_id}: {e}"),
                Err(e) => log::error!("Persist task for {document_id} failed: {e}"),
            }
            directory.write().await.snapshot_saved(&snapshot);
        }
    }

    async fn send(ws_sender: &mut WsSink, msg: &WireMessage) -> Result<(), ServerError> {
        ws_sender.send(Message::text(msg.encode()?)).await?;
        Ok(())
    }

    /// Get server statistics.
    pub async fn stats(&self) -> ServerStats {
        self.stats.read().await.clone()
    }

    /// Shared session directory.
    pub fn directory(&self) -> &Arc<RwLock<SessionDirectory>> {
        &self.directory
    }

    /// Get the configured bind address.
    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }
}

/// What a connection does with one receive from its room.
#[derive(Debug, PartialEq, Eq)]
enum RoomStep {
    Forward(String),
    Skip,
    Disconnect,
    Closed,
}

/// Read a room document on the blocking pool.
async fn load_off_lock(
    storage: Arc<dyn DocumentStorage>,
    document_id: String,
) -> Result<RoomDocument, CollabError> {
    let reading = document_id.clone();
    tokio::task::spawn_blocking(move || load_room_document(Some(storage.as_ref()), &reading))
        .await
        .unwrap_or_else(|e| {
            log::error!("Load task for {document_id} failed: {e}");
            Err(CollabError::NotFound(document_id))
        })
}

/// Next frame from the room, or pending forever while not joined.
async fn recv_room(room_rx: &mut Option<RoomReceiver>) -> Result<Arc<RoomFrame>, RecvError> {
    match room_rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}
