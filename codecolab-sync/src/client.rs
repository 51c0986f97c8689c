//! WebSocket client for the relay.
//!
//! Provides:
//! - Connection lifecycle with a bounded connect timeout
//! - Explicitly acknowledged join/leave
//! - Edit, cursor and chat sends gated on being joined
//! - Typed events for everything the server relays
//!
//! Only [`CollabClient::connect`] suspends. Every other operation checks
//! the local state, enqueues one frame on a bounded outbound queue and
//! returns. A dropped connection moves the client to `Disconnected` and
//! clears the roster; reconnecting is up to the caller.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use codecolab_core::{CollabError, EditOperation, Result};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_tungstenite::tungstenite::Message;

use crate::protocol::{RosterEntry, WireMessage};

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Upper bound on the WebSocket handshake
    pub connect_timeout: Duration,
    /// Frames queued for the writer task before sends fail
    pub outbound_capacity: usize,
    /// Events buffered for the application
    pub event_capacity: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            outbound_capacity: 256,
            event_capacity: 256,
        }
    }
}

/// Client connection state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientState {
    Disconnected,
    Connecting,
    Connected,
    Joined(String),
    /// Leave sent, waiting for the server's acknowledgement
    Leaving(String),
}

/// Events emitted by the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    Connected,
    Disconnected,
    DocumentJoined {
        document_id: String,
        content: String,
        users: Vec<RosterEntry>,
    },
    DocumentLeft(String),
    EditReceived(EditOperation),
    CursorPositionReceived {
        user_id: String,
        username: String,
        position: usize,
    },
    ChatMessageReceived {
        user_id: String,
        username: String,
        message: String,
    },
    UserConnected {
        user_id: String,
        username: String,
    },
    UserDisconnected(String),
    ContentReceived(String),
    Error {
        code: String,
        message: String,
    },
}

/// State shared with the reader task.
#[derive(Debug)]
struct Shared {
    state: ClientState,
    /// user_id → username of the room members, this client included
    roster: BTreeMap<String, String>,
}

/// The relay client.
pub struct CollabClient {
    user_id: String,
    username: String,
    config: ClientConfig,
    shared: Arc<Mutex<Shared>>,
    /// Bumped per connection so a stale reader cannot clobber a newer one
    epoch: Arc<AtomicU64>,
    outgoing_tx: Option<mpsc::Sender<Message>>,
    event_tx: mpsc::Sender<ClientEvent>,
    event_rx: Option<mpsc::Receiver<ClientEvent>>,
}

impl CollabClient {
    pub fn new(user_id: impl Into<String>, username: impl Into<String>) -> Self {
        Self::with_config(user_id, username, ClientConfig::default())
    }

    pub fn with_config(
        user_id: impl Into<String>,
        username: impl Into<String>,
        config: ClientConfig,
    ) -> Self {
        let (event_tx, event_rx) = mpsc::channel(config.event_capacity.max(1));
        Self {
            user_id: user_id.into(),
            username: username.into(),
            config,
            shared: Arc::new(Mutex::new(Shared {
                state: ClientState::Disconnected,
                roster: BTreeMap::new(),
            })),
            epoch: Arc::new(AtomicU64::new(0)),
            outgoing_tx: None,
            event_tx,
            event_rx: Some(event_rx),
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<ClientEvent>> {
        self.event_rx.take()
    }

    /// Connect to `url`, e.g. `ws://127.0.0.1:8080`.
    ///
    /// Fails with [`CollabError::ConnectionTimeout`] when the handshake does
    /// not finish within `connect_timeout`, and with
    /// [`CollabError::ConnectionError`] when it fails outright.
    pub async fn connect(&mut self, url: &str) -> Result<()> {
        {
            let mut shared = lock(&self.shared);
            if shared.state != ClientState::Disconnected {
                return Err(CollabError::connection("already connected"));
            }
            shared.state = ClientState::Connecting;
        }

        let timeout = self.config.connect_timeout;
        let handshake = tokio::time::timeout(timeout, tokio_tungstenite::connect_async(url)).await;
        let ws_stream = match handshake {
            Ok(Ok((ws_stream, _))) => ws_stream,
            Ok(Err(e)) => {
                lock(&self.shared).state = ClientState::Disconnected;
                return Err(CollabError::connection(e.to_string()));
            }
            Err(_) => {
                lock(&self.shared).state = ClientState::Disconnected;
                return Err(CollabError::ConnectionTimeout(timeout));
            }
        };

        let (mut ws_writer, mut ws_reader) = ws_stream.split();
        let (out_tx, mut out_rx) =
            mpsc::channel::<Message>(self.config.outbound_capacity.max(1));
        self.outgoing_tx = Some(out_tx);

        let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        lock(&self.shared).state = ClientState::Connected;
        log::info!("Connected to {url}");
        let _ = self.event_tx.send(ClientEvent::Connected).await;

        // Writer task: forward the outbound queue to the socket.
        tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                let closing = matches!(msg, Message::Close(_));
                if ws_writer.send(msg).await.is_err() || closing {
                    break;
                }
            }
            let _ = ws_writer.close().await;
        });

        // Reader task: decode frames into events.
        let shared = self.shared.clone();
        let current = self.epoch.clone();
        let event_tx = self.event_tx.clone();
        tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                let text = match msg {
                    Ok(Message::Text(text)) => text,
                    Ok(Message::Close(_)) => break,
                    Ok(_) => continue,
                    Err(e) => {
                        if current.load(Ordering::SeqCst) == epoch {
                            log::warn!("WebSocket error: {e}");
                            let error = CollabError::connection(e.to_string());
                            let _ = event_tx
                                .send(ClientEvent::Error {
                                    code: error.code().to_string(),
                                    message: error.to_string(),
                                })
                                .await;
                        }
                        break;
                    }
                };
                let frame = match WireMessage::decode(text.as_str()) {
                    Ok(frame) => frame,
                    Err(e) => {
                        log::warn!("Dropping frame from server: {e}");
                        continue;
                    }
                };
                if current.load(Ordering::SeqCst) != epoch {
                    return;
                }
                let event = apply_inbound(&mut lock(&shared), frame);
                if let Some(event) = event {
                    let _ = event_tx.send(event).await;
                }
            }

            if current.load(Ordering::SeqCst) == epoch {
                {
                    let mut shared = lock(&shared);
                    shared.state = ClientState::Disconnected;
                    shared.roster.clear();
                }
                log::info!("Connection to server lost");
                let _ = event_tx.send(ClientEvent::Disconnected).await;
            }
        });

        Ok(())
    }

    /// Close the connection. No-op when already disconnected.
    pub fn disconnect(&mut self) {
        let was_connected = {
            let mut shared = lock(&self.shared);
            let was = shared.state != ClientState::Disconnected;
            shared.state = ClientState::Disconnected;
            shared.roster.clear();
            was
        };
        self.epoch.fetch_add(1, Ordering::SeqCst);
        if let Some(tx) = self.outgoing_tx.take() {
            let _ = tx.try_send(Message::Close(None));
        }
        if was_connected {
            log::info!("Disconnected");
            let _ = self.event_tx.try_send(ClientEvent::Disconnected);
        }
    }

    /// Ask to join `document_id`. Valid only while `Connected`;
    /// [`ClientEvent::DocumentJoined`] fires once the server accepts.
    pub fn join_document(&self, document_id: &str) -> Result<()> {
        match self.state() {
            ClientState::Connected => {}
            ClientState::Joined(current) | ClientState::Leaving(current) => {
                return Err(CollabError::AlreadyJoined(current));
            }
            ClientState::Disconnected | ClientState::Connecting => {
                return Err(CollabError::connection("not connected"));
            }
        }
        self.enqueue(&WireMessage::join(document_id, &self.user_id, &self.username))
    }

    /// Leave the joined document. [`ClientEvent::DocumentLeft`] fires on
    /// the server's acknowledgement.
    pub fn leave_document(&self) -> Result<()> {
        let document_id = {
            let mut shared = lock(&self.shared);
            let ClientState::Joined(document_id) = shared.state.clone() else {
                return Err(CollabError::NotJoined);
            };
            // Enter `Leaving` before the frame is queued; the ack may race us.
            shared.state = ClientState::Leaving(document_id.clone());
            document_id
        };

        let sent = self.enqueue(&WireMessage::Leave {
            document_id: document_id.clone(),
            user_id: self.user_id.clone(),
        });
        if sent.is_err() {
            let mut shared = lock(&self.shared);
            if shared.state == ClientState::Leaving(document_id.clone()) {
                shared.state = ClientState::Joined(document_id);
            }
        }
        sent
    }

    pub fn send_edit(
        &self,
        position: usize,
        insertion: impl Into<String>,
        deletion_length: usize,
    ) -> Result<()> {
        let document_id = self.joined_document()?;
        let op =
            EditOperation::new(&self.user_id, document_id, position, insertion, deletion_length);
        self.enqueue(&WireMessage::Edit(op))
    }

    pub fn send_cursor_position(&self, position: usize) -> Result<()> {
        let document_id = self.joined_document()?;
        self.enqueue(&WireMessage::Cursor {
            document_id,
            user_id: self.user_id.clone(),
            username: self.username.clone(),
            position,
        })
    }

    pub fn send_chat_message(&self, message: impl Into<String>) -> Result<()> {
        let document_id = self.joined_document()?;
        self.enqueue(&WireMessage::Chat {
            document_id,
            user_id: self.user_id.clone(),
            username: self.username.clone(),
            message: message.into(),
        })
    }

    /// Re-fetch the room content; answered by [`ClientEvent::ContentReceived`].
    pub fn request_content(&self) -> Result<()> {
        let document_id = self.joined_document()?;
        self.enqueue(&WireMessage::RequestContent { document_id })
    }

    pub fn state(&self) -> ClientState {
        lock(&self.shared).state.clone()
    }

    pub fn is_joined(&self) -> bool {
        matches!(self.state(), ClientState::Joined(_))
    }

    /// Members of the joined document, this client included.
    pub fn roster(&self) -> Vec<RosterEntry> {
        lock(&self.shared)
            .roster
            .iter()
            .map(|(user_id, username)| RosterEntry::new(user_id, username))
            .collect()
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    fn joined_document(&self) -> Result<String> {
        match self.state() {
            ClientState::Joined(document_id) => Ok(document_id),
            _ => Err(CollabError::NotJoined),
        }
    }

    fn enqueue(&self, msg: &WireMessage) -> Result<()> {
        let tx = self
            .outgoing_tx
            .as_ref()
            .ok_or_else(|| CollabError::connection("not connected"))?;
        let text = msg.encode()?;
        tx.try_send(Message::text(text)).map_err(|e| match e {
            TrySendError::Full(_) => CollabError::connection("outbound queue full"),
            TrySendError::Closed(_) => CollabError::connection("connection closed"),
        })
    }
}

fn lock(shared: &Mutex<Shared>) -> MutexGuard<'_, Shared> {
    shared.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Update local state for one inbound frame and map it to an event.
fn apply_inbound(shared: &mut Shared, frame: WireMessage) -> Option<ClientEvent> {
    match frame {
        WireMessage::JoinResponse { success: true, document_id, content, users, .. } => {
            shared.state = ClientState::Joined(document_id.clone());
            shared.roster = users
                .iter()
                .map(|u| (u.user_id.clone(), u.username.clone()))
                .collect();
            Some(ClientEvent::DocumentJoined { document_id, content, users })
        }
        WireMessage::JoinResponse { success: false, code, error, .. } => Some(ClientEvent::Error {
            code: code.unwrap_or_else(|| "join_failed".to_string()),
            message: error.unwrap_or_default(),
        }),
        WireMessage::Left { document_id } => {
            shared.state = ClientState::Connected;
            shared.roster.clear();
            Some(ClientEvent::DocumentLeft(document_id))
        }
        WireMessage::Edit(op) => Some(ClientEvent::EditReceived(op)),
        WireMessage::Cursor { user_id, username, position, .. } => {
            Some(ClientEvent::CursorPositionReceived { user_id, username, position })
        }
        WireMessage::Chat { user_id, username, message, .. } => {
            Some(ClientEvent::ChatMessageReceived { user_id, username, message })
        }
        WireMessage::UserJoined { user_id, username } => {
            shared.roster.insert(user_id.clone(), username.clone());
            Some(ClientEvent::UserConnected { user_id, username })
        }
        WireMessage::UserLeft { user_id } => {
            shared.roster.remove(&user_id);
            Some(ClientEvent::UserDisconnected(user_id))
        }
        WireMessage::Content { content, .. } => Some(ClientEvent::ContentReceived(content)),
        WireMessage::Error { code, message } => Some(ClientEvent::Error { code, message }),
        other => {
            log::warn!("Ignoring client-only {} frame from server", other.kind());
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shared(state: ClientState) -> Shared {
        Shared { state, roster: BTreeMap::new() }
    }

    #[test]
    fn test_client_initial_state() {
        let client = CollabClient::new("u1", "Alice");
        assert_eq!(client.state(), ClientState::Disconnected);
        assert!(client.roster().is_empty());
        assert_eq!(client.user_id(), "u1");
        assert_eq!(client.username(), "Alice");
    }

    #[test]
    fn test_sends_require_join() {
        let client = CollabClient::new("u1", "Alice");
        assert_eq!(client.send_edit(0, "x", 0), Err(CollabError::NotJoined));
        assert_eq!(client.send_cursor_position(3), Err(CollabError::NotJoined));
        assert_eq!(client.send_chat_message("hi"), Err(CollabError::NotJoined));
        assert_eq!(client.request_content(), Err(CollabError::NotJoined));
        assert_eq!(client.leave_document(), Err(CollabError::NotJoined));
    }

    #[test]
    fn test_join_requires_connection() {
        let client = CollabClient::new("u1", "Alice");
        assert!(matches!(client.join_document("doc1"), Err(CollabError::ConnectionError(_))));
    }

    #[test]
    fn test_take_event_rx() {
        let mut client = CollabClient::new("u1", "Alice");
        assert!(client.take_event_rx().is_some());
        assert!(client.take_event_rx().is_none());
    }

    #[test]
    fn test_disconnect_when_idle_is_silent() {
        let mut client = CollabClient::new("u1", "Alice");
        let mut events = client.take_event_rx().unwrap();
        client.disconnect();
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn test_join_ack_sets_state_and_roster() {
        let mut s = shared(ClientState::Connected);
        let event = apply_inbound(
            &mut s,
            WireMessage::join_accepted("doc1", "body", vec![RosterEntry::new("u2", "Bob")]),
        );
        assert_eq!(s.state, ClientState::Joined("doc1".into()));
        assert_eq!(s.roster.get("u2").map(String::as_str), Some("Bob"));
        assert!(matches!(
            event,
            Some(ClientEvent::DocumentJoined { ref content, .. }) if content == "body"
        ));
    }

    #[test]
    fn test_join_rejection_keeps_connected() {
        let mut s = shared(ClientState::Connected);
        let rejection = WireMessage::join_rejected("doc1", &CollabError::AlreadyJoined("x".into()));
        let event = apply_inbound(&mut s, rejection);
        assert_eq!(s.state, ClientState::Connected);
        assert!(matches!(
            event,
            Some(ClientEvent::Error { ref code, .. }) if code == "already_joined"
        ));
    }

    #[test]
    fn test_roster_tracks_presence() {
        let mut s = shared(ClientState::Joined("doc1".into()));
        apply_inbound(
            &mut s,
            WireMessage::UserJoined { user_id: "u2".into(), username: "Bob".into() },
        );
        assert_eq!(s.roster.len(), 1);
        let event = apply_inbound(&mut s, WireMessage::UserLeft { user_id: "u2".into() });
        assert!(s.roster.is_empty());
        assert_eq!(event, Some(ClientEvent::UserDisconnected("u2".into())));
    }

    #[test]
    fn test_left_ack_returns_to_connected() {
        let mut s = shared(ClientState::Leaving("doc1".into()));
        s.roster.insert("u2".into(), "Bob".into());
        let event = apply_inbound(&mut s, WireMessage::Left { document_id: "doc1".into() });
        assert_eq!(s.state, ClientState::Connected);
        assert!(s.roster.is_empty());
        assert_eq!(event, Some(ClientEvent::DocumentLeft("doc1".into())));
    }

    #[test]
    fn test_relayed_messages_map_to_events() {
        let mut s = shared(ClientState::Joined("doc1".into()));
        let op = EditOperation::new("u2", "doc1", 1, "x", 0);
        assert_eq!(
            apply_inbound(&mut s, WireMessage::Edit(op.clone())),
            Some(ClientEvent::EditReceived(op))
        );
        assert_eq!(
            apply_inbound(
                &mut s,
                WireMessage::Content { document_id: "doc1".into(), content: "abc".into() }
            ),
            Some(ClientEvent::ContentReceived("abc".into()))
        );
        assert_eq!(apply_inbound(&mut s, WireMessage::join("d", "u", "n")), None);
    }

    fn joined_client(outbound: Option<mpsc::Sender<Message>>) -> CollabClient {
        let mut client = CollabClient::new("u1", "Alice");
        lock(&client.shared).state = ClientState::Joined("doc1".into());
        client.outgoing_tx = outbound;
        client
    }

    #[test]
    fn test_leave_enters_leaving_before_ack() {
        let (tx, mut rx) = mpsc::channel(4);
        let client = joined_client(Some(tx));

        client.leave_document().unwrap();
        assert_eq!(client.state(), ClientState::Leaving("doc1".into()));
        assert!(matches!(rx.try_recv(), Ok(Message::Text(_))));

        // The ack lands right after the send; nothing may undo it.
        apply_inbound(&mut lock(&client.shared), WireMessage::Left { document_id: "doc1".into() });
        assert_eq!(client.state(), ClientState::Connected);
        assert!(client.join_document("doc2").is_ok());
    }

    #[test]
    fn test_failed_leave_stays_joined() {
        let client = joined_client(None);
        assert!(matches!(client.leave_document(), Err(CollabError::ConnectionError(_))));
        assert_eq!(client.state(), ClientState::Joined("doc1".into()));

        let (tx, _rx) = mpsc::channel(1);
        tx.try_send(Message::text("queued")).unwrap();
        let client = joined_client(Some(tx));
        assert!(matches!(client.leave_document(), Err(CollabError::ConnectionError(_))));
        assert_eq!(client.state(), ClientState::Joined("doc1".into()));
        assert!(client.is_joined());
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let mut client = CollabClient::new("u1", "Alice");
        let err = client.connect(&format!("ws://127.0.0.1:{port}")).await.unwrap_err();
        assert!(matches!(err, CollabError::ConnectionError(_)));
        assert_eq!(client.state(), ClientState::Disconnected);
    }
}
