//! Session directory: which connection is joined to which document room.
//!
//! All join/leave/relay bookkeeping happens here, behind the server's
//! single write lock, so membership changes and fan-out are serialized.
//! Fan-out itself is a non-blocking broadcast send; a slow peer never
//! stalls the relay.
//!
//! ```text
//! sessions: ConnectionId ──► Session { user_id, username, document_id }
//! rooms:    document_id  ──► DocumentRoom { members, content, BroadcastGroup }
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use codecolab_core::{
    apply_patch, AccessLevel, CollabError, Document, DocumentSnapshot, DocumentStorage,
    EditOperation, Result, StorageError,
};
use tokio::sync::broadcast;

use crate::broadcast::{BroadcastGroup, BroadcastStats, ConnectionId, RoomFrame};
use crate::protocol::{RosterEntry, WireMessage};

/// A joined connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub user_id: String,
    pub username: String,
    pub document_id: String,
}

/// Authoritative content of a room.
#[derive(Debug)]
pub enum RoomDocument {
    /// No stored snapshot: anyone may join and edit.
    Open { content: String },
    /// Backed by a stored snapshot whose access table gates the room.
    Stored { document: Document, owner_name: String },
}

impl RoomDocument {
    pub fn content(&self) -> &str {
        match self {
            Self::Open { content } => content,
            Self::Stored { document, .. } => document.content(),
        }
    }

    pub fn access_level(&self, user_id: &str) -> AccessLevel {
        match self {
            Self::Open { .. } => AccessLevel::Edit,
            Self::Stored { document, .. } => document.access_level(user_id),
        }
    }

    fn apply(&mut self, op: &EditOperation) -> Result<()> {
        match self {
            Self::Open { content } => {
                *content = apply_patch(content, op)?.content;
                Ok(())
            }
            Self::Stored { document, .. } => document.apply_edit(op).map(|_| ()),
        }
    }
}

/// Members, content and fan-out channel of one document.
#[derive(Debug)]
pub struct DocumentRoom {
    document: RoomDocument,
    /// Join order is kept for the roster
    members: Vec<(ConnectionId, RosterEntry)>,
    broadcast: BroadcastGroup,
}

impl DocumentRoom {
    fn new(document: RoomDocument, capacity: usize) -> Self {
        Self {
            document,
            members: Vec::new(),
            broadcast: BroadcastGroup::new(capacity),
        }
    }

    fn roster(&self) -> Vec<RosterEntry> {
        self.members.iter().map(|(_, entry)| entry.clone()).collect()
    }

    fn announce(&self, origin: ConnectionId, msg: &WireMessage) {
        if let Err(e) = self.broadcast.broadcast(Some(origin), msg) {
            log::error!("Failed to encode {} notification: {e}", msg.kind());
        }
    }
}

/// Everything a connection needs after a successful join.
#[derive(Debug)]
pub struct JoinOutcome {
    pub document_id: String,
    pub content: String,
    pub users: Vec<RosterEntry>,
    pub receiver: broadcast::Receiver<Arc<RoomFrame>>,
}

/// Result of tearing down a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaveOutcome {
    pub session: Session,
    /// The room had no members left and was closed
    pub room_closed: bool,
    /// Content of a closed stored room, to be written back
    pub snapshot: Option<DocumentSnapshot>,
}

/// Permission to load a stored document outside the directory lock.
///
/// Redeemed by [`SessionDirectory::join_preloaded`]; a ticket issued before
/// a stored room closed is stale and its load is discarded.
#[derive(Clone)]
pub struct LoadTicket {
    pub storage: Arc<dyn DocumentStorage>,
    generation: u64,
}

impl std::fmt::Debug for LoadTicket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadTicket").field("generation", &self.generation).finish()
    }
}

pub struct SessionDirectory {
    sessions: HashMap<ConnectionId, Session>,
    rooms: HashMap<String, DocumentRoom>,
    storage: Option<Arc<dyn DocumentStorage>>,
    /// Snapshots of closed rooms not yet confirmed written
    pending_saves: HashMap<String, DocumentSnapshot>,
    /// Bumped whenever a stored room closes
    generation: u64,
    broadcast_capacity: usize,
    max_peers_per_room: usize,
}

impl SessionDirectory {
    pub fn new(
        broadcast_capacity: usize,
        max_peers_per_room: usize,
        storage: Option<Arc<dyn DocumentStorage>>,
    ) -> Self {
        Self {
            sessions: HashMap::new(),
            rooms: HashMap::new(),
            storage,
            pending_saves: HashMap::new(),
            generation: 0,
            broadcast_capacity,
            max_peers_per_room,
        }
    }

    /// A ticket when joining `document_id` would read storage: the
    /// connection is not joined yet and no room or pending snapshot exists.
    pub fn load_ticket(&self, connection: ConnectionId, document_id: &str) -> Option<LoadTicket> {
        let storage = self.storage.as_ref()?;
        if self.sessions.contains_key(&connection)
            || document_id.is_empty()
            || self.rooms.contains_key(document_id)
            || self.pending_saves.contains_key(document_id)
        {
            return None;
        }
        Some(LoadTicket { storage: storage.clone(), generation: self.generation })
    }

    /// Join `connection` to `document_id`.
    ///
    /// Announces `user_joined` to the existing members before subscribing
    /// the newcomer, so the newcomer never sees its own announcement.
    pub fn join(
        &mut self,
        connection: ConnectionId,
        document_id: &str,
        user_id: &str,
        username: &str,
    ) -> Result<JoinOutcome> {
        self.join_with(connection, document_id, user_id, username, None)
    }

    /// [`SessionDirectory::join`] with the room document loaded beforehand
    /// under `ticket`. The load is ignored when the room opened meanwhile,
    /// and reloaded inline when the ticket went stale.
    pub fn join_preloaded(
        &mut self,
        connection: ConnectionId,
        document_id: &str,
        user_id: &str,
        username: &str,
        ticket: LoadTicket,
        loaded: Result<RoomDocument>,
    ) -> Result<JoinOutcome> {
        let loaded = if ticket.generation == self.generation {
            Some(loaded)
        } else {
            log::debug!("Discarding stale load of {document_id}");
            None
        };
        self.join_with(connection, document_id, user_id, username, loaded)
    }

    fn join_with(
        &mut self,
        connection: ConnectionId,
        document_id: &str,
        user_id: &str,
        username: &str,
        loaded: Option<Result<RoomDocument>>,
    ) -> Result<JoinOutcome> {
        if let Some(session) = self.sessions.get(&connection) {
            return Err(CollabError::AlreadyJoined(session.document_id.clone()));
        }
        if document_id.is_empty() || user_id.is_empty() {
            return Err(CollabError::protocol("join requires documentId and userId"));
        }

        if !self.rooms.contains_key(document_id) {
            let document = match (self.pending_saves.get(document_id), loaded) {
                (Some(snapshot), _) => stored_room(snapshot.clone()),
                (None, Some(loaded)) => loaded?,
                (None, None) => load_room_document(self.storage.as_deref(), document_id)?,
            };
            self.rooms.insert(
                document_id.to_string(),
                DocumentRoom::new(document, self.broadcast_capacity),
            );
        }
        let Some(room) = self.rooms.get_mut(document_id) else {
            return Err(CollabError::NotFound(document_id.to_string()));
        };

        let admission = if !room.document.access_level(user_id).can_read() {
            Err(CollabError::PermissionDenied {
                user_id: user_id.to_string(),
                document_id: document_id.to_string(),
                required: AccessLevel::ReadOnly,
            })
        } else if room.members.len() >= self.max_peers_per_room {
            Err(CollabError::protocol(format!(
                "document '{document_id}' already has {} members",
                room.members.len()
            )))
        } else {
            Ok(())
        };
        if let Err(e) = admission {
            if room.members.is_empty() {
                self.rooms.remove(document_id);
            }
            return Err(e);
        }

        room.announce(
            connection,
            &WireMessage::UserJoined {
                user_id: user_id.to_string(),
                username: username.to_string(),
            },
        );
        let receiver = room.broadcast.subscribe();
        room.members.push((connection, RosterEntry::new(user_id, username)));

        self.sessions.insert(
            connection,
            Session {
                user_id: user_id.to_string(),
                username: username.to_string(),
                document_id: document_id.to_string(),
            },
        );

        Ok(JoinOutcome {
            document_id: document_id.to_string(),
            content: room.document.content().to_string(),
            users: room.roster(),
            receiver,
        })
    }

    /// Tear down `connection`'s session. Explicit leave and disconnect both
    /// land here; a second call for the same connection returns `None`.
    pub fn leave(&mut self, connection: ConnectionId) -> Option<LeaveOutcome> {
        let session = self.sessions.remove(&connection)?;

        let mut room_closed = false;
        let mut snapshot = None;
        if let Some(room) = self.rooms.get_mut(&session.document_id) {
            room.members.retain(|(member, _)| *member != connection);
            room.announce(
                connection,
                &WireMessage::UserLeft { user_id: session.user_id.clone() },
            );
            room_closed = room.members.is_empty();
        }

        if room_closed {
            if let Some(RoomDocument::Stored { document, owner_name }) =
                self.rooms.remove(&session.document_id).map(|room| room.document)
            {
                let captured = DocumentSnapshot::capture(&document, owner_name);
                self.pending_saves.insert(session.document_id.clone(), captured.clone());
                self.generation += 1;
                snapshot = Some(captured);
            }
            log::info!("Room {} closed (empty)", session.document_id);
        }

        Some(LeaveOutcome { session, room_closed, snapshot })
    }

    /// Forget a pending snapshot once it has been written, unless a newer
    /// one replaced it.
    pub fn snapshot_saved(&mut self, snapshot: &DocumentSnapshot) {
        if self.pending_saves.get(&snapshot.id) == Some(snapshot) {
            self.pending_saves.remove(&snapshot.id);
        }
    }

    pub fn pending_save_count(&self) -> usize {
        self.pending_saves.len()
    }

    pub fn storage(&self) -> Option<Arc<dyn DocumentStorage>> {
        self.storage.clone()
    }

    /// Apply `op` to the sender's room and relay it to the other members.
    ///
    /// Identity fields are overwritten from the session. Rejected edits are
    /// neither applied nor relayed.
    pub fn relay_edit(&mut self, connection: ConnectionId, mut op: EditOperation) -> Result<usize> {
        let session = self.sessions.get(&connection).ok_or_else(|| not_joined("edit"))?;
        op.user_id = session.user_id.clone();
        op.document_id = session.document_id.clone();

        let room = self
            .rooms
            .get_mut(&session.document_id)
            .ok_or_else(|| CollabError::NotFound(session.document_id.clone()))?;
        room.document.apply(&op)?;
        Ok(room.broadcast.broadcast(Some(connection), &WireMessage::Edit(op))?)
    }

    pub fn relay_cursor(&self, connection: ConnectionId, position: usize) -> Result<usize> {
        let (session, room) = self.joined(connection, "cursor")?;
        let msg = WireMessage::Cursor {
            document_id: session.document_id.clone(),
            user_id: session.user_id.clone(),
            username: session.username.clone(),
            position,
        };
        Ok(room.broadcast.broadcast(Some(connection), &msg)?)
    }

    pub fn relay_chat(&self, connection: ConnectionId, message: String) -> Result<usize> {
        let (session, room) = self.joined(connection, "chat")?;
        let msg = WireMessage::Chat {
            document_id: session.document_id.clone(),
            user_id: session.user_id.clone(),
            username: session.username.clone(),
            message,
        };
        Ok(room.broadcast.broadcast(Some(connection), &msg)?)
    }

    /// Current content of the sender's room as a `content` reply.
    pub fn content(&self, connection: ConnectionId) -> Result<WireMessage> {
        let (session, room) = self.joined(connection, "request_content")?;
        Ok(WireMessage::Content {
            document_id: session.document_id.clone(),
            content: room.document.content().to_string(),
        })
    }

    pub fn session(&self, connection: ConnectionId) -> Option<&Session> {
        self.sessions.get(&connection)
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    pub fn room_members(&self, document_id: &str) -> Option<Vec<RosterEntry>> {
        self.rooms.get(document_id).map(DocumentRoom::roster)
    }

    pub fn room_content(&self, document_id: &str) -> Option<&str> {
        self.rooms.get(document_id).map(|r| r.document.content())
    }

    pub fn room_stats(&self, document_id: &str) -> Option<BroadcastStats> {
        self.rooms.get(document_id).map(|r| r.broadcast.stats())
    }

    pub fn record_dropped(&self, document_id: &str, frames: u64) {
        if let Some(room) = self.rooms.get(document_id) {
            room.broadcast.record_dropped(frames);
        }
    }

    fn joined(&self, connection: ConnectionId, what: &str) -> Result<(&Session, &DocumentRoom)> {
        let session = self.sessions.get(&connection).ok_or_else(|| not_joined(what))?;
        let room = self
            .rooms
            .get(&session.document_id)
            .ok_or_else(|| CollabError::NotFound(session.document_id.clone()))?;
        Ok((session, room))
    }

}

impl std::fmt::Debug for SessionDirectory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionDirectory")
            .field("sessions", &self.sessions.len())
            .field("rooms", &self.rooms.len())
            .field("storage", &self.storage.is_some())
            .finish()
    }
}

fn not_joined(what: &str) -> CollabError {
    CollabError::protocol(format!("{what} sent before joining a document"))
}

fn stored_room(snapshot: DocumentSnapshot) -> RoomDocument {
    let owner_name = snapshot.owner_name.clone();
    RoomDocument::Stored { document: snapshot.into_document(), owner_name }
}

/// Read the room document for `document_id`. Unknown documents and a
/// missing storage backend give an open room.
pub fn load_room_document(
    storage: Option<&dyn DocumentStorage>,
    document_id: &str,
) -> Result<RoomDocument> {
    let Some(storage) = storage else {
        return Ok(RoomDocument::Open { content: String::new() });
    };
    match storage.load(document_id) {
        Ok(snapshot) => {
            log::info!("Loaded stored document {document_id}");
            Ok(stored_room(snapshot))
        }
        Err(StorageError::NotFound(_)) => Ok(RoomDocument::Open { content: String::new() }),
        Err(e) => {
            log::error!("Failed to load document {document_id}: {e}");
            Err(CollabError::NotFound(format!("document '{document_id}' could not be loaded")))
        }
    }
}
