//! # codecolab-sync: Real-time relay for CodeColab
//!
//! WebSocket relay server and client. The server keeps one room per
//! document, relays edits, cursors and chat to the other members of the
//! sender's room, and answers content requests from its own copy of the
//! document.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐     WebSocket      ┌──────────────────┐
//! │ CollabClient │ ◄────────────────► │ SyncServer       │
//! │ (per user)   │   JSON envelopes   │ (relay)          │
//! └──────┬───────┘                    └────────┬─────────┘
//!        │                                     │
//!        ▼                                     ▼
//! ┌──────────────┐                    ┌──────────────────┐
//! │ ClientEvent  │                    │ SessionDirectory │
//! │ channel      │                    │ rooms + sessions │
//! └──────────────┘                    └────────┬─────────┘
//!                                              │
//!                                      ┌───────┴───────┐
//!                                      │ BroadcastGroup│
//!                                      │ (fan-out)     │
//!                                      └───────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: `{type, payload}` JSON envelopes
//! - [`broadcast`]: per-room fan-out with bounded buffering
//! - [`session`]: join/leave bookkeeping and relay rules
//! - [`server`]: WebSocket relay server
//! - [`client`]: WebSocket client state machine

pub mod broadcast;
pub mod client;
pub mod protocol;
pub mod server;
pub mod session;

pub use broadcast::{BroadcastGroup, BroadcastStats, ConnectionId, RoomFrame};
pub use client::{ClientConfig, ClientEvent, ClientState, CollabClient};
pub use protocol::{RosterEntry, WireError, WireMessage};
pub use server::{ServerConfig, ServerError, ServerStats, SyncServer};
pub use session::{
    load_room_document, JoinOutcome, LeaveOutcome, LoadTicket, RoomDocument, Session,
    SessionDirectory,
};
