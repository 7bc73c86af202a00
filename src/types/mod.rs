//! Core protocol types: JIDs, message ids and events.

pub mod events;
pub mod jid;

pub use events::{ConnectionState, ConnectionUpdate, DisconnectReason, Event, MessageKey};
pub use jid::{servers, MessageID, MessageServer, JID};
