//! Event types emitted by the client core.
//!
//! Every event belongs to a named channel; the bus batches payloads per
//! channel and hands consumers a map of channel name to accumulated
//! payloads on each flush.

use crate::proto::wa;
use crate::types::JID;

/// Connection lifecycle state as seen by consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Open,
    Close,
}

/// Well-known disconnect status codes carried on `stream:error`/`failure`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    ConnectionClosed,
    ConnectionLost,
    ConnectionReplaced,
    TimedOut,
    LoggedOut,
    BadSession,
    RestartRequired,
    MultideviceMismatch,
    Unknown(u16),
}

impl DisconnectReason {
    pub fn status_code(&self) -> u16 {
        match self {
            DisconnectReason::ConnectionClosed => 428,
            DisconnectReason::ConnectionLost => 408,
            DisconnectReason::ConnectionReplaced => 440,
            DisconnectReason::TimedOut => 408,
            DisconnectReason::LoggedOut => 401,
            DisconnectReason::BadSession => 500,
            DisconnectReason::RestartRequired => 515,
            DisconnectReason::MultideviceMismatch => 411,
            DisconnectReason::Unknown(code) => *code,
        }
    }

    pub fn from_code(code: u16) -> Self {
        match code {
            428 => DisconnectReason::ConnectionClosed,
            440 => DisconnectReason::ConnectionReplaced,
            408 => DisconnectReason::ConnectionLost,
            401 => DisconnectReason::LoggedOut,
            500 => DisconnectReason::BadSession,
            515 => DisconnectReason::RestartRequired,
            411 => DisconnectReason::MultideviceMismatch,
            other => DisconnectReason::Unknown(other),
        }
    }

    /// The orchestrator re-enters startup for every reason except logout.
    pub fn should_reconnect(&self) -> bool {
        !matches!(self, DisconnectReason::LoggedOut)
    }
}

/// Payload of the `connection.update` channel.
#[derive(Debug, Clone)]
pub struct ConnectionUpdate {
    pub connection: ConnectionState,
    pub last_disconnect: Option<DisconnectReason>,
}

/// Key identifying a message within a chat.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct MessageKey {
    pub remote_jid: JID,
    pub from_me: bool,
    pub id: String,
    pub participant: Option<JID>,
}

/// Payload of `messages.upsert`.
#[derive(Debug, Clone)]
pub struct MessageUpsert {
    pub key: MessageKey,
    pub message: wa::Message,
    pub push_name: Option<String>,
    pub timestamp: i64,
}

/// Payload of `message-receipt.update`.
#[derive(Debug, Clone)]
pub struct ReceiptUpdate {
    pub key: MessageKey,
    pub receipt_type: String,
    pub timestamp: i64,
}

/// Payload of `presence.update`.
#[derive(Debug, Clone)]
pub struct PresenceUpdate {
    pub from: JID,
    pub unavailable: bool,
    pub last_seen: Option<i64>,
}

/// Payload of `call`.
#[derive(Debug, Clone)]
pub struct CallEvent {
    pub from: JID,
    pub call_id: String,
    pub status: String,
}

/// Payload of `groups.upsert` / `groups.update`.
#[derive(Debug, Clone)]
pub struct GroupUpdate {
    pub jid: JID,
    pub subject: Option<String>,
    pub participants: Vec<JID>,
}

/// Payload of `contacts.update`.
#[derive(Debug, Clone)]
pub struct ContactUpdate {
    pub jid: JID,
    pub notify: Option<String>,
}

/// All events the core emits, one variant per channel.
#[derive(Debug, Clone)]
pub enum Event {
    ConnectionUpdate(ConnectionUpdate),
    CredsUpdate,
    MessagingHistorySet,
    MessagesUpsert(MessageUpsert),
    MessagesUpdate(MessageKey),
    MessageReceiptUpdate(ReceiptUpdate),
    GroupsUpsert(GroupUpdate),
    GroupsUpdate(GroupUpdate),
    ContactsUpdate(ContactUpdate),
    ChatsDelete(JID),
    Call(CallEvent),
    PresenceUpdate(PresenceUpdate),
}

impl Event {
    /// The channel name the bus buffers this event under.
    pub fn channel(&self) -> &'static str {
        match self {
            Event::ConnectionUpdate(_) => "connection.update",
            Event::CredsUpdate => "creds.update",
            Event::MessagingHistorySet => "messaging-history.set",
            Event::MessagesUpsert(_) => "messages.upsert",
            Event::MessagesUpdate(_) => "messages.update",
            Event::MessageReceiptUpdate(_) => "message-receipt.update",
            Event::GroupsUpsert(_) => "groups.upsert",
            Event::GroupsUpdate(_) => "groups.update",
            Event::ContactsUpdate(_) => "contacts.update",
            Event::ChatsDelete(_) => "chats.delete",
            Event::Call(_) => "call",
            Event::PresenceUpdate(_) => "presence.update",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disconnect_reason_roundtrip() {
        for reason in [
            DisconnectReason::ConnectionClosed,
            DisconnectReason::ConnectionReplaced,
            DisconnectReason::LoggedOut,
            DisconnectReason::RestartRequired,
        ] {
            assert_eq!(DisconnectReason::from_code(reason.status_code()), reason);
        }
    }

    #[test]
    fn test_only_logout_is_terminal() {
        assert!(!DisconnectReason::LoggedOut.should_reconnect());
        assert!(DisconnectReason::RestartRequired.should_reconnect());
        assert!(DisconnectReason::ConnectionLost.should_reconnect());
        assert!(DisconnectReason::Unknown(999).should_reconnect());
    }
}
