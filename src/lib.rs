//! wawire: WhatsApp Web multi-device protocol core.
//!
//! Maintains an authenticated, encrypted, long-lived connection to the
//! multi-device service and relays application messages over it.
//!
//! ## Modules
//!
//! - `types` - JIDs, message ids and events
//! - `binary` - token-compressed binary XML codec
//! - `crypto` - key pairs, HKDF, AEAD and the noise handshake
//! - `socket` - noise-framed WebSocket transport
//! - `store` - key store stack: cache, transactions, credentials
//! - `signal` - pairwise and group encryption
//! - `proto` - wire and record schemas
//! - `client` - connection lifecycle and inbound dispatch
//! - `relay` - outbound fan-out and stanza assembly

pub mod binary;
pub mod client;
pub mod crypto;
pub mod error;
pub mod eventbus;
pub mod jobqueue;
pub mod mediaconn;
pub mod message;
pub mod proto;
pub mod relay;
pub mod request;
pub mod signal;
pub mod socket;
pub mod store;
pub mod types;
pub mod usync;

pub use client::{Client, GroupMetadata, SocketConfig, StanzaTransport};
pub use error::{Result, WireError};
pub use eventbus::{EventBatch, EventBus};
pub use relay::{RelayOptions, RelayParticipant};
pub use request::{InfoQuery, InfoQueryType};
pub use store::{init_auth_creds, AuthenticationCreds, SignalKeyStore};
pub use types::{Event, MessageServer, JID};

pub use binary::{decode, encode, marshal, unmarshal, Node, NodeContent};
