//! Crate-wide error taxonomy.
//!
//! Subsystems keep their own error enums where that matches their scope
//! (codec, socket, store); everything that crosses a public API boundary
//! converges on [`WireError`].

use thiserror::Error;

/// Errors surfaced by the protocol core.
#[derive(Debug, Error)]
pub enum WireError {
    /// A frame or stanza could not be decoded.
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    /// The noise handshake did not complete.
    #[error("handshake failure: {0}")]
    HandshakeFailure(String),

    /// AEAD decryption of a transport frame failed. Fatal to the connection.
    #[error("transport decrypt failure")]
    DecryptFailure,

    /// The server answered an IQ with `<error code=.../>`.
    #[error("server error {code}: {text}")]
    ServerError { code: u16, text: String },

    /// A pending query expired before a matching response arrived.
    #[error("request timed out")]
    Timeout,

    /// The transport closed while a request was in flight.
    #[error("connection closed")]
    ConnectionClosed,

    /// An operation requiring login was attempted before authentication.
    #[error("not authenticated")]
    NotAuthenticated,

    /// No pairwise or sender-key session exists for the address.
    #[error("no session for {0}")]
    NoSession(String),

    /// The backing key-value store failed a read or write.
    #[error("store failure: {0}")]
    StoreFailure(String),

    /// A transaction commit kept failing after every allowed retry.
    #[error("commit failed after {attempts} attempts: {reason}")]
    CommitFailure { attempts: u32, reason: String },

    /// Signal-layer cryptography rejected a message.
    #[error("signal protocol error: {0}")]
    Signal(String),

    /// A protobuf payload failed to decode.
    #[error("protobuf decode error: {0}")]
    ProtoDecode(#[from] prost::DecodeError),
}

impl WireError {
    pub fn store<E: std::fmt::Display>(err: E) -> Self {
        WireError::StoreFailure(err.to_string())
    }

    pub fn malformed<E: std::fmt::Display>(err: E) -> Self {
        WireError::MalformedFrame(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, WireError>;
