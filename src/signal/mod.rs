//! Signal protocol layer: addresses, pairwise sessions, sender keys and
//! the repository tying them to the key store.

pub mod address;
pub mod group;
pub mod repository;
pub mod session;

pub use address::{jid_to_signal_address, SignalAddress};
pub use group::{sender_key_store_id, SenderKeySession};
pub use repository::{
    pad_message_v2, unpad_message_v2, EncryptedMessage, GroupEncryptedMessage, SignalRepository,
};
pub use session::{EncType, PreKeyBundle, Session};
