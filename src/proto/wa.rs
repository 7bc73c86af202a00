//! Hand-written protobuf definitions.
//!
//! Three families live here: the noise handshake frames, the application
//! message envelope (treated as an opaque codec by everything except the
//! relay engine's classification), and the signal-layer wire and record
//! structures.

// ---------------------------------------------------------------------------
// Handshake
// ---------------------------------------------------------------------------

/// Envelope for the three noise handshake frames.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct HandshakeMessage {
    #[prost(message, optional, tag = "2")]
    pub client_hello: Option<ClientHello>,
    #[prost(message, optional, tag = "3")]
    pub server_hello: Option<ServerHello>,
    #[prost(message, optional, tag = "4")]
    pub client_finish: Option<ClientFinish>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ClientHello {
    #[prost(bytes, optional, tag = "1")]
    pub ephemeral: Option<Vec<u8>>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ServerHello {
    #[prost(bytes, optional, tag = "1")]
    pub ephemeral: Option<Vec<u8>>,
    #[prost(bytes, optional, tag = "2")]
    pub r#static: Option<Vec<u8>>,
    #[prost(bytes, optional, tag = "3")]
    pub payload: Option<Vec<u8>>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ClientFinish {
    #[prost(bytes, optional, tag = "1")]
    pub r#static: Option<Vec<u8>>,
    #[prost(bytes, optional, tag = "2")]
    pub payload: Option<Vec<u8>>,
}

/// Payload encrypted into the client finish frame.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ClientPayload {
    #[prost(uint64, optional, tag = "1")]
    pub username: Option<u64>,
    #[prost(bool, optional, tag = "3")]
    pub passive: Option<bool>,
    #[prost(message, optional, tag = "5")]
    pub user_agent: Option<UserAgent>,
    #[prost(string, optional, tag = "7")]
    pub push_name: Option<String>,
    #[prost(int32, optional, tag = "9")]
    pub session_id: Option<i32>,
    #[prost(uint32, optional, tag = "18")]
    pub device: Option<u32>,
    #[prost(message, optional, tag = "19")]
    pub device_pairing_data: Option<DevicePairingRegistrationData>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct UserAgent {
    #[prost(int32, optional, tag = "1")]
    pub platform: Option<i32>,
    #[prost(message, optional, tag = "2")]
    pub app_version: Option<AppVersion>,
    #[prost(string, optional, tag = "5")]
    pub os_version: Option<String>,
    #[prost(string, optional, tag = "6")]
    pub device: Option<String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct AppVersion {
    #[prost(uint32, optional, tag = "1")]
    pub primary: Option<u32>,
    #[prost(uint32, optional, tag = "2")]
    pub secondary: Option<u32>,
    #[prost(uint32, optional, tag = "3")]
    pub tertiary: Option<u32>,
}

/// Fresh-install pairing data: registration id, identity key and the
/// signed pre-key with its signature.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DevicePairingRegistrationData {
    #[prost(bytes, optional, tag = "1")]
    pub e_regid: Option<Vec<u8>>,
    #[prost(bytes, optional, tag = "2")]
    pub e_keytype: Option<Vec<u8>>,
    #[prost(bytes, optional, tag = "3")]
    pub e_ident: Option<Vec<u8>>,
    #[prost(bytes, optional, tag = "4")]
    pub e_skey_id: Option<Vec<u8>>,
    #[prost(bytes, optional, tag = "5")]
    pub e_skey_val: Option<Vec<u8>>,
    #[prost(bytes, optional, tag = "6")]
    pub e_skey_sig: Option<Vec<u8>>,
}

/// Build the client payload for a logged-in reconnect.
pub fn login_client_payload(username: u64, device: u32, version: (u32, u32, u32)) -> ClientPayload {
    ClientPayload {
        username: Some(username),
        passive: Some(false),
        user_agent: Some(web_user_agent(version)),
        device: Some(device),
        ..Default::default()
    }
}

fn web_user_agent(version: (u32, u32, u32)) -> UserAgent {
    UserAgent {
        platform: Some(14), // web
        app_version: Some(AppVersion {
            primary: Some(version.0),
            secondary: Some(version.1),
            tertiary: Some(version.2),
        }),
        os_version: None,
        device: None,
    }
}

// ---------------------------------------------------------------------------
// Application message envelope
// ---------------------------------------------------------------------------

/// Key identifying a message on the wire.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct MessageKey {
    #[prost(string, optional, tag = "1")]
    pub remote_jid: Option<String>,
    #[prost(bool, optional, tag = "2")]
    pub from_me: Option<bool>,
    #[prost(string, optional, tag = "3")]
    pub id: Option<String>,
    #[prost(string, optional, tag = "4")]
    pub participant: Option<String>,
}

/// The application message envelope.
///
/// Only the fields the relay engine needs for classification are modelled
/// as structures; inner media payloads stay close to opaque.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Message {
    #[prost(string, optional, tag = "1")]
    pub conversation: Option<String>,
    #[prost(message, optional, tag = "2")]
    pub sender_key_distribution_message: Option<SenderKeyDistributionHolder>,
    #[prost(message, optional, tag = "3")]
    pub image_message: Option<ImageMessage>,
    #[prost(message, optional, tag = "4")]
    pub contact_message: Option<ContactMessage>,
    #[prost(message, optional, tag = "6")]
    pub extended_text_message: Option<ExtendedTextMessage>,
    #[prost(message, optional, tag = "7")]
    pub document_message: Option<DocumentMessage>,
    #[prost(message, optional, tag = "8")]
    pub audio_message: Option<AudioMessage>,
    #[prost(message, optional, tag = "9")]
    pub video_message: Option<VideoMessage>,
    #[prost(message, optional, tag = "12")]
    pub protocol_message: Option<ProtocolMessage>,
    #[prost(message, optional, tag = "13")]
    pub contacts_array_message: Option<ContactsArrayMessage>,
    #[prost(message, optional, tag = "18")]
    pub live_location_message: Option<LiveLocationMessage>,
    #[prost(message, optional, tag = "26")]
    pub sticker_message: Option<StickerMessage>,
    #[prost(message, optional, tag = "27")]
    pub order_message: Option<OrderMessage>,
    #[prost(message, optional, tag = "30")]
    pub product_message: Option<ProductMessage>,
    #[prost(message, optional, boxed, tag = "31")]
    pub device_sent_message: Option<Box<DeviceSentMessage>>,
    #[prost(message, optional, tag = "40")]
    pub interactive_response_message: Option<InteractiveResponseMessage>,
    #[prost(message, optional, tag = "45")]
    pub reaction_message: Option<ReactionMessage>,
    #[prost(message, optional, tag = "49")]
    pub poll_creation_message: Option<PollCreationMessage>,
    #[prost(message, optional, tag = "54")]
    pub pin_in_chat_message: Option<PinInChatMessage>,
}

impl Message {
    /// A plain text message.
    pub fn text(text: impl Into<String>) -> Self {
        Message {
            conversation: Some(text.into()),
            ..Default::default()
        }
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ImageMessage {
    #[prost(string, optional, tag = "1")]
    pub url: Option<String>,
    #[prost(string, optional, tag = "2")]
    pub mimetype: Option<String>,
    #[prost(string, optional, tag = "3")]
    pub caption: Option<String>,
    #[prost(bytes, optional, tag = "16")]
    pub jpeg_thumbnail: Option<Vec<u8>>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct VideoMessage {
    #[prost(string, optional, tag = "1")]
    pub url: Option<String>,
    #[prost(string, optional, tag = "2")]
    pub mimetype: Option<String>,
    #[prost(string, optional, tag = "3")]
    pub caption: Option<String>,
    #[prost(bool, optional, tag = "5")]
    pub gif_playback: Option<bool>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct AudioMessage {
    #[prost(string, optional, tag = "1")]
    pub url: Option<String>,
    #[prost(string, optional, tag = "2")]
    pub mimetype: Option<String>,
    #[prost(uint32, optional, tag = "4")]
    pub seconds: Option<u32>,
    #[prost(bool, optional, tag = "5")]
    pub ptt: Option<bool>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DocumentMessage {
    #[prost(string, optional, tag = "1")]
    pub url: Option<String>,
    #[prost(string, optional, tag = "2")]
    pub mimetype: Option<String>,
    #[prost(string, optional, tag = "3")]
    pub title: Option<String>,
    #[prost(string, optional, tag = "8")]
    pub file_name: Option<String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct StickerMessage {
    #[prost(string, optional, tag = "1")]
    pub url: Option<String>,
    #[prost(string, optional, tag = "2")]
    pub mimetype: Option<String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ContactMessage {
    #[prost(string, optional, tag = "1")]
    pub display_name: Option<String>,
    #[prost(string, optional, tag = "16")]
    pub vcard: Option<String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ContactsArrayMessage {
    #[prost(string, optional, tag = "1")]
    pub display_name: Option<String>,
    #[prost(message, repeated, tag = "2")]
    pub contacts: Vec<ContactMessage>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct LiveLocationMessage {
    #[prost(double, optional, tag = "1")]
    pub degrees_latitude: Option<f64>,
    #[prost(double, optional, tag = "2")]
    pub degrees_longitude: Option<f64>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ExtendedTextMessage {
    #[prost(string, optional, tag = "1")]
    pub text: Option<String>,
    #[prost(string, optional, tag = "2")]
    pub matched_text: Option<String>,
    #[prost(string, optional, tag = "4")]
    pub canonical_url: Option<String>,
    #[prost(string, optional, tag = "5")]
    pub description: Option<String>,
    #[prost(string, optional, tag = "6")]
    pub title: Option<String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct OrderMessage {
    #[prost(string, optional, tag = "1")]
    pub order_id: Option<String>,
    #[prost(bytes, optional, tag = "2")]
    pub thumbnail: Option<Vec<u8>>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProductMessage {
    #[prost(string, optional, tag = "1")]
    pub title: Option<String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ReactionMessage {
    #[prost(message, optional, tag = "1")]
    pub key: Option<MessageKey>,
    #[prost(string, optional, tag = "2")]
    pub text: Option<String>,
    #[prost(int64, optional, tag = "3")]
    pub sender_timestamp_ms: Option<i64>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PollCreationMessage {
    #[prost(string, optional, tag = "2")]
    pub name: Option<String>,
    #[prost(message, repeated, tag = "3")]
    pub options: Vec<PollOption>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PollOption {
    #[prost(string, optional, tag = "1")]
    pub option_name: Option<String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PinInChatMessage {
    #[prost(message, optional, tag = "1")]
    pub key: Option<MessageKey>,
    #[prost(int32, optional, tag = "2")]
    pub r#type: Option<i32>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct InteractiveResponseMessage {
    #[prost(message, optional, tag = "1")]
    pub native_flow_response_message: Option<NativeFlowResponse>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct NativeFlowResponse {
    #[prost(string, optional, tag = "1")]
    pub name: Option<String>,
    #[prost(string, optional, tag = "2")]
    pub params_json: Option<String>,
}

/// Wraps the message a device sends to its sibling devices.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DeviceSentMessage {
    #[prost(string, optional, tag = "1")]
    pub destination_jid: Option<String>,
    #[prost(message, optional, boxed, tag = "2")]
    pub message: Option<Box<Message>>,
}

/// Carrier for the serialized sender-key distribution payload.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SenderKeyDistributionHolder {
    #[prost(string, optional, tag = "1")]
    pub group_id: Option<String>,
    #[prost(bytes, optional, tag = "2")]
    pub axolotl_sender_key_distribution_message: Option<Vec<u8>>,
}

/// Protocol-level operations: revokes, edits, app-state keys.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProtocolMessage {
    #[prost(message, optional, tag = "1")]
    pub key: Option<MessageKey>,
    #[prost(int32, optional, tag = "2")]
    pub r#type: Option<i32>,
}

/// `ProtocolMessage.type` values the relay cares about.
pub mod protocol_message_type {
    pub const REVOKE: i32 = 0;
    pub const MESSAGE_EDIT: i32 = 14;
}

// ---------------------------------------------------------------------------
// Signal wire formats
// ---------------------------------------------------------------------------

/// Ratchet header carried on every pairwise message.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RatchetHeader {
    #[prost(bytes, optional, tag = "1")]
    pub ratchet_key: Option<Vec<u8>>,
    #[prost(uint32, optional, tag = "2")]
    pub counter: Option<u32>,
    #[prost(uint32, optional, tag = "3")]
    pub previous_counter: Option<u32>,
}

/// A pairwise ciphertext (`<enc type="msg">`).
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SignalMessage {
    #[prost(message, optional, tag = "1")]
    pub header: Option<RatchetHeader>,
    #[prost(bytes, optional, tag = "2")]
    pub ciphertext: Option<Vec<u8>>,
}

/// A session-establishing ciphertext (`<enc type="pkmsg">`).
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PreKeySignalMessage {
    #[prost(uint32, optional, tag = "1")]
    pub registration_id: Option<u32>,
    #[prost(uint32, optional, tag = "2")]
    pub pre_key_id: Option<u32>,
    #[prost(uint32, optional, tag = "3")]
    pub signed_pre_key_id: Option<u32>,
    #[prost(bytes, optional, tag = "4")]
    pub base_key: Option<Vec<u8>>,
    #[prost(bytes, optional, tag = "5")]
    pub identity_key: Option<Vec<u8>>,
    #[prost(bytes, optional, tag = "6")]
    pub message: Option<Vec<u8>>,
}

/// A group ciphertext (`<enc type="skmsg">`).
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SenderKeyMessage {
    #[prost(uint32, optional, tag = "1")]
    pub id: Option<u32>,
    #[prost(uint32, optional, tag = "2")]
    pub iteration: Option<u32>,
    #[prost(bytes, optional, tag = "3")]
    pub ciphertext: Option<Vec<u8>>,
    #[prost(bytes, optional, tag = "4")]
    pub signature: Option<Vec<u8>>,
}

/// Bootstraps a recipient's copy of our sender key (SKDM payload).
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SenderKeyDistribution {
    #[prost(uint32, optional, tag = "1")]
    pub id: Option<u32>,
    #[prost(uint32, optional, tag = "2")]
    pub iteration: Option<u32>,
    #[prost(bytes, optional, tag = "3")]
    pub chain_key: Option<Vec<u8>>,
    #[prost(bytes, optional, tag = "4")]
    pub signing_key: Option<Vec<u8>>,
}

// ---------------------------------------------------------------------------
// Signal record formats (serialized into the key store)
// ---------------------------------------------------------------------------

/// Serialized double-ratchet session state.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SessionStructure {
    #[prost(uint32, optional, tag = "1")]
    pub registration_id: Option<u32>,
    #[prost(bytes, optional, tag = "2")]
    pub their_identity: Option<Vec<u8>>,
    #[prost(bytes, optional, tag = "3")]
    pub root_key: Option<Vec<u8>>,
    #[prost(bytes, optional, tag = "4")]
    pub our_ratchet_private: Option<Vec<u8>>,
    #[prost(bytes, optional, tag = "5")]
    pub our_ratchet_public: Option<Vec<u8>>,
    #[prost(bytes, optional, tag = "6")]
    pub their_ratchet_public: Option<Vec<u8>>,
    #[prost(bytes, optional, tag = "7")]
    pub send_chain_key: Option<Vec<u8>>,
    #[prost(uint32, optional, tag = "8")]
    pub send_chain_index: Option<u32>,
    #[prost(bytes, optional, tag = "9")]
    pub recv_chain_key: Option<Vec<u8>>,
    #[prost(uint32, optional, tag = "10")]
    pub recv_chain_index: Option<u32>,
    #[prost(uint32, optional, tag = "11")]
    pub previous_send_counter: Option<u32>,
    #[prost(message, optional, tag = "12")]
    pub pending_pre_key: Option<PendingPreKey>,
    #[prost(message, repeated, tag = "13")]
    pub skipped_keys: Vec<SkippedMessageKey>,
    /// Base key of the handshake that created this responder session; lets
    /// a replayed `pkmsg` reuse the session instead of rebuilding it.
    #[prost(bytes, optional, tag = "14")]
    pub their_base_key: Option<Vec<u8>>,
}

/// X3DH handshake data replayed in every `pkmsg` until acknowledged.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PendingPreKey {
    #[prost(uint32, optional, tag = "1")]
    pub pre_key_id: Option<u32>,
    #[prost(uint32, optional, tag = "2")]
    pub signed_pre_key_id: Option<u32>,
    #[prost(bytes, optional, tag = "3")]
    pub base_key: Option<Vec<u8>>,
}

/// Message key retained for an out-of-order message.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SkippedMessageKey {
    #[prost(bytes, optional, tag = "1")]
    pub ratchet_key: Option<Vec<u8>>,
    #[prost(uint32, optional, tag = "2")]
    pub index: Option<u32>,
    #[prost(bytes, optional, tag = "3")]
    pub message_key: Option<Vec<u8>>,
}

/// Serialized one-time pre-key as kept in the `pre-key` namespace.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PreKeyRecord {
    #[prost(uint32, optional, tag = "1")]
    pub id: Option<u32>,
    #[prost(bytes, optional, tag = "2")]
    pub public: Option<Vec<u8>>,
    #[prost(bytes, optional, tag = "3")]
    pub private: Option<Vec<u8>>,
}

/// Serialized sender-key state for one `(group, sender)` pair.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SenderKeyState {
    #[prost(uint32, optional, tag = "1")]
    pub id: Option<u32>,
    #[prost(uint32, optional, tag = "2")]
    pub iteration: Option<u32>,
    #[prost(bytes, optional, tag = "3")]
    pub chain_key: Option<Vec<u8>>,
    #[prost(bytes, optional, tag = "4")]
    pub signing_public: Option<Vec<u8>>,
    #[prost(bytes, optional, tag = "5")]
    pub signing_seed: Option<Vec<u8>>,
}
