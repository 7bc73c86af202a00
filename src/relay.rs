//! Outbound message relay: recipient expansion, session assertion,
//! per-device encryption and stanza assembly.

use bytes::Bytes;
use log::{debug, info, warn};
use prost::Message as _;
use std::collections::HashMap;
use std::sync::Arc;

use crate::binary::{Node, NodeContent};
use crate::client::{Client, GroupMetadata};
use crate::error::{Result, WireError};
use crate::proto::wa;
use crate::request::{InfoQuery, InfoQueryType};
use crate::signal::pad_message_v2;
use crate::store::traits::{single_mutation, KeyType};
use crate::types::events::{Event, MessageUpsert};
use crate::types::{MessageKey, MessageServer, JID};

/// Explicit peer target for a relay.
#[derive(Debug, Clone)]
pub struct RelayParticipant {
    pub jid: JID,
    pub count: u32,
}

/// Options consumed by [`Client::relay_message`].
pub struct RelayOptions {
    pub message_id: Option<String>,
    /// Target one specific device instead of expanding recipients.
    pub participant: Option<RelayParticipant>,
    /// Peer category: a protocol message for our own devices; the single
    /// `<enc>` node is inlined without a `<participants>` wrapper.
    pub peer: bool,
    /// Audience for status broadcasts.
    pub status_jid_list: Vec<JID>,
    pub additional_attributes: Vec<(String, String)>,
    pub additional_nodes: Vec<Node>,
    pub use_user_devices_cache: bool,
}

impl Default for RelayOptions {
    fn default() -> Self {
        Self {
            message_id: None,
            participant: None,
            peer: false,
            status_jid_list: Vec::new(),
            additional_attributes: Vec::new(),
            additional_nodes: Vec::new(),
            use_user_devices_cache: true,
        }
    }
}

/// Mediatype attribute carried on `<enc>` nodes, derived from the message.
pub fn get_media_type(message: &wa::Message) -> Option<&'static str> {
    if message.image_message.is_some() {
        Some("image")
    } else if let Some(video) = &message.video_message {
        if video.gif_playback.unwrap_or(false) {
            Some("gif")
        } else {
            Some("video")
        }
    } else if let Some(audio) = &message.audio_message {
        if audio.ptt.unwrap_or(false) {
            Some("ptt")
        } else {
            Some("audio")
        }
    } else if message.contact_message.is_some() {
        Some("vcard")
    } else if message.document_message.is_some() {
        Some("document")
    } else if message.contacts_array_message.is_some() {
        Some("contact_array")
    } else if message.live_location_message.is_some() {
        Some("livelocation")
    } else if message.sticker_message.is_some() {
        Some("sticker")
    } else if message.order_message.is_some() {
        Some("order")
    } else if message.product_message.is_some() {
        Some("product")
    } else if message
        .interactive_response_message
        .as_ref()
        .map(|m| m.native_flow_response_message.is_some())
        .unwrap_or(false)
    {
        Some("native_flow_response")
    } else if message
        .extended_text_message
        .as_ref()
        .map(|m| m.matched_text.is_some() || m.canonical_url.is_some())
        .unwrap_or(false)
    {
        Some("url")
    } else {
        None
    }
}

/// Stanza `type` attribute: plain text and link previews ride as `text`.
fn stanza_type(message: &wa::Message) -> &'static str {
    match get_media_type(message) {
        None | Some("url") => "text",
        Some(_) => "media",
    }
}

/// Build one `<enc>` node.
fn enc_node(enc_type: &str, media_type: Option<&str>, hide_decrypt_fail: bool, ciphertext: Vec<u8>) -> Node {
    let mut node = Node::new("enc").attr("v", "2").attr("type", enc_type);
    if let Some(media_type) = media_type {
        node.set_attr("mediatype", media_type);
    }
    if hide_decrypt_fail {
        node.set_attr("decrypt-fail", "hide");
    }
    node.set_bytes(ciphertext);
    node
}

fn read_u32_be(bytes: &[u8]) -> u32 {
    bytes.iter().fold(0u32, |acc, &b| (acc << 8) | b as u32)
}

impl Client {
    /// Relay a message to `jid`, returning the stanza id actually sent.
    pub async fn relay_message(
        self: &Arc<Self>,
        jid: &JID,
        message: &wa::Message,
        options: RelayOptions,
    ) -> Result<String> {
        let store = self.store.clone();
        store
            .transaction(|| self.relay_message_inner(jid, message, options))
            .await
    }

    async fn relay_message_inner(
        self: &Arc<Self>,
        jid: &JID,
        message: &wa::Message,
        options: RelayOptions,
    ) -> Result<String> {
        let (me, my_lid) = self.own_identity().await?;
        let server = jid.message_server();
        let destination = jid.to_non_ad();

        let msg_id = options
            .message_id
            .clone()
            .unwrap_or_else(|| self.generate_message_id_v2(Some(&me)));

        if server == MessageServer::Newsletter {
            return self.relay_plaintext(&destination, message, msg_id).await;
        }

        // 3/4. recipient seeding and device expansion
        let devices: Vec<JID> = if let Some(participant) = &options.participant {
            vec![participant.jid.clone()]
        } else if options.peer {
            vec![jid.clone()]
        } else {
            match server {
                MessageServer::Individual | MessageServer::Lid => {
                    let own_bare = if server == MessageServer::Lid {
                        my_lid.clone().unwrap_or_else(|| me.clone()).to_non_ad()
                    } else {
                        me.to_non_ad()
                    };
                    self.get_usync_devices(
                        &[own_bare, destination.clone()],
                        options.use_user_devices_cache,
                        false,
                    )
                    .await?
                }
                MessageServer::Group => {
                    let metadata = self.group_metadata(&destination).await?;
                    self.get_usync_devices(
                        &metadata.participants,
                        options.use_user_devices_cache,
                        false,
                    )
                    .await?
                }
                MessageServer::Status => {
                    self.get_usync_devices(
                        &options.status_jid_list,
                        options.use_user_devices_cache,
                        false,
                    )
                    .await?
                }
                MessageServer::Newsletter => unreachable!(),
            }
        };

        // 5. last-chance patch hook
        let message = match &self.config.patch_message_before_sending {
            Some(patch) => patch(message.clone(), &devices),
            None => message.clone(),
        };

        let media_type = get_media_type(&message);
        let hide_fail = message.pin_in_chat_message.is_some();

        let mut recipient_nodes: Vec<Node> = Vec::new();
        let mut top_enc: Option<Node> = None;
        let mut include_device_identity = false;

        match server {
            MessageServer::Group | MessageServer::Status => {
                // 6. one skmsg plus SKDM fan-out to unseeded devices
                let group_sender = my_lid.clone().unwrap_or_else(|| me.clone());
                let padded = pad_message_v2(message.encode_to_vec());
                let group_out = self
                    .signal
                    .encrypt_group_message(&destination, &group_sender, &padded)
                    .await?;

                let mut memory = self.sender_key_memory(&destination).await?;
                let force_resend = options.participant.is_some();
                let sender_key_jids: Vec<JID> = devices
                    .iter()
                    .filter(|d| force_resend || !memory.get(&d.to_string()).copied().unwrap_or(false))
                    .cloned()
                    .collect();

                if !sender_key_jids.is_empty() {
                    self.assert_sessions(&sender_key_jids).await?;

                    let skdm_message = wa::Message {
                        sender_key_distribution_message: Some(wa::SenderKeyDistributionHolder {
                            group_id: Some(destination.to_string()),
                            axolotl_sender_key_distribution_message: Some(
                                group_out.sender_key_distribution_message.clone(),
                            ),
                        }),
                        ..Default::default()
                    };
                    let skdm_padded = pad_message_v2(skdm_message.encode_to_vec());

                    for device in &sender_key_jids {
                        let enc = self.signal.encrypt_message(device, &skdm_padded).await?;
                        if enc.enc_type == "pkmsg" {
                            include_device_identity = true;
                        }
                        let mut to = Node::new("to").attr("jid", device.to_string());
                        to.add_child(enc_node(enc.enc_type, media_type, hide_fail, enc.ciphertext));
                        recipient_nodes.push(to);
                    }

                    // status broadcasts never update the memory row
                    if server == MessageServer::Group {
                        for device in &sender_key_jids {
                            memory.insert(device.to_string(), true);
                        }
                        self.write_sender_key_memory(&destination, &memory).await?;
                    }
                }

                top_enc = Some(enc_node("skmsg", media_type, hide_fail, group_out.ciphertext));
            }
            MessageServer::Individual | MessageServer::Lid => {
                // 7. own devices get the device-sent wrapper, peers the raw message
                self.assert_sessions(&devices).await?;

                let wrapped = wa::Message {
                    device_sent_message: Some(Box::new(wa::DeviceSentMessage {
                        destination_jid: Some(destination.to_string()),
                        message: Some(Box::new(message.clone())),
                    })),
                    ..Default::default()
                };
                let own_padded = pad_message_v2(wrapped.encode_to_vec());
                let peer_padded = pad_message_v2(message.encode_to_vec());

                let own_users: Vec<&str> = {
                    let mut users = vec![me.user.as_str()];
                    if let Some(lid) = &my_lid {
                        users.push(lid.user.as_str());
                    }
                    users
                };

                for device in &devices {
                    let plaintext = if own_users.contains(&device.user.as_str()) && !options.peer {
                        &own_padded
                    } else {
                        &peer_padded
                    };
                    let enc = self.signal.encrypt_message(device, plaintext).await?;
                    if enc.enc_type == "pkmsg" {
                        include_device_identity = true;
                    }

                    let enc = enc_node(enc.enc_type, media_type, hide_fail, enc.ciphertext);
                    if options.peer {
                        top_enc = Some(enc);
                    } else {
                        let mut to = Node::new("to").attr("jid", device.to_string());
                        to.add_child(enc);
                        recipient_nodes.push(to);
                    }
                }
            }
            MessageServer::Newsletter => unreachable!(),
        }

        // 9/10. stanza assembly and routing attributes
        let mut stanza = Node::new("message")
            .attr("id", msg_id.clone())
            .attr("type", stanza_type(&message));

        match &options.participant {
            None => {
                stanza.set_attr("to", destination.to_string());
            }
            Some(participant) if server == MessageServer::Group => {
                stanza.set_attr("to", destination.to_string());
                stanza.set_attr("participant", participant.jid.to_string());
            }
            Some(participant) if participant.jid.user == me.user => {
                stanza.set_attr("to", participant.jid.to_string());
                stanza.set_attr("recipient", destination.to_string());
            }
            Some(participant) => {
                stanza.set_attr("to", participant.jid.to_string());
            }
        }
        for (key, value) in &options.additional_attributes {
            stanza.set_attr(key.clone(), value.clone());
        }

        let mut children = Vec::new();
        if options.peer {
            if let Some(enc) = top_enc.take() {
                children.push(enc);
            }
        } else {
            if !recipient_nodes.is_empty() {
                children.push(Node::with_children("participants", recipient_nodes));
            }
            if let Some(enc) = top_enc.take() {
                children.push(enc);
            }
        }

        // 8. pkmsg recipients require our signed device identity
        if include_device_identity {
            let account = self.creds.lock().await.account.clone();
            if let Some(account) = account {
                children.push(Node::with_bytes("device-identity", account));
            } else {
                warn!(target: "Client/Relay", "pkmsg sent but no signed device identity available");
            }
        }
        children.extend(options.additional_nodes);
        stanza.set_children(children);

        debug!(target: "Client/Relay", "relaying {msg_id} to {destination} ({server:?})");
        self.send_node(stanza).await?;
        Ok(msg_id)
    }

    /// Newsletter messages are plaintext: no per-recipient nodes at all.
    ///
    /// Edits and revokes rewrite the stanza id from the referenced key;
    /// the returned id is always the one actually sent.
    async fn relay_plaintext(
        self: &Arc<Self>,
        destination: &JID,
        message: &wa::Message,
        mut msg_id: String,
    ) -> Result<String> {
        if let Some(protocol) = &message.protocol_message {
            let kind = protocol.r#type.unwrap_or(-1);
            if kind == wa::protocol_message_type::REVOKE
                || kind == wa::protocol_message_type::MESSAGE_EDIT
            {
                if let Some(id) = protocol.key.as_ref().and_then(|k| k.id.clone()) {
                    msg_id = id;
                }
            }
        }

        let mut stanza = Node::new("message")
            .attr("id", msg_id.clone())
            .attr("to", destination.to_string())
            .attr("type", stanza_type(message));
        stanza.add_child(Node::with_bytes("plaintext", message.encode_to_vec()));

        self.send_node(stanza).await?;
        Ok(msg_id)
    }

    /// High-level send: relay plus the local `messages.upsert` echo.
    pub async fn send_message(
        self: &Arc<Self>,
        jid: &JID,
        message: wa::Message,
        options: RelayOptions,
    ) -> Result<String> {
        let msg_id = self.relay_message(jid, &message, options).await?;

        if self.config.emit_own_events {
            self.events.emit(Event::MessagesUpsert(MessageUpsert {
                key: MessageKey {
                    remote_jid: jid.to_non_ad(),
                    from_me: true,
                    id: msg_id.clone(),
                    participant: None,
                },
                message,
                push_name: None,
                timestamp: chrono::Utc::now().timestamp(),
            }));
            self.events.flush();
        }

        Ok(msg_id)
    }

    /// Group metadata from the external cache or a `w:g2` query.
    pub(crate) async fn group_metadata(&self, jid: &JID) -> Result<GroupMetadata> {
        if let Some(cached) = &self.config.cached_group_metadata {
            if let Some(metadata) = cached(jid) {
                return Ok(metadata);
            }
        }
        self.query_group_metadata(jid).await
    }

    /// `iq get xmlns=w:g2` for the participant list.
    pub(crate) async fn query_group_metadata(&self, jid: &JID) -> Result<GroupMetadata> {
        let response = self
            .send_iq(InfoQuery {
                namespace: "w:g2",
                query_type: InfoQueryType::Get,
                to: jid.clone(),
                target: None,
                id: None,
                content: Some(NodeContent::Children(vec![
                    Node::new("query").attr("request", "interactive")
                ])),
                timeout: None,
            })
            .await?;

        let group = response
            .get_child_by_tag("group")
            .ok_or_else(|| WireError::MalformedFrame("missing group in metadata".to_string()))?;
        let participants = group
            .get_children_by_tag("participant")
            .iter()
            .filter_map(|p| p.parse_attr_jid("jid"))
            .collect();

        Ok(GroupMetadata {
            jid: jid.clone(),
            subject: group.get_attr_str("subject").map(str::to_string),
            participants,
        })
    }

    /// The `sender-key-memory` row for a group: device jid to seeded flag.
    pub(crate) async fn sender_key_memory(&self, group: &JID) -> Result<HashMap<String, bool>> {
        let id = group.to_string();
        let found = self.store.get(KeyType::SenderKeyMemory, &[id.clone()]).await?;
        match found.get(&id) {
            Some(data) => serde_json::from_slice(data)
                .map_err(|e| WireError::StoreFailure(format!("corrupt sender-key-memory: {e}"))),
            None => Ok(HashMap::new()),
        }
    }

    pub(crate) async fn write_sender_key_memory(
        &self,
        group: &JID,
        memory: &HashMap<String, bool>,
    ) -> Result<()> {
        let data = serde_json::to_vec(memory)
            .map_err(|e| WireError::StoreFailure(format!("encode sender-key-memory: {e}")))?;
        self.store
            .set(&single_mutation(
                KeyType::SenderKeyMemory,
                group.to_string(),
                Some(Bytes::from(data)),
            ))
            .await
    }

    /// Ensure a pairwise session exists for every jid, fetching prekey
    /// bundles in one batch for the missing ones.
    pub(crate) async fn assert_sessions(&self, jids: &[JID]) -> Result<()> {
        let mut missing = Vec::new();
        for jid in jids {
            if !self.signal.has_session(jid).await? {
                missing.push(jid.clone());
            }
        }
        if missing.is_empty() {
            return Ok(());
        }

        info!(target: "Client/Relay", "fetching prekey bundles for {} devices", missing.len());
        let user_nodes = missing
            .iter()
            .map(|jid| Node::new("user").attr("jid", jid.to_string()))
            .collect();
        let response = self
            .send_iq(InfoQuery {
                namespace: "encrypt",
                query_type: InfoQueryType::Get,
                to: crate::types::jid::SERVER_JID.clone(),
                target: None,
                id: None,
                content: Some(NodeContent::Children(vec![Node::with_children(
                    "key", user_nodes,
                )])),
                timeout: None,
            })
            .await?;

        self.parse_and_inject_e2e_sessions(&response).await
    }

    /// Parse a prekey-fetch response and build a session per device.
    pub(crate) async fn parse_and_inject_e2e_sessions(&self, response: &Node) -> Result<()> {
        let Some(list) = response.get_child_by_tag("list") else {
            return Err(WireError::MalformedFrame("missing list in prekey response".to_string()));
        };

        for user in list.get_children_by_tag("user") {
            let Some(jid) = user.parse_attr_jid("jid") else {
                continue;
            };
            match parse_prekey_bundle(user) {
                Ok(bundle) => {
                    self.signal.inject_e2e_session(&jid, &bundle).await?;
                    debug!(target: "Client/Relay", "injected session for {jid}");
                }
                Err(e) => {
                    warn!(target: "Client/Relay", "skipping bundle for {jid}: {e}");
                }
            }
        }
        Ok(())
    }
}

/// Decode one `<user>` bundle node from a prekey-fetch response.
fn parse_prekey_bundle(user: &Node) -> Result<crate::signal::PreKeyBundle> {
    let bytes_of = |node: &Node, what: &str| -> Result<Vec<u8>> {
        node.get_bytes()
            .map(|b| b.to_vec())
            .ok_or_else(|| WireError::MalformedFrame(format!("bundle {what} has no content")))
    };
    let child = |tag: &str| -> Result<&Node> {
        user.get_child_by_tag(tag)
            .ok_or_else(|| WireError::MalformedFrame(format!("bundle missing <{tag}>")))
    };

    let registration_id = read_u32_be(&bytes_of(child("registration")?, "registration")?);
    let identity_key: [u8; 32] = bytes_of(child("identity")?, "identity")?
        .try_into()
        .map_err(|_| WireError::MalformedFrame("bundle identity has wrong size".to_string()))?;

    let skey = child("skey")?;
    let signed_pre_key_id = read_u32_be(&bytes_of(
        skey.get_child_by_tag("id")
            .ok_or_else(|| WireError::MalformedFrame("skey missing id".to_string()))?,
        "skey id",
    )?);
    let signed_pre_key_public: [u8; 32] = bytes_of(
        skey.get_child_by_tag("value")
            .ok_or_else(|| WireError::MalformedFrame("skey missing value".to_string()))?,
        "skey value",
    )?
    .try_into()
    .map_err(|_| WireError::MalformedFrame("skey value has wrong size".to_string()))?;
    let signed_pre_key_signature = bytes_of(
        skey.get_child_by_tag("signature")
            .ok_or_else(|| WireError::MalformedFrame("skey missing signature".to_string()))?,
        "skey signature",
    )?;

    let pre_key = match user.get_child_by_tag("key") {
        Some(key) => {
            let id = read_u32_be(&bytes_of(
                key.get_child_by_tag("id")
                    .ok_or_else(|| WireError::MalformedFrame("key missing id".to_string()))?,
                "key id",
            )?);
            let value: [u8; 32] = bytes_of(
                key.get_child_by_tag("value")
                    .ok_or_else(|| WireError::MalformedFrame("key missing value".to_string()))?,
                "key value",
            )?
            .try_into()
            .map_err(|_| WireError::MalformedFrame("key value has wrong size".to_string()))?;
            Some((id, value))
        }
        None => None,
    };

    Ok(crate::signal::PreKeyBundle {
        registration_id,
        identity_key,
        signed_pre_key_id,
        signed_pre_key_public,
        signed_pre_key_signature,
        pre_key,
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::client::test_support::*;
    use crate::client::SocketConfig;
    use crate::store::creds::get_next_pre_keys;
    use crate::store::{init_auth_creds, make_transactional, AuthenticationCreds, MemoryKeyStore};

    /// A fully materialised fake peer whose bundle node can answer a
    /// prekey-fetch query.
    pub(crate) struct FakePeer {
        pub creds: AuthenticationCreds,
        pub store: Arc<crate::store::TransactionalKeyStore>,
        pub jid: JID,
    }

    impl FakePeer {
        pub(crate) fn new(user: &str, device: u16) -> Self {
            let creds = init_auth_creds();
            let store = make_transactional(Arc::new(MemoryKeyStore::new()));
            let jid: JID = format!("{user}:{device}@s.whatsapp.net")
                .parse()
                .unwrap();
            Self { creds, store, jid }
        }

        /// `<user>` node carrying this peer's current bundle.
        pub(crate) async fn bundle_node(&mut self) -> Node {
            let (update, pre_keys) = get_next_pre_keys(&self.store, &self.creds, 1).await.unwrap();
            self.creds.apply_pre_key_update(&update);
            let pre_key = &pre_keys[0];

            let mut skey = Node::new("skey");
            skey.add_child(Node::with_bytes(
                "id",
                self.creds.signed_pre_key.key_id.to_be_bytes()[1..].to_vec(),
            ));
            skey.add_child(Node::with_bytes(
                "value",
                self.creds.signed_pre_key.key_pair.public.to_vec(),
            ));
            skey.add_child(Node::with_bytes(
                "signature",
                self.creds.signed_pre_key.signature.clone(),
            ));

            let mut key = Node::new("key");
            key.add_child(Node::with_bytes("id", pre_key.key_id.to_be_bytes()[1..].to_vec()));
            key.add_child(Node::with_bytes("value", pre_key.key_pair.public.to_vec()));

            let mut user = Node::new("user").attr("jid", self.jid.to_string());
            user.add_child(Node::with_bytes(
                "registration",
                (self.creds.registration_id as u32).to_be_bytes().to_vec(),
            ));
            user.add_child(Node::with_bytes(
                "identity",
                self.creds.signed_identity_key.public_bytes().to_vec(),
            ));
            user.add_child(skey);
            user.add_child(key);
            user
        }
    }

    /// Answer pending usync/prekey/group queries from the outbound stream
    /// until `relay` resolves.
    async fn answer_prekey_query(
        client: &Arc<Client>,
        outbound: &mut tokio::sync::mpsc::UnboundedReceiver<Node>,
        peers: &mut [FakePeer],
    ) -> Node {
        let request = outbound.recv().await.unwrap();
        assert_eq!(request.get_attr_str("xmlns"), Some("encrypt"));
        let id = request.get_attr_str("id").unwrap().to_string();

        let mut user_nodes = Vec::new();
        for peer in peers.iter_mut() {
            user_nodes.push(peer.bundle_node().await);
        }
        let mut response = Node::new("iq").attr("id", id).attr("type", "result");
        response.add_child(Node::with_children("list", user_nodes));
        client.process_node(response).await;
        request
    }

    #[tokio::test]
    async fn test_newsletter_relay_is_plaintext_only() {
        let (client, mut outbound) =
            connected_client(SocketConfig::default(), registered_creds("14155550000", 1)).await;

        let newsletter: JID = "120363001234@newsletter".parse().unwrap();
        let msg_id = client
            .relay_message(&newsletter, &wa::Message::text("broadcast"), RelayOptions::default())
            .await
            .unwrap();

        let stanza = outbound.recv().await.unwrap();
        assert_eq!(stanza.tag, "message");
        assert_eq!(stanza.get_attr_str("id"), Some(msg_id.as_str()));
        assert_eq!(stanza.get_attr_str("to"), Some("120363001234@newsletter"));

        // exactly one <plaintext> child and zero recipient nodes
        let children = stanza.get_children().unwrap();
        assert_eq!(children.len(), 1);
        assert_eq!(children[0].tag, "plaintext");
        assert!(stanza.get_children_by_tag("to").is_empty());
        assert!(stanza.get_child_by_tag("participants").is_none());

        let decoded =
            wa::Message::decode(children[0].get_bytes().unwrap()).unwrap();
        assert_eq!(decoded.conversation.as_deref(), Some("broadcast"));
    }

    #[tokio::test]
    async fn test_newsletter_edit_returns_id_actually_sent() {
        let (client, mut outbound) =
            connected_client(SocketConfig::default(), registered_creds("14155550000", 1)).await;

        let newsletter: JID = "120363001234@newsletter".parse().unwrap();
        let edit = wa::Message {
            protocol_message: Some(wa::ProtocolMessage {
                key: Some(wa::MessageKey {
                    id: Some("ORIGINAL-ID".to_string()),
                    ..Default::default()
                }),
                r#type: Some(wa::protocol_message_type::MESSAGE_EDIT),
            }),
            ..Default::default()
        };

        let msg_id = client
            .relay_message(&newsletter, &edit, RelayOptions::default())
            .await
            .unwrap();
        assert_eq!(msg_id, "ORIGINAL-ID");

        let stanza = outbound.recv().await.unwrap();
        assert_eq!(stanza.get_attr_str("id"), Some("ORIGINAL-ID"));
    }

    #[tokio::test]
    async fn test_peer_relay_inlines_single_enc() {
        let (client, mut outbound) =
            connected_client(SocketConfig::default(), registered_creds("14155550000", 1)).await;

        // pre-establish a session with our companion device
        let mut companion = FakePeer::new("14155550000", 2);
        let relay = {
            let client = client.clone();
            let target = companion.jid.clone();
            tokio::spawn(async move {
                client
                    .relay_message(
                        &target,
                        &wa::Message::text("peer sync"),
                        RelayOptions {
                            peer: true,
                            ..Default::default()
                        },
                    )
                    .await
            })
        };

        answer_prekey_query(&client, &mut outbound, std::slice::from_mut(&mut companion)).await;

        let stanza = outbound.recv().await.unwrap();
        relay.await.unwrap().unwrap();

        assert_eq!(stanza.tag, "message");
        // single inlined <enc>, no <participants> wrapper
        assert!(stanza.get_child_by_tag("participants").is_none());
        let enc_nodes = stanza.get_children_by_tag("enc");
        assert_eq!(enc_nodes.len(), 1);
        assert_eq!(enc_nodes[0].get_attr_str("type"), Some("pkmsg"));
    }

    #[tokio::test]
    async fn test_group_fanout_with_half_known_audience() {
        let group: JID = "123-456@g.us".parse().unwrap();
        let users = ["14155550001", "14155550002", "14155550003", "14155550004"];

        let mut config = SocketConfig::default();
        let group_clone = group.clone();
        config.cached_group_metadata = Some(Box::new(move |jid: &JID| {
            (jid == &group_clone).then(|| GroupMetadata {
                jid: jid.clone(),
                subject: Some("test group".to_string()),
                participants: [
                    "14155550001@s.whatsapp.net",
                    "14155550002@s.whatsapp.net",
                    "14155550003@s.whatsapp.net",
                    "14155550004@s.whatsapp.net",
                ]
                .iter()
                .map(|s| s.parse().unwrap())
                .collect(),
            })
        }));
        let (client, mut outbound) =
            connected_client(config, registered_creds("14155559999", 1)).await;

        // two of the four participants already hold our sender key
        {
            let mut memory = HashMap::new();
            memory.insert("14155550001@s.whatsapp.net".to_string(), true);
            memory.insert("14155550002@s.whatsapp.net".to_string(), true);
            client.write_sender_key_memory(&group, &memory).await.unwrap();
        }
        // devices are warm in the usync cache: one primary device per user
        {
            let mut cache = client.user_devices_cache.lock().unwrap();
            for user in users {
                cache.insert(
                    user.to_string(),
                    crate::client::CachedDevices {
                        fetched: std::time::Instant::now(),
                        devices: vec![format!("{user}@s.whatsapp.net").parse().unwrap()],
                    },
                );
            }
        }

        let peer3 = FakePeer::new("14155550003", 0);
        let peer4 = FakePeer::new("14155550004", 0);

        let relay = {
            let client = client.clone();
            let group = group.clone();
            tokio::spawn(async move {
                client
                    .relay_message(&group, &wa::Message::text("hi group"), RelayOptions::default())
                    .await
            })
        };

        // only the two unseeded participants need sessions
        let prekey_request =
            answer_prekey_query(&client, &mut outbound, &mut [peer3, peer4][..]).await;
        let asked: Vec<&str> = prekey_request
            .get_optional_child_by_tag(&["key"])
            .unwrap()
            .get_children_by_tag("user")
            .iter()
            .filter_map(|n| n.get_attr_str("jid"))
            .collect();
        assert_eq!(
            asked,
            vec!["14155550003@s.whatsapp.net", "14155550004@s.whatsapp.net"]
        );

        let stanza = outbound.recv().await.unwrap();
        relay.await.unwrap().unwrap();

        assert_eq!(stanza.get_attr_str("to"), Some("123-456@g.us"));

        // exactly one skmsg at the top level
        let top_enc = stanza.get_children_by_tag("enc");
        assert_eq!(top_enc.len(), 1);
        assert_eq!(top_enc[0].get_attr_str("type"), Some("skmsg"));

        // exactly two SKDM recipients
        let participants = stanza.get_child_by_tag("participants").unwrap();
        let to_nodes = participants.get_children_by_tag("to");
        assert_eq!(to_nodes.len(), 2);
        for to in &to_nodes {
            let enc = to.get_child_by_tag("enc").unwrap();
            assert_eq!(enc.get_attr_str("type"), Some("pkmsg"));
        }

        // post-condition: all four participants marked seeded
        let memory = client.sender_key_memory(&group).await.unwrap();
        for user in users {
            assert_eq!(
                memory.get(&format!("{user}@s.whatsapp.net")),
                Some(&true),
                "{user} should be marked"
            );
        }
    }

    #[tokio::test]
    async fn test_pairwise_to_self_wraps_device_sent() {
        let (client, mut outbound) =
            connected_client(SocketConfig::default(), registered_creds("14155550000", 1)).await;
        let own_bare: JID = "14155550000@s.whatsapp.net".parse().unwrap();

        // the account's other devices: the primary (0) and a companion (2)
        {
            let mut cache = client.user_devices_cache.lock().unwrap();
            cache.insert(
                "14155550000".to_string(),
                crate::client::CachedDevices {
                    fetched: std::time::Instant::now(),
                    devices: vec![
                        "14155550000@s.whatsapp.net".parse().unwrap(),
                        "14155550000:2@s.whatsapp.net".parse().unwrap(),
                    ],
                },
            );
        }

        let primary = FakePeer::new("14155550000", 0);
        let mut companion = FakePeer::new("14155550000", 2);

        let relay = {
            let client = client.clone();
            let target = own_bare.clone();
            tokio::spawn(async move {
                client
                    .relay_message(&target, &wa::Message::text("hi"), RelayOptions::default())
                    .await
            })
        };

        answer_prekey_query(&client, &mut outbound, &mut [primary, companion][..]).await;

        let stanza = outbound.recv().await.unwrap();
        relay.await.unwrap().unwrap();

        // every recipient is one of our own devices
        let participants = stanza.get_child_by_tag("participants").unwrap();
        let to_nodes = participants.get_children_by_tag("to");
        assert_eq!(to_nodes.len(), 2);
        for to in &to_nodes {
            let jid: JID = to.get_attr_str("jid").unwrap().parse().unwrap();
            assert_eq!(jid.user, "14155550000");
        }
        // nothing rides outside the participants wrapper
        assert!(stanza.get_children_by_tag("enc").is_empty());
    }

    #[tokio::test]
    async fn test_participant_routing_attributes() {
        let (client, mut outbound) =
            connected_client(SocketConfig::default(), registered_creds("14155550000", 1)).await;

        // participant set, other user: to = participant, no recipient attr
        let mut other = FakePeer::new("14155550007", 0);
        let dest: JID = "14155550007@s.whatsapp.net".parse().unwrap();
        let relay = {
            let client = client.clone();
            let dest = dest.clone();
            let participant = other.jid.clone();
            tokio::spawn(async move {
                client
                    .relay_message(
                        &dest,
                        &wa::Message::text("retry"),
                        RelayOptions {
                            participant: Some(RelayParticipant { jid: participant, count: 1 }),
                            ..Default::default()
                        },
                    )
                    .await
            })
        };
        answer_prekey_query(&client, &mut outbound, std::slice::from_mut(&mut other)).await;
        let stanza = outbound.recv().await.unwrap();
        relay.await.unwrap().unwrap();
        assert_eq!(stanza.get_attr_str("to"), Some("14155550007:0@s.whatsapp.net"));
        assert!(stanza.get_attr_str("recipient").is_none());

        // participant set, self: to = participant, recipient = destination
        let mut own_device = FakePeer::new("14155550000", 2);
        let dest: JID = "14155550042@s.whatsapp.net".parse().unwrap();
        let relay = {
            let client = client.clone();
            let dest = dest.clone();
            let participant = own_device.jid.clone();
            tokio::spawn(async move {
                client
                    .relay_message(
                        &dest,
                        &wa::Message::text("self retry"),
                        RelayOptions {
                            participant: Some(RelayParticipant { jid: participant, count: 1 }),
                            ..Default::default()
                        },
                    )
                    .await
            })
        };
        answer_prekey_query(&client, &mut outbound, std::slice::from_mut(&mut own_device)).await;
        let stanza = outbound.recv().await.unwrap();
        relay.await.unwrap().unwrap();
        assert_eq!(stanza.get_attr_str("to"), Some("14155550000:2@s.whatsapp.net"));
        assert_eq!(stanza.get_attr_str("recipient"), Some("14155550042@s.whatsapp.net"));
    }

    #[test]
    fn test_media_type_derivation() {
        let mut message = wa::Message::default();
        assert_eq!(get_media_type(&message), None);

        message.image_message = Some(wa::ImageMessage::default());
        assert_eq!(get_media_type(&message), Some("image"));
        message.image_message = None;

        message.video_message = Some(wa::VideoMessage {
            gif_playback: Some(true),
            ..Default::default()
        });
        assert_eq!(get_media_type(&message), Some("gif"));
        message.video_message = None;

        message.audio_message = Some(wa::AudioMessage {
            ptt: Some(true),
            ..Default::default()
        });
        assert_eq!(get_media_type(&message), Some("ptt"));
        message.audio_message = None;

        message.extended_text_message = Some(wa::ExtendedTextMessage {
            matched_text: Some("https://example.com".to_string()),
            ..Default::default()
        });
        assert_eq!(get_media_type(&message), Some("url"));
        // link previews still ride as text stanzas
        assert_eq!(stanza_type(&message), "text");
        message.extended_text_message = None;

        // polls deliberately derive no mediatype; consumers re-derive from
        // the inner message rather than a classification bucket
        message.poll_creation_message = Some(wa::PollCreationMessage::default());
        assert_eq!(get_media_type(&message), None);
    }
}
