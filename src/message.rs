//! Inbound message handling: decryption, SKDM processing, receipts and
//! the capped decrypt-failure retry path.

use log::{debug, info, warn};
use prost::Message as _;
use std::sync::Arc;

use crate::binary::Node;
use crate::client::Client;
use crate::error::{Result, WireError};
use crate::proto::wa;
use crate::relay::{RelayOptions, RelayParticipant};
use crate::signal::{jid_to_signal_address, unpad_message_v2};
use crate::types::events::{Event, MessageUpsert, ReceiptUpdate};
use crate::types::{MessageKey, JID};

/// Parsed routing info of one inbound `<message>`.
#[derive(Debug, Clone)]
pub(crate) struct MessageInfo {
    pub id: String,
    pub chat: JID,
    pub sender: JID,
    pub is_from_me: bool,
    pub push_name: Option<String>,
    pub timestamp: i64,
}

impl Client {
    pub(crate) fn parse_message_info(&self, node: &Node, me: &JID) -> Result<MessageInfo> {
        let from = node
            .parse_attr_jid("from")
            .ok_or_else(|| WireError::MalformedFrame("message missing from".to_string()))?;
        let id = node
            .get_attr_str("id")
            .ok_or_else(|| WireError::MalformedFrame("message missing id".to_string()))?
            .to_string();

        let (chat, sender) = if from.is_group() || from.server == crate::types::servers::BROADCAST {
            let participant = node
                .parse_attr_jid("participant")
                .ok_or_else(|| WireError::MalformedFrame("group message missing participant".to_string()))?;
            (from, participant)
        } else {
            (from.to_non_ad(), from)
        };

        Ok(MessageInfo {
            id,
            is_from_me: sender.user == me.user,
            chat,
            sender,
            push_name: node.get_attr_str("notify").map(str::to_string),
            timestamp: node.get_attr_u64("t").unwrap_or(0) as i64,
        })
    }

    /// Entry point for inbound `<message>` stanzas.
    pub(crate) async fn handle_message(self: &Arc<Self>, node: &Node) {
        let me = match self.own_identity().await {
            Ok((me, _)) => me,
            Err(_) => {
                warn!(target: "Client/Recv", "message before authentication, dropping");
                return;
            }
        };
        let info = match self.parse_message_info(node, &me) {
            Ok(info) => info,
            Err(e) => {
                warn!(target: "Client/Recv", "failed to parse message info: {e}");
                return;
            }
        };

        // newsletters are not end-to-end encrypted
        if info.chat.is_newsletter() {
            self.handle_newsletter_message(node, &info);
            return;
        }

        let enc_nodes: Vec<Node> = node
            .get_children_by_tag("enc")
            .into_iter()
            .cloned()
            .collect();
        if enc_nodes.is_empty() {
            debug!(target: "Client/Recv", "[msg:{}] no <enc> child, ignoring", info.id);
            return;
        }

        // serialize all signal work for this sender through its bucket
        let bucket = jid_to_signal_address(&info.sender).to_string();
        let client = self.clone();
        let info_clone = info.clone();
        let result = self
            .jobs
            .enqueue(&bucket, async move {
                client.decrypt_message_batch(&info_clone, enc_nodes).await
            })
            .await;

        match result {
            Ok(()) => {
                if let Err(e) = self
                    .send_delivery_receipt(
                        &info.chat,
                        info.chat.is_group().then_some(&info.sender),
                        &info.id,
                    )
                    .await
                {
                    debug!(target: "Client/Recv", "failed to send delivery receipt: {e}");
                }
            }
            Err(e) => {
                warn!(target: "Client/Recv", "[msg:{}] decrypt failed: {e}", info.id);
                self.send_retry_receipt(node, &info).await;
            }
        }
        self.events.flush();
    }

    /// Decrypt every `<enc>` child inside one store transaction.
    async fn decrypt_message_batch(self: &Arc<Self>, info: &MessageInfo, enc_nodes: Vec<Node>) -> Result<()> {
        let store = self.store.clone();
        store
            .transaction(|| async {
                for enc in &enc_nodes {
                    self.decrypt_one(info, enc).await?;
                }
                Ok(())
            })
            .await
    }

    async fn decrypt_one(self: &Arc<Self>, info: &MessageInfo, enc: &Node) -> Result<()> {
        let enc_type = enc
            .get_attr_str("type")
            .ok_or_else(|| WireError::MalformedFrame("enc missing type".to_string()))?
            .to_string();
        let ciphertext = enc
            .get_bytes()
            .ok_or_else(|| WireError::MalformedFrame("enc missing content".to_string()))?;

        let padded = match enc_type.as_str() {
            "pkmsg" | "msg" => {
                self.signal
                    .decrypt_message(&info.sender, &enc_type, ciphertext)
                    .await?
            }
            "skmsg" => {
                self.signal
                    .decrypt_group_message(&info.chat, &info.sender, ciphertext)
                    .await?
            }
            other => {
                warn!(target: "Client/Recv", "unknown enc type {other}, skipping");
                return Ok(());
            }
        };

        let plaintext = unpad_message_v2(&padded)?;
        let message = wa::Message::decode(plaintext)?;
        info!(
            target: "Client/Recv",
            "[msg:{}] decrypted {} bytes from {} ({enc_type})",
            info.id,
            plaintext.len(),
            info.sender
        );

        // a piggybacked SKDM seeds the sender's group session
        if let Some(holder) = &message.sender_key_distribution_message {
            if let Some(skdm) = &holder.axolotl_sender_key_distribution_message {
                let group: JID = holder
                    .group_id
                    .as_deref()
                    .and_then(|g| g.parse().ok())
                    .unwrap_or_else(|| info.chat.clone());
                self.signal
                    .process_sender_key_distribution(&group, &info.sender, skdm)
                    .await?;
                debug!(target: "Client/Recv", "processed sender key distribution for {group}");
            }
        }

        if is_distribution_only(&message) {
            return Ok(());
        }

        self.events.emit(Event::MessagesUpsert(MessageUpsert {
            key: MessageKey {
                remote_jid: info.chat.clone(),
                from_me: info.is_from_me,
                id: info.id.clone(),
                participant: info.chat.is_group().then(|| info.sender.clone()),
            },
            message,
            push_name: info.push_name.clone(),
            timestamp: info.timestamp,
        }));
        Ok(())
    }

    fn handle_newsletter_message(self: &Arc<Self>, node: &Node, info: &MessageInfo) {
        let Some(plaintext) = node
            .get_child_by_tag("plaintext")
            .and_then(|n| n.get_bytes())
        else {
            warn!(target: "Client/Recv", "[msg:{}] newsletter message without plaintext", info.id);
            return;
        };
        match wa::Message::decode(plaintext) {
            Ok(message) => {
                self.events.emit(Event::MessagesUpsert(MessageUpsert {
                    key: MessageKey {
                        remote_jid: info.chat.clone(),
                        from_me: info.is_from_me,
                        id: info.id.clone(),
                        participant: None,
                    },
                    message,
                    push_name: info.push_name.clone(),
                    timestamp: info.timestamp,
                }));
                self.events.flush();
            }
            Err(e) => warn!(target: "Client/Recv", "[msg:{}] bad newsletter payload: {e}", info.id),
        }
    }

    /// Ask the sender to re-encrypt, bounded by the per-message counter.
    /// Once the cap is hit the message is dropped for good.
    async fn send_retry_receipt(self: &Arc<Self>, node: &Node, info: &MessageInfo) {
        let count = {
            let mut counters = self.retry_counters.lock().expect("retry counter lock");
            let count = counters.entry(info.id.clone()).or_insert(0);
            *count += 1;
            *count
        };
        if count > self.config.max_msg_retry_count {
            warn!(
                target: "Client/Recv",
                "[msg:{}] exceeded {} retries, dropping",
                info.id,
                self.config.max_msg_retry_count
            );
            return;
        }

        let registration_id = self.creds.lock().await.registration_id;
        let mut receipt = Node::new("receipt")
            .attr("id", info.id.clone())
            .attr("to", info.chat.to_string())
            .attr("type", "retry")
            .attr("t", chrono::Utc::now().timestamp());
        if info.chat.is_group() {
            receipt.set_attr("participant", info.sender.to_string());
        }
        let retry = Node::new("retry")
            .attr("id", info.id.clone())
            .attr("count", count as u64)
            .attr("v", "1")
            .attr("t", node.get_attr_str("t").unwrap_or("0"));
        receipt.add_child(retry);
        receipt.add_child(Node::with_bytes(
            "registration",
            (registration_id as u32).to_be_bytes().to_vec(),
        ));

        if let Err(e) = self.send_node(receipt).await {
            warn!(target: "Client/Recv", "failed to send retry receipt: {e}");
        }
    }

    /// Inbound `<receipt>`: surface the update, and when a peer reports a
    /// decrypt failure, re-relay the original message to that device.
    pub(crate) async fn handle_receipt(self: &Arc<Self>, node: &Node) {
        let Some(from) = node.parse_attr_jid("from") else {
            return;
        };
        let Some(id) = node.get_attr_str("id").map(str::to_string) else {
            return;
        };
        let receipt_type = node.get_attr_str("type").unwrap_or("delivery").to_string();
        let participant = node.parse_attr_jid("participant");

        self.events.emit(Event::MessageReceiptUpdate(ReceiptUpdate {
            key: MessageKey {
                remote_jid: from.clone(),
                from_me: true,
                id: id.clone(),
                participant: participant.clone(),
            },
            receipt_type: receipt_type.clone(),
            timestamp: node.get_attr_u64("t").unwrap_or(0) as i64,
        }));

        if receipt_type == "retry" {
            self.handle_retry_request(node, &from, &id, participant).await;
        }

        self.send_stanza_ack(node).await;
        self.events.flush();
    }

    async fn handle_retry_request(
        self: &Arc<Self>,
        node: &Node,
        from: &JID,
        id: &str,
        participant: Option<JID>,
    ) {
        let count = node
            .get_child_by_tag("retry")
            .and_then(|n| n.get_attr_u64("count"))
            .unwrap_or(1) as u32;

        let Some(get_message) = &self.config.get_message else {
            warn!(target: "Client/Recv", "retry receipt for {id} but no get_message hook");
            return;
        };
        let key = MessageKey {
            remote_jid: from.to_non_ad(),
            from_me: true,
            id: id.to_string(),
            participant: participant.clone(),
        };
        let Some(original) = get_message(&key) else {
            warn!(target: "Client/Recv", "retry receipt for {id} but message not found");
            return;
        };

        let target_device = participant.unwrap_or_else(|| from.clone());
        info!(target: "Client/Recv", "re-relaying {id} to {target_device} (retry #{count})");
        let result = self
            .relay_message(
                &from.to_non_ad(),
                &original,
                RelayOptions {
                    message_id: Some(id.to_string()),
                    participant: Some(RelayParticipant {
                        jid: target_device,
                        count,
                    }),
                    ..Default::default()
                },
            )
            .await;
        if let Err(e) = result {
            warn!(target: "Client/Recv", "failed to re-relay {id}: {e}");
        }
    }
}

/// True when the message only carries group key material and no
/// user-visible content.
fn is_distribution_only(message: &wa::Message) -> bool {
    if message.sender_key_distribution_message.is_none() {
        return false;
    }
    let mut stripped = message.clone();
    stripped.sender_key_distribution_message = None;
    stripped == wa::Message::default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::test_support::*;
    use crate::client::SocketConfig;
    use crate::relay::tests::FakePeer;
    use crate::signal::{pad_message_v2, SignalRepository};
    use crate::store::init_auth_creds;
    use std::sync::Mutex as StdMutex;
    use tokio::sync::Mutex;

    /// Encrypted message node as a peer would produce it for us.
    fn inbound_from_peer(peer: &FakePeer, enc_type: &str, ciphertext: Vec<u8>, id: &str) -> Node {
        let mut enc = Node::new("enc").attr("v", "2").attr("type", enc_type);
        enc.set_bytes(ciphertext);
        let mut node = Node::new("message")
            .attr("from", peer.jid.to_string())
            .attr("id", id)
            .attr("t", 1_700_000_000u64);
        node.add_child(enc);
        node
    }

    #[tokio::test]
    async fn test_inbound_pairwise_message_decrypts_and_emits() {
        let (client, mut outbound) =
            connected_client(SocketConfig::default(), registered_creds("14155550000", 1)).await;

        // a peer establishes a session against our published bundle
        let peer = FakePeer::new("14155550042", 0);
        let peer_repo = SignalRepository::new(
            peer.store.clone(),
            Arc::new(Mutex::new(peer.creds.clone())),
        );

        let our_bundle = {
            let creds = client.creds.lock().await;
            let (update, pre_keys) =
                crate::store::creds::get_next_pre_keys(&client.store, &creds, 1)
                    .await
                    .unwrap();
            drop(creds);
            client.creds.lock().await.apply_pre_key_update(&update);
            let creds = client.creds.lock().await;
            crate::signal::PreKeyBundle {
                registration_id: creds.registration_id as u32,
                identity_key: creds.signed_identity_key.public_bytes(),
                signed_pre_key_id: creds.signed_pre_key.key_id,
                signed_pre_key_public: creds.signed_pre_key.key_pair.public,
                signed_pre_key_signature: creds.signed_pre_key.signature.clone(),
                pre_key: Some((pre_keys[0].key_id, pre_keys[0].key_pair.public)),
            }
        };

        let our_jid: JID = "14155550000:1@s.whatsapp.net".parse().unwrap();
        peer_repo.inject_e2e_session(&our_jid, &our_bundle).await.unwrap();
        let padded = pad_message_v2(wa::Message::text("hello there").encode_to_vec());
        let enc = peer_repo.encrypt_message(&our_jid, &padded).await.unwrap();
        assert_eq!(enc.enc_type, "pkmsg");

        let upserts = Arc::new(StdMutex::new(Vec::new()));
        let upserts_clone = upserts.clone();
        client.events.process(move |batch| {
            if let Some(events) = batch.get("messages.upsert") {
                for event in events {
                    if let Event::MessagesUpsert(upsert) = event {
                        upserts_clone.lock().unwrap().push(upsert.clone());
                    }
                }
            }
        });

        let node = inbound_from_peer(&peer, enc.enc_type, enc.ciphertext, "MSG-1");
        client.process_node(node).await;

        let upserts = upserts.lock().unwrap();
        assert_eq!(upserts.len(), 1);
        assert_eq!(upserts[0].message.conversation.as_deref(), Some("hello there"));
        assert_eq!(upserts[0].key.id, "MSG-1");
        assert!(!upserts[0].key.from_me);

        drop(upserts);
        // a delivery receipt goes back for the decrypted message
        let receipt = outbound.recv().await.unwrap();
        assert_eq!(receipt.tag, "receipt");
        assert_eq!(receipt.get_attr_str("id"), Some("MSG-1"));
    }

    #[tokio::test]
    async fn test_decrypt_failure_sends_capped_retry_receipts() {
        let mut config = SocketConfig::default();
        config.max_msg_retry_count = 2;
        let (client, mut outbound) = connected_client(config, registered_creds("14155550000", 1)).await;

        let peer = FakePeer::new("14155550042", 0);
        // garbage ciphertext from a peer we have no session with
        for attempt in 1..=3u64 {
            let node =
                inbound_from_peer(&peer, "msg", vec![0xAB; 64], "BROKEN-1");
            client.process_node(node).await;

            if attempt <= 2 {
                let receipt = outbound.recv().await.unwrap();
                assert_eq!(receipt.tag, "receipt");
                assert_eq!(receipt.get_attr_str("type"), Some("retry"));
                let retry = receipt.get_child_by_tag("retry").unwrap();
                assert_eq!(retry.get_attr_u64("count"), Some(attempt));
            } else {
                // above the cap: dropped silently
                assert!(outbound.try_recv().is_err());
            }
        }
    }

    #[tokio::test]
    async fn test_newsletter_inbound_is_plaintext() {
        let (client, _outbound) =
            connected_client(SocketConfig::default(), registered_creds("14155550000", 1)).await;

        let upserts = Arc::new(StdMutex::new(Vec::new()));
        let upserts_clone = upserts.clone();
        client.events.process(move |batch| {
            if let Some(events) = batch.get("messages.upsert") {
                upserts_clone.lock().unwrap().extend(events.iter().cloned());
            }
        });

        let mut node = Node::new("message")
            .attr("from", "120363001234@newsletter")
            .attr("id", "NL-1")
            .attr("t", 1_700_000_000u64);
        node.add_child(Node::with_bytes(
            "plaintext",
            wa::Message::text("newsletter post").encode_to_vec(),
        ));
        client.process_node(node).await;

        assert_eq!(upserts.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_retry_receipt_triggers_rerelay() {
        let mut config = SocketConfig::default();
        let original = wa::Message::text("the original");
        let original_clone = original.clone();
        config.get_message = Some(Box::new(move |key: &MessageKey| {
            (key.id == "SENT-1").then(|| original_clone.clone())
        }));
        let (client, mut outbound) = connected_client(config, registered_creds("14155550000", 1)).await;

        let mut peer = FakePeer::new("14155550042", 0);

        let receipt_task = {
            let client = client.clone();
            tokio::spawn(async move {
                let mut receipt = Node::new("receipt")
                    .attr("from", "14155550042@s.whatsapp.net")
                    .attr("id", "SENT-1")
                    .attr("type", "retry")
                    .attr("t", 1_700_000_000u64);
                receipt.add_child(Node::new("retry").attr("id", "SENT-1").attr("count", "1"));
                client.process_node(receipt).await;
            })
        };

        // the re-relay asserts a session first: answer the prekey query
        let request = outbound.recv().await.unwrap();
        assert_eq!(request.get_attr_str("xmlns"), Some("encrypt"));
        let id = request.get_attr_str("id").unwrap().to_string();
        let mut response = Node::new("iq").attr("id", id).attr("type", "result");
        response.add_child(Node::with_children("list", vec![peer.bundle_node().await]));
        client.process_node(response).await;

        // then the re-encrypted message goes out to that device only
        let stanza = outbound.recv().await.unwrap();
        assert_eq!(stanza.tag, "message");
        assert_eq!(stanza.get_attr_str("id"), Some("SENT-1"));
        assert_eq!(stanza.get_attr_str("to"), Some("14155550042@s.whatsapp.net"));

        receipt_task.await.unwrap();

        // and the receipt itself is acked
        let ack = outbound.recv().await.unwrap();
        assert_eq!(ack.tag, "ack");
    }
}
