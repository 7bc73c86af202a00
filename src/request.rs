//! Request/response correlation and common outbound stanzas.
//!
//! Every IQ carries a stanza id; a pending waiter keyed by that id is
//! completed by whichever inbound stanza echoes it. Waiters fail on
//! `<iq type="error">`, timeout, or connection close.

use log::debug;
use sha2::{Digest, Sha256};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::sync::oneshot;

use crate::binary::{Node, NodeContent};
use crate::client::Client;
use crate::error::{Result, WireError};
use crate::types::{MessageKey, JID};

/// IQ request types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InfoQueryType {
    Get,
    Set,
}

impl InfoQueryType {
    fn as_str(&self) -> &'static str {
        match self {
            InfoQueryType::Get => "get",
            InfoQueryType::Set => "set",
        }
    }
}

/// An outbound IQ.
pub struct InfoQuery {
    pub namespace: &'static str,
    pub query_type: InfoQueryType,
    pub to: JID,
    pub target: Option<JID>,
    pub id: Option<String>,
    pub content: Option<NodeContent>,
    pub timeout: Option<std::time::Duration>,
}

/// Raise `ServerError` for a stanza carrying an `<error>` child.
pub fn assert_node_error_free(node: &Node) -> Result<()> {
    if node.get_attr_str("type") != Some("error") {
        return Ok(());
    }
    let (code, text) = node
        .get_child_by_tag("error")
        .map(|err| {
            (
                err.get_attr_u64("code").unwrap_or(0) as u16,
                err.get_attr_str("text")
                    .map(str::to_string)
                    .unwrap_or_else(|| {
                        err.get_children()
                            .and_then(|c| c.first())
                            .map(|n| n.tag.clone())
                            .unwrap_or_default()
                    }),
            )
        })
        .unwrap_or((0, String::new()));
    Err(WireError::ServerError { code, text })
}

impl Client {
    /// Allocate a fresh stanza tag.
    pub fn generate_request_id(&self) -> String {
        let n = self.id_counter.fetch_add(1, Ordering::SeqCst);
        format!("{}-{}", self.unique_id, n)
    }

    /// Message id derivation: time, sender and randomness hashed into the
    /// `3EB0`-prefixed form the server expects.
    pub fn generate_message_id_v2(&self, own_jid: Option<&JID>) -> String {
        let mut data = Vec::with_capacity(64);
        data.extend_from_slice(&chrono::Utc::now().timestamp_millis().to_be_bytes());
        if let Some(jid) = own_jid {
            data.extend_from_slice(jid.user.as_bytes());
            data.extend_from_slice(b"@c.us");
        }
        let mut random = [0u8; 16];
        rand::RngCore::fill_bytes(&mut rand::thread_rng(), &mut random);
        data.extend_from_slice(&random);

        let digest = Sha256::digest(&data);
        format!("3EB0{}", hex::encode_upper(&digest[..9]))
    }

    /// Register a waiter for the given stanza id.
    pub(crate) fn register_waiter(&self, id: &str) -> oneshot::Receiver<Node> {
        let (tx, rx) = oneshot::channel();
        self.response_waiters
            .lock()
            .expect("waiter lock")
            .insert(id.to_string(), tx);
        rx
    }

    /// Complete a pending waiter; true when the stanza was consumed.
    pub(crate) fn handle_iq_response(&self, node: &Node) -> bool {
        let Some(id) = node.get_attr_str("id") else {
            return false;
        };
        let waiter = self.response_waiters.lock().expect("waiter lock").remove(id);
        match waiter {
            Some(tx) => {
                debug!(target: "Client/IQ", "completing waiter {id}");
                let _ = tx.send(node.clone());
                true
            }
            None => false,
        }
    }

    /// Send an IQ and await its correlated response.
    pub async fn send_iq(&self, query: InfoQuery) -> Result<Node> {
        let id = query.id.unwrap_or_else(|| self.generate_request_id());
        let timeout = query.timeout.unwrap_or(self.config.query_timeout);

        let mut node = Node::new("iq")
            .attr("id", id.clone())
            .attr("xmlns", query.namespace)
            .attr("type", query.query_type.as_str());
        if !query.to.is_empty() {
            node.set_attr("to", query.to.to_string());
        }
        if let Some(target) = query.target {
            node.set_attr("target", target.to_string());
        }
        if let Some(content) = query.content {
            node.content = content;
        }

        let rx = self.register_waiter(&id);
        if let Err(e) = self.send_node(node).await {
            self.response_waiters.lock().expect("waiter lock").remove(&id);
            return Err(e);
        }

        let response = match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(node)) => node,
            Ok(Err(_)) => return Err(WireError::ConnectionClosed),
            Err(_) => {
                self.response_waiters.lock().expect("waiter lock").remove(&id);
                return Err(WireError::Timeout);
            }
        };

        assert_node_error_free(&response)?;
        Ok(response)
    }

    /// Keepalive ping.
    pub async fn send_ping(&self) -> Result<()> {
        self.send_iq(InfoQuery {
            namespace: "w:p",
            query_type: InfoQueryType::Get,
            to: crate::types::jid::SERVER_JID.clone(),
            target: None,
            id: None,
            content: Some(NodeContent::Children(vec![Node::new("ping")])),
            timeout: Some(std::time::Duration::from_secs(20)),
        })
        .await
        .map(|_| ())
    }

    /// Send one receipt stanza covering all `keys` (which must share a
    /// chat). Extra ids ride in a `<list>` child. Empty input is a no-op.
    pub async fn send_receipts(self: &Arc<Self>, keys: &[MessageKey], receipt_type: &str) -> Result<()> {
        let Some(first) = keys.first() else {
            return Ok(());
        };

        let mut node = Node::new("receipt")
            .attr("id", first.id.clone())
            .attr("to", first.remote_jid.to_string())
            .attr("t", chrono::Utc::now().timestamp());
        if !receipt_type.is_empty() {
            node.set_attr("type", receipt_type);
        }
        if let Some(participant) = &first.participant {
            node.set_attr("participant", participant.to_string());
        }

        if keys.len() > 1 {
            let items = keys[1..]
                .iter()
                .map(|key| Node::new("item").attr("id", key.id.clone()))
                .collect();
            node.add_child(Node::with_children("list", items));
        }

        self.send_node(node).await
    }

    /// Delivery receipt for one inbound message.
    pub async fn send_delivery_receipt(
        self: &Arc<Self>,
        chat: &JID,
        participant: Option<&JID>,
        id: &str,
    ) -> Result<()> {
        let mut node = Node::new("receipt")
            .attr("id", id)
            .attr("to", chat.to_string())
            .attr("t", chrono::Utc::now().timestamp());
        if let Some(participant) = participant {
            node.set_attr("participant", participant.to_string());
        }
        self.send_node(node).await
    }
}
