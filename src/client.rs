//! The client: connection lifecycle, inbound dispatch and the glue
//! between transport, signal layer, store and event bus.

use async_trait::async_trait;
use log::{debug, error, info, warn};
use rand::RngCore;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot, Mutex};

use crate::binary::{self, Node};
use crate::error::{Result, WireError};
use crate::eventbus::EventBus;
use crate::jobqueue::JobQueue;
use crate::mediaconn::MediaConnInfo;
use crate::proto::wa;
use crate::signal::SignalRepository;
use crate::socket::{connect_websocket, do_handshake, endpoints, FrameSocket, NoiseSocket, SocketError};
use crate::store::{AuthenticationCreds, SignalKeyStore, TransactionalKeyStore};
use crate::types::events::{ConnectionState, ConnectionUpdate, DisconnectReason, Event};
use crate::types::{MessageKey, JID};

/// Group info as the relay engine consumes it.
#[derive(Debug, Clone)]
pub struct GroupMetadata {
    pub jid: JID,
    pub subject: Option<String>,
    pub participants: Vec<JID>,
}

pub type PatchMessageHook = Box<dyn Fn(wa::Message, &[JID]) -> wa::Message + Send + Sync>;
pub type GroupMetadataHook = Box<dyn Fn(&JID) -> Option<GroupMetadata> + Send + Sync>;
pub type JidFilterHook = Box<dyn Fn(&JID) -> bool + Send + Sync>;
pub type GetMessageHook = Box<dyn Fn(&MessageKey) -> Option<wa::Message> + Send + Sync>;

/// Configuration consumed by the core.
pub struct SocketConfig {
    pub endpoint: String,
    /// Protocol version triple sent in the handshake.
    pub version: (u32, u32, u32),
    pub query_timeout: Duration,
    /// Whether `send_message` also emits a local `messages.upsert`.
    pub emit_own_events: bool,
    /// Ceiling on decrypt-failure retry receipts per message.
    pub max_msg_retry_count: u8,
    /// Last-chance mutation hook before a message is encrypted.
    pub patch_message_before_sending: Option<PatchMessageHook>,
    /// External group-info cache accessor.
    pub cached_group_metadata: Option<GroupMetadataHook>,
    /// Inbound filter.
    pub should_ignore_jid: Option<JidFilterHook>,
    /// Replay source for messages a peer asks to be re-sent.
    pub get_message: Option<GetMessageHook>,
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            endpoint: endpoints::MAIN.to_string(),
            version: (2, 3000, 1),
            query_timeout: Duration::from_secs(60),
            emit_own_events: true,
            max_msg_retry_count: 5,
            patch_message_before_sending: None,
            cached_group_metadata: None,
            should_ignore_jid: None,
            get_message: None,
        }
    }
}

/// Anything that can carry marshalled stanzas. The noise socket is the
/// production implementation; tests install channel-backed mocks.
#[async_trait]
pub trait StanzaTransport: Send + Sync {
    async fn send_payload(&self, payload: &[u8]) -> std::result::Result<(), SocketError>;
    fn is_open(&self) -> bool;
    async fn close(&self);
}

#[async_trait]
impl StanzaTransport for NoiseSocket {
    async fn send_payload(&self, payload: &[u8]) -> std::result::Result<(), SocketError> {
        self.send_frame(payload).await
    }

    fn is_open(&self) -> bool {
        NoiseSocket::is_open(self)
    }

    async fn close(&self) {
        NoiseSocket::close(self).await
    }
}

pub(crate) struct CachedDevices {
    pub fetched: Instant,
    pub devices: Vec<JID>,
}

/// The WhatsApp client core.
pub struct Client {
    pub config: SocketConfig,
    pub creds: Arc<Mutex<AuthenticationCreds>>,
    pub store: Arc<TransactionalKeyStore>,
    pub signal: SignalRepository,
    pub events: EventBus,
    pub jobs: JobQueue,

    transport: Mutex<Option<Arc<dyn StanzaTransport>>>,
    pub(crate) response_waiters: StdMutex<HashMap<String, oneshot::Sender<Node>>>,
    pub(crate) unique_id: String,
    pub(crate) id_counter: AtomicU64,
    pub(crate) user_devices_cache: StdMutex<HashMap<String, CachedDevices>>,
    pub(crate) media_conn: Mutex<Option<MediaConnInfo>>,
    pub(crate) retry_counters: StdMutex<HashMap<String, u8>>,
    last_disconnect: StdMutex<Option<DisconnectReason>>,
}

impl Client {
    pub fn new(
        config: SocketConfig,
        creds: AuthenticationCreds,
        external_store: Arc<dyn SignalKeyStore>,
    ) -> Arc<Self> {
        let store = crate::store::make_transactional(external_store);
        let creds = Arc::new(Mutex::new(creds));
        let signal = SignalRepository::new(store.clone(), creds.clone());

        let mut unique = [0u8; 2];
        rand::thread_rng().fill_bytes(&mut unique);

        Arc::new(Self {
            config,
            creds,
            store,
            signal,
            events: EventBus::new(),
            jobs: JobQueue::default(),
            transport: Mutex::new(None),
            response_waiters: StdMutex::new(HashMap::new()),
            unique_id: format!("{}.{}", unique[0], unique[1]),
            id_counter: AtomicU64::new(0),
            user_devices_cache: StdMutex::new(HashMap::new()),
            media_conn: Mutex::new(None),
            retry_counters: StdMutex::new(HashMap::new()),
            last_disconnect: StdMutex::new(None),
        })
    }

    /// Install a transport. Production code calls this from `connect`;
    /// tests install channel-backed mocks.
    pub async fn set_transport(&self, transport: Arc<dyn StanzaTransport>) {
        *self.transport.lock().await = Some(transport);
    }

    pub async fn is_connected(&self) -> bool {
        self.transport
            .lock()
            .await
            .as_ref()
            .map(|t| t.is_open())
            .unwrap_or(false)
    }

    /// Connect the WebSocket, run the handshake, start the read loop.
    pub async fn connect(self: &Arc<Self>) -> Result<()> {
        self.events.emit(Event::ConnectionUpdate(ConnectionUpdate {
            connection: ConnectionState::Connecting,
            last_disconnect: None,
        }));
        self.events.flush();

        let (transport, mut frames_rx) = connect_websocket(&self.config.endpoint).await?;
        let routing_info = None; // opaque routing bytes, when the server handed us any
        let frame_socket = FrameSocket::new(Box::new(transport), routing_info);

        let creds = self.creds.lock().await.clone();
        let socket = do_handshake(&creds, frame_socket, &mut frames_rx, self.config.version).await?;
        let socket = Arc::new(socket);
        self.set_transport(socket.clone()).await;

        let client = self.clone();
        tokio::spawn(async move {
            client.read_loop(socket, frames_rx).await;
        });

        let client = self.clone();
        tokio::spawn(async move {
            client.keepalive_loop().await;
        });

        Ok(())
    }

    async fn read_loop(self: Arc<Self>, socket: Arc<NoiseSocket>, mut frames_rx: mpsc::Receiver<bytes::Bytes>) {
        info!(target: "Client", "read loop started");
        while let Some(frame) = frames_rx.recv().await {
            let payload = match socket.decrypt_frame(&frame).await {
                Ok(payload) => payload,
                Err(SocketError::DecryptionFailed) => {
                    error!(target: "Client", "transport decrypt failure, tearing down");
                    self.handle_disconnect(DisconnectReason::BadSession).await;
                    return;
                }
                Err(e) => {
                    warn!(target: "Client", "dropping frame: {e}");
                    continue;
                }
            };

            match binary::unmarshal(&payload) {
                Ok(node) => self.process_node(node).await,
                Err(e) => warn!(target: "Client/Recv", "failed to unmarshal node: {e}"),
            }
            self.events.flush();
        }

        info!(target: "Client", "socket stream ended");
        self.handle_disconnect(DisconnectReason::ConnectionLost).await;
    }

    async fn keepalive_loop(self: Arc<Self>) {
        let mut interval = tokio::time::interval(Duration::from_secs(30));
        interval.tick().await;
        loop {
            interval.tick().await;
            if !self.is_connected().await {
                return;
            }
            if let Err(e) = self.send_ping().await {
                debug!(target: "Client", "keepalive ping failed: {e}");
                return;
            }
        }
    }

    /// Emit the close event and fail every pending waiter.
    pub(crate) async fn handle_disconnect(&self, reason: DisconnectReason) {
        *self.last_disconnect.lock().expect("disconnect lock") = Some(reason);
        *self.transport.lock().await = None;
        self.fail_all_waiters();
        self.events.emit(Event::ConnectionUpdate(ConnectionUpdate {
            connection: ConnectionState::Close,
            last_disconnect: Some(reason),
        }));
        self.events.flush();
    }

    /// Whether the startup routine should be re-entered after a close.
    pub fn should_reconnect(update: &ConnectionUpdate) -> bool {
        update.connection == ConnectionState::Close
            && update
                .last_disconnect
                .map(|reason| reason.should_reconnect())
                .unwrap_or(true)
    }

    /// Run until logged out: connect, process, reconnect on recoverable
    /// closes with linear backoff.
    pub async fn run(self: &Arc<Self>) {
        let mut attempts = 0u32;
        loop {
            match self.connect().await {
                Ok(()) => {
                    attempts = 0;
                    // wait until the transport drops
                    while self.is_connected().await {
                        tokio::time::sleep(Duration::from_millis(500)).await;
                    }
                }
                Err(e) => {
                    warn!(target: "Client", "connect failed: {e}");
                }
            }

            let last = *self.last_disconnect.lock().expect("disconnect lock");
            let update = ConnectionUpdate {
                connection: ConnectionState::Close,
                last_disconnect: last,
            };
            if !Self::should_reconnect(&update) {
                info!(target: "Client", "not reconnecting (logged out)");
                return;
            }

            attempts += 1;
            let delay = Duration::from_secs(u64::from(attempts * 2).min(30));
            info!(target: "Client", "reconnecting in {delay:?} (attempt {attempts})");
            tokio::time::sleep(delay).await;
        }
    }

    /// Graceful shutdown.
    pub async fn disconnect(&self) {
        if let Some(transport) = self.transport.lock().await.take() {
            transport.close().await;
        }
        self.fail_all_waiters();
    }

    /// Marshal and send one stanza.
    pub async fn send_node(&self, node: Node) -> Result<()> {
        let transport = self
            .transport
            .lock()
            .await
            .clone()
            .ok_or(WireError::ConnectionClosed)?;

        debug!(target: "Client/Send", "{node}");
        let payload = binary::marshal(&node);
        transport.send_payload(&payload).await?;
        Ok(())
    }

    /// Route one decoded stanza.
    pub async fn process_node(self: &Arc<Self>, node: Node) {
        debug!(target: "Client/Recv", "{node}");

        if let Some(filter) = &self.config.should_ignore_jid {
            if let Some(from) = node.parse_attr_jid("from") {
                if filter(&from) {
                    debug!(target: "Client/Recv", "ignoring stanza from {from}");
                    return;
                }
            }
        }

        if node.tag == "iq" && self.handle_iq_response(&node) {
            return;
        }

        match node.tag.as_str() {
            "success" => self.handle_success(&node).await,
            "failure" => self.handle_failure(&node).await,
            "stream:error" => self.handle_stream_error(&node).await,
            "iq" => {
                if !self.handle_iq(&node).await {
                    warn!(target: "Client", "unhandled iq: {node}");
                }
            }
            "message" => self.handle_message(&node).await,
            "receipt" => self.handle_receipt(&node).await,
            "notification" => self.handle_notification(&node).await,
            "presence" | "chatstate" => self.handle_presence(&node).await,
            "call" => self.handle_call(&node).await,
            "ack" => {}
            "ib" => debug!(target: "Client", "info broadcast: {node}"),
            _ => {
                warn!(target: "Client", "unknown stanza <{}>, acknowledging", node.tag);
                self.send_stanza_ack(&node).await;
            }
        }
    }

    async fn handle_success(self: &Arc<Self>, node: &Node) {
        info!(target: "Client", "authenticated with server");
        {
            let mut creds = self.creds.lock().await;
            if let Some(lid) = node.get_attr_str("lid").and_then(|s| s.parse().ok()) {
                creds.my_lid = Some(lid);
            }
            if !creds.registered {
                creds.registered = true;
            }
        }
        self.events.emit(Event::CredsUpdate);
        self.events.emit(Event::ConnectionUpdate(ConnectionUpdate {
            connection: ConnectionState::Open,
            last_disconnect: None,
        }));
        self.events.flush();
    }

    async fn handle_failure(&self, node: &Node) {
        let code = node.get_attr_u64("reason").unwrap_or(0) as u16;
        let reason = DisconnectReason::from_code(code);
        warn!(target: "Client", "connect failure, reason {code}");
        self.handle_disconnect(reason).await;
    }

    async fn handle_stream_error(&self, node: &Node) {
        let code = node.get_attr_u64("code").unwrap_or(0) as u16;
        let conflict = node
            .get_child_by_tag("conflict")
            .and_then(|n| n.get_attr_str("type"))
            .unwrap_or("");
        let reason = if conflict == "replaced" {
            DisconnectReason::ConnectionReplaced
        } else if conflict == "device_removed" {
            DisconnectReason::LoggedOut
        } else {
            DisconnectReason::from_code(code)
        };
        warn!(target: "Client", "stream error code={code} conflict={conflict}");
        self.handle_disconnect(reason).await;
    }

    async fn handle_iq(self: &Arc<Self>, node: &Node) -> bool {
        if node.get_attr_str("type") == Some("get") && node.get_child_by_tag("ping").is_some() {
            let id = node.get_attr_str("id").unwrap_or_default().to_string();
            let to = node.parse_attr_jid("from");
            let mut pong = Node::new("iq").attr("id", id).attr("type", "result");
            if let Some(to) = to {
                pong.set_attr("to", to.to_string());
            }
            if let Err(e) = self.send_node(pong).await {
                warn!(target: "Client", "failed to send pong: {e}");
            }
            return true;
        }
        false
    }

    async fn handle_presence(&self, node: &Node) {
        let Some(from) = node.parse_attr_jid("from") else {
            return;
        };
        let unavailable = node.get_attr_str("type") == Some("unavailable")
            || node.get_child_by_tag("paused").is_some();
        self.events
            .emit(Event::PresenceUpdate(crate::types::events::PresenceUpdate {
                from,
                unavailable,
                last_seen: node.get_attr_u64("last").map(|t| t as i64),
            }));
    }

    async fn handle_call(self: &Arc<Self>, node: &Node) {
        let Some(from) = node.parse_attr_jid("from") else {
            return;
        };
        let (call_id, status) = node
            .get_children()
            .and_then(|children| children.first())
            .map(|child| {
                (
                    child.get_attr_str("call-id").unwrap_or_default().to_string(),
                    child.tag.clone(),
                )
            })
            .unwrap_or_default();
        self.events.emit(Event::Call(crate::types::events::CallEvent {
            from,
            call_id,
            status,
        }));
        self.send_stanza_ack(node).await;
    }

    async fn handle_notification(self: &Arc<Self>, node: &Node) {
        let kind = node.get_attr_str("type").unwrap_or("");
        match kind {
            "w:gp2" => {
                if let Some(jid) = node.parse_attr_jid("from") {
                    self.events.emit(Event::GroupsUpdate(crate::types::events::GroupUpdate {
                        jid,
                        subject: node
                            .get_child_by_tag("subject")
                            .and_then(|n| n.get_attr_str("subject"))
                            .map(str::to_string),
                        participants: Vec::new(),
                    }));
                }
            }
            "contacts" => {
                if let Some(jid) = node.parse_attr_jid("from") {
                    self.events
                        .emit(Event::ContactsUpdate(crate::types::events::ContactUpdate {
                            jid,
                            notify: node.get_attr_str("notify").map(str::to_string),
                        }));
                }
            }
            other => debug!(target: "Client", "notification type {other}"),
        }
        self.send_stanza_ack(node).await;
    }

    /// Acknowledge a stanza that carries an id.
    pub(crate) async fn send_stanza_ack(self: &Arc<Self>, node: &Node) {
        let (Some(id), Some(from)) = (node.get_attr_str("id"), node.get_attr_str("from")) else {
            return;
        };
        let mut ack = Node::new("ack")
            .attr("id", id)
            .attr("to", from)
            .attr("class", node.tag.clone());
        if let Some(participant) = node.get_attr_str("participant") {
            ack.set_attr("participant", participant);
        }
        if let Err(e) = self.send_node(ack).await {
            debug!(target: "Client", "failed to ack <{}>: {e}", node.tag);
        }
    }

    pub(crate) fn fail_all_waiters(&self) {
        let mut waiters = self.response_waiters.lock().expect("waiter lock");
        // dropping the senders fails every pending query with ConnectionClosed
        waiters.clear();
    }

    /// The JIDs this account currently answers to.
    pub async fn own_identity(&self) -> Result<(JID, Option<JID>)> {
        let creds = self.creds.lock().await;
        let me = creds.me.clone().ok_or(WireError::NotAuthenticated)?;
        Ok((me, creds.my_lid.clone()))
    }

    /// Generate and upload a fresh pre-key batch, advancing the creds
    /// counters and emitting `creds.update` once the server accepts.
    pub async fn upload_pre_keys(self: &Arc<Self>, count: u32) -> Result<()> {
        use crate::request::{InfoQuery, InfoQueryType};

        let creds_snapshot = self.creds.lock().await.clone();
        let (update, pre_keys) =
            crate::store::creds::get_next_pre_keys(&self.store, &creds_snapshot, count).await?;

        let key_nodes: Vec<Node> = pre_keys
            .iter()
            .map(|pre_key| {
                let mut node = Node::new("key");
                node.add_child(Node::with_bytes(
                    "id",
                    pre_key.key_id.to_be_bytes()[1..].to_vec(),
                ));
                node.add_child(Node::with_bytes("value", pre_key.key_pair.public.to_vec()));
                node
            })
            .collect();

        let mut skey = Node::new("skey");
        skey.add_child(Node::with_bytes(
            "id",
            creds_snapshot.signed_pre_key.key_id.to_be_bytes()[1..].to_vec(),
        ));
        skey.add_child(Node::with_bytes(
            "value",
            creds_snapshot.signed_pre_key.key_pair.public.to_vec(),
        ));
        skey.add_child(Node::with_bytes(
            "signature",
            creds_snapshot.signed_pre_key.signature.clone(),
        ));

        let mut content = vec![
            Node::with_bytes(
                "registration",
                (creds_snapshot.registration_id as u32).to_be_bytes().to_vec(),
            ),
            Node::with_bytes("type", vec![0x05]),
            Node::with_bytes(
                "identity",
                creds_snapshot.signed_identity_key.public_bytes().to_vec(),
            ),
            Node::with_children("list", key_nodes),
        ];
        content.push(skey);

        self.send_iq(InfoQuery {
            namespace: "encrypt",
            query_type: InfoQueryType::Set,
            to: crate::types::jid::SERVER_JID.clone(),
            target: None,
            id: None,
            content: Some(crate::binary::NodeContent::Children(content)),
            timeout: None,
        })
        .await?;

        self.creds.lock().await.apply_pre_key_update(&update);
        self.events.emit(crate::types::events::Event::CredsUpdate);
        self.events.flush();
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::store::MemoryKeyStore;

    /// Channel-backed transport capturing every outbound stanza.
    pub struct MockTransport {
        pub sent: mpsc::UnboundedSender<Node>,
    }

    #[async_trait]
    impl StanzaTransport for MockTransport {
        async fn send_payload(&self, payload: &[u8]) -> std::result::Result<(), SocketError> {
            let node = binary::unmarshal(payload).expect("outbound stanzas are well-formed");
            self.sent.send(node).map_err(|_| SocketError::ConnectionClosed)
        }

        fn is_open(&self) -> bool {
            true
        }

        async fn close(&self) {}
    }

    /// A connected client over a mock transport plus the outbound stream.
    pub async fn connected_client(
        config: SocketConfig,
        creds: AuthenticationCreds,
    ) -> (Arc<Client>, mpsc::UnboundedReceiver<Node>) {
        let client = Client::new(config, creds, Arc::new(MemoryKeyStore::new()));
        let (tx, rx) = mpsc::unbounded_channel();
        client.set_transport(Arc::new(MockTransport { sent: tx })).await;
        (client, rx)
    }

    /// Creds registered as the given user.
    pub fn registered_creds(user: &str, device: u16) -> AuthenticationCreds {
        let mut creds = crate::store::init_auth_creds();
        creds.me = Some(JID {
            user: user.to_string(),
            device,
            ..JID::new(user, crate::types::servers::DEFAULT_USER)
        });
        creds.registered = true;
        creds
    }
}
