//! The gossip node.
//!
//! [`CraftNode`] owns the transport, the guarded [`NodeState`], the acceptance
//! policy and the registered shared objects. Starting it spawns three loops:
//! receive, gossip and merkle sync. All of them observe one shutdown channel.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::acceptance::AcceptancePolicy;
use crate::codec::{self, Digest, MAX_DATAGRAM_SIZE};
use crate::config::NodeConfig;
use crate::error::{NodeError, NodeResult, Rejection};
use crate::message::{ControlMessage, SharedMessage};
use crate::peer::PeerAddr;
use crate::schema::AcceptedType;
use crate::shared_object::{SharedObjectHandle, SharedObjects};
use crate::state::{NodeState, NodeStats};
use crate::store::{FileBackend, MessageStore};
use crate::transport::{Inbound, Transport};

/// State shared by the node handle and its background loops.
pub(crate) struct NodeInner {
    pub(crate) config: NodeConfig,
    pub(crate) transport: Transport,
    pub(crate) state: Mutex<NodeState>,
    pub(crate) objects: RwLock<SharedObjects>,
    pub(crate) policy: RwLock<AcceptancePolicy>,
    pub(crate) running: AtomicBool,
    pub(crate) shutdown: watch::Sender<bool>,
    pub(crate) flush_lock: tokio::sync::Mutex<()>,
}

impl NodeInner {
    pub(crate) fn local(&self) -> &PeerAddr {
        self.transport.local_addr()
    }

    pub(crate) fn objects(&self) -> SharedObjects {
        self.objects.read().clone()
    }

    fn is_stopped(&self) -> bool {
        *self.shutdown.borrow()
    }

    async fn receive_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        loop {
            match self.transport.receive(&mut shutdown).await {
                Ok(Inbound::Datagram(bytes, from)) => {
                    self.handle_datagram(&bytes, PeerAddr::from(from)).await;
                }
                Ok(Inbound::Stopped) => break,
                Err(e) => {
                    if !self.running.load(Ordering::SeqCst) {
                        break;
                    }
                    warn!(error = %e, "receive failed");
                }
            }
        }
        debug!(node = %self.local(), "receive loop stopped");
    }

    /// Runs one datagram through the pipeline: ban filter, dedup, decode,
    /// acceptance, control dispatch, shared objects, then store and
    /// rebroadcast. Every rejection strikes the sender.
    pub(crate) async fn handle_datagram(&self, bytes: &[u8], from: PeerAddr) {
        let digest = codec::digest(bytes);
        {
            let mut state = self.state.lock();
            state.stats.datagrams_received += 1;
            if state.is_banned(&from, Utc::now()) {
                state.stats.banned_dropped += 1;
                debug!(peer = %from, "dropping datagram from banned peer");
                return;
            }
            if state.has_seen(&digest) {
                state.stats.duplicates_dropped += 1;
                return;
            }
        }

        match self.admit(bytes, &from).await {
            Ok(Admitted::Message {
                message,
                json,
                objects,
            }) => match objects.absorb(&message) {
                Ok(()) => self.store_and_rebroadcast(&digest, json, bytes).await,
                Err(fault) => {
                    self.state.lock().quarantine(digest);
                    self.reject(&from, &fault);
                }
            },
            Ok(Admitted::Served) => {}
            Err(rejection) => self.reject(&from, &rejection),
        }
        self.persist().await;
    }

    /// Decodes and checks a novel datagram. Sync requests are answered here
    /// and never stored, so a repeated poll for the same head is served
    /// every time.
    async fn admit(&self, bytes: &[u8], from: &PeerAddr) -> Result<Admitted, Rejection> {
        let (message, json) =
            codec::decode(bytes).map_err(|e| Rejection::Decode(e.to_string()))?;

        if !self.policy.read().accepts(&message.data) {
            return Err(Rejection::NotAccepted);
        }

        match ControlMessage::parse(&message.data)? {
            Some(ControlMessage::RequestSharedObjectUpdate { class_name, digest }) => {
                self.serve_update(&class_name, &digest, from).await;
                return Ok(Admitted::Served);
            }
            Some(control) => self.handle_control(control, from).await,
            None => {}
        }

        let objects = self.objects();
        objects.validate(&message)?;
        Ok(Admitted::Message {
            message,
            json,
            objects,
        })
    }

    fn reject(&self, from: &PeerAddr, rejection: &Rejection) {
        debug!(peer = %from, reason = %rejection, "message rejected");
        let mut state = self.state.lock();
        state.stats.rejections += 1;
        state.strike(from, Utc::now());
    }

    async fn store_and_rebroadcast(&self, digest: &Digest, json: String, bytes: &[u8]) {
        {
            let mut state = self.state.lock();
            if state.store.has(digest) {
                return;
            }
            state.store.put(digest, json);
            state.stats.messages_accepted += 1;
        }
        debug!(digest = %digest.short(), "stored new message");
        self.broadcast(bytes).await;
    }

    /// Writes pending store changes on the blocking pool. Writers queue on
    /// `flush_lock`, and each takes its snapshot after acquiring it, so
    /// snapshots land on disk in order.
    pub(crate) async fn flush_store(&self) -> NodeResult<()> {
        let _writer = self.flush_lock.lock().await;
        let pending = self.state.lock().store.snapshot()?;
        let Some(snapshot) = pending else {
            return Ok(());
        };
        let written = tokio::task::spawn_blocking(move || snapshot.write())
            .await
            .map_err(|e| NodeError::Store(format!("flush task failed: {e}")))
            .and_then(|result| result);
        if written.is_err() {
            self.state.lock().store.mark_dirty();
        }
        written
    }

    /// Flushes and logs any failure.
    pub(crate) async fn persist(&self) {
        if let Err(e) = self.flush_store().await {
            warn!(error = %e, "failed to flush store");
        }
    }

    async fn handle_control(&self, control: ControlMessage, from: &PeerAddr) {
        match control {
            ControlMessage::PeerDiscovery(announcer) => {
                self.connect(announcer, true).await;
            }
            ControlMessage::RequestLocalPeers(requester) => {
                if self.config.local_discovery {
                    self.send_local_peers(&requester).await;
                }
            }
            ControlMessage::LocalPeers(peers) => self.handle_local_peers(peers, from).await,
            ControlMessage::RequestSharedObjectUpdate { class_name, digest } => {
                self.serve_update(&class_name, &digest, from).await;
            }
        }
    }
}

/// A novel datagram that passed every check.
enum Admitted {
    /// Validated by every object and ready to absorb with the same set.
    Message {
        message: SharedMessage,
        json: String,
        objects: SharedObjects,
    },
    /// A sync request, already answered.
    Served,
}

/// A gossip node.
///
/// ```no_run
/// # async fn run() -> craft_node::NodeResult<()> {
/// use craft_node::{CraftNode, NodeConfig};
///
/// let node = CraftNode::bind(NodeConfig::default()).await?;
/// node.start()?;
/// node.connect_to_peer("127.0.0.1:7000".parse()?, true).await?;
/// node.create_shared_message(serde_json::json!({"x": 1})).await?;
/// node.stop().await;
/// # Ok(())
/// # }
/// ```
pub struct CraftNode {
    inner: Arc<NodeInner>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for CraftNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CraftNode")
            .field("local", self.inner.local())
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

impl CraftNode {
    /// Validates `config`, binds the socket and opens the message store.
    ///
    /// The store file name depends on the bound port, so it is opened after
    /// binding.
    pub async fn bind(config: NodeConfig) -> NodeResult<Self> {
        config.validate()?;
        let policy = AcceptancePolicy::with_types(config.accepted_types()?);

        let transport = Transport::bind(config.bind_mode()).await?;
        let local = transport.local_addr().clone();

        let store = if config.persistent {
            let path = config.store_path(local.port());
            if config.reset_db {
                FileBackend::reset(&path)?;
            }
            MessageStore::new(Box::new(FileBackend::open(path)?))
        } else {
            MessageStore::in_memory()
        };
        let state = NodeState::restore(store, local, config.max_peers);
        let (shutdown, _) = watch::channel(false);

        Ok(Self {
            inner: Arc::new(NodeInner {
                config,
                transport,
                state: Mutex::new(state),
                objects: RwLock::new(SharedObjects::new()),
                policy: RwLock::new(policy),
                running: AtomicBool::new(false),
                shutdown,
                flush_lock: tokio::sync::Mutex::new(()),
            }),
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Spawns the receive, gossip and sync loops. Calling it again while
    /// running does nothing; a stopped node cannot be restarted.
    pub fn start(&self) -> NodeResult<()> {
        if self.inner.is_stopped() {
            return Err(NodeError::NotRunning);
        }
        if self.inner.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let mut tasks = self.tasks.lock();
        tasks.push(tokio::spawn(
            Arc::clone(&self.inner).receive_loop(self.inner.shutdown.subscribe()),
        ));
        tasks.push(tokio::spawn(
            Arc::clone(&self.inner).gossip_loop(self.inner.shutdown.subscribe()),
        ));
        tasks.push(tokio::spawn(
            Arc::clone(&self.inner).sync_loop(self.inner.shutdown.subscribe()),
        ));
        info!(
            node = %self.inner.local(),
            persistent = self.inner.config.persistent,
            "node started"
        );
        Ok(())
    }

    /// Signals every loop to stop, waits for them, and flushes the store.
    pub async fn stop(&self) {
        self.inner.running.store(false, Ordering::SeqCst);
        self.inner.shutdown.send_replace(true);

        let tasks = std::mem::take(&mut *self.tasks.lock());
        for result in futures::future::join_all(tasks).await {
            if let Err(e) = result {
                warn!(error = %e, "node task ended abnormally");
            }
        }
        if let Err(e) = self.inner.flush_store().await {
            warn!(error = %e, "failed to flush store on stop");
        }
        info!(node = %self.inner.local(), "node stopped");
    }

    /// Returns true between [`start`](Self::start) and [`stop`](Self::stop).
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Address announced to peers.
    #[must_use]
    pub fn local_addr(&self) -> PeerAddr {
        self.inner.local().clone()
    }

    /// Socket address the OS bound.
    pub fn socket_addr(&self) -> NodeResult<SocketAddr> {
        self.inner.transport.socket_addr()
    }

    /// The configuration the node was bound with.
    #[must_use]
    pub fn config(&self) -> &NodeConfig {
        &self.inner.config
    }

    /// Registers a shared object. Objects only see messages that arrive
    /// after registration.
    pub fn add_shared_object(&self, object: SharedObjectHandle) {
        self.inner.objects.write().push(object);
    }

    /// Restricts accepted messages to the registered types plus `accepted`.
    pub fn accept_message_type(&self, accepted: impl Into<AcceptedType>) {
        self.inner.policy.write().register(accepted.into());
    }

    /// Adds `peer` to the directory. With `announce` the peer is sent a
    /// `PEER_DISCOVERY` so it connects back. Returns true if the directory
    /// changed.
    pub async fn connect_to_peer(&self, peer: PeerAddr, announce: bool) -> NodeResult<bool> {
        self.ensure_open()?;
        Ok(self.inner.connect(peer, announce).await)
    }

    /// Asks `peer` for its peer list and connects to every peer it returns.
    pub async fn connect_to_peer_locally(&self, peer: PeerAddr) -> NodeResult<()> {
        self.ensure_open()?;
        self.inner.request_local_peers(peer).await
    }

    /// Bans `peer` for the ban window.
    pub async fn ban_peer(&self, peer: PeerAddr) {
        self.inner.state.lock().ban(peer, Utc::now());
        self.inner.persist().await;
    }

    /// Originates a message: validates it with every shared object, absorbs
    /// it, stores it and broadcasts it to all peers.
    pub async fn create_shared_message(
        &self,
        data: impl Into<Value>,
    ) -> NodeResult<(Digest, SharedMessage)> {
        self.ensure_open()?;
        let message = SharedMessage::new(data);
        let encoded = codec::encode(&message)?;
        if encoded.bytes.len() > MAX_DATAGRAM_SIZE {
            return Err(NodeError::PayloadTooLarge {
                size: encoded.bytes.len(),
                max: MAX_DATAGRAM_SIZE,
            });
        }

        let objects = self.inner.objects();
        objects.validate(&message).map_err(|rejection| match rejection {
            Rejection::SharedObject(class_name) | Rejection::ConsumerFault(class_name) => {
                NodeError::SharedObjectRejected { class_name }
            }
            other => NodeError::SharedObjectRejected {
                class_name: other.to_string(),
            },
        })?;
        if let Err(e) = objects.absorb(&message) {
            warn!(error = %e, "shared object failed to absorb local message");
        }

        {
            let mut state = self.inner.state.lock();
            if !state.store.has(&encoded.digest) {
                state.store.put(&encoded.digest, encoded.json.clone());
                state.stats.messages_accepted += 1;
            }
        }
        self.inner.flush_store().await?;
        debug!(digest = %encoded.digest.short(), "created message");
        self.inner.broadcast(&encoded.bytes).await;
        Ok((encoded.digest, message))
    }

    /// Feeds a raw datagram through the receive pipeline as if it came from
    /// `from`.
    pub async fn inject_datagram(&self, bytes: &[u8], from: PeerAddr) {
        self.inner.handle_datagram(bytes, from).await;
    }

    /// Current peers, oldest first.
    #[must_use]
    pub fn peers(&self) -> Vec<PeerAddr> {
        self.inner.state.lock().peers.to_vec()
    }

    /// Bans in force and their expiry.
    #[must_use]
    pub fn banned_peers(&self) -> Vec<(PeerAddr, DateTime<Utc>)> {
        self.inner.state.lock().bans.active(Utc::now())
    }

    /// Returns true if `peer` is banned now.
    #[must_use]
    pub fn is_banned(&self, peer: &PeerAddr) -> bool {
        self.inner.state.lock().is_banned(peer, Utc::now())
    }

    /// Returns true if a message with this digest is stored.
    #[must_use]
    pub fn has_message(&self, digest: &Digest) -> bool {
        self.inner.state.lock().store.has(digest)
    }

    /// Stored message for `digest`.
    #[must_use]
    pub fn get_message(&self, digest: &Digest) -> Option<SharedMessage> {
        let json = self.inner.state.lock().store.get(digest)?;
        match SharedMessage::from_json(&json) {
            Ok(message) => Some(message),
            Err(e) => {
                warn!(digest = %digest, error = %e, "stored message does not parse");
                None
            }
        }
    }

    /// Digests of every stored message.
    #[must_use]
    pub fn message_digests(&self) -> Vec<Digest> {
        self.inner.state.lock().store.keys()
    }

    /// Number of stored messages.
    #[must_use]
    pub fn message_count(&self) -> usize {
        self.inner.state.lock().store.len()
    }

    /// Snapshot of the node counters.
    #[must_use]
    pub fn stats(&self) -> NodeStats {
        self.inner.state.lock().stats
    }

    fn ensure_open(&self) -> NodeResult<()> {
        if self.inner.is_stopped() {
            Err(NodeError::NotRunning)
        } else {
            Ok(())
        }
    }
}

impl Drop for CraftNode {
    fn drop(&mut self) {
        self.inner.running.store(false, Ordering::SeqCst);
        self.inner.shutdown.send_replace(true);
    }
}
