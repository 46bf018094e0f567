//! The bidirectional RPC peer.
//!
//! A peer owns one ROUTER socket, a registry, an auth backend, a heartbeat
//! backend and a table of outstanding calls. Both roles are the same type;
//! an initiator knows its counterpart's routing id at construction, a
//! responder learns routing ids from the auth backend as peers connect.

mod calls;
mod dispatch;
mod socket;

use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;
use tracing::warn;

use crate::auth::AuthBackend;
use crate::errors::RpcError;
use crate::heartbeat::{DEFAULT_MONITORING_ENDPOINT, HeartbeatBackend};
use crate::packer::{Packer, TranslationTable, Value};
use crate::plugins::{self, PluginRegistry};
use crate::protocol::{Kind, Message};
use crate::registry::{Registry, RpcEndpoint};

pub(crate) use calls::CallTable;
pub(crate) use socket::{OutboundHandle, SharedSocket};

/// Which end of the conversation a peer plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Connects out and knows the responder's routing id up front.
    Initiator,
    /// Binds and learns initiator routing ids as they appear.
    Responder,
}

/// Construction parameters for a [`Peer`].
///
/// Only `user_id` is mandatory; everything else has the permissive
/// defaults of the `noop` backends and a five second call timeout.
#[derive(Clone)]
pub struct PeerConfig {
    /// Stable application-level identity of this peer.
    pub user_id: Vec<u8>,
    /// Transport identity; responders default it to `user_id`.
    pub routing_id: Option<Vec<u8>>,
    /// Routing id of the remote peer; required for initiators.
    pub peer_routing_id: Option<Vec<u8>>,
    /// Name of the auth backend to load.
    pub security_plugin: String,
    /// Name of the heartbeat backend to load.
    pub heartbeat_plugin: String,
    /// Own CURVE public key (raw 32 bytes or z85 text).
    pub public_key: Option<Vec<u8>>,
    /// Own CURVE secret key.
    pub secret_key: Option<Vec<u8>>,
    /// Remote peer's CURVE public key, for initiators.
    pub peer_public_key: Option<Vec<u8>>,
    /// Password presented during the handshake.
    pub password: Option<Vec<u8>>,
    /// Responder-side credential table; passwords for the PLAIN and
    /// untrusted-curve backends, public keys for `trusted_curve`.
    pub credentials: HashMap<Vec<u8>, Vec<u8>>,
    /// Deadline applied to each call and to socket sends.
    pub timeout: Duration,
    /// PUB endpoint of the testing heartbeat monitor.
    pub monitoring_endpoint: String,
    /// Registry to use; a private one is created when absent.
    pub registry: Option<Arc<Registry>>,
    /// Extension codec table; the built-in datetime table when absent.
    pub translation_table: Option<TranslationTable>,
    /// Peer whose registry is consulted when a name is not found locally.
    pub proxy_to: Option<Peer>,
}

impl PeerConfig {
    /// A configuration with the permissive defaults.
    #[must_use]
    pub fn new(user_id: impl Into<Vec<u8>>) -> Self {
        Self {
            user_id: user_id.into(),
            routing_id: None,
            peer_routing_id: None,
            security_plugin: plugins::NOOP_AUTH_BACKEND.to_owned(),
            heartbeat_plugin: plugins::NOOP_HEARTBEAT_BACKEND.to_owned(),
            public_key: None,
            secret_key: None,
            peer_public_key: None,
            password: None,
            credentials: HashMap::new(),
            timeout: Duration::from_secs(5),
            monitoring_endpoint: DEFAULT_MONITORING_ENDPOINT.to_owned(),
            registry: None,
            translation_table: None,
            proxy_to: None,
        }
    }

    /// Target routing id, for initiators.
    #[must_use]
    pub fn peer_routing_id(mut self, routing_id: impl Into<Vec<u8>>) -> Self {
        self.peer_routing_id = Some(routing_id.into());
        self
    }

    /// Select the auth backend by plugin name.
    #[must_use]
    pub fn security_plugin(mut self, name: impl Into<String>) -> Self {
        self.security_plugin = name.into();
        self
    }

    /// Select the heartbeat backend by plugin name.
    #[must_use]
    pub fn heartbeat_plugin(mut self, name: impl Into<String>) -> Self {
        self.heartbeat_plugin = name.into();
        self
    }

    /// Own CURVE keypair.
    #[must_use]
    pub fn keypair(mut self, public: impl Into<Vec<u8>>, secret: impl Into<Vec<u8>>) -> Self {
        self.public_key = Some(public.into());
        self.secret_key = Some(secret.into());
        self
    }

    /// The remote peer's CURVE public key.
    #[must_use]
    pub fn peer_public_key(mut self, key: impl Into<Vec<u8>>) -> Self {
        self.peer_public_key = Some(key.into());
        self
    }

    /// Handshake password.
    #[must_use]
    pub fn password(mut self, password: impl Into<Vec<u8>>) -> Self {
        self.password = Some(password.into());
        self
    }

    /// Add one responder-side credential entry.
    #[must_use]
    pub fn credential(mut self, user_id: impl Into<Vec<u8>>, secret: impl Into<Vec<u8>>) -> Self {
        self.credentials.insert(user_id.into(), secret.into());
        self
    }

    /// Per-call deadline.
    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Monitoring PUB endpoint for the testing heartbeat backend.
    #[must_use]
    pub fn monitoring_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.monitoring_endpoint = endpoint.into();
        self
    }

    /// Share a registry instead of creating a private one.
    #[must_use]
    pub fn registry(mut self, registry: Arc<Registry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Use a custom extension codec table.
    #[must_use]
    pub fn translation_table(mut self, table: TranslationTable) -> Self {
        self.translation_table = Some(table);
        self
    }

    /// Fall back to another peer's registry for unknown names.
    #[must_use]
    pub fn proxy_to(mut self, peer: Peer) -> Self {
        self.proxy_to = Some(peer);
        self
    }
}

/// Capabilities a backend receives at configure time, in place of a back
/// reference to the peer that owns it.
#[derive(Clone)]
pub struct PeerLink {
    context: zmq::Context,
    outbound: OutboundHandle,
    calls: Arc<CallTable>,
    packer: Packer,
    config: Arc<PeerConfig>,
}

impl PeerLink {
    /// Send a protocol message through the peer's socket, with the peer's
    /// unreachable-retry policy.
    ///
    /// # Errors
    /// Fails when no socket is attached, the transport rejects the send,
    /// or the target stays unreachable after the bounded retries.
    pub async fn send(&self, message: Message) -> Result<(), RpcError> {
        self.outbound.send(message.into_frames()).await
    }

    /// Fail an outstanding call; `false` when the correlation id is not
    /// pending (already resolved or never known).
    pub fn fail_call(&self, correlation_id: &[u8], error: RpcError) -> bool {
        self.calls.resolve(correlation_id, Err(error))
    }

    /// The peer's payload codec.
    #[must_use]
    pub fn packer(&self) -> &Packer {
        &self.packer
    }

    /// The peer's construction parameters.
    #[must_use]
    pub fn config(&self) -> &PeerConfig {
        &self.config
    }

    /// The ZeroMQ context backend sockets must be created in, so inproc
    /// endpoints resolve within this peer.
    #[must_use]
    pub fn context(&self) -> &zmq::Context {
        &self.context
    }
}

struct RunState {
    reader: Option<std::thread::JoinHandle<()>>,
    dispatch: Option<tokio::task::JoinHandle<()>>,
    stop: Option<Arc<AtomicBool>>,
    configured: bool,
}

pub(crate) struct PeerCore {
    pub(crate) config: Arc<PeerConfig>,
    pub(crate) context: zmq::Context,
    pub(crate) registry: Arc<Registry>,
    pub(crate) packer: Packer,
    pub(crate) auth: Arc<dyn AuthBackend>,
    pub(crate) heartbeat: Arc<dyn HeartbeatBackend>,
    pub(crate) calls: Arc<CallTable>,
    pub(crate) socket: SharedSocket,
    pub(crate) outbound: OutboundHandle,
    pub(crate) tasks: Mutex<JoinSet<()>>,
    run: Mutex<RunState>,
}

/// A bidirectional RPC endpoint.
#[derive(Clone)]
pub struct Peer {
    pub(crate) core: Arc<PeerCore>,
}

impl Peer {
    /// An initiator built against the process-wide plugin registry.
    ///
    /// # Errors
    /// Fails when `peer_routing_id` is missing, `routing_id` is set, or a
    /// configured plugin name is unknown.
    pub fn initiator(config: PeerConfig) -> Result<Self, RpcError> {
        Self::with_plugins(Role::Initiator, config, plugins::global())
    }

    /// A responder built against the process-wide plugin registry.
    ///
    /// # Errors
    /// Fails when a configured plugin name is unknown.
    pub fn responder(config: PeerConfig) -> Result<Self, RpcError> {
        Self::with_plugins(Role::Responder, config, plugins::global())
    }

    /// Build a peer against an explicit plugin registry.
    ///
    /// # Errors
    /// Fails on role/config mismatches or unknown plugin names.
    pub fn with_plugins(
        role: Role,
        mut config: PeerConfig,
        registry: &PluginRegistry,
    ) -> Result<Self, RpcError> {
        match role {
            Role::Initiator => {
                if config.peer_routing_id.is_none() {
                    return Err(RpcError::Config(
                        "an initiator needs peer_routing_id".to_owned(),
                    ));
                }
                if config.routing_id.is_some() {
                    return Err(RpcError::Config(
                        "routing_id is chosen by the responder role".to_owned(),
                    ));
                }
            }
            Role::Responder => {
                if config.routing_id.is_none() {
                    config.routing_id = Some(config.user_id.clone());
                }
            }
        }
        let auth = registry.auth(&config.security_plugin, role, &config)?;
        let heartbeat = registry.heartbeat(&config.heartbeat_plugin, role, &config)?;
        let packer = Packer::new(config.translation_table.clone().unwrap_or_default());
        let rpc_registry = config
            .registry
            .clone()
            .unwrap_or_else(|| Arc::new(Registry::new()));
        let shared = SharedSocket::default();
        let core = PeerCore {
            config: Arc::new(config),
            context: zmq::Context::new(),
            registry: rpc_registry,
            packer,
            auth,
            heartbeat,
            calls: Arc::new(CallTable::default()),
            outbound: OutboundHandle::new(shared.clone()),
            socket: shared,
            tasks: Mutex::new(JoinSet::new()),
            run: Mutex::new(RunState {
                reader: None,
                dispatch: None,
                stop: None,
                configured: false,
            }),
        };
        Ok(Self {
            core: Arc::new(core),
        })
    }

    fn link(&self) -> PeerLink {
        PeerLink {
            context: self.core.context.clone(),
            outbound: self.core.outbound.clone(),
            calls: Arc::clone(&self.core.calls),
            packer: self.core.packer.clone(),
            config: Arc::clone(&self.core.config),
        }
    }

    fn setup_socket(&self, probing: bool) -> Result<(), RpcError> {
        let core = &self.core;
        let mut run = core.run.lock().unwrap_or_else(PoisonError::into_inner);
        if !core.socket.is_attached() {
            let socket = core.context.socket(zmq::ROUTER)?;
            if let Some(routing_id) = core.config.routing_id.as_deref() {
                socket.set_identity(routing_id)?;
            }
            socket.set_router_mandatory(true)?;
            if let Err(e) = socket.set_router_handover(true) {
                // older transports lack handover; reconnects then need a
                // fresh routing id to be re-learned
                tracing::debug!(error = %e, "ROUTER_HANDOVER unsupported");
            }
            let timeout_ms =
                i32::try_from(core.config.timeout.as_millis()).unwrap_or(i32::MAX);
            socket.set_sndtimeo(timeout_ms)?;
            core.socket.attach(socket);
        }
        core.socket.with(|s| s.set_probe_router(probing))?;
        if !run.configured {
            let link = self.link();
            core.socket
                .with_ref(|s| core.auth.configure(s, link.clone()))?;
            core.heartbeat.configure(link)?;
            run.configured = true;
        }
        Ok(())
    }

    /// Bind the peer's socket to an endpoint.
    ///
    /// The first call creates the socket, applies the ROUTER options and
    /// configures both backends.
    ///
    /// # Errors
    /// Fails when socket creation, backend configuration, or the bind
    /// itself fails.
    pub fn bind(&self, endpoint: &str) -> Result<(), RpcError> {
        self.setup_socket(false)?;
        self.core.socket.with(|s| s.bind(endpoint))
    }

    /// Connect the peer's socket to an endpoint.
    ///
    /// Enables connect-probing so both sides learn each other's routing id
    /// before the first application message.
    ///
    /// # Errors
    /// Fails when socket creation, backend configuration, or the connect
    /// itself fails.
    pub fn connect(&self, endpoint: &str) -> Result<(), RpcError> {
        self.setup_socket(true)?;
        self.core.socket.with(|s| s.connect(endpoint))
    }

    /// Detach the socket from an endpoint. `connect` again to resume.
    ///
    /// # Errors
    /// Fails when no socket exists or the endpoint was never attached.
    pub fn disconnect(&self, endpoint: &str) -> Result<(), RpcError> {
        self.core.socket.with(|s| s.disconnect(endpoint))
    }

    /// Register an endpoint in the peer's registry.
    pub fn register(&self, endpoint: RpcEndpoint) {
        self.core.registry.register(endpoint);
    }

    /// The registry backing this peer, shareable with other peers.
    #[must_use]
    pub fn registry(&self) -> Arc<Registry> {
        Arc::clone(&self.core.registry)
    }

    /// This peer's stable identity.
    #[must_use]
    pub fn user_id(&self) -> &[u8] {
        &self.core.config.user_id
    }

    /// Number of calls still waiting for a reply.
    #[must_use]
    pub fn pending_calls(&self) -> usize {
        self.core.calls.outstanding()
    }

    /// Launch the reader thread and the dispatch task. Idempotent;
    /// [`Peer::call`] starts the peer on demand.
    ///
    /// # Errors
    /// Fails when the peer has neither bound nor connected.
    pub async fn start(&self) -> Result<(), RpcError> {
        let core = &self.core;
        let mut run = core.run.lock().unwrap_or_else(PoisonError::into_inner);
        if run.dispatch.is_some() {
            return Ok(());
        }
        if !core.socket.is_attached() {
            return Err(RpcError::NotConnected);
        }
        let stop = Arc::new(AtomicBool::new(false));
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        run.reader = Some(socket::spawn_reader(
            core.socket.clone(),
            inbound_tx,
            Arc::clone(&stop),
        ));
        run.dispatch = Some(tokio::spawn(dispatch::run(Arc::clone(core), inbound_rx)));
        run.stop = Some(stop);
        Ok(())
    }

    /// Stop the dispatch loop, close the socket with zero linger, and stop
    /// both backends. Idempotent.
    pub async fn stop(&self) {
        let core = &self.core;
        let (reader, dispatch, stop) = {
            let mut run = core.run.lock().unwrap_or_else(PoisonError::into_inner);
            (run.reader.take(), run.dispatch.take(), run.stop.take())
        };
        if let Some(stop) = stop {
            stop.store(true, std::sync::atomic::Ordering::Relaxed);
        }
        if let Some(dispatch) = dispatch {
            dispatch.abort();
            // cancellation is the expected outcome here
            let _ = dispatch.await;
        }
        if let Some(reader) = reader {
            let _ = tokio::task::spawn_blocking(move || reader.join()).await;
        }
        let mut handlers = {
            let mut tasks = core.tasks.lock().unwrap_or_else(PoisonError::into_inner);
            std::mem::take(&mut *tasks)
        };
        handlers.shutdown().await;
        core.socket.close();
        core.auth.stop().await;
        core.heartbeat.stop().await;
    }

    /// Call a named operation on the remote peer and await its outcome.
    ///
    /// # Errors
    /// Resolves with the remote value, or fails with the reconstructed
    /// remote exception, [`RpcError::Timeout`], [`RpcError::Unauthorized`]
    /// when the handshake retry budget runs out, or a local codec or
    /// transport error.
    pub async fn call(
        &self,
        target: impl AsRef<[u8]>,
        name: &str,
        args: Vec<Value>,
    ) -> Result<Value, RpcError> {
        self.call_with(target, name, args, Vec::new()).await
    }

    /// [`Peer::call`] with keyword arguments.
    ///
    /// # Errors
    /// As [`Peer::call`].
    pub async fn call_with(
        &self,
        target: impl AsRef<[u8]>,
        name: &str,
        args: Vec<Value>,
        kwargs: Vec<(String, Value)>,
    ) -> Result<Value, RpcError> {
        self.start().await?;
        let core = &self.core;
        let routing_id = core
            .auth
            .get_routing_id(target.as_ref())
            .ok_or(RpcError::TransportUnreachable)?;
        let payload = core.packer.pack_work(name, &args, &kwargs)?;
        let message = Message::new(Some(routing_id), Kind::Work, payload);
        let correlation_id = message.correlation_id.clone();

        let (slot, pending) = oneshot::channel();
        core.calls
            .insert(correlation_id.clone(), slot, core.config.timeout);
        core.auth.save_last_work(&message);

        if let Err(e) = core.outbound.send(message.into_frames()).await {
            match e {
                // the deadline decides; the peer may still appear
                RpcError::TransportUnreachable => {
                    warn!(name, "work not routable yet, waiting on the deadline");
                }
                other => {
                    core.calls.resolve(&correlation_id, Err(other));
                }
            }
        }
        pending.await.unwrap_or_else(|_| Err(RpcError::Stopped))
    }

    /// Fluent alternative to [`Peer::call`]:
    /// `peer.send_to(b"server").method("string.upper").arg("x").invoke()`.
    #[must_use]
    pub fn send_to(&self, user_id: impl AsRef<[u8]>) -> CallBuilder<'_> {
        CallBuilder {
            peer: self,
            target: user_id.as_ref().to_vec(),
            name: String::new(),
            args: Vec::new(),
            kwargs: Vec::new(),
        }
    }
}

/// Builder accumulating a call before sending it.
pub struct CallBuilder<'a> {
    peer: &'a Peer,
    target: Vec<u8>,
    name: String,
    args: Vec<Value>,
    kwargs: Vec<(String, Value)>,
}

impl CallBuilder<'_> {
    /// Name of the remote operation, dotted parts included.
    #[must_use]
    pub fn method(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Append one positional argument.
    #[must_use]
    pub fn arg(mut self, value: impl Into<Value>) -> Self {
        self.args.push(value.into());
        self
    }

    /// Append one keyword argument.
    #[must_use]
    pub fn kwarg(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.kwargs.push((name.into(), value.into()));
        self
    }

    /// Send the call and await its outcome.
    ///
    /// # Errors
    /// Fails when no method name was set, plus everything
    /// [`Peer::call`] can fail with.
    pub async fn invoke(self) -> Result<Value, RpcError> {
        if self.name.is_empty() {
            return Err(RpcError::Config("call builder needs a method name".to_owned()));
        }
        self.peer
            .call_with(self.target, &self.name, self.args, self.kwargs)
            .await
    }
}
