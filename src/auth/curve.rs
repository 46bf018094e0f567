//! CURVE-mechanism backends.
//!
//! `trusted_curve` accepts only pre-shared public keys and maps them to
//! user ids through ZAP. `untrusted_curve` runs the two-step challenge:
//! the transport accepts any key, labelling unknown callers by their
//! z85-encoded public key, and the application handshake promotes a key to
//! trusted once the peer presents valid `(user_id, password)` credentials.
//! Trust is keyed on the public key, so it survives reconnects.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use tracing::{debug, error, warn};

use crate::errors::RpcError;
use crate::peer::PeerLink;
use crate::protocol::{Kind, Message};
use crate::registry::CallerContext;

use super::AuthBackend;
use super::zap::{ZapListener, ZapReply, ZapRequest};

const CURVE_KEY_LEN: usize = 32;
const Z85_KEY_LEN: usize = 40;

/// Challenge retry budget of the untrusted-curve initiator.
pub const DEFAULT_MAX_RETRIES: usize = 2;

/// Normalise a configured key (raw 32 bytes or 40-character z85 text) to
/// the binary form libzmq expects on socket options.
pub(crate) fn binary_key(stored: &[u8]) -> Result<Vec<u8>, RpcError> {
    match stored.len() {
        CURVE_KEY_LEN => Ok(stored.to_vec()),
        Z85_KEY_LEN => {
            let text = std::str::from_utf8(stored)
                .map_err(|_| RpcError::Config("z85 key is not UTF-8".to_owned()))?;
            zmq::z85_decode(text).map_err(|e| RpcError::Config(format!("bad z85 key: {e}")))
        }
        other => Err(RpcError::Config(format!(
            "curve key must be 32 binary or 40 z85 bytes, got {other}"
        ))),
    }
}

fn require<'a>(key: &'a Option<Vec<u8>>, what: &str) -> Result<&'a [u8], RpcError> {
    key.as_deref()
        .ok_or_else(|| RpcError::Config(format!("{what} is required for a curve backend")))
}

fn apply_client_keys(socket: &zmq::Socket, link: &PeerLink) -> Result<(), RpcError> {
    let config = link.config();
    socket.set_curve_serverkey(&binary_key(require(&config.peer_public_key, "peer_public_key")?)?)?;
    socket.set_curve_publickey(&binary_key(require(&config.public_key, "public_key")?)?)?;
    socket.set_curve_secretkey(&binary_key(require(&config.secret_key, "secret_key")?)?)?;
    Ok(())
}

fn apply_server_keys(socket: &zmq::Socket, link: &PeerLink) -> Result<(), RpcError> {
    let config = link.config();
    socket.set_curve_publickey(&binary_key(require(&config.public_key, "public_key")?)?)?;
    socket.set_curve_secretkey(&binary_key(require(&config.secret_key, "secret_key")?)?)?;
    socket.set_curve_server(true)?;
    Ok(())
}

/// Initiator side of `trusted_curve`: pin the responder's public key.
#[derive(Default)]
pub struct TrustedCurveClient;

impl AuthBackend for TrustedCurveClient {
    fn configure(&self, socket: &zmq::Socket, link: PeerLink) -> Result<(), RpcError> {
        apply_client_keys(socket, &link)
    }
}

/// Responder side of `trusted_curve`: accept pre-shared keys only.
pub struct TrustedCurveServer {
    /// `user_id -> public key` table, keys in either accepted form.
    known_keys: HashMap<Vec<u8>, Vec<u8>>,
    routing: Mutex<HashMap<Vec<u8>, Vec<u8>>>,
    listener: Mutex<Option<ZapListener>>,
}

impl TrustedCurveServer {
    /// A responder trusting exactly the given `user_id -> public key` map.
    #[must_use]
    pub fn new(known_keys: HashMap<Vec<u8>, Vec<u8>>) -> Self {
        Self {
            known_keys,
            routing: Mutex::new(HashMap::new()),
            listener: Mutex::new(None),
        }
    }

    fn evaluate(known: &HashMap<Vec<u8>, Vec<u8>>, request: &ZapRequest) -> ZapReply {
        if request.mechanism != b"CURVE" {
            return ZapReply::unauthorized();
        }
        let [key] = request.credentials.as_slice() else {
            return ZapReply::unauthorized();
        };
        known
            .iter()
            .find(|(_, stored)| binary_key(stored).is_ok_and(|k| k == *key))
            .map_or_else(ZapReply::unauthorized, |(user, _)| ZapReply::ok(user.clone()))
    }
}

#[async_trait]
impl AuthBackend for TrustedCurveServer {
    fn configure(&self, socket: &zmq::Socket, link: PeerLink) -> Result<(), RpcError> {
        apply_server_keys(socket, &link)?;
        let known = self.known_keys.clone();
        let listener =
            ZapListener::spawn(link.context(), move |request| Self::evaluate(&known, request))?;
        *self
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(listener);
        Ok(())
    }

    async fn stop(&self) {
        let listener = self
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(listener) = listener {
            listener.stop().await;
        }
    }

    fn get_routing_id(&self, user_id: &[u8]) -> Option<Vec<u8>> {
        self.routing
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(user_id)
            .cloned()
    }

    fn register_routing_id(&self, user_id: &[u8], routing_id: &[u8]) {
        self.routing
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(user_id.to_vec(), routing_id.to_vec());
    }
}

/// Initiator side of the two-step `untrusted_curve` handshake.
///
/// Defers outbound WORKs until the responder acknowledges the HELLO
/// credentials, then replays them in FIFO order. The challenge retry
/// budget is bounded; exhausting it fails the pending call with
/// [`RpcError::Unauthorized`].
pub struct UntrustedCurveClient {
    max_retries: usize,
    attempts: Mutex<usize>,
    authenticated: AtomicBool,
    outbox: Mutex<VecDeque<Message>>,
    link: Mutex<Option<PeerLink>>,
}

impl Default for UntrustedCurveClient {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_RETRIES)
    }
}

impl UntrustedCurveClient {
    /// An initiator backend with an explicit challenge retry budget.
    #[must_use]
    pub fn new(max_retries: usize) -> Self {
        Self {
            max_retries,
            attempts: Mutex::new(0),
            authenticated: AtomicBool::new(false),
            outbox: Mutex::new(VecDeque::new()),
            link: Mutex::new(None),
        }
    }

    fn link(&self) -> Option<PeerLink> {
        self.link
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl AuthBackend for UntrustedCurveClient {
    fn configure(&self, socket: &zmq::Socket, link: PeerLink) -> Result<(), RpcError> {
        apply_client_keys(socket, &link)?;
        *self.link.lock().unwrap_or_else(PoisonError::into_inner) = Some(link);
        Ok(())
    }

    async fn handle_authentication(
        &self,
        _user_id: &[u8],
        routing_id: &[u8],
        correlation_id: &[u8],
    ) {
        let Some(link) = self.link() else {
            warn!("challenge received before the backend was configured");
            return;
        };
        let attempt = {
            let mut attempts = self.attempts.lock().unwrap_or_else(PoisonError::into_inner);
            let current = *attempts;
            *attempts += 1;
            current
        };
        if attempt >= self.max_retries {
            if !link.fail_call(
                correlation_id,
                RpcError::Unauthorized("max authentication retries reached".to_owned()),
            ) {
                debug!("challenge exhausted for an unknown correlation id");
            }
            return;
        }
        let config = link.config();
        let payload = match link
            .packer()
            .pack_hello(&config.user_id, config.password.as_deref().unwrap_or_default())
        {
            Ok(payload) => payload,
            Err(e) => {
                error!(error = %e, "cannot encode HELLO credentials");
                return;
            }
        };
        let hello = Message::reply(
            routing_id.to_vec(),
            correlation_id.to_vec(),
            Kind::Hello,
            payload,
        );
        if let Err(e) = link.send(hello).await {
            warn!(error = %e, "failed to send HELLO");
        }
    }

    async fn handle_authenticated(&self, _correlation_id: &[u8]) {
        self.authenticated.store(true, Ordering::Relaxed);
        loop {
            let deferred = self
                .outbox
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .pop_front();
            let Some(message) = deferred else { break };
            if let Some(link) = self.link() {
                if let Err(e) = link.send(message).await {
                    warn!(error = %e, "failed to replay deferred message");
                }
            }
        }
    }

    fn save_last_work(&self, message: &Message) {
        if !self.authenticated.load(Ordering::Relaxed) {
            self.outbox
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push_back(message.clone());
        }
    }
}

#[derive(Default)]
struct TrustState {
    /// Binary public key -> user id, the promoted identities.
    trusted_keys: HashMap<Vec<u8>, Vec<u8>>,
    /// Routing id -> z85 key label pinned by a rejected first message.
    pending_keys: HashMap<Vec<u8>, Vec<u8>>,
    /// User id (or key label) -> routing id.
    routing: HashMap<Vec<u8>, Vec<u8>>,
}

impl TrustState {
    fn is_trusted_label(&self, user_id: &[u8]) -> bool {
        if self.trusted_keys.values().any(|user| user == user_id) {
            return true;
        }
        label_to_key(user_id).is_some_and(|key| self.trusted_keys.contains_key(&key))
    }

    fn resolve_user(&self, user_id: &[u8]) -> Option<Vec<u8>> {
        if self.trusted_keys.values().any(|user| user == user_id) {
            return Some(user_id.to_vec());
        }
        label_to_key(user_id).and_then(|key| self.trusted_keys.get(&key).cloned())
    }
}

fn label_to_key(label: &[u8]) -> Option<Vec<u8>> {
    let text = std::str::from_utf8(label).ok()?;
    (label.len() == Z85_KEY_LEN)
        .then(|| zmq::z85_decode(text).ok())
        .flatten()
}

/// Responder side of the two-step `untrusted_curve` handshake.
pub struct UntrustedCurveServer {
    /// `user_id -> password` table consulted by HELLO.
    credentials: HashMap<Vec<u8>, Vec<u8>>,
    state: Arc<Mutex<TrustState>>,
    listener: Mutex<Option<ZapListener>>,
    link: Mutex<Option<PeerLink>>,
}

impl UntrustedCurveServer {
    /// A responder validating HELLO against the given credential table.
    #[must_use]
    pub fn new(credentials: HashMap<Vec<u8>, Vec<u8>>) -> Self {
        Self {
            credentials,
            state: Arc::new(Mutex::new(TrustState::default())),
            listener: Mutex::new(None),
            link: Mutex::new(None),
        }
    }

    fn link(&self) -> Option<PeerLink> {
        self.link
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    async fn send_status(&self, routing_id: &[u8], correlation_id: &[u8], kind: Kind, text: String) {
        let Some(link) = self.link() else {
            warn!("handshake event before the backend was configured");
            return;
        };
        let reply = Message::reply(
            routing_id.to_vec(),
            correlation_id.to_vec(),
            kind,
            text.into_bytes(),
        );
        if let Err(e) = link.send(reply).await {
            warn!(error = %e, "failed to send handshake status");
        }
    }

    /// Promote the key pinned for `routing_id` to `login`, guarding
    /// against two keys claiming the same identity.
    fn promote(&self, routing_id: &[u8], login: &[u8]) -> Result<(), String> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let label = state
            .pending_keys
            .remove(routing_id)
            .ok_or_else(|| "no pending key for this connection".to_owned())?;
        let key = label_to_key(&label).ok_or_else(|| "pinned key label is not z85".to_owned())?;

        let existing = state
            .trusted_keys
            .iter()
            .find(|(_, user)| user.as_slice() == login)
            .map(|(k, _)| k.clone());
        if let Some(existing_key) = existing {
            if existing_key != key {
                state.trusted_keys.remove(&existing_key);
                state.routing.remove(login);
                return Err(format!(
                    "identity collision: two keys claim {:?}",
                    String::from_utf8_lossy(login)
                ));
            }
        }

        state.trusted_keys.insert(key, login.to_vec());
        state.routing.insert(login.to_vec(), routing_id.to_vec());
        state.routing.remove(&label);
        Ok(())
    }
}

#[async_trait]
impl AuthBackend for UntrustedCurveServer {
    fn configure(&self, socket: &zmq::Socket, link: PeerLink) -> Result<(), RpcError> {
        apply_server_keys(socket, &link)?;
        let state = Arc::clone(&self.state);
        let listener = ZapListener::spawn(link.context(), move |request| {
            if request.mechanism != b"CURVE" {
                return ZapReply::unauthorized();
            }
            let [key] = request.credentials.as_slice() else {
                return ZapReply::unauthorized();
            };
            let trusted = state
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .trusted_keys
                .get(key)
                .cloned();
            match trusted {
                Some(user) => ZapReply::ok(user),
                // accept the connection but label it by its key; the
                // application handshake decides whether to trust it
                None => match zmq::z85_encode(key) {
                    Ok(label) => ZapReply::ok(label.into_bytes()),
                    Err(_) => ZapReply::unauthorized(),
                },
            }
        })?;
        *self
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(listener);
        *self.link.lock().unwrap_or_else(PoisonError::into_inner) = Some(link);
        Ok(())
    }

    async fn stop(&self) {
        let listener = self
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(listener) = listener {
            listener.stop().await;
        }
    }

    fn is_authenticated(&self, user_id: &[u8]) -> bool {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_trusted_label(user_id)
    }

    async fn handle_authentication(&self, user_id: &[u8], routing_id: &[u8], correlation_id: &[u8]) {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pending_keys
            .insert(routing_id.to_vec(), user_id.to_vec());
        self.send_status(
            routing_id,
            correlation_id,
            Kind::Unauthorized,
            "Authentication Required".to_owned(),
        )
        .await;
    }

    async fn handle_hello(
        &self,
        _user_id: &[u8],
        routing_id: &[u8],
        correlation_id: &[u8],
        payload: &[u8],
    ) {
        let Some(link) = self.link() else {
            warn!("HELLO before the backend was configured");
            return;
        };
        let credentials = link.packer().unpack_hello(payload);
        let Ok((login, password)) = credentials else {
            warn!("undecodable HELLO payload");
            self.send_status(
                routing_id,
                correlation_id,
                Kind::Unauthorized,
                "Authentication Error".to_owned(),
            )
            .await;
            return;
        };
        if self.credentials.get(&login) != Some(&password) {
            self.send_status(
                routing_id,
                correlation_id,
                Kind::Unauthorized,
                "Authentication Error".to_owned(),
            )
            .await;
            return;
        }
        match self.promote(routing_id, &login) {
            Ok(()) => {
                let welcome = format!("Welcome {:?}", String::from_utf8_lossy(&login));
                self.send_status(routing_id, correlation_id, Kind::Authenticated, welcome)
                    .await;
            }
            Err(reason) => {
                error!(%reason, "refusing HELLO");
                self.send_status(routing_id, correlation_id, Kind::Unauthorized, reason)
                    .await;
            }
        }
    }

    fn predicate_context(&self, user_id: &[u8]) -> CallerContext {
        CallerContext {
            user_id: self
                .state
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .resolve_user(user_id),
            extras: HashMap::new(),
        }
    }

    fn get_routing_id(&self, user_id: &[u8]) -> Option<Vec<u8>> {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .routing
            .get(user_id)
            .cloned()
    }

    fn register_routing_id(&self, user_id: &[u8], routing_id: &[u8]) {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .routing
            .insert(user_id.to_vec(), routing_id.to_vec());
    }
}
