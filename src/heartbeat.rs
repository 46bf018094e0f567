//! Pluggable heartbeat backends.
//!
//! Every inbound message counts as a liveness tick, so a backend only has
//! to emit periodic HEARTBEAT frames on one side and watch for silence on
//! the other. The testing backend publishes its observations on a PUB
//! socket so tests and operators can follow peer-alive and peer-gone
//! transitions from outside.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::errors::RpcError;
use crate::peer::PeerLink;
use crate::protocol::{Kind, Message};

/// Emission interval of the testing initiator backend.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_millis(100);
/// Silence budget before the testing responder declares a peer gone.
pub const HEARTBEAT_TIMEOUT: Duration = Duration::from_millis(200);
/// Default endpoint of the testing responder's monitoring PUB socket.
pub const DEFAULT_MONITORING_ENDPOINT: &str = "ipc://testing_heartbeating_backend";
/// Prefix of a peer-gone monitoring event.
pub const GONE_PREFIX: &[u8] = b"Gone ";

/// Behavioural contract of a heartbeat backend.
#[async_trait]
pub trait HeartbeatBackend: Send + Sync {
    /// Start timers or sockets the backend needs.
    ///
    /// Called once, at the peer's first `bind` or `connect`.
    ///
    /// # Errors
    /// Fails when a monitoring resource cannot be created.
    fn configure(&self, link: PeerLink) -> Result<(), RpcError>;

    /// A liveness tick for `user_id`; every inbound message produces one.
    async fn handle_heartbeat(&self, user_id: &[u8], routing_id: &[u8]) {
        let _ = (user_id, routing_id);
    }

    /// The peer stayed silent past the timeout.
    async fn handle_timeout(&self, user_id: &[u8], routing_id: &[u8]) {
        let _ = (user_id, routing_id);
    }

    /// Stop everything [`HeartbeatBackend::configure`] started.
    async fn stop(&self) {}
}

/// Heartbeat backend that does nothing at all.
#[derive(Default)]
pub struct NoopHeartbeat;

impl HeartbeatBackend for NoopHeartbeat {
    fn configure(&self, _link: PeerLink) -> Result<(), RpcError> {
        Ok(())
    }
}

/// Initiator half of `testing_heartbeat_backend`: emits a HEARTBEAT frame
/// to the configured peer every [`HEARTBEAT_INTERVAL`].
#[derive(Default)]
pub struct TestingHeartbeatEmitter {
    task: Mutex<Option<JoinHandle<()>>>,
}

#[async_trait]
impl HeartbeatBackend for TestingHeartbeatEmitter {
    fn configure(&self, link: PeerLink) -> Result<(), RpcError> {
        let Some(target) = link.config().peer_routing_id.clone() else {
            return Err(RpcError::Config(
                "testing heartbeat emitter needs peer_routing_id".to_owned(),
            ));
        };
        let task = tokio::spawn(async move {
            let mut ticks = tokio::time::interval(HEARTBEAT_INTERVAL);
            ticks.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticks.tick().await;
                let beat = Message::new(Some(target.clone()), Kind::Heartbeat, Vec::new());
                if let Err(e) = link.send(beat).await {
                    debug!(error = %e, "heartbeat not delivered");
                }
            }
        });
        *self.task.lock().unwrap_or_else(PoisonError::into_inner) = Some(task);
        Ok(())
    }

    async fn stop(&self) {
        let task = self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            task.abort();
            let _ = task.await;
        }
    }
}

struct TimerSlot {
    generation: u64,
    handle: JoinHandle<()>,
}

struct MonitorInner {
    monitoring: Mutex<Option<zmq::Socket>>,
    timers: Mutex<HashMap<Vec<u8>, TimerSlot>>,
    generation: AtomicU64,
}

impl MonitorInner {
    fn publish(&self, event: &[u8]) {
        let guard = self.monitoring.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(socket) = guard.as_ref() {
            if let Err(e) = socket.send(event, 0) {
                warn!(error = %e, "monitoring publish failed");
            }
        }
    }

    /// Declare the peer gone: at most one event per silence.
    ///
    /// A timer passes its generation so a tick that re-armed the peer in
    /// the meantime invalidates the stale expiry instead of producing a
    /// second gone event.
    fn expire(&self, user_id: &[u8], expected_generation: Option<u64>) {
        {
            let mut timers = self.timers.lock().unwrap_or_else(PoisonError::into_inner);
            match timers.get(user_id) {
                Some(slot) => {
                    if expected_generation.is_some_and(|g| slot.generation != g) {
                        return;
                    }
                    if let Some(slot) = timers.remove(user_id) {
                        slot.handle.abort();
                    }
                }
                None => {
                    if expected_generation.is_some() {
                        return;
                    }
                }
            }
        }
        let mut event = GONE_PREFIX.to_vec();
        event.extend_from_slice(user_id);
        self.publish(&event);
    }
}

/// Responder half of `testing_heartbeat_backend`: publishes liveness and
/// fires [`HeartbeatBackend::handle_timeout`] after
/// [`HEARTBEAT_TIMEOUT`] of silence, once per silent peer.
pub struct TestingHeartbeatMonitor {
    inner: Arc<MonitorInner>,
}

impl Default for TestingHeartbeatMonitor {
    fn default() -> Self {
        Self {
            inner: Arc::new(MonitorInner {
                monitoring: Mutex::new(None),
                timers: Mutex::new(HashMap::new()),
                generation: AtomicU64::new(0),
            }),
        }
    }
}

#[async_trait]
impl HeartbeatBackend for TestingHeartbeatMonitor {
    fn configure(&self, link: PeerLink) -> Result<(), RpcError> {
        let socket = link.context().socket(zmq::PUB)?;
        socket.set_linger(0)?;
        socket.bind(&link.config().monitoring_endpoint)?;
        *self
            .inner
            .monitoring
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(socket);
        Ok(())
    }

    async fn handle_heartbeat(&self, user_id: &[u8], _routing_id: &[u8]) {
        self.inner.publish(user_id);
        let generation = self.inner.generation.fetch_add(1, Ordering::Relaxed) + 1;
        let handle = tokio::spawn({
            let inner = Arc::clone(&self.inner);
            let user = user_id.to_vec();
            async move {
                tokio::time::sleep(HEARTBEAT_TIMEOUT).await;
                inner.expire(&user, Some(generation));
            }
        });
        let previous = self
            .inner
            .timers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(user_id.to_vec(), TimerSlot { generation, handle });
        if let Some(previous) = previous {
            previous.handle.abort();
        }
    }

    async fn handle_timeout(&self, user_id: &[u8], _routing_id: &[u8]) {
        self.inner.expire(user_id, None);
    }

    async fn stop(&self) {
        let timers = std::mem::take(
            &mut *self
                .inner
                .timers
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        for (_, slot) in timers {
            slot.handle.abort();
        }
        self.inner
            .monitoring
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }
}
