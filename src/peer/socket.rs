//! Socket ownership and the blocking reader loop.
//!
//! The ROUTER socket is owned by the peer and shared between the reader
//! thread and async senders through a mutex; ZeroMQ sockets may migrate
//! between threads but never be used from two at once, and the mutex is the
//! fence that guarantees it. The reader polls with a short timeout so the
//! lock is released often enough for sends to interleave.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::errors::RpcError;

/// Bounded retries for a send the ROUTER cannot yet route.
pub(crate) const MAX_UNREACHABLE_RETRY: usize = 3;
/// Pause between unreachable-send retries.
pub(crate) const UNREACHABLE_RETRY_DELAY: Duration = Duration::from_millis(100);
/// Reader poll granularity; bounds both shutdown latency and send latency.
const POLL_INTERVAL_MS: i64 = 5;

/// A multipart pulled off the socket, with transport-asserted identity.
pub(crate) struct RawInbound {
    pub(crate) frames: Vec<Vec<u8>>,
    /// `User-Id` metadata from the security mechanism, when present.
    pub(crate) transport_user_id: Option<Vec<u8>>,
}

/// The peer socket behind its sharing mutex.
#[derive(Clone, Default)]
pub(crate) struct SharedSocket {
    inner: Arc<Mutex<Option<zmq::Socket>>>,
}

impl SharedSocket {
    /// Run `f` with the socket, failing when none is attached yet.
    pub(crate) fn with<T>(
        &self,
        f: impl FnOnce(&zmq::Socket) -> Result<T, zmq::Error>,
    ) -> Result<T, RpcError> {
        let guard = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        match guard.as_ref() {
            Some(socket) => f(socket).map_err(RpcError::from),
            None => Err(RpcError::NotConnected),
        }
    }

    /// Like [`SharedSocket::with`], for callers that fail with [`RpcError`].
    pub(crate) fn with_ref<T>(
        &self,
        f: impl FnOnce(&zmq::Socket) -> Result<T, RpcError>,
    ) -> Result<T, RpcError> {
        let guard = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        match guard.as_ref() {
            Some(socket) => f(socket),
            None => Err(RpcError::NotConnected),
        }
    }

    /// Whether a socket is currently attached.
    pub(crate) fn is_attached(&self) -> bool {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Attach a freshly created socket.
    pub(crate) fn attach(&self, socket: zmq::Socket) {
        *self.inner.lock().unwrap_or_else(PoisonError::into_inner) = Some(socket);
    }

    /// Detach and close the socket with zero linger.
    pub(crate) fn close(&self) {
        let socket = self
            .inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(socket) = socket {
            if let Err(e) = socket.set_linger(0) {
                debug!(error = %e, "failed to clear linger before close");
            }
        }
    }
}

/// Send half handed to backends and the peer itself.
#[derive(Clone)]
pub(crate) struct OutboundHandle {
    socket: SharedSocket,
}

impl OutboundHandle {
    pub(crate) fn new(socket: SharedSocket) -> Self {
        Self { socket }
    }

    fn try_send(&self, frames: &[Vec<u8>]) -> Result<(), RpcError> {
        self.socket.with(|socket| {
            socket.send_multipart(frames.iter().map(|f| zmq::Message::from(f.as_slice())), 0)
        })
    }

    /// Send a multipart, retrying host-unreachable a bounded number of
    /// times before giving up with [`RpcError::TransportUnreachable`].
    pub(crate) async fn send(&self, frames: Vec<Vec<u8>>) -> Result<(), RpcError> {
        let mut attempt = 0;
        loop {
            match self.try_send(&frames) {
                Err(RpcError::Transport(zmq::Error::EHOSTUNREACH)) => {
                    if attempt >= MAX_UNREACHABLE_RETRY {
                        warn!("dropping message: peer still unreachable after retries");
                        return Err(RpcError::TransportUnreachable);
                    }
                    attempt += 1;
                    tokio::time::sleep(UNREACHABLE_RETRY_DELAY).await;
                }
                other => return other,
            }
        }
    }
}

/// Pull one whole multipart without blocking.
///
/// Returns `Ok(None)` when nothing is queued. The `User-Id` metadata is
/// read off the first part; ZeroMQ attaches the same origin metadata to
/// every part of a message.
fn recv_multipart(socket: &zmq::Socket) -> Result<Option<RawInbound>, zmq::Error> {
    let mut part = zmq::Message::new();
    match socket.recv(&mut part, zmq::DONTWAIT) {
        Ok(()) => {}
        Err(zmq::Error::EAGAIN) => return Ok(None),
        Err(e) => return Err(e),
    }
    let transport_user_id = part.gets("User-Id").map(|id| id.as_bytes().to_vec());
    let mut frames = vec![part.to_vec()];
    while socket.get_rcvmore()? {
        let mut more = zmq::Message::new();
        socket.recv(&mut more, 0)?;
        frames.push(more.to_vec());
    }
    Ok(Some(RawInbound {
        frames,
        transport_user_id,
    }))
}

/// Spawn the blocking reader thread.
///
/// The thread polls the shared socket, forwards every multipart into
/// `inbound`, and exits once `stop` is raised or the socket goes away.
pub(crate) fn spawn_reader(
    socket: SharedSocket,
    inbound: mpsc::UnboundedSender<RawInbound>,
    stop: Arc<AtomicBool>,
) -> std::thread::JoinHandle<()> {
    std::thread::Builder::new()
        .name("dyad-reader".into())
        .spawn(move || {
            while !stop.load(Ordering::Relaxed) {
                let drained = socket.with(|sock| {
                    if sock.poll(zmq::POLLIN, POLL_INTERVAL_MS)? == 0 {
                        return Ok(true);
                    }
                    loop {
                        match recv_multipart(sock)? {
                            Some(raw) => {
                                if inbound.send(raw).is_err() {
                                    // dispatch loop is gone
                                    return Ok(false);
                                }
                            }
                            None => return Ok(true),
                        }
                    }
                });
                match drained {
                    Ok(true) => {}
                    Ok(false) | Err(RpcError::NotConnected) => break,
                    Err(e) => {
                        warn!(error = %e, "reader loop transport failure");
                        break;
                    }
                }
            }
        })
        .unwrap_or_else(|e| panic!("failed to spawn reader thread: {e}"))
}
