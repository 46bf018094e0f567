//! Pluggable authentication backends.
//!
//! A backend configures the socket's security mechanism at bind/connect
//! time, answers the transport's ZAP requests where the mechanism needs
//! one, drives the HELLO/AUTHENTICATED/UNAUTHORIZED handshake, and owns the
//! mapping between application user ids and transport routing ids.
//!
//! Built-in flavours: [`NoopAuth`] accepts everyone; the PLAIN pair in
//! [`plain`] verifies or trusts asserted identities; the CURVE backends in
//! [`curve`] cover pre-shared keys and the two-step untrusted-key
//! challenge.

pub(crate) mod curve;
mod noop;
mod plain;
pub mod zap;

pub use curve::{TrustedCurveClient, TrustedCurveServer, UntrustedCurveClient, UntrustedCurveServer};
pub use noop::NoopAuth;
pub use plain::{PlainClient, PlainServer};

use async_trait::async_trait;
use tracing::debug;

use crate::errors::RpcError;
use crate::peer::PeerLink;
use crate::protocol::Message;
use crate::registry::CallerContext;

/// Behavioural contract of an authentication backend.
///
/// The default method bodies implement the always-authenticated,
/// identity-routed behaviour, so permissive backends only override what
/// they actually need.
#[async_trait]
pub trait AuthBackend: Send + Sync {
    /// Apply the security mechanism to the socket and start any service
    /// the backend needs, such as a ZAP listener.
    ///
    /// Called once, at the peer's first `bind` or `connect`.
    ///
    /// # Errors
    /// Fails when the configuration is incomplete for the mechanism or a
    /// backend service cannot start.
    fn configure(&self, socket: &zmq::Socket, link: PeerLink) -> Result<(), RpcError>;

    /// Stop background services started by [`AuthBackend::configure`].
    async fn stop(&self) {}

    /// Whether WORK from this peer may be dispatched.
    fn is_authenticated(&self, user_id: &[u8]) -> bool {
        let _ = user_id;
        true
    }

    /// A HELLO credential presentation arrived.
    async fn handle_hello(
        &self,
        user_id: &[u8],
        routing_id: &[u8],
        correlation_id: &[u8],
        payload: &[u8],
    ) {
        let _ = (user_id, routing_id, correlation_id, payload);
    }

    /// The remote peer acknowledged our credentials.
    async fn handle_authenticated(&self, correlation_id: &[u8]) {
        let _ = correlation_id;
    }

    /// The remote peer challenged us, or an unauthenticated peer sent
    /// something other than HELLO.
    async fn handle_authentication(&self, user_id: &[u8], routing_id: &[u8], correlation_id: &[u8]) {
        let _ = (user_id, routing_id);
        debug!(
            correlation_id = ?correlation_id,
            "authentication event ignored by backend"
        );
    }

    /// Observe an outbound WORK before it is sent, typically to keep a
    /// replay copy for after the handshake.
    fn save_last_work(&self, message: &Message) {
        let _ = message;
    }

    /// Caller context handed to registry predicates for this peer.
    fn predicate_context(&self, user_id: &[u8]) -> CallerContext {
        CallerContext {
            user_id: (!user_id.is_empty()).then(|| user_id.to_vec()),
            extras: std::collections::HashMap::new(),
        }
    }

    /// Resolve the transport routing id for an application user id.
    fn get_routing_id(&self, user_id: &[u8]) -> Option<Vec<u8>> {
        Some(user_id.to_vec())
    }

    /// Record a `user_id -> routing_id` mapping observed on the wire.
    fn register_routing_id(&self, user_id: &[u8], routing_id: &[u8]) {
        let _ = (user_id, routing_id);
    }
}
