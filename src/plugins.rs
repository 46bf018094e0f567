//! Backend registration by name.
//!
//! Peers select their auth and heartbeat backends with a plugin name; the
//! registry maps names to factories receiving the peer's role and
//! configuration. A process-wide registry with the built-in backends is
//! the default, and an explicit registry can be passed to
//! [`crate::Peer::with_plugins`] for custom backends without global state.

use std::collections::HashMap;
use std::sync::{Arc, LazyLock};

use crate::auth::{
    AuthBackend, NoopAuth, PlainClient, PlainServer, TrustedCurveClient, TrustedCurveServer,
    UntrustedCurveClient, UntrustedCurveServer,
};
use crate::errors::RpcError;
use crate::heartbeat::{
    HeartbeatBackend, NoopHeartbeat, TestingHeartbeatEmitter, TestingHeartbeatMonitor,
};
use crate::peer::{PeerConfig, Role};

/// Always-authenticated auth backend.
pub const NOOP_AUTH_BACKEND: &str = "noop_auth_backend";
/// PLAIN mechanism with credential checking on the responder.
pub const PLAIN_BACKEND: &str = "plain";
/// PLAIN mechanism, responder trusts the asserted identity.
pub const TRUSTED_PEER_BACKEND: &str = "trusted_peer";
/// CURVE with pre-shared keys.
pub const TRUSTED_CURVE_BACKEND: &str = "trusted_curve";
/// CURVE accepting any key, trusted through the two-step handshake.
pub const UNTRUSTED_CURVE_BACKEND: &str = "untrusted_curve";
/// Heartbeat backend that does nothing.
pub const NOOP_HEARTBEAT_BACKEND: &str = "noop_heartbeat_backend";
/// Fixed-interval emitter / per-peer timeout monitor pair.
pub const TESTING_HEARTBEAT_BACKEND: &str = "testing_heartbeat_backend";

/// Factory building an auth backend for a peer.
pub type AuthFactory =
    Arc<dyn Fn(Role, &PeerConfig) -> Result<Arc<dyn AuthBackend>, RpcError> + Send + Sync>;
/// Factory building a heartbeat backend for a peer.
pub type HeartbeatFactory =
    Arc<dyn Fn(Role, &PeerConfig) -> Result<Arc<dyn HeartbeatBackend>, RpcError> + Send + Sync>;

/// Name to factory tables for both backend families.
pub struct PluginRegistry {
    auth: HashMap<String, AuthFactory>,
    heartbeat: HashMap<String, HeartbeatFactory>,
}

impl Default for PluginRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

impl PluginRegistry {
    /// A registry holding exactly the built-in backends.
    #[must_use]
    pub fn builtin() -> Self {
        let mut registry = Self {
            auth: HashMap::new(),
            heartbeat: HashMap::new(),
        };
        registry.register_auth(
            NOOP_AUTH_BACKEND,
            Arc::new(|_, _| Ok(Arc::new(NoopAuth) as Arc<dyn AuthBackend>)),
        );
        registry.register_auth(
            PLAIN_BACKEND,
            Arc::new(|role, config| {
                Ok(match role {
                    Role::Initiator => Arc::new(PlainClient) as Arc<dyn AuthBackend>,
                    Role::Responder => Arc::new(PlainServer::checking(config.credentials.clone())),
                })
            }),
        );
        registry.register_auth(
            TRUSTED_PEER_BACKEND,
            Arc::new(|role, _| {
                Ok(match role {
                    Role::Initiator => Arc::new(PlainClient) as Arc<dyn AuthBackend>,
                    Role::Responder => Arc::new(PlainServer::trusting()),
                })
            }),
        );
        registry.register_auth(
            TRUSTED_CURVE_BACKEND,
            Arc::new(|role, config| {
                Ok(match role {
                    Role::Initiator => Arc::new(TrustedCurveClient) as Arc<dyn AuthBackend>,
                    Role::Responder => {
                        Arc::new(TrustedCurveServer::new(config.credentials.clone()))
                    }
                })
            }),
        );
        registry.register_auth(
            UNTRUSTED_CURVE_BACKEND,
            Arc::new(|role, config| {
                Ok(match role {
                    Role::Initiator => {
                        Arc::new(UntrustedCurveClient::default()) as Arc<dyn AuthBackend>
                    }
                    Role::Responder => {
                        Arc::new(UntrustedCurveServer::new(config.credentials.clone()))
                    }
                })
            }),
        );
        registry.register_heartbeat(
            NOOP_HEARTBEAT_BACKEND,
            Arc::new(|_, _| Ok(Arc::new(NoopHeartbeat) as Arc<dyn HeartbeatBackend>)),
        );
        registry.register_heartbeat(
            TESTING_HEARTBEAT_BACKEND,
            Arc::new(|role, _| {
                Ok(match role {
                    Role::Initiator => {
                        Arc::new(TestingHeartbeatEmitter::default()) as Arc<dyn HeartbeatBackend>
                    }
                    Role::Responder => Arc::new(TestingHeartbeatMonitor::default()),
                })
            }),
        );
        registry
    }

    /// Bind or replace an auth backend factory.
    pub fn register_auth(&mut self, name: impl Into<String>, factory: AuthFactory) {
        self.auth.insert(name.into(), factory);
    }

    /// Bind or replace a heartbeat backend factory.
    pub fn register_heartbeat(&mut self, name: impl Into<String>, factory: HeartbeatFactory) {
        self.heartbeat.insert(name.into(), factory);
    }

    /// Build the named auth backend.
    ///
    /// # Errors
    /// [`RpcError::UnknownPlugin`] for an unregistered name, or whatever
    /// the factory fails with.
    pub fn auth(
        &self,
        name: &str,
        role: Role,
        config: &PeerConfig,
    ) -> Result<Arc<dyn AuthBackend>, RpcError> {
        let factory = self
            .auth
            .get(name)
            .ok_or_else(|| RpcError::UnknownPlugin(name.to_owned()))?;
        factory(role, config)
    }

    /// Build the named heartbeat backend.
    ///
    /// # Errors
    /// [`RpcError::UnknownPlugin`] for an unregistered name, or whatever
    /// the factory fails with.
    pub fn heartbeat(
        &self,
        name: &str,
        role: Role,
        config: &PeerConfig,
    ) -> Result<Arc<dyn HeartbeatBackend>, RpcError> {
        let factory = self
            .heartbeat
            .get(name)
            .ok_or_else(|| RpcError::UnknownPlugin(name.to_owned()))?;
        factory(role, config)
    }
}

static GLOBAL: LazyLock<PluginRegistry> = LazyLock::new(PluginRegistry::builtin);

/// The process-wide registry of built-in backends.
#[must_use]
pub fn global() -> &'static PluginRegistry {
    &GLOBAL
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtins_resolve_for_both_roles() {
        let registry = PluginRegistry::builtin();
        let config = PeerConfig::new(b"peer".to_vec()).peer_routing_id(b"other".to_vec());
        for name in [
            NOOP_AUTH_BACKEND,
            PLAIN_BACKEND,
            TRUSTED_PEER_BACKEND,
            TRUSTED_CURVE_BACKEND,
            UNTRUSTED_CURVE_BACKEND,
        ] {
            assert!(registry.auth(name, Role::Initiator, &config).is_ok(), "{name}");
            assert!(registry.auth(name, Role::Responder, &config).is_ok(), "{name}");
        }
        for name in [NOOP_HEARTBEAT_BACKEND, TESTING_HEARTBEAT_BACKEND] {
            assert!(
                registry.heartbeat(name, Role::Initiator, &config).is_ok(),
                "{name}"
            );
            assert!(
                registry.heartbeat(name, Role::Responder, &config).is_ok(),
                "{name}"
            );
        }
    }

    #[test]
    fn unknown_names_are_typed_errors() {
        let registry = PluginRegistry::builtin();
        let config = PeerConfig::new(b"peer".to_vec());
        assert!(matches!(
            registry.auth("nope", Role::Responder, &config),
            Err(RpcError::UnknownPlugin(name)) if name == "nope"
        ));
        assert!(matches!(
            registry.heartbeat("nope", Role::Responder, &config),
            Err(RpcError::UnknownPlugin(_))
        ));
    }
}
