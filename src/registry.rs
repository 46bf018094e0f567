//! Name to callable registry with domain-scoped predicates.
//!
//! Endpoints live in a named domain; a predicate decides per caller whether
//! an entry is eligible. Non-default domains shadow default ones for the
//! same name. A registry may chain to a shared parent, and is the only
//! structure safe to share between peers by reference.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use futures_util::FutureExt;
use futures_util::future::BoxFuture;

use crate::packer::Value;

/// Domain every endpoint lands in unless told otherwise.
pub const DEFAULT_DOMAIN: &str = "default";
/// Built-in domain gated on a verified caller identity.
pub const RESTRICTED_DOMAIN: &str = "restricted";

/// Caller-derived context consulted by predicates and handlers.
#[derive(Debug, Clone, Default)]
pub struct CallerContext {
    /// Verified caller identity, when the auth backend supplies one.
    pub user_id: Option<Vec<u8>>,
    /// Extra predicate arguments supplied by the auth backend.
    pub extras: HashMap<String, Value>,
}

/// Decides whether an endpoint may run for a given caller.
pub trait Predicate: Send + Sync {
    /// `true` when the caller is allowed to invoke the endpoint.
    fn test(&self, ctx: &CallerContext) -> bool;
}

/// Predicate bound to [`DEFAULT_DOMAIN`]; accepts everyone.
struct PassThrough;

impl Predicate for PassThrough {
    fn test(&self, _ctx: &CallerContext) -> bool {
        true
    }
}

/// Predicate bound to [`RESTRICTED_DOMAIN`]; requires a verified identity.
struct RequireIdentity;

impl Predicate for RequireIdentity {
    fn test(&self, ctx: &CallerContext) -> bool {
        ctx.user_id.as_deref().is_some_and(|id| !id.is_empty())
    }
}

/// Failure produced by an endpoint, turned into an ERROR frame by the
/// dispatch loop.
#[derive(Debug, Clone)]
pub struct HandlerError {
    /// Exception kind name carried on the wire.
    pub kind: String,
    /// Human-readable message.
    pub message: String,
}

impl HandlerError {
    /// A failure with an explicit kind name.
    #[must_use]
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for HandlerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for HandlerError {}

/// A single invocation of an endpoint.
#[derive(Debug, Clone, Default)]
pub struct Invocation {
    /// Verified caller identity; set only for endpoints registered with
    /// [`RpcEndpoint::with_caller`].
    pub caller: Option<Vec<u8>>,
    /// Positional arguments.
    pub args: Vec<Value>,
    /// Keyword arguments in wire order.
    pub kwargs: Vec<(String, Value)>,
}

type HandlerFn =
    Arc<dyn Fn(Invocation) -> BoxFuture<'static, Result<Value, HandlerError>> + Send + Sync>;

/// A registered callable plus its routing metadata.
#[derive(Clone)]
pub struct RpcEndpoint {
    name: String,
    domain: String,
    wants_caller: bool,
    handler: HandlerFn,
}

impl RpcEndpoint {
    /// Wrap an async closure as an endpoint in the default domain.
    pub fn new<F, Fut>(name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(Invocation) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, HandlerError>> + Send + 'static,
    {
        Self {
            name: name.into(),
            domain: DEFAULT_DOMAIN.to_owned(),
            wants_caller: false,
            handler: Arc::new(move |invocation| handler(invocation).boxed()),
        }
    }

    /// Place the endpoint in a non-default domain.
    #[must_use]
    pub fn domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = domain.into();
        self
    }

    /// Ask for the verified caller identity in [`Invocation::caller`].
    #[must_use]
    pub fn with_caller(mut self) -> Self {
        self.wants_caller = true;
        self
    }

    /// The registered name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether this endpoint receives the caller identity.
    #[must_use]
    pub fn wants_caller(&self) -> bool {
        self.wants_caller
    }

    /// Run the handler.
    pub fn invoke(
        &self,
        invocation: Invocation,
    ) -> BoxFuture<'static, Result<Value, HandlerError>> {
        (self.handler)(invocation)
    }
}

impl std::fmt::Debug for RpcEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcEndpoint")
            .field("name", &self.name)
            .field("domain", &self.domain)
            .field("wants_caller", &self.wants_caller)
            .finish_non_exhaustive()
    }
}

/// Endpoint table with predicate-gated lookup and optional chaining.
pub struct Registry {
    entries: RwLock<Vec<RpcEndpoint>>,
    predicates: RwLock<HashMap<String, Arc<dyn Predicate>>>,
    parent: Option<Arc<Registry>>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    /// A standalone registry with the built-in predicates.
    #[must_use]
    pub fn new() -> Self {
        let mut predicates: HashMap<String, Arc<dyn Predicate>> = HashMap::new();
        predicates.insert(DEFAULT_DOMAIN.to_owned(), Arc::new(PassThrough));
        predicates.insert(RESTRICTED_DOMAIN.to_owned(), Arc::new(RequireIdentity));
        Self {
            entries: RwLock::new(Vec::new()),
            predicates: RwLock::new(predicates),
            parent: None,
        }
    }

    /// A local registry whose lookups fall back to `parent`.
    #[must_use]
    pub fn with_parent(parent: Arc<Self>) -> Self {
        Self {
            parent: Some(parent),
            ..Self::new()
        }
    }

    /// Add an endpoint, replacing any previous entry under the same
    /// `(name, domain)` pair.
    pub fn register(&self, endpoint: RpcEndpoint) {
        let mut entries = self.entries.write().unwrap_or_else(std::sync::PoisonError::into_inner);
        entries.retain(|e| !(e.name == endpoint.name && e.domain == endpoint.domain));
        entries.push(endpoint);
    }

    /// Bind a predicate to a domain name for this registry.
    pub fn register_predicate(&self, domain: impl Into<String>, predicate: Arc<dyn Predicate>) {
        self.predicates
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(domain.into(), predicate);
    }

    fn predicate_for(&self, domain: &str) -> Option<Arc<dyn Predicate>> {
        let local = self
            .predicates
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(domain)
            .cloned();
        local.or_else(|| self.parent.as_ref().and_then(|p| p.predicate_for(domain)))
    }

    /// Find the first endpoint whose name matches and whose domain
    /// predicate accepts the caller. Non-default domains win over defaults.
    ///
    /// Walks the parent chain when nothing local matches. Returns `None`
    /// when the name resolves nowhere; the peer maps that to a
    /// service-not-found failure.
    #[must_use = "handle the lookup result"]
    pub fn lookup(&self, name: &str, ctx: &CallerContext) -> Option<RpcEndpoint> {
        let entries = self.entries.read().unwrap_or_else(std::sync::PoisonError::into_inner);
        let mut candidates: Vec<&RpcEndpoint> =
            entries.iter().filter(|e| e.name == name).collect();
        candidates.sort_by_key(|e| e.domain == DEFAULT_DOMAIN);
        for entry in candidates {
            let Some(predicate) = self.predicate_for(&entry.domain) else {
                tracing::warn!(domain = %entry.domain, name, "no predicate for domain");
                continue;
            };
            if predicate.test(ctx) {
                return Some(entry.clone());
            }
        }
        drop(entries);
        self.parent.as_ref().and_then(|p| p.lookup(name, ctx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn constant(name: &str, value: i64) -> RpcEndpoint {
        RpcEndpoint::new(name, move |_inv| async move { Ok(Value::Int(value)) })
    }

    async fn invoke(registry: &Registry, name: &str, ctx: &CallerContext) -> Option<i64> {
        let endpoint = registry.lookup(name, ctx)?;
        endpoint.invoke(Invocation::default()).await.ok()?.as_i64()
    }

    fn identified() -> CallerContext {
        CallerContext {
            user_id: Some(b"alice".to_vec()),
            extras: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn lookup_finds_registered_endpoint() {
        let registry = Registry::new();
        registry.register(constant("answer", 42));
        assert_eq!(invoke(&registry, "answer", &identified()).await, Some(42));
        assert!(registry.lookup("missing", &identified()).is_none());
    }

    #[tokio::test]
    async fn restricted_domain_shadows_default_for_verified_callers() {
        let registry = Registry::new();
        registry.register(constant("op", 1));
        registry.register(constant("op", 2).domain(RESTRICTED_DOMAIN));

        // identified callers get the restricted entry, anonymous ones fall
        // back to the default-domain entry
        assert_eq!(invoke(&registry, "op", &identified()).await, Some(2));
        assert_eq!(
            invoke(&registry, "op", &CallerContext::default()).await,
            Some(1)
        );
    }

    #[tokio::test]
    async fn lookup_walks_the_parent_chain() {
        let shared = Arc::new(Registry::new());
        shared.register(constant("shared.op", 7));
        let local = Registry::with_parent(Arc::clone(&shared));
        local.register(constant("local.op", 8));

        assert_eq!(invoke(&local, "shared.op", &identified()).await, Some(7));
        assert_eq!(invoke(&local, "local.op", &identified()).await, Some(8));
        assert!(shared.lookup("local.op", &identified()).is_none());
    }

    #[tokio::test]
    async fn reregistration_replaces_the_entry() {
        let registry = Registry::new();
        registry.register(constant("op", 1));
        registry.register(constant("op", 9));
        assert_eq!(invoke(&registry, "op", &identified()).await, Some(9));
    }

    #[test]
    fn unknown_domain_is_skipped() {
        let registry = Registry::new();
        registry.register(constant("op", 1).domain("nonexistent"));
        assert!(registry.lookup("op", &identified()).is_none());
    }
}
