//! Bidirectional RPC over ZeroMQ ROUTER sockets.
//!
//! Two symmetric peers each issue named calls against the other across a
//! single long-lived connection, correlated by id and carried over a
//! multipart wire format. Authentication and liveness are pluggable
//! backends; replies, remote errors, timeouts and reconnection are all
//! first-class outcomes of a call.
//!
//! ```no_run
//! use dyad::{Peer, PeerConfig, RpcEndpoint, Value};
//! use dyad::registry::HandlerError;
//!
//! # async fn demo() -> Result<(), dyad::RpcError> {
//! let server = Peer::responder(PeerConfig::new(b"server".to_vec()))?;
//! server.register(RpcEndpoint::new("string.upper", |inv| async move {
//!     let s = inv.args.first().and_then(Value::as_str).ok_or_else(|| {
//!         HandlerError::new("TypeError", "expected a string")
//!     })?;
//!     Ok(Value::from(s.to_uppercase()))
//! }));
//! server.bind("tcp://127.0.0.1:9090")?;
//! server.start().await?;
//!
//! let client = Peer::initiator(
//!     PeerConfig::new(b"client".to_vec()).peer_routing_id(b"server".to_vec()),
//! )?;
//! client.connect("tcp://127.0.0.1:9090")?;
//! let reply = client.call(b"server", "string.upper", vec!["hello".into()]).await?;
//! assert_eq!(reply.as_str(), Some("HELLO"));
//! # Ok(())
//! # }
//! ```

pub mod auth;
pub mod errors;
pub mod heartbeat;
pub mod packer;
mod peer;
pub mod plugins;
pub mod protocol;
pub mod registry;
pub mod sync_client;

pub use errors::RpcError;
pub use packer::{Packer, TranslationTable, Value};
pub use peer::{CallBuilder, Peer, PeerConfig, PeerLink, Role};
pub use registry::{CallerContext, Invocation, Registry, RpcEndpoint};
pub use sync_client::SyncClient;
