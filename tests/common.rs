//! Shared helpers for the socket-level integration tests.
#![allow(dead_code)]

use std::time::Duration;

use dyad::registry::HandlerError;
use dyad::{Peer, RpcEndpoint, RpcError, Value};

/// A TCP endpoint on a port nothing else is using.
pub fn tcp_endpoint() -> String {
    let port = portpicker::pick_unused_port().expect("no free port");
    format!("tcp://127.0.0.1:{port}")
}

/// Endpoint upper-casing its first string argument.
pub fn upper_endpoint() -> RpcEndpoint {
    RpcEndpoint::new("string.upper", |inv| async move {
        let s = string_arg(&inv.args)?;
        Ok(Value::from(s.to_uppercase()))
    })
}

/// Endpoint lower-casing its first string argument.
pub fn lower_endpoint() -> RpcEndpoint {
    RpcEndpoint::new("string.lower", |inv| async move {
        let s = string_arg(&inv.args)?;
        Ok(Value::from(s.to_lowercase()))
    })
}

/// Endpoint that always fails with a value error.
pub fn boom_endpoint() -> RpcEndpoint {
    RpcEndpoint::new("boom", |_inv| async move {
        Err::<Value, _>(HandlerError::new("ValueError", "too bad"))
    })
}

fn string_arg(args: &[Value]) -> Result<String, HandlerError> {
    args.first()
        .and_then(Value::as_str)
        .map(str::to_owned)
        .ok_or_else(|| HandlerError::new("TypeError", "expected a string argument"))
}

/// Call, retrying while the target's routing id is still unknown.
///
/// Responders learn initiator routing ids from connect-probes, which race
/// test startup; a short retry loop keeps the tests deterministic without
/// hiding real failures.
pub async fn call_when_routable(
    peer: &Peer,
    target: &[u8],
    name: &str,
    args: Vec<Value>,
) -> Result<Value, RpcError> {
    for _ in 0..20 {
        match peer.call(target, name, args.clone()).await {
            Err(RpcError::TransportUnreachable) => {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
            other => return other,
        }
    }
    Err(RpcError::TransportUnreachable)
}

/// Skip guard for tests needing a CURVE-capable libzmq.
pub fn curve_supported() -> bool {
    zmq::has("curve").unwrap_or(false)
}
