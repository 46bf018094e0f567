//! Error taxonomy shared across the crate.
//!
//! Local failures (codec, protocol, transport) and remote failures carried
//! by ERROR frames all funnel into [`RpcError`] so a pending call resolves
//! with exactly one typed outcome.

use thiserror::Error;

use crate::packer::CodecError;
use crate::protocol::ProtocolError;

/// Wire name used for [`RpcError::ServiceNotFound`] in ERROR payloads.
pub const SERVICE_NOT_FOUND_KIND: &str = "ServiceNotFoundError";
/// Wire name used for [`RpcError::Unauthorized`] in ERROR payloads.
pub const UNAUTHORIZED_KIND: &str = "UnauthorizedError";

/// Failure of a single RPC exchange or of the peer machinery behind it.
#[derive(Debug, Error)]
pub enum RpcError {
    /// No registered callable matched the requested name, even after the
    /// proxy lookup.
    #[error("service not found: {0}")]
    ServiceNotFound(String),
    /// The credential check failed or the handshake retry budget ran out.
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    /// The deadline elapsed before a reply arrived.
    #[error("call timed out")]
    Timeout,
    /// The ROUTER socket has no route for the target after retrying.
    #[error("peer unreachable")]
    TransportUnreachable,
    /// An exception raised by a remote handler, reconstructed from the
    /// `(kind, message, trace)` ERROR triple.
    #[error("{kind}: {message}")]
    Remote {
        /// Remote exception kind name as sent on the wire.
        kind: String,
        /// Human message with the remote traceback section folded in.
        message: String,
    },
    /// Payload could not be encoded or decoded.
    #[error(transparent)]
    Codec(#[from] CodecError),
    /// A frame violated the wire format.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    /// Underlying ZeroMQ failure.
    #[error("transport error: {0}")]
    Transport(#[from] zmq::Error),
    /// Operation requires a socket; call `bind` or `connect` first.
    #[error("peer has no transport endpoint; bind or connect first")]
    NotConnected,
    /// The peer was stopped while the call was still pending.
    #[error("peer stopped while the call was pending")]
    Stopped,
    /// Backend plugin name is not registered.
    #[error("unknown plugin {0:?}")]
    UnknownPlugin(String),
    /// Plugin configuration is incomplete for the selected backend.
    #[error("invalid peer configuration: {0}")]
    Config(String),
}

/// Render a remote trace between the same markers the wire peers expect.
///
/// The trace lines are indented so the section stands apart from the
/// surrounding exception message.
#[must_use = "use the formatted section"]
pub fn format_remote_traceback(trace: &str) -> String {
    let pivot = format!("\n{}", " ".repeat(12));
    let body = trace.lines().collect::<Vec<_>>().join(&pivot);
    format!(
        "\n-- Beginning of remote traceback --\n    {body}\n-- End of remote traceback --\n"
    )
}

/// Rebuild a local error from a decoded ERROR triple.
///
/// Internal kinds round-trip to their typed equivalents; anything else
/// surfaces as [`RpcError::Remote`] carrying the original kind name and the
/// message with the traceback section sandwiched in.
#[must_use = "use the reconstructed error"]
pub fn reconstruct_remote(kind: &str, message: &str, trace: &str) -> RpcError {
    let full = format!("{}\n{message}", format_remote_traceback(trace));
    match kind {
        SERVICE_NOT_FOUND_KIND => RpcError::ServiceNotFound(full),
        UNAUTHORIZED_KIND => RpcError::Unauthorized(full),
        _ => RpcError::Remote {
            kind: kind.to_owned(),
            message: full,
        },
    }
}

impl RpcError {
    /// Wire `(kind, message, trace)` triple for an ERROR reply describing
    /// this failure.
    #[must_use = "use the wire triple"]
    pub fn wire_triple(&self) -> (String, String, String) {
        match self {
            Self::ServiceNotFound(name) => (
                SERVICE_NOT_FOUND_KIND.to_owned(),
                name.clone(),
                format!("{SERVICE_NOT_FOUND_KIND}: {name}"),
            ),
            Self::Unauthorized(msg) => (
                UNAUTHORIZED_KIND.to_owned(),
                msg.clone(),
                format!("{UNAUTHORIZED_KIND}: {msg}"),
            ),
            other => (
                "InternalError".to_owned(),
                other.to_string(),
                format!("InternalError: {other}"),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn internal_kinds_round_trip() {
        let err = reconstruct_remote(SERVICE_NOT_FOUND_KIND, "nope", "trace");
        assert!(matches!(err, RpcError::ServiceNotFound(_)));
        let err = reconstruct_remote(UNAUTHORIZED_KIND, "bad password", "trace");
        assert!(matches!(err, RpcError::Unauthorized(_)));
    }

    #[test]
    fn unknown_kind_keeps_name_message_and_trace() {
        let err = reconstruct_remote("ValueError", "too bad", "raise ValueError");
        let RpcError::Remote { kind, message } = err else {
            panic!("expected a remote error");
        };
        assert_eq!(kind, "ValueError");
        assert!(message.contains("too bad"));
        assert!(message.contains("-- Beginning of remote traceback --"));
        assert!(message.contains("raise ValueError"));
    }

    #[test]
    fn traceback_section_is_marked() {
        let section = format_remote_traceback("line one\nline two");
        assert!(section.starts_with("\n-- Beginning of remote traceback --"));
        assert!(section.trim_end().ends_with("-- End of remote traceback --"));
        assert!(section.contains("line one"));
    }
}
