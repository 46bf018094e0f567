//! Inbound frame classification and dispatch.
//!
//! One task per peer consumes the reader thread's channel. Frames that
//! violate the protocol are logged and dropped; nothing an unauthenticated
//! peer sends reaches the registry; handler failures become ERROR frames
//! and never terminate the loop. WORK handlers run as their own tasks, so
//! a handler that suspends does not hold up later requests.

use std::sync::{Arc, PoisonError};

use futures_util::FutureExt;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::errors::{RpcError, reconstruct_remote};
use crate::protocol::{Inbound, Kind, Message, classify};
use crate::registry::{Invocation, RpcEndpoint};

use super::PeerCore;
use super::socket::RawInbound;

pub(crate) async fn run(core: Arc<PeerCore>, mut inbound: mpsc::UnboundedReceiver<RawInbound>) {
    while let Some(raw) = inbound.recv().await {
        process(&core, raw).await;
    }
    debug!("dispatch loop drained");
}

async fn process(core: &Arc<PeerCore>, raw: RawInbound) {
    let message = match classify(raw.frames) {
        Ok(Inbound::Probe { routing_id }) => {
            // a probe exists purely to teach both sides the routing id
            if let Some(user_id) = raw.transport_user_id {
                core.auth.register_routing_id(&user_id, &routing_id);
            }
            return;
        }
        Ok(Inbound::Message(message)) => message,
        Err(e) => {
            warn!(error = %e, "dropping frame");
            return;
        }
    };

    let routing_id = message.routing_id.clone().unwrap_or_default();
    let sender = raw.transport_user_id.unwrap_or_default();
    if !sender.is_empty() {
        core.auth.register_routing_id(&sender, &routing_id);
    }

    if !core.auth.is_authenticated(&sender) {
        if message.kind == Kind::Hello {
            core.auth
                .handle_hello(&sender, &routing_id, &message.correlation_id, &message.payload)
                .await;
        } else {
            core.auth
                .handle_authentication(&sender, &routing_id, &message.correlation_id)
                .await;
        }
        return;
    }

    core.heartbeat.handle_heartbeat(&sender, &routing_id).await;

    match message.kind {
        Kind::Work => spawn_work(core, message, routing_id, sender),
        Kind::Ok => {
            let outcome = core
                .packer
                .unpack(&message.payload)
                .map_err(RpcError::from);
            if !core.calls.resolve(&message.correlation_id, outcome) {
                debug!("late OK dropped");
            }
        }
        Kind::Error => match core.packer.unpack_triple(&message.payload) {
            Ok((kind, text, trace)) => {
                let error = reconstruct_remote(&kind, &text, &trace);
                if !core.calls.resolve(&message.correlation_id, Err(error)) {
                    debug!(kind = %kind, "late ERROR dropped");
                }
            }
            Err(e) => warn!(error = %e, "undecodable ERROR payload"),
        },
        Kind::Authenticated => core.auth.handle_authenticated(&message.correlation_id).await,
        Kind::Unauthorized => {
            core.auth
                .handle_authentication(&sender, &routing_id, &message.correlation_id)
                .await;
        }
        Kind::Hello => {
            core.auth
                .handle_hello(&sender, &routing_id, &message.correlation_id, &message.payload)
                .await;
        }
        Kind::Heartbeat => {} // the liveness tick above is the whole point
    }
}

fn spawn_work(core: &Arc<PeerCore>, message: Message, routing_id: Vec<u8>, sender: Vec<u8>) {
    let inner = Arc::clone(core);
    let mut tasks = core.tasks.lock().unwrap_or_else(PoisonError::into_inner);
    tasks.spawn(async move {
        let Some((kind, payload)) = execute_work(&inner, &message.payload, &sender).await else {
            return;
        };
        let reply = Message::reply(routing_id, message.correlation_id, kind, payload);
        if let Err(e) = inner.outbound.send(reply.into_frames()).await {
            warn!(error = %e, "reply not delivered");
        }
    });
}

fn lookup(core: &PeerCore, name: &str, sender: &[u8]) -> Option<(RpcEndpoint, Option<Vec<u8>>)> {
    let ctx = core.auth.predicate_context(sender);
    let local = core.registry.lookup(name, &ctx);
    let found = local.or_else(|| {
        core.config.proxy_to.as_ref().and_then(|proxy| {
            let proxy_ctx = proxy.core.auth.predicate_context(sender);
            proxy.core.registry.lookup(name, &proxy_ctx)
        })
    })?;
    let caller = ctx
        .user_id
        .or_else(|| (!sender.is_empty()).then(|| sender.to_vec()));
    Some((found, caller))
}

/// Run one WORK request to an encoded OK or ERROR payload.
///
/// Returns `None` only when even the failure report cannot be encoded,
/// in which case the request is dropped after logging.
async fn execute_work(core: &Arc<PeerCore>, payload: &[u8], sender: &[u8]) -> Option<(Kind, Vec<u8>)> {
    let (name, args, kwargs) = match core.packer.unpack_work(payload) {
        Ok(work) => work,
        Err(e) => {
            warn!(error = %e, "undecodable WORK payload");
            return error_reply(core, &RpcError::from(e).wire_triple());
        }
    };

    let Some((endpoint, caller)) = lookup(core, &name, sender) else {
        return error_reply(core, &RpcError::ServiceNotFound(name).wire_triple());
    };

    let invocation = Invocation {
        caller: endpoint.wants_caller().then_some(caller).flatten(),
        args,
        kwargs,
    };
    let outcome = std::panic::AssertUnwindSafe(endpoint.invoke(invocation))
        .catch_unwind()
        .await;

    match outcome {
        Ok(Ok(value)) => match core.packer.pack(&value) {
            Ok(encoded) => Some((Kind::Ok, encoded)),
            Err(e) => {
                warn!(error = %e, name = %name, "result not encodable");
                error_reply(core, &RpcError::from(e).wire_triple())
            }
        },
        Ok(Err(failure)) => {
            debug!(name = %name, kind = %failure.kind, "handler failed");
            let trace = format!("handler {name:?} raised {}: {}", failure.kind, failure.message);
            error_reply(core, &(failure.kind, failure.message, trace))
        }
        Err(panic) => {
            let text = panic_message(panic.as_ref());
            warn!(name = %name, panic = %text, "handler panicked");
            let trace = format!("handler {name:?} panicked: {text}");
            error_reply(core, &("HandlerPanic".to_owned(), text, trace))
        }
    }
}

fn error_reply(core: &PeerCore, triple: &(String, String, String)) -> Option<(Kind, Vec<u8>)> {
    let (kind, message, trace) = triple;
    match core.packer.pack_triple(kind, message, trace) {
        Ok(encoded) => Some((Kind::Error, encoded)),
        Err(e) => {
            warn!(error = %e, "cannot encode the error reply; dropping");
            None
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    panic
        .downcast_ref::<&str>()
        .map(|s| (*s).to_owned())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "handler panicked".to_owned())
}
