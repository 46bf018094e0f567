//! Full-duplex scenarios over real sockets with the permissive backends.

mod common;

use std::sync::Arc;
use std::time::Duration;

use dyad::registry::HandlerError;
use dyad::{Peer, PeerConfig, Registry, RpcEndpoint, RpcError, Value};

use common::{boom_endpoint, call_when_routable, tcp_endpoint, upper_endpoint};

fn noop_pair(endpoint: &str) -> (Peer, Peer) {
    let server = Peer::responder(PeerConfig::new(b"server".to_vec())).expect("responder");
    server.bind(endpoint).expect("bind");
    let client = Peer::initiator(
        PeerConfig::new(b"client".to_vec()).peer_routing_id(b"server".to_vec()),
    )
    .expect("initiator");
    client.connect(endpoint).expect("connect");
    (server, client)
}

#[tokio::test]
async fn round_trip() {
    let endpoint = tcp_endpoint();
    let (server, client) = noop_pair(&endpoint);
    server.register(upper_endpoint());
    server.start().await.expect("start");

    let reply = client
        .call(b"server", "string.upper", vec!["hello".into()])
        .await
        .expect("call");
    assert_eq!(reply.as_str(), Some("HELLO"));

    client.stop().await;
    server.stop().await;
}

#[tokio::test]
async fn remote_error_keeps_kind_message_and_trace() {
    let endpoint = tcp_endpoint();
    let (server, client) = noop_pair(&endpoint);
    server.register(boom_endpoint());
    server.start().await.expect("start");

    let err = client.call(b"server", "boom", Vec::new()).await.unwrap_err();
    let RpcError::Remote { kind, message } = err else {
        panic!("expected a remote error, got {err:?}");
    };
    assert_eq!(kind, "ValueError");
    assert!(message.contains("too bad"));
    assert!(message.contains("-- Beginning of remote traceback --"));

    client.stop().await;
    server.stop().await;
}

#[tokio::test]
async fn unregistered_name_is_service_not_found() {
    let endpoint = tcp_endpoint();
    let (server, client) = noop_pair(&endpoint);
    server.start().await.expect("start");

    let err = client.call(b"server", "nope", Vec::new()).await.unwrap_err();
    assert!(
        matches!(&err, RpcError::ServiceNotFound(msg) if msg.contains("nope")),
        "got {err:?}"
    );

    client.stop().await;
    server.stop().await;
}

#[tokio::test]
async fn concurrent_calls_keep_their_own_replies() {
    let endpoint = tcp_endpoint();
    let (server, client) = noop_pair(&endpoint);
    server.register(RpcEndpoint::new("slow.echo", |inv| async move {
        tokio::time::sleep(Duration::from_millis(150)).await;
        Ok(inv.args.into_iter().next().unwrap_or(Value::Nil))
    }));
    server.register(RpcEndpoint::new("fast.echo", |inv| async move {
        Ok(inv.args.into_iter().next().unwrap_or(Value::Nil))
    }));
    server.start().await.expect("start");

    let slow = client.call(b"server", "slow.echo", vec!["tortoise".into()]);
    let fast = client.call(b"server", "fast.echo", vec!["hare".into()]);
    let (slow, fast) = tokio::join!(slow, fast);
    assert_eq!(slow.expect("slow").as_str(), Some("tortoise"));
    assert_eq!(fast.expect("fast").as_str(), Some("hare"));
    assert_eq!(client.pending_calls(), 0);

    client.stop().await;
    server.stop().await;
}

#[tokio::test]
async fn server_calls_client_back() {
    // the responder learns the initiator's routing id from the PLAIN
    // identity assertion, so it can originate calls of its own
    let endpoint = tcp_endpoint();
    let server = Peer::responder(
        PeerConfig::new(b"server".to_vec()).security_plugin("trusted_peer"),
    )
    .expect("responder");
    server.bind(&endpoint).expect("bind");
    server.start().await.expect("start");

    let client = Peer::initiator(
        PeerConfig::new(b"client".to_vec())
            .peer_routing_id(b"server".to_vec())
            .security_plugin("trusted_peer")
            .password(b"".to_vec()),
    )
    .expect("initiator");
    client.register(common::lower_endpoint());
    client.connect(&endpoint).expect("connect");
    client.start().await.expect("start");

    let reply = call_when_routable(&server, b"client", "string.lower", vec!["SCREAM".into()])
        .await
        .expect("server-originated call");
    assert_eq!(reply.as_str(), Some("scream"));

    client.stop().await;
    server.stop().await;
}

#[tokio::test]
async fn proxy_lookup_covers_unknown_names() {
    let endpoint = tcp_endpoint();
    let proxied = Peer::responder(PeerConfig::new(b"backend".to_vec())).expect("responder");
    proxied.register(upper_endpoint());

    let server = Peer::responder(
        PeerConfig::new(b"server".to_vec()).proxy_to(proxied.clone()),
    )
    .expect("responder");
    server.bind(&endpoint).expect("bind");
    server.start().await.expect("start");

    let client = Peer::initiator(
        PeerConfig::new(b"client".to_vec()).peer_routing_id(b"server".to_vec()),
    )
    .expect("initiator");
    client.connect(&endpoint).expect("connect");

    let reply = client
        .call(b"server", "string.upper", vec!["proxied".into()])
        .await
        .expect("call");
    assert_eq!(reply.as_str(), Some("PROXIED"));

    client.stop().await;
    server.stop().await;
}

#[tokio::test]
async fn shared_registry_serves_both_peers() {
    let shared = Arc::new(Registry::new());
    shared.register(upper_endpoint());

    let endpoint = tcp_endpoint();
    let server = Peer::responder(
        PeerConfig::new(b"server".to_vec()).registry(Arc::clone(&shared)),
    )
    .expect("responder");
    server.bind(&endpoint).expect("bind");
    server.start().await.expect("start");

    let client = Peer::initiator(
        PeerConfig::new(b"client".to_vec())
            .peer_routing_id(b"server".to_vec())
            .registry(shared),
    )
    .expect("initiator");
    client.connect(&endpoint).expect("connect");

    let reply = client
        .call(b"server", "string.upper", vec!["shared".into()])
        .await
        .expect("call");
    assert_eq!(reply.as_str(), Some("SHARED"));

    client.stop().await;
    server.stop().await;
}

#[tokio::test]
async fn handler_failure_never_kills_the_loop() {
    let endpoint = tcp_endpoint();
    let (server, client) = noop_pair(&endpoint);
    server.register(boom_endpoint());
    server.register(upper_endpoint());
    server.start().await.expect("start");

    let boom = client.call(b"server", "boom", Vec::new()).await;
    assert!(boom.is_err());
    // the loop survived and keeps serving
    let reply = client
        .call(b"server", "string.upper", vec!["alive".into()])
        .await
        .expect("call after failure");
    assert_eq!(reply.as_str(), Some("ALIVE"));

    client.stop().await;
    server.stop().await;
}

#[tokio::test]
async fn caller_identity_reaches_opted_in_handlers() {
    let endpoint = tcp_endpoint();
    let server = Peer::responder(
        PeerConfig::new(b"server".to_vec()).security_plugin("trusted_peer"),
    )
    .expect("responder");
    server.register(
        RpcEndpoint::new("whoami", |inv| async move {
            let caller = inv
                .caller
                .ok_or_else(|| HandlerError::new("RuntimeError", "caller missing"))?;
            Ok(Value::Bin(caller))
        })
        .with_caller(),
    );
    server.bind(&endpoint).expect("bind");
    server.start().await.expect("start");

    let client = Peer::initiator(
        PeerConfig::new(b"john".to_vec())
            .peer_routing_id(b"server".to_vec())
            .security_plugin("trusted_peer")
            .password(b"".to_vec()),
    )
    .expect("initiator");
    client.connect(&endpoint).expect("connect");

    let reply = client.call(b"server", "whoami", Vec::new()).await.expect("call");
    assert_eq!(reply.as_bytes(), Some(b"john".as_slice()));

    client.stop().await;
    server.stop().await;
}
