//! Initiator-side behaviour: deadlines, the call builder, and the
//! synchronous REQ shell.

mod common;

use std::time::{Duration, Instant};

use dyad::{Peer, PeerConfig, RpcError, SyncClient, Value};

use common::{tcp_endpoint, upper_endpoint};

#[tokio::test]
async fn unreachable_responder_times_out_and_clears_the_record() {
    let endpoint = tcp_endpoint(); // nothing ever binds here
    let client = Peer::initiator(
        PeerConfig::new(b"client".to_vec())
            .peer_routing_id(b"server".to_vec())
            .timeout(Duration::from_millis(500)),
    )
    .expect("initiator");
    client.connect(&endpoint).expect("connect");

    let started = Instant::now();
    let err = client
        .call(b"server", "string.upper", vec!["hello".into()])
        .await
        .unwrap_err();
    assert!(matches!(err, RpcError::Timeout), "got {err:?}");
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(450), "{elapsed:?}");
    assert!(elapsed < Duration::from_secs(3), "{elapsed:?}");
    assert_eq!(client.pending_calls(), 0);

    client.stop().await;
}

#[tokio::test]
async fn builder_and_kwargs_round_trip() {
    let endpoint = tcp_endpoint();
    let server = Peer::responder(PeerConfig::new(b"server".to_vec())).expect("responder");
    server.register(dyad::RpcEndpoint::new("greet", |inv| async move {
        let name = inv
            .args
            .first()
            .and_then(Value::as_str)
            .unwrap_or("stranger")
            .to_owned();
        let shout = inv
            .kwargs
            .iter()
            .find(|(k, _)| k == "shout")
            .and_then(|(_, v)| v.as_bool())
            .unwrap_or(false);
        let greeting = format!("hello {name}");
        Ok(Value::from(if shout {
            greeting.to_uppercase()
        } else {
            greeting
        }))
    }));
    server.bind(&endpoint).expect("bind");
    server.start().await.expect("start");

    let client = Peer::initiator(
        PeerConfig::new(b"client".to_vec()).peer_routing_id(b"server".to_vec()),
    )
    .expect("initiator");
    client.connect(&endpoint).expect("connect");

    let reply = client
        .send_to(b"server")
        .method("greet")
        .arg("bob")
        .kwarg("shout", true)
        .invoke()
        .await
        .expect("builder call");
    assert_eq!(reply.as_str(), Some("HELLO BOB"));

    let err = client.send_to(b"server").arg("x").invoke().await.unwrap_err();
    assert!(matches!(err, RpcError::Config(_)));

    client.stop().await;
    server.stop().await;
}

#[tokio::test]
async fn stop_is_idempotent_and_restartable() {
    let endpoint = tcp_endpoint();
    let server = Peer::responder(PeerConfig::new(b"server".to_vec())).expect("responder");
    server.register(upper_endpoint());
    server.bind(&endpoint).expect("bind");
    server.start().await.expect("start");
    server.start().await.expect("second start is a no-op");

    server.stop().await;
    server.stop().await; // second stop must not hang or panic
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn sync_client_round_trips_and_times_out() {
    let endpoint = tcp_endpoint();
    let server = Peer::responder(PeerConfig::new(b"server".to_vec())).expect("responder");
    server.register(upper_endpoint());
    server.register(common::boom_endpoint());
    server.bind(&endpoint).expect("bind");
    server.start().await.expect("start");

    let config = PeerConfig::new(b"sync".to_vec()).timeout(Duration::from_secs(2));
    let handle = tokio::task::spawn_blocking(move || {
        let client = SyncClient::new(&config)?;
        client.connect(&endpoint)?;
        let reply = client.call("string.upper", vec!["quiet".into()])?;
        let boom = client.call("boom", Vec::new());
        client.stop();
        Ok::<_, RpcError>((reply, boom.unwrap_err()))
    });
    let (reply, boom) = handle.await.expect("join").expect("sync calls");
    assert_eq!(reply.as_str(), Some("QUIET"));
    assert!(matches!(boom, RpcError::Remote { kind, .. } if kind == "ValueError"));

    server.stop().await;

    // nothing listens here; the receive window must elapse
    let dead = tcp_endpoint();
    let config = PeerConfig::new(b"sync".to_vec()).timeout(Duration::from_millis(300));
    let err = tokio::task::spawn_blocking(move || {
        let client = SyncClient::new(&config)?;
        client.connect(&dead)?;
        client.call("string.upper", vec!["x".into()])
    })
    .await
    .expect("join")
    .unwrap_err();
    assert!(matches!(err, RpcError::Timeout), "got {err:?}");
}
