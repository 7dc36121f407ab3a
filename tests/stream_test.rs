use std::net::SocketAddr;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::http::header::CONTENT_TYPE;
use axum::routing::get;
use axum::Router;
use tokio::sync::mpsc;
use warden::config::StreamConfig;
use warden::stream::{
    Endpoint, EndpointResolver, EventKind, EventStreamGateway, GatewayEvent,
};

const BODY: &str = ": hello\n\nevent: phase-started\ndata: {\"phase\":\"plan\"}\n\nevent: workflow-complete\ndata: {}\n\n";

/// Fake worker: serves one short SSE body per request, then closes it.
async fn fake_worker() -> SocketAddr {
    let router = Router::new().route(
        "/stream/progress",
        get(|| async { ([(CONTENT_TYPE, "text/event-stream")], BODY) }),
    );
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    addr
}

fn fast_config() -> StreamConfig {
    StreamConfig {
        connect_timeout_ms: 1_000,
        reconnect_base_delay_ms: 20,
        reconnect_max_delay_ms: 100,
        ..StreamConfig::default()
    }
}

async fn next(rx: &mut mpsc::UnboundedReceiver<GatewayEvent>) -> GatewayEvent {
    tokio::time::timeout(Duration::from_secs(10), rx.recv())
        .await
        .expect("timed out waiting for gateway event")
        .expect("gateway stopped")
}

#[tokio::test]
async fn relays_events_and_reconnects_after_close() {
    let addr = fake_worker().await;
    let gateway = EventStreamGateway::http(&fast_config()).unwrap();
    let port = addr.port();
    let resolver: Arc<dyn EndpointResolver> = Arc::new(move || Some(Endpoint::new("127.0.0.1", port)));

    let (tx, mut rx) = mpsc::unbounded_channel();
    let sub = gateway.connect(resolver, move |event| {
        let _ = tx.send(event);
    });

    assert!(matches!(next(&mut rx).await, GatewayEvent::Connecting { .. }));
    assert!(matches!(next(&mut rx).await, GatewayEvent::ConnectionOpen { .. }));
    match next(&mut rx).await {
        GatewayEvent::Event(event) => {
            assert_eq!(event.kind, EventKind::PhaseStarted);
            assert_eq!(event.payload["phase"], "plan");
        }
        other => panic!("expected phase-started, got {other:?}"),
    }
    match next(&mut rx).await {
        GatewayEvent::Event(event) => assert_eq!(event.kind, EventKind::WorkflowComplete),
        other => panic!("expected workflow-complete, got {other:?}"),
    }
    match next(&mut rx).await {
        GatewayEvent::ConnectionLost { attempt, retry_in, .. } => {
            assert_eq!(attempt, 1);
            assert_eq!(retry_in, Duration::from_millis(20));
        }
        other => panic!("expected connection lost, got {other:?}"),
    }
    // and it comes back
    assert!(matches!(next(&mut rx).await, GatewayEvent::ConnectionOpen { .. }));
    assert_eq!(sub.connection().last_good_port, Some(port));

    sub.disconnect();
}

#[tokio::test]
async fn follows_the_worker_to_a_new_port() {
    let dead = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };
    let live = fake_worker().await.port();

    let current = Arc::new(AtomicU16::new(dead));
    let lookup = Arc::clone(&current);
    let resolver: Arc<dyn EndpointResolver> =
        Arc::new(move || Some(Endpoint::new("127.0.0.1", lookup.load(Ordering::SeqCst))));

    let gateway = EventStreamGateway::http(&fast_config()).unwrap();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let sub = gateway.connect(resolver, move |event| {
        let _ = tx.send(event);
    });

    loop {
        if let GatewayEvent::ConnectionLost { .. } = next(&mut rx).await {
            break;
        }
    }
    assert!(sub.connection().consecutive_failures >= 1);
    current.store(live, Ordering::SeqCst);

    loop {
        if let GatewayEvent::ConnectionOpen { endpoint } = next(&mut rx).await {
            assert_eq!(endpoint.port, live);
            break;
        }
    }
    sub.disconnect();
}
