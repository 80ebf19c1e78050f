//! NATS-backed transport and event bus tests.
//!
//! These require a running NATS server with JetStream enabled
//! (`nats-server -js`) and are ignored by default.

use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use serde::{Deserialize, Serialize};

use eventum::command::{handler_fn, CommandBus, NatsCommandBus};
use eventum::config::{StreamConfig, TransportConfig};
use eventum::domain::{CommandEnvelope, CommandMetadata, OperationContext};
use eventum::error::{code, Response};
use eventum::event_bus::{EventBus, EventFilter, NatsEventBus};

mod common;

use common::raw_event;

fn transport_config() -> TransportConfig {
    TransportConfig {
        url: std::env::var("EVENTUM_NATS_URL").unwrap_or_else(|_| "nats://localhost:4222".into()),
        timeout: Duration::from_secs(2),
        ..Default::default()
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Ping {
    text: String,
}

#[tokio::test]
#[ignore] // Requires NATS server
async fn test_request_reply_roundtrip() {
    let server = NatsCommandBus::connect(transport_config()).await.unwrap();
    server.register(
        "diagnostics.v1.Ping",
        handler_fn(|_ctx, envelope| {
            async move {
                let ping: Ping = envelope.decode()?;
                Response::ok(&Ping {
                    text: format!("pong: {}", ping.text),
                })
            }
            .boxed()
        }),
    );
    let handle = server.serve().await.unwrap();

    let client = NatsCommandBus::connect(transport_config()).await.unwrap();
    let envelope = CommandEnvelope::new(
        "diagnostics.v1.Ping",
        &Ping { text: "hello".into() },
        CommandMetadata::generate(),
    )
    .unwrap();

    let response = client.send(&OperationContext::new(), &envelope).await.unwrap();
    assert!(response.success);
    let pong: Ping = response.decode().unwrap();
    assert_eq!(pong.text, "pong: hello");

    handle.shutdown(Duration::from_secs(2)).await;
    client.drain(Duration::from_secs(2)).await.unwrap();
}

#[tokio::test]
#[ignore] // Requires NATS server
async fn test_short_deadline_returns_synthetic_timeout() {
    // No responder registered for this type; the send must come back as a
    // synthetic timeout response within the deadline
    let client = NatsCommandBus::connect(transport_config()).await.unwrap();
    let envelope = CommandEnvelope::new(
        "diagnostics.v1.NoSuchHandler",
        &Ping { text: "void".into() },
        CommandMetadata::generate(),
    )
    .unwrap();

    let ctx = OperationContext::new().with_timeout(Duration::from_millis(1));
    let started = std::time::Instant::now();
    let response = client.send(&ctx, &envelope).await.unwrap();

    assert!(!response.success);
    assert_eq!(response.error.unwrap().code, code::TIMEOUT);
    assert!(started.elapsed() < Duration::from_secs(1));
}

#[tokio::test]
#[ignore] // Requires NATS server with JetStream
async fn test_durable_event_stream_roundtrip() {
    let client = async_nats::connect(transport_config().url).await.unwrap();
    let stream = StreamConfig {
        name: format!("EVENTUM-TEST-{}", uuid::Uuid::new_v4().simple()),
        ..Default::default()
    };
    let bus = NatsEventBus::connect(client, &stream).await.unwrap();

    let events = vec![
        raw_event("acc-1", common::OPENED, serde_json::json!({}), vec![]),
        raw_event("acc-1", common::DEPOSITED, serde_json::json!({}), vec![]),
    ];
    bus.publish(&events).await.unwrap();

    let seen = Arc::new(std::sync::Mutex::new(Vec::new()));

    struct Collect(Arc<std::sync::Mutex<Vec<String>>>);

    #[async_trait::async_trait]
    impl eventum::event_bus::EventHandler for Collect {
        async fn handle(&self, event: &eventum::domain::Event) -> eventum::error::AppResult<()> {
            self.0.lock().unwrap().push(event.event_type.clone());
            Ok(())
        }
    }

    let mut subscription = bus
        .subscribe("test-consumer", EventFilter::all(), Arc::new(Collect(seen.clone())))
        .await
        .unwrap();

    for _ in 0..100 {
        if seen.lock().unwrap().len() >= 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    subscription.unsubscribe().await;

    let seen = seen.lock().unwrap().clone();
    assert_eq!(seen, vec![common::OPENED.to_string(), common::DEPOSITED.to_string()]);
}
