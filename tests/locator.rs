// Resolver tests against a hand-driven fake locator.

use std::sync::Once;
use std::time::Duration;

use rmpv::Value;
use tokio::time::timeout;

use tether::{FrameKind, Locator, Message, Socket};

static INIT: Once = Once::new();

fn init_tracing() {
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::from_default_env()
                    .add_directive(tracing::Level::DEBUG.into()),
            )
            .with_test_writer()
            .init();
    });
}

fn fake_locator() -> (Locator, Socket) {
    init_tracing();
    let (a, b) = tokio::io::duplex(64 * 1024);
    (
        Locator::from_socket(Socket::from_stream(a)),
        Socket::from_stream(b),
    )
}

fn encoded_record(host: &str, port: u64, version: u64, api: Vec<(u64, &str)>) -> Vec<u8> {
    let record = Value::Array(vec![
        Value::Array(vec![Value::from(host), Value::from(port)]),
        Value::from(version),
        Value::Map(
            api.into_iter()
                .map(|(id, method)| (Value::from(id), Value::from(method)))
                .collect(),
        ),
    ]);
    let mut blob = Vec::new();
    rmpv::encode::write_value(&mut blob, &record).unwrap();
    blob
}

async fn expect_resolve_request(fake: &mut Socket, name: &str) {
    let request = timeout(Duration::from_secs(1), fake.recv())
        .await
        .expect("no resolve request within 1s")
        .expect("locator connection closed");
    assert_eq!(request.frame_kind(), Some(FrameKind::Invoke));
    assert_eq!(request.session, 0);
    assert_eq!(request.payload[0].as_str(), Some(name));
}

#[tokio::test]
async fn resolve_returns_the_streamed_record() {
    let (locator, mut fake) = fake_locator();
    let result_rx = locator.resolve("svc");

    expect_resolve_request(&mut fake, "svc").await;

    let handle = fake.handle();
    handle
        .send(Message::chunk(0, encoded_record("h", 9, 1, vec![(0, "m")])))
        .await;
    handle.send(Message::choke(0)).await;

    let result = timeout(Duration::from_secs(1), result_rx)
        .await
        .expect("resolve did not finish")
        .expect("resolve task dropped its result");
    assert!(result.success);
    assert_eq!(result.endpoint.host, "h");
    assert_eq!(result.endpoint.port, 9);
    assert_eq!(result.endpoint.to_string(), "h:9");
    assert_eq!(result.version, 1);
    assert_eq!(result.api.get(&0).map(String::as_str), Some("m"));
}

#[tokio::test]
async fn last_decodable_chunk_wins() {
    let (locator, mut fake) = fake_locator();
    let result_rx = locator.resolve("svc");

    expect_resolve_request(&mut fake, "svc").await;

    let handle = fake.handle();
    handle
        .send(Message::chunk(0, encoded_record("old", 1, 1, vec![])))
        .await;
    // An undecodable chunk is logged and skipped without poisoning the call.
    handle.send(Message::chunk(0, b"garbage".to_vec())).await;
    handle
        .send(Message::chunk(0, encoded_record("new", 2, 3, vec![])))
        .await;
    handle.send(Message::choke(0)).await;

    let result = timeout(Duration::from_secs(1), result_rx)
        .await
        .unwrap()
        .unwrap();
    assert!(result.success);
    assert_eq!(result.endpoint.host, "new");
    assert_eq!(result.endpoint.port, 2);
    assert_eq!(result.version, 3);
}

#[tokio::test]
async fn connection_close_before_any_chunk_is_a_failure() {
    let (locator, mut fake) = fake_locator();
    let result_rx = locator.resolve("svc");

    expect_resolve_request(&mut fake, "svc").await;
    fake.handle().close().await;

    let result = timeout(Duration::from_secs(1), result_rx)
        .await
        .expect("resolve did not finish")
        .expect("resolve task dropped its result");
    assert!(!result.success);
}
