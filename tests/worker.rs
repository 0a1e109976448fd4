// End-to-end worker tests over an in-process duplex transport.
//
// Each test plays the runtime side of the wire by hand: a second Socket on
// the other end of the pipe sends invoke/chunk/choke frames and asserts on
// the frames the worker produces.

use std::sync::Once;
use std::time::Duration;

use tokio::time::timeout;

use tether::{Error, FrameKind, Message, Socket, Worker, WorkerConfig};

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

fn socket_pair() -> (Socket, Socket) {
    init_tracing();
    let (a, b) = tokio::io::duplex(64 * 1024);
    (Socket::from_stream(a), Socket::from_stream(b))
}

// A config with keep-alive timers far enough out that tests never race them.
fn quiet_config() -> WorkerConfig {
    WorkerConfig {
        heartbeat_interval: Duration::from_secs(60),
        disown_timeout: Duration::from_secs(60),
        ..WorkerConfig::default()
    }
}

async fn recv(runtime: &mut Socket) -> Message {
    timeout(Duration::from_secs(1), runtime.recv())
        .await
        .expect("no frame within 1s")
        .expect("connection closed")
}

async fn expect_preamble(runtime: &mut Socket, id: &str) {
    let handshake = recv(runtime).await;
    assert_eq!(handshake.frame_kind(), Some(FrameKind::Handshake));
    assert_eq!(handshake.session, 0);
    assert_eq!(handshake.payload[0].as_str(), Some(id));

    let heartbeat = recv(runtime).await;
    assert_eq!(heartbeat.frame_kind(), Some(FrameKind::Heartbeat));
    assert_eq!(heartbeat.session, 0);
}

#[tokio::test]
async fn invoke_round_trip_then_clean_stop() {
    let (worker_side, mut runtime) = socket_pair();
    let mut worker = Worker::with_config(worker_side, "worker-1", quiet_config());
    worker.on("echo", |mut request, response| async move {
        if let Ok(data) = request.read(None).await {
            response.write(data).await;
        }
        response.close().await;
    });
    let stopper = worker.stopper();
    let run = tokio::spawn(worker.run());

    expect_preamble(&mut runtime, "worker-1").await;

    let handle = runtime.handle();
    handle.send(Message::invoke(7, "echo")).await;
    handle.send(Message::chunk(7, b"hello".to_vec())).await;
    handle.send(Message::choke(7)).await;

    let chunk = recv(&mut runtime).await;
    assert_eq!(chunk.frame_kind(), Some(FrameKind::Chunk));
    assert_eq!(chunk.session, 7);
    assert_eq!(chunk.into_chunk_data().as_deref(), Some(&b"hello"[..]));

    let choke = recv(&mut runtime).await;
    assert_eq!(choke.frame_kind(), Some(FrameKind::Choke));
    assert_eq!(choke.session, 7);

    stopper.stop().await;
    let result = timeout(Duration::from_secs(1), run)
        .await
        .expect("run did not return after stop")
        .expect("run task panicked");
    assert!(result.is_ok());

    // Stop is idempotent.
    stopper.stop().await;
}

#[tokio::test]
async fn unknown_event_reaches_the_default_fallback() {
    let (worker_side, mut runtime) = socket_pair();
    let worker = Worker::with_config(worker_side, "worker-2", quiet_config());
    let stopper = worker.stopper();
    let run = tokio::spawn(worker.run());

    expect_preamble(&mut runtime, "worker-2").await;

    runtime.handle().send(Message::invoke(3, "missing")).await;

    let error = recv(&mut runtime).await;
    assert_eq!(error.frame_kind(), Some(FrameKind::Error));
    assert_eq!(error.session, 3);
    assert_eq!(error.payload[0].as_i64(), Some(200));
    assert_eq!(
        error.payload[1].as_str(),
        Some("There is no handler for event missing")
    );

    let choke = recv(&mut runtime).await;
    assert_eq!(choke.frame_kind(), Some(FrameKind::Choke));
    assert_eq!(choke.session, 3);

    stopper.stop().await;
    assert!(run.await.unwrap().is_ok());
}

#[tokio::test]
async fn custom_fallback_replaces_the_default() {
    let (worker_side, mut runtime) = socket_pair();
    let mut worker = Worker::with_config(worker_side, "worker-9", quiet_config());
    worker.set_fallback(|event, _request, response| async move {
        response.write(event.into_bytes()).await;
        response.close().await;
    });
    let stopper = worker.stopper();
    let run = tokio::spawn(worker.run());

    expect_preamble(&mut runtime, "worker-9").await;

    runtime.handle().send(Message::invoke(11, "nope")).await;

    let chunk = recv(&mut runtime).await;
    assert_eq!(chunk.frame_kind(), Some(FrameKind::Chunk));
    assert_eq!(chunk.session, 11);
    assert_eq!(chunk.into_chunk_data().as_deref(), Some(&b"nope"[..]));
    let choke = recv(&mut runtime).await;
    assert_eq!(choke.frame_kind(), Some(FrameKind::Choke));

    stopper.stop().await;
    assert!(run.await.unwrap().is_ok());
}

#[tokio::test]
async fn handler_panic_becomes_a_session_error() {
    let (worker_side, mut runtime) = socket_pair();
    let mut worker = Worker::with_config(worker_side, "worker-3", quiet_config());
    worker.on("explode", |mut request, _response| async move {
        let _ = request.read(None).await;
        panic!("boom");
    });
    worker.on("echo", |mut request, response| async move {
        if let Ok(data) = request.read(None).await {
            response.write(data).await;
        }
        response.close().await;
    });
    let stopper = worker.stopper();
    let run = tokio::spawn(worker.run());

    expect_preamble(&mut runtime, "worker-3").await;

    let handle = runtime.handle();
    handle.send(Message::invoke(5, "explode")).await;
    handle.send(Message::chunk(5, b"x".to_vec())).await;

    let error = recv(&mut runtime).await;
    assert_eq!(error.frame_kind(), Some(FrameKind::Error));
    assert_eq!(error.session, 5);
    assert_eq!(error.payload[0].as_i64(), Some(100));
    let text = error.payload[1].as_str().unwrap();
    assert!(text.contains("boom"), "unexpected error text: {text}");

    let choke = recv(&mut runtime).await;
    assert_eq!(choke.frame_kind(), Some(FrameKind::Choke));
    assert_eq!(choke.session, 5);

    // The worker keeps serving other sessions.
    handle.send(Message::invoke(6, "echo")).await;
    handle.send(Message::chunk(6, b"alive".to_vec())).await;
    handle.send(Message::choke(6)).await;

    let chunk = recv(&mut runtime).await;
    assert_eq!(chunk.session, 6);
    assert_eq!(chunk.into_chunk_data().as_deref(), Some(&b"alive"[..]));

    stopper.stop().await;
    assert!(run.await.unwrap().is_ok());
}

#[tokio::test]
async fn silent_runtime_disowns_the_worker() {
    let (worker_side, runtime) = socket_pair();
    let config = WorkerConfig {
        heartbeat_interval: Duration::from_millis(50),
        disown_timeout: Duration::from_millis(30),
        ..WorkerConfig::default()
    };
    let worker = Worker::with_config(worker_side, "worker-4", config);

    // The runtime accepts writes but never replies.
    let result = timeout(Duration::from_millis(500), worker.run())
        .await
        .expect("worker was not disowned in time");
    assert!(matches!(result, Err(Error::Disowned)));
    drop(runtime);
}

#[tokio::test]
async fn heartbeat_replies_keep_the_worker_alive() {
    let (worker_side, mut runtime) = socket_pair();
    let config = WorkerConfig {
        heartbeat_interval: Duration::from_millis(40),
        disown_timeout: Duration::from_millis(80),
        ..WorkerConfig::default()
    };
    let worker = Worker::with_config(worker_side, "worker-5", config);
    let stopper = worker.stopper();
    let run = tokio::spawn(worker.run());

    // Reply to every heartbeat for several intervals; the disown timer must
    // never fire while replies arrive in time.
    let handle = runtime.handle();
    let deadline = tokio::time::Instant::now() + Duration::from_millis(300);
    while tokio::time::Instant::now() < deadline {
        let Ok(Some(message)) = timeout(Duration::from_millis(200), runtime.recv()).await else {
            panic!("worker went quiet while being kept alive");
        };
        if message.frame_kind() == Some(FrameKind::Heartbeat) {
            handle.send(Message::heartbeat()).await;
        }
    }
    assert!(!run.is_finished(), "worker exited despite heartbeat replies");

    stopper.stop().await;
    assert!(run.await.unwrap().is_ok());
}

#[tokio::test]
async fn terminate_stops_the_worker_cleanly() {
    let (worker_side, mut runtime) = socket_pair();
    let worker = Worker::with_config(worker_side, "worker-6", quiet_config());
    let run = tokio::spawn(worker.run());

    expect_preamble(&mut runtime, "worker-6").await;

    runtime
        .handle()
        .send(Message::new(
            0,
            FrameKind::Terminate,
            vec![rmpv::Value::from(1), rmpv::Value::from("shutting down")],
        ))
        .await;

    let result = timeout(Duration::from_secs(1), run)
        .await
        .expect("run did not return after terminate")
        .expect("run task panicked");
    assert!(result.is_ok());
}

#[tokio::test]
async fn dropped_connection_surfaces_from_run() {
    let (worker_side, runtime) = socket_pair();
    let worker = Worker::with_config(worker_side, "worker-7", quiet_config());
    let run = tokio::spawn(worker.run());

    // Tear the runtime side down without a terminate.
    drop(runtime);

    let result = timeout(Duration::from_secs(1), run)
        .await
        .expect("run did not notice the dropped connection")
        .expect("run task panicked");
    assert!(matches!(result, Err(Error::ConnectionLost) | Err(Error::Io(_))));
}

#[tokio::test]
async fn duplicate_invoke_is_dropped() {
    let (worker_side, mut runtime) = socket_pair();
    let mut worker = Worker::with_config(worker_side, "worker-8", quiet_config());
    worker.on("count", |mut request, response| async move {
        let mut seen = 0u8;
        while request.read(None).await.is_ok() {
            seen += 1;
        }
        response.write(vec![seen]).await;
        response.close().await;
    });
    let stopper = worker.stopper();
    let run = tokio::spawn(worker.run());

    expect_preamble(&mut runtime, "worker-8").await;

    let handle = runtime.handle();
    handle.send(Message::invoke(9, "count")).await;
    // A second invoke on the live session is a protocol error and must not
    // spawn a second handler or reset the request stream.
    handle.send(Message::invoke(9, "count")).await;
    handle.send(Message::chunk(9, b"a".to_vec())).await;
    handle.send(Message::chunk(9, b"b".to_vec())).await;
    handle.send(Message::choke(9)).await;

    let reply = recv(&mut runtime).await;
    assert_eq!(reply.frame_kind(), Some(FrameKind::Chunk));
    assert_eq!(reply.into_chunk_data().as_deref(), Some(&[2u8][..]));
    let choke = recv(&mut runtime).await;
    assert_eq!(choke.frame_kind(), Some(FrameKind::Choke));

    stopper.stop().await;
    assert!(run.await.unwrap().is_ok());
}
