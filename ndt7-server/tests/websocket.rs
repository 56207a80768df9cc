use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use ndt7_server::{Measurement, ReceiverConfig, Server, StopCause};
use tokio::io::DuplexStream;
use tokio::sync::mpsc;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::layer::{Context, Layer, SubscriberExt};

/// Counts warning events emitted on the current thread.
struct WarnCounter(Arc<AtomicUsize>);

impl<S: tracing::Subscriber> Layer<S> for WarnCounter {
    fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
        if *event.metadata().level() == tracing::Level::WARN {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }
}

fn count_warnings() -> (Arc<AtomicUsize>, tracing::subscriber::DefaultGuard) {
    let warnings = Arc::new(AtomicUsize::new(0));
    let subscriber = tracing_subscriber::registry().with(WarnCounter(warnings.clone()));
    (warnings, tracing::subscriber::set_default(subscriber))
}

async fn pair(
    config: &ReceiverConfig,
) -> (WebSocketStream<DuplexStream>, WebSocketStream<DuplexStream>) {
    let (client_io, server_io) = tokio::io::duplex(1 << 20);
    let client = tokio_tungstenite::client_async("ws://localhost/ndt/v7/download", client_io);
    let server =
        tokio_tungstenite::accept_async_with_config(server_io, Some(config.websocket_config()));
    let (client, server) = futures_util::future::join(client, server).await;
    (
        client.expect("client handshake failed").0,
        server.expect("server handshake failed"),
    )
}

fn report(num_bytes: i64) -> Message {
    Message::text(format!(
        r#"{{"AppInfo":{{"NumBytes":{num_bytes},"ElapsedTime":{}}},"Origin":"client","Test":"download"}}"#,
        num_bytes / 10
    ))
}

fn normal_close() -> Option<CloseFrame> {
    Some(CloseFrame {
        code: CloseCode::Normal,
        reason: "".into(),
    })
}

async fn collect(mut rx: mpsc::Receiver<Measurement>) -> Vec<i64> {
    let mut got = Vec::new();
    while let Some(m) = rx.recv().await {
        got.push(m.app_info.expect("AppInfo").num_bytes);
    }
    got
}

#[tokio::test]
async fn three_reports_then_graceful_close() {
    let (warnings, _guard) = count_warnings();
    let config = ReceiverConfig::default();
    let (mut client, server) = pair(&config).await;

    for n in [100, 200, 300] {
        client.send(report(n)).await.unwrap();
    }
    client.close(normal_close()).await.unwrap();

    let (_sink, stream) = server.split();
    let (rx, task) = ndt7_server::start(CancellationToken::new(), stream, &config);

    assert_eq!(collect(rx).await, vec![100, 200, 300]);
    assert!(matches!(task.await.unwrap(), StopCause::PeerClosed));
    assert_eq!(warnings.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn binary_frame_ends_the_sequence_with_one_warning() {
    let (warnings, _guard) = count_warnings();
    let config = ReceiverConfig::default();
    let (mut client, server) = pair(&config).await;

    client.send(Message::binary(vec![0u8; 64])).await.unwrap();
    client.send(report(1)).await.unwrap();

    let (_sink, stream) = server.split();
    let (rx, task) = ndt7_server::start(CancellationToken::new(), stream, &config);

    assert!(collect(rx).await.is_empty());
    assert!(matches!(task.await.unwrap(), StopCause::NonText(_)));
    assert_eq!(warnings.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn invalid_json_ends_the_sequence_with_one_warning() {
    let (warnings, _guard) = count_warnings();
    let config = ReceiverConfig::default();
    let (mut client, server) = pair(&config).await;

    client.send(Message::text("{\"AppInfo\": ")).await.unwrap();
    client.send(report(1)).await.unwrap();
    client.close(normal_close()).await.unwrap();

    let (_sink, stream) = server.split();
    let (rx, task) = ndt7_server::start(CancellationToken::new(), stream, &config);

    assert!(collect(rx).await.is_empty());
    assert!(matches!(task.await.unwrap(), StopCause::Decode(_)));
    assert_eq!(warnings.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn oversized_frame_is_refused_by_the_transport() {
    let (warnings, _guard) = count_warnings();
    let config = ReceiverConfig::new(Duration::from_secs(15), 1024);
    let (mut client, server) = pair(&config).await;

    client.send(report(1)).await.unwrap();
    let padding = "x".repeat(4096);
    client
        .send(Message::text(format!(r#"{{"Origin":"{padding}"}}"#)))
        .await
        .unwrap();
    client.send(report(2)).await.unwrap();

    let (_sink, stream) = server.split();
    let (rx, task) = ndt7_server::start(CancellationToken::new(), stream, &config);

    assert_eq!(collect(rx).await, vec![1]);
    let cause = task.await.unwrap();
    assert!(
        matches!(cause, StopCause::Transport(_) | StopCause::Oversized { .. }),
        "{cause:?}"
    );
    assert_eq!(warnings.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn abrupt_disconnect_is_a_warning() {
    let (warnings, _guard) = count_warnings();
    let config = ReceiverConfig::default();
    let (mut client, server) = pair(&config).await;

    client.send(report(5)).await.unwrap();
    drop(client);

    let (_sink, stream) = server.split();
    let (rx, task) = ndt7_server::start(CancellationToken::new(), stream, &config);

    assert_eq!(collect(rx).await, vec![5]);
    let cause = task.await.unwrap();
    assert!(cause.is_abnormal(), "{cause:?}");
    assert_eq!(warnings.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn silent_client_is_bounded_by_max_runtime() {
    let config = ReceiverConfig::default();
    let (_client, server) = pair(&config).await;
    let started = tokio::time::Instant::now();

    let (_sink, stream) = server.split();
    let (rx, task) = ndt7_server::start(CancellationToken::new(), stream, &config);

    assert!(collect(rx).await.is_empty());
    assert!(matches!(task.await.unwrap(), StopCause::ReadTimeout(_)));
    let elapsed = started.elapsed();
    assert!(elapsed >= config.max_runtime);
    assert!(elapsed < config.max_runtime + Duration::from_secs(1), "{elapsed:?}");
}

#[tokio::test]
async fn drain_counts_every_report() {
    let config = ReceiverConfig::default();
    let (mut client, server) = pair(&config).await;

    for n in 0..10 {
        client.send(report(n)).await.unwrap();
    }
    client.close(normal_close()).await.unwrap();

    let summary = ndt7_server::server::drain(server, CancellationToken::new(), &config).await;
    assert_eq!(summary.measurements, 10);
    assert!(matches!(summary.cause, Some(StopCause::PeerClosed)));
}

#[tokio::test]
async fn server_drains_clients_until_shutdown() {
    let shutdown = CancellationToken::new();
    let server = Server::bind("127.0.0.1:0", ReceiverConfig::default(), shutdown.clone())
        .await
        .unwrap();
    let addr = server.local_addr().unwrap();
    let running = tokio::spawn(server.run());

    let (mut client, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/ndt/v7/download"))
        .await
        .unwrap();
    client.send(report(42)).await.unwrap();
    client.close(normal_close()).await.unwrap();

    // Wait until the server has let go of the connection.
    while let Some(msg) = client.next().await {
        if msg.is_err() {
            break;
        }
    }

    shutdown.cancel();
    running.await.unwrap().unwrap();
}

#[tokio::test]
async fn server_keeps_serving_after_a_broken_client() {
    use tokio::io::AsyncWriteExt;

    let shutdown = CancellationToken::new();
    let server = Server::bind("127.0.0.1:0", ReceiverConfig::default(), shutdown.clone())
        .await
        .unwrap();
    let addr = server.local_addr().unwrap();
    let running = tokio::spawn(server.run());

    let mut broken = tokio::net::TcpStream::connect(addr).await.unwrap();
    broken.write_all(b"not an http upgrade\r\n\r\n").await.unwrap();
    drop(broken);

    let (mut client, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/ndt/v7/download"))
        .await
        .unwrap();
    client.send(report(7)).await.unwrap();
    client.close(normal_close()).await.unwrap();
    while let Some(msg) = client.next().await {
        if msg.is_err() {
            break;
        }
    }

    assert!(!running.is_finished());
    shutdown.cancel();
    running.await.unwrap().unwrap();
}
