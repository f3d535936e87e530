use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use parking_lot::Mutex;
use spark_stream::stream::client::{ConnectionPhase, StreamClient, StreamClientError};
use spark_stream::stream::config::{Endpoint, StreamConfig};
use spark_stream::stream::message::Message;
use tokio::io::AsyncReadExt;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(5);

#[derive(Clone)]
struct EchoState {
    observed_tx: mpsc::UnboundedSender<String>,
}

#[derive(Clone)]
struct FlakyState {
    connections: Arc<AtomicUsize>,
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn websocket_client_echoes_text_and_binary() {
    let (observed_tx, mut observed_rx) = mpsc::unbounded_channel();
    let app = Router::new()
        .route("/ws", get(echo_handler))
        .with_state(EchoState { observed_tx });
    let (addr, shutdown_tx, server_task) = spawn_server(app).await;

    let client = StreamClient::new(endpoint(addr));
    let texts = Arc::new(Mutex::new(Vec::new()));
    client.on_text({
        let texts = Arc::clone(&texts);
        move |text: &str| texts.lock().push(text.to_string())
    });

    timeout(WAIT, client.connect())
        .await
        .expect("timed out connecting to mock ws server");
    assert_eq!(client.state(), ConnectionPhase::Open);

    client.send("hello").await.expect("send text");
    let echoed = timeout(WAIT, client.next())
        .await
        .expect("timed out waiting for echo")
        .expect("next after send");
    assert_eq!(echoed, Some(Message::Text("hello".to_string())));

    client
        .send(vec![0xde, 0xad, 0xbe, 0xef])
        .await
        .expect("send binary");
    let echoed = timeout(WAIT, client.next())
        .await
        .expect("timed out waiting for binary echo")
        .expect("next after binary send");
    assert_eq!(echoed, Some(Message::Binary(vec![0xde, 0xad, 0xbe, 0xef])));

    let observed = timeout(WAIT, observed_rx.recv())
        .await
        .expect("timed out waiting for server observation")
        .expect("observation channel closed");
    assert_eq!(observed, "hello");
    assert_eq!(*texts.lock(), vec!["hello".to_string()]);

    client.close();
    assert_eq!(client.next().await.expect("terminal"), None);

    let _ = shutdown_tx.send(());
    let _ = server_task.await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn websocket_client_reconnects_after_server_drop() {
    let connections = Arc::new(AtomicUsize::new(0));
    let app = Router::new()
        .route("/ws", get(flaky_handler))
        .with_state(FlakyState {
            connections: Arc::clone(&connections),
        });
    let (addr, shutdown_tx, server_task) = spawn_server(app).await;

    let config = StreamConfig::default()
        .with_initial_backoff_ms(50)
        .with_max_backoff_ms(200);
    let client = StreamClient::with_config(endpoint(addr), config);
    timeout(WAIT, client.connect())
        .await
        .expect("timed out connecting to mock ws server");

    let mut received = Vec::new();
    for _ in 0..2 {
        let message = timeout(WAIT, next_skipping_gaps(&client))
            .await
            .expect("timed out waiting for greeting");
        received.push(message);
    }
    assert_eq!(
        received,
        vec![
            Message::Text("greeting-1".to_string()),
            Message::Text("greeting-2".to_string()),
        ]
    );
    assert!(connections.load(Ordering::SeqCst) >= 2);

    client.close();
    let _ = shutdown_tx.send(());
    let _ = server_task.await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn websocket_client_without_auto_reconnect_closes_when_refused() {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind throwaway listener");
    let addr = listener.local_addr().expect("read throwaway address");
    drop(listener);

    let config = StreamConfig::default().with_auto_reconnect(false);
    let client = StreamClient::with_config(endpoint(addr), config);
    timeout(WAIT, client.connect())
        .await
        .expect("connect should settle on refusal");
    assert_eq!(client.state(), ConnectionPhase::Closed);
    assert_eq!(client.next().await.expect("terminal"), None);

    let err = client.send("nobody").await.expect_err("send on closed");
    assert!(matches!(err, StreamClientError::NotOpen));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn websocket_close_during_handshake_releases_socket() {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind silent listener");
    let addr = listener.local_addr().expect("read silent listener address");
    // Accepts the connection and never answers the upgrade request.
    let silent_server = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.expect("accept client");
        let mut buf = [0u8; 1024];
        loop {
            match stream.read(&mut buf).await {
                Ok(0) | Err(_) => return,
                Ok(_) => continue,
            }
        }
    });

    let client = StreamClient::new(endpoint(addr));
    let connecting = tokio::spawn({
        let client = client.clone();
        async move { client.connect().await }
    });
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(client.state(), ConnectionPhase::Connecting);

    client.close();
    timeout(WAIT, silent_server)
        .await
        .expect("socket should be released after close")
        .expect("silent server task");
    timeout(WAIT, connecting)
        .await
        .expect("connect should settle after close")
        .expect("connect task");
    assert_eq!(client.state(), ConnectionPhase::Closed);
}

/// Waits through reconnect gaps, where `next` fails fast.
async fn next_skipping_gaps<T>(client: &StreamClient<T>) -> Message
where
    T: spark_stream::stream::transport::Transport,
{
    loop {
        match client.next().await {
            Ok(Some(message)) => return message,
            Ok(None) => panic!("stream ended before greeting"),
            Err(StreamClientError::NotConnected) => {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            Err(err) => panic!("unexpected next error: {err}"),
        }
    }
}

fn endpoint(addr: SocketAddr) -> Endpoint {
    Endpoint::from_http_origin(format!("http://{addr}"), "/ws").expect("mock endpoint")
}

async fn echo_handler(ws: WebSocketUpgrade, State(state): State<EchoState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| echo_session(socket, state))
}

async fn echo_session(mut socket: WebSocket, state: EchoState) {
    while let Some(Ok(frame)) = socket.recv().await {
        let reply = match frame {
            WsMessage::Text(text) => {
                let _ = state.observed_tx.send(text.to_string());
                WsMessage::Text(text)
            }
            WsMessage::Binary(data) => WsMessage::Binary(data),
            WsMessage::Close(_) => return,
            WsMessage::Ping(_) | WsMessage::Pong(_) => continue,
        };
        if socket.send(reply).await.is_err() {
            return;
        }
    }
}

async fn flaky_handler(ws: WebSocketUpgrade, State(state): State<FlakyState>) -> impl IntoResponse {
    let connection = state.connections.fetch_add(1, Ordering::SeqCst) + 1;
    ws.on_upgrade(move |socket| flaky_session(socket, connection))
}

/// Greets, then drops the first connection and keeps later ones open.
async fn flaky_session(mut socket: WebSocket, connection: usize) {
    let greeting = format!("greeting-{connection}");
    if socket.send(WsMessage::Text(greeting.into())).await.is_err() {
        return;
    }
    if connection == 1 {
        let _ = socket.send(WsMessage::Close(None)).await;
        return;
    }
    while let Some(Ok(frame)) = socket.recv().await {
        if matches!(frame, WsMessage::Close(_)) {
            return;
        }
    }
}

async fn spawn_server(
    app: Router,
) -> (SocketAddr, oneshot::Sender<()>, tokio::task::JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind mock server listener");
    let addr = listener
        .local_addr()
        .expect("read mock server listener address");
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let task = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.await;
            })
            .await
            .expect("mock server should run");
    });
    (addr, shutdown_tx, task)
}
