use super::*;
use std::io::Cursor;
use std::time::Duration;

use axum::{
    extract::{
        ws::{Message as WsMessage, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
    routing::get,
    Router,
};
use ::image::{DynamicImage, ImageFormat, Rgb, RgbImage};
use tokio::net::TcpListener;

#[derive(Clone, Default)]
struct RelayOptions {
    /// Payloads pushed to the client before each echo.
    script: Vec<String>,
    /// Close the connection after the first echo (the client must
    /// reconnect to keep talking).
    close_after_echo: bool,
}

async fn handle_ws(ws: WebSocketUpgrade, State(options): State<RelayOptions>) -> Response {
    ws.on_upgrade(move |socket| relay(socket, options))
}

async fn relay(mut socket: WebSocket, options: RelayOptions) {
    while let Some(Ok(message)) = socket.recv().await {
        if let WsMessage::Text(text) = message {
            for line in &options.script {
                if socket.send(WsMessage::Text(line.clone())).await.is_err() {
                    return;
                }
            }
            if socket.send(WsMessage::Text(text)).await.is_err() {
                return;
            }
            if options.close_after_echo {
                return;
            }
        }
    }
}

async fn spawn_relay(options: RelayOptions) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    let app = Router::new()
        .route("/chat", get(handle_ws))
        .with_state(options);
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    format!("ws://{addr}/chat")
}

fn test_config(url: &str) -> ClientConfig {
    ClientConfig {
        server_url: url.into(),
        backoff: BackoffConfig {
            base: Duration::from_millis(50),
            growth: 1.5,
            max: Duration::from_millis(200),
        },
        ..ClientConfig::default()
    }
}

/// Endpoint nothing listens on; connects are refused immediately.
async fn dead_endpoint() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    drop(listener);
    format!("ws://{addr}/chat")
}

fn png_bytes(width: u32, height: u32) -> Vec<u8> {
    let pixels = RgbImage::from_fn(width, height, |x, y| {
        Rgb([(x % 251) as u8, (y % 241) as u8, ((x * 7 + y * 13) % 239) as u8])
    });
    let mut out = Vec::new();
    DynamicImage::ImageRgb8(pixels)
        .write_to(&mut Cursor::new(&mut out), ImageFormat::Png)
        .expect("encode test fixture");
    out
}

async fn wait_connected(client: &ChatClient) {
    tokio::time::timeout(Duration::from_secs(10), async {
        while !client.is_connected() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("client did not connect in time");
}

async fn wait_all_confirmed(client: &ChatClient, want: usize) {
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let snapshot = client.snapshot().await;
            if snapshot.messages.len() >= want
                && snapshot
                    .messages
                    .iter()
                    .all(|m| m.origin != MessageOrigin::LocalPending)
            {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("messages were not confirmed in time");
}

#[tokio::test]
async fn join_validates_and_fixes_identity() {
    let client = ChatClient::connect(test_config(&dead_endpoint().await)).expect("client");
    assert_eq!(client.join("").await, Err(ValidationError::TooShort));
    assert_eq!(client.join(" a ").await, Err(ValidationError::TooShort));
    assert_eq!(client.join("  bob  ").await, Ok(()));
    assert_eq!(client.join("carol").await, Err(ValidationError::AlreadyJoined));
    client.shutdown();
}

#[tokio::test]
async fn send_text_requires_identity_and_content() {
    let client = ChatClient::connect(test_config(&dead_endpoint().await)).expect("client");
    assert!(matches!(
        client.send_text("hi").await,
        Err(SendError::NotJoined)
    ));

    client.join("bob").await.expect("join");
    client.send_text("   ").await.expect("empty text is a no-op");
    assert!(client.snapshot().await.messages.is_empty());
    client.shutdown();
}

#[tokio::test]
async fn offline_send_is_optimistic_and_surfaces_status() {
    let client = ChatClient::connect(test_config(&dead_endpoint().await)).expect("client");
    client.join("bob").await.expect("join");
    client.send_text("hello").await.expect("send is non-fatal");

    let snapshot = client.snapshot().await;
    assert!(!snapshot.is_connected);
    assert_eq!(snapshot.messages.len(), 1);
    assert_eq!(snapshot.messages[0].origin, MessageOrigin::LocalPending);
    assert!(snapshot.error_message.is_some());

    client.dismiss_error().await;
    assert!(client.snapshot().await.error_message.is_none());
    client.shutdown();
}

#[tokio::test]
async fn verbatim_echo_yields_exactly_one_message() {
    let url = spawn_relay(RelayOptions::default()).await;
    let client = ChatClient::connect(test_config(&url)).expect("client");
    let mut events = client.subscribe_events();
    wait_connected(&client).await;
    client.join("bob").await.expect("join");
    client.send_text("hello").await.expect("send");

    // The optimistic append is observable immediately.
    let appended = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Ok(ClientEvent::MessageAppended(message)) = events.recv().await {
                return message;
            }
        }
    })
    .await
    .expect("append event");
    assert_eq!(appended.text, "hello");
    assert_eq!(appended.user, "bob");

    // The echo confirms it instead of duplicating it.
    wait_all_confirmed(&client, 1).await;
    let snapshot = client.snapshot().await;
    assert_eq!(snapshot.messages.len(), 1);
    assert_eq!(snapshot.messages[0].origin, MessageOrigin::LocalConfirmed);
    client.shutdown();
}

#[tokio::test]
async fn inbound_replays_and_malformed_payloads_are_suppressed() {
    let remote = serde_json::to_string(&WireMessage {
        id: Some("remote-1".into()),
        user: "alice".into(),
        text: "hi bob".into(),
        kind: MessageKind::Text,
        timestamp: 123,
        client_generated_id: false,
    })
    .expect("encode fixture");

    let url = spawn_relay(RelayOptions {
        script: vec!["this is not json".into(), remote.clone(), remote],
        close_after_echo: false,
    })
    .await;
    let client = ChatClient::connect(test_config(&url)).expect("client");
    wait_connected(&client).await;
    client.join("bob").await.expect("join");
    client.send_text("ping").await.expect("send");

    wait_all_confirmed(&client, 2).await;
    // Settle window for any straggler duplicates.
    tokio::time::sleep(Duration::from_millis(200)).await;

    let snapshot = client.snapshot().await;
    assert_eq!(snapshot.messages.len(), 2);
    let alice: Vec<_> = snapshot
        .messages
        .iter()
        .filter(|m| m.user == "alice")
        .collect();
    assert_eq!(alice.len(), 1);
    assert_eq!(alice[0].origin, MessageOrigin::Remote);
    client.shutdown();
}

#[tokio::test]
async fn reconnects_after_server_close_and_resets_counter() {
    let url = spawn_relay(RelayOptions {
        script: Vec::new(),
        close_after_echo: true,
    })
    .await;
    let client = ChatClient::connect(test_config(&url)).expect("client");
    wait_connected(&client).await;
    client.join("bob").await.expect("join");
    client.send_text("hello").await.expect("send");
    wait_all_confirmed(&client, 1).await;

    // The relay closes after the echo; the client must notice and retry.
    tokio::time::timeout(Duration::from_secs(10), async {
        while client.is_connected() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("close not observed");

    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let snapshot = client.snapshot().await;
            if snapshot.is_connected && snapshot.error_message.is_none() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("reconnect not observed");

    assert_eq!(client.connection().reconnect_count(), 0);
    assert_eq!(client.snapshot().await.messages.len(), 1);
    client.shutdown();
}

#[tokio::test]
async fn image_selection_and_send_flow() {
    let url = spawn_relay(RelayOptions::default()).await;
    let client = ChatClient::connect(test_config(&url)).expect("client");
    wait_connected(&client).await;
    client.join("bob").await.expect("join");

    assert!(matches!(
        client.send_selected_image().await,
        Err(SendError::NoSelection)
    ));

    let png = png_bytes(8, 8);
    client
        .select_image(png.clone(), "image/png")
        .await
        .expect("select");
    let pending = client.pending_selection().await.expect("pending");
    assert_eq!((pending.width, pending.height), (8, 8));

    client.cancel_selection().await;
    assert!(client.pending_selection().await.is_none());

    client
        .select_image(png, "image/png")
        .await
        .expect("select again");
    client.send_selected_image().await.expect("send image");
    assert!(client.pending_selection().await.is_none());

    wait_all_confirmed(&client, 1).await;
    let snapshot = client.snapshot().await;
    assert_eq!(snapshot.messages.len(), 1);
    assert_eq!(snapshot.messages[0].kind, MessageKind::Image);
    // Small fixture fits the budget: pass-through keeps the original mime.
    assert!(snapshot.messages[0]
        .text
        .starts_with("data:image/png;base64,"));
    client.shutdown();
}

#[tokio::test]
async fn superseded_preview_decodes_install_nothing() {
    let url = spawn_relay(RelayOptions::default()).await;
    let client = ChatClient::connect(test_config(&url)).expect("client");
    wait_connected(&client).await;
    client.join("bob").await.expect("join");

    // Large fixture keeps the first decode in flight while the cancel lands.
    let racing = Arc::clone(&client);
    let large = png_bytes(2048, 2048);
    let slow = tokio::spawn(async move { racing.select_image(large, "image/png").await });
    tokio::time::sleep(Duration::from_millis(50)).await;
    client.cancel_selection().await;
    slow.await
        .expect("select task")
        .expect("a superseded select is not an error");
    assert!(client.pending_selection().await.is_none());

    // A newer selection wins over a still-decoding older one.
    let racing = Arc::clone(&client);
    let large = png_bytes(2048, 2048);
    let slow = tokio::spawn(async move { racing.select_image(large, "image/png").await });
    tokio::time::sleep(Duration::from_millis(50)).await;
    client
        .select_image(png_bytes(8, 8), "image/png")
        .await
        .expect("select");
    slow.await
        .expect("select task")
        .expect("a superseded select is not an error");
    let pending = client.pending_selection().await.expect("newest selection");
    assert_eq!((pending.width, pending.height), (8, 8));
    client.shutdown();
}

#[tokio::test]
async fn deliberate_shutdown_does_not_raise_the_reconnect_banner() {
    let url = spawn_relay(RelayOptions::default()).await;
    let client = ChatClient::connect(test_config(&url)).expect("client");
    wait_connected(&client).await;
    client.join("bob").await.expect("join");

    client.shutdown();
    tokio::time::sleep(Duration::from_millis(100)).await;
    let snapshot = client.snapshot().await;
    assert!(!snapshot.is_connected);
    assert!(snapshot.error_message.is_none());
}

#[tokio::test]
async fn undecodable_selection_is_reported_and_nothing_is_queued() {
    let url = spawn_relay(RelayOptions::default()).await;
    let client = ChatClient::connect(test_config(&url)).expect("client");
    wait_connected(&client).await;
    client.join("bob").await.expect("join");

    let err = client
        .select_image(vec![1, 2, 3], "image/png")
        .await
        .expect_err("garbage must not decode");
    assert!(matches!(err, ImageError::DecodeFailed(_)));

    let snapshot = client.snapshot().await;
    assert!(snapshot.error_message.is_some());
    assert!(snapshot.messages.is_empty());
    assert!(client.pending_selection().await.is_none());
    client.shutdown();
}
