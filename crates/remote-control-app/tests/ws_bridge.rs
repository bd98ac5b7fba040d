//! End-to-end bridge tests over a real listener and a real pty.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use remote_control_app::web::bridge::{BridgeOptions, WsBridge};
use remote_control_app::web::routes::{create_router, AppState};
use remote_control_terminal::Terminal;

type WsClient = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

fn fast_options() -> BridgeOptions {
    BridgeOptions {
        ping_interval: Duration::from_secs(1),
        client_read_timeout: Duration::from_secs(3),
        ..BridgeOptions::default()
    }
}

async fn start_server(terminal: Terminal, token: &str, opts: BridgeOptions) -> (String, Arc<WsBridge>) {
    let bridge = Arc::new(WsBridge::new(Arc::new(terminal), token.to_string(), opts));
    bridge.start();
    let router = create_router(AppState {
        bridge: Arc::clone(&bridge),
        session_id: "rc-test".into(),
    });
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = axum::serve(listener, router).await;
    });
    (format!("ws://{addr}/ws"), bridge)
}

async fn dial(url: &str) -> WsClient {
    let (client, _) = connect_async(url).await.expect("dial websocket");
    client
}

async fn dial_and_auth(url: &str, token: &str) -> WsClient {
    let mut client = dial(url).await;
    client
        .send(Message::Text(
            json!({"type": "auth", "token": token, "columns": 80, "rows": 24}).to_string(),
        ))
        .await
        .expect("send auth");
    client
}

async fn expect_text_type(client: &mut WsClient, target: &str, budget: Duration) -> Value {
    let deadline = tokio::time::Instant::now() + budget;
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        let frame = timeout(remaining, client.next())
            .await
            .unwrap_or_else(|_| panic!("timed out waiting for text frame {target:?}"))
            .unwrap_or_else(|| panic!("connection closed waiting for {target:?}"))
            .expect("websocket read");
        if let Message::Text(text) = frame {
            if let Ok(value) = serde_json::from_str::<Value>(&text) {
                if value["type"] == target {
                    return value;
                }
            }
        }
    }
}

async fn expect_binary_containing(client: &mut WsClient, fragment: &str, budget: Duration) -> String {
    let deadline = tokio::time::Instant::now() + budget;
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        let frame = timeout(remaining, client.next())
            .await
            .unwrap_or_else(|_| panic!("timed out waiting for binary containing {fragment:?}"))
            .unwrap_or_else(|| panic!("connection closed waiting for {fragment:?}"))
            .expect("websocket read");
        if let Message::Binary(payload) = frame {
            let text = String::from_utf8_lossy(&payload).to_string();
            if text.contains(fragment) {
                return text;
            }
        }
    }
}

#[tokio::test]
async fn auth_input_ping_and_prefs() {
    // The short sleep keeps the banner from racing ahead of the first
    // client; chunks broadcast before anyone is connected are dropped.
    let terminal = Terminal::start_command(
        "sleep 1; printf 'ready\\n'; while IFS= read -r line; do echo \"ECHO:$line\"; done",
    )
    .unwrap();
    let opts = BridgeOptions {
        ack_quantum_bytes: 12345,
        ..fast_options()
    };
    let (url, bridge) = start_server(terminal, "token-ok", opts).await;

    let mut client = dial_and_auth(&url, "token-ok").await;
    expect_text_type(&mut client, "auth_ok", Duration::from_secs(2)).await;
    let prefs = expect_text_type(&mut client, "prefs", Duration::from_secs(2)).await;
    assert_eq!(prefs["bytes"], 12345);
    expect_binary_containing(&mut client, "ready", Duration::from_secs(3)).await;

    client
        .send(Message::Text(json!({"type": "ping"}).to_string()))
        .await
        .unwrap();
    expect_text_type(&mut client, "pong", Duration::from_secs(2)).await;

    client
        .send(Message::Text(
            json!({"type": "input", "data": "hello-from-websocket"}).to_string(),
        ))
        .await
        .unwrap();
    client
        .send(Message::Text(json!({"type": "input", "data": "\n"}).to_string()))
        .await
        .unwrap();
    expect_binary_containing(&mut client, "ECHO:hello-from-websocket", Duration::from_secs(4)).await;

    bridge.close().await;
}

#[tokio::test]
async fn readonly_blocks_input() {
    let terminal = Terminal::start_command("cat").unwrap();
    let opts = BridgeOptions {
        read_only: true,
        ..fast_options()
    };
    let (url, bridge) = start_server(terminal, "token-ro", opts).await;

    let mut client = dial_and_auth(&url, "token-ro").await;
    expect_text_type(&mut client, "auth_ok", Duration::from_secs(2)).await;
    expect_text_type(&mut client, "prefs", Duration::from_secs(2)).await;
    expect_text_type(&mut client, "readonly", Duration::from_secs(2)).await;

    client
        .send(Message::Text(
            json!({"type": "input", "data": "should-not-write\n"}).to_string(),
        ))
        .await
        .unwrap();
    let block = expect_text_type(&mut client, "readonly", Duration::from_secs(2)).await;
    let message = block["message"].as_str().unwrap_or_default().to_lowercase();
    assert!(message.contains("input blocked"), "unexpected notice {message:?}");

    // cat echoes nothing it never received; give any stray frame a moment.
    let stray = timeout(Duration::from_millis(500), client.next()).await;
    if let Ok(Some(Ok(Message::Binary(payload)))) = stray {
        let text = String::from_utf8_lossy(&payload);
        assert!(
            !text.contains("should-not-write"),
            "input leaked into readonly pty: {text:?}"
        );
    }

    bridge.close().await;
}

#[tokio::test]
async fn expired_and_invalid_tokens_are_denied() {
    let terminal = Terminal::start_command("cat").unwrap();
    let opts = BridgeOptions {
        token_expires_at: Some(Utc::now() - chrono::Duration::seconds(1)),
        ..fast_options()
    };
    let (url, bridge) = start_server(terminal, "token-good", opts).await;
    let mut client = dial(&url).await;
    client
        .send(Message::Text(
            json!({"type": "auth", "token": "token-good"}).to_string(),
        ))
        .await
        .unwrap();
    let denial = expect_text_type(&mut client, "auth_error", Duration::from_secs(2)).await;
    assert!(denial["message"]
        .as_str()
        .unwrap_or_default()
        .to_lowercase()
        .contains("expired"));
    bridge.close().await;

    let terminal = Terminal::start_command("cat").unwrap();
    let (url, bridge) = start_server(terminal, "token-good", fast_options()).await;
    let mut client = dial(&url).await;
    client
        .send(Message::Text(
            json!({"type": "auth", "token": "token-bad"}).to_string(),
        ))
        .await
        .unwrap();
    let denial = expect_text_type(&mut client, "auth_error", Duration::from_secs(2)).await;
    assert!(denial["message"]
        .as_str()
        .unwrap_or_default()
        .to_lowercase()
        .contains("invalid token"));
    bridge.close().await;
}

#[tokio::test]
async fn auth_is_required_and_malformed_messages_are_ignored() {
    let terminal = Terminal::start_command("cat").unwrap();
    let (url, bridge) = start_server(terminal, "token-auth", fast_options()).await;

    let mut client = dial(&url).await;
    client
        .send(Message::Text(
            json!({"type": "input", "data": "must-fail"}).to_string(),
        ))
        .await
        .unwrap();
    let denial = expect_text_type(&mut client, "auth_error", Duration::from_secs(2)).await;
    assert!(denial["message"]
        .as_str()
        .unwrap_or_default()
        .to_lowercase()
        .contains("auth"));

    let mut client = dial_and_auth(&url, "token-auth").await;
    expect_text_type(&mut client, "auth_ok", Duration::from_secs(2)).await;
    expect_text_type(&mut client, "prefs", Duration::from_secs(2)).await;
    client.send(Message::Text("{".into())).await.unwrap();
    client
        .send(Message::Text(json!({"type": "ping"}).to_string()))
        .await
        .unwrap();
    expect_text_type(&mut client, "pong", Duration::from_secs(2)).await;

    bridge.close().await;
}

#[tokio::test]
async fn client_cap_and_origin_checks() {
    let terminal = Terminal::start_command("cat").unwrap();
    let counts = Arc::new(Mutex::new(Vec::new()));
    let counts_cb = Arc::clone(&counts);
    let opts = BridgeOptions {
        max_clients: 1,
        on_client_count_change: Some(Box::new(move |count| {
            counts_cb.lock().unwrap().push(count);
        })),
        ..fast_options()
    };
    let (url, bridge) = start_server(terminal, "token-limit", opts).await;

    let mut first = dial_and_auth(&url, "token-limit").await;
    expect_text_type(&mut first, "auth_ok", Duration::from_secs(2)).await;
    expect_text_type(&mut first, "prefs", Duration::from_secs(2)).await;

    let mut second = dial(&url).await;
    second
        .send(Message::Text(
            json!({"type": "auth", "token": "token-limit"}).to_string(),
        ))
        .await
        .unwrap();
    let info = expect_text_type(&mut second, "info", Duration::from_secs(2)).await;
    assert!(info["message"]
        .as_str()
        .unwrap_or_default()
        .contains("already connected"));

    // Cross-origin upgrade is refused before the handshake completes.
    let mut request = url.clone().into_client_request().unwrap();
    request
        .headers_mut()
        .insert("Origin", "https://evil.example.com".parse().unwrap());
    match connect_async(request).await {
        Err(WsError::Http(response)) => assert_eq!(response.status().as_u16(), 403),
        other => panic!("expected 403 rejection, got {other:?}"),
    }

    assert_eq!(counts.lock().unwrap().first(), Some(&1));
    bridge.close().await;
    assert_eq!(counts.lock().unwrap().last(), Some(&0));
}

#[tokio::test]
async fn flow_pause_and_resume() {
    let terminal = Terminal::start_command("sleep 1; yes x | head -c 250000").unwrap();
    let opts = BridgeOptions {
        read_only: true,
        low_watermark_bytes: 1024,
        high_watermark_bytes: 2048,
        ..fast_options()
    };
    let (url, bridge) = start_server(terminal, "token-flow", opts).await;

    let mut client = dial_and_auth(&url, "token-flow").await;
    expect_text_type(&mut client, "auth_ok", Duration::from_secs(2)).await;
    expect_text_type(&mut client, "prefs", Duration::from_secs(2)).await;
    expect_text_type(&mut client, "readonly", Duration::from_secs(2)).await;

    let pause = expect_text_type(&mut client, "flow_pause", Duration::from_secs(5)).await;
    assert!(pause["message"]
        .as_str()
        .unwrap_or_default()
        .to_lowercase()
        .contains("pausing output"));
    client
        .send(Message::Text(json!({"type": "ack", "bytes": 1_000_000}).to_string()))
        .await
        .unwrap();
    expect_text_type(&mut client, "flow_resume", Duration::from_secs(2)).await;

    bridge.close().await;
}

#[tokio::test]
async fn access_code_second_frame_and_mismatch() {
    let terminal = Terminal::start_command("cat").unwrap();
    let opts = BridgeOptions {
        access_code: "1234".into(),
        ..fast_options()
    };
    let (url, bridge) = start_server(terminal, "token-code", opts).await;

    // Wrong code inside the first frame.
    let mut client = dial(&url).await;
    client
        .send(Message::Text(
            json!({"type": "auth", "token": "token-code", "code": "9999"}).to_string(),
        ))
        .await
        .unwrap();
    let denial = expect_text_type(&mut client, "auth_error", Duration::from_secs(2)).await;
    assert!(denial["message"]
        .as_str()
        .unwrap_or_default()
        .contains("invalid code"));

    // Token first, code in a follow-up auth frame.
    let mut client = dial(&url).await;
    client
        .send(Message::Text(
            json!({"type": "auth", "token": "token-code"}).to_string(),
        ))
        .await
        .unwrap();
    client
        .send(Message::Text(
            json!({"type": "auth", "token": "token-code", "code": "1234"}).to_string(),
        ))
        .await
        .unwrap();
    expect_text_type(&mut client, "auth_ok", Duration::from_secs(2)).await;

    bridge.close().await;
}

#[tokio::test]
async fn healthz_reports_session_id() {
    let terminal = Terminal::start_command("cat").unwrap();
    let (url, bridge) = start_server(terminal, "token-health", fast_options()).await;
    let http_url = url.replace("ws://", "http://").replace("/ws", "/healthz");
    let body: Value = reqwest::get(&http_url).await.unwrap().json().await.unwrap();
    assert_eq!(body["ok"], true);
    assert_eq!(body["id"], "rc-test");
    bridge.close().await;
}

#[tokio::test]
async fn double_close_is_harmless() {
    let terminal = Terminal::start_command("cat").unwrap();
    let (url, bridge) = start_server(terminal, "token-close", fast_options()).await;
    let mut client = dial_and_auth(&url, "token-close").await;
    expect_text_type(&mut client, "auth_ok", Duration::from_secs(2)).await;
    bridge.close().await;
    bridge.close().await;
    // The client observes the server-initiated close.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        match timeout(remaining, client.next()).await {
            Ok(Some(Ok(Message::Close(_)))) | Ok(None) | Err(_) => break,
            Ok(Some(Ok(_))) => continue,
            Ok(Some(Err(_))) => break,
        }
    }
}
