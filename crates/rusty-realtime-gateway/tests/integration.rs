//! Gateway integration tests: a real gateway in front of a fake realtime endpoint.
//!
//! Run with: `cargo test -p rusty-realtime-gateway --test integration`

use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

use rusty_realtime_core::config::{Config, RealtimeEndpoint};
use rusty_realtime_gateway::GatewayState;
use rusty_realtime_media::VoiceActivityGate;
use rusty_realtime_tools::ToolRegistry;

/// Fake realtime endpoint. Reports the type of every event it receives and
/// answers each audio append with an audio delta carrying the same audio.
async fn start_fake_realtime() -> (String, mpsc::UnboundedReceiver<String>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (seen_tx, seen_rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        while let Ok((tcp, _)) = listener.accept().await {
            let seen_tx = seen_tx.clone();
            tokio::spawn(async move {
                let Ok(mut ws) = tokio_tungstenite::accept_async(tcp).await else {
                    return;
                };
                while let Some(Ok(Message::Text(text))) = ws.next().await {
                    let event: Value = serde_json::from_str(&text).unwrap();
                    let _ = seen_tx.send(event["type"].as_str().unwrap_or_default().to_string());
                    if event["type"] == "input_audio_buffer.append" {
                        let reply = json!({"type": "response.audio.delta", "delta": event["audio"]});
                        if ws.send(Message::Text(reply.to_string().into())).await.is_err() {
                            break;
                        }
                    }
                }
            });
        }
    });

    (format!("ws://{addr}/v1/realtime"), seen_rx)
}

/// Start a gateway on a free port. Sending on the returned channel shuts it down.
async fn start_test_gateway(realtime_url: String) -> (Arc<GatewayState>, u16, oneshot::Sender<()>) {
    let config = Config::default();
    let endpoint = RealtimeEndpoint {
        url: realtime_url,
        model: "test-model".into(),
        api_key: "sk-test".into(),
        protocol_version: "realtime=v1".into(),
    };
    let tools = Arc::new(ToolRegistry::new());
    let session_config = config.session_config(tools.definitions()).unwrap();
    let state = Arc::new(GatewayState::new(
        endpoint,
        session_config,
        tools,
        Arc::new(VoiceActivityGate::default()),
    ));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let state_clone = state.clone();
    tokio::spawn(async move {
        let _ = rusty_realtime_gateway::serve(listener, state_clone, async {
            let _ = stop_rx.await;
        })
        .await;
    });

    (state, port, stop_tx)
}

async fn health(port: u16) -> Value {
    reqwest::get(format!("http://127.0.0.1:{port}/health"))
        .await
        .expect("Health request failed")
        .json()
        .await
        .unwrap()
}

async fn wait_for_sessions(state: &GatewayState, expected: usize) {
    for _ in 0..100 {
        if state.session_count().await == expected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("expected {expected} live sessions, found {}", state.session_count().await);
}

fn speech_append() -> String {
    let bytes: Vec<u8> = (0..640)
        .flat_map(|i| {
            let sample: i16 = if i % 2 == 0 { 8000 } else { -8000 };
            sample.to_le_bytes()
        })
        .collect();
    let audio = base64::engine::general_purpose::STANDARD.encode(bytes);
    json!({"type": "input_audio_buffer.append", "audio": audio}).to_string()
}

#[tokio::test]
async fn test_health_endpoint() {
    let (url, _seen) = start_fake_realtime().await;
    let (_state, port, _stop) = start_test_gateway(url).await;

    let body = health(port).await;
    assert_eq!(body["status"], "ok");
    assert!(body["version"].is_string());
    assert_eq!(body["sessions"], 0);
}

#[tokio::test]
async fn test_relay_round_trip() {
    let (url, mut seen) = start_fake_realtime().await;
    let (state, port, _stop) = start_test_gateway(url).await;

    let (mut ws, _) = connect_async(format!("ws://127.0.0.1:{port}/ws"))
        .await
        .expect("WS connect failed");

    // The session is configured before any audio reaches the model.
    let first = tokio::time::timeout(Duration::from_secs(5), seen.recv()).await.unwrap().unwrap();
    assert_eq!(first, "session.update");

    let append = speech_append();
    ws.send(Message::Text(append.clone().into())).await.unwrap();

    let reply = tokio::time::timeout(Duration::from_secs(5), ws.next())
        .await
        .expect("reply within 5s")
        .unwrap()
        .unwrap();
    let audio = serde_json::from_str::<Value>(&append).unwrap()["audio"].clone();
    let expected = json!({"type": "response.audio.delta", "delta": audio}).to_string();
    assert_eq!(reply.to_text().unwrap(), expected);
    assert_eq!(seen.recv().await.unwrap(), "input_audio_buffer.append");

    assert_eq!(health(port).await["sessions"], 1);

    ws.close(None).await.unwrap();
    wait_for_sessions(&state, 0).await;
}

#[tokio::test]
async fn test_silence_is_not_relayed() {
    let (url, mut seen) = start_fake_realtime().await;
    let (_state, port, _stop) = start_test_gateway(url).await;

    let (mut ws, _) = connect_async(format!("ws://127.0.0.1:{port}/ws")).await.unwrap();
    assert_eq!(seen.recv().await.unwrap(), "session.update");

    let silence = base64::engine::general_purpose::STANDARD.encode([0u8; 1280]);
    let append = json!({"type": "input_audio_buffer.append", "audio": silence}).to_string();
    ws.send(Message::Text(append.into())).await.unwrap();
    ws.send(Message::Text(r#"{"type":"input_audio_buffer.commit"}"#.into()))
        .await
        .unwrap();

    let next = tokio::time::timeout(Duration::from_secs(5), seen.recv()).await.unwrap().unwrap();
    assert_eq!(next, "input_audio_buffer.commit");
}

#[tokio::test]
async fn test_shutdown_closes_live_sessions() {
    let (url, mut seen) = start_fake_realtime().await;
    let (state, port, stop) = start_test_gateway(url).await;

    let (mut ws, _) = connect_async(format!("ws://127.0.0.1:{port}/ws")).await.unwrap();
    assert_eq!(seen.recv().await.unwrap(), "session.update");
    wait_for_sessions(&state, 1).await;

    stop.send(()).unwrap();
    wait_for_sessions(&state, 0).await;

    // The client sees the socket close.
    let closed = tokio::time::timeout(Duration::from_secs(5), async {
        while let Some(Ok(msg)) = ws.next().await {
            if msg.is_close() {
                break;
            }
        }
    })
    .await;
    assert!(closed.is_ok());
}

#[tokio::test]
async fn test_unreachable_endpoint_closes_client() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dead = format!("ws://{}/v1/realtime", listener.local_addr().unwrap());
    drop(listener);
    let (state, port, _stop) = start_test_gateway(dead).await;

    let (mut ws, _) = connect_async(format!("ws://127.0.0.1:{port}/ws")).await.unwrap();
    let closed = tokio::time::timeout(Duration::from_secs(5), async {
        while let Some(Ok(msg)) = ws.next().await {
            if msg.is_close() {
                break;
            }
        }
    })
    .await;
    assert!(closed.is_ok());
    wait_for_sessions(&state, 0).await;
}
