//! End-to-end streaming tests over a real WebSocket connection, with stub
//! engines behind the public traits.

mod common;

use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};

use common::{pcm_frame, session_stats, spawn_server};
use voiceline::ServerConfig;

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

async fn connect(addr: std::net::SocketAddr) -> WsStream {
    let url = format!("ws://{addr}/ws");
    let (stream, _) = connect_async(url).await.expect("connect");
    stream
}

/// Read JSON messages until one of the given type arrives or the timeout
/// elapses.
async fn next_message_of_type(ws: &mut WsStream, wanted: &str, secs: u64) -> serde_json::Value {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(secs);
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        let message = tokio::time::timeout(remaining, ws.next())
            .await
            .unwrap_or_else(|_| panic!("timed out waiting for '{wanted}' message"))
            .expect("stream open")
            .expect("read ok");
        if let Message::Text(text) = message {
            let value: serde_json::Value = serde_json::from_str(&text).unwrap();
            if value["type"] == wanted {
                return value;
            }
        }
    }
}

#[tokio::test]
async fn connection_ack_carries_session_id() {
    let (addr, _state) = spawn_server(ServerConfig::default(), false).await;
    let mut ws = connect(addr).await;

    let ack = next_message_of_type(&mut ws, "connection", 5).await;
    let session_id = ack["session_id"].as_str().unwrap();
    assert_eq!(session_id.len(), 32); // 128-bit hex
    assert!(ack["message"].as_str().unwrap().contains("ready"));
}

#[tokio::test]
async fn silence_produces_no_final_messages() {
    let (addr, state) = spawn_server(ServerConfig::default(), false).await;
    let mut ws = connect(addr).await;
    next_message_of_type(&mut ws, "connection", 5).await;

    for _ in 0..100 {
        ws.send(Message::Binary(pcm_frame(512, 0).into()))
            .await
            .unwrap();
    }

    // Give the pipeline time to (not) produce anything.
    tokio::time::sleep(Duration::from_millis(300)).await;
    let unexpected = tokio::time::timeout(Duration::from_millis(200), ws.next()).await;
    assert!(unexpected.is_err(), "expected no further messages");

    assert_eq!(session_stats(&state).active_sessions, 1);
}

#[tokio::test]
async fn utterance_split_into_frames_yields_one_final() {
    let (addr, _state) = spawn_server(ServerConfig::default(), false).await;
    let mut ws = connect(addr).await;
    next_message_of_type(&mut ws, "connection", 5).await;

    // A 3-second utterance split into 24 equal frames, then enough
    // trailing silence to complete the segment.
    for _ in 0..24 {
        ws.send(Message::Binary(pcm_frame(2000, 8000).into()))
            .await
            .unwrap();
    }
    ws.send(Message::Binary(pcm_frame(4096, 0).into()))
        .await
        .unwrap();

    let message = next_message_of_type(&mut ws, "final", 5).await;
    assert_eq!(message["text"], "hello world");
    assert!(message["timestamp"].as_u64().unwrap() > 0);

    // One utterance, one final.
    tokio::time::sleep(Duration::from_millis(300)).await;
    let extra = tokio::time::timeout(Duration::from_millis(200), ws.next()).await;
    assert!(extra.is_err(), "expected exactly one final message");
}

#[tokio::test]
async fn odd_length_frame_reports_error_and_session_survives() {
    let (addr, _state) = spawn_server(ServerConfig::default(), false).await;
    let mut ws = connect(addr).await;
    next_message_of_type(&mut ws, "connection", 5).await;

    ws.send(Message::Binary(vec![1, 2, 3].into())).await.unwrap();
    let error = next_message_of_type(&mut ws, "error", 5).await;
    assert!(error["message"].as_str().unwrap().contains("invalid audio"));

    // The session is still usable: a full utterance still decodes.
    for _ in 0..24 {
        ws.send(Message::Binary(pcm_frame(2000, 8000).into()))
            .await
            .unwrap();
    }
    ws.send(Message::Binary(pcm_frame(4096, 0).into()))
        .await
        .unwrap();
    let message = next_message_of_type(&mut ws, "final", 5).await;
    assert_eq!(message["text"], "hello world");
}

#[tokio::test]
async fn oversized_frame_closes_the_session() {
    let mut config = ServerConfig::default();
    config.server.websocket.max_message_size = 4096;
    let (addr, state) = spawn_server(config, false).await;

    let mut ws = connect(addr).await;
    next_message_of_type(&mut ws, "connection", 5).await;

    ws.send(Message::Binary(vec![0u8; 8192].into()))
        .await
        .unwrap();

    // The server closes the connection; the stream ends.
    let closed = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match ws.next().await {
                None | Some(Ok(Message::Close(_))) | Some(Err(_)) => break,
                _ => continue,
            }
        }
    })
    .await;
    assert!(closed.is_ok(), "connection should close");

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(session_stats(&state).active_sessions, 0);
}

#[tokio::test]
async fn text_frames_are_rejected_without_closing() {
    let (addr, _state) = spawn_server(ServerConfig::default(), false).await;
    let mut ws = connect(addr).await;
    next_message_of_type(&mut ws, "connection", 5).await;

    ws.send(Message::Text("not audio".into())).await.unwrap();
    let error = next_message_of_type(&mut ws, "error", 5).await;
    assert!(
        error["message"]
            .as_str()
            .unwrap()
            .contains("binary audio frame")
    );
}

#[tokio::test]
async fn two_sessions_share_a_pool_of_one() {
    let mut config = ServerConfig::default();
    config.vad.pool_size = 1;
    let (addr, state) = spawn_server(config, false).await;

    let mut first = connect(addr).await;
    let mut second = connect(addr).await;
    next_message_of_type(&mut first, "connection", 5).await;
    next_message_of_type(&mut second, "connection", 5).await;

    for ws in [&mut first, &mut second] {
        for _ in 0..24 {
            ws.send(Message::Binary(pcm_frame(2000, 8000).into()))
                .await
                .unwrap();
        }
        ws.send(Message::Binary(pcm_frame(4096, 0).into()))
            .await
            .unwrap();
    }

    // Both sessions transcribe: the second rides a transient instance.
    let a = next_message_of_type(&mut first, "final", 5).await;
    let b = next_message_of_type(&mut second, "final", 5).await;
    assert_eq!(a["text"], "hello world");
    assert_eq!(b["text"], "hello world");

    let stats = session_stats(&state);
    assert_eq!(stats.pool.pool_size, 1);
    assert!(stats.pool.total_created >= 2, "transient instance was built");
}

#[tokio::test]
async fn session_resources_return_to_pool_on_disconnect() {
    let (addr, state) = spawn_server(ServerConfig::default(), false).await;
    let mut ws = connect(addr).await;
    next_message_of_type(&mut ws, "connection", 5).await;

    // Bind a VAD instance by sending audio, then disconnect.
    ws.send(Message::Binary(pcm_frame(512, 0).into()))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(session_stats(&state).pool.active_count, 1);

    ws.close(None).await.unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;

    let stats = session_stats(&state);
    assert_eq!(stats.active_sessions, 0);
    assert_eq!(stats.pool.active_count, 0);
    assert_eq!(
        stats.pool.available_count + stats.pool.active_count as usize,
        stats.pool.total_instances
    );
}
