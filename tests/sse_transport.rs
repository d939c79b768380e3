// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Event-stream transport against a minimal in-process SSE server.
//!
//! The server speaks just enough HTTP/1.1 for the transport: a GET on
//! `/sse` opens the event stream (first event announces the POST endpoint),
//! POSTs on `/messages` carry JSON-RPC requests whose responses are pushed
//! back over the stream as `message` events.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Map, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

use dashagent::transport::sse::SseTransport;
use dashagent::transport::Transport;
use dashagent::{ServerDescriptor, ToolManager, TransportKind};

type EventSender = mpsc::UnboundedSender<String>;
type EventReceiver = mpsc::UnboundedReceiver<String>;

async fn spawn_mock_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let (event_tx, event_rx) = mpsc::unbounded_channel::<String>();
    let event_rx = Arc::new(tokio::sync::Mutex::new(Some(event_rx)));

    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            let event_tx = event_tx.clone();
            let event_rx = Arc::clone(&event_rx);
            tokio::spawn(async move {
                let _ = handle_connection(stream, event_tx, event_rx).await;
            });
        }
    });

    addr
}

async fn handle_connection(
    mut stream: TcpStream,
    event_tx: EventSender,
    event_rx: Arc<tokio::sync::Mutex<Option<EventReceiver>>>,
) -> std::io::Result<()> {
    let mut buffer = Vec::new();
    loop {
        // Read one request head.
        let head_end = loop {
            if let Some(pos) = find_head_end(&buffer) {
                break pos;
            }
            let mut chunk = [0u8; 1024];
            let n = stream.read(&mut chunk).await?;
            if n == 0 {
                return Ok(());
            }
            buffer.extend_from_slice(&chunk[..n]);
        };

        let head = String::from_utf8_lossy(&buffer[..head_end]).to_string();
        let mut lines = head.lines();
        let request_line = lines.next().unwrap_or_default().to_string();
        let content_length = lines
            .filter_map(|line| {
                let (name, value) = line.split_once(':')?;
                name.eq_ignore_ascii_case("content-length")
                    .then(|| value.trim().parse::<usize>().ok())?
            })
            .next()
            .unwrap_or(0);

        // Read the body.
        let body_start = head_end + 4;
        while buffer.len() < body_start + content_length {
            let mut chunk = [0u8; 1024];
            let n = stream.read(&mut chunk).await?;
            if n == 0 {
                return Ok(());
            }
            buffer.extend_from_slice(&chunk[..n]);
        }
        let body = buffer[body_start..body_start + content_length].to_vec();
        buffer.drain(..body_start + content_length);

        if request_line.starts_with("GET /sse") {
            // This connection becomes the long-lived event stream.
            let mut rx = event_rx
                .lock()
                .await
                .take()
                .expect("event stream already claimed");
            stream
                .write_all(
                    b"HTTP/1.1 200 OK\r\n\
                      Content-Type: text/event-stream\r\n\
                      Cache-Control: no-cache\r\n\r\n",
                )
                .await?;
            stream
                .write_all(b"event: endpoint\ndata: /messages\n\n")
                .await?;
            stream.flush().await?;
            while let Some(payload) = rx.recv().await {
                stream
                    .write_all(format!("event: message\ndata: {payload}\n\n").as_bytes())
                    .await?;
                stream.flush().await?;
            }
            return Ok(());
        }

        if request_line.starts_with("POST /messages") {
            if let Ok(request) = serde_json::from_slice::<Value>(&body) {
                if let Some(response) = respond_to(&request) {
                    let _ = event_tx.send(response.to_string());
                }
            }
            stream
                .write_all(b"HTTP/1.1 202 Accepted\r\nContent-Length: 0\r\n\r\n")
                .await?;
            stream.flush().await?;
            continue;
        }

        stream
            .write_all(b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\n\r\n")
            .await?;
        stream.flush().await?;
    }
}

fn find_head_end(buffer: &[u8]) -> Option<usize> {
    buffer.windows(4).position(|w| w == b"\r\n\r\n")
}

/// Build the JSON-RPC response for a request; notifications get none.
fn respond_to(request: &Value) -> Option<Value> {
    let id = request.get("id")?.as_i64()?;
    let method = request.get("method")?.as_str()?;
    let result = match method {
        "initialize" => json!({"protocolVersion": "2024-11-05"}),
        "tools/list" => json!({
            "tools": [{
                "name": "echo",
                "description": "echoes back",
                "inputSchema": {"type": "object"}
            }]
        }),
        "tools/call" => json!({
            "content": [{"type": "text", "text": "pong"}]
        }),
        _ => json!({}),
    };
    Some(json!({"jsonrpc": "2.0", "id": id, "result": result}))
}

#[tokio::test]
async fn handshake_discovery_and_dispatch() {
    let addr = spawn_mock_server().await;
    let transport =
        SseTransport::connect("mock", format!("http://{addr}/sse"), &HashMap::new()).unwrap();

    transport.initialize().await.unwrap();

    let tools = transport.list_tools().await.unwrap();
    assert_eq!(tools.len(), 1);
    assert_eq!(tools[0].name, "echo");

    let outcome = transport
        .call_tool("echo", &Map::new(), Duration::from_secs(5))
        .await
        .unwrap();
    assert!(!outcome.is_error);
    assert_eq!(outcome.text(), "pong");

    transport.close().await.unwrap();
}

#[tokio::test]
async fn event_stream_server_registers_with_the_manager() {
    let addr = spawn_mock_server().await;

    let manager = ToolManager::new();
    manager
        .register_server(ServerDescriptor {
            name: "remote".to_string(),
            transport: TransportKind::EventStream {
                url: format!("http://{addr}/sse"),
                headers: HashMap::new(),
            },
            description: None,
            enabled: true,
        })
        .await
        .unwrap();

    let tools = manager.list_tools(Some("remote"));
    assert_eq!(tools.len(), 1);
    assert_eq!(tools[0].name, "echo");
    manager.close().await;
}

#[tokio::test]
async fn disabled_event_stream_server_is_skipped() {
    let manager = ToolManager::new();
    manager
        .register_server(ServerDescriptor {
            name: "off".to_string(),
            transport: TransportKind::EventStream {
                url: "http://127.0.0.1:1/sse".to_string(),
                headers: HashMap::new(),
            },
            description: None,
            enabled: false,
        })
        .await
        .unwrap();
    assert!(manager.list_tools(None).is_empty());
}
