// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Subprocess transport with newline-delimited JSON-RPC framing.
//!
//! The server is spawned as a child process. Requests are written to its
//! stdin as one JSON value per `\n`-terminated UTF-8 line; a background
//! reader decodes stdout lines and resolves the pending request matching the
//! response id. Stderr is surfaced at warning severity. When the process
//! exits, every pending request fails with a transport error, and reconnection
//! is the caller's responsibility.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::oneshot;

use crate::error::{Error, Result};
use crate::transport::{
    initialize_params, parse_call_result, parse_tools_result, rpc_error_to_tool_error,
    DiscoveredTool, JsonRpcRequest, JsonRpcResponse, ToolOutcome, Transport,
};

/// How long handshake and discovery requests may take.
const CONTROL_TIMEOUT: Duration = Duration::from_secs(30);

type PendingMap = Arc<Mutex<HashMap<i64, oneshot::Sender<JsonRpcResponse>>>>;

/// Line-framed JSON-RPC transport over a spawned subprocess.
pub struct StdioTransport {
    server_name: String,
    next_id: AtomicI64,
    pending: PendingMap,
    stdin: tokio::sync::Mutex<ChildStdin>,
    child: Mutex<Option<Child>>,
    closed: Arc<AtomicBool>,
}

impl StdioTransport {
    /// Spawn the server process and start the background readers.
    pub fn spawn(
        server_name: impl Into<String>,
        command: &str,
        args: &[String],
        env: &HashMap<String, String>,
    ) -> Result<Self> {
        let server_name = server_name.into();

        let mut child = Command::new(command)
            .args(args)
            .envs(env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::ConnectionLost {
                server: server_name.clone(),
                reason: format!("failed to spawn '{command}': {e}"),
            })?;

        let stdin = child.stdin.take().ok_or_else(|| Error::ConnectionLost {
            server: server_name.clone(),
            reason: "no stdin handle".to_string(),
        })?;
        let stdout = child.stdout.take().ok_or_else(|| Error::ConnectionLost {
            server: server_name.clone(),
            reason: "no stdout handle".to_string(),
        })?;
        let stderr = child.stderr.take().ok_or_else(|| Error::ConnectionLost {
            server: server_name.clone(),
            reason: "no stderr handle".to_string(),
        })?;

        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let closed = Arc::new(AtomicBool::new(false));

        // Background stdout reader: one JSON-RPC response per line.
        {
            let pending = Arc::clone(&pending);
            let server = server_name.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                loop {
                    match lines.next_line().await {
                        Ok(Some(line)) if line.trim().is_empty() => {}
                        Ok(Some(line)) => match serde_json::from_str::<JsonRpcResponse>(&line) {
                            Ok(response) => {
                                let sender = response.id.and_then(|id| {
                                    pending
                                        .lock()
                                        .unwrap_or_else(|e| e.into_inner())
                                        .remove(&id)
                                });
                                match sender {
                                    Some(sender) => {
                                        let _ = sender.send(response);
                                    }
                                    None => {
                                        tracing::debug!(
                                            server = %server,
                                            "response without a pending request"
                                        );
                                    }
                                }
                            }
                            Err(e) => {
                                tracing::warn!(
                                    server = %server,
                                    error = %e,
                                    "failed to decode server output line"
                                );
                            }
                        },
                        Ok(None) | Err(_) => break,
                    }
                }
                // Process exited: fail everything still in flight.
                let drained: Vec<_> = pending
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .drain()
                    .collect();
                if !drained.is_empty() {
                    tracing::warn!(
                        server = %server,
                        pending = drained.len(),
                        "server exited with requests in flight"
                    );
                }
                tracing::info!(server = %server, "stdio reader exited");
            });
        }

        // Background stderr reader: forward at warning severity.
        {
            let server = server_name.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if !line.trim().is_empty() {
                        tracing::warn!(server = %server, "{line}");
                    }
                }
            });
        }

        Ok(Self {
            server_name,
            next_id: AtomicI64::new(1),
            pending,
            stdin: tokio::sync::Mutex::new(stdin),
            child: Mutex::new(Some(child)),
            closed,
        })
    }

    async fn write_line(&self, request: &JsonRpcRequest) -> Result<()> {
        let mut line = serde_json::to_string(request)?;
        line.push('\n');
        let mut stdin = self.stdin.lock().await;
        stdin
            .write_all(line.as_bytes())
            .await
            .map_err(|e| Error::ConnectionLost {
                server: self.server_name.clone(),
                reason: format!("stdin write failed: {e}"),
            })?;
        stdin.flush().await.map_err(|e| Error::ConnectionLost {
            server: self.server_name.clone(),
            reason: format!("stdin flush failed: {e}"),
        })
    }

    async fn send_request(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<JsonRpcResponse> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let mut request = JsonRpcRequest::new(method, id);
        request.params = params;

        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, tx);

        if let Err(e) = self.write_line(&request).await {
            self.pending
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(&id);
            return Err(e);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => {
                // Sender dropped: the reader drained the pending map.
                if self.closed.load(Ordering::SeqCst) {
                    Err(Error::Cancelled)
                } else {
                    Err(Error::ConnectionLost {
                        server: self.server_name.clone(),
                        reason: "server closed the connection".to_string(),
                    })
                }
            }
            Err(_) => {
                self.pending
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .remove(&id);
                Err(Error::ToolTimeout {
                    server: self.server_name.clone(),
                    tool: method.to_string(),
                    timeout,
                })
            }
        }
    }

    async fn send_notification(&self, method: &str) -> Result<()> {
        self.write_line(&JsonRpcRequest::notification(method)).await
    }

    fn expect_ok(&self, method: &str, response: JsonRpcResponse) -> Result<Option<Value>> {
        if let Some(error) = response.error {
            return Err(Error::Protocol {
                server: self.server_name.clone(),
                reason: format!("{method} failed: {} ({})", error.message, error.code),
            });
        }
        Ok(response.result)
    }
}

#[async_trait]
impl Transport for StdioTransport {
    async fn initialize(&self) -> Result<()> {
        let response = self
            .send_request("initialize", Some(initialize_params()), CONTROL_TIMEOUT)
            .await?;
        self.expect_ok("initialize", response)?;
        self.send_notification("notifications/initialized").await?;
        tracing::debug!(server = %self.server_name, "stdio transport initialized");
        Ok(())
    }

    async fn list_tools(&self) -> Result<Vec<DiscoveredTool>> {
        let response = self
            .send_request("tools/list", None, CONTROL_TIMEOUT)
            .await?;
        let result = self.expect_ok("tools/list", response)?;
        parse_tools_result(&self.server_name, result)
    }

    async fn call_tool(
        &self,
        name: &str,
        arguments: &Map<String, Value>,
        timeout: Duration,
    ) -> Result<ToolOutcome> {
        let params = json!({"name": name, "arguments": Value::Object(arguments.clone())});
        let response = self
            .send_request("tools/call", Some(params), timeout)
            .await
            .map_err(|e| match e {
                // Attribute the timeout to the tool, not the RPC method.
                Error::ToolTimeout { server, timeout, .. } => Error::ToolTimeout {
                    server,
                    tool: name.to_string(),
                    timeout,
                },
                other => other,
            })?;

        if let Some(error) = &response.error {
            return Err(rpc_error_to_tool_error(&self.server_name, name, 1, error));
        }
        parse_call_result(&self.server_name, response.result)
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        // Pending futures resolve with a cancellation error.
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
        let child = self
            .child
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(mut child) = child {
            if let Err(e) = child.start_kill() {
                tracing::debug!(server = %self.server_name, error = %e, "kill on close");
            }
        }
        Ok(())
    }

    fn server_name(&self) -> &str {
        &self.server_name
    }
}

impl std::fmt::Debug for StdioTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StdioTransport")
            .field("server_name", &self.server_name)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A tiny in-process tool server written in shell: reads JSON-RPC lines
    /// and answers `initialize`, `tools/list`, and `tools/call` for an echo
    /// tool. Enough to exercise framing and id correlation end to end.
    fn echo_server_script() -> String {
        r#"
while IFS= read -r line; do
  id=$(printf '%s' "$line" | sed -n 's/.*"id":\([0-9]*\).*/\1/p')
  case "$line" in
    *notifications/*)
      : ;;
    *initialize*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"protocolVersion":"2024-11-05"}}\n' "$id" ;;
    *tools/list*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"tools":[{"name":"echo","description":"echoes","inputSchema":{"type":"object"}}]}}\n' "$id" ;;
    *tools/call*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"content":[{"type":"text","text":"pong"}]}}\n' "$id" ;;
  esac
done
"#
        .to_string()
    }

    fn spawn_echo() -> StdioTransport {
        StdioTransport::spawn(
            "echo-server",
            "sh",
            &["-c".to_string(), echo_server_script()],
            &HashMap::new(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn handshake_and_discovery() {
        let transport = spawn_echo();
        transport.initialize().await.unwrap();
        let tools = transport.list_tools().await.unwrap();
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].name, "echo");
        transport.close().await.unwrap();
    }

    #[tokio::test]
    async fn call_tool_round_trips() {
        let transport = spawn_echo();
        transport.initialize().await.unwrap();
        let outcome = transport
            .call_tool("echo", &Map::new(), Duration::from_secs(5))
            .await
            .unwrap();
        assert!(!outcome.is_error);
        assert_eq!(outcome.text(), "pong");
        transport.close().await.unwrap();
    }

    #[tokio::test]
    async fn requests_use_increasing_ids() {
        let transport = spawn_echo();
        transport.initialize().await.unwrap();
        // Two sequential calls must both resolve; correlation by id.
        for _ in 0..2 {
            let outcome = transport
                .call_tool("echo", &Map::new(), Duration::from_secs(5))
                .await
                .unwrap();
            assert_eq!(outcome.text(), "pong");
        }
        transport.close().await.unwrap();
    }

    #[tokio::test]
    async fn server_exit_fails_pending_requests() {
        // A server that reads one line and exits without answering.
        let transport = StdioTransport::spawn(
            "mute-server",
            "sh",
            &["-c".to_string(), "read -r _line; exit 0".to_string()],
            &HashMap::new(),
        )
        .unwrap();

        let err = transport
            .call_tool("echo", &Map::new(), Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ConnectionLost { .. }), "got {err:?}");
    }

    #[tokio::test]
    async fn slow_server_times_out() {
        let transport = StdioTransport::spawn(
            "slow-server",
            "sh",
            &["-c".to_string(), "sleep 30".to_string()],
            &HashMap::new(),
        )
        .unwrap();

        let err = transport
            .call_tool("echo", &Map::new(), Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ToolTimeout { .. }), "got {err:?}");
        transport.close().await.unwrap();
    }
}
