// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Event-stream transport: server-sent events in, HTTP POST out.
//!
//! The transport holds one long-lived GET connection delivering server-sent
//! events. The server's first `endpoint` event names the companion URL that
//! requests are POSTed to; responses come back as `message` events whose
//! payloads are JSON-RPC responses matched to pending requests by id.
//! `ping` events are ignored. A background task owns the stream and, on
//! connection loss, reconnects with bounded exponential backoff and
//! re-issues only the requests that have not yet been matched. After 20
//! seconds without any event it probes the endpoint with a notification;
//! a failed probe tears the connection down and enters the reconnect path.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT};
use serde_json::{json, Map, Value};
use tokio::sync::{oneshot, watch};
use tokio_util::sync::CancellationToken;

use crate::constants::{
    SSE_ENDPOINT_WAIT, SSE_KEEPALIVE_IDLE, SSE_RECONNECT_BASE, SSE_RECONNECT_CAP,
};
use crate::error::{Error, Result};
use crate::transport::{
    initialize_params, parse_call_result, parse_tools_result, rpc_error_to_tool_error,
    DiscoveredTool, JsonRpcRequest, JsonRpcResponse, ToolOutcome, Transport,
};

/// One parsed server-sent event.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct SseEvent {
    /// Event name; `message` when the server sent none.
    pub name: String,
    /// Joined data lines.
    pub data: String,
}

/// Incremental server-sent-event parser.
///
/// Feed it lines (without trailing newlines); a blank line completes the
/// buffered event. Comment lines (leading `:`) are dropped per the SSE spec.
#[derive(Debug, Default)]
pub(crate) struct SseParser {
    event: Option<String>,
    data: Vec<String>,
}

impl SseParser {
    pub(crate) fn push_line(&mut self, line: &str) -> Option<SseEvent> {
        if line.is_empty() {
            if self.data.is_empty() && self.event.is_none() {
                return None;
            }
            let event = SseEvent {
                name: self.event.take().unwrap_or_else(|| "message".to_string()),
                data: std::mem::take(&mut self.data).join("\n"),
            };
            return Some(event);
        }
        if line.starts_with(':') {
            return None;
        }
        if let Some(value) = line.strip_prefix("event:") {
            self.event = Some(value.trim_start().to_string());
        } else if let Some(value) = line.strip_prefix("data:") {
            self.data.push(value.trim_start().to_string());
        }
        // Unknown fields (id:, retry:) are ignored.
        None
    }
}

/// Resolve the `endpoint` event payload against the stream URL.
pub(crate) fn resolve_endpoint(stream_url: &str, data: &str) -> Result<String> {
    if data.starts_with("http://") || data.starts_with("https://") {
        return Ok(data.to_string());
    }
    let base = reqwest::Url::parse(stream_url).map_err(|e| Error::Protocol {
        server: stream_url.to_string(),
        reason: format!("invalid stream URL: {e}"),
    })?;
    let joined = base.join(data).map_err(|e| Error::Protocol {
        server: stream_url.to_string(),
        reason: format!("invalid endpoint '{data}': {e}"),
    })?;
    Ok(joined.to_string())
}

struct PendingEntry {
    request: JsonRpcRequest,
    tx: oneshot::Sender<JsonRpcResponse>,
}

type PendingMap = Arc<Mutex<HashMap<i64, PendingEntry>>>;

/// Server-sent-events transport.
pub struct SseTransport {
    server_name: String,
    next_id: AtomicI64,
    client: reqwest::Client,
    headers: HeaderMap,
    pending: PendingMap,
    endpoint_rx: watch::Receiver<Option<String>>,
    cancel: CancellationToken,
}

impl SseTransport {
    /// Open the event stream and start the background reader.
    pub fn connect(
        server_name: impl Into<String>,
        stream_url: impl Into<String>,
        headers: &HashMap<String, String>,
    ) -> Result<Self> {
        let server_name = server_name.into();
        let stream_url = stream_url.into();

        let mut header_map = HeaderMap::new();
        for (key, value) in headers {
            let name = HeaderName::from_bytes(key.as_bytes()).map_err(|e| Error::Protocol {
                server: server_name.clone(),
                reason: format!("invalid header name '{key}': {e}"),
            })?;
            let value = HeaderValue::from_str(value).map_err(|e| Error::Protocol {
                server: server_name.clone(),
                reason: format!("invalid header value for '{key}': {e}"),
            })?;
            header_map.insert(name, value);
        }

        let client = reqwest::Client::new();
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let (endpoint_tx, endpoint_rx) = watch::channel(None::<String>);
        let cancel = CancellationToken::new();

        tokio::spawn(event_loop(
            server_name.clone(),
            stream_url,
            client.clone(),
            header_map.clone(),
            Arc::clone(&pending),
            endpoint_tx,
            cancel.clone(),
        ));

        Ok(Self {
            server_name,
            next_id: AtomicI64::new(1),
            client,
            headers: header_map,
            pending,
            endpoint_rx,
            cancel,
        })
    }

    async fn endpoint(&self) -> Result<String> {
        let mut rx = self.endpoint_rx.clone();
        let found = tokio::time::timeout(SSE_ENDPOINT_WAIT, rx.wait_for(|e| e.is_some())).await;
        match found {
            Ok(Ok(value)) => Ok(value.clone().unwrap_or_default()),
            _ => Err(Error::ConnectionLost {
                server: self.server_name.clone(),
                reason: "endpoint event not received".to_string(),
            }),
        }
    }

    async fn post(&self, endpoint: &str, request: &JsonRpcRequest) -> Result<()> {
        let response = self
            .client
            .post(endpoint)
            .headers(self.headers.clone())
            .json(request)
            .send()
            .await
            .map_err(|e| Error::ConnectionLost {
                server: self.server_name.clone(),
                reason: format!("POST failed: {e}"),
            })?;
        if !response.status().is_success() {
            return Err(Error::ConnectionLost {
                server: self.server_name.clone(),
                reason: format!("POST rejected with status {}", response.status()),
            });
        }
        Ok(())
    }

    async fn send_request(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<JsonRpcResponse> {
        let endpoint = self.endpoint().await?;

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let mut request = JsonRpcRequest::new(method, id);
        request.params = params;

        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(
                id,
                PendingEntry {
                    request: request.clone(),
                    tx,
                },
            );

        if let Err(e) = self.post(&endpoint, &request).await {
            self.pending
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(&id);
            return Err(e);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => {
                if self.cancel.is_cancelled() {
                    Err(Error::Cancelled)
                } else {
                    Err(Error::ConnectionLost {
                        server: self.server_name.clone(),
                        reason: "event stream closed".to_string(),
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
impl Transport for SseTransport {
    async fn initialize(&self) -> Result<()> {
        let response = self
            .send_request(
                "initialize",
                Some(initialize_params()),
                Duration::from_secs(30),
            )
            .await?;
        self.expect_ok("initialize", response)?;
        let endpoint = self.endpoint().await?;
        self.post(&endpoint, &JsonRpcRequest::notification("notifications/initialized"))
            .await?;
        tracing::debug!(server = %self.server_name, "event-stream transport initialized");
        Ok(())
    }

    async fn list_tools(&self) -> Result<Vec<DiscoveredTool>> {
        let response = self
            .send_request("tools/list", None, Duration::from_secs(30))
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
        self.cancel.cancel();
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
        Ok(())
    }

    fn server_name(&self) -> &str {
        &self.server_name
    }
}

impl std::fmt::Debug for SseTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SseTransport")
            .field("server_name", &self.server_name)
            .finish_non_exhaustive()
    }
}

/// The background stream owner: read events, reconnect on loss, re-issue
/// unmatched requests once a fresh endpoint is known.
#[allow(clippy::too_many_lines)]
async fn event_loop(
    server_name: String,
    stream_url: String,
    client: reqwest::Client,
    headers: HeaderMap,
    pending: PendingMap,
    endpoint_tx: watch::Sender<Option<String>>,
    cancel: CancellationToken,
) {
    let mut backoff = SSE_RECONNECT_BASE;
    let mut first_connection = true;

    loop {
        if cancel.is_cancelled() {
            break;
        }

        let response = client
            .get(&stream_url)
            .headers(headers.clone())
            .header(ACCEPT, "text/event-stream")
            .send()
            .await;

        match response {
            Ok(response) if response.status().is_success() => {
                if !first_connection {
                    tracing::info!(server = %server_name, "event stream reconnected");
                }
                first_connection = false;

                let mut stream = response.bytes_stream();
                let mut parser = SseParser::default();
                let mut buffer = String::new();
                let mut healthy = false;

                'read: loop {
                    let next = tokio::select! {
                        () = cancel.cancelled() => break 'read,
                        next = tokio::time::timeout(SSE_KEEPALIVE_IDLE, stream.next()) => next,
                    };

                    let chunk = match next {
                        Err(_idle) => {
                            // Idle: probe the endpoint so a dead connection
                            // is detected instead of waited on forever.
                            let endpoint = endpoint_tx.borrow().clone();
                            match endpoint {
                                Some(endpoint) => {
                                    let probe = JsonRpcRequest::notification("ping");
                                    let sent = client
                                        .post(&endpoint)
                                        .headers(headers.clone())
                                        .json(&probe)
                                        .send()
                                        .await;
                                    if sent.is_err() {
                                        tracing::warn!(
                                            server = %server_name,
                                            "keepalive probe failed, reconnecting"
                                        );
                                        break 'read;
                                    }
                                }
                                None => break 'read,
                            }
                            continue;
                        }
                        Ok(Some(Ok(bytes))) => bytes,
                        Ok(Some(Err(e))) => {
                            tracing::warn!(server = %server_name, error = %e, "event stream error");
                            break 'read;
                        }
                        Ok(None) => break 'read,
                    };

                    buffer.push_str(&String::from_utf8_lossy(&chunk));
                    while let Some(newline) = buffer.find('\n') {
                        let line = buffer[..newline].trim_end_matches('\r').to_string();
                        buffer.drain(..=newline);
                        let Some(event) = parser.push_line(&line) else {
                            continue;
                        };

                        match event.name.as_str() {
                            "endpoint" => match resolve_endpoint(&stream_url, &event.data) {
                                Ok(endpoint) => {
                                    tracing::debug!(
                                        server = %server_name,
                                        endpoint = %endpoint,
                                        "endpoint discovered"
                                    );
                                    endpoint_tx.send_replace(Some(endpoint.clone()));
                                    healthy = true;
                                    backoff = SSE_RECONNECT_BASE;
                                    reissue_pending(
                                        &server_name,
                                        &client,
                                        &headers,
                                        &endpoint,
                                        &pending,
                                    )
                                    .await;
                                }
                                Err(e) => {
                                    tracing::warn!(server = %server_name, error = %e, "bad endpoint event");
                                }
                            },
                            "message" => match serde_json::from_str::<JsonRpcResponse>(&event.data)
                            {
                                Ok(response) => {
                                    let entry = response.id.and_then(|id| {
                                        pending
                                            .lock()
                                            .unwrap_or_else(|e| e.into_inner())
                                            .remove(&id)
                                    });
                                    if let Some(entry) = entry {
                                        let _ = entry.tx.send(response);
                                    }
                                }
                                Err(e) => {
                                    tracing::warn!(
                                        server = %server_name,
                                        error = %e,
                                        "malformed message event"
                                    );
                                }
                            },
                            "ping" => {}
                            other => {
                                tracing::debug!(server = %server_name, event = other, "ignored event");
                            }
                        }
                    }
                }

                if !healthy {
                    // Connection produced no endpoint; treat as a failure.
                    tracing::warn!(server = %server_name, "event stream closed before endpoint");
                }
            }
            Ok(response) => {
                tracing::warn!(
                    server = %server_name,
                    status = %response.status(),
                    "event stream request rejected"
                );
            }
            Err(e) => {
                tracing::warn!(server = %server_name, error = %e, "event stream connect failed");
            }
        }

        if cancel.is_cancelled() {
            break;
        }
        tokio::select! {
            () = cancel.cancelled() => break,
            () = tokio::time::sleep(backoff) => {}
        }
        backoff = (backoff * 2).min(SSE_RECONNECT_CAP);
    }

    tracing::info!(server = %server_name, "event loop exited");
}

/// Re-POST every request that has not been matched to a response yet.
async fn reissue_pending(
    server_name: &str,
    client: &reqwest::Client,
    headers: &HeaderMap,
    endpoint: &str,
    pending: &PendingMap,
) {
    let requests: Vec<JsonRpcRequest> = pending
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .values()
        .map(|entry| entry.request.clone())
        .collect();

    for request in requests {
        tracing::debug!(
            server = %server_name,
            id = ?request.id,
            method = %request.method,
            "re-issuing unmatched request"
        );
        if let Err(e) = client
            .post(endpoint)
            .headers(headers.clone())
            .json(&request)
            .send()
            .await
        {
            tracing::warn!(server = %server_name, error = %e, "re-issue failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parser_defaults_event_name_to_message() {
        let mut parser = SseParser::default();
        assert!(parser.push_line("data: {\"jsonrpc\":\"2.0\"}").is_none());
        let event = parser.push_line("").unwrap();
        assert_eq!(event.name, "message");
        assert_eq!(event.data, "{\"jsonrpc\":\"2.0\"}");
    }

    #[test]
    fn parser_reads_named_events() {
        let mut parser = SseParser::default();
        parser.push_line("event: endpoint");
        parser.push_line("data: /messages?session=abc");
        let event = parser.push_line("").unwrap();
        assert_eq!(event.name, "endpoint");
        assert_eq!(event.data, "/messages?session=abc");
    }

    #[test]
    fn parser_joins_multi_line_data() {
        let mut parser = SseParser::default();
        parser.push_line("data: line one");
        parser.push_line("data: line two");
        let event = parser.push_line("").unwrap();
        assert_eq!(event.data, "line one\nline two");
    }

    #[test]
    fn parser_skips_comments_and_blank_runs() {
        let mut parser = SseParser::default();
        assert!(parser.push_line(": keepalive comment").is_none());
        assert!(parser.push_line("").is_none());
        parser.push_line("event: ping");
        let event = parser.push_line("").unwrap();
        assert_eq!(event.name, "ping");
        assert_eq!(event.data, "");
    }

    #[test]
    fn endpoint_resolves_relative_paths() {
        let resolved =
            resolve_endpoint("http://localhost:9000/sse", "/messages?session=1").unwrap();
        assert_eq!(resolved, "http://localhost:9000/messages?session=1");
    }

    #[test]
    fn endpoint_passes_absolute_urls_through() {
        let resolved =
            resolve_endpoint("http://localhost:9000/sse", "https://other.example/m").unwrap();
        assert_eq!(resolved, "https://other.example/m");
    }

    // The full request/response cycle against a live SSE server is covered
    // by the mock server in tests/sse_transport.rs.
}
