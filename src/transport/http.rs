// JSON-RPC over HTTP POST (streamable HTTP, JSON or single-response SSE bodies)

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{ACCEPT, CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue};
use serde_json::Value;

use super::{JsonRpcRequest, JsonRpcResponse, Transport};
use crate::error::{DoctorError, Result};
use crate::models::HttpTarget;

const SESSION_HEADER: &str = "mcp-session-id";

/// JSON-RPC error code used for HTTP-level rejections (4xx)
const HTTP_REJECTION_CODE: i64 = -32001;

pub struct HttpTransport {
    server: String,
    url: reqwest::Url,
    headers: HeaderMap,
    client: reqwest::Client,
    session_id: parking_lot::Mutex<Option<String>>,
    next_id: AtomicU64,
    connected: AtomicBool,
}

impl HttpTransport {
    pub fn new(server: &str, target: &HttpTarget, connect_timeout: Duration) -> Result<Self> {
        let url = reqwest::Url::parse(&target.url)
            .map_err(|e| DoctorError::connection(server, format!("invalid URL '{}': {}", target.url, e)))?;

        let mut headers = HeaderMap::new();
        for (name, value) in &target.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| DoctorError::Validation(format!("header name '{name}': {e}")))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| DoctorError::Validation(format!("header value for '{name}': {e}")))?;
            headers.insert(name, value);
        }

        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .build()
            .map_err(|e| DoctorError::connection(server, format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            server: server.to_string(),
            url,
            headers,
            client,
            session_id: parking_lot::Mutex::new(None),
            next_id: AtomicU64::new(1),
            connected: AtomicBool::new(true),
        })
    }

    async fn post(&self, body: &JsonRpcRequest) -> Result<reqwest::Response> {
        let mut request = self
            .client
            .post(self.url.clone())
            .headers(self.headers.clone())
            .header(ACCEPT, "application/json, text/event-stream")
            .json(body);
        if let Some(session) = self.session_id.lock().clone() {
            request = request.header(SESSION_HEADER, session);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_connect() {
                self.connected.store(false, Ordering::SeqCst);
            }
            DoctorError::from(e)
        })?;

        if let Some(session) = response
            .headers()
            .get(SESSION_HEADER)
            .and_then(|v| v.to_str().ok())
        {
            *self.session_id.lock() = Some(session.to_string());
        }
        Ok(response)
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn request(&self, method: &str, params: Option<Value>) -> Result<JsonRpcResponse> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let response = self.post(&JsonRpcRequest::new(id, method, params)).await?;
        let status = response.status();

        if status.is_client_error() {
            let reason = status.canonical_reason().unwrap_or("client error");
            return Ok(JsonRpcResponse::error(
                id,
                HTTP_REJECTION_CODE,
                format!("HTTP {}: {}", status.as_u16(), reason),
            ));
        }
        if !status.is_success() {
            return Err(DoctorError::Transport(format!(
                "'{}' answered HTTP {}",
                self.server, status
            )));
        }

        let is_sse = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|ct| ct.starts_with("text/event-stream"));
        let body = response.text().await.map_err(DoctorError::from)?;

        let parsed = if is_sse {
            parse_sse_data(&body)
                .into_iter()
                .filter_map(|data| serde_json::from_str::<JsonRpcResponse>(&data).ok())
                .find(|r| r.id.as_ref().and_then(Value::as_u64) == Some(id))
                .ok_or_else(|| {
                    DoctorError::ProtocolViolation(format!("no response for request {id} in event stream"))
                })?
        } else {
            serde_json::from_str::<JsonRpcResponse>(&body)
                .map_err(|e| DoctorError::ProtocolViolation(format!("malformed response: {e}")))?
        };

        if parsed.id.as_ref().and_then(Value::as_u64) != Some(id) {
            return Err(DoctorError::ProtocolViolation(format!(
                "response id {:?} does not match request {}",
                parsed.id, id
            )));
        }
        Ok(parsed)
    }

    async fn notify(&self, method: &str, params: Option<Value>) -> Result<()> {
        let response = self
            .post(&JsonRpcRequest::notification(method, params))
            .await?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(DoctorError::Transport(format!(
                "notification {} answered HTTP {}",
                method,
                response.status()
            )))
        }
    }

    async fn close(&self, _grace: Duration) -> Result<()> {
        if !self.connected.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        let session = self.session_id.lock().take();
        if let Some(session) = session {
            let result = self
                .client
                .delete(self.url.clone())
                .headers(self.headers.clone())
                .header(SESSION_HEADER, session)
                .send()
                .await;
            if let Err(e) = result {
                tracing::debug!(server = %self.server, "Session DELETE failed: {}", e);
            }
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

/// `data:` payloads of each event in an SSE body.
fn parse_sse_data(body: &str) -> Vec<String> {
    let normalized = body.replace("\r\n", "\n");
    normalized
        .split("\n\n")
        .filter_map(|event| {
            let data: Vec<&str> = event
                .lines()
                .filter_map(|line| line.strip_prefix("data:"))
                .map(|value| value.strip_prefix(' ').unwrap_or(value))
                .collect();
            (!data.is_empty()).then(|| data.join("\n"))
        })
        .collect()
}
