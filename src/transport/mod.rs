// ============================================
// Session Transport
// ============================================
//
// A Session is one live MCP connection: handshake, capability advertisement,
// discovered catalog, and a gate that serializes (or bounds) in-flight
// requests. Wire framing lives behind the `Transport` trait.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::sync::Semaphore;
use tokio::time::Instant;
use uuid::Uuid;

use crate::error::{DoctorError, Result};
use crate::models::{Fault, RawOutcome, Target, TargetTransport};
use crate::utils::truncate;

pub mod http;
pub mod stdio;

pub use http::HttpTransport;
pub use stdio::StdioTransport;

// ============================================
// Protocol Constants
// ============================================

pub const PROTOCOL_VERSION: &str = "2024-11-05";

/// In-flight requests allowed when a server advertises pipelining without a depth
const DEFAULT_PIPELINE_DEPTH: usize = 8;

const MAX_PIPELINE_DEPTH: usize = 64;

/// Upper bound on list pagination during discovery
const MAX_DISCOVERY_PAGES: usize = 10;

// ============================================
// JSON-RPC Messages
// ============================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcRequest {
    pub fn new(id: u64, method: &str, params: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id: Some(id),
            method: method.to_string(),
            params,
        }
    }

    pub fn notification(method: &str, params: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id: None,
            method: method.to_string(),
            params,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    #[serde(default)]
    pub jsonrpc: String,
    #[serde(default)]
    pub id: Option<Value>,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<JsonRpcError>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl JsonRpcResponse {
    pub fn result(id: u64, result: Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id: Some(json!(id)),
            result: Some(result),
            error: None,
        }
    }

    pub fn error(id: u64, code: i64, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id: Some(json!(id)),
            result: None,
            error: Some(JsonRpcError {
                code,
                message: message.into(),
                data: None,
            }),
        }
    }

    /// The result value, or the error as a `DoctorError`.
    pub fn into_result(self) -> Result<Value> {
        if let Some(err) = self.error {
            return Err(DoctorError::ProtocolViolation(format!(
                "{} (code {})",
                err.message, err.code
            )));
        }
        self.result.ok_or_else(|| {
            DoctorError::ProtocolViolation("response carried neither result nor error".into())
        })
    }

    fn into_outcome(self, elapsed: Duration) -> RawOutcome {
        match (self.error, self.result) {
            (Some(err), _) => {
                RawOutcome::rejected(elapsed, format!("{} (code {})", err.message, err.code), err.data)
            }
            (None, Some(result)) => RawOutcome::success(elapsed, result),
            (None, None) => RawOutcome::fault(
                Fault::ProtocolViolation,
                elapsed,
                "response carried neither result nor error",
            ),
        }
    }
}

// ============================================
// Transport Trait
// ============================================

/// Wire-level MCP connection. Implementations assign request ids and match
/// responses; callers see one response per request.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn request(&self, method: &str, params: Option<Value>) -> Result<JsonRpcResponse>;

    async fn notify(&self, method: &str, params: Option<Value>) -> Result<()>;

    /// Close the connection, giving a local server `grace` to exit on its own.
    async fn close(&self, grace: Duration) -> Result<()>;

    fn is_connected(&self) -> bool;

    fn process_id(&self) -> Option<u32> {
        None
    }

    /// Sequence number of the next stderr line.
    fn stderr_mark(&self) -> u64 {
        0
    }

    fn stderr_since(&self, _mark: u64) -> Vec<String> {
        Vec::new()
    }
}

// ============================================
// Capabilities & Discovery
// ============================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Capabilities {
    pub protocol_version: Option<String>,
    pub server_name: Option<String>,
    pub server_version: Option<String>,
    pub tools: bool,
    pub resources: bool,
    pub prompts: bool,
    pub logging: bool,
    /// Requests the server accepts concurrently on one session
    pub max_in_flight: usize,
    pub raw: Value,
}

impl Capabilities {
    pub fn from_initialize(result: &Value) -> Result<Self> {
        let object = result.as_object().ok_or_else(|| {
            DoctorError::ProtocolViolation("initialize result is not an object".into())
        })?;
        let caps = object.get("capabilities").cloned().unwrap_or(Value::Null);
        let server_info = object.get("serverInfo");

        let max_in_flight = match caps.pointer("/experimental/pipelining") {
            Some(Value::Bool(true)) => DEFAULT_PIPELINE_DEPTH,
            Some(Value::Object(settings)) => settings
                .get("maxInFlight")
                .and_then(Value::as_u64)
                .map(|n| (n as usize).clamp(1, MAX_PIPELINE_DEPTH))
                .unwrap_or(DEFAULT_PIPELINE_DEPTH),
            _ => 1,
        };

        Ok(Self {
            protocol_version: object
                .get("protocolVersion")
                .and_then(Value::as_str)
                .map(str::to_string),
            server_name: server_info
                .and_then(|info| info.get("name"))
                .and_then(Value::as_str)
                .map(str::to_string),
            server_version: server_info
                .and_then(|info| info.get("version"))
                .and_then(Value::as_str)
                .map(str::to_string),
            tools: caps.get("tools").is_some(),
            resources: caps.get("resources").is_some(),
            prompts: caps.get("prompts").is_some(),
            logging: caps.get("logging").is_some(),
            max_in_flight,
            raw: result.clone(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolInfo {
    pub name: String,
    pub description: Option<String>,
    pub input_schema: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceInfo {
    pub uri: String,
    pub name: Option<String>,
    pub mime_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptInfo {
    pub name: String,
    pub description: Option<String>,
    pub required_arguments: Vec<String>,
}

/// What the server listed right after the handshake.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Discovery {
    pub tools: Vec<ToolInfo>,
    pub resources: Vec<ResourceInfo>,
    pub prompts: Vec<PromptInfo>,
    /// Listing failures, kept for the discovery probes
    pub errors: Vec<String>,
}

impl Discovery {
    pub fn tool(&self, name: &str) -> Option<&ToolInfo> {
        self.tools.iter().find(|t| t.name == name)
    }
}

fn parse_tool(value: &Value) -> Option<ToolInfo> {
    Some(ToolInfo {
        name: value.get("name")?.as_str()?.to_string(),
        description: value
            .get("description")
            .and_then(Value::as_str)
            .map(str::to_string),
        input_schema: value
            .get("inputSchema")
            .cloned()
            .unwrap_or_else(|| json!({"type": "object"})),
    })
}

fn parse_resource(value: &Value) -> Option<ResourceInfo> {
    Some(ResourceInfo {
        uri: value.get("uri")?.as_str()?.to_string(),
        name: value.get("name").and_then(Value::as_str).map(str::to_string),
        mime_type: value
            .get("mimeType")
            .and_then(Value::as_str)
            .map(str::to_string),
    })
}

fn parse_prompt(value: &Value) -> Option<PromptInfo> {
    let required_arguments = value
        .get("arguments")
        .and_then(Value::as_array)
        .map(|args| {
            args.iter()
                .filter(|arg| arg.get("required").and_then(Value::as_bool).unwrap_or(false))
                .filter_map(|arg| arg.get("name").and_then(Value::as_str))
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();
    Some(PromptInfo {
        name: value.get("name")?.as_str()?.to_string(),
        description: value
            .get("description")
            .and_then(Value::as_str)
            .map(str::to_string),
        required_arguments,
    })
}

// ============================================
// Session
// ============================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Connecting,
    Ready,
    Degraded,
    Closed,
}

impl SessionStatus {
    fn can_become(self, next: SessionStatus) -> bool {
        use SessionStatus::*;
        matches!(
            (self, next),
            (Connecting, Ready)
                | (Connecting, Closed)
                | (Ready, Degraded)
                | (Ready, Closed)
                | (Degraded, Ready)
                | (Degraded, Closed)
        )
    }
}

pub struct Session {
    id: Uuid,
    server: String,
    transport: Arc<dyn Transport>,
    capabilities: Capabilities,
    discovery: RwLock<Discovery>,
    status: Mutex<SessionStatus>,
    gate: Semaphore,
    grace: Duration,
    handshake_latency: Duration,
    created_at: DateTime<Utc>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("server", &self.server)
            .field("status", &self.status())
            .field("max_in_flight", &self.capabilities.max_in_flight)
            .finish()
    }
}

impl Session {
    /// Spawn or connect to `target` and run the handshake.
    pub async fn open(target: &Target, timeout: Duration, grace: Duration) -> Result<Session> {
        let transport: Arc<dyn Transport> = match &target.transport {
            TargetTransport::Stdio(stdio) => Arc::new(StdioTransport::spawn(&target.name, stdio)?),
            TargetTransport::Http(http) => {
                Arc::new(HttpTransport::new(&target.name, http, timeout)?)
            }
        };
        Session::establish(&target.name, transport, timeout, grace).await
    }

    /// Run the MCP handshake over an already connected transport.
    pub async fn establish(
        server: &str,
        transport: Arc<dyn Transport>,
        timeout: Duration,
        grace: Duration,
    ) -> Result<Session> {
        let started = Instant::now();
        let handshake = async {
            let params = json!({
                "protocolVersion": PROTOCOL_VERSION,
                "capabilities": {},
                "clientInfo": {
                    "name": "mcp-doctor",
                    "version": env!("CARGO_PKG_VERSION"),
                },
            });
            let result = transport
                .request("initialize", Some(params))
                .await?
                .into_result()?;
            let capabilities = Capabilities::from_initialize(&result)?;
            transport.notify("notifications/initialized", None).await?;
            let handshake_latency = started.elapsed();
            let discovery = discover(transport.as_ref(), &capabilities).await;
            Ok::<_, DoctorError>((capabilities, discovery, handshake_latency))
        };

        let outcome = tokio::time::timeout(timeout, handshake).await;
        let (capabilities, discovery, handshake_latency) = match outcome {
            Ok(Ok(established)) => established,
            Ok(Err(err)) => {
                let stderr = transport.stderr_since(0);
                let _ = transport.close(Duration::ZERO).await;
                return Err(DoctorError::connection(server, describe_failure(&err, &stderr)));
            }
            Err(_) => {
                let stderr = transport.stderr_since(0);
                let _ = transport.close(Duration::ZERO).await;
                let message = format!(
                    "no capability advertisement within {}ms",
                    timeout.as_millis()
                );
                return Err(DoctorError::connection(
                    server,
                    describe_failure(&DoctorError::Transport(message), &stderr),
                ));
            }
        };

        tracing::info!(
            server = %server,
            protocol = capabilities.protocol_version.as_deref().unwrap_or("unknown"),
            tools = discovery.tools.len(),
            resources = discovery.resources.len(),
            prompts = discovery.prompts.len(),
            max_in_flight = capabilities.max_in_flight,
            "Session established in {}ms",
            handshake_latency.as_millis()
        );

        let permits = capabilities.max_in_flight.max(1);
        Ok(Session {
            id: Uuid::new_v4(),
            server: server.to_string(),
            transport,
            capabilities,
            discovery: RwLock::new(discovery),
            status: Mutex::new(SessionStatus::Ready),
            gate: Semaphore::new(permits),
            grace,
            handshake_latency,
            created_at: Utc::now(),
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn server(&self) -> &str {
        &self.server
    }

    pub fn capabilities(&self) -> &Capabilities {
        &self.capabilities
    }

    pub fn discovery(&self) -> Discovery {
        self.discovery.read().clone()
    }

    pub fn status(&self) -> SessionStatus {
        *self.status.lock()
    }

    pub fn handshake_latency(&self) -> Duration {
        self.handshake_latency
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn process_id(&self) -> Option<u32> {
        self.transport.process_id()
    }

    pub fn is_connected(&self) -> bool {
        self.status() != SessionStatus::Closed && self.transport.is_connected()
    }

    pub fn supports_pipelining(&self) -> bool {
        self.capabilities.max_in_flight > 1
    }

    /// Most recent stderr lines of a local server.
    pub fn stderr_tail(&self) -> Vec<String> {
        self.transport.stderr_since(0)
    }

    fn transition(&self, next: SessionStatus) -> bool {
        let mut status = self.status.lock();
        if status.can_become(next) {
            tracing::debug!(server = %self.server, from = ?*status, to = ?next, "Session status change");
            *status = next;
            true
        } else {
            false
        }
    }

    pub fn mark_degraded(&self) -> bool {
        self.transition(SessionStatus::Degraded)
    }

    /// Back to Ready after a successful re-validation.
    pub fn mark_ready(&self) -> bool {
        self.transition(SessionStatus::Ready)
    }

    /// Issue one request and turn the response into an unscored outcome.
    /// Never returns an error: timeouts, crashes and violations become faults.
    pub async fn invoke(&self, method: &str, params: Option<Value>, timeout: Duration) -> RawOutcome {
        let started = Instant::now();
        if self.status() == SessionStatus::Closed {
            return RawOutcome::fault(Fault::Crash, Duration::ZERO, "session is closed");
        }

        let mark = self.transport.stderr_mark();
        let gate = &self.gate;
        let transport = &self.transport;
        let call = async move {
            let _permit = gate
                .acquire()
                .await
                .map_err(|_| DoctorError::Transport("session is closed".into()))?;
            transport.request(method, params).await
        };

        let result = tokio::time::timeout(timeout, call).await;
        let elapsed = started.elapsed();
        let mut outcome = match result {
            Err(_) => {
                self.mark_degraded();
                RawOutcome::timed_out(elapsed, timeout)
            }
            Ok(Err(DoctorError::ProtocolViolation(message))) => {
                self.mark_degraded();
                RawOutcome::fault(Fault::ProtocolViolation, elapsed, message)
            }
            Ok(Err(err)) => {
                self.mark_degraded();
                RawOutcome::fault(Fault::Crash, elapsed, err.to_string())
            }
            Ok(Ok(response)) => response.into_outcome(elapsed),
        };
        outcome.stderr = self.transport.stderr_since(mark);
        outcome
    }

    /// Drop the cached catalog and list everything again.
    pub async fn refresh_discovery(&self, timeout: Duration) -> Result<Discovery> {
        let discovery = tokio::time::timeout(
            timeout,
            discover(self.transport.as_ref(), &self.capabilities),
        )
        .await
        .map_err(|_| DoctorError::Timeout(timeout))?;
        *self.discovery.write() = discovery.clone();
        Ok(discovery)
    }

    /// Graceful close. Safe to call more than once.
    pub async fn close(&self) {
        self.shutdown(self.grace).await;
    }

    /// Close without waiting for the server to exit.
    pub async fn terminate(&self) {
        self.shutdown(Duration::ZERO).await;
    }

    async fn shutdown(&self, grace: Duration) {
        let previous = {
            let mut status = self.status.lock();
            std::mem::replace(&mut *status, SessionStatus::Closed)
        };
        if previous == SessionStatus::Closed {
            return;
        }
        self.gate.close();
        if let Err(e) = self.transport.close(grace).await {
            tracing::warn!(server = %self.server, "Session close failed: {}", e);
        }
        tracing::debug!(server = %self.server, session = %self.id, "Session closed");
    }
}

fn describe_failure(err: &DoctorError, stderr: &[String]) -> String {
    let reason = match err {
        DoctorError::Transport(message) | DoctorError::ProtocolViolation(message) => message.clone(),
        other => other.to_string(),
    };
    if stderr.is_empty() {
        return reason;
    }
    let tail = stderr[stderr.len().saturating_sub(5)..].join(" | ");
    format!("{reason}; stderr: {}", truncate(&tail, 500))
}

async fn discover(transport: &dyn Transport, capabilities: &Capabilities) -> Discovery {
    let mut discovery = Discovery::default();
    if capabilities.tools {
        match list_all(transport, "tools/list", "tools").await {
            Ok(items) => discovery.tools = items.iter().filter_map(parse_tool).collect(),
            Err(e) => discovery.errors.push(format!("tools/list: {e}")),
        }
    }
    if capabilities.resources {
        match list_all(transport, "resources/list", "resources").await {
            Ok(items) => discovery.resources = items.iter().filter_map(parse_resource).collect(),
            Err(e) => discovery.errors.push(format!("resources/list: {e}")),
        }
    }
    if capabilities.prompts {
        match list_all(transport, "prompts/list", "prompts").await {
            Ok(items) => discovery.prompts = items.iter().filter_map(parse_prompt).collect(),
            Err(e) => discovery.errors.push(format!("prompts/list: {e}")),
        }
    }
    discovery
}

/// Follow `nextCursor` pagination of a list method.
async fn list_all(transport: &dyn Transport, method: &str, field: &str) -> Result<Vec<Value>> {
    let mut items = Vec::new();
    let mut cursor: Option<String> = None;
    for _ in 0..MAX_DISCOVERY_PAGES {
        let params = cursor.as_ref().map(|c| json!({ "cursor": c }));
        let result = transport.request(method, params).await?.into_result()?;
        let page = result
            .get(field)
            .and_then(Value::as_array)
            .ok_or_else(|| DoctorError::ProtocolViolation(format!("{method} result has no '{field}' array")))?;
        items.extend(page.iter().cloned());
        cursor = result
            .get("nextCursor")
            .and_then(Value::as_str)
            .map(str::to_string);
        if cursor.is_none() {
            break;
        }
    }
    Ok(items)
}

// ============================================
// Session Factory
// ============================================

/// Opens sessions for the orchestrator and probes that need their own connection.
#[async_trait]
pub trait SessionFactory: Send + Sync {
    async fn open(&self, target: &Target, timeout: Duration) -> Result<Session>;
}

/// Opens real stdio or HTTP sessions.
#[derive(Debug, Clone)]
pub struct TransportFactory {
    grace: Duration,
}

impl TransportFactory {
    pub fn new(grace: Duration) -> Self {
        Self { grace }
    }
}

#[async_trait]
impl SessionFactory for TransportFactory {
    async fn open(&self, target: &Target, timeout: Duration) -> Result<Session> {
        Session::open(target, timeout, self.grace).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capabilities_parse() {
        let caps = Capabilities::from_initialize(&json!({
            "protocolVersion": "2024-11-05",
            "capabilities": {"tools": {"listChanged": true}, "logging": {}},
            "serverInfo": {"name": "weather", "version": "1.2.0"}
        }))
        .unwrap();
        assert_eq!(caps.protocol_version.as_deref(), Some("2024-11-05"));
        assert_eq!(caps.server_name.as_deref(), Some("weather"));
        assert!(caps.tools && caps.logging);
        assert!(!caps.resources && !caps.prompts);
        assert_eq!(caps.max_in_flight, 1);
    }

    #[test]
    fn test_pipelining_capability() {
        let flag = Capabilities::from_initialize(&json!({
            "capabilities": {"experimental": {"pipelining": true}}
        }))
        .unwrap();
        assert_eq!(flag.max_in_flight, DEFAULT_PIPELINE_DEPTH);

        let bounded = Capabilities::from_initialize(&json!({
            "capabilities": {"experimental": {"pipelining": {"maxInFlight": 1000}}}
        }))
        .unwrap();
        assert_eq!(bounded.max_in_flight, MAX_PIPELINE_DEPTH);
    }

    #[test]
    fn test_initialize_result_must_be_object() {
        assert!(Capabilities::from_initialize(&json!("ok")).is_err());
    }

    #[test]
    fn test_status_transitions() {
        use SessionStatus::*;
        assert!(Connecting.can_become(Ready));
        assert!(Ready.can_become(Degraded));
        assert!(Degraded.can_become(Ready));
        assert!(!Closed.can_become(Ready));
        assert!(!Connecting.can_become(Degraded));
    }

    #[test]
    fn test_response_outcomes() {
        let ok = JsonRpcResponse::result(1, json!({"tools": []}))
            .into_outcome(Duration::from_millis(5));
        assert!(ok.success);

        let rejected = JsonRpcResponse::error(2, -32602, "invalid params")
            .into_outcome(Duration::from_millis(5));
        assert!(!rejected.success);
        assert!(rejected.fault.is_none());
        assert_eq!(rejected.error_text.as_deref(), Some("invalid params (code -32602)"));

        let empty = JsonRpcResponse {
            jsonrpc: "2.0".into(),
            id: Some(json!(3)),
            result: None,
            error: None,
        }
        .into_outcome(Duration::ZERO);
        assert_eq!(empty.fault, Some(Fault::ProtocolViolation));
    }

    #[test]
    fn test_prompt_required_arguments() {
        let prompt = parse_prompt(&json!({
            "name": "summarize",
            "arguments": [
                {"name": "text", "required": true},
                {"name": "style"}
            ]
        }))
        .unwrap();
        assert_eq!(prompt.required_arguments, vec!["text"]);
    }
}
