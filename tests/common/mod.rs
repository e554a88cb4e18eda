#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Value, json};

use mcp_doctor::error::{DoctorError, Result};
use mcp_doctor::models::{ResourceSample, Target};
use mcp_doctor::probes::ResourceSampler;
use mcp_doctor::transport::{JsonRpcResponse, Session, SessionFactory, Transport};

/// What the fake server does with one request.
#[derive(Clone)]
pub enum Reply {
    Ok(Value),
    Err(i64, String),
    /// Never answer
    Hang,
    /// Drop the connection
    Disconnect,
    Panic,
}

pub type ToolHandler = Arc<dyn Fn(&Value) -> Reply + Send + Sync>;

/// Scripted in-process MCP server.
#[derive(Clone)]
pub struct FakeServer {
    pub name: String,
    pub tools: Vec<Value>,
    pub replies: HashMap<String, Reply>,
    pub on_call: ToolHandler,
    pub latency: Duration,
}

impl FakeServer {
    /// Advertises tools only, with one `query` tool taking a string `q`.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            tools: vec![json!({
                "name": "query",
                "description": "Search records",
                "inputSchema": {
                    "type": "object",
                    "properties": {"q": {"type": "string"}},
                    "required": ["q"]
                }
            })],
            replies: HashMap::new(),
            on_call: Arc::new(|_| Reply::Ok(text("ok"))),
            latency: Duration::ZERO,
        }
    }

    pub fn on(mut self, method: &str, reply: Reply) -> Self {
        self.replies.insert(method.to_string(), reply);
        self
    }

    pub fn on_tool_call(mut self, handler: impl Fn(&Value) -> Reply + Send + Sync + 'static) -> Self {
        self.on_call = Arc::new(handler);
        self
    }

    pub fn latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    fn respond(&self, method: &str, params: &Value) -> Reply {
        if let Some(reply) = self.replies.get(method) {
            return reply.clone();
        }
        match method {
            "initialize" => Reply::Ok(json!({
                "protocolVersion": "2024-11-05",
                "capabilities": {"tools": {}},
                "serverInfo": {"name": self.name, "version": "1.0.0"}
            })),
            "tools/list" => Reply::Ok(json!({ "tools": self.tools })),
            "tools/call" => (self.on_call)(params),
            "ping" => Reply::Ok(json!({})),
            _ => Reply::Err(-32601, "Method not found".to_string()),
        }
    }
}

/// A text tool result.
pub fn text(body: &str) -> Value {
    json!({"content": [{"type": "text", "text": body}]})
}

/// An `isError` tool result.
pub fn tool_error(body: &str) -> Value {
    json!({"content": [{"type": "text", "text": body}], "isError": true})
}

/// The `q` argument of a tools/call request.
pub fn query_argument(params: &Value) -> String {
    params
        .pointer("/arguments/q")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

pub struct FakeTransport {
    server: FakeServer,
    next_id: AtomicU64,
    connected: AtomicBool,
    pid: u32,
}

impl FakeTransport {
    pub fn new(server: FakeServer, pid: u32) -> Self {
        Self {
            server,
            next_id: AtomicU64::new(1),
            connected: AtomicBool::new(true),
            pid,
        }
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn request(&self, method: &str, params: Option<Value>) -> Result<JsonRpcResponse> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(DoctorError::Transport("connection closed".into()));
        }
        if !self.server.latency.is_zero() {
            tokio::time::sleep(self.server.latency).await;
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        match self.server.respond(method, params.as_ref().unwrap_or(&Value::Null)) {
            Reply::Ok(result) => Ok(JsonRpcResponse::result(id, result)),
            Reply::Err(code, message) => Ok(JsonRpcResponse::error(id, code, message)),
            Reply::Hang => std::future::pending().await,
            Reply::Disconnect => {
                self.connected.store(false, Ordering::SeqCst);
                Err(DoctorError::Transport("server exited".into()))
            }
            Reply::Panic => panic!("fake handler blew up on {method}"),
        }
    }

    async fn notify(&self, _method: &str, _params: Option<Value>) -> Result<()> {
        Ok(())
    }

    async fn close(&self, _grace: Duration) -> Result<()> {
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn process_id(&self) -> Option<u32> {
        Some(self.pid)
    }
}

/// Opens sessions on fresh fake transports; can be switched to refuse.
pub struct FakeFactory {
    server: FakeServer,
    refuse: AtomicBool,
    next_pid: AtomicU32,
    transports: Mutex<Vec<Arc<FakeTransport>>>,
}

impl FakeFactory {
    pub fn new(server: FakeServer) -> Arc<Self> {
        Arc::new(Self {
            server,
            refuse: AtomicBool::new(false),
            next_pid: AtomicU32::new(10_000),
            transports: Mutex::new(Vec::new()),
        })
    }

    pub fn refuse(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::SeqCst);
    }

    pub fn opened(&self) -> usize {
        self.transports.lock().len()
    }

    pub fn open_transports(&self) -> usize {
        self.transports
            .lock()
            .iter()
            .filter(|t| t.is_connected())
            .count()
    }
}

#[async_trait]
impl SessionFactory for FakeFactory {
    async fn open(&self, target: &Target, timeout: Duration) -> Result<Session> {
        if self.refuse.load(Ordering::SeqCst) {
            return Err(DoctorError::connection(&target.name, "connection refused"));
        }
        let pid = self.next_pid.fetch_add(1, Ordering::SeqCst);
        let transport = Arc::new(FakeTransport::new(self.server.clone(), pid));
        self.transports.lock().push(transport.clone());
        Session::establish(&target.name, transport, timeout, Duration::from_millis(10)).await
    }
}

/// Reports memory growing by 1 MiB on every reading.
#[derive(Default)]
pub struct GrowingSampler {
    readings: AtomicU64,
}

impl ResourceSampler for GrowingSampler {
    fn sample(&self, pids: &[u32]) -> Option<ResourceSample> {
        if pids.is_empty() {
            return None;
        }
        let n = self.readings.fetch_add(1, Ordering::SeqCst) + 1;
        Some(ResourceSample {
            memory_bytes: 64 * 1024 * 1024 + n * 1024 * 1024,
            cpu_percent: 5.0,
        })
    }
}

/// Counts readings; reports a flat footprint.
#[derive(Default)]
pub struct CountingSampler {
    readings: AtomicU64,
}

impl CountingSampler {
    pub fn readings(&self) -> u64 {
        self.readings.load(Ordering::SeqCst)
    }
}

impl ResourceSampler for CountingSampler {
    fn sample(&self, _pids: &[u32]) -> Option<ResourceSample> {
        self.readings.fetch_add(1, Ordering::SeqCst);
        Some(ResourceSample {
            memory_bytes: 64 * 1024 * 1024,
            cpu_percent: 5.0,
        })
    }
}

pub struct NoSampler;

impl ResourceSampler for NoSampler {
    fn sample(&self, _pids: &[u32]) -> Option<ResourceSample> {
        None
    }
}

pub fn target(name: &str) -> Target {
    Target::stdio(name, "fake-server", vec![])
}
