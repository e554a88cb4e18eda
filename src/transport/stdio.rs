// Line-delimited JSON-RPC over a child process's stdin/stdout

use std::collections::{HashMap, VecDeque};
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use super::{JsonRpcRequest, JsonRpcResponse, Transport};
use crate::error::{DoctorError, Result};
use crate::models::StdioTarget;
use crate::utils::truncate;

/// Stderr lines kept per process
const STDERR_CAPACITY: usize = 200;

type PendingMap = Arc<parking_lot::Mutex<HashMap<u64, oneshot::Sender<Result<JsonRpcResponse>>>>>;
type SharedWriter = Arc<tokio::sync::Mutex<Option<ChildStdin>>>;

/// Bounded ring of stderr lines with monotonically increasing sequence numbers.
#[derive(Default)]
struct StderrRing {
    lines: parking_lot::Mutex<VecDeque<(u64, String)>>,
    next: AtomicU64,
}

impl StderrRing {
    fn push(&self, line: String) {
        let seq = self.next.fetch_add(1, Ordering::SeqCst);
        let mut lines = self.lines.lock();
        if lines.len() == STDERR_CAPACITY {
            lines.pop_front();
        }
        lines.push_back((seq, line));
    }

    fn since(&self, mark: u64) -> Vec<String> {
        self.lines
            .lock()
            .iter()
            .filter(|(seq, _)| *seq >= mark)
            .map(|(_, line)| line.clone())
            .collect()
    }
}

/// Removes a pending entry when the waiting future is dropped (e.g. on timeout).
struct PendingGuard<'a> {
    pending: &'a PendingMap,
    id: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending.lock().remove(&self.id);
    }
}

pub struct StdioTransport {
    server: String,
    writer: SharedWriter,
    pending: PendingMap,
    next_id: AtomicU64,
    connected: Arc<AtomicBool>,
    child: tokio::sync::Mutex<Option<Child>>,
    pid: Option<u32>,
    stderr: Arc<StderrRing>,
    tasks: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

impl StdioTransport {
    /// Spawn the server process. It is killed if the transport is dropped unclosed.
    pub fn spawn(server: &str, target: &StdioTarget) -> Result<Self> {
        let mut command = Command::new(&target.command);
        command
            .args(&target.args)
            .envs(&target.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for key in &target.remove_env {
            command.env_remove(key);
        }
        if let Some(cwd) = &target.cwd {
            command.current_dir(cwd);
        }

        let mut child = command.spawn().map_err(|e| {
            DoctorError::connection(server, format!("failed to spawn '{}': {}", target.command, e))
        })?;
        let pid = child.id();

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| DoctorError::connection(server, "child stdin unavailable"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| DoctorError::connection(server, "child stdout unavailable"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| DoctorError::connection(server, "child stderr unavailable"))?;

        let writer: SharedWriter = Arc::new(tokio::sync::Mutex::new(Some(stdin)));
        let pending: PendingMap = Arc::new(parking_lot::Mutex::new(HashMap::new()));
        let connected = Arc::new(AtomicBool::new(true));
        let ring = Arc::new(StderrRing::default());

        let reader = tokio::spawn(read_loop(
            server.to_string(),
            stdout,
            pending.clone(),
            writer.clone(),
            connected.clone(),
        ));
        let stderr_task = {
            let ring = ring.clone();
            let server = server.to_string();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::debug!(target: "mcp_doctor::stderr", server = %server, "{}", line);
                    ring.push(line);
                }
            })
        };

        tracing::debug!(server = %server, pid = ?pid, command = %target.command, "Spawned stdio server");

        Ok(Self {
            server: server.to_string(),
            writer,
            pending,
            next_id: AtomicU64::new(1),
            connected,
            child: tokio::sync::Mutex::new(Some(child)),
            pid,
            stderr: ring,
            tasks: parking_lot::Mutex::new(vec![reader, stderr_task]),
        })
    }

    async fn write_line(&self, line: &str) -> Result<()> {
        let mut writer = self.writer.lock().await;
        let stdin = writer
            .as_mut()
            .ok_or_else(|| DoctorError::Transport(format!("stdin of '{}' is closed", self.server)))?;
        let write = async {
            stdin.write_all(line.as_bytes()).await?;
            stdin.write_all(b"\n").await?;
            stdin.flush().await?;
            Ok::<(), std::io::Error>(())
        };
        write.await.map_err(|e| {
            self.connected.store(false, Ordering::SeqCst);
            DoctorError::Transport(format!("write to '{}' failed: {}", self.server, e))
        })
    }
}

#[async_trait]
impl Transport for StdioTransport {
    async fn request(&self, method: &str, params: Option<Value>) -> Result<JsonRpcResponse> {
        if !self.is_connected() {
            return Err(DoctorError::Transport(format!("'{}' is not connected", self.server)));
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let line = serde_json::to_string(&JsonRpcRequest::new(id, method, params))?;

        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(id, tx);
        let _guard = PendingGuard {
            pending: &self.pending,
            id,
        };

        self.write_line(&line).await?;
        match rx.await {
            Ok(response) => response,
            Err(_) => Err(DoctorError::Transport(format!(
                "'{}' went away before answering {}",
                self.server, method
            ))),
        }
    }

    async fn notify(&self, method: &str, params: Option<Value>) -> Result<()> {
        let line = serde_json::to_string(&JsonRpcRequest::notification(method, params))?;
        self.write_line(&line).await
    }

    async fn close(&self, grace: Duration) -> Result<()> {
        let Some(mut child) = self.child.lock().await.take() else {
            return Ok(());
        };
        self.connected.store(false, Ordering::SeqCst);

        // Closing stdin is the polite shutdown signal for stdio servers.
        if let Ok(mut writer) = tokio::time::timeout(grace, self.writer.lock()).await {
            writer.take();
        }

        let result = match tokio::time::timeout(grace, child.wait()).await {
            Ok(Ok(status)) => {
                tracing::debug!(server = %self.server, %status, "Stdio server exited");
                Ok(())
            }
            Ok(Err(e)) => Err(DoctorError::Io(e)),
            Err(_) => {
                tracing::warn!(
                    server = %self.server,
                    pid = ?self.pid,
                    "Server did not exit within {}ms, killing",
                    grace.as_millis()
                );
                child.kill().await.map_err(DoctorError::Io)
            }
        };

        fail_all(&self.pending, || {
            DoctorError::Transport("transport closed".to_string())
        });
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        result
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn process_id(&self) -> Option<u32> {
        self.pid
    }

    fn stderr_mark(&self) -> u64 {
        self.stderr.next.load(Ordering::SeqCst)
    }

    fn stderr_since(&self, mark: u64) -> Vec<String> {
        self.stderr.since(mark)
    }
}

impl Drop for StdioTransport {
    fn drop(&mut self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }
}

fn fail_all(pending: &PendingMap, err: impl Fn() -> DoctorError) {
    let waiters: Vec<_> = pending.lock().drain().collect();
    for (_, tx) in waiters {
        let _ = tx.send(Err(err()));
    }
}

async fn read_loop(
    server: String,
    stdout: ChildStdout,
    pending: PendingMap,
    writer: SharedWriter,
    connected: Arc<AtomicBool>,
) {
    let mut lines = BufReader::new(stdout).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let line = line.trim();
                if !line.is_empty() {
                    dispatch(&server, line, &pending, &writer).await;
                }
            }
            Ok(None) => break,
            Err(e) => {
                tracing::warn!(server = %server, "Reading stdout failed: {}", e);
                break;
            }
        }
    }
    connected.store(false, Ordering::SeqCst);
    fail_all(&pending, || {
        DoctorError::Transport(format!("'{server}' closed its stdout"))
    });
}

async fn dispatch(server: &str, line: &str, pending: &PendingMap, writer: &SharedWriter) {
    let message: Value = match serde_json::from_str(line) {
        Ok(message) => message,
        Err(_) => {
            tracing::warn!(server = %server, "Non JSON-RPC output on stdout: {}", truncate(line, 120));
            let text = format!("non JSON-RPC output on stdout: {}", truncate(line, 120));
            fail_all(pending, || DoctorError::ProtocolViolation(text.clone()));
            return;
        }
    };

    if let Some(method) = message.get("method").and_then(Value::as_str) {
        match message.get("id") {
            Some(id) => answer_server_request(server, method, id.clone(), writer).await,
            None => tracing::trace!(server = %server, method, "Server notification"),
        }
        return;
    }

    let Some(id) = message.get("id").and_then(Value::as_u64) else {
        tracing::debug!(server = %server, "Response without a usable id: {}", truncate(line, 120));
        return;
    };
    let Some(tx) = pending.lock().remove(&id) else {
        tracing::debug!(server = %server, id, "Late or unknown response dropped");
        return;
    };
    let response = serde_json::from_value::<JsonRpcResponse>(message)
        .map_err(|e| DoctorError::ProtocolViolation(format!("malformed response: {e}")));
    let _ = tx.send(response);
}

/// Servers may ping the client; everything else is refused.
async fn answer_server_request(server: &str, method: &str, id: Value, writer: &SharedWriter) {
    let reply = if method == "ping" {
        json!({"jsonrpc": "2.0", "id": id, "result": {}})
    } else {
        json!({
            "jsonrpc": "2.0",
            "id": id,
            "error": {"code": -32601, "message": format!("method '{method}' not supported by client")}
        })
    };
    let mut guard = writer.lock().await;
    if let Some(stdin) = guard.as_mut() {
        let line = format!("{reply}\n");
        if let Err(e) = stdin.write_all(line.as_bytes()).await {
            tracing::debug!(server = %server, "Failed to answer server request: {}", e);
        }
        let _ = stdin.flush().await;
    }
}
