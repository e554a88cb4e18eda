#![cfg(target_os = "linux")]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use mcp_doctor::Engine;
use mcp_doctor::config::EngineConfig;
use mcp_doctor::error::Result;
use mcp_doctor::models::{FunctionalProbe, ProbeKind, ProbeSelection, ProbeSpec, SuiteState, Target, TestStatus};
use mcp_doctor::orchestrator::SuiteOptions;
use mcp_doctor::probes::ProbeCatalog;
use mcp_doctor::transport::{Session, SessionFactory, TransportFactory};

/// Answers the handshake and discovery, then stalls on `ping`.
const SERVER_SCRIPT: &str = r#"#!/bin/sh
while IFS= read -r line; do
  id=$(printf '%s' "$line" | sed -n 's/.*"id":\([0-9][0-9]*\).*/\1/p')
  case "$line" in
    *'"method":"initialize"'*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"protocolVersion":"2024-11-05","capabilities":{"tools":{}},"serverInfo":{"name":"sh-server","version":"0.1.0"}}}\n' "$id"
      ;;
    *'"method":"tools/list"'*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"tools":[]}}\n' "$id"
      ;;
    *'"method":"ping"'*)
      echo "ping received, stalling" >&2
      sleep 600
      ;;
  esac
done
"#;

/// Real transports, remembering the pid of every spawned server.
struct RecordingFactory {
    inner: TransportFactory,
    pids: Mutex<Vec<u32>>,
}

#[async_trait]
impl SessionFactory for RecordingFactory {
    async fn open(&self, target: &Target, timeout: Duration) -> Result<Session> {
        let session = self.inner.open(target, timeout).await?;
        self.pids.lock().extend(session.process_id());
        Ok(session)
    }
}

fn write_script(dir: &Path) -> PathBuf {
    let path = dir.join("server.sh");
    std::fs::write(&path, SERVER_SCRIPT).unwrap();
    path
}

fn alive(pid: u32) -> bool {
    // A reaped process has no /proc entry; a zombie still reports state Z
    std::fs::read_to_string(format!("/proc/{pid}/stat"))
        .map(|stat| !stat.contains(") Z "))
        .unwrap_or(false)
}

#[tokio::test]
async fn test_cancel_terminates_stalled_server_within_grace() {
    let dir = tempfile::tempdir().unwrap();
    let script = write_script(dir.path());
    let grace = Duration::from_millis(300);

    let config = EngineConfig {
        teardown_grace_ms: grace.as_millis() as u64,
        ..EngineConfig::default()
    };
    let factory = Arc::new(RecordingFactory {
        inner: TransportFactory::new(grace),
        pids: Mutex::new(Vec::new()),
    });
    let mut catalog = ProbeCatalog::empty();
    catalog
        .register(ProbeSpec::new(
            "ping",
            Duration::from_secs(60),
            ProbeKind::Functional(FunctionalProbe::Ping),
        ))
        .unwrap();
    let engine = Engine::builder(config)
        .factory(factory.clone())
        .catalog(catalog)
        .build()
        .unwrap();

    let target = Target::stdio(
        "sh-server",
        "/bin/sh",
        vec![script.to_string_lossy().into_owned()],
    );
    let cancel = CancellationToken::new();
    let canceller = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(500)).await;
            cancel.cancel();
        })
    };

    let suite = engine
        .run_suite(
            target,
            &ProbeSelection::all(),
            &SuiteOptions::from_config(engine.config()),
            cancel,
        )
        .await
        .unwrap();
    canceller.await.unwrap();

    assert_eq!(suite.state, SuiteState::Aborted);
    assert_eq!(suite.result("ping").unwrap().status, TestStatus::TimedOut);

    let pids = factory.pids.lock().clone();
    assert_eq!(pids.len(), 1);
    tokio::time::sleep(grace * 2).await;
    for pid in pids {
        assert!(!alive(pid), "server process {pid} outlived the teardown grace");
    }
}

#[tokio::test]
async fn test_handshake_against_script_server() {
    let dir = tempfile::tempdir().unwrap();
    let script = write_script(dir.path());
    let target = Target::stdio(
        "sh-server",
        "/bin/sh",
        vec![script.to_string_lossy().into_owned()],
    );

    let session = Session::open(&target, Duration::from_secs(10), Duration::from_millis(300))
        .await
        .unwrap();
    assert!(session.is_connected());
    assert_eq!(session.capabilities().server_name.as_deref(), Some("sh-server"));
    assert!(session.discovery().tools.is_empty());
    let pid = session.process_id().unwrap();

    session.close().await;
    assert!(!session.is_connected());
    assert!(!alive(pid));
}
