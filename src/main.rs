use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use mcp_doctor::models::{ProbeSelection, Target};
use mcp_doctor::{Engine, EngineConfig};

/// Path of the JSON target descriptor to diagnose
const TARGET_FILE_VAR: &str = "MCP_DOCTOR_TARGET_FILE";

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    // Initialize tracing. Stdout carries the report, logs go to stderr.
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "mcp_doctor=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let config = EngineConfig::from_env().context("invalid MCP_DOCTOR_* configuration")?;

    let path = std::env::var(TARGET_FILE_VAR)
        .with_context(|| format!("{TARGET_FILE_VAR} must point to a target descriptor"))?;
    let descriptor = tokio::fs::read_to_string(&path)
        .await
        .with_context(|| format!("failed to read target descriptor {path}"))?;
    let target: Target = serde_json::from_str(&descriptor)
        .with_context(|| format!("malformed target descriptor {path}"))?;

    let engine = Engine::from_config(config).await?;
    tracing::info!(server = %target.name, "Diagnosing");

    let cancel = CancellationToken::new();
    let signal = tokio::spawn({
        let cancel = cancel.clone();
        async move {
            shutdown_signal().await;
            cancel.cancel();
        }
    });

    let diagnosis = engine.diagnose(target, &ProbeSelection::all(), cancel).await;
    signal.abort();
    engine.shutdown().await?;

    let diagnosis = diagnosis?;
    println!("{}", serde_json::to_string_pretty(&diagnosis)?);

    tracing::info!("Diagnosis complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, cancelling diagnosis");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM, cancelling diagnosis");
        },
    }
}
