//! Long-running daemon: supervises the mail orchestrator and publishes a
//! machine-readable state file for `gastown status`.

use crate::config::Config;
use crate::mail::orchestrator::MailOrchestrator;
use crate::mail::spool::{EventLogHook, FsDeliveryAdapter, SpoolNotifier, SpoolSource};
use crate::mail::store::QueueStats;
use anyhow::Result;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;

/// Snapshot written to `daemon_state.json` on every flush tick.
#[derive(Debug, Serialize, Deserialize)]
pub struct DaemonState {
    pub mail: QueueStats,
    pub written_at: String,
}

pub async fn run(config: Config) -> Result<()> {
    if !config.mail.enabled {
        tracing::info!("Mail orchestration disabled in config; nothing to run");
        return Ok(());
    }

    let initial_backoff = config.reliability.daemon_initial_backoff_secs.max(1);
    let max_backoff = config
        .reliability
        .daemon_max_backoff_secs
        .max(initial_backoff);

    let shutdown = CancellationToken::new();
    let mail_cfg = config.clone();
    let mail_token = shutdown.clone();
    let supervisor = spawn_component_supervisor(
        "mail",
        initial_backoff,
        max_backoff,
        shutdown.clone(),
        move || {
            let cfg = mail_cfg.clone();
            let token = mail_token.clone();
            async move { run_mail_component(cfg, token).await }
        },
    );

    println!("⛽ Gas Town daemon started");
    println!("   Workspace: {}", config.workspace_dir.display());
    println!(
        "   Mail poll every {}s, {} retries max",
        config.mail.poll_interval_secs, config.mail.max_retries
    );
    println!("   Ctrl+C to stop");

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown requested");
    shutdown.cancel();
    let _ = supervisor.await;

    Ok(())
}

pub fn state_file_path(config: &Config) -> PathBuf {
    config
        .config_path
        .parent()
        .map_or_else(|| PathBuf::from("."), PathBuf::from)
        .join("daemon_state.json")
}

/// Runs the orchestrator plus the state-writer loop until `shutdown` fires,
/// then stops the orchestrator gracefully so its final flush happens.
async fn run_mail_component(config: Config, shutdown: CancellationToken) -> Result<()> {
    let ws = &config.workspace_dir;
    let handle = MailOrchestrator::start(
        config.mail.clone(),
        ws,
        Arc::new(SpoolSource::new(ws)),
        Arc::new(FsDeliveryAdapter::new(ws)),
        Arc::new(SpoolNotifier::new(ws)),
        Arc::new(EventLogHook::new(ws)),
    )
    .await?;

    let state_path = state_file_path(&config);
    let mut interval = tokio::time::interval(Duration::from_secs(
        config.reliability.state_flush_secs.max(1),
    ));
    loop {
        tokio::select! {
            _ = interval.tick() => {
                match handle.stats().await {
                    Ok(stats) => write_state(&state_path, stats).await,
                    Err(e) => tracing::warn!("Mail stats unavailable: {e}"),
                }
            }
            () = shutdown.cancelled() => break,
        }
    }

    handle.stop().await;
    Ok(())
}

/// Atomic snapshot write, tmp then rename, so a status read never sees a
/// torn file.
async fn write_state(path: &Path, stats: QueueStats) {
    let state = DaemonState {
        mail: stats,
        written_at: Utc::now().to_rfc3339(),
    };
    let data = serde_json::to_vec_pretty(&state).unwrap_or_else(|_| b"{}".to_vec());
    let tmp = path.with_extension("json.tmp");
    if let Err(e) = tokio::fs::write(&tmp, data).await {
        tracing::warn!("Failed to write {}: {e}", tmp.display());
        return;
    }
    if let Err(e) = tokio::fs::rename(&tmp, path).await {
        tracing::warn!("Failed to replace {}: {e}", path.display());
    }
}

/// Restart a failed component with doubling backoff. A clean exit is still
/// unexpected for a daemon component and restarts it too, with the backoff
/// reset. Exits only when `shutdown` fires.
///
/// The component future is always driven to completion, never dropped at an
/// await point: components watch `shutdown` themselves and return once it
/// fires, so their cleanup (the orchestrator's final flush) runs before the
/// supervisor exits. Only the between-restart sleep is raced against the
/// token.
fn spawn_component_supervisor<F, Fut>(
    name: &'static str,
    initial_backoff_secs: u64,
    max_backoff_secs: u64,
    shutdown: CancellationToken,
    mut run_component: F,
) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    tokio::spawn(async move {
        let mut backoff = initial_backoff_secs.max(1);
        let max_backoff = max_backoff_secs.max(backoff);

        loop {
            match run_component().await {
                Ok(()) => {
                    if shutdown.is_cancelled() {
                        break;
                    }
                    tracing::warn!("Daemon component '{name}' exited unexpectedly");
                    backoff = initial_backoff_secs.max(1);
                }
                Err(e) => {
                    if shutdown.is_cancelled() {
                        break;
                    }
                    tracing::error!("Daemon component '{name}' failed: {e}");
                }
            }

            tokio::select! {
                () = tokio::time::sleep(Duration::from_secs(backoff)) => {}
                () = shutdown.cancelled() => break,
            }
            // Double AFTER sleeping so the first restart uses the initial
            // backoff.
            backoff = backoff.saturating_mul(2).min(max_backoff);
        }
    })
}
