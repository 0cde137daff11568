//! Filesystem-backed mail endpoints.
//!
//! The spool directory is the out-of-process drop point: peers write one
//! JSON message per file into `<workspace>/mail/spool/`. Recipients are
//! plain directories under `<workspace>/sessions/`; delivery lands files in
//! their `interrupts/` or `notifications/` subdirectory, which the
//! receiving agent polls on its own schedule.

use crate::mail::traits::{DeadLetterNotifier, DeliveryAdapter, MailSource, SessionId};
use crate::mail::Message;
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::path::{Component, Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;

const SPOOL_DIR: &str = "mail/spool";
const SESSIONS_DIR: &str = "sessions";

fn spool_dir(workspace_dir: &Path) -> PathBuf {
    workspace_dir.join(SPOOL_DIR)
}

/// Mail source that scans the spool directory for `*.json` message files.
///
/// Reads are non-destructive: spool files stay in place so operators can
/// inspect them, and a served-id set keeps each file from being handed to
/// the orchestrator more than once per process. After a restart the live
/// queues are reloaded from disk first, so rescans of still-queued mail are
/// deduplicated there; only already-delivered spool files can be served
/// again.
pub struct SpoolSource {
    dir: PathBuf,
    served: Mutex<HashSet<String>>,
}

impl SpoolSource {
    pub fn new(workspace_dir: &Path) -> Self {
        Self {
            dir: spool_dir(workspace_dir),
            served: Mutex::new(HashSet::new()),
        }
    }

    /// Write a message into the spool as `<id>.json`. This is the producer
    /// side of the drop point, used by the CLI.
    pub async fn drop_message(&self, msg: &Message) -> Result<()> {
        fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("Failed to create spool dir: {}", self.dir.display()))?;
        let path = self.dir.join(format!("{}.json", msg.id));
        let json = serde_json::to_string_pretty(msg).context("Failed to serialize message")?;
        fs::write(&path, json)
            .await
            .with_context(|| format!("Failed to write spool file: {}", path.display()))?;
        Ok(())
    }
}

#[async_trait]
impl MailSource for SpoolSource {
    async fn fetch_pending(&self) -> Result<Vec<Message>> {
        let mut entries = match fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("Failed to read spool dir: {}", self.dir.display()))
            }
        };

        let mut pending = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .context("Failed to iterate spool dir")?
        {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            let raw = match fs::read_to_string(&path).await {
                Ok(raw) => raw,
                Err(e) => {
                    tracing::warn!("Unreadable spool file {}: {e}", path.display());
                    continue;
                }
            };
            let msg: Message = match serde_json::from_str(&raw) {
                Ok(msg) => msg,
                Err(e) => {
                    // A bad file never blocks its neighbors.
                    tracing::warn!("Malformed spool file {}: {e}", path.display());
                    continue;
                }
            };
            if !self.served.lock().insert(msg.id.clone()) {
                continue;
            }
            pending.push(msg);
        }

        // Oldest first, so arrival order survives within a priority class.
        pending.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(pending)
    }
}

/// Delivery adapter over session directories.
///
/// An address resolves to a session when `<workspace>/sessions/<address>`
/// exists as a directory. Interrupts and notifications are written as one
/// file per delivery under that session.
pub struct FsDeliveryAdapter {
    sessions_dir: PathBuf,
}

impl FsDeliveryAdapter {
    pub fn new(workspace_dir: &Path) -> Self {
        Self {
            sessions_dir: workspace_dir.join(SESSIONS_DIR),
        }
    }

    /// Map an address onto a path under the sessions root. Addresses are
    /// relative paths; anything that would escape the root is rejected.
    fn session_path(&self, address: &str) -> Result<PathBuf> {
        let relative = Path::new(address);
        let safe = relative
            .components()
            .all(|c| matches!(c, Component::Normal(_)));
        if !safe || relative.as_os_str().is_empty() {
            anyhow::bail!("address escapes the sessions root: {address}");
        }
        Ok(self.sessions_dir.join(relative))
    }

    async fn write_into(&self, session: &SessionId, subdir: &str, content: &str) -> Result<()> {
        let dir = self.session_path(session)?.join(subdir);
        fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("Failed to create {}", dir.display()))?;
        let path = dir.join(format!("{}.txt", uuid::Uuid::new_v4()));
        fs::write(&path, content)
            .await
            .with_context(|| format!("Failed to write {}", path.display()))?;
        Ok(())
    }
}

#[async_trait]
impl DeliveryAdapter for FsDeliveryAdapter {
    async fn resolve_address(&self, to: &str) -> Result<Vec<SessionId>> {
        let path = self.session_path(to)?;
        match fs::metadata(&path).await {
            Ok(meta) if meta.is_dir() => Ok(vec![to.to_string()]),
            Ok(_) => Ok(Vec::new()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => {
                Err(e).with_context(|| format!("Failed to stat session dir: {}", path.display()))
            }
        }
    }

    async fn inject_interrupt(&self, session: &SessionId, content: &str) -> Result<()> {
        self.write_into(session, "interrupts", content).await
    }

    async fn queue_notification(&self, session: &SessionId, content: &str) -> Result<()> {
        self.write_into(session, "notifications", content).await
    }
}

/// Post-delivery hook that appends one JSON line per event to
/// `<workspace>/mail/events.jsonl`.
pub struct EventLogHook {
    path: PathBuf,
}

impl EventLogHook {
    pub fn new(workspace_dir: &Path) -> Self {
        Self {
            path: workspace_dir.join("mail").join("events.jsonl"),
        }
    }
}

#[async_trait]
impl crate::mail::traits::DeliveryHook for EventLogHook {
    async fn notify(&self, event: &str, payload: serde_json::Value) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let line = serde_json::json!({
            "event": event,
            "at": Utc::now().to_rfc3339(),
            "payload": payload,
        });
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .with_context(|| format!("Failed to open {}", self.path.display()))?;
        file.write_all(format!("{line}\n").as_bytes())
            .await
            .with_context(|| format!("Failed to append to {}", self.path.display()))?;
        Ok(())
    }
}

/// Marks dead-lettered messages next to their spool file, so `<id>.dead`
/// tells the producer the message will never be delivered.
pub struct SpoolNotifier {
    dir: PathBuf,
}

impl SpoolNotifier {
    pub fn new(workspace_dir: &Path) -> Self {
        Self {
            dir: spool_dir(workspace_dir),
        }
    }
}

#[async_trait]
impl DeadLetterNotifier for SpoolNotifier {
    async fn mark_dead_letter(&self, message_id: &str) -> Result<()> {
        fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("Failed to create spool dir: {}", self.dir.display()))?;
        let path = self.dir.join(format!("{message_id}.dead"));
        fs::write(&path, Utc::now().to_rfc3339())
            .await
            .with_context(|| format!("Failed to write dead-letter mark: {}", path.display()))?;
        Ok(())
    }
}
