//! Crash-safe queue persistence: one JSON array file per queue, written via
//! write-tmp-then-rename so a crash mid-write never corrupts the last saved
//! state.

use crate::mail::{QueueKind, QueuedMessage};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// In-memory snapshot of the three mail queues.
///
/// Queues partition live messages: a message id appears in at most one of
/// them at any instant.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct MailQueues {
    pub inbound: Vec<QueuedMessage>,
    pub outbound: Vec<QueuedMessage>,
    pub dead_letter: Vec<QueuedMessage>,
}

/// Read-only queue sizes for status reporting.
#[derive(Debug, Default, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct QueueStats {
    pub inbound: usize,
    pub outbound: usize,
    pub dead_letter: usize,
}

impl MailQueues {
    pub fn contains(&self, message_id: &str) -> bool {
        self.inbound
            .iter()
            .chain(&self.outbound)
            .chain(&self.dead_letter)
            .any(|qm| qm.id() == message_id)
    }

    pub fn total_len(&self) -> usize {
        self.inbound.len() + self.outbound.len() + self.dead_letter.len()
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            inbound: self.inbound.len(),
            outbound: self.outbound.len(),
            dead_letter: self.dead_letter.len(),
        }
    }
}

/// On-disk home of the mail queues, under `<workspace>/mail/`.
pub struct MailStore {
    dir: PathBuf,
}

impl MailStore {
    pub fn new(workspace_dir: &Path) -> Self {
        Self {
            dir: workspace_dir.join("mail"),
        }
    }

    pub fn queue_path(&self, kind: QueueKind) -> PathBuf {
        self.dir.join(format!("{}.json", kind.as_str()))
    }

    /// Load one queue. A missing or empty file is an empty queue, not an
    /// error; a corrupt file is surfaced to the caller.
    pub async fn load(&self, kind: QueueKind) -> Result<Vec<QueuedMessage>> {
        let path = self.queue_path(kind);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let bytes = tokio::fs::read(&path)
            .await
            .with_context(|| format!("Failed to read {} queue: {}", kind.as_str(), path.display()))?;
        if bytes.is_empty() {
            return Ok(Vec::new());
        }
        serde_json::from_slice(&bytes)
            .with_context(|| format!("Failed to parse {} queue: {}", kind.as_str(), path.display()))
    }

    /// Atomic save: write to `.tmp` then rename.
    pub async fn save(&self, kind: QueueKind, queue: &[QueuedMessage]) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("Failed to create mail directory: {}", self.dir.display()))?;

        let path = self.queue_path(kind);
        let tmp = path.with_extension("json.tmp");
        let data = serde_json::to_vec_pretty(queue)?;
        tokio::fs::write(&tmp, data)
            .await
            .with_context(|| format!("Failed to write {}", tmp.display()))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .with_context(|| format!("Failed to replace {}", path.display()))?;
        Ok(())
    }

    /// Load all three queues, as done once at orchestrator construction.
    pub async fn load_all(&self) -> Result<MailQueues> {
        Ok(MailQueues {
            inbound: self.load(QueueKind::Inbound).await?,
            outbound: self.load(QueueKind::Outbound).await?,
            dead_letter: self.load(QueueKind::DeadLetter).await?,
        })
    }

    /// Flush all three queues, called after every mutating cycle.
    pub async fn save_all(&self, queues: &MailQueues) -> Result<()> {
        self.save(QueueKind::Inbound, &queues.inbound).await?;
        self.save(QueueKind::Outbound, &queues.outbound).await?;
        self.save(QueueKind::DeadLetter, &queues.dead_letter).await?;
        Ok(())
    }

    /// On-disk queue sizes without holding any in-memory state.
    pub async fn stats(&self) -> Result<QueueStats> {
        Ok(QueueStats {
            inbound: self.load(QueueKind::Inbound).await?.len(),
            outbound: self.load(QueueKind::Outbound).await?.len(),
            dead_letter: self.load(QueueKind::DeadLetter).await?.len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mail::{Message, Priority};
    use tempfile::TempDir;

    fn queued(id: &str, attempts: u32) -> QueuedMessage {
        let mut msg = Message::new("mayor", "refinery/witness", "s", "b")
            .with_priority(Priority::High);
        msg.id = id.to_string();
        let mut qm = QueuedMessage::new(msg);
        qm.attempts = attempts;
        if attempts > 0 {
            qm.last_attempt = Some(chrono::Utc::now());
        }
        qm
    }

    #[tokio::test]
    async fn missing_files_load_as_empty_queues() {
        let tmp = TempDir::new().unwrap();
        let store = MailStore::new(tmp.path());

        let queues = store.load_all().await.unwrap();
        assert_eq!(queues.total_len(), 0);
    }

    #[tokio::test]
    async fn save_and_reload_preserves_ids_and_attempt_counts() {
        let tmp = TempDir::new().unwrap();
        let store = MailStore::new(tmp.path());

        let queues = MailQueues {
            inbound: vec![queued("in-1", 0), queued("in-2", 0)],
            outbound: vec![queued("out-1", 2)],
            dead_letter: vec![queued("dead-1", 3)],
        };
        store.save_all(&queues).await.unwrap();

        // A fresh store over the same directory sees the same state.
        let reloaded = MailStore::new(tmp.path()).load_all().await.unwrap();
        assert_eq!(reloaded, queues);
        assert_eq!(reloaded.outbound[0].attempts, 2);
        assert!(reloaded.outbound[0].last_attempt.is_some());
    }

    #[tokio::test]
    async fn save_replaces_previous_contents() {
        let tmp = TempDir::new().unwrap();
        let store = MailStore::new(tmp.path());

        store
            .save(QueueKind::Inbound, &[queued("a", 0), queued("b", 0)])
            .await
            .unwrap();
        store.save(QueueKind::Inbound, &[queued("c", 0)]).await.unwrap();

        let loaded = store.load(QueueKind::Inbound).await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].id(), "c");
    }

    #[tokio::test]
    async fn corrupt_queue_file_is_an_error() {
        let tmp = TempDir::new().unwrap();
        let store = MailStore::new(tmp.path());
        tokio::fs::create_dir_all(tmp.path().join("mail")).await.unwrap();
        tokio::fs::write(store.queue_path(QueueKind::Outbound), b"{not json")
            .await
            .unwrap();

        let err = store.load(QueueKind::Outbound).await.unwrap_err();
        assert!(err.to_string().contains("outbound"));
    }

    #[tokio::test]
    async fn empty_file_loads_as_empty_queue() {
        let tmp = TempDir::new().unwrap();
        let store = MailStore::new(tmp.path());
        tokio::fs::create_dir_all(tmp.path().join("mail")).await.unwrap();
        tokio::fs::write(store.queue_path(QueueKind::Inbound), b"").await.unwrap();

        assert!(store.load(QueueKind::Inbound).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn no_stale_tmp_file_remains_after_save() {
        let tmp = TempDir::new().unwrap();
        let store = MailStore::new(tmp.path());
        store.save(QueueKind::DeadLetter, &[queued("d", 3)]).await.unwrap();

        let tmp_path = store.queue_path(QueueKind::DeadLetter).with_extension("json.tmp");
        assert!(!tmp_path.exists());
        assert!(store.queue_path(QueueKind::DeadLetter).exists());
    }

    #[tokio::test]
    async fn dead_letter_file_uses_kebab_case_name() {
        let tmp = TempDir::new().unwrap();
        let store = MailStore::new(tmp.path());
        assert!(store
            .queue_path(QueueKind::DeadLetter)
            .ends_with("mail/dead-letter.json"));
    }

    #[tokio::test]
    async fn contains_checks_all_three_queues() {
        let queues = MailQueues {
            inbound: vec![queued("in-1", 0)],
            outbound: vec![queued("out-1", 1)],
            dead_letter: vec![queued("dead-1", 3)],
        };
        assert!(queues.contains("in-1"));
        assert!(queues.contains("out-1"));
        assert!(queues.contains("dead-1"));
        assert!(!queues.contains("nope"));
    }

    #[tokio::test]
    async fn stats_reflect_queue_sizes() {
        let tmp = TempDir::new().unwrap();
        let store = MailStore::new(tmp.path());
        store
            .save(QueueKind::Inbound, &[queued("a", 0), queued("b", 0)])
            .await
            .unwrap();

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.inbound, 2);
        assert_eq!(stats.outbound, 0);
        assert_eq!(stats.dead_letter, 0);
    }
}
