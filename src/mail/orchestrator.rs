//! The mail orchestration loop.
//!
//! A single task owns all three queues outright; external callers reach it
//! through a [`MailHandle`] over a bounded command channel. No locks, no
//! lock ordering: enqueue requests, stats queries, and the poll cycle are
//! serialized by the actor.

use crate::config::MailConfig;
use crate::mail::router::DeliveryRouter;
use crate::mail::store::{MailQueues, MailStore, QueueStats};
use crate::mail::traits::{DeadLetterNotifier, DeliveryAdapter, DeliveryHook, MailSource};
use crate::mail::{
    needs_orchestration, sort_by_priority, DeliveryOutcome, Message, QueueKind, QueuedMessage,
};
use anyhow::{Context, Result};
use chrono::Utc;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{self, Duration, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

const COMMAND_BUFFER: usize = 64;
const NOTIFIER_TIMEOUT_SECS: u64 = 5;

/// Pluggable backoff policy: attempt count so far -> wait before the next
/// retry becomes eligible.
pub type BackoffPolicy = Arc<dyn Fn(u32) -> Duration + Send + Sync>;

/// Fixed-delay policy, the default: every retry waits the same `delay`.
pub fn fixed_backoff(delay: Duration) -> BackoffPolicy {
    Arc::new(move |_attempt| delay)
}

enum Command {
    Enqueue {
        message: Message,
        reply: oneshot::Sender<bool>,
    },
    Stats {
        reply: oneshot::Sender<QueueStats>,
    },
}

/// Cloneable handle onto a running orchestrator.
///
/// This is the only way external code touches the queues: it can enqueue and
/// query, never remove, reorder, or edit attempt counters.
#[derive(Clone)]
pub struct MailHandle {
    tx: mpsc::Sender<Command>,
    shutdown: CancellationToken,
    task: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl MailHandle {
    /// Push a message straight onto the inbound queue, ahead of the next
    /// source scan. Rejects ids that are already live in any queue.
    pub async fn enqueue(&self, message: Message) -> Result<()> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(Command::Enqueue {
                message,
                reply: reply_tx,
            })
            .await
            .map_err(|_| anyhow::anyhow!("mail orchestrator is not running"))?;
        let accepted = reply_rx
            .await
            .map_err(|_| anyhow::anyhow!("mail orchestrator is not running"))?;
        if !accepted {
            anyhow::bail!("message id is already queued");
        }
        Ok(())
    }

    /// Current queue sizes.
    pub async fn stats(&self) -> Result<QueueStats> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(Command::Stats { reply: reply_tx })
            .await
            .map_err(|_| anyhow::anyhow!("mail orchestrator is not running"))?;
        reply_rx
            .await
            .map_err(|_| anyhow::anyhow!("mail orchestrator is not running"))
    }

    /// Stop the loop. Idempotent. Waits for the in-flight cycle to finish
    /// and for one final queue flush before returning, so no in-memory state
    /// is lost on shutdown.
    pub async fn stop(&self) {
        self.shutdown.cancel();
        let task = self.task.lock().await.take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                tracing::warn!("Mail orchestrator task ended abnormally: {e}");
            }
        }
    }
}

/// The actor that owns the queues and runs the poll cycle.
pub struct MailOrchestrator {
    cfg: MailConfig,
    store: MailStore,
    queues: MailQueues,
    source: Arc<dyn MailSource>,
    router: DeliveryRouter,
    notifier: Arc<dyn DeadLetterNotifier>,
    backoff: BackoffPolicy,
    shutdown: CancellationToken,
    /// Set whenever a queue mutates; cleared by a successful flush. A failed
    /// flush leaves it set so the next cycle retries.
    dirty: bool,
}

impl MailOrchestrator {
    /// Load persisted queues and start the orchestration loop with the
    /// default fixed-delay backoff from `cfg.retry_delay_secs`.
    pub async fn start(
        cfg: MailConfig,
        workspace_dir: &Path,
        source: Arc<dyn MailSource>,
        delivery: Arc<dyn DeliveryAdapter>,
        notifier: Arc<dyn DeadLetterNotifier>,
        hook: Arc<dyn DeliveryHook>,
    ) -> Result<MailHandle> {
        let backoff = fixed_backoff(Duration::from_secs(cfg.retry_delay_secs));
        Self::start_with_backoff(cfg, workspace_dir, source, delivery, notifier, hook, backoff)
            .await
    }

    /// Like [`MailOrchestrator::start`] with an explicit backoff policy.
    pub async fn start_with_backoff(
        cfg: MailConfig,
        workspace_dir: &Path,
        source: Arc<dyn MailSource>,
        delivery: Arc<dyn DeliveryAdapter>,
        notifier: Arc<dyn DeadLetterNotifier>,
        hook: Arc<dyn DeliveryHook>,
        backoff: BackoffPolicy,
    ) -> Result<MailHandle> {
        let (actor, rx, tx) =
            Self::build(cfg, workspace_dir, source, delivery, notifier, hook, backoff).await?;
        let shutdown = actor.shutdown.clone();
        let task = tokio::spawn(actor.run(rx));
        Ok(MailHandle {
            tx,
            shutdown,
            task: Arc::new(Mutex::new(Some(task))),
        })
    }

    #[allow(clippy::too_many_arguments)]
    async fn build(
        cfg: MailConfig,
        workspace_dir: &Path,
        source: Arc<dyn MailSource>,
        delivery: Arc<dyn DeliveryAdapter>,
        notifier: Arc<dyn DeadLetterNotifier>,
        hook: Arc<dyn DeliveryHook>,
        backoff: BackoffPolicy,
    ) -> Result<(Self, mpsc::Receiver<Command>, mpsc::Sender<Command>)> {
        let store = MailStore::new(workspace_dir);
        // Unreadable persisted state is the one construction-time fatal.
        let queues = store
            .load_all()
            .await
            .context("Failed to load persisted mail queues")?;
        tracing::info!(
            inbound = queues.inbound.len(),
            outbound = queues.outbound.len(),
            dead_letter = queues.dead_letter.len(),
            "Mail queues loaded"
        );

        let router = DeliveryRouter::new(
            delivery,
            hook,
            Duration::from_secs(cfg.delivery_timeout_secs),
        );
        let (tx, rx) = mpsc::channel(COMMAND_BUFFER);
        let actor = Self {
            cfg,
            store,
            queues,
            source,
            router,
            notifier,
            backoff,
            shutdown: CancellationToken::new(),
            dirty: false,
        };
        Ok((actor, rx, tx))
    }

    async fn run(mut self, mut rx: mpsc::Receiver<Command>) {
        let shutdown = self.shutdown.clone();
        let mut interval = time::interval(Duration::from_secs(self.cfg.poll_interval_secs));
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut commands_open = true;

        loop {
            tokio::select! {
                _ = interval.tick() => self.run_cycle().await,
                cmd = rx.recv(), if commands_open => match cmd {
                    Some(cmd) => self.handle_command(cmd),
                    None => commands_open = false,
                },
                () = shutdown.cancelled() => break,
            }
        }

        // Accept anything already sitting in the channel, then flush.
        while let Ok(cmd) = rx.try_recv() {
            self.handle_command(cmd);
        }
        self.flush(true).await;
        tracing::info!("Mail orchestrator stopped");
    }

    fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Enqueue { message, reply } => {
                let accepted = !self.queues.contains(&message.id);
                if accepted {
                    self.queues.inbound.push(QueuedMessage::new(message));
                    self.dirty = true;
                }
                let _ = reply.send(accepted);
            }
            Command::Stats { reply } => {
                let _ = reply.send(self.queues.stats());
            }
        }
    }

    /// One poll cycle: scan, deliver in priority order, sweep retries,
    /// flush. Per-message errors never abort the cycle.
    async fn run_cycle(&mut self) {
        self.scan_source().await;
        self.deliver_inbound().await;
        self.retry_sweep();
        self.flush(false).await;
    }

    async fn scan_source(&mut self) {
        let pending = match self.source.fetch_pending().await {
            Ok(pending) => pending,
            Err(e) => {
                // Skip this cycle's scan; queued work still progresses.
                tracing::warn!("Mail source scan failed: {e}");
                return;
            }
        };

        // fetch_limit bounds messages accepted, so passive or duplicate
        // entries earlier in the batch cannot starve qualifying mail.
        let mut accepted = 0usize;
        for msg in pending {
            if accepted == self.cfg.fetch_limit {
                break;
            }
            if !needs_orchestration(&msg) {
                continue;
            }
            if self.queues.contains(&msg.id) {
                continue;
            }
            tracing::debug!(
                "Queueing mail '{}' ({} → {}, {})",
                msg.id,
                msg.from,
                msg.to,
                msg.priority.as_str()
            );
            self.queues.inbound.push(QueuedMessage::new(msg));
            self.dirty = true;
            accepted += 1;
        }
    }

    async fn deliver_inbound(&mut self) {
        if self.queues.inbound.is_empty() {
            return;
        }
        sort_by_priority(&mut self.queues.inbound);

        let batch = std::mem::take(&mut self.queues.inbound);
        for mut qm in batch {
            match self.router.deliver(&qm).await {
                DeliveryOutcome::Delivered => {
                    tracing::debug!("Delivered mail '{}' to '{}'", qm.id(), qm.message.to);
                    self.dirty = true;
                }
                DeliveryOutcome::Retryable(err) => {
                    tracing::debug!("Delivery of '{}' failed: {err}", qm.id());
                    match self.handle_failure(&mut qm) {
                        QueueKind::Outbound => self.queues.outbound.push(qm),
                        _ => self.move_to_dead_letter(qm).await,
                    }
                    self.dirty = true;
                }
                DeliveryOutcome::Permanent(err) => {
                    tracing::warn!("Permanent delivery failure for '{}': {err}", qm.id());
                    self.move_to_dead_letter(qm).await;
                    self.dirty = true;
                }
            }
        }
    }

    /// Sole mutator of attempt bookkeeping. Returns the queue the message
    /// routes to after a retryable failure.
    fn handle_failure(&self, qm: &mut QueuedMessage) -> QueueKind {
        qm.attempts += 1;
        qm.last_attempt = Some(Utc::now());
        if qm.attempts < self.cfg.max_retries {
            QueueKind::Outbound
        } else {
            QueueKind::DeadLetter
        }
    }

    /// Move outbound entries whose backoff window has elapsed back to
    /// inbound for the next delivery pass. Ineligible entries stay put.
    fn retry_sweep(&mut self) {
        let now = Utc::now();
        let mut waiting = Vec::with_capacity(self.queues.outbound.len());
        for qm in std::mem::take(&mut self.queues.outbound) {
            let wait = (self.backoff)(qm.attempts);
            let eligible = match qm.last_attempt {
                Some(last) => now
                    .signed_duration_since(last)
                    .to_std()
                    .is_ok_and(|elapsed| elapsed >= wait),
                None => true,
            };
            if eligible {
                tracing::debug!(
                    "Requeueing '{}' for retry (attempt {})",
                    qm.id(),
                    qm.attempts + 1
                );
                self.queues.inbound.push(qm);
                self.dirty = true;
            } else {
                waiting.push(qm);
            }
        }
        self.queues.outbound = waiting;
    }

    /// Retire a message to the terminal dead-letter queue. The external
    /// mark is best-effort; the in-memory queue is authoritative.
    async fn move_to_dead_letter(&mut self, qm: QueuedMessage) {
        let id = qm.id().to_string();
        tracing::warn!("Mail '{id}' dead-lettered after {} attempts", qm.attempts);
        self.queues.dead_letter.push(qm);

        let mark = self.notifier.mark_dead_letter(&id);
        match time::timeout(Duration::from_secs(NOTIFIER_TIMEOUT_SECS), mark).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!("Dead-letter mark failed for '{id}': {e}"),
            Err(_) => tracing::warn!("Dead-letter mark timed out for '{id}'"),
        }
    }

    async fn flush(&mut self, final_flush: bool) {
        if !self.dirty && !final_flush {
            return;
        }
        match self.store.save_all(&self.queues).await {
            Ok(()) => self.dirty = false,
            Err(e) => {
                // In-memory state stays authoritative; retried next cycle.
                tracing::warn!("Mail queue flush failed: {e}");
            }
        }
    }
}
