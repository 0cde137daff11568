//! Delivery routing: one attempt per call, reported as a tagged outcome.

use crate::mail::traits::{DeliveryAdapter, DeliveryHook};
use crate::mail::{validate_address, DeliveryError, DeliveryMode, DeliveryOutcome, Message, QueuedMessage};
use crate::util::truncate_with_ellipsis;
use std::sync::Arc;
use tokio::time::{self, Duration};

/// Event name fired on the hook after a confirmed delivery.
pub const MAIL_RECEIVED_EVENT: &str = "mail-received";

const NOTIFICATION_PREVIEW_CHARS: usize = 120;
const HOOK_TIMEOUT_SECS: u64 = 5;

/// Maps a message's addressing and delivery mode to a concrete delivery
/// action against the session layer.
///
/// Every attempt is bounded by `attempt_timeout` so one unresponsive
/// destination cannot stall the whole poll cycle; a timed-out attempt is a
/// retryable failure.
pub struct DeliveryRouter {
    adapter: Arc<dyn DeliveryAdapter>,
    hook: Arc<dyn DeliveryHook>,
    attempt_timeout: Duration,
}

impl DeliveryRouter {
    pub fn new(
        adapter: Arc<dyn DeliveryAdapter>,
        hook: Arc<dyn DeliveryHook>,
        attempt_timeout: Duration,
    ) -> Self {
        Self {
            adapter,
            hook,
            attempt_timeout,
        }
    }

    /// Perform one delivery attempt.
    ///
    /// On success the best-effort hook fires before returning; hook failures
    /// are logged and never change the outcome.
    pub async fn deliver(&self, qm: &QueuedMessage) -> DeliveryOutcome {
        let msg = &qm.message;
        if let Err(e) = validate_address(&msg.to) {
            return DeliveryOutcome::Permanent(e);
        }

        let outcome = match time::timeout(self.attempt_timeout, self.attempt(msg)).await {
            Ok(outcome) => outcome,
            Err(_) => DeliveryOutcome::Retryable(DeliveryError::Timeout {
                to: msg.to.clone(),
                seconds: self.attempt_timeout.as_secs(),
            }),
        };

        if outcome == DeliveryOutcome::Delivered {
            self.fire_hook(msg).await;
        }
        outcome
    }

    async fn attempt(&self, msg: &Message) -> DeliveryOutcome {
        let sessions = match self.adapter.resolve_address(&msg.to).await {
            Ok(sessions) => sessions,
            Err(e) => {
                return DeliveryOutcome::Retryable(DeliveryError::ResolutionFailed {
                    to: msg.to.clone(),
                    reason: e.to_string(),
                })
            }
        };

        if sessions.is_empty() {
            // The recipient may come online later; keep retrying.
            return DeliveryOutcome::Retryable(DeliveryError::RecipientUnavailable {
                to: msg.to.clone(),
            });
        }

        for session in &sessions {
            let result = match msg.delivery {
                DeliveryMode::Interrupt => {
                    self.adapter
                        .inject_interrupt(session, &interrupt_content(msg))
                        .await
                }
                DeliveryMode::Queue => {
                    self.adapter
                        .queue_notification(session, &notification_content(msg))
                        .await
                }
            };
            if let Err(e) = result {
                return DeliveryOutcome::Retryable(DeliveryError::InjectionFailed {
                    session: session.clone(),
                    reason: e.to_string(),
                });
            }
        }

        DeliveryOutcome::Delivered
    }

    async fn fire_hook(&self, msg: &Message) {
        let metadata = serde_json::json!({
            "message_id": msg.id,
            "from": msg.from,
            "to": msg.to,
            "subject": msg.subject,
            "priority": msg.priority.as_str(),
            "delivery": msg.delivery.as_str(),
        });

        let notify = self.hook.notify(MAIL_RECEIVED_EVENT, metadata);
        match time::timeout(Duration::from_secs(HOOK_TIMEOUT_SECS), notify).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!("Mail hook failed for '{}': {e}", msg.id),
            Err(_) => tracing::warn!("Mail hook timed out for '{}'", msg.id),
        }
    }
}

fn interrupt_content(msg: &Message) -> String {
    format!("[mail from {}] {}\n\n{}", msg.from, msg.subject, msg.body)
}

fn notification_content(msg: &Message) -> String {
    format!(
        "New mail from {}: {} — {}",
        msg.from,
        msg.subject,
        truncate_with_ellipsis(&msg.body, NOTIFICATION_PREVIEW_CHARS)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mail::traits::{NoopHook, SessionId};
    use async_trait::async_trait;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct StubAdapter {
        sessions: Vec<SessionId>,
        resolve_error: bool,
        inject_error: bool,
        delay: Option<Duration>,
        injected: Mutex<Vec<(SessionId, String)>>,
        notified: Mutex<Vec<(SessionId, String)>>,
    }

    #[async_trait]
    impl DeliveryAdapter for StubAdapter {
        async fn resolve_address(&self, to: &str) -> anyhow::Result<Vec<SessionId>> {
            if let Some(delay) = self.delay {
                time::sleep(delay).await;
            }
            if self.resolve_error {
                anyhow::bail!("resolver offline for {to}");
            }
            Ok(self.sessions.clone())
        }

        async fn inject_interrupt(&self, session: &SessionId, content: &str) -> anyhow::Result<()> {
            if self.inject_error {
                anyhow::bail!("pane unreachable");
            }
            self.injected.lock().push((session.clone(), content.to_string()));
            Ok(())
        }

        async fn queue_notification(
            &self,
            session: &SessionId,
            content: &str,
        ) -> anyhow::Result<()> {
            if self.inject_error {
                anyhow::bail!("notification write failed");
            }
            self.notified.lock().push((session.clone(), content.to_string()));
            Ok(())
        }
    }

    #[derive(Default)]
    struct RecordingHook {
        events: Mutex<Vec<(String, serde_json::Value)>>,
        fail: bool,
    }

    #[async_trait]
    impl DeliveryHook for RecordingHook {
        async fn notify(&self, event: &str, metadata: serde_json::Value) -> anyhow::Result<()> {
            if self.fail {
                anyhow::bail!("hook script exited 1");
            }
            self.events.lock().push((event.to_string(), metadata));
            Ok(())
        }
    }

    fn router_with(adapter: StubAdapter) -> DeliveryRouter {
        DeliveryRouter::new(
            Arc::new(adapter),
            Arc::new(NoopHook),
            Duration::from_secs(5),
        )
    }

    fn interrupt_msg() -> QueuedMessage {
        QueuedMessage::new(
            Message::new("mayor", "refinery/crew/max", "deploy", "ship it")
                .with_delivery(DeliveryMode::Interrupt),
        )
    }

    fn queue_msg() -> QueuedMessage {
        QueuedMessage::new(Message::new("mayor", "refinery/crew/max", "fyi", "later"))
    }

    #[tokio::test]
    async fn malformed_address_is_permanent() {
        let router = router_with(StubAdapter::default());
        let mut qm = queue_msg();
        qm.message.to = "bad address".into();

        let outcome = router.deliver(&qm).await;
        assert!(matches!(
            outcome,
            DeliveryOutcome::Permanent(DeliveryError::MalformedAddress { .. })
        ));
    }

    #[tokio::test]
    async fn unresolved_recipient_is_retryable() {
        let router = router_with(StubAdapter::default());
        let outcome = router.deliver(&queue_msg()).await;
        assert!(matches!(
            outcome,
            DeliveryOutcome::Retryable(DeliveryError::RecipientUnavailable { .. })
        ));
    }

    #[tokio::test]
    async fn resolver_failure_is_retryable() {
        let router = router_with(StubAdapter {
            resolve_error: true,
            ..StubAdapter::default()
        });
        let outcome = router.deliver(&queue_msg()).await;
        assert!(matches!(
            outcome,
            DeliveryOutcome::Retryable(DeliveryError::ResolutionFailed { .. })
        ));
    }

    #[tokio::test]
    async fn injection_failure_is_retryable() {
        let router = router_with(StubAdapter {
            sessions: vec!["sess-1".into()],
            inject_error: true,
            ..StubAdapter::default()
        });
        let outcome = router.deliver(&interrupt_msg()).await;
        assert!(matches!(
            outcome,
            DeliveryOutcome::Retryable(DeliveryError::InjectionFailed { .. })
        ));
    }

    #[tokio::test]
    async fn interrupt_delivery_injects_into_every_session() {
        let adapter = Arc::new(StubAdapter {
            sessions: vec!["sess-1".into(), "sess-2".into()],
            ..StubAdapter::default()
        });
        let router = DeliveryRouter::new(
            adapter.clone(),
            Arc::new(NoopHook),
            Duration::from_secs(5),
        );

        let outcome = router.deliver(&interrupt_msg()).await;
        assert_eq!(outcome, DeliveryOutcome::Delivered);

        let injected = adapter.injected.lock();
        assert_eq!(injected.len(), 2);
        assert!(injected[0].1.contains("[mail from mayor] deploy"));
        assert!(injected[0].1.contains("ship it"));
    }

    #[tokio::test]
    async fn queue_delivery_leaves_notification_with_preview() {
        let adapter = Arc::new(StubAdapter {
            sessions: vec!["sess-1".into()],
            ..StubAdapter::default()
        });
        let router = DeliveryRouter::new(
            adapter.clone(),
            Arc::new(NoopHook),
            Duration::from_secs(5),
        );

        let mut qm = queue_msg();
        qm.message.body = "b".repeat(500);
        let outcome = router.deliver(&qm).await;
        assert_eq!(outcome, DeliveryOutcome::Delivered);

        let notified = adapter.notified.lock();
        assert_eq!(notified.len(), 1);
        assert!(notified[0].1.ends_with("..."));
        assert!(notified[0].1.starts_with("New mail from mayor: fyi"));
    }

    #[tokio::test]
    async fn slow_adapter_times_out_as_retryable() {
        let router = DeliveryRouter::new(
            Arc::new(StubAdapter {
                sessions: vec!["sess-1".into()],
                delay: Some(Duration::from_secs(60)),
                ..StubAdapter::default()
            }),
            Arc::new(NoopHook),
            Duration::from_millis(20),
        );

        let outcome = router.deliver(&queue_msg()).await;
        assert!(matches!(
            outcome,
            DeliveryOutcome::Retryable(DeliveryError::Timeout { .. })
        ));
    }

    #[tokio::test]
    async fn hook_fires_with_message_metadata_on_success() {
        let hook = Arc::new(RecordingHook::default());
        let router = DeliveryRouter::new(
            Arc::new(StubAdapter {
                sessions: vec!["sess-1".into()],
                ..StubAdapter::default()
            }),
            hook.clone(),
            Duration::from_secs(5),
        );

        let qm = interrupt_msg();
        assert_eq!(router.deliver(&qm).await, DeliveryOutcome::Delivered);

        let events = hook.events.lock();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].0, MAIL_RECEIVED_EVENT);
        assert_eq!(events[0].1["message_id"], qm.message.id);
        assert_eq!(events[0].1["priority"], "normal");
    }

    #[tokio::test]
    async fn hook_failure_does_not_change_the_outcome() {
        let router = DeliveryRouter::new(
            Arc::new(StubAdapter {
                sessions: vec!["sess-1".into()],
                ..StubAdapter::default()
            }),
            Arc::new(RecordingHook {
                fail: true,
                ..RecordingHook::default()
            }),
            Duration::from_secs(5),
        );

        assert_eq!(router.deliver(&queue_msg()).await, DeliveryOutcome::Delivered);
    }

    #[tokio::test]
    async fn hook_does_not_fire_on_failure() {
        let hook = Arc::new(RecordingHook::default());
        let router = DeliveryRouter::new(
            Arc::new(StubAdapter::default()),
            hook.clone(),
            Duration::from_secs(5),
        );

        let _ = router.deliver(&queue_msg()).await;
        assert!(hook.events.lock().is_empty());
    }
}
