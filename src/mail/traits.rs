use super::Message;
use async_trait::async_trait;

/// Identifier for a running agent session, as issued by the session layer.
pub type SessionId = String;

/// Supplies candidate messages awaiting delivery.
///
/// Backed by the issue store in production. Must be a non-destructive read:
/// the orchestrator calls it every poll cycle and deduplicates against its
/// own queues.
#[async_trait]
pub trait MailSource: Send + Sync {
    async fn fetch_pending(&self) -> anyhow::Result<Vec<Message>>;
}

/// Maps an opaque recipient address onto live sessions and performs the
/// actual hand-off.
///
/// Implementations must be `Send + Sync`; the orchestrator shares the
/// adapter across async tasks on the Tokio runtime.
#[async_trait]
pub trait DeliveryAdapter: Send + Sync {
    /// Resolve an address to zero or more active sessions. An empty result
    /// means the recipient is not currently reachable, not that the address
    /// is invalid.
    async fn resolve_address(&self, to: &str) -> anyhow::Result<Vec<SessionId>>;

    /// Synchronously inject content into a live session (interrupt delivery).
    async fn inject_interrupt(&self, session: &SessionId, content: &str) -> anyhow::Result<()>;

    /// Leave a non-blocking notification for the session to discover later
    /// (queue delivery).
    async fn queue_notification(&self, session: &SessionId, content: &str) -> anyhow::Result<()>;
}

/// Narrow capability for flagging permanently failed messages in the
/// external store. Best-effort: the in-memory dead-letter queue stays
/// authoritative whether or not this call lands.
#[async_trait]
pub trait DeadLetterNotifier: Send + Sync {
    async fn mark_dead_letter(&self, message_id: &str) -> anyhow::Result<()>;
}

/// Best-effort side notification fired after a confirmed delivery, consumed
/// by external lifecycle automation. Failures are logged, never propagated.
#[async_trait]
pub trait DeliveryHook: Send + Sync {
    async fn notify(&self, event: &str, metadata: serde_json::Value) -> anyhow::Result<()>;
}

/// No-op notifier for deployments without an external store.
pub struct NoopNotifier;

#[async_trait]
impl DeadLetterNotifier for NoopNotifier {
    async fn mark_dead_letter(&self, _message_id: &str) -> anyhow::Result<()> {
        Ok(())
    }
}

/// No-op hook for deployments without lifecycle automation.
pub struct NoopHook;

#[async_trait]
impl DeliveryHook for NoopHook {
    async fn notify(&self, _event: &str, _metadata: serde_json::Value) -> anyhow::Result<()> {
        Ok(())
    }
}
