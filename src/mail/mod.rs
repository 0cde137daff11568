//! Inter-agent mail: message types, priority scheduling, and the
//! orchestration daemon that delivers time-sensitive traffic.

pub mod orchestrator;
pub mod router;
pub mod spool;
pub mod store;
pub mod traits;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use thiserror::Error;
use uuid::Uuid;

/// Message priority, ordered from least to most urgent.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Urgent,
}

impl Priority {
    /// Scheduling weight. Higher weight is attempted first.
    pub fn weight(self) -> u8 {
        match self {
            Priority::Low => 0,
            Priority::Normal => 1,
            Priority::High => 2,
            Priority::Urgent => 3,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::Normal => "normal",
            Priority::High => "high",
            Priority::Urgent => "urgent",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.to_ascii_lowercase().as_str() {
            "low" => Some(Priority::Low),
            "normal" => Some(Priority::Normal),
            "high" => Some(Priority::High),
            "urgent" => Some(Priority::Urgent),
            _ => None,
        }
    }
}

/// How a message reaches its recipient.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryMode {
    /// Leave a passive notification the agent discovers on its own schedule.
    #[default]
    Queue,
    /// Inject the message content into the agent's live session immediately.
    Interrupt,
}

impl DeliveryMode {
    pub fn as_str(self) -> &'static str {
        match self {
            DeliveryMode::Queue => "queue",
            DeliveryMode::Interrupt => "interrupt",
        }
    }
}

/// A mail message between agents or supervisory roles.
///
/// The payload is immutable once created; orchestration bookkeeping lives on
/// [`QueuedMessage`]. Addresses are opaque strings resolved by the delivery
/// adapter.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub id: String,
    pub from: String,
    pub to: String,
    pub subject: String,
    pub body: String,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub delivery: DeliveryMode,
    pub created_at: DateTime<Utc>,
}

impl Message {
    pub fn new(
        from: impl Into<String>,
        to: impl Into<String>,
        subject: impl Into<String>,
        body: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            from: from.into(),
            to: to.into(),
            subject: subject.into(),
            body: body.into(),
            priority: Priority::Normal,
            delivery: DeliveryMode::Queue,
            created_at: Utc::now(),
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_delivery(mut self, delivery: DeliveryMode) -> Self {
        self.delivery = delivery;
        self
    }
}

/// A [`Message`] wrapped with delivery bookkeeping while it sits in a queue.
///
/// `attempts` and `last_attempt` are mutated only by the orchestrator's
/// failure handler; everything else is set once at enqueue time.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueuedMessage {
    pub message: Message,
    pub queued_at: DateTime<Utc>,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default)]
    pub last_attempt: Option<DateTime<Utc>>,
}

impl QueuedMessage {
    pub fn new(message: Message) -> Self {
        Self {
            message,
            queued_at: Utc::now(),
            attempts: 0,
            last_attempt: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.message.id
    }
}

/// The three queues a live message can occupy. A message id is in at most
/// one of them at any instant.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum QueueKind {
    Inbound,
    Outbound,
    DeadLetter,
}

impl QueueKind {
    pub fn as_str(self) -> &'static str {
        match self {
            QueueKind::Inbound => "inbound",
            QueueKind::Outbound => "outbound",
            QueueKind::DeadLetter => "dead-letter",
        }
    }
}

/// Decide whether a message needs active orchestration.
///
/// Only interrupt deliveries and high/urgent traffic are driven by the
/// daemon; everything else is discovered through normal polling, which keeps
/// the daemon's working set bounded to time-sensitive mail.
pub fn needs_orchestration(msg: &Message) -> bool {
    msg.delivery == DeliveryMode::Interrupt || msg.priority >= Priority::High
}

/// Stable sort by descending priority weight.
///
/// Stability is load-bearing: messages sharing a priority keep their enqueue
/// order, which is what gives FIFO-within-class delivery. `sort_by_key` is
/// guaranteed stable by the standard library.
pub fn sort_by_priority(msgs: &mut [QueuedMessage]) {
    msgs.sort_by_key(|qm| Reverse(qm.message.priority.weight()));
}

/// Why a delivery attempt did not land.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DeliveryError {
    #[error("malformed recipient address '{to}'")]
    MalformedAddress { to: String },

    #[error("no active session for recipient '{to}'")]
    RecipientUnavailable { to: String },

    #[error("address resolution for '{to}' failed: {reason}")]
    ResolutionFailed { to: String, reason: String },

    #[error("delivery to session '{session}' failed: {reason}")]
    InjectionFailed { session: String, reason: String },

    #[error("delivery to '{to}' timed out after {seconds}s")]
    Timeout { to: String, seconds: u64 },
}

/// Result of one delivery attempt.
///
/// Retry-vs-dead-letter routing is an exhaustive match on this enum rather
/// than error-string inspection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Delivered,
    /// Transient failure; the message goes through retry accounting.
    Retryable(DeliveryError),
    /// The message can never be delivered; it is dead-lettered immediately.
    Permanent(DeliveryError),
}

/// Validate the transport contract for a recipient address.
///
/// Addresses are opaque to the daemon but must be non-empty and free of
/// whitespace and control characters; anything else is a permanent failure.
pub fn validate_address(to: &str) -> Result<(), DeliveryError> {
    if to.is_empty()
        || to
            .chars()
            .any(|c| c.is_whitespace() || c.is_control())
    {
        return Err(DeliveryError::MalformedAddress { to: to.to_string() });
    }
    Ok(())
}
