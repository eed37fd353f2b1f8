use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::{
    error::EventError,
    storage::{AlertSeverity, AlertType},
};

/// Why an identity's block was lifted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnblockReason {
    /// An operator lifted the block
    Manual,
    /// A successful authentication cleared the record
    Success,
}

/// Represents events that can be emitted by the event bus
///
/// Events notify interested parties (audit sinks, dashboards, notification
/// hooks) about security decisions. They never carry secrets, codes or token
/// values.
#[derive(Debug, Clone)]
pub enum Event {
    /// A failure was recorded against a rule.
    AttemptFailed {
        rule_name: String,
        identity_key: String,
        failures: u32,
        timestamp: DateTime<Utc>,
    },

    /// An identity crossed a rule's threshold (or was blocked manually).
    ///
    /// This is a security-critical event that should trigger alerts.
    IdentityBlocked {
        rule_name: String,
        identity_key: String,
        blocked_until: DateTime<Utc>,
        timestamp: DateTime<Utc>,
    },

    IdentityUnblocked {
        rule_name: String,
        identity_key: String,
        reason: UnblockReason,
        timestamp: DateTime<Utc>,
    },

    /// An alert was appended to the security event log.
    AlertRaised {
        alert_id: String,
        alert_type: AlertType,
        severity: AlertSeverity,
        identity: String,
        timestamp: DateTime<Utc>,
    },

    AlertResolved {
        alert_id: String,
        timestamp: DateTime<Utc>,
    },

    // Two-factor lifecycle
    TwoFactorEnrolled {
        account_id: String,
        timestamp: DateTime<Utc>,
    },
    TwoFactorConfirmed {
        account_id: String,
        timestamp: DateTime<Utc>,
    },
    TwoFactorDisabled {
        account_id: String,
        timestamp: DateTime<Utc>,
    },
    BackupCodeRedeemed {
        account_id: String,
        remaining: usize,
        timestamp: DateTime<Utc>,
    },
    SecondFactorFailed {
        account_id: String,
        timestamp: DateTime<Utc>,
    },

    /// A state-changing request carried a missing, stale or forged CSRF token.
    CsrfRejected {
        session_id: String,
        timestamp: DateTime<Utc>,
    },
}

/// A trait for handling events emitted by the event bus
///
/// Implementors of this trait can be registered with the [`EventBus`] to receive and process events.
///
/// # Examples
///
/// ```
/// # use rampart_core::events::{Event, EventHandler};
/// # use rampart_core::error::EventError;
/// # use async_trait::async_trait;
/// struct AuditLog;
///
/// #[async_trait]
/// impl EventHandler for AuditLog {
///     async fn handle_event(&self, event: &Event) -> Result<(), EventError> {
///         println!("{event:?}");
///         Ok(())
///     }
/// }
/// ```
#[async_trait]
pub trait EventHandler: Send + Sync + 'static {
    async fn handle_event(&self, event: &Event) -> Result<(), EventError>;
}

/// Event bus that can emit events and register event handlers
#[derive(Clone)]
pub struct EventBus {
    handlers: Arc<RwLock<Vec<Arc<dyn EventHandler>>>>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            handlers: Arc::new(RwLock::new(Vec::new())),
        }
    }

    /// Register an event handler with the event bus
    pub async fn register(&self, handler: Arc<dyn EventHandler>) {
        self.handlers.write().await.push(handler);
    }

    pub async fn handler_count(&self) -> usize {
        self.handlers.read().await.len()
    }

    /// Emit an event to all registered handlers, stopping at the first error.
    pub async fn emit(&self, event: &Event) -> Result<(), EventError> {
        for handler in self.handlers.read().await.iter() {
            handler.handle_event(event).await?;
        }

        Ok(())
    }

    /// Emit an event from a security decision path.
    ///
    /// Every handler runs. Handler failures are logged and swallowed so that
    /// a broken audit sink cannot turn a deny into an allow or vice versa.
    pub async fn publish(&self, event: Event) {
        for handler in self.handlers.read().await.iter() {
            if let Err(e) = handler.handle_event(&event).await {
                tracing::warn!(error = %e, ?event, "Security event handler failed");
            }
        }
    }
}
