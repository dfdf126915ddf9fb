//! Audit hooks for state machine diagnostics.
//!
//! Every public operation reports what it did through an
//! [`CacheStateMachineAudit`] sink: before/after markers around state
//! handlers and the outcome of each transition attempt. Sinks are purely
//! observational. A sink that panics is contained and logged; it never
//! interrupts the transition protocol.

use crate::{StateKind, TransactionId};
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};

// ============================================================================
// EVENTS
// ============================================================================

/// Public operation an audit event belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AuditCommand {
    GetCache,
    OnChange,
    BeforeTransactionComplete,
    CompleteTransaction,
    CommitCache,
    InitializationError,
    DropCache,
}

impl AuditCommand {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditCommand::GetCache => "get_cache",
            AuditCommand::OnChange => "on_change",
            AuditCommand::BeforeTransactionComplete => "before_transaction_complete",
            AuditCommand::CompleteTransaction => "complete_transaction",
            AuditCommand::CommitCache => "commit_cache",
            AuditCommand::InitializationError => "initialization_error",
            AuditCommand::DropCache => "drop_cache",
        }
    }
}

impl fmt::Display for AuditCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// What happened inside a command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuditEventKind {
    /// The current state answered without building.
    QuickResult,
    BeforeCreation,
    AfterCreation,
    BeforeOnChange,
    AfterOnChange,
    BeforeCompleteTransaction,
    AfterCompleteTransaction,
    /// The completed transaction was the last tracked dirty one.
    AllTransactionsCompleted,
    BeforeCommit,
    AfterCommit,
    /// A background build finished for a state that is no longer current.
    StaleCommit,
    InitializationError { reason: String },
    /// The command left the current state in place.
    Stayed,
    Switched { from: StateKind, to: StateKind },
    /// Another thread published a state first; the command retries.
    SwitchFailed { from: StateKind, to: StateKind },
    /// A handler broke its contract (missing mandatory transition).
    FatalError { state: StateKind },
}

/// One audit record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditEvent {
    pub command: AuditCommand,
    pub kind: AuditEventKind,
    pub transaction: Option<TransactionId>,
}

impl AuditEvent {
    pub fn is_transition(&self) -> bool {
        matches!(
            self.kind,
            AuditEventKind::Stayed
                | AuditEventKind::Switched { .. }
                | AuditEventKind::SwitchFailed { .. }
        )
    }
}

// ============================================================================
// SINKS
// ============================================================================

/// Observer notified about state machine activity.
pub trait CacheStateMachineAudit: Send + Sync {
    fn on_event(&self, event: &AuditEvent);
}

/// Audit sink that discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopAudit;

impl CacheStateMachineAudit for NoopAudit {
    fn on_event(&self, _event: &AuditEvent) {}
}

/// Default audit sink: forwards events to `tracing`.
#[derive(Debug, Clone, Copy)]
pub struct TracingAudit {
    log_transitions: bool,
}

impl TracingAudit {
    pub fn new(log_transitions: bool) -> Self {
        Self { log_transitions }
    }
}

impl Default for TracingAudit {
    fn default() -> Self {
        Self::new(true)
    }
}

impl CacheStateMachineAudit for TracingAudit {
    fn on_event(&self, event: &AuditEvent) {
        if event.is_transition() && !self.log_transitions {
            return;
        }

        let command = event.command.as_str();
        let tx = event
            .transaction
            .map(|tx| tx.to_string())
            .unwrap_or_default();

        match &event.kind {
            AuditEventKind::FatalError { state } => {
                tracing::warn!(command, tx = %tx, state = %state, "Cache state contract violation");
            }
            AuditEventKind::InitializationError { reason } => {
                tracing::warn!(command, reason = %reason, "Cache initialization failed");
            }
            AuditEventKind::Switched { from, to } => {
                tracing::trace!(command, tx = %tx, from = %from, to = %to, "Cache state switched");
            }
            AuditEventKind::SwitchFailed { from, to } => {
                tracing::trace!(
                    command,
                    tx = %tx,
                    from = %from,
                    to = %to,
                    "Cache state switch lost race"
                );
            }
            other => {
                tracing::trace!(command, tx = %tx, event = ?other, "Cache state machine event");
            }
        }
    }
}

// ============================================================================
// PER-COMMAND HELPER
// ============================================================================

/// Binds a sink to the command being executed.
pub(crate) struct CommandAudit<'a> {
    sink: &'a dyn CacheStateMachineAudit,
    command: AuditCommand,
}

impl<'a> CommandAudit<'a> {
    pub(crate) fn new(sink: &'a dyn CacheStateMachineAudit, command: AuditCommand) -> Self {
        Self { sink, command }
    }

    pub(crate) fn emit(&self, kind: AuditEventKind, transaction: Option<TransactionId>) {
        let event = AuditEvent {
            command: self.command,
            kind,
            transaction,
        };
        if catch_unwind(AssertUnwindSafe(|| self.sink.on_event(&event))).is_err() {
            tracing::error!(command = %self.command, "Audit sink panicked; event dropped");
        }
    }

    pub(crate) fn tx(&self, kind: AuditEventKind, transaction: TransactionId) {
        self.emit(kind, Some(transaction));
    }

    pub(crate) fn stayed(&self, transaction: Option<TransactionId>) {
        self.emit(AuditEventKind::Stayed, transaction);
    }

    pub(crate) fn fatal(&self, state: StateKind, transaction: Option<TransactionId>) {
        self.emit(AuditEventKind::FatalError { state }, transaction);
    }
}
