use crate::credits::{
    error::CreditsErrorKind,
    types::{ApplyOutcome, MutationKind, OperationId},
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileTrigger {
    Manual,
    Periodic,
    SessionStart,
    OpaqueResponse { path: String },
    MissingInlineHint { path: String },
    NegativeValue,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEndReason {
    Unauthorized,
    Logout,
}

#[derive(Debug, Clone)]
pub enum CreditsTelemetryEvent {
    InlineHintObserved {
        path: String,
        value: i64,
        outcome: ApplyOutcome,
    },
    ReconcileStarted {
        trigger: ReconcileTrigger,
    },
    ReconcileJoined {
        trigger: ReconcileTrigger,
    },
    ReconcileCompleted {
        value: i64,
        outcome: ApplyOutcome,
    },
    ReconcileFailed {
        trigger: ReconcileTrigger,
        kind: CreditsErrorKind,
        message: String,
    },
    MutationStarted {
        kind: MutationKind,
        amount: u64,
        operation_id: Option<OperationId>,
    },
    MutationConfirmed {
        kind: MutationKind,
        amount: u64,
        confirmed: i64,
        outcome: Option<ApplyOutcome>,
    },
    MutationFailed {
        kind: MutationKind,
        amount: u64,
        error_kind: CreditsErrorKind,
    },
    SessionStarted {
        session: u64,
    },
    SessionEnded {
        reason: SessionEndReason,
        endpoint: Option<String>,
    },
}

pub trait TelemetrySink: Send + Sync {
    fn on_event(&self, event: CreditsTelemetryEvent);
}

#[derive(Default)]
pub struct NoopTelemetrySink;

impl TelemetrySink for NoopTelemetrySink {
    fn on_event(&self, _event: CreditsTelemetryEvent) {}
}

#[derive(Default)]
pub struct TracingTelemetrySink;

impl TelemetrySink for TracingTelemetrySink {
    fn on_event(&self, event: CreditsTelemetryEvent) {
        match event {
            CreditsTelemetryEvent::InlineHintObserved {
                path,
                value,
                outcome,
            } => {
                tracing::debug!(
                    target: "credits",
                    path = %path,
                    value = value,
                    outcome = ?outcome,
                    "inline_hint_observed"
                );
            }
            CreditsTelemetryEvent::ReconcileStarted { trigger } => {
                tracing::debug!(target: "credits", trigger = ?trigger, "reconcile_started");
            }
            CreditsTelemetryEvent::ReconcileJoined { trigger } => {
                tracing::debug!(target: "credits", trigger = ?trigger, "reconcile_joined");
            }
            CreditsTelemetryEvent::ReconcileCompleted { value, outcome } => {
                tracing::info!(
                    target: "credits",
                    value = value,
                    outcome = ?outcome,
                    "reconcile_completed"
                );
            }
            CreditsTelemetryEvent::ReconcileFailed {
                trigger,
                kind,
                message,
            } => {
                tracing::warn!(
                    target: "credits",
                    trigger = ?trigger,
                    kind = ?kind,
                    error = %message,
                    "reconcile_failed"
                );
            }
            CreditsTelemetryEvent::MutationStarted {
                kind,
                amount,
                operation_id,
            } => {
                tracing::debug!(
                    target: "credits",
                    kind = ?kind,
                    amount = amount,
                    operation_id = ?operation_id,
                    "mutation_started"
                );
            }
            CreditsTelemetryEvent::MutationConfirmed {
                kind,
                amount,
                confirmed,
                outcome,
            } => {
                tracing::info!(
                    target: "credits",
                    kind = ?kind,
                    amount = amount,
                    confirmed = confirmed,
                    outcome = ?outcome,
                    "mutation_confirmed"
                );
            }
            CreditsTelemetryEvent::MutationFailed {
                kind,
                amount,
                error_kind,
            } => {
                tracing::warn!(
                    target: "credits",
                    kind = ?kind,
                    amount = amount,
                    error_kind = ?error_kind,
                    "mutation_failed"
                );
            }
            CreditsTelemetryEvent::SessionStarted { session } => {
                tracing::info!(target: "credits", session = session, "session_started");
            }
            CreditsTelemetryEvent::SessionEnded { reason, endpoint } => {
                tracing::warn!(
                    target: "credits",
                    reason = ?reason,
                    endpoint = endpoint.as_deref().unwrap_or("-"),
                    "session_ended"
                );
            }
        }
    }
}
