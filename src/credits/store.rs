use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::{Instant, SystemTime},
};

use tokio::sync::watch;

use crate::credits::types::{
    ApplyOutcome, Balance, BalanceSource, BalanceUpdate, OperationId, RequestStamp,
};

/// Process-wide owner of the credits balance.
///
/// Every write goes through a single `watch` critical section, so concurrent
/// tasks observe applies in one total order. Readers get snapshots or a
/// change-notifying receiver, never a mutable reference.
#[derive(Clone)]
pub struct BalanceStore {
    tx: Arc<watch::Sender<Balance>>,
    next_operation: Arc<AtomicU64>,
}

/// Handle for one mutation's optimistic offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OptimisticTicket {
    pub operation_id: OperationId,
    pub session: u64,
    pub offset: i64,
}

impl BalanceStore {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(Balance::unknown());
        Self {
            tx: Arc::new(tx),
            next_operation: Arc::new(AtomicU64::new(1)),
        }
    }

    pub fn read(&self) -> Balance {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Balance> {
        self.tx.subscribe()
    }

    pub fn stamp(&self) -> RequestStamp {
        let balance = self.tx.borrow();
        RequestStamp {
            session: balance.session,
            barrier: balance.barrier,
            started_at: Instant::now(),
        }
    }

    pub fn apply(&self, update: BalanceUpdate) -> ApplyOutcome {
        self.apply_inner(update, None)
    }

    /// Applies a mutation's confirmation and drops its optimistic offset in
    /// the same step, so readers never see both at once.
    pub fn apply_settling(&self, update: BalanceUpdate, ticket: &OptimisticTicket) -> ApplyOutcome {
        self.apply_inner(update, Some(ticket))
    }

    fn apply_inner(&self, update: BalanceUpdate, ticket: Option<&OptimisticTicket>) -> ApplyOutcome {
        let mut outcome = ApplyOutcome::Stale;
        self.tx.send_if_modified(|balance| {
            let settled = ticket.is_some_and(|ticket| {
                balance
                    .optimistic_slots
                    .remove(&ticket.operation_id)
                    .is_some()
            });
            if settled {
                balance.recompute_pending();
            }
            outcome = apply_update(balance, &update, SystemTime::now());
            settled || outcome.is_applied()
        });

        match outcome {
            ApplyOutcome::Applied { sequence } => {
                tracing::debug!(
                    target: "credits",
                    source = ?update.source,
                    value = ?update.value,
                    sequence = sequence,
                    "balance_applied"
                );
            }
            ApplyOutcome::Stale => {
                tracing::debug!(
                    target: "credits",
                    source = ?update.source,
                    value = ?update.value,
                    "balance_update_stale"
                );
            }
            ApplyOutcome::RejectedNegative => {
                tracing::warn!(
                    target: "credits",
                    source = ?update.source,
                    value = ?update.value,
                    "balance_update_negative"
                );
            }
        }

        outcome
    }

    pub fn reset(&self) -> ApplyOutcome {
        self.apply(BalanceUpdate::reset())
    }

    /// Registers a provisional offset shown until the mutation settles.
    /// Does not touch `sequence`, but makes inline hints from requests sent
    /// before this point stale.
    pub fn begin_optimistic(&self, offset: i64) -> OptimisticTicket {
        let operation_id = self.next_operation.fetch_add(1, Ordering::Relaxed);
        let mut session = 0;
        self.tx.send_modify(|balance| {
            balance.optimistic_slots.insert(operation_id, offset);
            balance.barrier += 1;
            balance.recompute_pending();
            session = balance.session;
        });

        OptimisticTicket {
            operation_id,
            session,
            offset,
        }
    }

    /// Drops the ticket's offset. Returns `false` when it was already gone,
    /// e.g. because the session was reset meanwhile.
    pub fn settle_optimistic(&self, ticket: &OptimisticTicket) -> bool {
        self.tx.send_if_modified(|balance| {
            if balance
                .optimistic_slots
                .remove(&ticket.operation_id)
                .is_none()
            {
                return false;
            }
            balance.recompute_pending();
            true
        })
    }
}

impl Default for BalanceStore {
    fn default() -> Self {
        Self::new()
    }
}

fn apply_update(balance: &mut Balance, update: &BalanceUpdate, now: SystemTime) -> ApplyOutcome {
    if let Some(stamp) = &update.happens_after
        && stamp.session != balance.session
    {
        return ApplyOutcome::Stale;
    }

    if update.source == BalanceSource::Reset {
        balance.value = None;
        balance.sequence += 1;
        balance.source = Some(BalanceSource::Reset);
        balance.last_applied_at = Some(now);
        balance.session += 1;
        balance.barrier += 1;
        balance.optimistic_slots.clear();
        balance.recompute_pending();
        return ApplyOutcome::Applied {
            sequence: balance.sequence,
        };
    }

    if update.source == BalanceSource::Inline {
        let Some(stamp) = &update.happens_after else {
            return ApplyOutcome::Stale;
        };
        if stamp.barrier != balance.barrier || balance.value.is_none() {
            return ApplyOutcome::Stale;
        }
    }

    let Some(value) = update.value else {
        return ApplyOutcome::Stale;
    };
    let Ok(value) = u64::try_from(value) else {
        return ApplyOutcome::RejectedNegative;
    };

    balance.value = Some(value);
    balance.sequence += 1;
    balance.source = Some(update.source);
    balance.last_applied_at = Some(now);
    if update.source.is_ground_truth() {
        balance.barrier += 1;
    }

    ApplyOutcome::Applied {
        sequence: balance.sequence,
    }
}
