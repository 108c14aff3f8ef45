use std::{
    future::Future,
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
};

use futures_util::{
    FutureExt,
    future::{BoxFuture, Shared},
};

use crate::credits::{
    client::CreditsClient,
    error::{CreditsError, CreditsErrorKind, map_http_error, protocol_violation},
    inline::parse_balance_value,
    telemetry::{CreditsTelemetryEvent, ReconcileTrigger},
    types::{ApiRequest, ApplyOutcome, Balance, BalanceUpdate},
};

type PullFuture = Shared<BoxFuture<'static, Result<Balance, CreditsError>>>;

struct InFlightPull {
    id: u64,
    session: u64,
    future: PullFuture,
}

/// Collapses concurrent pulls onto one outstanding request.
///
/// The slot is cleared by the pull itself as it completes, so a caller
/// arriving afterwards always starts a fresh request. A pull left over from
/// an earlier session is never joined; it is replaced and finishes unobserved.
#[derive(Clone, Default)]
pub struct PullReconciler {
    slot: Arc<Mutex<Option<InFlightPull>>>,
    next_id: Arc<AtomicU64>,
}

impl PullReconciler {
    /// Returns the pending pull for `session`, or installs the one built by
    /// `start`. The flag is `true` when the caller joined an existing pull.
    pub fn join_or_start<F, Fut>(&self, session: u64, start: F) -> (PullFuture, bool)
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Balance, CreditsError>> + Send + 'static,
    {
        let mut slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(in_flight) = slot.as_ref()
            && in_flight.session == session
        {
            return (in_flight.future.clone(), true);
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let fetch = start();
        let slot_handle = Arc::clone(&self.slot);
        let future = async move {
            let result = fetch.await;
            let mut slot = slot_handle.lock().unwrap_or_else(PoisonError::into_inner);
            if slot.as_ref().is_some_and(|in_flight| in_flight.id == id) {
                *slot = None;
            }
            result
        }
        .boxed()
        .shared();

        *slot = Some(InFlightPull {
            id,
            session,
            future: future.clone(),
        });
        (future, false)
    }

    pub fn is_pending(&self) -> bool {
        self.slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }
}

impl CreditsClient {
    /// Fetches the authoritative balance and applies it as ground truth.
    ///
    /// Safe to call redundantly. On failure the balance is left as it was.
    pub async fn reconcile(&self) -> Result<Balance, CreditsError> {
        self.reconcile_with(ReconcileTrigger::Manual).await
    }

    pub(crate) async fn reconcile_with(
        &self,
        trigger: ReconcileTrigger,
    ) -> Result<Balance, CreditsError> {
        if let Err(err) = self.ensure_session_active() {
            self.inner
                .telemetry
                .on_event(CreditsTelemetryEvent::ReconcileFailed {
                    trigger,
                    kind: err.kind,
                    message: err.message.clone(),
                });
            return Err(err);
        }

        let client = self.clone();
        let session = self.inner.store.read().session;
        let (future, joined) = self
            .inner
            .reconciler
            .join_or_start(session, move || async move { client.fetch_balance().await });

        let event = if joined {
            CreditsTelemetryEvent::ReconcileJoined {
                trigger: trigger.clone(),
            }
        } else {
            CreditsTelemetryEvent::ReconcileStarted {
                trigger: trigger.clone(),
            }
        };
        self.inner.telemetry.on_event(event);

        let result = future.await;
        if let Err(err) = &result {
            self.inner
                .telemetry
                .on_event(CreditsTelemetryEvent::ReconcileFailed {
                    trigger,
                    kind: err.kind,
                    message: err.message.clone(),
                });
        }
        result
    }

    /// Fire-and-forget pull used by the dispatcher; failures are only logged.
    pub(crate) fn spawn_reconcile(&self, trigger: ReconcileTrigger) {
        let client = self.clone();
        tokio::spawn(async move {
            let _ = client.reconcile_with(trigger).await;
        });
    }

    async fn fetch_balance(&self) -> Result<Balance, CreditsError> {
        let path = self.endpoints().balance.clone();
        let (response, stamp) = self.send_stamped(ApiRequest::get(path.clone())).await?;
        if !response.is_success() {
            return Err(map_http_error(
                response.status,
                &path,
                &response.text_lossy(),
            ));
        }

        let credits = response
            .structured_body()
            .and_then(|body| body.get("credits").and_then(parse_balance_value))
            .ok_or_else(|| {
                protocol_violation("balance response is missing an integer 'credits' field")
                    .with_endpoint(path.clone())
            })?;

        let outcome = self.inner.store.apply(BalanceUpdate::pull(credits, stamp));
        self.inner
            .telemetry
            .on_event(CreditsTelemetryEvent::ReconcileCompleted {
                value: credits,
                outcome,
            });

        match outcome {
            ApplyOutcome::Applied { .. } => Ok(self.inner.store.read()),
            ApplyOutcome::RejectedNegative => Err(protocol_violation(format!(
                "balance endpoint reported a negative balance ({})",
                credits
            ))
            .with_endpoint(path)),
            ApplyOutcome::Stale => Err(CreditsError::new(
                CreditsErrorKind::Authentication,
                "session ended before the balance arrived",
            )
            .with_retryable(false)
            .with_endpoint(path)),
        }
    }
}
