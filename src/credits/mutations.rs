use serde_json::{Value, json};

use crate::credits::{
    client::CreditsClient,
    error::{CreditsError, invalid_amount, map_http_error, protocol_violation},
    inline::parse_balance_value,
    store::{BalanceStore, OptimisticTicket},
    telemetry::{CreditsTelemetryEvent, ReconcileTrigger},
    types::{
        ApiRequest, ApplyOutcome, BalanceUpdate, MutationKind, MutationReceipt, RequestStamp,
    },
};

/// Owns one mutation's optimistic offset; dropping it without confirming
/// reverts the display to the last confirmed value.
struct OptimisticGuard {
    store: BalanceStore,
    ticket: OptimisticTicket,
    settled: bool,
}

impl OptimisticGuard {
    fn begin(store: &BalanceStore, offset: i64) -> Self {
        Self {
            ticket: store.begin_optimistic(offset),
            store: store.clone(),
            settled: false,
        }
    }

    fn confirm(mut self, update: BalanceUpdate) -> ApplyOutcome {
        self.settled = true;
        self.store.apply_settling(update, &self.ticket)
    }
}

impl Drop for OptimisticGuard {
    fn drop(&mut self) {
        if !self.settled {
            self.store.settle_optimistic(&self.ticket);
        }
    }
}

impl CreditsClient {
    pub async fn deduct(&self, amount: u64) -> Result<MutationReceipt, CreditsError> {
        self.mutate(MutationKind::Deduct, amount, None).await
    }

    /// Adds credits to the session user, or to `target_user` when given.
    pub async fn add(
        &self,
        amount: u64,
        target_user: Option<&str>,
    ) -> Result<MutationReceipt, CreditsError> {
        self.mutate(MutationKind::Add, amount, target_user.map(str::to_string))
            .await
    }

    async fn mutate(
        &self,
        kind: MutationKind,
        amount: u64,
        target_user: Option<String>,
    ) -> Result<MutationReceipt, CreditsError> {
        if amount == 0 {
            return Err(invalid_amount("amount must be greater than zero"));
        }
        if i64::try_from(amount).is_err() {
            return Err(invalid_amount(format!("amount {} is out of range", amount)));
        }
        self.ensure_session_active()?;

        let affects_session = match target_user.as_deref() {
            None => true,
            Some(target) => self.inner.session.user_id().await.as_deref() == Some(target),
        };

        let guard = affects_session
            .then(|| OptimisticGuard::begin(&self.inner.store, kind.optimistic_offset(amount)));
        self.inner
            .telemetry
            .on_event(CreditsTelemetryEvent::MutationStarted {
                kind,
                amount,
                operation_id: guard.as_ref().map(|guard| guard.ticket.operation_id),
            });

        let requested = self
            .request_mutation(kind, amount, target_user.as_deref())
            .await;
        let (confirmed, stamp) = match requested {
            Ok(confirmation) => confirmation,
            Err(err) => {
                drop(guard);
                self.inner
                    .telemetry
                    .on_event(CreditsTelemetryEvent::MutationFailed {
                        kind,
                        amount,
                        error_kind: err.kind,
                    });
                return Err(err);
            }
        };

        let outcome =
            guard.map(|guard| guard.confirm(BalanceUpdate::confirmed(kind, confirmed, stamp)));
        if outcome == Some(ApplyOutcome::RejectedNegative) {
            self.spawn_reconcile(ReconcileTrigger::NegativeValue);
        }

        self.inner
            .telemetry
            .on_event(CreditsTelemetryEvent::MutationConfirmed {
                kind,
                amount,
                confirmed,
                outcome,
            });

        Ok(MutationReceipt {
            kind,
            amount,
            target_user,
            confirmed,
            outcome,
        })
    }

    async fn request_mutation(
        &self,
        kind: MutationKind,
        amount: u64,
        target_user: Option<&str>,
    ) -> Result<(i64, RequestStamp), CreditsError> {
        let endpoints = self.endpoints();
        let (path, body, field) = match kind {
            MutationKind::Deduct => (
                endpoints.deduct.clone(),
                json!({ "amount": amount }),
                "remaining_credits",
            ),
            MutationKind::Add => {
                let mut body = json!({ "amount": amount });
                if let Some(user_id) = target_user {
                    body["user_id"] = Value::String(user_id.to_string());
                }
                (endpoints.add.clone(), body, "new_balance")
            }
        };

        let (response, stamp) = self
            .send_stamped(ApiRequest::post(path.clone(), body))
            .await?;
        if !response.is_success() {
            return Err(map_http_error(
                response.status,
                &path,
                &response.text_lossy(),
            ));
        }

        let confirmed = response
            .structured_body()
            .and_then(|body| body.get(field).and_then(parse_balance_value))
            .ok_or_else(|| {
                protocol_violation(format!(
                    "mutation response is missing an integer '{}' field",
                    field
                ))
                .with_endpoint(path)
            })?;

        Ok((confirmed, stamp))
    }
}
