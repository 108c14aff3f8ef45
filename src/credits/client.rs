use std::sync::Arc;

use tokio::sync::watch;

use crate::credits::{
    dispatcher::{Dispatcher, ResponseRoute},
    error::{CreditsError, session_expired, session_inactive},
    reconciler::PullReconciler,
    session::{SessionGuard, SessionStatus},
    store::BalanceStore,
    telemetry::{CreditsTelemetryEvent, ReconcileTrigger, TelemetrySink},
    transport::{ReqwestTransport, Transport},
    types::{
        ApiRequest, ApiResponse, ApplyOutcome, Balance, BalanceUpdate, CreditsConfig,
        EndpointsConfig, RequestStamp, SessionCredential,
    },
};

/// Entry point for every request the application makes.
///
/// Cheap to clone; all clones share one balance, one session and one
/// in-flight pull.
#[derive(Clone)]
pub struct CreditsClient {
    pub(crate) inner: Arc<ClientInner>,
}

pub(crate) struct ClientInner {
    pub(crate) store: BalanceStore,
    pub(crate) session: SessionGuard,
    pub(crate) dispatcher: Dispatcher,
    pub(crate) reconciler: PullReconciler,
    pub(crate) telemetry: Arc<dyn TelemetrySink>,
}

impl CreditsClient {
    pub fn new(
        config: &CreditsConfig,
        transport: Arc<dyn Transport>,
        telemetry: Arc<dyn TelemetrySink>,
    ) -> Self {
        let store = BalanceStore::new();
        let session = SessionGuard::new(store.clone(), Arc::clone(&telemetry));
        let dispatcher = Dispatcher::new(transport, session.clone(), config);

        Self {
            inner: Arc::new(ClientInner {
                store,
                session,
                dispatcher,
                reconciler: PullReconciler::default(),
                telemetry,
            }),
        }
    }

    pub fn from_config(
        config: &CreditsConfig,
        telemetry: Arc<dyn TelemetrySink>,
    ) -> Result<Self, CreditsError> {
        let transport = ReqwestTransport::new(config.base_url.clone(), config.request_timeout())?;
        Ok(Self::new(config, Arc::new(transport), telemetry))
    }

    pub fn read(&self) -> Balance {
        self.inner.store.read()
    }

    pub fn subscribe(&self) -> watch::Receiver<Balance> {
        self.inner.store.subscribe()
    }

    pub fn session_status(&self) -> SessionStatus {
        self.inner.session.status()
    }

    pub fn subscribe_session(&self) -> watch::Receiver<SessionStatus> {
        self.inner.session.subscribe()
    }

    pub fn endpoints(&self) -> &EndpointsConfig {
        self.inner.dispatcher.endpoints()
    }

    /// Starts a session and performs its initial pull. The session stays
    /// active even if that pull fails; the error is returned for the caller
    /// to retry.
    pub async fn begin_session(&self, credential: SessionCredential) -> Result<Balance, CreditsError> {
        self.inner.session.begin(credential).await;
        self.reconcile_with(ReconcileTrigger::SessionStart).await
    }

    pub async fn logout(&self) {
        self.inner.session.logout().await;
    }

    /// Balance operations are refused once the session has ended; the
    /// guard's reset is final until the next `begin_session`.
    pub(crate) fn ensure_session_active(&self) -> Result<(), CreditsError> {
        match self.inner.session.status() {
            SessionStatus::Active { .. } => Ok(()),
            _ => Err(session_inactive()),
        }
    }

    /// Sends a feature request through the dispatcher.
    ///
    /// Non-2xx statuses other than 401 are returned as responses; the caller
    /// owns their meaning. A 401 has already invalidated the session by the
    /// time the `Authentication` error is returned.
    pub async fn send(&self, request: ApiRequest) -> Result<ApiResponse, CreditsError> {
        self.send_stamped(request)
            .await
            .map(|(response, _stamp)| response)
    }

    pub(crate) async fn send_stamped(
        &self,
        request: ApiRequest,
    ) -> Result<(ApiResponse, RequestStamp), CreditsError> {
        let stamp = self.inner.store.stamp();
        let path = request.path.clone();
        let response = self.inner.dispatcher.exchange(request).await?;

        match self.inner.dispatcher.route(&path, &response) {
            ResponseRoute::SessionGuard => {
                self.inner.session.invalidate(stamp, &path).await;
                return Err(session_expired(path));
            }
            ResponseRoute::Inline { value } => {
                let outcome = self.inner.store.apply(BalanceUpdate::inline(value, stamp));
                self.inner
                    .telemetry
                    .on_event(CreditsTelemetryEvent::InlineHintObserved {
                        path: path.clone(),
                        value,
                        outcome,
                    });
                if outcome == ApplyOutcome::RejectedNegative {
                    self.spawn_reconcile(ReconcileTrigger::NegativeValue);
                }
            }
            ResponseRoute::Pull { trigger } => self.spawn_reconcile(trigger),
            ResponseRoute::Ignore => {}
        }

        Ok((response, stamp))
    }
}
