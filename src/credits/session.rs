use std::sync::Arc;

use tokio::sync::{RwLock, watch};

use crate::credits::{
    store::BalanceStore,
    telemetry::{CreditsTelemetryEvent, SessionEndReason, TelemetrySink},
    types::{BalanceUpdate, RequestStamp, SessionCredential},
};

/// What the application should be showing, published on every transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Inactive,
    Active { session: u64 },
    /// Authentication was rejected; route to the login surface.
    Expired,
    LoggedOut,
}

#[derive(Clone)]
pub struct SessionGuard {
    store: BalanceStore,
    credential: Arc<RwLock<Option<SessionCredential>>>,
    status: Arc<watch::Sender<SessionStatus>>,
    telemetry: Arc<dyn TelemetrySink>,
}

impl SessionGuard {
    pub fn new(store: BalanceStore, telemetry: Arc<dyn TelemetrySink>) -> Self {
        let (status, _rx) = watch::channel(SessionStatus::Inactive);
        Self {
            store,
            credential: Arc::new(RwLock::new(None)),
            status: Arc::new(status),
            telemetry,
        }
    }

    /// Starts a fresh session generation. Anything still in flight from the
    /// previous one can no longer reach the store.
    pub async fn begin(&self, credential: SessionCredential) -> u64 {
        let mut slot = self.credential.write().await;
        let _ = self.store.reset();
        *slot = Some(credential);

        let session = self.store.read().session;
        self.status.send_replace(SessionStatus::Active { session });
        self.telemetry
            .on_event(CreditsTelemetryEvent::SessionStarted { session });
        session
    }

    /// Handles an authentication failure observed on a request sent with
    /// `stamp`. Returns `false` when that request belonged to a session that
    /// has already ended, in which case nothing changes.
    pub async fn invalidate(&self, stamp: RequestStamp, endpoint: &str) -> bool {
        let mut slot = self.credential.write().await;
        if !self.store.apply(BalanceUpdate::reset_after(stamp)).is_applied() {
            return false;
        }
        *slot = None;
        drop(slot);

        self.status.send_replace(SessionStatus::Expired);
        self.telemetry.on_event(CreditsTelemetryEvent::SessionEnded {
            reason: SessionEndReason::Unauthorized,
            endpoint: Some(endpoint.to_string()),
        });
        true
    }

    pub async fn logout(&self) {
        let mut slot = self.credential.write().await;
        let _ = self.store.reset();
        *slot = None;
        drop(slot);

        self.status.send_replace(SessionStatus::LoggedOut);
        self.telemetry.on_event(CreditsTelemetryEvent::SessionEnded {
            reason: SessionEndReason::Logout,
            endpoint: None,
        });
    }

    pub async fn credential(&self) -> Option<SessionCredential> {
        self.credential.read().await.clone()
    }

    pub async fn user_id(&self) -> Option<String> {
        self.credential
            .read()
            .await
            .as_ref()
            .and_then(|credential| credential.user_id.clone())
    }

    pub fn status(&self) -> SessionStatus {
        *self.status.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionStatus> {
        self.status.subscribe()
    }
}
