use std::sync::Arc;

use crate::credits::{
    error::CreditsError,
    inline::InlineExtractor,
    session::SessionGuard,
    telemetry::ReconcileTrigger,
    transport::Transport,
    types::{ApiRequest, ApiResponse, CreditsConfig, EndpointsConfig},
};

/// Where a response goes after it comes back through the dispatcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseRoute {
    SessionGuard,
    Inline { value: i64 },
    Pull { trigger: ReconcileTrigger },
    Ignore,
}

#[derive(Clone)]
pub struct Dispatcher {
    transport: Arc<dyn Transport>,
    session: SessionGuard,
    inline: InlineExtractor,
    endpoints: EndpointsConfig,
    mutating_families: Vec<String>,
    reconcile_on_missing_inline: bool,
}

impl Dispatcher {
    pub fn new(
        transport: Arc<dyn Transport>,
        session: SessionGuard,
        config: &CreditsConfig,
    ) -> Self {
        Self {
            transport,
            session,
            inline: InlineExtractor::new(config.balance_pointers.clone()),
            endpoints: config.endpoints.clone(),
            mutating_families: config
                .mutating_families
                .iter()
                .map(|family| family.trim().to_string())
                .filter(|family| !family.is_empty())
                .collect(),
            reconcile_on_missing_inline: config.reconcile_on_missing_inline,
        }
    }

    /// Sends `request` with the current session credential attached.
    pub async fn exchange(&self, mut request: ApiRequest) -> Result<ApiResponse, CreditsError> {
        let auth_header = self
            .session
            .credential()
            .await
            .and_then(|credential| credential.auth_header);
        if let Some(auth_header) = auth_header {
            request
                .headers
                .push(("authorization".to_string(), auth_header));
        }

        self.transport.execute(request).await
    }

    /// Routing order: auth failure, inline hint, pull for opaque bodies.
    pub fn route(&self, path: &str, response: &ApiResponse) -> ResponseRoute {
        if response.is_unauthorized() {
            return ResponseRoute::SessionGuard;
        }

        let mutating = response.is_success() && self.is_mutating_family(path);
        match response.structured_body() {
            Some(body) => {
                if let Some(value) = self.inline.extract(&body) {
                    ResponseRoute::Inline { value }
                } else if mutating && self.reconcile_on_missing_inline {
                    ResponseRoute::Pull {
                        trigger: ReconcileTrigger::MissingInlineHint {
                            path: path.to_string(),
                        },
                    }
                } else {
                    ResponseRoute::Ignore
                }
            }
            None if mutating => ResponseRoute::Pull {
                trigger: ReconcileTrigger::OpaqueResponse {
                    path: path.to_string(),
                },
            },
            None => ResponseRoute::Ignore,
        }
    }

    pub fn is_mutating_family(&self, path: &str) -> bool {
        let path = path.split('?').next().unwrap_or(path);
        if self.endpoints.is_credits_endpoint(path) {
            return false;
        }
        self.mutating_families
            .iter()
            .any(|family| path.starts_with(family.as_str()))
    }

    pub fn endpoints(&self) -> &EndpointsConfig {
        &self.endpoints
    }
}
