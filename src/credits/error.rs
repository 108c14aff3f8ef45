use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CreditsErrorKind {
    InvalidAmount,
    Authentication,
    Transport,
    Backend,
    Protocol,
    Internal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreditsError {
    pub kind: CreditsErrorKind,
    pub message: String,
    pub retryable: bool,
    pub endpoint: Option<String>,
    pub http_status: Option<u16>,
}

impl CreditsError {
    pub fn new(kind: CreditsErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            retryable: matches!(kind, CreditsErrorKind::Transport),
            endpoint: None,
            http_status: None,
        }
    }

    pub fn with_retryable(mut self, retryable: bool) -> Self {
        self.retryable = retryable;
        self
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    pub fn with_http_status(mut self, status: u16) -> Self {
        self.http_status = Some(status);
        self
    }

    pub fn is_authentication(&self) -> bool {
        self.kind == CreditsErrorKind::Authentication
    }
}

impl fmt::Display for CreditsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.endpoint, self.http_status) {
            (Some(endpoint), Some(status)) => {
                write!(
                    f,
                    "{} (endpoint={}, status={})",
                    self.message, endpoint, status
                )
            }
            (Some(endpoint), None) => write!(f, "{} (endpoint={})", self.message, endpoint),
            (None, Some(status)) => write!(f, "{} (status={})", self.message, status),
            (None, None) => write!(f, "{}", self.message),
        }
    }
}

impl std::error::Error for CreditsError {}

pub fn invalid_amount(message: impl Into<String>) -> CreditsError {
    CreditsError::new(CreditsErrorKind::InvalidAmount, message).with_retryable(false)
}

pub fn protocol_violation(message: impl Into<String>) -> CreditsError {
    CreditsError::new(CreditsErrorKind::Protocol, message).with_retryable(false)
}

pub fn session_expired(endpoint: impl Into<String>) -> CreditsError {
    CreditsError::new(CreditsErrorKind::Authentication, "authentication failed")
        .with_retryable(false)
        .with_endpoint(endpoint)
        .with_http_status(401)
}

/// No session is active: never begun, expired, or logged out.
pub fn session_inactive() -> CreditsError {
    CreditsError::new(CreditsErrorKind::Authentication, "no active session")
        .with_retryable(false)
}

pub fn internal_error(message: impl Into<String>) -> CreditsError {
    CreditsError::new(CreditsErrorKind::Internal, message).with_retryable(false)
}

/// Maps a non-2xx credits endpoint response to a typed error.
pub fn map_http_error(status: u16, endpoint: &str, body: &str) -> CreditsError {
    let normalized_body = body.chars().take(240).collect::<String>();

    let mut err = if status == 401 {
        CreditsError::new(CreditsErrorKind::Authentication, "authentication failed")
            .with_retryable(false)
    } else if status == 408 || status == 429 {
        CreditsError::new(
            CreditsErrorKind::Backend,
            format!("credits endpoint returned status {}", status),
        )
        .with_retryable(true)
    } else if (400..500).contains(&status) {
        CreditsError::new(
            CreditsErrorKind::Backend,
            format!("credits endpoint rejected request with status {}", status),
        )
        .with_retryable(false)
    } else {
        CreditsError::new(
            CreditsErrorKind::Backend,
            format!("credits endpoint returned status {}", status),
        )
        .with_retryable(true)
    };

    err = err.with_endpoint(endpoint).with_http_status(status);

    if !normalized_body.is_empty() {
        err.message = format!("{}: {}", err.message, normalized_body);
    }

    err
}
