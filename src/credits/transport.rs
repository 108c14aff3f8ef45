use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Method, header};

use crate::credits::{
    error::{CreditsError, CreditsErrorKind},
    types::{ApiRequest, ApiResponse, HttpMethod},
};

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("request to {path} failed: {source}")]
    Request {
        path: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("request to {path} timed out")]
    Timeout { path: String },

    #[error("failed to read response body from {path}: {source}")]
    Body {
        path: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("invalid base url '{0}'")]
    InvalidBaseUrl(String),
}

impl From<TransportError> for CreditsError {
    fn from(err: TransportError) -> Self {
        let endpoint = match &err {
            TransportError::Request { path, .. }
            | TransportError::Timeout { path }
            | TransportError::Body { path, .. } => Some(path.clone()),
            TransportError::InvalidBaseUrl(_) => None,
        };
        let retryable = !matches!(err, TransportError::InvalidBaseUrl(_));
        let mut mapped =
            CreditsError::new(CreditsErrorKind::Transport, err.to_string()).with_retryable(retryable);
        if let Some(endpoint) = endpoint {
            mapped = mapped.with_endpoint(endpoint);
        }
        mapped
    }
}

/// Raw request/response exchange underneath the dispatcher.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn execute(&self, request: ApiRequest) -> Result<ApiResponse, CreditsError>;
}

#[derive(Clone)]
pub struct ReqwestTransport {
    client: Client,
    base_url: String,
    timeout: Duration,
}

impl ReqwestTransport {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, CreditsError> {
        let base_url = base_url.into();
        if !(base_url.starts_with("http://") || base_url.starts_with("https://")) {
            return Err(TransportError::InvalidBaseUrl(base_url).into());
        }

        let client = Client::builder()
            .pool_idle_timeout(Duration::from_secs(30))
            .build()
            .map_err(|source| TransportError::Request {
                path: base_url.clone(),
                source,
            })?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            timeout,
        })
    }

    fn url_for(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn execute(&self, request: ApiRequest) -> Result<ApiResponse, CreditsError> {
        let path = request.path.clone();
        let mut builder = self
            .client
            .request(to_reqwest_method(request.method), self.url_for(&request.path))
            .timeout(self.timeout)
            .query(&request.query);

        for (key, value) in &request.headers {
            builder = builder.header(key.as_str(), value.as_str());
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let response = builder.send().await.map_err(|source| {
            if source.is_timeout() {
                TransportError::Timeout { path: path.clone() }
            } else {
                TransportError::Request {
                    path: path.clone(),
                    source,
                }
            }
        })?;

        let status = response.status().as_u16();
        let content_type = response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
        let body = response
            .bytes()
            .await
            .map_err(|source| TransportError::Body {
                path: path.clone(),
                source,
            })?;

        Ok(ApiResponse::new(status, content_type, body.to_vec()))
    }
}

fn to_reqwest_method(method: HttpMethod) -> Method {
    match method {
        HttpMethod::Get => Method::GET,
        HttpMethod::Post => Method::POST,
        HttpMethod::Put => Method::PUT,
        HttpMethod::Patch => Method::PATCH,
        HttpMethod::Delete => Method::DELETE,
    }
}
