use std::{
    collections::BTreeMap,
    time::{Duration, Instant, SystemTime},
};

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub type OperationId = u64;

pub const DEFAULT_BALANCE_POINTER: &str = "/credits_info/remaining";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BalanceSource {
    Inline,
    Pull,
    Deduct,
    Add,
    Reset,
}

impl BalanceSource {
    pub fn is_ground_truth(self) -> bool {
        matches!(
            self,
            BalanceSource::Pull | BalanceSource::Deduct | BalanceSource::Add
        )
    }
}

/// Snapshot of the session's credits balance as last known by the client.
///
/// Equality covers the consumer-facing fields only; the store's ordering
/// bookkeeping is left out.
#[derive(Debug, Clone, Serialize)]
pub struct Balance {
    /// `None` while the balance is unknown (session start, after a reset).
    pub value: Option<u64>,
    pub sequence: u64,
    pub source: Option<BalanceSource>,
    pub last_applied_at: Option<SystemTime>,
    /// Sum of the offsets of all mutations still waiting for confirmation.
    pub pending_optimistic: Option<i64>,
    #[serde(skip)]
    pub(crate) session: u64,
    #[serde(skip)]
    pub(crate) barrier: u64,
    #[serde(skip)]
    pub(crate) optimistic_slots: BTreeMap<OperationId, i64>,
}

impl PartialEq for Balance {
    fn eq(&self, other: &Self) -> bool {
        self.value == other.value
            && self.sequence == other.sequence
            && self.source == other.source
            && self.last_applied_at == other.last_applied_at
            && self.pending_optimistic == other.pending_optimistic
    }
}

impl Eq for Balance {}

impl Balance {
    pub fn unknown() -> Self {
        Self {
            value: None,
            sequence: 0,
            source: None,
            last_applied_at: None,
            pending_optimistic: None,
            session: 0,
            barrier: 0,
            optimistic_slots: BTreeMap::new(),
        }
    }

    pub fn is_known(&self) -> bool {
        self.value.is_some()
    }

    /// Session generation this snapshot belongs to.
    pub fn session(&self) -> u64 {
        self.session
    }

    /// Confirmed value with the in-flight optimistic offsets folded in.
    pub fn displayed(&self) -> Option<u64> {
        let value = self.value?;
        let pending = self.pending_optimistic.unwrap_or(0);
        let shown = (value as i128 + pending as i128).max(0);
        Some(u64::try_from(shown).unwrap_or(u64::MAX))
    }

    pub(crate) fn recompute_pending(&mut self) {
        self.pending_optimistic = if self.optimistic_slots.is_empty() {
            None
        } else {
            Some(self.optimistic_slots.values().copied().sum())
        };
    }
}

impl Default for Balance {
    fn default() -> Self {
        Self::unknown()
    }
}

/// Logical position of a request relative to the store, captured when it is sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestStamp {
    pub session: u64,
    pub barrier: u64,
    pub started_at: Instant,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BalanceUpdate {
    pub value: Option<i64>,
    pub source: BalanceSource,
    pub happens_after: Option<RequestStamp>,
}

impl BalanceUpdate {
    pub fn inline(value: i64, stamp: RequestStamp) -> Self {
        Self {
            value: Some(value),
            source: BalanceSource::Inline,
            happens_after: Some(stamp),
        }
    }

    pub fn pull(value: i64, stamp: RequestStamp) -> Self {
        Self {
            value: Some(value),
            source: BalanceSource::Pull,
            happens_after: Some(stamp),
        }
    }

    pub fn confirmed(kind: MutationKind, value: i64, stamp: RequestStamp) -> Self {
        Self {
            value: Some(value),
            source: kind.source(),
            happens_after: Some(stamp),
        }
    }

    pub fn reset() -> Self {
        Self {
            value: None,
            source: BalanceSource::Reset,
            happens_after: None,
        }
    }

    /// Reset that only applies while the stamp's session is still current.
    pub fn reset_after(stamp: RequestStamp) -> Self {
        Self {
            value: None,
            source: BalanceSource::Reset,
            happens_after: Some(stamp),
        }
    }
}

#[must_use]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ApplyOutcome {
    Applied { sequence: u64 },
    Stale,
    RejectedNegative,
}

impl ApplyOutcome {
    pub fn is_applied(self) -> bool {
        matches!(self, ApplyOutcome::Applied { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationKind {
    Deduct,
    Add,
}

impl MutationKind {
    pub fn source(self) -> BalanceSource {
        match self {
            MutationKind::Deduct => BalanceSource::Deduct,
            MutationKind::Add => BalanceSource::Add,
        }
    }

    pub fn optimistic_offset(self, amount: u64) -> i64 {
        let amount = i64::try_from(amount).unwrap_or(i64::MAX);
        match self {
            MutationKind::Deduct => -amount,
            MutationKind::Add => amount,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MutationReceipt {
    pub kind: MutationKind,
    pub amount: u64,
    pub target_user: Option<String>,
    /// Balance reported by the server after the mutation.
    pub confirmed: i64,
    /// `None` when the confirmation belongs to another user and was not applied.
    pub outcome: Option<ApplyOutcome>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

#[derive(Debug, Clone)]
pub struct ApiRequest {
    pub method: HttpMethod,
    pub path: String,
    pub query: Vec<(String, String)>,
    pub headers: Vec<(String, String)>,
    pub body: Option<Value>,
}

impl ApiRequest {
    pub fn new(method: HttpMethod, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: Vec::new(),
            headers: Vec::new(),
            body: None,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(HttpMethod::Get, path)
    }

    pub fn post(path: impl Into<String>, body: Value) -> Self {
        Self::new(HttpMethod::Post, path).with_body(body)
    }

    pub fn with_body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn with_query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((key.into(), value.into()));
        self
    }
}

#[derive(Debug, Clone)]
pub struct ApiResponse {
    pub status: u16,
    pub content_type: Option<String>,
    pub body: Vec<u8>,
}

impl ApiResponse {
    pub fn new(status: u16, content_type: Option<String>, body: Vec<u8>) -> Self {
        Self {
            status,
            content_type,
            body,
        }
    }

    pub fn json(status: u16, value: &Value) -> Self {
        Self::new(
            status,
            Some("application/json".to_string()),
            value.to_string().into_bytes(),
        )
    }

    pub fn binary(status: u16, content_type: impl Into<String>, body: Vec<u8>) -> Self {
        Self::new(status, Some(content_type.into()), body)
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn is_unauthorized(&self) -> bool {
        self.status == 401
    }

    /// Parses the body as JSON when the response declares a JSON media type,
    /// or declares none and the bytes happen to be JSON.
    pub fn structured_body(&self) -> Option<Value> {
        match self.content_type.as_deref() {
            Some(content_type) if !is_json_media_type(content_type) => None,
            _ => serde_json::from_slice(&self.body).ok(),
        }
    }

    pub fn text_lossy(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

fn is_json_media_type(content_type: &str) -> bool {
    let essence = content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();
    essence == "application/json" || essence.ends_with("+json")
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CredentialRef {
    Env {
        var: String,
    },
    InlineToken {
        token: String,
    },
    #[default]
    None,
}

/// Credential cached for the lifetime of one session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionCredential {
    pub auth_header: Option<String>,
    pub user_id: Option<String>,
}

impl SessionCredential {
    pub fn none() -> Self {
        Self {
            auth_header: None,
            user_id: None,
        }
    }

    pub fn bearer(token: impl AsRef<str>) -> Self {
        Self {
            auth_header: Some(format!("Bearer {}", token.as_ref())),
            user_id: None,
        }
    }

    pub fn with_user_id(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EndpointsConfig {
    #[serde(default = "default_balance_endpoint")]
    pub balance: String,
    #[serde(default = "default_deduct_endpoint")]
    pub deduct: String,
    #[serde(default = "default_add_endpoint")]
    pub add: String,
}

impl Default for EndpointsConfig {
    fn default() -> Self {
        Self {
            balance: default_balance_endpoint(),
            deduct: default_deduct_endpoint(),
            add: default_add_endpoint(),
        }
    }
}

impl EndpointsConfig {
    pub fn is_credits_endpoint(&self, path: &str) -> bool {
        path == self.balance || path == self.deduct || path == self.add
    }
}

fn default_balance_endpoint() -> String {
    "/credits/balance".to_string()
}

fn default_deduct_endpoint() -> String {
    "/credits/deduct".to_string()
}

fn default_add_endpoint() -> String {
    "/credits/add".to_string()
}

fn default_request_timeout_ms() -> u64 {
    30_000
}

fn default_balance_pointers() -> Vec<String> {
    vec![DEFAULT_BALANCE_POINTER.to_string()]
}

fn default_mutating_families() -> Vec<String> {
    [
        "/api/chat/",
        "/api/image/",
        "/api/voice/",
        "/api/convert/",
        "/api/youtube/",
        "/api/tiktok/",
    ]
    .into_iter()
    .map(str::to_string)
    .collect()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreditsConfig {
    pub base_url: String,
    #[serde(default)]
    pub credential: CredentialRef,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default)]
    pub endpoints: EndpointsConfig,
    #[serde(default = "default_balance_pointers")]
    pub balance_pointers: Vec<String>,
    #[serde(default = "default_mutating_families")]
    pub mutating_families: Vec<String>,
    #[serde(default)]
    pub reconcile_on_missing_inline: bool,
}

impl CreditsConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            credential: CredentialRef::None,
            user_id: None,
            request_timeout_ms: default_request_timeout_ms(),
            endpoints: EndpointsConfig::default(),
            balance_pointers: default_balance_pointers(),
            mutating_families: default_mutating_families(),
            reconcile_on_missing_inline: false,
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms.max(1))
    }
}
