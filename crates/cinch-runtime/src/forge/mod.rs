mod forgejo;
mod github;
mod gitlab;

pub use forgejo::ForgejoAdapter;
pub use github::GitHubAdapter;
pub use gitlab::GitLabAdapter;

use async_trait::async_trait;
use cinch_core::error::{CinchError, Result};
use cinch_core::model::ForgeType;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

/// Raw inbound webhook request, as much of it as adapters need.
pub struct WebhookRequest {
    pub headers: Vec<(String, String)>,
    pub body: bytes::Bytes,
}

impl WebhookRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct PushEvent {
    pub owner: String,
    pub repo: String,
    pub commit_sha: String,
    pub branch: Option<String>,
    pub tag: Option<String>,
    pub sender: String,
}

#[derive(Debug, Clone)]
pub struct PullRequestEvent {
    pub owner: String,
    pub repo: String,
    pub pr_number: i64,
    pub head_sha: String,
    pub head_ref: String,
    pub base_ref: String,
    pub is_fork: bool,
    pub sender: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusState {
    Pending,
    Running,
    Success,
    Failure,
    Error,
}

impl StatusState {
    pub fn as_str(&self) -> &'static str {
        match self {
            StatusState::Pending => "pending",
            StatusState::Running => "running",
            StatusState::Success => "success",
            StatusState::Failure => "failure",
            StatusState::Error => "error",
        }
    }
}

pub struct StatusUpdate<'a> {
    pub state: StatusState,
    pub context: &'a str,
    pub description: &'a str,
    pub target_url: &'a str,
}

/// Either a push or a pull-request event parse yields an event, or the
/// caller should treat the webhook as a no-op (not an error).
pub enum ParseOutcome<T> {
    Event(T),
    Ignored,
}

/// Per-forge-type webhook verification and payload parsing, plus the
/// outbound operations needed to report status back to the forge.
#[async_trait]
pub trait ForgeAdapter: Send + Sync {
    fn forge_type(&self) -> ForgeType;

    /// Cheap check against request shape (typically a header), used to pick
    /// which adapter parses a given inbound webhook.
    fn identify(&self, req: &WebhookRequest) -> bool;

    fn parse_push(
        &self,
        req: &WebhookRequest,
        secret: &str,
    ) -> Result<ParseOutcome<PushEvent>>;

    fn parse_pull_request(
        &self,
        req: &WebhookRequest,
        secret: &str,
    ) -> Result<ParseOutcome<PullRequestEvent>>;

    async fn post_status(
        &self,
        forge_token: &str,
        clone_url: &str,
        commit_sha: &str,
        update: StatusUpdate<'_>,
    ) -> Result<()>;

    async fn create_webhook(
        &self,
        forge_token: &str,
        clone_url: &str,
        delivery_url: &str,
        secret: &str,
    ) -> Result<String>;

    /// Mints a short-lived clone token for private repos. Public repos
    /// return `None`.
    async fn clone_token(&self, forge_token: &str, private: bool) -> Result<Option<(String, chrono::DateTime<chrono::Utc>)>>;
}

/// Verifies an HMAC-SHA256 signature over the raw body with a
/// constant-time comparison, as GitHub's and Forgejo's `sha256=<hex>`
/// schemes both require.
pub fn verify_hmac_sha256_hex(secret: &str, body: &[u8], signature_hex: &str) -> bool {
    let Some(hex_digest) = signature_hex.strip_prefix("sha256=").or(Some(signature_hex)) else {
        return false;
    };
    let Ok(expected_bytes) = hex::decode(hex_digest) else {
        return false;
    };
    let Ok(mut mac) = Hmac::<Sha256>::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    let computed = mac.finalize().into_bytes();
    computed.ct_eq(&expected_bytes[..]).into()
}

/// GitLab's scheme is a plain shared-secret comparison against the
/// `X-Gitlab-Token` header, still done in constant time.
pub fn verify_plain_secret(secret: &str, presented: &str) -> bool {
    secret.as_bytes().ct_eq(presented.as_bytes()).into()
}

/// Ordered registry of adapters, consulted by `identify` in registration
/// order (first match wins).
pub struct ForgeRegistry {
    adapters: Vec<std::sync::Arc<dyn ForgeAdapter>>,
}

impl ForgeRegistry {
    pub fn new(adapters: Vec<std::sync::Arc<dyn ForgeAdapter>>) -> Self {
        Self { adapters }
    }

    pub fn identify(&self, req: &WebhookRequest) -> Option<std::sync::Arc<dyn ForgeAdapter>> {
        self.adapters.iter().find(|a| a.identify(req)).cloned()
    }

    pub fn get(&self, forge_type: ForgeType) -> Option<std::sync::Arc<dyn ForgeAdapter>> {
        self.adapters
            .iter()
            .find(|a| a.forge_type() == forge_type)
            .cloned()
    }
}

pub(crate) fn bad_signature() -> CinchError {
    CinchError::BadSignature
}
