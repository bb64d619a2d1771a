use std::time::Duration;

use thiserror::Error;

use crate::anthropic::AnthropicError;

#[derive(Debug, Error)]
pub enum KeyswarmError {
    #[error("Config error: {0}")]
    Config(String),

    #[error("No API keys configured. Set `api_keys` in keyswarm.toml or ANTHROPIC_API_KEYS.")]
    NoCredentials,

    #[error("Anthropic API error: {0}")]
    Anthropic(#[from] AnthropicError),

    #[error("Git error: {0}")]
    Git(#[from] git2::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

/// Classified failure of a single upstream invocation.
///
/// Everything except [`Auth`](InvokeError::Auth) and [`Quota`](InvokeError::Quota)
/// is transient: the failover loop moves on to the next credential.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvokeError {
    #[error("attempt timed out after {0:?}")]
    Timeout(Duration),

    #[error("rate limited (retry after {retry_after:?})")]
    RateLimited { retry_after: Option<Duration> },

    #[error("credential rejected (status {status}): {message}")]
    Auth { status: u16, message: String },

    #[error("quota exhausted: {0}")]
    Quota(String),

    #[error("provider error (status {status}): {message}")]
    Provider { status: u16, message: String },

    #[error("network error: {0}")]
    Network(String),

    #[error("malformed output: {0}")]
    MalformedOutput(String),
}

impl InvokeError {
    /// Auth and quota failures say something about the credential itself,
    /// not about the request or the provider's momentary health.
    pub fn is_credential_fatal(&self) -> bool {
        matches!(self, InvokeError::Auth { .. } | InvokeError::Quota(_))
    }
}

/// Every credential attempted for one logical call failed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("pool exhausted for `{task}` after {attempts} attempt(s){}", last_error_suffix(.last_error))]
pub struct PoolExhausted {
    pub task: String,
    pub attempts: usize,
    pub last_error: Option<InvokeError>,
}

fn last_error_suffix(last: &Option<InvokeError>) -> String {
    match last {
        Some(e) => format!(": {e}"),
        None => ": no usable credentials".to_string(),
    }
}

/// Failure to turn a work unit into a request payload.
#[derive(Debug, Error)]
pub enum PayloadError {
    #[error("required input missing: {0}")]
    DataMissing(String),

    #[error(transparent)]
    Source(#[from] anyhow::Error),
}
