//! Tipos de erro para o cliente da API Anthropic.
//!
//! Define [`AnthropicError`] com variantes para rate limiting, erros da API
//! e erros de rede, e a conversão para [`InvokeError`], a classificação
//! usada pelo pool de credenciais.

use thiserror::Error;

use crate::error::InvokeError;
use std::time::Duration;

/// Erros que podem ocorrer ao interagir com a API da Anthropic.
///
/// - [`RateLimited`](AnthropicError::RateLimited): o servidor retornou HTTP 429
/// - [`ApiError`](AnthropicError::ApiError): qualquer outro erro HTTP (4xx/5xx)
/// - [`NetworkError`](AnthropicError::NetworkError): falha na camada de rede
#[derive(Debug, Error)]
pub enum AnthropicError {
    /// O servidor retornou HTTP 429 (rate limit).
    /// `retry_after_ms` vem do cabeçalho `retry-after`, quando presente.
    #[error("rate limited{}", .retry_after_ms.map(|ms| format!(", retry after {ms}ms")).unwrap_or_default())]
    RateLimited { retry_after_ms: Option<u64> },

    /// Erro retornado pela API (ex.: 401 chave inválida, 500 erro interno).
    #[error("API error (status {status}): {message}")]
    ApiError { status: u16, message: String },

    /// Falha de rede subjacente (DNS, conexão recusada, timeout, corpo inválido).
    #[error("network error: {0}")]
    NetworkError(#[from] reqwest::Error),
}

impl From<AnthropicError> for InvokeError {
    fn from(err: AnthropicError) -> Self {
        match err {
            AnthropicError::RateLimited { retry_after_ms } => InvokeError::RateLimited {
                retry_after: retry_after_ms.map(Duration::from_millis),
            },
            AnthropicError::ApiError { status, message } => match status {
                401 | 403 => InvokeError::Auth { status, message },
                402 => InvokeError::Quota(message),
                // A API responde 400 quando o saldo de créditos acaba.
                400 if message.to_lowercase().contains("credit balance") => {
                    InvokeError::Quota(message)
                }
                _ => InvokeError::Provider { status, message },
            },
            AnthropicError::NetworkError(e) if e.is_decode() => {
                InvokeError::MalformedOutput(e.to_string())
            }
            AnthropicError::NetworkError(e) => InvokeError::Network(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limited_display() {
        let err = AnthropicError::RateLimited {
            retry_after_ms: Some(5000),
        };
        assert_eq!(err.to_string(), "rate limited, retry after 5000ms");
        let err = AnthropicError::RateLimited {
            retry_after_ms: None,
        };
        assert_eq!(err.to_string(), "rate limited");
    }

    #[test]
    fn api_error_display() {
        let err = AnthropicError::ApiError {
            status: 401,
            message: "Invalid API key".into(),
        };
        assert_eq!(err.to_string(), "API error (status 401): Invalid API key");
    }

    #[test]
    fn classifies_auth_and_quota() {
        let auth: InvokeError = AnthropicError::ApiError {
            status: 403,
            message: "forbidden".into(),
        }
        .into();
        assert!(matches!(auth, InvokeError::Auth { status: 403, .. }));

        let quota: InvokeError = AnthropicError::ApiError {
            status: 400,
            message: "Your credit balance is too low".into(),
        }
        .into();
        assert!(matches!(quota, InvokeError::Quota(_)));
        assert!(quota.is_credential_fatal());
    }

    #[test]
    fn classifies_transient_failures() {
        let overloaded: InvokeError = AnthropicError::ApiError {
            status: 529,
            message: "overloaded".into(),
        }
        .into();
        assert!(matches!(overloaded, InvokeError::Provider { status: 529, .. }));

        let bad_request: InvokeError = AnthropicError::ApiError {
            status: 400,
            message: "messages: field required".into(),
        }
        .into();
        assert!(!bad_request.is_credential_fatal());

        let limited: InvokeError = AnthropicError::RateLimited {
            retry_after_ms: Some(2000),
        }
        .into();
        assert_eq!(
            limited,
            InvokeError::RateLimited {
                retry_after: Some(Duration::from_secs(2))
            }
        );
    }

    #[test]
    fn error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<AnthropicError>();
    }
}
