use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::client::AnthropicClient;
use super::types::{MessagesRequest, Usage};
use crate::error::InvokeError;
use crate::pool::{Credential, Invoker};

/// A validated generation, ready to be persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Generation {
    pub response_id: String,
    pub model: String,
    pub text: String,
    pub stop_reason: Option<String>,
    pub usage: Usage,
    pub generated_at: DateTime<Utc>,
}

/// Adapts [`AnthropicClient`] to the pool's [`Invoker`] seam.
#[derive(Debug, Clone)]
pub struct AnthropicInvoker {
    client: AnthropicClient,
    probe_model: String,
}

impl AnthropicInvoker {
    pub fn new(client: AnthropicClient, probe_model: impl Into<String>) -> Self {
        Self {
            client,
            probe_model: probe_model.into(),
        }
    }
}

impl Invoker for AnthropicInvoker {
    type Payload = MessagesRequest;
    type Output = Generation;

    async fn invoke(
        &self,
        credential: &Credential,
        payload: &MessagesRequest,
    ) -> Result<Generation, InvokeError> {
        let response = self
            .client
            .send_message(credential.secret(), payload)
            .await?;

        let text = response.text();
        if text.trim().is_empty() {
            return Err(InvokeError::MalformedOutput(format!(
                "response {} contained no text",
                response.id
            )));
        }

        Ok(Generation {
            response_id: response.id,
            model: response.model,
            text,
            stop_reason: response.stop_reason,
            usage: response.usage,
            generated_at: Utc::now(),
        })
    }

    fn probe_payload(&self) -> MessagesRequest {
        MessagesRequest::user(self.probe_model.clone(), 8, "Reply with the single word OK.")
    }
}
