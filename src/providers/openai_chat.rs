use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::providers::error::ProviderError;
use crate::traits::{ChatMessage, Chatter, ResponseFormat};

/// Chat client for any OpenAI-compatible completions endpoint.
pub struct OpenAiChatter {
    client: Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl OpenAiChatter {
    pub fn new(
        base_url: &str,
        api_key: &str,
        model: &str,
        timeout: Duration,
    ) -> Result<Self, String> {
        super::validate_base_url(base_url)?;
        let client = super::build_http_client(timeout)?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            model: model.to_string(),
        })
    }

    fn build_body(&self, messages: &[ChatMessage], format: &ResponseFormat) -> Value {
        let messages: Vec<Value> = messages
            .iter()
            .map(|m| json!({"role": m.role, "content": m.content}))
            .collect();

        let mut body = json!({
            "model": self.model,
            "messages": messages,
        });

        match format {
            ResponseFormat::Text => {}
            ResponseFormat::JsonObject => {
                body["response_format"] = json!({"type": "json_object"});
            }
            ResponseFormat::JsonSchema { name, schema } => {
                body["response_format"] = json!({
                    "type": "json_schema",
                    "json_schema": {
                        "name": name,
                        "schema": schema,
                        "strict": true,
                    }
                });
            }
        }

        body
    }
}

#[async_trait]
impl Chatter for OpenAiChatter {
    async fn chat(
        &self,
        messages: &[ChatMessage],
        format: ResponseFormat,
        cancel: &CancellationToken,
    ) -> Result<String, ProviderError> {
        let url = format!("{}/chat/completions", self.base_url);
        let body = self.build_body(messages, &format);

        debug!(model = %self.model, messages = messages.len(), "LLM chat request");

        let request = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&body)
            .send();

        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(ProviderError::cancelled()),
            result = request => result.map_err(|e| ProviderError::network(&e))?,
        };

        let status = response.status().as_u16();
        let text = tokio::select! {
            _ = cancel.cancelled() => return Err(ProviderError::cancelled()),
            result = response.text() => result.map_err(|e| ProviderError::network(&e))?,
        };

        if status != 200 {
            return Err(ProviderError::from_status(status, &text));
        }

        let parsed: Value = serde_json::from_str(&text)
            .map_err(|e| ProviderError::invalid(format!("non-JSON chat response: {}", e)))?;

        let content = parsed["choices"][0]["message"]["content"]
            .as_str()
            .map(|s| s.to_string());

        match content {
            Some(content) if !content.is_empty() => Ok(content),
            _ => {
                warn!(model = %self.model, "LLM returned empty content");
                Err(ProviderError::invalid("empty LLM response content"))
            }
        }
    }
}
