use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use crate::providers::error::ProviderError;
use crate::traits::Embedder;

/// Embedding client for an OpenAI-compatible `/embeddings` endpoint.
pub struct OpenAiEmbedder {
    client: Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl OpenAiEmbedder {
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
}

#[async_trait]
impl Embedder for OpenAiEmbedder {
    async fn embed(
        &self,
        text: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<f32>, ProviderError> {
        let url = format!("{}/embeddings", self.base_url);
        let body = json!({
            "model": self.model,
            "input": text,
        });

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
            .map_err(|e| ProviderError::invalid(format!("non-JSON embeddings response: {}", e)))?;

        let vector = parsed["data"][0]["embedding"]
            .as_array()
            .ok_or_else(|| ProviderError::invalid("embeddings response missing data[0].embedding"))?
            .iter()
            .map(|v| v.as_f64().unwrap_or(0.0) as f32)
            .collect::<Vec<f32>>();

        if vector.is_empty() {
            return Err(ProviderError::invalid("empty embedding vector"));
        }

        Ok(vector)
    }
}
