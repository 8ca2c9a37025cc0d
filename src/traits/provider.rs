use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::providers::error::ProviderError;
use crate::types::Notification;

/// One chat message sent to the LLM.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

/// Response shape requested from the LLM.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum ResponseFormat {
    #[default]
    Text,
    /// Provider must return a JSON object.
    JsonObject,
    /// Provider should enforce a specific JSON schema.
    JsonSchema { name: String, schema: Value },
}

/// LLM seam — sends messages, gets back raw text (JSON text when a JSON
/// response format was requested). No part of the core operates on the
/// response before it passes schema validation at the call site.
#[async_trait]
pub trait Chatter: Send + Sync {
    async fn chat(
        &self,
        messages: &[ChatMessage],
        format: ResponseFormat,
        cancel: &CancellationToken,
    ) -> Result<String, ProviderError>;
}

/// Embedding provider seam.
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(
        &self,
        text: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<f32>, ProviderError>;
}

/// External vector store. The core only writes; consumers query similarity
/// out of band.
#[async_trait]
pub trait VectorStore: Send + Sync {
    async fn upsert(
        &self,
        task_id: &str,
        embedding: Vec<f32>,
        metadata: Value,
    ) -> anyhow::Result<()>;
}

/// Out-of-band delivery channel for nudges (email today). Best-effort:
/// failures are logged by the caller and never revert in-app delivery.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn deliver(&self, to: &str, notification: &Notification) -> anyhow::Result<()>;
}
