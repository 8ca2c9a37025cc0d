//! LLM and embedding provider implementations over an OpenAI-compatible API.

pub mod error;
mod openai_chat;
mod openai_embeddings;

pub use error::{ProviderError, ProviderErrorKind};
pub use openai_chat::OpenAiChatter;
pub use openai_embeddings::OpenAiEmbedder;

use std::time::Duration;

/// Shared HTTP client with a sane connect timeout and an overall per-request
/// timeout supplied by config.
pub fn build_http_client(timeout: Duration) -> Result<reqwest::Client, String> {
    reqwest::Client::builder()
        .timeout(timeout)
        .connect_timeout(Duration::from_secs(10))
        .build()
        .map_err(|e| format!("failed to build HTTP client: {}", e))
}

/// Validate the base URL: HTTPS required except for localhost.
pub(crate) fn validate_base_url(base_url: &str) -> Result<(), String> {
    let parsed = reqwest::Url::parse(base_url)
        .map_err(|e| format!("invalid base_url '{}': {}", base_url, e))?;

    match parsed.scheme() {
        "https" => Ok(()),
        "http" => {
            let host = parsed.host_str().unwrap_or("");
            let is_localhost =
                host == "localhost" || host == "127.0.0.1" || host == "[::1]" || host == "::1";
            if is_localhost {
                Ok(())
            } else {
                Err(format!(
                    "HTTP is not allowed for remote URLs (base_url: '{}'); use HTTPS",
                    base_url
                ))
            }
        }
        other => Err(format!("unsupported URL scheme '{}' in base_url", other)),
    }
}
