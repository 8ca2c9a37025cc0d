//! Schema-validated LLM extraction of priority hints from free text. The
//! LLM never produces structural fields; start/end always come from provider
//! metadata.

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::retry::{with_retries, RetryPolicy};
use crate::traits::{ChatMessage, Chatter, ResponseFormat};
use crate::types::Priority;

#[derive(Debug, Clone, PartialEq)]
pub struct LlmExtraction {
    pub priority: Option<Priority>,
    pub is_critical: bool,
    pub is_urgent: bool,
    pub deadline: Option<DateTime<Utc>>,
}

/// Ask the LLM to classify an item. Returns `None` on call failure or when
/// the response fails schema validation, letting the caller fall back to the
/// rule path.
pub async fn classify_item(
    chatter: &dyn Chatter,
    retry: RetryPolicy,
    title: &str,
    description: Option<&str>,
    cancel: &CancellationToken,
) -> Option<LlmExtraction> {
    let messages = vec![
        ChatMessage::system(
            "You analyze calendar events and emails to classify actionable work. \
             Respond with a JSON object: {\"priority\": \"low\"|\"normal\"|\"high\", \
             \"is_critical\": bool, \"is_urgent\": bool, \
             \"deadline\": RFC3339 string or null}. \
             Mark is_critical only for must-do items, is_urgent only for \
             time-sensitive ones.",
        ),
        ChatMessage::user(format!(
            "Title: {}\nDescription: {}",
            title,
            crate::utils::truncate_str(description.unwrap_or(""), 2000)
        )),
    ];

    let result = with_retries(retry, cancel, "extract_llm", || {
        chatter.chat(&messages, ResponseFormat::JsonObject, cancel)
    })
    .await;

    let text = match result {
        Ok(text) => text,
        Err(err) => {
            warn!(title, "extraction LLM call failed, using rules: {}", err);
            return None;
        }
    };

    validate(&text)
}

/// Strict validation: any missing or mistyped field rejects the whole
/// response rather than guessing.
fn validate(text: &str) -> Option<LlmExtraction> {
    let parsed: Value = serde_json::from_str(text).ok()?;
    let obj = parsed.as_object()?;

    let priority = match obj.get("priority") {
        Some(Value::String(s)) => Some(Priority::parse(s)?),
        Some(Value::Null) | None => None,
        _ => return None,
    };
    let is_critical = obj.get("is_critical")?.as_bool()?;
    let is_urgent = obj.get("is_urgent")?.as_bool()?;
    let deadline = match obj.get("deadline") {
        Some(Value::String(s)) => Some(
            DateTime::parse_from_rfc3339(s)
                .ok()?
                .with_timezone(&Utc),
        ),
        Some(Value::Null) | None => None,
        _ => return None,
    };

    Some(LlmExtraction {
        priority,
        is_critical,
        is_urgent,
        deadline,
    })
}
