//! Plan composition: a schema-validated LLM pass with a deterministic
//! fallback. The LLM arranges the day and writes action steps; scores,
//! flags, and titles always come from the scored candidates.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::retry::{with_retries, RetryPolicy};
use crate::traits::{ChatMessage, Chatter, ResponseFormat};
use crate::types::{EntryStatus, PlanEntry, Task};

/// A task that survived candidate filtering, with its scores and predicted
/// window already computed.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub task: Task,
    /// Published deterministic score.
    pub score: f64,
    /// Ordering score (score after snooze damping); never persisted.
    pub effective_score: f64,
    pub predicted_start: DateTime<Utc>,
    pub predicted_end: DateTime<Utc>,
}

static DEFAULT_PROMO_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"(?i)% off",
        r"(?i)\bpercent off\b",
        r"(?i)\bsale\b",
        r"(?i)\bdiscount\b",
        r"(?i)\bcoupon\b",
        r"(?i)\bmembership!\b",
        r"(?i)\bunsubscribe\b",
        r"(?i)\blimited[- ]time\b",
    ]
    .iter()
    .map(|p| Regex::new(p).unwrap())
    .collect()
});

pub fn default_promo_patterns() -> &'static [Regex] {
    &DEFAULT_PROMO_PATTERNS
}

/// Safety net against spam leaking through extraction: drop entries whose
/// title matches a promotional pattern.
pub fn drop_promotional(entries: Vec<PlanEntry>, patterns: &[Regex]) -> Vec<PlanEntry> {
    entries
        .into_iter()
        .filter(|entry| {
            let promotional = patterns.iter().any(|re| re.is_match(&entry.title));
            if promotional {
                warn!(title = %entry.title, "dropping promotional entry from plan");
            }
            !promotional
        })
        .collect()
}

/// Deterministic composition from already-ordered candidates: predicted
/// windows as computed, no action plans.
pub fn deterministic_entries(candidates: &[Candidate]) -> Vec<PlanEntry> {
    candidates
        .iter()
        .map(|c| PlanEntry {
            task_id: c.task.id.clone(),
            title: c.task.title.clone(),
            predicted_start: c.predicted_start,
            predicted_end: c.predicted_end,
            priority_score: c.score,
            is_critical: c.task.is_critical,
            is_urgent: c.task.is_urgent,
            action_plan: vec![],
            status: EntryStatus::Pending,
        })
        .collect()
}

/// One LLM pass with a single stricter retry on schema failure. `None`
/// means the caller should fall back to [`deterministic_entries`].
pub async fn compose_with_llm(
    chatter: &dyn Chatter,
    retry: RetryPolicy,
    candidates: &[Candidate],
    energy: u8,
    date: chrono::NaiveDate,
    cancel: &CancellationToken,
) -> Option<Vec<PlanEntry>> {
    let user_prompt = build_prompt(candidates, energy, date);

    for strict in [false, true] {
        let system = if strict {
            "You are a daily planning assistant. Your previous response failed schema \
             validation. Respond with ONLY a JSON object, no prose, exactly matching: \
             {\"entries\": [{\"task_id\": string (one of the given ids), \
             \"predicted_start\": RFC3339, \"predicted_end\": RFC3339, \
             \"action_plan\": [1 to 6 short strings]}]}"
        } else {
            "You are a daily planning assistant. Arrange the given tasks into a realistic \
             schedule for the plan date, placing critical tasks early and matching task \
             complexity to the user's energy. Respond with a JSON object: \
             {\"entries\": [{\"task_id\": string, \"predicted_start\": RFC3339, \
             \"predicted_end\": RFC3339, \"action_plan\": [1-6 short steps]}]}. \
             Use only the provided task ids and keep every entry on the plan date."
        };

        let messages = vec![
            ChatMessage::system(system),
            ChatMessage::user(user_prompt.clone()),
        ];

        let response = with_retries(retry, cancel, "plan_llm", || {
            chatter.chat(&messages, ResponseFormat::JsonObject, cancel)
        })
        .await;

        let text = match response {
            Ok(text) => text,
            Err(err) => {
                warn!("plan LLM call failed: {}", err);
                return None;
            }
        };

        if let Some(entries) = validate_response(&text, candidates) {
            return Some(entries);
        }
        warn!(strict, "plan LLM response failed schema validation");
    }

    None
}

fn build_prompt(candidates: &[Candidate], energy: u8, date: chrono::NaiveDate) -> String {
    let tasks: Vec<Value> = candidates
        .iter()
        .map(|c| {
            json!({
                "task_id": c.task.id,
                "title": c.task.title,
                "window": {
                    "start": c.predicted_start.to_rfc3339(),
                    "end": c.predicted_end.to_rfc3339(),
                },
                "priority": c.task.priority.as_str(),
                "priority_score": c.score,
                "is_critical": c.task.is_critical,
                "is_urgent": c.task.is_urgent,
                "location": c.task.location,
                "attendees": c.task.attendees,
            })
        })
        .collect();

    format!(
        "Plan date: {}\nUser energy level: {}/5\nTasks (highest priority first):\n{}",
        date,
        energy,
        serde_json::to_string_pretty(&json!(tasks)).unwrap_or_default()
    )
}

/// Strict schema validation. Anything off — unknown id, unparseable time,
/// inverted window, empty or oversized action plan — rejects the response.
fn validate_response(text: &str, candidates: &[Candidate]) -> Option<Vec<PlanEntry>> {
    let by_id: HashMap<&str, &Candidate> = candidates
        .iter()
        .map(|c| (c.task.id.as_str(), c))
        .collect();

    let parsed: Value = serde_json::from_str(text).ok()?;
    let raw_entries = parsed["entries"].as_array()?;
    if raw_entries.is_empty() {
        return None;
    }

    let mut entries = Vec::with_capacity(raw_entries.len());
    for raw in raw_entries {
        let task_id = raw["task_id"].as_str()?;
        let candidate = by_id.get(task_id)?;

        let predicted_start = parse_rfc3339(raw["predicted_start"].as_str()?)?;
        let predicted_end = parse_rfc3339(raw["predicted_end"].as_str()?)?;
        if predicted_end < predicted_start {
            return None;
        }

        let action_plan: Vec<String> = raw["action_plan"]
            .as_array()?
            .iter()
            .map(|v| v.as_str().map(|s| s.to_string()))
            .collect::<Option<Vec<_>>>()?;
        if action_plan.is_empty() || action_plan.len() > 6 {
            return None;
        }

        entries.push(PlanEntry {
            task_id: task_id.to_string(),
            title: candidate.task.title.clone(),
            predicted_start,
            predicted_end,
            priority_score: candidate.score,
            is_critical: candidate.task.is_critical,
            is_urgent: candidate.task.is_urgent,
            action_plan,
            status: EntryStatus::Pending,
        });
    }

    Some(entries)
}

fn parse_rfc3339(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}
