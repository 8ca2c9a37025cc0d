//! Normalization of raw provider items into tasks, reminders, or skips.

pub mod llm;
pub mod rules;
pub mod spam;

pub use spam::{SpamClassifier, SpamVerdict};

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::retry::RetryPolicy;
use crate::store::IngestedTask;
use crate::traits::{Chatter, ProviderItem};
use crate::types::{synthetic_external_id, Priority, Source, SyncDirection};

/// What one raw item normalized to.
#[derive(Debug, Clone)]
pub enum NormalizedItem {
    Task(IngestedTask),
    Reminder(ReminderDraft),
    Skip(String),
}

#[derive(Debug, Clone)]
pub struct ReminderDraft {
    pub title: String,
    pub description: Option<String>,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub is_all_day: bool,
    pub external_id: Option<String>,
    pub raw_payload: Value,
}

/// Extraction seam: the ingestion pipeline only sees this interface.
/// Implementations are infallible per item — failures come back as `Skip`.
#[async_trait]
pub trait Extractor: Send + Sync {
    async fn extract(
        &self,
        user: &str,
        source: Source,
        item: &ProviderItem,
        now: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> NormalizedItem;
}

/// Production extractor: source dispatch + spam fusion + LLM-or-rules
/// priority classification.
pub struct ItemExtractor {
    chatter: Option<Arc<dyn Chatter>>,
    spam: SpamClassifier,
    retry: RetryPolicy,
}

impl ItemExtractor {
    pub fn new(
        chatter: Option<Arc<dyn Chatter>>,
        spam_threshold: f64,
        retry: RetryPolicy,
    ) -> Self {
        let spam = SpamClassifier::new(chatter.clone(), spam_threshold, retry);
        Self {
            chatter,
            spam,
            retry,
        }
    }

    async fn classify_text(
        &self,
        title: &str,
        description: Option<&str>,
        now: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> (Priority, bool, bool, Option<DateTime<Utc>>) {
        if let Some(chatter) = &self.chatter {
            if let Some(extraction) =
                llm::classify_item(chatter.as_ref(), self.retry, title, description, cancel).await
            {
                let priority =
                    rules::map_priority(extraction.priority, extraction.deadline, now);
                return (
                    priority,
                    extraction.is_critical,
                    extraction.is_urgent,
                    extraction.deadline,
                );
            }
        }

        // Rule path: keyword hints over title + description.
        let text = format!("{} {}", title, description.unwrap_or(""));
        let deadline = rules::deadline_hint(&text, now);
        let priority = rules::map_priority(rules::priority_hint(&text), deadline, now);
        (
            priority,
            rules::is_critical_hint(&text),
            rules::is_urgent_hint(&text),
            deadline,
        )
    }

    async fn extract_calendar(
        &self,
        user: &str,
        item: &ProviderItem,
        now: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> anyhow::Result<NormalizedItem> {
        let event = &item.payload;

        if event["status"].as_str() == Some("cancelled") {
            return Ok(NormalizedItem::Skip("cancelled".to_string()));
        }

        let title = event["summary"].as_str().unwrap_or("Untitled event").to_string();
        let description = event["description"].as_str().map(|s| s.to_string());
        let location = event["location"].as_str().map(|s| s.to_string());
        let recurrence = event["recurrence"][0].as_str().map(|s| s.to_string());

        let (start, end, is_all_day) = match parse_event_window(event)? {
            Some(window) => window,
            None => {
                // A series master arrives without a concrete occurrence time;
                // occurrences come as their own items.
                let reason = if recurrence.is_some() {
                    "series_master_without_occurrences"
                } else {
                    "missing_start_time"
                };
                return Ok(NormalizedItem::Skip(reason.to_string()));
            }
        };

        let attendees: Vec<String> = event["attendees"]
            .as_array()
            .map(|a| {
                a.iter()
                    .filter_map(|v| v["email"].as_str().map(|s| s.to_string()))
                    .collect()
            })
            .unwrap_or_default();

        let is_reminder_event = event["eventType"].as_str() == Some("reminder");
        if is_all_day || is_reminder_event {
            return Ok(NormalizedItem::Reminder(ReminderDraft {
                title,
                description,
                start,
                end,
                is_all_day,
                external_id: item.external_id.clone(),
                raw_payload: event.clone(),
            }));
        }

        let (priority, is_critical, is_urgent, _) = self
            .classify_text(&title, description.as_deref(), now, cancel)
            .await;

        let external_id = item
            .external_id
            .clone()
            .unwrap_or_else(|| synthetic_external_id(user, Source::Calendar, &title, start, end));

        Ok(NormalizedItem::Task(IngestedTask {
            title,
            description,
            start,
            end,
            attendees,
            location,
            recurrence,
            priority,
            is_critical,
            is_urgent,
            is_spam: false,
            spam_reason: None,
            spam_score: None,
            raw_payload: event.clone(),
            external_id,
            external_updated_at: item.external_updated_at,
            sync_direction: SyncDirection::Inbound,
        }))
    }

    async fn extract_mail(
        &self,
        user: &str,
        item: &ProviderItem,
        now: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> anyhow::Result<NormalizedItem> {
        let mail = &item.payload;
        let subject = mail["subject"].as_str().unwrap_or("(no subject)").to_string();
        let body = mail["body_text"].as_str().map(|s| s.to_string());
        let received = mail["date"]
            .as_str()
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or(now);

        // Structural fields come from provider metadata: the message's
        // received time anchors the task.
        let start = received;
        let end = received + chrono::Duration::minutes(30);

        let verdict = self.spam.classify(mail, cancel).await;
        let external_id = item
            .external_id
            .clone()
            .unwrap_or_else(|| synthetic_external_id(user, Source::Mail, &subject, start, end));

        if verdict.is_spam {
            // Spam is persisted (so re-ingest stays idempotent and the user
            // can audit it) but never planned or nudged.
            return Ok(NormalizedItem::Task(IngestedTask {
                title: subject,
                description: body,
                start,
                end,
                attendees: vec![],
                location: None,
                recurrence: None,
                priority: Priority::Low,
                is_critical: false,
                is_urgent: false,
                is_spam: true,
                spam_reason: verdict.reason,
                spam_score: Some(verdict.score),
                raw_payload: mail.clone(),
                external_id,
                external_updated_at: item.external_updated_at,
                sync_direction: SyncDirection::Inbound,
            }));
        }

        let (priority, is_critical, is_urgent, deadline) = self
            .classify_text(&subject, body.as_deref(), now, cancel)
            .await;

        let actionable =
            deadline.is_some() || priority != Priority::Normal || is_critical || is_urgent;
        if !actionable {
            return Ok(NormalizedItem::Skip("no_action_required".to_string()));
        }

        Ok(NormalizedItem::Task(IngestedTask {
            title: subject,
            description: body,
            start,
            end,
            attendees: vec![],
            location: None,
            recurrence: None,
            priority,
            is_critical,
            is_urgent,
            is_spam: false,
            spam_reason: None,
            spam_score: Some(verdict.score),
            raw_payload: mail.clone(),
            external_id,
            external_updated_at: item.external_updated_at,
            sync_direction: SyncDirection::Inbound,
        }))
    }

    fn extract_task_manager(
        &self,
        user: &str,
        item: &ProviderItem,
        now: DateTime<Utc>,
    ) -> anyhow::Result<NormalizedItem> {
        let payload = &item.payload;
        let title = payload["content"]
            .as_str()
            .or_else(|| payload["title"].as_str())
            .unwrap_or("Untitled task")
            .to_string();
        let description = payload["description"].as_str().map(|s| s.to_string());

        let (start, end) = match task_manager_window(payload)? {
            Some(window) => window,
            None => (now, now + chrono::Duration::minutes(30)),
        };

        let provider_priority = payload["priority"].as_i64().unwrap_or(1);
        let priority = match provider_priority {
            1 => Priority::Low,
            2 => Priority::Normal,
            _ => Priority::High,
        };

        let external_id = item
            .external_id
            .clone()
            .unwrap_or_else(|| synthetic_external_id(user, Source::TaskManager, &title, start, end));

        Ok(NormalizedItem::Task(IngestedTask {
            title,
            description,
            start,
            end,
            attendees: vec![],
            location: None,
            recurrence: payload["due"]["is_recurring"]
                .as_bool()
                .unwrap_or(false)
                .then(|| payload["due"]["string"].as_str().unwrap_or("recurring").to_string()),
            priority,
            is_critical: provider_priority >= 3,
            is_urgent: provider_priority >= 4,
            is_spam: false,
            spam_reason: None,
            spam_score: None,
            raw_payload: payload.clone(),
            external_id,
            external_updated_at: item.external_updated_at,
            sync_direction: SyncDirection::Bidirectional,
        }))
    }
}

#[async_trait]
impl Extractor for ItemExtractor {
    async fn extract(
        &self,
        user: &str,
        source: Source,
        item: &ProviderItem,
        now: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> NormalizedItem {
        let result = match source {
            Source::Calendar => self.extract_calendar(user, item, now, cancel).await,
            Source::Mail => self.extract_mail(user, item, now, cancel).await,
            Source::TaskManager => self.extract_task_manager(user, item, now),
            Source::Manual => Err(anyhow::anyhow!("manual tasks are not ingested")),
        };

        match result {
            Ok(normalized) => normalized,
            Err(err) => NormalizedItem::Skip(format!("extraction_failed: {}", err)),
        }
    }
}

/// Pull (start, end, is_all_day) out of a calendar payload. `None` means
/// the event has no concrete occurrence time.
fn parse_event_window(
    event: &Value,
) -> anyhow::Result<Option<(DateTime<Utc>, DateTime<Utc>, bool)>> {
    let start_obj = &event["start"];
    let end_obj = &event["end"];

    if let Some(start_str) = start_obj["dateTime"].as_str() {
        let start = DateTime::parse_from_rfc3339(start_str)
            .map_err(|e| anyhow::anyhow!("bad start.dateTime '{}': {}", start_str, e))?
            .with_timezone(&Utc);
        let end = match end_obj["dateTime"].as_str() {
            Some(end_str) => DateTime::parse_from_rfc3339(end_str)
                .map_err(|e| anyhow::anyhow!("bad end.dateTime '{}': {}", end_str, e))?
                .with_timezone(&Utc),
            None => start + chrono::Duration::minutes(30),
        };
        return Ok(Some((start, end, false)));
    }

    if let Some(date_str) = start_obj["date"].as_str() {
        let date: chrono::NaiveDate = date_str
            .parse()
            .map_err(|e| anyhow::anyhow!("bad start.date '{}': {}", date_str, e))?;
        let start = Utc.from_utc_datetime(&date.and_hms_opt(0, 0, 0).unwrap());
        let end = Utc.from_utc_datetime(&date.and_hms_opt(23, 59, 59).unwrap());
        return Ok(Some((start, end, true)));
    }

    Ok(None)
}

/// Task-manager due field: a datetime gives a half-hour slot; a bare date
/// gives a working-day slot.
fn task_manager_window(
    payload: &Value,
) -> anyhow::Result<Option<(DateTime<Utc>, DateTime<Utc>)>> {
    let due = &payload["due"];
    if due.is_null() {
        return Ok(None);
    }

    if let Some(dt_str) = due["datetime"].as_str() {
        let start = DateTime::parse_from_rfc3339(dt_str)
            .map_err(|e| anyhow::anyhow!("bad due.datetime '{}': {}", dt_str, e))?
            .with_timezone(&Utc);
        return Ok(Some((start, start + chrono::Duration::minutes(30))));
    }

    if let Some(date_str) = due["date"].as_str() {
        let date: chrono::NaiveDate = date_str
            .parse()
            .map_err(|e| anyhow::anyhow!("bad due.date '{}': {}", date_str, e))?;
        let start = Utc.from_utc_datetime(&date.and_hms_opt(9, 0, 0).unwrap());
        let end = Utc.from_utc_datetime(&date.and_hms_opt(17, 0, 0).unwrap());
        return Ok(Some((start, end)));
    }

    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn extractor() -> ItemExtractor {
        ItemExtractor::new(None, 0.7, RetryPolicy::default())
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 11, 8, 9, 0, 0).unwrap()
    }

    fn cancel() -> CancellationToken {
        CancellationToken::new()
    }

    fn calendar_item(payload: Value) -> ProviderItem {
        ProviderItem {
            external_id: payload["id"].as_str().map(|s| s.to_string()),
            external_updated_at: None,
            payload,
        }
    }

    #[tokio::test]
    async fn timed_event_becomes_task() {
        let item = calendar_item(json!({
            "id": "ev-1",
            "summary": "Project sync",
            "start": {"dateTime": "2025-11-08T10:00:00Z"},
            "end": {"dateTime": "2025-11-08T10:30:00Z"},
            "attendees": [{"email": "a@x.test"}],
        }));

        let normalized = extractor()
            .extract("u1", Source::Calendar, &item, now(), &cancel())
            .await;
        let NormalizedItem::Task(task) = normalized else {
            panic!("expected task");
        };
        assert_eq!(task.title, "Project sync");
        assert_eq!(task.external_id, "ev-1");
        assert_eq!(task.attendees, vec!["a@x.test"]);
        assert_eq!(task.priority, Priority::Normal);
        assert!(!task.is_spam);
    }

    #[tokio::test]
    async fn cancelled_event_skipped() {
        let item = calendar_item(json!({
            "id": "ev-3",
            "summary": "Old meeting",
            "status": "cancelled",
            "start": {"dateTime": "2025-11-08T10:00:00Z"},
            "end": {"dateTime": "2025-11-08T11:00:00Z"},
        }));
        let normalized = extractor()
            .extract("u1", Source::Calendar, &item, now(), &cancel())
            .await;
        assert!(matches!(normalized, NormalizedItem::Skip(reason) if reason == "cancelled"));
    }

    #[tokio::test]
    async fn all_day_event_becomes_reminder() {
        let item = calendar_item(json!({
            "id": "ev-4",
            "summary": "Dana's birthday",
            "start": {"date": "2025-11-08"},
            "end": {"date": "2025-11-09"},
        }));
        let normalized = extractor()
            .extract("u1", Source::Calendar, &item, now(), &cancel())
            .await;
        let NormalizedItem::Reminder(reminder) = normalized else {
            panic!("expected reminder");
        };
        assert!(reminder.is_all_day);
        assert_eq!(reminder.title, "Dana's birthday");
    }

    #[tokio::test]
    async fn series_master_without_time_skipped() {
        let item = calendar_item(json!({
            "id": "ev-5",
            "summary": "Weekly 1:1",
            "recurrence": ["RRULE:FREQ=WEEKLY"],
            "start": {},
            "end": {},
        }));
        let normalized = extractor()
            .extract("u1", Source::Calendar, &item, now(), &cancel())
            .await;
        assert!(
            matches!(normalized, NormalizedItem::Skip(reason) if reason == "series_master_without_occurrences")
        );
    }

    #[tokio::test]
    async fn recurrence_passes_through() {
        let item = calendar_item(json!({
            "id": "ev-2",
            "summary": "Standup",
            "recurrence": ["RRULE:FREQ=DAILY"],
            "start": {"dateTime": "2025-11-08T11:00:00Z"},
            "end": {"dateTime": "2025-11-08T11:15:00Z"},
        }));
        let normalized = extractor()
            .extract("u1", Source::Calendar, &item, now(), &cancel())
            .await;
        let NormalizedItem::Task(task) = normalized else {
            panic!("expected task");
        };
        assert_eq!(task.recurrence.as_deref(), Some("RRULE:FREQ=DAILY"));
    }

    #[tokio::test]
    async fn urgent_title_raises_priority_by_rules() {
        let item = calendar_item(json!({
            "id": "ev-6",
            "summary": "URGENT: incident review",
            "start": {"dateTime": "2025-11-08T10:00:00Z"},
            "end": {"dateTime": "2025-11-08T11:00:00Z"},
        }));
        let normalized = extractor()
            .extract("u1", Source::Calendar, &item, now(), &cancel())
            .await;
        let NormalizedItem::Task(task) = normalized else {
            panic!("expected task");
        };
        assert_eq!(task.priority, Priority::High);
        assert!(task.is_urgent);
    }

    #[tokio::test]
    async fn promotional_mail_is_spam_task() {
        let item = ProviderItem {
            external_id: Some("msg-1".to_string()),
            external_updated_at: None,
            payload: json!({
                "subject": "50% off membership!",
                "sender": "deals@mail.club.test",
                "date": "2025-11-08T08:00:00Z",
                "body_text": "limited time offer, unsubscribe below",
                "labels": ["PROMOTIONS"],
            }),
        };
        let normalized = extractor()
            .extract("u1", Source::Mail, &item, now(), &cancel())
            .await;
        let NormalizedItem::Task(task) = normalized else {
            panic!("expected task");
        };
        assert!(task.is_spam);
        assert!(task.spam_reason.is_some());
        assert!(task.spam_score.unwrap() >= 0.7);
    }

    #[tokio::test]
    async fn actionable_mail_becomes_task() {
        let item = ProviderItem {
            external_id: Some("msg-2".to_string()),
            external_updated_at: None,
            payload: json!({
                "subject": "Please send the contract by 2025-11-08",
                "sender": "dana@partner.test",
                "date": "2025-11-08T08:00:00Z",
                "body_text": "we need the signed copy asap",
                "labels": [],
            }),
        };
        let normalized = extractor()
            .extract("u1", Source::Mail, &item, now(), &cancel())
            .await;
        let NormalizedItem::Task(task) = normalized else {
            panic!("expected task");
        };
        assert!(!task.is_spam);
        assert_eq!(task.priority, Priority::High);
        // Structural fields come from the message, not the deadline text.
        assert_eq!(task.start, Utc.with_ymd_and_hms(2025, 11, 8, 8, 0, 0).unwrap());
    }

    #[tokio::test]
    async fn non_actionable_mail_skipped() {
        let item = ProviderItem {
            external_id: Some("msg-3".to_string()),
            external_updated_at: None,
            payload: json!({
                "subject": "Lunch photos",
                "sender": "friend@example.test",
                "date": "2025-11-08T08:00:00Z",
                "body_text": "great seeing you!",
                "labels": [],
            }),
        };
        let normalized = extractor()
            .extract("u1", Source::Mail, &item, now(), &cancel())
            .await;
        assert!(
            matches!(normalized, NormalizedItem::Skip(reason) if reason == "no_action_required")
        );
    }

    #[tokio::test]
    async fn task_manager_item_maps_priority() {
        let item = ProviderItem {
            external_id: Some("td-1".to_string()),
            external_updated_at: Some(now()),
            payload: json!({
                "id": "td-1",
                "content": "Renew passport",
                "priority": 4,
                "due": {"datetime": "2025-11-09T10:00:00Z"},
            }),
        };
        let normalized = extractor()
            .extract("u1", Source::TaskManager, &item, now(), &cancel())
            .await;
        let NormalizedItem::Task(task) = normalized else {
            panic!("expected task");
        };
        assert_eq!(task.priority, Priority::High);
        assert!(task.is_critical);
        assert!(task.is_urgent);
        assert_eq!(task.sync_direction, SyncDirection::Bidirectional);
        assert_eq!(task.start, Utc.with_ymd_and_hms(2025, 11, 9, 10, 0, 0).unwrap());
    }

    #[tokio::test]
    async fn task_manager_date_only_due_gets_working_slot() {
        let item = ProviderItem {
            external_id: Some("td-2".to_string()),
            external_updated_at: None,
            payload: json!({
                "id": "td-2",
                "content": "Water the plants",
                "priority": 1,
                "due": {"date": "2025-11-09"},
            }),
        };
        let normalized = extractor()
            .extract("u1", Source::TaskManager, &item, now(), &cancel())
            .await;
        let NormalizedItem::Task(task) = normalized else {
            panic!("expected task");
        };
        assert_eq!(task.start, Utc.with_ymd_and_hms(2025, 11, 9, 9, 0, 0).unwrap());
        assert_eq!(task.end, Utc.with_ymd_and_hms(2025, 11, 9, 17, 0, 0).unwrap());
        assert_eq!(task.priority, Priority::Low);
    }

    #[tokio::test]
    async fn bad_payload_isolated_as_skip() {
        let item = calendar_item(json!({
            "id": "ev-7",
            "summary": "Broken",
            "start": {"dateTime": "not a timestamp"},
            "end": {"dateTime": "also bad"},
        }));
        let normalized = extractor()
            .extract("u1", Source::Calendar, &item, now(), &cancel())
            .await;
        assert!(matches!(normalized, NormalizedItem::Skip(reason) if reason.starts_with("extraction_failed")));
    }

    #[tokio::test]
    async fn missing_external_id_gets_synthetic_one() {
        let item = calendar_item(json!({
            "summary": "No id event",
            "start": {"dateTime": "2025-11-08T10:00:00Z"},
            "end": {"dateTime": "2025-11-08T10:30:00Z"},
        }));
        let normalized = extractor()
            .extract("u1", Source::Calendar, &item, now(), &cancel())
            .await;
        let NormalizedItem::Task(task) = normalized else {
            panic!("expected task");
        };
        assert!(task.external_id.starts_with("local-"));
    }
}
