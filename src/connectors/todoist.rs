//! Todoist REST client: paginated-style listing for ingest plus the CRUD
//! surface the sync engine pushes through.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use crate::providers::error::ProviderError;
use crate::traits::{
    FetchWindow, ItemSource, ProviderItem, ProviderPage, RemoteChange, RemoteChangePage,
    RemoteTask, RemoteTaskDraft, TaskManagerClient,
};
use crate::types::{Priority, ProviderCredential, Source};

const DEFAULT_BASE_URL: &str = "https://api.todoist.com/rest/v2";

pub struct TodoistClient {
    client: Client,
    base_url: String,
}

impl TodoistClient {
    pub fn new(timeout: Duration) -> Result<Self, String> {
        Self::with_base_url(DEFAULT_BASE_URL, timeout)
    }

    pub fn with_base_url(base_url: &str, timeout: Duration) -> Result<Self, String> {
        crate::providers::validate_base_url(base_url)?;
        let client = crate::providers::build_http_client(timeout)?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    async fn request(
        &self,
        credential: &ProviderCredential,
        method: reqwest::Method,
        path: &str,
        body: Option<Value>,
        cancel: &CancellationToken,
    ) -> Result<(u16, String), ProviderError> {
        let url = format!("{}{}", self.base_url, path);
        let mut request = self
            .client
            .request(method, &url)
            .header("Authorization", format!("Bearer {}", credential.access_token));
        if let Some(body) = body {
            request = request.json(&body);
        }

        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(ProviderError::cancelled()),
            result = request.send() => result.map_err(|e| ProviderError::network(&e))?,
        };

        let status = response.status().as_u16();
        let text = tokio::select! {
            _ = cancel.cancelled() => return Err(ProviderError::cancelled()),
            result = response.text() => result.map_err(|e| ProviderError::network(&e))?,
        };

        Ok((status, text))
    }
}

fn priority_to_todoist(priority: Priority) -> i64 {
    match priority {
        Priority::Low => 1,
        Priority::Normal => 2,
        Priority::High => 3,
    }
}

fn priority_from_todoist(value: i64) -> Priority {
    match value {
        1 => Priority::Low,
        2 => Priority::Normal,
        _ => Priority::High,
    }
}

fn parse_due(task: &Value) -> Option<DateTime<Utc>> {
    let due = &task["due"];
    if let Some(dt) = due["datetime"].as_str() {
        return DateTime::parse_from_rfc3339(dt)
            .ok()
            .map(|dt| dt.with_timezone(&Utc));
    }
    let date: chrono::NaiveDate = due["date"].as_str()?.parse().ok()?;
    date.and_hms_opt(17, 0, 0)
        .map(|naive| DateTime::from_naive_utc_and_offset(naive, Utc))
}

fn remote_from_payload(task: &Value) -> Result<RemoteTask, ProviderError> {
    let external_id = task["id"]
        .as_str()
        .map(|s| s.to_string())
        .or_else(|| task["id"].as_i64().map(|n| n.to_string()))
        .ok_or_else(|| ProviderError::invalid("task without id in provider response"))?;

    let external_updated_at = task["updated_at"]
        .as_str()
        .or_else(|| task["created_at"].as_str())
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(Utc::now);

    Ok(RemoteTask {
        external_id,
        title: task["content"].as_str().unwrap_or("Untitled task").to_string(),
        description: task["description"]
            .as_str()
            .filter(|s| !s.is_empty())
            .map(|s| s.to_string()),
        due: parse_due(task),
        priority: priority_from_todoist(task["priority"].as_i64().unwrap_or(1)),
        is_completed: task["is_completed"].as_bool().unwrap_or(false),
        external_updated_at,
        payload: task.clone(),
    })
}

fn draft_to_payload(draft: &RemoteTaskDraft) -> Value {
    let mut body = json!({
        "content": draft.title,
        "priority": priority_to_todoist(draft.priority),
    });
    if let Some(description) = &draft.description {
        body["description"] = json!(description);
    }
    if let Some(due) = draft.due {
        body["due_datetime"] = json!(due.to_rfc3339());
    }
    body
}

#[async_trait]
impl TaskManagerClient for TodoistClient {
    /// The REST surface has no delta endpoint; each cycle lists all open
    /// tasks and the engine reconciles against `external_updated_at`.
    async fn list_changes(
        &self,
        credential: &ProviderCredential,
        _since: Option<DateTime<Utc>>,
        _cursor: Option<String>,
        cancel: &CancellationToken,
    ) -> Result<RemoteChangePage, ProviderError> {
        let (status, text) = self
            .request(credential, reqwest::Method::GET, "/tasks", None, cancel)
            .await?;
        if status != 200 {
            return Err(ProviderError::from_status(status, &text));
        }

        let tasks: Value = serde_json::from_str(&text)
            .map_err(|e| ProviderError::invalid(format!("non-JSON task list: {}", e)))?;
        let tasks = tasks
            .as_array()
            .ok_or_else(|| ProviderError::invalid("task list is not an array"))?;

        let mut changes = Vec::with_capacity(tasks.len());
        for task in tasks {
            changes.push(RemoteChange {
                task: remote_from_payload(task)?,
                deleted: false,
            });
        }

        Ok(RemoteChangePage {
            changes,
            next_cursor: None,
        })
    }

    async fn create(
        &self,
        credential: &ProviderCredential,
        draft: &RemoteTaskDraft,
        cancel: &CancellationToken,
    ) -> Result<RemoteTask, ProviderError> {
        let (status, text) = self
            .request(
                credential,
                reqwest::Method::POST,
                "/tasks",
                Some(draft_to_payload(draft)),
                cancel,
            )
            .await?;
        if status != 200 {
            return Err(ProviderError::from_status(status, &text));
        }
        let task: Value = serde_json::from_str(&text)
            .map_err(|e| ProviderError::invalid(format!("non-JSON create response: {}", e)))?;
        remote_from_payload(&task)
    }

    async fn update(
        &self,
        credential: &ProviderCredential,
        external_id: &str,
        draft: &RemoteTaskDraft,
        cancel: &CancellationToken,
    ) -> Result<RemoteTask, ProviderError> {
        let (status, text) = self
            .request(
                credential,
                reqwest::Method::POST,
                &format!("/tasks/{}", external_id),
                Some(draft_to_payload(draft)),
                cancel,
            )
            .await?;
        if status != 200 {
            return Err(ProviderError::from_status(status, &text));
        }
        let task: Value = serde_json::from_str(&text)
            .map_err(|e| ProviderError::invalid(format!("non-JSON update response: {}", e)))?;
        remote_from_payload(&task)
    }

    async fn complete(
        &self,
        credential: &ProviderCredential,
        external_id: &str,
        cancel: &CancellationToken,
    ) -> Result<(), ProviderError> {
        let (status, text) = self
            .request(
                credential,
                reqwest::Method::POST,
                &format!("/tasks/{}/close", external_id),
                None,
                cancel,
            )
            .await?;
        if status != 204 && status != 200 {
            return Err(ProviderError::from_status(status, &text));
        }
        Ok(())
    }

    async fn delete(
        &self,
        credential: &ProviderCredential,
        external_id: &str,
        cancel: &CancellationToken,
    ) -> Result<(), ProviderError> {
        let (status, text) = self
            .request(
                credential,
                reqwest::Method::DELETE,
                &format!("/tasks/{}", external_id),
                None,
                cancel,
            )
            .await?;
        if status != 204 && status != 200 {
            return Err(ProviderError::from_status(status, &text));
        }
        Ok(())
    }
}

/// The same client feeds the ingestion pipeline as an item source.
#[async_trait]
impl ItemSource for TodoistClient {
    fn source(&self) -> Source {
        Source::TaskManager
    }

    async fn list(
        &self,
        credential: &ProviderCredential,
        _window: FetchWindow,
        cursor: Option<String>,
        cancel: &CancellationToken,
    ) -> Result<ProviderPage, ProviderError> {
        let page = self.list_changes(credential, None, cursor, cancel).await?;
        Ok(ProviderPage {
            items: page
                .changes
                .into_iter()
                .map(|change| ProviderItem {
                    external_id: Some(change.task.external_id.clone()),
                    external_updated_at: Some(change.task.external_updated_at),
                    payload: change.task.payload,
                })
                .collect(),
            next_cursor: page.next_cursor,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn priority_mapping_round_trips() {
        assert_eq!(priority_to_todoist(Priority::Low), 1);
        assert_eq!(priority_to_todoist(Priority::Normal), 2);
        assert_eq!(priority_to_todoist(Priority::High), 3);
        assert_eq!(priority_from_todoist(1), Priority::Low);
        assert_eq!(priority_from_todoist(2), Priority::Normal);
        assert_eq!(priority_from_todoist(3), Priority::High);
        assert_eq!(priority_from_todoist(4), Priority::High);
    }

    #[test]
    fn due_parsing_handles_datetime_and_date() {
        let with_time = json!({"due": {"datetime": "2025-11-09T10:00:00Z"}});
        assert_eq!(
            parse_due(&with_time),
            Some(Utc.with_ymd_and_hms(2025, 11, 9, 10, 0, 0).unwrap())
        );

        let date_only = json!({"due": {"date": "2025-11-09"}});
        assert_eq!(
            parse_due(&date_only),
            Some(Utc.with_ymd_and_hms(2025, 11, 9, 17, 0, 0).unwrap())
        );

        assert_eq!(parse_due(&json!({})), None);
    }

    #[test]
    fn remote_mapping_reads_provider_fields() {
        let payload = json!({
            "id": "7788",
            "content": "Renew passport",
            "description": "bring photos",
            "priority": 4,
            "is_completed": false,
            "updated_at": "2025-11-08T09:30:00Z",
            "due": {"datetime": "2025-11-10T10:00:00Z"},
        });
        let remote = remote_from_payload(&payload).unwrap();
        assert_eq!(remote.external_id, "7788");
        assert_eq!(remote.title, "Renew passport");
        assert_eq!(remote.priority, Priority::High);
        assert_eq!(
            remote.external_updated_at,
            Utc.with_ymd_and_hms(2025, 11, 8, 9, 30, 0).unwrap()
        );
    }

    #[test]
    fn numeric_id_accepted() {
        let payload = json!({"id": 42, "content": "Numbered", "priority": 1});
        let remote = remote_from_payload(&payload).unwrap();
        assert_eq!(remote.external_id, "42");
    }

    #[test]
    fn missing_id_rejected() {
        assert!(remote_from_payload(&json!({"content": "No id"})).is_err());
    }

    #[test]
    fn draft_payload_shape() {
        let draft = RemoteTaskDraft {
            title: "Ship it".to_string(),
            description: Some("the release".to_string()),
            due: Some(Utc.with_ymd_and_hms(2025, 11, 9, 10, 0, 0).unwrap()),
            priority: Priority::High,
            is_completed: false,
        };
        let body = draft_to_payload(&draft);
        assert_eq!(body["content"], "Ship it");
        assert_eq!(body["priority"], 3);
        assert_eq!(body["description"], "the release");
        assert!(body["due_datetime"].as_str().unwrap().starts_with("2025-11-09T10:00:00"));
    }
}
