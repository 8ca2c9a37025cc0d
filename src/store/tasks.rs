use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use sqlx::sqlite::SqliteRow;
use sqlx::Row;

use super::{parse_ts, parse_ts_opt, Store};
use crate::traits::RemoteTask;
use crate::types::{Priority, Source, SyncDirection, SyncStatus, Task};

/// A normalized item ready for persistence. The pipeline fills `external_id`
/// with the provider's id or a deterministic hash, so the upsert key is
/// always present.
#[derive(Debug, Clone)]
pub struct IngestedTask {
    pub title: String,
    pub description: Option<String>,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub attendees: Vec<String>,
    pub location: Option<String>,
    pub recurrence: Option<String>,
    pub priority: Priority,
    pub is_critical: bool,
    pub is_urgent: bool,
    pub is_spam: bool,
    pub spam_reason: Option<String>,
    pub spam_score: Option<f64>,
    pub raw_payload: JsonValue,
    pub external_id: String,
    pub external_updated_at: Option<DateTime<Utc>>,
    pub sync_direction: SyncDirection,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Created,
    Updated,
    Unchanged,
}

/// Partial update of the user-settable flags.
#[derive(Debug, Clone, Copy, Default)]
pub struct TaskFlags {
    pub is_critical: Option<bool>,
    pub is_urgent: Option<bool>,
    pub priority: Option<Priority>,
}

impl Store {
    /// Upsert by (user, source, external_id). On update, content fields are
    /// overwritten but the user-settable flags (`is_critical`, `is_urgent`,
    /// `is_completed`, `completed_at`) are preserved. Rows whose content is
    /// unchanged are left untouched so `updated_at` stays stable.
    pub async fn upsert_ingested(
        &self,
        user: &str,
        source: Source,
        item: &IngestedTask,
        now: DateTime<Utc>,
    ) -> anyhow::Result<(String, UpsertOutcome)> {
        if item.end < item.start {
            anyhow::bail!("task end precedes start: '{}'", item.title);
        }

        let existing = sqlx::query(
            "SELECT * FROM tasks WHERE user = ? AND source = ? AND external_id = ?",
        )
        .bind(user)
        .bind(source.as_str())
        .bind(&item.external_id)
        .fetch_optional(self.pool())
        .await?;

        let attendees_json = serde_json::to_string(&item.attendees)?;
        let payload_json = item.raw_payload.to_string();

        let Some(row) = existing else {
            let id = uuid::Uuid::new_v4().to_string();
            sqlx::query(
                r#"
                INSERT INTO tasks (
                    id, user, source, title, description, start_at, end_at,
                    attendees, location, recurrence, priority,
                    is_critical, is_urgent, is_spam, spam_reason, spam_score,
                    is_completed, completed_at, raw_payload, external_id,
                    sync_status, sync_direction, last_synced_at,
                    external_updated_at, created_at, updated_at
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 0, NULL, ?, ?, 'synced', ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&id)
            .bind(user)
            .bind(source.as_str())
            .bind(&item.title)
            .bind(&item.description)
            .bind(item.start.to_rfc3339())
            .bind(item.end.to_rfc3339())
            .bind(&attendees_json)
            .bind(&item.location)
            .bind(&item.recurrence)
            .bind(item.priority.as_str())
            .bind(item.is_critical as i32)
            .bind(item.is_urgent as i32)
            .bind(item.is_spam as i32)
            .bind(&item.spam_reason)
            .bind(item.spam_score)
            .bind(&payload_json)
            .bind(&item.external_id)
            .bind(item.sync_direction.as_str())
            .bind(now.to_rfc3339())
            .bind(item.external_updated_at.map(|t| t.to_rfc3339()))
            .bind(now.to_rfc3339())
            .bind(now.to_rfc3339())
            .execute(self.pool())
            .await?;
            return Ok((id, UpsertOutcome::Created));
        };

        let task = task_from_row(&row)?;
        let content_unchanged = task.title == item.title
            && task.description == item.description
            && task.start == item.start
            && task.end == item.end
            && task.attendees == item.attendees
            && task.location == item.location
            && task.recurrence == item.recurrence
            && task.priority == item.priority
            && task.is_spam == item.is_spam
            && task.spam_reason == item.spam_reason
            && task.spam_score == item.spam_score;

        if content_unchanged {
            return Ok((task.id, UpsertOutcome::Unchanged));
        }

        sqlx::query(
            r#"
            UPDATE tasks SET
                title = ?, description = ?, start_at = ?, end_at = ?,
                attendees = ?, location = ?, recurrence = ?, priority = ?,
                is_spam = ?, spam_reason = ?, spam_score = ?, raw_payload = ?,
                external_updated_at = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(&item.title)
        .bind(&item.description)
        .bind(item.start.to_rfc3339())
        .bind(item.end.to_rfc3339())
        .bind(&attendees_json)
        .bind(&item.location)
        .bind(&item.recurrence)
        .bind(item.priority.as_str())
        .bind(item.is_spam as i32)
        .bind(&item.spam_reason)
        .bind(item.spam_score)
        .bind(&payload_json)
        .bind(
            item.external_updated_at
                .map(|t| t.to_rfc3339())
                .or_else(|| task.external_updated_at.map(|t| t.to_rfc3339())),
        )
        .bind(now.to_rfc3339())
        .bind(&task.id)
        .execute(self.pool())
        .await?;

        Ok((task.id, UpsertOutcome::Updated))
    }

    pub async fn create_task(&self, task: &Task) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            INSERT INTO tasks (
                id, user, source, title, description, start_at, end_at,
                attendees, location, recurrence, priority,
                is_critical, is_urgent, is_spam, spam_reason, spam_score,
                is_completed, completed_at, raw_payload, external_id,
                sync_status, sync_direction, last_synced_at,
                external_updated_at, sync_error, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&task.id)
        .bind(&task.user)
        .bind(task.source.as_str())
        .bind(&task.title)
        .bind(&task.description)
        .bind(task.start.to_rfc3339())
        .bind(task.end.to_rfc3339())
        .bind(serde_json::to_string(&task.attendees)?)
        .bind(&task.location)
        .bind(&task.recurrence)
        .bind(task.priority.as_str())
        .bind(task.is_critical as i32)
        .bind(task.is_urgent as i32)
        .bind(task.is_spam as i32)
        .bind(&task.spam_reason)
        .bind(task.spam_score)
        .bind(task.is_completed as i32)
        .bind(task.completed_at.map(|t| t.to_rfc3339()))
        .bind(task.raw_payload.to_string())
        .bind(&task.external_id)
        .bind(task.sync_status.as_str())
        .bind(task.sync_direction.as_str())
        .bind(task.last_synced_at.map(|t| t.to_rfc3339()))
        .bind(task.external_updated_at.map(|t| t.to_rfc3339()))
        .bind(&task.sync_error)
        .bind(task.created_at.to_rfc3339())
        .bind(task.updated_at.to_rfc3339())
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn get_task(&self, user: &str, id: &str) -> anyhow::Result<Option<Task>> {
        let row = sqlx::query("SELECT * FROM tasks WHERE user = ? AND id = ?")
            .bind(user)
            .bind(id)
            .fetch_optional(self.pool())
            .await?;
        row.map(|r| task_from_row(&r)).transpose()
    }

    /// Tasks whose start falls in [start, end), ordered by start then id.
    pub async fn list_tasks_between(
        &self,
        user: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> anyhow::Result<Vec<Task>> {
        let rows = sqlx::query(
            "SELECT * FROM tasks WHERE user = ? AND start_at >= ? AND start_at < ?
             ORDER BY start_at ASC, id ASC",
        )
        .bind(user)
        .bind(start.to_rfc3339())
        .bind(end.to_rfc3339())
        .fetch_all(self.pool())
        .await?;
        rows.iter().map(task_from_row).collect()
    }

    pub async fn list_all_tasks(&self, user: &str) -> anyhow::Result<Vec<Task>> {
        let rows = sqlx::query("SELECT * FROM tasks WHERE user = ? ORDER BY start_at ASC, id ASC")
            .bind(user)
            .fetch_all(self.pool())
            .await?;
        rows.iter().map(task_from_row).collect()
    }

    /// Distinct users owning at least one task; drives scheduler fan-out.
    pub async fn list_task_users(&self) -> anyhow::Result<Vec<String>> {
        let rows = sqlx::query("SELECT DISTINCT user FROM tasks")
            .fetch_all(self.pool())
            .await?;
        Ok(rows.iter().map(|r| r.get::<String, _>("user")).collect())
    }

    /// Apply user flag edits. A local edit to a task-manager task marks it
    /// pending for the next outbound sync.
    pub async fn update_task_flags(
        &self,
        user: &str,
        id: &str,
        flags: TaskFlags,
        now: DateTime<Utc>,
    ) -> anyhow::Result<Option<Task>> {
        let Some(mut task) = self.get_task(user, id).await? else {
            return Ok(None);
        };

        if let Some(critical) = flags.is_critical {
            task.is_critical = critical;
        }
        if let Some(urgent) = flags.is_urgent {
            task.is_urgent = urgent;
        }
        if let Some(priority) = flags.priority {
            task.priority = priority;
        }
        task.updated_at = now;
        if task.source == Source::TaskManager
            && task.sync_direction.pushes_outbound()
            && task.sync_status == SyncStatus::Synced
        {
            task.sync_status = SyncStatus::Pending;
        }

        sqlx::query(
            "UPDATE tasks SET is_critical = ?, is_urgent = ?, priority = ?,
             sync_status = ?, updated_at = ? WHERE user = ? AND id = ?",
        )
        .bind(task.is_critical as i32)
        .bind(task.is_urgent as i32)
        .bind(task.priority.as_str())
        .bind(task.sync_status.as_str())
        .bind(now.to_rfc3339())
        .bind(user)
        .bind(id)
        .execute(self.pool())
        .await?;

        Ok(Some(task))
    }

    /// Set or clear completion. Clearing always clears `completed_at`.
    pub async fn set_task_completed(
        &self,
        user: &str,
        id: &str,
        completed: bool,
        now: DateTime<Utc>,
    ) -> anyhow::Result<Option<Task>> {
        let Some(mut task) = self.get_task(user, id).await? else {
            return Ok(None);
        };

        task.set_completed(completed, now);
        task.updated_at = now;
        if task.source == Source::TaskManager
            && task.sync_direction.pushes_outbound()
            && task.sync_status == SyncStatus::Synced
        {
            task.sync_status = SyncStatus::Pending;
        }

        sqlx::query(
            "UPDATE tasks SET is_completed = ?, completed_at = ?, sync_status = ?, updated_at = ?
             WHERE user = ? AND id = ?",
        )
        .bind(task.is_completed as i32)
        .bind(task.completed_at.map(|t| t.to_rfc3339()))
        .bind(task.sync_status.as_str())
        .bind(now.to_rfc3339())
        .bind(user)
        .bind(id)
        .execute(self.pool())
        .await?;

        Ok(Some(task))
    }

    pub async fn delete_task(&self, user: &str, id: &str) -> anyhow::Result<bool> {
        let result = sqlx::query("DELETE FROM tasks WHERE user = ? AND id = ?")
            .bind(user)
            .bind(id)
            .execute(self.pool())
            .await?;
        Ok(result.rows_affected() > 0)
    }

    // ------------------------------------------------------------------
    // Sync engine support
    // ------------------------------------------------------------------

    pub async fn find_by_external_id(
        &self,
        user: &str,
        source: Source,
        external_id: &str,
    ) -> anyhow::Result<Option<Task>> {
        let row = sqlx::query(
            "SELECT * FROM tasks WHERE user = ? AND source = ? AND external_id = ?",
        )
        .bind(user)
        .bind(source.as_str())
        .bind(external_id)
        .fetch_optional(self.pool())
        .await?;
        row.map(|r| task_from_row(&r)).transpose()
    }

    /// Overwrite local content with the remote version and mark synced.
    /// `updated_at` and `last_synced_at` are set to the same instant so the
    /// row does not read as locally modified afterwards.
    pub async fn overwrite_from_remote(
        &self,
        user: &str,
        task_id: &str,
        remote: &RemoteTask,
        now: DateTime<Utc>,
    ) -> anyhow::Result<()> {
        let (start, end) = remote_window(remote);
        sqlx::query(
            r#"
            UPDATE tasks SET
                title = ?, description = ?, start_at = ?, end_at = ?,
                priority = ?, is_completed = ?, completed_at = ?,
                raw_payload = ?, external_updated_at = ?,
                sync_status = 'synced', sync_error = NULL, sync_attempts = 0,
                remote_snapshot = NULL, last_synced_at = ?, updated_at = ?
            WHERE user = ? AND id = ?
            "#,
        )
        .bind(&remote.title)
        .bind(&remote.description)
        .bind(start.to_rfc3339())
        .bind(end.to_rfc3339())
        .bind(remote.priority.as_str())
        .bind(remote.is_completed as i32)
        .bind(remote.is_completed.then(|| now.to_rfc3339()))
        .bind(remote.payload.to_string())
        .bind(remote.external_updated_at.to_rfc3339())
        .bind(now.to_rfc3339())
        .bind(now.to_rfc3339())
        .bind(user)
        .bind(task_id)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// Record a conflict: both sides changed since the last sync. Neither
    /// side's content is touched; the remote version is kept as a snapshot
    /// for a later `resolve(external)`.
    pub async fn mark_conflict(
        &self,
        user: &str,
        task_id: &str,
        remote: &RemoteTask,
    ) -> anyhow::Result<()> {
        let snapshot = serde_json::json!({
            "external_id": remote.external_id,
            "title": remote.title,
            "description": remote.description,
            "due": remote.due.map(|t| t.to_rfc3339()),
            "priority": remote.priority.as_str(),
            "is_completed": remote.is_completed,
            "external_updated_at": remote.external_updated_at.to_rfc3339(),
            "payload": remote.payload,
        });
        sqlx::query(
            "UPDATE tasks SET sync_status = 'conflict',
             sync_error = 'both local and external versions changed since last sync',
             external_updated_at = ?, remote_snapshot = ?
             WHERE user = ? AND id = ?",
        )
        .bind(remote.external_updated_at.to_rfc3339())
        .bind(snapshot.to_string())
        .bind(user)
        .bind(task_id)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn get_remote_snapshot(
        &self,
        user: &str,
        task_id: &str,
    ) -> anyhow::Result<Option<RemoteTask>> {
        let row = sqlx::query(
            "SELECT remote_snapshot FROM tasks WHERE user = ? AND id = ?",
        )
        .bind(user)
        .bind(task_id)
        .fetch_optional(self.pool())
        .await?;

        let Some(row) = row else { return Ok(None) };
        let Some(json) = row.get::<Option<String>, _>("remote_snapshot") else {
            return Ok(None);
        };
        let v: JsonValue = serde_json::from_str(&json)?;
        let external_updated_at = parse_ts(
            v["external_updated_at"]
                .as_str()
                .ok_or_else(|| anyhow::anyhow!("snapshot missing external_updated_at"))?,
        )?;
        Ok(Some(RemoteTask {
            external_id: v["external_id"].as_str().unwrap_or_default().to_string(),
            title: v["title"].as_str().unwrap_or_default().to_string(),
            description: v["description"].as_str().map(|s| s.to_string()),
            due: v["due"].as_str().map(parse_ts).transpose()?,
            priority: v["priority"]
                .as_str()
                .and_then(Priority::parse)
                .unwrap_or(Priority::Normal),
            is_completed: v["is_completed"].as_bool().unwrap_or(false),
            external_updated_at,
            payload: v["payload"].clone(),
        }))
    }

    pub async fn mark_synced(
        &self,
        user: &str,
        task_id: &str,
        now: DateTime<Utc>,
    ) -> anyhow::Result<()> {
        sqlx::query(
            "UPDATE tasks SET sync_status = 'synced', sync_error = NULL,
             sync_attempts = 0, remote_snapshot = NULL, last_synced_at = ?
             WHERE user = ? AND id = ?",
        )
        .bind(now.to_rfc3339())
        .bind(user)
        .bind(task_id)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn mark_sync_error(
        &self,
        user: &str,
        task_id: &str,
        error: &str,
        now: DateTime<Utc>,
    ) -> anyhow::Result<()> {
        sqlx::query(
            "UPDATE tasks SET sync_status = 'error', sync_error = ?,
             sync_attempts = sync_attempts + 1, last_sync_attempt_at = ?
             WHERE user = ? AND id = ?",
        )
        .bind(crate::utils::truncate_str(error, 300))
        .bind(now.to_rfc3339())
        .bind(user)
        .bind(task_id)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn set_external_id(
        &self,
        user: &str,
        task_id: &str,
        external_id: &str,
    ) -> anyhow::Result<()> {
        sqlx::query("UPDATE tasks SET external_id = ? WHERE user = ? AND id = ?")
            .bind(external_id)
            .bind(user)
            .bind(task_id)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    /// Task-manager tasks with local changes awaiting an outbound push.
    pub async fn list_outbound_pending(&self, user: &str) -> anyhow::Result<Vec<Task>> {
        let rows = sqlx::query(
            "SELECT * FROM tasks WHERE user = ? AND source = 'task_manager'
             AND sync_status = 'pending'
             AND sync_direction IN ('outbound', 'bidirectional')
             ORDER BY updated_at ASC",
        )
        .bind(user)
        .fetch_all(self.pool())
        .await?;
        rows.iter().map(task_from_row).collect()
    }

    /// Errored tasks plus their attempt metadata, for retry-floor gating.
    pub async fn list_sync_errored(
        &self,
        user: &str,
    ) -> anyhow::Result<Vec<(Task, i64, Option<DateTime<Utc>>)>> {
        let rows = sqlx::query(
            "SELECT * FROM tasks WHERE user = ? AND source = 'task_manager'
             AND sync_status = 'error' ORDER BY updated_at ASC",
        )
        .bind(user)
        .fetch_all(self.pool())
        .await?;
        rows.iter()
            .map(|row| {
                let task = task_from_row(row)?;
                let attempts: i64 = row.get("sync_attempts");
                let last_attempt = parse_ts_opt(row.get("last_sync_attempt_at"))?;
                Ok((task, attempts, last_attempt))
            })
            .collect()
    }

    pub async fn max_last_synced_at(
        &self,
        user: &str,
        source: Source,
    ) -> anyhow::Result<Option<DateTime<Utc>>> {
        let row = sqlx::query(
            "SELECT MAX(last_synced_at) AS max_ts FROM tasks WHERE user = ? AND source = ?",
        )
        .bind(user)
        .bind(source.as_str())
        .fetch_one(self.pool())
        .await?;
        parse_ts_opt(row.get("max_ts"))
    }

    pub async fn sync_status_counts(
        &self,
        user: &str,
    ) -> anyhow::Result<std::collections::HashMap<String, i64>> {
        let rows = sqlx::query(
            "SELECT sync_status, COUNT(*) AS n FROM tasks
             WHERE user = ? AND source = 'task_manager' GROUP BY sync_status",
        )
        .bind(user)
        .fetch_all(self.pool())
        .await?;
        Ok(rows
            .iter()
            .map(|r| (r.get::<String, _>("sync_status"), r.get::<i64, _>("n")))
            .collect())
    }
}

fn remote_window(remote: &RemoteTask) -> (DateTime<Utc>, DateTime<Utc>) {
    // Task-manager items carry a due point, not a range; give them a
    // half-hour slot ending at the due time.
    match remote.due {
        Some(due) => (due - chrono::Duration::minutes(30), due),
        None => (remote.external_updated_at, remote.external_updated_at),
    }
}

pub(crate) fn task_from_row(row: &SqliteRow) -> anyhow::Result<Task> {
    let source_str: String = row.get("source");
    let priority_str: String = row.get("priority");
    let sync_status_str: String = row.get("sync_status");
    let sync_direction_str: String = row.get("sync_direction");
    let attendees_json: String = row.get("attendees");
    let payload_json: String = row.get("raw_payload");
    let start_at: String = row.get("start_at");
    let end_at: String = row.get("end_at");
    let created_at: String = row.get("created_at");
    let updated_at: String = row.get("updated_at");

    Ok(Task {
        id: row.get("id"),
        user: row.get("user"),
        source: Source::parse(&source_str)
            .ok_or_else(|| anyhow::anyhow!("unknown source '{}'", source_str))?,
        title: row.get("title"),
        description: row.get("description"),
        start: parse_ts(&start_at)?,
        end: parse_ts(&end_at)?,
        attendees: serde_json::from_str(&attendees_json).unwrap_or_default(),
        location: row.get("location"),
        recurrence: row.get("recurrence"),
        priority: Priority::parse(&priority_str).unwrap_or(Priority::Normal),
        is_critical: row.get::<i32, _>("is_critical") != 0,
        is_urgent: row.get::<i32, _>("is_urgent") != 0,
        is_spam: row.get::<i32, _>("is_spam") != 0,
        spam_reason: row.get("spam_reason"),
        spam_score: row.get("spam_score"),
        is_completed: row.get::<i32, _>("is_completed") != 0,
        completed_at: parse_ts_opt(row.get("completed_at"))?,
        raw_payload: serde_json::from_str(&payload_json).unwrap_or(JsonValue::Null),
        external_id: row.get("external_id"),
        sync_status: SyncStatus::parse(&sync_status_str).unwrap_or(SyncStatus::Synced),
        sync_direction: SyncDirection::parse(&sync_direction_str)
            .unwrap_or(SyncDirection::Inbound),
        last_synced_at: parse_ts_opt(row.get("last_synced_at"))?,
        external_updated_at: parse_ts_opt(row.get("external_updated_at"))?,
        sync_error: row.get("sync_error"),
        created_at: parse_ts(&created_at)?,
        updated_at: parse_ts(&updated_at)?,
    })
}
