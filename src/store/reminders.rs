use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;

use super::{parse_ts, Store};
use crate::types::{Reminder, Source};

impl Store {
    /// Upsert by (user, source, external_id); same idempotence rules as the
    /// task upsert but reminders carry no user-settable flags to preserve.
    pub async fn upsert_reminder(&self, reminder: &Reminder) -> anyhow::Result<bool> {
        if let Some(external_id) = &reminder.external_id {
            let existing = sqlx::query(
                "SELECT id FROM reminders WHERE user = ? AND source = ? AND external_id = ?",
            )
            .bind(&reminder.user)
            .bind(reminder.source.as_str())
            .bind(external_id)
            .fetch_optional(self.pool())
            .await?;

            if let Some(row) = existing {
                let id: String = row.get("id");
                sqlx::query(
                    "UPDATE reminders SET title = ?, description = ?, start_at = ?, end_at = ?,
                     is_all_day = ?, raw_payload = ? WHERE id = ?",
                )
                .bind(&reminder.title)
                .bind(&reminder.description)
                .bind(reminder.start.to_rfc3339())
                .bind(reminder.end.to_rfc3339())
                .bind(reminder.is_all_day as i32)
                .bind(reminder.raw_payload.to_string())
                .bind(&id)
                .execute(self.pool())
                .await?;
                return Ok(false);
            }
        }

        sqlx::query(
            "INSERT INTO reminders
             (id, user, source, title, description, start_at, end_at, is_all_day, external_id, raw_payload, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&reminder.id)
        .bind(&reminder.user)
        .bind(reminder.source.as_str())
        .bind(&reminder.title)
        .bind(&reminder.description)
        .bind(reminder.start.to_rfc3339())
        .bind(reminder.end.to_rfc3339())
        .bind(reminder.is_all_day as i32)
        .bind(&reminder.external_id)
        .bind(reminder.raw_payload.to_string())
        .bind(reminder.created_at.to_rfc3339())
        .execute(self.pool())
        .await?;
        Ok(true)
    }

    pub async fn get_reminder(&self, user: &str, id: &str) -> anyhow::Result<Option<Reminder>> {
        let row = sqlx::query("SELECT * FROM reminders WHERE user = ? AND id = ?")
            .bind(user)
            .bind(id)
            .fetch_optional(self.pool())
            .await?;
        row.map(|r| reminder_from_row(&r)).transpose()
    }

    pub async fn list_reminders_between(
        &self,
        user: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> anyhow::Result<Vec<Reminder>> {
        let rows = sqlx::query(
            "SELECT * FROM reminders WHERE user = ? AND start_at >= ? AND start_at < ?
             ORDER BY start_at ASC",
        )
        .bind(user)
        .bind(start.to_rfc3339())
        .bind(end.to_rfc3339())
        .fetch_all(self.pool())
        .await?;
        rows.iter().map(reminder_from_row).collect()
    }

    pub async fn delete_reminder(&self, user: &str, id: &str) -> anyhow::Result<bool> {
        let result = sqlx::query("DELETE FROM reminders WHERE user = ? AND id = ?")
            .bind(user)
            .bind(id)
            .execute(self.pool())
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

fn reminder_from_row(row: &SqliteRow) -> anyhow::Result<Reminder> {
    let source_str: String = row.get("source");
    let start_at: String = row.get("start_at");
    let end_at: String = row.get("end_at");
    let created_at: String = row.get("created_at");
    let payload_json: String = row.get("raw_payload");
    Ok(Reminder {
        id: row.get("id"),
        user: row.get("user"),
        source: Source::parse(&source_str)
            .ok_or_else(|| anyhow::anyhow!("unknown source '{}'", source_str))?,
        title: row.get("title"),
        description: row.get("description"),
        start: parse_ts(&start_at)?,
        end: parse_ts(&end_at)?,
        is_all_day: row.get::<i32, _>("is_all_day") != 0,
        external_id: row.get("external_id"),
        raw_payload: serde_json::from_str(&payload_json).unwrap_or(serde_json::Value::Null),
        created_at: parse_ts(&created_at)?,
    })
}
