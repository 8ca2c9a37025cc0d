use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;

use super::{parse_ts, parse_ts_opt, Store};
use crate::types::{Notification, NotificationStatus};

impl Store {
    /// Attempt to reserve the notification slot for (user, task, plan).
    /// Returns `None` when any row for the triple already exists — live or
    /// dismissed. Dismissal never re-arms an entry within the same plan;
    /// only plan regeneration (a new plan id) does.
    ///
    /// This is a conditional insert — never a read-then-write — backed by
    /// the partial unique index, so two concurrent ticks cannot both
    /// reserve: exactly one insert wins and the loser sees zero affected
    /// rows.
    pub async fn reserve_notification(
        &self,
        user: &str,
        task_id: &str,
        plan_id: Option<&str>,
        kind: &str,
        message: &str,
        scheduled_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> anyhow::Result<Option<Notification>> {
        let id = uuid::Uuid::new_v4().to_string();
        let result = sqlx::query(
            "INSERT OR IGNORE INTO notifications
             (id, user, task_id, plan_id, kind, message, scheduled_at, sent_at, status, created_at)
             SELECT ?, ?, ?, ?, ?, ?, ?, NULL, 'pending', ?
             WHERE NOT EXISTS (
                 SELECT 1 FROM notifications WHERE user = ? AND task_id = ? AND plan_id IS ?
             )",
        )
        .bind(&id)
        .bind(user)
        .bind(task_id)
        .bind(plan_id)
        .bind(kind)
        .bind(message)
        .bind(scheduled_at.to_rfc3339())
        .bind(now.to_rfc3339())
        .bind(user)
        .bind(task_id)
        .bind(plan_id)
        .execute(self.pool())
        .await?;

        if result.rows_affected() == 0 {
            return Ok(None);
        }

        Ok(Some(Notification {
            id,
            user: user.to_string(),
            task_id: task_id.to_string(),
            plan_id: plan_id.map(|s| s.to_string()),
            kind: kind.to_string(),
            message: message.to_string(),
            scheduled_at,
            sent_at: None,
            status: NotificationStatus::Pending,
            created_at: now,
        }))
    }

    pub async fn mark_notification_sent(
        &self,
        id: &str,
        now: DateTime<Utc>,
    ) -> anyhow::Result<()> {
        sqlx::query("UPDATE notifications SET status = 'sent', sent_at = ? WHERE id = ?")
            .bind(now.to_rfc3339())
            .bind(id)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    /// `pending|sent -> dismissed`. Returns false when the row does not
    /// belong to the user or is already dismissed.
    pub async fn dismiss_notification(&self, user: &str, id: &str) -> anyhow::Result<bool> {
        let result = sqlx::query(
            "UPDATE notifications SET status = 'dismissed'
             WHERE id = ? AND user = ? AND status != 'dismissed'",
        )
        .bind(id)
        .bind(user)
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn get_notification(
        &self,
        user: &str,
        id: &str,
    ) -> anyhow::Result<Option<Notification>> {
        let row = sqlx::query("SELECT * FROM notifications WHERE user = ? AND id = ?")
            .bind(user)
            .bind(id)
            .fetch_optional(self.pool())
            .await?;
        row.map(|r| notification_from_row(&r)).transpose()
    }

    pub async fn list_notifications(
        &self,
        user: &str,
        status: Option<NotificationStatus>,
        limit: i64,
    ) -> anyhow::Result<Vec<Notification>> {
        let rows = match status {
            Some(status) => {
                sqlx::query(
                    "SELECT * FROM notifications WHERE user = ? AND status = ?
                     ORDER BY created_at DESC LIMIT ?",
                )
                .bind(user)
                .bind(status.as_str())
                .bind(limit)
                .fetch_all(self.pool())
                .await?
            }
            None => {
                sqlx::query(
                    "SELECT * FROM notifications WHERE user = ?
                     ORDER BY created_at DESC LIMIT ?",
                )
                .bind(user)
                .bind(limit)
                .fetch_all(self.pool())
                .await?
            }
        };
        rows.iter().map(notification_from_row).collect()
    }

    /// Live (non-dismissed) notifications for one plan; used in tests to
    /// check the at-most-once invariant.
    pub async fn live_notifications_for_plan(
        &self,
        user: &str,
        plan_id: &str,
    ) -> anyhow::Result<Vec<Notification>> {
        let rows = sqlx::query(
            "SELECT * FROM notifications
             WHERE user = ? AND plan_id = ? AND status != 'dismissed'
             ORDER BY scheduled_at ASC, created_at ASC",
        )
        .bind(user)
        .bind(plan_id)
        .fetch_all(self.pool())
        .await?;
        rows.iter().map(notification_from_row).collect()
    }
}

fn notification_from_row(row: &SqliteRow) -> anyhow::Result<Notification> {
    let status_str: String = row.get("status");
    let scheduled_at: String = row.get("scheduled_at");
    let created_at: String = row.get("created_at");
    Ok(Notification {
        id: row.get("id"),
        user: row.get("user"),
        task_id: row.get("task_id"),
        plan_id: row.get("plan_id"),
        kind: row.get("kind"),
        message: row.get("message"),
        scheduled_at: parse_ts(&scheduled_at)?,
        sent_at: parse_ts_opt(row.get("sent_at"))?,
        status: NotificationStatus::parse(&status_str)
            .ok_or_else(|| anyhow::anyhow!("unknown notification status '{}'", status_str))?,
        created_at: parse_ts(&created_at)?,
    })
}
