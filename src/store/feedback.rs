use chrono::{DateTime, Utc};
use sqlx::Row;

use super::{parse_ts, Store};
use crate::types::{FeedbackAction, TaskFeedback};

impl Store {
    /// Append-only: feedback is never updated or deleted.
    pub async fn append_feedback(&self, feedback: &TaskFeedback) -> anyhow::Result<()> {
        sqlx::query(
            "INSERT INTO task_feedback
             (id, user, task_id, plan_id, action, snooze_duration_minutes, at)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&feedback.id)
        .bind(&feedback.user)
        .bind(&feedback.task_id)
        .bind(&feedback.plan_id)
        .bind(feedback.action.as_str())
        .bind(feedback.snooze_duration_minutes)
        .bind(feedback.at.to_rfc3339())
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn list_feedback_since(
        &self,
        user: &str,
        since: DateTime<Utc>,
    ) -> anyhow::Result<Vec<TaskFeedback>> {
        let rows = sqlx::query(
            "SELECT * FROM task_feedback WHERE user = ? AND at >= ? ORDER BY at ASC",
        )
        .bind(user)
        .bind(since.to_rfc3339())
        .fetch_all(self.pool())
        .await?;

        rows.iter()
            .map(|row| {
                let action_str: String = row.get("action");
                let at: String = row.get("at");
                Ok(TaskFeedback {
                    id: row.get("id"),
                    user: row.get("user"),
                    task_id: row.get("task_id"),
                    plan_id: row.get("plan_id"),
                    action: FeedbackAction::parse(&action_str).ok_or_else(|| {
                        anyhow::anyhow!("unknown feedback action '{}'", action_str)
                    })?,
                    snooze_duration_minutes: row.get("snooze_duration_minutes"),
                    at: parse_ts(&at)?,
                })
            })
            .collect()
    }

    /// Snooze count per task over the window; feeds the priority damping.
    pub async fn snooze_counts_by_task(
        &self,
        user: &str,
        since: DateTime<Utc>,
    ) -> anyhow::Result<std::collections::HashMap<String, i64>> {
        let rows = sqlx::query(
            "SELECT task_id, COUNT(*) AS n FROM task_feedback
             WHERE user = ? AND action = 'snoozed' AND at >= ?
             GROUP BY task_id",
        )
        .bind(user)
        .bind(since.to_rfc3339())
        .fetch_all(self.pool())
        .await?;
        Ok(rows
            .iter()
            .map(|r| (r.get::<String, _>("task_id"), r.get::<i64, _>("n")))
            .collect())
    }
}
