use chrono::{DateTime, NaiveDate, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;

use super::{parse_ts, Store};
use crate::types::{DailyPlan, EntryStatus, PlanEntry, PlanStatus};

impl Store {
    /// Atomically replace the plan for (user, date). Past plans for other
    /// dates are untouched.
    pub async fn replace_plan(&self, plan: &DailyPlan) -> anyhow::Result<()> {
        let entries_json = serde_json::to_string(&plan.entries)?;
        sqlx::query(
            r#"
            INSERT INTO daily_plans (id, user, date, status, energy_level, entries, generated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (user, date) DO UPDATE SET
                id = excluded.id,
                status = excluded.status,
                energy_level = excluded.energy_level,
                entries = excluded.entries,
                generated_at = excluded.generated_at
            "#,
        )
        .bind(&plan.id)
        .bind(&plan.user)
        .bind(plan.date.to_string())
        .bind(plan.status.as_str())
        .bind(plan.energy_level.map(|l| l as i64))
        .bind(&entries_json)
        .bind(plan.generated_at.to_rfc3339())
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn get_plan(
        &self,
        user: &str,
        date: NaiveDate,
    ) -> anyhow::Result<Option<DailyPlan>> {
        let row = sqlx::query("SELECT * FROM daily_plans WHERE user = ? AND date = ?")
            .bind(user)
            .bind(date.to_string())
            .fetch_optional(self.pool())
            .await?;
        row.map(|r| plan_from_row(&r)).transpose()
    }

    pub async fn get_plan_by_id(
        &self,
        user: &str,
        plan_id: &str,
    ) -> anyhow::Result<Option<DailyPlan>> {
        let row = sqlx::query("SELECT * FROM daily_plans WHERE user = ? AND id = ?")
            .bind(user)
            .bind(plan_id)
            .fetch_optional(self.pool())
            .await?;
        row.map(|r| plan_from_row(&r)).transpose()
    }

    /// All active plans across users; the nudger filters these down to each
    /// user's "today" in their configured zone.
    pub async fn list_active_plans(&self) -> anyhow::Result<Vec<DailyPlan>> {
        let rows = sqlx::query("SELECT * FROM daily_plans WHERE status = 'active' ORDER BY user")
            .fetch_all(self.pool())
            .await?;
        rows.iter().map(plan_from_row).collect()
    }

    pub async fn update_plan_status(
        &self,
        user: &str,
        plan_id: &str,
        status: PlanStatus,
    ) -> anyhow::Result<bool> {
        let result = sqlx::query("UPDATE daily_plans SET status = ? WHERE user = ? AND id = ?")
            .bind(status.as_str())
            .bind(user)
            .bind(plan_id)
            .execute(self.pool())
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Set the denormalized status of one entry inside a plan's JSON.
    pub async fn update_entry_status(
        &self,
        user: &str,
        plan_id: &str,
        task_id: &str,
        status: EntryStatus,
    ) -> anyhow::Result<bool> {
        self.mutate_entries(user, plan_id, |entries| {
            let mut changed = false;
            for entry in entries.iter_mut() {
                if entry.task_id == task_id {
                    entry.status = status;
                    changed = true;
                }
            }
            changed
        })
        .await
    }

    /// Shift one entry's predicted window by `minutes`, capping the start to
    /// end-of-day. Duration is preserved.
    pub async fn shift_entry_start(
        &self,
        user: &str,
        plan_id: &str,
        task_id: &str,
        minutes: i64,
    ) -> anyhow::Result<bool> {
        self.mutate_entries(user, plan_id, |entries| {
            let mut changed = false;
            for entry in entries.iter_mut() {
                if entry.task_id == task_id {
                    let duration = entry.predicted_end - entry.predicted_start;
                    let shifted = entry.predicted_start + chrono::Duration::minutes(minutes);
                    let end_of_day = end_of_day_utc(entry.predicted_start);
                    entry.predicted_start = shifted.min(end_of_day);
                    entry.predicted_end = entry.predicted_start + duration;
                    entry.status = EntryStatus::Snoozed;
                    changed = true;
                }
            }
            changed
        })
        .await
    }

    /// Read-modify-write of a plan's entries inside one transaction.
    async fn mutate_entries<F>(
        &self,
        user: &str,
        plan_id: &str,
        mutate: F,
    ) -> anyhow::Result<bool>
    where
        F: FnOnce(&mut Vec<PlanEntry>) -> bool,
    {
        let mut tx = self.pool().begin().await?;
        let row = sqlx::query("SELECT entries FROM daily_plans WHERE user = ? AND id = ?")
            .bind(user)
            .bind(plan_id)
            .fetch_optional(&mut *tx)
            .await?;

        let Some(row) = row else {
            return Ok(false);
        };

        let entries_json: String = row.get("entries");
        let mut entries: Vec<PlanEntry> = serde_json::from_str(&entries_json)?;
        if !mutate(&mut entries) {
            return Ok(false);
        }

        sqlx::query("UPDATE daily_plans SET entries = ? WHERE user = ? AND id = ?")
            .bind(serde_json::to_string(&entries)?)
            .bind(user)
            .bind(plan_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(true)
    }
}

fn end_of_day_utc(at: DateTime<Utc>) -> DateTime<Utc> {
    let date = at.date_naive();
    date.and_hms_opt(23, 59, 59)
        .map(|naive| DateTime::from_naive_utc_and_offset(naive, Utc))
        .unwrap_or(at)
}

fn plan_from_row(row: &SqliteRow) -> anyhow::Result<DailyPlan> {
    let date_str: String = row.get("date");
    let status_str: String = row.get("status");
    let entries_json: String = row.get("entries");
    let generated_at: String = row.get("generated_at");
    Ok(DailyPlan {
        id: row.get("id"),
        user: row.get("user"),
        date: date_str
            .parse()
            .map_err(|e| anyhow::anyhow!("bad plan date '{}': {}", date_str, e))?,
        status: PlanStatus::parse(&status_str)
            .ok_or_else(|| anyhow::anyhow!("unknown plan status '{}'", status_str))?,
        energy_level: row.get::<Option<i64>, _>("energy_level").map(|l| l as u8),
        entries: serde_json::from_str(&entries_json)?,
        generated_at: parse_ts(&generated_at)?,
    })
}
