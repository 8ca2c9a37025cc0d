use chrono::{DateTime, NaiveDate, Utc};
use sqlx::Row;

use super::Store;

impl Store {
    /// Last write wins for (user, date).
    pub async fn set_energy(
        &self,
        user: &str,
        date: NaiveDate,
        level: u8,
        now: DateTime<Utc>,
    ) -> anyhow::Result<()> {
        if !(1..=5).contains(&level) {
            anyhow::bail!("energy level must be 1-5, got {}", level);
        }
        sqlx::query(
            "INSERT INTO energy_levels (user, date, level, updated_at) VALUES (?, ?, ?, ?)
             ON CONFLICT (user, date) DO UPDATE SET
               level = excluded.level, updated_at = excluded.updated_at",
        )
        .bind(user)
        .bind(date.to_string())
        .bind(level as i64)
        .bind(now.to_rfc3339())
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn get_energy(&self, user: &str, date: NaiveDate) -> anyhow::Result<Option<u8>> {
        let row = sqlx::query("SELECT level FROM energy_levels WHERE user = ? AND date = ?")
            .bind(user)
            .bind(date.to_string())
            .fetch_optional(self.pool())
            .await?;
        Ok(row.map(|r| r.get::<i64, _>("level") as u8))
    }
}
