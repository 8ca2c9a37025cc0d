use sqlx::Row;

use super::Store;
use crate::types::UserSettings;

impl Store {
    pub async fn get_user_settings(&self, user: &str) -> anyhow::Result<UserSettings> {
        let row = sqlx::query("SELECT * FROM user_settings WHERE user = ?")
            .bind(user)
            .fetch_optional(self.pool())
            .await?;

        Ok(match row {
            Some(row) => UserSettings {
                user: row.get("user"),
                timezone: row.get("timezone"),
                email: row.get("email"),
                email_enabled: row
                    .get::<Option<i64>, _>("email_enabled")
                    .map(|v| v != 0),
            },
            None => UserSettings::defaults_for(user),
        })
    }

    pub async fn upsert_user_settings(&self, settings: &UserSettings) -> anyhow::Result<()> {
        sqlx::query(
            "INSERT INTO user_settings (user, timezone, email, email_enabled)
             VALUES (?, ?, ?, ?)
             ON CONFLICT (user) DO UPDATE SET
               timezone = excluded.timezone,
               email = excluded.email,
               email_enabled = excluded.email_enabled",
        )
        .bind(&settings.user)
        .bind(&settings.timezone)
        .bind(&settings.email)
        .bind(settings.email_enabled.map(|v| v as i64))
        .execute(self.pool())
        .await?;
        Ok(())
    }
}
