use chrono::{DateTime, Utc};
use sqlx::Row;

use super::{parse_ts, parse_ts_opt, Store};
use crate::types::{CredentialState, ProviderCredential, Source};

impl Store {
    /// Insert or replace the single credential for (user, provider).
    pub async fn upsert_credential(&self, cred: &ProviderCredential) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            INSERT INTO credentials
                (user, source, access_token, refresh_token, expires_at, scopes, state, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (user, source) DO UPDATE SET
                access_token = excluded.access_token,
                refresh_token = excluded.refresh_token,
                expires_at = excluded.expires_at,
                scopes = excluded.scopes,
                state = excluded.state,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&cred.user)
        .bind(cred.source.as_str())
        .bind(&cred.access_token)
        .bind(&cred.refresh_token)
        .bind(cred.expires_at.map(|t| t.to_rfc3339()))
        .bind(serde_json::to_string(&cred.scopes)?)
        .bind(cred.state.as_str())
        .bind(cred.updated_at.to_rfc3339())
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn get_credential(
        &self,
        user: &str,
        source: Source,
    ) -> anyhow::Result<Option<ProviderCredential>> {
        let row = sqlx::query("SELECT * FROM credentials WHERE user = ? AND source = ?")
            .bind(user)
            .bind(source.as_str())
            .fetch_optional(self.pool())
            .await?;

        let Some(row) = row else { return Ok(None) };
        let state_str: String = row.get("state");
        let scopes_json: String = row.get("scopes");
        let updated_at: String = row.get("updated_at");
        Ok(Some(ProviderCredential {
            user: row.get("user"),
            source,
            access_token: row.get("access_token"),
            refresh_token: row.get("refresh_token"),
            expires_at: parse_ts_opt(row.get("expires_at"))?,
            scopes: serde_json::from_str(&scopes_json).unwrap_or_default(),
            state: CredentialState::parse(&state_str).unwrap_or(CredentialState::Active),
            updated_at: parse_ts(&updated_at)?,
        }))
    }

    /// Refresh failed: the credential is dead until the user reconnects.
    pub async fn mark_credential_revoked(
        &self,
        user: &str,
        source: Source,
        now: DateTime<Utc>,
    ) -> anyhow::Result<()> {
        sqlx::query(
            "UPDATE credentials SET state = 'revoked', updated_at = ?
             WHERE user = ? AND source = ?",
        )
        .bind(now.to_rfc3339())
        .bind(user)
        .bind(source.as_str())
        .execute(self.pool())
        .await?;
        Ok(())
    }
}
