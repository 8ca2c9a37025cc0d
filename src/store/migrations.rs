use sqlx::SqlitePool;
use tracing::debug;

/// Idempotent schema setup. Every statement is CREATE IF NOT EXISTS so the
/// daemon can run migrations unconditionally at startup.
pub async fn run(pool: &SqlitePool) -> anyhow::Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS tasks (
            id TEXT PRIMARY KEY,
            user TEXT NOT NULL,
            source TEXT NOT NULL,
            title TEXT NOT NULL,
            description TEXT,
            start_at TEXT NOT NULL,
            end_at TEXT NOT NULL,
            attendees TEXT NOT NULL DEFAULT '[]',
            location TEXT,
            recurrence TEXT,
            priority TEXT NOT NULL DEFAULT 'normal',
            is_critical INTEGER NOT NULL DEFAULT 0,
            is_urgent INTEGER NOT NULL DEFAULT 0,
            is_spam INTEGER NOT NULL DEFAULT 0,
            spam_reason TEXT,
            spam_score REAL,
            is_completed INTEGER NOT NULL DEFAULT 0,
            completed_at TEXT,
            raw_payload TEXT NOT NULL DEFAULT '{}',
            external_id TEXT,
            sync_status TEXT NOT NULL DEFAULT 'synced',
            sync_direction TEXT NOT NULL DEFAULT 'inbound',
            last_synced_at TEXT,
            external_updated_at TEXT,
            sync_error TEXT,
            sync_attempts INTEGER NOT NULL DEFAULT 0,
            last_sync_attempt_at TEXT,
            remote_snapshot TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Idempotent re-ingest: one row per provider item per user.
    sqlx::query(
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_tasks_external
         ON tasks(user, source, external_id) WHERE external_id IS NOT NULL",
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_tasks_user_start ON tasks(user, start_at)")
        .execute(pool)
        .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_tasks_sync ON tasks(user, source, sync_status)",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS reminders (
            id TEXT PRIMARY KEY,
            user TEXT NOT NULL,
            source TEXT NOT NULL,
            title TEXT NOT NULL,
            description TEXT,
            start_at TEXT NOT NULL,
            end_at TEXT NOT NULL,
            is_all_day INTEGER NOT NULL DEFAULT 0,
            external_id TEXT,
            raw_payload TEXT NOT NULL DEFAULT '{}',
            created_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_reminders_external
         ON reminders(user, source, external_id) WHERE external_id IS NOT NULL",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS energy_levels (
            user TEXT NOT NULL,
            date TEXT NOT NULL,
            level INTEGER NOT NULL,
            updated_at TEXT NOT NULL,
            PRIMARY KEY (user, date)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS daily_plans (
            id TEXT PRIMARY KEY,
            user TEXT NOT NULL,
            date TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'active',
            energy_level INTEGER,
            entries TEXT NOT NULL DEFAULT '[]',
            generated_at TEXT NOT NULL,
            UNIQUE (user, date)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_plans_status ON daily_plans(status, date)")
        .execute(pool)
        .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS task_feedback (
            id TEXT PRIMARY KEY,
            user TEXT NOT NULL,
            task_id TEXT NOT NULL,
            plan_id TEXT,
            action TEXT NOT NULL,
            snooze_duration_minutes INTEGER,
            at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_feedback_user_at ON task_feedback(user, at)",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS notifications (
            id TEXT PRIMARY KEY,
            user TEXT NOT NULL,
            task_id TEXT NOT NULL,
            plan_id TEXT,
            kind TEXT NOT NULL DEFAULT 'nudge',
            message TEXT NOT NULL,
            scheduled_at TEXT NOT NULL,
            sent_at TEXT,
            status TEXT NOT NULL DEFAULT 'pending',
            created_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // The at-most-once guard: at most one non-dismissed row per
    // (user, task, plan). Reservation is a conditional insert against this
    // index, never a read-then-write.
    sqlx::query(
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_notifications_live
         ON notifications(user, task_id, plan_id) WHERE status != 'dismissed'",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_notifications_user ON notifications(user, created_at)",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS task_dependencies (
            task_id TEXT NOT NULL,
            blocked_by_task_id TEXT NOT NULL,
            kind TEXT NOT NULL DEFAULT 'blocks',
            PRIMARY KEY (task_id, blocked_by_task_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS credentials (
            user TEXT NOT NULL,
            source TEXT NOT NULL,
            access_token TEXT NOT NULL,
            refresh_token TEXT,
            expires_at TEXT,
            scopes TEXT NOT NULL DEFAULT '[]',
            state TEXT NOT NULL DEFAULT 'active',
            updated_at TEXT NOT NULL,
            PRIMARY KEY (user, source)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS user_settings (
            user TEXT PRIMARY KEY,
            timezone TEXT NOT NULL DEFAULT 'UTC',
            email TEXT,
            email_enabled INTEGER
        )
        "#,
    )
    .execute(pool)
    .await?;

    debug!("store migrations complete");
    Ok(())
}
