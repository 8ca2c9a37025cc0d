//! Nudge delivery: per-tick scanning of active plans and at-most-once
//! notification dispatch.

pub mod scheduler;

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::clock::Clock;
use crate::config::CoreConfig;
use crate::store::Store;
use crate::traits::Notifier;
use crate::types::{DailyPlan, EntryStatus, PlanEntry};

const USER_SLICE_BUDGET: Duration = Duration::from_secs(10);

/// What one tick did, for logs and the health endpoint.
#[derive(Debug, Clone, Copy, Default)]
pub struct TickReport {
    pub users: usize,
    pub checked: usize,
    pub nudges_sent: usize,
    pub skipped: usize,
}

pub struct Nudger {
    store: Store,
    clock: Arc<dyn Clock>,
    config: CoreConfig,
    mailer: Option<Arc<dyn Notifier>>,
}

impl Nudger {
    pub fn new(
        store: Store,
        clock: Arc<dyn Clock>,
        config: CoreConfig,
        mailer: Option<Arc<dyn Notifier>>,
    ) -> Self {
        Self {
            store,
            clock,
            config,
            mailer,
        }
    }

    /// One scheduler tick: scan every user's active plan for today and fire
    /// nudges for entries whose predicted start falls inside the window.
    /// Per-user work runs under a slice budget; a user that exceeds it is
    /// abandoned for this tick and their unreserved entries fire next tick.
    pub async fn tick(&self, cancel: &CancellationToken) -> anyhow::Result<TickReport> {
        let now = self.clock.now();
        let mut report = TickReport::default();

        let plans = self.store.list_active_plans().await?;
        for plan in plans {
            if cancel.is_cancelled() {
                break;
            }

            let settings = self.store.get_user_settings(&plan.user).await?;
            // "Today" is evaluated in the user's configured zone.
            if plan.date != now.with_timezone(&settings.tz()).date_naive() {
                continue;
            }

            report.users += 1;
            let email_to = match effective_email_enabled(&self.config, &settings) {
                true => settings.email.clone(),
                false => None,
            };

            let sliced = tokio::time::timeout(
                USER_SLICE_BUDGET,
                self.process_plan(&plan, now, email_to.as_deref(), &mut report, cancel),
            )
            .await;
            match sliced {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    warn!(user = %plan.user, "nudge pass failed: {}", err);
                }
                Err(_) => {
                    warn!(user = %plan.user, "nudge pass exceeded the user slice budget");
                }
            }
        }

        info!(
            users = report.users,
            checked = report.checked,
            sent = report.nudges_sent,
            skipped = report.skipped,
            "nudge tick complete"
        );
        Ok(report)
    }

    /// Entries are processed in predicted_start order within a plan.
    async fn process_plan(
        &self,
        plan: &DailyPlan,
        now: DateTime<Utc>,
        email_to: Option<&str>,
        report: &mut TickReport,
        cancel: &CancellationToken,
    ) -> anyhow::Result<()> {
        let window_start = now - chrono::Duration::minutes(self.config.nudge_grace);
        let window_end = now + chrono::Duration::minutes(self.config.nudge_lookahead);

        let mut entries: Vec<&PlanEntry> = plan.entries.iter().collect();
        entries.sort_by_key(|e| e.predicted_start);

        for entry in entries {
            if cancel.is_cancelled() {
                return Ok(());
            }
            report.checked += 1;

            if entry.status != EntryStatus::Pending {
                continue;
            }
            if entry.predicted_start < window_start || entry.predicted_start > window_end {
                continue;
            }

            // Plans should never contain spam, but the exclusion is load-
            // bearing enough to re-check at the point of delivery.
            match self.store.get_task(&plan.user, &entry.task_id).await? {
                Some(task) if task.is_spam => continue,
                Some(task) if task.is_completed => continue,
                None => continue,
                Some(_) => {}
            }

            let message = compose_message(&entry.title, entry.is_critical, entry.is_urgent);

            // The conditional insert is the at-most-once guard: losing the
            // race (or a previous fire for this plan) comes back as None.
            let Some(notification) = self
                .store
                .reserve_notification(
                    &plan.user,
                    &entry.task_id,
                    Some(&plan.id),
                    "nudge",
                    &message,
                    entry.predicted_start,
                    now,
                )
                .await?
            else {
                report.skipped += 1;
                continue;
            };

            // In-app delivery is marking the reservation sent.
            self.store
                .mark_notification_sent(&notification.id, now)
                .await?;
            report.nudges_sent += 1;

            // Email is best-effort: failure logs and never reverts `sent`.
            if let (Some(mailer), Some(to)) = (&self.mailer, email_to) {
                if let Err(err) = mailer.deliver(to, &notification).await {
                    warn!(user = %plan.user, "email nudge failed: {}", err);
                }
            }
        }

        Ok(())
    }
}

fn effective_email_enabled(config: &CoreConfig, settings: &crate::types::UserSettings) -> bool {
    settings.email_enabled.unwrap_or(config.email_enabled)
}

pub fn compose_message(title: &str, is_critical: bool, is_urgent: bool) -> String {
    if is_critical {
        format!("🔴 CRITICAL: {} is starting now", title)
    } else if is_urgent {
        format!("⚠️ URGENT: {} is starting now", title)
    } else {
        format!("📋 {} is starting now", title)
    }
}
