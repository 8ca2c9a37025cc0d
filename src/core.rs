//! The operation surface consumed by the HTTP layer. Every call returns a
//! classified result; long-running workflows take the caller's cancellation
//! token.

use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::clock::Clock;
use crate::error::{CoreError, CoreResult};
use crate::ingest::{IngestPipeline, RunReport};
use crate::plan::Planner;
use crate::store::{Store, TaskFlags};
use crate::sync::{ConflictChoice, SyncEngine, SyncReport, SyncStatusSummary};
use crate::types::{
    DailyPlan, EntryStatus, FeedbackAction, Notification, NotificationStatus, PlanStatus,
    Reminder, Source, SyncDirection, SyncStatus, Task, TaskDependency, TaskFeedback,
};

pub struct Core {
    store: Store,
    pipeline: Arc<IngestPipeline>,
    planner: Arc<Planner>,
    sync: Arc<SyncEngine>,
    clock: Arc<dyn Clock>,
}

impl Core {
    pub fn new(
        store: Store,
        pipeline: Arc<IngestPipeline>,
        planner: Arc<Planner>,
        sync: Arc<SyncEngine>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            pipeline,
            planner,
            sync,
            clock,
        }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    // ------------------------------------------------------------------
    // Ingestion
    // ------------------------------------------------------------------

    pub async fn run_ingest(
        &self,
        user: &str,
        source: Source,
        cancel: &CancellationToken,
    ) -> CoreResult<RunReport> {
        if !source.requires_credential() {
            return Err(CoreError::invalid_request("manual tasks are not ingested"));
        }
        self.pipeline.run(user, source, cancel).await
    }

    // ------------------------------------------------------------------
    // Planning
    // ------------------------------------------------------------------

    pub async fn generate_plan(
        &self,
        user: &str,
        date: NaiveDate,
        cancel: &CancellationToken,
    ) -> CoreResult<DailyPlan> {
        self.planner.generate(user, date, cancel).await
    }

    pub async fn get_plan(&self, user: &str, date: NaiveDate) -> CoreResult<Option<DailyPlan>> {
        Ok(self.store.get_plan(user, date).await?)
    }

    /// `active -> completed | cancelled`, on explicit user request only.
    pub async fn update_plan_status(
        &self,
        user: &str,
        plan_id: &str,
        status: PlanStatus,
    ) -> CoreResult<()> {
        if status == PlanStatus::Active {
            return Err(CoreError::invalid_request(
                "plans cannot be reactivated; regenerate instead",
            ));
        }
        let updated = self.store.update_plan_status(user, plan_id, status).await?;
        if !updated {
            return Err(CoreError::invalid_request(format!("no plan {}", plan_id)));
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Feedback
    // ------------------------------------------------------------------

    /// `done` completes the task and marks the plan entry; `snoozed` shifts
    /// the entry's predicted window. Feedback is always appended — it is
    /// the learning signal.
    pub async fn record_feedback(
        &self,
        user: &str,
        task_id: &str,
        action: FeedbackAction,
        snooze_minutes: Option<i64>,
        plan_id: Option<&str>,
    ) -> CoreResult<()> {
        let now = self.clock.now();
        let task = self
            .store
            .get_task(user, task_id)
            .await?
            .ok_or_else(|| CoreError::invalid_request(format!("no task {}", task_id)))?;

        match action {
            FeedbackAction::Done => {
                self.store
                    .set_task_completed(user, &task.id, true, now)
                    .await?;
                if let Some(plan_id) = plan_id {
                    self.store
                        .update_entry_status(user, plan_id, task_id, EntryStatus::Done)
                        .await?;
                }
            }
            FeedbackAction::Snoozed => {
                let minutes = snooze_minutes.ok_or_else(|| {
                    CoreError::invalid_request("snooze feedback requires a duration")
                })?;
                if minutes <= 0 {
                    return Err(CoreError::invalid_request(
                        "snooze duration must be positive",
                    ));
                }
                if let Some(plan_id) = plan_id {
                    // The entry shifts; the existing notification reservation
                    // stays, so this fire is considered serviced.
                    self.store
                        .shift_entry_start(user, plan_id, task_id, minutes)
                        .await?;
                }
            }
        }

        self.store
            .append_feedback(&TaskFeedback {
                id: uuid::Uuid::new_v4().to_string(),
                user: user.to_string(),
                task_id: task_id.to_string(),
                plan_id: plan_id.map(|s| s.to_string()),
                action,
                snooze_duration_minutes: snooze_minutes,
                at: now,
            })
            .await?;

        info!(user, task = task_id, action = action.as_str(), "feedback recorded");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Notifications
    // ------------------------------------------------------------------

    pub async fn list_notifications(
        &self,
        user: &str,
        status: Option<NotificationStatus>,
        limit: Option<i64>,
    ) -> CoreResult<Vec<Notification>> {
        Ok(self
            .store
            .list_notifications(user, status, limit.unwrap_or(50))
            .await?)
    }

    pub async fn dismiss_notification(&self, user: &str, id: &str) -> CoreResult<()> {
        let dismissed = self.store.dismiss_notification(user, id).await?;
        if !dismissed {
            return Err(CoreError::invalid_request(format!(
                "no dismissible notification {}",
                id
            )));
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Task-manager sync
    // ------------------------------------------------------------------

    pub async fn sync_task_manager(
        &self,
        user: &str,
        cancel: &CancellationToken,
    ) -> CoreResult<SyncReport> {
        self.sync.sync(user, cancel).await
    }

    pub async fn resolve_conflict(
        &self,
        user: &str,
        task_id: &str,
        choice: ConflictChoice,
        cancel: &CancellationToken,
    ) -> CoreResult<Task> {
        self.sync.resolve(user, task_id, choice, cancel).await
    }

    pub async fn sync_status(&self, user: &str) -> CoreResult<SyncStatusSummary> {
        self.sync.status(user).await
    }

    // ------------------------------------------------------------------
    // Tasks, energy, reminders
    // ------------------------------------------------------------------

    pub async fn set_energy(&self, user: &str, date: NaiveDate, level: u8) -> CoreResult<()> {
        self.store
            .set_energy(user, date, level, self.clock.now())
            .await
            .map_err(|e| CoreError::invalid_request(e.to_string()))
    }

    pub async fn list_tasks(
        &self,
        user: &str,
        window: Option<(DateTime<Utc>, DateTime<Utc>)>,
    ) -> CoreResult<Vec<Task>> {
        Ok(match window {
            Some((start, end)) => self.store.list_tasks_between(user, start, end).await?,
            None => self.store.list_all_tasks(user).await?,
        })
    }

    pub async fn update_task_flags(
        &self,
        user: &str,
        task_id: &str,
        flags: TaskFlags,
    ) -> CoreResult<Task> {
        self.store
            .update_task_flags(user, task_id, flags, self.clock.now())
            .await?
            .ok_or_else(|| CoreError::invalid_request(format!("no task {}", task_id)))
    }

    pub async fn add_task_dependency(&self, user: &str, dep: &TaskDependency) -> CoreResult<()> {
        // Both endpoints must be the caller's tasks.
        for id in [&dep.task_id, &dep.blocked_by_task_id] {
            if self.store.get_task(user, id).await?.is_none() {
                return Err(CoreError::invalid_request(format!("no task {}", id)));
            }
        }
        self.store
            .add_dependency(dep)
            .await
            .map_err(|e| CoreError::invalid_request(e.to_string()))
    }

    /// Turn a reminder into a plannable manual task and remove the
    /// reminder.
    pub async fn promote_reminder(&self, user: &str, reminder_id: &str) -> CoreResult<Task> {
        let reminder = self
            .store
            .get_reminder(user, reminder_id)
            .await?
            .ok_or_else(|| {
                CoreError::invalid_request(format!("no reminder {}", reminder_id))
            })?;

        let task = task_from_reminder(&reminder, self.clock.now());
        self.store.create_task(&task).await?;
        self.store.delete_reminder(user, reminder_id).await?;
        info!(user, reminder = reminder_id, task = %task.id, "reminder promoted");
        Ok(task)
    }

    pub async fn list_reminders(
        &self,
        user: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> CoreResult<Vec<Reminder>> {
        Ok(self.store.list_reminders_between(user, start, end).await?)
    }
}

fn task_from_reminder(reminder: &Reminder, now: DateTime<Utc>) -> Task {
    Task {
        id: uuid::Uuid::new_v4().to_string(),
        user: reminder.user.clone(),
        source: Source::Manual,
        title: reminder.title.clone(),
        description: reminder.description.clone(),
        start: reminder.start,
        end: reminder.end,
        attendees: vec![],
        location: None,
        recurrence: None,
        priority: crate::types::Priority::Normal,
        is_critical: false,
        is_urgent: false,
        is_spam: false,
        spam_reason: None,
        spam_score: None,
        is_completed: false,
        completed_at: None,
        raw_payload: reminder.raw_payload.clone(),
        external_id: None,
        sync_status: SyncStatus::Synced,
        sync_direction: SyncDirection::Inbound,
        last_synced_at: None,
        external_updated_at: None,
        sync_error: None,
        created_at: now,
        updated_at: now,
    }
}
