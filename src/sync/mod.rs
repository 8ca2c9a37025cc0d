//! Bidirectional reconciliation between the local task store and an
//! external task manager.
//!
//! Within one cycle remote changes are applied before local pushes. A task
//! is in conflict iff both sides mutated it since the last sync; conflicts
//! are never auto-merged — the user resolves them.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::clock::Clock;
use crate::error::{CoreError, CoreResult};
use crate::providers::ProviderErrorKind;
use crate::ratelimit::RateLimiter;
use crate::retry::{with_retries, RetryPolicy};
use crate::store::Store;
use crate::traits::{RemoteTask, RemoteTaskDraft, TaskManagerClient, TokenRefresher};
use crate::types::{
    CredentialState, Priority, ProviderCredential, Source, SyncDirection, SyncStatus, Task,
};

const CREDENTIAL_SKEW_MINS: i64 = 5;
const RETRY_FLOOR_BASE_MINS: i64 = 5;
const RETRY_FLOOR_CAP_MINS: i64 = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictChoice {
    Local,
    External,
}

impl ConflictChoice {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "local" => Some(ConflictChoice::Local),
            "external" => Some(ConflictChoice::External),
            _ => None,
        }
    }
}

/// What one sync cycle did.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncReport {
    pub pulled: usize,
    pub created_local: usize,
    pub updated_local: usize,
    pub conflicts: usize,
    pub deleted_remote: usize,
    pub pushed: usize,
    pub push_errors: usize,
    pub errors: Vec<String>,
}

impl SyncReport {
    fn record_error(&mut self, message: String) {
        crate::utils::push_bounded_error(&mut self.errors, message, 20);
    }
}

/// Engine-level status surfaced to the HTTP layer.
#[derive(Debug, Clone, Serialize)]
pub struct SyncStatusSummary {
    pub connected: bool,
    pub last_sync: Option<DateTime<Utc>>,
    pub sync_status: &'static str,
    pub status_counts: HashMap<String, i64>,
    pub conflicts_count: i64,
    pub errors_count: i64,
}

pub struct SyncEngine {
    store: Store,
    client: Arc<dyn TaskManagerClient>,
    refresher: Option<Arc<dyn TokenRefresher>>,
    limiter: Arc<RateLimiter>,
    clock: Arc<dyn Clock>,
    retry: RetryPolicy,
    in_flight: Arc<Mutex<HashSet<String>>>,
}

impl SyncEngine {
    pub fn new(
        store: Store,
        client: Arc<dyn TaskManagerClient>,
        refresher: Option<Arc<dyn TokenRefresher>>,
        limiter: Arc<RateLimiter>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            client,
            refresher,
            limiter,
            clock,
            retry: RetryPolicy::default(),
            in_flight: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// One full cycle: pull remote changes, then push local ones.
    pub async fn sync(&self, user: &str, cancel: &CancellationToken) -> CoreResult<SyncReport> {
        let _slot = SyncSlot::acquire(&self.in_flight, user)
            .ok_or_else(|| CoreError::busy(format!("sync already running for {}", user)))?;

        let credential = self.load_credential(user, cancel).await?;
        let mut report = SyncReport::default();

        self.pull_remote(user, &credential, &mut report, cancel)
            .await?;

        if cancel.is_cancelled() {
            return Ok(report);
        }

        self.push_local(user, &credential, &mut report, cancel)
            .await?;

        info!(
            user,
            pulled = report.pulled,
            created = report.created_local,
            updated = report.updated_local,
            conflicts = report.conflicts,
            pushed = report.pushed,
            push_errors = report.push_errors,
            "sync cycle complete"
        );
        Ok(report)
    }

    /// User-driven conflict resolution. `Local` pushes the local version
    /// outward; `External` overwrites local state with the remote version
    /// captured at conflict time. Either path clears the error and advances
    /// `last_synced_at`.
    pub async fn resolve(
        &self,
        user: &str,
        task_id: &str,
        choice: ConflictChoice,
        cancel: &CancellationToken,
    ) -> CoreResult<Task> {
        let task = self
            .store
            .get_task(user, task_id)
            .await?
            .ok_or_else(|| CoreError::invalid_request(format!("no task {}", task_id)))?;

        if task.sync_status != SyncStatus::Conflict {
            return Err(CoreError::invalid_request(format!(
                "task {} is not in conflict (status: {})",
                task_id,
                task.sync_status.as_str()
            )));
        }

        let now = self.clock.now();
        match choice {
            ConflictChoice::Local => {
                let credential = self.load_credential(user, cancel).await?;
                let external_id = task.external_id.clone().ok_or_else(|| {
                    CoreError::internal(format!("conflicted task {} has no external id", task_id))
                })?;
                let draft = draft_from_task(&task);

                self.limiter
                    .acquire(user, Source::TaskManager, self.clock.as_ref(), cancel)
                    .await
                    .map_err(|e| CoreError::transient(e.to_string()))?;
                with_retries(self.retry, cancel, "resolve_push", || {
                    self.client.update(&credential, &external_id, &draft, cancel)
                })
                .await
                .map_err(|e| e.into_core())?;

                if task.is_completed {
                    with_retries(self.retry, cancel, "resolve_complete", || {
                        self.client.complete(&credential, &external_id, cancel)
                    })
                    .await
                    .map_err(|e| e.into_core())?;
                }

                self.store.mark_synced(user, task_id, now).await?;
            }
            ConflictChoice::External => {
                let remote = self
                    .store
                    .get_remote_snapshot(user, task_id)
                    .await?
                    .ok_or_else(|| {
                        CoreError::internal(format!(
                            "conflicted task {} has no stored remote version",
                            task_id
                        ))
                    })?;
                self.store
                    .overwrite_from_remote(user, task_id, &remote, now)
                    .await?;
            }
        }

        self.store
            .get_task(user, task_id)
            .await?
            .ok_or_else(|| CoreError::internal("task vanished during resolution"))
    }

    /// Connection + per-status counts for the status endpoint.
    pub async fn status(&self, user: &str) -> CoreResult<SyncStatusSummary> {
        let credential = self.store.get_credential(user, Source::TaskManager).await?;
        let connected = credential
            .map(|c| c.state == CredentialState::Active)
            .unwrap_or(false);

        let status_counts = self.store.sync_status_counts(user).await?;
        let conflicts_count = status_counts.get("conflict").copied().unwrap_or(0);
        let errors_count = status_counts.get("error").copied().unwrap_or(0);
        let pending_count = status_counts.get("pending").copied().unwrap_or(0);
        let last_sync = self.store.max_last_synced_at(user, Source::TaskManager).await?;

        let sync_status = if conflicts_count > 0 {
            "conflict"
        } else if errors_count > 0 {
            "error"
        } else if pending_count > 0 {
            "pending"
        } else {
            "synced"
        };

        Ok(SyncStatusSummary {
            connected,
            last_sync,
            sync_status,
            status_counts,
            conflicts_count,
            errors_count,
        })
    }

    async fn load_credential(
        &self,
        user: &str,
        cancel: &CancellationToken,
    ) -> CoreResult<ProviderCredential> {
        let credential = self
            .store
            .get_credential(user, Source::TaskManager)
            .await?
            .ok_or_else(|| {
                CoreError::auth_required("no task manager credential; connect the provider first")
            })?;

        if credential.state == CredentialState::Revoked {
            return Err(CoreError::auth_required(
                "task manager credential revoked; reconnect required",
            ));
        }

        let now = self.clock.now();
        if !credential.needs_refresh(now, chrono::Duration::minutes(CREDENTIAL_SKEW_MINS)) {
            return Ok(credential);
        }

        let Some(refresher) = &self.refresher else {
            return Err(CoreError::auth_required(
                "task manager credential expired and no refresher is configured",
            ));
        };

        match refresher.refresh(&credential, cancel).await {
            Ok(refreshed) => {
                self.store.upsert_credential(&refreshed).await?;
                Ok(refreshed)
            }
            Err(err) => {
                self.store
                    .mark_credential_revoked(user, Source::TaskManager, now)
                    .await?;
                Err(CoreError::auth_required(format!(
                    "task manager token refresh failed ({}); reconnect required",
                    err
                )))
            }
        }
    }

    /// Inbound pass: apply every remote change since the newest local
    /// `last_synced_at`. Item failures are isolated in the report.
    async fn pull_remote(
        &self,
        user: &str,
        credential: &ProviderCredential,
        report: &mut SyncReport,
        cancel: &CancellationToken,
    ) -> CoreResult<()> {
        let since = self.store.max_last_synced_at(user, Source::TaskManager).await?;
        let mut cursor: Option<String> = None;

        loop {
            self.limiter
                .acquire(user, Source::TaskManager, self.clock.as_ref(), cancel)
                .await
                .map_err(|e| CoreError::transient(e.to_string()))?;

            let page = with_retries(self.retry, cancel, "sync_pull", || {
                self.client.list_changes(credential, since, cursor.clone(), cancel)
            })
            .await
            .map_err(|err| {
                if err.kind == ProviderErrorKind::Auth {
                    CoreError::auth_required(err.to_string())
                } else {
                    err.into_core()
                }
            })?;

            for change in page.changes {
                if cancel.is_cancelled() {
                    return Ok(());
                }
                report.pulled += 1;
                if let Err(err) = self.apply_remote_change(user, &change.task, change.deleted, report).await
                {
                    report.record_error(format!(
                        "apply remote {} failed: {}",
                        change.task.external_id, err
                    ));
                }
            }

            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }

        Ok(())
    }

    async fn apply_remote_change(
        &self,
        user: &str,
        remote: &RemoteTask,
        deleted: bool,
        report: &mut SyncReport,
    ) -> anyhow::Result<()> {
        let now = self.clock.now();
        let local = self
            .store
            .find_by_external_id(user, Source::TaskManager, &remote.external_id)
            .await?;

        if deleted {
            // Remote deletions complete the local task; nothing is ever
            // hard-deleted by the system.
            if let Some(task) = local {
                self.store
                    .set_task_completed(user, &task.id, true, now)
                    .await?;
                self.store.mark_synced(user, &task.id, now).await?;
                report.deleted_remote += 1;
            }
            return Ok(());
        }

        let Some(task) = local else {
            let task = task_from_remote(user, remote, now);
            self.store.create_task(&task).await?;
            report.created_local += 1;
            return Ok(());
        };

        if task.sync_status == SyncStatus::Conflict {
            // Already awaiting resolution; refresh the stored remote side.
            self.store.mark_conflict(user, &task.id, remote).await?;
            return Ok(());
        }

        let local_changed = match task.last_synced_at {
            Some(last) => task.updated_at > last,
            None => task.sync_status == SyncStatus::Pending,
        };
        let remote_changed = match task.last_synced_at {
            Some(last) => remote.external_updated_at > last,
            None => true,
        };

        if local_changed && remote_changed {
            self.store.mark_conflict(user, &task.id, remote).await?;
            report.conflicts += 1;
            warn!(user, task = %task.id, "sync conflict: both sides changed");
        } else if !local_changed && remote_changed {
            self.store
                .overwrite_from_remote(user, &task.id, remote, now)
                .await?;
            report.updated_local += 1;
        } else if !local_changed && !remote_changed {
            // Nothing moved; just advance the sync marker.
            self.store.mark_synced(user, &task.id, now).await?;
        }
        // local_changed && !remote_changed: the outbound pass handles it.

        Ok(())
    }

    /// Outbound pass: push pending local mutations, then retry errored
    /// tasks whose backoff floor has elapsed.
    async fn push_local(
        &self,
        user: &str,
        credential: &ProviderCredential,
        report: &mut SyncReport,
        cancel: &CancellationToken,
    ) -> CoreResult<()> {
        let now = self.clock.now();
        let mut to_push = self.store.list_outbound_pending(user).await?;

        for (task, attempts, last_attempt) in self.store.list_sync_errored(user).await? {
            if !task.sync_direction.pushes_outbound() {
                continue;
            }
            let floor = retry_floor(attempts);
            let due = last_attempt
                .map(|at| now - at >= floor)
                .unwrap_or(true);
            if due {
                to_push.push(task);
            }
        }

        for task in to_push {
            if cancel.is_cancelled() {
                return Ok(());
            }
            if let Err(err) = self.push_one(user, credential, &task, cancel).await {
                report.push_errors += 1;
                let message = err.to_string();
                report.record_error(format!("push '{}' failed: {}", task.title, message));
                self.store
                    .mark_sync_error(user, &task.id, &message, self.clock.now())
                    .await?;
            } else {
                report.pushed += 1;
            }
        }

        Ok(())
    }

    async fn push_one(
        &self,
        user: &str,
        credential: &ProviderCredential,
        task: &Task,
        cancel: &CancellationToken,
    ) -> CoreResult<()> {
        let draft = draft_from_task(task);
        let now = self.clock.now();

        self.limiter
            .acquire(user, Source::TaskManager, self.clock.as_ref(), cancel)
            .await
            .map_err(|e| CoreError::transient(e.to_string()))?;

        match &task.external_id {
            Some(external_id) => {
                if task.is_completed {
                    with_retries(self.retry, cancel, "sync_complete", || {
                        self.client.complete(credential, external_id, cancel)
                    })
                    .await
                    .map_err(|e| e.into_core())?;
                } else {
                    with_retries(self.retry, cancel, "sync_update", || {
                        self.client.update(credential, external_id, &draft, cancel)
                    })
                    .await
                    .map_err(|e| e.into_core())?;
                }
            }
            None => {
                let created = with_retries(self.retry, cancel, "sync_create", || {
                    self.client.create(credential, &draft, cancel)
                })
                .await
                .map_err(|e| e.into_core())?;
                self.store
                    .set_external_id(user, &task.id, &created.external_id)
                    .await?;
            }
        }

        self.store.mark_synced(user, &task.id, now).await?;
        Ok(())
    }
}

/// Backoff floor before an errored task is retried: 5 minutes doubling per
/// attempt, capped at an hour.
fn retry_floor(attempts: i64) -> chrono::Duration {
    let mins = RETRY_FLOOR_BASE_MINS
        .saturating_mul(1i64 << attempts.saturating_sub(1).clamp(0, 10))
        .min(RETRY_FLOOR_CAP_MINS);
    chrono::Duration::minutes(mins)
}

fn draft_from_task(task: &Task) -> RemoteTaskDraft {
    RemoteTaskDraft {
        title: task.title.clone(),
        description: task.description.clone(),
        due: Some(task.end),
        priority: task.priority,
        is_completed: task.is_completed,
    }
}

fn task_from_remote(user: &str, remote: &RemoteTask, now: DateTime<Utc>) -> Task {
    let (start, end) = match remote.due {
        Some(due) => (due - chrono::Duration::minutes(30), due),
        None => (now, now + chrono::Duration::minutes(30)),
    };
    Task {
        id: uuid::Uuid::new_v4().to_string(),
        user: user.to_string(),
        source: Source::TaskManager,
        title: remote.title.clone(),
        description: remote.description.clone(),
        start,
        end,
        attendees: vec![],
        location: None,
        recurrence: None,
        priority: remote.priority,
        is_critical: remote.priority == Priority::High,
        is_urgent: false,
        is_spam: false,
        spam_reason: None,
        spam_score: None,
        is_completed: remote.is_completed,
        completed_at: remote.is_completed.then_some(now),
        raw_payload: remote.payload.clone(),
        external_id: Some(remote.external_id.clone()),
        sync_status: SyncStatus::Synced,
        sync_direction: SyncDirection::Bidirectional,
        last_synced_at: Some(now),
        external_updated_at: Some(remote.external_updated_at),
        sync_error: None,
        created_at: now,
        updated_at: now,
    }
}

struct SyncSlot {
    set: Arc<Mutex<HashSet<String>>>,
    user: String,
}

impl SyncSlot {
    fn acquire(set: &Arc<Mutex<HashSet<String>>>, user: &str) -> Option<Self> {
        let mut guard = set.lock().unwrap_or_else(|e| e.into_inner());
        if !guard.insert(user.to_string()) {
            return None;
        }
        Some(Self {
            set: set.clone(),
            user: user.to_string(),
        })
    }
}

impl Drop for SyncSlot {
    fn drop(&mut self) {
        let mut guard = self.set.lock().unwrap_or_else(|e| e.into_inner());
        guard.remove(&self.user);
    }
}
