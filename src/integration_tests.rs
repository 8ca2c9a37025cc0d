//! Cross-component scenarios wiring the real pipeline, planner, nudger, and
//! sync engine over an in-memory store with fake providers and a stubbed
//! LLM.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use serde_json::json;
use tokio_util::sync::CancellationToken;

use crate::clock::{Clock, ManualClock};
use crate::config::CoreConfig;
use crate::core::Core;
use crate::error::ErrorKind;
use crate::extract::ItemExtractor;
use crate::ingest::{IngestMetrics, IngestPipeline};
use crate::nudge::Nudger;
use crate::plan::Planner;
use crate::providers::ProviderError;
use crate::ratelimit::RateLimiter;
use crate::retry::RetryPolicy;
use crate::store::Store;
use crate::sync::{ConflictChoice, SyncEngine};
use crate::traits::{
    ChatMessage, Chatter, FetchWindow, ItemSource, ProviderItem, ProviderPage, RemoteChange,
    RemoteChangePage, RemoteTask, RemoteTaskDraft, ResponseFormat, TaskManagerClient,
};
use crate::types::{
    CredentialState, EntryStatus, FeedbackAction, NotificationStatus, Priority,
    ProviderCredential, Source, SyncStatus,
};

fn ts(h: u32, m: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 11, 8, h, m, 0).unwrap()
}

fn date() -> NaiveDate {
    NaiveDate::from_ymd_opt(2025, 11, 8).unwrap()
}

// ====================================================================
// Fakes
// ====================================================================

struct FakeFeed {
    source: Source,
    items: Mutex<Vec<ProviderItem>>,
}

#[async_trait]
impl ItemSource for FakeFeed {
    fn source(&self) -> Source {
        self.source
    }

    async fn list(
        &self,
        _credential: &ProviderCredential,
        _window: FetchWindow,
        _cursor: Option<String>,
        _cancel: &CancellationToken,
    ) -> Result<ProviderPage, ProviderError> {
        Ok(ProviderPage {
            items: self.items.lock().unwrap().clone(),
            next_cursor: None,
        })
    }
}

#[derive(Default)]
struct FakeTaskManager {
    changes: Mutex<Vec<RemoteChange>>,
    updates: Mutex<Vec<(String, RemoteTaskDraft)>>,
}

#[async_trait]
impl TaskManagerClient for FakeTaskManager {
    async fn list_changes(
        &self,
        _credential: &ProviderCredential,
        _since: Option<DateTime<Utc>>,
        _cursor: Option<String>,
        _cancel: &CancellationToken,
    ) -> Result<RemoteChangePage, ProviderError> {
        Ok(RemoteChangePage {
            changes: self.changes.lock().unwrap().clone(),
            next_cursor: None,
        })
    }

    async fn create(
        &self,
        _credential: &ProviderCredential,
        draft: &RemoteTaskDraft,
        _cancel: &CancellationToken,
    ) -> Result<RemoteTask, ProviderError> {
        Ok(RemoteTask {
            external_id: "created-1".to_string(),
            title: draft.title.clone(),
            description: draft.description.clone(),
            due: draft.due,
            priority: draft.priority,
            is_completed: draft.is_completed,
            external_updated_at: ts(12, 0),
            payload: json!({}),
        })
    }

    async fn update(
        &self,
        _credential: &ProviderCredential,
        external_id: &str,
        draft: &RemoteTaskDraft,
        _cancel: &CancellationToken,
    ) -> Result<RemoteTask, ProviderError> {
        self.updates
            .lock()
            .unwrap()
            .push((external_id.to_string(), draft.clone()));
        Ok(RemoteTask {
            external_id: external_id.to_string(),
            title: draft.title.clone(),
            description: draft.description.clone(),
            due: draft.due,
            priority: draft.priority,
            is_completed: draft.is_completed,
            external_updated_at: ts(12, 0),
            payload: json!({}),
        })
    }

    async fn complete(
        &self,
        _credential: &ProviderCredential,
        _external_id: &str,
        _cancel: &CancellationToken,
    ) -> Result<(), ProviderError> {
        Ok(())
    }

    async fn delete(
        &self,
        _credential: &ProviderCredential,
        _external_id: &str,
        _cancel: &CancellationToken,
    ) -> Result<(), ProviderError> {
        Ok(())
    }
}

/// Scripted LLM: pops one canned response per call, then errors.
struct ScriptedChatter {
    responses: Mutex<Vec<String>>,
}

#[async_trait]
impl Chatter for ScriptedChatter {
    async fn chat(
        &self,
        _messages: &[ChatMessage],
        _format: ResponseFormat,
        _cancel: &CancellationToken,
    ) -> Result<String, ProviderError> {
        let mut responses = self.responses.lock().unwrap();
        if responses.is_empty() {
            Err(ProviderError::from_status(503, "script exhausted"))
        } else {
            Ok(responses.remove(0))
        }
    }
}

// ====================================================================
// Harness
// ====================================================================

struct Harness {
    store: Store,
    core: Core,
    nudger: Nudger,
    clock: ManualClock,
    calendar: Arc<FakeFeed>,
    mail: Arc<FakeFeed>,
    task_manager: Arc<FakeTaskManager>,
}

async fn harness() -> Harness {
    let store = Store::new_in_memory().await.unwrap();
    let clock = ManualClock::new(ts(6, 0));
    let clock_arc: Arc<dyn Clock> = Arc::new(clock.clone());
    let config = CoreConfig::default();
    let limiter = Arc::new(RateLimiter::new(HashMap::new()));
    let metrics = Arc::new(IngestMetrics::new());

    let calendar = Arc::new(FakeFeed {
        source: Source::Calendar,
        items: Mutex::new(vec![]),
    });
    let mail = Arc::new(FakeFeed {
        source: Source::Mail,
        items: Mutex::new(vec![]),
    });
    let task_manager = Arc::new(FakeTaskManager::default());

    let mut sources: HashMap<Source, Arc<dyn ItemSource>> = HashMap::new();
    sources.insert(Source::Calendar, calendar.clone());
    sources.insert(Source::Mail, mail.clone());

    let extractor = Arc::new(ItemExtractor::new(None, 0.7, RetryPolicy::default()));
    let pipeline = Arc::new(IngestPipeline::new(
        store.clone(),
        extractor,
        sources,
        None,
        None,
        None,
        limiter.clone(),
        clock_arc.clone(),
        config.clone(),
        metrics,
    ));

    let planner = Arc::new(Planner::new(
        store.clone(),
        None,
        clock_arc.clone(),
        config.clone(),
    ));
    let sync = Arc::new(SyncEngine::new(
        store.clone(),
        task_manager.clone(),
        None,
        limiter,
        clock_arc.clone(),
    ));
    let nudger = Nudger::new(store.clone(), clock_arc.clone(), config, None);
    let core = Core::new(store.clone(), pipeline, planner, sync, clock_arc);

    for source in [Source::Calendar, Source::Mail, Source::TaskManager] {
        store
            .upsert_credential(&ProviderCredential {
                user: "u1".to_string(),
                source,
                access_token: "tok".to_string(),
                refresh_token: None,
                expires_at: None,
                scopes: vec![],
                state: CredentialState::Active,
                updated_at: ts(5, 0),
            })
            .await
            .unwrap();
    }

    Harness {
        store,
        core,
        nudger,
        clock,
        calendar,
        mail,
        task_manager,
    }
}

fn calendar_event(id: &str, title: &str, start: &str, end: &str) -> ProviderItem {
    let payload = json!({
        "id": id,
        "summary": title,
        "start": {"dateTime": start},
        "end": {"dateTime": end},
    });
    ProviderItem {
        external_id: Some(id.to_string()),
        external_updated_at: None,
        payload,
    }
}

// ====================================================================
// Scenarios
// ====================================================================

#[tokio::test]
async fn calendar_first_run_persists_two_of_three() {
    let h = harness().await;
    let mut cancelled = calendar_event(
        "E3",
        "Old sync",
        "2025-11-08T12:00:00Z",
        "2025-11-08T13:00:00Z",
    );
    cancelled.payload["status"] = json!("cancelled");
    let mut e1 = calendar_event(
        "E1",
        "Project sync",
        "2025-11-08T10:00:00Z",
        "2025-11-08T10:30:00Z",
    );
    e1.payload["attendees"] = json!([{"email": "a@x.test"}]);
    let mut e2 = calendar_event(
        "E2",
        "Recurring standup",
        "2025-11-08T12:00:00Z",
        "2025-11-08T12:15:00Z",
    );
    e2.payload["recurrence"] = json!(["RRULE:FREQ=DAILY"]);
    *h.calendar.items.lock().unwrap() = vec![e1, e2, cancelled];

    let report = h
        .core
        .run_ingest("u1", Source::Calendar, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.fetched, 3);
    assert_eq!(report.extracted, 2);
    assert_eq!(report.skipped_other, 1);
    assert_eq!(report.persisted_new, 2);

    let tasks = h.store.list_all_tasks("u1").await.unwrap();
    assert_eq!(tasks.len(), 2);
    assert!(tasks.iter().all(|t| t.source == Source::Calendar));
    assert!(tasks.iter().all(|t| t.sync_status == SyncStatus::Synced));
    let sync_task = tasks.iter().find(|t| t.title == "Project sync").unwrap();
    assert_eq!(sync_task.attendees, vec!["a@x.test"]);
}

#[tokio::test]
async fn spam_mail_is_persisted_but_never_planned() {
    let h = harness().await;
    *h.mail.items.lock().unwrap() = vec![ProviderItem {
        external_id: Some("msg-1".to_string()),
        external_updated_at: None,
        payload: json!({
            "subject": "50% off membership!",
            "sender": "deals@mail.club.test",
            "date": "2025-11-08T10:00:00Z",
            "body_text": "limited time offer",
            "labels": ["PROMOTIONS"],
        }),
    }];

    let report = h
        .core
        .run_ingest("u1", Source::Mail, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(report.skipped_spam, 1);
    assert_eq!(report.persisted_new, 1);

    let tasks = h.store.list_all_tasks("u1").await.unwrap();
    assert_eq!(tasks.len(), 1);
    assert!(tasks[0].is_spam);
    assert!(tasks[0].spam_reason.is_some());

    // Its start falls today, yet the plan excludes it.
    let plan = h
        .core
        .generate_plan("u1", date(), &CancellationToken::new())
        .await
        .unwrap();
    assert!(plan.entries.is_empty());
}

#[tokio::test]
async fn plan_orders_critical_urgent_normal() {
    let h = harness().await;
    *h.calendar.items.lock().unwrap() = vec![
        calendar_event(
            "tc",
            "Critical deploy",
            "2025-11-08T10:00:00Z",
            "2025-11-08T10:30:00Z",
        ),
        calendar_event(
            "tu",
            "Second review",
            "2025-11-08T11:00:00Z",
            "2025-11-08T11:30:00Z",
        ),
        calendar_event(
            "tn",
            "Weekly tidy",
            "2025-11-08T14:00:00Z",
            "2025-11-08T14:30:00Z",
        ),
    ];
    h.core
        .run_ingest("u1", Source::Calendar, &CancellationToken::new())
        .await
        .unwrap();

    let tasks = h.store.list_all_tasks("u1").await.unwrap();
    for task in &tasks {
        let flags = match task.title.as_str() {
            "Critical deploy" => crate::store::TaskFlags {
                is_critical: Some(true),
                priority: Some(Priority::High),
                ..Default::default()
            },
            "Second review" => crate::store::TaskFlags {
                is_urgent: Some(true),
                ..Default::default()
            },
            _ => continue,
        };
        h.core.update_task_flags("u1", &task.id, flags).await.unwrap();
    }

    h.core.set_energy("u1", date(), 2).await.unwrap();
    let plan = h
        .core
        .generate_plan("u1", date(), &CancellationToken::new())
        .await
        .unwrap();

    let titles: Vec<&str> = plan.entries.iter().map(|e| e.title.as_str()).collect();
    assert_eq!(titles, vec!["Critical deploy", "Second review", "Weekly tidy"]);
    assert!(plan.entries[0].priority_score > plan.entries[1].priority_score);
    assert!(plan.entries[1].priority_score > plan.entries[2].priority_score);
    // Deterministic fallback: action plans empty but within bounds.
    assert!(plan.entries.iter().all(|e| e.action_plan.len() <= 6));
    assert_eq!(plan.energy_level, Some(2));
}

#[tokio::test]
async fn nudge_fires_exactly_once_across_ticks() {
    let h = harness().await;
    *h.calendar.items.lock().unwrap() = vec![calendar_event(
        "E1",
        "Focus block",
        "2025-11-08T10:02:00Z",
        "2025-11-08T10:32:00Z",
    )];
    h.core
        .run_ingest("u1", Source::Calendar, &CancellationToken::new())
        .await
        .unwrap();
    let plan = h
        .core
        .generate_plan("u1", date(), &CancellationToken::new())
        .await
        .unwrap();

    h.clock.set(ts(10, 0));
    let first = h.nudger.tick(&CancellationToken::new()).await.unwrap();
    assert_eq!(first.nudges_sent, 1);

    h.clock.set(ts(10, 0) + chrono::Duration::seconds(30));
    let second = h.nudger.tick(&CancellationToken::new()).await.unwrap();
    assert_eq!(second.nudges_sent, 0);

    let live = h
        .store
        .live_notifications_for_plan("u1", &plan.id)
        .await
        .unwrap();
    assert_eq!(live.len(), 1);
    assert_eq!(live[0].status, NotificationStatus::Sent);
    assert!(live[0].message.contains("Focus block is starting now"));
}

#[tokio::test]
async fn snooze_shifts_entry_without_duplicate_nudge() {
    let h = harness().await;
    *h.calendar.items.lock().unwrap() = vec![calendar_event(
        "E1",
        "Deep work",
        "2025-11-08T10:02:00Z",
        "2025-11-08T10:32:00Z",
    )];
    h.core
        .run_ingest("u1", Source::Calendar, &CancellationToken::new())
        .await
        .unwrap();
    let plan = h
        .core
        .generate_plan("u1", date(), &CancellationToken::new())
        .await
        .unwrap();
    let task_id = plan.entries[0].task_id.clone();

    h.clock.set(ts(10, 0));
    assert_eq!(
        h.nudger
            .tick(&CancellationToken::new())
            .await
            .unwrap()
            .nudges_sent,
        1
    );

    h.core
        .record_feedback(
            "u1",
            &task_id,
            FeedbackAction::Snoozed,
            Some(30),
            Some(&plan.id),
        )
        .await
        .unwrap();

    let stored = h
        .store
        .get_plan_by_id("u1", &plan.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.entries[0].predicted_start, ts(10, 32));
    assert_eq!(stored.entries[0].status, EntryStatus::Snoozed);

    // A tick inside the shifted window does not fire again: the previous
    // reservation still stands for this plan.
    h.clock.set(ts(10, 32));
    let report = h.nudger.tick(&CancellationToken::new()).await.unwrap();
    assert_eq!(report.nudges_sent, 0);

    let live = h
        .store
        .live_notifications_for_plan("u1", &plan.id)
        .await
        .unwrap();
    assert_eq!(live.len(), 1);
}

#[tokio::test]
async fn sync_conflict_then_resolve_local_wins_remotely() {
    let h = harness().await;

    *h.task_manager.changes.lock().unwrap() = vec![RemoteChange {
        task: RemoteTask {
            external_id: "td-1".to_string(),
            title: "B".to_string(),
            description: None,
            due: Some(ts(15, 0)),
            priority: Priority::Normal,
            is_completed: false,
            external_updated_at: ts(6, 30),
            payload: json!({"id": "td-1"}),
        },
        deleted: false,
    }];
    h.clock.set(ts(7, 0));
    h.core
        .sync_task_manager("u1", &CancellationToken::new())
        .await
        .unwrap();
    let task = h
        .store
        .find_by_external_id("u1", Source::TaskManager, "td-1")
        .await
        .unwrap()
        .unwrap();

    // Local edit at t1 > last_synced_at.
    h.clock.set(ts(8, 0));
    h.core
        .update_task_flags(
            "u1",
            &task.id,
            crate::store::TaskFlags {
                is_critical: Some(true),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    // Remote edit at t2 > last_synced_at.
    h.task_manager.changes.lock().unwrap()[0] = RemoteChange {
        task: RemoteTask {
            external_id: "td-1".to_string(),
            title: "B (remote)".to_string(),
            description: None,
            due: Some(ts(15, 0)),
            priority: Priority::Normal,
            is_completed: false,
            external_updated_at: ts(8, 30),
            payload: json!({"id": "td-1"}),
        },
        deleted: false,
    };
    h.clock.set(ts(9, 0));
    let report = h
        .core
        .sync_task_manager("u1", &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(report.conflicts, 1);

    let conflicted = h.store.get_task("u1", &task.id).await.unwrap().unwrap();
    assert_eq!(conflicted.sync_status, SyncStatus::Conflict);
    // Local side untouched.
    assert_eq!(conflicted.title, "B");

    let status = h.core.sync_status("u1").await.unwrap();
    assert_eq!(status.sync_status, "conflict");
    assert_eq!(status.conflicts_count, 1);

    // Resolve local: provider receives the local version.
    h.clock.set(ts(9, 30));
    let resolved = h
        .core
        .resolve_conflict(
            "u1",
            &task.id,
            ConflictChoice::Local,
            &CancellationToken::new(),
        )
        .await
        .unwrap();
    assert_eq!(resolved.sync_status, SyncStatus::Synced);
    assert_eq!(resolved.last_synced_at, Some(ts(9, 30)));

    let updates = h.task_manager.updates.lock().unwrap();
    assert_eq!(updates.len(), 1);
    assert_eq!(updates[0].1.title, "B");

    let status = h.core.sync_status("u1").await.unwrap();
    assert_eq!(status.sync_status, "synced");
}

#[tokio::test]
async fn cancellation_mid_run_leaves_consistent_store_and_rerun_succeeds() {
    let h = harness().await;
    *h.calendar.items.lock().unwrap() = vec![calendar_event(
        "E1",
        "Meeting",
        "2025-11-08T10:00:00Z",
        "2025-11-08T10:30:00Z",
    )];

    // Cancelled before the run starts: nothing persisted, error classified.
    let cancel = CancellationToken::new();
    cancel.cancel();
    let result = h.core.run_ingest("u1", Source::Calendar, &cancel).await;
    match result {
        Err(err) => assert!(matches!(
            err.kind,
            ErrorKind::Transient | ErrorKind::RateLimited
        )),
        Ok(report) => assert_eq!(report.persisted_new, 0),
    }

    // Re-run succeeds and persists the same provider state cleanly.
    let report = h
        .core
        .run_ingest("u1", Source::Calendar, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(report.persisted_new, 1);

    let tasks = h.store.list_all_tasks("u1").await.unwrap();
    assert_eq!(tasks.len(), 1);
    assert!(tasks[0].end >= tasks[0].start);
    assert!(!tasks[0].is_completed);
}

#[tokio::test]
async fn reingest_preserves_user_flags_and_updated_at() {
    let h = harness().await;
    *h.calendar.items.lock().unwrap() = vec![calendar_event(
        "E1",
        "Meeting",
        "2025-11-08T10:00:00Z",
        "2025-11-08T10:30:00Z",
    )];
    h.core
        .run_ingest("u1", Source::Calendar, &CancellationToken::new())
        .await
        .unwrap();

    let task = &h.store.list_all_tasks("u1").await.unwrap()[0];
    h.core
        .update_task_flags(
            "u1",
            &task.id,
            crate::store::TaskFlags {
                is_urgent: Some(true),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    h.clock.advance(chrono::Duration::hours(1));
    let report = h
        .core
        .run_ingest("u1", Source::Calendar, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(report.persisted_new, 0);
    assert_eq!(report.persisted_updated, 0);

    let task = &h.store.list_all_tasks("u1").await.unwrap()[0];
    assert!(task.is_urgent);
}

#[tokio::test]
async fn llm_composed_plan_carries_action_steps() {
    let h = harness().await;
    *h.calendar.items.lock().unwrap() = vec![calendar_event(
        "E1",
        "Quarterly summary",
        "2025-11-08T09:00:00Z",
        "2025-11-08T09:30:00Z",
    )];
    h.core
        .run_ingest("u1", Source::Calendar, &CancellationToken::new())
        .await
        .unwrap();
    let task_id = h.store.list_all_tasks("u1").await.unwrap()[0].id.clone();

    let response = format!(
        r#"{{"entries": [{{
            "task_id": "{}",
            "predicted_start": "2025-11-08T09:00:00Z",
            "predicted_end": "2025-11-08T09:30:00Z",
            "action_plan": ["Open the doc", "Draft the summary", "Send for review"]
        }}]}}"#,
        task_id
    );
    let planner = Planner::new(
        h.store.clone(),
        Some(Arc::new(ScriptedChatter {
            responses: Mutex::new(vec![response]),
        })),
        Arc::new(h.clock.clone()),
        CoreConfig::default(),
    );
    let plan = planner
        .generate("u1", date(), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(plan.entries.len(), 1);
    assert_eq!(plan.entries[0].action_plan.len(), 3);
    assert_eq!(plan.entries[0].title, "Quarterly summary");
}

#[tokio::test]
async fn plan_regeneration_rearms_nudges_after_dismissal() {
    let h = harness().await;
    *h.calendar.items.lock().unwrap() = vec![calendar_event(
        "E1",
        "Focus block",
        "2025-11-08T10:02:00Z",
        "2025-11-08T10:32:00Z",
    )];
    h.core
        .run_ingest("u1", Source::Calendar, &CancellationToken::new())
        .await
        .unwrap();
    h.core
        .generate_plan("u1", date(), &CancellationToken::new())
        .await
        .unwrap();

    h.clock.set(ts(10, 0));
    assert_eq!(
        h.nudger
            .tick(&CancellationToken::new())
            .await
            .unwrap()
            .nudges_sent,
        1
    );

    let sent = h
        .core
        .list_notifications("u1", Some(NotificationStatus::Sent), None)
        .await
        .unwrap();
    h.core.dismiss_notification("u1", &sent[0].id).await.unwrap();

    // Same plan: stays quiet.
    h.clock.set(ts(10, 1));
    assert_eq!(
        h.nudger
            .tick(&CancellationToken::new())
            .await
            .unwrap()
            .nudges_sent,
        0
    );

    // Regenerated plan: new plan id, the entry fires again.
    let new_plan = h
        .core
        .generate_plan("u1", date(), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(
        h.nudger
            .tick(&CancellationToken::new())
            .await
            .unwrap()
            .nudges_sent,
        1
    );
    assert_eq!(
        h.store
            .live_notifications_for_plan("u1", &new_plan.id)
            .await
            .unwrap()
            .len(),
        1
    );
}
