//! Staged ingestion pipeline: Auth -> Fetch -> Extract -> Persist -> Encode.
//!
//! Stage failures fall into two classes: terminal (credential problems,
//! repeated fetch failures) abort the run with a single classified error;
//! item-level failures are counted in the report and the stage completes.
//! Encoding is optional — its failures degrade the run, never fail it.

mod guard;
mod report;

pub use guard::PipelineGuard;
pub use report::{IngestMetrics, RunReport};

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::clock::Clock;
use crate::config::CoreConfig;
use crate::error::{CoreError, CoreResult};
use crate::extract::{Extractor, NormalizedItem};
use crate::providers::ProviderErrorKind;
use crate::ratelimit::RateLimiter;
use crate::retry::{with_retries, RetryPolicy};
use crate::store::{Store, UpsertOutcome};
use crate::traits::{
    Embedder, FetchWindow, ItemSource, ProviderItem, TokenRefresher, VectorStore,
};
use crate::types::{CredentialState, ProviderCredential, Reminder, Source};

const STAGE_TIMEOUT: Duration = Duration::from_secs(120);
const RUN_TIMEOUT: Duration = Duration::from_secs(600);
const CREDENTIAL_SKEW_MINS: i64 = 5;

pub struct IngestPipeline {
    store: Store,
    extractor: Arc<dyn Extractor>,
    sources: HashMap<Source, Arc<dyn ItemSource>>,
    refresher: Option<Arc<dyn TokenRefresher>>,
    embedder: Option<Arc<dyn Embedder>>,
    vectors: Option<Arc<dyn VectorStore>>,
    limiter: Arc<RateLimiter>,
    clock: Arc<dyn Clock>,
    config: CoreConfig,
    guard: PipelineGuard,
    metrics: Arc<IngestMetrics>,
}

impl IngestPipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Store,
        extractor: Arc<dyn Extractor>,
        sources: HashMap<Source, Arc<dyn ItemSource>>,
        refresher: Option<Arc<dyn TokenRefresher>>,
        embedder: Option<Arc<dyn Embedder>>,
        vectors: Option<Arc<dyn VectorStore>>,
        limiter: Arc<RateLimiter>,
        clock: Arc<dyn Clock>,
        config: CoreConfig,
        metrics: Arc<IngestMetrics>,
    ) -> Self {
        Self {
            store,
            extractor,
            sources,
            refresher,
            embedder,
            vectors,
            limiter,
            clock,
            config,
            guard: PipelineGuard::new(),
            metrics,
        }
    }

    pub fn metrics(&self) -> Arc<IngestMetrics> {
        self.metrics.clone()
    }

    /// Run the full pipeline for one (user, source). Rejects with `Busy`
    /// when a run for the same pair is in flight; different sources for the
    /// same user run in parallel.
    pub async fn run(
        &self,
        user: &str,
        source: Source,
        cancel: &CancellationToken,
    ) -> CoreResult<RunReport> {
        let _slot = self.guard.try_acquire(user, source).ok_or_else(|| {
            CoreError::busy(format!(
                "ingest already running for user {} source {}",
                user,
                source.as_str()
            ))
        })?;

        let result = tokio::time::timeout(RUN_TIMEOUT, self.run_stages(user, source, cancel))
            .await
            .unwrap_or_else(|_| Err(CoreError::transient("ingest run timed out")));

        match &result {
            Ok(report) => {
                self.metrics.record_run(report);
                info!(
                    user,
                    source = source.as_str(),
                    fetched = report.fetched,
                    persisted_new = report.persisted_new,
                    persisted_updated = report.persisted_updated,
                    skipped_spam = report.skipped_spam,
                    errors = report.errors.len(),
                    "ingest run complete"
                );
            }
            Err(err) => {
                self.metrics.record_failure();
                warn!(user, source = source.as_str(), "ingest run failed: {}", err);
            }
        }

        result
    }

    async fn run_stages(
        &self,
        user: &str,
        source: Source,
        cancel: &CancellationToken,
    ) -> CoreResult<RunReport> {
        let mut report = RunReport::default();

        // Auth
        let credential = tokio::time::timeout(STAGE_TIMEOUT, self.auth_stage(user, source, cancel))
            .await
            .unwrap_or_else(|_| Err(CoreError::transient("auth stage timed out")))?;

        if cancel.is_cancelled() {
            return Err(CoreError::transient("cancelled after auth stage"));
        }

        // Fetch
        let items = tokio::time::timeout(
            STAGE_TIMEOUT,
            self.fetch_stage(user, source, &credential, cancel),
        )
        .await
        .unwrap_or_else(|_| Err(CoreError::transient("fetch stage timed out")))?;
        report.fetched = items.len();

        if cancel.is_cancelled() {
            return Err(CoreError::transient("cancelled after fetch stage"));
        }

        // Extract + Persist per item; failures are isolated.
        let now = self.clock.now();
        let mut encode_queue: Vec<(String, String)> = Vec::new();
        for item in &items {
            if cancel.is_cancelled() {
                return Err(CoreError::transient("cancelled during persist stage"));
            }
            match self
                .extractor
                .extract(user, source, item, now, cancel)
                .await
            {
                NormalizedItem::Task(task) => {
                    if task.is_spam {
                        report.skipped_spam += 1;
                    } else {
                        report.extracted += 1;
                    }
                    let text = embedding_text(&task.title, task.description.as_deref());
                    match self.store.upsert_ingested(user, source, &task, now).await {
                        Ok((id, UpsertOutcome::Created)) => {
                            report.persisted_new += 1;
                            encode_queue.push((id, text));
                        }
                        Ok((id, UpsertOutcome::Updated)) => {
                            report.persisted_updated += 1;
                            encode_queue.push((id, text));
                        }
                        Ok((_, UpsertOutcome::Unchanged)) => {}
                        Err(err) => {
                            report.record_error(format!(
                                "persist '{}' failed: {}",
                                task.title, err
                            ));
                        }
                    }
                }
                NormalizedItem::Reminder(draft) => {
                    report.extracted += 1;
                    let reminder = Reminder {
                        id: uuid::Uuid::new_v4().to_string(),
                        user: user.to_string(),
                        source,
                        title: draft.title,
                        description: draft.description,
                        start: draft.start,
                        end: draft.end,
                        is_all_day: draft.is_all_day,
                        external_id: draft.external_id,
                        raw_payload: draft.raw_payload,
                        created_at: now,
                    };
                    match self.store.upsert_reminder(&reminder).await {
                        Ok(true) => report.persisted_new += 1,
                        Ok(false) => report.persisted_updated += 1,
                        Err(err) => {
                            report.record_error(format!(
                                "persist reminder '{}' failed: {}",
                                reminder.title, err
                            ));
                        }
                    }
                }
                NormalizedItem::Skip(reason) => {
                    report.skipped_other += 1;
                    if reason.starts_with("extraction_failed") {
                        report.record_error(reason);
                    }
                }
            }
        }

        if cancel.is_cancelled() {
            // Persisted items stay committed; encoding is skipped.
            return Ok(report);
        }

        // Encode: best-effort, never fails the run.
        self.encode_stage(user, &encode_queue, &mut report, cancel)
            .await;

        Ok(report)
    }

    /// Load the credential, refreshing it when close to expiry. A failed
    /// refresh marks the credential revoked so every later run fails fast
    /// until the user reconnects.
    async fn auth_stage(
        &self,
        user: &str,
        source: Source,
        cancel: &CancellationToken,
    ) -> CoreResult<ProviderCredential> {
        let credential = self
            .store
            .get_credential(user, source)
            .await
            .map_err(CoreError::from)?
            .ok_or_else(|| {
                CoreError::auth_required(format!(
                    "no {} credential; connect the provider first",
                    source.as_str()
                ))
            })?;

        if credential.state == CredentialState::Revoked {
            return Err(CoreError::auth_required(format!(
                "{} credential revoked; reconnect required",
                source.as_str()
            )));
        }

        let now = self.clock.now();
        if !credential.needs_refresh(now, chrono::Duration::minutes(CREDENTIAL_SKEW_MINS)) {
            return Ok(credential);
        }

        let Some(refresher) = &self.refresher else {
            return Err(CoreError::auth_required(format!(
                "{} credential expired and no refresher is configured",
                source.as_str()
            )));
        };

        match refresher.refresh(&credential, cancel).await {
            Ok(refreshed) => {
                self.store
                    .upsert_credential(&refreshed)
                    .await
                    .map_err(CoreError::from)?;
                Ok(refreshed)
            }
            Err(err) => {
                self.store
                    .mark_credential_revoked(user, source, now)
                    .await
                    .map_err(CoreError::from)?;
                Err(CoreError::auth_required(format!(
                    "{} token refresh failed ({}); reconnect required",
                    source.as_str(),
                    err
                )))
            }
        }
    }

    /// Drain all pages within the configured window, honoring the per-
    /// (user, provider) rate limit. Transient page failures retry; auth
    /// failures are terminal.
    async fn fetch_stage(
        &self,
        user: &str,
        source: Source,
        credential: &ProviderCredential,
        cancel: &CancellationToken,
    ) -> CoreResult<Vec<ProviderItem>> {
        let client = self.sources.get(&source).ok_or_else(|| {
            CoreError::invalid_request(format!("no provider client for {}", source.as_str()))
        })?;

        let window = self.fetch_window(source);
        let retry = RetryPolicy::default();
        let mut items = Vec::new();
        let mut cursor: Option<String> = None;

        loop {
            self.limiter
                .acquire(user, source, self.clock.as_ref(), cancel)
                .await
                .map_err(|e| CoreError::transient(e.to_string()))?;

            let page = with_retries(retry, cancel, "provider_list", || {
                client.list(credential, window, cursor.clone(), cancel)
            })
            .await
            .map_err(|err| {
                if err.kind == ProviderErrorKind::Auth {
                    CoreError::auth_required(err.to_string())
                } else {
                    err.into_core()
                }
            })?;

            items.extend(page.items);
            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }

        Ok(items)
    }

    fn fetch_window(&self, source: Source) -> FetchWindow {
        let now = self.clock.now();
        match source {
            Source::Calendar => {
                let (back, forward) = self.config.ingest_window_calendar;
                FetchWindow::between(
                    now - chrono::Duration::days(back),
                    now + chrono::Duration::days(forward),
                )
            }
            Source::Mail => FetchWindow::since(
                now - chrono::Duration::days(self.config.ingest_window_mail),
            ),
            // All open items.
            Source::TaskManager | Source::Manual => FetchWindow::default(),
        }
    }

    async fn encode_stage(
        &self,
        user: &str,
        queue: &[(String, String)],
        report: &mut RunReport,
        cancel: &CancellationToken,
    ) {
        let (Some(embedder), Some(vectors)) = (&self.embedder, &self.vectors) else {
            return;
        };

        for (task_id, text) in queue {
            if cancel.is_cancelled() {
                return;
            }
            let embedding = match embedder.embed(text, cancel).await {
                Ok(embedding) => embedding,
                Err(err) => {
                    report.record_error(format!("encode {} failed: {}", task_id, err));
                    continue;
                }
            };
            let metadata = serde_json::json!({"user": user, "task_id": task_id});
            match vectors.upsert(task_id, embedding, metadata).await {
                Ok(()) => report.encoded += 1,
                Err(err) => {
                    report.record_error(format!("vector upsert {} failed: {}", task_id, err));
                }
            }
        }
    }
}

fn embedding_text(title: &str, description: Option<&str>) -> String {
    match description {
        Some(description) if !description.is_empty() => {
            format!("{}\n{}", title, description)
        }
        _ => title.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::extract::ItemExtractor;
    use crate::providers::error::ProviderError;
    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct FakeSource {
        source: Source,
        pages: Mutex<Vec<crate::traits::ProviderPage>>,
        fail_with: Option<u16>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ItemSource for FakeSource {
        fn source(&self) -> Source {
            self.source
        }

        async fn list(
            &self,
            _credential: &ProviderCredential,
            _window: FetchWindow,
            _cursor: Option<String>,
            _cancel: &CancellationToken,
        ) -> Result<crate::traits::ProviderPage, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(status) = self.fail_with {
                return Err(ProviderError::from_status(status, "fake failure"));
            }
            let mut pages = self.pages.lock().unwrap();
            if pages.is_empty() {
                Ok(crate::traits::ProviderPage::default())
            } else {
                Ok(pages.remove(0))
            }
        }
    }

    fn calendar_events() -> Vec<ProviderItem> {
        let e1 = json!({
            "id": "E1",
            "summary": "Project sync",
            "start": {"dateTime": "2025-11-08T10:00:00Z"},
            "end": {"dateTime": "2025-11-08T10:30:00Z"},
            "attendees": [{"email": "a@x.test"}],
        });
        let e2 = json!({
            "id": "E2",
            "summary": "Weekly review",
            "recurrence": ["RRULE:FREQ=WEEKLY"],
            "start": {"dateTime": "2025-11-08T11:00:00Z"},
            "end": {"dateTime": "2025-11-08T11:30:00Z"},
        });
        let e3 = json!({
            "id": "E3",
            "summary": "Cancelled thing",
            "status": "cancelled",
            "start": {"dateTime": "2025-11-08T12:00:00Z"},
            "end": {"dateTime": "2025-11-08T13:00:00Z"},
        });
        [e1, e2, e3]
            .into_iter()
            .map(|payload| ProviderItem {
                external_id: payload["id"].as_str().map(|s| s.to_string()),
                external_updated_at: None,
                payload,
            })
            .collect()
    }

    async fn pipeline_with(
        store: Store,
        source_client: Arc<FakeSource>,
    ) -> (IngestPipeline, ManualClock) {
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2025, 11, 8, 9, 0, 0).unwrap());
        let extractor = Arc::new(ItemExtractor::new(None, 0.7, RetryPolicy::default()));
        let mut sources: HashMap<Source, Arc<dyn ItemSource>> = HashMap::new();
        sources.insert(source_client.source, source_client);
        let pipeline = IngestPipeline::new(
            store,
            extractor,
            sources,
            None,
            None,
            None,
            Arc::new(RateLimiter::new(HashMap::new())),
            Arc::new(clock.clone()),
            CoreConfig::default(),
            Arc::new(IngestMetrics::new()),
        );
        (pipeline, clock)
    }

    async fn seed_credential(store: &Store, source: Source) {
        store
            .upsert_credential(&ProviderCredential {
                user: "u1".to_string(),
                source,
                access_token: "tok".to_string(),
                refresh_token: None,
                expires_at: None,
                scopes: vec![],
                state: CredentialState::Active,
                updated_at: Utc.with_ymd_and_hms(2025, 11, 8, 8, 0, 0).unwrap(),
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn calendar_first_run_report() {
        let store = Store::new_in_memory().await.unwrap();
        seed_credential(&store, Source::Calendar).await;
        let source = Arc::new(FakeSource {
            source: Source::Calendar,
            pages: Mutex::new(vec![crate::traits::ProviderPage {
                items: calendar_events(),
                next_cursor: None,
            }]),
            fail_with: None,
            calls: AtomicUsize::new(0),
        });
        let (pipeline, _clock) = pipeline_with(store.clone(), source).await;

        let report = pipeline
            .run("u1", Source::Calendar, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.fetched, 3);
        assert_eq!(report.extracted, 2);
        assert_eq!(report.skipped_other, 1);
        assert_eq!(report.persisted_new, 2);
        assert_eq!(report.persisted_updated, 0);

        let tasks = store.list_all_tasks("u1").await.unwrap();
        assert_eq!(tasks.len(), 2);
        assert!(tasks
            .iter()
            .all(|t| t.sync_status == crate::types::SyncStatus::Synced));
        assert!(tasks.iter().all(|t| t.source == Source::Calendar));
    }

    #[tokio::test]
    async fn rerun_is_idempotent() {
        let store = Store::new_in_memory().await.unwrap();
        seed_credential(&store, Source::Calendar).await;

        for run in 0..2 {
            let source = Arc::new(FakeSource {
                source: Source::Calendar,
                pages: Mutex::new(vec![crate::traits::ProviderPage {
                    items: calendar_events(),
                    next_cursor: None,
                }]),
                fail_with: None,
                calls: AtomicUsize::new(0),
            });
            let (pipeline, clock) = pipeline_with(store.clone(), source).await;
            if run == 1 {
                clock.advance(chrono::Duration::hours(1));
            }
            let report = pipeline
                .run("u1", Source::Calendar, &CancellationToken::new())
                .await
                .unwrap();
            if run == 1 {
                assert_eq!(report.persisted_new, 0);
                assert_eq!(report.persisted_updated, 0);
            }
        }

        let tasks = store.list_all_tasks("u1").await.unwrap();
        assert_eq!(tasks.len(), 2);
        // Content unchanged: updated_at still reflects the first run.
        assert!(tasks
            .iter()
            .all(|t| t.updated_at == Utc.with_ymd_and_hms(2025, 11, 8, 9, 0, 0).unwrap()));
    }

    #[tokio::test]
    async fn missing_credential_fails_fast() {
        let store = Store::new_in_memory().await.unwrap();
        let source = Arc::new(FakeSource {
            source: Source::Calendar,
            pages: Mutex::new(vec![]),
            fail_with: None,
            calls: AtomicUsize::new(0),
        });
        let (pipeline, _clock) = pipeline_with(store, source.clone()).await;

        let err = pipeline
            .run("u1", Source::Calendar, &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::AuthRequired);
        assert_eq!(source.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn revoked_credential_fails_fast() {
        let store = Store::new_in_memory().await.unwrap();
        store
            .upsert_credential(&ProviderCredential {
                user: "u1".to_string(),
                source: Source::Calendar,
                access_token: "tok".to_string(),
                refresh_token: None,
                expires_at: None,
                scopes: vec![],
                state: CredentialState::Revoked,
                updated_at: Utc.with_ymd_and_hms(2025, 11, 8, 8, 0, 0).unwrap(),
            })
            .await
            .unwrap();
        let source = Arc::new(FakeSource {
            source: Source::Calendar,
            pages: Mutex::new(vec![]),
            fail_with: None,
            calls: AtomicUsize::new(0),
        });
        let (pipeline, _clock) = pipeline_with(store, source).await;

        let err = pipeline
            .run("u1", Source::Calendar, &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::AuthRequired);
        assert!(err.message.contains("reconnect"));
    }

    #[tokio::test]
    async fn fetch_auth_error_is_terminal() {
        let store = Store::new_in_memory().await.unwrap();
        seed_credential(&store, Source::Calendar).await;
        let source = Arc::new(FakeSource {
            source: Source::Calendar,
            pages: Mutex::new(vec![]),
            fail_with: Some(401),
            calls: AtomicUsize::new(0),
        });
        let (pipeline, _clock) = pipeline_with(store, source.clone()).await;

        let err = pipeline
            .run("u1", Source::Calendar, &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::AuthRequired);
        // No retries for auth failures.
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn pagination_drains_all_pages() {
        let store = Store::new_in_memory().await.unwrap();
        seed_credential(&store, Source::Calendar).await;
        let mut events = calendar_events();
        let second_page = vec![events.pop().unwrap()];
        let source = Arc::new(FakeSource {
            source: Source::Calendar,
            pages: Mutex::new(vec![
                crate::traits::ProviderPage {
                    items: events,
                    next_cursor: Some("page-2".to_string()),
                },
                crate::traits::ProviderPage {
                    items: second_page,
                    next_cursor: None,
                },
            ]),
            fail_with: None,
            calls: AtomicUsize::new(0),
        });
        let (pipeline, _clock) = pipeline_with(store, source.clone()).await;

        let report = pipeline
            .run("u1", Source::Calendar, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.fetched, 3);
        assert_eq!(source.calls.load(Ordering::SeqCst), 2);
    }

    struct FakeEmbedder {
        fail: bool,
    }

    #[async_trait]
    impl Embedder for FakeEmbedder {
        async fn embed(
            &self,
            _text: &str,
            _cancel: &CancellationToken,
        ) -> Result<Vec<f32>, ProviderError> {
            if self.fail {
                Err(ProviderError::from_status(500, "embedder down"))
            } else {
                Ok(vec![0.1, 0.2, 0.3])
            }
        }
    }

    #[derive(Default)]
    struct FakeVectors {
        upserts: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl VectorStore for FakeVectors {
        async fn upsert(
            &self,
            task_id: &str,
            _embedding: Vec<f32>,
            _metadata: serde_json::Value,
        ) -> anyhow::Result<()> {
            self.upserts.lock().unwrap().push(task_id.to_string());
            Ok(())
        }
    }

    async fn pipeline_with_encoding(
        store: Store,
        source_client: Arc<FakeSource>,
        embedder_fails: bool,
    ) -> (IngestPipeline, Arc<FakeVectors>) {
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2025, 11, 8, 9, 0, 0).unwrap());
        let extractor = Arc::new(ItemExtractor::new(None, 0.7, RetryPolicy::default()));
        let mut sources: HashMap<Source, Arc<dyn ItemSource>> = HashMap::new();
        sources.insert(source_client.source, source_client);
        let vectors = Arc::new(FakeVectors::default());
        let pipeline = IngestPipeline::new(
            store,
            extractor,
            sources,
            None,
            Some(Arc::new(FakeEmbedder {
                fail: embedder_fails,
            })),
            Some(vectors.clone()),
            Arc::new(RateLimiter::new(HashMap::new())),
            Arc::new(clock),
            CoreConfig::default(),
            Arc::new(IngestMetrics::new()),
        );
        (pipeline, vectors)
    }

    #[tokio::test]
    async fn encode_stage_upserts_new_tasks() {
        let store = Store::new_in_memory().await.unwrap();
        seed_credential(&store, Source::Calendar).await;
        let source = Arc::new(FakeSource {
            source: Source::Calendar,
            pages: Mutex::new(vec![crate::traits::ProviderPage {
                items: calendar_events(),
                next_cursor: None,
            }]),
            fail_with: None,
            calls: AtomicUsize::new(0),
        });
        let (pipeline, vectors) = pipeline_with_encoding(store, source, false).await;

        let report = pipeline
            .run("u1", Source::Calendar, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.encoded, 2);
        assert_eq!(vectors.upserts.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn encoding_failure_degrades_but_does_not_fail_run() {
        let store = Store::new_in_memory().await.unwrap();
        seed_credential(&store, Source::Calendar).await;
        let source = Arc::new(FakeSource {
            source: Source::Calendar,
            pages: Mutex::new(vec![crate::traits::ProviderPage {
                items: calendar_events(),
                next_cursor: None,
            }]),
            fail_with: None,
            calls: AtomicUsize::new(0),
        });
        let (pipeline, vectors) = pipeline_with_encoding(store.clone(), source, true).await;

        let report = pipeline
            .run("u1", Source::Calendar, &CancellationToken::new())
            .await
            .unwrap();
        // The run still persisted everything; encoding failures are noted.
        assert_eq!(report.persisted_new, 2);
        assert_eq!(report.encoded, 0);
        assert!(report.errors.iter().any(|e| e.contains("encode")));
        assert!(vectors.upserts.lock().unwrap().is_empty());
        assert_eq!(store.list_all_tasks("u1").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn concurrent_run_for_same_pair_is_busy() {
        let store = Store::new_in_memory().await.unwrap();
        seed_credential(&store, Source::Calendar).await;
        let source = Arc::new(FakeSource {
            source: Source::Calendar,
            pages: Mutex::new(vec![]),
            fail_with: None,
            calls: AtomicUsize::new(0),
        });
        let (pipeline, _clock) = pipeline_with(store, source).await;

        let _slot = pipeline.guard.try_acquire("u1", Source::Calendar).unwrap();
        let err = pipeline
            .run("u1", Source::Calendar, &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::Busy);
    }
}
