use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::providers::error::ProviderError;
use crate::types::{Priority, ProviderCredential, Source};

/// Time range for a provider fetch. `None` bounds mean "open".
#[derive(Debug, Clone, Copy, Default)]
pub struct FetchWindow {
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
}

impl FetchWindow {
    pub fn between(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self {
            start: Some(start),
            end: Some(end),
        }
    }

    pub fn since(start: DateTime<Utc>) -> Self {
        Self {
            start: Some(start),
            end: None,
        }
    }
}

/// One raw item as the provider emitted it. The payload keeps the provider's
/// shape; extraction reads structured fields out of it.
#[derive(Debug, Clone)]
pub struct ProviderItem {
    pub external_id: Option<String>,
    pub external_updated_at: Option<DateTime<Utc>>,
    pub payload: Value,
}

/// One page of provider results.
#[derive(Debug, Clone, Default)]
pub struct ProviderPage {
    pub items: Vec<ProviderItem>,
    pub next_cursor: Option<String>,
}

/// Paginated read access to one provider (calendar, mail, task manager).
#[async_trait]
pub trait ItemSource: Send + Sync {
    fn source(&self) -> Source;

    async fn list(
        &self,
        credential: &ProviderCredential,
        window: FetchWindow,
        cursor: Option<String>,
        cancel: &CancellationToken,
    ) -> Result<ProviderPage, ProviderError>;
}

/// Refreshes an expiring credential against the provider's token endpoint.
#[async_trait]
pub trait TokenRefresher: Send + Sync {
    async fn refresh(
        &self,
        credential: &ProviderCredential,
        cancel: &CancellationToken,
    ) -> Result<ProviderCredential, ProviderError>;
}

/// A task as the external task manager sees it.
#[derive(Debug, Clone)]
pub struct RemoteTask {
    pub external_id: String,
    pub title: String,
    pub description: Option<String>,
    pub due: Option<DateTime<Utc>>,
    pub priority: Priority,
    pub is_completed: bool,
    pub external_updated_at: DateTime<Utc>,
    pub payload: Value,
}

/// Outbound shape for creating or updating a remote task.
#[derive(Debug, Clone)]
pub struct RemoteTaskDraft {
    pub title: String,
    pub description: Option<String>,
    pub due: Option<DateTime<Utc>>,
    pub priority: Priority,
    pub is_completed: bool,
}

/// One remote mutation observed since the last sync.
#[derive(Debug, Clone)]
pub struct RemoteChange {
    pub task: RemoteTask,
    pub deleted: bool,
}

#[derive(Debug, Clone, Default)]
pub struct RemoteChangePage {
    pub changes: Vec<RemoteChange>,
    pub next_cursor: Option<String>,
}

/// Full CRUD access to the external task manager, used by the sync engine.
#[async_trait]
pub trait TaskManagerClient: Send + Sync {
    async fn list_changes(
        &self,
        credential: &ProviderCredential,
        since: Option<DateTime<Utc>>,
        cursor: Option<String>,
        cancel: &CancellationToken,
    ) -> Result<RemoteChangePage, ProviderError>;

    async fn create(
        &self,
        credential: &ProviderCredential,
        draft: &RemoteTaskDraft,
        cancel: &CancellationToken,
    ) -> Result<RemoteTask, ProviderError>;

    async fn update(
        &self,
        credential: &ProviderCredential,
        external_id: &str,
        draft: &RemoteTaskDraft,
        cancel: &CancellationToken,
    ) -> Result<RemoteTask, ProviderError>;

    async fn complete(
        &self,
        credential: &ProviderCredential,
        external_id: &str,
        cancel: &CancellationToken,
    ) -> Result<(), ProviderError>;

    async fn delete(
        &self,
        credential: &ProviderCredential,
        external_id: &str,
        cancel: &CancellationToken,
    ) -> Result<(), ProviderError>;
}
