//! Domain types shared across the pipeline, planner, nudger, and sync engine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sha2::Digest;

/// Where a task originally came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Source {
    Calendar,
    Mail,
    TaskManager,
    Manual,
}

impl Source {
    pub fn as_str(&self) -> &'static str {
        match self {
            Source::Calendar => "calendar",
            Source::Mail => "mail",
            Source::TaskManager => "task_manager",
            Source::Manual => "manual",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "calendar" => Some(Source::Calendar),
            "mail" => Some(Source::Mail),
            "task_manager" => Some(Source::TaskManager),
            "manual" => Some(Source::Manual),
            _ => None,
        }
    }

    /// Sources a credential can exist for (manual tasks need none).
    pub fn requires_credential(&self) -> bool {
        !matches!(self, Source::Manual)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    Normal,
    High,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::Normal => "normal",
            Priority::High => "high",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "low" => Some(Priority::Low),
            "normal" => Some(Priority::Normal),
            "high" => Some(Priority::High),
            _ => None,
        }
    }

    /// Weight used by the deterministic plan score.
    pub fn weight(&self) -> f64 {
        match self {
            Priority::High => 1.0,
            Priority::Normal => 0.5,
            Priority::Low => 0.2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    Synced,
    Pending,
    Conflict,
    Error,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Synced => "synced",
            SyncStatus::Pending => "pending",
            SyncStatus::Conflict => "conflict",
            SyncStatus::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "synced" => Some(SyncStatus::Synced),
            "pending" => Some(SyncStatus::Pending),
            "conflict" => Some(SyncStatus::Conflict),
            "error" => Some(SyncStatus::Error),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncDirection {
    Inbound,
    Outbound,
    Bidirectional,
}

impl SyncDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncDirection::Inbound => "inbound",
            SyncDirection::Outbound => "outbound",
            SyncDirection::Bidirectional => "bidirectional",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "inbound" => Some(SyncDirection::Inbound),
            "outbound" => Some(SyncDirection::Outbound),
            "bidirectional" => Some(SyncDirection::Bidirectional),
            _ => None,
        }
    }

    pub fn pushes_outbound(&self) -> bool {
        matches!(self, SyncDirection::Outbound | SyncDirection::Bidirectional)
    }
}

/// The normalized unit of work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub user: String,
    pub source: Source,
    pub title: String,
    pub description: Option<String>,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub attendees: Vec<String>,
    pub location: Option<String>,
    /// Provider recurrence rule, passed through verbatim. Series are never
    /// expanded locally; each occurrence arrives with its own external id.
    pub recurrence: Option<String>,
    pub priority: Priority,
    pub is_critical: bool,
    pub is_urgent: bool,
    pub is_spam: bool,
    pub spam_reason: Option<String>,
    pub spam_score: Option<f64>,
    pub is_completed: bool,
    pub completed_at: Option<DateTime<Utc>>,
    pub raw_payload: JsonValue,
    pub external_id: Option<String>,
    pub sync_status: SyncStatus,
    pub sync_direction: SyncDirection,
    pub last_synced_at: Option<DateTime<Utc>>,
    pub external_updated_at: Option<DateTime<Utc>>,
    pub sync_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    /// Marks the task done, keeping `completed_at` consistent with the flag.
    pub fn set_completed(&mut self, completed: bool, at: DateTime<Utc>) {
        self.is_completed = completed;
        self.completed_at = if completed { Some(at) } else { None };
    }
}

/// Deterministic external id for items the provider did not key. Stable
/// across re-ingests so the (source, external_id) upsert stays idempotent.
pub fn synthetic_external_id(
    user: &str,
    source: Source,
    title: &str,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> String {
    let mut hasher = sha2::Sha256::new();
    hasher.update(user.as_bytes());
    hasher.update([0]);
    hasher.update(source.as_str().as_bytes());
    hasher.update([0]);
    hasher.update(title.as_bytes());
    hasher.update([0]);
    hasher.update(start.to_rfc3339().as_bytes());
    hasher.update([0]);
    hasher.update(end.to_rfc3339().as_bytes());
    let digest = hasher.finalize();
    let mut id = String::with_capacity(38);
    id.push_str("local-");
    for byte in digest.iter().take(16) {
        id.push_str(&format!("{:02x}", byte));
    }
    id
}

/// Reminder-class items: time-anchored but kept off the plan until promoted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reminder {
    pub id: String,
    pub user: String,
    pub source: Source,
    pub title: String,
    pub description: Option<String>,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub is_all_day: bool,
    pub external_id: Option<String>,
    pub raw_payload: JsonValue,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanStatus {
    Active,
    Completed,
    Cancelled,
}

impl PlanStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlanStatus::Active => "active",
            PlanStatus::Completed => "completed",
            PlanStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(PlanStatus::Active),
            "completed" => Some(PlanStatus::Completed),
            "cancelled" => Some(PlanStatus::Cancelled),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryStatus {
    Pending,
    Done,
    Snoozed,
}

impl EntryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryStatus::Pending => "pending",
            EntryStatus::Done => "done",
            EntryStatus::Snoozed => "snoozed",
        }
    }
}

/// One scheduled task inside a daily plan. Persisted as JSON inside the
/// plan row, so field names are part of the stored format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanEntry {
    pub task_id: String,
    pub title: String,
    pub predicted_start: DateTime<Utc>,
    pub predicted_end: DateTime<Utc>,
    pub priority_score: f64,
    pub is_critical: bool,
    pub is_urgent: bool,
    /// Short LLM-produced steps; empty when the deterministic fallback
    /// composed the plan.
    #[serde(default)]
    pub action_plan: Vec<String>,
    #[serde(default = "default_entry_status")]
    pub status: EntryStatus,
}

fn default_entry_status() -> EntryStatus {
    EntryStatus::Pending
}

/// The ordered schedule for one user on one date.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DailyPlan {
    pub id: String,
    pub user: String,
    /// Calendar date in the user's configured zone, `YYYY-MM-DD`.
    pub date: chrono::NaiveDate,
    pub status: PlanStatus,
    pub energy_level: Option<u8>,
    pub entries: Vec<PlanEntry>,
    pub generated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedbackAction {
    Done,
    Snoozed,
}

impl FeedbackAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            FeedbackAction::Done => "done",
            FeedbackAction::Snoozed => "snoozed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "done" => Some(FeedbackAction::Done),
            "snoozed" => Some(FeedbackAction::Snoozed),
            _ => None,
        }
    }
}

/// Append-only record of what the user did with a planned task.
#[derive(Debug, Clone)]
pub struct TaskFeedback {
    pub id: String,
    pub user: String,
    pub task_id: String,
    pub plan_id: Option<String>,
    pub action: FeedbackAction,
    pub snooze_duration_minutes: Option<i64>,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationStatus {
    Pending,
    Sent,
    Dismissed,
}

impl NotificationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationStatus::Pending => "pending",
            NotificationStatus::Sent => "sent",
            NotificationStatus::Dismissed => "dismissed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(NotificationStatus::Pending),
            "sent" => Some(NotificationStatus::Sent),
            "dismissed" => Some(NotificationStatus::Dismissed),
            _ => None,
        }
    }
}

/// A nudge delivered (or about to be delivered) to the user. At most one
/// non-dismissed row may exist per (user, task, plan).
#[derive(Debug, Clone)]
pub struct Notification {
    pub id: String,
    pub user: String,
    pub task_id: String,
    pub plan_id: Option<String>,
    pub kind: String,
    pub message: String,
    pub scheduled_at: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
    pub status: NotificationStatus,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DependencyKind {
    Blocks,
    DependsOn,
    RelatedTo,
}

impl DependencyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DependencyKind::Blocks => "blocks",
            DependencyKind::DependsOn => "depends_on",
            DependencyKind::RelatedTo => "related_to",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "blocks" => Some(DependencyKind::Blocks),
            "depends_on" => Some(DependencyKind::DependsOn),
            "related_to" => Some(DependencyKind::RelatedTo),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TaskDependency {
    pub task_id: String,
    pub blocked_by_task_id: String,
    pub kind: DependencyKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialState {
    Active,
    Revoked,
}

impl CredentialState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CredentialState::Active => "active",
            CredentialState::Revoked => "revoked",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(CredentialState::Active),
            "revoked" => Some(CredentialState::Revoked),
            _ => None,
        }
    }
}

/// OAuth-style credential for one (user, provider). At most one active
/// credential exists per pair.
#[derive(Debug, Clone)]
pub struct ProviderCredential {
    pub user: String,
    pub source: Source,
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub scopes: Vec<String>,
    pub state: CredentialState,
    pub updated_at: DateTime<Utc>,
}

impl ProviderCredential {
    /// Whether the access token needs refreshing before use.
    pub fn needs_refresh(&self, now: DateTime<Utc>, skew: chrono::Duration) -> bool {
        match self.expires_at {
            Some(expiry) => expiry <= now + skew,
            None => false,
        }
    }
}

/// Per-user preferences used by planning and delivery.
#[derive(Debug, Clone)]
pub struct UserSettings {
    pub user: String,
    /// IANA zone name for the user's "today" boundary.
    pub timezone: String,
    pub email: Option<String>,
    /// Overrides the global email_enabled gate when set.
    pub email_enabled: Option<bool>,
}

impl UserSettings {
    pub fn defaults_for(user: &str) -> Self {
        Self {
            user: user.to_string(),
            timezone: "UTC".to_string(),
            email: None,
            email_enabled: None,
        }
    }

    pub fn tz(&self) -> chrono_tz::Tz {
        self.timezone.parse().unwrap_or(chrono_tz::UTC)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn enum_codecs_roundtrip() {
        for source in [Source::Calendar, Source::Mail, Source::TaskManager, Source::Manual] {
            assert_eq!(Source::parse(source.as_str()), Some(source));
        }
        for status in [
            SyncStatus::Synced,
            SyncStatus::Pending,
            SyncStatus::Conflict,
            SyncStatus::Error,
        ] {
            assert_eq!(SyncStatus::parse(status.as_str()), Some(status));
        }
        for p in [Priority::Low, Priority::Normal, Priority::High] {
            assert_eq!(Priority::parse(p.as_str()), Some(p));
        }
        assert_eq!(Source::parse("carrier_pigeon"), None);
    }

    #[test]
    fn priority_weights() {
        assert_eq!(Priority::High.weight(), 1.0);
        assert_eq!(Priority::Normal.weight(), 0.5);
        assert_eq!(Priority::Low.weight(), 0.2);
    }

    #[test]
    fn completed_at_tracks_flag() {
        let now = Utc::now();
        let mut task = test_task("t1");
        task.set_completed(true, now);
        assert!(task.is_completed);
        assert_eq!(task.completed_at, Some(now));
        task.set_completed(false, now);
        assert!(!task.is_completed);
        assert!(task.completed_at.is_none());
    }

    #[test]
    fn synthetic_id_is_deterministic() {
        let start = Utc.with_ymd_and_hms(2025, 11, 8, 10, 0, 0).unwrap();
        let end = start + chrono::Duration::minutes(30);
        let a = synthetic_external_id("u1", Source::Mail, "Reply to Dana", start, end);
        let b = synthetic_external_id("u1", Source::Mail, "Reply to Dana", start, end);
        assert_eq!(a, b);
        assert!(a.starts_with("local-"));

        let c = synthetic_external_id("u2", Source::Mail, "Reply to Dana", start, end);
        assert_ne!(a, c);
    }

    #[test]
    fn credential_refresh_window() {
        let now = Utc::now();
        let skew = chrono::Duration::minutes(5);
        let mut cred = ProviderCredential {
            user: "u1".into(),
            source: Source::Calendar,
            access_token: "tok".into(),
            refresh_token: Some("ref".into()),
            expires_at: Some(now + chrono::Duration::minutes(2)),
            scopes: vec![],
            state: CredentialState::Active,
            updated_at: now,
        };
        assert!(cred.needs_refresh(now, skew));
        cred.expires_at = Some(now + chrono::Duration::hours(1));
        assert!(!cred.needs_refresh(now, skew));
        cred.expires_at = None;
        assert!(!cred.needs_refresh(now, skew));
    }

    #[test]
    fn plan_entry_json_defaults() {
        // Rows written before action_plan/status existed still deserialize.
        let legacy = r#"{
            "task_id": "t1",
            "title": "Standup",
            "predicted_start": "2025-11-08T10:00:00Z",
            "predicted_end": "2025-11-08T10:15:00Z",
            "priority_score": 0.8,
            "is_critical": false,
            "is_urgent": false
        }"#;
        let entry: PlanEntry = serde_json::from_str(legacy).unwrap();
        assert!(entry.action_plan.is_empty());
        assert_eq!(entry.status, EntryStatus::Pending);
    }

    fn test_task(id: &str) -> Task {
        let now = Utc::now();
        Task {
            id: id.to_string(),
            user: "u1".to_string(),
            source: Source::Calendar,
            title: "Test task".to_string(),
            description: None,
            start: now,
            end: now + chrono::Duration::minutes(30),
            attendees: vec![],
            location: None,
            recurrence: None,
            priority: Priority::Normal,
            is_critical: false,
            is_urgent: false,
            is_spam: false,
            spam_reason: None,
            spam_score: None,
            is_completed: false,
            completed_at: None,
            raw_payload: serde_json::json!({}),
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
}
