//! Daily plan generation: candidate filtering, deterministic scoring,
//! learned adjustments, LLM composition, and persistence.

pub mod compose;
pub mod learning;
pub mod scoring;

pub use compose::Candidate;

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, NaiveDate, TimeZone, Timelike, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::clock::Clock;
use crate::config::CoreConfig;
use crate::error::{CoreError, CoreResult};
use crate::retry::RetryPolicy;
use crate::store::Store;
use crate::traits::Chatter;
use crate::types::{DailyPlan, FeedbackAction, PlanStatus, Task};

const FEEDBACK_WINDOW_DAYS: i64 = 14;
const SNOOZE_DAMPING: f64 = 0.9;
const SNOOZE_DAMPING_THRESHOLD: i64 = 2;

pub struct Planner {
    store: Store,
    chatter: Option<Arc<dyn Chatter>>,
    clock: Arc<dyn Clock>,
    config: CoreConfig,
    in_flight: Arc<Mutex<HashSet<(String, NaiveDate)>>>,
}

impl Planner {
    pub fn new(
        store: Store,
        chatter: Option<Arc<dyn Chatter>>,
        clock: Arc<dyn Clock>,
        config: CoreConfig,
    ) -> Self {
        Self {
            store,
            chatter,
            clock,
            config,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Generate (or regenerate) the plan for (user, date), replacing any
    /// prior plan for that date. Previously dismissed notifications stay
    /// dismissed — regeneration never resurrects them.
    pub async fn generate(
        &self,
        user: &str,
        date: NaiveDate,
        cancel: &CancellationToken,
    ) -> CoreResult<DailyPlan> {
        let _slot = InFlightSlot::acquire(&self.in_flight, user, date).ok_or_else(|| {
            CoreError::busy(format!("plan generation already running for {} {}", user, date))
        })?;

        let now = self.clock.now();
        let settings = self.store.get_user_settings(user).await?;
        let tz = settings.tz();

        let candidates = self.collect_candidates(user, date, tz, now).await?;
        let energy = self.store.get_energy(user, date).await?.unwrap_or(3);

        if cancel.is_cancelled() {
            return Err(CoreError::transient("cancelled before composition"));
        }

        let entries = if candidates.is_empty() {
            vec![]
        } else {
            let composed = match &self.chatter {
                Some(chatter) => {
                    compose::compose_with_llm(
                        chatter.as_ref(),
                        RetryPolicy::with_budget(self.config.llm_retry_budget),
                        &candidates,
                        energy,
                        date,
                        cancel,
                    )
                    .await
                }
                None => None,
            };
            match composed {
                Some(entries) => entries,
                None => {
                    warn!(user, %date, "composing plan deterministically without LLM");
                    compose::deterministic_entries(&candidates)
                }
            }
        };

        let entries = compose::drop_promotional(entries, compose::default_promo_patterns());

        let plan = DailyPlan {
            id: uuid::Uuid::new_v4().to_string(),
            user: user.to_string(),
            date,
            status: PlanStatus::Active,
            energy_level: Some(energy),
            entries,
            generated_at: now,
        };

        self.store.replace_plan(&plan).await?;
        info!(
            user,
            %date,
            entries = plan.entries.len(),
            energy,
            "daily plan generated"
        );
        Ok(plan)
    }

    /// Candidate filtering and scoring. Returns candidates ordered by
    /// effective score (damped), tie-broken by start then id.
    async fn collect_candidates(
        &self,
        user: &str,
        date: NaiveDate,
        tz: chrono_tz::Tz,
        now: DateTime<Utc>,
    ) -> CoreResult<Vec<Candidate>> {
        let (day_start, day_end) = local_day_bounds(date, tz)
            .ok_or_else(|| CoreError::invalid_request(format!("unrepresentable date {}", date)))?;

        let tasks = self.store.list_tasks_between(user, day_start, day_end).await?;
        let energy = self.store.get_energy(user, date).await?.unwrap_or(3);

        let feedback = self
            .store
            .list_feedback_since(user, now - chrono::Duration::days(FEEDBACK_WINDOW_DAYS))
            .await?;
        let snooze_counts = self
            .store
            .snooze_counts_by_task(user, now - chrono::Duration::days(FEEDBACK_WINDOW_DAYS))
            .await?;

        // Hour-bucket samples need each feedback item's original start hour.
        let mut samples: Vec<(u32, FeedbackAction)> = Vec::with_capacity(feedback.len());
        for item in &feedback {
            if let Some(task) = self.store.get_task(user, &item.task_id).await? {
                samples.push((learning::local_hour(task.start, tz), item.action));
            }
        }
        let profile = learning::SnoozeProfile::from_samples(samples);

        let (earliest_hour, latest_hour) = self.config.working_window;
        let mut scored: Vec<(Task, f64, f64)> = Vec::new();

        for task in tasks {
            if task.is_spam || task.is_completed {
                continue;
            }

            let score = scoring::priority_score(&task, energy, now);
            let damped = if snooze_counts.get(&task.id).copied().unwrap_or(0)
                > SNOOZE_DAMPING_THRESHOLD
            {
                score * SNOOZE_DAMPING
            } else {
                score
            };
            scored.push((task, score, damped));
        }

        scoring::order_candidates(&mut scored);

        let mut candidates = Vec::with_capacity(scored.len());
        for (task, score, effective_score) in scored {
            let duration = task.end - task.start;
            let mut predicted_start = task.start;

            // Open blockers push the dependent to the end of the day; a
            // task that cannot fit in the day's final slot comes off the
            // plan entirely.
            let blockers = self.store.open_blockers(user, &task.id).await?;
            if !blockers.is_empty() {
                let window_open = hour_on_date(date, tz, earliest_hour);
                let window_close = hour_on_date(date, tz, latest_hour);
                match (window_open, window_close) {
                    (Some(open), Some(close)) => {
                        let pushed = close - duration.max(chrono::Duration::zero());
                        if pushed < open {
                            warn!(
                                user,
                                task = %task.id,
                                "dropping blocked task: no end-of-day slot fits it"
                            );
                            continue;
                        }
                        predicted_start = predicted_start.max(pushed);
                    }
                    _ => {}
                }
            }

            // Learned shift for chronically-snoozed hours.
            let hour = learning::local_hour(predicted_start, tz);
            predicted_start =
                learning::shift_start(predicted_start, &profile, hour, latest_hour);

            // Clamp into the working window, preserving duration.
            predicted_start = clamp_to_window(predicted_start, tz, earliest_hour, latest_hour);
            let predicted_end = predicted_start + duration;

            candidates.push(Candidate {
                task,
                score,
                effective_score,
                predicted_start,
                predicted_end,
            });
        }

        Ok(candidates)
    }
}

/// UTC bounds of one calendar day in the user's zone.
pub fn local_day_bounds(
    date: NaiveDate,
    tz: chrono_tz::Tz,
) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
    let start = tz
        .from_local_datetime(&date.and_hms_opt(0, 0, 0)?)
        .earliest()?
        .with_timezone(&Utc);
    let end = tz
        .from_local_datetime(&date.succ_opt()?.and_hms_opt(0, 0, 0)?)
        .earliest()?
        .with_timezone(&Utc);
    Some((start, end))
}

/// UTC instant of `hour:00` local on the given date.
fn hour_on_date(date: NaiveDate, tz: chrono_tz::Tz, hour: u32) -> Option<DateTime<Utc>> {
    tz.from_local_datetime(&date.and_hms_opt(hour, 0, 0)?)
        .earliest()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Move a start into [earliest, latest] local hours, keeping its date.
fn clamp_to_window(
    start: DateTime<Utc>,
    tz: chrono_tz::Tz,
    earliest_hour: u32,
    latest_hour: u32,
) -> DateTime<Utc> {
    let local = start.with_timezone(&tz);
    let hour = local.hour();
    if hour < earliest_hour {
        local
            .with_hour(earliest_hour)
            .and_then(|dt| dt.with_minute(0))
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or(start)
    } else if hour > latest_hour {
        local
            .with_hour(latest_hour)
            .and_then(|dt| dt.with_minute(0))
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or(start)
    } else {
        start
    }
}

struct InFlightSlot {
    set: Arc<Mutex<HashSet<(String, NaiveDate)>>>,
    key: (String, NaiveDate),
}

impl InFlightSlot {
    fn acquire(
        set: &Arc<Mutex<HashSet<(String, NaiveDate)>>>,
        user: &str,
        date: NaiveDate,
    ) -> Option<Self> {
        let mut guard = set.lock().unwrap_or_else(|e| e.into_inner());
        if !guard.insert((user.to_string(), date)) {
            return None;
        }
        Some(Self {
            set: set.clone(),
            key: (user.to_string(), date),
        })
    }
}

impl Drop for InFlightSlot {
    fn drop(&mut self) {
        let mut guard = self.set.lock().unwrap_or_else(|e| e.into_inner());
        guard.remove(&self.key);
    }
}
