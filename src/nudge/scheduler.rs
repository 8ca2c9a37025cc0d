//! Process-wide recurrent scheduler: a single loop driving the nudge tick
//! and the daily plan-generation pass. Ticks are serialized by construction
//! (the loop awaits each tick before sleeping again) and additionally
//! bounded so one tick can never bleed into the next.

use std::sync::Arc;

use chrono::{NaiveDate, Timelike};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::clock::Clock;
use crate::config::CoreConfig;
use crate::plan::Planner;
use crate::store::Store;

use super::Nudger;

/// Local hour at which the daily plan pass runs for each user.
const PLAN_GENERATION_HOUR: u32 = 6;

pub struct Scheduler {
    nudger: Arc<Nudger>,
    planner: Arc<Planner>,
    store: Store,
    clock: Arc<dyn Clock>,
    config: CoreConfig,
    cancel: CancellationToken,
}

impl Scheduler {
    pub fn new(
        nudger: Arc<Nudger>,
        planner: Arc<Planner>,
        store: Store,
        clock: Arc<dyn Clock>,
        config: CoreConfig,
    ) -> Self {
        Self {
            nudger,
            planner,
            store,
            clock,
            config,
            cancel: CancellationToken::new(),
        }
    }

    /// Handle used to stop the loop at daemon teardown.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Spawn the tick loop as a background task.
    pub fn spawn(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        let interval = self.config.tick_interval();
        info!(interval_secs = interval.as_secs(), "scheduler spawned");
        tokio::spawn(async move {
            let mut last_plan_pass: Option<NaiveDate> = None;
            loop {
                tokio::select! {
                    _ = self.cancel.cancelled() => {
                        info!("scheduler stopping");
                        break;
                    }
                    _ = tokio::time::sleep(interval) => {}
                }

                if let Err(e) = self.run_tick(&mut last_plan_pass).await {
                    error!("scheduler tick error: {}", e);
                }
            }
        })
    }

    /// One tick under the outer budget. A tick that exceeds the budget is
    /// abandoned; unreserved entries are picked up next tick.
    pub async fn run_tick(
        &self,
        last_plan_pass: &mut Option<NaiveDate>,
    ) -> anyhow::Result<()> {
        let budget = self.config.tick_budget();
        let tick = tokio::time::timeout(budget, async {
            self.maybe_generate_plans(last_plan_pass).await;
            self.nudger.tick(&self.cancel).await
        })
        .await;

        match tick {
            Ok(Ok(_report)) => Ok(()),
            Ok(Err(e)) => Err(e),
            Err(_) => {
                warn!(budget_secs = budget.as_secs(), "tick exceeded its outer budget");
                Ok(())
            }
        }
    }

    /// Once per day, after the generation hour, build plans for every user
    /// owning tasks. Individual failures are logged and never stall the
    /// loop.
    async fn maybe_generate_plans(&self, last_plan_pass: &mut Option<NaiveDate>) {
        let now = self.clock.now();

        let users = match self.store.list_task_users().await {
            Ok(users) => users,
            Err(e) => {
                warn!("plan pass could not list users: {}", e);
                return;
            }
        };

        let mut generated = 0usize;
        let mut pass_date = None;
        for user in users {
            if self.cancel.is_cancelled() {
                return;
            }
            let settings = match self.store.get_user_settings(&user).await {
                Ok(settings) => settings,
                Err(e) => {
                    warn!(user, "plan pass could not load settings: {}", e);
                    continue;
                }
            };
            let local = now.with_timezone(&settings.tz());
            if local.hour() < PLAN_GENERATION_HOUR {
                continue;
            }
            let today = local.date_naive();
            // One pass per (process) day; track by the first user's date.
            if *last_plan_pass == Some(today) {
                return;
            }
            pass_date = Some(today);

            match self.store.get_plan(&user, today).await {
                Ok(Some(_)) => continue,
                Ok(None) => {}
                Err(e) => {
                    warn!(user, "plan pass lookup failed: {}", e);
                    continue;
                }
            }

            match self.planner.generate(&user, today, &self.cancel).await {
                Ok(plan) => {
                    generated += 1;
                    info!(user, entries = plan.entries.len(), "scheduled plan generated");
                }
                Err(e) => warn!(user, "scheduled plan generation failed: {}", e),
            }
        }

        if let Some(date) = pass_date {
            *last_plan_pass = Some(date);
            if generated > 0 {
                info!(generated, %date, "daily plan pass complete");
            }
        }
    }
}
