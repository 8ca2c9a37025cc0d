mod clock;
mod config;
mod connectors;
mod core;
mod email;
mod error;
mod extract;
mod health;
mod ingest;
mod nudge;
mod plan;
mod providers;
mod ratelimit;
mod retry;
mod store;
mod sync;
mod traits;
mod types;
pub mod utils;

#[cfg(test)]
mod integration_tests;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::clock::{Clock, SystemClock};
use crate::config::AppConfig;
use crate::extract::ItemExtractor;
use crate::ingest::{IngestMetrics, IngestPipeline};
use crate::nudge::{scheduler::Scheduler, Nudger};
use crate::plan::Planner;
use crate::providers::{OpenAiChatter, OpenAiEmbedder};
use crate::ratelimit::RateLimiter;
use crate::retry::RetryPolicy;
use crate::store::Store;
use crate::sync::SyncEngine;
use crate::traits::{Chatter, Embedder, ItemSource, Notifier};
use crate::types::Source;

fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("dayflow.toml"));
    let config = AppConfig::load(&config_path)?;
    info!(config = %config_path.display(), "configuration loaded");

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(run(config))
}

async fn run(config: AppConfig) -> anyhow::Result<()> {
    let store = Store::new(&config.state.db_path).await?;
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let limiter = Arc::new(RateLimiter::new(config.core.provider_rate_limits.clone()));
    let metrics = Arc::new(IngestMetrics::new());

    let llm_timeout = Duration::from_secs(config.llm.timeout_secs);
    let chatter: Option<Arc<dyn Chatter>> = if config.llm.api_key.is_empty() {
        warn!("no LLM api key configured; extraction and planning run rules-only");
        None
    } else {
        Some(Arc::new(
            OpenAiChatter::new(
                &config.llm.base_url,
                &config.llm.api_key,
                &config.llm.model,
                llm_timeout,
            )
            .map_err(|e| anyhow::anyhow!(e))?,
        ))
    };
    let embedder: Option<Arc<dyn Embedder>> = if config.llm.api_key.is_empty() {
        None
    } else {
        Some(Arc::new(
            OpenAiEmbedder::new(
                &config.llm.base_url,
                &config.llm.api_key,
                &config.llm.embedding_model,
                llm_timeout,
            )
            .map_err(|e| anyhow::anyhow!(e))?,
        ))
    };

    let retry = RetryPolicy::with_budget(config.core.llm_retry_budget);
    let extractor = Arc::new(ItemExtractor::new(
        chatter.clone(),
        config.core.spam_llm_threshold,
        retry,
    ));

    let todoist = Arc::new(
        connectors::TodoistClient::new(Duration::from_secs(30))
            .map_err(|e| anyhow::anyhow!(e))?,
    );
    let mut sources: HashMap<Source, Arc<dyn ItemSource>> = HashMap::new();
    sources.insert(Source::TaskManager, todoist.clone());
    // Calendar/mail clients are host integrations registered here when the
    // deployment provides them.

    let pipeline = Arc::new(IngestPipeline::new(
        store.clone(),
        extractor,
        sources,
        None,
        embedder,
        None,
        limiter.clone(),
        clock.clone(),
        config.core.clone(),
        metrics.clone(),
    ));

    let planner = Arc::new(Planner::new(
        store.clone(),
        chatter,
        clock.clone(),
        config.core.clone(),
    ));

    let sync_engine = Arc::new(SyncEngine::new(
        store.clone(),
        todoist,
        None,
        limiter,
        clock.clone(),
    ));

    let mailer: Option<Arc<dyn Notifier>> = match &config.smtp {
        Some(smtp) => Some(Arc::new(email::Mailer::new(smtp)?)),
        None => {
            if config.core.email_enabled {
                warn!("email_enabled is set but no [smtp] section is configured");
            }
            None
        }
    };

    let nudger = Arc::new(Nudger::new(
        store.clone(),
        clock.clone(),
        config.core.clone(),
        mailer,
    ));

    // The HTTP layer is hosted outside this crate and mounts on this
    // facade; keep it alive for the daemon's lifetime.
    let _core = crate::core::Core::new(
        store.clone(),
        pipeline,
        planner.clone(),
        sync_engine,
        clock.clone(),
    );

    let scheduler = Arc::new(Scheduler::new(
        nudger,
        planner,
        store,
        clock,
        config.core.clone(),
    ));
    let scheduler_cancel = scheduler.cancel_token();
    let scheduler_handle = scheduler.spawn();

    let health_port = config.daemon.health_port;
    let health = tokio::spawn(health::start_health_server(health_port, metrics));

    info!("dayflow daemon running");
    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");

    scheduler_cancel.cancel();
    let _ = scheduler_handle.await;
    health.abort();

    Ok(())
}
