use crate::{
    analytics::{EngineSettings, UsageCache, UsageService},
    blocks::RollingBlockAnalyzer,
    broadcast::BroadcastManager,
    config::AppConfig,
    ingest::{JsonlRecordSource, RecordSource},
    plans::PlanCatalog,
    server,
};
use anyhow::{Context, Result};
use std::sync::Arc;

/// High-level application orchestrator.
pub struct App {
    config: Arc<AppConfig>,
    usage: Arc<UsageService>,
    broadcast: Arc<BroadcastManager>,
}

impl App {
    pub fn new(config: AppConfig) -> Result<Self> {
        let settings = EngineSettings::from_config(&config.analytics)?;
        let data_path = config.data.resolved_data_path();
        if !config.data.is_data_path_valid() {
            tracing::warn!(path = %data_path.display(), "usage data path does not exist yet");
        }

        let source: Arc<dyn RecordSource> =
            Arc::new(JsonlRecordSource::new(data_path, config.pricing.clone()));
        let analyzer = Arc::new(RollingBlockAnalyzer::new(
            source.clone(),
            settings.window_hours,
        ));
        let cache = Arc::new(UsageCache::new(config.data.cache_ttl()));
        tracing::debug!(ttl_secs = cache.default_ttl().as_secs(), "usage cache ready");
        let usage = Arc::new(UsageService::new(
            source,
            analyzer,
            PlanCatalog::from_config(&config.plans),
            cache,
            settings,
        ));
        let broadcast = Arc::new(BroadcastManager::new(
            usage.clone(),
            config.broadcast.interval(),
            config.broadcast.send_timeout(),
        ));

        Ok(Self {
            config: Arc::new(config),
            usage,
            broadcast,
        })
    }

    pub async fn run(self, warm_cache: bool) -> Result<()> {
        if warm_cache && self.config.data.is_data_path_valid() {
            let usage = self.usage.clone();
            tokio::task::spawn_blocking(move || usage.warm_cache())
                .await
                .context("cache warm-up task failed")?;
        }

        let server_handle =
            server::spawn(self.config.clone(), self.usage.clone(), self.broadcast.clone()).await?;
        self.broadcast.start();

        tracing::info!(addr = %server_handle.local_addr(), "usage dashboard ready, press Ctrl-C to stop");
        tokio::signal::ctrl_c()
            .await
            .context("failed to listen for shutdown signal")?;
        tracing::info!("shutting down");

        self.broadcast.stop().await;
        server_handle.shutdown().await?;
        self.usage.clear_cache();
        Ok(())
    }
}
