//! The analytics engine: cached loading plus the query operations served over
//! HTTP and pushed to realtime subscribers.

pub mod calc;
pub mod plan_usage;
pub mod types;

pub use types::*;

use crate::{
    blocks::{BlockAnalysis, BlockAnalyzer},
    cache::TtlCache,
    config::AnalyticsConfig,
    ingest::RecordSource,
    plans::{PlanCatalog, PlanLimits},
    usage::UsageRecord,
};
use anyhow::Result;
use chrono::{DateTime, Duration as ChronoDuration, FixedOffset, NaiveDate, Offset, Utc};
use plan_usage::{PlanUsageInput, compute_plan_usage};
use std::sync::Arc;

const RECENT_ENTRIES: usize = 50;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CacheKey {
    Records { hours_back: Option<u32> },
    Blocks { hours_back: u32, plan: String },
}

#[derive(Debug, Clone)]
pub enum CachedValue {
    Records(Arc<Vec<UsageRecord>>),
    Blocks(Arc<BlockAnalysis>),
}

pub type UsageCache = TtlCache<CacheKey, CachedValue>;

#[derive(Debug, Clone, Copy)]
pub struct EngineSettings {
    pub window_hours: u32,
    pub burn_rate_minutes: u32,
    pub offset: FixedOffset,
}

impl EngineSettings {
    pub fn from_config(config: &AnalyticsConfig) -> Result<Self> {
        Ok(Self {
            window_hours: config.session_window_hours.max(1),
            burn_rate_minutes: config.burn_rate_minutes.max(1),
            offset: config.offset()?,
        })
    }
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            window_hours: 5,
            burn_rate_minutes: 30,
            offset: Utc.fix(),
        }
    }
}

pub struct UsageService {
    source: Arc<dyn RecordSource>,
    analyzer: Arc<dyn BlockAnalyzer>,
    plans: PlanCatalog,
    cache: Arc<UsageCache>,
    settings: EngineSettings,
}

impl UsageService {
    pub fn new(
        source: Arc<dyn RecordSource>,
        analyzer: Arc<dyn BlockAnalyzer>,
        plans: PlanCatalog,
        cache: Arc<UsageCache>,
        settings: EngineSettings,
    ) -> Self {
        Self {
            source,
            analyzer,
            plans,
            cache,
            settings,
        }
    }

    pub fn window_hours(&self) -> u32 {
        self.settings.window_hours
    }

    pub fn plans(&self) -> &PlanCatalog {
        &self.plans
    }

    pub fn clear_cache(&self) {
        let entries = self.cache.len();
        self.cache.clear();
        tracing::info!(entries, "usage cache cleared");
    }

    /// Drops the cached records behind the realtime snapshot so the next
    /// one is read from the source.
    pub fn invalidate_realtime(&self) {
        for hours_back in [self.settings.window_hours + 1, 24] {
            self.cache.invalidate(&CacheKey::Records {
                hours_back: Some(hours_back),
            });
        }
    }

    /// Records from the last `hours_back` hours. A failing source yields an
    /// empty set and nothing is cached, so the next call retries.
    fn load_records(&self, hours_back: Option<u32>) -> Arc<Vec<UsageRecord>> {
        let key = CacheKey::Records { hours_back };
        if let Some(CachedValue::Records(records)) = self.cache.get(&key) {
            return records;
        }
        match self.source.load_records(hours_back) {
            Ok(records) => {
                let records = Arc::new(records);
                self.cache.set_default(key, CachedValue::Records(records.clone()));
                records
            }
            Err(err) => {
                tracing::error!(error = ?err, hours_back, "failed to load usage records");
                Arc::new(Vec::new())
            }
        }
    }

    fn load_blocks(&self, hours_back: u32, plan: &str) -> Option<Arc<BlockAnalysis>> {
        let key = CacheKey::Blocks {
            hours_back,
            plan: plan.to_string(),
        };
        if let Some(CachedValue::Blocks(analysis)) = self.cache.get(&key) {
            return Some(analysis);
        }
        match self.analyzer.analyze(hours_back, plan) {
            Ok(analysis) => {
                let analysis = Arc::new(analysis);
                self.cache.set_default(key, CachedValue::Blocks(analysis.clone()));
                Some(analysis)
            }
            Err(err) => {
                tracing::error!(error = ?err, hours_back, plan, "block analysis failed");
                None
            }
        }
    }

    fn today(&self, now: DateTime<Utc>) -> NaiveDate {
        calc::local_date(now, self.settings.offset)
    }

    pub fn today_stats(&self) -> DailyStats {
        self.today_stats_at(Utc::now())
    }

    pub fn today_stats_at(&self, now: DateTime<Utc>) -> DailyStats {
        let records = self.load_records(Some(24));
        calc::daily_stats(&records, self.today(now), self.settings.offset)
    }

    pub fn daily_stats(&self, date: NaiveDate) -> DailyStats {
        self.daily_stats_at(date, Utc::now())
    }

    pub fn daily_stats_at(&self, date: NaiveDate, now: DateTime<Utc>) -> DailyStats {
        let days_back = (self.today(now) - date).num_days();
        // A future date has nothing to bound the lookback by.
        let hours_back = if days_back < 0 {
            None
        } else {
            u32::try_from((days_back + 1) * 24).ok()
        };
        let records = self.load_records(hours_back);
        calc::daily_stats(&records, date, self.settings.offset)
    }

    pub fn history(&self, days: u32) -> History {
        self.history_at(days, Utc::now())
    }

    pub fn history_at(&self, days: u32, now: DateTime<Utc>) -> History {
        let records = self.load_records(Some(days.saturating_mul(24)));
        calc::history(&records, days, now, self.settings.offset)
    }

    pub fn model_stats(&self, days: u32) -> ModelStatsList {
        self.model_stats_at(days, Utc::now())
    }

    pub fn model_stats_at(&self, days: u32, now: DateTime<Utc>) -> ModelStatsList {
        let records = self.load_records(Some(days.saturating_mul(24)));
        calc::model_stats(&records, days, now)
    }

    pub fn plan_usage(&self, plan: &str) -> PlanUsage {
        self.plan_usage_at(plan, Utc::now())
    }

    pub fn plan_usage_at(&self, plan: &str, now: DateTime<Utc>) -> PlanUsage {
        let limits: PlanLimits = self.plans.resolve_or_default(plan);
        let window_hours = self.settings.window_hours;
        let analysis = self.load_blocks(window_hours, &limits.plan);

        let records = self.load_records(Some(window_hours + 1));
        let window_start = now - ChronoDuration::hours(i64::from(window_hours));
        let session_records: Vec<UsageRecord> = records
            .iter()
            .filter(|record| record.timestamp >= window_start)
            .cloned()
            .collect();

        compute_plan_usage(PlanUsageInput {
            plan: limits,
            analysis: analysis.as_deref(),
            session_records: &session_records,
            window_hours,
            burn_rate_minutes: self.settings.burn_rate_minutes,
            now,
        })
    }

    pub fn realtime_usage(&self) -> RealtimeUsage {
        self.realtime_usage_at(Utc::now())
    }

    pub fn realtime_usage_at(&self, now: DateTime<Utc>) -> RealtimeUsage {
        let window_hours = self.settings.window_hours;
        let records = self.load_records(Some(window_hours + 1));

        let mut recent_entries = records.to_vec();
        recent_entries.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        recent_entries.truncate(RECENT_ENTRIES);

        RealtimeUsage {
            timestamp: now,
            session: calc::session_info(&records, window_hours, now),
            today_stats: self.today_stats_at(now),
            burn_rate: calc::burn_rate(&records, self.settings.burn_rate_minutes, now),
            recent_entries,
        }
    }

    /// Populates the cache entries the dashboard asks for first.
    pub fn warm_cache(&self) {
        let realtime = self.realtime_usage();
        let plan = self.plans.default_plan_name().to_string();
        let usage = self.plan_usage(&plan);
        tracing::info!(
            session_active = realtime.session.is_active,
            today_requests = realtime.today_stats.total_requests,
            plan = %usage.plan.plan,
            "usage cache warmed"
        );
    }
}
