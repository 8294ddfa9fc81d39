use crate::{
    plans::PlanLimits,
    usage::{TokenBreakdown, UsageRecord},
};
use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionInfo {
    pub session_start: Option<DateTime<Utc>>,
    pub session_end: Option<DateTime<Utc>>,
    pub remaining_minutes: f64,
    pub remaining_formatted: String,
    pub is_active: bool,
    pub tokens_in_window: u64,
    pub cost_in_window: f64,
}

impl SessionInfo {
    pub fn inactive() -> Self {
        Self {
            session_start: None,
            session_end: None,
            remaining_minutes: 0.0,
            remaining_formatted: "No active session".to_string(),
            is_active: false,
            tokens_in_window: 0,
            cost_in_window: 0.0,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct BurnRate {
    pub tokens_per_minute: f64,
    pub cost_per_hour: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DailyStats {
    pub date: NaiveDate,
    pub total_requests: usize,
    pub tokens: TokenBreakdown,
    pub total_cost_usd: f64,
    pub models_used: Vec<String>,
    /// Request count per local hour; hours without activity are omitted.
    pub hourly_distribution: BTreeMap<u32, u64>,
}

/// Today's stats as pushed to realtime subscribers (no hourly histogram).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TodaySummary {
    pub date: NaiveDate,
    pub total_requests: usize,
    pub tokens: TokenBreakdown,
    pub total_cost_usd: f64,
    pub models_used: Vec<String>,
}

impl From<&DailyStats> for TodaySummary {
    fn from(stats: &DailyStats) -> Self {
        Self {
            date: stats.date,
            total_requests: stats.total_requests,
            tokens: stats.tokens,
            total_cost_usd: stats.total_cost_usd,
            models_used: stats.models_used.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DateRange {
    pub start: Option<NaiveDate>,
    pub end: Option<NaiveDate>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct History {
    pub days_requested: u32,
    pub days_with_data: usize,
    pub daily_stats: Vec<DailyStats>,
    pub total_tokens: u64,
    pub total_cost_usd: f64,
    pub date_range: DateRange,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelStats {
    pub model: String,
    pub total_requests: usize,
    pub tokens: TokenBreakdown,
    pub total_cost_usd: f64,
    pub percentage_of_total: f64,
    pub first_used: Option<DateTime<Utc>>,
    pub last_used: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelStatsList {
    pub models: Vec<ModelStats>,
    pub total_models: usize,
    pub period_start: Option<DateTime<Utc>>,
    pub period_end: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RealtimeUsage {
    pub timestamp: DateTime<Utc>,
    pub session: SessionInfo,
    pub today_stats: DailyStats,
    pub burn_rate: BurnRate,
    pub recent_entries: Vec<UsageRecord>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UsageVsLimit {
    pub current: f64,
    pub limit: f64,
    /// Not clamped: values above 100 mean the plan is over its limit.
    pub percentage: f64,
    pub formatted_current: String,
    pub formatted_limit: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResetInfo {
    pub reset_time: DateTime<Utc>,
    pub remaining_minutes: f64,
    pub remaining_formatted: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Predictions {
    pub tokens_run_out: Option<DateTime<Utc>>,
    pub limit_resets_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlanUsage {
    pub timestamp: DateTime<Utc>,
    pub plan: PlanLimits,
    pub cost_usage: UsageVsLimit,
    pub token_usage: UsageVsLimit,
    pub message_usage: UsageVsLimit,
    pub reset_info: ResetInfo,
    pub burn_rate: BurnRate,
    pub model_distribution: BTreeMap<String, f64>,
    pub predictions: Predictions,
}
