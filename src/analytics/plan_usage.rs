use super::{
    calc::{burn_rate, format_remaining, minutes_between, model_distribution, percentage},
    types::{PlanUsage, Predictions, ResetInfo, UsageVsLimit},
};
use crate::{
    blocks::{BlockAnalysis, SessionBlock},
    ingest::parse_timestamp,
    plans::PlanLimits,
    usage::UsageRecord,
};
use chrono::{DateTime, Duration as ChronoDuration, DurationRound, Utc};

/// Inputs for one plan-usage computation. `analysis` is `None` when the block
/// analyzer failed; that is treated the same as having no active block.
pub struct PlanUsageInput<'a> {
    pub plan: PlanLimits,
    pub analysis: Option<&'a BlockAnalysis>,
    pub session_records: &'a [UsageRecord],
    pub window_hours: u32,
    pub burn_rate_minutes: u32,
    pub now: DateTime<Utc>,
}

pub fn compute_plan_usage(input: PlanUsageInput<'_>) -> PlanUsage {
    let PlanUsageInput {
        plan,
        analysis,
        session_records,
        window_hours,
        burn_rate_minutes,
        now,
    } = input;
    let window = ChronoDuration::hours(i64::from(window_hours));
    let active = analysis.and_then(BlockAnalysis::active_block);

    let (current_cost, current_tokens, current_messages) = active
        .map(|block| (block.cost_usd, block.total_tokens, block.message_count))
        .unwrap_or((0.0, 0, 0));

    let reset_time = match active {
        Some(block) => block_end(block, now, window),
        None => next_hour(now),
    };
    let remaining_minutes = minutes_between(now, reset_time).max(0.0);

    let rate = burn_rate(session_records, burn_rate_minutes, now);
    let tokens_run_out = if rate.tokens_per_minute > 0.0 && current_tokens < plan.token_limit {
        let minutes_left = (plan.token_limit - current_tokens) as f64 / rate.tokens_per_minute;
        ChronoDuration::try_milliseconds((minutes_left * 60_000.0) as i64)
            .and_then(|delta| now.checked_add_signed(delta))
    } else {
        None
    };

    let model_distribution = match active.and_then(|block| block.model_distribution.as_ref()) {
        Some(dist) => dist.iter().map(|(model, share)| (model.clone(), *share)).collect(),
        None => model_distribution(session_records),
    };

    PlanUsage {
        timestamp: now,
        cost_usage: UsageVsLimit {
            current: current_cost,
            limit: plan.cost_limit,
            percentage: percentage(current_cost, plan.cost_limit),
            formatted_current: format_cost(current_cost),
            formatted_limit: format_cost(plan.cost_limit),
        },
        token_usage: count_usage(current_tokens, plan.token_limit),
        message_usage: count_usage(current_messages, plan.message_limit),
        reset_info: ResetInfo {
            reset_time,
            remaining_minutes,
            remaining_formatted: format_remaining(remaining_minutes),
        },
        burn_rate: rate,
        model_distribution,
        predictions: Predictions {
            tokens_run_out,
            limit_resets_at: Some(reset_time),
        },
        plan,
    }
}

fn count_usage(current: u64, limit: u64) -> UsageVsLimit {
    UsageVsLimit {
        current: current as f64,
        limit: limit as f64,
        percentage: percentage(current as f64, limit as f64),
        formatted_current: format_count(current),
        formatted_limit: format_count(limit),
    }
}

fn block_end(block: &SessionBlock, now: DateTime<Utc>, window: ChronoDuration) -> DateTime<Utc> {
    match block.end_time.as_deref().and_then(parse_timestamp) {
        Some(end) => end,
        None => {
            tracing::debug!(end_time = ?block.end_time, "active block has no usable end time");
            now + window
        }
    }
}

fn next_hour(now: DateTime<Utc>) -> DateTime<Utc> {
    now.duration_trunc(ChronoDuration::hours(1)).unwrap_or(now) + ChronoDuration::hours(1)
}

fn format_cost(value: f64) -> String {
    format!("${value:.2}")
}

/// `1234567` -> `1,234,567`.
fn format_count(value: u64) -> String {
    let digits = value.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (idx, ch) in digits.chars().enumerate() {
        if idx > 0 && (digits.len() - idx) % 3 == 0 {
            out.push(',');
        }
        out.push(ch);
    }
    out
}
