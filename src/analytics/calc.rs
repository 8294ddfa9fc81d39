use super::types::{
    BurnRate, DailyStats, DateRange, History, ModelStats, ModelStatsList, SessionInfo,
};
use crate::usage::{TokenBreakdown, UsageRecord};
use chrono::{DateTime, Duration as ChronoDuration, FixedOffset, NaiveDate, Timelike, Utc};
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// Session state for a rolling window of `window_hours`.
///
/// The session is anchored to the first record inside the trailing window,
/// not to the window boundary itself, so `session_end` is always
/// `first_activity + window`.
pub fn session_info(records: &[UsageRecord], window_hours: u32, now: DateTime<Utc>) -> SessionInfo {
    let window = ChronoDuration::hours(i64::from(window_hours));
    let window_start = now - window;

    let in_window: Vec<&UsageRecord> = records
        .iter()
        .filter(|r| r.timestamp >= window_start)
        .collect();
    // Records stamped after `now` (writer clock ahead) still anchor the session.
    let Some(session_start) = in_window.iter().map(|r| r.timestamp).min() else {
        return SessionInfo::inactive();
    };
    let tokens = in_window
        .iter()
        .fold(0u64, |acc, r| acc.saturating_add(r.total_tokens()));
    let cost: f64 = in_window.iter().map(|r| r.cost_usd).sum();

    let session_end = session_start + window;
    let remaining_minutes = minutes_between(now, session_end).max(0.0);

    SessionInfo {
        session_start: Some(session_start),
        session_end: Some(session_end),
        remaining_minutes,
        remaining_formatted: if remaining_minutes > 0.0 {
            format_remaining(remaining_minutes)
        } else {
            "Session expired".to_string()
        },
        is_active: remaining_minutes > 0.0,
        tokens_in_window: tokens,
        cost_in_window: cost,
    }
}

pub fn burn_rate(records: &[UsageRecord], minutes_window: u32, now: DateTime<Utc>) -> BurnRate {
    let window_start = now - ChronoDuration::minutes(i64::from(minutes_window));
    let recent: Vec<&UsageRecord> = records
        .iter()
        .filter(|r| r.timestamp >= window_start)
        .collect();
    let Some(first) = recent.iter().map(|r| r.timestamp).min() else {
        return BurnRate::default();
    };

    let total_tokens = recent
        .iter()
        .fold(0u64, |acc, r| acc.saturating_add(r.total_tokens()));
    let total_cost: f64 = recent.iter().map(|r| r.cost_usd).sum();
    // Floor at one minute so a burst of near-simultaneous records does not
    // produce an unbounded rate.
    let span = minutes_between(first, now).max(1.0);

    BurnRate {
        tokens_per_minute: round_to(total_tokens as f64 / span, 2),
        cost_per_hour: round_to(total_cost / span * 60.0, 4),
    }
}

pub fn daily_stats(records: &[UsageRecord], target: NaiveDate, offset: FixedOffset) -> DailyStats {
    let day: Vec<&UsageRecord> = records
        .iter()
        .filter(|r| local_date(r.timestamp, offset) == target)
        .collect();
    build_daily(target, &day, offset)
}

pub fn history(
    records: &[UsageRecord],
    days: u32,
    now: DateTime<Utc>,
    offset: FixedOffset,
) -> History {
    let cutoff = now - ChronoDuration::hours(i64::from(days) * 24);
    let mut by_date: BTreeMap<NaiveDate, Vec<&UsageRecord>> = BTreeMap::new();
    for record in records.iter().filter(|r| r.timestamp >= cutoff) {
        by_date
            .entry(local_date(record.timestamp, offset))
            .or_default()
            .push(record);
    }

    // BTreeMap iteration is already ascending by date.
    let daily_stats: Vec<DailyStats> = by_date
        .iter()
        .map(|(date, day)| build_daily(*date, day, offset))
        .collect();

    let total_tokens = daily_stats
        .iter()
        .fold(0u64, |acc, d| acc.saturating_add(d.tokens.total_tokens));
    let total_cost_usd = daily_stats.iter().map(|d| d.total_cost_usd).sum();
    let date_range = DateRange {
        start: daily_stats.first().map(|d| d.date),
        end: daily_stats.last().map(|d| d.date),
    };

    History {
        days_requested: days,
        days_with_data: daily_stats.len(),
        daily_stats,
        total_tokens,
        total_cost_usd,
        date_range,
    }
}

pub fn model_stats(records: &[UsageRecord], days: u32, now: DateTime<Utc>) -> ModelStatsList {
    let cutoff = now - ChronoDuration::hours(i64::from(days) * 24);
    let records: Vec<&UsageRecord> = records.iter().filter(|r| r.timestamp >= cutoff).collect();

    let mut groups: HashMap<&str, Vec<&UsageRecord>> = HashMap::new();
    for record in &records {
        groups
            .entry(record.model_label())
            .or_default()
            .push(record);
    }

    let all_tokens = records
        .iter()
        .fold(0u64, |acc, r| acc.saturating_add(r.total_tokens()));
    let mut models: Vec<ModelStats> = groups
        .into_iter()
        .map(|(model, group)| {
            let tokens = TokenBreakdown::from_records(group.iter().copied());
            ModelStats {
                model: model.to_string(),
                total_requests: group.len(),
                tokens,
                total_cost_usd: group.iter().map(|r| r.cost_usd).sum(),
                percentage_of_total: round_to(percentage(tokens.total_tokens as f64, all_tokens as f64), 2),
                first_used: group.iter().map(|r| r.timestamp).min(),
                last_used: group.iter().map(|r| r.timestamp).max(),
            }
        })
        .collect();
    models.sort_by(|a, b| {
        b.tokens
            .total_tokens
            .cmp(&a.tokens.total_tokens)
            .then_with(|| a.model.cmp(&b.model))
    });

    ModelStatsList {
        total_models: models.len(),
        models,
        period_start: records.iter().map(|r| r.timestamp).min(),
        period_end: records.iter().map(|r| r.timestamp).max(),
    }
}

/// Token-weighted share per model, in percent. All zero when nothing was
/// consumed.
pub fn model_distribution<'a>(
    records: impl IntoIterator<Item = &'a UsageRecord>,
) -> BTreeMap<String, f64> {
    let mut per_model: BTreeMap<String, u64> = BTreeMap::new();
    for record in records {
        let tokens = per_model.entry(record.model_label().to_string()).or_default();
        *tokens = tokens.saturating_add(record.total_tokens());
    }
    let total = per_model.values().fold(0u64, |acc, t| acc.saturating_add(*t));
    per_model
        .into_iter()
        .map(|(model, tokens)| (model, percentage(tokens as f64, total as f64)))
        .collect()
}

fn build_daily(date: NaiveDate, records: &[&UsageRecord], offset: FixedOffset) -> DailyStats {
    let models_used: BTreeSet<&str> = records
        .iter()
        .filter_map(|r| r.model_name())
        .collect();

    let mut hourly_distribution = BTreeMap::new();
    for record in records {
        let hour = record.timestamp.with_timezone(&offset).hour();
        *hourly_distribution.entry(hour).or_insert(0) += 1;
    }

    DailyStats {
        date,
        total_requests: records.len(),
        tokens: TokenBreakdown::from_records(records.iter().copied()),
        total_cost_usd: records.iter().map(|r| r.cost_usd).sum(),
        models_used: models_used.into_iter().map(str::to_string).collect(),
        hourly_distribution,
    }
}

pub fn local_date(timestamp: DateTime<Utc>, offset: FixedOffset) -> NaiveDate {
    timestamp.with_timezone(&offset).date_naive()
}

pub fn minutes_between(from: DateTime<Utc>, to: DateTime<Utc>) -> f64 {
    (to - from).num_milliseconds() as f64 / 60_000.0
}

/// `part / whole * 100`, defined as 0 when `whole` is 0.
pub fn percentage(part: f64, whole: f64) -> f64 {
    if whole > 0.0 { part / whole * 100.0 } else { 0.0 }
}

pub fn round_to(value: f64, places: i32) -> f64 {
    let factor = 10f64.powi(places);
    (value * factor).round() / factor
}

/// `2h 30m`, or `45m` under an hour.
pub fn format_remaining(minutes: f64) -> String {
    let minutes = minutes.max(0.0);
    let hours = (minutes / 60.0).floor() as u64;
    let mins = (minutes % 60.0).floor() as u64;
    if hours > 0 {
        format!("{hours}h {mins}m")
    } else {
        format!("{mins}m")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::usage::tests::sample_record;
    use chrono::TimeZone;

    fn utc() -> FixedOffset {
        FixedOffset::east_opt(0).unwrap()
    }

    #[test]
    fn session_anchors_to_first_activity_in_window() {
        let now = Utc.with_ymd_and_hms(2025, 5, 1, 12, 0, 0).unwrap();
        let ts = now - ChronoDuration::hours(1);
        let records = vec![sample_record(ts, "claude-sonnet-4", (10, 20, 0, 0), 0.1)];

        let info = session_info(&records, 5, now);
        assert!(info.is_active);
        assert_eq!(info.session_start, Some(ts));
        assert_eq!(info.session_end, Some(ts + ChronoDuration::hours(5)));
        assert!((info.remaining_minutes - 240.0).abs() < 1e-9);
        assert_eq!(info.remaining_formatted, "4h 0m");
        assert_eq!(info.tokens_in_window, 30);
        assert!((info.cost_in_window - 0.1).abs() < f64::EPSILON);
    }

    #[test]
    fn session_ignores_records_before_window() {
        let now = Utc.with_ymd_and_hms(2025, 5, 1, 12, 0, 0).unwrap();
        let records = vec![
            sample_record(now - ChronoDuration::hours(7), "m", (1000, 0, 0, 0), 1.0),
            sample_record(now - ChronoDuration::hours(4), "m", (10, 0, 0, 0), 0.1),
            sample_record(now - ChronoDuration::minutes(10), "m", (5, 0, 0, 0), 0.05),
        ];
        let info = session_info(&records, 5, now);
        assert_eq!(info.session_start, Some(now - ChronoDuration::hours(4)));
        assert_eq!(info.tokens_in_window, 15);
        assert_eq!(info.remaining_formatted, "1h 0m");
    }

    #[test]
    fn session_anchors_to_record_stamped_after_now() {
        let now = Utc.with_ymd_and_hms(2025, 5, 1, 12, 0, 0).unwrap();
        let ts = now + ChronoDuration::minutes(2);
        let records = vec![sample_record(ts, "m", (10, 0, 0, 0), 0.1)];

        let info = session_info(&records, 5, now);
        assert!(info.is_active);
        assert_eq!(info.session_start, Some(ts));
        assert_eq!(info.session_end, Some(ts + ChronoDuration::hours(5)));
        assert!((info.remaining_minutes - 302.0).abs() < 1e-9);
        assert_eq!(info.tokens_in_window, 10);
    }

    #[test]
    fn empty_session_is_inactive() {
        let info = session_info(&[], 5, Utc::now());
        assert!(!info.is_active);
        assert_eq!(info.remaining_minutes, 0.0);
        assert_eq!(info.tokens_in_window, 0);
        assert_eq!(info.cost_in_window, 0.0);
        assert!(info.session_start.is_none());
        assert!(info.session_end.is_none());
    }

    #[test]
    fn remaining_minutes_never_increases_without_new_records() {
        let start = Utc.with_ymd_and_hms(2025, 5, 1, 8, 0, 0).unwrap();
        let records = vec![
            sample_record(start, "m", (1, 0, 0, 0), 0.0),
            sample_record(start + ChronoDuration::minutes(90), "m", (1, 0, 0, 0), 0.0),
        ];
        // Up to the point the first record's session expires; after that a
        // later record becomes the anchor.
        let mut previous = f64::INFINITY;
        for step in 0..=20 {
            let now = start + ChronoDuration::minutes(step * 15);
            let info = session_info(&records, 5, now);
            assert!(info.remaining_minutes <= previous, "step {step}");
            previous = info.remaining_minutes;
        }
        assert_eq!(previous, 0.0);
    }

    #[test]
    fn burn_rate_with_single_record_floors_span() {
        let now = Utc::now();
        let records = vec![sample_record(now, "m", (100, 200, 30, 20), 0.5)];
        let rate = burn_rate(&records, 30, now);
        assert_eq!(rate.tokens_per_minute, 350.0);
        assert_eq!(rate.cost_per_hour, 30.0);
    }

    #[test]
    fn burn_rate_uses_span_since_first_recent_record() {
        let now = Utc.with_ymd_and_hms(2025, 5, 1, 12, 0, 0).unwrap();
        let records = vec![
            sample_record(now - ChronoDuration::minutes(45), "m", (10_000, 0, 0, 0), 5.0),
            sample_record(now - ChronoDuration::minutes(20), "m", (1_000, 0, 0, 0), 0.2),
            sample_record(now - ChronoDuration::minutes(5), "m", (1_000, 0, 0, 0), 0.1),
        ];
        let rate = burn_rate(&records, 30, now);
        assert_eq!(rate.tokens_per_minute, 100.0);
        assert_eq!(rate.cost_per_hour, 0.9);
        assert_eq!(burn_rate(&[], 30, now), BurnRate::default());
    }

    #[test]
    fn daily_stats_filters_by_local_date() {
        let offset = FixedOffset::east_opt(2 * 3600).unwrap();
        // 23:30 UTC on the 1st is 01:30 local on the 2nd.
        let late = Utc.with_ymd_and_hms(2025, 5, 1, 23, 30, 0).unwrap();
        let early = Utc.with_ymd_and_hms(2025, 5, 1, 10, 0, 0).unwrap();
        let records = vec![
            sample_record(late, "claude-opus-4", (10, 10, 0, 0), 1.0),
            sample_record(early, "claude-sonnet-4", (5, 5, 0, 0), 0.5),
            sample_record(early, "", (1, 1, 0, 0), 0.0),
        ];

        let second = daily_stats(&records, NaiveDate::from_ymd_opt(2025, 5, 2).unwrap(), offset);
        assert_eq!(second.total_requests, 1);
        assert_eq!(second.models_used, vec!["claude-opus-4".to_string()]);
        assert_eq!(second.hourly_distribution.get(&1), Some(&1));

        let first = daily_stats(&records, NaiveDate::from_ymd_opt(2025, 5, 1).unwrap(), offset);
        assert_eq!(first.total_requests, 2);
        assert_eq!(first.models_used, vec!["claude-sonnet-4".to_string()]);
        assert_eq!(first.hourly_distribution.get(&12), Some(&2));
        assert_eq!(first.tokens.total_tokens, 12);
    }

    #[test]
    fn empty_day_is_all_zero() {
        let stats = daily_stats(&[], NaiveDate::from_ymd_opt(2025, 1, 1).unwrap(), utc());
        assert_eq!(stats.total_requests, 0);
        assert_eq!(stats.tokens, TokenBreakdown::default());
        assert!(stats.models_used.is_empty());
        assert!(stats.hourly_distribution.is_empty());
    }

    #[test]
    fn history_is_sorted_and_totals_add_up() {
        let now = Utc.with_ymd_and_hms(2025, 5, 10, 12, 0, 0).unwrap();
        let records: Vec<UsageRecord> = [3i64, 0, 1, 3, 9]
            .iter()
            .map(|days| {
                sample_record(
                    now - ChronoDuration::days(*days),
                    "claude-sonnet-4",
                    (1000, 2000, 100, 50),
                    0.05,
                )
            })
            .collect();

        let history = history(&records, 7, now, utc());
        assert_eq!(history.days_requested, 7);
        assert_eq!(history.days_with_data, 3);
        let dates: Vec<NaiveDate> = history.daily_stats.iter().map(|d| d.date).collect();
        let mut sorted = dates.clone();
        sorted.sort();
        assert_eq!(dates, sorted);
        assert_eq!(history.daily_stats[0].total_requests, 2);

        let per_day: u64 = history.daily_stats.iter().map(|d| d.tokens.total_tokens).sum();
        assert_eq!(history.total_tokens, per_day);
        assert_eq!(history.total_tokens, 4 * 3150);
        assert_eq!(history.date_range.start, Some(NaiveDate::from_ymd_opt(2025, 5, 7).unwrap()));
        assert_eq!(history.date_range.end, Some(NaiveDate::from_ymd_opt(2025, 5, 10).unwrap()));
    }

    #[test]
    fn empty_history_has_no_range() {
        let history = history(&[], 7, Utc::now(), utc());
        assert_eq!(history.days_with_data, 0);
        assert_eq!(history.date_range, DateRange::default());
        assert_eq!(history.total_cost_usd, 0.0);
    }

    #[test]
    fn model_stats_shares_and_ordering() {
        let now = Utc::now();
        let records = vec![
            sample_record(now - ChronoDuration::hours(2), "model-b", (200_000, 0, 0, 0), 1.0),
            sample_record(now - ChronoDuration::hours(3), "model-a", (500_000, 0, 0, 0), 4.0),
            sample_record(now - ChronoDuration::hours(1), "model-a", (300_000, 0, 0, 0), 2.0),
        ];

        let stats = model_stats(&records, 30, now);
        assert_eq!(stats.total_models, 2);
        assert_eq!(stats.models[0].model, "model-a");
        assert_eq!(stats.models[0].percentage_of_total, 80.0);
        assert_eq!(stats.models[0].total_requests, 2);
        assert!((stats.models[0].total_cost_usd - 6.0).abs() < 1e-9);
        assert_eq!(stats.models[0].first_used, Some(now - ChronoDuration::hours(3)));
        assert_eq!(stats.models[0].last_used, Some(now - ChronoDuration::hours(1)));
        assert_eq!(stats.models[1].percentage_of_total, 20.0);
        assert_eq!(stats.period_start, Some(now - ChronoDuration::hours(3)));
        assert_eq!(stats.period_end, Some(now - ChronoDuration::hours(1)));
    }

    #[test]
    fn model_stats_normalizes_missing_model_and_zero_tokens() {
        let now = Utc::now();
        let records = vec![sample_record(now, "", (0, 0, 0, 0), 0.0)];
        let stats = model_stats(&records, 1, now);
        assert_eq!(stats.models[0].model, "unknown");
        assert_eq!(stats.models[0].percentage_of_total, 0.0);

        let empty = model_stats(&[], 30, now);
        assert!(empty.models.is_empty());
        assert!(empty.period_start.is_none());
    }

    #[test]
    fn blank_model_names_are_treated_as_missing() {
        let now = Utc.with_ymd_and_hms(2025, 5, 1, 12, 0, 0).unwrap();
        let records = vec![
            sample_record(now, "   ", (10, 0, 0, 0), 0.0),
            sample_record(now - ChronoDuration::minutes(1), "", (10, 0, 0, 0), 0.0),
            sample_record(now - ChronoDuration::minutes(2), "claude-opus-4", (20, 0, 0, 0), 0.0),
        ];

        let day = daily_stats(&records, NaiveDate::from_ymd_opt(2025, 5, 1).unwrap(), utc());
        assert_eq!(day.models_used, vec!["claude-opus-4".to_string()]);

        let stats = model_stats(&records, 1, now);
        assert_eq!(stats.total_models, 2);
        let unknown = stats.models.iter().find(|m| m.model == "unknown").unwrap();
        assert_eq!(unknown.total_requests, 2);
        assert_eq!(unknown.percentage_of_total, 50.0);

        let dist = model_distribution(&records);
        assert_eq!(dist.len(), 2);
        assert_eq!(dist.get("unknown"), Some(&50.0));
    }

    #[test]
    fn huge_token_counts_saturate_instead_of_overflowing() {
        let now = Utc.with_ymd_and_hms(2025, 5, 10, 12, 0, 0).unwrap();
        let records = vec![
            sample_record(now - ChronoDuration::days(2), "a", (u64::MAX - 1, 0, 0, 0), 0.0),
            sample_record(now - ChronoDuration::days(1), "b", (u64::MAX - 1, 0, 0, 0), 0.0),
            sample_record(now, "b", (5, 0, 0, 0), 0.0),
        ];

        let history = history(&records, 7, now, utc());
        assert_eq!(history.days_with_data, 3);
        assert_eq!(history.total_tokens, u64::MAX);

        let stats = model_stats(&records, 7, now);
        assert_eq!(stats.models[0].model, "b");
        assert_eq!(stats.models[0].tokens.total_tokens, u64::MAX);

        let dist = model_distribution(&records);
        assert!(dist.values().all(|share| share.is_finite() && *share <= 100.0));

        let session = session_info(&records, 5, now);
        assert_eq!(session.tokens_in_window, 5);
        let rate = burn_rate(&records[1..], 24 * 60 + 1, now);
        assert!(rate.tokens_per_minute > 0.0);
    }

    #[test]
    fn distribution_sums_to_hundred() {
        let now = Utc::now();
        let records = vec![
            sample_record(now, "a", (1, 0, 0, 0), 0.0),
            sample_record(now, "b", (1, 0, 0, 0), 0.0),
            sample_record(now, "c", (1, 0, 0, 0), 0.0),
        ];
        let dist = model_distribution(&records);
        let sum: f64 = dist.values().sum();
        assert!((sum - 100.0).abs() < 1e-9);

        let zero = vec![sample_record(now, "a", (0, 0, 0, 0), 0.0)];
        assert!(model_distribution(&zero).values().all(|share| *share == 0.0));
    }

    #[test]
    fn remaining_formatting() {
        assert_eq!(format_remaining(150.0), "2h 30m");
        assert_eq!(format_remaining(45.9), "45m");
        assert_eq!(format_remaining(-3.0), "0m");
    }
}
