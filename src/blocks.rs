//! Session-block analysis: groups usage into window-sized blocks and flags
//! the one that is currently running.

use crate::{ingest::RecordSource, usage::UsageRecord};
use anyhow::Result;
use chrono::{DateTime, Duration as ChronoDuration, DurationRound, Utc};
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, sync::Arc};

/// Output of a block analyzer. Times travel as RFC3339 strings so consumers
/// must tolerate missing or malformed values.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BlockAnalysis {
    pub blocks: Vec<SessionBlock>,
}

impl BlockAnalysis {
    /// The block flagged active, if exactly one is.
    pub fn active_block(&self) -> Option<&SessionBlock> {
        let mut active = self.blocks.iter().filter(|block| block.is_active);
        match (active.next(), active.next()) {
            (Some(block), None) => Some(block),
            (Some(_), Some(_)) => {
                tracing::warn!("block analyzer flagged more than one active block");
                None
            }
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionBlock {
    #[serde(default)]
    pub is_active: bool,
    #[serde(rename = "costUSD", default)]
    pub cost_usd: f64,
    #[serde(default)]
    pub total_tokens: u64,
    #[serde(default)]
    pub message_count: u64,
    #[serde(default)]
    pub start_time: Option<String>,
    #[serde(default)]
    pub end_time: Option<String>,
    #[serde(default)]
    pub model_distribution: Option<HashMap<String, f64>>,
}

pub trait BlockAnalyzer: Send + Sync {
    fn analyze(&self, hours_back: u32, plan: &str) -> Result<BlockAnalysis>;
}

/// Splits records into blocks of `window_hours`, each starting at the top of
/// the hour of its first record.
pub struct RollingBlockAnalyzer {
    source: Arc<dyn RecordSource>,
    window_hours: u32,
}

impl RollingBlockAnalyzer {
    pub fn new(source: Arc<dyn RecordSource>, window_hours: u32) -> Self {
        Self {
            source,
            window_hours,
        }
    }
}

impl BlockAnalyzer for RollingBlockAnalyzer {
    fn analyze(&self, hours_back: u32, plan: &str) -> Result<BlockAnalysis> {
        let records = self.source.load_records(Some(hours_back))?;
        tracing::debug!(plan, records = records.len(), "analyzing session blocks");
        Ok(build_blocks(records, self.window_hours, Utc::now()))
    }
}

pub fn build_blocks(
    mut records: Vec<UsageRecord>,
    window_hours: u32,
    now: DateTime<Utc>,
) -> BlockAnalysis {
    records.sort_by_key(|record| record.timestamp);
    let window = ChronoDuration::hours(i64::from(window_hours));

    let mut blocks = Vec::new();
    let mut current: Option<BlockBuilder> = None;
    for record in &records {
        let starts_new = match &current {
            Some(builder) => {
                record.timestamp >= builder.end || record.timestamp - builder.last_activity > window
            }
            None => true,
        };
        if starts_new {
            if let Some(done) = current.take() {
                blocks.push(done.finish(window, now));
            }
            current = Some(BlockBuilder::start(record.timestamp, window));
        }
        if let Some(builder) = current.as_mut() {
            builder.push(record);
        }
    }
    if let Some(done) = current.take() {
        blocks.push(done.finish(window, now));
    }

    BlockAnalysis { blocks }
}

struct BlockBuilder {
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    last_activity: DateTime<Utc>,
    cost_usd: f64,
    total_tokens: u64,
    message_count: u64,
    per_model: HashMap<String, u64>,
}

impl BlockBuilder {
    fn start(first: DateTime<Utc>, window: ChronoDuration) -> Self {
        let start = first
            .duration_trunc(ChronoDuration::hours(1))
            .unwrap_or(first);
        Self {
            start,
            end: start + window,
            last_activity: first,
            cost_usd: 0.0,
            total_tokens: 0,
            message_count: 0,
            per_model: HashMap::new(),
        }
    }

    fn push(&mut self, record: &UsageRecord) {
        self.last_activity = record.timestamp;
        self.cost_usd += record.cost_usd;
        self.total_tokens = self.total_tokens.saturating_add(record.total_tokens());
        self.message_count += 1;
        let model = record.model_label();
        let tokens = self.per_model.entry(model.to_string()).or_default();
        *tokens = tokens.saturating_add(record.total_tokens());
    }

    fn finish(self, window: ChronoDuration, now: DateTime<Utc>) -> SessionBlock {
        let is_active = now < self.end && now - self.last_activity < window;
        let model_distribution = if self.total_tokens == 0 {
            None
        } else {
            Some(
                self.per_model
                    .into_iter()
                    .map(|(model, tokens)| {
                        (model, tokens as f64 / self.total_tokens as f64 * 100.0)
                    })
                    .collect(),
            )
        };

        SessionBlock {
            is_active,
            cost_usd: self.cost_usd,
            total_tokens: self.total_tokens,
            message_count: self.message_count,
            start_time: Some(self.start.to_rfc3339()),
            end_time: Some(self.end.to_rfc3339()),
            model_distribution,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::usage::tests::sample_record;
    use chrono::TimeZone;

    fn at(hour: u32, minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 10, hour, minute, 0).unwrap()
    }

    #[test]
    fn groups_records_into_hour_aligned_blocks() {
        let records = vec![
            sample_record(at(9, 40), "claude-sonnet-4", (100, 0, 0, 0), 0.1),
            sample_record(at(11, 5), "claude-opus-4", (300, 0, 0, 0), 0.3),
            // 14:00 is the end of the 09:00 block.
            sample_record(at(14, 10), "claude-sonnet-4", (50, 0, 0, 0), 0.05),
        ];

        let analysis = build_blocks(records, 5, at(15, 0));
        assert_eq!(analysis.blocks.len(), 2);

        let first = &analysis.blocks[0];
        assert!(!first.is_active);
        assert_eq!(first.start_time.as_deref(), Some("2025-03-10T09:00:00+00:00"));
        assert_eq!(first.end_time.as_deref(), Some("2025-03-10T14:00:00+00:00"));
        assert_eq!(first.total_tokens, 400);
        assert_eq!(first.message_count, 2);
        let dist = first.model_distribution.as_ref().unwrap();
        assert!((dist["claude-opus-4"] - 75.0).abs() < 1e-9);

        let second = &analysis.blocks[1];
        assert!(second.is_active);
        assert_eq!(second.start_time.as_deref(), Some("2025-03-10T14:00:00+00:00"));
        assert_eq!(analysis.active_block(), Some(second));
    }

    #[test]
    fn long_gap_starts_a_new_block_and_nothing_is_active() {
        let records = vec![sample_record(at(1, 0), "m", (10, 0, 0, 0), 0.0)];
        let analysis = build_blocks(records, 5, at(12, 0));
        assert_eq!(analysis.blocks.len(), 1);
        assert!(analysis.active_block().is_none());
    }

    #[test]
    fn analysis_deserializes_from_camel_case() {
        let raw = r#"{"blocks":[{"isActive":true,"costUSD":15.5,"totalTokens":1500000,"messageCount":50,"startTime":"garbage"}]}"#;
        let analysis: BlockAnalysis = serde_json::from_str(raw).unwrap();
        let block = analysis.active_block().unwrap();
        assert_eq!(block.total_tokens, 1_500_000);
        assert_eq!(block.start_time.as_deref(), Some("garbage"));
        assert!(block.end_time.is_none());
        assert!(block.model_distribution.is_none());
    }

    #[test]
    fn two_active_blocks_are_treated_as_none() {
        let active = SessionBlock {
            is_active: true,
            ..SessionBlock::default()
        };
        let analysis = BlockAnalysis {
            blocks: vec![active.clone(), active],
        };
        assert!(analysis.active_block().is_none());
    }
}
