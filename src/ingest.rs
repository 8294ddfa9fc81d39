use crate::{config::PricingConfig, usage::UsageRecord};
use anyhow::{Context, Result};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde_json::Value;
use std::{
    collections::HashSet,
    fs::File,
    io::{BufRead, BufReader},
    path::{Path, PathBuf},
    time::SystemTime,
};

/// Supplies usage records for the last `hours_back` hours (everything when
/// `None`). Order is not guaranteed.
pub trait RecordSource: Send + Sync {
    fn load_records(&self, hours_back: Option<u32>) -> Result<Vec<UsageRecord>>;
}

/// Reads Claude session transcripts (`*.jsonl`) below a root directory.
pub struct JsonlRecordSource {
    root: PathBuf,
    pricing: PricingConfig,
}

impl JsonlRecordSource {
    pub fn new(root: PathBuf, pricing: PricingConfig) -> Self {
        Self { root, pricing }
    }
}

impl RecordSource for JsonlRecordSource {
    fn load_records(&self, hours_back: Option<u32>) -> Result<Vec<UsageRecord>> {
        if !self.root.exists() {
            tracing::debug!(root = %self.root.display(), "usage data root not found");
            return Ok(Vec::new());
        }

        let cutoff = hours_back.map(|hours| Utc::now() - ChronoDuration::hours(i64::from(hours)));

        let mut paths = Vec::new();
        collect_jsonl_files(&self.root, &mut paths)?;
        paths.sort();

        let mut seen = HashSet::new();
        let mut records = Vec::new();
        for path in paths {
            if let Some(cutoff) = cutoff {
                if modified_before(&path, cutoff) {
                    continue;
                }
            }
            if let Err(err) =
                read_records(&path, cutoff, &self.pricing, &mut seen, &mut records)
            {
                tracing::warn!(error = %err, path = %path.display(), "failed to read usage file");
            }
        }

        tracing::debug!(count = records.len(), hours_back, "loaded usage records");
        Ok(records)
    }
}

fn read_records(
    path: &Path,
    cutoff: Option<DateTime<Utc>>,
    pricing: &PricingConfig,
    seen: &mut HashSet<String>,
    out: &mut Vec<UsageRecord>,
) -> Result<()> {
    let file = File::open(path)
        .with_context(|| format!("failed to open usage file {}", path.display()))?;
    let reader = BufReader::new(file);

    for line in reader.split(b'\n') {
        let line = line.with_context(|| "failed to read usage file line")?;
        // Non-UTF-8 lines are skipped like malformed JSON.
        let Ok(line) = std::str::from_utf8(&line) else {
            continue;
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let Ok(value) = serde_json::from_str::<Value>(line) else {
            continue;
        };
        let Some(record) = parse_record(&value, pricing) else {
            continue;
        };
        if cutoff.is_some_and(|cutoff| record.timestamp < cutoff) {
            continue;
        }
        if !record.message_id.is_empty() && !record.request_id.is_empty() {
            let key = format!("{}:{}", record.message_id, record.request_id);
            if !seen.insert(key) {
                continue;
            }
        }
        out.push(record);
    }

    Ok(())
}

fn parse_record(value: &Value, pricing: &PricingConfig) -> Option<UsageRecord> {
    let timestamp = value
        .get("timestamp")
        .and_then(|v| v.as_str())
        .and_then(parse_timestamp)?;
    let message = value.get("message");
    let usage = message
        .and_then(|m| m.get("usage"))
        .or_else(|| value.get("usage"))?;

    let input_tokens = token_field(usage, "input_tokens");
    let output_tokens = token_field(usage, "output_tokens");
    let cache_creation_tokens = token_field(usage, "cache_creation_input_tokens");
    let cache_read_tokens = token_field(usage, "cache_read_input_tokens");
    if input_tokens == 0 && output_tokens == 0 && cache_creation_tokens == 0 && cache_read_tokens == 0
    {
        return None;
    }

    let model = message
        .and_then(|m| m.get("model"))
        .or_else(|| value.get("model"))
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string();
    let message_id = message
        .and_then(|m| m.get("id"))
        .or_else(|| value.get("message_id"))
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string();
    let request_id = value
        .get("requestId")
        .or_else(|| value.get("request_id"))
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string();

    let mut record = UsageRecord {
        timestamp,
        input_tokens,
        output_tokens,
        cache_creation_tokens,
        cache_read_tokens,
        cost_usd: 0.0,
        model,
        message_id,
        request_id,
    };
    record.cost_usd = value
        .get("costUSD")
        .and_then(|v| v.as_f64())
        .unwrap_or_else(|| estimate_cost(&record, pricing));
    Some(record)
}

fn token_field(usage: &Value, key: &str) -> u64 {
    usage.get(key).and_then(|v| v.as_u64()).unwrap_or(0)
}

fn estimate_cost(record: &UsageRecord, pricing: &PricingConfig) -> f64 {
    let Some(rates) = pricing.rates_for(&record.model) else {
        return 0.0;
    };
    (record.input_tokens as f64 * rates.input_per_1m
        + record.output_tokens as f64 * rates.output_per_1m
        + record.cache_creation_tokens as f64 * rates.cache_creation_per_1m
        + record.cache_read_tokens as f64 * rates.cache_read_per_1m)
        / 1_000_000.0
}

fn modified_before(path: &Path, cutoff: DateTime<Utc>) -> bool {
    let Ok(modified) = path.metadata().and_then(|meta| meta.modified()) else {
        return false;
    };
    let cutoff: SystemTime = cutoff.into();
    modified < cutoff
}

fn collect_jsonl_files(root: &Path, out: &mut Vec<PathBuf>) -> Result<()> {
    let mut stack = vec![root.to_path_buf()];
    while let Some(path) = stack.pop() {
        let entries = match path.read_dir() {
            Ok(entries) => entries,
            Err(err) => {
                tracing::warn!(error = %err, path = %path.display(), "failed to read usage directory");
                continue;
            }
        };
        for entry in entries {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    tracing::warn!(error = %err, "failed to read directory entry");
                    continue;
                }
            };
            let path = entry.path();
            if path.is_dir() {
                stack.push(path);
                continue;
            }
            if path.extension().and_then(|ext| ext.to_str()) == Some("jsonl") {
                out.push(path);
            }
        }
    }
    Ok(())
}

pub(crate) fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}
