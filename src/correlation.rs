//! Joins timing records with daemon samples into per-function summaries
//!
//! Correlation is enrichment, never a precondition: with no samples
//! available the summaries still carry full timing aggregates and leave
//! the metrics fields unset. Pairing uses the sample nearest each
//! record's temporal midpoint, over one metrics window per summary
//! computation.

use crate::daemon_client::SystemMetrics;
use crate::timing::{CallStatus, TimingRecord};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Aggregated, metrics-enriched statistics for one function label
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CorrelatedSummary {
    pub function_name: String,
    pub count: u64,
    pub error_count: u64,
    /// Seconds, summed over all calls
    pub total_duration: f64,
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    /// Mean CPU load over the samples paired with this function's calls
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avg_cpu_percent: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avg_memory_percent: Option<f64>,
    /// Sample paired with the function's most recent call
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_known_system_metrics: Option<SystemMetrics>,
}

struct Accumulator {
    count: u64,
    error_count: u64,
    total_duration: f64,
    min: f64,
    max: f64,
    cpu_sum: f64,
    memory_sum: f64,
    paired: u64,
    latest_end_ts: f64,
    latest_sample: Option<SystemMetrics>,
}

impl Accumulator {
    fn new() -> Self {
        Accumulator {
            count: 0,
            error_count: 0,
            total_duration: 0.0,
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
            cpu_sum: 0.0,
            memory_sum: 0.0,
            paired: 0,
            latest_end_ts: f64::NEG_INFINITY,
            latest_sample: None,
        }
    }

    fn finish(self, function_name: String) -> CorrelatedSummary {
        let count = self.count.max(1);
        CorrelatedSummary {
            function_name,
            count: self.count,
            error_count: self.error_count,
            total_duration: self.total_duration,
            min: if self.min.is_finite() { self.min } else { 0.0 },
            max: if self.max.is_finite() { self.max } else { 0.0 },
            mean: self.total_duration / count as f64,
            avg_cpu_percent: (self.paired > 0).then(|| self.cpu_sum / self.paired as f64),
            avg_memory_percent: (self.paired > 0).then(|| self.memory_sum / self.paired as f64),
            last_known_system_metrics: self.latest_sample,
        }
    }
}

/// Sample whose timestamp is nearest `instant`
///
/// Over ascending input, equidistant candidates resolve to the earlier
/// sample; the choice is deterministic either way.
pub fn nearest_sample(metrics: &[SystemMetrics], instant: f64) -> Option<&SystemMetrics> {
    let mut best: Option<(&SystemMetrics, f64)> = None;
    for sample in metrics {
        let distance = (sample.timestamp - instant).abs();
        match best {
            Some((_, best_distance)) if distance >= best_distance => {}
            _ => best = Some((sample, distance)),
        }
    }
    best.map(|(sample, _)| sample)
}

/// Build per-function summaries from buffered records and one metrics
/// window
pub fn correlate(
    records: &[TimingRecord],
    metrics: &[SystemMetrics],
) -> BTreeMap<String, CorrelatedSummary> {
    let mut window = metrics.to_vec();
    window.sort_by(|a, b| a.timestamp.total_cmp(&b.timestamp));

    let mut accumulators: BTreeMap<String, Accumulator> = BTreeMap::new();
    for record in records {
        let acc = accumulators
            .entry(record.function_name.clone())
            .or_insert_with(Accumulator::new);
        acc.count += 1;
        if record.status == CallStatus::Error {
            acc.error_count += 1;
        }
        acc.total_duration += record.duration;
        acc.min = acc.min.min(record.duration);
        acc.max = acc.max.max(record.duration);

        if let Some(sample) = nearest_sample(&window, record.midpoint()) {
            acc.cpu_sum += sample.cpu_percent;
            acc.memory_sum += sample.memory_percent;
            acc.paired += 1;
            if record.end_ts >= acc.latest_end_ts {
                acc.latest_end_ts = record.end_ts;
                acc.latest_sample = Some(sample.clone());
            }
        }
    }

    accumulators
        .into_iter()
        .map(|(name, acc)| {
            let summary = acc.finish(name.clone());
            (name, summary)
        })
        .collect()
}
