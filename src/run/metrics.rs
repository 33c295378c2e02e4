use serde::Serialize;

use crate::run::model::{HealthStatus, RunStatus};

#[derive(Serialize, Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Percentiles {
    pub p50: u64,
    pub p95: u64,
    pub p99: u64,
}

/// Nearest-rank index: `floor(p / 100 * (n - 1))`, clamped to the sample.
pub fn percentile_index(percentile: f64, len: usize) -> usize {
    if len == 0 {
        return 0;
    }
    let last = len - 1;
    let index = ((percentile / 100.0) * last as f64).floor();
    if index <= 0.0 {
        0
    } else {
        (index as usize).min(last)
    }
}

pub fn percentiles(latencies: &[u64]) -> Percentiles {
    if latencies.is_empty() {
        return Percentiles::default();
    }
    let mut sorted = latencies.to_vec();
    sorted.sort_unstable();
    let at = |percentile: f64| sorted[percentile_index(percentile, sorted.len())];
    Percentiles {
        p50: at(50.0),
        p95: at(95.0),
        p99: at(99.0),
    }
}

/// Everything health classification looks at, all of it derived from
/// persisted steps and the collection's critical flags.
#[derive(Clone, Copy, Debug)]
pub struct HealthInput {
    pub status: RunStatus,
    pub executed_steps: u32,
    pub failed_steps: u32,
    pub critical_failures: u32,
    pub p95_ms: u64,
    pub p95_sla_ms: Option<u64>,
}

pub fn classify_health(input: &HealthInput) -> HealthStatus {
    match input.status {
        RunStatus::Timeout => return HealthStatus::Unhealthy,
        RunStatus::Cancelled | RunStatus::Queued | RunStatus::Running => {
            return HealthStatus::Unknown
        }
        _ => {}
    }
    if input.executed_steps == 0 {
        return HealthStatus::Unknown;
    }
    if input.failed_steps > 0 {
        return if input.critical_failures > 0 {
            HealthStatus::Unhealthy
        } else {
            HealthStatus::Degraded
        };
    }
    match input.p95_sla_ms {
        Some(threshold) if input.p95_ms > threshold => HealthStatus::Degraded,
        _ => HealthStatus::Healthy,
    }
}
