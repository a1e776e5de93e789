//! Queue health and rebalance reporting
//!
//! Read-only views over the registry and the caller's queue lengths, for
//! operators and external monitoring.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use serde::Serialize;

use super::estimator::{CompletionHistory, CompletionTimeEstimator};
use super::registry::DeviceRegistry;

/// Utilization bucket for one device queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QueueStatus {
    Healthy,
    Moderate,
    High,
    AtCapacity,
}

impl QueueStatus {
    /// Bucket a utilization percentage
    pub fn from_utilization(percent: f64) -> Self {
        if percent >= 100.0 {
            QueueStatus::AtCapacity
        } else if percent >= 75.0 {
            QueueStatus::High
        } else if percent >= 50.0 {
            QueueStatus::Moderate
        } else {
            QueueStatus::Healthy
        }
    }
}

impl fmt::Display for QueueStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            QueueStatus::Healthy => "HEALTHY",
            QueueStatus::Moderate => "MODERATE",
            QueueStatus::High => "HIGH",
            QueueStatus::AtCapacity => "AT_CAPACITY",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueHealth {
    pub queue_size: usize,
    pub capacity: usize,
    /// Percent of capacity in use
    pub utilization: f64,
    pub rank: usize,
    pub online: bool,
    pub status: QueueStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RebalanceStats {
    pub queue_size: usize,
    pub avg_completion_ms: f64,
    /// Completed requests per second
    pub processing_rate: f64,
    pub tps: f64,
}

fn utilization(queue_size: usize, capacity: usize) -> f64 {
    match (queue_size, capacity) {
        (0, _) => 0.0,
        (_, 0) => 100.0,
        (q, c) => q as f64 / c as f64 * 100.0,
    }
}

/// Per-device queue health for every known device
pub fn queue_health(
    registry: &DeviceRegistry,
    queues: &HashMap<String, usize>,
) -> BTreeMap<String, QueueHealth> {
    registry
        .devices_by_rank()
        .into_iter()
        .map(|record| {
            let queue_size = queues.get(&record.base).copied().unwrap_or(0);
            let utilization = utilization(queue_size, record.capacity);
            (
                record.base.clone(),
                QueueHealth {
                    queue_size,
                    capacity: record.capacity,
                    utilization,
                    rank: record.rank,
                    online: registry.is_online(&record.base),
                    status: QueueStatus::from_utilization(utilization),
                },
            )
        })
        .collect()
}

/// Whether `additional` more requests fit in the pool right now
pub fn can_handle_load(
    registry: &DeviceRegistry,
    queues: &HashMap<String, usize>,
    additional: usize,
) -> bool {
    let queued: usize = queues.values().sum();
    queued + additional <= registry.total_capacity()
}

/// Per-device throughput statistics used when tuning the rebalancer
pub fn rebalance_stats(
    registry: &DeviceRegistry,
    history: &CompletionHistory,
    estimator: &CompletionTimeEstimator,
    queues: &HashMap<String, usize>,
) -> BTreeMap<String, RebalanceStats> {
    let avg_tokens = estimator.average_tokens();
    registry
        .devices_by_rank()
        .into_iter()
        .map(|record| {
            (
                record.base.clone(),
                RebalanceStats {
                    queue_size: queues.get(&record.base).copied().unwrap_or(0),
                    avg_completion_ms: history.average_completion_ms(
                        &record.base,
                        record.tps,
                        avg_tokens,
                    ),
                    processing_rate: history.processing_rate(&record.base, record.tps, avg_tokens),
                    tps: record.tps,
                },
            )
        })
        .collect()
}

/// Plain-text table of queue health, fastest device first
pub fn format_health_table(health: &BTreeMap<String, QueueHealth>) -> String {
    let mut rows: Vec<(&String, &QueueHealth)> = health.iter().collect();
    rows.sort_by_key(|(_, h)| h.rank);

    let mut output = String::new();
    output.push_str(&format!(
        "{:<4} {:<32} {:>6} {:>8} {:>7}  {}\n",
        "RANK", "DEVICE", "QUEUE", "CAPACITY", "UTIL%", "STATUS"
    ));
    for (device, h) in rows {
        let status = if h.online {
            h.status.to_string()
        } else {
            "OFFLINE".to_string()
        };
        output.push_str(&format!(
            "{:<4} {:<32} {:>6} {:>8} {:>7.1}  {}\n",
            h.rank, device, h.queue_size, h.capacity, h.utilization, status
        ));
    }
    output
}
