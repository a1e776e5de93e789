//! Device registry - throughput, rank, capacity and the online set
//!
//! Every device is identified by its `base` (usually the inference
//! endpoint address). A full benchmark refresh replaces all records and is
//! the only place ranks are assigned. Between refreshes a device can be
//! taken offline on an inference failure or brought back online with a
//! fresh TPS reading; those paths touch a single record and leave ranks as
//! they were.

use std::collections::{BTreeMap, HashMap, HashSet};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::DEFAULT_TPS_PER_PERSON;

/// A single benchmark reading supplied to [`DeviceRegistry::update_device_metrics`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceBenchmark {
    /// Unique device identifier or address
    pub base: String,

    /// Measured tokens per second
    pub tps: f64,
}

impl DeviceBenchmark {
    pub fn new(base: impl Into<String>, tps: f64) -> Self {
        Self {
            base: base.into(),
            tps,
        }
    }
}

/// Registry entry for one device
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceRecord {
    pub base: String,
    pub tps: f64,
    pub capacity: usize,
    /// Dense 1-based rank, lower is faster
    pub rank: usize,
}

/// Result of a full metrics refresh
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSummary {
    pub device_count: usize,
    pub online_count: usize,
    pub total_capacity: usize,
    pub capacities: BTreeMap<String, usize>,
    pub ranks: BTreeMap<String, usize>,
}

/// Derive queue capacity from throughput.
///
/// Any positive TPS yields at least one slot; a non-positive TPS yields none.
pub fn capacity_for(tps: f64, tps_per_person: f64) -> usize {
    if tps > 0.0 && tps.is_finite() {
        ((tps / tps_per_person).floor() as usize).max(1)
    } else {
        0
    }
}

/// Holds per-device throughput, rank, capacity and online membership
#[derive(Debug, Clone)]
pub struct DeviceRegistry {
    /// Records indexed by base
    devices: HashMap<String, DeviceRecord>,

    /// Bases in rank order as of the last full refresh (plus late joiners)
    order: Vec<String>,

    /// Authoritative online membership
    online: HashSet<String>,

    tps_per_person: f64,
}

impl Default for DeviceRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_TPS_PER_PERSON)
    }
}

impl DeviceRegistry {
    /// Create an empty registry with the given capacity ratio
    pub fn new(tps_per_person: f64) -> Self {
        let tps_per_person = if tps_per_person > 0.0 {
            tps_per_person
        } else {
            DEFAULT_TPS_PER_PERSON
        };
        Self {
            devices: HashMap::new(),
            order: Vec::new(),
            online: HashSet::new(),
            tps_per_person,
        }
    }

    /// Replace every record from a fresh benchmark
    pub fn update_device_metrics(&mut self, devices: &[DeviceBenchmark]) -> MetricsSummary {
        let mut sorted: Vec<&DeviceBenchmark> = devices.iter().collect();
        // Stable sort keeps input order among equal TPS
        sorted.sort_by(|a, b| {
            b.tps
                .partial_cmp(&a.tps)
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        self.devices.clear();
        self.order.clear();
        self.online.clear();

        for bench in sorted {
            if self.devices.contains_key(&bench.base) {
                warn!("Duplicate device '{}' in benchmark, keeping first", bench.base);
                continue;
            }
            let tps = if bench.tps.is_finite() {
                bench.tps.max(0.0)
            } else {
                0.0
            };
            let record = DeviceRecord {
                base: bench.base.clone(),
                tps,
                capacity: capacity_for(tps, self.tps_per_person),
                rank: self.order.len() + 1,
            };
            if tps > 0.0 {
                self.online.insert(bench.base.clone());
            }
            self.order.push(bench.base.clone());
            self.devices.insert(bench.base.clone(), record);
        }

        let summary = self.summary();
        info!(
            "Device metrics refreshed: {} devices, {} online, total capacity {}",
            summary.device_count, summary.online_count, summary.total_capacity
        );
        summary
    }

    /// Whether a device with `current_queue_size` queued items can take one more
    pub fn can_accept_request(&self, base: &str, current_queue_size: usize) -> bool {
        current_queue_size < self.capacity(base)
    }

    /// Take a device offline without waiting for the next benchmark.
    ///
    /// Returns `true` if the device was online.
    pub fn mark_offline(&mut self, base: &str) -> bool {
        if !self.online.remove(base) {
            return false;
        }
        if let Some(record) = self.devices.get_mut(base) {
            record.tps = 0.0;
            record.capacity = 0;
        }
        info!("Device {} marked offline", base);
        true
    }

    /// Bring a device back online with a fresh TPS reading.
    ///
    /// Only this device's capacity is recomputed; ranks keep their values
    /// from the last full refresh. Returns `true` if the device transitioned.
    pub fn mark_online(&mut self, base: &str, tps: f64) -> bool {
        if self.online.contains(base) || tps <= 0.0 || !tps.is_finite() {
            return false;
        }

        let capacity = capacity_for(tps, self.tps_per_person);
        match self.devices.get_mut(base) {
            Some(record) => {
                record.tps = tps;
                record.capacity = capacity;
            }
            None => {
                // Unknown until now: slot it behind every ranked device
                let rank = self.order.len() + 1;
                self.devices.insert(
                    base.to_string(),
                    DeviceRecord {
                        base: base.to_string(),
                        tps,
                        capacity,
                        rank,
                    },
                );
                self.order.push(base.to_string());
            }
        }
        self.online.insert(base.to_string());
        info!("Device {} marked online (tps={:.1}, capacity={})", base, tps, capacity);
        true
    }

    /// Change the TPS-per-slot ratio and recompute online capacities
    pub fn set_tps_per_person(&mut self, ratio: f64) {
        if ratio <= 0.0 || !ratio.is_finite() {
            warn!("Ignoring invalid tps-per-person ratio {}", ratio);
            return;
        }
        self.tps_per_person = ratio;
        for base in &self.online {
            if let Some(record) = self.devices.get_mut(base) {
                record.capacity = capacity_for(record.tps, ratio);
            }
        }
        debug!("tps-per-person set to {}", ratio);
    }

    pub fn tps_per_person(&self) -> f64 {
        self.tps_per_person
    }

    pub fn is_online(&self, base: &str) -> bool {
        self.online.contains(base)
    }

    /// Capacity of a device; unknown devices have none
    pub fn capacity(&self, base: &str) -> usize {
        self.devices.get(base).map(|r| r.capacity).unwrap_or(0)
    }

    pub fn tps(&self, base: &str) -> f64 {
        self.devices.get(base).map(|r| r.tps).unwrap_or(0.0)
    }

    pub fn rank(&self, base: &str) -> Option<usize> {
        self.devices.get(base).map(|r| r.rank)
    }

    pub fn get(&self, base: &str) -> Option<&DeviceRecord> {
        self.devices.get(base)
    }

    /// Every known device, fastest first
    pub fn devices_by_rank(&self) -> Vec<&DeviceRecord> {
        let mut records: Vec<&DeviceRecord> = self
            .order
            .iter()
            .filter_map(|base| self.devices.get(base))
            .collect();
        records.sort_by_key(|r| r.rank);
        records
    }

    /// Online devices, fastest first
    pub fn online_devices(&self) -> Vec<&DeviceRecord> {
        self.devices_by_rank()
            .into_iter()
            .filter(|r| self.online.contains(&r.base))
            .collect()
    }

    pub fn online_count(&self) -> usize {
        self.online.len()
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Sum of every device's capacity
    pub fn total_capacity(&self) -> usize {
        self.devices.values().map(|r| r.capacity).sum()
    }

    /// Snapshot of the current registry state
    pub fn summary(&self) -> MetricsSummary {
        MetricsSummary {
            device_count: self.devices.len(),
            online_count: self.online.len(),
            total_capacity: self.total_capacity(),
            capacities: self
                .devices
                .values()
                .map(|r| (r.base.clone(), r.capacity))
                .collect(),
            ranks: self
                .devices
                .values()
                .map(|r| (r.base.clone(), r.rank))
                .collect(),
        }
    }
}
