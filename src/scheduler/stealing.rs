//! Work stealing between device queues
//!
//! Two entry points move queued work from overloaded devices to idle ones:
//!
//! - a periodic pass, run on a timer, that gives every idle device at most
//!   one item from the busiest remaining donor
//! - a reactive steal, run by the caller the moment a device drains, so it
//!   does not wait up to a full tick for work
//!
//! Both take the donor's most recently enqueued item so entries already near
//! the front of a queue keep their place.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::queues::{steal_tail, DeviceQueues};
use super::registry::DeviceRegistry;

/// Default period between rebalance passes
pub const DEFAULT_REBALANCE_INTERVAL_MS: u64 = 500;

/// Default minimum queue length for a device to donate work
pub const DEFAULT_STEAL_THRESHOLD: usize = 1;

/// One relocated queue entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StealMove {
    pub from: String,
    pub to: String,
}

/// Running timer task and the channel that stops it
struct RebalanceTimer {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Rebalancer settings and the periodic timer
pub struct WorkStealingScheduler {
    enabled: AtomicBool,
    interval_ms: Arc<AtomicU64>,
    threshold: AtomicUsize,
    timer: Mutex<Option<RebalanceTimer>>,
}

impl Default for WorkStealingScheduler {
    fn default() -> Self {
        Self::new(
            true,
            Duration::from_millis(DEFAULT_REBALANCE_INTERVAL_MS),
            DEFAULT_STEAL_THRESHOLD,
        )
    }
}

impl std::fmt::Debug for WorkStealingScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkStealingScheduler")
            .field("enabled", &self.is_enabled())
            .field("interval", &self.interval())
            .field("threshold", &self.threshold())
            .field("running", &self.is_running())
            .finish()
    }
}

impl WorkStealingScheduler {
    pub fn new(enabled: bool, interval: Duration, threshold: usize) -> Self {
        Self {
            enabled: AtomicBool::new(enabled),
            interval_ms: Arc::new(AtomicU64::new((interval.as_millis() as u64).max(1))),
            threshold: AtomicUsize::new(threshold.max(1)),
            timer: Mutex::new(None),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
        info!("Work stealing {}", if enabled { "enabled" } else { "disabled" });
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms.load(Ordering::SeqCst))
    }

    /// Change the tick period; a running timer picks it up on its next tick
    pub fn set_interval(&self, interval: Duration) {
        let ms = interval.as_millis() as u64;
        if ms == 0 {
            warn!("Ignoring zero rebalance interval");
            return;
        }
        self.interval_ms.store(ms, Ordering::SeqCst);
    }

    pub fn threshold(&self) -> usize {
        self.threshold.load(Ordering::SeqCst)
    }

    pub fn set_threshold(&self, threshold: usize) {
        if threshold == 0 {
            warn!("Ignoring zero steal threshold");
            return;
        }
        self.threshold.store(threshold, Ordering::SeqCst);
    }

    /// Run one periodic pass over the queues.
    ///
    /// Idle devices are visited in rank order; each takes one item from the
    /// donor that is busiest at that moment. Donors are the devices at or
    /// above the threshold when the pass started.
    pub fn rebalance_pass<T>(
        &self,
        registry: &DeviceRegistry,
        queues: &DeviceQueues<T>,
    ) -> Vec<StealMove> {
        if !self.is_enabled() || registry.online_count() < 2 {
            return Vec::new();
        }
        let threshold = self.threshold();
        let mut map = queues.lock();
        plan_and_apply(registry, &mut map, threshold)
    }

    /// Give `idle` the newest item of the busiest other online device.
    ///
    /// Nothing moves unless `idle` is online with an empty queue and some
    /// other online device has work queued.
    pub fn steal_for<T>(
        &self,
        registry: &DeviceRegistry,
        idle: &str,
        queues: &DeviceQueues<T>,
    ) -> Option<StealMove> {
        if !self.is_enabled() || !registry.is_online(idle) {
            return None;
        }

        let mut map = queues.lock();
        if queue_len(&map, idle) > 0 {
            return None;
        }

        let mut donor: Option<(&str, usize)> = None;
        for record in registry.online_devices() {
            if record.base == idle {
                continue;
            }
            let len = queue_len(&map, &record.base);
            if len >= 1 && donor.map(|(_, best)| len > best).unwrap_or(true) {
                donor = Some((record.base.as_str(), len));
            }
        }

        let (from, len) = donor?;
        if !steal_tail(&mut map, from, idle) {
            return None;
        }
        debug!("Reactive steal: {} (queue {}) -> {}", from, len, idle);
        Some(StealMove {
            from: from.to_string(),
            to: idle.to_string(),
        })
    }

    /// Start the periodic timer, replacing any timer already running.
    ///
    /// `tick` runs once per interval; returning `false` ends the loop.
    /// Returns `false` when called outside a tokio runtime.
    pub fn start<F>(&self, mut tick: F) -> bool
    where
        F: FnMut() -> bool + Send + 'static,
    {
        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(_) => {
                warn!("Cannot start rebalancing outside a tokio runtime");
                return false;
            }
        };

        // One guard across replace and store so concurrent starts cannot
        // orphan a running timer
        let mut timer = self.lock_timer();
        if let Some(previous) = timer.take() {
            let _ = previous.shutdown.send(true);
            debug!("Replacing running rebalance timer");
        }

        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let interval_ms = Arc::clone(&self.interval_ms);

        let handle = runtime.spawn(async move {
            info!(
                "Starting rebalancer: interval={}ms",
                interval_ms.load(Ordering::SeqCst)
            );
            loop {
                let interval = Duration::from_millis(interval_ms.load(Ordering::SeqCst));
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {
                        if !tick() {
                            debug!("Rebalancer owner dropped, stopping");
                            break;
                        }
                    }
                    changed = shutdown_rx.changed() => {
                        // A dropped sender means nobody can stop us later
                        if changed.is_err() || *shutdown_rx.borrow() {
                            info!("Rebalancer shutting down");
                            break;
                        }
                    }
                }
            }
        });

        *timer = Some(RebalanceTimer {
            shutdown: shutdown_tx,
            handle,
        });
        true
    }

    /// Stop the periodic timer. Safe to call repeatedly or before `start`.
    pub fn stop(&self) {
        if let Some(timer) = self.lock_timer().take() {
            // The task may already have exited on its own
            let _ = timer.shutdown.send(true);
            debug!("Rebalance timer stop requested");
        }
    }

    /// Whether a timer task is live
    pub fn is_running(&self) -> bool {
        self.lock_timer()
            .as_ref()
            .map(|t| !t.handle.is_finished())
            .unwrap_or(false)
    }

    fn lock_timer(&self) -> std::sync::MutexGuard<'_, Option<RebalanceTimer>> {
        self.timer.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Drop for WorkStealingScheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

fn queue_len<T>(map: &HashMap<String, VecDeque<T>>, device: &str) -> usize {
    map.get(device).map(|q| q.len()).unwrap_or(0)
}

/// Compute and apply one rebalance pass on a locked queue map
fn plan_and_apply<T>(
    registry: &DeviceRegistry,
    map: &mut HashMap<String, VecDeque<T>>,
    threshold: usize,
) -> Vec<StealMove> {
    let online = registry.online_devices();

    let idle: Vec<&str> = online
        .iter()
        .filter(|r| r.tps > 0.0 && queue_len(map, &r.base) == 0)
        .map(|r| r.base.as_str())
        .collect();

    // (device, remaining queue length), busiest first
    let mut donors: Vec<(&str, usize)> = online
        .iter()
        .map(|r| (r.base.as_str(), queue_len(map, &r.base)))
        .filter(|(_, len)| *len >= threshold)
        .collect();
    donors.sort_by(|a, b| b.1.cmp(&a.1));

    let mut moves = Vec::new();
    for target in idle {
        let busiest = donors
            .iter_mut()
            .filter(|(_, len)| *len >= threshold && *len > 0)
            .fold(None::<&mut (&str, usize)>, |best, candidate| match best {
                Some(b) if b.1 >= candidate.1 => Some(b),
                _ => Some(candidate),
            });

        let donor = match busiest {
            Some(donor) => donor,
            None => break,
        };

        if steal_tail(map, donor.0, target) {
            debug!("Rebalance: {} (queue {}) -> {}", donor.0, donor.1, target);
            donor.1 -= 1;
            moves.push(StealMove {
                from: donor.0.to_string(),
                to: target.to_string(),
            });
        }
    }

    if !moves.is_empty() {
        info!("Rebalance pass moved {} item(s)", moves.len());
    }
    moves
}
