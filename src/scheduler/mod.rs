//! # Adaptive device scheduling
//!
//! Decides which inference device should receive a unit of work and keeps
//! queued work balanced across the pool over time. Inference itself, and
//! ownership of the work items, stay with the caller.
//!
//! ## Components
//!
//! - [`registry`] per-device TPS, rank, capacity and the online set
//! - [`classifier`] heuristic request cost with a bounded FIFO cache
//! - [`estimator`] queue-depth completion estimates and completion history
//! - [`routing`] power-of-two, greedy and complexity-tiered selection
//! - [`stealing`] periodic and reactive work stealing
//! - [`health`] queue health and rebalance reporting
//!
//! ## Flow
//!
//! ```text
//!   caller ──► analyze_question ──► select_best_device ──► push onto queue
//!     │                                                         │
//!     ├── record_completion / update_average_tokens             │
//!     ├── mark_offline / mark_online                            ▼
//!     └── try_steal_work (queue drained) ◄──── rebalance timer (every tick)
//! ```
//!
//! [`AdaptiveRouter`] owns one of each component. Instances are independent;
//! there is no global state.

pub mod classifier;
pub mod estimator;
pub mod health;
pub mod queues;
pub mod registry;
pub mod routing;
pub mod stealing;

pub use classifier::{Complexity, ComplexityClassification, ComplexityClassifier, QuestionKind};
pub use estimator::{CompletionHistory, CompletionSample, CompletionTimeEstimator};
pub use health::{QueueHealth, QueueStatus, RebalanceStats};
pub use queues::{DeviceQueues, QueueProcessor};
pub use registry::{capacity_for, DeviceBenchmark, DeviceRecord, DeviceRegistry, MetricsSummary};
pub use routing::{RoutingContext, RoutingPolicy};
pub use stealing::{StealMove, WorkStealingScheduler};

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use rand::rngs::SmallRng;
use rand::{RngCore, SeedableRng};
use tracing::{debug, info};

use crate::config::RouterConfig;

/// Default tokens/second that make up one queue slot
pub const DEFAULT_TPS_PER_PERSON: f64 = 100.0;

type SharedRng = Box<dyn RngCore + Send>;

/// Adaptive request router and work-stealing scheduler
pub struct AdaptiveRouter {
    registry: RwLock<DeviceRegistry>,
    classifier: Mutex<ComplexityClassifier>,
    estimator: RwLock<CompletionTimeEstimator>,
    history: Mutex<CompletionHistory>,
    stealer: WorkStealingScheduler,
    rng: Mutex<SharedRng>,
    greedy: AtomicBool,
    power_of_two: AtomicBool,
}

impl Default for AdaptiveRouter {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for AdaptiveRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdaptiveRouter")
            .field("policy", &self.policy())
            .field("stealer", &self.stealer)
            .finish_non_exhaustive()
    }
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl AdaptiveRouter {
    /// Create a router with default settings and no devices
    pub fn new() -> Self {
        let policy = RoutingPolicy::default();
        Self {
            registry: RwLock::new(DeviceRegistry::default()),
            classifier: Mutex::new(ComplexityClassifier::default()),
            estimator: RwLock::new(CompletionTimeEstimator::default()),
            history: Mutex::new(CompletionHistory::default()),
            stealer: WorkStealingScheduler::default(),
            rng: Mutex::new(Box::new(SmallRng::from_entropy())),
            greedy: AtomicBool::new(policy.greedy),
            power_of_two: AtomicBool::new(policy.power_of_two),
        }
    }

    /// Build a router from a validated configuration and load its devices
    pub fn from_config(config: &RouterConfig) -> Self {
        let rng: SharedRng = match config.rng_seed {
            Some(seed) => Box::new(SmallRng::seed_from_u64(seed)),
            None => Box::new(SmallRng::from_entropy()),
        };
        let router = Self {
            registry: RwLock::new(DeviceRegistry::new(config.tps_per_person)),
            classifier: Mutex::new(ComplexityClassifier::new(config.classifier.cache_size)),
            estimator: RwLock::new(CompletionTimeEstimator::new(
                config.estimator.alpha,
                config.estimator.initial_average_tokens,
            )),
            history: Mutex::new(CompletionHistory::new(config.estimator.history_window)),
            stealer: WorkStealingScheduler::new(
                config.rebalancing.enabled,
                Duration::from_millis(config.rebalancing.interval_ms),
                config.rebalancing.steal_threshold,
            ),
            rng: Mutex::new(rng),
            greedy: AtomicBool::new(config.greedy),
            power_of_two: AtomicBool::new(config.power_of_two),
        };
        if !config.devices.is_empty() {
            router.update_device_metrics(&config.devices);
        }
        router
    }

    /// Replace the sampling source used by power-of-two routing
    pub fn with_rng<R: RngCore + Send + 'static>(self, rng: R) -> Self {
        *lock(&self.rng) = Box::new(rng);
        self
    }

    // =========================================================================
    // Device registry
    // =========================================================================

    /// Replace all device records from a fresh benchmark
    pub fn update_device_metrics(&self, devices: &[DeviceBenchmark]) -> MetricsSummary {
        write(&self.registry).update_device_metrics(devices)
    }

    pub fn can_accept_request(&self, base: &str, current_queue_size: usize) -> bool {
        read(&self.registry).can_accept_request(base, current_queue_size)
    }

    /// Take a device out of rotation after a failure
    pub fn mark_offline(&self, base: &str) -> bool {
        write(&self.registry).mark_offline(base)
    }

    /// Return a device to rotation; its rank stays as last benchmarked
    pub fn mark_online(&self, base: &str, tps: f64) -> bool {
        write(&self.registry).mark_online(base, tps)
    }

    pub fn set_tps_per_person(&self, ratio: f64) {
        write(&self.registry).set_tps_per_person(ratio);
    }

    pub fn is_online(&self, base: &str) -> bool {
        read(&self.registry).is_online(base)
    }

    /// Online devices, fastest first
    pub fn online_devices(&self) -> Vec<DeviceRecord> {
        read(&self.registry)
            .online_devices()
            .into_iter()
            .cloned()
            .collect()
    }

    pub fn device(&self, base: &str) -> Option<DeviceRecord> {
        read(&self.registry).get(base).cloned()
    }

    // =========================================================================
    // Classification and estimation
    // =========================================================================

    pub fn analyze_question(&self, text: &str) -> ComplexityClassification {
        lock(&self.classifier).analyze_question(text)
    }

    /// Expected seconds for `estimated_tokens` behind `queue_size` items on `base`
    pub fn estimate_completion_time(
        &self,
        base: &str,
        queue_size: usize,
        estimated_tokens: f64,
    ) -> f64 {
        let tps = read(&self.registry).tps(base);
        read(&self.estimator).estimate(tps, queue_size, estimated_tokens)
    }

    pub fn update_average_tokens(&self, actual_tokens: f64) {
        write(&self.estimator).update_average_tokens(actual_tokens);
    }

    pub fn average_tokens(&self) -> f64 {
        read(&self.estimator).average_tokens()
    }

    pub fn record_completion(&self, base: &str, duration_ms: f64) {
        lock(&self.history).record(base, duration_ms);
        debug!("Recorded completion on {} ({:.0}ms)", base, duration_ms);
    }

    // =========================================================================
    // Routing
    // =========================================================================

    pub fn policy(&self) -> RoutingPolicy {
        RoutingPolicy {
            power_of_two: self.power_of_two.load(Ordering::SeqCst),
            greedy: self.greedy.load(Ordering::SeqCst),
        }
    }

    pub fn set_greedy_mode(&self, enabled: bool) {
        self.greedy.store(enabled, Ordering::SeqCst);
        info!("Greedy routing {}", if enabled { "enabled" } else { "disabled" });
    }

    pub fn set_power_of_two_mode(&self, enabled: bool) {
        self.power_of_two.store(enabled, Ordering::SeqCst);
        info!(
            "Power-of-two routing {}",
            if enabled { "enabled" } else { "disabled" }
        );
    }

    /// Pick a device for the next request.
    ///
    /// `queues` holds current queue lengths and `busy` marks devices that are
    /// mid-inference. Returns `None` only when no device is online; the
    /// caller should then hold or reject the request.
    pub fn select_best_device(
        &self,
        queues: &HashMap<String, usize>,
        busy: &HashMap<String, bool>,
        question: Option<&str>,
    ) -> Option<String> {
        let classification = question.map(|q| self.analyze_question(q));
        let policy = self.policy();

        let registry = read(&self.registry);
        let estimator = read(&self.estimator);
        let ctx = RoutingContext::new(&registry, &estimator, queues, busy);
        let mut rng = lock(&self.rng);

        routing::select_device(&ctx, policy, classification.as_ref(), &mut *rng)
    }

    // =========================================================================
    // Work stealing
    // =========================================================================

    pub fn set_rebalancing_enabled(&self, enabled: bool) {
        self.stealer.set_enabled(enabled);
    }

    pub fn set_steal_threshold(&self, threshold: usize) {
        self.stealer.set_threshold(threshold);
    }

    pub fn set_rebalance_interval(&self, interval: Duration) {
        self.stealer.set_interval(interval);
    }

    pub fn stealer(&self) -> &WorkStealingScheduler {
        &self.stealer
    }

    /// Run one periodic rebalance pass now. Returns the number of moves.
    ///
    /// `processor` runs for each target after all locks are released.
    pub fn rebalance_queues<T>(
        &self,
        queues: &DeviceQueues<T>,
        processor: &dyn QueueProcessor,
    ) -> usize {
        let moves = {
            let registry = read(&self.registry);
            self.stealer.rebalance_pass(&registry, queues)
        };
        for m in &moves {
            processor.process_queue(&m.to);
        }
        moves.len()
    }

    /// Pull one item onto `idle` from the busiest other device.
    ///
    /// Returns whether anything moved; `processor` runs only if it did.
    pub fn try_steal_work<T>(
        &self,
        idle: &str,
        queues: &DeviceQueues<T>,
        processor: &dyn QueueProcessor,
    ) -> bool {
        let moved = {
            let registry = read(&self.registry);
            self.stealer.steal_for(&registry, idle, queues)
        };
        match moved {
            Some(m) => {
                processor.process_queue(&m.to);
                true
            }
            None => false,
        }
    }

    /// Start periodic rebalancing of `queues`, replacing any running timer.
    ///
    /// The timer holds only a weak reference, so dropping the last router
    /// handle ends it. `processor` runs on tokio's blocking pool and is not
    /// awaited. Returns `false` outside a tokio runtime.
    pub fn start_rebalancing<T>(
        self: &Arc<Self>,
        queues: DeviceQueues<T>,
        processor: Arc<dyn QueueProcessor>,
    ) -> bool
    where
        T: Send + 'static,
    {
        let router = Arc::downgrade(self);
        self.stealer.start(move || match router.upgrade() {
            Some(router) => {
                let moves = {
                    let registry = read(&router.registry);
                    router.stealer.rebalance_pass(&registry, &queues)
                };
                // Off the timer task, so a slow processor cannot stall ticks
                for m in moves {
                    let processor = Arc::clone(&processor);
                    tokio::task::spawn_blocking(move || processor.process_queue(&m.to));
                }
                true
            }
            None => false,
        })
    }

    /// Stop periodic rebalancing; a no-op when not running
    pub fn stop_rebalancing(&self) {
        self.stealer.stop();
    }

    pub fn is_rebalancing(&self) -> bool {
        self.stealer.is_running()
    }

    // =========================================================================
    // Observability
    // =========================================================================

    pub fn queue_health(&self, queues: &HashMap<String, usize>) -> BTreeMap<String, QueueHealth> {
        health::queue_health(&read(&self.registry), queues)
    }

    pub fn total_capacity(&self) -> usize {
        read(&self.registry).total_capacity()
    }

    pub fn can_handle_load(&self, queues: &HashMap<String, usize>, additional: usize) -> bool {
        health::can_handle_load(&read(&self.registry), queues, additional)
    }

    pub fn rebalance_stats(
        &self,
        queues: &HashMap<String, usize>,
    ) -> BTreeMap<String, RebalanceStats> {
        let registry = read(&self.registry);
        let history = lock(&self.history);
        let estimator = read(&self.estimator);
        health::rebalance_stats(&registry, &history, &estimator, queues)
    }

    pub fn metrics_summary(&self) -> MetricsSummary {
        read(&self.registry).summary()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn router() -> AdaptiveRouter {
        let router = AdaptiveRouter::new().with_rng(SmallRng::seed_from_u64(9));
        router.update_device_metrics(&[
            DeviceBenchmark::new("a", 400.0),
            DeviceBenchmark::new("b", 200.0),
            DeviceBenchmark::new("c", 100.0),
        ]);
        router
    }

    fn counting_processor() -> (Arc<AtomicUsize>, impl Fn(&str) + Send + Sync) {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        (calls, move |_: &str| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn test_instances_are_independent() {
        let first = router();
        let second = AdaptiveRouter::new();

        first.update_average_tokens(500.0);
        assert_eq!(second.average_tokens(), estimator::DEFAULT_AVERAGE_TOKENS);
        assert_eq!(second.total_capacity(), 0);
        assert_eq!(first.total_capacity(), 7);
    }

    #[test]
    fn test_select_with_no_devices() {
        let router = AdaptiveRouter::new();
        let choice = router.select_best_device(&HashMap::new(), &HashMap::new(), Some("hi"));
        assert!(choice.is_none());
    }

    #[test]
    fn test_mark_offline_removes_from_routing() {
        let router = router();
        router.set_greedy_mode(false);
        router.mark_offline("a");

        let choice = router.select_best_device(
            &HashMap::new(),
            &HashMap::new(),
            Some("Explain why the sky is blue"),
        );
        assert_eq!(choice.as_deref(), Some("b"));
        assert!(!router.can_accept_request("a", 0));
    }

    #[test]
    fn test_power_of_two_mode_routes_under_capacity() {
        let router = router();
        router.set_power_of_two_mode(true);
        let queues: HashMap<String, usize> =
            [("a".to_string(), 4), ("b".to_string(), 2)].into_iter().collect();

        for _ in 0..20 {
            let choice = router.select_best_device(&queues, &HashMap::new(), Some("Is it on?"));
            assert_eq!(choice.as_deref(), Some("c"));
        }
    }

    #[test]
    fn test_estimate_uses_running_average() {
        let router = router();
        assert_eq!(router.estimate_completion_time("a", 2, 100.0), 0.5);

        router.update_average_tokens(150.0);
        // avg = 80; 2 * 80 / 400 + 100 / 400
        assert!((router.estimate_completion_time("a", 2, 100.0) - 0.65).abs() < 1e-9);
        assert!(router.estimate_completion_time("unknown", 0, 1.0).is_infinite());
    }

    #[test]
    fn test_try_steal_invokes_processor() {
        let router = router();
        let queues = DeviceQueues::new();
        queues.push("a", 1u32);
        queues.push("a", 2u32);
        let (calls, processor) = counting_processor();

        assert!(router.try_steal_work("c", &queues, &processor));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(queues.snapshot("c"), vec![2]);

        // c is no longer empty, so it cannot steal again
        assert!(!router.try_steal_work("c", &queues, &processor));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_try_steal_no_donor_no_mutation() {
        let router = router();
        let queues: DeviceQueues<u32> = DeviceQueues::new();
        let (calls, processor) = counting_processor();

        assert!(!router.try_steal_work("b", &queues, &processor));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(queues.total_len(), 0);
    }

    #[test]
    fn test_rebalance_queues_reports_moves() {
        let router = router();
        let queues = DeviceQueues::new();
        for i in 0..4u32 {
            queues.push("a", i);
        }
        let (calls, processor) = counting_processor();

        assert_eq!(router.rebalance_queues(&queues, &processor), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(queues.len("a"), 2);
    }

    #[test]
    fn test_rebalance_stats_use_history() {
        let router = router();
        router.record_completion("a", 100.0);
        router.record_completion("a", 300.0);

        let stats = router.rebalance_stats(&HashMap::new());
        assert_eq!(stats["a"].avg_completion_ms, 200.0);
        assert_eq!(stats["b"].avg_completion_ms, 250.0);
    }

    #[tokio::test]
    async fn test_background_rebalancing() {
        let router = Arc::new(router());
        router.set_rebalance_interval(Duration::from_millis(10));
        let queues = DeviceQueues::new();
        for i in 0..6u32 {
            queues.push("a", i);
        }
        let (calls, processor) = counting_processor();

        assert!(router.start_rebalancing(queues.clone(), Arc::new(processor)));
        assert!(router.is_rebalancing());
        tokio::time::sleep(Duration::from_millis(60)).await;
        router.stop_rebalancing();
        router.stop_rebalancing();

        assert!(!router.is_rebalancing());
        assert_eq!(queues.len("b"), 1);
        assert_eq!(queues.len("c"), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_background_processor_runs_off_timer_task() {
        let router = Arc::new(router());
        router.set_rebalance_interval(Duration::from_millis(10));
        let queues = DeviceQueues::new();
        for i in 0..4u32 {
            queues.push("a", i);
        }

        let threads = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&threads);
        let processor = move |_: &str| {
            lock(&seen).push(std::thread::current().id());
        };

        assert!(router.start_rebalancing(queues, Arc::new(processor)));
        tokio::time::sleep(Duration::from_millis(60)).await;
        router.stop_rebalancing();

        // The current-thread runtime drives the timer on this thread
        let here = std::thread::current().id();
        let threads = lock(&threads);
        assert_eq!(threads.len(), 2);
        assert!(threads.iter().all(|id| *id != here));
    }
}
