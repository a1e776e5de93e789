//! End-to-end routing and rebalancing tests
//!
//! These drive the router the way a serving layer would: load a config from
//! disk, route questions onto shared queues, and let work stealing even them
//! out.

use std::collections::HashMap;
use std::io::Write;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tempfile::Builder;
use tokio::time::sleep;

use tps_router::config::load_config_file;
use tps_router::scheduler::{AdaptiveRouter, DeviceBenchmark, DeviceQueues, QueueProcessor};

const CONFIG: &str = r#"
tps-per-person: 100
greedy: false
rng-seed: 42
rebalancing:
  interval-ms: 10
devices:
  - base: http://gpu-c:8000
    tps: 100
  - base: http://gpu-a:8000
    tps: 400
  - base: http://gpu-b:8000
    tps: 200
"#;

const A: &str = "http://gpu-a:8000";
const B: &str = "http://gpu-b:8000";
const C: &str = "http://gpu-c:8000";

fn router_from_config() -> AdaptiveRouter {
    let mut file = Builder::new().suffix(".yaml").tempfile().unwrap();
    file.write_all(CONFIG.as_bytes()).unwrap();
    let config = load_config_file(file.path()).unwrap();
    AdaptiveRouter::from_config(&config)
}

fn idle() -> (HashMap<String, usize>, HashMap<String, bool>) {
    (HashMap::new(), HashMap::new())
}

/// Counts how often each device was told to look at its queue
#[derive(Default)]
struct CountingProcessor {
    calls: AtomicUsize,
}

impl QueueProcessor for CountingProcessor {
    fn process_queue(&self, _device: &str) {
        self.calls.fetch_add(1, Ordering::SeqCst);
    }
}

#[test]
fn test_config_drives_capacities_and_ranks() {
    let router = router_from_config();
    let summary = router.metrics_summary();

    assert_eq!(summary.device_count, 3);
    assert_eq!(summary.total_capacity, 7);
    assert_eq!(summary.capacities[A], 4);
    assert_eq!(summary.capacities[B], 2);
    assert_eq!(summary.capacities[C], 1);
    assert_eq!(summary.ranks[A], 1);
    assert_eq!(summary.ranks[B], 2);
    assert_eq!(summary.ranks[C], 3);
}

#[test]
fn test_tiered_routing_by_complexity() {
    let router = router_from_config();
    let (queues, busy) = idle();

    let high = router.select_best_device(
        &queues,
        &busy,
        Some("Explain the tradeoffs between consistency and availability"),
    );
    assert_eq!(high.as_deref(), Some(A));

    let simple = router.select_best_device(&queues, &busy, Some("Is the sky blue?"));
    assert_eq!(simple.as_deref(), Some(C));

    let medium = router.select_best_device(&queues, &busy, Some("calculate 12 * 7"));
    assert_eq!(medium.as_deref(), Some(B));
}

#[test]
fn test_greedy_skips_full_devices() {
    let router = router_from_config();
    router.set_greedy_mode(true);

    let mut queues = HashMap::new();
    queues.insert(A.to_string(), 4);
    let busy = HashMap::new();

    let device = router.select_best_device(&queues, &busy, Some("hello there"));
    assert_eq!(device.as_deref(), Some(B));
}

#[test]
fn test_offline_devices_are_never_chosen() {
    let router = router_from_config();
    let (queues, busy) = idle();

    assert!(router.mark_offline(A));
    let device = router.select_best_device(&queues, &busy, Some("Describe how a compiler works"));
    assert_eq!(device.as_deref(), Some(B));

    router.mark_offline(B);
    router.mark_offline(C);
    assert_eq!(router.select_best_device(&queues, &busy, None), None);

    assert!(router.mark_online(A, 400.0));
    assert_eq!(router.select_best_device(&queues, &busy, None).as_deref(), Some(A));
}

#[test]
fn test_rebalance_spreads_backlog() {
    let router = router_from_config();
    let queues: DeviceQueues<String> = DeviceQueues::new();
    for i in 1..=3 {
        queues.push(A, format!("q{}", i));
    }
    let processor = CountingProcessor::default();

    let moved = router.rebalance_queues(&queues, &processor);

    assert_eq!(moved, 2);
    assert_eq!(processor.calls.load(Ordering::SeqCst), 2);
    assert_eq!(queues.snapshot(A), vec!["q1".to_string()]);
    assert_eq!(queues.snapshot(B), vec!["q3".to_string()]);
    assert_eq!(queues.snapshot(C), vec!["q2".to_string()]);
    assert_eq!(queues.total_len(), 3);
}

#[test]
fn test_reactive_steal_for_idle_device() {
    let router = router_from_config();
    let queues: DeviceQueues<String> = DeviceQueues::new();
    queues.push(A, "first".to_string());
    queues.push(A, "second".to_string());
    let processor = CountingProcessor::default();

    assert!(router.try_steal_work(C, &queues, &processor));
    assert_eq!(queues.snapshot(C), vec!["second".to_string()]);
    assert_eq!(processor.calls.load(Ordering::SeqCst), 1);

    router.set_rebalancing_enabled(false);
    assert!(!router.try_steal_work(B, &queues, &processor));
}

#[tokio::test]
async fn test_background_rebalancing() {
    let router = Arc::new(router_from_config());
    let queues: DeviceQueues<String> = DeviceQueues::new();
    let processor = Arc::new(CountingProcessor::default());

    assert!(router.start_rebalancing(queues.clone(), processor.clone()));
    assert!(router.is_rebalancing());

    queues.push(A, "one".to_string());
    queues.push(A, "two".to_string());
    queues.push(A, "three".to_string());

    sleep(Duration::from_millis(200)).await;

    assert!(processor.calls.load(Ordering::SeqCst) >= 2);
    assert!(!queues.is_empty(B));
    assert!(!queues.is_empty(C));
    assert_eq!(queues.total_len(), 3);

    router.stop_rebalancing();
    sleep(Duration::from_millis(20)).await;
    assert!(!router.is_rebalancing());
}

#[test]
fn test_rebalancing_needs_a_runtime() {
    let router = Arc::new(router_from_config());
    let processor: Arc<dyn QueueProcessor> = Arc::new(CountingProcessor::default());

    assert!(!router.start_rebalancing(DeviceQueues::<String>::new(), processor.clone()));
    assert!(!router.is_rebalancing());

    tokio_test::block_on(async {
        assert!(router.start_rebalancing(DeviceQueues::<String>::new(), processor));
        assert!(router.is_rebalancing());
        router.stop_rebalancing();
    });
    assert!(!router.is_rebalancing());
}

#[test]
fn test_runtime_capacity_changes() {
    let router = AdaptiveRouter::new();
    router.update_device_metrics(&[
        DeviceBenchmark::new("x", 250.0),
        DeviceBenchmark::new("y", 50.0),
    ]);
    assert_eq!(router.total_capacity(), 3);

    router.set_tps_per_person(50.0);
    assert_eq!(router.total_capacity(), 6);

    let mut queues = HashMap::new();
    queues.insert("x".to_string(), 5);
    assert!(router.can_handle_load(&queues, 1));
    assert!(!router.can_handle_load(&queues, 2));
}
