//! Device selection strategies
//!
//! Every strategy is a pure function over a [`RoutingContext`]: a borrowed
//! view of the registry, the estimator and the caller's queue/busy state.
//! `None` always means "nothing selectable right now"; it is never an error.

use std::collections::HashMap;

use rand::Rng;
use tracing::{debug, warn};

use super::classifier::{Complexity, ComplexityClassification};
use super::estimator::CompletionTimeEstimator;
use super::registry::{DeviceRecord, DeviceRegistry};

/// Which optional strategies `select_device` may try
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoutingPolicy {
    pub power_of_two: bool,
    pub greedy: bool,
}

impl Default for RoutingPolicy {
    fn default() -> Self {
        Self {
            power_of_two: false,
            greedy: true,
        }
    }
}

/// Borrowed state a routing decision reads
pub struct RoutingContext<'a> {
    pub registry: &'a DeviceRegistry,
    pub estimator: &'a CompletionTimeEstimator,
    pub queues: &'a HashMap<String, usize>,
    pub busy: &'a HashMap<String, bool>,
}

impl<'a> RoutingContext<'a> {
    pub fn new(
        registry: &'a DeviceRegistry,
        estimator: &'a CompletionTimeEstimator,
        queues: &'a HashMap<String, usize>,
        busy: &'a HashMap<String, bool>,
    ) -> Self {
        Self {
            registry,
            estimator,
            queues,
            busy,
        }
    }

    pub fn queue_len(&self, base: &str) -> usize {
        self.queues.get(base).copied().unwrap_or(0)
    }

    pub fn is_busy(&self, base: &str) -> bool {
        self.busy.get(base).copied().unwrap_or(false)
    }

    fn has_room(&self, record: &DeviceRecord) -> bool {
        self.queue_len(&record.base) < record.capacity
    }

    fn estimate(&self, record: &DeviceRecord, estimated_tokens: f64) -> f64 {
        self.estimator
            .estimate(record.tps, self.queue_len(&record.base), estimated_tokens)
    }

    /// Online devices with free capacity, fastest first
    pub fn available_devices(&self) -> Vec<&'a DeviceRecord> {
        self.registry
            .online_devices()
            .into_iter()
            .filter(|r| self.has_room(r))
            .collect()
    }
}

/// Sample two distinct under-capacity devices and keep the one expected to
/// finish sooner.
pub fn power_of_two_choices<R: Rng>(
    ctx: &RoutingContext<'_>,
    estimated_tokens: f64,
    rng: &mut R,
) -> Option<String> {
    let candidates = ctx.available_devices();
    match candidates.len() {
        0 => return None,
        1 => return Some(candidates[0].base.clone()),
        _ => {}
    }

    let first = rng.gen_range(0..candidates.len());
    let mut second = rng.gen_range(0..candidates.len() - 1);
    if second >= first {
        second += 1;
    }

    let a = candidates[first];
    let b = candidates[second];
    let eta_a = ctx.estimate(a, estimated_tokens);
    let eta_b = ctx.estimate(b, estimated_tokens);

    let chosen = if eta_b < eta_a { b } else { a };
    debug!(
        "Power-of-two: {} ({:.3}s) vs {} ({:.3}s) -> {}",
        a.base, eta_a, b.base, eta_b, chosen.base
    );
    Some(chosen.base.clone())
}

/// Full scan for the minimum estimated completion time.
///
/// At equal estimates an idle device beats a busy one; otherwise the
/// better-ranked device wins.
pub fn greedy_minimum_completion_time(
    ctx: &RoutingContext<'_>,
    estimated_tokens: f64,
) -> Option<String> {
    let mut best: Option<(&DeviceRecord, f64, bool)> = None;

    for record in ctx.registry.online_devices() {
        if !ctx.has_room(record) {
            continue;
        }
        let eta = ctx.estimate(record, estimated_tokens);
        let idle = !ctx.is_busy(&record.base);

        let better = match best {
            None => true,
            Some((_, best_eta, best_idle)) => {
                eta < best_eta || (eta == best_eta && idle && !best_idle)
            }
        };
        if better {
            best = Some((record, eta, idle));
        }
    }

    best.map(|(record, eta, _)| {
        debug!("Greedy MCT -> {} ({:.3}s)", record.base, eta);
        record.base.clone()
    })
}

/// Map the complexity tier onto rank order among available devices.
///
/// Simple work goes to the slowest device, high to the fastest, medium to
/// the midpoint. Idle devices are preferred; when every available device is
/// busy the same tier rule applies to all of them.
pub fn complexity_tiered(ctx: &RoutingContext<'_>, complexity: Complexity) -> Option<String> {
    let available = ctx.available_devices();
    if available.is_empty() {
        return None;
    }

    let idle: Vec<&DeviceRecord> = available
        .iter()
        .copied()
        .filter(|r| !ctx.is_busy(&r.base))
        .collect();
    let pool = if idle.is_empty() { available } else { idle };

    let chosen = match complexity {
        Complexity::Simple => pool[pool.len() - 1],
        Complexity::High => pool[0],
        Complexity::Medium => pool[pool.len() / 2],
    };
    debug!("Complexity-tiered ({}) -> {}", complexity, chosen.base);
    Some(chosen.base.clone())
}

/// Fastest idle available device, or the fastest available one
pub fn first_available(ctx: &RoutingContext<'_>) -> Option<String> {
    let available = ctx.available_devices();
    available
        .iter()
        .find(|r| !ctx.is_busy(&r.base))
        .or_else(|| available.first())
        .map(|r| r.base.clone())
}

/// Least-bad choice when every online device is at or over capacity:
/// the lowest queue-to-capacity ratio, ties to the better rank.
pub fn saturation_fallback(ctx: &RoutingContext<'_>) -> Option<String> {
    let mut best: Option<(&DeviceRecord, f64)> = None;

    for record in ctx.registry.online_devices() {
        let ratio = if record.capacity == 0 {
            f64::INFINITY
        } else {
            ctx.queue_len(&record.base) as f64 / record.capacity as f64
        };
        if best.map(|(_, b)| ratio < b).unwrap_or(true) {
            best = Some((record, ratio));
        }
    }

    best.map(|(record, ratio)| {
        warn!(
            "All devices saturated, falling back to {} (load ratio {:.2})",
            record.base, ratio
        );
        record.base.clone()
    })
}

/// Run the strategy chain: power-of-two, greedy, available filter,
/// saturation fallback. Returns `None` only when no device is online.
pub fn select_device<R: Rng>(
    ctx: &RoutingContext<'_>,
    policy: RoutingPolicy,
    question: Option<&ComplexityClassification>,
    rng: &mut R,
) -> Option<String> {
    if ctx.registry.online_count() == 0 {
        debug!("No online devices, cannot route");
        return None;
    }

    let estimated_tokens = question
        .map(|q| q.estimated_tokens as f64)
        .unwrap_or_else(|| ctx.estimator.average_tokens());

    if policy.power_of_two && question.is_some() {
        if let Some(device) = power_of_two_choices(ctx, estimated_tokens, rng) {
            return Some(device);
        }
    }

    if policy.greedy {
        if let Some(device) = greedy_minimum_completion_time(ctx, estimated_tokens) {
            return Some(device);
        }
    }

    let tiered = match question {
        Some(q) => complexity_tiered(ctx, q.complexity),
        None => first_available(ctx),
    };
    tiered.or_else(|| saturation_fallback(ctx))
}
