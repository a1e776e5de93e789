use clap::{ArgAction, Parser};
use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::config::RouterConfig;
use crate::scheduler::{MetricsSummary, QueueHealth};

#[derive(Parser, Debug)]
#[command(name = "tps-router")]
#[command(about = "Route questions across inference devices by measured throughput")]
#[command(version)]
pub struct Args {
    /// Path to the router config file (YAML, JSON or JSONC)
    #[arg(required = true, env = "TPS_ROUTER_CONFIG")]
    pub config: PathBuf,

    /// Enable verbose logging output (-v, -vv, -vvv)
    #[arg(short, long, action = ArgAction::Count)]
    pub verbose: u8,

    /// File with one question per line to route
    #[arg(short, long, value_name = "FILE")]
    pub questions: Option<PathBuf>,

    /// Print the queue report as JSON
    #[arg(long)]
    pub json: bool,

    /// Dry-run mode: validate config and show device capacities without routing
    #[arg(long)]
    pub dry_run: bool,

    /// Path to a .env file loaded before the config
    #[arg(long, value_name = "FILE")]
    pub env_file: Option<PathBuf>,
}

/// One routed question, for the final report
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoutedQuestion {
    pub question: String,
    /// `None` when no device was online
    pub device: Option<String>,
}

// ============================================================================
// Pure display logic (no I/O - returns formatted strings)
// ============================================================================

/// Format the device capacity summary shown at startup and in dry-run mode.
pub fn format_summary(config: &RouterConfig, summary: &MetricsSummary, args: &Args) -> String {
    let mut output = String::new();

    output.push_str(&format!("tps-router v{}\n\n", env!("CARGO_PKG_VERSION")));
    output.push_str(&format!("Config: {}\n", args.config.display()));
    output.push_str(&format!("TPS per person: {}\n", config.tps_per_person));
    output.push_str(&format!(
        "Routing: greedy={} power-of-two={}\n",
        config.greedy, config.power_of_two
    ));
    output.push_str(&format!(
        "Rebalancing: enabled={} interval={}ms threshold={}\n\n",
        config.rebalancing.enabled,
        config.rebalancing.interval_ms,
        config.rebalancing.steal_threshold
    ));

    output.push_str(&format!(
        "Devices ({} online / {} known, capacity {}):\n",
        summary.online_count, summary.device_count, summary.total_capacity
    ));

    let mut by_rank: Vec<(&String, &usize)> = summary.ranks.iter().collect();
    by_rank.sort_by_key(|(_, rank)| **rank);
    for (base, rank) in by_rank {
        let capacity = summary.capacities.get(base).copied().unwrap_or(0);
        output.push_str(&format!("  #{} {} (capacity {})\n", rank, base, capacity));
    }

    if args.dry_run {
        output.push_str("\nValidation: PASSED\n");
        output.push_str("Remove --dry-run to route questions.\n");
    }

    output
}

/// Format where each question went.
pub fn format_assignments(routed: &[RoutedQuestion]) -> String {
    let mut output = String::new();
    for entry in routed {
        let target = entry.device.as_deref().unwrap_or("<no device online>");
        let question = if entry.question.chars().count() > 60 {
            let head: String = entry.question.chars().take(57).collect();
            format!("{}...", head)
        } else {
            entry.question.clone()
        };
        output.push_str(&format!("{:<32} <- {}\n", target, question));
    }
    output
}

/// JSON report combining assignments, moves and queue health.
pub fn format_json_report(
    routed: &[RoutedQuestion],
    moves: usize,
    health: &BTreeMap<String, QueueHealth>,
) -> Result<String, serde_json::Error> {
    let report = serde_json::json!({
        "assignments": routed,
        "rebalanced": moves,
        "health": health,
    });
    serde_json::to_string_pretty(&report)
}
