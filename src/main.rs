use std::collections::HashMap;
use std::path::Path;
use std::process;

use anyhow::Context;
use clap::Parser;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use tps_router::cli::{format_assignments, format_json_report, format_summary, Args, RoutedQuestion};
use tps_router::config::load_config_file;
use tps_router::scheduler::health::format_health_table;
use tps_router::scheduler::{AdaptiveRouter, DeviceQueues};

#[tokio::main]
async fn main() {
    let args = Args::parse();

    // Initialize logging
    let filter = match args.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .init();

    // Load .env file if specified
    if let Some(ref env_file) = args.env_file {
        if let Err(e) = dotenvy::from_path(env_file) {
            error!("Failed to load env file {}: {}", env_file.display(), e);
            process::exit(1);
        }
    }

    let config = match load_config_file(&args.config) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load config file {}: {}", args.config.display(), e);
            process::exit(1);
        }
    };

    let router = AdaptiveRouter::from_config(&config);
    let summary = router.metrics_summary();
    println!("{}", format_summary(&config, &summary, &args));

    if args.dry_run {
        return;
    }

    let questions = match args.questions {
        Some(ref path) => match read_questions(path).await {
            Ok(questions) => questions,
            Err(e) => {
                error!("{:#}", e);
                process::exit(1);
            }
        },
        None => Vec::new(),
    };

    let queues: DeviceQueues<String> = DeviceQueues::new();
    let mut routed = Vec::with_capacity(questions.len());

    for question in questions {
        let lengths = queues.lengths();
        let busy: HashMap<String, bool> = lengths
            .iter()
            .map(|(device, len)| (device.clone(), *len > 0))
            .collect();

        let device = router.select_best_device(&lengths, &busy, Some(&question));
        match device {
            Some(ref target) => {
                debug!("Routed to {}: {}", target, question);
                queues.push(target, question.clone());
            }
            None => warn!("No device online for: {}", question),
        }
        routed.push(RoutedQuestion { question, device });
    }

    let moves = router.rebalance_queues(&queues, &|device: &str| {
        info!("Queue {} picked up stolen work", device);
    });

    let health = router.queue_health(&queues.lengths());

    if args.json {
        match format_json_report(&routed, moves, &health) {
            Ok(json) => println!("{}", json),
            Err(e) => {
                error!("Failed to serialize report: {}", e);
                process::exit(1);
            }
        }
    } else {
        if !routed.is_empty() {
            println!("{}", format_assignments(&routed));
        }
        info!("Rebalance pass moved {} request(s)", moves);
        println!("{}", format_health_table(&health));
    }
}

/// One non-empty, trimmed question per line
async fn read_questions(path: &Path) -> anyhow::Result<Vec<String>> {
    let content = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read questions file {}", path.display()))?;
    Ok(content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect())
}
