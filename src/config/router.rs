use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::scheduler::classifier::DEFAULT_CACHE_SIZE;
use crate::scheduler::estimator::{DEFAULT_ALPHA, DEFAULT_AVERAGE_TOKENS, DEFAULT_HISTORY_WINDOW};
use crate::scheduler::registry::DeviceBenchmark;
use crate::scheduler::stealing::{DEFAULT_REBALANCE_INTERVAL_MS, DEFAULT_STEAL_THRESHOLD};
use crate::scheduler::DEFAULT_TPS_PER_PERSON;

/// Errors that can occur while parsing or validating a router config
#[derive(Error, Debug, PartialEq)]
pub enum RouterConfigError {
    #[error("JSON parse error: {0}")]
    JsonError(String),

    #[error("YAML parse error: {0}")]
    YamlError(String),

    #[error("Invalid value for '{field}': {reason}")]
    InvalidValue { field: &'static str, reason: String },

    #[error("Device at index {0} has an empty base")]
    EmptyDeviceBase(usize),

    #[error("Duplicate device: '{0}'")]
    DuplicateDevice(String),
}

/// Router configuration file structure
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case", default)]
pub struct RouterConfig {
    /// Tokens per second that make up one queue slot
    pub tps_per_person: f64,

    /// Enable greedy minimum-completion-time routing
    pub greedy: bool,

    /// Enable power-of-two-choices routing
    pub power_of_two: bool,

    pub rebalancing: RebalancingConfig,

    pub classifier: ClassifierConfig,

    pub estimator: EstimatorConfig,

    /// Seed for power-of-two sampling; random when absent
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rng_seed: Option<u64>,

    /// Initial benchmark readings
    pub devices: Vec<DeviceBenchmark>,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            tps_per_person: DEFAULT_TPS_PER_PERSON,
            greedy: true,
            power_of_two: false,
            rebalancing: RebalancingConfig::default(),
            classifier: ClassifierConfig::default(),
            estimator: EstimatorConfig::default(),
            rng_seed: None,
            devices: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case", default)]
pub struct RebalancingConfig {
    pub enabled: bool,
    pub interval_ms: u64,
    /// Minimum queue length for a device to donate work
    pub steal_threshold: usize,
}

impl Default for RebalancingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_ms: DEFAULT_REBALANCE_INTERVAL_MS,
            steal_threshold: DEFAULT_STEAL_THRESHOLD,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case", default)]
pub struct ClassifierConfig {
    pub cache_size: usize,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            cache_size: DEFAULT_CACHE_SIZE,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case", default)]
pub struct EstimatorConfig {
    /// EMA smoothing factor for tokens per request
    pub alpha: f64,
    pub initial_average_tokens: f64,
    /// Completion samples kept per device
    pub history_window: usize,
}

impl Default for EstimatorConfig {
    fn default() -> Self {
        Self {
            alpha: DEFAULT_ALPHA,
            initial_average_tokens: DEFAULT_AVERAGE_TOKENS,
            history_window: DEFAULT_HISTORY_WINDOW,
        }
    }
}

// ============================================================================
// Pure parsing functions (no I/O)
// ============================================================================

/// Strip `//` and `/* */` comments outside string literals
pub fn strip_jsonc_comments(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();
    let mut in_string = false;
    let mut escape_next = false;

    while let Some(c) = chars.next() {
        if escape_next {
            result.push(c);
            escape_next = false;
            continue;
        }

        if in_string {
            if c == '\\' {
                escape_next = true;
            } else if c == '"' {
                in_string = false;
            }
            result.push(c);
            continue;
        }

        match (c, chars.peek()) {
            ('"', _) => {
                in_string = true;
                result.push(c);
            }
            ('/', Some('/')) => {
                for nc in chars.by_ref() {
                    if nc == '\n' {
                        result.push('\n');
                        break;
                    }
                }
            }
            ('/', Some('*')) => {
                chars.next();
                let mut prev = ' ';
                for nc in chars.by_ref() {
                    if prev == '*' && nc == '/' {
                        break;
                    }
                    prev = nc;
                }
            }
            _ => result.push(c),
        }
    }

    result
}

/// Parse JSON (comments allowed) into a validated config
pub fn parse_json_config(content: &str) -> Result<RouterConfig, RouterConfigError> {
    let stripped = strip_jsonc_comments(content);
    let config: RouterConfig = serde_json::from_str(&stripped)
        .map_err(|e| RouterConfigError::JsonError(e.to_string()))?;
    validate_router_config(&config)?;
    Ok(config)
}

/// Parse YAML into a validated config
pub fn parse_yaml_config(content: &str) -> Result<RouterConfig, RouterConfigError> {
    let config: RouterConfig = serde_yaml::from_str(content)
        .map_err(|e| RouterConfigError::YamlError(e.to_string()))?;
    validate_router_config(&config)?;
    Ok(config)
}

fn invalid(field: &'static str, reason: impl Into<String>) -> RouterConfigError {
    RouterConfigError::InvalidValue {
        field,
        reason: reason.into(),
    }
}

/// Check value ranges and device uniqueness
pub fn validate_router_config(config: &RouterConfig) -> Result<(), RouterConfigError> {
    if !(config.tps_per_person.is_finite() && config.tps_per_person > 0.0) {
        return Err(invalid("tps-per-person", "must be a positive number"));
    }

    let alpha = config.estimator.alpha;
    if !(alpha > 0.0 && alpha <= 1.0) {
        return Err(invalid("estimator.alpha", "must be in (0, 1]"));
    }
    let initial = config.estimator.initial_average_tokens;
    if initial.is_nan() || initial < 0.0 {
        return Err(invalid("estimator.initial-average-tokens", "must be non-negative"));
    }
    if config.estimator.history_window < 2 {
        return Err(invalid("estimator.history-window", "must be at least 2"));
    }
    if config.classifier.cache_size == 0 {
        return Err(invalid("classifier.cache-size", "must be at least 1"));
    }
    if config.rebalancing.interval_ms == 0 {
        return Err(invalid("rebalancing.interval-ms", "must be at least 1"));
    }
    if config.rebalancing.steal_threshold == 0 {
        return Err(invalid("rebalancing.steal-threshold", "must be at least 1"));
    }

    let mut seen = HashSet::new();
    for (idx, device) in config.devices.iter().enumerate() {
        if device.base.trim().is_empty() {
            return Err(RouterConfigError::EmptyDeviceBase(idx));
        }
        if !seen.insert(device.base.as_str()) {
            return Err(RouterConfigError::DuplicateDevice(device.base.clone()));
        }
    }

    Ok(())
}

impl RouterConfig {
    /// Parse a JSON/JSONC config string
    pub fn from_json(content: &str) -> Result<Self, RouterConfigError> {
        parse_json_config(content)
    }

    /// Parse a YAML config string
    pub fn from_yaml(content: &str) -> Result<Self, RouterConfigError> {
        parse_yaml_config(content)
    }
}
