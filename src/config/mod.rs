pub mod router;

pub use router::{
    parse_json_config, parse_yaml_config, strip_jsonc_comments, validate_router_config,
    ClassifierConfig, EstimatorConfig, RebalancingConfig, RouterConfig, RouterConfigError,
};

use std::path::Path;
use thiserror::Error;

/// Errors for file I/O operations (separate from pure parsing errors)
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Config error: {0}")]
    RouterConfigError(#[from] RouterConfigError),
}

/// Pick the parser from the file extension; anything not YAML is read as JSONC
fn is_yaml(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|ext| ext.to_str()),
        Some("yaml") | Some("yml")
    )
}

/// Load and validate a router config file from disk.
pub fn load_config_file(path: &Path) -> Result<RouterConfig, ConfigError> {
    let content = std::fs::read_to_string(path)?;
    let config = if is_yaml(path) {
        RouterConfig::from_yaml(&content)?
    } else {
        RouterConfig::from_json(&content)?
    };
    Ok(config)
}
