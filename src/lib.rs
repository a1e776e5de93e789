pub mod cli;
pub mod config;
pub mod scheduler;

pub use config::{load_config_file, RouterConfig};
pub use scheduler::{AdaptiveRouter, DeviceBenchmark, DeviceQueues};
