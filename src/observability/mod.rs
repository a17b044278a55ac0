// Logging configuration
pub mod config;

// Subscriber setup
pub mod logging;

// Metric names and recorders
pub mod metrics;

pub use config::{LogConfig, LogFormat};
pub use logging::init_tracing;
