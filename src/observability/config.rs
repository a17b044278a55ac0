use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default threshold above which a completed request is logged as slow
pub const DEFAULT_SLOW_REQUEST_THRESHOLD: Duration = Duration::from_secs(3);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub level: String,
    pub format: LogFormat,
    /// Requests taking at least this long get an extra warning line
    #[serde(with = "humantime_serde")]
    pub slow_request_threshold: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    Text,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Json,
            slow_request_threshold: DEFAULT_SLOW_REQUEST_THRESHOLD,
        }
    }
}

impl LogConfig {
    pub const LEVELS: [&'static str; 5] = ["trace", "debug", "info", "warn", "error"];

    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if !Self::LEVELS.contains(&self.level.to_lowercase().as_str()) {
            errors.push(format!(
                "logging.level must be one of {:?}, got '{}'",
                Self::LEVELS,
                self.level
            ));
        }
        errors
    }
}
