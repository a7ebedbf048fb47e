//! Pipeline configuration
//!
//! Every field has a default, so a config file only needs the values it
//! changes. CLI flags are applied on top of the loaded file.

use crate::error::ConfigError;
use crate::kinematics::DEFAULT_SMOOTH_THRESHOLD;
use crate::link::RetryPolicy;
use crate::window::DEFAULT_WINDOW_SIZE;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Measurement name for raw motion readings
pub const DEFAULT_MOTION_MEASUREMENT: &str = "gyro_status";

/// Measurement name for environment readings
pub const DEFAULT_ENVIRONMENT_MEASUREMENT: &str = "sensor_data";

/// Tunables of a [`crate::pipeline::MotionPipeline`] run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Motion samples per window; classification waits for a full window
    pub window_size: usize,
    /// Interval between evaluations
    pub eval_interval_ms: u64,
    /// |jerk| below this counts as smooth
    pub smooth_threshold: f64,
    /// Longest single blocking read
    pub read_timeout_ms: u64,
    pub motion_measurement: String,
    pub environment_measurement: String,
    /// Look-back of environment queries
    pub environment_range_secs: u64,
    pub retry: RetryPolicy,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            window_size: DEFAULT_WINDOW_SIZE,
            eval_interval_ms: 500,
            smooth_threshold: DEFAULT_SMOOTH_THRESHOLD,
            read_timeout_ms: 100,
            motion_measurement: DEFAULT_MOTION_MEASUREMENT.to_string(),
            environment_measurement: DEFAULT_ENVIRONMENT_MEASUREMENT.to_string(),
            environment_range_secs: 60,
            retry: RetryPolicy::default(),
        }
    }
}

impl PipelineConfig {
    /// Parse and validate a JSON document
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a JSON file
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let json = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&json)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.window_size == 0 {
            return Err(ConfigError::Invalid("window_size must be > 0".into()));
        }
        if self.eval_interval_ms == 0 {
            return Err(ConfigError::Invalid("eval_interval_ms must be > 0".into()));
        }
        if self.read_timeout_ms == 0 {
            return Err(ConfigError::Invalid("read_timeout_ms must be > 0".into()));
        }
        if !self.smooth_threshold.is_finite() || self.smooth_threshold <= 0.0 {
            return Err(ConfigError::Invalid(format!(
                "smooth_threshold must be a positive number, got {}",
                self.smooth_threshold
            )));
        }
        if self.motion_measurement.is_empty() || self.environment_measurement.is_empty() {
            return Err(ConfigError::Invalid("measurement names must not be empty".into()));
        }
        if self.retry.max_attempts == Some(0) {
            return Err(ConfigError::Invalid(
                "retry.max_attempts must be > 0 (omit it for unbounded retries)".into(),
            ));
        }
        Ok(())
    }

    pub fn eval_interval(&self) -> Duration {
        Duration::from_millis(self.eval_interval_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn environment_range(&self) -> Duration {
        Duration::from_secs(self.environment_range_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::Backoff;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_default_config_is_valid() {
        let config = PipelineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.window_size, 10);
        assert_eq!(config.eval_interval(), Duration::from_millis(500));
        assert_eq!(config.motion_measurement, "gyro_status");
        assert_eq!(config.environment_measurement, "sensor_data");
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config = PipelineConfig::from_json(r#"{"window_size": 20, "smooth_threshold": 0.8}"#)
            .unwrap();
        assert_eq!(config.window_size, 20);
        assert_eq!(config.smooth_threshold, 0.8);
        assert_eq!(config.read_timeout_ms, 100);
        assert_eq!(config.retry, RetryPolicy::default());
    }

    #[test]
    fn test_retry_policy_from_json() {
        let config = PipelineConfig::from_json(
            r#"{"retry": {"max_attempts": null, "backoff": {"kind": "fixed", "delay_ms": 250}}}"#,
        )
        .unwrap();
        assert_eq!(config.retry.max_attempts, None);
        assert_eq!(config.retry.backoff, Backoff::Fixed { delay_ms: 250 });
    }

    #[test]
    fn test_zero_window_rejected() {
        assert!(matches!(
            PipelineConfig::from_json(r#"{"window_size": 0}"#),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn test_bad_threshold_rejected() {
        assert!(matches!(
            PipelineConfig::from_json(r#"{"smooth_threshold": -1.0}"#),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn test_malformed_json() {
        assert!(matches!(
            PipelineConfig::from_json("{window_size: 3"),
            Err(ConfigError::Json(_))
        ));
    }

    #[test]
    fn test_missing_file() {
        assert!(matches!(
            PipelineConfig::from_file(Path::new("/nonexistent/kiai.json")),
            Err(ConfigError::Io { .. })
        ));
    }
}
