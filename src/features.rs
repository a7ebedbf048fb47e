//! Feature extraction
//!
//! Summarizes a window into a fixed-order vector of per-axis statistics.
//! The classifier only sees positions, never names, so the order defined by
//! [`FeatureSchema`] is the contract with the fitted artifacts:
//!
//! ```text
//! for axis in [accelX, accelY, accelZ, gyroX, gyroY, gyroZ, roll, pitch]:
//!     mean, std, max, min, skew, kurtosis
//! ```

use crate::error::ConfigError;
use crate::types::{MOTION_FIELDS, MOTION_FIELD_COUNT};
use crate::window::Window;
use serde::{Deserialize, Serialize};

/// Version tag of the built-in motion feature layout
pub const FEATURE_SCHEMA_VERSION: &str = "kiai.motion_features.v1";

/// Relative resolution below which the variance counts as zero
const MOMENT_RESOLUTION: f64 = 1e-15;

/// Statistics computed per axis, in vector order
pub const STATISTICS: [Statistic; 6] = [
    Statistic::Mean,
    Statistic::Std,
    Statistic::Max,
    Statistic::Min,
    Statistic::Skew,
    Statistic::Kurtosis,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Statistic {
    Mean,
    Std,
    Max,
    Min,
    Skew,
    Kurtosis,
}

impl Statistic {
    pub fn as_str(&self) -> &'static str {
        match self {
            Statistic::Mean => "mean",
            Statistic::Std => "std",
            Statistic::Max => "max",
            Statistic::Min => "min",
            Statistic::Skew => "skew",
            Statistic::Kurtosis => "kurtosis",
        }
    }
}

/// Versioned descriptor of the feature vector layout
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureSchema {
    pub version: String,
    pub axes: Vec<String>,
    pub statistics: Vec<Statistic>,
}

impl Default for FeatureSchema {
    fn default() -> Self {
        Self::motion_v1()
    }
}

impl FeatureSchema {
    /// The layout the shipped move classifier was fitted on
    pub fn motion_v1() -> Self {
        Self {
            version: FEATURE_SCHEMA_VERSION.to_string(),
            axes: MOTION_FIELDS.iter().map(|s| s.to_string()).collect(),
            statistics: STATISTICS.to_vec(),
        }
    }

    pub fn len(&self) -> usize {
        self.axes.len() * self.statistics.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Feature names in vector order, e.g. `accelX_mean`
    pub fn names(&self) -> Vec<String> {
        self.axes
            .iter()
            .flat_map(|axis| {
                self.statistics
                    .iter()
                    .map(move |stat| format!("{}_{}", axis, stat.as_str()))
            })
            .collect()
    }
}

/// Fixed-length feature vector tagged with the schema it follows
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureVector {
    pub schema_version: String,
    pub values: Vec<f64>,
}

impl FeatureVector {
    pub fn new(schema_version: impl Into<String>, values: Vec<f64>) -> Self {
        Self {
            schema_version: schema_version.into(),
            values,
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Summary statistics of one series
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct AxisSummary {
    pub mean: f64,
    pub std: f64,
    pub max: f64,
    pub min: f64,
    pub skew: f64,
    pub kurtosis: f64,
}

impl AxisSummary {
    /// Summarize a series with population moments
    ///
    /// Fewer than two values, or zero variance, leave std/skew/kurtosis at 0.
    pub fn of(values: &[f64]) -> Self {
        if values.is_empty() {
            return Self::default();
        }

        let n = values.len() as f64;
        let mean = values.iter().sum::<f64>() / n;
        let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let min = values.iter().copied().fold(f64::INFINITY, f64::min);

        if values.len() < 2 {
            return Self {
                mean,
                max,
                min,
                ..Self::default()
            };
        }

        let (mut m2, mut m3, mut m4) = (0.0, 0.0, 0.0);
        for v in values {
            let d = v - mean;
            let d2 = d * d;
            m2 += d2;
            m3 += d2 * d;
            m4 += d2 * d2;
        }
        m2 /= n;
        m3 /= n;
        m4 /= n;

        let std = m2.sqrt();
        // A constant series can leave m2 at rounding level of the mean, never above it
        let constant = min == max || m2 <= (MOMENT_RESOLUTION * mean).powi(2);
        let (skew, kurtosis) = if constant {
            (0.0, 0.0)
        } else {
            (m3 / m2.powf(1.5), m4 / (m2 * m2))
        };

        Self {
            mean,
            std,
            max,
            min,
            skew,
            kurtosis,
        }
    }

    pub fn get(&self, stat: Statistic) -> f64 {
        match stat {
            Statistic::Mean => self.mean,
            Statistic::Std => self.std,
            Statistic::Max => self.max,
            Statistic::Min => self.min,
            Statistic::Skew => self.skew,
            Statistic::Kurtosis => self.kurtosis,
        }
    }
}

/// Computes feature vectors for a schema
#[derive(Debug, Clone)]
pub struct FeatureExtractor {
    schema: FeatureSchema,
    axis_indices: Vec<usize>,
}

impl Default for FeatureExtractor {
    fn default() -> Self {
        Self::new()
    }
}

impl FeatureExtractor {
    /// Extractor for the built-in motion layout
    pub fn new() -> Self {
        Self {
            schema: FeatureSchema::motion_v1(),
            axis_indices: (0..MOTION_FIELD_COUNT).collect(),
        }
    }

    /// Extractor for a custom layout; fails on axes a motion frame does not carry
    pub fn with_schema(schema: FeatureSchema) -> Result<Self, ConfigError> {
        let axis_indices = schema
            .axes
            .iter()
            .map(|axis| {
                MOTION_FIELDS
                    .iter()
                    .position(|f| f == axis)
                    .ok_or_else(|| ConfigError::Invalid(format!("unknown axis {axis}")))
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            schema,
            axis_indices,
        })
    }

    pub fn schema(&self) -> &FeatureSchema {
        &self.schema
    }

    /// Extract the feature vector of a window
    ///
    /// An empty window yields zeros of the full length.
    pub fn extract(&self, window: &Window) -> FeatureVector {
        let mut values = Vec::with_capacity(self.schema.len());
        for &axis in &self.axis_indices {
            let summary = AxisSummary::of(&window.axis_values(axis));
            values.extend(self.schema.statistics.iter().map(|&stat| summary.get(stat)));
        }
        FeatureVector::new(self.schema.version.clone(), values)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{MotionReading, MotionSample};
    use chrono::Utc;
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    fn window_of(rows: &[[f64; 8]]) -> Window {
        Window::new(
            rows.iter()
                .map(|row| MotionSample {
                    received_at: Utc::now(),
                    elapsed: Duration::ZERO,
                    reading: MotionReading::from_values(*row),
                })
                .collect(),
        )
    }

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn test_schema_names_order() {
        let names = FeatureSchema::motion_v1().names();
        assert_eq!(names.len(), 48);
        assert_eq!(&names[..7], &[
            "accelX_mean",
            "accelX_std",
            "accelX_max",
            "accelX_min",
            "accelX_skew",
            "accelX_kurtosis",
            "accelY_mean",
        ]);
        assert_eq!(names[47], "pitch_kurtosis");
    }

    #[test]
    fn test_population_moments() {
        // 1, 2, 3, 4, 10: mean 4, m2 = 10, m3 = 36, m4 = 1394/5
        let s = AxisSummary::of(&[1.0, 2.0, 3.0, 4.0, 10.0]);
        assert!(close(s.mean, 4.0));
        assert!(close(s.std, 10.0_f64.sqrt()));
        assert!(close(s.max, 10.0));
        assert!(close(s.min, 1.0));
        assert!(close(s.skew, 36.0 / 10.0_f64.powf(1.5)));
        assert!(close(s.kurtosis, (1394.0 / 5.0) / 100.0));
    }

    #[test]
    fn test_symmetric_series_has_zero_skew() {
        let s = AxisSummary::of(&[-2.0, -1.0, 0.0, 1.0, 2.0]);
        assert!(close(s.skew, 0.0));
        // m2 = 2, m4 = 34/5
        assert!(close(s.kurtosis, 6.8 / 4.0));
    }

    #[test]
    fn test_single_sample_zeroes_spread() {
        let s = AxisSummary::of(&[3.5]);
        assert_eq!(
            s,
            AxisSummary {
                mean: 3.5,
                std: 0.0,
                max: 3.5,
                min: 3.5,
                skew: 0.0,
                kurtosis: 0.0,
            }
        );
    }

    #[test]
    fn test_constant_series_stays_finite() {
        let s = AxisSummary::of(&[0.1; 10]);
        assert!(s.skew == 0.0 && s.kurtosis == 0.0);
        assert!(s.std < 1e-12);
    }

    #[test]
    fn test_tiny_spread_keeps_shape_moments() {
        let s = AxisSummary::of(&[0.0, 1e-8]);
        assert!(close(s.std, 5e-9));
        assert!(close(s.skew, 0.0));
        assert!(close(s.kurtosis, 1.0));

        let s = AxisSummary::of(&[1e4, 1e4 + 1e-5]);
        assert!((s.std - 5e-6).abs() < 1e-9);
        assert!((s.kurtosis - 1.0).abs() < 1e-3);
    }

    #[test]
    fn test_vector_shape_fixed() {
        let extractor = FeatureExtractor::new();
        for rows in [vec![], vec![[1.0; 8]], vec![[1.0; 8], [2.0; 8], [4.0; 8]]] {
            let fv = extractor.extract(&window_of(&rows));
            assert_eq!(fv.len(), 48);
            assert_eq!(fv.schema_version, FEATURE_SCHEMA_VERSION);
            assert!(fv.values.iter().all(|v| v.is_finite()));
        }
    }

    #[test]
    fn test_extraction_is_deterministic() {
        let extractor = FeatureExtractor::new();
        let window = window_of(&[
            [0.1, 0.2, 9.8, 1.0, -1.0, 0.5, 10.0, -5.0],
            [0.4, -0.2, 9.6, 2.0, -0.5, 0.1, 12.0, -4.0],
            [1.1, 0.0, 9.1, 3.5, 0.0, -0.4, 15.0, -2.0],
        ]);
        assert_eq!(extractor.extract(&window), extractor.extract(&window));
    }

    #[test]
    fn test_axis_groups_follow_schema() {
        let extractor = FeatureExtractor::new();
        let mut row = [0.0; 8];
        row[7] = 42.0;
        let fv = extractor.extract(&window_of(&[row]));
        // pitch group is the last six values; its mean comes first
        assert_eq!(fv.values[42], 42.0);
        assert_eq!(fv.values[0], 0.0);
    }

    #[test]
    fn test_custom_schema_rejects_unknown_axis() {
        let schema = FeatureSchema {
            version: "custom".to_string(),
            axes: vec!["yaw".to_string()],
            statistics: vec![Statistic::Mean],
        };
        assert!(FeatureExtractor::with_schema(schema).is_err());
    }
}
