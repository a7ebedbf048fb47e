//! Core types for the KiAI motion pipeline
//!
//! This module defines the data structures that flow through each stage of the
//! pipeline: decoded samples, window snapshots, derived signals and the
//! caller-owned pipeline state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Number of values in a motion frame
pub const MOTION_FIELD_COUNT: usize = 8;

/// Field names of a motion frame, in wire order
pub const MOTION_FIELDS: [&str; MOTION_FIELD_COUNT] = [
    "accelX", "accelY", "accelZ", "gyroX", "gyroY", "gyroZ", "roll", "pitch",
];

/// One inertial reading: acceleration, angular rate and orientation
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct MotionReading {
    #[serde(rename = "accelX")]
    pub accel_x: f64,
    #[serde(rename = "accelY")]
    pub accel_y: f64,
    #[serde(rename = "accelZ")]
    pub accel_z: f64,
    #[serde(rename = "gyroX")]
    pub gyro_x: f64,
    #[serde(rename = "gyroY")]
    pub gyro_y: f64,
    #[serde(rename = "gyroZ")]
    pub gyro_z: f64,
    pub roll: f64,
    pub pitch: f64,
}

impl MotionReading {
    /// Build from the eight wire values in [`MOTION_FIELDS`] order
    pub fn from_values(values: [f64; MOTION_FIELD_COUNT]) -> Self {
        let [accel_x, accel_y, accel_z, gyro_x, gyro_y, gyro_z, roll, pitch] = values;
        Self {
            accel_x,
            accel_y,
            accel_z,
            gyro_x,
            gyro_y,
            gyro_z,
            roll,
            pitch,
        }
    }

    /// Values in [`MOTION_FIELDS`] order
    pub fn values(&self) -> [f64; MOTION_FIELD_COUNT] {
        [
            self.accel_x,
            self.accel_y,
            self.accel_z,
            self.gyro_x,
            self.gyro_y,
            self.gyro_z,
            self.roll,
            self.pitch,
        ]
    }

    /// Value of a single axis by field name
    pub fn axis(&self, name: &str) -> Option<f64> {
        MOTION_FIELDS
            .iter()
            .position(|f| *f == name)
            .map(|idx| self.values()[idx])
    }

    /// Euclidean norm of the acceleration vector
    pub fn accel_magnitude(&self) -> f64 {
        (self.accel_x.powi(2) + self.accel_y.powi(2) + self.accel_z.powi(2)).sqrt()
    }

    /// Field map suitable for a measurement write
    pub fn to_fields(&self) -> BTreeMap<String, f64> {
        MOTION_FIELDS
            .iter()
            .zip(self.values())
            .map(|(name, value)| (name.to_string(), value))
            .collect()
    }
}

/// Sparse ambient reading (mic, temperature, humidity, ...)
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct EnvironmentReading {
    pub fields: BTreeMap<String, f64>,
}

impl EnvironmentReading {
    pub fn get(&self, name: &str) -> Option<f64> {
        self.fields.get(name).copied()
    }
}

/// Device-reported fault; never windowed, never persisted
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiagnosticReading {
    pub message: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub fields: BTreeMap<String, f64>,
}

/// Shape of a decoded frame, resolved once at decode time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Record {
    Motion(MotionReading),
    Environment(EnvironmentReading),
    Diagnostic(DiagnosticReading),
}

impl Record {
    pub fn kind(&self) -> &'static str {
        match self {
            Record::Motion(_) => "motion",
            Record::Environment(_) => "environment",
            Record::Diagnostic(_) => "diagnostic",
        }
    }
}

/// One decoded reading with its arrival time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    /// Wall-clock arrival time
    pub received_at: DateTime<Utc>,
    /// Monotonic offset since the decoder started
    pub elapsed: Duration,
    pub record: Record,
}

impl Sample {
    pub fn new(received_at: DateTime<Utc>, elapsed: Duration, record: Record) -> Self {
        Self {
            received_at,
            elapsed,
            record,
        }
    }

    pub fn motion(&self) -> Option<&MotionReading> {
        match &self.record {
            Record::Motion(reading) => Some(reading),
            _ => None,
        }
    }

    pub fn is_diagnostic(&self) -> bool {
        matches!(self.record, Record::Diagnostic(_))
    }
}

/// A motion sample as held by the window
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MotionSample {
    pub received_at: DateTime<Utc>,
    pub elapsed: Duration,
    pub reading: MotionReading,
}

/// Per-window kinematic scalars
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct DerivedSignal {
    /// Mean jerk over the window (m/s³)
    pub avg_jerk: f64,
    /// Share of samples with |jerk| below the threshold (0-100)
    pub smoothness_pct: f64,
    /// Mean acceleration magnitude (m/s²)
    pub avg_accel_magnitude: f64,
    pub sample_count: usize,
}

/// Classifier output label
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Label(pub String);

impl Label {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Label {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Mic level as shown next to the motion metrics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MicStatus {
    High,
    Low,
}

/// Last-known metrics, owned by the caller and threaded through each evaluation
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PipelineState {
    pub last_avg_accel: f64,
    pub last_jerk: f64,
    pub last_smoothness: f64,
    pub last_prediction: Option<Label>,
    pub last_mic_status: Option<MicStatus>,
    pub last_temperature: Option<f64>,
    pub last_humidity: Option<f64>,
    /// Number of completed evaluations
    pub evaluations: u64,
    /// Evaluations whose classification was skipped
    pub skipped_predictions: u64,
}
