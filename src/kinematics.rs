//! Kinematic derivatives
//!
//! Acceleration magnitude, jerk and a smoothness ratio over a window.
//! Jerk is normalized by the wall-clock gap between consecutive samples, not
//! by sample count, so irregular sampling does not distort it.

use crate::types::DerivedSignal;
use crate::window::Window;
use chrono::{DateTime, Utc};

/// Default |jerk| threshold below which a sample counts as smooth (m/s³)
pub const DEFAULT_SMOOTH_THRESHOLD: f64 = 0.5;

/// Δt used when two samples share a timestamp or the clock went backwards
pub const FALLBACK_DT_SECS: f64 = 1.0;

/// Acceleration magnitude per sample
pub fn magnitudes(window: &Window) -> Vec<f64> {
    window
        .samples()
        .iter()
        .map(|s| s.reading.accel_magnitude())
        .collect()
}

/// Jerk per sample; the first entry is always 0
pub fn jerk_series(window: &Window) -> Vec<f64> {
    let samples = window.samples();
    let mags = magnitudes(window);

    let mut jerk = Vec::with_capacity(samples.len());
    if samples.is_empty() {
        return jerk;
    }
    jerk.push(0.0);

    for i in 1..samples.len() {
        let dt = seconds_between(samples[i - 1].received_at, samples[i].received_at);
        jerk.push((mags[i] - mags[i - 1]) / dt);
    }
    jerk
}

fn seconds_between(earlier: DateTime<Utc>, later: DateTime<Utc>) -> f64 {
    let dt = (later - earlier)
        .num_microseconds()
        .map(|us| us as f64 / 1_000_000.0)
        .unwrap_or(0.0);
    if dt > 0.0 {
        dt
    } else {
        FALLBACK_DT_SECS
    }
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    }
}

/// Derives [`DerivedSignal`] values from windows
#[derive(Debug, Clone, Copy)]
pub struct Kinematics {
    smooth_threshold: f64,
}

impl Default for Kinematics {
    fn default() -> Self {
        Self::new(DEFAULT_SMOOTH_THRESHOLD)
    }
}

impl Kinematics {
    pub fn new(smooth_threshold: f64) -> Self {
        Self { smooth_threshold }
    }

    pub fn smooth_threshold(&self) -> f64 {
        self.smooth_threshold
    }

    /// Derive jerk, smoothness and mean magnitude; an empty window gives zeros
    pub fn derive(&self, window: &Window) -> DerivedSignal {
        if window.is_empty() {
            return DerivedSignal::default();
        }

        let mags = magnitudes(window);
        let jerk = jerk_series(window);
        let smooth = jerk
            .iter()
            .filter(|j| j.abs() < self.smooth_threshold)
            .count();

        DerivedSignal {
            avg_jerk: mean(&jerk),
            smoothness_pct: smooth as f64 / jerk.len() as f64 * 100.0,
            avg_accel_magnitude: mean(&mags),
            sample_count: window.len(),
        }
    }
}
