//! Ambient environment status
//!
//! Turns environment readings (decoded directly, or queried back from a
//! store) into the mic / temperature / humidity values kept in
//! [`PipelineState`]. Missing fields leave the last-known value untouched.

use crate::sink::{MeasurementSource, QueryRecord};
use crate::types::{EnvironmentReading, MicStatus, PipelineState};
use serde::Serialize;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, warn};

pub const MIC_FIELD: &str = "mic";
pub const TEMPERATURE_FIELD: &str = "temperature";
pub const HUMIDITY_FIELD: &str = "humidity";

impl MicStatus {
    /// The sensor reports 1 for a loud environment, anything else is quiet
    pub fn from_level(level: f64) -> Self {
        if level == 1.0 {
            MicStatus::High
        } else {
            MicStatus::Low
        }
    }
}

/// Latest environment values extracted from one reading
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct EnvironmentStatus {
    pub mic: Option<MicStatus>,
    pub temperature: Option<f64>,
    pub humidity: Option<f64>,
}

impl EnvironmentStatus {
    pub fn from_fields(fields: &BTreeMap<String, f64>) -> Self {
        Self {
            mic: fields.get(MIC_FIELD).copied().map(MicStatus::from_level),
            temperature: fields.get(TEMPERATURE_FIELD).copied(),
            humidity: fields.get(HUMIDITY_FIELD).copied(),
        }
    }

    pub fn from_reading(reading: &EnvironmentReading) -> Self {
        Self::from_fields(&reading.fields)
    }

    pub fn from_query(record: &QueryRecord) -> Self {
        Self::from_fields(&record.fields)
    }

    pub fn is_empty(&self) -> bool {
        self.mic.is_none() && self.temperature.is_none() && self.humidity.is_none()
    }

    /// Overwrite the known values in `state`
    pub fn apply(&self, state: &mut PipelineState) {
        if let Some(mic) = self.mic {
            state.last_mic_status = Some(mic);
        }
        if let Some(t) = self.temperature {
            state.last_temperature = Some(t);
        }
        if let Some(h) = self.humidity {
            state.last_humidity = Some(h);
        }
    }
}

/// Query `source` for the latest environment values and fold them into `state`
///
/// Query failures are logged and leave `state` unchanged; returns whether
/// anything was applied.
pub fn refresh<S: MeasurementSource + ?Sized>(
    source: &S,
    measurement: &str,
    range: Duration,
    state: &mut PipelineState,
) -> bool {
    match source.latest(measurement, range) {
        Ok(Some(record)) => {
            let status = EnvironmentStatus::from_query(&record);
            status.apply(state);
            !status.is_empty()
        }
        Ok(None) => {
            debug!(measurement, "no recent environment data");
            false
        }
        Err(e) => {
            warn!(measurement, error = %e, "environment query failed");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SinkError;
    use crate::sink::{MeasurementSink, MemoryStore, Point};
    use chrono::Utc;
    use pretty_assertions::assert_eq;

    fn fields(pairs: &[(&str, f64)]) -> BTreeMap<String, f64> {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    #[test]
    fn test_mic_level_mapping() {
        assert_eq!(MicStatus::from_level(1.0), MicStatus::High);
        assert_eq!(MicStatus::from_level(0.0), MicStatus::Low);
        assert_eq!(MicStatus::from_level(0.7), MicStatus::Low);
    }

    #[test]
    fn test_partial_reading_keeps_other_values() {
        let mut state = PipelineState {
            last_temperature: Some(21.0),
            last_humidity: Some(40.0),
            ..PipelineState::default()
        };
        EnvironmentStatus::from_fields(&fields(&[("mic", 1.0), ("humidity", 45.0)]))
            .apply(&mut state);

        assert_eq!(state.last_mic_status, Some(MicStatus::High));
        assert_eq!(state.last_temperature, Some(21.0));
        assert_eq!(state.last_humidity, Some(45.0));
    }

    #[test]
    fn test_refresh_from_store() {
        let mut store = MemoryStore::default();
        store
            .write(
                &Point::new("sensor_data", Utc::now())
                    .with_fields(fields(&[("mic", 0.0), ("temperature", 23.5)])),
            )
            .unwrap();

        let mut state = PipelineState::default();
        assert!(refresh(&store, "sensor_data", Duration::from_secs(60), &mut state));
        assert_eq!(state.last_mic_status, Some(MicStatus::Low));
        assert_eq!(state.last_temperature, Some(23.5));
        assert_eq!(state.last_humidity, None);
    }

    struct BrokenSource;

    impl MeasurementSource for BrokenSource {
        fn latest(&self, _: &str, _: Duration) -> Result<Option<QueryRecord>, SinkError> {
            Err(SinkError::Request("connection refused".into()))
        }
    }

    #[test]
    fn test_refresh_failure_keeps_state() {
        let mut state = PipelineState {
            last_humidity: Some(50.0),
            ..PipelineState::default()
        };
        assert!(!refresh(&BrokenSource, "sensor_data", Duration::from_secs(60), &mut state));
        assert_eq!(state.last_humidity, Some(50.0));
    }
}
