//! Frame decoding
//!
//! Turns one raw transport line into a [`Sample`]. Two shapes are recognized:
//! - a JSON object of named scalar fields (environment or diagnostic record)
//! - exactly eight comma-separated decimals (motion record)
//!
//! Anything else is discarded with a logged reason; decoding never fails the
//! stream.

use crate::error::DecodeError;
use crate::types::{
    DiagnosticReading, EnvironmentReading, MotionReading, Record, Sample, MOTION_FIELD_COUNT,
};
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::OnceLock;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Strict grammar for a motion frame
pub const MOTION_PATTERN: &str = r"^-?\d+(\.\d+)?(,-?\d+(\.\d+)?){7}$";

/// Key that marks a JSON frame as a device diagnostic
pub const ERROR_KEY: &str = "error";

fn motion_regex() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(MOTION_PATTERN).ok())
        .as_ref()
}

/// Whether a trimmed line is a well-formed motion frame
pub fn is_motion_frame(line: &str) -> bool {
    motion_regex().is_some_and(|re| re.is_match(line))
}

/// Per-shape decode counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DecodeStats {
    pub motion: u64,
    pub environment: u64,
    pub diagnostic: u64,
    pub discarded: u64,
}

/// Stateful frame decoder; stamps each sample with its arrival time
#[derive(Debug)]
pub struct FrameDecoder {
    started: Instant,
    stats: DecodeStats,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            stats: DecodeStats::default(),
        }
    }

    pub fn stats(&self) -> DecodeStats {
        self.stats
    }

    /// Decode a line received now, logging and dropping malformed input
    pub fn decode(&mut self, line: &str) -> Option<Sample> {
        let elapsed = self.started.elapsed();
        self.decode_at(line, Utc::now(), elapsed)
    }

    /// Decode a line with an explicit arrival time
    pub fn decode_at(
        &mut self,
        line: &str,
        received_at: DateTime<Utc>,
        elapsed: Duration,
    ) -> Option<Sample> {
        match self.try_decode_at(line, received_at, elapsed) {
            Ok(sample) => sample,
            Err(e) => {
                debug!(reason = %e, "discarding frame");
                None
            }
        }
    }

    /// Decode a line received now, returning the discard reason
    pub fn try_decode(&mut self, line: &str) -> Result<Option<Sample>, DecodeError> {
        let elapsed = self.started.elapsed();
        self.try_decode_at(line, Utc::now(), elapsed)
    }

    /// Decode with an explicit arrival time, returning the discard reason
    pub fn try_decode_at(
        &mut self,
        line: &str,
        received_at: DateTime<Utc>,
        elapsed: Duration,
    ) -> Result<Option<Sample>, DecodeError> {
        let record = match parse_record(line) {
            Ok(Some(record)) => record,
            Ok(None) => return Ok(None),
            Err(e) => {
                self.stats.discarded += 1;
                return Err(e);
            }
        };

        match &record {
            Record::Motion(_) => self.stats.motion += 1,
            Record::Environment(_) => self.stats.environment += 1,
            Record::Diagnostic(diag) => {
                self.stats.diagnostic += 1;
                warn!(message = %diag.message, "device reported an error");
            }
        }

        Ok(Some(Sample::new(received_at, elapsed, record)))
    }
}

/// Parse a raw line into a record without timestamping it
///
/// Returns `Ok(None)` for blank lines.
pub fn parse_record(line: &str) -> Result<Option<Record>, DecodeError> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }

    if trimmed.starts_with('{') || trimmed.starts_with('[') {
        return parse_json_record(trimmed).map(Some);
    }

    if is_motion_frame(trimmed) {
        return parse_motion_record(trimmed).map(Some);
    }

    Err(DecodeError::Unrecognized(truncate(trimmed, 64)))
}

/// Values beyond f64 range saturate to ±inf; the classifier rejects those windows
fn parse_motion_record(line: &str) -> Result<Record, DecodeError> {
    let mut values = [0.0; MOTION_FIELD_COUNT];
    for (slot, token) in values.iter_mut().zip(line.split(',')) {
        *slot = token
            .parse()
            .map_err(|_| DecodeError::InvalidNumber(truncate(token, 32)))?;
    }
    Ok(Record::Motion(MotionReading::from_values(values)))
}

fn parse_json_record(line: &str) -> Result<Record, DecodeError> {
    let value: Value =
        serde_json::from_str(line).map_err(|e| DecodeError::InvalidJson(e.to_string()))?;

    let Value::Object(map) = value else {
        return Err(DecodeError::NotAnObject);
    };

    let fields = scalar_fields(&map);

    match map.get(ERROR_KEY) {
        Some(error) => {
            let message = match error {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            Ok(Record::Diagnostic(DiagnosticReading { message, fields }))
        }
        None => Ok(Record::Environment(EnvironmentReading { fields })),
    }
}

/// Numeric and boolean members of a JSON object; everything else is skipped
fn scalar_fields(map: &Map<String, Value>) -> BTreeMap<String, f64> {
    let mut fields = BTreeMap::new();
    for (key, value) in map {
        if key == ERROR_KEY {
            continue;
        }
        let scalar = match value {
            Value::Number(n) => n.as_f64(),
            Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            Value::Null => None,
            other => {
                debug!(field = %key, value = %other, "skipping non-scalar field");
                None
            }
        };
        if let Some(v) = scalar {
            fields.insert(key.clone(), v);
        }
    }
    fields
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let mut out: String = s.chars().take(max).collect();
        out.push('…');
        out
    }
}
