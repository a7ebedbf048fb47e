//! InfluxDB v2 collaborator over HTTP
//!
//! Writes points as line protocol to `/api/v2/write` and answers
//! [`MeasurementSource::latest`] with a Flux query against `/api/v2/query`,
//! parsing the annotated CSV response.

use crate::error::SinkError;
use crate::sink::{MeasurementSink, MeasurementSource, Point, QueryRecord};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::thread;
use std::time::Duration;
use tracing::{debug, warn};

/// Environment variable consulted when no token is configured
pub const TOKEN_ENV: &str = "INFLUX_TOKEN";

/// Connection settings for an InfluxDB v2 server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InfluxConfig {
    pub url: String,
    pub org: String,
    pub bucket: String,
    /// Falls back to `INFLUX_TOKEN` when absent
    #[serde(skip_serializing)]
    pub token: Option<String>,
    pub timeout_ms: u64,
    pub max_retries: u32,
}

impl Default for InfluxConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:8086".to_string(),
            org: "kiai".to_string(),
            bucket: "kiai".to_string(),
            token: None,
            timeout_ms: 10_000,
            max_retries: 3,
        }
    }
}

impl InfluxConfig {
    pub fn new(url: impl Into<String>, org: impl Into<String>, bucket: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            org: org.into(),
            bucket: bucket.into(),
            ..Self::default()
        }
    }

    pub fn token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    fn resolved_token(&self) -> Option<String> {
        self.token
            .clone()
            .or_else(|| std::env::var(TOKEN_ENV).ok())
            .filter(|t| !t.is_empty())
    }
}

/// Blocking InfluxDB client implementing both sink traits; clones share the HTTP agent
#[derive(Clone)]
pub struct InfluxClient {
    config: InfluxConfig,
    token: Option<String>,
    agent: ureq::Agent,
}

impl std::fmt::Debug for InfluxClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InfluxClient")
            .field("config", &self.config)
            .field("token", &self.token.as_ref().map(|_| "***"))
            .finish()
    }
}

impl InfluxClient {
    pub fn new(config: InfluxConfig) -> Result<Self, SinkError> {
        if !config.url.starts_with("http://") && !config.url.starts_with("https://") {
            return Err(SinkError::Request(format!(
                "URL must start with http:// or https://, got {}",
                config.url
            )));
        }
        let agent = ureq::AgentBuilder::new()
            .timeout(Duration::from_millis(config.timeout_ms))
            .user_agent(&format!("kiai-motion/{}", env!("CARGO_PKG_VERSION")))
            .build();
        let token = config.resolved_token();
        if token.is_none() {
            warn!(env = TOKEN_ENV, "no InfluxDB token configured, requests are unauthenticated");
        }
        Ok(Self {
            config,
            token,
            agent,
        })
    }

    pub fn config(&self) -> &InfluxConfig {
        &self.config
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.config.url.trim_end_matches('/'), path)
    }

    fn authorize(&self, request: ureq::Request) -> ureq::Request {
        match &self.token {
            Some(token) => request.set("Authorization", &format!("Token {token}")),
            None => request,
        }
    }

    /// Send with retries on 5xx, 429 and transport errors; returns the response body
    fn send(&self, request: ureq::Request, body: &str) -> Result<String, SinkError> {
        let mut last_error = SinkError::Request("no attempt made".into());

        for attempt in 0..=self.config.max_retries {
            if attempt > 0 {
                thread::sleep(Duration::from_millis(100 * (1 << attempt.min(6))));
            }

            match request.clone().send_string(body) {
                Ok(resp) => {
                    return resp
                        .into_string()
                        .map_err(|e| SinkError::Request(e.to_string()));
                }
                Err(ureq::Error::Status(code, resp)) => {
                    let message = resp.into_string().unwrap_or_default();
                    let error = SinkError::Server {
                        status: code,
                        message,
                    };
                    if code >= 500 || code == 429 {
                        debug!(attempt, status = code, "retrying InfluxDB request");
                        last_error = error;
                        continue;
                    }
                    return Err(error);
                }
                Err(ureq::Error::Transport(t)) => {
                    debug!(attempt, error = %t, "retrying InfluxDB request");
                    last_error = SinkError::Request(t.to_string());
                }
            }
        }
        Err(last_error)
    }

    /// Flux query selecting the last value of every field of `measurement`
    pub fn latest_query(&self, measurement: &str, range: Duration) -> String {
        format!(
            "from(bucket: \"{}\")\n  |> range(start: -{}s)\n  |> filter(fn: (r) => r._measurement == \"{}\")\n  |> last()",
            escape_flux_string(&self.config.bucket),
            range.as_secs().max(1),
            escape_flux_string(measurement),
        )
    }
}

impl MeasurementSink for InfluxClient {
    fn write(&mut self, point: &Point) -> Result<(), SinkError> {
        let line = line_protocol(point)?;
        let request = self
            .authorize(self.agent.post(&self.endpoint("/api/v2/write")))
            .query("org", &self.config.org)
            .query("bucket", &self.config.bucket)
            .query("precision", "ns")
            .set("Content-Type", "text/plain; charset=utf-8");
        self.send(request, &line)?;
        Ok(())
    }
}

impl MeasurementSource for InfluxClient {
    fn latest(
        &self,
        measurement: &str,
        range: Duration,
    ) -> Result<Option<QueryRecord>, SinkError> {
        let body = serde_json::json!({
            "query": self.latest_query(measurement, range),
            "type": "flux",
        });
        let request = self
            .authorize(self.agent.post(&self.endpoint("/api/v2/query")))
            .query("org", &self.config.org)
            .set("Content-Type", "application/json")
            .set("Accept", "application/csv");
        let csv = self.send(request, &body.to_string())?;
        parse_query_csv(&csv)
    }
}

fn escape_flux_string(s: &str) -> String {
    s.replace('\\', "\\\\").replace('"', "\\\"")
}

fn escape_key(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        if matches!(c, ',' | '=' | ' ' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// Render a point as one line of InfluxDB line protocol (nanosecond precision)
pub fn line_protocol(point: &Point) -> Result<String, SinkError> {
    if point.measurement.is_empty() {
        return Err(SinkError::Request("point has no measurement".into()));
    }

    let fields: Vec<String> = point
        .fields
        .iter()
        .filter(|(_, v)| v.is_finite())
        .map(|(k, v)| format!("{}={v:?}", escape_key(k)))
        .collect();
    if fields.is_empty() {
        return Err(SinkError::Request(format!(
            "point {} has no finite fields",
            point.measurement
        )));
    }

    let mut line = format!("{} {}", escape_key(&point.measurement), fields.join(","));
    if let Some(ns) = point.timestamp.timestamp_nanos_opt() {
        line.push(' ');
        line.push_str(&ns.to_string());
    }
    Ok(line)
}

fn split_csv_row(row: &str) -> Vec<String> {
    let mut cells = Vec::new();
    let mut cell = String::new();
    let mut quoted = false;
    let mut chars = row.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '"' if quoted && chars.peek() == Some(&'"') => {
                cell.push('"');
                chars.next();
            }
            '"' => quoted = !quoted,
            ',' if !quoted => cells.push(std::mem::take(&mut cell)),
            _ => cell.push(c),
        }
    }
    cells.push(cell);
    cells
}

/// Fold a Flux CSV response (one row per field) into a single record
///
/// Annotation rows and blank table separators are skipped; a header row is
/// recognised by its `_field` and `_value` columns and may repeat per table.
pub fn parse_query_csv(csv: &str) -> Result<Option<QueryRecord>, SinkError> {
    let mut columns: Option<HashMap<String, usize>> = None;
    let mut record = QueryRecord::default();
    let mut rows = 0usize;

    for raw in csv.lines() {
        let row = raw.trim_end_matches('\r');
        if row.trim().is_empty() || row.starts_with('#') {
            continue;
        }
        let cells = split_csv_row(row);
        if cells.iter().any(|c| c == "_field") && cells.iter().any(|c| c == "_value") {
            columns = Some(
                cells
                    .iter()
                    .enumerate()
                    .map(|(i, c)| (c.clone(), i))
                    .collect(),
            );
            continue;
        }

        let cols = columns
            .as_ref()
            .ok_or_else(|| SinkError::MalformedResponse("data row before header".into()))?;
        let cell = |name: &str| cols.get(name).and_then(|&i| cells.get(i));

        let (Some(field), Some(value)) = (cell("_field"), cell("_value")) else {
            return Err(SinkError::MalformedResponse(format!(
                "row has fewer cells than header: {row}"
            )));
        };
        let Ok(value) = value.parse::<f64>() else {
            debug!(field = %field, "skipping non-numeric field in query result");
            continue;
        };

        let time = cell("_time")
            .and_then(|t| DateTime::parse_from_rfc3339(t).ok())
            .map(|t| t.with_timezone(&Utc));
        if let Some(t) = time {
            record.time = Some(record.time.map_or(t, |prev: DateTime<Utc>| prev.max(t)));
        }
        record.fields.insert(field.clone(), value);
        rows += 1;
    }

    Ok((rows > 0).then_some(record))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_line_protocol() {
        let point = Point::new("sensor_data", Utc.timestamp_opt(1_700_000_000, 5).unwrap())
            .field("humidity", 41.5)
            .field("mic", 1.0)
            .field("bad", f64::NAN);
        assert_eq!(
            line_protocol(&point).unwrap(),
            "sensor_data humidity=41.5,mic=1.0 1700000000000000005"
        );
    }

    #[test]
    fn test_line_protocol_escapes_keys() {
        let point = Point::new("gyro status", Utc.timestamp_opt(0, 0).unwrap()).field("a,b=c", 2.0);
        assert_eq!(line_protocol(&point).unwrap(), "gyro\\ status a\\,b\\=c=2.0 0");
    }

    #[test]
    fn test_line_protocol_needs_fields() {
        let point = Point::new("sensor_data", Utc::now());
        assert!(matches!(line_protocol(&point), Err(SinkError::Request(_))));
    }

    #[test]
    fn test_parse_annotated_csv() {
        let csv = "#group,false,false,true,true,false,false,true,true\r\n\
#datatype,string,long,dateTime:RFC3339,dateTime:RFC3339,dateTime:RFC3339,double,string,string\r\n\
#default,_result,,,,,,,\r\n\
,result,table,_start,_stop,_time,_value,_field,_measurement\r\n\
,,0,2026-01-01T00:00:00Z,2026-01-01T00:01:00Z,2026-01-01T00:00:30Z,22.5,temperature,sensor_data\r\n\
,,1,2026-01-01T00:00:00Z,2026-01-01T00:01:00Z,2026-01-01T00:00:45Z,1,mic,sensor_data\r\n\
\r\n";
        let record = parse_query_csv(csv).unwrap().unwrap();
        assert_eq!(record.get("temperature"), Some(22.5));
        assert_eq!(record.get("mic"), Some(1.0));
        assert_eq!(
            record.time,
            Some(Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 45).unwrap())
        );
    }

    #[test]
    fn test_parse_empty_response() {
        assert_eq!(parse_query_csv("\r\n").unwrap(), None);
    }

    #[test]
    fn test_parse_row_without_header() {
        assert!(matches!(
            parse_query_csv(",,0,1,mic\n"),
            Err(SinkError::MalformedResponse(_))
        ));
    }

    #[test]
    fn test_quoted_cells() {
        assert_eq!(
            split_csv_row(r#"a,"b,c","d""e""#),
            vec!["a".to_string(), "b,c".to_string(), "d\"e".to_string()]
        );
    }

    #[test]
    fn test_rejects_non_http_url() {
        assert!(InfluxClient::new(InfluxConfig::new("localhost:8086", "o", "b")).is_err());
    }

    #[test]
    fn test_query_targets_measurement() {
        let client = InfluxClient::new(InfluxConfig::new("http://db:8086/", "o", "motion").token("t"))
            .unwrap();
        let flux = client.latest_query("sensor_data", Duration::from_secs(60));
        assert!(flux.contains("from(bucket: \"motion\")"));
        assert!(flux.contains("range(start: -60s)"));
        assert!(flux.contains("r._measurement == \"sensor_data\""));
        assert_eq!(client.endpoint("/api/v2/write"), "http://db:8086/api/v2/write");
    }
}
