//! CSV capture of raw motion frames for offline training
//!
//! One row per validated motion frame, prefixed with the local capture time.
//! The header is written only when the target file is empty, so repeated
//! sessions with the same label append to one file.

use crate::decoder::is_motion_frame;
use crate::error::{LinkError, PipelineError, SinkError};
use crate::link::{LinkManager, Transport};
use crate::pipeline::StopReason;
use crate::types::MOTION_FIELDS;
use chrono::{DateTime, Local};
use serde::Serialize;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Timestamp layout of the first CSV column
pub const EXPORT_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Label used when none is given
pub const DEFAULT_LABEL: &str = "sensor_data";

/// Header row of an export file
pub fn header() -> String {
    let mut header = String::from("timestamp");
    for field in MOTION_FIELDS {
        header.push(',');
        header.push_str(field);
    }
    header
}

/// `<directory>/<label>.csv`
pub fn export_path(directory: &Path, label: &str) -> PathBuf {
    directory.join(format!("{label}.csv"))
}

/// Appends validated motion frames to a labelled CSV file
#[derive(Debug)]
pub struct CsvExporter<W: Write = BufWriter<File>> {
    path: PathBuf,
    writer: W,
    rows: u64,
}

impl CsvExporter {
    /// Create the directory if needed and open `<label>.csv` for appending
    pub fn open(directory: &Path, label: &str) -> Result<Self, SinkError> {
        fs::create_dir_all(directory)?;
        let path = export_path(directory, label);
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let empty = file.metadata()?.len() == 0;

        let mut writer = BufWriter::new(file);
        if empty {
            writeln!(writer, "{}", header())?;
            writer.flush()?;
        }
        info!(path = %path.display(), new_file = empty, "exporting motion frames");

        Ok(Self {
            path,
            writer,
            rows: 0,
        })
    }
}

impl<W: Write> CsvExporter<W> {
    /// Export into an already prepared writer; no header is written
    pub fn with_writer(path: impl Into<PathBuf>, writer: W) -> Self {
        Self {
            path: path.into(),
            writer,
            rows: 0,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Rows written by this exporter
    pub fn rows(&self) -> u64 {
        self.rows
    }

    /// Append a raw line if it is a well-formed motion frame; returns whether it was written
    ///
    /// The line is stored as received so the capture keeps the sensor's own
    /// number formatting.
    pub fn record(&mut self, line: &str, at: DateTime<Local>) -> Result<bool, SinkError> {
        let line = line.trim();
        if !is_motion_frame(line) {
            debug!(line, "skipping non-motion line");
            return Ok(false);
        }
        writeln!(self.writer, "{},{}", at.format(EXPORT_TIME_FORMAT), line)?;
        self.writer.flush()?;
        self.rows += 1;
        Ok(true)
    }

    pub fn record_now(&mut self, line: &str) -> Result<bool, SinkError> {
        self.record(line, Local::now())
    }
}

/// Totals of one export session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ExportSummary {
    pub reason: StopReason,
    pub rows: u64,
    /// Lines that were not motion frames
    pub skipped: u64,
    /// Motion frames lost to write errors
    pub failed: u64,
}

/// Record motion frames from `link` until input ends or `stop` is set
///
/// Write failures are logged and the session keeps listening; only
/// `LinkError::Fatal` ends it with an error.
pub fn export_stream<T, W>(
    link: &mut LinkManager<T>,
    exporter: &mut CsvExporter<W>,
    read_timeout: Duration,
    stop: &AtomicBool,
) -> Result<ExportSummary, PipelineError>
where
    T: Transport,
    W: Write,
{
    let mut skipped = 0u64;
    let mut failed = 0u64;

    let reason = loop {
        if stop.load(Ordering::Relaxed) {
            break StopReason::Interrupted;
        }
        let line = match link.next_line(read_timeout) {
            Ok(Some(line)) => line,
            Ok(None) => continue,
            Err(LinkError::EndOfStream) => break StopReason::EndOfStream,
            Err(LinkError::Cancelled) => break StopReason::Cancelled,
            Err(e) => return Err(e.into()),
        };
        match exporter.record_now(&line) {
            Ok(true) => {}
            Ok(false) => skipped += 1,
            Err(e) => {
                failed += 1;
                warn!(path = %exporter.path().display(), error = %e, "csv write failed, row dropped");
            }
        }
    };

    let summary = ExportSummary {
        reason,
        rows: exporter.rows(),
        skipped,
        failed,
    };
    info!(
        reason = ?summary.reason,
        rows = summary.rows,
        failed = summary.failed,
        path = %exporter.path().display(),
        "export finished"
    );
    Ok(summary)
}
