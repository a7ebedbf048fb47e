//! Measurement sinks and sources
//!
//! - [`MeasurementSink`]: persist one [`Point`] (motion metrics, environment fields)
//! - [`MeasurementSource`]: fetch the most recent values of a measurement
//! - [`MemoryStore`]: bounded in-process store implementing both
//! - [`NdjsonSink`]: one JSON object per point to any writer
//! - [`QueuedSink`], [`CachedSource`]: run a slow store on a helper thread
//!
//! Write failures never reach the ingestion loop; [`forward`] logs and drops them.

use crate::error::SinkError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::io::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender, TrySendError};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Default number of points a [`MemoryStore`] retains
pub const DEFAULT_STORE_CAPACITY: usize = 4096;

/// Default number of points a [`QueuedSink`] holds ahead of its writer thread
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

/// How long [`QueuedSink::flush`] waits for the writer thread by default
pub const DEFAULT_FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

/// One timestamped set of numeric fields under a measurement name
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub measurement: String,
    pub fields: BTreeMap<String, f64>,
    pub timestamp: DateTime<Utc>,
}

impl Point {
    pub fn new(measurement: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            measurement: measurement.into(),
            fields: BTreeMap::new(),
            timestamp,
        }
    }

    pub fn with_fields(mut self, fields: BTreeMap<String, f64>) -> Self {
        self.fields.extend(fields);
        self
    }

    pub fn field(mut self, name: impl Into<String>, value: f64) -> Self {
        self.fields.insert(name.into(), value);
        self
    }
}

/// Latest value per field of a measurement, as returned by a query
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct QueryRecord {
    /// Time of the newest contributing point
    pub time: Option<DateTime<Utc>>,
    pub fields: BTreeMap<String, f64>,
}

impl QueryRecord {
    pub fn get(&self, name: &str) -> Option<f64> {
        self.fields.get(name).copied()
    }
}

/// Persists points
pub trait MeasurementSink {
    fn write(&mut self, point: &Point) -> Result<(), SinkError>;

    fn flush(&mut self) -> Result<(), SinkError> {
        Ok(())
    }
}

impl<S: MeasurementSink + ?Sized> MeasurementSink for Box<S> {
    fn write(&mut self, point: &Point) -> Result<(), SinkError> {
        (**self).write(point)
    }

    fn flush(&mut self) -> Result<(), SinkError> {
        (**self).flush()
    }
}

/// Answers "latest values of `measurement` within `range`" queries
pub trait MeasurementSource {
    fn latest(&self, measurement: &str, range: Duration)
        -> Result<Option<QueryRecord>, SinkError>;
}

/// Write a point, logging instead of propagating a failure; returns whether it was stored
pub fn forward<S: MeasurementSink + ?Sized>(sink: &mut S, point: &Point) -> bool {
    match sink.write(point) {
        Ok(()) => true,
        Err(e) => {
            warn!(measurement = %point.measurement, error = %e, "sink write failed, point dropped");
            false
        }
    }
}

/// Sink that accepts and discards everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl MeasurementSink for NullSink {
    fn write(&mut self, _point: &Point) -> Result<(), SinkError> {
        Ok(())
    }
}

/// Bounded in-memory store; clones share the same storage
#[derive(Debug, Clone)]
pub struct MemoryStore {
    points: Arc<Mutex<VecDeque<Point>>>,
    capacity: usize,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(DEFAULT_STORE_CAPACITY)
    }
}

impl MemoryStore {
    /// A capacity of 0 is raised to 1
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            points: Arc::new(Mutex::new(VecDeque::with_capacity(capacity.min(1024)))),
            capacity,
        }
    }

    pub fn len(&self) -> usize {
        self.points.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All retained points of a measurement, oldest first
    pub fn points(&self, measurement: &str) -> Vec<Point> {
        self.points
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|p| p.measurement == measurement)
            .cloned()
            .collect()
    }

    /// Query relative to an explicit "now"
    pub fn latest_at(
        &self,
        measurement: &str,
        range: Duration,
        now: DateTime<Utc>,
    ) -> Option<QueryRecord> {
        let cutoff = chrono::Duration::from_std(range)
            .ok()
            .and_then(|range| now.checked_sub_signed(range))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);

        let points = self.points.lock().unwrap_or_else(PoisonError::into_inner);
        let mut record = QueryRecord::default();
        for point in points
            .iter()
            .filter(|p| p.measurement == measurement && p.timestamp >= cutoff)
        {
            // Points arrive in order, so later values overwrite earlier ones
            record.fields.extend(point.fields.iter().map(|(k, v)| (k.clone(), *v)));
            record.time = Some(record.time.map_or(point.timestamp, |t| t.max(point.timestamp)));
        }
        record.time.map(|_| record)
    }
}

impl MeasurementSink for MemoryStore {
    fn write(&mut self, point: &Point) -> Result<(), SinkError> {
        let mut points = self.points.lock().unwrap_or_else(PoisonError::into_inner);
        if points.len() == self.capacity {
            points.pop_front();
        }
        points.push_back(point.clone());
        Ok(())
    }
}

impl MeasurementSource for MemoryStore {
    fn latest(
        &self,
        measurement: &str,
        range: Duration,
    ) -> Result<Option<QueryRecord>, SinkError> {
        Ok(self.latest_at(measurement, range, Utc::now()))
    }
}

/// Writes each point as one JSON line
#[derive(Debug)]
pub struct NdjsonSink<W: Write> {
    writer: W,
}

impl<W: Write> NdjsonSink<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<W: Write> MeasurementSink for NdjsonSink<W> {
    fn write(&mut self, point: &Point) -> Result<(), SinkError> {
        serde_json::to_writer(&mut self.writer, point)?;
        self.writer.write_all(b"\n")?;
        Ok(())
    }

    fn flush(&mut self) -> Result<(), SinkError> {
        self.writer.flush()?;
        Ok(())
    }
}

enum SinkCommand {
    Write(Point),
    Flush(SyncSender<()>),
}

/// Hands points to a writer thread that owns the wrapped sink
///
/// `write` only enqueues. When the bounded queue is full the point is
/// dropped and counted, so a stalled store never holds up the caller.
/// Failures of the wrapped sink are logged on the writer thread.
#[derive(Debug)]
pub struct QueuedSink {
    tx: SyncSender<SinkCommand>,
    dropped: Arc<AtomicU64>,
    flush_timeout: Duration,
}

impl QueuedSink {
    /// Start the writer thread; a capacity of 0 is raised to 1
    pub fn spawn<S: MeasurementSink + Send + 'static>(sink: S, capacity: usize) -> Self {
        let (tx, rx) = mpsc::sync_channel(capacity.max(1));
        thread::spawn(move || drain(sink, rx));
        Self {
            tx,
            dropped: Arc::new(AtomicU64::new(0)),
            flush_timeout: DEFAULT_FLUSH_TIMEOUT,
        }
    }

    pub fn with_flush_timeout(mut self, timeout: Duration) -> Self {
        self.flush_timeout = timeout;
        self
    }

    /// Points dropped because the queue was full
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

fn drain<S: MeasurementSink>(mut sink: S, rx: Receiver<SinkCommand>) {
    for command in rx {
        match command {
            SinkCommand::Write(point) => {
                forward(&mut sink, &point);
            }
            SinkCommand::Flush(done) => {
                if let Err(e) = sink.flush() {
                    warn!(error = %e, "sink flush failed");
                }
                let _ = done.send(());
            }
        }
    }
    debug!("sink writer stopped");
}

impl MeasurementSink for QueuedSink {
    fn write(&mut self, point: &Point) -> Result<(), SinkError> {
        match self.tx.try_send(SinkCommand::Write(point.clone())) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                Err(SinkError::QueueFull)
            }
            Err(TrySendError::Disconnected(_)) => Err(SinkError::WorkerStopped),
        }
    }

    /// Wait until every point queued so far has been handed to the wrapped sink
    fn flush(&mut self) -> Result<(), SinkError> {
        let deadline = Instant::now() + self.flush_timeout;
        let (done_tx, done_rx) = mpsc::sync_channel(1);
        let mut command = SinkCommand::Flush(done_tx);
        loop {
            match self.tx.try_send(command) {
                Ok(()) => break,
                Err(TrySendError::Full(back)) => {
                    if Instant::now() >= deadline {
                        return Err(SinkError::FlushTimeout(self.flush_timeout));
                    }
                    command = back;
                    thread::sleep(Duration::from_millis(5));
                }
                Err(TrySendError::Disconnected(_)) => return Err(SinkError::WorkerStopped),
            }
        }
        match done_rx.recv_timeout(deadline.saturating_duration_since(Instant::now())) {
            Ok(()) => Ok(()),
            Err(RecvTimeoutError::Timeout) => Err(SinkError::FlushTimeout(self.flush_timeout)),
            Err(RecvTimeoutError::Disconnected) => Err(SinkError::WorkerStopped),
        }
    }
}

type SourceCache = Arc<Mutex<HashMap<String, QueryRecord>>>;

/// Answers from the last completed query while a helper thread refreshes it
///
/// `latest` never waits on the wrapped source. Each call requests one
/// refresh unless one is already pending; until the first refresh completes
/// it answers `Ok(None)`. A failed refresh is logged and the previous answer
/// stays.
#[derive(Debug)]
pub struct CachedSource {
    requests: SyncSender<(String, Duration)>,
    cache: SourceCache,
}

impl CachedSource {
    pub fn spawn<S: MeasurementSource + Send + 'static>(source: S) -> Self {
        let (requests, rx) = mpsc::sync_channel(1);
        let cache = SourceCache::default();
        let shared = Arc::clone(&cache);
        thread::spawn(move || poll(source, rx, shared));
        Self { requests, cache }
    }
}

fn poll<S: MeasurementSource>(source: S, rx: Receiver<(String, Duration)>, cache: SourceCache) {
    for (measurement, range) in rx {
        let answer = source.latest(&measurement, range);
        let mut cache = cache.lock().unwrap_or_else(PoisonError::into_inner);
        match answer {
            Ok(Some(record)) => {
                cache.insert(measurement, record);
            }
            Ok(None) => {
                cache.remove(&measurement);
            }
            Err(e) => warn!(measurement = %measurement, error = %e, "background query failed"),
        }
    }
}

impl MeasurementSource for CachedSource {
    fn latest(
        &self,
        measurement: &str,
        range: Duration,
    ) -> Result<Option<QueryRecord>, SinkError> {
        match self.requests.try_send((measurement.to_string(), range)) {
            Ok(()) | Err(TrySendError::Full(_)) => {}
            Err(TrySendError::Disconnected(_)) => return Err(SinkError::WorkerStopped),
        }
        Ok(self
            .cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(measurement)
            .cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;
    use std::io;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    struct FailingSink;

    impl MeasurementSink for FailingSink {
        fn write(&mut self, _point: &Point) -> Result<(), SinkError> {
            Err(SinkError::Io(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                "store offline",
            )))
        }
    }

    #[test]
    fn test_forward_swallows_failures() {
        let point = Point::new("sensor_data", at(0)).field("mic", 1.0);
        assert!(!forward(&mut FailingSink, &point));
        assert!(forward(&mut NullSink, &point));
    }

    #[test]
    fn test_memory_store_is_bounded() {
        let mut store = MemoryStore::new(2);
        for i in 0..3 {
            store
                .write(&Point::new("gyro_status", at(i)).field("avg_jerk", i as f64))
                .unwrap();
        }
        assert_eq!(store.len(), 2);
        let kept: Vec<f64> = store
            .points("gyro_status")
            .iter()
            .map(|p| p.fields["avg_jerk"])
            .collect();
        assert_eq!(kept, vec![1.0, 2.0]);
    }

    #[test]
    fn test_latest_merges_fields_within_range() {
        let mut store = MemoryStore::default();
        store
            .write(&Point::new("sensor_data", at(0)).field("temperature", 20.0))
            .unwrap();
        store
            .write(
                &Point::new("sensor_data", at(100))
                    .field("temperature", 22.5)
                    .field("humidity", 40.0),
            )
            .unwrap();
        store
            .write(&Point::new("sensor_data", at(110)).field("mic", 1.0))
            .unwrap();
        store
            .write(&Point::new("gyro_status", at(115)).field("mic", 0.0))
            .unwrap();

        let record = store
            .latest_at("sensor_data", Duration::from_secs(60), at(120))
            .unwrap();
        assert_eq!(record.time, Some(at(110)));
        assert_eq!(record.get("temperature"), Some(22.5));
        assert_eq!(record.get("humidity"), Some(40.0));
        assert_eq!(record.get("mic"), Some(1.0));
    }

    #[test]
    fn test_latest_outside_range_is_none() {
        let mut store = MemoryStore::default();
        store
            .write(&Point::new("sensor_data", at(0)).field("mic", 1.0))
            .unwrap();
        assert_eq!(
            store.latest_at("sensor_data", Duration::from_secs(60), at(600)),
            None
        );
        assert_eq!(store.latest_at("other", Duration::from_secs(60), at(0)), None);
    }

    #[test]
    fn test_clones_share_storage() {
        let store = MemoryStore::default();
        let mut writer = store.clone();
        writer
            .write(&Point::new("sensor_data", at(0)).field("mic", 0.0))
            .unwrap();
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_ndjson_sink_writes_one_line_per_point() {
        let mut sink = NdjsonSink::new(Vec::new());
        sink.write(&Point::new("sensor_data", at(0)).field("humidity", 55.0))
            .unwrap();
        sink.write(&Point::new("sensor_data", at(1)).field("humidity", 56.0))
            .unwrap();

        let out = String::from_utf8(sink.into_inner()).unwrap();
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines.len(), 2);
        let first: Point = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first.measurement, "sensor_data");
        assert_eq!(first.fields["humidity"], 55.0);
    }

    /// Blocks every write until the gate is opened
    struct GatedSink {
        gate: Arc<(Mutex<bool>, std::sync::Condvar)>,
        store: MemoryStore,
    }

    impl MeasurementSink for GatedSink {
        fn write(&mut self, point: &Point) -> Result<(), SinkError> {
            let (open, cvar) = &*self.gate;
            let mut open = open.lock().unwrap();
            while !*open {
                open = cvar.wait(open).unwrap();
            }
            self.store.write(point)
        }
    }

    #[test]
    fn test_queued_sink_does_not_wait_for_a_stalled_store() {
        let gate = Arc::new((Mutex::new(false), std::sync::Condvar::new()));
        let store = MemoryStore::default();
        let mut sink = QueuedSink::spawn(
            GatedSink {
                gate: Arc::clone(&gate),
                store: store.clone(),
            },
            2,
        )
        .with_flush_timeout(Duration::from_millis(50));

        let started = Instant::now();
        let results: Vec<bool> = (0..6)
            .map(|i| sink.write(&Point::new("gyro_status", at(i)).field("accelX", i as f64)).is_ok())
            .collect();
        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(results.iter().filter(|ok| !**ok).count() >= 3);
        assert_eq!(sink.dropped(), results.iter().filter(|ok| !**ok).count() as u64);
        assert!(matches!(sink.flush(), Err(SinkError::FlushTimeout(_))));

        {
            let (open, cvar) = &*gate;
            *open.lock().unwrap() = true;
            cvar.notify_all();
        }
        let mut sink = sink.with_flush_timeout(Duration::from_secs(5));
        sink.flush().unwrap();
        assert_eq!(store.len(), results.iter().filter(|ok| **ok).count());
    }

    #[test]
    fn test_queued_sink_logs_failures_off_thread() {
        let mut sink = QueuedSink::spawn(FailingSink, 4);
        let point = Point::new("sensor_data", at(0)).field("mic", 1.0);
        assert!(forward(&mut sink, &point));
        sink.flush().unwrap();
        assert_eq!(sink.dropped(), 0);
    }

    struct SlowSource {
        delay: Duration,
        store: MemoryStore,
    }

    impl MeasurementSource for SlowSource {
        fn latest(
            &self,
            measurement: &str,
            range: Duration,
        ) -> Result<Option<QueryRecord>, SinkError> {
            thread::sleep(self.delay);
            self.store.latest(measurement, range)
        }
    }

    #[test]
    fn test_cached_source_answers_without_waiting() {
        let mut store = MemoryStore::default();
        store
            .write(&Point::new("sensor_data", Utc::now()).field("humidity", 48.0))
            .unwrap();
        let source = CachedSource::spawn(SlowSource {
            delay: Duration::from_millis(200),
            store,
        });

        let started = Instant::now();
        assert_eq!(source.latest("sensor_data", Duration::from_secs(60)).unwrap(), None);
        assert!(started.elapsed() < Duration::from_millis(100));

        let deadline = Instant::now() + Duration::from_secs(5);
        let record = loop {
            if let Some(record) = source.latest("sensor_data", Duration::from_secs(60)).unwrap() {
                break record;
            }
            assert!(Instant::now() < deadline, "refresh never completed");
            thread::sleep(Duration::from_millis(10));
        };
        assert_eq!(record.get("humidity"), Some(48.0));
    }
}
