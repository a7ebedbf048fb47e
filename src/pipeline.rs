//! Pipeline orchestration
//!
//! Wires the stages together: link → decoder → window → {features,
//! kinematics} → classifier, with persisted points going to the configured
//! sinks. All mutable results live in a caller-owned [`PipelineState`].

use crate::classifier::Classifier;
use crate::config::PipelineConfig;
use crate::decoder::{DecodeStats, FrameDecoder};
use crate::environment::{self, EnvironmentStatus};
use crate::error::{ArtifactLoadError, DecodeError, LinkError, PipelineError};
use crate::features::FeatureExtractor;
use crate::kinematics::Kinematics;
use crate::link::{LinkManager, LinkStats, Transport};
use crate::sink::{
    forward, CachedSource, MeasurementSink, MeasurementSource, NullSink, Point, QueuedSink,
    DEFAULT_QUEUE_CAPACITY,
};
use crate::types::{DerivedSignal, Label, PipelineState, Record, Sample};
use crate::window::WindowBuffer;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;
use tracing::{debug, info, warn};

/// What happened to one input line
#[derive(Debug, Clone, PartialEq)]
pub enum Ingested {
    Blank,
    Motion,
    Environment(EnvironmentStatus),
    Diagnostic(String),
    Discarded(DecodeError),
}

/// Classification result of one evaluation
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Classification {
    Predicted(Label),
    /// Window not full yet
    WindowFilling,
    NoClassifier,
    /// Feature vector rejected; the previous prediction is kept
    Rejected(String),
}

/// Output of one evaluation tick
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Evaluation {
    pub at: DateTime<Utc>,
    pub window_len: usize,
    pub derived: DerivedSignal,
    pub classification: Classification,
}

/// Why a run loop returned normally
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    Interrupted,
    EndOfStream,
    Cancelled,
}

/// Totals reported when a run ends
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct RunSummary {
    pub reason: StopReason,
    pub evaluations: u64,
    pub decode: DecodeStats,
    pub link: LinkStats,
}

/// Streaming motion pipeline
pub struct MotionPipeline {
    config: PipelineConfig,
    decoder: FrameDecoder,
    window: WindowBuffer,
    extractor: FeatureExtractor,
    kinematics: Kinematics,
    classifier: Option<Classifier>,
    motion_sink: Box<dyn MeasurementSink + Send>,
    environment_sink: Box<dyn MeasurementSink + Send>,
    environment_source: Option<CachedSource>,
}

impl std::fmt::Debug for MotionPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MotionPipeline")
            .field("config", &self.config)
            .field("window", &self.window.size())
            .field("classifier", &self.classifier.is_some())
            .finish_non_exhaustive()
    }
}

impl MotionPipeline {
    pub fn new(config: PipelineConfig) -> Result<Self, PipelineError> {
        config.validate()?;
        Ok(Self {
            decoder: FrameDecoder::new(),
            window: WindowBuffer::new(config.window_size)?,
            extractor: FeatureExtractor::new(),
            kinematics: Kinematics::new(config.smooth_threshold),
            classifier: None,
            motion_sink: Box::new(NullSink),
            environment_sink: Box::new(NullSink),
            environment_source: None,
            config,
        })
    }

    /// Attach a classifier fitted on the extractor's feature schema
    pub fn with_classifier(mut self, classifier: Classifier) -> Result<Self, ArtifactLoadError> {
        let expected = self.extractor.schema();
        let fitted = classifier.artifacts().schema();
        if fitted.version != expected.version {
            return Err(ArtifactLoadError::SchemaVersion {
                expected: expected.version.clone(),
                found: fitted.version.clone(),
            });
        }
        if fitted.len() != expected.len() {
            return Err(ArtifactLoadError::Dimension {
                artifact: "classifier",
                expected: expected.len(),
                found: fitted.len(),
            });
        }
        self.classifier = Some(classifier);
        Ok(self)
    }

    /// Sink for raw motion readings, written from its own thread
    pub fn with_motion_sink(mut self, sink: impl MeasurementSink + Send + 'static) -> Self {
        self.motion_sink = Box::new(QueuedSink::spawn(sink, DEFAULT_QUEUE_CAPACITY));
        self
    }

    /// Sink for environment readings, written from its own thread
    pub fn with_environment_sink(mut self, sink: impl MeasurementSink + Send + 'static) -> Self {
        self.environment_sink = Box::new(QueuedSink::spawn(sink, DEFAULT_QUEUE_CAPACITY));
        self
    }

    /// Store queried for environment values; each evaluation uses the last
    /// completed answer and requests a fresh one in the background
    pub fn with_environment_source(
        mut self,
        source: impl MeasurementSource + Send + 'static,
    ) -> Self {
        self.environment_source = Some(CachedSource::spawn(source));
        self
    }

    /// Wait for queued sink writes to reach their stores
    pub fn flush_sinks(&mut self) {
        for (name, sink) in [
            ("motion", &mut self.motion_sink),
            ("environment", &mut self.environment_sink),
        ] {
            if let Err(e) = sink.flush() {
                warn!(sink = name, error = %e, "sink flush failed");
            }
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn decode_stats(&self) -> DecodeStats {
        self.decoder.stats()
    }

    pub fn window_len(&self) -> usize {
        self.window.size()
    }

    /// Decode one line received now and route it
    pub fn ingest(&mut self, line: &str, state: &mut PipelineState) -> Ingested {
        match self.decoder.try_decode(line) {
            Ok(Some(sample)) => self.route(sample, state),
            Ok(None) => Ingested::Blank,
            Err(e) => {
                debug!(reason = %e, "discarding frame");
                Ingested::Discarded(e)
            }
        }
    }

    /// Route an already decoded sample
    pub fn route(&mut self, sample: Sample, state: &mut PipelineState) -> Ingested {
        match &sample.record {
            Record::Motion(reading) => {
                let point = Point::new(&self.config.motion_measurement, sample.received_at)
                    .with_fields(reading.to_fields());
                forward(&mut self.motion_sink, &point);
                if let Err(e) = self.window.push(&sample) {
                    warn!(error = %e, "motion sample rejected by window");
                }
                Ingested::Motion
            }
            Record::Environment(reading) => {
                let point = Point::new(&self.config.environment_measurement, sample.received_at)
                    .with_fields(reading.fields.clone());
                forward(&mut self.environment_sink, &point);
                let status = EnvironmentStatus::from_reading(reading);
                status.apply(state);
                Ingested::Environment(status)
            }
            // Diagnostics never reach the window or any sink
            Record::Diagnostic(diag) => Ingested::Diagnostic(diag.message.clone()),
        }
    }

    /// Derive metrics from the current window and classify it once full
    pub fn evaluate(&mut self, state: &mut PipelineState) -> Evaluation {
        if let Some(source) = &self.environment_source {
            environment::refresh(
                source,
                &self.config.environment_measurement,
                self.config.environment_range(),
                state,
            );
        }

        let window = self.window.snapshot();
        let derived = self.kinematics.derive(&window);
        if !window.is_empty() {
            state.last_avg_accel = derived.avg_accel_magnitude;
            state.last_jerk = derived.avg_jerk;
            state.last_smoothness = derived.smoothness_pct;
        }

        let classification = match &self.classifier {
            None => Classification::NoClassifier,
            Some(_) if !self.window.is_full() => Classification::WindowFilling,
            Some(classifier) => {
                let features = self.extractor.extract(&window);
                match classifier.predict(&features) {
                    Ok(label) => {
                        state.last_prediction = Some(label.clone());
                        Classification::Predicted(label)
                    }
                    Err(e) => {
                        warn!(error = %e, "classification skipped");
                        state.skipped_predictions += 1;
                        Classification::Rejected(e.to_string())
                    }
                }
            }
        };

        state.evaluations += 1;
        Evaluation {
            at: Utc::now(),
            window_len: window.len(),
            derived,
            classification,
        }
    }

    /// Ingest from `link` until it ends or `stop` is set, evaluating every interval
    ///
    /// A final evaluation runs when input ends with unevaluated samples.
    /// `LinkError::Fatal` is returned as an error; transient faults are
    /// handled by the link manager.
    pub fn run<T, F>(
        &mut self,
        link: &mut LinkManager<T>,
        state: &mut PipelineState,
        stop: &AtomicBool,
        mut on_evaluation: F,
    ) -> Result<RunSummary, PipelineError>
    where
        T: Transport,
        F: FnMut(&Evaluation, &PipelineState),
    {
        let interval = self.config.eval_interval();
        let timeout = self.config.read_timeout();
        let mut last_eval = Instant::now();
        let mut pending = false;
        let mut evaluations = 0u64;

        let reason = loop {
            if stop.load(Ordering::Relaxed) {
                break StopReason::Interrupted;
            }

            match link.next_line(timeout) {
                Ok(Some(line)) => {
                    pending |= matches!(self.ingest(&line, state), Ingested::Motion);
                }
                Ok(None) => {}
                Err(LinkError::EndOfStream) => break StopReason::EndOfStream,
                Err(LinkError::Cancelled) => break StopReason::Cancelled,
                Err(e) => return Err(e.into()),
            }

            if last_eval.elapsed() >= interval {
                let evaluation = self.evaluate(state);
                on_evaluation(&evaluation, state);
                evaluations += 1;
                last_eval = Instant::now();
                pending = false;
            }
        };

        if reason == StopReason::EndOfStream && pending {
            let evaluation = self.evaluate(state);
            on_evaluation(&evaluation, state);
            evaluations += 1;
        }

        self.flush_sinks();

        let summary = RunSummary {
            reason,
            evaluations,
            decode: self.decoder.stats(),
            link: link.stats(),
        };
        info!(
            reason = ?summary.reason,
            evaluations,
            motion = summary.decode.motion,
            discarded = summary.decode.discarded,
            reconnects = summary.link.reconnects,
            "pipeline stopped"
        );
        Ok(summary)
    }
}

/// Forward environment readings from `link` to `sink` until input ends or `stop` is set
///
/// Diagnostics are logged and skipped; motion frames are ignored.
pub fn relay_environment<T, S>(
    link: &mut LinkManager<T>,
    sink: &mut S,
    measurement: &str,
    read_timeout: std::time::Duration,
    stop: &AtomicBool,
) -> Result<RunSummary, PipelineError>
where
    T: Transport,
    S: MeasurementSink + ?Sized,
{
    let mut decoder = FrameDecoder::new();
    let mut forwarded = 0u64;

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

        let Some(sample) = decoder.decode(&line) else {
            continue;
        };
        if let Record::Environment(reading) = &sample.record {
            let point = Point::new(measurement, sample.received_at).with_fields(reading.fields.clone());
            if forward(sink, &point) {
                forwarded += 1;
                debug!(fields = point.fields.len(), "environment point written");
            }
        }
    };

    let _ = sink.flush();
    info!(reason = ?reason, forwarded, "environment relay stopped");
    Ok(RunSummary {
        reason,
        evaluations: 0,
        decode: decoder.stats(),
        link: link.stats(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::{ClassifierArtifacts, LabelEncoder, Model, Scaler};
    use crate::features::FeatureSchema;
    use crate::link::tests::{ScriptedTransport, Step};
    use crate::link::{Backoff, LinkOptions, LinkTarget, RetryPolicy};
    use crate::sink::MemoryStore;
    use crate::types::MicStatus;
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    const N: usize = 48;

    /// "Men" when accelX_mean > 0.5, else "Do"
    fn classifier() -> Classifier {
        let mut coef = vec![vec![0.0; N]; 2];
        coef[1][0] = 1.0;
        let artifacts = ClassifierArtifacts::from_parts(
            Scaler::Robust {
                center: vec![0.0; N],
                scale: vec![1.0; N],
                feature_names: None,
                schema_version: None,
            },
            LabelEncoder {
                classes: vec!["Do".into(), "Men".into()],
            },
            Model::Linear {
                coef,
                intercept: vec![0.5, 0.0],
            },
            &FeatureSchema::motion_v1(),
        )
        .unwrap();
        Classifier::new(artifacts)
    }

    fn config(window_size: usize) -> PipelineConfig {
        PipelineConfig {
            window_size,
            eval_interval_ms: 60_000,
            read_timeout_ms: 1,
            ..PipelineConfig::default()
        }
    }

    fn link(steps: Vec<Step>) -> LinkManager<ScriptedTransport> {
        let mut link = LinkManager::new(
            ScriptedTransport::new(steps),
            LinkTarget::Stdin,
            LinkOptions::default(),
        )
        .with_retry_policy(RetryPolicy::bounded(2, Backoff::None));
        link.open().unwrap();
        link
    }

    #[test]
    fn test_mixed_stream_fills_window_with_motion_only() {
        let mut pipeline = MotionPipeline::new(config(10)).unwrap();
        let mut state = PipelineState::default();

        let lines = [
            "1.0,0.0,0.0,0.0,0.0,0.0,0.0,0.0",
            "garbage",
            "2.0,0.0,0.0,0.0,0.0,0.0,0.0,0.0",
            "",
            "{\"mic\":1,\"temperature\":22.5}",
        ];
        let outcomes: Vec<Ingested> = lines
            .iter()
            .map(|l| pipeline.ingest(l, &mut state))
            .collect();

        assert!(matches!(outcomes[1], Ingested::Discarded(DecodeError::Unrecognized(_))));
        assert_eq!(outcomes[3], Ingested::Blank);
        assert_eq!(pipeline.window_len(), 2);
        assert_eq!(state.last_mic_status, Some(MicStatus::High));
        assert_eq!(state.last_temperature, Some(22.5));

        let evaluation = pipeline.evaluate(&mut state);
        assert_eq!(evaluation.window_len, 2);
        assert!((evaluation.derived.avg_accel_magnitude - 1.5).abs() < 1e-12);
        assert_eq!(evaluation.classification, Classification::NoClassifier);
        assert_eq!(state.evaluations, 1);
    }

    #[test]
    fn test_environment_is_persisted_and_diagnostics_are_not() {
        let store = MemoryStore::default();
        let mut pipeline = MotionPipeline::new(config(10))
            .unwrap()
            .with_environment_sink(store.clone())
            .with_motion_sink(store.clone());
        let mut state = PipelineState::default();

        pipeline.ingest(r#"{"mic":0,"temperature":22.5,"humidity":41}"#, &mut state);
        let outcome = pipeline.ingest(r#"{"error":"DHT read failed","code":3}"#, &mut state);
        pipeline.flush_sinks();

        assert_eq!(outcome, Ingested::Diagnostic("DHT read failed".into()));
        assert_eq!(pipeline.window_len(), 0);
        let points = store.points("sensor_data");
        assert_eq!(points.len(), 1);
        assert_eq!(points[0].fields["temperature"], 22.5);
        assert!(store.points("gyro_status").is_empty());
        assert_eq!(state.last_mic_status, Some(MicStatus::Low));
        assert_eq!(state.last_humidity, Some(41.0));
    }

    #[test]
    fn test_motion_is_persisted_under_motion_measurement() {
        let store = MemoryStore::default();
        let mut pipeline = MotionPipeline::new(config(10))
            .unwrap()
            .with_motion_sink(store.clone());
        let mut state = PipelineState::default();

        pipeline.ingest("0.5,0.1,9.8,1,2,3,10,-5", &mut state);
        pipeline.flush_sinks();
        let points = store.points("gyro_status");
        assert_eq!(points.len(), 1);
        assert_eq!(points[0].fields["accelZ"], 9.8);
        assert_eq!(points[0].fields["pitch"], -5.0);
    }

    #[test]
    fn test_classifies_only_full_window() {
        let mut pipeline = MotionPipeline::new(config(3))
            .unwrap()
            .with_classifier(classifier())
            .unwrap();
        let mut state = PipelineState::default();

        pipeline.ingest("2,0,0,0,0,0,0,0", &mut state);
        pipeline.ingest("2,0,0,0,0,0,0,0", &mut state);
        assert_eq!(
            pipeline.evaluate(&mut state).classification,
            Classification::WindowFilling
        );
        assert_eq!(state.last_prediction, None);

        pipeline.ingest("2,0,0,0,0,0,0,0", &mut state);
        assert_eq!(
            pipeline.evaluate(&mut state).classification,
            Classification::Predicted(Label("Men".into()))
        );

        for _ in 0..3 {
            pipeline.ingest("0,0,0,0,0,0,0,0", &mut state);
        }
        pipeline.evaluate(&mut state);
        assert_eq!(state.last_prediction, Some(Label("Do".into())));
        assert_eq!(state.evaluations, 3);
    }

    #[test]
    fn test_rejected_features_keep_previous_prediction() {
        let mut pipeline = MotionPipeline::new(config(2))
            .unwrap()
            .with_classifier(classifier())
            .unwrap();
        let mut state = PipelineState {
            last_prediction: Some(Label("Men".into())),
            ..PipelineState::default()
        };

        // Squared deviations of ±1e300 overflow, so std becomes infinite
        let huge = format!("1{}", "0".repeat(300));
        pipeline.ingest(&format!("{huge},0,0,0,0,0,0,0"), &mut state);
        pipeline.ingest(&format!("-{huge},0,0,0,0,0,0,0"), &mut state);

        let evaluation = pipeline.evaluate(&mut state);
        assert!(matches!(evaluation.classification, Classification::Rejected(_)));
        assert_eq!(state.last_prediction, Some(Label("Men".into())));
        assert_eq!(state.skipped_predictions, 1);
    }

    #[test]
    fn test_incompatible_classifier_is_refused() {
        let mut schema = FeatureSchema::motion_v1();
        schema.version = "other.v9".into();
        let artifacts = ClassifierArtifacts::from_parts(
            Scaler::Robust {
                center: vec![0.0; N],
                scale: vec![1.0; N],
                feature_names: None,
                schema_version: None,
            },
            LabelEncoder {
                classes: vec!["Do".into(), "Men".into()],
            },
            Model::Linear {
                coef: vec![vec![0.0; N]; 2],
                intercept: vec![0.0, 0.0],
            },
            &schema,
        )
        .unwrap();
        let result = MotionPipeline::new(config(10))
            .unwrap()
            .with_classifier(Classifier::new(artifacts));
        assert!(matches!(result, Err(ArtifactLoadError::SchemaVersion { .. })));
    }

    #[test]
    fn test_run_survives_link_fault_and_evaluates_at_end() {
        let mut pipeline = MotionPipeline::new(config(10)).unwrap();
        let mut state = PipelineState::default();
        let mut link = link(vec![
            Step::Line("1,0,0,0,0,0,0,0"),
            Step::Fault,
            Step::Timeout,
            Step::Line("3,0,0,0,0,0,0,0"),
            Step::End,
        ]);

        let mut seen = Vec::new();
        let summary = pipeline
            .run(&mut link, &mut state, &AtomicBool::new(false), |eval, _| {
                seen.push(eval.window_len)
            })
            .unwrap();

        assert_eq!(summary.reason, StopReason::EndOfStream);
        assert_eq!(summary.link.faults, 1);
        assert_eq!(summary.link.reconnects, 1);
        assert_eq!(summary.decode.motion, 2);
        assert_eq!(seen, vec![2]);
        assert!((state.last_avg_accel - 2.0).abs() < 1e-12);
    }

    #[test]
    fn test_run_returns_fatal_link_error() {
        let mut pipeline = MotionPipeline::new(config(10)).unwrap();
        let mut state = PipelineState::default();
        let mut link = LinkManager::new(
            ScriptedTransport::new(vec![Step::Fault]).failing_opens(&[false, true, true]),
            LinkTarget::Stdin,
            LinkOptions::default(),
        )
        .with_retry_policy(RetryPolicy::bounded(2, Backoff::None));
        link.open().unwrap();

        let result = pipeline.run(&mut link, &mut state, &AtomicBool::new(false), |_, _| {});
        assert!(matches!(
            result,
            Err(PipelineError::Link(LinkError::Fatal { attempts: 2, .. }))
        ));
    }

    #[test]
    fn test_run_honours_stop_flag() {
        let mut pipeline = MotionPipeline::new(config(10)).unwrap();
        let mut state = PipelineState::default();
        let mut link = link(vec![Step::Line("1,0,0,0,0,0,0,0")]);

        let summary = pipeline
            .run(&mut link, &mut state, &AtomicBool::new(true), |_, _| {})
            .unwrap();
        assert_eq!(summary.reason, StopReason::Interrupted);
        assert_eq!(summary.decode.motion, 0);
    }

    #[test]
    fn test_environment_source_refreshes_state() {
        let mut store = MemoryStore::default();
        store
            .write(&Point::new("sensor_data", Utc::now()).field("temperature", 19.0))
            .unwrap();
        let mut pipeline = MotionPipeline::new(config(10))
            .unwrap()
            .with_environment_source(store);
        let mut state = PipelineState::default();

        let deadline = Instant::now() + Duration::from_secs(5);
        while state.last_temperature.is_none() && Instant::now() < deadline {
            pipeline.evaluate(&mut state);
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(state.last_temperature, Some(19.0));
    }

    /// Sleeps on every write and query, like a store that is timing out
    #[derive(Clone)]
    struct StalledStore(Duration);

    impl MeasurementSink for StalledStore {
        fn write(&mut self, _point: &Point) -> Result<(), crate::error::SinkError> {
            std::thread::sleep(self.0);
            Err(crate::error::SinkError::Request("connection refused".into()))
        }
    }

    impl MeasurementSource for StalledStore {
        fn latest(
            &self,
            _measurement: &str,
            _range: Duration,
        ) -> Result<Option<crate::sink::QueryRecord>, crate::error::SinkError> {
            std::thread::sleep(self.0);
            Err(crate::error::SinkError::Request("connection refused".into()))
        }
    }

    #[test]
    fn test_stalled_store_does_not_delay_ingest() {
        let store = StalledStore(Duration::from_secs(2));
        let mut pipeline = MotionPipeline::new(config(3))
            .unwrap()
            .with_motion_sink(store.clone())
            .with_environment_sink(store.clone())
            .with_environment_source(store);
        let mut state = PipelineState::default();

        let started = Instant::now();
        for _ in 0..3 {
            assert_eq!(pipeline.ingest("1,0,0,0,0,0,0,0", &mut state), Ingested::Motion);
        }
        pipeline.ingest(r#"{"mic":1}"#, &mut state);
        let evaluation = pipeline.evaluate(&mut state);
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(evaluation.window_len, 3);
        assert_eq!(state.last_mic_status, Some(MicStatus::High));
    }

    #[test]
    fn test_relay_forwards_environment_only() {
        let mut store = MemoryStore::default();
        let mut link = link(vec![
            Step::Line(r#"{"mic":1,"temperature":24.0,"humidity":50.5}"#),
            Step::Line(r#"{"error":"Failed to read from DHT sensor!"}"#),
            Step::Line("1,2,3,4,5,6,7,8"),
            Step::Line("not json"),
            Step::End,
        ]);

        let summary = relay_environment(
            &mut link,
            &mut store,
            "sensor_data",
            std::time::Duration::from_millis(1),
            &AtomicBool::new(false),
        )
        .unwrap();

        assert_eq!(summary.reason, StopReason::EndOfStream);
        assert_eq!(summary.decode.diagnostic, 1);
        assert_eq!(summary.decode.discarded, 1);
        let points = store.points("sensor_data");
        assert_eq!(points.len(), 1);
        assert_eq!(points[0].fields["humidity"], 50.5);
        assert_eq!(store.len(), 1);
    }
}
