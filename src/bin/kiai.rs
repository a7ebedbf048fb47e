//! KiAI CLI - command-line interface for KiAI Motion
//!
//! Commands:
//! - export: Capture labelled motion frames to CSV for training
//! - upload: Forward environment readings to a store
//! - monitor: Run the motion pipeline and print one evaluation per interval
//! - schema: Print the feature schema

use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use uuid::Uuid;

use kiai_motion::classifier::{Classifier, ClassifierArtifacts};
use kiai_motion::config::PipelineConfig;
use kiai_motion::error::{ConfigError, PipelineError, SinkError};
use kiai_motion::export::{export_stream, CsvExporter, DEFAULT_LABEL};
use kiai_motion::features::FeatureSchema;
use kiai_motion::influx::{InfluxClient, InfluxConfig};
use kiai_motion::link::{Backoff, LinkManager, LinkOptions, LinkTarget, RetryPolicy, Transport};
use kiai_motion::pipeline::{relay_environment, Evaluation, MotionPipeline};
use kiai_motion::sink::{NdjsonSink, QueuedSink, DEFAULT_QUEUE_CAPACITY};
use kiai_motion::transport::transport_for;
use kiai_motion::types::PipelineState;
use kiai_motion::{KIAI_VERSION, PRODUCER_NAME};

/// KiAI - real-time motion analytics for kendo training sensors
#[derive(Parser)]
#[command(name = "kiai")]
#[command(author = "KiAI Contributors")]
#[command(version = KIAI_VERSION)]
#[command(about = "Capture, persist and classify motion sensor streams", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Capture labelled motion frames to <directory>/<label>.csv
    Export {
        /// Serial device, capture file, host:port or - for stdin
        #[arg(short, long)]
        port: String,

        /// Serial baud rate
        #[arg(short, long, default_value = "115200")]
        baud: u32,

        /// Output directory
        #[arg(short, long, default_value = ".")]
        directory: PathBuf,

        /// Move label, used as the file name
        #[arg(short, long, default_value = DEFAULT_LABEL)]
        label: String,

        /// Seconds to wait before recording starts
        #[arg(long, default_value = "10")]
        countdown: u64,
    },

    /// Forward environment readings (mic, temperature, humidity) to a store
    Upload {
        /// Serial device, capture file, host:port or - for stdin
        #[arg(short, long)]
        port: String,

        /// Serial baud rate
        #[arg(short, long, default_value = "9600")]
        baud: u32,

        /// Destination
        #[arg(long, default_value = "ndjson")]
        sink: SinkKind,

        /// Measurement name for environment points
        #[arg(long, default_value = "sensor_data")]
        measurement: String,

        #[command(flatten)]
        influx: InfluxArgs,
    },

    /// Run the motion pipeline and print NDJSON evaluations
    Monitor {
        /// Serial device, capture file, host:port or - for stdin
        #[arg(short, long)]
        port: String,

        /// Serial baud rate
        #[arg(short, long, default_value = "115200")]
        baud: u32,

        /// Directory with scaler.json, label_encoder.json and model.json
        #[arg(short, long)]
        artifacts: Option<PathBuf>,

        /// Pipeline config file (JSON)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Override the window size
        #[arg(long)]
        window_size: Option<usize>,

        /// Override the evaluation interval in milliseconds
        #[arg(long)]
        interval_ms: Option<u64>,

        /// Persist motion and read environment values through InfluxDB
        #[arg(long)]
        store: Option<StoreKind>,

        #[command(flatten)]
        influx: InfluxArgs,
    },

    /// Print the feature schema
    Schema {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Clone, ValueEnum)]
enum SinkKind {
    /// One JSON point per line on stdout
    Ndjson,
    /// InfluxDB v2 HTTP API
    Influx,
}

#[derive(Clone, ValueEnum)]
enum StoreKind {
    /// InfluxDB v2 HTTP API
    Influx,
}

#[derive(clap::Args)]
struct InfluxArgs {
    /// InfluxDB base URL
    #[arg(long, default_value = "http://localhost:8086")]
    influx_url: String,

    /// InfluxDB organisation
    #[arg(long, default_value = "kiai")]
    influx_org: String,

    /// InfluxDB bucket
    #[arg(long, default_value = "kiai")]
    influx_bucket: String,
}

impl InfluxArgs {
    /// Token comes from `INFLUX_TOKEN`
    fn client(&self) -> Result<InfluxClient, SinkError> {
        InfluxClient::new(InfluxConfig::new(
            &self.influx_url,
            &self.influx_org,
            &self.influx_bucket,
        ))
    }
}

fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_target(false).with_writer(io::stderr))
        .init();

    let cli = Cli::parse();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!(
                "{}",
                serde_json::to_string(&CliError::from(e))
                    .unwrap_or_else(|_| "Unknown error".to_string())
            );
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<(), KiaiCliError> {
    match cli.command {
        Commands::Export {
            port,
            baud,
            directory,
            label,
            countdown,
        } => cmd_export(&port, baud, &directory, &label, countdown),

        Commands::Upload {
            port,
            baud,
            sink,
            measurement,
            influx,
        } => cmd_upload(&port, baud, sink, &measurement, &influx),

        Commands::Monitor {
            port,
            baud,
            artifacts,
            config,
            window_size,
            interval_ms,
            store,
            influx,
        } => {
            let mut pipeline_config = match config {
                Some(path) => PipelineConfig::from_file(&path)?,
                None => PipelineConfig::default(),
            };
            if let Some(n) = window_size {
                pipeline_config.window_size = n;
            }
            if let Some(ms) = interval_ms {
                pipeline_config.eval_interval_ms = ms;
            }
            pipeline_config.validate()?;

            let store = match store {
                Some(StoreKind::Influx) => Some(influx.client()?),
                None => None,
            };
            cmd_monitor(&port, baud, artifacts.as_deref(), pipeline_config, store)
        }

        Commands::Schema { json } => cmd_schema(json),
    }
}

/// Flag flipped by Ctrl-C, watched from a helper thread running a small runtime
fn interrupt_flag() -> Result<Arc<AtomicBool>, KiaiCliError> {
    let flag = Arc::new(AtomicBool::new(false));
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    let watched = Arc::clone(&flag);
    thread::spawn(move || {
        runtime.block_on(async {
            if tokio::signal::ctrl_c().await.is_ok() {
                watched.store(true, Ordering::Relaxed);
            }
        })
    });
    Ok(flag)
}

fn open_link(
    port: &str,
    baud: u32,
    policy: RetryPolicy,
    cancel: &Arc<AtomicBool>,
) -> Result<LinkManager<Box<dyn Transport + Send>>, KiaiCliError> {
    let target = LinkTarget::parse(port).map_err(PipelineError::from)?;
    if target == LinkTarget::Stdin && atty::is(atty::Stream::Stdin) {
        warn!("reading frames from an interactive terminal; pipe a capture or pass --port");
    }

    let options = LinkOptions {
        baud,
        ..LinkOptions::default()
    };
    let mut link = LinkManager::new(transport_for(&target), target, options)
        .with_retry_policy(policy)
        .with_cancel_flag(Arc::clone(cancel));
    link.open().map_err(PipelineError::from)?;
    Ok(link)
}

/// Device nodes that look like serial adapters
fn serial_candidates() -> Vec<PathBuf> {
    const PREFIXES: [&str; 4] = ["ttyUSB", "ttyACM", "cu.usb", "tty.usb"];
    let mut found: Vec<PathBuf> = std::fs::read_dir("/dev")
        .map(|entries| {
            entries
                .filter_map(Result::ok)
                .filter(|e| {
                    let name = e.file_name();
                    let name = name.to_string_lossy();
                    PREFIXES.iter().any(|p| name.starts_with(p))
                })
                .map(|e| e.path())
                .collect()
        })
        .unwrap_or_default();
    found.sort();
    found
}

fn cmd_export(
    port: &str,
    baud: u32,
    directory: &Path,
    label: &str,
    countdown: u64,
) -> Result<(), KiaiCliError> {
    let candidates = serial_candidates();
    if candidates.is_empty() {
        eprintln!("No serial adapters found under /dev");
    } else {
        eprintln!("Available serial ports:");
        for path in &candidates {
            eprintln!("  {}", path.display());
        }
    }

    let stop = interrupt_flag()?;
    let mut exporter = CsvExporter::open(directory, label)?;

    for remaining in (1..=countdown).rev() {
        if stop.load(Ordering::Relaxed) {
            return Ok(());
        }
        eprintln!("Recording '{label}' starts in {remaining}...");
        thread::sleep(Duration::from_secs(1));
    }

    let mut link = open_link(port, baud, RetryPolicy::default(), &stop)?;
    eprintln!("Recording to {} (Ctrl-C to stop)", exporter.path().display());

    let result = export_stream(&mut link, &mut exporter, Duration::from_millis(100), &stop);
    link.close();
    result?;
    Ok(())
}

fn cmd_upload(
    port: &str,
    baud: u32,
    sink_kind: SinkKind,
    measurement: &str,
    influx: &InfluxArgs,
) -> Result<(), KiaiCliError> {
    // Store writes run on a writer thread
    let mut sink = match sink_kind {
        SinkKind::Ndjson => {
            QueuedSink::spawn(NdjsonSink::new(io::stdout()), DEFAULT_QUEUE_CAPACITY)
        }
        SinkKind::Influx => QueuedSink::spawn(influx.client()?, DEFAULT_QUEUE_CAPACITY),
    };

    let stop = interrupt_flag()?;
    // The environment board is expected to come back; keep retrying until interrupted
    let policy = RetryPolicy {
        max_attempts: None,
        backoff: Backoff::Fixed { delay_ms: 1_000 },
    };
    let mut link = open_link(port, baud, policy, &stop)?;

    let summary = relay_environment(
        &mut link,
        &mut sink,
        measurement,
        Duration::from_millis(100),
        &stop,
    )
    .map_err(KiaiCliError::from)?;
    info!(reason = ?summary.reason, environment = summary.decode.environment, "upload finished");
    Ok(())
}

/// One line of `monitor` output
#[derive(Serialize)]
struct EvaluationRecord<'a> {
    producer: &'static str,
    session_id: &'a str,
    sequence: u64,
    #[serde(flatten)]
    evaluation: &'a Evaluation,
    state: &'a PipelineState,
}

fn cmd_monitor(
    port: &str,
    baud: u32,
    artifacts: Option<&Path>,
    config: PipelineConfig,
    store: Option<InfluxClient>,
) -> Result<(), KiaiCliError> {
    let retry = config.retry;
    let mut pipeline = MotionPipeline::new(config)?;
    if let Some(dir) = artifacts {
        let loaded = ClassifierArtifacts::load_dir(dir, &FeatureSchema::motion_v1())
            .map_err(PipelineError::from)?;
        pipeline = pipeline
            .with_classifier(Classifier::new(loaded))
            .map_err(PipelineError::from)?;
    } else {
        warn!("no --artifacts given, running without classification");
    }
    if let Some(client) = store {
        pipeline = pipeline
            .with_motion_sink(client.clone())
            .with_environment_sink(client.clone())
            .with_environment_source(client);
    }

    let stop = interrupt_flag()?;
    let mut link = open_link(port, baud, retry, &stop)?;

    let session_id = Uuid::new_v4().to_string();
    info!(session_id = %session_id, "monitoring started");

    let stdout = io::stdout();
    let mut out = stdout.lock();
    let mut state = PipelineState::default();
    let mut write_error: Option<io::Error> = None;

    let summary = pipeline.run(&mut link, &mut state, &stop, |evaluation, state| {
        if write_error.is_some() {
            return;
        }
        let record = EvaluationRecord {
            producer: PRODUCER_NAME,
            session_id: &session_id,
            sequence: state.evaluations,
            evaluation,
            state,
        };
        let result = serde_json::to_writer(&mut out, &record)
            .map_err(io::Error::from)
            .and_then(|()| writeln!(out))
            .and_then(|()| out.flush());
        if let Err(e) = result {
            // Broken pipe on stdout: stop the run
            stop.store(true, Ordering::Relaxed);
            write_error = Some(e);
        }
    })?;

    if let Some(e) = write_error {
        if e.kind() != io::ErrorKind::BrokenPipe {
            return Err(e.into());
        }
    }
    info!(reason = ?summary.reason, evaluations = summary.evaluations, "monitoring finished");
    Ok(())
}

fn cmd_schema(json: bool) -> Result<(), KiaiCliError> {
    let schema = FeatureSchema::motion_v1();
    if json {
        #[derive(Serialize)]
        struct SchemaDoc<'a> {
            #[serde(flatten)]
            schema: &'a FeatureSchema,
            names: Vec<String>,
        }
        let doc = SchemaDoc {
            schema: &schema,
            names: schema.names(),
        };
        println!("{}", serde_json::to_string_pretty(&doc)?);
    } else {
        println!("Feature schema: {}", schema.version);
        println!();
        println!(
            "{} values: {} axes x {} statistics, axis-major",
            schema.len(),
            schema.axes.len(),
            schema.statistics.len()
        );
        for (i, name) in schema.names().iter().enumerate() {
            println!("  {i:>2}  {name}");
        }
    }
    Ok(())
}

// Error handling

#[derive(Debug)]
enum KiaiCliError {
    Io(io::Error),
    Json(serde_json::Error),
    Pipeline(PipelineError),
    Sink(SinkError),
}

impl From<io::Error> for KiaiCliError {
    fn from(e: io::Error) -> Self {
        KiaiCliError::Io(e)
    }
}

impl From<serde_json::Error> for KiaiCliError {
    fn from(e: serde_json::Error) -> Self {
        KiaiCliError::Json(e)
    }
}

impl From<PipelineError> for KiaiCliError {
    fn from(e: PipelineError) -> Self {
        KiaiCliError::Pipeline(e)
    }
}

impl From<ConfigError> for KiaiCliError {
    fn from(e: ConfigError) -> Self {
        KiaiCliError::Pipeline(PipelineError::Config(e))
    }
}

impl From<SinkError> for KiaiCliError {
    fn from(e: SinkError) -> Self {
        KiaiCliError::Sink(e)
    }
}

#[derive(Serialize)]
struct CliError {
    code: String,
    message: String,
    hint: Option<String>,
}

impl From<KiaiCliError> for CliError {
    fn from(e: KiaiCliError) -> Self {
        let (code, hint) = match &e {
            KiaiCliError::Io(_) => ("IO_ERROR", Some("Check file paths and permissions")),
            KiaiCliError::Json(_) => ("JSON_ERROR", None),
            KiaiCliError::Sink(_) => (
                "SINK_ERROR",
                Some("Check the store URL and the INFLUX_TOKEN environment variable"),
            ),
            KiaiCliError::Pipeline(p) => match p {
                PipelineError::Connection(_) => (
                    "CONNECTION_ERROR",
                    Some("Check --port; use a device path, host:port or - for stdin"),
                ),
                PipelineError::Link(_) => (
                    "LINK_LOST",
                    Some("The sensor stopped responding; check cabling and power"),
                ),
                PipelineError::Artifacts(_) => (
                    "ARTIFACT_ERROR",
                    Some("Artifacts must be fitted on the schema printed by `kiai schema`"),
                ),
                PipelineError::Config(_) => ("CONFIG_ERROR", None),
                PipelineError::Window(_) => ("CONFIG_ERROR", Some("window_size must be > 0")),
            },
        };
        let message = match e {
            KiaiCliError::Io(e) => e.to_string(),
            KiaiCliError::Json(e) => e.to_string(),
            KiaiCliError::Sink(e) => e.to_string(),
            KiaiCliError::Pipeline(e) => e.to_string(),
        };
        CliError {
            code: code.to_string(),
            message,
            hint: hint.map(str::to_string),
        }
    }
}
