//! Error types for KiAI Motion
//!
//! Transient errors (decode, link faults, model input, sink writes) are
//! recovered locally by the pipeline and only logged. `ArtifactLoadError`
//! and `LinkError::Fatal` are the ones that end a run.

use std::io;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// A line that could not be turned into a sample
#[derive(Debug, Clone, PartialEq, Error)]
pub enum DecodeError {
    #[error("Invalid JSON frame: {0}")]
    InvalidJson(String),

    #[error("JSON frame is not an object")]
    NotAnObject,

    #[error("Unrecognized frame shape: {0:?}")]
    Unrecognized(String),

    #[error("Numeric field out of range: {0}")]
    InvalidNumber(String),
}

/// Failure to establish a transport connection
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("Failed to open {target}: {source}")]
    Open {
        target: String,
        #[source]
        source: io::Error,
    },

    #[error("Invalid link target: {0}")]
    InvalidTarget(String),
}

/// Failure while reading from an open link
#[derive(Debug, Error)]
pub enum LinkError {
    #[error("Read failed: {0}")]
    Io(#[from] io::Error),

    #[error("Transport closed by peer")]
    Closed,

    #[error("Transport is not open")]
    NotOpen,

    #[error("End of input stream")]
    EndOfStream,

    #[error("Reconnect cancelled")]
    Cancelled,

    #[error("Link lost after {attempts} reconnect attempts: {last}")]
    Fatal { attempts: u32, last: String },
}

/// Window buffer rejections
#[derive(Debug, Clone, PartialEq, Error)]
pub enum WindowError {
    #[error("Window capacity must be at least 1")]
    ZeroCapacity,

    #[error("Only motion samples can enter the window (got {0})")]
    NotMotion(&'static str),
}

/// A feature vector that does not fit the fitted scaler/model
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ModelInputError {
    #[error("Feature vector has {actual} values, scaler expects {expected}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("Feature vector built for schema {actual}, classifier fitted on {expected}")]
    SchemaMismatch { expected: String, actual: String },

    #[error("Feature vector contains a non-finite value at index {0}")]
    NonFinite(usize),

    #[error("Model produced class index {index} but encoder knows {classes} classes")]
    UnknownClass { index: usize, classes: usize },
}

/// Persistence or query failure of an external store
#[derive(Debug, Error)]
pub enum SinkError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Request failed: {0}")]
    Request(String),

    #[error("Server error {status}: {message}")]
    Server { status: u16, message: String },

    #[error("Malformed query response: {0}")]
    MalformedResponse(String),

    #[error("Write queue full")]
    QueueFull,

    #[error("Sink worker has stopped")]
    WorkerStopped,

    #[error("Flush did not complete within {0:?}")]
    FlushTimeout(Duration),
}

/// Classifier artifacts missing, corrupt or incompatible with the feature schema
#[derive(Debug, Error)]
pub enum ArtifactLoadError {
    #[error("Cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Cannot parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Artifact dimension mismatch in {artifact}: expected {expected}, found {found}")]
    Dimension {
        artifact: &'static str,
        expected: usize,
        found: usize,
    },

    #[error("Feature name mismatch at position {position}: expected {expected}, found {found}")]
    FeatureName {
        position: usize,
        expected: String,
        found: String,
    },

    #[error("Artifacts fitted on schema {found}, pipeline uses {expected}")]
    SchemaVersion { expected: String, found: String },

    #[error("Invalid artifact: {0}")]
    Invalid(String),
}

/// Configuration parse failures
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Cannot read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Invalid config JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid config value: {0}")]
    Invalid(String),
}

/// Errors that end a pipeline run
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error(transparent)]
    Link(#[from] LinkError),

    #[error(transparent)]
    Artifacts(#[from] ArtifactLoadError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Window(#[from] WindowError),
}
