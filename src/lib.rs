//! KiAI Motion - real-time motion stream analytics
//!
//! Reads newline-delimited frames from an inertial sensor, keeps a sliding
//! window of motion samples and turns each window into kinematic metrics and
//! a move classification: link → decode → window → features/kinematics →
//! classifier → sinks.
//!
//! ## Modules
//!
//! - **Acquisition**: `link`, `transport`, `decoder`
//! - **Analytics**: `window`, `features`, `kinematics`, `classifier`
//! - **Persistence**: `sink`, `export`, `influx` (feature `influx`)
//! - **Orchestration**: `pipeline`, `environment`, `config`

pub mod classifier;
pub mod config;
pub mod decoder;
pub mod environment;
pub mod error;
pub mod export;
pub mod features;
#[cfg(feature = "influx")]
pub mod influx;
pub mod kinematics;
pub mod link;
pub mod pipeline;
pub mod sink;
pub mod transport;
pub mod types;
pub mod window;

pub use classifier::{Classifier, ClassifierArtifacts};
pub use config::PipelineConfig;
pub use decoder::FrameDecoder;
pub use error::PipelineError;
pub use features::{FeatureExtractor, FeatureSchema, FeatureVector};
pub use kinematics::Kinematics;
pub use link::{LinkManager, LinkTarget, RetryPolicy, Transport};
pub use pipeline::{Evaluation, MotionPipeline};
pub use types::{DerivedSignal, Label, PipelineState, Record, Sample};
pub use window::{SharedWindow, Window, WindowBuffer};

/// Crate version
pub const KIAI_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Producer name stamped on emitted records
pub const PRODUCER_NAME: &str = "kiai-motion";
