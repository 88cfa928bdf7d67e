#![deny(
    trivial_numeric_casts,
    missing_docs,
    unsafe_code,
    unstable_features,
    unused_import_braces,
    unused_qualifications,
    unused_extern_crates,
    unused_results
)]
#![warn(rust_2021_compatibility, unreachable_pub)]

//! The pipeline runtime: wires source → bounded-concurrency enrich →
//! fan-out to sinks → checkpoint, runs the asset-refresh and
//! metric-reporting side streams, and owns the shutdown choreography.

mod controller;
mod environment;
mod pipeline;

pub use controller::PipelineController;
pub use environment::{Collaborators, Environment, ProducerFactory};
pub use pipeline::Pipeline;

/// All the errors that can occur when running the pipeline.
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// A runtime error occurred.
    #[error("pipeline runtime error (reason: {error})")]
    Runtime {
        /// The error that occurred.
        error: String,
    },

    /// A resource could not be constructed at startup.
    #[error("startup error (stage: {stage}, reason: {reason})")]
    Startup {
        /// The construction stage that failed.
        stage: String,
        /// The error that occurred.
        reason: String,
    },

    /// The source failed unrecoverably.
    #[error("source error (source: {name}, reason: {error})")]
    Source {
        /// The source that failed.
        name: String,
        /// The error that occurred.
        error: String,
    },

    /// A sink failed unrecoverably.
    #[error("sink error (sink: {sink}, reason: {error})")]
    Sink {
        /// The sink that failed.
        sink: String,
        /// The error that occurred.
        error: String,
    },

    /// A configuration error occurred.
    #[error("configuration error (reason: {0})")]
    Config(#[from] config::Error),

    /// An asset error occurred.
    #[error("asset error (reason: {0})")]
    Assets(#[from] assets::Error),
}

impl Error {
    pub(crate) fn from_sink(error: sink::Error) -> Self {
        let sink = match &error {
            sink::Error::Closed { sink } => sink.clone(),
            sink::Error::Failed { sink, .. } => sink.clone(),
            sink::Error::Flush { sink, .. } => sink.clone(),
            _ => "unknown".to_string(),
        };
        Error::Sink {
            sink,
            error: error.to_string(),
        }
    }
}

/// The size of the shared worker pool: `max(2, CPU count)`.
pub fn worker_threads() -> usize {
    std::cmp::max(2, num_cpus::get())
}

/// Builds the tokio runtime, constructs the environment bundle, and drives
/// the pipeline until the source is exhausted, a stop is requested, or a
/// fatal error occurs. A non-`Ok` return maps to a non-zero process exit.
pub fn run(config: config::Config, collaborators: Collaborators) -> Result<(), Error> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(worker_threads())
        .enable_all()
        .build()
        .map_err(|err| Error::Runtime { error: err.to_string() })?;

    let result = runtime.block_on(async move {
        let environment = Environment::build(config, collaborators).await?;
        Pipeline::new(environment).run().await
    });
    tracing::info!("pipeline stopped");
    result
}
