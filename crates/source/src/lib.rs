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

//! The source side of the pipeline: raw records, idempotent ack handles,
//! and the `AsyncSource` trait implemented per deployment flavour.

pub mod signal;

use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
};

use async_trait::async_trait;
use config::InputConfig;
// The crate carrying the pause gate shares its name with the sibling
// control-signal module, hence the leading `::`.
use ::signal::PauseGate;
use tokio::sync::mpsc::Sender;

use crate::signal::SignalReceiver;

/// List of errors that can occur with a source.
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// The source flavour is not known to the factory.
    #[error("unknown source (source: {name})")]
    UnknownSource {
        /// The name of the source.
        name: String,
    },

    /// The source configuration is invalid.
    #[error("invalid configuration (reason: {message}, source: {name})")]
    InvalidConfig {
        /// The name of the source.
        name: String,
        /// The error message.
        message: String,
    },

    /// The upstream pull failed unrecoverably.
    #[error("source error (source: {name}, reason: {message})")]
    Pull {
        /// The name of the source.
        name: String,
        /// The error message.
        message: String,
    },

    /// The downstream channel rejected a record (the pipeline is shutting
    /// down).
    #[error("source channel closed (source: {name})")]
    ChannelClosed {
        /// The name of the source.
        name: String,
    },
}

/// The checkpoint side of one raw record, implemented by the source.
pub trait Acker: Send + Sync {
    /// Commits progress past the record this handle belongs to.
    fn ack(&self);
}

/// A per-record acknowledge handle. Idempotent: the underlying commit runs
/// at most once, however many times `ack` is called.
#[derive(Clone)]
pub struct AckHandle {
    acker: Arc<dyn Acker>,
    acked: Arc<AtomicBool>,
}

impl AckHandle {
    /// Wraps a source-provided acker.
    pub fn new(acker: Arc<dyn Acker>) -> Self {
        Self {
            acker,
            acked: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Commits progress past this record. Fire-and-forget; calling it twice
    /// is equivalent to calling it once.
    pub fn ack(&self) {
        if !self.acked.swap(true, Ordering::AcqRel) {
            self.acker.ack();
        }
    }

    /// True once `ack` has been called.
    pub fn is_acked(&self) -> bool {
        self.acked.load(Ordering::Acquire)
    }
}

impl fmt::Debug for AckHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AckHandle").field("acked", &self.is_acked()).finish()
    }
}

/// One raw record: opaque payload bytes plus the handle that commits
/// progress past it.
#[derive(Debug, Clone)]
pub struct RawRecord {
    /// The opaque payload.
    pub payload: Vec<u8>,
    /// The acknowledge handle.
    pub ack: AckHandle,
}

/// Handler used by a source to feed records into the pipeline.
///
/// The handler owns the pause point (records yield while the pause signal
/// is asserted), the monotonic sequence stamp used by the ordered output
/// gate, and the bounded channel send that provides back-pressure.
#[derive(Clone)]
pub struct EffectHandler {
    source_name: String,
    sender: flume::Sender<(u64, RawRecord)>,
    gate: Arc<PauseGate>,
    sequence: Arc<AtomicU64>,
}

impl EffectHandler {
    /// Creates an effect handler over the raw-record channel.
    pub fn new(source_name: impl Into<String>, sender: flume::Sender<(u64, RawRecord)>, gate: Arc<PauseGate>) -> Self {
        Self {
            source_name: source_name.into(),
            sender,
            gate,
            sequence: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Sends one raw record into the pipeline. Suspends while the pause
    /// signal is asserted or the channel is full.
    pub async fn send_record(&self, record: RawRecord) -> Result<(), Error> {
        self.gate.wait_if_paused().await;
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);
        self.sender
            .send_async((sequence, record))
            .await
            .map_err(|_| Error::ChannelClosed {
                name: self.source_name.clone(),
            })
    }
}

/// The source trait, implemented per deployment flavour (Kinesis, PubSub,
/// in-memory test source, ...).
#[async_trait]
pub trait AsyncSource: Send {
    // Optional methods
    /// Method called before the source starts pulling.
    async fn init(&mut self) -> Result<(), Error> {
        Ok(())
    }
    /// Method called after the source has stopped pulling.
    async fn stop(&mut self) -> Result<(), Error> {
        Ok(())
    }

    // Mandatory methods
    /// Pulls records until the upstream cursor closes or a stop signal
    /// arrives. The implementation retries transient pull failures itself;
    /// an error return is unrecoverable and fatal to the pipeline.
    async fn run(&mut self, signal_receiver: SignalReceiver, effect_handler: EffectHandler) -> Result<(), Error>;
}

/// The source factory trait: builds the deployment's source from the typed
/// input configuration.
pub trait SourceFactory: Send + Sync {
    /// Creates a new source.
    fn create(&self, config: &InputConfig) -> Result<Box<dyn AsyncSource + Sync>, Error>;
}

/// Controller used by the runtime to stop a running source.
pub struct SourceController {
    source_name: String,
    sender: Sender<signal::Signal>,
}

impl SourceController {
    /// Creates a controller over the source control channel.
    pub fn new(source_name: impl Into<String>, sender: Sender<signal::Signal>) -> Self {
        Self {
            source_name: source_name.into(),
            sender,
        }
    }

    /// Requests the source to stop pulling.
    pub fn stop(&self) {
        tracing::info!(source = %self.source_name, "stopping source");
        if let Err(error) = self.sender.try_send(signal::Signal::Stop) {
            tracing::debug!(
                %error,
                source = %self.source_name,
                "stop signal not delivered (source already stopping)"
            );
        }
    }
}
