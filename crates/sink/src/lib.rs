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

//! The sink layer: batched, partition-keyed, retrying publication of byte
//! records to a downstream stream.

use std::collections::HashMap;

use async_trait::async_trait;

pub mod backoff;
mod batch;
pub mod stream;

pub use stream::StreamSink;

/// All the errors that can occur with a sink.
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// The sink has been closed; no further publish is accepted.
    #[error("sink closed (sink: {sink})")]
    Closed {
        /// The name of the sink.
        sink: String,
    },

    /// The sink failed fatally and will accept no further publish.
    #[error("sink failed (sink: {sink}, reason: {error})")]
    Failed {
        /// The name of the sink.
        sink: String,
        /// The error message.
        error: String,
    },

    /// The close-time flush did not complete cleanly.
    #[error("sink flush error (sink: {sink}, reason: {error})")]
    Flush {
        /// The name of the sink.
        sink: String,
        /// The error message.
        error: String,
    },
}

/// One record plus its routing attributes.
///
/// The attribute map carries at most one entry, the partition key; the sink
/// takes the sole value when present and generates a random key otherwise.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttributedData {
    /// The record payload.
    pub bytes: Vec<u8>,
    /// The routing attributes.
    pub attributes: HashMap<String, String>,
}

impl AttributedData {
    /// Creates a record with no routing attribute.
    pub fn new(bytes: Vec<u8>) -> Self {
        Self {
            bytes,
            attributes: HashMap::new(),
        }
    }

    /// Creates a record with one routing attribute.
    pub fn with_attribute(bytes: Vec<u8>, key: impl Into<String>, value: impl Into<String>) -> Self {
        let mut attributes = HashMap::new();
        let _ = attributes.insert(key.into(), value.into());
        Self { bytes, attributes }
    }

    /// Returns the partition key: the sole attribute value, when present.
    pub fn partition_key(&self) -> Option<&str> {
        self.attributes.values().next().map(String::as_str)
    }
}

/// One record as handed to the broker producer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundRecord {
    /// The partition key routing the record.
    pub partition_key: String,
    /// The record payload.
    pub data: Vec<u8>,
}

/// Broker rejection classes, as surfaced by a producer.
#[derive(thiserror::Error, Debug, Clone)]
#[non_exhaustive]
pub enum PublishError {
    /// The whole batch was rejected transiently (network error,
    /// throttling); it is retried with backoff.
    #[error("transient publish failure (reason: {error})")]
    Transient {
        /// The error message.
        error: String,
    },

    /// The broker accepted part of the batch; the listed indices are
    /// re-submitted with backoff.
    #[error("partial publish failure ({} records rejected, reason: {error})", failed.len())]
    Partial {
        /// Indices (into the submitted batch) of the rejected records.
        failed: Vec<usize>,
        /// The error message.
        error: String,
    },

    /// A programmer error (invalid arguments); never retried.
    #[error("fatal publish failure (reason: {error})")]
    Fatal {
        /// The error message.
        error: String,
    },
}

/// The broker write interface the sink retries over. Implemented per
/// deployment flavour (Kinesis, PubSub, ...).
#[async_trait]
pub trait StreamProducer: Send + Sync {
    /// Publishes one batch. A partial acceptance is reported through
    /// [`PublishError::Partial`].
    async fn put_records(&self, records: &[OutboundRecord]) -> Result<(), PublishError>;

    /// Releases broker resources.
    async fn close(&self) -> Result<(), PublishError> {
        Ok(())
    }
}

/// The sink trait: publish completes once the record has been accepted into
/// the internal buffer; close flushes and releases broker resources.
#[async_trait]
pub trait AsyncSink: Send + Sync {
    /// The name of the sink (good, pii, bad).
    fn name(&self) -> &str;

    /// Publishes one record. Suspends while the internal buffer is full:
    /// this is the back-pressure channel of the whole pipeline.
    async fn publish(&self, data: AttributedData) -> Result<(), Error>;

    /// Flushes the buffer with the usual retry policy, then releases broker
    /// resources. Records queued at close time are delivered before the
    /// call returns.
    async fn close(&self) -> Result<(), Error>;
}

#[cfg(test)]
mod test {
    use crate::AttributedData;

    #[test]
    fn partition_key_is_the_sole_attribute_value() {
        let plain = AttributedData::new(b"r".to_vec());
        assert_eq!(plain.partition_key(), None);

        let keyed = AttributedData::with_attribute(b"r".to_vec(), "partition_key", "user-17");
        assert_eq!(keyed.partition_key(), Some("user-17"));
    }
}
