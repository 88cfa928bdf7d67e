//! The batching sink implementation over an abstract stream producer.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use config::OutputConfig;
use futures::{
    future::{select, Either},
    pin_mut,
};
use tokio::task::JoinHandle;
use tracing::{error, trace, warn};

use crate::{backoff::Backoff, batch::Batch, AttributedData, Error, OutboundRecord, PublishError, StreamProducer};

/// A batched, partition-keyed, retrying sink.
///
/// Records are accepted into a bounded buffer (the back-pressure point) and
/// drained by a single flusher task that publishes a batch when one of
/// three limits fires first: record count, byte size, or the delay
/// threshold measured from the oldest buffered record.
pub struct StreamSink {
    name: String,
    sender: Mutex<Option<flume::Sender<AttributedData>>>,
    shared: Arc<Shared>,
    flusher: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

#[derive(Default)]
struct Shared {
    failure: Mutex<Option<String>>,
}

impl Shared {
    fn failure(&self) -> Option<String> {
        self.failure.lock().expect("unexpected failure lock issue").clone()
    }

    fn record_failure(&self, error: String) {
        let mut failure = self.failure.lock().expect("unexpected failure lock issue");
        if failure.is_none() {
            *failure = Some(error);
        }
    }
}

impl StreamSink {
    /// Creates a sink for one output and spawns its flusher task.
    pub fn new(name: impl Into<String>, config: &OutputConfig, producer: Arc<dyn StreamProducer>) -> Self {
        let name = name.into();
        let (sender, receiver) = flume::bounded(config.max_batch_size);
        let shared = Arc::new(Shared::default());

        let flusher = Flusher {
            name: name.clone(),
            stream_name: config.stream_name.clone(),
            producer,
            receiver,
            max_records: config.max_batch_size,
            max_bytes: config.max_batch_bytes,
            delay_threshold: config.delay_threshold,
            backoff_policy: config.backoff_policy.clone(),
            shared: shared.clone(),
        };
        let handle = tokio::spawn(flusher.run());

        Self {
            name,
            sender: Mutex::new(Some(sender)),
            shared,
            flusher: tokio::sync::Mutex::new(Some(handle)),
        }
    }
}

#[async_trait]
impl crate::AsyncSink for StreamSink {
    fn name(&self) -> &str {
        &self.name
    }

    async fn publish(&self, data: AttributedData) -> Result<(), Error> {
        if let Some(error) = self.shared.failure() {
            return Err(Error::Failed {
                sink: self.name.clone(),
                error,
            });
        }

        let sender = self
            .sender
            .lock()
            .expect("unexpected sender lock issue")
            .clone();
        let sender = sender.ok_or_else(|| Error::Closed {
            sink: self.name.clone(),
        })?;

        sender.send_async(data).await.map_err(|_| match self.shared.failure() {
            Some(error) => Error::Failed {
                sink: self.name.clone(),
                error,
            },
            None => Error::Closed {
                sink: self.name.clone(),
            },
        })
    }

    async fn close(&self) -> Result<(), Error> {
        // Dropping the sender lets the flusher drain the buffer and exit.
        drop(
            self.sender
                .lock()
                .expect("unexpected sender lock issue")
                .take(),
        );

        let handle = self.flusher.lock().await.take();
        if let Some(handle) = handle {
            handle.await.map_err(|err| Error::Flush {
                sink: self.name.clone(),
                error: err.to_string(),
            })?;
        }

        match self.shared.failure() {
            Some(error) => Err(Error::Flush {
                sink: self.name.clone(),
                error,
            }),
            None => Ok(()),
        }
    }
}

/// What woke the flusher up.
enum Wakeup {
    Received(Result<AttributedData, flume::RecvError>),
    DelayExpired,
}

struct Flusher {
    name: String,
    stream_name: String,
    producer: Arc<dyn StreamProducer>,
    receiver: flume::Receiver<AttributedData>,
    max_records: usize,
    max_bytes: usize,
    delay_threshold: std::time::Duration,
    backoff_policy: config::BackoffPolicy,
    shared: Arc<Shared>,
}

impl Flusher {
    async fn run(self) {
        let mut batch = Batch::new(self.max_records, self.max_bytes);

        loop {
            let wakeup = match batch.deadline(self.delay_threshold) {
                Some(deadline) => {
                    let recv_fut = self.receiver.recv_async();
                    let sleep_fut = tokio::time::sleep_until(deadline);
                    pin_mut!(recv_fut, sleep_fut);

                    match select(recv_fut, sleep_fut).await {
                        Either::Left((received, _)) => Wakeup::Received(received),
                        Either::Right(_) => Wakeup::DelayExpired,
                    }
                }
                None => Wakeup::Received(self.receiver.recv_async().await),
            };

            match wakeup {
                Wakeup::Received(Ok(data)) => {
                    batch.push(outbound(data));
                    if batch.is_full() && !self.flush(&mut batch).await {
                        // A fatal producer error: dropping the receiver
                        // unblocks every pending publish with an error.
                        return;
                    }
                }
                Wakeup::Received(Err(_)) => break,
                Wakeup::DelayExpired => {
                    if !self.flush(&mut batch).await {
                        return;
                    }
                }
            }
        }

        // Close path: records queued at close time are delivered before the
        // sink reports closed.
        let _ = self.flush(&mut batch).await;
        if let Err(error) = self.producer.close().await {
            warn!(sink = %self.name, stream_name = %self.stream_name, %error, "producer close failed");
        }
        trace!(sink = %self.name, "flusher stopped");
    }

    /// Publishes the buffered batch, retrying transient rejections with
    /// capped exponential backoff. Returns false on a fatal producer error.
    async fn flush(&self, batch: &mut Batch) -> bool {
        if batch.is_empty() {
            return true;
        }

        let mut records = batch.take();
        let mut backoff = Backoff::new(&self.backoff_policy);

        loop {
            match self.producer.put_records(&records).await {
                Ok(()) => {
                    trace!(sink = %self.name, count = records.len(), "batch published");
                    return true;
                }
                Err(PublishError::Transient { error }) => {
                    let delay = backoff.next_delay();
                    warn!(
                        sink = %self.name,
                        stream_name = %self.stream_name,
                        %error,
                        retry_in_ms = %delay.as_millis(),
                        "batch rejected, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(PublishError::Partial { failed, error }) => {
                    records = retain_indices(records, &failed);
                    if records.is_empty() {
                        return true;
                    }
                    let delay = backoff.next_delay();
                    warn!(
                        sink = %self.name,
                        stream_name = %self.stream_name,
                        %error,
                        rejected = records.len(),
                        retry_in_ms = %delay.as_millis(),
                        "batch partially rejected, retrying the rejected subset"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(PublishError::Fatal { error }) => {
                    error!(sink = %self.name, stream_name = %self.stream_name, %error, "fatal publish failure");
                    self.shared.record_failure(error);
                    return false;
                }
            }
        }
    }
}

/// Resolves the partition key: the sole attribute value when present, a
/// random 128-bit identifier otherwise.
fn outbound(data: AttributedData) -> OutboundRecord {
    let partition_key = data
        .partition_key()
        .map(str::to_string)
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    OutboundRecord {
        partition_key,
        data: data.bytes,
    }
}

/// Keeps the records whose indices the broker rejected.
fn retain_indices(records: Vec<OutboundRecord>, failed: &[usize]) -> Vec<OutboundRecord> {
    records
        .into_iter()
        .enumerate()
        .filter(|(idx, _)| failed.contains(idx))
        .map(|(_, record)| record)
        .collect()
}
