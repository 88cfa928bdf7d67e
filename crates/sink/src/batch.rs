//! The internal batch buffer of a sink.

use tokio::time::Instant;

use crate::OutboundRecord;

/// A batch bounded by a record count and a byte size; the flusher also
/// bounds it in time through [`Batch::deadline`].
#[derive(Debug)]
pub(crate) struct Batch {
    records: Vec<OutboundRecord>,
    bytes: usize,
    oldest: Option<Instant>,
    max_records: usize,
    max_bytes: usize,
}

impl Batch {
    pub(crate) fn new(max_records: usize, max_bytes: usize) -> Self {
        Self {
            records: Vec::with_capacity(max_records),
            bytes: 0,
            oldest: None,
            max_records,
            max_bytes,
        }
    }

    /// Appends a record, stamping the age of the batch on the first one.
    pub(crate) fn push(&mut self, record: OutboundRecord) {
        if self.records.is_empty() {
            self.oldest = Some(Instant::now());
        }
        self.bytes += record.data.len() + record.partition_key.len();
        self.records.push(record);
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub(crate) fn len(&self) -> usize {
        self.records.len()
    }

    /// True once either the record-count or the byte limit is reached.
    pub(crate) fn is_full(&self) -> bool {
        self.records.len() >= self.max_records || self.bytes >= self.max_bytes
    }

    /// The instant at which the delay threshold fires for the oldest
    /// buffered record, when the batch is non-empty.
    pub(crate) fn deadline(&self, delay_threshold: std::time::Duration) -> Option<Instant> {
        self.oldest.map(|oldest| oldest + delay_threshold)
    }

    /// Takes the buffered records, leaving an empty batch.
    pub(crate) fn take(&mut self) -> Vec<OutboundRecord> {
        self.bytes = 0;
        self.oldest = None;
        std::mem::take(&mut self.records)
    }
}
