//! Per-payload orchestration: decode, validate, enrich, gate on the size
//! ceiling, and split into good / pii / bad outcomes.

use std::{panic::AssertUnwindSafe, sync::Arc};

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use chrono::{DateTime, Utc};
use event::EnrichedEvent;
use sink::AttributedData;
use telemetry::{ExceptionSink, Metrics};
use tracing::trace;

use crate::{
    badrow::{BadRow, BadRowKind},
    CollectorPayload, Decoder, PiiExtractor, ProcessorId, Registry, SharedRegistry,
};

/// The attribute key under which the partition key travels to the sink.
const PARTITION_KEY_ATTRIBUTE: &str = "partition_key";

/// Everything a dispatcher is built from.
pub struct DispatcherSetup {
    /// The shared registry reference.
    pub registry: SharedRegistry,
    /// The collector payload decoder.
    pub decoder: Arc<dyn Decoder>,
    /// The PII-split rule, when a pii output is configured.
    pub pii_extractor: Option<Arc<dyn PiiExtractor>>,
    /// The processor identity stamped on events and failure records.
    pub processor: ProcessorId,
    /// The per-record size ceiling of the good output.
    pub max_record_bytes: usize,
    /// The event field routing good events, when configured.
    pub good_partition_field: Option<String>,
    /// The event field routing pii events, when configured.
    pub pii_partition_field: Option<String>,
    /// The shared pipeline counters.
    pub metrics: Arc<Metrics>,
    /// The exception reporter.
    pub exceptions: Arc<dyn ExceptionSink>,
}

/// One element of a record's result list.
#[derive(Debug)]
pub enum Outcome {
    /// A successfully enriched event, sink-ready, with its optional derived
    /// PII event.
    Good {
        /// The serialized event plus its routing attribute.
        event: AttributedData,
        /// The serialized derived PII event, when one was extracted.
        pii: Option<AttributedData>,
    },
    /// A failure record.
    Bad {
        /// The failure record.
        row: Box<BadRow>,
    },
}

/// The enrichment dispatcher. `dispatch` never fails: every per-record
/// problem is folded into the outcome list as a failure record.
pub struct Dispatcher {
    registry: SharedRegistry,
    decoder: Arc<dyn Decoder>,
    pii_extractor: Option<Arc<dyn PiiExtractor>>,
    processor: ProcessorId,
    max_record_bytes: usize,
    good_partition_field: Option<String>,
    pii_partition_field: Option<String>,
    metrics: Arc<Metrics>,
    exceptions: Arc<dyn ExceptionSink>,
}

impl Dispatcher {
    /// Creates a dispatcher.
    pub fn new(setup: DispatcherSetup) -> Self {
        Self {
            registry: setup.registry,
            decoder: setup.decoder,
            pii_extractor: setup.pii_extractor,
            processor: setup.processor,
            max_record_bytes: setup.max_record_bytes,
            good_partition_field: setup.good_partition_field,
            pii_partition_field: setup.pii_partition_field,
            metrics: setup.metrics,
            exceptions: setup.exceptions,
        }
    }

    /// Produces the result list for one raw payload.
    ///
    /// An enrichment panic is caught here, reported to the exception sink,
    /// and demoted to a generic-error failure record carrying the
    /// base64-encoded original bytes.
    pub fn dispatch(&self, bytes: &[u8]) -> Vec<Outcome> {
        match std::panic::catch_unwind(AssertUnwindSafe(|| self.dispatch_inner(bytes))) {
            Ok(outcomes) => outcomes,
            Err(panic) => {
                let message = panic_message(panic);
                self.exceptions.report(&message);
                self.metrics.increment_bad();
                vec![Outcome::Bad {
                    row: Box::new(BadRow::new(
                        BadRowKind::GenericError,
                        BASE64.encode(bytes),
                        self.processor.clone(),
                        vec![message],
                    )),
                }]
            }
        }
    }

    fn dispatch_inner(&self, bytes: &[u8]) -> Vec<Outcome> {
        let payload = match self.decoder.decode(bytes) {
            Ok(Some(payload)) => payload,
            Ok(None) => return vec![],
            Err(failure) => {
                self.metrics.increment_bad();
                return vec![Outcome::Bad {
                    row: Box::new(BadRow::new(
                        BadRowKind::CpformatViolation,
                        BASE64.encode(bytes),
                        self.processor.clone(),
                        failure.messages,
                    )),
                }];
            }
        };

        let etl_tstamp = Utc::now();
        // Single read: every lookup in this call resolves from one snapshot.
        let registry = self.registry.load_full();

        let CollectorPayload {
            collector_tstamp,
            source_ip,
            useragent,
            headers: _,
            events,
        } = payload;

        let mut outcomes = Vec::with_capacity(events.len());

        for mut event in events {
            self.seed(&mut event, etl_tstamp, collector_tstamp, &source_ip, &useragent);

            if let Err(messages) = self.validate(&registry, &event) {
                self.metrics.increment_bad();
                outcomes.push(self.bad(BadRowKind::SchemaViolation, self.sample(&event.to_tsv()), messages));
                continue;
            }

            let mut failures = Vec::new();
            let mut derived = Vec::new();
            for enrichment in registry.enrichments() {
                match enrichment.apply(&registry, &mut event) {
                    Ok(mut contexts) => derived.append(&mut contexts),
                    Err(mut messages) => failures.append(&mut messages),
                }
            }

            if !failures.is_empty() {
                self.metrics.increment_bad();
                outcomes.push(self.bad(BadRowKind::EnrichmentFailure, self.sample(&event.to_tsv()), failures));
                continue;
            }

            if !derived.is_empty() {
                event.derived_contexts = Some(
                    serde_json::to_string(&derived).expect("derived contexts are always serializable"),
                );
            }

            let row = event.to_tsv();
            if row.len() > self.max_record_bytes {
                self.metrics.increment_bad();
                outcomes.push(self.bad(
                    BadRowKind::SizeViolation,
                    self.sample(&row),
                    vec![format!(
                        "serialized event of {} bytes exceeds the ceiling of {} bytes",
                        row.len(),
                        self.max_record_bytes
                    )],
                ));
                continue;
            }

            self.metrics.increment_good();
            trace!(event_id = event.event_id.as_deref().unwrap_or(""), "event enriched");

            let pii = self.pii_extractor.as_ref().and_then(|extractor| {
                extractor.extract(&event).map(|pii_event| {
                    let pii_row = pii_event.to_tsv();
                    attributed(&pii_event, pii_row, &self.pii_partition_field)
                })
            });

            outcomes.push(Outcome::Good {
                event: attributed(&event, row, &self.good_partition_field),
                pii,
            });
        }

        if let Some(collected) = collector_tstamp {
            self.metrics
                .observe_latency((Utc::now() - collected).num_milliseconds());
        }

        outcomes
    }

    /// Stamps the dispatcher-owned fields onto a seed event.
    fn seed(
        &self,
        event: &mut EnrichedEvent,
        etl_tstamp: DateTime<Utc>,
        collector_tstamp: Option<DateTime<Utc>>,
        source_ip: &Option<String>,
        useragent: &Option<String>,
    ) {
        event.etl_tstamp = Some(format_tstamp(etl_tstamp));
        event.v_etl = Some(self.processor.tag());
        if event.collector_tstamp.is_none() {
            event.collector_tstamp = collector_tstamp.map(format_tstamp);
        }
        if event.user_ipaddress.is_none() {
            event.user_ipaddress = source_ip.clone();
        }
        if event.useragent.is_none() {
            event.useragent = useragent.clone();
        }
        if event.event_id.is_none() {
            event.event_id = Some(uuid::Uuid::new_v4().to_string());
        }
    }

    /// Validates the self-describing JSON the seed event carries.
    fn validate(&self, registry: &Registry, event: &EnrichedEvent) -> Result<(), Vec<String>> {
        let mut messages = Vec::new();

        for field in ["unstruct_event", "contexts"] {
            let Some(raw) = event.get(field) else { continue };
            match serde_json::from_str::<serde_json::Value>(raw) {
                Ok(json) => {
                    let schema_key = json
                        .get("schema")
                        .and_then(serde_json::Value::as_str)
                        .unwrap_or(field)
                        .to_string();
                    if let Err(mut errors) = registry.schema_client().validate(&json, &schema_key) {
                        messages.append(&mut errors);
                    }
                }
                Err(err) => messages.push(format!("field {field} is not valid JSON: {err}")),
            }
        }

        if messages.is_empty() {
            Ok(())
        } else {
            Err(messages)
        }
    }

    fn bad(&self, kind: BadRowKind, payload: String, messages: Vec<String>) -> Outcome {
        Outcome::Bad {
            row: Box::new(BadRow::new(kind, payload, self.processor.clone(), messages)),
        }
    }

    /// Truncates an oversized or failing row to `ceiling / 10` characters
    /// for inclusion in a failure record.
    fn sample(&self, row: &str) -> String {
        row.chars().take(self.max_record_bytes / 10).collect()
    }
}

/// Wraps a serialized row with its routing attribute, resolved from the
/// configured event field. An unset or empty field leaves the attribute map
/// empty and the sink falls back to a random key.
fn attributed(event: &EnrichedEvent, row: String, field: &Option<String>) -> AttributedData {
    match field
        .as_deref()
        .and_then(|field| event.get(field))
        .filter(|value| !value.is_empty())
    {
        Some(value) => AttributedData::with_attribute(row.into_bytes(), PARTITION_KEY_ATTRIBUTE, value),
        None => AttributedData::new(row.into_bytes()),
    }
}

fn format_tstamp(tstamp: DateTime<Utc>) -> String {
    tstamp.format("%Y-%m-%d %H:%M:%S%.3f").to_string()
}

fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "opaque enrichment panic".to_string()
    }
}
