//! Shared test doubles: an in-memory source and producers, a JSON payload
//! decoder, and a handful of enrichments.

use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex, Once,
    },
    time::Duration,
};

use async_trait::async_trait;
use chrono::Utc;
use enrich::{CollectorPayload, DecodeFailure, Decoder, Enrichment, PiiExtractor, Registry, SchemaClient};
use event::EnrichedEvent;
use runtime::ProducerFactory;
use sink::{OutboundRecord, PublishError, StreamProducer};
use source::{signal::SignalReceiver, AckHandle, Acker, AsyncSource, EffectHandler, RawRecord, SourceFactory};

static INIT: Once = Once::new();

pub fn init_tracing() {
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    });
}

/// Decodes a UTF-8 JSON document of the form
/// `{"events": [{"app_id": "shop", ...}], "ip": "..."}` into a collector
/// payload, each event object setting canonical fields by name.
pub struct JsonDecoder;

impl Decoder for JsonDecoder {
    fn decode(&self, bytes: &[u8]) -> Result<Option<CollectorPayload>, DecodeFailure> {
        let value: serde_json::Value = serde_json::from_slice(bytes).map_err(|err| DecodeFailure {
            messages: vec![format!("not a collector payload: {err}")],
        })?;

        let events = value["events"]
            .as_array()
            .cloned()
            .unwrap_or_default()
            .iter()
            .map(|object| {
                let mut event = EnrichedEvent::new();
                if let Some(map) = object.as_object() {
                    for (field, field_value) in map {
                        if let Some(text) = field_value.as_str() {
                            let _ = event.set(field, text);
                        }
                    }
                }
                event
            })
            .collect();

        Ok(Some(CollectorPayload {
            collector_tstamp: Some(Utc::now()),
            source_ip: value["ip"].as_str().map(str::to_string),
            useragent: None,
            headers: vec![],
            events,
        }))
    }
}

pub struct AcceptAllSchema;

impl SchemaClient for AcceptAllSchema {
    fn validate(&self, _json: &serde_json::Value, _schema_key: &str) -> Result<(), Vec<String>> {
        Ok(())
    }
}

/// Fails events whose `app_id` is `boom`, stamps `geo_country` otherwise.
pub struct GeoEnrichment;

impl Enrichment for GeoEnrichment {
    fn name(&self) -> &str {
        "geo"
    }

    fn apply(&self, _registry: &Registry, event: &mut EnrichedEvent) -> Result<Vec<serde_json::Value>, Vec<String>> {
        if event.app_id.as_deref() == Some("boom") {
            return Err(vec!["geo lookup failed".to_string()]);
        }
        event.geo_country = Some("IS".to_string());
        Ok(vec![])
    }
}

/// Derives a PII event carrying the source IP, when one is present.
pub struct CopyIpPii;

impl PiiExtractor for CopyIpPii {
    fn extract(&self, event: &EnrichedEvent) -> Option<EnrichedEvent> {
        event.user_ipaddress.as_ref().map(|ip| {
            let mut pii = EnrichedEvent::new();
            pii.user_ipaddress = Some(ip.clone());
            pii.event_id = event.event_id.clone();
            pii
        })
    }
}

struct IndexAcker {
    counts: Arc<Vec<AtomicUsize>>,
    index: usize,
}

impl Acker for IndexAcker {
    fn ack(&self) {
        let _ = self.counts[self.index].fetch_add(1, Ordering::SeqCst);
    }
}

/// A finite in-memory source: one ack counter per record.
pub struct MemorySource {
    records: Vec<Vec<u8>>,
    delay: Option<Duration>,
    acks: Arc<Vec<AtomicUsize>>,
}

impl MemorySource {
    pub fn new(records: Vec<Vec<u8>>, delay: Option<Duration>) -> (Self, Arc<Vec<AtomicUsize>>) {
        let acks: Arc<Vec<AtomicUsize>> = Arc::new((0..records.len()).map(|_| AtomicUsize::new(0)).collect());
        (
            Self {
                records,
                delay,
                acks: acks.clone(),
            },
            acks,
        )
    }
}

#[async_trait]
impl AsyncSource for MemorySource {
    async fn run(&mut self, mut signals: SignalReceiver, effects: EffectHandler) -> Result<(), source::Error> {
        for (index, payload) in self.records.iter().enumerate() {
            if signals.try_recv().is_some() {
                break;
            }
            let ack = AckHandle::new(Arc::new(IndexAcker {
                counts: self.acks.clone(),
                index,
            }));
            effects
                .send_record(RawRecord {
                    payload: payload.clone(),
                    ack,
                })
                .await?;
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
        }
        Ok(())
    }
}

/// Hands one prepared source out to the environment.
pub struct MemorySourceFactory {
    source: Mutex<Option<MemorySource>>,
}

impl MemorySourceFactory {
    pub fn new(source: MemorySource) -> Self {
        Self {
            source: Mutex::new(Some(source)),
        }
    }
}

impl SourceFactory for MemorySourceFactory {
    fn create(&self, _config: &config::InputConfig) -> Result<Box<dyn AsyncSource + Sync>, source::Error> {
        let source = self.source.lock().unwrap().take().ok_or(source::Error::UnknownSource {
            name: "memory source already taken".to_string(),
        })?;
        Ok(Box::new(source))
    }
}

/// Captures published batches; optionally fails the first put calls with a
/// scripted error sequence.
#[derive(Default)]
pub struct MemoryProducer {
    records: Mutex<Vec<OutboundRecord>>,
    failures: Mutex<VecDeque<PublishError>>,
}

impl MemoryProducer {
    pub fn with_failures(failures: Vec<PublishError>) -> Self {
        Self {
            records: Mutex::new(vec![]),
            failures: Mutex::new(failures.into()),
        }
    }

    pub fn records(&self) -> Vec<OutboundRecord> {
        self.records.lock().unwrap().clone()
    }

    pub fn rows(&self) -> Vec<String> {
        self.records()
            .iter()
            .map(|record| String::from_utf8(record.data.clone()).unwrap())
            .collect()
    }
}

#[async_trait]
impl StreamProducer for MemoryProducer {
    async fn put_records(&self, records: &[OutboundRecord]) -> Result<(), PublishError> {
        if let Some(failure) = self.failures.lock().unwrap().pop_front() {
            return Err(failure);
        }
        self.records.lock().unwrap().extend(records.iter().cloned());
        Ok(())
    }
}

/// Routes the three outputs to three in-memory producers.
pub struct MemoryProducerFactory {
    pub good: Arc<MemoryProducer>,
    pub pii: Arc<MemoryProducer>,
    pub bad: Arc<MemoryProducer>,
}

impl Default for MemoryProducerFactory {
    fn default() -> Self {
        Self {
            good: Arc::new(MemoryProducer::default()),
            pii: Arc::new(MemoryProducer::default()),
            bad: Arc::new(MemoryProducer::default()),
        }
    }
}

impl ProducerFactory for MemoryProducerFactory {
    fn create(&self, name: &str, _output: &config::OutputConfig) -> Result<Arc<dyn StreamProducer>, runtime::Error> {
        match name {
            "good" => Ok(self.good.clone()),
            "pii" => Ok(self.pii.clone()),
            "bad" => Ok(self.bad.clone()),
            other => Err(runtime::Error::Startup {
                stage: other.to_string(),
                reason: "unknown output".to_string(),
            }),
        }
    }
}

/// A collector payload with the given events, as the JSON decoder expects.
pub fn payload(events: &[serde_json::Value]) -> Vec<u8> {
    serde_json::to_vec(&serde_json::json!({ "events": events, "ip": "203.0.113.9" })).unwrap()
}

/// Column `index` of a serialized canonical row.
pub fn column(row: &str, index: usize) -> String {
    row.split('\t').nth(index).unwrap_or("").to_string()
}

pub fn parse_config(yaml: &str) -> config::Config {
    let config: config::Config = serde_yaml::from_str(yaml).unwrap();
    config.check("test.yaml").unwrap();
    config
}
