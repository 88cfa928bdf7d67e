//! End-to-end pipeline tests over in-memory collaborators.

use std::sync::{atomic::Ordering, Arc};

use enrich::ProcessorId;
use runtime::{Collaborators, Environment, Pipeline};
use serde_json::json;
use sink::PublishError;

use crate::common::{
    column, init_tracing, payload, AcceptAllSchema, CopyIpPii, GeoEnrichment, JsonDecoder, MemoryProducerFactory,
    MemorySource, MemorySourceFactory,
};

mod common;

const CONFIG: &str = r#"
input:
  app_name: enrich-test
  stream_name: raw
output:
  good:
    stream_name: enriched
    partition_key: event_id
  pii:
    stream_name: pii
  bad:
    stream_name: failed
enrich:
  concurrency: 8
assets:
  update_period: ~
monitoring:
  metrics:
    stdout: true
shutdown_timeout: 5s
"#;

fn collaborators(
    records: Vec<Vec<u8>>,
    producers: &MemoryProducerFactory,
) -> (Collaborators, Arc<Vec<std::sync::atomic::AtomicUsize>>) {
    let (source, acks) = MemorySource::new(records, None);
    let collaborators = Collaborators {
        source_factory: Box::new(MemorySourceFactory::new(source)),
        producer_factory: Box::new(MemoryProducerFactory {
            good: producers.good.clone(),
            pii: producers.pii.clone(),
            bad: producers.bad.clone(),
        }),
        decoder: Arc::new(JsonDecoder),
        enrichments: vec![Arc::new(GeoEnrichment)],
        schema_client: Arc::new(AcceptAllSchema),
        pii_extractor: Some(Arc::new(CopyIpPii)),
        exception_sink: None,
        asset_fetcher: None,
        cloudwatch_reporter: None,
        processor: ProcessorId::new("sluice-test", "0.1.0"),
    };
    (collaborators, acks)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn routes_good_bad_and_pii_and_acks_each_record_once() {
    init_tracing();

    let records = vec![
        payload(&[json!({"app_id": "shop", "platform": "web"})]),
        b"\x00\x01\x02".to_vec(),
        payload(&[json!({"app_id": "mobile"}), json!({"app_id": "boom"})]),
    ];

    let producers = MemoryProducerFactory::default();
    let (collaborators, acks) = collaborators(records, &producers);

    let environment = Environment::build(common::parse_config(CONFIG), collaborators)
        .await
        .unwrap();
    let metrics = environment.metrics();
    Pipeline::new(environment).run().await.unwrap();

    // Good: the plain event and the surviving half of the batched payload.
    let good_rows = producers.good.rows();
    assert_eq!(good_rows.len(), 2);
    let mut app_ids: Vec<String> = good_rows.iter().map(|row| column(row, 0)).collect();
    app_ids.sort();
    assert_eq!(app_ids, vec!["mobile", "shop"]);
    for row in &good_rows {
        assert_eq!(column(row, 18), "IS", "geo_country written by the chain");
        assert!(!column(row, 6).is_empty(), "event_id generated");
    }

    // The good partition key is the event_id field.
    for record in producers.good.records() {
        let row = String::from_utf8(record.data).unwrap();
        assert_eq!(record.partition_key, column(&row, 6));
    }

    // PII: one derived event per good event, carrying the source IP.
    let pii_rows = producers.pii.rows();
    assert_eq!(pii_rows.len(), 2);
    for row in &pii_rows {
        assert_eq!(column(row, 13), "203.0.113.9");
    }

    // Bad: one decode failure and one enrichment failure, as JSON lines.
    let bad_rows = producers.bad.rows();
    assert_eq!(bad_rows.len(), 2);
    let mut kinds: Vec<String> = bad_rows
        .iter()
        .map(|line| {
            let parsed: serde_json::Value = serde_json::from_str(line).unwrap();
            parsed["kind"].as_str().unwrap().to_string()
        })
        .collect();
    kinds.sort();
    assert_eq!(kinds, vec!["cpformat-violation", "enrichment-failure"]);

    // Every raw record acked exactly once.
    for count in acks.iter() {
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    let totals = metrics.totals();
    assert_eq!((totals.raw, totals.good, totals.bad), (3, 2, 2));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn ordered_mode_emits_results_in_ingest_order() {
    init_tracing();

    const ORDERED_CONFIG: &str = r#"
input:
  app_name: enrich-test
  stream_name: raw
output:
  good:
    stream_name: enriched
  bad:
    stream_name: failed
enrich:
  concurrency: 8
  ordered: true
assets:
  update_period: ~
shutdown_timeout: 5s
"#;

    /// Sleeps longer for earlier records, so completion order inverts
    /// ingest order unless the output gate re-sorts.
    struct StaggeredDelay;

    impl enrich::Enrichment for StaggeredDelay {
        fn name(&self) -> &str {
            "staggered-delay"
        }

        fn apply(
            &self,
            _registry: &enrich::Registry,
            event: &mut event::EnrichedEvent,
        ) -> Result<Vec<serde_json::Value>, Vec<String>> {
            let index: u64 = event.app_id.as_deref().unwrap_or("0").parse().unwrap_or(0);
            std::thread::sleep(std::time::Duration::from_millis((19 - index.min(19)) * 2));
            Ok(vec![])
        }
    }

    let records: Vec<Vec<u8>> = (0..20)
        .map(|index| payload(&[json!({ "app_id": index.to_string() })]))
        .collect();

    let producers = MemoryProducerFactory::default();
    let (source, _acks) = MemorySource::new(records, None);
    let collaborators = Collaborators {
        source_factory: Box::new(MemorySourceFactory::new(source)),
        producer_factory: Box::new(MemoryProducerFactory {
            good: producers.good.clone(),
            pii: producers.pii.clone(),
            bad: producers.bad.clone(),
        }),
        decoder: Arc::new(JsonDecoder),
        enrichments: vec![Arc::new(StaggeredDelay)],
        schema_client: Arc::new(AcceptAllSchema),
        pii_extractor: None,
        exception_sink: None,
        asset_fetcher: None,
        cloudwatch_reporter: None,
        processor: ProcessorId::new("sluice-test", "0.1.0"),
    };

    let environment = Environment::build(common::parse_config(ORDERED_CONFIG), collaborators)
        .await
        .unwrap();
    Pipeline::new(environment).run().await.unwrap();

    let observed: Vec<String> = producers.good.rows().iter().map(|row| column(row, 0)).collect();
    let expected: Vec<String> = (0..20).map(|index| index.to_string()).collect();
    assert_eq!(observed, expected);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn fatal_sink_failure_fails_the_run() {
    init_tracing();

    let producers = MemoryProducerFactory {
        good: Arc::new(common::MemoryProducer::with_failures(vec![PublishError::Fatal {
            error: "invalid stream name".to_string(),
        }])),
        ..Default::default()
    };
    let (collaborators, _acks) = collaborators(vec![payload(&[json!({"app_id": "shop"})])], &producers);

    let environment = Environment::build(common::parse_config(CONFIG), collaborators)
        .await
        .unwrap();
    let error = Pipeline::new(environment).run().await.unwrap_err();
    assert!(matches!(error, runtime::Error::Sink { .. }), "got: {error}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn reruns_over_the_same_input_produce_the_same_multisets() {
    init_tracing();

    let records = vec![
        payload(&[json!({"app_id": "shop"})]),
        b"\xff\xfe".to_vec(),
        payload(&[json!({"app_id": "boom"})]),
        payload(&[json!({"app_id": "news"}), json!({"app_id": "docs"})]),
    ];

    let mut runs: Vec<(Vec<String>, Vec<String>)> = vec![];
    for _ in 0..2 {
        let producers = MemoryProducerFactory::default();
        let (collaborators, _acks) = collaborators(records.clone(), &producers);
        let environment = Environment::build(common::parse_config(CONFIG), collaborators)
            .await
            .unwrap();
        Pipeline::new(environment).run().await.unwrap();

        let mut good: Vec<String> = producers.good.rows().iter().map(|row| column(row, 0)).collect();
        good.sort();
        let mut bad: Vec<String> = producers
            .bad
            .rows()
            .iter()
            .map(|line| {
                let parsed: serde_json::Value = serde_json::from_str(line).unwrap();
                parsed["kind"].as_str().unwrap().to_string()
            })
            .collect();
        bad.sort();
        runs.push((good, bad));
    }

    assert_eq!(runs[0], runs[1]);
}
