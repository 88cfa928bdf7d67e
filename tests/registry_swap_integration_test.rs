//! Registry swap under load: a steady record flow across an asset refresh,
//! with no record dropped and no record observing a torn registry.

use std::sync::{atomic::Ordering, Arc, Mutex};

use async_trait::async_trait;
use enrich::{ProcessorId, Registry};
use event::EnrichedEvent;
use runtime::{Collaborators, Environment, Pipeline};
use serde_json::json;

use crate::common::{init_tracing, payload, AcceptAllSchema, JsonDecoder, MemoryProducerFactory, MemorySource,
    MemorySourceFactory};

mod common;

const ASSET_URI: &str = "https://assets.example.com/stamp/db.txt";

/// Serves whatever content the test currently scripts.
struct SwitchingFetcher {
    content: Arc<Mutex<Vec<u8>>>,
}

#[async_trait]
impl assets::AssetFetcher for SwitchingFetcher {
    async fn fetch(&self, _uri: &str) -> Result<Vec<u8>, assets::Error> {
        Ok(self.content.lock().unwrap().clone())
    }
}

/// Stamps the installed asset content into `mkt_source`. Reads the file
/// twice with a pause in between: a deleted or half-swapped asset would
/// surface as an enrichment failure.
struct StampEnrichment;

impl enrich::Enrichment for StampEnrichment {
    fn name(&self) -> &str {
        "stamp"
    }

    fn asset_uris(&self) -> Vec<String> {
        vec![ASSET_URI.to_string()]
    }

    fn apply(&self, registry: &Registry, event: &mut EnrichedEvent) -> Result<Vec<serde_json::Value>, Vec<String>> {
        let path = registry
            .asset_path("stamp", ASSET_URI)
            .ok_or_else(|| vec!["stamp asset not installed".to_string()])?
            .to_path_buf();

        let first = std::fs::read_to_string(&path).map_err(|err| vec![format!("asset read failed: {err}")])?;
        std::thread::sleep(std::time::Duration::from_millis(2));
        let second = std::fs::read_to_string(&path).map_err(|err| vec![format!("asset re-read failed: {err}")])?;
        if first != second {
            return Err(vec!["asset changed under an in-flight enrichment".to_string()]);
        }

        event.mkt_source = Some(first);
        Ok(vec![])
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn swap_under_load_drops_nothing_and_stays_coherent() {
    init_tracing();

    const CONFIG_TEMPLATE: &str = r#"
input:
  app_name: enrich-test
  stream_name: raw
output:
  good:
    stream_name: enriched
  bad:
    stream_name: failed
enrich:
  concurrency: 4
assets:
  update_period: 100ms
  directory: DIRECTORY
shutdown_timeout: 5s
"#;

    let directory = std::env::temp_dir().join(format!("sluice-swap-test-{}", std::process::id()));
    let config = common::parse_config(&CONFIG_TEMPLATE.replace("DIRECTORY", &directory.display().to_string()));

    let record_count = 60;
    let records: Vec<Vec<u8>> = (0..record_count)
        .map(|index| payload(&[json!({ "app_id": index.to_string() })]))
        .collect();
    let (source, acks) = MemorySource::new(records, Some(std::time::Duration::from_millis(5)));

    let content = Arc::new(Mutex::new(b"v1".to_vec()));
    let producers = MemoryProducerFactory::default();
    let collaborators = Collaborators {
        source_factory: Box::new(MemorySourceFactory::new(source)),
        producer_factory: Box::new(MemoryProducerFactory {
            good: producers.good.clone(),
            pii: producers.pii.clone(),
            bad: producers.bad.clone(),
        }),
        decoder: Arc::new(JsonDecoder),
        enrichments: vec![Arc::new(StampEnrichment)],
        schema_client: Arc::new(AcceptAllSchema),
        pii_extractor: None,
        exception_sink: None,
        asset_fetcher: Some(Arc::new(SwitchingFetcher {
            content: content.clone(),
        })),
        cloudwatch_reporter: None,
        processor: ProcessorId::new("sluice-test", "0.1.0"),
    };

    let environment = Environment::build(config, collaborators).await.unwrap();

    // Flip the asset content while records are flowing, so at least one
    // refresh cycle observes a changed hash and swaps the registry.
    let flip = tokio::spawn(async move {
        tokio::time::sleep(std::time::Duration::from_millis(120)).await;
        *content.lock().unwrap() = b"v2".to_vec();
    });

    Pipeline::new(environment).run().await.unwrap();
    flip.await.unwrap();

    // No record dropped, none failed.
    assert_eq!(producers.bad.rows().len(), 0, "bad rows: {:?}", producers.bad.rows());
    let good_rows = producers.good.rows();
    assert_eq!(good_rows.len(), record_count);
    for count in acks.iter() {
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    // Every record saw a whole registry snapshot: v1 or v2, nothing else.
    for row in &good_rows {
        let stamped = common::column(row, 48);
        assert!(stamped == "v1" || stamped == "v2", "torn stamp: {stamped:?}");
    }
}
