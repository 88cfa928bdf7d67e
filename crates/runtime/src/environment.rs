//! The environment bundle: every resource the pipeline needs, constructed
//! once from configuration in dependency order.

use std::sync::Arc;

use assets::{AssetFetcher, AssetManager, HttpFetcher};
use config::{Config, OutputConfig};
use enrich::{
    dispatcher::{Dispatcher, DispatcherSetup},
    shared_registry, AssetMap, Decoder, Enrichment, PiiExtractor, ProcessorId, Registry, SchemaClient,
    SharedRegistry,
};
use signal::PauseGate;
use sink::{AsyncSink, StreamProducer, StreamSink};
use source::{AsyncSource, SourceFactory};
use telemetry::{ExceptionSink, LogExceptionSink, Metrics, Reporter, StatsdReporter, StdoutReporter};
use tokio::sync::Mutex;

use crate::Error;

/// Builds the deployment's broker producers, one per output.
pub trait ProducerFactory: Send + Sync {
    /// Creates the producer publishing to one output stream.
    fn create(&self, name: &str, output: &OutputConfig) -> Result<Arc<dyn StreamProducer>, Error>;
}

/// The external collaborators a deployment flavour supplies.
pub struct Collaborators {
    /// Builds the upstream consumer.
    pub source_factory: Box<dyn SourceFactory>,
    /// Builds the downstream producers.
    pub producer_factory: Box<dyn ProducerFactory>,
    /// The collector payload decoder.
    pub decoder: Arc<dyn Decoder>,
    /// The configured enrichments, in chain order.
    pub enrichments: Vec<Arc<dyn Enrichment>>,
    /// The schema registry client.
    pub schema_client: Arc<dyn SchemaClient>,
    /// The canonical PII-split rule, when the deployment separates PII.
    pub pii_extractor: Option<Arc<dyn PiiExtractor>>,
    /// The exception sink (e.g. Sentry). Defaults to structured logging.
    pub exception_sink: Option<Arc<dyn ExceptionSink>>,
    /// Overrides the HTTP asset fetcher (object storage, tests).
    pub asset_fetcher: Option<Arc<dyn AssetFetcher>>,
    /// The CloudWatch metric reporter, wired in when
    /// `monitoring.metrics.cloudwatch` is left enabled.
    pub cloudwatch_reporter: Option<Box<dyn Reporter>>,
    /// The enrich-time processor identifier.
    pub processor: ProcessorId,
}

/// The resource bundle the pipeline runs over.
pub struct Environment {
    pub(crate) config: Config,
    pub(crate) metrics: Arc<Metrics>,
    pub(crate) exceptions: Arc<dyn ExceptionSink>,
    pub(crate) reporters: Vec<Box<dyn Reporter>>,
    pub(crate) good: Arc<dyn AsyncSink>,
    pub(crate) pii: Option<Arc<dyn AsyncSink>>,
    pub(crate) bad: Arc<dyn AsyncSink>,
    pub(crate) gate: Arc<PauseGate>,
    pub(crate) registry: SharedRegistry,
    pub(crate) assets: Arc<Mutex<AssetManager>>,
    pub(crate) dispatcher: Arc<Dispatcher>,
    pub(crate) source: Option<Box<dyn AsyncSource + Sync>>,
}

impl Environment {
    /// Constructs the bundle in dependency order. Any failure aborts
    /// startup with a descriptive message.
    pub async fn build(config: Config, collaborators: Collaborators) -> Result<Self, Error> {
        let metrics = Metrics::new();
        let exceptions: Arc<dyn ExceptionSink> = collaborators
            .exception_sink
            .unwrap_or_else(|| Arc::new(LogExceptionSink));

        let mut reporters: Vec<Box<dyn Reporter>> = Vec::new();
        if config.monitoring.metrics.stdout {
            reporters.push(Box::new(StdoutReporter));
        }
        if let Some(statsd) = &config.monitoring.metrics.statsd {
            let reporter = StatsdReporter::new(statsd).await.map_err(|err| Error::Startup {
                stage: "statsd reporter".to_string(),
                reason: err.to_string(),
            })?;
            reporters.push(Box::new(reporter));
        }
        if config.monitoring.metrics.cloudwatch {
            if let Some(cloudwatch) = collaborators.cloudwatch_reporter {
                reporters.push(cloudwatch);
            }
        }

        let good = build_sink("good", &config.output.good, collaborators.producer_factory.as_ref())?;
        let pii = match &config.output.pii {
            Some(output) => Some(build_sink("pii", output, collaborators.producer_factory.as_ref())?),
            None => None,
        };
        let bad = build_sink("bad", &config.output.bad, collaborators.producer_factory.as_ref())?;

        let gate = Arc::new(PauseGate::new());
        let registry = shared_registry(
            Registry::new(
                collaborators.enrichments.clone(),
                AssetMap::new(),
                collaborators.schema_client.clone(),
            )
            .map_err(|err| Error::Startup {
                stage: "registry".to_string(),
                reason: err.to_string(),
            })?,
        );

        let fetcher: Arc<dyn AssetFetcher> = match collaborators.asset_fetcher {
            Some(fetcher) => fetcher,
            None => Arc::new(HttpFetcher::new(config.assets.fetch_timeout).map_err(|err| Error::Startup {
                stage: "asset fetcher".to_string(),
                reason: err.to_string(),
            })?),
        };
        let assets = Arc::new(Mutex::new(AssetManager::new(
            config.assets.directory.clone(),
            fetcher,
            collaborators.enrichments,
            collaborators.schema_client,
            registry.clone(),
            gate.clone(),
        )));

        let pii_extractor = if pii.is_some() { collaborators.pii_extractor } else { None };
        let dispatcher = Arc::new(Dispatcher::new(DispatcherSetup {
            registry: registry.clone(),
            decoder: collaborators.decoder,
            pii_extractor,
            processor: collaborators.processor,
            max_record_bytes: config.output.good.max_record_bytes,
            good_partition_field: config
                .output
                .good
                .partition_key
                .map(|field| field.as_str().to_string()),
            pii_partition_field: config
                .output
                .pii
                .as_ref()
                .and_then(|output| output.partition_key)
                .map(|field| field.as_str().to_string()),
            metrics: metrics.clone(),
            exceptions: exceptions.clone(),
        }));

        let source = collaborators
            .source_factory
            .create(&config.input)
            .map_err(|err| Error::Startup {
                stage: "source".to_string(),
                reason: err.to_string(),
            })?;

        Ok(Self {
            config,
            metrics,
            exceptions,
            reporters,
            good,
            pii,
            bad,
            gate,
            registry,
            assets,
            dispatcher,
            source: Some(source),
        })
    }

    /// The shared pipeline counters.
    pub fn metrics(&self) -> Arc<Metrics> {
        self.metrics.clone()
    }

    /// The shared registry reference.
    pub fn registry(&self) -> SharedRegistry {
        self.registry.clone()
    }
}

fn build_sink(name: &str, output: &OutputConfig, factory: &dyn ProducerFactory) -> Result<Arc<dyn AsyncSink>, Error> {
    let producer = factory.create(name, output).map_err(|err| Error::Startup {
        stage: format!("{name} sink"),
        reason: err.to_string(),
    })?;
    Ok(Arc::new(StreamSink::new(name, output, producer)))
}
