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

//! Configuration document for the enrichment pipeline.

use std::{collections::HashMap, fs::File, io::BufReader, path::Path, path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;
use validator::Validate;

/// Errors for the config module.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// The config file could not be read or parsed.
    #[error("invalid configuration file `{file}` - {message}")]
    InvalidConfig {
        /// The path to the config file.
        file: String,
        /// The error message.
        message: String,
    },

    /// A configuration value is out of its accepted range.
    #[error("invalid configuration value (config file `{file}`, reason: {message})")]
    Validation {
        /// The path to the config file.
        file: String,
        /// The error message.
        message: String,
    },
}

/// The root configuration document.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Config {
    /// The source-side configuration.
    pub input: InputConfig,

    /// The sink-side configuration.
    pub output: OutputSet,

    /// The enrich-stage configuration.
    #[serde(default)]
    pub enrich: EnrichConfig,

    /// The asset-manager configuration.
    #[serde(default)]
    pub assets: AssetsConfig,

    /// Monitoring: metric reporters and exception forwarding.
    #[serde(default)]
    pub monitoring: MonitoringConfig,

    /// Upper bound applied to each step of the shutdown choreography.
    #[serde(default = "default_shutdown_timeout", with = "humantime_serde")]
    pub shutdown_timeout: Duration,
}

impl Config {
    /// Loads and checks the configuration document.
    ///
    /// # Argument
    /// * `config_file_path` - Path to the configuration file (YAML)
    pub fn load<P: AsRef<Path>>(config_file_path: P) -> Result<Self, Error> {
        let config_file_name = config_file_path.as_ref().display().to_string();

        debug!("loading {}", config_file_name);

        let config_file = File::open(config_file_path).map_err(|err| Error::InvalidConfig {
            file: config_file_name.clone(),
            message: err.to_string(),
        })?;
        let reader = BufReader::new(config_file);
        let config: Config = serde_yaml::from_reader(reader).map_err(|err| Error::InvalidConfig {
            file: config_file_name.clone(),
            message: err.to_string(),
        })?;

        config.check(&config_file_name)?;

        debug!("{} loaded", config_file_name);

        Ok(config)
    }

    /// Validates every section of an already-parsed document.
    pub fn check(&self, file: &str) -> Result<(), Error> {
        let validation = |err: validator::ValidationErrors| Error::Validation {
            file: file.to_string(),
            message: err.to_string(),
        };

        self.input.validate().map_err(validation)?;
        self.output.good.validate().map_err(validation)?;
        self.output.bad.validate().map_err(validation)?;
        if let Some(pii) = &self.output.pii {
            pii.validate().map_err(validation)?;
        }
        self.enrich.validate().map_err(validation)?;

        if let RetrievalMode::Polling { max_records } = self.input.retrieval_mode {
            if !(1..=10_000).contains(&max_records) {
                return Err(Error::Validation {
                    file: file.to_string(),
                    message: format!("retrieval_mode.max_records out of range 1..=10000: {max_records}"),
                });
            }
        }

        Ok(())
    }
}

/// Source-side configuration.
#[derive(Serialize, Deserialize, Debug, Clone, Validate)]
pub struct InputConfig {
    /// The consumer application name (also the checkpoint lease name).
    pub app_name: String,

    /// The upstream stream to consume.
    pub stream_name: String,

    /// The region of the upstream stream, when the deployment needs one.
    #[serde(default)]
    pub region: Option<String>,

    /// Where to start when no prior checkpoint exists.
    #[serde(default)]
    pub initial_position: InitialPosition,

    /// How records are pulled from the upstream stream.
    #[serde(default)]
    pub retrieval_mode: RetrievalMode,

    /// How the source batches its checkpoint commits.
    #[serde(default)]
    pub checkpoint_settings: CheckpointSettings,

    /// Capacity of the raw-record channel between the source and the enrich
    /// workers.
    #[serde(default = "default_buffer_size")]
    #[validate(range(min = 1, max = 100000))]
    pub buffer_size: usize,
}

impl InputConfig {
    /// Creates an input configuration with default tuning.
    pub fn new(app_name: &str, stream_name: &str) -> Self {
        Self {
            app_name: app_name.to_string(),
            stream_name: stream_name.to_string(),
            region: None,
            initial_position: Default::default(),
            retrieval_mode: Default::default(),
            checkpoint_settings: Default::default(),
            buffer_size: default_buffer_size(),
        }
    }
}

/// Where the source starts when it has no prior checkpoint.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InitialPosition {
    /// Start from the earliest retained record.
    #[default]
    #[serde(rename = "TRIM_HORIZON")]
    TrimHorizon,
    /// Start from the current tail of the stream.
    #[serde(rename = "LATEST")]
    Latest,
}

/// How records are pulled from the upstream stream.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(tag = "type")]
pub enum RetrievalMode {
    /// Enhanced fan-out (push) consumption.
    #[default]
    FanOut,
    /// Polling consumption.
    Polling {
        /// Maximum number of records per poll.
        max_records: usize,
    },
}

/// How the source batches its checkpoint commits.
#[derive(Serialize, Deserialize, Debug, Clone, Validate)]
pub struct CheckpointSettings {
    /// Commit after this many acknowledged records.
    #[serde(default = "default_checkpoint_batch_size")]
    #[validate(range(min = 1, max = 100000))]
    pub max_batch_size: usize,

    /// Commit after this much time, even when the batch is not full.
    #[serde(default = "default_checkpoint_batch_wait", with = "humantime_serde")]
    pub max_batch_wait: Duration,
}

impl Default for CheckpointSettings {
    fn default() -> Self {
        Self {
            max_batch_size: default_checkpoint_batch_size(),
            max_batch_wait: default_checkpoint_batch_wait(),
        }
    }
}

/// The three output streams.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct OutputSet {
    /// Destination of successfully enriched events.
    pub good: OutputConfig,

    /// Destination of derived PII events. When absent, no PII events are
    /// emitted.
    #[serde(default)]
    pub pii: Option<OutputConfig>,

    /// Destination of failure records.
    pub bad: OutputConfig,
}

/// One output stream.
#[derive(Serialize, Deserialize, Debug, Clone, Validate)]
pub struct OutputConfig {
    /// The sink flavour discriminator, interpreted by the deployment's
    /// producer factory.
    #[serde(rename = "type", default)]
    pub kind: Option<String>,

    /// The downstream stream or topic to publish to.
    pub stream_name: String,

    /// The region of the downstream stream, when the deployment needs one.
    #[serde(default)]
    pub region: Option<String>,

    /// The event field used as the partition key. When unset, or when the
    /// field is empty on a given event, a random UUID is used instead.
    #[serde(default)]
    pub partition_key: Option<PartitionKeyField>,

    /// Flush the batch when this much time has elapsed since its oldest
    /// buffered record.
    #[serde(default = "default_delay_threshold", with = "humantime_serde")]
    pub delay_threshold: Duration,

    /// Flush the batch when it holds this many records.
    #[serde(default = "default_max_batch_size")]
    #[validate(range(min = 1, max = 10000))]
    pub max_batch_size: usize,

    /// Flush the batch when it holds this many bytes.
    #[serde(default = "default_max_batch_bytes")]
    #[validate(range(min = 1024))]
    pub max_batch_bytes: usize,

    /// Per-record size ceiling. A serialized event larger than this is
    /// demoted to a size-violation failure record.
    #[serde(default = "default_max_record_bytes")]
    #[validate(range(min = 1024))]
    pub max_record_bytes: usize,

    /// Backoff applied to retried publishes.
    #[serde(default)]
    pub backoff_policy: BackoffPolicy,
}

impl OutputConfig {
    /// Creates an output configuration with default tuning.
    pub fn new(stream_name: &str) -> Self {
        Self {
            kind: None,
            stream_name: stream_name.to_string(),
            region: None,
            partition_key: None,
            delay_threshold: default_delay_threshold(),
            max_batch_size: default_max_batch_size(),
            max_batch_bytes: default_max_batch_bytes(),
            max_record_bytes: default_max_record_bytes(),
            backoff_policy: Default::default(),
        }
    }
}

/// Event fields accepted as partition keys.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PartitionKeyField {
    /// The `event_id` field.
    EventId,
    /// The `event_fingerprint` field.
    EventFingerprint,
    /// The `domain_userid` field.
    DomainUserid,
    /// The `network_userid` field.
    NetworkUserid,
    /// The `user_ipaddress` field.
    UserIpaddress,
    /// The `domain_sessionid` field.
    DomainSessionid,
    /// The `user_fingerprint` field.
    UserFingerprint,
}

impl PartitionKeyField {
    /// The canonical name of the selected field.
    pub fn as_str(&self) -> &'static str {
        match self {
            PartitionKeyField::EventId => "event_id",
            PartitionKeyField::EventFingerprint => "event_fingerprint",
            PartitionKeyField::DomainUserid => "domain_userid",
            PartitionKeyField::NetworkUserid => "network_userid",
            PartitionKeyField::UserIpaddress => "user_ipaddress",
            PartitionKeyField::DomainSessionid => "domain_sessionid",
            PartitionKeyField::UserFingerprint => "user_fingerprint",
        }
    }
}

/// Backoff applied to retried publishes: the delay starts at `min_backoff`,
/// doubles per attempt, and is capped at `max_backoff`.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct BackoffPolicy {
    /// First retry delay.
    #[serde(default = "default_min_backoff", with = "humantime_serde")]
    pub min_backoff: Duration,

    /// Retry delay cap.
    #[serde(default = "default_max_backoff", with = "humantime_serde")]
    pub max_backoff: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            min_backoff: default_min_backoff(),
            max_backoff: default_max_backoff(),
        }
    }
}

/// Enrich-stage configuration.
#[derive(Serialize, Deserialize, Debug, Clone, Validate)]
pub struct EnrichConfig {
    /// Number of records enriched concurrently.
    #[serde(default = "default_concurrency")]
    #[validate(range(min = 1, max = 1024))]
    pub concurrency: usize,

    /// When true, results are re-ordered to match ingestion order before
    /// the sink fan-out.
    #[serde(default)]
    pub ordered: bool,
}

impl Default for EnrichConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            ordered: false,
        }
    }
}

/// Asset-manager configuration.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct AssetsConfig {
    /// Period of the background refresh. When unset, assets are fetched once
    /// at startup and never refreshed.
    #[serde(default = "default_update_period", with = "humantime_serde")]
    pub update_period: Option<Duration>,

    /// Directory where fetched assets are installed.
    #[serde(default = "default_asset_directory")]
    pub directory: PathBuf,

    /// Per-file fetch timeout.
    #[serde(default = "default_fetch_timeout", with = "humantime_serde")]
    pub fetch_timeout: Duration,
}

impl Default for AssetsConfig {
    fn default() -> Self {
        Self {
            update_period: default_update_period(),
            directory: default_asset_directory(),
            fetch_timeout: default_fetch_timeout(),
        }
    }
}

/// Monitoring: metric reporters and exception forwarding.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct MonitoringConfig {
    /// Exception forwarding configuration.
    #[serde(default)]
    pub sentry: Option<SentryConfig>,

    /// Metric reporters.
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Exception forwarding configuration.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct SentryConfig {
    /// The DSN the deployment-provided exception sink connects to.
    pub dsn: String,
}

/// Metric reporters. Any subset may be enabled.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct MetricsConfig {
    /// Period at which reporters drain the accumulated deltas.
    #[serde(default = "default_metrics_period", with = "humantime_serde")]
    pub period: Duration,

    /// StatsD reporter (UDP, tagged).
    #[serde(default)]
    pub statsd: Option<StatsdConfig>,

    /// Human-readable stdout reporter.
    #[serde(default)]
    pub stdout: bool,

    /// CloudWatch reporter, effective when the deployment wires one in.
    /// Enabled by default.
    #[serde(default = "default_cloudwatch")]
    pub cloudwatch: bool,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            period: default_metrics_period(),
            statsd: None,
            stdout: false,
            cloudwatch: default_cloudwatch(),
        }
    }
}

/// StatsD reporter configuration.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct StatsdConfig {
    /// The StatsD agent host.
    #[serde(default = "default_statsd_host")]
    pub host: String,

    /// The StatsD agent UDP port.
    #[serde(default = "default_statsd_port")]
    pub port: u16,

    /// Prefix prepended to every metric name.
    #[serde(default = "default_statsd_prefix")]
    pub prefix: String,

    /// Tags appended to every datagram.
    #[serde(default)]
    pub tags: HashMap<String, String>,
}

impl Default for StatsdConfig {
    fn default() -> Self {
        Self {
            host: default_statsd_host(),
            port: default_statsd_port(),
            prefix: default_statsd_prefix(),
            tags: HashMap::new(),
        }
    }
}

fn default_buffer_size() -> usize {
    512
}

fn default_checkpoint_batch_size() -> usize {
    1000
}

fn default_checkpoint_batch_wait() -> Duration {
    Duration::from_secs(10)
}

fn default_delay_threshold() -> Duration {
    Duration::from_millis(200)
}

fn default_max_batch_size() -> usize {
    500
}

fn default_max_batch_bytes() -> usize {
    5_000_000
}

fn default_max_record_bytes() -> usize {
    6_900_000
}

fn default_min_backoff() -> Duration {
    Duration::from_millis(100)
}

fn default_max_backoff() -> Duration {
    Duration::from_secs(10)
}

fn default_concurrency() -> usize {
    64
}

fn default_update_period() -> Option<Duration> {
    Some(Duration::from_secs(7 * 24 * 3600))
}

fn default_asset_directory() -> PathBuf {
    PathBuf::from("enrichment-assets")
}

fn default_fetch_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_metrics_period() -> Duration {
    Duration::from_secs(10)
}

fn default_cloudwatch() -> bool {
    true
}

fn default_statsd_host() -> String {
    "127.0.0.1".to_string()
}

fn default_statsd_port() -> u16 {
    8125
}

fn default_statsd_prefix() -> String {
    "sluice".to_string()
}

fn default_shutdown_timeout() -> Duration {
    Duration::from_secs(10)
}
