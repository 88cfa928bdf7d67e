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

//! Pipeline counters, the enrich-latency gauge, metric reporters, and
//! exception forwarding.

use std::{
    fmt::Display,
    sync::{
        atomic::{AtomicI64, AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use config::StatsdConfig;
use tokio::{net::UdpSocket, sync::watch};
use tracing::warn;

/// All the errors of this crate.
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// The StatsD socket could not be created.
    #[error("statsd socket error (reason: {error})")]
    Socket {
        /// The error message.
        error: String,
    },

    /// A datagram could not be sent to the StatsD agent.
    #[error("statsd send error (target: {target}, reason: {error})")]
    Send {
        /// The StatsD agent address.
        target: String,
        /// The error message.
        error: String,
    },
}

/// Sentinel stored in the latency gauge when no observation is pending.
const LATENCY_UNSET: i64 = i64::MIN;

/// Shared pipeline counters and the enrich-latency gauge.
///
/// Counters are monotonic and incremented atomically by the pipeline
/// stages; the flusher turns them into per-period deltas. The latency gauge
/// holds the most recent observation and is nullable: it is cleared by each
/// drain.
#[derive(Debug, Default)]
pub struct Metrics {
    raw: AtomicU64,
    good: AtomicU64,
    bad: AtomicU64,
    latency_ms: AtomicI64,
}

/// Monotonic counter totals.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Totals {
    /// Raw records ingested.
    pub raw: u64,
    /// Enriched events emitted to the good sink.
    pub good: u64,
    /// Failure records emitted to the bad sink.
    pub bad: u64,
}

/// The per-period deltas handed to each reporter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetricsSnapshot {
    /// Raw records ingested during the period.
    pub raw: u64,
    /// Good events emitted during the period.
    pub good: u64,
    /// Failure records emitted during the period.
    pub bad: u64,
    /// Latest enrich latency, milliseconds, when one was observed.
    pub latency_ms: Option<i64>,
}

impl Metrics {
    /// Creates a zeroed metrics bundle.
    pub fn new() -> Arc<Self> {
        Arc::new(Default::default())
    }

    /// Counts one ingested raw record.
    pub fn increment_raw(&self) {
        let _ = self.raw.fetch_add(1, Ordering::Relaxed);
    }

    /// Counts one event emitted to the good sink.
    pub fn increment_good(&self) {
        let _ = self.good.fetch_add(1, Ordering::Relaxed);
    }

    /// Counts one failure record emitted to the bad sink.
    pub fn increment_bad(&self) {
        let _ = self.bad.fetch_add(1, Ordering::Relaxed);
    }

    /// Records the latency between collection and enrichment completion.
    pub fn observe_latency(&self, millis: i64) {
        // The sentinel is unreachable as a real observation.
        let millis = millis.max(LATENCY_UNSET + 1);
        self.latency_ms.store(millis, Ordering::Relaxed);
    }

    /// Returns the current counter totals.
    pub fn totals(&self) -> Totals {
        Totals {
            raw: self.raw.load(Ordering::Relaxed),
            good: self.good.load(Ordering::Relaxed),
            bad: self.bad.load(Ordering::Relaxed),
        }
    }

    /// Takes the pending latency observation, clearing the gauge.
    pub fn take_latency(&self) -> Option<i64> {
        match self.latency_ms.swap(LATENCY_UNSET, Ordering::Relaxed) {
            LATENCY_UNSET => None,
            millis => Some(millis),
        }
    }
}

/// A metric reporter back-end. Any subset of back-ends may be enabled; each
/// receives the same per-period snapshot.
#[async_trait]
pub trait Reporter: Send + Sync {
    /// The name of the reporter, for diagnostics.
    fn name(&self) -> &str;

    /// Reports one per-period snapshot.
    async fn report(&self, snapshot: &MetricsSnapshot) -> Result<(), Error>;
}

/// Human-readable reporter writing one line per period through the
/// subscriber attached to stdout.
#[derive(Debug, Default)]
pub struct StdoutReporter;

#[async_trait]
impl Reporter for StdoutReporter {
    fn name(&self) -> &str {
        "stdout"
    }

    async fn report(&self, snapshot: &MetricsSnapshot) -> Result<(), Error> {
        match snapshot.latency_ms {
            Some(latency_ms) => tracing::info!(
                raw_count = snapshot.raw,
                good_count = snapshot.good,
                bad_count = snapshot.bad,
                enrich_latency_ms = latency_ms,
                "metrics"
            ),
            None => tracing::info!(
                raw_count = snapshot.raw,
                good_count = snapshot.good,
                bad_count = snapshot.bad,
                "metrics"
            ),
        }
        Ok(())
    }
}

/// StatsD reporter emitting tagged UDP datagrams.
pub struct StatsdReporter {
    socket: UdpSocket,
    target: String,
    prefix: String,
    tag_suffix: String,
}

impl StatsdReporter {
    /// Creates a reporter bound to an ephemeral local port.
    pub async fn new(config: &StatsdConfig) -> Result<Self, Error> {
        let socket = UdpSocket::bind("0.0.0.0:0")
            .await
            .map_err(|err| Error::Socket { error: err.to_string() })?;

        let mut tags: Vec<(&String, &String)> = config.tags.iter().collect();
        tags.sort();
        let tag_suffix = if tags.is_empty() {
            String::new()
        } else {
            let rendered: Vec<String> = tags.iter().map(|(k, v)| format!("{k}:{v}")).collect();
            format!("|#{}", rendered.join(","))
        };

        Ok(Self {
            socket,
            target: format!("{}:{}", config.host, config.port),
            prefix: config.prefix.clone(),
            tag_suffix,
        })
    }
}

/// Renders the datagrams for one snapshot: counters as `|c`, the latency
/// gauge as `|g`, tags appended to every line.
fn format_datagrams(prefix: &str, tag_suffix: &str, snapshot: &MetricsSnapshot) -> Vec<String> {
    let mut datagrams = vec![
        format!("{prefix}.raw_count:{}|c{tag_suffix}", snapshot.raw),
        format!("{prefix}.good_count:{}|c{tag_suffix}", snapshot.good),
        format!("{prefix}.bad_count:{}|c{tag_suffix}", snapshot.bad),
    ];
    if let Some(latency_ms) = snapshot.latency_ms {
        datagrams.push(format!("{prefix}.enrich_latency_ms:{latency_ms}|g{tag_suffix}"));
    }
    datagrams
}

#[async_trait]
impl Reporter for StatsdReporter {
    fn name(&self) -> &str {
        "statsd"
    }

    async fn report(&self, snapshot: &MetricsSnapshot) -> Result<(), Error> {
        for datagram in format_datagrams(&self.prefix, &self.tag_suffix, snapshot) {
            let _ = self
                .socket
                .send_to(datagram.as_bytes(), self.target.as_str())
                .await
                .map_err(|err| Error::Send {
                    target: self.target.clone(),
                    error: err.to_string(),
                })?;
        }
        Ok(())
    }
}

/// The reporting stream: drains the counters every period and hands the
/// deltas to every enabled reporter. A final drain happens on stop.
pub struct MetricsFlusher {
    metrics: Arc<Metrics>,
    reporters: Vec<Box<dyn Reporter>>,
    period: Duration,
    reported: Totals,
}

impl MetricsFlusher {
    /// Creates a flusher over the given reporters.
    pub fn new(metrics: Arc<Metrics>, reporters: Vec<Box<dyn Reporter>>, period: Duration) -> Self {
        Self {
            metrics,
            reporters,
            period,
            reported: Totals::default(),
        }
    }

    /// Runs until `stop` flips or its sender is dropped.
    pub async fn run(mut self, mut stop: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick of a tokio interval completes immediately.
        let _ = interval.tick().await;

        loop {
            tokio::select! {
                _ = stop.changed() => {
                    self.flush_once().await;
                    break;
                }
                _ = interval.tick() => {
                    self.flush_once().await;
                }
            }
        }
    }

    /// Drains the accumulated deltas to every reporter.
    pub async fn flush_once(&mut self) {
        let totals = self.metrics.totals();
        let snapshot = MetricsSnapshot {
            raw: totals.raw - self.reported.raw,
            good: totals.good - self.reported.good,
            bad: totals.bad - self.reported.bad,
            latency_ms: self.metrics.take_latency(),
        };
        self.reported = totals;

        for reporter in &self.reporters {
            if let Err(error) = reporter.report(&snapshot).await {
                warn!(%error, reporter = %reporter.name(), "metric report failed");
            }
        }
    }
}

/// Forwarding of non-fatal runtime exceptions and fatal errors, best-effort.
pub trait ExceptionSink: Send + Sync {
    /// Reports one exception.
    fn report(&self, error: &dyn Display);
}

/// The default exception sink: structured error logging.
#[derive(Debug, Default)]
pub struct LogExceptionSink;

impl ExceptionSink for LogExceptionSink {
    fn report(&self, error: &dyn Display) {
        tracing::error!(%error, "runtime exception");
    }
}
