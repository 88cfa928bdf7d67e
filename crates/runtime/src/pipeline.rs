//! The merged pipeline: the enrich stream, the asset-update stream, and the
//! reporting stream, plus the shutdown choreography.

use std::collections::BTreeMap;
use std::sync::Arc;

use enrich::dispatcher::Outcome;
use sink::{AsyncSink, AttributedData};
use source::{signal::SignalReceiver, AckHandle, EffectHandler, RawRecord, SourceController};
use task::{
    labels::{ProcessLabels, TaskLabels},
    TaskManager,
};
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::{controller::PipelineController, Environment, Error};

/// The result list of one raw record, tagged with its ingest sequence.
type RecordResult = (u64, Vec<Outcome>, AckHandle);

/// A runnable pipeline over one environment bundle.
pub struct Pipeline {
    environment: Environment,
    source_control: tokio::sync::mpsc::Sender<source::signal::Signal>,
    source_signals: Option<SignalReceiver>,
    stop_flag: watch::Sender<bool>,
    stop_watch: watch::Receiver<bool>,
}

impl Pipeline {
    /// Creates a pipeline over an environment bundle.
    pub fn new(environment: Environment) -> Self {
        let (source_control, control_receiver) = tokio::sync::mpsc::channel(1);
        let (stop_flag, stop_watch) = watch::channel(false);
        Self {
            environment,
            source_control,
            source_signals: Some(SignalReceiver::with_receiver(control_receiver)),
            stop_flag,
            stop_watch,
        }
    }

    /// Returns a controller to stop the pipeline from another task.
    pub fn controller(&self) -> PipelineController {
        PipelineController::new(
            SourceController::new(
                self.environment.config.input.stream_name.clone(),
                self.source_control.clone(),
            ),
            self.stop_flag.clone(),
        )
    }

    /// Drives the pipeline until the source is exhausted, a stop is
    /// requested, or a fatal error occurs.
    pub async fn run(mut self) -> Result<(), Error> {
        let process_labels = ProcessLabels::new(&self.environment.config.input.app_name);
        let tasks = TaskManager::with_process_labels(process_labels);

        // Initial asset load. A failure here aborts startup.
        if let Err(err) = self.environment.assets.lock().await.initial_load().await {
            let err = Error::from(err);
            self.environment.exceptions.report(&err);
            return Err(err);
        }

        let concurrency = self.environment.config.enrich.concurrency;
        let ordered = self.environment.config.enrich.ordered;

        let (raw_sender, raw_receiver) =
            flume::bounded::<(u64, RawRecord)>(self.environment.config.input.buffer_size);
        let (out_sender, out_receiver) = flume::bounded::<RecordResult>(concurrency.saturating_mul(2).max(4));
        let (fatal_sender, fatal_receiver) = flume::bounded::<Error>(concurrency + 4);

        // Asset update stream.
        if let Some(period) = self.environment.config.assets.update_period {
            tasks.register(
                tokio::spawn(assets::run_refresh_loop(
                    self.environment.assets.clone(),
                    period,
                    self.stop_watch.clone(),
                )),
                &TaskLabels::new("assets", "assets/refresh", "timer"),
            );
        }

        // Reporting stream.
        let flusher = telemetry::MetricsFlusher::new(
            self.environment.metrics.clone(),
            std::mem::take(&mut self.environment.reporters),
            self.environment.config.monitoring.metrics.period,
        );
        tasks.register(
            tokio::spawn(flusher.run(self.stop_watch.clone())),
            &TaskLabels::new("reporter", "reporter/metrics", "timer"),
        );

        // Enrich stream: the source task feeds the raw channel. The effect
        // handler owns the only sender, so the workers drain and stop once
        // the source returns.
        let mut source = self.environment.source.take().ok_or_else(|| Error::Runtime {
            error: "pipeline already started".to_string(),
        })?;
        let signals = self.source_signals.take().ok_or_else(|| Error::Runtime {
            error: "pipeline already started".to_string(),
        })?;
        let source_name = self.environment.config.input.stream_name.clone();
        let effects = EffectHandler::new(source_name.clone(), raw_sender, self.environment.gate.clone());
        let source_fatal = fatal_sender.clone();
        tasks.register(
            tokio::spawn(async move {
                if let Err(error) = source.init().await {
                    error!(%error, source = %source_name, "source initialization failed");
                    let _ = source_fatal.try_send(Error::Source {
                        name: source_name.clone(),
                        error: error.to_string(),
                    });
                    return;
                }
                match source.run(signals, effects).await {
                    Ok(()) => {
                        if let Err(error) = source.stop().await {
                            warn!(%error, source = %source_name, "source stop failed");
                        }
                        info!(source = %source_name, "source has stopped normally");
                    }
                    Err(error) => {
                        error!(%error, source = %source_name, "source failed");
                        let _ = source_fatal.try_send(Error::Source {
                            name: source_name.clone(),
                            error: error.to_string(),
                        });
                    }
                }
            }),
            &TaskLabels::new(
                "source",
                &format!("source/{}", self.environment.config.input.stream_name),
                "upstream",
            ),
        );

        // Enrich stream: the worker pool.
        for index in 0..concurrency {
            let raw_receiver = raw_receiver.clone();
            let out_sender = out_sender.clone();
            let gate = self.environment.gate.clone();
            let dispatcher = self.environment.dispatcher.clone();
            let metrics = self.environment.metrics.clone();
            tasks.register(
                tokio::spawn(async move {
                    while let Ok((sequence, record)) = raw_receiver.recv_async().await {
                        metrics.increment_raw();
                        // The permit pins one registry snapshot for the
                        // whole dispatch call.
                        let permit = gate.enter().await;
                        let outcomes = dispatcher.dispatch(&record.payload);
                        drop(permit);
                        if out_sender.send_async((sequence, outcomes, record.ack)).await.is_err() {
                            break;
                        }
                    }
                }),
                &TaskLabels::new("worker", &format!("worker/enrich/{index}"), "source"),
            );
        }
        drop(raw_receiver);
        drop(out_sender);

        // Enrich stream: output gate, sink fan-out, ack barrier.
        let fan_out = FanOut {
            good: self.environment.good.clone(),
            pii: self.environment.pii.clone(),
            bad: self.environment.bad.clone(),
            ordered,
            fatal: fatal_sender.clone(),
        };
        let mut fan_out_handle = Some(tokio::spawn(fan_out.run(out_receiver)));

        info!(concurrency, ordered, "pipeline started");

        // Supervision: natural completion or the first fatal error. The
        // local fatal_sender keeps the channel open either way.
        let outcome = tokio::select! {
            fatal = fatal_receiver.recv_async() => {
                Err(fatal.unwrap_or_else(|_| Error::Runtime {
                    error: "fatal channel closed".to_string(),
                }))
            }
            join = fan_out_handle.as_mut().expect("fan-out handle set above") => {
                fan_out_handle = None;
                match join {
                    Ok(()) => Ok(()),
                    Err(error) => Err(Error::Runtime {
                        error: format!("fan-out task failed: {error}"),
                    }),
                }
            }
        };
        // A fatal raced with natural completion loses the select; check.
        let outcome = match outcome {
            Ok(()) => match fatal_receiver.try_recv() {
                Ok(error) => Err(error),
                Err(_) => Ok(()),
            },
            outcome => outcome,
        };

        self.shutdown(tasks, fan_out_handle, outcome).await
    }

    /// The shutdown choreography. Every step is bounded by the configured
    /// timeout; a timeout is logged and does not prevent progression.
    async fn shutdown(
        &mut self,
        tasks: TaskManager,
        fan_out_handle: Option<tokio::task::JoinHandle<()>>,
        outcome: Result<(), Error>,
    ) -> Result<(), Error> {
        let step_timeout = self.environment.config.shutdown_timeout;
        info!("shutdown started");

        // 1. Stop accepting new records; wind the side streams down.
        self.controller().stop();

        // 2. Let in-flight enrich calls complete and pending acks drain.
        if let Some(handle) = fan_out_handle {
            match tokio::time::timeout(step_timeout, handle).await {
                Ok(Ok(())) => {}
                Ok(Err(error)) => warn!(%error, "fan-out join failed"),
                Err(_) => warn!(
                    timeout_ms = %step_timeout.as_millis(),
                    "fan-out still draining at the end of the shutdown window"
                ),
            }
        }

        // 3. Flush the sinks.
        let mut close_failure: Option<Error> = None;
        let mut sinks: Vec<Arc<dyn AsyncSink>> = vec![self.environment.good.clone()];
        if let Some(pii) = &self.environment.pii {
            sinks.push(pii.clone());
        }
        sinks.push(self.environment.bad.clone());
        for sink in sinks {
            match tokio::time::timeout(step_timeout, sink.close()).await {
                Ok(Ok(())) => {}
                Ok(Err(error)) => {
                    error!(sink = %sink.name(), %error, "sink close failed");
                    if close_failure.is_none() {
                        close_failure = Some(Error::from_sink(error));
                    }
                }
                Err(_) => warn!(
                    sink = %sink.name(),
                    timeout_ms = %step_timeout.as_millis(),
                    "sink close timed out"
                ),
            }
        }

        // 4./5. Join the remaining tasks, then release the assets.
        tasks.join_within(step_timeout).await;
        self.environment.assets.lock().await.unload().await;

        match outcome {
            Ok(()) => match close_failure {
                None => {
                    info!("shutdown complete");
                    Ok(())
                }
                Some(error) => {
                    self.environment.exceptions.report(&error);
                    Err(error)
                }
            },
            Err(error) => {
                self.environment.exceptions.report(&error);
                Err(error)
            }
        }
    }
}

/// The output gate and sink fan-out. In ordered mode, results are
/// re-ordered to ingest order with a reorder buffer keyed by the sequence
/// stamp; in unordered mode they flow in completion order.
struct FanOut {
    good: Arc<dyn AsyncSink>,
    pii: Option<Arc<dyn AsyncSink>>,
    bad: Arc<dyn AsyncSink>,
    ordered: bool,
    fatal: flume::Sender<Error>,
}

impl FanOut {
    async fn run(self, results: flume::Receiver<RecordResult>) {
        let mut next_sequence: u64 = 0;
        let mut reorder: BTreeMap<u64, (Vec<Outcome>, AckHandle)> = BTreeMap::new();

        while let Ok((sequence, outcomes, ack)) = results.recv_async().await {
            if self.ordered {
                let _ = reorder.insert(sequence, (outcomes, ack));
                while let Some((outcomes, ack)) = reorder.remove(&next_sequence) {
                    if !self.deliver(outcomes, ack).await {
                        return;
                    }
                    next_sequence += 1;
                }
            } else if !self.deliver(outcomes, ack).await {
                return;
            }
        }

        // The workers are done: no gaps remain in the reorder buffer.
        for (_, (outcomes, ack)) in std::mem::take(&mut reorder) {
            if !self.deliver(outcomes, ack).await {
                return;
            }
        }
        tracing::debug!("fan-out stopped");
    }

    /// Publishes every inner result across the sinks, waits for all of
    /// them, then acks the originating raw record. This is the only point
    /// where the ack happens. Returns false on a fatal sink failure.
    async fn deliver(&self, outcomes: Vec<Outcome>, ack: AckHandle) -> bool {
        let mut publishes = Vec::new();
        for outcome in outcomes {
            match outcome {
                Outcome::Good { event, pii } => {
                    publishes.push(self.good.publish(event));
                    if let (Some(pii_sink), Some(pii_data)) = (&self.pii, pii) {
                        publishes.push(pii_sink.publish(pii_data));
                    }
                }
                Outcome::Bad { row } => {
                    publishes.push(
                        self.bad
                            .publish(AttributedData::new(row.to_json_line().into_bytes())),
                    );
                }
            }
        }

        match futures::future::try_join_all(publishes).await {
            Ok(_) => {
                ack.ack();
                true
            }
            Err(error) => {
                let _ = self.fatal.try_send(Error::from_sink(error));
                false
            }
        }
    }
}
