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

//! Supervision of the tasks spawned by the pipeline runtime.

use std::sync::{Arc, Mutex};

use futures::stream::FuturesUnordered;
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;
use tracing::error;

use crate::labels::{ProcessLabels, TaskLabels};

pub mod labels;

/// All the errors of this crate.
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {}

/// A registry of the tasks spawned by the runtime, joined as a group during
/// shutdown.
#[derive(Clone, Default)]
#[must_use]
pub struct TaskManager {
    /// The process labels.
    process_labels: ProcessLabels,
    /// All the tasks registered with this manager.
    registered_tasks: Arc<Mutex<FuturesUnordered<JoinHandle<()>>>>,
    /// Tasks registered while a join was in progress.
    pending_registrations: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl TaskManager {
    /// Creates a new task manager.
    pub fn new() -> Self {
        Default::default()
    }

    /// Creates a new task manager with the given process labels.
    pub fn with_process_labels(process_labels: ProcessLabels) -> Self {
        Self {
            process_labels,
            registered_tasks: Arc::new(Mutex::new(FuturesUnordered::new())),
            pending_registrations: Arc::new(Mutex::new(vec![])),
        }
    }

    /// Returns the process labels.
    pub fn process_labels(&self) -> ProcessLabels {
        self.process_labels.clone()
    }

    /// Registers a task.
    pub fn register(&self, join_handle: JoinHandle<()>, task_labels: &TaskLabels) {
        // Registration stays possible after the call to the join method.
        if let Ok(tasks) = self.registered_tasks.try_lock() {
            tasks.push(join_handle);
        } else {
            self.pending_registrations
                .lock()
                .expect("unexpected pending_registrations lock issue")
                .push(join_handle);
        }

        tracing::info!(
            task_id=%task_labels.task_id,
            task_cat=%task_labels.task_cat,
            task_source=%task_labels.task_source,
            process_id=%self.process_labels.process_id,
            "task registered and started");
    }

    /// Joins all the tasks registered with this manager.
    pub async fn join(&self) {
        tracing::debug!(
            process_id=%self.process_labels.process_id,
            task_count=%self.registered_tasks.lock().expect("registered_tasks lock failed").len(),
            "joining registered tasks");

        #[allow(clippy::await_holding_lock)]
        while let Some(item) = self
            .registered_tasks
            .lock()
            .expect("unexpected tasks lock issue")
            .next()
            .await
        {
            if let Err(err) = item {
                error!(process_id=%self.process_labels.process_id, error=?err, "join error");
            }

            for join_handle in self
                .pending_registrations
                .lock()
                .expect("unexpected pending_registrations lock issue")
                .drain(..)
            {
                self.registered_tasks
                    .lock()
                    .expect("unexpected tasks lock issue")
                    .push(join_handle);
            }
        }
    }

    /// Joins all registered tasks, giving up after `timeout`. A timeout is
    /// logged and the remaining tasks are left to the runtime to drop.
    pub async fn join_within(&self, timeout: std::time::Duration) {
        if tokio::time::timeout(timeout, self.join()).await.is_err() {
            tracing::warn!(
                process_id=%self.process_labels.process_id,
                timeout_ms=%timeout.as_millis(),
                "tasks still running at the end of the shutdown window");
        }
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use crate::{
        labels::{ProcessLabels, TaskLabels},
        TaskManager,
    };

    #[tokio::test]
    async fn join_waits_for_registered_tasks() {
        let manager = TaskManager::with_process_labels(ProcessLabels::new("test"));
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();

        manager.register(
            tokio::spawn(async move {
                let _ = rx.await;
            }),
            &TaskLabels::new("worker", "worker/test/0", "test"),
        );

        let _ = tx.send(());
        manager.join().await;
    }

    #[tokio::test]
    async fn join_within_gives_up_on_stuck_tasks() {
        let manager = TaskManager::with_process_labels(ProcessLabels::new("test"));

        manager.register(
            tokio::spawn(async {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            }),
            &TaskLabels::new("worker", "worker/test/stuck", "test"),
        );

        manager.join_within(Duration::from_millis(50)).await;
    }
}
