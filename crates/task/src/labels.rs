//! Labels attached to the pipeline process and its supervised tasks.

/// Labels identifying the pipeline process in structured logs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessLabels {
    /// The process ID.
    pub process_id: String,
}

impl Default for ProcessLabels {
    fn default() -> Self {
        Self {
            process_id: "undefined".to_string(),
        }
    }
}

impl ProcessLabels {
    /// Create a new `ProcessLabels` instance.
    pub fn new(process_id: &str) -> Self {
        Self {
            process_id: process_id.into(),
        }
    }
}

/// Labels identifying one supervised task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskLabels {
    /// The task category (source, worker, fanout, assets, reporter, ...).
    pub task_cat: String,
    /// The task id.
    pub task_id: String,
    /// The id of the upstream stage feeding this task.
    pub task_source: String,
}

impl TaskLabels {
    /// Create a new `TaskLabels` instance.
    pub fn new(task_cat: &str, task_id: &str, task_source: &str) -> Self {
        Self {
            task_cat: task_cat.into(),
            task_id: task_id.into(),
            task_source: task_source.into(),
        }
    }
}
