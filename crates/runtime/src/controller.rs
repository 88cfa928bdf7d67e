//! Controller used to stop a running pipeline from the exterior (CLI
//! signal handlers, tests).

use source::SourceController;
use tokio::sync::watch;

/// Stops the pipeline: the source stops pulling, the side streams wind
/// down, and the shutdown choreography takes over.
pub struct PipelineController {
    source: SourceController,
    stop_flag: watch::Sender<bool>,
}

impl PipelineController {
    pub(crate) fn new(source: SourceController, stop_flag: watch::Sender<bool>) -> Self {
        Self { source, stop_flag }
    }

    /// Requests a graceful stop.
    pub fn stop(&self) {
        self.source.stop();
        let _ = self.stop_flag.send(true);
    }
}
