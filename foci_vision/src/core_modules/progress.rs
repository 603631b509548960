//! Progress reporting for the long-running stages.
//!
//! Stages call `on_progress` as they finish units of work. Observers are pure
//! side channels: nothing in the engine reads them back.

use tracing::debug;

pub trait ProgressObserver: Send + Sync {
    fn on_progress(&self, completed: usize, total: usize);
}

/// Discards every update.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoProgress;

impl ProgressObserver for NoProgress {
    fn on_progress(&self, _completed: usize, _total: usize) {}
}

/// Forwards updates to the `tracing` subscriber at debug level.
#[derive(Debug, Clone)]
pub struct TracingProgress {
    pub stage: &'static str,
}

impl ProgressObserver for TracingProgress {
    fn on_progress(&self, completed: usize, total: usize) {
        debug!(stage = self.stage, completed, total, "progress");
    }
}
