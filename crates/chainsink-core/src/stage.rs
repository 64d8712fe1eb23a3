//! Cross-writer consistency points.
//!
//! During a replay every table writer commits on its own, so no single
//! transaction says "all tables hold block N". A [`StageTracker`] collects
//! per-writer reports of committed stages (block numbers) and fires once every
//! writer has reported the same stage. Completed stages are published through
//! a `watch` channel for async waiters and to a synchronous callback.

use std::collections::BTreeMap;
use std::sync::Mutex;

use tokio::sync::watch;
use tracing::{debug, info};

use crate::error::SinkError;

type StageCallback = Box<dyn Fn(u32) + Send + Sync>;

#[derive(Default)]
struct StageState {
    /// Highest stage every writer has reported.
    committed: u32,
    /// Reports received so far, per pending stage.
    reported: BTreeMap<u32, usize>,
}

/// Barrier over a fixed number of writers, keyed by block number.
pub struct StageTracker {
    writers: usize,
    state: Mutex<StageState>,
    completed: watch::Sender<u32>,
    on_complete: StageCallback,
}

impl StageTracker {
    /// `on_complete` runs once per completed stage, in increasing order.
    pub fn new(
        writers: usize,
        on_complete: impl Fn(u32) + Send + Sync + 'static,
    ) -> Result<Self, SinkError> {
        if writers == 0 {
            return Err(SinkError::Config(
                "stage tracker needs at least one writer".into(),
            ));
        }
        let (completed, _) = watch::channel(0);
        Ok(Self {
            writers,
            state: Mutex::new(StageState::default()),
            completed,
            on_complete: Box::new(on_complete),
        })
    }

    pub fn writers(&self) -> usize {
        self.writers
    }

    /// One writer has committed everything up to `stage`.
    ///
    /// Stages at or below the last completed one are ignored.
    pub fn report_stage_complete(&self, stage: u32) {
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        if stage <= state.committed {
            return;
        }

        let count = state.reported.entry(stage).or_insert(0);
        *count += 1;
        debug!(stage, reported = *count, writers = self.writers, "writer reached stage");
        if *count < self.writers {
            return;
        }
        self.complete(&mut state, stage);
    }

    /// Mark `stage` complete for every writer at once, e.g. after a shared
    /// transaction covering all of them was committed.
    pub fn complete_stage(&self, stage: u32) {
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        if stage > state.committed {
            self.complete(&mut state, stage);
        }
    }

    fn complete(&self, state: &mut StageState, stage: u32) {
        state.reported.retain(|pending, _| *pending > stage);
        state.committed = stage;
        info!(block = stage, "all writers committed up to block");
        (self.on_complete)(stage);
        self.completed.send_replace(stage);
    }

    /// Highest block every writer has committed; 0 before the first stage.
    pub fn committed_block(&self) -> u32 {
        *self.completed.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<u32> {
        self.completed.subscribe()
    }

    /// Wait until every writer has committed `stage`.
    pub async fn wait_for(&self, stage: u32) -> Result<(), SinkError> {
        let mut receiver = self.subscribe();
        receiver
            .wait_for(|committed| *committed >= stage)
            .await
            .map_err(|_| SinkError::Other("stage tracker dropped".into()))?;
        Ok(())
    }
}

impl std::fmt::Debug for StageTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageTracker")
            .field("writers", &self.writers)
            .field("committed", &self.committed_block())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    fn recording(writers: usize) -> (StageTracker, Arc<Mutex<Vec<u32>>>) {
        let fired = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&fired);
        let tracker = StageTracker::new(writers, move |block| sink.lock().unwrap().push(block)).unwrap();
        (tracker, fired)
    }

    #[test]
    fn zero_writers_rejected() {
        assert!(matches!(StageTracker::new(0, |_| {}), Err(SinkError::Config(_))));
    }

    #[test]
    fn fires_once_every_writer_reported() {
        let (tracker, fired) = recording(3);

        tracker.report_stage_complete(1000);
        tracker.report_stage_complete(1000);
        assert!(fired.lock().unwrap().is_empty());
        assert_eq!(tracker.committed_block(), 0);

        tracker.report_stage_complete(1000);
        assert_eq!(*fired.lock().unwrap(), vec![1000]);
        assert_eq!(tracker.committed_block(), 1000);
    }

    #[test]
    fn single_writer_fires_once_per_stage() {
        let (tracker, fired) = recording(1);
        tracker.report_stage_complete(5);
        tracker.report_stage_complete(5);
        tracker.report_stage_complete(6);
        assert_eq!(*fired.lock().unwrap(), vec![5, 6]);
    }

    #[test]
    fn stale_reports_are_ignored() {
        let (tracker, fired) = recording(2);
        tracker.report_stage_complete(4);
        tracker.report_stage_complete(8);
        tracker.report_stage_complete(8);
        assert_eq!(*fired.lock().unwrap(), vec![8]);

        // The late report for stage 4 must not complete anything.
        tracker.report_stage_complete(4);
        tracker.report_stage_complete(7);
        assert_eq!(*fired.lock().unwrap(), vec![8]);
        assert_eq!(tracker.committed_block(), 8);
    }

    #[test]
    fn complete_stage_skips_the_barrier() {
        let (tracker, fired) = recording(7);
        tracker.report_stage_complete(3);
        tracker.complete_stage(3);
        tracker.complete_stage(2);
        assert_eq!(*fired.lock().unwrap(), vec![3]);
    }

    #[tokio::test]
    async fn waiters_resume_when_stage_completes() {
        let tracker = Arc::new(StageTracker::new(2, |_| {}).unwrap());
        let waiter = {
            let tracker = Arc::clone(&tracker);
            tokio::spawn(async move { tracker.wait_for(10).await })
        };

        tracker.report_stage_complete(10);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        tracker.report_stage_complete(10);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }
}
