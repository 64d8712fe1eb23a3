//! Data processor: a batch-sink worker running on its own task.
//!
//! # Hand-off
//! The producer calls [`DataProcessor::trigger`], which parks the batch in a
//! single-slot channel and waits until the worker has taken it. A second
//! trigger while the worker is still busy waits for the slot, so at most one
//! batch is ever pending and batches of one processor are flushed in order.
//!
//! # Processing
//! For every batch the worker asks its current [`TransactionController`] for
//! a transaction, runs the flush function and commits. A failing flush aborts
//! the transaction, is logged, and ends the worker; the producer finds out
//! through `ProcessorStopped` on its next call. A panicking flush ends the
//! worker the same way.
//!
//! # Stages
//! A flush may tag its status with the block number it completes. Once that
//! batch is committed the worker reports the stage to the registered
//! [`StageTracker`].

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use futures::FutureExt;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::SinkError;
use crate::stage::StageTracker;
use crate::store::Store;
use crate::tx_controller::{
    IndependentTransactionController, TransactionControllerPtr, TransactionHandle,
};

/// Outcome of one flush: rows written, whether the flush succeeded and the
/// block stage it completes, if any.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProcessingStatus {
    pub rows: u64,
    pub success: bool,
    pub stage: Option<u32>,
}

impl ProcessingStatus {
    pub fn processed(rows: u64) -> Self {
        Self {
            rows,
            success: true,
            stage: None,
        }
    }

    pub fn with_stage(mut self, stage: Option<u32>) -> Self {
        self.stage = stage;
        self
    }
}

/// Lifecycle of a data processor worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessorState {
    /// Started, worker not yet in its loop.
    Idle,
    WaitingForData,
    Processing,
    /// Worker has exited (joined, cancelled or failed).
    Stopped,
}

impl std::fmt::Display for ProcessorState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::WaitingForData => write!(f, "waiting-for-data"),
            Self::Processing => write!(f, "processing"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

enum Command<T> {
    Process {
        data: T,
        accepted: oneshot::Sender<()>,
    },
    /// Answered once every earlier batch has been committed.
    Sync { done: oneshot::Sender<()> },
}

/// State visible to both the handle and the worker task.
struct WorkerShared {
    name: String,
    controller: Mutex<TransactionControllerPtr>,
    state: Mutex<ProcessorState>,
    stage_tracker: Mutex<Option<Arc<StageTracker>>>,
    cancel: AtomicBool,
    processed_rows: AtomicU64,
    processed_batches: AtomicU64,
}

impl WorkerShared {
    fn set_state(&self, state: ProcessorState) {
        *self.state.lock().unwrap_or_else(|p| p.into_inner()) = state;
    }

    fn state(&self) -> ProcessorState {
        *self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn controller(&self) -> TransactionControllerPtr {
        Arc::clone(&self.controller.lock().unwrap_or_else(|p| p.into_inner()))
    }

    fn report_stage(&self, stage: u32) {
        let tracker = self
            .stage_tracker
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone();
        if let Some(tracker) = tracker {
            tracker.report_stage_complete(stage);
        }
    }
}

/// A worker that flushes batches of `T` through a caller-supplied function.
pub struct DataProcessor<T> {
    shared: Arc<WorkerShared>,
    sender: Option<mpsc::Sender<Command<T>>>,
    worker: Option<JoinHandle<()>>,
}

impl<T: Send + 'static> DataProcessor<T> {
    /// Connect the worker's own independent transaction controller and spawn
    /// the worker task.
    ///
    /// `flush` receives each batch together with an open transaction and
    /// must write the batch through that transaction only.
    pub async fn start<F, Fut>(
        name: impl Into<String>,
        store: &dyn Store,
        flush: F,
    ) -> Result<Self, SinkError>
    where
        F: Fn(T, TransactionHandle) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<ProcessingStatus, SinkError>> + Send + 'static,
    {
        let name = name.into();
        info!(processor = %name, "data processor is connecting");
        let own: TransactionControllerPtr =
            Arc::new(IndependentTransactionController::connect(store, name.clone()).await?);

        let shared = Arc::new(WorkerShared {
            name,
            controller: Mutex::new(Arc::clone(&own)),
            state: Mutex::new(ProcessorState::Idle),
            stage_tracker: Mutex::new(None),
            cancel: AtomicBool::new(false),
            processed_rows: AtomicU64::new(0),
            processed_batches: AtomicU64::new(0),
        });

        let (sender, receiver) = mpsc::channel(1);
        let worker = tokio::spawn(run_worker(Arc::clone(&shared), receiver, own, flush));

        Ok(Self {
            shared,
            sender: Some(sender),
            worker: Some(worker),
        })
    }

    /// Hand `data` to the worker; returns once the worker owns it.
    pub async fn trigger(&self, data: T) -> Result<(), SinkError> {
        let sender = self.sender.as_ref().ok_or_else(|| self.stopped())?;
        let (accepted_tx, accepted_rx) = oneshot::channel();

        debug!(processor = %self.shared.name, "triggering data processor");
        sender
            .send(Command::Process {
                data,
                accepted: accepted_tx,
            })
            .await
            .map_err(|_| self.stopped())?;

        debug!(processor = %self.shared.name, "waiting until data processor consumes data");
        accepted_rx.await.map_err(|_| self.stopped())
    }

    /// Wait until every batch triggered so far has been committed.
    pub async fn complete_data_processing(&self) -> Result<(), SinkError> {
        let sender = self.sender.as_ref().ok_or_else(|| self.stopped())?;
        let (done_tx, done_rx) = oneshot::channel();
        sender
            .send(Command::Sync { done: done_tx })
            .await
            .map_err(|_| self.stopped())?;
        done_rx.await.map_err(|_| self.stopped())
    }
}

impl<T> DataProcessor<T> {
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn state(&self) -> ProcessorState {
        self.shared.state()
    }

    pub fn is_running(&self) -> bool {
        self.sender.is_some() && self.shared.state() != ProcessorState::Stopped
    }

    /// Total rows reported by successful flushes.
    pub fn processed_rows(&self) -> u64 {
        self.shared.processed_rows.load(Ordering::SeqCst)
    }

    pub fn processed_batches(&self) -> u64 {
        self.shared.processed_batches.load(Ordering::SeqCst)
    }

    /// Install `controller` and return the one it replaces.
    ///
    /// Only call while no batch is in flight.
    pub fn register_transaction_controller(
        &self,
        controller: TransactionControllerPtr,
    ) -> TransactionControllerPtr {
        let mut current = self
            .shared
            .controller
            .lock()
            .unwrap_or_else(|p| p.into_inner());
        std::mem::replace(&mut *current, controller)
    }

    pub fn transaction_controller(&self) -> TransactionControllerPtr {
        self.shared.controller()
    }

    /// Report every committed stage-tagged batch to `tracker`.
    pub fn set_stage_tracker(&self, tracker: Arc<StageTracker>) {
        *self
            .shared
            .stage_tracker
            .lock()
            .unwrap_or_else(|p| p.into_inner()) = Some(tracker);
    }

    /// Stop without processing a batch the worker has not started on yet.
    pub async fn cancel(&mut self) -> Result<(), SinkError> {
        info!(processor = %self.shared.name, "attempting to cancel data processor");
        self.shared.cancel.store(true, Ordering::SeqCst);
        self.join().await
    }

    /// Finish the batch in flight, accept nothing more, wait for the worker.
    pub async fn join(&mut self) -> Result<(), SinkError> {
        self.sender.take();

        if let Some(worker) = self.worker.take() {
            debug!(processor = %self.shared.name, "waiting for data processor worker to finish");
            worker.await.map_err(|e| {
                SinkError::Other(format!("data processor '{}' panicked: {e}", self.shared.name))
            })?;
        }
        info!(processor = %self.shared.name, "data processor finished execution");
        Ok(())
    }

    fn stopped(&self) -> SinkError {
        SinkError::ProcessorStopped {
            name: self.shared.name.clone(),
        }
    }
}

async fn run_worker<T, F, Fut>(
    shared: Arc<WorkerShared>,
    mut receiver: mpsc::Receiver<Command<T>>,
    own: TransactionControllerPtr,
    flush: F,
) where
    F: Fn(T, TransactionHandle) -> Fut,
    Fut: Future<Output = Result<ProcessingStatus, SinkError>>,
{
    info!(processor = %shared.name, "entering data processor worker");

    let outcome = AssertUnwindSafe(process_commands(&shared, &mut receiver, &flush))
        .catch_unwind()
        .await;
    match outcome {
        Ok(Ok(())) => {}
        Ok(Err(e)) if e.is_store_failure() => {
            error!(processor = %shared.name, error = %e, "data processor detected SQL execution failure");
        }
        Ok(Err(e)) => {
            error!(processor = %shared.name, error = %e, "data processor execution failed");
        }
        Err(_) => {
            error!(processor = %shared.name, "data processor flush panicked");
        }
    }

    receiver.close();
    if let Err(e) = own.disconnect().await {
        warn!(processor = %shared.name, error = %e, "failed to close data processor connection");
    }
    shared.set_state(ProcessorState::Stopped);
    info!(processor = %shared.name, "leaving data processor worker");
}

async fn process_commands<T, F, Fut>(
    shared: &WorkerShared,
    receiver: &mut mpsc::Receiver<Command<T>>,
    flush: &F,
) -> Result<(), SinkError>
where
    F: Fn(T, TransactionHandle) -> Fut,
    Fut: Future<Output = Result<ProcessingStatus, SinkError>>,
{
    loop {
        shared.set_state(ProcessorState::WaitingForData);
        let Some(command) = receiver.recv().await else {
            return Ok(());
        };

        let data = match command {
            Command::Sync { done } => {
                let _ = done.send(());
                continue;
            }
            Command::Process { data, accepted } => {
                let _ = accepted.send(());
                data
            }
        };

        if shared.cancel.load(Ordering::SeqCst) {
            debug!(processor = %shared.name, "cancelled; dropping accepted batch");
            return Ok(());
        }

        shared.set_state(ProcessorState::Processing);
        let controller = shared.controller();
        let tx = controller.open().await?;

        match flush(data, tx.clone()).await {
            Ok(status) => {
                controller.commit(tx).await?;
                shared.processed_rows.fetch_add(status.rows, Ordering::SeqCst);
                shared.processed_batches.fetch_add(1, Ordering::SeqCst);
                debug!(processor = %shared.name, rows = status.rows, "data chunk processed");
                if let Some(stage) = status.stage {
                    shared.report_stage(stage);
                }
            }
            Err(e) => {
                if let Err(abort_err) = controller.abort(tx).await {
                    warn!(processor = %shared.name, error = %abort_err, "abort failed");
                }
                return Err(e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::tx_controller::{ControllerKind, SharedTransactionController, TransactionController};
    use std::time::Duration;
    use tokio::sync::Semaphore;

    async fn insert_processor(store: &MemoryStore) -> DataProcessor<u32> {
        DataProcessor::start("blocks", store, |n: u32, tx: TransactionHandle| async move {
            tx.execute(&format!("INSERT INTO t(n) VALUES\n({n})\n;")).await?;
            Ok(ProcessingStatus::processed(1))
        })
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn processes_and_commits_batches() {
        let store = MemoryStore::new();
        let mut p = insert_processor(&store).await;

        p.trigger(1).await.unwrap();
        p.trigger(2).await.unwrap();
        p.complete_data_processing().await.unwrap();

        assert_eq!(store.committed_rows("t"), 2);
        assert_eq!(p.processed_rows(), 2);
        assert_eq!(p.processed_batches(), 2);
        assert_eq!(p.state(), ProcessorState::WaitingForData);

        p.join().await.unwrap();
        assert_eq!(p.state(), ProcessorState::Stopped);
        assert!(!p.is_running());
        assert_eq!(store.open_connections(), 0);
    }

    #[tokio::test]
    async fn second_trigger_waits_for_consumption() {
        let store = MemoryStore::new();
        let gate = Arc::new(Semaphore::new(0));
        let seen = Arc::new(Mutex::new(Vec::new()));

        let p = {
            let gate = Arc::clone(&gate);
            let seen = Arc::clone(&seen);
            DataProcessor::start("gated", &store, move |n: u32, _tx| {
                let gate = Arc::clone(&gate);
                let seen = Arc::clone(&seen);
                async move {
                    gate.acquire().await.unwrap().forget();
                    seen.lock().unwrap().push(n);
                    Ok(ProcessingStatus::processed(1))
                }
            })
            .await
            .unwrap()
        };

        p.trigger(1).await.unwrap();

        let second = p.trigger(2);
        tokio::pin!(second);
        assert!(
            tokio::time::timeout(Duration::from_millis(50), &mut second)
                .await
                .is_err(),
            "second batch accepted while the first was still in flight"
        );

        gate.add_permits(1);
        second.await.unwrap();
        gate.add_permits(1);
        p.complete_data_processing().await.unwrap();

        assert_eq!(*seen.lock().unwrap(), vec![1, 2]);
    }

    #[tokio::test]
    async fn store_failure_stops_worker_without_reaching_trigger() {
        let store = MemoryStore::new();
        store.fail_on("broken");
        let p = DataProcessor::start("broken", &store, |_: u32, tx: TransactionHandle| async move {
            tx.execute("INSERT INTO broken(a) VALUES\n(1)\n;").await?;
            Ok(ProcessingStatus::processed(1))
        })
        .await
        .unwrap();

        p.trigger(1).await.unwrap();

        let err = p.complete_data_processing().await.unwrap_err();
        assert!(matches!(err, SinkError::ProcessorStopped { .. }));
        assert!(matches!(
            p.trigger(2).await,
            Err(SinkError::ProcessorStopped { .. })
        ));
        assert_eq!(store.rollbacks(), 1);
        assert_eq!(store.committed_rows("broken"), 0);
    }

    #[tokio::test]
    async fn register_swaps_and_restores_controller() {
        let store = MemoryStore::new();
        let mut p = insert_processor(&store).await;
        let shared: TransactionControllerPtr =
            Arc::new(SharedTransactionController::connect(&store).await.unwrap());

        let previous = p.register_transaction_controller(Arc::clone(&shared));
        assert_eq!(previous.kind(), ControllerKind::Independent);
        assert_eq!(p.transaction_controller().kind(), ControllerKind::Shared);

        let replaced = p.register_transaction_controller(Arc::clone(&previous));
        assert!(Arc::ptr_eq(&replaced, &shared));
        assert!(Arc::ptr_eq(&p.transaction_controller(), &previous));

        p.join().await.unwrap();
    }

    #[tokio::test]
    async fn join_flushes_everything_triggered() {
        let store = MemoryStore::new();
        let mut p = insert_processor(&store).await;
        for n in 0..3 {
            p.trigger(n).await.unwrap();
        }
        p.join().await.unwrap();
        assert_eq!(store.committed_rows("t"), 3);
    }

    #[tokio::test]
    async fn cancel_stops_worker() {
        let store = MemoryStore::new();
        let mut p = insert_processor(&store).await;
        p.cancel().await.unwrap();

        assert_eq!(p.state(), ProcessorState::Stopped);
        assert!(matches!(
            p.trigger(1).await,
            Err(SinkError::ProcessorStopped { .. })
        ));
        assert_eq!(store.committed_rows("t"), 0);
    }

    #[tokio::test]
    async fn cancel_drops_batch_accepted_while_busy() {
        let store = MemoryStore::new();
        let gate = Arc::new(Semaphore::new(0));
        let seen = Arc::new(Mutex::new(Vec::new()));

        let mut p = {
            let gate = Arc::clone(&gate);
            let seen = Arc::clone(&seen);
            DataProcessor::start("gated", &store, move |n: u32, _tx| {
                let gate = Arc::clone(&gate);
                let seen = Arc::clone(&seen);
                async move {
                    gate.acquire().await.unwrap().forget();
                    seen.lock().unwrap().push(n);
                    Ok(ProcessingStatus::processed(1))
                }
            })
            .await
            .unwrap()
        };

        p.trigger(1).await.unwrap();
        // Batch 2 sits in the slot; the worker is still busy with batch 1.
        assert!(tokio::time::timeout(Duration::from_millis(50), p.trigger(2))
            .await
            .is_err());

        let release = async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            gate.add_permits(2);
        };
        let (cancelled, ()) = tokio::join!(p.cancel(), release);
        cancelled.unwrap();

        assert_eq!(*seen.lock().unwrap(), vec![1]);
        assert_eq!(p.processed_batches(), 1);
        assert_eq!(p.state(), ProcessorState::Stopped);
        assert_eq!(store.open_connections(), 0);
    }

    #[tokio::test]
    async fn panicking_flush_stops_worker_and_disconnects() {
        let store = MemoryStore::new();
        let mut p = DataProcessor::start("panicky", &store, |n: u32, _tx| async move {
            if n == 2 {
                panic!("flush blew up");
            }
            Ok(ProcessingStatus::processed(1))
        })
        .await
        .unwrap();

        p.trigger(1).await.unwrap();
        p.trigger(2).await.unwrap();
        assert!(matches!(
            p.complete_data_processing().await,
            Err(SinkError::ProcessorStopped { .. })
        ));

        p.join().await.unwrap();
        assert_eq!(p.state(), ProcessorState::Stopped);
        assert!(!p.is_running());
        assert_eq!(p.processed_batches(), 1);
        assert_eq!(store.open_connections(), 0);
    }

    #[tokio::test]
    async fn committed_stage_is_reported_to_tracker() {
        let store = MemoryStore::new();
        let tracker = Arc::new(StageTracker::new(1, |_| {}).unwrap());
        let mut p = DataProcessor::start("staged", &store, |n: u32, tx: TransactionHandle| async move {
            tx.execute(&format!("INSERT INTO t(n) VALUES\n({n})\n;")).await?;
            Ok(ProcessingStatus::processed(1).with_stage(Some(n)))
        })
        .await
        .unwrap();
        p.set_stage_tracker(Arc::clone(&tracker));

        p.trigger(7).await.unwrap();
        p.complete_data_processing().await.unwrap();
        assert_eq!(tracker.committed_block(), 7);

        p.join().await.unwrap();
    }
}
