//! Table writers: one data processor per destination table.
//!
//! A [`TableWriter`] turns a whole batch into exactly one bulk insert:
//!
//! ```text
//! INSERT INTO hive_accounts(id, name) VALUES
//! (1,E'alice')
//! ,(2,E'bob')
//! ;
//! ```

use std::sync::Arc;

use tracing::debug;

use crate::error::SinkError;
use crate::processor::{DataProcessor, ProcessingStatus};
use crate::stage::StageTracker;
use crate::store::Store;
use crate::tx_controller::{TransactionControllerPtr, TransactionHandle};

/// A record kind that maps onto one destination table.
pub trait SqlTuple {
    const TABLE: &'static str;
    /// Explicit column list, in tuple order.
    const COLUMNS: &'static str;

    /// Values of this row, comma-joined, without the surrounding parentheses.
    fn to_sql_tuple(&self) -> String;
}

/// Render `rows` as a single bulk insert; `None` for an empty batch.
pub fn bulk_insert_statement<R: SqlTuple>(rows: &[R]) -> Option<String> {
    let (first, rest) = rows.split_first()?;

    let mut sql = String::with_capacity(64 + rows.len() * 64);
    sql.push_str("INSERT INTO ");
    sql.push_str(R::TABLE);
    sql.push('(');
    sql.push_str(R::COLUMNS);
    sql.push_str(") VALUES\n(");
    sql.push_str(&first.to_sql_tuple());
    sql.push_str(")\n");
    for row in rest {
        sql.push_str(",(");
        sql.push_str(&row.to_sql_tuple());
        sql.push_str(")\n");
    }
    sql.push(';');
    Some(sql)
}

/// Rows of one flush plus the block stage they complete.
struct WriterBatch<R> {
    rows: Vec<R>,
    stage: Option<u32>,
}

async fn flush_rows<R: SqlTuple>(
    batch: WriterBatch<R>,
    tx: TransactionHandle,
) -> Result<ProcessingStatus, SinkError> {
    let status = match bulk_insert_statement(&batch.rows) {
        Some(sql) => {
            tx.execute(&sql).await?;
            ProcessingStatus::processed(batch.rows.len() as u64)
        }
        None => ProcessingStatus::processed(0),
    };
    Ok(status.with_stage(batch.stage))
}

/// Batch-sink worker for one table.
pub struct TableWriter<R> {
    processor: DataProcessor<WriterBatch<R>>,
    /// Controller displaced by `register_transaction_controller`.
    previous_controller: Option<TransactionControllerPtr>,
}

impl<R> TableWriter<R>
where
    R: SqlTuple + Send + 'static,
{
    pub async fn start(description: impl Into<String>, store: &dyn Store) -> Result<Self, SinkError> {
        let processor = DataProcessor::start(description, store, flush_rows::<R>).await?;
        Ok(Self {
            processor,
            previous_controller: None,
        })
    }

    /// Hand `rows` to the worker; with `wait_for_completion` also wait until
    /// they are committed. An empty batch is a no-op.
    pub async fn trigger(&self, rows: Vec<R>, wait_for_completion: bool) -> Result<(), SinkError> {
        self.trigger_stage(rows, None, wait_for_completion).await
    }

    /// Like [`trigger`](Self::trigger), tagging the batch with the block
    /// `stage` it completes. A tagged batch is always handed over, even when
    /// empty, so the stage is reported once every earlier batch is committed.
    pub async fn trigger_stage(
        &self,
        rows: Vec<R>,
        stage: Option<u32>,
        wait_for_completion: bool,
    ) -> Result<(), SinkError> {
        if rows.is_empty() && stage.is_none() {
            return Ok(());
        }
        debug!(table = R::TABLE, rows = rows.len(), ?stage, "triggering table flush");
        self.processor.trigger(WriterBatch { rows, stage }).await?;
        if wait_for_completion {
            self.processor.complete_data_processing().await?;
        }
        Ok(())
    }

    pub async fn complete_data_processing(&self) -> Result<(), SinkError> {
        self.processor.complete_data_processing().await
    }
}

impl<R> TableWriter<R> {
    pub fn name(&self) -> &str {
        self.processor.name()
    }

    /// Install `controller`, remembering the current one for
    /// [`restore_transaction_controller`](Self::restore_transaction_controller).
    pub fn register_transaction_controller(
        &mut self,
        controller: TransactionControllerPtr,
    ) -> Result<(), SinkError> {
        if self.previous_controller.is_some() {
            return Err(SinkError::Consistency(format!(
                "writer '{}' already has a registered transaction controller",
                self.processor.name()
            )));
        }
        self.previous_controller = Some(self.processor.register_transaction_controller(controller));
        Ok(())
    }

    /// Put back the controller displaced by the last registration and return
    /// the one that was active.
    pub fn restore_transaction_controller(&mut self) -> Result<TransactionControllerPtr, SinkError> {
        let previous = self.previous_controller.take().ok_or_else(|| {
            SinkError::Consistency(format!(
                "writer '{}' has no transaction controller to restore",
                self.processor.name()
            ))
        })?;
        Ok(self.processor.register_transaction_controller(previous))
    }

    pub fn set_stage_tracker(&self, tracker: Arc<StageTracker>) {
        self.processor.set_stage_tracker(tracker);
    }

    pub fn is_running(&self) -> bool {
        self.processor.is_running()
    }

    pub fn processed_rows(&self) -> u64 {
        self.processor.processed_rows()
    }

    pub async fn join(&mut self) -> Result<(), SinkError> {
        self.processor.join().await
    }

    pub async fn cancel(&mut self) -> Result<(), SinkError> {
        self.processor.cancel().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::AccountRow;
    use crate::store::MemoryStore;
    use crate::tx_controller::{ControllerKind, SharedTransactionController, TransactionController};

    fn accounts(n: i32) -> Vec<AccountRow> {
        (1..=n)
            .map(|id| AccountRow {
                id,
                name: format!("user{id}"),
            })
            .collect()
    }

    #[test]
    fn bulk_statement_layout() {
        let sql = bulk_insert_statement(&accounts(2)).unwrap();
        assert_eq!(
            sql,
            "INSERT INTO hive_accounts(id, name) VALUES\n(1,E'user1')\n,(2,E'user2')\n;"
        );
        assert!(bulk_insert_statement::<AccountRow>(&[]).is_none());
    }

    #[tokio::test]
    async fn batch_of_n_rows_is_one_statement_with_n_tuples() {
        let store = MemoryStore::new();
        let mut writer = TableWriter::<AccountRow>::start("Account data writer", &store)
            .await
            .unwrap();

        writer.trigger(accounts(25), true).await.unwrap();

        assert_eq!(store.inserts_into("hive_accounts").len(), 1);
        assert_eq!(store.committed_rows("hive_accounts"), 25);
        assert_eq!(writer.processed_rows(), 25);
        writer.join().await.unwrap();
    }

    #[tokio::test]
    async fn empty_batch_is_noop() {
        let store = MemoryStore::new();
        let mut writer = TableWriter::<AccountRow>::start("Account data writer", &store)
            .await
            .unwrap();
        writer.trigger(Vec::new(), true).await.unwrap();
        writer.join().await.unwrap();
        assert!(store.committed_statements().is_empty());
    }

    #[tokio::test]
    async fn shared_controller_holds_rows_until_owner_commits() {
        let store = MemoryStore::new();
        let mut writer = TableWriter::<AccountRow>::start("Account data writer", &store)
            .await
            .unwrap();
        let shared = Arc::new(SharedTransactionController::connect(&store).await.unwrap());

        writer.register_transaction_controller(shared.clone()).unwrap();
        assert!(writer.register_transaction_controller(shared.clone()).is_err());

        writer.trigger(accounts(3), true).await.unwrap();
        assert_eq!(store.committed_rows("hive_accounts"), 0);
        shared.commit_pending().await.unwrap();
        assert_eq!(store.committed_rows("hive_accounts"), 3);

        let displaced = writer.restore_transaction_controller().unwrap();
        assert_eq!(displaced.kind(), ControllerKind::Shared);
        assert!(writer.restore_transaction_controller().is_err());

        writer.trigger(accounts(2), true).await.unwrap();
        assert_eq!(store.committed_rows("hive_accounts"), 5);
        writer.join().await.unwrap();
    }

    #[tokio::test]
    async fn stage_fires_after_every_writer_committed() {
        let store = MemoryStore::new();
        let tracker = Arc::new(StageTracker::new(2, |_| {}).unwrap());
        let mut first = TableWriter::<AccountRow>::start("Account data writer", &store)
            .await
            .unwrap();
        let mut second = TableWriter::<AccountRow>::start("Second account writer", &store)
            .await
            .unwrap();
        first.set_stage_tracker(Arc::clone(&tracker));
        second.set_stage_tracker(Arc::clone(&tracker));

        first.trigger_stage(accounts(2), Some(10), true).await.unwrap();
        assert_eq!(tracker.committed_block(), 0);

        // Nothing to write, but the stage still has to be reported.
        second.trigger_stage(Vec::new(), Some(10), true).await.unwrap();
        assert_eq!(tracker.committed_block(), 10);
        assert_eq!(store.committed_rows("hive_accounts"), 2);

        first.join().await.unwrap();
        second.join().await.unwrap();
    }
}
