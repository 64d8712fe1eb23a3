//! The ingestion coordinator.
//!
//! # Live sync
//! Every writer is registered with one [`SharedTransactionController`]. Each
//! flush waits for all writers and then commits the shared transaction, so a
//! block becomes visible atomically across all tables.
//!
//! # Reindex
//! Writers fall back to their own connections and commit every flush
//! independently. Many blocks are buffered per flush and the coordinator does
//! not wait for durability in between.
//!
//! # Consistency points
//! All writers share one [`StageTracker`]. A block counts as committed once
//! every writer has made it durable: in live sync right after the shared
//! commit, during a replay once the last of the seven independent flushes
//! tagged with that block has committed.
//!
//! Accounts, permlinks and per-account counters live in the coordinator's
//! [`RecordCache`] and are only touched from the notification handlers.

use std::sync::Arc;
use std::time::Instant;

use futures::future::{try_join_all, BoxFuture, FutureExt};
use tokio::sync::watch;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use chainsink_core::cache::{Batches, RecordCache};
use chainsink_core::error::SinkError;
use chainsink_core::ids::{collect_impacted_accounts, collect_new_ids, import_builtin_accounts};
use chainsink_core::protocol::{
    BlockNotification, ChainState, OperationNotification, ReindexNotification, SignedTransaction,
};
use chainsink_core::records::{
    AccountOperationRow, AccountRow, BlockRow, OperationRow, PermlinkRow, TransactionMultisigRow,
    TransactionRow,
};
use chainsink_core::stage::StageTracker;
use chainsink_core::store::{execute_in_transaction, Store};
use chainsink_core::tx_controller::{
    SharedTransactionController, TransactionController, TransactionControllerPtr,
};
use chainsink_core::writer::TableWriter;

use crate::config::SerializerConfig;
use crate::loader::load_initial_db_data;
use crate::schema::{execute_schema_script, operation_type_definitions, switch_db_items};
use crate::stats::SerializerStats;

/// Which ingestion regime the coordinator is in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncMode {
    /// Following the head: one shared transaction per flush, durable before
    /// the next block.
    Live,
    /// Replaying the block log: independent transactions, no waiting.
    Reindex,
}

impl std::fmt::Display for SyncMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Live => write!(f, "live"),
            Self::Reindex => write!(f, "reindex"),
        }
    }
}

// ─── Writers ─────────────────────────────────────────────────────────────────

/// The seven table writers.
struct Writers {
    accounts: TableWriter<AccountRow>,
    permlinks: TableWriter<PermlinkRow>,
    blocks: TableWriter<BlockRow>,
    transactions: TableWriter<TransactionRow>,
    transactions_multisig: TableWriter<TransactionMultisigRow>,
    operations: TableWriter<OperationRow>,
    account_operations: TableWriter<AccountOperationRow>,
}

impl Writers {
    const COUNT: usize = 7;

    async fn start(store: &dyn Store) -> Result<Self, SinkError> {
        Ok(Self {
            accounts: TableWriter::start("Account data writer", store).await?,
            permlinks: TableWriter::start("Permlink data writer", store).await?,
            blocks: TableWriter::start("Block data writer", store).await?,
            transactions: TableWriter::start("Transaction data writer", store).await?,
            transactions_multisig: TableWriter::start("Transaction multisig data writer", store)
                .await?,
            operations: TableWriter::start("Operation data writer", store).await?,
            account_operations: TableWriter::start("Account operation data writer", store).await?,
        })
    }

    /// Hand every batch to its writer, in dependency order. With a `stage`
    /// every writer reports that block once its part is committed.
    async fn flush(&self, batches: Batches, stage: Option<u32>, wait: bool) -> Result<(), SinkError> {
        self.accounts.trigger_stage(batches.accounts, stage, wait).await?;
        self.permlinks.trigger_stage(batches.permlinks, stage, wait).await?;
        self.blocks.trigger_stage(batches.blocks, stage, wait).await?;
        self.operations.trigger_stage(batches.operations, stage, wait).await?;
        self.transactions.trigger_stage(batches.transactions, stage, wait).await?;
        self.transactions_multisig
            .trigger_stage(batches.transactions_multisig, stage, wait)
            .await?;
        self.account_operations
            .trigger_stage(batches.account_operations, stage, wait)
            .await?;
        Ok(())
    }

    fn set_stage_tracker(&self, tracker: &Arc<StageTracker>) {
        self.accounts.set_stage_tracker(Arc::clone(tracker));
        self.permlinks.set_stage_tracker(Arc::clone(tracker));
        self.blocks.set_stage_tracker(Arc::clone(tracker));
        self.transactions.set_stage_tracker(Arc::clone(tracker));
        self.transactions_multisig.set_stage_tracker(Arc::clone(tracker));
        self.operations.set_stage_tracker(Arc::clone(tracker));
        self.account_operations.set_stage_tracker(Arc::clone(tracker));
    }

    async fn complete_data_processing(&self) -> Result<(), SinkError> {
        let pending: Vec<BoxFuture<'_, Result<(), SinkError>>> = vec![
            self.accounts.complete_data_processing().boxed(),
            self.permlinks.complete_data_processing().boxed(),
            self.blocks.complete_data_processing().boxed(),
            self.transactions.complete_data_processing().boxed(),
            self.transactions_multisig.complete_data_processing().boxed(),
            self.operations.complete_data_processing().boxed(),
            self.account_operations.complete_data_processing().boxed(),
        ];
        try_join_all(pending).await?;
        Ok(())
    }

    fn register_transaction_controller(
        &mut self,
        controller: TransactionControllerPtr,
    ) -> Result<(), SinkError> {
        self.accounts.register_transaction_controller(Arc::clone(&controller))?;
        self.permlinks.register_transaction_controller(Arc::clone(&controller))?;
        self.blocks.register_transaction_controller(Arc::clone(&controller))?;
        self.transactions.register_transaction_controller(Arc::clone(&controller))?;
        self.transactions_multisig
            .register_transaction_controller(Arc::clone(&controller))?;
        self.operations.register_transaction_controller(Arc::clone(&controller))?;
        self.account_operations.register_transaction_controller(controller)?;
        Ok(())
    }

    fn restore_transaction_controller(&mut self) -> Result<(), SinkError> {
        self.accounts.restore_transaction_controller()?;
        self.permlinks.restore_transaction_controller()?;
        self.blocks.restore_transaction_controller()?;
        self.transactions.restore_transaction_controller()?;
        self.transactions_multisig.restore_transaction_controller()?;
        self.operations.restore_transaction_controller()?;
        self.account_operations.restore_transaction_controller()?;
        Ok(())
    }

    /// `(name, running)` for every writer, in flush order.
    fn liveness(&self) -> [(&str, bool); Self::COUNT] {
        [
            (self.accounts.name(), self.accounts.is_running()),
            (self.permlinks.name(), self.permlinks.is_running()),
            (self.blocks.name(), self.blocks.is_running()),
            (self.operations.name(), self.operations.is_running()),
            (self.transactions.name(), self.transactions.is_running()),
            (self.transactions_multisig.name(), self.transactions_multisig.is_running()),
            (self.account_operations.name(), self.account_operations.is_running()),
        ]
    }

    fn ensure_running(&self) -> Result<(), SinkError> {
        match self.liveness().into_iter().find(|(_, running)| !running) {
            Some((name, _)) => Err(SinkError::ProcessorStopped {
                name: name.to_string(),
            }),
            None => Ok(()),
        }
    }

    /// Join every writer, even after one fails; returns the first error.
    async fn join(&mut self) -> Result<(), SinkError> {
        let results = [
            self.accounts.join().await,
            self.permlinks.join().await,
            self.blocks.join().await,
            self.transactions.join().await,
            self.transactions_multisig.join().await,
            self.operations.join().await,
            self.account_operations.join().await,
        ];
        results.into_iter().collect()
    }

    async fn cancel(&mut self) -> Result<(), SinkError> {
        let results = [
            self.accounts.cancel().await,
            self.permlinks.cancel().await,
            self.blocks.cancel().await,
            self.transactions.cancel().await,
            self.transactions_multisig.cancel().await,
            self.operations.cancel().await,
            self.account_operations.cancel().await,
        ];
        results.into_iter().collect()
    }
}

// ─── SqlSerializer ───────────────────────────────────────────────────────────

/// Serializes applied blocks into the store.
///
/// Notification handlers must be called in the order the node emits them,
/// from a single task.
pub struct SqlSerializer {
    config: SerializerConfig,
    store: Arc<dyn Store>,
    chain: Arc<dyn ChainState>,
    writers: Writers,
    shared_controller: Option<Arc<SharedTransactionController>>,
    stage_tracker: Arc<StageTracker>,
    cache: RecordCache,
    mode: SyncMode,
    blocks_per_commit: u32,
    initialized: bool,
    psql_block_number: u32,
    head_block_number: u32,
    last_skipped_block: u32,
    /// Last block handed to the cache.
    last_block_number: u32,
    /// Last block a replay flush was tagged with.
    last_staged_block: u32,
    op_sequence_id: i64,
    block_vops: i64,
    stats: SerializerStats,
}

impl SqlSerializer {
    /// Validate `config`, start the table writers and enter live sync.
    pub async fn start(
        config: SerializerConfig,
        store: Arc<dyn Store>,
        chain: Arc<dyn ChainState>,
    ) -> Result<Self, SinkError> {
        config.validate()?;
        info!("initializing sql serializer");

        let writers = Writers::start(store.as_ref()).await?;
        let stage_tracker = Arc::new(StageTracker::new(Writers::COUNT, |block| {
            debug!(block, "block committed by every writer");
        })?);
        writers.set_stage_tracker(&stage_tracker);
        let cache = RecordCache::new(config.reservation_size);
        let blocks_per_commit = config.live_blocks_per_commit;

        let mut serializer = Self {
            config,
            store,
            chain,
            writers,
            shared_controller: None,
            stage_tracker,
            cache,
            mode: SyncMode::Live,
            blocks_per_commit,
            initialized: false,
            psql_block_number: 0,
            head_block_number: 0,
            last_skipped_block: 0,
            last_block_number: 0,
            last_staged_block: 0,
            op_sequence_id: 0,
            block_vops: 0,
            stats: SerializerStats::default(),
        };
        serializer.switch_to_shared_transaction().await?;
        Ok(serializer)
    }

    // ─── Accessors ──────────────────────────────────────────────────────────

    pub fn mode(&self) -> SyncMode {
        self.mode
    }

    pub fn blocks_per_commit(&self) -> u32 {
        self.blocks_per_commit
    }

    pub fn psql_block_number(&self) -> u32 {
        self.psql_block_number
    }

    /// Id of the last operation handed out.
    pub fn last_operation_id(&self) -> i64 {
        self.op_sequence_id
    }

    pub fn cache(&self) -> &RecordCache {
        &self.cache
    }

    pub fn stats(&self) -> &SerializerStats {
        &self.stats
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Highest block every table writer has committed; 0 before the first.
    pub fn committed_block(&self) -> u32 {
        self.stage_tracker.committed_block()
    }

    /// Follow [`committed_block`](Self::committed_block) as it advances.
    pub fn subscribe_committed_blocks(&self) -> watch::Receiver<u32> {
        self.stage_tracker.subscribe()
    }

    // ─── Notifications ──────────────────────────────────────────────────────

    /// Before each block; only the first call initializes the database.
    pub async fn on_pre_apply_block(&mut self, block_num: u32) -> Result<(), SinkError> {
        if self.initialized {
            return Ok(());
        }
        info!(block = block_num, "entering resync data init");
        self.init_database(block_num == 1, block_num).await?;
        info!("leaving resync data init");
        Ok(())
    }

    /// Before each operation, real or virtual.
    pub async fn on_pre_apply_operation(&mut self, note: &OperationNotification) -> Result<(), SinkError> {
        if self.chain.is_producing() {
            debug!("skipping operation from an incoming transaction while producing");
            return Ok(());
        }
        if self.skip_reversible_block(note.block)? {
            return Ok(());
        }

        let started = Instant::now();
        let is_virtual = note.op.is_virtual();

        self.op_sequence_id += 1;
        let operation_id = self.op_sequence_id;

        if !is_virtual {
            collect_new_ids(&mut self.cache, &note.op)?;
        }

        let op_pos = if is_virtual && note.trx_in_block < 0 {
            let pos = self.block_vops;
            self.block_vops += 1;
            pos
        } else {
            note.op_in_trx
        };

        self.cache.total_size += std::mem::size_of::<OperationRow>();
        let row = OperationRow::new(operation_id, note.block, note.trx_in_block, op_pos, &note.op)?;
        self.cache.total_size += row.body.len();
        self.cache.batches.operations.push(row);

        collect_impacted_accounts(&mut self.cache, operation_id, &note.op)?;

        self.stats.operations.record(1, started.elapsed());
        Ok(())
    }

    /// After all operations of a block.
    pub async fn on_post_apply_block(&mut self, note: &BlockNotification) -> Result<(), SinkError> {
        if self.chain.is_producing() {
            return Err(SinkError::Consistency(format!(
                "block {} applied while the node is producing",
                note.block_num
            )));
        }
        if self.skip_reversible_block(note.block_num)? {
            return Ok(());
        }

        let started = Instant::now();
        self.handle_transactions(&note.block.transactions, note.block_num);
        self.stats
            .transactions
            .record(note.block.transactions.len() as u64, started.elapsed());

        let started = Instant::now();
        self.cache.total_size += note.block_id.len() + std::mem::size_of::<u32>();
        self.cache.batches.blocks.push(BlockRow {
            number: note.block_num,
            hash: note.block_id.clone(),
            prev_hash: note.prev_block_id.clone(),
            created_at: note.block.timestamp,
        });
        self.block_vops = 0;
        self.last_block_number = note.block_num;
        self.stats.blocks.record(1, started.elapsed());

        if note.block_num % self.blocks_per_commit == 0 {
            self.process_cached_data().await?;
        }
        if note.block_num % self.config.statistics_interval == 0 {
            self.stats.report(note.block_num);
        }
        Ok(())
    }

    /// Replay of the block log is about to start.
    pub async fn on_pre_reindex(&mut self, note: &ReindexNotification) -> Result<(), SinkError> {
        info!(
            force_replay = note.force_replay,
            max_block = note.max_block_number,
            "entering reindex init"
        );
        if !self.initialized {
            self.init_database(note.force_replay, note.max_block_number).await?;
        }

        // Anything buffered under live sync must land in the shared transaction.
        if !self.cache.is_empty() {
            self.process_cached_data().await?;
        }
        self.switch_to_independent_transactions().await?;

        self.blocks_per_commit = self.config.reindex_blocks_per_commit;
        self.mode = SyncMode::Reindex;
        info!(blocks_per_commit = self.blocks_per_commit, "leaving reindex init");
        Ok(())
    }

    /// Replay of the block log has finished.
    pub async fn on_post_reindex(&mut self, note: &ReindexNotification) -> Result<(), SinkError> {
        info!(
            last_block = note.last_block_number,
            max_block = note.max_block_number,
            "finishing reindex"
        );

        self.process_cached_data().await?;
        self.writers.complete_data_processing().await?;

        if note.last_block_number >= note.max_block_number {
            self.switch_db_items(true).await?;
        }

        self.switch_to_shared_transaction().await?;
        self.blocks_per_commit = self.config.live_blocks_per_commit;
        self.mode = SyncMode::Live;
        Ok(())
    }

    // ─── Shutdown ───────────────────────────────────────────────────────────

    /// Flush everything buffered, stop the writers and close the shared
    /// transaction.
    ///
    /// Every step runs even after an earlier one failed, so the writers are
    /// always joined and every connection is closed. The first error is
    /// returned.
    pub async fn shutdown(mut self) -> Result<(), SinkError> {
        info!("flushing rest of data, wait a moment");
        let mut first_error = None;

        if !self.cache.is_empty() {
            keep_first_error(&mut first_error, "final flush", self.process_cached_data().await);
        }
        keep_first_error(
            &mut first_error,
            "waiting for writers",
            self.writers.complete_data_processing().await,
        );
        if let Some(shared) = self.shared_controller.take() {
            keep_first_error(&mut first_error, "final commit", shared.commit_pending().await);
            keep_first_error(&mut first_error, "closing shared transaction", shared.disconnect().await);
        }
        keep_first_error(&mut first_error, "joining writers", self.writers.join().await);

        match first_error {
            Some(e) => Err(e),
            None => {
                info!("done, cleanup complete");
                Ok(())
            }
        }
    }

    /// Stop every writer at once, discarding whatever is not committed yet.
    pub async fn cancel(mut self) -> Result<(), SinkError> {
        warn!("cancelling sql serializer");
        self.writers.cancel().await?;
        if let Some(shared) = self.shared_controller.take() {
            shared.disconnect().await?;
        }
        Ok(())
    }

    // ─── Internals ──────────────────────────────────────────────────────────

    async fn init_database(&mut self, fresh: bool, max_block_number: u32) -> Result<(), SinkError> {
        self.head_block_number = max_block_number;

        if fresh {
            if let Some(path) = self.config.path_to_schema.clone() {
                execute_schema_script(self.store.as_ref(), &path).await?;
            }
        }

        let data = load_initial_db_data(self.store.as_ref()).await?;
        self.psql_block_number = data.psql_block_number;
        self.op_sequence_id = data.max_operation_id;
        self.cache.seed_accounts(data.accounts);
        self.cache.seed_permlinks(data.permlinks);
        info!(
            next_account_id = self.cache.next_account_id,
            next_permlink_id = self.cache.next_permlink_id,
            next_operation_id = self.op_sequence_id + 1,
            psql_block_number = self.psql_block_number,
            "seeded caches from the database"
        );

        if fresh {
            execute_in_transaction(self.store.as_ref(), &operation_type_definitions()).await?;
            let imported = import_builtin_accounts(&mut self.cache, self.chain.accounts());
            info!(imported, "builtin accounts imported");
        }

        self.switch_db_items(false).await?;
        self.initialized = true;
        Ok(())
    }

    /// Toggle indexes and constraints when the database is empty or far
    /// enough behind the head.
    async fn switch_db_items(&self, create: bool) -> Result<(), SinkError> {
        let allowed = self.psql_block_number == 0
            || u64::from(self.psql_block_number) + u64::from(self.config.index_threshold)
                <= u64::from(self.head_block_number);

        if !allowed {
            info!(
                psql_block_number = self.psql_block_number,
                index_threshold = self.config.index_threshold,
                head_block_number = self.head_block_number,
                "switching indexes and constraints isn't allowed"
            );
            return Ok(());
        }
        info!(
            psql_block_number = self.psql_block_number,
            index_threshold = self.config.index_threshold,
            head_block_number = self.head_block_number,
            "switching indexes and constraints is allowed"
        );
        switch_db_items(self.store.as_ref(), create).await
    }

    /// `true` if `block_num` is already persisted. Such a block must still
    /// be reversible; anything older means the database and the chain
    /// disagree.
    fn skip_reversible_block(&mut self, block_num: u32) -> Result<bool, SinkError> {
        if block_num > self.psql_block_number {
            return Ok(false);
        }

        let last_irreversible = self.chain.last_irreversible_block_num();
        if block_num <= last_irreversible {
            return Err(SinkError::IrreversibleBlockReplayed {
                block_number: block_num,
                last_irreversible,
            });
        }
        if self.last_skipped_block < block_num {
            info!(block = block_num, "skipping data provided by already processed reversible block");
            self.last_skipped_block = block_num;
        }
        Ok(true)
    }

    fn handle_transactions(&mut self, transactions: &[SignedTransaction], block_num: u32) {
        for (trx_in_block, trx) in transactions.iter().enumerate() {
            let mut signatures = trx.signatures.iter();

            self.cache.total_size += trx.id.len() + std::mem::size_of::<TransactionRow>();
            self.cache.batches.transactions.push(TransactionRow {
                block_number: block_num,
                hash: trx.id.clone(),
                trx_in_block: trx_in_block as u32,
                ref_block_num: trx.ref_block_num,
                ref_block_prefix: trx.ref_block_prefix,
                expiration: trx.expiration,
                signature: signatures.next().cloned(),
            });

            for signature in signatures {
                self.cache.batches.transactions_multisig.push(TransactionMultisigRow {
                    trx_hash: trx.id.clone(),
                    signature: signature.clone(),
                });
            }
        }
    }

    /// Hand every pending batch to the writers. In live sync, wait for all of
    /// them and commit the shared transaction.
    async fn process_cached_data(&mut self) -> Result<(), SinkError> {
        self.writers.ensure_running()?;

        let started = Instant::now();
        let batches = self.cache.take_batches();
        let live = self.mode == SyncMode::Live;

        // A replay flush is tagged with its last block so every writer
        // reports it once committed. Live blocks complete with the shared
        // commit below.
        let stage = (!live && self.last_block_number > self.last_staged_block)
            .then_some(self.last_block_number);
        if let Some(block) = stage {
            self.last_staged_block = block;
        }

        self.writers.flush(batches, stage, live).await?;
        if live {
            if let Some(shared) = &self.shared_controller {
                shared.commit_pending().await?;
            }
            self.stage_tracker.complete_stage(self.last_block_number);
        }
        self.stats.record_flush(started.elapsed());
        Ok(())
    }

    async fn switch_to_shared_transaction(&mut self) -> Result<(), SinkError> {
        let shared = Arc::new(SharedTransactionController::connect(self.store.as_ref()).await?);
        self.writers
            .register_transaction_controller(Arc::clone(&shared) as TransactionControllerPtr)?;
        self.shared_controller = Some(shared);
        debug!("writers switched to the shared transaction");
        Ok(())
    }

    async fn switch_to_independent_transactions(&mut self) -> Result<(), SinkError> {
        self.writers.restore_transaction_controller()?;
        if let Some(shared) = self.shared_controller.take() {
            shared.commit_pending().await?;
            shared.disconnect().await?;
        }
        debug!("writers switched to independent transactions");
        Ok(())
    }
}

fn keep_first_error<T>(slot: &mut Option<SinkError>, step: &str, result: Result<T, SinkError>) {
    if let Err(e) = result {
        warn!(step, error = %e, "shutdown step failed");
        slot.get_or_insert(e);
    }
}
