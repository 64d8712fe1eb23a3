//! Record cache: id caches plus the rows buffered since the last flush.
//!
//! Owned by the coordinator and mutated only from its task; workers never see
//! it. Batches leave through the `take_*` methods, which hand the buffered rows
//! over and leave a freshly reserved vector behind.

use std::collections::HashMap;
use std::mem;

use tracing::info;

use crate::records::{
    AccountInfo, AccountOperationRow, AccountRow, BlockRow, OperationRow, PermlinkRow,
    TransactionMultisigRow, TransactionRow,
};

/// Default capacity reserved for each batch vector.
pub const DEFAULT_RESERVATION_SIZE: usize = 16_000;

/// Every row buffered since the last flush, one vector per table.
#[derive(Debug, Default)]
pub struct Batches {
    pub accounts: Vec<AccountRow>,
    pub permlinks: Vec<PermlinkRow>,
    pub blocks: Vec<BlockRow>,
    pub transactions: Vec<TransactionRow>,
    pub transactions_multisig: Vec<TransactionMultisigRow>,
    pub operations: Vec<OperationRow>,
    pub account_operations: Vec<AccountOperationRow>,
}

impl Batches {
    pub fn with_capacity(reservation_size: usize) -> Self {
        Self {
            accounts: Vec::with_capacity(reservation_size),
            permlinks: Vec::with_capacity(reservation_size),
            blocks: Vec::with_capacity(reservation_size),
            transactions: Vec::with_capacity(reservation_size),
            transactions_multisig: Vec::with_capacity(reservation_size),
            operations: Vec::with_capacity(reservation_size),
            account_operations: Vec::with_capacity(reservation_size),
        }
    }

    pub fn pending_rows(&self) -> usize {
        self.accounts.len()
            + self.permlinks.len()
            + self.blocks.len()
            + self.transactions.len()
            + self.transactions_multisig.len()
            + self.operations.len()
            + self.account_operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending_rows() == 0
    }
}

/// Account and permlink caches, id counters and the pending batches.
#[derive(Debug)]
pub struct RecordCache {
    pub accounts: HashMap<String, AccountInfo>,
    /// Next account id to hand out.
    pub next_account_id: i32,
    pub permlinks: HashMap<String, i32>,
    /// Next permlink id to hand out.
    pub next_permlink_id: i32,
    pub batches: Batches,
    /// Approximate size in bytes of the buffered rows.
    pub total_size: usize,
    reservation_size: usize,
}

impl Default for RecordCache {
    fn default() -> Self {
        Self::new(DEFAULT_RESERVATION_SIZE)
    }
}

impl RecordCache {
    pub fn new(reservation_size: usize) -> Self {
        Self {
            accounts: HashMap::new(),
            next_account_id: 1,
            permlinks: HashMap::new(),
            next_permlink_id: 1,
            batches: Batches::with_capacity(reservation_size),
            total_size: 0,
            reservation_size,
        }
    }

    /// Replace the account cache with persisted state; the counter continues
    /// after the highest persisted id.
    pub fn seed_accounts(&mut self, accounts: HashMap<String, AccountInfo>) {
        let max_id = accounts.values().map(|info| info.id).max().unwrap_or(0);
        self.accounts = accounts;
        self.next_account_id = max_id + 1;
    }

    pub fn seed_permlinks(&mut self, permlinks: HashMap<String, i32>) {
        let max_id = permlinks.values().copied().max().unwrap_or(0);
        self.permlinks = permlinks;
        self.next_permlink_id = max_id + 1;
    }

    pub fn pending_rows(&self) -> usize {
        self.batches.pending_rows()
    }

    pub fn is_empty(&self) -> bool {
        self.batches.is_empty()
    }

    /// Take every buffered batch, leaving reserved empty vectors behind.
    pub fn take_batches(&mut self) -> Batches {
        self.log_summary();
        self.total_size = 0;
        mem::replace(&mut self.batches, Batches::with_capacity(self.reservation_size))
    }

    pub fn log_summary(&self) {
        let b = &self.batches;
        info!(
            accounts = b.accounts.len(),
            permlinks = b.permlinks.len(),
            blocks = b.blocks.len(),
            transactions = b.transactions.len(),
            operations = b.operations.len(),
            account_operations = b.account_operations.len(),
            total_size = self.total_size,
            "flushing cached data"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_store_seeds_counters_at_one() {
        let mut cache = RecordCache::new(4);
        cache.seed_accounts(HashMap::new());
        cache.seed_permlinks(HashMap::new());
        assert_eq!(cache.next_account_id, 1);
        assert_eq!(cache.next_permlink_id, 1);
    }

    #[test]
    fn counters_continue_after_highest_persisted_id() {
        let mut cache = RecordCache::new(4);
        cache.seed_accounts(HashMap::from([
            ("alice".to_string(), AccountInfo::new(7, 3)),
            ("bob".to_string(), AccountInfo::new(2, 0)),
        ]));
        cache.seed_permlinks(HashMap::from([("hello".to_string(), 40)]));
        assert_eq!(cache.next_account_id, 8);
        assert_eq!(cache.next_permlink_id, 41);
        assert_eq!(cache.accounts["alice"].operation_count, 3);
    }

    #[test]
    fn take_batches_leaves_empty_reserved_vectors() {
        let mut cache = RecordCache::new(8);
        cache.batches.accounts.push(AccountRow {
            id: 1,
            name: "alice".into(),
        });
        cache.total_size = 42;
        assert_eq!(cache.pending_rows(), 1);

        let taken = cache.take_batches();
        assert_eq!(taken.accounts.len(), 1);
        assert!(cache.is_empty());
        assert_eq!(cache.total_size, 0);
        assert!(cache.batches.operations.capacity() >= 8);
    }
}
