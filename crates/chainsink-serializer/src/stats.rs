//! Periodic throughput statistics.

use std::time::Duration;

use serde::Serialize;
use tracing::info;

/// Count and time spent for one kind of record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatCounter {
    pub count: u64,
    /// Time spent buffering these records on the coordinator.
    pub processing_time: Duration,
}

impl StatCounter {
    pub fn record(&mut self, count: u64, elapsed: Duration) {
        self.count += count;
        self.processing_time += elapsed;
    }
}

/// Statistics accumulated since the last report.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SerializerStats {
    pub blocks: StatCounter,
    pub transactions: StatCounter,
    pub operations: StatCounter,
    pub flushes: u64,
    /// Time spent handing batches to the writers (and waiting in live sync).
    pub flush_time: Duration,
}

impl SerializerStats {
    pub fn record_flush(&mut self, elapsed: Duration) {
        self.flushes += 1;
        self.flush_time += elapsed;
    }

    /// Log the current figures and start over.
    pub fn report(&mut self, block_num: u32) {
        info!(
            block = block_num,
            blocks = self.blocks.count,
            blocks_us = self.blocks.processing_time.as_micros() as u64,
            transactions = self.transactions.count,
            transactions_us = self.transactions.processing_time.as_micros() as u64,
            operations = self.operations.count,
            operations_us = self.operations.processing_time.as_micros() as u64,
            flushes = self.flushes,
            flush_us = self.flush_time.as_micros() as u64,
            "serializer statistics"
        );
        self.reset();
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}
