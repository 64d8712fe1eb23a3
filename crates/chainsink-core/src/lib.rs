//! chainsink-core: building blocks of the Hive-to-PostgreSQL batch sink.
//!
//! # Architecture
//!
//! ```text
//! SqlSerializer (coordinator task)
//!      ├── RecordCache       (id caches + pending batches, coordinator-owned)
//!      ├── ids               (account/permlink allocation, impact linking)
//!      └── TableWriter<R> ×7 (one DataProcessor task per table)
//!               └── TransactionController
//!                      ├── Shared       (live: one transaction per block)
//!                      └── Independent  (reindex: one transaction per flush)
//!                             └── Store backend (memory / Postgres)
//! ```

pub mod cache;
pub mod error;
pub mod escape;
pub mod ids;
pub mod processor;
pub mod protocol;
pub mod records;
pub mod stage;
pub mod store;
pub mod tx_controller;
pub mod writer;

pub use cache::{Batches, RecordCache};
pub use error::SinkError;
pub use processor::{DataProcessor, ProcessingStatus, ProcessorState};
pub use protocol::{ChainState, Operation, OperationKind};
pub use records::{
    AccountInfo, AccountOperationRow, AccountRow, BlockRow, OperationRow, PermlinkRow,
    TransactionMultisigRow, TransactionRow,
};
pub use stage::StageTracker;
pub use store::{Connection, MemoryStore, Row, SqlValue, Store};
pub use tx_controller::{
    ControllerKind, IndependentTransactionController, SharedTransactionController,
    TransactionController, TransactionControllerPtr, TransactionHandle,
};
pub use writer::{SqlTuple, TableWriter};
