//! Transaction-controller strategies.
//!
//! Workers never begin or commit transactions themselves; they ask their
//! current [`TransactionController`] for a handle and give it back when the
//! flush is done. Two strategies exist:
//!
//! - [`SharedTransactionController`]: every worker writes into one
//!   transaction on one connection; committing is left to the owner
//!   (live sync: a whole block commits atomically across all tables).
//! - [`IndependentTransactionController`]: one connection per worker and a
//!   fresh transaction per flush, committed immediately (reindex).

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::SinkError;
use crate::store::{
    begin_transaction, Connection, Store, COMMIT_STATEMENT, ROLLBACK_STATEMENT,
};

type SharedConnection = Arc<Mutex<Box<dyn Connection>>>;

/// Handle to an open transaction, passed to flush functions.
///
/// Cloning is cheap; all clones address the same connection.
#[derive(Clone)]
pub struct TransactionHandle {
    conn: SharedConnection,
}

impl TransactionHandle {
    fn new(conn: SharedConnection) -> Self {
        Self { conn }
    }

    pub async fn execute(&self, sql: &str) -> Result<u64, SinkError> {
        self.conn.lock().await.execute(sql).await
    }

    pub async fn fetch(&self, sql: &str) -> Result<Vec<crate::store::Row>, SinkError> {
        self.conn.lock().await.fetch(sql).await
    }
}

/// Which strategy a controller implements.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerKind {
    Shared,
    Independent,
}

impl std::fmt::Display for ControllerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Shared => write!(f, "shared"),
            Self::Independent => write!(f, "independent"),
        }
    }
}

/// Transaction scoping policy used by a data processor.
#[async_trait]
pub trait TransactionController: Send + Sync {
    async fn open(&self) -> Result<TransactionHandle, SinkError>;

    async fn commit(&self, tx: TransactionHandle) -> Result<(), SinkError>;

    async fn abort(&self, tx: TransactionHandle) -> Result<(), SinkError>;

    async fn disconnect(&self) -> Result<(), SinkError>;

    fn kind(&self) -> ControllerKind;
}

pub type TransactionControllerPtr = Arc<dyn TransactionController>;

// ─── Independent ─────────────────────────────────────────────────────────────

/// One connection, one transaction per `open()`, committed right away.
pub struct IndependentTransactionController {
    description: String,
    conn: SharedConnection,
}

impl IndependentTransactionController {
    pub async fn connect(
        store: &dyn Store,
        description: impl Into<String>,
    ) -> Result<Self, SinkError> {
        let conn = store.connect().await?;
        Ok(Self {
            description: description.into(),
            conn: Arc::new(Mutex::new(conn)),
        })
    }
}

#[async_trait]
impl TransactionController for IndependentTransactionController {
    async fn open(&self) -> Result<TransactionHandle, SinkError> {
        let mut conn = self.conn.lock().await;
        begin_transaction(&mut **conn).await?;
        Ok(TransactionHandle::new(Arc::clone(&self.conn)))
    }

    async fn commit(&self, tx: TransactionHandle) -> Result<(), SinkError> {
        tx.execute(COMMIT_STATEMENT).await?;
        Ok(())
    }

    async fn abort(&self, tx: TransactionHandle) -> Result<(), SinkError> {
        tx.execute(ROLLBACK_STATEMENT).await?;
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), SinkError> {
        debug!(controller = %self.description, "closing independent connection");
        self.conn.lock().await.close().await
    }

    fn kind(&self) -> ControllerKind {
        ControllerKind::Independent
    }
}

// ─── Shared ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SharedState {
    Idle,
    Active,
    Aborted,
}

/// One connection and one transaction shared by every registered worker.
///
/// The transaction is opened lazily by the first worker that needs it and
/// stays open until the owner calls [`commit_pending`](Self::commit_pending).
/// Once any worker aborts, the controller refuses further work: the writes of
/// the other workers in the same block are gone with the rollback.
pub struct SharedTransactionController {
    conn: SharedConnection,
    state: Mutex<SharedState>,
}

impl SharedTransactionController {
    pub async fn connect(store: &dyn Store) -> Result<Self, SinkError> {
        let conn = store.connect().await?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            state: Mutex::new(SharedState::Idle),
        })
    }

    /// Commit the shared transaction if one is open.
    ///
    /// Returns `true` if a transaction was committed.
    pub async fn commit_pending(&self) -> Result<bool, SinkError> {
        let mut state = self.state.lock().await;
        match *state {
            SharedState::Idle => Ok(false),
            SharedState::Active => {
                self.conn.lock().await.execute(COMMIT_STATEMENT).await?;
                *state = SharedState::Idle;
                Ok(true)
            }
            SharedState::Aborted => Err(SinkError::Store(
                "shared transaction was aborted by a failing writer".into(),
            )),
        }
    }
}

#[async_trait]
impl TransactionController for SharedTransactionController {
    async fn open(&self) -> Result<TransactionHandle, SinkError> {
        let mut state = self.state.lock().await;
        match *state {
            SharedState::Idle => {
                let mut conn = self.conn.lock().await;
                begin_transaction(&mut **conn).await?;
                *state = SharedState::Active;
            }
            SharedState::Active => {}
            SharedState::Aborted => {
                return Err(SinkError::Store(
                    "shared transaction was aborted by a failing writer".into(),
                ))
            }
        }
        Ok(TransactionHandle::new(Arc::clone(&self.conn)))
    }

    /// Deferred: the owner commits the whole block via `commit_pending`.
    async fn commit(&self, _tx: TransactionHandle) -> Result<(), SinkError> {
        Ok(())
    }

    async fn abort(&self, _tx: TransactionHandle) -> Result<(), SinkError> {
        let mut state = self.state.lock().await;
        if *state == SharedState::Active {
            warn!("rolling back shared transaction");
            self.conn.lock().await.execute(ROLLBACK_STATEMENT).await?;
        }
        *state = SharedState::Aborted;
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), SinkError> {
        let mut state = self.state.lock().await;
        let mut conn = self.conn.lock().await;
        if *state == SharedState::Active {
            warn!("disconnecting shared transaction with uncommitted writes");
            conn.execute(ROLLBACK_STATEMENT).await?;
            *state = SharedState::Idle;
        }
        info!("shared transaction connection closed");
        conn.close().await
    }

    fn kind(&self) -> ControllerKind {
        ControllerKind::Shared
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    const INSERT: &str = "INSERT INTO hive_blocks(num) VALUES\n(1)\n;";

    #[tokio::test]
    async fn independent_commits_each_flush() {
        let store = MemoryStore::new();
        let ctl = IndependentTransactionController::connect(&store, "test").await.unwrap();

        let tx = ctl.open().await.unwrap();
        tx.execute(INSERT).await.unwrap();
        ctl.commit(tx).await.unwrap();
        assert_eq!(store.committed_rows("hive_blocks"), 1);

        let tx = ctl.open().await.unwrap();
        tx.execute(INSERT).await.unwrap();
        ctl.abort(tx).await.unwrap();
        assert_eq!(store.committed_rows("hive_blocks"), 1);

        ctl.disconnect().await.unwrap();
        assert_eq!(store.open_connections(), 0);
        assert_eq!(ctl.kind(), ControllerKind::Independent);
    }

    #[tokio::test]
    async fn shared_defers_commit_to_owner() {
        let store = MemoryStore::new();
        let ctl = SharedTransactionController::connect(&store).await.unwrap();

        let a = ctl.open().await.unwrap();
        let b = ctl.open().await.unwrap();
        a.execute(INSERT).await.unwrap();
        b.execute(INSERT).await.unwrap();
        ctl.commit(a).await.unwrap();
        ctl.commit(b).await.unwrap();
        assert_eq!(store.committed_rows("hive_blocks"), 0);

        assert!(ctl.commit_pending().await.unwrap());
        assert_eq!(store.committed_rows("hive_blocks"), 2);
        assert_eq!(store.commits(), 1);
        assert!(!ctl.commit_pending().await.unwrap());
    }

    #[tokio::test]
    async fn shared_abort_poisons_controller() {
        let store = MemoryStore::new();
        let ctl = SharedTransactionController::connect(&store).await.unwrap();

        let tx = ctl.open().await.unwrap();
        tx.execute(INSERT).await.unwrap();
        ctl.abort(tx).await.unwrap();

        assert!(ctl.open().await.is_err());
        assert!(ctl.commit_pending().await.is_err());
        assert_eq!(store.committed_rows("hive_blocks"), 0);
    }

    #[tokio::test]
    async fn shared_disconnect_rolls_back_open_transaction() {
        let store = MemoryStore::new();
        let ctl = SharedTransactionController::connect(&store).await.unwrap();
        let tx = ctl.open().await.unwrap();
        tx.execute(INSERT).await.unwrap();

        ctl.disconnect().await.unwrap();
        assert_eq!(store.rollbacks(), 1);
        assert_eq!(store.open_connections(), 0);
    }
}
