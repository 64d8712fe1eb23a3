//! Cold-start loading of persisted state.
//!
//! Four loaders run in parallel, each on its own connection: the highest
//! persisted block, the highest operation id, the account cache and the
//! permlink cache.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tracing::info;

use chainsink_core::error::SinkError;
use chainsink_core::processor::{DataProcessor, ProcessingStatus};
use chainsink_core::records::AccountInfo;
use chainsink_core::store::{Row, Store};
use chainsink_core::tx_controller::TransactionHandle;

use crate::schema::{ACCOUNT_CACHE_QUERY, MAX_BLOCK_QUERY, MAX_OPERATION_ID_QUERY, PERMLINK_CACHE_QUERY};

/// Everything the coordinator seeds itself with before the first event.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InitialDbData {
    /// Highest persisted block; 0 for an empty database.
    pub psql_block_number: u32,
    /// Highest persisted operation id; 0 for an empty database.
    pub max_operation_id: i64,
    pub accounts: HashMap<String, AccountInfo>,
    pub permlinks: HashMap<String, i32>,
}

/// Run the four loaders in parallel and collect their results.
pub async fn load_initial_db_data(store: &dyn Store) -> Result<InitialDbData, SinkError> {
    info!("loading operation's last id and account/permlink caches");

    let block_loader = Loader::start(store, "Block loader", MAX_BLOCK_QUERY, parse_max_block).await?;
    let sequence_loader =
        Loader::start(store, "Sequence loader", MAX_OPERATION_ID_QUERY, parse_max_operation_id).await?;
    let account_loader =
        Loader::start(store, "Account cache loader", ACCOUNT_CACHE_QUERY, parse_accounts).await?;
    let permlink_loader =
        Loader::start(store, "Permlink cache loader", PERMLINK_CACHE_QUERY, parse_permlinks).await?;

    let (accounts, permlinks, max_operation_id, psql_block_number) = tokio::try_join!(
        account_loader.finish(),
        permlink_loader.finish(),
        sequence_loader.finish(),
        block_loader.finish(),
    )?;

    info!(
        accounts = accounts.len(),
        permlinks = permlinks.len(),
        "loaded cached accounts and permlink data"
    );
    Ok(InitialDbData {
        psql_block_number,
        max_operation_id,
        accounts,
        permlinks,
    })
}

struct Loader<T> {
    name: &'static str,
    processor: DataProcessor<()>,
    slot: Arc<Mutex<Option<T>>>,
}

impl<T: Send + 'static> Loader<T> {
    async fn start(
        store: &dyn Store,
        name: &'static str,
        query: &'static str,
        parse: fn(Vec<Row>) -> Result<T, SinkError>,
    ) -> Result<Self, SinkError> {
        let slot = Arc::new(Mutex::new(None));
        let out = Arc::clone(&slot);

        let processor = DataProcessor::start(name, store, move |(), tx: TransactionHandle| {
            let out = Arc::clone(&out);
            async move {
                let rows = tx.fetch(query).await?;
                let count = rows.len() as u64;
                let value = parse(rows)?;
                *out.lock().unwrap_or_else(|p| p.into_inner()) = Some(value);
                Ok(ProcessingStatus::processed(count))
            }
        })
        .await?;
        processor.trigger(()).await?;

        Ok(Self {
            name,
            processor,
            slot,
        })
    }

    async fn finish(mut self) -> Result<T, SinkError> {
        self.processor.join().await?;
        let value = self.slot.lock().unwrap_or_else(|p| p.into_inner()).take();
        value.ok_or_else(|| SinkError::Store(format!("{} failed; see the log for the cause", self.name)))
    }
}

fn single_value(rows: &[Row], column: &str) -> Result<Option<i64>, SinkError> {
    match rows {
        [] => Ok(None),
        [row] => row.get_i64(column).map(Some),
        _ => Err(SinkError::Consistency(format!(
            "expected at most one row for `{column}`, got {}",
            rows.len()
        ))),
    }
}

fn parse_max_block(rows: Vec<Row>) -> Result<u32, SinkError> {
    let max = single_value(&rows, "_max_block")?.unwrap_or(0);
    u32::try_from(max).map_err(|_| SinkError::Consistency(format!("invalid block number {max}")))
}

fn parse_max_operation_id(rows: Vec<Row>) -> Result<i64, SinkError> {
    Ok(single_value(&rows, "_max")?.unwrap_or(0))
}

fn parse_accounts(rows: Vec<Row>) -> Result<HashMap<String, AccountInfo>, SinkError> {
    rows.iter()
        .map(|row| {
            let id = i32::try_from(row.get_i64("id")?)
                .map_err(|e| SinkError::Consistency(format!("account id out of range: {e}")))?;
            let count = u32::try_from(row.get_i64("operation_count")?)
                .map_err(|e| SinkError::Consistency(format!("operation count out of range: {e}")))?;
            Ok((row.get_str("name")?.to_string(), AccountInfo::new(id, count)))
        })
        .collect()
}

fn parse_permlinks(rows: Vec<Row>) -> Result<HashMap<String, i32>, SinkError> {
    rows.iter()
        .map(|row| {
            let id = i32::try_from(row.get_i64("id")?)
                .map_err(|e| SinkError::Consistency(format!("permlink id out of range: {e}")))?;
            Ok((row.get_str("permlink")?.to_string(), id))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chainsink_core::store::MemoryStore;

    #[tokio::test]
    async fn empty_database_loads_zeroes() {
        let store = MemoryStore::new();
        let data = load_initial_db_data(&store).await.unwrap();
        assert_eq!(data, InitialDbData::default());
        assert_eq!(store.open_connections(), 0);
    }

    #[tokio::test]
    async fn loads_persisted_state() {
        let store = MemoryStore::new();
        store.respond("FROM hive_blocks", vec![Row::new().with("_max_block", 1200i64)]);
        store.respond("FROM hive_operations", vec![Row::new().with("_max", 9001i64)]);
        store.respond(
            "account_operation_count_info_view",
            vec![
                Row::new().with("name", "initminer").with("id", 1).with("operation_count", 40),
                Row::new().with("name", "alice").with("id", 5).with("operation_count", 2),
            ],
        );
        store.respond(
            "FROM hive_permlink_data",
            vec![Row::new().with("permlink", "hello").with("id", 3)],
        );

        let data = load_initial_db_data(&store).await.unwrap();
        assert_eq!(data.psql_block_number, 1200);
        assert_eq!(data.max_operation_id, 9001);
        assert_eq!(data.accounts["alice"], AccountInfo::new(5, 2));
        assert_eq!(data.permlinks["hello"], 3);
    }

    #[tokio::test]
    async fn failing_loader_fails_cold_start() {
        let store = MemoryStore::new();
        store.fail_on("account_operation_count_info_view");
        let err = load_initial_db_data(&store).await.unwrap_err();
        assert!(err.to_string().contains("Account cache loader"));
    }
}
