//! Bootstrap and maintenance statements.
//!
//! The schema itself (tables, views, procedures) belongs to the database
//! side; this module only knows the queries the serializer issues and the
//! procedure names it calls.

use std::path::Path;
use std::time::Instant;

use tracing::{info, warn};

use chainsink_core::error::SinkError;
use chainsink_core::escape::escape_text;
use chainsink_core::processor::{DataProcessor, ProcessingStatus};
use chainsink_core::protocol::OperationKind;
use chainsink_core::store::{execute_in_transaction, Store};
use chainsink_core::tx_controller::TransactionHandle;

pub const MAX_BLOCK_QUERY: &str =
    "SELECT hb.num AS _max_block FROM hive_blocks hb ORDER BY hb.num DESC LIMIT 1;";
pub const MAX_OPERATION_ID_QUERY: &str =
    "SELECT ho.id AS _max FROM hive_operations ho ORDER BY ho.id DESC LIMIT 1;";
pub const ACCOUNT_CACHE_QUERY: &str =
    "SELECT ai.name, ai.id, ai.operation_count FROM account_operation_count_info_view ai;";
pub const PERMLINK_CACHE_QUERY: &str = "SELECT pd.permlink, pd.id FROM hive_permlink_data pd;";

/// Tables whose indexes and constraints are dropped for a replay.
///
/// `hive_operation_types` is left alone so the type bootstrap can keep
/// relying on `ON CONFLICT DO NOTHING`.
pub const SWITCHED_TABLES: [&str; 7] = [
    "hive_blocks",
    "hive_transactions",
    "hive_transactions_multisig",
    "hive_permlink_data",
    "hive_operations",
    "hive_accounts",
    "hive_account_operations",
];

/// Groups of database objects toggled around a replay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DbItems {
    IndexesConstraints,
    ForeignKeys,
}

impl DbItems {
    /// Order in which the groups are switched: foreign keys go first on drop
    /// and last on restore.
    pub fn switch_order(create: bool) -> [DbItems; 2] {
        if create {
            [Self::IndexesConstraints, Self::ForeignKeys]
        } else {
            [Self::ForeignKeys, Self::IndexesConstraints]
        }
    }

    pub fn procedure(self, create: bool) -> &'static str {
        match (self, create) {
            (Self::IndexesConstraints, true) => "restore_indexes_constraints",
            (Self::ForeignKeys, true) => "restore_foreign_keys",
            (Self::IndexesConstraints, false) => "save_and_drop_indexes_constraints",
            (Self::ForeignKeys, false) => "save_and_drop_indexes_foreign_keys",
        }
    }

    pub fn description(self) -> &'static str {
        match self {
            Self::IndexesConstraints => "indexes/constraints",
            Self::ForeignKeys => "foreign keys",
        }
    }
}

pub fn procedure_call(procedure: &str, table: &str) -> String {
    format!("SELECT {procedure}( '{table}' );")
}

/// Insert every known operation kind into `hive_operation_types`.
pub fn operation_type_definitions() -> String {
    let tuples: Vec<String> = OperationKind::all()
        .iter()
        .map(|kind| {
            format!(
                "({},{},{})",
                kind.id(),
                escape_text(kind.name()),
                if kind.is_virtual() { "TRUE" } else { "FALSE" }
            )
        })
        .collect();

    format!(
        "INSERT INTO hive_operation_types(id, name, is_virtual) VALUES\n{}\nON CONFLICT DO NOTHING;",
        tuples.join("\n,")
    )
}

/// Outcome of running a schema script.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScriptOutcome {
    pub executed: usize,
    pub failed: usize,
}

/// Run the schema script at `path` one line at a time, each line in its own
/// transaction. A failing line is logged and skipped.
pub async fn execute_schema_script(store: &dyn Store, path: &Path) -> Result<ScriptOutcome, SinkError> {
    let script = tokio::fs::read_to_string(path).await.map_err(|e| {
        SinkError::Config(format!("cannot read schema script {}: {e}", path.display()))
    })?;

    info!(schema = %path.display(), "executing schema script");
    let mut outcome = ScriptOutcome::default();
    for line in script.lines().filter(|l| !l.trim().is_empty()) {
        match execute_in_transaction(store, line).await {
            Ok(_) => outcome.executed += 1,
            Err(e) => {
                warn!(schema = %path.display(), query = line, error = %e, "failed to execute query from schema script");
                outcome.failed += 1;
            }
        }
    }
    info!(executed = outcome.executed, failed = outcome.failed, "schema script finished");
    Ok(outcome)
}

/// Schema script (when given) followed by the operation type definitions.
pub async fn bootstrap(store: &dyn Store, path_to_schema: Option<&Path>) -> Result<ScriptOutcome, SinkError> {
    let outcome = match path_to_schema {
        Some(path) => execute_schema_script(store, path).await?,
        None => ScriptOutcome::default(),
    };
    execute_in_transaction(store, &operation_type_definitions()).await?;
    Ok(outcome)
}

/// Create (`create == true`) or save-and-drop every index, constraint and
/// foreign key of the serialized tables.
///
/// Each group is handled by one temporary processor per table, all running
/// in parallel.
pub async fn switch_db_items(store: &dyn Store, create: bool) -> Result<(), SinkError> {
    for items in DbItems::switch_order(create) {
        switch_items(store, items, create).await?;
    }
    Ok(())
}

async fn switch_items(store: &dyn Store, items: DbItems, create: bool) -> Result<(), SinkError> {
    let mode = if create { "creating" } else { "dropping" };
    info!(objects = items.description(), mode, "switching database items");

    let mut processors = Vec::with_capacity(SWITCHED_TABLES.len());
    for table in SWITCHED_TABLES {
        let query = procedure_call(items.procedure(create), table);
        let description = format!("Query processor: `{query}`");
        let processor = DataProcessor::start(description, store, move |(), tx: TransactionHandle| {
            let query = query.clone();
            async move {
                info!(query = %query, "attempting to execute query");
                let start = Instant::now();
                tx.execute(&query).await?;
                info!(
                    table,
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    "{} of {} done",
                    if create { "creation" } else { "saving and dropping" },
                    items.description()
                );
                Ok(ProcessingStatus::processed(0))
            }
        })
        .await?;
        processor.trigger(()).await?;
        processors.push(processor);
    }

    let mut failed = Vec::new();
    for mut processor in processors {
        processor.join().await?;
        if processor.processed_batches() != 1 {
            failed.push(processor.name().to_string());
        }
    }
    if !failed.is_empty() {
        return Err(SinkError::Store(format!(
            "switching {} failed for: {}",
            items.description(),
            failed.join(", ")
        )));
    }

    info!(objects = items.description(), mode, "database items switched");
    Ok(())
}
