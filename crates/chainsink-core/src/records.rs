//! Rows buffered between the coordinator and the table writers.
//!
//! One struct per destination table. Each implements [`SqlTuple`] so a batch
//! of them can be rendered into a single bulk insert.

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

use crate::error::SinkError;
use crate::escape::{escape_binary, escape_optional_binary, escape_text, escape_timestamp};
use crate::protocol::Operation;
use crate::writer::SqlTuple;

/// Runtime bookkeeping for a cached account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AccountInfo {
    pub id: i32,
    /// Number of account-operation links written so far.
    pub operation_count: u32,
}

impl AccountInfo {
    pub fn new(id: i32, operation_count: u32) -> Self {
        Self { id, operation_count }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountRow {
    pub id: i32,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermlinkRow {
    pub id: i32,
    pub permlink: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockRow {
    pub number: u32,
    pub hash: Vec<u8>,
    pub prev_hash: Vec<u8>,
    pub created_at: NaiveDateTime,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionRow {
    pub block_number: u32,
    pub hash: Vec<u8>,
    pub trx_in_block: u32,
    pub ref_block_num: u16,
    pub ref_block_prefix: u32,
    pub expiration: NaiveDateTime,
    /// First signature; `None` for unsigned transactions.
    pub signature: Option<Vec<u8>>,
}

/// A signature beyond the first one of a transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionMultisigRow {
    pub trx_hash: Vec<u8>,
    pub signature: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationRow {
    /// Global, gapless, 1-based sequence id.
    pub operation_id: i64,
    pub block_number: u32,
    pub trx_in_block: i64,
    pub op_pos: i64,
    pub op_type_id: i32,
    /// Operation rendered as node-layout JSON.
    pub body: String,
}

impl OperationRow {
    pub fn new(
        operation_id: i64,
        block_number: u32,
        trx_in_block: i64,
        op_pos: i64,
        op: &Operation,
    ) -> Result<Self, SinkError> {
        Ok(Self {
            operation_id,
            block_number,
            trx_in_block,
            op_pos,
            op_type_id: op.type_id(),
            body: serde_json::to_string(op)?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountOperationRow {
    pub operation_id: i64,
    pub account_id: i32,
    /// The account's link counter before this link was added.
    pub account_op_seq_no: u32,
}

// ─── Tuple conversion ────────────────────────────────────────────────────────

impl SqlTuple for AccountRow {
    const TABLE: &'static str = "hive_accounts";
    const COLUMNS: &'static str = "id, name";

    fn to_sql_tuple(&self) -> String {
        format!("{},{}", self.id, escape_text(&self.name))
    }
}

impl SqlTuple for PermlinkRow {
    const TABLE: &'static str = "hive_permlink_data";
    const COLUMNS: &'static str = "id, permlink";

    fn to_sql_tuple(&self) -> String {
        format!("{},{}", self.id, escape_text(&self.permlink))
    }
}

impl SqlTuple for BlockRow {
    const TABLE: &'static str = "hive_blocks";
    const COLUMNS: &'static str = "num, hash, prev, created_at";

    fn to_sql_tuple(&self) -> String {
        format!(
            "{},{},{},{}",
            self.number,
            escape_binary(&self.hash),
            escape_binary(&self.prev_hash),
            escape_timestamp(&self.created_at)
        )
    }
}

impl SqlTuple for TransactionRow {
    const TABLE: &'static str = "hive_transactions";
    const COLUMNS: &'static str =
        "block_num, trx_hash, trx_in_block, ref_block_num, ref_block_prefix, expiration, signature";

    fn to_sql_tuple(&self) -> String {
        format!(
            "{},{},{},{},{},{},{}",
            self.block_number,
            escape_binary(&self.hash),
            self.trx_in_block,
            self.ref_block_num,
            self.ref_block_prefix,
            escape_timestamp(&self.expiration),
            escape_optional_binary(self.signature.as_deref())
        )
    }
}

impl SqlTuple for TransactionMultisigRow {
    const TABLE: &'static str = "hive_transactions_multisig";
    const COLUMNS: &'static str = "trx_hash, signature";

    fn to_sql_tuple(&self) -> String {
        format!(
            "{},{}",
            escape_binary(&self.trx_hash),
            escape_binary(&self.signature)
        )
    }
}

impl SqlTuple for OperationRow {
    const TABLE: &'static str = "hive_operations";
    const COLUMNS: &'static str = "id, block_num, trx_in_block, op_pos, op_type_id, body";

    fn to_sql_tuple(&self) -> String {
        format!(
            "{},{},{},{},{},{}",
            self.operation_id,
            self.block_number,
            self.trx_in_block,
            self.op_pos,
            self.op_type_id,
            escape_text(&self.body)
        )
    }
}

impl SqlTuple for AccountOperationRow {
    const TABLE: &'static str = "hive_account_operations";
    const COLUMNS: &'static str = "operation_id, account_id, account_op_seq_no";

    fn to_sql_tuple(&self) -> String {
        format!(
            "{},{},{}",
            self.operation_id, self.account_id, self.account_op_seq_no
        )
    }
}
