//! Chain-side model consumed by the serializer.
//!
//! Operations, blocks and the notifications the node emits while applying
//! them. Nothing in this module talks to the store; it only describes what
//! arrives from the node and which accounts each operation touches.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Mutex;

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

/// Account names are plain strings; the empty name is the "no account" sentinel.
pub type AccountName = String;

// ─── Operation payloads ──────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteOperation {
    pub voter: AccountName,
    pub author: AccountName,
    pub permlink: String,
    pub weight: i16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommentOperation {
    pub parent_author: AccountName,
    pub parent_permlink: String,
    pub author: AccountName,
    pub permlink: String,
    pub title: String,
    pub body: String,
    pub json_metadata: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferOperation {
    pub from: AccountName,
    pub to: AccountName,
    pub amount: String,
    pub memo: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferToVestingOperation {
    pub from: AccountName,
    /// Empty when vesting to `from` itself.
    pub to: AccountName,
    pub amount: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountCreateOperation {
    pub fee: String,
    pub creator: AccountName,
    pub new_account_name: AccountName,
    pub json_metadata: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountUpdateOperation {
    pub account: AccountName,
    pub json_metadata: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PowOperation {
    pub worker_account: AccountName,
    pub block_id: String,
    pub nonce: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomJsonOperation {
    pub required_auths: Vec<AccountName>,
    pub required_posting_auths: Vec<AccountName>,
    pub id: String,
    pub json: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimAccountOperation {
    pub creator: AccountName,
    pub fee: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateClaimedAccountOperation {
    pub creator: AccountName,
    pub new_account_name: AccountName,
    pub json_metadata: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pow2Operation {
    pub worker_account: AccountName,
    pub prev_block: String,
    pub nonce: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteCommentOperation {
    pub author: AccountName,
    pub permlink: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountCreateWithDelegationOperation {
    pub fee: String,
    pub delegation: String,
    pub creator: AccountName,
    pub new_account_name: AccountName,
    pub json_metadata: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthorRewardOperation {
    pub author: AccountName,
    pub permlink: String,
    pub hbd_payout: String,
    pub hive_payout: String,
    pub vesting_payout: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CurationRewardOperation {
    pub curator: AccountName,
    pub reward: String,
    pub comment_author: AccountName,
    pub comment_permlink: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FillVestingWithdrawOperation {
    pub from_account: AccountName,
    pub to_account: AccountName,
    pub withdrawn: String,
    pub deposited: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HardforkOperation {
    pub hardfork_id: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProducerRewardOperation {
    pub producer: AccountName,
    pub vesting_shares: String,
}

// ─── Operation ───────────────────────────────────────────────────────────────

/// Every operation kind the serializer understands.
///
/// Serialized the way the node renders operations in JSON:
/// `{"type": "transfer_operation", "value": {...}}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value")]
pub enum Operation {
    #[serde(rename = "vote_operation")]
    Vote(VoteOperation),
    #[serde(rename = "comment_operation")]
    Comment(CommentOperation),
    #[serde(rename = "transfer_operation")]
    Transfer(TransferOperation),
    #[serde(rename = "transfer_to_vesting_operation")]
    TransferToVesting(TransferToVestingOperation),
    #[serde(rename = "account_create_operation")]
    AccountCreate(AccountCreateOperation),
    #[serde(rename = "account_update_operation")]
    AccountUpdate(AccountUpdateOperation),
    #[serde(rename = "pow_operation")]
    Pow(PowOperation),
    #[serde(rename = "delete_comment_operation")]
    DeleteComment(DeleteCommentOperation),
    #[serde(rename = "custom_json_operation")]
    CustomJson(CustomJsonOperation),
    #[serde(rename = "claim_account_operation")]
    ClaimAccount(ClaimAccountOperation),
    #[serde(rename = "create_claimed_account_operation")]
    CreateClaimedAccount(CreateClaimedAccountOperation),
    #[serde(rename = "pow2_operation")]
    Pow2(Pow2Operation),
    #[serde(rename = "account_create_with_delegation_operation")]
    AccountCreateWithDelegation(AccountCreateWithDelegationOperation),
    #[serde(rename = "author_reward_operation")]
    AuthorReward(AuthorRewardOperation),
    #[serde(rename = "curation_reward_operation")]
    CurationReward(CurationRewardOperation),
    #[serde(rename = "fill_vesting_withdraw_operation")]
    FillVestingWithdraw(FillVestingWithdrawOperation),
    #[serde(rename = "hardfork_operation")]
    Hardfork(HardforkOperation),
    #[serde(rename = "producer_reward_operation")]
    ProducerReward(ProducerRewardOperation),
}

/// Field-less tag of an [`Operation`], carrying the node's numbering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperationKind {
    Vote,
    Comment,
    Transfer,
    TransferToVesting,
    AccountCreate,
    AccountUpdate,
    Pow,
    DeleteComment,
    CustomJson,
    ClaimAccount,
    CreateClaimedAccount,
    Pow2,
    AccountCreateWithDelegation,
    AuthorReward,
    CurationReward,
    FillVestingWithdraw,
    Hardfork,
    ProducerReward,
}

impl OperationKind {
    /// All kinds in type-id order.
    pub fn all() -> &'static [OperationKind] {
        use OperationKind::*;
        &[
            Vote,
            Comment,
            Transfer,
            TransferToVesting,
            AccountCreate,
            AccountUpdate,
            Pow,
            DeleteComment,
            CustomJson,
            ClaimAccount,
            CreateClaimedAccount,
            Pow2,
            AccountCreateWithDelegation,
            AuthorReward,
            CurationReward,
            FillVestingWithdraw,
            Hardfork,
            ProducerReward,
        ]
    }

    /// Numeric type id as used by the node (`operation::which()`).
    pub fn id(self) -> i32 {
        match self {
            Self::Vote => 0,
            Self::Comment => 1,
            Self::Transfer => 2,
            Self::TransferToVesting => 3,
            Self::AccountCreate => 9,
            Self::AccountUpdate => 10,
            Self::Pow => 14,
            Self::DeleteComment => 17,
            Self::CustomJson => 18,
            Self::ClaimAccount => 22,
            Self::CreateClaimedAccount => 23,
            Self::Pow2 => 30,
            Self::AccountCreateWithDelegation => 41,
            Self::AuthorReward => 51,
            Self::CurationReward => 52,
            Self::FillVestingWithdraw => 56,
            Self::Hardfork => 60,
            Self::ProducerReward => 64,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Vote => "vote_operation",
            Self::Comment => "comment_operation",
            Self::Transfer => "transfer_operation",
            Self::TransferToVesting => "transfer_to_vesting_operation",
            Self::AccountCreate => "account_create_operation",
            Self::AccountUpdate => "account_update_operation",
            Self::Pow => "pow_operation",
            Self::DeleteComment => "delete_comment_operation",
            Self::CustomJson => "custom_json_operation",
            Self::ClaimAccount => "claim_account_operation",
            Self::CreateClaimedAccount => "create_claimed_account_operation",
            Self::Pow2 => "pow2_operation",
            Self::AccountCreateWithDelegation => "account_create_with_delegation_operation",
            Self::AuthorReward => "author_reward_operation",
            Self::CurationReward => "curation_reward_operation",
            Self::FillVestingWithdraw => "fill_vesting_withdraw_operation",
            Self::Hardfork => "hardfork_operation",
            Self::ProducerReward => "producer_reward_operation",
        }
    }

    /// Virtual operations are produced by the node itself, never signed by users.
    pub fn is_virtual(self) -> bool {
        matches!(
            self,
            Self::AuthorReward
                | Self::CurationReward
                | Self::FillVestingWithdraw
                | Self::Hardfork
                | Self::ProducerReward
        )
    }
}

impl Operation {
    pub fn kind(&self) -> OperationKind {
        match self {
            Self::Vote(_) => OperationKind::Vote,
            Self::Comment(_) => OperationKind::Comment,
            Self::Transfer(_) => OperationKind::Transfer,
            Self::TransferToVesting(_) => OperationKind::TransferToVesting,
            Self::AccountCreate(_) => OperationKind::AccountCreate,
            Self::AccountUpdate(_) => OperationKind::AccountUpdate,
            Self::Pow(_) => OperationKind::Pow,
            Self::DeleteComment(_) => OperationKind::DeleteComment,
            Self::CustomJson(_) => OperationKind::CustomJson,
            Self::ClaimAccount(_) => OperationKind::ClaimAccount,
            Self::CreateClaimedAccount(_) => OperationKind::CreateClaimedAccount,
            Self::Pow2(_) => OperationKind::Pow2,
            Self::AccountCreateWithDelegation(_) => OperationKind::AccountCreateWithDelegation,
            Self::AuthorReward(_) => OperationKind::AuthorReward,
            Self::CurationReward(_) => OperationKind::CurationReward,
            Self::FillVestingWithdraw(_) => OperationKind::FillVestingWithdraw,
            Self::Hardfork(_) => OperationKind::Hardfork,
            Self::ProducerReward(_) => OperationKind::ProducerReward,
        }
    }

    pub fn type_id(&self) -> i32 {
        self.kind().id()
    }

    pub fn name(&self) -> &'static str {
        self.kind().name()
    }

    pub fn is_virtual(&self) -> bool {
        self.kind().is_virtual()
    }

    /// Accounts touched by this operation, sorted and de-duplicated.
    ///
    /// May contain the empty sentinel name (e.g. a self-vesting transfer);
    /// callers that link accounts must drop it.
    pub fn impacted_accounts(&self) -> BTreeSet<AccountName> {
        let mut out = BTreeSet::new();
        let mut add = |name: &AccountName| {
            out.insert(name.clone());
        };
        match self {
            Self::Vote(op) => {
                add(&op.voter);
                add(&op.author);
            }
            Self::Comment(op) => {
                add(&op.author);
                add(&op.parent_author);
            }
            Self::Transfer(op) => {
                add(&op.from);
                add(&op.to);
            }
            Self::TransferToVesting(op) => {
                add(&op.from);
                add(&op.to);
            }
            Self::AccountCreate(op) => {
                add(&op.new_account_name);
                add(&op.creator);
            }
            Self::AccountUpdate(op) => add(&op.account),
            Self::Pow(op) => add(&op.worker_account),
            Self::DeleteComment(op) => add(&op.author),
            Self::CustomJson(op) => {
                op.required_auths.iter().for_each(&mut add);
                op.required_posting_auths.iter().for_each(&mut add);
            }
            Self::ClaimAccount(op) => add(&op.creator),
            Self::CreateClaimedAccount(op) => {
                add(&op.new_account_name);
                add(&op.creator);
            }
            Self::Pow2(op) => add(&op.worker_account),
            Self::AccountCreateWithDelegation(op) => {
                add(&op.new_account_name);
                add(&op.creator);
            }
            Self::AuthorReward(op) => add(&op.author),
            Self::CurationReward(op) => add(&op.curator),
            Self::FillVestingWithdraw(op) => {
                add(&op.from_account);
                add(&op.to_account);
            }
            Self::Hardfork(_) => {}
            Self::ProducerReward(op) => add(&op.producer),
        }
        out
    }
}

// ─── Blocks and notifications ────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedTransaction {
    /// Transaction id (ripemd160 digest).
    pub id: Vec<u8>,
    pub ref_block_num: u16,
    pub ref_block_prefix: u32,
    pub expiration: NaiveDateTime,
    pub operations: Vec<Operation>,
    /// Compact signatures, in signing order.
    pub signatures: Vec<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedBlock {
    pub timestamp: NaiveDateTime,
    pub witness: AccountName,
    pub transactions: Vec<SignedTransaction>,
}

/// Emitted once per applied block, after all of its operations.
#[derive(Debug, Clone)]
pub struct BlockNotification {
    pub block_num: u32,
    pub block_id: Vec<u8>,
    pub prev_block_id: Vec<u8>,
    pub block: SignedBlock,
}

/// Emitted before each operation (real or virtual) is applied.
#[derive(Debug, Clone)]
pub struct OperationNotification {
    pub op: Operation,
    pub block: u32,
    /// Position of the owning transaction; negative for block-level virtual ops.
    pub trx_in_block: i64,
    pub op_in_trx: i64,
}

/// Emitted before and after a replay of the block log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReindexNotification {
    /// Replay starts from genesis; the database is treated as fresh.
    pub force_replay: bool,
    pub max_block_number: u32,
    pub last_block_number: u32,
}

// ─── ChainState ──────────────────────────────────────────────────────────────

/// Read-only view of the node's chain state the serializer needs.
pub trait ChainState: Send + Sync {
    fn last_irreversible_block_num(&self) -> u32;

    /// `true` while the node is producing a block of its own; operations
    /// seen in that window belong to pending transactions.
    fn is_producing(&self) -> bool;

    /// Names of all accounts in the chain state, in account-id order.
    fn accounts(&self) -> Vec<AccountName>;
}

/// Settable in-memory chain state for tests and offline tooling.
#[derive(Default)]
pub struct StaticChainState {
    last_irreversible: AtomicU32,
    producing: AtomicBool,
    accounts: Mutex<Vec<AccountName>>,
}

impl StaticChainState {
    pub fn new(accounts: Vec<AccountName>) -> Self {
        Self {
            accounts: Mutex::new(accounts),
            ..Default::default()
        }
    }

    pub fn set_last_irreversible(&self, block_num: u32) {
        self.last_irreversible.store(block_num, Ordering::SeqCst);
    }

    pub fn set_producing(&self, producing: bool) {
        self.producing.store(producing, Ordering::SeqCst);
    }
}

impl ChainState for StaticChainState {
    fn last_irreversible_block_num(&self) -> u32 {
        self.last_irreversible.load(Ordering::SeqCst)
    }

    fn is_producing(&self) -> bool {
        self.producing.load(Ordering::SeqCst)
    }

    fn accounts(&self) -> Vec<AccountName> {
        self.accounts
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn operation_json_uses_node_layout() {
        let op = Operation::Transfer(TransferOperation {
            from: "alice".into(),
            to: "bob".into(),
            amount: "1.000 HIVE".into(),
            memo: String::new(),
        });
        let json = serde_json::to_value(&op).unwrap();
        assert_eq!(json["type"], "transfer_operation");
        assert_eq!(json["value"]["to"], "bob");
        assert_eq!(op.name(), "transfer_operation");
    }

    #[test]
    fn kind_names_match_serde_tags() {
        let op = Operation::ProducerReward(ProducerRewardOperation {
            producer: "initminer".into(),
            vesting_shares: "1.000000 VESTS".into(),
        });
        let json = serde_json::to_value(&op).unwrap();
        assert_eq!(json["type"], op.kind().name());
        assert!(op.is_virtual());
        assert_eq!(op.type_id(), 64);
    }

    #[test]
    fn type_ids_are_unique_and_sorted() {
        let ids: Vec<i32> = OperationKind::all().iter().map(|k| k.id()).collect();
        let mut sorted = ids.clone();
        sorted.sort_unstable();
        sorted.dedup();
        assert_eq!(ids, sorted);
    }

    #[test]
    fn impacted_accounts_are_sorted_and_deduplicated() {
        let op = Operation::CustomJson(CustomJsonOperation {
            required_auths: vec!["carol".into()],
            required_posting_auths: vec!["alice".into(), "carol".into()],
            id: "follow".into(),
            json: "[]".into(),
        });
        let impacted: Vec<_> = op.impacted_accounts().into_iter().collect();
        assert_eq!(impacted, vec!["alice".to_string(), "carol".to_string()]);
    }

    #[test]
    fn root_comment_impacts_empty_parent() {
        let op = Operation::Comment(CommentOperation {
            parent_author: String::new(),
            parent_permlink: "hive".into(),
            author: "alice".into(),
            permlink: "hello".into(),
            title: "Hello".into(),
            body: "world".into(),
            json_metadata: "{}".into(),
        });
        assert!(op.impacted_accounts().contains(""));
    }

    #[test]
    fn static_chain_state_is_settable() {
        let chain = StaticChainState::new(vec!["initminer".into()]);
        chain.set_last_irreversible(42);
        chain.set_producing(true);
        assert_eq!(chain.last_irreversible_block_num(), 42);
        assert!(chain.is_producing());
        assert_eq!(chain.accounts(), vec!["initminer".to_string()]);
    }
}
