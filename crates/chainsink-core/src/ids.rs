//! Identifier allocation for accounts and permlinks.
//!
//! For each operation the coordinator first calls [`collect_new_ids`], which
//! assigns ids to the accounts and permlinks the operation introduces, and
//! then [`collect_impacted_accounts`], which links the operation to every
//! account it touches. The order matters: an operation creating an account
//! usually also lists that account as impacted.

use tracing::{debug, info};

use crate::cache::RecordCache;
use crate::error::SinkError;
use crate::protocol::{AccountName, Operation};
use crate::records::{AccountInfo, AccountOperationRow, AccountRow, PermlinkRow};

/// Names an operation introduces.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Discovery {
    pub accounts: Vec<AccountName>,
    pub permlinks: Vec<String>,
}

impl Discovery {
    pub fn is_empty(&self) -> bool {
        self.accounts.is_empty() && self.permlinks.is_empty()
    }
}

/// Account names and permlinks introduced by `op`.
///
/// Proof-of-work workers may submit repeatedly, so their account only counts
/// as new while it is not cached yet.
pub fn discover(cache: &RecordCache, op: &Operation) -> Discovery {
    let mut found = Discovery::default();
    match op {
        Operation::AccountCreate(op) => found.accounts.push(op.new_account_name.clone()),
        Operation::AccountCreateWithDelegation(op) => {
            found.accounts.push(op.new_account_name.clone())
        }
        Operation::CreateClaimedAccount(op) => found.accounts.push(op.new_account_name.clone()),
        Operation::Pow(op) => {
            if !cache.accounts.contains_key(&op.worker_account) {
                found.accounts.push(op.worker_account.clone());
            }
        }
        Operation::Pow2(op) => {
            if !cache.accounts.contains_key(&op.worker_account) {
                found.accounts.push(op.worker_account.clone());
            }
        }
        Operation::Comment(op) => found.permlinks.push(op.permlink.clone()),
        _ => {}
    }
    found
}

/// Allocate ids for everything `op` introduces and buffer the new rows.
pub fn collect_new_ids(cache: &mut RecordCache, op: &Operation) -> Result<(), SinkError> {
    let found = discover(cache, op);

    for name in found.accounts {
        if cache.accounts.contains_key(&name) {
            return Err(SinkError::DuplicateAccount {
                account: name,
                operation: op.name().to_string(),
            });
        }
        let id = allocate_account(cache, name);
        debug!(account_id = id, operation = op.name(), "new account");
    }

    for permlink in found.permlinks {
        // Editing a post reuses its permlink.
        if cache.permlinks.contains_key(&permlink) {
            continue;
        }
        let id = cache.next_permlink_id;
        cache.next_permlink_id += 1;
        cache.total_size += permlink.len() + std::mem::size_of::<i32>();
        cache.permlinks.insert(permlink.clone(), id);
        cache.batches.permlinks.push(PermlinkRow { id, permlink });
    }

    Ok(())
}

/// Link `operation_id` to every account `op` touches.
///
/// The sequence number of each link is the account's counter before the
/// link, so per-account numbering is dense and starts at zero.
pub fn collect_impacted_accounts(
    cache: &mut RecordCache,
    operation_id: i64,
    op: &Operation,
) -> Result<(), SinkError> {
    for name in op.impacted_accounts() {
        if name.is_empty() {
            continue;
        }
        let info = cache
            .accounts
            .get_mut(&name)
            .ok_or_else(|| SinkError::MissingAccount {
                account: name.clone(),
                operation: op.name().to_string(),
            })?;

        cache.batches.account_operations.push(AccountOperationRow {
            operation_id,
            account_id: info.id,
            account_op_seq_no: info.operation_count,
        });
        info.operation_count += 1;
    }
    cache.total_size += std::mem::size_of::<AccountOperationRow>();
    Ok(())
}

/// Import the chain state's accounts into a fresh database, in the order
/// given. Names already cached are left alone. Returns the number imported.
pub fn import_builtin_accounts<I>(cache: &mut RecordCache, names: I) -> usize
where
    I: IntoIterator<Item = AccountName>,
{
    let mut imported = 0;
    for name in names {
        if cache.accounts.contains_key(&name) {
            info!(account = %name, "builtin account already exists");
            continue;
        }
        let id = allocate_account(cache, name.clone());
        info!(account = %name, account_id = id, "importing builtin account");
        imported += 1;
    }
    imported
}

fn allocate_account(cache: &mut RecordCache, name: AccountName) -> i32 {
    let id = cache.next_account_id;
    cache.next_account_id += 1;
    cache.total_size += name.len() + std::mem::size_of::<i32>();
    cache.accounts.insert(name.clone(), AccountInfo::new(id, 0));
    cache.batches.accounts.push(AccountRow { id, name });
    id
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::*;

    fn create(creator: &str, name: &str) -> Operation {
        Operation::AccountCreate(AccountCreateOperation {
            fee: "0.000 HIVE".into(),
            creator: creator.into(),
            new_account_name: name.into(),
            json_metadata: String::new(),
        })
    }

    fn vote(voter: &str, author: &str) -> Operation {
        Operation::Vote(VoteOperation {
            voter: voter.into(),
            author: author.into(),
            permlink: "p".into(),
            weight: 10_000,
        })
    }

    fn comment(author: &str, permlink: &str) -> Operation {
        Operation::Comment(CommentOperation {
            parent_author: String::new(),
            parent_permlink: "hive".into(),
            author: author.into(),
            permlink: permlink.into(),
            title: String::new(),
            body: String::new(),
            json_metadata: String::new(),
        })
    }

    fn pow2(worker: &str) -> Operation {
        Operation::Pow2(Pow2Operation {
            worker_account: worker.into(),
            prev_block: "00".into(),
            nonce: 1,
        })
    }

    fn cache_with(names: &[&str]) -> RecordCache {
        let mut cache = RecordCache::new(4);
        import_builtin_accounts(&mut cache, names.iter().map(|n| n.to_string()));
        cache.take_batches();
        cache
    }

    #[test]
    fn allocated_ids_are_unique_and_increasing() {
        let mut cache = cache_with(&["initminer"]);
        for name in ["a", "b", "c"] {
            collect_new_ids(&mut cache, &create("initminer", name)).unwrap();
        }
        let ids: Vec<i32> = cache.batches.accounts.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![2, 3, 4]);
        assert_eq!(cache.next_account_id, 5);
    }

    #[test]
    fn duplicate_account_creation_is_fatal() {
        let mut cache = cache_with(&["initminer"]);
        collect_new_ids(&mut cache, &create("initminer", "alice")).unwrap();
        let err = collect_new_ids(&mut cache, &create("initminer", "alice")).unwrap_err();
        assert!(matches!(err, SinkError::DuplicateAccount { ref account, .. } if account == "alice"));
        assert!(err.is_consistency_violation());
    }

    #[test]
    fn pow_worker_allocated_only_once() {
        let mut cache = cache_with(&[]);
        collect_new_ids(&mut cache, &pow2("miner")).unwrap();
        collect_new_ids(&mut cache, &pow2("miner")).unwrap();
        assert_eq!(cache.batches.accounts.len(), 1);
        assert_eq!(cache.accounts["miner"].id, 1);
    }

    #[test]
    fn edited_comment_reuses_permlink() {
        let mut cache = cache_with(&["alice"]);
        collect_new_ids(&mut cache, &comment("alice", "hello")).unwrap();
        collect_new_ids(&mut cache, &comment("alice", "hello")).unwrap();
        collect_new_ids(&mut cache, &comment("alice", "world")).unwrap();

        let rows: Vec<(i32, &str)> = cache
            .batches
            .permlinks
            .iter()
            .map(|r| (r.id, r.permlink.as_str()))
            .collect();
        assert_eq!(rows, vec![(1, "hello"), (2, "world")]);
    }

    #[test]
    fn other_kinds_discover_nothing() {
        let cache = cache_with(&["alice", "bob"]);
        assert!(discover(&cache, &vote("alice", "bob")).is_empty());
    }

    #[test]
    fn sequence_numbers_count_prior_links() {
        let mut cache = cache_with(&["alice", "bob"]);
        collect_impacted_accounts(&mut cache, 1, &vote("alice", "bob")).unwrap();
        collect_impacted_accounts(&mut cache, 2, &vote("alice", "alice")).unwrap();
        collect_impacted_accounts(&mut cache, 3, &vote("bob", "alice")).unwrap();

        let alice = cache.accounts["alice"].id;
        let alice_seq: Vec<(i64, u32)> = cache
            .batches
            .account_operations
            .iter()
            .filter(|r| r.account_id == alice)
            .map(|r| (r.operation_id, r.account_op_seq_no))
            .collect();
        assert_eq!(alice_seq, vec![(1, 0), (2, 1), (3, 2)]);
        assert_eq!(cache.accounts["alice"].operation_count, 3);
        assert_eq!(cache.accounts["bob"].operation_count, 2);
    }

    #[test]
    fn creation_runs_before_linking() {
        let mut cache = cache_with(&["initminer"]);
        let op = create("initminer", "newbie");
        collect_new_ids(&mut cache, &op).unwrap();
        collect_impacted_accounts(&mut cache, 1, &op).unwrap();
        assert_eq!(cache.accounts["newbie"].operation_count, 1);
        assert_eq!(cache.batches.account_operations.len(), 2);
    }

    #[test]
    fn missing_impacted_account_is_fatal() {
        let mut cache = cache_with(&["alice"]);
        let err = collect_impacted_accounts(&mut cache, 1, &vote("alice", "ghost")).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Missing account `ghost` at processing operation `vote_operation`"
        );
    }

    #[test]
    fn empty_account_name_is_not_linked() {
        let mut cache = cache_with(&["alice"]);
        collect_impacted_accounts(&mut cache, 1, &comment("alice", "root")).unwrap();
        assert_eq!(cache.batches.account_operations.len(), 1);
    }

    #[test]
    fn builtin_import_on_empty_cache_starts_at_one() {
        let mut cache = RecordCache::new(4);
        let imported = import_builtin_accounts(
            &mut cache,
            ["initminer", "miners", "null", "temp", "initminer"].map(String::from),
        );
        assert_eq!(imported, 4);
        let rows: Vec<(i32, &str)> = cache
            .batches
            .accounts
            .iter()
            .map(|r| (r.id, r.name.as_str()))
            .collect();
        assert_eq!(
            rows,
            vec![(1, "initminer"), (2, "miners"), (3, "null"), (4, "temp")]
        );
    }
}
