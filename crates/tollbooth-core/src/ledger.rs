use crate::error::AuthorityError;
use crate::storage::{commit_detached, AccountStore};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use tracing::{error, info};

const MAX_OPERATOR_ID_LEN: usize = 256;

/// Prepaid fee account of a single operator.
///
/// Invariant: `balance == total_deposited - total_consumed`. Accounts are never
/// deleted and are only mutated through [`OperatorAccount::apply_credit`] and
/// [`OperatorAccount::apply_debit`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperatorAccount {
    pub operator_id: String,
    pub balance: u64,
    pub total_deposited: u64,
    pub total_consumed: u64,
    pub pending_invoices: BTreeSet<String>,
    pub registered_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl OperatorAccount {
    pub fn new(operator_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            operator_id: operator_id.into(),
            balance: 0,
            total_deposited: 0,
            total_consumed: 0,
            pending_invoices: BTreeSet::new(),
            registered_at: now,
            updated_at: now,
        }
    }

    pub fn invariant_holds(&self) -> bool {
        self.total_deposited.checked_sub(self.total_consumed) == Some(self.balance)
    }

    pub fn apply_credit(&mut self, amount: u64) -> Result<(), AuthorityError> {
        let balance = self.balance.checked_add(amount);
        let deposited = self.total_deposited.checked_add(amount);
        match (balance, deposited) {
            (Some(balance), Some(deposited)) => {
                self.balance = balance;
                self.total_deposited = deposited;
                self.updated_at = Utc::now();
                Ok(())
            }
            _ => Err(AuthorityError::Internal(format!(
                "credit of {amount} overflows account '{}'",
                self.operator_id
            ))),
        }
    }

    pub fn apply_debit(&mut self, amount: u64) -> Result<(), AuthorityError> {
        if self.balance < amount {
            return Err(AuthorityError::InsufficientFunds {
                required: amount,
                available: self.balance,
            });
        }
        let consumed = self.total_consumed.checked_add(amount).ok_or_else(|| {
            AuthorityError::Internal(format!(
                "debit of {amount} overflows account '{}'",
                self.operator_id
            ))
        })?;
        self.balance -= amount;
        self.total_consumed = consumed;
        self.updated_at = Utc::now();
        Ok(())
    }
}

/// Reject empty, oversized or whitespace-bearing identities.
pub fn validate_operator_id(operator_id: &str) -> Result<(), AuthorityError> {
    if operator_id.is_empty() {
        return Err(AuthorityError::invalid("operator identity is empty"));
    }
    if operator_id.len() > MAX_OPERATOR_ID_LEN {
        return Err(AuthorityError::invalid(format!(
            "operator identity exceeds {MAX_OPERATOR_ID_LEN} bytes"
        )));
    }
    if !operator_id.chars().all(|c| c.is_ascii_graphic()) {
        return Err(AuthorityError::invalid(
            "operator identity must be printable ASCII without whitespace",
        ));
    }
    Ok(())
}

pub(crate) fn require_positive(amount: u64, what: &str) -> Result<(), AuthorityError> {
    if amount == 0 {
        return Err(AuthorityError::invalid(format!("{what} must be positive")));
    }
    Ok(())
}

/// Operator ledger with one lock per account.
///
/// Credits and debits on the same operator are serialized by that account's
/// mutex; different operators never contend. Every mutation is persisted
/// before it becomes visible in memory, so a failed write leaves the account
/// untouched. The write and the publish run as one detached step, so a
/// cancelled caller cannot leave storage ahead of memory.
pub struct OperatorLedger {
    accounts: Arc<RwLock<HashMap<String, Arc<Mutex<OperatorAccount>>>>>,
    registration: Arc<Mutex<()>>,
    store: Arc<dyn AccountStore>,
}

impl OperatorLedger {
    pub fn new(store: Arc<dyn AccountStore>) -> Self {
        Self {
            accounts: Arc::new(RwLock::new(HashMap::new())),
            registration: Arc::new(Mutex::new(())),
            store,
        }
    }

    /// Rebuild the ledger from persisted accounts, refusing inconsistent rows.
    pub fn from_accounts(
        store: Arc<dyn AccountStore>,
        accounts: Vec<OperatorAccount>,
    ) -> Result<Self, AuthorityError> {
        let mut map = HashMap::with_capacity(accounts.len());
        for account in accounts {
            if !account.invariant_holds() {
                return Err(AuthorityError::Internal(format!(
                    "persisted account '{}' violates balance invariant",
                    account.operator_id
                )));
            }
            map.insert(account.operator_id.clone(), Arc::new(Mutex::new(account)));
        }
        Ok(Self {
            accounts: Arc::new(RwLock::new(map)),
            registration: Arc::new(Mutex::new(())),
            store,
        })
    }

    pub(crate) fn store(&self) -> &Arc<dyn AccountStore> {
        &self.store
    }

    pub async fn operator_count(&self) -> usize {
        self.accounts.read().await.len()
    }

    /// Idempotent: an existing account is returned unchanged.
    pub async fn register(&self, operator_id: &str) -> Result<OperatorAccount, AuthorityError> {
        validate_operator_id(operator_id)?;
        if let Some(existing) = self.find(operator_id).await {
            return Ok(existing.lock().await.clone());
        }

        let registration = self.registration.clone().lock_owned().await;
        if let Some(existing) = self.find(operator_id).await {
            return Ok(existing.lock().await.clone());
        }

        let account = OperatorAccount::new(operator_id);
        let store = self.store.clone();
        let accounts = self.accounts.clone();
        let account = commit_detached(async move {
            let _registration = registration;
            store.save_account(&account).await.map_err(|err| {
                error!(operator = %account.operator_id, error = %err, "account write failed");
                err
            })?;
            accounts.write().await.insert(
                account.operator_id.clone(),
                Arc::new(Mutex::new(account.clone())),
            );
            Ok(account)
        })
        .await?;
        info!(operator = %operator_id, "operator registered");
        Ok(account)
    }

    pub async fn credit(
        &self,
        operator_id: &str,
        amount: u64,
    ) -> Result<OperatorAccount, AuthorityError> {
        require_positive(amount, "credit amount")?;
        self.mutate(operator_id, |account| account.apply_credit(amount))
            .await
    }

    pub async fn debit(
        &self,
        operator_id: &str,
        amount: u64,
    ) -> Result<OperatorAccount, AuthorityError> {
        require_positive(amount, "debit amount")?;
        self.mutate(operator_id, |account| account.apply_debit(amount))
            .await
    }

    pub async fn read(&self, operator_id: &str) -> Result<OperatorAccount, AuthorityError> {
        let handle = self
            .find(operator_id)
            .await
            .ok_or_else(|| AuthorityError::NotFound(format!("operator '{operator_id}'")))?;
        let account = handle.lock().await;
        Ok(account.clone())
    }

    /// Exclusive access to one account for multi-step flows.
    ///
    /// Callers that also need the supply lock must take this one first.
    pub(crate) async fn lock_account(
        &self,
        operator_id: &str,
    ) -> Result<OwnedMutexGuard<OperatorAccount>, AuthorityError> {
        let handle = self
            .find(operator_id)
            .await
            .ok_or_else(|| AuthorityError::NotFound(format!("operator '{operator_id}'")))?;
        Ok(handle.lock_owned().await)
    }

    async fn find(&self, operator_id: &str) -> Option<Arc<Mutex<OperatorAccount>>> {
        self.accounts.read().await.get(operator_id).cloned()
    }

    async fn mutate<F>(&self, operator_id: &str, change: F) -> Result<OperatorAccount, AuthorityError>
    where
        F: FnOnce(&mut OperatorAccount) -> Result<(), AuthorityError>,
    {
        let mut account = self.lock_account(operator_id).await?;
        let mut next = account.clone();
        change(&mut next)?;

        let store = self.store.clone();
        commit_detached(async move {
            store.save_account(&next).await.map_err(|err| {
                error!(operator = %next.operator_id, error = %err, "account write failed");
                err
            })?;
            *account = next.clone();
            Ok(next)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{AccountStore, MemoryAccountStore};
    use proptest::prelude::*;

    fn ledger() -> OperatorLedger {
        OperatorLedger::new(Arc::new(MemoryAccountStore::new()))
    }

    #[tokio::test]
    async fn register_is_idempotent_and_keeps_balance() {
        let ledger = ledger();
        let first = ledger.register("npub1alpha").await.unwrap();
        assert_eq!(first.balance, 0);

        ledger.credit("npub1alpha", 500).await.unwrap();
        let again = ledger.register("npub1alpha").await.unwrap();
        assert_eq!(again.balance, 500);
        assert_eq!(again.registered_at, first.registered_at);
        assert_eq!(ledger.operator_count().await, 1);
    }

    #[tokio::test]
    async fn debit_without_funds_has_no_side_effect() {
        let ledger = ledger();
        ledger.register("op-a").await.unwrap();
        ledger.credit("op-a", 15).await.unwrap();

        let err = ledger.debit("op-a", 16).await.unwrap_err();
        assert!(matches!(
            err,
            AuthorityError::InsufficientFunds {
                required: 16,
                available: 15
            }
        ));
        let account = ledger.read("op-a").await.unwrap();
        assert_eq!(account.balance, 15);
        assert_eq!(account.total_consumed, 0);
    }

    #[tokio::test]
    async fn zero_amounts_and_unknown_operators_are_rejected() {
        let ledger = ledger();
        ledger.register("op-a").await.unwrap();
        assert!(matches!(
            ledger.credit("op-a", 0).await,
            Err(AuthorityError::InvalidArgument(_))
        ));
        assert!(matches!(
            ledger.debit("op-b", 1).await,
            Err(AuthorityError::NotFound(_))
        ));
        assert!(matches!(
            ledger.register("has space").await,
            Err(AuthorityError::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn failed_write_leaves_account_unchanged() {
        let store = Arc::new(MemoryAccountStore::new());
        let ledger = OperatorLedger::new(store.clone());
        ledger.register("op-a").await.unwrap();
        ledger.credit("op-a", 100).await.unwrap();

        store.set_fail_writes(true);
        assert!(matches!(
            ledger.debit("op-a", 40).await,
            Err(AuthorityError::Storage(_))
        ));
        store.set_fail_writes(false);

        assert_eq!(ledger.read("op-a").await.unwrap().balance, 100);
    }

    #[tokio::test]
    async fn dropped_credit_is_still_published_after_commit() {
        let store = Arc::new(MemoryAccountStore::new());
        let ledger = OperatorLedger::new(store.clone());
        ledger.register("op-a").await.unwrap();

        store.set_ack_delay(std::time::Duration::from_millis(200));
        let dropped = tokio::time::timeout(
            std::time::Duration::from_millis(20),
            ledger.credit("op-a", 500),
        )
        .await;
        assert!(dropped.is_err());
        store.set_ack_delay(std::time::Duration::ZERO);

        // Waits on the account lock until the detached commit has published.
        ledger.debit("op-a", 100).await.unwrap();
        let stored = store.load().await.unwrap();
        let persisted = stored
            .accounts
            .iter()
            .find(|account| account.operator_id == "op-a")
            .unwrap();
        assert_eq!(persisted.balance, 400);
        assert_eq!(persisted.total_deposited, 500);
        assert_eq!(ledger.read("op-a").await.unwrap(), *persisted);
    }

    #[tokio::test]
    async fn concurrent_debits_never_overdraw() {
        let ledger = Arc::new(ledger());
        ledger.register("op-a").await.unwrap();
        ledger.credit("op-a", 100).await.unwrap();

        let mut tasks = Vec::new();
        for _ in 0..25 {
            let ledger = ledger.clone();
            tasks.push(tokio::spawn(
                async move { ledger.debit("op-a", 7).await.is_ok() },
            ));
        }
        let mut succeeded = 0;
        for task in tasks {
            if task.await.unwrap() {
                succeeded += 1;
            }
        }

        let account = ledger.read("op-a").await.unwrap();
        assert_eq!(succeeded, 14);
        assert_eq!(account.balance, 2);
        assert!(account.invariant_holds());
    }

    #[test]
    fn rehydration_rejects_inconsistent_rows() {
        let mut account = OperatorAccount::new("op-a");
        account.balance = 10;
        let result =
            OperatorLedger::from_accounts(Arc::new(MemoryAccountStore::new()), vec![account]);
        assert!(matches!(result, Err(AuthorityError::Internal(_))));
    }

    #[derive(Debug, Clone)]
    enum Op {
        Credit(u64),
        Debit(u64),
    }

    fn op_strategy() -> impl Strategy<Value = Vec<Op>> {
        proptest::collection::vec(
            prop_oneof![
                (1u64..10_000).prop_map(Op::Credit),
                (1u64..10_000).prop_map(Op::Debit),
            ],
            0..40,
        )
    }

    proptest! {
        #[test]
        fn property_balance_matches_deposits_minus_consumption(ops in op_strategy()) {
            let mut account = OperatorAccount::new("prop-op");
            for op in ops {
                let _ = match op {
                    Op::Credit(amount) => account.apply_credit(amount),
                    Op::Debit(amount) => account.apply_debit(amount),
                };
                prop_assert!(account.invariant_holds());
            }
        }
    }
}
