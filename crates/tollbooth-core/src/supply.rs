use crate::error::AuthorityError;
use crate::ledger::require_positive;
use crate::storage::{commit_detached, AccountStore};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{info, warn};

/// How the authority obtains its certifiable capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum SupplyMode {
    /// Top of the hierarchy: capacity self-initializes on first start.
    Root { initial_capacity: u64 },
    /// Capacity starts empty and grows only through admin replenishment.
    Delegated,
}

impl SupplyMode {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Root { .. } => "root",
            Self::Delegated => "delegated",
        }
    }
}

impl Default for SupplyMode {
    fn default() -> Self {
        Self::Delegated
    }
}

/// Authority-wide remaining capacity, distinct from every operator balance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SupplyState {
    pub remaining: u64,
    pub total_replenished: u64,
    pub total_consumed: u64,
    pub updated_at: DateTime<Utc>,
}

impl SupplyState {
    pub fn empty() -> Self {
        Self {
            remaining: 0,
            total_replenished: 0,
            total_consumed: 0,
            updated_at: Utc::now(),
        }
    }

    pub fn apply_consume(&mut self, amount: u64) -> Result<(), AuthorityError> {
        if self.remaining < amount {
            return Err(AuthorityError::SupplyExhausted {
                required: amount,
                remaining: self.remaining,
            });
        }
        self.total_consumed = self
            .total_consumed
            .checked_add(amount)
            .ok_or_else(|| AuthorityError::Internal("supply consumption overflow".into()))?;
        self.remaining -= amount;
        self.updated_at = Utc::now();
        Ok(())
    }

    pub fn apply_replenish(&mut self, amount: u64) -> Result<(), AuthorityError> {
        let remaining = self.remaining.checked_add(amount);
        let replenished = self.total_replenished.checked_add(amount);
        match (remaining, replenished) {
            (Some(remaining), Some(replenished)) => {
                self.remaining = remaining;
                self.total_replenished = replenished;
                self.updated_at = Utc::now();
                Ok(())
            }
            _ => Err(AuthorityError::InvalidArgument(format!(
                "replenishing {amount} would overflow supply"
            ))),
        }
    }
}

/// Single global supply counter.
///
/// One mutex guards the whole counter: capacity is shared by every operator,
/// so consumption is linearizable across all of them.
pub struct SupplyLedger {
    state: Arc<Mutex<SupplyState>>,
    mode: SupplyMode,
    admin_identity: Option<String>,
    store: Arc<dyn AccountStore>,
}

impl SupplyLedger {
    /// Restore persisted supply, or initialize it according to `mode`.
    pub async fn bootstrap(
        mode: SupplyMode,
        admin_identity: Option<String>,
        store: Arc<dyn AccountStore>,
        persisted: Option<SupplyState>,
    ) -> Result<Self, AuthorityError> {
        let state = match (persisted, mode) {
            (Some(state), _) => state,
            (None, SupplyMode::Root { initial_capacity }) => {
                let mut state = SupplyState::empty();
                state.apply_replenish(initial_capacity)?;
                store.save_supply(&state).await?;
                info!(capacity = initial_capacity, "root supply initialized");
                state
            }
            (None, SupplyMode::Delegated) => SupplyState::empty(),
        };

        Ok(Self {
            state: Arc::new(Mutex::new(state)),
            mode,
            admin_identity: admin_identity.filter(|id| !id.is_empty()),
            store,
        })
    }

    pub fn mode(&self) -> SupplyMode {
        self.mode
    }

    pub async fn remaining(&self) -> u64 {
        self.state.lock().await.remaining
    }

    pub async fn snapshot(&self) -> SupplyState {
        self.state.lock().await.clone()
    }

    pub async fn consume(&self, amount: u64) -> Result<SupplyState, AuthorityError> {
        require_positive(amount, "supply amount")?;
        self.mutate(|state| state.apply_consume(amount)).await
    }

    pub async fn replenish(
        &self,
        amount: u64,
        caller_identity: &str,
    ) -> Result<SupplyState, AuthorityError> {
        self.authorize(caller_identity)?;
        require_positive(amount, "replenish amount")?;

        let next = self.mutate(|state| state.apply_replenish(amount)).await?;
        info!(amount, remaining = next.remaining, "supply replenished");
        Ok(next)
    }

    async fn mutate<F>(&self, change: F) -> Result<SupplyState, AuthorityError>
    where
        F: FnOnce(&mut SupplyState) -> Result<(), AuthorityError>,
    {
        let mut state = self.lock().await;
        let mut next = state.clone();
        change(&mut next)?;

        let store = self.store.clone();
        commit_detached(async move {
            store.save_supply(&next).await?;
            *state = next.clone();
            Ok(next)
        })
        .await
    }

    pub(crate) async fn lock(&self) -> OwnedMutexGuard<SupplyState> {
        self.state.clone().lock_owned().await
    }

    fn authorize(&self, caller_identity: &str) -> Result<(), AuthorityError> {
        match self.admin_identity.as_deref() {
            Some(admin) if admin == caller_identity => Ok(()),
            Some(_) => {
                warn!(caller = %caller_identity, "non-admin supply replenishment rejected");
                Err(AuthorityError::PermissionDenied(format!(
                    "'{caller_identity}' is not the administrative identity"
                )))
            }
            None => Err(AuthorityError::PermissionDenied(
                "no administrative identity is configured".into(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{AccountStore, MemoryAccountStore};

    async fn supply(mode: SupplyMode, admin: Option<&str>) -> SupplyLedger {
        SupplyLedger::bootstrap(
            mode,
            admin.map(str::to_string),
            Arc::new(MemoryAccountStore::new()),
            None,
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn root_mode_self_initializes() {
        let supply = supply(
            SupplyMode::Root {
                initial_capacity: 500,
            },
            None,
        )
        .await;
        assert_eq!(supply.remaining().await, 500);

        supply.consume(400).await.unwrap();
        let err = supply.consume(200).await.unwrap_err();
        assert!(matches!(
            err,
            AuthorityError::SupplyExhausted {
                required: 200,
                remaining: 100
            }
        ));
        assert_eq!(supply.remaining().await, 100);
    }

    #[tokio::test]
    async fn persisted_supply_wins_over_initial_capacity() {
        let mut persisted = SupplyState::empty();
        persisted.apply_replenish(42).unwrap();
        let supply = SupplyLedger::bootstrap(
            SupplyMode::Root {
                initial_capacity: 1_000,
            },
            None,
            Arc::new(MemoryAccountStore::new()),
            Some(persisted),
        )
        .await
        .unwrap();
        assert_eq!(supply.remaining().await, 42);
    }

    #[tokio::test]
    async fn replenish_requires_admin_identity() {
        let supply = supply(SupplyMode::Delegated, Some("npub1admin")).await;
        assert_eq!(supply.remaining().await, 0);

        let err = supply.replenish(1_000, "npub1intruder").await.unwrap_err();
        assert!(matches!(err, AuthorityError::PermissionDenied(_)));
        assert_eq!(supply.remaining().await, 0);

        let state = supply.replenish(1_000, "npub1admin").await.unwrap();
        assert_eq!(state.remaining, 1_000);
        assert_eq!(state.total_replenished, 1_000);
    }

    #[tokio::test]
    async fn replenish_without_configured_admin_is_denied() {
        let supply = supply(SupplyMode::Delegated, Some("")).await;
        assert!(matches!(
            supply.replenish(10, "").await,
            Err(AuthorityError::PermissionDenied(_))
        ));
    }

    #[tokio::test]
    async fn dropped_replenish_is_still_published_after_commit() {
        let store = Arc::new(MemoryAccountStore::new());
        let supply = SupplyLedger::bootstrap(
            SupplyMode::Delegated,
            Some("npub1admin".into()),
            store.clone(),
            None,
        )
        .await
        .unwrap();

        store.set_ack_delay(std::time::Duration::from_millis(200));
        let dropped = tokio::time::timeout(
            std::time::Duration::from_millis(20),
            supply.replenish(1_000, "npub1admin"),
        )
        .await;
        assert!(dropped.is_err());
        store.set_ack_delay(std::time::Duration::ZERO);

        let state = supply.consume(300).await.unwrap();
        assert_eq!(state.remaining, 700);
        assert_eq!(store.load().await.unwrap().supply, Some(state));
    }
}
