use crate::certificate::{CertificateIssuer, IssuedCertificate};
use crate::error::AuthorityError;
use crate::ledger::{require_positive, OperatorLedger};
use crate::storage::commit_detached;
use crate::supply::SupplyLedger;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, warn};

const BPS_DENOMINATOR: u128 = 10_000;

/// Certification fee: a rate in basis points with a floor.
///
/// `fee = max(ceil(amount * rate_bps / 10_000), min_fee)`, evaluated in
/// integers so rounding never under-collects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeeSchedule {
    pub rate_bps: u32,
    pub min_fee: u64,
}

impl Default for FeeSchedule {
    fn default() -> Self {
        Self {
            rate_bps: 200,
            min_fee: 10,
        }
    }
}

impl FeeSchedule {
    pub fn new(rate_bps: u32, min_fee: u64) -> Result<Self, AuthorityError> {
        if u128::from(rate_bps) > BPS_DENOMINATOR {
            return Err(AuthorityError::invalid(format!(
                "fee rate {rate_bps} bps exceeds 100%"
            )));
        }
        Ok(Self { rate_bps, min_fee })
    }

    pub fn fee_for(&self, amount: u64) -> u64 {
        let scaled = u128::from(amount) * u128::from(self.rate_bps);
        let proportional = scaled.div_ceil(BPS_DENOMINATOR);
        // rate_bps <= 10_000 keeps this within amount; saturate otherwise.
        let proportional = u64::try_from(proportional).unwrap_or(u64::MAX);
        proportional.max(self.min_fee)
    }

    pub fn rate_percent(&self) -> f64 {
        f64::from(self.rate_bps) / 100.0
    }
}

/// Charged certification: the signed certificate and what it cost.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChargedCertificate {
    pub certificate: IssuedCertificate,
    pub fee_charged: u64,
    pub balance_after: u64,
    pub supply_remaining: u64,
}

/// Debits the operator fee and the authority supply as one unit.
///
/// Lock order is operator account, then supply. Both debits are computed on
/// working copies, the certificate is minted, and only then are both records
/// written in one storage transaction and published in memory. Any failure
/// before that point drops the working copies, so a refused certification
/// never costs a fee.
pub struct FeeEngine {
    schedule: FeeSchedule,
    ledger: Arc<OperatorLedger>,
    supply: Arc<SupplyLedger>,
}

impl FeeEngine {
    pub fn new(schedule: FeeSchedule, ledger: Arc<OperatorLedger>, supply: Arc<SupplyLedger>) -> Self {
        Self {
            schedule,
            ledger,
            supply,
        }
    }

    pub fn schedule(&self) -> FeeSchedule {
        self.schedule
    }

    pub async fn certify(
        &self,
        operator_id: &str,
        amount: u64,
        issuer: &CertificateIssuer,
    ) -> Result<ChargedCertificate, AuthorityError> {
        require_positive(amount, "certified amount")?;
        let fee = self.schedule.fee_for(amount);

        let mut account = self.ledger.lock_account(operator_id).await?;
        let mut next_account = account.clone();
        next_account.apply_debit(fee)?;

        let mut supply = self.supply.lock().await;
        let mut next_supply = supply.clone();
        if let Err(err) = next_supply.apply_consume(amount) {
            warn!(operator = %operator_id, amount, fee, "supply exhausted, fee debit discarded");
            return Err(err);
        }

        let certificate = issuer.issue(operator_id, amount, fee)?;

        let store = self.ledger.store().clone();
        commit_detached(async move {
            if let Err(err) = store.save_certification(&next_account, &next_supply).await {
                error!(operator = %next_account.operator_id, error = %err, "certification write failed, certificate discarded");
                return Err(err);
            }
            *account = next_account;
            *supply = next_supply;

            Ok(ChargedCertificate {
                certificate,
                fee_charged: fee,
                balance_after: account.balance,
                supply_remaining: supply.remaining,
            })
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replay::ReplayTracker;
    use crate::signing::{AuthorityKeys, SignatureScheme};
    use crate::storage::{AccountStore, MemoryAccountStore};
    use crate::supply::SupplyMode;
    use proptest::prelude::*;

    struct Fixture {
        store: Arc<MemoryAccountStore>,
        ledger: Arc<OperatorLedger>,
        supply: Arc<SupplyLedger>,
        engine: FeeEngine,
        issuer: CertificateIssuer,
    }

    async fn fixture(capacity: u64, balance: u64) -> Fixture {
        let store = Arc::new(MemoryAccountStore::new());
        let ledger = Arc::new(OperatorLedger::new(store.clone()));
        ledger.register("op-a").await.unwrap();
        if balance > 0 {
            ledger.credit("op-a", balance).await.unwrap();
        }
        let supply = Arc::new(
            SupplyLedger::bootstrap(
                SupplyMode::Root {
                    initial_capacity: capacity,
                },
                None,
                store.clone(),
                None,
            )
            .await
            .unwrap(),
        );
        let keys = AuthorityKeys::from_secret_bytes(SignatureScheme::EddsaJwt, &[5u8; 32]).unwrap();
        let issuer = CertificateIssuer::new(
            keys.signer,
            Arc::new(ReplayTracker::new()),
            chrono::Duration::seconds(600),
            None,
        );
        Fixture {
            store,
            engine: FeeEngine::new(FeeSchedule::default(), ledger.clone(), supply.clone()),
            ledger,
            supply,
            issuer,
        }
    }

    #[tokio::test]
    async fn certification_debits_fee_and_supply_together() {
        let f = fixture(10_000, 100).await;
        let charged = f.engine.certify("op-a", 1_000, &f.issuer).await.unwrap();
        assert_eq!(charged.fee_charged, 20);
        assert_eq!(charged.balance_after, 80);
        assert_eq!(charged.supply_remaining, 9_000);
        assert_eq!(charged.certificate.claims.tax_paid_sats, 20);

        let stored = f.store.load().await.unwrap();
        assert_eq!(stored.accounts[0].balance, 80);
        assert_eq!(stored.supply.unwrap().remaining, 9_000);
    }

    #[tokio::test]
    async fn exhausted_supply_charges_no_fee() {
        let f = fixture(500, 100).await;
        f.engine.certify("op-a", 400, &f.issuer).await.unwrap();
        let before = f.ledger.read("op-a").await.unwrap();

        let err = f.engine.certify("op-a", 200, &f.issuer).await.unwrap_err();
        assert!(matches!(err, AuthorityError::SupplyExhausted { .. }));
        assert_eq!(f.ledger.read("op-a").await.unwrap(), before);
        assert_eq!(f.supply.remaining().await, 100);
    }

    #[tokio::test]
    async fn failed_write_publishes_nothing() {
        let f = fixture(1_000, 100).await;
        f.store.set_fail_writes(true);
        assert!(matches!(
            f.engine.certify("op-a", 100, &f.issuer).await,
            Err(AuthorityError::Storage(_))
        ));
        f.store.set_fail_writes(false);
        assert_eq!(f.ledger.read("op-a").await.unwrap().balance, 100);
        assert_eq!(f.supply.remaining().await, 1_000);
    }

    #[tokio::test]
    async fn dropped_certification_keeps_memory_in_step_with_storage() {
        let f = fixture(10_000, 100).await;
        f.store.set_ack_delay(std::time::Duration::from_millis(200));
        let dropped = tokio::time::timeout(
            std::time::Duration::from_millis(20),
            f.engine.certify("op-a", 1_000, &f.issuer),
        )
        .await;
        assert!(dropped.is_err());
        f.store.set_ack_delay(std::time::Duration::ZERO);

        // The committed debit is visible once the account lock is released.
        let account = f.ledger.read("op-a").await.unwrap();
        assert_eq!(account.balance, 80);
        assert_eq!(f.supply.remaining().await, 9_000);

        let charged = f.engine.certify("op-a", 100, &f.issuer).await.unwrap();
        assert_eq!(charged.balance_after, 70);
        let stored = f.store.load().await.unwrap();
        assert_eq!(stored.accounts[0].balance, 70);
        assert_eq!(stored.accounts[0].total_consumed, 30);
        assert_eq!(stored.supply.unwrap().remaining, 8_900);
    }

    #[tokio::test]
    async fn concurrent_certifications_cannot_overdraw() {
        let f = fixture(10_000, 15).await;
        let engine = Arc::new(f.engine);
        let issuer = Arc::new(f.issuer);

        let (a, b) = tokio::join!(
            {
                let (engine, issuer) = (engine.clone(), issuer.clone());
                async move { engine.certify("op-a", 100, &issuer).await }
            },
            {
                let (engine, issuer) = (engine.clone(), issuer.clone());
                async move { engine.certify("op-a", 100, &issuer).await }
            }
        );
        let outcomes = [a, b];
        assert_eq!(outcomes.iter().filter(|r| r.is_ok()).count(), 1);
        assert!(outcomes
            .iter()
            .any(|r| matches!(r, Err(AuthorityError::InsufficientFunds { .. }))));
        assert_eq!(f.ledger.read("op-a").await.unwrap().balance, 5);
        assert_eq!(f.supply.remaining().await, 9_900);
    }

    #[test]
    fn two_percent_with_ten_sat_floor() {
        let schedule = FeeSchedule::default();
        assert_eq!(schedule.fee_for(100), 10);
        assert_eq!(schedule.fee_for(1_000), 20);
        assert_eq!(schedule.fee_for(50_000), 1_000);
    }

    #[test]
    fn fractional_fees_round_up() {
        let schedule = FeeSchedule::new(200, 0).unwrap();
        assert_eq!(schedule.fee_for(1), 1);
        assert_eq!(schedule.fee_for(51), 2);
        assert_eq!(schedule.fee_for(0), 0);
    }

    #[test]
    fn rate_above_one_hundred_percent_is_rejected() {
        assert!(FeeSchedule::new(10_001, 0).is_err());
        assert_eq!(FeeSchedule::new(10_000, 0).unwrap().fee_for(u64::MAX), u64::MAX);
    }

    proptest! {
        #[test]
        fn property_fee_never_under_collects(amount in 0u64..u64::MAX / 2, bps in 0u32..=10_000, min_fee in 0u64..100_000) {
            let schedule = FeeSchedule::new(bps, min_fee).unwrap();
            let fee = schedule.fee_for(amount);
            prop_assert!(fee >= min_fee);
            prop_assert!(u128::from(fee) * 10_000 >= u128::from(amount) * u128::from(bps));
            if fee > min_fee {
                // Ceiling, not more: one unit less would under-collect.
                prop_assert!(u128::from(fee - 1) * 10_000 < u128::from(amount) * u128::from(bps));
            }
        }
    }
}
