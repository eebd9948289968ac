use crate::certificate::{CertificateClaims, CertificateIssuer, CertificateVerifier};
use crate::config::AuthorityConfig;
use crate::error::AuthorityError;
use crate::fee::{ChargedCertificate, FeeEngine, FeeSchedule};
use crate::invoice::{InvoiceTracker, PaymentBackend, ReconcileSummary, SettlementResult};
use crate::ledger::{validate_operator_id, OperatorAccount, OperatorLedger};
use crate::membership::{MembershipGate, MembershipRegistry, MembershipStatus};
use crate::replay::ReplayTracker;
use crate::signing::{AuthorityKeys, SignatureScheme};
use crate::storage::AccountStore;
use crate::supply::{SupplyLedger, SupplyMode, SupplyState};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

pub const SERVICE_NAME: &str = "tollbooth-authority";

/// External collaborators the engine is wired to.
#[derive(Clone)]
pub struct AuthorityCollaborators {
    pub store: Arc<dyn AccountStore>,
    pub payment: Arc<dyn PaymentBackend>,
    pub registry: Option<Arc<dyn MembershipRegistry>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BalanceSummary {
    pub operator_id: String,
    pub balance: u64,
    pub total_deposited: u64,
    pub total_consumed: u64,
    pub pending_invoices: Vec<String>,
}

impl From<&OperatorAccount> for BalanceSummary {
    fn from(account: &OperatorAccount) -> Self {
        Self {
            operator_id: account.operator_id.clone(),
            balance: account.balance,
            total_deposited: account.total_deposited,
            total_consumed: account.total_consumed,
            pending_invoices: account.pending_invoices.iter().cloned().collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvoiceReceipt {
    pub invoice_id: String,
    pub operator_id: String,
    pub amount: u64,
    pub payment_descriptor: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentConfirmation {
    pub invoice_id: String,
    pub status: crate::invoice::InvoiceStatus,
    pub settled: bool,
    pub credited: bool,
    pub new_balance: u64,
}

impl From<SettlementResult> for PaymentConfirmation {
    fn from(result: SettlementResult) -> Self {
        Self {
            settled: result.settled(),
            invoice_id: result.invoice_id,
            status: result.status,
            credited: result.credited,
            new_balance: result.balance,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SupplySummary {
    pub mode: String,
    pub remaining: u64,
    pub total_replenished: u64,
    pub total_consumed: u64,
}

impl SupplySummary {
    fn new(mode: SupplyMode, state: &SupplyState) -> Self {
        Self {
            mode: mode.label().to_string(),
            remaining: state.remaining,
            total_replenished: state.total_replenished,
            total_consumed: state.total_consumed,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperatorStatus {
    pub operator_id: String,
    pub registered: bool,
    pub registered_at: Option<DateTime<Utc>>,
    pub balance: Option<BalanceSummary>,
    pub authority_public_key: String,
    pub signature_scheme: SignatureScheme,
    pub fee_rate_percent: f64,
    pub min_fee: u64,
    pub membership_enforced: bool,
    pub supply: SupplySummary,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MembershipLookup {
    pub subject: String,
    pub status: MembershipStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceStatus {
    pub service: String,
    pub version: String,
    pub storage_backend: String,
    pub payment_backend: String,
    pub signature_scheme: SignatureScheme,
    pub operators: usize,
    pub replay_entries: usize,
}

/// Certification authority engine.
///
/// Owns the ledger, invoice tracker, supply counter, membership gate and the
/// certificate issuer/verifier pair, and exposes every operation of the
/// authority as an async method returning a typed result.
pub struct AuthorityEngine {
    config: AuthorityConfig,
    ledger: Arc<OperatorLedger>,
    invoices: InvoiceTracker,
    supply: Arc<SupplyLedger>,
    fees: FeeEngine,
    membership: MembershipGate,
    replay: Arc<ReplayTracker>,
    issuer: CertificateIssuer,
    verifier: CertificateVerifier,
    storage_backend: &'static str,
}

impl AuthorityEngine {
    /// Hydrate persisted state and wire every component.
    pub async fn bootstrap(
        config: AuthorityConfig,
        keys: AuthorityKeys,
        collaborators: AuthorityCollaborators,
    ) -> Result<Self, AuthorityError> {
        config.validate()?;
        let AuthorityCollaborators {
            store,
            payment,
            registry,
        } = collaborators;

        let stored = store.load().await?;
        let ledger = Arc::new(OperatorLedger::from_accounts(
            store.clone(),
            stored.accounts,
        )?);
        let supply = Arc::new(
            SupplyLedger::bootstrap(
                config.supply,
                config.admin_identity.clone(),
                store.clone(),
                stored.supply,
            )
            .await?,
        );
        let invoices = InvoiceTracker::new(
            ledger.clone(),
            payment,
            config.upstream_timeout(),
            stored.invoices,
        );

        if config.enforce_membership && registry.is_none() {
            warn!("membership enforcement is on without a registry; every certification will be denied");
        }
        let membership =
            MembershipGate::new(registry, config.membership_ttl(), config.upstream_timeout());

        let replay = Arc::new(ReplayTracker::new());
        let issuer = CertificateIssuer::new(
            keys.signer.clone(),
            replay.clone(),
            config.certificate_ttl(),
            config.authority_id.clone(),
        );
        let verifier = CertificateVerifier::new(keys.verifier.clone(), replay.clone());
        let fees = FeeEngine::new(config.fee, ledger.clone(), supply.clone());

        info!(
            storage = store.backend_label(),
            payment = invoices.backend_name(),
            scheme = %keys.scheme(),
            supply_mode = config.supply.label(),
            operators = ledger.operator_count().await,
            "authority engine ready"
        );

        Ok(Self {
            storage_backend: store.backend_label(),
            config,
            ledger,
            invoices,
            supply,
            fees,
            membership,
            replay,
            issuer,
            verifier,
        })
    }

    pub fn config(&self) -> &AuthorityConfig {
        &self.config
    }

    pub fn fee_schedule(&self) -> FeeSchedule {
        self.fees.schedule()
    }

    pub fn authority_public_key(&self) -> String {
        self.issuer.public_key_hex()
    }

    pub async fn register_operator(
        &self,
        operator_id: &str,
    ) -> Result<BalanceSummary, AuthorityError> {
        let account = self.ledger.register(operator_id).await?;
        Ok(BalanceSummary::from(&account))
    }

    pub async fn open_credit_invoice(
        &self,
        operator_id: &str,
        amount: u64,
    ) -> Result<InvoiceReceipt, AuthorityError> {
        let invoice = self.invoices.open_invoice(operator_id, amount).await?;
        Ok(InvoiceReceipt {
            invoice_id: invoice.invoice_id,
            operator_id: invoice.operator_id,
            amount: invoice.amount,
            payment_descriptor: invoice.payment_descriptor,
        })
    }

    pub async fn confirm_payment(
        &self,
        invoice_id: &str,
    ) -> Result<PaymentConfirmation, AuthorityError> {
        if invoice_id.trim().is_empty() {
            return Err(AuthorityError::invalid("invoice id is empty"));
        }
        Ok(self.invoices.settle(invoice_id).await?.into())
    }

    pub async fn get_balance(&self, operator_id: &str) -> Result<BalanceSummary, AuthorityError> {
        let account = self.ledger.read(operator_id).await?;
        Ok(BalanceSummary::from(&account))
    }

    /// Registration state, balance and the key certificates are signed with.
    /// Unknown operators get `registered: false` rather than an error.
    pub async fn get_status(&self, operator_id: &str) -> Result<OperatorStatus, AuthorityError> {
        validate_operator_id(operator_id)?;
        let account = match self.ledger.read(operator_id).await {
            Ok(account) => Some(account),
            Err(AuthorityError::NotFound(_)) => None,
            Err(err) => return Err(err),
        };
        let supply = self.supply.snapshot().await;
        let schedule = self.fees.schedule();

        Ok(OperatorStatus {
            operator_id: operator_id.to_string(),
            registered: account.is_some(),
            registered_at: account.as_ref().map(|a| a.registered_at),
            balance: account.as_ref().map(BalanceSummary::from),
            authority_public_key: self.issuer.public_key_hex(),
            signature_scheme: self.issuer.scheme(),
            fee_rate_percent: schedule.rate_percent(),
            min_fee: schedule.min_fee,
            membership_enforced: self.config.enforce_membership,
            supply: SupplySummary::new(self.supply.mode(), &supply),
        })
    }

    /// Membership gate, then fee and supply debit, then issuance.
    pub async fn certify(
        &self,
        operator_id: &str,
        amount: u64,
    ) -> Result<ChargedCertificate, AuthorityError> {
        validate_operator_id(operator_id)?;
        if amount == 0 {
            return Err(AuthorityError::invalid("certified amount must be positive"));
        }

        if self.config.enforce_membership {
            if let Err(err) = self.membership.require_active(operator_id).await {
                warn!(operator = %operator_id, error = %err, "certification denied by membership gate");
                return Err(err);
            }
        }

        let charged = self.fees.certify(operator_id, amount, &self.issuer).await?;
        info!(
            operator = %operator_id,
            certificate_id = %charged.certificate.claims.jti,
            amount,
            fee = charged.fee_charged,
            balance = charged.balance_after,
            supply_remaining = charged.supply_remaining,
            "certificate issued"
        );
        Ok(charged)
    }

    pub async fn verify_certificate(
        &self,
        certificate: &str,
    ) -> Result<CertificateClaims, AuthorityError> {
        if certificate.trim().is_empty() {
            return Err(AuthorityError::invalid("certificate is empty"));
        }
        self.verifier.verify(certificate)
    }

    pub async fn replenish_supply(
        &self,
        amount: u64,
        caller_identity: &str,
    ) -> Result<SupplySummary, AuthorityError> {
        let state = self.supply.replenish(amount, caller_identity).await?;
        Ok(SupplySummary::new(self.supply.mode(), &state))
    }

    pub async fn supply_status(&self) -> SupplySummary {
        SupplySummary::new(self.supply.mode(), &self.supply.snapshot().await)
    }

    pub async fn lookup_membership(
        &self,
        subject: &str,
    ) -> Result<MembershipLookup, AuthorityError> {
        if subject.trim().is_empty() {
            return Err(AuthorityError::invalid("membership subject is empty"));
        }
        Ok(MembershipLookup {
            subject: subject.to_string(),
            status: self.membership.is_active(subject).await,
        })
    }

    pub async fn invalidate_membership(&self) {
        self.membership.invalidate().await;
    }

    pub async fn reconcile_pending(
        &self,
        operator_id: &str,
    ) -> Result<ReconcileSummary, AuthorityError> {
        self.invoices.reconcile_pending(operator_id).await
    }

    pub fn prune_replay(&self) -> Result<usize, AuthorityError> {
        self.replay.prune(Utc::now())
    }

    pub fn storage_backend(&self) -> &'static str {
        self.storage_backend
    }

    pub async fn service_status(&self) -> Result<ServiceStatus, AuthorityError> {
        Ok(ServiceStatus {
            service: SERVICE_NAME.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            storage_backend: self.storage_backend.to_string(),
            payment_backend: self.invoices.backend_name().to_string(),
            signature_scheme: self.issuer.scheme(),
            operators: self.ledger.operator_count().await,
            replay_entries: self.replay.len()?,
        })
    }
}
