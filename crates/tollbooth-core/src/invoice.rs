use crate::error::AuthorityError;
use crate::ledger::{require_positive, OperatorAccount, OperatorLedger};
use crate::storage::{commit_detached, AccountStore};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvoiceStatus {
    Pending,
    Settled,
    Expired,
}

impl InvoiceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Settled => "settled",
            Self::Expired => "expired",
        }
    }

    pub fn parse(value: &str) -> Result<Self, AuthorityError> {
        match value {
            "pending" => Ok(Self::Pending),
            "settled" => Ok(Self::Settled),
            "expired" => Ok(Self::Expired),
            other => Err(AuthorityError::Storage(format!(
                "unknown invoice status '{other}'"
            ))),
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

/// Pre-funding invoice owned by one operator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Invoice {
    pub invoice_id: String,
    pub operator_id: String,
    pub amount: u64,
    pub status: InvoiceStatus,
    /// Checkout link or payment request handed to the payer.
    pub payment_descriptor: String,
    pub created_at: DateTime<Utc>,
    pub settled_at: Option<DateTime<Utc>>,
}

/// What the payment backend reports for an invoice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SettlementStatus {
    Pending,
    Settled,
    Expired,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvoiceDescriptor {
    pub invoice_id: String,
    pub payment_descriptor: String,
}

/// External Lightning invoice backend.
#[async_trait]
pub trait PaymentBackend: Send + Sync {
    fn name(&self) -> &str;

    async fn create_invoice(
        &self,
        operator_id: &str,
        amount: u64,
    ) -> Result<InvoiceDescriptor, AuthorityError>;

    async fn get_settlement_status(
        &self,
        invoice_id: &str,
    ) -> Result<SettlementStatus, AuthorityError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettlementResult {
    pub invoice_id: String,
    pub operator_id: String,
    pub status: InvoiceStatus,
    /// True only for the call that actually credited the ledger.
    pub credited: bool,
    pub balance: u64,
}

impl SettlementResult {
    pub fn settled(&self) -> bool {
        self.status == InvoiceStatus::Settled
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileSummary {
    pub checked: usize,
    pub settled: usize,
    pub expired: usize,
    pub still_pending: usize,
    pub failed: usize,
}

/// Tracks pre-funding invoices and turns settlements into ledger credits.
///
/// Each invoice has its own mutex, held across the backend status query, so
/// concurrent `settle` calls for one invoice run one at a time and the
/// pending -> settled transition happens once. Status changes are written
/// and published as one detached step that outlives a cancelled caller.
pub struct InvoiceTracker {
    invoices: Arc<RwLock<HashMap<String, Arc<Mutex<Invoice>>>>>,
    ledger: Arc<OperatorLedger>,
    backend: Arc<dyn PaymentBackend>,
    timeout: Duration,
}

impl InvoiceTracker {
    pub fn new(
        ledger: Arc<OperatorLedger>,
        backend: Arc<dyn PaymentBackend>,
        timeout: Duration,
        invoices: Vec<Invoice>,
    ) -> Self {
        let invoices = invoices
            .into_iter()
            .map(|invoice| (invoice.invoice_id.clone(), Arc::new(Mutex::new(invoice))))
            .collect();
        Self {
            invoices: Arc::new(RwLock::new(invoices)),
            ledger,
            backend,
            timeout,
        }
    }

    pub fn backend_name(&self) -> &str {
        self.backend.name()
    }

    pub async fn open_invoice(
        &self,
        operator_id: &str,
        amount: u64,
    ) -> Result<Invoice, AuthorityError> {
        require_positive(amount, "invoice amount")?;
        // Fail fast for unknown operators before touching the backend.
        self.ledger.read(operator_id).await?;

        let descriptor = self
            .bounded(self.backend.create_invoice(operator_id, amount))
            .await?;

        let invoice = Invoice {
            invoice_id: descriptor.invoice_id,
            operator_id: operator_id.to_string(),
            amount,
            status: InvoiceStatus::Pending,
            payment_descriptor: descriptor.payment_descriptor,
            created_at: Utc::now(),
            settled_at: None,
        };

        let mut account = self.ledger.lock_account(operator_id).await?;
        let mut invoices = self.invoices.clone().write_owned().await;
        if invoices.contains_key(&invoice.invoice_id) {
            error!(invoice_id = %invoice.invoice_id, "payment backend reused an invoice id");
            return Err(AuthorityError::Internal(format!(
                "invoice '{}' already tracked",
                invoice.invoice_id
            )));
        }

        let mut next = account.clone();
        next.pending_invoices.insert(invoice.invoice_id.clone());
        next.updated_at = Utc::now();

        let store = self.ledger.store().clone();
        let invoice = commit_detached(async move {
            store.save_invoice_with_account(&invoice, &next).await?;
            invoices.insert(
                invoice.invoice_id.clone(),
                Arc::new(Mutex::new(invoice.clone())),
            );
            *account = next;
            Ok(invoice)
        })
        .await?;
        info!(operator = %operator_id, invoice_id = %invoice.invoice_id, amount, "invoice opened");
        Ok(invoice)
    }

    /// Poll the backend and credit the ledger if the invoice has settled.
    ///
    /// Idempotent: an invoice that is already settled or expired is reported
    /// without querying the backend or touching the ledger again.
    pub async fn settle(&self, invoice_id: &str) -> Result<SettlementResult, AuthorityError> {
        let handle = self
            .find(invoice_id)
            .await
            .ok_or_else(|| AuthorityError::NotFound(format!("invoice '{invoice_id}'")))?;
        let invoice = handle.lock_owned().await;

        if invoice.status.is_terminal() {
            return self.result(&invoice, false).await;
        }

        let status = self
            .bounded(self.backend.get_settlement_status(invoice_id))
            .await?;

        match status {
            SettlementStatus::Pending => self.result(&invoice, false).await,
            SettlementStatus::Settled => {
                let account = self.ledger.lock_account(&invoice.operator_id).await?;
                let mut next_account = account.clone();
                next_account.apply_credit(invoice.amount)?;
                next_account.pending_invoices.remove(invoice_id);

                let mut next_invoice = invoice.clone();
                next_invoice.status = InvoiceStatus::Settled;
                next_invoice.settled_at = Some(Utc::now());

                let amount = invoice.amount;
                let result = commit_transition(
                    self.ledger.store().clone(),
                    (invoice, next_invoice),
                    (account, next_account),
                    true,
                )
                .await?;
                info!(
                    operator = %result.operator_id,
                    invoice_id,
                    amount,
                    balance = result.balance,
                    "invoice settled, ledger credited"
                );
                Ok(result)
            }
            SettlementStatus::Expired => {
                let account = self.ledger.lock_account(&invoice.operator_id).await?;
                let mut next_account = account.clone();
                next_account.pending_invoices.remove(invoice_id);
                next_account.updated_at = Utc::now();

                let mut next_invoice = invoice.clone();
                next_invoice.status = InvoiceStatus::Expired;

                let result = commit_transition(
                    self.ledger.store().clone(),
                    (invoice, next_invoice),
                    (account, next_account),
                    false,
                )
                .await?;
                info!(operator = %result.operator_id, invoice_id, "invoice expired unpaid");
                Ok(result)
            }
        }
    }

    /// Re-check every pending invoice of one operator.
    ///
    /// Per-invoice failures are counted and logged, never raised.
    pub async fn reconcile_pending(
        &self,
        operator_id: &str,
    ) -> Result<ReconcileSummary, AuthorityError> {
        let account = self.ledger.read(operator_id).await?;
        let mut summary = ReconcileSummary::default();

        for invoice_id in &account.pending_invoices {
            summary.checked += 1;
            match self.settle(invoice_id).await {
                Ok(result) => match result.status {
                    InvoiceStatus::Settled => summary.settled += 1,
                    InvoiceStatus::Expired => summary.expired += 1,
                    InvoiceStatus::Pending => summary.still_pending += 1,
                },
                Err(err) => {
                    warn!(operator = %operator_id, invoice_id = %invoice_id, error = %err, "reconciliation attempt failed");
                    summary.failed += 1;
                }
            }
        }

        if summary.settled + summary.expired > 0 {
            info!(
                operator = %operator_id,
                settled = summary.settled,
                expired = summary.expired,
                "pending invoices reconciled"
            );
        }
        Ok(summary)
    }

    pub async fn get(&self, invoice_id: &str) -> Result<Invoice, AuthorityError> {
        let handle = self
            .find(invoice_id)
            .await
            .ok_or_else(|| AuthorityError::NotFound(format!("invoice '{invoice_id}'")))?;
        let invoice = handle.lock().await;
        Ok(invoice.clone())
    }

    async fn find(&self, invoice_id: &str) -> Option<Arc<Mutex<Invoice>>> {
        self.invoices.read().await.get(invoice_id).cloned()
    }

    async fn result(
        &self,
        invoice: &Invoice,
        credited: bool,
    ) -> Result<SettlementResult, AuthorityError> {
        let account = self.ledger.read(&invoice.operator_id).await?;
        Ok(SettlementResult {
            invoice_id: invoice.invoice_id.clone(),
            operator_id: invoice.operator_id.clone(),
            status: invoice.status,
            credited,
            balance: account.balance,
        })
    }

    /// Backend calls are bounded; a timeout is an upstream failure with no effect.
    async fn bounded<T>(
        &self,
        call: impl Future<Output = Result<T, AuthorityError>>,
    ) -> Result<T, AuthorityError> {
        match tokio::time::timeout(self.timeout, call).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(err @ AuthorityError::UpstreamUnavailable { .. })) => {
                warn!(backend = self.backend.name(), error = %err, "payment backend call failed");
                Err(err)
            }
            Ok(Err(err)) => Err(err),
            Err(_) => {
                warn!(backend = self.backend.name(), timeout_ms = self.timeout.as_millis() as u64, "payment backend call timed out");
                Err(AuthorityError::upstream(
                    self.backend.name(),
                    "request timed out",
                ))
            }
        }
    }
}

/// Persist an invoice transition with its account change, then publish both.
async fn commit_transition(
    store: Arc<dyn AccountStore>,
    (mut invoice, next_invoice): (OwnedMutexGuard<Invoice>, Invoice),
    (mut account, next_account): (OwnedMutexGuard<OperatorAccount>, OperatorAccount),
    credited: bool,
) -> Result<SettlementResult, AuthorityError> {
    commit_detached(async move {
        store
            .save_invoice_with_account(&next_invoice, &next_account)
            .await?;
        *account = next_account;
        *invoice = next_invoice;
        Ok(SettlementResult {
            invoice_id: invoice.invoice_id.clone(),
            operator_id: invoice.operator_id.clone(),
            status: invoice.status,
            credited,
            balance: account.balance,
        })
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryAccountStore;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[derive(Default)]
    struct ScriptedBackend {
        counter: AtomicUsize,
        status: std::sync::Mutex<HashMap<String, SettlementStatus>>,
        down: AtomicBool,
        hang: AtomicBool,
        status_calls: AtomicUsize,
    }

    impl ScriptedBackend {
        fn set(&self, invoice_id: &str, status: SettlementStatus) {
            self.status
                .lock()
                .unwrap()
                .insert(invoice_id.to_string(), status);
        }
    }

    #[async_trait]
    impl PaymentBackend for ScriptedBackend {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn create_invoice(
            &self,
            _operator_id: &str,
            _amount: u64,
        ) -> Result<InvoiceDescriptor, AuthorityError> {
            if self.down.load(Ordering::SeqCst) {
                return Err(AuthorityError::upstream("scripted", "down"));
            }
            let n = self.counter.fetch_add(1, Ordering::SeqCst);
            Ok(InvoiceDescriptor {
                invoice_id: format!("inv-{n}"),
                payment_descriptor: format!("https://pay.test/inv-{n}"),
            })
        }

        async fn get_settlement_status(
            &self,
            invoice_id: &str,
        ) -> Result<SettlementStatus, AuthorityError> {
            self.status_calls.fetch_add(1, Ordering::SeqCst);
            if self.hang.load(Ordering::SeqCst) {
                tokio::time::sleep(Duration::from_secs(30)).await;
            }
            if self.down.load(Ordering::SeqCst) {
                return Err(AuthorityError::upstream("scripted", "down"));
            }
            Ok(self
                .status
                .lock()
                .unwrap()
                .get(invoice_id)
                .copied()
                .unwrap_or(SettlementStatus::Pending))
        }
    }

    async fn fixture() -> (Arc<OperatorLedger>, Arc<ScriptedBackend>, InvoiceTracker) {
        let ledger = Arc::new(OperatorLedger::new(Arc::new(MemoryAccountStore::new())));
        ledger.register("op-a").await.unwrap();
        let backend = Arc::new(ScriptedBackend::default());
        let tracker = InvoiceTracker::new(
            ledger.clone(),
            backend.clone(),
            Duration::from_millis(200),
            Vec::new(),
        );
        (ledger, backend, tracker)
    }

    #[tokio::test]
    async fn open_invoice_tracks_pending_reference() {
        let (ledger, _backend, tracker) = fixture().await;
        let invoice = tracker.open_invoice("op-a", 1_000).await.unwrap();
        assert_eq!(invoice.status, InvoiceStatus::Pending);

        let account = ledger.read("op-a").await.unwrap();
        assert!(account.pending_invoices.contains(&invoice.invoice_id));
        assert_eq!(account.balance, 0);
    }

    #[tokio::test]
    async fn open_invoice_rejects_unknown_operator_and_zero_amount() {
        let (_ledger, backend, tracker) = fixture().await;
        assert!(matches!(
            tracker.open_invoice("op-z", 10).await,
            Err(AuthorityError::NotFound(_))
        ));
        assert!(matches!(
            tracker.open_invoice("op-a", 0).await,
            Err(AuthorityError::InvalidArgument(_))
        ));
        assert_eq!(backend.counter.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn settle_credits_exactly_once() {
        let (ledger, backend, tracker) = fixture().await;
        let invoice = tracker.open_invoice("op-a", 1_000).await.unwrap();

        let pending = tracker.settle(&invoice.invoice_id).await.unwrap();
        assert!(!pending.settled());
        assert_eq!(pending.balance, 0);

        backend.set(&invoice.invoice_id, SettlementStatus::Settled);
        let first = tracker.settle(&invoice.invoice_id).await.unwrap();
        let second = tracker.settle(&invoice.invoice_id).await.unwrap();
        assert!(first.credited && first.settled());
        assert!(!second.credited && second.settled());
        assert_eq!(second.balance, 1_000);

        let account = ledger.read("op-a").await.unwrap();
        assert_eq!(account.total_deposited, 1_000);
        assert!(account.pending_invoices.is_empty());
    }

    #[tokio::test]
    async fn dropped_settle_cannot_lose_a_committed_credit() {
        let store = Arc::new(MemoryAccountStore::new());
        let ledger = Arc::new(OperatorLedger::new(store.clone()));
        ledger.register("op-a").await.unwrap();
        let backend = Arc::new(ScriptedBackend::default());
        let tracker = InvoiceTracker::new(
            ledger.clone(),
            backend.clone(),
            Duration::from_millis(200),
            Vec::new(),
        );
        let invoice = tracker.open_invoice("op-a", 500).await.unwrap();
        backend.set(&invoice.invoice_id, SettlementStatus::Settled);

        // The write lands, but its acknowledgement arrives after the caller
        // has given up.
        store.set_ack_delay(Duration::from_millis(200));
        let dropped =
            tokio::time::timeout(Duration::from_millis(20), tracker.settle(&invoice.invoice_id))
                .await;
        assert!(dropped.is_err());
        store.set_ack_delay(Duration::ZERO);

        let again = tracker.settle(&invoice.invoice_id).await.unwrap();
        assert!(again.settled() && !again.credited);
        assert_eq!(again.balance, 500);

        ledger.debit("op-a", 10).await.unwrap();
        let stored = store.load().await.unwrap();
        assert_eq!(stored.accounts[0].balance, 490);
        assert_eq!(stored.accounts[0].total_deposited, 500);
        assert!(stored.accounts[0].pending_invoices.is_empty());
        assert_eq!(stored.invoices[0].status, InvoiceStatus::Settled);
    }

    #[tokio::test]
    async fn dropped_open_still_tracks_the_invoice() {
        let store = Arc::new(MemoryAccountStore::new());
        let ledger = Arc::new(OperatorLedger::new(store.clone()));
        ledger.register("op-a").await.unwrap();
        let backend = Arc::new(ScriptedBackend::default());
        let tracker = InvoiceTracker::new(
            ledger.clone(),
            backend.clone(),
            Duration::from_millis(200),
            Vec::new(),
        );

        store.set_ack_delay(Duration::from_millis(200));
        let dropped =
            tokio::time::timeout(Duration::from_millis(20), tracker.open_invoice("op-a", 300))
                .await;
        assert!(dropped.is_err());
        store.set_ack_delay(Duration::ZERO);

        let account = ledger.read("op-a").await.unwrap();
        assert!(account.pending_invoices.contains("inv-0"));
        assert_eq!(
            tracker.get("inv-0").await.unwrap().status,
            InvoiceStatus::Pending
        );
    }

    #[tokio::test]
    async fn concurrent_settles_credit_once() {
        let (ledger, backend, tracker) = fixture().await;
        let tracker = Arc::new(tracker);
        let invoice = tracker.open_invoice("op-a", 250).await.unwrap();
        backend.set(&invoice.invoice_id, SettlementStatus::Settled);

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let tracker = tracker.clone();
            let id = invoice.invoice_id.clone();
            tasks.push(tokio::spawn(async move { tracker.settle(&id).await.unwrap() }));
        }
        let mut credited = 0;
        for task in tasks {
            if task.await.unwrap().credited {
                credited += 1;
            }
        }
        assert_eq!(credited, 1);
        assert_eq!(ledger.read("op-a").await.unwrap().balance, 250);
    }

    #[tokio::test]
    async fn unreachable_backend_leaves_state_untouched() {
        let (ledger, backend, tracker) = fixture().await;
        let invoice = tracker.open_invoice("op-a", 100).await.unwrap();
        backend.set(&invoice.invoice_id, SettlementStatus::Settled);

        backend.down.store(true, Ordering::SeqCst);
        let err = tracker.settle(&invoice.invoice_id).await.unwrap_err();
        assert!(err.is_retryable());

        backend.down.store(false, Ordering::SeqCst);
        backend.hang.store(true, Ordering::SeqCst);
        let err = tracker.settle(&invoice.invoice_id).await.unwrap_err();
        assert!(matches!(err, AuthorityError::UpstreamUnavailable { .. }));

        assert_eq!(ledger.read("op-a").await.unwrap().balance, 0);
        assert_eq!(
            tracker.get(&invoice.invoice_id).await.unwrap().status,
            InvoiceStatus::Pending
        );
    }

    #[tokio::test]
    async fn reconcile_settles_and_expires_pending_invoices() {
        let (ledger, backend, tracker) = fixture().await;
        let paid = tracker.open_invoice("op-a", 300).await.unwrap();
        let lapsed = tracker.open_invoice("op-a", 500).await.unwrap();
        let waiting = tracker.open_invoice("op-a", 700).await.unwrap();
        backend.set(&paid.invoice_id, SettlementStatus::Settled);
        backend.set(&lapsed.invoice_id, SettlementStatus::Expired);

        let summary = tracker.reconcile_pending("op-a").await.unwrap();
        assert_eq!(summary.checked, 3);
        assert_eq!(summary.settled, 1);
        assert_eq!(summary.expired, 1);
        assert_eq!(summary.still_pending, 1);

        let account = ledger.read("op-a").await.unwrap();
        assert_eq!(account.balance, 300);
        assert_eq!(
            account.pending_invoices.iter().collect::<Vec<_>>(),
            vec![&waiting.invoice_id]
        );

        // Terminal invoices never go back to the backend.
        let calls = backend.status_calls.load(Ordering::SeqCst);
        tracker.settle(&lapsed.invoice_id).await.unwrap();
        assert_eq!(backend.status_calls.load(Ordering::SeqCst), calls);
    }

    #[tokio::test]
    async fn unknown_invoice_is_not_found() {
        let (_ledger, _backend, tracker) = fixture().await;
        assert!(matches!(
            tracker.settle("missing").await,
            Err(AuthorityError::NotFound(_))
        ));
    }
}
