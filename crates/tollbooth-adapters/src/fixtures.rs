use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use tollbooth_core::error::AuthorityError;
use tollbooth_core::invoice::{InvoiceDescriptor, PaymentBackend, SettlementStatus};
use tollbooth_core::membership::{MemberRecord, MembershipRegistry};
use uuid::Uuid;

/// In-process payment backend whose invoices are settled by hand.
#[derive(Debug, Default)]
pub struct MockPaymentBackend {
    invoices: Mutex<HashMap<String, SettlementStatus>>,
    unreachable: AtomicBool,
    auto_settle: AtomicBool,
    status_queries: AtomicUsize,
}

impl MockPaymentBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every new invoice starts out settled. Used by the development server.
    pub fn auto_settling() -> Self {
        let backend = Self::default();
        backend.auto_settle.store(true, Ordering::SeqCst);
        backend
    }

    pub fn settle(&self, invoice_id: &str) {
        self.set_status(invoice_id, SettlementStatus::Settled);
    }

    pub fn expire(&self, invoice_id: &str) {
        self.set_status(invoice_id, SettlementStatus::Expired);
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    pub fn status_queries(&self) -> usize {
        self.status_queries.load(Ordering::SeqCst)
    }

    fn set_status(&self, invoice_id: &str, status: SettlementStatus) {
        if let Ok(mut invoices) = self.invoices.lock() {
            invoices.insert(invoice_id.to_string(), status);
        }
    }

    fn check_reachable(&self) -> Result<(), AuthorityError> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(AuthorityError::upstream("mock-payments", "backend offline"));
        }
        Ok(())
    }
}

#[async_trait]
impl PaymentBackend for MockPaymentBackend {
    fn name(&self) -> &str {
        "mock"
    }

    async fn create_invoice(
        &self,
        _operator_id: &str,
        amount: u64,
    ) -> Result<InvoiceDescriptor, AuthorityError> {
        self.check_reachable()?;
        let invoice_id = format!("mock-{}", Uuid::new_v4().simple());
        let initial = if self.auto_settle.load(Ordering::SeqCst) {
            SettlementStatus::Settled
        } else {
            SettlementStatus::Pending
        };
        self.set_status(&invoice_id, initial);
        Ok(InvoiceDescriptor {
            payment_descriptor: format!("lnmock{amount}1{invoice_id}"),
            invoice_id,
        })
    }

    async fn get_settlement_status(
        &self,
        invoice_id: &str,
    ) -> Result<SettlementStatus, AuthorityError> {
        self.status_queries.fetch_add(1, Ordering::SeqCst);
        self.check_reachable()?;
        let invoices = self
            .invoices
            .lock()
            .map_err(|_| AuthorityError::Internal("mock backend lock poisoned".into()))?;
        invoices
            .get(invoice_id)
            .copied()
            .ok_or_else(|| AuthorityError::NotFound(format!("mock invoice '{invoice_id}'")))
    }
}

/// Fixed allow-list that can be edited or taken offline at runtime.
#[derive(Debug, Default)]
pub struct StaticMembershipRegistry {
    members: Mutex<HashMap<String, String>>,
    unreachable: AtomicBool,
    fetches: AtomicUsize,
}

impl StaticMembershipRegistry {
    pub fn new<I, S>(active: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let registry = Self::default();
        for npub in active {
            registry.set_status(npub, "active");
        }
        registry
    }

    pub fn set_status(&self, npub: impl Into<String>, status: impl Into<String>) {
        if let Ok(mut members) = self.members.lock() {
            members.insert(npub.into(), status.into());
        }
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    pub fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MembershipRegistry for StaticMembershipRegistry {
    fn source(&self) -> &str {
        "static"
    }

    async fn fetch_members(&self) -> Result<Vec<MemberRecord>, AuthorityError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(AuthorityError::upstream("static-registry", "registry offline"));
        }
        let members = self
            .members
            .lock()
            .map_err(|_| AuthorityError::Internal("static registry lock poisoned".into()))?;
        Ok(members
            .iter()
            .map(|(npub, status)| MemberRecord {
                npub: npub.clone(),
                status: status.clone(),
            })
            .collect())
    }
}
