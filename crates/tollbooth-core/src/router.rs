use crate::certificate::CertificateClaims;
use crate::error::{AuthorityError, ErrorKind};
use crate::fee::ChargedCertificate;
use crate::invoice::ReconcileSummary;
use crate::runtime::{
    AuthorityEngine, BalanceSummary, InvoiceReceipt, MembershipLookup, OperatorStatus,
    PaymentConfirmation, ServiceStatus, SupplySummary,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// One authority operation with its arguments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "operation", rename_all = "snake_case")]
pub enum AuthorityRequest {
    RegisterOperator { operator_id: String },
    OpenCreditInvoice { operator_id: String, amount: u64 },
    ConfirmPayment { invoice_id: String },
    GetBalance { operator_id: String },
    GetStatus { operator_id: String },
    Certify { operator_id: String, amount: u64 },
    VerifyCertificate { certificate: String },
    ReplenishSupply { amount: u64, caller_identity: String },
    LookupMembership { subject: String },
    ReconcilePending { operator_id: String },
    ServiceStatus,
}

impl AuthorityRequest {
    pub fn operation(&self) -> &'static str {
        match self {
            Self::RegisterOperator { .. } => "register_operator",
            Self::OpenCreditInvoice { .. } => "open_credit_invoice",
            Self::ConfirmPayment { .. } => "confirm_payment",
            Self::GetBalance { .. } => "get_balance",
            Self::GetStatus { .. } => "get_status",
            Self::Certify { .. } => "certify",
            Self::VerifyCertificate { .. } => "verify_certificate",
            Self::ReplenishSupply { .. } => "replenish_supply",
            Self::LookupMembership { .. } => "lookup_membership",
            Self::ReconcilePending { .. } => "reconcile_pending",
            Self::ServiceStatus => "service_status",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuthorityPayload {
    Balance(BalanceSummary),
    Invoice(InvoiceReceipt),
    Payment(PaymentConfirmation),
    Status(OperatorStatus),
    Certificate(ChargedCertificate),
    Claims(CertificateClaims),
    Supply(SupplySummary),
    Membership(MembershipLookup),
    Reconciled(ReconcileSummary),
    Service(ServiceStatus),
}

/// Outcome of a dispatched request: a payload or a typed error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum AuthorityResponse {
    Ok {
        operation: String,
        result: AuthorityPayload,
    },
    Err {
        operation: String,
        error: ErrorKind,
        message: String,
        retryable: bool,
    },
}

impl AuthorityResponse {
    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ok { .. })
    }

    pub fn error_kind(&self) -> Option<ErrorKind> {
        match self {
            Self::Ok { .. } => None,
            Self::Err { error, .. } => Some(*error),
        }
    }

    fn from_result(operation: &str, result: Result<AuthorityPayload, AuthorityError>) -> Self {
        match result {
            Ok(result) => Self::Ok {
                operation: operation.to_string(),
                result,
            },
            Err(err) => Self::Err {
                operation: operation.to_string(),
                error: err.kind(),
                message: err.to_string(),
                retryable: err.is_retryable(),
            },
        }
    }
}

/// Explicit request -> engine method table.
#[derive(Clone)]
pub struct AuthorityRouter {
    engine: Arc<AuthorityEngine>,
}

impl AuthorityRouter {
    pub fn new(engine: Arc<AuthorityEngine>) -> Self {
        Self { engine }
    }

    pub fn engine(&self) -> &Arc<AuthorityEngine> {
        &self.engine
    }

    pub async fn dispatch(&self, request: AuthorityRequest) -> AuthorityResponse {
        let operation = request.operation();
        let engine = &self.engine;
        let result = match request {
            AuthorityRequest::RegisterOperator { operator_id } => engine
                .register_operator(&operator_id)
                .await
                .map(AuthorityPayload::Balance),
            AuthorityRequest::OpenCreditInvoice {
                operator_id,
                amount,
            } => engine
                .open_credit_invoice(&operator_id, amount)
                .await
                .map(AuthorityPayload::Invoice),
            AuthorityRequest::ConfirmPayment { invoice_id } => engine
                .confirm_payment(&invoice_id)
                .await
                .map(AuthorityPayload::Payment),
            AuthorityRequest::GetBalance { operator_id } => engine
                .get_balance(&operator_id)
                .await
                .map(AuthorityPayload::Balance),
            AuthorityRequest::GetStatus { operator_id } => engine
                .get_status(&operator_id)
                .await
                .map(AuthorityPayload::Status),
            AuthorityRequest::Certify {
                operator_id,
                amount,
            } => engine
                .certify(&operator_id, amount)
                .await
                .map(AuthorityPayload::Certificate),
            AuthorityRequest::VerifyCertificate { certificate } => engine
                .verify_certificate(&certificate)
                .await
                .map(AuthorityPayload::Claims),
            AuthorityRequest::ReplenishSupply {
                amount,
                caller_identity,
            } => engine
                .replenish_supply(amount, &caller_identity)
                .await
                .map(AuthorityPayload::Supply),
            AuthorityRequest::LookupMembership { subject } => engine
                .lookup_membership(&subject)
                .await
                .map(AuthorityPayload::Membership),
            AuthorityRequest::ReconcilePending { operator_id } => engine
                .reconcile_pending(&operator_id)
                .await
                .map(AuthorityPayload::Reconciled),
            AuthorityRequest::ServiceStatus => engine
                .service_status()
                .await
                .map(AuthorityPayload::Service),
        };
        AuthorityResponse::from_result(operation, result)
    }
}
