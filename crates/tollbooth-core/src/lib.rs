//! Tollbooth certification authority core.
//!
//! Operators pre-fund a fee balance through Lightning invoices and spend it to
//! obtain signed, short-lived, single-use purchase certificates. This crate
//! holds the ledger, the fee engine, the authority-wide supply counter, the
//! fail-closed membership gate and the certificate issuer/verifier, plus the
//! engine and typed router that tie them together.

#![deny(unsafe_code)]

pub mod certificate;
pub mod config;
pub mod error;
pub mod fee;
pub mod invoice;
pub mod ledger;
pub mod membership;
pub mod replay;
pub mod router;
pub mod runtime;
pub mod signing;
pub mod storage;
pub mod supply;

pub use certificate::{
    CertificateClaims, CertificateIssuer, CertificateVerifier, IssuedCertificate, DPYC_PROTOCOL,
};
pub use config::AuthorityConfig;
pub use error::{AuthorityError, ErrorKind};
pub use fee::{ChargedCertificate, FeeEngine, FeeSchedule};
pub use invoice::{
    Invoice, InvoiceDescriptor, InvoiceStatus, InvoiceTracker, PaymentBackend, ReconcileSummary,
    SettlementResult, SettlementStatus,
};
pub use ledger::{OperatorAccount, OperatorLedger};
pub use membership::{
    parse_member_list, MemberRecord, MembershipGate, MembershipRegistry, MembershipStatus,
};
pub use replay::{ReplayCheck, ReplayTracker};
pub use router::{AuthorityPayload, AuthorityRequest, AuthorityResponse, AuthorityRouter};
pub use runtime::{
    AuthorityCollaborators, AuthorityEngine, BalanceSummary, InvoiceReceipt, MembershipLookup,
    OperatorStatus, PaymentConfirmation, ServiceStatus, SupplySummary, SERVICE_NAME,
};
pub use signing::{AuthorityKeys, ClaimSigner, ClaimVerifier, SignatureScheme};
pub use storage::{
    connect_store, AccountStorageConfig, AccountStore, MemoryAccountStore, PostgresAccountStore,
    StoredState,
};
pub use supply::{SupplyLedger, SupplyMode, SupplyState};
