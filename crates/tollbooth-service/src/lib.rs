//! HTTP surface for the Tollbooth certification authority.

pub mod config;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tollbooth_adapters::{
    BtcPayBackend, HttpMembershipRegistry, MockPaymentBackend,
};
use tollbooth_core::{
    connect_store, AuthorityCollaborators, AuthorityConfig, AuthorityEngine, AuthorityError,
    AuthorityKeys, AuthorityRequest, AuthorityResponse, AuthorityRouter, BalanceSummary,
    CertificateClaims, ChargedCertificate, ErrorKind, InvoiceReceipt, MembershipLookup,
    MembershipRegistry, OperatorStatus, PaymentBackend, PaymentConfirmation, ReconcileSummary,
    ServiceStatus, SupplySummary, SERVICE_NAME,
};
use tower_http::trace::TraceLayer;
use tracing::warn;

pub use config::ServiceConfig;
use config::PaymentConfig;

#[derive(Clone)]
pub struct ServiceState {
    pub engine: Arc<AuthorityEngine>,
    pub router: AuthorityRouter,
}

impl ServiceState {
    /// Wire collaborators from configuration and hydrate the engine.
    pub async fn bootstrap(config: &ServiceConfig) -> Result<Self, AuthorityError> {
        let authority = config.authority.clone();
        let timeout = authority.upstream_timeout();

        let keys = match &config.signing.secret_key_hex {
            Some(secret) => AuthorityKeys::from_secret_hex(config.signing.scheme, secret)?,
            None => {
                let (keys, _) = AuthorityKeys::generate(config.signing.scheme)?;
                warn!(
                    public_key = %keys.public_key_hex(),
                    "no signing key configured; using an ephemeral key"
                );
                keys
            }
        };

        let store = connect_store(&config.storage.to_account_storage()).await?;

        let payment: Arc<dyn PaymentBackend> = match &config.payment {
            PaymentConfig::Mock => {
                warn!("mock payment backend settles every invoice immediately");
                Arc::new(MockPaymentBackend::auto_settling())
            }
            PaymentConfig::Btcpay(btcpay) => Arc::new(BtcPayBackend::new(btcpay.clone(), timeout)?),
        };

        let registry = match &config.membership.registry_url {
            Some(url) => Some(
                Arc::new(HttpMembershipRegistry::new(url.clone(), timeout)?)
                    as Arc<dyn MembershipRegistry>,
            ),
            None => None,
        };

        Self::with_collaborators(
            authority,
            keys,
            AuthorityCollaborators {
                store,
                payment,
                registry,
            },
        )
        .await
    }

    pub async fn with_collaborators(
        authority: AuthorityConfig,
        keys: AuthorityKeys,
        collaborators: AuthorityCollaborators,
    ) -> Result<Self, AuthorityError> {
        let engine = Arc::new(AuthorityEngine::bootstrap(authority, keys, collaborators).await?);
        Ok(Self::from_engine(engine))
    }

    pub fn from_engine(engine: Arc<AuthorityEngine>) -> Self {
        Self {
            router: AuthorityRouter::new(engine.clone()),
            engine,
        }
    }
}

pub fn build_router(state: ServiceState) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/status", get(service_status))
        .route("/v1/operators", post(register_operator))
        .route("/v1/operators/:operator_id/balance", get(get_balance))
        .route("/v1/operators/:operator_id/status", get(get_status))
        .route("/v1/operators/:operator_id/invoices", post(open_invoice))
        .route("/v1/operators/:operator_id/reconcile", post(reconcile))
        .route("/v1/invoices/:invoice_id/confirm", post(confirm_payment))
        .route("/v1/certify", post(certify))
        .route("/v1/certificates/verify", post(verify_certificate))
        .route("/v1/supply", get(supply_status))
        .route("/v1/supply/replenish", post(replenish_supply))
        .route("/v1/membership/refresh", post(refresh_membership))
        .route("/v1/membership/:subject", get(lookup_membership))
        .route("/v1/dispatch", post(dispatch))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// HTTP status for each error kind.
pub fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::InvalidArgument => StatusCode::BAD_REQUEST,
        ErrorKind::InsufficientFunds => StatusCode::PAYMENT_REQUIRED,
        ErrorKind::SupplyExhausted | ErrorKind::ReplayDetected => StatusCode::CONFLICT,
        ErrorKind::MembershipDenied | ErrorKind::PermissionDenied => StatusCode::FORBIDDEN,
        ErrorKind::AuthenticationFailure => StatusCode::UNAUTHORIZED,
        ErrorKind::Expired => StatusCode::GONE,
        ErrorKind::UpstreamUnavailable => StatusCode::SERVICE_UNAVAILABLE,
        ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Authority(#[from] AuthorityError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::Authority(err) => {
                let kind = err.kind();
                if kind == ErrorKind::Internal {
                    warn!(error = %err, "request failed");
                }
                (
                    status_for(kind),
                    Json(serde_json::json!({
                        "error": kind.as_str(),
                        "message": err.to_string(),
                    })),
                )
                    .into_response()
            }
        }
    }
}

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    status: &'static str,
    service: &'static str,
    storage_backend: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RegisterRequest {
    pub operator_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InvoiceRequest {
    pub amount: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CertifyRequest {
    pub operator_id: String,
    pub amount: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VerifyRequest {
    pub certificate: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReplenishRequest {
    pub amount: u64,
    pub caller_identity: String,
}

async fn health(State(state): State<ServiceState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        service: SERVICE_NAME,
        storage_backend: state.engine.storage_backend().to_string(),
    })
}

async fn service_status(
    State(state): State<ServiceState>,
) -> Result<Json<ServiceStatus>, ApiError> {
    Ok(Json(state.engine.service_status().await?))
}

async fn register_operator(
    State(state): State<ServiceState>,
    Json(request): Json<RegisterRequest>,
) -> Result<(StatusCode, Json<BalanceSummary>), ApiError> {
    let summary = state.engine.register_operator(&request.operator_id).await?;
    Ok((StatusCode::CREATED, Json(summary)))
}

async fn get_balance(
    State(state): State<ServiceState>,
    Path(operator_id): Path<String>,
) -> Result<Json<BalanceSummary>, ApiError> {
    Ok(Json(state.engine.get_balance(&operator_id).await?))
}

async fn get_status(
    State(state): State<ServiceState>,
    Path(operator_id): Path<String>,
) -> Result<Json<OperatorStatus>, ApiError> {
    Ok(Json(state.engine.get_status(&operator_id).await?))
}

async fn open_invoice(
    State(state): State<ServiceState>,
    Path(operator_id): Path<String>,
    Json(request): Json<InvoiceRequest>,
) -> Result<(StatusCode, Json<InvoiceReceipt>), ApiError> {
    let receipt = state
        .engine
        .open_credit_invoice(&operator_id, request.amount)
        .await?;
    Ok((StatusCode::CREATED, Json(receipt)))
}

async fn reconcile(
    State(state): State<ServiceState>,
    Path(operator_id): Path<String>,
) -> Result<Json<ReconcileSummary>, ApiError> {
    Ok(Json(state.engine.reconcile_pending(&operator_id).await?))
}

async fn confirm_payment(
    State(state): State<ServiceState>,
    Path(invoice_id): Path<String>,
) -> Result<Json<PaymentConfirmation>, ApiError> {
    Ok(Json(state.engine.confirm_payment(&invoice_id).await?))
}

async fn certify(
    State(state): State<ServiceState>,
    Json(request): Json<CertifyRequest>,
) -> Result<Json<ChargedCertificate>, ApiError> {
    Ok(Json(
        state
            .engine
            .certify(&request.operator_id, request.amount)
            .await?,
    ))
}

async fn verify_certificate(
    State(state): State<ServiceState>,
    Json(request): Json<VerifyRequest>,
) -> Result<Json<CertificateClaims>, ApiError> {
    Ok(Json(
        state.engine.verify_certificate(&request.certificate).await?,
    ))
}

async fn supply_status(State(state): State<ServiceState>) -> Json<SupplySummary> {
    Json(state.engine.supply_status().await)
}

async fn replenish_supply(
    State(state): State<ServiceState>,
    Json(request): Json<ReplenishRequest>,
) -> Result<Json<SupplySummary>, ApiError> {
    Ok(Json(
        state
            .engine
            .replenish_supply(request.amount, &request.caller_identity)
            .await?,
    ))
}

async fn lookup_membership(
    State(state): State<ServiceState>,
    Path(subject): Path<String>,
) -> Result<Json<MembershipLookup>, ApiError> {
    Ok(Json(state.engine.lookup_membership(&subject).await?))
}

async fn refresh_membership(State(state): State<ServiceState>) -> StatusCode {
    state.engine.invalidate_membership().await;
    StatusCode::NO_CONTENT
}

async fn dispatch(
    State(state): State<ServiceState>,
    Json(request): Json<AuthorityRequest>,
) -> (StatusCode, Json<AuthorityResponse>) {
    let response = state.router.dispatch(request).await;
    let status = response
        .error_kind()
        .map(status_for)
        .unwrap_or(StatusCode::OK);
    (status, Json(response))
}
