use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::Duration;
use tollbooth_core::error::AuthorityError;
use tollbooth_core::invoice::{InvoiceDescriptor, PaymentBackend, SettlementStatus};
use tracing::debug;

const SERVICE: &str = "btcpay";

/// BTCPay Server store credentials.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BtcPayConfig {
    pub host: String,
    pub store_id: String,
    pub api_key: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GreenfieldInvoice {
    id: String,
    #[serde(default)]
    checkout_link: Option<String>,
    #[serde(default)]
    status: String,
}

/// Payment backend over the BTCPay Greenfield API, amounts in sats.
pub struct BtcPayBackend {
    client: Client,
    base_url: String,
    store_id: String,
    api_key: String,
}

impl BtcPayBackend {
    pub fn new(config: BtcPayConfig, timeout: Duration) -> Result<Self, AuthorityError> {
        if config.host.trim().is_empty() || config.store_id.trim().is_empty() {
            return Err(AuthorityError::invalid(
                "btcpay host and store id are required",
            ));
        }
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AuthorityError::Internal(format!("http client build failed: {e}")))?;

        Ok(Self {
            client,
            base_url: config.host.trim_end_matches('/').to_string(),
            store_id: config.store_id,
            api_key: config.api_key,
        })
    }

    fn invoices_url(&self) -> String {
        format!("{}/api/v1/stores/{}/invoices", self.base_url, self.store_id)
    }

    async fn read_invoice(
        &self,
        response: reqwest::Response,
    ) -> Result<GreenfieldInvoice, AuthorityError> {
        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(AuthorityError::NotFound("btcpay invoice".into()));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AuthorityError::upstream(
                SERVICE,
                format!("HTTP {}: {}", status.as_u16(), body),
            ));
        }
        response
            .json::<GreenfieldInvoice>()
            .await
            .map_err(|e| AuthorityError::upstream(SERVICE, format!("bad invoice body: {e}")))
    }
}

/// Greenfield invoice states folded into settlement outcomes.
pub fn map_greenfield_status(status: &str) -> SettlementStatus {
    match status {
        "Settled" | "Complete" | "Confirmed" => SettlementStatus::Settled,
        "Expired" | "Invalid" => SettlementStatus::Expired,
        _ => SettlementStatus::Pending,
    }
}

#[async_trait]
impl PaymentBackend for BtcPayBackend {
    fn name(&self) -> &str {
        SERVICE
    }

    async fn create_invoice(
        &self,
        operator_id: &str,
        amount: u64,
    ) -> Result<InvoiceDescriptor, AuthorityError> {
        let body = json!({
            "amount": amount.to_string(),
            "currency": "SATS",
            "metadata": { "operatorId": operator_id, "purpose": "tollbooth-prefund" },
        });
        let response = self
            .client
            .post(self.invoices_url())
            .header("Authorization", format!("token {}", self.api_key))
            .json(&body)
            .send()
            .await
            .map_err(|e| AuthorityError::upstream(SERVICE, e.to_string()))?;

        let invoice = self.read_invoice(response).await?;
        debug!(invoice_id = %invoice.id, operator = %operator_id, "btcpay invoice created");
        let payment_descriptor = invoice.checkout_link.unwrap_or_else(|| {
            format!("{}/i/{}", self.base_url, invoice.id)
        });
        Ok(InvoiceDescriptor {
            invoice_id: invoice.id,
            payment_descriptor,
        })
    }

    async fn get_settlement_status(
        &self,
        invoice_id: &str,
    ) -> Result<SettlementStatus, AuthorityError> {
        let response = self
            .client
            .get(format!("{}/{}", self.invoices_url(), invoice_id))
            .header("Authorization", format!("token {}", self.api_key))
            .send()
            .await
            .map_err(|e| AuthorityError::upstream(SERVICE, e.to_string()))?;

        let invoice = self.read_invoice(response).await?;
        Ok(map_greenfield_status(&invoice.status))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::Path;
    use axum::http::HeaderMap;
    use axum::routing::{get, post};
    use axum::{Json, Router};
    use serde_json::Value;

    async fn serve(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn backend(host: String) -> BtcPayBackend {
        BtcPayBackend::new(
            BtcPayConfig {
                host,
                store_id: "store-1".into(),
                api_key: "secret".into(),
            },
            Duration::from_secs(2),
        )
        .unwrap()
    }

    fn greenfield() -> Router {
        Router::new()
            .route(
                "/api/v1/stores/store-1/invoices",
                post(|headers: HeaderMap, Json(body): Json<Value>| async move {
                    assert_eq!(headers["authorization"], "token secret");
                    assert_eq!(body["currency"], "SATS");
                    Json(json!({
                        "id": format!("inv-{}", body["amount"].as_str().unwrap()),
                        "checkoutLink": "https://btcpay.test/i/abc",
                        "status": "New"
                    }))
                }),
            )
            .route(
                "/api/v1/stores/store-1/invoices/:id",
                get(|Path(id): Path<String>| async move {
                    let status = match id.as_str() {
                        "paid" => "Settled",
                        "late" => "Expired",
                        _ => "Processing",
                    };
                    Json(json!({ "id": id, "status": status }))
                }),
            )
    }

    #[tokio::test]
    async fn creates_invoices_and_maps_statuses() {
        let backend = backend(serve(greenfield()).await);

        let descriptor = backend.create_invoice("npub1op", 1_000).await.unwrap();
        assert_eq!(descriptor.invoice_id, "inv-1000");
        assert_eq!(descriptor.payment_descriptor, "https://btcpay.test/i/abc");

        assert_eq!(
            backend.get_settlement_status("paid").await.unwrap(),
            SettlementStatus::Settled
        );
        assert_eq!(
            backend.get_settlement_status("late").await.unwrap(),
            SettlementStatus::Expired
        );
        assert_eq!(
            backend.get_settlement_status("waiting").await.unwrap(),
            SettlementStatus::Pending
        );
    }

    #[tokio::test]
    async fn unreachable_server_is_an_upstream_failure() {
        // Bind and drop to get a port with nothing listening.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let backend = backend(format!("http://{addr}"));
        let err = backend.get_settlement_status("paid").await.unwrap_err();
        assert!(err.is_retryable());
    }

    #[test]
    fn status_mapping_and_config_validation() {
        assert_eq!(map_greenfield_status("Invalid"), SettlementStatus::Expired);
        assert_eq!(map_greenfield_status("New"), SettlementStatus::Pending);
        assert!(BtcPayBackend::new(
            BtcPayConfig {
                host: String::new(),
                store_id: "s".into(),
                api_key: "k".into(),
            },
            Duration::from_secs(1),
        )
        .is_err());
    }
}
