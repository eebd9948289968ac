use async_trait::async_trait;
use reqwest::Client;
use std::time::Duration;
use tollbooth_core::error::AuthorityError;
use tollbooth_core::membership::{parse_member_list, MemberRecord, MembershipRegistry};

const SERVICE: &str = "membership-registry";

/// Allow-list fetched as JSON over HTTP.
pub struct HttpMembershipRegistry {
    client: Client,
    url: String,
}

impl HttpMembershipRegistry {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, AuthorityError> {
        let url = url.into();
        if url.trim().is_empty() {
            return Err(AuthorityError::invalid("membership registry url is empty"));
        }
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AuthorityError::Internal(format!("http client build failed: {e}")))?;
        Ok(Self { client, url })
    }
}

#[async_trait]
impl MembershipRegistry for HttpMembershipRegistry {
    fn source(&self) -> &str {
        &self.url
    }

    async fn fetch_members(&self) -> Result<Vec<MemberRecord>, AuthorityError> {
        let response = self
            .client
            .get(&self.url)
            .send()
            .await
            .map_err(|e| AuthorityError::upstream(SERVICE, e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(AuthorityError::upstream(
                SERVICE,
                format!("HTTP {}", status.as_u16()),
            ));
        }

        let document = response
            .json::<serde_json::Value>()
            .await
            .map_err(|e| AuthorityError::upstream(SERVICE, format!("bad registry body: {e}")))?;
        parse_member_list(document)
    }
}
