use crate::error::AuthorityError;
use crate::replay::{ReplayCheck, ReplayTracker};
use crate::signing::{ClaimSigner, ClaimVerifier, SignatureScheme};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

/// Protocol tag carried by every certificate.
pub const DPYC_PROTOCOL: &str = "dpyp-01-base-certificate";

/// Canonical claim set signed by the authority.
///
/// Times are unix seconds. `net_sats` is `amount_sats - tax_paid_sats` and is
/// negative when the minimum fee exceeds the certified amount.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertificateClaims {
    pub jti: String,
    pub sub: String,
    pub iat: i64,
    pub exp: i64,
    pub amount_sats: u64,
    pub tax_paid_sats: u64,
    pub net_sats: i64,
    pub dpyc_protocol: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authority_npub: Option<String>,
}

impl CertificateClaims {
    pub fn expires_at(&self) -> Result<DateTime<Utc>, AuthorityError> {
        DateTime::from_timestamp(self.exp, 0)
            .ok_or_else(|| AuthorityError::AuthenticationFailure("expiry out of range".into()))
    }

    pub fn issued_at(&self) -> Result<DateTime<Utc>, AuthorityError> {
        DateTime::from_timestamp(self.iat, 0)
            .ok_or_else(|| AuthorityError::AuthenticationFailure("issue time out of range".into()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssuedCertificate {
    /// Signed artifact: a compact JWT or a JSON-encoded Nostr event.
    pub certificate: String,
    pub scheme: SignatureScheme,
    pub claims: CertificateClaims,
}

pub struct CertificateIssuer {
    signer: Arc<dyn ClaimSigner>,
    replay: Arc<ReplayTracker>,
    ttl: Duration,
    authority_id: Option<String>,
}

impl CertificateIssuer {
    pub fn new(
        signer: Arc<dyn ClaimSigner>,
        replay: Arc<ReplayTracker>,
        ttl: Duration,
        authority_id: Option<String>,
    ) -> Self {
        Self {
            signer,
            replay,
            ttl,
            authority_id: authority_id.filter(|id| !id.is_empty()),
        }
    }

    pub fn scheme(&self) -> SignatureScheme {
        self.signer.scheme()
    }

    pub fn public_key_hex(&self) -> String {
        self.signer.public_key_hex()
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Mint and sign a certificate, then register its identifier.
    pub fn issue(
        &self,
        operator_id: &str,
        amount: u64,
        fee: u64,
    ) -> Result<IssuedCertificate, AuthorityError> {
        let net = i128::from(amount) - i128::from(fee);
        let net_sats = i64::try_from(net)
            .map_err(|_| AuthorityError::invalid(format!("amount {amount} is out of range")))?;

        let now = Utc::now();
        let iat = now.timestamp();
        // Range failures here are configuration faults, not bad signatures.
        let exp = iat
            .checked_add(self.ttl.num_seconds())
            .and_then(|exp| DateTime::from_timestamp(exp, 0))
            .ok_or_else(|| AuthorityError::Internal("certificate expiry out of range".into()))?;
        let claims = CertificateClaims {
            jti: Uuid::new_v4().to_string(),
            sub: operator_id.to_string(),
            iat,
            exp: exp.timestamp(),
            amount_sats: amount,
            tax_paid_sats: fee,
            net_sats,
            dpyc_protocol: DPYC_PROTOCOL.to_string(),
            authority_npub: self.authority_id.clone(),
        };

        let certificate = self.signer.sign(&claims)?;
        self.replay.record(&claims.jti, exp)?;
        debug!(certificate_id = %claims.jti, operator = %operator_id, "certificate signed");

        Ok(IssuedCertificate {
            certificate,
            scheme: self.signer.scheme(),
            claims,
        })
    }
}

pub struct CertificateVerifier {
    verifier: Arc<dyn ClaimVerifier>,
    replay: Arc<ReplayTracker>,
}

impl CertificateVerifier {
    pub fn new(verifier: Arc<dyn ClaimVerifier>, replay: Arc<ReplayTracker>) -> Self {
        Self { verifier, replay }
    }

    pub fn verify(&self, artifact: &str) -> Result<CertificateClaims, AuthorityError> {
        self.verify_at(artifact, Utc::now())
    }

    /// Signature, then expiry, then replay. An expired certificate is reported
    /// as `Expired` even if it was presented before.
    pub fn verify_at(
        &self,
        artifact: &str,
        now: DateTime<Utc>,
    ) -> Result<CertificateClaims, AuthorityError> {
        let claims = self.verifier.verify(artifact)?;

        let expires_at = claims.expires_at()?;
        if now > expires_at {
            return Err(AuthorityError::Expired {
                id: claims.jti,
                expired_at: claims.exp,
            });
        }

        match self.replay.check_and_mark(&claims.jti, expires_at, now)? {
            ReplayCheck::Fresh => Ok(claims),
            ReplayCheck::Replay => {
                warn!(certificate_id = %claims.jti, operator = %claims.sub, "certificate replay rejected");
                Err(AuthorityError::ReplayDetected(claims.jti))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signing::AuthorityKeys;
    use std::collections::HashSet;

    fn pair(scheme: SignatureScheme) -> (CertificateIssuer, CertificateVerifier, Arc<ReplayTracker>) {
        let keys = AuthorityKeys::from_secret_bytes(scheme, &[21u8; 32]).unwrap();
        let replay = Arc::new(ReplayTracker::new());
        (
            CertificateIssuer::new(
                keys.signer.clone(),
                replay.clone(),
                Duration::seconds(600),
                Some("npub1authority".into()),
            ),
            CertificateVerifier::new(keys.verifier.clone(), replay.clone()),
            replay,
        )
    }

    #[test]
    fn issued_certificate_verifies_once_per_scheme() {
        for scheme in [SignatureScheme::EddsaJwt, SignatureScheme::SchnorrNostr] {
            let (issuer, verifier, _) = pair(scheme);
            let issued = issuer.issue("npub1op", 1_000, 20).unwrap();
            assert_eq!(issued.scheme, scheme);
            assert_eq!(issued.claims.exp - issued.claims.iat, 600);
            assert_eq!(issued.claims.net_sats, 980);

            let claims = verifier.verify(&issued.certificate).unwrap();
            assert_eq!(claims, issued.claims);

            assert!(matches!(
                verifier.verify(&issued.certificate),
                Err(AuthorityError::ReplayDetected(id)) if id == issued.claims.jti
            ));
        }
    }

    #[test]
    fn expired_certificate_is_expired_not_replay() {
        let (issuer, verifier, _) = pair(SignatureScheme::EddsaJwt);
        let issued = issuer.issue("npub1op", 100, 10).unwrap();
        verifier.verify(&issued.certificate).unwrap();

        let later = Utc::now() + Duration::seconds(601);
        assert!(matches!(
            verifier.verify_at(&issued.certificate, later),
            Err(AuthorityError::Expired { .. })
        ));

        let fresh = issuer.issue("npub1op", 100, 10).unwrap();
        assert!(matches!(
            verifier.verify_at(&fresh.certificate, later),
            Err(AuthorityError::Expired { .. })
        ));
    }

    #[test]
    fn minimum_fee_can_make_net_negative() {
        let (issuer, _, _) = pair(SignatureScheme::SchnorrNostr);
        let issued = issuer.issue("npub1op", 5, 10).unwrap();
        assert_eq!(issued.claims.net_sats, -5);
    }

    #[test]
    fn identifiers_are_unique_and_recorded() {
        let (issuer, _, replay) = pair(SignatureScheme::EddsaJwt);
        let ids: HashSet<String> = (0..100)
            .map(|_| issuer.issue("npub1op", 100, 10).unwrap().claims.jti)
            .collect();
        assert_eq!(ids.len(), 100);
        assert_eq!(replay.len().unwrap(), 100);
    }

    #[test]
    fn unrepresentable_lifetime_is_an_internal_fault() {
        let keys = AuthorityKeys::from_secret_bytes(SignatureScheme::EddsaJwt, &[21u8; 32]).unwrap();
        let replay = Arc::new(ReplayTracker::new());
        let issuer = CertificateIssuer::new(
            keys.signer,
            replay.clone(),
            Duration::seconds(10_000_000_000_000),
            None,
        );
        assert!(matches!(
            issuer.issue("npub1op", 100, 10),
            Err(AuthorityError::Internal(_))
        ));
        assert!(replay.is_empty().unwrap());
    }

    #[test]
    fn certificate_from_another_key_fails_authentication() {
        let (issuer, _, _) = pair(SignatureScheme::EddsaJwt);
        let issued = issuer.issue("npub1op", 100, 10).unwrap();

        let other = AuthorityKeys::from_secret_bytes(SignatureScheme::EddsaJwt, &[22u8; 32]).unwrap();
        let verifier = CertificateVerifier::new(other.verifier, Arc::new(ReplayTracker::new()));
        assert!(matches!(
            verifier.verify(&issued.certificate),
            Err(AuthorityError::AuthenticationFailure(_))
        ));
    }
}
