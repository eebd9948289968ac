use super::{ClaimSigner, ClaimVerifier, SignatureScheme};
use crate::certificate::CertificateClaims;
use crate::error::AuthorityError;
use k256::schnorr::signature::hazmat::{PrehashSigner, PrehashVerifier};
use k256::schnorr::{Signature, SigningKey, VerifyingKey};
use serde::{Deserialize, Serialize};
use serde_json::json;
use sha2::{Digest, Sha256};

/// Parameterized replaceable event kind carrying a certificate.
pub const CERTIFICATE_EVENT_KIND: u32 = 30079;

const CERT_TOPIC: &str = "tollbooth-cert";
const CERT_LABEL: &str = "dpyc.tollbooth";

/// Signed Nostr event as it travels on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NostrEvent {
    pub id: String,
    pub pubkey: String,
    pub created_at: i64,
    pub kind: u32,
    pub tags: Vec<Vec<String>>,
    pub content: String,
    pub sig: String,
}

impl NostrEvent {
    /// SHA-256 over `[0, pubkey, created_at, kind, tags, content]`.
    pub fn compute_id(
        pubkey: &str,
        created_at: i64,
        kind: u32,
        tags: &[Vec<String>],
        content: &str,
    ) -> Result<[u8; 32], AuthorityError> {
        let canonical = serde_json::to_string(&json!([0, pubkey, created_at, kind, tags, content]))
            .map_err(|e| AuthorityError::Internal(format!("event serialization failed: {e}")))?;
        Ok(Sha256::digest(canonical.as_bytes()).into())
    }

    pub fn tag(&self, name: &str) -> Option<&str> {
        self.tags
            .iter()
            .find(|tag| tag.first().map(String::as_str) == Some(name))
            .and_then(|tag| tag.get(1))
            .map(String::as_str)
    }
}

/// Claim subset carried in the event content. Identifier and timing travel in
/// the tags and `created_at`.
#[derive(Debug, Serialize, Deserialize)]
struct EventContent {
    sub: String,
    amount_sats: u64,
    tax_paid_sats: u64,
    net_sats: i64,
    dpyc_protocol: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    authority_npub: Option<String>,
}

pub struct SchnorrNostrSigner {
    key: SigningKey,
    pubkey_hex: String,
}

impl SchnorrNostrSigner {
    pub fn from_bytes(secret: &[u8; 32]) -> Result<Self, AuthorityError> {
        let key = SigningKey::from_bytes(secret)
            .map_err(|_| AuthorityError::invalid("secret is not a valid secp256k1 scalar"))?;
        let pubkey_hex = hex::encode(key.verifying_key().to_bytes());
        Ok(Self { key, pubkey_hex })
    }

    pub fn verifier(&self) -> SchnorrNostrVerifier {
        SchnorrNostrVerifier {
            key: self.key.verifying_key().clone(),
            pubkey_hex: self.pubkey_hex.clone(),
        }
    }

    pub fn sign_event(&self, claims: &CertificateClaims) -> Result<NostrEvent, AuthorityError> {
        let content = serde_json::to_string(&EventContent {
            sub: claims.sub.clone(),
            amount_sats: claims.amount_sats,
            tax_paid_sats: claims.tax_paid_sats,
            net_sats: claims.net_sats,
            dpyc_protocol: claims.dpyc_protocol.clone(),
            authority_npub: claims.authority_npub.clone(),
        })
        .map_err(|e| AuthorityError::Internal(format!("event content encoding failed: {e}")))?;

        let tags = vec![
            vec!["d".to_string(), claims.jti.clone()],
            vec!["p".to_string(), claims.sub.clone()],
            vec!["t".to_string(), CERT_TOPIC.to_string()],
            vec!["L".to_string(), CERT_LABEL.to_string()],
            vec!["expiration".to_string(), claims.exp.to_string()],
        ];

        let id = NostrEvent::compute_id(
            &self.pubkey_hex,
            claims.iat,
            CERTIFICATE_EVENT_KIND,
            &tags,
            &content,
        )?;
        let signature: Signature = self
            .key
            .sign_prehash(&id)
            .map_err(|e| AuthorityError::Internal(format!("schnorr signing failed: {e}")))?;

        Ok(NostrEvent {
            id: hex::encode(id),
            pubkey: self.pubkey_hex.clone(),
            created_at: claims.iat,
            kind: CERTIFICATE_EVENT_KIND,
            tags,
            content,
            sig: hex::encode(signature.to_bytes()),
        })
    }
}

impl ClaimSigner for SchnorrNostrSigner {
    fn scheme(&self) -> SignatureScheme {
        SignatureScheme::SchnorrNostr
    }

    fn public_key_hex(&self) -> String {
        self.pubkey_hex.clone()
    }

    fn sign(&self, claims: &CertificateClaims) -> Result<String, AuthorityError> {
        let event = self.sign_event(claims)?;
        serde_json::to_string(&event)
            .map_err(|e| AuthorityError::Internal(format!("event encoding failed: {e}")))
    }
}

pub struct SchnorrNostrVerifier {
    key: VerifyingKey,
    pubkey_hex: String,
}

impl SchnorrNostrVerifier {
    pub fn from_public_hex(public_hex: &str) -> Result<Self, AuthorityError> {
        let bytes = hex::decode(public_hex)
            .map_err(|e| AuthorityError::invalid(format!("public key is not hex: {e}")))?;
        let key = VerifyingKey::from_bytes(&bytes)
            .map_err(|_| AuthorityError::invalid("not an x-only secp256k1 public key"))?;
        Ok(Self {
            key,
            pubkey_hex: public_hex.to_ascii_lowercase(),
        })
    }
}

impl ClaimVerifier for SchnorrNostrVerifier {
    fn scheme(&self) -> SignatureScheme {
        SignatureScheme::SchnorrNostr
    }

    fn verify(&self, artifact: &str) -> Result<CertificateClaims, AuthorityError> {
        let event: NostrEvent = serde_json::from_str(artifact)
            .map_err(|e| reject(format!("artifact is not a Nostr event: {e}")))?;

        if event.kind != CERTIFICATE_EVENT_KIND {
            return Err(reject(format!("unexpected event kind {}", event.kind)));
        }
        if !event.pubkey.eq_ignore_ascii_case(&self.pubkey_hex) {
            return Err(reject("event was not signed by this authority"));
        }

        let id = NostrEvent::compute_id(
            &event.pubkey,
            event.created_at,
            event.kind,
            &event.tags,
            &event.content,
        )?;
        if hex::encode(id) != event.id.to_ascii_lowercase() {
            return Err(reject("event id does not match its contents"));
        }

        let signature = hex::decode(&event.sig)
            .ok()
            .and_then(|bytes| Signature::try_from(bytes.as_slice()).ok())
            .ok_or_else(|| reject("malformed schnorr signature"))?;
        self.key
            .verify_prehash(&id, &signature)
            .map_err(|_| reject("signature does not match authority key"))?;

        let content: EventContent = serde_json::from_str(&event.content)
            .map_err(|e| reject(format!("event content is not a claim: {e}")))?;
        let jti = event
            .tag("d")
            .ok_or_else(|| reject("event has no certificate identifier"))?
            .to_string();
        let exp = event
            .tag("expiration")
            .and_then(|value| value.parse::<i64>().ok())
            .ok_or_else(|| reject("event has no valid expiration"))?;

        Ok(CertificateClaims {
            jti,
            sub: content.sub,
            iat: event.created_at,
            exp,
            amount_sats: content.amount_sats,
            tax_paid_sats: content.tax_paid_sats,
            net_sats: content.net_sats,
            dpyc_protocol: content.dpyc_protocol,
            authority_npub: content.authority_npub,
        })
    }
}

fn reject(message: impl Into<String>) -> AuthorityError {
    AuthorityError::AuthenticationFailure(message.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn claims() -> CertificateClaims {
        CertificateClaims {
            jti: "0b9e5f3a-8c1d-4f2e-b7a6-9d8c7b6a5f4e".into(),
            sub: "npub1operator".into(),
            iat: 1_700_000_000,
            exp: 1_700_000_600,
            amount_sats: 100,
            tax_paid_sats: 10,
            net_sats: 90,
            dpyc_protocol: crate::certificate::DPYC_PROTOCOL.into(),
            authority_npub: Some("npub1authority".into()),
        }
    }

    fn signer() -> SchnorrNostrSigner {
        SchnorrNostrSigner::from_bytes(&[3u8; 32]).unwrap()
    }

    #[test]
    fn event_round_trips_claims() {
        let signer = signer();
        let artifact = signer.sign(&claims()).unwrap();
        assert_eq!(signer.verifier().verify(&artifact).unwrap(), claims());

        let event: NostrEvent = serde_json::from_str(&artifact).unwrap();
        assert_eq!(event.kind, CERTIFICATE_EVENT_KIND);
        assert_eq!(event.tag("d"), Some(claims().jti.as_str()));
        assert_eq!(event.tag("p"), Some("npub1operator"));
        assert_eq!(event.tag("t"), Some(CERT_TOPIC));
        assert_eq!(event.tag("L"), Some(CERT_LABEL));
        assert_eq!(event.tag("expiration"), Some("1700000600"));
        assert_eq!(event.pubkey.len(), 64);
        assert_eq!(event.sig.len(), 128);
    }

    #[test]
    fn edited_content_breaks_the_event_id() {
        let signer = signer();
        let mut event = signer.sign_event(&claims()).unwrap();
        event.content = event.content.replace("\"amount_sats\":100", "\"amount_sats\":900");
        let artifact = serde_json::to_string(&event).unwrap();
        assert!(matches!(
            signer.verifier().verify(&artifact),
            Err(AuthorityError::AuthenticationFailure(_))
        ));
    }

    #[test]
    fn recomputed_id_without_valid_signature_is_rejected() {
        let signer = signer();
        let mut event = signer.sign_event(&claims()).unwrap();
        event.tags[4][1] = "1800000000".into();
        let id = NostrEvent::compute_id(
            &event.pubkey,
            event.created_at,
            event.kind,
            &event.tags,
            &event.content,
        )
        .unwrap();
        event.id = hex::encode(id);
        let artifact = serde_json::to_string(&event).unwrap();
        assert!(matches!(
            signer.verifier().verify(&artifact),
            Err(AuthorityError::AuthenticationFailure(_))
        ));
    }

    #[test]
    fn foreign_authority_is_rejected() {
        let artifact = signer().sign(&claims()).unwrap();
        let other = SchnorrNostrSigner::from_bytes(&[4u8; 32]).unwrap();
        assert!(other.verifier().verify(&artifact).is_err());

        let by_hex = SchnorrNostrVerifier::from_public_hex(&signer().public_key_hex()).unwrap();
        assert!(by_hex.verify(&artifact).is_ok());
    }
}
