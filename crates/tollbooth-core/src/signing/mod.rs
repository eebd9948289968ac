//! Certificate signature schemes.
//!
//! Exactly one scheme is active per deployment. The issuer and verifier are
//! built from the same key material so they always agree.

mod jwt;
mod nostr;

pub use jwt::{EddsaJwtSigner, EddsaJwtVerifier};
pub use nostr::{NostrEvent, SchnorrNostrSigner, SchnorrNostrVerifier, CERTIFICATE_EVENT_KIND};

use crate::certificate::CertificateClaims;
use crate::error::AuthorityError;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SignatureScheme {
    /// Compact JWT signed with Ed25519.
    EddsaJwt,
    /// Nostr event signed with BIP-340 Schnorr over secp256k1.
    SchnorrNostr,
}

impl SignatureScheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::EddsaJwt => "eddsa-jwt",
            Self::SchnorrNostr => "schnorr-nostr",
        }
    }
}

impl fmt::Display for SignatureScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SignatureScheme {
    type Err = AuthorityError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "eddsa-jwt" | "eddsa" | "jwt" => Ok(Self::EddsaJwt),
            "schnorr-nostr" | "schnorr" | "nostr" => Ok(Self::SchnorrNostr),
            other => Err(AuthorityError::invalid(format!(
                "unknown signature scheme '{other}'"
            ))),
        }
    }
}

/// Turns canonical claims into a signed artifact.
pub trait ClaimSigner: Send + Sync {
    fn scheme(&self) -> SignatureScheme;

    /// Public key as lowercase hex.
    fn public_key_hex(&self) -> String;

    fn sign(&self, claims: &CertificateClaims) -> Result<String, AuthorityError>;
}

/// Recovers claims from a signed artifact, checking the signature only.
///
/// Expiry and replay are the caller's concern.
pub trait ClaimVerifier: Send + Sync {
    fn scheme(&self) -> SignatureScheme;

    fn verify(&self, artifact: &str) -> Result<CertificateClaims, AuthorityError>;
}

/// Matched signer and verifier for one deployment key.
#[derive(Clone)]
pub struct AuthorityKeys {
    pub signer: Arc<dyn ClaimSigner>,
    pub verifier: Arc<dyn ClaimVerifier>,
}

impl AuthorityKeys {
    pub fn from_secret_hex(
        scheme: SignatureScheme,
        secret_hex: &str,
    ) -> Result<Self, AuthorityError> {
        let secret = decode_secret(secret_hex)?;
        Self::from_secret_bytes(scheme, &secret)
    }

    pub fn from_secret_bytes(
        scheme: SignatureScheme,
        secret: &[u8; 32],
    ) -> Result<Self, AuthorityError> {
        match scheme {
            SignatureScheme::EddsaJwt => {
                let signer = EddsaJwtSigner::from_bytes(secret);
                let verifier = signer.verifier();
                Ok(Self {
                    signer: Arc::new(signer),
                    verifier: Arc::new(verifier),
                })
            }
            SignatureScheme::SchnorrNostr => {
                let signer = SchnorrNostrSigner::from_bytes(secret)?;
                let verifier = signer.verifier();
                Ok(Self {
                    signer: Arc::new(signer),
                    verifier: Arc::new(verifier),
                })
            }
        }
    }

    /// Fresh random key for `scheme`.
    pub fn generate(scheme: SignatureScheme) -> Result<(Self, String), AuthorityError> {
        // A uniformly random 32-byte string is almost never outside the
        // secp256k1 scalar range; retry on the rare miss.
        for _ in 0..8 {
            let mut secret = [0u8; 32];
            OsRng.fill_bytes(&mut secret);
            if let Ok(keys) = Self::from_secret_bytes(scheme, &secret) {
                return Ok((keys, hex::encode(secret)));
            }
        }
        Err(AuthorityError::Internal(
            "could not generate a valid signing key".into(),
        ))
    }

    pub fn scheme(&self) -> SignatureScheme {
        self.signer.scheme()
    }

    pub fn public_key_hex(&self) -> String {
        self.signer.public_key_hex()
    }
}

impl fmt::Debug for AuthorityKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthorityKeys")
            .field("scheme", &self.scheme())
            .field("public_key", &self.public_key_hex())
            .finish()
    }
}

fn decode_secret(secret_hex: &str) -> Result<[u8; 32], AuthorityError> {
    let bytes = hex::decode(secret_hex.trim())
        .map_err(|e| AuthorityError::invalid(format!("signing key is not hex: {e}")))?;
    bytes
        .as_slice()
        .try_into()
        .map_err(|_| AuthorityError::invalid("signing key must be 32 bytes"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scheme_names_parse() {
        assert_eq!(
            "eddsa-jwt".parse::<SignatureScheme>().unwrap(),
            SignatureScheme::EddsaJwt
        );
        assert_eq!(
            "Schnorr-Nostr".parse::<SignatureScheme>().unwrap(),
            SignatureScheme::SchnorrNostr
        );
        assert!("rsa".parse::<SignatureScheme>().is_err());
    }

    #[test]
    fn secret_must_be_32_hex_bytes() {
        assert!(AuthorityKeys::from_secret_hex(SignatureScheme::EddsaJwt, "zz").is_err());
        assert!(AuthorityKeys::from_secret_hex(SignatureScheme::EddsaJwt, "abcd").is_err());
        let ok = AuthorityKeys::from_secret_hex(SignatureScheme::EddsaJwt, &"11".repeat(32));
        assert_eq!(ok.unwrap().public_key_hex().len(), 64);
    }

    #[test]
    fn generated_keys_reload_from_their_secret() {
        for scheme in [SignatureScheme::EddsaJwt, SignatureScheme::SchnorrNostr] {
            let (keys, secret) = AuthorityKeys::generate(scheme).unwrap();
            let reloaded = AuthorityKeys::from_secret_hex(scheme, &secret).unwrap();
            assert_eq!(keys.public_key_hex(), reloaded.public_key_hex());
            assert_eq!(reloaded.scheme(), scheme);
        }
    }
}
