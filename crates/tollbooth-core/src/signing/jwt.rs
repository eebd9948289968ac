use super::{ClaimSigner, ClaimVerifier, SignatureScheme};
use crate::certificate::CertificateClaims;
use crate::error::AuthorityError;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize)]
struct JwtHeader {
    alg: String,
    typ: String,
}

pub struct EddsaJwtSigner {
    key: SigningKey,
}

impl EddsaJwtSigner {
    pub fn from_bytes(secret: &[u8; 32]) -> Self {
        Self {
            key: SigningKey::from_bytes(secret),
        }
    }

    pub fn verifier(&self) -> EddsaJwtVerifier {
        EddsaJwtVerifier {
            key: self.key.verifying_key(),
        }
    }
}

impl ClaimSigner for EddsaJwtSigner {
    fn scheme(&self) -> SignatureScheme {
        SignatureScheme::EddsaJwt
    }

    fn public_key_hex(&self) -> String {
        hex::encode(self.key.verifying_key().as_bytes())
    }

    fn sign(&self, claims: &CertificateClaims) -> Result<String, AuthorityError> {
        let header = JwtHeader {
            alg: "EdDSA".into(),
            typ: "JWT".into(),
        };
        let header = encode_segment(&header)?;
        let payload = encode_segment(claims)?;
        let signing_input = format!("{header}.{payload}");
        let signature = self.key.sign(signing_input.as_bytes());
        Ok(format!(
            "{signing_input}.{}",
            URL_SAFE_NO_PAD.encode(signature.to_bytes())
        ))
    }
}

pub struct EddsaJwtVerifier {
    key: VerifyingKey,
}

impl EddsaJwtVerifier {
    pub fn from_public_hex(public_hex: &str) -> Result<Self, AuthorityError> {
        let bytes: [u8; 32] = hex::decode(public_hex)
            .ok()
            .and_then(|bytes| bytes.try_into().ok())
            .ok_or_else(|| AuthorityError::invalid("public key must be 32 hex bytes"))?;
        let key = VerifyingKey::from_bytes(&bytes)
            .map_err(|e| AuthorityError::invalid(format!("bad Ed25519 public key: {e}")))?;
        Ok(Self { key })
    }
}

impl ClaimVerifier for EddsaJwtVerifier {
    fn scheme(&self) -> SignatureScheme {
        SignatureScheme::EddsaJwt
    }

    fn verify(&self, artifact: &str) -> Result<CertificateClaims, AuthorityError> {
        let mut parts = artifact.trim().split('.');
        let (header, payload, signature) = match (parts.next(), parts.next(), parts.next(), parts.next()) {
            (Some(h), Some(p), Some(s), None) => (h, p, s),
            _ => return Err(reject("token is not a three-part JWT")),
        };

        let parsed: JwtHeader = decode_segment(header)?;
        if parsed.alg != "EdDSA" {
            return Err(reject(format!("unexpected algorithm '{}'", parsed.alg)));
        }

        let signature = URL_SAFE_NO_PAD
            .decode(signature)
            .map_err(|_| reject("signature is not base64url"))?;
        let signature =
            Signature::from_slice(&signature).map_err(|_| reject("malformed signature"))?;

        let signing_input = &artifact.trim()[..header.len() + 1 + payload.len()];
        self.key
            .verify(signing_input.as_bytes(), &signature)
            .map_err(|_| reject("signature does not match authority key"))?;

        decode_segment(payload)
    }
}

fn encode_segment<T: Serialize>(value: &T) -> Result<String, AuthorityError> {
    let json = serde_json::to_vec(value)
        .map_err(|e| AuthorityError::Internal(format!("claim encoding failed: {e}")))?;
    Ok(URL_SAFE_NO_PAD.encode(json))
}

fn decode_segment<T: for<'de> Deserialize<'de>>(segment: &str) -> Result<T, AuthorityError> {
    let bytes = URL_SAFE_NO_PAD
        .decode(segment)
        .map_err(|_| reject("segment is not base64url"))?;
    serde_json::from_slice(&bytes).map_err(|e| reject(format!("segment is not valid JSON: {e}")))
}

fn reject(message: impl Into<String>) -> AuthorityError {
    AuthorityError::AuthenticationFailure(message.into())
}
