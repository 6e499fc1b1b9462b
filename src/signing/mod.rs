//! Plan signing and trust verification.
//!
//! The plan body (signature block excluded) is serialized in canonical
//! form (JSON with ordered object keys) and hashed with SHA-256; the
//! signature is Ed25519 over that hash. The trust store maps `key_id` to
//! a public key, a trust level, and a validity window.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Utc};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

use crate::dsl::schema::{Plan, SignatureBlock};
use crate::error::ErrorCode;

/// Ranked authority of a signing key. Order matters: `System` outranks
/// everything, `Unknown` ranks below everything.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrustLevel {
    Unknown,
    Community,
    Development,
    Commercial,
    System,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrustedKey {
    /// Base64-encoded Ed25519 public key (32 bytes).
    pub public_key: String,
    pub trust_level: TrustLevel,
    #[serde(default)]
    pub valid_from: Option<DateTime<Utc>>,
    #[serde(default)]
    pub valid_until: Option<DateTime<Utc>>,
    #[serde(default)]
    pub revoked: bool,
}

/// Ordered mapping from key id to trusted key material.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrustStore {
    #[serde(default)]
    pub keys: BTreeMap<String, TrustedKey>,
    /// Keys below this level fail verification with `TRUST_TOO_LOW`.
    #[serde(default = "default_min_trust")]
    pub min_trust_level: TrustLevel,
}

fn default_min_trust() -> TrustLevel {
    TrustLevel::Community
}

impl Default for TrustStore {
    fn default() -> Self {
        TrustStore {
            keys: BTreeMap::new(),
            min_trust_level: default_min_trust(),
        }
    }
}

/// Successful verification outcome, fed into the policy engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerifiedSignature {
    pub key_id: String,
    pub trust_level: TrustLevel,
}

/// Canonical plan bytes: the plan without its signature block, as JSON
/// with object keys in sorted order.
pub fn canonical_plan_bytes(plan: &Plan) -> Vec<u8> {
    let mut body = plan.clone();
    body.signature = None;
    let value = serde_json::to_value(&body).expect("plan serializes");
    // serde_json objects iterate in sorted key order, so a straight
    // re-serialization of the Value is already canonical.
    serde_json::to_vec(&value).expect("canonical bytes")
}

/// SHA-256 over the canonical plan bytes.
pub fn plan_digest(plan: &Plan) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(canonical_plan_bytes(plan));
    hasher.finalize().into()
}

/// Sign a plan, returning the signature block to store alongside it.
pub fn sign_plan(plan: &Plan, key: &SigningKey, key_id: &str, now: DateTime<Utc>) -> SignatureBlock {
    let digest = plan_digest(plan);
    let sig = key.sign(&digest);
    SignatureBlock {
        algo: "ed25519".to_string(),
        key_id: key_id.to_string(),
        created_at: now.to_rfc3339(),
        sig: BASE64.encode(sig.to_bytes()),
    }
}

/// Generate a fresh Ed25519 keypair, returned as (private, public)
/// base64 strings.
pub fn generate_keypair() -> (String, String) {
    let key = SigningKey::generate(&mut rand::rngs::OsRng);
    (
        BASE64.encode(key.to_bytes()),
        BASE64.encode(key.verifying_key().to_bytes()),
    )
}

/// Parse a base64 private key back into a signing key.
pub fn parse_signing_key(encoded: &str) -> Result<SigningKey, ErrorCode> {
    let bytes = BASE64.decode(encoded.trim()).map_err(|_| ErrorCode::SignatureInvalid)?;
    let bytes: [u8; 32] = bytes.try_into().map_err(|_| ErrorCode::SignatureInvalid)?;
    Ok(SigningKey::from_bytes(&bytes))
}

impl TrustStore {
    /// Verify a signed plan against the store at the given instant.
    ///
    /// Failure codes: `SIGNATURE_INVALID` (bad bytes or mismatch),
    /// `SIGNATURE_EXPIRED` (outside the key's validity window),
    /// `KEY_UNKNOWN`, `KEY_REVOKED`, `TRUST_TOO_LOW`.
    pub fn verify(&self, plan: &Plan, now: DateTime<Utc>) -> Result<VerifiedSignature, ErrorCode> {
        let block = plan.signature.as_ref().ok_or(ErrorCode::SignatureInvalid)?;
        if block.algo != "ed25519" {
            return Err(ErrorCode::SignatureInvalid);
        }

        let entry = self.keys.get(&block.key_id).ok_or(ErrorCode::KeyUnknown)?;
        if entry.revoked {
            return Err(ErrorCode::KeyRevoked);
        }
        if let Some(from) = entry.valid_from {
            if now < from {
                return Err(ErrorCode::SignatureExpired);
            }
        }
        if let Some(until) = entry.valid_until {
            if now > until {
                return Err(ErrorCode::SignatureExpired);
            }
        }

        let key_bytes = BASE64
            .decode(entry.public_key.trim())
            .map_err(|_| ErrorCode::SignatureInvalid)?;
        let key_bytes: [u8; 32] = key_bytes.try_into().map_err(|_| ErrorCode::SignatureInvalid)?;
        let verifying =
            VerifyingKey::from_bytes(&key_bytes).map_err(|_| ErrorCode::SignatureInvalid)?;

        let sig_bytes = BASE64.decode(&block.sig).map_err(|_| ErrorCode::SignatureInvalid)?;
        let sig_bytes: [u8; 64] = sig_bytes.try_into().map_err(|_| ErrorCode::SignatureInvalid)?;
        let signature = Signature::from_bytes(&sig_bytes);

        verifying
            .verify(&plan_digest(plan), &signature)
            .map_err(|_| ErrorCode::SignatureInvalid)?;

        if entry.trust_level < self.min_trust_level {
            return Err(ErrorCode::TrustTooLow);
        }

        Ok(VerifiedSignature {
            key_id: block.key_id.clone(),
            trust_level: entry.trust_level,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dsl::parse_plan;
    use chrono::TimeZone;

    fn sample_plan() -> Plan {
        parse_plan(
            r#"
dsl_version: "1.1"
name: signed-demo
variables: {inbox: ./in}
steps:
  - log: {message: hi}
"#,
        )
        .unwrap()
    }

    fn store_with(key: &SigningKey, level: TrustLevel) -> TrustStore {
        let mut keys = BTreeMap::new();
        keys.insert(
            "da:2025:test".to_string(),
            TrustedKey {
                public_key: BASE64.encode(key.verifying_key().to_bytes()),
                trust_level: level,
                valid_from: None,
                valid_until: None,
                revoked: false,
            },
        );
        TrustStore {
            keys,
            min_trust_level: TrustLevel::Community,
        }
    }

    fn test_key() -> SigningKey {
        SigningKey::from_bytes(&[7u8; 32])
    }

    #[test]
    fn test_canonical_bytes_exclude_signature() {
        let mut plan = sample_plan();
        let before = canonical_plan_bytes(&plan);
        plan.signature = Some(SignatureBlock {
            algo: "ed25519".into(),
            key_id: "k".into(),
            created_at: "now".into(),
            sig: "sig".into(),
        });
        assert_eq!(before, canonical_plan_bytes(&plan));
    }

    #[test]
    fn test_sign_then_verify() {
        let key = test_key();
        let mut plan = sample_plan();
        plan.signature = Some(sign_plan(&plan, &key, "da:2025:test", Utc::now()));

        let store = store_with(&key, TrustLevel::Development);
        let verified = store.verify(&plan, Utc::now()).unwrap();
        assert_eq!(verified.key_id, "da:2025:test");
        assert_eq!(verified.trust_level, TrustLevel::Development);
    }

    #[test]
    fn test_tampered_plan_fails() {
        let key = test_key();
        let mut plan = sample_plan();
        plan.signature = Some(sign_plan(&plan, &key, "da:2025:test", Utc::now()));
        plan.name = "tampered".to_string();

        let store = store_with(&key, TrustLevel::System);
        assert_eq!(store.verify(&plan, Utc::now()), Err(ErrorCode::SignatureInvalid));
    }

    #[test]
    fn test_unknown_key() {
        let key = test_key();
        let mut plan = sample_plan();
        plan.signature = Some(sign_plan(&plan, &key, "da:2025:other", Utc::now()));

        let store = store_with(&key, TrustLevel::System);
        assert_eq!(store.verify(&plan, Utc::now()), Err(ErrorCode::KeyUnknown));
    }

    #[test]
    fn test_revoked_key() {
        let key = test_key();
        let mut plan = sample_plan();
        plan.signature = Some(sign_plan(&plan, &key, "da:2025:test", Utc::now()));

        let mut store = store_with(&key, TrustLevel::System);
        store.keys.get_mut("da:2025:test").unwrap().revoked = true;
        assert_eq!(store.verify(&plan, Utc::now()), Err(ErrorCode::KeyRevoked));
    }

    #[test]
    fn test_expired_key() {
        let key = test_key();
        let mut plan = sample_plan();
        plan.signature = Some(sign_plan(&plan, &key, "da:2025:test", Utc::now()));

        let mut store = store_with(&key, TrustLevel::System);
        store.keys.get_mut("da:2025:test").unwrap().valid_until =
            Some(Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap());
        assert_eq!(store.verify(&plan, Utc::now()), Err(ErrorCode::SignatureExpired));
    }

    #[test]
    fn test_trust_too_low() {
        let key = test_key();
        let mut plan = sample_plan();
        plan.signature = Some(sign_plan(&plan, &key, "da:2025:test", Utc::now()));

        let mut store = store_with(&key, TrustLevel::Unknown);
        store.min_trust_level = TrustLevel::Development;
        assert_eq!(store.verify(&plan, Utc::now()), Err(ErrorCode::TrustTooLow));
    }

    #[test]
    fn test_trust_level_ordering() {
        assert!(TrustLevel::System > TrustLevel::Commercial);
        assert!(TrustLevel::Commercial > TrustLevel::Development);
        assert!(TrustLevel::Development > TrustLevel::Community);
        assert!(TrustLevel::Community > TrustLevel::Unknown);
    }

    #[test]
    fn test_keypair_roundtrip() {
        let (private, _) = generate_keypair();
        let key = parse_signing_key(&private).unwrap();
        let plan = sample_plan();
        let block = sign_plan(&plan, &key, "k", Utc::now());
        assert_eq!(block.algo, "ed25519");
    }
}
