//! Webhook trigger intake.
//!
//! Requests are authenticated by HMAC-SHA256 over the raw body with a
//! shared secret. Delivery is at-least-once upstream, so duplicate
//! `event_id`s inside a sliding window are dropped.

use chrono::{DateTime, Duration, Utc};
use hmac::{Hmac, Mac};
use parking_lot::Mutex;
use sha2::Sha256;
use std::collections::VecDeque;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebhookRejection {
    BadSignature,
    DuplicateEvent,
}

pub struct WebhookGate {
    secret: Vec<u8>,
    window: Duration,
    seen: Mutex<VecDeque<(DateTime<Utc>, String)>>,
}

impl WebhookGate {
    pub fn new(secret: impl Into<Vec<u8>>, window_secs: i64) -> Self {
        WebhookGate {
            secret: secret.into(),
            window: Duration::seconds(window_secs),
            seen: Mutex::new(VecDeque::new()),
        }
    }

    /// Compute the expected signature for a body, hex-encoded with the
    /// conventional `sha256=` prefix.
    pub fn sign(&self, body: &[u8]) -> String {
        let mut mac = HmacSha256::new_from_slice(&self.secret).expect("hmac accepts any key size");
        mac.update(body);
        let digest = mac.finalize().into_bytes();
        let hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
        format!("sha256={hex}")
    }

    /// Constant-time verification of the provided signature header.
    pub fn verify_signature(&self, body: &[u8], provided: &str) -> bool {
        let provided = provided.strip_prefix("sha256=").unwrap_or(provided);
        let Ok(bytes) = decode_hex(provided) else {
            return false;
        };
        let mut mac = HmacSha256::new_from_slice(&self.secret).expect("hmac accepts any key size");
        mac.update(body);
        mac.verify_slice(&bytes).is_ok()
    }

    /// Full intake check: signature, then dedup by event id.
    pub fn accept(
        &self,
        body: &[u8],
        signature: &str,
        event_id: &str,
        now: DateTime<Utc>,
    ) -> Result<(), WebhookRejection> {
        if !self.verify_signature(body, signature) {
            return Err(WebhookRejection::BadSignature);
        }
        let mut seen = self.seen.lock();
        let horizon = now - self.window;
        while seen.front().is_some_and(|(t, _)| *t < horizon) {
            seen.pop_front();
        }
        if seen.iter().any(|(_, id)| id == event_id) {
            return Err(WebhookRejection::DuplicateEvent);
        }
        seen.push_back((now, event_id.to_string()));
        Ok(())
    }
}

fn decode_hex(text: &str) -> Result<Vec<u8>, ()> {
    if text.len() % 2 != 0 {
        return Err(());
    }
    (0..text.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&text[i..i + 2], 16).map_err(|_| ()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gate() -> WebhookGate {
        WebhookGate::new(b"shared-secret".to_vec(), 600)
    }

    #[test]
    fn test_signature_roundtrip() {
        let g = gate();
        let body = br#"{"event":"invoice.created"}"#;
        let sig = g.sign(body);
        assert!(g.verify_signature(body, &sig));
        assert!(!g.verify_signature(b"tampered", &sig));
        assert!(!g.verify_signature(body, "sha256=deadbeef"));
        assert!(!g.verify_signature(body, "not-hex!"));
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let signer = WebhookGate::new(b"secret-a".to_vec(), 600);
        let verifier = WebhookGate::new(b"secret-b".to_vec(), 600);
        let body = b"payload";
        assert!(!verifier.verify_signature(body, &signer.sign(body)));
    }

    #[test]
    fn test_duplicate_event_dropped_within_window() {
        let g = gate();
        let body = b"payload";
        let sig = g.sign(body);
        let now = Utc::now();

        assert!(g.accept(body, &sig, "evt-1", now).is_ok());
        assert_eq!(
            g.accept(body, &sig, "evt-1", now + Duration::seconds(30)),
            Err(WebhookRejection::DuplicateEvent)
        );
        // Different event id passes.
        assert!(g.accept(body, &sig, "evt-2", now + Duration::seconds(30)).is_ok());
    }

    #[test]
    fn test_dedup_window_slides() {
        let g = gate();
        let body = b"payload";
        let sig = g.sign(body);
        let now = Utc::now();

        assert!(g.accept(body, &sig, "evt-1", now).is_ok());
        // After the window, the same id is accepted again.
        assert!(g
            .accept(body, &sig, "evt-1", now + Duration::seconds(601))
            .is_ok());
    }

    #[test]
    fn test_bad_signature_never_consumes_event_id() {
        let g = gate();
        let body = b"payload";
        let now = Utc::now();
        assert_eq!(
            g.accept(body, "sha256=00", "evt-1", now),
            Err(WebhookRejection::BadSignature)
        );
        let sig = g.sign(body);
        assert!(g.accept(body, &sig, "evt-1", now).is_ok());
    }
}
