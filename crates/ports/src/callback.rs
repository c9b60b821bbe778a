//! Outbound completion callbacks
//!
//! When a prompt carries a callback context, its completion is posted to
//! the configured notification endpoint, signed with HMAC-SHA-256 over
//! the canonical JSON of the unsigned body. Delivery is best-effort: two
//! attempts, one second apart; failure is logged, never fatal.

use std::time::Duration;

use ring::hmac;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn};

const MAX_ATTEMPTS: u32 = 2;
const RETRY_DELAY: Duration = Duration::from_secs(1);

/// Unsigned callback body. Field order is the canonical JSON order the
/// signature is computed over.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletionCallback {
    pub session_id: String,
    pub message_id: String,
    pub success: bool,
    pub timestamp: i64,
    pub context: Value,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SignedCallback<'a> {
    #[serde(flatten)]
    body: &'a CompletionCallback,
    signature: String,
}

pub struct CallbackNotifier {
    http: reqwest::Client,
    endpoint: String,
    secret: String,
}

impl CallbackNotifier {
    pub fn new(endpoint: String, secret: String) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .expect("build callback http client");
        Self {
            http,
            endpoint,
            secret,
        }
    }

    /// HMAC-SHA-256 hex over the canonical JSON of the unsigned body.
    pub fn sign(secret: &str, body: &CompletionCallback) -> String {
        let canonical = serde_json::to_string(body).expect("callback body serializes");
        let key = hmac::Key::new(hmac::HMAC_SHA256, secret.as_bytes());
        let tag = hmac::sign(&key, canonical.as_bytes());
        hex_encode(tag.as_ref())
    }

    /// Post the signed callback. At most two attempts; never returns Err.
    pub async fn notify(&self, body: &CompletionCallback) {
        let signed = SignedCallback {
            body,
            signature: Self::sign(&self.secret, body),
        };

        for attempt in 1..=MAX_ATTEMPTS {
            match self.http.post(&self.endpoint).json(&signed).send().await {
                Ok(response) if response.status().is_success() => {
                    debug!(
                        component = "callback",
                        event = "callback.delivered",
                        message_id = %body.message_id,
                        attempt = attempt,
                        "Completion callback delivered"
                    );
                    return;
                }
                Ok(response) => {
                    warn!(
                        component = "callback",
                        event = "callback.rejected",
                        message_id = %body.message_id,
                        attempt = attempt,
                        status = %response.status(),
                        "Completion callback rejected"
                    );
                }
                Err(e) => {
                    warn!(
                        component = "callback",
                        event = "callback.failed",
                        message_id = %body.message_id,
                        attempt = attempt,
                        error = %e,
                        "Completion callback delivery failed"
                    );
                }
            }
            if attempt < MAX_ATTEMPTS {
                tokio::time::sleep(RETRY_DELAY).await;
            }
        }
    }
}

fn hex_encode(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push_str(&format!("{b:02x}"));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_body() -> CompletionCallback {
        CompletionCallback {
            session_id: "s1".into(),
            message_id: "m1".into(),
            success: true,
            timestamp: 1_700_000_000_000,
            context: serde_json::json!({"threadTs": "123.456"}),
        }
    }

    #[test]
    fn signature_is_deterministic() {
        let body = test_body();
        let a = CallbackNotifier::sign("secret", &body);
        let b = CallbackNotifier::sign("secret", &body);
        assert_eq!(a, b);
        assert_eq!(a.len(), 64); // sha-256 hex
    }

    #[test]
    fn signature_depends_on_secret_and_body() {
        let body = test_body();
        let base = CallbackNotifier::sign("secret", &body);
        assert_ne!(base, CallbackNotifier::sign("other", &body));

        let mut changed = test_body();
        changed.success = false;
        assert_ne!(base, CallbackNotifier::sign("secret", &changed));
    }

    #[test]
    fn signed_body_flattens_fields() {
        let body = test_body();
        let signed = SignedCallback {
            signature: CallbackNotifier::sign("secret", &body),
            body: &body,
        };
        let json = serde_json::to_value(&signed).unwrap();
        assert_eq!(json["sessionId"], "s1");
        assert_eq!(json["messageId"], "m1");
        assert!(json["signature"].is_string());
    }
}
