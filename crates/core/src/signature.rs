use base64::{engine::general_purpose::STANDARD, Engine as _};
use hmac::{Hmac, Mac};
use serde::Serialize;
use sha1::Sha1;
use sha2::Sha256;
use sqgate_util::sanitize_secret;
use subtle::ConstantTimeEq;

use crate::envelope::{WebhookHeaders, HEADER_SHA1_SIGNATURE, HEADER_SHA256_SIGNATURE};
use crate::environment::WebhookEnvironment;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SignatureAlgorithm {
    HmacSha256,
    HmacSha1,
}

impl SignatureAlgorithm {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::HmacSha256 => "sha256",
            Self::HmacSha1 => "sha1",
        }
    }

    pub fn header_name(self) -> &'static str {
        match self {
            Self::HmacSha256 => HEADER_SHA256_SIGNATURE,
            Self::HmacSha1 => HEADER_SHA1_SIGNATURE,
        }
    }
}

/// Picks the signature to verify. SHA-256 is preferred when both headers are sent.
pub fn select_signature(headers: &WebhookHeaders) -> Option<(SignatureAlgorithm, &str)> {
    non_empty(&headers.sha256_signature)
        .map(|sig| (SignatureAlgorithm::HmacSha256, sig))
        .or_else(|| {
            non_empty(&headers.sha1_signature).map(|sig| (SignatureAlgorithm::HmacSha1, sig))
        })
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty())
}

fn digest(
    algorithm: SignatureAlgorithm,
    secret: &[u8],
    notification_url: &str,
    raw_body: &[u8],
) -> Option<Vec<u8>> {
    match algorithm {
        SignatureAlgorithm::HmacSha256 => {
            let mut mac = Hmac::<Sha256>::new_from_slice(secret).ok()?;
            mac.update(notification_url.as_bytes());
            mac.update(raw_body);
            Some(mac.finalize().into_bytes().to_vec())
        }
        SignatureAlgorithm::HmacSha1 => {
            let mut mac = Hmac::<Sha1>::new_from_slice(secret).ok()?;
            mac.update(notification_url.as_bytes());
            mac.update(raw_body);
            Some(mac.finalize().into_bytes().to_vec())
        }
    }
}

/// Computes the base64 signature Square would send for the given inputs.
///
/// The secret is sanitized first; `None` is returned for a blank secret.
pub fn compute_signature(
    algorithm: SignatureAlgorithm,
    notification_url: &str,
    raw_body: &[u8],
    secret: &str,
) -> Option<String> {
    let secret = sanitize_secret(secret)?;
    digest(algorithm, secret.as_bytes(), notification_url, raw_body)
        .map(|bytes| STANDARD.encode(bytes))
}

/// Verifies `signature_header` against `notification_url + raw_body`. Square
/// sends the base64 digest in either the SHA-256 or the legacy SHA-1 header.
///
/// Returns `false` for blank secrets, undecodable signatures and digests of
/// the wrong length. Equal-length digests are compared in constant time.
pub fn verify(
    notification_url: &str,
    raw_body: &[u8],
    signature_header: &str,
    secret: &str,
    algorithm: SignatureAlgorithm,
) -> bool {
    let Some(secret) = sanitize_secret(secret) else {
        return false;
    };
    let Ok(provided) = STANDARD.decode(signature_header.trim()) else {
        return false;
    };
    let Some(expected) = digest(algorithm, secret.as_bytes(), notification_url, raw_body) else {
        return false;
    };
    constant_time_eq(&expected, &provided)
}

/// Constant-time comparison of two byte strings. Buffers of different length
/// are unequal and are not compared byte by byte.
pub fn constant_time_eq(expected: &[u8], provided: &[u8]) -> bool {
    if expected.len() != provided.len() {
        return false;
    }
    expected.ct_eq(provided).into()
}

/// Rebuilds the notification URL exactly as the provider recorded it:
/// scheme, host and path, with any query string or fragment removed.
pub fn reconstruct_notification_url(scheme: &str, host: &str, path_and_query: &str) -> String {
    let path = path_and_query
        .split(['?', '#'])
        .next()
        .unwrap_or_default();
    let path = if path.starts_with('/') || path.is_empty() {
        path.to_string()
    } else {
        format!("/{path}")
    };
    format!("{}://{}{}", scheme.trim_end_matches("://"), host, path)
}

/// Signing keys for both Square environments.
///
/// Values are stored as configured and sanitized on every read, so a key
/// rotated in at runtime with a trailing newline still verifies.
#[derive(Clone, Default)]
pub struct SigningSecrets {
    general: Option<String>,
    sandbox: Option<String>,
}

impl std::fmt::Debug for SigningSecrets {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SigningSecrets")
            .field("general", &self.general.as_ref().map(|_| "<redacted>"))
            .field("sandbox", &self.sandbox.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl SigningSecrets {
    pub fn new(general: Option<String>, sandbox: Option<String>) -> Self {
        Self { general, sandbox }
    }

    /// Returns the sanitized key for `environment`.
    ///
    /// Sandbox deliveries use the sandbox key and fall back to the general
    /// key; production deliveries only ever use the general key.
    pub fn secret_for(&self, environment: WebhookEnvironment) -> Option<String> {
        let general = || self.general.as_deref().and_then(sanitize_secret);
        match environment {
            WebhookEnvironment::Sandbox => self
                .sandbox
                .as_deref()
                .and_then(sanitize_secret)
                .or_else(general),
            WebhookEnvironment::Production => general(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    const URL: &str = "https://shop.example.com/webhooks/square";
    const BODY: &[u8] = br#"{"event_id":"evt-1","type":"payment.created"}"#;
    const SECRET: &str = "sig-key-123";

    #[test]
    fn verifies_matching_signature_for_both_algorithms() {
        for algorithm in [SignatureAlgorithm::HmacSha256, SignatureAlgorithm::HmacSha1] {
            let signature = compute_signature(algorithm, URL, BODY, SECRET).expect("signature");
            assert!(verify(URL, BODY, &signature, SECRET, algorithm), "{algorithm:?}");
        }
    }

    #[test]
    fn single_byte_changes_fail_verification() {
        let algorithm = SignatureAlgorithm::HmacSha256;
        let signature = compute_signature(algorithm, URL, BODY, SECRET).expect("signature");

        let mut body = BODY.to_vec();
        body[5] ^= 0x01;
        assert!(!verify(URL, &body, &signature, SECRET, algorithm));

        let url = URL.replace("shop", "shoq");
        assert!(!verify(&url, BODY, &signature, SECRET, algorithm));

        assert!(!verify(URL, BODY, &signature, "sig-key-124", algorithm));
    }

    #[test]
    fn trailing_slash_is_significant() {
        let algorithm = SignatureAlgorithm::HmacSha256;
        let signature = compute_signature(algorithm, URL, BODY, SECRET).expect("signature");
        assert!(!verify(&format!("{URL}/"), BODY, &signature, SECRET, algorithm));
    }

    #[test]
    fn algorithm_mismatch_fails() {
        let signature =
            compute_signature(SignatureAlgorithm::HmacSha1, URL, BODY, SECRET).expect("signature");
        assert!(!verify(URL, BODY, &signature, SECRET, SignatureAlgorithm::HmacSha256));
    }

    #[test]
    fn secret_whitespace_is_ignored() {
        let algorithm = SignatureAlgorithm::HmacSha256;
        let signature = compute_signature(algorithm, URL, BODY, SECRET).expect("signature");
        assert!(verify(URL, BODY, &signature, "sig-key-123\n", algorithm));
        assert!(verify(URL, BODY, &signature, "  sig-key-123\r\n", algorithm));
    }

    #[test]
    fn blank_secret_and_garbage_signature_fail() {
        let algorithm = SignatureAlgorithm::HmacSha256;
        let signature = compute_signature(algorithm, URL, BODY, SECRET).expect("signature");
        assert!(!verify(URL, BODY, &signature, "\n", algorithm));
        assert!(!verify(URL, BODY, "%%%not-base64%%%", SECRET, algorithm));
        assert!(compute_signature(algorithm, URL, BODY, "  ").is_none());
    }

    #[test]
    fn length_mismatch_is_not_equal() {
        assert!(!constant_time_eq(b"abc", b"abcd"));
        assert!(!constant_time_eq(b"", b"a"));
        assert!(constant_time_eq(b"abcd", b"abcd"));
        assert!(!constant_time_eq(b"abcd", b"abce"));
    }

    #[test]
    fn sha256_header_preferred_over_sha1() {
        let headers = WebhookHeaders {
            sha256_signature: Some("two-five-six".into()),
            sha1_signature: Some("one".into()),
            ..WebhookHeaders::default()
        };
        assert_eq!(
            select_signature(&headers),
            Some((SignatureAlgorithm::HmacSha256, "two-five-six"))
        );

        let legacy = WebhookHeaders {
            sha256_signature: Some(" ".into()),
            sha1_signature: Some("one".into()),
            ..WebhookHeaders::default()
        };
        assert_eq!(select_signature(&legacy), Some((SignatureAlgorithm::HmacSha1, "one")));
        assert_eq!(select_signature(&WebhookHeaders::default()), None);
    }

    #[test]
    fn reconstructs_url_without_query() {
        assert_eq!(
            reconstruct_notification_url("https", "shop.example.com", "/webhooks/square?x=1"),
            "https://shop.example.com/webhooks/square"
        );
        assert_eq!(
            reconstruct_notification_url("https", "shop.example.com", "/webhooks/square/"),
            "https://shop.example.com/webhooks/square/"
        );
        assert_eq!(
            reconstruct_notification_url("http", "localhost:8080", "hooks#frag"),
            "http://localhost:8080/hooks"
        );
    }

    #[test]
    fn sandbox_secret_falls_back_to_general() {
        let secrets = SigningSecrets::new(Some("general\n".into()), None);
        assert_eq!(
            secrets.secret_for(WebhookEnvironment::Sandbox).as_deref(),
            Some("general")
        );

        let secrets = SigningSecrets::new(Some("general".into()), Some(" sandbox ".into()));
        assert_eq!(
            secrets.secret_for(WebhookEnvironment::Sandbox).as_deref(),
            Some("sandbox")
        );
        assert_eq!(
            secrets.secret_for(WebhookEnvironment::Production).as_deref(),
            Some("general")
        );
    }

    #[test]
    fn production_never_uses_sandbox_secret() {
        let secrets = SigningSecrets::new(None, Some("sandbox".into()));
        assert_eq!(secrets.secret_for(WebhookEnvironment::Production), None);
    }

    #[test]
    fn debug_redacts_keys() {
        let secrets = SigningSecrets::new(Some("hunter2".into()), None);
        assert!(!format!("{secrets:?}").contains("hunter2"));
    }

    #[test]
    #[ignore = "timing spot-check; run manually on an idle machine"]
    fn comparison_time_does_not_depend_on_mismatch_position() {
        let expected = [0x5au8; 32];
        let mut early = expected;
        early[0] ^= 0xff;
        let mut late = expected;
        late[31] ^= 0xff;

        let measure = |candidate: &[u8]| {
            let start = Instant::now();
            for _ in 0..200_000 {
                std::hint::black_box(constant_time_eq(
                    std::hint::black_box(&expected),
                    std::hint::black_box(candidate),
                ));
            }
            start.elapsed().as_secs_f64()
        };

        let early_secs = measure(&early);
        let late_secs = measure(&late);
        let ratio = early_secs.max(late_secs) / early_secs.min(late_secs);
        assert!(ratio < 1.5, "timing ratio {ratio}");
    }
}
