//! Authentication (spec §4.15/§6) and the fixed security-response
//! header set (spec §4.16/§6), applied by the HTTP/1.x and HTTP/2
//! write paths to every outgoing response.

use crate::config::AuthConfig;
use crate::types::Request;
use base64::Engine;

/// `Content-Security-Policy`, `X-Frame-Options`, and friends — the
/// fixed set spec §6 names verbatim. `Strict-Transport-Security` is
/// appended separately by `apply` only when the connection is TLS.
const FIXED_SECURITY_HEADERS: &[(&str, &str)] = &[
    (
        "content-security-policy",
        "default-src 'self'; script-src 'self'; frame-ancestors 'none'",
    ),
    ("x-frame-options", "DENY"),
    ("x-content-type-options", "nosniff"),
    ("referrer-policy", "strict-origin-when-cross-origin"),
    (
        "permissions-policy",
        "geolocation=(), microphone=(), camera=()",
    ),
];

const HSTS_VALUE: &str = "max-age=63072000; includeSubDomains; preload";

/// Sets every fixed security header on `response` unless the handler
/// already set that header name (spec §4.16: "unless overridden").
pub fn apply(headers: &mut std::collections::HashMap<String, String>, is_tls: bool) {
    for (name, value) in FIXED_SECURITY_HEADERS {
        headers.entry((*name).to_string()).or_insert_with(|| (*value).to_string());
    }
    if is_tls {
        headers
            .entry("strict-transport-security".to_string())
            .or_insert_with(|| HSTS_VALUE.to_string());
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthOutcome {
    NotConfigured,
    Authorized,
    Unauthorized,
}

/// Checks `request` against `config`'s enabled scheme(s). When both
/// Basic and API-key are configured and both headers are present on
/// the request, the API key wins (spec §4.15/§6).
#[must_use]
pub fn authenticate(request: &Request, config: &AuthConfig) -> AuthOutcome {
    if config.basic.is_none() && config.api_keys.is_none() {
        return AuthOutcome::NotConfigured;
    }

    if let (Some(keys), Some(presented)) = (&config.api_keys, request.header("x-api-key")) {
        return if keys.iter().any(|k| constant_time_eq(k.as_bytes(), presented.as_bytes())) {
            AuthOutcome::Authorized
        } else {
            AuthOutcome::Unauthorized
        };
    }

    if let Some(store) = &config.basic {
        return match request.header("authorization").and_then(parse_basic) {
            Some((user, pass)) => match store.credentials.get(&user) {
                Some(expected) if constant_time_eq(expected.as_bytes(), pass.as_bytes()) => {
                    AuthOutcome::Authorized
                }
                _ => AuthOutcome::Unauthorized,
            },
            None => AuthOutcome::Unauthorized,
        };
    }

    // API keys configured but request carried no X-API-Key header.
    AuthOutcome::Unauthorized
}

#[must_use]
pub fn www_authenticate_value(realm: &str) -> String {
    format!("Basic realm=\"{realm}\"")
}

fn parse_basic(header_value: &str) -> Option<(String, String)> {
    let encoded = header_value.strip_prefix("Basic ")?;
    let decoded = base64::engine::general_purpose::STANDARD.decode(encoded.trim()).ok()?;
    let text = String::from_utf8(decoded).ok()?;
    let (user, pass) = text.split_once(':')?;
    Some((user.to_string(), pass.to_string()))
}

/// Constant-time byte comparison: spec §4.15 requires credential
/// comparison not leak timing information via early exit on mismatch,
/// and this crate does not otherwise depend on a dedicated
/// constant-time-compare crate for one function (see DESIGN.md).
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BasicCredentialStore;
    use crate::types::HttpVersion;
    use bytes::Bytes;
    use std::collections::HashMap;

    fn request_with_header(name: &str, value: &str) -> Request {
        let mut headers = HashMap::new();
        headers.insert(name.to_string(), value.to_string());
        Request {
            method: "GET".into(),
            path: "/".into(),
            version: HttpVersion::Http11,
            headers,
            body: Bytes::new(),
            peer_addr: None,
        }
    }

    #[test]
    fn no_auth_configured_is_not_configured() {
        let req = request_with_header("x-unrelated", "1");
        assert_eq!(authenticate(&req, &AuthConfig::default()), AuthOutcome::NotConfigured);
    }

    #[test]
    fn valid_basic_credentials_authorize() {
        let mut credentials = HashMap::new();
        credentials.insert("alice".to_string(), "wonderland".to_string());
        let config = AuthConfig {
            basic: Some(BasicCredentialStore { credentials }),
            api_keys: None,
        };
        let value = base64::engine::general_purpose::STANDARD.encode("alice:wonderland");
        let req = request_with_header("authorization", &format!("Basic {value}"));
        assert_eq!(authenticate(&req, &config), AuthOutcome::Authorized);
    }

    #[test]
    fn wrong_password_is_unauthorized() {
        let mut credentials = HashMap::new();
        credentials.insert("alice".to_string(), "wonderland".to_string());
        let config = AuthConfig {
            basic: Some(BasicCredentialStore { credentials }),
            api_keys: None,
        };
        let value = base64::engine::general_purpose::STANDARD.encode("alice:wrong");
        let req = request_with_header("authorization", &format!("Basic {value}"));
        assert_eq!(authenticate(&req, &config), AuthOutcome::Unauthorized);
    }

    #[test]
    fn api_key_wins_when_both_schemes_present() {
        let mut credentials = HashMap::new();
        credentials.insert("alice".to_string(), "wonderland".to_string());
        let config = AuthConfig {
            basic: Some(BasicCredentialStore { credentials }),
            api_keys: Some(vec!["secret-key".to_string()]),
        };
        let basic_value = base64::engine::general_purpose::STANDARD.encode("alice:wrong-password");
        let mut headers = HashMap::new();
        headers.insert("authorization".to_string(), format!("Basic {basic_value}"));
        headers.insert("x-api-key".to_string(), "secret-key".to_string());
        let req = Request {
            method: "GET".into(),
            path: "/".into(),
            version: HttpVersion::Http11,
            headers,
            body: Bytes::new(),
            peer_addr: None,
        };
        // Basic credentials above are wrong, but the API key is correct
        // and takes precedence per spec.
        assert_eq!(authenticate(&req, &config), AuthOutcome::Authorized);
    }

    #[test]
    fn fixed_headers_are_applied_but_not_overridden() {
        let mut headers = HashMap::new();
        headers.insert("x-frame-options".to_string(), "SAMEORIGIN".to_string());
        apply(&mut headers, false);
        assert_eq!(headers.get("x-frame-options").unwrap(), "SAMEORIGIN");
        assert_eq!(headers.get("x-content-type-options").unwrap(), "nosniff");
        assert!(!headers.contains_key("strict-transport-security"));
    }

    #[test]
    fn hsts_only_added_over_tls() {
        let mut headers = HashMap::new();
        apply(&mut headers, true);
        assert!(headers.contains_key("strict-transport-security"));
    }
}
