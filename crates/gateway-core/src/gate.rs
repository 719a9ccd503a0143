//! Authorization gate (C10): parses the inbound `Bearer` header and selects
//! between the shared default principal and a fresh per-request one.

use subtle::ConstantTimeEq;

/// What the gate decided to do with an inbound `Authorization` header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateDecision {
    /// The proxy key matched the whole token: use the server's default
    /// (shared) credential.
    UseDefault,
    /// The token was `proxyKey:refreshToken`, and `proxyKey` matched: mint a
    /// fresh per-request principal from the embedded refresh token.
    UseEmbeddedRefreshToken(String),
}

/// Strips a leading `Bearer ` prefix (case-sensitive, matching the spec's
/// literal header shape); a header with no prefix is accepted as-is for test
/// tooling, per §4.8.
fn strip_bearer_prefix(header_value: &str) -> &str {
    header_value.strip_prefix("Bearer ").unwrap_or(header_value)
}

/// Compares two strings in constant time with respect to their *content*.
/// Byte-length is not secret here (proxy API keys are not length-sensitive),
/// but content comparison never short-circuits on the first differing byte.
fn constant_time_str_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        // Still perform a constant-time comparison against a same-length
        // buffer so callers can't distinguish "different length" from
        // "same length, differs at byte 0" by timing.
        let padded_a = a.as_bytes();
        let mut padded_b = vec![0u8; padded_a.len()];
        let n = b.len().min(padded_b.len());
        padded_b[..n].copy_from_slice(&b.as_bytes()[..n]);
        let _ = padded_a.ct_eq(&padded_b);
        return false;
    }
    a.as_bytes().ct_eq(b.as_bytes()).into()
}

/// Evaluates an `Authorization: Bearer <token>` header against the
/// configured `proxy_api_key`. Returns `None` on any mismatch (the caller
/// surfaces a 401).
pub fn evaluate(header_value: &str, proxy_api_key: &str) -> Option<GateDecision> {
    let token = strip_bearer_prefix(header_value.trim());
    if let Some((proxy_key, refresh_token)) = token.split_once(':') {
        if constant_time_str_eq(proxy_key, proxy_api_key) && !refresh_token.is_empty() {
            return Some(GateDecision::UseEmbeddedRefreshToken(refresh_token.to_string()));
        }
        return None;
    }
    if constant_time_str_eq(token, proxy_api_key) {
        return Some(GateDecision::UseDefault);
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matching_proxy_key_selects_default_principal() {
        let decision = evaluate("Bearer secret", "secret").unwrap();
        assert_eq!(decision, GateDecision::UseDefault);
    }

    #[test]
    fn raw_token_without_bearer_prefix_is_accepted() {
        let decision = evaluate("secret", "secret").unwrap();
        assert_eq!(decision, GateDecision::UseDefault);
    }

    #[test]
    fn embedded_refresh_token_form_is_split_once() {
        let decision = evaluate("Bearer secret:rt-with:colons", "secret").unwrap();
        assert_eq!(
            decision,
            GateDecision::UseEmbeddedRefreshToken("rt-with:colons".to_string())
        );
    }

    #[test]
    fn mismatched_proxy_key_is_rejected() {
        assert!(evaluate("Bearer wrong", "secret").is_none());
    }

    #[test]
    fn embedded_form_with_empty_refresh_token_is_rejected() {
        assert!(evaluate("Bearer secret:", "secret").is_none());
    }
}
