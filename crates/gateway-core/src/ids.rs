//! Machine fingerprinting and ID generation (C1).

use sha2::{Digest, Sha256};
use uuid::Uuid;

/// A stable, host-bound fingerprint used to decorate outbound `User-Agent`
/// and `amz-sdk-invocation-id` style headers. Falls back to a fixed string
/// when the hostname or username cannot be resolved, rather than failing
/// the request.
pub fn machine_fingerprint() -> String {
    let hostname = hostname()
        .unwrap_or_else(|| "unknown-host".to_string());
    let username = username()
        .unwrap_or_else(|| "unknown-user".to_string());
    let seed = format!("{}-{}-kiro-2api", hostname, username);
    hex_sha256(&seed)
}

fn hex_sha256(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    hex::encode(hasher.finalize())
}

fn hostname() -> Option<String> {
    std::env::var("HOSTNAME")
        .ok()
        .or_else(|| std::env::var("COMPUTERNAME").ok())
}

fn username() -> Option<String> {
    std::env::var("USER").ok().or_else(|| std::env::var("USERNAME").ok())
}

/// First 16 hex chars of the fingerprint, used in the `User-Agent` header of
/// the token-refresh calls.
pub fn fingerprint16() -> String {
    machine_fingerprint()[..16].to_string()
}

/// First 32 hex chars of the fingerprint, used in the upstream completion
/// call headers.
pub fn fingerprint32() -> String {
    machine_fingerprint()[..32].to_string()
}

pub fn generate_completion_id() -> String {
    format!("chatcmpl-{}", Uuid::new_v4().simple())
}

pub fn generate_conversation_id() -> String {
    Uuid::new_v4().to_string()
}

pub fn generate_tool_call_id() -> String {
    let hex = Uuid::new_v4().simple().to_string();
    format!("call_{}", &hex[..8])
}

pub fn generate_invocation_id() -> String {
    Uuid::new_v4().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_is_deterministic_within_process() {
        assert_eq!(machine_fingerprint(), machine_fingerprint());
    }

    #[test]
    fn fingerprint16_is_prefix_of_fingerprint32() {
        assert!(fingerprint32().starts_with(&fingerprint16()));
    }

    #[test]
    fn ids_have_expected_shapes() {
        assert!(generate_completion_id().starts_with("chatcmpl-"));
        assert!(generate_tool_call_id().starts_with("call_"));
        assert_eq!(generate_tool_call_id().len(), "call_".len() + 8);
    }
}
