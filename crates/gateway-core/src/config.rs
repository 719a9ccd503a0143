//! Configuration record (C2).
//!
//! Loading this record from the process environment is an ambient concern
//! handled by the service crate; this module defines only the immutable
//! shape and the pure lookups (model mapping, slow-model detection, adaptive
//! timeout) that the rest of the gateway consults.

use std::collections::HashSet;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FakeReasoningHandling {
    AsReasoningContent,
    Remove,
    Pass,
    StripTags,
}

impl Default for FakeReasoningHandling {
    fn default() -> Self {
        FakeReasoningHandling::AsReasoningContent
    }
}

impl FakeReasoningHandling {
    pub fn parse(value: &str) -> Self {
        match value.to_ascii_lowercase().as_str() {
            "remove" => FakeReasoningHandling::Remove,
            "pass" => FakeReasoningHandling::Pass,
            "strip_tags" => FakeReasoningHandling::StripTags,
            "as_reasoning_content" => FakeReasoningHandling::AsReasoningContent,
            _ => FakeReasoningHandling::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DebugMode {
    Off,
    Errors,
    All,
}

impl Default for DebugMode {
    fn default() -> Self {
        DebugMode::Off
    }
}

impl DebugMode {
    pub fn parse(value: &str) -> Self {
        match value.to_ascii_lowercase().as_str() {
            "errors" => DebugMode::Errors,
            "all" => DebugMode::All,
            _ => DebugMode::Off,
        }
    }
}

/// Immutable settings consulted by every component. Constructed once at
/// startup by the service crate and shared behind an `Arc`.
#[derive(Debug, Clone)]
pub struct Settings {
    pub proxy_api_key: String,

    pub refresh_token: Option<String>,
    pub profile_arn: Option<String>,
    pub region: String,
    pub creds_file: Option<String>,

    pub token_refresh_threshold_sec: u64,

    pub max_retries: u32,
    pub base_retry_delay: f64,

    pub first_token_timeout_sec: u64,
    pub first_token_max_retries: u32,
    pub stream_read_timeout_sec: u64,
    pub non_stream_timeout_sec: u64,

    pub slow_model_timeout_multiplier: f64,
    pub slow_models: HashSet<String>,

    pub model_cache_ttl_sec: u64,
    pub default_max_input_tokens: u64,

    pub tool_description_max_length: i64,

    pub fake_reasoning_enabled: bool,
    pub fake_reasoning_max_tokens: usize,
    pub fake_reasoning_handling: FakeReasoningHandling,
    pub fake_reasoning_open_tags: Vec<String>,
    pub fake_reasoning_initial_buffer_size: usize,

    pub log_level: String,
    pub debug_mode: DebugMode,
    pub port: u16,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            proxy_api_key: "changeme_proxy_secret".to_string(),
            refresh_token: None,
            profile_arn: None,
            region: "us-east-1".to_string(),
            creds_file: None,
            token_refresh_threshold_sec: 600,
            max_retries: 3,
            base_retry_delay: 1.0,
            first_token_timeout_sec: 120,
            first_token_max_retries: 3,
            stream_read_timeout_sec: 300,
            non_stream_timeout_sec: 900,
            slow_model_timeout_multiplier: 3.0,
            slow_models: default_slow_models(),
            model_cache_ttl_sec: 3600,
            default_max_input_tokens: 200_000,
            tool_description_max_length: 10_000,
            fake_reasoning_enabled: true,
            fake_reasoning_max_tokens: 4_000,
            fake_reasoning_handling: FakeReasoningHandling::default(),
            fake_reasoning_open_tags: vec![
                "<thinking>".to_string(),
                "<think>".to_string(),
                "<reasoning>".to_string(),
                "<thought>".to_string(),
            ],
            fake_reasoning_initial_buffer_size: 20,
            log_level: "INFO".to_string(),
            debug_mode: DebugMode::default(),
            port: 8000,
        }
    }
}

fn default_slow_models() -> HashSet<String> {
    [
        "claude-opus-4-5",
        "claude-opus-4-5-20251101",
        "claude-3-opus",
        "claude-3-opus-20240229",
    ]
    .into_iter()
    .map(str::to_string)
    .collect()
}

impl Settings {
    pub fn is_slow_model(&self, model: &str) -> bool {
        let model_lower = model.to_ascii_lowercase();
        self.slow_models
            .iter()
            .any(|slow| model_lower.contains(&slow.to_ascii_lowercase()))
    }

    /// Adaptive timeout: the base duration scaled up for slow models.
    pub fn adaptive_timeout(&self, base: Duration, model: &str) -> Duration {
        if self.is_slow_model(model) {
            base.mul_f64(self.slow_model_timeout_multiplier)
        } else {
            base
        }
    }

    pub fn first_token_timeout(&self, model: &str) -> Duration {
        self.adaptive_timeout(Duration::from_secs(self.first_token_timeout_sec), model)
    }

    pub fn stream_read_timeout(&self, model: &str) -> Duration {
        self.adaptive_timeout(Duration::from_secs(self.stream_read_timeout_sec), model)
    }

    pub fn non_stream_timeout(&self, model: &str) -> Duration {
        self.adaptive_timeout(Duration::from_secs(self.non_stream_timeout_sec), model)
    }
}

/// Known external-facing model whitelist, in the order `/v1/models` reports them.
pub const AVAILABLE_MODELS: &[&str] = &[
    "claude-opus-4-5",
    "claude-opus-4-5-20251101",
    "claude-haiku-4-5",
    "claude-haiku-4-5-20251001",
    "claude-sonnet-4-5",
    "claude-sonnet-4-5-20250929",
    "claude-sonnet-4",
    "claude-sonnet-4-20250514",
    "claude-3-7-sonnet-20250219",
];

/// Maps an external (client-facing) model id to the upstream's internal id.
pub fn internal_model_id(external: &str) -> Result<String, String> {
    let mapped = match external {
        "auto" => "claude-sonnet-4.5",
        "claude-opus-4-5" | "claude-opus-4-5-20251101" => "claude-opus-4.5",
        "claude-haiku-4-5" | "claude-haiku-4-5-20251001" => "claude-haiku-4.5",
        "claude-haiku-4.5" => "claude-haiku-4.5",
        "claude-sonnet-4-5" | "claude-sonnet-4-5-20250929" => "CLAUDE_SONNET_4_5_20250929_V1_0",
        "claude-sonnet-4" | "claude-sonnet-4-20250514" => "CLAUDE_SONNET_4_20250514_V1_0",
        "claude-3-7-sonnet-20250219" => "CLAUDE_3_7_SONNET_20250219_V1_0",
        other if AVAILABLE_MODELS.contains(&other) => other,
        other if is_known_internal_id(other) => other,
        _ => {
            return Err(format!(
                "Unknown model '{}'. Available models: {}",
                external,
                AVAILABLE_MODELS.join(", ")
            ))
        }
    };
    Ok(mapped.to_string())
}

fn is_known_internal_id(id: &str) -> bool {
    matches!(
        id,
        "claude-opus-4.5"
            | "claude-haiku-4.5"
            | "CLAUDE_SONNET_4_5_20250929_V1_0"
            | "CLAUDE_SONNET_4_20250514_V1_0"
            | "CLAUDE_3_7_SONNET_20250219_V1_0"
    )
}

pub fn kiro_refresh_url(region: &str) -> String {
    format!("https://prod.{}.auth.desktop.kiro.dev/refreshToken", region)
}

pub fn aws_sso_oidc_url(region: &str) -> String {
    format!("https://oidc.{}.amazonaws.com/token", region)
}

pub fn kiro_api_host(region: &str) -> String {
    format!("https://codewhisperer.{}.amazonaws.com", region)
}

pub fn kiro_q_host(region: &str) -> String {
    format!("https://q.{}.amazonaws.com", region)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slow_model_detection_is_case_insensitive_substring() {
        let settings = Settings::default();
        assert!(settings.is_slow_model("Claude-Opus-4-5-20251101"));
        assert!(!settings.is_slow_model("claude-haiku-4-5"));
    }

    #[test]
    fn known_external_ids_map_to_internal_ids() {
        assert_eq!(internal_model_id("auto").unwrap(), "claude-sonnet-4.5");
        assert_eq!(
            internal_model_id("claude-sonnet-4-5").unwrap(),
            "CLAUDE_SONNET_4_5_20250929_V1_0"
        );
        assert_eq!(
            internal_model_id("CLAUDE_SONNET_4_20250514_V1_0").unwrap(),
            "CLAUDE_SONNET_4_20250514_V1_0"
        );
    }

    #[test]
    fn unknown_model_errors_with_available_list() {
        let err = internal_model_id("not-a-model").unwrap_err();
        assert!(err.contains("claude-opus-4-5"));
    }
}
