//! Resilient HTTP dispatch to the upstream (C4).

use std::sync::Arc;
use std::time::Duration;

use once_cell::sync::Lazy;
use reqwest::{Client, Response};
use serde_json::Value;
use tracing::warn;

use crate::auth::TokenManager;
use crate::config::{kiro_api_host, Settings};
use crate::error::GatewayError;
use crate::ids::{fingerprint32, generate_invocation_id};

/// A single, process-wide pooled client, built once. Mirrors the connection
/// limits used by the upstream reference deployment: a generous idle-pool
/// cap and a one-minute keepalive, HTTP/1.1 only (the upstream does not
/// negotiate h2).
pub static CLIENT: Lazy<Client> = Lazy::new(|| {
    Client::builder()
        .pool_max_idle_per_host(20)
        .pool_idle_timeout(Duration::from_secs(60))
        .http1_only()
        .redirect(reqwest::redirect::Policy::limited(10))
        .build()
        .expect("failed to build HTTP client")
});

pub struct KiroHttpClient {
    settings: Arc<Settings>,
}

impl KiroHttpClient {
    pub fn new(settings: Arc<Settings>) -> Self {
        Self { settings }
    }

    fn headers(&self, token: &str) -> Vec<(&'static str, String)> {
        let fp32 = fingerprint32();
        vec![
            ("Authorization", format!("Bearer {}", token)),
            ("Content-Type", "application/json".to_string()),
            (
                "User-Agent",
                format!(
                    "aws-sdk-js/1.0.27 ua/2.1 os/win32#10.0.19044 lang/js md/nodejs#22.21.1 \
                     api/codewhispererstreaming#1.0.27 m/E Kiro2API-{}",
                    fp32
                ),
            ),
            (
                "x-amz-user-agent",
                format!("aws-sdk-js/1.0.27 Kiro2API-{}", fp32),
            ),
            ("x-amzn-codewhisperer-optout", "true".to_string()),
            ("x-amzn-kiro-agent-mode", "vibe".to_string()),
            ("amz-sdk-invocation-id", generate_invocation_id()),
            ("amz-sdk-request", "attempt=1; max=3".to_string()),
        ]
    }

    /// Extracts the model id a payload targets, used to look up adaptive
    /// timeouts when the caller does not already know the model.
    pub fn extract_model_from_payload(payload: &Value) -> Option<String> {
        if let Some(id) = payload.get("modelId").or_else(|| payload.get("model")) {
            if let Some(s) = id.as_str() {
                return Some(s.to_string());
            }
        }
        let current = payload
            .pointer("/conversationState/currentMessage/userInputMessage/modelId")
            .or_else(|| payload.pointer("/conversationState/currentMessage/userInputMessage/model"));
        if let Some(s) = current.and_then(Value::as_str) {
            return Some(s.to_string());
        }
        let history = payload.pointer("/conversationState/history")?.as_array()?;
        for entry in history.iter().rev() {
            if let Some(id) = entry
                .pointer("/userInputMessage/modelId")
                .and_then(Value::as_str)
            {
                return Some(id.to_string());
            }
        }
        None
    }

    /// Posts `body` to `url`, retrying per the status/exception table in
    /// SPEC_FULL.md §4.2. `stream` selects the streaming vs non-streaming
    /// timeout and retry-count family; `model` drives the adaptive timeout
    /// multiplier.
    pub async fn request_with_retry(
        &self,
        token_manager: &TokenManager,
        url: &str,
        body: &Value,
        stream: bool,
        model: &str,
    ) -> Result<Response, GatewayError> {
        // For non-streaming requests this is the authoritative timeout: the
        // whole response body must arrive within it. For streaming requests
        // the real per-chunk enforcement (first-token vs. stream-read,
        // adaptive, with tolerated consecutive timeouts) lives in the
        // emitter's consumption loop; reqwest's own request-level timeout
        // here is only a generous safety net against a connection that
        // never produces a single byte, so it must not be shorter than the
        // emitter's own budget.
        let timeout = if stream {
            self.settings
                .adaptive_timeout(Duration::from_secs(self.settings.stream_read_timeout_sec * 4), model)
        } else {
            self.settings.non_stream_timeout(model)
        };
        let max_retries = if stream {
            self.settings.first_token_max_retries
        } else {
            self.settings.max_retries
        };

        let mut last_err: Option<String> = None;
        for attempt in 0..=max_retries {
            let token = token_manager.get_access_token().await?;
            let mut req = CLIENT.post(url).timeout(timeout).json(body);
            for (name, value) in self.headers(&token) {
                req = req.header(name, value);
            }

            match req.send().await {
                Ok(resp) if resp.status().is_success() => return Ok(resp),
                Ok(resp) if resp.status().as_u16() == 403 => {
                    warn!("upstream 403, forcing token refresh (attempt {attempt})");
                    token_manager.force_refresh().await?;
                    continue;
                }
                Ok(resp)
                    if resp.status().as_u16() == 429 || resp.status().is_server_error() =>
                {
                    last_err = Some(format!("status {}", resp.status()));
                    if attempt < max_retries {
                        sleep_backoff(self.settings.base_retry_delay, attempt).await;
                    }
                }
                Ok(resp) => return Ok(resp),
                Err(e) if e.is_timeout() || e.is_connect() => {
                    last_err = Some(e.to_string());
                    // Streaming first-attempt timeouts do not sleep before
                    // retrying; every other timeout path backs off.
                    if attempt < max_retries && !(stream && attempt == 0) {
                        sleep_backoff(self.settings.base_retry_delay, attempt).await;
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }

        let message = last_err.unwrap_or_else(|| "retries exhausted".to_string());
        if stream {
            Err(GatewayError::FirstTokenTimeout)
        } else {
            Err(GatewayError::RetryExhausted(message))
        }
    }
}

async fn sleep_backoff(base: f64, attempt: u32) {
    let delay = base * 2f64.powi(attempt as i32);
    tokio::time::sleep(Duration::from_secs_f64(delay)).await;
}

pub fn completion_url(region: &str) -> String {
    format!("{}/generateAssistantResponse", kiro_api_host(region))
}

pub fn list_models_url(region: &str, profile_arn: Option<&str>) -> String {
    let mut url = format!(
        "{}/ListAvailableModels?origin=AI_EDITOR",
        crate::config::kiro_q_host(region)
    );
    if let Some(arn) = profile_arn {
        url.push_str("&profileArn=");
        url.push_str(arn);
    }
    url
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn extracts_model_from_top_level() {
        let payload = json!({ "modelId": "claude-haiku-4.5" });
        assert_eq!(
            KiroHttpClient::extract_model_from_payload(&payload),
            Some("claude-haiku-4.5".to_string())
        );
    }

    #[test]
    fn extracts_model_from_current_message() {
        let payload = json!({
            "conversationState": {
                "currentMessage": { "userInputMessage": { "modelId": "claude-opus-4.5" } }
            }
        });
        assert_eq!(
            KiroHttpClient::extract_model_from_payload(&payload),
            Some("claude-opus-4.5".to_string())
        );
    }

    #[test]
    fn extracts_model_from_last_history_entry() {
        let payload = json!({
            "conversationState": {
                "currentMessage": { "userInputMessage": {} },
                "history": [
                    { "userInputMessage": { "modelId": "claude-haiku-4.5" } },
                    { "assistantResponseMessage": {} },
                ]
            }
        });
        assert_eq!(
            KiroHttpClient::extract_model_from_payload(&payload),
            Some("claude-haiku-4.5".to_string())
        );
    }
}
