//! Credential resolution and token lifecycle management (C3).
//!
//! Mirrors the two-phase resolve/refresh split used elsewhere in this
//! codebase for async credentials: callers await [`TokenManager::get_access_token`]
//! before every outbound call, and the manager performs at most one upstream
//! refresh at a time per principal via an internal lock.

use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::config::{aws_sso_oidc_url, kiro_refresh_url};
use crate::error::GatewayError;
use crate::ids::fingerprint16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthType {
    Social,
    Idc,
}

/// On-disk / wire shape of a credential record.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CredentialFile {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
    pub refresh_token: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub profile_arn: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,
}

struct Inner {
    auth_type: AuthType,
    refresh_token: String,
    access_token: Option<String>,
    /// Unix epoch seconds at which `access_token` should be considered expired.
    expires_at: Option<u64>,
    profile_arn: Option<String>,
    region: String,
    client_id: Option<String>,
    client_secret: Option<String>,
    creds_file_path: Option<String>,
}

/// Per-principal access-token manager. One instance per distinct refresh
/// token; construction is cheap, refresh is serialized through `lock`.
pub struct TokenManager {
    inner: Mutex<Inner>,
    client: Client,
    refresh_threshold_sec: u64,
    max_retries: u32,
    base_retry_delay: f64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RefreshResponse {
    access_token: Option<String>,
    refresh_token: Option<String>,
    profile_arn: Option<String>,
    expires_in: Option<u64>,
}

impl TokenManager {
    pub fn new(
        client: Client,
        credential: CredentialFile,
        region: String,
        refresh_threshold_sec: u64,
        max_retries: u32,
        base_retry_delay: f64,
        creds_file_path: Option<String>,
    ) -> Self {
        let auth_type = if credential.client_id.is_some() && credential.client_secret.is_some() {
            AuthType::Idc
        } else {
            AuthType::Social
        };
        let expires_at = credential
            .expires_at
            .as_deref()
            .and_then(parse_iso8601_epoch);
        Self {
            inner: Mutex::new(Inner {
                auth_type,
                refresh_token: credential.refresh_token,
                access_token: credential.access_token,
                expires_at,
                profile_arn: credential.profile_arn,
                region: if credential.region.as_deref().unwrap_or("").is_empty() {
                    region
                } else {
                    credential.region.unwrap()
                },
                client_id: credential.client_id,
                client_secret: credential.client_secret,
                creds_file_path,
            }),
            client,
            refresh_threshold_sec,
            max_retries,
            base_retry_delay,
        }
    }

    pub async fn profile_arn(&self) -> Option<String> {
        self.inner.lock().await.profile_arn.clone()
    }

    pub async fn region(&self) -> String {
        self.inner.lock().await.region.clone()
    }

    /// Returns a token guaranteed valid for at least `refresh_threshold_sec`
    /// more seconds, refreshing under lock if needed.
    pub async fn get_access_token(&self) -> Result<String, GatewayError> {
        let mut guard = self.inner.lock().await;
        if let (Some(token), Some(expires_at)) = (&guard.access_token, guard.expires_at) {
            if now_epoch() + self.refresh_threshold_sec < expires_at {
                return Ok(token.clone());
            }
        }
        self.refresh_locked(&mut guard).await
    }

    /// Reports whether a non-expired access token is currently cached,
    /// without triggering a refresh. Used by the `/health` endpoint.
    pub async fn has_valid_token(&self) -> bool {
        let guard = self.inner.lock().await;
        matches!(
            (&guard.access_token, guard.expires_at),
            (Some(_), Some(expires_at)) if now_epoch() < expires_at
        )
    }

    pub async fn force_refresh(&self) -> Result<String, GatewayError> {
        let mut guard = self.inner.lock().await;
        self.refresh_locked(&mut guard).await
    }

    async fn refresh_locked(&self, guard: &mut Inner) -> Result<String, GatewayError> {
        let mut attempt: u32 = 0;
        loop {
            let result = match guard.auth_type {
                AuthType::Social => self.refresh_social(guard).await,
                AuthType::Idc => self.refresh_idc(guard).await,
            };
            match result {
                Ok(response) => {
                    self.apply_response(guard, response);
                    self.persist(guard).await;
                    return Ok(guard.access_token.clone().unwrap());
                }
                Err(RefreshAttemptError::Retryable(msg)) if attempt < self.max_retries => {
                    attempt += 1;
                    let delay = self.base_retry_delay * 2f64.powi(attempt as i32 - 1);
                    warn!(attempt, delay, "token refresh retrying: {msg}");
                    tokio::time::sleep(std::time::Duration::from_secs_f64(delay)).await;
                }
                Err(RefreshAttemptError::Retryable(msg)) => {
                    return Err(GatewayError::RefreshExhausted(format!(
                        "token refresh exhausted retries: {msg}"
                    )));
                }
                Err(RefreshAttemptError::Fatal(msg)) => {
                    return Err(GatewayError::AuthError(msg));
                }
            }
        }
    }

    async fn refresh_social(&self, guard: &Inner) -> Result<RefreshResponse, RefreshAttemptError> {
        let url = kiro_refresh_url(&guard.region);
        let body = json!({ "refreshToken": guard.refresh_token });
        let resp = self
            .client
            .post(&url)
            .header("User-Agent", format!("Kiro2API-{}", fingerprint16()))
            .json(&body)
            .send()
            .await
            .map_err(classify_reqwest_err)?;
        handle_refresh_response(resp).await
    }

    async fn refresh_idc(&self, guard: &Inner) -> Result<RefreshResponse, RefreshAttemptError> {
        let url = aws_sso_oidc_url(&guard.region);
        let body = json!({
            "clientId": guard.client_id,
            "clientSecret": guard.client_secret,
            "grantType": "refresh_token",
            "refreshToken": guard.refresh_token,
        });
        let resp = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(classify_reqwest_err)?;
        // The IDC branch never unwraps non-429 4xx statuses; they abort
        // immediately without retry.
        if resp.status().is_client_error() && resp.status().as_u16() != 429 {
            let status = resp.status().as_u16();
            let text = resp.text().await.unwrap_or_default();
            return Err(RefreshAttemptError::Fatal(format!(
                "IDC refresh rejected ({status}): {text}"
            )));
        }
        handle_refresh_response(resp).await
    }

    fn apply_response(&self, guard: &mut Inner, response: RefreshResponse) {
        if let Some(token) = response.access_token {
            guard.access_token = Some(token);
        }
        if let Some(refresh_token) = response.refresh_token {
            guard.refresh_token = refresh_token;
        }
        if let Some(profile_arn) = response.profile_arn {
            guard.profile_arn = Some(profile_arn);
        }
        let expires_in = response.expires_in.unwrap_or(3600);
        guard.expires_at = Some(now_epoch() + expires_in.saturating_sub(60));
    }

    async fn persist(&self, guard: &Inner) {
        let Some(path) = &guard.creds_file_path else {
            return;
        };
        if path.starts_with("http://") || path.starts_with("https://") {
            return;
        }
        let mut record = std::fs::read_to_string(path)
            .ok()
            .and_then(|s| serde_json::from_str::<CredentialFile>(&s).ok())
            .unwrap_or_default();
        record.access_token = guard.access_token.clone();
        record.refresh_token = guard.refresh_token.clone();
        record.profile_arn = guard.profile_arn.clone();
        record.region = Some(guard.region.clone());
        record.client_id = guard.client_id.clone();
        record.client_secret = guard.client_secret.clone();
        if let Some(expires_at) = guard.expires_at {
            record.expires_at = Some(epoch_to_iso8601(expires_at));
        }
        if let Ok(serialized) = serde_json::to_string_pretty(&record) {
            if let Err(e) = std::fs::write(path, serialized) {
                warn!("failed to persist credential file {path}: {e}");
            }
        }
    }
}

enum RefreshAttemptError {
    Retryable(String),
    Fatal(String),
}

fn classify_reqwest_err(err: reqwest::Error) -> RefreshAttemptError {
    if err.is_timeout() || err.is_connect() {
        RefreshAttemptError::Retryable(err.to_string())
    } else {
        RefreshAttemptError::Fatal(err.to_string())
    }
}

async fn handle_refresh_response(
    resp: reqwest::Response,
) -> Result<RefreshResponse, RefreshAttemptError> {
    let status = resp.status();
    if status.as_u16() == 429 || status.is_server_error() {
        return Err(RefreshAttemptError::Retryable(format!(
            "status {}",
            status.as_u16()
        )));
    }
    if !status.is_success() {
        let text = resp.text().await.unwrap_or_default();
        return Err(RefreshAttemptError::Fatal(format!(
            "status {}: {}",
            status.as_u16(),
            text
        )));
    }
    let parsed: RefreshResponse = resp
        .json()
        .await
        .map_err(|e| RefreshAttemptError::Fatal(e.to_string()))?;
    if parsed.access_token.is_none() {
        return Err(RefreshAttemptError::Fatal(
            "refresh response missing accessToken".to_string(),
        ));
    }
    Ok(parsed)
}

/// Reads a credential either from a local JSON file or, if `source` looks
/// like a URL, by fetching it (short timeout, best-effort).
pub async fn load_credential_file(
    client: &Client,
    source: &str,
) -> Result<CredentialFile, GatewayError> {
    if source.starts_with("http://") || source.starts_with("https://") {
        let resp = client
            .get(source)
            .timeout(std::time::Duration::from_secs(10))
            .send()
            .await?;
        Ok(resp.json().await?)
    } else {
        if !Path::new(source).exists() {
            warn!("credentials file {source} does not exist; continuing without it");
            return Ok(CredentialFile::default());
        }
        let text = std::fs::read_to_string(source)?;
        Ok(serde_json::from_str(&text)?)
    }
}

fn now_epoch() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn parse_iso8601_epoch(value: &str) -> Option<u64> {
    chrono::DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|dt| dt.timestamp().max(0) as u64)
}

fn epoch_to_iso8601(epoch: u64) -> String {
    chrono::DateTime::<chrono::Utc>::from_timestamp(epoch as i64, 0)
        .map(|dt| dt.to_rfc3339())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn idc_auth_type_requires_client_credentials() {
        let cred = CredentialFile {
            refresh_token: "rt".into(),
            client_id: Some("id".into()),
            client_secret: Some("secret".into()),
            ..Default::default()
        };
        let manager = TokenManager::new(
            Client::new(),
            cred,
            "us-east-1".into(),
            600,
            3,
            1.0,
            None,
        );
        assert_eq!(manager.inner.lock().await.auth_type, AuthType::Idc);
    }

    #[tokio::test]
    async fn social_auth_type_is_default() {
        let cred = CredentialFile {
            refresh_token: "rt".into(),
            ..Default::default()
        };
        let manager = TokenManager::new(Client::new(), cred, "us-east-1".into(), 600, 3, 1.0, None);
        assert_eq!(manager.inner.lock().await.auth_type, AuthType::Social);
    }
}
