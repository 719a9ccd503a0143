//! Process-wide shared state (C1/C3/C5 lifecycle hooks).

use std::sync::Arc;
use std::time::{Duration, Instant};

use kiro_gateway_core::auth::{load_credential_file, CredentialFile, TokenManager};
use kiro_gateway_core::config::Settings;
use kiro_gateway_core::http_client::{KiroHttpClient, CLIENT};
use kiro_gateway_core::model_cache::ModelCache;
use tracing::{info, warn};

/// Everything a request handler needs: the immutable settings, the pooled
/// HTTP dispatcher, and (if default credentials were configured) the shared
/// default principal and its model cache.
#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<Settings>,
    pub http_client: Arc<KiroHttpClient>,
    pub default_token_manager: Option<Arc<TokenManager>>,
    pub model_cache: Option<Arc<ModelCache>>,
    pub started_at: Instant,
}

impl AppState {
    /// Builds the default principal (if any identity was configured),
    /// performs one eager refresh, and starts the model-cache background
    /// refresher. Absence of default credentials is not fatal: the gateway
    /// still serves requests authenticated via the embedded-refresh-token
    /// form of the `Authorization` header (§4.8).
    pub async fn init(settings: Settings) -> Self {
        let settings = Arc::new(settings);
        let http_client = Arc::new(KiroHttpClient::new(settings.clone()));

        let default_token_manager = build_default_credential(&settings)
            .await
            .map(|credential| {
                Arc::new(TokenManager::new(
                    CLIENT.clone(),
                    credential,
                    settings.region.clone(),
                    settings.token_refresh_threshold_sec,
                    settings.max_retries,
                    settings.base_retry_delay,
                    settings.creds_file.clone(),
                ))
            });

        let model_cache = if let Some(token_manager) = &default_token_manager {
            let cache = ModelCache::new(
                Duration::from_secs(settings.model_cache_ttl_sec),
                settings.default_max_input_tokens,
                token_manager.clone(),
            );
            cache.start_background_refresh().await;
            Some(cache)
        } else {
            None
        };

        if let Some(token_manager) = &default_token_manager {
            match token_manager.get_access_token().await {
                Ok(_) => info!("default principal token acquired"),
                Err(e) => warn!("startup token refresh failed: {e}"),
            }
        }
        if let Some(cache) = &model_cache {
            if !cache.refresh().await {
                warn!("startup model cache refresh failed; serving with stale/empty catalogue");
            }
        }

        Self {
            settings,
            http_client,
            default_token_manager,
            model_cache,
            started_at: Instant::now(),
        }
    }

    pub async fn shutdown(&self) {
        if let Some(cache) = &self.model_cache {
            cache.stop_background_refresh().await;
        }
    }
}

/// Builds the default identity's [`CredentialFile`] from `credsFile` (if
/// set) merged with the directly-configured `refreshToken`/`profileArn`, or
/// returns `None` if no default identity was configured at all.
async fn build_default_credential(settings: &Settings) -> Option<CredentialFile> {
    let mut credential = if let Some(path) = &settings.creds_file {
        match load_credential_file(&CLIENT, path).await {
            Ok(c) => c,
            Err(e) => {
                warn!("failed to load credentials file {path}: {e}");
                CredentialFile::default()
            }
        }
    } else {
        CredentialFile::default()
    };

    if credential.refresh_token.is_empty() {
        if let Some(rt) = &settings.refresh_token {
            credential.refresh_token = rt.clone();
        }
    }
    if credential.profile_arn.is_none() {
        credential.profile_arn = settings.profile_arn.clone();
    }
    if credential.refresh_token.is_empty() {
        return None;
    }
    Some(credential)
}
