//! Model metadata cache (C5): a TTL-bounded map with background refresh.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Deserialize;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::auth::TokenManager;
use crate::http_client::{list_models_url, CLIENT};

#[derive(Debug, Clone, Deserialize)]
pub struct ModelRecord {
    #[serde(rename = "modelId")]
    pub model_id: String,
    #[serde(rename = "tokenLimits", default)]
    pub token_limits: Option<TokenLimits>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TokenLimits {
    #[serde(rename = "maxInputTokens")]
    pub max_input_tokens: u64,
}

#[derive(Debug, Deserialize)]
struct ListModelsResponse {
    #[serde(default)]
    models: Vec<ModelRecord>,
}

struct State {
    entries: HashMap<String, ModelRecord>,
    last_update: Option<Instant>,
}

/// Shared model catalogue cache. `refresh()` replaces the map wholesale;
/// readers never observe a partially-updated map.
pub struct ModelCache {
    state: RwLock<State>,
    ttl: Duration,
    default_max_input_tokens: u64,
    token_manager: Arc<TokenManager>,
    refresh_task: RwLock<Option<JoinHandle<()>>>,
}

impl ModelCache {
    pub fn new(ttl: Duration, default_max_input_tokens: u64, token_manager: Arc<TokenManager>) -> Arc<Self> {
        Arc::new(Self {
            state: RwLock::new(State {
                entries: HashMap::new(),
                last_update: None,
            }),
            ttl,
            default_max_input_tokens,
            token_manager,
            refresh_task: RwLock::new(None),
        })
    }

    pub async fn refresh(&self) -> bool {
        let region = self.token_manager.region().await;
        let profile_arn = self.token_manager.profile_arn().await;
        let token = match self.token_manager.get_access_token().await {
            Ok(t) => t,
            Err(e) => {
                warn!("model cache refresh: token unavailable: {e}");
                return false;
            }
        };
        let url = list_models_url(&region, profile_arn.as_deref());
        let resp = match CLIENT.get(&url).bearer_auth(&token).send().await {
            Ok(r) => r,
            Err(e) => {
                warn!("model cache refresh failed: {e}");
                return false;
            }
        };
        if !resp.status().is_success() {
            warn!("model cache refresh: upstream status {}", resp.status());
            return false;
        }
        let parsed: ListModelsResponse = match resp.json().await {
            Ok(p) => p,
            Err(e) => {
                warn!("model cache refresh: bad body: {e}");
                return false;
            }
        };
        let mut state = self.state.write().await;
        state.entries = parsed
            .models
            .into_iter()
            .map(|m| (m.model_id.clone(), m))
            .collect();
        state.last_update = Some(Instant::now());
        true
    }

    pub async fn get(&self, model_id: &str) -> Option<ModelRecord> {
        self.state.read().await.entries.get(model_id).cloned()
    }

    pub async fn get_max_input_tokens(&self, model_id: &str) -> u64 {
        self.get(model_id)
            .await
            .and_then(|m| m.token_limits.map(|l| l.max_input_tokens))
            .unwrap_or(self.default_max_input_tokens)
    }

    pub async fn is_empty(&self) -> bool {
        self.state.read().await.entries.is_empty()
    }

    pub async fn is_stale(&self) -> bool {
        match self.state.read().await.last_update {
            None => true,
            Some(t) => t.elapsed() > self.ttl,
        }
    }

    pub async fn size(&self) -> usize {
        self.state.read().await.entries.len()
    }

    pub async fn last_update_instant(&self) -> Option<Instant> {
        self.state.read().await.last_update
    }

    pub async fn start_background_refresh(self: &Arc<Self>) {
        let mut task = self.refresh_task.write().await;
        if task.is_some() {
            return;
        }
        let cache = Arc::clone(self);
        let ttl = self.ttl;
        *task = Some(tokio::spawn(async move {
            loop {
                tokio::time::sleep(ttl / 2).await;
                cache.refresh().await;
            }
        }));
    }

    pub async fn stop_background_refresh(&self) {
        if let Some(handle) = self.refresh_task.write().await.take() {
            handle.abort();
            info!("model cache background refresh stopped");
        }
    }

    pub async fn is_background_refresh_running(&self) -> bool {
        self.refresh_task
            .read()
            .await
            .as_ref()
            .map(|h| !h.is_finished())
            .unwrap_or(false)
    }
}
