//! Wires the pure authorization-gate decision (C10, `kiro_gateway_core::gate`)
//! to concrete `TokenManager` selection: the shared default principal, or a
//! freshly-minted one from an embedded refresh token.

use std::sync::Arc;

use kiro_gateway_core::auth::{CredentialFile, TokenManager};
use kiro_gateway_core::error::GatewayError;
use kiro_gateway_core::gate::{self, GateDecision};
use kiro_gateway_core::http_client::CLIENT;

use crate::state::AppState;

const AUTH_FAILURE_MESSAGE: &str = "API Key invalid or missing";

/// Resolves an inbound `Authorization` header into the `TokenManager` that
/// should service this request. Per the design notes, the embedded-token
/// form always mints a fresh manager rather than caching one per secret —
/// one extra refresh per request, in exchange for not growing an unbounded
/// principal table.
pub async fn resolve(state: &AppState, authorization: Option<&str>) -> Result<Arc<TokenManager>, GatewayError> {
    let header_value = authorization.ok_or_else(|| GatewayError::AuthError(AUTH_FAILURE_MESSAGE.to_string()))?;
    let decision = gate::evaluate(header_value, &state.settings.proxy_api_key)
        .ok_or_else(|| GatewayError::AuthError(AUTH_FAILURE_MESSAGE.to_string()))?;

    match decision {
        GateDecision::UseDefault => state
            .default_token_manager
            .clone()
            .ok_or_else(|| GatewayError::AuthError("no default credentials configured".to_string())),
        GateDecision::UseEmbeddedRefreshToken(refresh_token) => {
            let credential = CredentialFile {
                refresh_token,
                profile_arn: state.settings.profile_arn.clone(),
                region: Some(state.settings.region.clone()),
                ..Default::default()
            };
            Ok(Arc::new(TokenManager::new(
                CLIENT.clone(),
                credential,
                state.settings.region.clone(),
                state.settings.token_refresh_threshold_sec,
                state.settings.max_retries,
                state.settings.base_retry_delay,
                None,
            )))
        }
    }
}
