use std::convert::Infallible;
use std::net::SocketAddr;
use std::pin::Pin;
use std::time::{SystemTime, UNIX_EPOCH};

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use bytes::Bytes as RawBody;
use futures::Stream;
use tower_http::cors::CorsLayer;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use kiro_gateway_core::config::internal_model_id;
use kiro_gateway_core::convert::build_kiro_payload;
use kiro_gateway_core::emitter::ChatCompletionResponse;
use kiro_gateway_core::error::GatewayError;
use kiro_gateway_core::http_client::completion_url;
use kiro_gateway_core::ids::generate_completion_id;
use kiro_gateway_core::openai::{ChatCompletionRequest, ModelList, OpenAiModel};
use kiro_gateway_core::stream_session::StreamSession;

mod error_response;
mod principal;
mod settings;
mod sse;
mod state;
mod tracking;

use state::AppState;

#[tokio::main]
async fn main() {
    let settings = settings::load();

    tracing_subscriber::registry()
        .with(EnvFilter::try_new(&settings.log_level).unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer())
        .init();

    let port = settings.port;
    let state = AppState::init(settings).await;

    let app = Router::new()
        .route("/", get(liveness))
        .route("/api", get(liveness))
        .route("/health", get(health))
        .route("/v1/models", get(list_models))
        .route("/v1/chat/completions", post(chat_completions))
        .layer(axum::middleware::from_fn(tracking::track_request))
        .layer(CorsLayer::permissive())
        .with_state(state.clone());

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!(%addr, "starting kiro gateway");
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("failed to bind listen address");

    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown_signal(state))
        .await
        .expect("server error");
}

async fn shutdown_signal(state: AppState) {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };
    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!("shutdown signal received, draining background tasks");
    state.shutdown().await;
}

const VERSION: &str = env!("CARGO_PKG_VERSION");

async fn liveness() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "message": "kiro gateway is running",
        "version": VERSION,
    }))
}

async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    let token_valid = match &state.default_token_manager {
        Some(tm) => tm.has_valid_token().await,
        None => false,
    };
    let (cache_size, cache_last_update) = match &state.model_cache {
        Some(cache) => (
            cache.size().await,
            cache.last_update_instant().await.map(|i| i.elapsed().as_secs()),
        ),
        None => (0, None),
    };
    Json(serde_json::json!({
        "status": "ok",
        "timestamp": now_unix(),
        "version": VERSION,
        "token_valid": token_valid,
        "cache_size": cache_size,
        "cache_last_update": cache_last_update,
    }))
}

fn bearer_header(headers: &HeaderMap) -> Option<&str> {
    headers.get(axum::http::header::AUTHORIZATION)?.to_str().ok()
}

async fn list_models(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if let Err(e) = principal::resolve(&state, bearer_header(&headers)).await {
        return error_response::render(&e, state.settings.debug_mode);
    }
    let data = kiro_gateway_core::config::AVAILABLE_MODELS
        .iter()
        .map(|id| OpenAiModel {
            id: id.to_string(),
            object: "model",
            owned_by: "anthropic",
            description: "Claude model served through the Kiro gateway",
        })
        .collect();
    Json(ModelList { object: "list", data }).into_response()
}

fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

async fn chat_completions(State(state): State<AppState>, headers: HeaderMap, raw_body: RawBody) -> Response {
    let token_manager = match principal::resolve(&state, bearer_header(&headers)).await {
        Ok(tm) => tm,
        Err(e) => return error_response::render(&e, state.settings.debug_mode),
    };

    let request: ChatCompletionRequest = match serde_json::from_slice(&raw_body) {
        Ok(r) => r,
        Err(e) => return error_response::unprocessable_entity(e.to_string(), &raw_body),
    };

    let payload = match build_kiro_payload(&request, &state.settings) {
        Ok(p) => p,
        Err(e) => return error_response::render(&e, state.settings.debug_mode),
    };

    let region = token_manager.region().await;
    let url = completion_url(&region);

    let resp = match state
        .http_client
        .request_with_retry(&token_manager, &url, &payload, request.stream, &request.model)
        .await
    {
        Ok(r) => r,
        Err(e) => return error_response::render(&e, state.settings.debug_mode),
    };

    if !resp.status().is_success() {
        let status = resp.status().as_u16();
        let body = resp.text().await.unwrap_or_default();
        return error_response::render(&GatewayError::UpstreamError { status, body }, state.settings.debug_mode);
    }

    let internal_model = match internal_model_id(&request.model) {
        Ok(id) => id,
        Err(e) => return error_response::render(&GatewayError::TranslationError(e), state.settings.debug_mode),
    };
    let max_input_tokens = match &state.model_cache {
        Some(cache) => cache.get_max_input_tokens(&internal_model).await,
        None => state.settings.default_max_input_tokens,
    };

    let id = generate_completion_id();
    let created = now_unix();
    let model = request.model.clone();
    let tools = request.tools.clone();

    if request.stream {
        stream_response(state, resp, id, created, model, request, tools, max_input_tokens).await
    } else {
        aggregated_response(state, resp, id, created, model, request, tools, max_input_tokens).await
    }
}

type ByteStream = Pin<Box<dyn Stream<Item = reqwest::Result<bytes::Bytes>> + Send>>;

async fn stream_response(
    state: AppState,
    resp: reqwest::Response,
    id: String,
    created: u64,
    model: String,
    request: ChatCompletionRequest,
    tools: Option<Vec<kiro_gateway_core::openai::Tool>>,
    max_input_tokens: u64,
) -> Response {
    let byte_stream: ByteStream = Box::pin(resp.bytes_stream());
    let session = StreamSession::new(id, created, model.clone(), &state.settings);
    let first_token_timeout = state.settings.first_token_timeout(&model);

    match sse::await_first_chunk(byte_stream, session, first_token_timeout).await {
        Ok(sse::FirstChunkOutcome::EmptyBody) => {
            let empty = futures::stream::once(async { Ok::<_, Infallible>(Event::default().data("[DONE]")) });
            Sse::new(empty).keep_alive(KeepAlive::default()).into_response()
        }
        Ok(sse::FirstChunkOutcome::Ready { session, byte_stream, first_events }) => {
            let stream = sse::pump(
                byte_stream,
                session,
                first_events,
                state.settings.clone(),
                model,
                request.messages,
                tools,
                max_input_tokens,
            );
            Sse::new(stream).keep_alive(KeepAlive::default()).into_response()
        }
        Err(e) => error_response::render(&e, state.settings.debug_mode),
    }
}

async fn aggregated_response(
    state: AppState,
    resp: reqwest::Response,
    id: String,
    created: u64,
    model: String,
    request: ChatCompletionRequest,
    tools: Option<Vec<kiro_gateway_core::openai::Tool>>,
    max_input_tokens: u64,
) -> Response {
    let mut session = StreamSession::new(id.clone(), created, model.clone(), &state.settings);
    let bytes = match resp.bytes().await {
        Ok(b) => b,
        Err(e) => return error_response::render(&GatewayError::from(e), state.settings.debug_mode),
    };
    session.process_chunk(&bytes);
    let finalized = session.finalize(&request.messages, tools.as_deref(), max_input_tokens);

    let body = ChatCompletionResponse::new(
        id,
        created,
        model,
        finalized.visible_content,
        finalized.reasoning_content,
        &finalized.tool_calls,
        finalized.usage,
    );
    (StatusCode::OK, Json(body)).into_response()
}
