//! Configuration loading (C15, ambient): materializes [`kiro_gateway_core::config::Settings`]
//! from process environment variables (and an optional `.env` file), with
//! `clap`'s `env` feature doing the lookup/parsing/defaulting.
//!
//! Unrecognized env vars are ignored (nothing here reads the whole
//! environment); invalid enum-shaped values fall back to their default
//! rather than erroring, matching the upstream reference's validator
//! behavior.

use clap::Parser;
use kiro_gateway_core::config::{DebugMode, FakeReasoningHandling, Settings};

#[derive(Parser, Debug)]
#[command(author, version, about = "OpenAI-compatible gateway in front of the Kiro upstream")]
pub struct EnvArgs {
    #[arg(long, env = "PROXY_API_KEY", default_value = "changeme_proxy_secret")]
    proxy_api_key: String,

    #[arg(long, env = "REFRESH_TOKEN")]
    refresh_token: Option<String>,
    #[arg(long, env = "PROFILE_ARN")]
    profile_arn: Option<String>,
    #[arg(long, env = "KIRO_REGION", default_value = "us-east-1")]
    kiro_region: String,
    #[arg(long, env = "KIRO_CREDS_FILE")]
    kiro_creds_file: Option<String>,

    #[arg(long, env = "TOKEN_REFRESH_THRESHOLD_SEC", default_value_t = 600)]
    token_refresh_threshold_sec: u64,

    #[arg(long, env = "MAX_RETRIES", default_value_t = 3)]
    max_retries: u32,
    #[arg(long, env = "BASE_RETRY_DELAY", default_value_t = 1.0)]
    base_retry_delay: f64,

    #[arg(long, env = "FIRST_TOKEN_TIMEOUT", default_value_t = 120)]
    first_token_timeout: u64,
    #[arg(long, env = "FIRST_TOKEN_MAX_RETRIES", default_value_t = 3)]
    first_token_max_retries: u32,
    #[arg(long, env = "STREAM_READ_TIMEOUT", default_value_t = 300)]
    stream_read_timeout: u64,
    #[arg(long, env = "NON_STREAM_TIMEOUT", default_value_t = 900)]
    non_stream_timeout: u64,

    #[arg(long, env = "SLOW_MODEL_TIMEOUT_MULTIPLIER", default_value_t = 3.0)]
    slow_model_timeout_multiplier: f64,

    #[arg(long, env = "MODEL_CACHE_TTL", default_value_t = 3600)]
    model_cache_ttl: u64,
    #[arg(long, env = "DEFAULT_MAX_INPUT_TOKENS", default_value_t = 200_000)]
    default_max_input_tokens: u64,

    #[arg(long, env = "TOOL_DESCRIPTION_MAX_LENGTH", default_value_t = 10_000)]
    tool_description_max_length: i64,

    #[arg(long, env = "FAKE_REASONING_ENABLED", default_value_t = true)]
    fake_reasoning_enabled: bool,
    #[arg(long, env = "FAKE_REASONING_MAX_TOKENS", default_value_t = 4000)]
    fake_reasoning_max_tokens: usize,
    #[arg(long, env = "FAKE_REASONING_HANDLING", default_value = "as_reasoning_content")]
    fake_reasoning_handling: String,
    #[arg(long, env = "FAKE_REASONING_INITIAL_BUFFER_SIZE", default_value_t = 20)]
    fake_reasoning_initial_buffer_size: usize,

    #[arg(long, env = "LOG_LEVEL", default_value = "INFO")]
    log_level: String,
    #[arg(long, env = "DEBUG_MODE", default_value = "off")]
    debug_mode: String,
    #[arg(long, env = "PORT", default_value_t = 8000)]
    port: u16,
}

/// Loads an optional `.env` file (best-effort, absence is not an error),
/// then parses `EnvArgs` and converts it into the immutable [`Settings`]
/// record every component consults.
pub fn load() -> Settings {
    if let Err(e) = dotenvy::dotenv() {
        if !matches!(e, dotenvy::Error::Io(ref io) if io.kind() == std::io::ErrorKind::NotFound) {
            tracing::warn!("failed to load .env file: {e}");
        }
    }
    let args = EnvArgs::parse();

    let mut settings = Settings::default();
    settings.proxy_api_key = args.proxy_api_key;
    settings.refresh_token = args.refresh_token;
    settings.profile_arn = args.profile_arn;
    settings.region = args.kiro_region;
    settings.creds_file = args.kiro_creds_file;
    settings.token_refresh_threshold_sec = args.token_refresh_threshold_sec;
    settings.max_retries = args.max_retries;
    settings.base_retry_delay = args.base_retry_delay;
    settings.first_token_timeout_sec = args.first_token_timeout;
    settings.first_token_max_retries = args.first_token_max_retries;
    settings.stream_read_timeout_sec = args.stream_read_timeout;
    settings.non_stream_timeout_sec = args.non_stream_timeout;
    settings.slow_model_timeout_multiplier = args.slow_model_timeout_multiplier;
    settings.model_cache_ttl_sec = args.model_cache_ttl;
    settings.default_max_input_tokens = args.default_max_input_tokens;
    settings.tool_description_max_length = args.tool_description_max_length;
    settings.fake_reasoning_enabled = args.fake_reasoning_enabled;
    settings.fake_reasoning_max_tokens = args.fake_reasoning_max_tokens;
    settings.fake_reasoning_handling = FakeReasoningHandling::parse(&args.fake_reasoning_handling);
    settings.fake_reasoning_initial_buffer_size = args.fake_reasoning_initial_buffer_size;
    settings.log_level = args.log_level;
    settings.debug_mode = DebugMode::parse(&args.debug_mode);
    settings.port = args.port;
    // `slow_models` and `fake_reasoning_open_tags` keep their compiled-in
    // defaults: the upstream reference does not expose env overrides for
    // either, since both are small fixed sets tied to model-naming and
    // tag-vocabulary conventions rather than deployment config.
    settings
}
