use std::fmt;

/// Error types that can occur while translating and relaying a chat request.
#[derive(Debug)]
pub enum GatewayError {
    /// Missing or malformed credentials (gate rejection).
    AuthError(String),
    /// Token refresh exhausted its retry budget against the upstream.
    RefreshExhausted(String),
    /// The inbound request could not be translated into an upstream payload.
    TranslationError(String),
    /// The upstream returned a non-2xx response.
    UpstreamError { status: u16, body: String },
    /// No data arrived within the first-token timeout.
    FirstTokenTimeout,
    /// A chunk read exceeded the stream-read timeout past the tolerance.
    StreamReadTimeout,
    /// All retry attempts were exhausted on a non-streaming request.
    RetryExhausted(String),
    /// The client disconnected before the request completed.
    CancellationError,
    /// JSON encode/decode error.
    JsonError(String),
    /// Generic I/O or network error.
    HttpError(String),
}

impl fmt::Display for GatewayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GatewayError::AuthError(e) => write!(f, "Auth error: {}", e),
            GatewayError::RefreshExhausted(e) => write!(f, "Token refresh exhausted: {}", e),
            GatewayError::TranslationError(e) => write!(f, "Translation error: {}", e),
            GatewayError::UpstreamError { status, body } => {
                write!(f, "Upstream error ({}): {}", status, body)
            }
            GatewayError::FirstTokenTimeout => write!(f, "Timed out waiting for first token"),
            GatewayError::StreamReadTimeout => write!(f, "Timed out reading stream"),
            GatewayError::RetryExhausted(e) => write!(f, "Retry attempts exhausted: {}", e),
            GatewayError::CancellationError => write!(f, "Request cancelled"),
            GatewayError::JsonError(e) => write!(f, "JSON error: {}", e),
            GatewayError::HttpError(e) => write!(f, "HTTP error: {}", e),
        }
    }
}

impl std::error::Error for GatewayError {}

impl From<reqwest::Error> for GatewayError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            GatewayError::StreamReadTimeout
        } else {
            GatewayError::HttpError(err.to_string())
        }
    }
}

impl From<serde_json::Error> for GatewayError {
    fn from(err: serde_json::Error) -> Self {
        GatewayError::JsonError(format!(
            "{} at line {} column {}",
            err,
            err.line(),
            err.column()
        ))
    }
}

impl From<std::io::Error> for GatewayError {
    fn from(err: std::io::Error) -> Self {
        GatewayError::HttpError(err.to_string())
    }
}

impl GatewayError {
    /// HTTP status code this error should surface as.
    pub fn status_code(&self) -> u16 {
        match self {
            GatewayError::AuthError(_) => 401,
            GatewayError::RefreshExhausted(_) => 502,
            GatewayError::TranslationError(_) => 400,
            GatewayError::UpstreamError { status, .. } => *status,
            GatewayError::FirstTokenTimeout | GatewayError::StreamReadTimeout => 504,
            GatewayError::RetryExhausted(_) => 502,
            GatewayError::CancellationError => 499,
            GatewayError::JsonError(_) | GatewayError::HttpError(_) => 500,
        }
    }

    /// The `type` field used in the OpenAI-shaped error body.
    pub fn error_type(&self) -> &'static str {
        match self {
            GatewayError::UpstreamError { .. } => "kiro_api_error",
            GatewayError::AuthError(_) | GatewayError::RefreshExhausted(_) => "auth_error",
            GatewayError::TranslationError(_) => "invalid_request_error",
            _ => "internal_error",
        }
    }
}
