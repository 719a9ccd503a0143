//! Streaming-path glue: paces reads off the upstream byte stream with the
//! adaptive first-token / stream-read timeouts from §4.5 and §5, and turns
//! the resulting [`StreamSession`] output into `axum` SSE events.

use std::collections::VecDeque;
use std::convert::Infallible;
use std::pin::Pin;

use axum::response::sse::Event;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use kiro_gateway_core::config::Settings;
use kiro_gateway_core::emitter::ChatCompletionChunk;
use kiro_gateway_core::error::GatewayError;
use kiro_gateway_core::openai::{ChatMessage, Tool};
use kiro_gateway_core::stream_session::StreamSession;

type ByteStream = Pin<Box<dyn Stream<Item = reqwest::Result<Bytes>> + Send>>;

/// Consumed once: awaits the first upstream byte chunk under the adaptive
/// first-token timeout, *before* any SSE bytes are sent to the client, so a
/// timeout here can still surface as a proper 504 rather than a truncated
/// body. Returns the queue of events the first chunk produced, plus the
/// session and byte stream to hand off to [`pump`] for the remainder.
pub enum FirstChunkOutcome {
    /// Upstream closed the body before sending anything: per §4.5, emit a
    /// bare terminator and stop.
    EmptyBody,
    Ready {
        session: StreamSession,
        byte_stream: ByteStream,
        first_events: Vec<ChatCompletionChunk>,
    },
}

pub async fn await_first_chunk(
    mut byte_stream: ByteStream,
    mut session: StreamSession,
    first_token_timeout: std::time::Duration,
) -> Result<FirstChunkOutcome, GatewayError> {
    match tokio::time::timeout(first_token_timeout, byte_stream.next()).await {
        Ok(Some(Ok(bytes))) => {
            let first_events = session.process_chunk(&bytes);
            Ok(FirstChunkOutcome::Ready { session, byte_stream, first_events })
        }
        Ok(Some(Err(e))) => Err(GatewayError::HttpError(format!("stream read failed: {e}"))),
        Ok(None) => Ok(FirstChunkOutcome::EmptyBody),
        Err(_elapsed) => Err(GatewayError::FirstTokenTimeout),
    }
}

struct PumpState {
    byte_stream: ByteStream,
    session: Option<StreamSession>,
    pending: VecDeque<Event>,
    consecutive_timeouts: u32,
    settings: std::sync::Arc<Settings>,
    model: String,
    request_messages: Vec<ChatMessage>,
    tools: Option<Vec<Tool>>,
    max_input_tokens: u64,
    finished: bool,
}

fn chunk_event(chunk: &ChatCompletionChunk) -> Event {
    Event::default().data(serde_json::to_string(chunk).unwrap_or_default())
}

/// Builds the full SSE stream for a non-empty body: the already-parsed
/// first-chunk events, followed by the rest of the upstream body paced by
/// `streamReadTimeout` (tolerating up to 3 consecutive timeouts before
/// truncating, per §5), followed by the trailing tool_calls/terminal chunks
/// and `[DONE]`.
pub fn pump(
    byte_stream: ByteStream,
    session: StreamSession,
    first_events: Vec<ChatCompletionChunk>,
    settings: std::sync::Arc<Settings>,
    model: String,
    request_messages: Vec<ChatMessage>,
    tools: Option<Vec<Tool>>,
    max_input_tokens: u64,
) -> impl Stream<Item = Result<Event, Infallible>> {
    let state = PumpState {
        byte_stream,
        session: Some(session),
        pending: first_events.iter().map(chunk_event).collect(),
        consecutive_timeouts: 0,
        settings,
        model,
        request_messages,
        tools,
        max_input_tokens,
        finished: false,
    };

    futures::stream::unfold(state, |mut state| async move {
        loop {
            if let Some(event) = state.pending.pop_front() {
                return Some((Ok(event), state));
            }
            if state.finished {
                return None;
            }

            let timeout = state.settings.stream_read_timeout(&state.model);
            match tokio::time::timeout(timeout, state.byte_stream.next()).await {
                Ok(Some(Ok(bytes))) => {
                    state.consecutive_timeouts = 0;
                    let chunks = state.session.as_mut().expect("session present while streaming").process_chunk(&bytes);
                    state.pending.extend(chunks.iter().map(chunk_event));
                }
                Ok(Some(Err(e))) => {
                    tracing::error!(error = %e, "upstream stream read failed; truncating SSE body");
                    state.finished = true;
                    return None;
                }
                Ok(None) => {
                    let session = state.session.take().expect("session present at end of stream");
                    let finalized = session.finalize(&state.request_messages, state.tools.as_deref(), state.max_input_tokens);
                    state.pending.extend(finalized.trailing_chunks.iter().map(chunk_event));
                    state.pending.push_back(Event::default().data("[DONE]"));
                    state.finished = true;
                }
                Err(_elapsed) => {
                    state.consecutive_timeouts += 1;
                    if state.consecutive_timeouts > 3 {
                        tracing::error!("stream-read timeout exceeded tolerance; truncating SSE body without [DONE]");
                        state.finished = true;
                        return None;
                    }
                }
            }
        }
    })
}
