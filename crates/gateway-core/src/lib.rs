//! Core translation, credential, and streaming logic for the Kiro-to-OpenAI
//! gateway: everything that is upstream-protocol- and OpenAI-shape-aware but
//! knows nothing about HTTP routing.
//!
//! The service crate wires these pieces to an `axum` router; this crate has
//! no HTTP-framework dependency of its own, so every component here is
//! directly unit-testable.

pub mod auth;
pub mod config;
pub mod convert;
pub mod emitter;
pub mod error;
pub mod event_stream;
pub mod gate;
pub mod http_client;
pub mod ids;
pub mod model_cache;
pub mod openai;
pub mod stream_session;
pub mod thinking;
pub mod tokenizer;
