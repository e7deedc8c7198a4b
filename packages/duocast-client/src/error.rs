//! Client-side error types.

use thiserror::Error;

/// Errors surfaced by the client engine and session wiring.
#[derive(Debug, Error)]
pub enum ClientError {
    /// The audio backend is suspended and resuming needs a user
    /// gesture. Surfaced to the UI as a prompt, never fatal.
    #[error("audio backend is suspended and needs a user gesture")]
    BackendSuspended,

    /// Playback was requested before any audio was loaded.
    #[error("no audio loaded")]
    NotLoaded,

    /// The fetched bytes could not be decoded to PCM.
    #[error("decode error: {0}")]
    Decode(String),

    /// The audio output device failed.
    #[error("output error: {0}")]
    Output(String),

    /// Artifact fetch failed.
    #[error("fetch error: {0}")]
    Fetch(String),

    /// WebSocket transport failure.
    #[error("websocket error: {0}")]
    WebSocket(String),

    /// Unexpected message or serialization failure.
    #[error("protocol error: {0}")]
    Protocol(String),
}
