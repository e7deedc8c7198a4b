//! Duocast Core - session coordinator for multi-device stereo playback.
//!
//! This crate provides the server-side functionality for Duocast, a
//! system that turns two or more devices into a synchronised stereo
//! field for a single audio stream: one device plays the left channel,
//! another the right, optional extras play the full mix.
//!
//! # Architecture
//!
//! The crate is organized into several modules:
//!
//! - [`api`]: HTTP/WebSocket surface (dispatcher, library delivery)
//! - [`services`]: session store, ingestion pipeline, library, persistence
//! - [`context`]: network configuration and URL building
//! - [`config`]: coordinator configuration
//! - [`error`]: centralized error types
//!
//! # Abstraction Traits
//!
//! - [`MediaFetcher`](services::ingest::MediaFetcher): external
//!   fetcher/probe invocation, mockable in tests
//! - [`IpDetector`](context::IpDetector): local IP detection
//! - [`MessageTap`](api::MessageTap): transport middleware observing
//!   every envelope before dispatch

#![warn(clippy::all)]

pub mod api;
pub mod config;
pub mod context;
pub mod error;
pub mod services;
pub mod utils;

// Re-export commonly used types at the crate root
pub use config::Config;
pub use context::{IpDetector, LocalIpDetector, NetworkContext, NetworkError, UrlBuilder};
pub use error::{DuocastError, DuocastResult};
pub use utils::now_millis;

// Re-export service types
pub use services::ingest::{ExternalMediaFetcher, IngestPipeline, MediaFetcher};
pub use services::library::{Library, Track, TrackFiles};
pub use services::session_store::{AudioSource, PlaybackState, SessionStore};

// Re-export API types
pub use api::{start_server, AppState, AppStateBuilder, LoggingTap, MessageTap, ServerError};

// Re-export the wire protocol so embedders need only one dependency
pub use duocast_proto as proto;
