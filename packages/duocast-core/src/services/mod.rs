//! Application services layer.
//!
//! Business logic services that sit between the API layer and the
//! filesystem/subprocess infrastructure.

pub mod ingest;
pub mod library;
pub mod persistence;
pub mod session_store;

pub use ingest::{ExternalMediaFetcher, IngestPipeline, MediaFetcher};
pub use library::{Library, Track, TrackFiles};
pub use persistence::{PersistedSession, PersistedSessions, SessionPersistence};
pub use session_store::{AudioSource, PlaybackPatch, PlaybackState, SessionStore};
