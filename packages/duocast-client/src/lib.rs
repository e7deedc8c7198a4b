//! Duocast Client - the device-side half of the stereo field.
//!
//! Each participating device runs this engine: it estimates its clock
//! offset against the coordinator, fetches its channel artifact, and
//! starts playback at the shared scheduled instant.
//!
//! # Modules
//!
//! - [`clock`]: ping/pong clock-offset estimation (median over 5)
//! - [`decode`]: byte buffer to PCM via symphonia
//! - [`backend`]: output abstraction and the cpal implementation
//! - [`engine`]: scheduled-start playback engine
//! - [`status`]: display status machine
//! - [`session`]: WebSocket session client tying it all together

#![warn(clippy::all)]

pub mod backend;
pub mod clock;
pub mod decode;
pub mod engine;
pub mod error;
pub mod session;
pub mod status;

pub use backend::{AudioBackend, BackendState, SourceId};
#[cfg(feature = "cpal-backend")]
pub use backend::CpalBackend;
pub use clock::{ClockSync, SyncSample};
pub use decode::{decode_bytes, DecodedBuffer};
pub use engine::{AudioEngine, EngineObserver};
pub use error::ClientError;
pub use session::{SessionClient, SessionObserver};
pub use status::{RefusedTransition, Status, StatusEvent, StatusMachine};

// Re-export the wire protocol so embedders need only one dependency
pub use duocast_proto as proto;
