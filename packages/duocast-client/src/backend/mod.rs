//! Audio output backend abstraction.
//!
//! The engine schedules playback against an abstract output clock so
//! the scheduling logic stays testable and portable across output
//! stacks. [`CpalBackend`] (behind the `cpal-backend` feature) is the
//! production implementation: a cpal output stream whose rendered-frame
//! counter *is* the backend clock.

use std::sync::Arc;

use crate::decode::DecodedBuffer;
use crate::error::ClientError;

#[cfg(feature = "cpal-backend")]
mod cpal_output;

#[cfg(feature = "cpal-backend")]
pub use cpal_output::CpalBackend;

/// Handle to a scheduled playback source.
pub type SourceId = u64;

/// Whether the output backend is currently allowed to render.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendState {
    Running,
    /// Output is blocked until resumed (mobile autoplay policies).
    Suspended,
}

/// Output clock plus scheduled looping playback.
///
/// `now()` is a monotonic clock in seconds that only advances while the
/// backend renders; all scheduling instants are expressed on it.
pub trait AudioBackend: Send + Sync {
    /// Current render state.
    fn state(&self) -> BackendState;

    /// Attempts to resume a suspended backend.
    ///
    /// # Errors
    ///
    /// `BackendSuspended` when resuming requires a user gesture.
    fn resume(&self) -> Result<(), ClientError>;

    /// Backend clock in seconds.
    fn now(&self) -> f64;

    /// Gain applied to all rendered samples (0.0 - 1.0).
    fn set_gain(&self, gain: f32);

    /// Schedules a fresh looping source over `buffer`, starting
    /// `offset_sec` into it at backend instant `start_at`. Replaces any
    /// active source.
    fn start_source(
        &self,
        buffer: Arc<DecodedBuffer>,
        offset_sec: f64,
        start_at: f64,
    ) -> Result<SourceId, ClientError>;

    /// Stops a source if it is still the active one.
    fn stop_source(&self, id: SourceId);
}
