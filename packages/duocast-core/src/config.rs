//! Core configuration for the coordinator.
//!
//! Groups the knobs that ingestion, scheduling, and persistence need.
//! The server binary builds this from its own YAML/CLI configuration.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Minimum artifact size (per channel) before playback may begin while
/// the transcoder is still running.
pub const DEFAULT_READY_THRESHOLD_BYTES: u64 = 500 * 1024;

/// How often the progressive-ready barrier polls artifact sizes.
pub const DEFAULT_READY_POLL_INTERVAL_MS: u64 = 200;

/// Lead time added to a play broadcast so every peer can schedule the
/// same start instant. Exceeds typical LAN fan-out plus client
/// decode/schedule overhead.
pub const DEFAULT_PLAY_LEAD_MS: u64 = 500;

/// Grace period before an empty, trackless session is dropped.
pub const DEFAULT_SESSION_GC_GRACE_SECS: u64 = 60;

/// Configuration for the Duocast coordinator core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Directory holding one subdirectory per ingested track.
    pub audio_root: PathBuf,

    /// Directory for persistent state (`sessions.json`).
    pub data_dir: PathBuf,

    /// External fetcher command (`--title`, `--duration`, `--stream-url`).
    pub fetcher_bin: String,

    /// External transcoder command (ffmpeg-compatible argument contract).
    pub transcoder_bin: String,

    /// External probe command (`-duration FILE`).
    pub probe_bin: String,

    /// Progressive-ready barrier threshold in bytes (per channel).
    pub ready_threshold_bytes: u64,

    /// Barrier polling interval in milliseconds.
    pub ready_poll_interval_ms: u64,

    /// Scheduling lead added to play broadcasts, in milliseconds.
    pub play_lead_ms: u64,

    /// Seconds an empty, trackless session survives before the sweep.
    pub session_gc_grace_secs: u64,
}

impl Config {
    /// Creates a validated config rooted at the given directories,
    /// with default tool names and timing parameters.
    pub fn new(audio_root: PathBuf, data_dir: PathBuf) -> Result<Self, String> {
        let config = Self {
            audio_root,
            data_dir,
            ..Self::default()
        };
        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration values.
    pub fn validate(&self) -> Result<(), String> {
        if self.fetcher_bin.is_empty() || self.transcoder_bin.is_empty() || self.probe_bin.is_empty()
        {
            return Err("external tool commands must not be empty".to_string());
        }
        if self.ready_threshold_bytes == 0 {
            return Err("ready_threshold_bytes must be >= 1".to_string());
        }
        if self.ready_poll_interval_ms == 0 {
            return Err("ready_poll_interval_ms must be >= 1".to_string());
        }
        Ok(())
    }

    /// Path to the persisted session document.
    #[must_use]
    pub fn sessions_file(&self) -> PathBuf {
        self.data_dir.join("sessions.json")
    }

    /// Directory for one track's artifacts.
    #[must_use]
    pub fn track_dir(&self, track_id: &str) -> PathBuf {
        self.audio_root.join(track_id)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            audio_root: PathBuf::from("audio"),
            data_dir: PathBuf::from("data"),
            fetcher_bin: "fetcher".to_string(),
            transcoder_bin: "transcoder".to_string(),
            probe_bin: "probe".to_string(),
            ready_threshold_bytes: DEFAULT_READY_THRESHOLD_BYTES,
            ready_poll_interval_ms: DEFAULT_READY_POLL_INTERVAL_MS,
            play_lead_ms: DEFAULT_PLAY_LEAD_MS,
            session_gc_grace_secs: DEFAULT_SESSION_GC_GRACE_SECS,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn empty_tool_command_rejected() {
        let config = Config {
            fetcher_bin: String::new(),
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn zero_threshold_rejected() {
        let config = Config {
            ready_threshold_bytes: 0,
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn track_dir_nests_under_audio_root() {
        let config = Config::default();
        assert_eq!(
            config.track_dir("abc123defg"),
            PathBuf::from("audio/abc123defg")
        );
    }
}
