//! Track model and library enumeration.
//!
//! A track is a fully ingested audio source: a directory under the
//! audio root holding the per-channel artifacts and a `metadata.json`
//! written only after ingestion completed. Directories without parsable
//! metadata are partial or corrupted ingestions and are invisible here,
//! which is what makes failed ingestions self-healing.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use duocast_proto::{Channel, TrackSummary};

use crate::error::{DuocastError, DuocastResult};

const METADATA_FILE: &str = "metadata.json";

/// Server-relative artifact paths for one track.
///
/// These are the exact strings persisted in metadata and session state;
/// absolute URLs are composed per-request from the network context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackFiles {
    pub left: String,
    pub right: String,
    pub stereo: String,
}

impl TrackFiles {
    /// Canonical paths for a track id under the `/audio` library prefix.
    #[must_use]
    pub fn for_track(track_id: &str) -> Self {
        Self {
            left: format!("/audio/{}/{}", track_id, Channel::Left.artifact_file()),
            right: format!("/audio/{}/{}", track_id, Channel::Right.artifact_file()),
            stereo: format!("/audio/{}/{}", track_id, Channel::Stereo.artifact_file()),
        }
    }

    /// Path for a given channel role.
    #[must_use]
    pub fn for_channel(&self, channel: Channel) -> &str {
        match channel {
            Channel::Left => &self.left,
            Channel::Right => &self.right,
            Channel::Stereo => &self.stereo,
        }
    }
}

/// A fully ingested track as recorded in its `metadata.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Track {
    /// Opaque 10-char token, unique across the library.
    pub id: String,
    pub title: String,
    /// Seconds, from the source probe.
    pub duration: f64,
    pub files: TrackFiles,
    pub original_url: String,
    /// Milliseconds since the Unix epoch.
    pub created_at: u64,
}

impl Track {
    /// Listing form for `track_list` envelopes.
    #[must_use]
    pub fn summary(&self) -> TrackSummary {
        TrackSummary {
            id: self.id.clone(),
            title: self.title.clone(),
            duration: self.duration,
        }
    }
}

/// Read-only view over the audio root plus the metadata writer used by
/// ingestion.
pub struct Library {
    audio_root: PathBuf,
}

impl Library {
    /// Creates a library over the given audio root.
    #[must_use]
    pub fn new(audio_root: PathBuf) -> Self {
        Self { audio_root }
    }

    /// Directory holding one track's artifacts.
    #[must_use]
    pub fn track_dir(&self, track_id: &str) -> PathBuf {
        self.audio_root.join(track_id)
    }

    /// Filesystem path of one channel artifact.
    #[must_use]
    pub fn artifact_path(&self, track_id: &str, channel: Channel) -> PathBuf {
        self.track_dir(track_id).join(channel.artifact_file())
    }

    /// Enumerates the library: every subdirectory whose metadata parses,
    /// sorted by `createdAt` descending.
    #[must_use]
    pub fn list(&self) -> Vec<Track> {
        let entries = match std::fs::read_dir(&self.audio_root) {
            Ok(entries) => entries,
            Err(_) => return Vec::new(),
        };

        let mut tracks: Vec<Track> = entries
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.path().is_dir())
            .filter_map(|entry| read_metadata(&entry.path()))
            .collect();

        tracks.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        tracks
    }

    /// Loads a single track by id.
    ///
    /// # Errors
    ///
    /// `TrackNotFound` if the directory or its metadata is missing or
    /// unparsable.
    pub fn get(&self, track_id: &str) -> DuocastResult<Track> {
        read_metadata(&self.track_dir(track_id))
            .ok_or_else(|| DuocastError::TrackNotFound(track_id.to_string()))
    }

    /// Writes a track's metadata atomically (temp file + rename).
    ///
    /// Called by ingestion only after the artifacts are non-empty, so a
    /// parsable metadata file implies a playable track.
    pub fn write_metadata(&self, track: &Track) -> std::io::Result<()> {
        let dir = self.track_dir(&track.id);
        std::fs::create_dir_all(&dir)?;
        let path = dir.join(METADATA_FILE);
        let temp_path = dir.join("metadata.json.tmp");
        let contents = serde_json::to_string_pretty(track)?;

        std::fs::write(&temp_path, contents)?;
        std::fs::rename(&temp_path, &path)
    }
}

/// Reads and parses a track directory's metadata, `None` on any failure.
fn read_metadata(dir: &Path) -> Option<Track> {
    let contents = std::fs::read_to_string(dir.join(METADATA_FILE)).ok()?;
    serde_json::from_str(&contents).ok()
}
