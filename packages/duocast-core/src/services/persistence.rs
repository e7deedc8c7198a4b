//! Crash-safe persistence of session↔track bindings.
//!
//! A single JSON document records, for each session with a bound track,
//! its id, creation time, and audio source. Writes happen on every
//! track binding; reads happen once at process start. Ephemeral state
//! (clients, playback position) is never written.
//!
//! The writer merges with the on-disk document so sessions not
//! currently in memory survive other sessions' writes.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::services::session_store::AudioSource;

const SESSIONS_FILE: &str = "sessions.json";

/// One persisted session record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedSession {
    pub id: String,
    /// Milliseconds since the Unix epoch.
    pub created_at: u64,
    pub audio_source: AudioSource,
}

/// On-disk document shape: `{sessions: {id -> record}}`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PersistedSessions {
    pub sessions: HashMap<String, PersistedSession>,
}

/// Serialises all session-document file operations.
///
/// All mutation goes through [`record`](SessionPersistence::record),
/// which holds the lock across its read-merge-write cycle.
pub struct SessionPersistence {
    data_dir: PathBuf,
    lock: Mutex<()>,
}

impl SessionPersistence {
    /// Creates a persistence handle rooted at the given data directory.
    #[must_use]
    pub fn new(data_dir: PathBuf) -> Self {
        Self {
            data_dir,
            lock: Mutex::new(()),
        }
    }

    fn path(&self) -> PathBuf {
        self.data_dir.join(SESSIONS_FILE)
    }

    /// Loads the persisted document.
    ///
    /// Returns the default (empty) document if the file doesn't exist
    /// or is invalid; rehydration must never block startup.
    #[must_use]
    pub fn load(&self) -> PersistedSessions {
        load_document(&self.path())
    }

    /// Records one session binding, merging with the on-disk document.
    ///
    /// Uses atomic write (temp file + rename) to prevent corruption on
    /// crash. Creates the data directory if it doesn't exist.
    pub fn record(&self, session: PersistedSession) -> std::io::Result<()> {
        let _guard = self.lock.lock();
        let mut document = load_document(&self.path());
        document.sessions.insert(session.id.clone(), session);
        self.save(&document)
    }

    fn save(&self, document: &PersistedSessions) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.data_dir)?;
        let path = self.path();
        let temp_path = self.data_dir.join("sessions.json.tmp");
        let contents = serde_json::to_string_pretty(document)?;

        std::fs::write(&temp_path, contents)?;
        std::fs::rename(&temp_path, &path)
    }
}

fn load_document(path: &Path) -> PersistedSessions {
    match std::fs::read_to_string(path) {
        Ok(contents) => serde_json::from_str(&contents).unwrap_or_default(),
        Err(_) => PersistedSessions::default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::library::TrackFiles;

    fn make_record(id: &str) -> PersistedSession {
        PersistedSession {
            id: id.to_string(),
            created_at: 1000,
            audio_source: AudioSource {
                url: "https://youtu.be/abc".to_string(),
                title: "Some Song".to_string(),
                duration: 213.0,
                files: TrackFiles::for_track("abc123defg"),
            },
        }
    }

    #[test]
    fn load_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let persistence = SessionPersistence::new(dir.path().to_path_buf());
        assert!(persistence.load().sessions.is_empty());
    }

    #[test]
    fn load_corrupt_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(SESSIONS_FILE), b"{broken").unwrap();
        let persistence = SessionPersistence::new(dir.path().to_path_buf());
        assert!(persistence.load().sessions.is_empty());
    }

    #[test]
    fn record_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let persistence = SessionPersistence::new(dir.path().to_path_buf());
        persistence.record(make_record("abcd")).unwrap();

        let loaded = persistence.load();
        assert_eq!(loaded.sessions.len(), 1);
        assert_eq!(loaded.sessions["abcd"], make_record("abcd"));
    }

    #[test]
    fn record_merges_with_existing_document() {
        let dir = tempfile::tempdir().unwrap();

        // A previous process run recorded session "old1"
        let earlier = SessionPersistence::new(dir.path().to_path_buf());
        earlier.record(make_record("old1")).unwrap();

        // A new handle (fresh memory) records a different session
        let persistence = SessionPersistence::new(dir.path().to_path_buf());
        persistence.record(make_record("new1")).unwrap();

        let loaded = persistence.load();
        assert_eq!(loaded.sessions.len(), 2);
        assert!(loaded.sessions.contains_key("old1"));
        assert!(loaded.sessions.contains_key("new1"));
    }

    #[test]
    fn record_overwrites_same_session() {
        let dir = tempfile::tempdir().unwrap();
        let persistence = SessionPersistence::new(dir.path().to_path_buf());
        persistence.record(make_record("abcd")).unwrap();

        let mut updated = make_record("abcd");
        updated.audio_source.title = "Another Song".to_string();
        persistence.record(updated.clone()).unwrap();

        let loaded = persistence.load();
        assert_eq!(loaded.sessions["abcd"], updated);
    }

    #[test]
    fn document_wire_shape() {
        let dir = tempfile::tempdir().unwrap();
        let persistence = SessionPersistence::new(dir.path().to_path_buf());
        persistence.record(make_record("abcd")).unwrap();

        let raw = std::fs::read_to_string(dir.path().join(SESSIONS_FILE)).unwrap();
        let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
        let record = &value["sessions"]["abcd"];
        assert_eq!(record["id"], "abcd");
        assert!(record.get("createdAt").is_some());
        let source = &record["audioSource"];
        assert!(source.get("url").is_some());
        assert!(source.get("title").is_some());
        assert!(source.get("duration").is_some());
        assert!(source["files"].get("left").is_some());
        // Ephemeral fields must never be written
        assert!(record.get("clients").is_none());
        assert!(record.get("playbackState").is_none());
    }
}
