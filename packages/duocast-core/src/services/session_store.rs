//! In-memory sessions, channel assignment, and broadcast fan-out.
//!
//! The store exclusively owns Session and Client records; everything
//! mutates through its methods. Each session carries its own
//! `parking_lot::Mutex`, and every read-modify-write happens under that
//! lock, so broadcasts never observe a partially updated roster or
//! playback state and channel counts are consistent at assignment time.
//! Locks are never held across awaits; outbound messages go through
//! unbounded per-client queues, so a slow peer cannot stall the fan-out.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use duocast_proto::{Channel, ClientSummary, ServerMessage};

use crate::config::Config;
use crate::error::{DuocastError, DuocastResult};
use crate::services::library::{Track, TrackFiles};
use crate::services::persistence::{PersistedSession, SessionPersistence};
use crate::utils::{new_client_id, now_millis};

/// Outbound queue handle for one client connection.
pub type ClientSender = mpsc::UnboundedSender<ServerMessage>;

// ─────────────────────────────────────────────────────────────────────────────
// Data model
// ─────────────────────────────────────────────────────────────────────────────

/// Ephemeral playback state of a session. Never persisted.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaybackState {
    pub is_playing: bool,
    /// Seconds into the track at `last_sync_at`.
    pub current_time: f64,
    /// Milliseconds since the Unix epoch of the last playback mutation.
    pub last_sync_at: u64,
}

impl PlaybackState {
    fn reset(now: u64) -> Self {
        Self {
            is_playing: false,
            current_time: 0.0,
            last_sync_at: now,
        }
    }

    /// Position estimate at `now`, advancing `current_time` by wall
    /// clock while playing.
    #[must_use]
    pub fn estimated_position(&self, now: u64) -> f64 {
        if self.is_playing {
            self.current_time + (now.saturating_sub(self.last_sync_at)) as f64 / 1000.0
        } else {
            self.current_time
        }
    }
}

/// Partial playback update; unset fields are left alone.
#[derive(Debug, Default, Clone, Copy)]
pub struct PlaybackPatch {
    pub is_playing: Option<bool>,
    pub current_time: Option<f64>,
}

/// The track binding persisted per session.
///
/// The wire/persisted shape is fixed (`{url, title, duration, files}`);
/// the track id is recoverable from the artifact paths.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioSource {
    pub url: String,
    pub title: String,
    pub duration: f64,
    pub files: TrackFiles,
}

impl AudioSource {
    /// Binding form of an ingested track.
    #[must_use]
    pub fn from_track(track: &Track) -> Self {
        Self {
            url: track.original_url.clone(),
            title: track.title.clone(),
            duration: track.duration,
            files: track.files.clone(),
        }
    }

    /// Recovers the track id from the left artifact path
    /// (`/audio/<id>/left.mp3`).
    #[must_use]
    pub fn track_id(&self) -> Option<&str> {
        let mut parts = self.files.left.split('/');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(""), Some("audio"), Some(id)) if !id.is_empty() => Some(id),
            _ => None,
        }
    }
}

struct ClientRecord {
    id: String,
    channel: Channel,
    sender: ClientSender,
    /// Half-RTT estimate in milliseconds, updated from sync pings.
    latency_ms: f64,
    is_ready: bool,
}

struct SessionInner {
    audio_source: Option<AudioSource>,
    playback: PlaybackState,
    clients: HashMap<String, ClientRecord>,
    ingest_running: bool,
}

/// One named room multiplexing a single audio stream across clients.
pub struct Session {
    pub id: String,
    pub created_at: u64,
    inner: Mutex<SessionInner>,
}

/// Result of attaching a connection to a session.
pub struct Attached {
    pub session_id: String,
    pub client_id: String,
    pub channel: Channel,
    /// Current binding, so new joiners get `audio_ready` immediately.
    pub audio_source: Option<AudioSource>,
}

/// HTTP status view of one session.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatus {
    pub id: String,
    pub has_audio: bool,
    pub client_count: usize,
    pub playback_state: PlaybackState,
}

/// RAII guard marking an ingestion in flight for one session.
///
/// Dropping the guard (on success, error, or panic) re-opens the
/// session for the next submission.
pub struct IngestGuard {
    session: Arc<Session>,
}

impl std::fmt::Debug for IngestGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IngestGuard")
            .field("session_id", &self.session.id)
            .finish()
    }
}

impl Drop for IngestGuard {
    fn drop(&mut self) {
        self.session.inner.lock().ingest_running = false;
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Store
// ─────────────────────────────────────────────────────────────────────────────

/// Owner of all session and client state.
pub struct SessionStore {
    sessions: DashMap<String, Arc<Session>>,
    /// client_id -> session_id
    client_index: DashMap<String, String>,
    persistence: SessionPersistence,
    play_lead_ms: u64,
    gc_grace: Duration,
}

impl SessionStore {
    /// Creates a store and rehydrates persisted session↔track bindings.
    #[must_use]
    pub fn new(config: &Config) -> Self {
        let persistence = SessionPersistence::new(config.data_dir.clone());
        let store = Self {
            sessions: DashMap::new(),
            client_index: DashMap::new(),
            persistence,
            play_lead_ms: config.play_lead_ms,
            gc_grace: Duration::from_secs(config.session_gc_grace_secs),
        };
        store.rehydrate();
        store
    }

    fn rehydrate(&self) {
        let document = self.persistence.load();
        let now = now_millis();
        for (id, record) in document.sessions {
            let session = Arc::new(Session {
                id: id.clone(),
                created_at: record.created_at,
                inner: Mutex::new(SessionInner {
                    audio_source: Some(record.audio_source),
                    playback: PlaybackState::reset(now),
                    clients: HashMap::new(),
                    ingest_running: false,
                }),
            });
            self.sessions.insert(id, session);
        }
        if !self.sessions.is_empty() {
            log::info!(
                "[Session] Rehydrated {} session(s) from disk",
                self.sessions.len()
            );
        }
    }

    fn get(&self, session_id: &str) -> Option<Arc<Session>> {
        self.sessions.get(session_id).map(|r| Arc::clone(r.value()))
    }

    fn get_or_create(&self, session_id: &str) -> Arc<Session> {
        if let Some(session) = self.get(session_id) {
            return session;
        }
        let session = Arc::new(Session {
            id: session_id.to_string(),
            created_at: now_millis(),
            inner: Mutex::new(SessionInner {
                audio_source: None,
                playback: PlaybackState::reset(now_millis()),
                clients: HashMap::new(),
                ingest_running: false,
            }),
        });
        self.sessions
            .entry(session_id.to_string())
            .or_insert_with(|| {
                log::info!("[Session] Created session {session_id}");
                session
            })
            .value()
            .clone()
    }

    // ─────────────────────────────────────────────────────────────────────
    // Roster
    // ─────────────────────────────────────────────────────────────────────

    /// Attaches a connection to a session, creating the session if
    /// absent (preserving the supplied id) and assigning a channel.
    pub fn attach(&self, session_id: &str, sender: ClientSender) -> Attached {
        let session = self.get_or_create(session_id);
        let client_id = new_client_id();

        let mut inner = session.inner.lock();
        let channel = assign_channel(&inner.clients);
        inner.clients.insert(
            client_id.clone(),
            ClientRecord {
                id: client_id.clone(),
                channel,
                sender,
                latency_ms: 0.0,
                is_ready: false,
            },
        );
        let audio_source = inner.audio_source.clone();
        drop(inner);

        self.client_index
            .insert(client_id.clone(), session_id.to_string());
        log::info!("[Session] Client {client_id} joined {session_id} as {channel}");

        Attached {
            session_id: session_id.to_string(),
            client_id,
            channel,
            audio_source,
        }
    }

    /// Removes a client. Returns its session id so the caller can fan
    /// out the new roster and schedule a GC sweep.
    pub fn detach(&self, client_id: &str) -> Option<String> {
        let (_, session_id) = self.client_index.remove(client_id)?;
        let session = self.get(&session_id)?;
        session.inner.lock().clients.remove(client_id);
        log::info!("[Session] Client {client_id} left {session_id}");
        Some(session_id)
    }

    /// Drops the session after the grace period iff it is still empty
    /// and still trackless. Sessions bound to a track live indefinitely.
    pub async fn sweep_after(&self, session_id: String) {
        tokio::time::sleep(self.gc_grace).await;
        let Some(session) = self.get(&session_id) else {
            return;
        };
        let droppable = {
            let inner = session.inner.lock();
            inner.clients.is_empty() && inner.audio_source.is_none()
        };
        if droppable {
            self.sessions.remove(&session_id);
            log::info!("[Session] Dropped idle session {session_id}");
        }
    }

    /// Current roster in `client_list` form.
    #[must_use]
    pub fn roster(&self, session_id: &str) -> Vec<ClientSummary> {
        let Some(session) = self.get(session_id) else {
            return Vec::new();
        };
        let inner = session.inner.lock();
        let mut clients: Vec<ClientSummary> = inner
            .clients
            .values()
            .map(|c| ClientSummary {
                id: c.id.clone(),
                channel: c.channel,
                ready: c.is_ready,
            })
            .collect();
        clients.sort_by(|a, b| a.id.cmp(&b.id));
        clients
    }

    // ─────────────────────────────────────────────────────────────────────
    // Client state
    // ─────────────────────────────────────────────────────────────────────

    /// Marks a client ready. Returns its session id.
    pub fn set_ready(&self, client_id: &str, ready: bool) -> Option<String> {
        self.with_client(client_id, |client| client.is_ready = ready)
    }

    /// Updates a client's half-RTT latency estimate (milliseconds).
    pub fn set_latency(&self, client_id: &str, latency_ms: f64) -> Option<String> {
        self.with_client(client_id, |client| client.latency_ms = latency_ms)
    }

    /// Whether every current client has reported ready (false for an
    /// empty roster).
    #[must_use]
    pub fn all_ready(&self, session_id: &str) -> bool {
        let Some(session) = self.get(session_id) else {
            return false;
        };
        let inner = session.inner.lock();
        !inner.clients.is_empty() && inner.clients.values().all(|c| c.is_ready)
    }

    fn with_client(
        &self,
        client_id: &str,
        mutate: impl FnOnce(&mut ClientRecord),
    ) -> Option<String> {
        let session_id = self.client_index.get(client_id)?.value().clone();
        let session = self.get(&session_id)?;
        let mut inner = session.inner.lock();
        let client = inner.clients.get_mut(client_id)?;
        mutate(client);
        Some(session_id)
    }

    // ─────────────────────────────────────────────────────────────────────
    // Track binding and playback
    // ─────────────────────────────────────────────────────────────────────

    /// Binds a track: resets playback to `{false, 0, now}`, clears
    /// every client's readiness, and persists the binding.
    pub fn set_track(&self, session_id: &str, track: &Track) -> DuocastResult<()> {
        let session = self
            .get(session_id)
            .ok_or_else(|| DuocastError::SessionNotFound(session_id.to_string()))?;

        let record = {
            let mut inner = session.inner.lock();
            inner.audio_source = Some(AudioSource::from_track(track));
            inner.playback = PlaybackState::reset(now_millis());
            for client in inner.clients.values_mut() {
                client.is_ready = false;
            }
            PersistedSession {
                id: session.id.clone(),
                created_at: session.created_at,
                audio_source: inner.audio_source.clone().expect("just bound"),
            }
        };

        // Write errors are logged; memory stays authoritative.
        if let Err(e) = self.persistence.record(record) {
            log::warn!("[Session] Persistence write failed for {session_id}: {e}");
        }
        Ok(())
    }

    /// Partial playback update; always bumps `last_sync_at`. Ephemeral.
    pub fn update_playback(&self, session_id: &str, patch: PlaybackPatch) -> DuocastResult<()> {
        let session = self
            .get(session_id)
            .ok_or_else(|| DuocastError::SessionNotFound(session_id.to_string()))?;
        let mut inner = session.inner.lock();
        if let Some(is_playing) = patch.is_playing {
            inner.playback.is_playing = is_playing;
        }
        if let Some(current_time) = patch.current_time {
            inner.playback.current_time = current_time;
        }
        inner.playback.last_sync_at = now_millis();
        Ok(())
    }

    /// Marks an ingestion in flight, refusing if one already is.
    pub fn begin_ingest(&self, session_id: &str) -> DuocastResult<IngestGuard> {
        let session = self
            .get(session_id)
            .ok_or_else(|| DuocastError::SessionNotFound(session_id.to_string()))?;
        {
            let mut inner = session.inner.lock();
            if inner.ingest_running {
                return Err(DuocastError::Busy(session_id.to_string()));
            }
            inner.ingest_running = true;
        }
        Ok(IngestGuard { session })
    }

    /// Scheduled play broadcast: a single shared target instant
    /// `now + lead`, shifted per peer by half its latency so everyone
    /// starts at the same wall-clock moment.
    pub fn scheduled_play(&self, session_id: &str) -> DuocastResult<()> {
        let session = self
            .get(session_id)
            .ok_or_else(|| DuocastError::SessionNotFound(session_id.to_string()))?;
        let now = now_millis();
        let scheduled_at = (now + self.play_lead_ms) as f64;

        let mut inner = session.inner.lock();
        let start_time = inner.playback.current_time;
        for client in inner.clients.values() {
            send_best_effort(
                client,
                ServerMessage::Play {
                    start_time,
                    server_timestamp: scheduled_at - client.latency_ms / 2.0,
                },
            );
        }
        inner.playback.is_playing = true;
        inner.playback.last_sync_at = now;
        Ok(())
    }

    /// Pause broadcast, applied by peers at receipt (no lead time).
    pub fn pause_all(&self, session_id: &str) -> DuocastResult<()> {
        let session = self
            .get(session_id)
            .ok_or_else(|| DuocastError::SessionNotFound(session_id.to_string()))?;
        let now = now_millis();

        let mut inner = session.inner.lock();
        let position = inner.playback.estimated_position(now);
        inner.playback.is_playing = false;
        inner.playback.current_time = position;
        inner.playback.last_sync_at = now;
        let msg = ServerMessage::Pause {
            current_time: position,
            server_timestamp: now as f64,
        };
        for client in inner.clients.values() {
            send_best_effort(client, msg.clone());
        }
        Ok(())
    }

    /// Seek broadcast, applied by peers at receipt (no lead time).
    /// Returns the clamped target.
    pub fn seek_all(&self, session_id: &str, target_time: f64) -> DuocastResult<f64> {
        let session = self
            .get(session_id)
            .ok_or_else(|| DuocastError::SessionNotFound(session_id.to_string()))?;
        let now = now_millis();

        let mut inner = session.inner.lock();
        let duration = inner
            .audio_source
            .as_ref()
            .map(|source| source.duration)
            .unwrap_or(f64::MAX);
        let clamped = target_time.clamp(0.0, duration);
        inner.playback.current_time = clamped;
        inner.playback.last_sync_at = now;
        let msg = ServerMessage::Seek {
            target_time: clamped,
            server_timestamp: now as f64,
        };
        for client in inner.clients.values() {
            send_best_effort(client, msg.clone());
        }
        Ok(clamped)
    }

    // ─────────────────────────────────────────────────────────────────────
    // Fan-out
    // ─────────────────────────────────────────────────────────────────────

    /// Best-effort broadcast to every client except `exclude`.
    pub fn broadcast(&self, session_id: &str, msg: &ServerMessage, exclude: Option<&str>) {
        let Some(session) = self.get(session_id) else {
            return;
        };
        let inner = session.inner.lock();
        for client in inner.clients.values() {
            if Some(client.id.as_str()) == exclude {
                continue;
            }
            send_best_effort(client, msg.clone());
        }
    }

    /// Broadcast where each client's message is built from its roster
    /// entry (used for per-channel `audio_ready` URLs).
    pub fn broadcast_with(
        &self,
        session_id: &str,
        build: impl Fn(&ClientSummary) -> ServerMessage,
    ) {
        let Some(session) = self.get(session_id) else {
            return;
        };
        let inner = session.inner.lock();
        for client in inner.clients.values() {
            let summary = ClientSummary {
                id: client.id.clone(),
                channel: client.channel,
                ready: client.is_ready,
            };
            send_best_effort(client, build(&summary));
        }
    }

    /// Targeted send to one client. Returns false if it is gone.
    pub fn send_to(&self, client_id: &str, msg: ServerMessage) -> bool {
        let Some(session_id) = self.client_index.get(client_id).map(|r| r.value().clone()) else {
            return false;
        };
        let Some(session) = self.get(&session_id) else {
            return false;
        };
        let inner = session.inner.lock();
        match inner.clients.get(client_id) {
            Some(client) => {
                send_best_effort(client, msg);
                true
            }
            None => false,
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Views
    // ─────────────────────────────────────────────────────────────────────

    /// Status view for the HTTP session endpoint.
    #[must_use]
    pub fn session_status(&self, session_id: &str) -> Option<SessionStatus> {
        let session = self.get(session_id)?;
        let inner = session.inner.lock();
        Some(SessionStatus {
            id: session.id.clone(),
            has_audio: inner.audio_source.is_some(),
            client_count: inner.clients.len(),
            playback_state: inner.playback.clone(),
        })
    }

    /// Current binding of a session, if any.
    #[must_use]
    pub fn audio_source(&self, session_id: &str) -> Option<AudioSource> {
        let session = self.get(session_id)?;
        let source = session.inner.lock().audio_source.clone();
        source
    }
}

/// Channel assignment policy: first client left, second right, then
/// the less populated of the two; ties go left. `Stereo` is never
/// assigned here (manual placement only) and does not affect counts.
fn assign_channel(clients: &HashMap<String, ClientRecord>) -> Channel {
    let left = clients
        .values()
        .filter(|c| c.channel == Channel::Left)
        .count();
    let right = clients
        .values()
        .filter(|c| c.channel == Channel::Right)
        .count();
    if right < left {
        Channel::Right
    } else {
        Channel::Left
    }
}

/// Queue a message, skipping closed connections. A send error only
/// means the peer is on its way out; the roster update follows from
/// its connection handler.
fn send_best_effort(client: &ClientRecord, msg: ServerMessage) {
    if client.sender.is_closed() {
        return;
    }
    if client.sender.send(msg).is_err() {
        log::debug!("[Session] Dropped message to departing client {}", client.id);
    }
}
