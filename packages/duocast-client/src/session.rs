//! WebSocket session client.
//!
//! Dials the coordinator, keeps the clock-offset estimator warm, and
//! routes broadcast envelopes into the audio engine and status machine.
//! Unknown message types are ignored, matching the server side.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::sync::mpsc::{unbounded_channel, UnboundedSender};
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};

use duocast_proto::{Channel, ClientMessage, ClientSummary, ServerMessage, TrackSummary};

use crate::clock::{ClockSync, PING_INTERVAL, WARMUP_PINGS, WARMUP_SPACING};
use crate::engine::AudioEngine;
use crate::error::ClientError;
use crate::status::{StatusEvent, StatusMachine};

/// Observer for session-level notifications.
///
/// All methods default to no-ops so embedders implement only what
/// their surface shows.
pub trait SessionObserver: Send + Sync {
    fn on_joined(&self, _session_id: &str, _client_id: &str, _channel: Channel) {}
    fn on_roster(&self, _clients: &[ClientSummary]) {}
    fn on_tracks(&self, _tracks: &[TrackSummary]) {}
    fn on_error(&self, _message: &str) {}
}

struct SessionShared {
    engine: Arc<AudioEngine>,
    clock: Mutex<ClockSync>,
    status: Mutex<StatusMachine>,
    channel: Mutex<Option<Channel>>,
    observer: Option<Arc<dyn SessionObserver>>,
    out_tx: UnboundedSender<ClientMessage>,
    closed: AtomicBool,
}

/// A connected session participant.
pub struct SessionClient {
    shared: Arc<SessionShared>,
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

impl SessionClient {
    /// Connects to the coordinator's `/ws` endpoint and joins a
    /// session. Spawns the writer, reader, ping, and resume-watchdog
    /// tasks.
    pub async fn connect(
        ws_url: &str,
        session_id: &str,
        engine: Arc<AudioEngine>,
        observer: Option<Arc<dyn SessionObserver>>,
    ) -> Result<Self, ClientError> {
        let (socket, _response) = connect_async(ws_url)
            .await
            .map_err(|e| ClientError::WebSocket(e.to_string()))?;
        let (mut sink, mut stream) = socket.split();

        let (out_tx, mut out_rx) = unbounded_channel::<ClientMessage>();
        let shared = Arc::new(SessionShared {
            engine,
            clock: Mutex::new(ClockSync::new()),
            status: Mutex::new(StatusMachine::new()),
            channel: Mutex::new(None),
            observer,
            out_tx,
            closed: AtomicBool::new(false),
        });

        // Writer: serializes one envelope per text frame.
        tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                let Ok(json) = serde_json::to_string(&msg) else {
                    continue;
                };
                if sink.send(WsMessage::Text(json)).await.is_err() {
                    break;
                }
            }
        });

        // Reader: dispatches server envelopes until the socket closes.
        let reader_shared = Arc::clone(&shared);
        tokio::spawn(async move {
            while let Some(frame) = stream.next().await {
                match frame {
                    Ok(WsMessage::Text(text)) => {
                        match serde_json::from_str::<ServerMessage>(&text) {
                            Ok(msg) => handle_message(&reader_shared, msg).await,
                            // Unknown or malformed types are ignored
                            Err(e) => log::debug!("Ignoring frame: {e}"),
                        }
                    }
                    Ok(WsMessage::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }
            reader_shared.closed.store(true, Ordering::Relaxed);
            log::info!("Session connection closed");
        });

        // Clock warm-up then steady pings; fire-and-forget, a missed
        // pong never stops the loop.
        let ping_shared = Arc::clone(&shared);
        tokio::spawn(async move {
            for _ in 0..WARMUP_PINGS {
                if !send_ping(&ping_shared) {
                    return;
                }
                tokio::time::sleep(WARMUP_SPACING).await;
            }
            let mut interval = tokio::time::interval(PING_INTERVAL);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                if !send_ping(&ping_shared) {
                    return;
                }
            }
        });

        // Background-tab defence: resume a suspended backend every
        // second while playing.
        let watchdog_shared = Arc::clone(&shared);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(std::time::Duration::from_secs(1));
            loop {
                interval.tick().await;
                if watchdog_shared.closed.load(Ordering::Relaxed) {
                    return;
                }
                watchdog_shared.engine.tick_resume_if_suspended();
            }
        });

        let client = Self { shared };
        client.send(ClientMessage::JoinSession {
            session_id: session_id.to_string(),
        })?;
        Ok(client)
    }

    fn send(&self, msg: ClientMessage) -> Result<(), ClientError> {
        self.shared
            .out_tx
            .send(msg)
            .map_err(|_| ClientError::WebSocket("connection closed".to_string()))
    }

    /// Submits a remote source URL for ingestion.
    pub fn submit_link(&self, url: &str) -> Result<(), ClientError> {
        self.send(ClientMessage::SubmitLink {
            url: url.to_string(),
        })
    }

    /// Binds an already-ingested track to the session.
    pub fn load_track(&self, track_id: &str) -> Result<(), ClientError> {
        self.send(ClientMessage::LoadTrack {
            track_id: track_id.to_string(),
        })
    }

    /// Requests a scheduled play broadcast.
    pub fn request_play(&self) -> Result<(), ClientError> {
        self.send(ClientMessage::PlayRequest)
    }

    /// Requests a pause broadcast.
    pub fn request_pause(&self) -> Result<(), ClientError> {
        self.send(ClientMessage::PauseRequest)
    }

    /// Requests a seek broadcast.
    pub fn request_seek(&self, target_time: f64) -> Result<(), ClientError> {
        self.send(ClientMessage::SeekRequest { target_time })
    }

    /// Requests a volume change for one channel (0-100), fanned out to
    /// every peer including this one.
    pub fn request_volume(&self, channel: Channel, volume: u8) -> Result<(), ClientError> {
        self.send(ClientMessage::VolumeRequest { channel, volume })
    }

    /// Channel role assigned at join, if joined yet.
    #[must_use]
    pub fn channel(&self) -> Option<Channel> {
        *self.shared.channel.lock()
    }

    /// Current display status.
    #[must_use]
    pub fn status(&self) -> crate::status::Status {
        self.shared.status.lock().state()
    }

    /// Current authoritative clock offset estimate (ms).
    #[must_use]
    pub fn clock_offset_ms(&self) -> f64 {
        self.shared.clock.lock().offset_ms()
    }

    /// Whether the connection has closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Relaxed)
    }
}

fn send_ping(shared: &SessionShared) -> bool {
    if shared.closed.load(Ordering::Relaxed) {
        return false;
    }
    shared
        .out_tx
        .send(ClientMessage::Ping {
            client_timestamp: now_millis(),
        })
        .is_ok()
}

fn apply_status(shared: &SessionShared, event: StatusEvent) {
    // Refused transitions are logged by the machine and dropped here.
    let _ = shared.status.lock().apply(event);
}

async fn handle_message(shared: &SessionShared, msg: ServerMessage) {
    match msg {
        ServerMessage::SessionJoined {
            session_id,
            client_id,
            channel,
        } => {
            *shared.channel.lock() = Some(channel);
            log::info!("Joined session {session_id} as {client_id} ({channel})");
            if let Some(observer) = &shared.observer {
                observer.on_joined(&session_id, &client_id, channel);
            }
        }
        ServerMessage::AudioLoading { url } => {
            log::info!("Ingestion started for {url}");
            apply_status(shared, StatusEvent::Load);
        }
        ServerMessage::AudioReady {
            audio_url,
            duration,
            title,
            ..
        } => {
            log::info!("Track ready: {title} ({duration:.0}s), fetching {audio_url}");
            // New joiners get audio_ready without a preceding
            // audio_loading; enter loading first either way.
            apply_status(shared, StatusEvent::Load);
            match fetch_and_load(shared, &audio_url).await {
                Ok(()) => {
                    apply_status(shared, StatusEvent::AutoReady);
                    let _ = shared.out_tx.send(ClientMessage::Ready);
                }
                Err(e) => {
                    log::warn!("Artifact load failed: {e}");
                    apply_status(shared, StatusEvent::Error);
                    if let Some(observer) = &shared.observer {
                        observer.on_error(&e.to_string());
                    }
                }
            }
        }
        ServerMessage::Play {
            start_time,
            server_timestamp,
        } => {
            let local_ms = shared.clock.lock().server_time_to_local(server_timestamp);
            match shared.engine.play_at(start_time, local_ms) {
                Ok(()) => apply_status(shared, StatusEvent::Play),
                Err(e) => {
                    log::warn!("Scheduled play failed: {e}");
                    if let Some(observer) = &shared.observer {
                        observer.on_error(&e.to_string());
                    }
                }
            }
        }
        ServerMessage::Pause { current_time, .. } => {
            shared.engine.pause();
            // Align the resume offset with the coordinator's position
            let _ = shared.engine.seek_to(current_time);
            apply_status(shared, StatusEvent::Pause);
        }
        ServerMessage::Seek { target_time, .. } => {
            if let Err(e) = shared.engine.seek_to(target_time) {
                log::warn!("Seek failed: {e}");
            }
        }
        ServerMessage::Pong {
            server_timestamp,
            client_timestamp,
        } => {
            let sample =
                shared
                    .clock
                    .lock()
                    .record(client_timestamp, server_timestamp, now_millis());
            log::debug!(
                "Clock sample: latency={:.1}ms offset={:.1}ms",
                sample.latency_ms,
                sample.offset_ms
            );
        }
        ServerMessage::VolumeChange { channel, volume } => {
            // Volume is a per-channel session setting; apply only when
            // it names our slice of the stereo field.
            if *shared.channel.lock() == Some(channel) {
                shared.engine.set_volume(f32::from(volume) / 100.0);
            }
        }
        ServerMessage::ClientList { clients } => {
            if let Some(observer) = &shared.observer {
                observer.on_roster(&clients);
            }
        }
        ServerMessage::TrackList { tracks } => {
            if let Some(observer) = &shared.observer {
                observer.on_tracks(&tracks);
            }
        }
        ServerMessage::Error { message } => {
            log::warn!("Server error: {message}");
            apply_status(shared, StatusEvent::Error);
            if let Some(observer) = &shared.observer {
                observer.on_error(&message);
            }
        }
    }
}

async fn fetch_and_load(shared: &SessionShared, url: &str) -> Result<(), ClientError> {
    let response = reqwest::get(url)
        .await
        .and_then(reqwest::Response::error_for_status)
        .map_err(|e| ClientError::Fetch(e.to_string()))?;
    let bytes = response
        .bytes()
        .await
        .map_err(|e| ClientError::Fetch(e.to_string()))?;
    shared.engine.load(bytes.to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{AudioBackend, BackendState, SourceId};
    use crate::decode::DecodedBuffer;

    /// Silent backend with a frozen clock, enough to drive the engine.
    struct NullBackend;

    impl AudioBackend for NullBackend {
        fn state(&self) -> BackendState {
            BackendState::Running
        }
        fn resume(&self) -> Result<(), ClientError> {
            Ok(())
        }
        fn now(&self) -> f64 {
            0.0
        }
        fn set_gain(&self, _gain: f32) {}
        fn start_source(
            &self,
            _buffer: Arc<DecodedBuffer>,
            _offset_sec: f64,
            _start_at: f64,
        ) -> Result<SourceId, ClientError> {
            Ok(1)
        }
        fn stop_source(&self, _id: SourceId) {}
    }

    fn test_shared() -> (Arc<SessionShared>, tokio::sync::mpsc::UnboundedReceiver<ClientMessage>) {
        let (out_tx, out_rx) = unbounded_channel();
        let shared = Arc::new(SessionShared {
            engine: Arc::new(AudioEngine::new(Arc::new(NullBackend))),
            clock: Mutex::new(ClockSync::new()),
            status: Mutex::new(StatusMachine::new()),
            channel: Mutex::new(None),
            observer: None,
            out_tx,
            closed: AtomicBool::new(false),
        });
        (shared, out_rx)
    }

    #[tokio::test]
    async fn pong_feeds_the_clock() {
        let (shared, _rx) = test_shared();
        let sent = now_millis().saturating_sub(40);
        handle_message(
            &shared,
            ServerMessage::Pong {
                server_timestamp: sent + 120,
                client_timestamp: sent,
            },
        )
        .await;

        let clock = shared.clock.lock();
        assert!(clock.is_synced());
        assert_eq!(clock.sample_count(), 1);
    }

    #[tokio::test]
    async fn session_joined_records_channel() {
        let (shared, _rx) = test_shared();
        handle_message(
            &shared,
            ServerMessage::SessionJoined {
                session_id: "abcd".to_string(),
                client_id: "c-1".to_string(),
                channel: Channel::Right,
            },
        )
        .await;
        assert_eq!(*shared.channel.lock(), Some(Channel::Right));
    }

    #[tokio::test]
    async fn volume_change_only_applies_to_own_channel() {
        let (shared, _rx) = test_shared();
        *shared.channel.lock() = Some(Channel::Left);
        shared.engine.set_volume(1.0);

        handle_message(
            &shared,
            ServerMessage::VolumeChange {
                channel: Channel::Right,
                volume: 10,
            },
        )
        .await;
        assert_eq!(shared.engine.volume(), 1.0);

        handle_message(
            &shared,
            ServerMessage::VolumeChange {
                channel: Channel::Left,
                volume: 40,
            },
        )
        .await;
        assert!((shared.engine.volume() - 0.4).abs() < 1e-6);
    }

    #[tokio::test]
    async fn audio_loading_enters_loading_state() {
        let (shared, _rx) = test_shared();
        handle_message(
            &shared,
            ServerMessage::AudioLoading {
                url: "https://youtu.be/abc".to_string(),
            },
        )
        .await;
        assert_eq!(shared.status.lock().state(), crate::status::Status::Loading);
    }

    #[tokio::test]
    async fn server_error_resets_loading_state() {
        let (shared, _rx) = test_shared();
        handle_message(
            &shared,
            ServerMessage::AudioLoading {
                url: "https://youtu.be/abc".to_string(),
            },
        )
        .await;
        handle_message(
            &shared,
            ServerMessage::Error {
                message: "Fetch failed: no formats".to_string(),
            },
        )
        .await;
        assert_eq!(shared.status.lock().state(), crate::status::Status::Idle);
    }
}
