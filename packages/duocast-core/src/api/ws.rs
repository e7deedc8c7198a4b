//! WebSocket transport and command dispatcher.
//!
//! Each client owns one connection carrying one JSON envelope per text
//! frame. The dispatcher reads messages serially per connection, so
//! ordering within a client is preserved. Outbound traffic goes through
//! an unbounded per-client queue drained by a writer task that owns the
//! socket sink; fan-out therefore never blocks on a slow peer, and a
//! failed write is treated as a disconnect for that peer alone.

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use futures::sink::SinkExt;
use futures::stream::StreamExt;
use tokio::sync::mpsc;

use duocast_proto::{ClientMessage, ServerMessage};

use crate::api::AppState;
use crate::error::DuocastError;
use crate::services::library::Track;
use crate::services::session_store::ClientSender;
use crate::utils::{new_session_id, now_millis, validate_source_url};

/// Per-connection dispatcher state.
///
/// `client_id`/`session_id` stay unset until a successful join; every
/// session-scoped command checks them first.
struct ConnState {
    conn_id: String,
    outbound: ClientSender,
    client_id: Option<String>,
    session_id: Option<String>,
}

impl ConnState {
    fn new(conn_id: String, outbound: ClientSender) -> Self {
        Self {
            conn_id,
            outbound,
            client_id: None,
            session_id: None,
        }
    }

    fn send(&self, msg: ServerMessage) {
        let _ = self.outbound.send(msg);
    }

    /// Targeted error envelope; never broadcast.
    fn send_error(&self, err: &DuocastError) {
        self.send(ServerMessage::Error {
            message: err.to_string(),
        });
    }
}

/// WebSocket upgrade handler.
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_ws(socket, state))
}

/// Main WebSocket connection handler.
async fn handle_ws(socket: WebSocket, state: AppState) {
    let (sink, mut stream) = socket.split();
    let conn_guard = state.registry.register();
    let cancel_token = conn_guard.cancel_token().clone();

    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
    let writer = tokio::spawn(write_loop(
        sink,
        outbound_rx,
        state.clone(),
        conn_guard.id().to_string(),
    ));

    let mut conn = ConnState::new(conn_guard.id().to_string(), outbound_tx);

    loop {
        tokio::select! {
            _ = cancel_token.cancelled() => {
                log::info!("[WS] Connection force-closed: {}", conn.conn_id);
                break;
            }
            msg = stream.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => dispatch(&state, &mut conn, &text).await,
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    _ => {}
                }
            }
        }
    }

    // Roster cleanup; the session itself survives its GC grace period.
    if let Some(client_id) = conn.client_id.take() {
        if let Some(session_id) = state.store.detach(&client_id) {
            broadcast_roster(&state, &session_id);
            let store = state.store.clone();
            tokio::spawn(async move { store.sweep_after(session_id).await });
        }
    }
    drop(conn);
    let _ = writer.await;
}

/// Drains the outbound queue into the socket, applying taps in order.
async fn write_loop(
    mut sink: futures::stream::SplitSink<WebSocket, Message>,
    mut rx: mpsc::UnboundedReceiver<ServerMessage>,
    state: AppState,
    conn_id: String,
) {
    while let Some(msg) = rx.recv().await {
        for tap in state.taps.iter() {
            tap.outbound(&conn_id, &msg);
        }
        let Some(frame) = msg.to_frame() else { continue };
        if sink.send(Message::Text(frame.into())).await.is_err() {
            break;
        }
    }
}

/// Routes one inbound frame.
///
/// Unknown `type` tags are ignored; known tags that fail to deserialize
/// get a targeted `error` envelope and are otherwise dropped.
async fn dispatch(state: &AppState, conn: &mut ConnState, text: &str) {
    for tap in state.taps.iter() {
        tap.inbound(&conn.conn_id, text);
    }

    let value: serde_json::Value = match serde_json::from_str(text) {
        Ok(value) => value,
        Err(e) => {
            conn.send_error(&DuocastError::InvalidMessage(e.to_string()));
            return;
        }
    };
    let tag = value
        .get("type")
        .and_then(|t| t.as_str())
        .unwrap_or_default()
        .to_string();
    if !ClientMessage::is_known_type(&tag) {
        log::debug!("[WS] {} sent unknown type {tag:?}, ignoring", conn.conn_id);
        return;
    }
    let msg: ClientMessage = match serde_json::from_value(value) {
        Ok(msg) => msg,
        Err(e) => {
            conn.send_error(&DuocastError::InvalidMessage(format!("{tag}: {e}")));
            return;
        }
    };

    match msg {
        ClientMessage::JoinSession { session_id } => handle_join(state, conn, session_id),
        ClientMessage::SubmitLink { url } => handle_submit(state, conn, url).await,
        ClientMessage::LoadTrack { track_id } => handle_load_track(state, conn, &track_id),
        ClientMessage::Ready => handle_ready(state, conn),
        ClientMessage::PlayRequest => {
            with_session(state, conn, |sid| state.store.scheduled_play(sid));
        }
        ClientMessage::PauseRequest => {
            with_session(state, conn, |sid| state.store.pause_all(sid));
        }
        ClientMessage::SeekRequest { target_time } => {
            with_session(state, conn, |sid| {
                state.store.seek_all(sid, target_time).map(|_| ())
            });
        }
        ClientMessage::VolumeRequest { channel, volume } => {
            // Verbatim fan-out to every peer including the requester:
            // volume is a shared session-level setting per channel.
            with_session(state, conn, |sid| {
                state
                    .store
                    .broadcast(sid, &ServerMessage::VolumeChange { channel, volume }, None);
                Ok(())
            });
        }
        ClientMessage::Ping { client_timestamp } => handle_ping(state, conn, client_timestamp),
    }
}

fn handle_join(state: &AppState, conn: &mut ConnState, session_id: String) {
    if conn.client_id.is_some() {
        log::warn!("[WS] {} tried to join twice, ignoring", conn.conn_id);
        return;
    }
    let session_id = if session_id.is_empty() {
        new_session_id()
    } else {
        session_id
    };

    let attached = state.store.attach(&session_id, conn.outbound.clone());
    conn.client_id = Some(attached.client_id.clone());
    conn.session_id = Some(session_id.clone());

    conn.send(ServerMessage::SessionJoined {
        session_id: session_id.clone(),
        client_id: attached.client_id,
        channel: attached.channel,
    });

    // A session with a bound track greets new joiners with audio_ready
    // immediately; they sync on the next play/seek broadcast.
    if let Some(source) = attached.audio_source {
        match source.track_id() {
            Some(track_id) => conn.send(ServerMessage::AudioReady {
                audio_url: state.network.artifact_url(track_id, attached.channel),
                duration: source.duration,
                title: source.title.clone(),
                track_id: track_id.to_string(),
            }),
            None => log::warn!(
                "[WS] Session {session_id} has a binding with unparsable artifact paths"
            ),
        }
    }

    conn.send(ServerMessage::TrackList {
        tracks: state.library.list().iter().map(Track::summary).collect(),
    });
    broadcast_roster(state, &session_id);
}

async fn handle_submit(state: &AppState, conn: &mut ConnState, url: String) {
    let Some(session_id) = conn.session_id.clone() else {
        conn.send_error(&DuocastError::InvalidMessage("join a session first".into()));
        return;
    };

    // Host check happens before anything is announced: a rejected URL
    // produces only a targeted error, never an audio_loading broadcast.
    if let Err(err) = validate_source_url(&url) {
        conn.send_error(&err);
        return;
    }

    let guard = match state.store.begin_ingest(&session_id) {
        Ok(guard) => guard,
        Err(err) => {
            conn.send_error(&err);
            return;
        }
    };

    state
        .store
        .broadcast(&session_id, &ServerMessage::AudioLoading { url: url.clone() }, None);

    match state.ingest.ingest(&url).await {
        Ok(track) => {
            if let Err(err) = state.store.set_track(&session_id, &track) {
                conn.send_error(&err);
            } else {
                announce_track(state, &session_id, &track);
            }
        }
        Err(err) => {
            log::warn!("[WS] Ingestion failed for {session_id}: {err}");
            conn.send_error(&err);
        }
    }
    drop(guard);
}

fn handle_load_track(state: &AppState, conn: &mut ConnState, track_id: &str) {
    let Some(session_id) = conn.session_id.clone() else {
        conn.send_error(&DuocastError::InvalidMessage("join a session first".into()));
        return;
    };
    match state.library.get(track_id) {
        Ok(track) => match state.store.set_track(&session_id, &track) {
            Ok(()) => announce_track(state, &session_id, &track),
            Err(err) => conn.send_error(&err),
        },
        Err(err) => conn.send_error(&err),
    }
}

fn handle_ready(state: &AppState, conn: &ConnState) {
    let Some(client_id) = &conn.client_id else {
        return;
    };
    if let Some(session_id) = state.store.set_ready(client_id, true) {
        broadcast_roster(state, &session_id);
    }
}

fn handle_ping(state: &AppState, conn: &ConnState, client_timestamp: u64) {
    let now = now_millis();
    if let Some(client_id) = &conn.client_id {
        // One-way arrival delta; feeds latency-compensated scheduling.
        let latency_ms = now.saturating_sub(client_timestamp) as f64;
        state.store.set_latency(client_id, latency_ms);
    }
    conn.send(ServerMessage::Pong {
        server_timestamp: now_millis(),
        client_timestamp,
    });
}

/// Runs a session-scoped store operation, reporting failures back to
/// the requester only.
fn with_session(
    state: &AppState,
    conn: &ConnState,
    op: impl FnOnce(&str) -> Result<(), DuocastError>,
) {
    let Some(session_id) = &conn.session_id else {
        conn.send_error(&DuocastError::InvalidMessage("join a session first".into()));
        return;
    };
    if let Err(err) = op(session_id) {
        conn.send_error(&err);
    }
}

/// Post-binding fan-out: per-channel `audio_ready`, refreshed library,
/// and the roster with its reset ready flags. Emitted under the
/// session's lock sequence, so every client sees the same order.
fn announce_track(state: &AppState, session_id: &str, track: &Track) {
    state.store.broadcast_with(session_id, |client| ServerMessage::AudioReady {
        audio_url: state.network.artifact_url(&track.id, client.channel),
        duration: track.duration,
        title: track.title.clone(),
        track_id: track.id.clone(),
    });
    let tracks = state.library.list().iter().map(Track::summary).collect();
    state
        .store
        .broadcast(session_id, &ServerMessage::TrackList { tracks }, None);
    broadcast_roster(state, session_id);
}

fn broadcast_roster(state: &AppState, session_id: &str) {
    let clients = state.store.roster(session_id);
    state
        .store
        .broadcast(session_id, &ServerMessage::ClientList { clients }, None);
}
