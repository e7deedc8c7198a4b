//! Wire protocol for the Duocast session coordinator.
//!
//! Every message travels as one JSON document per WebSocket text frame,
//! tagged by a string `type` field. Both sides ignore unknown types; a
//! *known* type that fails to deserialize is a schema violation and is
//! reported back as an `error` envelope.
//!
//! The envelopes here are the single source of truth for the wire format.
//! Server and client crates both depend on this crate rather than keeping
//! parallel definitions.

use serde::{Deserialize, Serialize};

/// Channel role a client plays in the stereo field.
///
/// The default assignment policy only hands out `Left` and `Right`;
/// `Stereo` (the full mix) exists for manual placement and must be
/// handled everywhere a channel is consumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    Left,
    Right,
    Stereo,
}

impl Channel {
    /// Artifact file name for this channel under a track's directory.
    #[must_use]
    pub fn artifact_file(&self) -> &'static str {
        match self {
            Self::Left => "left.mp3",
            Self::Right => "right.mp3",
            Self::Stereo => "stereo.mp3",
        }
    }

    /// Wire name, identical to the serde representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Left => "left",
            Self::Right => "right",
            Self::Stereo => "stereo",
        }
    }
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Roster entry inside a `client_list` envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientSummary {
    pub id: String,
    pub channel: Channel,
    pub ready: bool,
}

/// Library entry inside a `track_list` envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackSummary {
    pub id: String,
    pub title: String,
    /// Seconds.
    pub duration: f64,
}

/// Messages sent from a client to the coordinator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ClientMessage {
    /// Join (or create) a session by id.
    JoinSession { session_id: String },
    /// Submit a remote source URL for ingestion.
    SubmitLink { url: String },
    /// Bind an already-ingested track to the session.
    LoadTrack { track_id: String },
    /// The client has loaded its channel artifact and can play.
    Ready,
    /// Ask for a scheduled play broadcast.
    PlayRequest,
    /// Ask for a pause broadcast.
    PauseRequest,
    /// Ask for a seek broadcast.
    SeekRequest {
        /// Seconds into the track.
        target_time: f64,
    },
    /// Ask for a volume change on one channel, fanned out to all peers.
    VolumeRequest { channel: Channel, volume: u8 },
    /// Clock sync probe.
    Ping {
        /// Client wall clock, milliseconds since the Unix epoch.
        client_timestamp: u64,
    },
}

impl ClientMessage {
    /// All wire `type` tags this enum understands.
    pub const KNOWN_TYPES: &'static [&'static str] = &[
        "join_session",
        "submit_link",
        "load_track",
        "ready",
        "play_request",
        "pause_request",
        "seek_request",
        "volume_request",
        "ping",
    ];

    /// Whether a raw `type` tag names a known client message.
    ///
    /// Unknown tags are ignored by the dispatcher; known tags that fail
    /// to deserialize are schema violations.
    #[must_use]
    pub fn is_known_type(tag: &str) -> bool {
        Self::KNOWN_TYPES.contains(&tag)
    }
}

/// Messages sent from the coordinator to clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    /// Join acknowledgement carrying the assigned channel role.
    SessionJoined {
        session_id: String,
        client_id: String,
        channel: Channel,
    },
    /// Ingestion has started for the given source URL.
    AudioLoading { url: String },
    /// A track is bound and this client's channel artifact is fetchable.
    AudioReady {
        audio_url: String,
        duration: f64,
        title: String,
        track_id: String,
    },
    /// Scheduled play: start `start_time` seconds into the track at the
    /// (latency-compensated) server instant `server_timestamp`.
    Play {
        start_time: f64,
        server_timestamp: f64,
    },
    /// Pause at the given position, applied on receipt.
    Pause {
        current_time: f64,
        server_timestamp: f64,
    },
    /// Seek to the given position, applied on receipt.
    Seek {
        target_time: f64,
        server_timestamp: f64,
    },
    /// Clock sync reply. `server_timestamp` is captured at write time.
    Pong {
        server_timestamp: u64,
        client_timestamp: u64,
    },
    /// Current roster, sent on every roster or readiness change.
    ClientList { clients: Vec<ClientSummary> },
    /// Library listing.
    TrackList { tracks: Vec<TrackSummary> },
    /// Volume fan-out, rebroadcast verbatim to every peer.
    VolumeChange { channel: Channel, volume: u8 },
    /// Targeted error report.
    Error { message: String },
}

impl ServerMessage {
    /// Serializes to the single-frame JSON wire form.
    ///
    /// Returns `None` only if serialization itself fails, which for
    /// these types means a bug rather than bad input.
    #[must_use]
    pub fn to_frame(&self) -> Option<String> {
        serde_json::to_string(self).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn channel_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&Channel::Left).unwrap(), "\"left\"");
        assert_eq!(serde_json::to_string(&Channel::Right).unwrap(), "\"right\"");
        assert_eq!(
            serde_json::to_string(&Channel::Stereo).unwrap(),
            "\"stereo\""
        );
    }

    #[test]
    fn channel_artifact_files() {
        assert_eq!(Channel::Left.artifact_file(), "left.mp3");
        assert_eq!(Channel::Right.artifact_file(), "right.mp3");
        assert_eq!(Channel::Stereo.artifact_file(), "stereo.mp3");
    }

    #[test]
    fn join_session_wire_shape() {
        let msg: ClientMessage =
            serde_json::from_value(json!({"type": "join_session", "sessionId": "abcd"})).unwrap();
        assert_eq!(
            msg,
            ClientMessage::JoinSession {
                session_id: "abcd".into()
            }
        );
    }

    #[test]
    fn ping_carries_client_timestamp() {
        let msg: ClientMessage =
            serde_json::from_value(json!({"type": "ping", "clientTimestamp": 1234})).unwrap();
        assert_eq!(
            msg,
            ClientMessage::Ping {
                client_timestamp: 1234
            }
        );
    }

    #[test]
    fn unit_variants_round_trip() {
        for (msg, tag) in [
            (ClientMessage::Ready, "ready"),
            (ClientMessage::PlayRequest, "play_request"),
            (ClientMessage::PauseRequest, "pause_request"),
        ] {
            let value = serde_json::to_value(&msg).unwrap();
            assert_eq!(value["type"], tag);
            let back: ClientMessage = serde_json::from_value(value).unwrap();
            assert_eq!(back, msg);
        }
    }

    #[test]
    fn seek_request_uses_camel_case_field() {
        let value = serde_json::to_value(ClientMessage::SeekRequest { target_time: 12.5 }).unwrap();
        assert_eq!(value["targetTime"], 12.5);
    }

    #[test]
    fn volume_request_round_trips() {
        let msg = ClientMessage::VolumeRequest {
            channel: Channel::Right,
            volume: 80,
        };
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["channel"], "right");
        assert_eq!(value["volume"], 80);
        let back: ClientMessage = serde_json::from_value(value).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn known_type_classification() {
        assert!(ClientMessage::is_known_type("play_request"));
        assert!(ClientMessage::is_known_type("ping"));
        assert!(!ClientMessage::is_known_type("chat_message"));
        assert!(!ClientMessage::is_known_type(""));
    }

    #[test]
    fn session_joined_wire_shape() {
        let value = serde_json::to_value(ServerMessage::SessionJoined {
            session_id: "abcd".into(),
            client_id: "c1".into(),
            channel: Channel::Left,
        })
        .unwrap();
        assert_eq!(value["type"], "session_joined");
        assert_eq!(value["sessionId"], "abcd");
        assert_eq!(value["clientId"], "c1");
        assert_eq!(value["channel"], "left");
    }

    #[test]
    fn audio_ready_wire_shape() {
        let value = serde_json::to_value(ServerMessage::AudioReady {
            audio_url: "http://10.0.0.2:4400/audio/abc123defg/left.mp3".into(),
            duration: 213.0,
            title: "Some Song".into(),
            track_id: "abc123defg".into(),
        })
        .unwrap();
        assert_eq!(value["type"], "audio_ready");
        assert_eq!(value["audioUrl"], "http://10.0.0.2:4400/audio/abc123defg/left.mp3");
        assert_eq!(value["trackId"], "abc123defg");
    }

    #[test]
    fn play_carries_fractional_server_timestamp() {
        let value = serde_json::to_value(ServerMessage::Play {
            start_time: 0.0,
            server_timestamp: 1490.5,
        })
        .unwrap();
        assert_eq!(value["serverTimestamp"], 1490.5);
        assert_eq!(value["startTime"], 0.0);
    }

    #[test]
    fn pong_echoes_client_timestamp() {
        let msg = ServerMessage::Pong {
            server_timestamp: 2000,
            client_timestamp: 1990,
        };
        let back: ServerMessage =
            serde_json::from_str(&msg.to_frame().expect("serializable")).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn client_list_round_trips() {
        let msg = ServerMessage::ClientList {
            clients: vec![
                ClientSummary {
                    id: "c1".into(),
                    channel: Channel::Left,
                    ready: true,
                },
                ClientSummary {
                    id: "c2".into(),
                    channel: Channel::Right,
                    ready: false,
                },
            ],
        };
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["clients"][0]["channel"], "left");
        assert_eq!(value["clients"][1]["ready"], false);
        let back: ServerMessage = serde_json::from_value(value).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn unknown_type_fails_deserialization() {
        let err = serde_json::from_value::<ClientMessage>(json!({"type": "chat_message"}));
        assert!(err.is_err());
    }
}
