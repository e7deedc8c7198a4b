//! General utilities shared across the application.

use std::time::{SystemTime, UNIX_EPOCH};

use url::Url;

use crate::error::{DuocastError, DuocastResult};

// ─────────────────────────────────────────────────────────────────────────────
// Time Utilities
// ─────────────────────────────────────────────────────────────────────────────

/// Returns the current Unix timestamp in milliseconds.
///
/// Returns 0 if the system clock is before the Unix epoch (shouldn't happen in practice).
#[must_use]
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

// ─────────────────────────────────────────────────────────────────────────────
// Identifiers
// ─────────────────────────────────────────────────────────────────────────────

/// Length of a track id: long enough to be unique across a personal
/// library, short enough to read in artifact URLs.
const TRACK_ID_LEN: usize = 10;

/// Generates an opaque track id (10 hex chars from a v4 UUID).
#[must_use]
pub fn new_track_id() -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    id[..TRACK_ID_LEN].to_string()
}

/// Generates a short client id for the roster.
#[must_use]
pub fn new_client_id() -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    format!("c-{}", &id[..8])
}

/// Generates a short session id for clients that join without one.
#[must_use]
pub fn new_session_id() -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    id[..4].to_string()
}

// ─────────────────────────────────────────────────────────────────────────────
// Source URL Validation
// ─────────────────────────────────────────────────────────────────────────────

/// Hosts accepted for ingestion sources.
const ACCEPTED_HOSTS: &[&str] = &[
    "youtube.com",
    "www.youtube.com",
    "m.youtube.com",
    "youtu.be",
];

/// Validates that a submitted source URL points at an accepted host.
///
/// Returns the parsed URL so callers pass a canonical form downstream.
///
/// # Errors
///
/// `UrlRejected` for unparsable URLs, non-http(s) schemes, and hosts
/// outside the acceptance list.
pub fn validate_source_url(raw: &str) -> DuocastResult<Url> {
    let url =
        Url::parse(raw).map_err(|_| DuocastError::UrlRejected(format!("unparsable: {raw}")))?;

    if !matches!(url.scheme(), "http" | "https") {
        return Err(DuocastError::UrlRejected(format!(
            "unsupported scheme: {}",
            url.scheme()
        )));
    }

    match url.host_str() {
        Some(host) if ACCEPTED_HOSTS.contains(&host) => Ok(url),
        Some(host) => Err(DuocastError::UrlRejected(host.to_string())),
        None => Err(DuocastError::UrlRejected(format!("no host: {raw}"))),
    }
}
