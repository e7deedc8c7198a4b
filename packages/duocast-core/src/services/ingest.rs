//! Audio ingestion pipeline.
//!
//! Orchestrates the external fetcher and transcoder to turn a remote
//! source URL into per-channel artifacts. The pipeline is progressive:
//! it returns to the caller as soon as both channel files pass the
//! ready threshold, while the transcoder keeps writing in the
//! background. Metadata is written only on clean transcoder exit, so a
//! failed or interrupted ingestion leaves a metadata-less directory
//! that the library never surfaces.

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

use crate::config::Config;
use crate::error::{DuocastError, DuocastResult};
use crate::services::library::{Library, Track, TrackFiles};
use crate::utils::{new_track_id, now_millis};

/// Two-output pan graph: channel 0 of the source to the left artifact,
/// channel 1 to the right.
const PAN_FILTER: &str = "[0:a]pan=mono|c0=c0[L];[0:a]pan=mono|c0=c1[R]";

/// Artifact bitrate handed to the transcoder.
const ARTIFACT_BITRATE: &str = "192k";

/// How much captured stderr to keep for error reports.
const STDERR_TAIL_BYTES: usize = 500;

// ─────────────────────────────────────────────────────────────────────────────
// External fetcher
// ─────────────────────────────────────────────────────────────────────────────

/// Probes a remote source for title, duration, and a direct stream URL.
///
/// The production implementation shells out to the external fetcher;
/// tests substitute their own.
#[async_trait]
pub trait MediaFetcher: Send + Sync {
    /// Human-readable title of the source.
    async fn title(&self, url: &str) -> DuocastResult<String>;

    /// Duration of the source in seconds.
    async fn duration(&self, url: &str) -> DuocastResult<f64>;

    /// Direct media URL the transcoder can read from.
    async fn stream_url(&self, url: &str) -> DuocastResult<String>;
}

/// `MediaFetcher` backed by the external fetcher command.
pub struct ExternalMediaFetcher {
    bin: String,
}

impl ExternalMediaFetcher {
    /// Creates a fetcher invoking the given command.
    #[must_use]
    pub fn new(bin: impl Into<String>) -> Self {
        Self { bin: bin.into() }
    }
}

#[async_trait]
impl MediaFetcher for ExternalMediaFetcher {
    async fn title(&self, url: &str) -> DuocastResult<String> {
        run_capture(&self.bin, &["--title", url]).await
    }

    async fn duration(&self, url: &str) -> DuocastResult<f64> {
        let raw = run_capture(&self.bin, &["--duration", url]).await?;
        raw.parse::<i64>()
            .map(|secs| secs as f64)
            .map_err(|_| DuocastError::FetchFailed(format!("bad duration output: {raw}")))
    }

    async fn stream_url(&self, url: &str) -> DuocastResult<String> {
        run_capture(&self.bin, &["--stream-url", url]).await
    }
}

/// Runs a command, returning the first non-empty stdout line.
///
/// Exit code 0 means success; any non-zero exit becomes a `FetchFailed`
/// carrying the captured stderr.
async fn run_capture(bin: &str, args: &[&str]) -> DuocastResult<String> {
    let output = Command::new(bin)
        .args(args)
        .output()
        .await
        .map_err(|e| DuocastError::FetchFailed(format!("{bin}: {e}")))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(DuocastError::FetchFailed(format!(
            "{bin} {}: {}",
            output.status,
            stderr.trim()
        )));
    }

    String::from_utf8_lossy(&output.stdout)
        .lines()
        .next()
        .map(|line| line.trim().to_string())
        .filter(|line| !line.is_empty())
        .ok_or_else(|| DuocastError::FetchFailed(format!("{bin}: empty output")))
}

// ─────────────────────────────────────────────────────────────────────────────
// Pipeline
// ─────────────────────────────────────────────────────────────────────────────

/// Drives ingestion: probe, stream-transcode, progressive-ready
/// barrier, completion hook.
pub struct IngestPipeline {
    config: Arc<Config>,
    library: Arc<Library>,
    fetcher: Arc<dyn MediaFetcher>,
}

impl IngestPipeline {
    /// Creates a pipeline using the external fetcher from the config.
    #[must_use]
    pub fn new(config: Arc<Config>, library: Arc<Library>) -> Self {
        let fetcher = Arc::new(ExternalMediaFetcher::new(config.fetcher_bin.clone()));
        Self::with_fetcher(config, library, fetcher)
    }

    /// Creates a pipeline with a custom fetcher (tests).
    #[must_use]
    pub fn with_fetcher(
        config: Arc<Config>,
        library: Arc<Library>,
        fetcher: Arc<dyn MediaFetcher>,
    ) -> Self {
        Self {
            config,
            library,
            fetcher,
        }
    }

    /// Ingests a remote source, returning once playback can begin.
    ///
    /// The returned track is playable but still being written; metadata
    /// lands on disk when the transcoder finishes. Callers are expected
    /// to have validated the URL host already.
    ///
    /// # Errors
    ///
    /// `FetchFailed` if no direct stream URL could be produced;
    /// `TranscodeFailed` if the transcoder dies before the artifacts
    /// pass the ready threshold.
    pub async fn ingest(&self, source_url: &str) -> DuocastResult<Track> {
        // Probe title, duration, and stream URL in parallel. Title and
        // duration degrade gracefully; a missing stream URL aborts.
        let (title, duration, stream_url) = tokio::join!(
            self.fetcher.title(source_url),
            self.fetcher.duration(source_url),
            self.fetcher.stream_url(source_url),
        );
        let title = title.unwrap_or_else(|e| {
            log::warn!("[Ingest] Title probe failed, using fallback: {e}");
            "Unknown".to_string()
        });
        let duration = duration.unwrap_or_else(|e| {
            log::warn!("[Ingest] Duration probe failed, using 0: {e}");
            0.0
        });
        let stream_url = stream_url?;

        let track_id = new_track_id();
        let track_dir = self.library.track_dir(&track_id);
        tokio::fs::create_dir_all(&track_dir).await?;

        let left = self
            .library
            .artifact_path(&track_id, duocast_proto::Channel::Left);
        let right = self
            .library
            .artifact_path(&track_id, duocast_proto::Channel::Right);

        let track = Track {
            id: track_id.clone(),
            title,
            duration,
            files: TrackFiles::for_track(&track_id),
            original_url: source_url.to_string(),
            created_at: now_millis(),
        };

        log::info!(
            "[Ingest] Starting transcode for track {} ({})",
            track_id,
            track.title
        );

        let mut child = Command::new(&self.config.transcoder_bin)
            .args(transcoder_args(
                &stream_url,
                &left.to_string_lossy(),
                &right.to_string_lossy(),
            ))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                DuocastError::TranscodeFailed(format!("{}: {e}", self.config.transcoder_bin))
            })?;

        // Completion hook runs for the whole transcode, long after this
        // method has returned at the ready barrier.
        let (exit_tx, exit_rx) = watch::channel(None::<bool>);
        let stderr = child.stderr.take();
        let finalize = FinalizeContext {
            library: Arc::clone(&self.library),
            probe_bin: self.config.probe_bin.clone(),
            track: track.clone(),
            left_path: left.to_string_lossy().into_owned(),
        };
        tokio::spawn(async move {
            let tail = read_stderr_tail(stderr).await;
            let success = matches!(child.wait().await, Ok(status) if status.success());
            if success {
                finalize.write_metadata().await;
            } else {
                log::warn!(
                    "[Ingest] Transcoder failed for track {}: {}",
                    finalize.track.id,
                    tail
                );
                if let Err(e) = tokio::fs::remove_dir_all(&finalize.library.track_dir(&finalize.track.id)).await {
                    log::warn!("[Ingest] Could not remove partial track dir: {e}");
                }
            }
            let _ = exit_tx.send(Some(success));
        });

        self.wait_until_ready(&left, &right, exit_rx).await?;

        log::info!("[Ingest] Track {} playable (progressive)", track_id);
        Ok(track)
    }

    /// Progressive-ready barrier: resolves when both channel artifacts
    /// pass the size threshold, or when the transcoder exits.
    async fn wait_until_ready(
        &self,
        left: &std::path::Path,
        right: &std::path::Path,
        mut exit_rx: watch::Receiver<Option<bool>>,
    ) -> DuocastResult<()> {
        let threshold = self.config.ready_threshold_bytes;
        let mut poll =
            tokio::time::interval(Duration::from_millis(self.config.ready_poll_interval_ms));
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = poll.tick() => {
                    let smallest = file_size(left).await.min(file_size(right).await);
                    if smallest >= threshold {
                        return Ok(());
                    }
                }
                changed = exit_rx.changed() => {
                    match *exit_rx.borrow() {
                        // Finished before the barrier: short source, fully written.
                        Some(true) => return Ok(()),
                        Some(false) => {
                            return Err(DuocastError::TranscodeFailed(
                                "transcoder exited before output was playable".to_string(),
                            ))
                        }
                        None => {}
                    }
                    if changed.is_err() {
                        return Err(DuocastError::TranscodeFailed(
                            "transcoder watcher dropped".to_string(),
                        ));
                    }
                }
            }
        }
    }
}

/// State the completion hook needs after the pipeline has returned.
struct FinalizeContext {
    library: Arc<Library>,
    probe_bin: String,
    track: Track,
    left_path: String,
}

impl FinalizeContext {
    /// Writes metadata, probing the finished artifact for a duration if
    /// the source probe came up empty.
    async fn write_metadata(mut self) {
        if self.track.duration == 0.0 {
            match probe_duration(&self.probe_bin, &self.left_path).await {
                Ok(secs) => self.track.duration = secs,
                Err(e) => log::warn!(
                    "[Ingest] Duration probe of artifact failed for {}: {e}",
                    self.track.id
                ),
            }
        }
        match self.library.write_metadata(&self.track) {
            Ok(()) => log::info!("[Ingest] Track {} complete", self.track.id),
            Err(e) => log::warn!("[Ingest] Metadata write failed for {}: {e}", self.track.id),
        }
    }
}

/// Runs `probe -duration FILE`, parsing float seconds from stdout.
async fn probe_duration(bin: &str, file: &str) -> DuocastResult<f64> {
    let raw = run_capture(bin, &["-duration", file]).await?;
    raw.parse::<f64>()
        .map_err(|_| DuocastError::FetchFailed(format!("bad probe output: {raw}")))
}

/// Argument list for the external transcoder's two-output pan graph.
fn transcoder_args(stream_url: &str, left: &str, right: &str) -> Vec<String> {
    vec![
        "-i".to_string(),
        stream_url.to_string(),
        "-filter_complex".to_string(),
        PAN_FILTER.to_string(),
        "-map".to_string(),
        "[L]".to_string(),
        "-b:a".to_string(),
        ARTIFACT_BITRATE.to_string(),
        left.to_string(),
        "-map".to_string(),
        "[R]".to_string(),
        "-b:a".to_string(),
        ARTIFACT_BITRATE.to_string(),
        right.to_string(),
        "-y".to_string(),
    ]
}

async fn file_size(path: &std::path::Path) -> u64 {
    tokio::fs::metadata(path).await.map(|m| m.len()).unwrap_or(0)
}

async fn read_stderr_tail(stderr: Option<tokio::process::ChildStderr>) -> String {
    let Some(mut stderr) = stderr else {
        return String::new();
    };
    let mut buf = String::new();
    if stderr.read_to_string(&mut buf).await.is_err() {
        return String::new();
    }
    let start = buf.len().saturating_sub(STDERR_TAIL_BYTES);
    buf[start..].trim().to_string()
}
