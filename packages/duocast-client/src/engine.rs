//! Scheduled-start audio engine.
//!
//! Decodes fetched bytes into PCM and plays them through an
//! [`AudioBackend`], starting at a precomputed local instant so that
//! every device in the session begins at the same wall-clock moment.
//! The engine tracks a `start_anchor` (backend time minus offset into
//! the track) from which the current position is derived, with loop
//! semantics over the buffer.
//!
//! Ended/log notifications go to explicitly registered observers.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;

use crate::backend::{AudioBackend, BackendState, SourceId};
use crate::decode::{decode_bytes, DecodedBuffer};
use crate::error::ClientError;

/// Observer for engine notifications.
///
/// Registration is explicit; there is no ambient event channel.
pub trait EngineObserver: Send + Sync {
    /// Playback stopped with its completion hook still armed.
    fn on_ended(&self) {}

    /// Diagnostic message for debug surfaces.
    fn on_log(&self, _msg: &str) {}
}

struct EngineInner {
    buffer: Option<Arc<DecodedBuffer>>,
    volume: f32,
    source: Option<SourceId>,
    /// Backend instant at which position 0 of the track would have
    /// started: `scheduled_backend_start - from_sec`.
    start_anchor: Option<f64>,
    /// Resume offset captured by pause (and seeks while paused).
    paused_at: f64,
    playing: bool,
    /// Whether stopping the source should notify `on_ended`.
    ended_hook_armed: bool,
}

/// Client-side playback engine with scheduled start.
pub struct AudioEngine {
    backend: Arc<dyn AudioBackend>,
    inner: Mutex<EngineInner>,
    observers: Mutex<Vec<Arc<dyn EngineObserver>>>,
}

fn local_now_ms() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64() * 1000.0)
        .unwrap_or(0.0)
}

impl AudioEngine {
    /// Creates an engine over the given backend.
    #[must_use]
    pub fn new(backend: Arc<dyn AudioBackend>) -> Self {
        Self {
            backend,
            inner: Mutex::new(EngineInner {
                buffer: None,
                volume: 1.0,
                source: None,
                start_anchor: None,
                paused_at: 0.0,
                playing: false,
                ended_hook_armed: false,
            }),
            observers: Mutex::new(Vec::new()),
        }
    }

    /// Registers an observer for ended/log notifications.
    pub fn register_observer(&self, observer: Arc<dyn EngineObserver>) {
        self.observers.lock().push(observer);
    }

    fn notify_log(&self, msg: &str) {
        log::debug!("[Engine] {msg}");
        for observer in self.observers.lock().iter() {
            observer.on_log(msg);
        }
    }

    fn notify_ended(&self) {
        for observer in self.observers.lock().iter() {
            observer.on_ended();
        }
    }

    /// Decodes a fetched byte buffer and makes it the active track.
    ///
    /// Stops any current playback (firing the ended hook) and resets
    /// the position to 0.
    pub fn load(&self, bytes: Vec<u8>) -> Result<(), ClientError> {
        let buffer = Arc::new(decode_bytes(bytes)?);
        self.stop();
        {
            let mut inner = self.inner.lock();
            inner.buffer = Some(buffer);
            inner.paused_at = 0.0;
        }
        let duration = self.duration();
        self.notify_log(&format!("audio loaded ({duration:.1}s)"));
        Ok(())
    }

    /// Whether a decoded buffer is loaded.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.inner.lock().buffer.is_some()
    }

    /// Track duration in seconds, 0 before load.
    #[must_use]
    pub fn duration(&self) -> f64 {
        self.inner
            .lock()
            .buffer
            .as_ref()
            .map(|b| b.duration_sec())
            .unwrap_or(0.0)
    }

    /// Whether playback is active.
    #[must_use]
    pub fn is_playing(&self) -> bool {
        self.inner.lock().playing
    }

    /// Starts playback `from_sec` into the track at the local
    /// wall-clock instant `scheduled_local_ms`.
    ///
    /// An instant already in the past schedules immediately; the
    /// resulting skew is accepted and corrected by the next broadcast.
    ///
    /// # Errors
    ///
    /// `BackendSuspended` when the backend needs a user gesture,
    /// `NotLoaded` before a successful `load`.
    pub fn play_at(&self, from_sec: f64, scheduled_local_ms: f64) -> Result<(), ClientError> {
        if self.backend.state() == BackendState::Suspended {
            self.backend.resume()?;
        }

        let mut inner = self.inner.lock();
        let buffer = inner.buffer.clone().ok_or(ClientError::NotLoaded)?;

        // Replace any prior source with its completion hook detached.
        if let Some(source) = inner.source.take() {
            inner.ended_hook_armed = false;
            self.backend.stop_source(source);
        }

        let from_sec = from_sec.clamp(0.0, buffer.duration_sec());
        let delay_sec = ((scheduled_local_ms - local_now_ms()) / 1000.0).max(0.0);
        let start_at = self.backend.now() + delay_sec;

        self.backend.set_gain(inner.volume);
        let source = self.backend.start_source(buffer, from_sec, start_at)?;

        inner.source = Some(source);
        inner.start_anchor = Some(start_at - from_sec);
        inner.paused_at = from_sec;
        inner.playing = true;
        inner.ended_hook_armed = true;
        drop(inner);

        self.notify_log(&format!(
            "scheduled start at +{:.0}ms from {from_sec:.2}s",
            delay_sec * 1000.0
        ));
        Ok(())
    }

    /// Pauses, capturing the current position as the resume offset.
    /// The completion hook is detached, so no ended event fires.
    pub fn pause(&self) {
        let mut inner = self.inner.lock();
        if !inner.playing {
            return;
        }
        let position = current_position(&inner, &*self.backend);
        inner.paused_at = position;
        inner.playing = false;
        inner.start_anchor = None;
        inner.ended_hook_armed = false;
        if let Some(source) = inner.source.take() {
            self.backend.stop_source(source);
        }
    }

    /// Seeks to `t` (clamped to the track), restarting playback from
    /// the clamped offset immediately if currently playing.
    pub fn seek_to(&self, t: f64) -> Result<(), ClientError> {
        let (playing, clamped) = {
            let inner = self.inner.lock();
            let duration = inner
                .buffer
                .as_ref()
                .map(|b| b.duration_sec())
                .unwrap_or(0.0);
            (inner.playing, t.clamp(0.0, duration))
        };
        if playing {
            self.play_at(clamped, local_now_ms())
        } else {
            self.inner.lock().paused_at = clamped;
            Ok(())
        }
    }

    /// Sets the gain (clamped to 0.0 - 1.0).
    pub fn set_volume(&self, volume: f32) {
        let volume = volume.clamp(0.0, 1.0);
        self.inner.lock().volume = volume;
        self.backend.set_gain(volume);
    }

    /// Current gain.
    #[must_use]
    pub fn volume(&self) -> f32 {
        self.inner.lock().volume
    }

    /// Current position in seconds, derived from the start anchor while
    /// playing (wrapping over the loop), the resume offset otherwise.
    #[must_use]
    pub fn current_time(&self) -> f64 {
        let inner = self.inner.lock();
        current_position(&inner, &*self.backend)
    }

    /// Stops playback entirely, firing the ended hook if still armed.
    pub fn stop(&self) {
        let (source, ended) = {
            let mut inner = self.inner.lock();
            let ended = inner.ended_hook_armed;
            inner.ended_hook_armed = false;
            inner.playing = false;
            inner.start_anchor = None;
            inner.paused_at = 0.0;
            (inner.source.take(), ended)
        };
        if let Some(source) = source {
            self.backend.stop_source(source);
        }
        if ended {
            self.notify_ended();
        }
    }

    /// Background-tab defence: resume a suspended backend while
    /// playing, without re-anchoring. Drift is accepted and corrected
    /// by the next broadcast event. Call every second while playing and
    /// on visibility changes.
    pub fn tick_resume_if_suspended(&self) {
        if self.is_playing() && self.backend.state() == BackendState::Suspended {
            match self.backend.resume() {
                Ok(()) => self.notify_log("backend resumed"),
                Err(e) => self.notify_log(&format!("backend resume failed: {e}")),
            }
        }
    }
}

fn current_position(inner: &EngineInner, backend: &dyn AudioBackend) -> f64 {
    if !inner.playing {
        return inner.paused_at;
    }
    let Some(anchor) = inner.start_anchor else {
        return inner.paused_at;
    };
    let elapsed = backend.now() - anchor;
    let duration = inner
        .buffer
        .as_ref()
        .map(|b| b.duration_sec())
        .unwrap_or(0.0);
    if duration > 0.0 && elapsed >= 0.0 {
        // Looping source wraps position over the track length
        elapsed % duration
    } else {
        elapsed.max(0.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex as PlMutex;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    /// Backend with a hand-advanced clock.
    struct ManualBackend {
        clock_sec: PlMutex<f64>,
        gain: PlMutex<f32>,
        suspended: AtomicBool,
        gesture_required: AtomicBool,
        started: PlMutex<Vec<(SourceId, f64, f64)>>, // (id, offset, start_at)
        stopped: PlMutex<Vec<SourceId>>,
        next_id: AtomicUsize,
    }

    impl ManualBackend {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                clock_sec: PlMutex::new(100.0),
                gain: PlMutex::new(1.0),
                suspended: AtomicBool::new(false),
                gesture_required: AtomicBool::new(false),
                started: PlMutex::new(Vec::new()),
                stopped: PlMutex::new(Vec::new()),
                next_id: AtomicUsize::new(1),
            })
        }

        fn advance(&self, dt: f64) {
            *self.clock_sec.lock() += dt;
        }
    }

    impl AudioBackend for ManualBackend {
        fn state(&self) -> BackendState {
            if self.suspended.load(Ordering::Relaxed) {
                BackendState::Suspended
            } else {
                BackendState::Running
            }
        }

        fn resume(&self) -> Result<(), ClientError> {
            if self.gesture_required.load(Ordering::Relaxed) {
                return Err(ClientError::BackendSuspended);
            }
            self.suspended.store(false, Ordering::Relaxed);
            Ok(())
        }

        fn now(&self) -> f64 {
            *self.clock_sec.lock()
        }

        fn set_gain(&self, gain: f32) {
            *self.gain.lock() = gain;
        }

        fn start_source(
            &self,
            _buffer: Arc<DecodedBuffer>,
            offset_sec: f64,
            start_at: f64,
        ) -> Result<SourceId, ClientError> {
            let id = self.next_id.fetch_add(1, Ordering::Relaxed) as SourceId;
            self.started.lock().push((id, offset_sec, start_at));
            Ok(id)
        }

        fn stop_source(&self, id: SourceId) {
            self.stopped.lock().push(id);
        }
    }

    /// Ten seconds of silent mono PCM.
    fn loaded_engine(backend: Arc<ManualBackend>) -> AudioEngine {
        let engine = AudioEngine::new(backend);
        let buffer = DecodedBuffer {
            samples: vec![0.0; 80_000],
            channels: 1,
            sample_rate: 8_000,
        };
        engine.inner.lock().buffer = Some(Arc::new(buffer));
        engine
    }

    struct CountingObserver {
        ended: AtomicUsize,
    }

    impl EngineObserver for CountingObserver {
        fn on_ended(&self) {
            self.ended.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[test]
    fn play_at_future_instant_schedules_with_delay() {
        let backend = ManualBackend::new();
        let engine = loaded_engine(Arc::clone(&backend));

        engine.play_at(2.0, local_now_ms() + 500.0).unwrap();

        let started = backend.started.lock();
        let (_, offset, start_at) = started[0];
        assert_eq!(offset, 2.0);
        // Scheduled ~0.5s ahead on the backend clock (some slack for
        // test wall-clock drift)
        assert!(start_at > 100.4 && start_at < 100.6, "start_at={start_at}");
    }

    #[test]
    fn play_at_past_instant_starts_immediately() {
        let backend = ManualBackend::new();
        let engine = loaded_engine(Arc::clone(&backend));

        engine.play_at(0.0, local_now_ms() - 2_000.0).unwrap();

        let started = backend.started.lock();
        let (_, _, start_at) = started[0];
        assert_eq!(start_at, 100.0);
    }

    #[test]
    fn current_time_tracks_anchor() {
        let backend = ManualBackend::new();
        let engine = loaded_engine(Arc::clone(&backend));

        engine.play_at(2.0, local_now_ms()).unwrap();
        backend.advance(3.0);
        assert!((engine.current_time() - 5.0).abs() < 0.05);
    }

    #[test]
    fn current_time_wraps_over_loop() {
        let backend = ManualBackend::new();
        let engine = loaded_engine(Arc::clone(&backend));

        engine.play_at(0.0, local_now_ms()).unwrap();
        backend.advance(23.0); // duration is 10s
        let t = engine.current_time();
        assert!((t - 3.0).abs() < 0.05, "wrapped position was {t}");
    }

    #[test]
    fn pause_captures_resume_offset() {
        let backend = ManualBackend::new();
        let engine = loaded_engine(Arc::clone(&backend));

        engine.play_at(1.0, local_now_ms()).unwrap();
        backend.advance(2.0);
        engine.pause();

        assert!(!engine.is_playing());
        assert!((engine.current_time() - 3.0).abs() < 0.05);
        // The stop detached the hook: the source was stopped
        assert_eq!(backend.stopped.lock().len(), 1);
    }

    #[test]
    fn replay_replaces_prior_source() {
        let backend = ManualBackend::new();
        let engine = loaded_engine(Arc::clone(&backend));

        engine.play_at(0.0, local_now_ms()).unwrap();
        engine.play_at(4.0, local_now_ms()).unwrap();

        assert_eq!(backend.started.lock().len(), 2);
        assert_eq!(backend.stopped.lock().len(), 1);
    }

    #[test]
    fn seek_while_paused_just_moves_offset() {
        let backend = ManualBackend::new();
        let engine = loaded_engine(Arc::clone(&backend));

        engine.seek_to(6.5).unwrap();
        assert_eq!(engine.current_time(), 6.5);
        assert!(backend.started.lock().is_empty());
    }

    #[test]
    fn seek_clamps_to_duration() {
        let backend = ManualBackend::new();
        let engine = loaded_engine(Arc::clone(&backend));

        engine.seek_to(500.0).unwrap();
        assert_eq!(engine.current_time(), 10.0);
        engine.seek_to(-3.0).unwrap();
        assert_eq!(engine.current_time(), 0.0);
    }

    #[test]
    fn seek_while_playing_restarts_from_offset() {
        let backend = ManualBackend::new();
        let engine = loaded_engine(Arc::clone(&backend));

        engine.play_at(0.0, local_now_ms()).unwrap();
        engine.seek_to(7.0).unwrap();

        let started = backend.started.lock();
        assert_eq!(started.len(), 2);
        assert_eq!(started[1].1, 7.0);
        assert!(engine.is_playing());
    }

    #[test]
    fn suspended_backend_with_gesture_fails_play() {
        let backend = ManualBackend::new();
        backend.suspended.store(true, Ordering::Relaxed);
        backend.gesture_required.store(true, Ordering::Relaxed);
        let engine = loaded_engine(Arc::clone(&backend));

        assert!(matches!(
            engine.play_at(0.0, local_now_ms()),
            Err(ClientError::BackendSuspended)
        ));
    }

    #[test]
    fn suspended_backend_resumes_synchronously_when_allowed() {
        let backend = ManualBackend::new();
        backend.suspended.store(true, Ordering::Relaxed);
        let engine = loaded_engine(Arc::clone(&backend));

        engine.play_at(0.0, local_now_ms()).unwrap();
        assert_eq!(backend.state(), BackendState::Running);
    }

    #[test]
    fn play_before_load_is_refused() {
        let backend = ManualBackend::new();
        let engine = AudioEngine::new(backend);
        assert!(matches!(
            engine.play_at(0.0, local_now_ms()),
            Err(ClientError::NotLoaded)
        ));
    }

    #[test]
    fn stop_fires_ended_hook_but_pause_does_not() {
        let backend = ManualBackend::new();
        let engine = loaded_engine(Arc::clone(&backend));
        let observer = Arc::new(CountingObserver {
            ended: AtomicUsize::new(0),
        });
        engine.register_observer(observer.clone());

        engine.play_at(0.0, local_now_ms()).unwrap();
        engine.pause();
        assert_eq!(observer.ended.load(Ordering::Relaxed), 0);

        engine.play_at(0.0, local_now_ms()).unwrap();
        engine.stop();
        assert_eq!(observer.ended.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn volume_clamps_and_reaches_backend() {
        let backend = ManualBackend::new();
        let engine = loaded_engine(Arc::clone(&backend));

        engine.set_volume(1.7);
        assert_eq!(engine.volume(), 1.0);
        engine.set_volume(0.25);
        assert_eq!(*backend.gain.lock(), 0.25);
    }

    #[test]
    fn resume_tick_only_acts_while_playing_and_suspended() {
        let backend = ManualBackend::new();
        let engine = loaded_engine(Arc::clone(&backend));

        // Not playing: no-op even if suspended
        backend.suspended.store(true, Ordering::Relaxed);
        engine.tick_resume_if_suspended();
        assert_eq!(backend.state(), BackendState::Suspended);

        backend.suspended.store(false, Ordering::Relaxed);
        engine.play_at(0.0, local_now_ms()).unwrap();
        backend.suspended.store(true, Ordering::Relaxed);
        engine.tick_resume_if_suspended();
        assert_eq!(backend.state(), BackendState::Running);
    }
}
