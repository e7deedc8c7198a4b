//! cpal-based output backend.
//!
//! The stream lives on a dedicated thread because cpal streams are not
//! `Send`; all control flows through shared render state. The backend
//! clock counts rendered frames, so scheduling is sample-accurate
//! relative to the device.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleRate, StreamConfig};
use parking_lot::Mutex;

use crate::backend::{AudioBackend, BackendState, SourceId};
use crate::decode::DecodedBuffer;
use crate::error::ClientError;

struct ActiveSource {
    id: SourceId,
    buffer: Arc<DecodedBuffer>,
    /// Backend clock frame at which playback begins.
    start_frame: u64,
    /// Frames into the buffer at `start_frame`.
    offset_frames: u64,
}

struct RenderState {
    clock_frames: u64,
    gain: f32,
    active: Option<ActiveSource>,
}

/// cpal-backed output at a fixed sample rate and channel count.
pub struct CpalBackend {
    shared: Arc<Mutex<RenderState>>,
    sample_rate: u32,
    channels: u16,
    next_id: AtomicU64,
    stop: Arc<AtomicBool>,
    render_thread: std::thread::JoinHandle<()>,
}

impl CpalBackend {
    /// Opens the default output device at the given format.
    pub fn new(sample_rate: u32, channels: u16) -> Result<Self, ClientError> {
        let shared = Arc::new(Mutex::new(RenderState {
            clock_frames: 0,
            gain: 1.0,
            active: None,
        }));
        let stop = Arc::new(AtomicBool::new(false));

        let (ready_tx, ready_rx) = std::sync::mpsc::channel();
        let thread_shared = Arc::clone(&shared);
        let thread_stop = Arc::clone(&stop);
        let render_thread = std::thread::Builder::new()
            .name("duocast-audio".to_string())
            .spawn(move || {
                let stream = match build_stream(sample_rate, channels, thread_shared) {
                    Ok(stream) => {
                        let _ = ready_tx.send(Ok(()));
                        stream
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                while !thread_stop.load(Ordering::Relaxed) {
                    std::thread::park_timeout(Duration::from_millis(200));
                }
                drop(stream);
            })
            .map_err(|e| ClientError::Output(e.to_string()))?;

        ready_rx
            .recv()
            .map_err(|_| ClientError::Output("audio thread died during setup".to_string()))??;

        Ok(Self {
            shared,
            sample_rate,
            channels,
            next_id: AtomicU64::new(1),
            stop,
            render_thread,
        })
    }
}

impl Drop for CpalBackend {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        self.render_thread.thread().unpark();
    }
}

fn build_stream(
    sample_rate: u32,
    channels: u16,
    shared: Arc<Mutex<RenderState>>,
) -> Result<cpal::Stream, ClientError> {
    let host = cpal::default_host();
    let device = host
        .default_output_device()
        .ok_or_else(|| ClientError::Output("no output device available".to_string()))?;

    if let Ok(default) = device.default_output_config() {
        if default.sample_rate().0 != sample_rate || default.channels() != channels {
            log::warn!(
                "Requested {}Hz/{}ch; device default is {}Hz/{}ch (OS may resample)",
                sample_rate,
                channels,
                default.sample_rate().0,
                default.channels()
            );
        }
    }

    let config = StreamConfig {
        channels,
        sample_rate: SampleRate(sample_rate),
        buffer_size: cpal::BufferSize::Default,
    };
    let out_channels = channels as usize;

    let stream = device
        .build_output_stream(
            &config,
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                let mut state = shared.lock();
                let frames = data.len() / out_channels;
                for frame in 0..frames {
                    let clock = state.clock_frames + frame as u64;
                    let base = frame * out_channels;
                    let mut silent = true;
                    if let Some(src) = &state.active {
                        let buf_frames = src.buffer.frames() as u64;
                        if clock >= src.start_frame && buf_frames > 0 {
                            // Looping read position
                            let pos =
                                ((src.offset_frames + (clock - src.start_frame)) % buf_frames)
                                    as usize;
                            let buf_channels = src.buffer.channels as usize;
                            for ch in 0..out_channels {
                                let src_ch = ch.min(buf_channels - 1);
                                data[base + ch] =
                                    src.buffer.samples[pos * buf_channels + src_ch] * state.gain;
                            }
                            silent = false;
                        }
                    }
                    if silent {
                        for ch in 0..out_channels {
                            data[base + ch] = 0.0;
                        }
                    }
                }
                state.clock_frames += frames as u64;
            },
            |err| log::error!("Audio stream error: {err}"),
            None,
        )
        .map_err(|e| ClientError::Output(e.to_string()))?;

    stream.play().map_err(|e| ClientError::Output(e.to_string()))?;
    Ok(stream)
}

impl AudioBackend for CpalBackend {
    fn state(&self) -> BackendState {
        // cpal output streams render continuously once opened; the
        // suspended state exists for backends with autoplay gating.
        BackendState::Running
    }

    fn resume(&self) -> Result<(), ClientError> {
        Ok(())
    }

    fn now(&self) -> f64 {
        self.shared.lock().clock_frames as f64 / f64::from(self.sample_rate)
    }

    fn set_gain(&self, gain: f32) {
        self.shared.lock().gain = gain.clamp(0.0, 1.0);
    }

    fn start_source(
        &self,
        buffer: Arc<DecodedBuffer>,
        offset_sec: f64,
        start_at: f64,
    ) -> Result<SourceId, ClientError> {
        if buffer.frames() == 0 {
            return Err(ClientError::NotLoaded);
        }
        if buffer.sample_rate != self.sample_rate {
            log::warn!(
                "Buffer is {}Hz but output runs at {}Hz; playback will be off-speed",
                buffer.sample_rate,
                self.sample_rate
            );
        }
        if buffer.channels > self.channels {
            log::warn!(
                "Buffer has {} channels, output {}; extra channels dropped",
                buffer.channels,
                self.channels
            );
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut state = self.shared.lock();
        let requested = ((start_at * f64::from(self.sample_rate)).round().max(0.0)) as u64;
        // A start instant already in the past plays immediately.
        let start_frame = requested.max(state.clock_frames);
        let offset_frames =
            ((offset_sec * f64::from(buffer.sample_rate)).round().max(0.0)) as u64;
        state.active = Some(ActiveSource {
            id,
            buffer,
            start_frame,
            offset_frames,
        });
        Ok(id)
    }

    fn stop_source(&self, id: SourceId) {
        let mut state = self.shared.lock();
        if state.active.as_ref().map(|s| s.id) == Some(id) {
            state.active = None;
        }
    }
}
