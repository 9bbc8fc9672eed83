//! Microphone capture via cpal.
//!
//! # Design constraints
//!
//! The cpal input callback runs on an OS audio thread at elevated
//! priority. It must not allocate, block or perform I/O — it only writes
//! into the lock-free SPSC ring producer.
//!
//! # Threading note
//!
//! `cpal::Stream` is `!Send` on most platforms (COM on Windows, CoreAudio
//! on macOS). `AudioCapture` must be created and dropped on the same
//! thread; the audio worker does both inside its own capture thread.

pub mod frames;

#[cfg(feature = "audio-cpal")]
use cpal::{
    traits::{DeviceTrait, HostTrait, StreamTrait},
    SampleFormat, SampleRate, Stream, StreamConfig,
};

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

#[cfg(feature = "audio-cpal")]
use tracing::{error, info, warn};

use crate::buffering::AudioProducer;
#[cfg(feature = "audio-cpal")]
use crate::buffering::Producer;
use crate::error::Result;
#[cfg(not(feature = "audio-cpal"))]
use crate::error::AurigaError;

/// Handle to an active input stream.
///
/// **Not `Send`** — create and drop on the same OS thread.
pub struct AudioCapture {
    #[cfg(feature = "audio-cpal")]
    _stream: Stream,
    running: Arc<AtomicBool>,
    /// Set by the stream error callback on device loss.
    failed: Arc<AtomicBool>,
    /// Actual capture rate reported by the device (Hz).
    pub sample_rate: u32,
}

#[cfg(feature = "audio-cpal")]
impl AudioCapture {
    /// Open an input device by preferred name, falling back to the system
    /// default and then the first available input.
    pub fn open(
        mut producer: AudioProducer,
        running: Arc<AtomicBool>,
        preferred_device_name: Option<&str>,
    ) -> Result<Self> {
        use crate::error::AurigaError;

        let host = cpal::default_host();
        let mut devices: Vec<(String, cpal::Device)> = host
            .input_devices()
            .map_err(|e| AurigaError::AudioDevice(e.to_string()))?
            .enumerate()
            .map(|(idx, device)| {
                let name = device
                    .name()
                    .unwrap_or_else(|_| format!("Input Device {}", idx + 1));
                (name, device)
            })
            .collect();
        if devices.is_empty() {
            return Err(AurigaError::NoDefaultInputDevice);
        }

        let default_name = host.default_input_device().and_then(|d| d.name().ok());
        let selected_idx = preferred_device_name
            .and_then(|preferred| {
                let found = devices.iter().position(|(name, _)| name == preferred);
                if found.is_none() {
                    warn!(preferred, "preferred input device not found, falling back");
                }
                found
            })
            .or_else(|| {
                default_name
                    .as_deref()
                    .and_then(|name| devices.iter().position(|(n, _)| n == name))
            })
            .unwrap_or(0);

        let (selected_name, device) = devices.swap_remove(selected_idx);
        info!(device = %selected_name, "opening input device");

        let supported = device
            .default_input_config()
            .map_err(|e| AurigaError::AudioDevice(e.to_string()))?;
        let sample_rate = supported.sample_rate().0;
        let channels = supported.channels();
        info!(sample_rate, channels, "audio config selected");

        let config = StreamConfig {
            channels,
            sample_rate: SampleRate(sample_rate),
            buffer_size: cpal::BufferSize::Default,
        };

        let running_cb = Arc::clone(&running);
        let failed = Arc::new(AtomicBool::new(false));
        let failed_f32 = Arc::clone(&failed);
        let failed_i16 = Arc::clone(&failed);
        let failed_u8 = Arc::clone(&failed);
        let ch = channels as usize;
        let mut mix_buf: Vec<f32> = Vec::new();

        let stream = match supported.sample_format() {
            SampleFormat::F32 => device.build_input_stream(
                &config,
                move |data: &[f32], _info| {
                    if !running_cb.load(Ordering::Relaxed) {
                        return;
                    }
                    push_downmixed(&mut producer, &mut mix_buf, data, ch, |s| s);
                },
                move |err| {
                    error!("audio stream error: {err}");
                    failed_f32.store(true, Ordering::Release);
                },
                None,
            ),
            SampleFormat::I16 => device.build_input_stream(
                &config,
                move |data: &[i16], _info| {
                    if !running_cb.load(Ordering::Relaxed) {
                        return;
                    }
                    push_downmixed(&mut producer, &mut mix_buf, data, ch, |s| {
                        s as f32 / 32768.0
                    });
                },
                move |err| {
                    error!("audio stream error: {err}");
                    failed_i16.store(true, Ordering::Release);
                },
                None,
            ),
            SampleFormat::U8 => device.build_input_stream(
                &config,
                move |data: &[u8], _info| {
                    if !running_cb.load(Ordering::Relaxed) {
                        return;
                    }
                    push_downmixed(&mut producer, &mut mix_buf, data, ch, |s| {
                        (s as f32 - 128.0) / 128.0
                    });
                },
                move |err| {
                    error!("audio stream error: {err}");
                    failed_u8.store(true, Ordering::Release);
                },
                None,
            ),
            fmt => {
                return Err(AurigaError::AudioStream(format!(
                    "unsupported sample format: {fmt:?}"
                )))
            }
        }
        .map_err(|e| AurigaError::AudioStream(e.to_string()))?;

        stream
            .play()
            .map_err(|e| AurigaError::AudioStream(e.to_string()))?;

        Ok(Self {
            _stream: stream,
            running,
            failed,
            sample_rate,
        })
    }

    /// Signal the callback to no-op on its next invocation.
    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
    }

    /// `true` once the stream reported an unrecoverable error.
    pub fn has_failed(&self) -> bool {
        self.failed.load(Ordering::Acquire)
    }
}

/// Downmix interleaved frames to mono and push into the ring. Reuses
/// `mix_buf` so the callback stays allocation-free after warm-up.
#[cfg(feature = "audio-cpal")]
fn push_downmixed<T: Copy>(
    producer: &mut AudioProducer,
    mix_buf: &mut Vec<f32>,
    data: &[T],
    channels: usize,
    to_f32: impl Fn(T) -> f32,
) {
    let frames = data.len() / channels.max(1);
    mix_buf.resize(frames, 0.0);
    for f in 0..frames {
        let base = f * channels;
        let mut sum = 0f32;
        for c in 0..channels {
            sum += to_f32(data[base + c]);
        }
        mix_buf[f] = sum / channels as f32;
    }
    let written = producer.push_slice(mix_buf);
    if written < mix_buf.len() {
        warn!("ring buffer full: dropped {} frames", mix_buf.len() - written);
    }
}

/// Stub when the `audio-cpal` feature is disabled.
#[cfg(not(feature = "audio-cpal"))]
impl AudioCapture {
    pub fn open(
        _producer: AudioProducer,
        running: Arc<AtomicBool>,
        _preferred_device_name: Option<&str>,
    ) -> Result<Self> {
        let _ = running;
        Err(AurigaError::AudioStream(
            "compiled without audio-cpal feature".into(),
        ))
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
    }

    pub fn has_failed(&self) -> bool {
        self.failed.load(Ordering::Acquire)
    }
}
