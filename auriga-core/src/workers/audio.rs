//! Audio capture worker.
//!
//! Owns the microphone: opens the configured device, resamples to the
//! pipeline rate and publishes fixed-size `AUDIO_FRAME_READY` events. The
//! cpal stream is created *inside* the capture thread because it is
//! `!Send`; `start()` blocks until the device is confirmed open so a
//! missing microphone fails startup instead of dying silently later.
//!
//! The capture loop also ticks the bus timeout check every ten published
//! frames — the wake deadline is polled, not timer-driven.

use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc,
};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{error, info, warn};

use crate::audio::{frames::FrameConverter, AudioCapture};
use crate::buffering::{create_audio_ring, Consumer};
use crate::bus::SystemController;
use crate::config::AudioConfig;
use crate::error::Result;
use crate::event::{Event, EventPayload, EventType};
use crate::module::Module;

/// Samples drained from the ring per loop iteration.
const DRAIN_CHUNK: usize = 960;

/// Sleep when the ring is empty (avoids busy-waiting a core).
const EMPTY_SLEEP_MS: u64 = 5;

/// Timeout tick cadence, in published frames.
const TIMEOUT_CHECK_INTERVAL: u64 = 10;

pub struct AudioWorker {
    controller: Arc<SystemController>,
    config: AudioConfig,
    running: Arc<AtomicBool>,
    thread: Mutex<Option<std::thread::JoinHandle<()>>>,
    frames_published: Arc<AtomicU64>,
}

impl AudioWorker {
    pub const NAME: &'static str = "audio";

    pub fn new(controller: Arc<SystemController>, config: AudioConfig) -> Arc<Self> {
        Arc::new(Self {
            controller,
            config,
            running: Arc::new(AtomicBool::new(false)),
            thread: Mutex::new(None),
            frames_published: Arc::new(AtomicU64::new(0)),
        })
    }

    pub fn frames_published(&self) -> u64 {
        self.frames_published.load(Ordering::Relaxed)
    }

    fn capture_loop(
        controller: Arc<SystemController>,
        config: AudioConfig,
        running: Arc<AtomicBool>,
        frames_published: Arc<AtomicU64>,
        open_tx: std::sync::mpsc::Sender<Result<u32>>,
    ) {
        let (producer, mut consumer) = create_audio_ring();

        // Device open must happen on this thread — cpal::Stream is !Send.
        let capture = match AudioCapture::open(
            producer,
            Arc::clone(&running),
            config.device_name.as_deref(),
        ) {
            Ok(capture) => {
                let _ = open_tx.send(Ok(capture.sample_rate));
                capture
            }
            Err(e) => {
                let _ = open_tx.send(Err(e));
                running.store(false, Ordering::SeqCst);
                return;
            }
        };

        let mut converter =
            match FrameConverter::new(capture.sample_rate, config.sample_rate, config.chunk_size) {
                Ok(fc) => fc,
                Err(e) => {
                    error!(error = %e, "frame converter init failed, capture aborted");
                    controller.publish(Event::new(
                        EventType::AudioDeviceChanged,
                        AudioWorker::NAME,
                        EventPayload::ModuleError {
                            module: AudioWorker::NAME.into(),
                            message: e.to_string(),
                        },
                    ));
                    running.store(false, Ordering::SeqCst);
                    return;
                }
            };

        let mut raw = vec![0f32; DRAIN_CHUNK];

        info!("audio capture loop started");
        while running.load(Ordering::Relaxed) {
            if capture.has_failed() {
                error!("audio device lost, capture stopping");
                controller.publish(Event::new(
                    EventType::AudioDeviceChanged,
                    AudioWorker::NAME,
                    EventPayload::ModuleError {
                        module: AudioWorker::NAME.into(),
                        message: "audio device lost".into(),
                    },
                ));
                running.store(false, Ordering::SeqCst);
                break;
            }

            let n = consumer.pop_slice(&mut raw);
            if n == 0 {
                std::thread::sleep(Duration::from_millis(EMPTY_SLEEP_MS));
                continue;
            }

            for frame in converter.push(&raw[..n]) {
                controller.publish(Event::new(
                    EventType::AudioFrameReady,
                    AudioWorker::NAME,
                    EventPayload::AudioFrame {
                        pcm: Arc::new(frame),
                        sample_rate: config.sample_rate,
                        channels: config.channels,
                    },
                ));
                let published = frames_published.fetch_add(1, Ordering::Relaxed) + 1;
                if published % TIMEOUT_CHECK_INTERVAL == 0 {
                    controller.check_timeout();
                }
            }
        }

        // Stream drops here, releasing the device on this thread.
        drop(capture);
        info!("audio capture loop stopped");
    }
}

impl Module for AudioWorker {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn initialize(&self) -> Result<()> {
        Ok(())
    }

    fn start(&self) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.frames_published.store(0, Ordering::Relaxed);

        let (open_tx, open_rx) = std::sync::mpsc::channel::<Result<u32>>();
        let controller = Arc::clone(&self.controller);
        let config = self.config.clone();
        let running = Arc::clone(&self.running);
        let frames = Arc::clone(&self.frames_published);

        let handle = std::thread::Builder::new()
            .name("auriga-audio".into())
            .spawn(move || Self::capture_loop(controller, config, running, frames, open_tx))
            .map_err(|e| crate::error::AurigaError::AudioStream(e.to_string()))?;
        *self.thread.lock() = Some(handle);

        // Block until the device is confirmed open (or failed).
        match open_rx.recv() {
            Ok(Ok(rate)) => {
                info!(capture_rate = rate, "audio capture started");
                Ok(())
            }
            Ok(Err(e)) => {
                self.running.store(false, Ordering::SeqCst);
                Err(e)
            }
            Err(_) => {
                self.running.store(false, Ordering::SeqCst);
                Err(crate::error::AurigaError::AudioStream(
                    "capture thread died before opening the device".into(),
                ))
            }
        }
    }

    fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        // The flag may already be down (SYSTEM_STOP); the join must still
        // happen exactly once.
        if let Some(handle) = self.thread.lock().take() {
            if handle.join().is_err() {
                warn!("audio capture thread panicked during shutdown");
            }
        }
    }

    fn handle_event(&self, event: &Event) {
        if event.event_type == EventType::SystemStop {
            // Flag only — joining here would deadlock against a capture
            // thread that is itself publishing. stop_all() joins after
            // this event has finished fanning out.
            self.running.store(false, Ordering::SeqCst);
        }
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}
