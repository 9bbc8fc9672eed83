//! TTS worker.
//!
//! Consumes `TTS_SPEAK_REQUEST` events, debounces exact-duplicate text
//! inside a one-second window, and plays through the engine on a dedicated
//! playback thread, announcing `TTS_SPEAK_START` / `_END` / `_ERROR`.
//! Evaluation mode (`enabled = false`) mutes playback without touching the
//! rest of the pipeline.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::bus::SystemController;
use crate::config::TtsConfig;
use crate::engines::TtsEngine;
use crate::error::Result;
use crate::event::{Event, EventPayload, EventType};
use crate::module::Module;

const RECV_TICK: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, Default)]
pub struct TtsStats {
    pub requests: u64,
    pub spoken: u64,
    pub deduplicated: u64,
    pub muted: u64,
}

pub struct TtsWorker {
    controller: Arc<SystemController>,
    config: TtsConfig,
    engine: Arc<Mutex<Box<dyn TtsEngine>>>,
    queue_tx: Sender<String>,
    queue_rx: Mutex<Option<Receiver<String>>>,
    thread: Mutex<Option<std::thread::JoinHandle<()>>>,
    running: Arc<AtomicBool>,
    /// Debounce memory: last accepted text and when.
    last_request: Mutex<Option<(String, Instant)>>,
    requests: AtomicU64,
    spoken: Arc<AtomicU64>,
    deduplicated: AtomicU64,
    muted: AtomicU64,
}

impl TtsWorker {
    pub const NAME: &'static str = "tts";

    pub fn new(
        controller: Arc<SystemController>,
        config: TtsConfig,
        engine: Box<dyn TtsEngine>,
    ) -> Arc<Self> {
        let (queue_tx, queue_rx) = unbounded();
        Arc::new(Self {
            controller,
            config,
            engine: Arc::new(Mutex::new(engine)),
            queue_tx,
            queue_rx: Mutex::new(Some(queue_rx)),
            thread: Mutex::new(None),
            running: Arc::new(AtomicBool::new(false)),
            last_request: Mutex::new(None),
            requests: AtomicU64::new(0),
            spoken: Arc::new(AtomicU64::new(0)),
            deduplicated: AtomicU64::new(0),
            muted: AtomicU64::new(0),
        })
    }

    pub fn stats(&self) -> TtsStats {
        TtsStats {
            requests: self.requests.load(Ordering::Relaxed),
            spoken: self.spoken.load(Ordering::Relaxed),
            deduplicated: self.deduplicated.load(Ordering::Relaxed),
            muted: self.muted.load(Ordering::Relaxed),
        }
    }

    fn on_request(&self, text: &str) {
        if text.is_empty() {
            return;
        }
        self.requests.fetch_add(1, Ordering::Relaxed);

        if !self.config.enabled {
            self.muted.fetch_add(1, Ordering::Relaxed);
            debug!("tts muted, request dropped");
            return;
        }

        // Exact-text debounce inside the configured window.
        {
            let mut last = self.last_request.lock();
            let window = Duration::from_millis(self.config.dedup_window_ms);
            if let Some((last_text, at)) = last.as_ref() {
                if last_text == text && at.elapsed() < window {
                    self.deduplicated.fetch_add(1, Ordering::Relaxed);
                    debug!(text, "duplicate tts request debounced");
                    return;
                }
            }
            *last = Some((text.to_string(), Instant::now()));
        }

        if self.queue_tx.send(text.to_string()).is_err() {
            warn!("tts playback queue is gone, request dropped");
        }
    }

    fn playback_loop(
        controller: Arc<SystemController>,
        engine: Arc<Mutex<Box<dyn TtsEngine>>>,
        queue: Receiver<String>,
        running: Arc<AtomicBool>,
        spoken: Arc<AtomicU64>,
    ) {
        while running.load(Ordering::SeqCst) {
            let text = match queue.recv_timeout(RECV_TICK) {
                Ok(text) => text,
                Err(crossbeam_channel::RecvTimeoutError::Timeout) => continue,
                Err(crossbeam_channel::RecvTimeoutError::Disconnected) => break,
            };

            controller.publish(Event::new(
                EventType::TtsSpeakStart,
                TtsWorker::NAME,
                EventPayload::TtsStatus {
                    text: text.clone(),
                    error: None,
                },
            ));
            info!(text = %text, "tts speaking");

            let result = engine.lock().speak(&text);
            match result {
                Ok(()) => {
                    spoken.fetch_add(1, Ordering::Relaxed);
                    controller.publish(Event::new(
                        EventType::TtsSpeakEnd,
                        TtsWorker::NAME,
                        EventPayload::TtsStatus { text, error: None },
                    ));
                }
                Err(e) => {
                    warn!(error = %e, "tts playback failed");
                    controller.publish(Event::new(
                        EventType::TtsSpeakError,
                        TtsWorker::NAME,
                        EventPayload::TtsStatus {
                            text,
                            error: Some(e.to_string()),
                        },
                    ));
                }
            }
        }
    }
}

impl Module for TtsWorker {
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
        let Some(queue) = self.queue_rx.lock().take() else {
            return Ok(());
        };

        let controller = Arc::clone(&self.controller);
        let engine = Arc::clone(&self.engine);
        let running = Arc::clone(&self.running);
        let spoken = Arc::clone(&self.spoken);

        let handle = std::thread::Builder::new()
            .name("auriga-tts".into())
            .spawn(move || Self::playback_loop(controller, engine, queue, running, spoken))
            .map_err(|e| crate::error::AurigaError::Engine(e.to_string()))?;
        *self.thread.lock() = Some(handle);
        Ok(())
    }

    fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        // The flag may already be down (SYSTEM_STOP); the join must still
        // happen exactly once.
        if let Some(handle) = self.thread.lock().take() {
            if handle.join().is_err() {
                warn!("tts playback thread panicked during shutdown");
            }
        }
    }

    fn handle_event(&self, event: &Event) {
        if !self.running.load(Ordering::SeqCst) {
            return;
        }
        match (&event.event_type, &event.payload) {
            (EventType::TtsSpeakRequest, EventPayload::TtsRequest { text, .. }) => {
                self.on_request(text);
            }
            (EventType::SystemStop, _) => {
                // Flag only; stop_all() joins after delivery completes.
                self.running.store(false, Ordering::SeqCst);
            }
            _ => {}
        }
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}
