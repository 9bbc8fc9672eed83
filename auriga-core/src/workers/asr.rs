//! ASR worker.
//!
//! Consumes assembled speech segments and runs recognition on a dedicated
//! worker thread — inference may block for hundreds of milliseconds and
//! must never run on the bus thread. At most one recognition is in flight:
//! an in-flight flag guards a bounded(1) job channel, and segments that
//! arrive while busy are dropped with a log line.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, Sender};
use parking_lot::Mutex;
use serde_json::json;
use tracing::{info, warn};

use crate::bus::SystemController;
use crate::engines::AsrEngine;
use crate::error::Result;
use crate::event::{Event, EventPayload, EventType};
use crate::module::Module;
use crate::state::StateEvent;
use crate::trace::MessageTracker;

/// How long `stop()` waits for an in-flight recognition before abandoning
/// the worker thread.
const STOP_GRACE: Duration = Duration::from_secs(5);

/// Idle poll interval of the worker loop.
const RECV_TICK: Duration = Duration::from_millis(100);

struct Job {
    pcm: Arc<Vec<i16>>,
    sample_rate: u32,
    msg_id: Option<String>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AsrStats {
    pub total_recognitions: u64,
    pub successful: u64,
    pub failed: u64,
    pub skipped: u64,
    pub average_latency_ms: f64,
}

pub struct AsrWorker {
    controller: Arc<SystemController>,
    tracker: Arc<MessageTracker>,
    engine: Arc<Mutex<Box<dyn AsrEngine>>>,
    jobs_tx: Sender<Job>,
    jobs_rx: Mutex<Option<Receiver<Job>>>,
    thread: Mutex<Option<std::thread::JoinHandle<()>>>,
    running: Arc<AtomicBool>,
    in_flight: Arc<AtomicBool>,
    total_recognitions: Arc<AtomicU64>,
    successful: Arc<AtomicU64>,
    failed: Arc<AtomicU64>,
    skipped: AtomicU64,
    total_latency_ms: Arc<AtomicU64>,
}

impl AsrWorker {
    pub const NAME: &'static str = "asr";

    pub fn new(
        controller: Arc<SystemController>,
        tracker: Arc<MessageTracker>,
        engine: Box<dyn AsrEngine>,
    ) -> Arc<Self> {
        let (jobs_tx, jobs_rx) = bounded(1);
        Arc::new(Self {
            controller,
            tracker,
            engine: Arc::new(Mutex::new(engine)),
            jobs_tx,
            jobs_rx: Mutex::new(Some(jobs_rx)),
            thread: Mutex::new(None),
            running: Arc::new(AtomicBool::new(false)),
            in_flight: Arc::new(AtomicBool::new(false)),
            total_recognitions: Arc::new(AtomicU64::new(0)),
            successful: Arc::new(AtomicU64::new(0)),
            failed: Arc::new(AtomicU64::new(0)),
            skipped: AtomicU64::new(0),
            total_latency_ms: Arc::new(AtomicU64::new(0)),
        })
    }

    pub fn is_busy(&self) -> bool {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> AsrStats {
        let successful = self.successful.load(Ordering::Relaxed);
        let total_latency = self.total_latency_ms.load(Ordering::Relaxed);
        AsrStats {
            total_recognitions: self.total_recognitions.load(Ordering::Relaxed),
            successful,
            failed: self.failed.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            average_latency_ms: if successful > 0 {
                total_latency as f64 / successful as f64
            } else {
                0.0
            },
        }
    }

    fn enqueue(&self, pcm: Arc<Vec<i16>>, sample_rate: u32, msg_id: Option<String>) {
        // Capacity-1 semaphore: one recognition in flight, no queueing.
        if self.in_flight.swap(true, Ordering::SeqCst) {
            self.skipped.fetch_add(1, Ordering::Relaxed);
            warn!(
                msg_id = msg_id.as_deref().unwrap_or(""),
                "recognition skipped: previous job still in flight"
            );
            return;
        }

        self.total_recognitions.fetch_add(1, Ordering::Relaxed);
        if let Some(id) = &msg_id {
            self.tracker.add_trace(
                id,
                Self::NAME,
                "recognition_start",
                Some(json!({ "samples": pcm.len() })),
                None,
                serde_json::Map::new(),
            );
        }

        self.controller.publish(
            Event::new(
                EventType::AsrRecognitionStart,
                Self::NAME,
                EventPayload::Asr {
                    text: String::new(),
                    confidence: 0.0,
                    latency_ms: 0,
                    is_partial: false,
                },
            )
            .with_msg_id(msg_id.clone()),
        );
        self.controller
            .handle_state_event(StateEvent::RecognitionStart);

        if self
            .jobs_tx
            .try_send(Job {
                pcm,
                sample_rate,
                msg_id,
            })
            .is_err()
        {
            // Worker gone or channel unexpectedly full; release the gate.
            self.in_flight.store(false, Ordering::SeqCst);
            warn!("recognition job could not be queued");
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn worker_loop(
        controller: Arc<SystemController>,
        tracker: Arc<MessageTracker>,
        engine: Arc<Mutex<Box<dyn AsrEngine>>>,
        jobs: Receiver<Job>,
        running: Arc<AtomicBool>,
        in_flight: Arc<AtomicBool>,
        successful: Arc<AtomicU64>,
        failed: Arc<AtomicU64>,
        total_latency_ms: Arc<AtomicU64>,
    ) {
        while running.load(Ordering::SeqCst) {
            let job = match jobs.recv_timeout(RECV_TICK) {
                Ok(job) => job,
                Err(crossbeam_channel::RecvTimeoutError::Timeout) => continue,
                Err(crossbeam_channel::RecvTimeoutError::Disconnected) => break,
            };

            let started = Instant::now();
            let result = engine.lock().recognize(&job.pcm, job.sample_rate);
            let latency_ms = started.elapsed().as_millis() as u32;

            match result {
                Ok(recognition) if !recognition.text.trim().is_empty() => {
                    let text = recognition.text.trim().to_string();
                    successful.fetch_add(1, Ordering::Relaxed);
                    total_latency_ms.fetch_add(latency_ms as u64, Ordering::Relaxed);
                    info!(
                        text = %text,
                        confidence = recognition.confidence,
                        latency_ms,
                        "recognition succeeded"
                    );

                    if let Some(id) = &job.msg_id {
                        tracker.add_trace(
                            id,
                            AsrWorker::NAME,
                            "recognition_success",
                            None,
                            Some(json!({
                                "text": text,
                                "confidence": recognition.confidence,
                                "latency_ms": latency_ms,
                            })),
                            serde_json::Map::new(),
                        );
                        tracker.update_query(id, &text);
                    }

                    controller.publish(
                        Event::new(
                            EventType::AsrRecognitionSuccess,
                            AsrWorker::NAME,
                            EventPayload::Asr {
                                text,
                                confidence: recognition.confidence,
                                latency_ms,
                                is_partial: false,
                            },
                        )
                        .with_msg_id(job.msg_id.clone()),
                    );
                    controller.handle_state_event(StateEvent::RecognitionSuccess);
                }
                Ok(_) | Err(_) => {
                    if let Err(e) = &result {
                        warn!(error = %e, "recognition error");
                    } else {
                        warn!("recognition produced empty text");
                    }
                    failed.fetch_add(1, Ordering::Relaxed);

                    if let Some(id) = &job.msg_id {
                        tracker.add_trace(
                            id,
                            AsrWorker::NAME,
                            "recognition_failed",
                            None,
                            Some(json!({ "latency_ms": latency_ms })),
                            serde_json::Map::new(),
                        );
                    }

                    controller.publish(
                        Event::new(
                            EventType::AsrRecognitionFailed,
                            AsrWorker::NAME,
                            EventPayload::Asr {
                                text: String::new(),
                                confidence: 0.0,
                                latency_ms,
                                is_partial: false,
                            },
                        )
                        .with_msg_id(job.msg_id.clone()),
                    );
                    controller.handle_state_event(StateEvent::RecognitionFailed);
                }
            }

            in_flight.store(false, Ordering::SeqCst);
        }
    }
}

impl Module for AsrWorker {
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
        let Some(jobs) = self.jobs_rx.lock().take() else {
            return Ok(()); // restarted; the original thread still owns the receiver
        };

        let controller = Arc::clone(&self.controller);
        let tracker = Arc::clone(&self.tracker);
        let engine = Arc::clone(&self.engine);
        let running = Arc::clone(&self.running);
        let in_flight = Arc::clone(&self.in_flight);
        let successful = Arc::clone(&self.successful);
        let failed = Arc::clone(&self.failed);
        let total_latency = Arc::clone(&self.total_latency_ms);

        let handle = std::thread::Builder::new()
            .name("auriga-asr".into())
            .spawn(move || {
                Self::worker_loop(
                    controller,
                    tracker,
                    engine,
                    jobs,
                    running,
                    in_flight,
                    successful,
                    failed,
                    total_latency,
                )
            })
            .map_err(|e| crate::error::AurigaError::Engine(e.to_string()))?;
        *self.thread.lock() = Some(handle);
        Ok(())
    }

    fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        // The flag may already be down (SYSTEM_STOP); the join must still
        // happen exactly once.
        if let Some(handle) = self.thread.lock().take() {
            let deadline = Instant::now() + STOP_GRACE;
            while !handle.is_finished() && Instant::now() < deadline {
                std::thread::sleep(Duration::from_millis(20));
            }
            if handle.is_finished() {
                let _ = handle.join();
            } else {
                warn!("asr worker did not finish within the stop grace period, abandoned");
            }
        }
    }

    fn handle_event(&self, event: &Event) {
        if !self.running.load(Ordering::SeqCst) {
            return;
        }
        match (&event.event_type, &event.payload) {
            (
                EventType::VadSpeechEnd,
                EventPayload::Vad {
                    audio: Some(audio), ..
                },
            ) => {
                self.enqueue(Arc::clone(audio), 16_000, event.msg_id.clone());
            }
            (EventType::SystemStop, _) => {
                // Flag only; stop_all() joins once delivery has finished.
                self.running.store(false, Ordering::SeqCst);
            }
            _ => {}
        }
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engines::Recognition;
    use crate::state::{StateConfig, VoiceState};

    /// Recognizer with a configurable delay and scripted text.
    struct SlowAsr {
        delay: Duration,
        text: String,
        fail: bool,
    }

    impl AsrEngine for SlowAsr {
        fn recognize(&mut self, _pcm: &[i16], _sample_rate: u32) -> Result<Recognition> {
            std::thread::sleep(self.delay);
            if self.fail {
                return Err(crate::error::AurigaError::Engine("model error".into()));
            }
            Ok(Recognition {
                text: self.text.clone(),
                confidence: 0.95,
            })
        }
    }

    fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        condition()
    }

    fn speech_end_event(msg_id: Option<&str>) -> Event {
        Event::new(
            EventType::VadSpeechEnd,
            "vad",
            EventPayload::Vad {
                is_speech: false,
                duration_ms: 600,
                audio: Some(Arc::new(vec![500i16; 9600])),
            },
        )
        .with_msg_id(msg_id.map(String::from))
    }

    fn setup(engine: SlowAsr) -> (Arc<SystemController>, Arc<AsrWorker>, Arc<Mutex<Vec<Event>>>) {
        let bus = SystemController::new();
        bus.initialize_all(StateConfig {
            enable_wakeword: false,
            ..StateConfig::default()
        })
        .unwrap();
        let tracker = Arc::new(MessageTracker::new(None));
        let worker = AsrWorker::new(Arc::clone(&bus), tracker, Box::new(engine));
        bus.register(Arc::clone(&worker) as Arc<dyn Module>).unwrap();
        worker.start().unwrap();

        let published = Arc::new(Mutex::new(Vec::new()));
        for event_type in [
            EventType::AsrRecognitionStart,
            EventType::AsrRecognitionSuccess,
            EventType::AsrRecognitionFailed,
        ] {
            let sink = Arc::clone(&published);
            bus.subscribe(event_type, "probe", move |event| {
                sink.lock().push(event.clone());
            });
        }
        (bus, worker, published)
    }

    #[test]
    fn recognition_publishes_success_with_msg_id_and_text() {
        let (bus, worker, published) = setup(SlowAsr {
            delay: Duration::from_millis(10),
            text: "打开空调".into(),
            fail: false,
        });

        bus.publish(speech_end_event(Some("msg_1_deadbeef")));
        assert!(wait_until(Duration::from_secs(2), || {
            published
                .lock()
                .iter()
                .any(|e| e.event_type == EventType::AsrRecognitionSuccess)
        }));

        let events = published.lock().clone();
        let success = events
            .iter()
            .find(|e| e.event_type == EventType::AsrRecognitionSuccess)
            .unwrap();
        assert_eq!(success.msg_id.as_deref(), Some("msg_1_deadbeef"));
        match &success.payload {
            EventPayload::Asr { text, is_partial, .. } => {
                assert_eq!(text, "打开空调");
                assert!(!is_partial);
            }
            other => panic!("unexpected payload: {other:?}"),
        }
        assert_eq!(worker.stats().total_recognitions, 1);
        assert_eq!(worker.stats().successful, 1);
        worker.stop();
    }

    #[test]
    fn second_segment_while_busy_is_skipped() {
        let (bus, worker, published) = setup(SlowAsr {
            delay: Duration::from_millis(300),
            text: "first".into(),
            fail: false,
        });

        bus.publish(speech_end_event(Some("msg_1_aaaaaaaa")));
        assert!(wait_until(Duration::from_millis(200), || worker.is_busy()));
        bus.publish(speech_end_event(Some("msg_2_bbbbbbbb")));

        assert!(wait_until(Duration::from_secs(2), || !worker.is_busy()));
        // Give a wrongly-accepted second job time to surface.
        std::thread::sleep(Duration::from_millis(100));

        let stats = worker.stats();
        assert_eq!(stats.total_recognitions, 1);
        assert_eq!(stats.skipped, 1);
        let successes = published
            .lock()
            .iter()
            .filter(|e| e.event_type == EventType::AsrRecognitionSuccess)
            .count();
        assert_eq!(successes, 1);
        worker.stop();
    }

    #[test]
    fn failed_recognition_publishes_failure_and_returns_to_idle() {
        let (bus, worker, published) = setup(SlowAsr {
            delay: Duration::from_millis(10),
            text: String::new(),
            fail: true,
        });

        bus.publish(speech_end_event(None));
        assert!(wait_until(Duration::from_secs(2), || {
            published
                .lock()
                .iter()
                .any(|e| e.event_type == EventType::AsrRecognitionFailed)
        }));
        assert!(wait_until(Duration::from_secs(1), || {
            bus.current_state() == Some(VoiceState::Idle)
        }));
        assert_eq!(worker.stats().failed, 1);
        worker.stop();
    }

    #[test]
    fn recognition_start_is_announced_before_the_result() {
        let (bus, worker, published) = setup(SlowAsr {
            delay: Duration::from_millis(20),
            text: "hello".into(),
            fail: false,
        });

        bus.publish(speech_end_event(None));
        assert!(wait_until(Duration::from_secs(2), || {
            published.lock().len() >= 2
        }));
        let events = published.lock().clone();
        assert_eq!(events[0].event_type, EventType::AsrRecognitionStart);
        assert_eq!(events[1].event_type, EventType::AsrRecognitionSuccess);
        worker.stop();
    }
}
