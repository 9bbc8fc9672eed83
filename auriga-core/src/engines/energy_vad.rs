//! Energy-based segmenting VAD.
//!
//! ## Algorithm
//!
//! 1. Mean-absolute level of each fixed-size frame against a threshold.
//! 2. Rising edge opens a segment, prepending the pre-speech buffer so the
//!    first syllable is not clipped.
//! 3. The segment closes only after `vad_end_silence_ms` of trailing
//!    silence; brief pauses inside an utterance do not split it.
//! 4. Segments shorter than `min_speech_duration_ms` or quieter than
//!    `min_volume_threshold` are dropped before the end edge is reported.
//! 5. After a wake-word hit, frames inside `wakeword_delay_ms` are
//!    reported as silence so the wake phrase cannot trigger speech.

use std::collections::VecDeque;

use tracing::debug;

use super::{VadEngine, VadFrameOutcome, VadSegmentEdge};
use crate::config::VadConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Speaking,
}

pub struct SegmentingVad {
    config: VadConfig,
    phase: Phase,
    /// Frames of the open segment (includes trailing silence until close).
    segment: Vec<i16>,
    /// Rolling audio kept from before speech onset.
    pre_speech: VecDeque<Vec<i16>>,
    silence_streak: u32,
    /// Post-wake suppression countdown, in frames.
    wake_delay_remaining: u32,
    frames_seen: u64,
}

impl SegmentingVad {
    pub fn new(config: VadConfig) -> Self {
        Self {
            config,
            phase: Phase::Idle,
            segment: Vec::new(),
            pre_speech: VecDeque::new(),
            silence_streak: 0,
            wake_delay_remaining: 0,
            frames_seen: 0,
        }
    }

    fn mean_level(frame: &[i16]) -> f32 {
        if frame.is_empty() {
            return 0.0;
        }
        let sum: f64 = frame.iter().map(|s| (*s as f64 / 32768.0).abs()).sum();
        (sum / frame.len() as f64) as f32
    }

    fn frame_ms(&self) -> u32 {
        self.config.frame_duration_ms
    }

    fn close_segment(&mut self) -> VadFrameOutcome {
        let segment = std::mem::take(&mut self.segment);
        self.phase = Phase::Idle;
        self.silence_streak = 0;

        let frame_size = self.config.frame_size().max(1);
        let duration_ms = (segment.len() / frame_size) as u32 * self.frame_ms();
        let level = Self::mean_level(&segment);

        if duration_ms < self.config.min_speech_duration_ms {
            debug!(duration_ms, "speech segment too short, dropped");
            return VadFrameOutcome::default();
        }
        if level < self.config.min_volume_threshold {
            debug!(level, "speech segment too quiet, dropped");
            return VadFrameOutcome::default();
        }

        debug!(
            duration_ms,
            samples = segment.len(),
            "speech segment closed"
        );
        VadFrameOutcome {
            is_speech: false,
            edge: Some(VadSegmentEdge::SpeechEnd),
            audio: Some(segment),
            duration_ms,
        }
    }
}

impl VadEngine for SegmentingVad {
    fn process_frame(&mut self, frame: &[i16]) -> VadFrameOutcome {
        self.frames_seen += 1;

        if self.wake_delay_remaining > 0 {
            self.wake_delay_remaining -= 1;
            return VadFrameOutcome::default();
        }

        let is_speech = Self::mean_level(frame) >= self.config.energy_threshold;

        match self.phase {
            Phase::Idle => {
                if is_speech {
                    self.phase = Phase::Speaking;
                    self.silence_streak = 0;
                    self.segment.clear();
                    for buffered in self.pre_speech.drain(..) {
                        self.segment.extend_from_slice(&buffered);
                    }
                    self.segment.extend_from_slice(frame);
                    debug!(frame = self.frames_seen, "speech onset");
                    VadFrameOutcome {
                        is_speech: true,
                        edge: Some(VadSegmentEdge::SpeechStart),
                        audio: None,
                        duration_ms: 0,
                    }
                } else {
                    if self.pre_speech.len() >= self.config.pre_speech_frames().max(1) {
                        self.pre_speech.pop_front();
                    }
                    self.pre_speech.push_back(frame.to_vec());
                    VadFrameOutcome::default()
                }
            }
            Phase::Speaking => {
                self.segment.extend_from_slice(frame);
                if is_speech {
                    self.silence_streak = 0;
                    VadFrameOutcome {
                        is_speech: true,
                        ..VadFrameOutcome::default()
                    }
                } else {
                    self.silence_streak += 1;
                    if self.silence_streak >= self.config.silence_frames() {
                        self.close_segment()
                    } else {
                        VadFrameOutcome::default()
                    }
                }
            }
        }
    }

    fn reset(&mut self) {
        self.phase = Phase::Idle;
        self.segment.clear();
        self.pre_speech.clear();
        self.silence_streak = 0;
        self.wake_delay_remaining = 0;
        debug!("vad reset");
    }

    fn on_wakeword_detected(&mut self) {
        self.wake_delay_remaining = self.config.wakeword_delay_frames();
        debug!(
            frames = self.wake_delay_remaining,
            "post-wake suppression armed"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> VadConfig {
        VadConfig {
            sample_rate: 16_000,
            frame_duration_ms: 30,
            energy_threshold: 0.02,
            vad_end_silence_ms: 90,  // 3 frames
            pre_speech_buffer_ms: 60, // 2 frames
            min_speech_duration_ms: 90,
            min_volume_threshold: 0.005,
            wakeword_delay_ms: 60, // 2 frames
        }
    }

    fn loud(cfg: &VadConfig) -> Vec<i16> {
        vec![6_000; cfg.frame_size()]
    }

    fn quiet(cfg: &VadConfig) -> Vec<i16> {
        vec![0; cfg.frame_size()]
    }

    /// Feed `n` loud then silence until the segment closes; returns the end
    /// outcome if one fired.
    fn run_segment(vad: &mut SegmentingVad, cfg: &VadConfig, speech_frames: usize) -> Option<VadFrameOutcome> {
        for _ in 0..speech_frames {
            vad.process_frame(&loud(cfg));
        }
        for _ in 0..cfg.silence_frames() + 2 {
            let out = vad.process_frame(&quiet(cfg));
            if out.edge == Some(VadSegmentEdge::SpeechEnd) {
                return Some(out);
            }
        }
        None
    }

    #[test]
    fn mean_level_of_a_half_scale_frame() {
        use approx::assert_abs_diff_eq;
        let frame = vec![16_384i16; 480];
        assert_abs_diff_eq!(SegmentingVad::mean_level(&frame), 0.5, epsilon = 1e-3);
        assert_abs_diff_eq!(SegmentingVad::mean_level(&[]), 0.0);
    }

    #[test]
    fn rising_edge_reports_speech_start() {
        let cfg = test_config();
        let mut vad = SegmentingVad::new(cfg.clone());
        let out = vad.process_frame(&loud(&cfg));
        assert!(out.is_speech);
        assert_eq!(out.edge, Some(VadSegmentEdge::SpeechStart));
    }

    #[test]
    fn segment_closes_after_trailing_silence_with_audio() {
        let cfg = test_config();
        let mut vad = SegmentingVad::new(cfg.clone());
        let end = run_segment(&mut vad, &cfg, 5).expect("segment should close");
        let audio = end.audio.expect("segment audio");
        // 5 speech frames + trailing silence frames are all in the segment.
        assert!(audio.len() >= 5 * cfg.frame_size());
        assert!(end.duration_ms >= 5 * cfg.frame_duration_ms);
    }

    #[test]
    fn short_pause_does_not_split_a_segment() {
        let cfg = test_config();
        let mut vad = SegmentingVad::new(cfg.clone());
        vad.process_frame(&loud(&cfg));
        // One silent frame, below the 3-frame close threshold.
        let out = vad.process_frame(&quiet(&cfg));
        assert!(out.edge.is_none());
        let out = vad.process_frame(&loud(&cfg));
        assert!(out.edge.is_none(), "no second speech_start inside a segment");
    }

    #[test]
    fn minimum_duration_boundary_is_inclusive() {
        let cfg = test_config();

        // Exactly min_speech_duration_ms of speech (3 frames × 30 ms = 90 ms
        // of speech, plus trailing silence counted into the segment): kept.
        let mut vad = SegmentingVad::new(cfg.clone());
        assert!(run_segment(&mut vad, &cfg, 3).is_some());

        // One frame less of speech would still pass because trailing
        // silence counts toward the segment length, so shrink the close
        // window to isolate the boundary.
        let tight = VadConfig {
            vad_end_silence_ms: 30,
            min_speech_duration_ms: 120,
            ..cfg
        };
        let mut vad = SegmentingVad::new(tight.clone());
        // 3 speech + 1 silence = 120 ms segment → accepted.
        assert!(run_segment(&mut vad, &tight, 3).is_some());
        let mut vad = SegmentingVad::new(tight.clone());
        // 2 speech + 1 silence = 90 ms < 120 ms → dropped.
        assert!(run_segment(&mut vad, &tight, 2).is_none());
    }

    #[test]
    fn low_volume_segment_is_dropped() {
        let cfg = VadConfig {
            energy_threshold: 0.0005,
            min_volume_threshold: 0.05,
            ..test_config()
        };
        let mut vad = SegmentingVad::new(cfg.clone());
        for _ in 0..5 {
            vad.process_frame(&vec![40i16; cfg.frame_size()]); // audible to VAD, quiet overall
        }
        let mut got_end = false;
        for _ in 0..cfg.silence_frames() + 2 {
            if vad.process_frame(&quiet(&cfg)).edge == Some(VadSegmentEdge::SpeechEnd) {
                got_end = true;
            }
        }
        assert!(!got_end, "quiet segment must be dropped");
    }

    #[test]
    fn pre_speech_buffer_is_prepended() {
        let cfg = test_config();
        let mut vad = SegmentingVad::new(cfg.clone());
        // Two distinctive silent-ish frames below threshold.
        vad.process_frame(&vec![10i16; cfg.frame_size()]);
        vad.process_frame(&vec![20i16; cfg.frame_size()]);
        let end = run_segment(&mut vad, &cfg, 4).unwrap();
        let audio = end.audio.unwrap();
        assert_eq!(audio[0], 10);
        assert_eq!(audio[cfg.frame_size()], 20);
    }

    #[test]
    fn wake_delay_suppresses_frames() {
        let cfg = test_config();
        let mut vad = SegmentingVad::new(cfg.clone());
        vad.on_wakeword_detected();
        // Two delay frames swallowed even though they are loud.
        assert!(vad.process_frame(&loud(&cfg)).edge.is_none());
        assert!(vad.process_frame(&loud(&cfg)).edge.is_none());
        // Third frame passes through and starts a segment.
        assert_eq!(
            vad.process_frame(&loud(&cfg)).edge,
            Some(VadSegmentEdge::SpeechStart)
        );
    }

    #[test]
    fn reset_discards_open_segment() {
        let cfg = test_config();
        let mut vad = SegmentingVad::new(cfg.clone());
        vad.process_frame(&loud(&cfg));
        vad.reset();
        let mut got_end = false;
        for _ in 0..cfg.silence_frames() + 2 {
            if vad.process_frame(&quiet(&cfg)).edge == Some(VadSegmentEdge::SpeechEnd) {
                got_end = true;
            }
        }
        assert!(!got_end);
    }
}
