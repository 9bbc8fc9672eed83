//! Capture audio into pipeline frames.
//!
//! The device callback delivers mono f32 at whatever rate the OS picked;
//! the bus wants fixed-size 16 kHz i16 frames. [`FrameConverter`] owns
//! that whole hop on the capture worker thread: rubato resampling when the
//! rates differ, clamped i16 quantization, and reframing to the configured
//! chunk size. When capture rate and target rate already match, no rubato
//! session is created and input flows straight into the framer.

use rubato::{FastFixedIn, PolynomialDegree, Resampler};
use tracing::error;

use crate::error::{AurigaError, Result};

/// Input samples rubato consumes per process call. 20 ms at 48 kHz.
const RESAMPLE_CHUNK: usize = 960;

pub struct FrameConverter {
    /// `None` when capture rate == target rate.
    resampler: Option<FastFixedIn<f32>>,
    /// Capture-rate samples waiting for a full rubato chunk.
    staging: Vec<f32>,
    /// Pre-allocated rubato output buffer, `[1][output_frames_max]`.
    resampled: Vec<Vec<f32>>,
    /// Target-rate i16 samples waiting to fill a frame.
    pending: Vec<i16>,
    frame_size: usize,
}

impl FrameConverter {
    /// # Errors
    /// `AurigaError::AudioDevice` when rubato refuses the rate ratio.
    pub fn new(capture_rate: u32, target_rate: u32, frame_size: usize) -> Result<Self> {
        let frame_size = frame_size.max(1);
        if capture_rate == target_rate {
            return Ok(Self {
                resampler: None,
                staging: Vec::new(),
                resampled: Vec::new(),
                pending: Vec::new(),
                frame_size,
            });
        }

        let ratio = target_rate as f64 / capture_rate as f64;
        let resampler = FastFixedIn::<f32>::new(
            ratio,
            1.0, // fixed ratio
            PolynomialDegree::Cubic,
            RESAMPLE_CHUNK,
            1, // mono
        )
        .map_err(|e| AurigaError::AudioDevice(format!("resampler init: {e}")))?;

        let resampled = vec![vec![0f32; resampler.output_frames_max()]; 1];
        tracing::info!(capture_rate, target_rate, frame_size, "capture resampling enabled");

        Ok(Self {
            resampler: Some(resampler),
            staging: Vec::new(),
            resampled,
            pending: Vec::new(),
            frame_size,
        })
    }

    pub fn is_passthrough(&self) -> bool {
        self.resampler.is_none()
    }

    /// Target-rate samples held back waiting for a full frame.
    pub fn pending_samples(&self) -> usize {
        self.pending.len()
    }

    /// Feed capture samples; returns every completed frame, oldest first.
    /// Short pushes return nothing until enough audio has accumulated.
    pub fn push(&mut self, samples: &[f32]) -> Vec<Vec<i16>> {
        match self.resampler.as_mut() {
            None => quantize_into(&mut self.pending, samples),
            Some(resampler) => {
                self.staging.extend_from_slice(samples);
                while self.staging.len() >= RESAMPLE_CHUNK {
                    let chunk = &self.staging[..RESAMPLE_CHUNK];
                    match resampler.process_into_buffer(&[chunk], &mut self.resampled, None) {
                        Ok((_consumed, produced)) => {
                            quantize_into(&mut self.pending, &self.resampled[0][..produced]);
                        }
                        Err(e) => error!("resampler process error: {e}"),
                    }
                    self.staging.drain(..RESAMPLE_CHUNK);
                }
            }
        }

        let mut frames = Vec::new();
        while self.pending.len() >= self.frame_size {
            frames.push(self.pending.drain(..self.frame_size).collect());
        }
        frames
    }
}

fn quantize_into(pending: &mut Vec<i16>, samples: &[f32]) {
    pending.extend(
        samples
            .iter()
            .map(|s| (s.clamp(-1.0, 1.0) * 32767.0) as i16),
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn passthrough_emits_full_frames_and_holds_the_remainder() {
        let mut fc = FrameConverter::new(16_000, 16_000, 480).unwrap();
        assert!(fc.is_passthrough());

        let frames = fc.push(&vec![0.1f32; 700]);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].len(), 480);
        assert_eq!(fc.pending_samples(), 220);

        // The held-back tail completes the next frame.
        let frames = fc.push(&vec![0.1f32; 300]);
        assert_eq!(frames.len(), 1);
        assert_eq!(fc.pending_samples(), 40);
    }

    #[test]
    fn quantization_clamps_out_of_range_samples() {
        let mut fc = FrameConverter::new(16_000, 16_000, 4).unwrap();
        let frames = fc.push(&[2.0, -2.0, 0.5, 0.0]);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0], vec![32_767, -32_767, 16_383, 0]);
    }

    #[test]
    fn downsamples_48k_to_one_third_as_many_samples() {
        let mut fc = FrameConverter::new(48_000, 16_000, 320).unwrap();
        assert!(!fc.is_passthrough());

        let frames = fc.push(&vec![0.0f32; 960]);
        let produced = frames.len() * 320 + fc.pending_samples();
        assert!(
            (produced as isize - 320).unsigned_abs() <= 10,
            "produced {produced} target-rate samples"
        );
    }

    #[test]
    fn partial_chunks_accumulate_across_pushes() {
        let mut fc = FrameConverter::new(48_000, 16_000, 160).unwrap();
        assert!(fc.push(&vec![0.0f32; 500]).is_empty());
        assert_eq!(fc.pending_samples(), 0);
        // 1000 staged samples ≥ one rubato chunk: output appears.
        let frames = fc.push(&vec![0.0f32; 500]);
        assert!(frames.len() * 160 + fc.pending_samples() > 0);
    }
}
