//! Offline WSOLA time-stretcher
//!
//! Changes the duration of stereo audio without changing its pitch.
//! Waveform-similarity overlap-add: synthesis frames advance at a fixed
//! hop while the matching analysis frame is searched around the nominal
//! input position for the best waveform continuation, then cross-faded
//! with a Hann window at 50% overlap.
//!
//! Offline only: the mixdown renderer feeds whole element slices through
//! it. A tempo of exactly 1.0 bypasses the algorithm and returns the
//! input untouched.

use crate::types::{Sample, StereoBuffer, StereoSample};

/// Analysis/synthesis frame length in seconds (~40 ms).
const FRAME_SECONDS: f64 = 0.04;

/// Search radius around the nominal analysis position (~10 ms).
const SEARCH_SECONDS: f64 = 0.01;

/// Offline WSOLA time-stretcher for interleaved stereo buffers
pub struct TimeStretcher {
    frame: usize,
    overlap: usize,
    search: usize,
    window: Vec<Sample>,
}

impl TimeStretcher {
    /// Create a stretcher for the given source sample rate.
    pub fn new(sample_rate: u32) -> Self {
        let mut frame = (FRAME_SECONDS * sample_rate as f64).round() as usize;
        if frame % 2 != 0 {
            frame += 1;
        }
        let frame = frame.max(4);
        let search = ((SEARCH_SECONDS * sample_rate as f64).round() as usize).max(1);

        // Hann window; with 50% overlap the windows sum to unity.
        let window = (0..frame)
            .map(|i| {
                let phase = std::f64::consts::PI * i as f64 / frame as f64;
                (phase.sin() * phase.sin()) as Sample
            })
            .collect();

        Self {
            frame,
            overlap: frame / 2,
            search,
            window,
        }
    }

    /// Stretch `input` by `tempo`: output length ≈ input length / tempo.
    ///
    /// tempo > 1 shortens (speeds up), tempo < 1 lengthens. A tempo of
    /// exactly 1.0 returns the input bit-for-bit.
    pub fn process(&self, input: &StereoBuffer, tempo: f64) -> StereoBuffer {
        if tempo == 1.0 || input.is_empty() || tempo <= 0.0 {
            return input.clone();
        }

        let out_len = (input.len() as f64 / tempo).round() as usize;
        if out_len == 0 {
            return StereoBuffer::default();
        }

        // Inputs shorter than one frame cannot be aligned; repeat-sample
        // resampling keeps the duration contract for these tiny slices.
        if input.len() < self.frame {
            let src = input.as_slice();
            let mut out = StereoBuffer::silence(out_len);
            for i in 0..out_len {
                let idx = ((i as f64 * tempo) as usize).min(src.len() - 1);
                out[i] = src[idx];
            }
            return out;
        }

        let src = input.as_slice();
        let hop = self.frame - self.overlap;
        let max_pos = input.len() - self.frame;

        let mut accum = vec![StereoSample::silence(); out_len + self.frame];
        let mut norm = vec![0.0f64; out_len + self.frame];

        let mut prev_pos = 0usize;
        let mut k = 0usize;
        loop {
            let out_pos = k * hop;
            if out_pos >= out_len {
                break;
            }

            let nominal = ((out_pos as f64 * tempo) as usize).min(max_pos);
            let pos = if k == 0 {
                nominal
            } else {
                self.best_alignment(src, nominal, prev_pos + hop, max_pos)
            };

            for i in 0..self.frame {
                let w = self.window[i];
                accum[out_pos + i] += src[pos + i] * w;
                norm[out_pos + i] += w as f64;
            }

            prev_pos = pos;
            k += 1;
        }

        let mut out = StereoBuffer::silence(out_len);
        for i in 0..out_len {
            if norm[i] > 1e-9 {
                out[i] = accum[i] * (1.0 / norm[i] as f32);
            }
        }
        out
    }

    /// Search around `nominal` for the analysis position whose overlap
    /// region best matches the natural continuation at `target`.
    fn best_alignment(
        &self,
        src: &[StereoSample],
        nominal: usize,
        target: usize,
        max_pos: usize,
    ) -> usize {
        if target + self.overlap > src.len() {
            return nominal.min(max_pos);
        }

        let lo = nominal.saturating_sub(self.search);
        let hi = (nominal + self.search).min(max_pos);

        let mut best_pos = nominal.min(max_pos);
        let mut best_score = f64::NEG_INFINITY;
        for pos in lo..=hi {
            let mut dot = 0.0f64;
            let mut e_a = 0.0f64;
            let mut e_b = 0.0f64;
            for i in 0..self.overlap {
                let a = (src[pos + i].left + src[pos + i].right) as f64;
                let b = (src[target + i].left + src[target + i].right) as f64;
                dot += a * b;
                e_a += a * a;
                e_b += b * b;
            }
            let score = dot / (e_a * e_b).sqrt().max(1e-12);
            if score > best_score {
                best_score = score;
                best_pos = pos;
            }
        }
        best_pos
    }
}
