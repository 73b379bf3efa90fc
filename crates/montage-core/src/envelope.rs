//! Envelope engine
//!
//! Composes a source signal's timeline into a mono buffer, runs it through
//! RMS detection and the compressor curve, and produces the 200 Hz linear
//! gain envelope the sidechain manager caches and the scheduler samples.

use std::sync::Arc;

use crate::dsp::{compressor_gains, rms_envelope, CompressorParams};
use crate::media::AudioData;
use crate::types::{Sample, ENVELOPE_RATE};

/// Precomputed gain-reduction envelope
///
/// `gain_values.len()` is always `ceil(duration * sample_rate)`; every value
/// lies in [0, 1]. Lookups outside the envelope's lifetime are unity.
#[derive(Debug, Clone, PartialEq)]
pub struct SidechainEnvelope {
    pub sample_rate: u32,
    pub gain_values: Vec<Sample>,
    pub duration: f64,
}

impl SidechainEnvelope {
    /// An all-unity envelope of the given duration.
    pub fn unity(duration: f64) -> Self {
        let len = (duration * ENVELOPE_RATE as f64).ceil() as usize;
        Self {
            sample_rate: ENVELOPE_RATE,
            gain_values: vec![1.0; len],
            duration,
        }
    }

    /// Linear gain at timeline time `t`.
    ///
    /// Outside [0, duration) the source is not ducking anything, so the
    /// gain is 1. In range, linear interpolation between adjacent samples.
    pub fn gain_at(&self, t: f64) -> Sample {
        if t < 0.0 || t >= self.duration || self.gain_values.is_empty() {
            return 1.0;
        }
        let pos = t * self.sample_rate as f64;
        let i0 = pos.floor() as usize;
        if i0 >= self.gain_values.len() {
            return 1.0;
        }
        let i1 = (i0 + 1).min(self.gain_values.len() - 1);
        let frac = (pos - i0 as f64) as Sample;
        self.gain_values[i0] * (1.0 - frac) + self.gain_values[i1] * frac
    }
}

/// One source element feeding an envelope computation
///
/// A flattened view of an audio clip or an expanded one-shot trigger:
/// decoded PCM plus its placement on the timeline.
#[derive(Clone)]
pub struct SourceElement {
    pub buffer: Arc<AudioData>,
    /// Timeline second where the element starts sounding
    pub start_time: f64,
    /// Offset into the source media in seconds
    pub trim_start: f64,
    /// Length of the source slice in seconds
    pub duration: f64,
    /// Repeat the slice until the end of the timeline
    pub looped: bool,
}

/// Compose the source elements into a mono timeline buffer.
///
/// The first element's native rate is the reference rate; other elements
/// are resampled nearest-neighbor onto it. Overlapping elements sum.
fn compose_timeline(elements: &[SourceElement], timeline_duration: f64) -> (Vec<Sample>, u32) {
    let target_rate = elements[0].buffer.sample_rate;
    let out_len = (timeline_duration * target_rate as f64).ceil() as usize;
    let mut out = vec![0.0f32; out_len];

    for element in elements {
        let rate = element.buffer.sample_rate;
        if rate == 0 {
            continue;
        }
        let mono = element.buffer.to_mono();

        let source_start = (element.trim_start * rate as f64).floor() as usize;
        if source_start >= mono.len() {
            continue;
        }
        let source_len = ((element.duration * rate as f64).floor() as usize)
            .min(mono.len() - source_start);
        let ratio = target_rate as f64 / rate as f64;
        let resampled_len = (source_len as f64 * ratio).floor() as usize;
        if resampled_len == 0 {
            continue;
        }

        let out_start = (element.start_time * target_rate as f64).floor() as usize;
        if out_start >= out_len {
            continue;
        }
        let max_out = if element.looped {
            out_len - out_start
        } else {
            resampled_len.min(out_len - out_start)
        };

        for i in 0..max_out {
            let src_offset = if element.looped { i % resampled_len } else { i };
            let src_idx = source_start + (src_offset as f64 / ratio) as usize;
            if let Some(&s) = mono.get(src_idx) {
                out[out_start + i] += s;
            }
        }
    }

    (out, target_rate)
}

/// Compute a gain envelope for the given source elements.
///
/// With no elements there is nothing to duck against and the envelope is
/// all ones.
pub fn compute_envelope(
    elements: &[SourceElement],
    timeline_duration: f64,
    params: &CompressorParams,
) -> SidechainEnvelope {
    let env_len = (timeline_duration * ENVELOPE_RATE as f64).ceil() as usize;
    if elements.is_empty() || env_len == 0 {
        return SidechainEnvelope::unity(timeline_duration);
    }

    let (composed, target_rate) = compose_timeline(elements, timeline_duration);

    let mut rms = rms_envelope(&composed, target_rate, ENVELOPE_RATE);
    rms.resize(env_len, 0.0);

    let gain_values = compressor_gains(&rms, params, ENVELOPE_RATE);

    SidechainEnvelope {
        sample_rate: ENVELOPE_RATE,
        gain_values,
        duration: timeline_duration,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn square_burst(seconds: f64, rate: u32) -> Arc<AudioData> {
        let n = (seconds * rate as f64) as usize;
        let samples: Vec<f32> = (0..n)
            .map(|i| if (i / 50) % 2 == 0 { 1.0 } else { -1.0 })
            .collect();
        Arc::new(AudioData::from_mono(samples, rate))
    }

    fn duck_params() -> CompressorParams {
        CompressorParams {
            threshold_db: -20.0,
            ratio: 4.0,
            attack: 0.01,
            release: 0.2,
            depth_db: -24.0,
        }
    }

    #[test]
    fn test_envelope_length_invariant() {
        let elements = vec![SourceElement {
            buffer: square_burst(1.0, 44_100),
            start_time: 0.0,
            trim_start: 0.0,
            duration: 1.0,
            looped: false,
        }];
        for &duration in &[0.7, 1.0, 2.35, 10.0] {
            let env = compute_envelope(&elements, duration, &duck_params());
            assert_eq!(
                env.gain_values.len(),
                (duration * 200.0).ceil() as usize,
                "length invariant at duration {}",
                duration
            );
            assert!(env.gain_values.iter().all(|&g| (0.0..=1.0).contains(&g)));
        }
    }

    #[test]
    fn test_empty_elements_unity() {
        let env = compute_envelope(&[], 3.0, &duck_params());
        assert_eq!(env.gain_values.len(), 600);
        assert!(env.gain_values.iter().all(|&g| g == 1.0));
    }

    #[test]
    fn test_active_source_ducks() {
        let elements = vec![SourceElement {
            buffer: square_burst(1.0, 44_100),
            start_time: 0.0,
            trim_start: 0.0,
            duration: 1.0,
            looped: false,
        }];
        let env = compute_envelope(&elements, 1.0, &duck_params());

        // After settling (> 10 * attack), 0 dB over a -20 dB threshold at
        // ratio 4 reduces by 15 dB: gain ~= 0.178.
        let settled = env.gain_at(0.9);
        let expected = 10f32.powf(-15.0 / 20.0);
        assert!(
            (settled - expected).abs() < 0.01,
            "steady-state gain {} vs expected {}",
            settled,
            expected
        );
    }

    #[test]
    fn test_lookup_outside_range_is_unity() {
        let env = SidechainEnvelope {
            sample_rate: 200,
            gain_values: vec![0.5; 200],
            duration: 1.0,
        };
        assert_eq!(env.gain_at(-0.1), 1.0);
        assert_eq!(env.gain_at(1.0), 1.0);
        assert_eq!(env.gain_at(57.0), 1.0);
        assert_eq!(env.gain_at(0.5), 0.5);
    }

    #[test]
    fn test_lookup_interpolates() {
        let env = SidechainEnvelope {
            sample_rate: 200,
            gain_values: vec![1.0, 0.5, 1.0, 1.0],
            duration: 0.02,
        };
        // Halfway between sample 0 (1.0) and sample 1 (0.5).
        let mid = env.gain_at(0.0025);
        assert!((mid - 0.75).abs() < 1e-6);
    }

    #[test]
    fn test_looped_element_fills_timeline() {
        // A 0.25 s burst looped over 2 s keeps the compressor engaged for
        // the whole timeline instead of only the first quarter second.
        let elements = vec![SourceElement {
            buffer: square_burst(0.25, 44_100),
            start_time: 0.0,
            trim_start: 0.0,
            duration: 0.25,
            looped: true,
        }];
        let env = compute_envelope(&elements, 2.0, &duck_params());
        assert!(env.gain_at(1.9) < 0.5, "loop should still duck near the end");
    }
}
