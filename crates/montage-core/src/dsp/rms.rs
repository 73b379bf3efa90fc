//! Windowed RMS detection
//!
//! Produces the amplitude envelope the compressor curve operates on,
//! resampled from the source rate down to the 200 Hz envelope rate.

use crate::types::Sample;

/// Width of the RMS analysis window in seconds (10 ms).
const WINDOW_SECONDS: f64 = 0.01;

/// Compute a windowed RMS envelope of `signal`, resampled to `envelope_rate`.
///
/// For each output index the window is centered on the corresponding source
/// sample and clamped to the buffer bounds. Empty windows produce 0.
pub fn rms_envelope(signal: &[Sample], source_rate: u32, envelope_rate: u32) -> Vec<Sample> {
    if signal.is_empty() || source_rate == 0 || envelope_rate == 0 {
        return Vec::new();
    }

    let out_len =
        ((signal.len() as f64) * envelope_rate as f64 / source_rate as f64).ceil() as usize;
    let window = (WINDOW_SECONDS * source_rate as f64).floor() as usize;
    let half = window / 2;

    let mut out = Vec::with_capacity(out_len);
    for i in 0..out_len {
        let center = (i as f64 * source_rate as f64 / envelope_rate as f64).floor() as usize;
        let lo = center.saturating_sub(half);
        let hi = (center + half).min(signal.len());
        if lo >= hi {
            out.push(0.0);
            continue;
        }
        let sum_sq: f64 = signal[lo..hi].iter().map(|&s| (s as f64) * (s as f64)).sum();
        out.push((sum_sq / (hi - lo) as f64).sqrt() as Sample);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ENVELOPE_RATE;

    #[test]
    fn test_constant_signal_rms() {
        // RMS of a constant 0.5 signal is 0.5 everywhere.
        let signal = vec![0.5; 44_100];
        let env = rms_envelope(&signal, 44_100, ENVELOPE_RATE);
        assert_eq!(env.len(), 200);
        for &v in &env {
            assert!((v - 0.5).abs() < 1e-6, "rms {} should be 0.5", v);
        }
    }

    #[test]
    fn test_square_wave_rms_is_amplitude() {
        // A full-scale square wave has RMS equal to its amplitude.
        let signal: Vec<f32> = (0..44_100)
            .map(|i| if (i / 100) % 2 == 0 { 1.0 } else { -1.0 })
            .collect();
        let env = rms_envelope(&signal, 44_100, ENVELOPE_RATE);
        for &v in &env {
            assert!((v - 1.0).abs() < 1e-6);
        }
    }

    #[test]
    fn test_silence_rms_is_zero() {
        let env = rms_envelope(&vec![0.0; 4410], 44_100, ENVELOPE_RATE);
        assert_eq!(env.len(), 20);
        assert!(env.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_empty_signal() {
        assert!(rms_envelope(&[], 44_100, ENVELOPE_RATE).is_empty());
    }
}
