//! Mono mixdown and nearest-neighbor resampling

use crate::types::Sample;

/// Mix an arbitrary channel layout down to mono.
///
/// Sums the channels sample-by-sample and divides by the channel count.
/// Output length equals the input channel length; channels shorter than the
/// longest one contribute silence past their end.
pub fn mono_mix(channels: &[Vec<Sample>]) -> Vec<Sample> {
    if channels.is_empty() {
        return Vec::new();
    }
    let len = channels.iter().map(|c| c.len()).max().unwrap_or(0);
    let scale = 1.0 / channels.len() as Sample;

    let mut out = vec![0.0; len];
    for channel in channels {
        for (dst, &src) in out.iter_mut().zip(channel.iter()) {
            *dst += src;
        }
    }
    for sample in &mut out {
        *sample *= scale;
    }
    out
}

/// Resample a mono signal by picking the nearest source sample.
///
/// `ratio` is output rate over input rate: 2.0 doubles the sample count.
/// Good enough for envelope composition and for the loop/fixed mixdown
/// paths, where the contract is a perceptually correct result rather than
/// transparent playback.
pub fn resample_nearest(input: &[Sample], ratio: f64) -> Vec<Sample> {
    if input.is_empty() || ratio <= 0.0 {
        return Vec::new();
    }
    let out_len = (input.len() as f64 * ratio).floor() as usize;
    let mut out = Vec::with_capacity(out_len);
    for i in 0..out_len {
        let src = ((i as f64 / ratio) as usize).min(input.len() - 1);
        out.push(input[src]);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mono_mix_averages_channels() {
        let channels = vec![vec![1.0, 0.0, -1.0], vec![0.0, 1.0, -1.0]];
        let mono = mono_mix(&channels);
        assert_eq!(mono, vec![0.5, 0.5, -1.0]);
    }

    #[test]
    fn test_mono_mix_preserves_length() {
        let channels = vec![vec![0.25; 441]];
        assert_eq!(mono_mix(&channels).len(), 441);
    }

    #[test]
    fn test_mono_mix_empty() {
        assert!(mono_mix(&[]).is_empty());
    }

    #[test]
    fn test_resample_identity() {
        let input = vec![0.1, 0.2, 0.3, 0.4];
        assert_eq!(resample_nearest(&input, 1.0), input);
    }

    #[test]
    fn test_resample_doubles_length() {
        let input = vec![1.0, 2.0];
        let out = resample_nearest(&input, 2.0);
        assert_eq!(out, vec![1.0, 1.0, 2.0, 2.0]);
    }

    #[test]
    fn test_resample_halves_length() {
        let input = vec![1.0, 2.0, 3.0, 4.0];
        let out = resample_nearest(&input, 0.5);
        assert_eq!(out, vec![1.0, 3.0]);
    }
}
