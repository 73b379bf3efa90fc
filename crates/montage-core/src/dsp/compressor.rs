//! Compressor gain curve
//!
//! Converts an RMS envelope into a smoothed linear gain-reduction series:
//! dB-domain threshold/ratio curve, reduction capped by depth, single-pole
//! attack/release smoothing, then back to linear gain.

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};
use crate::types::Sample;

/// Dynamics parameters for sidechain compression
///
/// Ranges mirror what the panel exposes: negative depth is the maximum
/// reduction in dB that the curve is allowed to reach.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CompressorParams {
    /// Threshold in dBFS, -60..=0
    pub threshold_db: f32,
    /// Compression ratio, 1..=20
    pub ratio: f32,
    /// Attack time constant in seconds, 0.001..=0.5
    pub attack: f32,
    /// Release time constant in seconds, 0.01..=2.0
    pub release: f32,
    /// Maximum reduction in dB (negative), -60..=0
    pub depth_db: f32,
}

impl Default for CompressorParams {
    fn default() -> Self {
        Self {
            threshold_db: -24.0,
            ratio: 4.0,
            attack: 0.01,
            release: 0.2,
            depth_db: -24.0,
        }
    }
}

impl CompressorParams {
    /// Check every field against its allowed range.
    pub fn validate(&self) -> EngineResult<()> {
        fn check(name: &str, value: f32, lo: f32, hi: f32) -> EngineResult<()> {
            if !value.is_finite() || value < lo || value > hi {
                return Err(EngineError::invariant(format!(
                    "{} = {} outside [{}, {}]",
                    name, value, lo, hi
                )));
            }
            Ok(())
        }
        check("threshold_db", self.threshold_db, -60.0, 0.0)?;
        check("ratio", self.ratio, 1.0, 20.0)?;
        check("attack", self.attack, 0.001, 0.5)?;
        check("release", self.release, 0.01, 2.0)?;
        check("depth_db", self.depth_db, -60.0, 0.0)?;
        Ok(())
    }
}

/// Single-pole smoothing coefficient for a time constant at `rate` Hz.
fn smoothing_coeff(tau: f32, rate: u32) -> f64 {
    (-1.0 / (tau as f64 * rate as f64)).exp()
}

/// Map an RMS envelope to linear gain values in [0, 1].
///
/// Per sample: rms → dB, target reduction from the threshold/ratio curve
/// clamped to |depth|, attack/release smoothing in the reduction domain,
/// then `10^(-smoothed/20)`.
pub fn compressor_gains(rms: &[Sample], params: &CompressorParams, envelope_rate: u32) -> Vec<Sample> {
    let attack_coeff = smoothing_coeff(params.attack, envelope_rate);
    let release_coeff = smoothing_coeff(params.release, envelope_rate);
    let max_reduction = params.depth_db.abs() as f64;
    let threshold = params.threshold_db as f64;
    let slope = 1.0 - 1.0 / params.ratio as f64;

    let mut smoothed = 0.0f64;
    let mut out = Vec::with_capacity(rms.len());
    for &r in rms {
        let rms_db = if r > 0.0 {
            20.0 * (r as f64).log10()
        } else {
            f64::NEG_INFINITY
        };

        let target = if rms_db > threshold {
            ((rms_db - threshold) * slope).clamp(0.0, max_reduction)
        } else {
            0.0
        };

        let coeff = if target > smoothed { attack_coeff } else { release_coeff };
        smoothed = coeff * smoothed + (1.0 - coeff) * target;

        out.push(10f64.powf(-smoothed / 20.0) as Sample);
    }
    out
}
