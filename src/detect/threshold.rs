//! Deviation thresholding.
//!
//! A valid cell is a candidate when its deviation is strictly above the
//! cutoff. The cutoff is either fixed or chosen per frame by Otsu's method
//! over the valid deviations, never below a configured floor.

use serde::{Deserialize, Serialize};

use super::{BinaryMask, DifferenceMap};

const BINS: usize = 256;

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum ThresholdMode {
    Fixed { cutoff: f32 },
    /// Otsu cutoff per frame, floored at `min_cutoff` so a clean frame does
    /// not get its sensor noise promoted to candidates.
    Adaptive { min_cutoff: f32 },
}

impl Default for ThresholdMode {
    fn default() -> Self {
        ThresholdMode::Fixed { cutoff: 40.0 }
    }
}

impl ThresholdMode {
    pub fn validate(&self) -> Result<(), String> {
        let v = match *self {
            ThresholdMode::Fixed { cutoff } => cutoff,
            ThresholdMode::Adaptive { min_cutoff } => min_cutoff,
        };
        if !v.is_finite() || v < 0.0 {
            return Err(format!("threshold must be finite and >= 0 (got {})", v));
        }
        Ok(())
    }
}

/// Otsu's threshold over valid deviations, on a 256-bin histogram.
///
/// Returns `None` when the valid deviations carry no between-class variance
/// (empty map or a single populated bin).
pub fn otsu_cutoff(map: &DifferenceMap) -> Option<f32> {
    let mut hist = [0u64; BINS];
    let mut total = 0u64;
    for v in map.valid_values() {
        let bin = v.round().clamp(0.0, (BINS - 1) as f32) as usize;
        hist[bin] += 1;
        total += 1;
    }
    if total == 0 {
        return None;
    }

    let weighted_sum: f64 = hist
        .iter()
        .enumerate()
        .map(|(i, &c)| i as f64 * c as f64)
        .sum();

    let mut best: Option<(usize, f64)> = None;
    let mut w0 = 0u64;
    let mut sum0 = 0f64;
    for (t, &count) in hist.iter().enumerate().take(BINS - 1) {
        w0 += count;
        sum0 += t as f64 * count as f64;
        let w1 = total - w0;
        if w0 == 0 || w1 == 0 {
            continue;
        }
        let m0 = sum0 / w0 as f64;
        let m1 = (weighted_sum - sum0) / w1 as f64;
        let between = w0 as f64 * w1 as f64 * (m0 - m1).powi(2);
        if best.map_or(true, |(_, b)| between > b) {
            best = Some((t, between));
        }
    }
    // Bin t holds values rounding to t; everything above t + 0.5 is class 1.
    best.map(|(t, _)| t as f32 + 0.5)
}

/// Cutoff in effect for this map under `mode`.
pub fn resolve_cutoff(map: &DifferenceMap, mode: ThresholdMode) -> f32 {
    match mode {
        ThresholdMode::Fixed { cutoff } => cutoff,
        ThresholdMode::Adaptive { min_cutoff } => otsu_cutoff(map)
            .map(|c| c.max(min_cutoff))
            .unwrap_or(min_cutoff),
    }
}

/// Binarize `map`. Returns the mask and the cutoff used.
pub fn apply_threshold(map: &DifferenceMap, mode: ThresholdMode) -> (BinaryMask, f32) {
    let cutoff = resolve_cutoff(map, mode);
    let cells = map
        .values()
        .iter()
        .zip(map.validity())
        .map(|(&v, &ok)| ok && v > cutoff)
        .collect();
    (BinaryMask::from_cells(map.width(), map.height(), cells), cutoff)
}
