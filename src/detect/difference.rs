//! Aligned absolute difference against the reference.
//!
//! The map lives on the reference grid. Each reference cell is mapped into
//! the frame through the inverse transform and sampled bilinearly; cells
//! whose sample falls outside the frame are invalid and carry no deviation.

use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::align::Transform;
use crate::luma::GrayImage;
use crate::pipeline::ComputeLanes;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DifferenceMode {
    /// `|frame - reference|` on raw intensities.
    #[default]
    Absolute,
    /// Frame gain and offset are matched to the reference (mean and standard
    /// deviation over the valid overlap) before differencing. Absorbs global
    /// exposure drift.
    Normalized,
}

#[derive(Clone, Debug, PartialEq)]
pub struct DifferenceMap {
    width: u32,
    height: u32,
    values: Vec<f32>,
    valid: Vec<bool>,
}

impl DifferenceMap {
    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    /// Deviation at a cell; `None` when the cell is invalid.
    pub fn get(&self, x: u32, y: u32) -> Option<f32> {
        let idx = y as usize * self.width as usize + x as usize;
        self.valid[idx].then(|| self.values[idx])
    }

    pub fn values(&self) -> &[f32] {
        &self.values
    }

    pub fn validity(&self) -> &[bool] {
        &self.valid
    }

    pub fn valid_count(&self) -> usize {
        self.valid.iter().filter(|&&v| v).count()
    }

    /// Iterator over deviations of valid cells.
    pub fn valid_values(&self) -> impl Iterator<Item = f32> + '_ {
        self.values
            .iter()
            .zip(&self.valid)
            .filter_map(|(&v, &ok)| ok.then_some(v))
    }

    pub fn max(&self) -> f32 {
        self.valid_values().fold(0.0, f32::max)
    }
}

/// Compute the deviation map of `frame` against `reference`.
///
/// `transform` maps frame coordinates to reference coordinates.
pub fn compute_difference(
    frame: &GrayImage,
    reference: &GrayImage,
    transform: &Transform,
    mode: DifferenceMode,
    lanes: &ComputeLanes,
) -> DifferenceMap {
    let (w, h) = reference.dimensions();
    let row_len = w as usize;
    let mut sampled = vec![0f32; row_len * h as usize];
    let mut valid = vec![false; row_len * h as usize];

    let direct = transform.is_identity() && frame.dimensions() == reference.dimensions();
    lanes.install(|| {
        sampled
            .par_chunks_mut(row_len)
            .zip(valid.par_chunks_mut(row_len))
            .enumerate()
            .for_each(|(y, (row, ok_row))| {
                let y = y as u32;
                if direct {
                    for (x, (s, ok)) in row.iter_mut().zip(ok_row.iter_mut()).enumerate() {
                        *s = frame.get(x as u32, y) as f32;
                        *ok = true;
                    }
                    return;
                }
                for (x, (s, ok)) in row.iter_mut().zip(ok_row.iter_mut()).enumerate() {
                    let sample = transform
                        .to_frame(x as f64, y as f64)
                        .and_then(|[fx, fy]| frame.sample_bilinear(fx, fy));
                    if let Some(v) = sample {
                        *s = v;
                        *ok = true;
                    }
                }
            });
    });

    if mode == DifferenceMode::Normalized {
        match_gain(&mut sampled, &valid, reference);
    }

    let ref_pixels = reference.as_slice();
    let mut values = sampled;
    lanes.install(|| {
        values
            .par_chunks_mut(row_len)
            .zip(valid.par_chunks(row_len))
            .zip(ref_pixels.par_chunks(row_len))
            .for_each(|((row, ok_row), ref_row)| {
                for ((v, &ok), &r) in row.iter_mut().zip(ok_row).zip(ref_row) {
                    *v = if ok { (*v - r as f32).abs() } else { 0.0 };
                }
            });
    });

    DifferenceMap {
        width: w,
        height: h,
        values,
        valid,
    }
}

/// Remap sampled intensities so their mean/stddev over the valid overlap
/// match the reference's.
fn match_gain(sampled: &mut [f32], valid: &[bool], reference: &GrayImage) {
    let (mut n, mut fs, mut fss, mut rs, mut rss) = (0f64, 0f64, 0f64, 0f64, 0f64);
    for ((&s, &ok), &r) in sampled.iter().zip(valid).zip(reference.as_slice()) {
        if ok {
            let (s, r) = (s as f64, r as f64);
            n += 1.0;
            fs += s;
            fss += s * s;
            rs += r;
            rss += r * r;
        }
    }
    if n == 0.0 {
        return;
    }
    let (f_mean, r_mean) = (fs / n, rs / n);
    let f_std = (fss / n - f_mean * f_mean).max(0.0).sqrt();
    let r_std = (rss / n - r_mean * r_mean).max(0.0).sqrt();
    let gain = if f_std > 1e-6 && r_std > 1e-6 {
        r_std / f_std
    } else {
        1.0
    };
    for (s, &ok) in sampled.iter_mut().zip(valid) {
        if ok {
            *s = ((*s as f64 - f_mean) * gain + r_mean) as f32;
        }
    }
}
