//! Binary morphology with a square structuring element.
//!
//! The kernel is `(2r + 1) x (2r + 1)`. Cells outside the mask are ignored
//! (the window is clipped at the border), so border cells are neither
//! eroded nor grown by what lies beyond the image. Square windows are
//! separable: a horizontal pass followed by a vertical pass.

use rayon::prelude::*;

use super::BinaryMask;
use crate::pipeline::ComputeLanes;

#[derive(Clone, Copy, PartialEq, Eq)]
enum Op {
    Erode,
    Dilate,
}

/// One horizontal sliding-window pass over every row.
fn row_pass(cells: &[bool], width: usize, radius: usize, op: Op, lanes: &ComputeLanes) -> Vec<bool> {
    let mut out = vec![false; cells.len()];
    lanes.install(|| {
        out.par_chunks_mut(width)
            .zip(cells.par_chunks(width))
            .for_each(|(dst, src)| {
                let mut prefix = Vec::with_capacity(width + 1);
                prefix.push(0u32);
                for &c in src {
                    let last = prefix[prefix.len() - 1];
                    prefix.push(last + c as u32);
                }
                for (x, d) in dst.iter_mut().enumerate() {
                    let lo = x.saturating_sub(radius);
                    let hi = (x + radius).min(width - 1);
                    let count = prefix[hi + 1] - prefix[lo];
                    *d = match op {
                        Op::Erode => count as usize == hi - lo + 1,
                        Op::Dilate => count > 0,
                    };
                }
            });
    });
    out
}

fn transpose(cells: &[bool], width: usize, height: usize) -> Vec<bool> {
    let mut out = vec![false; cells.len()];
    for y in 0..height {
        for x in 0..width {
            out[x * height + y] = cells[y * width + x];
        }
    }
    out
}

fn apply(mask: &BinaryMask, radius: usize, op: Op, lanes: &ComputeLanes) -> BinaryMask {
    if radius == 0 || mask.cells().is_empty() {
        return mask.clone();
    }
    let (w, h) = (mask.width() as usize, mask.height() as usize);
    let horizontal = row_pass(mask.cells(), w, radius, op, lanes);
    let vertical = row_pass(&transpose(&horizontal, w, h), h, radius, op, lanes);
    BinaryMask::from_cells(mask.width(), mask.height(), transpose(&vertical, h, w))
}

pub fn erode(mask: &BinaryMask, radius: usize, lanes: &ComputeLanes) -> BinaryMask {
    apply(mask, radius, Op::Erode, lanes)
}

pub fn dilate(mask: &BinaryMask, radius: usize, lanes: &ComputeLanes) -> BinaryMask {
    apply(mask, radius, Op::Dilate, lanes)
}

/// Erode `iterations` times, then dilate `iterations` times.
pub fn open(mask: &BinaryMask, radius: usize, iterations: usize, lanes: &ComputeLanes) -> BinaryMask {
    let mut out = mask.clone();
    for _ in 0..iterations {
        out = erode(&out, radius, lanes);
    }
    for _ in 0..iterations {
        out = dilate(&out, radius, lanes);
    }
    out
}

/// Dilate `iterations` times, then erode `iterations` times.
pub fn close(mask: &BinaryMask, radius: usize, iterations: usize, lanes: &ComputeLanes) -> BinaryMask {
    let mut out = mask.clone();
    for _ in 0..iterations {
        out = dilate(&out, radius, lanes);
    }
    for _ in 0..iterations {
        out = erode(&out, radius, lanes);
    }
    out
}

/// Opening (drops specks smaller than the kernel) followed by closing
/// (bridges gaps narrower than the kernel).
pub fn denoise(mask: &BinaryMask, radius: usize, iterations: usize, lanes: &ComputeLanes) -> BinaryMask {
    let opened = open(mask, radius, iterations, lanes);
    close(&opened, radius, iterations, lanes)
}
