//! Owned 8-bit luma plane.
//!
//! All stages work on a single intensity channel. Color input is reduced to
//! luma at ingestion (see `ingest::normalize`).

use crate::error::{InspectError, Result};

/// Row-major 8-bit grayscale image. Stride equals width.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct GrayImage {
    width: u32,
    height: u32,
    data: Vec<u8>,
}

impl GrayImage {
    /// Wrap an existing buffer. Fails when the length does not match.
    pub fn new(width: u32, height: u32, data: Vec<u8>) -> Result<Self> {
        let expected = checked_len(width, height)?;
        if data.len() != expected {
            return Err(InspectError::InvalidFrame(format!(
                "luma buffer length mismatch: expected {}, got {}",
                expected,
                data.len()
            )));
        }
        Ok(Self {
            width,
            height,
            data,
        })
    }

    pub fn filled(width: u32, height: u32, value: u8) -> Self {
        Self {
            width,
            height,
            data: vec![value; width as usize * height as usize],
        }
    }

    pub fn from_fn(width: u32, height: u32, mut f: impl FnMut(u32, u32) -> u8) -> Self {
        let mut data = Vec::with_capacity(width as usize * height as usize);
        for y in 0..height {
            for x in 0..width {
                data.push(f(x, y));
            }
        }
        Self {
            width,
            height,
            data,
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn row(&self, y: u32) -> &[u8] {
        let w = self.width as usize;
        let start = y as usize * w;
        &self.data[start..start + w]
    }

    /// Pixel at `(x, y)`. Panics when out of bounds, like slice indexing.
    #[inline]
    pub fn get(&self, x: u32, y: u32) -> u8 {
        self.data[y as usize * self.width as usize + x as usize]
    }

    #[inline]
    pub fn set(&mut self, x: u32, y: u32, value: u8) {
        let w = self.width as usize;
        self.data[y as usize * w + x as usize] = value;
    }

    /// Signed-coordinate access with `None` outside the image.
    #[inline]
    pub fn get_checked(&self, x: i64, y: i64) -> Option<u8> {
        if x < 0 || y < 0 || x >= self.width as i64 || y >= self.height as i64 {
            return None;
        }
        Some(self.get(x as u32, y as u32))
    }

    /// Bilinear sample at a sub-pixel location.
    ///
    /// Returns `None` when the 2x2 support falls outside the image. Integer
    /// coordinates on the last row/column are still valid.
    pub fn sample_bilinear(&self, x: f64, y: f64) -> Option<f32> {
        if !x.is_finite() || !y.is_finite() {
            return None;
        }
        let max_x = (self.width as f64) - 1.0;
        let max_y = (self.height as f64) - 1.0;
        if x < 0.0 || y < 0.0 || x > max_x || y > max_y {
            return None;
        }
        let x0 = x.floor() as u32;
        let y0 = y.floor() as u32;
        let x1 = (x0 + 1).min(self.width - 1);
        let y1 = (y0 + 1).min(self.height - 1);
        let fx = (x - x0 as f64) as f32;
        let fy = (y - y0 as f64) as f32;

        let p00 = self.get(x0, y0) as f32;
        let p10 = self.get(x1, y0) as f32;
        let p01 = self.get(x0, y1) as f32;
        let p11 = self.get(x1, y1) as f32;

        let top = p00 + (p10 - p00) * fx;
        let bottom = p01 + (p11 - p01) * fx;
        Some(top + (bottom - top) * fy)
    }

    /// Overwrite this image in place, keeping the existing allocation when it is large enough.
    pub(crate) fn overwrite(&mut self, width: u32, height: u32, fill: impl FnOnce(&mut Vec<u8>)) {
        self.data.clear();
        fill(&mut self.data);
        self.width = width;
        self.height = height;
    }

    /// Mean and standard deviation of all pixels.
    pub fn mean_stddev(&self) -> (f64, f64) {
        if self.data.is_empty() {
            return (0.0, 0.0);
        }
        let n = self.data.len() as f64;
        let sum: f64 = self.data.iter().map(|&p| p as f64).sum();
        let mean = sum / n;
        let var: f64 = self
            .data
            .iter()
            .map(|&p| {
                let d = p as f64 - mean;
                d * d
            })
            .sum::<f64>()
            / n;
        (mean, var.sqrt())
    }
}

pub(crate) fn checked_len(width: u32, height: u32) -> Result<usize> {
    if width == 0 || height == 0 {
        return Err(InspectError::InvalidFrame(format!(
            "frame dimensions must be non-zero (got {}x{})",
            width, height
        )));
    }
    (width as usize)
        .checked_mul(height as usize)
        .ok_or_else(|| InspectError::InvalidFrame("frame dimensions overflow".to_string()))
}
