use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

/// Pixel layouts accepted at the ingestion boundary.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PixelFormat {
    #[default]
    Gray8,
    Rgb24,
    Nv12,
}

impl PixelFormat {
    /// Expected buffer length for a frame of the given size.
    pub fn buffer_len(self, width: u32, height: u32) -> Result<usize> {
        let plane = (width as usize)
            .checked_mul(height as usize)
            .ok_or_else(|| anyhow!("frame dimensions overflow"))?;
        let len = match self {
            PixelFormat::Gray8 => Some(plane),
            PixelFormat::Rgb24 => plane.checked_mul(3),
            PixelFormat::Nv12 => plane.checked_add(plane / 2),
        };
        len.ok_or_else(|| anyhow!("frame dimensions overflow"))
    }
}

/// Check that the buffer length matches the frame size and format.
pub(crate) fn validate_len(pixels: &[u8], width: u32, height: u32, format: PixelFormat) -> Result<()> {
    let expected = format.buffer_len(width, height)?;
    if pixels.len() != expected {
        return Err(anyhow!(
            "{:?} frame length mismatch: expected {}, got {}",
            format,
            expected,
            pixels.len()
        ));
    }
    Ok(())
}

/// Copy the luma plane of `pixels` into `out`, reusing its allocation.
///
/// Infallible for buffers already checked with `validate_len`.
pub(crate) fn copy_luma(pixels: &[u8], width: u32, height: u32, format: PixelFormat, out: &mut Vec<u8>) {
    out.clear();
    let plane = width as usize * height as usize;
    match format {
        // NV12 stores full-resolution Y first; chroma is irrelevant for luma.
        PixelFormat::Gray8 | PixelFormat::Nv12 => out.extend_from_slice(&pixels[..plane]),
        PixelFormat::Rgb24 => {
            out.reserve(plane);
            out.extend(pixels.chunks_exact(3).map(|rgb| rgb_to_luma(rgb[0], rgb[1], rgb[2])));
        }
    }
}

/// BT.601 luma.
fn rgb_to_luma(r: u8, g: u8, b: u8) -> u8 {
    let y = 0.299_f32 * r as f32 + 0.587_f32 * g as f32 + 0.114_f32 * b as f32;
    y.round().clamp(0.0, 255.0) as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_luma(
        pixels: &[u8],
        width: u32,
        height: u32,
        format: PixelFormat,
        out: &mut Vec<u8>,
    ) -> Result<()> {
        validate_len(pixels, width, height, format)?;
        copy_luma(pixels, width, height, format, out);
        Ok(())
    }

    #[test]
    fn rgb_gray_converts_to_same_luma() -> Result<()> {
        let rgb = vec![128u8; 2 * 2 * 3];
        let mut out = Vec::new();
        write_luma(&rgb, 2, 2, PixelFormat::Rgb24, &mut out)?;
        assert_eq!(out, vec![128u8; 4]);
        Ok(())
    }

    #[test]
    fn nv12_keeps_y_plane_only() -> Result<()> {
        let y_plane = vec![10u8, 20, 30, 40];
        let uv_plane = vec![200u8; 2];
        let nv12 = [y_plane.clone(), uv_plane].concat();
        let mut out = vec![99u8; 64];
        write_luma(&nv12, 2, 2, PixelFormat::Nv12, &mut out)?;
        assert_eq!(out, y_plane);
        Ok(())
    }

    #[test]
    fn length_mismatch_is_rejected() {
        let mut out = Vec::new();
        assert!(write_luma(&[0u8; 5], 2, 2, PixelFormat::Gray8, &mut out).is_err());
        assert!(write_luma(&[0u8; 12], 2, 2, PixelFormat::Nv12, &mut out).is_err());
    }

    #[test]
    fn pure_channels_follow_bt601_weights() {
        assert_eq!(rgb_to_luma(255, 0, 0), 76);
        assert_eq!(rgb_to_luma(0, 255, 0), 150);
        assert_eq!(rgb_to_luma(0, 0, 255), 29);
    }
}
