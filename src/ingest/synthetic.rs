//! Synthetic `stub://` scene source.
//!
//! Produces a deterministic golden sample and a stream of captured frames
//! derived from it: optionally with an injected defect rectangle and an
//! optional quarter-turn rotation. Used by `inspectd` when no capture
//! collaborator is attached, and by tests.

use anyhow::{anyhow, Result};
use rand::{rngs::StdRng, Rng, SeedableRng};
use std::time::Duration;

use super::{FrameInput, PixelFormat};
use crate::luma::GrayImage;

/// Golden-sample appearance.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum SceneKind {
    /// Flat field at a single intensity.
    Uniform { level: u8 },
    /// Random-intensity square blocks; rich in corners for alignment.
    Blocks { block_size: u32, seed: u64 },
}

/// Rectangle whose intensity is shifted by `delta` in captured frames.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SyntheticDefect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
    pub delta: i16,
    /// First frame number (1-based) that shows the defect.
    pub from_frame: u64,
}

#[derive(Clone, Debug)]
pub struct SyntheticConfig {
    pub url: String,
    pub width: u32,
    pub height: u32,
    pub target_fps: u32,
    pub scene: SceneKind,
    pub defect: Option<SyntheticDefect>,
    /// Clockwise quarter turns applied to captured frames (0..=3), about the
    /// frame centre. Frames keep the configured size.
    pub quarter_turns: u8,
}

impl Default for SyntheticConfig {
    fn default() -> Self {
        Self {
            url: "stub://line_camera".to_string(),
            width: 640,
            height: 480,
            target_fps: 10,
            scene: SceneKind::Blocks {
                block_size: 8,
                seed: 7,
            },
            defect: None,
            quarter_turns: 0,
        }
    }
}

#[derive(Clone, Debug)]
pub struct SyntheticStats {
    pub frames_generated: u64,
    pub url: String,
}

pub struct SyntheticSource {
    config: SyntheticConfig,
    reference: GrayImage,
    frame_count: u64,
}

impl SyntheticSource {
    pub fn new(config: SyntheticConfig) -> Result<Self> {
        if !config.url.starts_with("stub://") {
            return Err(anyhow!(
                "synthetic source only serves stub:// urls (got {})",
                config.url
            ));
        }
        if config.width == 0 || config.height == 0 {
            return Err(anyhow!("synthetic frame dimensions must be non-zero"));
        }
        if config.target_fps == 0 {
            return Err(anyhow!("synthetic target_fps must be >= 1"));
        }
        if config.quarter_turns > 3 {
            return Err(anyhow!("quarter_turns must be in 0..=3"));
        }
        let reference = render_scene(config.scene, config.width, config.height);
        Ok(Self {
            config,
            reference,
            frame_count: 0,
        })
    }

    pub fn connect(&mut self) -> Result<()> {
        log::info!(
            "SyntheticSource: connected to {} ({}x{} @ {} fps)",
            self.config.url,
            self.config.width,
            self.config.height,
            self.config.target_fps
        );
        Ok(())
    }

    /// The golden sample this source's frames are derived from.
    pub fn reference_image(&self) -> &GrayImage {
        &self.reference
    }

    /// Capture the next frame.
    pub fn next_frame(&mut self) -> FrameInput {
        self.frame_count += 1;
        let mut image = self.reference.clone();

        if let Some(defect) = self.config.defect {
            if self.frame_count >= defect.from_frame {
                paint_defect(&mut image, &defect);
            }
        }
        if self.config.quarter_turns > 0 {
            image = rotate_in_place(&image, self.config.quarter_turns);
        }

        let timestamp = Duration::from_micros(
            (self.frame_count - 1) * 1_000_000 / self.config.target_fps as u64,
        );
        let (width, height) = image.dimensions();
        FrameInput {
            width,
            height,
            timestamp,
            format: PixelFormat::Gray8,
            pixels: image.as_slice().to_vec(),
        }
    }

    pub fn is_healthy(&self) -> bool {
        true
    }

    pub fn stats(&self) -> SyntheticStats {
        SyntheticStats {
            frames_generated: self.frame_count,
            url: self.config.url.clone(),
        }
    }
}

pub fn render_scene(scene: SceneKind, width: u32, height: u32) -> GrayImage {
    match scene {
        SceneKind::Uniform { level } => GrayImage::filled(width, height, level),
        SceneKind::Blocks { block_size, seed } => {
            let block = block_size.max(1);
            let cols = width.div_ceil(block);
            let rows = height.div_ceil(block);
            let mut rng = StdRng::seed_from_u64(seed);
            let levels: Vec<u8> = (0..cols * rows).map(|_| rng.gen_range(20..=235)).collect();
            GrayImage::from_fn(width, height, |x, y| {
                levels[((y / block) * cols + x / block) as usize]
            })
        }
    }
}

fn paint_defect(image: &mut GrayImage, defect: &SyntheticDefect) {
    let x_end = defect.x.saturating_add(defect.width).min(image.width());
    let y_end = defect.y.saturating_add(defect.height).min(image.height());
    for y in defect.y..y_end {
        for x in defect.x..x_end {
            let shifted = image.get(x, y) as i16 + defect.delta;
            image.set(x, y, shifted.clamp(0, 255) as u8);
        }
    }
}

/// Rotate 90 degrees clockwise; a WxH image becomes HxW.
pub fn rotate_clockwise(image: &GrayImage) -> GrayImage {
    let (w, h) = image.dimensions();
    GrayImage::from_fn(h, w, |x, y| image.get(y, h - 1 - x))
}

/// Rotate clockwise by `quarter_turns` about the image centre, keeping the
/// WxH canvas. Cells the rotated content does not cover are black.
pub fn rotate_in_place(image: &GrayImage, quarter_turns: u8) -> GrayImage {
    let (w, h) = image.dimensions();
    let cx = (w as f64 - 1.0) / 2.0;
    let cy = (h as f64 - 1.0) / 2.0;
    GrayImage::from_fn(w, h, |x, y| {
        let dx = x as f64 - cx;
        let dy = y as f64 - cy;
        // Inverse rotation: where the output cell samples from.
        let (sx, sy) = match quarter_turns % 4 {
            0 => (dx, dy),
            1 => (dy, -dx),
            2 => (-dx, -dy),
            _ => (-dy, dx),
        };
        let sx = (cx + sx).round();
        let sy = (cy + sy).round();
        if sx < 0.0 || sy < 0.0 || sx >= w as f64 || sy >= h as f64 {
            0
        } else {
            image.get(sx as u32, sy as u32)
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(scene: SceneKind) -> SyntheticConfig {
        SyntheticConfig {
            url: "stub://test".to_string(),
            width: 32,
            height: 24,
            target_fps: 10,
            scene,
            defect: None,
            quarter_turns: 0,
        }
    }

    #[test]
    fn rejects_non_stub_urls() {
        let mut cfg = config(SceneKind::Uniform { level: 128 });
        cfg.url = "rtsp://camera".to_string();
        assert!(SyntheticSource::new(cfg).is_err());
    }

    #[test]
    fn frames_match_reference_without_defect() {
        let mut source = SyntheticSource::new(config(SceneKind::Blocks {
            block_size: 4,
            seed: 3,
        }))
        .unwrap();
        let frame = source.next_frame();
        assert_eq!(frame.pixels.as_slice(), source.reference_image().as_slice());
        assert_eq!(frame.timestamp, Duration::ZERO);
        assert_eq!(source.next_frame().timestamp, Duration::from_millis(100));
        assert_eq!(source.stats().frames_generated, 2);
    }

    #[test]
    fn defect_appears_from_configured_frame() {
        let mut cfg = config(SceneKind::Uniform { level: 100 });
        cfg.defect = Some(SyntheticDefect {
            x: 2,
            y: 3,
            width: 4,
            height: 2,
            delta: 80,
            from_frame: 2,
        });
        let mut source = SyntheticSource::new(cfg).unwrap();
        let first = source.next_frame();
        assert!(first.pixels.iter().all(|&p| p == 100));
        let second = source.next_frame();
        let changed = second.pixels.iter().filter(|&&p| p == 180).count();
        assert_eq!(changed, 8);
        assert_eq!(second.pixels[3 * 32 + 2], 180);
    }

    #[test]
    fn quarter_turn_swaps_dimensions() {
        let img = GrayImage::from_fn(3, 2, |x, y| (y * 3 + x) as u8);
        let rotated = rotate_clockwise(&img);
        assert_eq!(rotated.dimensions(), (2, 3));
        // Bottom-left of the input lands top-left.
        assert_eq!(rotated.get(0, 0), img.get(0, 1));
        assert_eq!(rotated.get(1, 0), img.get(0, 0));
        let back = rotate_clockwise(&rotate_clockwise(&rotate_clockwise(&rotated)));
        assert_eq!(back, img);
    }

    #[test]
    fn in_place_rotation_keeps_the_canvas() {
        let img = GrayImage::from_fn(3, 3, |x, y| (y * 3 + x + 1) as u8);
        assert_eq!(rotate_in_place(&img, 1), rotate_clockwise(&img));
        assert_eq!(rotate_in_place(&img, 0), img);

        let wide = GrayImage::from_fn(6, 4, |x, y| (y * 6 + x + 1) as u8);
        let turned = rotate_in_place(&wide, 1);
        assert_eq!(turned.dimensions(), (6, 4));
        assert_eq!(rotate_in_place(&wide, 2).get(0, 0), wide.get(5, 3));
        // Columns outside the rotated footprint are uncovered.
        assert_eq!(turned.get(0, 0), 0);
        assert_eq!(turned.get(5, 3), 0);
    }

    #[test]
    fn rotated_frames_keep_configured_size() {
        let mut cfg = config(SceneKind::Blocks {
            block_size: 4,
            seed: 5,
        });
        cfg.quarter_turns = 1;
        let mut source = SyntheticSource::new(cfg).unwrap();
        let frame = source.next_frame();
        assert_eq!((frame.width, frame.height), (32, 24));
        assert_eq!(frame.pixels.len(), 32 * 24);
        assert_ne!(frame.pixels.as_slice(), source.reference_image().as_slice());
    }

    #[test]
    fn block_scene_is_deterministic() {
        let scene = SceneKind::Blocks {
            block_size: 8,
            seed: 11,
        };
        assert_eq!(render_scene(scene, 40, 40), render_scene(scene, 40, 40));
    }
}
