//! Sparse corner features with binary descriptors.
//!
//! Corners come from a FAST-9 segment test on a radius-3 Bresenham circle:
//! a pixel is a corner when at least 9 contiguous circle pixels are all
//! brighter or all darker than the center by more than the threshold. The
//! contiguity check wraps around the circle.
//!
//! Each surviving corner gets a 256-bit intensity-comparison descriptor
//! sampled on a box-smoothed copy of the image. The sampling pattern is
//! fixed (seeded), so descriptors are comparable across frames and runs.
//! Descriptors are not rotation invariant: a fixtured camera is assumed.

use rand::{rngs::StdRng, Rng, SeedableRng};
use std::sync::OnceLock;

use crate::luma::GrayImage;

/// Bresenham circle of radius 3, clockwise from 12 o'clock.
const CIRCLE_OFFSETS: [(i32, i32); 16] = [
    (0, -3),
    (1, -3),
    (2, -2),
    (3, -1),
    (3, 0),
    (3, 1),
    (2, 2),
    (1, 3),
    (0, 3),
    (-1, 3),
    (-2, 2),
    (-3, 1),
    (-3, 0),
    (-3, -1),
    (-2, -2),
    (-1, -3),
];

const ARC_LENGTH: usize = 9;

/// Half-size of the descriptor sampling window.
pub const PATCH_RADIUS: i32 = 15;

/// Keypoints closer than this to the border are discarded (patch + smoothing).
const BORDER: i32 = PATCH_RADIUS + 2;

const DESCRIPTOR_BITS: usize = 256;
const PATTERN_SEED: u64 = 0x1a5e_d0c5;

/// 256-bit binary descriptor.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct Descriptor(pub [u64; 4]);

impl Descriptor {
    /// Hamming distance.
    #[inline]
    pub fn distance(&self, other: &Descriptor) -> u32 {
        self.0
            .iter()
            .zip(other.0.iter())
            .map(|(a, b)| (a ^ b).count_ones())
            .sum()
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Keypoint {
    pub x: f32,
    pub y: f32,
    /// Segment-test response. Higher is a stronger corner.
    pub score: f32,
    pub descriptor: Descriptor,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct FeatureConfig {
    /// Intensity difference a circle pixel needs to count as brighter/darker.
    pub fast_threshold: u8,
    /// Strongest keypoints kept per image.
    pub max_features: usize,
}

impl Default for FeatureConfig {
    fn default() -> Self {
        Self {
            fast_threshold: 20,
            max_features: 500,
        }
    }
}

/// Detect corners and describe them.
///
/// Output is deterministic: sorted by descending score, ties broken by
/// raster position.
pub fn detect_keypoints(image: &GrayImage, config: &FeatureConfig) -> Vec<Keypoint> {
    let (w, h) = (image.width() as i32, image.height() as i32);
    if w <= 2 * BORDER || h <= 2 * BORDER {
        return Vec::new();
    }

    let scores = segment_test_scores(image, config.fast_threshold);
    let mut corners = non_max_suppress(&scores, w, h);
    corners.sort_by(|a, b| {
        b.2.total_cmp(&a.2)
            .then_with(|| a.1.cmp(&b.1))
            .then_with(|| a.0.cmp(&b.0))
    });
    corners.truncate(config.max_features);

    let smoothed = box_smooth(image);
    corners
        .into_iter()
        .map(|(x, y, score)| Keypoint {
            x: x as f32,
            y: y as f32,
            score,
            descriptor: describe(&smoothed, w, x, y),
        })
        .collect()
}

/// Score map of the segment test; zero where the pixel is not a corner.
fn segment_test_scores(image: &GrayImage, threshold: u8) -> Vec<f32> {
    let (w, h) = (image.width() as i32, image.height() as i32);
    let t = threshold as i16;
    let mut scores = vec![0f32; (w * h) as usize];

    for y in BORDER..(h - BORDER) {
        for x in BORDER..(w - BORDER) {
            let center = image.get(x as u32, y as u32) as i16;

            // Quick rejection on the four cardinal points.
            let cardinal = [0usize, 4, 8, 12].map(|i| {
                let (dx, dy) = CIRCLE_OFFSETS[i];
                image.get((x + dx) as u32, (y + dy) as u32) as i16
            });
            let brighter = cardinal.iter().filter(|&&p| p > center + t).count();
            let darker = cardinal.iter().filter(|&&p| p < center - t).count();
            if brighter < 2 && darker < 2 {
                continue;
            }

            let mut ring = [0i16; 16];
            for (i, &(dx, dy)) in CIRCLE_OFFSETS.iter().enumerate() {
                ring[i] = image.get((x + dx) as u32, (y + dy) as u32) as i16;
            }

            let bright_score = arc_score(&ring, |p| p - center - t);
            let dark_score = arc_score(&ring, |p| center - p - t);
            let score = bright_score.max(dark_score);
            if score > 0.0 {
                scores[(y * w + x) as usize] = score;
            }
        }
    }
    scores
}

/// Sum of margins over the circle when a wrapping run of at least
/// `ARC_LENGTH` pixels has positive margin; zero otherwise.
fn arc_score(ring: &[i16; 16], margin: impl Fn(i16) -> i16) -> f32 {
    let margins = ring.map(&margin);
    let mut run = 0usize;
    let mut longest = 0usize;
    for i in 0..32 {
        if margins[i % 16] > 0 {
            run += 1;
            longest = longest.max(run.min(16));
        } else {
            run = 0;
        }
    }
    if longest < ARC_LENGTH {
        return 0.0;
    }
    margins.iter().filter(|&&m| m > 0).map(|&m| m as f32).sum()
}

/// 3x3 non-maximum suppression.
///
/// A pixel survives when no neighbour scores higher; among equal neighbours
/// the first in raster order wins.
fn non_max_suppress(scores: &[f32], w: i32, h: i32) -> Vec<(i32, i32, f32)> {
    let mut kept = Vec::new();
    for y in 1..(h - 1) {
        for x in 1..(w - 1) {
            let s = scores[(y * w + x) as usize];
            if s <= 0.0 {
                continue;
            }
            let mut is_max = true;
            'neighbours: for dy in -1..=1 {
                for dx in -1..=1 {
                    if dx == 0 && dy == 0 {
                        continue;
                    }
                    let n = scores[((y + dy) * w + (x + dx)) as usize];
                    let earlier = dy < 0 || (dy == 0 && dx < 0);
                    if n > s || (earlier && n == s) {
                        is_max = false;
                        break 'neighbours;
                    }
                }
            }
            if is_max {
                kept.push((x, y, s));
            }
        }
    }
    kept
}

/// 3x3 box mean with clamped edges.
fn box_smooth(image: &GrayImage) -> Vec<u8> {
    let (w, h) = (image.width() as i64, image.height() as i64);
    let mut out = Vec::with_capacity((w * h) as usize);
    for y in 0..h {
        for x in 0..w {
            let mut sum = 0u32;
            for dy in -1..=1 {
                for dx in -1..=1 {
                    let sx = (x + dx).clamp(0, w - 1) as u32;
                    let sy = (y + dy).clamp(0, h - 1) as u32;
                    sum += image.get(sx, sy) as u32;
                }
            }
            out.push(((sum + 4) / 9) as u8);
        }
    }
    out
}

type PointPair = [(i8, i8); 2];

fn sampling_pattern() -> &'static [PointPair] {
    static PATTERN: OnceLock<Vec<PointPair>> = OnceLock::new();
    PATTERN.get_or_init(|| {
        let mut rng = StdRng::seed_from_u64(PATTERN_SEED);
        let r = PATCH_RADIUS as i8;
        (0..DESCRIPTOR_BITS)
            .map(|_| {
                let a = (rng.gen_range(-r..=r), rng.gen_range(-r..=r));
                let mut b = (rng.gen_range(-r..=r), rng.gen_range(-r..=r));
                while b == a {
                    b = (rng.gen_range(-r..=r), rng.gen_range(-r..=r));
                }
                [a, b]
            })
            .collect()
    })
}

fn describe(smoothed: &[u8], w: i32, x: i32, y: i32) -> Descriptor {
    let at = |dx: i8, dy: i8| smoothed[((y + dy as i32) * w + (x + dx as i32)) as usize];
    let mut bits = [0u64; 4];
    for (i, [a, b]) in sampling_pattern().iter().enumerate() {
        if at(a.0, a.1) < at(b.0, b.1) {
            bits[i / 64] |= 1u64 << (i % 64);
        }
    }
    Descriptor(bits)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::synthetic::{render_scene, SceneKind};

    fn textured(size: u32) -> GrayImage {
        render_scene(
            SceneKind::Blocks {
                block_size: 8,
                seed: 21,
            },
            size,
            size,
        )
    }

    #[test]
    fn flat_image_has_no_corners() {
        let img = GrayImage::filled(96, 96, 128);
        assert!(detect_keypoints(&img, &FeatureConfig::default()).is_empty());
    }

    #[test]
    fn bright_square_corners_are_detected() {
        let img = GrayImage::from_fn(96, 96, |x, y| {
            if (40..56).contains(&x) && (40..56).contains(&y) {
                220
            } else {
                30
            }
        });
        let kps = detect_keypoints(&img, &FeatureConfig::default());
        assert!(!kps.is_empty());
        for kp in &kps {
            let near_corner = [(40.0, 40.0), (55.0, 40.0), (40.0, 55.0), (55.0, 55.0)]
                .iter()
                .any(|(cx, cy)| (kp.x - cx).abs() <= 2.0 && (kp.y - cy).abs() <= 2.0);
            assert!(near_corner, "unexpected keypoint at ({}, {})", kp.x, kp.y);
        }
    }

    #[test]
    fn detection_is_deterministic_and_sorted() {
        let img = textured(128);
        let a = detect_keypoints(&img, &FeatureConfig::default());
        let b = detect_keypoints(&img, &FeatureConfig::default());
        assert!(a.len() > 20);
        assert_eq!(a, b);
        assert!(a.windows(2).all(|pair| pair[0].score >= pair[1].score));
    }

    #[test]
    fn max_features_caps_output() {
        let cfg = FeatureConfig {
            max_features: 5,
            ..FeatureConfig::default()
        };
        assert_eq!(detect_keypoints(&textured(128), &cfg).len(), 5);
    }

    #[test]
    fn descriptor_distance_is_hamming() {
        let a = Descriptor([0b1011, 0, 0, u64::MAX]);
        let b = Descriptor([0b0001, 0, 0, 0]);
        assert_eq!(a.distance(&a), 0);
        assert_eq!(a.distance(&b), 2 + 64);
    }

    #[test]
    fn wrapping_arc_is_counted() {
        // Positive margins on indices 12..16 and 0..5: a wrapped run of 9.
        let mut ring = [0i16; 16];
        for i in (12..16).chain(0..5) {
            ring[i] = 50;
        }
        assert!(arc_score(&ring, |p| p - 10) > 0.0);
        ring[0] = 0;
        assert_eq!(arc_score(&ring, |p| p - 10), 0.0);
    }
}
