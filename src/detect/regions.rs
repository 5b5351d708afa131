//! 8-connected candidate regions via two-pass union-find labeling.

use serde::{Deserialize, Serialize};

use super::{BinaryMask, DifferenceMap};
use crate::BoundingBox;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CandidateRegion {
    /// 1-based label, compact and in raster order of each region's first cell.
    pub label: u32,
    pub bbox: BoundingBox,
    pub area: u64,
    pub mean_deviation: f32,
    pub confidence: f32,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RegionConfig {
    /// Regions with fewer cells are discarded.
    pub min_defect_area: u64,
    /// Area at which the area factor of the confidence reaches 0.5.
    pub area_half: f32,
    /// Mean deviation at which the deviation factor reaches 0.5.
    pub deviation_half: f32,
}

impl Default for RegionConfig {
    fn default() -> Self {
        Self {
            min_defect_area: 16,
            area_half: 64.0,
            deviation_half: 32.0,
        }
    }
}

/// Confidence in `[0, 1)`; non-decreasing in both area and mean deviation.
pub fn confidence(area: u64, mean_deviation: f32, config: &RegionConfig) -> f32 {
    let a = area as f32;
    let d = mean_deviation.max(0.0);
    let area_factor = a / (a + config.area_half.max(f32::MIN_POSITIVE));
    let dev_factor = d / (d + config.deviation_half.max(f32::MIN_POSITIVE));
    (area_factor * dev_factor).clamp(0.0, 1.0)
}

// ---- Union-find ----

struct DisjointSet {
    parent: Vec<u32>,
}

impl DisjointSet {
    fn new() -> Self {
        // Label 0 is background.
        Self { parent: vec![0] }
    }

    fn make(&mut self) -> u32 {
        let id = self.parent.len() as u32;
        self.parent.push(id);
        id
    }

    fn find(&mut self, mut x: u32) -> u32 {
        while self.parent[x as usize] != x {
            let grand = self.parent[self.parent[x as usize] as usize];
            self.parent[x as usize] = grand;
            x = grand;
        }
        x
    }

    /// Smaller root wins so representatives are stable.
    fn union(&mut self, a: u32, b: u32) {
        let (ra, rb) = (self.find(a), self.find(b));
        if ra != rb {
            let (lo, hi) = if ra < rb { (ra, rb) } else { (rb, ra) };
            self.parent[hi as usize] = lo;
        }
    }
}

#[derive(Clone, Copy)]
struct Accum {
    min_x: u32,
    min_y: u32,
    max_x: u32,
    max_y: u32,
    area: u64,
    deviation_sum: f64,
}

/// Label the mask and summarize each region at or above `min_defect_area`.
///
/// Output is ordered by label. Deterministic for identical inputs.
pub fn extract_regions(
    mask: &BinaryMask,
    map: &DifferenceMap,
    config: &RegionConfig,
) -> Vec<CandidateRegion> {
    let (w, h) = (mask.width() as usize, mask.height() as usize);
    let mut labels = vec![0u32; w * h];
    let mut sets = DisjointSet::new();

    // First pass: provisional labels from the already-visited neighbours
    // (W, NW, N, NE), recording equivalences.
    for y in 0..h {
        for x in 0..w {
            if !mask.cells()[y * w + x] {
                continue;
            }
            let mut neighbours = [0u32; 4];
            if x > 0 {
                neighbours[0] = labels[y * w + x - 1];
            }
            if y > 0 {
                let up = (y - 1) * w;
                if x > 0 {
                    neighbours[1] = labels[up + x - 1];
                }
                neighbours[2] = labels[up + x];
                if x + 1 < w {
                    neighbours[3] = labels[up + x + 1];
                }
            }
            let label = match neighbours.iter().copied().filter(|&l| l > 0).min() {
                None => sets.make(),
                Some(min) => {
                    for &n in neighbours.iter().filter(|&&l| l > 0) {
                        sets.union(min, n);
                    }
                    min
                }
            };
            labels[y * w + x] = label;
        }
    }

    // Second pass: resolve to compact labels in raster order and accumulate.
    let mut compact = vec![0u32; sets.parent.len()];
    let mut accums: Vec<Accum> = Vec::new();
    for y in 0..h {
        for x in 0..w {
            let provisional = labels[y * w + x];
            if provisional == 0 {
                continue;
            }
            let root = sets.find(provisional) as usize;
            if compact[root] == 0 {
                accums.push(Accum {
                    min_x: x as u32,
                    min_y: y as u32,
                    max_x: x as u32,
                    max_y: y as u32,
                    area: 0,
                    deviation_sum: 0.0,
                });
                compact[root] = accums.len() as u32;
            }
            let acc = &mut accums[compact[root] as usize - 1];
            acc.min_x = acc.min_x.min(x as u32);
            acc.max_x = acc.max_x.max(x as u32);
            acc.max_y = acc.max_y.max(y as u32);
            acc.area += 1;
            acc.deviation_sum += map.get(x as u32, y as u32).unwrap_or(0.0) as f64;
        }
    }

    accums
        .iter()
        .enumerate()
        .filter(|(_, a)| a.area >= config.min_defect_area)
        .map(|(i, a)| {
            let mean_deviation = (a.deviation_sum / a.area as f64) as f32;
            CandidateRegion {
                label: i as u32 + 1,
                bbox: BoundingBox::from_extents(a.min_x, a.min_y, a.max_x, a.max_y),
                area: a.area,
                mean_deviation,
                confidence: confidence(a.area, mean_deviation, config),
            }
        })
        .collect()
}
