//! Per-frame defect detection stages.
//!
//! difference -> threshold -> morphology -> regions. Each stage is a pure
//! function of its inputs; the pipeline runs them in order and checks the
//! frame's deadline between them.

mod difference;
mod morphology;
mod regions;
mod threshold;

pub use difference::{compute_difference, DifferenceMap, DifferenceMode};
pub use morphology::{close, denoise, dilate, erode, open};
pub use regions::{confidence, extract_regions, CandidateRegion, RegionConfig};
pub use threshold::{apply_threshold, otsu_cutoff, resolve_cutoff, ThresholdMode};

/// Candidate/background mask over the reference grid.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BinaryMask {
    width: u32,
    height: u32,
    cells: Vec<bool>,
}

impl BinaryMask {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            cells: vec![false; width as usize * height as usize],
        }
    }

    pub fn from_fn(width: u32, height: u32, mut f: impl FnMut(u32, u32) -> bool) -> Self {
        let mut cells = Vec::with_capacity(width as usize * height as usize);
        for y in 0..height {
            for x in 0..width {
                cells.push(f(x, y));
            }
        }
        Self {
            width,
            height,
            cells,
        }
    }

    pub(crate) fn from_cells(width: u32, height: u32, cells: Vec<bool>) -> Self {
        debug_assert_eq!(cells.len(), width as usize * height as usize);
        Self {
            width,
            height,
            cells,
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    #[inline]
    pub fn get(&self, x: u32, y: u32) -> bool {
        self.cells[y as usize * self.width as usize + x as usize]
    }

    pub fn set(&mut self, x: u32, y: u32, value: bool) {
        let idx = y as usize * self.width as usize + x as usize;
        self.cells[idx] = value;
    }

    pub fn cells(&self) -> &[bool] {
        &self.cells
    }

    pub fn count(&self) -> usize {
        self.cells.iter().filter(|&&c| c).count()
    }

    /// Clear every cell the difference map marks invalid.
    pub fn retain_valid(&mut self, map: &DifferenceMap) {
        for (cell, &valid) in self.cells.iter_mut().zip(map.validity()) {
            *cell &= valid;
        }
    }
}
