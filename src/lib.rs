//! Golden-sample Inspection Kernel
//!
//! This crate implements a real-time defect-detection pipeline that compares a
//! live frame stream against a stored reference ("golden") sample and reports
//! stable defect regions with bounded latency. Everything runs on local
//! compute; there is no network dependency.
//!
//! # Architecture
//!
//! Frames flow through a fixed sequence of stages:
//!
//! 1. **Frame ring buffer**: bounded holding area with drop-oldest backpressure.
//! 2. **Alignment**: feature matching + RANSAC homography onto the reference grid.
//! 3. **Difference**: per-cell deviation between the aligned frame and the reference.
//! 4. **Threshold**: fixed or adaptive binarization into candidate cells.
//! 5. **Morphology**: opening then closing to remove noise and bridge gaps.
//! 6. **Region extraction**: 8-connected union-find labeling.
//! 7. **Temporal aggregation**: debouncing regions into confirmed defects.
//!
//! The pipeline scheduler wraps every stage transition with deadline and
//! cancellation checks and delivers results in frame order.
//!
//! # Module Structure
//!
//! - `frame`: Frame ownership (Frame, FrameRingBuffer, FrameHandle)
//! - `ingest`: Frame payloads, pixel normalization, synthetic sources
//! - `profile`: Reference profiles and the copy-on-write profile store
//! - `align`, `detect`, `track`: the per-frame stages
//! - `pipeline`: scheduler, workers, reordering, metrics, results

use serde::{Deserialize, Serialize};

pub mod align;
pub mod config;
pub mod detect;
pub mod error;
pub mod frame;
pub mod ingest;
pub mod luma;
pub mod pipeline;
pub mod profile;
pub mod track;

pub use align::{align_frame, Alignment, AlignmentConfig, Transform};
pub use config::{InspectdConfig, PipelineConfig};
pub use detect::{
    BinaryMask, CandidateRegion, DifferenceMap, DifferenceMode, RegionConfig, ThresholdMode,
};
pub use error::{AlignmentFailure, InspectError};
pub use frame::{Frame, FrameHandle, FrameId, FrameRingBuffer, PushOutcome};
pub use ingest::{FrameInput, PixelFormat, SyntheticConfig, SyntheticSource};
pub use luma::GrayImage;
pub use pipeline::{
    ComputeLanes, DetectionResult, DropReason, FrameStage, FrameStatus, MetricsSnapshot,
    Pipeline, ProfileStamp, ResultSubscription,
};
pub use profile::{InspectionParams, ProfileRecord, ProfileStore, ReferenceProfile};
pub use track::{Defect, DefectTracker, TrackerConfig};

/// Kernel name reported by `version()`.
pub const KERNEL_NAME: &str = "golden-sample inspection kernel";

/// Crate version baked in at build time.
pub const KERNEL_VERSION: &str = env!("CARGO_PKG_VERSION");

pub fn version() -> String {
    format!("{} v{}", KERNEL_NAME, KERNEL_VERSION)
}

// -------------------- Geometry --------------------

/// Axis-aligned box in reference-grid cells. `x`/`y` is the top-left cell.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl BoundingBox {
    pub fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// Box spanning the inclusive cell range `[min_x, max_x] x [min_y, max_y]`.
    pub fn from_extents(min_x: u32, min_y: u32, max_x: u32, max_y: u32) -> Self {
        Self {
            x: min_x,
            y: min_y,
            width: max_x.saturating_sub(min_x) + 1,
            height: max_y.saturating_sub(min_y) + 1,
        }
    }

    pub fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    /// Exclusive right edge.
    pub fn right(&self) -> u32 {
        self.x.saturating_add(self.width)
    }

    /// Exclusive bottom edge.
    pub fn bottom(&self) -> u32 {
        self.y.saturating_add(self.height)
    }

    pub fn intersection_area(&self, other: &BoundingBox) -> u64 {
        let left = self.x.max(other.x);
        let top = self.y.max(other.y);
        let right = self.right().min(other.right());
        let bottom = self.bottom().min(other.bottom());
        if right <= left || bottom <= top {
            return 0;
        }
        (right - left) as u64 * (bottom - top) as u64
    }

    /// Intersection over union in `[0, 1]`.
    pub fn iou(&self, other: &BoundingBox) -> f32 {
        let inter = self.intersection_area(other);
        if inter == 0 {
            return 0.0;
        }
        let union = self.area() + other.area() - inter;
        inter as f32 / union as f32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bounding_box_from_inclusive_extents() {
        let bbox = BoundingBox::from_extents(50, 50, 59, 59);
        assert_eq!(bbox, BoundingBox::new(50, 50, 10, 10));
        assert_eq!(bbox.area(), 100);
        assert_eq!(bbox.right(), 60);
    }

    #[test]
    fn iou_of_disjoint_and_nested_boxes() {
        let a = BoundingBox::new(0, 0, 10, 10);
        let b = BoundingBox::new(20, 20, 5, 5);
        let c = BoundingBox::new(0, 0, 5, 10);
        assert_eq!(a.iou(&b), 0.0);
        assert!((a.iou(&a) - 1.0).abs() < f32::EPSILON);
        assert!((a.iou(&c) - 0.5).abs() < 1e-6);
    }

    #[test]
    fn touching_boxes_do_not_overlap() {
        let a = BoundingBox::new(0, 0, 10, 10);
        let b = BoundingBox::new(10, 0, 10, 10);
        assert_eq!(a.intersection_area(&b), 0);
    }

    #[test]
    fn version_names_the_kernel() {
        assert!(version().starts_with(KERNEL_NAME));
        assert!(version().contains(KERNEL_VERSION));
    }
}
