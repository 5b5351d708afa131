//! Error taxonomy for the inspection pipeline.
//!
//! Per-frame errors (`AlignmentFailure`, `FrameTimeout`, `Cancelled`) are
//! recovered inside the pipeline and surface as a `DetectionResult` status.
//! `InvalidReferenceProfile` rejects a load request without touching the
//! active profile. `InvalidConfig` is fatal at startup.

use thiserror::Error;

use crate::frame::FrameId;
use crate::pipeline::FrameStage;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum InspectError {
    #[error("alignment failed: {0}")]
    AlignmentFailure(#[from] AlignmentFailure),

    #[error("frame {frame_id} exceeded its deadline while {stage}")]
    FrameTimeout { frame_id: FrameId, stage: FrameStage },

    #[error("frame {frame_id} cancelled: reference profile replaced while {stage}")]
    Cancelled { frame_id: FrameId, stage: FrameStage },

    #[error("invalid reference profile: {0}")]
    InvalidReferenceProfile(String),

    #[error("ring buffer exhausted: frame {frame_id} dropped")]
    ResourceExhaustion { frame_id: FrameId },

    #[error("invalid frame: {0}")]
    InvalidFrame(String),

    #[error("invalid pipeline configuration: {0}")]
    InvalidConfig(String),

    #[error("illegal frame transition {from} -> {to}")]
    IllegalTransition { from: FrameStage, to: FrameStage },

    #[error("failed to start pipeline thread: {0}")]
    ThreadSpawn(String),

    #[error("pipeline is shut down")]
    ShutDown,
}

/// Why a captured frame could not be mapped onto the reference grid.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AlignmentFailure {
    #[error("too few feature matches: need {needed}, found {found}")]
    InsufficientMatches { needed: usize, found: usize },

    #[error("reprojection error {error_px:.3}px exceeds bound {bound_px:.3}px")]
    ReprojectionError { error_px: f64, bound_px: f64 },

    #[error("estimated transform is not invertible")]
    NonInvertible,

    #[error("frame is {frame_width}x{frame_height}, reference is {reference_width}x{reference_height}")]
    DimensionMismatch {
        frame_width: u32,
        frame_height: u32,
        reference_width: u32,
        reference_height: u32,
    },
}

pub type Result<T> = std::result::Result<T, InspectError>;
