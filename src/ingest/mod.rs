//! Frame ingestion boundary.
//!
//! Camera acquisition lives outside the kernel. Capture collaborators hand
//! over a `FrameInput` (dimensions, capture timestamp, pixel buffer); the
//! pipeline validates it, reduces it to luma, and copies it into a recycled
//! ring-buffer slot.
//!
//! The `synthetic` source produces deterministic `stub://` scenes for the
//! daemon and for tests.
//!
//! The ingestion layer MUST NOT:
//! - Manage camera lifecycle
//! - Register callbacks inside the core (frames arrive by explicit push)
//! - Log pixel content

mod normalize;
pub mod synthetic;

use std::time::Duration;

pub use normalize::PixelFormat;
pub(crate) use normalize::copy_luma;
pub use synthetic::{SceneKind, SyntheticConfig, SyntheticDefect, SyntheticSource};

/// A captured frame as handed over by the capture collaborator.
#[derive(Clone, Debug)]
pub struct FrameInput {
    pub width: u32,
    pub height: u32,
    /// Capture timestamp relative to the capture collaborator's epoch.
    pub timestamp: Duration,
    pub format: PixelFormat,
    pub pixels: Vec<u8>,
}

/// Validate a frame payload's buffer length against its size and format.
pub fn validate_input(input: &FrameInput) -> anyhow::Result<()> {
    normalize::validate_len(&input.pixels, input.width, input.height, input.format)
}

impl FrameInput {
    pub fn gray(width: u32, height: u32, timestamp: Duration, pixels: Vec<u8>) -> Self {
        Self {
            width,
            height,
            timestamp,
            format: PixelFormat::Gray8,
            pixels,
        }
    }
}
