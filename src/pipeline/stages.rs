//! The per-frame stage sequence, from alignment to region extraction.

use crate::align::{align_frame, Alignment};
use crate::config::PipelineConfig;
use crate::detect::{apply_threshold, compute_difference, denoise, extract_regions, CandidateRegion};
use crate::error::Result;
use crate::luma::GrayImage;
use crate::profile::ReferenceProfile;

use super::lanes::ComputeLanes;
use super::state::{FrameStage, StageGate, Ungated};

/// Everything one frame produced before temporal aggregation.
#[derive(Clone, Debug)]
pub struct FrameInspection {
    pub alignment: Alignment,
    /// Threshold cutoff actually applied (resolved per frame in adaptive mode).
    pub cutoff: f32,
    pub regions: Vec<CandidateRegion>,
}

pub(crate) fn run_stages(
    image: &GrayImage,
    profile: &ReferenceProfile,
    config: &PipelineConfig,
    lanes: &ComputeLanes,
    gate: &mut dyn StageGate,
) -> Result<FrameInspection> {
    gate.enter(FrameStage::Aligning)?;
    let alignment = align_frame(image, profile, &config.alignment)?;

    gate.enter(FrameStage::Differencing)?;
    let map = compute_difference(
        image,
        profile.image(),
        &alignment.transform,
        config.difference_mode,
        lanes,
    );

    gate.enter(FrameStage::Thresholding)?;
    let params = profile.params();
    let (mask, cutoff) = apply_threshold(&map, params.threshold);

    gate.enter(FrameStage::Filtering)?;
    let mut mask = denoise(&mask, params.morph_kernel_radius, params.morph_iterations, lanes);
    // Dilation may grow into cells the frame does not cover.
    mask.retain_valid(&map);

    gate.enter(FrameStage::Extracting)?;
    let regions = extract_regions(&mask, &map, &config.region_config());

    Ok(FrameInspection {
        alignment,
        cutoff,
        regions,
    })
}

/// Run one frame through alignment, difference, threshold, morphology and
/// region extraction against `profile`, without scheduling.
///
/// Deterministic: the same frame, profile and config always produce the
/// same regions.
pub fn inspect_frame(
    image: &GrayImage,
    profile: &ReferenceProfile,
    config: &PipelineConfig,
    lanes: &ComputeLanes,
) -> Result<FrameInspection> {
    run_stages(image, profile, config, lanes, &mut Ungated)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{AlignmentFailure, InspectError};
    use crate::profile::InspectionParams;
    use crate::BoundingBox;

    fn setup() -> (ReferenceProfile, PipelineConfig, ComputeLanes) {
        let config = PipelineConfig {
            frame_width: 64,
            frame_height: 64,
            ..PipelineConfig::default()
        };
        let profile = ReferenceProfile::new(
            "flat-panel",
            GrayImage::filled(64, 64, 100),
            InspectionParams::from_config(&config),
            &config.alignment,
        )
        .unwrap();
        (profile, config, ComputeLanes::new(1, 2).unwrap())
    }

    #[test]
    fn deviation_patch_becomes_one_region() {
        let (profile, config, lanes) = setup();
        let frame = GrayImage::from_fn(64, 64, |x, y| {
            if (20..30).contains(&x) && (10..20).contains(&y) {
                200
            } else {
                100
            }
        });
        let out = inspect_frame(&frame, &profile, &config, &lanes).unwrap();
        assert_eq!(out.cutoff, 40.0);
        assert_eq!(out.regions.len(), 1);
        assert_eq!(out.regions[0].bbox, BoundingBox::new(20, 10, 10, 10));
        assert_eq!(out.regions[0].area, 100);
        assert_eq!(out.regions[0].mean_deviation, 100.0);
    }

    #[test]
    fn small_specks_fall_below_noise_floor() {
        let (profile, config, lanes) = setup();
        let frame = GrayImage::from_fn(64, 64, |x, y| if (x + y) % 17 == 0 { 255 } else { 100 });
        let out = inspect_frame(&frame, &profile, &config, &lanes).unwrap();
        assert!(out.regions.is_empty());
    }

    #[test]
    fn size_mismatch_fails_alignment() {
        let (profile, config, lanes) = setup();
        let frame = GrayImage::filled(32, 64, 100);
        let err = inspect_frame(&frame, &profile, &config, &lanes).unwrap_err();
        assert!(matches!(
            err,
            InspectError::AlignmentFailure(AlignmentFailure::DimensionMismatch { .. })
        ));
    }
}
