//! Frame-to-reference alignment.
//!
//! A captured frame is registered against the active reference profile by a
//! planar homography estimated from matched corner features. Alignment
//! fails (and the frame is reported `AlignmentFailed`) when too few features
//! match, when the fitted model's reprojection error exceeds the configured
//! bound, or when the fitted transform is not invertible.
//!
//! References with too little texture to carry features (a flat golden
//! sample, say) are handled in fixture mode: the part is assumed to sit in
//! a mechanical fixture and the transform is the identity, provided the
//! frame has the reference's dimensions.

pub mod features;
pub mod homography;
pub mod matching;

use nalgebra::Matrix3;
use serde::{Deserialize, Serialize};

use crate::error::AlignmentFailure;
use crate::luma::GrayImage;
use crate::profile::ReferenceProfile;
use features::{detect_keypoints, FeatureConfig};
use homography::{fit_homography_ransac, project, HomographyError, RansacConfig};
use matching::{match_keypoints, MatchConfig};

const MIN_ABS_DETERMINANT: f64 = 1e-9;
const IDENTITY_TOLERANCE: f64 = 1e-6;

// ---- Configuration ----

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AlignmentConfig {
    /// Upper bound on the RMS reprojection error of the fitted model, in pixels.
    pub max_reprojection_error: f64,
    /// Matches (and RANSAC inliers) required for a usable model.
    pub min_matches: usize,
    pub ransac_iterations: usize,
    /// Per-correspondence inlier tolerance, in pixels.
    pub inlier_tolerance: f64,
    pub fast_threshold: u8,
    pub max_features: usize,
    pub max_descriptor_distance: u32,
    pub match_ratio: f32,
    pub seed: u64,
}

impl Default for AlignmentConfig {
    fn default() -> Self {
        Self {
            max_reprojection_error: 2.0,
            min_matches: 12,
            ransac_iterations: 500,
            inlier_tolerance: 3.0,
            fast_threshold: 20,
            max_features: 500,
            max_descriptor_distance: 40,
            match_ratio: 0.8,
            seed: 0x5eed,
        }
    }
}

impl AlignmentConfig {
    pub fn features(&self) -> FeatureConfig {
        FeatureConfig {
            fast_threshold: self.fast_threshold,
            max_features: self.max_features,
        }
    }

    fn matching(&self) -> MatchConfig {
        MatchConfig {
            max_distance: self.max_descriptor_distance,
            ratio: self.match_ratio,
        }
    }

    fn ransac(&self) -> RansacConfig {
        RansacConfig {
            max_iters: self.ransac_iterations,
            inlier_threshold: self.inlier_tolerance,
            min_inliers: self.min_matches,
            seed: self.seed,
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if !(self.max_reprojection_error.is_finite() && self.max_reprojection_error > 0.0) {
            return Err("alignment_max_reprojection_error must be > 0".into());
        }
        if self.min_matches < 4 {
            return Err("alignment min_matches must be >= 4".into());
        }
        if self.ransac_iterations == 0 {
            return Err("alignment ransac_iterations must be >= 1".into());
        }
        if !(self.inlier_tolerance.is_finite() && self.inlier_tolerance > 0.0) {
            return Err("alignment inlier_tolerance must be > 0".into());
        }
        if self.max_features < self.min_matches {
            return Err("alignment max_features must be >= min_matches".into());
        }
        if !(self.match_ratio > 0.0 && self.match_ratio <= 1.0) {
            return Err("alignment match_ratio must be in (0, 1]".into());
        }
        Ok(())
    }
}

// ---- Transform ----

/// Invertible planar transform from frame coordinates to reference
/// coordinates. The inverse is kept alongside for warping.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Transform {
    to_reference: Matrix3<f64>,
    to_frame: Matrix3<f64>,
}

impl Transform {
    pub fn identity() -> Self {
        Self {
            to_reference: Matrix3::identity(),
            to_frame: Matrix3::identity(),
        }
    }

    pub fn translation(dx: f64, dy: f64) -> Self {
        Self {
            to_reference: Matrix3::new(1.0, 0.0, dx, 0.0, 1.0, dy, 0.0, 0.0, 1.0),
            to_frame: Matrix3::new(1.0, 0.0, -dx, 0.0, 1.0, -dy, 0.0, 0.0, 1.0),
        }
    }

    /// Build from a frame-to-reference matrix; fails when it is singular.
    pub fn from_matrix(m: Matrix3<f64>) -> Result<Self, AlignmentFailure> {
        let scale = m[(2, 2)];
        let m = if scale.abs() > f64::EPSILON { m / scale } else { m };
        if !m.iter().all(|v| v.is_finite()) || m.determinant().abs() <= MIN_ABS_DETERMINANT {
            return Err(AlignmentFailure::NonInvertible);
        }
        let inverse = m.try_inverse().ok_or(AlignmentFailure::NonInvertible)?;
        if !inverse.iter().all(|v| v.is_finite()) {
            return Err(AlignmentFailure::NonInvertible);
        }
        Ok(Self {
            to_reference: m,
            to_frame: inverse,
        })
    }

    pub fn matrix(&self) -> &Matrix3<f64> {
        &self.to_reference
    }

    pub fn inverse_matrix(&self) -> &Matrix3<f64> {
        &self.to_frame
    }

    /// Map a frame pixel into reference coordinates.
    pub fn to_reference(&self, x: f64, y: f64) -> Option<[f64; 2]> {
        project(&self.to_reference, x, y)
    }

    /// Map a reference pixel into frame coordinates.
    pub fn to_frame(&self, x: f64, y: f64) -> Option<[f64; 2]> {
        project(&self.to_frame, x, y)
    }

    /// Identity up to numerical noise from the fit.
    pub fn is_identity(&self) -> bool {
        (self.to_reference - Matrix3::identity())
            .iter()
            .all(|v| v.abs() < IDENTITY_TOLERANCE)
    }
}

// ---- Alignment ----

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlignmentMode {
    /// Homography fitted from matched features.
    Features,
    /// Identity; the reference carries too few features to register against.
    Fixture,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Alignment {
    pub transform: Transform,
    pub mode: AlignmentMode,
    pub matches: usize,
    pub inliers: usize,
    /// RMS reprojection error of the inliers, in pixels.
    pub reprojection_error: f64,
}

/// Whether a reference with `keypoint_count` features aligns by fixture.
pub fn uses_fixture_mode(keypoint_count: usize, config: &AlignmentConfig) -> bool {
    keypoint_count < config.min_matches
}

/// Register `frame` against `profile`.
pub fn align_frame(
    frame: &GrayImage,
    profile: &ReferenceProfile,
    config: &AlignmentConfig,
) -> Result<Alignment, AlignmentFailure> {
    let reference = profile.image();

    if uses_fixture_mode(profile.keypoints().len(), config) {
        if frame.dimensions() != reference.dimensions() {
            return Err(AlignmentFailure::DimensionMismatch {
                frame_width: frame.width(),
                frame_height: frame.height(),
                reference_width: reference.width(),
                reference_height: reference.height(),
            });
        }
        return Ok(Alignment {
            transform: Transform::identity(),
            mode: AlignmentMode::Fixture,
            matches: 0,
            inliers: 0,
            reprojection_error: 0.0,
        });
    }

    let frame_kps = detect_keypoints(frame, &config.features());
    let matches = match_keypoints(&frame_kps, profile.keypoints(), &config.matching());
    if matches.len() < config.min_matches {
        return Err(AlignmentFailure::InsufficientMatches {
            needed: config.min_matches,
            found: matches.len(),
        });
    }

    let (src, dst): (Vec<[f64; 2]>, Vec<[f64; 2]>) = matches
        .iter()
        .map(|m| {
            let f = &frame_kps[m.frame_idx];
            let r = &profile.keypoints()[m.reference_idx];
            ([f.x as f64, f.y as f64], [r.x as f64, r.y as f64])
        })
        .unzip();

    let fit = fit_homography_ransac(&src, &dst, &config.ransac()).map_err(|e| match e {
        HomographyError::InsufficientInliers { needed, found } => {
            AlignmentFailure::InsufficientMatches { needed, found }
        }
        HomographyError::TooFewPoints { needed, got } => {
            AlignmentFailure::InsufficientMatches { needed, found: got }
        }
        HomographyError::NumericalFailure(_) => AlignmentFailure::NonInvertible,
    })?;

    if fit.rms_error > config.max_reprojection_error {
        return Err(AlignmentFailure::ReprojectionError {
            error_px: fit.rms_error,
            bound_px: config.max_reprojection_error,
        });
    }

    let transform = Transform::from_matrix(fit.h)?;
    log::trace!(
        "aligned: {} matches, {} inliers, rms {:.3}px",
        matches.len(),
        fit.n_inliers,
        fit.rms_error
    );

    Ok(Alignment {
        transform,
        mode: AlignmentMode::Features,
        matches: matches.len(),
        inliers: fit.n_inliers,
        reprojection_error: fit.rms_error,
    })
}
