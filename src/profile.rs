//! Reference ("golden") profiles and the active-profile store.
//!
//! A `ReferenceProfile` is immutable once built. The `ProfileStore` holds
//! the active one behind an `Arc` and replaces it by whole-object swap:
//! frames in flight keep the snapshot they started with, new frames see the
//! new profile, and no reader ever observes a mix of the two.
//!
//! Profiles arrive from a storage collaborator, either fully formed or as a
//! `ProfileRecord` file naming the reference image.

use anyhow::Context;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, PoisonError, RwLock};

use crate::align::features::{detect_keypoints, Keypoint};
use crate::align::{uses_fixture_mode, AlignmentConfig};
use crate::config::PipelineConfig;
use crate::detect::ThresholdMode;
use crate::error::{InspectError, Result};
use crate::luma::GrayImage;

const MAX_KERNEL_RADIUS: usize = 32;
const MAX_MORPH_ITERATIONS: usize = 8;

// ---- Parameters ----

/// Per-product detection parameters carried by the profile.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InspectionParams {
    pub threshold: ThresholdMode,
    pub morph_kernel_radius: usize,
    pub morph_iterations: usize,
}

impl Default for InspectionParams {
    fn default() -> Self {
        Self {
            threshold: ThresholdMode::default(),
            morph_kernel_radius: 1,
            morph_iterations: 1,
        }
    }
}

impl InspectionParams {
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            threshold: config.threshold,
            morph_kernel_radius: config.morph_kernel_radius,
            morph_iterations: config.morph_iterations,
        }
    }

    pub fn validate(&self) -> Result<()> {
        self.threshold
            .validate()
            .map_err(InspectError::InvalidReferenceProfile)?;
        if self.morph_kernel_radius > MAX_KERNEL_RADIUS {
            return Err(InspectError::InvalidReferenceProfile(format!(
                "morph_kernel_radius {} exceeds {}",
                self.morph_kernel_radius, MAX_KERNEL_RADIUS
            )));
        }
        if self.morph_iterations == 0 || self.morph_iterations > MAX_MORPH_ITERATIONS {
            return Err(InspectError::InvalidReferenceProfile(format!(
                "morph_iterations must be in 1..={}",
                MAX_MORPH_ITERATIONS
            )));
        }
        Ok(())
    }
}

/// Product ids: lowercase, 1..=64 of `[a-z0-9_.:-]`, starting alphanumeric.
pub fn validate_product_id(product_id: &str) -> Result<()> {
    static PRODUCT_ID_RE: OnceLock<Option<regex::Regex>> = OnceLock::new();
    let re = PRODUCT_ID_RE.get_or_init(|| regex::Regex::new(r"^[a-z0-9][a-z0-9_.:-]{0,63}$").ok());
    match re {
        Some(re) if re.is_match(product_id) => Ok(()),
        _ => Err(InspectError::InvalidReferenceProfile(format!(
            "product id {:?} must match ^[a-z0-9][a-z0-9_.:-]{{0,63}}$",
            product_id
        ))),
    }
}

// ---- Profile ----

#[derive(Clone, Debug)]
pub struct ReferenceProfile {
    product_id: String,
    image: GrayImage,
    keypoints: Vec<Keypoint>,
    params: InspectionParams,
    fingerprint: [u8; 32],
}

impl ReferenceProfile {
    /// Build a profile from a golden image, extracting its keypoints with
    /// the same detector settings frames will be aligned with.
    pub fn new(
        product_id: impl Into<String>,
        image: GrayImage,
        params: InspectionParams,
        alignment: &AlignmentConfig,
    ) -> Result<Self> {
        let keypoints = detect_keypoints(&image, &alignment.features());
        Self::from_parts(product_id, image, keypoints, params)
    }

    /// Assemble a profile from stored parts. Keypoints must lie inside the image.
    pub fn from_parts(
        product_id: impl Into<String>,
        image: GrayImage,
        keypoints: Vec<Keypoint>,
        params: InspectionParams,
    ) -> Result<Self> {
        let product_id = product_id.into();
        validate_product_id(&product_id)?;
        params.validate()?;
        let (w, h) = (image.width() as f32, image.height() as f32);
        let inside = |kp: &&Keypoint| (0.0..w).contains(&kp.x) && (0.0..h).contains(&kp.y);
        if let Some(kp) = keypoints.iter().find(|kp| !inside(kp)) {
            return Err(InspectError::InvalidReferenceProfile(format!(
                "keypoint ({}, {}) lies outside the {}x{} reference",
                kp.x,
                kp.y,
                image.width(),
                image.height()
            )));
        }
        let fingerprint = fingerprint(&product_id, &image, &keypoints, &params);
        Ok(Self {
            product_id,
            image,
            keypoints,
            params,
            fingerprint,
        })
    }

    pub fn product_id(&self) -> &str {
        &self.product_id
    }

    pub fn image(&self) -> &GrayImage {
        &self.image
    }

    pub fn keypoints(&self) -> &[Keypoint] {
        &self.keypoints
    }

    pub fn params(&self) -> &InspectionParams {
        &self.params
    }

    /// SHA-256 over id, dimensions, pixels, keypoints and parameters.
    pub fn fingerprint(&self) -> &[u8; 32] {
        &self.fingerprint
    }

    pub fn fingerprint_hex(&self) -> String {
        hex::encode(self.fingerprint)
    }

    /// Check dimensional consistency with the expected frame size.
    pub fn validate_for(&self, width: u32, height: u32) -> Result<()> {
        if self.image.dimensions() != (width, height) {
            return Err(InspectError::InvalidReferenceProfile(format!(
                "reference is {}x{}, expected frame size is {}x{}",
                self.image.width(),
                self.image.height(),
                width,
                height
            )));
        }
        Ok(())
    }
}

fn fingerprint(
    product_id: &str,
    image: &GrayImage,
    keypoints: &[Keypoint],
    params: &InspectionParams,
) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(b"inspection-kernel/profile/v1");
    hasher.update((product_id.len() as u64).to_le_bytes());
    hasher.update(product_id.as_bytes());
    hasher.update(image.width().to_le_bytes());
    hasher.update(image.height().to_le_bytes());
    hasher.update(image.as_slice());
    hasher.update((keypoints.len() as u64).to_le_bytes());
    for kp in keypoints {
        hasher.update(kp.x.to_le_bytes());
        hasher.update(kp.y.to_le_bytes());
        for word in kp.descriptor.0 {
            hasher.update(word.to_le_bytes());
        }
    }
    match params.threshold {
        ThresholdMode::Fixed { cutoff } => {
            hasher.update([0u8]);
            hasher.update(cutoff.to_le_bytes());
        }
        ThresholdMode::Adaptive { min_cutoff } => {
            hasher.update([1u8]);
            hasher.update(min_cutoff.to_le_bytes());
        }
    }
    hasher.update((params.morph_kernel_radius as u64).to_le_bytes());
    hasher.update((params.morph_iterations as u64).to_le_bytes());
    hasher.finalize().into()
}

// ---- Store ----

/// The active profile and the generation it was installed as.
#[derive(Debug)]
pub struct ActiveProfile {
    pub profile: ReferenceProfile,
    pub generation: u64,
}

/// Holder of the active profile; swaps are whole-object and atomic.
pub struct ProfileStore {
    active: RwLock<Arc<ActiveProfile>>,
    generation: AtomicU64,
    frame_width: u32,
    frame_height: u32,
    alignment: AlignmentConfig,
}

impl ProfileStore {
    /// Install the initial profile as generation 1.
    pub fn new(
        initial: ReferenceProfile,
        frame_width: u32,
        frame_height: u32,
        alignment: AlignmentConfig,
    ) -> Result<Self> {
        initial.validate_for(frame_width, frame_height)?;
        let store = Self {
            active: RwLock::new(Arc::new(ActiveProfile {
                profile: initial,
                generation: 1,
            })),
            generation: AtomicU64::new(1),
            frame_width,
            frame_height,
            alignment,
        };
        store.log_activation(&store.snapshot());
        Ok(store)
    }

    /// Current profile snapshot; stays valid after later swaps.
    pub fn snapshot(&self) -> Arc<ActiveProfile> {
        self.active
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Generation of the active profile. Starts at 1.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Validate and activate `next`. A rejected profile leaves the active
    /// one in force. Returns the new generation.
    pub fn swap(&self, next: ReferenceProfile) -> Result<u64> {
        if let Err(e) = next.validate_for(self.frame_width, self.frame_height) {
            log::warn!("profile {} rejected: {}", next.product_id(), e);
            return Err(e);
        }
        let installed = {
            let mut guard = self.active.write().unwrap_or_else(PoisonError::into_inner);
            let generation = guard.generation + 1;
            let installed = Arc::new(ActiveProfile {
                profile: next,
                generation,
            });
            *guard = installed.clone();
            self.generation.store(generation, Ordering::Release);
            installed
        };
        self.log_activation(&installed);
        Ok(installed.generation)
    }

    fn log_activation(&self, active: &ActiveProfile) {
        let p = &active.profile;
        log::info!(
            "profile {} active (generation {}, {} keypoints, fingerprint {})",
            p.product_id(),
            active.generation,
            p.keypoints().len(),
            &p.fingerprint_hex()[..16]
        );
        if uses_fixture_mode(p.keypoints().len(), &self.alignment) {
            log::warn!(
                "profile {} has {} keypoints (< {}); frames align by fixture (identity)",
                p.product_id(),
                p.keypoints().len(),
                self.alignment.min_matches
            );
        }
    }
}

// ---- Records ----

/// On-disk profile description (JSON, or TOML by extension).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProfileRecord {
    pub product_id: String,
    /// Reference image; relative paths resolve against the record's directory.
    pub image_path: PathBuf,
    #[serde(default)]
    pub threshold: Option<ThresholdMode>,
    #[serde(default)]
    pub morph_kernel_radius: Option<usize>,
    #[serde(default)]
    pub morph_iterations: Option<usize>,
}

impl ProfileRecord {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("read profile record {}", path.display()))?;
        let mut record: ProfileRecord = if path.extension().and_then(|e| e.to_str()) == Some("toml") {
            toml::from_str(&raw).with_context(|| format!("parse {}", path.display()))?
        } else {
            serde_json::from_str(&raw).with_context(|| format!("parse {}", path.display()))?
        };
        if record.image_path.is_relative() {
            if let Some(dir) = path.parent() {
                record.image_path = dir.join(&record.image_path);
            }
        }
        Ok(record)
    }

    /// Record overrides applied over the config's defaults.
    pub fn params(&self, config: &PipelineConfig) -> InspectionParams {
        let base = InspectionParams::from_config(config);
        InspectionParams {
            threshold: self.threshold.unwrap_or(base.threshold),
            morph_kernel_radius: self.morph_kernel_radius.unwrap_or(base.morph_kernel_radius),
            morph_iterations: self.morph_iterations.unwrap_or(base.morph_iterations),
        }
    }

    /// Decode the reference image and build the profile.
    pub fn into_profile(self, config: &PipelineConfig) -> anyhow::Result<ReferenceProfile> {
        let image = load_reference_image(&self.image_path)?;
        let params = self.params(config);
        Ok(ReferenceProfile::new(
            self.product_id,
            image,
            params,
            &config.alignment,
        )?)
    }
}

#[cfg(feature = "image-io")]
pub fn load_reference_image(path: &Path) -> anyhow::Result<GrayImage> {
    let decoded = image::open(path)
        .with_context(|| format!("decode reference image {}", path.display()))?
        .to_luma8();
    let (w, h) = decoded.dimensions();
    Ok(GrayImage::new(w, h, decoded.into_raw())?)
}

#[cfg(not(feature = "image-io"))]
pub fn load_reference_image(path: &Path) -> anyhow::Result<GrayImage> {
    Err(anyhow::anyhow!(
        "cannot decode {}: built without the image-io feature",
        path.display()
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::synthetic::{render_scene, SceneKind};

    fn textured() -> GrayImage {
        render_scene(
            SceneKind::Blocks {
                block_size: 8,
                seed: 3,
            },
            96,
            64,
        )
    }

    fn profile(id: &str, image: GrayImage) -> Result<ReferenceProfile> {
        ReferenceProfile::new(id, image, InspectionParams::default(), &AlignmentConfig::default())
    }

    #[test]
    fn product_ids_are_validated() {
        assert!(validate_product_id("widget-a").is_ok());
        assert!(validate_product_id("line3:part_7.b").is_ok());
        assert!(validate_product_id("").is_err());
        assert!(validate_product_id("Widget").is_err());
        assert!(validate_product_id("a/b").is_err());
        assert!(validate_product_id(&"a".repeat(65)).is_err());
    }

    #[test]
    fn fingerprint_tracks_content() {
        let a = profile("widget-a", textured()).unwrap();
        let b = profile("widget-a", textured()).unwrap();
        assert_eq!(a.fingerprint(), b.fingerprint());
        let mut changed = textured();
        changed.set(0, 0, changed.get(0, 0).wrapping_add(1));
        let c = profile("widget-a", changed).unwrap();
        assert_ne!(a.fingerprint(), c.fingerprint());
        let d = profile("widget-b", textured()).unwrap();
        assert_ne!(a.fingerprint(), d.fingerprint());
    }

    #[test]
    fn keypoints_outside_image_are_rejected() {
        let image = GrayImage::filled(10, 10, 0);
        let kp = Keypoint {
            x: 12.0,
            y: 1.0,
            score: 1.0,
            descriptor: Default::default(),
        };
        let err = ReferenceProfile::from_parts("widget-a", image, vec![kp], InspectionParams::default())
            .unwrap_err();
        assert!(matches!(err, InspectError::InvalidReferenceProfile(_)));
    }

    #[test]
    fn swap_bumps_generation_and_keeps_snapshots() {
        let store = ProfileStore::new(
            profile("widget-a", textured()).unwrap(),
            96,
            64,
            AlignmentConfig::default(),
        )
        .unwrap();
        let before = store.snapshot();
        assert_eq!(before.generation, 1);

        let gen = store.swap(profile("widget-b", textured()).unwrap()).unwrap();
        assert_eq!(gen, 2);
        assert_eq!(store.generation(), 2);
        assert_eq!(store.snapshot().profile.product_id(), "widget-b");
        // The old snapshot is untouched.
        assert_eq!(before.profile.product_id(), "widget-a");
    }

    #[test]
    fn mismatched_profile_is_rejected_without_disturbing_active() {
        let store = ProfileStore::new(
            profile("widget-a", textured()).unwrap(),
            96,
            64,
            AlignmentConfig::default(),
        )
        .unwrap();
        let wrong = profile("widget-b", GrayImage::filled(64, 64, 1)).unwrap();
        assert!(matches!(
            store.swap(wrong),
            Err(InspectError::InvalidReferenceProfile(_))
        ));
        assert_eq!(store.generation(), 1);
        assert_eq!(store.snapshot().profile.product_id(), "widget-a");
    }

    #[test]
    fn invalid_params_are_rejected() {
        let params = InspectionParams {
            morph_iterations: 0,
            ..InspectionParams::default()
        };
        assert!(ReferenceProfile::new("widget-a", textured(), params, &AlignmentConfig::default()).is_err());
    }

    #[test]
    fn record_resolves_relative_image_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("widget.toml");
        std::fs::write(
            &path,
            "product_id = \"widget-a\"\nimage_path = \"golden.png\"\nmorph_kernel_radius = 2\n\n[threshold]\nmode = \"adaptive\"\nmin_cutoff = 18.0\n",
        )
        .unwrap();
        let record = ProfileRecord::load(&path).unwrap();
        assert_eq!(record.image_path, dir.path().join("golden.png"));
        let params = record.params(&PipelineConfig::default());
        assert_eq!(params.morph_kernel_radius, 2);
        assert_eq!(params.threshold, ThresholdMode::Adaptive { min_cutoff: 18.0 });
        assert_eq!(params.morph_iterations, PipelineConfig::default().morph_iterations);
    }
}
