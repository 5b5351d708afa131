use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::AlignmentFailure;
use crate::frame::FrameId;
use crate::profile::ActiveProfile;
use crate::track::Defect;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameStatus {
    Ok,
    AlignmentFailed,
    Dropped,
}

/// Why a frame resolved as `Dropped`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DropReason {
    /// Evicted from the ring by a newer frame before a worker took it.
    Evicted,
    /// Every ring slot was in flight when the frame arrived.
    Rejected,
    /// A stage boundary was reached after the frame deadline.
    Deadline,
    /// The reference profile was replaced while aligning or differencing.
    Cancelled,
    /// Finished against a profile that a later frame had already replaced.
    Stale,
    /// The run ended on an unexpected stage error.
    Fault,
}

/// Identity of the profile snapshot a result was computed against.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileStamp {
    pub product_id: String,
    pub generation: u64,
    /// Hex SHA-256 profile fingerprint.
    pub fingerprint: String,
}

impl ProfileStamp {
    pub fn of(active: &ActiveProfile) -> Self {
        Self {
            product_id: active.profile.product_id().to_string(),
            generation: active.generation,
            fingerprint: active.profile.fingerprint_hex(),
        }
    }
}

/// One result per admitted frame, delivered in frame order.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DetectionResult {
    pub frame_id: FrameId,
    /// Capture timestamp of the frame.
    pub timestamp: Duration,
    pub status: FrameStatus,
    /// Confirmed defects after this frame. Empty unless `status` is `Ok`.
    pub defects: Vec<Defect>,
    /// Admission to delivery.
    pub processing_latency: Duration,
    /// Absent for frames dropped before any profile was read.
    pub profile: Option<ProfileStamp>,
    pub drop_reason: Option<DropReason>,
    #[serde(skip)]
    pub alignment_failure: Option<AlignmentFailure>,
}

impl DetectionResult {
    pub fn is_ok(&self) -> bool {
        self.status == FrameStatus::Ok
    }

    pub fn dropped(
        frame_id: FrameId,
        timestamp: Duration,
        processing_latency: Duration,
        reason: DropReason,
        profile: Option<ProfileStamp>,
    ) -> Self {
        Self {
            frame_id,
            timestamp,
            status: FrameStatus::Dropped,
            defects: Vec::new(),
            processing_latency,
            profile,
            drop_reason: Some(reason),
            alignment_failure: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dropped_results_serialize_with_reason() {
        let result = DetectionResult::dropped(
            4,
            Duration::from_millis(300),
            Duration::from_millis(2),
            DropReason::Evicted,
            None,
        );
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["status"], "dropped");
        assert_eq!(json["drop_reason"], "evicted");
        assert!(json["defects"].as_array().unwrap().is_empty());
        assert!(!result.is_ok());
    }
}
