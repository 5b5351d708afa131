//! Temporal aggregation of candidate regions into defects.
//!
//! A region that persists at an overlapping location for `confirm_frames`
//! consecutive observed frames becomes a confirmed defect. A confirmed
//! defect is retired after `retire_frames` consecutive observed frames
//! without a matching region, and is still reported during that grace
//! window. Pending tracks that miss a single frame are discarded.
//!
//! Only frames that reached region extraction are observed; frames that
//! failed alignment or were dropped neither extend nor break a streak.

use serde::{Deserialize, Serialize};

use crate::detect::CandidateRegion;
use crate::frame::FrameId;
use crate::BoundingBox;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TrackerConfig {
    /// Consecutive matched frames before a defect is confirmed.
    pub confirm_frames: u32,
    /// Consecutive missed frames before a confirmed defect is retired.
    pub retire_frames: u32,
    /// Minimum bounding-box IoU for a region to continue a track.
    pub min_overlap: f32,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            confirm_frames: 3,
            retire_frames: 3,
            min_overlap: 0.3,
        }
    }
}

/// A confirmed defect as reported in a `DetectionResult`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Defect {
    pub id: u64,
    pub bbox: BoundingBox,
    pub area: u64,
    pub confidence: f32,
    pub first_seen_frame: FrameId,
    pub last_seen_frame: FrameId,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum TrackState {
    Pending,
    Confirmed,
}

#[derive(Clone, Debug)]
struct Track {
    id: u64,
    state: TrackState,
    bbox: BoundingBox,
    area: u64,
    confidence: f32,
    first_seen: FrameId,
    last_seen: FrameId,
    streak: u32,
    misses: u32,
}

impl Track {
    fn snapshot(&self) -> Defect {
        Defect {
            id: self.id,
            bbox: self.bbox,
            area: self.area,
            confidence: self.confidence,
            first_seen_frame: self.first_seen,
            last_seen_frame: self.last_seen,
        }
    }

    fn absorb(&mut self, frame_id: FrameId, region: &CandidateRegion) {
        self.bbox = region.bbox;
        self.area = region.area;
        self.confidence = region.confidence;
        self.last_seen = frame_id;
        self.streak = self.streak.saturating_add(1);
        self.misses = 0;
    }
}

pub struct DefectTracker {
    config: TrackerConfig,
    tracks: Vec<Track>,
    next_id: u64,
}

impl DefectTracker {
    pub fn new(config: TrackerConfig) -> Self {
        Self {
            config,
            tracks: Vec::new(),
            next_id: 1,
        }
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    /// Forget every track. Defect ids keep increasing.
    pub fn reset(&mut self) {
        self.tracks.clear();
    }

    pub fn pending_count(&self) -> usize {
        self.tracks
            .iter()
            .filter(|t| t.state == TrackState::Pending)
            .count()
    }

    pub fn confirmed_count(&self) -> usize {
        self.tracks
            .iter()
            .filter(|t| t.state == TrackState::Confirmed)
            .count()
    }

    /// Fold one observed frame's regions into the tracks and return the
    /// confirmed defects, ordered by id.
    pub fn update(&mut self, frame_id: FrameId, regions: &[CandidateRegion]) -> Vec<Defect> {
        // Greedy assignment by descending IoU.
        let mut pairs: Vec<(usize, usize, f32)> = Vec::new();
        for (ti, track) in self.tracks.iter().enumerate() {
            for (ri, region) in regions.iter().enumerate() {
                let iou = track.bbox.iou(&region.bbox);
                if iou >= self.config.min_overlap && iou > 0.0 {
                    pairs.push((ti, ri, iou));
                }
            }
        }
        pairs.sort_by(|a, b| {
            b.2.total_cmp(&a.2)
                .then_with(|| a.0.cmp(&b.0))
                .then_with(|| a.1.cmp(&b.1))
        });

        let mut track_matched = vec![false; self.tracks.len()];
        let mut region_matched = vec![false; regions.len()];
        for (ti, ri, _) in pairs {
            if track_matched[ti] || region_matched[ri] {
                continue;
            }
            track_matched[ti] = true;
            region_matched[ri] = true;
            self.tracks[ti].absorb(frame_id, &regions[ri]);
        }

        let confirm = self.config.confirm_frames;
        let retire = self.config.retire_frames;
        let mut kept = Vec::with_capacity(self.tracks.len());
        for (mut track, matched) in self.tracks.drain(..).zip(track_matched) {
            if matched {
                if track.state == TrackState::Pending && track.streak >= confirm {
                    track.state = TrackState::Confirmed;
                    log::debug!(
                        "defect {} confirmed at frame {} ({}x{} at {},{})",
                        track.id,
                        frame_id,
                        track.bbox.width,
                        track.bbox.height,
                        track.bbox.x,
                        track.bbox.y
                    );
                }
                kept.push(track);
                continue;
            }
            match track.state {
                TrackState::Pending => {}
                TrackState::Confirmed => {
                    track.misses += 1;
                    track.streak = 0;
                    if track.misses >= retire {
                        log::debug!("defect {} retired at frame {}", track.id, frame_id);
                    } else {
                        kept.push(track);
                    }
                }
            }
        }
        self.tracks = kept;

        for (region, _) in regions.iter().zip(region_matched).filter(|(_, m)| !m) {
            let state = if confirm <= 1 {
                TrackState::Confirmed
            } else {
                TrackState::Pending
            };
            self.tracks.push(Track {
                id: self.next_id,
                state,
                bbox: region.bbox,
                area: region.area,
                confidence: region.confidence,
                first_seen: frame_id,
                last_seen: frame_id,
                streak: 1,
                misses: 0,
            });
            self.next_id += 1;
        }

        let mut confirmed: Vec<Defect> = self
            .tracks
            .iter()
            .filter(|t| t.state == TrackState::Confirmed)
            .map(Track::snapshot)
            .collect();
        confirmed.sort_by_key(|d| d.id);
        confirmed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn region(x: u32, y: u32, w: u32, h: u32) -> CandidateRegion {
        CandidateRegion {
            label: 1,
            bbox: BoundingBox::new(x, y, w, h),
            area: (w * h) as u64,
            mean_deviation: 60.0,
            confidence: 0.5,
        }
    }

    #[test]
    fn confirms_after_three_consecutive_frames() {
        let mut tracker = DefectTracker::new(TrackerConfig::default());
        assert!(tracker.update(1, &[region(50, 50, 10, 10)]).is_empty());
        assert!(tracker.update(2, &[region(50, 50, 10, 10)]).is_empty());
        let defects = tracker.update(3, &[region(51, 50, 10, 10)]);
        assert_eq!(defects.len(), 1);
        assert_eq!(defects[0].bbox, BoundingBox::new(51, 50, 10, 10));
        assert_eq!(defects[0].first_seen_frame, 1);
        assert_eq!(defects[0].last_seen_frame, 3);
    }

    #[test]
    fn single_frame_noise_is_never_reported() {
        let mut tracker = DefectTracker::new(TrackerConfig::default());
        tracker.update(1, &[region(10, 10, 4, 4)]);
        assert_eq!(tracker.pending_count(), 1);
        assert!(tracker.update(2, &[]).is_empty());
        assert_eq!(tracker.pending_count(), 0);
    }

    #[test]
    fn broken_streak_restarts_pending() {
        let mut tracker = DefectTracker::new(TrackerConfig::default());
        tracker.update(1, &[region(10, 10, 8, 8)]);
        tracker.update(2, &[region(10, 10, 8, 8)]);
        tracker.update(3, &[]);
        tracker.update(4, &[region(10, 10, 8, 8)]);
        assert!(tracker.update(5, &[region(10, 10, 8, 8)]).is_empty());
        assert_eq!(tracker.update(6, &[region(10, 10, 8, 8)]).len(), 1);
    }

    #[test]
    fn confirmed_defect_retires_after_grace_window() {
        let mut tracker = DefectTracker::new(TrackerConfig::default());
        for f in 1..=3 {
            tracker.update(f, &[region(20, 20, 6, 6)]);
        }
        assert_eq!(tracker.update(4, &[]).len(), 1);
        assert_eq!(tracker.update(5, &[]).len(), 1);
        assert!(tracker.update(6, &[]).is_empty());
        assert_eq!(tracker.confirmed_count(), 0);
    }

    #[test]
    fn miss_inside_grace_window_is_forgiven() {
        let mut tracker = DefectTracker::new(TrackerConfig::default());
        for f in 1..=3 {
            tracker.update(f, &[region(20, 20, 6, 6)]);
        }
        tracker.update(4, &[]);
        let defects = tracker.update(5, &[region(20, 20, 6, 6)]);
        assert_eq!(defects.len(), 1);
        assert_eq!(defects[0].last_seen_frame, 5);
        tracker.update(6, &[]);
        tracker.update(7, &[]);
        assert!(tracker.update(8, &[]).is_empty());
        // Same location after retirement starts a fresh pending track.
        assert!(tracker.update(9, &[region(20, 20, 6, 6)]).is_empty());
        assert_eq!(tracker.pending_count(), 1);
    }

    #[test]
    fn distant_regions_track_independently() {
        let mut tracker = DefectTracker::new(TrackerConfig::default());
        let regions = [region(0, 0, 5, 5), region(40, 40, 5, 5)];
        for f in 1..=3 {
            tracker.update(f, &regions);
        }
        let defects = tracker.update(4, &regions);
        assert_eq!(defects.len(), 2);
        assert!(defects[0].id < defects[1].id);
    }

    #[test]
    fn confirm_of_one_reports_immediately() {
        let mut tracker = DefectTracker::new(TrackerConfig {
            confirm_frames: 1,
            ..TrackerConfig::default()
        });
        assert_eq!(tracker.update(1, &[region(3, 3, 5, 5)]).len(), 1);
    }
}
