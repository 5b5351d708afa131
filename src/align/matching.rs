//! Brute-force descriptor matching with ratio test and mutual check.

use super::features::Keypoint;

/// A frame keypoint paired with a reference keypoint.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FeatureMatch {
    pub frame_idx: usize,
    pub reference_idx: usize,
    pub distance: u32,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct MatchConfig {
    /// Largest Hamming distance accepted for a match (of 256 bits).
    pub max_distance: u32,
    /// Best distance must be below `ratio * second_best`.
    pub ratio: f32,
}

impl Default for MatchConfig {
    fn default() -> Self {
        Self {
            max_distance: 40,
            ratio: 0.8,
        }
    }
}

/// Best and second-best candidate for one query descriptor.
#[derive(Clone, Copy)]
struct Nearest {
    idx: usize,
    best: u32,
    second: u32,
}

fn nearest(query: &Keypoint, candidates: &[Keypoint]) -> Option<Nearest> {
    let mut out: Option<Nearest> = None;
    for (idx, c) in candidates.iter().enumerate() {
        let d = query.descriptor.distance(&c.descriptor);
        out = Some(match out {
            None => Nearest {
                idx,
                best: d,
                second: u32::MAX,
            },
            Some(n) if d < n.best => Nearest {
                idx,
                best: d,
                second: n.best,
            },
            Some(n) if d < n.second => Nearest { second: d, ..n },
            Some(n) => n,
        });
    }
    out
}

/// Match frame keypoints against reference keypoints.
///
/// A pair is kept when it is within `max_distance`, passes the ratio test
/// and each side is the other's nearest neighbour. Output is ordered by
/// frame keypoint index.
pub fn match_keypoints(
    frame: &[Keypoint],
    reference: &[Keypoint],
    config: &MatchConfig,
) -> Vec<FeatureMatch> {
    if frame.is_empty() || reference.is_empty() {
        return Vec::new();
    }

    let backward: Vec<Option<usize>> = reference
        .iter()
        .map(|r| nearest(r, frame).map(|n| n.idx))
        .collect();

    frame
        .iter()
        .enumerate()
        .filter_map(|(frame_idx, kp)| {
            let n = nearest(kp, reference)?;
            if n.best > config.max_distance {
                return None;
            }
            if n.second != u32::MAX && (n.best as f32) >= config.ratio * n.second as f32 {
                return None;
            }
            if backward[n.idx] != Some(frame_idx) {
                return None;
            }
            Some(FeatureMatch {
                frame_idx,
                reference_idx: n.idx,
                distance: n.best,
            })
        })
        .collect()
}
