//! Per-frame state machine.
//!
//! ```text
//! Pending -> Aligning -> Differencing -> Thresholding -> Filtering
//!         -> Extracting -> Aggregating -> Done
//! ```
//!
//! Any non-terminal stage may move to `Dropped`; `Aligning` may move to
//! `Failed`. Every forward transition checks the frame deadline, and a
//! transition into, or out of, `Aligning`/`Differencing` checks that the
//! active profile generation is still the one the frame started with.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Duration, Instant};

use crate::error::{InspectError, Result};
use crate::frame::FrameId;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameStage {
    Pending,
    Aligning,
    Differencing,
    Thresholding,
    Filtering,
    Extracting,
    Aggregating,
    Done,
    Dropped,
    Failed,
}

impl FrameStage {
    pub fn is_terminal(self) -> bool {
        matches!(self, FrameStage::Done | FrameStage::Dropped | FrameStage::Failed)
    }

    /// Stages whose work is bound to the profile snapshot's geometry.
    pub fn is_cancellable(self) -> bool {
        matches!(self, FrameStage::Aligning | FrameStage::Differencing)
    }

    fn successor(self) -> Option<FrameStage> {
        use FrameStage::*;
        match self {
            Pending => Some(Aligning),
            Aligning => Some(Differencing),
            Differencing => Some(Thresholding),
            Thresholding => Some(Filtering),
            Filtering => Some(Extracting),
            Extracting => Some(Aggregating),
            Aggregating => Some(Done),
            Done | Dropped | Failed => None,
        }
    }

    pub fn can_transition(self, to: FrameStage) -> bool {
        if self.is_terminal() {
            return false;
        }
        self.successor() == Some(to)
            || to == FrameStage::Dropped
            || (self == FrameStage::Aligning && to == FrameStage::Failed)
    }
}

impl fmt::Display for FrameStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FrameStage::Pending => "pending",
            FrameStage::Aligning => "aligning",
            FrameStage::Differencing => "differencing",
            FrameStage::Thresholding => "thresholding",
            FrameStage::Filtering => "filtering",
            FrameStage::Extracting => "extracting",
            FrameStage::Aggregating => "aggregating",
            FrameStage::Done => "done",
            FrameStage::Dropped => "dropped",
            FrameStage::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// One frame's run through the stages.
#[derive(Clone, Debug)]
pub struct FrameRun {
    frame_id: FrameId,
    stage: FrameStage,
    admitted_at: Instant,
    deadline: Instant,
    generation: u64,
}

impl FrameRun {
    /// Start a run for a frame admitted at `admitted_at` against profile
    /// `generation`, with `budget` to reach `Done`.
    pub fn new(frame_id: FrameId, admitted_at: Instant, budget: Duration, generation: u64) -> Self {
        Self {
            frame_id,
            stage: FrameStage::Pending,
            admitted_at,
            deadline: admitted_at + budget,
            generation,
        }
    }

    pub fn frame_id(&self) -> FrameId {
        self.frame_id
    }

    pub fn stage(&self) -> FrameStage {
        self.stage
    }

    pub fn admitted_at(&self) -> Instant {
        self.admitted_at
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Profile generation the run started with.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Move to `next` now. See `advance_at`.
    pub fn advance(&mut self, next: FrameStage, current_generation: u64) -> Result<()> {
        self.advance_at(next, Instant::now(), current_generation)
    }

    /// Move to `next`, checking legality, the deadline and cancellation in
    /// that order. A timed-out or cancelled run ends in `Dropped`.
    pub fn advance_at(&mut self, next: FrameStage, now: Instant, current_generation: u64) -> Result<()> {
        if !self.stage.can_transition(next) {
            return Err(InspectError::IllegalTransition {
                from: self.stage,
                to: next,
            });
        }
        if next.is_terminal() {
            self.stage = next;
            return Ok(());
        }
        if now > self.deadline {
            let stage = self.stage;
            self.stage = FrameStage::Dropped;
            return Err(InspectError::FrameTimeout {
                frame_id: self.frame_id,
                stage,
            });
        }
        if current_generation != self.generation
            && (self.stage.is_cancellable() || next.is_cancellable())
        {
            let stage = self.stage;
            self.stage = FrameStage::Dropped;
            return Err(InspectError::Cancelled {
                frame_id: self.frame_id,
                stage,
            });
        }
        self.stage = next;
        Ok(())
    }

    /// Alignment failed; only legal from `Aligning`.
    pub fn fail(&mut self) -> Result<()> {
        self.advance_at(FrameStage::Failed, Instant::now(), self.generation)
    }

    pub fn finish(&mut self) -> Result<()> {
        self.advance_at(FrameStage::Done, Instant::now(), self.generation)
    }
}

/// Checkpoint called before each stage of a frame's run.
pub trait StageGate {
    fn enter(&mut self, stage: FrameStage) -> Result<()>;
}

/// Gate for direct, unscheduled inspection: never blocks a stage.
pub struct Ungated;

impl StageGate for Ungated {
    fn enter(&mut self, _stage: FrameStage) -> Result<()> {
        Ok(())
    }
}

/// Gate backed by a `FrameRun` and a live profile generation source.
pub struct ScheduledGate<'a, G: Fn() -> u64> {
    pub run: &'a mut FrameRun,
    pub current_generation: G,
}

impl<G: Fn() -> u64> StageGate for ScheduledGate<'_, G> {
    fn enter(&mut self, stage: FrameStage) -> Result<()> {
        self.run.advance(stage, (self.current_generation)())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(budget_ms: u64) -> (FrameRun, Instant) {
        let start = Instant::now();
        (FrameRun::new(7, start, Duration::from_millis(budget_ms), 1), start)
    }

    #[test]
    fn full_forward_path_reaches_done() {
        let (mut r, start) = run(1_000);
        for stage in [
            FrameStage::Aligning,
            FrameStage::Differencing,
            FrameStage::Thresholding,
            FrameStage::Filtering,
            FrameStage::Extracting,
            FrameStage::Aggregating,
        ] {
            r.advance_at(stage, start, 1).unwrap();
        }
        r.finish().unwrap();
        assert_eq!(r.stage(), FrameStage::Done);
        assert!(r.advance_at(FrameStage::Dropped, start, 1).is_err());
    }

    #[test]
    fn skipping_a_stage_is_illegal() {
        let (mut r, start) = run(1_000);
        let err = r.advance_at(FrameStage::Differencing, start, 1).unwrap_err();
        assert_eq!(
            err,
            InspectError::IllegalTransition {
                from: FrameStage::Pending,
                to: FrameStage::Differencing
            }
        );
        assert_eq!(r.stage(), FrameStage::Pending);
    }

    #[test]
    fn only_aligning_may_fail() {
        let (mut r, start) = run(1_000);
        assert!(r.fail().is_err());
        r.advance_at(FrameStage::Aligning, start, 1).unwrap();
        r.fail().unwrap();
        assert_eq!(r.stage(), FrameStage::Failed);
    }

    #[test]
    fn missed_deadline_drops_the_frame() {
        let (mut r, start) = run(10);
        r.advance_at(FrameStage::Aligning, start, 1).unwrap();
        let late = start + Duration::from_millis(11);
        let err = r.advance_at(FrameStage::Differencing, late, 1).unwrap_err();
        assert_eq!(
            err,
            InspectError::FrameTimeout {
                frame_id: 7,
                stage: FrameStage::Aligning
            }
        );
        assert_eq!(r.stage(), FrameStage::Dropped);
    }

    #[test]
    fn profile_swap_cancels_alignment_and_differencing_only() {
        let (mut r, start) = run(1_000);
        r.advance_at(FrameStage::Aligning, start, 1).unwrap();
        assert!(matches!(
            r.advance_at(FrameStage::Differencing, start, 2),
            Err(InspectError::Cancelled { frame_id: 7, stage: FrameStage::Aligning })
        ));
        assert_eq!(r.stage(), FrameStage::Dropped);

        let (mut r, start) = run(1_000);
        for stage in [
            FrameStage::Aligning,
            FrameStage::Differencing,
            FrameStage::Thresholding,
        ] {
            r.advance_at(stage, start, 1).unwrap();
        }
        // Past differencing the frame finishes on its snapshot.
        r.advance_at(FrameStage::Filtering, start, 2).unwrap();
        assert_eq!(r.stage(), FrameStage::Filtering);
    }

    #[test]
    fn scheduled_gate_reads_live_generation() {
        let (mut r, _) = run(1_000);
        let mut gate = ScheduledGate {
            run: &mut r,
            current_generation: || 3,
        };
        assert!(matches!(
            gate.enter(FrameStage::Aligning),
            Err(InspectError::Cancelled { .. })
        ));
        assert!(Ungated.enter(FrameStage::Done).is_ok());
    }

    #[test]
    fn stage_names_are_lowercase() {
        assert_eq!(FrameStage::Differencing.to_string(), "differencing");
        assert!(FrameStage::Failed.is_terminal());
        assert!(!FrameStage::Aggregating.is_terminal());
    }
}
