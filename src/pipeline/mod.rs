//! Pipeline scheduler.
//!
//! The caller pushes frames with `Pipeline::submit`; they land in the ring
//! buffer (drop-oldest). A fixed set of worker threads, at most
//! `max_in_flight_frames`, lease frames from the ring and run them through
//! the stage sequence against a snapshot of the active profile. Completed
//! runs go to a single reporter thread that restores frame order, runs
//! temporal aggregation and fans results out to subscribers.
//!
//! Every admitted frame id resolves exactly once: `Ok`, `AlignmentFailed`,
//! or `Dropped` (evicted, rejected, deadline, cancelled, stale).

mod lanes;
mod metrics;
mod reorder;
mod result;
mod stages;
mod state;

use crossbeam_channel::{Receiver, Sender, TrySendError};
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::config::PipelineConfig;
use crate::detect::CandidateRegion;
use crate::error::{AlignmentFailure, InspectError, Result};
use crate::frame::{FrameHandle, FrameId, FrameRingBuffer};
use crate::ingest::FrameInput;
use crate::profile::{ActiveProfile, ProfileStore, ReferenceProfile};
use crate::track::DefectTracker;

pub use lanes::ComputeLanes;
pub use metrics::MetricsSnapshot;
pub use reorder::ReorderBuffer;
pub use result::{DetectionResult, DropReason, FrameStatus, ProfileStamp};
pub use stages::{inspect_frame, FrameInspection};
pub use state::{FrameRun, FrameStage, ScheduledGate, StageGate, Ungated};

use metrics::PipelineMetrics;

/// How long an idle worker waits on the ring before re-checking shutdown.
const WORKER_POLL: Duration = Duration::from_millis(50);

/// Results buffered per subscriber. A subscriber that falls this far behind
/// loses its oldest undelivered results.
pub const SUBSCRIBER_BACKLOG: usize = 1024;

// ---- Worker -> reporter messages ----

enum OutcomeKind {
    Extracted {
        run: FrameRun,
        stamp: ProfileStamp,
        regions: Vec<CandidateRegion>,
    },
    AlignmentFailed {
        stamp: ProfileStamp,
        failure: AlignmentFailure,
    },
    Dropped {
        reason: DropReason,
        stamp: Option<ProfileStamp>,
    },
}

struct Outcome {
    frame_id: FrameId,
    timestamp: Duration,
    admitted_at: Instant,
    kind: OutcomeKind,
}

struct Shared {
    config: PipelineConfig,
    ring: FrameRingBuffer,
    profiles: ProfileStore,
    lanes: ComputeLanes,
    metrics: PipelineMetrics,
    subscribers: Mutex<Vec<Subscriber>>,
}

impl Shared {
    fn metrics_snapshot(&self) -> MetricsSnapshot {
        self.metrics
            .snapshot(self.ring.occupancy(), self.profiles.generation())
    }

    fn subscribe(&self) -> ResultSubscription {
        let (subscriber, subscription) = Subscriber::channel(SUBSCRIBER_BACKLOG);
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(subscriber);
        subscription
    }
}

/// Delivery side of one subscription: a bounded queue that drops its oldest
/// entry when full.
struct Subscriber {
    tx: Sender<DetectionResult>,
    /// Second handle on the queue, used only to discard the oldest entry.
    backlog: Receiver<DetectionResult>,
    alive: Weak<()>,
}

impl Subscriber {
    fn channel(capacity: usize) -> (Subscriber, ResultSubscription) {
        let (tx, rx) = crossbeam_channel::bounded(capacity.max(1));
        let alive = Arc::new(());
        let subscriber = Subscriber {
            tx,
            backlog: rx.clone(),
            alive: Arc::downgrade(&alive),
        };
        (subscriber, ResultSubscription { rx, _alive: alive })
    }

    /// Queue a result. Returns false once the subscription has been dropped.
    fn offer(&self, result: DetectionResult) -> bool {
        if self.alive.strong_count() == 0 {
            return false;
        }
        let mut pending = result;
        loop {
            match self.tx.try_send(pending) {
                Ok(()) => return true,
                Err(TrySendError::Full(back)) => {
                    if let Ok(stale) = self.backlog.try_recv() {
                        log::debug!(
                            "subscriber lagging: discarded result for frame {}",
                            stale.frame_id
                        );
                    }
                    pending = back;
                }
                Err(TrySendError::Disconnected(_)) => return false,
            }
        }
    }
}

/// Running inspection pipeline. Dropping it shuts it down.
pub struct Pipeline {
    shared: Arc<Shared>,
    outcome_tx: Option<Sender<Outcome>>,
    workers: Vec<JoinHandle<()>>,
    reporter: Option<JoinHandle<()>>,
}

impl Pipeline {
    /// Validate `config`, activate `profile` as generation 1 and start the
    /// workers and the reporter on `lanes`.
    ///
    /// An invalid config or profile is fatal: nothing is started.
    pub fn start(
        config: PipelineConfig,
        profile: ReferenceProfile,
        lanes: ComputeLanes,
    ) -> Result<(Pipeline, ResultSubscription)> {
        config.validate()?;
        let profiles = ProfileStore::new(
            profile,
            config.frame_width,
            config.frame_height,
            config.alignment.clone(),
        )?;
        let ring = FrameRingBuffer::new(config.ring_buffer_capacity)?;
        let worker_count = lanes.workers().min(config.max_in_flight_frames).max(1);

        let shared = Arc::new(Shared {
            config,
            ring,
            profiles,
            lanes,
            metrics: PipelineMetrics::default(),
            subscribers: Mutex::new(Vec::new()),
        });
        let subscription = shared.subscribe();

        let (outcome_tx, outcome_rx) = crossbeam_channel::unbounded::<Outcome>();
        let reporter = {
            let shared = Arc::clone(&shared);
            std::thread::Builder::new()
                .name("inspect-reporter".to_string())
                .spawn(move || reporter_loop(shared, outcome_rx))
                .map_err(|e| InspectError::ThreadSpawn(e.to_string()))?
        };

        let mut pipeline = Pipeline {
            shared: Arc::clone(&shared),
            outcome_tx: None,
            workers: Vec::with_capacity(worker_count),
            reporter: Some(reporter),
        };
        for i in 0..worker_count {
            let shared = Arc::clone(&shared);
            let tx = outcome_tx.clone();
            match std::thread::Builder::new()
                .name(format!("inspect-worker-{}", i))
                .spawn(move || worker_loop(shared, tx))
            {
                Ok(handle) => pipeline.workers.push(handle),
                Err(e) => {
                    // The reporter exits once every sender is gone.
                    drop(outcome_tx);
                    return Err(InspectError::ThreadSpawn(e.to_string()));
                }
            }
        }
        pipeline.outcome_tx = Some(outcome_tx);

        let cfg = &pipeline.shared.config;
        log::info!(
            "pipeline started: {} workers, ring capacity {}, {}x{} @ {} fps, deadline {:?}, {}",
            worker_count,
            cfg.ring_buffer_capacity,
            cfg.frame_width,
            cfg.frame_height,
            cfg.target_fps,
            cfg.frame_deadline(),
            pipeline.shared.lanes.describe()
        );
        Ok((pipeline, subscription))
    }

    /// Admit one captured frame. Never blocks on processing.
    ///
    /// Frames of the wrong size or with a malformed buffer are rejected
    /// with `InvalidFrame` and get no id. A full ring evicts its oldest
    /// queued frame, which resolves as `Dropped`.
    pub fn submit(&self, input: &FrameInput) -> Result<FrameId> {
        let cfg = &self.shared.config;
        if (input.width, input.height) != (cfg.frame_width, cfg.frame_height) {
            return Err(InspectError::InvalidFrame(format!(
                "frame is {}x{}, pipeline expects {}x{}",
                input.width, input.height, cfg.frame_width, cfg.frame_height
            )));
        }
        let tx = self.outcome_tx.as_ref().ok_or(InspectError::ShutDown)?;
        let outcome = self.shared.ring.push(input)?;
        self.shared.metrics.record_admitted();

        if let Some(evicted) = outcome.evicted {
            self.shared.metrics.record_drop();
            log::debug!("frame {} evicted by frame {}", evicted.frame_id, outcome.frame_id);
            let _ = tx.send(Outcome {
                frame_id: evicted.frame_id,
                timestamp: evicted.timestamp,
                admitted_at: evicted.admitted_at,
                kind: OutcomeKind::Dropped {
                    reason: DropReason::Evicted,
                    stamp: None,
                },
            });
        }
        if outcome.rejected {
            self.shared.metrics.record_drop();
            log::debug!(
                "{}",
                InspectError::ResourceExhaustion {
                    frame_id: outcome.frame_id
                }
            );
            let _ = tx.send(Outcome {
                frame_id: outcome.frame_id,
                timestamp: input.timestamp,
                admitted_at: Instant::now(),
                kind: OutcomeKind::Dropped {
                    reason: DropReason::Rejected,
                    stamp: None,
                },
            });
        }
        Ok(outcome.frame_id)
    }

    /// Replace the active reference profile. A rejected profile leaves the
    /// current one active. Frames aligning or differencing against the old
    /// profile are cancelled at their next stage boundary.
    pub fn update_profile(&self, profile: ReferenceProfile) -> Result<u64> {
        self.shared.profiles.swap(profile)
    }

    pub fn active_profile(&self) -> Arc<ActiveProfile> {
        self.shared.profiles.snapshot()
    }

    /// Add a consumer. It receives results delivered from now on.
    pub fn subscribe(&self) -> ResultSubscription {
        self.shared.subscribe()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.shared.metrics_snapshot()
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.shared.config
    }

    /// Stop handing frames to workers. Submissions continue under the
    /// drop-oldest policy.
    pub fn pause(&self) {
        self.shared.ring.pause();
        log::info!("pipeline paused");
    }

    pub fn resume(&self) {
        self.shared.ring.resume();
        log::info!("pipeline resumed");
    }

    /// Stop admitting frames, drain what is queued, deliver every pending
    /// result and return the final metrics.
    pub fn shutdown(mut self) -> MetricsSnapshot {
        self.stop()
    }

    fn stop(&mut self) -> MetricsSnapshot {
        if self.outcome_tx.is_some() || self.reporter.is_some() {
            self.shared.ring.close();
            for worker in self.workers.drain(..) {
                if worker.join().is_err() {
                    log::warn!("pipeline worker panicked");
                }
            }
            self.outcome_tx = None;
            if let Some(reporter) = self.reporter.take() {
                if reporter.join().is_err() {
                    log::warn!("pipeline reporter panicked");
                }
            }
            self.shared
                .subscribers
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clear();
            let m = self.shared.metrics_snapshot();
            log::info!(
                "pipeline stopped: admitted={} delivered={} dropped={} alignment_failures={} avg_latency_ms={:.2}",
                m.frames_admitted,
                m.frames_delivered,
                m.dropped_frame_count,
                m.alignment_failure_count,
                m.average_latency_ms
            );
        }
        self.shared.metrics_snapshot()
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Receiving end of a result subscription. Ends after shutdown.
///
/// Holds at most [`SUBSCRIBER_BACKLOG`] unread results; when a reader falls
/// further behind, the oldest unread results are discarded.
pub struct ResultSubscription {
    rx: Receiver<DetectionResult>,
    _alive: Arc<()>,
}

impl ResultSubscription {
    /// Block for the next result; `None` once the pipeline has shut down.
    pub fn recv(&self) -> Option<DetectionResult> {
        self.rx.recv().ok()
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Option<DetectionResult> {
        self.rx.recv_timeout(timeout).ok()
    }

    pub fn try_recv(&self) -> Option<DetectionResult> {
        self.rx.try_recv().ok()
    }
}

impl Iterator for ResultSubscription {
    type Item = DetectionResult;

    fn next(&mut self) -> Option<DetectionResult> {
        self.recv()
    }
}

// ---- Workers ----

fn worker_loop(shared: Arc<Shared>, tx: Sender<Outcome>) {
    loop {
        let Some(handle) = shared.ring.wait_next(WORKER_POLL) else {
            if shared.ring.is_closed() {
                break;
            }
            continue;
        };
        let outcome = run_guarded(&shared, &handle);
        handle.release();
        if tx.send(outcome).is_err() {
            break;
        }
    }
}

/// Process one frame; a panic in any stage becomes a `Fault` drop so the
/// frame's slot in the delivery order is still filled.
fn run_guarded(shared: &Shared, handle: &FrameHandle) -> Outcome {
    let (timestamp, admitted_at) = {
        let frame = handle.read();
        (frame.timestamp(), frame.admitted_at())
    };
    catch_stage_panic(
        handle.frame_id(),
        timestamp,
        admitted_at,
        &shared.metrics,
        || process_frame(shared, handle),
    )
}

fn catch_stage_panic(
    frame_id: FrameId,
    timestamp: Duration,
    admitted_at: Instant,
    metrics: &PipelineMetrics,
    work: impl FnOnce() -> Outcome,
) -> Outcome {
    match panic::catch_unwind(AssertUnwindSafe(work)) {
        Ok(outcome) => outcome,
        Err(payload) => {
            let message = payload
                .downcast_ref::<&str>()
                .copied()
                .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
                .unwrap_or("non-string panic payload");
            log::error!("frame {}: stage panicked: {}", frame_id, message);
            metrics.record_drop();
            Outcome {
                frame_id,
                timestamp,
                admitted_at,
                kind: OutcomeKind::Dropped {
                    reason: DropReason::Fault,
                    stamp: None,
                },
            }
        }
    }
}

fn process_frame(shared: &Shared, handle: &FrameHandle) -> Outcome {
    let frame = handle.read();
    let snapshot = shared.profiles.snapshot();
    let stamp = ProfileStamp::of(&snapshot);
    let mut run = FrameRun::new(
        frame.id(),
        frame.admitted_at(),
        shared.config.frame_deadline(),
        snapshot.generation,
    );

    let outcome = stages::run_stages(
        frame.image(),
        &snapshot.profile,
        &shared.config,
        &shared.lanes,
        &mut ScheduledGate {
            run: &mut run,
            current_generation: || shared.profiles.generation(),
        },
    );

    let kind = match outcome {
        Ok(inspection) => OutcomeKind::Extracted {
            run,
            stamp,
            regions: inspection.regions,
        },
        Err(InspectError::AlignmentFailure(failure)) => {
            let _ = run.fail();
            shared.metrics.record_alignment_failure();
            log::debug!("frame {}: {}", frame.id(), failure);
            OutcomeKind::AlignmentFailed { stamp, failure }
        }
        Err(e) => {
            let reason = match e {
                InspectError::FrameTimeout { .. } => DropReason::Deadline,
                InspectError::Cancelled { .. } => DropReason::Cancelled,
                _ => {
                    log::warn!("frame {} failed: {}", frame.id(), e);
                    DropReason::Fault
                }
            };
            shared.metrics.record_drop();
            log::debug!("frame {} dropped: {}", frame.id(), e);
            OutcomeKind::Dropped {
                reason,
                stamp: Some(stamp),
            }
        }
    };

    Outcome {
        frame_id: frame.id(),
        timestamp: frame.timestamp(),
        admitted_at: frame.admitted_at(),
        kind,
    }
}

// ---- Reporter ----

struct Reporter {
    shared: Arc<Shared>,
    tracker: DefectTracker,
    /// Newest profile generation aggregated so far.
    generation: u64,
}

impl Reporter {
    fn resolve(&mut self, outcome: Outcome) -> DetectionResult {
        let Outcome {
            frame_id,
            timestamp,
            admitted_at,
            kind,
        } = outcome;
        let dropped = |reason, stamp| {
            DetectionResult::dropped(frame_id, timestamp, admitted_at.elapsed(), reason, stamp)
        };

        match kind {
            OutcomeKind::Dropped { reason, stamp } => dropped(reason, stamp),
            OutcomeKind::AlignmentFailed { stamp, failure } => {
                self.observe_generation(stamp.generation);
                DetectionResult {
                    frame_id,
                    timestamp,
                    status: FrameStatus::AlignmentFailed,
                    defects: Vec::new(),
                    processing_latency: admitted_at.elapsed(),
                    profile: Some(stamp),
                    drop_reason: None,
                    alignment_failure: Some(failure),
                }
            }
            OutcomeKind::Extracted {
                mut run,
                stamp,
                regions,
            } => {
                if stamp.generation < self.generation {
                    self.shared.metrics.record_drop();
                    log::debug!(
                        "frame {} dropped: computed against superseded profile generation {}",
                        frame_id,
                        stamp.generation
                    );
                    return dropped(DropReason::Stale, Some(stamp));
                }
                self.observe_generation(stamp.generation);
                if let Err(e) = run.advance(FrameStage::Aggregating, self.shared.profiles.generation()) {
                    self.shared.metrics.record_drop();
                    log::debug!("frame {} dropped: {}", frame_id, e);
                    return dropped(DropReason::Deadline, Some(stamp));
                }
                let defects = self.tracker.update(frame_id, &regions);
                let _ = run.finish();
                DetectionResult {
                    frame_id,
                    timestamp,
                    status: FrameStatus::Ok,
                    defects,
                    processing_latency: admitted_at.elapsed(),
                    profile: Some(stamp),
                    drop_reason: None,
                    alignment_failure: None,
                }
            }
        }
    }

    /// Defect tracks never span two profiles.
    fn observe_generation(&mut self, generation: u64) {
        if generation > self.generation {
            if self.generation != 0 {
                log::info!(
                    "profile generation {} reached aggregation; defect tracks reset",
                    generation
                );
                self.tracker.reset();
            }
            self.generation = generation;
        }
    }

    fn deliver(&self, result: DetectionResult) {
        let latency = match result.status {
            FrameStatus::Dropped => None,
            FrameStatus::Ok | FrameStatus::AlignmentFailed => Some(result.processing_latency),
        };
        self.shared.metrics.record_delivery(latency);
        let mut subscribers = self
            .shared
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        subscribers.retain(|subscriber| subscriber.offer(result.clone()));
    }
}

fn reporter_loop(shared: Arc<Shared>, rx: Receiver<Outcome>) {
    let mut reporter = Reporter {
        tracker: DefectTracker::new(shared.config.tracker_config()),
        shared,
        generation: 0,
    };
    let mut reorder = ReorderBuffer::new();

    for outcome in rx.iter() {
        let frame_id = outcome.frame_id;
        if !reorder.insert(frame_id, outcome) {
            log::warn!("duplicate outcome for frame {} ignored", frame_id);
            continue;
        }
        while let Some((_, ready)) = reorder.pop_ready() {
            let result = reporter.resolve(ready);
            reporter.deliver(result);
        }
    }

    // Every sender is gone; nothing can fill a gap any more.
    let leftover = reorder.drain_all();
    if !leftover.is_empty() {
        log::warn!("{} results flushed past unresolved frames at shutdown", leftover.len());
    }
    for (_, outcome) in leftover {
        let result = reporter.resolve(outcome);
        reporter.deliver(result);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(frame_id: FrameId) -> DetectionResult {
        DetectionResult::dropped(
            frame_id,
            Duration::from_millis(frame_id),
            Duration::ZERO,
            DropReason::Evicted,
            None,
        )
    }

    #[test]
    fn stage_panic_becomes_fault_drop() {
        let metrics = PipelineMetrics::default();
        let outcome = catch_stage_panic(
            7,
            Duration::from_millis(70),
            Instant::now(),
            &metrics,
            || panic!("bad kernel"),
        );
        assert_eq!(outcome.frame_id, 7);
        assert_eq!(outcome.timestamp, Duration::from_millis(70));
        assert!(matches!(
            outcome.kind,
            OutcomeKind::Dropped {
                reason: DropReason::Fault,
                stamp: None
            }
        ));
        assert_eq!(metrics.snapshot(0, 0).dropped_frame_count, 1);
    }

    #[test]
    fn lagging_subscriber_keeps_newest_results() {
        let (subscriber, subscription) = Subscriber::channel(3);
        for id in 1..=5 {
            assert!(subscriber.offer(result(id)));
        }
        let ids: Vec<FrameId> =
            std::iter::from_fn(|| subscription.try_recv().map(|r| r.frame_id)).collect();
        assert_eq!(ids, vec![3, 4, 5]);
    }

    #[test]
    fn dropped_subscription_is_pruned() {
        let (subscriber, subscription) = Subscriber::channel(2);
        assert!(subscriber.offer(result(1)));
        drop(subscription);
        assert!(!subscriber.offer(result(2)));
    }
}
