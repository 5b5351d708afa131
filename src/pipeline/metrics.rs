use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Running pipeline counters, readable while the pipeline runs.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    /// Frames that were assigned an id.
    pub frames_admitted: u64,
    /// Results handed to subscribers.
    pub frames_delivered: u64,
    /// Frames resolved as `Dropped` for any reason.
    pub dropped_frame_count: u64,
    pub alignment_failure_count: u64,
    /// Mean latency of delivered `Ok` and `AlignmentFailed` results.
    pub average_latency_ms: f64,
    pub ring_occupancy: usize,
    pub profile_generation: u64,
}

#[derive(Default)]
pub(crate) struct PipelineMetrics {
    frames_admitted: AtomicU64,
    frames_delivered: AtomicU64,
    dropped: AtomicU64,
    alignment_failures: AtomicU64,
    latency_total_us: AtomicU64,
    latency_samples: AtomicU64,
}

impl PipelineMetrics {
    pub fn record_admitted(&self) {
        self.frames_admitted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_drop(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_alignment_failure(&self) {
        self.alignment_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_delivery(&self, latency: Option<Duration>) {
        self.frames_delivered.fetch_add(1, Ordering::Relaxed);
        if let Some(latency) = latency {
            let us = u64::try_from(latency.as_micros()).unwrap_or(u64::MAX);
            self.latency_total_us.fetch_add(us, Ordering::Relaxed);
            self.latency_samples.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self, ring_occupancy: usize, profile_generation: u64) -> MetricsSnapshot {
        let samples = self.latency_samples.load(Ordering::Relaxed);
        let total_us = self.latency_total_us.load(Ordering::Relaxed);
        let average_latency_ms = if samples == 0 {
            0.0
        } else {
            total_us as f64 / samples as f64 / 1_000.0
        };
        MetricsSnapshot {
            frames_admitted: self.frames_admitted.load(Ordering::Relaxed),
            frames_delivered: self.frames_delivered.load(Ordering::Relaxed),
            dropped_frame_count: self.dropped.load(Ordering::Relaxed),
            alignment_failure_count: self.alignment_failures.load(Ordering::Relaxed),
            average_latency_ms,
            ring_occupancy,
            profile_generation,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn average_latency_ignores_unsampled_deliveries() {
        let m = PipelineMetrics::default();
        m.record_delivery(Some(Duration::from_millis(4)));
        m.record_delivery(Some(Duration::from_millis(8)));
        m.record_delivery(None);
        let snap = m.snapshot(1, 2);
        assert_eq!(snap.frames_delivered, 3);
        assert!((snap.average_latency_ms - 6.0).abs() < 1e-9);
        assert_eq!(snap.ring_occupancy, 1);
        assert_eq!(snap.profile_generation, 2);
    }

    #[test]
    fn empty_metrics_report_zero_latency() {
        let snap = PipelineMetrics::default().snapshot(0, 1);
        assert_eq!(snap.average_latency_ms, 0.0);
        assert_eq!(snap.dropped_frame_count, 0);
    }
}
