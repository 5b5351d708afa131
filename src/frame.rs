//! Frame ownership layer.
//!
//! - `Frame`: one captured luma frame with its id and capture timestamp.
//! - `FrameRingBuffer`: fixed-capacity arena of frame slots with drop-oldest eviction.
//! - `FrameHandle`: lease on one slot, referenced by index. Stages never own frames.
//!
//! The ring buffer is the sole owner of frame memory. A slot moves through
//! `Free -> Writing -> Queued -> Leased -> Free`; pixels are copied into a
//! `Writing` slot outside the bookkeeping lock. Pushing into a full buffer evicts the
//! oldest `Queued` frame. A `Leased` slot is never reused while its handle
//! is alive. Slot pixel buffers are recycled across frames.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard};
use std::time::{Duration, Instant};

use crate::error::{InspectError, Result};
use crate::ingest::{copy_luma, validate_input, FrameInput};
use crate::luma::{checked_len, GrayImage};

/// Monotonically increasing frame identifier, assigned at admission. Starts at 1.
pub type FrameId = u64;

/// Default ring capacity.
pub const DEFAULT_RING_CAPACITY: usize = 4;

// ----------------------------------------------------------------------------
// Frame
// ----------------------------------------------------------------------------

/// A captured frame, reduced to luma. Exclusively owned by its ring slot.
#[derive(Debug, Default)]
pub struct Frame {
    id: FrameId,
    timestamp: Duration,
    admitted_at: Option<Instant>,
    image: GrayImage,
}

impl Frame {
    pub fn id(&self) -> FrameId {
        self.id
    }

    /// Capture timestamp supplied by the capture collaborator.
    pub fn timestamp(&self) -> Duration {
        self.timestamp
    }

    /// Instant the frame entered the ring buffer.
    pub fn admitted_at(&self) -> Instant {
        self.admitted_at.unwrap_or_else(Instant::now)
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    pub fn image(&self) -> &GrayImage {
        &self.image
    }
}

// ----------------------------------------------------------------------------
// Push outcome
// ----------------------------------------------------------------------------

/// Frame that left the ring without being processed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EvictedFrame {
    pub frame_id: FrameId,
    pub timestamp: Duration,
    pub admitted_at: Instant,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PushOutcome {
    /// Id assigned to the pushed frame.
    pub frame_id: FrameId,
    /// Oldest queued frame evicted to make room, if any.
    pub evicted: Option<EvictedFrame>,
    /// True when every slot was leased and the pushed frame itself was dropped.
    pub rejected: bool,
}

// ----------------------------------------------------------------------------
// FrameRingBuffer
// ----------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum SlotState {
    Free,
    /// Reserved by a producer that is copying pixels in.
    Writing(FrameId),
    Queued(FrameId),
    Leased(FrameId),
}

struct RingState {
    slots: Vec<SlotState>,
    /// Queued slot indices, oldest first.
    queue: VecDeque<usize>,
    next_id: FrameId,
    dropped: u64,
    paused: bool,
    closed: bool,
}

impl RingState {
    fn occupancy(&self) -> usize {
        self.slots.iter().filter(|s| **s != SlotState::Free).count()
    }
}

struct RingInner {
    frames: Box<[RwLock<Frame>]>,
    state: Mutex<RingState>,
    ready: Condvar,
}

impl RingInner {
    fn lock_state(&self) -> MutexGuard<'_, RingState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn release(&self, slot: usize, frame_id: FrameId) {
        let mut state = self.lock_state();
        if state.slots[slot] == SlotState::Leased(frame_id) {
            state.slots[slot] = SlotState::Free;
        }
    }
}

/// Bounded ring of frame slots.
///
/// Safe to share between one or more producers and any number of workers:
/// slot bookkeeping sits behind one mutex, pixel data behind per-slot locks
/// that are only written while a slot is not leased.
#[derive(Clone)]
pub struct FrameRingBuffer {
    inner: Arc<RingInner>,
}

impl FrameRingBuffer {
    pub fn new(capacity: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(InspectError::InvalidConfig(
                "ring buffer capacity must be >= 1".to_string(),
            ));
        }
        let frames: Vec<RwLock<Frame>> = (0..capacity).map(|_| RwLock::default()).collect();
        Ok(Self {
            inner: Arc::new(RingInner {
                frames: frames.into_boxed_slice(),
                state: Mutex::new(RingState {
                    slots: vec![SlotState::Free; capacity],
                    queue: VecDeque::with_capacity(capacity),
                    next_id: 1,
                    dropped: 0,
                    paused: false,
                    closed: false,
                }),
                ready: Condvar::new(),
            }),
        })
    }

    pub fn capacity(&self) -> usize {
        self.inner.frames.len()
    }

    /// Insert a frame at the write position.
    ///
    /// When no slot is free the oldest queued frame is evicted and its slot
    /// reused. When every slot is leased the incoming frame is dropped
    /// instead. Either way the dropped-frame counter increases by one. The
    /// producer never blocks.
    pub fn push(&self, input: &FrameInput) -> Result<PushOutcome> {
        checked_len(input.width, input.height)?;
        validate_input(input).map_err(|e| InspectError::InvalidFrame(e.to_string()))?;
        let admitted_at = Instant::now();

        let mut state = self.inner.lock_state();
        if state.closed {
            return Err(InspectError::ShutDown);
        }

        let free = state.slots.iter().position(|s| *s == SlotState::Free);
        let (slot, evicted) = match free {
            Some(slot) => (Some(slot), None),
            None => match state.queue.pop_front() {
                Some(slot) => {
                    let old = self.read_slot(slot);
                    let evicted = EvictedFrame {
                        frame_id: old.id,
                        timestamp: old.timestamp,
                        admitted_at: old.admitted_at(),
                    };
                    drop(old);
                    state.slots[slot] = SlotState::Free;
                    state.dropped += 1;
                    (Some(slot), Some(evicted))
                }
                None => (None, None),
            },
        };

        let frame_id = state.next_id;
        state.next_id += 1;

        let Some(slot) = slot else {
            // Every slot is pinned by an in-flight run.
            state.dropped += 1;
            return Ok(PushOutcome {
                frame_id,
                evicted: None,
                rejected: true,
            });
        };

        state.slots[slot] = SlotState::Writing(frame_id);
        drop(state);

        {
            let mut frame = self.inner.frames[slot]
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            frame.image.overwrite(input.width, input.height, |buf| {
                copy_luma(&input.pixels, input.width, input.height, input.format, buf)
            });
            frame.id = frame_id;
            frame.timestamp = input.timestamp;
            frame.admitted_at = Some(admitted_at);
        }

        let mut state = self.inner.lock_state();
        state.slots[slot] = SlotState::Queued(frame_id);
        // Concurrent producers may finish out of order; keep the queue by id.
        let pos = state
            .queue
            .iter()
            .rposition(|&queued| match state.slots[queued] {
                SlotState::Queued(id) => id < frame_id,
                _ => true,
            })
            .map_or(0, |p| p + 1);
        state.queue.insert(pos, slot);
        drop(state);
        self.inner.ready.notify_one();

        Ok(PushOutcome {
            frame_id,
            evicted,
            rejected: false,
        })
    }

    /// Lease a specific queued frame.
    pub fn acquire(&self, frame_id: FrameId) -> Option<FrameHandle> {
        let mut state = self.inner.lock_state();
        let pos = state
            .queue
            .iter()
            .position(|&slot| state.slots[slot] == SlotState::Queued(frame_id))?;
        let slot = state.queue.remove(pos)?;
        state.slots[slot] = SlotState::Leased(frame_id);
        Some(self.handle(slot, frame_id))
    }

    /// Lease the oldest queued frame without waiting.
    pub fn acquire_next(&self) -> Option<FrameHandle> {
        let mut state = self.inner.lock_state();
        if state.paused && !state.closed {
            return None;
        }
        self.lease_front(&mut state)
    }

    /// Lease the oldest queued frame, waiting up to `timeout`.
    ///
    /// Only the calling worker blocks. Returns `None` on timeout, or when the
    /// buffer is closed and drained.
    pub fn wait_next(&self, timeout: Duration) -> Option<FrameHandle> {
        let deadline = Instant::now() + timeout;
        let mut state = self.inner.lock_state();
        loop {
            let runnable = !state.paused || state.closed;
            if runnable {
                if let Some(handle) = self.lease_front(&mut state) {
                    return Some(handle);
                }
                if state.closed {
                    return None;
                }
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            state = self
                .inner
                .ready
                .wait_timeout(state, deadline - now)
                .map(|(guard, _)| guard)
                .unwrap_or_else(|e| e.into_inner().0);
        }
    }

    fn lease_front(&self, state: &mut RingState) -> Option<FrameHandle> {
        let slot = state.queue.pop_front()?;
        let SlotState::Queued(frame_id) = state.slots[slot] else {
            return None;
        };
        state.slots[slot] = SlotState::Leased(frame_id);
        Some(self.handle(slot, frame_id))
    }

    fn handle(&self, slot: usize, frame_id: FrameId) -> FrameHandle {
        FrameHandle {
            inner: Arc::clone(&self.inner),
            slot,
            frame_id,
        }
    }

    fn read_slot(&self, slot: usize) -> RwLockReadGuard<'_, Frame> {
        self.inner.frames[slot]
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Stop handing out frames until `resume`. Pushes still succeed.
    pub fn pause(&self) {
        self.inner.lock_state().paused = true;
    }

    pub fn resume(&self) {
        self.inner.lock_state().paused = false;
        self.inner.ready.notify_all();
    }

    /// Reject further pushes. Queued frames can still be drained.
    pub fn close(&self) {
        self.inner.lock_state().closed = true;
        self.inner.ready.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock_state().closed
    }

    /// Slots currently holding a frame (queued or leased). Never exceeds capacity.
    pub fn occupancy(&self) -> usize {
        self.inner.lock_state().occupancy()
    }

    /// Frames waiting for a worker.
    pub fn queued(&self) -> usize {
        self.inner.lock_state().queue.len()
    }

    /// Frames dropped by the drop-oldest policy (evicted or rejected).
    pub fn dropped_count(&self) -> u64 {
        self.inner.lock_state().dropped
    }
}

// ----------------------------------------------------------------------------
// FrameHandle
// ----------------------------------------------------------------------------

/// Lease on one ring slot. The slot returns to the free list on `release` or drop.
pub struct FrameHandle {
    inner: Arc<RingInner>,
    slot: usize,
    frame_id: FrameId,
}

impl FrameHandle {
    pub fn frame_id(&self) -> FrameId {
        self.frame_id
    }

    pub fn slot(&self) -> usize {
        self.slot
    }

    /// Borrow the leased frame.
    pub fn read(&self) -> RwLockReadGuard<'_, Frame> {
        self.inner.frames[self.slot]
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Explicitly return the slot to the ring.
    pub fn release(self) {
        drop(self);
    }
}

impl Drop for FrameHandle {
    fn drop(&mut self) {
        self.inner.release(self.slot, self.frame_id);
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn gray_input(width: u32, height: u32, level: u8, ts_ms: u64) -> FrameInput {
        FrameInput::gray(
            width,
            height,
            Duration::from_millis(ts_ms),
            vec![level; (width * height) as usize],
        )
    }

    #[test]
    fn push_assigns_increasing_ids() {
        let ring = FrameRingBuffer::new(4).unwrap();
        let a = ring.push(&gray_input(4, 4, 1, 0)).unwrap();
        let b = ring.push(&gray_input(4, 4, 2, 1)).unwrap();
        assert_eq!(a.frame_id, 1);
        assert_eq!(b.frame_id, 2);
        assert!(a.evicted.is_none() && !a.rejected);
        assert_eq!(ring.occupancy(), 2);
    }

    #[test]
    fn full_ring_evicts_oldest_queued_frame() {
        let ring = FrameRingBuffer::new(4).unwrap();
        let mut evicted = Vec::new();
        for i in 0..6u64 {
            let outcome = ring.push(&gray_input(4, 4, i as u8, i)).unwrap();
            if let Some(e) = outcome.evicted {
                evicted.push(e.frame_id);
            }
            assert!(ring.occupancy() <= 4);
        }
        assert_eq!(evicted, vec![1, 2]);
        assert_eq!(ring.dropped_count(), 2);
        assert_eq!(ring.occupancy(), 4);

        let handle = ring.acquire_next().unwrap();
        assert_eq!(handle.frame_id(), 3);
        assert_eq!(handle.read().image().get(0, 0), 2);
    }

    #[test]
    fn leased_slots_are_never_reused() {
        let ring = FrameRingBuffer::new(2).unwrap();
        ring.push(&gray_input(2, 2, 10, 0)).unwrap();
        ring.push(&gray_input(2, 2, 20, 1)).unwrap();
        let first = ring.acquire_next().unwrap();
        let second = ring.acquire_next().unwrap();

        let outcome = ring.push(&gray_input(2, 2, 30, 2)).unwrap();
        assert!(outcome.rejected);
        assert!(outcome.evicted.is_none());
        assert_eq!(first.read().image().get(0, 0), 10);
        assert_eq!(second.read().image().get(0, 0), 20);
        assert_eq!(ring.dropped_count(), 1);

        first.release();
        let outcome = ring.push(&gray_input(2, 2, 40, 3)).unwrap();
        assert!(!outcome.rejected);
        assert_eq!(outcome.frame_id, 4);
        assert_eq!(second.read().image().get(1, 1), 20);
    }

    #[test]
    fn acquire_by_id_skips_other_frames() {
        let ring = FrameRingBuffer::new(3).unwrap();
        for i in 0..3u64 {
            ring.push(&gray_input(2, 2, i as u8, i)).unwrap();
        }
        let handle = ring.acquire(2).unwrap();
        assert_eq!(handle.read().id(), 2);
        assert!(ring.acquire(2).is_none());
        assert_eq!(ring.acquire_next().unwrap().frame_id(), 1);
        assert_eq!(ring.acquire_next().unwrap().frame_id(), 3);
    }

    #[test]
    fn invalid_input_does_not_consume_an_id() {
        let ring = FrameRingBuffer::new(2).unwrap();
        let bad = FrameInput::gray(4, 4, Duration::ZERO, vec![0; 3]);
        assert!(ring.push(&bad).is_err());
        assert_eq!(ring.occupancy(), 0);
        let ok = ring.push(&gray_input(4, 4, 0, 0)).unwrap();
        assert_eq!(ok.frame_id, 1);
    }

    #[test]
    fn paused_ring_holds_frames_until_resumed() {
        let ring = FrameRingBuffer::new(2).unwrap();
        ring.pause();
        ring.push(&gray_input(2, 2, 0, 0)).unwrap();
        assert!(ring.acquire_next().is_none());
        assert!(ring.wait_next(Duration::from_millis(5)).is_none());
        ring.resume();
        assert_eq!(ring.wait_next(Duration::from_millis(5)).unwrap().frame_id(), 1);
    }

    #[test]
    fn closed_ring_drains_then_stops() {
        let ring = FrameRingBuffer::new(2).unwrap();
        ring.push(&gray_input(2, 2, 0, 0)).unwrap();
        ring.close();
        assert!(matches!(
            ring.push(&gray_input(2, 2, 0, 1)),
            Err(InspectError::ShutDown)
        ));
        assert_eq!(ring.wait_next(Duration::from_millis(5)).unwrap().frame_id(), 1);
        assert!(ring.wait_next(Duration::from_secs(5)).is_none());
    }

    #[test]
    fn workers_are_not_blocked_by_an_in_progress_copy() {
        let ring = FrameRingBuffer::new(2).unwrap();
        ring.push(&gray_input(4, 4, 1, 0)).unwrap();
        let first = ring.acquire_next().unwrap();
        assert_eq!(first.slot(), 0);

        // Stall the producer inside its pixel copy into slot 1.
        let stalled = ring.inner.frames[1].write().unwrap();
        let producer = {
            let ring = ring.clone();
            std::thread::spawn(move || ring.push(&gray_input(4, 4, 2, 1)).unwrap())
        };
        let deadline = Instant::now() + Duration::from_secs(10);
        while ring.occupancy() < 2 {
            assert!(Instant::now() < deadline, "producer never reserved a slot");
            std::thread::sleep(Duration::from_millis(1));
        }

        // Bookkeeping stays available; the half-written frame is not visible.
        first.release();
        assert_eq!(ring.occupancy(), 1);
        assert_eq!(ring.queued(), 0);
        assert!(ring.acquire_next().is_none());

        drop(stalled);
        let outcome = producer.join().unwrap();
        assert_eq!(outcome.frame_id, 2);
        let handle = ring.wait_next(Duration::from_secs(5)).unwrap();
        assert_eq!(handle.frame_id(), 2);
        assert_eq!(handle.read().image().get(0, 0), 2);
    }

    #[test]
    fn slot_allocation_is_recycled() {
        let ring = FrameRingBuffer::new(1).unwrap();
        ring.push(&gray_input(8, 8, 1, 0)).unwrap();
        let ptr_before = ring.acquire_next().unwrap().read().image().as_slice().as_ptr();
        ring.push(&gray_input(8, 8, 2, 1)).unwrap();
        let handle = ring.acquire_next().unwrap();
        assert_eq!(handle.read().image().as_slice().as_ptr(), ptr_before);
    }
}
