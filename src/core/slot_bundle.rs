//! One pending slot per expected capture id, completed as tagged frames arrive.
//!
//! **Why**: Multi-frame captures arrive asynchronously and in any order. Fusion
//! may only start once every expected stage has a frame.
//!
//! **Used by**: CaptureAggregator (one bundle per capture bundle spec)
//!
//! # Slot policy
//!
//! - Unknown id: frame handed back as `Unmatched`, caller releases it
//! - Slot already filled this cycle: first write wins, the newcomer is handed
//!   back as `Duplicate` and the caller releases it
//! - Bundle closed: the frame is handed back as `Closed`
//!
//! Filled buffers stay owned by the bundle until `reset()` or `close()`
//! releases them.

use log::{debug, trace};
use std::collections::HashMap;
use std::sync::Mutex;

use super::completion::{self, Completer, Completion};
use crate::entities::{BundleView, CaptureBundleSpec, CaptureId, FrameBuffer};

/// Result of offering a frame to the bundle
#[derive(Debug)]
#[must_use = "unmatched and duplicate frames must be released by the caller"]
pub enum SlotOutcome {
    /// Frame filled its slot; the bundle owns it now
    Filled,
    /// Id is not part of this bundle
    Unmatched(FrameBuffer),
    /// Slot already filled this cycle
    Duplicate(FrameBuffer),
    /// Bundle is closed; frame handed back
    Closed(FrameBuffer),
}

struct Slot {
    completer: Option<Completer<FrameBuffer>>,
    buffer: Option<FrameBuffer>,
}

struct BundleState {
    slots: HashMap<CaptureId, Slot>,
    all_ready: Completion<Vec<FrameBuffer>>,
    closed: bool,
}

/// Slots for one capture bundle spec, reusable across cycles via `reset()`.
pub struct TaggedSlotBundle {
    spec: CaptureBundleSpec,
    state: Mutex<BundleState>,
}

impl std::fmt::Debug for TaggedSlotBundle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaggedSlotBundle")
            .field("spec", &self.spec)
            .field("filled", &self.filled())
            .field("closed", &self.is_closed())
            .finish()
    }
}

fn arm(spec: &CaptureBundleSpec) -> (HashMap<CaptureId, Slot>, Completion<Vec<FrameBuffer>>) {
    let mut slots = HashMap::with_capacity(spec.len());
    let mut pending = Vec::with_capacity(spec.len());
    for id in spec.ids() {
        let (completer, completion) = completion::pair();
        slots.insert(
            id,
            Slot {
                completer: Some(completer),
                buffer: None,
            },
        );
        pending.push(completion);
    }
    (slots, Completion::all(pending))
}

impl TaggedSlotBundle {
    pub fn new(spec: CaptureBundleSpec) -> Self {
        let (slots, all_ready) = arm(&spec);
        debug!("TaggedSlotBundle created for ids {:?}", spec.to_vec());
        Self {
            spec,
            state: Mutex::new(BundleState {
                slots,
                all_ready,
                closed: false,
            }),
        }
    }

    pub fn spec(&self) -> &CaptureBundleSpec {
        &self.spec
    }

    pub fn capture_ids(&self) -> Vec<CaptureId> {
        self.spec.to_vec()
    }

    /// Offer a frame for slot `id`.
    pub fn add_frame(&self, id: CaptureId, buffer: FrameBuffer) -> SlotOutcome {
        let completer = {
            let mut state = self.lock();
            if state.closed {
                return SlotOutcome::Closed(buffer);
            }
            let Some(slot) = state.slots.get_mut(&id) else {
                return SlotOutcome::Unmatched(buffer);
            };
            if slot.buffer.is_some() {
                return SlotOutcome::Duplicate(buffer);
            }
            slot.buffer = Some(buffer.clone());
            slot.completer.take()
        };

        // Completing may trigger fusion scheduling; never under our lock
        if let Some(completer) = completer {
            completer.complete(buffer);
        }
        SlotOutcome::Filled
    }

    /// Resolves with every buffer in spec order once all slots are filled.
    ///
    /// Abandoned if the bundle is reset or closed before that.
    pub fn all_ready(&self) -> Completion<Vec<FrameBuffer>> {
        self.lock().all_ready.clone()
    }

    /// Read-only view of a complete bundle, None while slots are missing.
    pub fn view(&self) -> Option<BundleView> {
        let state = self.lock();
        let frames: Option<Vec<FrameBuffer>> = self
            .spec
            .ids()
            .map(|id| state.slots.get(&id).and_then(|s| s.buffer.clone()))
            .collect();
        frames.map(|frames| BundleView::new(self.spec.clone(), frames))
    }

    /// Number of filled slots this cycle
    pub fn filled(&self) -> usize {
        self.lock().slots.values().filter(|s| s.buffer.is_some()).count()
    }

    pub fn is_complete(&self) -> bool {
        self.filled() == self.spec.len()
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Release filled buffers and re-arm empty slots for the next cycle.
    ///
    /// Waiters of the previous cycle that have not resolved are abandoned.
    pub fn reset(&self) {
        let old_slots = {
            let mut state = self.lock();
            if state.closed {
                return;
            }
            let (slots, all_ready) = arm(&self.spec);
            state.all_ready = all_ready;
            std::mem::replace(&mut state.slots, slots)
        };
        let released = release_slots(old_slots);
        trace!("Bundle reset, released {} frames", released);
    }

    /// Release filled buffers and make the bundle permanently inert. Idempotent.
    pub fn close(&self) {
        let old_slots = {
            let mut state = self.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            std::mem::take(&mut state.slots)
        };
        let released = release_slots(old_slots);
        debug!("Bundle closed, released {} frames", released);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BundleState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

// Dropping unfired completers abandons their waiters
fn release_slots(slots: HashMap<CaptureId, Slot>) -> usize {
    let mut released = 0;
    for (_, slot) in slots {
        if let Some(buffer) = slot.buffer {
            buffer.release();
            released += 1;
        }
    }
    released
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::{Dimensions, FrameInfo, FramePool};
    use crate::error::Abandoned;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn frame(pool: &FramePool, id: CaptureId) -> FrameBuffer {
        pool.allocate(FrameInfo::tagged(id, id as i64)).unwrap()
    }

    fn tags(frames: &[FrameBuffer]) -> Vec<Option<CaptureId>> {
        frames.iter().map(FrameBuffer::tag).collect()
    }

    #[test]
    fn test_any_arrival_order_resolves_once_in_id_order() {
        let orders: [[CaptureId; 3]; 6] = [
            [1, 2, 3],
            [1, 3, 2],
            [2, 1, 3],
            [2, 3, 1],
            [3, 1, 2],
            [3, 2, 1],
        ];
        for order in orders {
            let pool = FramePool::new(Dimensions::new(2, 2), 3);
            let bundle = TaggedSlotBundle::new(CaptureBundleSpec::new([1, 2, 3]));
            let fired = Arc::new(AtomicUsize::new(0));
            let f = Arc::clone(&fired);
            bundle.all_ready().on_complete(move |frames| {
                assert_eq!(tags(&frames.unwrap()), vec![Some(1), Some(2), Some(3)]);
                f.fetch_add(1, Ordering::SeqCst);
            });

            for id in order {
                assert!(matches!(bundle.add_frame(id, frame(&pool, id)), SlotOutcome::Filled));
            }
            assert_eq!(fired.load(Ordering::SeqCst), 1, "order {:?}", order);
            assert!(bundle.is_complete());
            bundle.close();
            assert_eq!(pool.outstanding(), 0);
        }
    }

    #[test]
    fn test_unmatched_is_handed_back() {
        let pool = FramePool::new(Dimensions::new(1, 1), 2);
        let bundle = TaggedSlotBundle::new(CaptureBundleSpec::new([1]));
        match bundle.add_frame(5, frame(&pool, 5)) {
            SlotOutcome::Unmatched(buf) => buf.release(),
            other => panic!("expected unmatched, got {:?}", other),
        }
        assert_eq!(bundle.filled(), 0);
        assert_eq!(pool.outstanding(), 0);
    }

    #[test]
    fn test_duplicate_first_write_wins() {
        let pool = FramePool::new(Dimensions::new(1, 1), 3);
        let bundle = TaggedSlotBundle::new(CaptureBundleSpec::new([1, 2]));
        let first = frame(&pool, 1);
        let first_serial = first.serial();

        assert!(matches!(bundle.add_frame(1, first), SlotOutcome::Filled));
        match bundle.add_frame(1, frame(&pool, 1)) {
            SlotOutcome::Duplicate(buf) => buf.release(),
            other => panic!("expected duplicate, got {:?}", other),
        }

        assert!(matches!(bundle.add_frame(2, frame(&pool, 2)), SlotOutcome::Filled));
        let view = bundle.view().unwrap();
        assert_eq!(view.get(1).unwrap().serial(), first_serial);
        bundle.close();
        assert_eq!(pool.outstanding(), 0);
    }

    #[test]
    fn test_reset_releases_and_abandons_previous_waiters() {
        let pool = FramePool::new(Dimensions::new(1, 1), 4);
        let bundle = TaggedSlotBundle::new(CaptureBundleSpec::new([1, 2]));
        let stale = bundle.all_ready();

        assert!(matches!(bundle.add_frame(1, frame(&pool, 1)), SlotOutcome::Filled));
        bundle.reset();

        assert!(matches!(stale.try_get(), Some(Err(Abandoned))));
        assert_eq!(pool.outstanding(), 0);
        assert_eq!(bundle.filled(), 0);

        let fresh = bundle.all_ready();
        assert!(!fresh.same_as(&stale));
        assert!(matches!(bundle.add_frame(2, frame(&pool, 2)), SlotOutcome::Filled));
        assert!(matches!(bundle.add_frame(1, frame(&pool, 1)), SlotOutcome::Filled));
        assert_eq!(tags(&fresh.wait().unwrap()), vec![Some(1), Some(2)]);
        bundle.close();
    }

    #[test]
    fn test_close_releases_and_rejects_later_frames() {
        let pool = FramePool::new(Dimensions::new(1, 1), 2);
        let bundle = TaggedSlotBundle::new(CaptureBundleSpec::new([1, 2]));
        assert!(matches!(bundle.add_frame(1, frame(&pool, 1)), SlotOutcome::Filled));

        bundle.close();
        bundle.close();
        assert_eq!(pool.outstanding(), 0);

        let SlotOutcome::Closed(late) = bundle.add_frame(2, frame(&pool, 2)) else {
            panic!("closed bundle accepted a frame");
        };
        assert!(!late.is_released());
        late.release();
        assert_eq!(pool.outstanding(), 0);
        assert!(matches!(bundle.all_ready().try_get(), Some(Err(Abandoned))));
    }

    #[test]
    fn test_view_missing_until_complete() {
        let pool = FramePool::new(Dimensions::new(1, 1), 2);
        let bundle = TaggedSlotBundle::new(CaptureBundleSpec::new([4, 2]));
        assert!(matches!(bundle.add_frame(2, frame(&pool, 2)), SlotOutcome::Filled));
        assert!(bundle.view().is_none());
        assert!(matches!(bundle.add_frame(4, frame(&pool, 4)), SlotOutcome::Filled));

        let view = bundle.view().unwrap();
        assert_eq!(view.capture_ids(), vec![4, 2]);
        assert_eq!(tags(view.frames()), vec![Some(4), Some(2)]);
        bundle.close();
    }
}
