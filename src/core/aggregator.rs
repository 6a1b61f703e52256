//! Capture aggregator: collects tagged raw frames into bundles and runs fusion
//! once per complete bundle.
//!
//! **Why**: Hardware produces N frames per multi-frame capture, asynchronously
//! and in any order. Consumers want one fused frame per capture.
//!
//! **Used by**: Applications that own a hardware frame source and a fusion
//! collaborator (see `sim` and the `capture-sim` binary)
//!
//! # State machine
//!
//! ```text
//! Idle --set_bundle_spec--> Collecting --all slots filled--> Fusing
//!                             ^                                 |
//!                             +------ reset, same spec ---------+
//! any --close--> Closed
//! ```
//!
//! # Cycles and epochs
//!
//! Every armed cycle gets a fresh epoch. The fusion job is scheduled with
//! `execute_with_epoch`, so replacing the spec or closing the aggregator after
//! a bundle completed but before its job ran turns that job into a no-op.
//!
//! # Failure handling
//!
//! Ingestion faults (nothing to acquire, missing tag, unmatched id, duplicate)
//! are logged and the frame released; the cycle keeps waiting. Fusion errors
//! go to the `results()` error channel and the cycle still resets. There is no
//! timeout; a stuck cycle is the caller's watchdog's business.

use log::{debug, error, trace, warn};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use super::frame_queue::FrameQueue;
use super::observable::BroadcastState;
use super::slot_bundle::{SlotOutcome, TaggedSlotBundle};
use crate::entities::{
    BundleView, CaptureBundleSpec, CaptureId, Dimensions, Executor, FrameBuffer, FrameListener,
    FrameSink, FrameSource, FusionProcessor,
};
use crate::error::CaptureError;

/// Aggregator lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregatorState {
    Idle,
    Collecting,
    Fusing,
    Closed,
}

impl AggregatorState {
    pub fn name(&self) -> &'static str {
        match self {
            AggregatorState::Idle => "idle",
            AggregatorState::Collecting => "collecting",
            AggregatorState::Fusing => "fusing",
            AggregatorState::Closed => "closed",
        }
    }
}

/// Published once per successfully fused bundle
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FusedCycle {
    /// Epoch of the cycle that produced the frame
    pub cycle: u64,
    pub capture_ids: Vec<CaptureId>,
}

struct Inner {
    state: AggregatorState,
    spec: Option<CaptureBundleSpec>,
    bundle: Option<Arc<TaggedSlotBundle>>,
}

pub struct CaptureAggregator {
    me: Weak<CaptureAggregator>,
    input: Arc<dyn FrameSource>,
    output: Arc<FrameQueue>,
    fusion: Arc<dyn FusionProcessor>,
    executor: Arc<dyn Executor>,
    epoch: Arc<AtomicU64>,
    inner: Mutex<Inner>,
    results: BroadcastState<FusedCycle, CaptureError>,
    cycles_completed: AtomicU64,
}

impl std::fmt::Debug for CaptureAggregator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaptureAggregator")
            .field("state", &self.state())
            .field("epoch", &self.epoch.load(Ordering::Relaxed))
            .field("cycles_completed", &self.cycles_completed())
            .finish()
    }
}

impl CaptureAggregator {
    /// Wire an aggregator between `input` and a new output queue of the same
    /// dimensions and depth. Ingestion and fusion run on `executor`.
    pub fn new(
        input: Arc<dyn FrameSource>,
        fusion: Arc<dyn FusionProcessor>,
        executor: Arc<dyn Executor>,
    ) -> Arc<Self> {
        let output = Arc::new(FrameQueue::new(input.dimensions(), input.max_frames()));

        let aggregator = Arc::new_cyclic(|me| Self {
            me: Weak::clone(me),
            input,
            output,
            fusion,
            executor,
            epoch: Arc::new(AtomicU64::new(0)),
            inner: Mutex::new(Inner {
                state: AggregatorState::Idle,
                spec: None,
                bundle: None,
            }),
            results: BroadcastState::new(),
            cycles_completed: AtomicU64::new(0),
        });

        let weak = Weak::clone(&aggregator.me);
        aggregator.input.set_listener(
            Arc::new(move || {
                if let Some(aggregator) = weak.upgrade() {
                    aggregator.on_frame_available();
                }
            }),
            Arc::clone(&aggregator.executor),
        );

        let sink: Arc<dyn FrameSink> = aggregator.output.clone();
        aggregator.fusion.on_output_target(sink);
        aggregator.fusion.on_resolution_hint(aggregator.input.dimensions());

        debug!(
            "CaptureAggregator created: {:?}, depth {}",
            aggregator.input.dimensions(),
            aggregator.input.max_frames()
        );
        aggregator
    }

    /// Replace the expected capture ids and start a fresh cycle.
    ///
    /// Frames already collected under the previous spec are released.
    pub fn set_bundle_spec(&self, spec: CaptureBundleSpec) -> Result<(), CaptureError> {
        if spec.is_empty() {
            return Err(CaptureError::EmptyBundle);
        }
        let capacity = self.input.max_frames();
        if spec.len() > capacity {
            return Err(CaptureError::BundleTooLarge {
                expected: spec.len(),
                capacity,
            });
        }

        let (previous, bundle, cycle) = {
            let mut inner = self.lock();
            match inner.state {
                AggregatorState::Idle | AggregatorState::Collecting => {}
                state => return Err(CaptureError::InvalidState(state.name())),
            }
            let bundle = Arc::new(TaggedSlotBundle::new(spec.clone()));
            let previous = inner.bundle.replace(Arc::clone(&bundle));
            inner.spec = Some(spec);
            inner.state = AggregatorState::Collecting;
            let cycle = self.next_epoch();
            (previous, bundle, cycle)
        };

        if let Some(previous) = previous {
            previous.close();
        }
        debug!("Bundle spec set: {:?} (cycle {})", bundle.capture_ids(), cycle);
        self.arm(&bundle, cycle);
        Ok(())
    }

    pub fn bundle_spec(&self) -> Option<CaptureBundleSpec> {
        self.lock().spec.clone()
    }

    pub fn state(&self) -> AggregatorState {
        self.lock().state
    }

    /// Number of bundles fused successfully
    pub fn cycles_completed(&self) -> u64 {
        self.cycles_completed.load(Ordering::Acquire)
    }

    /// Fused-cycle notifications and fusion failures
    pub fn results(&self) -> &BroadcastState<FusedCycle, CaptureError> {
        &self.results
    }

    /// Output queue holding fused frames
    pub fn output(&self) -> &Arc<FrameQueue> {
        &self.output
    }

    /// Stop ingesting, release every owned frame. Idempotent.
    pub fn close(&self) {
        let (bundle, fusing) = {
            let mut inner = self.lock();
            if inner.state == AggregatorState::Closed {
                return;
            }
            let fusing = inner.state == AggregatorState::Fusing;
            inner.state = AggregatorState::Closed;
            (inner.bundle.take(), fusing)
        };
        // Invalidate fusion jobs that are queued but not started
        self.next_epoch();

        self.input.close();
        self.output.close();
        match bundle {
            // The running fusion job closes it once the collaborator is done
            Some(_) if fusing => debug!("Close requested during fusion, deferring bundle close"),
            Some(bundle) => bundle.close(),
            None => {}
        }
        debug!("CaptureAggregator closed");
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn next_epoch(&self) -> u64 {
        self.epoch.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Schedule fusion for `cycle` once `bundle` is complete.
    fn arm(&self, bundle: &TaggedSlotBundle, cycle: u64) {
        let weak = Weak::clone(&self.me);
        bundle.all_ready().on_complete(move |outcome| {
            let Ok(frames) = outcome else {
                trace!("Cycle {} abandoned", cycle);
                return;
            };
            let Some(aggregator) = weak.upgrade() else {
                return;
            };
            let job = Arc::clone(&aggregator);
            aggregator.executor.execute_with_epoch(
                Arc::clone(&aggregator.epoch),
                cycle,
                Box::new(move || job.run_fusion(cycle, frames)),
            );
        });
    }

    // ========== Ingestion ==========

    /// Input listener: pull one raw frame and route it into the bundle.
    ///
    /// The current bundle is read after the frame is acquired. A frame handed
    /// back by a bundle that was replaced meanwhile is routed to its successor.
    fn on_frame_available(&self) {
        if self.state() == AggregatorState::Closed {
            return;
        }
        let Some(mut frame) = self.input.acquire_next() else {
            warn!("Frame available but none could be acquired");
            return;
        };
        let Some(tag) = frame.tag() else {
            warn!("{}, dropping frame {}", CaptureError::MissingTag, frame.serial());
            frame.release();
            return;
        };

        loop {
            let bundle = {
                let inner = self.lock();
                if inner.state == AggregatorState::Closed {
                    drop(inner);
                    trace!("Aggregator closed, releasing frame {}", frame.serial());
                    frame.release();
                    return;
                }
                inner.bundle.clone()
            };
            let Some(bundle) = bundle else {
                warn!("No capture bundle set, dropping frame {}", frame.serial());
                frame.release();
                return;
            };

            frame = match bundle.add_frame(tag, frame) {
                SlotOutcome::Filled => {
                    trace!("Slot {} filled", tag);
                    return;
                }
                SlotOutcome::Duplicate(frame) => {
                    warn!("Slot {} already filled this cycle, dropping frame {}", tag, frame.serial());
                    frame.release();
                    return;
                }
                SlotOutcome::Unmatched(frame) | SlotOutcome::Closed(frame)
                    if !self.is_current(&bundle) =>
                {
                    trace!("Bundle replaced while routing frame {}, retrying", tag);
                    frame
                }
                SlotOutcome::Unmatched(frame) => {
                    warn!("{} {:?}", CaptureError::UnmatchedFrame(tag), bundle.capture_ids());
                    frame.release();
                    return;
                }
                SlotOutcome::Closed(frame) => {
                    trace!("Bundle closed, releasing frame {}", frame.serial());
                    frame.release();
                    return;
                }
            };
        }
    }

    fn is_current(&self, bundle: &Arc<TaggedSlotBundle>) -> bool {
        self.lock()
            .bundle
            .as_ref()
            .is_some_and(|current| Arc::ptr_eq(current, bundle))
    }

    // ========== Fusion ==========

    fn run_fusion(&self, cycle: u64, frames: Vec<FrameBuffer>) {
        let (bundle, spec) = {
            let mut inner = self.lock();
            if inner.state != AggregatorState::Collecting || self.epoch.load(Ordering::Acquire) != cycle {
                trace!("Cycle {} superseded before fusion", cycle);
                return;
            }
            let (Some(bundle), Some(spec)) = (inner.bundle.clone(), inner.spec.clone()) else {
                return;
            };
            inner.state = AggregatorState::Fusing;
            (bundle, spec)
        };

        let view = BundleView::new(spec, frames);
        debug!("Cycle {} complete, fusing ids {:?}", cycle, view.capture_ids());
        let result = self.fusion.process(&view);
        drop(view);

        let fused = result.is_ok();
        if self.state() != AggregatorState::Closed {
            match result {
                Ok(()) => {
                    self.results.publish_value(FusedCycle {
                        cycle,
                        capture_ids: bundle.capture_ids(),
                    });
                }
                Err(err) => {
                    error!("Fusion failed for cycle {}: {}", cycle, err);
                    let err = match err {
                        CaptureError::FusionFailure(_) => err,
                        other => CaptureError::FusionFailure(other.to_string()),
                    };
                    self.results.publish_error(err);
                }
            }
        }

        let next = {
            let mut inner = self.lock();
            if inner.state == AggregatorState::Closed {
                None
            } else {
                inner.state = AggregatorState::Collecting;
                bundle.reset();
                Some(self.next_epoch())
            }
        };

        match next {
            Some(next_cycle) => {
                // Counted only once the slots are free for the next cycle
                if fused {
                    self.cycles_completed.fetch_add(1, Ordering::AcqRel);
                }
                self.arm(&bundle, next_cycle);
            }
            None => bundle.close(),
        }
    }
}

impl FrameSource for CaptureAggregator {
    fn acquire_latest(&self) -> Option<FrameBuffer> {
        self.output.acquire_latest()
    }

    fn acquire_next(&self) -> Option<FrameBuffer> {
        self.output.acquire_next()
    }

    fn set_listener(&self, listener: FrameListener, executor: Arc<dyn Executor>) {
        self.output.set_listener(listener, executor);
    }

    fn dimensions(&self) -> Dimensions {
        self.input.dimensions()
    }

    fn max_frames(&self) -> usize {
        self.output.max_frames()
    }

    fn close(&self) {
        CaptureAggregator::close(self);
    }
}
