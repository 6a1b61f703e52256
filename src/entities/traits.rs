//! Abstract traits for the collaborators around the capture core.
//!
//! Hardware, device platforms and fusion algorithms live outside this crate;
//! the core only talks to them through these interfaces. Implementations for
//! simulation live in `sim`, execution contexts in `core::workers`.

use std::collections::{BTreeSet, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use super::capture::CaptureBundleSpec;
use super::consumer::ConsumerId;
use super::frame::{CaptureId, Dimensions, FrameBuffer, FrameInfo};
use crate::core::completion::Completion;
use crate::error::{CaptureError, DeviceError};

/// Boxed unit of work for an execution context
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// "A frame is available" callback registered on a frame source
pub type FrameListener = Arc<dyn Fn() + Send + Sync>;

// ============================================================================
// Execution contexts
// ============================================================================

/// Execution context that runs jobs (thread pool, inline, test queue...).
pub trait Executor: Send + Sync {
    fn execute(&self, job: Job);

    /// Execute job only if `epoch` still equals `expected` when it runs.
    ///
    /// The check happens at execution time, not enqueue time, so replacing
    /// state after scheduling turns the job into a no-op.
    fn execute_with_epoch(&self, epoch: Arc<AtomicU64>, expected: u64, job: Job) {
        self.execute(Box::new(move || {
            if epoch.load(Ordering::Acquire) == expected {
                job();
            }
        }));
    }
}

impl<T: Executor + ?Sized> Executor for Arc<T> {
    fn execute(&self, job: Job) {
        (**self).execute(job)
    }
}

// ============================================================================
// Frames
// ============================================================================

/// Source of tagged frames, push (listener) or pull (acquire).
pub trait FrameSource: Send + Sync {
    /// Take the newest queued frame, releasing every older one.
    fn acquire_latest(&self) -> Option<FrameBuffer>;

    /// Take the oldest queued frame.
    fn acquire_next(&self) -> Option<FrameBuffer>;

    /// Invoke `listener` on `executor` whenever a frame becomes available.
    fn set_listener(&self, listener: FrameListener, executor: Arc<dyn Executor>);

    fn dimensions(&self) -> Dimensions;

    /// Queue depth (maximum frames held at once)
    fn max_frames(&self) -> usize;

    fn close(&self);
}

/// Destination for frames (a fusion output target).
pub trait FrameSink: Send + Sync {
    /// Take an empty buffer from the sink's pool.
    fn allocate(&self, info: FrameInfo) -> Result<FrameBuffer, CaptureError>;

    /// Queue a filled buffer. On error the sink has already released it.
    fn submit(&self, frame: FrameBuffer) -> Result<(), CaptureError>;
}

/// Read-only view of a complete bundle handed to fusion.
///
/// Buffers stay owned by the bundle; fusion must not release them.
#[derive(Debug, Clone)]
pub struct BundleView {
    spec: CaptureBundleSpec,
    frames: Vec<FrameBuffer>,
}

impl BundleView {
    pub(crate) fn new(spec: CaptureBundleSpec, frames: Vec<FrameBuffer>) -> Self {
        debug_assert_eq!(spec.len(), frames.len());
        Self { spec, frames }
    }

    pub fn capture_ids(&self) -> Vec<CaptureId> {
        self.spec.to_vec()
    }

    /// Frames in capture id order
    pub fn frames(&self) -> &[FrameBuffer] {
        &self.frames
    }

    pub fn get(&self, id: CaptureId) -> Option<&FrameBuffer> {
        self.spec.position(id).and_then(|i| self.frames.get(i))
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}

/// External fusion algorithm combining one complete bundle into one frame.
pub trait FusionProcessor: Send + Sync {
    /// Input resolution, sent once before the first bundle.
    fn on_resolution_hint(&self, dimensions: Dimensions);

    /// Where fused frames go, configured once.
    fn on_output_target(&self, sink: Arc<dyn FrameSink>);

    /// Emit exactly one frame to the output target, or fail.
    fn process(&self, bundle: &BundleView) -> Result<(), CaptureError>;
}

// ============================================================================
// Devices
// ============================================================================

/// One exclusive hardware device.
pub trait DeviceHandle: Send + Sync {
    fn id(&self) -> &str;

    /// Consumers start using the device.
    fn attach_consumers(&self, consumers: &HashSet<ConsumerId>);

    /// Consumers stop using the device. Device stays open.
    fn detach_consumers(&self, consumers: &HashSet<ConsumerId>);

    /// Asynchronously release the device.
    fn release(&self) -> Completion<Result<(), DeviceError>>;
}

/// Platform that enumerates and opens devices.
pub trait DevicePlatform: Send + Sync {
    fn list_available_device_ids(&self) -> Result<BTreeSet<String>, DeviceError>;

    fn open_device(&self, id: &str) -> Result<Arc<dyn DeviceHandle>, DeviceError>;
}
