//! Simulated collaborators: device platform, hardware producer, fusion.
//!
//! Used by the `capture-sim` binary and by integration-style tests. Devices
//! release asynchronously on an executor after a configurable delay; the
//! hardware producer emits each bundle out of order with one stale capture id
//! mixed in, the way a reconfigured sensor pipeline does.

use log::{debug, trace, warn};
use std::collections::{BTreeSet, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, Instant};

use crate::core::completion::{self, Completion};
use crate::entities::{
    BundleView, CaptureBundleSpec, CaptureId, ConsumerId, DeviceHandle, DevicePlatform, Dimensions, Executor,
    FrameBuffer, FrameInfo, FrameSink, FusionProcessor,
};
use crate::error::{CaptureError, DeviceError, FrameError};

// ============================================================================
// Devices
// ============================================================================

/// Platform exposing a fixed set of simulated devices
pub struct SimulatedPlatform {
    ids: BTreeSet<String>,
    executor: Arc<dyn Executor>,
    release_delay: Duration,
    /// Devices whose release reports an error
    failing: BTreeSet<String>,
    opened: Mutex<Vec<Arc<SimulatedDevice>>>,
}

impl SimulatedPlatform {
    pub fn new(
        ids: impl IntoIterator<Item = String>,
        executor: Arc<dyn Executor>,
        release_delay: Duration,
    ) -> Self {
        Self {
            ids: ids.into_iter().collect(),
            executor,
            release_delay,
            failing: BTreeSet::new(),
            opened: Mutex::new(Vec::new()),
        }
    }

    /// Make release of `id` fail
    pub fn with_failing_release(mut self, id: impl Into<String>) -> Self {
        self.failing.insert(id.into());
        self
    }

    /// Every device opened so far, oldest first
    pub fn opened(&self) -> Vec<Arc<SimulatedDevice>> {
        self.opened.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl DevicePlatform for SimulatedPlatform {
    fn list_available_device_ids(&self) -> Result<BTreeSet<String>, DeviceError> {
        Ok(self.ids.clone())
    }

    fn open_device(&self, id: &str) -> Result<Arc<dyn DeviceHandle>, DeviceError> {
        if !self.ids.contains(id) {
            return Err(DeviceError::Open {
                id: id.to_string(),
                reason: "no such device".to_string(),
            });
        }
        let device = Arc::new(SimulatedDevice {
            id: id.to_string(),
            executor: Arc::clone(&self.executor),
            release_delay: self.release_delay,
            fail_release: self.failing.contains(id),
            consumers: Mutex::new(HashSet::new()),
            released: Arc::new(AtomicBool::new(false)),
        });
        debug!("Simulated device {} opened", id);
        self.opened
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(Arc::clone(&device));
        Ok(device)
    }
}

pub struct SimulatedDevice {
    id: String,
    executor: Arc<dyn Executor>,
    release_delay: Duration,
    fail_release: bool,
    consumers: Mutex<HashSet<ConsumerId>>,
    released: Arc<AtomicBool>,
}

impl SimulatedDevice {
    pub fn consumers(&self) -> HashSet<ConsumerId> {
        self.consumers.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }
}

impl DeviceHandle for SimulatedDevice {
    fn id(&self) -> &str {
        &self.id
    }

    fn attach_consumers(&self, consumers: &HashSet<ConsumerId>) {
        debug!("Device {}: attach {} consumers", self.id, consumers.len());
        self.consumers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .extend(consumers.iter().copied());
    }

    fn detach_consumers(&self, consumers: &HashSet<ConsumerId>) {
        debug!("Device {}: detach {} consumers", self.id, consumers.len());
        self.consumers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|c| !consumers.contains(c));
    }

    fn release(&self) -> Completion<Result<(), DeviceError>> {
        let (completer, completion) = completion::pair();
        let id = self.id.clone();
        let delay = self.release_delay;
        let fail = self.fail_release;
        let released = Arc::clone(&self.released);

        self.executor.execute(Box::new(move || {
            std::thread::sleep(delay);
            if fail {
                completer.complete(Err(DeviceError::Release {
                    id,
                    reason: "simulated bus fault".to_string(),
                }));
            } else {
                released.store(true, Ordering::Release);
                trace!("Simulated device {} closed", id);
                completer.complete(Ok(()));
            }
        }));
        completion
    }
}

// ============================================================================
// Fusion
// ============================================================================

/// Per-byte mean of every frame in the bundle
#[derive(Default)]
pub struct MeanFusion {
    sink: OnceLock<Arc<dyn FrameSink>>,
    dimensions: Mutex<Option<Dimensions>>,
}

impl FusionProcessor for MeanFusion {
    fn on_resolution_hint(&self, dimensions: Dimensions) {
        *self.dimensions.lock().unwrap_or_else(|e| e.into_inner()) = Some(dimensions);
    }

    fn on_output_target(&self, sink: Arc<dyn FrameSink>) {
        if self.sink.set(sink).is_err() {
            warn!("MeanFusion output target already configured");
        }
    }

    fn process(&self, bundle: &BundleView) -> Result<(), CaptureError> {
        let sink = self
            .sink
            .get()
            .ok_or_else(|| CaptureError::FusionFailure("no output target".to_string()))?;
        let len = match *self.dimensions.lock().unwrap_or_else(|e| e.into_inner()) {
            Some(dims) => dims.plane_len(),
            None => return Err(CaptureError::FusionFailure("no resolution hint".to_string())),
        };

        let mut acc = vec![0u32; len];
        for frame in bundle.frames() {
            frame.read(|px| {
                for (sum, &p) in acc.iter_mut().zip(px) {
                    *sum += u32::from(p);
                }
            });
        }

        let count = bundle.len().max(1) as u32;
        let timestamp_ns = bundle.frames().iter().map(FrameBuffer::timestamp_ns).max().unwrap_or(0);
        let out = sink.allocate(FrameInfo {
            tag: None,
            timestamp_ns,
        })?;
        out.write(|px| {
            for (dst, sum) in px.iter_mut().zip(&acc) {
                *dst = (sum / count) as u8;
            }
        });
        sink.submit(out)
    }
}

// ============================================================================
// Hardware
// ============================================================================

/// Capture id the simulator mixes into every bundle; never part of a spec
pub const STALE_CAPTURE_ID: CaptureId = -1;

/// Emits tagged raw frames into a frame sink
pub struct HardwareSimulator {
    sink: Arc<dyn FrameSink>,
    frame_interval: Duration,
    alloc_timeout: Duration,
    origin: Instant,
}

impl HardwareSimulator {
    pub fn new(sink: Arc<dyn FrameSink>, frame_interval: Duration) -> Self {
        Self {
            sink,
            frame_interval,
            alloc_timeout: Duration::from_secs(2),
            origin: Instant::now(),
        }
    }

    /// Arrival order for `cycle`: reversed, rotated by cycle, stale id second
    pub fn arrival_order(spec: &CaptureBundleSpec, cycle: u64) -> Vec<CaptureId> {
        let mut order: Vec<CaptureId> = spec.ids().rev().collect();
        if !order.is_empty() {
            let shift = (cycle as usize) % order.len();
            order.rotate_left(shift);
        }
        order.insert(order.len().min(1), STALE_CAPTURE_ID);
        order
    }

    /// Emit one bundle's worth of frames for `cycle`
    pub fn emit_bundle(&self, spec: &CaptureBundleSpec, cycle: u64) -> Result<(), CaptureError> {
        for id in Self::arrival_order(spec, cycle) {
            let frame = self.allocate(FrameInfo::tagged(id, self.origin.elapsed().as_nanos() as i64))?;
            let level = (id.rem_euclid(8) as u8) * 32;
            frame.write(|px| px.fill(level));
            self.sink.submit(frame)?;
            trace!("Cycle {}: emitted frame {}", cycle, id);
            if !self.frame_interval.is_zero() {
                std::thread::sleep(self.frame_interval);
            }
        }
        Ok(())
    }

    // Pool exhaustion is backpressure; wait for the consumer up to a deadline
    fn allocate(&self, info: FrameInfo) -> Result<FrameBuffer, CaptureError> {
        let deadline = Instant::now() + self.alloc_timeout;
        loop {
            match self.sink.allocate(info) {
                Err(CaptureError::Frame(FrameError::PoolExhausted { .. })) if Instant::now() < deadline => {
                    std::thread::sleep(Duration::from_millis(1));
                }
                other => return other,
            }
        }
    }
}
