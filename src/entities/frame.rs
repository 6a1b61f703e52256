//! Pool-backed frame buffers handed from hardware to the capture pipeline.
//!
//! **Why**: Hardware exposes a fixed number of pixel buffers. Every buffer that
//! is not released stays out of the pool, and once the pool is empty the device
//! stalls. Ownership of a buffer moves hardware → bundle → fusion → release.
//!
//! **Used by**: FrameQueue (allocation/queueing), TaggedSlotBundle (slots),
//! CaptureAggregator (ingestion/fusion), fusion collaborators (read-only).
//!
//! # Handles
//!
//! `FrameBuffer` is a cheap clonable handle (`Arc<Mutex<..>>`), the same way a
//! cached frame is shared between workers and the viewport. Cloning a handle
//! does NOT duplicate the release duty: exactly one owner calls `release()`.
//! Releasing twice or touching pixels after release is a bug and asserts.

use log::trace;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::FrameError;

/// Tag correlating a frame with one stage of a multi-frame capture request.
pub type CaptureId = i32;

/// Frame dimensions in pixels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, serde::Serialize, serde::Deserialize)]
pub struct Dimensions {
    pub width: u32,
    pub height: u32,
}

impl Dimensions {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Bytes needed for a single-channel 8-bit plane
    pub fn plane_len(&self) -> usize {
        self.width as usize * self.height as usize
    }
}

/// Metadata attached to a frame by the capture request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FrameInfo {
    /// Capture stage this frame belongs to (None if hardware lost the tag)
    pub tag: Option<CaptureId>,
    pub timestamp_ns: i64,
}

impl FrameInfo {
    pub fn tagged(tag: CaptureId, timestamp_ns: i64) -> Self {
        Self { tag: Some(tag), timestamp_ns }
    }
}

/// Internal frame data protected by mutex
#[derive(Debug)]
struct FrameData {
    pixels: Vec<u8>,
    info: FrameInfo,
    released: bool,
}

/// Outstanding-buffer accounting shared between a pool and its buffers
#[derive(Debug)]
struct PoolCounter {
    capacity: usize,
    outstanding: AtomicUsize,
}

/// Handle to one unit of pool-backed pixel memory
#[derive(Debug, Clone)]
pub struct FrameBuffer {
    serial: u64,
    dimensions: Dimensions,
    data: Arc<Mutex<FrameData>>,
    pool: Arc<PoolCounter>,
}

impl FrameBuffer {
    /// Unique serial of the underlying buffer (shared by all clones)
    pub fn serial(&self) -> u64 {
        self.serial
    }

    pub fn dimensions(&self) -> Dimensions {
        self.dimensions
    }

    pub fn info(&self) -> FrameInfo {
        self.lock().info
    }

    pub fn tag(&self) -> Option<CaptureId> {
        self.lock().info.tag
    }

    pub fn set_tag(&self, tag: Option<CaptureId>) {
        let mut data = self.lock();
        assert!(!data.released, "frame buffer {} used after close", self.serial);
        data.info.tag = tag;
    }

    pub fn timestamp_ns(&self) -> i64 {
        self.lock().info.timestamp_ns
    }

    pub fn is_released(&self) -> bool {
        self.lock().released
    }

    /// Read pixel memory.
    ///
    /// # Panics
    /// If the buffer has already been released (use after close).
    pub fn read<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        let data = self.lock();
        assert!(!data.released, "frame buffer {} used after close", self.serial);
        f(&data.pixels)
    }

    /// Write pixel memory (producer side).
    ///
    /// # Panics
    /// If the buffer has already been released (use after close).
    pub fn write<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        let mut data = self.lock();
        assert!(!data.released, "frame buffer {} used after close", self.serial);
        f(&mut data.pixels)
    }

    /// Return the buffer to its pool. Must be called exactly once per buffer.
    ///
    /// # Panics
    /// If the buffer was already released (double release).
    pub fn release(&self) {
        {
            let mut data = self.lock();
            assert!(!data.released, "frame buffer {} released twice", self.serial);
            data.released = true;
            data.pixels = Vec::new();
        }
        self.pool.outstanding.fetch_sub(1, Ordering::AcqRel);
        trace!("Frame {} released", self.serial);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FrameData> {
        self.data.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Fixed-capacity allocator standing in for a hardware buffer pool
#[derive(Debug, Clone)]
pub struct FramePool {
    dimensions: Dimensions,
    counter: Arc<PoolCounter>,
}

static NEXT_SERIAL: AtomicU64 = AtomicU64::new(1);

impl FramePool {
    pub fn new(dimensions: Dimensions, capacity: usize) -> Self {
        Self {
            dimensions,
            counter: Arc::new(PoolCounter {
                capacity,
                outstanding: AtomicUsize::new(0),
            }),
        }
    }

    /// Take a buffer from the pool, zero-filled.
    pub fn allocate(&self, info: FrameInfo) -> Result<FrameBuffer, FrameError> {
        let capacity = self.counter.capacity;
        // Reserve a slot atomically so concurrent producers can't overshoot
        self.counter
            .outstanding
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| (n < capacity).then_some(n + 1))
            .map_err(|_| FrameError::PoolExhausted { capacity })?;

        let serial = NEXT_SERIAL.fetch_add(1, Ordering::Relaxed);
        trace!("Frame {} allocated (tag={:?})", serial, info.tag);

        Ok(FrameBuffer {
            serial,
            dimensions: self.dimensions,
            data: Arc::new(Mutex::new(FrameData {
                pixels: vec![0u8; self.dimensions.plane_len()],
                info,
                released: false,
            })),
            pool: Arc::clone(&self.counter),
        })
    }

    /// Buffers allocated and not yet released
    pub fn outstanding(&self) -> usize {
        self.counter.outstanding.load(Ordering::Acquire)
    }

    pub fn capacity(&self) -> usize {
        self.counter.capacity
    }

    pub fn dimensions(&self) -> Dimensions {
        self.dimensions
    }
}
