//! Bounded frame queue backed by its own fixed buffer pool.
//!
//! Plays both hardware roles around the aggregator: the *input* that raw
//! tagged frames are produced into, and the *output* that fusion writes its
//! fused frame into. Consumers either register a listener (push) or call
//! `acquire_next` / `acquire_latest` (pull).
//!
//! Queue depth equals pool capacity, so a producer that outruns its consumer
//! sees `PoolExhausted` from `allocate` rather than an unbounded backlog.

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use log::{debug, trace};
use std::sync::{Arc, Mutex};

use crate::entities::{
    Dimensions, Executor, FrameBuffer, FrameInfo, FrameListener, FramePool, FrameSink, FrameSource,
};
use crate::error::CaptureError;

struct QueueState {
    closed: bool,
    listener: Option<(FrameListener, Arc<dyn Executor>)>,
}

pub struct FrameQueue {
    pool: FramePool,
    tx: Sender<FrameBuffer>,
    rx: Receiver<FrameBuffer>,
    state: Mutex<QueueState>,
}

impl std::fmt::Debug for FrameQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameQueue")
            .field("dimensions", &self.pool.dimensions())
            .field("queued", &self.rx.len())
            .field("outstanding", &self.pool.outstanding())
            .finish()
    }
}

impl FrameQueue {
    pub fn new(dimensions: Dimensions, max_frames: usize) -> Self {
        let max_frames = max_frames.max(1);
        let (tx, rx) = bounded(max_frames);
        Self {
            pool: FramePool::new(dimensions, max_frames),
            tx,
            rx,
            state: Mutex::new(QueueState {
                closed: false,
                listener: None,
            }),
        }
    }

    pub fn pool(&self) -> &FramePool {
        &self.pool
    }

    /// Frames waiting to be acquired
    pub fn queued(&self) -> usize {
        self.rx.len()
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl FrameSink for FrameQueue {
    fn allocate(&self, info: FrameInfo) -> Result<FrameBuffer, CaptureError> {
        if self.lock().closed {
            return Err(CaptureError::Closed);
        }
        Ok(self.pool.allocate(info)?)
    }

    fn submit(&self, frame: FrameBuffer) -> Result<(), CaptureError> {
        let listener = {
            let state = self.lock();
            if state.closed {
                drop(state);
                frame.release();
                return Err(CaptureError::Closed);
            }
            match self.tx.try_send(frame) {
                Ok(()) => state.listener.clone(),
                Err(TrySendError::Full(frame)) => {
                    drop(state);
                    frame.release();
                    return Err(CaptureError::QueueFull(self.pool.capacity()));
                }
                Err(TrySendError::Disconnected(frame)) => {
                    drop(state);
                    frame.release();
                    return Err(CaptureError::Closed);
                }
            }
        };

        if let Some((listener, executor)) = listener {
            executor.execute(Box::new(move || listener()));
        }
        Ok(())
    }
}

impl FrameSource for FrameQueue {
    fn acquire_latest(&self) -> Option<FrameBuffer> {
        let mut latest: Option<FrameBuffer> = None;
        while let Ok(frame) = self.rx.try_recv() {
            if let Some(skipped) = latest.replace(frame) {
                trace!("acquire_latest: skipping frame {}", skipped.serial());
                skipped.release();
            }
        }
        latest
    }

    fn acquire_next(&self) -> Option<FrameBuffer> {
        self.rx.try_recv().ok()
    }

    fn set_listener(&self, listener: FrameListener, executor: Arc<dyn Executor>) {
        self.lock().listener = Some((listener, executor));
    }

    fn dimensions(&self) -> Dimensions {
        self.pool.dimensions()
    }

    fn max_frames(&self) -> usize {
        self.pool.capacity()
    }

    fn close(&self) {
        let mut state = self.lock();
        if state.closed {
            return;
        }
        state.closed = true;
        state.listener = None;
        let mut dropped = 0;
        while let Ok(frame) = self.rx.try_recv() {
            frame.release();
            dropped += 1;
        }
        debug!("FrameQueue closed, released {} queued frames", dropped);
    }
}
