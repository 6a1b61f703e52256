//! Error taxonomy shared by the capture pipeline, the device repository and
//! observable channels.
//!
//! Soft faults (unmatched or untagged frames) are contained inside the
//! aggregator and only ever logged. Collaborator faults (fusion, device release)
//! are surfaced through observable error channels. Invariant violations on
//! frame buffers (double release, use after close) are not represented here:
//! they assert.

use thiserror::Error;

use crate::entities::CaptureId;

/// Frame buffer / pool errors
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("frame pool exhausted ({capacity} buffers outstanding)")]
    PoolExhausted { capacity: usize },
}

/// Capture pipeline errors (ingestion, bundling, fusion)
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CaptureError {
    #[error("frame tagged {0} does not belong to the current bundle")]
    UnmatchedFrame(CaptureId),
    #[error("frame carries no capture id tag")]
    MissingTag,
    #[error("fusion failed: {0}")]
    FusionFailure(String),
    #[error("capture bundle is empty")]
    EmptyBundle,
    #[error("capture bundle of {expected} stages exceeds input depth of {capacity} frames")]
    BundleTooLarge { expected: usize, capacity: usize },
    #[error("operation not valid in aggregator state {0}")]
    InvalidState(&'static str),
    #[error("frame queue full ({0} frames)")]
    QueueFull(usize),
    #[error("frame queue closed")]
    Closed,
    #[error(transparent)]
    Frame(#[from] FrameError),
}

/// Errors reported by a device platform or a device handle
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DeviceError {
    #[error("unable to enumerate devices: {0}")]
    Enumeration(String),
    #[error("device {id} failed to open: {reason}")]
    Open { id: String, reason: String },
    #[error("device {id} failed to release: {reason}")]
    Release { id: String, reason: String },
}

/// Device repository errors
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RepositoryError {
    /// Caller asked for a device that was never registered or has been shut down.
    #[error("unknown device: {0}")]
    UnknownDevice(String),
    #[error(transparent)]
    Device(#[from] DeviceError),
}

/// Errors produced when reading an observable channel
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ObservableError<E> {
    #[error("observable has not yet been initialized with a value")]
    NotYetInitialized,
    #[error("{0}")]
    Published(E),
}

/// Completer dropped before it produced a value
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
#[error("completion abandoned before a value was set")]
pub struct Abandoned;
