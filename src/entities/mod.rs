//! Entities module - data model and collaborator interfaces
//!
//! Frames and their pool, capture bundle specs, consumer groups, and the
//! traits through which the core talks to hardware, devices and fusion.

pub mod capture;
pub mod consumer;
pub mod frame;
pub mod traits;

pub use capture::CaptureBundleSpec;
pub use consumer::{ConsumerGroup, ConsumerId, GroupStateListener};
pub use frame::{CaptureId, Dimensions, FrameBuffer, FrameInfo, FramePool};
pub use traits::{
    BundleView, DeviceHandle, DevicePlatform, Executor, FrameListener, FrameSink, FrameSource,
    FusionProcessor, Job,
};
