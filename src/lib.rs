//! capture-coord - Multi-frame capture coordination library
//!
//! Re-exports all modules for use by binary targets.

// Core engine (completion, workers, observable, aggregator, repository)
pub mod core;

// Data model and collaborator traits
pub mod entities;

// App modules
pub mod cli;
pub mod config;
pub mod error;
pub mod sim;

#[cfg(test)]
mod test_support;

// Re-export commonly used types from core
pub use core::aggregator::{CaptureAggregator, FusedCycle};
pub use core::observable::{BroadcastState, Observer};
pub use core::repository::DeviceRepository;
pub use core::slot_bundle::TaggedSlotBundle;
pub use core::workers::Workers;

// Re-export entities
pub use entities::{CaptureBundleSpec, CaptureId, ConsumerGroup, FrameBuffer};
pub use error::{CaptureError, DeviceError, RepositoryError};
