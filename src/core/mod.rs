//! Core engine modules - completion, workers, observable, aggregation, devices
//!
//! These modules coordinate capture hardware, independent of any platform.

pub mod aggregator;
pub mod completion;
pub mod frame_queue;
pub mod observable;
pub mod repository;
pub mod slot_bundle;
pub mod workers;

// Re-exports for convenience
pub use aggregator::{AggregatorState, CaptureAggregator, FusedCycle};
pub use completion::{Completer, Completion};
pub use frame_queue::FrameQueue;
pub use observable::{BroadcastState, Observer};
pub use repository::{DeviceRepository, DeviceState};
pub use slot_bundle::{SlotOutcome, TaggedSlotBundle};
pub use workers::{DirectExecutor, Workers};
