//! Frame acquisition primitives.
//!
//! - `FrameBufferPool`: fixed set of preview buffers, identity lookup, recycling.
//! - `FrameSlot`: single-item latest-frame-wins mailbox.
//! - `FrameDescriptor`: a delivered frame with its sequence id, timestamp and rotation.

pub mod pool;
pub mod slot;
pub mod types;

pub use pool::{
    BufferId, BufferInfo, BufferState, FrameBufferPool, PoolStats, PreviewBuffer, RecycleReason,
    TeardownReport, MAX_PREVIEW_BUFFERS,
};
pub use slot::{FrameSlot, PublishOutcome};
pub(crate) use types::FrameTagger;
pub use types::{Facing, FrameDescriptor, FrameInfo, PixelFormat, Rotation, Size};
