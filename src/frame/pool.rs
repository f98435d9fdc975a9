//! Preview buffer pool.
//!
//! The pool allocates a small fixed set of preview buffers once per run and
//! tracks where each one is. Recycling does not go to an internal free list:
//! a recycled buffer is requeued straight onto the device's callback queue so
//! the hardware can write the next frame into it.
//!
//! Identity is a stable slot index assigned at allocation plus the pool's own
//! id, so a buffer delivered by the device maps back to its table entry in
//! O(1) without looking at content.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use crate::device::BufferRecycler;
use crate::error::{CaptureError, CaptureResult};

/// Upper bound on preview buffers per run.
pub const MAX_PREVIEW_BUFFERS: usize = 16;

static NEXT_POOL_ID: AtomicU32 = AtomicU32::new(1);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BufferId {
    pool: u32,
    index: u16,
}

impl BufferId {
    pub fn index(&self) -> usize {
        self.index as usize
    }
}

/// A fixed-size reusable preview buffer. Not `Clone`: exactly one owner at a time.
pub struct PreviewBuffer {
    id: BufferId,
    data: Box<[u8]>,
}

impl PreviewBuffer {
    pub fn id(&self) -> BufferId {
        self.id
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    /// Devices write frame data through this.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

/// Where a buffer currently is.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BufferState {
    /// Queued on the device, waiting to be filled.
    Queued,
    /// Holding a frame in the slot.
    Pending,
    /// Being read by the detector.
    Processing,
    /// Freed at teardown.
    Released,
}

impl BufferState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => BufferState::Queued,
            1 => BufferState::Pending,
            2 => BufferState::Processing,
            _ => BufferState::Released,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            BufferState::Queued => 0,
            BufferState::Pending => 1,
            BufferState::Processing => 2,
            BufferState::Released => 3,
        }
    }
}

/// Table entry for a managed buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BufferInfo {
    pub id: BufferId,
    pub len: usize,
    pub state: BufferState,
}

/// Why a buffer went back to the device.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RecycleReason {
    /// Overwritten in the slot by a newer frame.
    Evicted,
    /// Returned after a detection call, successful or not.
    Processed,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub allocated: usize,
    pub outstanding: usize,
    pub evicted: u64,
    pub processed: u64,
}

/// Result of tearing the pool down at stop.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TeardownReport {
    pub reclaimed: usize,
    pub missing: usize,
}

pub struct FrameBufferPool {
    id: u32,
    recycler: Arc<dyn BufferRecycler>,
    states: Box<[AtomicU8]>,
    buffer_len: usize,
    closed: AtomicBool,
    evicted: AtomicU64,
    processed: AtomicU64,
}

impl FrameBufferPool {
    pub fn new(recycler: Arc<dyn BufferRecycler>) -> Self {
        Self {
            id: NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed),
            recycler,
            states: Box::new([]),
            buffer_len: 0,
            closed: AtomicBool::new(false),
            evicted: AtomicU64::new(0),
            processed: AtomicU64::new(0),
        }
    }

    /// Allocate `count` fresh buffers of `len` bytes. Called once per run.
    ///
    /// The returned buffers are owned by the caller, who hands them to the
    /// device; they are tracked as queued from here on.
    pub fn acquire_set(&mut self, count: usize, len: usize) -> CaptureResult<Vec<PreviewBuffer>> {
        if !self.states.is_empty() {
            return Err(CaptureError::BufferAllocation(
                "pool already holds an acquired set".to_string(),
            ));
        }
        if count == 0 || count > MAX_PREVIEW_BUFFERS {
            return Err(CaptureError::BufferAllocation(format!(
                "buffer count {} outside 1..={}",
                count, MAX_PREVIEW_BUFFERS
            )));
        }
        if len == 0 {
            return Err(CaptureError::BufferAllocation(
                "zero-length preview buffer".to_string(),
            ));
        }

        let mut buffers = Vec::with_capacity(count);
        for index in 0..count {
            let mut data = Vec::new();
            data.try_reserve_exact(len).map_err(|e| {
                CaptureError::BufferAllocation(format!(
                    "cannot allocate {} bytes for buffer {}: {}",
                    len, index, e
                ))
            })?;
            data.resize(len, 0);
            buffers.push(PreviewBuffer {
                id: BufferId {
                    pool: self.id,
                    index: index as u16,
                },
                data: data.into_boxed_slice(),
            });
        }

        self.states = (0..count)
            .map(|_| AtomicU8::new(BufferState::Queued.as_u8()))
            .collect();
        self.buffer_len = len;

        log::debug!(
            "FrameBufferPool: allocated {} buffers of {} bytes",
            count,
            len
        );
        Ok(buffers)
    }

    /// Map a delivered buffer back to its table entry.
    ///
    /// Returns `None` for buffers this pool did not allocate.
    pub fn lookup(&self, buffer: &PreviewBuffer) -> Option<BufferInfo> {
        if buffer.id.pool != self.id {
            return None;
        }
        let state = self.states.get(buffer.id.index())?;
        Some(BufferInfo {
            id: buffer.id,
            len: buffer.len(),
            state: BufferState::from_u8(state.load(Ordering::Acquire)),
        })
    }

    /// Hand a consumed buffer back to the device's callback queue.
    ///
    /// After teardown the buffer is freed instead.
    pub fn recycle(&self, buffer: PreviewBuffer, reason: RecycleReason) {
        if self.lookup(&buffer).is_none() {
            log::warn!(
                "FrameBufferPool: dropping foreign buffer {:?} on recycle",
                buffer.id
            );
            return;
        }
        match reason {
            RecycleReason::Evicted => self.evicted.fetch_add(1, Ordering::Relaxed),
            RecycleReason::Processed => self.processed.fetch_add(1, Ordering::Relaxed),
        };

        if self.closed.load(Ordering::Acquire) {
            self.mark(buffer.id, BufferState::Released);
            return;
        }
        self.mark(buffer.id, BufferState::Queued);
        self.recycler.requeue(buffer);
    }

    pub(crate) fn mark(&self, id: BufferId, state: BufferState) {
        if id.pool != self.id {
            return;
        }
        if let Some(slot) = self.states.get(id.index()) {
            slot.store(state.as_u8(), Ordering::Release);
        }
    }

    /// Reclaim the buffers the device gave back at stop and free the set.
    ///
    /// Anything not returned by then is reported as missing.
    pub fn teardown(&self, returned: Vec<PreviewBuffer>) -> TeardownReport {
        self.closed.store(true, Ordering::Release);

        let mut reclaimed = 0;
        for buffer in returned {
            if self.lookup(&buffer).is_some() {
                self.mark(buffer.id, BufferState::Released);
                reclaimed += 1;
            }
        }

        let missing = self.outstanding();
        if missing > 0 {
            log::error!(
                "FrameBufferPool: {} of {} buffers were not returned at teardown",
                missing,
                self.states.len()
            );
        }
        TeardownReport { reclaimed, missing }
    }

    pub fn allocated(&self) -> usize {
        self.states.len()
    }

    pub fn buffer_len(&self) -> usize {
        self.buffer_len
    }

    /// Buffers not yet released: queued on the device or held by the pipeline.
    pub fn outstanding(&self) -> usize {
        self.states
            .iter()
            .filter(|s| BufferState::from_u8(s.load(Ordering::Acquire)) != BufferState::Released)
            .count()
    }

    pub fn count_in(&self, state: BufferState) -> usize {
        self.states
            .iter()
            .filter(|s| BufferState::from_u8(s.load(Ordering::Acquire)) == state)
            .count()
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            allocated: self.allocated(),
            outstanding: self.outstanding(),
            evicted: self.evicted.load(Ordering::Relaxed),
            processed: self.processed.load(Ordering::Relaxed),
        }
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
