//! Single-frame mailbox between the delivery callback and the worker.
//!
//! Latest frame wins: publishing while a frame is pending evicts the older
//! one and recycles its buffer before `publish` returns. Nothing is queued.

use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

use super::pool::{BufferState, FrameBufferPool, RecycleReason};
use super::types::FrameDescriptor;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PublishOutcome {
    /// Slot was empty.
    Stored,
    /// A pending frame was evicted and its buffer recycled.
    Replaced { evicted_sequence_id: u64 },
}

#[derive(Default)]
struct SlotState {
    pending: Option<FrameDescriptor>,
    cancelled: bool,
}

pub struct FrameSlot {
    state: Mutex<SlotState>,
    ready: Condvar,
    pool: Arc<FrameBufferPool>,
}

impl FrameSlot {
    pub fn new(pool: Arc<FrameBufferPool>) -> Self {
        Self {
            state: Mutex::new(SlotState::default()),
            ready: Condvar::new(),
            pool,
        }
    }

    // A panicking detector must not wedge the frame path, so poison is ignored.
    fn lock(&self) -> MutexGuard<'_, SlotState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Store `frame` as the pending frame. Never blocks on the consumer.
    ///
    /// Runs on the device's delivery thread.
    pub fn publish(&self, frame: FrameDescriptor) -> PublishOutcome {
        self.pool.mark(frame.payload().id(), BufferState::Pending);
        let evicted = {
            let mut state = self.lock();
            let evicted = state.pending.replace(frame);
            self.ready.notify_all();
            evicted
        };

        match evicted {
            Some(old) => {
                let evicted_sequence_id = old.sequence_id();
                log::debug!("FrameSlot: frame {} evicted unprocessed", evicted_sequence_id);
                self.pool.recycle(old.into_payload(), RecycleReason::Evicted);
                PublishOutcome::Replaced {
                    evicted_sequence_id,
                }
            }
            None => PublishOutcome::Stored,
        }
    }

    /// Block until a frame is pending or the slot is cancelled.
    ///
    /// Returns `None` on cancellation, even if a frame is pending; that frame
    /// stays in the slot for `drain`. On success the slot is left empty and
    /// the caller owns the frame.
    pub fn take_blocking(&self) -> Option<FrameDescriptor> {
        let guard = self.lock();
        let mut state = self
            .ready
            .wait_while(guard, |s| s.pending.is_none() && !s.cancelled)
            .unwrap_or_else(PoisonError::into_inner);
        if state.cancelled {
            return None;
        }
        let frame = state.pending.take()?;
        drop(state);
        self.pool.mark(frame.payload().id(), BufferState::Processing);
        Some(frame)
    }

    /// Request cancellation and wake any waiter.
    pub fn cancel(&self) {
        let mut state = self.lock();
        state.cancelled = true;
        self.ready.notify_all();
    }

    pub fn is_cancelled(&self) -> bool {
        self.lock().cancelled
    }

    pub fn is_occupied(&self) -> bool {
        self.lock().pending.is_some()
    }

    /// Remove any pending frame without waiting. Used at teardown.
    pub fn drain(&self) -> Option<FrameDescriptor> {
        self.lock().pending.take()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::pool::tests::CollectingRecycler;
    use crate::frame::pool::PreviewBuffer;
    use crate::frame::types::{FrameTagger, PixelFormat, Rotation, Size};
    use std::thread;
    use std::time::Duration;

    fn setup(count: usize) -> (Arc<CollectingRecycler>, Arc<FrameBufferPool>, Vec<PreviewBuffer>) {
        let recycler = Arc::new(CollectingRecycler::default());
        let mut pool = FrameBufferPool::new(recycler.clone());
        let buffers = pool.acquire_set(count, 16).unwrap();
        (recycler, Arc::new(pool), buffers)
    }

    fn tagger() -> FrameTagger {
        FrameTagger::new(Size::new(4, 2), PixelFormat::Nv21, Rotation::Deg90)
    }

    #[test]
    fn latest_publish_wins_and_evictions_are_recycled_immediately() {
        let (recycler, pool, buffers) = setup(4);
        let slot = FrameSlot::new(pool.clone());
        let tagger = tagger();

        let mut outcomes = Vec::new();
        for buffer in buffers {
            outcomes.push(slot.publish(tagger.tag(buffer)));
            // Every eviction so far is already back on the device.
            assert_eq!(recycler.queue.lock().unwrap().len(), outcomes.len() - 1);
        }

        assert_eq!(outcomes[0], PublishOutcome::Stored);
        assert_eq!(
            outcomes[3],
            PublishOutcome::Replaced {
                evicted_sequence_id: 3
            }
        );
        let frame = slot.take_blocking().unwrap();
        assert_eq!(frame.sequence_id(), 4);
        assert_eq!(frame.rotation(), Rotation::Deg90);
        assert!(!slot.is_occupied());
        assert_eq!(pool.stats().evicted, 3);
        assert_eq!(pool.count_in(BufferState::Processing), 1);
    }

    #[test]
    fn take_blocks_until_publish() {
        let (_recycler, pool, mut buffers) = setup(1);
        let slot = Arc::new(FrameSlot::new(pool));
        let tagger = tagger();

        let waiter = {
            let slot = slot.clone();
            thread::spawn(move || slot.take_blocking().map(|f| f.sequence_id()))
        };
        thread::sleep(Duration::from_millis(50));
        assert!(!waiter.is_finished());

        slot.publish(tagger.tag(buffers.remove(0)));
        assert_eq!(waiter.join().unwrap(), Some(1));
    }

    #[test]
    fn cancel_unblocks_waiter() {
        let (_recycler, pool, _buffers) = setup(1);
        let slot = Arc::new(FrameSlot::new(pool));

        let waiter = {
            let slot = slot.clone();
            thread::spawn(move || slot.take_blocking().is_none())
        };
        thread::sleep(Duration::from_millis(20));
        slot.cancel();
        assert!(waiter.join().unwrap());
        assert!(slot.is_cancelled());
    }

    #[test]
    fn cancellation_takes_priority_over_pending_frame() {
        let (_recycler, pool, mut buffers) = setup(1);
        let slot = FrameSlot::new(pool);

        slot.publish(tagger().tag(buffers.remove(0)));
        slot.cancel();
        assert!(slot.take_blocking().is_none());
        assert_eq!(slot.drain().map(|f| f.sequence_id()), Some(1));
    }
}
