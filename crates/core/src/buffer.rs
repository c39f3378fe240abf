use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, warn};

/// Writable frame memory handed between the encoder and the transport.
///
/// Implemented by the gadget-side mmap buffers; tests implement it over
/// plain vectors.
pub trait FrameMemory: Send + Sync {
    /// Capacity of the backing memory in bytes.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Exclusive write view of the backing memory.
    ///
    /// # Safety
    /// The caller must hold the owning pool slot in the `InUse` state so
    /// that no other thread reads or writes the memory concurrently.
    unsafe fn as_write_slice(&self) -> &mut [u8];

    /// Record how many bytes of the buffer carry payload.
    fn set_bytes_used(&self, bytes: u32);

    fn bytes_used(&self) -> u32;
}

/// State of one pool slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Free,
    InUse,
    Filled,
}

struct Slot<T> {
    item: Arc<T>,
    state: SlotState,
    timestamp: u64,
}

struct PoolInner<T> {
    consumer: Slot<T>,
    producers: Vec<Slot<T>>,
}

struct PoolShared<T> {
    inner: Mutex<PoolInner<T>>,
    filled: Condvar,
}

const FILLED_WAIT_WARN: Duration = Duration::from_secs(1);

/// Multi-slot producer/consumer exchange with newest-wins hand-off.
///
/// One slot is always held by the consumer side; the remaining slots are
/// filled by producers. `take_filled_and_swap` picks the newest filled
/// producer slot, drops any older filled frames, and trades the consumer
/// slot for it, so the consumer is never left without a buffer and stale
/// frames never reach the transport.
///
/// The pool is a cheap clonable handle; producer and consumer sides keep
/// their own clones.
///
/// # Example
/// ```rust
/// use std::sync::Arc;
/// use gadgetcam_core::buffer::SlotPool;
///
/// let pool = SlotPool::new(Arc::new(0u32), vec![Arc::new(1u32), Arc::new(2u32)]);
/// let lease = pool.try_acquire_free().unwrap();
/// lease.set_timestamp(42);
/// lease.queue_filled();
/// let newest = pool.take_filled_and_swap();
/// assert_eq!(*newest, 1);
/// ```
pub struct SlotPool<T> {
    shared: Arc<PoolShared<T>>,
}

impl<T> Clone for SlotPool<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T> SlotPool<T> {
    pub fn new(consumer: Arc<T>, producers: Vec<Arc<T>>) -> Self {
        Self {
            shared: Arc::new(PoolShared {
                inner: Mutex::new(PoolInner {
                    consumer: Slot {
                        item: consumer,
                        state: SlotState::Free,
                        timestamp: 0,
                    },
                    producers: producers
                        .into_iter()
                        .map(|item| Slot {
                            item,
                            state: SlotState::Free,
                            timestamp: 0,
                        })
                        .collect(),
                }),
                filled: Condvar::new(),
            }),
        }
    }

    /// Producer side: claim the first free producer slot, if any.
    ///
    /// Non-blocking; `None` means every producer slot is in flight and the
    /// caller should drop the incoming frame.
    pub fn try_acquire_free(&self) -> Option<SlotLease<T>> {
        let mut inner = self.shared.inner.lock();
        for (index, slot) in inner.producers.iter_mut().enumerate() {
            if slot.state == SlotState::Free {
                slot.state = SlotState::InUse;
                return Some(SlotLease {
                    shared: self.shared.clone(),
                    index,
                    item: slot.item.clone(),
                    armed: true,
                });
            }
        }
        None
    }

    /// Consumer side: wait for a filled producer slot, take the newest one,
    /// and hand the previous consumer slot back to the producers.
    ///
    /// Blocks until a producer queues a frame. The wait is deliberately
    /// unbounded (the poller only calls this when the gadget driver can
    /// accept a frame); a diagnostic warning is logged every second spent
    /// waiting.
    pub fn take_filled_and_swap(&self) -> Arc<T> {
        let mut inner = self.shared.inner.lock();
        loop {
            if let Some(index) = newest_filled(&inner.producers) {
                let inner = &mut *inner;
                for (i, slot) in inner.producers.iter_mut().enumerate() {
                    if i != index && slot.state == SlotState::Filled {
                        slot.state = SlotState::Free;
                    }
                }
                inner.consumer.state = SlotState::Free;
                std::mem::swap(&mut inner.consumer, &mut inner.producers[index]);
                inner.consumer.state = SlotState::InUse;
                return inner.consumer.item.clone();
            }
            if self
                .shared
                .filled
                .wait_for(&mut inner, FILLED_WAIT_WARN)
                .timed_out()
            {
                warn!("still waiting for a filled producer buffer");
            }
        }
    }

    /// Number of producer slots currently filled.
    pub fn pending_filled(&self) -> usize {
        self.shared
            .inner
            .lock()
            .producers
            .iter()
            .filter(|slot| slot.state == SlotState::Filled)
            .count()
    }

    /// Snapshot of producer slot states, in index order.
    pub fn producer_states(&self) -> Vec<SlotState> {
        self.shared
            .inner
            .lock()
            .producers
            .iter()
            .map(|slot| slot.state)
            .collect()
    }
}

impl<T> PoolShared<T> {
    fn stamp(&self, index: usize, timestamp: u64) {
        let mut inner = self.inner.lock();
        if let Some(slot) = inner.producers.get_mut(index) {
            slot.timestamp = timestamp;
        }
    }

    fn finish(&self, index: usize, state: SlotState) {
        let mut inner = self.inner.lock();
        let Some(slot) = inner.producers.get_mut(index) else {
            error!("pool slot index {index} out of range");
            return;
        };
        if slot.state != SlotState::InUse {
            error!("pool slot {index} released from state {:?}", slot.state);
        }
        slot.state = state;
        drop(inner);
        if state == SlotState::Filled {
            self.filled.notify_one();
        }
    }
}

/// Lease on one producer slot, held while the encoder fills it.
///
/// Consumed by `queue_filled` or `cancel`; dropping an unconsumed lease
/// cancels the slot so an encode failure can never strand it.
pub struct SlotLease<T> {
    shared: Arc<PoolShared<T>>,
    index: usize,
    item: Arc<T>,
    armed: bool,
}

impl<T> SlotLease<T> {
    pub fn item(&self) -> &Arc<T> {
        &self.item
    }

    pub fn index(&self) -> usize {
        self.index
    }

    /// Record the source timestamp used for newest-wins selection.
    pub fn set_timestamp(&self, timestamp: u64) {
        self.shared.stamp(self.index, timestamp);
    }

    /// Mark the slot filled and wake the consumer.
    pub fn queue_filled(mut self) {
        self.armed = false;
        self.shared.finish(self.index, SlotState::Filled);
    }

    /// Return the slot to the free list without publishing it.
    pub fn cancel(mut self) {
        self.armed = false;
        self.shared.finish(self.index, SlotState::Free);
    }
}

impl<T> Drop for SlotLease<T> {
    fn drop(&mut self) {
        if self.armed {
            self.shared.finish(self.index, SlotState::Free);
        }
    }
}

/// Index of the newest filled producer slot. Lower index wins a timestamp
/// tie so selection is deterministic within a run.
fn newest_filled<T>(producers: &[Slot<T>]) -> Option<usize> {
    let mut found: Option<(usize, u64)> = None;
    for (index, slot) in producers.iter().enumerate() {
        if slot.state != SlotState::Filled {
            continue;
        }
        match found {
            Some((_, ts)) if slot.timestamp <= ts => {}
            _ => found = Some((index, slot.timestamp)),
        }
    }
    found.map(|(index, _)| index)
}
