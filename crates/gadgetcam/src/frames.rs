//! Bookkeeping for CPU-locked camera frames in flight through the encode
//! pipeline.

use gadgetcam_codec::prelude::LockedFrame;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::error;

#[derive(Default)]
struct LedgerInner {
    next_id: u32,
    frames: HashMap<u32, Arc<dyn LockedFrame>>,
}

/// Maps monotonically increasing frame ids to their locked buffers so
/// every accepted frame is released exactly once, on success, failure, or
/// shutdown drain.
#[derive(Default)]
pub struct FrameLedger {
    inner: Mutex<LedgerInner>,
}

impl FrameLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a locked frame and hand out its id.
    pub fn insert(&self, frame: Arc<dyn LockedFrame>) -> u32 {
        let mut inner = self.inner.lock().expect("frame ledger poisoned");
        let id = inner.next_id;
        inner.next_id = inner.next_id.wrapping_add(1);
        inner.frames.insert(id, frame);
        id
    }

    /// Drop the ledger's reference for `id`, releasing the CPU lock once
    /// the pipeline's own reference is gone.
    pub fn release(&self, id: u32) -> bool {
        let removed = self
            .inner
            .lock()
            .expect("frame ledger poisoned")
            .frames
            .remove(&id);
        if removed.is_none() {
            error!("no locked frame registered for id {id}");
        }
        removed.is_some()
    }

    /// Number of frames currently in flight.
    pub fn len(&self) -> usize {
        self.inner.lock().expect("frame ledger poisoned").frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
