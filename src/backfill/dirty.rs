use crate::time::Instant;
use std::collections::HashSet;
use std::sync::Mutex;

/// Bucket starts whose archive content is stale because new data arrived.
///
/// Written by stream delivery threads, drained by the merge pass. A single
/// mutex guards the set; the critical section is one hash insert for
/// [`mark`](Self::mark) and one move-out for [`drain_sorted`](Self::drain_sorted),
/// so producers never wait on anything slower than that.
#[derive(Debug, Default)]
pub struct DirtySet {
    pending: Mutex<HashSet<Instant>>,
}

impl DirtySet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Idempotent.
    pub fn mark(&self, bucket_start: Instant) {
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        pending.insert(bucket_start);
    }

    /// Atomically takes every pending entry and returns them in ascending
    /// order. Marks arriving after the swap land in the next drain.
    pub fn drain_sorted(&self) -> Vec<Instant> {
        let taken = {
            let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
            std::mem::take(&mut *pending)
        };
        let mut sorted: Vec<Instant> = taken.into_iter().collect();
        sorted.sort_unstable();
        sorted
    }

    pub fn len(&self) -> usize {
        self.pending.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
