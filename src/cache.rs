// Cache module
// This module implements the sliding-window frame cache shared between the prefetch worker and
// foreground readers. Entries and the target set live behind one read-write lock.

pub use crate::formats::FrameData;

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

#[derive(Debug, Default)]
struct CacheState {
    entries: HashMap<usize, FrameData>,
    targets: HashSet<usize>,
    // Same indices as `targets`, nearest to the cursor first.
    target_order: Vec<usize>,
}

fn collect_targets<I>(targets: I) -> (HashSet<usize>, Vec<usize>)
where
    I: IntoIterator<Item = usize>,
{
    let mut set = HashSet::new();
    let order = targets.into_iter().filter(|t| set.insert(*t)).collect();
    (set, order)
}

/// Thread-safe frame cache plus the set of indices that should be resident.
///
/// One lock covers both halves. The worker decides what to evict by comparing entries with
/// targets, and the foreground rewrites targets on every position change; holding both under the
/// same lock lets eviction re-check membership atomically, at the cost of readers and the worker
/// contending on a single lock. No I/O ever happens while the lock is held.
///
/// Cloning shares the underlying state.
#[derive(Debug, Clone, Default)]
pub struct FrameCache {
    state: Arc<RwLock<CacheState>>,
}

impl FrameCache {
    /// Create an empty cache with no targets
    pub fn new() -> Self {
        Self::default()
    }

    // Every mutation is a single map or set operation, so state behind a poisoned lock is intact.
    fn read(&self) -> RwLockReadGuard<'_, CacheState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, CacheState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Look up a frame. Returns None if not resident.
    pub fn get(&self, frame_index: usize) -> Option<FrameData> {
        self.read().entries.get(&frame_index).cloned()
    }

    /// Insert or overwrite a frame.
    pub fn put(&self, frame_index: usize, frame_data: FrameData) {
        self.write().entries.insert(frame_index, frame_data);
    }

    /// Insert a frame only if its index is still a target.
    /// Returns whether the frame was stored.
    pub fn put_if_wanted(&self, frame_index: usize, frame_data: FrameData) -> bool {
        let mut state = self.write();
        if state.targets.contains(&frame_index) {
            state.entries.insert(frame_index, frame_data);
            true
        } else {
            false
        }
    }

    /// Insert a frame and replace the target set in one write.
    /// The worker can never see the new entry without the targets that keep it.
    pub fn insert_with_targets<I>(&self, frame_index: usize, frame_data: FrameData, targets: I)
    where
        I: IntoIterator<Item = usize>,
    {
        let (set, order) = collect_targets(targets);
        let mut state = self.write();
        state.entries.insert(frame_index, frame_data);
        state.targets = set;
        state.target_order = order;
    }

    /// Remove a frame; no-op if absent.
    pub fn remove(&self, frame_index: usize) -> Option<FrameData> {
        self.write().entries.remove(&frame_index)
    }

    /// Check if a frame is resident.
    pub fn contains(&self, frame_index: usize) -> bool {
        self.read().entries.contains_key(&frame_index)
    }

    /// Snapshot of resident indices.
    pub fn keys(&self) -> HashSet<usize> {
        self.read().entries.keys().copied().collect()
    }

    /// Replace the target set. Duplicates collapse, keeping the first occurrence's place.
    pub fn set_targets<I>(&self, targets: I)
    where
        I: IntoIterator<Item = usize>,
    {
        let (set, order) = collect_targets(targets);
        let mut state = self.write();
        state.targets = set;
        state.target_order = order;
    }

    /// Snapshot of the target set.
    pub fn targets(&self) -> HashSet<usize> {
        self.read().targets.clone()
    }

    /// Targets in priority order and resident indices, taken under one read lock.
    pub fn snapshot(&self) -> (Vec<usize>, HashSet<usize>) {
        let state = self.read();
        (state.target_order.clone(), state.entries.keys().copied().collect())
    }

    /// Drop every entry that is not a target at the moment the write lock is taken.
    /// Returns the evicted indices.
    pub fn evict_stale(&self) -> Vec<usize> {
        let mut state = self.write();
        let CacheState { entries, targets, .. } = &mut *state;
        let stale: Vec<usize> = entries
            .keys()
            .filter(|k| !targets.contains(*k))
            .copied()
            .collect();
        for k in &stale {
            entries.remove(k);
        }
        stale
    }

    /// Number of resident frames.
    pub fn len(&self) -> usize {
        self.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
