// Worker module
// This module implements the background prefetch loop. Each pass diffs the cache against its
// target set, evicts what is no longer wanted and loads what is missing, one frame at a time.

use std::collections::HashSet;
use std::ops::ControlFlow;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, trace, warn};

use crate::cache::FrameCache;
use crate::formats::IndexedSource;
use crate::runtime::Runtime;

/// Counters published by a running worker.
#[derive(Debug, Default)]
struct WorkerCounters {
    passes: AtomicU64,
    loaded: AtomicU64,
    evicted: AtomicU64,
    failed: AtomicU64,
    discarded: AtomicU64,
}

/// Point-in-time copy of a worker's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerStats {
    /// Completed reconciliation passes
    pub passes: u64,
    /// Frames fetched and stored
    pub loaded: u64,
    /// Entries dropped because they left the target set
    pub evicted: u64,
    /// Fetches that returned an error
    pub failed: u64,
    /// Fetched frames thrown away because the target moved while loading
    pub discarded: u64,
}

impl WorkerCounters {
    fn stats(&self) -> WorkerStats {
        WorkerStats {
            passes: self.passes.load(Ordering::Relaxed),
            loaded: self.loaded.load(Ordering::Relaxed),
            evicted: self.evicted.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            discarded: self.discarded.load(Ordering::Relaxed),
        }
    }
}

/// The reconciliation loop for one source/cache pair.
pub struct PrefetchWorker {
    source: Arc<dyn IndexedSource>,
    cache: FrameCache,
    poll_interval: Duration,
    stop: watch::Receiver<bool>,
    counters: Arc<WorkerCounters>,
    // Indices whose last fetch failed; only the first failure is logged at warn level.
    failing: HashSet<usize>,
}

impl PrefetchWorker {
    fn new(
        source: Arc<dyn IndexedSource>,
        cache: FrameCache,
        poll_interval: Duration,
        stop: watch::Receiver<bool>,
        counters: Arc<WorkerCounters>,
    ) -> Self {
        Self {
            source,
            cache,
            poll_interval,
            stop,
            counters,
            failing: HashSet::new(),
        }
    }

    fn is_stopped(&self) -> bool {
        // A dropped sender means the owning handle is gone.
        self.stop.has_changed().is_err() || *self.stop.borrow()
    }

    /// Run until the stop signal is observed.
    pub async fn run(mut self) {
        debug!(source = self.source.name(), "Prefetch worker started");
        while !self.is_stopped() {
            if self.reconcile().await.is_break() {
                break;
            }
            self.counters.passes.fetch_add(1, Ordering::Relaxed);
            if self.pause().await.is_break() {
                break;
            }
        }
        debug!(source = self.source.name(), "Prefetch worker stopped");
    }

    /// One pass: evict stale entries, then load missing targets nearest first.
    async fn reconcile(&mut self) -> ControlFlow<()> {
        let (wanted, present) = self.cache.snapshot();

        if present.iter().any(|k| !wanted.contains(k)) {
            if self.is_stopped() {
                return ControlFlow::Break(());
            }
            let evicted = self.cache.evict_stale();
            if !evicted.is_empty() {
                trace!(?evicted, "Evicted frames outside the window");
                self.counters
                    .evicted
                    .fetch_add(evicted.len() as u64, Ordering::Relaxed);
            }
        }

        for index in wanted.into_iter().filter(|k| !present.contains(k)) {
            if self.is_stopped() {
                return ControlFlow::Break(());
            }
            // Another reader may have filled it since the snapshot.
            if self.cache.contains(index) {
                continue;
            }

            let source = Arc::clone(&self.source);
            let result = tokio::task::spawn_blocking(move || source.frame(index)).await;

            if self.is_stopped() {
                debug!(index, "Stop requested during load, dropping frame");
                return ControlFlow::Break(());
            }

            match result {
                Ok(Ok(frame)) => {
                    self.failing.remove(&index);
                    if self.cache.put_if_wanted(index, frame) {
                        self.counters.loaded.fetch_add(1, Ordering::Relaxed);
                        trace!(index, cached = self.cache.len(), "Prefetched frame");
                    } else {
                        self.counters.discarded.fetch_add(1, Ordering::Relaxed);
                        trace!(index, "Frame left the window while loading");
                    }
                }
                Ok(Err(e)) => {
                    self.counters.failed.fetch_add(1, Ordering::Relaxed);
                    if self.failing.insert(index) {
                        warn!(index, error = %e, "Prefetch failed, will retry next pass");
                    } else {
                        trace!(index, error = %e, "Prefetch failed again");
                    }
                }
                Err(e) => {
                    self.counters.failed.fetch_add(1, Ordering::Relaxed);
                    error!(index, error = %e, "Prefetch load task panicked");
                }
            }
            tokio::task::yield_now().await;
        }

        ControlFlow::Continue(())
    }

    /// Sleep for one poll interval, waking early on stop.
    async fn pause(&mut self) -> ControlFlow<()> {
        tokio::select! {
            _ = self.stop.changed() => {}
            _ = tokio::time::sleep(self.poll_interval) => {}
        }
        if self.is_stopped() {
            ControlFlow::Break(())
        } else {
            ControlFlow::Continue(())
        }
    }
}

/// Owner's side of a spawned worker.
///
/// Dropping the handle signals stop; it does not wait for the task.
pub struct WorkerHandle {
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
    counters: Arc<WorkerCounters>,
}

impl WorkerHandle {
    /// Spawn a worker for `source` reconciling `cache` on `runtime`.
    pub fn spawn(
        runtime: &Runtime,
        source: Arc<dyn IndexedSource>,
        cache: FrameCache,
        poll_interval: Duration,
    ) -> Self {
        let (stop, stop_rx) = watch::channel(false);
        let counters = Arc::new(WorkerCounters::default());
        let worker = PrefetchWorker::new(source, cache, poll_interval, stop_rx, Arc::clone(&counters));
        let task = runtime.spawn(worker.run());
        Self { stop, task, counters }
    }

    /// Ask the worker to exit. Idempotent.
    pub fn stop(&self) {
        self.stop.send_replace(true);
    }

    pub fn is_stopped(&self) -> bool {
        *self.stop.borrow()
    }

    /// Whether the worker task has exited.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    pub fn stats(&self) -> WorkerStats {
        self.counters.stats()
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testlib::{frame_tag, tagged_frame, wait_until, CountingSource};

    const POLL: Duration = Duration::from_millis(1);
    const WAIT: Duration = Duration::from_secs(5);

    fn setup(source: CountingSource) -> (Runtime, Arc<CountingSource>, FrameCache) {
        let runtime = Runtime::new().expect("Failed to create runtime");
        (runtime, Arc::new(source), FrameCache::new())
    }

    #[test]
    fn test_worker_fills_targets() {
        let (runtime, source, cache) = setup(CountingSource::new(10));
        cache.set_targets(vec![8, 9, 0]);
        let handle = WorkerHandle::spawn(&runtime, source.clone(), cache.clone(), POLL);

        assert!(wait_until(WAIT, || cache.keys() == HashSet::from([8, 9, 0])));
        for k in [8, 9, 0] {
            assert_eq!(frame_tag(&cache.get(k).unwrap()), k);
        }
        assert!(wait_until(WAIT, || handle.stats().loaded == 3));
        handle.stop();
    }

    #[test]
    fn test_worker_evicts_after_target_change() {
        let (runtime, source, cache) = setup(CountingSource::new(10));
        cache.set_targets(vec![0, 1, 2]);
        let handle = WorkerHandle::spawn(&runtime, source.clone(), cache.clone(), POLL);
        assert!(wait_until(WAIT, || cache.len() == 3));

        cache.set_targets(vec![5, 6, 7]);
        assert!(wait_until(WAIT, || cache.keys() == HashSet::from([5, 6, 7])));
        assert!(handle.stats().evicted >= 3);
        handle.stop();
    }

    #[test]
    fn test_worker_skips_failed_frames_and_continues() {
        let (runtime, source, cache) = setup(CountingSource::new(10).failing([1]));
        cache.set_targets(vec![0, 1, 2]);
        let handle = WorkerHandle::spawn(&runtime, source.clone(), cache.clone(), POLL);

        assert!(wait_until(WAIT, || cache.keys() == HashSet::from([0, 2])));
        // Failed index is retried on later passes
        assert!(wait_until(WAIT, || source.calls(1) >= 2));
        assert!(!cache.contains(1));
        assert!(handle.stats().failed >= 2);
        assert!(!handle.is_finished());
        handle.stop();
    }

    #[test]
    fn test_worker_leaves_foreground_entries_in_window() {
        let (runtime, source, cache) = setup(CountingSource::new(10));
        cache.set_targets(vec![3, 4]);
        cache.put(3, tagged_frame(3));
        let handle = WorkerHandle::spawn(&runtime, source.clone(), cache.clone(), POLL);

        assert!(wait_until(WAIT, || cache.len() == 2));
        assert_eq!(source.calls(3), 0);
        handle.stop();
    }

    #[test]
    fn test_stop_is_observed_and_idempotent() {
        let (runtime, source, cache) = setup(CountingSource::new(4));
        cache.set_targets(vec![0]);
        let handle = WorkerHandle::spawn(&runtime, source, cache, Duration::from_secs(30));
        handle.stop();
        handle.stop();
        assert!(handle.is_stopped());
        // Stop wakes the worker out of a long pause
        assert!(wait_until(WAIT, || handle.is_finished()));
    }

    #[test]
    fn test_stop_during_load_does_not_touch_cache() {
        let (runtime, source, cache) =
            setup(CountingSource::new(4).with_latency(Duration::from_millis(200)));
        cache.set_targets(vec![2]);
        let handle = WorkerHandle::spawn(&runtime, source.clone(), cache.clone(), POLL);

        assert!(wait_until(WAIT, || source.calls(2) == 1));
        handle.stop();
        assert!(wait_until(WAIT, || handle.is_finished()));
        assert!(cache.is_empty());
        assert_eq!(handle.stats().loaded, 0);
    }

    #[test]
    fn test_dropping_handle_stops_worker() {
        let (runtime, source, cache) = setup(CountingSource::new(4));
        cache.set_targets(vec![0, 1]);
        let handle = WorkerHandle::spawn(&runtime, source.clone(), cache.clone(), POLL);
        assert!(wait_until(WAIT, || cache.len() == 2));
        drop(handle);

        cache.set_targets(vec![3]);
        std::thread::sleep(Duration::from_millis(50));
        assert!(!cache.contains(3));
        assert_eq!(source.calls(3), 0);
    }
}
