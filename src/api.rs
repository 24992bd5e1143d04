//! API facade module
//!
//! This module provides [`PrefetchCoordinator`], the object a UI layer talks to. It owns the
//! loaded source, the frame cache, the background worker and the cursor position, and notifies
//! registered callbacks when the source or position changes.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info, trace};

use crate::cache::{FrameCache, FrameData};
use crate::formats::{IndexedSource, SourceError, StackShape};
use crate::neighborhood::compute_targets;
use crate::resolver::SourceResolver;
use crate::runtime::{Runtime, RuntimeBuilder};
use crate::worker::{WorkerHandle, WorkerStats};

/// Errors surfaced by the coordinator
#[derive(Error, Debug)]
pub enum CoordinatorError {
    #[error(transparent)]
    Source(#[from] SourceError),
    #[error("position {position} outside of [0, {frame_count})")]
    PositionOutOfRange { position: usize, frame_count: usize },
    #[error("no source loaded")]
    NotLoaded,
    #[error("worker runtime unavailable: {0}")]
    Runtime(std::io::Error),
}

/// Source binding state of a coordinator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoaderState {
    /// Nothing loaded yet; only `load` is valid
    Unloaded,
    /// A source is bound; the worker runs if the window radius is non-zero
    Loaded,
    /// Torn down with `stop`; reads are still served synchronously
    Stopped,
}

/// Builder configuration for PrefetchCoordinator
#[derive(Debug, Clone)]
pub struct PrefetchCoordinatorBuilder {
    poll_interval: Duration,    // Default: 1ms, Range: 100us-1s
    runtime_threads: usize,     // Default: 1, Range: 1-8
    resolver: SourceResolver,   // Default: built-in formats
}

impl Default for PrefetchCoordinatorBuilder {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(1),
            runtime_threads: 1,
            resolver: SourceResolver::with_defaults(),
        }
    }
}

impl PrefetchCoordinatorBuilder {
    pub fn new() -> Self {
        Self::default()
    }
    /// Pause between worker reconciliation passes
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval.clamp(Duration::from_micros(100), Duration::from_secs(1));
        self
    }
    pub fn runtime_threads(mut self, threads: usize) -> Self {
        self.runtime_threads = threads.clamp(1, 8);
        self
    }
    /// Registry used by [`PrefetchCoordinator::load_path`]
    pub fn resolver(mut self, resolver: SourceResolver) -> Self {
        self.resolver = resolver;
        self
    }
    /// Build an unloaded coordinator and start its worker runtime
    pub fn build(self) -> Result<PrefetchCoordinator, CoordinatorError> {
        let runtime = RuntimeBuilder::new()
            .worker_threads(self.runtime_threads)
            .thread_name("stackprefetch-worker")
            .build()
            .map_err(CoordinatorError::Runtime)?;
        Ok(PrefetchCoordinator {
            binding: None,
            state: LoaderState::Unloaded,
            resolver: self.resolver,
            poll_interval: self.poll_interval,
            runtime: Some(runtime),
            source_changed: Vec::new(),
            position_changed: Vec::new(),
        })
    }
}

type SourceChangedFn = Box<dyn Fn() + Send + Sync>;
type PositionChangedFn = Box<dyn Fn(usize) + Send + Sync>;

/// Everything tied to one loaded source
struct Binding {
    source: Arc<dyn IndexedSource>,
    cache: FrameCache,
    frame_count: usize,
    window_radius: usize,
    position: usize,
    worker: Option<WorkerHandle>,
}

impl Binding {
    fn prefetching(&self) -> bool {
        self.worker.as_ref().is_some_and(|w| !w.is_stopped())
    }

    fn check_position(&self, position: usize) -> Result<(), CoordinatorError> {
        if position >= self.frame_count {
            return Err(CoordinatorError::PositionOutOfRange {
                position,
                frame_count: self.frame_count,
            });
        }
        Ok(())
    }
}

/// Windowed prefetching front end for an [`IndexedSource`].
///
/// `load` binds a source, `set_position` moves the cursor and the prefetch window with it, and
/// `read` returns any frame synchronously: from the cache when the worker got there first,
/// otherwise by fetching it on the calling thread.
pub struct PrefetchCoordinator {
    binding: Option<Binding>,
    state: LoaderState,
    resolver: SourceResolver,
    poll_interval: Duration,
    runtime: Option<Runtime>,
    source_changed: Vec<SourceChangedFn>,
    position_changed: Vec<PositionChangedFn>,
}

impl PrefetchCoordinator {
    /// Coordinator with default settings
    pub fn new() -> Result<Self, CoordinatorError> {
        PrefetchCoordinatorBuilder::new().build()
    }

    pub fn builder() -> PrefetchCoordinatorBuilder {
        PrefetchCoordinatorBuilder::new()
    }

    /// Call `callback` after every successful `load`
    pub fn on_source_changed(&mut self, callback: impl Fn() + Send + Sync + 'static) {
        self.source_changed.push(Box::new(callback));
    }

    /// Call `callback` with the new position after every successful `set_position`
    pub fn on_position_changed(&mut self, callback: impl Fn(usize) + Send + Sync + 'static) {
        self.position_changed.push(Box::new(callback));
    }

    /// Bind a new source, replacing the current one.
    ///
    /// The source is validated before anything changes, so a rejected source leaves the previous
    /// binding and its worker untouched. On success the old worker is told to stop, a fresh cache
    /// is created, a worker is started if `window_radius > 0`, and the position resets to 0.
    pub fn load(
        &mut self,
        source: Arc<dyn IndexedSource>,
        window_radius: usize,
    ) -> Result<(), CoordinatorError> {
        let frame_count = source.frame_count();
        if frame_count == 0 {
            return Err(SourceError::InvalidSource(format!(
                "source '{}' has no frames",
                source.name()
            ))
            .into());
        }
        if source.stack_shape().is_empty() {
            return Err(SourceError::InvalidSource(format!(
                "source '{}' has an empty stack shape {:?}",
                source.name(),
                source.stack_shape()
            ))
            .into());
        }
        let targets = compute_targets(0, window_radius, frame_count)?;

        let runtime = self.runtime.as_ref().ok_or_else(|| {
            CoordinatorError::Runtime(std::io::Error::other("runtime already shut down"))
        })?;

        if let Some(previous) = self.binding.take() {
            if let Some(worker) = &previous.worker {
                worker.stop();
            }
            debug!(source = previous.source.name(), "Released previous source");
        }

        let cache = FrameCache::new();
        cache.set_targets(targets);
        let worker = (window_radius > 0).then(|| {
            WorkerHandle::spawn(runtime, Arc::clone(&source), cache.clone(), self.poll_interval)
        });

        info!(
            source = source.name(),
            frame_count,
            window_radius,
            shape = ?source.stack_shape(),
            "Loaded source"
        );
        self.binding = Some(Binding {
            source,
            cache,
            frame_count,
            window_radius,
            position: 0,
            worker,
        });
        self.state = LoaderState::Loaded;

        for callback in &self.source_changed {
            callback();
        }
        self.set_position(0)
    }

    /// Resolve `path` through the configured [`SourceResolver`] and load it.
    pub fn load_path(
        &mut self,
        path: impl AsRef<Path>,
        window_radius: usize,
    ) -> Result<(), CoordinatorError> {
        let source = self.resolver.resolve(path)?;
        self.load(source, window_radius)
    }

    /// Move the cursor and publish the prefetch window around it.
    pub fn set_position(&mut self, position: usize) -> Result<(), CoordinatorError> {
        let binding = self.binding.as_mut().ok_or(CoordinatorError::NotLoaded)?;
        binding.check_position(position)?;
        let targets = compute_targets(position, binding.window_radius, binding.frame_count)?;

        binding.position = position;
        binding.cache.set_targets(targets);
        debug!(position, "Position changed");

        for callback in &self.position_changed {
            callback(position);
        }
        Ok(())
    }

    /// Return the frame at `position`.
    ///
    /// A miss fetches on the calling thread, so this can block for as long as the source takes.
    /// While prefetching, the window is re-centered on `position`.
    pub fn read(&self, position: usize) -> Result<FrameData, CoordinatorError> {
        let binding = self.binding.as_ref().ok_or(CoordinatorError::NotLoaded)?;
        binding.check_position(position)?;
        let targets = if binding.prefetching() {
            Some(compute_targets(position, binding.window_radius, binding.frame_count)?)
        } else {
            None
        };

        if let Some(frame) = binding.cache.get(position) {
            trace!(position, "Cache hit");
            if let Some(targets) = targets {
                binding.cache.set_targets(targets);
            }
            return Ok(frame);
        }

        trace!(position, "Cache miss, loading synchronously");
        let frame = binding.source.frame(position)?;
        match targets {
            Some(targets) => binding.cache.insert_with_targets(position, frame.clone(), targets),
            None => binding.cache.put(position, frame.clone()),
        }
        Ok(frame)
    }

    /// Tell the worker to exit. Idempotent, and a no-op when nothing runs.
    pub fn stop(&mut self) {
        if let Some(binding) = &self.binding {
            if let Some(worker) = &binding.worker {
                if !worker.is_stopped() {
                    worker.stop();
                    debug!(source = binding.source.name(), "Prefetch worker signaled to stop");
                }
            }
            self.state = LoaderState::Stopped;
        }
    }

    pub fn state(&self) -> LoaderState {
        self.state
    }

    pub fn is_loaded(&self) -> bool {
        self.binding.is_some()
    }

    pub fn position(&self) -> Option<usize> {
        self.binding.as_ref().map(|b| b.position)
    }

    pub fn frame_count(&self) -> Option<usize> {
        self.binding.as_ref().map(|b| b.frame_count)
    }

    pub fn stack_shape(&self) -> Option<StackShape> {
        self.binding.as_ref().map(|b| b.source.stack_shape())
    }

    pub fn window_radius(&self) -> Option<usize> {
        self.binding.as_ref().map(|b| b.window_radius)
    }

    pub fn source_name(&self) -> Option<&str> {
        self.binding.as_ref().map(|b| b.source.name())
    }

    /// Whether a worker is currently reconciling the cache
    pub fn is_prefetching(&self) -> bool {
        self.binding.as_ref().is_some_and(Binding::prefetching)
    }

    /// Indices currently resident; empty when unloaded
    pub fn cache_keys(&self) -> HashSet<usize> {
        self.binding.as_ref().map(|b| b.cache.keys()).unwrap_or_default()
    }

    /// Indices the worker is asked to keep resident; empty when unloaded
    pub fn targets(&self) -> HashSet<usize> {
        self.binding.as_ref().map(|b| b.cache.targets()).unwrap_or_default()
    }

    /// Counters of the current source's worker, if one was started
    pub fn worker_stats(&self) -> Option<WorkerStats> {
        self.binding.as_ref()?.worker.as_ref().map(WorkerHandle::stats)
    }
}

impl Drop for PrefetchCoordinator {
    fn drop(&mut self) {
        self.stop();
        self.binding = None;
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testlib::{
        create_stack_with_sizes, create_test_stack, frame_tag, ramp_frame, wait_until,
        CountingSource,
    };
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    const WAIT: Duration = Duration::from_secs(5);

    fn coordinator() -> PrefetchCoordinator {
        PrefetchCoordinator::new().expect("build coordinator")
    }

    #[test]
    fn test_builder_defaults_and_clamps() {
        let builder = PrefetchCoordinatorBuilder::new();
        assert_eq!(builder.poll_interval, Duration::from_millis(1));
        assert_eq!(builder.runtime_threads, 1);
        assert!(builder.resolver.supports("stk"));

        let builder = builder
            .poll_interval(Duration::from_secs(10))
            .runtime_threads(0);
        assert_eq!(builder.poll_interval, Duration::from_secs(1));
        assert_eq!(builder.runtime_threads, 1);

        let builder = builder.poll_interval(Duration::ZERO).runtime_threads(64);
        assert_eq!(builder.poll_interval, Duration::from_micros(100));
        assert_eq!(builder.runtime_threads, 8);
    }

    #[test]
    fn test_unloaded_rejects_reads() {
        let mut coord = coordinator();
        assert_eq!(coord.state(), LoaderState::Unloaded);
        assert!(matches!(coord.read(0), Err(CoordinatorError::NotLoaded)));
        assert!(matches!(coord.set_position(0), Err(CoordinatorError::NotLoaded)));
        assert!(coord.cache_keys().is_empty());
        assert_eq!(coord.position(), None);
    }

    #[test]
    fn test_load_resets_position_and_targets() {
        let mut coord = coordinator();
        coord.load(Arc::new(CountingSource::new(10)), 2).unwrap();
        assert_eq!(coord.state(), LoaderState::Loaded);
        assert_eq!(coord.position(), Some(0));
        assert_eq!(coord.frame_count(), Some(10));
        assert_eq!(coord.window_radius(), Some(2));
        assert_eq!(coord.targets(), HashSet::from([0, 1, 2]));
        assert!(coord.is_prefetching());

        coord.set_position(8).unwrap();
        assert_eq!(coord.targets(), HashSet::from([8, 9, 0]));
        assert!(wait_until(WAIT, || coord.cache_keys() == HashSet::from([8, 9, 0])));
    }

    #[test]
    fn test_zero_frame_source_is_invalid() {
        let mut coord = coordinator();
        let err = coord.load(Arc::new(CountingSource::new(0)), 2).unwrap_err();
        assert!(matches!(err, CoordinatorError::Source(SourceError::InvalidSource(_))));
        assert_eq!(coord.state(), LoaderState::Unloaded);
        assert!(!coord.is_loaded());
    }

    #[test]
    fn test_failed_reload_keeps_previous_source() {
        let mut coord = coordinator();
        coord.load(Arc::new(CountingSource::new(5)), 1).unwrap();
        coord.set_position(3).unwrap();

        assert!(coord.load(Arc::new(CountingSource::new(0)), 1).is_err());
        assert!(coord.load_path("missing.stk", 1).is_err());
        assert_eq!(coord.frame_count(), Some(5));
        assert_eq!(coord.position(), Some(3));
        assert!(coord.is_prefetching());
    }

    #[test]
    fn test_out_of_range_position_changes_nothing() {
        let mut coord = coordinator();
        coord.load(Arc::new(CountingSource::new(10)), 0).unwrap();
        coord.set_position(4).unwrap();
        coord.read(4).unwrap();

        let err = coord.set_position(10).unwrap_err();
        assert!(matches!(
            err,
            CoordinatorError::PositionOutOfRange { position: 10, frame_count: 10 }
        ));
        assert!(matches!(coord.read(10), Err(CoordinatorError::PositionOutOfRange { .. })));
        assert_eq!(coord.position(), Some(4));
        assert_eq!(coord.cache_keys(), HashSet::from([4]));
        assert_eq!(coord.targets(), HashSet::from([4]));
    }

    #[test]
    fn test_second_read_is_served_from_cache() {
        let source = Arc::new(CountingSource::new(10));
        let mut coord = coordinator();
        coord.load(source.clone(), 0).unwrap();

        let first = coord.read(7).unwrap();
        let second = coord.read(7).unwrap();
        assert_eq!(first, second);
        assert_eq!(frame_tag(&first), 7);
        assert_eq!(source.calls(7), 1);
    }

    #[test]
    fn test_read_recenters_window_when_prefetching() {
        let mut coord = coordinator();
        coord.load(Arc::new(CountingSource::new(10)), 2).unwrap();
        let frame = coord.read(5).unwrap();
        assert_eq!(frame_tag(&frame), 5);
        assert_eq!(coord.targets(), HashSet::from([5, 6, 7]));
        // Reads do not move the cursor
        assert_eq!(coord.position(), Some(0));
        assert!(wait_until(WAIT, || coord.cache_keys() == HashSet::from([5, 6, 7])));
    }

    #[test]
    fn test_read_error_is_surfaced() {
        let mut coord = coordinator();
        coord.load(Arc::new(CountingSource::new(4).failing([2])), 0).unwrap();
        let err = coord.read(2).unwrap_err();
        assert!(matches!(err, CoordinatorError::Source(SourceError::Read { index: 2, .. })));
        assert!(!coord.cache_keys().contains(&2));
    }

    #[test]
    fn test_observers_fire_in_order() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let mut coord = coordinator();
        {
            let events = Arc::clone(&events);
            coord.on_source_changed(move || events.lock().unwrap().push("source".to_string()));
        }
        {
            let events = Arc::clone(&events);
            coord.on_position_changed(move |p| events.lock().unwrap().push(format!("pos {}", p)));
        }

        coord.load(Arc::new(CountingSource::new(3)), 1).unwrap();
        coord.set_position(2).unwrap();
        assert!(coord.set_position(3).is_err());

        assert_eq!(
            *events.lock().unwrap(),
            vec!["source".to_string(), "pos 0".to_string(), "pos 2".to_string()]
        );
    }

    #[test]
    fn test_failed_load_fires_nothing() {
        let fired = Arc::new(AtomicUsize::new(0));
        let mut coord = coordinator();
        {
            let fired = Arc::clone(&fired);
            coord.on_source_changed(move || {
                fired.fetch_add(1, Ordering::SeqCst);
            });
        }
        assert!(coord.load(Arc::new(CountingSource::new(0)), 0).is_err());
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_stop_without_worker_is_safe() {
        let mut coord = coordinator();
        coord.stop();
        coord.stop();
        assert_eq!(coord.state(), LoaderState::Unloaded);

        coord.load(Arc::new(CountingSource::new(3)), 0).unwrap();
        assert!(coord.worker_stats().is_none());
        coord.stop();
        coord.stop();
        assert_eq!(coord.state(), LoaderState::Stopped);
        assert_eq!(frame_tag(&coord.read(1).unwrap()), 1);
    }

    #[test]
    fn test_stop_halts_prefetching() {
        let source = Arc::new(CountingSource::new(20));
        let mut coord = coordinator();
        coord.load(source.clone(), 3).unwrap();
        assert!(wait_until(WAIT, || coord.cache_keys().len() == 4));

        coord.stop();
        assert!(!coord.is_prefetching());
        coord.set_position(10).unwrap();
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(source.calls(11), 0);
        assert_eq!(coord.cache_keys(), HashSet::from([0, 1, 2, 3]));
    }

    #[test]
    fn test_reload_replaces_cache() {
        let first = Arc::new(CountingSource::new(10));
        let mut coord = coordinator();
        coord.load(first.clone(), 1).unwrap();
        assert!(wait_until(WAIT, || coord.cache_keys().len() == 2));

        let second = Arc::new(CountingSource::new(4));
        coord.load(second.clone(), 0).unwrap();
        assert_eq!(coord.state(), LoaderState::Loaded);
        assert!(coord.cache_keys().is_empty());
        assert!(!coord.is_prefetching());
        coord.read(3).unwrap();
        assert_eq!(second.calls(3), 1);
        assert_eq!(first.calls(3), 0);
    }

    #[test]
    fn test_load_path_reads_stack_file() {
        let shape = StackShape::new(2, 2, 2);
        let file = create_test_stack(6, shape);
        let mut coord = coordinator();
        coord.load_path(file.path(), 2).unwrap();
        assert_eq!(coord.frame_count(), Some(6));
        assert_eq!(coord.stack_shape(), Some(shape));
        assert_eq!(coord.read(5).unwrap(), ramp_frame(shape, 5));
    }

    #[test]
    fn test_load_path_rejects_corrupt_sizes_table() {
        let shape = StackShape::new(1, 2, 2);
        let good = create_test_stack(4, shape);
        let corrupt = create_stack_with_sizes(2, StackShape::new(1, 1, 1), &[u64::MAX, 1]);

        let mut coord = coordinator();
        coord.load_path(good.path(), 1).unwrap();
        coord.set_position(2).unwrap();

        let err = coord.load_path(corrupt.path(), 2).unwrap_err();
        assert!(matches!(err, CoordinatorError::Source(SourceError::Open { .. })));
        assert_eq!(coord.frame_count(), Some(4));
        assert_eq!(coord.position(), Some(2));
        assert_eq!(coord.read(3).unwrap(), ramp_frame(shape, 3));
    }

    #[test]
    fn test_load_path_unknown_extension() {
        let mut coord = coordinator();
        let err = coord.load_path("volume.xyz", 2).unwrap_err();
        assert!(matches!(err, CoordinatorError::Source(SourceError::Open { .. })));
        assert_eq!(coord.state(), LoaderState::Unloaded);
    }
}
