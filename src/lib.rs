//! stackprefetch: windowed prefetching cache for indexed frame stacks
//!
//! A [`PrefetchCoordinator`] sits between a position cursor and a slow [`IndexedSource`]. It
//! keeps the frames just ahead of the cursor resident, loaded by a background worker, and
//! serves any frame synchronously on demand.
//!
//! ```no_run
//! use std::sync::Arc;
//! use stackprefetch::{DemoSource, PrefetchCoordinator};
//!
//! let mut coordinator = PrefetchCoordinator::new()?;
//! coordinator.on_position_changed(|pos| println!("now at {}", pos));
//! coordinator.load(Arc::new(DemoSource::new(64, 100)), 5)?;
//! coordinator.set_position(42)?;
//! let frame = coordinator.read(42)?;
//! assert_eq!(frame.shape, coordinator.stack_shape().unwrap());
//! # Ok::<(), stackprefetch::CoordinatorError>(())
//! ```

pub mod api;
pub mod cache;
pub mod formats;
pub mod neighborhood;
pub mod resolver;
pub mod runtime;
pub mod synthetic;
#[doc(hidden)]
pub mod testlib;
pub mod worker;

pub use api::{CoordinatorError, LoaderState, PrefetchCoordinator, PrefetchCoordinatorBuilder};
pub use cache::FrameCache;
pub use formats::{
    FrameData, IndexedSource, SourceError, StackFileSource, StackFileWriter, StackShape,
};
pub use neighborhood::compute_targets;
pub use resolver::SourceResolver;
pub use synthetic::DemoSource;
pub use worker::WorkerStats;

static CRATE_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Returns the crate semantic version string.
pub fn version() -> &'static str {
    CRATE_VERSION
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_is_semver_like() {
        assert!(version().split('.').count() >= 3);
    }
}
