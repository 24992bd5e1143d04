// Async runtime module
// This module wraps the Tokio runtime that hosts the background prefetch worker.

use tokio::runtime::{Builder, Runtime as TokioRuntime};

/// Builder for the worker runtime.
pub struct RuntimeBuilder {
    // Number of async worker threads. The prefetch loop needs one.
    worker_threads: usize,
    thread_name: String,
}

impl RuntimeBuilder {
    /// Create a new RuntimeBuilder with default settings.
    pub fn new() -> Self {
        Self {
            worker_threads: 1,
            thread_name: "prefetch-worker".to_string(),
        }
    }

    /// Set the number of worker threads for the runtime.
    pub fn worker_threads(mut self, threads: usize) -> Self {
        self.worker_threads = threads.max(1);
        self
    }

    /// Name given to the runtime's threads.
    pub fn thread_name(mut self, name: impl Into<String>) -> Self {
        self.thread_name = name.into();
        self
    }

    /// Build the Runtime with the configured settings.
    pub fn build(self) -> Result<Runtime, std::io::Error> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(self.worker_threads)
            .thread_name(self.thread_name)
            .enable_time()
            .build()?;
        Ok(Runtime { runtime })
    }
}

impl Default for RuntimeBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Owned Tokio runtime.
pub struct Runtime {
    runtime: TokioRuntime,
}

impl Runtime {
    /// Create a new Runtime with default settings using the builder.
    pub fn new() -> Result<Self, std::io::Error> {
        RuntimeBuilder::new().build()
    }

    /// Create a Runtime with a custom number of worker threads.
    pub fn with_worker_threads(threads: usize) -> Result<Self, std::io::Error> {
        RuntimeBuilder::new().worker_threads(threads).build()
    }

    /// Run a future to completion on this runtime.
    /// This blocks the current thread until the future completes.
    pub fn block_on<F, T>(&self, future: F) -> T
    where
        F: std::future::Future<Output = T>,
    {
        self.runtime.block_on(future)
    }

    /// Spawn a task on this runtime and return a JoinHandle to await its result.
    pub fn spawn<F>(&self, future: F) -> tokio::task::JoinHandle<F::Output>
    where
        F: std::future::Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.runtime.spawn(future)
    }

    /// Shut down without waiting for blocking work.
    /// A frame load stuck in a slow source keeps its thread, never the caller.
    pub fn shutdown(self) {
        self.runtime.shutdown_background();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_runtime_creation() {
        let _runtime = Runtime::new().expect("Failed to create runtime");
    }

    #[test]
    fn test_runtime_with_threads() {
        let _runtime = Runtime::with_worker_threads(2).expect("Failed to create runtime with threads");
    }

    #[test]
    fn test_spawned_tasks_run_on_named_threads() {
        let runtime = RuntimeBuilder::new()
            .thread_name("named-prefetch")
            .build()
            .expect("Failed to create runtime");
        let handle = runtime.spawn(async { std::thread::current().name().map(str::to_string) });
        let name = runtime.block_on(handle).expect("Task failed");
        assert_eq!(name.as_deref(), Some("named-prefetch"));
    }

    #[test]
    fn test_block_on() {
        let runtime = Runtime::new().expect("Failed to create runtime");
        let result = runtime.block_on(async { 42 });
        assert_eq!(result, 42);
    }

    #[test]
    fn test_spawn() {
        let runtime = Runtime::new().expect("Failed to create runtime");
        let handle = runtime.spawn(async { 42 });
        let result = runtime.block_on(handle).expect("Task failed");
        assert_eq!(result, 42);
    }

    #[test]
    fn test_shutdown_with_sleeping_task() {
        let runtime = Runtime::new().expect("Failed to create runtime");
        runtime.spawn(async {
            tokio::time::sleep(std::time::Duration::from_secs(60)).await;
        });
        runtime.shutdown();
    }
}
