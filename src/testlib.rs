//! Test utilities for stackprefetch
// Instrumented sources and temporary stack files shared by unit and integration tests.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use tempfile::NamedTempFile;

use crate::formats::{
    compress_zlib, FrameData, IndexedSource, SourceError, StackFileWriter, StackShape, STACK_MAGIC,
};

/// Shape of the frames produced by [`tagged_frame`]: two i16 voxels.
pub const TAGGED_SHAPE: StackShape = StackShape { depth: 1, height: 1, width: 2 };

/// A frame whose payload encodes its own index, so a mixed-up cache entry is detectable
pub fn tagged_frame(index: usize) -> FrameData {
    FrameData::new(TAGGED_SHAPE, (index as u32).to_le_bytes().to_vec())
}

/// Index encoded by [`tagged_frame`]
pub fn frame_tag(frame: &FrameData) -> usize {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&frame.voxels[..4]);
    u32::from_le_bytes(raw) as usize
}

/// Source that counts every `frame` call per index
pub struct CountingSource {
    frames: usize,
    latency: Duration,
    failing: HashSet<usize>,
    calls: Vec<AtomicUsize>,
}

impl CountingSource {
    pub fn new(frames: usize) -> Self {
        Self {
            frames,
            latency: Duration::ZERO,
            failing: HashSet::new(),
            calls: (0..frames).map(|_| AtomicUsize::new(0)).collect(),
        }
    }

    /// Sleep this long in every `frame` call
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Make `frame` fail for these indices
    pub fn failing(mut self, indices: impl IntoIterator<Item = usize>) -> Self {
        self.failing.extend(indices);
        self
    }

    /// Number of `frame` calls for one index
    pub fn calls(&self, index: usize) -> usize {
        self.calls.get(index).map_or(0, |c| c.load(Ordering::SeqCst))
    }

    pub fn total_calls(&self) -> usize {
        self.calls.iter().map(|c| c.load(Ordering::SeqCst)).sum()
    }
}

impl IndexedSource for CountingSource {
    fn frame_count(&self) -> usize {
        self.frames
    }

    fn frame(&self, index: usize) -> Result<FrameData, SourceError> {
        let counter = self
            .calls
            .get(index)
            .ok_or_else(|| SourceError::read(index, "index out of range"))?;
        counter.fetch_add(1, Ordering::SeqCst);
        if !self.latency.is_zero() {
            thread::sleep(self.latency);
        }
        if self.failing.contains(&index) {
            return Err(SourceError::read(index, "injected failure"));
        }
        Ok(tagged_frame(index))
    }

    fn stack_shape(&self) -> StackShape {
        TAGGED_SHAPE
    }

    fn name(&self) -> &str {
        "counting"
    }
}

/// Write a stack file of `frames` ramp frames; frame `t` starts at sample `t * 100`
pub fn create_test_stack(frames: usize, shape: StackShape) -> NamedTempFile {
    let file = tempfile::Builder::new()
        .suffix(".stk")
        .tempfile()
        .expect("create temp stack file");
    let mut writer = StackFileWriter::new(file, shape);
    for t in 0..frames {
        writer.add_frame(ramp_frame(shape, t));
    }
    writer.write_all().expect("write test stack")
}

/// Write a stack file with an arbitrary sizes table followed by 16 zero bytes of frame data.
///
/// Nothing is validated, so this produces files that `StackFileSource::open` must reject.
pub fn create_stack_with_sizes(frames: u32, shape: StackShape, sizes: &[u64]) -> NamedTempFile {
    use std::io::Write;

    let sizes_raw: Vec<u8> = sizes.iter().flat_map(|s| s.to_le_bytes()).collect();
    let compressed = compress_zlib(&sizes_raw).expect("compress sizes table");
    let mut file = tempfile::Builder::new()
        .suffix(".stk")
        .tempfile()
        .expect("create temp stack file");
    file.write_all(STACK_MAGIC).expect("write magic");
    for field in [
        frames,
        shape.depth as u32,
        shape.height as u32,
        shape.width as u32,
        compressed.len() as u32,
    ] {
        file.write_all(&field.to_le_bytes()).expect("write header");
    }
    file.write_all(&compressed).expect("write sizes table");
    file.write_all(&[0u8; 16]).expect("write body");
    file.flush().expect("flush stack file");
    file
}

/// Frame `t` as written by [`create_test_stack`]
pub fn ramp_frame(shape: StackShape, t: usize) -> FrameData {
    let samples: Vec<i16> = (0..shape.voxels())
        .map(|i| (t * 100 + i) as i16)
        .collect();
    FrameData::from_i16(shape, &samples)
}

/// Poll `cond` until it holds or `timeout` elapses; returns the last result
pub fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if cond() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(Duration::from_millis(1));
    }
}
