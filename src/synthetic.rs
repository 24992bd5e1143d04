//! Synthetic volumetric source for demos and benchmarks.

use std::thread;
use std::time::Duration;

use crate::formats::{FrameData, IndexedSource, SourceError, StackShape};

/// Generates a shell with a gaussian blob orbiting inside it, one orbit per stack.
///
/// Frames are computed on every call, optionally with an artificial delay, so it behaves like a
/// slow reader without touching disk.
#[derive(Debug, Clone)]
pub struct DemoSource {
    shape: StackShape,
    frames: usize,
    latency: Duration,
}

impl DemoSource {
    /// `size` x `size` x `size / 2` voxels, `frames` time points
    pub fn new(size: usize, frames: usize) -> Self {
        Self {
            shape: StackShape::new((size / 2).max(1), size, size),
            frames,
            latency: Duration::ZERO,
        }
    }

    /// Sleep this long in every `frame` call
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    fn axis(i: usize, n: usize) -> f32 {
        if n <= 1 {
            0.0
        } else {
            -1.0 + 2.0 * i as f32 / (n - 1) as f32
        }
    }

    fn render(&self, index: usize) -> Vec<i16> {
        let StackShape { depth, height, width } = self.shape;
        let phase = std::f32::consts::TAU * index as f32 / self.frames.max(1) as f32;
        let (cx, cy) = (0.4 * phase.cos(), 0.4 * phase.sin());

        let mut samples = Vec::with_capacity(self.shape.voxels());
        for zi in 0..depth {
            let z = Self::axis(zi, depth);
            for yi in 0..height {
                let y = Self::axis(yi, height);
                for xi in 0..width {
                    let x = Self::axis(xi, width);
                    let r = (x * x + y * y + z * z).sqrt();
                    let shell = (-500.0 * (r - 1.0).powi(2)).exp() * (1.0 + z);
                    let blob = (-7.0 * ((x - cx).powi(2) + (y - cy).powi(2) + z * z)).exp();
                    let value = 10_000.0 * (shell + 2.0 * blob);
                    samples.push(value.min(i16::MAX as f32) as i16);
                }
            }
        }
        samples
    }
}

impl IndexedSource for DemoSource {
    fn frame_count(&self) -> usize {
        self.frames
    }

    fn frame(&self, index: usize) -> Result<FrameData, SourceError> {
        if index >= self.frames {
            return Err(SourceError::read(index, "index out of range"));
        }
        if !self.latency.is_zero() {
            thread::sleep(self.latency);
        }
        Ok(FrameData::from_i16(self.shape, &self.render(index)))
    }

    fn stack_shape(&self) -> StackShape {
        self.shape
    }

    fn name(&self) -> &str {
        "demo"
    }
}
