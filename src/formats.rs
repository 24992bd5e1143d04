//! Formats abstraction module
//!
//! This module defines the IndexedSource trait every frame provider implements, the FrameData
//! payload handed through the cache, and the STCK stack file format: a zlib-compressed sizes
//! table followed by one zlib stream per frame, read back through a memory map.

use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;

use bytes::Bytes;
use flate2::read::ZlibDecoder;
use memmap2::Mmap;
use thiserror::Error;

/// Magic identifying a plaintext stack file.
pub const STACK_MAGIC: &[u8; 8] = b"STCKPLN1";

/// Fixed header: magic, frame count, depth, height, width, compressed sizes table length.
const HEADER_LEN: usize = 28;

/// Voxels are stored as little-endian i16.
pub const BYTES_PER_VOXEL: usize = 2;

/// Errors raised while opening a source or fetching a frame from it
#[derive(Error, Debug)]
pub enum SourceError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Invalid source: {0}")]
    InvalidSource(String),
    #[error("Could not open source '{name}': {reason}")]
    Open { name: String, reason: String },
    #[error("Could not read frame {index}: {reason}")]
    Read { index: usize, reason: String },
}

impl SourceError {
    pub(crate) fn read(index: usize, reason: impl Into<String>) -> Self {
        SourceError::Read { index, reason: reason.into() }
    }
}

/// Shape of a single volumetric frame (z, y, x)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct StackShape {
    pub depth: usize,
    pub height: usize,
    pub width: usize,
}

impl StackShape {
    pub fn new(depth: usize, height: usize, width: usize) -> Self {
        Self { depth, height, width }
    }

    /// Number of voxels in one frame
    pub fn voxels(&self) -> usize {
        self.depth * self.height * self.width
    }

    pub fn is_empty(&self) -> bool {
        self.voxels() == 0
    }
}

/// One decoded frame.
///
/// The cache never looks inside; `voxels` is reference counted so handing a cached frame to a
/// caller does not copy the volume.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameData {
    pub shape: StackShape,
    pub voxels: Bytes,
}

impl FrameData {
    pub fn new(shape: StackShape, voxels: impl Into<Bytes>) -> Self {
        Self { shape, voxels: voxels.into() }
    }

    /// Build a frame from i16 samples, stored little-endian
    pub fn from_i16(shape: StackShape, samples: &[i16]) -> Self {
        let mut raw = Vec::with_capacity(samples.len() * BYTES_PER_VOXEL);
        for s in samples {
            raw.extend_from_slice(&s.to_le_bytes());
        }
        Self::new(shape, raw)
    }

    /// Decode the voxel bytes back into i16 samples
    pub fn to_i16(&self) -> Vec<i16> {
        self.voxels
            .chunks_exact(BYTES_PER_VOXEL)
            .map(|c| i16::from_le_bytes([c[0], c[1]]))
            .collect()
    }
}

/// A frame provider addressable by integer position.
///
/// `frame` may block on disk or network I/O; it is called both from the prefetch worker and from
/// foreground reads, so implementations must be shareable across threads.
pub trait IndexedSource: Send + Sync {
    /// Number of frames, constant for the lifetime of the source
    fn frame_count(&self) -> usize;

    /// Fetch and decode one frame
    fn frame(&self, index: usize) -> Result<FrameData, SourceError>;

    /// Shape of every frame in the stack
    fn stack_shape(&self) -> StackShape;

    /// Human readable name used in logs
    fn name(&self) -> &str {
        ""
    }
}

/// Decompress zlib data
fn decompress_zlib(data: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut decoder = ZlibDecoder::new(data);
    let mut decompressed = Vec::new();
    decoder.read_to_end(&mut decompressed)?;
    Ok(decompressed)
}

/// Compress data using zlib
pub(crate) fn compress_zlib(data: &[u8]) -> std::io::Result<Vec<u8>> {
    use flate2::{write::ZlibEncoder, Compression};

    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data)?;
    encoder.finish()
}

fn le_u32(buf: &[u8], at: usize) -> u32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&buf[at..at + 4]);
    u32::from_le_bytes(raw)
}

fn le_u64(buf: &[u8], at: usize) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&buf[at..at + 8]);
    u64::from_le_bytes(raw)
}

/// Writer for the STCK stack format
/// Collects frames first, then writes the complete file
pub struct StackFileWriter<W: Write> {
    writer: W,
    shape: StackShape,
    frames: Vec<FrameData>,
}

impl<W: Write> StackFileWriter<W> {
    /// Create a new writer for frames of the given shape
    pub fn new(writer: W, shape: StackShape) -> Self {
        Self { writer, shape, frames: Vec::new() }
    }

    /// Add a frame to be written
    pub fn add_frame(&mut self, frame: FrameData) {
        self.frames.push(frame);
    }

    /// Write all collected frames
    /// Header and sizes table first, then every frame as `u32 uncompressed length + zlib stream`
    pub fn write_all(mut self) -> Result<W, SourceError> {
        let frame_bytes = self.shape.voxels() * BYTES_PER_VOXEL;
        let mut frame_sizes = Vec::with_capacity(self.frames.len());
        let mut encoded_frames = Vec::with_capacity(self.frames.len());

        for (index, frame) in self.frames.iter().enumerate() {
            if frame.shape != self.shape || frame.voxels.len() != frame_bytes {
                return Err(SourceError::InvalidSource(format!(
                    "frame {} does not match stack shape {:?}",
                    index, self.shape
                )));
            }
            let compressed = compress_zlib(&frame.voxels)?;
            let mut encoded = Vec::with_capacity(4 + compressed.len());
            encoded.extend_from_slice(&(frame.voxels.len() as u32).to_le_bytes());
            encoded.extend_from_slice(&compressed);
            frame_sizes.push(encoded.len() as u64);
            encoded_frames.push(encoded);
        }

        let sizes_raw: Vec<u8> = frame_sizes.iter().flat_map(|s| s.to_le_bytes()).collect();
        let compressed_sizes = compress_zlib(&sizes_raw)?;

        let mut header = [0u8; HEADER_LEN];
        header[0..8].copy_from_slice(STACK_MAGIC);
        header[8..12].copy_from_slice(&(self.frames.len() as u32).to_le_bytes());
        header[12..16].copy_from_slice(&(self.shape.depth as u32).to_le_bytes());
        header[16..20].copy_from_slice(&(self.shape.height as u32).to_le_bytes());
        header[20..24].copy_from_slice(&(self.shape.width as u32).to_le_bytes());
        header[24..28].copy_from_slice(&(compressed_sizes.len() as u32).to_le_bytes());
        self.writer.write_all(&header)?;
        self.writer.write_all(&compressed_sizes)?;

        for encoded in &encoded_frames {
            self.writer.write_all(encoded)?;
        }
        self.writer.flush()?;

        Ok(self.writer)
    }
}

/// Memory mapped STCK stack file.
///
/// Opening parses only the header and the sizes table; frames are decompressed on demand, so
/// `frame` is the slow call the prefetcher exists to hide.
pub struct StackFileSource {
    name: String,
    map: Mmap,
    shape: StackShape,
    frame_offsets: Vec<usize>,
    frame_sizes: Vec<usize>,
}

impl StackFileSource {
    /// Open and index a stack file
    pub fn open(path: impl AsRef<Path>) -> Result<Self, SourceError> {
        let path = path.as_ref();
        let file = File::open(path)?;
        // SAFETY: the map is read-only and stack files are not rewritten while a source is open.
        let map = unsafe { Mmap::map(&file)? };

        if map.len() < HEADER_LEN {
            return Err(SourceError::InvalidSource("file shorter than header".to_string()));
        }
        if &map[0..8] != STACK_MAGIC {
            return Err(SourceError::InvalidSource(format!(
                "bad magic {:?}",
                &map[0..8]
            )));
        }
        let frame_count = le_u32(&map, 8) as usize;
        let shape = StackShape::new(
            le_u32(&map, 12) as usize,
            le_u32(&map, 16) as usize,
            le_u32(&map, 20) as usize,
        );
        let compressed_sizes_size = le_u32(&map, 24) as usize;

        let body_base = HEADER_LEN + compressed_sizes_size;
        if map.len() < body_base {
            return Err(SourceError::InvalidSource("sizes table truncated".to_string()));
        }
        let sizes_raw = decompress_zlib(&map[HEADER_LEN..body_base])?;
        if sizes_raw.len() != frame_count * 8 {
            return Err(SourceError::InvalidSource(format!(
                "sizes table holds {} bytes, expected {} for {} frames",
                sizes_raw.len(),
                frame_count * 8,
                frame_count
            )));
        }

        shape
            .depth
            .checked_mul(shape.height)
            .and_then(|v| v.checked_mul(shape.width))
            .and_then(|v| v.checked_mul(BYTES_PER_VOXEL))
            .ok_or_else(|| {
                SourceError::InvalidSource(format!("stack shape {:?} is too large", shape))
            })?;

        let mut frame_offsets = Vec::with_capacity(frame_count);
        let mut frame_sizes = Vec::with_capacity(frame_count);
        let mut offset = body_base;
        for (frame, at) in (0..sizes_raw.len()).step_by(8).enumerate() {
            let size = usize::try_from(le_u64(&sizes_raw, at))
                .ok()
                .filter(|size| *size >= 4)
                .ok_or_else(|| {
                    SourceError::InvalidSource(format!("frame {} has an invalid size", frame))
                })?;
            frame_offsets.push(offset);
            frame_sizes.push(size);
            offset = offset
                .checked_add(size)
                .filter(|end| *end <= map.len())
                .ok_or_else(|| SourceError::InvalidSource("frame data truncated".to_string()))?;
        }

        Ok(Self {
            name: path.display().to_string(),
            map,
            shape,
            frame_offsets,
            frame_sizes,
        })
    }
}

impl IndexedSource for StackFileSource {
    fn frame_count(&self) -> usize {
        self.frame_sizes.len()
    }

    fn frame(&self, index: usize) -> Result<FrameData, SourceError> {
        if index >= self.frame_sizes.len() {
            return Err(SourceError::read(index, "index out of range"));
        }
        let start = self.frame_offsets[index];
        // Offsets and sizes were bounds checked by `open`
        let raw = &self.map[start..start + self.frame_sizes[index]];

        // First 4 bytes = expected uncompressed length
        let expected_len = le_u32(raw, 0) as usize;
        let decompressed =
            decompress_zlib(&raw[4..]).map_err(|e| SourceError::read(index, e.to_string()))?;
        if decompressed.len() != expected_len {
            return Err(SourceError::read(index, "decompressed length mismatch"));
        }
        if expected_len != self.shape.voxels() * BYTES_PER_VOXEL {
            return Err(SourceError::read(index, "frame does not match stack shape"));
        }

        Ok(FrameData::new(self.shape, decompressed))
    }

    fn stack_shape(&self) -> StackShape {
        self.shape
    }

    fn name(&self) -> &str {
        &self.name
    }
}
