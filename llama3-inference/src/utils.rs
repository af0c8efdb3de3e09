#[cfg(test)]
#[path = "../tests/unit/utils_test.rs"]
mod utils_test;

use anyhow::{Context, Result};
use memmap2::Mmap;
use std::fs::File;
use std::path::Path;
use std::sync::Arc;

use crate::tensor::{GgmlType, QuantizedTensor};

/// Backing storage for tensor bytes.
enum Region {
    Mapped(Mmap),
    Owned(Vec<u8>),
}

impl Region {
    fn as_slice(&self) -> &[u8] {
        match self {
            Region::Mapped(mmap) => mmap,
            Region::Owned(bytes) => bytes,
        }
    }
}

/// A bounds-checked window into an immutable byte region.
///
/// Cloning a view is cheap: the underlying region is reference counted and never copied,
/// which is how a classifier can alias the token embedding table.
#[derive(Clone)]
pub struct ByteView {
    region: Arc<Region>,
    offset: usize,
    len: usize,
}

impl ByteView {
    /// Wraps an owned buffer as a view over all of its bytes.
    pub fn owned(bytes: Vec<u8>) -> Self {
        let len = bytes.len();
        Self { region: Arc::new(Region::Owned(bytes)), offset: 0, len }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.region.as_slice()[self.offset..self.offset + self.len]
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Returns true when both views start at the same byte of the same region.
    pub fn shares_storage(&self, other: &ByteView) -> bool {
        Arc::ptr_eq(&self.region, &other.region) && self.offset == other.offset
    }
}

impl std::fmt::Debug for ByteView {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match *self.region {
            Region::Mapped(_) => "mapped",
            Region::Owned(_) => "owned",
        };
        f.debug_struct("ByteView").field("kind", &kind).field("offset", &self.offset).field("len", &self.len).finish()
    }
}

/// Immutable source of tensor bytes: either a memory-mapped model file or an owned buffer.
///
/// An external model loader resolves tensor offsets from the file's index and slices
/// tensors out of a single source; every slice is bounds-checked once, here.
#[derive(Clone)]
pub struct TensorSource {
    region: Arc<Region>,
}

impl TensorSource {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).with_context(|| format!("Failed to open model file: {}", path.display()))?;

        // SAFETY: the mapping is read-only and the file is expected to stay unchanged while the model is loaded.
        let mmap = unsafe { memmap2::MmapOptions::new().map(&file).context("Failed to create memory mapping")? };

        Ok(Self { region: Arc::new(Region::Mapped(mmap)) })
    }

    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self { region: Arc::new(Region::Owned(bytes)) }
    }

    pub fn len(&self) -> usize {
        self.region.as_slice().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns a view of `len` bytes starting at `offset`.
    pub fn view(&self, offset: usize, len: usize) -> Result<ByteView> {
        let end = offset
            .checked_add(len)
            .ok_or_else(|| anyhow::anyhow!("Byte range overflows: offset {offset}, length {len}"))?;

        if end > self.len() {
            anyhow::bail!(
                "Insufficient data: need {} bytes at offset {}, have {} remaining",
                len,
                offset,
                self.len().saturating_sub(offset)
            );
        }

        Ok(ByteView { region: Arc::clone(&self.region), offset, len })
    }

    /// Slices a tensor of `size` elements encoded as `ggml_type` starting at `offset`.
    pub fn tensor(&self, offset: usize, ggml_type: GgmlType, size: usize) -> Result<QuantizedTensor> {
        let byte_size = ggml_type.byte_size(size)?;
        let view = self
            .view(offset, byte_size)
            .with_context(|| format!("Failed to read {ggml_type:?} tensor of {size} elements"))?;

        QuantizedTensor::new(ggml_type, size, view)
    }

    /// Reads `count` little-endian f32 values, used for normalization weights.
    pub fn f32_vec(&self, offset: usize, count: usize) -> Result<Vec<f32>> {
        Ok(self.tensor(offset, GgmlType::F32, count)?.dequantize())
    }
}

impl std::fmt::Debug for TensorSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TensorSource").field("len", &self.len()).finish()
    }
}
