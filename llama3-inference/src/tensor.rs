#[cfg(test)]
#[path = "../tests/unit/tensor_test.rs"]
mod tensor_test;

use anyhow::Result;
use byteorder::{ByteOrder, LittleEndian};
use half::f16;
use rayon::prelude::*;

use crate::utils::ByteView;

/// Number of elements in a Q8_0/Q4_0 block.
pub const QK: usize = 32;

const Q8_0_BLOCK_BYTES: usize = 2 + QK;
const Q4_0_BLOCK_BYTES: usize = 2 + QK / 2;

/// Tensor element encodings, numbered as in GGML.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GgmlType {
    F32,
    F16,
    Q4_0,
    Q8_0,
}

impl GgmlType {
    /// Number of elements sharing one scale.
    pub fn block_size(self) -> usize {
        match self {
            GgmlType::F32 | GgmlType::F16 => 1,
            GgmlType::Q4_0 | GgmlType::Q8_0 => QK,
        }
    }

    /// Bytes occupied by one block.
    pub fn type_size(self) -> usize {
        match self {
            GgmlType::F32 => 4,
            GgmlType::F16 => 2,
            GgmlType::Q4_0 => Q4_0_BLOCK_BYTES,
            GgmlType::Q8_0 => Q8_0_BLOCK_BYTES,
        }
    }

    /// Bytes needed to store `size` elements.
    pub fn byte_size(self, size: usize) -> Result<usize> {
        let block_size = self.block_size();
        if size % block_size != 0 {
            anyhow::bail!("{self:?} tensor size {size} is not a multiple of block size {block_size}");
        }
        Ok(size / block_size * self.type_size())
    }
}

impl TryFrom<u32> for GgmlType {
    type Error = anyhow::Error;

    fn try_from(id: u32) -> Result<Self> {
        match id {
            0 => Ok(GgmlType::F32),
            1 => Ok(GgmlType::F16),
            2 => Ok(GgmlType::Q4_0),
            8 => Ok(GgmlType::Q8_0),
            other => anyhow::bail!("Unsupported tensor encoding: ggml type {other}"),
        }
    }
}

/// Immutable tensor over (possibly) block-quantized bytes.
///
/// Elements are dequantized lazily on access; dot products run block by block so each
/// block scale is applied once.
#[derive(Clone)]
pub struct QuantizedTensor {
    ggml_type: GgmlType,
    size: usize,
    data: ByteView,
}

impl QuantizedTensor {
    /// Wraps `data` as `size` elements of `ggml_type`; the byte length must match exactly.
    pub fn new(ggml_type: GgmlType, size: usize, data: ByteView) -> Result<Self> {
        let expected = ggml_type.byte_size(size)?;
        if data.len() != expected {
            anyhow::bail!("{ggml_type:?} tensor of {size} elements needs {expected} bytes, got {}", data.len());
        }
        Ok(Self { ggml_type, size, data })
    }

    pub fn from_f32(values: &[f32]) -> Self {
        let mut bytes = vec![0u8; values.len() * 4];
        LittleEndian::write_f32_into(values, &mut bytes);
        Self { ggml_type: GgmlType::F32, size: values.len(), data: ByteView::owned(bytes) }
    }

    pub fn from_f16(values: &[f32]) -> Self {
        let mut bytes = vec![0u8; values.len() * 2];
        for (chunk, &value) in bytes.chunks_exact_mut(2).zip(values) {
            LittleEndian::write_u16(chunk, f16::from_f32(value).to_bits());
        }
        Self { ggml_type: GgmlType::F16, size: values.len(), data: ByteView::owned(bytes) }
    }

    /// Quantizes values into Q8_0 blocks: `scale = absmax / 127`, codes rounded to nearest.
    ///
    /// Codes are computed against the stored f16 scale, so every element is within half a
    /// stored step of its original value. Blocks with `absmax / 127` below the smallest f16
    /// subnormal (about 6e-8) get that subnormal as their step.
    pub fn quantize_q8_0(values: &[f32]) -> Result<Self> {
        let mut bytes = vec![0u8; GgmlType::Q8_0.byte_size(values.len())?];

        for (block, group) in bytes.chunks_exact_mut(Q8_0_BLOCK_BYTES).zip(values.chunks_exact(QK)) {
            let amax = group.iter().fold(0.0f32, |acc, &val| acc.max(val.abs()));
            let scale = f16_scale(amax / 127.0);
            let inv_scale = if scale.to_f32() != 0.0 { scale.to_f32().recip() } else { 0.0 };

            LittleEndian::write_u16(&mut block[..2], scale.to_bits());
            for (code, &val) in block[2..].iter_mut().zip(group) {
                *code = ((val * inv_scale).round() as i8) as u8;
            }
        }

        Ok(Self { ggml_type: GgmlType::Q8_0, size: values.len(), data: ByteView::owned(bytes) })
    }

    /// Quantizes values into Q4_0 blocks: the signed absmax maps to code 0, zero maps to code 8.
    pub fn quantize_q4_0(values: &[f32]) -> Result<Self> {
        let mut bytes = vec![0u8; GgmlType::Q4_0.byte_size(values.len())?];

        for (block, group) in bytes.chunks_exact_mut(Q4_0_BLOCK_BYTES).zip(values.chunks_exact(QK)) {
            let max = group.iter().fold(0.0f32, |acc, &val| if val.abs() > acc.abs() { val } else { acc });
            let scale = f16_scale(max / -8.0);
            let inv_scale = if scale.to_f32() != 0.0 { scale.to_f32().recip() } else { 0.0 };

            LittleEndian::write_u16(&mut block[..2], scale.to_bits());
            let (low, high) = group.split_at(QK / 2);
            for ((packed, &lo), &hi) in block[2..].iter_mut().zip(low).zip(high) {
                let lo_code = ((lo * inv_scale + 8.5) as u8).min(15);
                let hi_code = ((hi * inv_scale + 8.5) as u8).min(15);
                *packed = lo_code | (hi_code << 4);
            }
        }

        Ok(Self { ggml_type: GgmlType::Q4_0, size: values.len(), data: ByteView::owned(bytes) })
    }

    /// Quantizes `values` with the requested encoding.
    pub fn quantize(ggml_type: GgmlType, values: &[f32]) -> Result<Self> {
        match ggml_type {
            GgmlType::F32 => Ok(Self::from_f32(values)),
            GgmlType::F16 => Ok(Self::from_f16(values)),
            GgmlType::Q4_0 => Self::quantize_q4_0(values),
            GgmlType::Q8_0 => Self::quantize_q8_0(values),
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn ggml_type(&self) -> GgmlType {
        self.ggml_type
    }

    /// Encoded bytes, laid out exactly as they are stored in a model file.
    pub fn as_bytes(&self) -> &[u8] {
        self.data.bytes()
    }

    /// Returns true when both tensors are views of the same bytes (tied embeddings).
    pub fn shares_storage(&self, other: &QuantizedTensor) -> bool {
        self.data.shares_storage(&other.data)
    }

    /// Dequantized element at `index`.
    pub fn element_at(&self, index: usize) -> f32 {
        debug_assert!(index < self.size, "index {index} out of bounds for tensor of size {}", self.size);
        let bytes = self.data.bytes();

        match self.ggml_type {
            GgmlType::F32 => LittleEndian::read_f32(&bytes[index * 4..]),
            GgmlType::F16 => read_f16(&bytes[index * 2..]),
            GgmlType::Q8_0 => {
                let block = &bytes[index / QK * Q8_0_BLOCK_BYTES..];
                (block[2 + index % QK] as i8) as f32 * read_f16(block)
            }
            GgmlType::Q4_0 => {
                let block = &bytes[index / QK * Q4_0_BLOCK_BYTES..];
                let within = index % QK;
                let packed = block[2 + within % (QK / 2)];
                let code = if within < QK / 2 { packed & 0x0F } else { packed >> 4 };
                (code as i32 - 8) as f32 * read_f16(block)
            }
        }
    }

    /// Dot product of `len` elements of this tensor starting at `offset` with `other[other_offset..]`.
    pub fn dot(&self, offset: usize, other: &[f32], other_offset: usize, len: usize) -> f32 {
        let other = &other[other_offset..other_offset + len];

        match self.ggml_type {
            GgmlType::F32 => {
                let bytes = &self.data.bytes()[offset * 4..(offset + len) * 4];
                bytes.chunks_exact(4).zip(other).map(|(w, &x)| LittleEndian::read_f32(w) * x).sum()
            }
            GgmlType::F16 => {
                let bytes = &self.data.bytes()[offset * 2..(offset + len) * 2];
                bytes.chunks_exact(2).zip(other).map(|(w, &x)| read_f16(w) * x).sum()
            }
            GgmlType::Q8_0 => self.dot_blocked(offset, other, Q8_0_BLOCK_BYTES, dot_q8_0_block),
            GgmlType::Q4_0 => self.dot_blocked(offset, other, Q4_0_BLOCK_BYTES, dot_q4_0_block),
        }
    }

    /// Unaligned head and tail elements are dequantized one at a time; whole blocks go
    /// through `block_dot`.
    fn dot_blocked(&self, offset: usize, other: &[f32], block_bytes: usize, block_dot: fn(&[u8], &[f32]) -> f32) -> f32 {
        let len = other.len();
        let head = ((QK - offset % QK) % QK).min(len);

        let mut result: f32 = (0..head).map(|j| self.element_at(offset + j) * other[j]).sum();

        let first_block = (offset + head) / QK;
        let full_blocks = (len - head) / QK;
        let bytes = self.data.bytes();

        result += other[head..head + full_blocks * QK]
            .chunks_exact(QK)
            .enumerate()
            .map(|(b, xs)| {
                let start = (first_block + b) * block_bytes;
                block_dot(&bytes[start..start + block_bytes], xs)
            })
            .sum::<f32>();

        let tail_start = head + full_blocks * QK;
        result += (tail_start..len).map(|j| self.element_at(offset + j) * other[j]).sum::<f32>();

        result
    }

    /// Matrix-vector product: `out[i] = dot(row i, x)` for `rows` rows of `cols` elements.
    ///
    /// Rows are independent; they are distributed over the current rayon pool.
    pub fn matmul(&self, x: &[f32], out: &mut [f32], rows: usize, cols: usize) {
        assert!(out.len() >= rows, "Output slice length must be at least rows parameter: {} >= {}", out.len(), rows);
        debug_assert!(rows * cols <= self.size, "matmul of {rows}x{cols} exceeds tensor size {}", self.size);

        out[..rows].par_iter_mut().enumerate().for_each(|(row, out_val)| {
            *out_val = self.dot(row * cols, x, 0, cols);
        });
    }

    /// Dequantizes `out.len()` elements starting at `offset` into `out`.
    pub fn copy_to(&self, offset: usize, out: &mut [f32]) {
        match self.ggml_type {
            GgmlType::F32 => {
                let bytes = &self.data.bytes()[offset * 4..(offset + out.len()) * 4];
                LittleEndian::read_f32_into(bytes, out);
            }
            _ => out.iter_mut().enumerate().for_each(|(i, val)| *val = self.element_at(offset + i)),
        }
    }

    pub fn dequantize(&self) -> Vec<f32> {
        let mut values = vec![0.0; self.size];
        self.copy_to(0, &mut values);
        values
    }
}

impl std::fmt::Debug for QuantizedTensor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QuantizedTensor").field("ggml_type", &self.ggml_type).field("size", &self.size).finish()
    }
}

/// Rounds a block scale to f16 without losing magnitude, so scaled codes stay in range and
/// a non-zero scale never underflows to zero.
fn f16_scale(scale: f32) -> f16 {
    let rounded = f16::from_f32(scale);
    if scale != 0.0 && rounded.to_f32().abs() < scale.abs() { f16::from_bits(rounded.to_bits() + 1) } else { rounded }
}

#[inline]
fn read_f16(bytes: &[u8]) -> f32 {
    f16::from_bits(LittleEndian::read_u16(bytes)).to_f32()
}

#[inline]
fn dot_q8_0_block(block: &[u8], xs: &[f32]) -> f32 {
    let sum: f32 = block[2..].iter().zip(xs).map(|(&code, &x)| (code as i8) as f32 * x).sum();
    sum * read_f16(block)
}

#[inline]
fn dot_q4_0_block(block: &[u8], xs: &[f32]) -> f32 {
    let (low, high) = xs.split_at(QK / 2);
    let sum: f32 = block[2..]
        .iter()
        .zip(low.iter().zip(high))
        .map(|(&packed, (&lo, &hi))| ((packed & 0x0F) as i32 - 8) as f32 * lo + ((packed >> 4) as i32 - 8) as f32 * hi)
        .sum();
    sum * read_f16(block)
}
