//! Linear memory instances.

use crate::sync::RwLock;
use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use wasmcore_environ::{MemoryType, pages_to_bytes};

/// A page-granular, growable byte buffer.
///
/// All accessors take a 32-bit byte offset and return `None` (or `false` for
/// writes) when the access does not fit entirely below the current length.
/// Bounds are computed in 64 bits so `offset + width` never wraps.
///
/// The backing buffer is sized to the capacity, which may exceed the visible
/// length. Growing within the capacity only moves the visible length; bytes
/// past it have never been written and are still zero.
///
/// Only `grow` takes the buffer lock exclusively. Loads and stores share it
/// and access bytes one at a time, so racing accesses to the same bytes may
/// tear.
pub struct MemoryInstance {
    buffer: RwLock<Vec<AtomicU8>>,
    pages: AtomicU32,
    capacity: AtomicU32,
    min: u32,
    max: u32,
}

impl MemoryInstance {
    /// Creates a memory of `ty.min` pages.
    pub fn new(ty: MemoryType) -> MemoryInstance {
        MemoryInstance::with_capacity(ty, ty.min)
    }

    /// Creates a memory of `ty.min` pages whose buffer is pre-allocated for
    /// `capacity` pages, clamped to `[min, max]`.
    pub fn with_capacity(ty: MemoryType, capacity: u32) -> MemoryInstance {
        let max = ty.maximum_pages();
        let capacity = capacity.clamp(ty.min, max.max(ty.min));
        MemoryInstance {
            buffer: RwLock::new(zeroed(pages_to_bytes(capacity) as usize)),
            pages: AtomicU32::new(ty.min),
            capacity: AtomicU32::new(capacity),
            min: ty.min,
            max,
        }
    }

    /// The current size in pages.
    pub fn size(&self) -> u32 {
        self.pages.load(Ordering::Acquire)
    }

    /// The current size in bytes.
    pub fn byte_len(&self) -> u64 {
        pages_to_bytes(self.size())
    }

    pub fn min(&self) -> u32 {
        self.min
    }

    pub fn max(&self) -> u32 {
        self.max
    }

    /// Pages the backing buffer can hold without reallocating.
    pub fn capacity(&self) -> u32 {
        self.capacity.load(Ordering::Acquire)
    }

    /// The type this memory satisfies when imported: its current size as the
    /// minimum, and its maximum.
    pub fn ty(&self) -> MemoryType {
        MemoryType::new(self.size(), Some(self.max))
    }

    /// Grows the memory by `delta` pages, returning the previous size in
    /// pages, or `None` if that would exceed the maximum.
    pub fn grow(&self, delta: u32) -> Option<u32> {
        let mut buffer = self.buffer.write();
        let current = self.pages.load(Ordering::Acquire);
        if delta == 0 {
            return Some(current);
        }
        let new_pages = current.checked_add(delta).filter(|&p| p <= self.max)?;
        if new_pages > self.capacity.load(Ordering::Acquire) {
            buffer.resize_with(pages_to_bytes(new_pages) as usize, AtomicU8::default);
            self.capacity.store(new_pages, Ordering::Release);
        }
        self.pages.store(new_pages, Ordering::Release);
        log::trace!("memory grown from {current} to {new_pages} pages");
        Some(current)
    }

    fn range(&self, offset: u32, len: u64) -> Option<std::ops::Range<usize>> {
        let start = u64::from(offset);
        let end = start.checked_add(len)?;
        if end > self.byte_len() {
            return None;
        }
        Some(start as usize..end as usize)
    }

    fn read_array<const N: usize>(&self, offset: u32) -> Option<[u8; N]> {
        let buffer = self.buffer.read();
        let mut bytes = [0; N];
        for (byte, cell) in bytes.iter_mut().zip(&buffer[self.range(offset, N as u64)?]) {
            *byte = cell.load(Ordering::Relaxed);
        }
        Some(bytes)
    }

    fn write_array<const N: usize>(&self, offset: u32, bytes: [u8; N]) -> bool {
        self.write(offset, &bytes)
    }

    pub fn read_byte(&self, offset: u32) -> Option<u8> {
        self.read_array::<1>(offset).map(|[b]| b)
    }

    pub fn read_u16_le(&self, offset: u32) -> Option<u16> {
        self.read_array(offset).map(u16::from_le_bytes)
    }

    pub fn read_u32_le(&self, offset: u32) -> Option<u32> {
        self.read_array(offset).map(u32::from_le_bytes)
    }

    pub fn read_u64_le(&self, offset: u32) -> Option<u64> {
        self.read_array(offset).map(u64::from_le_bytes)
    }

    pub fn read_f32_le(&self, offset: u32) -> Option<f32> {
        self.read_u32_le(offset).map(f32::from_bits)
    }

    pub fn read_f64_le(&self, offset: u32) -> Option<f64> {
        self.read_u64_le(offset).map(f64::from_bits)
    }

    /// Copies `len` bytes starting at `offset` out of the memory.
    pub fn read(&self, offset: u32, len: u32) -> Option<Vec<u8>> {
        let buffer = self.buffer.read();
        let cells = &buffer[self.range(offset, u64::from(len))?];
        Some(cells.iter().map(|cell| cell.load(Ordering::Relaxed)).collect())
    }

    pub fn write_byte(&self, offset: u32, value: u8) -> bool {
        self.write_array(offset, [value])
    }

    pub fn write_u16_le(&self, offset: u32, value: u16) -> bool {
        self.write_array(offset, value.to_le_bytes())
    }

    pub fn write_u32_le(&self, offset: u32, value: u32) -> bool {
        self.write_array(offset, value.to_le_bytes())
    }

    pub fn write_u64_le(&self, offset: u32, value: u64) -> bool {
        self.write_array(offset, value.to_le_bytes())
    }

    pub fn write_f32_le(&self, offset: u32, value: f32) -> bool {
        self.write_u32_le(offset, value.to_bits())
    }

    pub fn write_f64_le(&self, offset: u32, value: f64) -> bool {
        self.write_u64_le(offset, value.to_bits())
    }

    /// Copies `bytes` into the memory at `offset`.
    pub fn write(&self, offset: u32, bytes: &[u8]) -> bool {
        let buffer = self.buffer.read();
        let Some(range) = self.range(offset, bytes.len() as u64) else {
            return false;
        };
        for (cell, &byte) in buffer[range].iter().zip(bytes) {
            cell.store(byte, Ordering::Relaxed);
        }
        true
    }
}

fn zeroed(len: usize) -> Vec<AtomicU8> {
    std::iter::repeat_with(AtomicU8::default).take(len).collect()
}

impl fmt::Debug for MemoryInstance {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("MemoryInstance")
            .field("pages", &self.size())
            .field("capacity", &self.capacity())
            .field("min", &self.min)
            .field("max", &self.max)
            .finish()
    }
}

/// The bytes of a passive data segment, kept until `data.drop`.
#[derive(Debug, Default)]
pub struct DataInstance {
    bytes: RwLock<Vec<u8>>,
}

impl DataInstance {
    pub fn new(bytes: Vec<u8>) -> DataInstance {
        DataInstance {
            bytes: RwLock::new(bytes),
        }
    }

    pub fn len(&self) -> usize {
        self.bytes.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copies out `len` bytes starting at `offset`.
    pub fn read(&self, offset: u32, len: u32) -> Option<Vec<u8>> {
        let bytes = self.bytes.read();
        let start = offset as usize;
        let end = start.checked_add(len as usize)?;
        bytes.get(start..end).map(<[u8]>::to_vec)
    }

    /// Releases the segment's bytes.
    pub fn drop_bytes(&self) {
        *self.bytes.write() = Vec::new();
    }
}
