use std::fmt;
use std::ptr::NonNull;

use thiserror::Error as ThisError;
use vm_memory::{Bytes, VolatileSlice};

#[derive(Debug, ThisError, Clone, Copy, Eq, PartialEq)]
pub enum DmaError {
    #[error("DMA allocation of {0} bytes failed")]
    OutOfMemory(usize),
    #[error("Invalid DMA allocation size {0}")]
    InvalidSize(usize),
    #[error("DMA access of {len} bytes at offset {offset} exceeds buffer of {size} bytes")]
    OutOfBounds {
        offset: usize,
        len: usize,
        size: usize,
    },
}

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub enum CachePolicy {
    #[default]
    Cached,
    Uncached,
    WriteCombined,
}

/// A physically contiguous region visible to both the CPU and the device.
///
/// The buffer is a plain handle: it does not free itself. Whoever obtained it
/// from a [`DmaAllocator`] must hand it back with [`DmaAllocator::free`].
pub struct DmaBuffer {
    cpu: NonNull<u8>,
    device_address: u64,
    size: usize,
    writable_by_device: bool,
}

// SAFETY: The region is owned by exactly one pool slot or request at a time and
// every access goes through volatile copies, so moving the handle between
// threads is sound.
unsafe impl Send for DmaBuffer {}

// SAFETY: Shared access only performs volatile reads and writes of plain bytes;
// callers serialize logical ownership of the bytes through their own locks.
unsafe impl Sync for DmaBuffer {}

impl DmaBuffer {
    /// Wraps memory handed out by an allocator.
    ///
    /// # Safety
    ///
    /// `cpu` must point to `size` bytes that stay valid, and are not accessed
    /// through any other Rust reference, until the buffer is returned to the
    /// allocator that produced it.
    pub unsafe fn from_raw_parts(
        cpu: NonNull<u8>,
        device_address: u64,
        size: usize,
        writable_by_device: bool,
    ) -> Self {
        Self {
            cpu,
            device_address,
            size,
            writable_by_device,
        }
    }

    pub fn cpu_address(&self) -> NonNull<u8> {
        self.cpu
    }

    pub fn device_address(&self) -> u64 {
        self.device_address
    }

    /// Device address of the byte at `offset`.
    pub fn device_address_at(&self, offset: usize) -> u64 {
        self.device_address + offset as u64
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn writable_by_device(&self) -> bool {
        self.writable_by_device
    }

    pub fn set_writable_by_device(&mut self, writable: bool) {
        self.writable_by_device = writable;
    }

    fn memory(&self) -> VolatileSlice<'_> {
        // SAFETY: `from_raw_parts` guarantees `cpu` covers `size` valid bytes for
        // as long as this handle exists.
        unsafe { VolatileSlice::new(self.cpu.as_ptr(), self.size) }
    }

    fn check(&self, offset: usize, len: usize) -> Result<(), DmaError> {
        match offset.checked_add(len) {
            Some(end) if end <= self.size => Ok(()),
            _ => Err(DmaError::OutOfBounds {
                offset,
                len,
                size: self.size,
            }),
        }
    }

    fn out_of_bounds(&self, offset: usize, len: usize) -> DmaError {
        DmaError::OutOfBounds {
            offset,
            len,
            size: self.size,
        }
    }

    pub fn write_at(&self, offset: usize, data: &[u8]) -> Result<(), DmaError> {
        self.check(offset, data.len())?;
        self.memory()
            .write_slice(data, offset)
            .map_err(|_| self.out_of_bounds(offset, data.len()))
    }

    pub fn read_at(&self, offset: usize, out: &mut [u8]) -> Result<(), DmaError> {
        self.check(offset, out.len())?;
        self.memory()
            .read_slice(out, offset)
            .map_err(|_| self.out_of_bounds(offset, out.len()))
    }

    pub fn fill_zero(&self, offset: usize, len: usize) -> Result<(), DmaError> {
        const ZEROES: [u8; 256] = [0; 256];

        self.check(offset, len)?;
        let mem = self.memory();
        let mut done = 0;
        while done < len {
            let chunk = (len - done).min(ZEROES.len());
            mem.write_slice(&ZEROES[..chunk], offset + done)
                .map_err(|_| self.out_of_bounds(offset + done, chunk))?;
            done += chunk;
        }
        Ok(())
    }

    pub fn read_le32(&self, offset: usize) -> Result<u32, DmaError> {
        let mut raw = [0u8; 4];
        self.read_at(offset, &mut raw)?;
        Ok(u32::from_le_bytes(raw))
    }

    pub fn write_le32(&self, offset: usize, value: u32) -> Result<(), DmaError> {
        self.write_at(offset, &value.to_le_bytes())
    }
}

impl fmt::Debug for DmaBuffer {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        fmt.debug_struct(stringify!(DmaBuffer))
            .field("device_address", &format_args!("{:#x}", self.device_address))
            .field("size", &self.size)
            .field("writable_by_device", &self.writable_by_device)
            .finish()
    }
}

/// Source of DMA-capable memory.
pub trait DmaAllocator: Send + Sync {
    fn alloc(&self, size: usize, cache: CachePolicy) -> Result<DmaBuffer, DmaError>;

    fn free(&self, buffer: DmaBuffer);
}
