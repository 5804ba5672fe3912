use std::cell::UnsafeCell;
use thiserror::Error;

/// Device-local memory access errors.
///
/// The bus never surfaces these to the guest: an out-of-range access through a
/// region is treated like an unmapped access.
#[derive(Debug, Error)]
pub enum MemoryError {
    #[error("Out-of-bounds memory access at {0:#x}")]
    OutOfBounds(usize),

    #[error("Size mismatch: expected {expected} bytes, got {actual}")]
    SizeMismatch { expected: usize, actual: usize },
}

/// Byte buffer backing a direct-mapped region (RAM, VRAM, option ROMs).
///
/// The buffer is owned by a device and handed to the bus as an `Rc` view for as
/// long as the region is connected. Accesses go through raw pointers so the
/// bus and the owning device can both read and write it through `&self`.
///
/// # Safety
///
/// `MemoryBuffer` is `!Sync` (it contains an `UnsafeCell`), so every access
/// happens on the simulation thread. No method hands out a reference into the
/// storage, which means no access can overlap another one.
pub struct MemoryBuffer {
    size: usize,
    data: UnsafeCell<Box<[u8]>>,
}

impl MemoryBuffer {
    /// Create a new buffer of `size` bytes, zero-initialised.
    pub fn new(size: usize) -> Self {
        Self {
            size,
            data: UnsafeCell::new(vec![0; size].into_boxed_slice()),
        }
    }

    /// Create a buffer holding a copy of `bytes`.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self {
            size: bytes.len(),
            data: UnsafeCell::new(bytes.to_vec().into_boxed_slice()),
        }
    }

    #[inline(always)]
    pub fn size(&self) -> usize {
        self.size
    }

    #[inline(always)]
    fn mem_ptr(&self) -> *mut u8 {
        // SAFETY: the box lives as long as `self`; we only produce a raw pointer.
        unsafe { (*self.data.get()).as_mut_ptr() }
    }

    #[inline(always)]
    fn check(&self, offset: usize, len: usize) -> Result<(), MemoryError> {
        match offset.checked_add(len) {
            Some(end) if end <= self.size => Ok(()),
            _ => Err(MemoryError::OutOfBounds(offset)),
        }
    }

    // ========== READ METHODS ==========

    #[inline(always)]
    pub fn load_8(&self, offset: usize) -> Result<u8, MemoryError> {
        self.check(offset, 1)?;
        // SAFETY: bounds checked, single-threaded access
        unsafe { Ok(*self.mem_ptr().add(offset)) }
    }

    #[inline(always)]
    pub fn load_16(&self, offset: usize) -> Result<u16, MemoryError> {
        self.check(offset, 2)?;
        // SAFETY: bounds checked, unaligned read for portability
        unsafe {
            let ptr = self.mem_ptr().add(offset) as *const u16;
            Ok(u16::from_le(ptr.read_unaligned()))
        }
    }

    #[inline(always)]
    pub fn load_32(&self, offset: usize) -> Result<u32, MemoryError> {
        self.check(offset, 4)?;
        // SAFETY: bounds checked
        unsafe {
            let ptr = self.mem_ptr().add(offset) as *const u32;
            Ok(u32::from_le(ptr.read_unaligned()))
        }
    }

    #[inline(always)]
    pub fn load_64(&self, offset: usize) -> Result<u64, MemoryError> {
        self.check(offset, 8)?;
        // SAFETY: bounds checked
        unsafe {
            let ptr = self.mem_ptr().add(offset) as *const u64;
            Ok(u64::from_le(ptr.read_unaligned()))
        }
    }

    // ========== WRITE METHODS ==========

    #[inline(always)]
    pub fn store_8(&self, offset: usize, value: u8) -> Result<(), MemoryError> {
        self.check(offset, 1)?;
        // SAFETY: bounds checked
        unsafe {
            *self.mem_ptr().add(offset) = value;
        }
        Ok(())
    }

    #[inline(always)]
    pub fn store_16(&self, offset: usize, value: u16) -> Result<(), MemoryError> {
        self.check(offset, 2)?;
        // SAFETY: bounds checked
        unsafe {
            let ptr = self.mem_ptr().add(offset) as *mut u16;
            ptr.write_unaligned(value.to_le());
        }
        Ok(())
    }

    #[inline(always)]
    pub fn store_32(&self, offset: usize, value: u32) -> Result<(), MemoryError> {
        self.check(offset, 4)?;
        // SAFETY: bounds checked
        unsafe {
            let ptr = self.mem_ptr().add(offset) as *mut u32;
            ptr.write_unaligned(value.to_le());
        }
        Ok(())
    }

    #[inline(always)]
    pub fn store_64(&self, offset: usize, value: u64) -> Result<(), MemoryError> {
        self.check(offset, 8)?;
        // SAFETY: bounds checked
        unsafe {
            let ptr = self.mem_ptr().add(offset) as *mut u64;
            ptr.write_unaligned(value.to_le());
        }
        Ok(())
    }

    // ========== BULK METHODS ==========

    pub fn write_bytes(&self, offset: usize, data: &[u8]) -> Result<(), MemoryError> {
        self.check(offset, data.len())?;
        // SAFETY: bounds checked, source cannot alias the buffer since no
        // reference into it is ever handed out
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), self.mem_ptr().add(offset), data.len());
        }
        Ok(())
    }

    pub fn read_into(&self, offset: usize, out: &mut [u8]) -> Result<(), MemoryError> {
        self.check(offset, out.len())?;
        // SAFETY: bounds checked
        unsafe {
            std::ptr::copy_nonoverlapping(self.mem_ptr().add(offset), out.as_mut_ptr(), out.len());
        }
        Ok(())
    }

    pub fn read_range(&self, offset: usize, len: usize) -> Result<Vec<u8>, MemoryError> {
        let mut out = vec![0; len];
        self.read_into(offset, &mut out)?;
        Ok(out)
    }

    pub fn fill(&self, value: u8) {
        // SAFETY: whole buffer, single-threaded
        unsafe {
            std::ptr::write_bytes(self.mem_ptr(), value, self.size);
        }
    }

    /// Copy of the whole buffer, used for snapshots.
    pub fn get_data(&self) -> Vec<u8> {
        let mut out = vec![0; self.size];
        // SAFETY: sizes match by construction
        unsafe {
            std::ptr::copy_nonoverlapping(self.mem_ptr(), out.as_mut_ptr(), self.size);
        }
        out
    }

    /// Replace the whole buffer contents. The length must match exactly.
    pub fn set_data(&self, data: &[u8]) -> Result<(), MemoryError> {
        if data.len() != self.size {
            return Err(MemoryError::SizeMismatch {
                expected: self.size,
                actual: data.len(),
            });
        }
        self.write_bytes(0, data)
    }
}

impl std::fmt::Debug for MemoryBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryBuffer").field("size", &self.size).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn little_endian_access() {
        let mem = MemoryBuffer::new(16);
        mem.store_32(1, 0x1122_3344).unwrap();
        assert_eq!(mem.load_8(1).unwrap(), 0x44);
        assert_eq!(mem.load_8(4).unwrap(), 0x11);
        assert_eq!(mem.load_16(2).unwrap(), 0x2233);
        assert_eq!(mem.load_64(0).unwrap(), 0x0000_0011_2233_4400);
    }

    #[test]
    fn out_of_bounds_is_rejected() {
        let mem = MemoryBuffer::new(4);
        assert!(mem.load_32(1).is_err());
        assert!(mem.store_8(4, 0).is_err());
        assert!(mem.load_8(usize::MAX).is_err());
        assert!(mem.write_bytes(2, &[1, 2, 3]).is_err());
    }

    #[test]
    fn set_data_requires_exact_size() {
        let mem = MemoryBuffer::new(4);
        assert!(matches!(
            mem.set_data(&[1, 2, 3]),
            Err(MemoryError::SizeMismatch { expected: 4, actual: 3 })
        ));
        mem.set_data(&[1, 2, 3, 4]).unwrap();
        assert_eq!(mem.get_data(), vec![1, 2, 3, 4]);
        mem.fill(0xAB);
        assert_eq!(mem.read_range(1, 2).unwrap(), vec![0xAB, 0xAB]);
    }
}
