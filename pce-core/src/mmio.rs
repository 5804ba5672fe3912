//! Memory-mapped region descriptors.
//!
//! A region is either *direct* (backed by a [`MemoryBuffer`] and accessed by
//! offset) or *complex* (backed by per-width callbacks). Complex regions only
//! need to provide the widths they care about: wider accesses that have no
//! handler are split into two half-width accesses, down to bytes.

use crate::memory::MemoryBuffer;
use std::rc::Rc;

pub type PhysicalMemoryAddress = u32;

/// Value returned for every byte of an access that nothing answers.
pub const UNMAPPED_BYTE: u8 = 0xFF;

/// Width of a single bus access.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccessWidth {
    Byte,
    Word,
    Dword,
    Qword,
}

impl AccessWidth {
    #[inline]
    pub const fn bytes(self) -> u32 {
        match self {
            AccessWidth::Byte => 1,
            AccessWidth::Word => 2,
            AccessWidth::Dword => 4,
            AccessWidth::Qword => 8,
        }
    }

    /// The next narrower width, `None` for bytes.
    #[inline]
    pub const fn half(self) -> Option<AccessWidth> {
        match self {
            AccessWidth::Byte => None,
            AccessWidth::Word => Some(AccessWidth::Byte),
            AccessWidth::Dword => Some(AccessWidth::Word),
            AccessWidth::Qword => Some(AccessWidth::Dword),
        }
    }

    /// All-ones value of this width (what an unmapped read returns).
    #[inline]
    pub const fn fill(self) -> u64 {
        u64::MAX >> (64 - self.bytes() * 8)
    }

    /// Truncate `value` to this width.
    #[inline]
    pub const fn mask(self, value: u64) -> u64 {
        value & self.fill()
    }
}

/// Callback set for a complex region. Offsets are relative to the region start.
#[derive(Default)]
pub struct MmioHandlers {
    pub read_byte: Option<Box<dyn Fn(u32) -> u8>>,
    pub read_word: Option<Box<dyn Fn(u32) -> u16>>,
    pub read_dword: Option<Box<dyn Fn(u32) -> u32>>,
    pub read_qword: Option<Box<dyn Fn(u32) -> u64>>,
    pub write_byte: Option<Box<dyn Fn(u32, u8)>>,
    pub write_word: Option<Box<dyn Fn(u32, u16)>>,
    pub write_dword: Option<Box<dyn Fn(u32, u32)>>,
    pub write_qword: Option<Box<dyn Fn(u32, u64)>>,
}

impl MmioHandlers {
    fn has_read(&self, width: AccessWidth) -> bool {
        match width {
            AccessWidth::Byte => self.read_byte.is_some(),
            AccessWidth::Word => self.read_word.is_some(),
            AccessWidth::Dword => self.read_dword.is_some(),
            AccessWidth::Qword => self.read_qword.is_some(),
        }
    }

    fn has_write(&self, width: AccessWidth) -> bool {
        match width {
            AccessWidth::Byte => self.write_byte.is_some(),
            AccessWidth::Word => self.write_word.is_some(),
            AccessWidth::Dword => self.write_dword.is_some(),
            AccessWidth::Qword => self.write_qword.is_some(),
        }
    }

    /// Read `width` bytes at `offset`, decomposing into narrower handlers
    /// (little-endian, ascending offsets) when the exact width is missing.
    pub fn read(&self, offset: u32, width: AccessWidth) -> u64 {
        if self.has_read(width) {
            return match width {
                AccessWidth::Byte => self.read_byte.as_ref().map_or(0, |h| h(offset) as u64),
                AccessWidth::Word => self.read_word.as_ref().map_or(0, |h| h(offset) as u64),
                AccessWidth::Dword => self.read_dword.as_ref().map_or(0, |h| h(offset) as u64),
                AccessWidth::Qword => self.read_qword.as_ref().map_or(0, |h| h(offset)),
            };
        }

        match width.half() {
            Some(half) => {
                let shift = half.bytes() * 8;
                let low = self.read(offset, half);
                let high = self.read(offset.wrapping_add(half.bytes()), half);
                low | (high << shift)
            }
            None => UNMAPPED_BYTE as u64,
        }
    }

    /// Write `width` bytes at `offset`, decomposing like [`MmioHandlers::read`].
    pub fn write(&self, offset: u32, width: AccessWidth, value: u64) {
        if self.has_write(width) {
            match width {
                AccessWidth::Byte => {
                    if let Some(h) = &self.write_byte {
                        h(offset, value as u8)
                    }
                }
                AccessWidth::Word => {
                    if let Some(h) = &self.write_word {
                        h(offset, value as u16)
                    }
                }
                AccessWidth::Dword => {
                    if let Some(h) = &self.write_dword {
                        h(offset, value as u32)
                    }
                }
                AccessWidth::Qword => {
                    if let Some(h) = &self.write_qword {
                        h(offset, value)
                    }
                }
            }
            return;
        }

        if let Some(half) = width.half() {
            let shift = half.bytes() * 8;
            self.write(offset, half, half.mask(value));
            self.write(offset.wrapping_add(half.bytes()), half, half.mask(value >> shift));
        }
    }
}

/// How a region answers accesses.
pub enum MmioKind {
    Direct {
        buffer: Rc<MemoryBuffer>,
        readable: bool,
        writable: bool,
        executable: bool,
    },
    Complex {
        handlers: Rc<MmioHandlers>,
        cacheable: bool,
    },
}

/// A contiguous range `[start, start + size)` of the physical address space.
pub struct Mmio {
    start: PhysicalMemoryAddress,
    size: u32,
    kind: MmioKind,
}

impl Mmio {
    /// Region backed directly by `buffer`, offset 0 of the buffer at `start`.
    pub fn direct(
        start: PhysicalMemoryAddress,
        size: u32,
        buffer: Rc<MemoryBuffer>,
        readable: bool,
        writable: bool,
        executable: bool,
    ) -> Self {
        Self {
            start,
            size,
            kind: MmioKind::Direct {
                buffer,
                readable,
                writable,
                executable,
            },
        }
    }

    /// Region answered by callbacks.
    pub fn complex(start: PhysicalMemoryAddress, size: u32, handlers: MmioHandlers, cacheable: bool) -> Self {
        Self {
            start,
            size,
            kind: MmioKind::Complex {
                handlers: Rc::new(handlers),
                cacheable,
            },
        }
    }

    #[inline]
    pub fn start(&self) -> PhysicalMemoryAddress {
        self.start
    }

    #[inline]
    pub fn size(&self) -> u32 {
        self.size
    }

    /// Exclusive end address, widened so a region touching 4 GiB does not wrap.
    #[inline]
    pub fn end(&self) -> u64 {
        self.start as u64 + self.size as u64
    }

    #[inline]
    pub fn contains(&self, address: PhysicalMemoryAddress) -> bool {
        address >= self.start && (address as u64) < self.end()
    }

    pub fn overlaps(&self, start: u64, end: u64) -> bool {
        (self.start as u64) < end && start < self.end()
    }

    pub fn kind(&self) -> &MmioKind {
        &self.kind
    }

    pub fn is_direct(&self) -> bool {
        matches!(self.kind, MmioKind::Direct { .. })
    }
}

impl std::fmt::Debug for Mmio {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mmio")
            .field("start", &format_args!("{:#010x}", self.start))
            .field("size", &format_args!("{:#x}", self.size))
            .field("direct", &self.is_direct())
            .finish()
    }
}
