use crate::error::BusError;
use crate::mmio::{AccessWidth, Mmio, MmioHandlers, MmioKind, PhysicalMemoryAddress, UNMAPPED_BYTE};
use crate::memory::MemoryBuffer;
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;

/// Handle returned by [`Bus::connect_memory`], used to disconnect the region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RegionId(u32);

/// Identity of a device owning I/O ports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PortOwner(u32);

/// Description of a connected region, for inspection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegionInfo {
    pub id: RegionId,
    pub start: PhysicalMemoryAddress,
    pub size: u32,
    pub direct: bool,
}

pub type IoReadByteHandler = Rc<dyn Fn(u16) -> u8>;
pub type IoReadWordHandler = Rc<dyn Fn(u16) -> u16>;
pub type IoWriteByteHandler = Rc<dyn Fn(u16, u8)>;
pub type IoWriteWordHandler = Rc<dyn Fn(u16, u16)>;

struct IoPortBinding {
    owner: PortOwner,
    read_byte: Option<IoReadByteHandler>,
    read_word: Option<IoReadWordHandler>,
    write_byte: Option<IoWriteByteHandler>,
    write_word: Option<IoWriteWordHandler>,
}

impl IoPortBinding {
    fn new(owner: PortOwner) -> Self {
        Self {
            owner,
            read_byte: None,
            read_word: None,
            write_byte: None,
            write_word: None,
        }
    }
}

struct MappedRegion {
    id: RegionId,
    mmio: Mmio,
}

/// What an access resolved to. Handler sets and buffers are cloned out so the
/// region table is not borrowed while device code runs.
enum Target {
    Direct {
        buffer: Rc<MemoryBuffer>,
        offset: usize,
        readable: bool,
        writable: bool,
        executable: bool,
    },
    Complex {
        handlers: Rc<MmioHandlers>,
        offset: u32,
    },
    /// The access crosses a region boundary; resolve it byte by byte.
    Split,
    Unmapped,
}

/// Physical memory and port I/O dispatch.
///
/// All methods take `&self` so that a device can reconfigure its own regions
/// from inside one of its handlers (e.g. a mode register write remapping the
/// framebuffer). The registration tables are only borrowed for the duration
/// of a lookup, never across a handler call.
///
/// The bus lives on the simulation thread; it is intentionally `!Send`.
pub struct Bus {
    /// Connected regions, sorted by start address, never overlapping.
    regions: RefCell<Vec<MappedRegion>>,
    next_region_id: Cell<u32>,
    io_ports: RefCell<HashMap<u16, IoPortBinding>>,
    next_port_owner: Cell<u32>,
}

impl Bus {
    pub fn new() -> Self {
        Self {
            regions: RefCell::new(Vec::new()),
            next_region_id: Cell::new(1),
            io_ports: RefCell::new(HashMap::new()),
            next_port_owner: Cell::new(1),
        }
    }

    // ========== Memory registration ==========

    /// Connect a region. Fails if it overlaps an already connected region.
    pub fn connect_memory(&self, mmio: Mmio) -> Result<RegionId, BusError> {
        let start = mmio.start();
        let size = mmio.size();
        if size == 0 || mmio.end() > 1u64 << 32 {
            log::error!("[Bus] Refusing empty/wrapping region {:#010x}+{:#x}", start, size);
            return Err(BusError::InvalidRange { start, size });
        }
        if let MmioKind::Direct { buffer, .. } = mmio.kind() {
            if buffer.size() < size as usize {
                log::error!("[Bus] Region {:#010x} larger than its buffer", start);
                return Err(BusError::BufferTooSmall {
                    start,
                    buffer_size: buffer.size(),
                });
            }
        }

        let mut regions = self.regions.borrow_mut();
        if let Some(existing) = regions
            .iter()
            .find(|r| r.mmio.overlaps(start as u64, mmio.end()))
        {
            log::error!(
                "[Bus] Region {:#010x}+{:#x} overlaps {:#010x}+{:#x}",
                start,
                size,
                existing.mmio.start(),
                existing.mmio.size()
            );
            return Err(BusError::Overlap {
                start,
                size,
                existing_start: existing.mmio.start(),
                existing_size: existing.mmio.size(),
            });
        }

        let id = RegionId(self.next_region_id.get());
        self.next_region_id.set(id.0.wrapping_add(1));

        log::trace!("[Bus] Connect {:?} as {:?}", mmio, id);
        let index = regions.partition_point(|r| r.mmio.start() < start);
        regions.insert(index, MappedRegion { id, mmio });
        Ok(id)
    }

    /// Disconnect a region. Returns `false` if the id is not connected.
    pub fn disconnect_memory(&self, id: RegionId) -> bool {
        let mut regions = self.regions.borrow_mut();
        match regions.iter().position(|r| r.id == id) {
            Some(index) => {
                let removed = regions.remove(index);
                log::trace!("[Bus] Disconnect {:?} ({:?})", removed.mmio, id);
                true
            }
            None => false,
        }
    }

    /// Snapshot of the region table, sorted by start address.
    pub fn regions(&self) -> Vec<RegionInfo> {
        self.regions
            .borrow()
            .iter()
            .map(|r| RegionInfo {
                id: r.id,
                start: r.mmio.start(),
                size: r.mmio.size(),
                direct: r.mmio.is_direct(),
            })
            .collect()
    }

    /// Regions intersecting `[start, start + size)`.
    pub fn regions_in_range(&self, start: PhysicalMemoryAddress, size: u32) -> Vec<RegionInfo> {
        let end = start as u64 + size as u64;
        self.regions()
            .into_iter()
            .filter(|r| (r.start as u64) < end && (start as u64) < r.start as u64 + r.size as u64)
            .collect()
    }

    // ========== Memory dispatch ==========

    fn resolve(&self, address: PhysicalMemoryAddress, len: u32) -> Target {
        let regions = self.regions.borrow();
        let index = regions.partition_point(|r| r.mmio.start() <= address);
        let access_end = address as u64 + len as u64;

        if index > 0 {
            let region = &regions[index - 1];
            if region.mmio.contains(address) {
                if access_end > region.mmio.end() {
                    return Target::Split;
                }
                let offset = address - region.mmio.start();
                return match region.mmio.kind() {
                    MmioKind::Direct {
                        buffer,
                        readable,
                        writable,
                        executable,
                    } => Target::Direct {
                        buffer: buffer.clone(),
                        offset: offset as usize,
                        readable: *readable,
                        writable: *writable,
                        executable: *executable,
                    },
                    MmioKind::Complex { handlers, .. } => Target::Complex {
                        handlers: handlers.clone(),
                        offset,
                    },
                };
            }
        }

        // Not inside a region, but the tail of the access may reach the next one.
        match regions.get(index) {
            Some(next) if (next.mmio.start() as u64) < access_end => Target::Split,
            _ => Target::Unmapped,
        }
    }

    fn load(&self, address: PhysicalMemoryAddress, width: AccessWidth, fetch: bool) -> u64 {
        match self.resolve(address, width.bytes()) {
            Target::Direct {
                buffer,
                offset,
                readable,
                executable,
                ..
            } => {
                if !readable || (fetch && !executable) {
                    return width.fill();
                }
                let value = match width {
                    AccessWidth::Byte => buffer.load_8(offset).map(u64::from),
                    AccessWidth::Word => buffer.load_16(offset).map(u64::from),
                    AccessWidth::Dword => buffer.load_32(offset).map(u64::from),
                    AccessWidth::Qword => buffer.load_64(offset),
                };
                value.unwrap_or(width.fill())
            }
            Target::Complex { handlers, offset } => handlers.read(offset, width),
            Target::Split => {
                let mut value = 0u64;
                for i in 0..width.bytes() {
                    let byte = self.load(address.wrapping_add(i), AccessWidth::Byte, fetch);
                    value |= byte << (i * 8);
                }
                value
            }
            Target::Unmapped => {
                log::trace!("[Bus] Unmapped read {:#010x} ({:?})", address, width);
                width.fill()
            }
        }
    }

    fn store(&self, address: PhysicalMemoryAddress, width: AccessWidth, value: u64) {
        match self.resolve(address, width.bytes()) {
            Target::Direct {
                buffer,
                offset,
                writable,
                ..
            } => {
                if !writable {
                    log::trace!("[Bus] Dropped write to read-only {:#010x}", address);
                    return;
                }
                let _ = match width {
                    AccessWidth::Byte => buffer.store_8(offset, value as u8),
                    AccessWidth::Word => buffer.store_16(offset, value as u16),
                    AccessWidth::Dword => buffer.store_32(offset, value as u32),
                    AccessWidth::Qword => buffer.store_64(offset, value),
                };
            }
            Target::Complex { handlers, offset } => handlers.write(offset, width, width.mask(value)),
            Target::Split => {
                for i in 0..width.bytes() {
                    self.store(address.wrapping_add(i), AccessWidth::Byte, (value >> (i * 8)) & 0xFF);
                }
            }
            Target::Unmapped => {
                log::trace!("[Bus] Unmapped write {:#010x} <- {:#x}", address, value);
            }
        }
    }

    /// Read `width` bytes at `address`. Unmapped bytes read as `0xFF`.
    #[inline]
    pub fn read_memory(&self, address: PhysicalMemoryAddress, width: AccessWidth) -> u64 {
        self.load(address, width, false)
    }

    /// Write `width` bytes at `address`. Unanswered writes are dropped.
    #[inline]
    pub fn write_memory(&self, address: PhysicalMemoryAddress, width: AccessWidth, value: u64) {
        self.store(address, width, value)
    }

    /// Code fetch: like a read, but direct regions must also be executable.
    #[inline]
    pub fn fetch_memory(&self, address: PhysicalMemoryAddress, width: AccessWidth) -> u64 {
        self.load(address, width, true)
    }

    #[inline]
    pub fn read_memory_byte(&self, address: PhysicalMemoryAddress) -> u8 {
        self.read_memory(address, AccessWidth::Byte) as u8
    }

    #[inline]
    pub fn read_memory_word(&self, address: PhysicalMemoryAddress) -> u16 {
        self.read_memory(address, AccessWidth::Word) as u16
    }

    #[inline]
    pub fn read_memory_dword(&self, address: PhysicalMemoryAddress) -> u32 {
        self.read_memory(address, AccessWidth::Dword) as u32
    }

    #[inline]
    pub fn read_memory_qword(&self, address: PhysicalMemoryAddress) -> u64 {
        self.read_memory(address, AccessWidth::Qword)
    }

    #[inline]
    pub fn write_memory_byte(&self, address: PhysicalMemoryAddress, value: u8) {
        self.write_memory(address, AccessWidth::Byte, value as u64)
    }

    #[inline]
    pub fn write_memory_word(&self, address: PhysicalMemoryAddress, value: u16) {
        self.write_memory(address, AccessWidth::Word, value as u64)
    }

    #[inline]
    pub fn write_memory_dword(&self, address: PhysicalMemoryAddress, value: u32) {
        self.write_memory(address, AccessWidth::Dword, value as u64)
    }

    #[inline]
    pub fn write_memory_qword(&self, address: PhysicalMemoryAddress, value: u64) {
        self.write_memory(address, AccessWidth::Qword, value)
    }

    /// Whether a code cache may keep translated code for `address`.
    pub fn is_cacheable(&self, address: PhysicalMemoryAddress) -> bool {
        let regions = self.regions.borrow();
        let index = regions.partition_point(|r| r.mmio.start() <= address);
        if index == 0 {
            return false;
        }
        let region = &regions[index - 1];
        if !region.mmio.contains(address) {
            return false;
        }
        match region.mmio.kind() {
            MmioKind::Direct { executable, .. } => *executable,
            MmioKind::Complex { cacheable, .. } => *cacheable,
        }
    }

    // ========== Port I/O registration ==========

    /// Allocate an owner identity for a device's port bindings.
    pub fn new_port_owner(&self) -> PortOwner {
        let owner = PortOwner(self.next_port_owner.get());
        self.next_port_owner.set(owner.0.wrapping_add(1));
        owner
    }

    fn bind_port<F>(&self, port: u16, owner: PortOwner, bind: F) -> Result<(), BusError>
    where
        F: FnOnce(&mut IoPortBinding),
    {
        let mut ports = self.io_ports.borrow_mut();
        let binding = ports.entry(port).or_insert_with(|| IoPortBinding::new(owner));
        if binding.owner != owner {
            log::error!("[Bus] I/O port {:#06x} is already owned", port);
            return Err(BusError::PortInUse { port });
        }
        bind(binding);
        Ok(())
    }

    pub fn connect_io_port_read_byte<F>(&self, port: u16, owner: PortOwner, handler: F) -> Result<(), BusError>
    where
        F: Fn(u16) -> u8 + 'static,
    {
        self.bind_port(port, owner, |b| b.read_byte = Some(Rc::new(handler)))
    }

    pub fn connect_io_port_read_word<F>(&self, port: u16, owner: PortOwner, handler: F) -> Result<(), BusError>
    where
        F: Fn(u16) -> u16 + 'static,
    {
        self.bind_port(port, owner, |b| b.read_word = Some(Rc::new(handler)))
    }

    pub fn connect_io_port_write_byte<F>(&self, port: u16, owner: PortOwner, handler: F) -> Result<(), BusError>
    where
        F: Fn(u16, u8) + 'static,
    {
        self.bind_port(port, owner, |b| b.write_byte = Some(Rc::new(handler)))
    }

    pub fn connect_io_port_write_word<F>(&self, port: u16, owner: PortOwner, handler: F) -> Result<(), BusError>
    where
        F: Fn(u16, u16) + 'static,
    {
        self.bind_port(port, owner, |b| b.write_word = Some(Rc::new(handler)))
    }

    /// Remove `owner`'s binding of `port`. Bindings of other owners are untouched.
    pub fn disconnect_io_port(&self, port: u16, owner: PortOwner) -> bool {
        let mut ports = self.io_ports.borrow_mut();
        match ports.get(&port) {
            Some(binding) if binding.owner == owner => {
                ports.remove(&port);
                true
            }
            _ => false,
        }
    }

    /// Remove every port binding held by `owner`.
    pub fn disconnect_io_ports(&self, owner: PortOwner) {
        self.io_ports.borrow_mut().retain(|_, b| b.owner != owner);
    }

    pub fn is_io_port_connected(&self, port: u16) -> bool {
        self.io_ports.borrow().contains_key(&port)
    }

    // ========== Port I/O dispatch ==========

    pub fn read_io_port_byte(&self, port: u16) -> u8 {
        let handler = self
            .io_ports
            .borrow()
            .get(&port)
            .and_then(|b| b.read_byte.clone());
        match handler {
            Some(h) => h(port),
            None => {
                log::trace!("[Bus] Unhandled byte read from port {:#06x}", port);
                UNMAPPED_BYTE
            }
        }
    }

    /// Word read; ports with only byte handlers read `port` then `port + 1`.
    pub fn read_io_port_word(&self, port: u16) -> u16 {
        let handler = self
            .io_ports
            .borrow()
            .get(&port)
            .and_then(|b| b.read_word.clone());
        match handler {
            Some(h) => h(port),
            None => {
                let low = self.read_io_port_byte(port) as u16;
                let high = self.read_io_port_byte(port.wrapping_add(1)) as u16;
                low | (high << 8)
            }
        }
    }

    pub fn write_io_port_byte(&self, port: u16, value: u8) {
        let handler = self
            .io_ports
            .borrow()
            .get(&port)
            .and_then(|b| b.write_byte.clone());
        match handler {
            Some(h) => h(port, value),
            None => log::trace!("[Bus] Unhandled byte write to port {:#06x} <- {:#04x}", port, value),
        }
    }

    /// Word write; ports with only byte handlers write `port` then `port + 1`.
    pub fn write_io_port_word(&self, port: u16, value: u16) {
        let handler = self
            .io_ports
            .borrow()
            .get(&port)
            .and_then(|b| b.write_word.clone());
        match handler {
            Some(h) => h(port, value),
            None => {
                self.write_io_port_byte(port, value as u8);
                self.write_io_port_byte(port.wrapping_add(1), (value >> 8) as u8);
            }
        }
    }
}

impl Default for Bus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ram(size: usize) -> Rc<MemoryBuffer> {
        Rc::new(MemoryBuffer::new(size))
    }

    #[test]
    fn direct_region_byte_write_word_read() {
        let bus = Bus::new();
        bus.connect_memory(Mmio::direct(0x1000, 1024, ram(1024), true, true, false))
            .unwrap();

        bus.write_memory_byte(0x1000, 0xAA);
        assert_eq!(bus.read_memory(0x1000, AccessWidth::Word), 0x00AA);
    }

    #[test]
    fn unmapped_reads_fill_and_writes_drop() {
        let bus = Bus::new();
        assert_eq!(bus.read_memory_byte(0x5000), 0xFF);
        assert_eq!(bus.read_memory_dword(0x5000), 0xFFFF_FFFF);
        bus.write_memory_dword(0x5000, 0);

        let id = bus
            .connect_memory(Mmio::direct(0x5000, 16, ram(16), true, true, false))
            .unwrap();
        bus.write_memory_byte(0x5000, 0x12);
        assert_eq!(bus.read_memory_byte(0x5000), 0x12);

        assert!(bus.disconnect_memory(id));
        assert!(!bus.disconnect_memory(id));
        assert_eq!(bus.read_memory_byte(0x5000), 0xFF);
    }

    #[test]
    fn read_only_and_execute_flags() {
        let bus = Bus::new();
        let rom = Rc::new(MemoryBuffer::from_bytes(&[0x55, 0xAA]));
        bus.connect_memory(Mmio::direct(0xC0000, 2, rom.clone(), true, false, true))
            .unwrap();
        let data = ram(2);
        bus.connect_memory(Mmio::direct(0xD0000, 2, data, true, true, false))
            .unwrap();

        bus.write_memory_byte(0xC0000, 0x00);
        assert_eq!(bus.read_memory_word(0xC0000), 0xAA55);
        assert_eq!(rom.load_8(0).unwrap(), 0x55);

        assert_eq!(bus.fetch_memory(0xC0000, AccessWidth::Byte), 0x55);
        assert_eq!(bus.fetch_memory(0xD0000, AccessWidth::Byte), 0xFF);
        assert!(bus.is_cacheable(0xC0001));
        assert!(!bus.is_cacheable(0xD0000));
        assert!(!bus.is_cacheable(0x0));
    }

    #[test]
    fn overlapping_connect_is_rejected_until_disconnected() {
        let bus = Bus::new();
        let first = bus
            .connect_memory(Mmio::direct(0xA0000, 0x10000, ram(0x10000), true, true, false))
            .unwrap();

        let err = bus
            .connect_memory(Mmio::direct(0xA8000, 0x10000, ram(0x10000), true, true, false))
            .unwrap_err();
        assert_eq!(
            err,
            BusError::Overlap {
                start: 0xA8000,
                size: 0x10000,
                existing_start: 0xA0000,
                existing_size: 0x10000,
            }
        );
        assert_eq!(bus.regions().len(), 1);

        assert!(bus.disconnect_memory(first));
        bus.connect_memory(Mmio::direct(0xA8000, 0x10000, ram(0x10000), true, true, false))
            .unwrap();
        assert_eq!(bus.regions_in_range(0xA0000, 0x20000).len(), 1);
    }

    #[test]
    fn adjacent_regions_do_not_overlap() {
        let bus = Bus::new();
        bus.connect_memory(Mmio::direct(0x2000, 0x1000, ram(0x1000), true, true, false))
            .unwrap();
        bus.connect_memory(Mmio::direct(0x1000, 0x1000, ram(0x1000), true, true, false))
            .unwrap();
        bus.connect_memory(Mmio::direct(0x3000, 0x1000, ram(0x1000), true, true, false))
            .unwrap();
        let starts: Vec<u32> = bus.regions().iter().map(|r| r.start).collect();
        assert_eq!(starts, vec![0x1000, 0x2000, 0x3000]);
    }

    #[test]
    fn invalid_ranges_are_rejected() {
        let bus = Bus::new();
        assert!(matches!(
            bus.connect_memory(Mmio::direct(0x1000, 0, ram(16), true, true, false)),
            Err(BusError::InvalidRange { .. })
        ));
        assert!(matches!(
            bus.connect_memory(Mmio::direct(0x1000, 32, ram(16), true, true, false)),
            Err(BusError::BufferTooSmall { .. })
        ));
    }

    #[test]
    fn access_straddling_regions_is_split() {
        let bus = Bus::new();
        let low = ram(4);
        let high = ram(4);
        bus.connect_memory(Mmio::direct(0x100, 4, low.clone(), true, true, false))
            .unwrap();
        bus.connect_memory(Mmio::direct(0x104, 4, high.clone(), true, true, false))
            .unwrap();

        bus.write_memory_dword(0x102, 0x4433_2211);
        assert_eq!(low.load_16(2).unwrap(), 0x2211);
        assert_eq!(high.load_16(0).unwrap(), 0x4433);
        assert_eq!(bus.read_memory_dword(0x102), 0x4433_2211);

        // Partially unmapped: the unmapped bytes read as 0xFF.
        assert_eq!(bus.read_memory_word(0x0FF), 0x00FF);
        assert_eq!(bus.read_memory_word(0x107), 0xFF00);
    }

    #[test]
    fn complex_byte_only_region_round_trips_dwords() {
        use std::cell::RefCell;

        let bus = Bus::new();
        let backing = Rc::new(RefCell::new(vec![0u8; 16]));
        let writes = Rc::new(RefCell::new(Vec::new()));

        let mut handlers = MmioHandlers::default();
        handlers.read_byte = Some(Box::new({
            let backing = backing.clone();
            move |offset: u32| backing.borrow()[offset as usize]
        }));
        handlers.write_byte = Some(Box::new({
            let backing = backing.clone();
            let writes = writes.clone();
            move |offset: u32, value: u8| {
                writes.borrow_mut().push(offset);
                backing.borrow_mut()[offset as usize] = value;
            }
        }));
        bus.connect_memory(Mmio::complex(0x8000, 16, handlers, false))
            .unwrap();

        bus.write_memory_dword(0x8004, 0xCAFE_F00D);
        assert_eq!(*writes.borrow(), vec![4, 5, 6, 7]);
        assert_eq!(bus.read_memory_dword(0x8004), 0xCAFE_F00D);
        assert_eq!(bus.read_memory_qword(0x8004), 0x0000_0000_CAFE_F00D);
    }

    #[test]
    fn handler_can_remap_its_own_region() {
        let bus = Rc::new(Bus::new());
        let remapped = Rc::new(Cell::new(false));

        let mut handlers = MmioHandlers::default();
        handlers.write_byte = Some(Box::new({
            let bus = Rc::downgrade(&bus);
            let remapped = remapped.clone();
            move |_offset: u32, _value: u8| {
                let Some(bus) = bus.upgrade() else { return };
                let id = bus.regions()[0].id;
                bus.disconnect_memory(id);
                bus.connect_memory(Mmio::direct(0x0, 4, Rc::new(MemoryBuffer::new(4)), true, true, false))
                    .unwrap();
                remapped.set(true);
            }
        }));
        bus.connect_memory(Mmio::complex(0x0, 4, handlers, false)).unwrap();

        bus.write_memory_byte(0x0, 1);
        assert!(remapped.get());
        assert!(bus.regions()[0].direct);
        assert_eq!(bus.read_memory_byte(0x0), 0);
    }

    #[test]
    fn io_ports_have_single_owner() {
        let bus = Bus::new();
        let a = bus.new_port_owner();
        let b = bus.new_port_owner();
        let latch = Rc::new(Cell::new(0u16));

        bus.connect_io_port_write_word(0x1CE, a, {
            let latch = latch.clone();
            move |_, v| latch.set(v)
        })
        .unwrap();
        bus.connect_io_port_read_word(0x1CE, a, {
            let latch = latch.clone();
            move |_| latch.get()
        })
        .unwrap();
        assert_eq!(
            bus.connect_io_port_read_byte(0x1CE, b, |_| 0),
            Err(BusError::PortInUse { port: 0x1CE })
        );

        bus.write_io_port_word(0x1CE, 0x1234);
        assert_eq!(bus.read_io_port_word(0x1CE), 0x1234);
        // No byte handler connected.
        assert_eq!(bus.read_io_port_byte(0x1CE), 0xFF);

        assert!(!bus.disconnect_io_port(0x1CE, b));
        bus.disconnect_io_ports(a);
        assert!(!bus.is_io_port_connected(0x1CE));
        assert_eq!(bus.read_io_port_word(0x1CE), 0xFFFF);
    }

    #[test]
    fn word_port_access_decomposes_to_bytes() {
        let bus = Bus::new();
        let owner = bus.new_port_owner();
        let seen = Rc::new(RefCell::new(Vec::new()));
        for port in [0x3C4u16, 0x3C5] {
            bus.connect_io_port_write_byte(port, owner, {
                let seen = seen.clone();
                move |p, v| seen.borrow_mut().push((p, v))
            })
            .unwrap();
            bus.connect_io_port_read_byte(port, owner, |p| p as u8).unwrap();
        }

        bus.write_io_port_word(0x3C4, 0x0F02);
        assert_eq!(*seen.borrow(), vec![(0x3C4, 0x02), (0x3C5, 0x0F)]);
        assert_eq!(bus.read_io_port_word(0x3C4), 0xC5C4);
    }
}
