//! System RAM.
//!
//! PC memory map: conventional memory below the legacy video window, then
//! extended memory from 1MiB up to the configured size. The hole between
//! 640KiB and 1MiB is left to video and option ROMs.

use crate::bus::{Bus, RegionId};
use crate::device::Device;
use crate::error::{DeviceError, SnapshotError};
use crate::memory::MemoryBuffer;
use crate::mmio::Mmio;
use crate::snapshot::{StateReader, StateWriter, TAG_RAM};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::rc::Rc;

pub const CONVENTIONAL_MEMORY_END: u32 = 0xA0000;
pub const EXTENDED_MEMORY_START: u32 = 0x100000;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RamRegionState {
    base: u32,
    size: u32,
    hash: String,
    data: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RamState {
    total_size: u32,
    regions: Vec<RamRegionState>,
}

struct RamRegion {
    base: u32,
    buffer: Rc<MemoryBuffer>,
    id: Option<RegionId>,
}

fn digest(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

pub struct SystemRam {
    total_size: u32,
    regions: Vec<RamRegion>,
}

impl SystemRam {
    pub fn new(total_size: u32) -> Self {
        let mut regions = vec![RamRegion {
            base: 0,
            buffer: Rc::new(MemoryBuffer::new(total_size.min(CONVENTIONAL_MEMORY_END) as usize)),
            id: None,
        }];
        if total_size > EXTENDED_MEMORY_START {
            regions.push(RamRegion {
                base: EXTENDED_MEMORY_START,
                buffer: Rc::new(MemoryBuffer::new((total_size - EXTENDED_MEMORY_START) as usize)),
                id: None,
            });
        }
        Self { total_size, regions }
    }

    pub fn total_size(&self) -> u32 {
        self.total_size
    }
}

impl Device for SystemRam {
    fn name(&self) -> &str {
        "SystemRAM"
    }

    fn initialize(&mut self, bus: &Rc<Bus>) -> Result<(), DeviceError> {
        for region in &mut self.regions {
            let size = region.buffer.size() as u32;
            let id = bus.connect_memory(Mmio::direct(region.base, size, region.buffer.clone(), true, true, true))?;
            log::debug!("[RAM] {:#010x}-{:#010x} connected", region.base, region.base as u64 + size as u64);
            region.id = Some(id);
        }
        log::info!("[RAM] {} KiB system memory", self.total_size / 1024);
        Ok(())
    }

    fn reset(&mut self) {
        // Memory contents survive a reset.
    }

    fn save_state(&self, writer: &mut StateWriter) -> Result<(), SnapshotError> {
        let state = RamState {
            total_size: self.total_size,
            regions: self
                .regions
                .iter()
                .map(|r| {
                    let data = r.buffer.get_data();
                    RamRegionState {
                        base: r.base,
                        size: data.len() as u32,
                        hash: digest(&data),
                        data,
                    }
                })
                .collect(),
        };
        writer.write_section(TAG_RAM, &state)
    }

    fn load_state(&mut self, reader: &mut StateReader<'_>) -> Result<(), SnapshotError> {
        let state: RamState = reader.read_section(TAG_RAM)?;

        if state.total_size != self.total_size || state.regions.len() != self.regions.len() {
            return Err(SnapshotError::Invalid(format!(
                "RAM size mismatch: machine={} bytes, snapshot={} bytes",
                self.total_size, state.total_size
            )));
        }
        for (saved, region) in state.regions.iter().zip(&self.regions) {
            if saved.base != region.base || saved.data.len() != region.buffer.size() {
                return Err(SnapshotError::Invalid(format!(
                    "RAM region layout mismatch at {:#010x}",
                    saved.base
                )));
            }
            if digest(&saved.data) != saved.hash {
                return Err(SnapshotError::DigestMismatch(format!("SRAM@{:#x}", saved.base)));
            }
        }

        for (saved, region) in state.regions.iter().zip(&self.regions) {
            region
                .buffer
                .set_data(&saved.data)
                .map_err(|e| SnapshotError::Invalid(e.to_string()))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_conventional_and_extended_memory() {
        let bus = Rc::new(Bus::new());
        let mut ram = SystemRam::new(2 * 1024 * 1024);
        ram.initialize(&bus).unwrap();

        let regions = bus.regions();
        assert_eq!(regions.len(), 2);
        assert_eq!((regions[0].start, regions[0].size), (0, 0xA0000));
        assert_eq!((regions[1].start, regions[1].size), (0x100000, 0x100000));

        bus.write_memory_dword(0x100010, 0x1234_5678);
        assert_eq!(ram.regions[1].buffer.load_32(0x10).unwrap(), 0x1234_5678);
        assert_eq!(bus.read_memory_byte(0xB0000), 0xFF);
    }

    #[test]
    fn state_round_trip_and_size_check() {
        let bus = Rc::new(Bus::new());
        let mut ram = SystemRam::new(1024 * 1024 + 4096);
        ram.initialize(&bus).unwrap();
        bus.write_memory_byte(0x10, 0xAB);
        bus.write_memory_byte(0x100FFF, 0xCD);

        let mut w = StateWriter::new();
        ram.save_state(&mut w).unwrap();
        let bytes = w.into_bytes();

        bus.write_memory_byte(0x10, 0);
        bus.write_memory_byte(0x100FFF, 0);
        ram.load_state(&mut StateReader::new(&bytes)).unwrap();
        assert_eq!(bus.read_memory_byte(0x10), 0xAB);
        assert_eq!(bus.read_memory_byte(0x100FFF), 0xCD);

        // A machine with a different memory size rejects the section untouched.
        let mut other = SystemRam::new(2 * 1024 * 1024);
        assert!(matches!(
            other.load_state(&mut StateReader::new(&bytes)),
            Err(SnapshotError::Invalid(_))
        ));
    }

    #[test]
    fn corrupted_data_fails_digest_check() {
        let bus = Rc::new(Bus::new());
        let mut ram = SystemRam::new(1024 * 1024 + 4096);
        ram.initialize(&bus).unwrap();
        bus.write_memory_dword(0x10, 0xDEAD_BEEF);

        let mut w = StateWriter::new();
        ram.save_state(&mut w).unwrap();
        let mut bytes = w.into_bytes();

        let pattern = 0xDEAD_BEEFu32.to_le_bytes();
        let at = bytes.windows(4).position(|w| w == pattern).unwrap();
        bytes[at] ^= 0x01;

        bus.write_memory_dword(0x10, 0x1111_1111);
        assert!(matches!(
            ram.load_state(&mut StateReader::new(&bytes)),
            Err(SnapshotError::DigestMismatch(ref region)) if region == "SRAM@0x0"
        ));
        assert_eq!(bus.read_memory_dword(0x10), 0x1111_1111);
    }
}
