//! Bochs/QEMU "DISPI" VBE framebuffer controller.
//!
//! Mode setting goes through an index/data port pair (`0x01CE`/`0x01CF`).
//! Guest memory access goes through:
//!
//! - a 64KiB bank window at `0xA0000` while VBE is enabled (planar for 4bpp,
//!   linear otherwise), or the full legacy window `0xA0000..0xC0000` while it
//!   is disabled;
//! - a linear framebuffer (PCI BAR0) while VBE and LFB are both enabled;
//! - the option ROM at `0xC0000` (PCI expansion ROM).
//!
//! Only the legacy VGA registers needed by planar access and the palette are
//! modelled (sequencer map mask, graphics controller read map select, DAC).
//! Text modes and the attribute controller are not.

use crate::bus::{Bus, PortOwner, RegionId};
use crate::device::{Device, PciRegion};
use crate::display::{Display, DisplayTiming, FramebufferFormat};
use crate::error::{BusError, DeviceError, SnapshotError};
use crate::memory::MemoryBuffer;
use crate::mmio::{Mmio, MmioHandlers, UNMAPPED_BYTE};
use crate::snapshot::{StateReader, StateWriter, TAG_BOCHS_VGA};
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::path::PathBuf;
use std::rc::{Rc, Weak};

pub const VBE_DISPI_IOPORT_INDEX: u16 = 0x01CE;
pub const VBE_DISPI_IOPORT_DATA: u16 = 0x01CF;

pub const VBE_DISPI_INDEX_ID: u16 = 0x0;
pub const VBE_DISPI_INDEX_XRES: u16 = 0x1;
pub const VBE_DISPI_INDEX_YRES: u16 = 0x2;
pub const VBE_DISPI_INDEX_BPP: u16 = 0x3;
pub const VBE_DISPI_INDEX_ENABLE: u16 = 0x4;
pub const VBE_DISPI_INDEX_BANK: u16 = 0x5;
pub const VBE_DISPI_INDEX_VIRT_WIDTH: u16 = 0x6;
pub const VBE_DISPI_INDEX_VIRT_HEIGHT: u16 = 0x7;
pub const VBE_DISPI_INDEX_X_OFFSET: u16 = 0x8;
pub const VBE_DISPI_INDEX_Y_OFFSET: u16 = 0x9;
pub const VBE_DISPI_INDEX_VIDEO_MEMORY_64K: u16 = 0xA;
pub const VBE_DISPI_INDEX_DDC: u16 = 0xB;

pub const VBE_DISPI_ID0: u16 = 0xB0C0;
pub const VBE_DISPI_ID5: u16 = 0xB0C5;

pub const VBE_DISPI_MAX_XRES: u16 = 2560;
pub const VBE_DISPI_MAX_YRES: u16 = 1600;
pub const VBE_DISPI_MAX_BPP: u16 = 32;

pub const VBE_DISPI_ENABLED: u16 = 0x01;
pub const VBE_DISPI_GETCAPS: u16 = 0x02;
pub const VBE_DISPI_8BIT_DAC: u16 = 0x20;
pub const VBE_DISPI_LFB_ENABLED: u16 = 0x40;
pub const VBE_DISPI_NOCLEARMEM: u16 = 0x80;

pub const VBE_DISPI_BANK_ADDRESS: u32 = 0xA0000;
pub const VBE_DISPI_BANK_SIZE: u32 = 0x10000;
pub const VBE_DISPI_DEFAULT_LFB_PHYSICAL_ADDRESS: u32 = 0xE000_0000;
pub const VBE_DISPI_DEFAULT_VIDEO_MEMORY: u32 = 16 * 1024 * 1024;

pub const BIOS_ROM_LOCATION: u32 = 0xC0000;
pub const BIOS_ROM_SIZE: u32 = 0x10000;

const LEGACY_WINDOW_START: u32 = 0xA0000;
const LEGACY_WINDOW_SIZE: u32 = 0x20000;

const VGA_SEQUENCER_INDEX: u16 = 0x3C4;
const VGA_SEQUENCER_DATA: u16 = 0x3C5;
const VGA_DAC_READ_INDEX: u16 = 0x3C7;
const VGA_DAC_WRITE_INDEX: u16 = 0x3C8;
const VGA_DAC_DATA: u16 = 0x3C9;
const VGA_GRAPHICS_INDEX: u16 = 0x3CE;
const VGA_GRAPHICS_DATA: u16 = 0x3CF;

const SEQUENCER_MAP_MASK: usize = 2;
const GRAPHICS_READ_MAP_SELECT: usize = 4;

const DAC_STATE_WRITE: u8 = 0x00;
const DAC_STATE_READ: u8 = 0x03;

/// Construction parameters.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct BochsVgaConfig {
    /// Option ROM image, mapped at `0xC0000`. No ROM is mapped when unset.
    pub bios_image: Option<PathBuf>,
    pub vram_size: u32,
    pub lfb_address: u32,
}

impl Default for BochsVgaConfig {
    fn default() -> Self {
        Self {
            bios_image: None,
            vram_size: VBE_DISPI_DEFAULT_VIDEO_MEMORY,
            lfb_address: VBE_DISPI_DEFAULT_LFB_PHYSICAL_ADDRESS,
        }
    }
}

/// DISPI register file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct VbeRegisters {
    pub index: u16,
    pub id: u16,
    pub xres: u16,
    pub yres: u16,
    pub bpp: u16,
    pub enable: u16,
    pub bank: u16,
    pub virt_width: u16,
    pub virt_height: u16,
    pub x_offset: u16,
    pub y_offset: u16,
}

impl VbeRegisters {
    fn is_enabled(&self) -> bool {
        self.enable & VBE_DISPI_ENABLED != 0
    }

    fn has(&self, bit: u16) -> bool {
        self.enable & bit != 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
struct LegacyRegisters {
    sequencer_index: u8,
    sequencer: [u8; 5],
    graphics_index: u8,
    graphics: [u8; 9],
    dac_read_index: u8,
    dac_write_index: u8,
    dac_state: u8,
    dac_component: u8,
    dac_latch: [u8; 3],
}

/// Per-frame copy of the scanout parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RenderLatch {
    pub graphics_mode: bool,
    /// Byte offset into VRAM (plane address for 4bpp).
    pub start_address: u32,
    pub pitch: u32,
    pub render_width: u32,
    pub render_height: u32,
    pub horizontal_panning: u8,
}

#[derive(Debug, Serialize, Deserialize)]
struct BochsVgaState {
    vbe: VbeRegisters,
    legacy: LegacyRegisters,
    palette: Vec<u32>,
    vram: Vec<u8>,
}

fn is_valid_bpp(bpp: u16) -> bool {
    matches!(bpp, 4 | 8 | 15 | 16 | 24 | 32)
}

/// 6-bit DAC components to 8-bit: 00123456 -> 12345656.
fn convert_6bit_color_to_8bit(color: u32) -> u32 {
    let c = |shift: u32| {
        let v = (color >> shift) & 0x3F;
        ((v << 2) | (v >> 4)) << shift
    };
    c(0) | c(8) | c(16)
}

fn convert_8bit_color_to_6bit(color: u32) -> u32 {
    (color >> 2) & 0x003F_3F3F
}

/// Device state, shared with the bus handlers it registers.
struct VgaCore {
    self_ref: Weak<RefCell<VgaCore>>,
    bus: Weak<Bus>,
    display: Rc<RefCell<dyn Display>>,

    vbe: VbeRegisters,
    legacy: LegacyRegisters,
    palette: Vec<u32>,
    vram: Rc<MemoryBuffer>,
    bios: Option<Rc<MemoryBuffer>>,

    lfb_address: u32,
    bar0_active: bool,
    expansion_rom_active: bool,

    lfb_region: Option<RegionId>,
    window_region: Option<RegionId>,
    bios_region: Option<RegionId>,
}

fn with_core<R>(core: &Weak<RefCell<VgaCore>>, f: impl FnOnce(&mut VgaCore) -> R) -> Option<R> {
    let core = core.upgrade()?;
    let mut core = core.borrow_mut();
    Some(f(&mut core))
}

/// VRAM offset of the current bank.
fn bank_base(core: &Weak<RefCell<VgaCore>>) -> Option<usize> {
    let core = core.upgrade()?;
    let bank = core.borrow().vbe.bank;
    Some(bank as usize * VBE_DISPI_BANK_SIZE as usize)
}

impl VgaCore {
    fn is_lfb_enabled(&self) -> bool {
        self.vbe.is_enabled() && self.vbe.has(VBE_DISPI_LFB_ENABLED)
    }

    fn vram_size(&self) -> u32 {
        self.vram.size() as u32
    }

    fn dac_color_mask(&self) -> u8 {
        if self.vbe.has(VBE_DISPI_8BIT_DAC) { 0xFF } else { 0x3F }
    }

    // ========== Memory mapping ==========

    fn update_bios_memory_mapping(&mut self) -> Result<(), BusError> {
        let Some(bus) = self.bus.upgrade() else { return Ok(()) };
        if let Some(id) = self.bios_region.take() {
            bus.disconnect_memory(id);
        }

        match &self.bios {
            Some(rom) if self.expansion_rom_active => {
                log::debug!("[BochsVGA] Map BIOS to {:#010x}", BIOS_ROM_LOCATION);
                let mmio = Mmio::direct(BIOS_ROM_LOCATION, BIOS_ROM_SIZE, rom.clone(), true, false, true);
                self.bios_region = Some(bus.connect_memory(mmio)?);
            }
            _ => log::debug!("[BochsVGA] Unmapping BIOS"),
        }
        Ok(())
    }

    fn update_vga_memory_mapping(&mut self) -> Result<(), BusError> {
        let Some(bus) = self.bus.upgrade() else { return Ok(()) };
        if let Some(id) = self.lfb_region.take() {
            bus.disconnect_memory(id);
        }
        if let Some(id) = self.window_region.take() {
            bus.disconnect_memory(id);
        }

        if self.is_lfb_enabled() && self.bar0_active {
            let mmio = Mmio::direct(self.lfb_address, self.vram_size(), self.vram.clone(), true, true, false);
            self.lfb_region = Some(bus.connect_memory(mmio)?);
            log::debug!("[BochsVGA] LFB is enabled at {:#010x}", self.lfb_address);
        }

        let window = if self.vbe.is_enabled() {
            // Banked modes are always a 64KiB window at A0000.
            let handlers = if self.vbe.bpp <= 4 {
                self.planar_handlers(true)
            } else {
                self.linear_handlers()
            };
            Mmio::complex(VBE_DISPI_BANK_ADDRESS, VBE_DISPI_BANK_SIZE, handlers, false)
        } else {
            Mmio::complex(LEGACY_WINDOW_START, LEGACY_WINDOW_SIZE, self.planar_handlers(false), false)
        };
        self.window_region = Some(bus.connect_memory(window)?);
        Ok(())
    }

    fn planar_handlers(&self, banked: bool) -> MmioHandlers {
        let mut handlers = MmioHandlers::default();

        let core = self.self_ref.clone();
        handlers.read_byte = Some(Box::new(move |offset: u32| {
            core.upgrade()
                .map_or(UNMAPPED_BYTE, |core| core.borrow().read_planar(banked, offset))
        }));

        let core = self.self_ref.clone();
        handlers.write_byte = Some(Box::new(move |offset: u32, value: u8| {
            if let Some(core) = core.upgrade() {
                core.borrow().write_planar(banked, offset, value);
            }
        }));
        handlers
    }

    fn linear_handlers(&self) -> MmioHandlers {
        let mut handlers = MmioHandlers::default();

        let (core, vram) = (self.self_ref.clone(), self.vram.clone());
        handlers.read_byte = Some(Box::new(move |offset: u32| {
            bank_base(&core)
                .and_then(|base| vram.load_8(base + offset as usize).ok())
                .unwrap_or(UNMAPPED_BYTE)
        }));
        let (core, vram) = (self.self_ref.clone(), self.vram.clone());
        handlers.read_word = Some(Box::new(move |offset: u32| {
            bank_base(&core)
                .and_then(|base| vram.load_16(base + offset as usize).ok())
                .unwrap_or(0xFFFF)
        }));
        let (core, vram) = (self.self_ref.clone(), self.vram.clone());
        handlers.read_dword = Some(Box::new(move |offset: u32| {
            bank_base(&core)
                .and_then(|base| vram.load_32(base + offset as usize).ok())
                .unwrap_or(0xFFFF_FFFF)
        }));

        let (core, vram) = (self.self_ref.clone(), self.vram.clone());
        handlers.write_byte = Some(Box::new(move |offset: u32, value: u8| {
            if let Some(base) = bank_base(&core) {
                if let Err(e) = vram.store_8(base + offset as usize, value) {
                    log::trace!("[BochsVGA] Dropped bank window write: {}", e);
                }
            }
        }));
        let (core, vram) = (self.self_ref.clone(), self.vram.clone());
        handlers.write_word = Some(Box::new(move |offset: u32, value: u16| {
            if let Some(base) = bank_base(&core) {
                if let Err(e) = vram.store_16(base + offset as usize, value) {
                    log::trace!("[BochsVGA] Dropped bank window write: {}", e);
                }
            }
        }));
        let (core, vram) = (self.self_ref.clone(), self.vram.clone());
        handlers.write_dword = Some(Box::new(move |offset: u32, value: u32| {
            if let Some(base) = bank_base(&core) {
                if let Err(e) = vram.store_32(base + offset as usize, value) {
                    log::trace!("[BochsVGA] Dropped bank window write: {}", e);
                }
            }
        }));
        handlers
    }

    /// Plane address of a window offset; VRAM holds the four planes
    /// interleaved, so plane `p` of address `a` is byte `a * 4 + p`.
    fn plane_address(&self, banked: bool, offset: u32) -> usize {
        let base = if banked {
            self.vbe.bank as usize * VBE_DISPI_BANK_SIZE as usize
        } else {
            0
        };
        base + offset as usize
    }

    fn read_planar(&self, banked: bool, offset: u32) -> u8 {
        let plane = (self.legacy.graphics[GRAPHICS_READ_MAP_SELECT] & 0x03) as usize;
        self.vram
            .load_8(self.plane_address(banked, offset) * 4 + plane)
            .unwrap_or(UNMAPPED_BYTE)
    }

    fn write_planar(&self, banked: bool, offset: u32, value: u8) {
        let address = self.plane_address(banked, offset) * 4;
        let map_mask = self.legacy.sequencer[SEQUENCER_MAP_MASK];
        for plane in 0..4 {
            if map_mask & (1 << plane) != 0 {
                if let Err(e) = self.vram.store_8(address + plane, value) {
                    log::trace!("[BochsVGA] Dropped planar write: {}", e);
                }
            }
        }
    }

    fn remap(&mut self) {
        if let Err(e) = self.update_vga_memory_mapping() {
            log::error!("[BochsVGA] Failed to update memory mapping: {}", e);
        }
    }

    // ========== Display ==========

    fn display_timing(&self) -> Option<DisplayTiming> {
        if !self.vbe.is_enabled() {
            return Some(DisplayTiming::VGA_640X480);
        }

        let (w, h) = (self.vbe.xres, self.vbe.yres);
        if w == 0 || w >= VBE_DISPI_MAX_XRES || h == 0 || h >= VBE_DISPI_MAX_YRES {
            return None;
        }

        // Report VGA 640x480@60 timings; the real size comes from the latch.
        log::debug!("[BochsVGA] VGA timings for {}x{}x{}", w, h, self.vbe.bpp);
        Some(DisplayTiming::VGA_640X480)
    }

    fn crtc_timing_changed(&mut self) {
        if let Some(timing) = self.display_timing() {
            self.display.borrow_mut().change_display_timing(&timing);
        }
    }

    fn update_framebuffer_format(&mut self) {
        let format = match self.vbe.bpp {
            _ if !self.vbe.is_enabled() => FramebufferFormat::C8RGBX8,
            0..=8 => FramebufferFormat::C8RGBX8,
            9..=15 => FramebufferFormat::BGR555,
            16 => FramebufferFormat::BGR565,
            17..=24 => FramebufferFormat::BGR8,
            _ => FramebufferFormat::BGRX8,
        };
        self.display.borrow_mut().change_framebuffer_format(format);
    }

    fn latch_start_address(&self) -> Option<RenderLatch> {
        if !self.vbe.is_enabled() {
            return None;
        }

        let bpp = self.vbe.bpp as u64;
        let (pitch, start_address, horizontal_panning) = if bpp < 8 {
            let pitch = (self.vbe.virt_width as u64 * bpp + 31) / 32;
            let start = self.vbe.y_offset as u64 * pitch + (self.vbe.x_offset as u64 * bpp) / 32;
            let panning = ((self.vbe.x_offset as u64 % 32) / bpp / 4) as u8;
            (pitch, start, panning)
        } else {
            let bytes_per_pixel = (bpp + 7) / 8;
            let pitch = bytes_per_pixel * self.vbe.virt_width as u64;
            let start = self.vbe.y_offset as u64 * pitch + self.vbe.x_offset as u64 * bytes_per_pixel;
            (pitch, start, 0)
        };

        let render_height = self.vbe.yres as u64;
        if start_address + pitch * render_height > self.vram_size() as u64 {
            log::warn!("[BochsVGA] VBE start address {:#010x} out-of-range", start_address);
            return None;
        }

        Some(RenderLatch {
            graphics_mode: true,
            start_address: start_address as u32,
            pitch: pitch as u32,
            render_width: self.vbe.xres as u32,
            render_height: render_height as u32,
            horizontal_panning,
        })
    }

    fn output_palette(&self, count: usize) -> Vec<u32> {
        let dac_8bit = self.vbe.has(VBE_DISPI_8BIT_DAC);
        self.palette[..count]
            .iter()
            .map(|&e| if dac_8bit { e } else { convert_6bit_color_to_8bit(e) })
            .collect()
    }

    fn render_frame(&mut self) -> bool {
        let Some(latch) = self.latch_start_address() else {
            return false;
        };

        let mut display = self.display.borrow_mut();
        display.resize_framebuffer(latch.render_width, latch.render_height);

        let rendered = match self.vbe.bpp {
            4 => {
                display.copy_palette(0, &self.output_palette(16));
                self.render_4bpp(&mut *display, &latch);
                true
            }
            8 => {
                display.copy_palette(0, &self.output_palette(256));
                self.render_linear(&mut *display, &latch)
            }
            15 | 16 | 24 | 32 => self.render_linear(&mut *display, &latch),
            _ => false,
        };
        if rendered {
            display.present();
        }
        rendered
    }

    /// 16-colour planar: each plane address yields 8 pixels, one bit per plane.
    fn render_4bpp(&self, display: &mut dyn Display, latch: &RenderLatch) {
        let (fb, stride) = display.framebuffer_mut();
        let width = latch.render_width as i64;

        for row in 0..latch.render_height {
            let mut address = (latch.start_address + row * latch.pitch) as usize;
            let fb_row = row as usize * stride as usize;
            let mut col = -(latch.horizontal_panning as i64);

            while col < width {
                let mut planes = [0u8; 4];
                if self.vram.read_into(address * 4, &mut planes).is_err() {
                    planes = [0; 4];
                }
                address += 1;

                for _ in 0..8 {
                    if col >= width {
                        break;
                    }
                    if col >= 0 {
                        let index = (planes[0] >> 7)
                            | ((planes[1] >> 7) << 1)
                            | ((planes[2] >> 7) << 2)
                            | ((planes[3] >> 7) << 3);
                        if let Some(px) = fb.get_mut(fb_row + col as usize) {
                            *px = index;
                        }
                    }
                    for p in &mut planes {
                        *p <<= 1;
                    }
                    col += 1;
                }
            }
        }
    }

    fn render_linear(&self, display: &mut dyn Display, latch: &RenderLatch) -> bool {
        let len = latch.pitch as usize * latch.render_height as usize;
        match self.vram.read_range(latch.start_address as usize, len) {
            Ok(data) => {
                display.copy_to_framebuffer(&data, latch.pitch);
                true
            }
            Err(_) => false,
        }
    }

    // ========== DISPI registers ==========

    fn read_vbe_data(&self) -> u16 {
        let caps = self.vbe.has(VBE_DISPI_GETCAPS);
        match self.vbe.index {
            VBE_DISPI_INDEX_ID => self.vbe.id,
            VBE_DISPI_INDEX_XRES => if caps { VBE_DISPI_MAX_XRES } else { self.vbe.xres },
            VBE_DISPI_INDEX_YRES => if caps { VBE_DISPI_MAX_YRES } else { self.vbe.yres },
            VBE_DISPI_INDEX_BPP => if caps { VBE_DISPI_MAX_BPP } else { self.vbe.bpp },
            VBE_DISPI_INDEX_ENABLE => self.vbe.enable,
            VBE_DISPI_INDEX_BANK => self.vbe.bank,
            VBE_DISPI_INDEX_VIRT_WIDTH => self.vbe.virt_width,
            VBE_DISPI_INDEX_VIRT_HEIGHT => self.vbe.virt_height,
            VBE_DISPI_INDEX_X_OFFSET => self.vbe.x_offset,
            VBE_DISPI_INDEX_Y_OFFSET => self.vbe.y_offset,
            VBE_DISPI_INDEX_VIDEO_MEMORY_64K => (self.vram_size() / VBE_DISPI_BANK_SIZE) as u16,
            VBE_DISPI_INDEX_DDC => 0x000F,
            _ => 0xFFFF,
        }
    }

    fn write_vbe_data(&mut self, value: u16) {
        match self.vbe.index {
            VBE_DISPI_INDEX_ID => {
                if (VBE_DISPI_ID0..=VBE_DISPI_ID5).contains(&value) {
                    self.vbe.id = value;
                } else {
                    log::warn!("[BochsVGA] Invalid ID: {:#06x}", value);
                }
            }
            VBE_DISPI_INDEX_XRES => {
                log::debug!("[BochsVGA] X Resolution = {}", value);
                self.vbe.xres = value;
            }
            VBE_DISPI_INDEX_YRES => {
                log::debug!("[BochsVGA] Y Resolution = {}", value);
                self.vbe.yres = value;
            }
            VBE_DISPI_INDEX_BPP => {
                if !is_valid_bpp(value) {
                    log::warn!("[BochsVGA] BPP {} is invalid", value);
                    return;
                }
                log::debug!("[BochsVGA] BPP = {}", value);
                self.vbe.bpp = value;
                if self.vbe.is_enabled() {
                    // Switching to or from 4bpp changes the window handlers.
                    self.remap();
                    self.update_framebuffer_format();
                }
            }
            VBE_DISPI_INDEX_ENABLE => self.write_enable(value),
            VBE_DISPI_INDEX_BANK => {
                if (value as u64 + 1) * VBE_DISPI_BANK_SIZE as u64 > self.vram_size() as u64 {
                    log::warn!("[BochsVGA] VBE bank {:#06x} is invalid", value);
                } else {
                    self.vbe.bank = value;
                }
            }
            VBE_DISPI_INDEX_VIRT_WIDTH => {
                log::debug!("[BochsVGA] Virtual Width = {}", value);
                self.vbe.virt_width = value;
            }
            VBE_DISPI_INDEX_VIRT_HEIGHT => {
                log::debug!("[BochsVGA] Virtual Height = {}", value);
                self.vbe.virt_height = value;
            }
            VBE_DISPI_INDEX_X_OFFSET => {
                log::debug!("[BochsVGA] Offset X = {}", value);
                self.vbe.x_offset = value;
            }
            VBE_DISPI_INDEX_Y_OFFSET => {
                log::debug!("[BochsVGA] Offset Y = {}", value);
                self.vbe.y_offset = value;
            }
            VBE_DISPI_INDEX_VIDEO_MEMORY_64K => {
                log::warn!("[BochsVGA] Write to 64K memory size {:#06x}", value);
            }
            VBE_DISPI_INDEX_DDC => log::warn!("[BochsVGA] DDC write {:#06x}", value),
            index => log::trace!("[BochsVGA] Write to unknown index {:#06x}", index),
        }
    }

    fn write_enable(&mut self, value: u16) {
        let old = self.vbe.enable;
        self.vbe.enable = value;
        let changed = old ^ value;

        if changed & VBE_DISPI_ENABLED != 0 {
            self.crtc_timing_changed();
            self.remap();
            self.update_framebuffer_format();

            if self.vbe.is_enabled() {
                // Virtual resolution and panning reset on enable.
                self.vbe.virt_width = self.vbe.xres;
                self.vbe.virt_height = self.vbe.yres;
                self.vbe.x_offset = 0;
                self.vbe.y_offset = 0;

                if value & VBE_DISPI_NOCLEARMEM == 0 {
                    log::debug!("[BochsVGA] Zeroing VRAM");
                    self.vram.fill(0);
                }
            }
        } else if changed & VBE_DISPI_LFB_ENABLED != 0 && self.vbe.is_enabled() {
            self.remap();
        }

        if changed & VBE_DISPI_8BIT_DAC != 0 {
            let convert = if value & VBE_DISPI_8BIT_DAC != 0 {
                convert_6bit_color_to_8bit
            } else {
                convert_8bit_color_to_6bit
            };
            for entry in &mut self.palette {
                *entry = convert(*entry);
            }
        }
    }

    // ========== Legacy VGA registers ==========

    fn read_sequencer(&self) -> u8 {
        let index = self.legacy.sequencer_index as usize;
        self.legacy.sequencer.get(index).copied().unwrap_or(UNMAPPED_BYTE)
    }

    fn write_sequencer(&mut self, value: u8) {
        let index = self.legacy.sequencer_index as usize;
        match self.legacy.sequencer.get_mut(index) {
            Some(reg) if index == SEQUENCER_MAP_MASK => *reg = value & 0x0F,
            Some(reg) => *reg = value,
            None => log::trace!("[BochsVGA] Sequencer write to unknown index {}", index),
        }
    }

    fn read_graphics(&self) -> u8 {
        let index = self.legacy.graphics_index as usize;
        self.legacy.graphics.get(index).copied().unwrap_or(UNMAPPED_BYTE)
    }

    fn write_graphics(&mut self, value: u8) {
        let index = self.legacy.graphics_index as usize;
        match self.legacy.graphics.get_mut(index) {
            Some(reg) if index == GRAPHICS_READ_MAP_SELECT => *reg = value & 0x03,
            Some(reg) => *reg = value,
            None => log::trace!("[BochsVGA] Graphics write to unknown index {}", index),
        }
    }

    fn write_dac_data(&mut self, value: u8) {
        let component = self.legacy.dac_component as usize;
        self.legacy.dac_latch[component] = value & self.dac_color_mask();
        self.legacy.dac_component += 1;

        if self.legacy.dac_component == 3 {
            let [r, g, b] = self.legacy.dac_latch;
            let index = self.legacy.dac_write_index as usize;
            self.palette[index] = r as u32 | (g as u32) << 8 | (b as u32) << 16;
            self.legacy.dac_write_index = self.legacy.dac_write_index.wrapping_add(1);
            self.legacy.dac_component = 0;
        }
    }

    fn read_dac_data(&mut self) -> u8 {
        let entry = self.palette[self.legacy.dac_read_index as usize];
        let value = (entry >> (self.legacy.dac_component as u32 * 8)) as u8 & self.dac_color_mask();
        self.legacy.dac_component += 1;

        if self.legacy.dac_component == 3 {
            self.legacy.dac_read_index = self.legacy.dac_read_index.wrapping_add(1);
            self.legacy.dac_component = 0;
        }
        value
    }

    fn connect_io_ports(&self, bus: &Bus, owner: PortOwner) -> Result<(), BusError> {
        let core = self.self_ref.clone();
        bus.connect_io_port_read_word(VBE_DISPI_IOPORT_INDEX, owner, move |_| {
            with_core(&core, |c| c.vbe.index).unwrap_or(0xFFFF)
        })?;
        let core = self.self_ref.clone();
        bus.connect_io_port_write_word(VBE_DISPI_IOPORT_INDEX, owner, move |_, value| {
            with_core(&core, |c| c.vbe.index = value);
        })?;
        let core = self.self_ref.clone();
        bus.connect_io_port_read_word(VBE_DISPI_IOPORT_DATA, owner, move |_| {
            with_core(&core, |c| c.read_vbe_data()).unwrap_or(0xFFFF)
        })?;
        let core = self.self_ref.clone();
        bus.connect_io_port_write_word(VBE_DISPI_IOPORT_DATA, owner, move |_, value| {
            with_core(&core, |c| c.write_vbe_data(value));
        })?;

        let core = self.self_ref.clone();
        bus.connect_io_port_read_byte(VGA_SEQUENCER_INDEX, owner, move |_| {
            with_core(&core, |c| c.legacy.sequencer_index).unwrap_or(UNMAPPED_BYTE)
        })?;
        let core = self.self_ref.clone();
        bus.connect_io_port_write_byte(VGA_SEQUENCER_INDEX, owner, move |_, value| {
            with_core(&core, |c| c.legacy.sequencer_index = value);
        })?;
        let core = self.self_ref.clone();
        bus.connect_io_port_read_byte(VGA_SEQUENCER_DATA, owner, move |_| {
            with_core(&core, |c| c.read_sequencer()).unwrap_or(UNMAPPED_BYTE)
        })?;
        let core = self.self_ref.clone();
        bus.connect_io_port_write_byte(VGA_SEQUENCER_DATA, owner, move |_, value| {
            with_core(&core, |c| c.write_sequencer(value));
        })?;

        let core = self.self_ref.clone();
        bus.connect_io_port_read_byte(VGA_GRAPHICS_INDEX, owner, move |_| {
            with_core(&core, |c| c.legacy.graphics_index).unwrap_or(UNMAPPED_BYTE)
        })?;
        let core = self.self_ref.clone();
        bus.connect_io_port_write_byte(VGA_GRAPHICS_INDEX, owner, move |_, value| {
            with_core(&core, |c| c.legacy.graphics_index = value);
        })?;
        let core = self.self_ref.clone();
        bus.connect_io_port_read_byte(VGA_GRAPHICS_DATA, owner, move |_| {
            with_core(&core, |c| c.read_graphics()).unwrap_or(UNMAPPED_BYTE)
        })?;
        let core = self.self_ref.clone();
        bus.connect_io_port_write_byte(VGA_GRAPHICS_DATA, owner, move |_, value| {
            with_core(&core, |c| c.write_graphics(value));
        })?;

        let core = self.self_ref.clone();
        bus.connect_io_port_read_byte(VGA_DAC_READ_INDEX, owner, move |_| {
            with_core(&core, |c| c.legacy.dac_state).unwrap_or(UNMAPPED_BYTE)
        })?;
        let core = self.self_ref.clone();
        bus.connect_io_port_write_byte(VGA_DAC_READ_INDEX, owner, move |_, value| {
            with_core(&core, |c| {
                c.legacy.dac_read_index = value;
                c.legacy.dac_component = 0;
                c.legacy.dac_state = DAC_STATE_READ;
            });
        })?;
        let core = self.self_ref.clone();
        bus.connect_io_port_read_byte(VGA_DAC_WRITE_INDEX, owner, move |_| {
            with_core(&core, |c| c.legacy.dac_write_index).unwrap_or(UNMAPPED_BYTE)
        })?;
        let core = self.self_ref.clone();
        bus.connect_io_port_write_byte(VGA_DAC_WRITE_INDEX, owner, move |_, value| {
            with_core(&core, |c| {
                c.legacy.dac_write_index = value;
                c.legacy.dac_component = 0;
                c.legacy.dac_state = DAC_STATE_WRITE;
            });
        })?;
        let core = self.self_ref.clone();
        bus.connect_io_port_read_byte(VGA_DAC_DATA, owner, move |_| {
            with_core(&core, |c| c.read_dac_data()).unwrap_or(UNMAPPED_BYTE)
        })?;
        let core = self.self_ref.clone();
        bus.connect_io_port_write_byte(VGA_DAC_DATA, owner, move |_, value| {
            with_core(&core, |c| c.write_dac_data(value));
        })?;
        Ok(())
    }

    fn reset(&mut self) {
        self.vbe = VbeRegisters {
            id: self.vbe.id,
            xres: 640,
            yres: 480,
            bpp: 32,
            ..VbeRegisters::default()
        };
        self.legacy = LegacyRegisters::default();
        self.legacy.sequencer[SEQUENCER_MAP_MASK] = 0x0F;

        self.crtc_timing_changed();
        self.remap();
        self.update_framebuffer_format();
    }
}

/// Bochs VBE display adapter.
pub struct BochsVga {
    core: Rc<RefCell<VgaCore>>,
    bios_image: Option<PathBuf>,
    port_owner: Option<PortOwner>,
}

impl BochsVga {
    pub fn new(config: &BochsVgaConfig, display: Rc<RefCell<dyn Display>>) -> Self {
        let core = Rc::new_cyclic(|self_ref| {
            RefCell::new(VgaCore {
                self_ref: self_ref.clone(),
                bus: Weak::new(),
                display,
                vbe: VbeRegisters {
                    id: VBE_DISPI_ID5,
                    xres: 640,
                    yres: 480,
                    bpp: 32,
                    ..VbeRegisters::default()
                },
                legacy: LegacyRegisters::default(),
                palette: vec![0; 256],
                vram: Rc::new(MemoryBuffer::new(config.vram_size as usize)),
                bios: None,
                lfb_address: config.lfb_address,
                bar0_active: true,
                expansion_rom_active: true,
                lfb_region: None,
                window_region: None,
                bios_region: None,
            })
        });

        Self {
            core,
            bios_image: config.bios_image.clone(),
            port_owner: None,
        }
    }

    fn load_bios_rom(&self) -> Result<Option<Rc<MemoryBuffer>>, DeviceError> {
        let Some(path) = &self.bios_image else {
            return Ok(None);
        };
        let data = std::fs::read(path).map_err(|source| DeviceError::FirmwareUnreadable {
            path: path.clone(),
            source,
        })?;
        if data.len() > BIOS_ROM_SIZE as usize {
            log::error!(
                "[BochsVGA] VGA BIOS ROM {:?} too large (max {} bytes)",
                path,
                BIOS_ROM_SIZE
            );
            return Err(DeviceError::FirmwareTooLarge {
                path: path.clone(),
                size: data.len(),
                max: BIOS_ROM_SIZE as usize,
            });
        }

        let rom = MemoryBuffer::new(BIOS_ROM_SIZE as usize);
        rom.write_bytes(0, &data)
            .map_err(|e| DeviceError::FirmwareUnreadable {
                path: path.clone(),
                source: std::io::Error::other(e.to_string()),
            })?;
        log::info!("[BochsVGA] Loaded {} byte BIOS from {:?}", data.len(), path);
        Ok(Some(Rc::new(rom)))
    }

    /// Current DISPI register values.
    pub fn registers(&self) -> VbeRegisters {
        self.core.borrow().vbe
    }

    pub fn vram(&self) -> Rc<MemoryBuffer> {
        self.core.borrow().vram.clone()
    }

    /// Scanout parameters for the next frame, `None` when VBE is disabled or
    /// the visible area would run past the end of VRAM.
    pub fn latch_start_address(&self) -> Option<RenderLatch> {
        self.core.borrow().latch_start_address()
    }

    pub fn display_timing(&self) -> Option<DisplayTiming> {
        self.core.borrow().display_timing()
    }
}

impl Device for BochsVga {
    fn name(&self) -> &str {
        "BochsVGA"
    }

    fn initialize(&mut self, bus: &Rc<Bus>) -> Result<(), DeviceError> {
        let bios = self.load_bios_rom()?;
        let owner = bus.new_port_owner();

        let mut core = self.core.borrow_mut();
        core.bus = Rc::downgrade(bus);
        core.bios = bios;
        core.connect_io_ports(bus, owner)?;
        self.port_owner = Some(owner);

        core.update_bios_memory_mapping()?;
        core.update_vga_memory_mapping()?;
        log::info!(
            "[BochsVGA] {} KiB VRAM, LFB at {:#010x}",
            core.vram_size() / 1024,
            core.lfb_address
        );
        Ok(())
    }

    fn reset(&mut self) {
        self.core.borrow_mut().reset();
    }

    fn save_state(&self, writer: &mut StateWriter) -> Result<(), SnapshotError> {
        let core = self.core.borrow();
        let state = BochsVgaState {
            vbe: core.vbe,
            legacy: core.legacy,
            palette: core.palette.clone(),
            vram: core.vram.get_data(),
        };
        writer.write_section(TAG_BOCHS_VGA, &state)
    }

    fn load_state(&mut self, reader: &mut StateReader<'_>) -> Result<(), SnapshotError> {
        let state: BochsVgaState = reader.read_section(TAG_BOCHS_VGA)?;

        let mut core = self.core.borrow_mut();
        if state.palette.len() != core.palette.len() {
            return Err(SnapshotError::Invalid(format!(
                "palette has {} entries",
                state.palette.len()
            )));
        }
        if state.vram.len() != core.vram.size() {
            return Err(SnapshotError::Invalid(format!(
                "VRAM size mismatch: device={} bytes, snapshot={} bytes",
                core.vram.size(),
                state.vram.len()
            )));
        }
        if !is_valid_bpp(state.vbe.bpp) {
            return Err(SnapshotError::Invalid(format!("invalid bpp {}", state.vbe.bpp)));
        }

        core.vbe = state.vbe;
        core.legacy = state.legacy;
        core.legacy.dac_component %= 3;
        core.palette = state.palette;
        core.vram
            .set_data(&state.vram)
            .map_err(|e| SnapshotError::Invalid(e.to_string()))?;

        core.crtc_timing_changed();
        core.update_vga_memory_mapping()
            .map_err(|e| SnapshotError::Invalid(e.to_string()))?;
        core.update_framebuffer_format();
        Ok(())
    }

    fn on_region_activation_changed(&mut self, region: PciRegion, active: bool) {
        let mut core = self.core.borrow_mut();
        match region {
            PciRegion::Bar0 => {
                core.bar0_active = active;
                if core.is_lfb_enabled() {
                    core.remap();
                }
            }
            PciRegion::ExpansionRom => {
                core.expansion_rom_active = active;
                if let Err(e) = core.update_bios_memory_mapping() {
                    log::error!("[BochsVGA] Failed to update BIOS mapping: {}", e);
                }
            }
        }
    }

    fn render_frame(&mut self) -> bool {
        self.core.borrow_mut().render_frame()
    }
}

impl Drop for BochsVga {
    fn drop(&mut self) {
        let core = self.core.borrow();
        let Some(bus) = core.bus.upgrade() else { return };
        for id in [core.lfb_region, core.window_region, core.bios_region].into_iter().flatten() {
            bus.disconnect_memory(id);
        }
        if let Some(owner) = self.port_owner {
            bus.disconnect_io_ports(owner);
        }
    }
}
