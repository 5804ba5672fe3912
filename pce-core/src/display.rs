//! Display sink used by video devices.
//!
//! A video device renders into a [`Display`] once per frame. The display owns
//! the host-side framebuffer; presenting it (window, texture upload, file) is
//! up to the implementation.

use std::time::Duration;

/// Pixel layout of the framebuffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FramebufferFormat {
    /// 8-bit palette index, palette entries are RGBX8.
    C8RGBX8,
    RGBX8,
    BGR555,
    BGR565,
    BGR8,
    BGRX8,
}

impl FramebufferFormat {
    pub const fn bytes_per_pixel(self) -> u32 {
        match self {
            FramebufferFormat::C8RGBX8 => 1,
            FramebufferFormat::BGR555 | FramebufferFormat::BGR565 => 2,
            FramebufferFormat::BGR8 => 3,
            FramebufferFormat::RGBX8 | FramebufferFormat::BGRX8 => 4,
        }
    }

    pub const fn is_paletted(self) -> bool {
        matches!(self, FramebufferFormat::C8RGBX8)
    }
}

/// CRT timing of the current mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DisplayTiming {
    pub pixel_clock: u64,
    pub horizontal_visible: u32,
    pub horizontal_sync_start: u32,
    pub horizontal_sync_length: u32,
    pub horizontal_total: u32,
    pub vertical_visible: u32,
    pub vertical_sync_start: u32,
    pub vertical_sync_length: u32,
    pub vertical_total: u32,
}

impl DisplayTiming {
    /// Standard VGA 640x480 at ~60Hz.
    pub const VGA_640X480: DisplayTiming = DisplayTiming {
        pixel_clock: 25_175_000,
        horizontal_visible: 640,
        horizontal_sync_start: 640 + 16,
        horizontal_sync_length: 96,
        horizontal_total: 800,
        vertical_visible: 480,
        vertical_sync_start: 480 + 10,
        vertical_sync_length: 2,
        vertical_total: 525,
    };

    pub fn is_valid(&self) -> bool {
        self.pixel_clock > 0 && self.horizontal_total > 0 && self.vertical_total > 0
    }

    pub fn horizontal_frequency(&self) -> f64 {
        if self.horizontal_total == 0 {
            return 0.0;
        }
        self.pixel_clock as f64 / self.horizontal_total as f64
    }

    pub fn vertical_frequency(&self) -> f64 {
        if self.vertical_total == 0 {
            return 0.0;
        }
        self.horizontal_frequency() / self.vertical_total as f64
    }

    /// Duration of one frame, `None` for an invalid timing.
    pub fn frame_duration(&self) -> Option<Duration> {
        if !self.is_valid() {
            return None;
        }
        let pixels = self.horizontal_total as u128 * self.vertical_total as u128;
        let nanos = pixels * 1_000_000_000 / self.pixel_clock as u128;
        Some(Duration::from_nanos(nanos as u64))
    }
}

/// Framebuffer sink.
pub trait Display {
    fn change_framebuffer_format(&mut self, format: FramebufferFormat);
    fn change_display_timing(&mut self, timing: &DisplayTiming);
    fn resize_framebuffer(&mut self, width: u32, height: u32);

    /// Replace palette entries starting at `start_index` (RGBX8, R in the low byte).
    fn copy_palette(&mut self, start_index: u8, entries: &[u32]);

    /// Copy one frame of pixels in the current format. `src_pitch` is the
    /// distance between rows in `src`; rows that `src` does not fully cover
    /// are copied partially.
    fn copy_to_framebuffer(&mut self, src: &[u8], src_pitch: u32);

    /// Raw framebuffer and its row stride, for devices that build pixels
    /// themselves.
    fn framebuffer_mut(&mut self) -> (&mut [u8], u32);

    /// A frame is complete.
    fn present(&mut self);
}

/// In-memory display for headless runs and tests.
#[derive(Debug)]
pub struct MemoryDisplay {
    format: FramebufferFormat,
    width: u32,
    height: u32,
    stride: u32,
    pixels: Vec<u8>,
    palette: Vec<u32>,
    timing: Option<DisplayTiming>,
    frames_presented: u64,
}

impl MemoryDisplay {
    pub fn new() -> Self {
        Self {
            format: FramebufferFormat::C8RGBX8,
            width: 0,
            height: 0,
            stride: 0,
            pixels: Vec::new(),
            palette: vec![0; 256],
            timing: None,
            frames_presented: 0,
        }
    }

    fn reallocate(&mut self) {
        self.stride = self.width * self.format.bytes_per_pixel();
        self.pixels = vec![0; self.stride as usize * self.height as usize];
    }

    pub fn format(&self) -> FramebufferFormat {
        self.format
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn stride(&self) -> u32 {
        self.stride
    }

    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    pub fn palette(&self) -> &[u32] {
        &self.palette
    }

    pub fn timing(&self) -> Option<DisplayTiming> {
        self.timing
    }

    pub fn frames_presented(&self) -> u64 {
        self.frames_presented
    }

    /// Pixel at (x, y) converted to 0x00RRGGBB.
    pub fn pixel_rgb(&self, x: u32, y: u32) -> Option<u32> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let bpp = self.format.bytes_per_pixel() as usize;
        let at = y as usize * self.stride as usize + x as usize * bpp;
        let px = self.pixels.get(at..at + bpp)?;
        let rgb = match self.format {
            FramebufferFormat::C8RGBX8 => {
                let e = self.palette[px[0] as usize];
                ((e & 0xFF) << 16) | (e & 0xFF00) | ((e >> 16) & 0xFF)
            }
            FramebufferFormat::RGBX8 => ((px[0] as u32) << 16) | ((px[1] as u32) << 8) | px[2] as u32,
            FramebufferFormat::BGR8 | FramebufferFormat::BGRX8 => {
                ((px[2] as u32) << 16) | ((px[1] as u32) << 8) | px[0] as u32
            }
            FramebufferFormat::BGR565 => {
                let v = u16::from_le_bytes([px[0], px[1]]) as u32;
                let r = (v >> 11) & 0x1F;
                let g = (v >> 5) & 0x3F;
                let b = v & 0x1F;
                ((r << 3 | r >> 2) << 16) | ((g << 2 | g >> 4) << 8) | (b << 3 | b >> 2)
            }
            FramebufferFormat::BGR555 => {
                let v = u16::from_le_bytes([px[0], px[1]]) as u32;
                let r = (v >> 10) & 0x1F;
                let g = (v >> 5) & 0x1F;
                let b = v & 0x1F;
                ((r << 3 | r >> 2) << 16) | ((g << 3 | g >> 2) << 8) | (b << 3 | b >> 2)
            }
        };
        Some(rgb)
    }
}

impl Default for MemoryDisplay {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for MemoryDisplay {
    fn change_framebuffer_format(&mut self, format: FramebufferFormat) {
        if self.format == format {
            return;
        }
        log::debug!("[Display] Framebuffer format {:?}", format);
        self.format = format;
        self.reallocate();
    }

    fn change_display_timing(&mut self, timing: &DisplayTiming) {
        log::debug!(
            "[Display] Timing {}x{} @ {:.2}Hz",
            timing.horizontal_visible,
            timing.vertical_visible,
            timing.vertical_frequency()
        );
        self.timing = Some(*timing);
    }

    fn resize_framebuffer(&mut self, width: u32, height: u32) {
        if self.width == width && self.height == height {
            return;
        }
        log::debug!("[Display] Resize {}x{}", width, height);
        self.width = width;
        self.height = height;
        self.reallocate();
    }

    fn copy_palette(&mut self, start_index: u8, entries: &[u32]) {
        let start = start_index as usize;
        let count = entries.len().min(self.palette.len() - start);
        self.palette[start..start + count].copy_from_slice(&entries[..count]);
    }

    fn copy_to_framebuffer(&mut self, src: &[u8], src_pitch: u32) {
        let row_bytes = self.stride as usize;
        let src_pitch = src_pitch as usize;
        for row in 0..self.height as usize {
            let src_start = row * src_pitch;
            if src_start >= src.len() {
                break;
            }
            let len = row_bytes.min(src.len() - src_start);
            let dst_start = row * row_bytes;
            self.pixels[dst_start..dst_start + len].copy_from_slice(&src[src_start..src_start + len]);
        }
    }

    fn framebuffer_mut(&mut self) -> (&mut [u8], u32) {
        (&mut self.pixels, self.stride)
    }

    fn present(&mut self) {
        self.frames_presented += 1;
    }
}
