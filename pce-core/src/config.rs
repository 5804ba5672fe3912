use crate::cpu::{Cpu, CpuBackendKind, ReferenceCpu};
use crate::devices::bochs_vga::BochsVgaConfig;
use crate::error::SystemError;
use serde::Deserialize;
use std::fmt;

pub const DEFAULT_MEMORY_SIZE: u32 = 16 * 1024 * 1024;
pub const DEFAULT_CPU_FREQUENCY: f32 = 8_000_000.0;

pub const MIN_MEMORY_SIZE: u32 = 640 * 1024;
pub const MAX_MEMORY_SIZE: u32 = 3 * 1024 * 1024 * 1024;

const VRAM_GRANULARITY: u32 = 64 * 1024;
const MIN_VRAM_SIZE: u32 = 256 * 1024;

/// Builds the CPU on the simulation thread.
pub type CpuFactory = Box<dyn FnOnce(CpuBackendKind) -> Box<dyn Cpu> + Send>;

/// Machine description handed to [`crate::host::HostInterface::create_system`].
#[derive(Deserialize)]
#[serde(default)]
pub struct SystemConfig {
    /// Total system RAM in bytes.
    pub memory_size: u32,
    /// Emulated CPU clock in Hz.
    pub cpu_frequency: f32,
    pub cpu_backend: CpuBackendKind,
    pub speed_limiter: bool,
    /// Display adapter; `None` runs without video.
    pub vga: Option<BochsVgaConfig>,
    /// CPU implementation. Defaults to [`ReferenceCpu`].
    #[serde(skip)]
    pub cpu_factory: Option<CpuFactory>,
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            memory_size: DEFAULT_MEMORY_SIZE,
            cpu_frequency: DEFAULT_CPU_FREQUENCY,
            cpu_backend: CpuBackendKind::Interpreter,
            speed_limiter: true,
            vga: Some(BochsVgaConfig::default()),
            cpu_factory: None,
        }
    }
}

impl fmt::Debug for SystemConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SystemConfig")
            .field("memory_size", &self.memory_size)
            .field("cpu_frequency", &self.cpu_frequency)
            .field("cpu_backend", &self.cpu_backend)
            .field("speed_limiter", &self.speed_limiter)
            .field("vga", &self.vga)
            .field("cpu_factory", &self.cpu_factory.as_ref().map(|_| "custom"))
            .finish()
    }
}

impl SystemConfig {
    pub fn with_cpu_factory<F>(mut self, factory: F) -> Self
    where
        F: FnOnce(CpuBackendKind) -> Box<dyn Cpu> + Send + 'static,
    {
        self.cpu_factory = Some(Box::new(factory));
        self
    }

    /// Check the configuration before anything is built.
    pub fn validate(&self) -> Result<(), SystemError> {
        if !self.cpu_frequency.is_finite() || self.cpu_frequency <= 0.0 {
            return Err(SystemError::Config(format!(
                "CPU frequency must be positive, got {}",
                self.cpu_frequency
            )));
        }
        if !(MIN_MEMORY_SIZE..=MAX_MEMORY_SIZE).contains(&self.memory_size) {
            return Err(SystemError::Config(format!(
                "memory size {} KiB outside {}..={} KiB",
                self.memory_size / 1024,
                MIN_MEMORY_SIZE / 1024,
                MAX_MEMORY_SIZE / 1024
            )));
        }

        if let Some(vga) = &self.vga {
            if vga.vram_size < MIN_VRAM_SIZE || vga.vram_size % VRAM_GRANULARITY != 0 {
                return Err(SystemError::Config(format!(
                    "VRAM size {:#x} must be a multiple of 64 KiB and at least 256 KiB",
                    vga.vram_size
                )));
            }
            let lfb_end = vga.lfb_address as u64 + vga.vram_size as u64;
            if (vga.lfb_address as u64) < self.memory_size as u64 || lfb_end > 1u64 << 32 {
                return Err(SystemError::Config(format!(
                    "LFB window {:#010x}+{:#x} overlaps RAM or leaves the address space",
                    vga.lfb_address, vga.vram_size
                )));
            }
        }
        Ok(())
    }

    /// Take the CPU factory, falling back to the reference CPU.
    pub(crate) fn take_cpu_factory(&mut self) -> CpuFactory {
        self.cpu_factory
            .take()
            .unwrap_or_else(|| {
                Box::new(|backend: CpuBackendKind| Box::new(ReferenceCpu::new(backend)) as Box<dyn Cpu>)
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        SystemConfig::default().validate().unwrap();
    }

    #[test]
    fn rejects_bad_frequency_and_memory() {
        let config = SystemConfig {
            cpu_frequency: 0.0,
            ..SystemConfig::default()
        };
        assert!(matches!(config.validate(), Err(SystemError::Config(_))));

        let config = SystemConfig {
            cpu_frequency: f32::NAN,
            ..SystemConfig::default()
        };
        assert!(config.validate().is_err());

        let config = SystemConfig {
            memory_size: 512 * 1024,
            ..SystemConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_bad_vram() {
        for vram_size in [128 * 1024, 300 * 1024] {
            let config = SystemConfig {
                vga: Some(BochsVgaConfig {
                    vram_size,
                    ..BochsVgaConfig::default()
                }),
                ..SystemConfig::default()
            };
            assert!(config.validate().is_err(), "vram {:#x}", vram_size);
        }

        let config = SystemConfig {
            vga: Some(BochsVgaConfig {
                lfb_address: 0x0080_0000,
                ..BochsVgaConfig::default()
            }),
            ..SystemConfig::default()
        };
        assert!(config.validate().is_err());

        let config = SystemConfig {
            vga: None,
            ..SystemConfig::default()
        };
        config.validate().unwrap();
    }

    #[test]
    fn default_factory_builds_reference_cpu() {
        let mut config = SystemConfig {
            cpu_backend: CpuBackendKind::CachedInterpreter,
            ..SystemConfig::default()
        };
        let backend = config.cpu_backend;
        let cpu = (config.take_cpu_factory())(backend);
        assert_eq!(cpu.backend(), CpuBackendKind::CachedInterpreter);
        assert!(config.cpu_factory.is_none());
    }
}
