//! The emulated machine: bus, CPU and devices.
//!
//! A [`Machine`] is built, run and dropped on the simulation thread. It is not
//! `Send`: devices share state with the bus through `Rc`.

use crate::bus::Bus;
use crate::config::SystemConfig;
use crate::cpu::{Cpu, CpuBackendKind, ExecutionStats};
use crate::device::{Device, PciRegion};
use crate::devices::{BochsVga, SystemRam};
use crate::display::{DisplayTiming, MemoryDisplay};
use crate::error::{SnapshotError, SystemError};
use crate::snapshot::{StateReader, StateWriter, TAG_SYSTEM};
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::rc::Rc;

/// Simulated time in nanoseconds.
pub type SimulationTime = i64;

pub const NANOSECONDS_PER_SECOND: SimulationTime = 1_000_000_000;

#[derive(Debug, Serialize, Deserialize)]
struct SystemState {
    simulation_time: SimulationTime,
    next_frame_time: SimulationTime,
    cpu_frequency: f32,
    cycle_remainder: f64,
}

pub struct Machine {
    // Devices drop before the bus so they can release their regions.
    devices: Vec<Box<dyn Device>>,
    cpu: Box<dyn Cpu>,
    bus: Rc<Bus>,
    display: Option<Rc<RefCell<MemoryDisplay>>>,
    cpu_frequency: f32,
    simulation_time: SimulationTime,
    next_frame_time: SimulationTime,
    /// Fractional cycles carried between slices.
    cycle_remainder: f64,
}

impl Machine {
    /// Build and initialize a machine. The caller resets it before running.
    pub fn new(config: &mut SystemConfig) -> Result<Self, SystemError> {
        config.validate()?;

        let bus = Rc::new(Bus::new());
        let cpu = (config.take_cpu_factory())(config.cpu_backend);
        if cpu.backend() != config.cpu_backend {
            log::warn!(
                "[System] CPU backend {} unavailable, running {}",
                config.cpu_backend,
                cpu.backend()
            );
        }

        let mut devices: Vec<Box<dyn Device>> = vec![Box::new(SystemRam::new(config.memory_size))];
        let display = config.vga.as_ref().map(|vga| {
            let display = Rc::new(RefCell::new(MemoryDisplay::new()));
            devices.push(Box::new(BochsVga::new(vga, display.clone())));
            display
        });

        for device in &mut devices {
            log::debug!("[System] Initializing {}", device.name());
            device.initialize(&bus).map_err(|source| {
                log::error!("[System] {} failed to initialize: {}", device.name(), source);
                SystemError::DeviceInit {
                    device: device.name().to_string(),
                    source,
                }
            })?;
        }

        log::info!(
            "[System] Machine created: {} KiB RAM, {:.3} MHz, {} device(s)",
            config.memory_size / 1024,
            config.cpu_frequency / 1_000_000.0,
            devices.len()
        );

        Ok(Self {
            devices,
            cpu,
            bus,
            display,
            cpu_frequency: config.cpu_frequency,
            simulation_time: 0,
            next_frame_time: 0,
            cycle_remainder: 0.0,
        })
    }

    pub fn reset(&mut self) {
        log::info!("[System] Reset");
        self.cpu.reset();
        for device in &mut self.devices {
            device.reset();
        }
        self.next_frame_time = self.simulation_time;
        self.cycle_remainder = 0.0;
    }

    /// Run the CPU for `slice` nanoseconds of simulated time and render any
    /// frames that fall inside it. Returns the cycles executed.
    pub fn execute_slice(&mut self, slice: SimulationTime) -> u64 {
        let cycles = slice as f64 * self.cpu_frequency as f64 / NANOSECONDS_PER_SECOND as f64 + self.cycle_remainder;
        let whole = cycles.floor();
        self.cycle_remainder = cycles - whole;

        let executed = self.cpu.execute(&self.bus, whole as u64);
        self.simulation_time += slice;

        if self.simulation_time >= self.next_frame_time {
            for device in &mut self.devices {
                device.render_frame();
            }
            let interval = self.frame_interval();
            // Skip frames that fell entirely inside this slice.
            while self.next_frame_time <= self.simulation_time {
                self.next_frame_time += interval;
            }
        }
        executed
    }

    fn frame_interval(&self) -> SimulationTime {
        let timing = self
            .display
            .as_ref()
            .and_then(|d| d.borrow().timing())
            .unwrap_or(DisplayTiming::VGA_640X480);
        timing
            .frame_duration()
            .map(|d| d.as_nanos() as SimulationTime)
            .filter(|&ns| ns > 0)
            .unwrap_or(NANOSECONDS_PER_SECOND / 60)
    }

    /// Serialize the machine: system section, CPU, then devices in
    /// registration order.
    pub fn save_state(&self) -> Result<Vec<u8>, SnapshotError> {
        let mut writer = StateWriter::new();
        writer.write_section(
            TAG_SYSTEM,
            &SystemState {
                simulation_time: self.simulation_time,
                next_frame_time: self.next_frame_time,
                cpu_frequency: self.cpu_frequency,
                cycle_remainder: self.cycle_remainder,
            },
        )?;
        self.cpu.save_state(&mut writer)?;
        for device in &self.devices {
            device.save_state(&mut writer)?;
        }
        log::debug!(
            "[System] Saved {} sections, {} bytes",
            writer.section_count(),
            writer.len()
        );
        Ok(writer.into_bytes())
    }

    /// Restore from [`Machine::save_state`] output. On error the machine is
    /// left in an undefined state and must be reset.
    pub fn load_state(&mut self, data: &[u8]) -> Result<(), SnapshotError> {
        let mut reader = StateReader::new(data);

        let system: SystemState = reader.read_section(TAG_SYSTEM)?;
        if !system.cpu_frequency.is_finite() || system.cpu_frequency <= 0.0 {
            return Err(SnapshotError::Invalid(format!(
                "CPU frequency {}",
                system.cpu_frequency
            )));
        }
        self.simulation_time = system.simulation_time;
        self.next_frame_time = system.next_frame_time;
        self.cpu_frequency = system.cpu_frequency;
        self.cycle_remainder = system.cycle_remainder;

        self.cpu.load_state(&mut reader)?;
        for device in &mut self.devices {
            device.load_state(&mut reader)?;
        }

        if !reader.is_at_end() {
            return Err(SnapshotError::Invalid(format!(
                "{} trailing bytes after last section",
                reader.remaining()
            )));
        }
        Ok(())
    }

    pub fn bus(&self) -> &Rc<Bus> {
        &self.bus
    }

    pub fn cpu(&self) -> &dyn Cpu {
        self.cpu.as_ref()
    }

    pub fn cpu_mut(&mut self) -> &mut dyn Cpu {
        self.cpu.as_mut()
    }

    pub fn cpu_backend(&self) -> CpuBackendKind {
        self.cpu.backend()
    }

    pub fn cpu_stats(&self) -> ExecutionStats {
        self.cpu.stats()
    }

    pub fn cpu_frequency(&self) -> f32 {
        self.cpu_frequency
    }

    pub fn set_cpu_frequency(&mut self, frequency: f32) -> bool {
        if !frequency.is_finite() || frequency <= 0.0 {
            log::warn!("[System] Ignoring invalid CPU frequency {}", frequency);
            return false;
        }
        log::info!("[System] CPU frequency {:.3} MHz", frequency / 1_000_000.0);
        self.cpu_frequency = frequency;
        self.cycle_remainder = 0.0;
        true
    }

    pub fn simulation_time(&self) -> SimulationTime {
        self.simulation_time
    }

    /// Framebuffer of the display adapter, if one is configured.
    pub fn display(&self) -> Option<&Rc<RefCell<MemoryDisplay>>> {
        self.display.as_ref()
    }

    pub fn device_names(&self) -> Vec<&str> {
        self.devices.iter().map(|d| d.name()).collect()
    }

    /// Forward a PCI decode change to the named device. Returns false if no
    /// device has that name.
    pub fn set_pci_region_active(&mut self, device: &str, region: PciRegion, active: bool) -> bool {
        let Some(device) = self.devices.iter_mut().find(|d| d.name() == device) else {
            log::warn!("[System] No device named {}", device);
            return false;
        };
        log::debug!("[System] {} {:?} {}", device.name(), region, if active { "on" } else { "off" });
        device.on_region_activation_changed(region, active);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpu::ReferenceCpu;
    use crate::devices::bochs_vga::{VBE_DISPI_ENABLED, VBE_DISPI_INDEX_ENABLE, VBE_DISPI_IOPORT_DATA, VBE_DISPI_IOPORT_INDEX};

    fn small_config() -> SystemConfig {
        SystemConfig {
            memory_size: 2 * 1024 * 1024,
            cpu_frequency: 1_000_000.0,
            vga: Some(crate::devices::BochsVgaConfig {
                vram_size: 1024 * 1024,
                ..Default::default()
            }),
            ..SystemConfig::default()
        }
    }

    #[test]
    fn builds_ram_and_vga() {
        let machine = Machine::new(&mut small_config()).unwrap();
        assert_eq!(machine.device_names(), vec!["SystemRAM", "BochsVGA"]);
        assert!(machine.display().is_some());
        assert!(machine.bus().is_io_port_connected(VBE_DISPI_IOPORT_INDEX));
    }

    #[test]
    fn invalid_config_is_rejected() {
        let mut config = SystemConfig {
            cpu_frequency: -1.0,
            ..small_config()
        };
        assert!(matches!(Machine::new(&mut config), Err(SystemError::Config(_))));
    }

    #[test]
    fn slices_execute_cycles_at_cpu_frequency() {
        let mut machine = Machine::new(&mut small_config()).unwrap();
        machine.reset();

        // 1MHz for 10ms.
        assert_eq!(machine.execute_slice(10_000_000), 10_000);
        assert_eq!(machine.simulation_time(), 10_000_000);

        // Fractional cycles carry over.
        machine.set_cpu_frequency(1_500.0);
        let total: u64 = (0..4).map(|_| machine.execute_slice(1_000_000)).sum();
        assert_eq!(total, 6);
        assert!(!machine.set_cpu_frequency(0.0));
        assert_eq!(machine.cpu_frequency(), 1_500.0);
    }

    #[test]
    fn frames_are_rendered_while_vbe_enabled() {
        let mut machine = Machine::new(&mut small_config()).unwrap();
        machine.reset();
        let bus = machine.bus().clone();
        bus.write_io_port_word(VBE_DISPI_IOPORT_INDEX, crate::devices::bochs_vga::VBE_DISPI_INDEX_XRES);
        bus.write_io_port_word(VBE_DISPI_IOPORT_DATA, 320);
        bus.write_io_port_word(VBE_DISPI_IOPORT_INDEX, crate::devices::bochs_vga::VBE_DISPI_INDEX_YRES);
        bus.write_io_port_word(VBE_DISPI_IOPORT_DATA, 200);
        bus.write_io_port_word(VBE_DISPI_IOPORT_INDEX, VBE_DISPI_INDEX_ENABLE);
        bus.write_io_port_word(VBE_DISPI_IOPORT_DATA, VBE_DISPI_ENABLED);

        // 100ms of simulated time at ~60Hz.
        for _ in 0..10 {
            machine.execute_slice(10_000_000);
        }
        let display = machine.display().unwrap().borrow();
        assert!((5..=7).contains(&display.frames_presented()), "{}", display.frames_presented());
        assert_eq!((display.width(), display.height()), (320, 200));
    }

    #[test]
    fn state_round_trip() {
        let mut machine = Machine::new(&mut small_config()).unwrap();
        machine.reset();
        machine.bus().write_memory_dword(0x1000, 0xFEED_FACE);
        machine.execute_slice(5_000_000);
        let saved = machine.save_state().unwrap();
        let time = machine.simulation_time();

        machine.bus().write_memory_dword(0x1000, 0);
        machine.execute_slice(5_000_000);
        machine.load_state(&saved).unwrap();

        assert_eq!(machine.simulation_time(), time);
        assert_eq!(machine.bus().read_memory_dword(0x1000), 0xFEED_FACE);
    }

    #[test]
    fn load_rejects_mismatched_stream() {
        let mut machine = Machine::new(&mut small_config()).unwrap();
        machine.reset();

        // A machine without video produces a shorter stream.
        let mut headless = Machine::new(&mut SystemConfig {
            vga: None,
            ..small_config()
        })
        .unwrap();
        headless.reset();
        let saved = headless.save_state().unwrap();
        assert!(matches!(machine.load_state(&saved), Err(SnapshotError::Truncated(_))));

        let mut padded = machine.save_state().unwrap();
        padded.push(0);
        assert!(matches!(machine.load_state(&padded), Err(SnapshotError::Invalid(_))));
    }

    #[test]
    fn pci_decode_changes_reach_the_device() {
        let mut machine = Machine::new(&mut small_config()).unwrap();
        machine.reset();
        let bus = machine.bus().clone();
        bus.write_io_port_word(VBE_DISPI_IOPORT_INDEX, VBE_DISPI_INDEX_ENABLE);
        bus.write_io_port_word(
            VBE_DISPI_IOPORT_DATA,
            VBE_DISPI_ENABLED | crate::devices::bochs_vga::VBE_DISPI_LFB_ENABLED,
        );
        let lfb = crate::devices::bochs_vga::VBE_DISPI_DEFAULT_LFB_PHYSICAL_ADDRESS;

        bus.write_memory_byte(lfb, 0x5A);
        assert_eq!(bus.read_memory_byte(lfb), 0x5A);

        assert!(machine.set_pci_region_active("BochsVGA", PciRegion::Bar0, false));
        assert_eq!(bus.read_memory_byte(lfb), 0xFF);
        assert!(!machine.set_pci_region_active("NoSuchDevice", PciRegion::Bar0, true));
    }

    #[test]
    fn custom_cpu_factory_is_used() {
        let mut config = small_config().with_cpu_factory(|_| {
            let mut cpu = ReferenceCpu::new(CpuBackendKind::Interpreter);
            cpu.set_pc(0x1234);
            Box::new(cpu)
        });
        let machine = Machine::new(&mut config).unwrap();
        assert_eq!(machine.cpu_backend(), CpuBackendKind::Interpreter);
        assert_eq!(machine.cpu_stats(), ExecutionStats::default());
    }
}
