pub mod bus;
pub mod config;
pub mod cpu;
pub mod device;
pub mod devices;
pub mod display;
pub mod error;
pub mod events;
pub mod host;
pub mod memory;
pub mod mmio;
pub mod snapshot;
pub mod sync;
pub mod system;
pub mod throttle;

pub use bus::Bus;
pub use config::SystemConfig;
pub use cpu::{Cpu, CpuBackendKind, ExecutionStats};
pub use device::Device;
pub use error::{BusError, DeviceError, SnapshotError, SystemError};
pub use host::{ExecutionState, HostCallbacks, HostHandle, HostInterface, SimulationStats};
pub use system::{Machine, SimulationTime};
