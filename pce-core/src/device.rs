use crate::bus::Bus;
use crate::error::{DeviceError, SnapshotError};
use crate::snapshot::{StateReader, StateWriter};
use std::rc::Rc;

/// Address space windows a PCI function can decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PciRegion {
    Bar0,
    ExpansionRom,
}

/// A peripheral attached to the machine.
///
/// Devices live on the simulation thread. `initialize` is where a device
/// claims its address ranges and ports; handlers it registers may reconnect
/// the device's own regions later (mode switches, bank changes).
pub trait Device {
    fn name(&self) -> &str;

    /// Claim address space and load firmware. Called once, before the first
    /// reset.
    fn initialize(&mut self, bus: &Rc<Bus>) -> Result<(), DeviceError>;

    /// Return to power-on state. Mappings are refreshed to match.
    fn reset(&mut self);

    /// Append this device's section to the stream.
    fn save_state(&self, writer: &mut StateWriter) -> Result<(), SnapshotError>;

    /// Restore from the next section of the stream. The whole section is
    /// decoded and validated before any state changes.
    fn load_state(&mut self, reader: &mut StateReader<'_>) -> Result<(), SnapshotError>;

    /// The PCI decode state of one of the device's windows changed.
    fn on_region_activation_changed(&mut self, _region: PciRegion, _active: bool) {}

    /// Render one frame into the device's display. Returns `false` if there
    /// was nothing to render.
    fn render_frame(&mut self) -> bool {
        false
    }
}
