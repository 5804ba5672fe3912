use std::path::PathBuf;
use thiserror::Error;

/// Address space registration errors.
///
/// These are precondition violations by device code: a device must disconnect
/// whatever it previously claimed before claiming the range again.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum BusError {
    #[error("Region {start:#010x}+{size:#x} overlaps region {existing_start:#010x}+{existing_size:#x}")]
    Overlap {
        start: u32,
        size: u32,
        existing_start: u32,
        existing_size: u32,
    },

    #[error("Region {start:#010x}+{size:#x} is empty or wraps the address space")]
    InvalidRange { start: u32, size: u32 },

    #[error("Region {start:#010x} is larger than its backing buffer ({buffer_size:#x} bytes)")]
    BufferTooSmall { start: u32, buffer_size: usize },

    #[error("I/O port {port:#06x} is already owned by another device")]
    PortInUse { port: u16 },
}

/// Device construction / initialization errors.
#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("Failed to read firmware image {path:?}: {source}")]
    FirmwareUnreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Firmware image {path:?} is {size} bytes, at most {max} allowed")]
    FirmwareTooLarge { path: PathBuf, size: usize, max: usize },

    #[error("Bus registration failed: {0}")]
    Bus(#[from] BusError),
}

/// Snapshot stream errors. Any of these leaves the machine in an undefined
/// state: the caller must reset it before running again.
#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Section tag mismatch: expected {expected}, found {found}")]
    TagMismatch { expected: String, found: String },

    #[error("Snapshot stream truncated in section {0}")]
    Truncated(String),

    #[error("Failed to decode section: {0}")]
    Decode(#[from] bincode::Error),

    #[error("Invalid state: {0}")]
    Invalid(String),

    #[error("Memory digest mismatch in section {0}")]
    DigestMismatch(String),
}

/// Errors returned by the host-facing lifecycle API.
#[derive(Debug, Error)]
pub enum SystemError {
    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Failed to initialize device {device}: {source}")]
    DeviceInit {
        device: String,
        #[source]
        source: DeviceError,
    },

    #[error("A system has already been created")]
    AlreadyCreated,

    #[error("No system is running")]
    NotRunning,

    #[error("Failed to spawn simulation thread: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("Snapshot failed: {0}")]
    Snapshot(#[from] SnapshotError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Render a fourcc section tag for messages.
pub(crate) fn tag_name(tag: u32) -> String {
    tag.to_le_bytes()
        .iter()
        .map(|&b| if b.is_ascii_graphic() { b as char } else { '?' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tag_names_are_printable() {
        assert_eq!(tag_name(u32::from_le_bytes(*b"BVGA")), "BVGA");
        assert_eq!(tag_name(0x0000_4142), "BA??");
    }

    #[test]
    fn device_error_wraps_bus_error() {
        let err: DeviceError = BusError::PortInUse { port: 0x1CE }.into();
        assert!(err.to_string().contains("0x01ce"));
    }
}
