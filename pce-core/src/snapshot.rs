//! Sectioned snapshot stream.
//!
//! A snapshot is the concatenation of component sections, written and read in
//! the same order. There is no global header. Each section is
//!
//! ```text
//! tag: u32 LE | len: u32 LE | payload: [u8; len]
//! ```
//!
//! where the payload is the bincode encoding of the component's state struct.
//! The tag is checked before the payload is decoded, so a component never
//! sees another component's bytes.

use crate::error::{SnapshotError, tag_name};
use serde::Serialize;
use serde::de::DeserializeOwned;

/// Build a section tag from four ASCII characters.
pub const fn fourcc(tag: &[u8; 4]) -> u32 {
    u32::from_le_bytes(*tag)
}

pub const TAG_SYSTEM: u32 = fourcc(b"SYST");
pub const TAG_CPU: u32 = fourcc(b"CPU0");
pub const TAG_RAM: u32 = fourcc(b"SRAM");
pub const TAG_BOCHS_VGA: u32 = fourcc(b"BVGA");

const SECTION_HEADER_LEN: usize = 8;

/// Appends sections to an in-memory stream.
#[derive(Debug, Default)]
pub struct StateWriter {
    buf: Vec<u8>,
    sections: usize,
}

impl StateWriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Encode `state` as one section tagged `tag`.
    pub fn write_section<T: Serialize>(&mut self, tag: u32, state: &T) -> Result<(), SnapshotError> {
        let payload = bincode::serialize(state)?;
        let len = u32::try_from(payload.len()).map_err(|_| {
            SnapshotError::Invalid(format!(
                "section {} is too large ({} bytes)",
                tag_name(tag),
                payload.len()
            ))
        })?;

        self.buf.reserve(SECTION_HEADER_LEN + payload.len());
        self.buf.extend_from_slice(&tag.to_le_bytes());
        self.buf.extend_from_slice(&len.to_le_bytes());
        self.buf.extend_from_slice(&payload);
        self.sections += 1;

        log::trace!("[Snapshot] Wrote section {} ({} bytes)", tag_name(tag), len);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn section_count(&self) -> usize {
        self.sections
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }
}

/// Reads sections back in the order they were written.
#[derive(Debug)]
pub struct StateReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> StateReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    /// Tag of the next section without consuming it.
    pub fn peek_tag(&self) -> Option<u32> {
        let bytes = self.data.get(self.pos..self.pos + 4)?;
        Some(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    /// Decode the next section, which must carry `tag`.
    ///
    /// On a tag mismatch nothing is consumed.
    pub fn read_section<T: DeserializeOwned>(&mut self, tag: u32) -> Result<T, SnapshotError> {
        let found = self
            .peek_tag()
            .ok_or_else(|| SnapshotError::Truncated(tag_name(tag)))?;
        if found != tag {
            return Err(SnapshotError::TagMismatch {
                expected: tag_name(tag),
                found: tag_name(found),
            });
        }

        let len_bytes = self
            .data
            .get(self.pos + 4..self.pos + SECTION_HEADER_LEN)
            .ok_or_else(|| SnapshotError::Truncated(tag_name(tag)))?;
        let len = u32::from_le_bytes([len_bytes[0], len_bytes[1], len_bytes[2], len_bytes[3]]) as usize;

        let payload_start = self.pos + SECTION_HEADER_LEN;
        let payload = payload_start
            .checked_add(len)
            .and_then(|end| self.data.get(payload_start..end))
            .ok_or_else(|| SnapshotError::Truncated(tag_name(tag)))?;

        let state = bincode::deserialize(payload)?;
        self.pos = payload_start + len;
        log::trace!("[Snapshot] Read section {} ({} bytes)", tag_name(tag), len);
        Ok(state)
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub fn is_at_end(&self) -> bool {
        self.pos >= self.data.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Regs {
        a: u32,
        b: Vec<u16>,
    }

    #[test]
    fn sections_read_back_in_order() {
        let mut w = StateWriter::new();
        w.write_section(TAG_SYSTEM, &42u64).unwrap();
        w.write_section(TAG_BOCHS_VGA, &Regs { a: 7, b: vec![1, 2] }).unwrap();
        assert_eq!(w.section_count(), 2);
        let bytes = w.into_bytes();
        assert_eq!(&bytes[0..4], b"SYST");

        let mut r = StateReader::new(&bytes);
        assert_eq!(r.read_section::<u64>(TAG_SYSTEM).unwrap(), 42);
        assert_eq!(
            r.read_section::<Regs>(TAG_BOCHS_VGA).unwrap(),
            Regs { a: 7, b: vec![1, 2] }
        );
        assert!(r.is_at_end());
    }

    #[test]
    fn tag_mismatch_consumes_nothing() {
        let mut w = StateWriter::new();
        w.write_section(TAG_RAM, &1u8).unwrap();
        let bytes = w.into_bytes();

        let mut r = StateReader::new(&bytes);
        let err = r.read_section::<u8>(TAG_BOCHS_VGA).unwrap_err();
        assert!(matches!(
            err,
            SnapshotError::TagMismatch { ref expected, ref found } if expected == "BVGA" && found == "SRAM"
        ));
        assert_eq!(r.remaining(), bytes.len());
        assert_eq!(r.read_section::<u8>(TAG_RAM).unwrap(), 1);
    }

    #[test]
    fn truncated_stream_is_rejected() {
        let mut w = StateWriter::new();
        w.write_section(TAG_CPU, &vec![0u8; 32]).unwrap();
        let bytes = w.into_bytes();

        let mut r = StateReader::new(&bytes[..bytes.len() - 1]);
        assert!(matches!(
            r.read_section::<Vec<u8>>(TAG_CPU),
            Err(SnapshotError::Truncated(_))
        ));
        let mut empty = StateReader::new(&[]);
        assert!(matches!(
            empty.read_section::<u8>(TAG_CPU),
            Err(SnapshotError::Truncated(_))
        ));
    }
}
