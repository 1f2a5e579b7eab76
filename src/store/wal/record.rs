//! Checksummed record framing shared by logs, tables and the manifest.
//!
//! ```text
//! +-----------+-----------------+-----------+
//! |len: u32   | payload         |crc32: u32 |
//! +-----------+-----------------+-----------+
//! ```
//!
//! The CRC covers the payload only.

use byteorder::{BigEndian, ByteOrder};
use crc::{Crc, CRC_32_ISCSI};

use crate::error::Result;
use crate::Error;

pub const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

/// Bytes of framing around each payload.
pub const RECORD_OVERHEAD: usize = 8;

/// Fails without touching `out` when the payload is too long to frame.
pub fn encode_record(payload: &[u8], out: &mut Vec<u8>) -> Result<()> {
    let len = record_len(payload.len())?;
    let mut word = [0u8; 4];
    BigEndian::write_u32(&mut word, len);
    out.extend_from_slice(&word);
    out.extend_from_slice(payload);
    BigEndian::write_u32(&mut word, CRC32.checksum(payload));
    out.extend_from_slice(&word);
    Ok(())
}

fn record_len(len: usize) -> Result<u32> {
    u32::try_from(len).map_err(|_| {
        Error::InvalidArgument(format!(
            "record of {} bytes exceeds the {} byte limit",
            len,
            u32::MAX
        ))
    })
}

/// Iterates framed records in a byte slice.
///
/// A short or corrupt record yields one error and ends the iteration; callers
/// decide whether that is a torn tail or real corruption.
pub struct RecordReader<'a> {
    data: &'a [u8],
    offset: usize,
    failed: bool,
}

impl<'a> RecordReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            offset: 0,
            failed: false,
        }
    }

    /// Offset just past the last record returned successfully.
    pub fn offset(&self) -> usize {
        self.offset
    }

    fn read(&mut self) -> Result<&'a [u8]> {
        let rest = &self.data[self.offset..];
        if rest.len() < 4 {
            return Err(Error::InvalidData("truncated record length".to_string()));
        }
        let len = BigEndian::read_u32(&rest[..4]) as usize;
        if rest.len() < 4 + len + 4 {
            return Err(Error::InvalidData(format!(
                "truncated record: need {} bytes, have {}",
                len + RECORD_OVERHEAD,
                rest.len()
            )));
        }
        let payload = &rest[4..4 + len];
        let stored = BigEndian::read_u32(&rest[4 + len..8 + len]);
        if CRC32.checksum(payload) != stored {
            return Err(Error::ChecksumMismatch);
        }
        self.offset += len + RECORD_OVERHEAD;
        Ok(payload)
    }
}

impl<'a> Iterator for RecordReader<'a> {
    type Item = Result<&'a [u8]>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.offset >= self.data.len() {
            return None;
        }
        let record = self.read();
        self.failed = record.is_err();
        Some(record)
    }
}
