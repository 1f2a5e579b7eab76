//! Write batches.
//!
//! A batch is stored in its encoded form so it can be appended to the log
//! without re-encoding:
//!
//! ```text
//! +-----------+-----------+-----------------------------+
//! | seq: u64  | count: u32| op 1 | op 2 | ... | op n    |
//! +-----------+-----------+-----------------------------+
//! ```
//!
//! Each op is `tag:u8 | key_len:u32 | key`, followed by `val_len:u32 | value`
//! for puts. All integers are big-endian. The sequence field is stamped when the
//! batch is admitted; op `i` is assigned `seq + i`.

use byteorder::{BigEndian, ByteOrder};

use crate::error::Result;
use crate::Error;

pub type SequenceNumber = u64;

pub const BATCH_HEADER_SIZE: usize = 12;

/// Largest encoded batch that still fits one log record, and whose length
/// prefixes cannot have wrapped.
pub const MAX_BATCH_SIZE: usize = u32::MAX as usize;

const TAG_PUT: u8 = 1;
const TAG_DELETE: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchOp<'a> {
    Put { key: &'a [u8], value: &'a [u8] },
    Delete { key: &'a [u8] },
}

impl<'a> BatchOp<'a> {
    pub fn key(&self) -> &'a [u8] {
        match self {
            BatchOp::Put { key, .. } | BatchOp::Delete { key } => key,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteBatch {
    rep: Vec<u8>,
}

impl Default for WriteBatch {
    fn default() -> Self {
        Self::new()
    }
}

impl WriteBatch {
    pub fn new() -> Self {
        Self {
            rep: vec![0u8; BATCH_HEADER_SIZE],
        }
    }

    /// Decodes a batch read back from the log, validating every op.
    pub fn from_bytes(rep: Vec<u8>) -> Result<Self> {
        if rep.len() < BATCH_HEADER_SIZE {
            return Err(Error::InvalidData(format!(
                "batch too short: {} bytes",
                rep.len()
            )));
        }
        let batch = Self { rep };
        let mut seen = 0u32;
        for op in batch.iter() {
            op?;
            seen += 1;
        }
        if seen != batch.count() {
            return Err(Error::InvalidData(format!(
                "batch count mismatch: header says {}, found {}",
                batch.count(),
                seen
            )));
        }
        Ok(batch)
    }

    /// Wraps raw bytes without validating them.
    #[cfg(test)]
    pub(crate) fn from_raw(rep: Vec<u8>) -> Self {
        Self { rep }
    }

    /// Rejects a batch too large to be logged.
    pub(crate) fn check_size(size: usize) -> Result<()> {
        if size > MAX_BATCH_SIZE {
            return Err(Error::InvalidArgument(format!(
                "batch of {} bytes exceeds the {} byte limit",
                size, MAX_BATCH_SIZE
            )));
        }
        Ok(())
    }

    pub fn put(&mut self, key: &[u8], value: &[u8]) -> &mut Self {
        self.rep.push(TAG_PUT);
        self.push_slice(key);
        self.push_slice(value);
        self.bump_count(1);
        self
    }

    pub fn delete(&mut self, key: &[u8]) -> &mut Self {
        self.rep.push(TAG_DELETE);
        self.push_slice(key);
        self.bump_count(1);
        self
    }

    /// Appends every op of `other`, keeping this batch's sequence.
    pub fn append(&mut self, other: &WriteBatch) {
        self.rep.extend_from_slice(&other.rep[BATCH_HEADER_SIZE..]);
        self.bump_count(other.count());
    }

    pub fn clear(&mut self) {
        self.rep.clear();
        self.rep.resize(BATCH_HEADER_SIZE, 0);
    }

    pub fn count(&self) -> u32 {
        BigEndian::read_u32(&self.rep[8..12])
    }

    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }

    pub fn sequence(&self) -> SequenceNumber {
        BigEndian::read_u64(&self.rep[0..8])
    }

    pub fn set_sequence(&mut self, seq: SequenceNumber) {
        BigEndian::write_u64(&mut self.rep[0..8], seq);
    }

    /// Encoded size, header included.
    pub fn size(&self) -> usize {
        self.rep.len()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.rep
    }

    pub fn iter(&self) -> BatchIter<'_> {
        BatchIter {
            data: &self.rep[BATCH_HEADER_SIZE..],
        }
    }

    fn push_slice(&mut self, data: &[u8]) {
        let mut len = [0u8; 4];
        BigEndian::write_u32(&mut len, data.len() as u32);
        self.rep.extend_from_slice(&len);
        self.rep.extend_from_slice(data);
    }

    fn bump_count(&mut self, by: u32) {
        let count = self.count() + by;
        BigEndian::write_u32(&mut self.rep[8..12], count);
    }
}

pub struct BatchIter<'a> {
    data: &'a [u8],
}

impl<'a> BatchIter<'a> {
    fn take_slice(&mut self) -> Result<&'a [u8]> {
        if self.data.len() < 4 {
            return Err(Error::InvalidData("truncated length prefix".to_string()));
        }
        let len = BigEndian::read_u32(&self.data[..4]) as usize;
        let rest = &self.data[4..];
        if rest.len() < len {
            return Err(Error::InvalidData(format!(
                "slice of {} bytes overruns batch",
                len
            )));
        }
        let (slice, tail) = rest.split_at(len);
        self.data = tail;
        Ok(slice)
    }

    fn read_op(&mut self) -> Result<BatchOp<'a>> {
        let tag = self.data[0];
        self.data = &self.data[1..];
        match tag {
            TAG_PUT => {
                let key = self.take_slice()?;
                let value = self.take_slice()?;
                Ok(BatchOp::Put { key, value })
            }
            TAG_DELETE => Ok(BatchOp::Delete {
                key: self.take_slice()?,
            }),
            other => Err(Error::InvalidData(format!("unknown batch tag {}", other))),
        }
    }
}

impl<'a> Iterator for BatchIter<'a> {
    type Item = Result<BatchOp<'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.data.is_empty() {
            return None;
        }
        let op = self.read_op();
        if op.is_err() {
            // Stop after the first malformed op.
            self.data = &[];
        }
        Some(op)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_and_iterate() {
        let mut batch = WriteBatch::new();
        batch.put(b"a", b"1").delete(b"b").put(b"c", b"");
        batch.set_sequence(42);

        assert_eq!(batch.count(), 3);
        assert_eq!(batch.sequence(), 42);

        let ops: Vec<_> = batch.iter().collect::<Result<_>>().unwrap();
        assert_eq!(
            ops,
            vec![
                BatchOp::Put {
                    key: b"a",
                    value: b"1"
                },
                BatchOp::Delete { key: b"b" },
                BatchOp::Put {
                    key: b"c",
                    value: b""
                },
            ]
        );
    }

    #[test]
    fn test_size_limit() {
        assert!(WriteBatch::check_size(MAX_BATCH_SIZE).is_ok());
        assert!(matches!(
            WriteBatch::check_size(MAX_BATCH_SIZE + 1),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_append_merges_ops() {
        let mut first = WriteBatch::new();
        first.put(b"k1", b"v1");
        let mut second = WriteBatch::new();
        second.put(b"k2", b"v2").delete(b"k3");
        second.set_sequence(99);

        first.set_sequence(7);
        first.append(&second);

        assert_eq!(first.count(), 3);
        assert_eq!(first.sequence(), 7);
        let keys: Vec<_> = first.iter().map(|op| op.unwrap().key().to_vec()).collect();
        assert_eq!(keys, vec![b"k1".to_vec(), b"k2".to_vec(), b"k3".to_vec()]);
    }

    #[test]
    fn test_from_bytes_validates() {
        let mut batch = WriteBatch::new();
        batch.put(b"key", b"value");
        let decoded = WriteBatch::from_bytes(batch.as_bytes().to_vec()).unwrap();
        assert_eq!(decoded, batch);

        let mut truncated = batch.as_bytes().to_vec();
        truncated.truncate(truncated.len() - 2);
        assert!(WriteBatch::from_bytes(truncated).is_err());

        let mut wrong_count = batch.as_bytes().to_vec();
        wrong_count[11] = 5;
        assert!(WriteBatch::from_bytes(wrong_count).is_err());

        assert!(WriteBatch::from_bytes(vec![0u8; 3]).is_err());
    }

    #[test]
    fn test_clear() {
        let mut batch = WriteBatch::new();
        batch.put(b"k", b"v");
        batch.clear();
        assert!(batch.is_empty());
        assert_eq!(batch.size(), BATCH_HEADER_SIZE);
        assert_eq!(batch.iter().count(), 0);
    }
}
