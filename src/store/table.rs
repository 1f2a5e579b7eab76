//! Flushed sorted runs.
//!
//! A table is a file of framed records, one per entry, in internal key order.
//! Each record payload is `seq:u64 | tag:u8 | key_len:u32 | key`, followed by
//! `val_len:u32 | value` for puts. Tables are small enough here to be held in
//! memory once loaded; point lookups binary-search the entry vector.

use std::io::{Cursor, Read};
use std::path::{Path, PathBuf};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use super::memtable::{Entry, InternalKey};
use super::wal::record::{encode_record, RecordReader};
use crate::batch::SequenceNumber;
use crate::error::{Result, Severity};
use crate::fs::FileSystem;
use crate::Error;

const TAG_PUT: u8 = 1;
const TAG_DELETE: u8 = 2;

#[derive(Debug, Clone, PartialEq)]
pub struct TableMeta {
    pub id: u64,
    pub level: u32,
    pub size: u64,
    pub entry_count: u64,
    pub min_key: Vec<u8>,
    pub max_key: Vec<u8>,
}

impl TableMeta {
    pub fn encode_into(&self, buf: &mut Vec<u8>) -> Result<()> {
        buf.write_u64::<BigEndian>(self.id)?;
        buf.write_u32::<BigEndian>(self.level)?;
        buf.write_u64::<BigEndian>(self.size)?;
        buf.write_u64::<BigEndian>(self.entry_count)?;

        buf.write_u32::<BigEndian>(self.min_key.len() as u32)?;
        buf.extend_from_slice(&self.min_key);

        buf.write_u32::<BigEndian>(self.max_key.len() as u32)?;
        buf.extend_from_slice(&self.max_key);
        Ok(())
    }

    pub fn decode_from(cursor: &mut Cursor<&[u8]>) -> Result<Self> {
        let id = cursor.read_u64::<BigEndian>()?;
        let level = cursor.read_u32::<BigEndian>()?;
        let size = cursor.read_u64::<BigEndian>()?;
        let entry_count = cursor.read_u64::<BigEndian>()?;

        let min_key_len = cursor.read_u32::<BigEndian>()? as usize;
        let mut min_key = vec![0u8; min_key_len];
        cursor.read_exact(&mut min_key)?;

        let max_key_len = cursor.read_u32::<BigEndian>()? as usize;
        let mut max_key = vec![0u8; max_key_len];
        cursor.read_exact(&mut max_key)?;

        Ok(TableMeta {
            id,
            level,
            size,
            entry_count,
            min_key,
            max_key,
        })
    }
}

pub fn table_path(dir: &Path, id: u64) -> PathBuf {
    dir.join(format!("{:08}.sst", id))
}

#[derive(Debug)]
pub struct Table {
    meta: TableMeta,
    path: PathBuf,
    entries: Vec<Entry>,
}

impl Table {
    /// Writes `entries` (already in internal key order) and fsyncs the file.
    pub fn write(
        fs: &dyn FileSystem,
        path: PathBuf,
        id: u64,
        level: u32,
        entries: Vec<Entry>,
    ) -> Result<Table> {
        let mut data = Vec::new();
        let mut payload = Vec::new();
        for (key, value) in &entries {
            payload.clear();
            encode_entry(key, value.as_deref(), &mut payload)?;
            encode_record(&payload, &mut data)?;
        }

        let mut file = fs
            .create(&path)
            .map_err(|e| Error::io("table create", Severity::Fatal, e))?;
        file.append(&data)
            .and_then(|_| file.sync())
            .map_err(|e| Error::io("table write", Severity::Fatal, e))?;

        let meta = TableMeta {
            id,
            level,
            size: data.len() as u64,
            entry_count: entries.len() as u64,
            min_key: entries
                .first()
                .map(|(k, _)| k.user_key.clone())
                .unwrap_or_default(),
            max_key: entries
                .last()
                .map(|(k, _)| k.user_key.clone())
                .unwrap_or_default(),
        };

        Ok(Table {
            meta,
            path,
            entries,
        })
    }

    /// Loads a table recorded in the manifest. Any damage is an error.
    pub fn load(fs: &dyn FileSystem, path: PathBuf, meta: TableMeta) -> Result<Table> {
        let data = fs.read(&path)?;
        let mut entries = Vec::with_capacity(meta.entry_count as usize);
        for record in RecordReader::new(&data) {
            entries.push(decode_entry(record?)?);
        }
        if entries.len() as u64 != meta.entry_count {
            return Err(Error::InvalidData(format!(
                "table {} has {} entries, manifest says {}",
                meta.id,
                entries.len(),
                meta.entry_count
            )));
        }
        Ok(Table {
            meta,
            path,
            entries,
        })
    }

    pub fn id(&self) -> u64 {
        self.meta.id
    }

    pub fn meta(&self) -> &TableMeta {
        &self.meta
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn entries(&self) -> &[Entry] {
        &self.entries
    }

    pub fn get(&self, key: &[u8], snapshot: SequenceNumber) -> Option<Option<Vec<u8>>> {
        let target = InternalKey::new(key, snapshot);
        let idx = self.entries.partition_point(|(k, _)| k < &target);
        let (found, value) = self.entries.get(idx)?;
        (found.user_key.as_slice() == key).then(|| value.clone())
    }
}

fn encode_entry(key: &InternalKey, value: Option<&[u8]>, buf: &mut Vec<u8>) -> Result<()> {
    buf.write_u64::<BigEndian>(key.sequence)?;
    buf.write_u8(if value.is_some() { TAG_PUT } else { TAG_DELETE })?;
    buf.write_u32::<BigEndian>(key.user_key.len() as u32)?;
    buf.extend_from_slice(&key.user_key);
    if let Some(v) = value {
        buf.write_u32::<BigEndian>(v.len() as u32)?;
        buf.extend_from_slice(v);
    }
    Ok(())
}

fn decode_entry(payload: &[u8]) -> Result<Entry> {
    let mut cursor = Cursor::new(payload);
    let sequence = cursor.read_u64::<BigEndian>()?;
    let tag = cursor.read_u8()?;

    let key_len = cursor.read_u32::<BigEndian>()? as usize;
    let mut user_key = vec![0u8; key_len];
    cursor.read_exact(&mut user_key)?;

    let value = match tag {
        TAG_PUT => {
            let val_len = cursor.read_u32::<BigEndian>()? as usize;
            let mut value = vec![0u8; val_len];
            cursor.read_exact(&mut value)?;
            Some(value)
        }
        TAG_DELETE => None,
        other => return Err(Error::InvalidData(format!("unknown table tag {}", other))),
    };

    Ok((InternalKey { user_key, sequence }, value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::OsFileSystem;
    use crate::tmpfs::TempDir;

    fn sample_entries() -> Vec<Entry> {
        vec![
            (InternalKey::new(b"a".to_vec(), 7), Some(b"new".to_vec())),
            (InternalKey::new(b"a".to_vec(), 3), Some(b"old".to_vec())),
            (InternalKey::new(b"b".to_vec(), 5), None),
            (InternalKey::new(b"c".to_vec(), 1), Some(Vec::new())),
        ]
    }

    #[test]
    fn test_write_then_load() {
        let dir = TempDir::new().unwrap();
        let path = table_path(dir.path(), 12);
        let written = Table::write(&OsFileSystem, path.clone(), 12, 0, sample_entries()).unwrap();

        assert_eq!(written.meta().min_key, b"a".to_vec());
        assert_eq!(written.meta().max_key, b"c".to_vec());
        assert_eq!(written.meta().entry_count, 4);
        assert!(path.ends_with("00000012.sst"));

        let loaded = Table::load(&OsFileSystem, path, written.meta().clone()).unwrap();
        assert_eq!(loaded.entries(), written.entries());
    }

    #[test]
    fn test_point_lookup_respects_snapshot() {
        let dir = TempDir::new().unwrap();
        let table = Table::write(
            &OsFileSystem,
            table_path(dir.path(), 1),
            1,
            0,
            sample_entries(),
        )
        .unwrap();

        assert_eq!(table.get(b"a", 10), Some(Some(b"new".to_vec())));
        assert_eq!(table.get(b"a", 6), Some(Some(b"old".to_vec())));
        assert_eq!(table.get(b"a", 2), None);
        assert_eq!(table.get(b"b", 10), Some(None));
        assert_eq!(table.get(b"c", 10), Some(Some(Vec::new())));
        assert_eq!(table.get(b"d", 10), None);
    }

    #[test]
    fn test_load_detects_truncation() {
        let dir = TempDir::new().unwrap();
        let path = table_path(dir.path(), 2);
        let table = Table::write(&OsFileSystem, path.clone(), 2, 0, sample_entries()).unwrap();

        let mut data = std::fs::read(&path).unwrap();
        data.truncate(data.len() - 1);
        std::fs::write(&path, &data).unwrap();

        assert!(Table::load(&OsFileSystem, path, table.meta().clone()).is_err());
    }

    #[test]
    fn test_table_meta_roundtrip() {
        let meta = TableMeta {
            id: 42,
            level: 1,
            size: 1024,
            entry_count: 100,
            min_key: vec![1, 2, 3],
            max_key: vec![],
        };
        let mut buf = Vec::new();
        meta.encode_into(&mut buf).unwrap();
        let decoded = TableMeta::decode_from(&mut Cursor::new(buf.as_slice())).unwrap();
        assert_eq!(decoded, meta);
    }
}
