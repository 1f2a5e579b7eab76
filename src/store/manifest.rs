//! Persistent record of table layout and log bookkeeping.
//!
//! `manifest.log` is a sequence of framed records. Each record is one atomic
//! group of [`VersionEdit`]s, encoded as `count:u32` followed by the edits.
//! Replaying every record in order rebuilds a [`ManifestState`].

use std::collections::BTreeMap;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use super::table::TableMeta;
use super::wal::record::{encode_record, RecordReader};
use crate::batch::SequenceNumber;
use crate::error::{Result, Severity};
use crate::fs::{FileSystem, WritableFile};
use crate::Error;

pub const MANIFEST_FILE: &str = "manifest.log";

const ADD_TABLE: u8 = 0x01;
const DELETE_TABLE: u8 = 0x02;
const LOG_NUMBER: u8 = 0x03;
const NEXT_FILE_NUMBER: u8 = 0x04;
const LAST_SEQUENCE: u8 = 0x05;

#[derive(Debug, Clone, PartialEq)]
pub enum VersionEdit {
    AddTable(TableMeta),
    DeleteTable { level: u32, id: u64 },
    /// Logs numbered below this hold no unflushed data.
    LogNumber(u64),
    NextFileNumber(u64),
    LastSequence(SequenceNumber),
}

impl VersionEdit {
    pub fn encode_into(&self, buf: &mut Vec<u8>) -> Result<()> {
        match self {
            VersionEdit::AddTable(meta) => {
                buf.write_u8(ADD_TABLE)?;
                meta.encode_into(buf)?;
            }
            VersionEdit::DeleteTable { level, id } => {
                buf.write_u8(DELETE_TABLE)?;
                buf.write_u32::<BigEndian>(*level)?;
                buf.write_u64::<BigEndian>(*id)?;
            }
            VersionEdit::LogNumber(n) => {
                buf.write_u8(LOG_NUMBER)?;
                buf.write_u64::<BigEndian>(*n)?;
            }
            VersionEdit::NextFileNumber(n) => {
                buf.write_u8(NEXT_FILE_NUMBER)?;
                buf.write_u64::<BigEndian>(*n)?;
            }
            VersionEdit::LastSequence(seq) => {
                buf.write_u8(LAST_SEQUENCE)?;
                buf.write_u64::<BigEndian>(*seq)?;
            }
        }
        Ok(())
    }

    pub fn decode_from(cursor: &mut Cursor<&[u8]>) -> Result<Self> {
        match cursor.read_u8()? {
            ADD_TABLE => Ok(VersionEdit::AddTable(TableMeta::decode_from(cursor)?)),
            DELETE_TABLE => Ok(VersionEdit::DeleteTable {
                level: cursor.read_u32::<BigEndian>()?,
                id: cursor.read_u64::<BigEndian>()?,
            }),
            LOG_NUMBER => Ok(VersionEdit::LogNumber(cursor.read_u64::<BigEndian>()?)),
            NEXT_FILE_NUMBER => Ok(VersionEdit::NextFileNumber(
                cursor.read_u64::<BigEndian>()?,
            )),
            LAST_SEQUENCE => Ok(VersionEdit::LastSequence(cursor.read_u64::<BigEndian>()?)),
            tag => Err(Error::InvalidData(format!(
                "unknown manifest edit tag {}",
                tag
            ))),
        }
    }
}

/// Layout rebuilt from the manifest.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ManifestState {
    /// Live tables by id.
    pub tables: BTreeMap<u64, TableMeta>,
    pub log_number: u64,
    pub next_file_number: u64,
    pub last_sequence: SequenceNumber,
}

impl ManifestState {
    pub fn apply(&mut self, edit: &VersionEdit) {
        match edit {
            VersionEdit::AddTable(meta) => {
                self.tables.insert(meta.id, meta.clone());
            }
            VersionEdit::DeleteTable { id, .. } => {
                self.tables.remove(id);
            }
            VersionEdit::LogNumber(n) => self.log_number = self.log_number.max(*n),
            VersionEdit::NextFileNumber(n) => {
                self.next_file_number = self.next_file_number.max(*n)
            }
            VersionEdit::LastSequence(seq) => {
                self.last_sequence = self.last_sequence.max(*seq)
            }
        }
    }
}

pub struct Manifest {
    path: PathBuf,
    file: Box<dyn WritableFile>,
    update_sequence: u64,
}

impl std::fmt::Debug for Manifest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Manifest")
            .field("path", &self.path)
            .field("update_sequence", &self.update_sequence)
            .finish()
    }
}

impl Manifest {
    /// Opens (or creates) `dir/manifest.log` and replays it.
    ///
    /// A torn final record is cut off with a warning; it was never
    /// acknowledged.
    pub fn open(fs: &Arc<dyn FileSystem>, dir: &Path) -> Result<(Manifest, ManifestState)> {
        let path = dir.join(MANIFEST_FILE);
        let mut state = ManifestState::default();
        let mut valid_len = None;

        if fs.exists(&path) {
            let data = fs.read(&path)?;
            let mut reader = RecordReader::new(&data);
            let mut torn = None;
            for record in reader.by_ref() {
                match record {
                    Ok(payload) => {
                        for edit in decode_edits(payload)? {
                            state.apply(&edit);
                        }
                    }
                    Err(e) => torn = Some(e),
                }
            }
            if let Some(e) = torn {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    valid_len = reader.offset(),
                    "Discarding torn manifest tail"
                );
                valid_len = Some(reader.offset() as u64);
            }
        }

        let mut file = fs.open_append(&path)?;
        if let Some(len) = valid_len {
            file.truncate(len)?;
        }

        Ok((
            Manifest {
                path,
                file,
                update_sequence: 0,
            },
            state,
        ))
    }

    /// Durably appends one atomic group of edits.
    pub fn log_and_apply(&mut self, edits: &[VersionEdit]) -> Result<()> {
        let mut payload = Vec::new();
        payload.write_u32::<BigEndian>(edits.len() as u32)?;
        for edit in edits {
            edit.encode_into(&mut payload)?;
        }
        let mut record = Vec::with_capacity(payload.len() + 8);
        encode_record(&payload, &mut record)?;

        self.file
            .append(&record)
            .and_then(|_| self.file.sync())
            .map_err(|e| Error::io("manifest write", Severity::Fatal, e))?;
        self.update_sequence += 1;
        Ok(())
    }

    /// Number of records written since open.
    pub fn update_sequence(&self) -> u64 {
        self.update_sequence
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn decode_edits(payload: &[u8]) -> Result<Vec<VersionEdit>> {
    let mut cursor = Cursor::new(payload);
    let count = cursor.read_u32::<BigEndian>()? as usize;
    let mut edits = Vec::with_capacity(count);
    for _ in 0..count {
        edits.push(VersionEdit::decode_from(&mut cursor)?);
    }
    Ok(edits)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::OsFileSystem;
    use crate::tmpfs::TempDir;

    fn meta(id: u64, level: u32) -> TableMeta {
        TableMeta {
            id,
            level,
            size: 128,
            entry_count: 3,
            min_key: b"a".to_vec(),
            max_key: b"z".to_vec(),
        }
    }

    #[test]
    fn test_replay_after_reopen() {
        let dir = TempDir::new().unwrap();
        let fs: Arc<dyn FileSystem> = Arc::new(OsFileSystem);

        {
            let (mut manifest, state) = Manifest::open(&fs, dir.path()).unwrap();
            assert_eq!(state, ManifestState::default());

            manifest
                .log_and_apply(&[
                    VersionEdit::AddTable(meta(5, 0)),
                    VersionEdit::LogNumber(4),
                    VersionEdit::NextFileNumber(6),
                    VersionEdit::LastSequence(17),
                ])
                .unwrap();
            manifest
                .log_and_apply(&[
                    VersionEdit::DeleteTable { level: 0, id: 5 },
                    VersionEdit::AddTable(meta(6, 1)),
                ])
                .unwrap();
            assert_eq!(manifest.update_sequence(), 2);
        }

        let (manifest, state) = Manifest::open(&fs, dir.path()).unwrap();
        assert_eq!(manifest.update_sequence(), 0);
        assert_eq!(state.tables.len(), 1);
        assert_eq!(state.tables[&6].level, 1);
        assert_eq!(state.log_number, 4);
        assert_eq!(state.next_file_number, 6);
        assert_eq!(state.last_sequence, 17);
    }

    #[test]
    fn test_torn_tail_is_discarded() {
        let dir = TempDir::new().unwrap();
        let fs: Arc<dyn FileSystem> = Arc::new(OsFileSystem);
        {
            let (mut manifest, _) = Manifest::open(&fs, dir.path()).unwrap();
            manifest
                .log_and_apply(&[VersionEdit::LogNumber(2)])
                .unwrap();
            manifest
                .log_and_apply(&[VersionEdit::LogNumber(9)])
                .unwrap();
        }
        let path = dir.path().join(MANIFEST_FILE);
        let mut data = std::fs::read(&path).unwrap();
        data.truncate(data.len() - 3);
        std::fs::write(&path, &data).unwrap();

        let (mut manifest, state) = Manifest::open(&fs, dir.path()).unwrap();
        assert_eq!(state.log_number, 2);

        manifest
            .log_and_apply(&[VersionEdit::LastSequence(3)])
            .unwrap();
        drop(manifest);
        let (_, state) = Manifest::open(&fs, dir.path()).unwrap();
        assert_eq!(state.log_number, 2);
        assert_eq!(state.last_sequence, 3);
    }
}
