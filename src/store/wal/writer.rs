use std::path::{Path, PathBuf};

use super::header::{Header, HEADER_SIZE};
use super::record::encode_record;
use crate::error::{Result, Severity};
use crate::fs::{FileSystem, WritableFile};
use crate::Error;

/// Appends framed records to a single log file.
///
/// Records are staged in an in-process buffer. Outside manual-flush mode every
/// record is pushed to the OS as soon as it is added. When a push fails the
/// file is truncated back to the last complete record; if that truncation
/// fails too, the file contents are unknown and the error is fatal.
pub struct LogWriter {
    number: u64,
    path: PathBuf,
    file: Box<dyn WritableFile>,
    buffer: Vec<u8>,
    committed_len: u64,
    manual_flush: bool,
    unsynced: bool,
}

impl std::fmt::Debug for LogWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogWriter")
            .field("number", &self.number)
            .field("path", &self.path)
            .field("committed_len", &self.committed_len)
            .field("buffered", &self.buffer.len())
            .finish()
    }
}

impl LogWriter {
    pub fn create(
        fs: &dyn FileSystem,
        path: PathBuf,
        number: u64,
        buffer_size: usize,
        manual_flush: bool,
    ) -> Result<Self> {
        let mut file = fs
            .create(&path)
            .map_err(|e| Error::io("log create", Severity::Fatal, e))?;
        file.append(&Header::new(number).encode())
            .and_then(|_| file.sync())
            .map_err(|e| Error::io("log header", Severity::Fatal, e))?;

        Ok(Self {
            number,
            path,
            file,
            buffer: Vec::with_capacity(buffer_size),
            committed_len: HEADER_SIZE as u64,
            manual_flush,
            unsynced: false,
        })
    }

    pub fn number(&self) -> u64 {
        self.number
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Bytes handed to the OS, header included.
    pub fn file_size(&self) -> u64 {
        self.committed_len
    }

    pub fn buffer_is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Stages one record. On failure the record is dropped from the buffer and
    /// the writer is left as it was before the call.
    pub fn add_record(&mut self, payload: &[u8]) -> Result<()> {
        let mark = self.buffer.len();
        encode_record(payload, &mut self.buffer)?;
        if self.manual_flush {
            return Ok(());
        }
        if let Err(e) = self.flush_buffer() {
            self.buffer.truncate(mark);
            return Err(e);
        }
        Ok(())
    }

    /// Stages one record, pushes the whole buffer and fsyncs, regardless of
    /// manual-flush mode. A failed push drops only this record.
    pub fn add_record_sync(&mut self, payload: &[u8]) -> Result<()> {
        let mark = self.buffer.len();
        encode_record(payload, &mut self.buffer)?;
        if let Err(e) = self.flush_buffer() {
            self.buffer.truncate(mark);
            return Err(e);
        }
        self.sync()
    }

    /// Pushes buffered records to the OS without syncing.
    pub fn flush_buffer(&mut self) -> Result<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }

        let pushed = self
            .file
            .append(&self.buffer)
            .and_then(|_| self.file.flush());
        match pushed {
            Ok(()) => {
                self.committed_len += self.buffer.len() as u64;
                self.buffer.clear();
                self.unsynced = true;
                Ok(())
            }
            Err(e) => match self.file.truncate(self.committed_len) {
                Ok(()) => {
                    tracing::warn!(
                        log = self.number,
                        error = %e,
                        "Log append failed, rolled back to last record"
                    );
                    Err(Error::io("log append", Severity::Recoverable, e))
                }
                Err(truncate_err) => {
                    tracing::error!(
                        log = self.number,
                        error = %e,
                        truncate_error = %truncate_err,
                        "Log append failed and rollback failed"
                    );
                    Err(Error::io("log append", Severity::Fatal, e))
                }
            },
        }
    }

    /// Flushes the buffer and fsyncs. A failed fsync is always fatal.
    pub fn sync(&mut self) -> Result<()> {
        self.flush_buffer()?;
        if self.unsynced {
            self.file
                .sync()
                .map_err(|e| Error::io("log sync", Severity::Fatal, e))?;
            self.unsynced = false;
        }
        Ok(())
    }

    /// Cuts any partial bytes left by an earlier failure, then flushes and
    /// syncs whatever is still buffered.
    pub fn recover(&mut self) -> Result<()> {
        self.file
            .truncate(self.committed_len)
            .map_err(|e| Error::io("log recover", Severity::Fatal, e))?;
        self.unsynced = true;
        self.sync().map_err(Error::into_fatal)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::fs::{FaultInjectionFs, OsFileSystem};
    use crate::store::wal::record::{RecordReader, RECORD_OVERHEAD};
    use crate::tmpfs::TempDir;

    fn records(fs: &dyn FileSystem, path: &Path) -> Vec<Vec<u8>> {
        let data = fs.read(path).unwrap();
        RecordReader::new(&data[HEADER_SIZE..])
            .map(|r| r.unwrap().to_vec())
            .collect()
    }

    #[test]
    fn test_write_through() {
        let dir = TempDir::new().unwrap();
        let fs = OsFileSystem;
        let path = dir.path().join("1.wal");
        let mut log = LogWriter::create(&fs, path.clone(), 1, 1024, false).unwrap();

        log.add_record(b"one").unwrap();
        assert!(log.buffer_is_empty());
        log.add_record(b"two").unwrap();
        log.sync().unwrap();

        assert_eq!(
            log.file_size(),
            (HEADER_SIZE + 2 * RECORD_OVERHEAD + 6) as u64
        );
        assert_eq!(records(&fs, &path), vec![b"one".to_vec(), b"two".to_vec()]);
    }

    #[test]
    fn test_manual_flush_buffers() {
        let dir = TempDir::new().unwrap();
        let fs = OsFileSystem;
        let path = dir.path().join("2.wal");
        let mut log = LogWriter::create(&fs, path.clone(), 2, 1024, true).unwrap();

        log.add_record(b"buffered").unwrap();
        assert!(!log.buffer_is_empty());
        assert!(records(&fs, &path).is_empty());

        log.flush_buffer().unwrap();
        assert!(log.buffer_is_empty());
        assert_eq!(records(&fs, &path), vec![b"buffered".to_vec()]);
    }

    #[test]
    fn test_synced_record_bypasses_manual_flush() {
        let dir = TempDir::new().unwrap();
        let fs = FaultInjectionFs::new(Arc::new(OsFileSystem));
        let path = dir.path().join("5.wal");
        let mut log = LogWriter::create(&fs, path.clone(), 5, 1024, true).unwrap();

        log.add_record(b"early").unwrap();
        fs.inject_append_failures(1);
        assert!(log.add_record_sync(b"lost").is_err());
        // The earlier buffered record survives the rollback.
        assert!(!log.buffer_is_empty());

        log.add_record_sync(b"durable").unwrap();
        assert!(log.buffer_is_empty());
        assert_eq!(
            records(&fs, &path),
            vec![b"early".to_vec(), b"durable".to_vec()]
        );
    }

    #[test]
    fn test_append_failure_is_recoverable() {
        let dir = TempDir::new().unwrap();
        let fs = FaultInjectionFs::new(Arc::new(OsFileSystem));
        let path = dir.path().join("3.wal");
        let mut log = LogWriter::create(&fs, path.clone(), 3, 1024, false).unwrap();
        log.add_record(b"kept").unwrap();

        fs.inject_append_failures(1);
        let err = log.add_record(b"lost").unwrap_err();
        assert_eq!(err.severity(), Some(Severity::Recoverable));
        assert!(log.buffer_is_empty());

        log.add_record(b"after").unwrap();
        assert_eq!(records(&fs, &path), vec![b"kept".to_vec(), b"after".to_vec()]);
    }

    #[test]
    fn test_failure_without_rollback_is_fatal() {
        let dir = TempDir::new().unwrap();
        let fs = FaultInjectionFs::new(Arc::new(OsFileSystem));
        let path = dir.path().join("4.wal");
        let mut log = LogWriter::create(&fs, path.clone(), 4, 1024, false).unwrap();

        fs.set_active(false);
        let err = log.add_record(b"doomed").unwrap_err();
        assert!(err.is_fatal());
        assert!(log.recover().is_err());

        fs.set_active(true);
        log.recover().unwrap();
        log.add_record(b"recovered").unwrap();
        assert_eq!(records(&fs, &path), vec![b"recovered".to_vec()]);
    }
}
