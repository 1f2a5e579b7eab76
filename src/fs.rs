//! File system seam.
//!
//! Every durable byte the engine writes (logs, tables, the manifest) goes
//! through [`FileSystem`] so tests can inject failures. [`OsFileSystem`] is the
//! default; [`FaultInjectionFs`] wraps another file system and can be switched
//! off at runtime.

use std::fmt::Debug;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

/// An append-only file handle.
pub trait WritableFile: Send {
    fn append(&mut self, data: &[u8]) -> io::Result<()>;

    /// Pushes user-space buffers to the OS. No durability guarantee.
    fn flush(&mut self) -> io::Result<()>;

    /// Makes appended data durable.
    fn sync(&mut self) -> io::Result<()>;

    /// Cuts the file back to `len` bytes; later appends continue from there.
    fn truncate(&mut self, len: u64) -> io::Result<()>;

    /// Current length in bytes, including appended but unsynced data.
    fn size(&self) -> u64;
}

pub trait FileSystem: Send + Sync + Debug {
    /// Creates `path`, truncating any existing file.
    fn create(&self, path: &Path) -> io::Result<Box<dyn WritableFile>>;

    /// Opens `path` for appending, creating it when missing.
    fn open_append(&self, path: &Path) -> io::Result<Box<dyn WritableFile>>;

    fn read(&self, path: &Path) -> io::Result<Vec<u8>>;

    fn remove(&self, path: &Path) -> io::Result<()>;

    fn create_dir_all(&self, path: &Path) -> io::Result<()>;

    /// Lists the entries of `dir`. A missing directory lists as empty.
    fn list(&self, dir: &Path) -> io::Result<Vec<PathBuf>>;

    fn exists(&self, path: &Path) -> bool;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct OsFileSystem;

struct OsWritableFile {
    file: File,
    len: u64,
}

impl WritableFile for OsWritableFile {
    fn append(&mut self, data: &[u8]) -> io::Result<()> {
        self.file.write_all(data)?;
        self.len += data.len() as u64;
        Ok(())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }

    fn sync(&mut self) -> io::Result<()> {
        self.file.sync_data()
    }

    fn truncate(&mut self, len: u64) -> io::Result<()> {
        // Append mode keeps later writes at the new end of file.
        self.file.set_len(len)?;
        self.len = len;
        Ok(())
    }

    fn size(&self) -> u64 {
        self.len
    }
}

impl FileSystem for OsFileSystem {
    fn create(&self, path: &Path) -> io::Result<Box<dyn WritableFile>> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        file.set_len(0)?;
        Ok(Box::new(OsWritableFile { file, len: 0 }))
    }

    fn open_append(&self, path: &Path) -> io::Result<Box<dyn WritableFile>> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let len = file.metadata()?.len();
        Ok(Box::new(OsWritableFile { file, len }))
    }

    fn read(&self, path: &Path) -> io::Result<Vec<u8>> {
        fs::read(path)
    }

    fn remove(&self, path: &Path) -> io::Result<()> {
        fs::remove_file(path)
    }

    fn create_dir_all(&self, path: &Path) -> io::Result<()> {
        fs::create_dir_all(path)
    }

    fn list(&self, dir: &Path) -> io::Result<Vec<PathBuf>> {
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let mut paths = Vec::new();
        for entry in entries {
            paths.push(entry?.path());
        }
        paths.sort();
        Ok(paths)
    }

    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }
}

/// Wraps a file system and fails mutating calls on demand.
///
/// While inactive, every append, flush, sync, truncate, create and remove
/// fails, including on handles opened before the switch. Reads keep working.
/// `inject_append_failures(n)` fails only the next `n` appends, which leaves
/// truncation available for rollback.
#[derive(Debug, Clone)]
pub struct FaultInjectionFs {
    inner: Arc<dyn FileSystem>,
    faults: Arc<Faults>,
}

#[derive(Debug)]
struct Faults {
    active: AtomicBool,
    failing_appends: AtomicUsize,
}

impl Faults {
    fn check_active(&self) -> io::Result<()> {
        if self.active.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(io::Error::other("injected fault: file system inactive"))
        }
    }

    fn check_append(&self) -> io::Result<()> {
        self.check_active()?;
        let injected = self
            .failing_appends
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(io::Error::other("injected fault: append failed"));
        }
        Ok(())
    }
}

impl FaultInjectionFs {
    pub fn new(inner: Arc<dyn FileSystem>) -> Self {
        Self {
            inner,
            faults: Arc::new(Faults {
                active: AtomicBool::new(true),
                failing_appends: AtomicUsize::new(0),
            }),
        }
    }

    pub fn set_active(&self, active: bool) {
        self.faults.active.store(active, Ordering::SeqCst);
    }

    pub fn is_active(&self) -> bool {
        self.faults.active.load(Ordering::SeqCst)
    }

    pub fn inject_append_failures(&self, count: usize) {
        self.faults.failing_appends.store(count, Ordering::SeqCst);
    }
}

struct FaultyFile {
    inner: Box<dyn WritableFile>,
    faults: Arc<Faults>,
}

impl WritableFile for FaultyFile {
    fn append(&mut self, data: &[u8]) -> io::Result<()> {
        self.faults.check_append()?;
        self.inner.append(data)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.faults.check_active()?;
        self.inner.flush()
    }

    fn sync(&mut self) -> io::Result<()> {
        self.faults.check_active()?;
        self.inner.sync()
    }

    fn truncate(&mut self, len: u64) -> io::Result<()> {
        self.faults.check_active()?;
        self.inner.truncate(len)
    }

    fn size(&self) -> u64 {
        self.inner.size()
    }
}

impl FileSystem for FaultInjectionFs {
    fn create(&self, path: &Path) -> io::Result<Box<dyn WritableFile>> {
        self.faults.check_active()?;
        Ok(Box::new(FaultyFile {
            inner: self.inner.create(path)?,
            faults: self.faults.clone(),
        }))
    }

    fn open_append(&self, path: &Path) -> io::Result<Box<dyn WritableFile>> {
        self.faults.check_active()?;
        Ok(Box::new(FaultyFile {
            inner: self.inner.open_append(path)?,
            faults: self.faults.clone(),
        }))
    }

    fn read(&self, path: &Path) -> io::Result<Vec<u8>> {
        self.inner.read(path)
    }

    fn remove(&self, path: &Path) -> io::Result<()> {
        self.faults.check_active()?;
        self.inner.remove(path)
    }

    fn create_dir_all(&self, path: &Path) -> io::Result<()> {
        self.faults.check_active()?;
        self.inner.create_dir_all(path)
    }

    fn list(&self, dir: &Path) -> io::Result<Vec<PathBuf>> {
        self.inner.list(dir)
    }

    fn exists(&self, path: &Path) -> bool {
        self.inner.exists(path)
    }
}
