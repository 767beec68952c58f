//! Storage backends
//!
//! The cache never touches the filesystem directly; it goes through a
//! [`Storage`] implementation shared between caches. Two backends are provided:
//!
//! - [`LocalStorage`] wraps `std::fs`.
//! - [`MemoryStorage`] keeps files in memory and can be told to fail writes to
//!   particular paths, which is how the flush error paths are tested.

use crate::depval::FileSnapshot;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::fs::{self, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::UNIX_EPOCH;

/// An open file on a storage backend
pub trait StorageFile: Read + Write + Seek + Send {
    /// Flush written data through to the backing store
    fn sync(&mut self) -> io::Result<()>;
}

/// A filesystem-like backend
pub trait Storage: Send + Sync {
    /// Open an existing file for reading
    fn open_read(&self, path: &Path) -> io::Result<Box<dyn StorageFile>>;

    /// Open a file for reading and writing, creating it if needed. Existing
    /// contents are kept.
    fn open_or_create(&self, path: &Path) -> io::Result<Box<dyn StorageFile>>;

    /// Create a file for writing, truncating any existing contents
    fn create(&self, path: &Path) -> io::Result<Box<dyn StorageFile>>;

    /// Size of an existing file
    fn file_size(&self, path: &Path) -> io::Result<u64>;

    /// Current state of a file; missing files report `DoesNotExist`
    fn snapshot(&self, path: &Path) -> FileSnapshot;

    /// Create a directory and its parents. Backends without directories do nothing.
    fn create_dir_all(&self, _path: &Path) -> io::Result<()> {
        Ok(())
    }

    /// Read a whole file into memory
    fn read_all(&self, path: &Path) -> io::Result<Vec<u8>> {
        let mut file = self.open_read(path)?;
        let mut data = Vec::new();
        file.read_to_end(&mut data)?;
        Ok(data)
    }
}

impl StorageFile for fs::File {
    fn sync(&mut self) -> io::Result<()> {
        self.sync_data()
    }
}

/// `std::fs` backed storage
#[derive(Debug, Clone)]
pub struct LocalStorage {
    create_directories: bool,
}

impl LocalStorage {
    pub fn new() -> Self {
        LocalStorage {
            create_directories: true,
        }
    }

    /// Whether missing parent directories are created when opening for write
    pub fn with_create_directories(mut self, create: bool) -> Self {
        self.create_directories = create;
        self
    }

    fn prepare_parent(&self, path: &Path) -> io::Result<()> {
        if !self.create_directories {
            return Ok(());
        }
        match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => fs::create_dir_all(parent),
            _ => Ok(()),
        }
    }
}

impl Default for LocalStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl Storage for LocalStorage {
    fn open_read(&self, path: &Path) -> io::Result<Box<dyn StorageFile>> {
        Ok(Box::new(fs::File::open(path)?))
    }

    fn open_or_create(&self, path: &Path) -> io::Result<Box<dyn StorageFile>> {
        self.prepare_parent(path)?;
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        Ok(Box::new(file))
    }

    fn create(&self, path: &Path) -> io::Result<Box<dyn StorageFile>> {
        self.prepare_parent(path)?;
        Ok(Box::new(fs::File::create(path)?))
    }

    fn file_size(&self, path: &Path) -> io::Result<u64> {
        Ok(fs::metadata(path)?.len())
    }

    fn create_dir_all(&self, path: &Path) -> io::Result<()> {
        fs::create_dir_all(path)
    }

    fn snapshot(&self, path: &Path) -> FileSnapshot {
        let modified = fs::metadata(path).and_then(|m| m.modified());
        match modified {
            Ok(time) => {
                let nanos = time
                    .duration_since(UNIX_EPOCH)
                    .map(|d| d.as_nanos() as u64)
                    .unwrap_or(0);
                FileSnapshot::normal(nanos)
            }
            Err(_) => FileSnapshot::does_not_exist(),
        }
    }
}

#[derive(Debug, Default)]
struct MemoryFileData {
    data: Vec<u8>,
    modification_time: u64,
}

#[derive(Debug, Default)]
struct MemoryState {
    files: HashMap<PathBuf, Arc<Mutex<MemoryFileData>>>,
    failing_writes: HashSet<PathBuf>,
}

/// In-memory storage
///
/// Cloning shares the same set of files.
#[derive(Debug, Clone, Default)]
pub struct MemoryStorage {
    state: Arc<Mutex<MemoryState>>,
    clock: Arc<AtomicU64>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create or update a file's modification time without changing its contents
    pub fn touch(&self, path: impl AsRef<Path>, modification_time: u64) {
        let file = self.file_entry(path.as_ref());
        file.lock().modification_time = modification_time;
    }

    /// Replace a file's contents
    pub fn put(&self, path: impl AsRef<Path>, data: impl Into<Vec<u8>>) {
        let file = self.file_entry(path.as_ref());
        let mut file = file.lock();
        file.data = data.into();
        file.modification_time = self.tick();
    }

    /// Copy of a file's contents, if it exists
    pub fn contents(&self, path: impl AsRef<Path>) -> Option<Vec<u8>> {
        let state = self.state.lock();
        state
            .files
            .get(path.as_ref())
            .map(|f| f.lock().data.clone())
    }

    pub fn exists(&self, path: impl AsRef<Path>) -> bool {
        self.state.lock().files.contains_key(path.as_ref())
    }

    pub fn remove(&self, path: impl AsRef<Path>) {
        self.state.lock().files.remove(path.as_ref());
    }

    /// Make every write to `path` fail until [`MemoryStorage::clear_write_failures`]
    pub fn fail_writes_to(&self, path: impl AsRef<Path>) {
        self.state
            .lock()
            .failing_writes
            .insert(path.as_ref().to_path_buf());
    }

    pub fn clear_write_failures(&self) {
        self.state.lock().failing_writes.clear();
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn file_entry(&self, path: &Path) -> Arc<Mutex<MemoryFileData>> {
        let mut state = self.state.lock();
        state
            .files
            .entry(path.to_path_buf())
            .or_default()
            .clone()
    }

    fn handle(&self, path: &Path, file: Arc<Mutex<MemoryFileData>>, writable: bool) -> MemoryFile {
        MemoryFile {
            path: path.to_path_buf(),
            file,
            position: 0,
            writable,
            storage: self.clone(),
        }
    }
}

impl Storage for MemoryStorage {
    fn open_read(&self, path: &Path) -> io::Result<Box<dyn StorageFile>> {
        let file = self
            .state
            .lock()
            .files
            .get(path)
            .cloned()
            .ok_or_else(|| not_found(path))?;
        Ok(Box::new(self.handle(path, file, false)))
    }

    fn open_or_create(&self, path: &Path) -> io::Result<Box<dyn StorageFile>> {
        let file = self.file_entry(path);
        Ok(Box::new(self.handle(path, file, true)))
    }

    fn create(&self, path: &Path) -> io::Result<Box<dyn StorageFile>> {
        let file = self.file_entry(path);
        {
            let mut data = file.lock();
            data.data.clear();
            data.modification_time = self.tick();
        }
        Ok(Box::new(self.handle(path, file, true)))
    }

    fn file_size(&self, path: &Path) -> io::Result<u64> {
        let state = self.state.lock();
        let file = state.files.get(path).ok_or_else(|| not_found(path))?;
        let len = file.lock().data.len() as u64;
        Ok(len)
    }

    fn snapshot(&self, path: &Path) -> FileSnapshot {
        let state = self.state.lock();
        match state.files.get(path) {
            Some(file) => FileSnapshot::normal(file.lock().modification_time),
            None => FileSnapshot::does_not_exist(),
        }
    }
}

/// Handle onto a [`MemoryStorage`] file
pub struct MemoryFile {
    path: PathBuf,
    file: Arc<Mutex<MemoryFileData>>,
    position: u64,
    writable: bool,
    storage: MemoryStorage,
}

impl Read for MemoryFile {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let file = self.file.lock();
        let start = (self.position as usize).min(file.data.len());
        let len = buf.len().min(file.data.len() - start);
        buf[..len].copy_from_slice(&file.data[start..start + len]);
        self.position += len as u64;
        Ok(len)
    }
}

impl Write for MemoryFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if !self.writable {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                format!("{} is open read-only", self.path.display()),
            ));
        }
        if self.storage.state.lock().failing_writes.contains(&self.path) {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                format!("injected write failure for {}", self.path.display()),
            ));
        }

        let modification_time = self.storage.tick();
        let mut file = self.file.lock();
        let start = self.position as usize;
        let end = start + buf.len();
        if file.data.len() < end {
            file.data.resize(end, 0);
        }
        file.data[start..end].copy_from_slice(buf);
        file.modification_time = modification_time;
        self.position = end as u64;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Seek for MemoryFile {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let len = self.file.lock().data.len() as i128;
        let target = match pos {
            SeekFrom::Start(offset) => offset as i128,
            SeekFrom::End(delta) => len + delta as i128,
            SeekFrom::Current(delta) => self.position as i128 + delta as i128,
        };
        if target < 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "seek before start of file",
            ));
        }
        self.position = target as u64;
        Ok(self.position)
    }
}

impl StorageFile for MemoryFile {
    fn sync(&mut self) -> io::Result<()> {
        Ok(())
    }
}

fn not_found(path: &Path) -> io::Error {
    io::Error::new(
        io::ErrorKind::NotFound,
        format!("{} does not exist", path.display()),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::depval::SnapshotState;
    use tempfile::TempDir;

    #[test]
    fn test_memory_open_or_create_keeps_contents() {
        let storage = MemoryStorage::new();
        let path = Path::new("cache/data");

        {
            let mut file = storage.open_or_create(path).unwrap();
            file.write_all(b"0123456789").unwrap();
        }
        {
            let mut file = storage.open_or_create(path).unwrap();
            file.seek(SeekFrom::Start(2)).unwrap();
            file.write_all(b"ab").unwrap();
        }
        assert_eq!(storage.contents(path).unwrap(), b"01ab456789");
        assert_eq!(storage.file_size(path).unwrap(), 10);

        storage.create(path).unwrap();
        assert_eq!(storage.file_size(path).unwrap(), 0);
    }

    #[test]
    fn test_memory_sparse_write() {
        let storage = MemoryStorage::new();
        let path = Path::new("sparse");
        let mut file = storage.open_or_create(path).unwrap();
        file.seek(SeekFrom::Start(4)).unwrap();
        file.write_all(b"x").unwrap();
        assert_eq!(storage.contents(path).unwrap(), vec![0, 0, 0, 0, b'x']);
    }

    #[test]
    fn test_memory_missing_file() {
        let storage = MemoryStorage::new();
        let err = storage.open_read(Path::new("nope")).err().unwrap();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
        assert_eq!(
            storage.snapshot(Path::new("nope")).state,
            SnapshotState::DoesNotExist
        );
    }

    #[test]
    fn test_memory_write_failure_injection() {
        let storage = MemoryStorage::new();
        let path = Path::new("data");
        storage.fail_writes_to(path);

        let mut file = storage.open_or_create(path).unwrap();
        assert!(file.write_all(b"abc").is_err());

        storage.clear_write_failures();
        file.write_all(b"abc").unwrap();
        assert_eq!(storage.read_all(path).unwrap(), b"abc");
    }

    #[test]
    fn test_memory_read_only_handle() {
        let storage = MemoryStorage::new();
        storage.put("ro", b"data".to_vec());
        let mut file = storage.open_read(Path::new("ro")).unwrap();
        assert!(file.write_all(b"x").is_err());
    }

    #[test]
    fn test_local_storage() {
        let dir = TempDir::new().unwrap();
        let storage = LocalStorage::new();
        let path = dir.path().join("nested/deeper/file.bin");

        assert_eq!(
            storage.snapshot(&path).state,
            SnapshotState::DoesNotExist
        );

        {
            let mut file = storage.open_or_create(&path).unwrap();
            file.write_all(b"hello world").unwrap();
            file.sync().unwrap();
        }
        {
            let mut file = storage.open_or_create(&path).unwrap();
            file.write_all(b"HELLO").unwrap();
        }

        assert_eq!(storage.read_all(&path).unwrap(), b"HELLO world");
        assert_eq!(storage.file_size(&path).unwrap(), 11);
        assert_eq!(storage.snapshot(&path).state, SnapshotState::Normal);
    }
}
