//! Whole-file storage access for the codecs.
//!
//! The codecs never touch the filesystem directly. They go through [`Storage`],
//! which also answers whether the removable card is mounted; every codec entry
//! point checks that first and fails fast with
//! [`CodecError::StorageNotMounted`](crate::CodecError::StorageNotMounted).

use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::SystemTime;

/// Byte-oriented storage addressed by path.
pub trait Storage {
    /// Whether the storage medium is currently available.
    fn is_mounted(&self) -> bool;

    /// Reads a whole file.
    fn read(&self, path: &Path) -> io::Result<Vec<u8>>;

    /// Creates or truncates a file and writes `data` to it.
    fn write(&self, path: &Path, data: &[u8]) -> io::Result<()>;

    /// Lists the names (not paths) of regular files directly inside `dir`.
    fn list(&self, dir: &Path) -> io::Result<Vec<String>>;

    /// Creates `dir` and any missing parents.
    fn create_dir_all(&self, dir: &Path) -> io::Result<()>;

    /// Returns when a file was last written.
    fn modified(&self, path: &Path) -> io::Result<SystemTime>;
}

/// Filesystem-backed storage rooted at a mount point.
///
/// Relative paths are resolved against the root; absolute paths are used as-is.
/// The storage counts as mounted while the root directory exists.
#[derive(Debug, Clone)]
pub struct FsStorage {
    root: PathBuf,
}

impl FsStorage {
    /// Creates storage rooted at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Returns the mount point.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        }
    }
}

impl Storage for FsStorage {
    fn is_mounted(&self) -> bool {
        self.root.is_dir()
    }

    fn read(&self, path: &Path) -> io::Result<Vec<u8>> {
        fs::read(self.resolve(path))
    }

    fn write(&self, path: &Path, data: &[u8]) -> io::Result<()> {
        fs::write(self.resolve(path), data)
    }

    fn list(&self, dir: &Path) -> io::Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in fs::read_dir(self.resolve(dir))? {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                names.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        Ok(names)
    }

    fn create_dir_all(&self, dir: &Path) -> io::Result<()> {
        fs::create_dir_all(self.resolve(dir))
    }

    fn modified(&self, path: &Path) -> io::Result<SystemTime> {
        fs::metadata(self.resolve(path))?.modified()
    }
}

#[derive(Debug)]
struct StoredFile {
    data: Vec<u8>,
    modified: SystemTime,
}

impl StoredFile {
    fn new(data: Vec<u8>) -> Self {
        Self {
            data,
            modified: SystemTime::now(),
        }
    }
}

/// In-memory storage, useful for hosts without a card and for tests.
#[derive(Debug)]
pub struct MemoryStorage {
    files: Mutex<BTreeMap<PathBuf, StoredFile>>,
    mounted: AtomicBool,
}

impl MemoryStorage {
    /// Creates an empty, mounted storage.
    pub fn new() -> Self {
        Self {
            files: Mutex::new(BTreeMap::new()),
            mounted: AtomicBool::new(true),
        }
    }

    /// Simulates inserting or removing the card.
    pub fn set_mounted(&self, mounted: bool) {
        self.mounted.store(mounted, Ordering::Relaxed);
    }

    /// Stores a file directly, bypassing the mounted check.
    pub fn insert(&self, path: impl Into<PathBuf>, data: Vec<u8>) {
        self.files.lock().insert(path.into(), StoredFile::new(data));
    }

    /// Returns a copy of a stored file, bypassing the mounted check.
    pub fn get(&self, path: impl AsRef<Path>) -> Option<Vec<u8>> {
        self.files.lock().get(path.as_ref()).map(|f| f.data.clone())
    }

    /// Overrides a stored file's modification time.
    pub fn set_modified(&self, path: impl AsRef<Path>, time: SystemTime) {
        if let Some(file) = self.files.lock().get_mut(path.as_ref()) {
            file.modified = time;
        }
    }

    fn check_mounted(&self) -> io::Result<()> {
        if self.is_mounted() {
            Ok(())
        } else {
            Err(io::Error::new(io::ErrorKind::NotConnected, "storage not mounted"))
        }
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl Storage for MemoryStorage {
    fn is_mounted(&self) -> bool {
        self.mounted.load(Ordering::Relaxed)
    }

    fn read(&self, path: &Path) -> io::Result<Vec<u8>> {
        self.check_mounted()?;
        self.files
            .lock()
            .get(path)
            .map(|f| f.data.clone())
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotFound))
    }

    fn write(&self, path: &Path, data: &[u8]) -> io::Result<()> {
        self.check_mounted()?;
        self.files
            .lock()
            .insert(path.to_path_buf(), StoredFile::new(data.to_vec()));
        Ok(())
    }

    fn list(&self, dir: &Path) -> io::Result<Vec<String>> {
        self.check_mounted()?;
        let files = self.files.lock();
        Ok(files
            .keys()
            .filter(|p| p.parent() == Some(dir))
            .filter_map(|p| p.file_name())
            .map(|name| name.to_string_lossy().into_owned())
            .collect())
    }

    fn create_dir_all(&self, _dir: &Path) -> io::Result<()> {
        // Directories are implicit in the key space.
        self.check_mounted()
    }

    fn modified(&self, path: &Path) -> io::Result<SystemTime> {
        self.check_mounted()?;
        self.files
            .lock()
            .get(path)
            .map(|f| f.modified)
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotFound))
    }
}

/// Returns true if `name` ends with one of `extensions` (case-insensitive, with dot).
pub(crate) fn has_extension(name: &str, extensions: &[&str]) -> bool {
    let lower = name.to_ascii_lowercase();
    extensions
        .iter()
        .any(|ext| lower.len() > ext.len() && lower.ends_with(ext))
}
