//! Filesystem abstraction used by parts: directory management, durable writes and column readers.

use crate::error::PartError;

use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

#[cfg(unix)]
const DIR_PERM: u32 = 0o750;
#[cfg(unix)]
const FILE_PERM: u32 = 0o600;

/// A readable column stream, either memory- or file-backed.
pub trait Reader: fmt::Debug + Send + Sync {
    /// Logical path of the stream (for memory-backed streams this is not a real file).
    fn path(&self) -> &Path;

    /// The on-disk file backing this stream, if any.
    fn file_path(&self) -> Option<&Path>;

    fn size(&self) -> Result<u64, PartError>;

    /// Reads exactly `buf.len()` bytes starting at `offset`.
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<(), PartError>;

    /// Opens an independent forward-only cursor positioned at the start of the stream.
    fn sequential_read(&self) -> Result<Box<dyn Read + Send>, PartError>;

    /// Releases any held OS handle. Reads after close reopen lazily.
    fn close(&self) {}
}

/// Directory entry returned by [`FileSystem::read_dir`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub is_dir: bool,
}

pub trait FileSystem: fmt::Debug + Send + Sync {
    fn mkdir_if_not_exist(&self, path: &Path) -> Result<(), PartError>;

    /// Creates `path` (and missing parents); fails with [`PartError::PartExists`] if it exists.
    fn mkdir_exclusive(&self, path: &Path) -> Result<(), PartError>;

    /// Writes `data` to a new file at `path` and syncs it. Returns the number of bytes written.
    fn write_file(&self, data: &[u8], path: &Path) -> Result<u64, PartError>;

    fn read_file(&self, path: &Path) -> Result<Vec<u8>, PartError>;

    /// Returns a lazily opened reader. Fails if `path` is not an existing regular file.
    fn open_file(&self, path: &Path) -> Result<Arc<dyn Reader>, PartError>;

    fn read_dir(&self, path: &Path) -> Result<Vec<DirEntry>, PartError>;

    fn remove_all(&self, path: &Path) -> Result<(), PartError>;

    /// Durably syncs a directory's entries.
    fn sync_path(&self, path: &Path) -> Result<(), PartError>;

    fn file_size(&self, path: &Path) -> Result<u64, PartError>;
}

/// [`FileSystem`] backed by the local OS filesystem.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalFileSystem;

impl LocalFileSystem {
    fn dir_builder(recursive: bool) -> fs::DirBuilder {
        let mut builder = fs::DirBuilder::new();
        builder.recursive(recursive);
        #[cfg(unix)]
        {
            use std::os::unix::fs::DirBuilderExt;
            builder.mode(DIR_PERM);
        }
        builder
    }
}

impl FileSystem for LocalFileSystem {
    fn mkdir_if_not_exist(&self, path: &Path) -> Result<(), PartError> {
        Self::dir_builder(true).create(path)?;
        Ok(())
    }

    fn mkdir_exclusive(&self, path: &Path) -> Result<(), PartError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                Self::dir_builder(true).create(parent)?;
            }
        }
        match Self::dir_builder(false).create(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                Err(PartError::PartExists(path.to_path_buf()))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn write_file(&self, data: &[u8], path: &Path) -> Result<u64, PartError> {
        let mut opts = OpenOptions::new();
        opts.create_new(true).write(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            opts.mode(FILE_PERM);
        }
        let mut f = opts.open(path)?;
        f.write_all(data)?;
        f.flush()?;
        f.sync_data()?;
        Ok(data.len() as u64)
    }

    fn read_file(&self, path: &Path) -> Result<Vec<u8>, PartError> {
        Ok(fs::read(path)?)
    }

    fn open_file(&self, path: &Path) -> Result<Arc<dyn Reader>, PartError> {
        let meta = fs::metadata(path)?;
        if !meta.is_file() {
            return Err(PartError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("{:?} is not a regular file", path),
            )));
        }
        Ok(Arc::new(FileReader::new(path)))
    }

    fn read_dir(&self, path: &Path) -> Result<Vec<DirEntry>, PartError> {
        let mut out = Vec::new();
        for entry in fs::read_dir(path)? {
            let entry = entry?;
            out.push(DirEntry {
                name: entry.file_name().to_string_lossy().into_owned(),
                is_dir: entry.file_type()?.is_dir(),
            });
        }
        out.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(out)
    }

    fn remove_all(&self, path: &Path) -> Result<(), PartError> {
        match fs::remove_dir_all(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn sync_path(&self, path: &Path) -> Result<(), PartError> {
        let dir = File::open(path)?;
        dir.sync_all()?;
        Ok(())
    }

    fn file_size(&self, path: &Path) -> Result<u64, PartError> {
        Ok(fs::metadata(path)?.len())
    }
}

/// File-backed [`Reader`] that opens its handle on first use.
#[derive(Debug)]
pub struct FileReader {
    path: PathBuf,
    file: Mutex<Option<File>>,
}

impl FileReader {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            file: Mutex::new(None),
        }
    }

    pub fn is_open(&self) -> bool {
        self.file.lock().map(|f| f.is_some()).unwrap_or(false)
    }
}

impl Reader for FileReader {
    fn path(&self) -> &Path {
        &self.path
    }

    fn file_path(&self) -> Option<&Path> {
        Some(&self.path)
    }

    fn size(&self) -> Result<u64, PartError> {
        Ok(fs::metadata(&self.path)?.len())
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<(), PartError> {
        let mut guard = self.file.lock()?;
        if guard.is_none() {
            *guard = Some(File::open(&self.path)?);
        }
        if let Some(f) = guard.as_mut() {
            f.seek(SeekFrom::Start(offset))?;
            f.read_exact(buf)?;
        }
        Ok(())
    }

    fn sequential_read(&self) -> Result<Box<dyn Read + Send>, PartError> {
        Ok(Box::new(BufReader::new(File::open(&self.path)?)))
    }

    fn close(&self) {
        if let Ok(mut guard) = self.file.lock() {
            guard.take();
        }
    }
}
