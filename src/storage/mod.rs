//! Encrypted store: a thin blocking byte accessor for data at rest
//!
//! Nothing here knows about keys or ciphertext. Handles move raw bytes in and
//! out of files; the sealing layer in `tee` gives those bytes meaning.
//! Relative paths resolve against the store root, so one store can be pointed
//! at a scratch directory per session.

use crate::error::{EngineError, Result};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Writes are buffered up to this many bytes before hitting the file
const WRITE_BUFFER: usize = 8 * 1024;

/// How a file is opened
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    /// Read only, the file must exist
    Read,
    /// Create or truncate, then write
    Write,
    /// Read and write in place, creating the file if needed (no truncation)
    Update,
}

impl OpenMode {
    fn can_read(self) -> bool {
        !matches!(self, OpenMode::Write)
    }

    fn can_write(self) -> bool {
        !matches!(self, OpenMode::Read)
    }
}

/// File accessor rooted at an optional base directory
#[derive(Debug, Clone, Default)]
pub struct EncryptedStore {
    root: Option<PathBuf>,
}

impl EncryptedStore {
    /// Store that resolves paths as given
    pub fn new() -> Self {
        Self { root: None }
    }

    /// Store that resolves relative paths under `root`
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            root: Some(root.into()),
        }
    }

    pub fn resolve(&self, path: impl AsRef<Path>) -> PathBuf {
        let path = path.as_ref();
        match &self.root {
            Some(root) if path.is_relative() => root.join(path),
            _ => path.to_path_buf(),
        }
    }

    /// Open `path`. `Write` truncates an existing file.
    pub fn open(&self, path: impl AsRef<Path>, mode: OpenMode) -> Result<FileHandle> {
        let path = self.resolve(path);
        let mut options = OpenOptions::new();
        match mode {
            OpenMode::Read => options.read(true),
            OpenMode::Write => options.write(true).create(true).truncate(true),
            OpenMode::Update => options.read(true).write(true).create(true),
        };
        if mode.can_write() {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent).map_err(|e| EngineError::from_io(parent, e))?;
            }
        }
        let file = options.open(&path).map_err(|e| EngineError::from_io(&path, e))?;
        log::debug!("Opened {} ({:?})", path.display(), mode);
        Ok(FileHandle {
            path,
            mode,
            file: Some(file),
            cursor: 0,
            pending: Vec::new(),
        })
    }

    pub fn exists(&self, path: impl AsRef<Path>) -> bool {
        self.resolve(path).exists()
    }

    /// Read a whole file in one call
    pub fn read_all(&self, path: impl AsRef<Path>) -> Result<Vec<u8>> {
        let mut handle = self.open(path, OpenMode::Read)?;
        let size = handle.size()? as usize;
        let mut buf = vec![0u8; size];
        let n = handle.read(&mut buf)?;
        buf.truncate(n);
        handle.close()?;
        Ok(buf)
    }
}

/// An open file. Not shared between threads; open another handle instead.
#[derive(Debug)]
pub struct FileHandle {
    path: PathBuf,
    mode: OpenMode,
    file: Option<File>,
    /// Implicit position used by `read` and `write`
    cursor: u64,
    pending: Vec<u8>,
}

impl FileHandle {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn mode(&self) -> OpenMode {
        self.mode
    }

    pub fn is_closed(&self) -> bool {
        self.file.is_none()
    }

    /// Current implicit cursor
    pub fn position(&self) -> u64 {
        self.cursor + self.pending.len() as u64
    }

    /// Read from the cursor until `buf` is full or the file ends.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.require_read()?;
        self.flush_pending()?;
        let cursor = self.cursor;
        let n = self.read_from(cursor, buf)?;
        self.cursor += n as u64;
        Ok(n)
    }

    /// Positioned read; the implicit cursor is left untouched.
    pub fn read_at(&mut self, buf: &mut [u8], offset: u64) -> Result<usize> {
        self.require_read()?;
        self.flush_pending()?;
        let size = self.size()?;
        if offset > size {
            return Err(EngineError::OutOfRange { offset, size });
        }
        self.read_from(offset, buf)
    }

    /// Append at the cursor. Bytes may sit in the write buffer until the
    /// next flush, positioned call or `close`.
    pub fn write(&mut self, buf: &[u8]) -> Result<usize> {
        self.require_write()?;
        self.pending.extend_from_slice(buf);
        if self.pending.len() >= WRITE_BUFFER {
            self.flush_pending()?;
        }
        Ok(buf.len())
    }

    /// Positioned write; the implicit cursor is left untouched.
    pub fn write_at(&mut self, buf: &[u8], offset: u64) -> Result<usize> {
        self.require_write()?;
        self.flush_pending()?;
        let path = self.path.clone();
        let file = self.file.as_mut().ok_or(EngineError::HandleClosed)?;
        file.seek(SeekFrom::Start(offset))
            .and_then(|_| file.write_all(buf))
            .map_err(|e| EngineError::from_io(&path, e))?;
        Ok(buf.len())
    }

    /// Size of the file including buffered writes
    pub fn size(&mut self) -> Result<u64> {
        self.flush_pending()?;
        let path = self.path.clone();
        let file = self.file.as_ref().ok_or(EngineError::HandleClosed)?;
        let meta = file.metadata().map_err(|e| EngineError::from_io(&path, e))?;
        Ok(meta.len())
    }

    pub fn flush(&mut self) -> Result<()> {
        self.flush_pending()?;
        let path = self.path.clone();
        if let Some(file) = self.file.as_mut() {
            file.flush().map_err(|e| EngineError::from_io(&path, e))?;
        }
        Ok(())
    }

    /// Flush and release the file. Closing twice is a no-op.
    pub fn close(&mut self) -> Result<()> {
        if self.file.is_none() {
            return Ok(());
        }
        let flushed = self.flush();
        self.file = None;
        self.pending.clear();
        flushed
    }

    fn read_from(&mut self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let path = self.path.clone();
        let file = self.file.as_mut().ok_or(EngineError::HandleClosed)?;
        file.seek(SeekFrom::Start(offset))
            .map_err(|e| EngineError::from_io(&path, e))?;
        let mut filled = 0;
        while filled < buf.len() {
            match file.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(EngineError::from_io(&path, e)),
            }
        }
        Ok(filled)
    }

    fn flush_pending(&mut self) -> Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let path = self.path.clone();
        let file = self.file.as_mut().ok_or(EngineError::HandleClosed)?;
        file.seek(SeekFrom::Start(self.cursor))
            .and_then(|_| file.write_all(&self.pending))
            .map_err(|e| EngineError::from_io(&path, e))?;
        self.cursor += self.pending.len() as u64;
        self.pending.clear();
        Ok(())
    }

    fn require_read(&self) -> Result<()> {
        if self.file.is_none() {
            return Err(EngineError::HandleClosed);
        }
        if !self.mode.can_read() {
            return Err(EngineError::PermissionDenied(format!(
                "{} opened write-only",
                self.path.display()
            )));
        }
        Ok(())
    }

    fn require_write(&self) -> Result<()> {
        if self.file.is_none() {
            return Err(EngineError::HandleClosed);
        }
        if !self.mode.can_write() {
            return Err(EngineError::PermissionDenied(format!(
                "{} opened read-only",
                self.path.display()
            )));
        }
        Ok(())
    }
}

impl Drop for FileHandle {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            log::warn!("Flush on drop failed for {}: {}", self.path.display(), e);
        }
    }
}
