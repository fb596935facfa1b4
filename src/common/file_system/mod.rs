#[cfg(unix)]
mod posix_file;
mod reader;
mod writer;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::common::{Error, Result};
use async_trait::async_trait;
#[cfg(unix)]
pub use posix_file::SyncPosixFileSystem;
pub use reader::{RandomAccessFileReader, SequentialFileReader};
pub use writer::WritableFileWriter;

#[async_trait]
pub trait RandomAccessFile: 'static + Send + Sync {
    /// Reads up to `data.len()` bytes starting at `offset`. Returns the number
    /// of bytes read; short reads only happen at end of file.
    async fn read(&self, offset: usize, data: &mut [u8]) -> Result<usize>;
    fn file_size(&self) -> usize;
}

#[async_trait]
pub trait WritableFile: Send {
    async fn append(&mut self, data: &[u8]) -> Result<()>;
    fn truncate(&mut self, offset: u64) -> Result<()>;
    async fn sync(&mut self) -> Result<()>;
}

#[async_trait]
pub trait SequentialFile: Send {
    async fn read_sequential(&mut self, data: &mut [u8]) -> Result<usize>;
    fn get_file_size(&self) -> usize;
}

pub trait FileSystem: Send + Sync {
    fn open_writable_file(&self, path: PathBuf) -> Result<Box<WritableFileWriter>>;
    fn open_random_access_file(&self, path: PathBuf) -> Result<Box<RandomAccessFileReader>>;
    fn open_sequential_file(&self, path: PathBuf) -> Result<Box<SequentialFileReader>>;
    fn remove(&self, path: PathBuf) -> Result<()>;
    fn rename(&self, origin: PathBuf, target: PathBuf) -> Result<()>;
    fn file_exist(&self, path: &Path) -> Result<bool>;
    fn list_files(&self, dir: PathBuf) -> Result<Vec<PathBuf>>;
    fn create_dir(&self, dir: &Path) -> Result<()>;
    fn read_file_content(&self, path: PathBuf) -> Result<Vec<u8>>;
    /// Takes an exclusive advisory lock; fails if another process holds it.
    fn lock_file(&self, path: PathBuf) -> Result<FileLock>;
}

/// Exclusive lock on the `LOCK` file; released on drop.
pub struct FileLock {
    file: Option<std::fs::File>,
}

impl FileLock {
    pub fn acquire(path: &Path) -> Result<Self> {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .open(path)?;
        #[cfg(unix)]
        {
            use std::os::unix::io::AsRawFd;
            let ret = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
            if ret != 0 {
                return Err(Error::Io(Box::new(std::io::Error::last_os_error())));
            }
        }
        Ok(FileLock { file: Some(file) })
    }

    fn unlocked() -> Self {
        FileLock { file: None }
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        #[cfg(unix)]
        if let Some(file) = self.file.take() {
            use std::os::unix::io::AsRawFd;
            unsafe {
                libc::flock(file.as_raw_fd(), libc::LOCK_UN);
            }
        }
    }
}

#[derive(Default)]
struct InMemFileSystemRep {
    files: HashMap<PathBuf, Vec<u8>>,
}

/// A filesystem kept entirely in memory. Writes land in the shared map as
/// they are appended, so a reopened "file" observes everything written even
/// without a sync, the way an OS page cache would across a process restart.
#[derive(Default, Clone)]
pub struct InMemFileSystem {
    inner: Arc<Mutex<InMemFileSystemRep>>,
}

struct InMemWritableFile {
    fs: Arc<Mutex<InMemFileSystemRep>>,
    path: PathBuf,
}

#[async_trait]
impl WritableFile for InMemWritableFile {
    async fn append(&mut self, data: &[u8]) -> Result<()> {
        let mut fs = self.fs.lock().unwrap();
        fs.files
            .get_mut(&self.path)
            .ok_or(Error::DbClosed)?
            .extend_from_slice(data);
        Ok(())
    }

    fn truncate(&mut self, offset: u64) -> Result<()> {
        let mut fs = self.fs.lock().unwrap();
        fs.files
            .get_mut(&self.path)
            .ok_or(Error::DbClosed)?
            .truncate(offset as usize);
        Ok(())
    }

    async fn sync(&mut self) -> Result<()> {
        Ok(())
    }
}

struct InMemReadableFile {
    buf: Vec<u8>,
}

#[async_trait]
impl RandomAccessFile for InMemReadableFile {
    async fn read(&self, offset: usize, data: &mut [u8]) -> Result<usize> {
        if offset >= self.buf.len() {
            return Ok(0);
        }
        let n = std::cmp::min(data.len(), self.buf.len() - offset);
        data[..n].copy_from_slice(&self.buf[offset..(offset + n)]);
        Ok(n)
    }

    fn file_size(&self) -> usize {
        self.buf.len()
    }
}

struct InMemSequentialFile {
    buf: Vec<u8>,
    offset: usize,
}

#[async_trait]
impl SequentialFile for InMemSequentialFile {
    async fn read_sequential(&mut self, data: &mut [u8]) -> Result<usize> {
        if self.offset >= self.buf.len() {
            return Ok(0);
        }
        let n = std::cmp::min(data.len(), self.buf.len() - self.offset);
        data[..n].copy_from_slice(&self.buf[self.offset..(self.offset + n)]);
        self.offset += n;
        Ok(n)
    }

    fn get_file_size(&self) -> usize {
        self.buf.len()
    }
}

impl FileSystem for InMemFileSystem {
    fn open_writable_file(&self, path: PathBuf) -> Result<Box<WritableFileWriter>> {
        let mut fs = self.inner.lock().unwrap();
        fs.files.insert(path.clone(), vec![]);
        let f = InMemWritableFile {
            fs: self.inner.clone(),
            path: path.clone(),
        };
        Ok(Box::new(WritableFileWriter::new(
            Box::new(f),
            path.to_string_lossy().to_string(),
        )))
    }

    fn open_random_access_file(&self, path: PathBuf) -> Result<Box<RandomAccessFileReader>> {
        let fs = self.inner.lock().unwrap();
        let buf = fs
            .files
            .get(&path)
            .ok_or_else(|| Error::InvalidFile(format!("file {:?} not exists", path)))?
            .clone();
        Ok(Box::new(RandomAccessFileReader::new(
            Box::new(InMemReadableFile { buf }),
            path.to_string_lossy().to_string(),
        )))
    }

    fn open_sequential_file(&self, path: PathBuf) -> Result<Box<SequentialFileReader>> {
        let fs = self.inner.lock().unwrap();
        let buf = fs
            .files
            .get(&path)
            .ok_or_else(|| Error::InvalidFile(format!("file {:?} not exists", path)))?
            .clone();
        Ok(Box::new(SequentialFileReader::new(
            Box::new(InMemSequentialFile { buf, offset: 0 }),
            path.to_string_lossy().to_string(),
        )))
    }

    fn remove(&self, path: PathBuf) -> Result<()> {
        let mut fs = self.inner.lock().unwrap();
        fs.files.remove(&path);
        Ok(())
    }

    fn rename(&self, origin: PathBuf, target: PathBuf) -> Result<()> {
        let mut fs = self.inner.lock().unwrap();
        let buf = fs
            .files
            .remove(&origin)
            .ok_or_else(|| Error::InvalidFile(format!("file {:?} not exists", origin)))?;
        fs.files.insert(target, buf);
        Ok(())
    }

    fn file_exist(&self, path: &Path) -> Result<bool> {
        let fs = self.inner.lock().unwrap();
        Ok(fs.files.contains_key(path))
    }

    fn list_files(&self, dir: PathBuf) -> Result<Vec<PathBuf>> {
        let fs = self.inner.lock().unwrap();
        Ok(fs
            .files
            .keys()
            .filter(|p| p.parent() == Some(dir.as_path()))
            .cloned()
            .collect())
    }

    fn create_dir(&self, _dir: &Path) -> Result<()> {
        Ok(())
    }

    fn read_file_content(&self, path: PathBuf) -> Result<Vec<u8>> {
        let fs = self.inner.lock().unwrap();
        fs.files
            .get(&path)
            .cloned()
            .ok_or_else(|| Error::InvalidFile(format!("file {:?} not exists", path)))
    }

    fn lock_file(&self, _path: PathBuf) -> Result<FileLock> {
        Ok(FileLock::unlocked())
    }
}
