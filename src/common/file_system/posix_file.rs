use std::io::Result as IoResult;
use std::os::unix::io::RawFd;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use nix::errno::Errno;
use nix::fcntl::{self, OFlag};
use nix::sys::stat::Mode;
use nix::sys::uio::{pread, pwrite};
use nix::unistd::{close, ftruncate, lseek, Whence};
use nix::NixPath;

use crate::common::file_system::reader::SequentialFileReader;
use crate::common::file_system::FileLock;
use crate::common::{
    Error, FileSystem, RandomAccessFile, RandomAccessFileReader, Result, SequentialFile,
    WritableFile, WritableFileWriter,
};

/// A thin RAII wrapper around a raw file descriptor for UNIX-based systems.
pub struct RawFile(RawFd);

pub fn from_nix_error(e: nix::Error, custom: &'static str) -> std::io::Error {
    let kind = std::io::Error::from(e).kind();
    std::io::Error::new(kind, custom)
}

impl RawFile {
    pub fn open_for_read<P: ?Sized + NixPath>(path: &P) -> IoResult<Self> {
        let flags = OFlag::O_RDONLY;
        // Permission 644
        let mode = Mode::S_IRUSR | Mode::S_IWUSR | Mode::S_IRGRP | Mode::S_IROTH;
        Ok(RawFile(
            fcntl::open(path, flags, mode).map_err(|e| from_nix_error(e, "open"))?,
        ))
    }

    pub fn create<P: ?Sized + NixPath>(path: &P) -> IoResult<Self> {
        let flags = OFlag::O_RDWR | OFlag::O_CREAT | OFlag::O_TRUNC;
        // Permission 644
        let mode = Mode::S_IRUSR | Mode::S_IWUSR | Mode::S_IRGRP | Mode::S_IROTH;
        let fd = fcntl::open(path, flags, mode).map_err(|e| from_nix_error(e, "open"))?;
        Ok(RawFile(fd))
    }

    pub fn close(&self) -> IoResult<()> {
        close(self.0).map_err(|e| from_nix_error(e, "close"))
    }

    pub fn sync(&self) -> IoResult<()> {
        #[cfg(target_os = "linux")]
        {
            nix::unistd::fdatasync(self.0).map_err(|e| from_nix_error(e, "fdatasync"))
        }
        #[cfg(not(target_os = "linux"))]
        {
            nix::unistd::fsync(self.0).map_err(|e| from_nix_error(e, "fsync"))
        }
    }

    pub fn read(&self, mut offset: usize, buf: &mut [u8]) -> IoResult<usize> {
        let mut readed = 0;
        while readed < buf.len() {
            let bytes = match pread(self.0, &mut buf[readed..], offset as i64) {
                Ok(bytes) => bytes,
                Err(e) if e == Errno::EAGAIN => continue,
                Err(e) => return Err(from_nix_error(e, "pread")),
            };
            // EOF
            if bytes == 0 {
                break;
            }
            readed += bytes;
            offset += bytes;
        }
        Ok(readed)
    }

    pub fn write(&self, mut offset: usize, content: &[u8]) -> IoResult<usize> {
        let mut written = 0;
        while written < content.len() {
            let bytes = match pwrite(self.0, &content[written..], offset as i64) {
                Ok(bytes) => bytes,
                Err(e) if e == Errno::EAGAIN => continue,
                Err(e) => return Err(from_nix_error(e, "pwrite")),
            };
            if bytes == 0 {
                break;
            }
            written += bytes;
            offset += bytes;
        }
        Ok(written)
    }

    pub fn file_size(&self) -> IoResult<usize> {
        lseek(self.0, 0, Whence::SeekEnd)
            .map(|n| n as usize)
            .map_err(|e| from_nix_error(e, "lseek"))
    }

    pub fn truncate(&self, offset: usize) -> IoResult<()> {
        ftruncate(self.0, offset as i64).map_err(|e| from_nix_error(e, "ftruncate"))
    }
}

impl Drop for RawFile {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

pub struct PosixWritableFile {
    inner: Arc<RawFile>,
    offset: usize,
}

impl PosixWritableFile {
    pub fn create<P: ?Sized + NixPath>(path: &P) -> IoResult<Self> {
        let fd = RawFile::create(path)?;
        Ok(Self {
            inner: Arc::new(fd),
            offset: 0,
        })
    }
}

#[async_trait]
impl WritableFile for PosixWritableFile {
    async fn append(&mut self, data: &[u8]) -> Result<()> {
        let len = self
            .inner
            .write(self.offset, data)
            .map_err(|e| Error::Io(Box::new(e)))?;
        self.offset += len;
        Ok(())
    }

    fn truncate(&mut self, offset: u64) -> Result<()> {
        self.inner
            .truncate(offset as usize)
            .map_err(|e| Error::Io(Box::new(e)))?;
        self.offset = offset as usize;
        Ok(())
    }

    async fn sync(&mut self) -> Result<()> {
        self.inner.sync().map_err(|e| Error::Io(Box::new(e)))
    }
}

pub struct PosixReadableFile {
    inner: Arc<RawFile>,
    file_size: usize,
}

impl PosixReadableFile {
    pub fn open<P: ?Sized + NixPath>(path: &P) -> IoResult<Self> {
        let fd = RawFile::open_for_read(path)?;
        let file_size = fd.file_size()?;
        Ok(Self {
            inner: Arc::new(fd),
            file_size,
        })
    }
}

#[async_trait]
impl RandomAccessFile for PosixReadableFile {
    async fn read(&self, offset: usize, data: &mut [u8]) -> Result<usize> {
        self.inner
            .read(offset, data)
            .map_err(|e| Error::Io(Box::new(e)))
    }

    fn file_size(&self) -> usize {
        self.file_size
    }
}

pub struct PosixSequentialFile {
    inner: Arc<RawFile>,
    file_size: usize,
    offset: usize,
}

impl PosixSequentialFile {
    pub fn open<P: ?Sized + NixPath>(path: &P) -> IoResult<Self> {
        let fd = RawFile::open_for_read(path)?;
        let file_size = fd.file_size()?;
        Ok(Self {
            inner: Arc::new(fd),
            file_size,
            offset: 0,
        })
    }
}

#[async_trait]
impl SequentialFile for PosixSequentialFile {
    async fn read_sequential(&mut self, data: &mut [u8]) -> Result<usize> {
        if self.offset >= self.file_size {
            return Ok(0);
        }
        let rest = std::cmp::min(data.len(), self.file_size - self.offset);
        let x = self
            .inner
            .read(self.offset, &mut data[..rest])
            .map_err(|e| Error::Io(Box::new(e)))?;
        self.offset += x;
        Ok(x)
    }

    fn get_file_size(&self) -> usize {
        self.file_size
    }
}

pub struct SyncPosixFileSystem {}

impl FileSystem for SyncPosixFileSystem {
    fn open_writable_file(&self, path: PathBuf) -> Result<Box<WritableFileWriter>> {
        let f = PosixWritableFile::create(&path).map_err(|e| Error::Io(Box::new(e)))?;
        let writer = WritableFileWriter::new(Box::new(f), path.to_string_lossy().to_string());
        Ok(Box::new(writer))
    }

    fn open_random_access_file(&self, path: PathBuf) -> Result<Box<RandomAccessFileReader>> {
        let f = PosixReadableFile::open(&path).map_err(|e| Error::Io(Box::new(e)))?;
        let reader = RandomAccessFileReader::new(Box::new(f), path.to_string_lossy().to_string());
        Ok(Box::new(reader))
    }

    fn open_sequential_file(&self, path: PathBuf) -> Result<Box<SequentialFileReader>> {
        let f = PosixSequentialFile::open(&path).map_err(|e| Error::Io(Box::new(e)))?;
        let reader = SequentialFileReader::new(Box::new(f), path.to_string_lossy().to_string());
        Ok(Box::new(reader))
    }

    fn remove(&self, path: PathBuf) -> Result<()> {
        std::fs::remove_file(path)?;
        Ok(())
    }

    fn rename(&self, origin: PathBuf, target: PathBuf) -> Result<()> {
        std::fs::rename(origin, target)?;
        Ok(())
    }

    fn file_exist(&self, path: &Path) -> Result<bool> {
        Ok(path.exists())
    }

    fn list_files(&self, dir: PathBuf) -> Result<Vec<PathBuf>> {
        let mut files = vec![];
        for entry in std::fs::read_dir(dir)? {
            files.push(entry?.path());
        }
        Ok(files)
    }

    fn create_dir(&self, dir: &Path) -> Result<()> {
        std::fs::create_dir_all(dir)?;
        Ok(())
    }

    fn read_file_content(&self, path: PathBuf) -> Result<Vec<u8>> {
        Ok(std::fs::read(path)?)
    }

    fn lock_file(&self, path: PathBuf) -> Result<FileLock> {
        FileLock::acquire(&path)
    }
}
