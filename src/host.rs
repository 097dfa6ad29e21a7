//! Host-services capability: the only door through which the engine touches
//! the outside world. Modeled after `sysdep_posix.c` / `sysdep_dispatch_t`:
//! every engine operation that needs to open a file, move a cursor, read,
//! write, or allocate memory goes through a [`HostServices`] implementation
//! instead of calling into `std::fs` or the global allocator directly. This
//! is what lets the same engine run against a real filesystem (`StdHost`),
//! or an in-memory harness (`MockHost`) for tests and no-filesystem targets.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Mirrors `sysdep_open_mode_t`. `ReadOnly` disables all writes and overlay
/// synthesis; anything `>= ReadWrite` enables overlay open/create.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    None,
    ReadOnly,
    ReadWrite,
    WriteOnly,
    ReadWriteCreate,
}

impl OpenMode {
    pub fn allows_write(self) -> bool {
        !matches!(self, OpenMode::None | OpenMode::ReadOnly)
    }
}

/// Mirrors `sysdep_whence_t`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Whence {
    Absolute,
    Relative,
    End,
}

fn seek_from(whence: Whence, offset: i64) -> SeekFrom {
    match whence {
        Whence::Absolute => SeekFrom::Start(offset as u64),
        Whence::Relative => SeekFrom::Current(offset),
        Whence::End => SeekFrom::End(offset),
    }
}

/// The capability set the engine is written against. Every method returns
/// `io::Result`, so `io::ErrorKind` carries the engine's entire error taxonomy
/// instead of a bespoke error enum.
///
/// `allocate`/`free` are explicit, separate from plain `Vec::new`/drop, so
/// that a counting implementation (see [`MockHost`]) can assert that every
/// heap buffer the engine owns (bitmap, prefix-sum table, scratch block) is
/// released on every code path, including failure paths of `open`/`verify`.
pub trait HostServices {
    type File;

    fn open(&self, path: &Path, mode: OpenMode) -> io::Result<Self::File>;
    fn close(&self, file: Self::File) -> io::Result<()>;
    fn seek(&self, file: &mut Self::File, offset: i64, whence: Whence) -> io::Result<u64>;
    fn read(&self, file: &mut Self::File, buf: &mut [u8]) -> io::Result<usize>;
    fn write(&self, file: &mut Self::File, buf: &[u8]) -> io::Result<usize>;
    fn file_size(&self, file: &mut Self::File) -> io::Result<u64>;

    fn allocate(&self, bytes: usize) -> io::Result<Vec<u8>>;
    fn free(&self, buf: Vec<u8>);

    /// Read exactly `buf.len()` bytes; a short read is an I/O error, matching
    /// `posix_read`'s `*nr == len ? 0 : errno` contract.
    fn read_exact(&self, file: &mut Self::File, buf: &mut [u8]) -> io::Result<()> {
        let n = self.read(file, buf)?;
        if n != buf.len() {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "short read from host file",
            ));
        }
        Ok(())
    }

    /// Write exactly `buf.len()` bytes; a short write is an I/O error,
    /// matching `posix_write`'s contract.
    fn write_all(&self, file: &mut Self::File, buf: &[u8]) -> io::Result<()> {
        let n = self.write(file, buf)?;
        if n != buf.len() {
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                "short write to host file",
            ));
        }
        Ok(())
    }
}

/// POSIX-backed host, grounded directly in `sysdep_posix.c`.
#[derive(Debug, Default, Clone, Copy)]
pub struct StdHost;

impl HostServices for StdHost {
    type File = File;

    fn open(&self, path: &Path, mode: OpenMode) -> io::Result<File> {
        let mut opts = OpenOptions::new();
        match mode {
            OpenMode::None => return Err(io::Error::from(io::ErrorKind::InvalidInput)),
            OpenMode::ReadOnly => {
                opts.read(true);
            }
            OpenMode::ReadWrite => {
                opts.read(true).write(true);
            }
            OpenMode::WriteOnly => {
                opts.write(true);
            }
            OpenMode::ReadWriteCreate => {
                opts.read(true).write(true).create(true);
            }
        }
        opts.open(path)
    }

    fn close(&self, file: File) -> io::Result<()> {
        drop(file);
        Ok(())
    }

    fn seek(&self, file: &mut File, offset: i64, whence: Whence) -> io::Result<u64> {
        file.seek(seek_from(whence, offset))
    }

    fn read(&self, file: &mut File, buf: &mut [u8]) -> io::Result<usize> {
        file.read(buf)
    }

    fn write(&self, file: &mut File, buf: &[u8]) -> io::Result<usize> {
        file.write(buf)
    }

    fn file_size(&self, file: &mut File) -> io::Result<u64> {
        let meta_len = file.metadata()?.len();
        if meta_len != 0 {
            return Ok(meta_len);
        }
        // Mirrors posix_file_size's fallback: some special files report a
        // zero `st_size`, so fall back to seeking to the end and back.
        let cur = file.stream_position()?;
        let end = file.seek(SeekFrom::End(0))?;
        file.seek(SeekFrom::Start(cur))?;
        Ok(end)
    }

    fn allocate(&self, bytes: usize) -> io::Result<Vec<u8>> {
        Ok(vec![0u8; bytes])
    }

    fn free(&self, buf: Vec<u8>) {
        drop(buf);
    }
}

impl<H: HostServices> HostServices for &H {
    type File = H::File;

    fn open(&self, path: &Path, mode: OpenMode) -> io::Result<Self::File> {
        (**self).open(path, mode)
    }
    fn close(&self, file: Self::File) -> io::Result<()> {
        (**self).close(file)
    }
    fn seek(&self, file: &mut Self::File, offset: i64, whence: Whence) -> io::Result<u64> {
        (**self).seek(file, offset, whence)
    }
    fn read(&self, file: &mut Self::File, buf: &mut [u8]) -> io::Result<usize> {
        (**self).read(file, buf)
    }
    fn write(&self, file: &mut Self::File, buf: &[u8]) -> io::Result<usize> {
        (**self).write(file, buf)
    }
    fn file_size(&self, file: &mut Self::File) -> io::Result<u64> {
        (**self).file_size(file)
    }
    fn allocate(&self, bytes: usize) -> io::Result<Vec<u8>> {
        (**self).allocate(bytes)
    }
    fn free(&self, buf: Vec<u8>) {
        (**self).free(buf)
    }
}

/// Identifies an in-memory file managed by [`MockHost`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MockFileId(u64);

struct MockFile {
    path: PathBuf,
    data: Vec<u8>,
    cursor: u64,
}

/// In-memory host for tests and for embedding the engine where no
/// filesystem is available. Also counts outstanding `allocate`/`free` calls
/// so tests can assert the engine leaks nothing (testable property 5).
#[derive(Default)]
pub struct MockHost {
    files: std::cell::RefCell<HashMap<MockFileId, MockFile>>,
    by_path: std::cell::RefCell<HashMap<PathBuf, Vec<u8>>>,
    next_id: std::cell::Cell<u64>,
    outstanding_allocations: std::cell::Cell<i64>,
}

impl MockHost {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a file's contents before opening it, as if it already existed on
    /// disk.
    pub fn seed(&self, path: impl Into<PathBuf>, contents: Vec<u8>) {
        self.by_path.borrow_mut().insert(path.into(), contents);
    }

    /// Read back a file's current contents (used by tests to assert on
    /// overlay durability across `close`/reopen).
    pub fn contents(&self, path: impl AsRef<Path>) -> Option<Vec<u8>> {
        self.by_path.borrow().get(path.as_ref()).cloned()
    }

    /// Net outstanding `allocate` calls not yet matched by `free`. Should be
    /// zero once a context has been fully closed, including after a failed
    /// `open`/`verify`.
    pub fn outstanding_allocations(&self) -> i64 {
        self.outstanding_allocations.get()
    }
}

impl HostServices for MockHost {
    type File = MockFileId;

    fn open(&self, path: &Path, mode: OpenMode) -> io::Result<MockFileId> {
        let existing = self.by_path.borrow().get(path).cloned();
        let data = match (existing, mode) {
            (Some(data), _) => data,
            (None, OpenMode::ReadWriteCreate) | (None, OpenMode::WriteOnly) => Vec::new(),
            (None, _) => return Err(io::Error::from(io::ErrorKind::NotFound)),
        };
        let id = MockFileId(self.next_id.get());
        self.next_id.set(id.0 + 1);
        self.files.borrow_mut().insert(
            id,
            MockFile {
                path: path.to_path_buf(),
                data,
                cursor: 0,
            },
        );
        Ok(id)
    }

    fn close(&self, file: MockFileId) -> io::Result<()> {
        let removed = self
            .files
            .borrow_mut()
            .remove(&file)
            .ok_or_else(|| io::Error::from(io::ErrorKind::InvalidInput))?;
        self.by_path
            .borrow_mut()
            .insert(removed.path, removed.data);
        Ok(())
    }

    fn seek(&self, file: &mut MockFileId, offset: i64, whence: Whence) -> io::Result<u64> {
        let mut files = self.files.borrow_mut();
        let f = files
            .get_mut(file)
            .ok_or_else(|| io::Error::from(io::ErrorKind::InvalidInput))?;
        let new_pos = match whence {
            Whence::Absolute => offset,
            Whence::Relative => f.cursor as i64 + offset,
            Whence::End => f.data.len() as i64 + offset,
        };
        if new_pos < 0 {
            return Err(io::Error::from(io::ErrorKind::InvalidInput));
        }
        f.cursor = new_pos as u64;
        Ok(f.cursor)
    }

    fn read(&self, file: &mut MockFileId, buf: &mut [u8]) -> io::Result<usize> {
        let mut files = self.files.borrow_mut();
        let f = files
            .get_mut(file)
            .ok_or_else(|| io::Error::from(io::ErrorKind::InvalidInput))?;
        let start = f.cursor as usize;
        if start >= f.data.len() {
            return Ok(0);
        }
        let end = (start + buf.len()).min(f.data.len());
        let n = end - start;
        buf[..n].copy_from_slice(&f.data[start..end]);
        f.cursor += n as u64;
        Ok(n)
    }

    fn write(&self, file: &mut MockFileId, buf: &[u8]) -> io::Result<usize> {
        let mut files = self.files.borrow_mut();
        let f = files
            .get_mut(file)
            .ok_or_else(|| io::Error::from(io::ErrorKind::InvalidInput))?;
        let start = f.cursor as usize;
        let end = start + buf.len();
        if f.data.len() < end {
            f.data.resize(end, 0);
        }
        f.data[start..end].copy_from_slice(buf);
        f.cursor = end as u64;
        Ok(buf.len())
    }

    fn file_size(&self, file: &mut MockFileId) -> io::Result<u64> {
        let files = self.files.borrow();
        let f = files
            .get(file)
            .ok_or_else(|| io::Error::from(io::ErrorKind::InvalidInput))?;
        Ok(f.data.len() as u64)
    }

    fn allocate(&self, bytes: usize) -> io::Result<Vec<u8>> {
        self.outstanding_allocations.set(self.outstanding_allocations.get() + 1);
        Ok(vec![0u8; bytes])
    }

    fn free(&self, buf: Vec<u8>) {
        self.outstanding_allocations.set(self.outstanding_allocations.get() - 1);
        drop(buf);
    }
}
