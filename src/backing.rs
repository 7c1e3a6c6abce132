//! Backing store abstraction
//!
//! This module provides the [`Backing`] struct, a thin wrapper around [`std::fs::File`]
//! that stores the path of an extent file and only opens it on first access.
//!

use std::{
    fs::{File, OpenOptions},
    io::{self, Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
};

use log::debug;

/// A lazily opened file backing one extent (or a whole container).
///
/// The file handle is created the first time data is requested, so images
/// made of many extent files only consume descriptors for the extents that
/// are actually read.
#[derive(Debug)]
pub struct Backing {
    /// Location of the file on disk.
    path: PathBuf,
    /// Whether the handle must be opened with write access.
    writable: bool,
    /// The underlying file handle, `None` until first use.
    file: Option<File>,
}

impl Backing {
    /// Creates a read-only backing for `path` without touching the file system.
    pub fn new(path: impl Into<PathBuf>) -> Backing {
        Backing {
            path: path.into(),
            writable: false,
            file: None,
        }
    }

    /// Creates a backing that will be opened in read-write mode.
    pub fn writable(path: impl Into<PathBuf>) -> Backing {
        Backing {
            path: path.into(),
            writable: true,
            file: None,
        }
    }

    /// Wraps an already opened file.
    pub fn from_file(path: impl Into<PathBuf>, file: File) -> Backing {
        Backing {
            path: path.into(),
            writable: false,
            file: Some(file),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns `true` once the file handle has been opened.
    pub fn is_open(&self) -> bool {
        self.file.is_some()
    }

    /// Returns the open file handle, opening the file first if needed.
    ///
    /// # Errors
    ///
    /// Returns any [`io::Error`] produced by [`OpenOptions::open`], e.g. when the
    /// path does not exist or the process lacks sufficient permissions.
    pub fn file(&mut self) -> io::Result<&mut File> {
        if self.file.is_none() {
            debug!("Opening backing file: {}", self.path.display());
            let file = OpenOptions::new()
                .read(true)
                .write(self.writable)
                .open(&self.path)?;
            self.file = Some(file);
        }
        // Populated just above.
        self.file
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "backing file not opened"))
    }

    /// Fills `buf` with the bytes stored at byte `offset`.
    ///
    /// # Errors
    ///
    /// Fails with [`io::ErrorKind::UnexpectedEof`] if the file ends before
    /// `buf` is full, and propagates any seek or read error.
    pub fn read_exact_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        let file = self.file()?;
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(buf)
    }

    /// Writes the whole of `buf` at byte `offset`.
    pub fn write_all_at(&mut self, offset: u64, buf: &[u8]) -> io::Result<()> {
        let file = self.file()?;
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(buf)
    }

    /// Reads exactly `size` bytes starting at `pos`, which may be relative to the end of the file.
    pub fn read_header_at(&mut self, pos: SeekFrom, size: usize) -> io::Result<Vec<u8>> {
        let file = self.file()?;
        file.seek(pos)?;
        let mut buffer = vec![0u8; size];
        file.read_exact(&mut buffer)?;
        Ok(buffer)
    }

    /// Returns the current length of the file in bytes.
    pub fn len(&mut self) -> io::Result<u64> {
        Ok(self.file()?.metadata()?.len())
    }

    /// Flushes pending writes to the file system.
    pub fn flush(&mut self) -> io::Result<()> {
        match self.file.as_mut() {
            Some(file) => file.flush(),
            None => Ok(()),
        }
    }
}
