//! Pluggable storage for persisted frames.
//!
//! A [`Backend`] turns a path into a [`Stream`]; a stream is ordinary
//! `Read + Write + Seek` plus truncation and an explicit close.  The
//! container only ever talks to these traits, so a frame can live on
//! disk ([`FileBackend`]), in process memory ([`mem::MemBackend`]) or
//! anywhere else a caller implements them.

pub mod mem;

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;

pub use mem::MemBackend;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    /// Existing object, read only.
    Read,
    /// Existing object, read and write.
    ReadWrite,
    /// Create or truncate, read and write.
    Create,
}

pub trait Stream: Read + Write + Seek + Send {
    /// Resize the underlying object to exactly `len` bytes.
    fn truncate(&mut self, len: u64) -> io::Result<()>;

    /// Flush everything and release the object.
    fn close(&mut self) -> io::Result<()> {
        self.flush()
    }

    fn tell(&mut self) -> io::Result<u64> {
        self.stream_position()
    }

    /// Read exactly `buf.len()` bytes at `offset`.
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        self.seek(SeekFrom::Start(offset))?;
        self.read_exact(buf)
    }
}

pub trait Backend: Send + Sync {
    fn name(&self) -> &str;
    fn open(&self, path: &Path, mode: OpenMode) -> io::Result<Box<dyn Stream>>;
    fn remove(&self, path: &Path) -> io::Result<()>;
    fn exists(&self, path: &Path) -> bool;
}

// ── Files ────────────────────────────────────────────────────────────────────

/// Plain files through `std::fs`.
#[derive(Debug, Clone, Copy, Default)]
pub struct FileBackend;

impl Stream for File {
    fn truncate(&mut self, len: u64) -> io::Result<()> {
        self.set_len(len)
    }

    fn close(&mut self) -> io::Result<()> {
        self.flush()?;
        self.sync_all()
    }
}

impl Backend for FileBackend {
    fn name(&self) -> &str {
        "file"
    }

    fn open(&self, path: &Path, mode: OpenMode) -> io::Result<Box<dyn Stream>> {
        let mut opts = OpenOptions::new();
        match mode {
            OpenMode::Read      => opts.read(true),
            OpenMode::ReadWrite => opts.read(true).write(true),
            OpenMode::Create    => opts.read(true).write(true).create(true).truncate(true),
        };
        Ok(Box::new(opts.open(path)?))
    }

    fn remove(&self, path: &Path) -> io::Result<()> {
        fs::remove_file(path)
    }

    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_stream_truncates_and_reads_at_offsets() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("frame.bin");
        let backend = FileBackend;
        let mut s = backend.open(&path, OpenMode::Create).unwrap();
        s.write_all(b"0123456789").unwrap();
        assert_eq!(s.tell().unwrap(), 10);
        s.truncate(4).unwrap();
        s.close().unwrap();
        drop(s);

        let mut s = backend.open(&path, OpenMode::Read).unwrap();
        let mut buf = [0u8; 2];
        s.read_at(2, &mut buf).unwrap();
        assert_eq!(&buf, b"23");
        assert!(s.read_at(3, &mut buf).is_err());
        drop(s);

        assert!(backend.exists(&path));
        backend.remove(&path).unwrap();
        assert!(!backend.exists(&path));
        assert!(backend.open(&path, OpenMode::Read).is_err());
    }
}
