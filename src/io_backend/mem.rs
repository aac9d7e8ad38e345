use std::collections::HashMap;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use super::{Backend, OpenMode, Stream};

type Object = Arc<Mutex<Vec<u8>>>;

/// Named byte buffers held in process memory.  Clones share the same
/// namespace.
#[derive(Debug, Clone, Default)]
pub struct MemBackend {
    objects: Arc<Mutex<HashMap<PathBuf, Object>>>,
}

impl MemBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn keys(&self) -> Vec<PathBuf> {
        let objects = self.objects.lock().unwrap_or_else(|e| e.into_inner());
        let mut keys: Vec<PathBuf> = objects.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Copy of the bytes stored under `path`.
    pub fn contents(&self, path: &Path) -> Option<Vec<u8>> {
        let objects = self.objects.lock().unwrap_or_else(|e| e.into_inner());
        objects.get(path).map(|o| o.lock().unwrap_or_else(|e| e.into_inner()).clone())
    }
}

pub struct MemStream {
    data: Object,
    pos:  u64,
}

impl Read for MemStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let data  = self.data.lock().unwrap_or_else(|e| e.into_inner());
        let start = (self.pos as usize).min(data.len());
        let n     = buf.len().min(data.len() - start);
        buf[..n].copy_from_slice(&data[start..start + n]);
        self.pos += n as u64;
        Ok(n)
    }
}

impl Write for MemStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut data = self.data.lock().unwrap_or_else(|e| e.into_inner());
        let start = self.pos as usize;
        let end   = start + buf.len();
        if data.len() < end {
            data.resize(end, 0);
        }
        data[start..end].copy_from_slice(buf);
        self.pos = end as u64;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Seek for MemStream {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let len = self.data.lock().unwrap_or_else(|e| e.into_inner()).len() as i128;
        let target = match pos {
            SeekFrom::Start(n)   => i128::from(n),
            SeekFrom::End(d)     => len + i128::from(d),
            SeekFrom::Current(d) => i128::from(self.pos) + i128::from(d),
        };
        if target < 0 {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "seek before start"));
        }
        self.pos = target as u64;
        Ok(self.pos)
    }
}

impl Stream for MemStream {
    fn truncate(&mut self, len: u64) -> io::Result<()> {
        self.data.lock().unwrap_or_else(|e| e.into_inner()).resize(len as usize, 0);
        Ok(())
    }
}

impl Backend for MemBackend {
    fn name(&self) -> &str {
        "memory"
    }

    fn open(&self, path: &Path, mode: OpenMode) -> io::Result<Box<dyn Stream>> {
        let mut objects = self.objects.lock().unwrap_or_else(|e| e.into_inner());
        let data = match mode {
            OpenMode::Create => {
                let obj: Object = Arc::default();
                objects.insert(path.to_path_buf(), Arc::clone(&obj));
                obj
            }
            OpenMode::Read | OpenMode::ReadWrite => objects
                .get(path)
                .cloned()
                .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, format!("{} not found", path.display())))?,
        };
        Ok(Box::new(MemStream { data, pos: 0 }))
    }

    fn remove(&self, path: &Path) -> io::Result<()> {
        let mut objects = self.objects.lock().unwrap_or_else(|e| e.into_inner());
        objects
            .remove(path)
            .map(|_| ())
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, format!("{} not found", path.display())))
    }

    fn exists(&self, path: &Path) -> bool {
        self.objects.lock().unwrap_or_else(|e| e.into_inner()).contains_key(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn streams_share_the_named_object() {
        let backend = MemBackend::new();
        let path = Path::new("a/b.frame");
        let mut w = backend.open(path, OpenMode::Create).unwrap();
        w.write_all(b"hello world").unwrap();
        w.seek(SeekFrom::Start(6)).unwrap();
        w.write_all(b"W").unwrap();

        let mut r = backend.open(path, OpenMode::Read).unwrap();
        let mut s = String::new();
        r.read_to_string(&mut s).unwrap();
        assert_eq!(s, "hello World");

        w.truncate(5).unwrap();
        assert_eq!(backend.contents(path).unwrap(), b"hello");
        assert_eq!(backend.keys(), vec![PathBuf::from("a/b.frame")]);

        backend.remove(path).unwrap();
        assert!(backend.open(path, OpenMode::Read).is_err());
        assert!(backend.remove(path).is_err());
    }
}
