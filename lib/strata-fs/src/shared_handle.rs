//! Shares one open byte source between the adapter constructed over it and
//! every handle that adapter opens, without handing out multiple owners.

use std::fmt;
use std::io::{self, Read, Seek, SeekFrom};
use std::sync::{Arc, Mutex};

use crate::{DirEntry, Metadata, Result, VirtualEntry};

/// A cloneable wrapper around a boxed [`VirtualEntry`].
///
/// Container adapters accept any object satisfying read + seek as backing
/// storage; wrapping the previous segment's handle in a `SharedHandle` lets
/// the adapter and all of its open handles read from the same source. The
/// positioned reads ([`SharedHandle::read_at`], [`SharedHandle::read_exact_at`])
/// take the lock once, so two holders cannot interleave between the seek and
/// the read.
#[derive(Clone)]
pub struct SharedHandle {
    inner: Arc<Mutex<Box<dyn VirtualEntry + Send>>>,
}

impl fmt::Debug for SharedHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedHandle").finish_non_exhaustive()
    }
}

impl SharedHandle {
    pub fn new(inner: Box<dyn VirtualEntry + Send>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(inner)),
        }
    }

    /// Reads up to `buf.len()` bytes at `offset` as a single locked
    /// operation, returning how many bytes were read.
    pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        let mut inner = self.inner.lock().unwrap();
        inner.seek(SeekFrom::Start(offset))?;
        let mut total = 0;
        while total < buf.len() {
            match inner.read(&mut buf[total..]) {
                Ok(0) => break,
                Ok(n) => total += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(total)
    }

    /// Like [`SharedHandle::read_at`] but fails with `UnexpectedEof` unless
    /// the buffer is filled completely.
    pub fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        let n = self.read_at(offset, buf)?;
        if n != buf.len() {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("short read: wanted {} bytes at offset {offset}, got {n}", buf.len()),
            ));
        }
        Ok(())
    }

    /// Total size of the backing object, from its own metadata.
    pub fn len(&self) -> Result<u64> {
        Ok(self.metadata()?.len)
    }
}

impl Read for SharedHandle {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut inner = self.inner.lock().unwrap();
        inner.read(buf)
    }
}

impl Seek for SharedHandle {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let mut inner = self.inner.lock().unwrap();
        inner.seek(pos)
    }
}

impl VirtualEntry for SharedHandle {
    fn metadata(&self) -> Result<Metadata> {
        let inner = self.inner.lock().unwrap();
        inner.metadata()
    }

    fn read_dir(&mut self, limit: Option<usize>) -> Result<Vec<DirEntry>> {
        let mut inner = self.inner.lock().unwrap();
        inner.read_dir(limit)
    }
}

impl From<Box<dyn VirtualEntry + Send>> for SharedHandle {
    fn from(val: Box<dyn VirtualEntry + Send>) -> Self {
        SharedHandle::new(val)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{AdapterKind, BufferedFile, FileType};

    fn buffered(data: &[u8]) -> SharedHandle {
        let metadata = Metadata {
            name: "blob".to_string(),
            ft: FileType::new_file(),
            len: data.len() as u64,
            ..Default::default()
        };
        SharedHandle::new(Box::new(BufferedFile::new(
            AdapterKind::Host,
            metadata,
            data.to_vec(),
        )))
    }

    #[test]
    fn positioned_reads_do_not_disturb_each_other() {
        let handle = buffered(b"0123456789");
        let clone = handle.clone();

        let mut a = [0u8; 4];
        let mut b = [0u8; 4];
        handle.read_exact_at(0, &mut a).unwrap();
        clone.read_exact_at(6, &mut b).unwrap();
        assert_eq!(&a, b"0123");
        assert_eq!(&b, b"6789");
    }

    #[test]
    fn read_at_clamps_at_end_of_source() {
        let handle = buffered(b"abc");
        let mut buf = [0u8; 8];
        let n = handle.read_at(1, &mut buf).unwrap();
        assert_eq!(n, 2);
        assert_eq!(&buf[..n], b"bc");

        let mut exact = [0u8; 8];
        let err = handle.read_exact_at(0, &mut exact).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }
}
