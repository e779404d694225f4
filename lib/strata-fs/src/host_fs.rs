//! Adapter over the live operating-system filesystem.
//!
//! The host adapter is the root of every resolution chain and the only one
//! constructed without backing storage. Like everything else in this crate
//! it is strictly read-only: files are opened without write access and no
//! mutating operations exist in the contract.

use std::fs;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::trace;

use crate::{
    AdapterKind, DirEntry, FileSystem, FileType, FsError, Metadata, Result, VirtualEntry,
};

#[derive(Clone, Debug, Default)]
pub struct HostFileSystem;

impl HostFileSystem {
    pub fn new() -> Self {
        Self
    }
}

impl FileSystem for HostFileSystem {
    fn open(&self, path: &Path) -> Result<Box<dyn VirtualEntry + Send>> {
        let meta = fs::metadata(path).map_err(|e| host_error(path, e))?;
        trace!(path = %path.display(), dir = meta.is_dir(), "host open");
        if meta.is_dir() {
            Ok(Box::new(HostDir {
                path: path.to_path_buf(),
            }))
        } else {
            let file = fs::OpenOptions::new()
                .read(true)
                .open(path)
                .map_err(|e| host_error(path, e))?;
            Ok(Box::new(HostFile {
                inner: file,
                path: path.to_path_buf(),
            }))
        }
    }

    // Cheaper than the open-then-stat default.
    fn metadata(&self, path: &Path) -> Result<Metadata> {
        let meta = fs::metadata(path).map_err(|e| host_error(path, e))?;
        Ok(translate_metadata(entry_name(path), &meta))
    }
}

fn host_error(path: &Path, err: io::Error) -> FsError {
    if err.kind() == io::ErrorKind::NotFound {
        FsError::NotFound {
            kind: AdapterKind::Host,
            path: path.display().to_string(),
        }
    } else {
        FsError::Io(err)
    }
}

fn entry_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

fn nanos_since_epoch(time: io::Result<SystemTime>) -> u64 {
    time.ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map_or(0, |d| d.as_nanos() as u64)
}

fn translate_metadata(name: String, meta: &fs::Metadata) -> Metadata {
    let mode = {
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            meta.permissions().mode()
        }
        #[cfg(not(unix))]
        {
            0
        }
    };

    Metadata {
        name,
        ft: FileType {
            dir: meta.is_dir(),
            file: meta.is_file(),
            symlink: meta.file_type().is_symlink(),
        },
        len: meta.len(),
        mode,
        accessed: nanos_since_epoch(meta.accessed()),
        created: nanos_since_epoch(meta.created()),
        modified: nanos_since_epoch(meta.modified()),
    }
}

/// A thin wrapper around `std::fs::File`, opened read-only.
#[derive(Debug)]
pub struct HostFile {
    inner: fs::File,
    path: PathBuf,
}

impl Read for HostFile {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.read(buf)
    }
}

impl Seek for HostFile {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.inner.seek(pos)
    }
}

impl VirtualEntry for HostFile {
    fn metadata(&self) -> Result<Metadata> {
        let meta = self.inner.metadata().map_err(|e| host_error(&self.path, e))?;
        Ok(translate_metadata(entry_name(&self.path), &meta))
    }

    fn read_dir(&mut self, _limit: Option<usize>) -> Result<Vec<DirEntry>> {
        Err(FsError::NotADirectory {
            kind: AdapterKind::Host,
            path: self.path.display().to_string(),
        })
    }
}

/// A directory handle that lists lazily from the OS on demand.
#[derive(Debug)]
pub struct HostDir {
    path: PathBuf,
}

impl Read for HostDir {
    fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
        Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "can not read bytes from a directory",
        ))
    }
}

impl Seek for HostDir {
    fn seek(&mut self, _pos: SeekFrom) -> io::Result<u64> {
        Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "can not seek a directory",
        ))
    }
}

impl VirtualEntry for HostDir {
    fn metadata(&self) -> Result<Metadata> {
        let meta = fs::metadata(&self.path).map_err(|e| host_error(&self.path, e))?;
        Ok(translate_metadata(entry_name(&self.path), &meta))
    }

    fn read_dir(&mut self, limit: Option<usize>) -> Result<Vec<DirEntry>> {
        let read_dir = fs::read_dir(&self.path).map_err(|e| host_error(&self.path, e))?;
        let mut entries = Vec::new();
        for entry in read_dir {
            let entry = entry.map_err(FsError::Io)?;
            let meta = entry.metadata().map_err(FsError::Io)?;
            let name = entry.file_name().to_string_lossy().into_owned();
            entries.push(DirEntry {
                metadata: translate_metadata(name.clone(), &meta),
                name,
            });
            if limit.is_some_and(|n| entries.len() >= n) {
                break;
            }
        }
        Ok(entries)
    }
}
