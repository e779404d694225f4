//! Read-only virtual filesystems for digital forensics.
//!
//! Every container format supported by this crate — the live OS filesystem,
//! ZIP archives, MBR/GPT partition tables, FAT16 volumes — is exposed through
//! the same [`FileSystem`] contract: open a path, stat a path, list a
//! directory. The [`RecursiveFileSystem`] composes those adapters so that a
//! single path string can cross nested container boundaries, with the
//! container type sniffed from byte signatures at each hop:
//!
//! ```no_run
//! use std::io::Read;
//! use std::path::Path;
//! use strata_fs::{FileSystem, RecursiveFileSystem};
//!
//! let fs = RecursiveFileSystem::default();
//! let mut file = fs.open(Path::new("evidence/disk.img/p0/boot.ini"))?;
//! let mut contents = Vec::new();
//! file.read_to_end(&mut contents)?;
//! # Ok::<(), strata_fs::FsError>(())
//! ```
//!
//! Everything is read-only: forensic images are static, and none of the
//! adapters expose write, rename or remove operations.

use std::fmt;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::Path;

use thiserror::Error;

pub mod detect;
pub mod disk;
pub mod fat_fs;
pub mod host_fs;
pub mod recursive_fs;
pub mod registry;
pub mod segment;
mod shared_handle;
pub mod walk;
pub mod zip_fs;

pub use detect::{FileKind, FileTypeDetector, Matcher};
pub use disk::gpt::GptFileSystem;
pub use disk::mbr::MbrFileSystem;
pub use fat_fs::Fat16FileSystem;
pub use host_fs::HostFileSystem;
pub use recursive_fs::{Item, RecursiveFileSystem};
pub use registry::{AdapterKind, AdapterRegistry};
pub use segment::{resolve, Segment};
pub use shared_handle::SharedHandle;
pub use walk::{WalkEntry, Walker};
pub use zip_fs::ZipFileSystem;

pub type Result<T> = std::result::Result<T, FsError>;

/// Error type shared by every adapter and the composition engine.
///
/// Each variant carries enough context (adapter kind, sub-path, remainder) to
/// reconstruct where in a nested-container chain resolution failed. Errors
/// are never retried: the backing images are static, so a failed read will
/// not succeed on a second attempt.
#[derive(Error, Debug)]
pub enum FsError {
    /// A malformed or unclean path was handed to an adapter.
    #[error("invalid path `{path}`: {reason}")]
    InvalidPath { path: String, reason: String },
    /// A path component does not exist under the active adapter.
    #[error("`{path}`: entry not found in {kind} filesystem")]
    NotFound { kind: AdapterKind, path: String },
    /// A directory operation was invoked on a non-directory entry.
    #[error("`{path}` is not a directory in {kind} filesystem")]
    NotADirectory { kind: AdapterKind, path: String },
    /// A leaf that is not a recognized container was asked to yield children.
    #[error(
        "`{path}` in {kind} filesystem is not a recognized container, \
         cannot resolve remaining path `{remainder}`"
    )]
    CannotResolve {
        kind: AdapterKind,
        path: String,
        remainder: String,
    },
    /// Detection matched a signature but the adapter could not parse the
    /// content behind it.
    #[error("{kind} structure at `{path}` is corrupt: {detail}")]
    Corrupt {
        kind: AdapterKind,
        path: String,
        detail: String,
    },
    /// An operation outside the read-only contract was invoked.
    #[error("`{op}` is not supported by a read-only filesystem")]
    Unsupported { op: String },
    /// Something failed while doing raw I/O against the backing storage.
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

/// The kind of an entry, as a set of flags so adapters without a concept of
/// e.g. symlinks can leave the rest zeroed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FileType {
    pub dir: bool,
    pub file: bool,
    pub symlink: bool,
}

impl FileType {
    pub fn new_dir() -> Self {
        Self {
            dir: true,
            ..Default::default()
        }
    }

    pub fn new_file() -> Self {
        Self {
            file: true,
            ..Default::default()
        }
    }

    pub fn is_dir(&self) -> bool {
        self.dir
    }

    pub fn is_file(&self) -> bool {
        self.file
    }

    pub fn is_symlink(&self) -> bool {
        self.symlink
    }
}

/// The result of a stat: times are nanoseconds since the UNIX epoch, `mode`
/// carries host permission bits where the format has them and zero elsewhere.
#[derive(Clone, Debug, Default)]
pub struct Metadata {
    pub name: String,
    pub ft: FileType,
    pub len: u64,
    pub mode: u32,
    pub accessed: u64,
    pub created: u64,
    pub modified: u64,
}

impl Metadata {
    pub fn is_dir(&self) -> bool {
        self.ft.is_dir()
    }

    pub fn is_file(&self) -> bool {
        self.ft.is_file()
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn file_type(&self) -> FileType {
        self.ft
    }

    pub fn modified(&self) -> u64 {
        self.modified
    }
}

/// One entry of a directory listing.
#[derive(Clone, Debug)]
pub struct DirEntry {
    pub name: String,
    pub metadata: Metadata,
}

impl DirEntry {
    pub fn file_type(&self) -> FileType {
        self.metadata.ft
    }
}

/// A live, open entry returned by [`FileSystem::open`].
///
/// A handle is owned by exactly one caller at a time and released by `Drop`.
/// File handles stream their bytes through `Read`/`Seek`; directory handles
/// answer `read_dir` and fail byte-level access.
pub trait VirtualEntry: fmt::Debug + Read + Seek + Send {
    fn metadata(&self) -> Result<Metadata>;

    /// Lists the children of a directory handle. `None` means unlimited;
    /// adapters make no ordering promise, the composition engine sorts.
    fn read_dir(&mut self, limit: Option<usize>) -> Result<Vec<DirEntry>>;
}

/// The contract every adapter and the composed engine implement.
///
/// All operations are read-only. `metadata` and `read_dir` are provided in
/// terms of `open`, which is the contract's definition of them; adapters with
/// a cheaper direct path may override.
pub trait FileSystem: fmt::Debug {
    fn open(&self, path: &Path) -> Result<Box<dyn VirtualEntry + Send>>;

    fn metadata(&self, path: &Path) -> Result<Metadata> {
        self.open(path)?.metadata()
    }

    fn read_dir(&self, path: &Path, limit: Option<usize>) -> Result<Vec<DirEntry>> {
        let mut entry = self.open(path)?;
        entry.read_dir(limit)
    }
}

/// A fully-buffered file handle used by container adapters whose entries are
/// decoded into memory on open (ZIP entries, FAT cluster chains).
pub(crate) struct BufferedFile {
    pub(crate) kind: AdapterKind,
    pub(crate) metadata: Metadata,
    pub(crate) data: io::Cursor<Vec<u8>>,
}

impl BufferedFile {
    pub(crate) fn new(kind: AdapterKind, metadata: Metadata, data: Vec<u8>) -> Self {
        Self {
            kind,
            metadata,
            data: io::Cursor::new(data),
        }
    }
}

impl fmt::Debug for BufferedFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferedFile")
            .field("kind", &self.kind)
            .field("name", &self.metadata.name)
            .field("len", &self.metadata.len)
            .finish()
    }
}

impl Read for BufferedFile {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.data.read(buf)
    }
}

impl Seek for BufferedFile {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.data.seek(pos)
    }
}

impl VirtualEntry for BufferedFile {
    fn metadata(&self) -> Result<Metadata> {
        Ok(self.metadata.clone())
    }

    fn read_dir(&mut self, _limit: Option<usize>) -> Result<Vec<DirEntry>> {
        Err(FsError::NotADirectory {
            kind: self.kind,
            path: self.metadata.name.clone(),
        })
    }
}

/// A directory handle over a pre-computed listing, used by container
/// adapters whose directory contents are decoded up front.
pub(crate) struct ListedDir {
    pub(crate) kind: AdapterKind,
    pub(crate) metadata: Metadata,
    pub(crate) entries: Vec<DirEntry>,
}

impl ListedDir {
    pub(crate) fn new(kind: AdapterKind, metadata: Metadata, entries: Vec<DirEntry>) -> Self {
        Self {
            kind,
            metadata,
            entries,
        }
    }
}

impl fmt::Debug for ListedDir {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListedDir")
            .field("kind", &self.kind)
            .field("name", &self.metadata.name)
            .field("entries", &self.entries.len())
            .finish()
    }
}

impl Read for ListedDir {
    fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
        Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "can not read bytes from a directory",
        ))
    }
}

impl Seek for ListedDir {
    fn seek(&mut self, _pos: SeekFrom) -> io::Result<u64> {
        Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "can not seek a directory",
        ))
    }
}

impl VirtualEntry for ListedDir {
    fn metadata(&self) -> Result<Metadata> {
        Ok(self.metadata.clone())
    }

    fn read_dir(&mut self, limit: Option<usize>) -> Result<Vec<DirEntry>> {
        let mut entries = self.entries.clone();
        if let Some(n) = limit {
            entries.truncate(n);
        }
        Ok(entries)
    }
}

/// Splits a sub-path handed to a container adapter into its components.
///
/// Container sub-paths are produced by the segmenter and therefore already
/// cleaned; this guards direct callers of an adapter against the inputs the
/// contract rejects.
pub(crate) fn subpath_components(kind: AdapterKind, path: &Path) -> Result<Vec<String>> {
    let raw = path.to_str().ok_or_else(|| FsError::InvalidPath {
        path: path.to_string_lossy().into_owned(),
        reason: "not valid UTF-8".to_string(),
    })?;
    if raw.contains('\\') {
        return Err(FsError::InvalidPath {
            path: raw.to_string(),
            reason: format!("backslashes are not valid in {kind} paths"),
        });
    }
    let mut components = Vec::new();
    for part in raw.split('/') {
        match part {
            "" | "." => continue,
            ".." => {
                return Err(FsError::InvalidPath {
                    path: raw.to_string(),
                    reason: "path escapes the filesystem root".to_string(),
                })
            }
            name => components.push(name.to_string()),
        }
    }
    Ok(components)
}
