//! The composition engine.
//!
//! Realizes a segment chain into a live handle chain and presents the result
//! through the same contract every adapter implements, so composed objects
//! can be traversed again — by a longer path, or by a generic directory
//! walker. The key seam is directory transparency: a file that detection
//! says is a container reports itself as a directory, and listing it falls
//! through to the container's own root.

use std::fmt;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::Path;
use std::sync::Arc;

use tracing::debug;

use crate::host_fs::HostFileSystem;
use crate::registry::{AdapterKind, AdapterRegistry};
use crate::segment::{container_error, extension_of, resolve, sniff_header, Segment};
use crate::shared_handle::SharedHandle;
use crate::{DirEntry, FileSystem, FileType, Metadata, Result, VirtualEntry};

/// A filesystem whose paths may cross nested container boundaries.
///
/// Holds no mutable state: every call re-resolves its path from scratch and
/// builds a fresh adapter per segment, so concurrent use needs no locking
/// beyond what the shared backing handles provide.
#[derive(Clone, Debug)]
pub struct RecursiveFileSystem {
    registry: Arc<AdapterRegistry>,
}

impl Default for RecursiveFileSystem {
    fn default() -> Self {
        Self::new(Arc::new(AdapterRegistry::with_default_adapters()))
    }
}

impl RecursiveFileSystem {
    pub fn new(registry: Arc<AdapterRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<AdapterRegistry> {
        &self.registry
    }

    /// Resolves a path to its segment chain without opening the final handle.
    pub fn resolve(&self, path: &Path) -> Result<Vec<Segment>> {
        resolve(&self.registry, path)
    }

    /// Opens a path across any number of container boundaries.
    ///
    /// Each segment's adapter is constructed over the previous segment's
    /// opened handle; intermediate handles are released as their scope ends,
    /// on error paths included. The final handle is returned wrapped in an
    /// [`Item`] owned by the caller.
    pub fn open_item(&self, path: &Path) -> Result<Item> {
        let chain = self.resolve(path)?;
        debug!(path = %path.display(), segments = chain.len(), "opening resolved chain");

        let mut handle: Option<Box<dyn VirtualEntry + Send>> = None;
        let mut kind = AdapterKind::Host;
        for segment in &chain {
            let fs: Box<dyn FileSystem + Send + Sync> = match handle.take() {
                // The first segment is always the host adapter, which needs
                // no backing data.
                None => Box::new(HostFileSystem::new()),
                Some(previous) => {
                    let backing = SharedHandle::new(previous);
                    self.registry
                        .construct(segment.kind, backing)
                        .map_err(|e| container_error(segment.kind, &segment.sub_path, e))?
                }
            };
            handle = Some(fs.open(&segment.sub_path)?);
            kind = segment.kind;
        }
        let handle = handle.expect("a resolved chain always has at least one segment");

        let meta = handle.metadata()?;
        let shared = SharedHandle::new(handle);
        let container = if meta.is_dir() {
            None
        } else {
            // One more detection pass decides whether the terminal file
            // would itself be a container, recorded for lazy reuse.
            let mut sniffer = shared.clone();
            let header = sniff_header(&mut sniffer)?;
            sniffer.seek(SeekFrom::Start(0))?;
            let last = chain.last().expect("chain is non-empty");
            let hint = extension_of(&last.sub_path);
            self.registry.container_adapter(&header, hint.as_deref())
        };

        Ok(Item {
            kind,
            meta,
            shared,
            container,
            registry: Arc::clone(&self.registry),
        })
    }
}

impl FileSystem for RecursiveFileSystem {
    fn open(&self, path: &Path) -> Result<Box<dyn VirtualEntry + Send>> {
        Ok(Box::new(self.open_item(path)?))
    }

    fn metadata(&self, path: &Path) -> Result<Metadata> {
        self.open_item(path)?.metadata()
    }

    fn read_dir(&self, path: &Path, limit: Option<usize>) -> Result<Vec<DirEntry>> {
        self.open_item(path)?.read_dir(limit)
    }
}

/// The composed handle returned by [`RecursiveFileSystem::open_item`].
///
/// An `Item` is the final hop of a chain plus the verdict of container
/// detection on it. Container items report themselves as directories so
/// generic walkers recurse into them, and listing one lists the container's
/// root.
pub struct Item {
    kind: AdapterKind,
    meta: Metadata,
    shared: SharedHandle,
    container: Option<AdapterKind>,
    registry: Arc<AdapterRegistry>,
}

impl fmt::Debug for Item {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Item")
            .field("kind", &self.kind)
            .field("name", &self.meta.name)
            .field("container", &self.container)
            .finish()
    }
}

impl Item {
    /// The adapter that owns the underlying handle.
    pub fn kind(&self) -> AdapterKind {
        self.kind
    }

    /// Whether this item is a container-by-content (and therefore presented
    /// as a directory).
    pub fn is_container(&self) -> bool {
        self.container.is_some()
    }

    /// The adapter kind detection matched on this item's content, if any.
    pub fn container_kind(&self) -> Option<AdapterKind> {
        self.container
    }

    fn mount(&self, kind: AdapterKind) -> Result<Box<dyn FileSystem + Send + Sync>> {
        self.registry
            .construct(kind, self.shared.clone())
            .map_err(|e| container_error(kind, Path::new(&self.meta.name), e))
    }
}

impl VirtualEntry for Item {
    fn metadata(&self) -> Result<Metadata> {
        let mut meta = self.meta.clone();
        if self.container.is_some() {
            // Directory transparency: a container file is a directory to
            // callers, whatever its own adapter said.
            meta.ft = FileType::new_dir();
        }
        Ok(meta)
    }

    fn read_dir(&mut self, limit: Option<usize>) -> Result<Vec<DirEntry>> {
        let mut entries = match self.container {
            Some(kind) => {
                // Listing a container file lists the container's own root.
                let fs = self.mount(kind)?;
                let mut root = fs.open(Path::new("/"))?;
                root.read_dir(None)?
            }
            None => self.shared.read_dir(None)?,
        };
        // Fetch unlimited, sort, then truncate: adapters promise no
        // ordering, the composed listing must be deterministic.
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        if let Some(n) = limit {
            entries.truncate(n);
        }
        Ok(entries)
    }
}

impl Read for Item {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.shared.read(buf)
    }
}

impl Seek for Item {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.shared.seek(pos)
    }
}

/// Convenience: resolve-and-stat in one call against a default engine.
pub fn stat(path: &Path) -> Result<Metadata> {
    RecursiveFileSystem::default().metadata(path)
}

/// Convenience: resolve-and-read a whole file in one call against a default
/// engine.
pub fn read(path: &Path) -> Result<Vec<u8>> {
    let mut item = RecursiveFileSystem::default().open_item(path)?;
    let mut contents = Vec::new();
    item.read_to_end(&mut contents)?;
    Ok(contents)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::FsError;
    use std::fs;
    use std::io::Write;

    fn scratch_with_zip() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("plain.txt"), b"flat").unwrap();

        let file = fs::File::create(dir.path().join("archive.zip")).unwrap();
        let mut writer = zip::ZipWriter::new(file);
        let options = zip::write::SimpleFileOptions::default()
            .compression_method(zip::CompressionMethod::Stored);
        writer.start_file("b.txt", options).unwrap();
        writer.write_all(b"bee").unwrap();
        writer.start_file("a.txt", options).unwrap();
        writer.write_all(b"ay").unwrap();
        writer.finish().unwrap();
        dir
    }

    #[test]
    fn a_zip_item_is_transparently_a_directory() {
        let dir = scratch_with_zip();
        let fs = RecursiveFileSystem::default();
        let mut item = fs.open_item(&dir.path().join("archive.zip")).unwrap();

        assert!(item.is_container());
        assert_eq!(item.container_kind(), Some(AdapterKind::Zip));
        // The host metadata says file; the composed metadata says directory.
        assert!(item.metadata().unwrap().is_dir());
        assert!(!item.metadata().unwrap().is_file());

        let names: Vec<String> = item
            .read_dir(None)
            .unwrap()
            .into_iter()
            .map(|e| e.name)
            .collect();
        assert_eq!(names, vec!["a.txt", "b.txt"]);
    }

    #[test]
    fn a_container_item_still_reads_its_raw_bytes() {
        let dir = scratch_with_zip();
        let fs = RecursiveFileSystem::default();
        let mut item = fs.open_item(&dir.path().join("archive.zip")).unwrap();
        let mut head = [0u8; 2];
        item.read_exact(&mut head).unwrap();
        assert_eq!(&head, b"PK");
    }

    #[test]
    fn plain_files_pass_through_untouched() {
        let dir = scratch_with_zip();
        let fs = RecursiveFileSystem::default();
        let mut item = fs.open_item(&dir.path().join("plain.txt")).unwrap();
        assert!(!item.is_container());
        assert!(item.metadata().unwrap().is_file());
        assert!(matches!(
            item.read_dir(None),
            Err(FsError::NotADirectory { .. })
        ));
    }

    #[test]
    fn listing_limits_apply_after_sorting() {
        let dir = scratch_with_zip();
        let fs = RecursiveFileSystem::default();
        let entries = fs.read_dir(&dir.path().join("archive.zip"), Some(1)).unwrap();
        assert_eq!(entries.len(), 1);
        // `b.txt` was written first; sorted-then-truncated must yield `a.txt`.
        assert_eq!(entries[0].name, "a.txt");
    }

    #[test]
    fn metadata_is_open_plus_stat() {
        let dir = scratch_with_zip();
        let fs = RecursiveFileSystem::default();
        let meta = fs
            .metadata(&dir.path().join("archive.zip/a.txt"))
            .unwrap();
        assert!(meta.is_file());
        assert_eq!(meta.len(), 2);
    }
}
