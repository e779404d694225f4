//! Explicit adapter registry.
//!
//! The registry is the single place that knows how to turn a detected
//! container kind into a live filesystem over some backing storage. It is
//! constructed once and passed by reference into the segmenter and the
//! composition engine — no package-level state, so tests can swap in stub
//! adapters freely.

use std::collections::HashMap;
use std::fmt;

use crate::detect::{FileKind, FileTypeDetector};
use crate::disk::gpt::GptFileSystem;
use crate::disk::mbr::MbrFileSystem;
use crate::fat_fs::Fat16FileSystem;
use crate::shared_handle::SharedHandle;
use crate::zip_fs::ZipFileSystem;
use crate::{FileSystem, FsError, Result};

/// Tags for every filesystem adapter the resolver can name.
///
/// `Ntfs` is recognized by detection and representable in a segment chain,
/// but ships without a built-in constructor; registering one via
/// [`AdapterRegistry::register`] is the extension point.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AdapterKind {
    Host,
    Zip,
    Mbr,
    Gpt,
    Fat16,
    Ntfs,
}

impl AdapterKind {
    pub fn name(self) -> &'static str {
        match self {
            AdapterKind::Host => "host",
            AdapterKind::Zip => "zip",
            AdapterKind::Mbr => "mbr",
            AdapterKind::Gpt => "gpt",
            AdapterKind::Fat16 => "fat16",
            AdapterKind::Ntfs => "ntfs",
        }
    }

    /// Maps detector output onto adapter tags. Exhaustive over [`FileKind`]:
    /// adding a detector kind forces a decision here.
    pub fn for_container(kind: FileKind) -> Option<AdapterKind> {
        match kind {
            FileKind::Zip => Some(AdapterKind::Zip),
            FileKind::Mbr => Some(AdapterKind::Mbr),
            FileKind::Gpt => Some(AdapterKind::Gpt),
            FileKind::Fat16 => Some(AdapterKind::Fat16),
            FileKind::Ntfs => Some(AdapterKind::Ntfs),
            FileKind::Empty
            | FileKind::RegistryHive
            | FileKind::Gzip
            | FileKind::Png
            | FileKind::Pdf
            | FileKind::Sqlite
            | FileKind::Elf
            | FileKind::Text
            | FileKind::Binary => None,
        }
    }
}

impl fmt::Display for AdapterKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Builds an adapter over the previous segment's opened handle.
pub type AdapterConstructor =
    Box<dyn Fn(SharedHandle) -> Result<Box<dyn FileSystem + Send + Sync>> + Send + Sync>;

pub struct AdapterRegistry {
    detector: FileTypeDetector,
    constructors: HashMap<AdapterKind, AdapterConstructor>,
}

impl fmt::Debug for AdapterRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut kinds: Vec<&'static str> = self.constructors.keys().map(|k| k.name()).collect();
        kinds.sort_unstable();
        f.debug_struct("AdapterRegistry")
            .field("adapters", &kinds)
            .finish()
    }
}

impl Default for AdapterRegistry {
    fn default() -> Self {
        Self::with_default_adapters()
    }
}

impl AdapterRegistry {
    /// A registry with no adapters registered; useful with stub adapters in
    /// tests.
    pub fn empty(detector: FileTypeDetector) -> Self {
        Self {
            detector,
            constructors: HashMap::new(),
        }
    }

    /// The built-in adapter set: ZIP, MBR, GPT and FAT16 over the default
    /// detector.
    pub fn with_default_adapters() -> Self {
        let mut registry = Self::empty(FileTypeDetector::default());
        registry.register(
            AdapterKind::Zip,
            Box::new(|backing| -> Result<Box<dyn FileSystem + Send + Sync>> {
                Ok(Box::new(ZipFileSystem::new(backing)?))
            }),
        );
        registry.register(
            AdapterKind::Mbr,
            Box::new(|backing| -> Result<Box<dyn FileSystem + Send + Sync>> {
                Ok(Box::new(MbrFileSystem::new(backing)?))
            }),
        );
        registry.register(
            AdapterKind::Gpt,
            Box::new(|backing| -> Result<Box<dyn FileSystem + Send + Sync>> {
                Ok(Box::new(GptFileSystem::new(backing)?))
            }),
        );
        registry.register(
            AdapterKind::Fat16,
            Box::new(|backing| -> Result<Box<dyn FileSystem + Send + Sync>> {
                Ok(Box::new(Fat16FileSystem::new(backing)?))
            }),
        );
        registry
    }

    /// Registers (or replaces) the constructor for an adapter kind.
    pub fn register(&mut self, kind: AdapterKind, constructor: AdapterConstructor) {
        self.constructors.insert(kind, constructor);
    }

    pub fn is_registered(&self, kind: AdapterKind) -> bool {
        self.constructors.contains_key(&kind)
    }

    pub fn detector(&self) -> &FileTypeDetector {
        &self.detector
    }

    /// Runs detection on a header and returns the adapter kind to descend
    /// with, if the detected kind has a registered constructor. A container
    /// format without a constructor is treated as "not a container".
    pub fn container_adapter(
        &self,
        header: &[u8],
        extension_hint: Option<&str>,
    ) -> Option<AdapterKind> {
        let detected = self.detector.detect(header, extension_hint);
        AdapterKind::for_container(detected).filter(|kind| self.is_registered(*kind))
    }

    /// Instantiates the adapter registered under `kind` over `backing`.
    pub fn construct(
        &self,
        kind: AdapterKind,
        backing: SharedHandle,
    ) -> Result<Box<dyn FileSystem + Send + Sync>> {
        match self.constructors.get(&kind) {
            Some(constructor) => constructor(backing),
            None => Err(FsError::Unsupported {
                op: format!("construct {kind} adapter (no constructor registered)"),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{BufferedFile, FileType, Metadata, VirtualEntry};
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[derive(Debug)]
    struct StubFileSystem;

    impl FileSystem for StubFileSystem {
        fn open(&self, _path: &Path) -> Result<Box<dyn VirtualEntry + Send>> {
            Ok(Box::new(BufferedFile::new(
                AdapterKind::Ntfs,
                Metadata {
                    name: "stub".to_string(),
                    ft: FileType::new_file(),
                    ..Default::default()
                },
                Vec::new(),
            )))
        }
    }

    fn backing() -> SharedHandle {
        SharedHandle::new(Box::new(BufferedFile::new(
            AdapterKind::Host,
            Metadata::default(),
            vec![0u8; 16],
        )))
    }

    #[test]
    fn unregistered_kinds_are_not_containers() {
        let registry = AdapterRegistry::with_default_adapters();
        let mut ntfs_header = vec![0u8; 512];
        ntfs_header[3..11].copy_from_slice(b"NTFS    ");
        ntfs_header[510] = 0x55;
        ntfs_header[511] = 0xAA;

        // Detection names the format, but without a constructor it is not
        // treated as a container.
        assert_eq!(
            registry.detector().detect(&ntfs_header, None),
            FileKind::Ntfs
        );
        assert_eq!(registry.container_adapter(&ntfs_header, None), None);
    }

    #[test]
    fn registering_a_stub_makes_the_kind_a_container() {
        let mounts = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&mounts);
        let mut registry = AdapterRegistry::with_default_adapters();
        registry.register(
            AdapterKind::Ntfs,
            Box::new(move |_backing| -> Result<Box<dyn FileSystem + Send + Sync>> {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(Box::new(StubFileSystem))
            }),
        );

        let mut ntfs_header = vec![0u8; 512];
        ntfs_header[3..11].copy_from_slice(b"NTFS    ");
        assert_eq!(
            registry.container_adapter(&ntfs_header, None),
            Some(AdapterKind::Ntfs)
        );

        registry
            .construct(AdapterKind::Ntfs, backing())
            .expect("stub construction should succeed");
        assert_eq!(mounts.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn constructing_an_unregistered_kind_fails() {
        let registry = AdapterRegistry::empty(FileTypeDetector::default());
        let err = registry
            .construct(AdapterKind::Zip, backing())
            .expect_err("construction should fail");
        assert!(matches!(err, FsError::Unsupported { .. }));
    }

    #[test]
    fn non_container_kinds_never_map_to_adapters() {
        for kind in [
            FileKind::Empty,
            FileKind::Text,
            FileKind::Binary,
            FileKind::Pdf,
        ] {
            assert_eq!(AdapterKind::for_container(kind), None);
        }
    }
}
