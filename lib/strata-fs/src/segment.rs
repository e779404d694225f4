//! Path segmentation.
//!
//! An opaque path like `evidence/disk.img/p0/boot.ini` is split into
//! (adapter, sub-path) hops by walking it component-by-component against the
//! currently active adapter: directories are consumed in place, and every
//! non-directory boundary is sniffed for a container signature. A positive
//! match swaps in a fresh adapter constructed over the opened object and
//! resolution continues inside it.

use std::io::Read;
use std::path::{Component, Path, PathBuf};

use path_clean::PathClean;
use tracing::{debug, trace};

use crate::detect::HEADER_SNIFF_LEN;
use crate::host_fs::HostFileSystem;
use crate::registry::{AdapterKind, AdapterRegistry};
use crate::shared_handle::SharedHandle;
use crate::{FileSystem, FsError, Result};

/// One hop of a resolved nested-container traversal: "once positioned via
/// the previous segments, open `sub_path` with the adapter named `kind`".
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Segment {
    pub kind: AdapterKind,
    pub sub_path: PathBuf,
}

impl Segment {
    pub fn new(kind: AdapterKind, sub_path: impl Into<PathBuf>) -> Self {
        Self {
            kind,
            sub_path: sub_path.into(),
        }
    }
}

fn invalid(path: &Path, reason: &str) -> FsError {
    FsError::InvalidPath {
        path: path.to_string_lossy().into_owned(),
        reason: reason.to_string(),
    }
}

/// Lexically cleans a path and rejects what no adapter accepts: backslashes,
/// non-UTF-8, and `..` escaping above the root. `"a//b/"` and `"a/b"` clean
/// to the same path, so they segment identically.
pub(crate) fn clean_path(path: &Path) -> Result<PathBuf> {
    let raw = path.to_str().ok_or_else(|| invalid(path, "not valid UTF-8"))?;
    if raw.is_empty() {
        return Err(invalid(path, "empty path"));
    }
    if raw.contains('\\') {
        return Err(invalid(path, "backslashes are not permitted"));
    }
    let cleaned = path.clean();
    if cleaned
        .components()
        .any(|c| matches!(c, Component::ParentDir))
    {
        return Err(invalid(path, "path escapes the root"));
    }
    Ok(cleaned)
}

pub(crate) fn extension_of(path: &Path) -> Option<String> {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
}

/// Reads up to [`HEADER_SNIFF_LEN`] leading bytes for signature detection.
pub(crate) fn sniff_header(reader: &mut dyn Read) -> Result<Vec<u8>> {
    let mut header = vec![0u8; HEADER_SNIFF_LEN];
    let mut total = 0;
    while total < header.len() {
        match reader.read(&mut header[total..]) {
            Ok(0) => break,
            Ok(n) => total += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(FsError::Io(e)),
        }
    }
    header.truncate(total);
    Ok(header)
}

/// Annotates an adapter-construction failure with the segment it happened
/// on. A corrupt container is never downgraded to "not a container".
pub(crate) fn container_error(kind: AdapterKind, at: &Path, err: FsError) -> FsError {
    match err {
        FsError::Corrupt { kind, detail, .. } => FsError::Corrupt {
            kind,
            path: at.display().to_string(),
            detail,
        },
        other => FsError::Corrupt {
            kind,
            path: at.display().to_string(),
            detail: other.to_string(),
        },
    }
}

/// Resolves `path` into its segment chain.
///
/// The chain is rebuilt from scratch on every call: resolution holds no
/// state, at the cost of repeated I/O on deeply nested paths. A path with no
/// container boundaries yields a single host segment.
pub fn resolve(registry: &AdapterRegistry, path: &Path) -> Result<Vec<Segment>> {
    let cleaned = clean_path(path)?;
    let mut chain: Vec<Segment> = Vec::new();
    let mut fs: Box<dyn FileSystem + Send + Sync> = Box::new(HostFileSystem::new());
    let mut kind = AdapterKind::Host;
    let mut acc = PathBuf::new();
    let mut components = cleaned.components().peekable();

    while let Some(component) = components.next() {
        match component {
            Component::RootDir => {
                acc.push("/");
                continue;
            }
            Component::CurDir => continue,
            Component::Normal(name) => acc.push(name),
            Component::ParentDir | Component::Prefix(_) => {
                return Err(invalid(path, "unresolvable path component"));
            }
        }

        let meta = fs.metadata(&acc)?;
        trace!(kind = %kind, at = %acc.display(), dir = meta.is_dir(), "segment step");
        if meta.is_dir() {
            continue;
        }

        // Non-directory boundary: this object terminates the current
        // adapter's sub-path.
        chain.push(Segment::new(kind, acc.clone()));
        if components.peek().is_none() {
            // Terminal file. Whether it is itself a container is decided
            // lazily by the composition engine, not here.
            return Ok(chain);
        }

        let mut handle = fs.open(&acc)?;
        let header = sniff_header(&mut handle)?;
        let hint = extension_of(&acc);
        match registry.container_adapter(&header, hint.as_deref()) {
            Some(next_kind) => {
                debug!(container = %next_kind, at = %acc.display(), "descending into container");
                let backing = SharedHandle::new(handle);
                fs = registry
                    .construct(next_kind, backing)
                    .map_err(|e| container_error(next_kind, &acc, e))?;
                kind = next_kind;
                acc = PathBuf::from("/");
            }
            None => {
                let remainder: PathBuf = components.collect();
                return Err(FsError::CannotResolve {
                    kind,
                    path: acc.display().to_string(),
                    remainder: remainder.display().to_string(),
                });
            }
        }
    }

    // Components exhausted inside a directory (or at an adapter root).
    if acc.as_os_str().is_empty() {
        acc.push(".");
    }
    chain.push(Segment::new(kind, acc));
    Ok(chain)
}
