//! Read-only adapter over ZIP archives.
//!
//! Entries are addressed by their stored names. Directories exist either
//! explicitly (an entry with a trailing slash) or implicitly (as a prefix of
//! deeper entry names); both are presented uniformly. Opening a file
//! decompresses it into an in-memory cursor, which keeps handles independent
//! of the shared archive and fits the read-fully forensic model.

use std::collections::BTreeMap;
use std::fmt;
use std::io::Read;
use std::path::Path;
use std::sync::Mutex;

use tracing::trace;
use zip::result::ZipError;
use zip::ZipArchive;

use crate::shared_handle::SharedHandle;
use crate::{
    subpath_components, AdapterKind, BufferedFile, DirEntry, FileSystem, FileType, FsError,
    ListedDir, Metadata, Result, VirtualEntry,
};

pub struct ZipFileSystem {
    archive: Mutex<ZipArchive<SharedHandle>>,
}

impl fmt::Debug for ZipFileSystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let len = self.archive.lock().map(|a| a.len()).unwrap_or(0);
        f.debug_struct("ZipFileSystem").field("entries", &len).finish()
    }
}

impl ZipFileSystem {
    pub fn new(backing: SharedHandle) -> Result<Self> {
        let archive = ZipArchive::new(backing).map_err(|e| corrupt("/", e))?;
        trace!(entries = archive.len(), "opened zip archive");
        Ok(Self {
            archive: Mutex::new(archive),
        })
    }
}

fn corrupt(path: &str, err: ZipError) -> FsError {
    FsError::Corrupt {
        kind: AdapterKind::Zip,
        path: path.to_string(),
        detail: err.to_string(),
    }
}

fn not_found(path: &str) -> FsError {
    FsError::NotFound {
        kind: AdapterKind::Zip,
        path: path.to_string(),
    }
}

fn root_metadata() -> Metadata {
    Metadata {
        name: "/".to_string(),
        ft: FileType::new_dir(),
        ..Default::default()
    }
}

fn implicit_dir_metadata(name: &str) -> Metadata {
    Metadata {
        name: name.to_string(),
        ft: FileType::new_dir(),
        ..Default::default()
    }
}

fn dos_datetime_nanos(dt: Option<zip::DateTime>) -> u64 {
    let Some(dt) = dt else { return 0 };
    let Ok(month) = time::Month::try_from(dt.month()) else {
        return 0;
    };
    let Ok(date) = time::Date::from_calendar_date(i32::from(dt.year()), month, dt.day()) else {
        return 0;
    };
    let Ok(tod) = time::Time::from_hms(dt.hour(), dt.minute(), dt.second()) else {
        return 0;
    };
    let stamp = time::PrimitiveDateTime::new(date, tod)
        .assume_utc()
        .unix_timestamp_nanos();
    stamp.max(0) as u64
}

fn entry_metadata(
    name: &str,
    is_dir: bool,
    size: u64,
    mode: Option<u32>,
    modified: Option<zip::DateTime>,
) -> Metadata {
    Metadata {
        name: name.to_string(),
        ft: if is_dir {
            FileType::new_dir()
        } else {
            FileType::new_file()
        },
        len: if is_dir { 0 } else { size },
        mode: mode.unwrap_or(0),
        accessed: 0,
        created: 0,
        modified: dos_datetime_nanos(modified),
    }
}

/// Where a name points inside the archive.
enum Located {
    File(usize),
    Dir(Metadata),
}

fn locate(archive: &mut ZipArchive<SharedHandle>, name: &str) -> Result<Located> {
    if let Some(index) = archive.index_for_name(name) {
        let entry = archive.by_index_raw(index).map_err(|e| corrupt(name, e))?;
        if entry.is_dir() {
            let meta = entry_metadata(
                base_name(name),
                true,
                0,
                entry.unix_mode(),
                entry.last_modified(),
            );
            return Ok(Located::Dir(meta));
        }
        return Ok(Located::File(index));
    }

    let dir_name = format!("{name}/");
    if let Some(index) = archive.index_for_name(&dir_name) {
        let entry = archive.by_index_raw(index).map_err(|e| corrupt(name, e))?;
        let meta = entry_metadata(
            base_name(name),
            true,
            0,
            entry.unix_mode(),
            entry.last_modified(),
        );
        return Ok(Located::Dir(meta));
    }

    // Implicit directory: present only as a prefix of deeper entries.
    if archive.file_names().any(|n| n.starts_with(&dir_name)) {
        return Ok(Located::Dir(implicit_dir_metadata(base_name(name))));
    }

    Err(not_found(name))
}

fn base_name(name: &str) -> &str {
    name.rsplit('/').next().unwrap_or(name)
}

fn list_dir(archive: &mut ZipArchive<SharedHandle>, prefix: &str) -> Result<Vec<DirEntry>> {
    let mut children: BTreeMap<String, DirEntry> = BTreeMap::new();
    for index in 0..archive.len() {
        let entry = archive.by_index_raw(index).map_err(|e| corrupt(prefix, e))?;
        let full = entry.name().to_string();
        if !full.starts_with(prefix) || full.len() == prefix.len() {
            continue;
        }
        let rest = &full[prefix.len()..];
        let rest = rest.strip_suffix('/').unwrap_or(rest);
        if rest.is_empty() {
            continue;
        }
        match rest.split_once('/') {
            Some((first, _)) => {
                // A deeper entry implies a child directory even without an
                // explicit entry for it.
                children.entry(first.to_string()).or_insert_with(|| DirEntry {
                    name: first.to_string(),
                    metadata: implicit_dir_metadata(first),
                });
            }
            None => {
                let metadata = entry_metadata(
                    rest,
                    entry.is_dir(),
                    entry.size(),
                    entry.unix_mode(),
                    entry.last_modified(),
                );
                children.insert(
                    rest.to_string(),
                    DirEntry {
                        name: rest.to_string(),
                        metadata,
                    },
                );
            }
        }
    }
    Ok(children.into_values().collect())
}

impl FileSystem for ZipFileSystem {
    fn open(&self, path: &Path) -> Result<Box<dyn VirtualEntry + Send>> {
        let components = subpath_components(AdapterKind::Zip, path)?;
        let name = components.join("/");
        let mut archive = self.archive.lock().unwrap();

        if name.is_empty() {
            let entries = list_dir(&mut archive, "")?;
            return Ok(Box::new(ListedDir::new(
                AdapterKind::Zip,
                root_metadata(),
                entries,
            )));
        }

        match locate(&mut archive, &name)? {
            Located::Dir(metadata) => {
                let entries = list_dir(&mut archive, &format!("{name}/"))?;
                Ok(Box::new(ListedDir::new(AdapterKind::Zip, metadata, entries)))
            }
            Located::File(index) => {
                let mut entry = archive.by_index(index).map_err(|e| corrupt(&name, e))?;
                let metadata = entry_metadata(
                    base_name(&name),
                    false,
                    entry.size(),
                    entry.unix_mode(),
                    entry.last_modified(),
                );
                let mut data = Vec::with_capacity(metadata.len as usize);
                entry.read_to_end(&mut data).map_err(|e| FsError::Corrupt {
                    kind: AdapterKind::Zip,
                    path: name.clone(),
                    detail: format!("failed to decompress entry: {e}"),
                })?;
                trace!(entry = %name, len = data.len(), "decompressed zip entry");
                Ok(Box::new(BufferedFile::new(AdapterKind::Zip, metadata, data)))
            }
        }
    }

    // Stats without decompressing the entry.
    fn metadata(&self, path: &Path) -> Result<Metadata> {
        let components = subpath_components(AdapterKind::Zip, path)?;
        let name = components.join("/");
        let mut archive = self.archive.lock().unwrap();

        if name.is_empty() {
            return Ok(root_metadata());
        }
        match locate(&mut archive, &name)? {
            Located::Dir(metadata) => Ok(metadata),
            Located::File(index) => {
                let entry = archive.by_index_raw(index).map_err(|e| corrupt(&name, e))?;
                Ok(entry_metadata(
                    base_name(&name),
                    false,
                    entry.size(),
                    entry.unix_mode(),
                    entry.last_modified(),
                ))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Cursor, Write};
    use zip::write::SimpleFileOptions;
    use zip::CompressionMethod;

    fn sample_archive() -> SharedHandle {
        let mut cursor = Cursor::new(Vec::new());
        {
            let mut writer = zip::ZipWriter::new(&mut cursor);
            let options =
                SimpleFileOptions::default().compression_method(CompressionMethod::Stored);
            writer.start_file("readme.txt", options).unwrap();
            writer.write_all(b"read me first").unwrap();
            writer.add_directory("docs", options).unwrap();
            writer.start_file("docs/a.txt", options).unwrap();
            writer.write_all(b"aaa").unwrap();
            // No explicit entry for `deep/`: it only exists implicitly.
            writer.start_file("deep/nested/b.txt", options).unwrap();
            writer.write_all(b"bbb").unwrap();
            writer.finish().unwrap();
        }
        let bytes = cursor.into_inner();
        let len = bytes.len() as u64;
        SharedHandle::new(Box::new(BufferedFile::new(
            AdapterKind::Host,
            Metadata {
                name: "sample.zip".to_string(),
                ft: FileType::new_file(),
                len,
                ..Default::default()
            },
            bytes,
        )))
    }

    #[test]
    fn opens_and_reads_a_stored_entry() {
        let fs = ZipFileSystem::new(sample_archive()).unwrap();
        let mut handle = fs.open(Path::new("readme.txt")).unwrap();
        let meta = handle.metadata().unwrap();
        assert!(meta.is_file());
        assert_eq!(meta.len(), 13);

        let mut contents = String::new();
        handle.read_to_string(&mut contents).unwrap();
        assert_eq!(contents, "read me first");
    }

    #[test]
    fn lists_the_root_with_implicit_directories() {
        let fs = ZipFileSystem::new(sample_archive()).unwrap();
        let entries = fs.read_dir(Path::new("/"), None).unwrap();
        let names: Vec<&str> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["deep", "docs", "readme.txt"]);
        assert!(entries[0].file_type().is_dir());
        assert!(entries[2].file_type().is_file());
    }

    #[test]
    fn implicit_directories_are_traversable() {
        let fs = ZipFileSystem::new(sample_archive()).unwrap();
        let meta = fs.metadata(Path::new("deep/nested")).unwrap();
        assert!(meta.is_dir());

        let entries = fs.read_dir(Path::new("deep/nested"), None).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "b.txt");
    }

    #[test]
    fn missing_entries_surface_as_not_found() {
        let fs = ZipFileSystem::new(sample_archive()).unwrap();
        assert!(matches!(
            fs.open(Path::new("nope.txt")),
            Err(FsError::NotFound {
                kind: AdapterKind::Zip,
                ..
            })
        ));
    }

    #[test]
    fn garbage_backing_is_reported_corrupt() {
        let backing = SharedHandle::new(Box::new(BufferedFile::new(
            AdapterKind::Host,
            Metadata::default(),
            b"PK\x03\x04 but nothing else".to_vec(),
        )));
        assert!(matches!(
            ZipFileSystem::new(backing),
            Err(FsError::Corrupt {
                kind: AdapterKind::Zip,
                ..
            })
        ));
    }
}
