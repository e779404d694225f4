//! Partition-table adapters.
//!
//! MBR and GPT tables both resolve to the same runtime shape: a flat root
//! directory of `p{i}` entries, each a readable byte slice of the backing
//! image. Descending into a partition re-enters detection, so a FAT16
//! partition inside an MBR image becomes just another hop in the chain.

use std::fmt;
use std::io::{self, Read, Seek, SeekFrom};

use crate::shared_handle::SharedHandle;
use crate::{AdapterKind, DirEntry, FileType, FsError, Metadata, Result, VirtualEntry};

pub mod gpt;
pub mod mbr;

pub(crate) const SECTOR_SIZE: u64 = 512;

/// One entry of a decoded partition table.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Partition {
    /// Slot index in the table; names the partition as `p{index}`.
    pub index: usize,
    /// Byte offset of the partition's first sector in the backing image.
    pub start: u64,
    /// Partition length in bytes.
    pub len: u64,
}

impl Partition {
    pub fn name(&self) -> String {
        format!("p{}", self.index)
    }

    fn metadata(&self) -> Metadata {
        Metadata {
            name: self.name(),
            ft: FileType::new_file(),
            len: self.len,
            ..Default::default()
        }
    }

    pub(crate) fn dir_entry(&self) -> DirEntry {
        DirEntry {
            name: self.name(),
            metadata: self.metadata(),
        }
    }
}

/// A readable, seekable slice of the backing image.
pub struct PartitionFile {
    kind: AdapterKind,
    partition: Partition,
    backing: SharedHandle,
    pos: u64,
}

impl PartitionFile {
    pub(crate) fn new(kind: AdapterKind, partition: Partition, backing: SharedHandle) -> Self {
        Self {
            kind,
            partition,
            backing,
            pos: 0,
        }
    }
}

impl fmt::Debug for PartitionFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PartitionFile")
            .field("kind", &self.kind)
            .field("partition", &self.partition)
            .field("pos", &self.pos)
            .finish()
    }
}

impl Read for PartitionFile {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let remaining = self.partition.len.saturating_sub(self.pos);
        if remaining == 0 || buf.is_empty() {
            return Ok(0);
        }
        let want = buf.len().min(remaining as usize);
        let n = self
            .backing
            .read_at(self.partition.start + self.pos, &mut buf[..want])?;
        self.pos += n as u64;
        Ok(n)
    }
}

impl Seek for PartitionFile {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(offset) => i128::from(offset),
            SeekFrom::End(delta) => i128::from(self.partition.len) + i128::from(delta),
            SeekFrom::Current(delta) => i128::from(self.pos) + i128::from(delta),
        };
        if target < 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "seek before start of partition",
            ));
        }
        self.pos = target as u64;
        Ok(self.pos)
    }
}

impl VirtualEntry for PartitionFile {
    fn metadata(&self) -> Result<Metadata> {
        Ok(self.partition.metadata())
    }

    fn read_dir(&mut self, _limit: Option<usize>) -> Result<Vec<DirEntry>> {
        Err(FsError::NotADirectory {
            kind: self.kind,
            path: self.partition.name(),
        })
    }
}

pub(crate) fn table_root_metadata() -> Metadata {
    Metadata {
        name: "/".to_string(),
        ft: FileType::new_dir(),
        ..Default::default()
    }
}

/// Resolves a sub-path against a decoded partition table.
pub(crate) fn open_in_table(
    kind: AdapterKind,
    partitions: &[Partition],
    backing: &SharedHandle,
    path: &std::path::Path,
) -> Result<Box<dyn VirtualEntry + Send>> {
    let components = crate::subpath_components(kind, path)?;
    match components.as_slice() {
        [] => {
            let entries = partitions.iter().map(Partition::dir_entry).collect();
            Ok(Box::new(crate::ListedDir::new(
                kind,
                table_root_metadata(),
                entries,
            )))
        }
        [name] => {
            let partition = partitions
                .iter()
                .find(|p| p.name() == *name)
                .ok_or_else(|| FsError::NotFound {
                    kind,
                    path: name.clone(),
                })?;
            Ok(Box::new(PartitionFile::new(
                kind,
                partition.clone(),
                backing.clone(),
            )))
        }
        [first, ..] => Err(FsError::NotADirectory {
            kind,
            path: first.clone(),
        }),
    }
}
