//! Master Boot Record partition tables.

use std::fmt;
use std::path::Path;

use byteorder::{ByteOrder, LittleEndian};
use tracing::trace;

use super::{open_in_table, Partition, SECTOR_SIZE};
use crate::shared_handle::SharedHandle;
use crate::{AdapterKind, FileSystem, FsError, Metadata, Result, VirtualEntry};

const PARTITION_TABLE_OFFSET: usize = 446;
const PARTITION_ENTRY_LEN: usize = 16;

/// Exposes the four primary MBR partitions as `p0`..`p3`. Empty slots
/// (type byte zero or no sectors) are omitted.
pub struct MbrFileSystem {
    backing: SharedHandle,
    partitions: Vec<Partition>,
}

impl fmt::Debug for MbrFileSystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MbrFileSystem")
            .field("partitions", &self.partitions)
            .finish()
    }
}

impl MbrFileSystem {
    pub fn new(backing: SharedHandle) -> Result<Self> {
        let mut sector = [0u8; 512];
        backing
            .read_exact_at(0, &mut sector)
            .map_err(|e| corrupt(format!("boot sector unreadable: {e}")))?;
        if sector[510] != 0x55 || sector[511] != 0xAA {
            return Err(corrupt("missing 0x55AA boot signature".to_string()));
        }

        let mut partitions = Vec::new();
        for index in 0..4 {
            let offset = PARTITION_TABLE_OFFSET + index * PARTITION_ENTRY_LEN;
            let entry = &sector[offset..offset + PARTITION_ENTRY_LEN];
            let type_id = entry[4];
            let start_lba = LittleEndian::read_u32(&entry[8..12]);
            let num_sectors = LittleEndian::read_u32(&entry[12..16]);
            if type_id == 0 || num_sectors == 0 {
                continue;
            }
            trace!(index, type_id, start_lba, num_sectors, "mbr partition");
            partitions.push(Partition {
                index,
                start: u64::from(start_lba) * SECTOR_SIZE,
                len: u64::from(num_sectors) * SECTOR_SIZE,
            });
        }

        Ok(Self {
            backing,
            partitions,
        })
    }

    pub fn partitions(&self) -> &[Partition] {
        &self.partitions
    }
}

fn corrupt(detail: String) -> FsError {
    FsError::Corrupt {
        kind: AdapterKind::Mbr,
        path: "/".to_string(),
        detail,
    }
}

impl FileSystem for MbrFileSystem {
    fn open(&self, path: &Path) -> Result<Box<dyn VirtualEntry + Send>> {
        open_in_table(AdapterKind::Mbr, &self.partitions, &self.backing, path)
    }

    fn metadata(&self, path: &Path) -> Result<Metadata> {
        self.open(path)?.metadata()
    }
}
