//! GUID Partition Table adapter.

use std::fmt;
use std::path::Path;

use byteorder::{ByteOrder, LittleEndian};
use tracing::trace;

use super::{open_in_table, Partition, SECTOR_SIZE};
use crate::shared_handle::SharedHandle;
use crate::{AdapterKind, FileSystem, FsError, Metadata, Result, VirtualEntry};

const GPT_SIGNATURE: &[u8; 8] = b"EFI PART";
// Caps chosen well above anything a real disk uses, to bound reads on
// corrupt headers.
const MAX_ENTRIES: u32 = 1024;
const MAX_ENTRY_SIZE: u32 = 4096;

/// Exposes GPT partitions as `p{i}`, indexed by their slot in the partition
/// entry array. Slots with a zero type GUID are unused and omitted.
pub struct GptFileSystem {
    backing: SharedHandle,
    partitions: Vec<Partition>,
}

impl fmt::Debug for GptFileSystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GptFileSystem")
            .field("partitions", &self.partitions)
            .finish()
    }
}

impl GptFileSystem {
    pub fn new(backing: SharedHandle) -> Result<Self> {
        let mut header = [0u8; 92];
        backing
            .read_exact_at(SECTOR_SIZE, &mut header)
            .map_err(|e| corrupt(format!("header unreadable: {e}")))?;
        if &header[0..8] != GPT_SIGNATURE {
            return Err(corrupt("missing EFI PART signature".to_string()));
        }

        let entries_lba = LittleEndian::read_u64(&header[72..80]);
        let num_entries = LittleEndian::read_u32(&header[80..84]);
        let entry_size = LittleEndian::read_u32(&header[84..88]);
        if entry_size < 128 || entry_size > MAX_ENTRY_SIZE || num_entries > MAX_ENTRIES {
            return Err(corrupt(format!(
                "implausible entry array geometry: {num_entries} entries of {entry_size} bytes"
            )));
        }

        let mut array = vec![0u8; num_entries as usize * entry_size as usize];
        backing
            .read_exact_at(entries_lba * SECTOR_SIZE, &mut array)
            .map_err(|e| corrupt(format!("partition entry array unreadable: {e}")))?;

        let mut partitions = Vec::new();
        for index in 0..num_entries as usize {
            let entry = &array[index * entry_size as usize..(index + 1) * entry_size as usize];
            if entry[0..16].iter().all(|b| *b == 0) {
                continue;
            }
            let first_lba = LittleEndian::read_u64(&entry[32..40]);
            let last_lba = LittleEndian::read_u64(&entry[40..48]);
            if last_lba < first_lba {
                return Err(corrupt(format!(
                    "partition {index} ends (lba {last_lba}) before it starts (lba {first_lba})"
                )));
            }
            trace!(index, first_lba, last_lba, "gpt partition");
            partitions.push(Partition {
                index,
                start: first_lba * SECTOR_SIZE,
                len: (last_lba - first_lba + 1) * SECTOR_SIZE,
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
        kind: AdapterKind::Gpt,
        path: "/".to_string(),
        detail,
    }
}

impl FileSystem for GptFileSystem {
    fn open(&self, path: &Path) -> Result<Box<dyn VirtualEntry + Send>> {
        open_in_table(AdapterKind::Gpt, &self.partitions, &self.backing, path)
    }

    fn metadata(&self, path: &Path) -> Result<Metadata> {
        self.open(path)?.metadata()
    }
}
