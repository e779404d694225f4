//! Byte-signature filetype detection.
//!
//! Detection drives container descent: when path resolution hits a file with
//! path components still to consume, the file's leading bytes decide which
//! adapter (if any) can open it. Matchers carry a numeric specificity layer;
//! lower layers win, and layer 0 is reserved for signatures rigorous enough
//! to be authoritative on their own.

use std::fmt;

/// How many leading bytes of an object are handed to detection. Large enough
/// to cover signatures that live past the first sector (the GPT header sits
/// at byte 512).
pub const HEADER_SNIFF_LEN: usize = 8192;

/// Everything the detector can name. Only a subset corresponds to container
/// adapters; the rest exists so detection stays meaningful for plain
/// evidence files.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FileKind {
    /// Zero-length input. Never a container.
    Empty,
    Zip,
    Mbr,
    Gpt,
    Fat16,
    Ntfs,
    RegistryHive,
    Gzip,
    Png,
    Pdf,
    Sqlite,
    Elf,
    /// Printable-text catch-all.
    Text,
    /// Final catch-all; always matches.
    Binary,
}

impl FileKind {
    pub fn name(self) -> &'static str {
        match self {
            FileKind::Empty => "empty",
            FileKind::Zip => "zip",
            FileKind::Mbr => "mbr",
            FileKind::Gpt => "gpt",
            FileKind::Fat16 => "fat16",
            FileKind::Ntfs => "ntfs",
            FileKind::RegistryHive => "registry-hive",
            FileKind::Gzip => "gzip",
            FileKind::Png => "png",
            FileKind::Pdf => "pdf",
            FileKind::Sqlite => "sqlite",
            FileKind::Elf => "elf",
            FileKind::Text => "text",
            FileKind::Binary => "binary",
        }
    }
}

impl fmt::Display for FileKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One registered signature.
///
/// `layer` ranks specificity: 0 means the signature is rigorously specific
/// and a match is authoritative; higher values are progressively more
/// generic, ending in the text/binary catch-alls. Layer-0 matchers must be
/// pairwise disjoint — no two may accept the same header — which is what
/// makes the extension-hint short-circuit sound.
pub struct Matcher {
    pub kind: FileKind,
    pub layer: u8,
    pub extensions: &'static [&'static str],
    pub matches: fn(&[u8]) -> bool,
}

impl fmt::Debug for Matcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Matcher")
            .field("kind", &self.kind)
            .field("layer", &self.layer)
            .field("extensions", &self.extensions)
            .finish()
    }
}

/// Signature detection over an explicit matcher list; no global state.
#[derive(Debug)]
pub struct FileTypeDetector {
    // Sorted by (layer, registration order); detection is a linear scan.
    matchers: Vec<Matcher>,
}

impl Default for FileTypeDetector {
    fn default() -> Self {
        Self::new(builtin_matchers())
    }
}

impl FileTypeDetector {
    pub fn new(matchers: Vec<Matcher>) -> Self {
        let mut matchers = matchers;
        // Stable: registration order breaks ties within a layer.
        matchers.sort_by_key(|m| m.layer);
        Self { matchers }
    }

    /// Detects the kind of an object from its leading bytes.
    ///
    /// `extension_hint` is a cost optimization only: matchers registered for
    /// that extension are probed first, and a hinted layer-0 match returns
    /// immediately. Any weaker hinted outcome falls back to the full scan,
    /// so the hinted and unhinted paths always agree on the result.
    pub fn detect(&self, header: &[u8], extension_hint: Option<&str>) -> FileKind {
        if header.is_empty() {
            return FileKind::Empty;
        }

        if let Some(ext) = extension_hint {
            let ext = ext.to_ascii_lowercase();
            for matcher in self
                .matchers
                .iter()
                .filter(|m| m.extensions.contains(&ext.as_str()))
            {
                if (matcher.matches)(header) {
                    if matcher.layer == 0 {
                        return matcher.kind;
                    }
                    // A non-authoritative hinted match proves nothing a full
                    // scan would not override.
                    break;
                }
            }
        }

        self.detect_full(header)
    }

    fn detect_full(&self, header: &[u8]) -> FileKind {
        for matcher in &self.matchers {
            if (matcher.matches)(header) {
                return matcher.kind;
            }
        }
        FileKind::Binary
    }
}

fn is_zip(h: &[u8]) -> bool {
    h.starts_with(b"PK\x03\x04") || h.starts_with(b"PK\x05\x06")
}

fn has_boot_signature(h: &[u8]) -> bool {
    h.len() >= 512 && h[510] == 0x55 && h[511] == 0xAA
}

fn is_fat16(h: &[u8]) -> bool {
    // The system-identifier string in the extended BPB, plus the boot
    // signature every valid volume boot record carries.
    has_boot_signature(h) && h.len() >= 59 && &h[54..59] == b"FAT16"
}

fn is_ntfs(h: &[u8]) -> bool {
    h.len() >= 11 && &h[3..11] == b"NTFS    "
}

fn is_gpt(h: &[u8]) -> bool {
    // GPT header lives at LBA 1; the protective MBR in sector 0 is why this
    // must outrank the plain MBR matcher.
    h.len() >= 520 && &h[512..520] == b"EFI PART"
}

fn is_mbr(h: &[u8]) -> bool {
    // Weak: every volume boot record also ends in 0x55AA, so this sits a
    // layer below the filesystem signatures.
    has_boot_signature(h)
}

fn is_registry_hive(h: &[u8]) -> bool {
    h.starts_with(b"regf")
}

fn is_gzip(h: &[u8]) -> bool {
    h.starts_with(&[0x1f, 0x8b])
}

fn is_png(h: &[u8]) -> bool {
    h.starts_with(b"\x89PNG\r\n\x1a\n")
}

fn is_pdf(h: &[u8]) -> bool {
    h.starts_with(b"%PDF-")
}

fn is_sqlite(h: &[u8]) -> bool {
    h.starts_with(b"SQLite format 3\0")
}

fn is_elf(h: &[u8]) -> bool {
    h.starts_with(b"\x7fELF")
}

fn is_text(h: &[u8]) -> bool {
    h.iter()
        .take(1024)
        .all(|b| matches!(b, 0x09 | 0x0a | 0x0d | 0x20..=0x7e))
}

fn is_binary(_h: &[u8]) -> bool {
    true
}

fn builtin_matchers() -> Vec<Matcher> {
    vec![
        Matcher {
            kind: FileKind::Zip,
            layer: 0,
            extensions: &["zip", "jar"],
            matches: is_zip,
        },
        Matcher {
            kind: FileKind::Gpt,
            layer: 0,
            extensions: &["img", "dd", "raw"],
            matches: is_gpt,
        },
        Matcher {
            kind: FileKind::Fat16,
            layer: 0,
            extensions: &["img", "dd", "raw", "fat"],
            matches: is_fat16,
        },
        Matcher {
            kind: FileKind::Ntfs,
            layer: 0,
            extensions: &["img", "dd", "raw"],
            matches: is_ntfs,
        },
        Matcher {
            kind: FileKind::RegistryHive,
            layer: 0,
            extensions: &["dat", "hiv"],
            matches: is_registry_hive,
        },
        Matcher {
            kind: FileKind::Gzip,
            layer: 0,
            extensions: &["gz"],
            matches: is_gzip,
        },
        Matcher {
            kind: FileKind::Png,
            layer: 0,
            extensions: &["png"],
            matches: is_png,
        },
        Matcher {
            kind: FileKind::Pdf,
            layer: 0,
            extensions: &["pdf"],
            matches: is_pdf,
        },
        Matcher {
            kind: FileKind::Sqlite,
            layer: 0,
            extensions: &["db", "sqlite"],
            matches: is_sqlite,
        },
        Matcher {
            kind: FileKind::Elf,
            layer: 0,
            extensions: &[],
            matches: is_elf,
        },
        Matcher {
            kind: FileKind::Mbr,
            layer: 1,
            extensions: &["img", "dd", "raw"],
            matches: is_mbr,
        },
        Matcher {
            kind: FileKind::Text,
            layer: 9,
            extensions: &["txt", "log", "ini", "csv"],
            matches: is_text,
        },
        Matcher {
            kind: FileKind::Binary,
            layer: 10,
            extensions: &[],
            matches: is_binary,
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detector() -> FileTypeDetector {
        FileTypeDetector::default()
    }

    fn boot_sector(sys_id: &[u8]) -> Vec<u8> {
        let mut sector = vec![0u8; 512];
        sector[510] = 0x55;
        sector[511] = 0xAA;
        sector[54..54 + sys_id.len()].copy_from_slice(sys_id);
        sector
    }

    #[test]
    fn empty_header_is_never_a_container() {
        assert_eq!(detector().detect(&[], None), FileKind::Empty);
        assert_eq!(detector().detect(&[], Some("zip")), FileKind::Empty);
    }

    #[test]
    fn layer_zero_outranks_the_generic_mbr_match() {
        let fat = boot_sector(b"FAT16   ");
        assert_eq!(detector().detect(&fat, None), FileKind::Fat16);

        let plain = boot_sector(b"        ");
        assert_eq!(detector().detect(&plain, None), FileKind::Mbr);
    }

    #[test]
    fn gpt_wins_over_its_protective_mbr() {
        let mut image = boot_sector(b"        ");
        image.resize(1024, 0);
        image[512..520].copy_from_slice(b"EFI PART");
        assert_eq!(detector().detect(&image, None), FileKind::Gpt);
    }

    #[test]
    fn hinted_and_unhinted_detection_agree() {
        let zip = b"PK\x03\x04rest-of-archive".to_vec();
        let fat = boot_sector(b"FAT16   ");
        let text = b"just some words\n".to_vec();

        for header in [zip, fat, text] {
            let unhinted = detector().detect(&header, None);
            for hint in ["zip", "img", "txt", "bin", "unknown"] {
                assert_eq!(
                    detector().detect(&header, Some(hint)),
                    unhinted,
                    "hint {hint:?} changed the result"
                );
            }
        }
    }

    #[test]
    fn a_miss_on_the_hinted_matcher_falls_back_to_the_full_scan() {
        // `.zip` hint on a gzip stream: the hinted matcher rejects, and the
        // full scan must still identify the real kind.
        let gz = [0x1f, 0x8b, 0x08, 0x00];
        assert_eq!(detector().detect(&gz, Some("zip")), FileKind::Gzip);
    }

    #[test]
    fn catch_alls_cover_everything_else() {
        assert_eq!(detector().detect(b"hello world", None), FileKind::Text);
        assert_eq!(detector().detect(&[0u8, 1, 2, 3], None), FileKind::Binary);
    }
}
