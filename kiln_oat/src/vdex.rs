//! Side file holding the original bytecode.
//!
//! ```text
//!  "vdex" "027\0"
//!  u32 section_count
//!  { u32 kind; u32 offset; u32 size } [section_count]
//!  ... sections ...
//! ```
//!
//! The checksum section holds one `u32` per dex file; the dex section holds
//! the dex files back to back, each 4-byte aligned and sized by the
//! `file_size` field of its own header.

use std::fs::File;
use std::os::fd::AsFd;
use std::path::{Path, PathBuf};

use kiln_jit::mem_map::{MemMap, Protection};

use crate::bytes::{ByteReader, PutLe};
use crate::error::{LoadError, Result};

pub const VDEX_MAGIC: [u8; 4] = *b"vdex";
pub const VDEX_VERSION: [u8; 4] = *b"027\0";

pub const DEX_MAGIC: [u8; 4] = *b"dex\n";
pub const DEX_HEADER_SIZE: usize = 0x70;
const DEX_FILE_SIZE_OFFSET: usize = 0x20;
const DEX_CLASS_DEFS_SIZE_OFFSET: usize = 0x60;
const DEX_CLASS_DEFS_OFF_OFFSET: usize = 0x64;
const DEX_CLASS_DEF_ITEM_SIZE: usize = 0x20;

/// Section kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum VdexSection {
    Checksum = 0,
    DexFile = 1,
    VerifierDeps = 2,
    TypeLookupTable = 3,
}

#[derive(Debug)]
enum Backing {
    Mapped(MemMap),
    Owned(Vec<u8>),
}

/// An opened side file.
#[derive(Debug)]
pub struct VdexFile {
    path: PathBuf,
    backing: Backing,
    len: usize,
    checksums: Vec<u32>,
    /// (offset, size) of every dex file.
    dex_files: Vec<(usize, usize)>,
}

impl VdexFile {
    /// Map `path` read-only, at `preferred` when given.
    ///
    /// # Safety
    /// A `preferred` address must be page aligned with room for the whole
    /// file inside a reservation the caller owns.
    pub unsafe fn open(path: &Path, preferred: Option<*mut u8>) -> Result<Self> {
        let file = File::open(path).map_err(|e| LoadError::io(path, e))?;
        let len = file
            .metadata()
            .map_err(|e| LoadError::io(path, e))?
            .len() as usize;
        if len == 0 {
            return Err(LoadError::Truncated {
                what: "vdex",
                offset: 0,
                needed: 8,
                size: 0,
            });
        }
        let map = match preferred {
            // SAFETY: forwarded to the caller.
            Some(addr) => unsafe {
                MemMap::map_fd_fixed(addr, file.as_fd(), 0, len, Protection::READ, false)?
            },
            None => MemMap::map_fd(file.as_fd(), 0, len, Protection::READ, false)?,
        };
        Self::parse(path.to_path_buf(), Backing::Mapped(map), len)
    }

    /// Parse side-file bytes held in memory.
    pub fn from_bytes(path: impl Into<PathBuf>, bytes: Vec<u8>) -> Result<Self> {
        let len = bytes.len();
        Self::parse(path.into(), Backing::Owned(bytes), len)
    }

    fn parse(path: PathBuf, backing: Backing, len: usize) -> Result<Self> {
        let mut vdex = Self {
            path,
            backing,
            len,
            checksums: Vec::new(),
            dex_files: Vec::new(),
        };
        let data = vdex.data();
        let mut r = ByteReader::new(data, "vdex header");
        let magic = r.array::<4>()?;
        if magic != VDEX_MAGIC {
            return Err(LoadError::BadMagic {
                what: "vdex",
                found: magic.to_vec(),
            });
        }
        let version = r.array::<4>()?;
        if version != VDEX_VERSION {
            return Err(LoadError::BadVersion {
                what: "vdex",
                found: version.to_vec(),
            });
        }
        let count = r.u32()? as usize;
        let mut checksums = Vec::new();
        let mut dex_files = Vec::new();
        for _ in 0..count {
            let kind = r.u32()?;
            let offset = r.u32()? as usize;
            let size = r.u32()? as usize;
            let section = ByteReader::at(data, offset, "vdex section")?.bytes(size)?;
            if kind == VdexSection::Checksum as u32 {
                if size % 4 != 0 {
                    return Err(LoadError::Misaligned {
                        what: "vdex checksum section",
                        value: size,
                        alignment: 4,
                    });
                }
                let mut cr = ByteReader::new(section, "vdex checksums");
                for _ in 0..size / 4 {
                    checksums.push(cr.u32()?);
                }
            } else if kind == VdexSection::DexFile as u32 {
                dex_files = split_dex_section(section, offset)?;
            }
        }
        if !dex_files.is_empty() && dex_files.len() != checksums.len() {
            return Err(LoadError::layout(format!(
                "vdex has {} dex files but {} checksums",
                dex_files.len(),
                checksums.len()
            )));
        }
        vdex.checksums = checksums;
        vdex.dex_files = dex_files;
        Ok(vdex)
    }

    pub fn data(&self) -> &[u8] {
        match &self.backing {
            // SAFETY: the mapping covers `len` readable bytes.
            Backing::Mapped(map) => unsafe { std::slice::from_raw_parts(map.begin(), self.len) },
            Backing::Owned(bytes) => bytes,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Address the file is mapped at, if it is mapped.
    pub fn begin(&self) -> Option<usize> {
        match &self.backing {
            Backing::Mapped(map) => Some(map.begin() as usize),
            Backing::Owned(_) => None,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Number of dex files the side file vouches for.
    pub fn dex_count(&self) -> usize {
        self.checksums.len()
    }

    pub fn checksum(&self, index: usize) -> Option<u32> {
        self.checksums.get(index).copied()
    }

    pub fn has_dex_section(&self) -> bool {
        !self.dex_files.is_empty()
    }

    /// Bytes of the dex file starting `offset` bytes into the side file.
    pub fn dex_at(&self, offset: usize) -> Option<&[u8]> {
        let &(begin, size) = self.dex_files.iter().find(|(begin, _)| *begin == offset)?;
        self.data().get(begin..begin + size)
    }
}

fn split_dex_section(section: &[u8], base: usize) -> Result<Vec<(usize, usize)>> {
    let mut files = Vec::new();
    let mut at = 0;
    while at < section.len() {
        let mut r = ByteReader::at(section, at, "dex header")?;
        let magic = r.array::<4>()?;
        if magic != DEX_MAGIC {
            return Err(LoadError::BadMagic {
                what: "dex",
                found: magic.to_vec(),
            });
        }
        let mut r = ByteReader::at(section, at + DEX_FILE_SIZE_OFFSET, "dex header")?;
        let size = r.u32()? as usize;
        if size < DEX_HEADER_SIZE || at + size > section.len() {
            return Err(LoadError::Truncated {
                what: "dex file",
                offset: base + at,
                needed: size,
                size: section.len() - at,
            });
        }
        files.push((base + at, size));
        at = (at + size).next_multiple_of(4);
    }
    Ok(files)
}

/// `class_defs_size` field of a dex header.
///
/// The declared class definitions must lie inside the dex file.
pub fn dex_class_defs_size(dex: &[u8]) -> Result<u32> {
    let mut r = ByteReader::at(dex, DEX_CLASS_DEFS_SIZE_OFFSET, "dex header")?;
    let count = r.u32()?;
    let offset = r.u32()? as usize;
    if count == 0 {
        return Ok(0);
    }
    let needed = (count as usize).saturating_mul(DEX_CLASS_DEF_ITEM_SIZE);
    if offset < DEX_HEADER_SIZE || offset.saturating_add(needed) > dex.len() {
        return Err(LoadError::Truncated {
            what: "dex class defs",
            offset,
            needed,
            size: dex.len().saturating_sub(offset),
        });
    }
    Ok(count)
}

/// Minimal dex file: a header followed by `class_defs` zeroed class
/// definitions.
pub(crate) fn build_dex(checksum_seed: u32, class_defs: u32) -> Vec<u8> {
    let size = DEX_HEADER_SIZE + class_defs as usize * DEX_CLASS_DEF_ITEM_SIZE;
    let mut dex = Vec::with_capacity(size);
    dex.extend_from_slice(&DEX_MAGIC);
    dex.extend_from_slice(b"035\0");
    dex.put_u32(checksum_seed);
    dex.resize(size, 0);
    dex.patch_u32(DEX_FILE_SIZE_OFFSET, size as u32);
    dex.patch_u32(0x24, DEX_HEADER_SIZE as u32);
    dex.patch_u32(DEX_CLASS_DEFS_SIZE_OFFSET, class_defs);
    if class_defs > 0 {
        dex.patch_u32(DEX_CLASS_DEFS_OFF_OFFSET, DEX_HEADER_SIZE as u32);
    }
    dex
}

/// Side-file bytes for `dex_files` with the given checksums. Returns the
/// bytes and the offset of every dex file.
pub(crate) fn build_vdex(dex_files: &[Vec<u8>], checksums: &[u32]) -> (Vec<u8>, Vec<u32>) {
    let header_len = 12 + 2 * 12;
    let checksum_off = header_len;
    let checksum_len = checksums.len() * 4;
    let dex_off = (checksum_off + checksum_len).next_multiple_of(4);

    let mut out = Vec::new();
    out.extend_from_slice(&VDEX_MAGIC);
    out.extend_from_slice(&VDEX_VERSION);
    out.put_u32(2);
    out.put_u32(VdexSection::Checksum as u32);
    out.put_u32(checksum_off as u32);
    out.put_u32(checksum_len as u32);
    out.put_u32(VdexSection::DexFile as u32);
    out.put_u32(dex_off as u32);
    let dex_size_at = out.len();
    out.put_u32(0);
    for &checksum in checksums {
        out.put_u32(checksum);
    }
    out.pad_to(4);

    let mut offsets = Vec::with_capacity(dex_files.len());
    for dex in dex_files {
        out.pad_to(4);
        offsets.push(out.len() as u32);
        out.extend_from_slice(dex);
    }
    let dex_size = out.len() - dex_off;
    out.patch_u32(dex_size_at, dex_size as u32);
    (out, offsets)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn sample() -> (Vec<u8>, Vec<u32>) {
        let dex = vec![build_dex(1, 3), build_dex(2, 0)];
        build_vdex(&dex, &[0xAAAA, 0xBBBB])
    }

    #[test]
    fn test_parse_built_vdex() {
        let (bytes, offsets) = sample();
        let vdex = VdexFile::from_bytes("test.vdex", bytes).unwrap();
        assert_eq!(vdex.dex_count(), 2);
        assert_eq!(vdex.checksum(1), Some(0xBBBB));
        assert_eq!(vdex.checksum(2), None);
        let first = vdex.dex_at(offsets[0] as usize).unwrap();
        assert_eq!(dex_class_defs_size(first).unwrap(), 3);
        assert!(vdex.dex_at(offsets[0] as usize + 4).is_none());
    }

    #[test]
    fn test_class_defs_must_fit_in_dex() {
        let mut dex = build_dex(1, 2);
        assert_eq!(dex_class_defs_size(&dex).unwrap(), 2);
        dex.patch_u32(DEX_CLASS_DEFS_SIZE_OFFSET, u32::MAX);
        assert!(matches!(
            dex_class_defs_size(&dex),
            Err(LoadError::Truncated { what: "dex class defs", .. })
        ));
        dex.patch_u32(DEX_CLASS_DEFS_SIZE_OFFSET, 2);
        dex.patch_u32(DEX_CLASS_DEFS_OFF_OFFSET, 0);
        assert!(dex_class_defs_size(&dex).is_err());
    }

    #[test]
    fn test_open_maps_file() {
        let (bytes, offsets) = sample();
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&bytes).unwrap();
        let vdex = unsafe { VdexFile::open(file.path(), None) }.unwrap();
        assert!(vdex.begin().is_some());
        assert_eq!(vdex.len(), bytes.len());
        assert!(vdex.dex_at(offsets[1] as usize).is_some());
    }

    #[test]
    fn test_rejects_bad_dex_magic() {
        let (mut bytes, offsets) = sample();
        bytes[offsets[1] as usize] = b'x';
        assert!(matches!(
            VdexFile::from_bytes("bad.vdex", bytes),
            Err(LoadError::BadMagic { what: "dex", .. })
        ));
    }

    #[test]
    fn test_rejects_bad_magic() {
        let (mut bytes, _) = sample();
        bytes[0] = b'x';
        assert!(matches!(
            VdexFile::from_bytes("bad.vdex", bytes),
            Err(LoadError::BadMagic { what: "vdex", .. })
        ));
    }
}
