//! Per-bytecode-container records of a container.
//!
//! The header's `oat_dex_files_offset` points at `dex_file_count` records:
//!
//! ```text
//!  u32 location_size; u8 location[location_size]
//!  u8  format_magic[4]
//!  u32 checksum
//!  u8  sha1[20]
//!  u32 bytecode_offset              (relative to the vdex)
//!  u32 class_offsets_offset         ┐
//!  u32 lookup_table_offset          │
//!  u32 dex_layout_sections_offset   │ relative to oatdata,
//!  u32 method_bss_mapping           │ zero when absent
//!  u32 type_bss_mapping             │
//!  u32 public_type_bss_mapping      │
//!  u32 package_type_bss_mapping     │
//!  u32 string_bss_mapping           │
//!  u32 method_type_bss_mapping      ┘
//! ```

use rustc_hash::FxHashSet;

use crate::bytes::{ByteReader, PutLe};
use crate::error::{LoadError, Result};
use crate::vdex::{self, DEX_MAGIC, VdexFile};

pub const SHA1_SIZE: usize = 20;

/// Largest class count a type lookup table can index.
pub const MAX_LOOKUP_TABLE_CLASSES: u32 = 0xFFFF;

// =============================================================================
// Index → .bss slot mappings
// =============================================================================

/// Sorted `(index, bss_offset)` pairs for one kind of resolved entity.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IndexBssMapping {
    entries: Vec<(u32, u32)>,
}

impl IndexBssMapping {
    pub fn new(mut entries: Vec<(u32, u32)>) -> Self {
        entries.sort_unstable_by_key(|&(index, _)| index);
        Self { entries }
    }

    /// `.bss` offset of the slot caching `index`.
    pub fn get(&self, index: u32) -> Option<u32> {
        self.entries
            .binary_search_by_key(&index, |&(i, _)| i)
            .ok()
            .map(|at| self.entries[at].1)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (u32, u32)> + '_ {
        self.entries.iter().copied()
    }

    fn parse(oatdata: &[u8], offset: usize, bss_size: usize) -> Result<Self> {
        if offset == 0 {
            return Ok(Self::default());
        }
        check_aligned("bss mapping", offset, 4)?;
        let mut r = ByteReader::at(oatdata, offset, "bss mapping")?;
        let count = r.u32()? as usize;
        let mut entries = Vec::with_capacity(count.min(r.remaining() / 8));
        for _ in 0..count {
            let index = r.u32()?;
            let slot = r.u32()?;
            if entries.last().is_some_and(|&(prev, _)| prev >= index) {
                return Err(LoadError::layout(format!(
                    "bss mapping at {offset:#x} is not sorted at index {index}"
                )));
            }
            check_aligned("bss slot", slot as usize, size_of::<usize>())?;
            if slot as usize + size_of::<usize>() > bss_size {
                return Err(LoadError::layout(format!(
                    "bss slot {slot:#x} outside a .bss of {bss_size:#x} bytes"
                )));
            }
            entries.push((index, slot));
        }
        Ok(Self { entries })
    }

    pub(crate) fn encode(&self, out: &mut Vec<u8>) {
        out.put_u32(self.entries.len() as u32);
        for &(index, slot) in &self.entries {
            out.put_u32(index);
            out.put_u32(slot);
        }
    }
}

/// Slot mappings for every resolvable kind.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BssMappings {
    pub method: IndexBssMapping,
    pub type_: IndexBssMapping,
    pub public_type: IndexBssMapping,
    pub package_type: IndexBssMapping,
    pub string: IndexBssMapping,
    pub method_type: IndexBssMapping,
}

impl BssMappings {
    pub(crate) fn all(&self) -> [&IndexBssMapping; 6] {
        [
            &self.method,
            &self.type_,
            &self.public_type,
            &self.package_type,
            &self.string,
            &self.method_type,
        ]
    }
}

// =============================================================================
// Type lookup table
// =============================================================================

/// Byte size of the type lookup table for `class_defs` classes.
pub const fn type_lookup_table_size(class_defs: u32) -> usize {
    if class_defs == 0 || class_defs > MAX_LOOKUP_TABLE_CLASSES {
        0
    } else {
        class_defs.next_power_of_two() as usize * 8
    }
}

// =============================================================================
// Compiled classes
// =============================================================================

/// How many methods of a class have compiled code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum OatClassKind {
    AllCompiled = 0,
    SomeCompiled = 1,
    NoneCompiled = 2,
}

/// Compiled code of one class.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OatClass {
    pub status: u16,
    pub kind: OatClassKind,
    method_count: u32,
    /// Present for [`OatClassKind::SomeCompiled`].
    bitmap: Vec<u8>,
    code_offsets: Vec<u32>,
}

impl OatClass {
    pub fn none(status: u16) -> Self {
        Self {
            status,
            kind: OatClassKind::NoneCompiled,
            method_count: 0,
            bitmap: Vec::new(),
            code_offsets: Vec::new(),
        }
    }

    /// A class whose methods map to `code_offsets`; `None` marks an
    /// uncompiled method.
    pub fn with_methods(status: u16, code_offsets: &[Option<u32>]) -> Self {
        let method_count = code_offsets.len() as u32;
        if code_offsets.iter().all(Option::is_some) {
            return Self {
                status,
                kind: OatClassKind::AllCompiled,
                method_count,
                bitmap: Vec::new(),
                code_offsets: code_offsets.iter().flatten().copied().collect(),
            };
        }
        if code_offsets.iter().all(Option::is_none) {
            return Self::none(status);
        }
        let mut bitmap = vec![0u8; code_offsets.len().div_ceil(8)];
        for (i, offset) in code_offsets.iter().enumerate() {
            if offset.is_some() {
                bitmap[i / 8] |= 1 << (i % 8);
            }
        }
        Self {
            status,
            kind: OatClassKind::SomeCompiled,
            method_count,
            bitmap,
            code_offsets: code_offsets.iter().flatten().copied().collect(),
        }
    }

    pub fn parse(oatdata: &[u8], offset: usize) -> Result<Self> {
        check_aligned("oat class", offset, 4)?;
        let mut r = ByteReader::at(oatdata, offset, "oat class")?;
        let status = r.u16()?;
        let kind = r.u16()?;
        match kind {
            0 => {
                let n = r.u32()?;
                let code_offsets = read_u32s(&mut r, n as usize)?;
                Ok(Self {
                    status,
                    kind: OatClassKind::AllCompiled,
                    method_count: n,
                    bitmap: Vec::new(),
                    code_offsets,
                })
            }
            1 => {
                let n = r.u32()?;
                let bitmap_len = r.u32()? as usize;
                if bitmap_len != (n as usize).div_ceil(8) {
                    return Err(LoadError::layout(format!(
                        "oat class at {offset:#x}: bitmap of {bitmap_len} bytes for {n} methods"
                    )));
                }
                let bitmap = r.bytes(bitmap_len)?.to_vec();
                let compiled = bitmap.iter().map(|b| b.count_ones() as usize).sum();
                let code_offsets = read_u32s(&mut r, compiled)?;
                Ok(Self {
                    status,
                    kind: OatClassKind::SomeCompiled,
                    method_count: n,
                    bitmap,
                    code_offsets,
                })
            }
            2 => Ok(Self::none(status)),
            other => Err(LoadError::layout(format!(
                "oat class at {offset:#x} has unknown kind {other}"
            ))),
        }
    }

    pub(crate) fn encode(&self, out: &mut Vec<u8>) {
        out.put_u16(self.status);
        out.put_u16(self.kind as u16);
        match self.kind {
            OatClassKind::AllCompiled => out.put_u32(self.method_count),
            OatClassKind::SomeCompiled => {
                out.put_u32(self.method_count);
                out.put_u32(self.bitmap.len() as u32);
                out.extend_from_slice(&self.bitmap);
            }
            OatClassKind::NoneCompiled => return,
        }
        for &offset in &self.code_offsets {
            out.put_u32(offset);
        }
    }

    /// Code offset (relative to oatdata) of the class's `method`-th method.
    pub fn code_offset(&self, method: u32) -> Option<u32> {
        match self.kind {
            OatClassKind::NoneCompiled => None,
            OatClassKind::AllCompiled => self.code_offsets.get(method as usize).copied(),
            OatClassKind::SomeCompiled => {
                let (byte, bit) = (method as usize / 8, method % 8);
                if self.bitmap.get(byte)? & (1 << bit) == 0 {
                    return None;
                }
                let before: u32 = self.bitmap[..byte].iter().map(|b| b.count_ones()).sum();
                let below = (self.bitmap[byte] & ((1u8 << bit) - 1)).count_ones();
                self.code_offsets.get((before + below) as usize).copied()
            }
        }
    }

    /// `(method index, code offset)` of every compiled method.
    pub fn compiled(&self) -> impl Iterator<Item = (u32, u32)> + '_ {
        (0..self.method_count).filter_map(|m| self.code_offset(m).map(|off| (m, off)))
    }
}

// =============================================================================
// Records
// =============================================================================

/// One bytecode container described by the container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OatDexFile {
    pub location: String,
    pub checksum: u32,
    pub sha1: [u8; SHA1_SIZE],
    pub bytecode_offset: u32,
    pub class_defs_size: u32,
    /// Offset of each class's [`OatClass`], zero when it has none.
    pub class_offsets: Vec<u32>,
    /// `(offset, len)` of the type lookup table entries.
    pub lookup_table: Option<(u32, u32)>,
    pub dex_layout_sections_offset: u32,
    pub bss: BssMappings,
}

impl OatDexFile {
    /// The compiled code of class `class_def`.
    pub fn oat_class(&self, oatdata: &[u8], class_def: u32) -> Result<OatClass> {
        match self.class_offsets.get(class_def as usize) {
            None => Err(LoadError::layout(format!(
                "class {class_def} out of range in '{}'",
                self.location
            ))),
            Some(0) => Ok(OatClass::none(0)),
            Some(&offset) => OatClass::parse(oatdata, offset as usize),
        }
    }
}

/// Parse and validate the records against the side file.
///
/// `bss_size` bounds every slot named by an index mapping.
pub fn parse_dex_files(
    oatdata: &[u8],
    table_offset: usize,
    count: usize,
    vdex: &VdexFile,
    bss_size: usize,
) -> Result<Vec<OatDexFile>> {
    if count != vdex.dex_count() {
        return Err(LoadError::DexCountMismatch {
            container: count,
            vdex: vdex.dex_count(),
        });
    }
    let mut r = ByteReader::at(oatdata, table_offset, "dex record")?;
    let mut seen = FxHashSet::default();
    let mut files = Vec::with_capacity(count);
    for index in 0..count {
        let file = parse_one(&mut r, oatdata, index, vdex, bss_size)?;
        if !seen.insert(file.location.clone()) {
            return Err(LoadError::DuplicateLocation(file.location));
        }
        files.push(file);
    }
    Ok(files)
}

fn parse_one(
    r: &mut ByteReader<'_>,
    oatdata: &[u8],
    index: usize,
    vdex: &VdexFile,
    bss_size: usize,
) -> Result<OatDexFile> {
    let location_size = r.u32()? as usize;
    if location_size == 0 {
        return Err(LoadError::layout(format!("dex record {index} has an empty location")));
    }
    let location = std::str::from_utf8(r.bytes(location_size)?)
        .map_err(|_| LoadError::layout(format!("dex record {index} location is not UTF-8")))?
        .to_owned();

    let magic = r.array::<4>()?;
    if magic != DEX_MAGIC {
        return Err(LoadError::BadMagic {
            what: "dex record",
            found: magic.to_vec(),
        });
    }
    let checksum = r.u32()?;
    let expected = vdex.checksum(index).unwrap_or_default();
    if checksum != expected {
        return Err(LoadError::ChecksumMismatch {
            location,
            index,
            container: checksum,
            vdex: expected,
        });
    }
    let sha1 = r.array::<SHA1_SIZE>()?;

    let bytecode_offset = r.u32()?;
    let dex = vdex.dex_at(bytecode_offset as usize).ok_or_else(|| {
        LoadError::layout(format!(
            "bytecode offset {bytecode_offset:#x} of '{location}' is not a dex file in {}",
            vdex.path().display()
        ))
    })?;
    check_aligned("bytecode offset", bytecode_offset as usize, 4)?;
    let class_defs_size = vdex::dex_class_defs_size(dex)?;

    let class_offsets_offset = r.u32()? as usize;
    let lookup_table_offset = r.u32()? as usize;
    let dex_layout_sections_offset = r.u32()?;
    let mut mapping_offsets = [0usize; 6];
    for slot in &mut mapping_offsets {
        *slot = r.u32()? as usize;
    }

    let class_offsets = if class_offsets_offset == 0 {
        vec![0; class_defs_size as usize]
    } else {
        check_aligned("class offsets", class_offsets_offset, 4)?;
        let mut cr = ByteReader::at(oatdata, class_offsets_offset, "class offsets")?;
        read_u32s(&mut cr, class_defs_size as usize)?
    };

    let lookup_table = if lookup_table_offset == 0 {
        None
    } else {
        check_aligned("type lookup table", lookup_table_offset, 4)?;
        let mut lr = ByteReader::at(oatdata, lookup_table_offset, "type lookup table")?;
        let found = lr.u32()? as usize;
        let expected = type_lookup_table_size(class_defs_size);
        if found != expected {
            return Err(LoadError::LookupTableSize {
                location,
                found,
                expected,
            });
        }
        lr.skip(found)?;
        Some((lookup_table_offset as u32 + 4, found as u32))
    };

    if dex_layout_sections_offset as usize > oatdata.len() {
        return Err(LoadError::layout(format!(
            "dex layout sections of '{location}' at {dex_layout_sections_offset:#x} past oatdata"
        )));
    }

    let [method, type_, public_type, package_type, string, method_type] =
        mapping_offsets.map(|offset| IndexBssMapping::parse(oatdata, offset, bss_size));
    let bss = BssMappings {
        method: method?,
        type_: type_?,
        public_type: public_type?,
        package_type: package_type?,
        string: string?,
        method_type: method_type?,
    };

    Ok(OatDexFile {
        location,
        checksum,
        sha1,
        bytecode_offset,
        class_defs_size,
        class_offsets,
        lookup_table,
        dex_layout_sections_offset,
        bss,
    })
}

/// Record bytes for the writer; offsets must already be final.
pub(crate) fn encode_record(out: &mut Vec<u8>, file: &OatDexFile, class_offsets_offset: u32, lookup_table_offset: u32, mapping_offsets: [u32; 6]) {
    out.put_u32(file.location.len() as u32);
    out.extend_from_slice(file.location.as_bytes());
    out.extend_from_slice(&DEX_MAGIC);
    out.put_u32(file.checksum);
    out.extend_from_slice(&file.sha1);
    out.put_u32(file.bytecode_offset);
    out.put_u32(class_offsets_offset);
    out.put_u32(lookup_table_offset);
    out.put_u32(file.dex_layout_sections_offset);
    for offset in mapping_offsets {
        out.put_u32(offset);
    }
}

/// Encoded size of a record with `location`.
pub(crate) const fn record_size(location: &str) -> usize {
    4 + location.len() + 4 + 4 + SHA1_SIZE + 4 + 3 * 4 + 6 * 4
}

fn read_u32s(r: &mut ByteReader<'_>, n: usize) -> Result<Vec<u32>> {
    let mut out = Vec::with_capacity(n.min(r.remaining() / 4));
    for _ in 0..n {
        out.push(r.u32()?);
    }
    Ok(out)
}

fn check_aligned(what: &'static str, value: usize, alignment: usize) -> Result<()> {
    if value % alignment != 0 {
        return Err(LoadError::Misaligned {
            what,
            value,
            alignment,
        });
    }
    Ok(())
}
