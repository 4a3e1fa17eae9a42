//! Producer of containers and side files.
//!
//! # Layout
//!
//! ```text
//!  0          ELF header + program headers
//!  P          oatdata: header, records, oat classes, class offsets,
//!             lookup tables, bss mappings                         (R)
//!  text       u32 size | code, entries 16-byte aligned   (R X, page aligned)
//!  rel.ro     u32 boot slots | u32 app slots             (R,   page aligned)
//!  bss        method slots | root slots                  (RW,  no file bytes)
//!             .dynstr .dynsym .shstrtab, section headers
//! ```
//!
//! Virtual addresses equal file offsets; `P` is the page size.

use std::path::Path;

use kiln_jit::blob::CODE_ALIGNMENT;
use kiln_jit::mem_map::{align_up, page_size};
use rustc_hash::FxHashMap;

use crate::bytes::PutLe;
use crate::dex_record::{self, BssMappings, OatClass, OatDexFile, SHA1_SIZE};
use crate::elf::{ElfBuilder, PF_R, PF_W, PF_X, Segment};
use crate::error::{LoadError, Result};
use crate::header::{COMPILER_FILTER_KEY, InstructionSet, OatHeader};
use crate::loader::{
    OATBSS, OATBSSLASTWORD, OATBSSMETHODS, OATBSSROOTS, OATDATA, OATDATAIMGRELRO,
    OATDATAIMGRELROAPPIMAGE, OATDATAIMGRELROLASTWORD, OATLASTWORD,
};
use crate::vdex;

const SLOT_SIZE: usize = size_of::<usize>();

/// One bytecode container to describe.
#[derive(Debug, Clone, Default)]
pub struct DexInput {
    pub location: String,
    pub checksum: u32,
    /// Compiled code per class and method; `None` for uncompiled methods.
    pub classes: Vec<Vec<Option<Vec<u8>>>>,
    pub bss: BssMappings,
    pub with_lookup_table: bool,
}

impl DexInput {
    pub fn new(location: impl Into<String>, checksum: u32) -> Self {
        Self {
            location: location.into(),
            checksum,
            with_lookup_table: true,
            ..Self::default()
        }
    }

    pub fn with_class(mut self, methods: Vec<Option<Vec<u8>>>) -> Self {
        self.classes.push(methods);
        self
    }

    pub fn with_bss(mut self, bss: BssMappings) -> Self {
        self.bss = bss;
        self
    }
}

/// Offsets chosen by [`OatWriter::write`], relative to `oatdata`.
#[derive(Debug, Clone, Default)]
pub struct WrittenLayout {
    /// Per dex file, class and method.
    pub code_offsets: Vec<Vec<Vec<Option<u32>>>>,
    pub executable_offset: u32,
}

/// Builds a container and its side file.
#[derive(Debug, Clone)]
pub struct OatWriter {
    header: OatHeader,
    dex_files: Vec<DexInput>,
    bss_method_slots: usize,
    bss_root_slots: usize,
    rel_ro_boot: Vec<u32>,
    rel_ro_app: Vec<u32>,
    /// Record checksums that deliberately differ from the side file.
    record_checksums: FxHashMap<usize, u32>,
}

impl Default for OatWriter {
    fn default() -> Self {
        Self::new()
    }
}

impl OatWriter {
    pub fn new() -> Self {
        let mut header = OatHeader::new(InstructionSet::host());
        header.set(COMPILER_FILTER_KEY, "speed");
        Self {
            header,
            dex_files: Vec::new(),
            bss_method_slots: 0,
            bss_root_slots: 0,
            rel_ro_boot: Vec::new(),
            rel_ro_app: Vec::new(),
            record_checksums: FxHashMap::default(),
        }
    }

    pub fn dex_file(mut self, dex: DexInput) -> Self {
        self.dex_files.push(dex);
        self
    }

    pub fn key_value(mut self, key: &str, value: &str) -> Self {
        self.header.set(key, value);
        self
    }

    pub fn instruction_set(mut self, isa: InstructionSet) -> Self {
        self.header.instruction_set = isa;
        self
    }

    /// Size the `.bss` for `methods` method slots followed by `roots` root
    /// slots, pointer sized each.
    pub fn bss_slots(mut self, methods: usize, roots: usize) -> Self {
        self.bss_method_slots = methods;
        self.bss_root_slots = roots;
        self
    }

    pub fn rel_ro(mut self, boot: Vec<u32>, app: Vec<u32>) -> Self {
        self.rel_ro_boot = boot;
        self.rel_ro_app = app;
        self
    }

    /// Record `checksum` for dex file `index` in the container while the
    /// side file keeps the real one.
    pub fn record_checksum(mut self, index: usize, checksum: u32) -> Self {
        self.record_checksums.insert(index, checksum);
        self
    }

    /// Write the container to `oat_path` and the side file to `vdex_path`.
    pub fn write(&self, oat_path: &Path, vdex_path: &Path) -> Result<WrittenLayout> {
        let dex_bytes: Vec<Vec<u8>> = self
            .dex_files
            .iter()
            .map(|d| vdex::build_dex(d.checksum, d.classes.len() as u32))
            .collect();
        let checksums: Vec<u32> = self.dex_files.iter().map(|d| d.checksum).collect();
        let (vdex_bytes, bytecode_offsets) = vdex::build_vdex(&dex_bytes, &checksums);
        std::fs::write(vdex_path, &vdex_bytes).map_err(|e| LoadError::io(vdex_path, e))?;

        let (file, layout) = self.build_container(&bytecode_offsets);
        std::fs::write(oat_path, &file).map_err(|e| LoadError::io(oat_path, e))?;
        tracing::debug!(
            path = %oat_path.display(),
            bytes = file.len(),
            dex_files = self.dex_files.len(),
            "wrote container"
        );
        Ok(layout)
    }

    fn build_container(&self, bytecode_offsets: &[u32]) -> (Vec<u8>, WrittenLayout) {
        let page = page_size();
        let oatdata = page;

        // Text first: its size is independent of where it lands.
        let mut text = Vec::new();
        let mut relative: Vec<Vec<Vec<Option<usize>>>> = Vec::with_capacity(self.dex_files.len());
        for dex in &self.dex_files {
            let mut classes = Vec::with_capacity(dex.classes.len());
            for methods in &dex.classes {
                let mut entries = Vec::with_capacity(methods.len());
                for code in methods {
                    entries.push(code.as_ref().map(|code| {
                        while (text.len() + 4) % CODE_ALIGNMENT != 0 {
                            text.push(0);
                        }
                        text.put_u32(code.len() as u32);
                        let entry = text.len();
                        text.extend_from_slice(code);
                        entry
                    }));
                }
                classes.push(entries);
            }
            relative.push(classes);
        }
        if text.is_empty() {
            text.put_u32(0);
        }
        text.pad_to(4);

        let rodata_len = self.rodata(&relative, 0, bytecode_offsets).len();
        let text_off = align_up(oatdata + rodata_len, page);
        let executable_offset = (text_off - oatdata) as u32;
        let rodata = self.rodata(&relative, executable_offset, bytecode_offsets);
        debug_assert_eq!(rodata.len(), rodata_len);

        let mut file = vec![0u8; oatdata];
        file.extend_from_slice(&rodata);
        file.resize(text_off, 0);
        file.extend_from_slice(&text);
        let text_end = file.len();

        let mut builder = ElfBuilder::default();
        builder.segment(Segment {
            offset: 0,
            vaddr: 0,
            filesz: (oatdata + rodata.len()) as u64,
            memsz: (oatdata + rodata.len()) as u64,
            flags: PF_R,
        });
        builder.segment(Segment {
            offset: text_off as u64,
            vaddr: text_off as u64,
            filesz: text.len() as u64,
            memsz: text.len() as u64,
            flags: PF_R | PF_X,
        });
        builder.symbol(OATDATA, oatdata as u64, (text_end - oatdata) as u64);
        builder.symbol(OATLASTWORD, (text_end - 4) as u64, 4);

        let slots = self.rel_ro_boot.len() + self.rel_ro_app.len();
        if slots > 0 {
            let rel_ro = align_up(text_end, page);
            file.resize(rel_ro, 0);
            for &slot in self.rel_ro_boot.iter().chain(&self.rel_ro_app) {
                file.put_u32(slot);
            }
            let end = file.len();
            builder.segment(Segment {
                offset: rel_ro as u64,
                vaddr: rel_ro as u64,
                filesz: (end - rel_ro) as u64,
                memsz: (end - rel_ro) as u64,
                flags: PF_R,
            });
            builder.symbol(OATDATAIMGRELRO, rel_ro as u64, (end - rel_ro) as u64);
            builder.symbol(OATDATAIMGRELROLASTWORD, (end - 4) as u64, 4);
            builder.symbol(
                OATDATAIMGRELROAPPIMAGE,
                (rel_ro + 4 * self.rel_ro_boot.len()) as u64,
                (4 * self.rel_ro_app.len()) as u64,
            );
        }

        let bss_len = (self.bss_method_slots + self.bss_root_slots) * SLOT_SIZE;
        if bss_len > 0 {
            let bss = align_up(file.len(), page);
            file.resize(bss, 0);
            builder.segment(Segment {
                offset: bss as u64,
                vaddr: bss as u64,
                filesz: 0,
                memsz: bss_len as u64,
                flags: PF_R | PF_W,
            });
            builder.symbol(OATBSS, bss as u64, bss_len as u64);
            builder.symbol(OATBSSLASTWORD, (bss + bss_len - 4) as u64, 4);
            if self.bss_method_slots > 0 {
                builder.symbol(OATBSSMETHODS, bss as u64, (self.bss_method_slots * SLOT_SIZE) as u64);
            }
            if self.bss_root_slots > 0 {
                let roots = bss + self.bss_method_slots * SLOT_SIZE;
                builder.symbol(OATBSSROOTS, roots as u64, (self.bss_root_slots * SLOT_SIZE) as u64);
            }
        }

        let code_offsets = relative
            .iter()
            .map(|classes| {
                classes
                    .iter()
                    .map(|methods| {
                        methods
                            .iter()
                            .map(|entry| entry.map(|e| executable_offset + e as u32))
                            .collect()
                    })
                    .collect()
            })
            .collect();
        (
            builder.finish(file),
            WrittenLayout {
                code_offsets,
                executable_offset,
            },
        )
    }

    /// Bytes from `oatdata` up to the text. Its length does not depend on
    /// `executable_offset`.
    fn rodata(
        &self,
        relative: &[Vec<Vec<Option<usize>>>],
        executable_offset: u32,
        bytecode_offsets: &[u32],
    ) -> Vec<u8> {
        let mut header = self.header.clone();
        header.dex_file_count = self.dex_files.len() as u32;
        header.executable_offset = executable_offset;
        header.oat_dex_files_offset = header.size().next_multiple_of(4) as u32;

        let mut out = Vec::new();
        header.encode(&mut out);
        out.pad_to(4);
        let records_at = out.len();
        let records_len: usize = self
            .dex_files
            .iter()
            .map(|d| dex_record::record_size(&d.location))
            .sum();
        out.resize(records_at + records_len, 0);
        out.pad_to(4);

        let mut records = Vec::with_capacity(records_len);
        for (index, dex) in self.dex_files.iter().enumerate() {
            let mut class_offsets = Vec::with_capacity(dex.classes.len());
            for entries in &relative[index] {
                let offsets: Vec<Option<u32>> = entries
                    .iter()
                    .map(|e| e.map(|e| executable_offset + e as u32))
                    .collect();
                let class = OatClass::with_methods(0, &offsets);
                class_offsets.push(out.len() as u32);
                class.encode(&mut out);
                out.pad_to(4);
            }

            let class_offsets_offset = out.len() as u32;
            for offset in class_offsets {
                out.put_u32(offset);
            }

            let table_size = dex_record::type_lookup_table_size(dex.classes.len() as u32);
            let lookup_table_offset = if dex.with_lookup_table && table_size > 0 {
                let at = out.len() as u32;
                out.put_u32(table_size as u32);
                out.resize(out.len() + table_size, 0);
                at
            } else {
                0
            };

            let mut mapping_offsets = [0u32; 6];
            for (slot, mapping) in mapping_offsets.iter_mut().zip(dex.bss.all()) {
                if mapping.is_empty() {
                    continue;
                }
                *slot = out.len() as u32;
                mapping.encode(&mut out);
            }

            let record = OatDexFile {
                location: dex.location.clone(),
                checksum: self
                    .record_checksums
                    .get(&index)
                    .copied()
                    .unwrap_or(dex.checksum),
                sha1: [index as u8; SHA1_SIZE],
                bytecode_offset: bytecode_offsets[index],
                class_defs_size: dex.classes.len() as u32,
                class_offsets: Vec::new(),
                lookup_table: None,
                dex_layout_sections_offset: 0,
                bss: BssMappings::default(),
            };
            dex_record::encode_record(
                &mut records,
                &record,
                class_offsets_offset,
                lookup_table_offset,
                mapping_offsets,
            );
        }
        out[records_at..records_at + records_len].copy_from_slice(&records);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::elf::ElfImage;

    fn writer() -> OatWriter {
        OatWriter::new()
            .dex_file(
                DexInput::new("app.apk", 0x1111)
                    .with_class(vec![Some(vec![0xC3; 10]), None])
                    .with_class(vec![Some(vec![0x90; 40])]),
            )
            .bss_slots(2, 3)
    }

    #[test]
    fn test_layout_is_page_aligned() {
        let (file, layout) = writer().build_container(&[0x40]);
        let elf = ElfImage::parse(&file).unwrap();
        let page = page_size() as u64;
        let oatdata = elf.symbol(OATDATA).unwrap();
        assert_eq!(oatdata, page);
        assert_eq!(layout.executable_offset as u64 % page, 0);
        let bss = elf.symbol(OATBSS).unwrap();
        assert_eq!(bss % page, 0);
        assert_eq!(elf.symbol(OATBSSMETHODS), Some(bss));
        assert_eq!(elf.symbol(OATBSSROOTS), Some(bss + 16));
        assert_eq!(elf.symbol(OATBSSLASTWORD), Some(bss + 40 - 4));
        assert!(elf.symbol(OATDATAIMGRELRO).is_none());

        let header = OatHeader::parse(&file[page as usize..]).unwrap();
        assert_eq!(header.dex_file_count, 1);
        assert_eq!(header.executable_offset, layout.executable_offset);
    }

    #[test]
    fn test_code_entries_aligned_with_size_prefix() {
        let (file, layout) = writer().build_container(&[0x40]);
        let oatdata = page_size();
        let offsets = &layout.code_offsets[0];
        assert_eq!(offsets[0][1], None);
        for (offset, len) in [(offsets[0][0].unwrap(), 10u32), (offsets[1][0].unwrap(), 40)] {
            let entry = oatdata + offset as usize;
            assert_eq!(entry % CODE_ALIGNMENT, 0);
            let size = u32::from_le_bytes(file[entry - 4..entry].try_into().unwrap());
            assert_eq!(size, len);
        }
    }

    #[test]
    fn test_rel_ro_symbols() {
        let (file, _) = writer().rel_ro(vec![1, 2, 3], vec![4]).build_container(&[0x40]);
        let elf = ElfImage::parse(&file).unwrap();
        let begin = elf.symbol(OATDATAIMGRELRO).unwrap();
        assert_eq!(begin % page_size() as u64, 0);
        assert_eq!(elf.symbol(OATDATAIMGRELROAPPIMAGE), Some(begin + 12));
        assert_eq!(elf.symbol(OATDATAIMGRELROLASTWORD), Some(begin + 12));
        let at = begin as usize;
        assert_eq!(u32::from_le_bytes(file[at + 4..at + 8].try_into().unwrap()), 2);
    }
}
