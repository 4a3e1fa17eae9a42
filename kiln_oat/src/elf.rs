//! Minimal ELF64 support.
//!
//! Containers are little-endian ELF shared objects. The loader only needs the
//! loadable segments and the dynamic symbol table; the writer emits exactly
//! that plus the section headers that locate the symbols.
//!
//! ```text
//!  ┌──────────────┐ 0
//!  │ ELF header   │
//!  │ phdrs        │
//!  ├──────────────┤ page
//!  │ PT_LOAD ...  │ file offset == vaddr
//!  ├──────────────┤
//!  │ .dynstr      │ not loaded
//!  │ .dynsym      │
//!  │ .shstrtab    │
//!  │ shdrs        │
//!  └──────────────┘
//! ```

use rustc_hash::FxHashMap;

use kiln_jit::mem_map::Protection;

use crate::bytes::{ByteReader, PutLe};
use crate::error::{LoadError, Result};

pub const ELF_MAGIC: [u8; 4] = *b"\x7fELF";
const ELFCLASS64: u8 = 2;
const ELFDATA2LSB: u8 = 1;
const EV_CURRENT: u8 = 1;
pub const ET_DYN: u16 = 3;

pub const PT_LOAD: u32 = 1;
pub const PF_X: u32 = 1;
pub const PF_W: u32 = 2;
pub const PF_R: u32 = 4;

const SHT_STRTAB: usize = 3;
const SHT_DYNSYM: usize = 11;

pub const EHDR_SIZE: usize = 64;
pub const PHDR_SIZE: usize = 56;
const SHDR_SIZE: usize = 64;
const SYM_SIZE: usize = 24;

#[cfg(target_arch = "x86_64")]
const EM_HOST: u16 = 62;
#[cfg(target_arch = "aarch64")]
const EM_HOST: u16 = 183;
#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
const EM_HOST: u16 = 0;

/// A `PT_LOAD` program header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    pub offset: u64,
    pub vaddr: u64,
    pub filesz: u64,
    pub memsz: u64,
    pub flags: u32,
}

impl Segment {
    pub fn protection(&self) -> Protection {
        let mut prot = Protection::empty();
        if self.flags & PF_R != 0 {
            prot |= Protection::READ;
        }
        if self.flags & PF_W != 0 {
            prot |= Protection::WRITE;
        }
        if self.flags & PF_X != 0 {
            prot |= Protection::EXEC;
        }
        prot
    }

    #[inline]
    pub fn is_executable(&self) -> bool {
        self.flags & PF_X != 0
    }
}

/// Loadable segments and dynamic symbols of an ELF file.
#[derive(Debug, Clone, Default)]
pub struct ElfImage {
    segments: Vec<Segment>,
    symbols: FxHashMap<String, u64>,
}

impl ElfImage {
    pub fn parse(data: &[u8]) -> Result<Self> {
        let mut r = ByteReader::new(data, "ELF header");
        let ident = r.array::<16>()?;
        if ident[..4] != ELF_MAGIC {
            return Err(LoadError::BadMagic {
                what: "ELF",
                found: ident[..4].to_vec(),
            });
        }
        if ident[4] != ELFCLASS64 {
            return Err(LoadError::InvalidElf("not a 64-bit object"));
        }
        if ident[5] != ELFDATA2LSB {
            return Err(LoadError::InvalidElf("not little-endian"));
        }
        if r.u16()? != ET_DYN {
            return Err(LoadError::InvalidElf("not a shared object"));
        }
        r.skip(2 + 4 + 8)?;
        let phoff = r.u64()? as usize;
        let shoff = r.u64()? as usize;
        r.skip(4 + 2)?;
        let phentsize = r.u16()? as usize;
        let phnum = r.u16()? as usize;
        let shentsize = r.u16()? as usize;
        let shnum = r.u16()? as usize;
        let _shstrndx = r.u16()?;
        if phentsize != PHDR_SIZE || (shnum != 0 && shentsize != SHDR_SIZE) {
            return Err(LoadError::InvalidElf("unexpected header entry size"));
        }

        let mut segments = Vec::new();
        for i in 0..phnum {
            let mut r = ByteReader::at(data, phoff + i * PHDR_SIZE, "program header")?;
            let p_type = r.u32()?;
            let flags = r.u32()?;
            let offset = r.u64()?;
            let vaddr = r.u64()?;
            let _paddr = r.u64()?;
            let filesz = r.u64()?;
            let memsz = r.u64()?;
            if p_type != PT_LOAD {
                continue;
            }
            if filesz > memsz {
                return Err(LoadError::InvalidElf("segment file size exceeds memory size"));
            }
            if offset.saturating_add(filesz) > data.len() as u64 {
                return Err(LoadError::Truncated {
                    what: "segment",
                    offset: offset as usize,
                    needed: filesz as usize,
                    size: data.len().saturating_sub(offset as usize),
                });
            }
            segments.push(Segment {
                offset,
                vaddr,
                filesz,
                memsz,
                flags,
            });
        }
        if segments.is_empty() {
            return Err(LoadError::InvalidElf("no loadable segments"));
        }
        segments.sort_unstable_by_key(|s| s.vaddr);

        let symbols = Self::parse_dynsym(data, shoff, shnum)?;
        Ok(Self { segments, symbols })
    }

    fn parse_dynsym(data: &[u8], shoff: usize, shnum: usize) -> Result<FxHashMap<String, u64>> {
        struct Section {
            kind: usize,
            offset: usize,
            size: usize,
            link: usize,
        }
        let mut sections = Vec::with_capacity(shnum);
        for i in 0..shnum {
            let mut r = ByteReader::at(data, shoff + i * SHDR_SIZE, "section header")?;
            let _name = r.u32()?;
            let kind = r.u32()? as usize;
            r.skip(16)?;
            let offset = r.u64()? as usize;
            let size = r.u64()? as usize;
            let link = r.u32()? as usize;
            sections.push(Section {
                kind,
                offset,
                size,
                link,
            });
        }

        let mut symbols = FxHashMap::default();
        let Some(dynsym) = sections.iter().find(|s| s.kind == SHT_DYNSYM) else {
            return Ok(symbols);
        };
        let strtab = sections
            .get(dynsym.link)
            .filter(|s| s.kind == SHT_STRTAB)
            .ok_or(LoadError::InvalidElf("dynamic symbols without a string table"))?;
        let strings = ByteReader::at(data, strtab.offset, "string table")?
            .bytes(strtab.size)?;
        let mut r = ByteReader::at(data, dynsym.offset, "symbol table")?;
        for _ in 0..dynsym.size / SYM_SIZE {
            let name = r.u32()? as usize;
            r.skip(4)?;
            let value = r.u64()?;
            let _size = r.u64()?;
            if name == 0 {
                continue;
            }
            let tail = strings
                .get(name..)
                .ok_or(LoadError::InvalidElf("symbol name out of bounds"))?;
            let end = tail
                .iter()
                .position(|&b| b == 0)
                .ok_or(LoadError::InvalidElf("unterminated symbol name"))?;
            let name = std::str::from_utf8(&tail[..end])
                .map_err(|_| LoadError::InvalidElf("symbol name is not UTF-8"))?;
            symbols.insert(name.to_owned(), value);
        }
        Ok(symbols)
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// Virtual address of a dynamic symbol.
    pub fn symbol(&self, name: &str) -> Option<u64> {
        self.symbols.get(name).copied()
    }

    /// Lowest and one-past-highest virtual address of all segments.
    pub fn load_span(&self) -> (u64, u64) {
        let begin = self.segments.iter().map(|s| s.vaddr).min().unwrap_or(0);
        let end = self
            .segments
            .iter()
            .map(|s| s.vaddr + s.memsz)
            .max()
            .unwrap_or(0);
        (begin, end)
    }
}

// =============================================================================
// Builder
// =============================================================================

/// Assembles an ELF file around already laid out segment contents.
#[derive(Debug, Default)]
pub(crate) struct ElfBuilder {
    segments: Vec<Segment>,
    symbols: Vec<(String, u64, u64)>,
}

impl ElfBuilder {
    /// Bytes reserved at the start of the file for the headers.
    pub(crate) const fn header_size(segments: usize) -> usize {
        EHDR_SIZE + segments * PHDR_SIZE
    }

    pub(crate) fn segment(&mut self, segment: Segment) {
        self.segments.push(segment);
    }

    pub(crate) fn symbol(&mut self, name: &str, value: u64, size: u64) {
        self.symbols.push((name.to_owned(), value, size));
    }

    /// Append the symbol tables to `file` and fill in the headers, whose
    /// space `file` must already reserve.
    pub(crate) fn finish(self, mut file: Vec<u8>) -> Vec<u8> {
        assert!(file.len() >= Self::header_size(self.segments.len()));

        file.pad_to(8);
        let dynstr_off = file.len();
        let mut name_offsets = Vec::with_capacity(self.symbols.len());
        file.push(0);
        for (name, _, _) in &self.symbols {
            name_offsets.push((file.len() - dynstr_off) as u32);
            file.extend_from_slice(name.as_bytes());
            file.push(0);
        }
        let dynstr_size = file.len() - dynstr_off;

        file.pad_to(8);
        let dynsym_off = file.len();
        file.resize(file.len() + SYM_SIZE, 0);
        for ((_, value, size), name) in self.symbols.iter().zip(&name_offsets) {
            file.put_u32(*name);
            file.push(0x11); // STB_GLOBAL | STT_OBJECT
            file.push(0);
            file.put_u16(1);
            file.put_u64(*value);
            file.put_u64(*size);
        }
        let dynsym_size = file.len() - dynsym_off;

        let shstrtab_off = file.len();
        let shstrtab = b"\0.dynstr\0.dynsym\0.shstrtab\0";
        file.extend_from_slice(shstrtab);

        file.pad_to(8);
        let shoff = file.len();
        put_section(&mut file, [0, 0, 0, 0, 0, 0, 0]);
        put_section(&mut file, [1, SHT_STRTAB, dynstr_off, dynstr_size, 0, 0, 0]);
        put_section(&mut file, [9, SHT_DYNSYM, dynsym_off, dynsym_size, 1, 1, SYM_SIZE]);
        put_section(&mut file, [17, SHT_STRTAB, shstrtab_off, shstrtab.len(), 0, 0, 0]);

        let mut header = Vec::with_capacity(Self::header_size(self.segments.len()));
        header.extend_from_slice(&ELF_MAGIC);
        header.extend_from_slice(&[ELFCLASS64, ELFDATA2LSB, EV_CURRENT]);
        header.resize(16, 0);
        header.put_u16(ET_DYN);
        header.put_u16(EM_HOST);
        header.put_u32(1);
        header.put_u64(0);
        header.put_u64(EHDR_SIZE as u64);
        header.put_u64(shoff as u64);
        header.put_u32(0);
        header.put_u16(EHDR_SIZE as u16);
        header.put_u16(PHDR_SIZE as u16);
        header.put_u16(self.segments.len() as u16);
        header.put_u16(SHDR_SIZE as u16);
        header.put_u16(4);
        header.put_u16(3);
        for s in &self.segments {
            header.put_u32(PT_LOAD);
            header.put_u32(s.flags);
            header.put_u64(s.offset);
            header.put_u64(s.vaddr);
            header.put_u64(s.vaddr);
            header.put_u64(s.filesz);
            header.put_u64(s.memsz);
            header.put_u64(kiln_jit::mem_map::page_size() as u64);
        }
        file[..header.len()].copy_from_slice(&header);
        file
    }
}

/// `[name, kind, offset, size, link, info, entsize]`
fn put_section(file: &mut Vec<u8>, fields: [usize; 7]) {
    let [name, kind, offset, size, link, info, entsize] = fields;
    file.put_u32(name as u32);
    file.put_u32(kind as u32);
    file.put_u64(0);
    file.put_u64(0);
    file.put_u64(offset as u64);
    file.put_u64(size as u64);
    file.put_u32(link as u32);
    file.put_u32(info as u32);
    file.put_u64(8);
    file.put_u64(entsize as u64);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build() -> Vec<u8> {
        let mut builder = ElfBuilder::default();
        builder.segment(Segment {
            offset: 0,
            vaddr: 0,
            filesz: 0x200,
            memsz: 0x200,
            flags: PF_R,
        });
        builder.segment(Segment {
            offset: 0x200,
            vaddr: 0x1000,
            filesz: 0,
            memsz: 0x800,
            flags: PF_R | PF_W,
        });
        builder.symbol("oatdata", 0x100, 0x100);
        builder.symbol("oatbss", 0x1000, 0x800);
        builder.finish(vec![0; 0x200])
    }

    #[test]
    fn test_builder_output_parses() {
        let image = ElfImage::parse(&build()).unwrap();
        assert_eq!(image.segments().len(), 2);
        assert_eq!(image.symbol("oatdata"), Some(0x100));
        assert_eq!(image.symbol("oatbss"), Some(0x1000));
        assert_eq!(image.symbol("oatdex"), None);
        assert_eq!(image.load_span(), (0, 0x1800));
        assert_eq!(image.segments()[1].protection(), Protection::RW);
    }

    #[test]
    fn test_rejects_bad_magic() {
        let mut file = build();
        file[0] = b'X';
        assert!(matches!(
            ElfImage::parse(&file),
            Err(LoadError::BadMagic { what: "ELF", .. })
        ));
    }

    #[test]
    fn test_rejects_truncated_segment() {
        let mut file = build();
        // Grow the first segment's file size past the end of the file.
        let filesz_at = EHDR_SIZE + 32;
        file[filesz_at..filesz_at + 8].copy_from_slice(&(1u64 << 40).to_le_bytes());
        let memsz_at = EHDR_SIZE + 40;
        file[memsz_at..memsz_at + 8].copy_from_slice(&(1u64 << 40).to_le_bytes());
        assert!(matches!(ElfImage::parse(&file), Err(LoadError::Truncated { .. })));
    }
}
