//! Container header and key/value store.
//!
//! ```text
//!  oatdata ─► "oat\n" "230\0"
//!             u32 instruction_set
//!             u32 dex_file_count
//!             u32 oat_dex_files_offset   (relative to oatdata)
//!             u32 executable_offset      (relative to oatdata)
//!             u32 key_value_store_size
//!             key\0value\0 ...
//! ```

use crate::bytes::{ByteReader, PutLe};
use crate::error::{LoadError, Result};

pub const OAT_MAGIC: [u8; 4] = *b"oat\n";
pub const OAT_VERSION: [u8; 4] = *b"230\0";

/// Bytes before the key/value store.
pub const FIXED_HEADER_SIZE: usize = 8 + 5 * 4;

pub const COMPILER_FILTER_KEY: &str = "compiler_filter";
pub const COMPILATION_REASON_KEY: &str = "compilation_reason";
pub const CLASS_PATH_KEY: &str = "class_path";
pub const CONCURRENT_COPYING_KEY: &str = "concurrent_copying";
pub const APEX_VERSIONS_KEY: &str = "apex_versions";
/// Presence marks a container compiled against a boot image.
pub const BOOT_CLASS_PATH_CHECKSUMS_KEY: &str = "boot_class_path_checksums";

/// Instruction set a container was compiled for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum InstructionSet {
    None = 0,
    Arm64 = 2,
    X86_64 = 5,
}

impl InstructionSet {
    pub fn host() -> Self {
        if cfg!(target_arch = "x86_64") {
            InstructionSet::X86_64
        } else if cfg!(target_arch = "aarch64") {
            InstructionSet::Arm64
        } else {
            InstructionSet::None
        }
    }

    fn from_u32(value: u32) -> Option<Self> {
        match value {
            0 => Some(InstructionSet::None),
            2 => Some(InstructionSet::Arm64),
            5 => Some(InstructionSet::X86_64),
            _ => None,
        }
    }
}

/// Parsed container header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OatHeader {
    pub instruction_set: InstructionSet,
    pub dex_file_count: u32,
    pub oat_dex_files_offset: u32,
    pub executable_offset: u32,
    store: Vec<(String, String)>,
}

impl OatHeader {
    pub fn new(instruction_set: InstructionSet) -> Self {
        Self {
            instruction_set,
            dex_file_count: 0,
            oat_dex_files_offset: 0,
            executable_offset: 0,
            store: Vec::new(),
        }
    }

    /// Parse the header at the start of `oatdata`.
    pub fn parse(oatdata: &[u8]) -> Result<Self> {
        let mut r = ByteReader::new(oatdata, "container header");
        let magic = r.array::<4>()?;
        if magic != OAT_MAGIC {
            return Err(LoadError::BadMagic {
                what: "container",
                found: magic.to_vec(),
            });
        }
        let version = r.array::<4>()?;
        if version != OAT_VERSION {
            return Err(LoadError::BadVersion {
                what: "container",
                found: version.to_vec(),
            });
        }
        let isa = r.u32()?;
        let instruction_set = InstructionSet::from_u32(isa)
            .ok_or_else(|| LoadError::layout(format!("unknown instruction set {isa}")))?;
        let dex_file_count = r.u32()?;
        let oat_dex_files_offset = r.u32()?;
        let executable_offset = r.u32()?;
        let store_size = r.u32()? as usize;
        let store = parse_store(r.bytes(store_size)?)?;
        Ok(Self {
            instruction_set,
            dex_file_count,
            oat_dex_files_offset,
            executable_offset,
            store,
        })
    }

    /// Bytes of header plus store as [`OatHeader::encode`] writes them.
    pub fn size(&self) -> usize {
        FIXED_HEADER_SIZE + self.store_size()
    }

    fn store_size(&self) -> usize {
        self.store.iter().map(|(k, v)| k.len() + v.len() + 2).sum()
    }

    pub fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&OAT_MAGIC);
        out.extend_from_slice(&OAT_VERSION);
        out.put_u32(self.instruction_set as u32);
        out.put_u32(self.dex_file_count);
        out.put_u32(self.oat_dex_files_offset);
        out.put_u32(self.executable_offset);
        out.put_u32(self.store_size() as u32);
        for (key, value) in &self.store {
            out.extend_from_slice(key.as_bytes());
            out.push(0);
            out.extend_from_slice(value.as_bytes());
            out.push(0);
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.store
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Set `key`, replacing an existing value.
    pub fn set(&mut self, key: &str, value: &str) {
        match self.store.iter_mut().find(|(k, _)| k == key) {
            Some((_, v)) => *v = value.to_owned(),
            None => self.store.push((key.to_owned(), value.to_owned())),
        }
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.store.iter().map(|(k, _)| k.as_str())
    }

    pub fn has_boot_image_dependency(&self) -> bool {
        self.get(BOOT_CLASS_PATH_CHECKSUMS_KEY).is_some()
    }

    /// Whether the container was compiled for a concurrent-copying collector.
    pub fn is_concurrent_copying(&self) -> bool {
        self.get(CONCURRENT_COPYING_KEY) == Some("true")
    }
}

fn parse_store(bytes: &[u8]) -> Result<Vec<(String, String)>> {
    let mut store = Vec::new();
    let mut parts = bytes.split(|&b| b == 0);
    let text = |part: &[u8]| {
        std::str::from_utf8(part)
            .map(str::to_owned)
            .map_err(|_| LoadError::layout("key/value store is not UTF-8"))
    };
    if bytes.last().is_some_and(|&b| b != 0) {
        return Err(LoadError::layout("key/value store is not NUL terminated"));
    }
    while let Some(key) = parts.next() {
        if key.is_empty() {
            // Trailing split after the final terminator.
            break;
        }
        let value = parts
            .next()
            .ok_or_else(|| LoadError::layout("key without value in key/value store"))?;
        store.push((text(key)?, text(value)?));
    }
    Ok(store)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> OatHeader {
        let mut header = OatHeader::new(InstructionSet::X86_64);
        header.dex_file_count = 2;
        header.oat_dex_files_offset = 0x40;
        header.executable_offset = 0x1000;
        header.set(COMPILER_FILTER_KEY, "speed");
        header.set(BOOT_CLASS_PATH_CHECKSUMS_KEY, "i;1/abcd");
        header
    }

    #[test]
    fn test_parse_encoded_header() {
        let header = sample();
        let mut bytes = Vec::new();
        header.encode(&mut bytes);
        assert_eq!(bytes.len(), header.size());
        let parsed = OatHeader::parse(&bytes).unwrap();
        assert_eq!(parsed, header);
        assert_eq!(parsed.get(COMPILER_FILTER_KEY), Some("speed"));
        assert!(parsed.has_boot_image_dependency());
        assert_eq!(parsed.keys().collect::<Vec<_>>(), [COMPILER_FILTER_KEY, BOOT_CLASS_PATH_CHECKSUMS_KEY]);
    }

    #[test]
    fn test_set_replaces_value() {
        let mut header = sample();
        header.set(COMPILER_FILTER_KEY, "verify");
        assert_eq!(header.get(COMPILER_FILTER_KEY), Some("verify"));
        assert_eq!(header.keys().count(), 2);
    }

    #[test]
    fn test_rejects_wrong_version() {
        let mut bytes = Vec::new();
        sample().encode(&mut bytes);
        bytes[4..8].copy_from_slice(b"229\0");
        assert!(matches!(OatHeader::parse(&bytes), Err(LoadError::BadVersion { .. })));
    }

    #[test]
    fn test_rejects_truncated_store() {
        let mut bytes = Vec::new();
        sample().encode(&mut bytes);
        bytes.truncate(bytes.len() - 3);
        assert!(matches!(OatHeader::parse(&bytes), Err(LoadError::Truncated { .. })));
    }

    #[test]
    fn test_empty_store() {
        let mut bytes = Vec::new();
        OatHeader::new(InstructionSet::Arm64).encode(&mut bytes);
        let parsed = OatHeader::parse(&bytes).unwrap();
        assert_eq!(parsed.keys().count(), 0);
    }
}
