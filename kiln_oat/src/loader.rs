//! Container loading.
//!
//! # State Machine
//!
//! ```text
//!   Allocated ──► Loaded ──► FieldsComputed ──► Prepared ──► WiredToDex ──► Ready
//!                   │              │                │             │
//!   map segments ───┘   resolve ───┘   open vdex ───┘   records ──┘   relocate rel.ro
//!   (dlopen or manual)  symbols
//! ```
//!
//! Any failing step rejects the container with a [`LoadError`]; the caller
//! falls back to interpreting bytecode.

use std::ffi::{CStr, CString, c_void};
use std::fs::File;
use std::ops::Range;
use std::os::fd::AsFd;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use dashmap::DashMap;
use kiln_jit::mem_map::{MemMap, Protection, align_down, align_up, page_size};
use tracing::{debug, info, warn};

use crate::dex_record::{self, OatDexFile};
use crate::elf::{ElfImage, Segment};
use crate::error::{LoadError, Result};
use crate::header::{APEX_VERSIONS_KEY, InstructionSet, OatHeader};
use crate::relocation::RelRo;
use crate::sidecar::Sidecar;
use crate::vdex::VdexFile;

// =============================================================================
// Symbols
// =============================================================================

pub const OATDATA: &str = "oatdata";
pub const OATLASTWORD: &str = "oatlastword";
pub const OATBSS: &str = "oatbss";
pub const OATBSSLASTWORD: &str = "oatbsslastword";
pub const OATBSSMETHODS: &str = "oatbssmethods";
pub const OATBSSROOTS: &str = "oatbssroots";
pub const OATDEX: &str = "oatdex";
pub const OATDEXLASTWORD: &str = "oatdexlastword";
pub const OATDATAIMGRELRO: &str = "oatdataimgrelro";
pub const OATDATAIMGRELROLASTWORD: &str = "oatdataimgrelrolastword";
pub const OATDATAIMGRELROAPPIMAGE: &str = "oatdataimgrelroappimage";

/// `*lastword` symbols mark the last 4-byte word of their range.
const LAST_WORD: usize = 4;

// =============================================================================
// Options
// =============================================================================

/// How to load a container.
#[derive(Debug, Clone)]
pub struct LoadOptions {
    /// Map code executable. Non-executable loads only inspect the file.
    pub executable: bool,
    /// Try the dynamic linker before mapping manually.
    pub use_dlopen: bool,
    /// Page-aligned address range reserved by the caller to map into.
    pub reservation: Option<Range<usize>>,
    /// Side file; defaults to the container path with a `vdex` extension.
    pub vdex_path: Option<PathBuf>,
    /// Descriptor of a preinstalled container.
    pub sidecar_path: Option<PathBuf>,
    /// Current boot image base, added to boot-image relocation slots.
    pub boot_image_begin: u32,
    /// Current app image base, added to app-image relocation slots.
    pub app_image_begin: u32,
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self {
            executable: true,
            use_dlopen: false,
            reservation: None,
            vdex_path: None,
            sidecar_path: None,
            boot_image_begin: 0,
            app_image_begin: 0,
        }
    }
}

impl LoadOptions {
    /// Options for devices, where native debuggers need the dynamic linker
    /// to know about every container.
    pub fn on_device() -> Self {
        Self {
            use_dlopen: true,
            ..Self::default()
        }
    }

    /// Inspect a container without executing it.
    pub fn inspect() -> Self {
        Self {
            executable: false,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if let Some(range) = &self.reservation {
            for (what, value) in [("reservation begin", range.start), ("reservation end", range.end)] {
                if value % page_size() != 0 {
                    return Err(LoadError::Misaligned {
                        what,
                        value,
                        alignment: page_size(),
                    });
                }
            }
            if range.is_empty() {
                return Err(LoadError::layout("empty reservation"));
            }
        }
        Ok(())
    }
}

// =============================================================================
// Loader
// =============================================================================

/// Progress of a load.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LoaderState {
    Allocated,
    Loaded,
    FieldsComputed,
    Prepared,
    WiredToDex,
    Ready,
}

/// Process-wide table of dynamic-linker handles, to detect linkers that
/// hand out the same handle for repeated opens of one file.
static DLOPEN_HANDLES: LazyLock<DashMap<usize, PathBuf>> = LazyLock::new(DashMap::new);

#[derive(Debug)]
enum Mapping {
    None,
    Manual {
        elf: ElfImage,
        /// Load bias: address of virtual address 0.
        bias: usize,
        span: Range<usize>,
        /// Set when the loader reserved the span itself.
        owned: Option<MemMap>,
    },
    Dlopen {
        handle: usize,
    },
}

/// Resolved section bounds.
#[derive(Debug, Clone)]
struct Sections {
    oatdata: Range<usize>,
    bss: Range<usize>,
    bss_methods: Option<usize>,
    bss_roots: Option<usize>,
    dex: Range<usize>,
    rel_ro: RelRo,
}

impl Default for Sections {
    fn default() -> Self {
        Self {
            oatdata: 0..0,
            bss: 0..0,
            bss_methods: None,
            bss_roots: None,
            dex: 0..0,
            rel_ro: RelRo::empty(),
        }
    }
}

/// A loaded container.
#[derive(Debug)]
pub struct OatFile {
    path: PathBuf,
    options: LoadOptions,
    state: LoaderState,
    mapping: Mapping,
    placeholders: Vec<Range<usize>>,
    sections: Sections,
    header: Option<OatHeader>,
    vdex: Option<VdexFile>,
    dex_files: Vec<OatDexFile>,
}

impl OatFile {
    /// Load the container at `path` through every state up to
    /// [`LoaderState::Ready`]. Rejections are logged with their reason.
    pub fn open(path: impl Into<PathBuf>, options: LoadOptions) -> Result<Self> {
        let mut file = Self::new(path.into(), options);
        match file.run() {
            Ok(()) => {
                info!(
                    path = %file.path.display(),
                    dex_files = file.dex_files.len(),
                    dlopen = matches!(file.mapping, Mapping::Dlopen { .. }),
                    "loaded container"
                );
                Ok(file)
            }
            Err(error) => {
                warn!(
                    path = %file.path.display(),
                    state = ?file.state,
                    %error,
                    "rejecting container"
                );
                Err(error)
            }
        }
    }

    fn new(path: PathBuf, options: LoadOptions) -> Self {
        Self {
            path,
            options,
            state: LoaderState::Allocated,
            mapping: Mapping::None,
            placeholders: Vec::new(),
            sections: Sections::default(),
            header: None,
            vdex: None,
            dex_files: Vec::new(),
        }
    }

    fn run(&mut self) -> Result<()> {
        self.options.validate()?;
        self.load()?;
        self.compute_fields()?;
        self.prepare()?;
        self.wire_to_dex()?;
        self.finish()
    }

    // =========================================================================
    // Loaded
    // =========================================================================

    fn load(&mut self) -> Result<()> {
        debug_assert_eq!(self.state, LoaderState::Allocated);
        let wants_dlopen =
            self.options.use_dlopen && self.options.executable && self.options.reservation.is_none();
        if wants_dlopen {
            match self.dlopen() {
                Ok(()) => {
                    self.state = LoaderState::Loaded;
                    return Ok(());
                }
                Err(error) => warn!(
                    path = %self.path.display(),
                    %error,
                    "dlopen failed, falling back to manual loading"
                ),
            }
        } else if self.options.use_dlopen {
            debug!(path = %self.path.display(), "dlopen cannot honour the request, loading manually");
        }
        self.map_manually()?;
        self.state = LoaderState::Loaded;
        Ok(())
    }

    fn dlopen(&mut self) -> Result<()> {
        let cpath = CString::new(self.path.as_os_str().as_bytes())
            .map_err(|_| LoadError::Dlopen("path contains a NUL byte".into()))?;
        // SAFETY: cpath is NUL terminated; the container has no initialisers.
        let raw = unsafe { libc::dlopen(cpath.as_ptr(), libc::RTLD_NOW) };
        if raw.is_null() {
            return Err(LoadError::Dlopen(last_dlerror()));
        }
        let handle = raw as usize;
        if DLOPEN_HANDLES.contains_key(&handle) {
            // SAFETY: balances the dlopen above.
            unsafe { libc::dlclose(raw) };
            return Err(LoadError::Dlopen(format!(
                "duplicate handle {handle:#x} for '{}'",
                self.path.display()
            )));
        }
        DLOPEN_HANDLES.insert(handle, self.path.clone());
        self.mapping = Mapping::Dlopen { handle };
        if let Some(oatdata) = self.symbol(OATDATA) {
            self.placeholders = loaded_segments_containing(oatdata);
        }
        Ok(())
    }

    fn map_manually(&mut self) -> Result<()> {
        let data = std::fs::read(&self.path).map_err(|e| LoadError::io(&self.path, e))?;
        let elf = ElfImage::parse(&data)?;
        let file = File::open(&self.path).map_err(|e| LoadError::io(&self.path, e))?;

        let page = page_size();
        let (lo, hi) = elf.load_span();
        let span_lo = align_down(lo as usize, page);
        let span_len = align_up(hi as usize, page) - span_lo;
        if span_len == 0 {
            return Err(LoadError::InvalidElf("no loadable segments"));
        }

        let (base, owned) = match &self.options.reservation {
            Some(range) => {
                if range.len() < span_len {
                    return Err(LoadError::layout(format!(
                        "reservation of {:#x} bytes cannot hold {span_len:#x} bytes of segments",
                        range.len()
                    )));
                }
                (range.start, None)
            }
            None => {
                let map = MemMap::reserve(span_len)?;
                (map.begin() as usize, Some(map))
            }
        };
        let bias = base - span_lo;

        // Segment views never unmap; the span's owner releases them.
        let mut placeholders = Vec::with_capacity(elf.segments().len());
        for segment in elf.segments() {
            // SAFETY: every segment lies inside the span reserved above.
            let views = unsafe { self.map_segment(&file, segment, bias, page)? };
            placeholders.extend(views.iter().map(|m| m.begin() as usize..m.end() as usize));
        }
        self.placeholders = placeholders;
        self.mapping = Mapping::Manual {
            elf,
            bias,
            span: base..base + span_len,
            owned,
        };
        Ok(())
    }

    /// # Safety
    /// `bias + segment.vaddr .. + memsz` must lie in a reservation this
    /// loader may overwrite.
    unsafe fn map_segment(
        &self,
        file: &File,
        segment: &Segment,
        bias: usize,
        page: usize,
    ) -> Result<Vec<MemMap>> {
        let vaddr = segment.vaddr as usize;
        let offset = segment.offset as usize;
        if vaddr % page != offset % page {
            return Err(LoadError::InvalidElf("segment offset and address disagree modulo the page size"));
        }
        let mut prot = segment.protection();
        if !self.options.executable {
            prot.remove(Protection::EXEC);
        }

        let start = align_down(bias + vaddr, page);
        let file_end = bias + vaddr + segment.filesz as usize;
        let mem_end = align_up(bias + vaddr + segment.memsz as usize, page);
        let mut views = Vec::with_capacity(2);
        let mut anon_start = start;

        if segment.filesz > 0 {
            let len = align_up(file_end, page) - start;
            let file_offset = align_down(offset, page) as u64;
            // SAFETY: forwarded from the caller.
            let view = unsafe {
                MemMap::map_fd_fixed(start as *mut u8, file.as_fd(), file_offset, len, prot, false)?
            };
            if prot.contains(Protection::WRITE) && file_end % page != 0 {
                // Zero the tail of the last file page; it belongs to .bss.
                let tail = align_up(file_end, page) - file_end;
                // SAFETY: the page is writable and belongs to this segment.
                unsafe { std::ptr::write_bytes(file_end as *mut u8, 0, tail) };
            }
            anon_start = view.end() as usize;
            views.push(view);
        }
        if mem_end > anon_start {
            // SAFETY: forwarded from the caller.
            let view = unsafe {
                MemMap::anonymous_fixed(anon_start as *mut u8, mem_end - anon_start, prot, false)?
            };
            views.push(view);
        }
        Ok(views)
    }

    // =========================================================================
    // FieldsComputed
    // =========================================================================

    fn symbol(&self, name: &str) -> Option<usize> {
        match &self.mapping {
            Mapping::None => None,
            Mapping::Manual { elf, bias, .. } => elf.symbol(name).map(|v| bias + v as usize),
            Mapping::Dlopen { handle } => {
                let cname = CString::new(name).ok()?;
                // SAFETY: the handle stays open until drop.
                let addr = unsafe { libc::dlsym(*handle as *mut c_void, cname.as_ptr()) };
                (!addr.is_null()).then_some(addr as usize)
            }
        }
    }

    fn required(&self, name: &'static str) -> Result<usize> {
        self.symbol(name).ok_or(LoadError::MissingSymbol(name))
    }

    /// `begin..lastword + 4`, or empty when `begin_name` is absent.
    fn word_range(&self, begin_name: &'static str, last_name: &'static str) -> Result<Range<usize>> {
        let Some(begin) = self.symbol(begin_name) else {
            return Ok(0..0);
        };
        let last = self.required(last_name)?;
        if last < begin {
            return Err(LoadError::layout(format!("{last_name} {last:#x} precedes {begin_name} {begin:#x}")));
        }
        Ok(begin..last + LAST_WORD)
    }

    fn compute_fields(&mut self) -> Result<()> {
        debug_assert_eq!(self.state, LoaderState::Loaded);
        let oatdata = self.required(OATDATA)?;
        let last = self.required(OATLASTWORD)?;
        if last < oatdata {
            return Err(LoadError::layout("oatlastword precedes oatdata"));
        }
        let oatdata = oatdata..last + LAST_WORD;

        let bss = self.word_range(OATBSS, OATBSSLASTWORD)?;
        let bss_methods = self.symbol(OATBSSMETHODS);
        let bss_roots = self.symbol(OATBSSROOTS);
        if bss.is_empty() && (bss_methods.is_some() || bss_roots.is_some()) {
            return Err(LoadError::layout("bss methods or roots without a .bss"));
        }
        if !bss.is_empty() && bss.start % page_size() != 0 {
            return Err(LoadError::Misaligned {
                what: "bss begin",
                value: bss.start,
                alignment: page_size(),
            });
        }
        for (what, addr) in [("bss methods", bss_methods), ("bss roots", bss_roots)] {
            let Some(addr) = addr else { continue };
            if addr % size_of::<usize>() != 0 {
                return Err(LoadError::Misaligned {
                    what,
                    value: addr,
                    alignment: size_of::<usize>(),
                });
            }
            if !(bss.start..=bss.end).contains(&addr) {
                return Err(LoadError::layout(format!("{what} {addr:#x} outside .bss {bss:#x?}")));
            }
        }
        if let Some(methods) = bss_methods {
            if methods != bss.start {
                return Err(LoadError::layout(format!(
                    "bss methods {methods:#x} do not start the .bss at {:#x}",
                    bss.start
                )));
            }
        }
        if let (Some(methods), Some(roots)) = (bss_methods, bss_roots) {
            if methods > roots {
                return Err(LoadError::layout("bss methods follow bss roots"));
            }
        }

        let dex = self.word_range(OATDEX, OATDEXLASTWORD)?;
        let rel_ro = match self.symbol(OATDATAIMGRELRO) {
            None => RelRo::empty(),
            Some(begin) => {
                let last = self.required(OATDATAIMGRELROLASTWORD)?;
                let end = last + LAST_WORD;
                let app_image = self.symbol(OATDATAIMGRELROAPPIMAGE).unwrap_or(end);
                RelRo::new(begin, app_image, end)?
            }
        };

        self.sections = Sections {
            oatdata,
            bss,
            bss_methods,
            bss_roots,
            dex,
            rel_ro,
        };
        self.state = LoaderState::FieldsComputed;
        Ok(())
    }

    // =========================================================================
    // Prepared
    // =========================================================================

    fn vdex_path(&self) -> PathBuf {
        self.options
            .vdex_path
            .clone()
            .unwrap_or_else(|| self.path.with_extension("vdex"))
    }

    /// Page after the mapped segments when the caller's reservation has
    /// room for `len` more bytes.
    fn preferred_vdex_address(&self, len: usize) -> Option<*mut u8> {
        let (Some(reservation), Mapping::Manual { span, .. }) = (&self.options.reservation, &self.mapping)
        else {
            return None;
        };
        let begin = span.end;
        (begin + align_up(len, page_size()) <= reservation.end).then_some(begin as *mut u8)
    }

    fn prepare(&mut self) -> Result<()> {
        debug_assert_eq!(self.state, LoaderState::FieldsComputed);
        let path = self.vdex_path();
        let len = std::fs::metadata(&path)
            .map_err(|e| LoadError::io(&path, e))?
            .len() as usize;
        let preferred = self.preferred_vdex_address(len);
        // SAFETY: a preferred address lies in the unused tail of the
        // caller's reservation.
        let vdex = unsafe { VdexFile::open(&path, preferred)? };
        debug!(
            path = %path.display(),
            dex_files = vdex.dex_count(),
            fixed = preferred.is_some(),
            "opened vdex"
        );
        self.vdex = Some(vdex);
        self.state = LoaderState::Prepared;
        Ok(())
    }

    // =========================================================================
    // WiredToDex
    // =========================================================================

    fn wire_to_dex(&mut self) -> Result<()> {
        debug_assert_eq!(self.state, LoaderState::Prepared);
        let mut header = OatHeader::parse(self.oatdata())?;
        if self.options.executable && header.instruction_set != InstructionSet::host() {
            return Err(LoadError::layout(format!(
                "compiled for {:?}, running on {:?}",
                header.instruction_set,
                InstructionSet::host()
            )));
        }
        let executable_offset = header.executable_offset as usize;
        if executable_offset > self.sections.oatdata.len() || executable_offset % page_size() != 0 {
            return Err(LoadError::layout(format!(
                "executable offset {executable_offset:#x} outside oatdata or not page aligned"
            )));
        }
        if let Some(sidecar_path) = &self.options.sidecar_path {
            let sidecar = Sidecar::read(sidecar_path)?;
            sidecar.verify(&self.path)?;
            header.set(APEX_VERSIONS_KEY, &sidecar.apex_versions);
        }

        let Some(vdex) = self.vdex.as_ref() else {
            return Err(LoadError::layout("vdex not opened"));
        };
        self.dex_files = dex_record::parse_dex_files(
            self.oatdata(),
            header.oat_dex_files_offset as usize,
            header.dex_file_count as usize,
            vdex,
            self.sections.bss.len(),
        )?;
        self.header = Some(header);
        self.state = LoaderState::WiredToDex;
        Ok(())
    }

    // =========================================================================
    // Ready
    // =========================================================================

    fn finish(&mut self) -> Result<()> {
        debug_assert_eq!(self.state, LoaderState::WiredToDex);
        let rel_ro = self.sections.rel_ro;
        if !rel_ro.is_empty() {
            if !self.header.as_ref().is_some_and(OatHeader::has_boot_image_dependency) {
                return Err(LoadError::MissingBootImageDependency);
            }
            // SAFETY: the section belongs to this container's mapping and
            // nothing reads it before the load completes.
            unsafe { rel_ro.relocate(self.options.boot_image_begin, self.options.app_image_begin)? };
        }
        self.state = LoaderState::Ready;
        Ok(())
    }

    /// Re-patch the boot-image relocation slots after the boot image moved
    /// from `old_begin` to `new_begin`.
    pub fn relocate_boot_image(&mut self, old_begin: u32, new_begin: u32) -> Result<()> {
        // SAFETY: `&mut self` excludes concurrent readers of the section.
        unsafe { self.sections.rel_ro.relocate_again(old_begin, new_begin)? };
        self.options.boot_image_begin = new_begin;
        Ok(())
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn state(&self) -> LoaderState {
        self.state
    }

    pub fn is_executable(&self) -> bool {
        self.options.executable
    }

    /// Whether the dynamic linker mapped the container.
    pub fn is_dlopened(&self) -> bool {
        matches!(self.mapping, Mapping::Dlopen { .. })
    }

    /// Address ranges the container occupies, for reservation bookkeeping.
    pub fn placeholders(&self) -> &[Range<usize>] {
        &self.placeholders
    }

    /// Address range of the manual mapping.
    pub fn span(&self) -> Option<Range<usize>> {
        match &self.mapping {
            Mapping::Manual { span, .. } => Some(span.clone()),
            _ => None,
        }
    }

    pub fn header(&self) -> Option<&OatHeader> {
        self.header.as_ref()
    }

    pub fn vdex(&self) -> Option<&VdexFile> {
        self.vdex.as_ref()
    }

    pub fn dex_files(&self) -> &[OatDexFile] {
        &self.dex_files
    }

    pub fn oatdata_range(&self) -> Range<usize> {
        self.sections.oatdata.clone()
    }

    /// Bytes from `oatdata` to the end of `oatlastword`.
    pub fn oatdata(&self) -> &[u8] {
        let range = &self.sections.oatdata;
        if range.is_empty() {
            return &[];
        }
        // SAFETY: the range is mapped readable for as long as self lives.
        unsafe { std::slice::from_raw_parts(range.start as *const u8, range.len()) }
    }

    /// Executable code range.
    pub fn exec_range(&self) -> Range<usize> {
        let offset = self.header.as_ref().map_or(0, |h| h.executable_offset as usize);
        let oatdata = &self.sections.oatdata;
        (oatdata.start + offset).min(oatdata.end)..oatdata.end
    }

    pub fn bss(&self) -> Range<usize> {
        self.sections.bss.clone()
    }

    pub fn bss_methods(&self) -> Option<usize> {
        self.sections.bss_methods
    }

    pub fn bss_roots(&self) -> Option<usize> {
        self.sections.bss_roots
    }

    /// `ObjectRef` slots the GC must visit.
    pub fn bss_roots_range(&self) -> Range<usize> {
        match self.sections.bss_roots {
            Some(roots) => roots..self.sections.bss.end,
            None => 0..0,
        }
    }

    pub fn dex_range(&self) -> Range<usize> {
        self.sections.dex.clone()
    }

    pub fn rel_ro(&self) -> RelRo {
        self.sections.rel_ro
    }
}

impl Drop for OatFile {
    fn drop(&mut self) {
        match &self.mapping {
            Mapping::Dlopen { handle } => {
                DLOPEN_HANDLES.remove(handle);
                // SAFETY: the handle came from dlopen and is closed once.
                unsafe { libc::dlclose(*handle as *mut c_void) };
            }
            Mapping::Manual { span, owned: None, .. } => {
                // Hand the caller's reservation back as inaccessible memory.
                // SAFETY: the span is inside the caller's reservation and
                // nothing references the container anymore.
                let result = unsafe {
                    MemMap::anonymous_fixed(span.start as *mut u8, span.len(), Protection::empty(), false)
                };
                if let Err(error) = result {
                    warn!(%error, "failed to release container pages in reservation");
                }
            }
            Mapping::Manual { owned: Some(_), .. } | Mapping::None => {}
        }
    }
}

fn last_dlerror() -> String {
    // SAFETY: dlerror returns a thread-local NUL-terminated string or null.
    let err = unsafe { libc::dlerror() };
    if err.is_null() {
        return "unknown dlopen error".into();
    }
    // SAFETY: non-null dlerror results are valid C strings.
    unsafe { CStr::from_ptr(err) }.to_string_lossy().into_owned()
}

struct PhdrSearch {
    target: usize,
    found: Vec<Range<usize>>,
}

unsafe extern "C" fn collect_segments(
    info: *mut libc::dl_phdr_info,
    _size: libc::size_t,
    data: *mut c_void,
) -> libc::c_int {
    // SAFETY: dl_iterate_phdr passes a valid info and our PhdrSearch.
    let (info, search) = unsafe { (&*info, &mut *data.cast::<PhdrSearch>()) };
    let base = info.dlpi_addr as usize;
    let phdrs = if info.dlpi_phdr.is_null() {
        &[][..]
    } else {
        // SAFETY: the loader reports dlpi_phnum headers at dlpi_phdr.
        unsafe { std::slice::from_raw_parts(info.dlpi_phdr, info.dlpi_phnum as usize) }
    };
    let loads: Vec<Range<usize>> = phdrs
        .iter()
        .filter(|p| p.p_type == libc::PT_LOAD)
        .map(|p| {
            let begin = base + p.p_vaddr as usize;
            begin..begin + p.p_memsz as usize
        })
        .collect();
    if loads.iter().any(|r| r.contains(&search.target)) {
        search.found = loads;
        return 1;
    }
    0
}

/// `PT_LOAD` ranges of the loaded object containing `addr`.
fn loaded_segments_containing(addr: usize) -> Vec<Range<usize>> {
    let mut search = PhdrSearch {
        target: addr,
        found: Vec::new(),
    };
    // SAFETY: the callback only touches `search` for the duration of the call.
    unsafe {
        libc::dl_iterate_phdr(Some(collect_segments), (&raw mut search).cast());
    }
    search.found
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_options_validation() {
        LoadOptions::default().validate().unwrap();
        let page = page_size();
        let bad = LoadOptions {
            reservation: Some(page + 1..4 * page),
            ..LoadOptions::default()
        };
        assert!(matches!(bad.validate(), Err(LoadError::Misaligned { .. })));
        let empty = LoadOptions {
            reservation: Some(page..page),
            ..LoadOptions::default()
        };
        assert!(matches!(empty.validate(), Err(LoadError::Layout(_))));
        assert!(LoadOptions::on_device().use_dlopen);
        assert!(!LoadOptions::inspect().executable);
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let err = OatFile::open("/nonexistent/app.oat", LoadOptions::default()).unwrap_err();
        assert!(matches!(err, LoadError::Io { .. }));
    }

    #[test]
    fn test_placeholders_of_own_binary() {
        let here = test_placeholders_of_own_binary as fn() as usize;
        let ranges = loaded_segments_containing(here);
        assert!(ranges.iter().any(|r| r.contains(&here)));
    }

    #[test]
    fn test_states_are_ordered() {
        assert!(LoaderState::Allocated < LoaderState::Loaded);
        assert!(LoaderState::WiredToDex < LoaderState::Ready);
    }
}
