//! In-memory host, image reader and ELF image builder for unit tests.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::host::{HostLoader, HostStatus, ModuleInfo, RawHandle, SymbolEngine, SymbolHit};
use crate::symtab::ImageReader;
use crate::symtab::image::{STB_GLOBAL, STT_FUNC, STT_OBJECT};

/// Builds a minimal ELF64 image: null section, `.strtab`, `.symtab`.
#[derive(Default)]
pub struct ElfBuilder {
    symbols: Vec<(String, u8, u64, u64)>,
}

impl ElfBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn func(self, name: &str, value: u64, size: u64) -> Self {
        self.symbol(name, (STB_GLOBAL << 4) | STT_FUNC, value, size)
    }

    pub fn object(self, name: &str, value: u64, size: u64) -> Self {
        self.symbol(name, (STB_GLOBAL << 4) | STT_OBJECT, value, size)
    }

    pub fn symbol(mut self, name: &str, info: u8, value: u64, size: u64) -> Self {
        self.symbols.push((name.to_owned(), info, value, size));
        self
    }

    pub fn build(&self) -> Vec<u8> {
        let mut strtab = vec![0u8];
        let mut symtab = vec![0u8; 24];
        for (name, info, value, size) in &self.symbols {
            let name_off = strtab.len() as u32;
            strtab.extend_from_slice(name.as_bytes());
            strtab.push(0);
            symtab.extend_from_slice(&name_off.to_le_bytes());
            symtab.push(*info);
            symtab.push(0);
            symtab.extend_from_slice(&1u16.to_le_bytes());
            symtab.extend_from_slice(&value.to_le_bytes());
            symtab.extend_from_slice(&size.to_le_bytes());
        }

        let strtab_off = 64usize;
        let symtab_off = (strtab_off + strtab.len()).next_multiple_of(8);
        let shoff = (symtab_off + symtab.len()).next_multiple_of(8);

        let mut out = vec![0u8; 64];
        out[..4].copy_from_slice(&[0x7f, b'E', b'L', b'F']);
        out[4] = 2;
        out[5] = 1;
        out[6] = 1;
        out[16..18].copy_from_slice(&3u16.to_le_bytes());
        out[18..20].copy_from_slice(&62u16.to_le_bytes());
        out[20..24].copy_from_slice(&1u32.to_le_bytes());
        out[0x28..0x30].copy_from_slice(&(shoff as u64).to_le_bytes());
        out[0x34..0x36].copy_from_slice(&64u16.to_le_bytes());
        out[0x3a..0x3c].copy_from_slice(&64u16.to_le_bytes());
        out[0x3c..0x3e].copy_from_slice(&3u16.to_le_bytes());

        out.extend_from_slice(&strtab);
        out.resize(symtab_off, 0);
        out.extend_from_slice(&symtab);
        out.resize(shoff, 0);

        out.extend_from_slice(&[0u8; 64]);
        out.extend_from_slice(&section_header(3, strtab_off, strtab.len(), 0, 0));
        out.extend_from_slice(&section_header(2, symtab_off, symtab.len(), 1, 24));
        out
    }
}

fn section_header(sh_type: u32, offset: usize, size: usize, link: u32, entsize: u64) -> [u8; 64] {
    let mut sh = [0u8; 64];
    sh[4..8].copy_from_slice(&sh_type.to_le_bytes());
    sh[24..32].copy_from_slice(&(offset as u64).to_le_bytes());
    sh[32..40].copy_from_slice(&(size as u64).to_le_bytes());
    sh[40..44].copy_from_slice(&link.to_le_bytes());
    sh[56..64].copy_from_slice(&entsize.to_le_bytes());
    sh
}

/// Image reader over an in-memory file map.
#[derive(Default, Clone)]
pub struct MemReader {
    files: Arc<Mutex<HashMap<String, Vec<u8>>>>,
}

impl MemReader {
    pub fn insert(&self, path: &str, bytes: Vec<u8>) {
        self.files.lock().insert(path.to_owned(), bytes);
    }
}

impl ImageReader for MemReader {
    fn read(&self, path: &str) -> std::io::Result<Vec<u8>> {
        self.files
            .lock()
            .get(path)
            .cloned()
            .ok_or_else(|| std::io::Error::from(std::io::ErrorKind::NotFound))
    }
}

/// Status the fake loader reports for a missing file.
pub const FAKE_NOT_FOUND: i64 = 2;
/// Status the fake loader reports for an unknown handle.
pub const FAKE_BAD_HANDLE: i64 = 6;

pub const PROCESS_BASE: usize = 0x40_0000;
pub const PROCESS_PATH: &str = "C:\\app\\main.exe";

struct Installed {
    size: usize,
    exports: Vec<(String, usize)>,
}

struct Mapped {
    handle: RawHandle,
    base: usize,
    size: usize,
    path: String,
    exports: Vec<(String, usize)>,
    refs: usize,
}

#[derive(Default)]
struct FakeState {
    installed: HashMap<String, Installed>,
    mapped: Vec<Mapped>,
    next_base: usize,
    load_requests: Vec<String>,
    fail_enumeration: bool,
    extra_modules: Vec<ModuleInfo>,
}

/// Loader that maps "files" registered with [`FakeHost::install`].
///
/// Handles equal module bases. The process image is always mapped first.
/// Symbol tables for the engine are built as ELF images in a shared
/// [`MemReader`].
#[derive(Clone)]
pub struct FakeHost {
    separator: char,
    state: Arc<Mutex<FakeState>>,
    reader: MemReader,
}

impl FakeHost {
    /// A host with backslash-separated native paths.
    pub fn new() -> Self {
        Self::with_separator('\\')
    }

    pub fn with_separator(separator: char) -> Self {
        let host = Self {
            separator,
            state: Arc::new(Mutex::new(FakeState {
                next_base: 0x1000_0000,
                ..FakeState::default()
            })),
            reader: MemReader::default(),
        };
        let exports = vec![("main".to_owned(), 0x100)];
        host.reader.insert(PROCESS_PATH, image_for(&exports));
        host.state.lock().mapped.push(Mapped {
            handle: PROCESS_BASE,
            base: PROCESS_BASE,
            size: 0x1000,
            path: PROCESS_PATH.to_owned(),
            exports,
            refs: 1,
        });
        host
    }

    /// Make `native_path` loadable with the given image size and exports
    /// (`(name, offset from base)`).
    pub fn install(&self, native_path: &str, size: usize, exports: &[(&str, usize)]) {
        let exports: Vec<(String, usize)> = exports
            .iter()
            .map(|(name, off)| ((*name).to_owned(), *off))
            .collect();
        self.reader.insert(native_path, image_for(&exports));
        self.state
            .lock()
            .installed
            .insert(native_path.to_owned(), Installed { size, exports });
    }

    pub fn reader(&self) -> MemReader {
        self.reader.clone()
    }

    /// Paths exactly as the loader received them.
    pub fn load_requests(&self) -> Vec<String> {
        self.state.lock().load_requests.clone()
    }

    pub fn set_fail_enumeration(&self, fail: bool) {
        self.state.lock().fail_enumeration = fail;
    }

    /// Append a module the loader did not map (host anomaly).
    pub fn push_extra_module(&self, module: ModuleInfo) {
        self.state.lock().extra_modules.push(module);
    }

    /// Drop a module from the table without going through `unload`.
    pub fn evict(&self, handle: RawHandle) {
        self.state.lock().mapped.retain(|m| m.handle != handle);
    }
}

fn image_for(exports: &[(String, usize)]) -> Vec<u8> {
    exports
        .iter()
        .fold(ElfBuilder::new(), |b, (name, off)| b.func(name, *off as u64, 0x10))
        .build()
}

impl HostLoader for FakeHost {
    fn native_separator(&self) -> char {
        self.separator
    }

    fn process_image(&self) -> RawHandle {
        PROCESS_BASE
    }

    fn load(&self, native_path: &str) -> Result<RawHandle, HostStatus> {
        let mut state = self.state.lock();
        state.load_requests.push(native_path.to_owned());
        if let Some(m) = state.mapped.iter_mut().find(|m| m.path == native_path) {
            m.refs += 1;
            return Ok(m.handle);
        }
        let (size, exports) = match state.installed.get(native_path) {
            Some(i) => (i.size, i.exports.clone()),
            None => return Err(HostStatus::new(FAKE_NOT_FOUND).with_detail("no such module")),
        };
        let base = state.next_base;
        state.next_base += size.next_multiple_of(0x1_0000);
        state.mapped.push(Mapped {
            handle: base,
            base,
            size,
            path: native_path.to_owned(),
            exports,
            refs: 1,
        });
        Ok(base)
    }

    fn unload(&self, handle: RawHandle) -> Result<(), HostStatus> {
        let mut state = self.state.lock();
        let idx = state
            .mapped
            .iter()
            .position(|m| m.handle == handle && m.handle != PROCESS_BASE)
            .ok_or_else(|| HostStatus::new(FAKE_BAD_HANDLE))?;
        state.mapped[idx].refs -= 1;
        if state.mapped[idx].refs == 0 {
            state.mapped.remove(idx);
        }
        Ok(())
    }

    fn symbol(&self, handle: RawHandle, name: &str) -> Option<usize> {
        let state = self.state.lock();
        let m = state.mapped.iter().find(|m| m.handle == handle)?;
        m.exports
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, off)| m.base + off)
    }

    fn modules(&self) -> Result<Vec<ModuleInfo>, HostStatus> {
        let state = self.state.lock();
        if state.fail_enumeration {
            return Err(HostStatus::new(299));
        }
        let mut out: Vec<ModuleInfo> = state
            .mapped
            .iter()
            .map(|m| ModuleInfo {
                handle: Some(m.handle),
                base: m.base,
                size: m.size,
                load_bias: m.base,
                path: m.path.clone(),
            })
            .collect();
        out.extend(state.extra_modules.iter().cloned());
        Ok(out)
    }
}

/// Counts engine transitions and can be told to fail initialization.
pub struct CountingEngine<E> {
    inner: E,
    pub counters: Arc<EngineCounters>,
}

#[derive(Default)]
pub struct EngineCounters {
    pub inits: AtomicUsize,
    pub refreshes: AtomicUsize,
    pub fail_init: std::sync::atomic::AtomicBool,
}

impl EngineCounters {
    pub fn inits(&self) -> usize {
        self.inits.load(Ordering::SeqCst)
    }

    pub fn refreshes(&self) -> usize {
        self.refreshes.load(Ordering::SeqCst)
    }
}

impl<E> CountingEngine<E> {
    pub fn new(inner: E) -> Self {
        Self {
            inner,
            counters: Arc::new(EngineCounters::default()),
        }
    }
}

impl<E: SymbolEngine> SymbolEngine for CountingEngine<E> {
    fn initialize(&mut self, modules: &[ModuleInfo]) -> Result<(), HostStatus> {
        self.counters.inits.fetch_add(1, Ordering::SeqCst);
        if self.counters.fail_init.load(Ordering::SeqCst) {
            return Err(HostStatus::new(87));
        }
        self.inner.initialize(modules)
    }

    fn refresh(&mut self, modules: &[ModuleInfo]) -> Result<(), HostStatus> {
        self.counters.refreshes.fetch_add(1, Ordering::SeqCst);
        self.inner.refresh(modules)
    }

    fn symbol_from_addr(
        &self,
        module: &ModuleInfo,
        address: usize,
    ) -> Result<SymbolHit, HostStatus> {
        self.inner.symbol_from_addr(module, address)
    }
}
