//! Seam between the shim and the host platform.
//!
//! The host exposes two facilities: a loader (map/unmap modules, per-module
//! symbol tables, a process module table) and a debug-symbol engine that maps
//! addresses back to names. Both are modelled here as traits so the core can
//! run against the Linux backend in `dlshim-abi` or an in-memory host.

/// Host-native module identifier. Never dereferenced by the core.
pub type RawHandle = usize;

/// Failure status reported by the host, the analogue of `GetLastError`/errno.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostStatus {
    pub code: i64,
    /// Optional host-provided text, carried into logs only.
    pub detail: Option<String>,
}

impl HostStatus {
    /// The engine has no module covering the queried address.
    pub const NO_MODULE: i64 = 126;
    /// The engine found the module but no symbol at or before the address.
    pub const NO_SYMBOL: i64 = 487;

    pub fn new(code: i64) -> Self {
        Self { code, detail: None }
    }

    #[must_use]
    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

/// One entry of the host process module table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleInfo {
    /// Handle usable with [`HostLoader::symbol`], if the host can produce one.
    pub handle: Option<RawHandle>,
    /// Lowest mapped address of the module.
    pub base: usize,
    /// Size of the mapped image in bytes.
    pub size: usize,
    /// Offset added to image-relative symbol values.
    pub load_bias: usize,
    /// Module file path in host-native separator form.
    pub path: String,
}

impl ModuleInfo {
    /// Half-open containment test against `[base, base + size)`.
    #[inline]
    pub fn contains(&self, address: usize) -> bool {
        address >= self.base && address - self.base < self.size
    }
}

/// Nearest-symbol answer from a [`SymbolEngine`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SymbolHit {
    pub name: String,
    pub address: usize,
    /// `queried address - address`.
    pub displacement: usize,
}

/// Host loader primitives.
pub trait HostLoader: Send + Sync {
    /// Path separator the host loader expects.
    fn native_separator(&self) -> char;

    /// Handle of the running process image.
    fn process_image(&self) -> RawHandle;

    /// Map the module at `native_path`.
    fn load(&self, native_path: &str) -> Result<RawHandle, HostStatus>;

    /// Unmap a module previously returned by [`HostLoader::load`].
    fn unload(&self, handle: RawHandle) -> Result<(), HostStatus>;

    /// Look `name` up in one module's export table.
    fn symbol(&self, handle: RawHandle, name: &str) -> Option<usize>;

    /// Snapshot of every module currently mapped, in host enumeration order.
    fn modules(&self) -> Result<Vec<ModuleInfo>, HostStatus>;
}

/// Host debug-symbol engine.
///
/// The engine keeps its own snapshot of the module list. It is only
/// guaranteed consistent with the live module set right after
/// [`SymbolEngine::initialize`] or [`SymbolEngine::refresh`].
pub trait SymbolEngine: Send {
    /// One-time binding to the current process.
    fn initialize(&mut self, modules: &[ModuleInfo]) -> Result<(), HostStatus>;

    /// Re-derive the internal module list from `modules`.
    fn refresh(&mut self, modules: &[ModuleInfo]) -> Result<(), HostStatus>;

    /// Nearest symbol at or before `address` inside `module`.
    fn symbol_from_addr(&self, module: &ModuleInfo, address: usize)
    -> Result<SymbolHit, HostStatus>;
}
