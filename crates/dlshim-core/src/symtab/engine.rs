//! Debug-symbol engine backed by on-disk ELF symbol tables.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use super::table::SymbolTable;
use crate::host::{HostStatus, ModuleInfo, SymbolEngine, SymbolHit};

/// Source of module image bytes.
pub trait ImageReader: Send + Sync {
    fn read(&self, path: &str) -> std::io::Result<Vec<u8>>;
}

/// Reads images from the filesystem.
#[derive(Debug, Default, Clone, Copy)]
pub struct FsImageReader;

impl ImageReader for FsImageReader {
    fn read(&self, path: &str) -> std::io::Result<Vec<u8>> {
        std::fs::read(path)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ModuleKey {
    path: String,
    load_bias: usize,
}

impl ModuleKey {
    fn of(module: &ModuleInfo) -> Self {
        Self {
            path: module.path.clone(),
            load_bias: module.load_bias,
        }
    }
}

/// Symbols of one mapped module, parsed on first query.
struct ModuleSymbols {
    table: OnceLock<SymbolTable>,
}

/// Caches one symbol table per mapped module.
///
/// `initialize`/`refresh` only record the module list; a module's image is
/// read the first time an address inside it is queried. Images that cannot
/// be read or parsed yield an empty table.
pub struct ElfSymbolEngine<R = FsImageReader> {
    reader: R,
    modules: HashMap<ModuleKey, Arc<ModuleSymbols>>,
    initialized: bool,
}

impl<R: ImageReader> ElfSymbolEngine<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            modules: HashMap::new(),
            initialized: false,
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Number of modules in the current snapshot.
    pub fn module_count(&self) -> usize {
        self.modules.len()
    }

    /// Number of snapshot modules whose tables have been parsed.
    pub fn loaded_table_count(&self) -> usize {
        self.modules
            .values()
            .filter(|m| m.table.get().is_some())
            .count()
    }

    fn sync(&mut self, modules: &[ModuleInfo]) {
        let mut next = HashMap::with_capacity(modules.len());
        for module in modules {
            let key = ModuleKey::of(module);
            let entry = self.modules.get(&key).cloned().unwrap_or_else(|| {
                Arc::new(ModuleSymbols {
                    table: OnceLock::new(),
                })
            });
            next.insert(key, entry);
        }
        self.modules = next;
    }

    fn load_table(&self, path: &str) -> SymbolTable {
        self.reader
            .read(path)
            .ok()
            .and_then(|bytes| SymbolTable::from_image(&bytes).ok())
            .unwrap_or_default()
    }
}

impl Default for ElfSymbolEngine<FsImageReader> {
    fn default() -> Self {
        Self::new(FsImageReader)
    }
}

impl<R: ImageReader> SymbolEngine for ElfSymbolEngine<R> {
    fn initialize(&mut self, modules: &[ModuleInfo]) -> Result<(), HostStatus> {
        self.sync(modules);
        self.initialized = true;
        Ok(())
    }

    fn refresh(&mut self, modules: &[ModuleInfo]) -> Result<(), HostStatus> {
        self.sync(modules);
        Ok(())
    }

    fn symbol_from_addr(
        &self,
        module: &ModuleInfo,
        address: usize,
    ) -> Result<SymbolHit, HostStatus> {
        let symbols = self
            .modules
            .get(&ModuleKey::of(module))
            .ok_or_else(|| HostStatus::new(HostStatus::NO_MODULE).with_detail(&module.path))?;
        let table = symbols.table.get_or_init(|| self.load_table(&module.path));

        let relative = address
            .checked_sub(module.load_bias)
            .ok_or_else(|| HostStatus::new(HostStatus::NO_SYMBOL))?;
        let relative = relative as u64;
        let entry = table
            .nearest(relative)
            .ok_or_else(|| HostStatus::new(HostStatus::NO_SYMBOL))?;
        // Sized symbols end where their size says; unsized ones never do.
        let extent = table.aliases(entry.value).map(|e| e.size).max().unwrap_or(0);
        if extent > 0 && relative - entry.value >= extent {
            return Err(HostStatus::new(HostStatus::NO_SYMBOL));
        }
        let symbol_address = module.load_bias.wrapping_add(entry.value as usize);
        Ok(SymbolHit {
            name: entry.name.clone(),
            address: symbol_address,
            displacement: address - symbol_address,
        })
    }
}
