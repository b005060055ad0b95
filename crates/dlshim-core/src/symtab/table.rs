//! Address-sorted symbol table with nearest-preceding lookup.

use super::ElfResult;
use super::image::{
    ElfImage, RawSymbol, STB_GLOBAL, STB_LOCAL, STB_WEAK, STT_FUNC, STT_GNU_IFUNC, STT_NOTYPE,
    STT_OBJECT,
};

/// One addressable symbol. `value` is image-relative.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SymbolEntry {
    pub name: String,
    pub value: u64,
    pub size: u64,
    rank: (u8, u8, bool, usize),
}

impl SymbolEntry {
    fn from_raw(raw: RawSymbol) -> Option<Self> {
        if raw.name.is_empty() || !raw.is_defined() {
            return None;
        }
        let type_rank = match raw.symbol_type() {
            STT_FUNC | STT_OBJECT | STT_GNU_IFUNC => 0,
            STT_NOTYPE => 1,
            // Sections, files, TLS offsets: not code or data addresses.
            _ => return None,
        };
        let bind_rank = match raw.binding() {
            STB_GLOBAL => 0,
            STB_WEAK => 1,
            STB_LOCAL => 2,
            _ => 3,
        };
        let underscores = raw.name.bytes().take_while(|&b| b == b'_').count();
        Some(Self {
            rank: (bind_rank, type_rank, raw.size == 0, underscores),
            name: raw.name,
            value: raw.value,
            size: raw.size,
        })
    }
}

/// Symbols of one module, sorted by value; among equal values the preferred
/// name comes first (global, then weak, then local; typed; sized; fewest
/// leading underscores).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SymbolTable {
    entries: Vec<SymbolEntry>,
}

impl SymbolTable {
    /// Build from an in-memory ELF image.
    pub fn from_image(data: &[u8]) -> ElfResult<Self> {
        let image = ElfImage::parse(data)?;
        Ok(Self::from_symbols(image.symbols()?))
    }

    pub fn from_symbols(symbols: impl IntoIterator<Item = RawSymbol>) -> Self {
        let mut entries: Vec<SymbolEntry> = symbols
            .into_iter()
            .filter_map(SymbolEntry::from_raw)
            .collect();
        entries.sort_by(|a, b| {
            a.value
                .cmp(&b.value)
                .then_with(|| a.rank.cmp(&b.rank))
                .then_with(|| a.name.cmp(&b.name))
        });
        // .symtab and .dynsym overlap.
        entries.dedup_by(|later, earlier| later.value == earlier.value && later.name == earlier.name);
        Self { entries }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Preferred symbol with the greatest value `<= value`.
    pub fn nearest(&self, value: u64) -> Option<&SymbolEntry> {
        let idx = self.entries.partition_point(|e| e.value <= value);
        let hit_value = self.entries.get(idx.checked_sub(1)?)?.value;
        let first = self.entries.partition_point(|e| e.value < hit_value);
        self.entries.get(first)
    }

    /// Every name defined at exactly `value`, preferred first.
    pub fn aliases(&self, value: u64) -> impl Iterator<Item = &SymbolEntry> {
        let start = self.entries.partition_point(|e| e.value < value);
        self.entries[start..].iter().take_while(move |e| e.value == value)
    }

    /// First entry named `name`.
    pub fn find(&self, name: &str) -> Option<&SymbolEntry> {
        self.entries.iter().find(|e| e.name == name)
    }
}
