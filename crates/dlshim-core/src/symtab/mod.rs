//! ELF-backed debug-symbol engine.
//!
//! Reads `.symtab`/`.dynsym` from each module's image file and answers
//! nearest-preceding-symbol queries against the mapped address space.
//! Only ELF64 little-endian images are understood; anything else yields an
//! empty table.

pub mod engine;
pub mod image;
pub mod table;

use thiserror::Error;

pub use engine::{ElfSymbolEngine, FsImageReader, ImageReader};
pub use image::{ELF_MAGIC, ElfImage, RawSymbol};
pub use table::{SymbolEntry, SymbolTable};

/// Error type for ELF parsing operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ElfError {
    #[error("invalid ELF magic")]
    InvalidMagic,
    #[error("unsupported ELF class: {0}")]
    UnsupportedClass(u8),
    #[error("unsupported data encoding: {0}")]
    UnsupportedEncoding(u8),
    #[error("truncated image at offset {offset:#x}")]
    Truncated { offset: usize },
    #[error("bad {kind} entry size: {size}")]
    BadEntrySize { kind: &'static str, size: usize },
    #[error("invalid section link: {0}")]
    InvalidSectionLink(u32),
    #[error("invalid string index: {0}")]
    InvalidStringIndex(u32),
}

/// Result type for ELF operations.
pub type ElfResult<T> = Result<T, ElfError>;
