//! Minimal ELF64 reader: header, section headers, symbol tables.

use super::{ElfError, ElfResult};

/// ELF magic bytes: "\x7fELF"
pub const ELF_MAGIC: [u8; 4] = [0x7f, b'E', b'L', b'F'];

const ELFCLASS64: u8 = 2;
const ELFDATA2LSB: u8 = 1;

const SHT_SYMTAB: u32 = 2;
const SHT_DYNSYM: u32 = 11;

/// Special section indices.
pub const SHN_UNDEF: u16 = 0;
pub const SHN_ABS: u16 = 0xfff1;
pub const SHN_COMMON: u16 = 0xfff2;

/// Symbol binding.
pub const STB_LOCAL: u8 = 0;
pub const STB_GLOBAL: u8 = 1;
pub const STB_WEAK: u8 = 2;

/// Symbol type.
pub const STT_NOTYPE: u8 = 0;
pub const STT_OBJECT: u8 = 1;
pub const STT_FUNC: u8 = 2;
pub const STT_GNU_IFUNC: u8 = 10;

const SYMBOL_SIZE: usize = 24;
const SECTION_HEADER_SIZE: usize = 64;

fn field(data: &[u8], offset: usize, len: usize) -> ElfResult<&[u8]> {
    offset
        .checked_add(len)
        .and_then(|end| data.get(offset..end))
        .ok_or(ElfError::Truncated { offset })
}

fn read_u16(data: &[u8], offset: usize) -> ElfResult<u16> {
    let bytes = field(data, offset, 2)?;
    Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
}

fn read_u32(data: &[u8], offset: usize) -> ElfResult<u32> {
    let bytes = field(data, offset, 4)?;
    Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

fn read_u64(data: &[u8], offset: usize) -> ElfResult<u64> {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(field(data, offset, 8)?);
    Ok(u64::from_le_bytes(raw))
}

/// The section header fields symbol extraction needs.
#[derive(Debug, Clone, Copy)]
struct Section {
    sh_type: u32,
    offset: usize,
    size: usize,
    link: u32,
    entsize: usize,
}

impl Section {
    fn parse(data: &[u8], at: usize) -> ElfResult<Self> {
        let header = field(data, at, SECTION_HEADER_SIZE)?;
        Ok(Self {
            sh_type: read_u32(header, 4)?,
            offset: read_u64(header, 24)? as usize,
            size: read_u64(header, 32)? as usize,
            link: read_u32(header, 40)?,
            entsize: read_u64(header, 56)? as usize,
        })
    }

    fn bytes<'a>(&self, data: &'a [u8]) -> ElfResult<&'a [u8]> {
        let end = self
            .offset
            .checked_add(self.size)
            .ok_or(ElfError::Truncated { offset: self.offset })?;
        data.get(self.offset..end)
            .ok_or(ElfError::Truncated { offset: self.offset })
    }
}

/// One raw symbol-table entry with its name resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawSymbol {
    pub name: String,
    pub info: u8,
    pub shndx: u16,
    pub value: u64,
    pub size: u64,
}

impl RawSymbol {
    pub fn binding(&self) -> u8 {
        self.info >> 4
    }

    pub fn symbol_type(&self) -> u8 {
        self.info & 0xf
    }

    /// Defined relative to the image (not undefined, absolute or common).
    pub fn is_defined(&self) -> bool {
        !matches!(self.shndx, SHN_UNDEF | SHN_ABS | SHN_COMMON)
    }
}

/// Parsed view over an ELF64 little-endian image.
pub struct ElfImage<'a> {
    data: &'a [u8],
    sections: Vec<Section>,
}

impl<'a> ElfImage<'a> {
    pub fn parse(data: &'a [u8]) -> ElfResult<Self> {
        if data.len() < 64 {
            return Err(ElfError::Truncated { offset: 0 });
        }
        if data[..4] != ELF_MAGIC {
            return Err(ElfError::InvalidMagic);
        }
        if data[4] != ELFCLASS64 {
            return Err(ElfError::UnsupportedClass(data[4]));
        }
        if data[5] != ELFDATA2LSB {
            return Err(ElfError::UnsupportedEncoding(data[5]));
        }

        let shoff = read_u64(data, 0x28)? as usize;
        let shentsize = read_u16(data, 0x3a)? as usize;
        let shnum = read_u16(data, 0x3c)? as usize;

        if shnum == 0 {
            return Ok(Self {
                data,
                sections: Vec::new(),
            });
        }
        if shentsize < SECTION_HEADER_SIZE {
            return Err(ElfError::BadEntrySize {
                kind: "section header",
                size: shentsize,
            });
        }

        let mut sections = Vec::with_capacity(shnum);
        for i in 0..shnum {
            let at = shentsize
                .checked_mul(i)
                .and_then(|off| off.checked_add(shoff))
                .ok_or(ElfError::Truncated { offset: shoff })?;
            sections.push(Section::parse(data, at)?);
        }
        Ok(Self { data, sections })
    }

    pub fn section_count(&self) -> usize {
        self.sections.len()
    }

    /// Entries of every `SHT_SYMTAB` and `SHT_DYNSYM` section, symtab first.
    pub fn symbols(&self) -> ElfResult<Vec<RawSymbol>> {
        let mut out = Vec::new();
        for kind in [SHT_SYMTAB, SHT_DYNSYM] {
            for section in self.sections.iter().filter(|s| s.sh_type == kind) {
                self.collect_symbols(section, &mut out)?;
            }
        }
        Ok(out)
    }

    fn collect_symbols(&self, section: &Section, out: &mut Vec<RawSymbol>) -> ElfResult<()> {
        let entsize = if section.entsize == 0 {
            SYMBOL_SIZE
        } else {
            section.entsize
        };
        if entsize < SYMBOL_SIZE {
            return Err(ElfError::BadEntrySize {
                kind: "symbol",
                size: entsize,
            });
        }
        let strtab = self
            .sections
            .get(section.link as usize)
            .ok_or(ElfError::InvalidSectionLink(section.link))?
            .bytes(self.data)?;
        let table = section.bytes(self.data)?;

        // Entry 0 is the reserved null symbol.
        for entry in table.chunks_exact(entsize).skip(1) {
            let st_name = read_u32(entry, 0)?;
            let name = get_string(strtab, st_name)?;
            out.push(RawSymbol {
                name: name.to_owned(),
                info: entry[4],
                shndx: read_u16(entry, 6)?,
                value: read_u64(entry, 8)?,
                size: read_u64(entry, 16)?,
            });
        }
        Ok(())
    }
}

/// Get a NUL-terminated string from a string table.
pub fn get_string(strtab: &[u8], index: u32) -> ElfResult<&str> {
    let start = index as usize;
    let tail = strtab
        .get(start..)
        .ok_or(ElfError::InvalidStringIndex(index))?;
    let end = tail
        .iter()
        .position(|&b| b == 0)
        .ok_or(ElfError::InvalidStringIndex(index))?;
    core::str::from_utf8(&tail[..end]).map_err(|_| ElfError::InvalidStringIndex(index))
}
