pub mod relocations;

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::Path;

use log::{debug, warn};
use object::elf::{FileHeader32, Rel32, Sym32, SHN_UNDEF, SHT_DYNSYM, SHT_REL, SHT_SYMTAB};
use object::pod::slice_from_all_bytes;
use object::read::elf::{FileHeader, SectionHeader};
use object::{Endianness, SectionIndex};

use crate::boot::BootError;
use crate::encoder::EncodeError;
use crate::environment::Environment;
use crate::section::PlacedSection;
use relocations::{
    read_word, write_word, RelocationKind, GLOBAL_DATA_SENTINEL, JUMP_SLOT_SENTINEL,
};

#[derive(Debug)]
pub enum LinkerError {
    Io(std::io::Error),
    Object(object::read::Error),
    Encode(EncodeError),
    Boot(BootError),
    Yaml(serde_yaml::Error),
    NoLoadableSections(String),
    MissingGot(String),
    Malformed { object: String, detail: String },
    SymbolNotFound { object: String, symbol: String },
    PatchOutOfRange { object: String, offset: u64 },
    EntrySectionExists,
    NoEntrySection,
    UnknownObject(String),
    DuplicateObject(String),
}

impl fmt::Display for LinkerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkerError::Io(e) => write!(f, "i/o error: {}", e),
            LinkerError::Object(e) => write!(f, "malformed object file: {}", e),
            LinkerError::Encode(e) => write!(f, "instruction encoding failed: {}", e),
            LinkerError::Boot(e) => write!(f, "boot image build failed: {}", e),
            LinkerError::Yaml(e) => write!(f, "invalid build description: {}", e),
            LinkerError::NoLoadableSections(o) => {
                write!(f, "{} has no loadable sections", o)
            }
            LinkerError::MissingGot(o) => write!(f, "{} has no .got section", o),
            LinkerError::Malformed { object, detail } => {
                write!(f, "{} is malformed: {}", object, detail)
            }
            LinkerError::SymbolNotFound { object, symbol } => {
                write!(f, "no symbol {} in {}", symbol, object)
            }
            LinkerError::PatchOutOfRange { object, offset } => {
                write!(f, "relocation site {:#x} outside {}", offset, object)
            }
            LinkerError::EntrySectionExists => write!(f, "entry section already created"),
            LinkerError::NoEntrySection => write!(f, "no entry section has been created"),
            LinkerError::UnknownObject(id) => write!(f, "unknown object id {}", id),
            LinkerError::DuplicateObject(id) => write!(f, "duplicate object id {}", id),
        }
    }
}

impl std::error::Error for LinkerError {}

impl From<std::io::Error> for LinkerError {
    fn from(e: std::io::Error) -> Self {
        LinkerError::Io(e)
    }
}

impl From<object::read::Error> for LinkerError {
    fn from(e: object::read::Error) -> Self {
        LinkerError::Object(e)
    }
}

impl From<EncodeError> for LinkerError {
    fn from(e: EncodeError) -> Self {
        LinkerError::Encode(e)
    }
}

impl From<BootError> for LinkerError {
    fn from(e: BootError) -> Self {
        LinkerError::Boot(e)
    }
}

impl From<serde_yaml::Error> for LinkerError {
    fn from(e: serde_yaml::Error) -> Self {
        LinkerError::Yaml(e)
    }
}

/// Anything that can turn a symbol name into an absolute address.
pub trait AddressResolvable {
    fn resolve_symbol(&self, name: &str) -> Option<u32>;
}

/// One ingested relocatable object: its backing memory, assigned base
/// address and the symbol bookkeeping needed to bind it to its peers.
#[derive(Debug)]
pub struct LinkedObject {
    /// Absolute address the object's address 0 maps to. Assigned once.
    pub base: u32,
    /// Added to a file-local address to obtain an absolute address,
    /// together with `base`. Equal to minus the lowest section address.
    pub base_offset: i64,
    /// Absolute address of the object's global offset table.
    pub got: u32,
    /// Backing buffer spanning the object's footprint. Mutated only by
    /// relocation patching and the finalization binding pass.
    pub memory: Vec<u8>,
    /// Undefined symbol name -> patch sites within `memory`.
    pub undefined: HashMap<String, Vec<usize>>,
    /// Undefined symbol name -> resolved absolute address.
    pub bindings: HashMap<String, u32>,
    /// Defined symbols captured at ingestion, in symbol table order,
    /// as (name, file-local value) pairs.
    symbols: Vec<(String, u32)>,
    /// Originating path, for diagnostics.
    pub label: String,
}

/// Reads a null-terminated name out of a string table.
fn str_at(strtab: &[u8], offset: usize) -> Option<&str> {
    let tail = strtab.get(offset..)?;
    let end = tail.iter().position(|&b| b == 0)?;
    std::str::from_utf8(&tail[..end]).ok()
}

impl LinkedObject {
    pub fn ingest(path: impl AsRef<Path>, env: &mut Environment) -> Result<Self, LinkerError> {
        let path = path.as_ref();
        let data = fs::read(path)?;
        Self::from_bytes(&path.display().to_string(), &data, env)
    }

    /// Parses one relocatable object, copies its loadable sections into a
    /// private buffer, allocates a base address for it and rewrites every
    /// relocation entry in place.
    pub fn from_bytes(
        label: &str,
        data: &[u8],
        env: &mut Environment,
    ) -> Result<Self, LinkerError> {
        let malformed = |detail: &str| LinkerError::Malformed {
            object: label.to_string(),
            detail: detail.to_string(),
        };

        let header = FileHeader32::<Endianness>::parse(data)?;
        let endian = header.endian()?;
        let sections = header.sections(endian, data)?;

        // Footprint over every section with a non-zero load address.
        let mut min_addr = u32::MAX;
        let mut max_addr = 0u32;
        for section in sections.iter() {
            let addr = section.sh_addr.get(endian);
            if addr == 0 {
                continue;
            }
            let end = addr
                .checked_add(section.sh_size.get(endian))
                .ok_or_else(|| malformed("section size overflows the address space"))?;
            min_addr = min_addr.min(addr);
            max_addr = max_addr.max(end);
        }
        if min_addr > max_addr {
            return Err(LinkerError::NoLoadableSections(label.to_string()));
        }
        let mut memory = vec![0u8; (max_addr - min_addr) as usize];
        debug!(
            "{} spans {:#x}..{:#x} ({:#x} bytes)",
            label,
            min_addr,
            max_addr,
            memory.len()
        );

        // Sections without backing data (pure zero-fill) are left as zeros.
        for section in sections.iter() {
            let addr = section.sh_addr.get(endian);
            if addr == 0 {
                continue;
            }
            let bytes = section.data(endian, data)?;
            if bytes.is_empty() {
                continue;
            }
            let start = (addr - min_addr) as usize;
            let end = start + bytes.len();
            if end > memory.len() {
                return Err(malformed("section data outside footprint"));
            }
            memory[start..end].copy_from_slice(bytes);
        }

        let base = env.allocate(memory.len() as u32);
        let base_offset = -(min_addr as i64);
        let delta = base.wrapping_sub(min_addr);

        let got = match sections.section_by_name(endian, b".got") {
            Some((_, section)) => section.sh_addr.get(endian).wrapping_add(delta),
            None => return Err(LinkerError::MissingGot(label.to_string())),
        };

        // Capture defined symbols now so the file can be dropped afterwards.
        // Table order decides which entry a later lookup wins.
        let mut symbols = Vec::new();
        for section in sections.iter() {
            let sh_type = section.sh_type.get(endian);
            if sh_type != SHT_SYMTAB && sh_type != SHT_DYNSYM {
                continue;
            }
            let syms: &[Sym32<Endianness>] = slice_from_all_bytes(section.data(endian, data)?)
                .map_err(|()| malformed("truncated symbol table"))?;
            let strtab_section =
                sections.section(SectionIndex(section.sh_link.get(endian) as usize))?;
            let strtab = strtab_section.data(endian, data)?;
            for sym in syms {
                if sym.st_shndx.get(endian) == SHN_UNDEF {
                    continue;
                }
                if let Some(name) = str_at(strtab, sym.st_name.get(endian) as usize) {
                    if !name.is_empty() {
                        symbols.push((name.to_string(), sym.st_value.get(endian)));
                    }
                }
            }
        }

        let mut object = LinkedObject {
            base,
            base_offset,
            got,
            memory,
            undefined: HashMap::new(),
            bindings: HashMap::new(),
            symbols,
            label: label.to_string(),
        };

        // Relocation pass over the loadable relocation table sections.
        for section in sections.iter() {
            if section.sh_addr.get(endian) == 0 || section.sh_type.get(endian) != SHT_REL {
                continue;
            }
            let rels: &[Rel32<Endianness>] = slice_from_all_bytes(section.data(endian, data)?)
                .map_err(|()| malformed("truncated relocation table"))?;
            let symtab_section =
                sections.section(SectionIndex(section.sh_link.get(endian) as usize))?;
            let syms: &[Sym32<Endianness>] =
                slice_from_all_bytes(symtab_section.data(endian, data)?)
                    .map_err(|()| malformed("truncated symbol table"))?;
            let strtab_section =
                sections.section(SectionIndex(symtab_section.sh_link.get(endian) as usize))?;
            let strtab = strtab_section.data(endian, data)?;

            for rel in rels {
                let info = rel.r_info.get(endian);
                let r_offset = rel.r_offset.get(endian);
                let sym_index = (info >> 8) as usize;
                let site = r_offset.wrapping_sub(min_addr) as usize;
                let existing =
                    read_word(&object.memory, site).ok_or(LinkerError::PatchOutOfRange {
                        object: label.to_string(),
                        offset: r_offset as u64,
                    })?;
                let symbol = |index: usize| {
                    syms.get(index)
                        .ok_or_else(|| malformed("relocation symbol index out of range"))
                };
                let value = match RelocationKind::from(info & 0xff) {
                    RelocationKind::Relative => existing.wrapping_add(delta),
                    kind @ (RelocationKind::JumpSlot | RelocationKind::GlobalData) => {
                        let sym = symbol(sym_index)?;
                        if sym.st_shndx.get(endian) == SHN_UNDEF {
                            let name = str_at(strtab, sym.st_name.get(endian) as usize)
                                .ok_or_else(|| malformed("bad symbol name offset"))?;
                            object
                                .undefined
                                .entry(name.to_string())
                                .or_default()
                                .push(site);
                            match kind {
                                RelocationKind::JumpSlot => JUMP_SLOT_SENTINEL,
                                _ => GLOBAL_DATA_SENTINEL,
                            }
                        } else {
                            sym.st_value.get(endian).wrapping_add(delta)
                        }
                    }
                    RelocationKind::Absolute32 => {
                        let sym = symbol(sym_index)?;
                        existing
                            .wrapping_add(sym.st_value.get(endian))
                            .wrapping_add(delta)
                    }
                    RelocationKind::Other(kind) => {
                        warn!(
                            "{}: relocation type {} at {:#x} left unpatched",
                            label, kind, r_offset
                        );
                        continue;
                    }
                };
                // Bounds already checked by the read above.
                let _ = write_word(&mut object.memory, site, value);
            }
        }

        Ok(object)
    }

    pub fn is_undefined(&self, name: &str) -> bool {
        self.undefined.contains_key(name)
    }

    pub fn record_binding(&mut self, name: &str, address: u32) {
        self.bindings.insert(name.to_string(), address);
    }

    /// Finalization end-hook: rewrite every recorded patch site of each
    /// bound symbol. Unbound names keep their sentinel and only warn, so
    /// a partial build still produces an artifact that fails at use.
    pub fn apply_bindings(&mut self) {
        for (name, sites) in &self.undefined {
            if let Some(&address) = self.bindings.get(name) {
                for &site in sites {
                    debug!("rewrite in {} at offset {:#x}", self.label, site);
                    let _ = write_word(&mut self.memory, site, address);
                }
            } else {
                warn!(
                    "symbol {} marked by {} as undefined was never bound",
                    name, self.label
                );
            }
        }
    }
}

impl AddressResolvable for LinkedObject {
    fn resolve_symbol(&self, name: &str) -> Option<u32> {
        let delta = self.base.wrapping_add(self.base_offset as u32);
        self.symbols
            .iter()
            .find(|(n, _)| n == name)
            .map(|&(_, value)| value.wrapping_add(delta))
    }
}

impl PlacedSection for LinkedObject {
    fn base(&self) -> u32 {
        self.base
    }

    fn bytes(&self) -> &[u8] {
        &self.memory
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    fn sym(name: u32, value: u32, info: u8, shndx: u16) -> Vec<u8> {
        let mut out = Vec::with_capacity(16);
        out.extend(name.to_le_bytes());
        out.extend(value.to_le_bytes());
        out.extend(0u32.to_le_bytes()); // st_size
        out.push(info);
        out.push(0); // st_other
        out.extend(shndx.to_le_bytes());
        out
    }

    fn rel(offset: u32, sym_index: u32, r_type: u32) -> Vec<u8> {
        let mut out = Vec::with_capacity(8);
        out.extend(offset.to_le_bytes());
        out.extend((sym_index << 8 | r_type).to_le_bytes());
        out
    }

    fn shdr(name: u32, sh_type: u32, addr: u32, offset: u32, size: u32, link: u32, entsize: u32) -> Vec<u8> {
        let fields = [name, sh_type, 0, addr, offset, size, link, 0, 0, entsize];
        fields.iter().flat_map(|v| v.to_le_bytes()).collect()
    }

    /// Builds a minimal ELF32 shared object: .text at 0x1000, a .got at
    /// 0x1040 and a loadable relocation table with one entry of each
    /// supported kind. `symbols` lists the dynsym entries after the null
    /// entry as (name offset, value, section index); name offsets point
    /// into `\0localfn\0extfn\0`.
    pub(crate) fn object_with_symbols(symbols: &[(u32, u32, u16)]) -> Vec<u8> {
        let shstrtab = b"\0.text\0.got\0.rel.text\0.dynsym\0.dynstr\0.shstrtab\0";
        let dynstr = b"\0localfn\0extfn\0";

        let mut text = vec![0u8; 0x20];
        text[0..4].copy_from_slice(&0x20u32.to_le_bytes()); // RELATIVE addend
        text[4..8].copy_from_slice(&0x04u32.to_le_bytes()); // ABSOLUTE32 addend
        text[8] = 0xC3;

        let got = vec![0u8; 16];

        let mut dynsym = vec![0u8; 16]; // null symbol
        for &(name, value, shndx) in symbols {
            dynsym.extend(sym(name, value, 0x12, shndx));
        }

        let mut reltext = Vec::new();
        reltext.extend(rel(0x1000, 0, 8)); // R_386_RELATIVE
        reltext.extend(rel(0x1004, 1, 1)); // R_386_32 against the first symbol
        reltext.extend(rel(0x1044, 1, 7)); // R_386_JMP_SLOT against the first symbol
        reltext.extend(rel(0x1048, 2, 6)); // R_386_GLOB_DAT against the second symbol

        let mut out = vec![0u8; 52];
        let mut place = |out: &mut Vec<u8>, bytes: &[u8]| -> u32 {
            let offset = out.len() as u32;
            out.extend_from_slice(bytes);
            offset
        };
        let text_off = place(&mut out, &text);
        let got_off = place(&mut out, &got);
        let rel_off = place(&mut out, &reltext);
        let dynsym_off = place(&mut out, &dynsym);
        let dynstr_off = place(&mut out, dynstr);
        let shstrtab_off = place(&mut out, shstrtab);

        let shoff = out.len() as u32;
        out.extend(shdr(0, 0, 0, 0, 0, 0, 0));
        out.extend(shdr(1, 1, 0x1000, text_off, 0x20, 0, 0)); // .text
        out.extend(shdr(7, 1, 0x1040, got_off, 16, 0, 0)); // .got
        out.extend(shdr(12, 9, 0x1080, rel_off, 32, 4, 8)); // .rel.text
        out.extend(shdr(22, 11, 0, dynsym_off, dynsym.len() as u32, 5, 16)); // .dynsym
        out.extend(shdr(30, 3, 0, dynstr_off, dynstr.len() as u32, 0, 0)); // .dynstr
        out.extend(shdr(38, 3, 0, shstrtab_off, shstrtab.len() as u32, 0, 0)); // .shstrtab

        out[0..4].copy_from_slice(&[0x7f, b'E', b'L', b'F']);
        out[4] = 1; // ELFCLASS32
        out[5] = 1; // little-endian
        out[6] = 1; // EV_CURRENT
        out[16..18].copy_from_slice(&3u16.to_le_bytes()); // ET_DYN
        out[18..20].copy_from_slice(&3u16.to_le_bytes()); // EM_386
        out[20..24].copy_from_slice(&1u32.to_le_bytes());
        out[32..36].copy_from_slice(&shoff.to_le_bytes());
        out[40..42].copy_from_slice(&52u16.to_le_bytes());
        out[46..48].copy_from_slice(&40u16.to_le_bytes());
        out[48..50].copy_from_slice(&7u16.to_le_bytes());
        out[50..52].copy_from_slice(&6u16.to_le_bytes());
        out
    }

    /// The default object: `localfn` defined at 0x1010, `extfn` undefined.
    pub(crate) fn sample_object() -> Vec<u8> {
        object_with_symbols(&[(1, 0x1010, 1), (9, 0, 0)])
    }
}
