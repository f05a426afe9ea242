use object::elf::{R_386_32, R_386_GLOB_DAT, R_386_JMP_SLOT, R_386_RELATIVE};

/// Placeholder written into a jump-slot patch site whose symbol is still
/// undefined. Recognizable in a crash dump.
pub const JUMP_SLOT_SENTINEL: u32 = 0xF00F_BA11;

/// Placeholder for an undefined global-data reference.
pub const GLOBAL_DATA_SENTINEL: u32 = 0xF00D_BA11;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelocationKind {
    /// Base-relative: add the load delta to the existing word.
    Relative,
    /// PLT slot: replace with the symbol's absolute address.
    JumpSlot,
    /// GOT entry: replace with the symbol's absolute address.
    GlobalData,
    /// Absolute 32-bit: add symbol value plus load delta to the existing word.
    Absolute32,
    /// Anything else is left unpatched and reported.
    Other(u32),
}

impl From<u32> for RelocationKind {
    fn from(r_type: u32) -> Self {
        match r_type {
            R_386_RELATIVE => RelocationKind::Relative,
            R_386_JMP_SLOT => RelocationKind::JumpSlot,
            R_386_GLOB_DAT => RelocationKind::GlobalData,
            R_386_32 => RelocationKind::Absolute32,
            other => RelocationKind::Other(other),
        }
    }
}

pub fn read_word(memory: &[u8], offset: usize) -> Option<u32> {
    let bytes = memory.get(offset..offset + 4)?;
    Some(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

pub fn write_word(memory: &mut [u8], offset: usize, value: u32) -> Option<()> {
    memory
        .get_mut(offset..offset + 4)?
        .copy_from_slice(&value.to_le_bytes());
    Some(())
}
