use crate::encoder::{Instruction, InstructionEncoder, Register};
use crate::object_file::LinkerError;
use crate::section::PlacedSection;

/// One externally invocable entry into the linked image, backed by a stub
/// inside the entry section.
#[derive(Debug, Clone)]
pub struct EntryPoint {
    pub name: String,
    pub stub_address: u32,
    pub args: String,
    pub prologue: String,
    pub epilogue: String,
}

/// Per-entry wrapper customization. Defaults reproduce the standard
/// contract: no arguments, no prologue, return the first 32-bit register.
#[derive(Debug, Clone)]
pub struct EntryOverrides {
    pub args: String,
    pub prologue: String,
    pub epilogue: String,
}

impl Default for EntryOverrides {
    fn default() -> Self {
        EntryOverrides {
            args: String::new(),
            prologue: String::new(),
            epilogue: "return this.emulator.v86.cpu.reg32.valueOf()[0];".to_string(),
        }
    }
}

/// The raw section every entry stub lives in. Its first word is the
/// bridging slot: the boot stub jumps indirectly through it, and the
/// consumer rewrites it before each invocation. It initially points at
/// the halt that follows, so a freshly booted image stops immediately.
#[derive(Debug)]
pub struct EntrySection {
    base: u32,
    data: Vec<u8>,
}

impl EntrySection {
    pub fn new(base: u32, encoder: &dyn InstructionEncoder) -> Result<Self, LinkerError> {
        let mut data = Vec::new();
        data.extend((base + 8).to_le_bytes());
        data.extend([0u8; 4]);
        data.extend(encoder.encode(&[Instruction::Hlt])?);
        Ok(EntrySection { base, data })
    }

    /// Address of the 4-byte slot the consumer writes stub addresses into.
    pub fn bridging_slot(&self) -> u32 {
        self.base
    }

    /// Appends a control-transfer stub for `target`: load the target and
    /// its object's GOT pointer, call, halt. Stubs are laid out
    /// back-to-back in declaration order. Returns the stub's absolute
    /// start address.
    pub fn add_stub(
        &mut self,
        target: u32,
        got: u32,
        encoder: &dyn InstructionEncoder,
    ) -> Result<u32, LinkerError> {
        let start = self.base + self.data.len() as u32;
        let stub = [
            Instruction::PushImm(target),
            Instruction::Pop(Register::Eax),
            Instruction::PushImm(got),
            Instruction::Pop(Register::Ebx),
            Instruction::Call(Register::Eax),
            Instruction::Hlt,
        ];
        self.data.extend(encoder.encode(&stub)?);
        Ok(start)
    }
}

impl PlacedSection for EntrySection {
    fn base(&self) -> u32 {
        self.base
    }

    fn bytes(&self) -> &[u8] {
        &self.data
    }
}
