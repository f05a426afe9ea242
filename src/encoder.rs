use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Register {
    Eax,
    Ecx,
    Edx,
    Ebx,
    Esp,
    Ebp,
    Esi,
    Edi,
}

impl Register {
    /// Three-bit register number used in opcode and ModR/M encodings.
    fn code(self) -> u8 {
        match self {
            Register::Eax => 0,
            Register::Ecx => 1,
            Register::Edx => 2,
            Register::Ebx => 3,
            Register::Esp => 4,
            Register::Ebp => 5,
            Register::Esi => 6,
            Register::Edi => 7,
        }
    }
}

/// The instruction subset the linker itself emits. Everything else is the
/// business of the external toolchain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Instruction {
    PushImm(u32),
    Pop(Register),
    Call(Register),
    Hlt,
}

#[derive(Debug)]
pub struct EncodeError(pub String);

impl fmt::Display for EncodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for EncodeError {}

/// Boundary to the machine-code encoder: takes a structured instruction
/// sequence and returns exact bytes.
pub trait InstructionEncoder {
    fn encode(&self, program: &[Instruction]) -> Result<Vec<u8>, EncodeError>;
}

/// Built-in 32-bit x86 encoder for the stub subset.
#[derive(Debug, Default)]
pub struct StubEncoder;

impl InstructionEncoder for StubEncoder {
    fn encode(&self, program: &[Instruction]) -> Result<Vec<u8>, EncodeError> {
        let mut out = Vec::new();
        for instruction in program {
            match *instruction {
                Instruction::PushImm(value) => {
                    out.push(0x68);
                    out.extend(value.to_le_bytes());
                }
                Instruction::Pop(register) => out.push(0x58 + register.code()),
                Instruction::Call(register) => {
                    out.push(0xFF);
                    out.push(0xD0 + register.code());
                }
                Instruction::Hlt => out.push(0xF4),
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stub_sequence_encoding() {
        let program = [
            Instruction::PushImm(0x40_0010),
            Instruction::Pop(Register::Eax),
            Instruction::PushImm(0x40_0800),
            Instruction::Pop(Register::Ebx),
            Instruction::Call(Register::Eax),
            Instruction::Hlt,
        ];
        let bytes = StubEncoder.encode(&program).unwrap();
        assert_eq!(
            bytes,
            vec![
                0x68, 0x10, 0x00, 0x40, 0x00, // push 0x400010
                0x58, // pop eax
                0x68, 0x00, 0x08, 0x40, 0x00, // push 0x400800
                0x5B, // pop ebx
                0xFF, 0xD0, // call eax
                0xF4, // hlt
            ]
        );
    }

    #[test]
    fn halt_alone() {
        assert_eq!(StubEncoder.encode(&[Instruction::Hlt]).unwrap(), vec![0xF4]);
    }
}
