pub mod gdt;

use std::fmt;
use std::fmt::Write as _;
use std::fs;
use std::path::PathBuf;
use std::process::Command;

use log::info;
use serde::Deserialize;

use gdt::{create_gdt_entry, create_selector, default_gdt};

/// Multiboot v1 header, page-align | memory-info flags, checksum such
/// that the three words sum to zero. QEMU's -kernel only speaks v1.
const MULTIBOOT_HEADER: &str = "\
ALIGN 4
section .multiboot_header
    MULTIBOOT_PAGE_ALIGN    equ 1<<0
    MULTIBOOT_MEMORY_INFO   equ 1<<1
    MULTIBOOT_HEADER_MAGIC  equ 0x1BADB002
    MULTIBOOT_HEADER_FLAGS  equ MULTIBOOT_PAGE_ALIGN | MULTIBOOT_MEMORY_INFO
    MULTIBOOT_CHECKSUM      equ -(MULTIBOOT_HEADER_MAGIC + MULTIBOOT_HEADER_FLAGS)

    dd MULTIBOOT_HEADER_MAGIC
    dd MULTIBOOT_HEADER_FLAGS
    dd MULTIBOOT_CHECKSUM
";

/// Places the multiboot header first and the boot code at the 1MB mark
/// where the bootloader expects it.
const LINKER_SCRIPT: &str = "\
ENTRY(start)

SECTIONS {
    . = 0x100000;

    .boot :
    {
        *(.multiboot_header)
    }

    .text :
    {
        *(.text)
    }

}
";

#[derive(Debug)]
pub enum BootError {
    Io(std::io::Error),
    Toolchain { stage: &'static str, code: Option<i32> },
}

impl fmt::Display for BootError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BootError::Io(e) => write!(f, "i/o error: {}", e),
            BootError::Toolchain { stage, code } => match code {
                Some(code) => write!(f, "{} exited with status {}", stage, code),
                None => write!(f, "{} was killed or could not run", stage),
            },
        }
    }
}

impl std::error::Error for BootError {}

impl From<std::io::Error> for BootError {
    fn from(e: std::io::Error) -> Self {
        BootError::Io(e)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SegmentRegister {
    Ds,
    Es,
    Fs,
    Gs,
    Ss,
}

impl SegmentRegister {
    fn name(self) -> &'static str {
        match self {
            SegmentRegister::Ds => "ds",
            SegmentRegister::Es => "es",
            SegmentRegister::Fs => "fs",
            SegmentRegister::Gs => "gs",
            SegmentRegister::Ss => "ss",
        }
    }
}

/// Generates the protected-mode bootstrap: descriptor table, segment
/// selector loads, stack setup and the indirect jump into the linked
/// image. Shares the linker's view of the entry address but owns no
/// linker state.
#[derive(Debug)]
pub struct KernelBuilder {
    pub stack_base: u32,
    pub control_transfer_address: u32,
    pub build_dir: PathBuf,
    pub output: PathBuf,
    gdt: Vec<u64>,
    selectors: Vec<(SegmentRegister, u16)>,
}

impl Default for KernelBuilder {
    fn default() -> Self {
        KernelBuilder {
            stack_base: 0x80_0000,
            control_transfer_address: 0x84_0000,
            build_dir: std::env::temp_dir().join("kernelbuild"),
            output: PathBuf::from("kernel.bin"),
            gdt: default_gdt(),
            selectors: Vec::new(),
        }
    }
}

impl KernelBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces or appends a descriptor; gaps up to `index` are
    /// zero-filled.
    pub fn insert_gdt_entry(&mut self, index: usize, base: u32, limit: u32, access: u8, flags: u8) {
        if index >= self.gdt.len() {
            self.gdt.resize(index + 1, 0);
        }
        self.gdt[index] = create_gdt_entry(base, limit, access, flags);
    }

    /// Declares a segment register to be loaded with the given selector
    /// during bootstrap, in declaration order.
    pub fn bind_register(&mut self, register: SegmentRegister, index: u16, flags: u16) {
        self.selectors.push((register, create_selector(index, flags)));
    }

    /// The boot stub as NASM text. Pure function of the builder state, so
    /// the output can be checked without running the toolchain.
    pub fn boot_assembly(&self) -> String {
        let mut out = String::new();
        out.push_str("global start\n\nsection .text\nbits 32\nstart:\n");
        out.push_str("    lgdt [gdt32_descr]\n");
        for (register, selector) in &self.selectors {
            let _ = writeln!(out, "    mov ax, {:#x}", selector);
            let _ = writeln!(out, "    mov {}, ax", register.name());
        }
        let _ = writeln!(out, "    mov eax, {:#x}", self.stack_base);
        out.push_str("    mov esp, eax\n");
        let _ = writeln!(out, "    jmp [{:#x}]", self.control_transfer_address);
        out.push('\n');
        out.push_str("gdt32:\n");
        for entry in &self.gdt {
            let _ = writeln!(out, "    dq {:#018x}", entry);
        }
        out.push_str("tss_descr:\n    times 64 dq 0x000089000000ffff\n");
        out.push_str("gdt32_end:\n");
        out.push_str("gdt32_descr:\n    dw gdt32_end - gdt32 - 1\n    dd gdt32\n");
        out
    }

    /// Writes the assembly inputs and runs the external pipeline:
    /// assemble the multiboot header, assemble the boot code, link both
    /// into a flat binary. Any failing step aborts the build; there is
    /// no retry.
    pub fn build(&self) -> Result<(), BootError> {
        fs::create_dir_all(&self.build_dir)?;
        let linker_script = self.build_dir.join("linker.ld");
        let header_asm = self.build_dir.join("multiboot_header.asm");
        let header_obj = self.build_dir.join("multiboot_header.o");
        let boot_asm = self.build_dir.join("boot.asm");
        let boot_obj = self.build_dir.join("boot.o");

        fs::write(&linker_script, LINKER_SCRIPT)?;
        fs::write(&header_asm, MULTIBOOT_HEADER)?;
        fs::write(&boot_asm, self.boot_assembly())?;
        info!("wrote boot inputs to {}", self.build_dir.display());

        run_stage(
            "nasm (multiboot header)",
            Command::new("nasm")
                .arg("-felf32")
                .arg(&header_asm)
                .arg("-o")
                .arg(&header_obj),
        )?;
        run_stage(
            "nasm (boot code)",
            Command::new("nasm")
                .arg("-felf32")
                .arg(&boot_asm)
                .arg("-o")
                .arg(&boot_obj),
        )?;
        run_stage(
            "ld",
            Command::new("ld")
                .args(["-m", "elf_i386", "-n", "-T"])
                .arg(&linker_script)
                .arg("-o")
                .arg(&self.output)
                .arg(&boot_obj)
                .arg(&header_obj),
        )?;
        info!("boot image written to {}", self.output.display());
        Ok(())
    }
}

fn run_stage(stage: &'static str, command: &mut Command) -> Result<(), BootError> {
    let status = command
        .status()
        .map_err(|_| BootError::Toolchain { stage, code: None })?;
    if !status.success() {
        return Err(BootError::Toolchain {
            stage,
            code: status.code(),
        });
    }
    Ok(())
}
