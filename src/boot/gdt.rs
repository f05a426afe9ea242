// Flag nibble (bits 52-55 of a descriptor).
pub const F_GRANULARITY: u8 = 0x8; // limit counts 4KiB blocks instead of bytes
pub const F_PROT_32: u8 = 0x4; // 32-bit protected mode
pub const F_LONG: u8 = 0x2; // long mode
pub const F_AVAILABLE: u8 = 0x1; // free for system use

// Access byte (bits 40-47).
pub const A_PRESENT: u8 = 0x80;
pub const A_PRIV_3: u8 = 0x60;
pub const A_PRIV_2: u8 = 0x40;
pub const A_PRIV_1: u8 = 0x20;
pub const A_PRIV_0: u8 = 0x0;
pub const A_CODE: u8 = 0x10;
pub const A_DATA: u8 = 0x10;
pub const A_TSS: u8 = 0x0;
pub const A_GATE: u8 = 0x0;
pub const A_EXEC: u8 = 0x8;
pub const A_DATA_WRITABLE: u8 = 0x2;
pub const A_CODE_READABLE: u8 = 0x2;
pub const A_DIR_CON_BIT: u8 = 0x4;

// Selector flags.
pub const S_GDT: u16 = 0x0;
pub const S_LDT: u16 = 0x4;
pub const S_PRIV_3: u16 = 0x3;
pub const S_PRIV_2: u16 = 0x2;
pub const S_PRIV_1: u16 = 0x1;
pub const S_PRIV_0: u16 = 0x0;

/// Packs one 8-byte segment descriptor. The split layout is dictated by
/// the hardware: limit in bits 0-15 and 48-51, base in bits 16-39 and
/// 56-63, access in 40-47, flags in 52-55.
pub fn create_gdt_entry(base: u32, limit: u32, access: u8, flags: u8) -> u64 {
    let mut entry = (limit & 0xffff) as u64;
    entry |= ((base & 0xff_ffff) as u64) << 16;
    entry |= (access as u64) << 40;
    entry |= (((limit >> 16) & 0xf) as u64) << 48;
    entry |= ((flags & 0xf) as u64) << 52;
    entry |= (((base >> 24) & 0xff) as u64) << 56;
    entry
}

/// Builds the value loaded into a segment register: table index shifted
/// past the flag bits.
pub fn create_selector(index: u16, flags: u16) -> u16 {
    flags | index << 3
}

/// The 16 descriptors every boot image starts from: null, flat 32-bit
/// code/data, a not-present code segment, a TSS slot, two 16-bit
/// real-mode-compatible segments, two ring-3 segments and spares.
pub fn default_gdt() -> Vec<u64> {
    vec![
        0,
        0x00cf9b000000ffff, // flat 32-bit code
        0x00cf93000000ffff, // flat 32-bit data
        0x00cf1b000000ffff, // flat 32-bit code, not present
        0,                  // TSS for task gates
        0x008f9b000000ffff, // 16-bit code
        0x008f93000000ffff, // 16-bit data
        0x00cffb000000ffff, // 32-bit code, ring 3
        0x00cff3000000ffff, // 32-bit data, ring 3
        0,
        0, // 6 spare selectors
        0,
        0,
        0,
        0,
        0,
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flat_code_descriptor_is_bit_exact() {
        assert_eq!(
            create_gdt_entry(0, 0xfffff, 0x9b, 0xc),
            0x00cf9b000000ffff
        );
    }

    #[test]
    fn default_table_matches_its_own_encoder() {
        let table = default_gdt();
        assert_eq!(table.len(), 16);
        assert_eq!(table[0], 0);
        let access = A_PRESENT | A_PRIV_0 | A_CODE | A_EXEC | A_CODE_READABLE | 1;
        assert_eq!(
            table[1],
            create_gdt_entry(0, 0xfffff, access, F_GRANULARITY | F_PROT_32)
        );
        let user_access = A_PRESENT | A_PRIV_3 | A_DATA | A_DATA_WRITABLE | 1;
        assert_eq!(
            table[8],
            create_gdt_entry(0, 0xfffff, user_access, F_GRANULARITY | F_PROT_32)
        );
    }

    #[test]
    fn selector_encoding() {
        assert_eq!(create_selector(1, S_PRIV_0), 0x08);
        assert_eq!(create_selector(2, S_PRIV_3), 0x13);
        assert_eq!(create_selector(0, S_LDT), 0x04);
    }

    #[test]
    fn base_and_limit_are_split_across_the_descriptor() {
        let entry = create_gdt_entry(0x12345678, 0xabcde, 0x93, 0xc);
        assert_eq!(entry & 0xffff, 0xbcde); // limit low
        assert_eq!((entry >> 48) & 0xf, 0xa); // limit high
        assert_eq!((entry >> 16) & 0xff_ffff, 0x345678); // base low
        assert_eq!((entry >> 56) & 0xff, 0x12); // base high
        assert_eq!((entry >> 40) & 0xff, 0x93); // access
        assert_eq!((entry >> 52) & 0xf, 0xc); // flags
    }
}
