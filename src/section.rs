/// A region that has been assigned a final absolute address and is ready
/// to be merged into the memory image. Implementors hand the synthesizer
/// an immutable byte view; nothing mutates a section once synthesis runs.
pub trait PlacedSection {
    fn base(&self) -> u32;
    fn bytes(&self) -> &[u8];
}

/// A directly authored memory region, placed at an explicit address.
#[derive(Debug, Clone)]
pub struct RawSection {
    pub base: u32,
    pub data: Vec<u8>,
}

impl RawSection {
    pub fn new(base: u32, data: Vec<u8>) -> Self {
        RawSection { base, data }
    }
}

impl PlacedSection for RawSection {
    fn base(&self) -> u32 {
        self.base
    }

    fn bytes(&self) -> &[u8] {
        &self.data
    }
}
