use log::info;

use crate::section::PlacedSection;
use crate::serializable::{Serializable, SerializationError};

/// 24 bytes, no trailing null.
pub const MAGIC: &[u8; 24] = b"CalderalinkerMemoryImage";

const BLOCK_ZERO_FILL: u8 = 0;
const BLOCK_RAW: u8 = 1;

/// One region of the sparse address space. All-zero regions carry no
/// payload; bootstrap and BSS-like sections are common enough that this
/// keeps images small.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageBlock {
    ZeroFill { start: u32, length: u32 },
    Raw { start: u32, data: Vec<u8> },
}

impl ImageBlock {
    pub fn start(&self) -> u32 {
        match self {
            ImageBlock::ZeroFill { start, .. } => *start,
            ImageBlock::Raw { start, .. } => *start,
        }
    }

    pub fn length(&self) -> u32 {
        match self {
            ImageBlock::ZeroFill { length, .. } => *length,
            ImageBlock::Raw { data, .. } => data.len() as u32,
        }
    }
}

/// The serialized form of a finished build: every placed section, in
/// ascending base address order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryImage {
    pub blocks: Vec<ImageBlock>,
}

impl MemoryImage {
    /// Consumes the final placed-section list. Sections are emitted sorted
    /// by base address; order does not affect reconstruction, only clarity.
    pub fn from_sections(sections: &[&dyn PlacedSection]) -> Self {
        let mut sorted = sections.to_vec();
        sorted.sort_by_key(|section| section.base());

        let mut blocks = Vec::with_capacity(sorted.len());
        for section in sorted {
            let bytes = section.bytes();
            info!("section at {:#x}, {:#x} bytes", section.base(), bytes.len());
            if bytes.iter().all(|&b| b == 0) {
                blocks.push(ImageBlock::ZeroFill {
                    start: section.base(),
                    length: bytes.len() as u32,
                });
            } else {
                blocks.push(ImageBlock::Raw {
                    start: section.base(),
                    data: bytes.to_vec(),
                });
            }
        }
        MemoryImage { blocks }
    }

    /// Smallest buffer the image reconstructs into.
    pub fn required_len(&self) -> usize {
        self.blocks
            .iter()
            .map(|block| block.start() as usize + block.length() as usize)
            .max()
            .unwrap_or(0)
    }

    /// Replays the blocks into a flat buffer, the way the consumer does.
    /// The buffer must be at least `required_len()` bytes; shorter buffers
    /// panic on the out-of-range write.
    pub fn apply_to(&self, memory: &mut [u8]) {
        for block in &self.blocks {
            let start = block.start() as usize;
            match block {
                ImageBlock::ZeroFill { length, .. } => {
                    memory[start..start + *length as usize].fill(0);
                }
                ImageBlock::Raw { data, .. } => {
                    memory[start..start + data.len()].copy_from_slice(data);
                }
            }
        }
    }
}

impl Serializable for MemoryImage {
    fn serialize(&self) -> Vec<u8> {
        let mut data = Vec::new();
        data.extend(MAGIC);
        for block in &self.blocks {
            match block {
                ImageBlock::ZeroFill { start, length } => {
                    data.push(BLOCK_ZERO_FILL);
                    data.extend(start.to_le_bytes());
                    data.extend(length.to_le_bytes());
                }
                ImageBlock::Raw { start, data: bytes } => {
                    data.push(BLOCK_RAW);
                    data.extend(start.to_le_bytes());
                    data.extend((bytes.len() as u32).to_le_bytes());
                    data.extend(bytes);
                }
            }
        }
        data
    }

    fn deserialize(data: &[u8]) -> Result<(usize, Self), SerializationError> {
        if data.len() < MAGIC.len() {
            return Err(SerializationError::DataTooShort);
        }
        if &data[..MAGIC.len()] != MAGIC {
            return Err(SerializationError::InvalidMagic);
        }

        let mut offset = MAGIC.len();
        let mut blocks = Vec::new();
        while offset < data.len() {
            if offset + 9 > data.len() {
                return Err(SerializationError::DataTooShort);
            }
            let block_type = data[offset];
            let start = u32::from_le_bytes([
                data[offset + 1],
                data[offset + 2],
                data[offset + 3],
                data[offset + 4],
            ]);
            let length = u32::from_le_bytes([
                data[offset + 5],
                data[offset + 6],
                data[offset + 7],
                data[offset + 8],
            ]);
            offset += 9;
            match block_type {
                BLOCK_ZERO_FILL => blocks.push(ImageBlock::ZeroFill { start, length }),
                BLOCK_RAW => {
                    if offset + length as usize > data.len() {
                        return Err(SerializationError::DataTooShort);
                    }
                    blocks.push(ImageBlock::Raw {
                        start,
                        data: data[offset..offset + length as usize].to_vec(),
                    });
                    offset += length as usize;
                }
                v => return Err(SerializationError::InvalidBlockType(v)),
            }
        }
        Ok((offset, MemoryImage { blocks }))
    }
}
