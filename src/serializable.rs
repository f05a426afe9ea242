#[derive(Debug)]
pub enum SerializationError {
    InvalidMagic,
    InvalidBlockType(u8),
    DataTooShort,
}

impl std::fmt::Display for SerializationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SerializationError::InvalidMagic => write!(f, "invalid image magic"),
            SerializationError::InvalidBlockType(v) => write!(f, "invalid block type {}", v),
            SerializationError::DataTooShort => write!(f, "data too short"),
        }
    }
}

impl std::error::Error for SerializationError {}

pub trait Serializable: Sized {
    fn serialize(&self) -> Vec<u8>;
    fn deserialize(data: &[u8]) -> Result<(usize, Self), SerializationError>;
}
