pub mod boot;
pub mod description;
pub mod encoder;
pub mod entry;
pub mod environment;
pub mod image;
pub mod loader;
pub mod object_file;
pub mod section;
pub mod serializable;
pub mod session;

pub use boot::{BootError, KernelBuilder, SegmentRegister};
pub use description::{BuildDescription, Directive, RawBuildDescription};
pub use encoder::{EncodeError, Instruction, InstructionEncoder, Register, StubEncoder};
pub use entry::{EntryOverrides, EntryPoint, EntrySection};
pub use environment::{Environment, PAGE_SIZE};
pub use image::{ImageBlock, MemoryImage};
pub use loader::LoaderScript;
pub use object_file::{AddressResolvable, LinkedObject, LinkerError};
pub use section::{PlacedSection, RawSection};
pub use serializable::{Serializable, SerializationError};
pub use session::{ObjectId, Session};
