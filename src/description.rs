use std::collections::{HashMap, HashSet};
use std::path::PathBuf;

use serde::Deserialize;

use crate::boot::{KernelBuilder, SegmentRegister};
use crate::entry::EntryOverrides;
use crate::environment::Environment;
use crate::object_file::LinkerError;
use crate::section::RawSection;
use crate::session::{ObjectId, Session};

/// One linking step of a declarative build description. Directives run
/// strictly in order; placement and resolution order follow from it.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Directive {
    Org {
        address: u32,
    },
    EntrySection,
    Object {
        id: String,
        path: String,
    },
    Bind {
        object: String,
        symbol: String,
        provider: String,
        #[serde(default)]
        provider_symbol: Option<String>,
    },
    BindAll {
        object: String,
        provider: String,
    },
    Entry {
        name: String,
        object: String,
        symbol: String,
        #[serde(default)]
        args: Option<String>,
        #[serde(default)]
        prologue: Option<String>,
        #[serde(default)]
        epilogue: Option<String>,
    },
    RawSection {
        base: u32,
        data: Vec<u8>,
    },
    Postconstruct {
        code: String,
    },
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawSelectorBinding {
    pub register: SegmentRegister,
    pub index: u16,
    #[serde(default)]
    pub flags: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawGdtEntry {
    pub index: usize,
    pub base: u32,
    pub limit: u32,
    pub access: u8,
    pub flags: u8,
}

fn default_stack_base() -> u32 {
    0x80_0000
}

fn default_control_transfer() -> u32 {
    0x84_0000
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawKernel {
    #[serde(default = "default_stack_base")]
    pub stack_base: u32,
    #[serde(default = "default_control_transfer")]
    pub control_transfer_address: u32,
    pub output: String,
    #[serde(default)]
    pub build_dir: Option<String>,
    #[serde(default)]
    pub selectors: Vec<RawSelectorBinding>,
    #[serde(default)]
    pub gdt_entries: Vec<RawGdtEntry>,
}

fn default_outdir() -> String {
    "output".to_string()
}

fn object_id(ids: &HashMap<&str, ObjectId>, id: &str) -> Result<ObjectId, LinkerError> {
    ids.get(id)
        .copied()
        .ok_or_else(|| LinkerError::UnknownObject(id.to_string()))
}

/// Serde mirror of a build description file, unchecked.
#[derive(Debug, Deserialize)]
pub struct RawBuildDescription {
    pub result: String,
    #[serde(default = "default_outdir")]
    pub outdir: String,
    #[serde(default)]
    pub url_base: String,
    #[serde(default)]
    pub suppress_loader: bool,
    #[serde(default)]
    pub directives: Vec<Directive>,
    #[serde(default)]
    pub kernel: Option<RawKernel>,
}

/// A validated build description: object ids resolve, the entry section
/// is created at most once and before any entry declaration.
#[derive(Debug)]
pub struct BuildDescription {
    pub result: String,
    pub outdir: String,
    pub url_base: String,
    pub suppress_loader: bool,
    pub directives: Vec<Directive>,
    pub kernel: Option<RawKernel>,
}

impl BuildDescription {
    pub fn from_str(source: &str) -> Result<Self, LinkerError> {
        let raw: RawBuildDescription = serde_yaml::from_str(source)?;
        BuildDescription::try_from(raw)
    }

    /// Replays the directives against a fresh session, finalizes it and,
    /// when a kernel block is present, builds the boot image.
    pub fn run(&self) -> Result<(), LinkerError> {
        let mut env = Environment::default();
        env.result = self.result.clone();
        env.outdir = PathBuf::from(&self.outdir);
        env.url_base = self.url_base.clone();
        env.suppress_loader = self.suppress_loader;

        let mut session = Session::new(env);
        let mut ids: HashMap<&str, ObjectId> = HashMap::new();
        for directive in &self.directives {
            match directive {
                Directive::Org { address } => session.env.set_org(*address),
                Directive::EntrySection => session.entry_section()?,
                Directive::Object { id, path } => {
                    let handle = session.link_so_file(path)?;
                    ids.insert(id, handle);
                }
                Directive::Bind {
                    object,
                    symbol,
                    provider,
                    provider_symbol,
                } => {
                    session.bind(
                        object_id(&ids, object)?,
                        symbol,
                        object_id(&ids, provider)?,
                        provider_symbol.as_deref(),
                    )?;
                }
                Directive::BindAll { object, provider } => {
                    session.bind_all(object_id(&ids, object)?, object_id(&ids, provider)?);
                }
                Directive::Entry {
                    name,
                    object,
                    symbol,
                    args,
                    prologue,
                    epilogue,
                } => {
                    let mut overrides = EntryOverrides::default();
                    if let Some(args) = args {
                        overrides.args = args.clone();
                    }
                    if let Some(prologue) = prologue {
                        overrides.prologue = prologue.clone();
                    }
                    if let Some(epilogue) = epilogue {
                        overrides.epilogue = epilogue.clone();
                    }
                    session.entry(name, object_id(&ids, object)?, symbol, overrides)?;
                }
                Directive::RawSection { base, data } => {
                    session.raw_section(RawSection::new(*base, data.clone()));
                }
                Directive::Postconstruct { code } => session.postconstruct(code),
            }
        }
        session.finish()?;

        if let Some(kernel) = &self.kernel {
            let mut builder = KernelBuilder::new();
            builder.stack_base = kernel.stack_base;
            builder.control_transfer_address = kernel.control_transfer_address;
            builder.output = PathBuf::from(&kernel.output);
            if let Some(build_dir) = &kernel.build_dir {
                builder.build_dir = PathBuf::from(build_dir);
            }
            for entry in &kernel.gdt_entries {
                builder.insert_gdt_entry(
                    entry.index,
                    entry.base,
                    entry.limit,
                    entry.access,
                    entry.flags,
                );
            }
            for binding in &kernel.selectors {
                builder.bind_register(binding.register, binding.index, binding.flags);
            }
            builder.build()?;
        }
        Ok(())
    }
}

impl TryFrom<RawBuildDescription> for BuildDescription {
    type Error = LinkerError;

    fn try_from(raw: RawBuildDescription) -> Result<Self, Self::Error> {
        let mut declared: HashSet<&str> = HashSet::new();
        let mut has_entry_section = false;
        let check = |declared: &HashSet<&str>, id: &str| -> Result<(), LinkerError> {
            if !declared.contains(id) {
                return Err(LinkerError::UnknownObject(id.to_string()));
            }
            Ok(())
        };

        for directive in &raw.directives {
            match directive {
                Directive::Object { id, .. } => {
                    if !declared.insert(id) {
                        return Err(LinkerError::DuplicateObject(id.clone()));
                    }
                }
                Directive::EntrySection => {
                    if has_entry_section {
                        return Err(LinkerError::EntrySectionExists);
                    }
                    has_entry_section = true;
                }
                Directive::Bind {
                    object, provider, ..
                }
                | Directive::BindAll { object, provider } => {
                    check(&declared, object)?;
                    check(&declared, provider)?;
                }
                Directive::Entry { object, .. } => {
                    if !has_entry_section {
                        return Err(LinkerError::NoEntrySection);
                    }
                    check(&declared, object)?;
                }
                Directive::Org { .. }
                | Directive::RawSection { .. }
                | Directive::Postconstruct { .. } => {}
            }
        }

        Ok(BuildDescription {
            result: raw.result,
            outdir: raw.outdir,
            url_base: raw.url_base,
            suppress_loader: raw.suppress_loader,
            directives: raw.directives,
            kernel: raw.kernel,
        })
    }
}
