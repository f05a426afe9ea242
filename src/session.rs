use std::fs;
use std::path::Path;

use log::{info, warn};

use crate::encoder::{InstructionEncoder, StubEncoder};
use crate::entry::{EntryOverrides, EntryPoint, EntrySection};
use crate::environment::Environment;
use crate::image::MemoryImage;
use crate::loader::LoaderScript;
use crate::object_file::{AddressResolvable, LinkedObject, LinkerError};
use crate::section::{PlacedSection, RawSection};
use crate::serializable::Serializable;

/// Handle to an object owned by a session. Only valid for the session
/// that issued it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectId(pub(crate) usize);

/// One build invocation: owns the allocation cursor, every ingested
/// object and raw section, and the entry bookkeeping. Strictly
/// single-threaded; call order is part of the observable contract.
pub struct Session {
    pub env: Environment,
    objects: Vec<LinkedObject>,
    raw_sections: Vec<RawSection>,
    entry_section: Option<EntrySection>,
    entries: Vec<EntryPoint>,
    postconstruct: String,
    encoder: Box<dyn InstructionEncoder>,
}

impl Session {
    pub fn new(env: Environment) -> Self {
        Self::with_encoder(env, Box::new(StubEncoder))
    }

    pub fn with_encoder(env: Environment, encoder: Box<dyn InstructionEncoder>) -> Self {
        Session {
            env,
            objects: Vec::new(),
            raw_sections: Vec::new(),
            entry_section: None,
            entries: Vec::new(),
            postconstruct: String::new(),
            encoder,
        }
    }

    /// Ingests, allocates and relocates one object file.
    pub fn link_so_file(&mut self, path: impl AsRef<Path>) -> Result<ObjectId, LinkerError> {
        let object = LinkedObject::ingest(path, &mut self.env)?;
        info!(
            "{} placed at {:#x}, {:#x} bytes",
            object.label,
            object.base,
            object.memory.len()
        );
        self.objects.push(object);
        Ok(ObjectId(self.objects.len() - 1))
    }

    /// Ingests an object already held in memory. Mostly useful for tests
    /// and generated objects.
    pub fn link_so_bytes(&mut self, label: &str, data: &[u8]) -> Result<ObjectId, LinkerError> {
        let object = LinkedObject::from_bytes(label, data, &mut self.env)?;
        self.objects.push(object);
        Ok(ObjectId(self.objects.len() - 1))
    }

    pub fn object(&self, id: ObjectId) -> &LinkedObject {
        &self.objects[id.0]
    }

    /// Binds one undefined symbol of `source` to a symbol defined by
    /// `provider` (same name unless overridden). Asking for a name that
    /// is not undefined is reported and ignored.
    pub fn bind(
        &mut self,
        source: ObjectId,
        name: &str,
        provider: ObjectId,
        provider_name: Option<&str>,
    ) -> Result<(), LinkerError> {
        if !self.objects[source.0].is_undefined(name) {
            warn!(
                "no such undefined symbol {} in {}",
                name, self.objects[source.0].label
            );
            return Ok(());
        }
        let provider_name = provider_name.unwrap_or(name);
        let address = self.objects[provider.0]
            .resolve_symbol(provider_name)
            .ok_or_else(|| LinkerError::SymbolNotFound {
                object: self.objects[provider.0].label.clone(),
                symbol: provider_name.to_string(),
            })?;
        self.objects[source.0].record_binding(name, address);
        Ok(())
    }

    /// Attempts to bind every undefined symbol of `source` against
    /// `provider`. Per-symbol failures are logged, not fatal. Returns
    /// the number of symbols bound.
    pub fn bind_all(&mut self, source: ObjectId, provider: ObjectId) -> usize {
        let names: Vec<String> = self.objects[source.0].undefined.keys().cloned().collect();
        let mut count = 0;
        for name in names {
            match self.objects[provider.0].resolve_symbol(&name) {
                Some(address) => {
                    self.objects[source.0].record_binding(&name, address);
                    count += 1;
                }
                None => warn!(
                    "no symbol {} in {}",
                    name, self.objects[provider.0].label
                ),
            }
        }
        info!(
            "bound {} undefined symbols in {} to {}",
            count, self.objects[source.0].label, self.objects[provider.0].label
        );
        count
    }

    /// Creates the singleton entry section at the current cursor. The
    /// cursor is left untouched: the entry section anchors whatever the
    /// build places next, exactly where the caller set `org`.
    pub fn entry_section(&mut self) -> Result<(), LinkerError> {
        if self.entry_section.is_some() {
            return Err(LinkerError::EntrySectionExists);
        }
        self.entry_section = Some(EntrySection::new(self.env.org, self.encoder.as_ref())?);
        Ok(())
    }

    /// Declares an externally invocable entry point that transfers
    /// control to `symbol` inside `object`.
    pub fn entry(
        &mut self,
        name: &str,
        object: ObjectId,
        symbol: &str,
        overrides: EntryOverrides,
    ) -> Result<(), LinkerError> {
        let Some(section) = self.entry_section.as_mut() else {
            return Err(LinkerError::NoEntrySection);
        };
        let target = self.objects[object.0]
            .resolve_symbol(symbol)
            .ok_or_else(|| LinkerError::SymbolNotFound {
                object: self.objects[object.0].label.clone(),
                symbol: symbol.to_string(),
            })?;
        let got = self.objects[object.0].got;
        let stub_address = section.add_stub(target, got, self.encoder.as_ref())?;
        info!("entry {} -> {:#x} (stub at {:#x})", name, target, stub_address);
        self.entries.push(EntryPoint {
            name: name.to_string(),
            stub_address,
            args: overrides.args,
            prologue: overrides.prologue,
            epilogue: overrides.epilogue,
        });
        Ok(())
    }

    pub fn raw_section(&mut self, section: RawSection) {
        self.raw_sections.push(section);
    }

    /// Appends statements to the generated loader's init routine.
    pub fn postconstruct(&mut self, code: &str) {
        self.postconstruct.push_str(code);
        self.postconstruct.push('\n');
    }

    /// Finalizes the build: runs every object's binding end-hook,
    /// synthesizes the memory image and writes the output artifacts.
    /// Consumes the session; sections are immutable from here on.
    pub fn finish(mut self) -> Result<(), LinkerError> {
        for object in &mut self.objects {
            object.apply_bindings();
        }

        info!("==== synthesis ====");
        let mut sections: Vec<&dyn PlacedSection> = Vec::new();
        for object in &self.objects {
            sections.push(object);
        }
        for section in &self.raw_sections {
            sections.push(section);
        }
        if let Some(entry_section) = &self.entry_section {
            sections.push(entry_section);
        }
        let image = MemoryImage::from_sections(&sections);

        fs::create_dir_all(&self.env.outdir)?;
        fs::write(self.env.outdir.join("system.cmi"), image.serialize())?;

        if !self.env.suppress_loader {
            let script = LoaderScript {
                result: &self.env.result,
                url_base: &self.env.url_base,
                bridging_slot: self
                    .entry_section
                    .as_ref()
                    .map(|section| section.bridging_slot())
                    .unwrap_or(0),
                entries: &self.entries,
                postconstruct: &self.postconstruct,
            };
            fs::write(
                self.env.outdir.join(format!("{}.js", self.env.result)),
                script.render(),
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::ImageBlock;
    use crate::object_file::fixtures;

    fn test_outdir(name: &str) -> std::path::PathBuf {
        std::env::temp_dir().join(format!("calderalink-{}-{}", name, std::process::id()))
    }

    /// Source defines `localfn` and leaves `extfn` undefined; the provider
    /// defines both. Bases: source at 0x400000, provider at 0x405000.
    fn linked_pair() -> (Session, ObjectId, ObjectId) {
        let mut env = Environment::default();
        env.set_org(0x40_0000);
        let mut session = Session::new(env);
        let source = session
            .link_so_bytes("source.so", &fixtures::sample_object())
            .unwrap();
        let provider = session
            .link_so_bytes(
                "provider.so",
                &fixtures::object_with_symbols(&[(1, 0x1010, 1), (9, 0x1018, 1)]),
            )
            .unwrap();
        (session, source, provider)
    }

    #[test]
    fn bind_defaults_to_the_same_provider_name() {
        let (mut session, source, provider) = linked_pair();
        session.bind(source, "extfn", provider, None).unwrap();
        // extfn at file address 0x1018, provider delta 0x404000
        assert_eq!(session.object(source).bindings["extfn"], 0x40_5018);
    }

    #[test]
    fn bind_resolves_an_explicit_provider_name() {
        let (mut session, source, provider) = linked_pair();
        session
            .bind(source, "extfn", provider, Some("localfn"))
            .unwrap();
        assert_eq!(session.object(source).bindings["extfn"], 0x40_5010);
    }

    #[test]
    fn bind_ignores_names_that_are_not_undefined() {
        let (mut session, source, provider) = linked_pair();
        session.bind(source, "localfn", provider, None).unwrap();
        assert!(session.object(source).bindings.is_empty());
    }

    #[test]
    fn bind_reports_a_missing_provider_symbol() {
        let (mut session, source, provider) = linked_pair();
        match session.bind(source, "extfn", provider, Some("missing")) {
            Err(LinkerError::SymbolNotFound { object, symbol }) => {
                assert_eq!(object, "provider.so");
                assert_eq!(symbol, "missing");
            }
            other => panic!("expected SymbolNotFound, got {:?}", other),
        }
    }

    #[test]
    fn bind_all_counts_successes_and_tolerates_misses() {
        let (mut session, source, provider) = linked_pair();
        // The source itself does not define extfn, so nothing binds.
        assert_eq!(session.bind_all(source, source), 0);
        assert_eq!(session.bind_all(source, provider), 1);
        assert_eq!(session.object(source).bindings["extfn"], 0x40_5018);
    }

    #[test]
    fn second_entry_section_is_rejected() {
        let mut session = Session::new(Environment::default());
        session.entry_section().unwrap();
        match session.entry_section() {
            Err(LinkerError::EntrySectionExists) => {}
            other => panic!("expected EntrySectionExists, got {:?}", other),
        }
    }

    #[test]
    fn entry_requires_an_entry_section() {
        let mut session = Session::new(Environment::default());
        let result = session.entry("test", ObjectId(0), "main", EntryOverrides::default());
        match result {
            Err(LinkerError::NoEntrySection) => {}
            other => panic!("expected NoEntrySection, got {:?}", other),
        }
    }

    #[test]
    fn finish_writes_image_and_loader() {
        let outdir = test_outdir("finish");
        let mut env = Environment::default();
        env.set_org(0x84_0000);
        env.outdir = outdir.clone();
        env.result = "demo".to_string();
        env.url_base = "output".to_string();

        let mut session = Session::new(env);
        session.entry_section().unwrap();
        session.raw_section(RawSection::new(0x40_0000, vec![0u8; 32]));
        session.raw_section(RawSection::new(0x41_0000, vec![1, 2, 3]));
        session.finish().unwrap();

        let image_bytes = fs::read(outdir.join("system.cmi")).unwrap();
        let (_, image) = MemoryImage::deserialize(&image_bytes).unwrap();
        assert_eq!(image.blocks.len(), 3);
        // Ascending base order: the two raw sections, then the entry
        // section at 0x840000.
        assert_eq!(
            image.blocks[0],
            ImageBlock::ZeroFill {
                start: 0x40_0000,
                length: 32
            }
        );
        assert_eq!(
            image.blocks[1],
            ImageBlock::Raw {
                start: 0x41_0000,
                data: vec![1, 2, 3]
            }
        );
        assert_eq!(image.blocks[2].start(), 0x84_0000);

        let loader = fs::read_to_string(outdir.join("demo.js")).unwrap();
        assert!(loader.contains("class CalderaDemo {"));

        fs::remove_dir_all(outdir).unwrap();
    }

    #[test]
    fn suppressed_loader_is_not_written() {
        let outdir = test_outdir("suppress");
        let mut env = Environment::default();
        env.outdir = outdir.clone();
        env.result = "quiet".to_string();
        env.suppress_loader = true;

        let mut session = Session::new(env);
        session.raw_section(RawSection::new(0x1000, vec![9]));
        session.finish().unwrap();

        assert!(outdir.join("system.cmi").exists());
        assert!(!outdir.join("quiet.js").exists());

        fs::remove_dir_all(outdir).unwrap();
    }
}
