use std::fmt::Write;

use convert_case::{Case, Casing};

use crate::entry::EntryPoint;

/// Halt-poll interval of the generated wrapper, in milliseconds.
const POLL_INTERVAL_MS: u32 = 1000;

/// Emits the consumer-side loader: image parsing, CPU reset plumbing and
/// one async wrapper per declared entry point. The emission is a pass
/// over the structured entry list, so output stays byte-deterministic.
#[derive(Debug)]
pub struct LoaderScript<'a> {
    pub result: &'a str,
    pub url_base: &'a str,
    pub bridging_slot: u32,
    pub entries: &'a [EntryPoint],
    pub postconstruct: &'a str,
}

impl LoaderScript<'_> {
    pub fn class_name(&self) -> String {
        format!("Caldera{}", self.result.to_case(Case::Pascal))
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        out.push_str(
            "function parseImage(data) {\n\
             \x20   const dv = new DataView(data.buffer);\n\
             \x20   const image = [];\n\
             \x20   let cursor = 24;\n\
             \x20   while (cursor < dv.byteLength) {\n\
             \x20       const blockType = dv.getUint8(cursor++);\n\
             \x20       const start = dv.getUint32(cursor, true);\n\
             \x20       cursor += 4;\n\
             \x20       const length = dv.getUint32(cursor, true);\n\
             \x20       cursor += 4;\n\
             \x20       if (blockType === 0) {\n\
             \x20           image.push({ start, fill: { value: 0, length } });\n\
             \x20       } else if (blockType === 1) {\n\
             \x20           const block = data.subarray(cursor, cursor + length);\n\
             \x20           cursor += length;\n\
             \x20           image.push({ start, data: block });\n\
             \x20       }\n\
             \x20   }\n\
             \x20   return image;\n\
             }\n\
             \n\
             function applyImage(data, image) {\n\
             \x20   for (const section of image) {\n\
             \x20       if (section.data) data.set(section.data, section.start);\n\
             \x20       else data.subarray(section.start, section.start + section.fill.length).fill(section.fill.value);\n\
             \x20   }\n\
             }\n\n",
        );

        let _ = writeln!(out, "class {} {{", self.class_name());
        out.push_str(
            "    initialRAM = null;\n\
             \x20   emulator = null;\n\
             \x20   _serial = Promise.resolve();\n\
             \n\
             \x20   constructor(emulator) { this.emulator = emulator; }\n\n",
        );

        out.push_str("    async init() {\n");
        let _ = writeln!(
            out,
            "        this.initialRAM = parseImage(new Uint8Array(await (await fetch(\"{}/system.cmi\")).arrayBuffer()));",
            self.url_base
        );
        for line in self.postconstruct.lines() {
            let _ = writeln!(out, "        {}", line);
        }
        out.push_str(
            "        this.reset();\n\
             \x20       this.emulator.run();\n\
             \x20       await this._cpuStop();\n\
             \x20   }\n\
             \n\
             \x20   reset() {\n\
             \x20       applyImage(this.emulator.v86.cpu.mem8, this.initialRAM);\n\
             \x20   }\n\n",
        );

        out.push_str(
            "    _cpuStop() {\n\
             \x20       return new Promise(res => {\n\
             \x20           const interval = setInterval(() => {\n\
             \x20               if (this.emulator.v86.cpu.in_hlt.valueOf()[0] == 1) {\n\
             \x20                   clearInterval(interval);\n\
             \x20                   res();\n\
             \x20               }\n",
        );
        let _ = writeln!(out, "            }}, {});", POLL_INTERVAL_MS);
        out.push_str(
            "        });\n\
             \x20   }\n\
             \n\
             \x20   _enqueue(task) {\n\
             \x20       const run = this._serial.then(task);\n\
             \x20       this._serial = run.then(() => {}, () => {});\n\
             \x20       return run;\n\
             \x20   }\n",
        );

        // One wrapper per entry point. Invocations are funneled through
        // the _serial queue: the bridging slot is shared, so a second
        // call must not touch it until the first has observed halt.
        for entry in self.entries {
            out.push('\n');
            let _ = writeln!(out, "    async {}({}) {{", entry.name, entry.args);
            out.push_str("        return this._enqueue(async () => {\n");
            for line in entry.prologue.lines() {
                let _ = writeln!(out, "            {}", line);
            }
            let _ = writeln!(
                out,
                "            this.emulator.v86.cpu.mem32s[{:#x}] = {:#x};",
                self.bridging_slot / 4,
                entry.stub_address
            );
            out.push_str(
                "            this.emulator.v86.cpu.reset_cpu();\n\
                 \x20           await this._cpuStop();\n",
            );
            for line in entry.epilogue.lines() {
                let _ = writeln!(out, "            {}", line);
            }
            out.push_str("        });\n    }\n");
        }

        out.push_str("}\n");
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::EntryOverrides;

    fn sample_entry(name: &str, stub_address: u32) -> EntryPoint {
        let overrides = EntryOverrides::default();
        EntryPoint {
            name: name.to_string(),
            stub_address,
            args: overrides.args,
            prologue: overrides.prologue,
            epilogue: overrides.epilogue,
        }
    }

    #[test]
    fn class_name_is_derived_from_result_name() {
        let script = LoaderScript {
            result: "mathtest",
            url_base: "output",
            bridging_slot: 0x84_0000,
            entries: &[],
            postconstruct: "",
        };
        assert_eq!(script.class_name(), "CalderaMathtest");
        assert!(script.render().contains("class CalderaMathtest {"));
    }

    #[test]
    fn wrappers_write_the_bridging_slot_and_serialize() {
        let entries = [sample_entry("test", 0x84_0009)];
        let script = LoaderScript {
            result: "mathtest",
            url_base: "output",
            bridging_slot: 0x84_0000,
            entries: &entries,
            postconstruct: "",
        };
        let rendered = script.render();
        assert!(rendered.contains("async test() {"));
        // Slot index is the word address of the bridging slot.
        assert!(rendered.contains("this.emulator.v86.cpu.mem32s[0x210000] = 0x840009;"));
        assert!(rendered.contains("return this._enqueue(async () => {"));
        assert!(rendered.contains("this.emulator.v86.cpu.reset_cpu();"));
        assert!(rendered.contains("return this.emulator.v86.cpu.reg32.valueOf()[0];"));
        // Poll-until-halt interval.
        assert!(rendered.contains("}, 1000);"));
    }

    #[test]
    fn overrides_replace_the_default_epilogue() {
        let mut entry = sample_entry("peek", 0x84_0020);
        entry.args = "address".to_string();
        entry.prologue = "console.log(address);".to_string();
        entry.epilogue = "return this.emulator.v86.cpu.mem8[address];".to_string();
        let entries = [entry];
        let script = LoaderScript {
            result: "demo",
            url_base: "",
            bridging_slot: 0x84_0000,
            entries: &entries,
            postconstruct: "this.extra = 1;",
        };
        let rendered = script.render();
        assert!(rendered.contains("async peek(address) {"));
        assert!(rendered.contains("console.log(address);"));
        assert!(rendered.contains("return this.emulator.v86.cpu.mem8[address];"));
        assert!(!rendered.contains("reg32.valueOf()[0]"));
        assert!(rendered.contains("this.extra = 1;"));
    }
}
