//! Compilation driver (§4.4): orchestrates a build from a fresh compiler
//! instance through to a relocated, callable image.
//!
//! Implements the two-phase relocation algorithm from §9 "Deferred
//! relocation": the frontend's own single-pass relocator is bypassed —
//! `compile` only produces code/data/symbols/pending relocations; this
//! driver resolves undefined references, synthesizes GOT/PLT for any
//! overflowing site, wraps cross-ABI targets with a trampoline, patches the
//! final displacements into the arena itself, then tells the frontend the
//! resolved addresses so `get_symbol` keeps working for external callers.

use crate::dynload::{self, HostLibrary};
use crate::error::{config_error, jit_alloc_error, symbol_not_found};
use crate::frontend::{Frontend, OutputMode};
use crate::object::SectionKind;
use crate::os::{page_round_up, HostMmap, Mmap, ProtFlags};
use crate::platform::{probe, Platform};
use crate::relocation::{
    build_got_plt, find_overflows, rewrite_site, validate, GotPltTable, RelocationSite,
};
use crate::symtab::{BuiltinTable, RawAddr, ResolutionLayer, SymbolResolver};
use crate::trampoline::{self, TrampolineMint};
use crate::Result;
use hashbrown::HashMap;
use std::path::{Path, PathBuf};
use std::ptr::NonNull;

/// Recognized `set_options` flags (§4.4 "Recognized options").
#[derive(Debug, Clone, Default)]
pub struct Options {
    pub include_paths: Vec<PathBuf>,
    pub library_paths: Vec<PathBuf>,
    pub defines: Vec<(String, Option<String>)>,
    pub undefines: Vec<String>,
    pub output_path: Option<PathBuf>,
    pub mode: Option<OutputMode>,
    pub verbosity: u8,
    pub nostdlib: bool,
    pub nostdinc: bool,
}

impl Options {
    /// Default options always applied unless countermanded (§4.4 "Default
    /// options"): `-nostdlib -nostdinc -D__COSMORUN__` plus the host's OS
    /// macro set.
    pub fn defaults(platform: &Platform) -> Self {
        let mut defines = vec![("__COSMORUN__".to_string(), None)];
        for (name, val) in platform.default_macros() {
            defines.push(((*name).to_string(), Some((*val).to_string())));
        }
        Options {
            nostdlib: true,
            nostdinc: true,
            defines,
            ..Default::default()
        }
    }

    /// Parses and applies one flag, per §4.4's enumerated option list.
    pub fn apply_flag(&mut self, flag: &str) -> Result<()> {
        if let Some(dir) = flag.strip_prefix("-I") {
            self.include_paths.push(PathBuf::from(dir));
        } else if let Some(dir) = flag.strip_prefix("-L") {
            self.library_paths.push(PathBuf::from(dir));
        } else if let Some(def) = flag.strip_prefix("-D") {
            match def.split_once('=') {
                Some((name, val)) => self.defines.push((name.to_string(), Some(val.to_string()))),
                None => self.defines.push((def.to_string(), None)),
            }
        } else if let Some(name) = flag.strip_prefix("-U") {
            self.undefines.push(name.to_string());
        } else if let Some(path) = flag.strip_prefix("-o") {
            self.output_path = Some(PathBuf::from(path));
        } else if flag == "-c" {
            self.mode = Some(OutputMode::Object);
        } else if flag == "-E" {
            self.mode = Some(OutputMode::PreprocessOnly);
        } else if flag == "-vv" {
            self.verbosity = 2;
        } else if flag == "-v" {
            self.verbosity = self.verbosity.max(1);
        } else if flag == "-nostdlib" {
            self.nostdlib = true;
        } else if flag == "-nostdinc" {
            self.nostdinc = true;
        } else {
            return Err(config_error(format!("unrecognized option '{flag}'")));
        }
        Ok(())
    }
}

enum SourceInput {
    File(PathBuf),
    Inline(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Created,
    Compiled,
    Relocated,
}

/// Owns a frontend instance plus everything the driver layered on top of
/// it: options, queued sources, the builtin table, pre-opened host
/// libraries, the process-wide trampoline mint, and (once relocated) the
/// code/data arena and any synthesized GOT/PLT table.
pub struct CompilerInstance<F: Frontend> {
    frontend: F,
    options: Options,
    sources: Vec<SourceInput>,
    builtins: BuiltinTable,
    host_libs: Vec<HostLibrary>,
    mint: TrampolineMint,
    state: State,
    arena: Option<(NonNull<u8>, usize)>,
    code_base: Option<usize>,
    data_base: Option<usize>,
    got_plt: Option<GotPltTable>,
}

impl<F: Frontend> CompilerInstance<F> {
    /// `create(output_mode)` (§4.4): fresh instance with defaults applied.
    pub fn create(mode: OutputMode) -> Self {
        let platform = probe();
        CompilerInstance {
            frontend: F::create(mode),
            options: Options::defaults(&platform),
            sources: Vec::new(),
            builtins: BuiltinTable::new(),
            host_libs: Vec::new(),
            mint: TrampolineMint::new(),
            state: State::Created,
            arena: None,
            code_base: None,
            data_base: None,
            got_plt: None,
        }
    }

    pub fn add_source_file(&mut self, path: impl Into<PathBuf>) {
        self.sources.push(SourceInput::File(path.into()));
    }

    pub fn add_source_string(&mut self, src: impl Into<String>) {
        self.sources.push(SourceInput::Inline(src.into()));
    }

    /// Registers an include path; silently ignored if it does not exist
    /// (§4.4).
    pub fn add_include_path(&mut self, dir: impl AsRef<Path>) {
        let dir = dir.as_ref();
        if dir.is_dir() {
            self.frontend.add_include_path(dir);
            self.options.include_paths.push(dir.to_path_buf());
        }
    }

    /// Registers a library path; silently ignored if it does not exist
    /// (§4.4).
    pub fn add_library_path(&mut self, dir: impl AsRef<Path>) {
        let dir = dir.as_ref();
        if dir.is_dir() {
            self.frontend.add_library_path(dir);
            self.options.library_paths.push(dir.to_path_buf());
        }
    }

    /// Pre-opens a host library for layer-2 symbol resolution (§4.3).
    pub fn add_host_library(&mut self, path: &str) -> Result<()> {
        let lib = dynload::open_host_library(path)?;
        self.host_libs.push(lib);
        Ok(())
    }

    pub fn set_options(&mut self, option_list: &str) -> Result<()> {
        for flag in option_list.split_whitespace() {
            self.options.apply_flag(flag)?;
        }
        Ok(())
    }

    /// `compile(inst)` (§4.4): feeds queued sources to the frontend.
    pub fn compile(&mut self) -> Result<()> {
        if self.state != State::Created {
            return Err(config_error("compile called more than once on the same instance"));
        }
        for source in &self.sources {
            match source {
                SourceInput::File(path) => self.frontend.add_source_file(path)?,
                SourceInput::Inline(src) => self.frontend.add_source_string(src)?,
            }
        }
        self.frontend.compile()?;
        self.state = State::Compiled;
        Ok(())
    }

    /// `relocate(inst)` (§4.4 + §4.6 + §4.5): resolves undefined
    /// references, synthesizes GOT/PLT for overflowing sites, wraps
    /// cross-ABI targets, patches the arena, and installs final addresses.
    pub fn relocate(&mut self) -> Result<()> {
        if self.state != State::Compiled {
            return Err(config_error("relocate called before compile"));
        }
        let platform = probe();
        let image = self.frontend.pending_image().clone();

        let arena_len = page_round_up((image.code.len() + image.data.len()).max(1));
        // SAFETY: arena_len is page-aligned and nonzero.
        let base = unsafe { HostMmap::alloc_rwx(arena_len, ProtFlags::PROT_READ | ProtFlags::PROT_WRITE) }?;
        // SAFETY: base is a freshly allocated, writable region of at least
        // `image.code.len() + image.data.len()` bytes.
        unsafe {
            std::ptr::copy_nonoverlapping(image.code.as_ptr(), base.as_ptr(), image.code.len());
            std::ptr::copy_nonoverlapping(
                image.data.as_ptr(),
                base.as_ptr().add(image.code.len()),
                image.data.len(),
            );
        }
        let code_base = base.as_ptr() as usize;
        let data_base = code_base + image.code.len();
        self.arena = Some((base, arena_len));
        self.code_base = Some(code_base);
        self.data_base = Some(data_base);

        let section_base = |s: SectionKind| match s {
            SectionKind::Code => code_base,
            SectionKind::Data => data_base,
        };

        let local: HashMap<String, RawAddr> = image
            .symbols
            .iter()
            .map(|s| (s.name.clone(), RawAddr(section_base(s.section) + s.offset)))
            .collect();
        for (name, addr) in &local {
            self.frontend.define_symbol(name, addr.0);
        }
        let runtime_search = |name: &str| local.get(name).copied();
        let resolver = SymbolResolver::new(&self.builtins, &self.host_libs, &runtime_search);

        let mut sites = Vec::with_capacity(image.relocations.len());
        for rel in &image.relocations {
            let site_addr = section_base(rel.section) + rel.offset;
            match resolver.resolve(&rel.symbol) {
                Some((raw, layer)) => {
                    // Only a genuine host/DLL entry point (builtin table or a
                    // pre-opened host library) can sit on the other side of an
                    // ABI boundary; a locally-defined symbol is compiled by
                    // the same frontend and must never be routed through the
                    // SysV->Win64 bridge (§4.5).
                    let wrapped = match layer {
                        ResolutionLayer::Builtin | ResolutionLayer::HostLibrary => {
                            trampoline::maybe_wrap_cross_abi(&self.mint, raw.0, platform.os)?
                        }
                        ResolutionLayer::Local => raw.0,
                    };
                    sites.push(RelocationSite {
                        offset: site_addr,
                        kind: rel.kind,
                        symbol: rel.symbol.clone(),
                        symbol_addr: wrapped,
                        addend: rel.addend,
                    });
                }
                None => {
                    let _ = symbol_not_found(format!("undefined symbol '{}'", rel.symbol));
                }
            }
        }

        let candidates = find_overflows(&sites);
        let table = if candidates.is_empty() {
            None
        } else {
            let code_end = code_base + image.code.len();
            let t = build_got_plt(code_base, code_end, &candidates)?;
            validate(&t, code_base, code_end)?;
            Some(t)
        };

        for site in &sites {
            let final_addr = table
                .as_ref()
                .and_then(|t| rewrite_site(site, t))
                .map(|r| r.symbol_addr)
                .unwrap_or(site.symbol_addr);
            patch_disp32(base, code_base, site.offset, final_addr, site.addend);
            self.frontend.define_symbol(&site.symbol, final_addr);
        }
        self.got_plt = table;

        // SAFETY: base/arena_len describe the region just written above.
        unsafe {
            HostMmap::protect(base, image.code.len().max(1), ProtFlags::PROT_READ | ProtFlags::PROT_EXEC)?;
            if !image.data.is_empty() {
                let data_ptr = NonNull::new_unchecked(base.as_ptr().add(image.code.len()));
                HostMmap::protect(data_ptr, image.data.len(), ProtFlags::PROT_READ | ProtFlags::PROT_WRITE)?;
            }
            HostMmap::flush_icache(base, image.code.len());
        }

        self.frontend.relocate()?;
        self.state = State::Relocated;
        Ok(())
    }

    /// `lookup(inst, symbol)` (§4.4): host pointer to a resolved symbol.
    pub fn lookup(&self, name: &str) -> Result<usize> {
        self.frontend
            .get_symbol(name)
            .ok_or_else(|| symbol_not_found(format!("symbol '{name}' not found")))
    }

    pub fn write_output(&self, path: impl AsRef<Path>) -> Result<()> {
        self.frontend.write_output(path.as_ref())
    }

    pub fn got_plt(&self) -> Option<&GotPltTable> {
        self.got_plt.as_ref()
    }
}

/// Patches a 4-byte little-endian PC-relative displacement at `offset`
/// within the arena so the emitted code calls `resolved` directly (or, if
/// `resolved` is a synthesized PLT stub, the stub).
fn patch_disp32(base: NonNull<u8>, code_base: usize, offset: usize, resolved: usize, addend: i64) {
    let site_addr = offset;
    let disp = (resolved as i64 + addend) - site_addr as i64;
    let local_offset = offset - code_base;
    // SAFETY: `local_offset` is within the code region sized at allocation,
    // and the arena is still writable at this point in `relocate`.
    unsafe {
        let ptr = base.as_ptr().add(local_offset);
        std::ptr::copy_nonoverlapping((disp as i32).to_le_bytes().as_ptr(), ptr, 4);
    }
}

impl<F: Frontend> Drop for CompilerInstance<F> {
    fn drop(&mut self) {
        if let Some((ptr, len)) = self.arena.take() {
            // SAFETY: ptr/len describe the arena allocated in `relocate`,
            // owned exclusively by this instance (§5 "Shared-resource
            // policy").
            let _ = unsafe { HostMmap::free(ptr, len) }.map_err(|e| {
                let _ = jit_alloc_error(format!("failed to release JIT arena: {e}"));
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frontend::TestFrontend;

    #[test]
    fn empty_source_relocates_with_zero_overflows() {
        let mut inst: CompilerInstance<TestFrontend> = CompilerInstance::create(OutputMode::Memory);
        inst.compile().unwrap();
        inst.relocate().unwrap();
        assert!(inst.got_plt().is_none());
    }

    #[test]
    fn hello_world_resolves_printf_through_builtin_layer() {
        let mut inst: CompilerInstance<TestFrontend> = CompilerInstance::create(OutputMode::Memory);
        inst.add_source_string("int main(){ printf(\"hi\\n\"); return 0; }");
        inst.compile().unwrap();
        inst.relocate().unwrap();
        let addr = inst.lookup("printf");
        assert!(addr.is_ok());
    }

    #[test]
    fn default_options_set_nostdlib_and_nostdinc() {
        let platform = probe();
        let options = Options::defaults(&platform);
        assert!(options.nostdlib);
        assert!(options.nostdinc);
        assert!(options.defines.iter().any(|(k, _)| k == "__COSMORUN__"));
    }

    #[test]
    fn apply_flag_rejects_unknown_options() {
        let mut options = Options::default();
        assert!(options.apply_flag("-Zbogus").is_err());
    }

    #[test]
    fn apply_flag_parses_define_with_value() {
        let mut options = Options::default();
        options.apply_flag("-DFOO=1").unwrap();
        assert_eq!(options.defines[0], ("FOO".to_string(), Some("1".to_string())));
    }
}
