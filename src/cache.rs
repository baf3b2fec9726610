//! Object cache and import API (§4.7).
//!
//! `import(path)` dispatches on extension: a `.c` source is checked against
//! its sibling `<stem>.<machine>.o` cache by mtime equality (plus a
//! header-newer-than-cache check) before falling back to a full compile;
//! anything else is treated as an already-compiled object and loaded
//! directly.

use crate::driver::CompilerInstance;
use crate::error::import_not_found;
use crate::frontend::{Frontend, OutputMode};
use crate::platform::{probe, Cpu};
use crate::Result;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

/// Filename tag encoding the target CPU, so cross-arch cache files never
/// collide (§3 "Object cache entry" invariant (a)).
pub fn machine_tag(cpu: Cpu) -> &'static str {
    match cpu {
        Cpu::X86_64 => "x86_64",
        Cpu::Aarch64 => "aarch64",
        Cpu::Other => "unknown",
    }
}

/// `<stem>.<machine>.o` next to `source` (§4.7).
pub fn cache_path_for(source: &Path, machine: &str) -> PathBuf {
    let stem = source
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("out");
    source.with_file_name(format!("{stem}.{machine}.o"))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Freshness {
    Fresh,
    Stale,
}

/// Applies the freshness oracle from §4.7: equal mtimes, and no sibling
/// header newer than the cache.
fn check_freshness(source: &Path, cache: &Path) -> Result<Freshness> {
    let source_mtime = fs::metadata(source)?.modified()?;
    let cache_mtime = fs::metadata(cache)?.modified()?;
    if source_mtime != cache_mtime {
        return Ok(Freshness::Stale);
    }
    if let Some(dir) = source.parent() {
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let path = entry.path();
            let is_header = path.extension().and_then(|e| e.to_str()) == Some("h");
            if !is_header {
                continue;
            }
            let header_mtime = fs::metadata(&path)?.modified()?;
            if header_mtime > cache_mtime {
                return Ok(Freshness::Stale);
            }
        }
    }
    Ok(Freshness::Fresh)
}

/// Stamps `cache`'s mtime to exactly `source_mtime` — the freshness oracle
/// relies on equality, not `>=` (§4.7, §9 "Cache freshness via mtime
/// equality").
fn stamp_cache_mtime(cache: &Path, source_mtime: SystemTime) -> Result<()> {
    let file = fs::OpenOptions::new().write(true).open(cache)?;
    let times = fs::FileTimes::new().set_modified(source_mtime);
    file.set_times(times)?;
    Ok(())
}

/// State machine of an imported module handle (§4.7 "State machine of a
/// handle").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleState {
    LoadedFromCache,
    Compiled,
    Destroyed,
}

/// Opaque reference to a relocated compiler instance, whether built from
/// source or loaded as a pre-compiled object (§3 "Import handle").
pub struct ModuleHandle<F: Frontend> {
    instance: Option<CompilerInstance<F>>,
    state: HandleState,
}

impl<F: Frontend> ModuleHandle<F> {
    fn new(instance: CompilerInstance<F>, state: HandleState) -> Self {
        ModuleHandle {
            instance: Some(instance),
            state,
        }
    }

    pub fn state(&self) -> HandleState {
        self.state
    }

    /// `sym(handle, name)` (§4.7): queries the underlying instance's symbol
    /// table.
    pub fn sym(&self, name: &str) -> Result<usize> {
        let instance = self
            .instance
            .as_ref()
            .ok_or_else(|| import_not_found("module already freed"))?;
        instance.lookup(name)
    }

    /// `free(handle)` (§4.7): destroys the instance, releasing its code
    /// pages, GOT/PLT, and any trampolines bound only to this module.
    pub fn free(mut self) {
        self.instance = None;
        self.state = HandleState::Destroyed;
    }
}

/// `import(path)` (§4.7): the decision tree is exactly the one enumerated
/// in the specification's import/cache layer.
pub fn import<F: Frontend>(path: &str) -> Result<ModuleHandle<F>> {
    let source = Path::new(path);
    let ext = source.extension().and_then(|e| e.to_str()).unwrap_or("");

    if ext != "c" {
        if !source.exists() {
            return Err(import_not_found(format!(
                "object '{path}' does not exist"
            )));
        }
        return load_from_path::<F>(source, HandleState::LoadedFromCache);
    }

    let platform = probe();
    let cache = cache_path_for(source, machine_tag(platform.cpu));
    let source_exists = source.exists();
    let cache_exists = cache.exists();

    if source_exists && cache_exists && check_freshness(source, &cache)? == Freshness::Fresh {
        return load_from_path::<F>(&cache, HandleState::LoadedFromCache);
    }

    if source_exists {
        let mut build = CompilerInstance::<F>::create(OutputMode::Object);
        build.add_source_file(source);
        build.compile()?;
        build.relocate()?;
        build.write_output(&cache)?;
        let source_mtime = fs::metadata(source)?.modified()?;
        stamp_cache_mtime(&cache, source_mtime)?;
        drop(build);
        return load_from_path::<F>(&cache, HandleState::Compiled);
    }

    if cache_exists {
        return load_from_path::<F>(&cache, HandleState::LoadedFromCache);
    }

    Err(import_not_found(format!(
        "neither source nor cache exists for '{path}'"
    )))
}

fn load_from_path<F: Frontend>(path: &Path, state: HandleState) -> Result<ModuleHandle<F>> {
    let mut instance = CompilerInstance::<F>::create(OutputMode::Memory);
    instance.add_source_file(path);
    instance.compile()?;
    instance.relocate()?;
    Ok(ModuleHandle::new(instance, state))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frontend::TestFrontend;
    use std::io::Write;

    #[test]
    fn cache_path_encodes_machine_tag() {
        let source = Path::new("/tmp/a.c");
        let cache = cache_path_for(source, "x86_64");
        assert_eq!(cache, Path::new("/tmp/a.x86_64.o"));
    }

    #[test]
    fn missing_source_and_cache_fails_with_import_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nope.c").to_string_lossy().into_owned();
        let result: Result<ModuleHandle<TestFrontend>> = import(&path);
        assert!(result.is_err());
    }

    #[test]
    fn fresh_cache_is_loaded_without_touching_source_compile_path() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("a.c");
        fs::write(&source, "int main(){return 0;}").unwrap();
        let platform = probe();
        let cache = cache_path_for(&source, machine_tag(platform.cpu));
        {
            let mut f = fs::File::create(&cache).unwrap();
            f.write_all(b"fake-object").unwrap();
        }
        let source_mtime = fs::metadata(&source).unwrap().modified().unwrap();
        stamp_cache_mtime(&cache, source_mtime).unwrap();

        let handle: ModuleHandle<TestFrontend> = import(source.to_str().unwrap()).unwrap();
        assert_eq!(handle.state(), HandleState::LoadedFromCache);
    }

    #[test]
    fn stale_cache_triggers_recompile_and_matching_mtimes() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("a.c");
        fs::write(&source, "int main(){return 0;}").unwrap();
        let platform = probe();
        let cache = cache_path_for(&source, machine_tag(platform.cpu));
        fs::write(&cache, b"stale-object").unwrap();
        // Leave the cache mtime untouched so it mismatches the source.

        let handle: ModuleHandle<TestFrontend> = import(source.to_str().unwrap()).unwrap();
        assert_eq!(handle.state(), HandleState::Compiled);

        let source_mtime = fs::metadata(&source).unwrap().modified().unwrap();
        let cache_mtime = fs::metadata(&cache).unwrap().modified().unwrap();
        assert_eq!(source_mtime, cache_mtime);
    }
}
