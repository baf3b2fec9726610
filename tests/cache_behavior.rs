//! End-to-end exercise of the import/cache layer (§4.7) against the public
//! API surface, using the in-crate [`TestFrontend`] in place of a real C
//! frontend.

use cjit::cache::{cache_path_for, machine_tag, HandleState, ModuleHandle};
use cjit::frontend::TestFrontend;
use cjit::platform::probe;
use std::fs;
use std::time::Duration;

fn cache_path_for_source(source: &std::path::Path) -> std::path::PathBuf {
    cache_path_for(source, machine_tag(probe().cpu))
}

#[test]
fn first_import_compiles_second_hits_the_cache() {
    let dir = tempfile::tempdir().unwrap();
    let source = dir.path().join("a.c");
    fs::write(&source, "int main(){ printf(\"hi\\n\"); return 0; }").unwrap();
    let path = source.to_str().unwrap();

    let first: ModuleHandle<TestFrontend> = cjit::import(path).unwrap();
    assert_eq!(first.state(), HandleState::Compiled);
    assert!(first.sym("printf").is_ok());
    first.free();

    assert!(cache_path_for_source(&source).exists());

    let second: ModuleHandle<TestFrontend> = cjit::import(path).unwrap();
    assert_eq!(second.state(), HandleState::LoadedFromCache);
    second.free();
}

#[test]
fn header_newer_than_cache_forces_recompile_despite_matching_mtimes() {
    let dir = tempfile::tempdir().unwrap();
    let source = dir.path().join("a.c");
    fs::write(&source, "int main(){ printf(\"hi\\n\"); return 0; }").unwrap();
    let path = source.to_str().unwrap();

    let first: ModuleHandle<TestFrontend> = cjit::import(path).unwrap();
    assert_eq!(first.state(), HandleState::Compiled);
    first.free();

    let cache = cache_path_for_source(&source);
    let cache_mtime_before = fs::metadata(&cache).unwrap().modified().unwrap();
    let source_mtime = fs::metadata(&source).unwrap().modified().unwrap();
    assert_eq!(
        cache_mtime_before, source_mtime,
        "freshness oracle is defined on mtime equality, not monotonic ordering"
    );

    // A header written after the cache, even though the source itself is
    // untouched, must still invalidate the cache (§4.7 header-newer check).
    let header = dir.path().join("a.h");
    let header_mtime = cache_mtime_before + Duration::from_secs(5);
    fs::write(&header, "#define GREETING \"hi\"\n").unwrap();
    let header_file = fs::OpenOptions::new().write(true).open(&header).unwrap();
    header_file
        .set_times(fs::FileTimes::new().set_modified(header_mtime))
        .unwrap();

    let second: ModuleHandle<TestFrontend> = cjit::import(path).unwrap();
    assert_eq!(second.state(), HandleState::Compiled);
    second.free();
}

#[test]
fn precompiled_object_is_loaded_directly_without_a_cache_path() {
    let dir = tempfile::tempdir().unwrap();
    let object = dir.path().join("a.o");
    fs::write(&object, [0x90u8; 8]).unwrap();

    let handle: ModuleHandle<TestFrontend> = cjit::import(object.to_str().unwrap()).unwrap();
    assert_eq!(handle.state(), HandleState::LoadedFromCache);
    handle.free();
}
