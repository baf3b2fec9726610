//! End-to-end exercises of the public API that a real embedder would drive:
//! compile-resolve-lookup through [`cjit::CompilerInstance`], and the
//! GOT/PLT synthesis path a frontend hits whenever a resolved symbol lands
//! outside PC32 range of the call site.

use cjit::driver::CompilerInstance;
use cjit::frontend::{OutputMode, TestFrontend};
use cjit::relocation::{build_got_plt, fits_pc32, find_overflows, rewrite_site, RelocKind, RelocationSite};

#[test]
fn hello_world_compiles_relocates_and_resolves_printf() {
    let mut inst: CompilerInstance<TestFrontend> = CompilerInstance::create(OutputMode::Memory);
    inst.add_source_string("int main(){ printf(\"hi\\n\"); return 0; }");
    inst.compile().unwrap();
    inst.relocate().unwrap();

    let printf_addr = inst.lookup("printf").unwrap();
    assert_ne!(printf_addr, 0);
    // No site in this snippet overflows PC32 relative to its own code page.
    assert!(inst.got_plt().is_none());
}

#[test]
fn compiling_twice_on_the_same_instance_is_rejected() {
    let mut inst: CompilerInstance<TestFrontend> = CompilerInstance::create(OutputMode::Memory);
    inst.compile().unwrap();
    assert!(inst.compile().is_err());
}

#[test]
fn relocating_before_compiling_is_rejected() {
    let mut inst: CompilerInstance<TestFrontend> = CompilerInstance::create(OutputMode::Memory);
    assert!(inst.relocate().is_err());
}

/// A symbol more than 2 GiB away from its call site must round-trip through
/// a synthesized GOT/PLT pair rather than being patched directly — the
/// scenario §4.6 exists for.
#[test]
fn out_of_range_symbol_is_rewritten_through_synthesized_plt() {
    let code_base = 0x1_0000_0000usize;
    let code_end = code_base + 0x20;
    let far_symbol = code_base + i32::MAX as usize + 0x1000;

    let site = RelocationSite {
        offset: code_base + 4,
        kind: RelocKind::Pc32,
        symbol: "far_away".to_string(),
        symbol_addr: far_symbol,
        addend: 0,
    };
    assert!(!fits_pc32(site.symbol_addr, site.addend, site.offset));

    let candidates = find_overflows(std::slice::from_ref(&site));
    assert_eq!(candidates.len(), 1);

    let table = build_got_plt(code_base, code_end, &candidates).unwrap();
    let rewritten = rewrite_site(&site, &table).unwrap();

    assert_ne!(rewritten.symbol_addr, far_symbol);
    assert!(fits_pc32(rewritten.symbol_addr, rewritten.addend, rewritten.offset));
    assert_eq!(table.got[table.index_of("far_away").unwrap()], far_symbol);
}
