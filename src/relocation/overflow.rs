//! Overflow detection, GOT/PLT placement, and relocation rewriting (§4.6).

use super::arch;
use crate::error::layout_error;
use crate::os::page_size;
use crate::Result;
use hashbrown::{HashMap, HashSet};

/// Relocation kinds the resolver cares about — both are signed 32-bit
/// PC-relative displacements (§4.6 Trigger).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelocKind {
    Pc32,
    Plt32,
}

/// A relocation record as handed to the resolver: source address `P`,
/// target `S`, addend `A` (§3 "Overflow candidate").
#[derive(Debug, Clone)]
pub struct RelocationSite {
    pub offset: usize,
    pub kind: RelocKind,
    pub symbol: String,
    pub symbol_addr: usize,
    pub addend: i64,
}

/// Returns whether `(S + A) - P` fits the signed 32-bit PC-relative range.
/// Exactly `2^31 - 1` fits; exactly `2^31` (in either direction) does not
/// (§8 Boundary behaviours).
pub fn fits_pc32(symbol_addr: usize, addend: i64, source_addr: usize) -> bool {
    let delta = (symbol_addr as i64 + addend) - source_addr as i64;
    (i32::MIN as i64..=i32::MAX as i64).contains(&delta)
}

/// An out-of-range relocation, recorded for GOT/PLT synthesis (§3).
#[derive(Debug, Clone)]
pub struct OverflowCandidate {
    pub symbol_name: String,
    pub symbol_addr: usize,
    pub reloc_offset: usize,
    pub reloc_kind: RelocKind,
    pub addend: i64,
    pub overflow_amount: i64,
}

/// Scans `sites` and returns the deduplicated set of overflow candidates,
/// one per distinct symbol name (§4.6 Deduplication).
pub fn find_overflows(sites: &[RelocationSite]) -> Vec<OverflowCandidate> {
    let mut seen = HashSet::new();
    let mut candidates = Vec::new();
    for site in sites {
        if fits_pc32(site.symbol_addr, site.addend, site.offset) {
            continue;
        }
        if !seen.insert(site.symbol.clone()) {
            continue;
        }
        let overflow_amount = (site.symbol_addr as i64 + site.addend) - site.offset as i64;
        candidates.push(OverflowCandidate {
            symbol_name: site.symbol.clone(),
            symbol_addr: site.symbol_addr,
            reloc_offset: site.offset,
            reloc_kind: site.kind,
            addend: site.addend,
            overflow_amount,
        });
    }
    candidates
}

/// Synthesized GOT/PLT pair for one compilation (§3 "GOT/PLT table").
pub struct GotPltTable {
    pub got_base: usize,
    pub plt_base: usize,
    names: Vec<String>,
    pub got: Vec<usize>,
    pub plt: Vec<Vec<u8>>,
    index: HashMap<String, usize>,
}

impl GotPltTable {
    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn index_of(&self, symbol: &str) -> Option<usize> {
        self.index.get(symbol).copied()
    }

    pub fn got_entry_addr(&self, idx: usize) -> usize {
        self.got_base + idx * 8
    }

    pub fn plt_entry_addr(&self, idx: usize) -> usize {
        self.plt_base + idx * arch::STUB_SIZE
    }
}

/// Builds the GOT/PLT table for `candidates`, placed on the page boundary
/// immediately after `code_end` (§4.6 Placement).
pub fn build_got_plt(
    code_base: usize,
    code_end: usize,
    candidates: &[OverflowCandidate],
) -> Result<GotPltTable> {
    let page = page_size();
    let got_base = (code_end + page - 1) & !(page - 1);
    // PLT stubs must be 16-byte aligned (§3 "GOT/PLT table" invariant (d));
    // `got_base` is page-aligned but a dense 8-byte-per-entry GOT isn't
    // necessarily a multiple of 16 bytes, so round the span used to place
    // the PLT up to a 16-byte boundary.
    let got_size = (candidates.len() * 8 + 15) & !15;
    let plt_base = got_base + got_size;
    let plt_size = candidates.len() * arch::STUB_SIZE;

    let in_range = fits_pc32(got_base, 0, code_base)
        && fits_pc32(got_base + got_size, 0, code_end)
        && fits_pc32(plt_base, 0, code_base)
        && fits_pc32(plt_base + plt_size, 0, code_end);
    if !in_range {
        return Err(layout_error(
            "GOT/PLT region falls outside PC32 range of the code section",
        ));
    }

    let mut got = Vec::with_capacity(candidates.len());
    let mut plt = Vec::with_capacity(candidates.len());
    let mut index = HashMap::new();
    let mut names = Vec::with_capacity(candidates.len());
    for (i, c) in candidates.iter().enumerate() {
        got.push(c.symbol_addr);
        let got_entry_addr = got_base + i * 8;
        let plt_entry_addr = plt_base + i * arch::STUB_SIZE;
        plt.push(arch::plt_stub(plt_entry_addr, got_entry_addr));
        index.insert(c.symbol_name.clone(), i);
        names.push(c.symbol_name.clone());
    }

    Ok(GotPltTable {
        got_base,
        plt_base,
        names,
        got,
        plt,
        index,
    })
}

/// Walks a constructed table and verifies every stub can reach both the
/// code section and its own GOT entry within PC32 range (§4.6 Validation).
pub fn validate(table: &GotPltTable, code_base: usize, code_end: usize) -> Result<()> {
    for i in 0..table.len() {
        let plt_addr = table.plt_entry_addr(i);
        let got_addr = table.got_entry_addr(i);
        let reaches_code = fits_pc32(plt_addr, 0, code_base) && fits_pc32(plt_addr, 0, code_end);
        if !reaches_code {
            return Err(layout_error(format!(
                "PLT stub {i} is unreachable from the code section"
            )));
        }
        if !fits_pc32(got_addr, 0, plt_addr) {
            return Err(layout_error(format!(
                "PLT stub {i} cannot reach its GOT entry"
            )));
        }
    }
    Ok(())
}

/// Rewrites an overflowing site to target its synthesized PLT stub instead
/// of the original out-of-range symbol address (§4.6 Rewrite).
pub fn rewrite_site(site: &RelocationSite, table: &GotPltTable) -> Option<RelocationSite> {
    let idx = table.index_of(&site.symbol)?;
    Some(RelocationSite {
        offset: site.offset,
        kind: site.kind,
        symbol: site.symbol.clone(),
        symbol_addr: table.plt_entry_addr(idx),
        addend: site.addend,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn site(symbol: &str, symbol_addr: usize, offset: usize) -> RelocationSite {
        RelocationSite {
            offset,
            kind: RelocKind::Pc32,
            symbol: symbol.to_string(),
            symbol_addr,
            addend: 0,
        }
    }

    #[test]
    fn boundary_exactly_i32_max_does_not_overflow() {
        let p = 0x1_0000_0000usize;
        let s = p + i32::MAX as usize;
        assert!(fits_pc32(s, 0, p));
    }

    #[test]
    fn boundary_one_past_i32_max_overflows() {
        let p = 0x1_0000_0000usize;
        let s = p + i32::MAX as usize + 1;
        assert!(!fits_pc32(s, 0, p));
    }

    #[test]
    fn empty_sites_produce_zero_overflows() {
        assert!(find_overflows(&[]).is_empty());
    }

    #[test]
    fn repeated_overflow_to_same_symbol_dedups_to_one_candidate() {
        let far = 0x1_0000_0000usize + i32::MAX as usize + 100;
        let sites = vec![
            site("far_fn", far, 0x1000),
            site("far_fn", far, 0x2000),
        ];
        let candidates = find_overflows(&sites);
        assert_eq!(candidates.len(), 1);
    }

    #[test]
    fn in_range_site_is_not_a_candidate() {
        let sites = vec![site("near_fn", 0x1000, 0x1100)];
        assert!(find_overflows(&sites).is_empty());
    }

    #[test]
    fn built_table_round_trips_symbol_addresses_through_got() {
        let far = 0x1_0000_0000usize + i32::MAX as usize + 100;
        let sites = vec![site("far_fn", far, 0x1000)];
        let candidates = find_overflows(&sites);
        let table = build_got_plt(0x1000, 0x2000, &candidates).unwrap();
        assert_eq!(table.len(), 1);
        let idx = table.index_of("far_fn").unwrap();
        assert_eq!(table.got[idx], far);
        assert!(validate(&table, 0x1000, 0x2000).is_ok());
    }

    #[test]
    fn rewrite_points_at_plt_not_original_target() {
        let far = 0x1_0000_0000usize + i32::MAX as usize + 100;
        let original = site("far_fn", far, 0x1000);
        let candidates = find_overflows(std::slice::from_ref(&original));
        let table = build_got_plt(0x1000, 0x2000, &candidates).unwrap();
        let rewritten = rewrite_site(&original, &table).unwrap();
        assert_ne!(rewritten.symbol_addr, far);
        assert_eq!(rewritten.symbol_addr, table.plt_entry_addr(0));
        assert!(fits_pc32(rewritten.symbol_addr, rewritten.addend, rewritten.offset));
    }
}
