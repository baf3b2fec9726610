//! Relocation-overflow resolver (§4.6): detects PC-relative relocations
//! whose target falls outside `[-2^31, 2^31-1]` and synthesizes a GOT/PLT
//! pair so the relocation can be rewritten to a reachable stub.

pub mod arch;
pub mod overflow;

pub use overflow::{
    build_got_plt, find_overflows, fits_pc32, rewrite_site, validate, GotPltTable,
    OverflowCandidate, RelocKind, RelocationSite,
};
