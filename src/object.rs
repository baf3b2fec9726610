//! Minimal relocatable-object representation (§3, §6 "Object cache file").
//!
//! The actual object format is emitted by the C frontend, an external
//! collaborator (§1); this module only defines the shape the driver needs
//! to drive the two-phase relocation algorithm described in §9 "Deferred
//! relocation" — collect candidate sites, synthesize GOT/PLT, install final
//! addresses — without caring how the frontend laid out its sections on
//! disk.

use crate::relocation::RelocKind;

/// Which region of the compiled image a symbol or relocation site lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SectionKind {
    Code,
    Data,
}

/// A symbol as defined by the frontend, before relocation.
#[derive(Debug, Clone)]
pub struct ObjectSymbol {
    pub name: String,
    pub section: SectionKind,
    pub offset: usize,
}

/// A pending relocation, expressed in section-relative terms — the driver
/// converts `offset` to an absolute address once the section is placed in
/// the JIT arena (§4.4).
#[derive(Debug, Clone)]
pub struct PendingRelocation {
    pub section: SectionKind,
    pub offset: usize,
    pub kind: RelocKind,
    pub symbol: String,
    pub addend: i64,
}

/// What the frontend hands back after a successful `compile()`: raw code
/// and data bytes, the symbols it defines, and the relocations it could not
/// resolve itself.
#[derive(Debug, Clone, Default)]
pub struct CompiledImage {
    pub code: Vec<u8>,
    pub data: Vec<u8>,
    pub symbols: Vec<ObjectSymbol>,
    pub relocations: Vec<PendingRelocation>,
}

impl CompiledImage {
    pub fn is_empty(&self) -> bool {
        self.code.is_empty() && self.data.is_empty() && self.symbols.is_empty()
    }

    pub fn defined_symbol(&self, name: &str) -> Option<&ObjectSymbol> {
        self.symbols.iter().find(|s| s.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_image_is_empty_with_zero_overflows() {
        let image = CompiledImage::default();
        assert!(image.is_empty());
        assert!(image.relocations.is_empty());
    }
}
