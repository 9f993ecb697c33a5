//! AArch64 instruction-signature decoder.
//!
//! The inline-hook detector needs to recognize exactly three ways an attacker
//! can overwrite a function prologue: an unconditional branch to a detour, a
//! breakpoint/supervisor trap, and a register-indirect branch. Each has a
//! fixed bit pattern in the top bits of the 32-bit instruction word, so
//! classification is three independent shift-and-compare checks. The same
//! constants are used when emitting the runtime detection sequence, which
//! performs the identical comparisons on the function's own code bytes.
//!
//! Only AArch64 is decoded. On other instruction-set families the detection
//! step is skipped entirely.

// Arm A64 Instruction Set for A-profile architecture 2022-12, page 56.
pub const AARCH64_SIGNATURE_B: u32 = 0b000101;
// Page 79.
pub const AARCH64_SIGNATURE_BRK: u32 = 0b11010100001;
// Page 75.
pub const AARCH64_SIGNATURE_BR: u32 = 0b1101011000011111000000;

/// Shift that exposes the 6-bit `B` signature field.
pub const SHIFT_B: u32 = 26;
/// Shift that exposes the 11-bit `BRK` signature field.
pub const SHIFT_BRK: u32 = 21;
/// Shift that exposes the 22-bit `BR` signature field.
pub const SHIFT_BR: u32 = 10;

/// Classification of a 32-bit instruction word.
///
/// The three signature patterns occupy bit fields of different widths
/// (6, 11 and 22 bits) with mutually incompatible prefixes, so at most one
/// classification can match any given word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureKind {
    /// `B <imm26>` - unconditional PC-relative branch.
    Branch,
    /// `BRK #<imm16>` - breakpoint / supervisor trap.
    Trap,
    /// `BR <Xn>` - register-indirect branch.
    IndirectBranch,
    /// Anything else.
    Other,
}

/// True iff the word is an unconditional PC-relative branch.
pub const fn is_branch(word: u32) -> bool {
    word >> SHIFT_B == AARCH64_SIGNATURE_B
}

/// True iff the word is a breakpoint instruction.
pub const fn is_trap(word: u32) -> bool {
    word >> SHIFT_BRK == AARCH64_SIGNATURE_BRK
}

/// True iff the word is a register-indirect branch.
pub const fn is_indirect_branch(word: u32) -> bool {
    word >> SHIFT_BR == AARCH64_SIGNATURE_BR
}

/// Classifies a 32-bit instruction word.
pub const fn classify(word: u32) -> SignatureKind {
    if is_branch(word) {
        SignatureKind::Branch
    } else if is_trap(word) {
        SignatureKind::Trap
    } else if is_indirect_branch(word) {
        SignatureKind::IndirectBranch
    } else {
        SignatureKind::Other
    }
}
