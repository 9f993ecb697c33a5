//! Decoder classification properties over a large sampled word space.

use rand::{Rng, SeedableRng, rngs::StdRng};
use vigil_core::decoder::{
    AARCH64_SIGNATURE_B, AARCH64_SIGNATURE_BR, AARCH64_SIGNATURE_BRK, SHIFT_B, SHIFT_BR,
    SHIFT_BRK, SignatureKind, classify, is_branch, is_indirect_branch, is_trap,
};

/// Classification is exactly the advertised bit condition, for each class.
#[test]
fn classification_matches_bit_conditions_on_random_words() {
    let mut rng = StdRng::seed_from_u64(0xdec0de);
    for _ in 0..200_000 {
        let word: u32 = rng.random();
        assert_eq!(is_branch(word), word >> SHIFT_B == AARCH64_SIGNATURE_B);
        assert_eq!(is_trap(word), word >> SHIFT_BRK == AARCH64_SIGNATURE_BRK);
        assert_eq!(
            is_indirect_branch(word),
            word >> SHIFT_BR == AARCH64_SIGNATURE_BR
        );
    }
}

/// The three signatures never overlap: words built from each signature with
/// arbitrary low bits classify as exactly that signature.
#[test]
fn signatures_never_overlap() {
    let mut rng = StdRng::seed_from_u64(0xbeef);
    for _ in 0..50_000 {
        let low: u32 = rng.random();

        let branch = (AARCH64_SIGNATURE_B << SHIFT_B) | (low & ((1 << SHIFT_B) - 1));
        assert_eq!(classify(branch), SignatureKind::Branch);

        let trap = (AARCH64_SIGNATURE_BRK << SHIFT_BRK) | (low & ((1 << SHIFT_BRK) - 1));
        assert_eq!(classify(trap), SignatureKind::Trap);

        let indirect = (AARCH64_SIGNATURE_BR << SHIFT_BR) | (low & ((1 << SHIFT_BR) - 1));
        assert_eq!(classify(indirect), SignatureKind::IndirectBranch);
    }
}

/// Every word lands in exactly one class.
#[test]
fn classification_is_total_and_single_valued() {
    let mut rng = StdRng::seed_from_u64(7);
    for _ in 0..200_000 {
        let word: u32 = rng.random();
        let hits = usize::from(is_branch(word))
            + usize::from(is_trap(word))
            + usize::from(is_indirect_branch(word));
        match classify(word) {
            SignatureKind::Other => assert_eq!(hits, 0, "word {word:#010x}"),
            _ => assert_eq!(hits, 1, "word {word:#010x}"),
        }
    }
}

/// Real assembled encodings classify as expected.
#[test]
fn known_encodings() {
    // b #0 / b #-4
    assert_eq!(classify(0x1400_0000), SignatureKind::Branch);
    assert_eq!(classify(0x17ff_ffff), SignatureKind::Branch);
    // brk #0 / brk #0x1337
    assert_eq!(classify(0xd420_0000), SignatureKind::Trap);
    assert_eq!(classify(0xd420_266e), SignatureKind::Trap);
    // br x0 / br x16 / br x17
    assert_eq!(classify(0xd61f_0000), SignatureKind::IndirectBranch);
    assert_eq!(classify(0xd61f_0200), SignatureKind::IndirectBranch);
    assert_eq!(classify(0xd61f_0220), SignatureKind::IndirectBranch);
    // blr x0 is NOT br: different opcode field
    assert_eq!(classify(0xd63f_0000), SignatureKind::Other);
    // nop / ret
    assert_eq!(classify(0xd503_201f), SignatureKind::Other);
    assert_eq!(classify(0xd65f_03c0), SignatureKind::Other);
}
