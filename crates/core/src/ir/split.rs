//! Block splitting, the control-flow primitive both engines are built on.
//!
//! A split turns one block into a prologue and a continuation at a chosen
//! instruction boundary. The prologue keeps the block's identity (callers
//! and predecessors are untouched) and ends in a single unconditional branch
//! to the continuation; the continuation inherits the instructions from the
//! boundary onward together with the original terminator. At no point does
//! either block lack a terminator.

use super::{BlockId, Function, Terminator};

/// First position in `bb` where new instructions may be inserted: past the
/// leading phi nodes, which must stay at the top of their block.
pub fn first_insertion_point(func: &Function, bb: BlockId) -> usize {
    func.block(bb)
        .insts
        .iter()
        .position(|&id| !func.op(id).is_phi())
        .unwrap_or(func.block(bb).insts.len())
}

/// Splits `bb` at instruction position `at`, returning the continuation
/// block. Instructions `[at..]` and the old terminator move to the
/// continuation; `bb` is re-terminated with a branch to it.
pub fn split_block(func: &mut Function, bb: BlockId, at: usize) -> BlockId {
    let len = func.block(bb).insts.len();
    assert!(at <= len, "split point {at} past end of block `{}`", func.block(bb).name);

    let cont_name = format!("{}.split", func.block(bb).name);
    let cont = func.add_block(cont_name);

    let moved: Vec<_> = func.block_mut(bb).insts.split_off(at);
    let old_term = std::mem::replace(&mut func.block_mut(bb).term, Terminator::Br { dest: cont });
    let cont_block = func.block_mut(cont);
    cont_block.insts = moved;
    cont_block.term = old_term;

    tracing::debug!(
        "split `{}` at {at}: {} instructions moved to `{}`",
        func.block(bb).name,
        func.block(cont).insts.len(),
        func.block(cont).name
    );
    cont
}
