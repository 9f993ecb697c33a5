//! Constant encryption.
//!
//! Rewrites literal integer operands into runtime-computed values: each
//! literal is replaced by `masked XOR key` where `masked = key XOR literal`
//! and both halves are drawn fresh per site, so the original value never
//! appears in the instruction stream. Private integer globals reached
//! through operands get the same treatment applied to their stored form:
//! the initializer is masked in place and every load/store site carries the
//! unmasking XOR, keeping memory permanently in the masked domain.
//!
//! Two optional hardening steps: synthesized XORs can be handed to an
//! external substituter for further disguise, and literal-to-global
//! promotion hoists surviving literals into private globals while spilling
//! binary-operation results through memory.
//!
//! The whole body repeats `times` per function, and the probability gate is
//! re-rolled per instruction per pass, so layers stack independently.

use crate::eligibility::{AnnotationOracle, Oracle};
use crate::{Transform, XorSubstituter};
use rand::{Rng, rngs::StdRng};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use tracing::{debug, info};
use vigil_core::ir::{
    BinOp, BlockId, Callee, ConstInt, FuncId, Function, GlobalId, GlobalVariable, Initializer,
    InstId, Linkage, Module, Op, Terminator, Ty, Value,
};
use vigil_utils::errors::{ConfigError, TransformError};

const TRANSFORM_NAME: &str = "constenc";

/// Configuration for [`ConstantEncryption`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConstantEncryptionConfig {
    /// Probability (percent) that any one instruction is considered per
    /// pass. Values above 100 are rejected outright.
    pub probability: u32,
    /// How many times the whole transformation repeats per function.
    pub times: u32,
    /// Hand synthesized XORs to the registered substituter.
    pub substitute_xor: bool,
    /// Promote surviving literals to globals and spill binary results
    /// through memory.
    pub const_to_global: bool,
}

impl Default for ConstantEncryptionConfig {
    fn default() -> Self {
        Self {
            probability: 50,
            times: 1,
            substitute_xor: false,
            const_to_global: false,
        }
    }
}

impl ConstantEncryptionConfig {
    /// Fails loudly on out-of-range settings; nothing is clamped.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.probability > 100 {
            return Err(ConfigError::ProbabilityOutOfRange(self.probability));
        }
        if self.times == 0 {
            return Err(ConfigError::ZeroPassCount);
        }
        Ok(())
    }
}

/// The constant encryption engine.
pub struct ConstantEncryption {
    config: ConstantEncryptionConfig,
    oracle: Box<dyn Oracle>,
    substituter: Option<Box<dyn XorSubstituter>>,
}

impl fmt::Debug for ConstantEncryption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConstantEncryption")
            .field("config", &self.config)
            .field("substituter", &self.substituter.is_some())
            .finish_non_exhaustive()
    }
}

/// One visit target: a placed instruction or a block's terminator.
enum Slot {
    Inst(BlockId, InstId),
    Term(BlockId),
}

impl ConstantEncryption {
    pub fn new(config: ConstantEncryptionConfig) -> Self {
        Self {
            config,
            oracle: Box::new(AnnotationOracle::default()),
            substituter: None,
        }
    }

    pub fn with_oracle(mut self, oracle: Box<dyn Oracle>) -> Self {
        self.oracle = oracle;
        self
    }

    pub fn with_substituter(mut self, substituter: Box<dyn XorSubstituter>) -> Self {
        self.substituter = Some(substituter);
        self
    }

    /// Structural eligibility plus the per-instruction probability roll.
    fn gate(&self, module: &Module, f: FuncId, slot: &Slot, rng: &mut StdRng) -> bool {
        if let Slot::Inst(_, inst) = slot {
            let op = module.func(f).op(*inst);
            if op.is_gep() || op.is_phi() || op.is_atomic() {
                return false;
            }
            if let Op::Call { callee: Callee::Func(id), .. } = op {
                if module.func(*id).intrinsic {
                    return false;
                }
            }
        }
        rng.random_range(0..100u32) < self.config.probability
    }

    fn maybe_substitute(
        &self,
        func: &mut Function,
        bb: BlockId,
        xor: InstId,
        rng: &mut StdRng,
    ) {
        if !self.config.substitute_xor {
            return;
        }
        match &self.substituter {
            Some(sub) => sub.substitute(func, bb, xor, rng),
            None => debug!("substitute_xor set but no substituter registered"),
        }
    }

    /// Replaces the `idx`-th operand of `inst` with a freshly inserted
    /// `masked XOR key`. Unsupported widths are left untouched.
    fn encrypt_inst_operand(
        &self,
        module: &mut Module,
        f: FuncId,
        bb: BlockId,
        inst: InstId,
        idx: usize,
        ci: ConstInt,
        rng: &mut StdRng,
    ) -> bool {
        let Some((key, masked)) = pair_key(ci, rng) else {
            return false;
        };
        let func = module.func_mut(f);
        let pos = func
            .position_in_block(bb, inst)
            .expect("gated instruction is placed in its block");
        let xor = func.insert_at(bb, pos, Op::Bin {
            op: BinOp::Xor,
            ty: ci.ty(),
            lhs: Value::Const(masked),
            rhs: Value::Const(key),
        });
        func.set_operand(inst, idx, xor);
        let Value::Inst(xor_id) = xor else { unreachable!() };
        self.maybe_substitute(module.func_mut(f), bb, xor_id, rng);
        true
    }

    /// Same derivation for a constant feeding a terminator; the XOR lands at
    /// the end of the block and the new value is returned for the caller to
    /// wire into the terminator.
    fn synth_xor_at_end(
        &self,
        module: &mut Module,
        f: FuncId,
        bb: BlockId,
        ci: ConstInt,
        rng: &mut StdRng,
    ) -> Option<Value> {
        let (key, masked) = pair_key(ci, rng)?;
        let func = module.func_mut(f);
        let xor = func.append(bb, Op::Bin {
            op: BinOp::Xor,
            ty: ci.ty(),
            lhs: Value::Const(masked),
            rhs: Value::Const(key),
        });
        let Value::Inst(xor_id) = xor else { unreachable!() };
        self.maybe_substitute(module.func_mut(f), bb, xor_id, rng);
        Some(xor)
    }

    /// Masks the stored form of a private integer global and patches every
    /// load/store site module-wide so consumers keep seeing the logical
    /// value. Encrypting an already-encrypted global simply stacks another
    /// layer; the involution keeps each layer transparent.
    fn encrypt_global(&self, module: &mut Module, g: GlobalId, rng: &mut StdRng) -> bool {
        let Some(Initializer::Int(ci)) = module.global(g).init else {
            return false;
        };
        let Some((key, masked)) = pair_key(ci, rng) else {
            return false;
        };
        module.global_mut(g).init = Some(Initializer::Int(masked));
        debug!("masked stored form of `{}`", module.global_name(g));

        for fid in module.func_ids() {
            if module.func(fid).is_declaration() {
                continue;
            }
            // Sites first, rewrites second: the rewrites shift positions.
            let mut loads: Vec<(BlockId, InstId, Ty)> = Vec::new();
            let mut stores: Vec<(BlockId, InstId)> = Vec::new();
            {
                let func = module.func(fid);
                for bb in func.block_ids() {
                    for &inst in &func.block(bb).insts {
                        match func.op(inst) {
                            Op::Load { ptr, ty, .. }
                                if func.strip_pointer_casts(*ptr) == Value::Global(g) =>
                            {
                                loads.push((bb, inst, *ty));
                            }
                            Op::Store { ptr, .. }
                                if func.strip_pointer_casts(*ptr) == Value::Global(g) =>
                            {
                                stores.push((bb, inst));
                            }
                            _ => {}
                        }
                    }
                }
            }
            for (bb, inst, ty) in loads {
                let func = module.func_mut(fid);
                let pos = func
                    .position_in_block(bb, inst)
                    .expect("collected load is placed in its block");
                let xor = func.insert_at(bb, pos + 1, Op::Bin {
                    op: BinOp::Xor,
                    ty,
                    lhs: Value::Inst(inst),
                    rhs: Value::Const(key),
                });
                let Value::Inst(xor_id) = xor else { unreachable!() };
                func.replace_uses(Value::Inst(inst), xor, &[xor_id]);
                self.maybe_substitute(module.func_mut(fid), bb, xor_id, rng);
            }
            for (bb, inst) in stores {
                let func = module.func_mut(fid);
                let pos = func
                    .position_in_block(bb, inst)
                    .expect("collected store is placed in its block");
                let stored = func.operand(inst, 0).expect("store has a value operand");
                let xor = func.insert_at(bb, pos, Op::Bin {
                    op: BinOp::Xor,
                    ty: key.ty(),
                    lhs: stored,
                    rhs: Value::Const(key),
                });
                func.set_operand(inst, 0, xor);
                let Value::Inst(xor_id) = xor else { unreachable!() };
                self.maybe_substitute(module.func_mut(fid), bb, xor_id, rng);
            }
        }
        true
    }

    /// One full sweep over a function: literal operands, global
    /// initializers, then the optional promotion/spill step. Only
    /// instructions that existed when the sweep started are visited;
    /// instructions synthesized here are picked up by the next pass.
    fn run_pass(
        &self,
        module: &mut Module,
        f: FuncId,
        rng: &mut StdRng,
        spilled: &mut HashSet<(FuncId, InstId)>,
    ) -> bool {
        let mut changed = false;

        for slot in collect_slots(module.func(f)) {
            if !self.gate(module, f, &slot, rng) {
                continue;
            }
            match slot {
                Slot::Inst(bb, inst) => {
                    for idx in 0..module.func(f).operand_count(inst) {
                        let v = module
                            .func(f)
                            .operand(inst, idx)
                            .expect("index below operand_count");
                        if let Value::Const(ci) = v {
                            changed |=
                                self.encrypt_inst_operand(module, f, bb, inst, idx, ci, rng);
                        }
                        if let Value::Global(g) = module.func(f).strip_pointer_casts(v) {
                            if private_int_global(module, g) {
                                changed |= self.encrypt_global(module, g, rng);
                            }
                        }
                    }
                }
                Slot::Term(bb) => {
                    changed |= self.encrypt_terminator(module, f, bb, rng);
                }
            }
        }

        if self.config.const_to_global {
            changed |= self.promote_and_spill(module, f, rng, spilled);
        }
        changed
    }

    /// Terminator value operands. A multi-way branch contributes only its
    /// discriminant; case values are part of the terminator itself and stay.
    fn encrypt_terminator(
        &self,
        module: &mut Module,
        f: FuncId,
        bb: BlockId,
        rng: &mut StdRng,
    ) -> bool {
        let mut changed = false;
        let term = module.func(f).block(bb).term.clone();
        let rewritten = match term {
            Terminator::CondBr {
                cond,
                then_dest,
                else_dest,
            } => self
                .encrypt_term_value(module, f, bb, cond, rng, &mut changed)
                .map(|cond| Terminator::CondBr {
                    cond,
                    then_dest,
                    else_dest,
                }),
            Terminator::Switch {
                disc,
                default,
                cases,
            } => self
                .encrypt_term_value(module, f, bb, disc, rng, &mut changed)
                .map(|disc| Terminator::Switch {
                    disc,
                    default,
                    cases,
                }),
            Terminator::Ret { value: Some(v) } => self
                .encrypt_term_value(module, f, bb, v, rng, &mut changed)
                .map(|v| Terminator::Ret { value: Some(v) }),
            _ => None,
        };
        if let Some(term) = rewritten {
            module.func_mut(f).set_terminator(bb, term);
            changed = true;
        }
        changed
    }

    fn encrypt_term_value(
        &self,
        module: &mut Module,
        f: FuncId,
        bb: BlockId,
        v: Value,
        rng: &mut StdRng,
        changed: &mut bool,
    ) -> Option<Value> {
        if let Value::Const(ci) = v {
            return self.synth_xor_at_end(module, f, bb, ci, rng);
        }
        if let Value::Global(g) = module.func(f).strip_pointer_casts(v) {
            if private_int_global(module, g) {
                *changed |= self.encrypt_global(module, g, rng);
            }
        }
        None
    }

    /// Literal-to-global promotion plus binary-result spilling.
    fn promote_and_spill(
        &self,
        module: &mut Module,
        f: FuncId,
        rng: &mut StdRng,
        spilled: &mut HashSet<(FuncId, InstId)>,
    ) -> bool {
        let mut changed = false;
        let mut swept: Vec<(BlockId, InstId)> = Vec::new();

        for slot in collect_slots(module.func(f)) {
            if !self.gate(module, f, &slot, rng) {
                continue;
            }
            match slot {
                Slot::Inst(bb, inst) => {
                    for idx in 0..module.func(f).operand_count(inst) {
                        let v = module
                            .func(f)
                            .operand(inst, idx)
                            .expect("index below operand_count");
                        let Value::Const(ci) = v else { continue };
                        let g = promote_literal(module, ci);
                        let func = module.func_mut(f);
                        let pos = func
                            .position_in_block(bb, inst)
                            .expect("gated instruction is placed in its block");
                        let load = func.insert_at(bb, pos, Op::Load {
                            ty: ci.ty(),
                            ptr: Value::Global(g),
                            atomic: false,
                        });
                        func.set_operand(inst, idx, load);
                        changed = true;
                    }
                    swept.push((bb, inst));
                }
                Slot::Term(bb) => {
                    changed |= self.promote_terminator_literals(module, f, bb);
                }
            }
        }

        for (bb, inst) in swept {
            if spilled.contains(&(f, inst)) {
                continue;
            }
            let width = match module.func(f).op(inst) {
                Op::Bin { ty: Ty::Int(w), .. } => *w,
                _ => continue,
            };
            if !matches!(width, 8 | 16 | 32 | 64) {
                continue;
            }
            let dummy = ConstInt::new(width, random_bits(rng, width));
            let name = module.fresh_global_name("spill");
            let g = module.add_global(name, GlobalVariable {
                linkage: Linkage::Private,
                is_constant: false,
                section: None,
                init: Some(Initializer::Int(dummy)),
                retained: false,
            });
            let func = module.func_mut(f);
            let pos = func
                .position_in_block(bb, inst)
                .expect("swept instruction is placed in its block");
            let store = func.insert_at(bb, pos + 1, Op::Store {
                value: Value::Inst(inst),
                ptr: Value::Global(g),
                atomic: false,
            });
            let reload = func.insert_at(bb, pos + 2, Op::Load {
                ty: Ty::Int(width),
                ptr: Value::Global(g),
                atomic: false,
            });
            let Value::Inst(store_id) = store else { unreachable!() };
            func.replace_uses(Value::Inst(inst), reload, &[store_id]);
            spilled.insert((f, inst));
            changed = true;
            debug!("spilled binary result through `{}`", module.global_name(g));
        }
        changed
    }

    fn promote_terminator_literals(&self, module: &mut Module, f: FuncId, bb: BlockId) -> bool {
        let term = module.func(f).block(bb).term.clone();
        let promote = |module: &mut Module, ci: ConstInt| {
            let g = promote_literal(module, ci);
            module.func_mut(f).append(bb, Op::Load {
                ty: ci.ty(),
                ptr: Value::Global(g),
                atomic: false,
            })
        };
        let rewritten = match term {
            Terminator::CondBr {
                cond: Value::Const(ci),
                then_dest,
                else_dest,
            } => Some(Terminator::CondBr {
                cond: promote(module, ci),
                then_dest,
                else_dest,
            }),
            Terminator::Switch {
                disc: Value::Const(ci),
                default,
                cases,
            } => Some(Terminator::Switch {
                disc: promote(module, ci),
                default,
                cases,
            }),
            Terminator::Ret {
                value: Some(Value::Const(ci)),
            } => Some(Terminator::Ret {
                value: Some(promote(module, ci)),
            }),
            _ => None,
        };
        match rewritten {
            Some(term) => {
                module.func_mut(f).set_terminator(bb, term);
                true
            }
            None => false,
        }
    }
}

impl Transform for ConstantEncryption {
    fn name(&self) -> &'static str {
        "ConstantEncryption"
    }

    fn apply(&self, module: &mut Module, rng: &mut StdRng) -> Result<bool, TransformError> {
        self.config.validate()?;

        // Spill guard, scoped to this engine invocation: a binary operator
        // is forced through memory at most once no matter how many passes
        // run.
        let mut spilled: HashSet<(FuncId, InstId)> = HashSet::new();
        let mut changed = false;

        let eligible: Vec<FuncId> = module
            .func_ids()
            .filter(|&f| self.oracle.should_transform(module.func(f), TRANSFORM_NAME))
            .collect();

        for f in eligible {
            info!("running constant encryption on `{}`", module.func(f).name);
            for _ in 0..self.config.times {
                changed |= self.run_pass(module, f, rng, &mut spilled);
            }
        }
        Ok(changed)
    }
}

fn collect_slots(func: &Function) -> Vec<Slot> {
    let mut out = Vec::new();
    for bb in func.block_ids() {
        for &inst in &func.block(bb).insts {
            out.push(Slot::Inst(bb, inst));
        }
        out.push(Slot::Term(bb));
    }
    out
}

/// Private or internal, with a plain integer initializer.
fn private_int_global(module: &Module, g: GlobalId) -> bool {
    let gv = module.global(g);
    matches!(gv.linkage, Linkage::Private | Linkage::Internal)
        && matches!(gv.init, Some(Initializer::Int(_)))
}

/// Draws a key of matching width and returns `(key, key XOR value)`.
/// Unsupported widths yield `None` and the caller leaves the site alone.
fn pair_key(ci: ConstInt, rng: &mut StdRng) -> Option<(ConstInt, ConstInt)> {
    let key = match ci.width() {
        1 | 8 => u64::from(rng.random::<u8>()),
        16 => u64::from(rng.random::<u16>()),
        32 => u64::from(rng.random::<u32>()),
        64 => rng.random::<u64>(),
        _ => return None,
    };
    let key = ConstInt::new(ci.width(), key);
    Some((key, ci.xor(key.bits())))
}

fn random_bits(rng: &mut StdRng, width: u32) -> u64 {
    match width {
        8 => u64::from(rng.random::<u8>()),
        16 => u64::from(rng.random::<u16>()),
        32 => u64::from(rng.random::<u32>()),
        _ => rng.random::<u64>(),
    }
}

/// Hoists a literal into a fresh private retained global.
fn promote_literal(module: &mut Module, ci: ConstInt) -> GlobalId {
    let name = module.fresh_global_name("promoted_const");
    module.add_global(name, GlobalVariable {
        linkage: Linkage::Private,
        is_constant: false,
        section: None,
        init: Some(Initializer::Int(ci)),
        retained: true,
    })
}
