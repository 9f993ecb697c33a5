//! Structural well-formedness checks.
//!
//! These are engine-contract checks, not input validation: a failure here
//! means a transform produced a malformed representation, which should
//! surface during development rather than in the code generator.

use vigil_core::Module;
use vigil_core::ir::{BlockId, FuncId, Function, Initializer, InstId, Op, Terminator, Value};
use vigil_utils::errors::VerifyError;

/// Verifies every defined function plus the global table.
pub fn verify_module(module: &Module) -> Result<(), VerifyError> {
    for f in module.func_ids() {
        if !module.func(f).is_declaration() {
            verify_function(module, f)?;
        }
    }
    verify_globals(module)
}

/// Verifies one function: block references resolve, every placed
/// instruction is placed exactly once, operands resolve, and the entry
/// block carries no phis.
pub fn verify_function(module: &Module, f: FuncId) -> Result<(), VerifyError> {
    let func = module.func(f);
    let name = || func.name.clone();

    let mut seen = vec![false; func.insts.len()];
    for bb in func.block_ids() {
        for &inst in &func.block(bb).insts {
            if inst.0 >= func.insts.len() {
                return Err(VerifyError::BadValueRef {
                    function: name(),
                    inst: inst.0,
                });
            }
            if seen[inst.0] {
                return Err(VerifyError::DuplicateInst {
                    function: name(),
                    inst: inst.0,
                });
            }
            seen[inst.0] = true;
            verify_operands(module, func, inst)?;
        }
        verify_terminator(func, bb)?;
    }

    if func
        .block(func.entry())
        .insts
        .iter()
        .any(|&id| func.op(id).is_phi())
    {
        return Err(VerifyError::PhiInEntry { function: name() });
    }
    Ok(())
}

fn verify_operands(module: &Module, func: &Function, inst: InstId) -> Result<(), VerifyError> {
    let bad = |f: &Function| VerifyError::BadValueRef {
        function: f.name.clone(),
        inst: inst.0,
    };
    for idx in 0..func.operand_count(inst) {
        let v = func.operand(inst, idx).ok_or_else(|| bad(func))?;
        match v {
            Value::Inst(id) if id.0 >= func.insts.len() => return Err(bad(func)),
            Value::Arg(i) if i as usize >= func.params.len() => return Err(bad(func)),
            Value::Global(g) if g.0 >= module.globals.len() => return Err(bad(func)),
            Value::Func(f) if f.0 >= module.functions.len() => return Err(bad(func)),
            _ => {}
        }
    }
    if let Op::Phi { incoming, .. } = func.op(inst) {
        for (_, pred) in incoming {
            check_block(func, *pred)?;
        }
    }
    Ok(())
}

fn verify_terminator(func: &Function, bb: BlockId) -> Result<(), VerifyError> {
    match &func.block(bb).term {
        Terminator::Br { dest } => check_block(func, *dest),
        Terminator::CondBr {
            then_dest,
            else_dest,
            ..
        } => {
            check_block(func, *then_dest)?;
            check_block(func, *else_dest)
        }
        Terminator::Switch {
            default, cases, ..
        } => {
            check_block(func, *default)?;
            for (_, dest) in cases {
                check_block(func, *dest)?;
            }
            Ok(())
        }
        Terminator::Ret { .. } | Terminator::Unreachable => Ok(()),
    }
}

fn check_block(func: &Function, bb: BlockId) -> Result<(), VerifyError> {
    if bb.0 >= func.blocks.len() {
        return Err(VerifyError::BadBlockRef {
            function: func.name.clone(),
            block: bb.0,
        });
    }
    Ok(())
}

/// Verifies that global initializers reference only existing globals and
/// functions.
pub fn verify_globals(module: &Module) -> Result<(), VerifyError> {
    fn walk(module: &Module, global: &str, init: &Initializer) -> Result<(), VerifyError> {
        let bad = || VerifyError::BadInitializer {
            global: global.to_owned(),
        };
        match init {
            Initializer::Func(f) if f.0 >= module.functions.len() => Err(bad()),
            Initializer::Global(g) if g.0 >= module.globals.len() => Err(bad()),
            Initializer::Struct(fields) | Initializer::Array(fields) => {
                for field in fields {
                    walk(module, global, field)?;
                }
                Ok(())
            }
            Initializer::Cast(inner) | Initializer::PtrAuth { inner, .. } => {
                walk(module, global, inner)
            }
            _ => Ok(()),
        }
    }
    for g in module.global_ids() {
        if let Some(init) = &module.global(g).init {
            walk(module, module.global_name(g), init)?;
        }
    }
    Ok(())
}
