//! Reference evaluator for transformed modules.
//!
//! A deterministic, bounded interpreter over the representation, used to
//! check that instrumentation is semantically transparent. Memory is
//! byte-addressable and sparse; globals are materialized from their
//! initializers at fixed addresses, and every function gets a synthetic code
//! address with an optional code image behind it, so emitted sequences that
//! read a function's own instruction words as data observe whatever bytes a
//! test plants there (an unmapped image reads as zeroes, which classifies as
//! a clean prologue).
//!
//! Calls into declarations dispatch to registered external handlers; the
//! Objective-C runtime, `tamper_callback` and friends are simulated that
//! way. `abort` is pre-registered to stop execution, and inline-asm callees
//! always stop it, so a test can observe "the tamper response fired" as an
//! error value.

use std::collections::HashMap;
use vigil_core::Module;
use vigil_core::ir::{
    BinOp, BlockId, Callee, FuncId, Function, GlobalId, Initializer, InstId, Op, Pred, Terminator,
    Ty, Value,
};
use vigil_utils::errors::EvalError;

const GLOBAL_BASE: u64 = 0x1000_0000;
const GLOBAL_STRIDE: u64 = 0x1000;
const FUNC_BASE: u64 = 0x4000_0000;
const FUNC_STRIDE: u64 = 0x1000;

/// Sparse byte-addressable memory. Unmapped bytes read as zero.
#[derive(Debug, Default)]
pub struct Machine {
    mem: HashMap<u64, u8>,
}

impl Machine {
    /// Little-endian read of up to 8 bytes.
    pub fn read(&self, addr: u64, bytes: usize) -> u64 {
        let mut out = 0u64;
        for i in 0..bytes.min(8) {
            let byte = self.mem.get(&addr.wrapping_add(i as u64)).copied().unwrap_or(0);
            out |= u64::from(byte) << (8 * i);
        }
        out
    }

    /// Little-endian write of up to 8 bytes.
    pub fn write(&mut self, addr: u64, bytes: usize, value: u64) {
        for i in 0..bytes.min(8) {
            self.mem
                .insert(addr.wrapping_add(i as u64), (value >> (8 * i)) as u8);
        }
    }

    pub fn write_bytes(&mut self, addr: u64, bytes: &[u8]) {
        for (i, &b) in bytes.iter().enumerate() {
            self.mem.insert(addr.wrapping_add(i as u64), b);
        }
    }

    /// Reads a NUL-terminated string, for simulated runtime calls that take
    /// name pointers.
    pub fn read_cstr(&self, addr: u64) -> String {
        let mut out = Vec::new();
        let mut cur = addr;
        while let Some(&b) = self.mem.get(&cur) {
            if b == 0 {
                break;
            }
            out.push(b);
            cur = cur.wrapping_add(1);
        }
        String::from_utf8_lossy(&out).into_owned()
    }
}

/// Handler for a call into a body-less declaration.
pub type ExternalFn = Box<dyn FnMut(&mut Machine, &[u64]) -> Result<u64, EvalError>>;

/// The evaluator. One instance is tied to one module snapshot; globals are
/// materialized at construction time.
pub struct Evaluator<'m> {
    module: &'m Module,
    pub machine: Machine,
    externals: HashMap<String, ExternalFn>,
    step_limit: usize,
}

impl std::fmt::Debug for Evaluator<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Evaluator")
            .field("module", &self.module.name)
            .field("externals", &self.externals.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl<'m> Evaluator<'m> {
    pub fn new(module: &'m Module) -> Self {
        let mut machine = Machine::default();
        for g in module.global_ids() {
            if let Some(init) = &module.global(g).init {
                materialize(&mut machine, Self::global_address(g), init);
            }
        }

        let mut externals: HashMap<String, ExternalFn> = HashMap::new();
        externals.insert("abort".to_owned(), Box::new(|_, _| Err(EvalError::Aborted)));

        Self {
            module,
            machine,
            externals,
            step_limit: 1 << 20,
        }
    }

    /// Address a global is materialized at.
    pub fn global_address(g: GlobalId) -> u64 {
        GLOBAL_BASE + g.0 as u64 * GLOBAL_STRIDE
    }

    /// Synthetic code address of a function.
    pub fn function_address(f: FuncId) -> u64 {
        FUNC_BASE + f.0 as u64 * FUNC_STRIDE
    }

    /// Plants instruction words at a function's code address, as the bytes a
    /// self-read will observe.
    pub fn set_code_image(&mut self, f: FuncId, words: &[u32]) {
        let base = Self::function_address(f);
        for (i, word) in words.iter().enumerate() {
            self.machine.write_bytes(base + 4 * i as u64, &word.to_le_bytes());
        }
    }

    /// Registers a handler for calls into the named declaration.
    pub fn register_external(&mut self, name: impl Into<String>, f: ExternalFn) {
        self.externals.insert(name.into(), f);
    }

    /// Runs a defined function to completion.
    pub fn run(&mut self, f: FuncId, args: &[u64]) -> Result<Option<u64>, EvalError> {
        let mut steps = self.step_limit;
        self.invoke(f, args, &mut steps)
    }

    fn invoke(
        &mut self,
        f: FuncId,
        args: &[u64],
        steps: &mut usize,
    ) -> Result<Option<u64>, EvalError> {
        if self.module.func(f).is_declaration() {
            let name = self.module.func(f).name.clone();
            let Some(handler) = self.externals.get_mut(&name) else {
                return Err(EvalError::UnknownExternal(name));
            };
            return handler(&mut self.machine, args).map(Some);
        }
        self.interpret(f, args, steps)
    }

    fn interpret(
        &mut self,
        f: FuncId,
        args: &[u64],
        steps: &mut usize,
    ) -> Result<Option<u64>, EvalError> {
        let module = self.module;
        let func = module.func(f);
        let mut frame: HashMap<InstId, u64> = HashMap::new();
        let mut prev: Option<BlockId> = None;
        let mut cur = func.entry();

        loop {
            for idx in 0..func.block(cur).insts.len() {
                let inst = func.block(cur).insts[idx];
                if *steps == 0 {
                    return Err(EvalError::StepLimit(self.step_limit));
                }
                *steps -= 1;
                self.step(func, inst, prev, args, &mut frame, steps)?;
            }

            if *steps == 0 {
                return Err(EvalError::StepLimit(self.step_limit));
            }
            *steps -= 1;
            match &func.block(cur).term {
                Terminator::Br { dest } => {
                    prev = Some(cur);
                    cur = *dest;
                }
                Terminator::CondBr {
                    cond,
                    then_dest,
                    else_dest,
                } => {
                    let taken = if self.value(func, &frame, *cond, args) != 0 {
                        *then_dest
                    } else {
                        *else_dest
                    };
                    prev = Some(cur);
                    cur = taken;
                }
                Terminator::Switch {
                    disc,
                    default,
                    cases,
                } => {
                    let d = self.value(func, &frame, *disc, args);
                    let taken = cases
                        .iter()
                        .find(|(case, _)| *case == d)
                        .map_or(*default, |(_, dest)| *dest);
                    prev = Some(cur);
                    cur = taken;
                }
                Terminator::Ret { value } => {
                    return Ok(value.map(|v| self.value(func, &frame, v, args)));
                }
                Terminator::Unreachable => return Err(EvalError::UnreachableReached),
            }
        }
    }

    fn step(
        &mut self,
        func: &Function,
        inst: InstId,
        prev: Option<BlockId>,
        args: &[u64],
        frame: &mut HashMap<InstId, u64>,
        steps: &mut usize,
    ) -> Result<(), EvalError> {
        match func.op(inst) {
            Op::Load { ty, ptr, .. } => {
                let addr = self.value(func, frame, *ptr, args);
                let v = self.machine.read(addr, ty.byte_size().max(1));
                frame.insert(inst, v);
            }
            Op::Store { value, ptr, .. } => {
                let v = self.value(func, frame, *value, args);
                let addr = self.value(func, frame, *ptr, args);
                let bytes = func.value_ty(*value).byte_size().max(1);
                self.machine.write(addr, bytes, v);
            }
            Op::Bin { op, ty, lhs, rhs } => {
                let width = match ty {
                    Ty::Int(w) => *w,
                    _ => 64,
                };
                let a = self.value(func, frame, *lhs, args);
                let b = self.value(func, frame, *rhs, args);
                let raw = match op {
                    BinOp::Add => a.wrapping_add(b),
                    BinOp::Sub => a.wrapping_sub(b),
                    BinOp::Mul => a.wrapping_mul(b),
                    BinOp::And => a & b,
                    BinOp::Or => a | b,
                    BinOp::Xor => a ^ b,
                    BinOp::Shl => {
                        if b >= 64 {
                            0
                        } else {
                            a.wrapping_shl(b as u32)
                        }
                    }
                    BinOp::LShr => {
                        if b >= 64 {
                            0
                        } else {
                            a.wrapping_shr(b as u32)
                        }
                    }
                };
                frame.insert(inst, raw & vigil_core::ir::ConstInt::mask(width));
            }
            Op::ICmp { pred, lhs, rhs } => {
                let a = self.value(func, frame, *lhs, args);
                let b = self.value(func, frame, *rhs, args);
                let r = match pred {
                    Pred::Eq => a == b,
                    Pred::Ne => a != b,
                    Pred::Ult => a < b,
                    Pred::Ugt => a > b,
                };
                frame.insert(inst, u64::from(r));
            }
            Op::Call { callee, args: call_args, ret } => {
                let mut vals = Vec::with_capacity(call_args.len());
                for a in call_args {
                    vals.push(self.value(func, frame, *a, args));
                }
                let result = match callee {
                    Callee::Func(id) => self.invoke(*id, &vals, steps)?,
                    Callee::Value(v) => {
                        let addr = self.value(func, frame, *v, args);
                        let target = self.function_at(addr).ok_or(EvalError::BadIndirectCall(addr))?;
                        self.invoke(target, &vals, steps)?
                    }
                    Callee::Asm(asm) => return Err(EvalError::Trapped(asm.clone())),
                };
                if !matches!(ret, Ty::Void) {
                    frame.insert(inst, result.unwrap_or(0));
                }
            }
            Op::Gep { base, offset } => {
                let b = self.value(func, frame, *base, args);
                let o = self.value(func, frame, *offset, args);
                frame.insert(inst, b.wrapping_add(o));
            }
            Op::Phi { incoming, .. } => {
                let prev = prev.ok_or(EvalError::PhiMismatch)?;
                let v = incoming
                    .iter()
                    .find(|(_, pred)| *pred == prev)
                    .map(|(v, _)| self.value(func, frame, *v, args))
                    .ok_or(EvalError::PhiMismatch)?;
                frame.insert(inst, v);
            }
            Op::PtrToInt { ty, value } => {
                let width = match ty {
                    Ty::Int(w) => *w,
                    _ => 64,
                };
                let v = self.value(func, frame, *value, args);
                frame.insert(inst, v & vigil_core::ir::ConstInt::mask(width));
            }
            Op::IntToPtr { value } | Op::PtrCast { value } => {
                let v = self.value(func, frame, *value, args);
                frame.insert(inst, v);
            }
        }
        Ok(())
    }

    fn value(&self, func: &Function, frame: &HashMap<InstId, u64>, v: Value, args: &[u64]) -> u64 {
        match v {
            Value::Const(c) => c.bits(),
            Value::Global(g) => Self::global_address(g),
            Value::Func(f) => Self::function_address(f),
            Value::Arg(i) => args.get(i as usize).copied().unwrap_or(0),
            Value::Inst(id) => frame
                .get(&id)
                .copied()
                .unwrap_or_else(|| panic!("use of uncomputed value %{} in `{}`", id.0, func.name)),
        }
    }

    fn function_at(&self, addr: u64) -> Option<FuncId> {
        if addr < FUNC_BASE {
            return None;
        }
        let offset = addr - FUNC_BASE;
        if offset % FUNC_STRIDE != 0 {
            return None;
        }
        let idx = (offset / FUNC_STRIDE) as usize;
        (idx < self.module.functions.len()).then_some(FuncId(idx))
    }
}

/// Writes an initializer's bytes into memory, returning the laid-out size.
/// Aggregates are laid out sequentially; the evaluator does not model
/// padding, and nothing emitted by the engines depends on it.
fn materialize(machine: &mut Machine, addr: u64, init: &Initializer) -> u64 {
    match init {
        Initializer::Int(ci) => {
            let bytes = (ci.width() as usize).div_ceil(8).max(1);
            machine.write(addr, bytes, ci.bits());
            bytes as u64
        }
        Initializer::CString(s) => {
            machine.write_bytes(addr, s.as_bytes());
            machine.write(addr + s.len() as u64, 1, 0);
            s.len() as u64 + 1
        }
        Initializer::Func(f) => {
            machine.write(addr, 8, Evaluator::function_address(*f));
            8
        }
        Initializer::Global(g) => {
            machine.write(addr, 8, Evaluator::global_address(*g));
            8
        }
        Initializer::Struct(fields) | Initializer::Array(fields) => {
            let mut off = 0;
            for field in fields {
                off += materialize(machine, addr + off, field);
            }
            off
        }
        Initializer::Cast(inner) | Initializer::PtrAuth { inner, .. } => {
            materialize(machine, addr, inner)
        }
    }
}
