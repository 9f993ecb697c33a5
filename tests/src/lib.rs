//! Integration tests for the vigil workspace.
//!
//! Covers the engines end to end: instrumentation shape and semantic
//! transparency through the reference evaluator, the constant-encryption
//! involution and probability bounds, and the full pipeline with both
//! engines enabled.

#[cfg(test)]
mod core;

#[cfg(test)]
pub(crate) mod util {
    use vigil_core::Triple;
    use vigil_core::ir::{BinOp, FuncId, Function, Module, Op, Terminator, Ty, Value};

    pub(crate) fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_test_writer()
            .try_init();
    }

    pub(crate) fn darwin_arm64() -> Triple {
        "aarch64-apple-darwin".parse().unwrap()
    }

    /// `f(x) = x * 7 + 3` - one argument, two literals, one block.
    pub(crate) fn affine_fn(module: &mut Module) -> FuncId {
        let mut f = Function::define("affine", vec![Ty::Int(32)], Ty::Int(32));
        let entry = f.entry();
        let scaled = f.append(entry, Op::Bin {
            op: BinOp::Mul,
            ty: Ty::Int(32),
            lhs: Value::Arg(0),
            rhs: Value::const_int(32, 7),
        });
        let shifted = f.append(entry, Op::Bin {
            op: BinOp::Add,
            ty: Ty::Int(32),
            lhs: scaled,
            rhs: Value::const_int(32, 3),
        });
        f.set_terminator(entry, Terminator::Ret { value: Some(shifted) });
        module.add_function(f)
    }
}
