//! Instruction emission and in-place mutation operations.
//!
//! [`Builder`] appends instructions to the end of one block, mirroring how
//! detection sequences are emitted block by block. The `Function` methods
//! here cover the mutations transforms need beyond plain appends: positional
//! insertion before a consuming instruction, terminator replacement, indexed
//! operand access, and def-use rewrites with an exception list.

use super::{BasicBlock, BinOp, BlockId, Callee, Function, InstId, Op, Pred, Terminator, Ty, Value};

impl Function {
    /// Adds `op` to the arena without placing it in a block.
    pub fn add_inst(&mut self, op: Op) -> InstId {
        let id = InstId(self.insts.len());
        self.insts.push(op);
        id
    }

    /// Appends `op` at the end of `bb` (before the terminator).
    pub fn append(&mut self, bb: BlockId, op: Op) -> Value {
        let id = self.add_inst(op);
        self.blocks[bb.0].insts.push(id);
        Value::Inst(id)
    }

    /// Inserts `op` into `bb` at position `index` within the block's
    /// instruction list. Position `len` is equivalent to [`Self::append`].
    pub fn insert_at(&mut self, bb: BlockId, index: usize, op: Op) -> Value {
        assert!(
            index <= self.blocks[bb.0].insts.len(),
            "insertion point {index} past end of block `{}`",
            self.blocks[bb.0].name
        );
        let id = self.add_inst(op);
        self.blocks[bb.0].insts.insert(index, id);
        Value::Inst(id)
    }

    /// Creates a new block with an `unreachable` placeholder terminator.
    pub fn add_block(&mut self, name: impl Into<String>) -> BlockId {
        let id = BlockId(self.blocks.len());
        self.blocks.push(BasicBlock {
            name: name.into(),
            insts: Vec::new(),
            term: Terminator::Unreachable,
        });
        id
    }

    /// Replaces the terminator of `bb`.
    pub fn set_terminator(&mut self, bb: BlockId, term: Terminator) {
        self.blocks[bb.0].term = term;
    }

    /// Index of `inst` within `bb`, if it is placed there.
    pub fn position_in_block(&self, bb: BlockId, inst: InstId) -> Option<usize> {
        self.blocks[bb.0].insts.iter().position(|&i| i == inst)
    }

    /// Number of value operands of an instruction.
    pub fn operand_count(&self, id: InstId) -> usize {
        match &self.insts[id.0] {
            Op::Load { .. } => 1,
            Op::Store { .. } => 2,
            Op::Bin { .. } | Op::ICmp { .. } | Op::Gep { .. } => 2,
            Op::Call { callee, args, .. } => {
                args.len() + usize::from(matches!(callee, Callee::Value(_)))
            }
            Op::Phi { incoming, .. } => incoming.len(),
            Op::PtrToInt { .. } | Op::IntToPtr { .. } | Op::PtrCast { .. } => 1,
        }
    }

    /// The `idx`-th value operand. For calls the arguments come first and a
    /// computed callee, when present, is the last operand.
    pub fn operand(&self, id: InstId, idx: usize) -> Option<Value> {
        match &self.insts[id.0] {
            Op::Load { ptr, .. } => [*ptr].get(idx).copied(),
            Op::Store { value, ptr, .. } => [*value, *ptr].get(idx).copied(),
            Op::Bin { lhs, rhs, .. } | Op::ICmp { lhs, rhs, .. } => [*lhs, *rhs].get(idx).copied(),
            Op::Gep { base, offset } => [*base, *offset].get(idx).copied(),
            Op::Call { callee, args, .. } => {
                if idx < args.len() {
                    Some(args[idx])
                } else if idx == args.len() {
                    match callee {
                        Callee::Value(v) => Some(*v),
                        _ => None,
                    }
                } else {
                    None
                }
            }
            Op::Phi { incoming, .. } => incoming.get(idx).map(|(v, _)| *v),
            Op::PtrToInt { value, .. } | Op::IntToPtr { value } | Op::PtrCast { value } => {
                [*value].get(idx).copied()
            }
        }
    }

    /// Sets the `idx`-th value operand. Panics when `idx` is out of range;
    /// operand indices come from [`Self::operand_count`], so a bad index is
    /// an engine bug.
    pub fn set_operand(&mut self, id: InstId, idx: usize, v: Value) {
        let op = &mut self.insts[id.0];
        match op {
            Op::Load { ptr, .. } => {
                assert_eq!(idx, 0);
                *ptr = v;
            }
            Op::Store { value, ptr, .. } => match idx {
                0 => *value = v,
                1 => *ptr = v,
                _ => panic!("store has two operands"),
            },
            Op::Bin { lhs, rhs, .. } | Op::ICmp { lhs, rhs, .. } => match idx {
                0 => *lhs = v,
                1 => *rhs = v,
                _ => panic!("binary instruction has two operands"),
            },
            Op::Gep { base, offset } => match idx {
                0 => *base = v,
                1 => *offset = v,
                _ => panic!("gep has two operands"),
            },
            Op::Call { callee, args, .. } => {
                if idx < args.len() {
                    args[idx] = v;
                } else if idx == args.len() && matches!(callee, Callee::Value(_)) {
                    *callee = Callee::Value(v);
                } else {
                    panic!("call operand {idx} out of range");
                }
            }
            Op::Phi { incoming, .. } => {
                incoming[idx].0 = v;
            }
            Op::PtrToInt { value, .. } | Op::IntToPtr { value } | Op::PtrCast { value } => {
                assert_eq!(idx, 0);
                *value = v;
            }
        }
    }

    /// Rewrites every use of `from` to `to`, in instruction operands and in
    /// terminator value operands, skipping the instructions in `except`.
    /// The exception list is how a freshly inserted unmasking XOR avoids
    /// consuming its own result.
    pub fn replace_uses(&mut self, from: Value, to: Value, except: &[InstId]) {
        for id in 0..self.insts.len() {
            let id = InstId(id);
            if except.contains(&id) {
                continue;
            }
            for idx in 0..self.operand_count(id) {
                if self.operand(id, idx) == Some(from) {
                    self.set_operand(id, idx, to);
                }
            }
        }
        for block in &mut self.blocks {
            match &mut block.term {
                Terminator::CondBr { cond, .. } => {
                    if *cond == from {
                        *cond = to;
                    }
                }
                Terminator::Switch { disc, .. } => {
                    if *disc == from {
                        *disc = to;
                    }
                }
                Terminator::Ret { value: Some(v) } => {
                    if *v == from {
                        *v = to;
                    }
                }
                _ => {}
            }
        }
    }
}

/// Appends instructions to the end of one block.
#[derive(Debug)]
pub struct Builder<'f> {
    func: &'f mut Function,
    block: BlockId,
}

impl<'f> Builder<'f> {
    pub fn new(func: &'f mut Function, block: BlockId) -> Self {
        Self { func, block }
    }

    pub fn load(&mut self, ty: Ty, ptr: Value) -> Value {
        self.func.append(
            self.block,
            Op::Load {
                ty,
                ptr,
                atomic: false,
            },
        )
    }

    pub fn store(&mut self, value: Value, ptr: Value) -> Value {
        self.func.append(
            self.block,
            Op::Store {
                value,
                ptr,
                atomic: false,
            },
        )
    }

    pub fn bin(&mut self, op: BinOp, ty: Ty, lhs: Value, rhs: Value) -> Value {
        self.func.append(self.block, Op::Bin { op, ty, lhs, rhs })
    }

    pub fn add(&mut self, ty: Ty, lhs: Value, rhs: Value) -> Value {
        self.bin(BinOp::Add, ty, lhs, rhs)
    }

    pub fn xor(&mut self, ty: Ty, lhs: Value, rhs: Value) -> Value {
        self.bin(BinOp::Xor, ty, lhs, rhs)
    }

    pub fn or(&mut self, ty: Ty, lhs: Value, rhs: Value) -> Value {
        self.bin(BinOp::Or, ty, lhs, rhs)
    }

    pub fn lshr(&mut self, ty: Ty, lhs: Value, rhs: Value) -> Value {
        self.bin(BinOp::LShr, ty, lhs, rhs)
    }

    pub fn icmp(&mut self, pred: Pred, lhs: Value, rhs: Value) -> Value {
        self.func.append(self.block, Op::ICmp { pred, lhs, rhs })
    }

    pub fn icmp_eq(&mut self, lhs: Value, rhs: Value) -> Value {
        self.icmp(Pred::Eq, lhs, rhs)
    }

    pub fn call(&mut self, callee: Callee, args: Vec<Value>, ret: Ty) -> Value {
        self.func.append(self.block, Op::Call { callee, args, ret })
    }

    pub fn ptr_to_int(&mut self, ty: Ty, value: Value) -> Value {
        self.func.append(self.block, Op::PtrToInt { ty, value })
    }

    pub fn int_to_ptr(&mut self, value: Value) -> Value {
        self.func.append(self.block, Op::IntToPtr { value })
    }

    pub fn ptr_cast(&mut self, value: Value) -> Value {
        self.func.append(self.block, Op::PtrCast { value })
    }

    pub fn br(self, dest: BlockId) {
        self.func.set_terminator(self.block, Terminator::Br { dest });
    }

    pub fn cond_br(self, cond: Value, then_dest: BlockId, else_dest: BlockId) {
        self.func.set_terminator(
            self.block,
            Terminator::CondBr {
                cond,
                then_dest,
                else_dest,
            },
        );
    }

    pub fn ret(self, value: Option<Value>) {
        self.func.set_terminator(self.block, Terminator::Ret { value });
    }
}
