//! IR to MIR lowering.
//!
//! SSA values spread into 8-byte virtual registers (wide values take
//! consecutive registers), addresses of loads and stores inline through
//! `GetElementPointer` where the encoding allows, and phi nodes become
//! copies in their predecessor blocks.

use std::collections::HashMap;

use crate::ir::{
    self, ArithOp, BlockId, Callee, ConvOp, InstKind, Type, TypeId, ValueId, ValueKind,
};
use crate::mir::*;

/// Lower a whole IR module.
pub fn lower_to_mir(ir: ir::Module) -> Module {
    let (data, _) = data_offsets(&ir.constants);
    let mut module = Module { functions: Vec::new(), constants: Vec::new() };
    for function in &ir.functions {
        module.functions.push(lower_function(&ir, function, &data));
    }
    module.constants = ir.constants;
    module
}

/// Base address of the data section inside the VM's address space.
fn data_address(data: &[u64], index: usize) -> u64 {
    scatha_core::program::DATA_BASE + data[index]
}

fn lower_function(ir: &ir::Module, f: &ir::Function, data: &[u64]) -> Function {
    let mut lowerer = FnLower {
        ir,
        f,
        data,
        out: Function::new(&f.name),
        reg_map: HashMap::new(),
        block_map: HashMap::new(),
        inline_geps: HashMap::new(),
        phi_copies: Vec::new(),
        current: 0,
    };
    lowerer.run();
    lowerer.out
}

/// A pending phi resolution: in `pred`, before its terminators, copy
/// `value` into `dest_regs`.
struct PhiCopy {
    pred: BlockId,
    value: ValueId,
    dest_regs: Vec<RegId>,
}

struct FnLower<'a> {
    ir: &'a ir::Module,
    f: &'a ir::Function,
    data: &'a [u64],
    out: Function,
    reg_map: HashMap<ValueId, Vec<RegId>>,
    block_map: HashMap<BlockId, usize>,
    /// GEPs folded into the memory operands of their load/store users.
    inline_geps: HashMap<ValueId, MemoryAddress>,
    phi_copies: Vec<PhiCopy>,
    current: usize,
}

impl FnLower<'_> {
    fn run(&mut self) {
        self.out.ret_words = words_of(&self.ir.ctx, self.f.return_type);

        // Parameter registers: the caller fills the first window slots; we
        // immediately shelter them in virtual registers.
        let mut param_words = 0;
        for &param in &self.f.params {
            param_words += words_of(&self.ir.ctx, self.f.value(param).ty).max(1);
        }
        for _ in 0..param_words.max(self.out.ret_words) {
            self.out.add_register(RegisterKind::Arg);
        }

        for &block in &self.f.block_order {
            let index = self.out.add_block(&self.f.block(block).name);
            self.block_map.insert(block, index);
        }
        self.current = self.block_map[&self.f.entry()];

        let mut arg_cursor = 0;
        for &param in self.f.params.clone().iter() {
            let words = words_of(&self.ir.ctx, self.f.value(param).ty).max(1);
            let regs = self.fresh_regs(words);
            for (w, &reg) in regs.iter().enumerate() {
                let arg = self.out.arg_regs[arg_cursor + w];
                self.push(Inst::new(
                    MirOp::Copy,
                    Some(reg),
                    vec![Value::Reg(arg)],
                    InstData::Width(8),
                ));
            }
            arg_cursor += words;
            self.reg_map.insert(param, regs);
        }

        for &block in &self.f.block_order.clone() {
            self.current = self.block_map[&block];
            for &inst in &self.f.block(block).insts.clone() {
                self.lower_inst(inst);
            }
        }
        self.resolve_phis();
    }

    // ------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------

    fn push(&mut self, inst: Inst) {
        self.out.blocks[self.current].insts.push(inst);
    }

    fn fresh_regs(&mut self, words: usize) -> Vec<RegId> {
        (0..words.max(1))
            .map(|_| self.out.add_register(RegisterKind::Virtual))
            .collect()
    }

    fn words(&self, value: ValueId) -> usize {
        words_of(&self.ir.ctx, self.f.value(value).ty).max(1)
    }

    /// MIR values of an IR value, one per word. Constants stay immediates;
    /// everything else reads its registers.
    fn read(&mut self, value: ValueId) -> Vec<Value> {
        match &self.f.value(value).kind {
            ValueKind::IntConst { value } => vec![Value::Const(*value)],
            ValueKind::FloatConst { bits } => vec![Value::Const(*bits)],
            ValueKind::Undef => vec![Value::Undef; self.words(value)],
            ValueKind::GlobalData { index } => {
                vec![Value::Const(data_address(self.data, *index))]
            }
            _ => {
                let regs = self
                    .reg_map
                    .get(&value)
                    .unwrap_or_else(|| panic!("unlowered value {}", self.f.value(value).name))
                    .clone();
                regs.into_iter().map(Value::Reg).collect()
            }
        }
    }

    /// Single-word read, materializing into a register when a register is
    /// required.
    fn read_reg(&mut self, value: ValueId) -> RegId {
        match self.read(value)[0] {
            Value::Reg(reg) => reg,
            other => self.materialize(other),
        }
    }

    fn materialize(&mut self, value: Value) -> RegId {
        let reg = self.fresh_regs(1)[0];
        self.push(Inst::new(MirOp::Copy, Some(reg), vec![value], InstData::Width(8)));
        reg
    }

    fn block_value(&self, block: BlockId) -> Value {
        Value::Block(self.block_map[&block])
    }

    // ------------------------------------------------------------------
    // Addresses
    // ------------------------------------------------------------------

    /// Is this GEP encodable directly in a 4-byte memory operand, with every
    /// user a load or store?
    fn gep_is_inlineable(&self, gep: ValueId) -> bool {
        let ValueKind::Inst { op: InstKind::GetElementPointer { pointee, members, .. }, .. } =
            &self.f.value(gep).kind
        else {
            return false;
        };
        let scale = self.ir.ctx.size_of(*pointee);
        let offset = member_offset(&self.ir.ctx, *pointee, members);
        if scale > 255 || offset > 200 {
            return false;
        }
        // Every user must be a load or store reaching memory through this
        // address (wide accesses still leave headroom in the u8 offset).
        self.f.users(gep).iter().all(|&user| match &self.f.value(user).kind {
            ValueKind::Inst { op: InstKind::Load { address }, .. } => *address == gep,
            ValueKind::Inst { op: InstKind::Store { address, .. }, .. } => *address == gep,
            _ => false,
        })
    }

    /// Memory operand for an address value, peeking through inlineable GEPs.
    fn compute_address(&mut self, address: ValueId) -> MemoryAddress {
        if let Some(&addr) = self.inline_geps.get(&address) {
            return addr;
        }
        let base = self.read_reg(address);
        MemoryAddress { base, index: None, scale: 0, offset: 0 }
    }

    fn address_plus(&self, addr: MemoryAddress, bytes: u8) -> MemoryAddress {
        MemoryAddress { offset: addr.offset + bytes, ..addr }
    }

    // ------------------------------------------------------------------
    // Instructions
    // ------------------------------------------------------------------

    fn lower_inst(&mut self, inst: ValueId) {
        let ValueKind::Inst { op, .. } = self.f.value(inst).kind.clone() else {
            return;
        };
        match op {
            InstKind::Alloca { allocated, count } => {
                let elem = self.ir.ctx.size_of(allocated).max(1);
                let count = match self.f.value(count).kind {
                    ValueKind::IntConst { value } => value,
                    _ => 1,
                };
                let bytes = (elem * count).div_ceil(8) * 8;
                let dest = self.fresh_regs(1)[0];
                self.push(Inst::new(
                    MirOp::LIncSP,
                    Some(dest),
                    vec![Value::Const(bytes)],
                    InstData::None,
                ));
                self.reg_map.insert(inst, vec![dest]);
            }
            InstKind::Load { address } => {
                let total = self.ir.ctx.size_of(self.f.value(inst).ty).max(1);
                let addr = self.compute_address(address);
                let words = self.words(inst);
                let dest = self.fresh_regs(words);
                let mut remaining = total;
                for (w, &reg) in dest.iter().enumerate() {
                    let width = remaining.min(8) as u8;
                    self.push(Inst::new(
                        MirOp::Load,
                        Some(reg),
                        vec![Value::Addr(self.address_plus(addr, (w * 8) as u8))],
                        InstData::Width(width),
                    ));
                    remaining = remaining.saturating_sub(8);
                }
                self.reg_map.insert(inst, dest);
            }
            InstKind::Store { address, value } => {
                let total = self.ir.ctx.size_of(self.f.value(value).ty).max(1);
                let addr = self.compute_address(address);
                let values = self.read(value);
                let mut remaining = total;
                for (w, part) in values.into_iter().enumerate() {
                    let width = remaining.min(8) as u8;
                    // Stores write from a register.
                    let part = match part {
                        Value::Reg(reg) => reg,
                        Value::Undef => self.materialize(Value::Const(0)),
                        other => self.materialize(other),
                    };
                    self.push(Inst::new(
                        MirOp::Store,
                        None,
                        vec![
                            Value::Addr(self.address_plus(addr, (w * 8) as u8)),
                            Value::Reg(part),
                        ],
                        InstData::Width(width),
                    ));
                    remaining = remaining.saturating_sub(8);
                }
            }
            InstKind::Compare { mode, op, lhs, rhs } => {
                // The first compare operand must be a register.
                let lhs_reg = self.read_reg(lhs);
                let rhs_value = self.read(rhs)[0];
                self.push(Inst::new(
                    MirOp::Compare,
                    None,
                    vec![Value::Reg(lhs_reg), rhs_value],
                    InstData::Compare(mode),
                ));
                let dest = self.fresh_regs(1)[0];
                self.push(Inst::new(
                    MirOp::Set,
                    Some(dest),
                    vec![],
                    InstData::Cond(condition_of(op)),
                ));
                self.reg_map.insert(inst, vec![dest]);
            }
            InstKind::UnaryArith { op, operand } => {
                let ty = self.f.value(inst).ty;
                let mir_op = match (op, self.ir.ctx.ty(ty)) {
                    (ir::UnaryArithOp::Negate, Type::Float { .. }) => MirUnaryOp::FNegate,
                    _ => op.into(),
                };
                let value = self.read(operand)[0];
                let dest = self.fresh_regs(1)[0];
                self.push(Inst::new(
                    MirOp::UnaryArith,
                    Some(dest),
                    vec![value],
                    InstData::Unary(mir_op),
                ));
                self.reg_map.insert(inst, vec![dest]);
            }
            InstKind::Arith { op, lhs, rhs } => {
                let lhs_value = self.read(lhs)[0];
                let rhs_value = self.read(rhs)[0];
                let dest = self.fresh_regs(1)[0];
                self.push(Inst::new(
                    MirOp::Arith,
                    Some(dest),
                    vec![lhs_value, rhs_value],
                    InstData::Arith(arith_of(op)),
                ));
                self.reg_map.insert(inst, vec![dest]);
            }
            InstKind::Conv { op, operand } => match op {
                // Pure re-typings stay in the same registers.
                ConvOp::Zext | ConvOp::Trunc | ConvOp::Bitcast => {
                    let regs = match &self.f.value(operand).kind {
                        ValueKind::IntConst { .. }
                        | ValueKind::FloatConst { .. }
                        | ValueKind::GlobalData { .. }
                        | ValueKind::Undef => vec![self.read_reg(operand)],
                        _ => self.reg_map[&operand].clone(),
                    };
                    self.reg_map.insert(inst, regs);
                }
                _ => {
                    let conv = self.conv_of(op, operand, inst);
                    let value = self.read(operand)[0];
                    let dest = self.fresh_regs(1)[0];
                    self.push(Inst::new(
                        MirOp::Conversion,
                        Some(dest),
                        vec![value],
                        InstData::Conv(conv),
                    ));
                    self.reg_map.insert(inst, vec![dest]);
                }
            },
            InstKind::Call { callee, args } => self.lower_call(inst, callee, &args),
            InstKind::Phi { incoming } => {
                let words = self.words(inst);
                let dest = self.fresh_regs(words);
                for (pred, value) in incoming {
                    self.phi_copies.push(PhiCopy { pred, value, dest_regs: dest.clone() });
                }
                self.reg_map.insert(inst, dest);
            }
            InstKind::GetElementPointer { pointee, base, index, members } => {
                let scale = self.ir.ctx.size_of(pointee).max(1);
                let offset = member_offset(&self.ir.ctx, pointee, &members);
                if self.gep_is_inlineable(inst) {
                    let base_reg = self.read_reg(base);
                    let index_reg = match self.f.value(index).kind {
                        ValueKind::IntConst { value: 0 } => None,
                        _ => Some(self.read_reg(index)),
                    };
                    self.inline_geps.insert(inst, MemoryAddress {
                        base: base_reg,
                        index: index_reg,
                        scale: scale as u8,
                        offset: offset as u8,
                    });
                    return;
                }
                // Materialize: base + index * scale + offset.
                let base_reg = self.read_reg(base);
                let dest = self.fresh_regs(1)[0];
                if scale <= 255 && offset <= 255 {
                    let index_reg = match self.f.value(index).kind {
                        ValueKind::IntConst { value: 0 } => None,
                        _ => Some(self.read_reg(index)),
                    };
                    self.push(Inst::new(
                        MirOp::Lea,
                        Some(dest),
                        vec![Value::Addr(MemoryAddress {
                            base: base_reg,
                            index: index_reg,
                            scale: scale as u8,
                            offset: offset as u8,
                        })],
                        InstData::None,
                    ));
                } else {
                    let index_value = self.read(index)[0];
                    let scaled = self.fresh_regs(1)[0];
                    self.push(Inst::new(
                        MirOp::Copy,
                        Some(scaled),
                        vec![index_value],
                        InstData::Width(8),
                    ));
                    self.push(Inst::new(
                        MirOp::Arith,
                        Some(scaled),
                        vec![Value::Reg(scaled), Value::Const(scale)],
                        InstData::Arith(MirArithOp::Mul),
                    ));
                    self.push(Inst::new(
                        MirOp::Arith,
                        Some(scaled),
                        vec![Value::Reg(scaled), Value::Const(offset)],
                        InstData::Arith(MirArithOp::Add),
                    ));
                    self.push(Inst::new(
                        MirOp::Arith,
                        Some(dest),
                        vec![Value::Reg(base_reg), Value::Reg(scaled)],
                        InstData::Arith(MirArithOp::Add),
                    ));
                }
                self.reg_map.insert(inst, vec![dest]);
            }
            InstKind::ExtractValue { aggregate, indices } => {
                self.lower_extract(inst, aggregate, &indices);
            }
            InstKind::InsertValue { aggregate, value, indices } => {
                self.lower_insert(inst, aggregate, value, &indices);
            }
            InstKind::Select { cond, then_value, else_value } => {
                let then_v = self.read(then_value)[0];
                let dest = self.fresh_regs(1)[0];
                self.push(Inst::new(MirOp::Copy, Some(dest), vec![then_v], InstData::Width(8)));
                let cond_reg = self.read_reg(cond);
                self.push(Inst::new(
                    MirOp::Test,
                    None,
                    vec![Value::Reg(cond_reg)],
                    InstData::Compare(ir::CompareMode::Unsigned),
                ));
                let else_v = self.read(else_value)[0];
                self.push(Inst::new(
                    MirOp::CondCopy,
                    Some(dest),
                    vec![else_v],
                    InstData::Cond(Condition::Equal),
                ));
                self.reg_map.insert(inst, vec![dest]);
            }
            InstKind::Goto { target } => {
                let target = self.block_value(target);
                self.push(Inst::new(MirOp::Jump, None, vec![target], InstData::None));
            }
            InstKind::Branch { cond, then_block, else_block } => {
                let cond_reg = self.read_reg(cond);
                self.push(Inst::new(
                    MirOp::Test,
                    None,
                    vec![Value::Reg(cond_reg)],
                    InstData::Compare(ir::CompareMode::Unsigned),
                ));
                let then_target = self.block_value(then_block);
                self.push(Inst::new(
                    MirOp::CJump,
                    None,
                    vec![then_target],
                    InstData::Cond(Condition::NotEqual),
                ));
                let else_target = self.block_value(else_block);
                self.push(Inst::new(MirOp::Jump, None, vec![else_target], InstData::None));
            }
            InstKind::Return { value } => {
                let mut operands = Vec::new();
                if let Some(value) = value {
                    let parts = self.read(value);
                    for (w, part) in parts.into_iter().enumerate() {
                        let arg = self.out.arg_regs[w];
                        let part = match part {
                            Value::Undef => Value::Const(0),
                            other => other,
                        };
                        self.push(Inst::new(
                            MirOp::Copy,
                            Some(arg),
                            vec![part],
                            InstData::Width(8),
                        ));
                        operands.push(Value::Reg(arg));
                    }
                }
                self.push(Inst::new(MirOp::Return, None, operands, InstData::None));
            }
        }
    }

    fn lower_call(&mut self, inst: ValueId, callee: Callee, args: &[ValueId]) {
        // Stage arguments into the contiguous callee window.
        let mut arg_values = Vec::new();
        for &arg in args {
            arg_values.push(self.read(arg));
        }
        let total_words: usize = arg_values.iter().map(Vec::len).sum();
        let ret_words = words_of(&self.ir.ctx, self.f.value(inst).ty);
        let window = self.out.callee_window(total_words.max(ret_words));
        let mut cursor = 0;
        for parts in arg_values {
            for part in parts {
                let part = match part {
                    Value::Undef => Value::Const(0),
                    other => other,
                };
                self.push(Inst::new(
                    MirOp::Copy,
                    Some(window[cursor]),
                    vec![part],
                    InstData::Width(8),
                ));
                cursor += 1;
            }
        }
        let data = InstData::Call(CallData {
            arg_count: total_words,
            ret_words,
            reg_offset: 0,
        });
        let mut operands: Vec<Value> = match callee {
            Callee::Function(index) => vec![Value::Func(index)],
            Callee::Foreign { slot, index } => {
                vec![Value::Ext(ExtFuncAddress { slot, index })]
            }
        };
        operands.extend(window[..total_words].iter().map(|&r| Value::Reg(r)));
        let op = match callee {
            Callee::Function(_) => MirOp::Call,
            Callee::Foreign { .. } => MirOp::CallExt,
        };
        self.push(Inst::new(op, None, operands, data));
        // The return value arrives in the window's first registers.
        if ret_words > 0 {
            let dest = self.fresh_regs(ret_words);
            for (w, &reg) in dest.iter().enumerate() {
                self.push(Inst::new(
                    MirOp::Copy,
                    Some(reg),
                    vec![Value::Reg(window[w])],
                    InstData::Width(8),
                ));
            }
            self.reg_map.insert(inst, dest);
        }
    }

    fn lower_extract(&mut self, inst: ValueId, aggregate: ValueId, indices: &[usize]) {
        let agg_ty = self.f.value(aggregate).ty;
        let (offset, size) = aggregate_slot(&self.ir.ctx, agg_ty, indices);
        let source = self.read(aggregate);
        let words = self.words(inst);
        let dest = self.fresh_regs(words);
        if offset % 8 == 0 && (size % 8 == 0 || size <= 8) {
            // Whole-register extraction.
            for (w, &reg) in dest.iter().enumerate() {
                let part = source[offset as usize / 8 + w];
                let part = match part {
                    Value::Undef => Value::Const(0),
                    other => other,
                };
                self.push(Inst::new(MirOp::Copy, Some(reg), vec![part], InstData::Width(8)));
            }
        } else {
            // Sub-word: shift down and mask.
            let word = source[offset as usize / 8];
            let shift = (offset % 8) * 8;
            self.push(Inst::new(MirOp::Copy, Some(dest[0]), vec![word], InstData::Width(8)));
            if shift > 0 {
                self.push(Inst::new(
                    MirOp::Arith,
                    Some(dest[0]),
                    vec![Value::Reg(dest[0]), Value::Const(shift)],
                    InstData::Arith(MirArithOp::Lsr),
                ));
            }
            if size < 8 {
                let mask = (1u64 << (size * 8)) - 1;
                self.push(Inst::new(
                    MirOp::Arith,
                    Some(dest[0]),
                    vec![Value::Reg(dest[0]), Value::Const(mask)],
                    InstData::Arith(MirArithOp::And),
                ));
            }
        }
        self.reg_map.insert(inst, dest);
    }

    fn lower_insert(
        &mut self,
        inst: ValueId,
        aggregate: ValueId,
        value: ValueId,
        indices: &[usize],
    ) {
        let agg_ty = self.f.value(aggregate).ty;
        let (offset, size) = aggregate_slot(&self.ir.ctx, agg_ty, indices);
        let source = self.read(aggregate);
        let words = self.words(inst);
        let dest = self.fresh_regs(words);
        for (w, &reg) in dest.iter().enumerate() {
            let part = match source.get(w).copied().unwrap_or(Value::Undef) {
                Value::Undef => Value::Const(0),
                other => other,
            };
            self.push(Inst::new(MirOp::Copy, Some(reg), vec![part], InstData::Width(8)));
        }
        let parts = self.read(value);
        if offset % 8 == 0 && (size % 8 == 0 || size <= 8) {
            for (w, part) in parts.into_iter().enumerate() {
                let part = match part {
                    Value::Undef => Value::Const(0),
                    other => other,
                };
                self.push(Inst::new(
                    MirOp::Copy,
                    Some(dest[offset as usize / 8 + w]),
                    vec![part],
                    InstData::Width(8),
                ));
            }
        } else {
            // Sub-word: clear the slot and or the shifted value in.
            let word = dest[offset as usize / 8];
            let shift = (offset % 8) * 8;
            let mask = if size >= 8 { u64::MAX } else { (1u64 << (size * 8)) - 1 };
            self.push(Inst::new(
                MirOp::Arith,
                Some(word),
                vec![Value::Reg(word), Value::Const(!(mask << shift))],
                InstData::Arith(MirArithOp::And),
            ));
            let shifted = self.fresh_regs(1)[0];
            let part = parts[0];
            self.push(Inst::new(MirOp::Copy, Some(shifted), vec![part], InstData::Width(8)));
            if shift > 0 {
                self.push(Inst::new(
                    MirOp::Arith,
                    Some(shifted),
                    vec![Value::Reg(shifted), Value::Const(shift)],
                    InstData::Arith(MirArithOp::Lsl),
                ));
            }
            self.push(Inst::new(
                MirOp::Arith,
                Some(word),
                vec![Value::Reg(word), Value::Reg(shifted)],
                InstData::Arith(MirArithOp::Or),
            ));
        }
        self.reg_map.insert(inst, dest);
    }

    fn conv_of(&self, op: ConvOp, operand: ValueId, result: ValueId) -> MirConv {
        let from = self.f.value(operand).ty;
        let to = self.f.value(result).ty;
        let from_width = type_width(&self.ir.ctx, from);
        let to_width = type_width(&self.ir.ctx, to);
        match op {
            ConvOp::Sext => match from_width {
                8 => MirConv::Sext8,
                16 => MirConv::Sext16,
                _ => MirConv::Sext32,
            },
            ConvOp::Fext => MirConv::Fext,
            ConvOp::Ftrunc => MirConv::Ftrunc,
            ConvOp::StoF => {
                if to_width == 32 {
                    MirConv::S64ToF32
                } else {
                    MirConv::S64ToF64
                }
            }
            ConvOp::UtoF => {
                if to_width == 32 {
                    MirConv::U64ToF32
                } else {
                    MirConv::U64ToF64
                }
            }
            ConvOp::FtoS => {
                if from_width == 32 {
                    MirConv::F32ToS64
                } else {
                    MirConv::F64ToS64
                }
            }
            ConvOp::FtoU => {
                if from_width == 32 {
                    MirConv::F32ToU64
                } else {
                    MirConv::F64ToU64
                }
            }
            ConvOp::Zext | ConvOp::Trunc | ConvOp::Bitcast => {
                unreachable!("no-op conversions are folded away")
            }
        }
    }

    /// Insert the recorded phi copies into each predecessor, just before its
    /// trailing jumps.
    fn resolve_phis(&mut self) {
        let copies = std::mem::take(&mut self.phi_copies);
        for copy in copies {
            let values = self.read(copy.value);
            let block = self.block_map[&copy.pred];
            let insts = &mut self.out.blocks[block].insts;
            let mut position = insts.len();
            while position > 0
                && matches!(insts[position - 1].op, MirOp::Jump | MirOp::CJump | MirOp::Return)
            {
                position -= 1;
            }
            for (w, part) in values.into_iter().enumerate() {
                let part = match part {
                    Value::Undef => Value::Const(0),
                    other => other,
                };
                insts.insert(
                    position + w,
                    Inst::new(
                        MirOp::Copy,
                        Some(copy.dest_regs[w]),
                        vec![part],
                        InstData::Width(8),
                    ),
                );
            }
        }
    }
}

fn words_of(ctx: &ir::Context, ty: TypeId) -> usize {
    (ctx.size_of(ty) as usize).div_ceil(8)
}

fn type_width(ctx: &ir::Context, ty: TypeId) -> u32 {
    match ctx.ty(ty) {
        Type::Int { width } | Type::Float { width } => *width,
        _ => 64,
    }
}

/// Byte offset of a member path inside a GEP's pointee.
fn member_offset(ctx: &ir::Context, ty: TypeId, members: &[usize]) -> u64 {
    aggregate_slot(ctx, ty, members).0
}

/// Byte offset and size of the member path inside an aggregate.
fn aggregate_slot(ctx: &ir::Context, ty: TypeId, indices: &[usize]) -> (u64, u64) {
    let mut offset = 0;
    let mut current = ty;
    for &index in indices {
        match ctx.ty(current) {
            Type::Struct { .. } => {
                offset += ctx.field_offset(current, index);
                current = ctx.field_type(current, index);
            }
            Type::Array { elem, .. } => {
                let elem = *elem;
                offset += ctx.size_of(elem) * index as u64;
                current = elem;
            }
            _ => break,
        }
    }
    (offset, ctx.size_of(current).max(1))
}

fn condition_of(op: ir::CompareOp) -> Condition {
    match op {
        ir::CompareOp::Less => Condition::Less,
        ir::CompareOp::LessEq => Condition::LessEq,
        ir::CompareOp::Greater => Condition::Greater,
        ir::CompareOp::GreaterEq => Condition::GreaterEq,
        ir::CompareOp::Equal => Condition::Equal,
        ir::CompareOp::NotEqual => Condition::NotEqual,
    }
}

fn arith_of(op: ArithOp) -> MirArithOp {
    match op {
        ArithOp::Add => MirArithOp::Add,
        ArithOp::Sub => MirArithOp::Sub,
        ArithOp::Mul => MirArithOp::Mul,
        ArithOp::SDiv => MirArithOp::IDiv,
        ArithOp::UDiv => MirArithOp::UDiv,
        ArithOp::SRem => MirArithOp::IRem,
        ArithOp::URem => MirArithOp::URem,
        ArithOp::FAdd => MirArithOp::FAdd,
        ArithOp::FSub => MirArithOp::FSub,
        ArithOp::FMul => MirArithOp::FMul,
        ArithOp::FDiv => MirArithOp::FDiv,
        ArithOp::LShL => MirArithOp::Lsl,
        ArithOp::LShR => MirArithOp::Lsr,
        ArithOp::AShR => MirArithOp::Asr,
        ArithOp::And => MirArithOp::And,
        ArithOp::Or => MirArithOp::Or,
        ArithOp::XOr => MirArithOp::XOr,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{Context, Function as IrFunction, InstKind, Module as IrModule};

    fn lower_simple(build: impl FnOnce(&mut Context) -> IrFunction) -> Function {
        let mut module = IrModule::new();
        let f = build(&mut module.ctx);
        module.functions.push(f);
        let mir = lower_to_mir(module);
        mir.functions.into_iter().next().unwrap()
    }

    #[test]
    fn test_phi_lowers_to_predecessor_moves() {
        let mir = lower_simple(|ctx| {
            let i64 = ctx.int(64);
            let i1 = ctx.int(1);
            let void = ctx.void();
            let mut f = IrFunction::new("f", &[i1], i64);
            let entry = f.add_block("entry");
            let p1 = f.add_block("p1");
            let p2 = f.add_block("p2");
            let merge = f.add_block("merge");
            let cond = f.params[0];
            f.add_inst(entry, "", void, InstKind::Branch {
                cond,
                then_block: p1,
                else_block: p2,
            });
            let a = f.int_const(i64, 10);
            let b = f.int_const(i64, 20);
            f.add_inst(p1, "", void, InstKind::Goto { target: merge });
            f.add_inst(p2, "", void, InstKind::Goto { target: merge });
            let phi = f.add_inst(merge, "phi", i64, InstKind::Phi {
                incoming: vec![(p1, a), (p2, b)],
            });
            f.add_inst(merge, "", void, InstKind::Return { value: Some(phi) });
            f
        });
        // Both predecessors end with: move into the phi register, then jump.
        for name in ["p1", "p2"] {
            let block = mir.blocks.iter().find(|b| b.name == name).unwrap();
            let n = block.insts.len();
            assert!(n >= 2);
            assert_eq!(block.insts[n - 1].op, MirOp::Jump);
            assert_eq!(block.insts[n - 2].op, MirOp::Copy, "{name} should copy into the phi");
        }
    }

    #[test]
    fn test_branch_lowers_to_test_cjump_jump() {
        let mir = lower_simple(|ctx| {
            let i1 = ctx.int(1);
            let void = ctx.void();
            let mut f = IrFunction::new("f", &[i1], void);
            let entry = f.add_block("entry");
            let a = f.add_block("a");
            let b = f.add_block("b");
            let cond = f.params[0];
            f.add_inst(entry, "", void, InstKind::Branch {
                cond,
                then_block: a,
                else_block: b,
            });
            f.add_inst(a, "", void, InstKind::Return { value: None });
            f.add_inst(b, "", void, InstKind::Return { value: None });
            f
        });
        let entry = &mir.blocks[0];
        let ops: Vec<MirOp> = entry.insts.iter().map(|i| i.op).collect();
        assert!(ops.ends_with(&[MirOp::Test, MirOp::CJump, MirOp::Jump]));
        let cjump = &entry.insts[ops.len() - 2];
        assert_eq!(cjump.data, InstData::Cond(Condition::NotEqual));
    }

    #[test]
    fn test_gep_inlines_into_memory_operand() {
        let mir = lower_simple(|ctx| {
            let i64 = ctx.int(64);
            let ptr = ctx.ptr();
            let void = ctx.void();
            let s = ctx.intern(Type::Struct { fields: vec![i64, i64] });
            let mut f = IrFunction::new("f", &[ptr], i64);
            let entry = f.add_block("entry");
            let zero = f.int_const(i64, 0);
            let base = f.params[0];
            let gep = f.add_inst(entry, "gep", ptr, InstKind::GetElementPointer {
                pointee: s,
                base,
                index: zero,
                members: vec![1],
            });
            let load = f.add_inst(entry, "x", i64, InstKind::Load { address: gep });
            f.add_inst(entry, "", void, InstKind::Return { value: Some(load) });
            f
        });
        // No LEA emitted; the load carries the full address.
        let all: Vec<&Inst> = mir.blocks.iter().flat_map(|b| b.insts.iter()).collect();
        assert!(all.iter().all(|i| i.op != MirOp::Lea));
        let load = all.iter().find(|i| i.op == MirOp::Load).unwrap();
        let Value::Addr(addr) = load.operands[0] else { panic!("expected address operand") };
        assert_eq!(addr.offset, 8);
        assert_eq!(addr.index, None);
    }

    #[test]
    fn test_gep_with_other_users_emits_lea() {
        let mir = lower_simple(|ctx| {
            let i64 = ctx.int(64);
            let ptr = ctx.ptr();
            let void = ctx.void();
            let mut f = IrFunction::new("f", &[ptr, i64], ptr);
            let entry = f.add_block("entry");
            let base = f.params[0];
            let index = f.params[1];
            let gep = f.add_inst(entry, "gep", ptr, InstKind::GetElementPointer {
                pointee: i64,
                base,
                index,
                members: vec![],
            });
            // The GEP value escapes through the return, so it cannot fold.
            f.add_inst(entry, "", void, InstKind::Return { value: Some(gep) });
            f
        });
        let all: Vec<&Inst> = mir.blocks.iter().flat_map(|b| b.insts.iter()).collect();
        assert!(all.iter().any(|i| i.op == MirOp::Lea));
    }

    #[test]
    fn test_wide_store_splits_into_words() {
        let mir = lower_simple(|ctx| {
            let i64 = ctx.int(64);
            let ptr = ctx.ptr();
            let void = ctx.void();
            let s = ctx.intern(Type::Struct { fields: vec![i64, i64] });
            let mut f = IrFunction::new("f", &[ptr], void);
            let entry = f.add_block("entry");
            let one = f.int_const(i64, 1);
            let undef = f.undef(s);
            let v0 = f.add_inst(entry, "v0", s, InstKind::InsertValue {
                aggregate: undef,
                value: one,
                indices: vec![0],
            });
            let two = f.int_const(i64, 2);
            let v1 = f.add_inst(entry, "v1", s, InstKind::InsertValue {
                aggregate: v0,
                value: two,
                indices: vec![1],
            });
            f.add_inst(entry, "", void, InstKind::Store { address: f.params[0], value: v1 });
            f.add_inst(entry, "", void, InstKind::Return { value: None });
            f
        });
        let stores: Vec<&Inst> = mir
            .blocks
            .iter()
            .flat_map(|b| b.insts.iter())
            .filter(|i| i.op == MirOp::Store)
            .collect();
        assert_eq!(stores.len(), 2);
        let Value::Addr(a0) = stores[0].operands[0] else { panic!() };
        let Value::Addr(a1) = stores[1].operands[0] else { panic!() };
        assert_eq!(a1.offset - a0.offset, 8);
    }

    #[test]
    fn test_call_stages_window_and_reads_result() {
        let mir = lower_simple(|ctx| {
            let i64 = ctx.int(64);
            let mut f = IrFunction::new("f", &[i64], i64);
            let entry = f.add_block("entry");
            let arg = f.params[0];
            let call = f.add_inst(entry, "r", i64, InstKind::Call {
                callee: Callee::Function(0),
                args: vec![arg],
            });
            let void = ctx.void();
            f.add_inst(entry, "", void, InstKind::Return { value: Some(call) });
            f
        });
        assert_eq!(mir.callee_regs.len(), 1);
        let all: Vec<&Inst> = mir.blocks.iter().flat_map(|b| b.insts.iter()).collect();
        let call_pos = all.iter().position(|i| i.op == MirOp::Call).unwrap();
        // A copy into the window before, a copy out of it after.
        assert_eq!(all[call_pos - 1].op, MirOp::Copy);
        assert_eq!(all[call_pos - 1].dest, Some(mir.callee_regs[0]));
        assert_eq!(all[call_pos + 1].op, MirOp::Copy);
        assert_eq!(
            all[call_pos + 1].operands[0],
            Value::Reg(mir.callee_regs[0])
        );
    }

    #[test]
    fn test_select_lowers_to_cond_copy() {
        let mir = lower_simple(|ctx| {
            let i64 = ctx.int(64);
            let i1 = ctx.int(1);
            let mut f = IrFunction::new("f", &[i1], i64);
            let entry = f.add_block("entry");
            let a = f.int_const(i64, 1);
            let b = f.int_const(i64, 2);
            let cond = f.params[0];
            let select = f.add_inst(entry, "sel", i64, InstKind::Select {
                cond,
                then_value: a,
                else_value: b,
            });
            let void = ctx.void();
            f.add_inst(entry, "", void, InstKind::Return { value: Some(select) });
            f
        });
        let all: Vec<&Inst> = mir.blocks.iter().flat_map(|b| b.insts.iter()).collect();
        let ops: Vec<MirOp> = all.iter().map(|i| i.op).collect();
        let test_pos = ops.iter().position(|&o| o == MirOp::Test).unwrap();
        assert_eq!(ops[test_pos + 1], MirOp::CondCopy);
        assert_eq!(all[test_pos + 1].data, InstData::Cond(Condition::Equal));
    }
}
