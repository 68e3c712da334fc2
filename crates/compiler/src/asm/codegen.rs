//! MIR to assembly translation.
//!
//! Runs after register allocation: every MIR register has a hardware index,
//! so instructions map one-to-one (or one-to-few) onto opcodes.

use scatha_core::OpCode;

use crate::asm::{AssemblyStream, LabelId, MemoryOperand, Operand};
use crate::ir::CompareMode;
use crate::mir::{
    Condition, Function, Inst, InstData, MemoryAddress, MirArithOp, MirConv, MirOp, MirUnaryOp,
    Module, Value,
};

/// Translate an allocated MIR module into an assembly stream. The entry
/// point is the function named `main` (the first function otherwise).
pub fn generate_assembly(module: &Module) -> AssemblyStream {
    let mut stream = AssemblyStream::new();
    let (offsets, _) = crate::mir::data_offsets(&module.constants);
    let mut data = Vec::new();
    for (constant, &offset) in module.constants.iter().zip(&offsets) {
        data.resize(offset as usize, 0);
        data.extend_from_slice(&constant.bytes);
    }
    stream.data = data;

    let function_labels: Vec<LabelId> =
        module.functions.iter().map(|_| stream.make_label()).collect();
    for (function, &label) in module.functions.iter().zip(&function_labels) {
        if function.name == "main" {
            stream.start = Some(label);
        }
    }
    if stream.start.is_none() {
        stream.start = function_labels.first().copied();
    }

    for (index, function) in module.functions.iter().enumerate() {
        stream.place_label(function_labels[index]);
        generate_function(&mut stream, function, &function_labels);
    }
    stream
}

fn generate_function(stream: &mut AssemblyStream, f: &Function, functions: &[LabelId]) {
    let block_labels: Vec<LabelId> = f.blocks.iter().map(|_| stream.make_label()).collect();
    for (index, block) in f.blocks.iter().enumerate() {
        stream.place_label(block_labels[index]);
        for inst in &block.insts {
            generate_inst(stream, f, inst, functions, &block_labels);
        }
    }
}

fn reg(f: &Function, value: &Value) -> u8 {
    match value {
        Value::Reg(r) => f.hw(*r),
        _ => panic!("expected a register operand"),
    }
}

fn memory(f: &Function, addr: &MemoryAddress) -> MemoryOperand {
    MemoryOperand {
        base: f.hw(addr.base),
        index: addr
            .index
            .map(|r| f.hw(r))
            .unwrap_or(scatha_core::opcode::NO_INDEX_REG),
        scale: addr.scale,
        offset: addr.offset,
    }
}

fn generate_inst(
    stream: &mut AssemblyStream,
    f: &Function,
    inst: &Inst,
    functions: &[LabelId],
    blocks: &[LabelId],
) {
    match inst.op {
        MirOp::Copy => {
            let dest = f.hw(inst.dest.expect("copy without destination"));
            match inst.operands[0] {
                Value::Reg(source) => stream.push(
                    OpCode::Mov64RR,
                    vec![Operand::Reg(dest), Operand::Reg(f.hw(source))],
                ),
                Value::Const(value) => stream.push(
                    OpCode::Mov64RV,
                    vec![Operand::Reg(dest), Operand::Value64(value)],
                ),
                Value::Undef => stream.push(
                    OpCode::Mov64RV,
                    vec![Operand::Reg(dest), Operand::Value64(0)],
                ),
                _ => panic!("unsupported copy source"),
            }
        }
        MirOp::CondCopy => {
            let dest = f.hw(inst.dest.expect("conditional copy without destination"));
            debug_assert_eq!(inst.data, InstData::Cond(Condition::Equal));
            match inst.operands[0] {
                Value::Reg(source) => stream.push(
                    OpCode::CMoveRR,
                    vec![Operand::Reg(dest), Operand::Reg(f.hw(source))],
                ),
                Value::Const(value) => stream.push(
                    OpCode::CMoveRV,
                    vec![Operand::Reg(dest), Operand::Value64(value)],
                ),
                _ => panic!("unsupported conditional copy source"),
            }
        }
        MirOp::LIncSP => {
            let dest = f.hw(inst.dest.expect("lincsp without destination"));
            let Value::Const(bytes) = inst.operands[0] else {
                panic!("lincsp takes a constant byte count");
            };
            assert!(bytes <= u16::MAX as u64, "stack frame exceeds the lincsp encoding");
            stream.push(
                OpCode::LIncSP,
                vec![Operand::Reg(dest), Operand::Value16(bytes as u16)],
            );
        }
        MirOp::Lea => {
            let dest = f.hw(inst.dest.expect("lea without destination"));
            let Value::Addr(addr) = &inst.operands[0] else {
                panic!("lea takes an address operand");
            };
            stream.push(
                OpCode::Lea,
                vec![Operand::Reg(dest), Operand::Memory(memory(f, addr))],
            );
        }
        MirOp::Load => {
            let dest = f.hw(inst.dest.expect("load without destination"));
            let Value::Addr(addr) = &inst.operands[0] else {
                panic!("load takes an address operand");
            };
            let InstData::Width(width) = inst.data else {
                panic!("load without width");
            };
            let op = match width {
                1 => OpCode::Mov8RM,
                2 => OpCode::Mov16RM,
                4 => OpCode::Mov32RM,
                _ => OpCode::Mov64RM,
            };
            stream.push(op, vec![Operand::Reg(dest), Operand::Memory(memory(f, addr))]);
        }
        MirOp::Store => {
            let Value::Addr(addr) = &inst.operands[0] else {
                panic!("store takes an address operand");
            };
            let source = reg(f, &inst.operands[1]);
            let InstData::Width(width) = inst.data else {
                panic!("store without width");
            };
            let op = match width {
                1 => OpCode::Mov8MR,
                2 => OpCode::Mov16MR,
                4 => OpCode::Mov32MR,
                _ => OpCode::Mov64MR,
            };
            stream.push(op, vec![Operand::Memory(memory(f, addr)), Operand::Reg(source)]);
        }
        MirOp::Conversion => {
            let dest = f.hw(inst.dest.expect("conversion without destination"));
            let InstData::Conv(conv) = inst.data else {
                panic!("conversion without kind");
            };
            let op = match conv {
                MirConv::Sext8 => OpCode::Sext8,
                MirConv::Sext16 => OpCode::Sext16,
                MirConv::Sext32 => OpCode::Sext32,
                MirConv::Fext => OpCode::Fext,
                MirConv::Ftrunc => OpCode::Ftrunc,
                MirConv::S64ToF64 => OpCode::S64ToF64,
                MirConv::S64ToF32 => OpCode::S64ToF32,
                MirConv::U64ToF64 => OpCode::U64ToF64,
                MirConv::U64ToF32 => OpCode::U64ToF32,
                MirConv::F64ToS64 => OpCode::F64ToS64,
                MirConv::F64ToU64 => OpCode::F64ToU64,
                MirConv::F32ToS64 => OpCode::F32ToS64,
                MirConv::F32ToU64 => OpCode::F32ToU64,
            };
            stream.push(op, vec![Operand::Reg(dest)]);
        }
        MirOp::Compare => {
            let InstData::Compare(mode) = inst.data else {
                panic!("compare without mode");
            };
            let lhs = reg(f, &inst.operands[0]);
            match inst.operands[1] {
                Value::Reg(rhs) => {
                    let op = match mode {
                        CompareMode::Signed => OpCode::ICmpRR,
                        CompareMode::Unsigned => OpCode::UCmpRR,
                        CompareMode::Float => OpCode::FCmpRR,
                    };
                    stream.push(op, vec![Operand::Reg(lhs), Operand::Reg(f.hw(rhs))]);
                }
                Value::Const(value) => {
                    let op = match mode {
                        CompareMode::Signed => OpCode::ICmpRV,
                        CompareMode::Unsigned => OpCode::UCmpRV,
                        CompareMode::Float => OpCode::FCmpRV,
                    };
                    stream.push(op, vec![Operand::Reg(lhs), Operand::Value64(value)]);
                }
                _ => panic!("unsupported compare operand"),
            }
        }
        MirOp::Test => {
            let InstData::Compare(mode) = inst.data else {
                panic!("test without mode");
            };
            let operand = reg(f, &inst.operands[0]);
            let op = match mode {
                CompareMode::Signed => OpCode::ITest,
                _ => OpCode::UTest,
            };
            stream.push(op, vec![Operand::Reg(operand)]);
        }
        MirOp::Set => {
            let dest = f.hw(inst.dest.expect("set without destination"));
            let InstData::Cond(cond) = inst.data else {
                panic!("set without condition");
            };
            let op = match cond {
                Condition::Equal => OpCode::SetE,
                Condition::NotEqual => OpCode::SetNE,
                Condition::Less => OpCode::SetL,
                Condition::LessEq => OpCode::SetLE,
                Condition::Greater => OpCode::SetG,
                Condition::GreaterEq => OpCode::SetGE,
            };
            stream.push(op, vec![Operand::Reg(dest)]);
        }
        MirOp::UnaryArith => {
            let dest = f.hw(inst.dest.expect("unary arithmetic without destination"));
            let InstData::Unary(op) = inst.data else {
                panic!("unary arithmetic without operation");
            };
            let op = match op {
                MirUnaryOp::LogicalNot => OpCode::LNt,
                MirUnaryOp::BitwiseNot => OpCode::BNt,
                MirUnaryOp::Negate => OpCode::Neg,
                MirUnaryOp::FNegate => OpCode::FNeg,
            };
            stream.push(op, vec![Operand::Reg(dest)]);
        }
        MirOp::Arith => {
            let dest = f.hw(inst.dest.expect("arithmetic without destination"));
            debug_assert_eq!(reg(f, &inst.operands[0]), dest, "arithmetic is two-address");
            let InstData::Arith(op) = inst.data else {
                panic!("arithmetic without operation");
            };
            generate_arith(stream, f, dest, op, &inst.operands[1]);
        }
        MirOp::Call => {
            let Value::Func(index) = inst.operands[0] else {
                panic!("call without function target");
            };
            let InstData::Call(data) = &inst.data else { panic!("call without data") };
            stream.push(
                OpCode::Call,
                vec![
                    Operand::Label(functions[index]),
                    Operand::Reg(data.reg_offset as u8),
                ],
            );
        }
        MirOp::CallExt => {
            let Value::Ext(ext) = inst.operands[0] else {
                panic!("external call without target");
            };
            let InstData::Call(data) = &inst.data else { panic!("call without data") };
            stream.push(
                OpCode::CallExt,
                vec![
                    Operand::Reg(data.reg_offset as u8),
                    Operand::Value8(ext.slot),
                    Operand::Value16(ext.index),
                ],
            );
        }
        MirOp::Return => stream.push(OpCode::Ret, vec![]),
        MirOp::Jump => {
            let Value::Block(target) = inst.operands[0] else {
                panic!("jump without block target");
            };
            stream.push(OpCode::Jmp, vec![Operand::Label(blocks[target])]);
        }
        MirOp::CJump => {
            let Value::Block(target) = inst.operands[0] else {
                panic!("jump without block target");
            };
            let InstData::Cond(cond) = inst.data else {
                panic!("conditional jump without condition");
            };
            let op = match cond {
                Condition::Equal => OpCode::Je,
                Condition::NotEqual => OpCode::Jne,
                Condition::Less => OpCode::Jl,
                Condition::LessEq => OpCode::Jle,
                Condition::Greater => OpCode::Jg,
                Condition::GreaterEq => OpCode::Jge,
            };
            stream.push(op, vec![Operand::Label(blocks[target])]);
        }
    }
}

fn generate_arith(
    stream: &mut AssemblyStream,
    f: &Function,
    dest: u8,
    op: MirArithOp,
    rhs: &Value,
) {
    use MirArithOp::*;
    // Shift amounts use the 8-bit immediate form.
    if matches!(op, Lsl | Lsr | Asr) {
        if let Value::Const(amount) = rhs {
            let opcode = match op {
                Lsl => OpCode::LslRV,
                Lsr => OpCode::LsrRV,
                _ => OpCode::AsrRV,
            };
            stream.push(opcode, vec![Operand::Reg(dest), Operand::Value8(*amount as u8)]);
            return;
        }
        let opcode = match op {
            Lsl => OpCode::LslRR,
            Lsr => OpCode::LsrRR,
            _ => OpCode::AsrRR,
        };
        stream.push(opcode, vec![Operand::Reg(dest), Operand::Reg(reg(f, rhs))]);
        return;
    }
    let rr = |op: MirArithOp| match op {
        Add => OpCode::AddRR,
        Sub => OpCode::SubRR,
        Mul => OpCode::MulRR,
        UDiv => OpCode::UDivRR,
        IDiv => OpCode::IDivRR,
        URem => OpCode::URemRR,
        IRem => OpCode::IRemRR,
        FAdd => OpCode::FAddRR,
        FSub => OpCode::FSubRR,
        FMul => OpCode::FMulRR,
        FDiv => OpCode::FDivRR,
        And => OpCode::AndRR,
        Or => OpCode::OrRR,
        XOr => OpCode::XorRR,
        Lsl | Lsr | Asr => unreachable!(),
    };
    let rv = |op: MirArithOp| match op {
        Add => OpCode::AddRV,
        Sub => OpCode::SubRV,
        Mul => OpCode::MulRV,
        UDiv => OpCode::UDivRV,
        IDiv => OpCode::IDivRV,
        URem => OpCode::URemRV,
        IRem => OpCode::IRemRV,
        FAdd => OpCode::FAddRV,
        FSub => OpCode::FSubRV,
        FMul => OpCode::FMulRV,
        FDiv => OpCode::FDivRV,
        And => OpCode::AndRV,
        Or => OpCode::OrRV,
        XOr => OpCode::XorRV,
        Lsl | Lsr | Asr => unreachable!(),
    };
    match rhs {
        Value::Reg(r) => stream.push(rr(op), vec![Operand::Reg(dest), Operand::Reg(f.hw(*r))]),
        Value::Const(v) => stream.push(rv(op), vec![Operand::Reg(dest), Operand::Value64(*v)]),
        _ => panic!("unsupported arithmetic operand"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asm::assemble;
    use crate::mir::{CallData, RegisterKind};

    /// Build a tiny allocated MIR function by hand.
    fn manual_function() -> Module {
        let mut f = Function::new("main");
        let a = f.add_register(RegisterKind::Arg);
        let v = f.add_register(RegisterKind::Virtual);
        f.assign(v, 1);
        f.hardware_reg_count = 2 + crate::mir::NUM_REGS_FOR_CALL_METADATA;
        let entry = f.add_block("entry");
        f.blocks[entry].insts.push(Inst::new(
            MirOp::Copy,
            Some(v),
            vec![Value::Const(40)],
            InstData::Width(8),
        ));
        f.blocks[entry].insts.push(Inst::new(
            MirOp::Arith,
            Some(v),
            vec![Value::Reg(v), Value::Const(2)],
            InstData::Arith(MirArithOp::Add),
        ));
        f.blocks[entry].insts.push(Inst::new(
            MirOp::Copy,
            Some(a),
            vec![Value::Reg(v)],
            InstData::Width(8),
        ));
        f.blocks[entry]
            .insts
            .push(Inst::new(MirOp::Return, None, vec![Value::Reg(a)], InstData::None));
        Module { functions: vec![f], constants: Vec::new() }
    }

    #[test]
    fn test_generate_and_assemble() {
        let module = manual_function();
        let stream = generate_assembly(&module);
        let image = assemble(&stream).unwrap();
        let view = scatha_core::program::ProgramView::new(&image).unwrap();
        assert_eq!(view.start_address, 0);
        assert_eq!(view.text[0], u8::from(OpCode::Mov64RV));
    }

    #[test]
    fn test_assembling_twice_is_deterministic() {
        let module = manual_function();
        let a = assemble(&generate_assembly(&module)).unwrap();
        let b = assemble(&generate_assembly(&module)).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_call_ext_encoding() {
        let mut f = Function::new("main");
        let w = f.callee_window(1)[0];
        f.assign(w, 3);
        let entry = f.add_block("entry");
        f.blocks[entry].insts.push(Inst::new(
            MirOp::Copy,
            Some(w),
            vec![Value::Const(65)],
            InstData::Width(8),
        ));
        f.blocks[entry].insts.push(Inst::new(
            MirOp::CallExt,
            None,
            vec![
                Value::Ext(crate::mir::ExtFuncAddress { slot: 0, index: 20 }),
                Value::Reg(w),
            ],
            InstData::Call(CallData { arg_count: 1, ret_words: 0, reg_offset: 3 }),
        ));
        f.blocks[entry]
            .insts
            .push(Inst::new(MirOp::Return, None, vec![], InstData::None));
        let module = Module { functions: vec![f], constants: Vec::new() };
        let image = assemble(&generate_assembly(&module)).unwrap();
        let view = scatha_core::program::ProgramView::new(&image).unwrap();
        // mov64RV is 10 bytes, then callExt reg_offset=3 slot=0 index=20.
        assert_eq!(view.text[10], u8::from(OpCode::CallExt));
        assert_eq!(&view.text[11..15], &[3, 0, 20, 0]);
    }
}
