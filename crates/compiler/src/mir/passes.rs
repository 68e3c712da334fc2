//! Post-allocation block-level passes: self tail call rewriting, block
//! reordering for fallthrough, and jump elision.

use crate::mir::{Function, Inst, InstData, MirOp, Value};

/// Rewrite self tail calls into parameter copies plus a jump back to the
/// entry block. Only applies to functions without stack allocations, whose
/// frames are safe to reuse.
pub fn tail_call_opt(function: &mut Function, self_index: usize) {
    let uses_stack = function
        .blocks
        .iter()
        .flat_map(|b| b.insts.iter())
        .any(|i| i.op == MirOp::LIncSP);
    if uses_stack {
        return;
    }
    let arg_regs = function.arg_regs.clone();
    for block in &mut function.blocks {
        let insts = &mut block.insts;
        // Pattern: call self; copy the result out of the window; copy it
        // into the return slot; return.
        let Some(call_pos) = insts.iter().rposition(|i| {
            i.op == MirOp::Call && i.operands.first() == Some(&Value::Func(self_index))
        }) else {
            continue;
        };
        let tail = &insts[call_pos + 1..];
        if tail.is_empty() || tail.last().map(|i| i.op) != Some(MirOp::Return) {
            continue;
        }
        if !tail[..tail.len() - 1].iter().all(|i| i.op == MirOp::Copy) {
            continue;
        }
        // The call's result must flow unchanged into the return registers.
        let InstData::Call(data) = &insts[call_pos].data else { continue };
        if tail.len() != 2 * data.ret_words + 1 {
            continue;
        }
        let window: Vec<Value> = insts[call_pos].operands[1..].to_vec();
        insts.truncate(call_pos);
        // The staged window registers become the next iteration's
        // parameters.
        for (index, value) in window.into_iter().enumerate() {
            insts.push(Inst::new(
                MirOp::Copy,
                Some(arg_regs[index]),
                vec![value],
                InstData::Width(8),
            ));
        }
        insts.push(Inst::new(MirOp::Jump, None, vec![Value::Block(0)], InstData::None));
    }
}

/// Reorder blocks into a fallthrough-friendly chain: after each block, place
/// its unconditional jump target when still unplaced.
pub fn reorder_blocks(function: &mut Function) {
    let count = function.blocks.len();
    if count <= 2 {
        return;
    }
    let mut order: Vec<usize> = Vec::with_capacity(count);
    let mut placed = vec![false; count];
    let mut cursor = 0;
    loop {
        order.push(cursor);
        placed[cursor] = true;
        let next = function.blocks[cursor]
            .insts
            .last()
            .filter(|i| i.op == MirOp::Jump)
            .and_then(|i| match i.operands.first() {
                Some(Value::Block(target)) if !placed[*target] => Some(*target),
                _ => None,
            });
        cursor = match next.or_else(|| placed.iter().position(|&p| !p)) {
            Some(next) => next,
            None => break,
        };
    }
    // Remap block references onto the new order.
    let mut remap = vec![0usize; count];
    for (new_index, &old_index) in order.iter().enumerate() {
        remap[old_index] = new_index;
    }
    let mut blocks: Vec<_> = std::mem::take(&mut function.blocks)
        .into_iter()
        .map(Some)
        .collect();
    function.blocks = order
        .iter()
        .map(|&old| blocks[old].take().expect("block placed twice"))
        .collect();
    for block in &mut function.blocks {
        for inst in &mut block.insts {
            for operand in &mut inst.operands {
                if let Value::Block(target) = operand {
                    *target = remap[*target];
                }
            }
        }
    }
}

/// Remove trailing jumps to the immediately following block.
pub fn elide_jumps(function: &mut Function) {
    let count = function.blocks.len();
    for index in 0..count {
        let falls_through = function.blocks[index]
            .insts
            .last()
            .is_some_and(|i| {
                i.op == MirOp::Jump && i.operands.first() == Some(&Value::Block(index + 1))
            });
        if falls_through {
            function.blocks[index].insts.pop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mir::{CallData, RegisterKind};

    fn jump(target: usize) -> Inst {
        Inst::new(MirOp::Jump, None, vec![Value::Block(target)], InstData::None)
    }

    fn ret() -> Inst {
        Inst::new(MirOp::Return, None, vec![], InstData::None)
    }

    #[test]
    fn test_elide_fallthrough_jump() {
        let mut f = Function::new("f");
        let a = f.add_block("a");
        let b = f.add_block("b");
        f.blocks[a].insts.push(jump(b));
        f.blocks[b].insts.push(ret());
        elide_jumps(&mut f);
        assert!(f.blocks[0].insts.is_empty());
        assert_eq!(f.blocks[1].insts.len(), 1);
    }

    #[test]
    fn test_jump_to_distant_block_kept() {
        let mut f = Function::new("f");
        let a = f.add_block("a");
        let b = f.add_block("b");
        let c = f.add_block("c");
        f.blocks[a].insts.push(jump(c));
        f.blocks[b].insts.push(ret());
        f.blocks[c].insts.push(ret());
        elide_jumps(&mut f);
        assert_eq!(f.blocks[0].insts.len(), 1);
    }

    #[test]
    fn test_reorder_chains_jump_targets() {
        let mut f = Function::new("f");
        let entry = f.add_block("entry");
        let cold = f.add_block("cold");
        let hot = f.add_block("hot");
        f.blocks[entry].insts.push(jump(hot));
        f.blocks[cold].insts.push(ret());
        f.blocks[hot].insts.push(jump(cold));
        reorder_blocks(&mut f);
        // entry, hot, cold — and the references are remapped.
        assert_eq!(f.blocks[0].name, "entry");
        assert_eq!(f.blocks[1].name, "hot");
        assert_eq!(f.blocks[2].name, "cold");
        assert_eq!(f.blocks[0].insts[0].operands[0], Value::Block(1));
        elide_jumps(&mut f);
        assert!(f.blocks[0].insts.is_empty());
        assert!(f.blocks[1].insts.is_empty());
    }

    #[test]
    fn test_self_tail_call_becomes_jump() {
        let mut f = Function::new("f");
        let arg = f.add_register(RegisterKind::Arg);
        let v = f.add_register(RegisterKind::Virtual);
        let w = f.callee_window(1)[0];
        let entry = f.add_block("entry");
        f.blocks[entry].insts.push(Inst::new(
            MirOp::Copy,
            Some(w),
            vec![Value::Const(1)],
            InstData::Width(8),
        ));
        f.blocks[entry].insts.push(Inst::new(
            MirOp::Call,
            None,
            vec![Value::Func(0), Value::Reg(w)],
            InstData::Call(CallData { arg_count: 1, ret_words: 1, reg_offset: 4 }),
        ));
        f.blocks[entry].insts.push(Inst::new(
            MirOp::Copy,
            Some(v),
            vec![Value::Reg(w)],
            InstData::Width(8),
        ));
        f.blocks[entry].insts.push(Inst::new(
            MirOp::Copy,
            Some(arg),
            vec![Value::Reg(v)],
            InstData::Width(8),
        ));
        f.blocks[entry].insts.push(ret());
        tail_call_opt(&mut f, 0);
        let ops: Vec<MirOp> = f.blocks[0].insts.iter().map(|i| i.op).collect();
        assert!(!ops.contains(&MirOp::Call));
        assert_eq!(*ops.last().unwrap(), MirOp::Jump);
        // The staged argument lands in the parameter register.
        let copy = f.blocks[0]
            .insts
            .iter()
            .find(|i| i.op == MirOp::Copy && i.dest == Some(arg))
            .unwrap();
        assert_eq!(copy.operands[0], Value::Reg(w));
    }

    #[test]
    fn test_tail_call_skipped_with_stack_frame() {
        let mut f = Function::new("f");
        let v = f.add_register(RegisterKind::Virtual);
        let entry = f.add_block("entry");
        f.blocks[entry]
            .insts
            .push(Inst::new(MirOp::LIncSP, Some(v), vec![Value::Const(8)], InstData::None));
        f.blocks[entry].insts.push(Inst::new(
            MirOp::Call,
            None,
            vec![Value::Func(0)],
            InstData::Call(CallData { arg_count: 0, ret_words: 0, reg_offset: 4 }),
        ));
        f.blocks[entry].insts.push(ret());
        tail_call_opt(&mut f, 0);
        assert!(f.blocks[0].insts.iter().any(|i| i.op == MirOp::Call));
    }
}
