//! Register allocation.
//!
//! Rewrites three-address arithmetic into two-address form, computes
//! per-block liveness, builds the interference graph, colors it greedily and
//! binds virtual registers to hardware indices. The three call-metadata
//! slots and the callee window are appended past the colored registers, and
//! every call's register-window offset is fixed up accordingly.

use std::collections::{HashMap, HashSet};

use crate::mir::{
    Condition, Function, Inst, InstData, MirArithOp, MirOp, RegId, RegisterKind, Value,
    NUM_REGS_FOR_CALL_METADATA,
};

/// Run the whole allocation pipeline on one function.
pub fn allocate_registers(function: &mut Function) {
    rewrite_two_address(function);
    coalesce_copies(function);
    let live_out = compute_live_sets(function);
    let interference = build_interference(function, &live_out);
    let colors = color_graph(function, &interference);
    let local_count = bind_registers(function, colors);
    fixup_calls(function, local_count);
    simplify_copies(function);
}

/// Merge copy-related registers that do not interfere, rewriting the whole
/// function onto the representatives. Arg registers win merges so their
/// precoloring survives; the callee window never participates.
fn coalesce_copies(function: &mut Function) {
    let live_out = compute_live_sets(function);
    let mut adjacency = build_interference(function, &live_out);
    let mut parent: Vec<u32> = (0..function.register_count() as u32).collect();

    fn find(parent: &mut [u32], reg: RegId) -> RegId {
        let mut r = reg.0;
        while parent[r as usize] != r {
            parent[r as usize] = parent[parent[r as usize] as usize];
            r = parent[r as usize];
        }
        RegId(r)
    }

    let copies: Vec<(RegId, RegId)> = function
        .blocks
        .iter()
        .flat_map(|b| b.insts.iter())
        .filter(|i| i.op == MirOp::Copy)
        .filter_map(|i| Some((i.dest?, i.operands.first()?.reg()?)))
        .collect();
    for (dest, source) in copies {
        if function.register(dest).kind == RegisterKind::Callee
            || function.register(source).kind == RegisterKind::Callee
        {
            continue;
        }
        let d = find(&mut parent, dest);
        let s = find(&mut parent, source);
        if d == s {
            continue;
        }
        let d_arg = function.register(d).kind == RegisterKind::Arg;
        let s_arg = function.register(s).kind == RegisterKind::Arg;
        if d_arg && s_arg {
            continue;
        }
        let interferes = adjacency
            .get(&d)
            .map(|ns| ns.iter().any(|&n| find(&mut parent, n) == s))
            .unwrap_or(false);
        if interferes {
            continue;
        }
        let (rep, other) = if s_arg { (s, d) } else { (d, s) };
        parent[other.0 as usize] = rep.0;
        let moved: Vec<RegId> = adjacency.remove(&other).into_iter().flatten().collect();
        for neighbor in moved {
            let neighbor = find(&mut parent, neighbor);
            if neighbor != rep {
                adjacency.entry(rep).or_default().insert(neighbor);
                adjacency.entry(neighbor).or_default().insert(rep);
            }
        }
    }

    // Rewrite every register reference onto its representative.
    for block in &mut function.blocks {
        for inst in &mut block.insts {
            if let Some(dest) = inst.dest.as_mut() {
                *dest = find(&mut parent, *dest);
            }
            for operand in &mut inst.operands {
                match operand {
                    Value::Reg(r) => *r = find(&mut parent, *r),
                    Value::Addr(addr) => {
                        addr.base = find(&mut parent, addr.base);
                        if let Some(index) = addr.index.as_mut() {
                            *index = find(&mut parent, *index);
                        }
                    }
                    _ => {}
                }
            }
        }
    }
    // Drop the now-trivial copies.
    for block in &mut function.blocks {
        block.insts.retain(|inst| {
            !(inst.op == MirOp::Copy
                && inst.dest.map(Value::Reg) == inst.operands.first().copied())
        });
    }
}

/// Step 1: make the destination of arithmetic, unary arithmetic and
/// conversions alias the first operand, as the instruction encodings
/// require.
fn rewrite_two_address(function: &mut Function) {
    for block in &mut function.blocks {
        let mut rewritten = Vec::with_capacity(block.insts.len());
        for mut inst in block.insts.drain(..) {
            if matches!(inst.op, MirOp::Arith | MirOp::UnaryArith | MirOp::Conversion) {
                let dest = inst.dest.expect("arithmetic without destination");
                let op0 = inst.operands[0];
                if op0 != Value::Reg(dest) {
                    rewritten.push(Inst::new(
                        MirOp::Copy,
                        Some(dest),
                        vec![op0],
                        InstData::Width(8),
                    ));
                    inst.operands[0] = Value::Reg(dest);
                }
            }
            rewritten.push(inst);
        }
        block.insts = rewritten;
    }
}

/// Successor block indices, read off the trailing jumps.
fn successors(block: &crate::mir::Block) -> Vec<usize> {
    let mut succs = Vec::new();
    for inst in block.insts.iter().rev() {
        match inst.op {
            MirOp::Jump | MirOp::CJump => {
                if let Some(Value::Block(target)) = inst.operands.first() {
                    succs.push(*target);
                }
            }
            MirOp::Return => {}
            _ => break,
        }
    }
    succs
}

/// Step 2: backward liveness to a fixpoint; returns live-out per block.
pub fn compute_live_sets(function: &Function) -> Vec<HashSet<RegId>> {
    let block_count = function.blocks.len();
    let mut live_in: Vec<HashSet<RegId>> = vec![HashSet::new(); block_count];
    let mut live_out: Vec<HashSet<RegId>> = vec![HashSet::new(); block_count];
    let mut changed = true;
    while changed {
        changed = false;
        for index in (0..block_count).rev() {
            let mut out = HashSet::new();
            for succ in successors(&function.blocks[index]) {
                out.extend(live_in[succ].iter().copied());
            }
            let mut live = out.clone();
            for inst in function.blocks[index].insts.iter().rev() {
                if let Some(dest) = inst.dest {
                    live.remove(&dest);
                }
                live.extend(inst.used_regs());
            }
            if out != live_out[index] || live != live_in[index] {
                live_out[index] = out;
                live_in[index] = live;
                changed = true;
            }
        }
    }
    live_out
}

/// Step 3: edges between registers simultaneously live at any program
/// point.
fn build_interference(
    function: &Function,
    live_out: &[HashSet<RegId>],
) -> HashMap<RegId, HashSet<RegId>> {
    let colorable = |reg: RegId| {
        matches!(
            function.register(reg).kind,
            RegisterKind::Virtual | RegisterKind::Arg
        )
    };
    let mut graph: HashMap<RegId, HashSet<RegId>> = HashMap::new();
    for reg in (0..function.register_count() as u32).map(RegId) {
        if colorable(reg) {
            graph.entry(reg).or_default();
        }
    }
    for (index, block) in function.blocks.iter().enumerate() {
        let mut live = live_out[index].clone();
        for inst in block.insts.iter().rev() {
            if let Some(dest) = inst.dest {
                if colorable(dest) {
                    for &other in &live {
                        if other != dest && colorable(other) {
                            graph.entry(dest).or_default().insert(other);
                            graph.entry(other).or_default().insert(dest);
                        }
                    }
                }
                live.remove(&dest);
            }
            live.extend(inst.used_regs());
        }
    }
    graph
}

/// Step 4: greedy coloring, highest degree first. Arg registers are
/// precolored to their window position.
fn color_graph(
    function: &Function,
    interference: &HashMap<RegId, HashSet<RegId>>,
) -> HashMap<RegId, u8> {
    let mut colors: HashMap<RegId, u8> = HashMap::new();
    for &arg in &function.arg_regs {
        colors.insert(arg, function.register(arg).assigned.expect("arg is precolored"));
    }
    let mut order: Vec<RegId> = interference
        .keys()
        .copied()
        .filter(|r| function.register(*r).kind == RegisterKind::Virtual)
        .collect();
    order.sort_by_key(|r| {
        (
            std::cmp::Reverse(interference.get(r).map(HashSet::len).unwrap_or(0)),
            r.0,
        )
    });
    for reg in order {
        let neighbors = interference.get(&reg);
        let mut taken: Vec<u8> = neighbors
            .map(|ns| ns.iter().filter_map(|n| colors.get(n).copied()).collect())
            .unwrap_or_default();
        taken.sort_unstable();
        let mut color = 0u8;
        for t in taken {
            if t == color {
                color += 1;
            } else if t > color {
                break;
            }
        }
        colors.insert(reg, color);
    }
    colors
}

/// Step 5/6: bind colors, then append the call metadata slots and the
/// callee window past them. Returns the number of colored local registers.
fn bind_registers(function: &mut Function, colors: HashMap<RegId, u8>) -> usize {
    let mut local_count = function.arg_regs.len();
    for (&reg, &color) in &colors {
        function.assign(reg, color);
        local_count = local_count.max(color as usize + 1);
    }
    let callee_base = local_count + NUM_REGS_FOR_CALL_METADATA;
    let callee_regs = function.callee_regs.clone();
    for (offset, reg) in callee_regs.into_iter().enumerate() {
        let hw = callee_base + offset;
        assert!(hw <= u8::MAX as usize, "register pressure exceeds the 8-bit register indices");
        function.assign(reg, hw as u8);
    }
    function.hardware_reg_count = callee_base + function.callee_regs.len();
    local_count
}

/// Step 7: the callee's window starts past the metadata slots.
fn fixup_calls(function: &mut Function, local_count: usize) {
    let reg_offset = local_count + NUM_REGS_FOR_CALL_METADATA;
    for block in &mut function.blocks {
        for inst in &mut block.insts {
            if let InstData::Call(data) = &mut inst.data {
                data.reg_offset = reg_offset;
            }
        }
    }
}

/// Erase copies whose source and destination got the same slot; rewrite
/// zero loads into the short `xor reg, reg` form.
fn simplify_copies(function: &mut Function) {
    for index in 0..function.blocks.len() {
        let insts = std::mem::take(&mut function.blocks[index].insts);
        let mut kept = Vec::with_capacity(insts.len());
        for mut inst in insts {
            if inst.op == MirOp::Copy {
                let dest = inst.dest.expect("copy without destination");
                match inst.operands[0] {
                    Value::Reg(source)
                        if function.hw(source) == function.hw(dest) =>
                    {
                        continue;
                    }
                    Value::Const(0) => {
                        inst = Inst::new(
                            MirOp::Arith,
                            Some(dest),
                            vec![Value::Reg(dest), Value::Reg(dest)],
                            InstData::Arith(MirArithOp::XOr),
                        );
                    }
                    _ => {}
                }
            }
            kept.push(inst);
        }
        function.blocks[index].insts = kept;
    }
}

/// Check that no two simultaneously live registers share a hardware slot;
/// used by tests and debug assertions.
pub fn verify_coloring(function: &Function) -> Result<(), String> {
    let live_out = compute_live_sets(function);
    for (index, block) in function.blocks.iter().enumerate() {
        let mut live = live_out[index].clone();
        for inst in block.insts.iter().rev() {
            if let Some(dest) = inst.dest {
                if function.register(dest).kind != RegisterKind::Callee {
                    for &other in &live {
                        if other != dest
                            && function.register(other).kind != RegisterKind::Callee
                            && function.hw(other) == function.hw(dest)
                        {
                            return Err(format!(
                                "registers {:?} and {:?} share slot {}",
                                dest,
                                other,
                                function.hw(dest)
                            ));
                        }
                    }
                }
                live.remove(&dest);
            }
            live.extend(inst.used_regs());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mir::{CallData, MemoryAddress};

    /// dest = a + b over three virtual registers.
    fn arith_function() -> (Function, RegId, RegId, RegId) {
        let mut f = Function::new("f");
        let a = f.add_register(RegisterKind::Arg);
        let b = f.add_register(RegisterKind::Arg);
        let v = f.add_register(RegisterKind::Virtual);
        let block = f.add_block("entry");
        f.blocks[block].insts.push(Inst::new(
            MirOp::Arith,
            Some(v),
            vec![Value::Reg(a), Value::Reg(b)],
            InstData::Arith(MirArithOp::Add),
        ));
        f.blocks[block].insts.push(Inst::new(
            MirOp::Copy,
            Some(a),
            vec![Value::Reg(v)],
            InstData::Width(8),
        ));
        f.blocks[block]
            .insts
            .push(Inst::new(MirOp::Return, None, vec![Value::Reg(a)], InstData::None));
        (f, a, b, v)
    }

    #[test]
    fn test_two_address_rewrite_inserts_copy() {
        let (mut f, _, _, v) = arith_function();
        rewrite_two_address(&mut f);
        let insts = &f.blocks[0].insts;
        assert_eq!(insts[0].op, MirOp::Copy);
        assert_eq!(insts[0].dest, Some(v));
        assert_eq!(insts[1].op, MirOp::Arith);
        assert_eq!(insts[1].operands[0], Value::Reg(v));
    }

    #[test]
    fn test_liveness_flows_backward() {
        let (mut f, a, b, _) = arith_function();
        rewrite_two_address(&mut f);
        let live_out = compute_live_sets(&f);
        // Nothing lives past the return.
        assert!(live_out[0].is_empty());
        let interference = build_interference(&f, &live_out);
        // a and b are both live into the first instruction.
        assert!(interference[&a].contains(&b) || interference[&b].contains(&a));
    }

    #[test]
    fn test_allocation_produces_valid_coloring() {
        let (mut f, ..) = arith_function();
        allocate_registers(&mut f);
        assert!(verify_coloring(&f).is_ok());
        assert!(f.hardware_reg_count >= 2 + NUM_REGS_FOR_CALL_METADATA);
    }

    #[test]
    fn test_zero_copy_becomes_xor() {
        let mut f = Function::new("f");
        let v = f.add_register(RegisterKind::Virtual);
        let block = f.add_block("entry");
        f.blocks[block].insts.push(Inst::new(
            MirOp::Copy,
            Some(v),
            vec![Value::Const(0)],
            InstData::Width(8),
        ));
        f.blocks[block]
            .insts
            .push(Inst::new(MirOp::Return, None, vec![Value::Reg(v)], InstData::None));
        allocate_registers(&mut f);
        let insts = &f.blocks[0].insts;
        assert_eq!(insts[0].op, MirOp::Arith);
        assert_eq!(insts[0].data, InstData::Arith(MirArithOp::XOr));
        assert_eq!(insts[0].operands[0], insts[0].operands[1]);
    }

    #[test]
    fn test_self_copy_erased_after_coalescing() {
        let mut f = Function::new("f");
        let a = f.add_register(RegisterKind::Virtual);
        let b = f.add_register(RegisterKind::Virtual);
        let block = f.add_block("entry");
        // b = a; return b — a and b can share a slot, erasing the copy.
        f.blocks[block].insts.push(Inst::new(
            MirOp::Copy,
            Some(a),
            vec![Value::Const(7)],
            InstData::Width(8),
        ));
        f.blocks[block].insts.push(Inst::new(
            MirOp::Copy,
            Some(b),
            vec![Value::Reg(a)],
            InstData::Width(8),
        ));
        f.blocks[block]
            .insts
            .push(Inst::new(MirOp::Return, None, vec![Value::Reg(b)], InstData::None));
        allocate_registers(&mut f);
        let copies = f.blocks[0]
            .insts
            .iter()
            .filter(|i| i.op == MirOp::Copy && i.operands[0].reg().is_some())
            .count();
        assert_eq!(copies, 0, "the coalesced self copy should be erased");
    }

    #[test]
    fn test_call_reg_offset_past_metadata() {
        let mut f = Function::new("f");
        let v = f.add_register(RegisterKind::Virtual);
        let w = f.callee_window(1)[0];
        let block = f.add_block("entry");
        f.blocks[block].insts.push(Inst::new(
            MirOp::Copy,
            Some(v),
            vec![Value::Const(1)],
            InstData::Width(8),
        ));
        f.blocks[block].insts.push(Inst::new(
            MirOp::Copy,
            Some(w),
            vec![Value::Reg(v)],
            InstData::Width(8),
        ));
        f.blocks[block].insts.push(Inst::new(
            MirOp::Call,
            None,
            vec![Value::Func(0), Value::Reg(w)],
            InstData::Call(CallData { arg_count: 1, ret_words: 0, reg_offset: 0 }),
        ));
        f.blocks[block]
            .insts
            .push(Inst::new(MirOp::Return, None, vec![], InstData::None));
        allocate_registers(&mut f);
        let call = f.blocks[0]
            .insts
            .iter()
            .find(|i| i.op == MirOp::Call)
            .unwrap();
        let InstData::Call(data) = &call.data else { panic!() };
        assert!(data.reg_offset >= 1 + NUM_REGS_FOR_CALL_METADATA);
        // The callee window register sits exactly at the offset.
        assert_eq!(f.hw(w) as usize, data.reg_offset);
    }

    #[test]
    fn test_interference_respects_addresses() {
        let mut f = Function::new("f");
        let base = f.add_register(RegisterKind::Virtual);
        let value = f.add_register(RegisterKind::Virtual);
        let block = f.add_block("entry");
        f.blocks[block].insts.push(Inst::new(
            MirOp::Copy,
            Some(base),
            vec![Value::Const(64)],
            InstData::Width(8),
        ));
        f.blocks[block].insts.push(Inst::new(
            MirOp::Copy,
            Some(value),
            vec![Value::Const(9)],
            InstData::Width(8),
        ));
        f.blocks[block].insts.push(Inst::new(
            MirOp::Store,
            None,
            vec![
                Value::Addr(MemoryAddress { base, index: None, scale: 0, offset: 0 }),
                Value::Reg(value),
            ],
            InstData::Width(8),
        ));
        f.blocks[block]
            .insts
            .push(Inst::new(MirOp::Return, None, vec![], InstData::None));
        allocate_registers(&mut f);
        assert_ne!(f.hw(base), f.hw(value));
        assert!(verify_coloring(&f).is_ok());
    }

    #[test]
    fn test_condition_enum_is_closed() {
        // Guard against accidental reordering; the assembler maps these to
        // jump opcodes positionally.
        let all = [
            Condition::Equal,
            Condition::NotEqual,
            Condition::Less,
            Condition::LessEq,
            Condition::Greater,
            Condition::GreaterEq,
        ];
        assert_eq!(all.len(), 6);
    }
}
