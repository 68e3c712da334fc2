//! Mid-level SSA intermediate representation.
//!
//! A module owns functions; a function owns basic blocks and an arena of
//! values. Instructions are values; operands refer to values by id and every
//! value tracks its users, so the use/def graph needs no owning pointers.
//! Control flow analyses (dominators, post-dominators, loop nesting) are
//! cached per function and invalidated on CFG edits.

pub mod call_graph;
pub mod dominance;

use std::collections::HashMap;

pub use call_graph::SCCCallGraph;
pub use dominance::{DomTree, LoopNestingForest};

// ============================================================================
// Types
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TypeId(u32);

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Type {
    Void,
    Int { width: u32 },
    Float { width: u32 },
    Ptr,
    Struct { fields: Vec<TypeId> },
    Array { elem: TypeId, count: u64 },
}

/// Interning context for IR types, shared by a module.
#[derive(Debug, Default)]
pub struct Context {
    types: Vec<Type>,
    cache: HashMap<Type, TypeId>,
}

impl Context {
    pub fn new() -> Self {
        Context::default()
    }

    pub fn intern(&mut self, ty: Type) -> TypeId {
        if let Some(&id) = self.cache.get(&ty) {
            return id;
        }
        let id = TypeId(self.types.len() as u32);
        self.types.push(ty.clone());
        self.cache.insert(ty, id);
        id
    }

    pub fn void(&mut self) -> TypeId {
        self.intern(Type::Void)
    }

    pub fn int(&mut self, width: u32) -> TypeId {
        self.intern(Type::Int { width })
    }

    pub fn float(&mut self, width: u32) -> TypeId {
        self.intern(Type::Float { width })
    }

    pub fn ptr(&mut self) -> TypeId {
        self.intern(Type::Ptr)
    }

    pub fn ty(&self, id: TypeId) -> &Type {
        &self.types[id.0 as usize]
    }

    pub fn size_of(&self, id: TypeId) -> u64 {
        match self.ty(id) {
            Type::Void => 0,
            Type::Int { width } | Type::Float { width } => u64::from(*width).div_ceil(8),
            Type::Ptr => 8,
            Type::Array { elem, count } => self.size_of(*elem) * count,
            Type::Struct { fields } => {
                let mut size = 0;
                let mut align = 1;
                for &field in fields {
                    let a = self.align_of(field);
                    size = round_up(size, a);
                    size += self.size_of(field);
                    align = align.max(a);
                }
                round_up(size, align).max(1)
            }
        }
    }

    pub fn align_of(&self, id: TypeId) -> u64 {
        match self.ty(id) {
            Type::Void => 1,
            Type::Int { width } | Type::Float { width } => u64::from(*width).div_ceil(8),
            Type::Ptr => 8,
            Type::Array { elem, .. } => self.align_of(*elem),
            Type::Struct { fields } => {
                fields.iter().map(|&f| self.align_of(f)).max().unwrap_or(1)
            }
        }
    }

    /// Byte offset of struct field `index`.
    pub fn field_offset(&self, id: TypeId, index: usize) -> u64 {
        let Type::Struct { fields } = self.ty(id) else {
            panic!("field_offset on non-struct type");
        };
        let mut offset = 0;
        for (i, field) in fields.iter().enumerate() {
            offset = round_up(offset, self.align_of(*field));
            if i == index {
                return offset;
            }
            offset += self.size_of(*field);
        }
        panic!("field index out of range");
    }

    pub fn field_type(&self, id: TypeId, index: usize) -> TypeId {
        match self.ty(id) {
            Type::Struct { fields } => fields[index],
            Type::Array { elem, .. } => *elem,
            _ => panic!("field_type on non-aggregate type"),
        }
    }
}

fn round_up(value: u64, align: u64) -> u64 {
    debug_assert!(align > 0);
    value.div_ceil(align) * align
}

// ============================================================================
// Values and instructions
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ValueId(u32);

impl ValueId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId(pub u32);

impl BlockId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompareMode {
    Signed,
    Unsigned,
    Float,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompareOp {
    Less,
    LessEq,
    Greater,
    GreaterEq,
    Equal,
    NotEqual,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnaryArithOp {
    Negate,
    BitwiseNot,
    LogicalNot,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArithOp {
    Add,
    Sub,
    Mul,
    SDiv,
    UDiv,
    SRem,
    URem,
    FAdd,
    FSub,
    FMul,
    FDiv,
    LShL,
    LShR,
    AShR,
    And,
    Or,
    XOr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConvOp {
    Zext,
    Sext,
    Trunc,
    Fext,
    Ftrunc,
    StoF,
    UtoF,
    FtoS,
    FtoU,
    Bitcast,
}

/// Call target: another function in the module or a foreign function slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Callee {
    Function(usize),
    Foreign { slot: u8, index: u16 },
}

#[derive(Debug, Clone, PartialEq)]
pub enum InstKind {
    /// Reserve `count * sizeof(allocated)` bytes of stack; yields a pointer.
    Alloca { allocated: TypeId, count: ValueId },
    Load { address: ValueId },
    Store { address: ValueId, value: ValueId },
    Compare { mode: CompareMode, op: CompareOp, lhs: ValueId, rhs: ValueId },
    UnaryArith { op: UnaryArithOp, operand: ValueId },
    Arith { op: ArithOp, lhs: ValueId, rhs: ValueId },
    Conv { op: ConvOp, operand: ValueId },
    Call { callee: Callee, args: Vec<ValueId> },
    Phi { incoming: Vec<(BlockId, ValueId)> },
    /// `base + index * sizeof(pointee) + offsetof(members...)`
    GetElementPointer {
        pointee: TypeId,
        base: ValueId,
        index: ValueId,
        members: Vec<usize>,
    },
    ExtractValue { aggregate: ValueId, indices: Vec<usize> },
    InsertValue { aggregate: ValueId, value: ValueId, indices: Vec<usize> },
    Select { cond: ValueId, then_value: ValueId, else_value: ValueId },
    // Terminators
    Goto { target: BlockId },
    Branch { cond: ValueId, then_block: BlockId, else_block: BlockId },
    Return { value: Option<ValueId> },
}

impl InstKind {
    pub fn is_terminator(&self) -> bool {
        matches!(
            self,
            InstKind::Goto { .. } | InstKind::Branch { .. } | InstKind::Return { .. }
        )
    }

    /// Value operands, in order.
    pub fn operands(&self) -> Vec<ValueId> {
        use InstKind::*;
        match self {
            Alloca { count, .. } => vec![*count],
            Load { address } => vec![*address],
            Store { address, value } => vec![*address, *value],
            Compare { lhs, rhs, .. } | Arith { lhs, rhs, .. } => vec![*lhs, *rhs],
            UnaryArith { operand, .. } | Conv { operand, .. } => vec![*operand],
            Call { args, .. } => args.clone(),
            Phi { incoming } => incoming.iter().map(|(_, v)| *v).collect(),
            GetElementPointer { base, index, .. } => vec![*base, *index],
            ExtractValue { aggregate, .. } => vec![*aggregate],
            InsertValue { aggregate, value, .. } => vec![*aggregate, *value],
            Select { cond, then_value, else_value } => vec![*cond, *then_value, *else_value],
            Goto { .. } => vec![],
            Branch { cond, .. } => vec![*cond],
            Return { value } => value.iter().copied().collect(),
        }
    }

    /// Successor blocks of a terminator.
    pub fn successors(&self) -> Vec<BlockId> {
        match self {
            InstKind::Goto { target } => vec![*target],
            InstKind::Branch { then_block, else_block, .. } => vec![*then_block, *else_block],
            _ => vec![],
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ValueKind {
    Param { index: usize },
    IntConst { value: u64 },
    FloatConst { bits: u64 },
    Undef,
    /// Address of a module data constant.
    GlobalData { index: usize },
    Inst { block: BlockId, op: InstKind },
}

#[derive(Debug)]
pub struct ValueData {
    pub name: String,
    pub ty: TypeId,
    pub kind: ValueKind,
    users: Vec<ValueId>,
}

#[derive(Debug, Default)]
pub struct Block {
    pub name: String,
    pub insts: Vec<ValueId>,
    pub preds: Vec<BlockId>,
}

/// Appends `.N` suffixes to duplicate names and recycles erased ones.
#[derive(Debug, Default)]
struct NameFactory {
    live: HashMap<String, u32>,
}

impl NameFactory {
    fn make_unique(&mut self, name: &str) -> String {
        let name = if name.is_empty() { "tmp" } else { name };
        match self.live.get_mut(name) {
            None => {
                self.live.insert(name.to_string(), 0);
                name.to_string()
            }
            Some(counter) => {
                *counter += 1;
                format!("{}.{}", name, counter)
            }
        }
    }

    fn erase(&mut self, name: &str) {
        let base = name.split('.').next().unwrap_or(name);
        if name == base {
            self.live.remove(base);
        }
    }
}

pub struct Function {
    pub name: String,
    pub return_type: TypeId,
    pub params: Vec<ValueId>,
    values: Vec<ValueData>,
    blocks: Vec<Block>,
    /// Blocks in layout order; the first is the entry.
    pub block_order: Vec<BlockId>,
    names: NameFactory,
    dom_tree: Option<DomTree>,
    post_dom_tree: Option<DomTree>,
    loop_forest: Option<LoopNestingForest>,
}

impl Function {
    pub fn new(name: &str, param_types: &[TypeId], return_type: TypeId) -> Self {
        let mut function = Function {
            name: name.to_string(),
            return_type,
            params: Vec::new(),
            values: Vec::new(),
            blocks: Vec::new(),
            block_order: Vec::new(),
            names: NameFactory::default(),
            dom_tree: None,
            post_dom_tree: None,
            loop_forest: None,
        };
        for (index, &ty) in param_types.iter().enumerate() {
            let id = function.add_value(&format!("arg{index}"), ty, ValueKind::Param { index });
            function.params.push(id);
        }
        function
    }

    fn add_value(&mut self, name: &str, ty: TypeId, kind: ValueKind) -> ValueId {
        let unique = self.names.make_unique(name);
        let id = ValueId(self.values.len() as u32);
        self.values.push(ValueData { name: unique, ty, kind, users: Vec::new() });
        id
    }

    pub fn value(&self, id: ValueId) -> &ValueData {
        &self.values[id.index()]
    }

    pub fn users(&self, id: ValueId) -> &[ValueId] {
        &self.values[id.index()].users
    }

    pub fn value_ids(&self) -> impl Iterator<Item = ValueId> {
        (0..self.values.len() as u32).map(ValueId)
    }

    pub fn int_const(&mut self, ty: TypeId, value: u64) -> ValueId {
        self.add_value("const", ty, ValueKind::IntConst { value })
    }

    pub fn float_const(&mut self, ty: TypeId, bits: u64) -> ValueId {
        self.add_value("const", ty, ValueKind::FloatConst { bits })
    }

    pub fn undef(&mut self, ty: TypeId) -> ValueId {
        self.add_value("undef", ty, ValueKind::Undef)
    }

    pub fn global_data(&mut self, ty: TypeId, index: usize) -> ValueId {
        self.add_value("data", ty, ValueKind::GlobalData { index })
    }

    pub fn add_block(&mut self, name: &str) -> BlockId {
        let unique = self.names.make_unique(name);
        let id = BlockId(self.blocks.len() as u32);
        self.blocks.push(Block { name: unique, ..Block::default() });
        self.block_order.push(id);
        self.invalidate_cfg_analyses();
        id
    }

    pub fn block(&self, id: BlockId) -> &Block {
        &self.blocks[id.index()]
    }

    pub fn entry(&self) -> BlockId {
        self.block_order[0]
    }

    /// The block's terminator, if it has one yet.
    pub fn terminator(&self, block: BlockId) -> Option<&InstKind> {
        let &last = self.blocks[block.index()].insts.last()?;
        match &self.values[last.index()].kind {
            ValueKind::Inst { op, .. } if op.is_terminator() => Some(op),
            _ => None,
        }
    }

    pub fn successors(&self, block: BlockId) -> Vec<BlockId> {
        self.terminator(block).map(|t| t.successors()).unwrap_or_default()
    }

    /// Append an instruction to `block`, maintaining user lists and
    /// predecessor edges.
    pub fn add_inst(&mut self, block: BlockId, name: &str, ty: TypeId, op: InstKind) -> ValueId {
        debug_assert!(
            self.terminator(block).is_none(),
            "appending to a terminated block"
        );
        let operands = op.operands();
        let successors = op.successors();
        let is_terminator = op.is_terminator();
        let id = self.add_value(name, ty, ValueKind::Inst { block, op });
        for operand in operands {
            self.values[operand.index()].users.push(id);
        }
        self.blocks[block.index()].insts.push(id);
        if is_terminator {
            for succ in successors {
                self.blocks[succ.index()].preds.push(block);
            }
            self.invalidate_cfg_analyses();
        }
        id
    }

    /// Remove an instruction (which must be unused), unhooking operands,
    /// predecessor edges and its name.
    pub fn erase_inst(&mut self, id: ValueId) {
        debug_assert!(self.values[id.index()].users.is_empty(), "erasing a used value");
        let ValueKind::Inst { block, op } = self.values[id.index()].kind.clone() else {
            panic!("erase_inst on a non-instruction");
        };
        for operand in op.operands() {
            self.values[operand.index()].users.retain(|&u| u != id);
        }
        if op.is_terminator() {
            for succ in op.successors() {
                self.blocks[succ.index()].preds.retain(|&p| p != block);
            }
            self.invalidate_cfg_analyses();
        }
        self.blocks[block.index()].insts.retain(|&i| i != id);
        let name = self.values[id.index()].name.clone();
        self.names.erase(&name);
        self.values[id.index()].kind = ValueKind::Undef;
    }

    /// Blocks in reverse post order from the entry.
    pub fn reverse_post_order(&self) -> Vec<BlockId> {
        let mut visited = vec![false; self.blocks.len()];
        let mut postorder = Vec::new();
        let mut stack = vec![(self.entry(), 0usize)];
        visited[self.entry().index()] = true;
        while let Some((block, next)) = stack.last().copied() {
            let succs = self.successors(block);
            if next < succs.len() {
                stack.last_mut().unwrap().1 += 1;
                let succ = succs[next];
                if !visited[succ.index()] {
                    visited[succ.index()] = true;
                    stack.push((succ, 0));
                }
            } else {
                postorder.push(block);
                stack.pop();
            }
        }
        postorder.reverse();
        postorder
    }

    fn invalidate_cfg_analyses(&mut self) {
        self.dom_tree = None;
        self.post_dom_tree = None;
        self.loop_forest = None;
    }

    pub fn dom_tree(&mut self) -> &DomTree {
        if self.dom_tree.is_none() {
            self.dom_tree = Some(DomTree::compute(self));
        }
        self.dom_tree.as_ref().unwrap()
    }

    pub fn post_dom_tree(&mut self) -> &DomTree {
        if self.post_dom_tree.is_none() {
            self.post_dom_tree = Some(DomTree::compute_post(self));
        }
        self.post_dom_tree.as_ref().unwrap()
    }

    pub fn loop_nesting_forest(&mut self) -> &LoopNestingForest {
        if self.loop_forest.is_none() {
            let dom = DomTree::compute(self);
            self.loop_forest = Some(LoopNestingForest::compute(self, &dom));
        }
        self.loop_forest.as_ref().unwrap()
    }

    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    /// Check the SSA well-formedness invariants; returns a description of
    /// the first violation.
    pub fn verify(&self) -> Result<(), String> {
        for &block in &self.block_order {
            let insts = &self.blocks[block.index()].insts;
            match insts.last() {
                None => return Err(format!("block {} is empty", self.block(block).name)),
                Some(&last) => {
                    let ValueKind::Inst { op, .. } = &self.values[last.index()].kind else {
                        unreachable!()
                    };
                    if !op.is_terminator() {
                        return Err(format!(
                            "block {} does not end in a terminator",
                            self.block(block).name
                        ));
                    }
                }
            }
            for (i, &inst) in insts.iter().enumerate() {
                let ValueKind::Inst { op, .. } = &self.values[inst.index()].kind else {
                    return Err("non-instruction in block".to_string());
                };
                if op.is_terminator() && i + 1 != insts.len() {
                    return Err(format!(
                        "terminator in the middle of block {}",
                        self.block(block).name
                    ));
                }
                // Every operand must list this instruction as a user.
                for operand in op.operands() {
                    if !self.values[operand.index()].users.contains(&inst) {
                        return Err(format!(
                            "use of {} by {} is missing from the user list",
                            self.values[operand.index()].name,
                            self.values[inst.index()].name
                        ));
                    }
                }
                if let InstKind::Phi { incoming } = op {
                    let mut preds = self.blocks[block.index()].preds.clone();
                    preds.sort();
                    let mut sources: Vec<_> = incoming.iter().map(|(b, _)| *b).collect();
                    sources.sort();
                    if preds != sources {
                        return Err(format!(
                            "phi {} does not cover the predecessors of {}",
                            self.values[inst.index()].name,
                            self.block(block).name
                        ));
                    }
                }
            }
            // Predecessor edges must match terminator targets.
            for succ in self.successors(block) {
                if !self.blocks[succ.index()].preds.contains(&block) {
                    return Err(format!(
                        "missing predecessor edge {} -> {}",
                        self.block(block).name,
                        self.block(succ).name
                    ));
                }
            }
        }
        // User lists may only contain real instructions that actually use
        // the value.
        for id in self.value_ids() {
            for &user in self.users(id) {
                let ValueKind::Inst { op, .. } = &self.values[user.index()].kind else {
                    return Err(format!("user of {} is not an instruction", self.value(id).name));
                };
                if !op.operands().contains(&id) {
                    return Err(format!(
                        "{} lists {} as a user but is not an operand",
                        self.value(id).name,
                        self.values[user.index()].name
                    ));
                }
            }
        }
        Ok(())
    }
}

/// A named byte constant placed in the program's data section.
#[derive(Debug)]
pub struct DataConstant {
    pub name: String,
    pub bytes: Vec<u8>,
}

pub struct Module {
    pub ctx: Context,
    pub functions: Vec<Function>,
    pub constants: Vec<DataConstant>,
}

impl Module {
    pub fn new() -> Self {
        Module { ctx: Context::new(), functions: Vec::new(), constants: Vec::new() }
    }

    pub fn add_constant(&mut self, name: &str, bytes: Vec<u8>) -> usize {
        self.constants.push(DataConstant { name: name.to_string(), bytes });
        self.constants.len() - 1
    }

    pub fn function_index(&self, name: &str) -> Option<usize> {
        self.functions.iter().position(|f| f.name == name)
    }
}

impl Default for Module {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn simple_function(ctx: &mut Context) -> Function {
        let i64 = ctx.int(64);
        let mut f = Function::new("f", &[i64], i64);
        let entry = f.add_block("entry");
        let one = f.int_const(i64, 1);
        let arg = f.params[0];
        let sum = f.add_inst(
            entry,
            "sum",
            i64,
            InstKind::Arith { op: ArithOp::Add, lhs: arg, rhs: one },
        );
        f.add_inst(entry, "", ctx.void(), InstKind::Return { value: Some(sum) });
        f
    }

    #[test]
    fn test_user_lists_track_operands() {
        let mut ctx = Context::new();
        let f = simple_function(&mut ctx);
        let arg = f.params[0];
        assert_eq!(f.users(arg).len(), 1);
        assert!(f.verify().is_ok());
    }

    #[test]
    fn test_name_factory_uniques() {
        let mut ctx = Context::new();
        let i64 = ctx.int(64);
        let mut f = Function::new("f", &[], i64);
        let entry = f.add_block("entry");
        let zero = f.int_const(i64, 0);
        let a = f.add_inst(entry, "x", i64, InstKind::Arith {
            op: ArithOp::Add,
            lhs: zero,
            rhs: zero,
        });
        let b = f.add_inst(entry, "x", i64, InstKind::Arith {
            op: ArithOp::Add,
            lhs: zero,
            rhs: zero,
        });
        assert_eq!(f.value(a).name, "x");
        assert_eq!(f.value(b).name, "x.1");
    }

    #[test]
    fn test_preds_follow_terminators() {
        let mut ctx = Context::new();
        let void = ctx.void();
        let i1 = ctx.int(1);
        let mut f = Function::new("f", &[i1], void);
        let entry = f.add_block("entry");
        let then_b = f.add_block("then");
        let else_b = f.add_block("else");
        let cond = f.params[0];
        f.add_inst(entry, "", void, InstKind::Branch {
            cond,
            then_block: then_b,
            else_block: else_b,
        });
        f.add_inst(then_b, "", void, InstKind::Return { value: None });
        f.add_inst(else_b, "", void, InstKind::Return { value: None });
        assert_eq!(f.block(then_b).preds, vec![entry]);
        assert_eq!(f.block(else_b).preds, vec![entry]);
        assert!(f.verify().is_ok());
    }

    #[test]
    fn test_phi_invariant_checked() {
        let mut ctx = Context::new();
        let void = ctx.void();
        let i64 = ctx.int(64);
        let mut f = Function::new("f", &[], i64);
        let entry = f.add_block("entry");
        let exit = f.add_block("exit");
        f.add_inst(entry, "", void, InstKind::Goto { target: exit });
        let one = f.int_const(i64, 1);
        // Phi with a bogus incoming block.
        f.add_inst(exit, "phi", i64, InstKind::Phi {
            incoming: vec![(BlockId(0), one), (BlockId(1), one)],
        });
        f.add_inst(exit, "", void, InstKind::Return { value: Some(one) });
        assert!(f.verify().is_err());
    }

    #[test]
    fn test_erase_recycles_names_and_users() {
        let mut ctx = Context::new();
        let i64 = ctx.int(64);
        let mut f = Function::new("f", &[], i64);
        let entry = f.add_block("entry");
        let zero = f.int_const(i64, 0);
        let x = f.add_inst(entry, "x", i64, InstKind::Arith {
            op: ArithOp::Add,
            lhs: zero,
            rhs: zero,
        });
        f.erase_inst(x);
        assert!(f.users(zero).is_empty());
        let y = f.add_inst(entry, "x", i64, InstKind::Arith {
            op: ArithOp::Add,
            lhs: zero,
            rhs: zero,
        });
        assert_eq!(f.value(y).name, "x");
    }

    #[test]
    fn test_struct_layout() {
        let mut ctx = Context::new();
        let i64 = ctx.int(64);
        let i8 = ctx.int(8);
        let s = ctx.intern(Type::Struct { fields: vec![i8, i64, i8] });
        assert_eq!(ctx.size_of(s), 24);
        assert_eq!(ctx.align_of(s), 8);
        assert_eq!(ctx.field_offset(s, 0), 0);
        assert_eq!(ctx.field_offset(s, 1), 8);
        assert_eq!(ctx.field_offset(s, 2), 16);
    }

    #[test]
    fn test_reverse_post_order_starts_at_entry() {
        let mut ctx = Context::new();
        let void = ctx.void();
        let mut f = Function::new("f", &[], void);
        let entry = f.add_block("entry");
        let a = f.add_block("a");
        let b = f.add_block("b");
        f.add_inst(entry, "", void, InstKind::Goto { target: a });
        f.add_inst(a, "", void, InstKind::Goto { target: b });
        f.add_inst(b, "", void, InstKind::Return { value: None });
        assert_eq!(f.reverse_post_order(), vec![entry, a, b]);
    }
}
