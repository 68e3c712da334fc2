//! AST to SSA lowering.
//!
//! Locals live in allocas and are accessed through loads and stores; control
//! flow lowers to explicit blocks with phi nodes joining value-producing
//! branches; cleanup stacks emit destructor calls on every exit path.

use std::collections::HashMap;

use scatha_core::Builtin;

use crate::ast::*;
use crate::ir::{
    ArithOp, BlockId, Callee, CompareMode, CompareOp, Context, ConvOp, Function, InstKind,
    Module, Type, TypeId, UnaryArithOp, ValueId,
};
use crate::sema::conversion::{MutConv, ObjectTypeConv, ValueCatConv};
use crate::sema::entity::*;
use crate::sema::symbol_table::SymbolTable;
use crate::sema::{AnalyzedFunction, AnalyzedProgram};

/// Lower a fully analyzed program to an IR module.
pub fn generate(program: &AnalyzedProgram, sym: &SymbolTable) -> Module {
    let mut module = Module::new();
    let mut gen = ModuleGen {
        sym,
        fn_map: HashMap::new(),
        global_slots: HashMap::new(),
        struct_cache: HashMap::new(),
    };

    // Declare every function up front so calls can reference indices.
    for (index, function) in program.functions.iter().enumerate() {
        gen.fn_map.insert(function.entity, index);
        let name = gen.function_name(function.entity);
        let (params, ret) = gen.signature_types(&mut module.ctx, function.entity);
        module.functions.push(Function::new(&name, &params, ret));
    }
    // Globals get zeroed data slots; their initializers run before `main`.
    for global in &program.globals {
        let ty = gen
            .sym
            .entity(global.entity)
            .as_variable()
            .and_then(|v| v.ty)
            .map(|q| q.ty);
        let Some(ty) = ty else { continue };
        let size = gen.sym.size_of(ty).max(1);
        let index = module.add_constant(
            &format!("global.{}", gen.sym.entity(global.entity).name),
            vec![0; size as usize],
        );
        gen.global_slots.insert(global.entity, index);
    }

    for (index, function) in program.functions.iter().enumerate() {
        gen.generate_function(&mut module, index, function, program);
    }
    module
}

struct ModuleGen<'a> {
    sym: &'a SymbolTable,
    fn_map: HashMap<EntityId, usize>,
    global_slots: HashMap<EntityId, usize>,
    struct_cache: HashMap<EntityId, TypeId>,
}

impl<'a> ModuleGen<'a> {
    fn function_name(&self, entity: EntityId) -> String {
        let e = self.sym.entity(entity);
        let parent_record = e
            .parent
            .filter(|&p| self.sym.entity(p).is_record_type())
            .map(|p| self.sym.entity(p).name.clone());
        match parent_record {
            Some(record) => format!("{}.{}.{}", record, e.name, entity.raw()),
            None if e.name == "main" => "main".to_string(),
            None => format!("{}.{}", e.name, entity.raw()),
        }
    }

    fn signature_types(&mut self, ctx: &mut Context, entity: EntityId) -> (Vec<TypeId>, TypeId) {
        let signature = self
            .sym
            .entity(entity)
            .as_function()
            .and_then(|f| f.signature.clone())
            .expect("generating a function without a signature");
        let params = signature
            .params
            .iter()
            .map(|p| self.map_qual_type(ctx, *p))
            .collect();
        let ret = self.map_qual_type(ctx, signature.ret);
        (params, ret)
    }

    /// References lower to pointers; everything else by value.
    fn map_qual_type(&mut self, ctx: &mut Context, ty: QualType) -> TypeId {
        let resolved = self.sym.resolve(ty.ty);
        if let EntityKind::ReferenceType { base } = self.sym.entity(resolved).kind {
            if self.sym.is_dynamic_array(base.ty) {
                return self.fat_ptr_type(ctx);
            }
            return ctx.ptr();
        }
        self.map_type(ctx, resolved)
    }

    fn fat_ptr_type(&mut self, ctx: &mut Context) -> TypeId {
        let ptr = ctx.ptr();
        let i64 = ctx.int(64);
        ctx.intern(Type::Struct { fields: vec![ptr, i64] })
    }

    fn map_type(&mut self, ctx: &mut Context, ty: EntityId) -> TypeId {
        let ty = self.sym.resolve(ty);
        match &self.sym.entity(ty).kind {
            EntityKind::VoidType => ctx.void(),
            EntityKind::BoolType => ctx.int(1),
            EntityKind::ByteType => ctx.int(8),
            EntityKind::IntType(data) => ctx.int(data.width),
            EntityKind::FloatType { width } => ctx.float(*width),
            EntityKind::NullPtrType => ctx.ptr(),
            EntityKind::PointerType { base, .. } | EntityKind::ReferenceType { base } => {
                if self.sym.is_dynamic_array(base.ty) {
                    self.fat_ptr_type(ctx)
                } else {
                    ctx.ptr()
                }
            }
            EntityKind::ArrayType { elem, count } => {
                let elem = *elem;
                let count = count.unwrap_or(0);
                let elem_ty = self.map_type(ctx, elem);
                ctx.intern(Type::Array { elem: elem_ty, count })
            }
            EntityKind::StructType(_) | EntityKind::ProtocolType(_) => {
                if let Some(&cached) = self.struct_cache.get(&ty) {
                    return cached;
                }
                let elements: Vec<EntityId> = self
                    .sym
                    .entity(ty)
                    .as_record()
                    .map(|r| r.elements.clone())
                    .unwrap_or_default();
                let mut fields = Vec::new();
                for element in elements {
                    let element_ty = match &self.sym.entity(element).kind {
                        EntityKind::Variable(v) => v.ty.map(|q| q.ty),
                        EntityKind::BaseClassObject { ty, .. } => *ty,
                        _ => None,
                    };
                    if let Some(element_ty) = element_ty {
                        fields.push(self.map_type(ctx, element_ty));
                    }
                }
                if fields.is_empty() {
                    fields.push(ctx.int(8));
                }
                let id = ctx.intern(Type::Struct { fields });
                self.struct_cache.insert(ty, id);
                id
            }
            _ => ctx.int(64),
        }
    }

    fn generate_function(
        &mut self,
        module: &mut Module,
        index: usize,
        analyzed: &AnalyzedFunction,
        program: &AnalyzedProgram,
    ) {
        let Some(body) = analyzed.def.body.as_ref() else { return };
        let mut function = std::mem::replace(
            &mut module.functions[index],
            Function::new("placeholder", &[], module.ctx.void()),
        );
        let entry = function.add_block("entry");
        let body_block = function.add_block("body");
        {
            let mut gen = FnGen {
                md: self,
                ctx: &mut module.ctx,
                constants: &mut module.constants,
                f: &mut function,
                entry,
                current: body_block,
                terminated: false,
                addrs: HashMap::new(),
                param_values: HashMap::new(),
                loops: Vec::new(),
            };
            gen.spill_parameters(analyzed);
            // Global initializers run at the top of `main`.
            if analyzed.def.name == "main" {
                gen.init_globals(program);
            }
            gen.gen_stmt(body);
            gen.finish();
        }
        // The prologue block falls through to the body once all allocas are
        // in place.
        let void = module.ctx.void();
        function.add_inst(entry, "", void, InstKind::Goto { target: body_block });
        debug_assert!(function.verify().is_ok(), "{:?}", function.verify());
        module.functions[index] = function;
    }
}

struct LoopTargets {
    continue_block: BlockId,
    break_block: BlockId,
}

struct FnGen<'m, 'a> {
    md: &'m mut ModuleGen<'a>,
    ctx: &'m mut Context,
    constants: &'m mut Vec<crate::ir::DataConstant>,
    f: &'m mut Function,
    entry: BlockId,
    current: BlockId,
    terminated: bool,
    /// Entity to address mapping: allocas for locals, pointers for
    /// reference parameters and bindings.
    addrs: HashMap<EntityId, ValueId>,
    /// By-value parameters stay in their SSA values until something needs
    /// their address, which spills them lazily.
    param_values: HashMap<EntityId, ValueId>,
    loops: Vec<LoopTargets>,
}

impl FnGen<'_, '_> {
    // ------------------------------------------------------------------
    // Plumbing
    // ------------------------------------------------------------------

    fn emit(&mut self, name: &str, ty: TypeId, op: InstKind) -> ValueId {
        if self.terminated {
            // Continue into an unreachable block so expression generation
            // after a terminator stays well formed.
            let dead = self.f.add_block("unreachable");
            self.current = dead;
            self.terminated = false;
        }
        let is_terminator = op.is_terminator();
        let id = self.f.add_inst(self.current, name, ty, op);
        self.terminated = is_terminator;
        id
    }

    fn switch_to(&mut self, block: BlockId) {
        self.current = block;
        self.terminated = false;
    }

    fn alloca(&mut self, name: &str, allocated: TypeId) -> ValueId {
        let i32t = self.ctx.int(32);
        let ptr = self.ctx.ptr();
        let one = self.f.int_const(i32t, 1);
        // Allocas live in the prologue so loops reuse one slot.
        self.f.add_inst(self.entry, name, ptr, InstKind::Alloca { allocated, count: one })
    }

    fn map_type(&mut self, ty: EntityId) -> TypeId {
        self.md.map_type(self.ctx, ty)
    }

    fn expr_type(&mut self, expr: &Expr) -> TypeId {
        let ty = expr.ty();
        self.map_type(ty.ty)
    }

    fn load(&mut self, name: &str, ty: TypeId, address: ValueId) -> ValueId {
        self.emit(name, ty, InstKind::Load { address })
    }

    fn store(&mut self, address: ValueId, value: ValueId) {
        let void = self.ctx.void();
        self.emit("", void, InstKind::Store { address, value });
    }

    fn spill_parameters(&mut self, analyzed: &AnalyzedFunction) {
        for (index, param) in analyzed.def.params.iter().enumerate() {
            let Some(entity) = param.entity else { continue };
            let value = self.f.params[index];
            let is_reference = match &self.md.sym.entity(entity).kind {
                EntityKind::Parameter { ty, .. } => self.md.sym.is_reference(ty.ty),
                // `this` is a reference unless declared by value.
                EntityKind::ThisProperty { .. } => param
                    .this
                    .map(|t| t.reference)
                    .unwrap_or(false),
                _ => false,
            };
            if is_reference {
                self.addrs.insert(entity, value);
            } else {
                // Parameters are immutable; they only hit memory if their
                // address is taken.
                self.param_values.insert(entity, value);
            }
        }
    }

    fn init_globals(&mut self, program: &AnalyzedProgram) {
        for global in &program.globals {
            let Some(init) = global.decl.init.as_ref() else { continue };
            let Some(&slot) = self.md.global_slots.get(&global.entity) else { continue };
            let ptr = self.ctx.ptr();
            let addr = self.f.global_data(ptr, slot);
            let Some(value) = self.gen_expr(init) else { continue };
            self.store(addr, value);
        }
    }

    fn finish(&mut self) {
        if self.terminated {
            return;
        }
        // Falling off the end returns void, or a zero value otherwise.
        let ret_ty = self.f.return_type;
        let void = self.ctx.void();
        let value = if self.ctx.ty(ret_ty) == &Type::Void {
            None
        } else {
            Some(self.zero_value(ret_ty))
        };
        self.emit("", void, InstKind::Return { value });
    }

    fn zero_value(&mut self, ty: TypeId) -> ValueId {
        match self.ctx.ty(ty).clone() {
            Type::Float { .. } => self.f.float_const(ty, 0),
            Type::Struct { fields } => {
                let mut value = self.f.undef(ty);
                for (index, field) in fields.iter().enumerate() {
                    let zero = self.zero_value(*field);
                    value = self.emit("agg", ty, InstKind::InsertValue {
                        aggregate: value,
                        value: zero,
                        indices: vec![index],
                    });
                }
                value
            }
            Type::Array { elem, count } => {
                let mut value = self.f.undef(ty);
                for index in 0..count {
                    let zero = self.zero_value(elem);
                    value = self.emit("agg", ty, InstKind::InsertValue {
                        aggregate: value,
                        value: zero,
                        indices: vec![index as usize],
                    });
                }
                value
            }
            _ => self.f.int_const(ty, 0),
        }
    }

    fn string_constant(&mut self, text: &str) -> (ValueId, u64) {
        let index = self.constants.len();
        self.constants.push(crate::ir::DataConstant {
            name: format!("str.{index}"),
            bytes: text.as_bytes().to_vec(),
        });
        let ptr = self.ctx.ptr();
        let addr = self.f.global_data(ptr, index);
        (addr, text.len() as u64)
    }

    /// Build a `{ptr, count}` fat pointer value.
    fn make_fat_ptr(&mut self, ptr: ValueId, count: ValueId) -> ValueId {
        let fat = self.md.fat_ptr_type(self.ctx);
        let undef = self.f.undef(fat);
        let with_ptr = self.emit("fat", fat, InstKind::InsertValue {
            aggregate: undef,
            value: ptr,
            indices: vec![0],
        });
        self.emit("fat", fat, InstKind::InsertValue {
            aggregate: with_ptr,
            value: count,
            indices: vec![1],
        })
    }

    fn callee_for(&mut self, function: EntityId) -> Callee {
        match self.md.sym.entity(function).as_function().map(|f| f.kind) {
            Some(FunctionKind::Foreign { slot, index }) => Callee::Foreign { slot, index },
            _ => Callee::Function(
                *self
                    .md
                    .fn_map
                    .get(&function)
                    .expect("call to an undeclared function"),
            ),
        }
    }

    fn call_builtin(
        &mut self,
        builtin: Builtin,
        args: Vec<ValueId>,
        ret: TypeId,
        name: &str,
    ) -> ValueId {
        self.emit(name, ret, InstKind::Call {
            callee: Callee::Foreign { slot: scatha_core::BUILTIN_SLOT, index: builtin.into() },
            args,
        })
    }

    // ------------------------------------------------------------------
    // Statements
    // ------------------------------------------------------------------

    fn gen_stmt(&mut self, stmt: &Stmt) {
        if !stmt.reachable {
            return;
        }
        match &stmt.kind {
            StmtKind::Compound(stmts) => {
                for child in stmts {
                    self.gen_stmt(child);
                }
                if !self.terminated {
                    self.gen_cleanups(&stmt.cleanups);
                }
            }
            StmtKind::Var(decl) => {
                self.gen_var_decl(decl);
                if !self.terminated {
                    self.gen_cleanups(&stmt.cleanups);
                }
            }
            StmtKind::Expr(expr) => {
                self.gen_expr(expr);
                if !self.terminated {
                    self.gen_cleanups(&stmt.cleanups);
                }
            }
            StmtKind::Return(expr) => {
                let value = expr.as_ref().and_then(|e| {
                    if e.value_cat() == ValueCategory::LValue
                        && self.returns_reference()
                    {
                        Some(self.gen_lvalue(e))
                    } else {
                        self.gen_expr(e)
                    }
                });
                self.gen_cleanups(&stmt.cleanups);
                let void = self.ctx.void();
                self.emit("", void, InstKind::Return { value });
            }
            StmtKind::If { cond, then_branch, else_branch } => {
                let cond_value = match self.gen_expr(cond) {
                    Some(v) => v,
                    None => return,
                };
                let then_block = self.f.add_block("if.then");
                let end_block = self.f.add_block("if.end");
                let else_block = if else_branch.is_some() {
                    self.f.add_block("if.else")
                } else {
                    end_block
                };
                let void = self.ctx.void();
                self.emit("", void, InstKind::Branch {
                    cond: cond_value,
                    then_block,
                    else_block,
                });
                self.switch_to(then_block);
                self.gen_stmt(then_branch);
                if !self.terminated {
                    self.emit("", void, InstKind::Goto { target: end_block });
                }
                if let Some(else_branch) = else_branch {
                    self.switch_to(else_block);
                    self.gen_stmt(else_branch);
                    if !self.terminated {
                        self.emit("", void, InstKind::Goto { target: end_block });
                    }
                }
                self.switch_to(end_block);
                self.gen_cleanups(&stmt.cleanups);
            }
            StmtKind::Loop { init, cond, increment, body, .. } => {
                if let Some(init) = init {
                    self.gen_stmt(init);
                }
                let header = self.f.add_block("loop.header");
                let body_block = self.f.add_block("loop.body");
                let inc_block = self.f.add_block("loop.inc");
                let end_block = self.f.add_block("loop.end");
                let void = self.ctx.void();
                self.emit("", void, InstKind::Goto { target: header });
                self.switch_to(header);
                match cond {
                    Some(cond) => {
                        let Some(cond_value) = self.gen_expr(cond) else { return };
                        self.emit("", void, InstKind::Branch {
                            cond: cond_value,
                            then_block: body_block,
                            else_block: end_block,
                        });
                    }
                    None => {
                        self.emit("", void, InstKind::Goto { target: body_block });
                    }
                }
                self.loops.push(LoopTargets {
                    continue_block: inc_block,
                    break_block: end_block,
                });
                self.switch_to(body_block);
                self.gen_stmt(body);
                if !self.terminated {
                    self.emit("", void, InstKind::Goto { target: inc_block });
                }
                self.switch_to(inc_block);
                if let Some(increment) = increment {
                    self.gen_expr(increment);
                }
                self.emit("", void, InstKind::Goto { target: header });
                self.loops.pop();
                self.switch_to(end_block);
                // The loop's own objects (e.g. the induction variable) die
                // when the loop exits.
                self.gen_cleanups(&stmt.cleanups);
            }
            StmtKind::Jump(kind) => {
                self.gen_cleanups(&stmt.cleanups);
                let Some(targets) = self.loops.last() else { return };
                let target = match kind {
                    JumpKind::Break => targets.break_block,
                    JumpKind::Continue => targets.continue_block,
                };
                let void = self.ctx.void();
                self.emit("", void, InstKind::Goto { target });
            }
            StmtKind::Empty => {}
        }
    }

    fn returns_reference(&self) -> bool {
        // A function returning a reference returns a pointer-typed value and
        // its returns receive lvalues.
        matches!(self.ctx.ty(self.f.return_type), Type::Ptr)
    }

    fn gen_var_decl(&mut self, decl: &VarDecl) {
        let Some(entity) = decl.entity else { return };
        let var_ty = self
            .md
            .sym
            .entity(entity)
            .as_variable()
            .and_then(|v| v.ty);
        let Some(var_ty) = var_ty else { return };
        if self.md.sym.is_reference(var_ty.ty) {
            // Reference bindings alias their initializer.
            if let Some(init) = decl.init.as_ref() {
                let addr = self.gen_lvalue(init);
                self.addrs.insert(entity, addr);
            }
            return;
        }
        let ir_ty = self.map_type(var_ty.ty);
        let slot = self.alloca(&decl.name, ir_ty);
        self.addrs.insert(entity, slot);
        if let Some(init) = decl.init.as_ref() {
            match &init.kind {
                // Constructors write through the address directly.
                ExprKind::Construct { kind: ConstructKind::Nontrivial, function, args } => {
                    self.gen_ctor_call_into(slot, *function, args);
                }
                _ => {
                    if let Some(value) = self.gen_expr(init) {
                        self.store(slot, value);
                    }
                }
            }
        }
    }

    fn gen_ctor_call_into(
        &mut self,
        dest: ValueId,
        function: Option<EntityId>,
        args: &[Expr],
    ) {
        let Some(function) = function else { return };
        let mut values = vec![dest];
        for arg in args {
            let value = if arg.value_cat() == ValueCategory::LValue {
                self.gen_lvalue(arg)
            } else {
                match self.gen_expr(arg) {
                    Some(v) => v,
                    None => return,
                }
            };
            values.push(value);
        }
        let callee = self.callee_for(function);
        let void = self.ctx.void();
        self.emit("", void, InstKind::Call { callee, args: values });
    }

    /// Emit the destructor calls of a cleanup stack, most recent first.
    fn gen_cleanups(&mut self, cleanups: &CleanupStack) {
        for cleanup in cleanups.in_execution_order() {
            let Some(&addr) = self.addrs.get(&cleanup.object) else { continue };
            match cleanup.operation {
                LifetimeOperation::UserDefined(dtor) => {
                    let callee = self.callee_for(dtor);
                    let void = self.ctx.void();
                    self.emit("", void, InstKind::Call { callee, args: vec![addr] });
                }
                LifetimeOperation::NontrivialInline => {
                    self.gen_inline_destroy(cleanup.object, addr);
                }
                LifetimeOperation::Trivial | LifetimeOperation::Deleted => {}
            }
        }
    }

    /// Synthesized destruction: unique pointers deallocate their pointee.
    fn gen_inline_destroy(&mut self, object: EntityId, addr: ValueId) {
        let ty = match &self.md.sym.entity(object).kind {
            EntityKind::Variable(v) => v.ty.map(|q| q.ty),
            EntityKind::Temporary { ty } => Some(ty.ty),
            _ => None,
        };
        let Some(ty) = ty else { return };
        let resolved = self.md.sym.resolve(ty);
        if let EntityKind::PointerType { base, qual: PointerQual::Unique } =
            self.md.sym.entity(resolved).kind
        {
            let void = self.ctx.void();
            let i64t = self.ctx.int(64);
            let ptr_ty = self.map_type(resolved);
            let value = self.load("unique", ptr_ty, addr);
            let pointer = if self.md.sym.is_dynamic_array(base.ty) {
                let ptr = self.ctx.ptr();
                self.emit("ptr", ptr, InstKind::ExtractValue {
                    aggregate: value,
                    indices: vec![0],
                })
            } else {
                value
            };
            let align = self.f.int_const(i64t, self.md.sym.align_of(base.ty).max(1));
            self.call_builtin(Builtin::Dealloc, vec![pointer, align], void, "");
        }
    }

    // ------------------------------------------------------------------
    // L-values
    // ------------------------------------------------------------------

    /// Address of an lvalue expression.
    fn gen_lvalue(&mut self, expr: &Expr) -> ValueId {
        match &expr.kind {
            ExprKind::Ident(_) | ExprKind::This => {
                let entity = expr.entity().expect("undecorated lvalue");
                self.entity_address(entity)
            }
            ExprKind::MemberAccess { object, .. } => {
                let member = expr.entity().expect("undecorated member access");
                let base = self.gen_lvalue(object);
                let index = self
                    .md
                    .sym
                    .entity(member)
                    .as_variable()
                    .and_then(|v| v.index)
                    .unwrap_or(0);
                let object_ty = object.ty();
                let pointee = self.map_type(object_ty.ty);
                let i64t = self.ctx.int(64);
                let zero = self.f.int_const(i64t, 0);
                let ptr = self.ctx.ptr();
                self.emit("member", ptr, InstKind::GetElementPointer {
                    pointee,
                    base,
                    index: zero,
                    members: vec![index],
                })
            }
            ExprKind::Deref { operand: Some(operand), .. } => {
                let value = self.gen_expr(operand).expect("dereference of void value");
                self.pointer_of(operand, value)
            }
            ExprKind::Subscript { object, index } => {
                let base = self.array_base_address(object);
                let index_value = self.gen_expr(index).expect("array index is a value");
                let elem = self.element_type_of(object);
                let ptr = self.ctx.ptr();
                self.emit("elem", ptr, InstKind::GetElementPointer {
                    pointee: elem,
                    base,
                    index: index_value,
                    members: Vec::new(),
                })
            }
            ExprKind::Conversion { conv, operand } => {
                // Only qualification conversions preserve addresses.
                debug_assert!(conv.object.is_empty() || conv.mutability == Some(MutConv::MutToConst));
                if conv.value_cat == Some(ValueCatConv::MaterializeTemporary) {
                    let value = self.gen_expr(operand).expect("materializing a void value");
                    let ty = self.f.value(value).ty;
                    let slot = self.alloca("tmp", ty);
                    self.store(slot, value);
                    if let Some(entity) = expr.entity() {
                        self.addrs.insert(entity, slot);
                    }
                    slot
                } else {
                    self.gen_lvalue(operand)
                }
            }
            ExprKind::Unary { op, prefix: true, operand }
                if matches!(op, UnaryOp::Increment | UnaryOp::Decrement) =>
            {
                self.gen_expr(expr);
                self.gen_lvalue(operand)
            }
            ExprKind::Call { .. } => {
                // Reference-returning call: the value is the address.
                self.gen_call(expr).expect("reference call returns a pointer")
            }
            ExprKind::Conditional { .. } => {
                // LValue conditionals produce an address phi.
                self.gen_conditional(expr, true)
            }
            _ => {
                // Remaining rvalues materialize into a temporary slot.
                let value = self.gen_expr(expr).expect("materializing a void value");
                let ty = self.f.value(value).ty;
                let slot = self.alloca("tmp", ty);
                self.store(slot, value);
                slot
            }
        }
    }

    fn entity_address(&mut self, entity: EntityId) -> ValueId {
        if let Some(&addr) = self.addrs.get(&entity) {
            return addr;
        }
        if let Some(&value) = self.param_values.get(&entity) {
            // Lazy spill: the parameter's value is immutable, so storing it
            // at the point of the first address request is sound.
            let ty = self.f.value(value).ty;
            let slot = self.alloca("param.addr", ty);
            self.store(slot, value);
            self.addrs.insert(entity, slot);
            return slot;
        }
        if let Some(&slot) = self.md.global_slots.get(&entity) {
            let ptr = self.ctx.ptr();
            let addr = self.f.global_data(ptr, slot);
            self.addrs.insert(entity, addr);
            return addr;
        }
        panic!("no storage for entity {}", self.md.sym.entity(entity).name);
    }

    /// The raw address behind a pointer value (fat pointers carry it in
    /// field 0).
    fn pointer_of(&mut self, pointer_expr: &Expr, value: ValueId) -> ValueId {
        let ty = pointer_expr.ty();
        let resolved = self.md.sym.resolve(ty.ty);
        let is_fat = match self.md.sym.entity(resolved).kind {
            EntityKind::PointerType { base, .. } => self.md.sym.is_dynamic_array(base.ty),
            _ => false,
        };
        if is_fat {
            let ptr = self.ctx.ptr();
            self.emit("ptr", ptr, InstKind::ExtractValue { aggregate: value, indices: vec![0] })
        } else {
            value
        }
    }

    fn array_base_address(&mut self, object: &Expr) -> ValueId {
        if object.value_cat() == ValueCategory::LValue {
            self.gen_lvalue(object)
        } else {
            let value = self.gen_expr(object).expect("array value");
            let ty = self.f.value(value).ty;
            let slot = self.alloca("tmp", ty);
            self.store(slot, value);
            slot
        }
    }

    fn element_type_of(&mut self, object: &Expr) -> TypeId {
        let ty = self.md.sym.resolve(object.ty().ty);
        match self.md.sym.entity(ty).kind {
            EntityKind::ArrayType { elem, .. } => self.map_type(elem),
            _ => self.ctx.int(64),
        }
    }

    // ------------------------------------------------------------------
    // Expressions
    // ------------------------------------------------------------------

    /// Value of an expression; `None` for void. Non-trivial temporaries get
    /// a stack slot so their registered cleanups can reach them.
    fn gen_expr(&mut self, expr: &Expr) -> Option<ValueId> {
        let value = self.gen_expr_impl(expr)?;
        if let Some(entity) = expr.entity() {
            if matches!(self.md.sym.entity(entity).kind, EntityKind::Temporary { .. })
                && !self.addrs.contains_key(&entity)
            {
                let ty = self.f.value(value).ty;
                let slot = self.alloca("tmp", ty);
                self.store(slot, value);
                self.addrs.insert(entity, slot);
            }
        }
        Some(value)
    }

    fn gen_expr_impl(&mut self, expr: &Expr) -> Option<ValueId> {
        // Folded constants short-circuit codegen.
        if let Some(constant) = expr.constant() {
            if !has_side_effect(expr) {
                return Some(self.gen_constant(expr, constant.clone()));
            }
        }
        match &expr.kind {
            ExprKind::IntLit(_) | ExprKind::FloatLit(_) | ExprKind::BoolLit(_)
            | ExprKind::CharLit(_) => {
                let constant = expr.constant().cloned().expect("literal without constant");
                Some(self.gen_constant(expr, constant))
            }
            ExprKind::NullLit => {
                let ptr = self.ctx.ptr();
                Some(self.f.int_const(ptr, 0))
            }
            ExprKind::StringLit(text) => {
                let (addr, len) = self.string_constant(text);
                let i64t = self.ctx.int(64);
                let count = self.f.int_const(i64t, len);
                Some(self.make_fat_ptr(addr, count))
            }
            ExprKind::Ident(_) | ExprKind::This | ExprKind::MemberAccess { .. }
            | ExprKind::Subscript { .. } | ExprKind::Deref { operand: Some(_), .. } => {
                // Unspilled parameters are already values.
                if let Some(entity) = expr.entity() {
                    if let Some(&value) = self.param_values.get(&entity) {
                        if !self.addrs.contains_key(&entity) {
                            return Some(value);
                        }
                    }
                }
                // `.count` of arrays is a computed member, not a load.
                if let ExprKind::MemberAccess { object, member } = &expr.kind {
                    if let ExprKind::Ident(name) = &member.kind {
                        if name == "count" && expr.entity().is_none() {
                            return Some(self.gen_array_count(object));
                        }
                    }
                }
                let addr = self.gen_lvalue(expr);
                let ty = self.expr_type(expr);
                Some(self.load("", ty, addr))
            }
            ExprKind::AddressOf { operand: Some(operand), .. } => {
                let addr = self.gen_lvalue(operand);
                // Pointers to dynamic arrays are fat.
                let pointee = self.md.sym.resolve(operand.ty().ty);
                if self.md.sym.is_dynamic_array(pointee) {
                    let count = self.gen_array_count(operand);
                    Some(self.make_fat_ptr(addr, count))
                } else {
                    Some(addr)
                }
            }
            ExprKind::Unary { .. } => self.gen_unary(expr),
            ExprKind::Binary { .. } => self.gen_binary(expr),
            ExprKind::Conditional { .. } => Some(self.gen_conditional(expr, false)),
            ExprKind::Call { .. } => {
                let result = self.gen_call(expr)?;
                if expr.value_cat() == ValueCategory::LValue {
                    // Reference return: load through the returned address.
                    let ty = self.expr_type(expr);
                    Some(self.load("", ty, result))
                } else {
                    Some(result)
                }
            }
            ExprKind::Conversion { .. } => self.gen_conversion(expr),
            ExprKind::Construct { .. } => self.gen_construct(expr),
            ExprKind::List(elems) => {
                let ty = self.expr_type(expr);
                let mut value = self.f.undef(ty);
                for (index, elem) in elems.iter().enumerate() {
                    let elem_value = self.gen_expr(elem)?;
                    value = self.emit("list", ty, InstKind::InsertValue {
                        aggregate: value,
                        value: elem_value,
                        indices: vec![index],
                    });
                }
                Some(value)
            }
            ExprKind::Move(operand) => {
                let addr = self.gen_lvalue(operand);
                let ty = self.expr_type(operand);
                let value = self.load("moved", ty, addr);
                // Moving out of a unique pointer nulls the source.
                let resolved = self.md.sym.resolve(operand.ty().ty);
                if matches!(
                    self.md.sym.entity(resolved).kind,
                    EntityKind::PointerType { qual: PointerQual::Unique, .. }
                ) {
                    let zero = self.zero_value(ty);
                    self.store(addr, zero);
                }
                Some(value)
            }
            ExprKind::Unique(operand) => self.gen_unique(expr, operand),
            ExprKind::SubscriptSlice { object, lower, upper } => {
                let base = self.array_base_address(object);
                let lower_value = self.gen_expr(lower)?;
                let upper_value = self.gen_expr(upper)?;
                let elem = self.element_type_of(object);
                let ptr = self.ctx.ptr();
                let start = self.emit("slice", ptr, InstKind::GetElementPointer {
                    pointee: elem,
                    base,
                    index: lower_value,
                    members: Vec::new(),
                });
                let i64t = self.ctx.int(64);
                let count = self.emit("slice.count", i64t, InstKind::Arith {
                    op: ArithOp::Sub,
                    lhs: upper_value,
                    rhs: lower_value,
                });
                Some(self.make_fat_ptr(start, count))
            }
            ExprKind::FString(parts) => Some(self.gen_fstring(parts)),
            ExprKind::NontrivAssign { dest, source, dtor, ctor } => {
                let dest_addr = self.gen_lvalue(dest);
                if let Some(dtor) = dtor {
                    let callee = self.callee_for(*dtor);
                    let void = self.ctx.void();
                    self.emit("", void, InstKind::Call { callee, args: vec![dest_addr] });
                }
                match ctor {
                    Some(ctor) => {
                        let source_addr = self.gen_lvalue(source);
                        let callee = self.callee_for(*ctor);
                        let void = self.ctx.void();
                        self.emit("", void, InstKind::Call {
                            callee,
                            args: vec![dest_addr, source_addr],
                        });
                    }
                    None => {
                        let value = self.gen_expr(source)?;
                        self.store(dest_addr, value);
                    }
                }
                None
            }
            _ => None,
        }
    }

    fn gen_constant(&mut self, expr: &Expr, constant: ConstValue) -> ValueId {
        let ty = self.expr_type(expr);
        match constant {
            ConstValue::Int(v) => self.f.int_const(ty, v as u64),
            ConstValue::Bool(v) => self.f.int_const(ty, v as u64),
            ConstValue::Float(v) => {
                let bits = match self.ctx.ty(ty) {
                    Type::Float { width: 32 } => u64::from((v as f32).to_bits()),
                    _ => v.to_bits(),
                };
                self.f.float_const(ty, bits)
            }
        }
    }

    fn gen_array_count(&mut self, object: &Expr) -> ValueId {
        let ty = self.md.sym.resolve(object.ty().ty);
        let i64t = self.ctx.int(64);
        match self.md.sym.entity(ty).kind {
            EntityKind::ArrayType { count: Some(n), .. } => self.f.int_const(i64t, n),
            _ => {
                // Dynamic arrays live behind fat pointers; the count is the
                // second field of the pointer the object came through.
                match &object.kind {
                    ExprKind::Deref { operand: Some(pointer), .. } => {
                        let value = self.gen_expr(pointer).expect("pointer value");
                        self.emit("count", i64t, InstKind::ExtractValue {
                            aggregate: value,
                            indices: vec![1],
                        })
                    }
                    _ => self.f.int_const(i64t, 0),
                }
            }
        }
    }

    fn gen_unary(&mut self, expr: &Expr) -> Option<ValueId> {
        let ExprKind::Unary { op, prefix, operand } = &expr.kind else { unreachable!() };
        match op {
            UnaryOp::Promote => self.gen_expr(operand),
            UnaryOp::Negate => {
                let value = self.gen_expr(operand)?;
                let ty = self.f.value(value).ty;
                if matches!(self.ctx.ty(ty), Type::Float { .. }) {
                    let zero = self.f.float_const(ty, 0);
                    Some(self.emit("neg", ty, InstKind::Arith {
                        op: ArithOp::FSub,
                        lhs: zero,
                        rhs: value,
                    }))
                } else {
                    Some(self.emit("neg", ty, InstKind::UnaryArith {
                        op: UnaryArithOp::Negate,
                        operand: value,
                    }))
                }
            }
            UnaryOp::BitwiseNot => {
                let value = self.gen_expr(operand)?;
                let ty = self.f.value(value).ty;
                Some(self.emit("bnt", ty, InstKind::UnaryArith {
                    op: UnaryArithOp::BitwiseNot,
                    operand: value,
                }))
            }
            UnaryOp::LogicalNot => {
                let value = self.gen_expr(operand)?;
                let ty = self.f.value(value).ty;
                Some(self.emit("lnt", ty, InstKind::UnaryArith {
                    op: UnaryArithOp::LogicalNot,
                    operand: value,
                }))
            }
            UnaryOp::Increment | UnaryOp::Decrement => {
                let addr = self.gen_lvalue(operand);
                let ty = self.expr_type(operand);
                let old = self.load("old", ty, addr);
                let one = self.f.int_const(ty, 1);
                let arith = if *op == UnaryOp::Increment { ArithOp::Add } else { ArithOp::Sub };
                let new = self.emit("new", ty, InstKind::Arith { op: arith, lhs: old, rhs: one });
                self.store(addr, new);
                Some(if *prefix { new } else { old })
            }
        }
    }

    fn compare_mode(&self, expr: &Expr) -> CompareMode {
        let ty = self.md.sym.resolve(expr.ty().ty);
        match &self.md.sym.entity(ty).kind {
            EntityKind::FloatType { .. } => CompareMode::Float,
            EntityKind::IntType(data) if data.signed => CompareMode::Signed,
            _ => CompareMode::Unsigned,
        }
    }

    fn gen_binary(&mut self, expr: &Expr) -> Option<ValueId> {
        let ExprKind::Binary { op, lhs, rhs } = &expr.kind else { unreachable!() };
        use BinaryOp::*;
        match op {
            Comma => {
                self.gen_expr(lhs);
                self.gen_expr(rhs)
            }
            LogicalAnd | LogicalOr => Some(self.gen_short_circuit(*op, lhs, rhs)),
            Assign => {
                let addr = self.gen_lvalue(lhs);
                let value = self.gen_expr(rhs)?;
                self.store(addr, value);
                None
            }
            AddAssign | SubAssign | MulAssign | DivAssign | RemAssign | LeftShiftAssign
            | RightShiftAssign | AndAssign | OrAssign | XorAssign => {
                let addr = self.gen_lvalue(lhs);
                let ty = self.expr_type(lhs);
                let old = self.load("old", ty, addr);
                let value = self.gen_expr(rhs)?;
                let arith = self.arith_op(op.compound_operation().unwrap(), lhs);
                let new = self.emit("new", ty, InstKind::Arith {
                    op: arith,
                    lhs: old,
                    rhs: value,
                });
                self.store(addr, new);
                None
            }
            Less | LessEq | Greater | GreaterEq | Equals | NotEquals => {
                let lhs_value = self.gen_expr(lhs)?;
                let rhs_value = self.gen_expr(rhs)?;
                let mode = self.compare_mode(lhs);
                let cmp = match op {
                    Less => CompareOp::Less,
                    LessEq => CompareOp::LessEq,
                    Greater => CompareOp::Greater,
                    GreaterEq => CompareOp::GreaterEq,
                    Equals => CompareOp::Equal,
                    NotEquals => CompareOp::NotEqual,
                    _ => unreachable!(),
                };
                let i1 = self.ctx.int(1);
                Some(self.emit("cmp", i1, InstKind::Compare {
                    mode,
                    op: cmp,
                    lhs: lhs_value,
                    rhs: rhs_value,
                }))
            }
            _ => {
                let lhs_value = self.gen_expr(lhs)?;
                let rhs_value = self.gen_expr(rhs)?;
                let ty = self.f.value(lhs_value).ty;
                let arith = self.arith_op(*op, lhs);
                Some(self.emit("bin", ty, InstKind::Arith {
                    op: arith,
                    lhs: lhs_value,
                    rhs: rhs_value,
                }))
            }
        }
    }

    fn arith_op(&self, op: BinaryOp, operand: &Expr) -> ArithOp {
        let ty = self.md.sym.resolve(operand.ty().ty);
        let entity = self.md.sym.entity(ty);
        let is_float = matches!(entity.kind, EntityKind::FloatType { .. });
        let signed = matches!(entity.kind, EntityKind::IntType(IntTypeData { signed: true, .. }));
        use BinaryOp::*;
        match (op, is_float) {
            (Add, false) => ArithOp::Add,
            (Add, true) => ArithOp::FAdd,
            (Sub, false) => ArithOp::Sub,
            (Sub, true) => ArithOp::FSub,
            (Mul, false) => ArithOp::Mul,
            (Mul, true) => ArithOp::FMul,
            (Div, true) => ArithOp::FDiv,
            (Div, false) => {
                if signed {
                    ArithOp::SDiv
                } else {
                    ArithOp::UDiv
                }
            }
            (Rem, _) => {
                if signed {
                    ArithOp::SRem
                } else {
                    ArithOp::URem
                }
            }
            (LeftShift, _) => ArithOp::LShL,
            (RightShift, _) => {
                if signed {
                    ArithOp::AShR
                } else {
                    ArithOp::LShR
                }
            }
            (BitAnd, _) => ArithOp::And,
            (BitOr, _) => ArithOp::Or,
            (BitXor, _) => ArithOp::XOr,
            _ => unreachable!("not an arithmetic operator: {op}"),
        }
    }

    fn gen_short_circuit(&mut self, op: BinaryOp, lhs: &Expr, rhs: &Expr) -> ValueId {
        let i1 = self.ctx.int(1);
        let void = self.ctx.void();
        let lhs_value = self.gen_expr(lhs).expect("bool value");
        let lhs_block = self.current;
        let rhs_block = self.f.add_block("logic.rhs");
        let end_block = self.f.add_block("logic.end");
        if op == BinaryOp::LogicalAnd {
            self.emit("", void, InstKind::Branch {
                cond: lhs_value,
                then_block: rhs_block,
                else_block: end_block,
            });
        } else {
            self.emit("", void, InstKind::Branch {
                cond: lhs_value,
                then_block: end_block,
                else_block: rhs_block,
            });
        }
        self.switch_to(rhs_block);
        let rhs_value = self.gen_expr(rhs).expect("bool value");
        let rhs_end = self.current;
        self.emit("", void, InstKind::Goto { target: end_block });
        self.switch_to(end_block);
        let short_value = self
            .f
            .int_const(i1, (op == BinaryOp::LogicalOr) as u64);
        self.emit("logic", i1, InstKind::Phi {
            incoming: vec![(lhs_block, short_value), (rhs_end, rhs_value)],
        })
    }

    /// Conditionals lower to a diamond with a phi; `lvalue` mode joins
    /// addresses instead of values.
    fn gen_conditional(&mut self, expr: &Expr, lvalue: bool) -> ValueId {
        let ExprKind::Conditional {
            cond,
            then_expr,
            else_expr,
            then_cleanups,
            else_cleanups,
        } = &expr.kind
        else {
            unreachable!()
        };
        let void = self.ctx.void();
        let cond_value = self.gen_expr(cond).expect("bool value");
        let then_block = self.f.add_block("cond.then");
        let else_block = self.f.add_block("cond.else");
        let end_block = self.f.add_block("cond.end");
        self.emit("", void, InstKind::Branch {
            cond: cond_value,
            then_block,
            else_block,
        });
        self.switch_to(then_block);
        let then_value = if lvalue {
            self.gen_lvalue(then_expr)
        } else {
            self.gen_expr(then_expr).expect("conditional branch value")
        };
        self.gen_cleanups(then_cleanups);
        let then_end = self.current;
        self.emit("", void, InstKind::Goto { target: end_block });
        self.switch_to(else_block);
        let else_value = if lvalue {
            self.gen_lvalue(else_expr)
        } else {
            self.gen_expr(else_expr).expect("conditional branch value")
        };
        self.gen_cleanups(else_cleanups);
        let else_end = self.current;
        self.emit("", void, InstKind::Goto { target: end_block });
        self.switch_to(end_block);
        let ty = if lvalue { self.ctx.ptr() } else { self.expr_type(expr) };
        self.emit("cond", ty, InstKind::Phi {
            incoming: vec![(then_end, then_value), (else_end, else_value)],
        })
    }

    fn gen_call(&mut self, expr: &Expr) -> Option<ValueId> {
        let ExprKind::Call { callee, args } = &expr.kind else { unreachable!() };
        let function = callee.entity().expect("unresolved call");
        let signature = self
            .md
            .sym
            .entity(function)
            .as_function()
            .and_then(|f| f.signature.clone())
            .expect("call to an untyped function");
        let mut values = Vec::with_capacity(args.len());
        for (arg, &param) in args.iter().zip(&signature.params) {
            let value = if self.md.sym.is_reference(param.ty) {
                self.gen_lvalue(arg)
            } else {
                match self.gen_expr(arg) {
                    Some(v) => v,
                    None => return None,
                }
            };
            values.push(value);
        }
        let callee = self.callee_for(function);
        let ret = self.md.map_qual_type(self.ctx, signature.ret);
        let is_void = matches!(self.ctx.ty(ret), Type::Void);
        let result = self.emit("call", ret, InstKind::Call { callee, args: values });
        // Reference-returning calls yield the referent's address; the value
        // path in `gen_expr` loads through it when needed.
        (!is_void).then_some(result)
    }

    fn gen_conversion(&mut self, expr: &Expr) -> Option<ValueId> {
        let ExprKind::Conversion { conv, operand } = &expr.kind else { unreachable!() };
        let mut value = if conv.value_cat == Some(ValueCatConv::LValueToRValue)
            && operand.value_cat() == ValueCategory::LValue
        {
            let addr = self.gen_lvalue(operand);
            let ty = self.expr_type(operand);
            self.load("", ty, addr)
        } else {
            self.gen_expr(operand)?
        };
        for step in &conv.object {
            value = self.gen_object_conv(expr, operand, *step, value);
        }
        Some(value)
    }

    fn gen_object_conv(
        &mut self,
        expr: &Expr,
        operand: &Expr,
        step: ObjectTypeConv,
        value: ValueId,
    ) -> ValueId {
        use ObjectTypeConv::*;
        let target = self.expr_type(expr);
        match step {
            SignedWiden { width } => {
                let ty = self.ctx.int(width);
                self.emit("conv", ty, InstKind::Conv { op: ConvOp::Sext, operand: value })
            }
            UnsignedWiden { width } => {
                let ty = self.ctx.int(width);
                self.emit("conv", ty, InstKind::Conv { op: ConvOp::Zext, operand: value })
            }
            IntTrunc { width } => {
                let ty = self.ctx.int(width);
                self.emit("conv", ty, InstKind::Conv { op: ConvOp::Trunc, operand: value })
            }
            IntToByte => {
                let ty = self.ctx.int(8);
                self.emit("conv", ty, InstKind::Conv { op: ConvOp::Trunc, operand: value })
            }
            SignedToUnsigned | UnsignedToSigned | ByteToSigned | ByteToUnsigned
            | UniqueToRawPtr | ReinterpretValuePtr | ReinterpretValuePtrToByteArray => {
                self.emit("conv", target, InstKind::Conv { op: ConvOp::Bitcast, operand: value })
            }
            FloatWiden64 => {
                let ty = self.ctx.float(64);
                self.emit("conv", ty, InstKind::Conv { op: ConvOp::Fext, operand: value })
            }
            FloatTrunc32 => {
                let ty = self.ctx.float(32);
                self.emit("conv", ty, InstKind::Conv { op: ConvOp::Ftrunc, operand: value })
            }
            SignedToFloat { width } => {
                let ty = self.ctx.float(width);
                self.emit("conv", ty, InstKind::Conv { op: ConvOp::StoF, operand: value })
            }
            UnsignedToFloat { width } => {
                let ty = self.ctx.float(width);
                self.emit("conv", ty, InstKind::Conv { op: ConvOp::UtoF, operand: value })
            }
            FloatToSigned { width } => {
                let ty = self.ctx.int(width);
                self.emit("conv", ty, InstKind::Conv { op: ConvOp::FtoS, operand: value })
            }
            FloatToUnsigned { width } => {
                let ty = self.ctx.int(width);
                self.emit("conv", ty, InstKind::Conv { op: ConvOp::FtoU, operand: value })
            }
            NullptrToRawPtr | NullptrToUniquePtr => {
                if matches!(self.ctx.ty(target), Type::Struct { .. }) {
                    self.zero_value(target)
                } else {
                    let ptr = self.ctx.ptr();
                    self.f.int_const(ptr, 0)
                }
            }
            ArrayPtrFixedToDynamic => {
                // The count comes from the fixed array behind the pointer.
                let count = {
                    let pointee = self.md.sym.resolve(operand.ty().ty);
                    let n = match self.md.sym.entity(pointee).kind {
                        EntityKind::PointerType { base, .. } => {
                            match self.md.sym.entity(self.md.sym.resolve(base.ty)).kind {
                                EntityKind::ArrayType { count: Some(n), .. } => n,
                                _ => 0,
                            }
                        }
                        _ => 0,
                    };
                    let i64t = self.ctx.int(64);
                    self.f.int_const(i64t, n)
                };
                self.make_fat_ptr(value, count)
            }
            ReinterpretDynArrayPtrToByte | ReinterpretDynArrayPtrFromByte => {
                let (from_elem, to_elem) = self.dyn_array_elem_sizes(operand, expr);
                let ptr = self.ctx.ptr();
                let i64t = self.ctx.int(64);
                let raw = self.emit("ptr", ptr, InstKind::ExtractValue {
                    aggregate: value,
                    indices: vec![0],
                });
                let count = self.emit("count", i64t, InstKind::ExtractValue {
                    aggregate: value,
                    indices: vec![1],
                });
                let factor_mul = self.f.int_const(i64t, from_elem.max(1));
                let factor_div = self.f.int_const(i64t, to_elem.max(1));
                let bytes = self.emit("count", i64t, InstKind::Arith {
                    op: ArithOp::Mul,
                    lhs: count,
                    rhs: factor_mul,
                });
                let new_count = self.emit("count", i64t, InstKind::Arith {
                    op: ArithOp::UDiv,
                    lhs: bytes,
                    rhs: factor_div,
                });
                self.make_fat_ptr(raw, new_count)
            }
        }
    }

    fn dyn_array_elem_sizes(&mut self, from: &Expr, to: &Expr) -> (u64, u64) {
        let elem_size = |sym: &SymbolTable, ty: EntityId| -> u64 {
            match sym.entity(sym.resolve(ty)).kind {
                EntityKind::PointerType { base, .. } => {
                    match sym.entity(sym.resolve(base.ty)).kind {
                        EntityKind::ArrayType { elem, .. } => sym.size_of(elem),
                        _ => 1,
                    }
                }
                _ => 1,
            }
        };
        (
            elem_size(self.md.sym, from.ty().ty),
            elem_size(self.md.sym, to.ty().ty),
        )
    }

    fn gen_construct(&mut self, expr: &Expr) -> Option<ValueId> {
        let ExprKind::Construct { kind, function, args } = &expr.kind else { unreachable!() };
        let ty = self.expr_type(expr);
        match kind {
            ConstructKind::TrivialDefault | ConstructKind::NontrivialInline if args.is_empty() => {
                Some(self.zero_value(ty))
            }
            ConstructKind::TrivialCopy | ConstructKind::NontrivialInline => {
                self.gen_expr(&args[0])
            }
            ConstructKind::TrivialDefault => Some(self.zero_value(ty)),
            ConstructKind::TrivialAggregate | ConstructKind::NontrivialAggregate => {
                let mut value = self.f.undef(ty);
                for (index, arg) in args.iter().enumerate() {
                    let arg_value = self.gen_expr(arg)?;
                    value = self.emit("agg", ty, InstKind::InsertValue {
                        aggregate: value,
                        value: arg_value,
                        indices: vec![index],
                    });
                }
                Some(value)
            }
            ConstructKind::Nontrivial => {
                let slot = self.alloca("ctor.tmp", ty);
                self.gen_ctor_call_into(slot, *function, args);
                Some(self.load("", ty, slot))
            }
            ConstructKind::DynamicArray => {
                // unique [T](n): allocate n * sizeof(T) bytes.
                let count = self.gen_expr(&args[0])?;
                let elem_size = {
                    let resolved = self.md.sym.resolve(expr.ty().ty);
                    match self.md.sym.entity(resolved).kind {
                        EntityKind::ArrayType { elem, .. } => self.md.sym.size_of(elem),
                        _ => 1,
                    }
                };
                let i64t = self.ctx.int(64);
                let size_const = self.f.int_const(i64t, elem_size.max(1));
                let bytes = self.emit("bytes", i64t, InstKind::Arith {
                    op: ArithOp::Mul,
                    lhs: count,
                    rhs: size_const,
                });
                let align = self.f.int_const(i64t, 8);
                let fat = self.md.fat_ptr_type(self.ctx);
                let raw = self.call_builtin(Builtin::Alloc, vec![bytes, align], fat, "alloc");
                let ptr = self.ctx.ptr();
                let data = self.emit("ptr", ptr, InstKind::ExtractValue {
                    aggregate: raw,
                    indices: vec![0],
                });
                Some(self.make_fat_ptr(data, count))
            }
        }
    }

    fn gen_unique(&mut self, expr: &Expr, operand: &Expr) -> Option<ValueId> {
        // A dynamic array construction is already heap storage.
        if matches!(
            operand.kind,
            ExprKind::Construct { kind: ConstructKind::DynamicArray, .. }
        ) {
            return self.gen_expr(operand);
        }
        let value = self.gen_expr(operand)?;
        let i64t = self.ctx.int(64);
        let pointee = operand.ty();
        let size = self.f.int_const(i64t, self.md.sym.size_of(pointee.ty).max(1));
        let align = self
            .f
            .int_const(i64t, self.md.sym.align_of(pointee.ty).max(1));
        let fat = self.md.fat_ptr_type(self.ctx);
        let raw = self.call_builtin(Builtin::Alloc, vec![size, align], fat, "alloc");
        let ptr = self.ctx.ptr();
        let data = self.emit("ptr", ptr, InstKind::ExtractValue {
            aggregate: raw,
            indices: vec![0],
        });
        self.store(data, value);
        Some(data)
    }

    fn gen_fstring(&mut self, parts: &[FStringPart]) -> ValueId {
        let fat = self.md.fat_ptr_type(self.ctx);
        let ptr = self.ctx.ptr();
        let i64t = self.ctx.int(64);
        let null = self.f.int_const(ptr, 0);
        let zero = self.f.int_const(i64t, 0);
        let mut buffer = self.make_fat_ptr(null, zero);
        for part in parts {
            buffer = match part {
                FStringPart::Text(text) => {
                    let (addr, len) = self.string_constant(text);
                    let count = self.f.int_const(i64t, len);
                    let piece = self.make_fat_ptr(addr, count);
                    self.call_builtin(
                        Builtin::FstringWritestr,
                        vec![buffer, piece],
                        fat,
                        "fstr",
                    )
                }
                FStringPart::Operand { expr, formatter } => {
                    let value = match self.gen_expr(expr) {
                        Some(v) => v,
                        None => continue,
                    };
                    let formatter = formatter.expect("unselected formatter");
                    let builtin = self
                        .md
                        .sym
                        .entity(formatter)
                        .as_function()
                        .and_then(|f| f.builtin)
                        .expect("formatter is a builtin");
                    self.call_builtin(builtin, vec![buffer, value], fat, "fstr")
                }
            };
        }
        buffer
    }
}

fn has_side_effect(expr: &Expr) -> bool {
    matches!(
        expr.kind,
        ExprKind::Unary { op: UnaryOp::Increment | UnaryOp::Decrement, .. }
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::issue::IssueHandler;
    use crate::parser::parse_unit;
    use crate::sema::{analyze, AnalysisOptions};

    fn lower(source: &str) -> Module {
        let mut issues = IssueHandler::new();
        let unit = parse_unit([("main.sc", source)], &mut issues);
        let mut sym = SymbolTable::new();
        let program = analyze(unit, &mut sym, &mut issues, AnalysisOptions::default());
        assert!(
            !issues.has_errors(),
            "analysis failed: {:?}",
            issues.iter().collect::<Vec<_>>()
        );
        generate(&program, &sym)
    }

    #[test]
    fn test_simple_arithmetic_module() {
        let module = lower("fn main() -> int { return 2 * 3 + 1; }");
        assert_eq!(module.functions.len(), 1);
        let main = &module.functions[0];
        assert_eq!(main.name, "main");
        assert!(main.verify().is_ok());
    }

    #[test]
    fn test_all_functions_verify() {
        let module = lower(
            "fn square(n: int) -> int { return n * n; } \
             fn main() -> int { \
                var acc = 0; \
                for i = 0; i < 10; ++i { \
                    if i % 2 == 0 { acc += square(i); } else { continue; } \
                } \
                while acc > 100 { acc /= 2; break; } \
                return acc; \
             }",
        );
        for function in &module.functions {
            assert!(function.verify().is_ok(), "{}: {:?}", function.name, function.verify());
        }
    }

    #[test]
    fn test_conditional_produces_phi() {
        let module = lower("fn f(c: bool) -> int { return c ? 1 : 2; }");
        let f = &module.functions[0];
        let has_phi = f
            .value_ids()
            .any(|v| matches!(&f.value(v).kind, crate::ir::ValueKind::Inst { op: InstKind::Phi { .. }, .. }));
        assert!(has_phi, "conditional expression should lower to a phi");
        assert!(f.verify().is_ok());
    }

    #[test]
    fn test_short_circuit_blocks() {
        let module = lower("fn f(a: bool, b: bool) -> bool { return a && b; }");
        let f = &module.functions[0];
        assert!(f.block_count() >= 4);
        assert!(f.verify().is_ok());
    }

    #[test]
    fn test_string_literal_lands_in_constants() {
        let module = lower(
            "extern \"C\" fn puts(s: *str) -> void; \
             fn main() { puts(\"hello\"); }",
        );
        assert!(module.constants.iter().any(|c| c.bytes == b"hello"));
    }

    #[test]
    fn test_struct_member_access_uses_gep() {
        let module = lower(
            "struct P { var x: int; var y: int; } \
             fn f(p: &P) -> int { return p.y; }",
        );
        let f = &module.functions[0];
        let has_gep = f.value_ids().any(|v| {
            matches!(
                &f.value(v).kind,
                crate::ir::ValueKind::Inst {
                    op: InstKind::GetElementPointer { members, .. },
                    ..
                } if members == &vec![1]
            )
        });
        assert!(has_gep);
        assert!(f.verify().is_ok());
    }

    #[test]
    fn test_unique_cleanup_calls_dealloc() {
        let module = lower("fn f() { var p = unique 42; }");
        let f = &module.functions[0];
        let dealloc: u16 = Builtin::Dealloc.into();
        let has_dealloc = f.value_ids().any(|v| {
            matches!(
                &f.value(v).kind,
                crate::ir::ValueKind::Inst {
                    op: InstKind::Call { callee: Callee::Foreign { slot: 0, index }, .. },
                    ..
                } if *index == dealloc
            )
        });
        assert!(has_dealloc, "unique pointer destruction should call dealloc");
    }

    #[test]
    fn test_calls_reference_function_indices() {
        let module = lower(
            "fn helper() -> int { return 1; } \
             fn main() -> int { return helper(); }",
        );
        let main_index = module.function_index("main").unwrap();
        let main = &module.functions[main_index];
        let helper_index = 1 - main_index;
        let has_call = main.value_ids().any(|v| {
            matches!(
                &main.value(v).kind,
                crate::ir::ValueKind::Inst {
                    op: InstKind::Call { callee: Callee::Function(i), .. },
                    ..
                } if *i == helper_index
            )
        });
        assert!(has_call);
    }

    #[test]
    fn test_global_initializer_runs_in_main() {
        let module = lower("var g = 7; fn main() -> int { return g; }");
        let main = &module.functions[module.function_index("main").unwrap()];
        let stores = main
            .value_ids()
            .filter(|&v| {
                matches!(
                    &main.value(v).kind,
                    crate::ir::ValueKind::Inst { op: InstKind::Store { .. }, .. }
                )
            })
            .count();
        assert!(stores >= 1);
        assert!(!module.constants.is_empty());
    }
}
