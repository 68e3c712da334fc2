//! Entity instantiation.
//!
//! Orders record types by their definition dependencies, lays out their
//! members, analyzes function signatures and synthesizes lifetime metadata.
//! A dependency cycle among value members is a `StructDefCycle` error.

use std::collections::HashMap;

use crate::ast::{FunctionDef, ParamDecl, PointerQual, ThisParameter};
use crate::issue::{BadPassedType, BadStmt, IssueKind};
use crate::sema::entity::*;
use crate::sema::expr::analyze_type_expr;
use crate::sema::AnalysisContext;
use scatha_core::Builtin;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NodeKind {
    /// Layout of record `records[r]`.
    Record { r: usize },
    /// Type of member `records[r].vars[v]`.
    Member { r: usize, v: usize },
    /// Type of base `records[r].bases[b]`.
    Base { r: usize, b: usize },
}

struct DepNode {
    kind: NodeKind,
    entity: EntityId,
    dependencies: Vec<usize>,
}

/// Steps 1–4: analyze member types, build the dependency graph, reject
/// cycles, then instantiate in topological order. Returns the records in
/// instantiation order.
pub fn instantiate_entities(ctx: &mut AnalysisContext) -> Vec<EntityId> {
    // Member and base type expressions are analyzed in the record's scope.
    let mut member_types: HashMap<(usize, usize), EntityId> = HashMap::new();
    let mut base_types: HashMap<(usize, usize), EntityId> = HashMap::new();
    let mut records = std::mem::take(&mut ctx.records);
    for (r, item) in records.iter_mut().enumerate() {
        for (v, var) in item.vars.iter_mut().enumerate() {
            if let Some(type_expr) = var.type_expr.as_mut() {
                let analyzed =
                    ctx.with_scope(item.entity, |ctx| analyze_type_expr(ctx, type_expr));
                if let Some(ty) = analyzed {
                    member_types.insert((r, v), ty);
                }
            } else {
                ctx.issues.error(
                    var.range,
                    IssueKind::BadStmt(BadStmt::BadVarDecl {
                        name: var.name.clone(),
                        reason: "data members require a type annotation".to_string(),
                    }),
                );
            }
        }
        for (b, base) in item.bases.iter_mut().enumerate() {
            let analyzed =
                ctx.with_scope(item.entity, |ctx| analyze_type_expr(ctx, &mut base.type_expr));
            if let Some(ty) = analyzed {
                base_types.insert((r, b), ty);
            }
        }
    }

    // Graph construction. A record waits for all of its element nodes; an
    // element waits for the record that declares its (array-stripped) type.
    let record_node_of: HashMap<EntityId, usize> = records
        .iter()
        .enumerate()
        .map(|(r, item)| (item.entity, r))
        .collect();
    let mut nodes: Vec<DepNode> = records
        .iter()
        .enumerate()
        .map(|(r, item)| DepNode {
            kind: NodeKind::Record { r },
            entity: item.entity,
            dependencies: Vec::new(),
        })
        .collect();
    for (r, item) in records.iter().enumerate() {
        for (v, var) in item.vars.iter().enumerate() {
            let node = nodes.len();
            let entity = var.entity.unwrap_or(item.entity);
            let mut dependencies = Vec::new();
            if let Some(&ty) = member_types.get(&(r, v)) {
                if let Some(&dep) = record_node_of.get(&strip_arrays(ctx, ty)) {
                    dependencies.push(dep);
                }
            }
            nodes.push(DepNode { kind: NodeKind::Member { r, v }, entity, dependencies });
            nodes[r].dependencies.push(node);
        }
        for (b, base) in item.bases.iter().enumerate() {
            let node = nodes.len();
            let entity = base.entity.unwrap_or(item.entity);
            let mut dependencies = Vec::new();
            if let Some(&ty) = base_types.get(&(r, b)) {
                if let Some(&dep) = record_node_of.get(&ctx.sym.resolve(ty)) {
                    dependencies.push(dep);
                }
            }
            nodes.push(DepNode { kind: NodeKind::Base { r, b }, entity, dependencies });
            nodes[r].dependencies.push(node);
        }
    }

    // Cycle check, then topological order.
    if let Some(cycle) = find_cycle(&nodes) {
        let names = cycle
            .iter()
            .filter_map(|&n| match nodes[n].kind {
                NodeKind::Record { r } => {
                    Some(ctx.sym.entity(records[r].entity).name.clone())
                }
                _ => None,
            })
            .collect();
        let range = ctx.sym.entity(nodes[cycle[0]].entity).range;
        ctx.issues
            .error(range, IssueKind::BadStmt(BadStmt::StructDefCycle { cycle: names }));
        ctx.records = records;
        return Vec::new();
    }
    let order = topological_order(&nodes);

    let mut instantiated = Vec::new();
    for node in order {
        match nodes[node].kind {
            NodeKind::Member { r, v } => {
                let var = &records[r].vars[v];
                let Some(entity) = var.entity else { continue };
                let Some(&ty) = member_types.get(&(r, v)) else { continue };
                if !ctx.sym.is_complete(ty) || ctx.sym.is_reference(ty) {
                    ctx.issues.error(
                        var.range,
                        IssueKind::BadStmt(BadStmt::BadVarDecl {
                            name: var.name.clone(),
                            reason: format!(
                                "'{}' is not a valid data member type",
                                ctx.sym.type_name(ty)
                            ),
                        }),
                    );
                    continue;
                }
                let qt = QualType {
                    ty,
                    mutability: var.mutability,
                    bind: BindMode::Static,
                };
                ctx.sym.define_variable(entity, qt);
            }
            NodeKind::Base { r, b } => {
                let item = &records[r];
                let base = &records[r].bases[b];
                let Some(entity) = base.entity else { continue };
                let Some(&ty) = base_types.get(&(r, b)) else { continue };
                let ty = ctx.sym.resolve(ty);
                let parent_is_protocol = matches!(
                    ctx.sym.entity(item.entity).kind,
                    EntityKind::ProtocolType(_)
                );
                let valid = match &ctx.sym.entity(ty).kind {
                    EntityKind::ProtocolType(_) => true,
                    EntityKind::StructType(_) => !parent_is_protocol,
                    _ => false,
                };
                if !valid {
                    ctx.issues.error(
                        base.range,
                        IssueKind::BadStmt(BadStmt::BadBaseDecl {
                            reason: format!(
                                "cannot extend '{}'",
                                ctx.sym.type_name(ty)
                            ),
                        }),
                    );
                    continue;
                }
                if let EntityKind::BaseClassObject { ty: slot, .. } =
                    &mut ctx.sym.entity_mut(entity).kind
                {
                    *slot = Some(ty);
                }
            }
            NodeKind::Record { r } => {
                layout_record(ctx, records[r].entity);
                instantiated.push(records[r].entity);
            }
        }
    }
    ctx.records = records;
    instantiated
}

fn strip_arrays(ctx: &AnalysisContext, mut ty: EntityId) -> EntityId {
    loop {
        ty = ctx.sym.resolve(ty);
        match ctx.sym.entity(ty).kind {
            EntityKind::ArrayType { elem, .. } => ty = elem,
            _ => return ty,
        }
    }
}

/// DFS cycle finder; returns the nodes of one cycle if any exists.
fn find_cycle(nodes: &[DepNode]) -> Option<Vec<usize>> {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        White,
        Grey,
        Black,
    }
    fn visit(
        n: usize,
        nodes: &[DepNode],
        marks: &mut [Mark],
        stack: &mut Vec<usize>,
    ) -> Option<Vec<usize>> {
        marks[n] = Mark::Grey;
        stack.push(n);
        for &dep in &nodes[n].dependencies {
            match marks[dep] {
                Mark::Grey => {
                    let start = stack.iter().position(|&s| s == dep).unwrap_or(0);
                    return Some(stack[start..].to_vec());
                }
                Mark::White => {
                    if let Some(cycle) = visit(dep, nodes, marks, stack) {
                        return Some(cycle);
                    }
                }
                Mark::Black => {}
            }
        }
        stack.pop();
        marks[n] = Mark::Black;
        None
    }
    let mut marks = vec![Mark::White; nodes.len()];
    let mut stack = Vec::new();
    for n in 0..nodes.len() {
        if marks[n] == Mark::White {
            if let Some(cycle) = visit(n, nodes, &mut marks, &mut stack) {
                return Some(cycle);
            }
        }
    }
    None
}

/// Dependencies-first postorder.
fn topological_order(nodes: &[DepNode]) -> Vec<usize> {
    fn visit(n: usize, nodes: &[DepNode], visited: &mut [bool], order: &mut Vec<usize>) {
        if visited[n] {
            return;
        }
        visited[n] = true;
        for &dep in &nodes[n].dependencies {
            visit(dep, nodes, visited, order);
        }
        order.push(n);
    }
    let mut visited = vec![false; nodes.len()];
    let mut order = Vec::new();
    for n in 0..nodes.len() {
        visit(n, nodes, &mut visited, &mut order);
    }
    order
}

/// Assign member offsets and the record's size and alignment.
fn layout_record(ctx: &mut AnalysisContext, record: EntityId) {
    let elements = ctx
        .sym
        .entity(record)
        .as_record()
        .expect("record entity")
        .elements
        .clone();
    let mut size: u64 = 0;
    let mut align: u64 = 0;
    for element in elements {
        let ty = match &ctx.sym.entity(element).kind {
            EntityKind::Variable(v) => v.ty.map(|q| q.ty),
            EntityKind::BaseClassObject { ty, .. } => *ty,
            _ => None,
        };
        let Some(ty) = ty else { continue };
        let elem_size = ctx.sym.size_of(ty);
        let elem_align = ctx.sym.align_of(ty).max(1);
        size = round_up(size, elem_align);
        match &mut ctx.sym.entity_mut(element).kind {
            EntityKind::Variable(v) => v.offset = Some(size),
            EntityKind::BaseClassObject { offset, .. } => *offset = Some(size),
            _ => {}
        }
        size += elem_size;
        align = align.max(elem_align);
    }
    if align > 0 {
        size = round_up(size, align);
    }
    if size == 0 {
        // Unique address for every object of an empty type.
        size = 1;
        align = 1;
    }
    let data = ctx.sym.entity_mut(record).as_record_mut().expect("record entity");
    data.size = Some(size);
    data.align = Some(align);
}

fn round_up(value: u64, align: u64) -> u64 {
    debug_assert!(align > 0);
    value.div_ceil(align) * align
}

/// Step 5: analyze every function's parameter and return type expressions,
/// validate foreign linkage, and commit signatures.
pub fn analyze_signatures(ctx: &mut AnalysisContext) {
    for index in 0..ctx.functions.len() {
        analyze_signature(ctx, index);
    }
}

fn analyze_signature(ctx: &mut AnalysisContext, index: usize) {
    let entity = ctx.functions[index].entity;
    let scope = ctx.functions[index].scope;
    let mut def = ctx.functions[index]
        .def
        .take()
        .expect("signature analysis runs before body analysis");
    let signature = ctx.with_scope(scope, |ctx| build_signature(ctx, entity, &mut def));
    let needs_ret_deduction = def.return_type.is_none() && def.body.is_some();
    if let Some(signature) = signature {
        if def.extern_c {
            validate_foreign(ctx, &def, &signature);
            bind_foreign(ctx, entity, &def.name);
        }
        detect_smf(ctx, entity, &signature, &def);
        ctx.sym.set_function_type(entity, signature, ctx.issues);
    }
    let slot = &mut ctx.functions[index];
    slot.needs_ret_deduction = needs_ret_deduction;
    slot.def = Some(def);
}

fn build_signature(
    ctx: &mut AnalysisContext,
    entity: EntityId,
    def: &mut FunctionDef,
) -> Option<Signature> {
    let parent_record = ctx
        .sym
        .entity(entity)
        .parent
        .filter(|&p| ctx.sym.entity(p).is_record_type());
    let mut params = Vec::new();
    let mut ok = true;
    for param in &mut def.params {
        match param_type(ctx, param, parent_record, &def.name) {
            Some(ty) => params.push(ty),
            None => ok = false,
        }
    }
    let ret = match def.return_type.as_mut() {
        Some(expr) => match analyze_type_expr(ctx, expr) {
            Some(ty) => QualType::const_(ty),
            None => {
                ok = false;
                QualType::const_(ctx.sym.builtins().void)
            }
        },
        // Placeholder until return type deduction runs over the body.
        None => QualType::const_(ctx.sym.builtins().void),
    };
    for &param in &params {
        let object = ctx.sym.strip_reference(param);
        if !ctx.sym.is_complete(object.ty) {
            ctx.issues.error(
                def.range,
                IssueKind::BadPassedType(BadPassedType::Argument {
                    ty: ctx.sym.qual_type_name(&param),
                }),
            );
            ok = false;
        }
    }
    if def.return_type.is_some() {
        let object = ctx.sym.strip_reference(ret);
        if !ctx.sym.is_complete(object.ty)
            && !matches!(ctx.sym.entity(ctx.sym.resolve(object.ty)).kind, EntityKind::VoidType)
        {
            ctx.issues.error(
                def.range,
                IssueKind::BadPassedType(BadPassedType::Return {
                    ty: ctx.sym.qual_type_name(&ret),
                }),
            );
            ok = false;
        }
    }
    ok.then_some(Signature { params, ret })
}

fn param_type(
    ctx: &mut AnalysisContext,
    param: &mut ParamDecl,
    parent_record: Option<EntityId>,
    func_name: &str,
) -> Option<QualType> {
    if let Some(ThisParameter { reference, mutability }) = param.this {
        let Some(record) = parent_record else {
            ctx.issues.error(
                param.range,
                IssueKind::BadStmt(BadStmt::BadFuncDef {
                    name: func_name.to_string(),
                    reason: "'this' parameter outside a member function".to_string(),
                }),
            );
            return None;
        };
        let base = QualType { ty: record, mutability, bind: BindMode::Static };
        let ty = if reference {
            QualType::const_(ctx.sym.reference_type(base))
        } else {
            base.with_mutability(Mutability::Const)
        };
        return Some(ty);
    }
    let expr = param.type_expr.as_mut()?;
    let ty = analyze_type_expr(ctx, expr)?;
    Some(QualType::const_(ty))
}

/// Foreign functions are restricted to types with a C-compatible layout.
fn validate_foreign(ctx: &mut AnalysisContext, def: &FunctionDef, signature: &Signature) {
    let ffi_ok = |ctx: &AnalysisContext, ty: QualType| {
        let ty = ctx.sym.resolve(ty.ty);
        matches!(
            ctx.sym.entity(ty).kind,
            EntityKind::VoidType
                | EntityKind::BoolType
                | EntityKind::ByteType
                | EntityKind::IntType(_)
                | EntityKind::FloatType { .. }
                | EntityKind::PointerType { qual: PointerQual::Raw, .. }
        )
    };
    for &param in &signature.params {
        if !ffi_ok(ctx, param) {
            ctx.issues.error(
                def.range,
                IssueKind::BadPassedType(BadPassedType::Argument {
                    ty: ctx.sym.qual_type_name(&param),
                }),
            );
        }
    }
    if !ffi_ok(ctx, signature.ret) {
        ctx.issues.error(
            def.range,
            IssueKind::BadPassedType(BadPassedType::Return {
                ty: ctx.sym.qual_type_name(&signature.ret),
            }),
        );
    }
    if def.body.is_some() {
        ctx.issues.error(
            def.range,
            IssueKind::BadStmt(BadStmt::BadFuncDef {
                name: def.name.clone(),
                reason: "foreign functions cannot have a body".to_string(),
            }),
        );
    }
}

/// Known C names map onto the builtin table; everything else goes to the
/// program's own foreign slot in declaration order.
fn extern_builtin(name: &str) -> Option<Builtin> {
    Some(match name {
        "abs" => Builtin::Abs,
        "exp" => Builtin::Exp,
        "exp2" => Builtin::Exp2,
        "exp10" => Builtin::Exp10,
        "log" => Builtin::Log,
        "log2" => Builtin::Log2,
        "log10" => Builtin::Log10,
        "pow" => Builtin::Pow,
        "sqrt" => Builtin::Sqrt,
        "cbrt" => Builtin::Cbrt,
        "hypot" => Builtin::Hypot,
        "sin" => Builtin::Sin,
        "cos" => Builtin::Cos,
        "tan" => Builtin::Tan,
        "asin" => Builtin::Asin,
        "acos" => Builtin::Acos,
        "atan" => Builtin::Atan,
        "memcpy" => Builtin::Memcpy,
        "putchar" => Builtin::Putchar,
        "puti64" => Builtin::Puti64,
        "putf64" => Builtin::Putf64,
        "puts" | "putstr" => Builtin::Putstr,
        "trap" => Builtin::Trap,
        _ => return None,
    })
}

fn bind_foreign(ctx: &mut AnalysisContext, entity: EntityId, name: &str) {
    let kind = match extern_builtin(name) {
        Some(builtin) => FunctionKind::Foreign {
            slot: scatha_core::BUILTIN_SLOT,
            index: builtin.into(),
        },
        None => {
            let index = ctx.next_foreign_index;
            ctx.next_foreign_index += 1;
            FunctionKind::Foreign { slot: 1, index }
        }
    };
    if let Some(f) = ctx.sym.entity_mut(entity).as_function_mut() {
        f.kind = kind;
        f.builtin = extern_builtin(name);
    }
}

/// Classify `new`/`move`/`delete` member functions and validate their fixed
/// signatures.
fn detect_smf(
    ctx: &mut AnalysisContext,
    entity: EntityId,
    signature: &Signature,
    def: &FunctionDef,
) {
    let name = def.name.as_str();
    if !matches!(name, "new" | "move" | "delete") {
        return;
    }
    let Some(record) = ctx
        .sym
        .entity(entity)
        .parent
        .filter(|&p| ctx.sym.entity(p).is_record_type())
    else {
        ctx.issues.error(
            def.range,
            IssueKind::BadStmt(BadStmt::BadSMF {
                name: name.to_string(),
                reason: "special member functions must be members".to_string(),
            }),
        );
        return;
    };
    let mut_ref_to_record = |ctx: &AnalysisContext, ty: QualType| match ctx
        .sym
        .entity(ctx.sym.resolve(ty.ty))
        .kind
    {
        EntityKind::ReferenceType { base } => {
            base.is_mut() && ctx.sym.resolve(base.ty) == record
        }
        _ => false,
    };
    let ref_to_record = |ctx: &AnalysisContext, ty: QualType| match ctx
        .sym
        .entity(ctx.sym.resolve(ty.ty))
        .kind
    {
        EntityKind::ReferenceType { base } => ctx.sym.resolve(base.ty) == record,
        _ => false,
    };
    let bad = |ctx: &mut AnalysisContext, reason: &str| {
        ctx.issues.error(
            def.range,
            IssueKind::BadStmt(BadStmt::BadSMF {
                name: name.to_string(),
                reason: reason.to_string(),
            }),
        );
    };
    if signature.params.is_empty() || !mut_ref_to_record(ctx, signature.params[0]) {
        bad(ctx, "the first parameter must be '&mut this'");
        return;
    }
    let smf = match name {
        "delete" => {
            if signature.params.len() != 1 {
                bad(ctx, "'delete' takes no parameters besides '&mut this'");
                return;
            }
            Some(SMFKind::Destructor)
        }
        "move" => {
            if signature.params.len() != 2 || !mut_ref_to_record(ctx, signature.params[1]) {
                bad(ctx, "'move' takes exactly '&mut this' and a '&mut' source");
                return;
            }
            Some(SMFKind::MoveConstructor)
        }
        "new" => match signature.params.len() {
            1 => Some(SMFKind::DefaultConstructor),
            2 if ref_to_record(ctx, signature.params[1]) => Some(SMFKind::CopyConstructor),
            // Other `new` overloads are ordinary constructors.
            _ => None,
        },
        _ => unreachable!(),
    };
    if let Some(f) = ctx.sym.entity_mut(entity).as_function_mut() {
        f.smf = smf;
    }
}

/// Step 6: synthesize lifetime metadata for every record in instantiation
/// order, after signatures exist.
pub fn analyze_lifetimes(ctx: &mut AnalysisContext, order: &[EntityId]) {
    for &record in order {
        let meta = record_lifetime(ctx, record);
        if let Some(data) = ctx.sym.entity_mut(record).as_record_mut() {
            data.lifetime = Some(meta);
        }
    }
}

fn record_lifetime(ctx: &mut AnalysisContext, record: EntityId) -> LifetimeMetadata {
    // User-provided operations win.
    let mut user: [Option<EntityId>; 4] = [None; 4];
    for name in ["new", "move", "delete"] {
        let functions: Vec<_> = ctx
            .sym
            .entity(record)
            .as_record()
            .and_then(|r| r.scope.names.get(name))
            .cloned()
            .unwrap_or_default();
        for f in functions {
            if let Some(smf) = ctx.sym.entity(f).as_function().and_then(|data| data.smf) {
                user[SMFKind::ALL.iter().position(|&k| k == smf).unwrap()] = Some(f);
            }
        }
    }
    let elements = ctx
        .sym
        .entity(record)
        .as_record()
        .map(|r| r.elements.clone())
        .unwrap_or_default();
    let mut meta = LifetimeMetadata::trivial();
    for (i, kind) in SMFKind::ALL.into_iter().enumerate() {
        if let Some(f) = user[i] {
            meta.set_operation(kind, LifetimeOperation::UserDefined(f));
            continue;
        }
        let mut op = LifetimeOperation::Trivial;
        for &element in &elements {
            let ty = match &ctx.sym.entity(element).kind {
                EntityKind::Variable(v) => v.ty.map(|q| q.ty),
                EntityKind::BaseClassObject { ty, .. } => *ty,
                _ => None,
            };
            let Some(ty) = ty else { continue };
            match ctx.sym.lifetime(ty).operation(kind) {
                // A member without the operation deletes it for the whole
                // record unless the user provides one.
                LifetimeOperation::Deleted => {
                    op = LifetimeOperation::Deleted;
                    break;
                }
                LifetimeOperation::Trivial => {}
                _ => op = LifetimeOperation::NontrivialInline,
            }
        }
        meta.set_operation(kind, op);
    }
    meta
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::issue::IssueHandler;
    use crate::parser::parse_unit;
    use crate::sema::symbol_table::{Lookup, SymbolTable};
    use crate::sema::{gather, AnalysisOptions};

    fn instantiate(source: &str) -> (SymbolTable, IssueHandler, Vec<EntityId>) {
        let mut issues = IssueHandler::new();
        let unit = parse_unit([("main.sc", source)], &mut issues);
        let mut sym = SymbolTable::new();
        let order = {
            let mut ctx = AnalysisContext::new(&mut sym, &mut issues, AnalysisOptions::default());
            gather::gather_unit(&mut ctx, unit);
            let order = instantiate_entities(&mut ctx);
            analyze_signatures(&mut ctx);
            analyze_lifetimes(&mut ctx, &order);
            order
        };
        (sym, issues, order)
    }

    /// Resolve a name as the analyzer would from inside the test file.
    fn lookup_in_file(sym: &mut SymbolTable, name: &str) -> Lookup {
        let global = sym.global_scope();
        let file = sym
            .entity(global)
            .scope_data()
            .unwrap()
            .children
            .iter()
            .copied()
            .find(|&c| matches!(sym.entity(c).kind, EntityKind::FileScope { .. }))
            .expect("test unit has a file scope");
        sym.set_current_file(Some(0));
        sym.with_scope_current(file, |sym| sym.unqualified_lookup(name))
    }

    fn record_named(sym: &mut SymbolTable, name: &str) -> EntityId {
        let Lookup::Single(id) = lookup_in_file(sym, name) else {
            panic!("record {name} not found");
        };
        id
    }

    #[test]
    fn test_layout_simple_struct() {
        let (mut sym, issues, _) =
            instantiate("struct P { var x: int; var b: bool; var y: int; }");
        assert!(!issues.has_errors());
        let p = record_named(&mut sym, "P");
        assert_eq!(sym.size_of(p), 24);
        assert_eq!(sym.align_of(p), 8);
        let Lookup::Single(y) = sym.qualified_lookup(p, "y") else { panic!() };
        assert_eq!(sym.entity(y).as_variable().unwrap().offset, Some(16));
    }

    #[test]
    fn test_zero_sized_struct_has_size_one() {
        let (mut sym, issues, _) = instantiate("struct Empty {}");
        assert!(!issues.has_errors());
        let e = record_named(&mut sym, "Empty");
        assert_eq!(sym.size_of(e), 1);
        assert_eq!(sym.align_of(e), 1);
    }

    #[test]
    fn test_nested_struct_layout_follows_dependency_order() {
        let (mut sym, issues, order) = instantiate(
            "struct Outer { var inner: Inner; var tail: bool; } \
             struct Inner { var a: int; var b: int; }",
        );
        assert!(!issues.has_errors());
        let outer = record_named(&mut sym, "Outer");
        let inner = record_named(&mut sym, "Inner");
        assert_eq!(sym.size_of(inner), 16);
        assert_eq!(sym.size_of(outer), 24);
        // Inner instantiates first.
        let inner_pos = order.iter().position(|&r| r == inner).unwrap();
        let outer_pos = order.iter().position(|&r| r == outer).unwrap();
        assert!(inner_pos < outer_pos);
    }

    #[test]
    fn test_definition_cycle_is_detected() {
        let (_, issues, order) =
            instantiate("struct X { var y: Y; } struct Y { var x: X; }");
        assert!(order.is_empty());
        let cycle = issues.iter().find_map(|i| match &i.kind {
            IssueKind::BadStmt(BadStmt::StructDefCycle { cycle }) => Some(cycle.clone()),
            _ => None,
        });
        let cycle = cycle.expect("expected StructDefCycle");
        assert!(cycle.contains(&"X".to_string()));
        assert!(cycle.contains(&"Y".to_string()));
    }

    #[test]
    fn test_pointer_members_break_cycles() {
        let (mut sym, issues, _) =
            instantiate("struct X { var y: *Y; } struct Y { var x: X; }");
        assert!(!issues.has_errors(), "{:?}", issues.iter().collect::<Vec<_>>());
        let x = record_named(&mut sym, "X");
        assert_eq!(sym.size_of(x), 8);
    }

    #[test]
    fn test_array_members_strip_to_element_dependency() {
        let (mut sym, issues, _) =
            instantiate("struct A { var items: [B, 3]; } struct B { var v: int; }");
        assert!(!issues.has_errors());
        let a = record_named(&mut sym, "A");
        assert_eq!(sym.size_of(a), 24);
    }

    #[test]
    fn test_base_class_layout() {
        let (mut sym, issues, _) = instantiate(
            "struct Base { var id: int; } struct Derived: Base { var extra: int; }",
        );
        assert!(!issues.has_errors());
        let derived = record_named(&mut sym, "Derived");
        assert_eq!(sym.size_of(derived), 16);
        // Members of the base are reachable through the derived scope.
        assert!(matches!(sym.qualified_lookup(derived, "id"), Lookup::Single(_)));
    }

    #[test]
    fn test_protocol_cannot_extend_struct() {
        let (_, issues, _) = instantiate("struct S {} protocol P: S {}");
        assert!(issues
            .iter()
            .any(|i| matches!(i.kind, IssueKind::BadStmt(BadStmt::BadBaseDecl { .. }))));
    }

    #[test]
    fn test_signature_analysis() {
        let (mut sym, issues, _) =
            instantiate("fn add(a: int, b: int) -> int { return a + b; }");
        assert!(!issues.has_errors());
        let Lookup::Overloads(set) = lookup_in_file(&mut sym, "add") else { panic!() };
        let f = sym.overload_candidates(set)[0];
        let sig = sym.entity(f).as_function().unwrap().signature.clone().unwrap();
        assert_eq!(sig.params.len(), 2);
        assert_eq!(sym.resolve(sig.params[0].ty), sym.builtins().s64);
        assert_eq!(sym.resolve(sig.ret.ty), sym.builtins().s64);
    }

    #[test]
    fn test_extern_builtin_binding() {
        let (mut sym, issues, _) =
            instantiate("extern \"C\" fn puts(s: *str) -> void;");
        assert!(!issues.has_errors());
        let Lookup::Overloads(set) = lookup_in_file(&mut sym, "puts") else { panic!() };
        let f = sym.overload_candidates(set)[0];
        assert_eq!(
            sym.entity(f).as_function().unwrap().kind,
            FunctionKind::Foreign { slot: 0, index: Builtin::Putstr.into() }
        );
    }

    #[test]
    fn test_unknown_extern_gets_program_slot() {
        let (mut sym, issues, _) =
            instantiate("extern \"C\" fn frobnicate(x: int) -> int;");
        assert!(!issues.has_errors());
        let Lookup::Overloads(set) = lookup_in_file(&mut sym, "frobnicate") else { panic!() };
        let f = sym.overload_candidates(set)[0];
        assert_eq!(
            sym.entity(f).as_function().unwrap().kind,
            FunctionKind::Foreign { slot: 1, index: 0 }
        );
    }

    #[test]
    fn test_foreign_type_validation() {
        let (_, issues, _) = instantiate(
            "struct Big { var a: int; var b: int; } \
             extern \"C\" fn f(x: Big) -> void;",
        );
        assert!(issues
            .iter()
            .any(|i| matches!(i.kind, IssueKind::BadPassedType(BadPassedType::Argument { .. }))));
    }

    #[test]
    fn test_lifetime_synthesis_for_unique_member() {
        let (mut sym, issues, _) = instantiate("struct S { var p: *unique int; }");
        assert!(!issues.has_errors());
        let s = record_named(&mut sym, "S");
        let meta = sym.lifetime(s);
        assert!(meta.operation(SMFKind::DefaultConstructor).is_deleted());
        assert!(meta.operation(SMFKind::CopyConstructor).is_deleted());
        assert_eq!(
            meta.operation(SMFKind::MoveConstructor),
            LifetimeOperation::NontrivialInline
        );
        assert_eq!(
            meta.operation(SMFKind::Destructor),
            LifetimeOperation::NontrivialInline
        );
    }

    #[test]
    fn test_user_smfs_override_synthesis() {
        let (mut sym, issues, _) = instantiate(
            "struct S { \
                var p: *unique int; \
                fn new(&mut this) {} \
                fn delete(&mut this) {} \
             }",
        );
        assert!(!issues.has_errors(), "{:?}", issues.iter().collect::<Vec<_>>());
        let s = record_named(&mut sym, "S");
        let meta = sym.lifetime(s);
        assert!(matches!(
            meta.operation(SMFKind::DefaultConstructor),
            LifetimeOperation::UserDefined(_)
        ));
        assert!(matches!(
            meta.operation(SMFKind::Destructor),
            LifetimeOperation::UserDefined(_)
        ));
        assert!(meta.operation(SMFKind::CopyConstructor).is_deleted());
    }

    #[test]
    fn test_bad_smf_signature_reported() {
        let (_, issues, _) = instantiate("struct S { fn delete(this) {} }");
        assert!(issues
            .iter()
            .any(|i| matches!(i.kind, IssueKind::BadStmt(BadStmt::BadSMF { .. }))));
    }

    #[test]
    fn test_trivial_struct_lifetime() {
        let (mut sym, issues, _) = instantiate("struct P { var x: int; var y: int; }");
        assert!(!issues.has_errors());
        let p = record_named(&mut sym, "P");
        assert!(sym.has_trivial_lifetime(p));
    }
}
