//! Statement analysis and function body processing.
//!
//! Handles variable declarations with type deduction, return type deduction
//! with conflict detection, reachability marking, cleanup gathering for
//! returns and jumps, and the special validation of `main` and the special
//! member functions.

use crate::ast::*;
use crate::issue::{BadExpr, BadStmt, BadTypeDeduction, IssueKind};
use crate::sema::conversion::{self, ConvKind};
use crate::sema::entity::*;
use crate::sema::expr::{analyze_expr, analyze_type_expr, expect_value};
use crate::sema::{AnalysisContext, Frame, FrameKind, FuncState};
use crate::source::SourceRange;

/// Analyze every gathered function body.
pub fn analyze_functions(ctx: &mut AnalysisContext) {
    for index in 0..ctx.functions.len() {
        analyze_function(ctx, index);
    }
}

/// Analyze global variable initializers, in declaration order.
pub fn analyze_globals(ctx: &mut AnalysisContext) {
    for index in 0..ctx.globals.len() {
        let Some(mut decl) = ctx.globals[index].decl.take() else { continue };
        let scope = ctx.globals[index].scope;
        let entity = ctx.globals[index].entity;
        ctx.with_scope(scope, |ctx| {
            ctx.frames.push(Frame { kind: FrameKind::Function, cleanups: CleanupStack::default() });
            let mut temps = CleanupStack::default();
            analyze_var_decl(ctx, &mut decl, Some(entity), &mut temps);
            ctx.frames.pop();
        });
        ctx.globals[index].decl = Some(decl);
    }
}

/// Analyze a function on demand; used by call analysis when the callee's
/// return type must be deduced first. If the function is mid-analysis the
/// deduction is deferred: any returns seen so far decide the type, otherwise
/// the cycle is an error at this callsite.
pub fn ensure_function_analyzed(ctx: &mut AnalysisContext, function: EntityId, range: SourceRange) {
    let Some(&index) = ctx.function_index.get(&function) else { return };
    if !ctx.functions[index].needs_ret_deduction {
        return;
    }
    match ctx.functions[index].state {
        FuncState::Analyzed => {}
        FuncState::Gathered => analyze_function(ctx, index),
        FuncState::Analyzing => match ctx.functions[index].deduced_ret {
            Some((ty, _)) => commit_return_type(ctx, index, ty),
            None => {
                let name = ctx.sym.entity(function).name.clone();
                ctx.issues.error(
                    range,
                    IssueKind::BadStmt(BadStmt::BadFuncDef {
                        name,
                        reason: "return type cannot be deduced for a recursive call"
                            .to_string(),
                    }),
                );
            }
        },
    }
}

fn commit_return_type(ctx: &mut AnalysisContext, index: usize, ret: QualType) {
    let entity = ctx.functions[index].entity;
    ctx.functions[index].needs_ret_deduction = false;
    if let Some(f) = ctx.sym.entity_mut(entity).as_function_mut() {
        if let Some(signature) = f.signature.as_mut() {
            signature.ret = ret;
        }
    }
}

fn analyze_function(ctx: &mut AnalysisContext, index: usize) {
    match ctx.functions[index].state {
        FuncState::Analyzed | FuncState::Analyzing => return,
        FuncState::Gathered => {}
    }
    ctx.functions[index].state = FuncState::Analyzing;
    let entity = ctx.functions[index].entity;
    let Some(mut def) = ctx.functions[index].def.take() else {
        ctx.functions[index].state = FuncState::Analyzed;
        return;
    };
    if ctx.sym.entity(entity).as_function().and_then(|f| f.signature.as_ref()).is_none() {
        // Signature analysis failed; the body would only cascade.
        ctx.functions[index].def = Some(def);
        ctx.functions[index].state = FuncState::Analyzed;
        return;
    }
    if let Some(body) = def.body.take() {
        let previous_function = ctx.current_function.replace(index);
        let previous_frames = std::mem::take(&mut ctx.frames);
        let analyzed = ctx.with_scope(entity, |ctx| {
            declare_parameters(ctx, entity, &mut def);
            ctx.frames
                .push(Frame { kind: FrameKind::Function, cleanups: CleanupStack::default() });
            let body = analyze_stmt(ctx, body);
            ctx.frames.pop();
            body
        });
        def.body = Some(analyzed);
        ctx.frames = previous_frames;
        ctx.current_function = previous_function;
    }
    if ctx.functions[index].needs_ret_deduction {
        let ret = ctx.functions[index]
            .deduced_ret
            .map(|(ty, _)| ty)
            .unwrap_or(QualType::const_(ctx.sym.builtins().void));
        commit_return_type(ctx, index, ret);
    }
    validate_main(ctx, entity, &def);
    ctx.functions[index].def = Some(def);
    ctx.functions[index].state = FuncState::Analyzed;
}

fn declare_parameters(ctx: &mut AnalysisContext, function: EntityId, def: &mut FunctionDef) {
    let signature = ctx
        .sym
        .entity(function)
        .as_function()
        .and_then(|f| f.signature.clone());
    let Some(signature) = signature else { return };
    for (index, (param, &ty)) in def.params.iter_mut().zip(&signature.params).enumerate() {
        if param.this.is_some() {
            let this_ty = ctx.sym.strip_reference(ty);
            let this = ctx.sym.create_this_property(function, this_ty);
            param.entity = Some(this);
            continue;
        }
        let range = param.range;
        let entity = {
            let id = ctx.sym.declare_variable(
                &param.name,
                Mutability::Const,
                false,
                AccessControl::Public,
                range,
                ctx.issues,
            );
            id
        };
        let Some(entity) = entity else { continue };
        ctx.sym.entity_mut(entity).kind = EntityKind::Parameter { ty, index };
        param.entity = Some(entity);
    }
}

/// `main` must be public with a trivially destructible return type and an
/// argument list of either `()` or `(&[*str])`.
fn validate_main(ctx: &mut AnalysisContext, entity: EntityId, def: &FunctionDef) {
    if def.name != "main" {
        return;
    }
    let in_file_scope = ctx
        .sym
        .entity(entity)
        .parent
        .is_some_and(|p| matches!(ctx.sym.entity(p).kind, EntityKind::FileScope { .. }));
    if !in_file_scope {
        return;
    }
    let bad = |ctx: &mut AnalysisContext, reason: &str| {
        ctx.issues.error(
            def.range,
            IssueKind::BadStmt(BadStmt::BadFuncDef {
                name: "main".to_string(),
                reason: reason.to_string(),
            }),
        );
    };
    if def.access == AccessControl::Private {
        bad(ctx, "'main' must be public");
    }
    let Some(signature) = ctx
        .sym
        .entity(entity)
        .as_function()
        .and_then(|f| f.signature.clone())
    else {
        return;
    };
    if !ctx.sym.has_trivial_lifetime(signature.ret.ty) {
        bad(ctx, "'main' must return a type with trivial lifetime");
    }
    let args_ok = match signature.params.as_slice() {
        [] => true,
        [single] => {
            // `&[*str]`
            let stripped = ctx.sym.strip_reference(*single);
            match ctx.sym.entity(ctx.sym.resolve(stripped.ty)).kind {
                EntityKind::ArrayType { elem, count: None } => {
                    matches!(
                        ctx.sym.entity(ctx.sym.resolve(elem)).kind,
                        EntityKind::PointerType { base, .. }
                            if ctx.sym.is_dynamic_array(base.ty)
                    )
                }
                _ => false,
            }
        }
        _ => false,
    };
    if !args_ok {
        bad(ctx, "'main' takes either no arguments or '&[*str]'");
    }
}

// ============================================================================
// Statements
// ============================================================================

fn analyze_stmt(ctx: &mut AnalysisContext, mut stmt: Stmt) -> Stmt {
    let range = stmt.range;
    match stmt.kind {
        StmtKind::Compound(stmts) => {
            let scope = ctx.sym.add_anonymous_scope();
            ctx.sym.push_scope(scope);
            ctx.frames.push(Frame { kind: FrameKind::Block, cleanups: CleanupStack::default() });
            let mut analyzed = Vec::with_capacity(stmts.len());
            let mut terminated = false;
            let mut warned = false;
            for child in stmts {
                let mut child = analyze_stmt(ctx, child);
                if terminated {
                    mark_unreachable(&mut child);
                    if !warned && !matches!(child.kind, StmtKind::Compound(_)) {
                        ctx.issues.warning(
                            child.range,
                            IssueKind::BadStmt(BadStmt::UnreachableStatement),
                        );
                        warned = true;
                    }
                }
                terminated |= terminates(&child);
                analyzed.push(child);
            }
            let frame = ctx.frames.pop().expect("block frame");
            ctx.sym.pop_scope();
            stmt = Stmt::new(StmtKind::Compound(analyzed), range);
            stmt.cleanups = frame.cleanups;
            stmt
        }
        StmtKind::Var(mut decl) => {
            let mut temps = CleanupStack::default();
            analyze_var_decl(ctx, &mut decl, None, &mut temps);
            let mut stmt = Stmt::new(StmtKind::Var(decl), range);
            stmt.cleanups = temps;
            stmt
        }
        StmtKind::Expr(expr) => {
            let mut temps = CleanupStack::default();
            let analyzed = analyze_expr(ctx, expr, &mut temps);
            let kind = match analyzed {
                Some(expr) => StmtKind::Expr(expr),
                None => StmtKind::Empty,
            };
            let mut stmt = Stmt::new(kind, range);
            stmt.cleanups = temps;
            stmt
        }
        StmtKind::Return(expr) => analyze_return(ctx, expr, range),
        StmtKind::If { cond, then_branch, else_branch } => {
            let mut temps = CleanupStack::default();
            let bool_t = QualType::const_(ctx.sym.builtins().bool_);
            let cond = analyze_expr(ctx, cond, &mut temps)
                .and_then(|c| expect_value(ctx, c))
                .and_then(|c| {
                    conversion::convert(
                        ctx.sym,
                        ctx.issues,
                        ConvKind::Implicit,
                        c,
                        bool_t,
                        ValueCategory::RValue,
                    )
                });
            let mut then_branch = Box::new(analyze_stmt(ctx, *then_branch));
            let mut else_branch =
                else_branch.map(|s| Box::new(analyze_stmt(ctx, *s)));
            // A constant condition decides one branch statically.
            if let Some(cond) = &cond {
                match cond.constant() {
                    Some(ConstValue::Bool(true)) => {
                        if let Some(els) = else_branch.as_mut() {
                            mark_unreachable(els);
                        }
                    }
                    Some(ConstValue::Bool(false)) => mark_unreachable(&mut then_branch),
                    _ => {}
                }
            }
            let kind = match cond {
                Some(cond) => StmtKind::If { cond, then_branch, else_branch },
                None => StmtKind::Empty,
            };
            let mut stmt = Stmt::new(kind, range);
            stmt.cleanups = temps;
            stmt
        }
        StmtKind::Loop { kind, init, cond, increment, body } => {
            let scope = ctx.sym.add_anonymous_scope();
            ctx.sym.push_scope(scope);
            ctx.frames.push(Frame { kind: FrameKind::Loop, cleanups: CleanupStack::default() });
            let init = init.map(|s| Box::new(analyze_stmt(ctx, *s)));
            let bool_t = QualType::const_(ctx.sym.builtins().bool_);
            let mut temps = CleanupStack::default();
            let cond = cond.and_then(|c| {
                analyze_expr(ctx, c, &mut temps)
                    .and_then(|c| expect_value(ctx, c))
                    .and_then(|c| {
                        conversion::convert(
                            ctx.sym,
                            ctx.issues,
                            ConvKind::Implicit,
                            c,
                            bool_t,
                            ValueCategory::RValue,
                        )
                    })
            });
            let mut body = Box::new(analyze_stmt(ctx, *body));
            let increment = increment
                .and_then(|e| analyze_expr(ctx, e, &mut temps));
            if let Some(cond) = &cond {
                if cond.constant() == Some(&ConstValue::Bool(false)) {
                    mark_unreachable(&mut body);
                }
            }
            let frame = ctx.frames.pop().expect("loop frame");
            ctx.sym.pop_scope();
            let mut stmt = Stmt::new(
                StmtKind::Loop { kind, init, cond, increment, body },
                range,
            );
            stmt.cleanups = frame.cleanups;
            for cleanup in temps.in_execution_order().collect::<Vec<_>>().into_iter().rev() {
                stmt.cleanups.push(cleanup.clone());
            }
            stmt
        }
        StmtKind::Jump(kind) => {
            let inside_loop = ctx.frames.iter().any(|f| f.kind == FrameKind::Loop);
            if !inside_loop {
                ctx.issues
                    .error(range, IssueKind::BadStmt(BadStmt::JumpOutsideLoop));
                return Stmt::new(StmtKind::Empty, range);
            }
            let mut stmt = Stmt::new(StmtKind::Jump(kind), range);
            stmt.cleanups = ctx.gather_cleanups_to(FrameKind::Loop);
            stmt
        }
        StmtKind::Empty => Stmt::new(StmtKind::Empty, range),
    }
}

fn terminates(stmt: &Stmt) -> bool {
    match &stmt.kind {
        StmtKind::Return(_) | StmtKind::Jump(_) => true,
        StmtKind::If { then_branch, else_branch: Some(else_branch), .. } => {
            terminates(then_branch) && terminates(else_branch)
        }
        _ => false,
    }
}

fn mark_unreachable(stmt: &mut Stmt) {
    stmt.reachable = false;
    match &mut stmt.kind {
        StmtKind::Compound(stmts) => stmts.iter_mut().for_each(mark_unreachable),
        StmtKind::If { then_branch, else_branch, .. } => {
            mark_unreachable(then_branch);
            if let Some(els) = else_branch {
                mark_unreachable(els);
            }
        }
        StmtKind::Loop { body, init, .. } => {
            if let Some(init) = init {
                mark_unreachable(init);
            }
            mark_unreachable(body);
        }
        _ => {}
    }
}

fn analyze_return(ctx: &mut AnalysisContext, expr: Option<Expr>, range: SourceRange) -> Stmt {
    let mut temps = CleanupStack::default();
    let index = ctx.current_function;
    let analyzed = expr
        .and_then(|e| analyze_expr(ctx, e, &mut temps))
        .and_then(|e| expect_value(ctx, e));

    let converted = match index {
        Some(index) => {
            let entity = ctx.functions[index].entity;
            let signature = ctx
                .sym
                .entity(entity)
                .as_function()
                .and_then(|f| f.signature.clone());
            match (analyzed, signature) {
                (expr, _) if ctx.functions[index].needs_ret_deduction => {
                    deduce_return_type(ctx, index, &expr, range);
                    expr
                }
                (Some(expr), Some(signature)) => {
                    let ret = signature.ret;
                    match ctx.sym.entity(ctx.sym.resolve(ret.ty)).kind {
                        EntityKind::ReferenceType { base } => conversion::convert(
                            ctx.sym,
                            ctx.issues,
                            ConvKind::Implicit,
                            expr,
                            base,
                            ValueCategory::LValue,
                        ),
                        EntityKind::VoidType => {
                            ctx.issues.error(
                                range,
                                IssueKind::BadStmt(BadStmt::BadReturn {
                                    reason: "cannot return a value from a void function"
                                        .to_string(),
                                }),
                            );
                            None
                        }
                        _ => {
                            let target = QualType::const_(ctx.sym.resolve(ret.ty));
                            conversion::convert(
                                ctx.sym,
                                ctx.issues,
                                ConvKind::Implicit,
                                expr,
                                target,
                                ValueCategory::RValue,
                            )
                        }
                    }
                }
                (None, Some(signature)) => {
                    let is_void = matches!(
                        ctx.sym.entity(ctx.sym.resolve(signature.ret.ty)).kind,
                        EntityKind::VoidType
                    );
                    if !is_void {
                        ctx.issues.error(
                            range,
                            IssueKind::BadStmt(BadStmt::BadReturn {
                                reason: "non-void function must return a value".to_string(),
                            }),
                        );
                    }
                    None
                }
                (expr, None) => expr,
            }
        }
        None => analyzed,
    };

    // The returned temporary must outlive the cleanups; the caller takes it.
    if let Some(expr) = &converted {
        if let Some(entity) = expr.entity() {
            temps.pop_for(entity);
        }
    }
    let mut stmt = Stmt::new(StmtKind::Return(converted), range);
    stmt.cleanups = ctx.gather_cleanups_to(FrameKind::Function);
    for cleanup in temps.in_execution_order().collect::<Vec<_>>().into_iter().rev() {
        stmt.cleanups.push(cleanup.clone());
    }
    stmt
}

/// Record the type of a `return` in a function without a declared return
/// type; conflicting returns are an error pointing at the earlier one.
fn deduce_return_type(
    ctx: &mut AnalysisContext,
    index: usize,
    expr: &Option<Expr>,
    range: SourceRange,
) {
    let ty = match expr {
        Some(expr) => match expr.deco.ty {
            Some(ty) => QualType::const_(ctx.sym.resolve(ty.ty)),
            None => return,
        },
        None => QualType::const_(ctx.sym.builtins().void),
    };
    match ctx.functions[index].deduced_ret {
        None => ctx.functions[index].deduced_ret = Some((ty, range)),
        Some((existing, previous)) => {
            if existing != ty {
                ctx.issues.error(
                    range,
                    IssueKind::BadStmt(BadStmt::BadReturnTypeDeduction {
                        deduced: ctx.sym.qual_type_name(&ty),
                        conflicting: ctx.sym.qual_type_name(&existing),
                        previous,
                    }),
                );
            }
        }
    }
}

// ============================================================================
// Variable declarations
// ============================================================================

/// Analyze a local or global variable declaration. `predeclared` carries the
/// entity for globals the gather pass already declared.
fn analyze_var_decl(
    ctx: &mut AnalysisContext,
    decl: &mut VarDecl,
    predeclared: Option<EntityId>,
    temps: &mut CleanupStack,
) {
    let range = decl.range;
    let init = decl
        .init
        .take()
        .and_then(|e| analyze_expr(ctx, e, temps))
        .and_then(|e| expect_value(ctx, e));

    // The declared type dominates; otherwise it is deduced from the
    // initializer, possibly through a deduction qualifier.
    let deduced = deduce_type(ctx, decl, init.as_ref());

    let entity = match predeclared {
        Some(entity) => Some(entity),
        None => {
            let id = ctx.sym.declare_variable(
                &decl.name,
                decl.mutability,
                decl.is_static,
                decl.access,
                range,
                ctx.issues,
            );
            decl.entity = id;
            id
        }
    };
    let (Some(entity), Some(ty)) = (entity, deduced) else {
        decl.init = init;
        return;
    };

    if !ctx.sym.is_complete(ty.ty) && !ctx.sym.is_reference(ty.ty) {
        ctx.issues.error(
            range,
            IssueKind::BadStmt(BadStmt::BadVarDecl {
                name: decl.name.clone(),
                reason: format!(
                    "'{}' is not a valid variable type",
                    ctx.sym.type_name(ty.ty)
                ),
            }),
        );
        decl.init = init;
        return;
    }

    ctx.sym.define_variable(entity, ty);

    // Build the initializer: convert the given expression or construct in
    // place with no arguments.
    let object_ty = ctx.sym.strip_reference(ty);
    let init = match init {
        Some(expr) => {
            if ctx.sym.is_reference(ty.ty) {
                conversion::convert(
                    ctx.sym,
                    ctx.issues,
                    ConvKind::Implicit,
                    expr,
                    object_ty,
                    ValueCategory::LValue,
                )
            } else {
                let target = QualType::const_(ctx.sym.resolve(object_ty.ty));
                conversion::convert(
                    ctx.sym,
                    ctx.issues,
                    ConvKind::Implicit,
                    expr,
                    target,
                    ValueCategory::RValue,
                )
            }
        }
        None => construct_in_place(ctx, object_ty, range),
    };

    // The variable takes ownership of its initializer; the enclosing block
    // destroys the variable itself.
    if let Some(expr) = &init {
        if let Some(tmp) = expr.entity() {
            temps.pop_for(tmp);
        }
    }
    if !ctx.sym.is_reference(ty.ty) {
        let dtor = ctx.sym.lifetime(object_ty.ty).operation(SMFKind::Destructor);
        if !dtor.is_trivial() {
            if let Some(frame) = ctx.frames.last_mut() {
                frame.cleanups.push(Cleanup { object: entity, operation: dtor });
            }
        }
    }

    // Propagate constants onto immutable bindings.
    if decl.mutability == Mutability::Const {
        if let Some(constant) = init.as_ref().and_then(|e| e.constant().cloned()) {
            if let Some(var) = ctx.sym.entity_mut(entity).as_variable_mut() {
                var.constant = Some(constant);
            }
        }
    }
    decl.init = init;
}

/// `deduceType`: declared type expression dominates, else the initializer's
/// type; deduction qualifiers pick reference/pointer targets and validate
/// mutability.
fn deduce_type(
    ctx: &mut AnalysisContext,
    decl: &mut VarDecl,
    init: Option<&Expr>,
) -> Option<QualType> {
    let range = decl.range;
    match decl.type_expr.as_mut() {
        Some(expr) => match &expr.kind {
            // `let r: & = x;` / `let r: &mut = x;`
            ExprKind::AddressOf { mutability, operand: None } => {
                let requested = *mutability;
                let init = require_initializer(ctx, decl.name.clone(), init, range)?;
                let init_ty = init.deco.ty?;
                if requested == Mutability::Mut
                    && (!init_ty.is_mut() || init.deco.value_cat != Some(ValueCategory::LValue))
                {
                    ctx.issues.error(
                        range,
                        IssueKind::BadTypeDeduction(BadTypeDeduction::MutabilityMismatch {
                            name: decl.name.clone(),
                        }),
                    );
                    return None;
                }
                let base = QualType {
                    ty: ctx.sym.resolve(init_ty.ty),
                    mutability: requested,
                    bind: BindMode::Static,
                };
                Some(QualType::const_(ctx.sym.reference_type(base)))
            }
            // `let p: * = q;` and friends.
            ExprKind::Deref { mutability, qual, operand: None } => {
                let (requested, qual) = (*mutability, *qual);
                let init = require_initializer(ctx, decl.name.clone(), init, range)?;
                let init_ty = init.deco.ty?;
                let EntityKind::PointerType { base, qual: init_qual } =
                    ctx.sym.entity(ctx.sym.resolve(init_ty.ty)).kind
                else {
                    ctx.issues.error(
                        range,
                        IssueKind::BadTypeDeduction(BadTypeDeduction::NotAPointer {
                            ty: ctx.sym.type_name(init_ty.ty),
                        }),
                    );
                    return None;
                };
                if qual != init_qual || (requested == Mutability::Mut && !base.is_mut()) {
                    ctx.issues.error(
                        range,
                        IssueKind::BadTypeDeduction(BadTypeDeduction::MutabilityMismatch {
                            name: decl.name.clone(),
                        }),
                    );
                    return None;
                }
                let base = base.with_mutability(requested);
                Some(QualType {
                    ty: ctx.sym.pointer_type(base, qual),
                    mutability: decl.mutability,
                    bind: BindMode::Static,
                })
            }
            _ => {
                let ty = analyze_type_expr(ctx, expr)?;
                Some(QualType {
                    ty,
                    mutability: decl.mutability,
                    bind: BindMode::Static,
                })
            }
        },
        None => {
            let init = require_initializer(ctx, decl.name.clone(), init, range)?;
            let ty = init.deco.ty?;
            Some(QualType {
                ty: ctx.sym.resolve(ty.ty),
                mutability: decl.mutability,
                bind: BindMode::Static,
            })
        }
    }
}

fn require_initializer<'e>(
    ctx: &mut AnalysisContext,
    name: String,
    init: Option<&'e Expr>,
    range: SourceRange,
) -> Option<&'e Expr> {
    if init.is_none() {
        ctx.issues.error(
            range,
            IssueKind::BadTypeDeduction(BadTypeDeduction::MissingInitializer { name }),
        );
    }
    init
}

/// Default-construct a variable declared without an initializer.
fn construct_in_place(
    ctx: &mut AnalysisContext,
    ty: QualType,
    range: SourceRange,
) -> Option<Expr> {
    let lifetime = ctx.sym.lifetime(ty.ty);
    let kind = match lifetime.operation(SMFKind::DefaultConstructor) {
        LifetimeOperation::Trivial => ConstructKind::TrivialDefault,
        LifetimeOperation::NontrivialInline => ConstructKind::NontrivialInline,
        LifetimeOperation::UserDefined(f) => {
            let mut node = Expr::new(
                ExprKind::Construct {
                    kind: ConstructKind::Nontrivial,
                    function: Some(f),
                    args: Vec::new(),
                },
                range,
            );
            node.deco.ty = Some(QualType::const_(ctx.sym.resolve(ty.ty)));
            node.deco.value_cat = Some(ValueCategory::RValue);
            return Some(node);
        }
        LifetimeOperation::Deleted => {
            ctx.issues.error(
                range,
                IssueKind::BadExpr(BadExpr::CannotConstructType {
                    ty: ctx.sym.type_name(ty.ty),
                    reason: "the default constructor is deleted".to_string(),
                }),
            );
            return None;
        }
    };
    let mut node = Expr::new(
        ExprKind::Construct { kind, function: None, args: Vec::new() },
        range,
    );
    node.deco.ty = Some(QualType::const_(ctx.sym.resolve(ty.ty)));
    node.deco.value_cat = Some(ValueCategory::RValue);
    Some(node)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::issue::IssueHandler;
    use crate::parser::parse_unit;
    use crate::sema::symbol_table::SymbolTable;
    use crate::sema::{analyze, AnalysisOptions, AnalyzedProgram};

    fn run(source: &str) -> (SymbolTable, IssueHandler, AnalyzedProgram) {
        let mut issues = IssueHandler::new();
        let unit = parse_unit([("main.sc", source)], &mut issues);
        let mut sym = SymbolTable::new();
        let program = analyze(unit, &mut sym, &mut issues, AnalysisOptions::default());
        (sym, issues, program)
    }

    fn assert_clean(issues: &IssueHandler) {
        assert!(
            !issues.has_errors(),
            "unexpected issues: {:#?}",
            issues.iter().collect::<Vec<_>>()
        );
    }

    #[test]
    fn test_simple_function_analyzes() {
        let (_, issues, program) = run("fn main() -> int { return 2 * 3 + 1; }");
        assert_clean(&issues);
        assert_eq!(program.functions.len(), 1);
        let body = program.functions[0].def.body.as_ref().unwrap();
        let StmtKind::Compound(stmts) = &body.kind else { panic!() };
        let StmtKind::Return(Some(expr)) = &stmts[0].kind else { panic!() };
        assert_eq!(expr.constant(), Some(&ConstValue::Int(7)));
    }

    #[test]
    fn test_decoration_totality() {
        let (_, issues, program) = run(
            "fn main() -> int { var x = 3; if x > 1 { x = x + 1; } return x; }",
        );
        assert_clean(&issues);
        fn check_expr(expr: &Expr) {
            assert!(expr.is_decorated(), "undecorated expression: {:?}", expr.kind);
        }
        fn walk(stmt: &Stmt) {
            match &stmt.kind {
                StmtKind::Compound(stmts) => stmts.iter().for_each(walk),
                StmtKind::Expr(e) | StmtKind::Return(Some(e)) => check_expr(e),
                StmtKind::Var(decl) => {
                    if let Some(init) = &decl.init {
                        check_expr(init);
                    }
                }
                StmtKind::If { cond, then_branch, else_branch } => {
                    check_expr(cond);
                    walk(then_branch);
                    if let Some(els) = else_branch {
                        walk(els);
                    }
                }
                _ => {}
            }
        }
        walk(program.functions[0].def.body.as_ref().unwrap());
    }

    #[test]
    fn test_return_type_deduction() {
        let (sym, issues, program) = run("fn f() { return 42; } fn main() { f(); }");
        assert_clean(&issues);
        let f = program.functions[0].entity;
        let sig = sym.entity(f).as_function().unwrap().signature.clone().unwrap();
        assert_eq!(sym.resolve(sig.ret.ty), sym.builtins().s64);
    }

    #[test]
    fn test_conflicting_return_types() {
        let (_, issues, _) = run("fn f(c: bool) { if c { return 1; } return 1.5; }");
        assert!(issues.iter().any(|i| {
            matches!(i.kind, IssueKind::BadStmt(BadStmt::BadReturnTypeDeduction { .. }))
        }));
    }

    #[test]
    fn test_void_deduction_without_returns() {
        let (sym, issues, program) = run("fn f() { } fn main() { f(); }");
        assert_clean(&issues);
        let f = program.functions[0].entity;
        let sig = sym.entity(f).as_function().unwrap().signature.clone().unwrap();
        assert_eq!(sym.resolve(sig.ret.ty), sym.builtins().void);
    }

    #[test]
    fn test_unreachable_statement_warning() {
        let (_, issues, _) = run("fn f() -> int { return 1; var x = 2; }");
        assert!(!issues.has_errors());
        assert!(issues
            .iter()
            .any(|i| matches!(i.kind, IssueKind::BadStmt(BadStmt::UnreachableStatement))));
    }

    #[test]
    fn test_jump_outside_loop() {
        let (_, issues, _) = run("fn f() { break; }");
        assert!(issues
            .iter()
            .any(|i| matches!(i.kind, IssueKind::BadStmt(BadStmt::JumpOutsideLoop))));
    }

    #[test]
    fn test_variable_type_deduction() {
        let (sym, issues, program) = run("fn f() { let x = 1.5; }");
        assert_clean(&issues);
        let body = program.functions[0].def.body.as_ref().unwrap();
        let StmtKind::Compound(stmts) = &body.kind else { panic!() };
        let StmtKind::Var(decl) = &stmts[0].kind else { panic!() };
        let var = sym.entity(decl.entity.unwrap()).as_variable().unwrap();
        assert_eq!(sym.resolve(var.ty.unwrap().ty), sym.builtins().f64);
    }

    #[test]
    fn test_missing_initializer_for_deduction() {
        let (_, issues, _) = run("fn f() { let x; }");
        assert!(issues.iter().any(|i| {
            matches!(
                i.kind,
                IssueKind::BadTypeDeduction(BadTypeDeduction::MissingInitializer { .. })
            )
        }));
    }

    #[test]
    fn test_pointer_deduction_qualifier() {
        let (_, issues, _) =
            run("fn f() { var x = 1; let p = &mut x; let q: *mut = p; }");
        assert_clean(&issues);
    }

    #[test]
    fn test_reference_deduction_mutability_mismatch() {
        let (_, issues, _) = run("fn f() { let x = 1; let r: &mut = x; }");
        assert!(issues.iter().any(|i| {
            matches!(
                i.kind,
                IssueKind::BadTypeDeduction(BadTypeDeduction::MutabilityMismatch { .. })
            )
        }));
    }

    #[test]
    fn test_const_propagation_to_variable() {
        let (_, issues, program) = run("fn f() -> int { let n = 6; return n * 7; }");
        assert_clean(&issues);
        let body = program.functions[0].def.body.as_ref().unwrap();
        let StmtKind::Compound(stmts) = &body.kind else { panic!() };
        let StmtKind::Return(Some(expr)) = &stmts[1].kind else { panic!() };
        assert_eq!(expr.constant(), Some(&ConstValue::Int(42)));
    }

    #[test]
    fn test_overload_resolution_end_to_end() {
        let (_, issues, _) = run(
            "fn f(n: int) -> int { return n; } \
             fn f(d: double) -> double { return d; } \
             fn main() { f(1); f(1.0); }",
        );
        assert_clean(&issues);
    }

    #[test]
    fn test_overload_no_match() {
        let (_, issues, _) = run(
            "fn f(n: int) -> int { return n; } \
             fn f(d: double) -> double { return d; } \
             fn main() { f(\"s\"); }",
        );
        assert!(issues.iter().any(|i| {
            matches!(
                i.kind,
                IssueKind::OverloadResolution(crate::issue::ORError::NoMatch { .. })
            )
        }));
    }

    #[test]
    fn test_member_access_and_methods() {
        let (_, issues, _) = run(
            "struct Point { \
                var x: int; \
                var y: int; \
                fn sum(&this) -> int { return this.x + this.y; } \
             } \
             fn main() -> int { \
                var p = Point(1, 2); \
                return p.sum(); \
             }",
        );
        assert_clean(&issues);
    }

    #[test]
    fn test_member_without_object() {
        let (_, issues, _) = run(
            "struct S { var v: int; fn f(&this) -> int { return v; } }",
        );
        assert!(issues.iter().any(|i| {
            matches!(
                i.kind,
                IssueKind::BadExpr(BadExpr::AccessedMemberWithoutObject { .. })
            )
        }));
    }

    #[test]
    fn test_cannot_construct_type_with_deleted_default_ctor() {
        let (_, issues, _) = run(
            "struct S { var p: *unique int; } fn f() { var s: S; }",
        );
        assert!(issues.iter().any(|i| {
            matches!(i.kind, IssueKind::BadExpr(BadExpr::CannotConstructType { .. }))
        }));
    }

    #[test]
    fn test_cleanup_registered_for_nontrivial_local() {
        let (_, issues, program) = run(
            "fn f() { var p = unique 42; var q = unique 43; }",
        );
        assert_clean(&issues);
        let body = program.functions[0].def.body.as_ref().unwrap();
        // Both unique pointers are destroyed by the enclosing block, in
        // reverse declaration order.
        assert_eq!(body.cleanups.len(), 2);
        let StmtKind::Compound(stmts) = &body.kind else { panic!() };
        let first = body.cleanups.in_execution_order().next().unwrap();
        let StmtKind::Var(q_decl) = &stmts[1].kind else { panic!() };
        assert_eq!(first.object, q_decl.entity.unwrap());
    }

    #[test]
    fn test_return_gathers_parent_cleanups() {
        let (_, issues, program) = run(
            "fn f(c: bool) -> int { \
                var p = unique 1; \
                if c { var q = unique 2; return 1; } \
                return 0; \
             }",
        );
        assert_clean(&issues);
        let body = program.functions[0].def.body.as_ref().unwrap();
        let StmtKind::Compound(stmts) = &body.kind else { panic!() };
        let StmtKind::If { then_branch, .. } = &stmts[1].kind else { panic!() };
        let StmtKind::Compound(inner) = &then_branch.kind else { panic!() };
        let StmtKind::Return(_) = &inner[1].kind else { panic!() };
        // The inner return destroys both q and p.
        assert_eq!(inner[1].cleanups.len(), 2);
    }

    #[test]
    fn test_explicit_smf_call_rejected() {
        let (_, issues, _) = run(
            "struct S { var p: *unique int; fn delete(&mut this) {} } \
             fn f(s: &mut S) { s.delete(); }",
        );
        assert!(issues
            .iter()
            .any(|i| matches!(i.kind, IssueKind::BadExpr(BadExpr::ExplicitSMFCall { .. }))));
    }

    #[test]
    fn test_main_signature_validation() {
        let (_, issues, _) = run("private fn main() {}");
        assert!(issues
            .iter()
            .any(|i| matches!(i.kind, IssueKind::BadStmt(BadStmt::BadFuncDef { .. }))));
    }

    #[test]
    fn test_dynamic_array_local_rejected() {
        let (_, issues, _) = run("fn f() { var xs: [int]; }");
        assert!(issues
            .iter()
            .any(|i| matches!(i.kind, IssueKind::BadStmt(BadStmt::BadVarDecl { .. }))));
    }

    #[test]
    fn test_unique_dyn_array_construction() {
        let (_, issues, _) = run("fn f() { var xs = unique [int](16); }");
        assert_clean(&issues);
    }

    #[test]
    fn test_dyn_array_construction_outside_unique() {
        let (_, issues, _) = run("fn f() { [int](16); }");
        assert!(issues
            .iter()
            .any(|i| matches!(i.kind, IssueKind::BadExpr(BadExpr::DynArrayConstructMisuse))));
    }

    #[test]
    fn test_fstring_formatter_selection() {
        let (sym, issues, program) = run(
            "fn f(n: int, x: double, b: bool) { let s = \"n=\\(n) x=\\(x) b=\\(b)\"; }",
        );
        assert_clean(&issues);
        let body = program.functions[0].def.body.as_ref().unwrap();
        let StmtKind::Compound(stmts) = &body.kind else { panic!() };
        let StmtKind::Var(decl) = &stmts[0].kind else { panic!() };
        let ExprKind::FString(parts) = &decl.init.as_ref().unwrap().kind else { panic!() };
        let formatters: Vec<_> = parts
            .iter()
            .filter_map(|p| match p {
                FStringPart::Operand { formatter, .. } => *formatter,
                _ => None,
            })
            .collect();
        assert_eq!(formatters.len(), 3);
        use scatha_core::Builtin;
        assert_eq!(formatters[0], sym.builtin_function(Builtin::FstringWrites64));
        assert_eq!(formatters[1], sym.builtin_function(Builtin::FstringWritef64));
        assert_eq!(formatters[2], sym.builtin_function(Builtin::FstringWritebool));
    }

    #[test]
    fn test_fstring_self_recursive_to_string() {
        let (_, issues, _) = run(
            "struct S { \
                var v: int; \
                fn to_string(&this) -> S { return S(1); } \
             } \
             fn f(s: S) { let out = \"\\(s)\"; }",
        );
        assert!(issues
            .iter()
            .any(|i| matches!(i.kind, IssueKind::BadExpr(BadExpr::NotFormattable { .. }))));
    }

    #[test]
    fn test_empty_translation_unit() {
        let (_, issues, program) = run("");
        assert_clean(&issues);
        assert!(program.functions.is_empty());
        assert!(program.records.is_empty());
    }
}
