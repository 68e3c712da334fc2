//! Expression analysis.
//!
//! Every returned expression is fully decorated with an entity, type and
//! value category, had implicit conversions inserted, and registered its
//! temporaries on the surrounding cleanup stack. Failed subtrees return
//! `None` after reporting; callers bail silently, so each root cause is
//! reported once.

use crate::ast::*;
use crate::issue::{BadExpr, IssueHandler, IssueKind};
use crate::sema::conversion::{self, ConvKind};
use crate::sema::entity::*;
use crate::sema::overload::{self, Argument};
use crate::sema::symbol_table::Lookup;
use crate::sema::{stmt, AnalysisContext};
use crate::source::SourceRange;
use scatha_core::Builtin;

/// What an analyzed expression denotes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExprCategory {
    Value,
    Type,
    Scope,
    Callable,
}

pub fn categorize(ctx: &AnalysisContext, expr: &Expr) -> ExprCategory {
    if expr.deco.ty.is_some() {
        return ExprCategory::Value;
    }
    match expr.entity().map(|e| &ctx.sym.entity(e).kind) {
        Some(EntityKind::Function(_)) | Some(EntityKind::OverloadSet { .. }) => {
            ExprCategory::Callable
        }
        Some(EntityKind::Namespace(_))
        | Some(EntityKind::NativeLibrary(_))
        | Some(EntityKind::FileScope { .. }) => ExprCategory::Scope,
        Some(kind) if type_like(kind) => ExprCategory::Type,
        _ => ExprCategory::Value,
    }
}

fn type_like(kind: &EntityKind) -> bool {
    matches!(
        kind,
        EntityKind::VoidType
            | EntityKind::ByteType
            | EntityKind::BoolType
            | EntityKind::IntType(_)
            | EntityKind::FloatType { .. }
            | EntityKind::NullPtrType
            | EntityKind::PointerType { .. }
            | EntityKind::ReferenceType { .. }
            | EntityKind::ArrayType { .. }
            | EntityKind::StructType(_)
            | EntityKind::ProtocolType(_)
    )
}

// ============================================================================
// Type position
// ============================================================================

/// Analyze an expression in type position, returning the named object (or
/// reference) type.
pub fn analyze_type_expr(ctx: &mut AnalysisContext, expr: &mut Expr) -> Option<EntityId> {
    let ty = analyze_type_expr_inner(ctx, expr)?;
    expr.deco.entity = Some(ty);
    Some(ty)
}

fn analyze_type_expr_inner(ctx: &mut AnalysisContext, expr: &mut Expr) -> Option<EntityId> {
    match &mut expr.kind {
        ExprKind::Ident(name) => {
            let name = name.clone();
            lookup_type(ctx, &name, expr.range)
        }
        ExprKind::MemberAccess { object, member } => {
            let scope = analyze_scope_expr(ctx, object)?;
            let ExprKind::Ident(name) = &member.kind else {
                report(ctx.issues, expr.range, BadExpr::Generic {
                    message: "expected a type name".to_string(),
                });
                return None;
            };
            let name = name.clone();
            match ctx.sym.qualified_lookup(scope, &name) {
                Lookup::Single(id) => {
                    let id = ctx.sym.resolve(id);
                    if ctx.sym.entity(id).is_poison() {
                        return None;
                    }
                    if !ctx.sym.entity(id).is_type() {
                        report(ctx.issues, expr.range, BadExpr::BadSymbolReference {
                            name,
                            expected: "type",
                        });
                        return None;
                    }
                    member.deco.entity = Some(id);
                    Some(id)
                }
                Lookup::None => {
                    report(ctx.issues, expr.range, BadExpr::MemberNotFound {
                        ty: ctx.sym.entity(scope).name.clone(),
                        name,
                    });
                    None
                }
                _ => {
                    report(ctx.issues, expr.range, BadExpr::AmbiguousMemberAccess { name });
                    None
                }
            }
        }
        ExprKind::Deref { mutability, qual, operand } => {
            let (mutability, qual) = (*mutability, *qual);
            let Some(operand) = operand.as_mut() else {
                ctx.issues.error(
                    expr.range,
                    IssueKind::BadTypeDeduction(crate::issue::BadTypeDeduction::InvalidContext),
                );
                return None;
            };
            let base = analyze_type_expr(ctx, operand)?;
            let base = QualType { ty: base, mutability, bind: BindMode::Static };
            Some(ctx.sym.pointer_type(base, qual))
        }
        ExprKind::AddressOf { mutability, operand } => {
            let mutability = *mutability;
            let Some(operand) = operand.as_mut() else {
                ctx.issues.error(
                    expr.range,
                    IssueKind::BadTypeDeduction(crate::issue::BadTypeDeduction::InvalidContext),
                );
                return None;
            };
            let base = analyze_type_expr(ctx, operand)?;
            let base = QualType { ty: base, mutability, bind: BindMode::Static };
            Some(ctx.sym.reference_type(base))
        }
        ExprKind::List(elems) => match elems.len() {
            // `[T]` is a dynamic array type, `[T, N]` a fixed one.
            1 => {
                let elem = analyze_type_expr(ctx, &mut elems[0])?;
                Some(ctx.sym.array_type(elem, None))
            }
            2 => {
                let elem = analyze_type_expr(ctx, &mut elems[0])?;
                let mut cleanups = CleanupStack::default();
                let count_range = elems[1].range;
                let count = analyze_expr_at(ctx, &mut elems[1], &mut cleanups)?;
                match count.constant() {
                    Some(ConstValue::Int(n)) if *n >= 0 => {
                        Some(ctx.sym.array_type(elem, Some(*n as u64)))
                    }
                    _ => {
                        report(ctx.issues, count_range, BadExpr::Generic {
                            message: "array length must be a constant integer".to_string(),
                        });
                        None
                    }
                }
            }
            _ => {
                report(ctx.issues, expr.range, BadExpr::Generic {
                    message: "malformed array type".to_string(),
                });
                None
            }
        },
        _ => {
            report(ctx.issues, expr.range, BadExpr::BadSymbolReference {
                name: String::new(),
                expected: "type",
            });
            None
        }
    }
}

fn lookup_type(ctx: &mut AnalysisContext, name: &str, range: SourceRange) -> Option<EntityId> {
    match ctx.sym.unqualified_lookup(name) {
        Lookup::Single(id) => {
            let id = ctx.sym.resolve(id);
            if ctx.sym.entity(id).is_poison() {
                return None;
            }
            if ctx.sym.entity(id).is_type() {
                Some(id)
            } else {
                report(ctx.issues, range, BadExpr::BadSymbolReference {
                    name: name.to_string(),
                    expected: "type",
                });
                None
            }
        }
        Lookup::None => {
            report_undeclared(ctx, name, range);
            None
        }
        _ => {
            report(ctx.issues, range, BadExpr::BadSymbolReference {
                name: name.to_string(),
                expected: "type",
            });
            None
        }
    }
}

/// Analyze an expression that must denote a scope (type, namespace or
/// library).
fn analyze_scope_expr(ctx: &mut AnalysisContext, expr: &mut Expr) -> Option<EntityId> {
    match &expr.kind {
        ExprKind::Ident(name) => {
            let name = name.clone();
            match ctx.sym.unqualified_lookup(&name) {
                Lookup::Single(id) => {
                    let id = ctx.sym.resolve(id);
                    if ctx.sym.entity(id).is_poison() {
                        return None;
                    }
                    if ctx.sym.entity(id).is_scope() {
                        expr.deco.entity = Some(id);
                        Some(id)
                    } else {
                        report(ctx.issues, expr.range, BadExpr::BadSymbolReference {
                            name,
                            expected: "type or namespace",
                        });
                        None
                    }
                }
                Lookup::None => {
                    report_undeclared(ctx, &name, expr.range);
                    None
                }
                _ => {
                    report(ctx.issues, expr.range, BadExpr::BadSymbolReference {
                        name,
                        expected: "type or namespace",
                    });
                    None
                }
            }
        }
        _ => None,
    }
}

// ============================================================================
// Value position
// ============================================================================

fn report(issues: &mut IssueHandler, range: SourceRange, err: BadExpr) {
    issues.error(range, IssueKind::BadExpr(err));
}

fn report_undeclared(ctx: &mut AnalysisContext, name: &str, range: SourceRange) {
    if ctx.sym.name_exists_anywhere(name) {
        report(ctx.issues, range, BadExpr::AccessDenied { name: name.to_string() });
    } else {
        report(ctx.issues, range, BadExpr::UndeclaredName { name: name.to_string() });
    }
    // Poison the name so later references fail silently.
    ctx.sym.declare_poison(name);
}

fn decorate(expr: &mut Expr, ty: QualType, cat: ValueCategory) {
    expr.deco.ty = Some(ty);
    expr.deco.value_cat = Some(cat);
}

/// Register a cleanup for a non-trivial rvalue, creating a temporary entity
/// if the expression has none.
fn register_cleanup(ctx: &mut AnalysisContext, expr: &mut Expr, cleanups: &mut CleanupStack) {
    let Some(ty) = expr.deco.ty else { return };
    if expr.deco.value_cat != Some(ValueCategory::RValue) {
        return;
    }
    let lifetime = ctx.sym.lifetime(ty.ty);
    let dtor = lifetime.operation(SMFKind::Destructor);
    if dtor.is_trivial() {
        return;
    }
    let object = match expr.entity() {
        Some(e) if matches!(ctx.sym.entity(e).kind, EntityKind::Temporary { .. }) => e,
        _ => {
            let tmp = ctx.sym.create_temporary(ty);
            expr.deco.entity = Some(tmp);
            tmp
        }
    };
    cleanups.push(Cleanup { object, operation: dtor });
}

/// Analyze `expr` in place as a value; the helper owns the node swap that
/// rewrites like conversion insertion need.
pub fn analyze_expr_at<'a>(
    ctx: &mut AnalysisContext,
    slot: &'a mut Expr,
    cleanups: &mut CleanupStack,
) -> Option<&'a mut Expr> {
    let expr = std::mem::replace(slot, Expr::new(ExprKind::NullLit, SourceRange::default()));
    let analyzed = analyze_expr(ctx, expr, cleanups)?;
    *slot = analyzed;
    Some(slot)
}

/// Analyze an owned expression, returning the decorated (possibly rewritten)
/// node.
pub fn analyze_expr(
    ctx: &mut AnalysisContext,
    mut expr: Expr,
    cleanups: &mut CleanupStack,
) -> Option<Expr> {
    let range = expr.range;
    match &mut expr.kind {
        ExprKind::IntLit(v) => {
            let v = *v;
            decorate(
                &mut expr,
                QualType::const_(ctx.sym.builtins().s64),
                ValueCategory::RValue,
            );
            expr.deco.constant = Some(ConstValue::Int(v as i64));
            Some(expr)
        }
        ExprKind::FloatLit(v) => {
            let v = *v;
            decorate(
                &mut expr,
                QualType::const_(ctx.sym.builtins().f64),
                ValueCategory::RValue,
            );
            expr.deco.constant = Some(ConstValue::Float(v));
            Some(expr)
        }
        ExprKind::BoolLit(v) => {
            let v = *v;
            decorate(
                &mut expr,
                QualType::const_(ctx.sym.builtins().bool_),
                ValueCategory::RValue,
            );
            expr.deco.constant = Some(ConstValue::Bool(v));
            Some(expr)
        }
        ExprKind::CharLit(v) => {
            let v = *v;
            decorate(
                &mut expr,
                QualType::const_(ctx.sym.builtins().byte),
                ValueCategory::RValue,
            );
            expr.deco.constant = Some(ConstValue::Int(v as i64));
            Some(expr)
        }
        ExprKind::NullLit => {
            decorate(
                &mut expr,
                QualType::const_(ctx.sym.builtins().nullptr),
                ValueCategory::RValue,
            );
            Some(expr)
        }
        ExprKind::StringLit(_) => {
            let str_ = ctx.sym.builtins().str_;
            let ptr = ctx.sym.pointer_type(QualType::const_(str_), PointerQual::Raw);
            decorate(&mut expr, QualType::const_(ptr), ValueCategory::RValue);
            Some(expr)
        }
        ExprKind::This => analyze_this(ctx, expr),
        ExprKind::Ident(name) => {
            let name = name.clone();
            analyze_ident(ctx, expr, &name)
        }
        ExprKind::MemberAccess { .. } => analyze_member_access(ctx, expr, cleanups),
        ExprKind::Unary { .. } => analyze_unary(ctx, expr, cleanups),
        ExprKind::Binary { .. } => analyze_binary(ctx, expr, cleanups),
        ExprKind::Conditional { .. } => analyze_conditional(ctx, expr, cleanups),
        ExprKind::Call { .. } => analyze_call(ctx, expr, cleanups),
        ExprKind::Subscript { .. } => analyze_subscript(ctx, expr, cleanups),
        ExprKind::SubscriptSlice { .. } => analyze_subscript_slice(ctx, expr, cleanups),
        ExprKind::Cast { .. } => analyze_cast(ctx, expr, cleanups),
        ExprKind::List(_) => analyze_list(ctx, expr, cleanups),
        ExprKind::Move(_) => analyze_move(ctx, expr, cleanups),
        ExprKind::Unique(_) => analyze_unique(ctx, expr, cleanups),
        ExprKind::AddressOf { operand: Some(_), .. } => {
            analyze_address_of(ctx, expr, cleanups)
        }
        ExprKind::Deref { operand: Some(_), .. } => analyze_deref(ctx, expr, cleanups),
        ExprKind::AddressOf { operand: None, .. } | ExprKind::Deref { operand: None, .. } => {
            ctx.issues.error(
                range,
                IssueKind::BadTypeDeduction(crate::issue::BadTypeDeduction::InvalidContext),
            );
            None
        }
        ExprKind::FString(_) => analyze_fstring(ctx, expr, cleanups),
        ExprKind::Generic { .. } => {
            report(ctx.issues, range, BadExpr::Generic {
                message: "generic expression is only valid as a callee".to_string(),
            });
            None
        }
        ExprKind::Conversion { .. } | ExprKind::Construct { .. }
        | ExprKind::NontrivAssign { .. } => {
            // Synthesized nodes are already decorated.
            Some(expr)
        }
    }
}

fn analyze_this(ctx: &mut AnalysisContext, mut expr: Expr) -> Option<Expr> {
    let Some(index) = ctx.current_function else {
        report(ctx.issues, expr.range, BadExpr::InvalidUseOfThis);
        return None;
    };
    let function = ctx.functions[index].entity;
    let this = ctx.sym.qualified_lookup(function, "this");
    let Lookup::Single(this) = this else {
        report(ctx.issues, expr.range, BadExpr::InvalidUseOfThis);
        return None;
    };
    let EntityKind::ThisProperty { ty } = ctx.sym.entity(this).kind else {
        report(ctx.issues, expr.range, BadExpr::InvalidUseOfThis);
        return None;
    };
    expr.deco.entity = Some(this);
    decorate(&mut expr, ty, ValueCategory::LValue);
    Some(expr)
}

fn analyze_ident(ctx: &mut AnalysisContext, mut expr: Expr, name: &str) -> Option<Expr> {
    let found = ctx.sym.unqualified_lookup(name);
    let id = match found {
        Lookup::None => {
            report_undeclared(ctx, name, expr.range);
            return None;
        }
        Lookup::Ambiguous(_) => {
            report(ctx.issues, expr.range, BadExpr::AmbiguousMemberAccess { name: name.to_string() });
            return None;
        }
        Lookup::Single(id) | Lookup::Overloads(id) => id,
    };
    if ctx.sym.entity(id).is_poison() {
        return None;
    }
    decorate_entity_ref(ctx, &mut expr, id, name)?;
    Some(expr)
}

/// Decorate a name reference per the entity it denotes.
fn decorate_entity_ref(
    ctx: &mut AnalysisContext,
    expr: &mut Expr,
    id: EntityId,
    name: &str,
) -> Option<()> {
    expr.deco.entity = Some(id);
    match &ctx.sym.entity(id).kind {
        EntityKind::Variable(data) => {
            let data = data.clone();
            // Non-static data members need an object.
            let parent_is_record = ctx
                .sym
                .entity(id)
                .parent
                .is_some_and(|p| ctx.sym.entity(p).is_record_type());
            if parent_is_record && !data.is_static {
                report(ctx.issues, expr.range, BadExpr::AccessedMemberWithoutObject {
                    name: name.to_string(),
                });
                return None;
            }
            let ty = data.ty?;
            expr.deco.constant = data.constant.clone();
            // Reference-typed variables transparently denote their referent.
            let ty = ctx.sym.strip_reference(ty.with_mutability(data.mutability));
            decorate(expr, ty, ValueCategory::LValue);
        }
        EntityKind::Parameter { ty, .. } => {
            let ty = ctx.sym.strip_reference(*ty);
            decorate(expr, ty, ValueCategory::LValue);
        }
        EntityKind::Temporary { ty } | EntityKind::ThisProperty { ty } => {
            let ty = *ty;
            decorate(expr, ty, ValueCategory::LValue);
        }
        EntityKind::Function(_) | EntityKind::OverloadSet { .. } => {
            // Callable; usable only as a callee.
        }
        kind if type_like(kind) => {}
        EntityKind::Namespace(_) | EntityKind::NativeLibrary(_) => {}
        _ => {
            report(ctx.issues, expr.range, BadExpr::BadSymbolReference {
                name: name.to_string(),
                expected: "value",
            });
            return None;
        }
    }
    Some(())
}

fn analyze_member_access(
    ctx: &mut AnalysisContext,
    expr: Expr,
    cleanups: &mut CleanupStack,
) -> Option<Expr> {
    let range = expr.range;
    let ExprKind::MemberAccess { object, member } = expr.kind else { unreachable!() };
    let ExprKind::Ident(member_name) = &member.kind else {
        report(ctx.issues, range, BadExpr::Generic { message: "invalid member access".to_string() });
        return None;
    };
    let member_name = member_name.clone();
    let mut object = analyze_expr(ctx, *object, cleanups)?;

    match categorize(ctx, &object) {
        ExprCategory::Type | ExprCategory::Scope => {
            let scope = object.entity()?;
            let found = ctx.sym.qualified_lookup(scope, &member_name);
            let id = match found {
                Lookup::None => {
                    if ctx.sym.entity(scope).scope_data().is_some_and(|s| {
                        s.names.contains_key(&member_name)
                    }) {
                        report(ctx.issues, range, BadExpr::AccessDenied { name: member_name });
                    } else {
                        report(ctx.issues, range, BadExpr::MemberNotFound {
                            ty: ctx.sym.entity(scope).name.clone(),
                            name: member_name,
                        });
                    }
                    return None;
                }
                Lookup::Ambiguous(_) => {
                    report(ctx.issues, range, BadExpr::AmbiguousMemberAccess { name: member_name });
                    return None;
                }
                Lookup::Single(id) | Lookup::Overloads(id) => id,
            };
            let mut node = Expr::new(
                ExprKind::MemberAccess { object: Box::new(object), member },
                range,
            );
            decorate_entity_ref(ctx, &mut node, id, &member_name)?;
            return Some(node);
        }
        ExprCategory::Callable => {
            report(ctx.issues, range, BadExpr::Generic {
                message: "cannot access members of a function".to_string(),
            });
            return None;
        }
        ExprCategory::Value => {}
    }

    // Member of a value: peek through pointers.
    let object_ty = object.ty();
    if ctx.sym.is_pointer(object_ty.ty) {
        object = synthesize_deref(ctx, object)?;
    }
    let object_ty = object.ty();
    let object_cat = object.value_cat();

    // Arrays expose `count`.
    if let EntityKind::ArrayType { count, .. } =
        ctx.sym.entity(ctx.sym.resolve(object_ty.ty)).kind
    {
        if member_name == "count" {
            let mut node = Expr::new(
                ExprKind::MemberAccess { object: Box::new(object), member },
                range,
            );
            decorate(
                &mut node,
                QualType::const_(ctx.sym.builtins().s64),
                ValueCategory::RValue,
            );
            if let Some(n) = count {
                node.deco.constant = Some(ConstValue::Int(n as i64));
            }
            return Some(node);
        }
        report(ctx.issues, range, BadExpr::MemberNotFound {
            ty: ctx.sym.type_name(object_ty.ty),
            name: member_name,
        });
        return None;
    }

    if !ctx.sym.entity(ctx.sym.resolve(object_ty.ty)).is_record_type() {
        report(ctx.issues, range, BadExpr::MemberNotFound {
            ty: ctx.sym.type_name(object_ty.ty),
            name: member_name,
        });
        return None;
    }
    let record = ctx.sym.resolve(object_ty.ty);
    let found = ctx.sym.qualified_lookup(record, &member_name);
    let id = match found {
        Lookup::None => {
            report(ctx.issues, range, BadExpr::MemberNotFound {
                ty: ctx.sym.type_name(record),
                name: member_name,
            });
            return None;
        }
        Lookup::Ambiguous(_) => {
            report(ctx.issues, range, BadExpr::AmbiguousMemberAccess { name: member_name });
            return None;
        }
        Lookup::Single(id) | Lookup::Overloads(id) => id,
    };
    // File-private members are inaccessible from other files.
    if ctx.sym.entity(id).access == AccessControl::Private
        && ctx.sym.entity(id).file != ctx.sym.current_file()
    {
        report(ctx.issues, range, BadExpr::AccessDenied { name: member_name });
        return None;
    }
    let mut node = Expr::new(
        ExprKind::MemberAccess { object: Box::new(object), member },
        range,
    );
    node.deco.entity = Some(id);
    match &ctx.sym.entity(id).kind {
        EntityKind::Variable(data) => {
            let Some(ty) = data.ty else { return None };
            let mutability = object_ty.mutability.join(data.mutability);
            decorate(&mut node, ty.with_mutability(mutability), object_cat);
        }
        EntityKind::Function(_) | EntityKind::OverloadSet { .. } => {
            // A bound member function; only valid as a callee.
        }
        _ => {
            report(ctx.issues, range, BadExpr::BadSymbolReference {
                name: ctx.sym.entity(id).name.clone(),
                expected: "member",
            });
            return None;
        }
    }
    Some(node)
}

/// Insert a dereference node above a pointer-typed expression.
fn synthesize_deref(ctx: &mut AnalysisContext, object: Expr) -> Option<Expr> {
    let range = object.range;
    let ty = object.ty();
    let EntityKind::PointerType { base, .. } = ctx.sym.entity(ctx.sym.resolve(ty.ty)).kind
    else {
        return Some(object);
    };
    let mut node = Expr::new(
        ExprKind::Deref {
            mutability: base.mutability,
            qual: PointerQual::Raw,
            operand: Some(Box::new(object)),
        },
        range,
    );
    decorate(&mut node, base, ValueCategory::LValue);
    Some(node)
}

fn analyze_unary(
    ctx: &mut AnalysisContext,
    expr: Expr,
    cleanups: &mut CleanupStack,
) -> Option<Expr> {
    let range = expr.range;
    let ExprKind::Unary { op, prefix, operand } = expr.kind else { unreachable!() };
    let operand = analyze_expr(ctx, *operand, cleanups)?;
    let operand = expect_value(ctx, operand)?;
    let ty = operand.ty();
    let b = *ctx.sym.builtins();
    let is_int = ctx.sym.is_integral(ty.ty);
    let is_float = ctx.sym.is_float(ty.ty);
    let resolved = ctx.sym.resolve(ty.ty);

    let bad = |ctx: &mut AnalysisContext| {
        report(ctx.issues, range, BadExpr::BadUnaryOperand {
            op: op.to_string(),
            ty: ctx.sym.type_name(ty.ty),
        });
    };

    match op {
        UnaryOp::Promote | UnaryOp::Negate => {
            if !is_int && !is_float {
                bad(ctx);
                return None;
            }
            let operand = to_rvalue(ctx, operand, cleanups)?;
            let constant = match (&op, operand.constant()) {
                (UnaryOp::Negate, Some(ConstValue::Int(v))) => {
                    Some(ConstValue::Int(v.wrapping_neg()))
                }
                (UnaryOp::Negate, Some(ConstValue::Float(v))) => Some(ConstValue::Float(-v)),
                (UnaryOp::Promote, c) => c.cloned(),
                _ => None,
            };
            let mut node = Expr::new(
                ExprKind::Unary { op, prefix, operand: Box::new(operand) },
                range,
            );
            decorate(&mut node, QualType::const_(resolved), ValueCategory::RValue);
            node.deco.constant = constant;
            Some(node)
        }
        UnaryOp::BitwiseNot => {
            let is_byte = matches!(ctx.sym.entity(resolved).kind, EntityKind::ByteType);
            if !is_int && !is_byte {
                bad(ctx);
                return None;
            }
            let operand = to_rvalue(ctx, operand, cleanups)?;
            let constant = match operand.constant() {
                Some(ConstValue::Int(v)) => Some(ConstValue::Int(!v)),
                _ => None,
            };
            let mut node = Expr::new(
                ExprKind::Unary { op, prefix, operand: Box::new(operand) },
                range,
            );
            decorate(&mut node, QualType::const_(resolved), ValueCategory::RValue);
            node.deco.constant = constant;
            Some(node)
        }
        UnaryOp::LogicalNot => {
            if ctx.sym.resolve(ty.ty) != b.bool_ {
                bad(ctx);
                return None;
            }
            let operand = to_rvalue(ctx, operand, cleanups)?;
            let constant = match operand.constant() {
                Some(ConstValue::Bool(v)) => Some(ConstValue::Bool(!v)),
                _ => None,
            };
            let mut node = Expr::new(
                ExprKind::Unary { op, prefix, operand: Box::new(operand) },
                range,
            );
            decorate(&mut node, QualType::const_(b.bool_), ValueCategory::RValue);
            node.deco.constant = constant;
            Some(node)
        }
        UnaryOp::Increment | UnaryOp::Decrement => {
            if !is_int {
                bad(ctx);
                return None;
            }
            if operand.value_cat() != ValueCategory::LValue {
                report(ctx.issues, range, BadExpr::BadValueCatConv { to_category: "lvalue" });
                return None;
            }
            if !ty.is_mut() {
                report(ctx.issues, range, BadExpr::BadMutConv {
                    from: ctx.sym.qual_type_name(&ty),
                    to: "mut".to_string(),
                });
                return None;
            }
            let entity = operand.entity();
            let mut node = Expr::new(
                ExprKind::Unary { op, prefix, operand: Box::new(operand) },
                range,
            );
            if prefix {
                node.deco.entity = entity;
                decorate(&mut node, ty, ValueCategory::LValue);
            } else {
                decorate(&mut node, QualType::const_(resolved), ValueCategory::RValue);
            }
            Some(node)
        }
    }
}

fn to_rvalue(
    ctx: &mut AnalysisContext,
    expr: Expr,
    _cleanups: &mut CleanupStack,
) -> Option<Expr> {
    let ty = expr.ty();
    let target = QualType::const_(ctx.sym.resolve(ty.ty));
    conversion::convert(
        ctx.sym,
        ctx.issues,
        ConvKind::Implicit,
        expr,
        target,
        ValueCategory::RValue,
    )
}

/// Reject expressions that denote a type or namespace where a value is
/// needed.
pub fn expect_value(ctx: &mut AnalysisContext, expr: Expr) -> Option<Expr> {
    if expr.deco.ty.is_some() {
        return Some(expr);
    }
    let name = expr
        .entity()
        .map(|e| ctx.sym.entity(e).name.clone())
        .unwrap_or_default();
    report(ctx.issues, expr.range, BadExpr::BadSymbolReference { name, expected: "value" });
    None
}

fn analyze_binary(
    ctx: &mut AnalysisContext,
    expr: Expr,
    cleanups: &mut CleanupStack,
) -> Option<Expr> {
    let range = expr.range;
    let ExprKind::Binary { op, lhs, rhs } = expr.kind else { unreachable!() };
    if op.is_assignment() {
        return analyze_assignment(ctx, op, *lhs, *rhs, range, cleanups);
    }
    let lhs = analyze_expr(ctx, *lhs, cleanups)?;
    let lhs = expect_value(ctx, lhs)?;
    let rhs = analyze_expr(ctx, *rhs, cleanups)?;
    let rhs = expect_value(ctx, rhs)?;
    let b = *ctx.sym.builtins();

    if op == BinaryOp::Comma {
        let (lty, lcat) = (rhs.ty(), rhs.value_cat());
        let mut node = Expr::new(
            ExprKind::Binary { op, lhs: Box::new(lhs), rhs: Box::new(rhs) },
            range,
        );
        decorate(&mut node, lty, lcat);
        return Some(node);
    }

    if matches!(op, BinaryOp::LogicalAnd | BinaryOp::LogicalOr) {
        let bool_t = QualType::const_(b.bool_);
        let lhs = conversion::convert(
            ctx.sym, ctx.issues, ConvKind::Implicit, lhs, bool_t, ValueCategory::RValue,
        )?;
        let rhs = conversion::convert(
            ctx.sym, ctx.issues, ConvKind::Implicit, rhs, bool_t, ValueCategory::RValue,
        )?;
        let constant = match (lhs.constant(), rhs.constant()) {
            (Some(ConstValue::Bool(a)), Some(ConstValue::Bool(c))) => {
                Some(ConstValue::Bool(if op == BinaryOp::LogicalAnd {
                    *a && *c
                } else {
                    *a || *c
                }))
            }
            _ => None,
        };
        let mut node = Expr::new(
            ExprKind::Binary { op, lhs: Box::new(lhs), rhs: Box::new(rhs) },
            range,
        );
        decorate(&mut node, bool_t, ValueCategory::RValue);
        node.deco.constant = constant;
        return Some(node);
    }

    let lhs_ty = lhs.ty();
    let rhs_ty = rhs.ty();
    let bad = |ctx: &mut AnalysisContext| {
        report(ctx.issues, range, BadExpr::BadBinaryOperands {
            op: op.to_string(),
            lhs: ctx.sym.type_name(lhs_ty.ty),
            rhs: ctx.sym.type_name(rhs_ty.ty),
        });
    };

    let lhs_int = ctx.sym.is_integral(lhs_ty.ty);
    let lhs_float = ctx.sym.is_float(lhs_ty.ty);
    let lhs_ptr = ctx.sym.is_pointer(lhs_ty.ty)
        || matches!(ctx.sym.entity(ctx.sym.resolve(lhs_ty.ty)).kind, EntityKind::NullPtrType);
    let lhs_bool = ctx.sym.resolve(lhs_ty.ty) == b.bool_;

    use BinaryOp::*;
    let arithmetic_ok = match op {
        Add | Sub | Mul | Div => lhs_int || lhs_float,
        Rem | LeftShift | RightShift | BitAnd | BitOr | BitXor => lhs_int,
        Less | LessEq | Greater | GreaterEq => lhs_int || lhs_float,
        Equals | NotEquals => lhs_int || lhs_float || lhs_bool || lhs_ptr,
        _ => unreachable!(),
    };
    if !arithmetic_ok {
        bad(ctx);
        return None;
    }

    let Some(common) = conversion::common_type(ctx.sym, lhs_ty, rhs_ty) else {
        bad(ctx);
        return None;
    };
    let common = QualType::const_(common.ty);
    let lhs = conversion::convert(
        ctx.sym, ctx.issues, ConvKind::Implicit, lhs, common, ValueCategory::RValue,
    )?;
    let rhs = conversion::convert(
        ctx.sym, ctx.issues, ConvKind::Implicit, rhs, common, ValueCategory::RValue,
    )?;
    let result_ty = if op.is_comparison() { QualType::const_(b.bool_) } else { common };
    let constant = fold_binary(op, lhs.constant(), rhs.constant());
    let mut node = Expr::new(
        ExprKind::Binary { op, lhs: Box::new(lhs), rhs: Box::new(rhs) },
        range,
    );
    decorate(&mut node, result_ty, ValueCategory::RValue);
    node.deco.constant = constant;
    Some(node)
}

fn fold_binary(
    op: BinaryOp,
    lhs: Option<&ConstValue>,
    rhs: Option<&ConstValue>,
) -> Option<ConstValue> {
    use BinaryOp::*;
    match (lhs?, rhs?) {
        (ConstValue::Int(a), ConstValue::Int(b)) => {
            let (a, b) = (*a, *b);
            Some(match op {
                Add => ConstValue::Int(a.wrapping_add(b)),
                Sub => ConstValue::Int(a.wrapping_sub(b)),
                Mul => ConstValue::Int(a.wrapping_mul(b)),
                Div => ConstValue::Int(a.checked_div(b)?),
                Rem => ConstValue::Int(a.checked_rem(b)?),
                LeftShift => ConstValue::Int(a.wrapping_shl(b as u32)),
                RightShift => ConstValue::Int(a.wrapping_shr(b as u32)),
                BitAnd => ConstValue::Int(a & b),
                BitOr => ConstValue::Int(a | b),
                BitXor => ConstValue::Int(a ^ b),
                Less => ConstValue::Bool(a < b),
                LessEq => ConstValue::Bool(a <= b),
                Greater => ConstValue::Bool(a > b),
                GreaterEq => ConstValue::Bool(a >= b),
                Equals => ConstValue::Bool(a == b),
                NotEquals => ConstValue::Bool(a != b),
                _ => return None,
            })
        }
        (ConstValue::Float(a), ConstValue::Float(b)) => {
            let (a, b) = (*a, *b);
            Some(match op {
                Add => ConstValue::Float(a + b),
                Sub => ConstValue::Float(a - b),
                Mul => ConstValue::Float(a * b),
                Div => ConstValue::Float(a / b),
                Less => ConstValue::Bool(a < b),
                LessEq => ConstValue::Bool(a <= b),
                Greater => ConstValue::Bool(a > b),
                GreaterEq => ConstValue::Bool(a >= b),
                Equals => ConstValue::Bool(a == b),
                NotEquals => ConstValue::Bool(a != b),
                _ => return None,
            })
        }
        (ConstValue::Bool(a), ConstValue::Bool(b)) => Some(match op {
            Equals => ConstValue::Bool(a == b),
            NotEquals => ConstValue::Bool(a != b),
            _ => return None,
        }),
        _ => None,
    }
}

fn analyze_assignment(
    ctx: &mut AnalysisContext,
    op: BinaryOp,
    lhs: Expr,
    rhs: Expr,
    range: SourceRange,
    cleanups: &mut CleanupStack,
) -> Option<Expr> {
    let lhs = analyze_expr(ctx, lhs, cleanups)?;
    let lhs = expect_value(ctx, lhs)?;
    let rhs = analyze_expr(ctx, rhs, cleanups)?;
    let rhs = expect_value(ctx, rhs)?;
    let lhs_ty = lhs.ty();
    if lhs.value_cat() != ValueCategory::LValue {
        report(ctx.issues, range, BadExpr::BadValueCatConv { to_category: "lvalue" });
        return None;
    }
    if !lhs_ty.is_mut() {
        report(ctx.issues, range, BadExpr::BadMutConv {
            from: ctx.sym.qual_type_name(&lhs_ty),
            to: "mut".to_string(),
        });
        return None;
    }
    if !ctx.sym.is_complete(lhs_ty.ty) || !ctx.sym.is_complete(rhs.ty().ty) {
        report(ctx.issues, range, BadExpr::Generic {
            message: "cannot assign values of incomplete type".to_string(),
        });
        return None;
    }
    if let Some(arith) = op.compound_operation() {
        // Desugar `a += b` into `a = a + b` semantics without rewriting the
        // tree: validate the arithmetic on the operand types.
        let lhs_int = ctx.sym.is_integral(lhs_ty.ty);
        let lhs_float = ctx.sym.is_float(lhs_ty.ty);
        let ok = match arith {
            BinaryOp::Add | BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Div => lhs_int || lhs_float,
            _ => lhs_int,
        };
        if !ok {
            report(ctx.issues, range, BadExpr::BadBinaryOperands {
                op: op.to_string(),
                lhs: ctx.sym.type_name(lhs_ty.ty),
                rhs: ctx.sym.type_name(rhs.ty().ty),
            });
            return None;
        }
    }
    let target = QualType::const_(ctx.sym.resolve(lhs_ty.ty));
    let rhs = conversion::convert(
        ctx.sym, ctx.issues, ConvKind::Implicit, rhs, target, ValueCategory::RValue,
    )?;
    let void = QualType::const_(ctx.sym.builtins().void);

    let lifetime = ctx.sym.lifetime(lhs_ty.ty);
    let copy_trivial = lifetime.operation(SMFKind::CopyConstructor).is_trivial()
        && lifetime.operation(SMFKind::Destructor).is_trivial();
    if op == BinaryOp::Assign && !copy_trivial {
        let dtor = match lifetime.operation(SMFKind::Destructor) {
            LifetimeOperation::UserDefined(f) => Some(f),
            _ => None,
        };
        let ctor = match lifetime.operation(SMFKind::CopyConstructor) {
            LifetimeOperation::UserDefined(f) => Some(f),
            LifetimeOperation::Deleted => {
                report(ctx.issues, range, BadExpr::CannotConstructType {
                    ty: ctx.sym.type_name(lhs_ty.ty),
                    reason: "the copy constructor is deleted".to_string(),
                });
                return None;
            }
            _ => None,
        };
        let mut node = Expr::new(
            ExprKind::NontrivAssign {
                dest: Box::new(lhs),
                source: Box::new(rhs),
                dtor,
                ctor,
            },
            range,
        );
        decorate(&mut node, void, ValueCategory::RValue);
        return Some(node);
    }
    let mut node = Expr::new(
        ExprKind::Binary { op, lhs: Box::new(lhs), rhs: Box::new(rhs) },
        range,
    );
    decorate(&mut node, void, ValueCategory::RValue);
    Some(node)
}

fn analyze_conditional(
    ctx: &mut AnalysisContext,
    expr: Expr,
    cleanups: &mut CleanupStack,
) -> Option<Expr> {
    let range = expr.range;
    let ExprKind::Conditional { cond, then_expr, else_expr, .. } = expr.kind else {
        unreachable!()
    };
    let bool_t = QualType::const_(ctx.sym.builtins().bool_);
    let cond = analyze_expr(ctx, *cond, cleanups)
        .and_then(|c| expect_value(ctx, c))
        .and_then(|c| {
            conversion::convert(
                ctx.sym, ctx.issues, ConvKind::Implicit, c, bool_t, ValueCategory::RValue,
            )
        })?;
    // Each branch owns its temporaries; only one of them will run.
    let mut then_cleanups = CleanupStack::default();
    let mut else_cleanups = CleanupStack::default();
    let then_expr = analyze_expr(ctx, *then_expr, &mut then_cleanups)?;
    let then_expr = expect_value(ctx, then_expr)?;
    let else_expr = analyze_expr(ctx, *else_expr, &mut else_cleanups)?;
    let else_expr = expect_value(ctx, else_expr)?;

    let Some(common) = conversion::common_type(ctx.sym, then_expr.ty(), else_expr.ty()) else {
        report(ctx.issues, range, BadExpr::BadBinaryOperands {
            op: "?:".to_string(),
            lhs: ctx.sym.type_name(then_expr.ty().ty),
            rhs: ctx.sym.type_name(else_expr.ty().ty),
        });
        return None;
    };
    let cat = then_expr.value_cat().common(else_expr.value_cat());
    let then_expr = conversion::convert(
        ctx.sym, ctx.issues, ConvKind::Implicit, then_expr, common, cat,
    )?;
    let else_expr = conversion::convert(
        ctx.sym, ctx.issues, ConvKind::Implicit, else_expr, common, cat,
    )?;
    let constant = match cond.constant() {
        Some(ConstValue::Bool(true)) => then_expr.constant().cloned(),
        Some(ConstValue::Bool(false)) => else_expr.constant().cloned(),
        _ => None,
    };
    let mut node = Expr::new(
        ExprKind::Conditional {
            cond: Box::new(cond),
            then_expr: Box::new(then_expr),
            else_expr: Box::new(else_expr),
            then_cleanups,
            else_cleanups,
        },
        range,
    );
    decorate(&mut node, common, cat);
    node.deco.constant = constant;
    if cat == ValueCategory::RValue {
        register_cleanup(ctx, &mut node, cleanups);
    }
    Some(node)
}

fn analyze_cast(
    ctx: &mut AnalysisContext,
    expr: Expr,
    cleanups: &mut CleanupStack,
) -> Option<Expr> {
    let ExprKind::Cast { operand, mut target, .. } = expr.kind else { unreachable!() };
    let operand = analyze_expr(ctx, *operand, cleanups)?;
    let operand = expect_value(ctx, operand)?;
    let ty = analyze_type_expr(ctx, &mut target)?;
    conversion::convert(
        ctx.sym,
        ctx.issues,
        ConvKind::Explicit,
        operand,
        QualType::const_(ty),
        ValueCategory::RValue,
    )
}

fn analyze_subscript(
    ctx: &mut AnalysisContext,
    expr: Expr,
    cleanups: &mut CleanupStack,
) -> Option<Expr> {
    let range = expr.range;
    let ExprKind::Subscript { object, index } = expr.kind else { unreachable!() };
    let object = analyze_expr(ctx, *object, cleanups)?;
    let mut object = expect_value(ctx, object)?;
    if ctx.sym.is_pointer(object.ty().ty) {
        object = synthesize_deref(ctx, object)?;
    }
    let object_ty = object.ty();
    let EntityKind::ArrayType { elem, .. } = ctx.sym.entity(ctx.sym.resolve(object_ty.ty)).kind
    else {
        report(ctx.issues, range, BadExpr::InvalidSubscript {
            ty: ctx.sym.type_name(object_ty.ty),
        });
        return None;
    };
    let s64 = QualType::const_(ctx.sym.builtins().s64);
    let index = analyze_expr(ctx, *index, cleanups)
        .and_then(|i| expect_value(ctx, i))
        .and_then(|i| {
            conversion::convert(
                ctx.sym, ctx.issues, ConvKind::Implicit, i, s64, ValueCategory::RValue,
            )
        })?;
    let cat = object.value_cat();
    let mut node = Expr::new(
        ExprKind::Subscript { object: Box::new(object), index: Box::new(index) },
        range,
    );
    decorate(
        &mut node,
        QualType { ty: elem, mutability: object_ty.mutability, bind: BindMode::Static },
        cat,
    );
    Some(node)
}

fn analyze_subscript_slice(
    ctx: &mut AnalysisContext,
    expr: Expr,
    cleanups: &mut CleanupStack,
) -> Option<Expr> {
    let range = expr.range;
    let ExprKind::SubscriptSlice { object, lower, upper } = expr.kind else { unreachable!() };
    let object = analyze_expr(ctx, *object, cleanups)?;
    let mut object = expect_value(ctx, object)?;
    if ctx.sym.is_pointer(object.ty().ty) {
        object = synthesize_deref(ctx, object)?;
    }
    let object_ty = object.ty();
    let EntityKind::ArrayType { elem, .. } = ctx.sym.entity(ctx.sym.resolve(object_ty.ty)).kind
    else {
        report(ctx.issues, range, BadExpr::InvalidSubscript {
            ty: ctx.sym.type_name(object_ty.ty),
        });
        return None;
    };
    let s64 = QualType::const_(ctx.sym.builtins().s64);
    let mut bound = |ctx: &mut AnalysisContext, e: Expr| {
        analyze_expr(ctx, e, cleanups)
            .and_then(|i| expect_value(ctx, i))
            .and_then(|i| {
                conversion::convert(
                    ctx.sym, ctx.issues, ConvKind::Implicit, i, s64, ValueCategory::RValue,
                )
            })
    };
    let lower = bound(ctx, *lower)?;
    let upper = bound(ctx, *upper)?;
    let dyn_array = ctx.sym.array_type(elem, None);
    let slice_ptr = ctx.sym.pointer_type(
        QualType { ty: dyn_array, mutability: object_ty.mutability, bind: BindMode::Static },
        PointerQual::Raw,
    );
    let mut node = Expr::new(
        ExprKind::SubscriptSlice {
            object: Box::new(object),
            lower: Box::new(lower),
            upper: Box::new(upper),
        },
        range,
    );
    decorate(&mut node, QualType::const_(slice_ptr), ValueCategory::RValue);
    Some(node)
}

fn analyze_list(
    ctx: &mut AnalysisContext,
    expr: Expr,
    cleanups: &mut CleanupStack,
) -> Option<Expr> {
    let range = expr.range;
    let ExprKind::List(elems) = expr.kind else { unreachable!() };
    if elems.is_empty() {
        report(ctx.issues, range, BadExpr::Generic {
            message: "empty list expressions have no type".to_string(),
        });
        return None;
    }
    // Type position (e.g. `[int, 4]`) is handled by `analyze_type_expr`; a
    // list of types reaching value analysis is interpreted there instead.
    let mut analyzed = Vec::with_capacity(elems.len());
    for elem in elems {
        let elem = analyze_expr(ctx, elem, cleanups)?;
        if categorize(ctx, &elem) == ExprCategory::Type {
            report(ctx.issues, range, BadExpr::Generic {
                message: "array type in value position".to_string(),
            });
            return None;
        }
        analyzed.push(expect_value(ctx, elem)?);
    }
    let mut common = analyzed[0].ty();
    for elem in &analyzed[1..] {
        match conversion::common_type(ctx.sym, common, elem.ty()) {
            Some(ty) => common = ty,
            None => {
                report(ctx.issues, range, BadExpr::BadBinaryOperands {
                    op: "list".to_string(),
                    lhs: ctx.sym.type_name(common.ty),
                    rhs: ctx.sym.type_name(elem.ty().ty),
                });
                return None;
            }
        }
    }
    let target = QualType::const_(ctx.sym.resolve(common.ty));
    let count = analyzed.len() as u64;
    let mut converted = Vec::with_capacity(analyzed.len());
    for elem in analyzed {
        converted.push(conversion::convert(
            ctx.sym, ctx.issues, ConvKind::Implicit, elem, target, ValueCategory::RValue,
        )?);
    }
    let array = ctx.sym.array_type(target.ty, Some(count));
    let mut node = Expr::new(ExprKind::List(converted), range);
    decorate(&mut node, QualType::const_(array), ValueCategory::RValue);
    register_cleanup(ctx, &mut node, cleanups);
    Some(node)
}

fn analyze_move(
    ctx: &mut AnalysisContext,
    expr: Expr,
    cleanups: &mut CleanupStack,
) -> Option<Expr> {
    let range = expr.range;
    let ExprKind::Move(operand) = expr.kind else { unreachable!() };
    let operand = analyze_expr(ctx, *operand, cleanups)?;
    let operand = expect_value(ctx, operand)?;
    if operand.value_cat() != ValueCategory::LValue {
        report(ctx.issues, range, BadExpr::BadValueCatConv { to_category: "lvalue" });
        return None;
    }
    let ty = operand.ty();
    let lifetime = ctx.sym.lifetime(ty.ty);
    if lifetime.operation(SMFKind::MoveConstructor).is_deleted() {
        report(ctx.issues, range, BadExpr::CannotConstructType {
            ty: ctx.sym.type_name(ty.ty),
            reason: "the move constructor is deleted".to_string(),
        });
        return None;
    }
    let target = QualType::const_(ctx.sym.resolve(ty.ty));
    let mut node = Expr::new(ExprKind::Move(Box::new(operand)), range);
    decorate(&mut node, target, ValueCategory::RValue);
    register_cleanup(ctx, &mut node, cleanups);
    Some(node)
}

fn analyze_unique(
    ctx: &mut AnalysisContext,
    expr: Expr,
    cleanups: &mut CleanupStack,
) -> Option<Expr> {
    let range = expr.range;
    let ExprKind::Unique(operand) = expr.kind else { unreachable!() };
    let was_in_unique = std::mem::replace(&mut ctx.in_unique, true);
    let operand = analyze_expr(ctx, *operand, cleanups);
    ctx.in_unique = was_in_unique;
    let mut operand = expect_value(ctx, operand?)?;
    if operand.value_cat() != ValueCategory::RValue {
        operand = to_rvalue(ctx, operand, cleanups)?;
    }
    let pointee = operand.ty();
    // The unique pointer takes over the temporary's cleanup.
    if let Some(entity) = operand.entity() {
        cleanups.pop_for(entity);
    }
    let ptr = ctx
        .sym
        .pointer_type(pointee.with_mutability(Mutability::Mut), PointerQual::Unique);
    let mut node = Expr::new(ExprKind::Unique(Box::new(operand)), range);
    decorate(&mut node, QualType::const_(ptr), ValueCategory::RValue);
    register_cleanup(ctx, &mut node, cleanups);
    Some(node)
}

fn analyze_address_of(
    ctx: &mut AnalysisContext,
    expr: Expr,
    cleanups: &mut CleanupStack,
) -> Option<Expr> {
    let range = expr.range;
    let ExprKind::AddressOf { mutability, operand } = expr.kind else { unreachable!() };
    let operand = analyze_expr(ctx, *operand.unwrap(), cleanups)?;
    let operand = expect_value(ctx, operand)?;
    if operand.value_cat() != ValueCategory::LValue {
        report(ctx.issues, range, BadExpr::BadValueCatConv { to_category: "lvalue" });
        return None;
    }
    let ty = operand.ty();
    if mutability == Mutability::Mut && !ty.is_mut() {
        report(ctx.issues, range, BadExpr::BadMutConv {
            from: ctx.sym.qual_type_name(&ty),
            to: "mut".to_string(),
        });
        return None;
    }
    let base = QualType {
        ty: ctx.sym.resolve(ty.ty),
        mutability: mutability.join(ty.mutability),
        bind: ty.bind,
    };
    let ptr = ctx.sym.pointer_type(base, PointerQual::Raw);
    let mut node = Expr::new(
        ExprKind::AddressOf { mutability, operand: Some(Box::new(operand)) },
        range,
    );
    decorate(&mut node, QualType::const_(ptr), ValueCategory::RValue);
    Some(node)
}

fn analyze_deref(
    ctx: &mut AnalysisContext,
    expr: Expr,
    cleanups: &mut CleanupStack,
) -> Option<Expr> {
    let range = expr.range;
    let ExprKind::Deref { mutability, qual, operand } = expr.kind else { unreachable!() };
    let operand = analyze_expr(ctx, *operand.unwrap(), cleanups)?;
    // `*T` in a value context is a type expression that reached us through
    // parser ambiguity; re-interpret.
    if categorize(ctx, &operand) == ExprCategory::Type {
        let base = QualType {
            ty: operand.entity()?,
            mutability,
            bind: BindMode::Static,
        };
        let ptr = ctx.sym.pointer_type(base, qual);
        let mut node = Expr::new(
            ExprKind::Deref { mutability, qual, operand: Some(Box::new(operand)) },
            range,
        );
        node.deco.entity = Some(ptr);
        return Some(node);
    }
    let operand = expect_value(ctx, operand)?;
    let ty = operand.ty();
    let EntityKind::PointerType { base, .. } = ctx.sym.entity(ctx.sym.resolve(ty.ty)).kind
    else {
        report(ctx.issues, range, BadExpr::BadUnaryOperand {
            op: "*".to_string(),
            ty: ctx.sym.type_name(ty.ty),
        });
        return None;
    };
    let mut node = Expr::new(
        ExprKind::Deref { mutability, qual, operand: Some(Box::new(operand)) },
        range,
    );
    decorate(&mut node, base, ValueCategory::LValue);
    Some(node)
}

// ============================================================================
// Calls and construction
// ============================================================================

fn analyze_call(
    ctx: &mut AnalysisContext,
    expr: Expr,
    cleanups: &mut CleanupStack,
) -> Option<Expr> {
    let range = expr.range;
    let ExprKind::Call { callee, args } = expr.kind else { unreachable!() };

    // `reinterpret<T>(x)`
    if let ExprKind::Generic { name, args: generic_args } = &callee.kind {
        if name == "reinterpret" && generic_args.len() == 1 {
            let mut callee = callee;
            let ExprKind::Generic { args: generic_args, .. } = &mut callee.kind else {
                unreachable!()
            };
            let target = analyze_type_expr(ctx, &mut generic_args[0])?;
            let mut args = args;
            if args.len() != 1 {
                report(ctx.issues, range, BadExpr::Generic {
                    message: "reinterpret takes exactly one argument".to_string(),
                });
                return None;
            }
            let operand = analyze_expr(ctx, args.pop().unwrap(), cleanups)?;
            let operand = expect_value(ctx, operand)?;
            return conversion::convert(
                ctx.sym,
                ctx.issues,
                ConvKind::Reinterpret,
                operand,
                QualType::const_(target),
                ValueCategory::RValue,
            );
        }
        report(ctx.issues, range, BadExpr::Generic {
            message: format!("unknown generic '{}'", name),
        });
        return None;
    }

    // A list callee is an array type: `[T](n)` or `[T, N](..)`.
    if matches!(callee.kind, ExprKind::List(_)) {
        let mut callee = callee;
        let ty = analyze_type_expr(ctx, &mut callee)?;
        return analyze_construction(ctx, ty, args, range, cleanups);
    }

    let callee = analyze_expr(ctx, *callee, cleanups)?;
    match categorize(ctx, &callee) {
        ExprCategory::Type => {
            let ty = callee.entity()?;
            analyze_construction(ctx, ty, args, range, cleanups)
        }
        ExprCategory::Callable => {
            analyze_resolved_call(ctx, callee, args, range, cleanups)
        }
        _ => {
            let ty = callee.deco.ty.map(|t| ctx.sym.type_name(t.ty)).unwrap_or_default();
            report(ctx.issues, range, BadExpr::NotCallable { ty });
            None
        }
    }
}

fn analyze_resolved_call(
    ctx: &mut AnalysisContext,
    callee: Expr,
    args: Vec<Expr>,
    range: SourceRange,
    cleanups: &mut CleanupStack,
) -> Option<Expr> {
    let set = callee.entity()?;
    let name = ctx.sym.entity(set).name.clone();
    let candidates = ctx.sym.overload_candidates(set);

    // A member function reached through a value takes the object as its
    // implicit first argument.
    let object = match callee.kind {
        ExprKind::MemberAccess { object, .. } if object.deco.ty.is_some() => Some(*object),
        _ => None,
    };

    let mut analyzed: Vec<Expr> = Vec::with_capacity(args.len() + 1);
    if let Some(object) = object {
        analyzed.push(object);
    }
    for arg in args {
        let analyzed_arg = analyze_expr(ctx, arg, cleanups)?;
        analyzed.push(expect_value(ctx, analyzed_arg)?);
    }
    let descriptors: Vec<Argument> = analyzed
        .iter()
        .map(|a| Argument { ty: a.ty(), value_cat: a.value_cat() })
        .collect();
    let resolved =
        overload::resolve_overload(ctx.sym, ctx.issues, &name, &candidates, &descriptors, range)?;

    // Explicit calls to special member functions are forbidden.
    if ctx
        .sym
        .entity(resolved.function)
        .as_function()
        .is_some_and(|f| f.smf.is_some())
    {
        report(ctx.issues, range, BadExpr::ExplicitSMFCall { name });
        return None;
    }

    finish_call(ctx, resolved, analyzed, range, cleanups)
}

fn finish_call(
    ctx: &mut AnalysisContext,
    resolved: overload::ResolvedCall,
    args: Vec<Expr>,
    range: SourceRange,
    cleanups: &mut CleanupStack,
) -> Option<Expr> {
    // Return type deduction may need the callee's body analyzed first.
    stmt::ensure_function_analyzed(ctx, resolved.function, range);

    let mut converted = Vec::with_capacity(args.len());
    for (arg, conv) in args.into_iter().zip(resolved.conversions) {
        // The callee owns cleanup of its by-value arguments.
        if let Some(entity) = arg.entity() {
            cleanups.pop_for(entity);
        }
        converted.push(conversion::apply_conversion(ctx.sym, conv, arg));
    }
    let signature = ctx
        .sym
        .entity(resolved.function)
        .as_function()
        .and_then(|f| f.signature.clone())?;
    let mut callee_expr = Expr::new(
        ExprKind::Ident(ctx.sym.entity(resolved.function).name.clone()),
        range,
    );
    callee_expr.deco.entity = Some(resolved.function);
    let mut node = Expr::new(
        ExprKind::Call { callee: Box::new(callee_expr), args: converted },
        range,
    );
    // The called function is read off the callee; the node's own entity is
    // the result temporary, if cleanup requires one.
    let ret = signature.ret;
    match ctx.sym.entity(ctx.sym.resolve(ret.ty)).kind {
        EntityKind::ReferenceType { base } => decorate(&mut node, base, ValueCategory::LValue),
        _ => {
            decorate(&mut node, QualType::const_(ctx.sym.resolve(ret.ty)), ValueCategory::RValue);
            register_cleanup(ctx, &mut node, cleanups);
        }
    }
    Some(node)
}

fn analyze_construction(
    ctx: &mut AnalysisContext,
    ty: EntityId,
    args: Vec<Expr>,
    range: SourceRange,
    cleanups: &mut CleanupStack,
) -> Option<Expr> {
    let ty = ctx.sym.resolve(ty);

    // `[T](count)` constructs a dynamic array, only beneath `unique`.
    if ctx.sym.is_dynamic_array(ty) {
        if !ctx.in_unique {
            report(ctx.issues, range, BadExpr::DynArrayConstructMisuse);
            return None;
        }
        let mut args = args;
        if args.len() != 1 {
            report(ctx.issues, range, BadExpr::Generic {
                message: "dynamic array construction takes one length argument".to_string(),
            });
            return None;
        }
        let s64 = QualType::const_(ctx.sym.builtins().s64);
        let count = analyze_expr(ctx, args.pop().unwrap(), cleanups)
            .and_then(|c| expect_value(ctx, c))
            .and_then(|c| {
                conversion::convert(
                    ctx.sym, ctx.issues, ConvKind::Implicit, c, s64, ValueCategory::RValue,
                )
            })?;
        let mut node = Expr::new(
            ExprKind::Construct {
                kind: ConstructKind::DynamicArray,
                function: None,
                args: vec![count],
            },
            range,
        );
        decorate(&mut node, QualType::const_(ty), ValueCategory::RValue);
        return Some(node);
    }

    if !ctx.sym.is_complete(ty) {
        report(ctx.issues, range, BadExpr::CannotConstructType {
            ty: ctx.sym.type_name(ty),
            reason: "the type is incomplete".to_string(),
        });
        return None;
    }

    // Scalar types: `T()` is the zero value, `T(x)` an explicit conversion.
    if !ctx.sym.entity(ty).is_record_type()
        && !matches!(ctx.sym.entity(ty).kind, EntityKind::ArrayType { .. })
    {
        let mut args = args;
        return match args.len() {
            0 => {
                let mut node = Expr::new(
                    ExprKind::Construct {
                        kind: ConstructKind::TrivialDefault,
                        function: None,
                        args: Vec::new(),
                    },
                    range,
                );
                decorate(&mut node, QualType::const_(ty), ValueCategory::RValue);
                Some(node)
            }
            1 => {
                let operand = analyze_expr(ctx, args.pop().unwrap(), cleanups)?;
                let operand = expect_value(ctx, operand)?;
                conversion::convert(
                    ctx.sym,
                    ctx.issues,
                    ConvKind::Explicit,
                    operand,
                    QualType::const_(ty),
                    ValueCategory::RValue,
                )
            }
            _ => {
                report(ctx.issues, range, BadExpr::CannotConstructType {
                    ty: ctx.sym.type_name(ty),
                    reason: "too many arguments".to_string(),
                });
                None
            }
        };
    }

    let mut analyzed = Vec::with_capacity(args.len());
    for arg in args {
        let analyzed_arg = analyze_expr(ctx, arg, cleanups)?;
        analyzed.push(expect_value(ctx, analyzed_arg)?);
    }

    // User-declared constructors take precedence.
    let ctors: Vec<EntityId> = ctx
        .sym
        .entity(ty)
        .as_record()
        .and_then(|r| r.scope.names.get("new"))
        .cloned()
        .unwrap_or_default();
    if !ctors.is_empty() {
        let mut descriptors = vec![Argument {
            ty: QualType::mut_(ty),
            value_cat: ValueCategory::LValue,
        }];
        descriptors.extend(analyzed.iter().map(|a| Argument {
            ty: a.ty(),
            value_cat: a.value_cat(),
        }));
        let name = ctx.sym.entity(ty).name.clone();
        let resolved =
            overload::resolve_overload(ctx.sym, ctx.issues, &name, &ctors, &descriptors, range)?;
        let mut converted = Vec::with_capacity(analyzed.len());
        for (arg, conv) in analyzed
            .into_iter()
            .zip(resolved.conversions.into_iter().skip(1))
        {
            if let Some(entity) = arg.entity() {
                cleanups.pop_for(entity);
            }
            converted.push(conversion::apply_conversion(ctx.sym, conv, arg));
        }
        let mut node = Expr::new(
            ExprKind::Construct {
                kind: ConstructKind::Nontrivial,
                function: Some(resolved.function),
                args: converted,
            },
            range,
        );
        decorate(&mut node, QualType::const_(ty), ValueCategory::RValue);
        register_cleanup(ctx, &mut node, cleanups);
        return Some(node);
    }

    let lifetime = ctx.sym.lifetime(ty);
    match analyzed.len() {
        0 => {
            let kind = match lifetime.operation(SMFKind::DefaultConstructor) {
                LifetimeOperation::Trivial => ConstructKind::TrivialDefault,
                LifetimeOperation::NontrivialInline => ConstructKind::NontrivialInline,
                LifetimeOperation::Deleted => {
                    report(ctx.issues, range, BadExpr::CannotConstructType {
                        ty: ctx.sym.type_name(ty),
                        reason: "the default constructor is deleted".to_string(),
                    });
                    return None;
                }
                LifetimeOperation::UserDefined(_) => unreachable!("handled above"),
            };
            let mut node = Expr::new(
                ExprKind::Construct { kind, function: None, args: Vec::new() },
                range,
            );
            decorate(&mut node, QualType::const_(ty), ValueCategory::RValue);
            register_cleanup(ctx, &mut node, cleanups);
            Some(node)
        }
        1 if ctx.sym.resolve(analyzed[0].ty().ty) == ty => {
            let kind = match lifetime.operation(SMFKind::CopyConstructor) {
                LifetimeOperation::Trivial => ConstructKind::TrivialCopy,
                LifetimeOperation::NontrivialInline => ConstructKind::NontrivialInline,
                LifetimeOperation::Deleted => {
                    report(ctx.issues, range, BadExpr::CannotConstructType {
                        ty: ctx.sym.type_name(ty),
                        reason: "the copy constructor is deleted".to_string(),
                    });
                    return None;
                }
                LifetimeOperation::UserDefined(_) => unreachable!("handled above"),
            };
            let arg = analyzed.remove(0);
            let mut node = Expr::new(
                ExprKind::Construct { kind, function: None, args: vec![arg] },
                range,
            );
            decorate(&mut node, QualType::const_(ty), ValueCategory::RValue);
            register_cleanup(ctx, &mut node, cleanups);
            Some(node)
        }
        _ => analyze_aggregate_construction(ctx, ty, analyzed, range, cleanups),
    }
}

/// Member-wise construction from an argument per element.
fn analyze_aggregate_construction(
    ctx: &mut AnalysisContext,
    ty: EntityId,
    args: Vec<Expr>,
    range: SourceRange,
    cleanups: &mut CleanupStack,
) -> Option<Expr> {
    let member_types: Vec<QualType> = match &ctx.sym.entity(ty).kind {
        EntityKind::StructType(r) | EntityKind::ProtocolType(r) => r
            .elements
            .iter()
            .filter_map(|&e| match &ctx.sym.entity(e).kind {
                EntityKind::Variable(v) => v.ty,
                EntityKind::BaseClassObject { ty: Some(base), .. } => {
                    Some(QualType::const_(*base))
                }
                _ => None,
            })
            .collect(),
        EntityKind::ArrayType { elem, count } => {
            let elem_ty = QualType::const_(*elem);
            vec![elem_ty; count.unwrap_or(args.len() as u64) as usize]
        }
        _ => Vec::new(),
    };
    if member_types.len() != args.len() {
        report(ctx.issues, range, BadExpr::CannotConstructType {
            ty: ctx.sym.type_name(ty),
            reason: format!(
                "expected {} arguments, found {}",
                member_types.len(),
                args.len()
            ),
        });
        return None;
    }
    let mut converted = Vec::with_capacity(args.len());
    for (arg, member_ty) in args.into_iter().zip(member_types) {
        let target = QualType::const_(ctx.sym.resolve(member_ty.ty));
        converted.push(conversion::convert(
            ctx.sym, ctx.issues, ConvKind::Implicit, arg, target, ValueCategory::RValue,
        )?);
    }
    let kind = if ctx.sym.has_trivial_lifetime(ty) {
        ConstructKind::TrivialAggregate
    } else {
        ConstructKind::NontrivialAggregate
    };
    let mut node = Expr::new(
        ExprKind::Construct { kind, function: None, args: converted },
        range,
    );
    decorate(&mut node, QualType::const_(ty), ValueCategory::RValue);
    register_cleanup(ctx, &mut node, cleanups);
    Some(node)
}

// ============================================================================
// Format strings
// ============================================================================

fn analyze_fstring(
    ctx: &mut AnalysisContext,
    expr: Expr,
    cleanups: &mut CleanupStack,
) -> Option<Expr> {
    let range = expr.range;
    let ExprKind::FString(parts) = expr.kind else { unreachable!() };
    let mut analyzed_parts = Vec::with_capacity(parts.len());
    for part in parts {
        match part {
            FStringPart::Text(text) => analyzed_parts.push(FStringPart::Text(text)),
            FStringPart::Operand { expr: operand, .. } => {
                let operand = analyze_expr(ctx, *operand, cleanups)?;
                let operand = expect_value(ctx, operand)?;
                let (operand, formatter) = select_formatter(ctx, operand, cleanups)?;
                analyzed_parts.push(FStringPart::Operand {
                    expr: Box::new(operand),
                    formatter: Some(formatter),
                });
            }
        }
    }
    let str_ = ctx.sym.builtins().str_;
    let ptr = ctx
        .sym
        .pointer_type(QualType::mut_(str_), PointerQual::Unique);
    let mut node = Expr::new(ExprKind::FString(analyzed_parts), range);
    decorate(&mut node, QualType::const_(ptr), ValueCategory::RValue);
    register_cleanup(ctx, &mut node, cleanups);
    Some(node)
}

/// Pick the formatter function an operand type lowers to, rewriting record
/// operands into `to_string` calls.
fn select_formatter(
    ctx: &mut AnalysisContext,
    operand: Expr,
    cleanups: &mut CleanupStack,
) -> Option<(Expr, EntityId)> {
    let range = operand.range;
    let ty = ctx.sym.resolve(operand.ty().ty);
    let builtin = |ctx: &AnalysisContext, b: Builtin| ctx.sym.builtin_function(b);
    match &ctx.sym.entity(ty).kind {
        EntityKind::BoolType => Some((operand, builtin(ctx, Builtin::FstringWritebool))),
        EntityKind::ByteType => Some((operand, builtin(ctx, Builtin::FstringWritechar))),
        EntityKind::IntType(data) => {
            let f = if data.signed { Builtin::FstringWrites64 } else { Builtin::FstringWriteu64 };
            Some((operand, builtin(ctx, f)))
        }
        EntityKind::FloatType { .. } => {
            let f64_t = QualType::const_(ctx.sym.builtins().f64);
            let operand = conversion::convert(
                ctx.sym, ctx.issues, ConvKind::Implicit, operand, f64_t, ValueCategory::RValue,
            )?;
            Some((operand, builtin(ctx, Builtin::FstringWritef64)))
        }
        EntityKind::PointerType { base, .. } => {
            if ctx.sym.is_dynamic_array(base.ty) {
                // String-like pointers format as text.
                Some((operand, builtin(ctx, Builtin::FstringWritestr)))
            } else {
                Some((operand, builtin(ctx, Builtin::FstringWriteptr)))
            }
        }
        EntityKind::StructType(_) | EntityKind::ProtocolType(_) => {
            if ctx.fstring_stack.contains(&ty) {
                report(ctx.issues, range, BadExpr::NotFormattable {
                    ty: ctx.sym.type_name(ty),
                });
                return None;
            }
            let (Lookup::Overloads(_) | Lookup::Single(_)) =
                ctx.sym.qualified_lookup(ty, "to_string")
            else {
                report(ctx.issues, range, BadExpr::NotFormattable {
                    ty: ctx.sym.type_name(ty),
                });
                return None;
            };
            ctx.fstring_stack.push(ty);
            let member = Expr::new(ExprKind::Ident("to_string".to_string()), range);
            let callee = Expr::new(
                ExprKind::MemberAccess {
                    object: Box::new(operand),
                    member: Box::new(member),
                },
                range,
            );
            let call = Expr::new(
                ExprKind::Call { callee: Box::new(callee), args: Vec::new() },
                range,
            );
            // The type stays on the format stack while its formatted
            // rendition is processed, so `to_string` results that lead back
            // here are caught as recursion.
            let formatted = analyze_expr(ctx, call, cleanups)
                .and_then(|call| select_formatter(ctx, call, cleanups));
            ctx.fstring_stack.pop();
            formatted
        }
        _ => {
            report(ctx.issues, range, BadExpr::NotFormattable { ty: ctx.sym.type_name(ty) });
            None
        }
    }
}
