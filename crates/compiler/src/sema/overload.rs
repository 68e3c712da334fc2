//! Overload resolution.
//!
//! Candidates whose arity matches are scored by summing per-argument
//! conversion ranks; the minimum wins. A tie between distinct candidates is
//! ambiguous.

use crate::issue::{IssueHandler, IssueKind, ORError};
use crate::sema::conversion::{compute_conversion, ConvKind, Conversion};
use crate::sema::entity::*;
use crate::sema::symbol_table::SymbolTable;
use crate::source::SourceRange;

/// An argument as seen by resolution: its decorated type and category.
#[derive(Debug, Clone, Copy)]
pub struct Argument {
    pub ty: QualType,
    pub value_cat: ValueCategory,
}

/// The selected function and the conversion each argument undergoes.
#[derive(Debug)]
pub struct ResolvedCall {
    pub function: EntityId,
    pub conversions: Vec<Conversion>,
}

/// The type and category an expression must convert to when bound to a
/// parameter: reference parameters bind in place, everything else is passed
/// by value.
pub fn parameter_binding(sym: &SymbolTable, param: QualType) -> (QualType, ValueCategory) {
    match sym.entity(sym.resolve(param.ty)).kind {
        EntityKind::ReferenceType { base } => (base, ValueCategory::LValue),
        _ => (param.with_mutability(Mutability::Const), ValueCategory::RValue),
    }
}

fn candidate_conversions(
    sym: &SymbolTable,
    signature: &Signature,
    args: &[Argument],
) -> Option<Vec<Conversion>> {
    if signature.params.len() != args.len() {
        return None;
    }
    signature
        .params
        .iter()
        .zip(args)
        .map(|(&param, arg)| {
            let (to, to_cat) = parameter_binding(sym, param);
            compute_conversion(sym, ConvKind::Implicit, arg.ty, arg.value_cat, to, to_cat).ok()
        })
        .collect()
}

/// Resolve a call against `candidates`. Emits `ORError` and returns `None`
/// on no match or ambiguity.
pub fn resolve_overload(
    sym: &SymbolTable,
    issues: &mut IssueHandler,
    name: &str,
    candidates: &[EntityId],
    args: &[Argument],
    range: SourceRange,
) -> Option<ResolvedCall> {
    let mut viable: Vec<(EntityId, Vec<Conversion>, u32)> = Vec::new();
    for &candidate in candidates {
        let Some(function) = sym.entity(candidate).as_function() else { continue };
        let Some(signature) = &function.signature else { continue };
        if let Some(conversions) = candidate_conversions(sym, signature, args) {
            let rank = conversions.iter().map(Conversion::rank).sum();
            viable.push((candidate, conversions, rank));
        }
    }
    let Some(&(_, _, best)) = viable.iter().min_by_key(|(_, _, rank)| rank) else {
        issues.error(
            range,
            IssueKind::OverloadResolution(ORError::NoMatch {
                name: name.to_string(),
                arguments: args.iter().map(|a| sym.qual_type_name(&a.ty)).collect(),
            }),
        );
        return None;
    };
    let mut winners: Vec<_> = viable.into_iter().filter(|(_, _, rank)| *rank == best).collect();
    winners.dedup_by_key(|(id, _, _)| *id);
    if winners.len() > 1 {
        issues.error(
            range,
            IssueKind::OverloadResolution(ORError::Ambiguous {
                name: name.to_string(),
                candidates: winners
                    .iter()
                    .map(|(id, _, _)| describe_candidate(sym, *id))
                    .collect(),
            }),
        );
        return None;
    }
    let (function, conversions, _) = winners.pop().unwrap();
    Some(ResolvedCall { function, conversions })
}

fn describe_candidate(sym: &SymbolTable, function: EntityId) -> String {
    let entity = sym.entity(function);
    let params = entity
        .as_function()
        .and_then(|f| f.signature.as_ref())
        .map(|sig| {
            sig.params
                .iter()
                .map(|p| sym.qual_type_name(p))
                .collect::<Vec<_>>()
                .join(", ")
        })
        .unwrap_or_default();
    format!("{}({})", entity.name, params)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn declare_fn(sym: &mut SymbolTable, name: &str, params: Vec<QualType>, ret: QualType) -> EntityId {
        let mut issues = IssueHandler::new();
        let id = sym
            .declare_func_name(
                name,
                AccessControl::Public,
                SourceRange::default(),
                FunctionData::default(),
                &mut issues,
            )
            .unwrap();
        assert!(sym.set_function_type(id, Signature { params, ret }, &mut issues));
        id
    }

    fn rvalue(ty: EntityId) -> Argument {
        Argument { ty: QualType::const_(ty), value_cat: ValueCategory::RValue }
    }

    #[test]
    fn test_exact_match_wins_over_conversion() {
        let mut sym = SymbolTable::new();
        let b = *sym.builtins();
        let void = QualType::const_(b.void);
        let f_int = declare_fn(&mut sym, "f", vec![QualType::const_(b.s64)], void);
        let f_float = declare_fn(&mut sym, "f", vec![QualType::const_(b.f64)], void);
        let mut issues = IssueHandler::new();

        let picked = resolve_overload(
            &sym,
            &mut issues,
            "f",
            &[f_int, f_float],
            &[rvalue(b.s64)],
            SourceRange::default(),
        )
        .unwrap();
        assert_eq!(picked.function, f_int);

        let picked = resolve_overload(
            &sym,
            &mut issues,
            "f",
            &[f_int, f_float],
            &[rvalue(b.f64)],
            SourceRange::default(),
        )
        .unwrap();
        assert_eq!(picked.function, f_float);
        assert!(!issues.has_errors());
    }

    #[test]
    fn test_no_match_reported() {
        let mut sym = SymbolTable::new();
        let b = *sym.builtins();
        let void = QualType::const_(b.void);
        let f = declare_fn(&mut sym, "f", vec![QualType::const_(b.s64)], void);
        let mut issues = IssueHandler::new();
        let result = resolve_overload(
            &sym,
            &mut issues,
            "f",
            &[f],
            &[rvalue(b.bool_)],
            SourceRange::default(),
        );
        assert!(result.is_none());
        assert!(issues
            .iter()
            .any(|i| matches!(i.kind, IssueKind::OverloadResolution(ORError::NoMatch { .. }))));
    }

    #[test]
    fn test_arity_mismatch_is_no_match() {
        let mut sym = SymbolTable::new();
        let b = *sym.builtins();
        let void = QualType::const_(b.void);
        let f = declare_fn(&mut sym, "f", vec![QualType::const_(b.s64)], void);
        let mut issues = IssueHandler::new();
        assert!(resolve_overload(&sym, &mut issues, "f", &[f], &[], SourceRange::default())
            .is_none());
    }

    #[test]
    fn test_equal_rank_is_ambiguous() {
        let mut sym = SymbolTable::new();
        let b = *sym.builtins();
        let void = QualType::const_(b.void);
        // s8 widens to either with the same rank.
        let f_s64 = declare_fn(&mut sym, "f", vec![QualType::const_(b.s64)], void);
        let f_s32 = declare_fn(&mut sym, "f", vec![QualType::const_(b.s32)], void);
        let _ = (f_s64, f_s32);
        let mut issues = IssueHandler::new();
        let result = resolve_overload(
            &sym,
            &mut issues,
            "f",
            &[f_s64, f_s32],
            &[rvalue(b.s8)],
            SourceRange::default(),
        );
        assert!(result.is_none());
        assert!(issues
            .iter()
            .any(|i| matches!(i.kind, IssueKind::OverloadResolution(ORError::Ambiguous { .. }))));
    }

    #[test]
    fn test_reference_parameter_requires_lvalue() {
        let mut sym = SymbolTable::new();
        let b = *sym.builtins();
        let void = QualType::const_(b.void);
        let ref_mut = sym.reference_type(QualType::mut_(b.s64));
        let f = declare_fn(&mut sym, "f", vec![QualType::const_(ref_mut)], void);
        let mut issues = IssueHandler::new();
        // RValue argument cannot bind to &mut.
        assert!(resolve_overload(
            &sym,
            &mut issues,
            "f",
            &[f],
            &[rvalue(b.s64)],
            SourceRange::default()
        )
        .is_none());
        // Mutable lvalue binds.
        let mut issues = IssueHandler::new();
        let arg = Argument { ty: QualType::mut_(b.s64), value_cat: ValueCategory::LValue };
        assert!(resolve_overload(&sym, &mut issues, "f", &[f], &[arg], SourceRange::default())
            .is_some());
    }
}
