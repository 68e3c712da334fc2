//! Gather pass: one lexical walk that declares every top-level name.
//!
//! Nothing is typed here; member types, signatures and initializers are
//! analyzed during instantiation and body analysis. The walk dismantles the
//! translation unit into flat record/function/global work lists so later
//! phases can process entities on demand.

use crate::ast::*;
use crate::issue::{BadStmt, IssueKind};
use crate::library;
use crate::sema::entity::*;
use crate::sema::{AnalysisContext, FuncState, FunctionSlot, GlobalSlot, RecordItem};

pub fn gather_unit(ctx: &mut AnalysisContext, unit: TranslationUnit) {
    for file in unit.files {
        let scope = ctx.sym.declare_file_scope(file.index, &file.name);
        ctx.sym.set_current_file(Some(file.index));
        ctx.sym.push_scope(scope);
        for decl in file.decls {
            gather_decl(ctx, decl);
        }
        ctx.sym.pop_scope();
    }
    ctx.sym.set_current_file(None);
}

fn gather_decl(ctx: &mut AnalysisContext, decl: Decl) {
    match decl {
        Decl::Function(def) => gather_function(ctx, def),
        Decl::Record(def) => gather_record(ctx, def),
        Decl::Var(decl) => gather_global(ctx, decl),
        Decl::Import(decl) => gather_import(ctx, &decl),
    }
}

fn gather_function(ctx: &mut AnalysisContext, mut def: FunctionDef) {
    let scope = ctx.sym.current_scope();
    let is_member = ctx.sym.entity(scope).is_record_type();
    let data = FunctionData { is_member, ..FunctionData::default() };
    let Some(entity) =
        ctx.sym
            .declare_func_name(&def.name, def.access, def.range, data, ctx.issues)
    else {
        return;
    };
    def.entity = Some(entity);
    ctx.function_index.insert(entity, ctx.functions.len());
    ctx.functions.push(FunctionSlot {
        entity,
        scope,
        def: Some(def),
        state: FuncState::Gathered,
        needs_ret_deduction: false,
        deduced_ret: None,
    });
}

fn gather_record(ctx: &mut AnalysisContext, def: RecordDef) {
    let Some(entity) = ctx.sym.declare_record_type(
        &def.name,
        def.kind == RecordKind::Protocol,
        def.access,
        def.range,
        ctx.issues,
    ) else {
        return;
    };
    ctx.sym.push_scope(entity);
    let mut item = RecordItem { entity, vars: Vec::new(), bases: Vec::new() };
    for mut base in def.bases {
        let base_entity = ctx.sym.declare_base_class(base.range);
        let index = push_record_element(ctx, entity, base_entity);
        if let EntityKind::BaseClassObject { index: slot, .. } =
            &mut ctx.sym.entity_mut(base_entity).kind
        {
            *slot = Some(index);
        }
        base.entity = Some(base_entity);
        item.bases.push(base);
    }
    for member in def.members {
        match member {
            Decl::Var(mut var) => {
                let Some(var_entity) = ctx.sym.declare_variable(
                    &var.name,
                    var.mutability,
                    var.is_static,
                    var.access,
                    var.range,
                    ctx.issues,
                ) else {
                    continue;
                };
                let index = push_record_element(ctx, entity, var_entity);
                ctx.sym
                    .entity_mut(var_entity)
                    .as_variable_mut()
                    .expect("declared variable")
                    .index = Some(index);
                var.entity = Some(var_entity);
                item.vars.push(var);
            }
            other => gather_decl(ctx, other),
        }
    }
    ctx.sym.pop_scope();
    ctx.records.push(item);
}

fn push_record_element(ctx: &mut AnalysisContext, record: EntityId, element: EntityId) -> usize {
    let data = ctx
        .sym
        .entity_mut(record)
        .as_record_mut()
        .expect("record entity");
    data.elements.push(element);
    data.elements.len() - 1
}

fn gather_global(ctx: &mut AnalysisContext, mut decl: VarDecl) {
    decl.is_static = true;
    let scope = ctx.sym.current_scope();
    let Some(entity) = ctx.sym.declare_variable(
        &decl.name,
        decl.mutability,
        true,
        decl.access,
        decl.range,
        ctx.issues,
    ) else {
        return;
    };
    decl.entity = Some(entity);
    ctx.globals.push(GlobalSlot { entity, scope, decl: Some(decl) });
}

fn gather_import(ctx: &mut AnalysisContext, decl: &ImportDecl) {
    match &decl.target {
        ImportTarget::Foreign { name } => {
            ctx.sym.declare_foreign_library(name, decl.range, ctx.issues);
        }
        ImportTarget::Native { path } => {
            let name = path.join(".");
            let manifest =
                match library::find_library(&path[0], &ctx.options.library_search_paths) {
                    Ok(manifest) => manifest,
                    Err(err) => {
                        ctx.issues.error(
                            decl.range,
                            IssueKind::BadStmt(BadStmt::BadImport {
                                name,
                                reason: err.to_string(),
                            }),
                        );
                        return;
                    }
                };
            install_library(ctx, decl, &manifest);
        }
    }
}

/// Install a library's exports into a `NativeLibrary` scope bound to the
/// import name. Each library occupies its own foreign function slot.
fn install_library(
    ctx: &mut AnalysisContext,
    decl: &ImportDecl,
    manifest: &library::LibraryManifest,
) {
    let slot = ctx.next_library_slot;
    ctx.next_library_slot += 1;
    let Some(lib) = ctx.sym.declare_native_library(&manifest.name, decl.range, ctx.issues)
    else {
        return;
    };
    let mut exported = Vec::new();
    for (index, export) in manifest.exports.iter().enumerate() {
        let params = export
            .params
            .iter()
            .map(|desc| QualType::const_(library::instantiate_type(ctx.sym, desc)))
            .collect();
        let ret = QualType::const_(library::instantiate_type(ctx.sym, &export.ret));
        let data = FunctionData {
            signature: Some(Signature { params, ret }),
            kind: FunctionKind::Foreign { slot, index: index as u16 },
            ..FunctionData::default()
        };
        let entity = ctx.sym.with_scope_current(lib, |sym| {
            sym.declare_func_name(
                &export.name,
                AccessControl::Public,
                decl.range,
                data,
                ctx.issues,
            )
        });
        if let Some(entity) = entity {
            exported.push(entity);
        }
    }
    // `use` additionally makes the exports visible unscoped.
    if !decl.scoped {
        for entity in exported {
            let name = ctx.sym.entity(entity).name.clone();
            ctx.sym.declare_alias(&name, entity, AccessControl::Public, decl.range, ctx.issues);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::issue::IssueHandler;
    use crate::parser::parse_unit;
    use crate::sema::symbol_table::{Lookup, SymbolTable};
    use crate::sema::AnalysisOptions;

    fn gather(source: &str) -> (SymbolTable, IssueHandler, Vec<RecordItem>, usize, usize) {
        let mut issues = IssueHandler::new();
        let unit = parse_unit([("main.sc", source)], &mut issues);
        let mut sym = SymbolTable::new();
        let mut ctx = AnalysisContext::new(&mut sym, &mut issues, AnalysisOptions::default());
        gather_unit(&mut ctx, unit);
        let records = std::mem::take(&mut ctx.records);
        let functions = ctx.functions.len();
        let globals = ctx.globals.len();
        drop(ctx);
        (sym, issues, records, functions, globals)
    }

    #[test]
    fn test_gathers_top_level_names() {
        let (sym, issues, records, functions, globals) = gather(
            "struct X { var v: int; fn get(&this) -> int { return this.v; } } \
             fn main() {} \
             var g = 1;",
        );
        assert!(!issues.has_errors());
        assert_eq!(records.len(), 1);
        assert_eq!(functions, 2);
        assert_eq!(globals, 1);
        assert_eq!(sym.entity(records[0].entity).name, "X");
    }

    #[test]
    fn test_member_variables_land_in_record_scope() {
        let (mut sym, _, records, _, _) = gather("struct P { var x: int; var y: int; }");
        let record = records[0].entity;
        assert!(matches!(sym.qualified_lookup(record, "x"), Lookup::Single(_)));
        assert_eq!(sym.entity(record).as_record().unwrap().elements.len(), 2);
        assert_eq!(records[0].vars.len(), 2);
    }

    #[test]
    fn test_base_classes_are_recorded() {
        let (sym, _, records, _, _) = gather("struct A {} struct B: A {}");
        let b = records[1].entity;
        assert_eq!(records[1].bases.len(), 1);
        assert_eq!(sym.entity(b).as_record().unwrap().elements.len(), 1);
    }

    #[test]
    fn test_duplicate_record_reported_once() {
        let (_, issues, _, _, _) = gather("struct X {} struct X {}");
        let errors = issues
            .iter()
            .filter(|i| matches!(i.kind, IssueKind::BadStmt(BadStmt::Redefinition { .. })))
            .count();
        assert_eq!(errors, 1);
    }

    #[test]
    fn test_missing_library_import_is_reported() {
        let (_, issues, _, _, _) = gather("import nosuchlib;");
        assert!(issues
            .iter()
            .any(|i| matches!(i.kind, IssueKind::BadStmt(BadStmt::BadImport { .. }))));
    }
}
