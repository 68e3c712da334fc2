//! Scatha compiler library.
//!
//! The full pipeline: source text → tokens → AST → decorated AST → SSA IR →
//! MIR with allocated registers → bytecode for the Scatha VM. Each stage is
//! exposed on its own; [`compile_source`] wires them in order.

pub mod asm;
pub mod ast;
pub mod config;
pub mod ir;
pub mod irgen;
pub mod issue;
pub mod lexer;
pub mod library;
pub mod mir;
pub mod parser;
pub mod sema;
pub mod source;

pub use asm::{assemble, generate_assembly, AssemblyStream};
pub use config::CompilerConfig;
pub use issue::{Issue, IssueHandler, Severity};
pub use mir::{allocate_registers, lower_to_mir};
pub use parser::{parse_source, parse_unit};
pub use sema::{analyze, AnalysisOptions, AnalyzedProgram};
pub use sema::symbol_table::SymbolTable;

/// Compilation failed; the handler's issues explain why.
#[derive(Debug)]
pub struct CompileError {
    pub issues: Vec<Issue>,
}

impl std::fmt::Display for CompileError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for issue in &self.issues {
            writeln!(f, "{}", issue)?;
        }
        Ok(())
    }
}

impl std::error::Error for CompileError {}

/// Compile a single source file to a loadable program image.
pub fn compile_source(source: &str, config: &CompilerConfig) -> Result<Vec<u8>, CompileError> {
    compile_files([("main.sc", source)], config)
}

/// Compile a set of (name, source) files to a loadable program image.
pub fn compile_files<'a>(
    sources: impl IntoIterator<Item = (&'a str, &'a str)>,
    config: &CompilerConfig,
) -> Result<Vec<u8>, CompileError> {
    let mut issues = IssueHandler::new();
    tracing::debug!("parse");
    let unit = parser::parse_unit(sources, &mut issues);
    let mut sym = SymbolTable::new();
    let options = AnalysisOptions {
        library_search_paths: config.library_search_paths.clone(),
    };
    let program = sema::analyze(unit, &mut sym, &mut issues, options);
    if issues.has_errors() {
        return Err(CompileError { issues: issues.iter().cloned().collect() });
    }
    tracing::debug!("irgen");
    let ir_module = irgen::generate(&program, &sym);
    tracing::debug!("lower to mir");
    let mut mir_module = mir::lower_to_mir(ir_module);
    for index in 0..mir_module.functions.len() {
        let function = &mut mir_module.functions[index];
        if config.optimize.tail_call_opt {
            mir::passes::tail_call_opt(function, index);
        }
        mir::allocate_registers(function);
        if config.optimize.reorder_blocks {
            mir::passes::reorder_blocks(function);
        }
        if config.optimize.elide_jumps {
            mir::passes::elide_jumps(function);
        }
    }
    tracing::debug!("assemble");
    let stream = asm::generate_assembly(&mir_module);
    let image = asm::assemble(&stream).map_err(|err| CompileError {
        issues: vec![Issue {
            severity: Severity::Error,
            range: source::SourceRange::default(),
            kind: issue::IssueKind::Syntax { message: err.to_string() },
        }],
    })?;
    Ok(image)
}

/// Export the public, foreign-callable functions of a compiled unit as a
/// native library manifest.
pub fn export_library(
    name: &str,
    program: &AnalyzedProgram,
    sym: &SymbolTable,
) -> library::LibraryManifest {
    use sema::entity::{AccessControl, EntityKind};
    let mut exports = Vec::new();
    for function in &program.functions {
        let entity = sym.entity(function.entity);
        if entity.access != AccessControl::Public {
            continue;
        }
        let Some(signature) = entity.as_function().and_then(|f| f.signature.as_ref()) else {
            continue;
        };
        let describe = |ty: &sema::entity::QualType| -> Option<library::TypeDesc> {
            let resolved = sym.resolve(ty.ty);
            Some(match &sym.entity(resolved).kind {
                EntityKind::VoidType => library::TypeDesc::Void,
                EntityKind::BoolType => library::TypeDesc::Bool,
                EntityKind::ByteType => library::TypeDesc::Byte,
                EntityKind::IntType(data) => {
                    library::TypeDesc::Int { width: data.width, signed: data.signed }
                }
                EntityKind::FloatType { width } => library::TypeDesc::Float { width: *width },
                _ => return None,
            })
        };
        let params: Option<Vec<_>> = signature.params.iter().map(describe).collect();
        let (Some(params), Some(ret)) = (params, describe(&signature.ret)) else {
            continue;
        };
        exports.push(library::ExportedFunction {
            name: entity.name.clone(),
            params,
            ret,
        });
    }
    library::LibraryManifest { name: name.to_string(), exports }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compile_simple_program() {
        let image = compile_source(
            "fn main() -> int { return 2 * 3 + 1; }",
            &CompilerConfig::default(),
        )
        .unwrap();
        assert!(scatha_core::program::ProgramView::new(&image).is_ok());
    }

    #[test]
    fn test_compile_error_carries_issues() {
        let err = compile_source("fn main() { return undeclared; }", &CompilerConfig::default())
            .unwrap_err();
        assert!(!err.issues.is_empty());
        assert!(!err.to_string().is_empty());
    }

    #[test]
    fn test_export_library_skips_private_and_nonffi() {
        let mut issues = IssueHandler::new();
        let unit = parse_unit(
            [(
                "lib.sc",
                "public fn add(a: int, b: int) -> int { return a + b; } \
                 private fn hidden() -> int { return 1; } \
                 struct S { var v: int; } \
                 public fn make() -> S { return S(1); }",
            )],
            &mut issues,
        );
        let mut sym = SymbolTable::new();
        let program = analyze(unit, &mut sym, &mut issues, AnalysisOptions::default());
        assert!(!issues.has_errors());
        let manifest = export_library("mylib", &program, &sym);
        let names: Vec<_> = manifest.exports.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["add"]);
    }
}
