//! Semantic analysis.
//!
//! Phases, in order: gather (declare all top-level names and record the type
//! dependency graph), instantiate (analyze member types, lay out records,
//! synthesize lifetime metadata, analyze signatures), then statement and
//! expression analysis over every function body and global initializer.

pub mod conversion;
pub mod entity;
pub mod expr;
pub mod gather;
pub mod instantiate;
pub mod overload;
pub mod stmt;
pub mod symbol_table;

use std::collections::HashMap;
use std::path::PathBuf;

use crate::ast::{BaseDecl, CleanupStack, FunctionDef, TranslationUnit, VarDecl};
use crate::issue::IssueHandler;
use entity::{EntityId, QualType};
use symbol_table::SymbolTable;

/// External knobs for analysis.
#[derive(Debug, Clone, Default)]
pub struct AnalysisOptions {
    /// Directories searched for `<name>.scibin` native libraries.
    pub library_search_paths: Vec<PathBuf>,
}

/// Analysis state of one function definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FuncState {
    Gathered,
    Analyzing,
    Analyzed,
}

/// One function definition owned by the analyzer. The body is taken out of
/// the slot while the function is being analyzed, which doubles as the
/// recursion guard for return type deduction.
#[derive(Debug)]
pub struct FunctionSlot {
    pub entity: EntityId,
    /// Scope the declaration appeared in (file scope or record scope).
    pub scope: EntityId,
    pub def: Option<FunctionDef>,
    pub state: FuncState,
    /// The declaration had no return type annotation.
    pub needs_ret_deduction: bool,
    /// Agreed deduced return type and the range of the return that set it.
    pub deduced_ret: Option<(QualType, crate::source::SourceRange)>,
}

/// A global variable awaiting initializer analysis.
#[derive(Debug)]
pub struct GlobalSlot {
    pub entity: EntityId,
    pub scope: EntityId,
    pub decl: Option<VarDecl>,
}

/// A record together with the member/base declarations instantiation needs.
#[derive(Debug)]
pub struct RecordItem {
    pub entity: EntityId,
    pub vars: Vec<VarDecl>,
    pub bases: Vec<BaseDecl>,
}

/// Cleanup frame kinds; returns unwind to `Function`, jumps to `Loop`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Function,
    Loop,
    Block,
}

#[derive(Debug)]
pub struct Frame {
    pub kind: FrameKind,
    pub cleanups: CleanupStack,
}

pub struct AnalysisContext<'a> {
    pub sym: &'a mut SymbolTable,
    pub issues: &'a mut IssueHandler,
    pub options: AnalysisOptions,
    pub records: Vec<RecordItem>,
    pub functions: Vec<FunctionSlot>,
    pub function_index: HashMap<EntityId, usize>,
    pub globals: Vec<GlobalSlot>,
    /// Index of the function currently being analyzed.
    pub current_function: Option<usize>,
    /// Block/loop/function cleanup frames of the current body.
    pub frames: Vec<Frame>,
    /// Record types on the formatting stack; detects `to_string` recursion.
    pub fstring_stack: Vec<EntityId>,
    /// Set while analyzing the operand of a `unique` expression; gates
    /// dynamic array construction.
    pub in_unique: bool,
    /// Next foreign function index for extern declarations that are not
    /// builtins.
    pub next_foreign_index: u16,
    /// Next foreign function slot for imported native libraries.
    pub next_library_slot: u8,
}

impl<'a> AnalysisContext<'a> {
    pub fn new(
        sym: &'a mut SymbolTable,
        issues: &'a mut IssueHandler,
        options: AnalysisOptions,
    ) -> Self {
        AnalysisContext {
            sym,
            issues,
            options,
            records: Vec::new(),
            functions: Vec::new(),
            function_index: HashMap::new(),
            globals: Vec::new(),
            current_function: None,
            frames: Vec::new(),
            fstring_stack: Vec::new(),
            in_unique: false,
            next_foreign_index: 0,
            next_library_slot: crate::library::FIRST_LIBRARY_SLOT,
        }
    }

    /// Cleanups a `return` or jump must run: `Function` gathers every frame
    /// of the current body, `Loop` only the frames inside the innermost loop
    /// (the loop's own cleanups run at its exit). Entries are pushed
    /// outermost-frame first, so execution (reverse) order destroys the
    /// innermost, most recent objects first.
    pub fn gather_cleanups_to(&self, kind: FrameKind) -> CleanupStack {
        let start = match kind {
            FrameKind::Function => self
                .frames
                .iter()
                .rposition(|f| f.kind == FrameKind::Function)
                .unwrap_or(0),
            FrameKind::Loop => self
                .frames
                .iter()
                .rposition(|f| f.kind == FrameKind::Loop)
                .map(|i| i + 1)
                .unwrap_or(0),
            FrameKind::Block => 0,
        };
        let mut stack = CleanupStack::default();
        for frame in &self.frames[start..] {
            let in_insertion_order: Vec<_> =
                frame.cleanups.in_execution_order().collect::<Vec<_>>().into_iter().rev().collect();
            for cleanup in in_insertion_order {
                stack.push(cleanup.clone());
            }
        }
        stack
    }

    /// Run `f` with the current scope set to `scope` (entering the whole
    /// chain from the global scope) and the current file set to the scope's
    /// declaring file, restoring both on exit.
    pub fn with_scope<R>(
        &mut self,
        scope: EntityId,
        f: impl FnOnce(&mut AnalysisContext) -> R,
    ) -> R {
        let previous = self.sym.current_scope();
        let previous_file = self.sym.current_file();
        self.sym.set_current_file(self.sym.entity(scope).file);
        self.enter_scope_chain(scope);
        let result = f(self);
        self.enter_scope_chain(previous);
        self.sym.set_current_file(previous_file);
        result
    }

    fn enter_scope_chain(&mut self, target: EntityId) {
        while self.sym.current_scope() != self.sym.global_scope() {
            self.sym.pop_scope();
        }
        let mut path = Vec::new();
        let mut cursor = Some(target);
        while let Some(id) = cursor {
            if id == self.sym.global_scope() {
                break;
            }
            path.push(id);
            cursor = self.sym.entity(id).parent;
        }
        for id in path.into_iter().rev() {
            self.sym.push_scope(id);
        }
    }
}

/// Result of a successful analysis: decorated function bodies and globals in
/// a form the IR generator consumes directly.
#[derive(Debug)]
pub struct AnalyzedProgram {
    /// Record types in instantiation (topological) order.
    pub records: Vec<EntityId>,
    pub functions: Vec<AnalyzedFunction>,
    pub globals: Vec<AnalyzedGlobal>,
}

#[derive(Debug)]
pub struct AnalyzedFunction {
    pub entity: EntityId,
    pub def: FunctionDef,
}

#[derive(Debug)]
pub struct AnalyzedGlobal {
    pub entity: EntityId,
    pub decl: VarDecl,
}

/// Run all analysis phases over `unit`.
pub fn analyze(
    unit: TranslationUnit,
    sym: &mut SymbolTable,
    issues: &mut IssueHandler,
    options: AnalysisOptions,
) -> AnalyzedProgram {
    let mut ctx = AnalysisContext::new(sym, issues, options);
    tracing::debug!("gather");
    gather::gather_unit(&mut ctx, unit);
    tracing::debug!("instantiate");
    let records = instantiate::instantiate_entities(&mut ctx);
    instantiate::analyze_signatures(&mut ctx);
    instantiate::analyze_lifetimes(&mut ctx, &records);
    tracing::debug!("analyze bodies");
    stmt::analyze_globals(&mut ctx);
    stmt::analyze_functions(&mut ctx);

    let functions = ctx
        .functions
        .into_iter()
        .filter_map(|slot| {
            Some(AnalyzedFunction { entity: slot.entity, def: slot.def? })
        })
        .collect();
    let globals = ctx
        .globals
        .into_iter()
        .filter_map(|slot| Some(AnalyzedGlobal { entity: slot.entity, decl: slot.decl? }))
        .collect();
    AnalyzedProgram { records, functions, globals }
}
