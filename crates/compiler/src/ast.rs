//! Abstract syntax tree.
//!
//! The parser produces this tree; semantic analysis decorates it in place.
//! Every expression carries a [`Decoration`] (entity, type, value category,
//! optional constant) and every statement owns a [`CleanupStack`] of
//! destructor calls to run when control leaves it.

use crate::sema::entity::{
    AccessControl, ConstValue, EntityId, LifetimeOperation, Mutability, QualType, ValueCategory,
};
use crate::sema::conversion::Conversion;
use crate::source::SourceRange;

#[derive(Debug, Default)]
pub struct TranslationUnit {
    pub files: Vec<SourceFile>,
}

#[derive(Debug)]
pub struct SourceFile {
    pub name: String,
    pub index: u32,
    pub decls: Vec<Decl>,
}

// ============================================================================
// Declarations
// ============================================================================

#[derive(Debug)]
pub enum Decl {
    Function(FunctionDef),
    Record(RecordDef),
    Var(VarDecl),
    Import(ImportDecl),
}

impl Decl {
    pub fn range(&self) -> SourceRange {
        match self {
            Decl::Function(def) => def.range,
            Decl::Record(def) => def.range,
            Decl::Var(decl) => decl.range,
            Decl::Import(decl) => decl.range,
        }
    }
}

#[derive(Debug, Default)]
pub struct FunctionDef {
    pub name: String,
    pub params: Vec<ParamDecl>,
    pub return_type: Option<Expr>,
    /// `None` for foreign declarations.
    pub body: Option<Stmt>,
    pub extern_c: bool,
    pub access: AccessControl,
    pub range: SourceRange,
    pub entity: Option<EntityId>,
}

#[derive(Debug)]
pub struct ParamDecl {
    pub name: String,
    /// `None` only for `this` parameters, whose type is implied.
    pub type_expr: Option<Expr>,
    pub this: Option<ThisParameter>,
    pub range: SourceRange,
    pub entity: Option<EntityId>,
}

/// `this`, `&this` or `&mut this`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThisParameter {
    pub reference: bool,
    pub mutability: Mutability,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordKind {
    Struct,
    Protocol,
}

#[derive(Debug)]
pub struct RecordDef {
    pub kind: RecordKind,
    pub name: String,
    pub bases: Vec<BaseDecl>,
    pub members: Vec<Decl>,
    pub access: AccessControl,
    pub range: SourceRange,
    pub entity: Option<EntityId>,
}

#[derive(Debug)]
pub struct BaseDecl {
    pub type_expr: Expr,
    pub range: SourceRange,
    pub entity: Option<EntityId>,
}

#[derive(Debug, Default)]
pub struct VarDecl {
    pub name: String,
    pub mutability: Mutability,
    pub type_expr: Option<Expr>,
    pub init: Option<Expr>,
    pub access: AccessControl,
    pub is_static: bool,
    pub range: SourceRange,
    pub entity: Option<EntityId>,
}

#[derive(Debug)]
pub enum ImportTarget {
    /// `import lib` or `import lib.member`
    Native { path: Vec<String> },
    /// `import "libc.so"`
    Foreign { name: String },
}

#[derive(Debug)]
pub struct ImportDecl {
    pub target: ImportTarget,
    /// `true` for `import` (scoped), `false` for `use` (unscoped).
    pub scoped: bool,
    pub range: SourceRange,
}

// ============================================================================
// Statements
// ============================================================================

/// One pending destructor call, run when control leaves the owning statement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cleanup {
    pub object: EntityId,
    pub operation: LifetimeOperation,
}

/// Destructors in reverse-insertion order on every exit path.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupStack {
    entries: Vec<Cleanup>,
}

impl CleanupStack {
    pub fn push(&mut self, cleanup: Cleanup) {
        self.entries.push(cleanup);
    }

    /// Remove the entry for `object`, if any. Used when responsibility for a
    /// temporary moves to another statement or into a call.
    pub fn pop_for(&mut self, object: EntityId) -> Option<Cleanup> {
        let index = self.entries.iter().rposition(|c| c.object == object)?;
        Some(self.entries.remove(index))
    }

    /// Entries in execution (reverse-insertion) order.
    pub fn in_execution_order(&self) -> impl Iterator<Item = &Cleanup> {
        self.entries.iter().rev()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopKind {
    While,
    For,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JumpKind {
    Break,
    Continue,
}

#[derive(Debug)]
pub struct Stmt {
    pub kind: StmtKind,
    pub range: SourceRange,
    pub cleanups: CleanupStack,
    /// Cleared by reachability analysis for statements after a terminator.
    pub reachable: bool,
}

impl Stmt {
    pub fn new(kind: StmtKind, range: SourceRange) -> Self {
        Stmt { kind, range, cleanups: CleanupStack::default(), reachable: true }
    }
}

#[derive(Debug)]
pub enum StmtKind {
    Compound(Vec<Stmt>),
    Var(VarDecl),
    Expr(Expr),
    Return(Option<Expr>),
    If {
        cond: Expr,
        then_branch: Box<Stmt>,
        else_branch: Option<Box<Stmt>>,
    },
    Loop {
        kind: LoopKind,
        init: Option<Box<Stmt>>,
        cond: Option<Expr>,
        increment: Option<Expr>,
        body: Box<Stmt>,
    },
    Jump(JumpKind),
    Empty,
}

// ============================================================================
// Expressions
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    LeftShift,
    RightShift,
    BitAnd,
    BitOr,
    BitXor,
    LogicalAnd,
    LogicalOr,
    Less,
    LessEq,
    Greater,
    GreaterEq,
    Equals,
    NotEquals,
    Comma,
    Assign,
    AddAssign,
    SubAssign,
    MulAssign,
    DivAssign,
    RemAssign,
    LeftShiftAssign,
    RightShiftAssign,
    AndAssign,
    OrAssign,
    XorAssign,
}

impl BinaryOp {
    pub fn is_assignment(self) -> bool {
        use BinaryOp::*;
        matches!(
            self,
            Assign | AddAssign | SubAssign | MulAssign | DivAssign | RemAssign
                | LeftShiftAssign | RightShiftAssign | AndAssign | OrAssign | XorAssign
        )
    }

    /// The arithmetic operation a compound assignment applies, e.g.
    /// `AddAssign -> Add`.
    pub fn compound_operation(self) -> Option<BinaryOp> {
        use BinaryOp::*;
        Some(match self {
            AddAssign => Add,
            SubAssign => Sub,
            MulAssign => Mul,
            DivAssign => Div,
            RemAssign => Rem,
            LeftShiftAssign => LeftShift,
            RightShiftAssign => RightShift,
            AndAssign => BitAnd,
            OrAssign => BitOr,
            XorAssign => BitXor,
            _ => return None,
        })
    }

    pub fn is_comparison(self) -> bool {
        use BinaryOp::*;
        matches!(self, Less | LessEq | Greater | GreaterEq | Equals | NotEquals)
    }
}

impl std::fmt::Display for BinaryOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        use BinaryOp::*;
        let s = match self {
            Add => "+",
            Sub => "-",
            Mul => "*",
            Div => "/",
            Rem => "%",
            LeftShift => "<<",
            RightShift => ">>",
            BitAnd => "&",
            BitOr => "|",
            BitXor => "^",
            LogicalAnd => "&&",
            LogicalOr => "||",
            Less => "<",
            LessEq => "<=",
            Greater => ">",
            GreaterEq => ">=",
            Equals => "==",
            NotEquals => "!=",
            Comma => ",",
            Assign => "=",
            AddAssign => "+=",
            SubAssign => "-=",
            MulAssign => "*=",
            DivAssign => "/=",
            RemAssign => "%=",
            LeftShiftAssign => "<<=",
            RightShiftAssign => ">>=",
            AndAssign => "&=",
            OrAssign => "|=",
            XorAssign => "^=",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Promote,
    Negate,
    BitwiseNot,
    LogicalNot,
    Increment,
    Decrement,
}

impl std::fmt::Display for UnaryOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            UnaryOp::Promote => "+",
            UnaryOp::Negate => "-",
            UnaryOp::BitwiseNot => "~",
            UnaryOp::LogicalNot => "!",
            UnaryOp::Increment => "++",
            UnaryOp::Decrement => "--",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CastKind {
    /// `as` — explicit conversion.
    Explicit,
}

#[derive(Debug)]
pub enum FStringPart {
    Text(String),
    /// An interpolated operand together with the formatter function analysis
    /// selected for its type.
    Operand { expr: Box<Expr>, formatter: Option<EntityId> },
}

/// How a value of record or array type is created. Chosen by expression
/// analysis from the operand list and the target type's constructors,
/// aggregate-ness and triviality.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConstructKind {
    /// Zero-initialization of a trivially constructible type.
    TrivialDefault,
    /// Bitwise copy.
    TrivialCopy,
    /// Member-wise construction of a trivial aggregate from its members.
    TrivialAggregate,
    /// A user-declared constructor selected by overload resolution.
    Nontrivial,
    /// Compiler-synthesized element-wise construction for arrays.
    NontrivialInline,
    /// Member-wise construction of an aggregate with non-trivial members.
    NontrivialAggregate,
    /// `[T](count)` under a `unique` expression.
    DynamicArray,
}

/// Pointer qualifier spelled in a pointer type expression.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PointerQual {
    Raw,
    Unique,
}

#[derive(Debug)]
pub enum ExprKind {
    IntLit(u64),
    FloatLit(f64),
    BoolLit(bool),
    CharLit(u8),
    StringLit(String),
    NullLit,
    This,
    Ident(String),
    FString(Vec<FStringPart>),
    Unary {
        op: UnaryOp,
        prefix: bool,
        operand: Box<Expr>,
    },
    Binary {
        op: BinaryOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    MemberAccess {
        object: Box<Expr>,
        member: Box<Expr>,
    },
    Conditional {
        cond: Box<Expr>,
        then_expr: Box<Expr>,
        else_expr: Box<Expr>,
        /// Each branch cleans up its own temporaries because only one runs.
        then_cleanups: CleanupStack,
        else_cleanups: CleanupStack,
    },
    Call {
        callee: Box<Expr>,
        args: Vec<Expr>,
    },
    Subscript {
        object: Box<Expr>,
        index: Box<Expr>,
    },
    SubscriptSlice {
        object: Box<Expr>,
        lower: Box<Expr>,
        upper: Box<Expr>,
    },
    /// `name<args>`; the only generic today is `reinterpret<T>`.
    Generic {
        name: String,
        args: Vec<Expr>,
    },
    List(Vec<Expr>),
    Move(Box<Expr>),
    Unique(Box<Expr>),
    /// `&expr` in value position, `&T` / `& [mut]` (reference type or
    /// deduction qualifier) in type position.
    AddressOf {
        mutability: Mutability,
        operand: Option<Box<Expr>>,
    },
    /// `*expr` in value position, `* [mut|unique] T` (pointer type or
    /// deduction qualifier) in type position.
    Deref {
        mutability: Mutability,
        qual: PointerQual,
        operand: Option<Box<Expr>>,
    },
    Cast {
        kind: CastKind,
        operand: Box<Expr>,
        target: Box<Expr>,
    },

    // Nodes synthesized by semantic analysis.
    /// Wraps an expression whose value undergoes a computed conversion.
    Conversion {
        conv: Conversion,
        operand: Box<Expr>,
    },
    /// Canonical object-construction form; replaces type-valued calls,
    /// variable initializers and implicit constructions.
    Construct {
        kind: ConstructKind,
        /// Selected constructor for `Nontrivial`.
        function: Option<EntityId>,
        args: Vec<Expr>,
    },
    /// Assignment to a type without trivial copy; invokes destructor on the
    /// left side followed by copy or move construction from the right.
    NontrivAssign {
        dest: Box<Expr>,
        source: Box<Expr>,
        dtor: Option<EntityId>,
        ctor: Option<EntityId>,
    },
}

/// Semantic decoration attached to every analyzed expression.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Decoration {
    pub entity: Option<EntityId>,
    pub ty: Option<QualType>,
    pub value_cat: Option<ValueCategory>,
    pub constant: Option<ConstValue>,
}

#[derive(Debug)]
pub struct Expr {
    pub kind: ExprKind,
    pub range: SourceRange,
    pub deco: Decoration,
}

impl Expr {
    pub fn new(kind: ExprKind, range: SourceRange) -> Self {
        Expr { kind, range, deco: Decoration::default() }
    }

    /// The decorated type. Panics if analysis has not run; callers past the
    /// analysis phase rely on decoration totality.
    #[track_caller]
    pub fn ty(&self) -> QualType {
        self.deco.ty.clone().expect("expression is not decorated with a type")
    }

    #[track_caller]
    pub fn value_cat(&self) -> ValueCategory {
        self.deco.value_cat.expect("expression is not decorated with a value category")
    }

    pub fn entity(&self) -> Option<EntityId> {
        self.deco.entity
    }

    pub fn constant(&self) -> Option<&ConstValue> {
        self.deco.constant.as_ref()
    }

    /// `true` once analysis has attached both a type and a value category.
    pub fn is_decorated(&self) -> bool {
        self.deco.ty.is_some() && self.deco.value_cat.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cleanup_stack_runs_in_reverse() {
        let mut stack = CleanupStack::default();
        for i in 0..3 {
            stack.push(Cleanup {
                object: EntityId::from_raw(i),
                operation: LifetimeOperation::Trivial,
            });
        }
        let order: Vec<_> = stack
            .in_execution_order()
            .map(|c| c.object.raw())
            .collect();
        assert_eq!(order, vec![2, 1, 0]);
    }

    #[test]
    fn test_cleanup_pop_for_removes_matching_entry() {
        let mut stack = CleanupStack::default();
        stack.push(Cleanup {
            object: EntityId::from_raw(7),
            operation: LifetimeOperation::Trivial,
        });
        assert!(stack.pop_for(EntityId::from_raw(9)).is_none());
        assert!(stack.pop_for(EntityId::from_raw(7)).is_some());
        assert!(stack.is_empty());
    }

    #[test]
    fn test_compound_operations() {
        assert_eq!(BinaryOp::AddAssign.compound_operation(), Some(BinaryOp::Add));
        assert_eq!(BinaryOp::Assign.compound_operation(), None);
        assert!(BinaryOp::XorAssign.is_assignment());
        assert!(!BinaryOp::Comma.is_assignment());
    }
}
