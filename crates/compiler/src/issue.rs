//! Issues: the push-only diagnostic log and the error taxonomy.
//!
//! All analysis errors are values. Each issue carries its severity, source
//! range and a structured kind with enough context to render a highlighted
//! snippet; rendering itself is left to front ends.

use crate::source::SourceRange;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Error,
    Warning,
}

/// Statement-level problems.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BadStmt {
    Generic { message: String },
    Redefinition { name: String, previous: Option<SourceRange> },
    BadVarDecl { name: String, reason: String },
    BadSMF { name: String, reason: String },
    StructDefCycle { cycle: Vec<String> },
    BadFuncDef { name: String, reason: String },
    BadReturn { reason: String },
    BadReturnTypeDeduction { deduced: String, conflicting: String, previous: SourceRange },
    BadImport { name: String, reason: String },
    BadBaseDecl { reason: String },
    JumpOutsideLoop,
    /// Warning attached to the first statement after a terminator.
    UnreachableStatement,
}

/// Expression-level problems.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BadExpr {
    UndeclaredName { name: String },
    /// A type or namespace appeared where a value was required, or the
    /// reverse.
    BadSymbolReference { name: String, expected: &'static str },
    BadTypeConv { from: String, to: String },
    BadValueCatConv { to_category: &'static str },
    BadMutConv { from: String, to: String },
    BadUnaryOperand { op: String, ty: String },
    BadBinaryOperands { op: String, lhs: String, rhs: String },
    AccessDenied { name: String },
    AccessedMemberWithoutObject { name: String },
    AmbiguousMemberAccess { name: String },
    MemberNotFound { ty: String, name: String },
    NotFormattable { ty: String },
    InvalidUseOfThis,
    ExplicitSMFCall { name: String },
    /// `[T](n)` outside a `unique` expression.
    DynArrayConstructMisuse,
    CannotConstructType { ty: String, reason: String },
    NotCallable { ty: String },
    InvalidSubscript { ty: String },
    Generic { message: String },
}

/// Argument or return type not passable across a function boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BadPassedType {
    Argument { ty: String },
    Return { ty: String },
}

/// Failures of `deduceType` for variable declarations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BadTypeDeduction {
    MissingInitializer { name: String },
    MutabilityMismatch { name: String },
    NotAPointer { ty: String },
    InvalidContext,
}

/// Overload resolution failures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ORError {
    NoMatch { name: String, arguments: Vec<String> },
    Ambiguous { name: String, candidates: Vec<String> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IssueKind {
    Syntax { message: String },
    BadStmt(BadStmt),
    BadExpr(BadExpr),
    BadPassedType(BadPassedType),
    BadTypeDeduction(BadTypeDeduction),
    OverloadResolution(ORError),
}

impl std::fmt::Display for IssueKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IssueKind::Syntax { message } => write!(f, "syntax error: {}", message),
            IssueKind::BadStmt(e) => write!(f, "{:?}", e),
            IssueKind::BadExpr(e) => write!(f, "{:?}", e),
            IssueKind::BadPassedType(e) => write!(f, "{:?}", e),
            IssueKind::BadTypeDeduction(e) => write!(f, "{:?}", e),
            IssueKind::OverloadResolution(e) => write!(f, "{:?}", e),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Issue {
    pub severity: Severity,
    pub range: SourceRange,
    pub kind: IssueKind,
}

impl std::fmt::Display for Issue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let severity = match self.severity {
            Severity::Error => "error",
            Severity::Warning => "warning",
        };
        write!(f, "{}: {}: {}", self.range, severity, self.kind)
    }
}

/// Push-only log of issues. Compilation succeeds iff no `Error`-severity
/// entry was pushed.
#[derive(Debug, Default)]
pub struct IssueHandler {
    issues: Vec<Issue>,
}

impl IssueHandler {
    pub fn new() -> Self {
        IssueHandler::default()
    }

    pub fn push(&mut self, issue: Issue) {
        tracing::debug!(%issue, "issue");
        self.issues.push(issue);
    }

    pub fn error(&mut self, range: SourceRange, kind: IssueKind) {
        self.push(Issue { severity: Severity::Error, range, kind });
    }

    pub fn warning(&mut self, range: SourceRange, kind: IssueKind) {
        self.push(Issue { severity: Severity::Warning, range, kind });
    }

    pub fn has_errors(&self) -> bool {
        self.issues.iter().any(|i| i.severity == Severity::Error)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Issue> {
        self.issues.iter()
    }

    pub fn len(&self) -> usize {
        self.issues.len()
    }

    pub fn is_empty(&self) -> bool {
        self.issues.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_success_means_no_errors() {
        let mut handler = IssueHandler::new();
        assert!(!handler.has_errors());
        handler.warning(
            SourceRange::default(),
            IssueKind::BadStmt(BadStmt::UnreachableStatement),
        );
        assert!(!handler.has_errors());
        handler.error(
            SourceRange::default(),
            IssueKind::BadExpr(BadExpr::UndeclaredName { name: "x".to_string() }),
        );
        assert!(handler.has_errors());
        assert_eq!(handler.len(), 2);
    }
}
