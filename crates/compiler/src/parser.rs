//! Parser: token stream to AST.
//!
//! Recursive descent with precedence climbing for expressions. Syntax errors
//! are pushed to the issue handler and the parser recovers at declaration or
//! statement boundaries, so one pass reports as much as possible.

use crate::ast::*;
use crate::issue::{IssueHandler, IssueKind};
use crate::lexer::{Lexer, Token, TokenKind};
use crate::sema::entity::{AccessControl, Mutability};
use crate::source::SourceRange;

pub struct Parser<'a> {
    tokens: Vec<Token>,
    pos: usize,
    file: u32,
    issues: &'a mut IssueHandler,
}

/// Parse one source file into the translation unit.
pub fn parse_source(
    source: &str,
    name: &str,
    file: u32,
    issues: &mut IssueHandler,
) -> SourceFile {
    let tokens = match Lexer::new(source, file).lex() {
        Ok(tokens) => tokens,
        Err(err) => {
            issues.error(err.range, IssueKind::Syntax { message: err.message });
            vec![Token {
                kind: TokenKind::End,
                lexeme: String::new(),
                range: err.range,
            }]
        }
    };
    let mut parser = Parser { tokens, pos: 0, file, issues };
    let decls = parser.parse_decls();
    SourceFile { name: name.to_string(), index: file, decls }
}

/// Convenience entry: parse a set of (name, source) pairs.
pub fn parse_unit<'a>(
    sources: impl IntoIterator<Item = (&'a str, &'a str)>,
    issues: &mut IssueHandler,
) -> TranslationUnit {
    let mut unit = TranslationUnit::default();
    for (index, (name, source)) in sources.into_iter().enumerate() {
        unit.files.push(parse_source(source, name, index as u32, issues));
    }
    unit
}

impl<'a> Parser<'a> {
    fn peek(&self) -> &Token {
        &self.tokens[self.pos.min(self.tokens.len() - 1)]
    }

    fn peek_kind(&self) -> TokenKind {
        self.peek().kind
    }

    fn peek2_kind(&self) -> TokenKind {
        self.tokens
            .get(self.pos + 1)
            .map(|t| t.kind)
            .unwrap_or(TokenKind::End)
    }

    fn bump(&mut self) -> Token {
        let token = self.peek().clone();
        if self.pos + 1 < self.tokens.len() {
            self.pos += 1;
        }
        token
    }

    fn at(&self, kind: TokenKind) -> bool {
        self.peek_kind() == kind
    }

    fn eat(&mut self, kind: TokenKind) -> Option<Token> {
        if self.at(kind) {
            Some(self.bump())
        } else {
            None
        }
    }

    fn expect(&mut self, kind: TokenKind, what: &str) -> Option<Token> {
        if self.at(kind) {
            Some(self.bump())
        } else {
            self.error_here(&format!("expected {}", what));
            None
        }
    }

    fn error_here(&mut self, message: &str) {
        let range = self.peek().range;
        self.issues.error(range, IssueKind::Syntax { message: message.to_string() });
    }

    /// Skip tokens until a likely declaration/statement boundary.
    fn synchronize(&mut self) {
        let mut depth = 0usize;
        loop {
            match self.peek_kind() {
                TokenKind::End => return,
                TokenKind::Semicolon if depth == 0 => {
                    self.bump();
                    return;
                }
                TokenKind::LBrace => {
                    depth += 1;
                    self.bump();
                }
                TokenKind::RBrace => {
                    if depth == 0 {
                        return;
                    }
                    depth -= 1;
                    self.bump();
                    if depth == 0 {
                        return;
                    }
                }
                _ => {
                    self.bump();
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Declarations
    // ------------------------------------------------------------------

    fn parse_decls(&mut self) -> Vec<Decl> {
        let mut decls = Vec::new();
        while !self.at(TokenKind::End) {
            match self.parse_decl() {
                Some(decl) => decls.push(decl),
                None => self.synchronize(),
            }
        }
        decls
    }

    fn parse_access(&mut self) -> AccessControl {
        if self.eat(TokenKind::Private).is_some() {
            AccessControl::Private
        } else {
            self.eat(TokenKind::Public);
            AccessControl::Public
        }
    }

    fn parse_decl(&mut self) -> Option<Decl> {
        match self.peek_kind() {
            TokenKind::Import | TokenKind::Use => self.parse_import().map(Decl::Import),
            _ => {
                let access = self.parse_access();
                match self.peek_kind() {
                    TokenKind::Extern | TokenKind::Fn => {
                        self.parse_function(access).map(Decl::Function)
                    }
                    TokenKind::Struct | TokenKind::Protocol => {
                        self.parse_record(access).map(Decl::Record)
                    }
                    TokenKind::Var | TokenKind::Let => {
                        self.parse_var_decl(access).map(Decl::Var)
                    }
                    _ => {
                        self.error_here("expected a declaration");
                        None
                    }
                }
            }
        }
    }

    fn parse_import(&mut self) -> Option<ImportDecl> {
        let keyword = self.bump();
        let scoped = keyword.kind == TokenKind::Import;
        let target = if self.at(TokenKind::StringLiteral) {
            let token = self.bump();
            ImportTarget::Foreign { name: token.lexeme }
        } else {
            let first = self.expect(TokenKind::Identifier, "library name")?;
            let mut path = vec![first.lexeme];
            while self.eat(TokenKind::Dot).is_some() {
                let part = self.expect(TokenKind::Identifier, "name after '.'")?;
                path.push(part.lexeme);
            }
            ImportTarget::Native { path }
        };
        let end = self.expect(TokenKind::Semicolon, "';' after import")?;
        Some(ImportDecl { target, scoped, range: keyword.range.join(end.range) })
    }

    fn parse_function(&mut self, access: AccessControl) -> Option<FunctionDef> {
        let start = self.peek().range;
        let extern_c = if self.eat(TokenKind::Extern).is_some() {
            let abi = self.expect(TokenKind::StringLiteral, "ABI string after 'extern'")?;
            if abi.lexeme != "C" {
                self.issues.error(
                    abi.range,
                    IssueKind::Syntax { message: format!("unknown ABI \"{}\"", abi.lexeme) },
                );
            }
            true
        } else {
            false
        };
        self.expect(TokenKind::Fn, "'fn'")?;
        let name = match self.peek_kind() {
            TokenKind::Identifier | TokenKind::New | TokenKind::Move | TokenKind::Delete => {
                self.bump().lexeme
            }
            _ => {
                self.error_here("expected function name");
                return None;
            }
        };
        self.expect(TokenKind::LParen, "'('")?;
        let mut params = Vec::new();
        while !self.at(TokenKind::RParen) && !self.at(TokenKind::End) {
            params.push(self.parse_param()?);
            if self.eat(TokenKind::Comma).is_none() {
                break;
            }
        }
        self.expect(TokenKind::RParen, "')'")?;
        let return_type = if self.eat(TokenKind::Arrow).is_some() {
            Some(self.parse_type_expr()?)
        } else {
            None
        };
        let (body, end) = if self.at(TokenKind::LBrace) {
            let body = self.parse_compound()?;
            let range = body.range;
            (Some(body), range)
        } else {
            let semi = self.expect(TokenKind::Semicolon, "function body or ';'")?;
            (None, semi.range)
        };
        Some(FunctionDef {
            name,
            params,
            return_type,
            body,
            extern_c,
            access,
            range: start.join(end),
            entity: None,
        })
    }

    fn parse_param(&mut self) -> Option<ParamDecl> {
        let start = self.peek().range;
        // `this`, `&this`, `&mut this`
        if self.at(TokenKind::This)
            || (self.at(TokenKind::Amp)
                && matches!(self.peek2_kind(), TokenKind::This | TokenKind::Mut))
        {
            let reference = self.eat(TokenKind::Amp).is_some();
            let mutability = if reference && self.eat(TokenKind::Mut).is_some() {
                Mutability::Mut
            } else {
                Mutability::Const
            };
            let this = self.expect(TokenKind::This, "'this'")?;
            return Some(ParamDecl {
                name: "this".to_string(),
                type_expr: None,
                this: Some(ThisParameter { reference, mutability }),
                range: start.join(this.range),
                entity: None,
            });
        }
        let name = self.expect(TokenKind::Identifier, "parameter name")?;
        self.expect(TokenKind::Colon, "':' after parameter name")?;
        let ty = self.parse_type_expr()?;
        let range = start.join(ty.range);
        Some(ParamDecl {
            name: name.lexeme,
            type_expr: Some(ty),
            this: None,
            range,
            entity: None,
        })
    }

    fn parse_record(&mut self, access: AccessControl) -> Option<RecordDef> {
        let keyword = self.bump();
        let kind = if keyword.kind == TokenKind::Protocol {
            RecordKind::Protocol
        } else {
            RecordKind::Struct
        };
        let name = self.expect(TokenKind::Identifier, "record name")?;
        let mut bases = Vec::new();
        if self.eat(TokenKind::Colon).is_some() {
            loop {
                let ty = self.parse_type_expr()?;
                let range = ty.range;
                bases.push(BaseDecl { type_expr: ty, range, entity: None });
                if self.eat(TokenKind::Comma).is_none() {
                    break;
                }
            }
        }
        self.expect(TokenKind::LBrace, "'{'")?;
        let mut members = Vec::new();
        while !self.at(TokenKind::RBrace) && !self.at(TokenKind::End) {
            match self.parse_decl() {
                Some(decl) => members.push(decl),
                None => self.synchronize(),
            }
        }
        let close = self.expect(TokenKind::RBrace, "'}'")?;
        Some(RecordDef {
            kind,
            name: name.lexeme,
            bases,
            members,
            access,
            range: keyword.range.join(close.range),
            entity: None,
        })
    }

    fn parse_var_decl(&mut self, access: AccessControl) -> Option<VarDecl> {
        let keyword = self.bump();
        let mutability = if keyword.kind == TokenKind::Var {
            Mutability::Mut
        } else {
            Mutability::Const
        };
        let name = self.expect(TokenKind::Identifier, "variable name")?;
        let type_expr = if self.eat(TokenKind::Colon).is_some() {
            Some(self.parse_type_expr()?)
        } else {
            None
        };
        let init = if self.eat(TokenKind::Assign).is_some() {
            Some(self.parse_assignment_expr()?)
        } else {
            None
        };
        let end = self.expect(TokenKind::Semicolon, "';' after variable declaration")?;
        Some(VarDecl {
            name: name.lexeme,
            mutability,
            type_expr,
            init,
            access,
            is_static: false,
            range: keyword.range.join(end.range),
            entity: None,
        })
    }

    // ------------------------------------------------------------------
    // Statements
    // ------------------------------------------------------------------

    fn parse_compound(&mut self) -> Option<Stmt> {
        let open = self.expect(TokenKind::LBrace, "'{'")?;
        let mut stmts = Vec::new();
        while !self.at(TokenKind::RBrace) && !self.at(TokenKind::End) {
            match self.parse_stmt() {
                Some(stmt) => stmts.push(stmt),
                None => self.synchronize(),
            }
        }
        let close = self.expect(TokenKind::RBrace, "'}'")?;
        Some(Stmt::new(StmtKind::Compound(stmts), open.range.join(close.range)))
    }

    fn parse_stmt(&mut self) -> Option<Stmt> {
        match self.peek_kind() {
            TokenKind::LBrace => self.parse_compound(),
            TokenKind::Var | TokenKind::Let => {
                let decl = self.parse_var_decl(AccessControl::Public)?;
                let range = decl.range;
                Some(Stmt::new(StmtKind::Var(decl), range))
            }
            TokenKind::Return => {
                let keyword = self.bump();
                let expr = if self.at(TokenKind::Semicolon) {
                    None
                } else {
                    Some(self.parse_expr()?)
                };
                let end = self.expect(TokenKind::Semicolon, "';' after return")?;
                Some(Stmt::new(StmtKind::Return(expr), keyword.range.join(end.range)))
            }
            TokenKind::If => self.parse_if(),
            TokenKind::While => {
                let keyword = self.bump();
                let cond = self.parse_expr()?;
                let body = self.parse_compound()?;
                let range = keyword.range.join(body.range);
                Some(Stmt::new(
                    StmtKind::Loop {
                        kind: LoopKind::While,
                        init: None,
                        cond: Some(cond),
                        increment: None,
                        body: Box::new(body),
                    },
                    range,
                ))
            }
            TokenKind::For => self.parse_for(),
            TokenKind::Break | TokenKind::Continue => {
                let keyword = self.bump();
                let kind = if keyword.kind == TokenKind::Break {
                    JumpKind::Break
                } else {
                    JumpKind::Continue
                };
                let end = self.expect(TokenKind::Semicolon, "';'")?;
                Some(Stmt::new(StmtKind::Jump(kind), keyword.range.join(end.range)))
            }
            TokenKind::Semicolon => {
                let token = self.bump();
                Some(Stmt::new(StmtKind::Empty, token.range))
            }
            _ => {
                let expr = self.parse_expr()?;
                let end = self.expect(TokenKind::Semicolon, "';' after expression")?;
                let range = expr.range.join(end.range);
                Some(Stmt::new(StmtKind::Expr(expr), range))
            }
        }
    }

    fn parse_if(&mut self) -> Option<Stmt> {
        let keyword = self.bump();
        let cond = self.parse_expr()?;
        let then_branch = self.parse_compound()?;
        let else_branch = if self.eat(TokenKind::Else).is_some() {
            let stmt = if self.at(TokenKind::If) {
                self.parse_if()?
            } else {
                self.parse_compound()?
            };
            Some(Box::new(stmt))
        } else {
            None
        };
        let end = else_branch
            .as_deref()
            .map(|s| s.range)
            .unwrap_or(then_branch.range);
        Some(Stmt::new(
            StmtKind::If {
                cond,
                then_branch: Box::new(then_branch),
                else_branch,
            },
            keyword.range.join(end),
        ))
    }

    /// `for i = 0; i < n; ++i { ... }` — the induction variable is declared
    /// mutable with its type deduced from the initializer.
    fn parse_for(&mut self) -> Option<Stmt> {
        let keyword = self.bump();
        let name = self.expect(TokenKind::Identifier, "loop variable")?;
        self.expect(TokenKind::Assign, "'='")?;
        let init_expr = self.parse_assignment_expr()?;
        let decl_range = name.range.join(init_expr.range);
        self.expect(TokenKind::Semicolon, "';'")?;
        let cond = self.parse_expr()?;
        self.expect(TokenKind::Semicolon, "';'")?;
        let increment = self.parse_expr()?;
        let body = self.parse_compound()?;
        let range = keyword.range.join(body.range);
        let init = Stmt::new(
            StmtKind::Var(VarDecl {
                name: name.lexeme,
                mutability: Mutability::Mut,
                type_expr: None,
                init: Some(init_expr),
                access: AccessControl::Public,
                is_static: false,
                range: decl_range,
                entity: None,
            }),
            decl_range,
        );
        Some(Stmt::new(
            StmtKind::Loop {
                kind: LoopKind::For,
                init: Some(Box::new(init)),
                cond: Some(cond),
                increment: Some(increment),
                body: Box::new(body),
            },
            range,
        ))
    }

    // ------------------------------------------------------------------
    // Expressions
    // ------------------------------------------------------------------

    /// Type position uses the same grammar; the analyzer interprets list and
    /// pointer/reference nodes by context.
    fn parse_type_expr(&mut self) -> Option<Expr> {
        self.parse_prefix_expr()
    }

    fn parse_expr(&mut self) -> Option<Expr> {
        let mut lhs = self.parse_assignment_expr()?;
        while self.at(TokenKind::Comma) {
            self.bump();
            let rhs = self.parse_assignment_expr()?;
            let range = lhs.range.join(rhs.range);
            lhs = Expr::new(
                ExprKind::Binary {
                    op: BinaryOp::Comma,
                    lhs: Box::new(lhs),
                    rhs: Box::new(rhs),
                },
                range,
            );
        }
        Some(lhs)
    }

    fn parse_assignment_expr(&mut self) -> Option<Expr> {
        let lhs = self.parse_conditional_expr()?;
        let op = match self.peek_kind() {
            TokenKind::Assign => BinaryOp::Assign,
            TokenKind::PlusAssign => BinaryOp::AddAssign,
            TokenKind::MinusAssign => BinaryOp::SubAssign,
            TokenKind::StarAssign => BinaryOp::MulAssign,
            TokenKind::SlashAssign => BinaryOp::DivAssign,
            TokenKind::PercentAssign => BinaryOp::RemAssign,
            TokenKind::LShiftAssign => BinaryOp::LeftShiftAssign,
            TokenKind::RShiftAssign => BinaryOp::RightShiftAssign,
            TokenKind::AmpAssign => BinaryOp::AndAssign,
            TokenKind::PipeAssign => BinaryOp::OrAssign,
            TokenKind::CaretAssign => BinaryOp::XorAssign,
            _ => return Some(lhs),
        };
        self.bump();
        let rhs = self.parse_assignment_expr()?;
        let range = lhs.range.join(rhs.range);
        Some(Expr::new(
            ExprKind::Binary { op, lhs: Box::new(lhs), rhs: Box::new(rhs) },
            range,
        ))
    }

    fn parse_conditional_expr(&mut self) -> Option<Expr> {
        let cond = self.parse_binary_expr(0)?;
        if self.eat(TokenKind::Question).is_none() {
            return Some(cond);
        }
        let then_expr = self.parse_expr()?;
        self.expect(TokenKind::Colon, "':' in conditional")?;
        let else_expr = self.parse_conditional_expr()?;
        let range = cond.range.join(else_expr.range);
        Some(Expr::new(
            ExprKind::Conditional {
                cond: Box::new(cond),
                then_expr: Box::new(then_expr),
                else_expr: Box::new(else_expr),
                then_cleanups: CleanupStack::default(),
                else_cleanups: CleanupStack::default(),
            },
            range,
        ))
    }

    fn binary_op_at(&self, level: usize) -> Option<BinaryOp> {
        use BinaryOp::*;
        use TokenKind as T;
        let op = match (level, self.peek_kind()) {
            (0, T::PipePipe) => LogicalOr,
            (1, T::AmpAmp) => LogicalAnd,
            (2, T::Pipe) => BitOr,
            (3, T::Caret) => BitXor,
            (4, T::Amp) => BitAnd,
            (5, T::EqEq) => Equals,
            (5, T::NotEq) => NotEquals,
            (6, T::Less) => Less,
            (6, T::LessEq) => LessEq,
            (6, T::Greater) => Greater,
            (6, T::GreaterEq) => GreaterEq,
            (7, T::LShift) => LeftShift,
            (7, T::RShift) => RightShift,
            (8, T::Plus) => Add,
            (8, T::Minus) => Sub,
            (9, T::Star) => Mul,
            (9, T::Slash) => Div,
            (9, T::Percent) => Rem,
            _ => return None,
        };
        Some(op)
    }

    fn parse_binary_expr(&mut self, level: usize) -> Option<Expr> {
        const MAX_LEVEL: usize = 9;
        if level > MAX_LEVEL {
            return self.parse_cast_expr();
        }
        let mut lhs = self.parse_binary_expr(level + 1)?;
        while let Some(op) = self.binary_op_at(level) {
            self.bump();
            let rhs = self.parse_binary_expr(level + 1)?;
            let range = lhs.range.join(rhs.range);
            lhs = Expr::new(
                ExprKind::Binary { op, lhs: Box::new(lhs), rhs: Box::new(rhs) },
                range,
            );
        }
        Some(lhs)
    }

    fn parse_cast_expr(&mut self) -> Option<Expr> {
        let mut expr = self.parse_prefix_expr()?;
        while self.eat(TokenKind::As).is_some() {
            let target = self.parse_type_expr()?;
            let range = expr.range.join(target.range);
            expr = Expr::new(
                ExprKind::Cast {
                    kind: CastKind::Explicit,
                    operand: Box::new(expr),
                    target: Box::new(target),
                },
                range,
            );
        }
        Some(expr)
    }

    fn parse_prefix_expr(&mut self) -> Option<Expr> {
        let start = self.peek().range;
        let unary = |op| Some(op);
        let op = match self.peek_kind() {
            TokenKind::Plus => unary(UnaryOp::Promote),
            TokenKind::Minus => unary(UnaryOp::Negate),
            TokenKind::Tilde => unary(UnaryOp::BitwiseNot),
            TokenKind::Exclam => unary(UnaryOp::LogicalNot),
            TokenKind::PlusPlus => unary(UnaryOp::Increment),
            TokenKind::MinusMinus => unary(UnaryOp::Decrement),
            _ => None,
        };
        if let Some(op) = op {
            self.bump();
            let operand = self.parse_prefix_expr()?;
            let range = start.join(operand.range);
            return Some(Expr::new(
                ExprKind::Unary { op, prefix: true, operand: Box::new(operand) },
                range,
            ));
        }
        match self.peek_kind() {
            TokenKind::Star => {
                self.bump();
                let qual = if self.eat(TokenKind::Unique).is_some() {
                    PointerQual::Unique
                } else {
                    PointerQual::Raw
                };
                let mutability = if self.eat(TokenKind::Mut).is_some() {
                    Mutability::Mut
                } else {
                    Mutability::Const
                };
                let (operand, range) = if self.starts_operand() {
                    let operand = self.parse_prefix_expr()?;
                    let range = start.join(operand.range);
                    (Some(Box::new(operand)), range)
                } else {
                    (None, start)
                };
                Some(Expr::new(ExprKind::Deref { mutability, qual, operand }, range))
            }
            TokenKind::Amp => {
                self.bump();
                let mutability = if self.eat(TokenKind::Mut).is_some() {
                    Mutability::Mut
                } else {
                    Mutability::Const
                };
                let (operand, range) = if self.starts_operand() {
                    let operand = self.parse_prefix_expr()?;
                    let range = start.join(operand.range);
                    (Some(Box::new(operand)), range)
                } else {
                    (None, start)
                };
                Some(Expr::new(ExprKind::AddressOf { mutability, operand }, range))
            }
            TokenKind::Move => {
                self.bump();
                let operand = self.parse_prefix_expr()?;
                let range = start.join(operand.range);
                Some(Expr::new(ExprKind::Move(Box::new(operand)), range))
            }
            TokenKind::Unique => {
                self.bump();
                let operand = self.parse_prefix_expr()?;
                let range = start.join(operand.range);
                Some(Expr::new(ExprKind::Unique(Box::new(operand)), range))
            }
            _ => self.parse_postfix_expr(),
        }
    }

    /// Can the next token begin an operand? Used to distinguish `*T` from a
    /// trailing deduction qualifier like `let p: *mut = ...`.
    fn starts_operand(&self) -> bool {
        use TokenKind as T;
        matches!(
            self.peek_kind(),
            T::Identifier
                | T::IntLiteral
                | T::FloatLiteral
                | T::StringLiteral
                | T::CharLiteral
                | T::FStringBegin
                | T::True
                | T::False
                | T::Null
                | T::This
                | T::LParen
                | T::LBracket
                | T::Star
                | T::Amp
                | T::Move
                | T::Unique
                | T::Reinterpret
                | T::Plus
                | T::Minus
                | T::Tilde
                | T::Exclam
                | T::PlusPlus
                | T::MinusMinus
        )
    }

    fn parse_postfix_expr(&mut self) -> Option<Expr> {
        let mut expr = self.parse_primary_expr()?;
        loop {
            match self.peek_kind() {
                TokenKind::LParen => {
                    self.bump();
                    let mut args = Vec::new();
                    while !self.at(TokenKind::RParen) && !self.at(TokenKind::End) {
                        args.push(self.parse_assignment_expr()?);
                        if self.eat(TokenKind::Comma).is_none() {
                            break;
                        }
                    }
                    let close = self.expect(TokenKind::RParen, "')'")?;
                    let range = expr.range.join(close.range);
                    expr = Expr::new(
                        ExprKind::Call { callee: Box::new(expr), args },
                        range,
                    );
                }
                TokenKind::LBracket => {
                    self.bump();
                    let first = self.parse_assignment_expr()?;
                    if self.eat(TokenKind::Colon).is_some() {
                        let upper = self.parse_assignment_expr()?;
                        let close = self.expect(TokenKind::RBracket, "']'")?;
                        let range = expr.range.join(close.range);
                        expr = Expr::new(
                            ExprKind::SubscriptSlice {
                                object: Box::new(expr),
                                lower: Box::new(first),
                                upper: Box::new(upper),
                            },
                            range,
                        );
                    } else {
                        let close = self.expect(TokenKind::RBracket, "']'")?;
                        let range = expr.range.join(close.range);
                        expr = Expr::new(
                            ExprKind::Subscript {
                                object: Box::new(expr),
                                index: Box::new(first),
                            },
                            range,
                        );
                    }
                }
                TokenKind::Dot => {
                    self.bump();
                    // SMF names are accepted here so the analyzer can reject
                    // explicit calls with a proper diagnostic.
                    let member = match self.peek_kind() {
                        TokenKind::New | TokenKind::Move | TokenKind::Delete => self.bump(),
                        _ => self.expect(TokenKind::Identifier, "member name")?,
                    };
                    let member_expr =
                        Expr::new(ExprKind::Ident(member.lexeme), member.range);
                    let range = expr.range.join(member.range);
                    expr = Expr::new(
                        ExprKind::MemberAccess {
                            object: Box::new(expr),
                            member: Box::new(member_expr),
                        },
                        range,
                    );
                }
                TokenKind::PlusPlus | TokenKind::MinusMinus => {
                    let token = self.bump();
                    let op = if token.kind == TokenKind::PlusPlus {
                        UnaryOp::Increment
                    } else {
                        UnaryOp::Decrement
                    };
                    let range = expr.range.join(token.range);
                    expr = Expr::new(
                        ExprKind::Unary { op, prefix: false, operand: Box::new(expr) },
                        range,
                    );
                }
                _ => return Some(expr),
            }
        }
    }

    fn parse_primary_expr(&mut self) -> Option<Expr> {
        let token = self.peek().clone();
        match token.kind {
            TokenKind::IntLiteral => {
                self.bump();
                let text = token.lexeme.replace('_', "");
                let value = if let Some(hex) = text.strip_prefix("0x").or(text.strip_prefix("0X"))
                {
                    u64::from_str_radix(hex, 16)
                } else {
                    text.parse()
                };
                match value {
                    Ok(v) => Some(Expr::new(ExprKind::IntLit(v), token.range)),
                    Err(_) => {
                        self.issues.error(
                            token.range,
                            IssueKind::Syntax {
                                message: format!("integer literal '{}' out of range", token.lexeme),
                            },
                        );
                        None
                    }
                }
            }
            TokenKind::FloatLiteral => {
                self.bump();
                let value: f64 = token.lexeme.parse().ok()?;
                Some(Expr::new(ExprKind::FloatLit(value), token.range))
            }
            TokenKind::StringLiteral => {
                self.bump();
                Some(Expr::new(ExprKind::StringLit(token.lexeme), token.range))
            }
            TokenKind::CharLiteral => {
                self.bump();
                let byte = token.lexeme.bytes().next().unwrap_or(0);
                Some(Expr::new(ExprKind::CharLit(byte), token.range))
            }
            TokenKind::FStringBegin => self.parse_fstring(),
            TokenKind::True | TokenKind::False => {
                self.bump();
                Some(Expr::new(
                    ExprKind::BoolLit(token.kind == TokenKind::True),
                    token.range,
                ))
            }
            TokenKind::Null => {
                self.bump();
                Some(Expr::new(ExprKind::NullLit, token.range))
            }
            TokenKind::This => {
                self.bump();
                Some(Expr::new(ExprKind::This, token.range))
            }
            TokenKind::Identifier => {
                self.bump();
                Some(Expr::new(ExprKind::Ident(token.lexeme), token.range))
            }
            TokenKind::Reinterpret => {
                self.bump();
                self.expect(TokenKind::Less, "'<' after 'reinterpret'")?;
                let target = self.parse_type_expr()?;
                let close = self.expect(TokenKind::Greater, "'>'")?;
                Some(Expr::new(
                    ExprKind::Generic { name: "reinterpret".to_string(), args: vec![target] },
                    token.range.join(close.range),
                ))
            }
            TokenKind::LParen => {
                self.bump();
                let expr = self.parse_expr()?;
                self.expect(TokenKind::RParen, "')'")?;
                Some(expr)
            }
            TokenKind::LBracket => {
                self.bump();
                let mut elems = Vec::new();
                while !self.at(TokenKind::RBracket) && !self.at(TokenKind::End) {
                    elems.push(self.parse_assignment_expr()?);
                    if self.eat(TokenKind::Comma).is_none() {
                        break;
                    }
                }
                let close = self.expect(TokenKind::RBracket, "']'")?;
                Some(Expr::new(ExprKind::List(elems), token.range.join(close.range)))
            }
            _ => {
                self.error_here("expected an expression");
                None
            }
        }
    }

    fn parse_fstring(&mut self) -> Option<Expr> {
        let open = self.bump();
        debug_assert_eq!(open.kind, TokenKind::FStringBegin);
        let mut parts = Vec::new();
        if !open.lexeme.is_empty() {
            parts.push(FStringPart::Text(open.lexeme));
        }
        let mut range = open.range;
        loop {
            let operand = self.parse_expr()?;
            parts.push(FStringPart::Operand { expr: Box::new(operand), formatter: None });
            let token = self.bump();
            range = range.join(token.range);
            match token.kind {
                TokenKind::FStringContinue => {
                    if !token.lexeme.is_empty() {
                        parts.push(FStringPart::Text(token.lexeme));
                    }
                }
                TokenKind::FStringEnd => {
                    if !token.lexeme.is_empty() {
                        parts.push(FStringPart::Text(token.lexeme));
                    }
                    return Some(Expr::new(ExprKind::FString(parts), range));
                }
                _ => {
                    self.issues.error(
                        token.range,
                        IssueKind::Syntax {
                            message: "malformed format string".to_string(),
                        },
                    );
                    return None;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_ok(source: &str) -> SourceFile {
        let mut issues = IssueHandler::new();
        let file = parse_source(source, "test.sc", 0, &mut issues);
        assert!(!issues.has_errors(), "unexpected issues: {:?}", issues.iter().collect::<Vec<_>>());
        file
    }

    #[test]
    fn test_parse_function() {
        let file = parse_ok("fn main() -> int { return 2 * 3 + 1; }");
        assert_eq!(file.decls.len(), 1);
        let Decl::Function(def) = &file.decls[0] else { panic!("expected function") };
        assert_eq!(def.name, "main");
        assert!(def.return_type.is_some());
        assert!(def.body.is_some());
    }

    #[test]
    fn test_precedence() {
        let file = parse_ok("fn f() -> int { return 2 * 3 + 1; }");
        let Decl::Function(def) = &file.decls[0] else { panic!() };
        let StmtKind::Compound(stmts) = &def.body.as_ref().unwrap().kind else { panic!() };
        let StmtKind::Return(Some(expr)) = &stmts[0].kind else { panic!() };
        let ExprKind::Binary { op: BinaryOp::Add, lhs, .. } = &expr.kind else {
            panic!("expected + at top: {:?}", expr.kind)
        };
        assert!(matches!(lhs.kind, ExprKind::Binary { op: BinaryOp::Mul, .. }));
    }

    #[test]
    fn test_parse_struct_with_members() {
        let file = parse_ok("struct P { var x: int; var y: int; fn len(&this) -> double { return 0.0; } }");
        let Decl::Record(def) = &file.decls[0] else { panic!() };
        assert_eq!(def.kind, RecordKind::Struct);
        assert_eq!(def.members.len(), 3);
        let Decl::Function(f) = &def.members[2] else { panic!() };
        assert!(f.params[0].this.is_some());
    }

    #[test]
    fn test_parse_base_classes() {
        let file = parse_ok("struct D: Base1, Base2 {}");
        let Decl::Record(def) = &file.decls[0] else { panic!() };
        assert_eq!(def.bases.len(), 2);
    }

    #[test]
    fn test_parse_pointer_types() {
        let file = parse_ok("fn f(p: *mut int, q: &int, r: *unique int) -> void {}");
        let Decl::Function(def) = &file.decls[0] else { panic!() };
        let ty0 = def.params[0].type_expr.as_ref().unwrap();
        assert!(matches!(
            ty0.kind,
            ExprKind::Deref { mutability: Mutability::Mut, qual: PointerQual::Raw, .. }
        ));
        let ty1 = def.params[1].type_expr.as_ref().unwrap();
        assert!(matches!(ty1.kind, ExprKind::AddressOf { .. }));
        let ty2 = def.params[2].type_expr.as_ref().unwrap();
        assert!(matches!(
            ty2.kind,
            ExprKind::Deref { qual: PointerQual::Unique, .. }
        ));
    }

    #[test]
    fn test_deduction_qualifier_has_no_operand() {
        let file = parse_ok("fn f() { let p: *mut = x; }");
        let Decl::Function(def) = &file.decls[0] else { panic!() };
        let StmtKind::Compound(stmts) = &def.body.as_ref().unwrap().kind else { panic!() };
        let StmtKind::Var(decl) = &stmts[0].kind else { panic!() };
        assert!(matches!(
            decl.type_expr.as_ref().unwrap().kind,
            ExprKind::Deref { operand: None, mutability: Mutability::Mut, .. }
        ));
    }

    #[test]
    fn test_parse_extern_function() {
        let file = parse_ok("extern \"C\" fn puts(s: *str) -> void;");
        let Decl::Function(def) = &file.decls[0] else { panic!() };
        assert!(def.extern_c);
        assert!(def.body.is_none());
    }

    #[test]
    fn test_parse_imports() {
        let file = parse_ok("import math.vec; use util; import \"libgfx\";");
        assert_eq!(file.decls.len(), 3);
        let Decl::Import(first) = &file.decls[0] else { panic!() };
        assert!(first.scoped);
        let ImportTarget::Native { path } = &first.target else { panic!() };
        assert_eq!(path, &["math", "vec"]);
        let Decl::Import(third) = &file.decls[2] else { panic!() };
        assert!(matches!(&third.target, ImportTarget::Foreign { name } if name == "libgfx"));
    }

    #[test]
    fn test_parse_control_flow() {
        let file = parse_ok(
            "fn f(n: int) -> int { \
                var acc = 0; \
                for i = 0; i < n; ++i { \
                    if i % 2 == 0 { acc += i; } else { continue; } \
                } \
                while acc > 100 { acc /= 2; break; } \
                return acc; \
            }",
        );
        let Decl::Function(def) = &file.decls[0] else { panic!() };
        let StmtKind::Compound(stmts) = &def.body.as_ref().unwrap().kind else { panic!() };
        assert_eq!(stmts.len(), 4);
        assert!(matches!(
            stmts[1].kind,
            StmtKind::Loop { kind: LoopKind::For, .. }
        ));
        assert!(matches!(
            stmts[2].kind,
            StmtKind::Loop { kind: LoopKind::While, init: None, .. }
        ));
    }

    #[test]
    fn test_parse_conditional_and_cast() {
        let file = parse_ok("fn f(x: int) -> double { return (x > 0 ? x : -x) as double; }");
        let Decl::Function(def) = &file.decls[0] else { panic!() };
        let StmtKind::Compound(stmts) = &def.body.as_ref().unwrap().kind else { panic!() };
        let StmtKind::Return(Some(expr)) = &stmts[0].kind else { panic!() };
        assert!(matches!(expr.kind, ExprKind::Cast { .. }));
    }

    #[test]
    fn test_parse_member_call_chain() {
        let file = parse_ok("fn f() { a.b(1).c[2] = unique X(3); }");
        assert_eq!(file.decls.len(), 1);
    }

    #[test]
    fn test_parse_reinterpret() {
        let file = parse_ok("fn f(p: *int) { let q = reinterpret<*byte>(p); }");
        let Decl::Function(def) = &file.decls[0] else { panic!() };
        let StmtKind::Compound(stmts) = &def.body.as_ref().unwrap().kind else { panic!() };
        let StmtKind::Var(decl) = &stmts[0].kind else { panic!() };
        let ExprKind::Call { callee, .. } = &decl.init.as_ref().unwrap().kind else { panic!() };
        assert!(matches!(callee.kind, ExprKind::Generic { .. }));
    }

    #[test]
    fn test_parse_fstring_expr() {
        let file = parse_ok("fn f(n: int) { let s = \"n = \\(n)!\"; }");
        let Decl::Function(def) = &file.decls[0] else { panic!() };
        let StmtKind::Compound(stmts) = &def.body.as_ref().unwrap().kind else { panic!() };
        let StmtKind::Var(decl) = &stmts[0].kind else { panic!() };
        let ExprKind::FString(parts) = &decl.init.as_ref().unwrap().kind else { panic!() };
        assert_eq!(parts.len(), 3);
    }

    #[test]
    fn test_smf_names_parse() {
        let file = parse_ok(
            "struct S { fn new(&mut this) {} fn move(&mut this, rhs: &mut S) {} fn delete(&mut this) {} }",
        );
        let Decl::Record(def) = &file.decls[0] else { panic!() };
        let names: Vec<_> = def
            .members
            .iter()
            .filter_map(|d| match d {
                Decl::Function(f) => Some(f.name.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(names, vec!["new", "move", "delete"]);
    }

    #[test]
    fn test_recovery_reports_and_continues() {
        let mut issues = IssueHandler::new();
        let file = parse_source("fn f() { let = ; } fn g() {}", "test.sc", 0, &mut issues);
        assert!(issues.has_errors());
        // g still parses.
        assert!(file
            .decls
            .iter()
            .any(|d| matches!(d, Decl::Function(f) if f.name == "g")));
    }
}
