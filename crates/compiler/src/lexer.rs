//! Lexer: source text to token stream.
//!
//! Hand-written scanner. Format strings are tokenized as a sequence of
//! `FStringBegin` / `FStringContinue` / `FStringEnd` text fragments with the
//! interpolated expressions lexed as ordinary tokens between them.

use crate::source::SourceRange;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    Identifier,
    IntLiteral,
    FloatLiteral,
    StringLiteral,
    CharLiteral,
    /// `"text \(` — opening fragment of a format string.
    FStringBegin,
    /// `) text \(` — fragment between two interpolations.
    FStringContinue,
    /// `) text"` — closing fragment.
    FStringEnd,

    // Keywords
    Fn,
    Struct,
    Protocol,
    Var,
    Let,
    Return,
    If,
    Else,
    While,
    For,
    Break,
    Continue,
    Import,
    Use,
    Extern,
    Public,
    Private,
    Mut,
    Unique,
    Move,
    New,
    Delete,
    This,
    True,
    False,
    Null,
    As,
    Reinterpret,

    // Punctuation and operators
    LParen,
    RParen,
    LBrace,
    RBrace,
    LBracket,
    RBracket,
    Comma,
    Semicolon,
    Colon,
    Dot,
    Arrow,
    Question,
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Amp,
    Pipe,
    Caret,
    Tilde,
    Exclam,
    LShift,
    RShift,
    AmpAmp,
    PipePipe,
    Less,
    LessEq,
    Greater,
    GreaterEq,
    EqEq,
    NotEq,
    Assign,
    PlusAssign,
    MinusAssign,
    StarAssign,
    SlashAssign,
    PercentAssign,
    LShiftAssign,
    RShiftAssign,
    AmpAssign,
    PipeAssign,
    CaretAssign,
    PlusPlus,
    MinusMinus,

    End,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    /// Identifier spelling, string/char payload with escapes resolved, or the
    /// literal digits.
    pub lexeme: String,
    pub range: SourceRange,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LexError {
    pub message: String,
    pub range: SourceRange,
}

impl std::fmt::Display for LexError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.range, self.message)
    }
}

impl std::error::Error for LexError {}

fn keyword(ident: &str) -> Option<TokenKind> {
    use TokenKind::*;
    Some(match ident {
        "fn" => Fn,
        "struct" => Struct,
        "protocol" => Protocol,
        "var" => Var,
        "let" => Let,
        "return" => Return,
        "if" => If,
        "else" => Else,
        "while" => While,
        "for" => For,
        "break" => Break,
        "continue" => Continue,
        "import" => Import,
        "use" => Use,
        "extern" => Extern,
        "public" => Public,
        "private" => Private,
        "mut" => Mut,
        "unique" => Unique,
        "move" => Move,
        "new" => New,
        "delete" => Delete,
        "this" => This,
        "true" => True,
        "false" => False,
        "null" => Null,
        "as" => As,
        "reinterpret" => Reinterpret,
        _ => return None,
    })
}

pub struct Lexer<'a> {
    source: &'a [u8],
    file: u32,
    pos: usize,
    line: u32,
    column: u32,
    /// Nesting of unfinished format strings; the lexer returns to string
    /// scanning when an interpolation's parentheses close.
    fstring_depth: Vec<u32>,
}

impl<'a> Lexer<'a> {
    pub fn new(source: &'a str, file: u32) -> Self {
        Lexer {
            source: source.as_bytes(),
            file,
            pos: 0,
            line: 0,
            column: 0,
            fstring_depth: Vec::new(),
        }
    }

    /// Lex the whole input. Stops at the first malformed token.
    pub fn lex(mut self) -> Result<Vec<Token>, LexError> {
        let mut tokens = Vec::new();
        loop {
            let token = self.next_token()?;
            let done = token.kind == TokenKind::End;
            tokens.push(token);
            if done {
                return Ok(tokens);
            }
        }
    }

    fn peek(&self) -> Option<u8> {
        self.source.get(self.pos).copied()
    }

    fn peek2(&self) -> Option<u8> {
        self.source.get(self.pos + 1).copied()
    }

    fn bump(&mut self) -> Option<u8> {
        let c = self.peek()?;
        self.pos += 1;
        if c == b'\n' {
            self.line += 1;
            self.column = 0;
        } else {
            self.column += 1;
        }
        Some(c)
    }

    fn range_from(&self, start: (usize, u32, u32)) -> SourceRange {
        SourceRange::new(
            self.file,
            start.0 as u32,
            (self.pos - start.0) as u32,
            start.1,
            start.2,
        )
    }

    fn mark(&self) -> (usize, u32, u32) {
        (self.pos, self.line, self.column)
    }

    fn skip_trivia(&mut self) {
        loop {
            match self.peek() {
                Some(c) if c.is_ascii_whitespace() => {
                    self.bump();
                }
                Some(b'/') if self.peek2() == Some(b'/') => {
                    while let Some(c) = self.peek() {
                        if c == b'\n' {
                            break;
                        }
                        self.bump();
                    }
                }
                Some(b'/') if self.peek2() == Some(b'*') => {
                    self.bump();
                    self.bump();
                    let mut depth = 1;
                    while depth > 0 {
                        match (self.bump(), self.peek()) {
                            (Some(b'*'), Some(b'/')) => {
                                self.bump();
                                depth -= 1;
                            }
                            (Some(b'/'), Some(b'*')) => {
                                self.bump();
                                depth += 1;
                            }
                            (None, _) => return,
                            _ => {}
                        }
                    }
                }
                _ => return,
            }
        }
    }

    fn next_token(&mut self) -> Result<Token, LexError> {
        self.skip_trivia();
        let start = self.mark();
        let Some(c) = self.peek() else {
            return Ok(Token {
                kind: TokenKind::End,
                lexeme: String::new(),
                range: self.range_from(start),
            });
        };
        if c.is_ascii_alphabetic() || c == b'_' {
            return Ok(self.lex_word(start));
        }
        if c.is_ascii_digit() {
            return self.lex_number(start);
        }
        if c == b'"' {
            self.bump();
            return self.lex_string_fragment(start, true);
        }
        if c == b'\'' {
            return self.lex_char(start);
        }
        self.lex_operator(start)
    }

    fn lex_word(&mut self, start: (usize, u32, u32)) -> Token {
        while matches!(self.peek(), Some(c) if c.is_ascii_alphanumeric() || c == b'_') {
            self.bump();
        }
        let text = std::str::from_utf8(&self.source[start.0..self.pos])
            .expect("identifier bytes are ASCII")
            .to_string();
        let kind = keyword(&text).unwrap_or(TokenKind::Identifier);
        Token { kind, lexeme: text, range: self.range_from(start) }
    }

    fn lex_number(&mut self, start: (usize, u32, u32)) -> Result<Token, LexError> {
        if self.peek() == Some(b'0') && matches!(self.peek2(), Some(b'x') | Some(b'X')) {
            self.bump();
            self.bump();
            let digits_start = self.pos;
            while matches!(self.peek(), Some(c) if c.is_ascii_hexdigit()) {
                self.bump();
            }
            if self.pos == digits_start {
                return Err(LexError {
                    message: "expected hexadecimal digits after 0x".to_string(),
                    range: self.range_from(start),
                });
            }
            let text = std::str::from_utf8(&self.source[start.0..self.pos]).unwrap();
            return Ok(Token {
                kind: TokenKind::IntLiteral,
                lexeme: text.to_string(),
                range: self.range_from(start),
            });
        }
        while matches!(self.peek(), Some(c) if c.is_ascii_digit()) {
            self.bump();
        }
        let mut is_float = false;
        if self.peek() == Some(b'.') && matches!(self.peek2(), Some(c) if c.is_ascii_digit()) {
            is_float = true;
            self.bump();
            while matches!(self.peek(), Some(c) if c.is_ascii_digit()) {
                self.bump();
            }
        }
        if matches!(self.peek(), Some(b'e') | Some(b'E')) {
            let mut lookahead = self.pos + 1;
            if matches!(self.source.get(lookahead), Some(b'+') | Some(b'-')) {
                lookahead += 1;
            }
            if matches!(self.source.get(lookahead), Some(c) if c.is_ascii_digit()) {
                is_float = true;
                self.bump();
                if matches!(self.peek(), Some(b'+') | Some(b'-')) {
                    self.bump();
                }
                while matches!(self.peek(), Some(c) if c.is_ascii_digit()) {
                    self.bump();
                }
            }
        }
        let text = std::str::from_utf8(&self.source[start.0..self.pos]).unwrap();
        Ok(Token {
            kind: if is_float { TokenKind::FloatLiteral } else { TokenKind::IntLiteral },
            lexeme: text.to_string(),
            range: self.range_from(start),
        })
    }

    fn lex_escape(&mut self, start: (usize, u32, u32)) -> Result<u8, LexError> {
        match self.bump() {
            Some(b'n') => Ok(b'\n'),
            Some(b't') => Ok(b'\t'),
            Some(b'r') => Ok(b'\r'),
            Some(b'0') => Ok(0),
            Some(b'\\') => Ok(b'\\'),
            Some(b'"') => Ok(b'"'),
            Some(b'\'') => Ok(b'\''),
            other => Err(LexError {
                message: match other {
                    Some(c) => format!("invalid escape sequence '\\{}'", c as char),
                    None => "unterminated escape sequence".to_string(),
                },
                range: self.range_from(start),
            }),
        }
    }

    /// Scan string content after an opening quote or a closed interpolation.
    /// `opening` distinguishes `"..."`/`"...\(`  from  `)..."`/`)...\(`.
    fn lex_string_fragment(
        &mut self,
        start: (usize, u32, u32),
        opening: bool,
    ) -> Result<Token, LexError> {
        let mut text = String::new();
        loop {
            match self.bump() {
                Some(b'"') => {
                    let kind = if opening {
                        TokenKind::StringLiteral
                    } else {
                        TokenKind::FStringEnd
                    };
                    return Ok(Token { kind, lexeme: text, range: self.range_from(start) });
                }
                Some(b'\\') if self.peek() == Some(b'(') => {
                    self.bump();
                    // Track parenthesis depth of the interpolation so its
                    // closing `)` returns to string scanning.
                    self.fstring_depth.push(0);
                    let kind = if opening {
                        TokenKind::FStringBegin
                    } else {
                        TokenKind::FStringContinue
                    };
                    return Ok(Token { kind, lexeme: text, range: self.range_from(start) });
                }
                Some(b'\\') => text.push(self.lex_escape(start)? as char),
                Some(b'\n') | None => {
                    return Err(LexError {
                        message: "unterminated string literal".to_string(),
                        range: self.range_from(start),
                    })
                }
                Some(c) => text.push(c as char),
            }
        }
    }

    fn lex_char(&mut self, start: (usize, u32, u32)) -> Result<Token, LexError> {
        self.bump();
        let value = match self.bump() {
            Some(b'\\') => self.lex_escape(start)?,
            Some(b'\'') | None => {
                return Err(LexError {
                    message: "empty character literal".to_string(),
                    range: self.range_from(start),
                })
            }
            Some(c) => c,
        };
        if self.bump() != Some(b'\'') {
            return Err(LexError {
                message: "unterminated character literal".to_string(),
                range: self.range_from(start),
            });
        }
        Ok(Token {
            kind: TokenKind::CharLiteral,
            lexeme: (value as char).to_string(),
            range: self.range_from(start),
        })
    }

    fn lex_operator(&mut self, start: (usize, u32, u32)) -> Result<Token, LexError> {
        use TokenKind::*;
        let c = self.bump().unwrap();
        let two = |lexer: &mut Self, next: u8, yes: TokenKind, no: TokenKind| {
            if lexer.peek() == Some(next) {
                lexer.bump();
                yes
            } else {
                no
            }
        };
        let kind = match c {
            b'(' => {
                if let Some(depth) = self.fstring_depth.last_mut() {
                    *depth += 1;
                }
                LParen
            }
            b')' => {
                match self.fstring_depth.last_mut() {
                    Some(0) => {
                        // This parenthesis closes an interpolation; resume
                        // scanning the surrounding format string.
                        self.fstring_depth.pop();
                        return self.lex_string_fragment(start, false);
                    }
                    Some(depth) => {
                        *depth -= 1;
                        RParen
                    }
                    None => RParen,
                }
            }
            b'{' => LBrace,
            b'}' => RBrace,
            b'[' => LBracket,
            b']' => RBracket,
            b',' => Comma,
            b';' => Semicolon,
            b':' => Colon,
            b'.' => Dot,
            b'?' => Question,
            b'~' => Tilde,
            b'+' => match self.peek() {
                Some(b'+') => {
                    self.bump();
                    PlusPlus
                }
                Some(b'=') => {
                    self.bump();
                    PlusAssign
                }
                _ => Plus,
            },
            b'-' => match self.peek() {
                Some(b'-') => {
                    self.bump();
                    MinusMinus
                }
                Some(b'=') => {
                    self.bump();
                    MinusAssign
                }
                Some(b'>') => {
                    self.bump();
                    Arrow
                }
                _ => Minus,
            },
            b'*' => two(self, b'=', StarAssign, Star),
            b'/' => two(self, b'=', SlashAssign, Slash),
            b'%' => two(self, b'=', PercentAssign, Percent),
            b'^' => two(self, b'=', CaretAssign, Caret),
            b'!' => two(self, b'=', NotEq, Exclam),
            b'=' => two(self, b'=', EqEq, Assign),
            b'&' => match self.peek() {
                Some(b'&') => {
                    self.bump();
                    AmpAmp
                }
                Some(b'=') => {
                    self.bump();
                    AmpAssign
                }
                _ => Amp,
            },
            b'|' => match self.peek() {
                Some(b'|') => {
                    self.bump();
                    PipePipe
                }
                Some(b'=') => {
                    self.bump();
                    PipeAssign
                }
                _ => Pipe,
            },
            b'<' => match self.peek() {
                Some(b'<') => {
                    self.bump();
                    two(self, b'=', LShiftAssign, LShift)
                }
                Some(b'=') => {
                    self.bump();
                    LessEq
                }
                _ => Less,
            },
            b'>' => match self.peek() {
                Some(b'>') => {
                    self.bump();
                    two(self, b'=', RShiftAssign, RShift)
                }
                Some(b'=') => {
                    self.bump();
                    GreaterEq
                }
                _ => Greater,
            },
            other => {
                return Err(LexError {
                    message: format!("unexpected character '{}'", other as char),
                    range: self.range_from(start),
                })
            }
        };
        Ok(Token {
            kind,
            lexeme: String::from_utf8_lossy(&self.source[start.0..self.pos]).into_owned(),
            range: self.range_from(start),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(source: &str) -> Vec<TokenKind> {
        Lexer::new(source, 0)
            .lex()
            .unwrap()
            .into_iter()
            .map(|t| t.kind)
            .collect()
    }

    #[test]
    fn test_keywords_and_identifiers() {
        use TokenKind::*;
        assert_eq!(
            kinds("fn main struct x_1"),
            vec![Fn, Identifier, Struct, Identifier, End]
        );
    }

    #[test]
    fn test_numbers() {
        use TokenKind::*;
        assert_eq!(
            kinds("0 42 0xFF 3.25 1e9 7.5e-2"),
            vec![
                IntLiteral,
                IntLiteral,
                IntLiteral,
                FloatLiteral,
                FloatLiteral,
                FloatLiteral,
                End
            ]
        );
    }

    #[test]
    fn test_member_access_is_not_a_float() {
        use TokenKind::*;
        assert_eq!(kinds("x.y"), vec![Identifier, Dot, Identifier, End]);
    }

    #[test]
    fn test_operators() {
        use TokenKind::*;
        assert_eq!(
            kinds("a += b << 2 && !c"),
            vec![
                Identifier, PlusAssign, Identifier, LShift, IntLiteral, AmpAmp, Exclam,
                Identifier, End
            ]
        );
    }

    #[test]
    fn test_string_escapes() {
        let tokens = Lexer::new(r#""a\nb""#, 0).lex().unwrap();
        assert_eq!(tokens[0].kind, TokenKind::StringLiteral);
        assert_eq!(tokens[0].lexeme, "a\nb");
    }

    #[test]
    fn test_char_literal() {
        let tokens = Lexer::new(r"'x'", 0).lex().unwrap();
        assert_eq!(tokens[0].kind, TokenKind::CharLiteral);
        assert_eq!(tokens[0].lexeme, "x");
    }

    #[test]
    fn test_fstring_fragments() {
        use TokenKind::*;
        let tokens = Lexer::new(r#""n = \(n), m = \(m())!""#, 0).lex().unwrap();
        let kinds: Vec<_> = tokens.iter().map(|t| t.kind).collect();
        assert_eq!(
            kinds,
            vec![
                FStringBegin,
                Identifier,
                FStringContinue,
                Identifier,
                LParen,
                RParen,
                FStringEnd,
                End
            ]
        );
        assert_eq!(tokens[0].lexeme, "n = ");
        assert_eq!(tokens[2].lexeme, ", m = ");
        assert_eq!(tokens[6].lexeme, "!");
    }

    #[test]
    fn test_comments_are_trivia() {
        use TokenKind::*;
        assert_eq!(
            kinds("a // line\n/* block /* nested */ */ b"),
            vec![Identifier, Identifier, End]
        );
    }

    #[test]
    fn test_unterminated_string_is_an_error() {
        assert!(Lexer::new("\"abc", 0).lex().is_err());
    }
}
