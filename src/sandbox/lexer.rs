//! Tokenizer for the scripting surface.
//!
//! Indentation-structured: the lexer emits `Indent`/`Dedent` tokens from
//! leading whitespace, suppresses newlines inside brackets, and strips
//! comments. `import` is recognized as a keyword so the parser can reject
//! it by name.

use super::error::{SandboxError, SandboxResult};

#[derive(Debug, Clone, PartialEq)]
pub enum Tok {
    Ident(String),
    Int(i64),
    Float(f64),
    Str(String),
    FString(Vec<RawFPart>),
    Kw(Kw),
    Op(Op),
    Newline,
    Indent,
    Dedent,
    Eof,
}

/// Raw f-string segment; embedded expressions are parsed later.
#[derive(Debug, Clone, PartialEq)]
pub enum RawFPart {
    Text(String),
    Expr(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kw {
    If,
    Elif,
    Else,
    For,
    While,
    In,
    Def,
    Return,
    Break,
    Continue,
    Pass,
    And,
    Or,
    Not,
    True,
    False,
    None,
    Import,
    From,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Plus,
    Minus,
    Star,
    Slash,
    DoubleSlash,
    Percent,
    EqEq,
    NotEq,
    Lt,
    Le,
    Gt,
    Ge,
    Assign,
    PlusAssign,
    MinusAssign,
    StarAssign,
    SlashAssign,
    LParen,
    RParen,
    LBracket,
    RBracket,
    LBrace,
    RBrace,
    Comma,
    Colon,
    Dot,
    Semicolon,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub tok: Tok,
    pub line: usize,
}

fn keyword(ident: &str) -> Option<Kw> {
    Some(match ident {
        "if" => Kw::If,
        "elif" => Kw::Elif,
        "else" => Kw::Else,
        "for" => Kw::For,
        "while" => Kw::While,
        "in" => Kw::In,
        "def" => Kw::Def,
        "return" => Kw::Return,
        "break" => Kw::Break,
        "continue" => Kw::Continue,
        "pass" => Kw::Pass,
        "and" => Kw::And,
        "or" => Kw::Or,
        "not" => Kw::Not,
        "True" => Kw::True,
        "False" => Kw::False,
        "None" => Kw::None,
        "import" => Kw::Import,
        "from" => Kw::From,
        _ => return None,
    })
}

pub struct Lexer {
    chars: Vec<char>,
    pos: usize,
    line: usize,
    bracket_depth: usize,
    indents: Vec<usize>,
    tokens: Vec<Token>,
    at_line_start: bool,
}

impl Lexer {
    pub fn tokenize(source: &str) -> SandboxResult<Vec<Token>> {
        let mut lexer = Lexer {
            chars: source.chars().collect(),
            pos: 0,
            line: 1,
            bracket_depth: 0,
            indents: vec![0],
            tokens: Vec::new(),
            at_line_start: true,
        };
        lexer.run()?;
        Ok(lexer.tokens)
    }

    fn err(&self, message: impl Into<String>) -> SandboxError {
        SandboxError::Syntax {
            line: self.line,
            message: message.into(),
        }
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn peek_at(&self, offset: usize) -> Option<char> {
        self.chars.get(self.pos + offset).copied()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += 1;
        if c == '\n' {
            self.line += 1;
        }
        Some(c)
    }

    fn push(&mut self, tok: Tok) {
        self.tokens.push(Token {
            tok,
            line: self.line,
        });
    }

    fn run(&mut self) -> SandboxResult<()> {
        loop {
            if self.at_line_start && self.bracket_depth == 0 {
                if !self.handle_line_start()? {
                    break;
                }
            }
            match self.peek() {
                None => break,
                Some('\n') => {
                    self.bump();
                    if self.bracket_depth == 0 {
                        self.push(Tok::Newline);
                        self.at_line_start = true;
                    }
                }
                Some('#') => {
                    while let Some(c) = self.peek() {
                        if c == '\n' {
                            break;
                        }
                        self.bump();
                    }
                }
                Some(c) if c == ' ' || c == '\t' || c == '\r' => {
                    self.bump();
                }
                Some(_) => self.lex_token()?,
            }
        }
        // Close the final line and any open blocks.
        if !matches!(self.tokens.last().map(|t| &t.tok), Some(Tok::Newline) | None) {
            self.push(Tok::Newline);
        }
        while self.indents.len() > 1 {
            self.indents.pop();
            self.push(Tok::Dedent);
        }
        self.push(Tok::Eof);
        Ok(())
    }

    /// Measure leading whitespace and emit indent/dedent tokens. Returns
    /// false at end of input.
    fn handle_line_start(&mut self) -> SandboxResult<bool> {
        loop {
            let mut width = 0usize;
            loop {
                match self.peek() {
                    Some(' ') => {
                        width += 1;
                        self.bump();
                    }
                    Some('\t') => {
                        width += 4;
                        self.bump();
                    }
                    Some('\r') => {
                        self.bump();
                    }
                    _ => break,
                }
            }
            match self.peek() {
                None => return Ok(false),
                // Blank and comment-only lines do not affect indentation.
                Some('\n') => {
                    self.bump();
                    continue;
                }
                Some('#') => {
                    while let Some(c) = self.peek() {
                        if c == '\n' {
                            break;
                        }
                        self.bump();
                    }
                    continue;
                }
                Some(_) => {
                    let current = *self.indents.last().unwrap();
                    if width > current {
                        self.indents.push(width);
                        self.push(Tok::Indent);
                    } else if width < current {
                        while width < *self.indents.last().unwrap() {
                            self.indents.pop();
                            self.push(Tok::Dedent);
                        }
                        if width != *self.indents.last().unwrap() {
                            return Err(self.err("inconsistent indentation"));
                        }
                    }
                    self.at_line_start = false;
                    return Ok(true);
                }
            }
        }
    }

    fn lex_token(&mut self) -> SandboxResult<()> {
        let c = self.peek().ok_or_else(|| self.err("unexpected end of input"))?;
        if c.is_ascii_digit() {
            return self.lex_number();
        }
        if c == '"' || c == '\'' {
            let text = self.lex_string_body(c)?;
            self.push(Tok::Str(text));
            return Ok(());
        }
        if (c == 'f' || c == 'F') && matches!(self.peek_at(1), Some('"') | Some('\'')) {
            self.bump();
            let quote = self.peek().unwrap();
            return self.lex_fstring(quote);
        }
        if c.is_alphabetic() || c == '_' {
            let mut ident = String::new();
            while let Some(c) = self.peek() {
                if c.is_alphanumeric() || c == '_' {
                    ident.push(c);
                    self.bump();
                } else {
                    break;
                }
            }
            match keyword(&ident) {
                Some(kw) => self.push(Tok::Kw(kw)),
                None => self.push(Tok::Ident(ident)),
            }
            return Ok(());
        }
        self.lex_operator()
    }

    fn lex_number(&mut self) -> SandboxResult<()> {
        let mut text = String::new();
        let mut is_float = false;
        while let Some(c) = self.peek() {
            if c.is_ascii_digit() || c == '_' {
                if c != '_' {
                    text.push(c);
                }
                self.bump();
            } else if c == '.' && !is_float && matches!(self.peek_at(1), Some(d) if d.is_ascii_digit())
            {
                is_float = true;
                text.push(c);
                self.bump();
            } else if (c == 'e' || c == 'E')
                && matches!(self.peek_at(1), Some(d) if d.is_ascii_digit() || d == '+' || d == '-')
            {
                is_float = true;
                text.push(c);
                self.bump();
                if let Some(sign) = self.peek() {
                    if sign == '+' || sign == '-' {
                        text.push(sign);
                        self.bump();
                    }
                }
            } else {
                break;
            }
        }
        if is_float {
            let value: f64 = text
                .parse()
                .map_err(|_| self.err(format!("invalid number literal: {}", text)))?;
            self.push(Tok::Float(value));
        } else {
            let value: i64 = text
                .parse()
                .map_err(|_| self.err(format!("integer literal out of range: {}", text)))?;
            self.push(Tok::Int(value));
        }
        Ok(())
    }

    /// Lex a quoted string starting at the opening quote; returns the
    /// unescaped body.
    fn lex_string_body(&mut self, quote: char) -> SandboxResult<String> {
        self.bump();
        let mut text = String::new();
        loop {
            match self.bump() {
                None => return Err(self.err("unterminated string literal")),
                Some('\n') => return Err(self.err("unterminated string literal")),
                Some('\\') => {
                    let escaped = self
                        .bump()
                        .ok_or_else(|| self.err("unterminated string literal"))?;
                    text.push(match escaped {
                        'n' => '\n',
                        't' => '\t',
                        'r' => '\r',
                        '\\' => '\\',
                        '\'' => '\'',
                        '"' => '"',
                        '0' => '\0',
                        other => other,
                    });
                }
                Some(c) if c == quote => return Ok(text),
                Some(c) => text.push(c),
            }
        }
    }

    fn lex_fstring(&mut self, quote: char) -> SandboxResult<()> {
        self.bump();
        let mut parts = Vec::new();
        let mut text = String::new();
        loop {
            match self.bump() {
                None | Some('\n') => return Err(self.err("unterminated f-string literal")),
                Some('\\') => {
                    let escaped = self
                        .bump()
                        .ok_or_else(|| self.err("unterminated f-string literal"))?;
                    text.push(match escaped {
                        'n' => '\n',
                        't' => '\t',
                        'r' => '\r',
                        '\\' => '\\',
                        '\'' => '\'',
                        '"' => '"',
                        other => other,
                    });
                }
                Some('{') => {
                    if self.peek() == Some('{') {
                        self.bump();
                        text.push('{');
                        continue;
                    }
                    if !text.is_empty() {
                        parts.push(RawFPart::Text(std::mem::take(&mut text)));
                    }
                    let mut expr = String::new();
                    let mut depth = 0usize;
                    loop {
                        match self.bump() {
                            None | Some('\n') => {
                                return Err(self.err("unterminated expression in f-string"))
                            }
                            Some('{') => {
                                depth += 1;
                                expr.push('{');
                            }
                            Some('}') if depth == 0 => break,
                            Some('}') => {
                                depth -= 1;
                                expr.push('}');
                            }
                            Some(c) => expr.push(c),
                        }
                    }
                    if expr.trim().is_empty() {
                        return Err(self.err("empty expression in f-string"));
                    }
                    parts.push(RawFPart::Expr(expr));
                }
                Some('}') => {
                    if self.peek() == Some('}') {
                        self.bump();
                        text.push('}');
                        continue;
                    }
                    return Err(self.err("single '}' in f-string"));
                }
                Some(c) if c == quote => break,
                Some(c) => text.push(c),
            }
        }
        if !text.is_empty() {
            parts.push(RawFPart::Text(text));
        }
        self.push(Tok::FString(parts));
        Ok(())
    }

    fn lex_operator(&mut self) -> SandboxResult<()> {
        let c = self.bump().unwrap();
        let next = self.peek();
        let op = match (c, next) {
            ('=', Some('=')) => {
                self.bump();
                Op::EqEq
            }
            ('!', Some('=')) => {
                self.bump();
                Op::NotEq
            }
            ('<', Some('=')) => {
                self.bump();
                Op::Le
            }
            ('>', Some('=')) => {
                self.bump();
                Op::Ge
            }
            ('+', Some('=')) => {
                self.bump();
                Op::PlusAssign
            }
            ('-', Some('=')) => {
                self.bump();
                Op::MinusAssign
            }
            ('*', Some('=')) => {
                self.bump();
                Op::StarAssign
            }
            ('/', Some('=')) => {
                self.bump();
                Op::SlashAssign
            }
            ('/', Some('/')) => {
                self.bump();
                Op::DoubleSlash
            }
            ('=', _) => Op::Assign,
            ('<', _) => Op::Lt,
            ('>', _) => Op::Gt,
            ('+', _) => Op::Plus,
            ('-', _) => Op::Minus,
            ('*', _) => Op::Star,
            ('/', _) => Op::Slash,
            ('%', _) => Op::Percent,
            ('(', _) => {
                self.bracket_depth += 1;
                Op::LParen
            }
            (')', _) => {
                self.bracket_depth = self.bracket_depth.saturating_sub(1);
                Op::RParen
            }
            ('[', _) => {
                self.bracket_depth += 1;
                Op::LBracket
            }
            (']', _) => {
                self.bracket_depth = self.bracket_depth.saturating_sub(1);
                Op::RBracket
            }
            ('{', _) => {
                self.bracket_depth += 1;
                Op::LBrace
            }
            ('}', _) => {
                self.bracket_depth = self.bracket_depth.saturating_sub(1);
                Op::RBrace
            }
            (',', _) => Op::Comma,
            (':', _) => Op::Colon,
            ('.', _) => Op::Dot,
            (';', _) => Op::Semicolon,
            (other, _) => return Err(self.err(format!("unexpected character: {:?}", other))),
        };
        self.push(Tok::Op(op));
        Ok(())
    }
}
