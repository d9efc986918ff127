//! Recursive-descent parser producing the sandbox AST.

use std::rc::Rc;

use super::ast::*;
use super::error::{SandboxError, SandboxResult};
use super::lexer::{Kw, Lexer, Op, RawFPart, Tok, Token};

pub struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

/// Parse a program into a statement list.
pub fn parse_program(source: &str) -> SandboxResult<Vec<Stmt>> {
    let tokens = Lexer::tokenize(source)?;
    let mut parser = Parser { tokens, pos: 0 };
    let stmts = parser.parse_block_body(true)?;
    parser.expect_eof()?;
    Ok(stmts)
}

impl Parser {
    fn peek(&self) -> &Tok {
        &self.tokens[self.pos.min(self.tokens.len() - 1)].tok
    }

    fn line(&self) -> usize {
        self.tokens[self.pos.min(self.tokens.len() - 1)].line
    }

    fn bump(&mut self) -> Tok {
        let tok = self.tokens[self.pos.min(self.tokens.len() - 1)].tok.clone();
        if self.pos < self.tokens.len() {
            self.pos += 1;
        }
        tok
    }

    fn err(&self, message: impl Into<String>) -> SandboxError {
        SandboxError::Syntax {
            line: self.line(),
            message: message.into(),
        }
    }

    fn eat_op(&mut self, op: Op) -> bool {
        if *self.peek() == Tok::Op(op) {
            self.bump();
            true
        } else {
            false
        }
    }

    fn expect_op(&mut self, op: Op, what: &str) -> SandboxResult<()> {
        if self.eat_op(op) {
            Ok(())
        } else {
            Err(self.err(format!("expected {}, found {:?}", what, self.peek())))
        }
    }

    fn eat_kw(&mut self, kw: Kw) -> bool {
        if *self.peek() == Tok::Kw(kw) {
            self.bump();
            true
        } else {
            false
        }
    }

    fn expect_newline(&mut self) -> SandboxResult<()> {
        match self.peek() {
            Tok::Newline => {
                self.bump();
                Ok(())
            }
            Tok::Eof => Ok(()),
            other => Err(self.err(format!("expected end of line, found {:?}", other))),
        }
    }

    fn expect_eof(&mut self) -> SandboxResult<()> {
        match self.peek() {
            Tok::Eof => Ok(()),
            other => Err(self.err(format!("unexpected token after program: {:?}", other))),
        }
    }

    /// Parse statements until dedent (or EOF when `top_level`).
    fn parse_block_body(&mut self, top_level: bool) -> SandboxResult<Vec<Stmt>> {
        let mut stmts = Vec::new();
        loop {
            match self.peek() {
                Tok::Newline => {
                    self.bump();
                }
                Tok::Eof => {
                    if top_level {
                        return Ok(stmts);
                    }
                    return Err(self.err("unexpected end of input inside block"));
                }
                Tok::Dedent if !top_level => {
                    self.bump();
                    return Ok(stmts);
                }
                _ => stmts.extend(self.parse_statement()?),
            }
        }
    }

    /// Parse a block after `:` — either an indented suite or an inline
    /// simple-statement list.
    fn parse_suite(&mut self) -> SandboxResult<Vec<Stmt>> {
        if *self.peek() == Tok::Newline {
            self.bump();
            if *self.peek() != Tok::Indent {
                return Err(self.err("expected an indented block"));
            }
            self.bump();
            let body = self.parse_block_body(false)?;
            if body.is_empty() {
                return Err(self.err("empty block"));
            }
            Ok(body)
        } else {
            self.parse_simple_line()
        }
    }

    /// One or more statements; compound statements are single, simple
    /// statements may be chained with `;` on one line.
    fn parse_statement(&mut self) -> SandboxResult<Vec<Stmt>> {
        match self.peek() {
            Tok::Kw(Kw::If) => Ok(vec![self.parse_if()?]),
            Tok::Kw(Kw::For) => Ok(vec![self.parse_for()?]),
            Tok::Kw(Kw::While) => Ok(vec![self.parse_while()?]),
            Tok::Kw(Kw::Def) => Ok(vec![self.parse_def()?]),
            _ => self.parse_simple_line(),
        }
    }

    /// Simple statements separated by `;`, terminated by newline.
    fn parse_simple_line(&mut self) -> SandboxResult<Vec<Stmt>> {
        let mut stmts = vec![self.parse_simple_stmt()?];
        while *self.peek() == Tok::Op(Op::Semicolon) {
            self.bump();
            if matches!(self.peek(), Tok::Newline | Tok::Eof) {
                break;
            }
            stmts.push(self.parse_simple_stmt()?);
        }
        self.expect_newline()?;
        Ok(stmts)
    }

    fn parse_simple_stmt(&mut self) -> SandboxResult<Stmt> {
        let line = self.line();
        let kind = match self.peek().clone() {
            Tok::Kw(Kw::Import) | Tok::Kw(Kw::From) => {
                self.bump();
                let name = match self.peek() {
                    Tok::Ident(name) => name.clone(),
                    _ => "import".to_string(),
                };
                return Err(SandboxError::Violation { name });
            }
            Tok::Kw(Kw::Return) => {
                self.bump();
                let value = if matches!(self.peek(), Tok::Newline | Tok::Eof | Tok::Op(Op::Semicolon))
                {
                    None
                } else {
                    Some(self.parse_expr()?)
                };
                StmtKind::Return(value)
            }
            Tok::Kw(Kw::Break) => {
                self.bump();
                StmtKind::Break
            }
            Tok::Kw(Kw::Continue) => {
                self.bump();
                StmtKind::Continue
            }
            Tok::Kw(Kw::Pass) => {
                self.bump();
                StmtKind::Pass
            }
            _ => {
                let expr = self.parse_expr()?;
                if let Some(op) = self.peek_aug_assign() {
                    self.bump();
                    let target = self.expr_to_target(expr)?;
                    let value = self.parse_expr()?;
                    StmtKind::AugAssign { target, op, value }
                } else if self.eat_op(Op::Assign) {
                    let target = self.expr_to_target(expr)?;
                    let value = self.parse_expr()?;
                    StmtKind::Assign { target, value }
                } else {
                    StmtKind::Expr(expr)
                }
            }
        };
        Ok(Stmt { kind, line })
    }

    fn peek_aug_assign(&self) -> Option<BinOp> {
        match self.peek() {
            Tok::Op(Op::PlusAssign) => Some(BinOp::Add),
            Tok::Op(Op::MinusAssign) => Some(BinOp::Sub),
            Tok::Op(Op::StarAssign) => Some(BinOp::Mul),
            Tok::Op(Op::SlashAssign) => Some(BinOp::Div),
            _ => None,
        }
    }

    fn expr_to_target(&self, expr: Expr) -> SandboxResult<AssignTarget> {
        match expr {
            Expr::Name(name) => Ok(AssignTarget::Name(name)),
            Expr::Index { obj, index } => Ok(AssignTarget::Index {
                obj: *obj,
                index: *index,
            }),
            _ => Err(self.err("invalid assignment target")),
        }
    }

    fn parse_if(&mut self) -> SandboxResult<Stmt> {
        let line = self.line();
        self.bump();
        let mut branches = Vec::new();
        let cond = self.parse_expr()?;
        self.expect_op(Op::Colon, "':'")?;
        branches.push((cond, self.parse_suite()?));

        let mut orelse = Vec::new();
        loop {
            if self.eat_kw(Kw::Elif) {
                let cond = self.parse_expr()?;
                self.expect_op(Op::Colon, "':'")?;
                branches.push((cond, self.parse_suite()?));
            } else if self.eat_kw(Kw::Else) {
                self.expect_op(Op::Colon, "':'")?;
                orelse = self.parse_suite()?;
                break;
            } else {
                break;
            }
        }
        Ok(Stmt {
            kind: StmtKind::If { branches, orelse },
            line,
        })
    }

    fn parse_for(&mut self) -> SandboxResult<Stmt> {
        let line = self.line();
        self.bump();
        let mut vars = vec![self.parse_ident()?];
        while self.eat_op(Op::Comma) {
            vars.push(self.parse_ident()?);
        }
        if !self.eat_kw(Kw::In) {
            return Err(self.err("expected 'in' in for statement"));
        }
        let iter = self.parse_expr()?;
        self.expect_op(Op::Colon, "':'")?;
        let body = self.parse_suite()?;
        Ok(Stmt {
            kind: StmtKind::For { vars, iter, body },
            line,
        })
    }

    fn parse_while(&mut self) -> SandboxResult<Stmt> {
        let line = self.line();
        self.bump();
        let cond = self.parse_expr()?;
        self.expect_op(Op::Colon, "':'")?;
        let body = self.parse_suite()?;
        Ok(Stmt {
            kind: StmtKind::While { cond, body },
            line,
        })
    }

    fn parse_def(&mut self) -> SandboxResult<Stmt> {
        let line = self.line();
        self.bump();
        let name = self.parse_ident()?;
        self.expect_op(Op::LParen, "'('")?;
        let mut params = Vec::new();
        if !self.eat_op(Op::RParen) {
            loop {
                params.push(self.parse_ident()?);
                if self.eat_op(Op::Comma) {
                    if self.eat_op(Op::RParen) {
                        break;
                    }
                    continue;
                }
                self.expect_op(Op::RParen, "')'")?;
                break;
            }
        }
        self.expect_op(Op::Colon, "':'")?;
        let body = self.parse_suite()?;
        Ok(Stmt {
            kind: StmtKind::FuncDef {
                name,
                params,
                body: Rc::new(body),
            },
            line,
        })
    }

    fn parse_ident(&mut self) -> SandboxResult<String> {
        match self.bump() {
            Tok::Ident(name) => Ok(name),
            other => Err(self.err(format!("expected identifier, found {:?}", other))),
        }
    }

    // Expression grammar, lowest precedence first.

    pub fn parse_expr(&mut self) -> SandboxResult<Expr> {
        self.parse_or()
    }

    fn parse_or(&mut self) -> SandboxResult<Expr> {
        let mut left = self.parse_and()?;
        while self.eat_kw(Kw::Or) {
            let right = self.parse_and()?;
            left = Expr::BoolOp {
                op: BoolOp::Or,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> SandboxResult<Expr> {
        let mut left = self.parse_not()?;
        while self.eat_kw(Kw::And) {
            let right = self.parse_not()?;
            left = Expr::BoolOp {
                op: BoolOp::And,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn parse_not(&mut self) -> SandboxResult<Expr> {
        if self.eat_kw(Kw::Not) {
            let operand = self.parse_not()?;
            return Ok(Expr::Unary {
                op: UnaryOp::Not,
                operand: Box::new(operand),
            });
        }
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> SandboxResult<Expr> {
        let left = self.parse_additive()?;
        let op = match self.peek() {
            Tok::Op(Op::EqEq) => CmpOp::Eq,
            Tok::Op(Op::NotEq) => CmpOp::Ne,
            Tok::Op(Op::Lt) => CmpOp::Lt,
            Tok::Op(Op::Le) => CmpOp::Le,
            Tok::Op(Op::Gt) => CmpOp::Gt,
            Tok::Op(Op::Ge) => CmpOp::Ge,
            Tok::Kw(Kw::In) => CmpOp::In,
            Tok::Kw(Kw::Not) => {
                self.bump();
                if !self.eat_kw(Kw::In) {
                    return Err(self.err("expected 'in' after 'not' in comparison"));
                }
                let right = self.parse_additive()?;
                return Ok(Expr::Compare {
                    op: CmpOp::NotIn,
                    left: Box::new(left),
                    right: Box::new(right),
                });
            }
            _ => return Ok(left),
        };
        self.bump();
        let right = self.parse_additive()?;
        Ok(Expr::Compare {
            op,
            left: Box::new(left),
            right: Box::new(right),
        })
    }

    fn parse_additive(&mut self) -> SandboxResult<Expr> {
        let mut left = self.parse_term()?;
        loop {
            let op = match self.peek() {
                Tok::Op(Op::Plus) => BinOp::Add,
                Tok::Op(Op::Minus) => BinOp::Sub,
                _ => return Ok(left),
            };
            self.bump();
            let right = self.parse_term()?;
            left = Expr::Binary {
                op,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
    }

    fn parse_term(&mut self) -> SandboxResult<Expr> {
        let mut left = self.parse_unary()?;
        loop {
            let op = match self.peek() {
                Tok::Op(Op::Star) => BinOp::Mul,
                Tok::Op(Op::Slash) => BinOp::Div,
                Tok::Op(Op::DoubleSlash) => BinOp::FloorDiv,
                Tok::Op(Op::Percent) => BinOp::Mod,
                _ => return Ok(left),
            };
            self.bump();
            let right = self.parse_unary()?;
            left = Expr::Binary {
                op,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
    }

    fn parse_unary(&mut self) -> SandboxResult<Expr> {
        if self.eat_op(Op::Minus) {
            let operand = self.parse_unary()?;
            return Ok(Expr::Unary {
                op: UnaryOp::Neg,
                operand: Box::new(operand),
            });
        }
        self.parse_postfix()
    }

    fn parse_postfix(&mut self) -> SandboxResult<Expr> {
        let mut expr = self.parse_primary()?;
        loop {
            if self.eat_op(Op::LParen) {
                let args = self.parse_args()?;
                expr = match expr {
                    Expr::Name(func) => Expr::Call { func, args },
                    Expr::Method { obj, name, args: m_args } if m_args.is_empty() => Expr::Method {
                        obj,
                        name,
                        args,
                    },
                    _ => return Err(self.err("only named functions and methods are callable")),
                };
            } else if self.eat_op(Op::LBracket) {
                expr = self.parse_index_or_slice(expr)?;
            } else if self.eat_op(Op::Dot) {
                let name = self.parse_ident()?;
                // Attributes exist only as method calls; the '(' is consumed
                // on the next loop iteration.
                if *self.peek() != Tok::Op(Op::LParen) {
                    return Err(self.err(format!(
                        "attribute access is not allowed: .{} (methods must be called)",
                        name
                    )));
                }
                expr = Expr::Method {
                    obj: Box::new(expr),
                    name,
                    args: Vec::new(),
                };
            } else {
                return Ok(expr);
            }
        }
    }

    fn parse_args(&mut self) -> SandboxResult<Vec<Expr>> {
        let mut args = Vec::new();
        if self.eat_op(Op::RParen) {
            return Ok(args);
        }
        loop {
            args.push(self.parse_expr()?);
            if self.eat_op(Op::Comma) {
                if self.eat_op(Op::RParen) {
                    return Ok(args);
                }
                continue;
            }
            self.expect_op(Op::RParen, "')'")?;
            return Ok(args);
        }
    }

    fn parse_index_or_slice(&mut self, obj: Expr) -> SandboxResult<Expr> {
        let start = if *self.peek() == Tok::Op(Op::Colon) {
            None
        } else {
            Some(Box::new(self.parse_expr()?))
        };
        if self.eat_op(Op::Colon) {
            let stop = if *self.peek() == Tok::Op(Op::RBracket) {
                None
            } else {
                Some(Box::new(self.parse_expr()?))
            };
            self.expect_op(Op::RBracket, "']'")?;
            Ok(Expr::Slice {
                obj: Box::new(obj),
                start,
                stop,
            })
        } else {
            self.expect_op(Op::RBracket, "']'")?;
            let index = start.ok_or_else(|| self.err("empty index"))?;
            Ok(Expr::Index {
                obj: Box::new(obj),
                index,
            })
        }
    }

    fn parse_primary(&mut self) -> SandboxResult<Expr> {
        match self.bump() {
            Tok::Int(i) => Ok(Expr::Int(i)),
            Tok::Float(f) => Ok(Expr::Float(f)),
            Tok::Str(s) => Ok(Expr::Str(s)),
            Tok::FString(raw_parts) => {
                let mut parts = Vec::new();
                for part in raw_parts {
                    match part {
                        RawFPart::Text(text) => parts.push(FStringPart::Text(text)),
                        RawFPart::Expr(source) => {
                            let expr = parse_embedded_expr(&source, self.line())?;
                            parts.push(FStringPart::Expr(Box::new(expr)));
                        }
                    }
                }
                Ok(Expr::FString(parts))
            }
            Tok::Kw(Kw::True) => Ok(Expr::Bool(true)),
            Tok::Kw(Kw::False) => Ok(Expr::Bool(false)),
            Tok::Kw(Kw::None) => Ok(Expr::Null),
            Tok::Ident(name) => Ok(Expr::Name(name)),
            Tok::Op(Op::LParen) => {
                let expr = self.parse_expr()?;
                self.expect_op(Op::RParen, "')'")?;
                Ok(expr)
            }
            Tok::Op(Op::LBracket) => {
                let mut items = Vec::new();
                if self.eat_op(Op::RBracket) {
                    return Ok(Expr::List(items));
                }
                loop {
                    items.push(self.parse_expr()?);
                    if self.eat_op(Op::Comma) {
                        if self.eat_op(Op::RBracket) {
                            return Ok(Expr::List(items));
                        }
                        continue;
                    }
                    self.expect_op(Op::RBracket, "']'")?;
                    return Ok(Expr::List(items));
                }
            }
            Tok::Op(Op::LBrace) => {
                let mut entries = Vec::new();
                if self.eat_op(Op::RBrace) {
                    return Ok(Expr::Dict(entries));
                }
                loop {
                    let key = self.parse_expr()?;
                    self.expect_op(Op::Colon, "':'")?;
                    let value = self.parse_expr()?;
                    entries.push((key, value));
                    if self.eat_op(Op::Comma) {
                        if self.eat_op(Op::RBrace) {
                            return Ok(Expr::Dict(entries));
                        }
                        continue;
                    }
                    self.expect_op(Op::RBrace, "'}'")?;
                    return Ok(Expr::Dict(entries));
                }
            }
            other => Err(self.err(format!("unexpected token: {:?}", other))),
        }
    }
}

/// Parse a single expression embedded in an f-string.
fn parse_embedded_expr(source: &str, line: usize) -> SandboxResult<Expr> {
    let tokens = Lexer::tokenize(source).map_err(|_| SandboxError::Syntax {
        line,
        message: format!("invalid expression in f-string: {}", source),
    })?;
    let mut parser = Parser { tokens, pos: 0 };
    let expr = parser.parse_expr()?;
    match parser.peek() {
        Tok::Newline | Tok::Eof => Ok(expr),
        _ => Err(SandboxError::Syntax {
            line,
            message: format!("invalid expression in f-string: {}", source),
        }),
    }
}
