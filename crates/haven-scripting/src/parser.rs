//! Recursive-descent parser producing the dialect's AST.
//!
//! Structural restrictions enforced here: `if`/`for` only inside function
//! bodies, `return` only inside functions, `break`/`continue` only inside
//! loops, calls by name only, and no set literals.

use crate::ast::*;
use crate::error::{Result, ScriptError};
use crate::lexer::tokenize;
use crate::token::{Token, TokenKind};

pub fn parse(source: &str) -> Result<Program> {
    let tokens = tokenize(source)?;
    let mut parser = Parser { tokens, pos: 0 };
    parser.program()
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

#[derive(Clone, Copy, Default)]
struct Ctx {
    in_function: bool,
    in_loop: bool,
}

impl Parser {
    fn peek(&self) -> &Token {
        &self.tokens[self.pos.min(self.tokens.len() - 1)]
    }

    fn peek_kind(&self) -> &TokenKind {
        &self.peek().kind
    }

    fn advance(&mut self) -> Token {
        let token = self.tokens[self.pos.min(self.tokens.len() - 1)].clone();
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
        token
    }

    fn check(&mut self, kind: &TokenKind) -> bool {
        if self.peek_kind() == kind {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, kind: TokenKind) -> Result<Token> {
        if self.peek_kind() == &kind {
            Ok(self.advance())
        } else {
            Err(self.error_here(format!(
                "expected {}, found {}",
                kind.describe(),
                self.peek_kind().describe()
            )))
        }
    }

    fn error_here(&self, message: String) -> ScriptError {
        let token = self.peek();
        ScriptError::Syntax {
            line: token.line,
            col: token.col,
            message,
        }
    }

    fn program(&mut self) -> Result<Program> {
        let mut body = Vec::new();
        while self.peek_kind() != &TokenKind::Eof {
            if self.check(&TokenKind::Newline) {
                continue;
            }
            body.push(self.statement(Ctx::default())?);
        }
        Ok(Program { body })
    }

    fn statement(&mut self, ctx: Ctx) -> Result<Stmt> {
        let token = self.peek().clone();
        match &token.kind {
            TokenKind::Def => self.def_statement(ctx),
            TokenKind::If => {
                if !ctx.in_function {
                    return Err(self.error_here(
                        "if statements are only allowed inside functions".into(),
                    ));
                }
                self.if_statement(ctx)
            }
            TokenKind::For => {
                if !ctx.in_function {
                    return Err(self.error_here(
                        "for loops are only allowed inside functions".into(),
                    ));
                }
                self.for_statement(ctx)
            }
            TokenKind::Return => {
                if !ctx.in_function {
                    return Err(self.error_here("return outside of a function".into()));
                }
                self.advance();
                let value = if self.peek_kind() == &TokenKind::Newline {
                    None
                } else {
                    Some(self.expression()?)
                };
                self.expect(TokenKind::Newline)?;
                Ok(Stmt::Return {
                    value,
                    line: token.line,
                })
            }
            TokenKind::Break => {
                if !ctx.in_loop {
                    return Err(self.error_here("break outside of a loop".into()));
                }
                self.advance();
                self.expect(TokenKind::Newline)?;
                Ok(Stmt::Break { line: token.line })
            }
            TokenKind::Continue => {
                if !ctx.in_loop {
                    return Err(self.error_here("continue outside of a loop".into()));
                }
                self.advance();
                self.expect(TokenKind::Newline)?;
                Ok(Stmt::Continue { line: token.line })
            }
            TokenKind::Pass => {
                self.advance();
                self.expect(TokenKind::Newline)?;
                Ok(Stmt::Pass)
            }
            _ => self.assign_or_expr_statement(),
        }
    }

    fn def_statement(&mut self, _ctx: Ctx) -> Result<Stmt> {
        let def_token = self.advance();
        let name = self.ident()?;
        self.expect(TokenKind::LParen)?;

        let mut params: Vec<Param> = Vec::new();
        let mut seen_default = false;
        if self.peek_kind() != &TokenKind::RParen {
            loop {
                let param_name = self.ident()?;
                let default = if self.check(&TokenKind::Assign) {
                    seen_default = true;
                    Some(self.expression()?)
                } else {
                    if seen_default {
                        return Err(self.error_here(
                            "parameters without defaults must come before defaulted ones".into(),
                        ));
                    }
                    None
                };
                if params.iter().any(|p: &Param| p.name == param_name) {
                    return Err(self.error_here(format!("duplicate parameter: {param_name}")));
                }
                params.push(Param {
                    name: param_name,
                    default,
                });
                if !self.check(&TokenKind::Comma) {
                    break;
                }
            }
        }
        self.expect(TokenKind::RParen)?;
        self.expect(TokenKind::Colon)?;
        let body = self.block(Ctx {
            in_function: true,
            in_loop: false,
        })?;
        Ok(Stmt::Def {
            name,
            params,
            body,
            line: def_token.line,
        })
    }

    fn if_statement(&mut self, ctx: Ctx) -> Result<Stmt> {
        let if_token = self.advance();
        let mut branches = Vec::new();

        let condition = self.expression()?;
        self.expect(TokenKind::Colon)?;
        branches.push((condition, self.block(ctx)?));

        let mut else_body = None;
        loop {
            if self.peek_kind() == &TokenKind::Elif {
                self.advance();
                let condition = self.expression()?;
                self.expect(TokenKind::Colon)?;
                branches.push((condition, self.block(ctx)?));
            } else if self.peek_kind() == &TokenKind::Else {
                self.advance();
                self.expect(TokenKind::Colon)?;
                else_body = Some(self.block(ctx)?);
                break;
            } else {
                break;
            }
        }

        Ok(Stmt::If {
            branches,
            else_body,
            line: if_token.line,
        })
    }

    fn for_statement(&mut self, ctx: Ctx) -> Result<Stmt> {
        let for_token = self.advance();
        let var = self.ident()?;
        self.expect(TokenKind::In)?;
        let iterable = self.expression()?;
        self.expect(TokenKind::Colon)?;
        let body = self.block(Ctx {
            in_function: ctx.in_function,
            in_loop: true,
        })?;
        Ok(Stmt::For {
            var,
            iterable,
            body,
            line: for_token.line,
        })
    }

    fn block(&mut self, ctx: Ctx) -> Result<Vec<Stmt>> {
        self.expect(TokenKind::Newline)?;
        self.expect(TokenKind::Indent)?;
        let mut body = Vec::new();
        while self.peek_kind() != &TokenKind::Dedent && self.peek_kind() != &TokenKind::Eof {
            if self.check(&TokenKind::Newline) {
                continue;
            }
            body.push(self.statement(ctx)?);
        }
        self.expect(TokenKind::Dedent)?;
        if body.is_empty() {
            return Err(self.error_here("empty block".into()));
        }
        Ok(body)
    }

    fn assign_or_expr_statement(&mut self) -> Result<Stmt> {
        let line = self.peek().line;
        let expr = self.expression()?;

        let augmented = match self.peek_kind() {
            TokenKind::Assign => Some(false),
            TokenKind::PlusAssign => Some(true),
            _ => None,
        };

        if let Some(augmented) = augmented {
            self.advance();
            let target = match expr {
                Expr::Name(name) => AssignTarget::Name(name),
                Expr::Index { object, index } => AssignTarget::Index {
                    object: *object,
                    index: *index,
                },
                _ => {
                    return Err(self.error_here(
                        "assignment target must be a name or an index expression".into(),
                    ))
                }
            };
            let value = self.expression()?;
            self.expect(TokenKind::Newline)?;
            return Ok(Stmt::Assign {
                target,
                augmented,
                value,
                line,
            });
        }

        self.expect(TokenKind::Newline)?;
        Ok(Stmt::Expr { expr, line })
    }

    fn ident(&mut self) -> Result<String> {
        match self.peek_kind().clone() {
            TokenKind::Ident(name) => {
                self.advance();
                Ok(name)
            }
            other => Err(self.error_here(format!("expected identifier, found {}", other.describe()))),
        }
    }

    // ── Expressions ──────────────────────────────────────────────────────

    fn expression(&mut self) -> Result<Expr> {
        let value = self.or_expr()?;
        // Conditional expression: `a if cond else b`.
        if self.peek_kind() == &TokenKind::If {
            self.advance();
            let condition = self.or_expr()?;
            self.expect(TokenKind::Else)?;
            let otherwise = self.expression()?;
            return Ok(Expr::Conditional {
                condition: Box::new(condition),
                then: Box::new(value),
                otherwise: Box::new(otherwise),
            });
        }
        Ok(value)
    }

    fn or_expr(&mut self) -> Result<Expr> {
        let mut left = self.and_expr()?;
        while self.check(&TokenKind::Or) {
            let right = self.and_expr()?;
            left = Expr::BoolOp {
                op: BoolOp::Or,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn and_expr(&mut self) -> Result<Expr> {
        let mut left = self.not_expr()?;
        while self.check(&TokenKind::And) {
            let right = self.not_expr()?;
            left = Expr::BoolOp {
                op: BoolOp::And,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn not_expr(&mut self) -> Result<Expr> {
        if self.check(&TokenKind::Not) {
            // `not in` handled in comparison; a bare `not` here is unary.
            let operand = self.not_expr()?;
            return Ok(Expr::Unary {
                op: UnaryOp::Not,
                operand: Box::new(operand),
            });
        }
        self.comparison()
    }

    fn comparison(&mut self) -> Result<Expr> {
        let left = self.arith()?;
        let op = match self.peek_kind() {
            TokenKind::Eq => Some(CmpOp::Eq),
            TokenKind::NotEq => Some(CmpOp::NotEq),
            TokenKind::Lt => Some(CmpOp::Lt),
            TokenKind::LtEq => Some(CmpOp::LtEq),
            TokenKind::Gt => Some(CmpOp::Gt),
            TokenKind::GtEq => Some(CmpOp::GtEq),
            TokenKind::In => Some(CmpOp::In),
            TokenKind::Not => Some(CmpOp::NotIn),
            _ => None,
        };
        let Some(op) = op else {
            return Ok(left);
        };
        if op == CmpOp::NotIn {
            // consume `not`, require `in`
            self.advance();
            self.expect(TokenKind::In)?;
        } else {
            self.advance();
        }
        let right = self.arith()?;
        Ok(Expr::Compare {
            op,
            left: Box::new(left),
            right: Box::new(right),
        })
    }

    fn arith(&mut self) -> Result<Expr> {
        let mut left = self.term()?;
        loop {
            let op = match self.peek_kind() {
                TokenKind::Plus => BinOp::Add,
                TokenKind::Minus => BinOp::Sub,
                _ => break,
            };
            self.advance();
            let right = self.term()?;
            left = Expr::Binary {
                op,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn term(&mut self) -> Result<Expr> {
        let mut left = self.factor()?;
        loop {
            let op = match self.peek_kind() {
                TokenKind::Star => BinOp::Mul,
                TokenKind::Slash => BinOp::Div,
                TokenKind::DoubleSlash => BinOp::FloorDiv,
                TokenKind::Percent => BinOp::Mod,
                _ => break,
            };
            self.advance();
            let right = self.factor()?;
            left = Expr::Binary {
                op,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn factor(&mut self) -> Result<Expr> {
        if self.check(&TokenKind::Minus) {
            let operand = self.factor()?;
            return Ok(Expr::Unary {
                op: UnaryOp::Neg,
                operand: Box::new(operand),
            });
        }
        self.power()
    }

    fn power(&mut self) -> Result<Expr> {
        let base = self.postfix()?;
        if self.check(&TokenKind::DoubleStar) {
            let exponent = self.factor()?;
            return Ok(Expr::Binary {
                op: BinOp::Pow,
                left: Box::new(base),
                right: Box::new(exponent),
            });
        }
        Ok(base)
    }

    fn postfix(&mut self) -> Result<Expr> {
        let mut expr = self.atom()?;
        loop {
            if self.peek_kind() == &TokenKind::LBracket {
                self.advance();
                let index = self.expression()?;
                self.expect(TokenKind::RBracket)?;
                expr = Expr::Index {
                    object: Box::new(expr),
                    index: Box::new(index),
                };
            } else if self.peek_kind() == &TokenKind::LParen {
                let line = self.peek().line;
                let Expr::Name(func) = expr else {
                    return Err(
                        self.error_here("only named functions can be called".into())
                    );
                };
                self.advance();
                let (args, kwargs) = self.call_args()?;
                expr = Expr::Call {
                    func,
                    args,
                    kwargs,
                    line,
                };
            } else {
                break;
            }
        }
        Ok(expr)
    }

    fn call_args(&mut self) -> Result<(Vec<Expr>, Vec<(String, Expr)>)> {
        let mut args = Vec::new();
        let mut kwargs: Vec<(String, Expr)> = Vec::new();
        if self.peek_kind() != &TokenKind::RParen {
            loop {
                // `name=expr` is a keyword argument; plain expr is positional.
                let is_kwarg = matches!(self.peek_kind(), TokenKind::Ident(_))
                    && self.tokens.get(self.pos + 1).map(|t| &t.kind) == Some(&TokenKind::Assign);
                if is_kwarg {
                    let name = self.ident()?;
                    self.expect(TokenKind::Assign)?;
                    let value = self.expression()?;
                    if kwargs.iter().any(|(k, _)| k == &name) {
                        return Err(self.error_here(format!("duplicate keyword argument: {name}")));
                    }
                    kwargs.push((name, value));
                } else {
                    if !kwargs.is_empty() {
                        return Err(self.error_here(
                            "positional arguments must come before keyword arguments".into(),
                        ));
                    }
                    args.push(self.expression()?);
                }
                if !self.check(&TokenKind::Comma) {
                    break;
                }
            }
        }
        self.expect(TokenKind::RParen)?;
        Ok((args, kwargs))
    }

    fn atom(&mut self) -> Result<Expr> {
        let token = self.advance();
        match token.kind {
            TokenKind::NoneLit => Ok(Expr::None),
            TokenKind::True => Ok(Expr::Bool(true)),
            TokenKind::False => Ok(Expr::Bool(false)),
            TokenKind::Int(n) => Ok(Expr::Int(n)),
            TokenKind::Float(f) => Ok(Expr::Float(f)),
            TokenKind::Str(s) => Ok(Expr::Str(s)),
            TokenKind::Ident(name) => Ok(Expr::Name(name)),
            TokenKind::LParen => {
                let inner = self.expression()?;
                self.expect(TokenKind::RParen)?;
                Ok(inner)
            }
            TokenKind::LBracket => {
                let mut items = Vec::new();
                if self.peek_kind() != &TokenKind::RBracket {
                    loop {
                        items.push(self.expression()?);
                        if !self.check(&TokenKind::Comma) {
                            break;
                        }
                        if self.peek_kind() == &TokenKind::RBracket {
                            break; // trailing comma
                        }
                    }
                }
                self.expect(TokenKind::RBracket)?;
                Ok(Expr::List(items))
            }
            TokenKind::LBrace => {
                let mut entries = Vec::new();
                if self.peek_kind() != &TokenKind::RBrace {
                    loop {
                        let key = self.expression()?;
                        if self.peek_kind() != &TokenKind::Colon {
                            return Err(self.error_here(
                                "set literals are not supported; use dict keys as a workaround"
                                    .into(),
                            ));
                        }
                        self.advance();
                        let value = self.expression()?;
                        entries.push((key, value));
                        if !self.check(&TokenKind::Comma) {
                            break;
                        }
                        if self.peek_kind() == &TokenKind::RBrace {
                            break;
                        }
                    }
                }
                self.expect(TokenKind::RBrace)?;
                Ok(Expr::Dict(entries))
            }
            other => Err(ScriptError::Syntax {
                line: token.line,
                col: token.col,
                message: format!("unexpected {}", other.describe()),
            }),
        }
    }
}
