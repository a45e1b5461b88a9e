//! Recursive-descent parser for match expressions
//!
//! Parses a JavaScript-like program into [`Stmt`]s. Statements other than
//! expression statements are recognised only so the validator can name them
//! when rejecting; their bodies are syntax-checked and then dropped.

use super::ast::{BinaryOp, Expr, LogicalOp, Stmt, UnaryOp};
use super::lexer::{tokenize, Token, TokenKind};
use crate::error::{CryostatError, Result};

/// Nesting bound, so hostile input cannot overflow the stack
const MAX_DEPTH: usize = 256;

const ASSIGNMENT_OPS: &[&str] = &[
    "=", "+=", "-=", "*=", "/=", "%=", "**=", "<<=", ">>=", ">>>=", "&=", "|=", "^=",
];

/// Parser over a token stream
pub struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    depth: usize,
}

/// Parses an expression program
///
/// # Errors
///
/// Returns `CryostatError::IllegalExpression` on any syntax error.
pub fn parse(input: &str) -> Result<Vec<Stmt>> {
    let mut parser = Parser {
        tokens: tokenize(input)?,
        pos: 0,
        depth: 0,
    };
    parser.parse_program()
}

impl Parser {
    fn parse_program(&mut self) -> Result<Vec<Stmt>> {
        let mut statements = Vec::new();
        while !self.check_eof() {
            statements.push(self.parse_statement()?);
        }
        Ok(statements)
    }

    fn parse_statement(&mut self) -> Result<Stmt> {
        self.enter()?;
        let result = self.parse_statement_inner();
        self.depth -= 1;
        result
    }

    fn parse_statement_inner(&mut self) -> Result<Stmt> {
        if self.eat_punct(";") {
            return Ok(Stmt::Empty);
        }
        if self.check_punct("{") {
            self.parse_block()?;
            return Ok(Stmt::Block);
        }
        let keyword = match &self.peek().kind {
            TokenKind::Identifier(name) => Some(name.clone()),
            _ => None,
        };
        match keyword.as_deref() {
            Some("var") | Some("let") | Some("const") => {
                self.advance();
                loop {
                    self.expect_identifier()?;
                    if self.eat_punct("=") {
                        self.parse_assignment()?;
                    }
                    if !self.eat_punct(",") {
                        break;
                    }
                }
                self.eat_punct(";");
                Ok(Stmt::Declaration)
            }
            Some("function") => {
                self.parse_function()?;
                Ok(Stmt::Function)
            }
            Some("class") => {
                self.advance();
                self.expect_identifier()?;
                if self.eat_keyword("extends") {
                    self.parse_call_member()?;
                }
                self.skip_balanced("{", "}")?;
                Ok(Stmt::Class)
            }
            Some("if") => {
                self.advance();
                self.parse_parenthesized()?;
                self.parse_statement()?;
                if self.eat_keyword("else") {
                    self.parse_statement()?;
                }
                Ok(Stmt::If)
            }
            Some("while") => {
                self.advance();
                self.parse_parenthesized()?;
                self.parse_statement()?;
                Ok(Stmt::Loop)
            }
            Some("do") => {
                self.advance();
                self.parse_statement()?;
                if !self.eat_keyword("while") {
                    return Err(self.unexpected("'while'"));
                }
                self.parse_parenthesized()?;
                self.eat_punct(";");
                Ok(Stmt::Loop)
            }
            Some("for") => {
                self.advance();
                self.skip_balanced("(", ")")?;
                self.parse_statement()?;
                Ok(Stmt::Loop)
            }
            Some("return") => {
                self.advance();
                if !self.check_punct(";") && !self.check_punct("}") && !self.check_eof() {
                    self.parse_expression()?;
                }
                self.eat_punct(";");
                Ok(Stmt::Return)
            }
            Some("throw") => {
                self.advance();
                self.parse_expression()?;
                self.eat_punct(";");
                Ok(Stmt::Throw)
            }
            Some("try") => {
                self.advance();
                self.parse_block()?;
                if self.eat_keyword("catch") {
                    if self.check_punct("(") {
                        self.skip_balanced("(", ")")?;
                    }
                    self.parse_block()?;
                }
                if self.eat_keyword("finally") {
                    self.parse_block()?;
                }
                Ok(Stmt::Try)
            }
            Some("switch") => {
                self.advance();
                self.parse_parenthesized()?;
                self.skip_balanced("{", "}")?;
                Ok(Stmt::Switch)
            }
            _ => {
                let expr = self.parse_expression()?;
                self.eat_punct(";");
                Ok(Stmt::Expr(expr))
            }
        }
    }

    fn parse_block(&mut self) -> Result<()> {
        self.expect_punct("{")?;
        while !self.check_punct("}") {
            if self.check_eof() {
                return Err(self.unexpected("'}'"));
            }
            self.parse_statement()?;
        }
        self.advance();
        Ok(())
    }

    fn parse_function(&mut self) -> Result<()> {
        self.advance();
        if matches!(self.peek().kind, TokenKind::Identifier(_)) {
            self.advance();
        }
        self.skip_balanced("(", ")")?;
        self.parse_block()
    }

    fn parse_parenthesized(&mut self) -> Result<Expr> {
        self.expect_punct("(")?;
        let expr = self.parse_expression()?;
        self.expect_punct(")")?;
        Ok(expr)
    }

    fn parse_expression(&mut self) -> Result<Expr> {
        let first = self.parse_assignment()?;
        if !self.check_punct(",") {
            return Ok(first);
        }
        let mut items = vec![first];
        while self.eat_punct(",") {
            items.push(self.parse_assignment()?);
        }
        Ok(Expr::Sequence(items))
    }

    fn parse_assignment(&mut self) -> Result<Expr> {
        self.enter()?;
        let result = self.parse_assignment_inner();
        self.depth -= 1;
        result
    }

    fn parse_assignment_inner(&mut self) -> Result<Expr> {
        if matches!(self.peek().kind, TokenKind::Identifier(_)) && self.peek_punct_at(1, "=>") {
            self.advance();
            self.advance();
            self.parse_arrow_body()?;
            return Ok(Expr::Function);
        }
        let target = self.parse_conditional()?;
        if let TokenKind::Punct(p) = self.peek().kind {
            if ASSIGNMENT_OPS.contains(&p) {
                self.advance();
                let value = self.parse_assignment()?;
                return Ok(Expr::Assign {
                    target: Box::new(target),
                    value: Box::new(value),
                });
            }
        }
        Ok(target)
    }

    fn parse_arrow_body(&mut self) -> Result<()> {
        if self.check_punct("{") {
            self.parse_block()
        } else {
            self.parse_assignment().map(|_| ())
        }
    }

    fn parse_conditional(&mut self) -> Result<Expr> {
        let test = self.parse_binary(1)?;
        if !self.eat_punct("?") {
            return Ok(test);
        }
        let then = self.parse_assignment()?;
        self.expect_punct(":")?;
        let otherwise = self.parse_assignment()?;
        Ok(Expr::Conditional {
            test: Box::new(test),
            then: Box::new(then),
            otherwise: Box::new(otherwise),
        })
    }

    fn binary_operator(&self) -> Option<(&'static str, u8)> {
        match &self.peek().kind {
            TokenKind::Punct(p) => {
                let prec = match *p {
                    "??" => 1,
                    "||" => 2,
                    "&&" => 3,
                    "|" => 4,
                    "^" => 5,
                    "&" => 6,
                    "==" | "!=" | "===" | "!==" => 7,
                    "<" | ">" | "<=" | ">=" => 8,
                    "<<" | ">>" | ">>>" => 9,
                    "+" | "-" => 10,
                    "*" | "/" | "%" => 11,
                    "**" => 12,
                    _ => return None,
                };
                Some((*p, prec))
            }
            TokenKind::Identifier(name) if name == "instanceof" => Some(("instanceof", 8)),
            TokenKind::Identifier(name) if name == "in" => Some(("in", 8)),
            _ => None,
        }
    }

    fn parse_binary(&mut self, min_prec: u8) -> Result<Expr> {
        self.enter()?;
        let result = self.parse_binary_inner(min_prec);
        self.depth -= 1;
        result
    }

    fn parse_binary_inner(&mut self, min_prec: u8) -> Result<Expr> {
        let mut left = self.parse_unary()?;
        while let Some((op, prec)) = self.binary_operator() {
            if prec < min_prec {
                break;
            }
            self.advance();
            let next_min = if op == "**" { prec } else { prec + 1 };
            let right = Box::new(self.parse_binary(next_min)?);
            let left_box = Box::new(left);
            left = match op {
                "&&" => Expr::Logical {
                    op: LogicalOp::And,
                    left: left_box,
                    right,
                },
                "||" => Expr::Logical {
                    op: LogicalOp::Or,
                    left: left_box,
                    right,
                },
                "??" => Expr::Logical {
                    op: LogicalOp::Coalesce,
                    left: left_box,
                    right,
                },
                _ => Expr::Binary {
                    op: match op {
                        "==" => BinaryOp::Eq,
                        "!=" => BinaryOp::NotEq,
                        "===" => BinaryOp::StrictEq,
                        "!==" => BinaryOp::StrictNotEq,
                        "<" => BinaryOp::Lt,
                        ">" => BinaryOp::Gt,
                        "<=" => BinaryOp::LtEq,
                        ">=" => BinaryOp::GtEq,
                        other => BinaryOp::Other(other),
                    },
                    left: left_box,
                    right,
                },
            };
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Expr> {
        self.enter()?;
        let result = self.parse_unary_inner();
        self.depth -= 1;
        result
    }

    fn parse_unary_inner(&mut self) -> Result<Expr> {
        let op = match &self.peek().kind {
            TokenKind::Punct("!") => Some(UnaryOp::Not),
            TokenKind::Punct("-") => Some(UnaryOp::Neg),
            TokenKind::Punct("+") => Some(UnaryOp::Plus),
            TokenKind::Punct("~") => Some(UnaryOp::BitNot),
            TokenKind::Identifier(name) if name == "typeof" => Some(UnaryOp::TypeOf),
            TokenKind::Identifier(name) if name == "void" => Some(UnaryOp::Void),
            TokenKind::Identifier(name) if name == "delete" => Some(UnaryOp::Delete),
            TokenKind::Punct("++") | TokenKind::Punct("--") => {
                self.advance();
                let operand = self.parse_unary()?;
                return Ok(Expr::Update(Box::new(operand)));
            }
            _ => None,
        };
        if let Some(op) = op {
            self.advance();
            let operand = self.parse_unary()?;
            return Ok(Expr::Unary {
                op,
                operand: Box::new(operand),
            });
        }
        let expr = self.parse_call_member()?;
        if self.check_punct("++") || self.check_punct("--") {
            self.advance();
            return Ok(Expr::Update(Box::new(expr)));
        }
        Ok(expr)
    }

    fn parse_call_member(&mut self) -> Result<Expr> {
        let mut expr = if self.eat_keyword("new") {
            let callee = self.parse_member_only()?;
            let args = if self.check_punct("(") {
                self.parse_arguments()?
            } else {
                Vec::new()
            };
            Expr::New {
                callee: Box::new(callee),
                args,
            }
        } else {
            self.parse_primary()?
        };
        loop {
            if self.check_punct("?.") {
                return Err(self.illegal("optional chaining is not allowed"));
            } else if self.check_punct(".") || self.check_punct("[") {
                expr = self.parse_member_suffix(expr)?;
            } else if self.check_punct("(") {
                let args = self.parse_arguments()?;
                expr = Expr::Call {
                    callee: Box::new(expr),
                    args,
                };
            } else {
                return Ok(expr);
            }
        }
    }

    fn parse_member_only(&mut self) -> Result<Expr> {
        let mut expr = self.parse_primary()?;
        while self.check_punct(".") || self.check_punct("[") {
            expr = self.parse_member_suffix(expr)?;
        }
        Ok(expr)
    }

    fn parse_member_suffix(&mut self, object: Expr) -> Result<Expr> {
        if self.eat_punct(".") {
            let property = self.expect_identifier()?;
            return Ok(Expr::Member {
                object: Box::new(object),
                property,
            });
        }
        self.expect_punct("[")?;
        let index = self.parse_expression()?;
        self.expect_punct("]")?;
        Ok(Expr::Index {
            object: Box::new(object),
            index: Box::new(index),
        })
    }

    fn parse_arguments(&mut self) -> Result<Vec<Expr>> {
        self.expect_punct("(")?;
        let mut args = Vec::new();
        while !self.check_punct(")") {
            if self.check_punct("...") {
                return Err(self.illegal("spread arguments are not allowed"));
            }
            args.push(self.parse_assignment()?);
            if !self.eat_punct(",") {
                break;
            }
        }
        self.expect_punct(")")?;
        Ok(args)
    }

    fn parse_primary(&mut self) -> Result<Expr> {
        let token = self.peek().clone();
        match token.kind {
            TokenKind::Number(n) => {
                self.advance();
                Ok(Expr::Number(n))
            }
            TokenKind::Str(s) => {
                self.advance();
                Ok(Expr::Str(s))
            }
            TokenKind::Regex { pattern, flags } => {
                self.advance();
                Ok(Expr::Regex { pattern, flags })
            }
            TokenKind::Identifier(name) => match name.as_str() {
                "true" | "false" => {
                    self.advance();
                    Ok(Expr::Bool(name == "true"))
                }
                "null" => {
                    self.advance();
                    Ok(Expr::Null)
                }
                "undefined" => {
                    self.advance();
                    Ok(Expr::Undefined)
                }
                "this" => {
                    self.advance();
                    Ok(Expr::This)
                }
                "function" => {
                    self.parse_function()?;
                    Ok(Expr::Function)
                }
                "class" => Err(self.illegal("class expressions are not allowed")),
                _ => {
                    self.advance();
                    Ok(Expr::Ident(name))
                }
            },
            TokenKind::Punct("(") => {
                if self.peek_punct_at(1, ")") && self.peek_punct_at(2, "=>") {
                    self.advance();
                    self.advance();
                    self.advance();
                    self.parse_arrow_body()?;
                    return Ok(Expr::Function);
                }
                let expr = self.parse_parenthesized()?;
                if self.eat_punct("=>") {
                    self.parse_arrow_body()?;
                    return Ok(Expr::Function);
                }
                Ok(expr)
            }
            TokenKind::Punct("[") => {
                self.advance();
                let mut items = Vec::new();
                while !self.check_punct("]") {
                    items.push(self.parse_assignment()?);
                    if !self.eat_punct(",") {
                        break;
                    }
                }
                self.expect_punct("]")?;
                Ok(Expr::Array(items))
            }
            TokenKind::Punct("{") => {
                self.advance();
                let mut fields = Vec::new();
                while !self.check_punct("}") {
                    let key = match self.peek().kind.clone() {
                        TokenKind::Identifier(k) | TokenKind::Str(k) => k,
                        TokenKind::Number(n) => n.to_string(),
                        _ => return Err(self.unexpected("property name")),
                    };
                    self.advance();
                    let value = if self.eat_punct(":") {
                        self.parse_assignment()?
                    } else {
                        Expr::Ident(key.clone())
                    };
                    fields.push((key, value));
                    if !self.eat_punct(",") {
                        break;
                    }
                }
                self.expect_punct("}")?;
                Ok(Expr::Object(fields))
            }
            _ => Err(self.unexpected("expression")),
        }
    }

    // Helpers

    fn enter(&mut self) -> Result<()> {
        self.depth += 1;
        if self.depth > MAX_DEPTH {
            self.depth -= 1;
            return Err(self.illegal("expression nested too deeply"));
        }
        Ok(())
    }

    fn skip_balanced(&mut self, open: &'static str, close: &'static str) -> Result<()> {
        self.expect_punct(open)?;
        let mut depth = 1usize;
        while depth > 0 {
            if self.check_eof() {
                return Err(self.unexpected(&format!("'{}'", close)));
            }
            if self.check_punct(open) {
                depth += 1;
            } else if self.check_punct(close) {
                depth -= 1;
            }
            self.advance();
        }
        Ok(())
    }

    fn peek(&self) -> &Token {
        &self.tokens[self.pos.min(self.tokens.len() - 1)]
    }

    fn peek_punct_at(&self, offset: usize, punct: &str) -> bool {
        matches!(
            self.tokens.get(self.pos + offset).map(|t| &t.kind),
            Some(TokenKind::Punct(p)) if *p == punct
        )
    }

    fn advance(&mut self) {
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
    }

    fn check_eof(&self) -> bool {
        self.peek().kind == TokenKind::Eof
    }

    fn check_punct(&self, punct: &str) -> bool {
        matches!(self.peek().kind, TokenKind::Punct(p) if p == punct)
    }

    fn eat_punct(&mut self, punct: &str) -> bool {
        if self.check_punct(punct) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn eat_keyword(&mut self, keyword: &str) -> bool {
        if matches!(&self.peek().kind, TokenKind::Identifier(name) if name == keyword) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect_punct(&mut self, punct: &str) -> Result<()> {
        if self.eat_punct(punct) {
            Ok(())
        } else {
            Err(self.unexpected(&format!("'{}'", punct)))
        }
    }

    fn expect_identifier(&mut self) -> Result<String> {
        match self.peek().kind.clone() {
            TokenKind::Identifier(name) => {
                self.advance();
                Ok(name)
            }
            _ => Err(self.unexpected("identifier")),
        }
    }

    fn unexpected(&self, expected: &str) -> anyhow::Error {
        let token = self.peek();
        CryostatError::IllegalExpression(format!(
            "expected {} but found {} at {}:{}",
            expected, token.kind, token.line, token.col
        ))
        .into()
    }

    fn illegal(&self, message: &str) -> anyhow::Error {
        let token = self.peek();
        CryostatError::IllegalExpression(format!("{} at {}:{}", message, token.line, token.col)).into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn single_expr(input: &str) -> Expr {
        let mut statements = parse(input).unwrap();
        assert_eq!(statements.len(), 1, "{:?}", statements);
        match statements.remove(0) {
            Stmt::Expr(expr) => expr,
            other => panic!("not an expression: {:?}", other),
        }
    }

    #[test]
    fn test_precedence_of_logical_and_comparison() {
        let expr = single_expr("a == 1 || b < 2 && c");
        match expr {
            Expr::Logical {
                op: LogicalOp::Or,
                left,
                right,
            } => {
                assert!(matches!(*left, Expr::Binary { op: BinaryOp::Eq, .. }));
                assert!(matches!(*right, Expr::Logical { op: LogicalOp::And, .. }));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_member_index_and_call() {
        let expr = single_expr("/x/.test(target.labels['app'])");
        match expr {
            Expr::Call { callee, args } => {
                assert!(matches!(*callee, Expr::Member { ref property, .. } if property == "test"));
                assert!(matches!(args[0], Expr::Index { .. }));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_statements_are_recognised() {
        let cases = [
            ("while(true){}", Stmt::Loop),
            ("for (var i = 0; i < 1; i++) {}", Stmt::Loop),
            ("do { x } while (y)", Stmt::Loop),
            ("var x = 1", Stmt::Declaration),
            ("if (a) b; else c", Stmt::If),
            ("try { a } catch (e) { b } finally { c }", Stmt::Try),
            ("throw 1", Stmt::Throw),
            ("class A extends B {}", Stmt::Class),
            ("switch (a) { case 1: break; }", Stmt::Switch),
        ];
        for (input, expected) in cases {
            let statements = parse(input).unwrap();
            assert_eq!(statements[0], expected, "{}", input);
        }
    }

    #[test]
    fn test_function_then_call_is_two_statements() {
        let statements = parse("function f(){}; f()").unwrap();
        assert_eq!(statements[0], Stmt::Function);
        assert_eq!(statements[1], Stmt::Empty);
        assert!(matches!(statements[2], Stmt::Expr(Expr::Call { .. })));
    }

    #[test]
    fn test_arrow_functions_and_new() {
        assert_eq!(single_expr("x => x"), Expr::Function);
        assert_eq!(single_expr("(a, b) => { return a }"), Expr::Function);
        assert_eq!(single_expr("() => 1"), Expr::Function);
        assert!(matches!(single_expr("new Foo()"), Expr::New { .. }));
    }

    #[test]
    fn test_syntax_errors() {
        for input in ["a ==", "(a", "target.", "a ? b", "{", "target?.alias"] {
            assert!(parse(input).is_err(), "{}", input);
        }
    }

    #[test]
    fn test_deep_nesting_is_rejected() {
        let input = format!("{}1{}", "(".repeat(1000), ")".repeat(1000));
        assert!(parse(&input).is_err());
    }
}
