//! Static allow-list check of match expressions
//!
//! An expression passes only if every node is one of:
//!
//! - a boolean, string, number, `null` or regular-expression literal
//! - a property chain rooted at `target`, indexed only by literals
//! - `==`, `!=`, `===`, `!==`, `<`, `>`, `<=`, `>=`, `&&`, `||` or `!`
//! - `/re/.test(arg)` with one literal or property-chain argument
//!
//! Anything else is rejected by name. Nothing is evaluated here.

use super::ast::{Expr, LogicalOp, Stmt, UnaryOp};
use super::parser::parse;
use crate::error::{CryostatError, Result};
use regex::{Regex, RegexBuilder};
use std::collections::HashMap;
use std::sync::Arc;

/// Name of the single binding visible to expressions
pub const TARGET_BINDING: &str = "target";

/// Compiled-size bound for regular expression literals
const REGEX_SIZE_LIMIT: usize = 1 << 20;

/// An expression that passed validation, with its regular expressions compiled
#[derive(Debug, Clone)]
pub struct ValidatedExpression {
    source: String,
    root: Expr,
    regexes: HashMap<(String, String), Arc<Regex>>,
}

impl ValidatedExpression {
    /// Expression text
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Root node
    pub fn root(&self) -> &Expr {
        &self.root
    }

    /// Compiled form of a regular expression literal
    pub fn regex(&self, pattern: &str, flags: &str) -> Option<&Regex> {
        self.regexes
            .get(&(pattern.to_string(), flags.to_string()))
            .map(Arc::as_ref)
    }
}

/// Validator for match expression text
#[derive(Debug, Default, Clone, Copy)]
pub struct MatchExpressionValidator;

impl MatchExpressionValidator {
    /// Creates a validator
    pub fn new() -> Self {
        Self
    }

    /// Parses and checks an expression
    ///
    /// # Errors
    ///
    /// Returns `CryostatError::IllegalExpression` naming the first construct
    /// outside the allow-list, or the syntax error.
    pub fn validate(&self, text: &str) -> Result<ValidatedExpression> {
        if text.trim().is_empty() {
            return Err(illegal("expression is blank"));
        }
        let statements: Vec<Stmt> = parse(text)?
            .into_iter()
            .filter(|s| *s != Stmt::Empty)
            .collect();
        if let Some(forbidden) = statements.iter().find(|s| !matches!(s, Stmt::Expr(_))) {
            return Err(illegal(&format!("{} is not allowed", forbidden.describe())));
        }
        let mut exprs = statements.into_iter().filter_map(|s| match s {
            Stmt::Expr(expr) => Some(expr),
            _ => None,
        });
        let (Some(root), None) = (exprs.next(), exprs.next()) else {
            return Err(illegal("exactly one expression is allowed"));
        };

        let mut checker = Checker::default();
        checker.check(&root)?;
        Ok(ValidatedExpression {
            source: text.to_string(),
            root,
            regexes: checker.regexes,
        })
    }
}

/// Validates with a default [`MatchExpressionValidator`]
pub fn validate(text: &str) -> Result<ValidatedExpression> {
    MatchExpressionValidator::new().validate(text)
}

#[derive(Default)]
struct Checker {
    regexes: HashMap<(String, String), Arc<Regex>>,
}

impl Checker {
    fn check(&mut self, expr: &Expr) -> Result<()> {
        match expr {
            Expr::Null | Expr::Undefined | Expr::Bool(_) | Expr::Number(_) | Expr::Str(_) => Ok(()),
            Expr::Regex { pattern, flags } => self.compile(pattern, flags),
            Expr::Ident(_) | Expr::Member { .. } | Expr::Index { .. } => check_property_chain(expr),
            Expr::Call { callee, args } => self.check_regex_test(callee, args),
            Expr::Unary { op: UnaryOp::Not, operand } => self.check(operand),
            Expr::Unary {
                op: UnaryOp::Neg | UnaryOp::Plus,
                operand,
            } if matches!(**operand, Expr::Number(_)) => Ok(()),
            Expr::Unary { op, .. } => Err(illegal(&format!("unary operator {:?} is not allowed", op))),
            Expr::Binary { op, left, right } if op.is_comparison() => {
                self.check(left)?;
                self.check(right)
            }
            Expr::Binary { op, .. } => Err(illegal(&format!("operator {:?} is not allowed", op))),
            Expr::Logical {
                op: LogicalOp::And | LogicalOp::Or,
                left,
                right,
            } => {
                self.check(left)?;
                self.check(right)
            }
            Expr::Logical { .. } => Err(illegal("operator '??' is not allowed")),
            Expr::New { .. } => Err(illegal("'new' is not allowed")),
            Expr::Assign { .. } => Err(illegal("assignment is not allowed")),
            Expr::Update(_) => Err(illegal("increment and decrement are not allowed")),
            Expr::Conditional { .. } => Err(illegal("conditional operator is not allowed")),
            Expr::Function => Err(illegal("functions are not allowed")),
            Expr::Array(_) => Err(illegal("array literals are not allowed")),
            Expr::Object(_) => Err(illegal("object literals are not allowed")),
            Expr::Sequence(_) => Err(illegal("comma operator is not allowed")),
            Expr::This => Err(illegal("'this' is not allowed")),
        }
    }

    fn check_regex_test(&mut self, callee: &Expr, args: &[Expr]) -> Result<()> {
        let Expr::Member { object, property } = callee else {
            return Err(illegal("function calls are not allowed"));
        };
        let Expr::Regex { pattern, flags } = object.as_ref() else {
            return Err(illegal(&format!("method '{}' is not allowed", property)));
        };
        if property != "test" {
            return Err(illegal(&format!("method '{}' is not allowed", property)));
        }
        let [arg] = args else {
            return Err(illegal("test() takes exactly one argument"));
        };
        match arg {
            Expr::Null | Expr::Undefined | Expr::Bool(_) | Expr::Number(_) | Expr::Str(_) => {}
            other => check_property_chain(other)?,
        }
        self.compile(pattern, flags)
    }

    fn compile(&mut self, pattern: &str, flags: &str) -> Result<()> {
        let key = (pattern.to_string(), flags.to_string());
        if self.regexes.contains_key(&key) {
            return Ok(());
        }
        let mut builder = RegexBuilder::new(pattern);
        builder.size_limit(REGEX_SIZE_LIMIT);
        for flag in flags.chars() {
            match flag {
                'i' => {
                    builder.case_insensitive(true);
                }
                'm' => {
                    builder.multi_line(true);
                }
                's' => {
                    builder.dot_matches_new_line(true);
                }
                'g' | 'u' => {}
                other => return Err(illegal(&format!("regular expression flag '{}' is not supported", other))),
            }
        }
        let regex = builder
            .build()
            .map_err(|e| illegal(&format!("invalid regular expression /{}/: {}", pattern, e)))?;
        self.regexes.insert(key, Arc::new(regex));
        Ok(())
    }
}

fn check_property_chain(expr: &Expr) -> Result<()> {
    match expr {
        Expr::Ident(name) if name == TARGET_BINDING => Ok(()),
        Expr::Ident(name) => Err(illegal(&format!("identifier '{}' is not allowed", name))),
        Expr::Member { object, .. } => check_property_chain(object),
        Expr::Index { object, index } => match index.as_ref() {
            Expr::Str(_) | Expr::Number(_) => check_property_chain(object),
            _ => Err(illegal("computed property access must use a literal key")),
        },
        _ => Err(illegal("property access must start from 'target'")),
    }
}

fn illegal(message: &str) -> anyhow::Error {
    CryostatError::IllegalExpression(message.to_string()).into()
}
