//! Match expressions: a restricted boolean language over one `target`
//!
//! Text is lexed and parsed into a small JavaScript-like syntax tree, checked
//! against an allow-list by [`MatchExpressionValidator`], then interpreted by
//! [`MatchExpressionEvaluator`], which caches results per target.

pub mod ast;
pub mod cache;
pub mod evaluator;
pub mod lexer;
pub mod parser;
pub mod validator;

pub use evaluator::{MatchExpressionEvaluator, Value};
pub use validator::{MatchExpressionValidator, ValidatedExpression};
