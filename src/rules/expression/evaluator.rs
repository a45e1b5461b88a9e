//! Evaluation of validated match expressions against a target
//!
//! Values follow JavaScript semantics closely enough for comparisons over
//! strings, numbers and booleans: loose and strict equality, truthiness, and
//! `&&`/`||` yielding an operand rather than a boolean.

use super::ast::{BinaryOp, Expr, LogicalOp, UnaryOp};
use super::cache::LruCache;
use super::validator::{MatchExpressionValidator, ValidatedExpression, TARGET_BINDING};
use crate::error::{CryostatError, Result};
use crate::target::{jmx_service_url, AnnotationKey, ServiceRef};
use std::borrow::Cow;
use std::cmp::Ordering as CmpOrdering;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use tracing::{debug, trace};

/// Default number of cached `(expression, target)` results
pub const DEFAULT_CACHE_CAPACITY: usize = 1024;

/// Runtime value
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// `undefined`
    Undefined,
    /// `null`
    Null,
    /// Boolean
    Bool(bool),
    /// Number
    Number(f64),
    /// String
    Str(String),
    /// Regular expression object
    Regex,
    /// Plain object
    Object(BTreeMap<String, Value>),
}

impl Value {
    fn type_name(&self) -> &'static str {
        match self {
            Value::Undefined => "undefined",
            Value::Null => "null",
            Value::Bool(_) => "boolean",
            Value::Number(_) => "number",
            Value::Str(_) => "string",
            Value::Regex | Value::Object(_) => "object",
        }
    }

    fn truthy(&self) -> bool {
        match self {
            Value::Undefined | Value::Null => false,
            Value::Bool(b) => *b,
            Value::Number(n) => *n != 0.0 && !n.is_nan(),
            Value::Str(s) => !s.is_empty(),
            Value::Regex | Value::Object(_) => true,
        }
    }

    fn to_number(&self) -> f64 {
        match self {
            Value::Null => 0.0,
            Value::Bool(b) => f64::from(u8::from(*b)),
            Value::Number(n) => *n,
            Value::Str(s) => {
                let trimmed = s.trim();
                if trimmed.is_empty() {
                    0.0
                } else {
                    trimmed.parse().unwrap_or(f64::NAN)
                }
            }
            Value::Undefined | Value::Regex | Value::Object(_) => f64::NAN,
        }
    }

    fn to_js_string(&self) -> String {
        match self {
            Value::Undefined => "undefined".to_string(),
            Value::Null => "null".to_string(),
            Value::Bool(b) => b.to_string(),
            Value::Number(n) => format_number(*n),
            Value::Str(s) => s.clone(),
            Value::Regex => "[object RegExp]".to_string(),
            Value::Object(_) => "[object Object]".to_string(),
        }
    }
}

fn format_number(n: f64) -> String {
    if n.is_nan() {
        "NaN".to_string()
    } else if n.is_infinite() {
        if n > 0.0 { "Infinity" } else { "-Infinity" }.to_string()
    } else if n.fract() == 0.0 && n.abs() < 1e21 {
        format!("{}", n as i64)
    } else {
        format!("{}", n)
    }
}

fn string_map(map: &BTreeMap<String, String>) -> Value {
    Value::Object(
        map.iter()
            .map(|(k, v)| (k.clone(), Value::Str(v.clone())))
            .collect(),
    )
}

/// The `target` binding seen by expressions
pub fn target_binding(target: &ServiceRef) -> Value {
    let cryostat: BTreeMap<String, Value> = target
        .annotations
        .cryostat
        .iter()
        .map(|(k, v)| (k.as_str().to_string(), Value::Str(v.clone())))
        .collect();
    let annotations = BTreeMap::from([
        ("platform".to_string(), string_map(&target.annotations.platform)),
        ("cryostat".to_string(), Value::Object(cryostat)),
    ]);
    Value::Object(BTreeMap::from([
        ("connectUrl".to_string(), Value::Str(target.service_uri.clone())),
        ("jvmId".to_string(), Value::Str(target.jvm_id.clone())),
        (
            "alias".to_string(),
            target.alias.clone().map(Value::Str).unwrap_or(Value::Null),
        ),
        ("labels".to_string(), string_map(&target.labels)),
        ("annotations".to_string(), Value::Object(annotations)),
    ]))
}

fn loose_eq(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Null | Value::Undefined, Value::Null | Value::Undefined) => true,
        (Value::Null | Value::Undefined, _) | (_, Value::Null | Value::Undefined) => false,
        (Value::Number(x), Value::Number(y)) => x == y,
        (Value::Str(x), Value::Str(y)) => x == y,
        (Value::Bool(x), Value::Bool(y)) => x == y,
        (Value::Bool(_), _) => loose_eq(&Value::Number(a.to_number()), b),
        (_, Value::Bool(_)) => loose_eq(a, &Value::Number(b.to_number())),
        (Value::Number(x), Value::Str(_)) => *x == b.to_number(),
        (Value::Str(_), Value::Number(y)) => a.to_number() == *y,
        _ => false,
    }
}

fn strict_eq(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x == y,
        (Value::Object(_), Value::Object(_)) | (Value::Regex, Value::Regex) => false,
        _ => a == b,
    }
}

fn relational(a: &Value, b: &Value) -> Option<CmpOrdering> {
    if let (Value::Str(x), Value::Str(y)) = (a, b) {
        return Some(x.cmp(y));
    }
    a.to_number().partial_cmp(&b.to_number())
}

fn evaluation(message: String) -> anyhow::Error {
    CryostatError::Evaluation(message).into()
}

struct Interpreter<'a> {
    validated: &'a ValidatedExpression,
    root: Value,
}

impl<'a> Interpreter<'a> {
    fn eval(&self, expr: &Expr) -> Result<Value> {
        Ok(match expr {
            Expr::Null => Value::Null,
            Expr::Undefined => Value::Undefined,
            Expr::Bool(b) => Value::Bool(*b),
            Expr::Number(n) => Value::Number(*n),
            Expr::Str(s) => Value::Str(s.clone()),
            Expr::Regex { .. } => Value::Regex,
            Expr::Ident(_) | Expr::Member { .. } | Expr::Index { .. } => self.property(expr)?.into_owned(),
            Expr::Call { callee, args } => self.regex_test(callee, args)?,
            Expr::Unary { op, operand } => {
                let value = self.eval(operand)?;
                match op {
                    UnaryOp::Not => Value::Bool(!value.truthy()),
                    UnaryOp::Neg => Value::Number(-value.to_number()),
                    UnaryOp::Plus => Value::Number(value.to_number()),
                    other => return Err(evaluation(format!("unsupported operator {:?}", other))),
                }
            }
            Expr::Binary { op, left, right } => {
                let (l, r) = (self.eval(left)?, self.eval(right)?);
                Value::Bool(match op {
                    BinaryOp::Eq => loose_eq(&l, &r),
                    BinaryOp::NotEq => !loose_eq(&l, &r),
                    BinaryOp::StrictEq => strict_eq(&l, &r),
                    BinaryOp::StrictNotEq => !strict_eq(&l, &r),
                    BinaryOp::Lt => relational(&l, &r) == Some(CmpOrdering::Less),
                    BinaryOp::Gt => relational(&l, &r) == Some(CmpOrdering::Greater),
                    BinaryOp::LtEq => matches!(relational(&l, &r), Some(CmpOrdering::Less | CmpOrdering::Equal)),
                    BinaryOp::GtEq => {
                        matches!(relational(&l, &r), Some(CmpOrdering::Greater | CmpOrdering::Equal))
                    }
                    BinaryOp::Other(op) => return Err(evaluation(format!("unsupported operator {}", op))),
                })
            }
            Expr::Logical { op, left, right } => {
                let l = self.eval(left)?;
                match op {
                    LogicalOp::And if !l.truthy() => l,
                    LogicalOp::Or if l.truthy() => l,
                    LogicalOp::Coalesce if !matches!(l, Value::Null | Value::Undefined) => l,
                    _ => self.eval(right)?,
                }
            }
            other => return Err(evaluation(format!("unsupported construct {:?}", other))),
        })
    }

    fn property(&self, expr: &Expr) -> Result<Cow<'_, Value>> {
        match expr {
            Expr::Ident(name) if name == TARGET_BINDING => Ok(Cow::Borrowed(&self.root)),
            Expr::Ident(name) => Err(evaluation(format!("{} is not defined", name))),
            Expr::Member { object, property } => get_property(self.property(object)?, property),
            Expr::Index { object, index } => {
                let key = match index.as_ref() {
                    Expr::Str(s) => s.clone(),
                    Expr::Number(n) => format_number(*n),
                    _ => return Err(evaluation("computed keys must be literals".to_string())),
                };
                get_property(self.property(object)?, &key)
            }
            _ => Err(evaluation("not a property reference".to_string())),
        }
    }

    fn regex_test(&self, callee: &Expr, args: &[Expr]) -> Result<Value> {
        let Expr::Member { object, property } = callee else {
            return Err(evaluation("not a function".to_string()));
        };
        let (Expr::Regex { pattern, flags }, "test") = (object.as_ref(), property.as_str()) else {
            return Err(evaluation(format!("{} is not a function", property)));
        };
        let regex = self
            .validated
            .regex(pattern, flags)
            .ok_or_else(|| evaluation(format!("regular expression /{}/ was not compiled", pattern)))?;
        let input = match args.first() {
            Some(arg) => self.eval(arg)?.to_js_string(),
            None => "undefined".to_string(),
        };
        Ok(Value::Bool(regex.is_match(&input)))
    }
}

fn get_property<'v>(base: Cow<'v, Value>, key: &str) -> Result<Cow<'v, Value>> {
    match base {
        Cow::Borrowed(Value::Object(map)) => Ok(map
            .get(key)
            .map(Cow::Borrowed)
            .unwrap_or(Cow::Owned(Value::Undefined))),
        Cow::Owned(Value::Object(mut map)) => Ok(Cow::Owned(map.remove(key).unwrap_or(Value::Undefined))),
        other => match other.as_ref() {
            Value::Null | Value::Undefined => Err(evaluation(format!(
                "cannot read property '{}' of {}",
                key,
                other.type_name()
            ))),
            Value::Str(s) if key == "length" => Ok(Cow::Owned(Value::Number(s.encode_utf16().count() as f64))),
            _ => Ok(Cow::Owned(Value::Undefined)),
        },
    }
}

/// Evaluates a validated expression against a target
///
/// # Errors
///
/// Returns `CryostatError::Evaluation` when evaluation fails or yields
/// anything other than a boolean.
pub fn evaluate(validated: &ValidatedExpression, target: &ServiceRef) -> Result<bool> {
    let interpreter = Interpreter {
        validated,
        root: target_binding(target),
    };
    match interpreter.eval(validated.root())? {
        Value::Bool(b) => Ok(b),
        Value::Null | Value::Undefined => Err(evaluation(format!(
            "expression '{}' evaluated to null",
            validated.source()
        ))),
        other => Err(evaluation(format!(
            "expression '{}' evaluated to a {}, not a boolean",
            validated.source(),
            other.type_name()
        ))),
    }
}

/// Target used to surface evaluation errors during validation
pub fn dummy_target() -> ServiceRef {
    ServiceRef::new(jmx_service_url("localhost", 0))
        .with_alias("dummy")
        .with_jvm_id("dummy-jvm-id")
        .with_cryostat_annotation(AnnotationKey::Host, "localhost")
        .with_cryostat_annotation(AnnotationKey::Port, "0")
}

/// Caching evaluator of match expressions
///
/// Results are cached per `(expression text, target)`; errors are never
/// cached.
pub struct MatchExpressionEvaluator {
    validator: MatchExpressionValidator,
    cache: Mutex<LruCache<(String, ServiceRef), bool>>,
    evaluations: AtomicU64,
}

impl MatchExpressionEvaluator {
    /// Creates an evaluator caching up to `capacity` results
    pub fn new(capacity: usize) -> Self {
        Self {
            validator: MatchExpressionValidator::new(),
            cache: Mutex::new(LruCache::new(capacity)),
            evaluations: AtomicU64::new(0),
        }
    }

    /// Whether `expression` holds for `target`
    ///
    /// # Errors
    ///
    /// Returns `CryostatError::IllegalExpression` when the expression fails
    /// validation, or `CryostatError::Evaluation` when it fails at run time
    /// or yields a non-boolean.
    pub fn applies(&self, expression: &str, target: &ServiceRef) -> Result<bool> {
        let key = (expression.to_string(), target.clone());
        if let Some(hit) = self.lock().get(&key) {
            trace!(expression, target = %target, result = *hit, "Match expression cache hit");
            return Ok(*hit);
        }
        let result = self.evaluate_uncached(expression, target)?;
        self.lock().put(key, result);
        Ok(result)
    }

    /// Validates statically, then evaluates once against a dummy target
    ///
    /// # Errors
    ///
    /// Returns the validation or evaluation error.
    pub fn validate(&self, expression: &str) -> Result<()> {
        let validated = self.validator.validate(expression)?;
        evaluate(&validated, &dummy_target()).map(|_| ())
    }

    /// Drops every cached result for an expression text
    pub fn invalidate(&self, expression: &str) {
        let mut cache = self.lock();
        let before = cache.len();
        cache.retain(|(expr, _)| expr != expression);
        debug!(expression, evicted = before - cache.len(), "Match expression cache invalidated");
    }

    /// Number of evaluations that missed the cache
    pub fn evaluation_count(&self) -> u64 {
        self.evaluations.load(Ordering::SeqCst)
    }

    /// Number of cached results
    pub fn cached_entries(&self) -> usize {
        self.lock().len()
    }

    fn evaluate_uncached(&self, expression: &str, target: &ServiceRef) -> Result<bool> {
        let validated = self.validator.validate(expression)?;
        self.evaluations.fetch_add(1, Ordering::SeqCst);
        evaluate(&validated, target)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LruCache<(String, ServiceRef), bool>> {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for MatchExpressionEvaluator {
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_CAPACITY)
    }
}
