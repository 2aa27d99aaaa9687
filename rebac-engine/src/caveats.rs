//! Opaque caveat predicate module and the boolean algebra the engine
//! builds over caveat references.
//!
//! The engine never inspects predicate internals beyond this module's
//! surface: deserialize, evaluate against a context, render the canonical
//! string form, and serialize back to bytes.

use chrono::DateTime;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

use crate::error::{EngineError, Result};
use crate::tuple::CaveatReference;

/// Canonical caveat parameter types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParameterType {
    Int,
    Uint,
    Bool,
    String,
    Double,
    Timestamp,
    IpAddress,
}

impl ParameterType {
    pub fn canonical(&self) -> &'static str {
        match self {
            ParameterType::Int => "int",
            ParameterType::Uint => "uint",
            ParameterType::Bool => "bool",
            ParameterType::String => "string",
            ParameterType::Double => "double",
            ParameterType::Timestamp => "timestamp",
            ParameterType::IpAddress => "ipaddress",
        }
    }

    pub fn from_canonical(name: &str) -> Option<Self> {
        match name {
            "int" => Some(ParameterType::Int),
            "uint" => Some(ParameterType::Uint),
            "bool" => Some(ParameterType::Bool),
            "string" => Some(ParameterType::String),
            "double" => Some(ParameterType::Double),
            "timestamp" => Some(ParameterType::Timestamp),
            "ipaddress" => Some(ParameterType::IpAddress),
            _ => None,
        }
    }

    /// Lightweight check that a context value is usable for this type.
    pub fn matches(&self, value: &Value) -> bool {
        match self {
            ParameterType::Int => value.is_i64(),
            ParameterType::Uint => value.is_u64(),
            ParameterType::Bool => value.is_boolean(),
            ParameterType::String => value.is_string(),
            ParameterType::Double => value.is_number(),
            ParameterType::Timestamp => value
                .as_str()
                .map(|s| DateTime::parse_from_rfc3339(s).is_ok())
                .unwrap_or(false),
            ParameterType::IpAddress => value
                .as_str()
                .map(|s| s.parse::<std::net::IpAddr>().is_ok())
                .unwrap_or(false),
        }
    }
}

impl fmt::Display for ParameterType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.canonical())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl CompareOp {
    fn symbol(&self) -> &'static str {
        match self {
            CompareOp::Eq => "==",
            CompareOp::Ne => "!=",
            CompareOp::Lt => "<",
            CompareOp::Le => "<=",
            CompareOp::Gt => ">",
            CompareOp::Ge => ">=",
        }
    }
}

/// The serialized expression body of a caveat definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Predicate {
    Param(String),
    Literal(Value),
    Compare {
        op: CompareOp,
        left: Box<Predicate>,
        right: Box<Predicate>,
    },
    And(Box<Predicate>, Box<Predicate>),
    Or(Box<Predicate>, Box<Predicate>),
    Not(Box<Predicate>),
}

/// Tri-state outcome of evaluating a predicate: missing parameters leave
/// a residual predicate rather than a verdict.
#[derive(Debug, Clone, PartialEq)]
pub enum Evaluation {
    True,
    False,
    Partial(Predicate),
}

impl Predicate {
    pub fn param(name: &str) -> Self {
        Predicate::Param(name.to_string())
    }

    pub fn literal(value: Value) -> Self {
        Predicate::Literal(value)
    }

    pub fn compare(op: CompareOp, left: Predicate, right: Predicate) -> Self {
        Predicate::Compare {
            op,
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    pub fn and(left: Predicate, right: Predicate) -> Self {
        Predicate::And(Box::new(left), Box::new(right))
    }

    pub fn or(left: Predicate, right: Predicate) -> Self {
        Predicate::Or(Box::new(left), Box::new(right))
    }

    pub fn negate(inner: Predicate) -> Self {
        Predicate::Not(Box::new(inner))
    }

    pub fn serialize(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn deserialize(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }

    /// Evaluates against the context. Parameters absent from the context
    /// produce `Partial` carrying the unevaluated residual.
    pub fn evaluate(&self, context: &Map<String, Value>) -> Result<Evaluation> {
        match self {
            Predicate::Param(name) => match context.get(name) {
                Some(Value::Bool(b)) => Ok(truth(*b)),
                Some(other) => Err(EngineError::InvalidArgument(format!(
                    "caveat parameter `{name}` is not a boolean: {other}"
                ))),
                None => Ok(Evaluation::Partial(self.clone())),
            },
            Predicate::Literal(Value::Bool(b)) => Ok(truth(*b)),
            Predicate::Literal(other) => Err(EngineError::InvalidArgument(format!(
                "caveat literal is not a boolean: {other}"
            ))),
            Predicate::Compare { op, left, right } => {
                let lhs = resolve_operand(left, context)?;
                let rhs = resolve_operand(right, context)?;
                match (lhs, rhs) {
                    (Some(l), Some(r)) => Ok(truth(compare_values(*op, &l, &r)?)),
                    _ => Ok(Evaluation::Partial(self.clone())),
                }
            }
            Predicate::And(left, right) => {
                match (left.evaluate(context)?, right.evaluate(context)?) {
                    (Evaluation::False, _) | (_, Evaluation::False) => Ok(Evaluation::False),
                    (Evaluation::True, Evaluation::True) => Ok(Evaluation::True),
                    (Evaluation::True, Evaluation::Partial(p))
                    | (Evaluation::Partial(p), Evaluation::True) => Ok(Evaluation::Partial(p)),
                    (Evaluation::Partial(p), Evaluation::Partial(q)) => {
                        Ok(Evaluation::Partial(Predicate::and(p, q)))
                    }
                }
            }
            Predicate::Or(left, right) => {
                match (left.evaluate(context)?, right.evaluate(context)?) {
                    (Evaluation::True, _) | (_, Evaluation::True) => Ok(Evaluation::True),
                    (Evaluation::False, Evaluation::False) => Ok(Evaluation::False),
                    (Evaluation::False, Evaluation::Partial(p))
                    | (Evaluation::Partial(p), Evaluation::False) => Ok(Evaluation::Partial(p)),
                    (Evaluation::Partial(p), Evaluation::Partial(q)) => {
                        Ok(Evaluation::Partial(Predicate::or(p, q)))
                    }
                }
            }
            Predicate::Not(inner) => match inner.evaluate(context)? {
                Evaluation::True => Ok(Evaluation::False),
                Evaluation::False => Ok(Evaluation::True),
                Evaluation::Partial(p) => Ok(Evaluation::Partial(Predicate::negate(p))),
            },
        }
    }

    /// Canonical text form used by the schema generator.
    pub fn expr_string(&self) -> String {
        self.render(Precedence::Or)
    }

    fn precedence(&self) -> Precedence {
        match self {
            Predicate::Or(..) => Precedence::Or,
            Predicate::And(..) => Precedence::And,
            Predicate::Not(..) => Precedence::Not,
            Predicate::Compare { .. } => Precedence::Compare,
            Predicate::Param(_) | Predicate::Literal(_) => Precedence::Atom,
        }
    }

    fn render(&self, required: Precedence) -> String {
        let rendered = match self {
            Predicate::Param(name) => name.clone(),
            Predicate::Literal(value) => value.to_string(),
            Predicate::Compare { op, left, right } => format!(
                "{} {} {}",
                left.render(Precedence::Atom),
                op.symbol(),
                right.render(Precedence::Atom)
            ),
            Predicate::And(left, right) => format!(
                "{} && {}",
                left.render(Precedence::And),
                right.render(Precedence::And)
            ),
            Predicate::Or(left, right) => format!(
                "{} || {}",
                left.render(Precedence::Or),
                right.render(Precedence::Or)
            ),
            Predicate::Not(inner) => format!("!{}", inner.render(Precedence::Atom)),
        };
        if (self.precedence() as u8) < (required as u8) {
            format!("({rendered})")
        } else {
            rendered
        }
    }
}

#[derive(Clone, Copy)]
enum Precedence {
    Or = 1,
    And = 2,
    Not = 3,
    Compare = 4,
    Atom = 5,
}

fn truth(value: bool) -> Evaluation {
    if value {
        Evaluation::True
    } else {
        Evaluation::False
    }
}

fn resolve_operand(predicate: &Predicate, context: &Map<String, Value>) -> Result<Option<Value>> {
    match predicate {
        Predicate::Param(name) => Ok(context.get(name).cloned()),
        Predicate::Literal(value) => Ok(Some(value.clone())),
        other => Err(EngineError::InvalidArgument(format!(
            "caveat comparison operand is not a value: {}",
            other.expr_string()
        ))),
    }
}

fn compare_values(op: CompareOp, left: &Value, right: &Value) -> Result<bool> {
    if let (Some(l), Some(r)) = (left.as_f64(), right.as_f64()) {
        return Ok(apply_ordering(op, l.partial_cmp(&r)));
    }
    if let (Some(l), Some(r)) = (left.as_str(), right.as_str()) {
        if let (Ok(lt), Ok(rt)) = (
            DateTime::parse_from_rfc3339(l),
            DateTime::parse_from_rfc3339(r),
        ) {
            return Ok(apply_ordering(op, lt.partial_cmp(&rt)));
        }
        return Ok(apply_ordering(op, l.partial_cmp(r)));
    }
    match op {
        CompareOp::Eq => Ok(left == right),
        CompareOp::Ne => Ok(left != right),
        _ => Err(EngineError::InvalidArgument(format!(
            "cannot order caveat values {left} and {right}"
        ))),
    }
}

fn apply_ordering(op: CompareOp, ordering: Option<std::cmp::Ordering>) -> bool {
    use std::cmp::Ordering::*;
    match (op, ordering) {
        (CompareOp::Eq, Some(Equal)) => true,
        (CompareOp::Ne, Some(Equal)) => false,
        (CompareOp::Ne, Some(_)) => true,
        (CompareOp::Lt, Some(Less)) => true,
        (CompareOp::Le, Some(Less | Equal)) => true,
        (CompareOp::Gt, Some(Greater)) => true,
        (CompareOp::Ge, Some(Greater | Equal)) => true,
        _ => false,
    }
}

/// Boolean combination over caveat references, attached to conditional
/// subject-set members. Absence (`None` throughout the engine) means
/// unconditional membership.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CaveatExpression {
    Caveat(CaveatReference),
    And(Box<CaveatExpression>, Box<CaveatExpression>),
    Or(Box<CaveatExpression>, Box<CaveatExpression>),
    Not(Box<CaveatExpression>),
}

impl CaveatExpression {
    pub fn caveat(reference: CaveatReference) -> Self {
        CaveatExpression::Caveat(reference)
    }

    pub fn and(left: CaveatExpression, right: CaveatExpression) -> Self {
        CaveatExpression::And(Box::new(left), Box::new(right))
    }

    pub fn or(left: CaveatExpression, right: CaveatExpression) -> Self {
        CaveatExpression::Or(Box::new(left), Box::new(right))
    }

    pub fn negate(inner: CaveatExpression) -> Self {
        CaveatExpression::Not(Box::new(inner))
    }
}

/// Conjunction where `None` is unconditional: the conditional side wins.
pub fn caveat_and(
    left: Option<CaveatExpression>,
    right: Option<CaveatExpression>,
) -> Option<CaveatExpression> {
    match (left, right) {
        (None, right) => right,
        (left, None) => left,
        (Some(l), Some(r)) => Some(CaveatExpression::and(l, r)),
    }
}

/// Disjunction where `None` is unconditional: it absorbs the other side.
pub fn caveat_or(
    left: Option<CaveatExpression>,
    right: Option<CaveatExpression>,
) -> Option<CaveatExpression> {
    match (left, right) {
        (None, _) | (_, None) => None,
        (Some(l), Some(r)) => Some(CaveatExpression::or(l, r)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn context(entries: &[(&str, Value)]) -> Map<String, Value> {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_compare_evaluation() {
        let predicate = Predicate::compare(
            CompareOp::Le,
            Predicate::param("size"),
            Predicate::param("max_size"),
        );

        let ctx = context(&[("size", json!(4)), ("max_size", json!(10))]);
        assert_eq!(predicate.evaluate(&ctx).unwrap(), Evaluation::True);

        let ctx = context(&[("size", json!(40)), ("max_size", json!(10))]);
        assert_eq!(predicate.evaluate(&ctx).unwrap(), Evaluation::False);
    }

    #[test]
    fn test_missing_parameter_is_partial() {
        let predicate = Predicate::and(
            Predicate::param("admitted"),
            Predicate::compare(
                CompareOp::Eq,
                Predicate::param("region"),
                Predicate::literal(json!("eu")),
            ),
        );
        let ctx = context(&[("admitted", json!(true))]);
        match predicate.evaluate(&ctx).unwrap() {
            Evaluation::Partial(residual) => {
                assert_eq!(residual.expr_string(), "region == \"eu\"");
            }
            other => panic!("expected partial, got {other:?}"),
        }
    }

    #[test]
    fn test_and_short_circuits_on_false() {
        let predicate = Predicate::and(Predicate::param("missing"), Predicate::param("enabled"));
        let ctx = context(&[("enabled", json!(false))]);
        assert_eq!(predicate.evaluate(&ctx).unwrap(), Evaluation::False);
    }

    #[test]
    fn test_timestamp_ordering() {
        let predicate = Predicate::compare(
            CompareOp::Lt,
            Predicate::param("now"),
            Predicate::param("expires_at"),
        );
        let ctx = context(&[
            ("now", json!("2024-03-01T10:00:00Z")),
            ("expires_at", json!("2024-03-02T00:00:00Z")),
        ]);
        assert_eq!(predicate.evaluate(&ctx).unwrap(), Evaluation::True);
    }

    #[test]
    fn test_expr_string_precedence() {
        let predicate = Predicate::and(
            Predicate::or(Predicate::param("a"), Predicate::param("b")),
            Predicate::negate(Predicate::param("c")),
        );
        assert_eq!(predicate.expr_string(), "(a || b) && !c");
    }

    #[test]
    fn test_serialization_round_trip() {
        let predicate = Predicate::compare(
            CompareOp::Ge,
            Predicate::param("count"),
            Predicate::literal(json!(3)),
        );
        let bytes = predicate.serialize().unwrap();
        assert_eq!(Predicate::deserialize(&bytes).unwrap(), predicate);
    }

    #[test]
    fn test_caveat_combinators_absorb_unconditional() {
        let reference = CaveatReference::new("tagged", Map::new());
        let expr = CaveatExpression::caveat(reference);
        assert_eq!(caveat_or(None, Some(expr.clone())), None);
        assert_eq!(caveat_and(None, Some(expr.clone())), Some(expr.clone()));
        assert_eq!(caveat_and(Some(expr.clone()), None), Some(expr));
    }
}
