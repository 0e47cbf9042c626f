//! Conversions between document values and interpreter vector elements.
//!
//! Going out to the interpreter, each declared element type accepts a small
//! ladder of document value types:
//!
//! | Target | Accepts |
//! |--------|---------|
//! | logical | boolean, or a string `true`/`false`/`1`/`0` |
//! | integer | boolean (1/0), integer, double (truncated toward zero), numeric string |
//! | double | boolean, integer, double, numeric string |
//! | character | string only |
//!
//! A document-null always becomes the interpreter's missing marker.

use thiserror::Error;

use crate::tree::Scalar;
use crate::value::{RData, RValue, ScalarKind};

#[derive(Debug, Error, Clone, PartialEq)]
#[error("cannot convert {} value '{value}' to {kind}", value.type_name())]
pub struct CoerceError {
    pub kind: ScalarKind,
    pub value: Scalar,
}

fn parse_bool(s: &str) -> Option<bool> {
    match s.trim() {
        "true" | "1" => Some(true),
        "false" | "0" => Some(false),
        _ => None,
    }
}

fn parse_double(s: &str) -> Option<f64> {
    match s.trim() {
        "INF" => Some(f64::INFINITY),
        "-INF" => Some(f64::NEG_INFINITY),
        t => t.parse().ok(),
    }
}

fn to_logical(v: &Scalar) -> Option<bool> {
    match v {
        Scalar::Bool(b) => Some(*b),
        Scalar::Str(s) => parse_bool(s),
        _ => None,
    }
}

fn to_integer(v: &Scalar) -> Option<i32> {
    match v {
        Scalar::Bool(b) => Some(i32::from(*b)),
        Scalar::Int(n) => i32::try_from(*n).ok(),
        Scalar::Double(x) => {
            let t = x.trunc();
            (t.is_finite() && t >= f64::from(i32::MIN) && t <= f64::from(i32::MAX))
                .then_some(t as i32)
        }
        Scalar::Str(s) => s.trim().parse().ok(),
    }
}

fn to_double(v: &Scalar) -> Option<f64> {
    match v {
        Scalar::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        Scalar::Int(n) => Some(*n as f64),
        Scalar::Double(x) => Some(*x),
        Scalar::Str(s) => parse_double(s),
    }
}

fn to_character(v: &Scalar) -> Option<String> {
    match v {
        Scalar::Str(s) => Some(s.clone()),
        _ => None,
    }
}

// ── VectorBuilder ─────────────────────────────────────────────────────────────

enum Elements {
    Logical(Vec<Option<bool>>),
    Integer(Vec<Option<i32>>),
    Double(Vec<Option<f64>>),
    Character(Vec<Option<String>>),
}

/// Accumulates document values into one typed interpreter vector.
pub struct VectorBuilder {
    elements: Elements,
}

impl VectorBuilder {
    pub fn new(kind: ScalarKind, capacity: usize) -> Self {
        let elements = match kind {
            ScalarKind::Logical => Elements::Logical(Vec::with_capacity(capacity)),
            ScalarKind::Integer => Elements::Integer(Vec::with_capacity(capacity)),
            ScalarKind::Double => Elements::Double(Vec::with_capacity(capacity)),
            ScalarKind::Character => Elements::Character(Vec::with_capacity(capacity)),
        };
        Self { elements }
    }

    pub fn kind(&self) -> ScalarKind {
        match self.elements {
            Elements::Logical(_) => ScalarKind::Logical,
            Elements::Integer(_) => ScalarKind::Integer,
            Elements::Double(_) => ScalarKind::Double,
            Elements::Character(_) => ScalarKind::Character,
        }
    }

    /// Append one value; `None` appends a missing marker.
    pub fn push(&mut self, value: Option<&Scalar>) -> Result<(), CoerceError> {
        let kind = self.kind();
        let fail = |v: &Scalar| CoerceError { kind, value: v.clone() };
        match &mut self.elements {
            Elements::Logical(out) => {
                out.push(value.map(|v| to_logical(v).ok_or_else(|| fail(v))).transpose()?)
            }
            Elements::Integer(out) => {
                out.push(value.map(|v| to_integer(v).ok_or_else(|| fail(v))).transpose()?)
            }
            Elements::Double(out) => {
                out.push(value.map(|v| to_double(v).ok_or_else(|| fail(v))).transpose()?)
            }
            Elements::Character(out) => {
                out.push(value.map(|v| to_character(v).ok_or_else(|| fail(v))).transpose()?)
            }
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        match &self.elements {
            Elements::Logical(v) => v.len(),
            Elements::Integer(v) => v.len(),
            Elements::Double(v) => v.len(),
            Elements::Character(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn finish(self) -> RValue {
        match self.elements {
            Elements::Logical(v) => RValue::logical(v),
            Elements::Integer(v) => RValue::integer(v),
            Elements::Double(v) => RValue::double(v),
            Elements::Character(v) => RValue::character(v),
        }
    }
}

// ── Interpreter → document ────────────────────────────────────────────────────

/// Element `index` of an atomic vector as a document value.
///
/// Returns `None` for a missing marker, for an index past the end, and for
/// non-atomic values.
pub fn scalar_at(value: &RValue, index: usize) -> Option<Scalar> {
    match &value.data {
        RData::Logical(v) => v.get(index).copied().flatten().map(Scalar::Bool),
        RData::Integer(v) => v.get(index).copied().flatten().map(|n| Scalar::Int(i64::from(n))),
        RData::Double(v) => v.get(index).copied().flatten().map(Scalar::Double),
        RData::Character(v) => v.get(index).cloned().flatten().map(Scalar::Str),
        _ => None,
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
