//! Interpreter-side value model.
//!
//! Mirrors the object shapes that cross the wire to the interpreter: typed
//! vectors whose elements may be missing (`NA`), raw byte vectors, generic
//! lists, and an attribute pairlist that can hang off any of them.  A table
//! ("data frame") is a generic list of equal-length columns tagged with the
//! `data.frame` class.

use std::fmt;

// ── ScalarKind ────────────────────────────────────────────────────────────────

/// The four element types a vector binding or table column may carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScalarKind {
    Logical,
    Integer,
    Double,
    Character,
}

impl ScalarKind {
    pub fn name(self) -> &'static str {
        match self {
            ScalarKind::Logical => "logical",
            ScalarKind::Integer => "integer",
            ScalarKind::Double => "double",
            ScalarKind::Character => "character",
        }
    }
}

impl fmt::Display for ScalarKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ── RData / RValue ────────────────────────────────────────────────────────────

/// Payload of an interpreter value.  `None` elements are missing markers.
#[derive(Debug, Clone, PartialEq)]
pub enum RData {
    Null,
    Logical(Vec<Option<bool>>),
    Integer(Vec<Option<i32>>),
    Double(Vec<Option<f64>>),
    Character(Vec<Option<String>>),
    Raw(Vec<u8>),
    /// Generic vector (also the carrier for data frames).
    List(Vec<RValue>),
    /// A single symbol name, as used for pairlist tags.
    Symbol(String),
    /// Anything the codec does not model; holds the wire type code.
    Other(u8),
}

/// An interpreter value plus its attributes, in wire order.
#[derive(Debug, Clone, PartialEq)]
pub struct RValue {
    pub data: RData,
    pub attrs: Vec<(String, RValue)>,
}

impl From<RData> for RValue {
    fn from(data: RData) -> Self {
        Self { data, attrs: Vec::new() }
    }
}

impl RValue {
    pub fn null() -> Self {
        RData::Null.into()
    }

    pub fn logical(values: Vec<Option<bool>>) -> Self {
        RData::Logical(values).into()
    }

    pub fn integer(values: Vec<Option<i32>>) -> Self {
        RData::Integer(values).into()
    }

    pub fn double(values: Vec<Option<f64>>) -> Self {
        RData::Double(values).into()
    }

    pub fn character(values: Vec<Option<String>>) -> Self {
        RData::Character(values).into()
    }

    /// A character vector with no missing elements.
    pub fn strings<I, S>(values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        RData::Character(values.into_iter().map(|s| Some(s.into())).collect()).into()
    }

    pub fn raw(bytes: Vec<u8>) -> Self {
        RData::Raw(bytes).into()
    }

    /// Build a data frame from named columns, in order.
    ///
    /// The row count is taken from the first column; callers are expected
    /// to supply equal-length columns.
    pub fn data_frame(columns: Vec<(String, RValue)>) -> Self {
        let rows = columns.first().map(|(_, c)| c.len()).unwrap_or(0);
        let names: Vec<String> = columns.iter().map(|(n, _)| n.clone()).collect();
        let values: Vec<RValue> = columns.into_iter().map(|(_, c)| c).collect();
        let row_names = RValue::integer(vec![None, Some(compact_row_count(rows))]);
        RValue::from(RData::List(values))
            .with_attr("class", RValue::strings(["data.frame"]))
            .with_attr("names", RValue::strings(names))
            .with_attr("row.names", row_names)
    }

    pub fn with_attr(mut self, name: impl Into<String>, value: RValue) -> Self {
        self.attrs.push((name.into(), value));
        self
    }

    pub fn attr(&self, name: &str) -> Option<&RValue> {
        self.attrs.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }

    /// Values of the `class` attribute (empty if unset).
    pub fn class(&self) -> Vec<&str> {
        match self.attr("class").map(|c| &c.data) {
            Some(RData::Character(cs)) => cs.iter().flatten().map(String::as_str).collect(),
            _ => Vec::new(),
        }
    }

    pub fn inherits(&self, class: &str) -> bool {
        self.class().contains(&class)
    }

    /// Values of the `names` attribute (empty if unset).
    pub fn names(&self) -> Vec<Option<&str>> {
        match self.attr("names").map(|n| &n.data) {
            Some(RData::Character(ns)) => ns.iter().map(|n| n.as_deref()).collect(),
            _ => Vec::new(),
        }
    }

    pub fn is_data_frame(&self) -> bool {
        matches!(self.data, RData::List(_)) && self.inherits("data.frame")
    }

    /// Look up a list element (data frame column) by name.
    pub fn column(&self, name: &str) -> Option<&RValue> {
        let RData::List(items) = &self.data else { return None };
        self.names()
            .iter()
            .position(|n| *n == Some(name))
            .and_then(|i| items.get(i))
    }

    /// Number of elements.
    pub fn len(&self) -> usize {
        match &self.data {
            RData::Null | RData::Other(_) => 0,
            RData::Symbol(_) => 1,
            RData::Logical(v) => v.len(),
            RData::Integer(v) => v.len(),
            RData::Double(v) => v.len(),
            RData::Character(v) => v.len(),
            RData::Raw(v) => v.len(),
            RData::List(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The element kind, for the four atomic vector types only.
    pub fn kind(&self) -> Option<ScalarKind> {
        match &self.data {
            RData::Logical(_) => Some(ScalarKind::Logical),
            RData::Integer(_) => Some(ScalarKind::Integer),
            RData::Double(_) => Some(ScalarKind::Double),
            RData::Character(_) => Some(ScalarKind::Character),
            _ => None,
        }
    }

    /// Short description of the value's type, for diagnostics.
    pub fn type_name(&self) -> String {
        match &self.data {
            RData::Null => "NULL".to_owned(),
            RData::Raw(_) => "raw".to_owned(),
            RData::List(_) if self.is_data_frame() => "data.frame".to_owned(),
            RData::List(_) => "list".to_owned(),
            RData::Symbol(_) => "symbol".to_owned(),
            RData::Other(code) => format!("unsupported (type {code})"),
            _ => self.kind().map(|k| k.name().to_owned()).unwrap_or_default(),
        }
    }

    /// First element of a character vector, if any.
    pub fn as_string(&self) -> Option<&str> {
        match &self.data {
            RData::Character(v) => v.first().and_then(|s| s.as_deref()),
            RData::Symbol(s) => Some(s),
            _ => None,
        }
    }
}

/// Second element of compact row names, `c(NA, -rows)`.  R caps row counts
/// at `i32::MAX`, so larger counts saturate.
fn compact_row_count(rows: usize) -> i32 {
    i32::try_from(rows).map_or(-i32::MAX, |n| -n)
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compact_row_count_saturates() {
        assert_eq!(compact_row_count(0), 0);
        assert_eq!(compact_row_count(3), -3);
        assert_eq!(compact_row_count(i32::MAX as usize), -i32::MAX);
        assert_eq!(compact_row_count(usize::MAX), -i32::MAX);
    }

    #[test]
    fn data_frame_attributes() {
        let df = RValue::data_frame(vec![
            ("id".into(), RValue::integer(vec![Some(1), Some(2), Some(3)])),
            ("name".into(), RValue::strings(["a", "b", "c"])),
        ]);
        assert!(df.is_data_frame());
        assert_eq!(df.names(), [Some("id"), Some("name")]);
        assert_eq!(
            df.attr("row.names"),
            Some(&RValue::integer(vec![None, Some(-3)]))
        );
        assert_eq!(df.column("name").map(RValue::len), Some(3));
        assert!(df.column("missing").is_none());
    }

    #[test]
    fn plain_list_is_not_data_frame() {
        let l = RValue::from(RData::List(vec![RValue::integer(vec![Some(1)])]));
        assert!(!l.is_data_frame());
        assert_eq!(l.type_name(), "list");
    }

    #[test]
    fn class_and_inherits() {
        let v = RValue::strings(["Error in foo()"])
            .with_attr("class", RValue::strings(["try-error"]));
        assert!(v.inherits("try-error"));
        assert!(!v.inherits("data.frame"));
        assert_eq!(v.as_string(), Some("Error in foo()"));
    }

    #[test]
    fn kind_of_atomic_vectors() {
        assert_eq!(RValue::logical(vec![None]).kind(), Some(ScalarKind::Logical));
        assert_eq!(RValue::double(vec![]).kind(), Some(ScalarKind::Double));
        assert_eq!(RValue::raw(vec![1, 2]).kind(), None);
        assert_eq!(RValue::from(RData::Other(7)).type_name(), "unsupported (type 7)");
    }
}
