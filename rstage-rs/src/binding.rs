//! Parameter bindings: which values move between the message and the
//! interpreter, in which direction, and where they live in the message.
//!
//! A binding is either a scalar (a typed vector bound to one path) or a
//! table whose columns are scalars bound to paths relative to each row
//! element.  Tables never nest; the sum type makes that unrepresentable
//! once the rows have been resolved.

use std::collections::HashSet;
use std::fmt;

use crate::error::ConfigurationError;
use crate::path::{NamespaceBindings, PathExpr};
use crate::value::ScalarKind;

// ── Direction / type tokens ───────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    In,
    Out,
    InOut,
}

impl Direction {
    pub fn parse(token: &str) -> Option<Self> {
        match token.to_ascii_uppercase().as_str() {
            "IN" => Some(Direction::In),
            "OUT" => Some(Direction::Out),
            "INOUT" => Some(Direction::InOut),
            _ => None,
        }
    }

    /// True if values flow from the message to the interpreter.
    pub fn is_in(self) -> bool {
        matches!(self, Direction::In | Direction::InOut)
    }

    /// True if values flow from the interpreter back to the message.
    pub fn is_out(self) -> bool {
        matches!(self, Direction::Out | Direction::InOut)
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Direction::In => "IN",
            Direction::Out => "OUT",
            Direction::InOut => "INOUT",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamType {
    Scalar(ScalarKind),
    Table,
}

impl ParamType {
    /// Parse a type token.  An `R_` prefix is optional; case is ignored.
    pub fn parse(token: &str) -> Option<Self> {
        let upper = token.to_ascii_uppercase();
        let bare = upper.strip_prefix("R_").unwrap_or(&upper);
        match bare {
            "LOGICAL" => Some(ParamType::Scalar(ScalarKind::Logical)),
            "INTEGER" => Some(ParamType::Scalar(ScalarKind::Integer)),
            "DOUBLE" => Some(ParamType::Scalar(ScalarKind::Double)),
            "CHARACTER" => Some(ParamType::Scalar(ScalarKind::Character)),
            "DATA_FRAME" | "TABLE" => Some(ParamType::Table),
            _ => None,
        }
    }
}

// ── Parameter rows ────────────────────────────────────────────────────────────

/// One unvalidated row of the parameter table, as read from configuration.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ParamRow {
    /// Owning table for a column row; `None` for a scalar or table row.
    pub table: Option<String>,
    pub name: String,
    pub type_token: String,
    pub direction_token: String,
    pub path: String,
}

// ── Resolved bindings ─────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ScalarBinding {
    pub name: String,
    pub kind: ScalarKind,
    pub direction: Direction,
    pub path: PathExpr,
}

#[derive(Debug, Clone)]
pub struct ColumnBinding {
    pub name: String,
    pub kind: ScalarKind,
    pub direction: Direction,
    /// Evaluated with each row element as the context.
    pub path: PathExpr,
}

#[derive(Debug, Clone)]
pub struct TableBinding {
    pub name: String,
    /// Selects the repeating row elements.
    pub path: PathExpr,
    pub columns: Vec<ColumnBinding>,
}

impl TableBinding {
    pub fn in_columns(&self) -> impl Iterator<Item = &ColumnBinding> {
        self.columns.iter().filter(|c| c.direction.is_in())
    }

    pub fn out_columns(&self) -> impl Iterator<Item = &ColumnBinding> {
        self.columns.iter().filter(|c| c.direction.is_out())
    }

    pub fn has_in(&self) -> bool {
        self.in_columns().next().is_some()
    }

    pub fn has_out(&self) -> bool {
        self.out_columns().next().is_some()
    }
}

#[derive(Debug, Clone)]
pub enum Binding {
    Scalar(ScalarBinding),
    Table(TableBinding),
}

/// All bindings of one node, in declaration order.
#[derive(Debug, Clone, Default)]
pub struct BindingSet {
    bindings: Vec<Binding>,
}

struct Checked {
    name: String,
    ty: ParamType,
    direction: Direction,
    path: PathExpr,
}

fn check_row(row: &ParamRow, namespaces: &NamespaceBindings) -> Result<Checked, ConfigurationError> {
    let name = row.name.trim();
    if name.is_empty() {
        return Err(ConfigurationError::EmptyName);
    }
    let ty = ParamType::parse(&row.type_token).ok_or_else(|| ConfigurationError::BadType {
        name: name.to_owned(),
        token: row.type_token.clone(),
    })?;
    let direction =
        Direction::parse(&row.direction_token).ok_or_else(|| ConfigurationError::BadDirection {
            name: name.to_owned(),
            token: row.direction_token.clone(),
        })?;
    if row.path.trim().is_empty() {
        return Err(ConfigurationError::EmptyPath(name.to_owned()));
    }
    let path = PathExpr::compile(row.path.trim(), namespaces)
        .map_err(|source| ConfigurationError::BadPath { name: name.to_owned(), source })?;
    Ok(Checked { name: name.to_owned(), ty, direction, path })
}

impl BindingSet {
    /// Validate parameter rows and group columns under their tables.
    ///
    /// Columns may appear before or after the row declaring their table.
    pub fn resolve(rows: &[ParamRow], namespaces: &NamespaceBindings) -> Result<Self, ConfigurationError> {
        let mut bindings = Vec::new();
        let mut variables = HashSet::new();
        let mut tables = HashSet::new();

        for row in rows.iter().filter(|r| r.table.is_none()) {
            let c = check_row(row, namespaces)?;
            match c.ty {
                ParamType::Table => {
                    if !tables.insert(c.name.clone()) {
                        return Err(ConfigurationError::DuplicateTable(c.name));
                    }
                    bindings.push(Binding::Table(TableBinding {
                        name: c.name,
                        path: c.path,
                        columns: Vec::new(),
                    }));
                }
                ParamType::Scalar(kind) => {
                    if !variables.insert(c.name.clone()) {
                        return Err(ConfigurationError::DuplicateVariable(c.name));
                    }
                    bindings.push(Binding::Scalar(ScalarBinding {
                        name: c.name,
                        kind,
                        direction: c.direction,
                        path: c.path,
                    }));
                }
            }
        }

        for row in rows.iter() {
            let Some(table_name) = row.table.as_deref().map(str::trim) else { continue };
            let c = check_row(row, namespaces)?;
            let table = bindings
                .iter_mut()
                .find_map(|b| match b {
                    Binding::Table(t) if t.name == table_name => Some(t),
                    _ => None,
                })
                .ok_or_else(|| ConfigurationError::MissingTable {
                    table: table_name.to_owned(),
                    column: c.name.clone(),
                })?;
            let ParamType::Scalar(kind) = c.ty else {
                return Err(ConfigurationError::NestedTable { table: table.name.clone(), column: c.name });
            };
            if table.columns.iter().any(|col| col.name == c.name) {
                return Err(ConfigurationError::DuplicateColumn { table: table.name.clone(), column: c.name });
            }
            table.columns.push(ColumnBinding { name: c.name, kind, direction: c.direction, path: c.path });
        }

        Ok(Self { bindings })
    }

    pub fn iter(&self) -> impl Iterator<Item = &Binding> {
        self.bindings.iter()
    }

    pub fn scalars(&self) -> impl Iterator<Item = &ScalarBinding> {
        self.bindings.iter().filter_map(|b| match b {
            Binding::Scalar(s) => Some(s),
            Binding::Table(_) => None,
        })
    }

    pub fn tables(&self) -> impl Iterator<Item = &TableBinding> {
        self.bindings.iter().filter_map(|b| match b {
            Binding::Table(t) => Some(t),
            Binding::Scalar(_) => None,
        })
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn row(table: Option<&str>, name: &str, ty: &str, dir: &str, path: &str) -> ParamRow {
        ParamRow {
            table: table.map(str::to_owned),
            name: name.into(),
            type_token: ty.into(),
            direction_token: dir.into(),
            path: path.into(),
        }
    }

    fn resolve(rows: &[ParamRow]) -> Result<BindingSet, ConfigurationError> {
        BindingSet::resolve(rows, &NamespaceBindings::new())
    }

    #[test]
    fn type_tokens() {
        assert_eq!(ParamType::parse("R_INTEGER"), Some(ParamType::Scalar(ScalarKind::Integer)));
        assert_eq!(ParamType::parse("character"), Some(ParamType::Scalar(ScalarKind::Character)));
        assert_eq!(ParamType::parse("R_DATA_FRAME"), Some(ParamType::Table));
        assert_eq!(ParamType::parse("complex"), None);
        assert_eq!(Direction::parse("inout"), Some(Direction::InOut));
        assert!(Direction::InOut.is_in() && Direction::InOut.is_out());
        assert!(!Direction::Out.is_in());
    }

    #[test]
    fn columns_attach_to_tables_in_any_order() {
        let set = resolve(&[
            row(Some("t"), "id", "INTEGER", "IN", "Id"),
            row(None, "n", "DOUBLE", "OUT", "/Msg/N"),
            row(None, "t", "DATA_FRAME", "INOUT", "/Msg/Row"),
            row(Some("t"), "name", "CHARACTER", "OUT", "Name"),
        ])
        .unwrap();
        assert_eq!(set.len(), 2);
        let t = set.tables().next().unwrap();
        assert_eq!(t.columns.iter().map(|c| c.name.as_str()).collect::<Vec<_>>(), ["id", "name"]);
        assert!(t.has_in() && t.has_out());
        assert_eq!(t.in_columns().count(), 1);
        assert_eq!(set.scalars().next().unwrap().kind, ScalarKind::Double);
    }

    #[test]
    fn validation_errors() {
        let cases = [
            (vec![row(None, "", "INTEGER", "IN", "/a")], 7814),
            (vec![row(None, "x", "COMPLEX", "IN", "/a")], 7812),
            (vec![row(None, "x", "INTEGER", "SIDEWAYS", "/a")], 7813),
            (vec![row(None, "x", "INTEGER", "IN", " ")], 7816),
            (vec![row(None, "x", "INTEGER", "IN", "/a["), ], 7816),
            (vec![row(None, "x", "INTEGER", "IN", "/a"), row(None, "x", "LOGICAL", "OUT", "/b")], 7815),
            (vec![row(None, "t", "DATA_FRAME", "IN", "/a"), row(None, "t", "DATA_FRAME", "IN", "/b")], 7869),
            (vec![row(Some("t"), "c", "INTEGER", "IN", "C")], 7870),
            (
                vec![
                    row(None, "t", "DATA_FRAME", "IN", "/a"),
                    row(Some("t"), "c", "INTEGER", "IN", "C"),
                    row(Some("t"), "c", "DOUBLE", "IN", "D"),
                ],
                7871,
            ),
            (
                vec![row(None, "t", "DATA_FRAME", "IN", "/a"), row(Some("t"), "c", "DATA_FRAME", "IN", "C")],
                7812,
            ),
        ];
        for (rows, code) in cases {
            let err = resolve(&rows).unwrap_err();
            assert_eq!(err.code(), code, "{err}");
        }
    }
}
