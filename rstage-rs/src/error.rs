//! Error taxonomy for the stage.
//!
//! Every error carries a stable numeric diagnostic code (see [`NodeError::code`])
//! so that log consumers can key on it independently of the message text.

use std::backtrace::Backtrace;
use std::fmt;
use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::path::PathError;
use crate::remote::RemoteError;
use crate::tree::Scalar;
use crate::value::ScalarKind;

/// Diagnostic codes that are not tied to an error value.
pub mod code {
    pub const VARIABLE_ASSIGN: [u32; 4] = [7817, 7818, 7819, 7820];
    pub const VARIABLE_FETCH: [u32; 4] = [7821, 7822, 7823, 7824];
    pub const NEW_ELEMENT: u32 = 7825;
    pub const SCRIPT_PARSE: u32 = 7826;
    pub const SCRIPT_EVAL: u32 = 7827;
    pub const CONNECTING: u32 = 7836;
    pub const CONNECTED: u32 = 7837;
    pub const DISCONNECT: u32 = 7838;
    pub const TABLE_ASSIGN: [u32; 4] = [7858, 7859, 7860, 7861];
    pub const TABLE_FETCH: [u32; 4] = [7862, 7863, 7864, 7865];
}

/// Offset of `kind` within the four-code blocks of the catalogue.
pub fn kind_index(kind: ScalarKind) -> usize {
    match kind {
        ScalarKind::Logical => 0,
        ScalarKind::Integer => 1,
        ScalarKind::Double => 2,
        ScalarKind::Character => 3,
    }
}

// ── Configuration ─────────────────────────────────────────────────────────────

/// A parameter table or script setting that cannot be used.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigurationError {
    #[error("parameter '{name}' has unknown type '{token}'")]
    BadType { name: String, token: String },
    #[error("parameter '{name}' has unknown direction '{token}'")]
    BadDirection { name: String, token: String },
    #[error("a parameter has an empty name")]
    EmptyName,
    #[error("parameter '{0}' has an empty path expression")]
    EmptyPath(String),
    #[error("parameter '{name}' has an invalid path expression: {source}")]
    BadPath {
        name: String,
        #[source]
        source: PathError,
    },
    #[error("variable '{0}' is declared more than once")]
    DuplicateVariable(String),
    #[error("table '{0}' is declared more than once")]
    DuplicateTable(String),
    #[error("column '{column}' refers to undeclared table '{table}'")]
    MissingTable { table: String, column: String },
    #[error("column '{column}' is declared more than once in table '{table}'")]
    DuplicateColumn { table: String, column: String },
    #[error("column '{column}' of table '{table}' cannot itself be a table")]
    NestedTable { table: String, column: String },
    #[error("no evaluate script is configured")]
    MissingEvaluateScript,
}

impl ConfigurationError {
    pub fn code(&self) -> u32 {
        match self {
            ConfigurationError::BadType { .. } | ConfigurationError::NestedTable { .. } => 7812,
            ConfigurationError::BadDirection { .. } => 7813,
            ConfigurationError::EmptyName => 7814,
            ConfigurationError::DuplicateVariable(_) => 7815,
            ConfigurationError::EmptyPath(_) | ConfigurationError::BadPath { .. } => 7816,
            ConfigurationError::MissingEvaluateScript => 7868,
            ConfigurationError::DuplicateTable(_) => 7869,
            ConfigurationError::MissingTable { .. } => 7870,
            ConfigurationError::DuplicateColumn { .. } => 7871,
        }
    }
}

// ── Bindings ──────────────────────────────────────────────────────────────────

/// Which marshalling operation failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Site {
    VariablePush,
    VariablePull,
    TablePush,
    TablePull,
}

impl fmt::Display for Site {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Site::VariablePush => "variable push",
            Site::VariablePull => "variable pull",
            Site::TablePush => "table push",
            Site::TablePull => "table pull",
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Fault {
    EmptyNodeset,
    NotNodeset,
    /// A row-relative column path matched more than one element.
    MultipleNodes { row: usize, column: String },
    /// A row-relative column path matched nothing on pull.
    NoNode { row: usize, column: String },
    ColumnNotNodeset { row: usize, column: String },
    /// `from_element` distinguishes a node's value from a scalar expression result.
    Convert { kind: ScalarKind, value: Scalar, from_element: bool },
    VariableMissing,
    NotDataFrame { found: String },
    MissingColumn { column: String },
    UnsupportedType { found: String, column: Option<String> },
    Path(PathError),
    Tree(String),
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Fault::EmptyNodeset => f.write_str("path expression selected no elements"),
            Fault::NotNodeset => f.write_str("path expression did not select elements"),
            Fault::MultipleNodes { row, column } => {
                write!(f, "column '{column}' selected more than one element in row {row}")
            }
            Fault::NoNode { row, column } => {
                write!(f, "column '{column}' selected no element in row {row}")
            }
            Fault::ColumnNotNodeset { row, column } => {
                write!(f, "column '{column}' did not select elements in row {row}")
            }
            Fault::Convert { kind, value, .. } => {
                write!(f, "cannot convert {} value '{value}' to {kind}", value.type_name())
            }
            Fault::VariableMissing => f.write_str("variable does not exist in the interpreter"),
            Fault::NotDataFrame { found } => write!(f, "expected a data.frame, found {found}"),
            Fault::MissingColumn { column } => write!(f, "data.frame has no column '{column}'"),
            Fault::UnsupportedType { found, column: None } => {
                write!(f, "unsupported value type {found}")
            }
            Fault::UnsupportedType { found, column: Some(c) } => {
                write!(f, "column '{c}' has unsupported type {found}")
            }
            Fault::Path(e) => write!(f, "{e}"),
            Fault::Tree(e) => f.write_str(e),
        }
    }
}

/// A per-request marshalling failure, naming the binding and, where known,
/// the element involved.
#[derive(Debug, Error, Clone, PartialEq)]
#[error(
    "{site} failed: {fault} (binding '{binding}' of '{owner}', path '{path}'{})",
    .node.as_ref().map(|n| format!(", element {n}")).unwrap_or_default()
)]
pub struct BindingError {
    pub site: Site,
    pub owner: String,
    pub binding: String,
    pub path: String,
    /// Rendered location of the offending element.
    pub node: Option<String>,
    pub fault: Fault,
}

impl BindingError {
    pub fn new(site: Site, owner: &str, binding: &str, path: &str, fault: Fault) -> Self {
        Self {
            site,
            owner: owner.to_owned(),
            binding: binding.to_owned(),
            path: path.to_owned(),
            node: None,
            fault,
        }
    }

    /// Attach the rendered location of the offending element.
    pub fn at(mut self, node: String) -> Self {
        self.node = Some(node);
        self
    }

    pub fn code(&self) -> u32 {
        use Fault::*;
        use Site::*;
        match (self.site, &self.fault) {
            (VariablePush, EmptyNodeset) => 7809,
            (VariablePush, Convert { kind, from_element: false, .. }) => 7805 + kind_index(*kind) as u32,
            (VariablePush, Convert { kind, from_element: true, .. }) => 7828 + kind_index(*kind) as u32,
            (VariablePull, NotNodeset) => 7801,
            (VariablePull, EmptyNodeset) => 7802,
            (VariablePull, UnsupportedType { .. }) => 7803,
            (VariablePull, VariableMissing) => 7832,
            (TablePush, EmptyNodeset) => 7840,
            (TablePush, NotNodeset) => 7841,
            (TablePush, MultipleNodes { .. }) => 7842,
            (TablePush, Convert { kind, from_element: false, .. }) => 7850 + kind_index(*kind) as u32,
            (TablePush, Convert { kind, from_element: true, .. }) => 7854 + kind_index(*kind) as u32,
            (TablePull, VariableMissing) => 7833,
            (TablePull, MissingColumn { .. }) => 7834,
            (TablePull, NotDataFrame { .. }) => 7835,
            (TablePull, EmptyNodeset) => 7844,
            (TablePull, NotNodeset) => 7845,
            (TablePull, MultipleNodes { .. }) => 7846,
            (TablePull, NoNode { .. }) => 7847,
            (TablePull, ColumnNotNodeset { .. }) => 7848,
            (TablePull, UnsupportedType { .. }) => 7849,
            _ => 7866,
        }
    }
}

// ── NodeError ─────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum NodeError {
    #[error("node '{owner}': cannot access file {}: {source}", .path.display())]
    FileAccess {
        owner: String,
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("node '{owner}': cannot connect to interpreter at {address}: {source}")]
    Connect {
        owner: String,
        address: String,
        #[source]
        source: RemoteError,
    },
    #[error("node '{owner}': loading data file {} failed: {diagnostic}", .path.display())]
    DataLoad { owner: String, path: PathBuf, diagnostic: String },
    #[error("node '{owner}': {source}")]
    Config {
        owner: String,
        #[source]
        source: ConfigurationError,
    },
    #[error("node '{owner}': parsing script {} failed: {diagnostic}", .path.display())]
    ScriptParse { owner: String, path: PathBuf, diagnostic: String },
    #[error("node '{owner}': evaluating script {} failed: {diagnostic}", .path.display())]
    ScriptEval { owner: String, path: PathBuf, diagnostic: String },
    #[error(transparent)]
    Binding(#[from] BindingError),
    #[error("node '{owner}': interpreter communication failed: {source}")]
    Remote {
        owner: String,
        #[source]
        source: RemoteError,
    },
    #[error("node '{0}': session pool is closed")]
    PoolClosed(String),
    #[error("node '{owner}': internal error: {message}\n{backtrace}")]
    Internal { owner: String, message: String, backtrace: String },
}

impl NodeError {
    /// Wrap an unexpected failure, capturing the current stack.
    pub fn internal(owner: &str, message: impl Into<String>) -> Self {
        NodeError::Internal {
            owner: owner.to_owned(),
            message: message.into(),
            backtrace: Backtrace::force_capture().to_string(),
        }
    }

    pub fn remote(owner: &str, source: RemoteError) -> Self {
        NodeError::Remote { owner: owner.to_owned(), source }
    }

    pub fn code(&self) -> u32 {
        match self {
            NodeError::FileAccess { .. } => 7804,
            NodeError::Connect { .. } => 7839,
            NodeError::DataLoad { .. } => 7867,
            NodeError::Config { source, .. } => source.code(),
            NodeError::ScriptParse { .. } => 7810,
            NodeError::ScriptEval { .. } => 7811,
            NodeError::Binding(e) => e.code(),
            NodeError::Remote { .. } | NodeError::PoolClosed(_) | NodeError::Internal { .. } => 7866,
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn binding(site: Site, fault: Fault) -> BindingError {
        BindingError {
            site,
            owner: "stage".into(),
            binding: "x".into(),
            path: "/Msg/X".into(),
            node: None,
            fault,
        }
    }

    #[test]
    fn conversion_codes_follow_kind_order() {
        let convert = |kind, from_element| Fault::Convert { kind, value: Scalar::from("?"), from_element };
        assert_eq!(binding(Site::VariablePush, convert(ScalarKind::Logical, false)).code(), 7805);
        assert_eq!(binding(Site::VariablePush, convert(ScalarKind::Character, false)).code(), 7808);
        assert_eq!(binding(Site::VariablePush, convert(ScalarKind::Integer, true)).code(), 7829);
        assert_eq!(binding(Site::TablePush, convert(ScalarKind::Double, false)).code(), 7852);
        assert_eq!(binding(Site::TablePush, convert(ScalarKind::Double, true)).code(), 7856);
    }

    #[test]
    fn nodeset_codes_depend_on_site() {
        assert_eq!(binding(Site::VariablePush, Fault::EmptyNodeset).code(), 7809);
        assert_eq!(binding(Site::VariablePull, Fault::EmptyNodeset).code(), 7802);
        assert_eq!(binding(Site::TablePush, Fault::EmptyNodeset).code(), 7840);
        assert_eq!(binding(Site::TablePull, Fault::EmptyNodeset).code(), 7844);
    }

    #[test]
    fn message_names_binding_and_element() {
        let mut e = binding(Site::TablePush, Fault::MultipleNodes { row: 2, column: "id".into() });
        e.node = Some("/Root/Msg/Row[2]".into());
        assert_eq!(
            e.to_string(),
            "table push failed: column 'id' selected more than one element in row 2 \
             (binding 'x' of 'stage', path '/Msg/X', element /Root/Msg/Row[2])"
        );
    }

    #[test]
    fn node_error_codes() {
        let e = NodeError::Config {
            owner: "n".into(),
            source: ConfigurationError::DuplicateColumn { table: "t".into(), column: "c".into() },
        };
        assert_eq!(e.code(), 7871);
        assert_eq!(NodeError::PoolClosed("n".into()).code(), 7866);
        let internal = NodeError::internal("n", "boom");
        assert!(internal.to_string().starts_with("node 'n': internal error: boom"));
    }
}
