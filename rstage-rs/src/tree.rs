//! Message tree: the hierarchical document a stage reads from and writes to.
//!
//! Elements live in an arena addressed by [`NodeId`].  Cloning a tree keeps
//! every id valid in the copy, which is how a request's output message is
//! derived from its input: path variables resolved against one can be used
//! on the other.

use std::fmt;

use thiserror::Error;

// ── Scalar ────────────────────────────────────────────────────────────────────

/// A typed element value.  A document-null is represented as `None` at the
/// call sites that hold an `Option<Scalar>`.
#[derive(Debug, Clone, PartialEq)]
pub enum Scalar {
    Bool(bool),
    Int(i64),
    Double(f64),
    Str(String),
}

impl Scalar {
    pub fn type_name(&self) -> &'static str {
        match self {
            Scalar::Bool(_) => "boolean",
            Scalar::Int(_) => "integer",
            Scalar::Double(_) => "double",
            Scalar::Str(_) => "string",
        }
    }
}

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scalar::Bool(b) => write!(f, "{b}"),
            Scalar::Int(n) => write!(f, "{n}"),
            Scalar::Double(x) => write!(f, "{x}"),
            Scalar::Str(s) => f.write_str(s),
        }
    }
}

impl From<&str> for Scalar {
    fn from(s: &str) -> Self {
        Scalar::Str(s.to_owned())
    }
}

impl From<String> for Scalar {
    fn from(s: String) -> Self {
        Scalar::Str(s)
    }
}

impl From<i64> for Scalar {
    fn from(n: i64) -> Self {
        Scalar::Int(n)
    }
}

impl From<f64> for Scalar {
    fn from(x: f64) -> Self {
        Scalar::Double(x)
    }
}

impl From<bool> for Scalar {
    fn from(b: bool) -> Self {
        Scalar::Bool(b)
    }
}

// ── MessageTree ───────────────────────────────────────────────────────────────

/// Handle to an element of a [`MessageTree`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(usize);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TreeError {
    #[error("element {0} has no parent, cannot create a sibling")]
    NoParent(String),
}

#[derive(Debug, Clone)]
struct Element {
    name: String,
    namespace: String,
    value: Option<Scalar>,
    parent: Option<NodeId>,
    children: Vec<NodeId>,
}

#[derive(Debug, Clone, Default)]
pub struct MessageTree {
    nodes: Vec<Element>,
}

impl MessageTree {
    pub fn new() -> Self {
        Self::default()
    }

    fn alloc(&mut self, namespace: &str, name: &str, parent: Option<NodeId>) -> NodeId {
        let id = NodeId(self.nodes.len());
        self.nodes.push(Element {
            name: name.to_owned(),
            namespace: namespace.to_owned(),
            value: None,
            parent,
            children: Vec::new(),
        });
        id
    }

    /// Add a parentless element.
    pub fn add_root(&mut self, name: &str) -> NodeId {
        self.alloc("", name, None)
    }

    pub fn append_child(&mut self, parent: NodeId, name: &str) -> NodeId {
        self.append_child_ns(parent, "", name)
    }

    pub fn append_child_ns(&mut self, parent: NodeId, namespace: &str, name: &str) -> NodeId {
        let id = self.alloc(namespace, name, Some(parent));
        self.nodes[parent.0].children.push(id);
        id
    }

    /// Append a child carrying a value.
    pub fn append_value(
        &mut self,
        parent: NodeId,
        name: &str,
        value: impl Into<Scalar>,
    ) -> NodeId {
        let id = self.append_child(parent, name);
        self.nodes[id.0].value = Some(value.into());
        id
    }

    pub fn name(&self, id: NodeId) -> &str {
        &self.nodes[id.0].name
    }

    pub fn namespace(&self, id: NodeId) -> &str {
        &self.nodes[id.0].namespace
    }

    pub fn value(&self, id: NodeId) -> Option<&Scalar> {
        self.nodes[id.0].value.as_ref()
    }

    pub fn set_value(&mut self, id: NodeId, value: Option<Scalar>) {
        self.nodes[id.0].value = value;
    }

    pub fn parent(&self, id: NodeId) -> Option<NodeId> {
        self.nodes[id.0].parent
    }

    pub fn children(&self, id: NodeId) -> &[NodeId] {
        &self.nodes[id.0].children
    }

    /// First child with the given namespace and name.
    pub fn find_child(&self, parent: NodeId, namespace: &str, name: &str) -> Option<NodeId> {
        self.children(parent)
            .iter()
            .copied()
            .find(|&c| self.name(c) == name && self.namespace(c) == namespace)
    }

    /// Topmost ancestor of `id` (itself if parentless).
    pub fn top(&self, mut id: NodeId) -> NodeId {
        while let Some(p) = self.parent(id) {
            id = p;
        }
        id
    }

    /// Create an empty element immediately after `id`, with the same name
    /// and namespace.
    pub fn create_sibling_after(&mut self, id: NodeId) -> Result<NodeId, TreeError> {
        let parent = self
            .parent(id)
            .ok_or_else(|| TreeError::NoParent(self.display_path(id)))?;
        let (namespace, name) = (self.namespace(id).to_owned(), self.name(id).to_owned());
        let new = self.alloc(&namespace, &name, Some(parent));
        let siblings = &mut self.nodes[parent.0].children;
        let at = siblings.iter().position(|&c| c == id).map_or(siblings.len(), |i| i + 1);
        siblings.insert(at, new);
        Ok(new)
    }

    /// Render the element's location as `/{ns}:name[index]` segments.
    ///
    /// The `[index]` suffix appears only when the element has a same-named
    /// sibling; the namespace prefix only when the namespace is non-empty.
    pub fn display_path(&self, id: NodeId) -> String {
        let mut path = String::new();
        let mut cur = Some(id);
        while let Some(node) = cur {
            let segment = self.path_segment(node);
            path.insert_str(0, &segment);
            cur = self.parent(node);
        }
        path
    }

    fn path_segment(&self, id: NodeId) -> String {
        let same = |c: NodeId| self.name(c) == self.name(id) && self.namespace(c) == self.namespace(id);
        let mut index = None;
        if let Some(parent) = self.parent(id) {
            let siblings = self.children(parent);
            let pos = siblings.iter().position(|&c| c == id).unwrap_or(0);
            let before = siblings[..pos].iter().filter(|&&c| same(c)).count();
            let after = siblings[pos + 1..].iter().any(|&c| same(c));
            if before > 0 || after {
                index = Some(before + 1);
            }
        }
        let mut segment = String::from("/");
        if !self.namespace(id).is_empty() {
            segment.push_str(&format!("{{{}}}:", self.namespace(id)));
        }
        segment.push_str(self.name(id));
        if let Some(i) = index {
            segment.push_str(&format!("[{i}]"));
        }
        segment
    }

    /// All descendants of `id` in document order, `id` included.
    pub fn descendants_or_self(&self, id: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut stack = vec![id];
        while let Some(n) = stack.pop() {
            out.push(n);
            stack.extend(self.children(n).iter().rev().copied());
        }
        out
    }
}

// ── Message ───────────────────────────────────────────────────────────────────

/// A message tree with its four well-known roots.
#[derive(Debug, Clone)]
pub struct Message {
    pub tree: MessageTree,
    /// Message body root (`$Root`, `$InputRoot`, `$OutputRoot`).
    pub root: NodeId,
    /// `$LocalEnvironment` and the destination-list aliases.
    pub local_environment: NodeId,
    /// `$Environment`.
    pub environment: NodeId,
    /// `$ExceptionList`.
    pub exception_list: NodeId,
}

impl Default for Message {
    fn default() -> Self {
        Self::new()
    }
}

impl Message {
    pub fn new() -> Self {
        let mut tree = MessageTree::new();
        let root = tree.add_root("Root");
        let local_environment = tree.add_root("LocalEnvironment");
        let environment = tree.add_root("Environment");
        let exception_list = tree.add_root("ExceptionList");
        Self { tree, root, local_environment, environment, exception_list }
    }

    /// Resolve a path variable (`$Root`, `$InputLocalEnvironment`, ...) to
    /// the element it names.
    pub fn variable(&self, name: &str) -> Option<NodeId> {
        match name {
            "Root" | "InputRoot" | "OutputRoot" => Some(self.root),
            "LocalEnvironment"
            | "InputLocalEnvironment"
            | "OutputLocalEnvironment"
            | "DestinationList"
            | "InputDestinationList"
            | "OutputDestinationList" => Some(self.local_environment),
            "ExceptionList" | "InputExceptionList" | "OutputExceptionList" => {
                Some(self.exception_list)
            }
            "Environment" => Some(self.environment),
            _ => None,
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> (MessageTree, NodeId, Vec<NodeId>) {
        let mut t = MessageTree::new();
        let root = t.add_root("Root");
        let msg = t.append_child(root, "Msg");
        let rows = (0..3).map(|i| t.append_value(msg, "Row", i as i64)).collect();
        (t, msg, rows)
    }

    #[test]
    fn display_path_indexes_repeated_siblings() {
        let (t, msg, rows) = sample();
        assert_eq!(t.display_path(msg), "/Root/Msg");
        assert_eq!(t.display_path(rows[0]), "/Root/Msg/Row[1]");
        assert_eq!(t.display_path(rows[2]), "/Root/Msg/Row[3]");
    }

    #[test]
    fn display_path_with_namespace() {
        let mut t = MessageTree::new();
        let root = t.add_root("Root");
        let a = t.append_child_ns(root, "urn:x", "A");
        assert_eq!(t.display_path(a), "/Root/{urn:x}:A");
    }

    #[test]
    fn sibling_inserted_after_and_cloned() {
        let (mut t, msg, rows) = sample();
        let new = t.create_sibling_after(rows[0]).unwrap();
        assert_eq!(t.children(msg), [rows[0], new, rows[1], rows[2]]);
        assert_eq!(t.name(new), "Row");
        assert_eq!(t.value(new), None);
        assert_eq!(t.display_path(new), "/Root/Msg/Row[2]");
    }

    #[test]
    fn sibling_of_root_is_an_error() {
        let mut t = MessageTree::new();
        let root = t.add_root("Root");
        assert_eq!(
            t.create_sibling_after(root),
            Err(TreeError::NoParent("/Root".into()))
        );
    }

    #[test]
    fn clone_keeps_ids() {
        let (t, _, rows) = sample();
        let mut copy = t.clone();
        copy.set_value(rows[1], Some(Scalar::from("changed")));
        assert_eq!(t.value(rows[1]), Some(&Scalar::Int(1)));
        assert_eq!(copy.value(rows[1]), Some(&Scalar::from("changed")));
    }

    #[test]
    fn message_variables_alias_roots() {
        let msg = Message::new();
        assert_eq!(msg.variable("InputRoot"), Some(msg.root));
        assert_eq!(msg.variable("OutputDestinationList"), Some(msg.local_environment));
        assert_eq!(msg.variable("Environment"), Some(msg.environment));
        assert_eq!(msg.variable("Properties"), None);
    }

    #[test]
    fn descendants_in_document_order() {
        let (t, msg, rows) = sample();
        let root = t.top(msg);
        assert_eq!(t.descendants_or_self(root), [root, msg, rows[0], rows[1], rows[2]]);
    }
}
