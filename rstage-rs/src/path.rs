//! Path expressions over a [`Message`].
//!
//! A compact subset of XPath 1.0, enough to address binding targets:
//!
//! | Form | Meaning |
//! |------|---------|
//! | `/a/b` | from the top of the context element's tree |
//! | `$Root/a` | from a message variable |
//! | `a/b`, `.`, `..` | relative to the context element |
//! | `*`, `//a` | any child, any descendant named `a` |
//! | `a[2]` | second match per context element |
//! | `p:a`, `{uri}:a` | namespace-qualified names |
//! | `?a` | child `a`, created when missing (mutable evaluation only) |
//! | `'s'`, `1.5`, `true()`, `count(p)`, `string(p)`, `number(p)` | scalars |
//!
//! Unprefixed names match elements in the empty namespace only.

use std::collections::{HashMap, HashSet};
use std::fmt;

use thiserror::Error;

use crate::tree::{Message, MessageTree, NodeId, Scalar};

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PathError {
    #[error("invalid path expression {expr:?} at offset {pos}: {message}")]
    Syntax { expr: String, pos: usize, message: String },
    #[error("unknown namespace prefix {prefix:?} in path expression {expr:?}")]
    UnknownPrefix { expr: String, prefix: String },
    #[error("unknown message variable ${0}")]
    UnknownVariable(String),
}

// ── Namespace bindings ────────────────────────────────────────────────────────

/// Prefix → namespace URI map consulted when compiling `prefix:name` steps.
#[derive(Debug, Clone, Default)]
pub struct NamespaceBindings {
    map: HashMap<String, String>,
}

impl NamespaceBindings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bind(&mut self, prefix: impl Into<String>, uri: impl Into<String>) {
        self.map.insert(prefix.into(), uri.into());
    }

    pub fn resolve(&self, prefix: &str) -> Option<&str> {
        self.map.get(prefix).map(String::as_str)
    }
}

// ── AST ───────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
enum Start {
    Context,
    Top,
    Var(String),
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Axis {
    Child,
    Descendant,
    SelfNode,
    Parent,
}

#[derive(Debug, Clone, PartialEq)]
enum NameTest {
    Any,
    Name { namespace: String, local: String },
}

#[derive(Debug, Clone, PartialEq)]
struct Step {
    axis: Axis,
    test: NameTest,
    position: Option<usize>,
    create: bool,
}

#[derive(Debug, Clone, PartialEq)]
struct PathAst {
    start: Start,
    steps: Vec<Step>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Func {
    Count,
    String,
    Number,
}

#[derive(Debug, Clone, PartialEq)]
enum Ast {
    Path(PathAst),
    Literal(Scalar),
    Call(Func, PathAst),
}

// ── Results ───────────────────────────────────────────────────────────────────

/// Result of evaluating a path expression.
#[derive(Debug, Clone, PartialEq)]
pub enum PathValue {
    Nodes(Vec<NodeId>),
    Scalar(Scalar),
}

// ── Parser ────────────────────────────────────────────────────────────────────

struct Parser<'a> {
    expr: &'a str,
    src: &'a [u8],
    pos: usize,
    namespaces: &'a NamespaceBindings,
}

fn is_name_start(c: u8) -> bool {
    c.is_ascii_alphabetic() || c == b'_'
}

fn is_name_char(c: u8) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, b'_' | b'-' | b'.')
}

impl<'a> Parser<'a> {
    fn new(expr: &'a str, namespaces: &'a NamespaceBindings) -> Self {
        Parser { expr, src: expr.as_bytes(), pos: 0, namespaces }
    }

    fn peek(&self) -> Option<u8> {
        self.src.get(self.pos).copied()
    }

    fn peek2(&self) -> Option<u8> {
        self.src.get(self.pos + 1).copied()
    }

    fn advance(&mut self) -> Option<u8> {
        let ch = self.peek();
        if ch.is_some() {
            self.pos += 1;
        }
        ch
    }

    fn eat(&mut self, ch: u8) -> bool {
        if self.peek() == Some(ch) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn skip_ws(&mut self) {
        while self.peek().is_some_and(|c| c.is_ascii_whitespace()) {
            self.pos += 1;
        }
    }

    fn error(&self, message: impl Into<String>) -> PathError {
        PathError::Syntax { expr: self.expr.to_owned(), pos: self.pos, message: message.into() }
    }

    fn expect(&mut self, ch: u8) -> Result<(), PathError> {
        self.skip_ws();
        if self.eat(ch) {
            Ok(())
        } else {
            Err(self.error(format!("expected '{}'", ch as char)))
        }
    }

    fn name(&mut self) -> Result<String, PathError> {
        let start = self.pos;
        if !self.peek().is_some_and(is_name_start) {
            return Err(self.error("expected a name"));
        }
        while self.peek().is_some_and(is_name_char) {
            self.pos += 1;
        }
        Ok(self.expr[start..self.pos].to_owned())
    }

    /// True if a `(` follows the name at the cursor.
    fn at_call(&self) -> bool {
        let mut i = self.pos;
        while self.src.get(i).copied().is_some_and(is_name_char) {
            i += 1;
        }
        while self.src.get(i).is_some_and(|c| c.is_ascii_whitespace()) {
            i += 1;
        }
        self.src.get(i) == Some(&b'(')
    }

    fn parse(mut self) -> Result<Ast, PathError> {
        self.skip_ws();
        let ast = match self.peek() {
            None => return Err(self.error("empty expression")),
            Some(q @ (b'\'' | b'"')) => {
                self.advance();
                let start = self.pos;
                while self.peek().is_some_and(|c| c != q) {
                    self.pos += 1;
                }
                let text = self.expr[start..self.pos].to_owned();
                if !self.eat(q) {
                    return Err(self.error("unterminated string literal"));
                }
                Ast::Literal(Scalar::Str(text))
            }
            Some(c) if c.is_ascii_digit() || (c == b'-' && self.peek2().is_some_and(|d| d.is_ascii_digit())) => {
                self.number()?
            }
            Some(c) if is_name_start(c) && self.at_call() => self.call()?,
            Some(_) => Ast::Path(self.path()?),
        };
        self.skip_ws();
        if self.peek().is_some() {
            return Err(self.error("unexpected trailing input"));
        }
        Ok(ast)
    }

    fn number(&mut self) -> Result<Ast, PathError> {
        let start = self.pos;
        self.eat(b'-');
        while self.peek().is_some_and(|c| c.is_ascii_digit() || c == b'.') {
            self.pos += 1;
        }
        let text = &self.expr[start..self.pos];
        let value = if text.contains('.') {
            text.parse::<f64>().map(Scalar::Double).ok()
        } else {
            text.parse::<i64>().map(Scalar::Int).ok()
        };
        value.map(Ast::Literal).ok_or_else(|| self.error(format!("bad number {text:?}")))
    }

    fn call(&mut self) -> Result<Ast, PathError> {
        let name = self.name()?;
        self.expect(b'(')?;
        self.skip_ws();
        let func = match name.as_str() {
            "true" | "false" => {
                self.expect(b')')?;
                return Ok(Ast::Literal(Scalar::Bool(name == "true")));
            }
            "count" => Func::Count,
            "string" => Func::String,
            "number" => Func::Number,
            _ => return Err(self.error(format!("unknown function {name}()"))),
        };
        let arg = self.path()?;
        self.expect(b')')?;
        Ok(Ast::Call(func, arg))
    }

    fn path(&mut self) -> Result<PathAst, PathError> {
        let start = if self.eat(b'$') {
            Start::Var(self.name()?)
        } else if self.peek() == Some(b'/') {
            Start::Top
        } else {
            Start::Context
        };

        let mut steps = Vec::new();
        if start == Start::Context {
            steps.push(self.step(false)?);
        }
        while self.eat(b'/') {
            let descendant = self.eat(b'/');
            let at_end = matches!(self.peek(), None | Some(b')') | Some(b' '));
            if at_end && start == Start::Top && steps.is_empty() && !descendant {
                break;
            }
            steps.push(self.step(descendant)?);
        }
        Ok(PathAst { start, steps })
    }

    fn step(&mut self, descendant: bool) -> Result<Step, PathError> {
        let axis = if descendant { Axis::Descendant } else { Axis::Child };
        if self.eat(b'.') {
            if descendant {
                return Err(self.error("'.' and '..' cannot follow '//'"));
            }
            let axis = if self.eat(b'.') { Axis::Parent } else { Axis::SelfNode };
            return Ok(Step { axis, test: NameTest::Any, position: None, create: false });
        }

        let create = self.eat(b'?');
        let test = if self.eat(b'*') {
            NameTest::Any
        } else if self.eat(b'{') {
            let start = self.pos;
            while self.peek().is_some_and(|c| c != b'}') {
                self.pos += 1;
            }
            let namespace = self.expr[start..self.pos].to_owned();
            self.expect(b'}')?;
            self.expect(b':')?;
            NameTest::Name { namespace, local: self.name()? }
        } else {
            let first = self.name()?;
            if self.eat(b':') {
                let namespace = self
                    .namespaces
                    .resolve(&first)
                    .ok_or_else(|| PathError::UnknownPrefix {
                        expr: self.expr.to_owned(),
                        prefix: first.clone(),
                    })?
                    .to_owned();
                NameTest::Name { namespace, local: self.name()? }
            } else {
                NameTest::Name { namespace: String::new(), local: first }
            }
        };

        let mut position = None;
        if self.eat(b'[') {
            let start = self.pos;
            while self.peek().is_some_and(|c| c.is_ascii_digit()) {
                self.pos += 1;
            }
            let n = self.expr[start..self.pos].parse::<usize>().ok().filter(|&n| n > 0);
            position = Some(n.ok_or_else(|| self.error("predicate must be a positive integer"))?);
            self.expect(b']')?;
        }
        Ok(Step { axis, test, position, create })
    }
}

// ── Evaluation ────────────────────────────────────────────────────────────────

enum TreeRef<'a> {
    Shared(&'a MessageTree),
    Mut(&'a mut MessageTree),
}

impl TreeRef<'_> {
    fn get(&self) -> &MessageTree {
        match self {
            TreeRef::Shared(t) => t,
            TreeRef::Mut(t) => t,
        }
    }
}

fn matches(tree: &MessageTree, node: NodeId, test: &NameTest) -> bool {
    match test {
        NameTest::Any => true,
        NameTest::Name { namespace, local } => {
            tree.name(node) == local && tree.namespace(node) == namespace
        }
    }
}

fn select(tree: &MessageTree, node: NodeId, step: &Step) -> Vec<NodeId> {
    let candidates: Vec<NodeId> = match step.axis {
        Axis::SelfNode => return vec![node],
        Axis::Parent => return tree.parent(node).into_iter().collect(),
        Axis::Child => tree.children(node).to_vec(),
        Axis::Descendant => tree.descendants_or_self(node).into_iter().skip(1).collect(),
    };
    candidates.into_iter().filter(|&c| matches(tree, c, &step.test)).collect()
}

fn scalar_number(value: Option<&Scalar>) -> f64 {
    match value {
        Some(Scalar::Bool(b)) => f64::from(u8::from(*b)),
        Some(Scalar::Int(n)) => *n as f64,
        Some(Scalar::Double(x)) => *x,
        Some(Scalar::Str(s)) => s.trim().parse().unwrap_or(f64::NAN),
        None => f64::NAN,
    }
}

/// A compiled path expression.
#[derive(Debug, Clone, PartialEq)]
pub struct PathExpr {
    source: String,
    ast: Ast,
}

impl fmt::Display for PathExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

impl PathExpr {
    /// Compile `source`, resolving namespace prefixes through `namespaces`.
    pub fn compile(source: &str, namespaces: &NamespaceBindings) -> Result<Self, PathError> {
        let ast = Parser::new(source, namespaces).parse()?;
        Ok(Self { source: source.to_owned(), ast })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Evaluate against `msg`.  `context` defaults to the message body root.
    pub fn evaluate(&self, msg: &Message, context: Option<NodeId>) -> Result<PathValue, PathError> {
        let context = context.unwrap_or(msg.root);
        match &self.ast {
            Ast::Literal(s) => Ok(PathValue::Scalar(s.clone())),
            Ast::Path(p) => Ok(PathValue::Nodes(walk(p, msg, TreeRef::Shared(&msg.tree), context)?)),
            Ast::Call(func, p) => {
                let nodes = walk(p, msg, TreeRef::Shared(&msg.tree), context)?;
                let first = nodes.first().and_then(|&n| msg.tree.value(n));
                let scalar = match func {
                    Func::Count => Scalar::Int(nodes.len() as i64),
                    Func::String => Scalar::Str(first.map(Scalar::to_string).unwrap_or_default()),
                    Func::Number => Scalar::Double(scalar_number(first)),
                };
                Ok(PathValue::Scalar(scalar))
            }
        }
    }

    /// Evaluate against `msg`, creating the elements named by `?name` steps
    /// where they are missing.
    pub fn evaluate_mut(
        &self,
        msg: &mut Message,
        context: Option<NodeId>,
    ) -> Result<PathValue, PathError> {
        let Ast::Path(p) = &self.ast else {
            return self.evaluate(msg, context);
        };
        let context = context.unwrap_or(msg.root);
        let start = start_nodes(p, msg, context)?;
        Ok(PathValue::Nodes(run_steps(p, TreeRef::Mut(&mut msg.tree), start)))
    }
}

fn start_nodes(p: &PathAst, msg: &Message, context: NodeId) -> Result<Vec<NodeId>, PathError> {
    Ok(match &p.start {
        Start::Context => vec![context],
        Start::Top => vec![msg.tree.top(context)],
        Start::Var(name) => {
            vec![msg.variable(name).ok_or_else(|| PathError::UnknownVariable(name.clone()))?]
        }
    })
}

fn walk(
    p: &PathAst,
    msg: &Message,
    tree: TreeRef<'_>,
    context: NodeId,
) -> Result<Vec<NodeId>, PathError> {
    let start = start_nodes(p, msg, context)?;
    Ok(run_steps(p, tree, start))
}

fn run_steps(p: &PathAst, mut tree: TreeRef<'_>, mut current: Vec<NodeId>) -> Vec<NodeId> {
    for step in &p.steps {
        let mut next = Vec::new();
        let mut seen = HashSet::new();
        for &node in &current {
            let mut found = select(tree.get(), node, step);
            if let (true, TreeRef::Mut(t), NameTest::Name { namespace, local }) =
                (step.create && step.axis == Axis::Child, &mut tree, &step.test)
            {
                let wanted = step.position.unwrap_or(1);
                while found.len() < wanted {
                    found.push(t.append_child_ns(node, namespace, local));
                }
            }
            let picked = match step.position {
                Some(k) => found.get(k - 1).copied().into_iter().collect(),
                None => found,
            };
            next.extend(picked.into_iter().filter(|n| seen.insert(*n)));
        }
        current = next;
    }
    current
}

// ── Tests ─────────────────────────────────────────────────────────────────────
