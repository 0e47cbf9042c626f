//! In-process interpreter stand-in.
//!
//! [`MemoryInterpreter`] keeps assigned variables in a map, answers `fetch`
//! from it, and records every call in a shared [`Journal`].  Expressions are
//! not evaluated; an optional [`Handler`] decides what an `eval` returns and
//! may modify the variables, which is enough to drive the stage end to end
//! without a server.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::remote::{Connector, Evaluated, Interpreter, RemoteError};
use crate::value::RValue;

/// Decides the outcome of an `eval`.  Returning `None` falls back to a
/// successful `NULL` result.
pub type Handler =
    Arc<dyn Fn(&mut HashMap<String, RValue>, &str) -> Option<Evaluated> + Send + Sync>;

#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    Connect { session: usize },
    Assign { session: usize, name: String, value: RValue },
    Eval { session: usize, expr: String },
    Fetch { session: usize, name: String },
    Close { session: usize },
}

/// Shared, ordered record of calls across all sessions of a connector.
#[derive(Debug, Clone, Default)]
pub struct Journal(Arc<Mutex<Vec<Call>>>);

impl Journal {
    fn push(&self, call: Call) {
        self.0.lock().push(call);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.0.lock().clone()
    }

    pub fn clear(&self) {
        self.0.lock().clear();
    }

    /// Evaluated expressions, in order, across all sessions.
    pub fn evals(&self) -> Vec<String> {
        self.0
            .lock()
            .iter()
            .filter_map(|c| match c {
                Call::Eval { expr, .. } => Some(expr.clone()),
                _ => None,
            })
            .collect()
    }

    /// Number of evaluated expressions containing `needle`.
    pub fn count_evals(&self, needle: &str) -> usize {
        self.evals().iter().filter(|e| e.contains(needle)).count()
    }

    /// Values assigned to `name`, in order.
    pub fn assigned(&self, name: &str) -> Vec<RValue> {
        self.0
            .lock()
            .iter()
            .filter_map(|c| match c {
                Call::Assign { name: n, value, .. } if n == name => Some(value.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn assign_count(&self) -> usize {
        self.0.lock().iter().filter(|c| matches!(c, Call::Assign { .. })).count()
    }
}

pub struct MemoryInterpreter {
    id: usize,
    vars: HashMap<String, RValue>,
    journal: Journal,
    handler: Option<Handler>,
    closed: bool,
}

impl MemoryInterpreter {
    pub fn new(id: usize, journal: Journal, handler: Option<Handler>) -> Self {
        Self { id, vars: HashMap::new(), journal, handler, closed: false }
    }

    fn check_open(&self) -> Result<(), RemoteError> {
        if self.closed {
            Err(RemoteError::Closed)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl Interpreter for MemoryInterpreter {
    async fn assign(&mut self, name: &str, value: &RValue) -> Result<(), RemoteError> {
        self.check_open()?;
        self.journal.push(Call::Assign {
            session: self.id,
            name: name.to_owned(),
            value: value.clone(),
        });
        self.vars.insert(name.to_owned(), value.clone());
        Ok(())
    }

    async fn eval(&mut self, expr: &str) -> Result<Evaluated, RemoteError> {
        self.check_open()?;
        self.journal.push(Call::Eval { session: self.id, expr: expr.to_owned() });
        let outcome = self.handler.as_ref().and_then(|h| h(&mut self.vars, expr));
        Ok(outcome.unwrap_or_else(|| Evaluated::Value(RValue::null())))
    }

    async fn fetch(&mut self, name: &str) -> Result<Option<RValue>, RemoteError> {
        self.check_open()?;
        self.journal.push(Call::Fetch { session: self.id, name: name.to_owned() });
        Ok(self.vars.get(name).cloned())
    }

    async fn close(&mut self) -> Result<(), RemoteError> {
        self.journal.push(Call::Close { session: self.id });
        self.closed = true;
        Ok(())
    }
}

/// Hands out [`MemoryInterpreter`]s sharing one journal and handler.
#[derive(Default)]
pub struct MemoryConnector {
    journal: Journal,
    handler: Option<Handler>,
    next_id: AtomicUsize,
    refuse: AtomicBool,
}

impl MemoryConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_handler(
        handler: impl Fn(&mut HashMap<String, RValue>, &str) -> Option<Evaluated> + Send + Sync + 'static,
    ) -> Self {
        Self { handler: Some(Arc::new(handler)), ..Self::default() }
    }

    pub fn journal(&self) -> &Journal {
        &self.journal
    }

    /// Make subsequent connection attempts fail (or succeed again).
    pub fn set_refuse(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::SeqCst);
    }

    pub fn connections(&self) -> usize {
        self.next_id.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self) -> Result<Box<dyn Interpreter>, RemoteError> {
        if self.refuse.load(Ordering::SeqCst) {
            return Err(RemoteError::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                "connection refused",
            )));
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.journal.push(Call::Connect { session: id });
        Ok(Box::new(MemoryInterpreter::new(id, self.journal.clone(), self.handler.clone())))
    }

    fn address(&self) -> String {
        "memory".to_owned()
    }
}
