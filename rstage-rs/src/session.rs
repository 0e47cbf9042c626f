//! A pooled interpreter session and the script versions it has parsed.

use std::collections::HashMap;

use crate::remote::Interpreter;

/// Where a session stands with respect to one script.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptState {
    /// Never parsed on this session.
    Unknown,
    /// Parsed, but from an older version of the file.
    Stale,
    Current,
}

pub struct RemoteSession {
    interp: Box<dyn Interpreter>,
    versions: HashMap<String, u64>,
}

impl RemoteSession {
    pub fn new(interp: Box<dyn Interpreter>) -> Self {
        Self { interp, versions: HashMap::new() }
    }

    pub fn interpreter(&mut self) -> &mut dyn Interpreter {
        self.interp.as_mut()
    }

    pub fn script_state(&self, key: &str, version: u64) -> ScriptState {
        match self.versions.get(key) {
            None => ScriptState::Unknown,
            Some(&v) if v == version => ScriptState::Current,
            Some(_) => ScriptState::Stale,
        }
    }

    /// Record that `version` of the script `key` is parsed on this session.
    pub fn record_version(&mut self, key: &str, version: u64) {
        self.versions.insert(key.to_owned(), version);
    }
}

impl std::fmt::Debug for RemoteSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteSession").field("versions", &self.versions).finish_non_exhaustive()
    }
}
