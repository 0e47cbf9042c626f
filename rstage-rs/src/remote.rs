//! The seam between the stage and the interpreter server.
//!
//! Everything above this module talks to an [`Interpreter`]: assign a
//! value, evaluate an expression, fetch a variable, close.  The concrete
//! Rserve client lives in [`crate::rserve`]; tests plug in an in-memory
//! fake.

use std::io;

use async_trait::async_trait;
use thiserror::Error;

use crate::qap::CodecError;
use crate::value::RValue;

/// Result of a remote evaluation.
///
/// The server reports a failed evaluation as a value, not as a transport
/// error, so callers branch on this tag.
#[derive(Debug, Clone, PartialEq)]
pub enum Evaluated {
    Value(RValue),
    /// Evaluation failed; carries the interpreter's diagnostic text.
    Failed(String),
}

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error("server error {code:#04x}: {text}")]
    Server { code: u8, text: String },
    #[error("connection closed")]
    Closed,
}

/// One live interpreter session.
#[async_trait]
pub trait Interpreter: Send {
    /// Bind `value` to the global variable `name`.
    async fn assign(&mut self, name: &str, value: &RValue) -> Result<(), RemoteError>;

    /// Evaluate `expr`, reporting interpreter-side failures as
    /// [`Evaluated::Failed`].
    async fn eval(&mut self, expr: &str) -> Result<Evaluated, RemoteError>;

    /// Fetch the global variable `name`; `None` if it does not exist.
    async fn fetch(&mut self, name: &str) -> Result<Option<RValue>, RemoteError>;

    async fn close(&mut self) -> Result<(), RemoteError>;
}

/// Opens new interpreter sessions.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn Interpreter>, RemoteError>;

    /// The address sessions are opened against, for diagnostics.
    fn address(&self) -> String;
}
