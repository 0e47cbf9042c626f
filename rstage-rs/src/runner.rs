//! Running a watched script on a session.
//!
//! Each session remembers which version of each script it has parsed.  The
//! script text is pushed and parsed only when that version is missing or
//! older than the file's; evaluation then reuses the parsed form.

use std::sync::Arc;

use tracing::trace;

use crate::error::{code, NodeError};
use crate::remote::Evaluated;
use crate::resource::WatchedResource;
use crate::session::{RemoteSession, ScriptState};
use crate::value::RValue;

/// Interpreter variable holding the script text.
pub fn script_var(key: &str) -> String {
    format!(".rstage_script_{key}")
}

/// Interpreter variable holding the parsed script.
pub fn parsed_var(key: &str) -> String {
    format!(".rstage_parsed_{key}")
}

#[derive(Debug, Clone)]
pub struct ScriptRunner {
    owner: String,
    script: Arc<WatchedResource>,
}

impl ScriptRunner {
    pub fn new(owner: &str, script: Arc<WatchedResource>) -> Self {
        Self { owner: owner.to_owned(), script }
    }

    pub fn script(&self) -> &WatchedResource {
        &self.script
    }

    /// Make sure `session` holds the current parsed script, then evaluate it.
    pub async fn run(&self, session: &mut RemoteSession) -> Result<RValue, NodeError> {
        self.ensure_parsed(session).await?;
        self.evaluate(session).await
    }

    async fn ensure_parsed(&self, session: &mut RemoteSession) -> Result<(), NodeError> {
        self.script.check_and_reload().await?;

        // Hold the snapshot so the pushed text and the recorded version agree.
        let snapshot = self.script.read().await;
        let key = self.script.key();
        if session.script_state(key, snapshot.version) == ScriptState::Current {
            return Ok(());
        }

        trace!(
            code = code::SCRIPT_PARSE,
            node = %self.owner,
            path = %self.script.path().display(),
            version = snapshot.version,
            "parsing script"
        );
        let interp = session.interpreter();
        interp
            .assign(&script_var(key), &snapshot.content.to_value())
            .await
            .map_err(|e| NodeError::remote(&self.owner, e))?;
        let expr = format!("{} <- parse(text={})", parsed_var(key), script_var(key));
        match interp.eval(&expr).await.map_err(|e| NodeError::remote(&self.owner, e))? {
            Evaluated::Value(_) => {}
            Evaluated::Failed(diagnostic) => {
                return Err(NodeError::ScriptParse {
                    owner: self.owner.clone(),
                    path: self.script.path().to_owned(),
                    diagnostic,
                })
            }
        }
        session.record_version(key, snapshot.version);
        Ok(())
    }

    async fn evaluate(&self, session: &mut RemoteSession) -> Result<RValue, NodeError> {
        trace!(
            code = code::SCRIPT_EVAL,
            node = %self.owner,
            path = %self.script.path().display(),
            "evaluating script"
        );
        let expr = format!("eval({})", parsed_var(self.script.key()));
        match session
            .interpreter()
            .eval(&expr)
            .await
            .map_err(|e| NodeError::remote(&self.owner, e))?
        {
            Evaluated::Value(v) => Ok(v),
            Evaluated::Failed(diagnostic) => Err(NodeError::ScriptEval {
                owner: self.owner.clone(),
                path: self.script.path().to_owned(),
                diagnostic,
            }),
        }
    }
}
