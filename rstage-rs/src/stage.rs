//! The stage: bindings, scripts and a session pool wired together.
//!
//! A [`Stage`] is built once from a [`Config`].  Each call to
//! [`Stage::evaluate`] leases a session, pushes the input bindings, runs the
//! evaluate script and pulls the output bindings into a copy of the input
//! message.

use std::any::Any;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::binding::BindingSet;
use crate::config::Config;
use crate::error::{code, ConfigurationError, NodeError};
use crate::pool::{PoolStats, SessionFactory, SessionPool};
use crate::remote::{Connector, Evaluated};
use crate::resource::{ResourceKind, WatchedResource};
use crate::runner::ScriptRunner;
use crate::session::RemoteSession;
use crate::tree::Message;
use crate::{table, variable};

/// Interpreter variable holding the data file's bytes.
pub fn data_var(key: &str) -> String {
    format!(".rstage_data_{key}")
}

// ── Session factory ───────────────────────────────────────────────────────────

/// Opens sessions and prepares them with the data file and connect script.
struct StageFactory {
    owner: String,
    connector: Arc<dyn Connector>,
    data: Option<Arc<WatchedResource>>,
    on_connect: Option<ScriptRunner>,
    on_disconnect: Option<ScriptRunner>,
}

impl StageFactory {
    async fn prepare(&self, session: &mut RemoteSession) -> Result<(), NodeError> {
        if let Some(data) = &self.data {
            self.load_data(data, session).await?;
        }
        if let Some(script) = &self.on_connect {
            script.run(session).await?;
        }
        Ok(())
    }

    async fn load_data(&self, data: &WatchedResource, session: &mut RemoteSession) -> Result<(), NodeError> {
        data.check_and_reload().await?;
        let snapshot = data.read().await;
        let var = data_var(data.key());
        let interp = session.interpreter();
        interp
            .assign(&var, &snapshot.content.to_value())
            .await
            .map_err(|e| NodeError::remote(&self.owner, e))?;
        let expr = format!("load(rawConnection({var}))");
        match interp.eval(&expr).await.map_err(|e| NodeError::remote(&self.owner, e))? {
            Evaluated::Value(_) => Ok(()),
            Evaluated::Failed(diagnostic) => Err(NodeError::DataLoad {
                owner: self.owner.clone(),
                path: data.path().to_owned(),
                diagnostic,
            }),
        }
    }
}

#[async_trait]
impl SessionFactory for StageFactory {
    async fn create(&self) -> Result<RemoteSession, NodeError> {
        let address = self.connector.address();
        debug!(code = code::CONNECTING, node = %self.owner, %address, "connecting to interpreter");
        let interp = self.connector.connect().await.map_err(|source| NodeError::Connect {
            owner: self.owner.clone(),
            address: address.clone(),
            source,
        })?;
        info!(code = code::CONNECTED, node = %self.owner, %address, "connected to interpreter");

        let mut session = RemoteSession::new(interp);
        if let Err(e) = self.prepare(&mut session).await {
            if let Err(close) = session.interpreter().close().await {
                warn!(node = %self.owner, error = %close, "closing unprepared session failed");
            }
            return Err(e);
        }
        Ok(session)
    }

    async fn destroy(&self, mut session: RemoteSession) {
        if let Some(script) = &self.on_disconnect {
            if let Err(e) = script.run(&mut session).await {
                warn!(code = e.code(), node = %self.owner, error = %e, "disconnect script failed");
            }
        }
        debug!(code = code::DISCONNECT, node = %self.owner, "disconnecting from interpreter");
        if let Err(e) = session.interpreter().close().await {
            warn!(node = %self.owner, error = %e, "closing session failed");
        }
    }
}

// ── Stage ─────────────────────────────────────────────────────────────────────

struct Inner {
    owner: String,
    bindings: BindingSet,
    evaluate: ScriptRunner,
    pool: SessionPool,
}

/// A running stage.  Clones share the same pool.
#[derive(Clone)]
pub struct Stage {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stage")
            .field("owner", &self.inner.owner)
            .field("bindings", &self.inner.bindings.len())
            .finish_non_exhaustive()
    }
}

impl Stage {
    /// Validate the bindings, load every configured file and start the pool.
    ///
    /// Must be called inside a tokio runtime.  No session is opened until the
    /// first evaluation or the first sweep.
    pub fn start(config: Config, connector: Arc<dyn Connector>) -> Result<Self, NodeError> {
        let owner = config.name.clone();
        let config_error = |source: ConfigurationError| NodeError::Config { owner: owner.clone(), source };

        let bindings = BindingSet::resolve(&config.params, &config.namespaces).map_err(&config_error)?;
        let evaluate_path = config
            .evaluate
            .clone()
            .ok_or_else(|| config_error(ConfigurationError::MissingEvaluateScript))?;

        let script = |path: PathBuf| -> Result<ScriptRunner, NodeError> {
            let resource = WatchedResource::load(&owner, path, ResourceKind::Script)?;
            Ok(ScriptRunner::new(&owner, Arc::new(resource)))
        };
        let evaluate = script(evaluate_path)?;
        let on_connect = config.connect.clone().map(&script).transpose()?;
        let on_disconnect = config.disconnect.clone().map(&script).transpose()?;
        let data = config
            .rdata
            .clone()
            .map(|path| WatchedResource::load(&owner, path, ResourceKind::Data).map(Arc::new))
            .transpose()?;

        let address = connector.address();
        let factory = StageFactory { owner: owner.clone(), connector, data, on_connect, on_disconnect };
        let pool = SessionPool::new(&owner, config.pool.clone(), Arc::new(factory));
        info!(
            node = %owner,
            %address,
            bindings = bindings.len(),
            max_sessions = config.pool.max_sessions,
            "stage started"
        );
        Ok(Self { inner: Arc::new(Inner { owner, bindings, evaluate, pool }) })
    }

    pub fn owner(&self) -> &str {
        &self.inner.owner
    }

    pub fn bindings(&self) -> &BindingSet {
        &self.inner.bindings
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.inner.pool.stats()
    }

    /// Run the evaluate script against `input` and return the output message.
    ///
    /// A panic while processing is reported as an internal error; the
    /// session is still returned to the pool.
    pub async fn evaluate(&self, input: &Message) -> Result<Message, NodeError> {
        let inner = Arc::clone(&self.inner);
        let input = input.clone();
        match tokio::spawn(async move { inner.process(input).await }).await {
            Ok(result) => result,
            Err(e) if e.is_panic() => Err(NodeError::internal(&self.inner.owner, panic_message(e.into_panic()))),
            Err(e) => Err(NodeError::internal(&self.inner.owner, e.to_string())),
        }
    }

    /// Tear the pool down.  Sessions in use are closed when released.
    pub async fn close(&self) {
        info!(node = %self.inner.owner, "stage closing");
        self.inner.pool.close().await;
    }
}

impl Inner {
    async fn process(&self, input: Message) -> Result<Message, NodeError> {
        let owner = self.owner.as_str();
        let mut output = input.clone();
        let mut lease = self.pool.acquire().await?;
        let session: &mut RemoteSession = &mut lease;

        for binding in self.bindings.scalars().filter(|b| b.direction.is_in()) {
            variable::push(owner, binding, &input, session).await?;
        }
        for binding in self.bindings.tables().filter(|t| t.has_in()) {
            table::push(owner, binding, &input, session).await?;
        }

        self.evaluate.run(session).await?;

        for binding in self.bindings.tables().filter(|t| t.has_out()) {
            table::pull(owner, binding, &mut output, session).await?;
        }
        for binding in self.bindings.scalars().filter(|b| b.direction.is_out()) {
            variable::pull(owner, binding, &mut output, session).await?;
        }
        Ok(output)
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    match payload.downcast::<String>() {
        Ok(s) => *s,
        Err(payload) => match payload.downcast::<&'static str>() {
            Ok(s) => (*s).to_owned(),
            Err(_) => "panic with a non-string payload".to_owned(),
        },
    }
}
