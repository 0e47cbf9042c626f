//! Bounded pool of interpreter sessions.
//!
//! [`SessionPool::acquire`] hands out a [`Lease`]; dropping the lease puts
//! the session back.  At most `max_sessions` sessions exist at once, counting
//! leased and idle ones together.  Callers beyond that wait.
//!
//! A background task wakes every `sweep_interval` to evict idle sessions that
//! have sat unused for `idle_timeout`, never going below `min_idle`, and then
//! tops the idle set back up to `min_idle`.

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, warn};

use crate::error::NodeError;
use crate::session::RemoteSession;

// ── Configuration ─────────────────────────────────────────────────────────────

/// Pool sizing.  Eviction only ever removes sessions while more than
/// `min_idle` are idle; `idle_timeout` is how long one must have been idle to
/// qualify, and `sweep_interval` how often that is checked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    pub max_sessions: usize,
    pub min_idle: usize,
    pub idle_timeout: Duration,
    pub sweep_interval: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_sessions: 10,
            min_idle: 1,
            idle_timeout: Duration::from_secs(10),
            sweep_interval: Duration::from_millis(100),
        }
    }
}

/// Creates and destroys sessions on the pool's behalf.
#[async_trait]
pub trait SessionFactory: Send + Sync {
    async fn create(&self) -> Result<RemoteSession, NodeError>;

    /// Tear a session down.  Failures are the factory's to log.
    async fn destroy(&self, session: RemoteSession);
}

/// Point-in-time counts, for diagnostics and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub total: usize,
    pub idle: usize,
}

// ── Shared state ──────────────────────────────────────────────────────────────

struct IdleSession {
    session: RemoteSession,
    since: Instant,
}

struct State {
    /// Most recently returned last.
    idle: Vec<IdleSession>,
    /// Leased + idle + being created.
    total: usize,
}

struct Shared {
    owner: String,
    config: PoolConfig,
    factory: Arc<dyn SessionFactory>,
    /// One permit per lease or in-flight warm-up creation.
    permits: Arc<Semaphore>,
    state: Mutex<State>,
    closed: AtomicBool,
}

impl Shared {
    fn release_slot(&self) {
        self.state.lock().total -= 1;
    }

    /// Create a session into a slot already counted in `total`.  The slot is
    /// given back if creation fails or the future is dropped first.
    async fn create(&self, slot: Slot<'_>) -> Result<RemoteSession, NodeError> {
        let session = self.factory.create().await?;
        slot.keep();
        Ok(session)
    }

    /// Park a session as idle, or destroy it if the pool has closed.  The
    /// check and the push share the lock `close` drains under.
    async fn park(&self, session: RemoteSession) {
        let session = {
            let mut state = self.state.lock();
            if !self.closed.load(Ordering::Acquire) {
                state.idle.push(IdleSession { session, since: Instant::now() });
                return;
            }
            session
        };
        self.destroy(session).await;
    }

    async fn destroy(&self, session: RemoteSession) {
        self.factory.destroy(session).await;
        self.release_slot();
    }

    /// Evict expired idle sessions, then warm back up to `min_idle`.
    async fn sweep(&self) {
        let expired: Vec<RemoteSession> = {
            let mut state = self.state.lock();
            let mut expired = Vec::new();
            // Oldest sessions sit at the front.
            while state.idle.len() > self.config.min_idle
                && state.idle[0].since.elapsed() >= self.config.idle_timeout
            {
                expired.push(state.idle.remove(0).session);
            }
            expired
        };
        if !expired.is_empty() {
            debug!(node = %self.owner, evicted = expired.len(), "evicting idle sessions");
        }
        for session in expired {
            self.destroy(session).await;
        }

        while !self.closed.load(Ordering::Acquire) {
            let Ok(permit) = Arc::clone(&self.permits).try_acquire_owned() else { break };
            {
                let mut state = self.state.lock();
                if state.idle.len() >= self.config.min_idle || state.total >= self.config.max_sessions {
                    break;
                }
                state.total += 1;
            }
            match self.create(Slot::new(self)).await {
                Ok(session) => self.park(session).await,
                Err(e) => {
                    warn!(node = %self.owner, code = e.code(), error = %e, "warm-up session failed");
                    break;
                }
            }
            drop(permit);
        }
    }
}

/// One unit of `total` reserved for a session under construction.
struct Slot<'a> {
    shared: &'a Shared,
    armed: bool,
}

impl<'a> Slot<'a> {
    /// Wrap a slot the caller has just counted in `total`.
    fn new(shared: &'a Shared) -> Self {
        Self { shared, armed: true }
    }

    fn keep(mut self) {
        self.armed = false;
    }
}

impl Drop for Slot<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.shared.release_slot();
        }
    }
}

// ── SessionPool ───────────────────────────────────────────────────────────────

pub struct SessionPool {
    shared: Arc<Shared>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl SessionPool {
    /// Build a pool and start its sweeper.  Must be called inside a tokio
    /// runtime.
    pub fn new(owner: &str, config: PoolConfig, factory: Arc<dyn SessionFactory>) -> Self {
        let max = config.max_sessions.max(1);
        let interval = config.sweep_interval.max(Duration::from_millis(1));
        let shared = Arc::new(Shared {
            owner: owner.to_owned(),
            config: PoolConfig { max_sessions: max, ..config },
            factory,
            permits: Arc::new(Semaphore::new(max)),
            state: Mutex::new(State { idle: Vec::new(), total: 0 }),
            closed: AtomicBool::new(false),
        });
        let sweeper = tokio::spawn(run_sweeper(Arc::downgrade(&shared), interval));
        Self { shared, sweeper: Mutex::new(Some(sweeper)) }
    }

    /// Wait for a session: reuse the most recently returned idle one, or
    /// create one if none is idle.
    pub async fn acquire(&self) -> Result<Lease, NodeError> {
        let shared = &self.shared;
        if shared.closed.load(Ordering::Acquire) {
            return Err(NodeError::PoolClosed(shared.owner.clone()));
        }
        let permit = Arc::clone(&shared.permits)
            .acquire_owned()
            .await
            .map_err(|_| NodeError::PoolClosed(shared.owner.clone()))?;

        let reused = {
            let mut state = shared.state.lock();
            let reused = state.idle.pop().map(|i| i.session);
            if reused.is_none() {
                state.total += 1;
            }
            reused
        };
        let session = match reused {
            Some(session) => session,
            None => shared.create(Slot::new(shared)).await?,
        };
        Ok(Lease { session: Some(session), shared: Arc::clone(shared), _permit: permit })
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.shared.state.lock();
        PoolStats { total: state.total, idle: state.idle.len() }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.shared.config
    }

    /// Stop the sweeper and destroy every idle session.  Leased sessions are
    /// destroyed as their leases are dropped; further `acquire` calls fail.
    pub async fn close(&self) {
        let idle: Vec<RemoteSession> = {
            let mut state = self.shared.state.lock();
            if self.shared.closed.swap(true, Ordering::AcqRel) {
                return;
            }
            state.idle.drain(..).map(|i| i.session).collect()
        };
        self.shared.permits.close();
        if let Some(handle) = self.sweeper.lock().take() {
            handle.abort();
        }
        debug!(node = %self.shared.owner, sessions = idle.len(), "closing session pool");
        for session in idle {
            self.shared.destroy(session).await;
        }
    }
}

impl Drop for SessionPool {
    fn drop(&mut self) {
        if let Some(handle) = self.sweeper.get_mut().take() {
            handle.abort();
        }
    }
}

async fn run_sweeper(shared: Weak<Shared>, every: Duration) {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let Some(shared) = shared.upgrade() else { break };
        if shared.closed.load(Ordering::Acquire) {
            break;
        }
        shared.sweep().await;
    }
}

// ── Lease ─────────────────────────────────────────────────────────────────────

/// Exclusive use of one session until dropped.
pub struct Lease {
    session: Option<RemoteSession>,
    shared: Arc<Shared>,
    _permit: OwnedSemaphorePermit,
}

impl std::fmt::Debug for Lease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lease").field("session", &self.session).finish_non_exhaustive()
    }
}

impl Deref for Lease {
    type Target = RemoteSession;

    fn deref(&self) -> &RemoteSession {
        // Only `Drop` takes the session out.
        self.session.as_ref().expect("session present until drop")
    }
}

impl DerefMut for Lease {
    fn deref_mut(&mut self) -> &mut RemoteSession {
        // Only `Drop` takes the session out.
        self.session.as_mut().expect("session present until drop")
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        let Some(session) = self.session.take() else { return };
        let session = {
            let mut state = self.shared.state.lock();
            if !self.shared.closed.load(Ordering::Acquire) {
                state.idle.push(IdleSession { session, since: Instant::now() });
                return;
            }
            session
        };
        let shared = Arc::clone(&self.shared);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move { shared.destroy(session).await });
            }
            Err(_) => {
                warn!(node = %shared.owner, "no runtime to close a returned session, dropping it");
                drop(session);
                shared.release_slot();
            }
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
