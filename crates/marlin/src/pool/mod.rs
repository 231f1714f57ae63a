//! Bounded connection pool.
//!
//! One pool per configuration key. Idle sessions sit in a LIFO so hot
//! connections stay hot; a single appender worker serializes new-connection
//! builds; the registry's shared scheduler sweeps idle sessions past their
//! allowed age. Checkout hands back an RAII guard that returns (or retires)
//! the session on drop.

pub mod registry;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender, TrySendError};
use marlin_core::{Error, Result};
use parking_lot::{Condvar, Mutex};
use tracing::{debug, info, warn};

use crate::client::session::VALIDATION_TIMEOUT;
use crate::client::Session;
use crate::config::Configuration;

const STATE_OK: u8 = 0;
const STATE_CLOSING: u8 = 1;

/// Drain budget for close(): idle sessions are aborted repeatedly for up to
/// this long before the pool gives up on stragglers.
const CLOSE_DRAIN_BUDGET: Duration = Duration::from_secs(10);

/// Instrumentation snapshot, the JMX-bean surface of a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStatus {
    pub total: usize,
    pub idle: usize,
    pub active: usize,
    pub pending: usize,
}

pub struct Pool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    conf: Arc<Configuration>,
    tag: String,
    state: AtomicU8,
    total: AtomicUsize,
    pending: AtomicUsize,
    idle: Mutex<VecDeque<Session>>,
    idle_available: Condvar,
    /// Bounded work queue feeding the single appender worker.
    fill_requests: Sender<()>,
}

impl Pool {
    /// Build a pool and synchronously warm it to `min_pool_size`
    /// (connection failures during warm-up are logged, not fatal).
    pub fn new(conf: Arc<Configuration>, tag: String) -> Arc<Pool> {
        let (tx, rx) = crossbeam_channel::bounded(conf.max_pool_size.max(1));
        let inner = Arc::new(PoolInner {
            conf,
            tag,
            state: AtomicU8::new(STATE_OK),
            total: AtomicUsize::new(0),
            pending: AtomicUsize::new(0),
            idle: Mutex::new(VecDeque::new()),
            idle_available: Condvar::new(),
            fill_requests: tx,
        });

        spawn_appender(Arc::downgrade(&inner), rx);

        for _ in 0..inner.conf.min_pool_size {
            if let Err(error) = inner.add_connection() {
                warn!(pool = %inner.tag, %error, "error initializing pool connection");
                break;
            }
        }

        if inner.conf.register_pool_metrics {
            info!(pool = %inner.tag, status = ?inner.status(), "pool registered");
        }

        Arc::new(Pool { inner })
    }

    pub fn tag(&self) -> &str {
        &self.inner.tag
    }

    pub fn configuration(&self) -> &Arc<Configuration> {
        &self.inner.conf
    }

    pub fn status(&self) -> PoolStatus {
        self.inner.status()
    }

    /// Acquire a connection, waiting up to `connect_timeout`.
    pub fn get_connection(&self) -> Result<PooledConnection> {
        let inner = &self.inner;
        inner.pending.fetch_add(1, Ordering::AcqRel);
        let _guard = PendingGuard(&inner.pending);

        // Micro-poll first: with a warm pool this is the whole story.
        let micro = if inner.total.load(Ordering::Acquire) > 4 {
            Duration::ZERO
        } else {
            Duration::from_micros(50)
        };
        if let Some(session) = inner.acquire_idle(micro)? {
            return Ok(PooledConnection::pooled(session, inner.clone()));
        }

        inner.request_fill();

        let deadline = Instant::now() + inner.conf.connect_timeout;
        loop {
            let now = Instant::now();
            if now >= deadline {
                return Err(Error::pool_timeout(
                    inner.conf.connect_timeout.as_millis() as u64,
                ));
            }
            if let Some(session) = inner.acquire_idle(deadline - now)? {
                return Ok(PooledConnection::pooled(session, inner.clone()));
            }
        }
    }

    /// Acquire with explicit credentials. Matching the pool's own
    /// credentials goes through the pool; anything else gets a dedicated
    /// un-pooled session.
    pub fn get_connection_with(
        &self,
        user: &str,
        password: Option<&str>,
    ) -> Result<PooledConnection> {
        if self.inner.conf.matches_credentials(user, password) {
            return self.get_connection();
        }
        let conf = Arc::new(self.inner.conf.with_credentials(user, password));
        let session = Session::connect(conf)?;
        Ok(PooledConnection::one_off(session))
    }

    /// Close the pool: refuse new work, abort idle sessions for up to ten
    /// seconds, then leave stragglers to their guards.
    pub fn close(&self) {
        let inner = &self.inner;
        if inner.state.swap(STATE_CLOSING, Ordering::AcqRel) == STATE_CLOSING {
            return;
        }
        info!(pool = %inner.tag, status = ?inner.status(), "closing pool");

        // Wake waiters so they fail fast instead of running out their
        // deadlines.
        inner.idle_available.notify_all();

        let start = Instant::now();
        loop {
            // Destructive drain: pop until empty, abort each.
            loop {
                let popped = inner.idle.lock().pop_front();
                match popped {
                    Some(session) => {
                        inner.total.fetch_sub(1, Ordering::AcqRel);
                        session.abort();
                    }
                    None => break,
                }
            }
            if inner.total.load(Ordering::Acquire) == 0
                || start.elapsed() >= CLOSE_DRAIN_BUDGET
            {
                break;
            }
            std::thread::sleep(Duration::from_millis(1));
        }

        if inner.conf.register_pool_metrics {
            info!(pool = %inner.tag, "pool unregistered");
        }
    }

    /// Periodic idle eviction, driven by the registry scheduler.
    pub(crate) fn sweep(&self) {
        self.inner.sweep();
    }

    /// Sweep interval for this pool's configuration.
    pub(crate) fn sweep_interval(&self) -> Duration {
        let configured = Duration::from_secs(30);
        configured.min(self.inner.conf.max_idle_time / 2).max(Duration::from_secs(1))
    }
}

impl Drop for Pool {
    fn drop(&mut self) {
        if self.inner.state.load(Ordering::Acquire) == STATE_OK {
            self.close();
        }
    }
}

impl std::fmt::Debug for Pool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("tag", &self.inner.tag)
            .field("status", &self.inner.status())
            .finish()
    }
}

impl PoolInner {
    fn status(&self) -> PoolStatus {
        let total = self.total.load(Ordering::Acquire);
        let idle = self.idle.lock().len();
        PoolStatus {
            total,
            idle,
            active: total.saturating_sub(idle),
            pending: self.pending.load(Ordering::Acquire),
        }
    }

    fn is_ok(&self) -> bool {
        self.state.load(Ordering::Acquire) == STATE_OK
    }

    /// Ask the appender for one build attempt; a full queue means builds are
    /// already lined up.
    fn request_fill(&self) {
        if !self.is_ok() || self.total.load(Ordering::Acquire) >= self.conf.max_pool_size {
            return;
        }
        match self.fill_requests.try_send(()) {
            Ok(()) | Err(TrySendError::Full(())) => {}
            Err(TrySendError::Disconnected(())) => {}
        }
    }

    /// Claim a slot in `total` without exceeding the bound.
    fn try_reserve_slot(&self) -> bool {
        let mut current = self.total.load(Ordering::Acquire);
        loop {
            if current >= self.conf.max_pool_size {
                return false;
            }
            match self.total.compare_exchange(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(seen) => current = seen,
            }
        }
    }

    /// One appender pass: build a connection if the pool wants one.
    fn fill_once(&self) {
        let wants = self.total.load(Ordering::Acquire) < self.conf.min_pool_size
            || self.pending.load(Ordering::Acquire) > 0;
        if !self.is_ok() || !wants {
            return;
        }
        if let Err(error) = self.add_connection() {
            debug!(pool = %self.tag, %error, "pool fill attempt failed");
        }
    }

    fn add_connection(&self) -> Result<()> {
        if !self.try_reserve_slot() {
            return Ok(());
        }
        match Session::connect(self.conf.clone()) {
            Ok(session) => {
                if self.is_ok() {
                    self.push_idle(session);
                    debug!(pool = %self.tag, status = ?self.status(), "new physical connection created");
                    Ok(())
                } else {
                    self.total.fetch_sub(1, Ordering::AcqRel);
                    session.close();
                    Ok(())
                }
            }
            Err(e) => {
                self.total.fetch_sub(1, Ordering::AcqRel);
                Err(e)
            }
        }
    }

    fn push_idle(&self, session: Session) {
        self.idle.lock().push_front(session);
        self.idle_available.notify_one();
    }

    /// Pop an idle session, validating stale ones, waiting up to `timeout`.
    fn acquire_idle(&self, timeout: Duration) -> Result<Option<Session>> {
        let deadline = Instant::now() + timeout;
        loop {
            let popped = {
                let mut idle = self.idle.lock();
                loop {
                    if let Some(session) = idle.pop_front() {
                        break Some(session);
                    }
                    if !self.is_ok() {
                        return Err(Error::pool_closed());
                    }
                    let now = Instant::now();
                    if now >= deadline {
                        break None;
                    }
                    self.idle_available.wait_until(&mut idle, deadline);
                }
            };

            let Some(mut session) = popped else {
                return Ok(None);
            };

            if !self.is_ok() {
                self.total.fetch_sub(1, Ordering::AcqRel);
                session.close();
                return Err(Error::pool_closed());
            }

            if session.last_used().elapsed() > self.conf.pool_valid_min_delay {
                if !session.is_valid(VALIDATION_TIMEOUT) {
                    // Validation failed: recycle silently and keep looking.
                    self.total.fetch_sub(1, Ordering::AcqRel);
                    session.abort();
                    self.request_fill();
                    debug!(pool = %self.tag, status = ?self.status(), "connection removed after failed validation");
                    continue;
                }
            }
            session.touch();
            return Ok(Some(session));
        }
    }

    /// Return a checked-out session.
    fn release(&self, mut session: Session) {
        if session.is_closed() {
            // The error listener path: the session died in the caller's
            // hands.
            self.total.fetch_sub(1, Ordering::AcqRel);
            self.request_fill();
            debug!(pool = %self.tag, status = ?self.status(), "connection removed after error");
            return;
        }
        if !self.is_ok() {
            self.total.fetch_sub(1, Ordering::AcqRel);
            session.close();
            return;
        }
        match session.reset() {
            Ok(()) => self.push_idle(session),
            Err(error) => {
                self.total.fetch_sub(1, Ordering::AcqRel);
                session.abort();
                self.request_fill();
                debug!(pool = %self.tag, %error, "connection removed after failed reset");
            }
        }
    }

    fn sweep(&self) {
        let now = Instant::now();
        let wait_timeout = u64::from(self.conf.host.cached_wait_timeout());
        let min = self.conf.min_pool_size;
        let mut released = Vec::new();

        {
            let mut idle = self.idle.lock();
            // Oldest sessions live at the tail of the LIFO.
            while let Some(candidate) = idle.back() {
                let age = now.saturating_duration_since(candidate.last_used());
                let timed_out = age > self.conf.max_idle_time;
                let release = if wait_timeout > 0 {
                    let near_server_timeout =
                        age > Duration::from_secs(wait_timeout.saturating_sub(45));
                    near_server_timeout
                        || (timed_out && self.total.load(Ordering::Acquire) > min)
                } else {
                    timed_out
                };
                if !release {
                    break;
                }
                released.push(idle.pop_back().expect("back() was Some"));
            }
        }

        for session in released {
            self.total.fetch_sub(1, Ordering::AcqRel);
            session.close();
            self.request_fill();
            debug!(pool = %self.tag, status = ?self.status(), "connection removed due to inactivity");
        }
    }
}

fn spawn_appender(pool: Weak<PoolInner>, requests: Receiver<()>) {
    std::thread::Builder::new()
        .name("marlin-pool-appender".into())
        .spawn(move || {
            while requests.recv().is_ok() {
                let Some(pool) = pool.upgrade() else {
                    return;
                };
                pool.fill_once();
            }
        })
        .expect("spawn pool appender thread");
}

struct PendingGuard<'a>(&'a AtomicUsize);

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

/// A checked-out session. Dropping it returns the session to the pool
/// (after `reset()`), or closes it when the pool is closing, the session
/// died, or the checkout was a cross-credential one-off.
pub struct PooledConnection {
    session: Option<Session>,
    pool: Option<Arc<PoolInner>>,
}

impl std::fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("session", &self.session.is_some())
            .field("pool", &self.pool.is_some())
            .finish()
    }
}

impl PooledConnection {
    fn pooled(session: Session, pool: Arc<PoolInner>) -> Self {
        Self {
            session: Some(session),
            pool: Some(pool),
        }
    }

    fn one_off(session: Session) -> Self {
        Self {
            session: Some(session),
            pool: None,
        }
    }
}

impl std::ops::Deref for PooledConnection {
    type Target = Session;

    fn deref(&self) -> &Session {
        self.session.as_ref().expect("session present until drop")
    }
}

impl std::ops::DerefMut for PooledConnection {
    fn deref_mut(&mut self) -> &mut Session {
        self.session.as_mut().expect("session present until drop")
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        let Some(session) = self.session.take() else {
            return;
        };
        match &self.pool {
            Some(pool) => pool.release(session),
            None => session.close(),
        }
    }
}
