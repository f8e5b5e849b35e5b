// Bounded connection pool over a store backend
//
// The pool is an explicitly constructed object handed to whatever builds the
// session manager; init at process start, drain at process shutdown.

use crate::config::DatabaseConfig;
use crate::db::backend::{Backend, Connection};
use crate::errors::StoreError;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, info, instrument, warn};

/// Pool sizing and lifecycle options
#[derive(Debug, Clone)]
pub struct PoolOptions {
    /// Connections opened eagerly at init
    pub min_size: u32,
    /// Upper bound of recycled connections
    pub max_size: u32,
    /// Transient connections beyond max_size allowed under burst load,
    /// closed first on release
    pub max_overflow: u32,
    /// How long an acquire waits for capacity before PoolExhausted
    pub acquire_timeout: Duration,
    /// Probe liveness on release; a failing connection is closed and
    /// replaced lazily, never recycled
    pub health_check_on_release: bool,
    /// How long shutdown waits for in-flight connections
    pub shutdown_grace: Duration,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            min_size: 1,
            max_size: 10,
            max_overflow: 0,
            acquire_timeout: Duration::from_secs(5),
            health_check_on_release: true,
            shutdown_grace: Duration::from_secs(10),
        }
    }
}

impl From<&DatabaseConfig> for PoolOptions {
    fn from(config: &DatabaseConfig) -> Self {
        Self {
            min_size: config.min_size,
            max_size: config.max_size,
            max_overflow: config.max_overflow,
            acquire_timeout: Duration::from_millis(config.acquire_timeout_ms),
            health_check_on_release: config.health_check_on_release,
            shutdown_grace: Duration::from_millis(config.shutdown_grace_ms),
        }
    }
}

/// Pool state snapshot for liveness/readiness probes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStatus {
    pub idle: usize,
    pub checked_out: usize,
    pub total: usize,
    pub last_health_check_ok: bool,
}

struct PoolState<C> {
    idle: Vec<C>,
    /// Live connections, checked out or idle
    total: usize,
    checked_out: usize,
    last_health_ok: bool,
}

struct PoolInner<B: Backend> {
    backend: B,
    opts: PoolOptions,
    /// Capacity gate: max_size + max_overflow permits
    permits: Semaphore,
    state: Mutex<PoolState<B::Conn>>,
    closed: AtomicBool,
}

impl<B: Backend> PoolInner<B> {
    /// Return a connection on any drop path; runs the liveness probe and
    /// the overflow policy, then frees the capacity permit
    fn release(&self, mut conn: B::Conn) {
        conn.reset();

        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        state.checked_out -= 1;

        if self.closed.load(Ordering::SeqCst) {
            state.total -= 1;
        } else if self.opts.health_check_on_release && !conn.is_healthy() {
            state.last_health_ok = false;
            state.total -= 1;
            warn!("Connection failed liveness probe on release, closing instead of recycling");
        } else if state.total > self.opts.max_size as usize {
            // Overflow connection: close first on release
            state.total -= 1;
            debug!(total = state.total, "Closed overflow connection on release");
        } else {
            if self.opts.health_check_on_release {
                state.last_health_ok = true;
            }
            state.idle.push(conn);
        }
        drop(state);
        self.permits.add_permits(1);
    }
}

/// Connection pool shared across request-handling tasks
///
/// Clones share the same underlying pool.
pub struct Pool<B: Backend> {
    inner: Arc<PoolInner<B>>,
}

impl<B: Backend> Clone for Pool<B> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<B: Backend> Pool<B> {
    /// Create the pool and eagerly open `min_size` connections
    #[instrument(skip(backend, opts), fields(backend = backend.name(), min_size = opts.min_size, max_size = opts.max_size))]
    pub async fn new(backend: B, opts: PoolOptions) -> Result<Self, StoreError> {
        info!("Initializing connection pool");
        let capacity = (opts.max_size + opts.max_overflow) as usize;
        let inner = Arc::new(PoolInner {
            permits: Semaphore::new(capacity),
            state: Mutex::new(PoolState {
                idle: Vec::with_capacity(opts.max_size as usize),
                total: 0,
                checked_out: 0,
                last_health_ok: true,
            }),
            closed: AtomicBool::new(false),
            backend,
            opts,
        });

        for _ in 0..inner.opts.min_size {
            let conn = inner.backend.connect().await?;
            let mut state = inner.state.lock().unwrap_or_else(|p| p.into_inner());
            state.idle.push(conn);
            state.total += 1;
        }

        info!(
            backend = inner.backend.name(),
            "Connection pool initialized"
        );
        Ok(Self { inner })
    }

    /// Check out a connection, waiting up to `acquire_timeout` for capacity
    ///
    /// # Errors
    /// `PoolExhausted` when no capacity frees up within the timeout;
    /// `StoreUnavailable` when the pool is shut down or a replacement
    /// connection cannot be opened.
    pub async fn acquire(&self) -> Result<PooledConnection<B>, StoreError> {
        let inner = &self.inner;
        if inner.closed.load(Ordering::SeqCst) {
            return Err(StoreError::StoreUnavailable("pool is shut down".to_string()));
        }

        let wait = inner.opts.acquire_timeout;
        let permit = match timeout(wait, inner.permits.acquire()).await {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => {
                return Err(StoreError::StoreUnavailable("pool is shut down".to_string()))
            }
            Err(_) => {
                warn!(waited_ms = wait.as_millis() as u64, "Pool acquire timed out");
                return Err(StoreError::PoolExhausted {
                    waited_ms: wait.as_millis() as u64,
                });
            }
        };
        // Ownership of the capacity slot moves to the PooledConnection;
        // release() gives it back via add_permits
        permit.forget();

        if inner.closed.load(Ordering::SeqCst) {
            inner.permits.add_permits(1);
            return Err(StoreError::StoreUnavailable("pool is shut down".to_string()));
        }

        let reuse = {
            let mut state = inner.state.lock().unwrap_or_else(|p| p.into_inner());
            if let Some(conn) = state.idle.pop() {
                state.checked_out += 1;
                Some(conn)
            } else {
                // Reserve the slot before connecting so concurrent acquires
                // cannot overshoot capacity
                state.total += 1;
                state.checked_out += 1;
                None
            }
        };

        let conn = match reuse {
            Some(conn) => conn,
            None => match inner.backend.connect().await {
                Ok(conn) => conn,
                Err(err) => {
                    let mut state = inner.state.lock().unwrap_or_else(|p| p.into_inner());
                    state.total -= 1;
                    state.checked_out -= 1;
                    drop(state);
                    inner.permits.add_permits(1);
                    return Err(StoreError::StoreUnavailable(format!(
                        "failed to open replacement connection: {err}"
                    )));
                }
            },
        };

        Ok(PooledConnection {
            conn: Some(conn),
            inner: Arc::clone(inner),
        })
    }

    /// Current pool state for external probes
    pub fn status(&self) -> PoolStatus {
        let state = self.inner.state.lock().unwrap_or_else(|p| p.into_inner());
        PoolStatus {
            idle: state.idle.len(),
            checked_out: state.checked_out,
            total: state.total,
            last_health_check_ok: state.last_health_ok,
        }
    }

    /// Drain the pool: close idle connections, wait for in-flight ones up
    /// to the configured grace period, then force-discard returns
    #[instrument(skip(self))]
    pub async fn shutdown(&self) {
        info!("Shutting down connection pool");
        self.inner.closed.store(true, Ordering::SeqCst);

        {
            let mut state = self.inner.state.lock().unwrap_or_else(|p| p.into_inner());
            let drained = state.idle.len();
            state.idle.clear();
            state.total -= drained;
            debug!(drained, "Drained idle connections");
        }

        let started = Instant::now();
        loop {
            let in_flight = {
                let state = self.inner.state.lock().unwrap_or_else(|p| p.into_inner());
                state.checked_out
            };
            if in_flight == 0 {
                break;
            }
            if started.elapsed() >= self.inner.opts.shutdown_grace {
                warn!(in_flight, "Shutdown grace period elapsed, force-closing remaining connections");
                break;
            }
            sleep(Duration::from_millis(10)).await;
        }
        info!("Connection pool shut down");
    }
}

/// Checked-out connection; returned to the pool on drop
///
/// Every exit path, including task cancellation, funnels through `Drop`,
/// which resets the connection's transaction state before recycling.
pub struct PooledConnection<B: Backend> {
    conn: Option<B::Conn>,
    inner: Arc<PoolInner<B>>,
}

impl<B: Backend> std::fmt::Debug for PooledConnection<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("backend", &self.inner.backend.name())
            .finish_non_exhaustive()
    }
}

impl<B: Backend> Deref for PooledConnection<B> {
    type Target = B::Conn;

    fn deref(&self) -> &B::Conn {
        self.conn.as_ref().expect("connection present until drop")
    }
}

impl<B: Backend> DerefMut for PooledConnection<B> {
    fn deref_mut(&mut self) -> &mut B::Conn {
        self.conn.as_mut().expect("connection present until drop")
    }
}

impl<B: Backend> Drop for PooledConnection<B> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.inner.release(conn);
        }
    }
}
