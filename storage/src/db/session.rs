// Request-scoped unit of work bound to one pooled connection

use crate::db::backend::{Backend, Connection};
use crate::db::pool::{Pool, PooledConnection, PoolStatus};
use crate::errors::StoreError;
use futures::future::BoxFuture;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    Open,
    Committed,
    RolledBack,
}

impl SessionState {
    fn name(self) -> &'static str {
        match self {
            SessionState::Open => "open",
            SessionState::Committed => "committed",
            SessionState::RolledBack => "rolled back",
        }
    }
}

/// One logical transaction scoped to one request
///
/// A session is open, committed, or rolled back; the terminal states reject
/// every further operation with `SessionAlreadyClosed`. Operations take
/// `&mut self`, so a session cannot be shared between concurrent tasks.
/// Dropping an open session (early return, panic, task cancellation)
/// discards its writes and returns the connection to the pool.
pub struct Session<B: Backend> {
    conn: PooledConnection<B>,
    state: SessionState,
    correlation_id: Uuid,
}

impl<B: Backend> std::fmt::Debug for Session<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("state", &self.state.name())
            .field("correlation_id", &self.correlation_id)
            .finish_non_exhaustive()
    }
}

impl<B: Backend> Session<B> {
    /// Correlation id recorded in tracing spans for this unit of work
    pub fn correlation_id(&self) -> Uuid {
        self.correlation_id
    }

    pub fn is_open(&self) -> bool {
        self.state == SessionState::Open
    }

    fn ensure_open(&self) -> Result<(), StoreError> {
        match self.state {
            SessionState::Open => Ok(()),
            state => Err(StoreError::SessionAlreadyClosed { state: state.name() }),
        }
    }

    /// Connection handle for repository operations
    pub(crate) fn connection(&mut self) -> Result<&mut B::Conn, StoreError> {
        self.ensure_open()?;
        Ok(&mut self.conn)
    }

    /// Make every pending write durable and close the session
    ///
    /// On failure the transaction is discarded and the session ends rolled
    /// back; either way the session is terminal afterwards.
    #[instrument(skip(self), fields(session_id = %self.correlation_id))]
    pub async fn commit(&mut self) -> Result<(), StoreError> {
        self.ensure_open()?;
        match self.conn.commit().await {
            Ok(()) => {
                self.state = SessionState::Committed;
                debug!("Session committed");
                Ok(())
            }
            Err(err) => {
                self.state = SessionState::RolledBack;
                Err(err)
            }
        }
    }

    /// Discard every pending write and close the session
    #[instrument(skip(self), fields(session_id = %self.correlation_id))]
    pub async fn rollback(&mut self) -> Result<(), StoreError> {
        self.ensure_open()?;
        self.conn.rollback().await?;
        self.state = SessionState::RolledBack;
        debug!("Session rolled back");
        Ok(())
    }
}

impl<B: Backend> Drop for Session<B> {
    fn drop(&mut self) {
        if self.state == SessionState::Open {
            // The pooled connection's own drop resets the transaction, so
            // nothing leaks; still worth flagging, an abandoned session
            // usually means a missing finalize call or a cancelled request
            warn!(
                session_id = %self.correlation_id,
                "Session dropped while open, pending writes discarded"
            );
        }
    }
}

/// Creates one unit of work per inbound request
///
/// Holds the process-wide pool; cheap to clone into request handlers.
pub struct SessionManager<B: Backend> {
    pool: Pool<B>,
}

impl<B: Backend> Clone for SessionManager<B> {
    fn clone(&self) -> Self {
        Self {
            pool: self.pool.clone(),
        }
    }
}

impl<B: Backend> SessionManager<B> {
    pub fn new(pool: Pool<B>) -> Self {
        Self { pool }
    }

    /// Pool state passthrough for liveness/readiness probes
    pub fn pool_status(&self) -> PoolStatus {
        self.pool.status()
    }

    /// Acquire a connection and begin a transaction
    ///
    /// One request must open at most one session; nested calls inside the
    /// request borrow the same `&mut Session` instead of opening a second
    /// one, which would self-deadlock on a small pool.
    #[instrument(skip(self))]
    pub async fn open(&self) -> Result<Session<B>, StoreError> {
        let mut conn = self.pool.acquire().await?;
        conn.begin().await?;
        let correlation_id = Uuid::new_v4();
        debug!(session_id = %correlation_id, "Session opened");
        Ok(Session {
            conn,
            state: SessionState::Open,
            correlation_id,
        })
    }

    /// Scoped unit of work: commit on `Ok`, roll back on `Err`
    ///
    /// The closure must leave finalization to this method; the session it
    /// receives is finalized exactly once on every exit path.
    pub async fn with_session<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        F: for<'a> FnOnce(&'a mut Session<B>) -> BoxFuture<'a, Result<T, StoreError>>,
    {
        let mut session = self.open().await?;
        match f(&mut session).await {
            Ok(value) => {
                session.commit().await?;
                Ok(value)
            }
            Err(err) => {
                if session.is_open() {
                    if let Err(rollback_err) = session.rollback().await {
                        warn!(error = %rollback_err, "Rollback failed while handling an error");
                    }
                }
                Err(err)
            }
        }
    }
}
