//! Request-scoped sessions: one connection, one isolation mode, closed once.

mod pg;

use crate::engine::{Connection, Engine};
use crate::error::AppError;
use crate::model::SessionLiveness;
use crate::registry::ModelRegistry;
use crate::tm::Participant;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::{MappedMutexGuard, Mutex, MutexGuard};
use uuid::Uuid;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IsolationMode {
    ReadWrite,
    /// Serializable, read only, deferrable: the database may wait for a safe
    /// snapshot instead of risking serialization failures.
    ReadOnlySerializableDeferrable,
}

impl IsolationMode {
    pub fn for_read_only(read_only: bool) -> Self {
        if read_only {
            IsolationMode::ReadOnlySerializableDeferrable
        } else {
            IsolationMode::ReadWrite
        }
    }

    pub fn begin_statement(self) -> &'static str {
        match self {
            IsolationMode::ReadWrite => "BEGIN",
            IsolationMode::ReadOnlySerializableDeferrable => {
                "BEGIN ISOLATION LEVEL SERIALIZABLE READ ONLY DEFERRABLE"
            }
        }
    }
}

struct SessionState<C> {
    conn: Option<C>,
    in_transaction: bool,
}

/// Connection of an open session, inside its transaction.
pub type SessionConnection<'a, C> = MappedMutexGuard<'a, C>;

pub struct RequestSession<C: Connection> {
    id: Uuid,
    isolation: IsolationMode,
    state: Mutex<SessionState<C>>,
    liveness: Arc<SessionLiveness>,
    registry: Arc<ModelRegistry>,
}

impl<C: Connection> RequestSession<C> {
    /// Check out a connection and, for read-only work, start the transaction
    /// at serializable read-only deferrable isolation right away.
    pub async fn open<E>(engine: &E, read_only: bool, registry: Arc<ModelRegistry>) -> Result<Self, AppError>
    where
        E: Engine<Conn = C>,
    {
        let conn = engine.acquire().await?;
        let session = RequestSession {
            id: Uuid::new_v4(),
            isolation: IsolationMode::for_read_only(read_only),
            state: Mutex::new(SessionState {
                conn: Some(conn),
                in_transaction: false,
            }),
            liveness: Arc::new(SessionLiveness::default()),
            registry,
        };
        if read_only {
            session.connection().await?;
        }
        tracing::debug!(session = %session.id, isolation = ?session.isolation, "session opened");
        Ok(session)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn isolation(&self) -> IsolationMode {
        self.isolation
    }

    pub fn is_closed(&self) -> bool {
        self.liveness.is_closed()
    }

    pub fn liveness(&self) -> &Arc<SessionLiveness> {
        &self.liveness
    }

    pub fn registry(&self) -> &ModelRegistry {
        &self.registry
    }

    /// The session's connection, with its transaction begun. Fails once the
    /// session is closed; a closed session never reconnects.
    pub async fn connection(&self) -> Result<SessionConnection<'_, C>, AppError> {
        let mut state = self.state.lock().await;
        if self.liveness.is_closed() {
            return Err(AppError::SessionClosed);
        }
        if !state.in_transaction {
            let begin = self.isolation.begin_statement();
            let conn = state.conn.as_mut().ok_or(AppError::SessionClosed)?;
            conn.execute(begin).await?;
            state.in_transaction = true;
        }
        MutexGuard::try_map(state, |s| s.conn.as_mut()).map_err(|_| AppError::SessionClosed)
    }

    pub async fn execute(&self, sql: &str) -> Result<u64, AppError> {
        self.connection().await?.execute(sql).await
    }

    pub async fn fetch_scalar(&self, sql: &str) -> Result<Option<String>, AppError> {
        self.connection().await?.fetch_scalar(sql).await
    }

    async fn end_transaction(&self, statement: &str) -> Result<(), AppError> {
        let mut state = self.state.lock().await;
        if !state.in_transaction {
            return Ok(());
        }
        let conn = state.conn.as_mut().ok_or(AppError::SessionClosed)?;
        conn.execute(statement).await?;
        state.in_transaction = false;
        self.liveness.expire_all();
        Ok(())
    }

    /// Release the connection. Only the first call has an effect; returns
    /// whether this call closed the session.
    pub fn close(&self) -> bool {
        if !self.liveness.close() {
            return false;
        }
        match self.state.try_lock() {
            Ok(mut state) => {
                if let Some(conn) = state.conn.take() {
                    conn.release(state.in_transaction);
                }
                state.in_transaction = false;
            }
            Err(_) => {
                tracing::warn!(session = %self.id, "session busy while closing; connection released on drop");
            }
        }
        tracing::debug!(session = %self.id, "session closed");
        true
    }
}

impl<C: Connection> Drop for RequestSession<C> {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        if let Some(conn) = state.conn.take() {
            conn.release(state.in_transaction);
        }
    }
}

#[async_trait]
impl<C: Connection> Participant for RequestSession<C> {
    async fn commit(&self) -> Result<(), AppError> {
        if self.liveness.is_closed() {
            return Err(AppError::SessionClosed);
        }
        self.end_transaction("COMMIT").await
    }

    async fn rollback(&self) -> Result<(), AppError> {
        if self.liveness.is_closed() {
            return Ok(());
        }
        self.end_transaction("ROLLBACK").await
    }
}
