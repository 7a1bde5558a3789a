//! Engine and connection seam. The process-wide engine is a thread-safe pool;
//! checkout and checkin are the only shared-resource interaction.

use crate::error::AppError;
use async_trait::async_trait;
use sqlx::pool::PoolConnection;
use sqlx::{PgPool, Postgres};

#[async_trait]
pub trait Connection: Send + 'static {
    /// Run a statement, returning the affected row count.
    async fn execute(&mut self, sql: &str) -> Result<u64, AppError>;

    /// First column of the first row, as text.
    async fn fetch_scalar(&mut self, sql: &str) -> Result<Option<String>, AppError>;

    /// Return the connection to its pool, or close it when `discard` is set
    /// (e.g. it may still be inside a transaction).
    fn release(self, discard: bool)
    where
        Self: Sized;
}

#[async_trait]
pub trait Engine: Clone + Send + Sync + 'static {
    type Conn: Connection;

    async fn acquire(&self) -> Result<Self::Conn, AppError>;
}

#[async_trait]
impl Engine for PgPool {
    type Conn = PoolConnection<Postgres>;

    async fn acquire(&self) -> Result<Self::Conn, AppError> {
        Ok(PgPool::acquire(self).await?)
    }
}

#[async_trait]
impl Connection for PoolConnection<Postgres> {
    async fn execute(&mut self, sql: &str) -> Result<u64, AppError> {
        let done = sqlx::query(sql).execute(&mut **self).await?;
        Ok(done.rows_affected())
    }

    async fn fetch_scalar(&mut self, sql: &str) -> Result<Option<String>, AppError> {
        let value: Option<Option<String>> = sqlx::query_scalar(sql).fetch_optional(&mut **self).await?;
        Ok(value.flatten())
    }

    fn release(self, discard: bool) {
        if discard {
            drop(self.detach());
        }
    }
}

/// In-memory engine that records statements; for tests and local demos.
pub mod testing {
    use super::*;
    use std::collections::{HashMap, VecDeque};
    use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

    #[derive(Debug, Default)]
    struct Shared {
        next_conn: usize,
        statements: Vec<(usize, String)>,
        released: Vec<(usize, bool)>,
        scalars: HashMap<String, Option<String>>,
        failures: VecDeque<(String, fn() -> AppError)>,
        acquire_failures: VecDeque<fn() -> AppError>,
    }

    #[derive(Clone, Debug, Default)]
    pub struct RecordingEngine {
        shared: Arc<Mutex<Shared>>,
    }

    impl RecordingEngine {
        fn shared(&self) -> MutexGuard<'_, Shared> {
            self.shared.lock().unwrap_or_else(PoisonError::into_inner)
        }

        /// Answer `sql` with `value` from `fetch_scalar`.
        pub fn answer(&self, sql: &str, value: Option<&str>) {
            self.shared()
                .scalars
                .insert(sql.to_string(), value.map(String::from));
        }

        /// Fail the next statement starting with `prefix`.
        pub fn fail_next(&self, prefix: &str, error: fn() -> AppError) {
            self.shared().failures.push_back((prefix.to_string(), error));
        }

        pub fn fail_next_acquire(&self, error: fn() -> AppError) {
            self.shared().acquire_failures.push_back(error);
        }

        /// All statements as `(connection number, sql)`.
        pub fn statements(&self) -> Vec<(usize, String)> {
            self.shared().statements.clone()
        }

        pub fn connections_opened(&self) -> usize {
            self.shared().next_conn
        }

        /// Releases as `(connection number, discarded)`.
        pub fn released(&self) -> Vec<(usize, bool)> {
            self.shared().released.clone()
        }
    }

    #[derive(Debug)]
    pub struct RecordingConnection {
        number: usize,
        engine: RecordingEngine,
    }

    impl RecordingConnection {
        fn record(&self, sql: &str) -> Result<(), AppError> {
            let mut shared = self.engine.shared();
            shared.statements.push((self.number, sql.to_string()));
            let hit = shared.failures.iter().position(|(p, _)| sql.starts_with(p.as_str()));
            match hit.and_then(|i| shared.failures.remove(i)) {
                Some((_, error)) => Err(error()),
                None => Ok(()),
            }
        }
    }

    #[async_trait]
    impl Engine for RecordingEngine {
        type Conn = RecordingConnection;

        async fn acquire(&self) -> Result<Self::Conn, AppError> {
            let mut shared = self.shared();
            if let Some(error) = shared.acquire_failures.pop_front() {
                return Err(error());
            }
            shared.next_conn += 1;
            Ok(RecordingConnection {
                number: shared.next_conn,
                engine: self.clone(),
            })
        }
    }

    #[async_trait]
    impl Connection for RecordingConnection {
        async fn execute(&mut self, sql: &str) -> Result<u64, AppError> {
            self.record(sql)?;
            Ok(0)
        }

        async fn fetch_scalar(&mut self, sql: &str) -> Result<Option<String>, AppError> {
            self.record(sql)?;
            Ok(self.engine.shared().scalars.get(sql).cloned().flatten())
        }

        fn release(self, discard: bool) {
            self.engine.shared().released.push((self.number, discard));
        }
    }
}
