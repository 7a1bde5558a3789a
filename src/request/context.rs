//! Request-scoped context: lazily created session, transaction manager and
//! finished callbacks.

use super::read_only::ReadOnlyState;
use crate::engine::Engine;
use crate::error::AppError;
use crate::session::RequestSession;
use crate::state::DbRuntime;
use crate::tm::TransactionManager;
use axum::http::Method;
use sqlx::PgPool;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::OnceCell;

type FinishedCallback = Box<dyn FnOnce() + Send>;

pub struct RequestContext<E: Engine = PgPool> {
    runtime: Arc<DbRuntime<E>>,
    read_only: Arc<ReadOnlyState>,
    session: OnceCell<Arc<RequestSession<E::Conn>>>,
    tm: TransactionManager,
    finished: Mutex<Vec<FinishedCallback>>,
    done: AtomicBool,
    attempt: u32,
}

impl<E: Engine> RequestContext<E> {
    pub fn new(runtime: Arc<DbRuntime<E>>, method: Method, attempt: u32) -> Self {
        RequestContext {
            runtime,
            read_only: Arc::new(ReadOnlyState::new(method)),
            session: OnceCell::new(),
            tm: TransactionManager::default(),
            finished: Mutex::new(Vec::new()),
            done: AtomicBool::new(false),
            attempt,
        }
    }

    pub fn runtime(&self) -> &Arc<DbRuntime<E>> {
        &self.runtime
    }

    pub fn read_only(&self) -> &Arc<ReadOnlyState> {
        &self.read_only
    }

    pub fn tm(&self) -> &TransactionManager {
        &self.tm
    }

    /// 1-based attempt number; greater than one when the request is retried.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// The request's session, created on first use. Creating it fixes the
    /// read-only decision, joins the session to the transaction manager and
    /// schedules its close for when the request finishes.
    pub async fn session(&self) -> Result<Arc<RequestSession<E::Conn>>, AppError> {
        self.session
            .get_or_try_init(|| async {
                let read_only = self.read_only.decide(None);
                let session = Arc::new(
                    RequestSession::open(&self.runtime.engine, read_only, self.runtime.registry.clone()).await?,
                );
                self.tm.join(session.clone());
                let closing = session.clone();
                self.add_finished_callback(move || {
                    closing.close();
                });
                Ok::<_, AppError>(session)
            })
            .await
            .cloned()
    }

    /// Session if one was created during this request.
    pub fn existing_session(&self) -> Option<&Arc<RequestSession<E::Conn>>> {
        self.session.get()
    }

    /// Run `callback` when the request finishes, whatever its outcome. Runs
    /// immediately if the request already finished.
    pub fn add_finished_callback(&self, callback: impl FnOnce() + Send + 'static) {
        let mut finished = self.finished.lock().unwrap_or_else(PoisonError::into_inner);
        if self.done.load(Ordering::Acquire) {
            drop(finished);
            callback();
            return;
        }
        finished.push(Box::new(callback));
    }

    pub fn is_finished(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    /// Run the finished callbacks in registration order. Only the first call
    /// has an effect.
    pub fn finish(&self) {
        let callbacks = {
            let mut finished = self.finished.lock().unwrap_or_else(PoisonError::into_inner);
            if self.done.swap(true, Ordering::AcqRel) {
                return;
            }
            std::mem::take(&mut *finished)
        };
        for callback in callbacks {
            callback();
        }
    }
}

/// Finishes the request when dropped, so sessions close even when the
/// handler panics or its future is cancelled.
pub struct FinishGuard<E: Engine = PgPool>(pub Arc<RequestContext<E>>);

impl<E: Engine> Drop for FinishGuard<E> {
    fn drop(&mut self) {
        self.0.finish();
    }
}
