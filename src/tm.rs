//! Per-request transaction manager. Sessions join it; the lifecycle middleware
//! commits or aborts it once the handler produced a response.

use crate::error::AppError;
use async_trait::async_trait;
use axum::http::{HeaderMap, StatusCode};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

/// Header a handler can set to force the outcome: `commit` or `abort`.
pub const TM_HEADER: &str = "x-tm";

#[async_trait]
pub trait Participant: Send + Sync {
    async fn commit(&self) -> Result<(), AppError>;
    async fn rollback(&self) -> Result<(), AppError>;
}

#[derive(Default)]
pub struct TransactionManager {
    participants: Mutex<Vec<Arc<dyn Participant>>>,
    doomed: AtomicBool,
}

impl TransactionManager {
    pub fn join(&self, participant: Arc<dyn Participant>) {
        self.participants
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(participant);
    }

    pub fn participants(&self) -> usize {
        self.participants
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Force an abort regardless of the response.
    pub fn doom(&self) {
        self.doomed.store(true, Ordering::Release);
    }

    pub fn is_doomed(&self) -> bool {
        self.doomed.load(Ordering::Acquire)
    }

    fn snapshot(&self) -> Vec<Arc<dyn Participant>> {
        self.participants
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Commit participants in join order. On the first failure the remaining
    /// participants are rolled back and the failure is returned.
    pub async fn commit(&self) -> Result<(), AppError> {
        if self.is_doomed() {
            return self.abort().await;
        }
        let participants = self.snapshot();
        for (i, p) in participants.iter().enumerate() {
            if let Err(e) = p.commit().await {
                for rest in &participants[i..] {
                    if let Err(re) = rest.rollback().await {
                        tracing::warn!(error = %re, "rollback after failed commit");
                    }
                }
                return Err(e);
            }
        }
        Ok(())
    }

    /// Roll back every participant, returning the first failure.
    pub async fn abort(&self) -> Result<(), AppError> {
        let mut first = None;
        for p in self.snapshot() {
            if let Err(e) = p.rollback().await {
                first.get_or_insert(e);
            }
        }
        first.map_or(Ok(()), Err)
    }
}

/// Abort on 4xx/5xx responses unless `x-tm: commit`; `x-tm: abort` always aborts.
pub fn commit_veto(status: StatusCode, headers: &HeaderMap) -> bool {
    match headers.get(TM_HEADER).and_then(|v| v.to_str().ok()) {
        Some(v) if v.eq_ignore_ascii_case("abort") => true,
        Some(v) if v.eq_ignore_ascii_case("commit") => false,
        _ => status.is_client_error() || status.is_server_error(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[derive(Default)]
    struct Probe {
        fail_commit: bool,
        log: Mutex<Vec<&'static str>>,
    }

    #[async_trait]
    impl Participant for Probe {
        async fn commit(&self) -> Result<(), AppError> {
            self.log.lock().unwrap().push("commit");
            if self.fail_commit {
                return Err(AppError::SessionClosed);
            }
            Ok(())
        }

        async fn rollback(&self) -> Result<(), AppError> {
            self.log.lock().unwrap().push("rollback");
            Ok(())
        }
    }

    #[test]
    fn veto_follows_status_and_header() {
        let mut headers = HeaderMap::new();
        assert!(!commit_veto(StatusCode::OK, &headers));
        assert!(commit_veto(StatusCode::NOT_FOUND, &headers));
        assert!(commit_veto(StatusCode::INTERNAL_SERVER_ERROR, &headers));
        headers.insert(TM_HEADER, HeaderValue::from_static("commit"));
        assert!(!commit_veto(StatusCode::CONFLICT, &headers));
        headers.insert(TM_HEADER, HeaderValue::from_static("abort"));
        assert!(commit_veto(StatusCode::OK, &headers));
    }

    #[tokio::test]
    async fn failed_commit_rolls_back_the_rest() {
        let tm = TransactionManager::default();
        let a = Arc::new(Probe::default());
        let b = Arc::new(Probe {
            fail_commit: true,
            ..Default::default()
        });
        let c = Arc::new(Probe::default());
        tm.join(a.clone());
        tm.join(b.clone());
        tm.join(c.clone());
        assert!(tm.commit().await.is_err());
        assert_eq!(*a.log.lock().unwrap(), ["commit"]);
        assert_eq!(*b.log.lock().unwrap(), ["commit", "rollback"]);
        assert_eq!(*c.log.lock().unwrap(), ["rollback"]);
    }

    #[tokio::test]
    async fn doomed_transaction_aborts() {
        let tm = TransactionManager::default();
        let a = Arc::new(Probe::default());
        tm.join(a.clone());
        tm.doom();
        tm.commit().await.unwrap();
        assert_eq!(*a.log.lock().unwrap(), ["rollback"]);
    }
}
