//! Per-route read-only policy.

use axum::http::{Method, Request};
use std::sync::{Arc, OnceLock};
use std::task::{Context, Poll};
use tower::{Layer, Service};

/// Route annotation overriding the method-based inference.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReadOnly(pub bool);

/// Layer marking every request of a route as read-only (or not).
///
/// ```ignore
/// Router::new().route("/report", post(build_report).layer(read_only(true)))
/// ```
pub fn read_only(flag: bool) -> ReadOnlyLayer {
    ReadOnlyLayer(ReadOnly(flag))
}

/// Fixes the request's read-only decision from the route annotation before
/// anything below the route can open a session.
#[derive(Clone, Copy, Debug)]
pub struct ReadOnlyLayer(ReadOnly);

impl<S> Layer<S> for ReadOnlyLayer {
    type Service = ReadOnlyService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        ReadOnlyService {
            inner,
            annotation: self.0,
        }
    }
}

#[derive(Clone, Debug)]
pub struct ReadOnlyService<S> {
    inner: S,
    annotation: ReadOnly,
}

impl<S, B> Service<Request<B>> for ReadOnlyService<S>
where
    S: Service<Request<B>>,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = S::Future;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut request: Request<B>) -> Self::Future {
        if let Some(state) = request.extensions().get::<Arc<ReadOnlyState>>() {
            state.decide(Some(self.annotation));
        }
        request.extensions_mut().insert(self.annotation);
        self.inner.call(request)
    }
}

/// GET, HEAD and OPTIONS are read-only unless annotated otherwise.
pub fn infer_read_only(method: &Method) -> bool {
    method == Method::GET || method == Method::HEAD || method == Method::OPTIONS
}

/// The read-only decision of one request. Made at most once, before the
/// session is created, and fixed afterwards.
#[derive(Debug)]
pub struct ReadOnlyState {
    method: Method,
    decision: OnceLock<bool>,
}

impl ReadOnlyState {
    pub fn new(method: Method) -> Self {
        ReadOnlyState {
            method,
            decision: OnceLock::new(),
        }
    }

    /// Decide from the route annotation, or the method when there is none.
    /// Later calls return the first decision.
    pub fn decide(&self, annotation: Option<ReadOnly>) -> bool {
        *self.decision.get_or_init(|| match annotation {
            Some(ReadOnly(flag)) => flag,
            None => infer_read_only(&self.method),
        })
    }

    pub fn decision(&self) -> Option<bool> {
        self.decision.get().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn safe_methods_are_read_only() {
        for method in [Method::GET, Method::HEAD, Method::OPTIONS] {
            assert!(ReadOnlyState::new(method).decide(None));
        }
        for method in [Method::POST, Method::PUT, Method::PATCH, Method::DELETE] {
            assert!(!ReadOnlyState::new(method).decide(None));
        }
    }

    #[test]
    fn annotation_wins_over_method() {
        assert!(!ReadOnlyState::new(Method::GET).decide(Some(ReadOnly(false))));
        assert!(ReadOnlyState::new(Method::POST).decide(Some(ReadOnly(true))));
    }

    #[test]
    fn decision_is_made_once() {
        let state = ReadOnlyState::new(Method::POST);
        assert_eq!(state.decision(), None);
        assert!(!state.decide(None));
        assert!(!state.decide(Some(ReadOnly(true))));
        assert_eq!(state.decision(), Some(false));
    }

    #[tokio::test]
    async fn layer_decides_before_the_inner_service() {
        use tower::ServiceExt;

        let state = Arc::new(ReadOnlyState::new(Method::POST));
        let svc = read_only(true).layer(tower::service_fn(|request: Request<()>| async move {
            let seen = request.extensions().get::<Arc<ReadOnlyState>>().and_then(|s| s.decision());
            Ok::<_, std::convert::Infallible>(seen)
        }));
        let mut request = Request::new(());
        request.extensions_mut().insert(state.clone());
        assert_eq!(svc.oneshot(request).await.unwrap(), Some(true));
        assert_eq!(state.decision(), Some(true));
    }
}
