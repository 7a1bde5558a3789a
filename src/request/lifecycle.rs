//! Request lifecycle middleware: one context per attempt, commit or abort
//! after the handler, retry on transient failures.

use super::context::{FinishGuard, RequestContext};
use crate::engine::Engine;
use crate::error::{AppError, RetryableFailure};
use crate::state::DbRuntime;
use crate::tm::commit_veto;
use axum::{
    body::{Body, Bytes},
    extract::{Request, State},
    http::request::Parts,
    middleware::{from_fn_with_state, Next},
    response::{IntoResponse, Response},
    Router,
};
use http_body_util::{BodyExt, LengthLimitError, Limited};
use std::sync::Arc;

/// Largest request body buffered for replay on retry.
pub const MAX_BUFFERED_BODY: usize = 2 * 1024 * 1024;

/// Install the request lifecycle on every route of `router`.
pub fn with_request_sessions<E: Engine>(router: Router, runtime: Arc<DbRuntime<E>>) -> Router {
    router.layer(from_fn_with_state(runtime, request_lifecycle::<E>))
}

enum Outcome {
    Done(Response),
    /// Transient failure; `last` is returned if no attempt remains.
    Retry { reason: String, last: Response },
}

pub async fn request_lifecycle<E: Engine>(
    State(runtime): State<Arc<DbRuntime<E>>>,
    request: Request,
    next: Next,
) -> Response {
    let (parts, body) = request.into_parts();
    let body = match Limited::new(body, MAX_BUFFERED_BODY).collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) if e.is::<LengthLimitError>() => {
            return AppError::PayloadTooLarge(MAX_BUFFERED_BODY).into_response()
        }
        Err(e) => return AppError::BadRequest(format!("reading request body: {e}")).into_response(),
    };
    let attempts = runtime.settings.retry_attempts.max(1);
    let mut attempt = 1;
    loop {
        let request = rebuild(&parts, &body);
        match run_attempt(&runtime, request, next.clone(), attempt).await {
            Outcome::Done(response) => return response,
            Outcome::Retry { reason, .. } if attempt < attempts => {
                tracing::warn!(attempt, attempts, reason = %reason, "transient failure, retrying request");
                attempt += 1;
            }
            Outcome::Retry { reason, last } => {
                tracing::warn!(attempts, reason = %reason, "transient failure, retries exhausted");
                return last;
            }
        }
    }
}

async fn run_attempt<E: Engine>(
    runtime: &Arc<DbRuntime<E>>,
    mut request: Request,
    next: Next,
    attempt: u32,
) -> Outcome {
    let ctx = Arc::new(RequestContext::new(runtime.clone(), request.method().clone(), attempt));
    let _finish = FinishGuard(ctx.clone());
    request.extensions_mut().insert(ctx.read_only().clone());
    request.extensions_mut().insert(ctx.clone());

    let response = next.run(request).await;

    if response.extensions().get::<RetryableFailure>().is_some() {
        if let Err(e) = ctx.tm().abort().await {
            tracing::warn!(error = %e, "abort after transient failure");
        }
        return Outcome::Retry {
            reason: format!("handler responded {}", response.status()),
            last: response,
        };
    }
    if ctx.tm().is_doomed() || commit_veto(response.status(), response.headers()) {
        tracing::warn!(status = %response.status(), "transaction vetoed");
        if let Err(e) = ctx.tm().abort().await {
            tracing::warn!(error = %e, "abort failed");
        }
        return Outcome::Done(response);
    }
    match ctx.tm().commit().await {
        Ok(()) => Outcome::Done(response),
        Err(e) if e.is_retryable() => Outcome::Retry {
            reason: format!("commit failed: {e}"),
            last: e.into_response(),
        },
        Err(e) => {
            tracing::warn!(error = %e, "commit failed");
            Outcome::Done(e.into_response())
        }
    }
}

fn rebuild(parts: &Parts, body: &Bytes) -> Request {
    let mut request = Request::new(Body::from(body.clone()));
    *request.method_mut() = parts.method.clone();
    *request.uri_mut() = parts.uri.clone();
    *request.version_mut() = parts.version;
    *request.headers_mut() = parts.headers.clone();
    *request.extensions_mut() = parts.extensions.clone();
    request
}
