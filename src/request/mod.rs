//! Request integration: lifecycle middleware, read-only policy and extractors.

mod context;
mod lifecycle;
mod read_only;

pub use context::{FinishGuard, RequestContext};
pub use lifecycle::{request_lifecycle, with_request_sessions, MAX_BUFFERED_BODY};
pub use read_only::{infer_read_only, read_only, ReadOnly, ReadOnlyLayer, ReadOnlyService, ReadOnlyState};

use crate::engine::Engine;
use crate::error::{AppError, ConfigError};
use crate::session::RequestSession;
use async_trait::async_trait;
use axum::{extract::FromRequestParts, http::request::Parts};
use sqlx::PgPool;
use std::ops::Deref;
use std::sync::Arc;

fn context<E: Engine>(parts: &Parts) -> Result<Arc<RequestContext<E>>, AppError> {
    parts
        .extensions
        .get::<Arc<RequestContext<E>>>()
        .cloned()
        .ok_or_else(|| ConfigError::MissingLayer.into())
}

/// The request's session. Extracting it creates the session on first use;
/// every extraction within one request yields the same session.
pub struct DbSession<E: Engine = PgPool>(pub Arc<RequestSession<E::Conn>>);

impl<E: Engine> Deref for DbSession<E> {
    type Target = RequestSession<E::Conn>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

#[async_trait]
impl<S, E> FromRequestParts<S> for DbSession<E>
where
    S: Send + Sync,
    E: Engine,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let ctx = context::<E>(parts)?;
        ctx.read_only().decide(parts.extensions.get::<ReadOnly>().copied());
        Ok(DbSession(ctx.session().await?))
    }
}

/// The read-only decision for this request, fixed on first extraction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReadOnlyDecision(pub bool);

#[async_trait]
impl<S> FromRequestParts<S> for ReadOnlyDecision
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let state = parts
            .extensions
            .get::<Arc<ReadOnlyState>>()
            .ok_or(ConfigError::MissingLayer)?;
        Ok(ReadOnlyDecision(state.decide(parts.extensions.get::<ReadOnly>().copied())))
    }
}

/// Handle on the request context, for handlers that need the transaction
/// manager or finished callbacks directly.
pub struct RequestScope<E: Engine = PgPool>(pub Arc<RequestContext<E>>);

impl<E: Engine> Deref for RequestScope<E> {
    type Target = RequestContext<E>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

#[async_trait]
impl<S, E> FromRequestParts<S> for RequestScope<E>
where
    S: Send + Sync,
    E: Engine,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(RequestScope(context::<E>(parts)?))
    }
}
