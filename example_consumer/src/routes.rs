//! HTTP routes of the example application.

use crate::models::{Note, User};
use axum::{
    extract::Path,
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use deferred_sqlx::{read_only, AppError, DbSession, Model, ReadOnlyDecision};
use serde_json::{json, Value};
use uuid::Uuid;

fn fields(body: Value) -> Result<serde_json::Map<String, Value>, AppError> {
    match body {
        Value::Object(map) => Ok(map),
        _ => Err(AppError::BadRequest("expected a JSON object".into())),
    }
}

fn render<M: Model>(model: &M) -> Result<Value, AppError> {
    let mut out = serde_json::Map::new();
    for column in M::definition().column_names() {
        out.insert(column.clone(), model.get(column)?);
    }
    Ok(Value::Object(out))
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

async fn create_user(session: DbSession, Json(body): Json<Value>) -> Result<(StatusCode, Json<Value>), AppError> {
    let mut user = User::new_with(fields(body)?)?;
    session.add(&mut user).await?;
    tracing::info!(user = ?user, "user created");
    Ok((StatusCode::CREATED, Json(render(&user)?)))
}

async fn get_user(session: DbSession, Path(id): Path<Uuid>) -> Result<Json<Value>, AppError> {
    let user = session
        .get::<User>(id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("user {id}")))?;
    Ok(Json(render(&user)?))
}

async fn create_note(
    session: DbSession,
    Path(user_id): Path<Uuid>,
    Json(body): Json<Value>,
) -> Result<(StatusCode, Json<Value>), AppError> {
    let mut fields = fields(body)?;
    fields.insert("user_id".into(), Value::String(user_id.to_string()));
    let mut note = Note::new_with(fields)?;
    session.add(&mut note).await?;
    Ok((StatusCode::CREATED, Json(render(&note)?)))
}

/// POST for a long query body, but the work is pure reads.
async fn search_users(session: DbSession, decision: ReadOnlyDecision) -> Result<Json<Value>, AppError> {
    let count = session.fetch_scalar("SELECT count(*)::text FROM users").await?;
    Ok(Json(json!({ "read_only": decision.0, "users": count })))
}

pub fn routes() -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/users", post(create_user))
        .route("/users/:id", get(get_user))
        .route("/users/:id/notes", post(create_note))
        .route("/users/search", post(search_users).layer(read_only(true)))
}
