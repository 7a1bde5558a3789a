//! Example consumer: a server using deferred-sqlx for its models and sessions.
//!
//! Run from repo root: `cargo run -p example-consumer`
//! Create tables without migrations: `cargo run -p example-consumer -- create-all`

mod models;
mod routes;

use deferred_sqlx::{
    ensure_db_migrated, with_request_sessions, Configurator, DeclarativeBase, ModelEvent, ScriptHistory,
    Settings,
};
use models::{Note, User};
use serde_json::Value;
use tokio::net::TcpListener;
use tower_http::limit::RequestBodyLimitLayer;

const BASE: &str = "main";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("deferred_sqlx=info,example_consumer=info")),
        )
        .init();

    let settings = Settings::from_env()?;
    let config = Configurator::new(settings);
    let base = DeclarativeBase::new(BASE);
    config.declare::<User>(&base);
    config.declare::<Note>(&base);
    config.listens_for::<User, _>(ModelEvent::BeforeInsert, |_, user| {
        if let Value::String(email) = user.get("email")? {
            user.set("email", Value::String(email.trim().to_lowercase()))?;
        }
        Ok(())
    });
    config.create_engine()?;

    if std::env::args().nth(1).as_deref() == Some("create-all") {
        config.enter_migration_tool();
        let runtime = config.into_runtime()?;
        runtime.registry.create_all(&runtime.engine, BASE).await?;
        tracing::info!("tables created");
        return Ok(());
    }

    ensure_db_migrated(&config, &ScriptHistory).await?;
    let runtime = config.into_runtime()?;

    let app = with_request_sessions(routes::routes(), runtime).layer(RequestBodyLimitLayer::new(
        deferred_sqlx::request::MAX_BUFFERED_BODY,
    ));

    let listener = TcpListener::bind("127.0.0.1:3000").await?;
    tracing::info!("example consumer listening on http://{}", listener.local_addr()?);
    axum::serve(listener, app).await?;
    Ok(())
}
