//! Shared runtime handed to the request lifecycle once configuration commits.

use crate::config::Settings;
use crate::engine::Engine;
use crate::registry::ModelRegistry;
use sqlx::PgPool;
use std::sync::Arc;

pub struct DbRuntime<E: Engine = PgPool> {
    pub engine: E,
    /// Frozen after the configuration commit.
    pub registry: Arc<ModelRegistry>,
    pub settings: Arc<Settings>,
}
