//! Deferred SQLx: request-scoped PostgreSQL sessions and deferred model
//! attachment for axum applications.

pub mod config;
pub mod engine;
pub mod error;
pub mod migration;
pub mod model;
pub mod naming;
pub mod registry;
pub mod request;
pub mod session;
pub mod state;
pub mod tm;

pub use config::{Configurator, Phase, Settings};
pub use engine::{Connection, Engine};
pub use error::{AppError, ConfigError, MigrationError};
pub use migration::{check_db_migrated, ensure_db_migrated, MigrationCheck, MigrationConfig, ScriptHistory};
pub use model::{ColumnDef, Model, ModelBase, ModelDefinition};
pub use naming::NamingConvention;
pub use registry::{AttachOptions, DeclarativeBase, MetaData, ModelEvent, ModelRegistry};
pub use request::{read_only, with_request_sessions, DbSession, ReadOnlyDecision, RequestScope};
pub use session::{IsolationMode, RequestSession};
pub use state::DbRuntime;
pub use tm::TransactionManager;
