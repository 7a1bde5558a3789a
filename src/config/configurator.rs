//! Two-phase configuration host.
//!
//! Directives only record work. [`Configurator::resolve`] runs every `Collect`
//! action submitted anywhere in the application before any `Attach` action,
//! resolves the collected attachment intents once, then runs `Finalize`
//! actions against the resolved registry.

use crate::config::Settings;
use crate::engine::Engine;
use crate::error::{AppError, ConfigError};
use crate::migration::MigrationConfig;
use crate::model::{Model, ModelBase, ModelDefinition};
use crate::registry::{AttachOptions, AttachmentIntent, DeclarativeBase, ModelEvent, ModelRegistry};
use crate::state::DbRuntime;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Phase {
    /// Gather models and intents.
    Collect,
    /// Turn collected models into intents for a base.
    Attach,
    /// Runs after resolution, with the registry populated.
    Finalize,
}

type Action = Box<dyn FnOnce(&mut CommitContext) -> Result<(), ConfigError> + Send>;

struct PendingAction {
    phase: Phase,
    seq: u64,
    discriminator: Option<String>,
    callable: Action,
}

/// State handed to actions while the configuration commits.
pub struct CommitContext {
    registered: Vec<(u64, Arc<ModelDefinition>)>,
    intents: Vec<AttachmentIntent>,
    registry: ModelRegistry,
}

impl CommitContext {
    /// Models collected by `register_models`, in registration order.
    pub fn registered(&self) -> &[(u64, Arc<ModelDefinition>)] {
        &self.registered
    }

    pub fn add_intent(&mut self, intent: AttachmentIntent) {
        self.intents.push(intent);
    }

    /// Populated only once `Finalize` actions run.
    pub fn registry(&self) -> &ModelRegistry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut ModelRegistry {
        &mut self.registry
    }
}

pub struct Configurator<E = PgPool> {
    settings: Arc<Settings>,
    seq: AtomicU64,
    actions: Mutex<Vec<PendingAction>>,
    intents: Mutex<Vec<AttachmentIntent>>,
    committed: AtomicBool,
    registry: OnceLock<Arc<ModelRegistry>>,
    engine: OnceLock<E>,
    migration_tool: AtomicBool,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl<E: Engine> Configurator<E> {
    pub fn new(settings: Settings) -> Self {
        Configurator {
            settings: Arc::new(settings),
            seq: AtomicU64::new(0),
            actions: Mutex::new(Vec::new()),
            intents: Mutex::new(Vec::new()),
            committed: AtomicBool::new(false),
            registry: OnceLock::new(),
            engine: OnceLock::new(),
            migration_tool: AtomicBool::new(false),
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::Relaxed)
    }

    /// Schedule `callable` for `phase`. Among actions sharing a discriminator
    /// only the first submitted runs.
    pub fn action<F>(&self, phase: Phase, discriminator: Option<String>, callable: F)
    where
        F: FnOnce(&mut CommitContext) -> Result<(), ConfigError> + Send + 'static,
    {
        let seq = self.next_seq();
        lock(&self.actions).push(PendingAction {
            phase,
            seq,
            discriminator,
            callable: Box::new(callable),
        });
    }

    /// Record that `definition` belongs to `base`. Nothing is attached until
    /// [`resolve`](Self::resolve).
    pub fn declare_model(&self, definition: ModelDefinition, base: &DeclarativeBase, options: AttachOptions) {
        let seq = self.next_seq();
        tracing::debug!(model = definition.name(), base = base.name(), seq, "model declared");
        lock(&self.intents).push(AttachmentIntent::new(seq, Arc::new(definition), base.clone(), options));
    }

    pub fn declare<M: Model>(&self, base: &DeclarativeBase) {
        self.declare_model(M::definition().clone(), base, AttachOptions::default());
    }

    /// Collect models without choosing a base; `attach_models_to_base` picks it.
    pub fn register_models(&self, definitions: impl IntoIterator<Item = ModelDefinition>) {
        let models: Vec<(u64, Arc<ModelDefinition>)> = definitions
            .into_iter()
            .map(|d| (self.next_seq(), Arc::new(d)))
            .collect();
        self.action(Phase::Collect, None, move |ctx| {
            ctx.registered.extend(models);
            Ok(())
        });
    }

    /// Attach every model collected by `register_models` to `base`, after all
    /// collection across the application has finished.
    pub fn attach_models_to_base(&self, base: &DeclarativeBase) {
        let base = base.clone();
        let discriminator = format!("attach-models-to-base:{}", base.name());
        self.action(Phase::Attach, Some(discriminator), move |ctx| {
            let intents: Vec<AttachmentIntent> = ctx
                .registered
                .iter()
                .map(|(seq, def)| AttachmentIntent::new(*seq, def.clone(), base.clone(), AttachOptions::default()))
                .collect();
            ctx.intents.extend(intents);
            Ok(())
        });
    }

    /// Register a listener for `event` on model `M`, once the model is attached.
    pub fn listens_for<M, F>(&self, event: ModelEvent, listener: F)
    where
        M: Model,
        F: Fn(&Settings, &mut ModelBase) -> Result<(), AppError> + Send + Sync + 'static,
    {
        let model = M::definition().name().to_string();
        self.action(Phase::Finalize, None, move |ctx| {
            ctx.registry.add_listener(&model, event, Arc::new(listener))
        });
    }

    pub fn set_engine(&self, engine: E) -> Result<(), ConfigError> {
        self.engine
            .set(engine)
            .map_err(|_| ConfigError::EngineAlreadyConfigured)
    }

    pub fn engine(&self) -> Result<&E, ConfigError> {
        self.engine.get().ok_or(ConfigError::EngineNotConfigured)
    }

    pub fn migration_config(&self) -> MigrationConfig {
        MigrationConfig::from_settings(&self.settings)
    }

    /// Mark this process as a migration tool run; the freshness check then
    /// steps aside.
    pub fn enter_migration_tool(&self) {
        self.migration_tool.store(true, Ordering::Release);
    }

    pub fn migration_tool_active(&self) -> bool {
        self.migration_tool.load(Ordering::Acquire)
    }

    /// Commit the configuration: run actions phase by phase and resolve the
    /// attachment intents. Runs once; the registry is frozen afterwards.
    pub fn resolve(&self) -> Result<Arc<ModelRegistry>, ConfigError> {
        if self.committed.swap(true, Ordering::AcqRel) {
            return Err(ConfigError::AlreadyCommitted);
        }
        let mut actions = std::mem::take(&mut *lock(&self.actions));
        let declared = std::mem::take(&mut *lock(&self.intents));
        actions.sort_by_key(|a| (a.phase, a.seq));

        let mut seen = HashSet::new();
        actions.retain(|a| match &a.discriminator {
            Some(d) if !seen.insert(d.clone()) => {
                tracing::debug!(discriminator = %d, "duplicate action dropped");
                false
            }
            _ => true,
        });

        let mut ctx = CommitContext {
            registered: Vec::new(),
            intents: declared,
            registry: ModelRegistry::new(self.settings.clone()),
        };
        let mut actions = actions.into_iter().peekable();
        while let Some(action) = actions.next_if(|a| a.phase < Phase::Finalize) {
            (action.callable)(&mut ctx)?;
        }
        let intents = std::mem::take(&mut ctx.intents);
        ctx.registry.resolve(intents)?;
        for action in actions {
            (action.callable)(&mut ctx)?;
        }

        let registry = Arc::new(ctx.registry);
        let _ = self.registry.set(registry.clone());
        Ok(registry)
    }

    /// Registry from a successful [`resolve`](Self::resolve).
    pub fn registry(&self) -> Option<&Arc<ModelRegistry>> {
        self.registry.get()
    }

    /// Resolve if not done yet and bundle the engine, registry and settings.
    pub fn into_runtime(self) -> Result<Arc<DbRuntime<E>>, ConfigError> {
        let registry = match self.registry.get() {
            Some(r) => r.clone(),
            None => self.resolve()?,
        };
        let engine = self.engine.into_inner().ok_or(ConfigError::EngineNotConfigured)?;
        Ok(Arc::new(DbRuntime {
            engine,
            registry,
            settings: self.settings,
        }))
    }
}

impl Configurator<PgPool> {
    /// Create the process-wide connection pool from `DATABASE_URL` and store it
    /// as this configuration's engine. Connections open on first use.
    pub fn create_engine(&self) -> Result<PgPool, ConfigError> {
        let url = self
            .settings
            .database_url
            .as_deref()
            .ok_or(ConfigError::MissingSetting(crate::config::DATABASE_URL))?;
        let pool = PgPoolOptions::new()
            .max_connections(self.settings.max_connections)
            .connect_lazy(url)
            .map_err(|e| ConfigError::Engine(e.to_string()))?;
        self.set_engine(pool.clone())?;
        tracing::info!(max_connections = self.settings.max_connections, "engine created");
        Ok(pool)
    }
}
