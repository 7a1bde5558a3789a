//! Shared model registry: attachment of declared models to declarative bases.
//!
//! The registry is populated once, by [`ModelRegistry::resolve`], during the
//! configuration commit. After that it is handed out behind an `Arc` and never
//! mutated again.

mod intent;
mod listeners;
mod metadata;

pub use intent::{AttachOptions, AttachmentIntent};
pub use listeners::{Listener, Listeners, ModelEvent};
pub use metadata::{
    Check, DeclarativeBase, ForeignKey, MetaData, NamedConstraint, Table, TableColumn,
};
pub(crate) use metadata::quote;

use crate::config::Settings;
use crate::engine::{Connection, Engine};
use crate::error::{AppError, ConfigError};
use crate::model::{ModelBase, ModelDefinition, RelationshipKind};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

/// A model after structural attachment.
#[derive(Clone, Debug)]
pub struct MappedModel {
    pub definition: Arc<ModelDefinition>,
    pub base: String,
    pub table: Table,
    pub options: AttachOptions,
}

/// Diagnostic record emitted for every attachment.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Introspectable {
    pub category: &'static str,
    pub title: String,
    pub base: String,
    pub model: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AttachOutcome {
    Attached,
    AlreadyAttached,
}

#[derive(Clone, Debug)]
struct BaseEntry {
    base: DeclarativeBase,
    models: BTreeMap<String, MappedModel>,
    /// table name -> model name
    tables: HashMap<String, String>,
    order: Vec<String>,
}

#[derive(Debug, Default)]
pub struct ModelRegistry {
    bases: BTreeMap<String, BaseEntry>,
    /// model name -> base name
    attached: HashMap<String, String>,
    introspection: Vec<Introspectable>,
    listeners: Listeners,
    settings: Arc<Settings>,
}

impl ModelRegistry {
    pub fn new(settings: Arc<Settings>) -> Self {
        ModelRegistry {
            settings,
            ..Default::default()
        }
    }

    /// Apply every intent in registration order, then check cross-model
    /// references. The first registration of a model wins; a later intent
    /// naming a different base is a conflict.
    pub fn resolve(&mut self, mut intents: Vec<AttachmentIntent>) -> Result<(), ConfigError> {
        intents.sort_by_key(|i| i.seq);
        let mut attached = 0usize;
        for intent in &intents {
            if self.attach(intent)? == AttachOutcome::Attached {
                attached += 1;
            }
        }
        self.check_references()?;
        tracing::info!(
            intents = intents.len(),
            attached,
            bases = self.bases.len(),
            "model registry resolved"
        );
        Ok(())
    }

    /// Attach one intent. Leaves the registry unchanged on error.
    pub fn attach(&mut self, intent: &AttachmentIntent) -> Result<AttachOutcome, ConfigError> {
        let model = intent.definition().name();
        let base_name = intent.base().name();

        if let Some(existing) = self.attached.get(model) {
            if existing != base_name {
                tracing::warn!(model, existing = %existing, requested = base_name, "conflicting attachment");
                return Err(ConfigError::Conflict {
                    model: model.to_string(),
                    existing: existing.clone(),
                    requested: base_name.to_string(),
                });
            }
            if !intent.options().idempotent {
                return Err(ConfigError::DuplicateAttachment {
                    model: model.to_string(),
                    base: base_name.to_string(),
                });
            }
            let mapped = self.lookup(base_name, model).ok_or_else(|| ConfigError::NotAttached(model.to_string()))?;
            if *mapped.definition != *intent.definition() || mapped.table.name != intent.table_name() {
                return Err(ConfigError::DefinitionMismatch {
                    model: model.to_string(),
                    base: base_name.to_string(),
                });
            }
            tracing::debug!(model, base = base_name, "model already attached");
            return Ok(AttachOutcome::AlreadyAttached);
        }

        let table = Table::build(intent.definition(), intent.table_name(), intent.base().metadata())?;
        if let Some(entry) = self.bases.get(base_name) {
            if let Some(owner) = entry.tables.get(&table.name) {
                return Err(ConfigError::DuplicateTable {
                    table: table.name.clone(),
                    model: model.to_string(),
                    owner: owner.clone(),
                    base: base_name.to_string(),
                });
            }
        }

        let entry = self
            .bases
            .entry(base_name.to_string())
            .or_insert_with(|| BaseEntry {
                base: intent.base().clone(),
                models: BTreeMap::new(),
                tables: HashMap::new(),
                order: Vec::new(),
            });
        entry.tables.insert(table.name.clone(), model.to_string());
        entry.order.push(model.to_string());
        entry.models.insert(
            model.to_string(),
            MappedModel {
                definition: intent.definition.clone(),
                base: base_name.to_string(),
                table,
                options: intent.options().clone(),
            },
        );
        self.attached.insert(model.to_string(), base_name.to_string());
        self.introspection.push(Introspectable {
            category: "models",
            title: intent.definition().class_name().to_string(),
            base: base_name.to_string(),
            model: model.to_string(),
        });
        tracing::debug!(model, base = base_name, table = intent.table_name(), "model attached");
        Ok(AttachOutcome::Attached)
    }

    fn check_references(&self) -> Result<(), ConfigError> {
        for entry in self.bases.values() {
            for mapped in entry.models.values() {
                for fk in &mapped.table.foreign_keys {
                    if !entry.tables.contains_key(&fk.referred_table) {
                        return Err(ConfigError::MissingReference {
                            kind: "table",
                            id: format!("{} (from {}.{})", fk.referred_table, mapped.table.name, fk.column),
                        });
                    }
                }
                for rel in mapped.definition.relationships() {
                    let target = entry.models.get(&rel.target).ok_or_else(|| ConfigError::MissingReference {
                        kind: "model",
                        id: format!("{} (relationship {}.{})", rel.target, mapped.definition.name(), rel.name),
                    })?;
                    let holder = match rel.kind {
                        RelationshipKind::ToOne => mapped,
                        RelationshipKind::ToMany => target,
                    };
                    if !holder.definition.has_column(&rel.foreign_key) {
                        return Err(ConfigError::MissingReference {
                            kind: "column",
                            id: format!("{}.{}", holder.definition.name(), rel.foreign_key),
                        });
                    }
                }
            }
        }
        Ok(())
    }

    pub(crate) fn add_listener(&mut self, model: &str, event: ModelEvent, listener: Listener) -> Result<(), ConfigError> {
        if !self.attached.contains_key(model) {
            return Err(ConfigError::NotAttached(model.to_string()));
        }
        self.listeners.add(model, event, listener);
        Ok(())
    }

    pub fn lookup(&self, base: &str, model: &str) -> Option<&MappedModel> {
        self.bases.get(base)?.models.get(model)
    }

    /// Mapping for a model regardless of base; a model belongs to at most one.
    pub fn mapped(&self, model: &str) -> Option<&MappedModel> {
        let base = self.attached.get(model)?;
        self.lookup(base, model)
    }

    pub fn base_of(&self, model: &str) -> Option<&str> {
        self.attached.get(model).map(String::as_str)
    }

    pub fn base(&self, name: &str) -> Option<&DeclarativeBase> {
        self.bases.get(name).map(|e| &e.base)
    }

    /// Models of a base in attachment order.
    pub fn models(&self, base: &str) -> Vec<&MappedModel> {
        self.bases
            .get(base)
            .map(|e| e.order.iter().filter_map(|m| e.models.get(m)).collect())
            .unwrap_or_default()
    }

    pub fn introspection(&self) -> &[Introspectable] {
        &self.introspection
    }

    pub fn listeners(&self) -> &Listeners {
        &self.listeners
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn dispatch(&self, event: ModelEvent, base: &mut ModelBase) -> Result<(), AppError> {
        self.listeners.dispatch(&self.settings, event, base)
    }

    /// DDL for every creatable table of `base`, referenced tables first.
    pub fn create_statements(&self, base: &str) -> Vec<String> {
        let Some(entry) = self.bases.get(base) else {
            return Vec::new();
        };
        let mut emitted: HashSet<&str> = HashSet::new();
        let mut out = Vec::new();
        for model in &entry.order {
            Self::emit_table(entry, model, &mut emitted, &mut HashSet::new(), &mut out);
        }
        out
    }

    fn emit_table<'a>(
        entry: &'a BaseEntry,
        model: &'a str,
        emitted: &mut HashSet<&'a str>,
        visiting: &mut HashSet<&'a str>,
        out: &mut Vec<String>,
    ) {
        if emitted.contains(model) || !visiting.insert(model) {
            return;
        }
        let Some(mapped) = entry.models.get(model) else {
            return;
        };
        for fk in &mapped.table.foreign_keys {
            if let Some(dep) = entry.tables.get(&fk.referred_table) {
                Self::emit_table(entry, dep, emitted, visiting, out);
            }
        }
        emitted.insert(model);
        if mapped.options.create {
            out.extend(mapped.table.create_statements());
        }
    }

    /// Create every table of `base` that does not exist yet.
    pub async fn create_all<E: Engine>(&self, engine: &E, base: &str) -> Result<(), AppError> {
        let mut conn = engine.acquire().await?;
        let mut result = Ok(());
        for sql in self.create_statements(base) {
            if let Err(e) = conn.execute(&sql).await {
                result = Err(e);
                break;
            }
        }
        conn.release(result.is_err());
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ColumnDef, RelationshipDef};

    fn user() -> Arc<ModelDefinition> {
        Arc::new(
            ModelDefinition::new("app::User", "users")
                .column(ColumnDef::new("email", "TEXT").not_null().unique()),
        )
    }

    fn order() -> Arc<ModelDefinition> {
        Arc::new(
            ModelDefinition::new("app::Order", "orders")
                .column(ColumnDef::new("user_id", "UUID").references("users", "id"))
                .relationship(RelationshipDef {
                    name: "user".into(),
                    target: "app::User".into(),
                    kind: RelationshipKind::ToOne,
                    foreign_key: "user_id".into(),
                }),
        )
    }

    fn intent(seq: u64, def: Arc<ModelDefinition>, base: &DeclarativeBase) -> AttachmentIntent {
        AttachmentIntent::new(seq, def, base.clone(), AttachOptions::default())
    }

    #[test]
    fn resolved_model_is_found_in_its_base() {
        let base = DeclarativeBase::new("main");
        let mut reg = ModelRegistry::default();
        reg.resolve(vec![intent(1, user(), &base)]).unwrap();
        let mapped = reg.lookup("main", "app::User").unwrap();
        assert_eq!(*mapped.definition, *user());
        assert_eq!(reg.base_of("app::User"), Some("main"));
        assert_eq!(
            reg.introspection(),
            [Introspectable {
                category: "models",
                title: "User".into(),
                base: "main".into(),
                model: "app::User".into(),
            }]
        );
    }

    #[test]
    fn attaching_twice_is_idempotent() {
        let base = DeclarativeBase::new("main");
        let mut once = ModelRegistry::default();
        once.resolve(vec![intent(1, user(), &base)]).unwrap();
        let mut twice = ModelRegistry::default();
        twice
            .resolve(vec![intent(1, user(), &base), intent(2, user(), &base)])
            .unwrap();
        assert_eq!(once.models("main").len(), twice.models("main").len());
        assert_eq!(once.introspection(), twice.introspection());
    }

    #[test]
    fn strict_reattachment_is_reported() {
        let base = DeclarativeBase::new("main");
        let mut reg = ModelRegistry::default();
        reg.attach(&intent(1, user(), &base)).unwrap();
        let strict = AttachmentIntent::new(2, user(), base, AttachOptions::default().strict());
        assert!(matches!(
            reg.attach(&strict),
            Err(ConfigError::DuplicateAttachment { .. })
        ));
    }

    #[test]
    fn different_base_conflicts_and_keeps_original() {
        let b1 = DeclarativeBase::new("b1");
        let b2 = DeclarativeBase::new("b2");
        let mut reg = ModelRegistry::default();
        reg.attach(&intent(1, user(), &b1)).unwrap();
        let err = reg.attach(&intent(2, user(), &b2)).unwrap_err();
        match err {
            ConfigError::Conflict { existing, requested, .. } => {
                assert_eq!(existing, "b1");
                assert_eq!(requested, "b2");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(reg.lookup("b1", "app::User").is_some());
        assert!(reg.lookup("b2", "app::User").is_none());
    }

    #[test]
    fn first_registration_wins_regardless_of_input_order() {
        let b1 = DeclarativeBase::new("b1");
        let b2 = DeclarativeBase::new("b2");
        let mut reg = ModelRegistry::default();
        let err = reg
            .resolve(vec![intent(7, user(), &b2), intent(3, user(), &b1)])
            .unwrap_err();
        assert!(matches!(err, ConfigError::Conflict { ref existing, .. } if existing == "b1"));
        assert_eq!(reg.base_of("app::User"), Some("b1"));
    }

    #[test]
    fn changed_definition_for_same_base_is_rejected() {
        let base = DeclarativeBase::new("main");
        let mut reg = ModelRegistry::default();
        reg.attach(&intent(1, user(), &base)).unwrap();
        let changed = Arc::new((*user()).clone().column(ColumnDef::new("age", "INT")));
        assert!(matches!(
            reg.attach(&intent(2, changed, &base)),
            Err(ConfigError::DefinitionMismatch { .. })
        ));
    }

    #[test]
    fn duplicate_table_in_one_base_is_rejected() {
        let base = DeclarativeBase::new("main");
        let other = Arc::new(ModelDefinition::new("legacy::Account", "users"));
        let mut reg = ModelRegistry::default();
        reg.attach(&intent(1, user(), &base)).unwrap();
        assert!(matches!(
            reg.attach(&intent(2, other, &base)),
            Err(ConfigError::DuplicateTable { .. })
        ));
    }

    #[test]
    fn dangling_references_fail_resolution() {
        let base = DeclarativeBase::new("main");
        let mut reg = ModelRegistry::default();
        let err = reg.resolve(vec![intent(1, order(), &base)]).unwrap_err();
        assert!(matches!(err, ConfigError::MissingReference { kind: "table", .. }));
    }

    #[test]
    fn referenced_tables_are_created_first() {
        let base = DeclarativeBase::new("main");
        let mut reg = ModelRegistry::default();
        reg.resolve(vec![intent(1, order(), &base), intent(2, user(), &base)])
            .unwrap();
        let stmts = reg.create_statements("main");
        let users = stmts
            .iter()
            .position(|s| s.starts_with("CREATE TABLE IF NOT EXISTS \"users\""))
            .unwrap();
        let orders = stmts
            .iter()
            .position(|s| s.starts_with("CREATE TABLE IF NOT EXISTS \"orders\""))
            .unwrap();
        assert!(users < orders);
    }
}
