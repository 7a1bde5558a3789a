//! Model base contract: identity, field-based construction, safe representation.

use crate::error::AppError;
use crate::model::definition::{ModelDefinition, IDENTITY_COLUMN};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use uuid::Uuid;

/// Marker rendered in place of column values once an instance lost its session.
pub const DETACHED_MARKER: &str = "<detached>";
/// Shown in place of a column value that expired at commit.
pub const EXPIRED_MARKER: &str = "<expired>";

/// Shared between a session and the instances it loaded.
#[derive(Debug, Default)]
pub struct SessionLiveness {
    closed: AtomicBool,
    epoch: AtomicU64,
}

impl SessionLiveness {
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Returns true only for the call that actually closed.
    pub(crate) fn close(&self) -> bool {
        !self.closed.swap(true, Ordering::AcqRel)
    }

    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }

    /// Expire everything loaded so far (after commit or rollback).
    pub(crate) fn expire_all(&self) {
        self.epoch.fetch_add(1, Ordering::AcqRel);
    }
}

/// Link from a persisted instance to the session that loaded it.
#[derive(Clone, Debug)]
pub struct Binding {
    liveness: Arc<SessionLiveness>,
    epoch: u64,
}

impl Binding {
    pub fn new(liveness: Arc<SessionLiveness>) -> Self {
        let epoch = liveness.epoch();
        Binding { liveness, epoch }
    }

    fn is_stale(&self) -> bool {
        self.liveness.epoch() != self.epoch
    }
}

/// State embedded in every entity.
#[derive(Clone, Debug)]
pub struct ModelBase {
    definition: &'static ModelDefinition,
    id: Option<Uuid>,
    values: BTreeMap<String, Value>,
    binding: Option<Binding>,
}

impl ModelBase {
    /// Transient instance with no values.
    pub fn new(definition: &'static ModelDefinition) -> Self {
        ModelBase {
            definition,
            id: None,
            values: BTreeMap::new(),
            binding: None,
        }
    }

    /// Keyword-style construction; rejects fields the definition does not declare.
    pub fn with_fields<K, I>(definition: &'static ModelDefinition, fields: I) -> Result<Self, AppError>
    where
        K: AsRef<str>,
        I: IntoIterator<Item = (K, Value)>,
    {
        let mut base = ModelBase::new(definition);
        for (name, value) in fields {
            base.set(name.as_ref(), value)?;
        }
        Ok(base)
    }

    /// Instance materialized from a row returned by the database.
    pub(crate) fn loaded(
        definition: &'static ModelDefinition,
        row: Map<String, Value>,
        binding: Binding,
    ) -> Result<Self, AppError> {
        let mut base = ModelBase::new(definition);
        base.load(row, binding)?;
        Ok(base)
    }

    /// Replace all values with a freshly loaded row and rebind.
    pub(crate) fn load(&mut self, row: Map<String, Value>, binding: Binding) -> Result<(), AppError> {
        let mut values = BTreeMap::new();
        let mut id = None;
        for (name, value) in row {
            if name == IDENTITY_COLUMN {
                id = Some(self.parse_id(&value)?);
            } else if self.definition.has_column(&name) {
                values.insert(name, value);
            }
        }
        self.id = id;
        self.values = values;
        self.binding = Some(binding);
        Ok(())
    }

    pub fn definition(&self) -> &'static ModelDefinition {
        self.definition
    }

    pub fn id(&self) -> Option<Uuid> {
        self.id
    }

    pub fn is_persisted(&self) -> bool {
        self.binding.is_some()
    }

    pub fn binding(&self) -> Option<&Binding> {
        self.binding.as_ref()
    }

    /// Read a column. Values of persisted instances expire when their session
    /// commits; an expired or unloaded column cannot be read once the session
    /// is closed.
    pub fn get(&self, column: &str) -> Result<Value, AppError> {
        if !self.definition.has_column(column) {
            return Err(self.unknown(column));
        }
        if let Some(binding) = &self.binding {
            let unloaded = column != IDENTITY_COLUMN && !self.values.contains_key(column);
            if binding.liveness.is_closed() && (binding.is_stale() || unloaded) {
                return Err(AppError::Detached {
                    model: self.definition.class_name().to_string(),
                    column: column.to_string(),
                });
            }
            if binding.is_stale() {
                return Err(AppError::Expired {
                    model: self.definition.class_name().to_string(),
                    column: column.to_string(),
                });
            }
        }
        if column == IDENTITY_COLUMN {
            return Ok(self
                .id
                .map(|id| Value::String(id.to_string()))
                .unwrap_or(Value::Null));
        }
        Ok(self.values.get(column).cloned().unwrap_or(Value::Null))
    }

    pub fn set(&mut self, column: &str, value: Value) -> Result<(), AppError> {
        if !self.definition.has_column(column) {
            return Err(self.unknown(column));
        }
        if column == IDENTITY_COLUMN {
            if self.is_persisted() {
                return Err(AppError::ImmutableIdentity(
                    self.definition.class_name().to_string(),
                ));
            }
            self.id = match value {
                Value::Null => None,
                v => Some(self.parse_id(&v)?),
            };
            return Ok(());
        }
        self.values.insert(column.to_string(), value);
        Ok(())
    }

    /// Columns explicitly set on this instance, identity included when present.
    pub fn assigned(&self) -> Map<String, Value> {
        let mut out: Map<String, Value> = self
            .values
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        if let Some(id) = self.id {
            out.insert(IDENTITY_COLUMN.into(), Value::String(id.to_string()));
        }
        out
    }

    /// Representation over current values; never fails.
    pub fn describe(&self) -> Repr {
        let mut parts = Vec::with_capacity(self.definition.column_names().len());
        for column in self.definition.column_names() {
            match self.get(column) {
                Ok(value) => parts.push(format!("{}={}", column, value)),
                Err(AppError::Expired { .. }) => parts.push(format!("{}={}", column, EXPIRED_MARKER)),
                Err(_) => return Repr::Detached,
            }
        }
        Repr::Rendered(parts.join(", "))
    }

    fn parse_id(&self, value: &Value) -> Result<Uuid, AppError> {
        value
            .as_str()
            .and_then(|s| Uuid::parse_str(s).ok())
            .ok_or_else(|| AppError::InvalidField {
                model: self.definition.class_name().to_string(),
                field: IDENTITY_COLUMN.to_string(),
                reason: "expected a uuid string".into(),
            })
    }

    fn unknown(&self, field: &str) -> AppError {
        AppError::UnknownField {
            model: self.definition.class_name().to_string(),
            field: field.to_string(),
        }
    }
}

/// Outcome of rendering an instance.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Repr {
    /// `name=value` pairs for every column.
    Rendered(String),
    Detached,
}

/// Capability every persisted entity implements by embedding a [`ModelBase`].
pub trait Model: Sized + Send + Sync + 'static {
    fn definition() -> &'static ModelDefinition;

    fn from_base(base: ModelBase) -> Self;

    fn base(&self) -> &ModelBase;

    fn base_mut(&mut self) -> &mut ModelBase;

    fn new_with<K, I>(fields: I) -> Result<Self, AppError>
    where
        K: AsRef<str>,
        I: IntoIterator<Item = (K, Value)>,
    {
        ModelBase::with_fields(Self::definition(), fields).map(Self::from_base)
    }

    fn id(&self) -> Option<Uuid> {
        self.base().id()
    }

    fn get(&self, column: &str) -> Result<Value, AppError> {
        self.base().get(column)
    }

    fn set(&mut self, column: &str, value: Value) -> Result<(), AppError> {
        self.base_mut().set(column, value)
    }

    /// `Name(col=value, ...)`, expired columns as `<expired>`, or `Name(<detached>)`
    /// once the session is gone.
    fn repr(&self) -> String {
        ModelRepr(self.base()).to_string()
    }
}

/// Display adapter so entities can implement `Debug`/`Display` through their base.
pub struct ModelRepr<'a>(pub &'a ModelBase);

impl fmt::Display for ModelRepr<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = self.0.definition().class_name();
        match self.0.describe() {
            Repr::Rendered(fields) => write!(f, "{}({})", name, fields),
            Repr::Detached => write!(f, "{}({})", name, DETACHED_MARKER),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::definition::ColumnDef;
    use serde_json::json;
    use std::sync::OnceLock;

    struct User {
        base: ModelBase,
    }

    impl Model for User {
        fn definition() -> &'static ModelDefinition {
            static DEF: OnceLock<ModelDefinition> = OnceLock::new();
            DEF.get_or_init(|| {
                ModelDefinition::new("tests::User", "users")
                    .column(ColumnDef::new("name", "TEXT"))
                    .column(ColumnDef::new("email", "TEXT"))
            })
        }

        fn from_base(base: ModelBase) -> Self {
            User { base }
        }

        fn base(&self) -> &ModelBase {
            &self.base
        }

        fn base_mut(&mut self) -> &mut ModelBase {
            &mut self.base
        }
    }

    const ID: &str = "6f1c1f0e-3f0a-4d5e-9a55-0c2d3b4a5f61";

    fn loaded_user(liveness: &Arc<SessionLiveness>) -> User {
        let row = json!({ "id": ID, "name": "alice", "email": "a@example.com" });
        let Value::Object(row) = row else { unreachable!() };
        User::from_base(ModelBase::loaded(User::definition(), row, Binding::new(liveness.clone())).unwrap())
    }

    #[test]
    fn construction_rejects_unknown_fields() {
        let err = User::new_with([("name", json!("alice")), ("password", json!("x"))])
            .err()
            .unwrap();
        assert!(matches!(err, AppError::UnknownField { field, .. } if field == "password"));
    }

    #[test]
    fn repr_reflects_current_values() {
        let mut user = User::new_with([("name", json!("alice"))]).unwrap();
        assert_eq!(user.repr(), r#"User(id=null, name="alice", email=null)"#);
        user.set("email", json!("a@example.com")).unwrap();
        assert_eq!(
            user.repr(),
            r#"User(id=null, name="alice", email="a@example.com")"#
        );
    }

    #[test]
    fn identity_is_immutable_once_persisted() {
        let liveness = Arc::new(SessionLiveness::default());
        let mut user = loaded_user(&liveness);
        assert_eq!(user.id().map(|u| u.to_string()).as_deref(), Some(ID));
        let err = user.set("id", json!(Uuid::new_v4().to_string())).unwrap_err();
        assert!(matches!(err, AppError::ImmutableIdentity(_)));
    }

    #[test]
    fn loaded_values_survive_close_until_expired() {
        let liveness = Arc::new(SessionLiveness::default());
        let user = loaded_user(&liveness);
        liveness.close();
        assert_eq!(user.get("name").unwrap(), json!("alice"));
    }

    #[test]
    fn expired_access_needs_the_session() {
        let liveness = Arc::new(SessionLiveness::default());
        let user = loaded_user(&liveness);
        liveness.expire_all();
        assert!(matches!(user.get("name"), Err(AppError::Expired { .. })));
        liveness.close();
        assert!(matches!(user.get("name"), Err(AppError::Detached { .. })));
    }

    #[test]
    fn repr_falls_back_to_detached_marker() {
        let liveness = Arc::new(SessionLiveness::default());
        let user = loaded_user(&liveness);
        liveness.expire_all();
        liveness.close();
        assert_eq!(user.base().describe(), Repr::Detached);
        assert_eq!(user.repr(), "User(<detached>)");
    }

    #[test]
    fn expired_columns_render_while_the_session_is_open() {
        let liveness = Arc::new(SessionLiveness::default());
        let user = loaded_user(&liveness);
        liveness.expire_all();
        assert!(!liveness.is_closed());
        assert_eq!(user.repr(), "User(id=<expired>, name=<expired>, email=<expired>)");
    }

    #[test]
    fn close_reports_only_the_first_call() {
        let liveness = SessionLiveness::default();
        assert!(liveness.close());
        assert!(!liveness.close());
        assert!(liveness.is_closed());
    }
}
