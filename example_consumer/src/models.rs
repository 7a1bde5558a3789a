//! Models of the example application.

use deferred_sqlx::model::{ColumnDef, Model, ModelBase, ModelDefinition, ModelRepr, RelationshipDef, RelationshipKind};
use std::fmt;
use std::sync::OnceLock;

pub struct User {
    base: ModelBase,
}

impl Model for User {
    fn definition() -> &'static ModelDefinition {
        static DEF: OnceLock<ModelDefinition> = OnceLock::new();
        DEF.get_or_init(|| {
            ModelDefinition::new("example::User", "users")
                .column(ColumnDef::new("email", "TEXT").not_null().unique())
                .column(ColumnDef::new("name", "TEXT"))
                .column(ColumnDef::new("created_at", "TIMESTAMPTZ").not_null().server_default("now()"))
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

impl fmt::Debug for User {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", ModelRepr(&self.base))
    }
}

pub struct Note {
    base: ModelBase,
}

impl Model for Note {
    fn definition() -> &'static ModelDefinition {
        static DEF: OnceLock<ModelDefinition> = OnceLock::new();
        DEF.get_or_init(|| {
            ModelDefinition::new("example::Note", "notes")
                .column(ColumnDef::new("user_id", "UUID").not_null().index().references("users", "id"))
                .column(ColumnDef::new("body", "TEXT").not_null())
                .check("body_not_empty", "length(body) > 0")
                .relationship(RelationshipDef {
                    name: "author".into(),
                    target: "example::User".into(),
                    kind: RelationshipKind::ToOne,
                    foreign_key: "user_id".into(),
                })
        })
    }

    fn from_base(base: ModelBase) -> Self {
        Note { base }
    }

    fn base(&self) -> &ModelBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut ModelBase {
        &mut self.base
    }
}
