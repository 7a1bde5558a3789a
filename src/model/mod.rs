//! Entity definitions and the base contract every persisted entity satisfies.

mod base;
mod definition;

pub use base::{Binding, Model, ModelBase, ModelRepr, Repr, SessionLiveness, DETACHED_MARKER, EXPIRED_MARKER};
pub use definition::{
    CheckDef, ColumnDef, ForeignKeyRef, ModelDefinition, RelationshipDef, RelationshipKind,
    IDENTITY_COLUMN,
};
