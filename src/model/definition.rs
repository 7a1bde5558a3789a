//! Model definitions authored by application code. A definition is plain data
//! and belongs to no base until a configurator attaches it.

use std::sync::OnceLock;

/// Name of the identity column every model carries.
pub const IDENTITY_COLUMN: &str = "id";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ForeignKeyRef {
    pub table: String,
    pub column: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ColumnDef {
    pub name: String,
    /// PostgreSQL type, e.g. `TEXT` or `TIMESTAMPTZ`.
    pub sql_type: String,
    pub nullable: bool,
    pub unique: bool,
    pub index: bool,
    /// Server-side default expression.
    pub default: Option<String>,
    pub references: Option<ForeignKeyRef>,
}

impl ColumnDef {
    pub fn new(name: impl Into<String>, sql_type: impl Into<String>) -> Self {
        ColumnDef {
            name: name.into(),
            sql_type: sql_type.into(),
            nullable: true,
            unique: false,
            index: false,
            default: None,
            references: None,
        }
    }

    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    pub fn index(mut self) -> Self {
        self.index = true;
        self
    }

    pub fn server_default(mut self, expression: impl Into<String>) -> Self {
        self.default = Some(expression.into());
        self
    }

    pub fn references(mut self, table: impl Into<String>, column: impl Into<String>) -> Self {
        self.references = Some(ForeignKeyRef {
            table: table.into(),
            column: column.into(),
        });
        self
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CheckDef {
    pub name: String,
    pub expression: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RelationshipKind {
    /// This model holds the foreign key.
    ToOne,
    /// The target model holds a foreign key back to this one.
    ToMany,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RelationshipDef {
    pub name: String,
    /// Qualified name of the related model.
    pub target: String,
    pub kind: RelationshipKind,
    /// Foreign key column (on this model for ToOne, on the target for ToMany).
    pub foreign_key: String,
}

#[derive(Clone, Debug)]
pub struct ModelDefinition {
    name: String,
    table: String,
    columns: Vec<ColumnDef>,
    checks: Vec<CheckDef>,
    relationships: Vec<RelationshipDef>,
    column_names: OnceLock<Vec<String>>,
}

impl PartialEq for ModelDefinition {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
            && self.table == other.table
            && self.columns == other.columns
            && self.checks == other.checks
            && self.relationships == other.relationships
    }
}

impl Eq for ModelDefinition {}

impl ModelDefinition {
    /// `name` is the fully qualified model name (e.g. `app::models::User`).
    pub fn new(name: impl Into<String>, table: impl Into<String>) -> Self {
        ModelDefinition {
            name: name.into(),
            table: table.into(),
            columns: Vec::new(),
            checks: Vec::new(),
            relationships: Vec::new(),
            column_names: OnceLock::new(),
        }
    }

    pub fn column(mut self, column: ColumnDef) -> Self {
        self.columns.push(column);
        self.column_names = OnceLock::new();
        self
    }

    pub fn check(mut self, name: impl Into<String>, expression: impl Into<String>) -> Self {
        self.checks.push(CheckDef {
            name: name.into(),
            expression: expression.into(),
        });
        self
    }

    pub fn relationship(mut self, relationship: RelationshipDef) -> Self {
        self.relationships.push(relationship);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Last path segment of the qualified name.
    pub fn class_name(&self) -> &str {
        self.name.rsplit("::").next().unwrap_or(&self.name)
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    /// Declared columns, without the identity column.
    pub fn columns(&self) -> &[ColumnDef] {
        &self.columns
    }

    pub fn checks(&self) -> &[CheckDef] {
        &self.checks
    }

    pub fn relationships(&self) -> &[RelationshipDef] {
        &self.relationships
    }

    pub fn has_column(&self, name: &str) -> bool {
        name == IDENTITY_COLUMN || self.columns.iter().any(|c| c.name == name)
    }

    /// Identity column followed by declared columns. Computed once.
    pub fn column_names(&self) -> &[String] {
        self.column_names.get_or_init(|| {
            std::iter::once(IDENTITY_COLUMN.to_string())
                .chain(self.columns.iter().map(|c| c.name.clone()))
                .collect()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn column_names_lead_with_identity() {
        let def = ModelDefinition::new("app::models::User", "users")
            .column(ColumnDef::new("name", "TEXT").not_null())
            .column(ColumnDef::new("email", "TEXT").unique());
        assert_eq!(def.class_name(), "User");
        assert_eq!(def.column_names(), ["id", "name", "email"]);
        assert!(def.has_column("id"));
        assert!(!def.has_column("password"));
    }

    #[test]
    fn equality_ignores_name_cache() {
        let a = ModelDefinition::new("User", "users").column(ColumnDef::new("name", "TEXT"));
        let b = a.clone();
        let _ = a.column_names();
        assert_eq!(a, b);
        let c = b.column(ColumnDef::new("age", "INT"));
        assert_ne!(a, c);
    }
}
