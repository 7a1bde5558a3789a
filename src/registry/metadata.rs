//! Declarative bases, their metadata, and tables built from attached models.

use crate::error::ConfigError;
use crate::model::{ModelDefinition, IDENTITY_COLUMN};
use crate::naming::{ConstraintKind, ConstraintTarget, NamingConvention};
use std::collections::HashSet;

pub(crate) fn quote(s: &str) -> String {
    format!("\"{}\"", s.replace('"', "\"\""))
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MetaData {
    naming: NamingConvention,
    schema: Option<String>,
}

impl Default for MetaData {
    fn default() -> Self {
        MetaData {
            naming: NamingConvention::default(),
            schema: None,
        }
    }
}

impl MetaData {
    pub fn new(naming: NamingConvention) -> Self {
        MetaData { naming, schema: None }
    }

    pub fn with_schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = Some(schema.into());
        self
    }

    pub fn naming(&self) -> &NamingConvention {
        &self.naming
    }

    pub fn schema(&self) -> Option<&str> {
        self.schema.as_deref()
    }
}

/// Shared registry target. Bases are identified by name; distinct bases
/// partition the schema namespace.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeclarativeBase {
    name: String,
    metadata: MetaData,
}

impl DeclarativeBase {
    pub fn new(name: impl Into<String>) -> Self {
        DeclarativeBase {
            name: name.into(),
            metadata: MetaData::default(),
        }
    }

    pub fn with_metadata(name: impl Into<String>, metadata: MetaData) -> Self {
        DeclarativeBase {
            name: name.into(),
            metadata,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn metadata(&self) -> &MetaData {
        &self.metadata
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TableColumn {
    pub name: String,
    pub sql_type: String,
    pub nullable: bool,
    pub default: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NamedConstraint {
    pub name: String,
    pub column: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ForeignKey {
    pub name: String,
    pub column: String,
    pub referred_table: String,
    pub referred_column: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Check {
    pub name: String,
    pub expression: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Table {
    pub name: String,
    pub schema: Option<String>,
    pub columns: Vec<TableColumn>,
    pub primary_key: String,
    pub uniques: Vec<NamedConstraint>,
    pub indexes: Vec<NamedConstraint>,
    pub foreign_keys: Vec<ForeignKey>,
    pub checks: Vec<Check>,
}

impl Table {
    /// Wire a model's identity and declared columns into `metadata`.
    pub fn build(
        definition: &ModelDefinition,
        table_name: &str,
        metadata: &MetaData,
    ) -> Result<Table, ConfigError> {
        let invalid = |reason: String| ConfigError::InvalidModel {
            model: definition.name().to_string(),
            reason,
        };
        if table_name.trim().is_empty() {
            return Err(invalid("table name is empty".into()));
        }
        let naming = metadata.naming();
        let name_for = |kind, column: Option<&str>, constraint: Option<&str>, referred: Option<&str>| {
            naming
                .render(
                    kind,
                    &ConstraintTarget {
                        table: table_name,
                        column,
                        constraint,
                        referred_table: referred,
                    },
                )
                .unwrap_or_else(|| default_name(kind, table_name, column.or(constraint)))
        };

        let mut seen = HashSet::new();
        let mut columns = vec![TableColumn {
            name: IDENTITY_COLUMN.into(),
            sql_type: "UUID".into(),
            nullable: false,
            default: Some("gen_random_uuid()".into()),
        }];
        let mut uniques = Vec::new();
        let mut indexes = Vec::new();
        let mut foreign_keys = Vec::new();
        for c in definition.columns() {
            if c.name == IDENTITY_COLUMN {
                return Err(invalid(format!("'{}' is the reserved identity column", IDENTITY_COLUMN)));
            }
            if !seen.insert(c.name.as_str()) {
                return Err(invalid(format!("duplicate column '{}'", c.name)));
            }
            columns.push(TableColumn {
                name: c.name.clone(),
                sql_type: c.sql_type.clone(),
                nullable: c.nullable,
                default: c.default.clone(),
            });
            if c.unique {
                uniques.push(NamedConstraint {
                    name: name_for(ConstraintKind::Unique, Some(&c.name), None, None),
                    column: c.name.clone(),
                });
            }
            if c.index {
                indexes.push(NamedConstraint {
                    name: name_for(ConstraintKind::Index, Some(&c.name), None, None),
                    column: c.name.clone(),
                });
            }
            if let Some(fk) = &c.references {
                foreign_keys.push(ForeignKey {
                    name: name_for(ConstraintKind::ForeignKey, Some(&c.name), None, Some(&fk.table)),
                    column: c.name.clone(),
                    referred_table: fk.table.clone(),
                    referred_column: fk.column.clone(),
                });
            }
        }
        let checks = definition
            .checks()
            .iter()
            .map(|ck| Check {
                name: name_for(ConstraintKind::Check, None, Some(&ck.name), None),
                expression: ck.expression.clone(),
            })
            .collect();

        Ok(Table {
            name: table_name.to_string(),
            schema: metadata.schema().map(String::from),
            columns,
            primary_key: name_for(ConstraintKind::PrimaryKey, None, None, None),
            uniques,
            indexes,
            foreign_keys,
            checks,
        })
    }

    pub fn qualified_name(&self) -> String {
        qualify(self.schema.as_deref(), &self.name)
    }

    /// `CREATE TABLE IF NOT EXISTS` followed by one `CREATE INDEX IF NOT EXISTS` per index.
    pub fn create_statements(&self) -> Vec<String> {
        let mut defs: Vec<String> = self
            .columns
            .iter()
            .map(|c| {
                let mut def = format!("{} {}", quote(&c.name), c.sql_type);
                if !c.nullable {
                    def.push_str(" NOT NULL");
                }
                if let Some(d) = &c.default {
                    def.push_str(" DEFAULT ");
                    def.push_str(d);
                }
                def
            })
            .collect();
        defs.push(format!(
            "CONSTRAINT {} PRIMARY KEY ({})",
            quote(&self.primary_key),
            quote(IDENTITY_COLUMN)
        ));
        for u in &self.uniques {
            defs.push(format!("CONSTRAINT {} UNIQUE ({})", quote(&u.name), quote(&u.column)));
        }
        for ck in &self.checks {
            defs.push(format!("CONSTRAINT {} CHECK ({})", quote(&ck.name), ck.expression));
        }
        for fk in &self.foreign_keys {
            defs.push(format!(
                "CONSTRAINT {} FOREIGN KEY ({}) REFERENCES {} ({})",
                quote(&fk.name),
                quote(&fk.column),
                qualify(self.schema.as_deref(), &fk.referred_table),
                quote(&fk.referred_column)
            ));
        }

        let full_name = self.qualified_name();
        let mut statements = vec![format!(
            "CREATE TABLE IF NOT EXISTS {} (\n  {}\n)",
            full_name,
            defs.join(",\n  ")
        )];
        for idx in &self.indexes {
            statements.push(format!(
                "CREATE INDEX IF NOT EXISTS {} ON {} ({})",
                quote(&idx.name),
                full_name,
                quote(&idx.column)
            ));
        }
        statements
    }
}

fn qualify(schema: Option<&str>, table: &str) -> String {
    match schema {
        Some(s) => format!("{}.{}", quote(s), quote(table)),
        None => quote(table),
    }
}

fn default_name(kind: ConstraintKind, table: &str, column: Option<&str>) -> String {
    match column {
        Some(c) => format!("{}_{}_{}", table, c, kind.key()),
        None => format!("{}_{}", table, kind.key()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ColumnDef;

    fn orders() -> ModelDefinition {
        ModelDefinition::new("shop::Order", "orders")
            .column(ColumnDef::new("user_id", "UUID").not_null().references("users", "id"))
            .column(ColumnDef::new("code", "TEXT").unique())
            .column(ColumnDef::new("placed_at", "TIMESTAMPTZ").index().server_default("NOW()"))
            .check("total_positive", "total > 0")
    }

    #[test]
    fn build_names_constraints_by_convention() {
        let table = Table::build(&orders(), "orders", &MetaData::default()).unwrap();
        assert_eq!(table.columns[0].name, "id");
        assert_eq!(table.primary_key, "pk_orders");
        assert_eq!(table.uniques[0].name, "uq_orders_code");
        assert_eq!(table.indexes[0].name, "ix_orders_placed_at");
        assert_eq!(table.foreign_keys[0].name, "fk_orders_user_id_users");
        assert_eq!(table.checks[0].name, "ck_orders_total_positive");
    }

    #[test]
    fn create_statements_include_identity_and_constraints() {
        let meta = MetaData::default().with_schema("shop");
        let table = Table::build(&orders(), "orders", &meta).unwrap();
        let stmts = table.create_statements();
        assert_eq!(stmts.len(), 2);
        assert!(stmts[0].starts_with("CREATE TABLE IF NOT EXISTS \"shop\".\"orders\""));
        assert!(stmts[0].contains("\"id\" UUID NOT NULL DEFAULT gen_random_uuid()"));
        assert!(stmts[0].contains("CONSTRAINT \"pk_orders\" PRIMARY KEY (\"id\")"));
        assert!(stmts[0].contains("REFERENCES \"shop\".\"users\" (\"id\")"));
        assert_eq!(
            stmts[1],
            "CREATE INDEX IF NOT EXISTS \"ix_orders_placed_at\" ON \"shop\".\"orders\" (\"placed_at\")"
        );
    }

    #[test]
    fn reserved_and_duplicate_columns_are_rejected() {
        let def = ModelDefinition::new("bad::A", "a").column(ColumnDef::new("id", "INT"));
        assert!(matches!(
            Table::build(&def, "a", &MetaData::default()),
            Err(ConfigError::InvalidModel { .. })
        ));
        let def = ModelDefinition::new("bad::B", "b")
            .column(ColumnDef::new("x", "INT"))
            .column(ColumnDef::new("x", "TEXT"));
        assert!(matches!(
            Table::build(&def, "b", &MetaData::default()),
            Err(ConfigError::InvalidModel { .. })
        ));
    }
}
