//! Model persistence over a PostgreSQL session. Rows travel as `jsonb` so
//! one statement shape serves every model.

use super::RequestSession;
use crate::error::{AppError, ConfigError};
use crate::model::{Binding, Model, ModelBase, IDENTITY_COLUMN};
use crate::registry::{quote, MappedModel, ModelEvent, Table};
use serde_json::{Map, Value};
use sqlx::pool::PoolConnection;
use sqlx::Postgres;
use uuid::Uuid;

pub(crate) fn insert_sql(table: &Table, columns: &[&str]) -> String {
    let target = table.qualified_name();
    if columns.is_empty() {
        return format!("INSERT INTO {target} AS t DEFAULT VALUES RETURNING to_jsonb(t)");
    }
    let cols = columns.iter().map(|c| quote(c)).collect::<Vec<_>>().join(", ");
    format!(
        "INSERT INTO {target} AS t ({cols}) SELECT {cols} FROM jsonb_populate_record(NULL::{target}, $1) RETURNING to_jsonb(t)"
    )
}

pub(crate) fn select_by_id_sql(table: &Table) -> String {
    format!(
        "SELECT to_jsonb(t) FROM {} AS t WHERE t.{} = $1",
        table.qualified_name(),
        quote(IDENTITY_COLUMN)
    )
}

fn into_row(value: Value) -> Result<Map<String, Value>, AppError> {
    match value {
        Value::Object(map) => Ok(map),
        other => Err(AppError::Db(sqlx::Error::Protocol(format!(
            "expected a jsonb object row, got {other}"
        )))),
    }
}

impl RequestSession<PoolConnection<Postgres>> {
    fn mapping<M: Model>(&self) -> Result<&MappedModel, AppError> {
        let name = M::definition().name();
        self.registry()
            .mapped(name)
            .ok_or_else(|| ConfigError::NotAttached(name.to_string()).into())
    }

    async fn fetch_row(&self, sql: &str, param: Option<Value>) -> Result<Option<Map<String, Value>>, AppError> {
        tracing::debug!(session = %self.id(), sql = %sql, "query");
        let mut conn = self.connection().await?;
        let mut query = sqlx::query_scalar::<_, Value>(sql);
        if let Some(param) = param {
            query = query.bind(param);
        }
        let row = query.fetch_optional(&mut **conn).await?;
        row.map(into_row).transpose()
    }

    /// Insert a transient instance. The database generates the identity and
    /// defaults; the instance is reloaded from the returned row and bound to
    /// this session.
    pub async fn add<M: Model>(&self, instance: &mut M) -> Result<(), AppError> {
        let mapped = self.mapping::<M>()?;
        if instance.base().is_persisted() {
            return Err(AppError::BadRequest(format!(
                "{} is already persisted",
                M::definition().class_name()
            )));
        }
        self.registry().dispatch(ModelEvent::BeforeInsert, instance.base_mut())?;
        let values = instance.base().assigned();
        let columns: Vec<&str> = values.keys().map(String::as_str).collect();
        let sql = insert_sql(&mapped.table, &columns);
        let param = (!columns.is_empty()).then(|| Value::Object(values.clone()));
        let row = self
            .fetch_row(&sql, param)
            .await?
            .ok_or(AppError::Db(sqlx::Error::RowNotFound))?;
        instance.base_mut().load(row, Binding::new(self.liveness().clone()))?;
        self.registry().dispatch(ModelEvent::AfterInsert, instance.base_mut())?;
        Ok(())
    }

    /// Load an instance by identity.
    pub async fn get<M: Model>(&self, id: Uuid) -> Result<Option<M>, AppError> {
        let mapped = self.mapping::<M>()?;
        let sql = select_by_id_sql(&mapped.table);
        let Some(row) = self.fetch_row(&sql, Some(Value::String(id.to_string()))).await? else {
            return Ok(None);
        };
        let mut base = ModelBase::loaded(M::definition(), row, Binding::new(self.liveness().clone()))?;
        self.registry().dispatch(ModelEvent::AfterLoad, &mut base)?;
        Ok(Some(M::from_base(base)))
    }

    /// Reload every column of a persisted instance and rebind it here.
    pub async fn refresh<M: Model>(&self, instance: &mut M) -> Result<(), AppError> {
        let mapped = self.mapping::<M>()?;
        let class = M::definition().class_name();
        let id = instance
            .base()
            .id()
            .filter(|_| instance.base().is_persisted())
            .ok_or_else(|| AppError::BadRequest(format!("{class} is not persisted")))?;
        let sql = select_by_id_sql(&mapped.table);
        let row = self
            .fetch_row(&sql, Some(Value::String(id.to_string())))
            .await?
            .ok_or_else(|| AppError::NotFound(format!("{class} {id}")))?;
        instance.base_mut().load(row, Binding::new(self.liveness().clone()))?;
        self.registry().dispatch(ModelEvent::AfterLoad, instance.base_mut())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ColumnDef, ModelDefinition};
    use crate::registry::MetaData;

    fn table(metadata: &MetaData) -> Table {
        let def = ModelDefinition::new("app::User", "users").column(ColumnDef::new("email", "TEXT"));
        Table::build(&def, "users", metadata).unwrap()
    }

    #[test]
    fn insert_selects_assigned_columns_from_jsonb() {
        let sql = insert_sql(&table(&MetaData::default()), &["email"]);
        assert_eq!(
            sql,
            "INSERT INTO \"users\" AS t (\"email\") SELECT \"email\" FROM \
             jsonb_populate_record(NULL::\"users\", $1) RETURNING to_jsonb(t)"
        );
    }

    #[test]
    fn insert_without_values_uses_defaults() {
        let sql = insert_sql(&table(&MetaData::default()), &[]);
        assert_eq!(sql, "INSERT INTO \"users\" AS t DEFAULT VALUES RETURNING to_jsonb(t)");
    }

    #[test]
    fn select_uses_schema_qualified_table() {
        let sql = select_by_id_sql(&table(&MetaData::default().with_schema("app")));
        assert_eq!(sql, "SELECT to_jsonb(t) FROM \"app\".\"users\" AS t WHERE t.\"id\" = $1");
    }

    #[test]
    fn non_object_rows_are_protocol_errors() {
        assert!(matches!(
            into_row(Value::Null),
            Err(AppError::Db(sqlx::Error::Protocol(_)))
        ));
    }
}
