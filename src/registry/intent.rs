//! Pending "attach model X to base Y" records, collected before resolution.

use crate::model::ModelDefinition;
use crate::registry::metadata::DeclarativeBase;
use std::sync::Arc;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AttachOptions {
    /// Overrides the definition's table name.
    pub table: Option<String>,
    /// Re-attaching the same model to the same base is a no-op when set;
    /// otherwise it is reported as a duplicate attachment.
    pub idempotent: bool,
    /// Include the table in `create_all`.
    pub create: bool,
}

impl Default for AttachOptions {
    fn default() -> Self {
        AttachOptions {
            table: None,
            idempotent: true,
            create: true,
        }
    }
}

impl AttachOptions {
    pub fn table(mut self, table: impl Into<String>) -> Self {
        self.table = Some(table.into());
        self
    }

    pub fn strict(mut self) -> Self {
        self.idempotent = false;
        self
    }

    pub fn skip_create(mut self) -> Self {
        self.create = false;
        self
    }
}

#[derive(Clone, Debug)]
pub struct AttachmentIntent {
    /// Registration order; resolution applies intents in this order.
    pub(crate) seq: u64,
    pub(crate) definition: Arc<ModelDefinition>,
    pub(crate) base: DeclarativeBase,
    pub(crate) options: AttachOptions,
}

impl AttachmentIntent {
    pub fn new(
        seq: u64,
        definition: Arc<ModelDefinition>,
        base: DeclarativeBase,
        options: AttachOptions,
    ) -> Self {
        AttachmentIntent {
            seq,
            definition,
            base,
            options,
        }
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn definition(&self) -> &ModelDefinition {
        &self.definition
    }

    pub fn base(&self) -> &DeclarativeBase {
        &self.base
    }

    pub fn options(&self) -> &AttachOptions {
        &self.options
    }

    pub fn table_name(&self) -> &str {
        self.options
            .table
            .as_deref()
            .unwrap_or_else(|| self.definition.table())
    }
}
