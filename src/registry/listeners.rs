//! Model event listeners registered through the configurator.

use crate::config::Settings;
use crate::error::AppError;
use crate::model::ModelBase;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ModelEvent {
    BeforeInsert,
    AfterInsert,
    AfterLoad,
}

/// Listener callback. Receives the application settings first.
pub type Listener = Arc<dyn Fn(&Settings, &mut ModelBase) -> Result<(), AppError> + Send + Sync>;

#[derive(Clone, Default)]
pub struct Listeners {
    by_target: HashMap<(String, ModelEvent), Vec<Listener>>,
}

impl fmt::Debug for Listeners {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(self.by_target.iter().map(|(k, v)| (k, v.len())))
            .finish()
    }
}

impl Listeners {
    pub(crate) fn add(&mut self, model: &str, event: ModelEvent, listener: Listener) {
        self.by_target
            .entry((model.to_string(), event))
            .or_default()
            .push(listener);
    }

    pub fn count(&self, model: &str, event: ModelEvent) -> usize {
        self.by_target
            .get(&(model.to_string(), event))
            .map(Vec::len)
            .unwrap_or(0)
    }

    /// Run listeners in registration order, stopping at the first error.
    pub fn dispatch(&self, settings: &Settings, event: ModelEvent, base: &mut ModelBase) -> Result<(), AppError> {
        let key = (base.definition().name().to_string(), event);
        if let Some(listeners) = self.by_target.get(&key) {
            for listener in listeners {
                listener(settings, base)?;
            }
        }
        Ok(())
    }
}
