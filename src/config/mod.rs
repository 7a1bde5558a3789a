//! Settings and the two-phase configuration host.

mod configurator;
mod settings;

pub use configurator::{CommitContext, Configurator, Phase};
pub use settings::*;
