//! Routing services: provider registry, model resolution, key selection and
//! usage accounting.

pub mod registry;
pub mod resolver;
pub mod selector;
pub mod usage;

pub use registry::ProviderRegistry;
pub use resolver::{ModelResolver, ResolveError, ResolvedModel};
pub use selector::{SelectError, Selection, Selector};
pub use usage::{RequestOutcome, UsageRecorder};
