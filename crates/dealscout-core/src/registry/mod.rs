//! Model registry
//!
//! Catalog of model backends with their capability tags, priority, cost
//! weight and availability. The catalog is loaded from configuration at
//! startup and may be hot-reloaded; reloads swap the whole table.

mod catalog;
mod types;

pub use catalog::{Catalog, ModelRegistry};
pub use types::{ModelDescriptor, Provider, ProviderKind, TaskType};
