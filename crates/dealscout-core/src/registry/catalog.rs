//! Model registry with swap-the-whole-table reloads

use std::collections::HashSet;
use std::sync::{Arc, PoisonError, RwLock};

use tracing::info;

use super::types::{ModelDescriptor, TaskType};
use crate::error::{Error, Result};

/// An immutable, validated set of model descriptors
///
/// Descriptors are kept in priority order (priority, then cost weight, then id).
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    models: Vec<ModelDescriptor>,
}

impl Catalog {
    /// Validate and order a set of descriptors
    pub fn new(descriptors: Vec<ModelDescriptor>) -> Result<Self> {
        let mut seen = HashSet::new();
        let mut models = Vec::with_capacity(descriptors.len());

        for mut model in descriptors {
            if model.id.trim().is_empty() {
                return Err(Error::InvalidCatalog("model id must not be empty".to_string()));
            }
            if !seen.insert(model.id.clone()) {
                return Err(Error::InvalidCatalog(format!("duplicate model id '{}'", model.id)));
            }
            if !model.cost_weight.is_finite() || model.cost_weight < 0.0 {
                return Err(Error::InvalidCatalog(format!(
                    "model '{}' has invalid cost weight {}",
                    model.id, model.cost_weight
                )));
            }
            model.capabilities = model
                .capabilities
                .iter()
                .map(|c| c.trim().to_lowercase())
                .filter(|c| !c.is_empty())
                .collect();
            if model.capabilities.is_empty() {
                return Err(Error::InvalidCatalog(format!(
                    "model '{}' advertises no capabilities",
                    model.id
                )));
            }
            models.push(model);
        }

        models.sort_by(|a, b| {
            a.priority
                .cmp(&b.priority)
                .then(a.cost_weight.total_cmp(&b.cost_weight))
                .then_with(|| a.id.cmp(&b.id))
        });

        Ok(Self { models })
    }

    /// Descriptors advertising the capability, in priority order
    pub fn list(&self, capability: &TaskType) -> Vec<ModelDescriptor> {
        self.models
            .iter()
            .filter(|m| m.supports(capability))
            .cloned()
            .collect()
    }

    /// Look up a descriptor by id
    pub fn get(&self, id: &str) -> Option<&ModelDescriptor> {
        self.models.iter().find(|m| m.id == id)
    }

    /// All descriptors in priority order
    pub fn all(&self) -> &[ModelDescriptor] {
        &self.models
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }
}

/// Catalog of available model backends
///
/// Readers take a cheap pointer to the current catalog; reloads build a new
/// catalog and swap the pointer, so no reader ever sees a partial update.
#[derive(Debug, Default)]
pub struct ModelRegistry {
    catalog: RwLock<Arc<Catalog>>,
}

impl ModelRegistry {
    /// Create a registry from configured descriptors
    pub fn new(descriptors: Vec<ModelDescriptor>) -> Result<Self> {
        let catalog = Catalog::new(descriptors)?;
        Ok(Self {
            catalog: RwLock::new(Arc::new(catalog)),
        })
    }

    /// The current catalog
    pub fn snapshot(&self) -> Arc<Catalog> {
        self.catalog
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Descriptors advertising a capability, ordered by priority, cost, id
    pub fn list(&self, capability: &TaskType) -> Vec<ModelDescriptor> {
        self.snapshot().list(capability)
    }

    /// Resolve a descriptor by id
    pub fn resolve(&self, id: &str) -> Result<ModelDescriptor> {
        self.snapshot()
            .get(id)
            .cloned()
            .ok_or_else(|| Error::ModelNotFound(id.to_string()))
    }

    /// Replace the whole catalog
    pub fn reload(&self, descriptors: Vec<ModelDescriptor>) -> Result<()> {
        let catalog = Catalog::new(descriptors)?;
        let count = catalog.len();
        self.swap(catalog);
        info!(models = count, "Model catalog reloaded");
        Ok(())
    }

    /// Mark a model available or unavailable
    ///
    /// Builds a new catalog with the replaced descriptor and swaps it in.
    pub fn set_available(&self, id: &str, available: bool) -> Result<()> {
        let mut guard = self.catalog.write().unwrap_or_else(PoisonError::into_inner);
        let mut models = guard.all().to_vec();
        let model = models
            .iter_mut()
            .find(|m| m.id == id)
            .ok_or_else(|| Error::ModelNotFound(id.to_string()))?;
        model.available = available;
        *guard = Arc::new(Catalog::new(models)?);
        info!(model = %id, available, "Model availability changed");
        Ok(())
    }

    fn swap(&self, catalog: Catalog) {
        let mut guard = self.catalog.write().unwrap_or_else(PoisonError::into_inner);
        *guard = Arc::new(catalog);
    }
}
