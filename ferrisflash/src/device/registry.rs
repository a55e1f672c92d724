//! Global device registry for resolving model identifiers to drivers.

use indexmap::IndexMap;
use once_cell::sync::Lazy;

use super::{Model, ModelDriver};
use crate::error::{RegistryError, Result};

/// Builds a fresh driver instance.
pub type DriverFactory = fn() -> ModelDriver;

/// Global device registry, populated once at first use and read-only after.
static REGISTRY: Lazy<DeviceRegistry> = Lazy::new(|| {
    let mut registry = DeviceRegistry::new();
    registry.register_builtin_models();
    registry
});

/// Maps model identifiers to driver factories.
///
/// Identifiers are matched case-insensitively with punctuation ignored, so
/// `ADTRAN 834v6`, `adtran-834v6` and `834v6` all resolve to the same driver.
#[derive(Debug, Default)]
pub struct DeviceRegistry {
    entries: IndexMap<String, (Model, DriverFactory)>,
}

impl DeviceRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self {
            entries: IndexMap::new(),
        }
    }

    /// Get the global registry.
    pub fn global() -> &'static DeviceRegistry {
        &REGISTRY
    }

    fn register_builtin_models(&mut self) {
        self.register(Model::Adtran834v5, &["834v5"], || {
            ModelDriver::for_model(Model::Adtran834v5)
        });
        self.register(Model::Adtran834v6, &["834v6"], || {
            ModelDriver::for_model(Model::Adtran834v6)
        });
        self.register(Model::ComtrendVr3071, &["vr3071"], || {
            ModelDriver::for_model(Model::ComtrendVr3071)
        });
        self.register(Model::ComtrendVr3071v2, &["vr3071v2"], || {
            ModelDriver::for_model(Model::ComtrendVr3071v2)
        });
    }

    /// Register `factory` under the model's identifier, its display name and
    /// any extra aliases.
    pub fn register(&mut self, model: Model, aliases: &[&str], factory: DriverFactory) {
        let names = [model.id(), model.display_name()]
            .into_iter()
            .chain(aliases.iter().copied());
        for name in names {
            self.entries.insert(normalize(name), (model, factory));
        }
    }

    /// Look up the driver factory for `identifier`.
    pub fn resolve(&self, identifier: &str) -> Result<DriverFactory> {
        self.lookup(identifier).map(|(_, factory)| factory)
    }

    /// Look up the model named by `identifier`.
    pub fn model(&self, identifier: &str) -> Result<Model> {
        self.lookup(identifier).map(|(model, _)| model)
    }

    fn lookup(&self, identifier: &str) -> Result<(Model, DriverFactory)> {
        self.entries
            .get(&normalize(identifier))
            .copied()
            .ok_or_else(|| {
                RegistryError::UnknownModel {
                    name: identifier.to_string(),
                }
                .into()
            })
    }

    /// Check if an identifier resolves.
    pub fn contains(&self, identifier: &str) -> bool {
        self.entries.contains_key(&normalize(identifier))
    }

    /// Registered models, in registration order.
    pub fn models(&self) -> Vec<Model> {
        let mut models: Vec<Model> = Vec::new();
        for (model, _) in self.entries.values() {
            if !models.contains(model) {
                models.push(*model);
            }
        }
        models
    }
}

fn normalize(identifier: &str) -> String {
    identifier
        .chars()
        .filter(char::is_ascii_alphanumeric)
        .map(|c| c.to_ascii_lowercase())
        .collect()
}
