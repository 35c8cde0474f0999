// Registry module - maps collector names to constructors
//
// The registry is built once in main, filled with the built-in collector
// types, and asked to instantiate the subset named on the command line.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use thiserror::Error;

use crate::metrics::host::HostCollector;
use crate::metrics::memory::MemoryCollector;
use crate::metrics::pool::PoolCollector;
use crate::metrics::storage::StorageCollector;
use crate::metrics::{Collector, CollectorContext};

/// Collectors enabled when no explicit list is given
pub const DEFAULT_COLLECTORS: &str = "host";

/// Stands for `DEFAULT_COLLECTORS` inside a collector list
pub const DEFAULTS_PLACEHOLDER: &str = "[defaults]";

pub type CollectorFactory = fn(&CollectorContext) -> Arc<dyn Collector>;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum RegistryError {
    #[error("unknown collector '{0}'")]
    UnknownCollector(String),

    #[error("collector registered as '{registered}' reports name '{reported}'")]
    NameMismatch { registered: String, reported: String },
}

/// Name to factory mapping
pub struct CollectorRegistry {
    factories: HashMap<&'static str, CollectorFactory>,
}

impl CollectorRegistry {
    pub fn new() -> Self {
        CollectorRegistry {
            factories: HashMap::new(),
        }
    }

    /// Registry holding every built-in collector
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(HostCollector::NAME, |ctx| Arc::new(HostCollector::new(ctx)));
        registry.register(MemoryCollector::NAME, |ctx| {
            Arc::new(MemoryCollector::new(ctx))
        });
        registry.register(PoolCollector::NAME, |ctx| Arc::new(PoolCollector::new(ctx)));
        registry.register(StorageCollector::NAME, |ctx| {
            Arc::new(StorageCollector::new(ctx))
        });
        registry
    }

    /// Adds a collector type
    ///
    /// # Panics
    /// If `name` is already registered. Two types sharing a name is a bug.
    pub fn register(&mut self, name: &'static str, factory: CollectorFactory) {
        if self.factories.insert(name, factory).is_some() {
            panic!("collector '{}' registered twice", name);
        }
    }

    /// Registered names, sorted
    pub fn names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.factories.keys().copied().collect();
        names.sort_unstable();
        names
    }

    /// Instantiates exactly the requested collectors
    ///
    /// # Returns
    /// * `Ok(map)` - One live collector per requested name
    /// * `Err(RegistryError::UnknownCollector)` - On the first name without a
    ///   factory; nothing is instantiated in that case
    /// * `Err(RegistryError::NameMismatch)` - A factory built a collector whose
    ///   `name()` differs from its registry key
    pub fn enable<S: AsRef<str>>(
        &self,
        names: &[S],
        ctx: &CollectorContext,
    ) -> Result<BTreeMap<String, Arc<dyn Collector>>, RegistryError> {
        let factories = names
            .iter()
            .map(|name| {
                let name = name.as_ref();
                self.factories
                    .get(name)
                    .map(|factory| (name.to_string(), *factory))
                    .ok_or_else(|| RegistryError::UnknownCollector(name.to_string()))
            })
            .collect::<Result<Vec<_>, _>>()?;

        factories
            .into_iter()
            .map(|(name, factory)| {
                let collector = factory(ctx);
                if collector.name() != name {
                    return Err(RegistryError::NameMismatch {
                        reported: collector.name().to_string(),
                        registered: name,
                    });
                }
                Ok((name, collector))
            })
            .collect()
    }
}

impl Default for CollectorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Turns a comma-separated collector list into unique names
///
/// `[defaults]` expands to `DEFAULT_COLLECTORS`; blank entries are dropped.
pub fn expand_enabled_collectors(enabled: &str) -> Vec<String> {
    let expanded = enabled.replace(DEFAULTS_PLACEHOLDER, DEFAULT_COLLECTORS);
    expanded
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}
