use crate::error::{CfmError, PluginKind};
use crate::export::Exporter;
use crate::map::{Combiner, UpdateObserver};
use std::collections::HashMap;
use std::sync::Arc;

type Factory<T> = Arc<dyn Fn() -> Arc<T> + Send + Sync>;

/// Named factories for the pluggable parts of maps and export queues.
///
/// Options persisted in [`crate::config::AppConfig`] refer to combiners,
/// update observers and exporters by name; a registry resolves those names
/// when an instance is rebuilt.
pub struct PluginRegistry<K, V> {
    combiners: HashMap<String, Factory<dyn Combiner<K, V>>>,
    update_observers: HashMap<String, Factory<dyn UpdateObserver<K, V>>>,
    exporters: HashMap<String, Factory<dyn Exporter<K, V>>>,
}

impl<K, V> Default for PluginRegistry<K, V> {
    fn default() -> Self {
        Self {
            combiners: HashMap::new(),
            update_observers: HashMap::new(),
            exporters: HashMap::new(),
        }
    }
}

impl<K: 'static, V: 'static> PluginRegistry<K, V> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_combiner<C, F>(mut self, name: impl Into<String>, factory: F) -> Self
    where
        C: Combiner<K, V> + 'static,
        F: Fn() -> C + Send + Sync + 'static,
    {
        self.combiners.insert(
            name.into(),
            Arc::new(move || Arc::new(factory()) as Arc<dyn Combiner<K, V>>),
        );
        self
    }

    pub fn with_update_observer<O, F>(mut self, name: impl Into<String>, factory: F) -> Self
    where
        O: UpdateObserver<K, V> + 'static,
        F: Fn() -> O + Send + Sync + 'static,
    {
        self.update_observers.insert(
            name.into(),
            Arc::new(move || Arc::new(factory()) as Arc<dyn UpdateObserver<K, V>>),
        );
        self
    }

    pub fn with_exporter<E, F>(mut self, name: impl Into<String>, factory: F) -> Self
    where
        E: Exporter<K, V> + 'static,
        F: Fn() -> E + Send + Sync + 'static,
    {
        self.exporters.insert(
            name.into(),
            Arc::new(move || Arc::new(factory()) as Arc<dyn Exporter<K, V>>),
        );
        self
    }

    pub fn combiner(&self, name: &str) -> Result<Arc<dyn Combiner<K, V>>, CfmError> {
        lookup(&self.combiners, PluginKind::Combiner, name)
    }

    pub fn update_observer(&self, name: &str) -> Result<Arc<dyn UpdateObserver<K, V>>, CfmError> {
        lookup(&self.update_observers, PluginKind::UpdateObserver, name)
    }

    pub fn exporter(&self, name: &str) -> Result<Arc<dyn Exporter<K, V>>, CfmError> {
        lookup(&self.exporters, PluginKind::Exporter, name)
    }
}

fn lookup<T: ?Sized>(
    factories: &HashMap<String, Factory<T>>,
    kind: PluginKind,
    name: &str,
) -> Result<Arc<T>, CfmError> {
    factories
        .get(name)
        .map(|factory| factory())
        .ok_or_else(|| CfmError::MissingPlugin {
            kind,
            name: name.to_string(),
        })
}
