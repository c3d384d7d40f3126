//! Explicit caches keyed by path, invalidated through a shared generation token.

use std::{
    hash::Hash,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use indexmap::IndexMap;
use parking_lot::RwLock;

use crate::{
    directory::{workflow_root, DirectoryConfig},
    error::Result,
    routing::{RoutingDefinition, RoutingOptions},
    telemetry::Telemetry,
};

/// Invalidation token shared by every registry built from it.
///
/// Bumping the token makes every entry cached under an older value invisible at once.
#[derive(Debug, Clone, Default)]
pub struct Generation(Arc<AtomicU64>);

impl Generation {
    /// Fresh token starting at zero.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Current value.
    #[must_use]
    pub fn current(&self) -> u64 {
        self.0.load(Ordering::Acquire)
    }

    /// Invalidates everything cached so far, returning the new value.
    pub fn bump(&self) -> u64 {
        self.0.fetch_add(1, Ordering::AcqRel) + 1
    }
}

#[derive(Debug)]
struct Slot<V> {
    generation: u64,
    value: V,
}

/// Cache with `get_or_build` semantics that lives until its generation is bumped.
#[derive(Debug)]
pub struct Registry<K, V> {
    generation: Generation,
    entries: RwLock<IndexMap<K, Slot<V>>>,
}

impl<K: Hash + Eq, V> Default for Registry<K, V> {
    fn default() -> Self {
        Self::new(Generation::new())
    }
}

impl<K: Hash + Eq, V> Registry<K, V> {
    /// Registry bound to `generation`.
    #[must_use]
    pub fn new(generation: Generation) -> Self {
        Self {
            generation,
            entries: RwLock::new(IndexMap::new()),
        }
    }

    /// Token this registry follows.
    #[must_use]
    pub const fn generation(&self) -> &Generation {
        &self.generation
    }

    /// Number of live entries.
    #[must_use]
    pub fn len(&self) -> usize {
        let current = self.generation.current();
        self.entries
            .read()
            .values()
            .filter(|slot| slot.generation == current)
            .count()
    }

    /// True when nothing live is cached.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<K: Hash + Eq, V: Clone> Registry<K, V> {
    /// Live value for `key`.
    #[must_use]
    pub fn get(&self, key: &K) -> Option<V> {
        let current = self.generation.current();
        self.entries
            .read()
            .get(key)
            .filter(|slot| slot.generation == current)
            .map(|slot| slot.value.clone())
    }

    /// Stores `value`, dropping entries from older generations.
    pub fn insert(&self, key: K, value: V) {
        let current = self.generation.current();
        let mut entries = self.entries.write();
        entries.retain(|_, slot| slot.generation == current);
        entries.insert(
            key,
            Slot {
                generation: current,
                value,
            },
        );
    }

    /// Returns the cached value or builds, caches and returns a new one.
    ///
    /// Builders run without the lock held; concurrent builders for one key race and
    /// the last one wins.
    pub fn get_or_build<E>(
        &self,
        key: K,
        build: impl FnOnce() -> std::result::Result<V, E>,
    ) -> std::result::Result<V, E> {
        if let Some(value) = self.get(&key) {
            return Ok(value);
        }
        let value = build()?;
        self.insert(key, value.clone());
        Ok(value)
    }
}

/// Process-wide routing cache keyed by absolute workflow path.
#[derive(Debug)]
pub struct RoutingRegistry {
    generation: Generation,
    definitions: Registry<PathBuf, Arc<RoutingDefinition>>,
    config: DirectoryConfig,
    telemetry: Option<Telemetry>,
}

impl Default for RoutingRegistry {
    fn default() -> Self {
        Self::new(DirectoryConfig::default())
    }
}

impl RoutingRegistry {
    /// Registry using `config` for every workflow.
    #[must_use]
    pub fn new(config: DirectoryConfig) -> Self {
        let generation = Generation::new();
        Self {
            definitions: Registry::new(generation.clone()),
            generation,
            config,
            telemetry: None,
        }
    }

    /// Attaches telemetry passed to every definition built through the registry.
    #[must_use]
    pub fn with_telemetry(mut self, telemetry: Telemetry) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    /// Token shared with dependent caches.
    #[must_use]
    pub fn generation(&self) -> Generation {
        self.generation.clone()
    }

    /// Cached definition for `root`, loading (or building) it on first use.
    pub fn get_or_build(&self, root: impl AsRef<Path>) -> Result<Arc<RoutingDefinition>> {
        let root = workflow_root(root.as_ref())?;
        self.definitions.get_or_build(root.clone(), || {
            RoutingDefinition::load_with(&root, &self.options()).map(Arc::new)
        })
    }

    /// Rebuilds `root` from a fresh scan and caches the result.
    pub fn rebuild(&self, root: impl AsRef<Path>) -> Result<Arc<RoutingDefinition>> {
        let root = workflow_root(root.as_ref())?;
        let definition = Arc::new(RoutingDefinition::build_with(&root, &self.options())?);
        self.definitions.insert(root, Arc::clone(&definition));
        Ok(definition)
    }

    /// Invalidates every cached directory, definition and class lookup.
    pub fn clear(&self) {
        self.generation.bump();
    }

    /// Number of cached definitions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.definitions.len()
    }

    /// True when nothing is cached.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }

    fn options(&self) -> RoutingOptions {
        RoutingOptions {
            config: self.config.clone(),
            telemetry: self.telemetry.clone(),
            generation: self.generation.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::fixtures::{write, GENERATOR};
    use tempfile::tempdir;

    #[test]
    fn bump_hides_old_entries() {
        let registry: Registry<String, u32> = Registry::default();
        let mut builds = 0;
        let mut build = || -> std::result::Result<u32, ()> {
            builds += 1;
            Ok(7)
        };
        assert_eq!(registry.get_or_build("a".into(), &mut build), Ok(7));
        assert_eq!(registry.get_or_build("a".into(), &mut build), Ok(7));
        assert_eq!(builds, 1);

        registry.generation().bump();
        assert!(registry.get(&"a".to_string()).is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn shared_generation_clears_every_registry() {
        let generation = Generation::new();
        let left: Registry<u8, u8> = Registry::new(generation.clone());
        let right: Registry<u8, u8> = Registry::new(generation.clone());
        left.insert(1, 1);
        right.insert(2, 2);
        generation.bump();
        assert!(left.is_empty() && right.is_empty());
    }

    #[test]
    fn routing_registry_caches_by_absolute_path() {
        let tmp = tempdir().unwrap();
        write(tmp.path(), "_commands/Order/cancel.py", GENERATOR);
        let registry = RoutingRegistry::default();

        let first = registry.get_or_build(tmp.path()).unwrap();
        let relative = tmp.path().join("_commands").join("..");
        let second = registry.get_or_build(&relative).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(registry.len(), 1);

        registry.clear();
        assert!(registry.is_empty());
        let third = registry.get_or_build(tmp.path()).unwrap();
        assert!(!Arc::ptr_eq(&first, &third));
    }
}
