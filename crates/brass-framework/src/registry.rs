//! The plugin registry.
//!
//! [`PluginRegistry`] holds the active plugin set as a copy-on-write
//! [`RegistrySnapshot`]: an `Arc` of an immutable, sorted entry list stamped
//! with a generation number. Every mutation builds a new snapshot and publishes
//! it atomically, so a dispatch that took a snapshot keeps seeing exactly that
//! plugin list no matter what happens to the registry afterwards.
//!
//! # Ordering
//!
//! Entries are sorted by `(priority, registration sequence)`. The sequence is
//! assigned on [`register`](PluginRegistry::register) (or in list order on
//! [`swap`](PluginRegistry::swap)) and survives
//! [`disable`](PluginRegistry::disable)/[`enable`](PluginRegistry::enable).
//!
//! ```text
//! register(A, p=10)  register(B, p=5)  register(C, p=10)
//!                         │
//!                         ▼
//!            snapshot: [B(5,#2), A(10,#1), C(10,#3)]
//! ```

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, info};

use crate::error::{RegistryError, RegistryResult};
use crate::plugin::PluginDescriptor;

/// One registered plugin inside a snapshot.
#[derive(Debug, Clone)]
pub struct RegistryEntry {
    descriptor: PluginDescriptor,
    seq: u64,
    enabled: bool,
}

impl RegistryEntry {
    /// The registered descriptor.
    pub fn descriptor(&self) -> &PluginDescriptor {
        &self.descriptor
    }

    /// The plugin name.
    pub fn name(&self) -> &str {
        self.descriptor.name()
    }

    /// Registration sequence number, used as the priority tie-break.
    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// Returns `false` if the plugin is disabled and skipped by dispatch.
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }
}

/// An immutable, ordered view of the registry.
#[derive(Debug, Default)]
pub struct RegistrySnapshot {
    generation: u64,
    entries: Vec<RegistryEntry>,
}

impl RegistrySnapshot {
    /// Generation number. Incremented on every registry mutation.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// All entries in dispatch order, including disabled ones.
    pub fn entries(&self) -> &[RegistryEntry] {
        &self.entries
    }

    /// Enabled entries in dispatch order.
    pub fn enabled(&self) -> impl Iterator<Item = &RegistryEntry> {
        self.entries.iter().filter(|e| e.enabled)
    }

    /// Looks up an entry by name.
    pub fn get(&self, name: &str) -> Option<&RegistryEntry> {
        self.entries.iter().find(|e| e.name() == name)
    }

    /// Plugin names in dispatch order.
    pub fn names(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.name().to_string()).collect()
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if there are no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

struct RegistryInner {
    current: Arc<RegistrySnapshot>,
    next_seq: u64,
}

impl RegistryInner {
    fn publish(&mut self, mut entries: Vec<RegistryEntry>) -> u64 {
        entries.sort_by_key(|e| (e.descriptor.get_priority(), e.seq));
        let generation = self.current.generation + 1;
        self.current = Arc::new(RegistrySnapshot {
            generation,
            entries,
        });
        generation
    }

    fn position(&self, name: &str) -> RegistryResult<usize> {
        self.current
            .entries
            .iter()
            .position(|e| e.name() == name)
            .ok_or_else(|| RegistryError::NotFound {
                name: name.to_string(),
            })
    }
}

/// The active plugin set.
///
/// All operations are synchronous and short; readers never wait on a
/// dispatch, and a dispatch never holds the registry lock.
pub struct PluginRegistry {
    inner: RwLock<RegistryInner>,
}

impl Default for PluginRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl PluginRegistry {
    /// Creates an empty registry at generation 0.
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(RegistryInner {
                current: Arc::new(RegistrySnapshot::default()),
                next_seq: 0,
            }),
        }
    }

    /// Returns the current snapshot.
    pub fn snapshot(&self) -> Arc<RegistrySnapshot> {
        Arc::clone(&self.inner.read().current)
    }

    /// Current generation number.
    pub fn generation(&self) -> u64 {
        self.inner.read().current.generation
    }

    /// Adds a plugin.
    ///
    /// Fails with [`RegistryError::DuplicateName`] if the name is taken; the
    /// registry is left unchanged.
    pub fn register(&self, descriptor: PluginDescriptor) -> RegistryResult<()> {
        let mut inner = self.inner.write();
        if inner.current.get(descriptor.name()).is_some() {
            return Err(RegistryError::DuplicateName {
                name: descriptor.name().to_string(),
            });
        }

        let seq = inner.next_seq;
        inner.next_seq += 1;

        let name = descriptor.name().to_string();
        let priority = descriptor.get_priority();
        let mut entries = inner.current.entries.clone();
        entries.push(RegistryEntry {
            descriptor,
            seq,
            enabled: true,
        });
        let generation = inner.publish(entries);

        debug!(plugin = %name, priority, generation, "Plugin registered");
        Ok(())
    }

    /// Removes a plugin and returns its descriptor.
    pub fn deregister(&self, name: &str) -> RegistryResult<PluginDescriptor> {
        let mut inner = self.inner.write();
        let index = inner.position(name)?;

        let mut entries = inner.current.entries.clone();
        let removed = entries.remove(index);
        let generation = inner.publish(entries);

        debug!(plugin = %name, generation, "Plugin deregistered");
        Ok(removed.descriptor)
    }

    /// Atomically replaces the whole plugin set.
    ///
    /// Registration order of the new set is its list order. A set containing a
    /// duplicate name is rejected and the registry is left unchanged. Returns
    /// the new generation.
    pub fn swap(&self, plugins: Vec<PluginDescriptor>) -> RegistryResult<u64> {
        let mut seen = HashSet::with_capacity(plugins.len());
        for descriptor in &plugins {
            if !seen.insert(descriptor.shared_name().clone()) {
                return Err(RegistryError::DuplicateName {
                    name: descriptor.name().to_string(),
                });
            }
        }

        let mut inner = self.inner.write();
        let count = plugins.len();
        let mut entries = Vec::with_capacity(count);
        for descriptor in plugins {
            let seq = inner.next_seq;
            inner.next_seq += 1;
            entries.push(RegistryEntry {
                descriptor,
                seq,
                enabled: true,
            });
        }
        let generation = inner.publish(entries);

        info!(plugins = count, generation, "Plugin set swapped");
        Ok(generation)
    }

    /// Disables a plugin without losing its registration order.
    pub fn disable(&self, name: &str) -> RegistryResult<()> {
        self.set_enabled(name, false)
    }

    /// Re-enables a disabled plugin.
    pub fn enable(&self, name: &str) -> RegistryResult<()> {
        self.set_enabled(name, true)
    }

    fn set_enabled(&self, name: &str, enabled: bool) -> RegistryResult<()> {
        let mut inner = self.inner.write();
        let index = inner.position(name)?;
        if inner.current.entries[index].enabled == enabled {
            return Ok(());
        }

        let mut entries = inner.current.entries.clone();
        entries[index].enabled = enabled;
        let generation = inner.publish(entries);

        debug!(plugin = %name, enabled, generation, "Plugin toggled");
        Ok(())
    }

    /// Returns `true` if a plugin with this name is registered.
    pub fn contains(&self, name: &str) -> bool {
        self.inner.read().current.get(name).is_some()
    }

    /// Plugin names in dispatch order.
    pub fn names(&self) -> Vec<String> {
        self.inner.read().current.names()
    }

    /// Number of registered plugins (enabled or not).
    pub fn len(&self) -> usize {
        self.inner.read().current.len()
    }

    /// Returns `true` if no plugins are registered.
    pub fn is_empty(&self) -> bool {
        self.inner.read().current.is_empty()
    }
}

impl std::fmt::Debug for PluginRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.read();
        f.debug_struct("PluginRegistry")
            .field("generation", &inner.current.generation)
            .field("plugins", &inner.current.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matcher_builders::PluginBuilder;
    use crate::plugin::Outcome;
    use tokio_test::{assert_err, assert_ok};

    fn plugin(name: &str, priority: i32) -> PluginDescriptor {
        PluginBuilder::new(name)
            .priority(priority)
            .handler(|_| async { Ok(Outcome::Pass) })
    }

    #[test]
    fn test_sorted_by_priority_then_registration() {
        let registry = PluginRegistry::new();
        assert_ok!(registry.register(plugin("A", 10)));
        assert_ok!(registry.register(plugin("B", 5)));
        assert_ok!(registry.register(plugin("C", 10)));

        assert_eq!(registry.names(), vec!["B", "A", "C"]);
        assert_eq!(registry.generation(), 3);
    }

    #[test]
    fn test_duplicate_register_leaves_registry_unchanged() {
        let registry = PluginRegistry::new();
        assert_ok!(registry.register(plugin("A", 0)));
        let generation = registry.generation();

        let err = assert_err!(registry.register(plugin("A", 1)));
        assert_eq!(err, RegistryError::DuplicateName { name: "A".into() });

        assert_eq!(registry.len(), 1);
        assert_eq!(registry.generation(), generation);
        assert_eq!(registry.snapshot().get("A").unwrap().descriptor().get_priority(), 0);
    }

    #[test]
    fn test_deregister() {
        let registry = PluginRegistry::new();
        assert_ok!(registry.register(plugin("A", 0)));

        let removed = assert_ok!(registry.deregister("A"));
        assert_eq!(removed.name(), "A");
        assert!(!registry.contains("A"));

        let err = assert_err!(registry.deregister("A"));
        assert_eq!(err, RegistryError::NotFound { name: "A".into() });
    }

    #[test]
    fn test_snapshot_is_immutable_after_publication() {
        let registry = PluginRegistry::new();
        assert_ok!(registry.register(plugin("A", 0)));
        let before = registry.snapshot();

        assert_ok!(registry.swap(vec![plugin("X", 0), plugin("Y", 1)]));
        let after = registry.snapshot();

        assert_eq!(before.names(), vec!["A"]);
        assert_eq!(after.names(), vec!["X", "Y"]);
        assert!(after.generation() > before.generation());
    }

    #[test]
    fn test_swap_rejects_duplicates() {
        let registry = PluginRegistry::new();
        assert_ok!(registry.register(plugin("A", 0)));
        let generation = registry.generation();

        let err = assert_err!(registry.swap(vec![plugin("X", 0), plugin("X", 1)]));
        assert_eq!(err, RegistryError::DuplicateName { name: "X".into() });
        assert_eq!(registry.names(), vec!["A"]);
        assert_eq!(registry.generation(), generation);
    }

    #[test]
    fn test_disable_keeps_order() {
        let registry = PluginRegistry::new();
        assert_ok!(registry.register(plugin("A", 0)));
        assert_ok!(registry.register(plugin("B", 0)));
        assert_ok!(registry.register(plugin("C", 0)));

        assert_ok!(registry.disable("A"));
        let snapshot = registry.snapshot();
        let enabled: Vec<_> = snapshot.enabled().map(|e| e.name()).collect();
        assert_eq!(enabled, vec!["B", "C"]);

        assert_ok!(registry.enable("A"));
        assert_eq!(registry.names(), vec!["A", "B", "C"]);
        assert!(registry.snapshot().enabled().all(|e| e.is_enabled()));

        assert_err!(registry.disable("missing"));
    }
}
