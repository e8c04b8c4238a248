//! Chip Registry: maps a dotted chip name to the handler that runs it.
//!
//! Chip names are namespaced by dots (`net.http.get`). A lookup that
//! misses the exact name falls back to progressively shorter prefixes, so
//! a single handler registered at `net.http` can serve every leaf chip
//! under that namespace without each leaf needing its own registration.

use crate::error::ReasonChipError;
use crate::value::Value;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;

/// A callable unit of work a `chip` task can dispatch to.
#[async_trait]
pub trait Chip: Send + Sync {
    async fn call(&self, chip_name: &str, input: Value) -> Result<Value, ReasonChipError>;

    /// Optional JSON-Schema-shaped description of the accepted input, used
    /// by the engine's validation pass. `None` means "no static check."
    fn input_schema(&self) -> Option<&Value> {
        None
    }

    fn output_schema(&self) -> Option<&Value> {
        None
    }
}

#[derive(Clone, Default)]
pub struct ChipRegistry {
    chips: BTreeMap<String, Arc<dyn Chip>>,
}

impl ChipRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `chip` under `name`. Fatal on collision: a pipeline system
    /// with two handlers claiming the same name has an ambiguous chip
    /// table, and that is caught at registration time rather than at
    /// whichever call happens to race first.
    pub fn register(&mut self, name: impl Into<String>, chip: Arc<dyn Chip>) -> Result<(), ReasonChipError> {
        let name = name.into();
        if self.chips.contains_key(&name) {
            return Err(ReasonChipError::ChipCollision(name));
        }
        self.chips.insert(name, chip);
        Ok(())
    }

    /// Exact-name lookup falling back to the nearest registered dotted
    /// prefix of `name`.
    pub fn lookup(&self, name: &str) -> Option<Arc<dyn Chip>> {
        if let Some(c) = self.chips.get(name) {
            return Some(c.clone());
        }
        let mut prefix = name;
        while let Some(idx) = prefix.rfind('.') {
            prefix = &prefix[..idx];
            if let Some(c) = self.chips.get(prefix) {
                return Some(c.clone());
            }
        }
        None
    }

    /// List every registered name under `module_prefix` (or all names if
    /// empty), for introspection and `engine.validate`'s unknown-chip check.
    pub fn discover(&self, module_prefix: &str) -> Vec<String> {
        if module_prefix.is_empty() {
            return self.chips.keys().cloned().collect();
        }
        self.chips
            .keys()
            .filter(|k| *k == module_prefix || k.starts_with(&format!("{module_prefix}.")))
            .cloned()
            .collect()
    }

    pub fn contains_resolvable(&self, name: &str) -> bool {
        self.lookup(name).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo;

    #[async_trait]
    impl Chip for Echo {
        async fn call(&self, _chip_name: &str, input: Value) -> Result<Value, ReasonChipError> {
            Ok(input)
        }
    }

    #[test]
    fn register_collision_is_fatal() {
        let mut reg = ChipRegistry::new();
        reg.register("net.http", Arc::new(Echo)).unwrap();
        let err = reg.register("net.http", Arc::new(Echo)).unwrap_err();
        assert!(matches!(err, ReasonChipError::ChipCollision(_)));
    }

    #[test]
    fn lookup_falls_back_to_module_prefix() {
        let mut reg = ChipRegistry::new();
        reg.register("net.http", Arc::new(Echo)).unwrap();
        assert!(reg.lookup("net.http.get").is_some());
        assert!(reg.lookup("net.http").is_some());
        assert!(reg.lookup("fs.read").is_none());
    }

    #[test]
    fn discover_lists_namespace() {
        let mut reg = ChipRegistry::new();
        reg.register("net.http", Arc::new(Echo)).unwrap();
        reg.register("net.tcp", Arc::new(Echo)).unwrap();
        reg.register("fs.read", Arc::new(Echo)).unwrap();
        let names = reg.discover("net");
        assert_eq!(names, vec!["net.http".to_string(), "net.tcp".to_string()]);
    }
}
