//! Translator instances and their registry.
//!
//! An instance is immutable once published — configuration changes build a
//! new instance and swap it in. Readers hold `Arc` clones, so a replaced or
//! removed instance is reclaimed only after the last in-flight translation
//! drops its reference.

use crate::addr_xlat::Siit;
use crate::bib::Bib;
use crate::config::{ConfigError, Globals};
use crate::pool4::Pool4;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// Which of the two translation disciplines an instance runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    /// Stateless (EAM + RFC 6052).
    Siit,
    /// Stateful (RFC 6146), with pool4 and the BIB.
    Nat64,
}

/// One named translator: configuration plus every table it owns.
#[derive(Debug)]
pub struct Instance {
    pub name: String,
    pub kind: Kind,
    pub globals: Globals,
    pub siit: Siit,
    pub pool4: Pool4,
    pub bib: Bib,
}

impl Instance {
    pub fn new_siit(
        name: impl Into<String>,
        globals: Globals,
        siit: Siit,
    ) -> Result<Self, InstanceError> {
        globals.validate()?;

        Ok(Self {
            name: name.into(),
            kind: Kind::Siit,
            globals,
            siit,
            pool4: Pool4::new(),
            bib: Bib::new(),
        })
    }

    pub fn new_nat64(name: impl Into<String>, globals: Globals) -> Result<Self, InstanceError> {
        globals.validate()?;
        if globals.pool6.is_none() {
            return Err(InstanceError::MissingPool6);
        }

        Ok(Self {
            name: name.into(),
            kind: Kind::Nat64,
            globals,
            siit: Siit::new(),
            pool4: Pool4::new(),
            bib: Bib::new(),
        })
    }
}

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum InstanceError {
    #[error("stateful translation requires a pool6 prefix")]
    MissingPool6,
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// The set of live translator instances.
///
/// Mutations serialize on one lock; lookups clone an `Arc` out and never
/// block each other. Replacement publishes the new instance atomically and
/// leaves reclamation of the old one to its last reader.
#[derive(Debug, Default)]
pub struct Registry {
    instances: Mutex<HashMap<String, Arc<Instance>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts translating under the instance's name.
    pub fn add(&self, instance: Instance) -> Result<Arc<Instance>, RegistryError> {
        let mut instances = self.instances.lock();

        if instances.contains_key(&instance.name) {
            return Err(RegistryError::AlreadyExists);
        }

        let instance = Arc::new(instance);
        instances.insert(instance.name.clone(), Arc::clone(&instance));

        tracing::info!(name = %instance.name, kind = ?instance.kind, "Instance added");
        Ok(instance)
    }

    /// Snapshot of a live instance. The caller may keep using it after a
    /// concurrent remove or replace; it sees the old tables until it drops
    /// the handle.
    pub fn get(&self, name: &str) -> Option<Arc<Instance>> {
        self.instances.lock().get(name).cloned()
    }

    /// Stops translating under `name`. In-flight packets finish against the
    /// removed instance.
    pub fn remove(&self, name: &str) -> Result<(), RegistryError> {
        let removed = self.instances.lock().remove(name);

        match removed {
            Some(instance) => {
                tracing::info!(name = %instance.name, "Instance removed");
                Ok(())
            }
            None => Err(RegistryError::NotFound),
        }
    }

    /// Atomically swaps the instance with the same name.
    pub fn replace(&self, instance: Instance) -> Result<Arc<Instance>, RegistryError> {
        let mut instances = self.instances.lock();

        if !instances.contains_key(&instance.name) {
            return Err(RegistryError::NotFound);
        }

        let instance = Arc::new(instance);
        instances.insert(instance.name.clone(), Arc::clone(&instance));

        tracing::info!(name = %instance.name, "Instance replaced");
        Ok(instance)
    }

    pub fn for_each(&self, mut f: impl FnMut(&Arc<Instance>)) {
        for instance in self.instances.lock().values() {
            f(instance);
        }
    }

    pub fn len(&self) -> usize {
        self.instances.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.lock().is_empty()
    }
}

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("an instance with this name already exists")]
    AlreadyExists,
    #[error("no instance with this name exists")]
    NotFound,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rfc6052::Pool6;

    fn nat64(name: &str) -> Instance {
        let globals = Globals {
            pool6: Some(Pool6::well_known()),
            ..Globals::default()
        };
        Instance::new_nat64(name, globals).unwrap()
    }

    #[test]
    fn add_get_remove() {
        let registry = Registry::new();

        registry.add(nat64("alpha")).unwrap();
        assert!(registry.get("alpha").is_some());
        assert_eq!(
            registry.add(nat64("alpha")).unwrap_err(),
            RegistryError::AlreadyExists
        );

        registry.remove("alpha").unwrap();
        assert!(registry.get("alpha").is_none());
        assert_eq!(registry.remove("alpha").unwrap_err(), RegistryError::NotFound);
    }

    #[test]
    fn replace_is_invisible_to_old_readers() {
        let registry = Registry::new();
        registry.add(nat64("alpha")).unwrap();

        let before = registry.get("alpha").unwrap();
        registry.replace(nat64("alpha")).unwrap();
        let after = registry.get("alpha").unwrap();

        assert!(!Arc::ptr_eq(&before, &after));
        // The old snapshot stays fully usable.
        assert_eq!(before.name, "alpha");
    }

    #[test]
    fn nat64_requires_pool6() {
        assert_eq!(
            Instance::new_nat64("x", Globals::default()).unwrap_err(),
            InstanceError::MissingPool6
        );
    }

    #[test]
    fn replace_requires_an_existing_instance() {
        let registry = Registry::new();
        assert_eq!(
            registry.replace(nat64("ghost")).unwrap_err(),
            RegistryError::NotFound
        );
    }
}
