use crate::error::{Error, Result};
use crate::module::{Module, ModuleKey, ModuleKind};
use crate::rule::Direction;
use log::debug;
use std::collections::BTreeMap;

/// The live modules of a firewall instance, for both chains and the shared
/// ones. The registry owns the handles: removing one unloads the module.
#[derive(Default)]
pub struct Programs {
    modules: BTreeMap<ModuleKey, Box<dyn Module>>,
}

impl Programs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_mut(&mut self, key: &ModuleKey) -> Option<&mut (dyn Module + 'static)> {
        self.modules.get_mut(key).map(|m| m.as_mut())
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    /// Shared module required by the chains, e.g. the forwarder.
    pub fn shared_mut(&mut self, kind: ModuleKind) -> Result<&mut (dyn Module + 'static)> {
        self.get_mut(&ModuleKey::shared(kind))
            .ok_or_else(|| Error::invalid_state(format!("no {} module loaded", kind)))
    }

    pub fn chain_mut(
        &mut self,
        kind: ModuleKind,
        direction: Direction,
    ) -> Option<&mut (dyn Module + 'static)> {
        self.get_mut(&ModuleKey::chain(kind, direction))
    }

    /// Registers a module, the one previously registered under the same
    /// key is unloaded.
    pub fn insert(&mut self, key: ModuleKey, module: Box<dyn Module>) {
        debug!("Register {} at position {}", key, module.position());
        if let Some(old) = self.modules.insert(key, module) {
            debug!("Unload {} from position {}", key, old.position());
        }
    }

    /// Unloads all the modules of a chain generation, returns how many.
    pub fn retire(&mut self, direction: Direction) -> usize {
        let keys = self
            .modules
            .keys()
            .filter(|k| k.direction == Some(direction))
            .copied()
            .collect::<Vec<_>>();
        for key in &keys {
            if let Some(module) = self.modules.remove(key) {
                debug!("Unload {} from position {}", key, module.position());
            }
        }
        keys.len()
    }

    /// Chain modules sorted by position.
    pub fn layout(&self, direction: Direction) -> Vec<(ModuleKind, u32)> {
        let mut layout = self
            .modules
            .iter()
            .filter(|(k, _)| k.direction == Some(direction))
            .map(|(k, m)| (k.kind, m.position()))
            .collect::<Vec<_>>();
        layout.sort_by_key(|(_, pos)| *pos);
        layout
    }
}
