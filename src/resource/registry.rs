//! Registry of live resources, built once at startup and shared by reference.

use dashmap::DashMap;
use std::sync::Arc;

use super::descriptor::{ResourceDescriptor, ResourceKind};
use super::xa::XaResource;

/// Maps descriptor identifiers to live resources.
///
/// Native and unidentified resources are keyed by their resource key, remote
/// coordinators by peer address.
#[derive(Default)]
pub struct ResourceRegistry {
    natives: DashMap<String, Arc<dyn XaResource>>,
    remotes: DashMap<String, Arc<dyn XaResource>>,
}

impl ResourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a directly attached resource under its resource key.
    pub fn register_native(&self, resource: Arc<dyn XaResource>) {
        let key = resource.resource_key();
        log::debug!("registered native resource {}", key);
        self.natives.insert(key, resource);
    }

    /// Registers the peer coordinator reachable at `address`.
    pub fn register_remote(&self, address: impl Into<String>, coordinator: Arc<dyn XaResource>) {
        let address = address.into();
        log::debug!("registered remote coordinator {}", address);
        self.remotes.insert(address, coordinator);
    }

    /// Removes a registration. Returns true if something was removed.
    pub fn unregister(&self, descriptor: &ResourceDescriptor) -> bool {
        match descriptor.kind {
            ResourceKind::Remote => self.remotes.remove(&descriptor.identifier).is_some(),
            ResourceKind::Native | ResourceKind::Unidentified => {
                self.natives.remove(&descriptor.identifier).is_some()
            }
        }
    }

    /// Finds the live resource a descriptor refers to.
    pub fn lookup(&self, descriptor: &ResourceDescriptor) -> Option<Arc<dyn XaResource>> {
        let map = match descriptor.kind {
            ResourceKind::Remote => &self.remotes,
            ResourceKind::Native | ResourceKind::Unidentified => &self.natives,
        };
        map.get(&descriptor.identifier).map(|e| Arc::clone(e.value()))
    }

    /// Every registered native resource.
    pub fn native_resources(&self) -> Vec<Arc<dyn XaResource>> {
        self.natives.iter().map(|e| Arc::clone(e.value())).collect()
    }

    /// Every registered resource, native ones first.
    pub fn all_resources(&self) -> Vec<Arc<dyn XaResource>> {
        self.natives
            .iter()
            .chain(self.remotes.iter())
            .map(|e| Arc::clone(e.value()))
            .collect()
    }

    /// Number of registered resources of both kinds.
    pub fn len(&self) -> usize {
        self.natives.len() + self.remotes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
