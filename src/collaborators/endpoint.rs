//! Access-endpoint collaborators
//!
//! One provider per endpoint technology (DNS, load balancer, service mesh),
//! all keyed by (name-or-VIP, port, member addresses).

use std::collections::BTreeMap;
use std::sync::Arc;

use super::errors::{CollaboratorError, CollaboratorResult};
use crate::topology::{EntryKind, InstanceAddr};

/// Client for one kind of access endpoint.
pub trait EndpointProvider: Send + Sync {
    /// Endpoint technology handled by this provider.
    fn kind(&self) -> EntryKind;

    /// Create the entry if missing and add targets to it.
    fn add_targets(&self, name: &str, port: u16, targets: &[InstanceAddr]) -> CollaboratorResult<()>;

    /// Remove targets from the entry.
    fn remove_targets(&self, name: &str, port: u16, targets: &[InstanceAddr]) -> CollaboratorResult<()>;

    /// Delete the entry.
    fn delete_entry(&self, name: &str, port: u16) -> CollaboratorResult<()>;
}

/// Providers by endpoint kind.
#[derive(Clone, Default)]
pub struct EndpointRegistry {
    providers: BTreeMap<EntryKind, Arc<dyn EndpointProvider>>,
}

impl EndpointRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a provider under its own kind, replacing any previous one.
    pub fn register(&mut self, provider: Arc<dyn EndpointProvider>) {
        self.providers.insert(provider.kind(), provider);
    }

    /// Builder-style register.
    pub fn with(mut self, provider: Arc<dyn EndpointProvider>) -> Self {
        self.register(provider);
        self
    }

    /// Provider for a kind.
    pub fn get(&self, kind: EntryKind) -> CollaboratorResult<&Arc<dyn EndpointProvider>> {
        self.providers
            .get(&kind)
            .ok_or(CollaboratorError::NoProvider(kind.as_str()))
    }

    /// Registered kinds.
    pub fn kinds(&self) -> Vec<EntryKind> {
        self.providers.keys().copied().collect()
    }
}

impl std::fmt::Debug for EndpointRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EndpointRegistry")
            .field("kinds", &self.kinds())
            .finish()
    }
}
