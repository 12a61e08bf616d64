//! Capability registry
//!
//! Maps `(id, version)` to a descriptor and its unit of work. Lookups by id
//! alone resolve to the highest published version.

use crate::descriptor::{CapabilityDescriptor, CapabilityVersion};
use crate::error::{CapabilityError, DescriptorError};
use crate::runtime::CapabilityHandler;
use std::collections::BTreeMap;
use std::sync::Arc;

/// A descriptor bound to its handler
#[derive(Clone)]
pub struct RegisteredCapability {
    descriptor: Arc<CapabilityDescriptor>,
    handler: Arc<dyn CapabilityHandler>,
}

impl std::fmt::Debug for RegisteredCapability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegisteredCapability")
            .field("id", &self.descriptor.id())
            .field("version", &self.descriptor.version())
            .finish_non_exhaustive()
    }
}

impl RegisteredCapability {
    /// Bind a handler to a descriptor
    #[must_use]
    pub fn new(descriptor: CapabilityDescriptor, handler: Arc<dyn CapabilityHandler>) -> Self {
        Self {
            descriptor: Arc::new(descriptor),
            handler,
        }
    }

    /// Static contract
    #[inline]
    #[must_use]
    pub fn descriptor(&self) -> &CapabilityDescriptor {
        &self.descriptor
    }

    /// Unit of work
    #[inline]
    #[must_use]
    pub fn handler(&self) -> Arc<dyn CapabilityHandler> {
        Arc::clone(&self.handler)
    }
}

/// Registry of published capabilities
#[derive(Debug, Default, Clone)]
pub struct CapabilityRegistry {
    capabilities: BTreeMap<(String, CapabilityVersion), RegisteredCapability>,
}

impl CapabilityRegistry {
    /// Create new empty registry
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish a capability
    ///
    /// # Errors
    /// [`DescriptorError::AlreadyRegistered`] if the `(id, version)` pair exists.
    pub fn register(
        &mut self,
        descriptor: CapabilityDescriptor,
        handler: Arc<dyn CapabilityHandler>,
    ) -> Result<(), DescriptorError> {
        let key = (descriptor.id().to_string(), descriptor.version());
        if self.capabilities.contains_key(&key) {
            return Err(DescriptorError::AlreadyRegistered {
                id: key.0,
                version: key.1.to_string(),
            });
        }
        tracing::debug!(capability = %key.0, version = %key.1, "capability registered");
        self.capabilities
            .insert(key, RegisteredCapability::new(descriptor, handler));
        Ok(())
    }

    /// Exact `(id, version)` lookup
    #[must_use]
    pub fn get(&self, id: &str, version: CapabilityVersion) -> Option<&RegisteredCapability> {
        self.capabilities.get(&(id.to_string(), version))
    }

    /// Highest published version of `id`
    #[must_use]
    pub fn latest(&self, id: &str) -> Option<&RegisteredCapability> {
        self.capabilities
            .iter()
            .filter(|((cap_id, _), _)| cap_id == id)
            .map(|(_, cap)| cap)
            .next_back()
    }

    /// Resolve `id` or fail with `UNKNOWN_CAPABILITY`
    ///
    /// # Errors
    /// `UNKNOWN_CAPABILITY` when nothing is published under `id`.
    pub fn resolve(&self, id: &str) -> Result<&RegisteredCapability, CapabilityError> {
        self.latest(id)
            .ok_or_else(|| CapabilityError::unknown_capability(id))
    }

    /// Check if any version of `id` exists
    #[inline]
    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.latest(id).is_some()
    }

    /// Distinct ids, sorted
    #[must_use]
    pub fn ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.capabilities.keys().map(|(id, _)| id.as_str()).collect();
        ids.dedup();
        ids
    }

    /// Get number of registered `(id, version)` pairs
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.capabilities.len()
    }

    /// Check if registry is empty
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.capabilities.is_empty()
    }

    /// Iterate over every registered capability
    pub fn iter(&self) -> impl Iterator<Item = &RegisteredCapability> {
        self.capabilities.values()
    }
}
