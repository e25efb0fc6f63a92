//! In-memory module registry.
//!
//! [`ModuleRegistry`] accepts, validates, and stores [`ModuleDescriptor`]s
//! and answers dependency-resolution queries.  Stored descriptors are
//! immutable; the original JSON text is kept alongside the parsed form so a
//! fetch echoes exactly what was registered.
//!
//! Suitable for single-node deployments; module registration is rare
//! relative to request volume, so the state layer wraps the registry in a
//! single reader-writer lock.

use okapi_kernel::{GatewayError, GatewayResult, InterfaceDescriptor, InterfaceType, ModuleDescriptor};
use std::collections::HashMap;

/// A registered module: parsed descriptor plus the raw JSON it arrived as.
#[derive(Debug, Clone)]
pub struct StoredModule {
    pub descriptor: ModuleDescriptor,
    /// Byte-for-byte registration payload, echoed on fetch.
    pub raw: String,
}

/// In-memory index of installed module descriptors.  Cloning snapshots
/// the whole index; enable/disable flows work on a snapshot so the state
/// layer's lock is never held across backend calls.
#[derive(Debug, Clone, Default)]
pub struct ModuleRegistry {
    modules: HashMap<String, StoredModule>,
    /// Registration sequence, used for stable iteration order.
    order: Vec<String>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a module descriptor.
    ///
    /// Re-registering identical content under an existing id is idempotent;
    /// re-registering *different* content under an existing id fails.
    /// Returns `true` when the module was newly stored.
    pub fn register(&mut self, descriptor: ModuleDescriptor, raw: String) -> GatewayResult<bool> {
        descriptor.validate()?;
        if let Some(existing) = self.modules.get(&descriptor.id) {
            // Compare parsed values so insignificant whitespace differences
            // in the payload do not break idempotent re-registration.
            let same = serde_json::from_str::<serde_json::Value>(&existing.raw)
                .ok()
                .zip(serde_json::from_str::<serde_json::Value>(&raw).ok())
                .is_some_and(|(a, b)| a == b);
            if same {
                return Ok(false);
            }
            return Err(GatewayError::Validation(format!(
                "module '{}' already exists with different content",
                descriptor.id
            )));
        }
        self.order.push(descriptor.id.clone());
        self.modules
            .insert(descriptor.id.clone(), StoredModule { descriptor, raw });
        Ok(true)
    }

    /// Remove a module.  The caller is responsible for the
    /// referential-integrity check (no tenant may still enable it).
    pub fn unregister(&mut self, id: &str) -> GatewayResult<()> {
        if self.modules.remove(id).is_none() {
            return Err(GatewayError::NotFound(format!("module '{id}'")));
        }
        self.order.retain(|m| m != id);
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<&StoredModule> {
        self.modules.get(id)
    }

    pub fn descriptor(&self, id: &str) -> GatewayResult<&ModuleDescriptor> {
        self.modules
            .get(id)
            .map(|s| &s.descriptor)
            .ok_or_else(|| GatewayError::NotFound(format!("module '{id}'")))
    }

    /// All registered modules in registration order.
    pub fn list(&self) -> Vec<&ModuleDescriptor> {
        self.order
            .iter()
            .filter_map(|id| self.modules.get(id))
            .map(|s| &s.descriptor)
            .collect()
    }

    /// Modules whose `provides` satisfies `required` (interface id equality
    /// plus version compatibility).  An empty result is a registration-time
    /// warning and an enable-time hard failure — judged by the caller.
    pub fn resolve_requirement(&self, required: &InterfaceDescriptor) -> Vec<&ModuleDescriptor> {
        self.order
            .iter()
            .filter_map(|id| self.modules.get(id))
            .map(|s| &s.descriptor)
            .filter(|md| md.provides.iter().any(|p| p.is_compatible(required)))
            .collect()
    }

    /// Distinct interfaces currently provided by the given enabled set,
    /// optionally filtered by interface type.  First provider wins for
    /// deduplication, preserving enablement order.
    pub fn interfaces_of(
        &self,
        enabled: &[String],
        type_filter: Option<InterfaceType>,
    ) -> Vec<&InterfaceDescriptor> {
        let mut seen: Vec<&str> = Vec::new();
        let mut out = Vec::new();
        for id in enabled {
            let Some(stored) = self.modules.get(id) else {
                continue;
            };
            for iface in &stored.descriptor.provides {
                if let Some(t) = type_filter {
                    if iface.interface_type() != t {
                        continue;
                    }
                }
                if seen.contains(&iface.id.as_str()) {
                    continue;
                }
                seen.push(&iface.id);
                out.push(iface);
            }
        }
        out
    }

    /// Module ids in `enabled` providing the named interface, optionally
    /// filtered by interface type.
    pub fn providers_of(
        &self,
        enabled: &[String],
        interface_id: &str,
        type_filter: Option<InterfaceType>,
    ) -> Vec<&ModuleDescriptor> {
        enabled
            .iter()
            .filter_map(|id| self.modules.get(id))
            .map(|s| &s.descriptor)
            .filter(|md| {
                md.provides.iter().any(|p| {
                    p.id == interface_id
                        && type_filter.is_none_or(|t| p.interface_type() == t)
                })
            })
            .collect()
    }
}

// =============================================================================
// Tests
// =============================================================================
