//! Tenants and their ordered sets of enabled modules.
//!
//! A module transitions `absent → enabled → absent` per tenant, nothing
//! else.  Enable and disable are all-or-nothing: every check runs before
//! the set is touched, and a failed enable leaves the set exactly as it
//! was.  The enabled set preserves enablement order; that order is the
//! stable tie-break for pipeline construction.
//!
//! During enable/disable the gateway itself invokes the module's system
//! lifecycle interfaces: `_tenant` (POST before the module is live, DELETE
//! best-effort before removal) and `_tenantPermissions` (permission-set
//! forwarding to whichever enabled module consumes them).

use dashmap::DashMap;
use okapi_kernel::{
    Discovery, GatewayError, GatewayResult, HttpMethod, InterfaceType, ModuleDescriptor,
    ModuleInvoker, ProxyResponse, TenantDescriptor, headers,
};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::registry::ModuleRegistry;

/// System interface invoked on tenant enable/disable of a module.
pub const TENANT_INTERFACE: &str = "_tenant";
/// System interface consuming permission sets of enabled modules.
pub const TENANT_PERMISSIONS_INTERFACE: &str = "_tenantPermissions";

// ─────────────────────────────────────────────────────────────────────────────
// Tenant
// ─────────────────────────────────────────────────────────────────────────────

/// A tenant plus its ordered enabled-module set.
#[derive(Debug)]
pub struct Tenant {
    pub descriptor: TenantDescriptor,
    /// Module ids in enablement order.  Write-locked for mutations,
    /// concurrently readable during request processing.
    modules: RwLock<Vec<String>>,
}

impl Tenant {
    fn new(descriptor: TenantDescriptor) -> Self {
        Self {
            descriptor,
            modules: RwLock::new(Vec::new()),
        }
    }

    /// Snapshot of the enabled set in enablement order.
    pub async fn enabled(&self) -> Vec<String> {
        self.modules.read().await.clone()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// TenantStore
// ─────────────────────────────────────────────────────────────────────────────

/// All tenants known to the gateway, keyed by tenant id.
///
/// The map itself is a [`DashMap`] so tenant CRUD does not contend with
/// request traffic; each tenant's module set has its own write lock.
#[derive(Default)]
pub struct TenantStore {
    tenants: DashMap<String, Arc<Tenant>>,
}

impl TenantStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a tenant.  Fails with `Conflict` when the id already exists.
    pub fn insert(&self, descriptor: TenantDescriptor) -> GatewayResult<()> {
        descriptor.validate()?;
        let id = descriptor.id.clone();
        if self.tenants.contains_key(&id) {
            return Err(GatewayError::Conflict(format!("tenant '{id}' already exists")));
        }
        self.tenants.insert(id, Arc::new(Tenant::new(descriptor)));
        Ok(())
    }

    /// Replace a tenant's descriptor (name/description), keeping its set.
    pub async fn update(&self, descriptor: TenantDescriptor) -> GatewayResult<()> {
        descriptor.validate()?;
        let tenant = self.get(&descriptor.id)?;
        let set = tenant.modules.read().await.clone();
        let replacement = Tenant {
            descriptor,
            modules: RwLock::new(set),
        };
        self.tenants
            .insert(replacement.descriptor.id.clone(), Arc::new(replacement));
        Ok(())
    }

    pub fn get(&self, id: &str) -> GatewayResult<Arc<Tenant>> {
        self.tenants
            .get(id)
            .map(|t| t.clone())
            .ok_or_else(|| GatewayError::NotFound(format!("tenant '{id}'")))
    }

    /// Tenant descriptors in id order (stable listing for the HTTP surface).
    pub fn list(&self) -> Vec<TenantDescriptor> {
        let mut out: Vec<TenantDescriptor> = self
            .tenants
            .iter()
            .map(|e| e.value().descriptor.clone())
            .collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }

    /// Delete a tenant and drop its enabled set.
    pub fn delete(&self, id: &str) -> GatewayResult<()> {
        self.tenants
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| GatewayError::NotFound(format!("tenant '{id}'")))
    }

    /// First tenant id that still has the module enabled, if any.  Guards
    /// module unregistration (referential integrity).
    pub async fn module_in_use(&self, module_id: &str) -> Option<String> {
        for entry in self.tenants.iter() {
            let tenant = entry.value().clone();
            if tenant.modules.read().await.iter().any(|m| m == module_id) {
                return Some(tenant.descriptor.id.clone());
            }
        }
        None
    }

    // ─────────────────────────────────────────────────────────────────────
    // Enable / disable / upgrade
    // ─────────────────────────────────────────────────────────────────────

    /// Enable a module for a tenant.
    ///
    /// Checks, in order: module exists, every `requires` is met by the
    /// enabled set or the module itself, and no other enabled module
    /// already provides one of its `proxy`/`system` interfaces (`multiple`
    /// is exempt, as are `_`-prefixed lifecycle interfaces).  The module's
    /// `_tenant` interface is invoked before it is considered live; a
    /// failure there aborts the enable with the set unchanged.
    pub async fn enable(
        &self,
        tenant_id: &str,
        module_id: &str,
        registry: &ModuleRegistry,
        discovery: &dyn Discovery,
        invoker: &dyn ModuleInvoker,
    ) -> GatewayResult<()> {
        let tenant = self.get(tenant_id)?;
        let md = registry.descriptor(module_id)?.clone();
        let mut set = tenant.modules.write().await;

        if set.iter().any(|m| m == module_id) {
            return Err(GatewayError::Conflict(format!(
                "module '{module_id}' already enabled for tenant '{tenant_id}'"
            )));
        }
        check_dependencies(&md, &set, registry)?;
        check_uniqueness(&md, &set, registry)?;

        // _tenant init runs before the module is live.
        if md.provided(TENANT_INTERFACE).is_some() {
            let body = json!({ "module_to": module_id });
            invoke_system(
                discovery,
                invoker,
                tenant_id,
                &md,
                TENANT_INTERFACE,
                HttpMethod::Post,
                "/_/tenant",
                &body,
            )
            .await?;
        }

        set.push(module_id.to_string());
        debug!(tenant = tenant_id, module = module_id, "module enabled");

        self.forward_permissions(tenant_id, &md, &set, registry, discovery, invoker)
            .await;
        Ok(())
    }

    /// Disable a module for a tenant.
    ///
    /// Fails with `Conflict` when another enabled module's `requires`
    /// would become unmet.  The module's `_tenant` DELETE is best-effort:
    /// a failure is logged, never fatal to the disable.
    pub async fn disable(
        &self,
        tenant_id: &str,
        module_id: &str,
        registry: &ModuleRegistry,
        discovery: &dyn Discovery,
        invoker: &dyn ModuleInvoker,
    ) -> GatewayResult<()> {
        let tenant = self.get(tenant_id)?;
        let mut set = tenant.modules.write().await;
        let pos = set
            .iter()
            .position(|m| m == module_id)
            .ok_or_else(|| {
                GatewayError::NotFound(format!(
                    "module '{module_id}' not enabled for tenant '{tenant_id}'"
                ))
            })?;

        let remaining: Vec<String> = set
            .iter()
            .filter(|m| m.as_str() != module_id)
            .cloned()
            .collect();
        check_set_integrity(&remaining, registry)?;

        if let Ok(md) = registry.descriptor(module_id) {
            if md.provided(TENANT_INTERFACE).is_some() {
                let body = json!({ "module_from": module_id });
                if let Err(e) = invoke_system(
                    discovery,
                    invoker,
                    tenant_id,
                    md,
                    TENANT_INTERFACE,
                    HttpMethod::Delete,
                    "/_/tenant",
                    &body,
                )
                .await
                {
                    warn!(
                        tenant = tenant_id,
                        module = module_id,
                        error = %e,
                        "_tenant delete failed, disabling anyway"
                    );
                }
            }
        }

        set.remove(pos);
        debug!(tenant = tenant_id, module = module_id, "module disabled");
        Ok(())
    }

    /// Atomic upgrade: disable `old_id` and enable `new_id` as one step.
    /// If `new_id`'s requirements are unmet — or removing `old_id` would
    /// break another enabled module — nothing changes.
    pub async fn upgrade(
        &self,
        tenant_id: &str,
        old_id: &str,
        new_id: &str,
        registry: &ModuleRegistry,
        discovery: &dyn Discovery,
        invoker: &dyn ModuleInvoker,
    ) -> GatewayResult<()> {
        let tenant = self.get(tenant_id)?;
        let new_md = registry.descriptor(new_id)?.clone();
        let mut set = tenant.modules.write().await;
        let pos = set
            .iter()
            .position(|m| m == old_id)
            .ok_or_else(|| {
                GatewayError::NotFound(format!(
                    "module '{old_id}' not enabled for tenant '{tenant_id}'"
                ))
            })?;

        // Validate against the future set: old replaced by new, in place.
        let mut future = set.clone();
        future[pos] = new_id.to_string();
        check_set_integrity(&future, registry)?;
        let without_new: Vec<String> = future
            .iter()
            .filter(|m| m.as_str() != new_id)
            .cloned()
            .collect();
        check_uniqueness(&new_md, &without_new, registry)?;

        if new_md.provided(TENANT_INTERFACE).is_some() {
            let body = json!({ "module_from": old_id, "module_to": new_id });
            invoke_system(
                discovery,
                invoker,
                tenant_id,
                &new_md,
                TENANT_INTERFACE,
                HttpMethod::Post,
                "/_/tenant",
                &body,
            )
            .await?;
        }

        set[pos] = new_id.to_string();
        debug!(tenant = tenant_id, from = old_id, to = new_id, "module upgraded");

        self.forward_permissions(tenant_id, &new_md, &set, registry, discovery, invoker)
            .await;
        Ok(())
    }

    /// Forward permission sets to the tenant's `_tenantPermissions`
    /// consumer, if one is enabled.
    ///
    /// When the just-enabled module *is* the consumer, every module enabled
    /// before the consumer existed gets its permission sets (re-)forwarded,
    /// in enablement order.  Otherwise only the new module's sets go to the
    /// already-present consumer.  Forwarding is best-effort: failures are
    /// logged and do not undo the enable.
    async fn forward_permissions(
        &self,
        tenant_id: &str,
        new_md: &ModuleDescriptor,
        set: &[String],
        registry: &ModuleRegistry,
        discovery: &dyn Discovery,
        invoker: &dyn ModuleInvoker,
    ) {
        let provider = set
            .iter()
            .filter_map(|m| registry.descriptor(m).ok())
            .find(|md| md.provided(TENANT_PERMISSIONS_INTERFACE).is_some());
        let Some(provider) = provider.cloned() else {
            return;
        };

        let targets: Vec<&ModuleDescriptor> =
            if new_md.provided(TENANT_PERMISSIONS_INTERFACE).is_some() {
                set.iter().filter_map(|m| registry.descriptor(m).ok()).collect()
            } else {
                match registry.descriptor(&new_md.id) {
                    Ok(md) => vec![md],
                    Err(_) => return,
                }
            };

        for target in targets {
            let perms = if target.permission_sets.is_empty() {
                serde_json::Value::Null
            } else {
                json!(target.permission_sets)
            };
            let body = json!({ "moduleId": target.id, "perms": perms });
            if let Err(e) = invoke_system(
                discovery,
                invoker,
                tenant_id,
                &provider,
                TENANT_PERMISSIONS_INTERFACE,
                HttpMethod::Post,
                "/_/tenantPermissions",
                &body,
            )
            .await
            {
                warn!(
                    tenant = tenant_id,
                    module = %target.id,
                    consumer = %provider.id,
                    error = %e,
                    "permission forwarding failed"
                );
            }
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Checks
// ─────────────────────────────────────────────────────────────────────────────

/// Every `requires` of `md` must be offered by a currently-enabled module
/// or by `md` itself.
fn check_dependencies(
    md: &ModuleDescriptor,
    enabled: &[String],
    registry: &ModuleRegistry,
) -> GatewayResult<()> {
    for req in &md.requires {
        let self_satisfies = md.provides.iter().any(|p| p.is_compatible(req));
        let set_satisfies = enabled
            .iter()
            .filter_map(|m| registry.descriptor(m).ok())
            .any(|other| other.provides.iter().any(|p| p.is_compatible(req)));
        if !self_satisfies && !set_satisfies {
            return Err(GatewayError::Conflict(format!(
                "missing dependency: interface '{}' version '{}'",
                req.id, req.version
            )));
        }
    }
    Ok(())
}

/// No other enabled module may already provide one of `md`'s
/// `proxy`/`system` interfaces.  `multiple` interfaces coexist; `_`-prefixed
/// lifecycle interfaces are gateway-invoked and exempt.
fn check_uniqueness(
    md: &ModuleDescriptor,
    enabled: &[String],
    registry: &ModuleRegistry,
) -> GatewayResult<()> {
    for prov in &md.provides {
        if prov.is_system_lifecycle() || prov.interface_type() == InterfaceType::Multiple {
            continue;
        }
        for other_id in enabled {
            let Ok(other) = registry.descriptor(other_id) else {
                continue;
            };
            if other.id == md.id {
                continue;
            }
            let clash = other.provides.iter().any(|p| {
                p.id == prov.id && p.interface_type() != InterfaceType::Multiple
            });
            if clash {
                return Err(GatewayError::Conflict(format!(
                    "interface '{}' already provided by module '{}'",
                    prov.id, other.id
                )));
            }
        }
    }
    Ok(())
}

/// Every module in `set` must still have all its `requires` met within
/// `set`.  Used to validate disable/upgrade before mutating.
fn check_set_integrity(set: &[String], registry: &ModuleRegistry) -> GatewayResult<()> {
    for id in set {
        let Ok(md) = registry.descriptor(id) else {
            continue;
        };
        check_dependencies(md, set, registry).map_err(|_| {
            GatewayError::Conflict(format!(
                "module '{id}' would lose a required interface"
            ))
        })?;
    }
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// System-interface invocation
// ─────────────────────────────────────────────────────────────────────────────

/// Invoke a system interface on the module that provides it.  The handler
/// path comes from the provider's descriptor, falling back to the
/// conventional default.
#[allow(clippy::too_many_arguments)]
async fn invoke_system(
    discovery: &dyn Discovery,
    invoker: &dyn ModuleInvoker,
    tenant_id: &str,
    provider: &ModuleDescriptor,
    interface_id: &str,
    method: HttpMethod,
    default_path: &str,
    body: &serde_json::Value,
) -> GatewayResult<()> {
    let path = provider
        .system_handler(interface_id, method.as_str())
        .and_then(|h| h.path.clone().or_else(|| h.path_pattern.clone()))
        .unwrap_or_else(|| default_path.to_string());

    let address = discovery.lookup(&provider.id).await?;
    let mut hdrs = HashMap::new();
    hdrs.insert(headers::TENANT.to_string(), tenant_id.to_string());
    hdrs.insert("content-type".to_string(), "application/json".to_string());

    let payload = serde_json::to_vec(body)
        .map_err(|e| GatewayError::Internal(format!("system call payload: {e}")))?;
    let resp: ProxyResponse = invoker
        .invoke(&address, method, &path, &hdrs, &payload)
        .await?;
    if resp.status >= 400 {
        return Err(GatewayError::BadGateway(format!(
            "module '{}' {} call failed with status {}",
            provider.id, interface_id, resp.status
        )));
    }
    Ok(())
}

// =============================================================================
// Tests
// =============================================================================
