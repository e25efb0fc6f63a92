//! External collaborator traits.
//!
//! The core never talks to the network directly: it resolves backend
//! addresses through [`Discovery`] and issues calls through
//! [`ModuleInvoker`].  The runtime crate provides the production
//! implementations; tests supply mocks.

use crate::error::GatewayResult;
use crate::types::{HttpMethod, ProxyResponse};
use async_trait::async_trait;
use std::collections::HashMap;

/// Resolves a module id to a live backend base address.
///
/// Implementations must be `Send + Sync` so they can be shared across
/// Tokio tasks without extra synchronization by the caller.
#[async_trait]
pub trait Discovery: Send + Sync {
    /// Base address (e.g. `http://localhost:9131`) for the module, or
    /// [`GatewayError::NotFound`](crate::error::GatewayError::NotFound)
    /// when no instance is registered.
    async fn lookup(&self, module_id: &str) -> GatewayResult<String>;
}

/// Issues an HTTP-equivalent call to a resolved backend address.
///
/// Used both for regular pipeline steps and for system-interface calls
/// (`_tenant`, `_tenantPermissions`).
#[async_trait]
pub trait ModuleInvoker: Send + Sync {
    async fn invoke(
        &self,
        address: &str,
        method: HttpMethod,
        path: &str,
        headers: &HashMap<String, String>,
        body: &[u8],
    ) -> GatewayResult<ProxyResponse>;
}
