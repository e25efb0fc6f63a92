//! `okapi-kernel` — contract types for the multi-tenant module gateway.
//!
//! This crate defines the *data model and trait interfaces* of the gateway
//! core.  No runtime lives here — that belongs in `okapi-gateway`.
//!
//! # Architecture mapping
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │              okapi-kernel  (this crate)                     │
//! │  ModuleDescriptor / InterfaceDescriptor / RoutingEntry      │
//! │  InterfaceVersion + compatibility resolution                │
//! │  ProxyRequest / ProxyResponse / ProxyContext                │
//! │  Discovery + ModuleInvoker traits     GatewayError          │
//! └──────────────────────────┬──────────────────────────────────┘
//!                            │  depends on
//! ┌──────────────────────────▼──────────────────────────────────┐
//! │              okapi-gateway  (runtime crate)                 │
//! │  ModuleRegistry       TenantStore / TenantModuleSet         │
//! │  PipelineBuilder      PipelineExecutor                      │
//! │  InMemoryDiscovery    HttpModuleInvoker  (reqwest)          │
//! │  GatewayServer        (axum HTTP surface)                   │
//! └─────────────────────────────────────────────────────────────┘
//! ```

pub mod collaborator;
pub mod descriptor;
pub mod error;
pub mod types;
pub mod version;

// ── Flat re-exports ────────────────────────────────────────────────────────

pub use collaborator::{Discovery, ModuleInvoker};
pub use descriptor::{
    InterfaceDescriptor, InterfaceType, ModuleDescriptor, Phase, RoutingEntry, RoutingType,
    TenantDescriptor,
};
pub use error::{GatewayError, GatewayResult};
pub use types::{HttpMethod, ProxyContext, ProxyRequest, ProxyResponse, headers};
pub use version::InterfaceVersion;
